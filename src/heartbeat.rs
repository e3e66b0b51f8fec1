use crate::config::Config;
use crate::lifecycle::LifecycleManagerRef;
use crate::message::ApplicationHeartbeatRequest;
use crate::rpc::MasterClient;
use crate::runtime::manager::RuntimeManager;
use await_tree::InstrumentAwait;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct HeartbeatTask;

impl HeartbeatTask {
    pub fn run(
        config: &Config,
        runtime_manager: &RuntimeManager,
        manager: &LifecycleManagerRef,
        master: Arc<dyn MasterClient>,
    ) -> JoinHandle<()> {
        let app_id = config.app_id.clone();
        let interval_ms = config.application_heartbeat_interval_ms;
        let manager = manager.clone();
        info!(
            "Starting application heartbeat task. app_id: {}, interval: {}ms",
            &app_id, interval_ms
        );

        runtime_manager.default_runtime.spawn_with_await_tree(
            "Application heartbeat task",
            async move {
                let mut epoch: u64 = 0;
                loop {
                    tokio::time::sleep(Duration::from_millis(interval_ms))
                        .instrument_await("sleeping")
                        .await;

                    epoch += 1;
                    let heartbeat_request = ApplicationHeartbeatRequest {
                        app_id: app_id.clone(),
                        total_written_bytes: manager.total_written_bytes(),
                        file_count: manager.total_file_count(),
                        epoch,
                    };
                    if let Err(err) = master.heartbeat_from_application(heartbeat_request).await {
                        error!(
                            "Errors on heartbeat of app:[{}] with master. err: {:?}",
                            &app_id, err
                        );
                    }
                }
            },
        )
    }
}

#[cfg(test)]
mod test {
    use crate::blacklist::Blacklist;
    use crate::config::Config;
    use crate::heartbeat::HeartbeatTask;
    use crate::lifecycle::LifecycleManager;
    use crate::mini_cluster::MiniCluster;
    use crate::rpc::{MasterClient, WorkerEndpointResolver};
    use crate::runtime::manager::RuntimeManager;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn heartbeat_reports_epoch_test() {
        let cluster = MiniCluster::with_workers(1);
        let mut config = Config::create_simple_config("app-heartbeat".to_string());
        config.application_heartbeat_interval_ms = 50;

        let runtime_manager: RuntimeManager = Default::default();
        let blacklist = Blacklist::new();
        let resolver = WorkerEndpointResolver::new(cluster.factory.clone(), blacklist.clone());
        let master: Arc<dyn MasterClient> = cluster.master.clone();
        let manager = LifecycleManager::get_ref(
            config.clone(),
            &runtime_manager,
            master.clone(),
            resolver,
            blacklist,
        );

        let handle = HeartbeatTask::run(&config, &runtime_manager, &manager, master);
        std::thread::sleep(Duration::from_millis(400));
        handle.abort();

        assert!(cluster.master.heartbeat_count() >= 2);
        let last = cluster.master.last_heartbeat().unwrap();
        assert_eq!("app-heartbeat", last.app_id);
        assert!(last.epoch >= 2);
    }
}
