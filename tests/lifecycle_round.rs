// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use eddy::config::Config;
    use eddy::constant::StatusCode;
    use eddy::log_service::LogService;
    use eddy::message::{
        GetReducerFileGroupRequest, MapperEndRequest, RegisterShuffleRequest, ReviveCause,
        ReviveRequest, StageEndRequest, UnregisterShuffleRequest,
    };
    use eddy::mini_cluster::MiniCluster;
    use eddy::rpc::MasterClient;
    use eddy::start_coordinator;
    use std::sync::Arc;
    use std::time::Duration;

    const APP_ID: &str = "app-integration-1";

    #[test]
    fn lifecycle_round_trip_with_embedded_cluster() -> Result<()> {
        let temp_dir = tempdir::TempDir::new("lifecycle_round").unwrap();
        let temp_path = temp_dir.path().to_str().unwrap().to_string();

        let cluster = MiniCluster::with_workers(4);
        let mut config = Config::create_simple_config(APP_ID.to_string());
        config.replicate = true;
        config.remove_shuffle_delay_ms = 300;
        config.log.path = temp_path;
        let _guard = LogService::init(APP_ID, &config.log);

        let master: Arc<dyn MasterClient> = cluster.master.clone();
        let mut coordinator = start_coordinator(config, master, cluster.factory.clone())?;
        let runtime_manager = coordinator.runtime_manager.clone();

        // register
        let registered = runtime_manager.wait(coordinator.endpoint.register_shuffle(
            RegisterShuffleRequest {
                app_id: APP_ID.to_string(),
                shuffle_id: 1,
                num_mappers: 2,
                num_reducers: 8,
            },
        ))?;
        assert_eq!(StatusCode::SUCCESS, registered.status);
        assert_eq!(8, registered.primary_locations.len());

        // one primary dies mid stage, the pair moves and the epoch bumps
        let old_location = registered.primary_locations[1].clone();
        let revived = runtime_manager.wait(coordinator.endpoint.revive(ReviveRequest {
            app_id: APP_ID.to_string(),
            shuffle_id: 1,
            map_id: 0,
            attempt_id: 0,
            partition_id: old_location.partition_id,
            epoch: old_location.epoch,
            old_location: Some(old_location.clone()),
            cause: ReviveCause::PRIMARY_PUSH_FAILURE,
        }))?;
        assert_eq!(StatusCode::SUCCESS, revived.status);
        let new_location = revived.location.unwrap();
        assert_eq!(1, new_location.epoch);
        assert_ne!(old_location.worker, new_location.worker);

        // both mappers end, the barrier commits
        for map_id in 0..2 {
            let ended = runtime_manager.wait(coordinator.endpoint.mapper_end(
                MapperEndRequest {
                    app_id: APP_ID.to_string(),
                    shuffle_id: 1,
                    map_id,
                    attempt_id: 0,
                    num_mappers: 2,
                },
            ))?;
            assert_eq!(StatusCode::SUCCESS, ended.status);
        }

        // an explicit stage end on top of the mapper-driven one is a no-op
        runtime_manager.wait(coordinator.endpoint.stage_end(StageEndRequest {
            app_id: APP_ID.to_string(),
            shuffle_id: 1,
        }))?;

        let groups = runtime_manager.wait(coordinator.endpoint.get_reducer_file_group(
            GetReducerFileGroupRequest {
                app_id: APP_ID.to_string(),
                shuffle_id: 1,
            },
        ))?;
        assert_eq!(StatusCode::SUCCESS, groups.status);
        assert_eq!(8, groups.file_groups.len());
        for (partition_id, group) in groups.file_groups.iter().enumerate() {
            assert!(
                !group.is_empty(),
                "partition {} has no published location",
                partition_id
            );
        }
        // the revived partition serves its replacement split as well
        let replaced = &groups.file_groups[old_location.partition_id as usize];
        assert!(replaced.iter().any(|location| location.epoch == 1));
        assert_eq!(vec![0, 0], groups.mapper_attempts);

        // unregister and wait for the sweeper to forget everything
        runtime_manager.wait(coordinator.endpoint.unregister_shuffle(
            UnregisterShuffleRequest {
                app_id: APP_ID.to_string(),
                shuffle_id: 1,
            },
        ))?;
        std::thread::sleep(Duration::from_millis(1200));
        assert!(coordinator.manager.registry.get(1).is_none());
        assert_eq!(vec![1], cluster.master.unregistered_shuffles());

        coordinator.stop();
        Ok(())
    }
}
