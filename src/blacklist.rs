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

use crate::config::Config;
use crate::message::GetBlacklistRequest;
use crate::meta::WorkerInfo;
use crate::metric::GAUGE_BLACKLISTED_WORKER_NUMBER;
use crate::rpc::MasterClient;
use crate::runtime::manager::RuntimeManager;
use await_tree::InstrumentAwait;
use dashmap::DashSet;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy)]
pub enum BlacklistReason {
    CONNECT_FAILED,
    RESERVE_FAILED,
    COMMIT_FAILED,
    PRIMARY_PUSH_FAILED,
}

pub type BlacklistRef = Arc<Blacklist>;

/// Workers the coordinator will not hand out for new allocations: the union
/// of locally observed failures and the master-published blacklist. Local
/// observations are provisional until the next refresh; workers whose
/// endpoint never came up stick until the master stops listing them.
#[derive(Default)]
pub struct Blacklist {
    workers: DashSet<WorkerInfo>,
    shutdown_workers: DashSet<WorkerInfo>,
}

impl Blacklist {
    pub fn new() -> BlacklistRef {
        Arc::new(Default::default())
    }

    pub fn add(&self, worker: WorkerInfo, reason: BlacklistReason) {
        warn!("Blacklisting worker:[{}]. reason: {:?}", &worker, reason);
        if let BlacklistReason::CONNECT_FAILED = reason {
            self.shutdown_workers.insert(worker.clone());
        }
        self.workers.insert(worker);
        GAUGE_BLACKLISTED_WORKER_NUMBER.set(self.workers.len() as i64);
    }

    pub fn contains(&self, worker: &WorkerInfo) -> bool {
        self.workers.contains(worker)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers.iter().map(|w| w.key().clone()).collect()
    }

    /// Candidates with every blacklisted worker removed.
    pub fn exclude_from(&self, candidates: Vec<WorkerInfo>) -> Vec<WorkerInfo> {
        candidates
            .into_iter()
            .filter(|worker| !self.contains(worker))
            .collect()
    }

    /// Replaces the set with what the master published, keeping the workers
    /// observed dead-on-arrival on this side. A worker re-enters rotation
    /// only once the master no longer lists it.
    pub fn reset_from_master(&self, blacklisted: Vec<WorkerInfo>, unknown: Vec<WorkerInfo>) {
        self.workers.clear();
        for worker in self.shutdown_workers.iter() {
            self.workers.insert(worker.key().clone());
        }
        for worker in blacklisted.into_iter().chain(unknown.into_iter()) {
            self.workers.insert(worker);
        }
        GAUGE_BLACKLISTED_WORKER_NUMBER.set(self.workers.len() as i64);
    }
}

pub struct BlacklistService;

impl BlacklistService {
    pub fn run(
        config: &Config,
        runtime_manager: &RuntimeManager,
        master: Arc<dyn MasterClient>,
        blacklist: BlacklistRef,
    ) -> JoinHandle<()> {
        let refresh_interval = config.get_blacklist_delay_ms;
        info!(
            "Starting blacklist refresher. interval: {}ms",
            refresh_interval
        );
        runtime_manager
            .default_runtime
            .spawn_with_await_tree("Blacklist refresher", async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(refresh_interval))
                        .instrument_await("sleeping")
                        .await;

                    let request = GetBlacklistRequest {
                        local_blacklist: blacklist.snapshot(),
                    };
                    match master.get_blacklist(request).await {
                        Ok(response) => {
                            blacklist
                                .reset_from_master(response.blacklist, response.unknown_workers);
                        }
                        Err(err) => {
                            // best-effort, next tick retries
                            warn!("Errors on refreshing blacklist from master. err: {:?}", err);
                        }
                    }
                }
            })
    }
}
