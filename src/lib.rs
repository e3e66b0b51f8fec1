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

//! `eddy` is the per-application lifecycle coordinator of a remote shuffle
//! service: it acquires worker slots from the cluster master, places primary
//! and replica partition locations, replaces failed partitions mid stage,
//! drives the stage-end commit barrier and expires state after unregister.
//! Transport is pluggable through the `rpc` traits; the crate itself is
//! embedded into the application driver.

#![allow(dead_code)]

pub mod allocator;
pub mod blacklist;
pub mod config;
pub mod constant;
pub mod endpoint;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod log_service;
pub mod message;
pub mod meta;
pub mod metric;
pub mod mini_cluster;
pub mod reservation;
pub mod rpc;
pub mod runtime;
pub mod state;
pub mod util;

use crate::blacklist::{Blacklist, BlacklistService};
use crate::config::Config;
use crate::endpoint::CoordinatorEndpoint;
use crate::heartbeat::HeartbeatTask;
use crate::lifecycle::{LifecycleManager, LifecycleManagerRef};
use crate::metric::MetricService;
use crate::rpc::{MasterClient, WorkerClientFactory, WorkerEndpointResolver};
use crate::runtime::manager::RuntimeManager;
use anyhow::Result;
use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running coordinator: the endpoint accepting task requests, the manager
/// behind it and the background loops (stage end, expiration, blacklist
/// refresh, application heartbeat).
pub struct Coordinator {
    pub manager: LifecycleManagerRef,
    pub endpoint: CoordinatorEndpoint,
    pub runtime_manager: RuntimeManager,
    handles: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        self.endpoint.stop();
        self.manager.stop();
    }
}

/// The entrypoint to wire a coordinator for one application. The caller
/// brings the transport: a master client and a factory dialing workers.
pub fn start_coordinator(
    config: Config,
    master: Arc<dyn MasterClient>,
    worker_client_factory: Arc<dyn WorkerClientFactory>,
) -> Result<Coordinator> {
    info!(
        "Eddy coordinator is built on the git commit hash: {}. app_id: {}, meta service port: {}",
        env!("GIT_COMMIT_HASH"),
        &config.app_id,
        config.driver_meta_service_port
    );
    let runtime_manager = RuntimeManager::from(config.runtime_config.clone());
    MetricService::init();

    let blacklist = Blacklist::new();
    let resolver = WorkerEndpointResolver::new(worker_client_factory, blacklist.clone());
    let manager = LifecycleManager::get_ref(
        config.clone(),
        &runtime_manager,
        master.clone(),
        resolver,
        blacklist.clone(),
    );

    let blacklist_handle =
        BlacklistService::run(&config, &runtime_manager, master.clone(), blacklist);
    let heartbeat_handle = HeartbeatTask::run(&config, &runtime_manager, &manager, master);
    let endpoint = CoordinatorEndpoint::start(&manager, &runtime_manager);

    Ok(Coordinator {
        manager,
        endpoint,
        runtime_manager,
        handles: vec![blacklist_handle, heartbeat_handle],
    })
}
