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

//! An in-process master and worker fleet implementing the outbound RPC
//! traits, with failure injection. This is the embedded stand-in used by the
//! test suites and by local single-process setups; a real deployment plugs
//! transport-backed clients in instead.

use crate::allocator::{allocate, PartitionRequest};
use crate::constant::StatusCode;
use crate::message::{
    ApplicationHeartbeatRequest, CheckQuotaRequest, CheckQuotaResponse, CommitFilesRequest,
    CommitFilesResponse, DestroyRequest, DestroyResponse, GetBlacklistRequest,
    GetBlacklistResponse, ReleaseSlotsRequest, ReleaseSlotsResponse, RequestSlotsRequest,
    RequestSlotsResponse, ReserveSlotsRequest, ReserveSlotsResponse, UnregisterShuffleRequest,
};
use crate::meta::{
    PartitionLocation, StorageInfo, StorageType, WorkerInfo, WorkerResource,
};
use crate::rpc::{MasterClient, WorkerClient, WorkerClientFactory};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::Arc;

// =========================================================

#[derive(Default)]
pub struct MiniMaster {
    workers: Mutex<Vec<WorkerInfo>>,
    blacklisted: DashSet<WorkerInfo>,

    /// Fails the next n `RequestSlots` calls.
    pub request_slots_failures: AtomicUsize,
    pub quota_available: AtomicBool,

    pub request_slots_calls: AtomicUsize,
    released: Mutex<Vec<ReleaseSlotsRequest>>,
    unregistered: Mutex<Vec<i32>>,
    heartbeats: Mutex<Vec<ApplicationHeartbeatRequest>>,
}

impl MiniMaster {
    pub fn new(workers: Vec<WorkerInfo>) -> Arc<Self> {
        let master = MiniMaster {
            workers: Mutex::new(workers),
            quota_available: AtomicBool::new(true),
            ..Default::default()
        };
        Arc::new(master)
    }

    pub fn publish_blacklisted(&self, worker: WorkerInfo) {
        self.blacklisted.insert(worker);
    }

    pub fn released_requests(&self) -> Vec<ReleaseSlotsRequest> {
        self.released.lock().clone()
    }

    pub fn unregistered_shuffles(&self) -> Vec<i32> {
        self.unregistered.lock().clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().len()
    }

    pub fn last_heartbeat(&self) -> Option<ApplicationHeartbeatRequest> {
        self.heartbeats.lock().last().cloned()
    }
}

#[async_trait]
impl MasterClient for MiniMaster {
    async fn request_slots(&self, request: RequestSlotsRequest) -> Result<RequestSlotsResponse> {
        self.request_slots_calls.fetch_add(1, SeqCst);
        if self
            .request_slots_failures
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(RequestSlotsResponse {
                status: StatusCode::FAILED,
                worker_resource: WorkerResource::new(),
            });
        }

        let candidates: Vec<WorkerInfo> = self
            .workers
            .lock()
            .iter()
            .filter(|worker| !self.blacklisted.contains(*worker))
            .cloned()
            .collect();
        let requests: Vec<PartitionRequest> = request
            .partition_ids
            .iter()
            .map(|id| PartitionRequest::fresh(*id))
            .collect();

        match allocate(&candidates, &requests, request.replicate) {
            Ok(resource) => Ok(RequestSlotsResponse {
                status: StatusCode::SUCCESS,
                worker_resource: resource,
            }),
            Err(_) => Ok(RequestSlotsResponse {
                status: StatusCode::SLOT_NOT_AVAILABLE,
                worker_resource: WorkerResource::new(),
            }),
        }
    }

    async fn release_slots(&self, request: ReleaseSlotsRequest) -> Result<ReleaseSlotsResponse> {
        self.released.lock().push(request);
        Ok(ReleaseSlotsResponse {
            status: StatusCode::SUCCESS,
        })
    }

    async fn get_blacklist(&self, _request: GetBlacklistRequest) -> Result<GetBlacklistResponse> {
        Ok(GetBlacklistResponse {
            status: StatusCode::SUCCESS,
            blacklist: self.blacklisted.iter().map(|w| w.key().clone()).collect(),
            unknown_workers: vec![],
        })
    }

    async fn unregister_shuffle(&self, request: UnregisterShuffleRequest) -> Result<()> {
        self.unregistered.lock().push(request.shuffle_id);
        Ok(())
    }

    async fn heartbeat_from_application(
        &self,
        request: ApplicationHeartbeatRequest,
    ) -> Result<()> {
        self.heartbeats.lock().push(request);
        Ok(())
    }

    async fn check_quota(&self, _request: CheckQuotaRequest) -> Result<CheckQuotaResponse> {
        Ok(CheckQuotaResponse {
            available: self.quota_available.load(SeqCst),
        })
    }
}

// =========================================================

#[derive(Default)]
struct ReservedSlots {
    primaries: HashMap<String, PartitionLocation>,
    replicas: HashMap<String, PartitionLocation>,
}

pub struct MiniWorker {
    pub info: WorkerInfo,

    /// Refuses endpoint creation while set.
    pub unreachable: AtomicBool,
    /// Fails the next n `ReserveSlots` calls.
    pub reserve_failures: AtomicUsize,
    /// Stalls `CommitFiles` replies, to exercise bounded stage-end waits.
    pub commit_delay_ms: AtomicU64,
    /// Unique ids this worker will report as failed at commit time.
    commit_failed_primary_ids: Mutex<HashSet<String>>,
    commit_failed_replica_ids: Mutex<HashSet<String>>,

    pub reserve_calls: AtomicUsize,
    pub commit_calls: AtomicUsize,
    pub destroy_calls: AtomicUsize,

    // key: shuffle key
    reserved: DashMap<String, ReservedSlots>,
}

impl MiniWorker {
    pub fn new(info: WorkerInfo) -> Arc<Self> {
        Arc::new(MiniWorker {
            info,
            unreachable: AtomicBool::new(false),
            reserve_failures: AtomicUsize::new(0),
            commit_delay_ms: AtomicU64::new(0),
            commit_failed_primary_ids: Mutex::new(HashSet::new()),
            commit_failed_replica_ids: Mutex::new(HashSet::new()),
            reserve_calls: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            reserved: DashMap::new(),
        })
    }

    pub fn fail_commit_of_primary(&self, unique_id: &str) {
        self.commit_failed_primary_ids
            .lock()
            .insert(unique_id.to_string());
    }

    pub fn fail_commit_of_replica(&self, unique_id: &str) {
        self.commit_failed_replica_ids
            .lock()
            .insert(unique_id.to_string());
    }

    pub fn reserved_primary_ids(&self, shuffle_key: &str) -> Vec<String> {
        self.reserved
            .get(shuffle_key)
            .map(|slots| slots.primaries.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn reserved_replica_ids(&self, shuffle_key: &str) -> Vec<String> {
        self.reserved
            .get(shuffle_key)
            .map(|slots| slots.replicas.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn holds_nothing(&self, shuffle_key: &str) -> bool {
        self.reserved
            .get(shuffle_key)
            .map(|slots| slots.primaries.is_empty() && slots.replicas.is_empty())
            .unwrap_or(true)
    }

    fn storage_info(&self) -> StorageInfo {
        StorageInfo {
            storage_type: StorageType::LOCALFILE,
            mount_point: format!("/data/{}", self.info.host),
        }
    }
}

#[async_trait]
impl WorkerClient for MiniWorker {
    async fn reserve_slots(&self, request: ReserveSlotsRequest) -> Result<ReserveSlotsResponse> {
        self.reserve_calls.fetch_add(1, SeqCst);
        if self
            .reserve_failures
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(ReserveSlotsResponse {
                status: StatusCode::FAILED,
                msg: "no buffer".to_string(),
            });
        }

        let key = crate::util::shuffle_key(&request.app_id, request.shuffle_id);
        let mut slots = self.reserved.entry(key).or_default();
        for location in request.primary_locations {
            slots.primaries.insert(location.unique_id(), location);
        }
        for location in request.replica_locations {
            slots.replicas.insert(location.unique_id(), location);
        }
        Ok(ReserveSlotsResponse::of(StatusCode::SUCCESS))
    }

    async fn commit_files(&self, request: CommitFilesRequest) -> Result<CommitFilesResponse> {
        self.commit_calls.fetch_add(1, SeqCst);
        let delay = self.commit_delay_ms.load(SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let failed_primaries = self.commit_failed_primary_ids.lock().clone();
        let failed_replicas = self.commit_failed_replica_ids.lock().clone();

        let committed_map_ids: Vec<i32> = request
            .mapper_attempts
            .iter()
            .enumerate()
            .filter(|(_, attempt)| **attempt >= 0)
            .map(|(map_id, _)| map_id as i32)
            .collect();

        let mut response = CommitFilesResponse::of(StatusCode::SUCCESS);
        for unique_id in request.primary_ids {
            if failed_primaries.contains(&unique_id) {
                response.failed_primary_ids.push(unique_id);
            } else {
                response
                    .committed_primary_storage_infos
                    .insert(unique_id.clone(), self.storage_info());
                response
                    .committed_map_id_bitmap
                    .insert(unique_id.clone(), committed_map_ids.clone());
                response.committed_primary_ids.push(unique_id);
                response.total_written += 1024;
                response.file_count += 1;
            }
        }
        for unique_id in request.replica_ids {
            if failed_replicas.contains(&unique_id) {
                response.failed_replica_ids.push(unique_id);
            } else {
                response
                    .committed_replica_storage_infos
                    .insert(unique_id.clone(), self.storage_info());
                response
                    .committed_map_id_bitmap
                    .entry(unique_id.clone())
                    .or_insert_with(|| committed_map_ids.clone());
                response.committed_replica_ids.push(unique_id);
                response.total_written += 1024;
                response.file_count += 1;
            }
        }

        if !response.failed_primary_ids.is_empty() || !response.failed_replica_ids.is_empty() {
            response.status = StatusCode::PARTIAL_SUCCESS;
        }

        // commit settles every slot of the shuffle, committed or not
        let key = crate::util::shuffle_key(&request.app_id, request.shuffle_id);
        self.reserved.remove(&key);
        Ok(response)
    }

    async fn destroy(&self, request: DestroyRequest) -> Result<DestroyResponse> {
        self.destroy_calls.fetch_add(1, SeqCst);
        if let Some(mut slots) = self.reserved.get_mut(&request.shuffle_key) {
            for unique_id in &request.primary_unique_ids {
                slots.primaries.remove(unique_id);
            }
            for unique_id in &request.replica_unique_ids {
                slots.replicas.remove(unique_id);
            }
        }
        Ok(DestroyResponse {
            status: StatusCode::SUCCESS,
            failed_primary_ids: vec![],
            failed_replica_ids: vec![],
        })
    }
}

// =========================================================

pub struct MiniWorkerFactory {
    workers: HashMap<WorkerInfo, Arc<MiniWorker>>,
}

#[async_trait]
impl WorkerClientFactory for MiniWorkerFactory {
    async fn create(&self, worker: &WorkerInfo) -> Result<Arc<dyn WorkerClient>> {
        let mini_worker = self
            .workers
            .get(worker)
            .ok_or_else(|| anyhow!("unknown worker: {}", worker))?;
        if mini_worker.unreachable.load(SeqCst) {
            return Err(anyhow!("connection refused: {}", worker));
        }
        Ok(mini_worker.clone())
    }
}

/// A single-process fleet: one master, n workers, one factory.
pub struct MiniCluster {
    pub master: Arc<MiniMaster>,
    pub workers: Vec<Arc<MiniWorker>>,
    pub factory: Arc<MiniWorkerFactory>,
}

impl MiniCluster {
    pub fn with_workers(n: usize) -> Self {
        let infos: Vec<WorkerInfo> = (0..n)
            .map(|idx| WorkerInfo::new(format!("10.0.0.{}", idx + 1), 9097, 9098, 9099, 9100))
            .collect();
        let workers: Vec<Arc<MiniWorker>> =
            infos.iter().map(|info| MiniWorker::new(info.clone())).collect();
        let factory = Arc::new(MiniWorkerFactory {
            workers: infos
                .iter()
                .cloned()
                .zip(workers.iter().cloned())
                .collect(),
        });
        let master = MiniMaster::new(infos);
        MiniCluster {
            master,
            workers,
            factory,
        }
    }

    pub fn worker_of(&self, location_worker: &WorkerInfo) -> Arc<MiniWorker> {
        self.workers
            .iter()
            .find(|worker| &worker.info == location_worker)
            .expect("worker should exist")
            .clone()
    }
}
