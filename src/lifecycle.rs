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

use crate::allocator::{allocate, PartitionRequest};
use crate::blacklist::{BlacklistReason, BlacklistRef};
use crate::config::{Config, PartitionType};
use crate::constant::{StatusCode, STAGE_END_POLL_INTERVAL_MS};
use crate::error::CoordinatorError;
use crate::message::{
    ChangeLocationResponse, CheckQuotaRequest, CommitFilesRequest, GetReducerFileGroupRequest,
    GetReducerFileGroupResponse, MapperEndRequest, MapperEndResponse, RegisterShuffleRequest,
    RegisterShuffleResponse, ReleaseSlotsRequest, RequestSlotsRequest, RequestSlotsResponse,
    ReviveCause, ReviveRequest, PartitionSplitRequest, UnregisterShuffleRequest,
};
use crate::meta::{PartitionLocation, PartitionLocationInfo, WorkerInfo};
use crate::metric::{
    COMMIT_FILES_DURATION, TOTAL_COMMITTED_BYTES, TOTAL_COMMIT_FILES_FAILED,
    TOTAL_DATA_LOST_SHUFFLE, TOTAL_EXPIRED_SHUFFLE, TOTAL_REGISTER_FAILED, TOTAL_REVIVE_REQUEST,
    TOTAL_SHUFFLE_REGISTERED,
};
use crate::reservation::ReservationManager;
use crate::rpc::{MasterClient, WorkerEndpointResolverRef};
use crate::runtime::manager::RuntimeManager;
use crate::state::{ChangeAttempt, RegistrationOutcome, ShuffleRegistry, ShuffleStateRef, StageEndState};
use crate::util::{coordinator_host, now_timestamp_as_millis};
use await_tree::InstrumentAwait;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy)]
struct StageEndEvent {
    shuffle_id: i32,
}

struct ChangePartitionContext {
    partition_id: i32,
    old_epoch: i32,
    old_location: Option<PartitionLocation>,
    cause: Option<ReviveCause>,
}

pub type LifecycleManagerRef = Arc<LifecycleManager>;

/// The per-application control plane: owns all shuffle state and drives
/// registration, partition replacement, the stage-end commit barrier and
/// expiration against the master and the worker fleet.
pub struct LifecycleManager {
    pub app_id: String,
    config: Config,
    coordinator_host: String,

    pub registry: ShuffleRegistry,
    reservation: ReservationManager,
    pub blacklist: BlacklistRef,
    master: Arc<dyn MasterClient>,
    resolver: WorkerEndpointResolverRef,

    // single-flight gate of the stage-end barrier
    in_progress_stage_ends: DashSet<i32>,
    unregister_time: DashMap<i32, u128>,

    stage_end_sender: async_channel::Sender<StageEndEvent>,
    stage_end_receiver: async_channel::Receiver<StageEndEvent>,

    quota_checked: AtomicBool,

    // stage-end commit totals, reported by the application heartbeat
    total_written_bytes: AtomicU64,
    total_file_count: AtomicU64,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LifecycleManager {
    pub fn get_ref(
        config: Config,
        runtime_manager: &RuntimeManager,
        master: Arc<dyn MasterClient>,
        resolver: WorkerEndpointResolverRef,
        blacklist: BlacklistRef,
    ) -> LifecycleManagerRef {
        let (sender, receiver) = async_channel::unbounded();
        let host = coordinator_host();

        let manager = Arc::new(LifecycleManager {
            app_id: config.app_id.clone(),
            coordinator_host: host,
            registry: ShuffleRegistry::new(),
            reservation: ReservationManager::new(
                &config,
                master.clone(),
                resolver.clone(),
                blacklist.clone(),
            ),
            blacklist,
            master,
            resolver,
            in_progress_stage_ends: DashSet::new(),
            unregister_time: DashMap::new(),
            stage_end_sender: sender,
            stage_end_receiver: receiver,
            quota_checked: AtomicBool::new(false),
            total_written_bytes: AtomicU64::new(0),
            total_file_count: AtomicU64::new(0),
            handles: Mutex::new(vec![]),
            config,
        });

        let stage_end_handler = manager.clone();
        let handle = runtime_manager.default_runtime.spawn_with_await_tree(
            "Stage end handler",
            async move {
                info!("Starting stage end handler...");
                while let Ok(event) = stage_end_handler
                    .stage_end_receiver
                    .recv()
                    .instrument_await("waiting for stage end events...")
                    .await
                {
                    stage_end_handler.handle_stage_end(event.shuffle_id).await;
                }
            },
        );
        manager.handles.lock().push(handle);

        let expiration_checker = manager.clone();
        let expire_interval = expiration_checker.config.remove_shuffle_delay_ms;
        let handle = runtime_manager.default_runtime.spawn_with_await_tree(
            "Shuffle expiration checker",
            async move {
                info!("Starting shuffle expiration checker...");
                loop {
                    tokio::time::sleep(Duration::from_millis(expire_interval))
                        .instrument_await("sleeping")
                        .await;
                    expiration_checker.expire_unregistered_shuffles().await;
                }
            },
        );
        manager.handles.lock().push(handle);

        manager
    }

    pub fn stop(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn total_written_bytes(&self) -> u64 {
        self.total_written_bytes.load(SeqCst)
    }

    pub fn total_file_count(&self) -> u64 {
        self.total_file_count.load(SeqCst)
    }

    fn fan_out_parallelism(&self, tasks: usize) -> usize {
        std::cmp::min(std::cmp::max(1, tasks), self.config.rpc_max_parallelism)
    }

    // ==================== registration ====================

    pub async fn register_shuffle(
        &self,
        request: RegisterShuffleRequest,
    ) -> RegisterShuffleResponse {
        let shuffle_id = request.shuffle_id;
        let state = self
            .registry
            .get_or_create(shuffle_id, self.config.partition_type);

        match self.registry.begin_registration(shuffle_id, &state) {
            RegistrationOutcome::AlreadyRegistered(primaries) => {
                info!(
                    "Shuffle:[{}] is already registered, replaying {} initial primaries",
                    shuffle_id,
                    primaries.len()
                );
                RegisterShuffleResponse {
                    status: StatusCode::SUCCESS,
                    primary_locations: primaries,
                }
            }
            RegistrationOutcome::Pending(receiver) => receiver
                .await
                .unwrap_or_else(|_| RegisterShuffleResponse::of(StatusCode::FAILED)),
            RegistrationOutcome::FirstRequester => {
                let response = self.do_register(&request, &state).await;
                if response.status.is_success() {
                    TOTAL_SHUFFLE_REGISTERED.inc();
                } else {
                    TOTAL_REGISTER_FAILED.inc();
                }
                self.registry.complete_registration(shuffle_id, &response);
                response
            }
        }
    }

    async fn do_register(
        &self,
        request: &RegisterShuffleRequest,
        state: &ShuffleStateRef,
    ) -> RegisterShuffleResponse {
        let shuffle_id = request.shuffle_id;
        if !self.ensure_quota().await {
            return RegisterShuffleResponse::of(StatusCode::SLOT_NOT_AVAILABLE);
        }

        let num_partitions = match self.config.partition_type {
            PartitionType::REDUCE_PARTITION => request.num_reducers,
            PartitionType::MAP_PARTITION => request.num_mappers,
        };
        let slots_request = RequestSlotsRequest {
            app_id: self.app_id.clone(),
            shuffle_id,
            partition_ids: (0..num_partitions as i32).collect(),
            coordinator_host: self.coordinator_host.clone(),
            replicate: self.config.replicate,
            user_identifier: self.config.user_identifier.clone(),
        };
        let slots_response = match self.request_slots_with_retry(slots_request).await {
            Ok(response) => response,
            Err(err) => {
                error!(
                    "Errors on requesting slots of shuffle:[{}] from master. err: {:?}",
                    shuffle_id, err
                );
                return RegisterShuffleResponse::of(StatusCode::FAILED);
            }
        };
        match slots_response.status {
            StatusCode::SUCCESS => {}
            StatusCode::SLOT_NOT_AVAILABLE => {
                warn!("Master has no slots for shuffle:[{}]", shuffle_id);
                return RegisterShuffleResponse::of(StatusCode::SLOT_NOT_AVAILABLE);
            }
            status => {
                warn!(
                    "Master rejected slot request of shuffle:[{}]. status: {:?}",
                    shuffle_id, status
                );
                return RegisterShuffleResponse::of(StatusCode::FAILED);
            }
        }
        let mut slots = slots_response.worker_resource;
        if slots.is_empty() {
            return RegisterShuffleResponse::of(StatusCode::SLOT_NOT_AVAILABLE);
        }

        // Dead-on-arrival workers fall out of the candidate set here; their
        // reservations fail below and get re-placed by the retry loop.
        let candidates = self.resolve_endpoints(&slots.workers()).await;

        if !self
            .reservation
            .reserve_slots_with_retry(shuffle_id, &candidates, &mut slots)
            .await
        {
            self.release_all_slots(shuffle_id).await;
            return RegisterShuffleResponse::of(StatusCode::RESERVE_SLOTS_FAILED);
        }

        state.set_partition_counts(request.num_mappers, request.num_reducers);
        for (worker, (primaries, replicas)) in slots.iter() {
            let info = state.location_info(worker);
            info.add_primaries(primaries.clone());
            info.add_replicas(replicas.clone());
        }
        let mut primaries = slots.all_primaries();
        primaries.sort_by_key(|location| location.partition_id);
        for location in &primaries {
            state.update_latest_location(location.clone());
        }
        state.init_mapper_attempts(request.num_mappers);
        // sized by the larger id space so MapPartition ids always fit
        state.init_reducer_file_groups(std::cmp::max(request.num_mappers, request.num_reducers));
        state.set_initial_primaries(primaries.clone());
        state.mark_registered();

        info!(
            "Registered shuffle:[{}]. mappers: {}, reducers: {}, workers: {}, replicate: {}",
            shuffle_id,
            request.num_mappers,
            request.num_reducers,
            slots.len(),
            self.config.replicate
        );
        RegisterShuffleResponse {
            status: StatusCode::SUCCESS,
            primary_locations: primaries,
        }
    }

    /// Exactly one additional attempt on a non-success reply, per the
    /// master's ha client contract.
    async fn request_slots_with_retry(
        &self,
        request: RequestSlotsRequest,
    ) -> Result<RequestSlotsResponse, CoordinatorError> {
        match self.master.request_slots(request.clone()).await {
            Ok(response) if response.status.is_success() => return Ok(response),
            Ok(response) => {
                warn!(
                    "Master replied {:?} on slot request of shuffle:[{}], retrying once",
                    response.status, request.shuffle_id
                );
            }
            Err(err) => {
                warn!(
                    "Errors on slot request of shuffle:[{}], retrying once. err: {:?}",
                    request.shuffle_id, err
                );
            }
        }
        self.master
            .request_slots(request)
            .await
            .map_err(|err| CoordinatorError::MASTER_RPC_FAILED(err.to_string()))
    }

    async fn ensure_quota(&self) -> bool {
        if self.quota_checked.load(SeqCst) {
            return true;
        }
        let request = CheckQuotaRequest {
            user_identifier: self.config.user_identifier.clone(),
        };
        match self.master.check_quota(request).await {
            Ok(response) if response.available => {
                self.quota_checked.store(true, SeqCst);
                true
            }
            Ok(_) => {
                warn!(
                    "Quota of user:[{}] is exhausted, rejecting registration",
                    self.config.user_identifier
                );
                false
            }
            Err(err) => {
                // quota is advisory, an unreachable master must not block
                warn!("Errors on checking quota, skipping. err: {:?}", err);
                true
            }
        }
    }

    async fn resolve_endpoints(&self, workers: &[WorkerInfo]) -> Vec<WorkerInfo> {
        let resolves = workers.iter().map(|worker| async move {
            match self.resolver.get(worker).await {
                Ok(_) => Some(worker.clone()),
                Err(_) => None,
            }
        });
        join_all(resolves).await.into_iter().flatten().collect()
    }

    // ==================== partition change ====================

    pub async fn revive(&self, request: ReviveRequest) -> ChangeLocationResponse {
        TOTAL_REVIVE_REQUEST.inc();
        let Some(state) = self.registry.get(request.shuffle_id) else {
            return ChangeLocationResponse::of(StatusCode::SHUFFLE_NOT_REGISTERED);
        };
        if !state.is_registered() {
            return ChangeLocationResponse::of(StatusCode::SHUFFLE_NOT_REGISTERED);
        }
        // a revive from an already-ended mapper is stale by definition
        if state.mapper_ended(request.map_id) {
            return ChangeLocationResponse::of(StatusCode::MAP_ENDED);
        }
        let context = ChangePartitionContext {
            partition_id: request.partition_id,
            old_epoch: request.epoch,
            old_location: request.old_location,
            cause: Some(request.cause),
        };
        self.change_partition(&state, context).await
    }

    pub async fn partition_split(&self, request: PartitionSplitRequest) -> ChangeLocationResponse {
        TOTAL_REVIVE_REQUEST.inc();
        let Some(state) = self.registry.get(request.shuffle_id) else {
            return ChangeLocationResponse::of(StatusCode::SHUFFLE_NOT_REGISTERED);
        };
        if !state.is_registered() {
            return ChangeLocationResponse::of(StatusCode::SHUFFLE_NOT_REGISTERED);
        }
        let context = ChangePartitionContext {
            partition_id: request.partition_id,
            old_epoch: request.epoch,
            old_location: Some(request.old_location),
            cause: None,
        };
        self.change_partition(&state, context).await
    }

    async fn change_partition(
        &self,
        state: &ShuffleStateRef,
        context: ChangePartitionContext,
    ) -> ChangeLocationResponse {
        // concurrent requesters of one partition coalesce behind the leader
        match state.begin_change(context.partition_id) {
            ChangeAttempt::Follower(receiver) => {
                return receiver
                    .await
                    .unwrap_or_else(|_| ChangeLocationResponse::of(StatusCode::FAILED))
            }
            ChangeAttempt::Leader => {}
        }
        let response = self.do_change_partition(state, &context).await;
        state.finish_change(context.partition_id, &response);
        response
    }

    async fn do_change_partition(
        &self,
        state: &ShuffleStateRef,
        context: &ChangePartitionContext,
    ) -> ChangeLocationResponse {
        let shuffle_id = state.shuffle_id;

        // fast path: somebody already produced a newer epoch
        if let Some(latest) = state.latest_location(context.partition_id) {
            if latest.epoch > context.old_epoch {
                return ChangeLocationResponse {
                    status: StatusCode::SUCCESS,
                    location: Some(latest),
                };
            }
        }

        if context.cause == Some(ReviveCause::PRIMARY_PUSH_FAILURE) {
            if let Some(old_location) = &context.old_location {
                self.blacklist.add(
                    old_location.worker.clone(),
                    BlacklistReason::PRIMARY_PUSH_FAILED,
                );
            }
        }

        let candidates = self.blacklist.exclude_from(state.candidate_workers());
        let required = if self.config.replicate { 2 } else { 1 };
        if candidates.len() < required {
            warn!(
                "No candidates left to re-place partition:[{}] of shuffle:[{}]",
                context.partition_id, shuffle_id
            );
            return ChangeLocationResponse::of(StatusCode::SLOT_NOT_AVAILABLE);
        }

        let request = match &context.old_location {
            Some(old_location) => {
                PartitionRequest::renewal(old_location.partition_id, old_location.epoch)
            }
            None => PartitionRequest::renewal(context.partition_id, context.old_epoch),
        };
        let mut slots = match allocate(&candidates, &[request], self.config.replicate) {
            Ok(resource) => resource,
            Err(_) => return ChangeLocationResponse::of(StatusCode::SLOT_NOT_AVAILABLE),
        };
        if !self
            .reservation
            .reserve_slots_with_retry(shuffle_id, &candidates, &mut slots)
            .await
        {
            return ChangeLocationResponse::of(StatusCode::RESERVE_SLOTS_FAILED);
        }

        for (worker, (primaries, replicas)) in slots.iter() {
            let info = state.location_info(worker);
            info.add_primaries(primaries.clone());
            info.add_replicas(replicas.clone());
        }
        for location in slots.all_primaries() {
            state.update_latest_location(location);
        }

        // Reserve may have re-placed the pair, so pick whatever survived; a
        // lone replica still carries a usable primary handle in its peer.
        let new_primary = slots
            .all_primaries()
            .into_iter()
            .find(|location| location.partition_id == request.partition_id)
            .or_else(|| {
                slots
                    .all_replicas()
                    .into_iter()
                    .find(|location| location.partition_id == request.partition_id)
                    .and_then(|replica| replica.peer_location())
            });
        match new_primary {
            Some(location) => {
                info!(
                    "Re-placed partition:[{}] of shuffle:[{}] to epoch {} on worker:[{}]",
                    location.partition_id, shuffle_id, location.epoch, location.worker
                );
                ChangeLocationResponse {
                    status: StatusCode::SUCCESS,
                    location: Some(location),
                }
            }
            None => ChangeLocationResponse::of(StatusCode::FAILED),
        }
    }

    // ==================== mapper & stage end ====================

    pub async fn mapper_end(&self, request: MapperEndRequest) -> MapperEndResponse {
        let state = self
            .registry
            .get_or_create(request.shuffle_id, self.config.partition_type);
        state.init_mapper_attempts(request.num_mappers);
        match state.record_mapper_end(request.map_id, request.attempt_id) {
            None => MapperEndResponse {
                status: StatusCode::FAILED,
            },
            Some(all_ended) => {
                if all_ended {
                    self.trigger_stage_end(request.shuffle_id).await;
                }
                MapperEndResponse {
                    status: StatusCode::SUCCESS,
                }
            }
        }
    }

    pub async fn trigger_stage_end(&self, shuffle_id: i32) {
        if self
            .stage_end_sender
            .send(StageEndEvent { shuffle_id })
            .await
            .is_err()
        {
            error!(
                "Errors on enqueueing stage end of shuffle:[{}], handler is gone",
                shuffle_id
            );
        }
    }

    /// The stage-end barrier: fans `CommitFiles` out to every allocated
    /// worker, gathers the per-worker verdicts, decides data loss and
    /// publishes the reducer file groups. Runs at most once per shuffle.
    pub async fn handle_stage_end(&self, shuffle_id: i32) {
        let state = match self.registry.get(shuffle_id) {
            Some(state) => state,
            None => {
                // unknown shuffle still ends, so reducers are not parked
                let state = self
                    .registry
                    .get_or_create(shuffle_id, self.config.partition_type);
                state.set_stage_end(StageEndState::DONE_SUCCESS);
                return;
            }
        };
        if !state.is_registered() {
            state.set_stage_end(StageEndState::DONE_SUCCESS);
            return;
        }
        if state.stage_end().is_done() {
            return;
        }
        if !self.in_progress_stage_ends.insert(shuffle_id) {
            return;
        }
        state.set_stage_end(StageEndState::IN_PROGRESS);
        let timer = COMMIT_FILES_DURATION.start_timer();

        let mapper_attempts = state.mapper_attempts_snapshot();
        let participants: Vec<(WorkerInfo, Arc<PartitionLocationInfo>)> = state
            .allocated_workers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.fan_out_parallelism(participants.len())));
        let commits = participants.iter().map(|(worker, info)| {
            let semaphore = semaphore.clone();
            let worker = worker.clone();
            let primary_ids = info.primary_unique_ids();
            let replica_ids = info.replica_unique_ids();
            let request = CommitFilesRequest {
                app_id: self.app_id.clone(),
                shuffle_id,
                primary_ids: primary_ids.clone(),
                replica_ids: replica_ids.clone(),
                mapper_attempts: mapper_attempts.clone(),
            };
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (worker, primary_ids, replica_ids, None);
                };
                let client = match self.resolver.get(&worker).await {
                    Ok(client) => client,
                    Err(_) => return (worker, primary_ids, replica_ids, None),
                };
                match client.commit_files(request).await {
                    Ok(response) => (worker, primary_ids, replica_ids, Some(response)),
                    Err(err) => {
                        warn!(
                            "Errors on committing files of shuffle:[{}] on worker:[{}]. err: {:?}",
                            shuffle_id, worker, err
                        );
                        (worker, primary_ids, replica_ids, None)
                    }
                }
            }
        });
        let results = join_all(commits).await;

        let mut committed_primaries: HashMap<String, PartitionLocation> = HashMap::new();
        let mut committed_replicas: HashMap<String, PartitionLocation> = HashMap::new();
        let mut failed_primary_ids: HashSet<String> = HashSet::new();
        let mut failed_replica_ids: HashSet<String> = HashSet::new();
        let mut total_written = 0u64;
        let mut file_count = 0u64;
        for (worker, primary_ids, replica_ids, result) in results {
            let info = state.location_info(&worker);
            let Some(response) = result else {
                // the whole worker is out, both sides of everything it held
                // count as failed
                self.blacklist
                    .add(worker.clone(), BlacklistReason::COMMIT_FAILED);
                TOTAL_COMMIT_FILES_FAILED.inc();
                failed_primary_ids.extend(primary_ids);
                failed_replica_ids.extend(replica_ids);
                continue;
            };
            if !response.status.is_success() {
                self.blacklist
                    .add(worker.clone(), BlacklistReason::COMMIT_FAILED);
                TOTAL_COMMIT_FILES_FAILED.inc();
            }
            for unique_id in response.committed_primary_ids {
                if let Some(mut location) = info.get_primary(&unique_id) {
                    location.storage_info = response
                        .committed_primary_storage_infos
                        .get(&unique_id)
                        .cloned();
                    location.committed_map_ids = response
                        .committed_map_id_bitmap
                        .get(&unique_id)
                        .cloned()
                        .unwrap_or_default();
                    committed_primaries.insert(unique_id, location);
                }
            }
            for unique_id in response.committed_replica_ids {
                if let Some(mut location) = info.get_replica(&unique_id) {
                    location.storage_info = response
                        .committed_replica_storage_infos
                        .get(&unique_id)
                        .cloned();
                    location.committed_map_ids = response
                        .committed_map_id_bitmap
                        .get(&unique_id)
                        .cloned()
                        .unwrap_or_default();
                    committed_replicas.insert(unique_id, location);
                }
            }
            failed_primary_ids.extend(response.failed_primary_ids);
            failed_replica_ids.extend(response.failed_replica_ids);
            total_written += response.total_written;
            file_count += response.file_count;
        }
        self.total_written_bytes.fetch_add(total_written, SeqCst);
        self.total_file_count.fetch_add(file_count, SeqCst);
        TOTAL_COMMITTED_BYTES.inc_by(total_written);

        // every worker-side slot of this shuffle is settled now
        for (_, info) in &participants {
            let _ = info.remove_all();
        }
        state.allocated_workers.clear();
        self.release_all_slots(shuffle_id).await;

        let data_lost = if !self.config.replicate {
            !failed_primary_ids.is_empty()
        } else {
            failed_primary_ids
                .iter()
                .any(|unique_id| failed_replica_ids.contains(unique_id))
        };

        if data_lost {
            TOTAL_DATA_LOST_SHUFFLE.inc();
            warn!(
                "Shuffle:[{}] lost data. failed primaries: {}, failed replicas: {}",
                shuffle_id,
                failed_primary_ids.len(),
                failed_replica_ids.len()
            );
        } else {
            for location in committed_primaries.values() {
                if location.storage_info.is_some() {
                    state.add_to_file_group(location.clone());
                }
            }
            for (unique_id, replica) in &committed_replicas {
                let primary_published = committed_primaries
                    .get(unique_id)
                    .map(|primary| primary.storage_info.is_some())
                    .unwrap_or(false);
                if primary_published {
                    state.wire_file_group_peer(replica);
                } else {
                    // only the replica made it, reducers read that one
                    state.add_to_file_group(replica.clone());
                }
            }
        }

        state.set_stage_end(if data_lost {
            StageEndState::DONE_DATA_LOST
        } else {
            StageEndState::DONE_SUCCESS
        });
        self.in_progress_stage_ends.remove(&shuffle_id);
        timer.observe_duration();
        info!(
            "Stage end of shuffle:[{}] is done. data lost: {}, committed bytes: {}",
            shuffle_id, data_lost, total_written
        );
    }

    // ==================== reducers ====================

    pub async fn get_reducer_file_group(
        &self,
        request: GetReducerFileGroupRequest,
    ) -> GetReducerFileGroupResponse {
        let deadline = now_timestamp_as_millis() + self.config.stage_end_timeout_ms as u128;
        let state = loop {
            if let Some(state) = self.registry.get(request.shuffle_id) {
                if state.stage_end().is_done() {
                    break state;
                }
            }
            if now_timestamp_as_millis() >= deadline {
                return GetReducerFileGroupResponse::of(StatusCode::STAGE_END_TIMEOUT);
            }
            tokio::time::sleep(Duration::from_millis(STAGE_END_POLL_INTERVAL_MS)).await;
        };

        match state.stage_end() {
            StageEndState::DONE_DATA_LOST => {
                GetReducerFileGroupResponse::of(StatusCode::SHUFFLE_DATA_LOST)
            }
            _ => GetReducerFileGroupResponse {
                status: StatusCode::SUCCESS,
                file_groups: state.reducer_file_groups_snapshot(),
                mapper_attempts: state.mapper_attempts_snapshot(),
            },
        }
    }

    // ==================== unregister & expiration ====================

    pub async fn unregister_shuffle(&self, request: UnregisterShuffleRequest) {
        let shuffle_id = request.shuffle_id;
        if let Some(state) = self.registry.get(shuffle_id) {
            if state.is_registered() && !state.stage_end().is_done() {
                self.trigger_stage_end(shuffle_id).await;
                let deadline =
                    now_timestamp_as_millis() + self.config.stage_end_timeout_ms as u128;
                while !state.stage_end().is_done() {
                    if now_timestamp_as_millis() >= deadline {
                        warn!(
                            "Stage end of shuffle:[{}] exceeded the timeout, unregistering anyway",
                            shuffle_id
                        );
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(STAGE_END_POLL_INTERVAL_MS)).await;
                }
            }

            // leftovers exist when the stage end never completed
            let leftovers: Vec<WorkerInfo> = state
                .allocated_workers
                .iter()
                .filter(|entry| !entry.value().is_empty())
                .map(|entry| entry.key().clone())
                .collect();
            if !leftovers.is_empty() {
                for worker in leftovers {
                    if let Some((_, info)) = state.allocated_workers.remove(&worker) {
                        let _ = info.remove_all();
                    }
                }
                state.allocated_workers.clear();
                self.release_all_slots(shuffle_id).await;
            }
        }
        self.unregister_time
            .insert(shuffle_id, now_timestamp_as_millis());
        info!("Unregistered shuffle:[{}]", shuffle_id);
    }

    /// Drops every shuffle whose unregister happened more than the removal
    /// delay ago and tells the master to forget it.
    pub async fn expire_unregistered_shuffles(&self) {
        let delay = self.config.remove_shuffle_delay_ms as u128;
        let now = now_timestamp_as_millis();
        let expired: Vec<i32> = self
            .unregister_time
            .iter()
            .filter(|entry| now.saturating_sub(*entry.value()) >= delay)
            .map(|entry| *entry.key())
            .collect();
        for shuffle_id in expired {
            info!("Expiring shuffle:[{}] after unregister delay", shuffle_id);
            self.unregister_time.remove(&shuffle_id);
            self.in_progress_stage_ends.remove(&shuffle_id);
            let _ = self.registry.remove(shuffle_id);
            TOTAL_EXPIRED_SHUFFLE.inc();
            let request = UnregisterShuffleRequest {
                app_id: self.app_id.clone(),
                shuffle_id,
            };
            if let Err(err) = self.master.unregister_shuffle(request).await {
                warn!(
                    "Errors on unregistering shuffle:[{}] at master. err: {:?}",
                    shuffle_id, err
                );
            }
        }
    }

    async fn release_all_slots(&self, shuffle_id: i32) {
        let request = ReleaseSlotsRequest::all(&self.app_id, shuffle_id);
        if let Err(err) = self.master.release_slots(request).await {
            warn!(
                "Errors on releasing slots of shuffle:[{}] at master. err: {:?}",
                shuffle_id, err
            );
        }
    }
}
