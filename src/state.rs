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

use crate::config::PartitionType;
use crate::constant::OPEN_ATTEMPT;
use crate::message::{ChangeLocationResponse, RegisterShuffleResponse};
use crate::meta::{PartitionLocation, PartitionLocationInfo, WorkerInfo};
use crate::metric::GAUGE_SHUFFLE_NUMBER;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Arc;
use tokio::sync::oneshot;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEndState {
    NONE,
    IN_PROGRESS,
    DONE_SUCCESS,
    DONE_DATA_LOST,
}

impl StageEndState {
    pub fn is_done(&self) -> bool {
        matches!(self, StageEndState::DONE_SUCCESS | StageEndState::DONE_DATA_LOST)
    }
}

pub type ShuffleStateRef = Arc<ShuffleState>;

/// Everything the coordinator tracks for one shuffle. Fields are either
/// concurrent maps or sit behind this shuffle's inner locks; nothing here is
/// guarded by a global lock.
pub struct ShuffleState {
    pub shuffle_id: i32,
    pub partition_type: PartitionType,

    registered: AtomicBool,
    num_mappers: AtomicUsize,
    num_reducers: AtomicUsize,

    // -1 marks a mapper that has not ended; write-once per slot
    mapper_attempts: Mutex<Vec<i64>>,

    pub allocated_workers: DashMap<WorkerInfo, Arc<PartitionLocationInfo>>,

    // partition id -> the highest-epoch primary
    latest_locations: DashMap<i32, PartitionLocation>,

    // partition id -> reply handles coalesced behind the leading requester
    pending_change_requests: DashMap<i32, Arc<Mutex<Vec<oneshot::Sender<ChangeLocationResponse>>>>>,

    // the epoch-0 primaries, replayed to duplicate registrations
    initial_primaries: RwLock<Vec<PartitionLocation>>,

    reducer_file_groups: RwLock<Vec<Vec<PartitionLocation>>>,

    stage_end: RwLock<StageEndState>,
}

/// Outcome of joining the in-flight change of one partition.
pub enum ChangeAttempt {
    Leader,
    Follower(oneshot::Receiver<ChangeLocationResponse>),
}

impl ShuffleState {
    pub fn new(shuffle_id: i32, partition_type: PartitionType) -> ShuffleStateRef {
        Arc::new(ShuffleState {
            shuffle_id,
            partition_type,
            registered: AtomicBool::new(false),
            num_mappers: AtomicUsize::new(0),
            num_reducers: AtomicUsize::new(0),
            mapper_attempts: Mutex::new(vec![]),
            allocated_workers: DashMap::new(),
            latest_locations: DashMap::new(),
            pending_change_requests: DashMap::new(),
            initial_primaries: RwLock::new(vec![]),
            reducer_file_groups: RwLock::new(vec![]),
            stage_end: RwLock::new(StageEndState::NONE),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(SeqCst)
    }

    pub fn mark_registered(&self) {
        self.registered.store(true, SeqCst);
    }

    pub fn num_mappers(&self) -> usize {
        self.num_mappers.load(SeqCst)
    }

    pub fn num_reducers(&self) -> usize {
        self.num_reducers.load(SeqCst)
    }

    pub fn set_partition_counts(&self, num_mappers: usize, num_reducers: usize) {
        self.num_mappers.store(num_mappers, SeqCst);
        self.num_reducers.store(num_reducers, SeqCst);
    }

    // ==================== mapper attempts ====================

    /// Fills the attempt table when it does not exist yet. Later callers
    /// with a different mapper count lose; the table is sized exactly once.
    pub fn init_mapper_attempts(&self, num_mappers: usize) {
        let mut attempts = self.mapper_attempts.lock();
        if attempts.is_empty() && num_mappers > 0 {
            *attempts = vec![OPEN_ATTEMPT; num_mappers];
            self.num_mappers.store(num_mappers, SeqCst);
        }
    }

    /// Records the end of one mapper attempt, first writer wins. Returns
    /// whether every mapper has ended after this call, or `None` when
    /// `map_id` does not fit the table.
    pub fn record_mapper_end(&self, map_id: i32, attempt_id: i64) -> Option<bool> {
        let mut attempts = self.mapper_attempts.lock();
        let slot = attempts.get_mut(map_id as usize)?;
        if *slot < 0 {
            *slot = attempt_id;
        }
        Some(attempts.iter().all(|attempt| *attempt >= 0))
    }

    pub fn mapper_ended(&self, map_id: i32) -> bool {
        let attempts = self.mapper_attempts.lock();
        attempts
            .get(map_id as usize)
            .map(|attempt| *attempt >= 0)
            .unwrap_or(false)
    }

    pub fn mapper_attempts_snapshot(&self) -> Vec<i64> {
        self.mapper_attempts.lock().clone()
    }

    // ==================== locations ====================

    pub fn location_info(&self, worker: &WorkerInfo) -> Arc<PartitionLocationInfo> {
        self.allocated_workers
            .entry(worker.clone())
            .or_insert_with(|| Arc::new(PartitionLocationInfo::new()))
            .value()
            .clone()
    }

    pub fn candidate_workers(&self) -> Vec<WorkerInfo> {
        self.allocated_workers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn latest_location(&self, partition_id: i32) -> Option<PartitionLocation> {
        self.latest_locations
            .get(&partition_id)
            .map(|l| l.value().clone())
    }

    /// Keeps `latest_locations` at the maximum epoch seen per partition.
    pub fn update_latest_location(&self, location: PartitionLocation) {
        match self.latest_locations.entry(location.partition_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().epoch < location.epoch {
                    entry.insert(location);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(location);
            }
        }
    }

    pub fn set_initial_primaries(&self, primaries: Vec<PartitionLocation>) {
        *self.initial_primaries.write() = primaries;
    }

    pub fn initial_primaries(&self) -> Vec<PartitionLocation> {
        self.initial_primaries.read().clone()
    }

    // ==================== partition change coalescing ====================

    pub fn begin_change(&self, partition_id: i32) -> ChangeAttempt {
        match self.pending_change_requests.entry(partition_id) {
            Entry::Occupied(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.get().lock().push(tx);
                ChangeAttempt::Follower(rx)
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(vec![])));
                ChangeAttempt::Leader
            }
        }
    }

    /// The leader drains every coalesced requester with the terminal reply.
    pub fn finish_change(&self, partition_id: i32, response: &ChangeLocationResponse) {
        if let Some((_, pending)) = self.pending_change_requests.remove(&partition_id) {
            let senders: Vec<_> = pending.lock().drain(..).collect();
            for sender in senders {
                let _ = sender.send(response.clone());
            }
        }
    }

    // ==================== stage end ====================

    pub fn stage_end(&self) -> StageEndState {
        *self.stage_end.read()
    }

    pub fn set_stage_end(&self, state: StageEndState) {
        *self.stage_end.write() = state;
    }

    pub fn init_reducer_file_groups(&self, groups: usize) {
        *self.reducer_file_groups.write() = vec![vec![]; groups];
    }

    pub fn add_to_file_group(&self, location: PartitionLocation) {
        let mut groups = self.reducer_file_groups.write();
        let idx = location.partition_id as usize;
        if idx >= groups.len() {
            groups.resize(idx + 1, vec![]);
        }
        groups[idx].push(location);
    }

    /// Replaces the published primary's peer in place, used when the replica
    /// counterpart also committed.
    pub fn wire_file_group_peer(&self, replica: &PartitionLocation) -> bool {
        let mut groups = self.reducer_file_groups.write();
        let idx = replica.partition_id as usize;
        if let Some(group) = groups.get_mut(idx) {
            for published in group.iter_mut() {
                if published.is_primary() && published.epoch == replica.epoch {
                    published.set_peer(replica);
                    return true;
                }
            }
        }
        false
    }

    pub fn reducer_file_groups_snapshot(&self) -> Vec<Vec<PartitionLocation>> {
        self.reducer_file_groups.read().clone()
    }
}

// =========================================================

struct RegisteringMeta {
    in_flight: bool,
    waiters: Vec<oneshot::Sender<RegisterShuffleResponse>>,
}

/// Outcome of `begin_registration`.
pub enum RegistrationOutcome {
    /// This caller owns the allocation and must call `complete_registration`.
    FirstRequester,
    /// Somebody else is allocating; the receiver yields their terminal reply.
    Pending(oneshot::Receiver<RegisterShuffleResponse>),
    /// Registration finished earlier; the epoch-0 primaries are replayed.
    AlreadyRegistered(Vec<PartitionLocation>),
}

/// Owner of all per-shuffle state, and the single-flight gate over shuffle
/// registration: per shuffle at most one allocation is in flight, everybody
/// else parks and receives the same terminal response.
#[derive(Default)]
pub struct ShuffleRegistry {
    shuffles: DashMap<i32, ShuffleStateRef>,
    registering: DashMap<i32, Arc<Mutex<RegisteringMeta>>>,
}

impl ShuffleRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, shuffle_id: i32) -> Option<ShuffleStateRef> {
        self.shuffles.get(&shuffle_id).map(|s| s.value().clone())
    }

    pub fn get_or_create(
        &self,
        shuffle_id: i32,
        partition_type: PartitionType,
    ) -> ShuffleStateRef {
        self.shuffles
            .entry(shuffle_id)
            .or_insert_with(|| {
                GAUGE_SHUFFLE_NUMBER.inc();
                ShuffleState::new(shuffle_id, partition_type)
            })
            .value()
            .clone()
    }

    pub fn remove(&self, shuffle_id: i32) -> Option<ShuffleStateRef> {
        self.registering.remove(&shuffle_id);
        self.shuffles.remove(&shuffle_id).map(|(_, state)| {
            GAUGE_SHUFFLE_NUMBER.dec();
            state
        })
    }

    pub fn shuffle_ids(&self) -> Vec<i32> {
        self.shuffles.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.shuffles.len()
    }

    pub fn begin_registration(
        &self,
        shuffle_id: i32,
        state: &ShuffleStateRef,
    ) -> RegistrationOutcome {
        let meta = self
            .registering
            .entry(shuffle_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(RegisteringMeta {
                    in_flight: false,
                    waiters: vec![],
                }))
            })
            .value()
            .clone();

        let mut guard = meta.lock();
        if state.is_registered() {
            return RegistrationOutcome::AlreadyRegistered(state.initial_primaries());
        }
        if guard.in_flight {
            let (tx, rx) = oneshot::channel();
            guard.waiters.push(tx);
            RegistrationOutcome::Pending(rx)
        } else {
            guard.in_flight = true;
            RegistrationOutcome::FirstRequester
        }
    }

    pub fn complete_registration(&self, shuffle_id: i32, response: &RegisterShuffleResponse) {
        if let Some(meta) = self.registering.get(&shuffle_id).map(|m| m.value().clone()) {
            let waiters: Vec<_> = {
                let mut guard = meta.lock();
                guard.in_flight = false;
                guard.waiters.drain(..).collect()
            };
            for waiter in waiters {
                let _ = waiter.send(response.clone());
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::config::PartitionType;
    use crate::constant::StatusCode;
    use crate::message::RegisterShuffleResponse;
    use crate::meta::{PartitionLocation, PartitionMode, WorkerInfo};
    use crate::state::{
        ChangeAttempt, RegistrationOutcome, ShuffleRegistry, ShuffleState, StageEndState,
    };

    fn mock_location(partition_id: i32, epoch: i32) -> PartitionLocation {
        PartitionLocation::new(
            partition_id,
            epoch,
            WorkerInfo::new("10.0.0.1", 9097, 9098, 9099, 9100),
            PartitionMode::PRIMARY,
        )
    }

    #[test]
    fn mapper_attempts_write_once_test() {
        let state = ShuffleState::new(1, PartitionType::REDUCE_PARTITION);
        state.init_mapper_attempts(2);
        // double init keeps the table
        state.init_mapper_attempts(8);
        assert_eq!(2, state.mapper_attempts_snapshot().len());

        assert_eq!(Some(false), state.record_mapper_end(0, 3));
        assert!(state.mapper_ended(0));
        // a speculative attempt does not overwrite
        assert_eq!(Some(false), state.record_mapper_end(0, 9));
        assert_eq!(3, state.mapper_attempts_snapshot()[0]);

        assert_eq!(Some(true), state.record_mapper_end(1, 0));
        assert_eq!(None, state.record_mapper_end(5, 0));
    }

    #[test]
    fn partition_counts_test() {
        let state = ShuffleState::new(1, PartitionType::REDUCE_PARTITION);
        assert!(!state.is_registered());
        state.set_partition_counts(4, 8);
        state.mark_registered();
        assert!(state.is_registered());
        assert_eq!(4, state.num_mappers());
        assert_eq!(8, state.num_reducers());
    }

    #[test]
    fn latest_location_monotone_test() {
        let state = ShuffleState::new(1, PartitionType::REDUCE_PARTITION);
        state.update_latest_location(mock_location(3, 1));
        // a stale epoch never goes back in
        state.update_latest_location(mock_location(3, 0));
        assert_eq!(1, state.latest_location(3).unwrap().epoch);

        state.update_latest_location(mock_location(3, 2));
        assert_eq!(2, state.latest_location(3).unwrap().epoch);
        assert!(state.latest_location(4).is_none());
    }

    #[test]
    fn stage_end_state_test() {
        let state = ShuffleState::new(1, PartitionType::REDUCE_PARTITION);
        assert_eq!(StageEndState::NONE, state.stage_end());
        assert!(!state.stage_end().is_done());
        state.set_stage_end(StageEndState::DONE_DATA_LOST);
        assert!(state.stage_end().is_done());
    }

    #[test]
    fn change_coalescing_test() {
        let state = ShuffleState::new(1, PartitionType::REDUCE_PARTITION);
        assert!(matches!(state.begin_change(3), ChangeAttempt::Leader));
        let follower = match state.begin_change(3) {
            ChangeAttempt::Follower(rx) => rx,
            _ => panic!(),
        };
        // an unrelated partition elects its own leader
        assert!(matches!(state.begin_change(4), ChangeAttempt::Leader));

        let response = crate::message::ChangeLocationResponse {
            status: StatusCode::SUCCESS,
            location: Some(mock_location(3, 1)),
        };
        state.finish_change(3, &response);
        let received = follower.blocking_recv().unwrap();
        assert_eq!(StatusCode::SUCCESS, received.status);

        // the pending set is gone, the next requester leads again
        assert!(matches!(state.begin_change(3), ChangeAttempt::Leader));
    }

    #[test]
    fn registration_single_flight_test() {
        let registry = ShuffleRegistry::new();
        let state = registry.get_or_create(1, PartitionType::REDUCE_PARTITION);

        assert!(matches!(
            registry.begin_registration(1, &state),
            RegistrationOutcome::FirstRequester
        ));
        let pending = match registry.begin_registration(1, &state) {
            RegistrationOutcome::Pending(rx) => rx,
            _ => panic!(),
        };

        let response = RegisterShuffleResponse {
            status: StatusCode::SUCCESS,
            primary_locations: vec![mock_location(0, 0)],
        };
        state.set_initial_primaries(response.primary_locations.clone());
        state.mark_registered();
        registry.complete_registration(1, &response);

        let received = pending.blocking_recv().unwrap();
        assert_eq!(StatusCode::SUCCESS, received.status);
        assert_eq!(1, received.primary_locations.len());

        // once registered, duplicates replay the same primaries
        match registry.begin_registration(1, &state) {
            RegistrationOutcome::AlreadyRegistered(primaries) => {
                assert_eq!(response.primary_locations, primaries)
            }
            _ => panic!(),
        }
    }

    #[test]
    fn registry_remove_test() {
        let registry = ShuffleRegistry::new();
        let _ = registry.get_or_create(1, PartitionType::REDUCE_PARTITION);
        let _ = registry.get_or_create(2, PartitionType::REDUCE_PARTITION);
        assert_eq!(2, registry.len());

        assert!(registry.remove(1).is_some());
        assert!(registry.get(1).is_none());
        assert!(registry.remove(1).is_none());
        assert_eq!(vec![2], registry.shuffle_ids());
    }
}
