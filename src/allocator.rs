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

use crate::error::CoordinatorError;
use crate::meta::{PartitionLocation, PartitionMode, WorkerInfo, WorkerResource};
use rand::Rng;

/// One partition slot to place: a fresh partition carries `old_epoch = -1`,
/// a replacement carries the epoch being superseded. The allocation always
/// bumps to `old_epoch + 1`.
#[derive(Debug, Clone, Copy)]
pub struct PartitionRequest {
    pub partition_id: i32,
    pub old_epoch: i32,
}

impl PartitionRequest {
    pub fn fresh(partition_id: i32) -> Self {
        PartitionRequest {
            partition_id,
            old_epoch: -1,
        }
    }

    pub fn renewal(partition_id: i32, old_epoch: i32) -> Self {
        PartitionRequest {
            partition_id,
            old_epoch,
        }
    }
}

/// Places every requested partition on a uniformly random candidate; with
/// replication the replica lands on the next candidate (mod the candidate
/// count) and both sides carry the mutual peer link. Randomness is load
/// distribution across retries, there is no tie-break.
///
/// Callers must have excluded blacklisted workers from `candidates`.
pub fn allocate(
    candidates: &[WorkerInfo],
    requests: &[PartitionRequest],
    replicate: bool,
) -> Result<WorkerResource, CoordinatorError> {
    let required = if replicate { 2 } else { 1 };
    if candidates.len() < required {
        return Err(CoordinatorError::INSUFFICIENT_CANDIDATES(
            required,
            candidates.len(),
        ));
    }

    let mut rng = rand::thread_rng();
    let mut resource = WorkerResource::new();
    for request in requests {
        let epoch = request.old_epoch + 1;
        let master_idx = rng.gen_range(0..candidates.len());
        let primary_worker = &candidates[master_idx];
        let mut primary = PartitionLocation::new(
            request.partition_id,
            epoch,
            primary_worker.clone(),
            PartitionMode::PRIMARY,
        );

        if replicate {
            let replica_worker = &candidates[(master_idx + 1) % candidates.len()];
            let mut replica = PartitionLocation::new(
                request.partition_id,
                epoch,
                replica_worker.clone(),
                PartitionMode::REPLICA,
            );
            primary.set_peer(&replica);
            replica.set_peer(&primary);
            resource.add_replica(replica_worker, replica);
        }

        resource.add_primary(primary_worker, primary);
    }

    Ok(resource)
}

#[cfg(test)]
mod test {
    use crate::allocator::{allocate, PartitionRequest};
    use crate::error::CoordinatorError;
    use crate::meta::{PartitionMode, WorkerInfo};

    fn mock_workers(n: usize) -> Vec<WorkerInfo> {
        (0..n)
            .map(|idx| WorkerInfo::new(format!("10.0.0.{}", idx), 9097, 9098, 9099, 9100))
            .collect()
    }

    #[test]
    fn insufficient_candidates_test() {
        let requests = vec![PartitionRequest::fresh(0)];

        match allocate(&[], &requests, false) {
            Err(CoordinatorError::INSUFFICIENT_CANDIDATES(1, 0)) => {}
            _ => panic!(),
        }

        // replication needs two distinct workers
        match allocate(&mock_workers(1), &requests, true) {
            Err(CoordinatorError::INSUFFICIENT_CANDIDATES(2, 1)) => {}
            _ => panic!(),
        }
    }

    #[test]
    fn epoch_bump_test() {
        let workers = mock_workers(3);
        let resource = allocate(&workers, &[PartitionRequest::renewal(7, 4)], false).unwrap();
        let primaries = resource.all_primaries();
        assert_eq!(1, primaries.len());
        assert_eq!(7, primaries[0].partition_id);
        assert_eq!(5, primaries[0].epoch);
        assert!(resource.all_replicas().is_empty());
    }

    #[test]
    fn replica_pair_invariant_test() {
        let workers = mock_workers(3);
        let requests: Vec<_> = (0..16).map(PartitionRequest::fresh).collect();

        // run a few rounds since placement is random
        for _ in 0..32 {
            let resource = allocate(&workers, &requests, true).unwrap();
            let primaries = resource.all_primaries();
            let replicas = resource.all_replicas();
            assert_eq!(requests.len(), primaries.len());
            assert_eq!(requests.len(), replicas.len());

            for primary in &primaries {
                assert_eq!(PartitionMode::PRIMARY, primary.mode);
                let peer = primary.peer_location().unwrap();
                assert_eq!(PartitionMode::REPLICA, peer.mode);
                assert_eq!(primary.partition_id, peer.partition_id);
                assert_eq!(primary.epoch, peer.epoch);
                assert_ne!(primary.worker, peer.worker);

                // the replica points straight back
                let replica = replicas
                    .iter()
                    .find(|r| r.partition_id == primary.partition_id)
                    .unwrap();
                let replica_peer = replica.peer_location().unwrap();
                assert_eq!(*primary, replica_peer);
            }
        }
    }

    #[test]
    fn two_candidate_replication_test() {
        let workers = mock_workers(2);
        let resource = allocate(&workers, &[PartitionRequest::fresh(0)], true).unwrap();
        let primary = &resource.all_primaries()[0];
        let replica = &resource.all_replicas()[0];
        assert_ne!(primary.worker, replica.worker);
    }
}
