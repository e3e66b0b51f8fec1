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
use crate::config::{Config, PartitionType, SplitMode};
use crate::message::{DestroyRequest, ReleaseSlotsRequest, ReserveSlotsRequest};
use crate::meta::{PartitionMode, WorkerInfo, WorkerResource};
use crate::metric::{TOTAL_RESERVE_FAILED, TOTAL_RESERVE_RETRY};
use crate::rpc::{MasterClient, WorkerEndpointResolverRef};
use crate::util::shuffle_key;
use futures::future::join_all;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Drives the reserve fan-out against the workers of a computed allocation,
/// with surgery and re-allocation on partial failure. The worker-side buffer
/// is only considered held once this returns true.
pub struct ReservationManager {
    app_id: String,
    user_identifier: String,
    replicate: bool,
    split_threshold: u64,
    split_mode: SplitMode,
    partition_type: PartitionType,
    range_read_filter: bool,
    max_retry: u32,
    retry_wait_ms: u64,
    rpc_max_parallelism: usize,

    master: Arc<dyn MasterClient>,
    resolver: WorkerEndpointResolverRef,
    blacklist: BlacklistRef,
}

impl ReservationManager {
    pub fn new(
        config: &Config,
        master: Arc<dyn MasterClient>,
        resolver: WorkerEndpointResolverRef,
        blacklist: BlacklistRef,
    ) -> Self {
        ReservationManager {
            app_id: config.app_id.clone(),
            user_identifier: config.user_identifier.clone(),
            replicate: config.replicate,
            split_threshold: config.partition_split_threshold,
            split_mode: config.split_mode,
            partition_type: config.partition_type,
            range_read_filter: config.range_read_filter,
            max_retry: config.reserve_slots_max_retry,
            retry_wait_ms: config.reserve_slots_retry_wait_ms,
            rpc_max_parallelism: config.rpc_max_parallelism,
            master,
            resolver,
            blacklist,
        }
    }

    fn fan_out_parallelism(&self, tasks: usize) -> usize {
        std::cmp::min(std::cmp::max(1, tasks), self.rpc_max_parallelism)
    }

    /// Reserves every slot of `slots`. On success, each originally requested
    /// partition holds a primary (plus its replica under replication)
    /// somewhere in `slots`; on terminal failure everything still reserved
    /// is destroyed and false comes back.
    pub async fn reserve_slots_with_retry(
        &self,
        shuffle_id: i32,
        candidates: &[WorkerInfo],
        slots: &mut WorkerResource,
    ) -> bool {
        let mut to_reserve = slots.clone();
        let mut round = 0;
        loop {
            let failed_workers = self.reserve_round(shuffle_id, &to_reserve).await;
            if failed_workers.is_empty() {
                return true;
            }
            round += 1;

            // Surgery: every location of a failed worker is a victim, and
            // under replication so is its surviving peer, since a lone
            // replica only leaks the peer worker's buffer.
            let mut victim_epochs: HashMap<i32, i32> = HashMap::new();
            let mut released_worker_ids: Vec<String> = vec![];
            let mut peer_destroys: HashMap<WorkerInfo, (Vec<String>, Vec<String>)> = HashMap::new();
            for worker in &failed_workers {
                self.blacklist
                    .add(worker.clone(), BlacklistReason::RESERVE_FAILED);
                let Some((primaries, replicas)) = slots.remove(worker) else {
                    continue;
                };
                released_worker_ids.push(worker.uid());
                for location in primaries.iter().chain(replicas.iter()) {
                    victim_epochs
                        .entry(location.partition_id)
                        .and_modify(|epoch| *epoch = std::cmp::max(*epoch, location.epoch))
                        .or_insert(location.epoch);

                    if !self.replicate {
                        continue;
                    }
                    let Some(peer) = location.peer_location() else {
                        continue;
                    };
                    if &peer.worker == worker {
                        continue;
                    }
                    if let Some(removed) =
                        slots.remove_location(&peer.worker, &peer.unique_id(), peer.mode)
                    {
                        let destroys = peer_destroys.entry(peer.worker.clone()).or_default();
                        match removed.mode {
                            PartitionMode::PRIMARY => destroys.0.push(removed.unique_id()),
                            PartitionMode::REPLICA => destroys.1.push(removed.unique_id()),
                        }
                    }
                }
            }

            for (worker, (primary_ids, replica_ids)) in peer_destroys {
                self.destroy_with_retry(shuffle_id, &worker, primary_ids, replica_ids)
                    .await;
            }
            if !released_worker_ids.is_empty() {
                self.release_at_master(shuffle_id, released_worker_ids).await;
            }

            if round >= self.max_retry {
                warn!(
                    "Reserving slots of shuffle:[{}] exhausted {} retries, giving up",
                    shuffle_id, self.max_retry
                );
                self.destroy_all(shuffle_id, slots).await;
                TOTAL_RESERVE_FAILED.inc();
                return false;
            }

            // Replacements come from the still-reserved workers plus the
            // original candidates, minus everything blacklisted meanwhile.
            let mut retry_candidates: HashSet<WorkerInfo> = slots.workers().into_iter().collect();
            retry_candidates.extend(candidates.iter().cloned());
            let retry_candidates: Vec<WorkerInfo> = retry_candidates
                .into_iter()
                .filter(|worker| !self.blacklist.contains(worker))
                .collect();

            // victims keep their epoch, the discarded slot never existed
            let requests: Vec<PartitionRequest> = victim_epochs
                .iter()
                .map(|(partition_id, epoch)| PartitionRequest::renewal(*partition_id, epoch - 1))
                .collect();
            let replacement = match allocate(&retry_candidates, &requests, self.replicate) {
                Ok(resource) => resource,
                Err(err) => {
                    warn!(
                        "No enough candidates to re-place {} victim partitions of shuffle:[{}]. err: {}",
                        requests.len(),
                        shuffle_id,
                        err
                    );
                    self.destroy_all(shuffle_id, slots).await;
                    TOTAL_RESERVE_FAILED.inc();
                    return false;
                }
            };

            TOTAL_RESERVE_RETRY.inc();
            info!(
                "Retrying reserve of shuffle:[{}]. round: {}, re-placed partitions: {}",
                shuffle_id,
                round,
                requests.len()
            );
            tokio::time::sleep(Duration::from_millis(self.retry_wait_ms)).await;
            slots.merge(replacement.clone());
            to_reserve = replacement;
        }
    }

    /// One reserve fan-out over `resource`, bounded by the rpc parallelism.
    /// Returns the workers that did not accept.
    async fn reserve_round(&self, shuffle_id: i32, resource: &WorkerResource) -> Vec<WorkerInfo> {
        let semaphore = Arc::new(Semaphore::new(self.fan_out_parallelism(resource.len())));
        let reserves = resource.iter().map(|(worker, (primaries, replicas))| {
            let semaphore = semaphore.clone();
            let worker = worker.clone();
            let request = ReserveSlotsRequest {
                app_id: self.app_id.clone(),
                shuffle_id,
                primary_locations: primaries.clone(),
                replica_locations: replicas.clone(),
                split_threshold: self.split_threshold,
                split_mode: self.split_mode,
                partition_type: self.partition_type,
                range_read_filter: self.range_read_filter,
                user_identifier: self.user_identifier.clone(),
            };
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Some(worker);
                };
                let client = match self.resolver.get(&worker).await {
                    Ok(client) => client,
                    Err(_) => return Some(worker),
                };
                match client.reserve_slots(request).await {
                    Ok(response) if response.status.is_success() => None,
                    Ok(response) => {
                        warn!(
                            "Worker:[{}] rejected reserve of shuffle:[{}]. status: {:?}, msg: {}",
                            worker, shuffle_id, response.status, response.msg
                        );
                        Some(worker)
                    }
                    Err(err) => {
                        warn!(
                            "Errors on reserving slots of shuffle:[{}] on worker:[{}]. err: {:?}",
                            shuffle_id, worker, err
                        );
                        Some(worker)
                    }
                }
            }
        });
        join_all(reserves).await.into_iter().flatten().collect()
    }

    /// Worker-side buffer release, with one retry targeted at whatever the
    /// first round reported failed.
    pub async fn destroy_with_retry(
        &self,
        shuffle_id: i32,
        worker: &WorkerInfo,
        primary_ids: Vec<String>,
        replica_ids: Vec<String>,
    ) {
        let client = match self.resolver.get(worker).await {
            Ok(client) => client,
            // unreachable workers hold nothing worth a retry storm
            Err(_) => return,
        };
        let request = DestroyRequest {
            shuffle_key: shuffle_key(&self.app_id, shuffle_id),
            primary_unique_ids: primary_ids,
            replica_unique_ids: replica_ids,
        };
        let retry_request = match client.destroy(request.clone()).await {
            Ok(response)
                if response.failed_primary_ids.is_empty()
                    && response.failed_replica_ids.is_empty() =>
            {
                return
            }
            Ok(response) => DestroyRequest {
                shuffle_key: request.shuffle_key,
                primary_unique_ids: response.failed_primary_ids,
                replica_unique_ids: response.failed_replica_ids,
            },
            Err(_) => request,
        };
        if let Err(err) = client.destroy(retry_request).await {
            warn!(
                "Errors on destroying slots of shuffle:[{}] on worker:[{}]. err: {:?}",
                shuffle_id, worker, err
            );
        }
    }

    async fn destroy_all(&self, shuffle_id: i32, slots: &mut WorkerResource) {
        for worker in slots.workers() {
            if let Some((primaries, replicas)) = slots.remove(&worker) {
                let primary_ids = primaries.iter().map(|l| l.unique_id()).collect();
                let replica_ids = replicas.iter().map(|l| l.unique_id()).collect();
                self.destroy_with_retry(shuffle_id, &worker, primary_ids, replica_ids)
                    .await;
            }
        }
    }

    async fn release_at_master(&self, shuffle_id: i32, worker_ids: Vec<String>) {
        let request = ReleaseSlotsRequest {
            app_id: self.app_id.clone(),
            shuffle_id,
            worker_ids,
            slots_per_worker: vec![],
        };
        if let Err(err) = self.master.release_slots(request).await {
            // best-effort, the master reconciles on unregister
            warn!(
                "Errors on releasing slots of shuffle:[{}] at master. err: {:?}",
                shuffle_id, err
            );
        }
    }
}

#[cfg(test)]
mod test {
    use crate::allocator::{allocate, PartitionRequest};
    use crate::blacklist::Blacklist;
    use crate::config::Config;
    use crate::meta::{PartitionLocation, PartitionMode, WorkerInfo, WorkerResource};
    use crate::mini_cluster::MiniCluster;
    use crate::reservation::ReservationManager;
    use crate::rpc::WorkerEndpointResolver;
    use crate::util::shuffle_key;
    use std::sync::atomic::Ordering::SeqCst;
    use std::sync::Arc;

    fn manager_for(cluster: &MiniCluster, config: &Config) -> (ReservationManager, Arc<Blacklist>) {
        let blacklist = Blacklist::new();
        let resolver = WorkerEndpointResolver::new(cluster.factory.clone(), blacklist.clone());
        (
            ReservationManager::new(
                config,
                cluster.master.clone(),
                resolver,
                blacklist.clone(),
            ),
            blacklist,
        )
    }

    fn test_config(replicate: bool) -> Config {
        let mut config = Config::create_simple_config("app-reserve".to_string());
        config.replicate = replicate;
        config
    }

    #[tokio::test]
    async fn reserve_happy_path_test() {
        let cluster = MiniCluster::with_workers(3);
        let config = test_config(false);
        let (manager, _) = manager_for(&cluster, &config);

        let candidates: Vec<WorkerInfo> =
            cluster.workers.iter().map(|w| w.info.clone()).collect();
        let requests: Vec<PartitionRequest> = (0..8).map(PartitionRequest::fresh).collect();
        let mut slots = allocate(&candidates, &requests, false).unwrap();

        assert!(
            manager
                .reserve_slots_with_retry(1, &candidates, &mut slots)
                .await
        );

        let key = shuffle_key("app-reserve", 1);
        let reserved: usize = cluster
            .workers
            .iter()
            .map(|worker| worker.reserved_primary_ids(&key).len())
            .sum();
        assert_eq!(8, reserved);
    }

    #[tokio::test]
    async fn reserve_retry_replaces_failed_worker_test() {
        let cluster = MiniCluster::with_workers(5);
        let config = test_config(true);
        let (manager, blacklist) = manager_for(&cluster, &config);

        let w2 = cluster.workers[1].info.clone();
        let w3 = cluster.workers[2].info.clone();
        let w4 = cluster.workers[3].info.clone();
        let w5 = cluster.workers[4].info.clone();

        // partition 0: primary on w4 (doomed), replica on w2
        let mut p0_primary = PartitionLocation::new(0, 0, w4.clone(), PartitionMode::PRIMARY);
        let mut p0_replica = PartitionLocation::new(0, 0, w2.clone(), PartitionMode::REPLICA);
        p0_primary.set_peer(&p0_replica);
        p0_replica.set_peer(&p0_primary);
        // partition 1: healthy pair on w2/w3
        let mut p1_primary = PartitionLocation::new(1, 0, w2.clone(), PartitionMode::PRIMARY);
        let mut p1_replica = PartitionLocation::new(1, 0, w3.clone(), PartitionMode::REPLICA);
        p1_primary.set_peer(&p1_replica);
        p1_replica.set_peer(&p1_primary);

        let mut slots = WorkerResource::new();
        slots.add_primary(&w4, p0_primary);
        slots.add_replica(&w2, p0_replica);
        slots.add_primary(&w2, p1_primary);
        slots.add_replica(&w3, p1_replica);

        cluster.workers[3].reserve_failures.store(1, SeqCst);

        let candidates = vec![w2.clone(), w3.clone(), w4.clone(), w5.clone()];
        assert!(
            manager
                .reserve_slots_with_retry(1, &candidates, &mut slots)
                .await
        );

        // w4 is gone from the allocation and blacklisted
        assert!(slots.get(&w4).is_none());
        assert!(blacklist.contains(&w4));
        // the surviving lone replica of partition 0 was destroyed on w2
        assert!(cluster.workers[1].destroy_calls.load(SeqCst) >= 1);
        // its quota went back to the master
        let releases = cluster.master.released_requests();
        assert!(releases.iter().any(|r| r.worker_ids == vec![w4.uid()]));

        // across the fleet exactly one replica per partition is held
        let key = shuffle_key("app-reserve", 1);
        let held_replicas: usize = cluster
            .workers
            .iter()
            .map(|worker| worker.reserved_replica_ids(&key).len())
            .sum();
        assert_eq!(2, held_replicas);

        // both partitions ended with a full pair off w4
        for partition_id in [0, 1] {
            let primary = slots
                .all_primaries()
                .into_iter()
                .find(|l| l.partition_id == partition_id)
                .unwrap();
            let replica = slots
                .all_replicas()
                .into_iter()
                .find(|l| l.partition_id == partition_id)
                .unwrap();
            assert_ne!(primary.worker, replica.worker);
            assert_ne!(primary.worker, w4);
            assert_ne!(replica.worker, w4);
        }
    }

    #[tokio::test]
    async fn reserve_terminal_failure_destroys_test() {
        let cluster = MiniCluster::with_workers(1);
        let mut config = test_config(false);
        config.reserve_slots_max_retry = 2;
        let (manager, _) = manager_for(&cluster, &config);

        // the only worker keeps refusing, so every retry round fails too
        cluster.workers[0].reserve_failures.store(16, SeqCst);

        let candidates: Vec<WorkerInfo> =
            cluster.workers.iter().map(|w| w.info.clone()).collect();
        let requests = vec![PartitionRequest::fresh(0)];
        let mut slots = allocate(&candidates, &requests, false).unwrap();

        assert!(
            !manager
                .reserve_slots_with_retry(1, &candidates, &mut slots)
                .await
        );
        assert!(slots.is_empty());
    }
}
