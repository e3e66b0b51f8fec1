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

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// The identity of a storage worker. Two `WorkerInfo` values are the same
/// worker iff the whole tuple matches; the resolved endpoint handle lives in
/// a sidecar map keyed by this identity (see `rpc::WorkerEndpointResolver`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub host: String,
    pub rpc_port: u16,
    pub push_port: u16,
    pub fetch_port: u16,
    pub replicate_port: u16,
}

impl WorkerInfo {
    pub fn new(
        host: impl Into<String>,
        rpc_port: u16,
        push_port: u16,
        fetch_port: u16,
        replicate_port: u16,
    ) -> Self {
        WorkerInfo {
            host: host.into(),
            rpc_port,
            push_port,
            fetch_port,
            replicate_port,
        }
    }

    pub fn uid(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.host, self.rpc_port, self.push_port, self.fetch_port, self.replicate_port
        )
    }
}

impl Display for WorkerInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uid())
    }
}

// =========================================================

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionMode {
    PRIMARY,
    REPLICA,
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    MEMORY,
    LOCALFILE,
    HDFS,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage_type: StorageType,
    pub mount_point: String,
}

/// One placement of a partition on a worker.
///
/// `epoch` is bumped on every replacement of the same `partition_id`, so the
/// pair `(partition_id, epoch)` is unique within a shuffle and serves as the
/// worker-side unique id. The peer of a replicated location is a flattened
/// copy (its own `peer` is always `None`) so the symmetric link never forms
/// an ownership cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLocation {
    pub partition_id: i32,
    pub epoch: i32,
    pub worker: WorkerInfo,
    pub mode: PartitionMode,
    pub peer: Option<Box<PartitionLocation>>,

    /// Filled at stage end from the committing worker's reply.
    pub storage_info: Option<StorageInfo>,
    pub committed_map_ids: Vec<i32>,
}

impl PartitionLocation {
    pub fn new(partition_id: i32, epoch: i32, worker: WorkerInfo, mode: PartitionMode) -> Self {
        PartitionLocation {
            partition_id,
            epoch,
            worker,
            mode,
            peer: None,
            storage_info: None,
            committed_map_ids: vec![],
        }
    }

    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.partition_id, self.epoch)
    }

    pub fn is_primary(&self) -> bool {
        self.mode == PartitionMode::PRIMARY
    }

    /// A copy without the peer link, suitable for embedding as somebody
    /// else's peer.
    pub fn bare(&self) -> PartitionLocation {
        let mut copy = self.clone();
        copy.peer = None;
        copy
    }

    pub fn set_peer(&mut self, peer: &PartitionLocation) {
        self.peer = Some(Box::new(peer.bare()));
    }

    /// The peer as a standalone location, when one is wired.
    pub fn peer_location(&self) -> Option<PartitionLocation> {
        self.peer.as_ref().map(|p| (**p).clone())
    }
}

// Identity comparison only. Peer links, storage info and bitmaps are
// attachments and never part of the identity.
impl PartialEq for PartitionLocation {
    fn eq(&self, other: &Self) -> bool {
        self.partition_id == other.partition_id
            && self.epoch == other.epoch
            && self.worker == other.worker
            && self.mode == other.mode
    }
}

impl Eq for PartitionLocation {}

// =========================================================

#[derive(Default)]
struct PartitionLocationInfoInner {
    // key: unique id of the location
    primary_locations: HashMap<String, PartitionLocation>,
    replica_locations: HashMap<String, PartitionLocation>,
}

/// All locations one worker holds for one shuffle. No two entries may share
/// `(partition_id, epoch, mode)`, which the unique-id keyed maps enforce.
#[derive(Default)]
pub struct PartitionLocationInfo {
    inner: RwLock<PartitionLocationInfoInner>,
}

impl PartitionLocationInfo {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_primaries(&self, locations: Vec<PartitionLocation>) {
        let mut inner = self.inner.write();
        for location in locations {
            inner.primary_locations.insert(location.unique_id(), location);
        }
    }

    pub fn add_replicas(&self, locations: Vec<PartitionLocation>) {
        let mut inner = self.inner.write();
        for location in locations {
            inner.replica_locations.insert(location.unique_id(), location);
        }
    }

    pub fn primary_unique_ids(&self) -> Vec<String> {
        self.inner.read().primary_locations.keys().cloned().collect()
    }

    pub fn replica_unique_ids(&self) -> Vec<String> {
        self.inner.read().replica_locations.keys().cloned().collect()
    }

    pub fn get_primary(&self, unique_id: &str) -> Option<PartitionLocation> {
        self.inner.read().primary_locations.get(unique_id).cloned()
    }

    pub fn get_replica(&self, unique_id: &str) -> Option<PartitionLocation> {
        self.inner.read().replica_locations.get(unique_id).cloned()
    }

    pub fn remove_primary(&self, unique_id: &str) -> Option<PartitionLocation> {
        self.inner.write().primary_locations.remove(unique_id)
    }

    pub fn remove_replica(&self, unique_id: &str) -> Option<PartitionLocation> {
        self.inner.write().replica_locations.remove(unique_id)
    }

    /// Drops everything and hands back the unique ids, for the worker-side
    /// destroy.
    pub fn remove_all(&self) -> (Vec<String>, Vec<String>) {
        let mut inner = self.inner.write();
        let primary_ids = inner.primary_locations.drain().map(|(k, _)| k).collect();
        let replica_ids = inner.replica_locations.drain().map(|(k, _)| k).collect();
        (primary_ids, replica_ids)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.read();
        inner.primary_locations.is_empty() && inner.replica_locations.is_empty()
    }
}

// =========================================================

/// A computed (not yet reserved) allocation: worker -> (primaries, replicas).
#[derive(Debug, Clone, Default)]
pub struct WorkerResource {
    slots: HashMap<WorkerInfo, (Vec<PartitionLocation>, Vec<PartitionLocation>)>,
}

impl WorkerResource {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_primary(&mut self, worker: &WorkerInfo, location: PartitionLocation) {
        self.slots.entry(worker.clone()).or_default().0.push(location);
    }

    pub fn add_replica(&mut self, worker: &WorkerInfo, location: PartitionLocation) {
        self.slots.entry(worker.clone()).or_default().1.push(location);
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.slots.keys().cloned().collect()
    }

    pub fn get(&self, worker: &WorkerInfo) -> Option<&(Vec<PartitionLocation>, Vec<PartitionLocation>)> {
        self.slots.get(worker)
    }

    pub fn remove(&mut self, worker: &WorkerInfo) -> Option<(Vec<PartitionLocation>, Vec<PartitionLocation>)> {
        self.slots.remove(worker)
    }

    /// Removes one location from a worker's lists, dropping the worker entry
    /// once both lists are empty.
    pub fn remove_location(
        &mut self,
        worker: &WorkerInfo,
        unique_id: &str,
        mode: PartitionMode,
    ) -> Option<PartitionLocation> {
        let entry = self.slots.get_mut(worker)?;
        let list = match mode {
            PartitionMode::PRIMARY => &mut entry.0,
            PartitionMode::REPLICA => &mut entry.1,
        };
        let position = list.iter().position(|l| l.unique_id() == unique_id)?;
        let removed = list.remove(position);
        if entry.0.is_empty() && entry.1.is_empty() {
            self.slots.remove(worker);
        }
        Some(removed)
    }

    /// Folds another allocation in, e.g. replacements computed by a reserve
    /// retry.
    pub fn merge(&mut self, other: WorkerResource) {
        for (worker, (primaries, replicas)) in other.slots {
            let entry = self.slots.entry(worker).or_default();
            entry.0.extend(primaries);
            entry.1.extend(replicas);
        }
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&WorkerInfo, &(Vec<PartitionLocation>, Vec<PartitionLocation>))> {
        self.slots.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn all_primaries(&self) -> Vec<PartitionLocation> {
        self.slots.values().flat_map(|(p, _)| p.iter().cloned()).collect()
    }

    pub fn all_replicas(&self) -> Vec<PartitionLocation> {
        self.slots.values().flat_map(|(_, r)| r.iter().cloned()).collect()
    }
}

#[cfg(test)]
mod test {
    use crate::meta::{
        PartitionLocation, PartitionLocationInfo, PartitionMode, WorkerInfo, WorkerResource,
    };

    fn mock_worker(host: &str) -> WorkerInfo {
        WorkerInfo::new(host, 9097, 9098, 9099, 9100)
    }

    #[test]
    fn worker_identity_test() {
        let w1 = mock_worker("10.0.0.1");
        let w2 = mock_worker("10.0.0.1");
        let w3 = mock_worker("10.0.0.2");
        assert_eq!(w1, w2);
        assert_ne!(w1, w3);
        assert_eq!("10.0.0.1:9097:9098:9099:9100", w1.uid());
    }

    #[test]
    fn peer_wiring_test() {
        let mut primary =
            PartitionLocation::new(3, 1, mock_worker("10.0.0.1"), PartitionMode::PRIMARY);
        let mut replica =
            PartitionLocation::new(3, 1, mock_worker("10.0.0.2"), PartitionMode::REPLICA);
        primary.set_peer(&replica);
        replica.set_peer(&primary);

        assert_eq!("3-1", primary.unique_id());
        assert_eq!(primary.unique_id(), replica.unique_id());

        let peer_of_primary = primary.peer_location().unwrap();
        assert_eq!(replica, peer_of_primary);
        // the flattened copy carries no further link
        assert!(peer_of_primary.peer.is_none());
        assert_ne!(primary.worker, peer_of_primary.worker);
    }

    #[test]
    fn location_info_test() {
        let info = PartitionLocationInfo::new();
        let w = mock_worker("10.0.0.1");
        info.add_primaries(vec![
            PartitionLocation::new(0, 0, w.clone(), PartitionMode::PRIMARY),
            PartitionLocation::new(1, 0, w.clone(), PartitionMode::PRIMARY),
        ]);
        info.add_replicas(vec![PartitionLocation::new(
            2,
            0,
            w.clone(),
            PartitionMode::REPLICA,
        )]);

        assert_eq!(2, info.primary_unique_ids().len());
        assert_eq!(1, info.replica_unique_ids().len());
        assert!(info.get_primary("0-0").is_some());
        assert!(info.get_primary("9-9").is_none());

        let removed = info.remove_primary("0-0");
        assert!(removed.is_some());

        let (primary_ids, replica_ids) = info.remove_all();
        assert_eq!(1, primary_ids.len());
        assert_eq!(1, replica_ids.len());
        assert!(info.is_empty());
    }

    #[test]
    fn worker_resource_merge_test() {
        let w1 = mock_worker("10.0.0.1");
        let w2 = mock_worker("10.0.0.2");

        let mut resource = WorkerResource::new();
        resource.add_primary(
            &w1,
            PartitionLocation::new(0, 0, w1.clone(), PartitionMode::PRIMARY),
        );

        let mut replacement = WorkerResource::new();
        replacement.add_primary(
            &w2,
            PartitionLocation::new(1, 1, w2.clone(), PartitionMode::PRIMARY),
        );
        replacement.add_replica(
            &w1,
            PartitionLocation::new(1, 1, w1.clone(), PartitionMode::REPLICA),
        );

        resource.merge(replacement);
        assert_eq!(2, resource.len());
        assert_eq!(2, resource.all_primaries().len());
        assert_eq!(1, resource.all_replicas().len());
        assert_eq!(1, resource.get(&w1).unwrap().1.len());
    }
}
