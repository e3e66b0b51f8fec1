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

//! Message payloads of the coordinator's three RPC surfaces: inbound
//! task-facing requests, outbound master requests and outbound worker
//! requests. Transport and serialization live outside this crate; these are
//! the plain in-process shapes.

use crate::config::{PartitionType, SplitMode};
use crate::constant::StatusCode;
use crate::meta::{PartitionLocation, StorageInfo, WorkerInfo, WorkerResource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =========================================================
// Task-facing (inbound)
// =========================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterShuffleRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub num_mappers: usize,
    pub num_reducers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterShuffleResponse {
    pub status: StatusCode,
    pub primary_locations: Vec<PartitionLocation>,
}

impl RegisterShuffleResponse {
    pub fn of(status: StatusCode) -> Self {
        RegisterShuffleResponse {
            status,
            primary_locations: vec![],
        }
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviveCause {
    PRIMARY_PUSH_FAILURE,
    REPLICA_PUSH_FAILURE,
    PUSH_DATA_TIMEOUT,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviveRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub map_id: i32,
    pub attempt_id: i64,
    pub partition_id: i32,
    pub epoch: i32,
    pub old_location: Option<PartitionLocation>,
    pub cause: ReviveCause,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSplitRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub partition_id: i32,
    pub epoch: i32,
    pub old_location: PartitionLocation,
}

/// Shared reply of `Revive` and `PartitionSplit`: the freshest usable
/// primary for the partition, when one could be produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeLocationResponse {
    pub status: StatusCode,
    pub location: Option<PartitionLocation>,
}

impl ChangeLocationResponse {
    pub fn of(status: StatusCode) -> Self {
        ChangeLocationResponse {
            status,
            location: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperEndRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub map_id: i32,
    pub attempt_id: i64,
    pub num_mappers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperEndResponse {
    pub status: StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReducerFileGroupRequest {
    pub app_id: String,
    pub shuffle_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReducerFileGroupResponse {
    pub status: StatusCode,
    pub file_groups: Vec<Vec<PartitionLocation>>,
    pub mapper_attempts: Vec<i64>,
}

impl GetReducerFileGroupResponse {
    pub fn of(status: StatusCode) -> Self {
        GetReducerFileGroupResponse {
            status,
            file_groups: vec![],
            mapper_attempts: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEndRequest {
    pub app_id: String,
    pub shuffle_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterShuffleRequest {
    pub app_id: String,
    pub shuffle_id: i32,
}

// =========================================================
// Master-facing (outbound)
// =========================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSlotsRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub partition_ids: Vec<i32>,
    pub coordinator_host: String,
    pub replicate: bool,
    pub user_identifier: String,
}

#[derive(Debug, Clone)]
pub struct RequestSlotsResponse {
    pub status: StatusCode,
    pub worker_resource: WorkerResource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSlotsRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    /// Empty means: release everything the master still tracks for this
    /// shuffle.
    pub worker_ids: Vec<String>,
    pub slots_per_worker: Vec<i32>,
}

impl ReleaseSlotsRequest {
    pub fn all(app_id: &str, shuffle_id: i32) -> Self {
        ReleaseSlotsRequest {
            app_id: app_id.to_string(),
            shuffle_id,
            worker_ids: vec![],
            slots_per_worker: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSlotsResponse {
    pub status: StatusCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlacklistRequest {
    pub local_blacklist: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBlacklistResponse {
    pub status: StatusCode,
    pub blacklist: Vec<WorkerInfo>,
    pub unknown_workers: Vec<WorkerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationHeartbeatRequest {
    pub app_id: String,
    pub total_written_bytes: u64,
    pub file_count: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckQuotaRequest {
    pub user_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckQuotaResponse {
    pub available: bool,
}

// =========================================================
// Worker-facing (outbound)
// =========================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSlotsRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub primary_locations: Vec<PartitionLocation>,
    pub replica_locations: Vec<PartitionLocation>,
    pub split_threshold: u64,
    pub split_mode: SplitMode,
    pub partition_type: PartitionType,
    pub range_read_filter: bool,
    pub user_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSlotsResponse {
    pub status: StatusCode,
    pub msg: String,
}

impl ReserveSlotsResponse {
    pub fn of(status: StatusCode) -> Self {
        ReserveSlotsResponse {
            status,
            msg: "".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFilesRequest {
    pub app_id: String,
    pub shuffle_id: i32,
    pub primary_ids: Vec<String>,
    pub replica_ids: Vec<String>,
    pub mapper_attempts: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitFilesResponse {
    pub status: StatusCode,
    pub committed_primary_ids: Vec<String>,
    pub committed_replica_ids: Vec<String>,
    pub failed_primary_ids: Vec<String>,
    pub failed_replica_ids: Vec<String>,
    pub committed_primary_storage_infos: HashMap<String, StorageInfo>,
    pub committed_replica_storage_infos: HashMap<String, StorageInfo>,
    pub committed_map_id_bitmap: HashMap<String, Vec<i32>>,
    pub total_written: u64,
    pub file_count: u64,
}

impl CommitFilesResponse {
    pub fn of(status: StatusCode) -> Self {
        CommitFilesResponse {
            status,
            committed_primary_ids: vec![],
            committed_replica_ids: vec![],
            failed_primary_ids: vec![],
            failed_replica_ids: vec![],
            committed_primary_storage_infos: HashMap::new(),
            committed_replica_storage_infos: HashMap::new(),
            committed_map_id_bitmap: HashMap::new(),
            total_written: 0,
            file_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyRequest {
    pub shuffle_key: String,
    pub primary_unique_ids: Vec<String>,
    pub replica_unique_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyResponse {
    pub status: StatusCode,
    pub failed_primary_ids: Vec<String>,
    pub failed_replica_ids: Vec<String>,
}
