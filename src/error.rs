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

use thiserror::Error;

#[derive(Error, Debug)]
#[allow(non_camel_case_types)]
pub enum CoordinatorError {
    #[error("No enough candidate workers. required: {0}, available: {1}")]
    INSUFFICIENT_CANDIDATES(usize, usize),

    #[error("Rpc to master failed. {0}")]
    MASTER_RPC_FAILED(String),

    #[error("Rpc to worker:[{0}] failed. {1}")]
    WORKER_RPC_FAILED(String, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
