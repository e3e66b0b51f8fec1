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

//! The task-facing endpoint: every inbound request is one variant of a
//! tagged union, routed by a dispatcher loop. Replies travel back through
//! per-request oneshot handles, so a transport layer only has to translate
//! wire frames into these variants.

use crate::lifecycle::LifecycleManagerRef;
use crate::message::{
    ChangeLocationResponse, GetReducerFileGroupRequest, GetReducerFileGroupResponse,
    MapperEndRequest, MapperEndResponse, PartitionSplitRequest, RegisterShuffleRequest,
    RegisterShuffleResponse, ReviveRequest, StageEndRequest, UnregisterShuffleRequest,
};
use crate::runtime::manager::RuntimeManager;
use crate::runtime::RuntimeRef;
use anyhow::Result;
use await_tree::InstrumentAwait;
use log::info;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub enum LifecycleRequest {
    RegisterShuffle {
        request: RegisterShuffleRequest,
        reply: oneshot::Sender<RegisterShuffleResponse>,
    },
    Revive {
        request: ReviveRequest,
        reply: oneshot::Sender<ChangeLocationResponse>,
    },
    PartitionSplit {
        request: PartitionSplitRequest,
        reply: oneshot::Sender<ChangeLocationResponse>,
    },
    MapperEnd {
        request: MapperEndRequest,
        reply: oneshot::Sender<MapperEndResponse>,
    },
    GetReducerFileGroup {
        request: GetReducerFileGroupRequest,
        reply: oneshot::Sender<GetReducerFileGroupResponse>,
    },
    StageEnd {
        request: StageEndRequest,
    },
    UnregisterShuffle {
        request: UnregisterShuffleRequest,
    },
}

pub struct CoordinatorEndpoint {
    sender: async_channel::Sender<LifecycleRequest>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinatorEndpoint {
    /// Starts the dispatcher loop. Handlers run as their own tasks on the
    /// dispatch runtime, so a reducer parked on the stage-end wait never
    /// stalls the dispatch of other requests.
    pub fn start(manager: &LifecycleManagerRef, runtime_manager: &RuntimeManager) -> Self {
        let (sender, receiver) = async_channel::unbounded::<LifecycleRequest>();
        let manager = manager.clone();
        let dispatch_runtime = runtime_manager.dispatch_runtime.clone();
        let handler_runtime = dispatch_runtime.clone();

        let handle = dispatch_runtime.spawn_with_await_tree("Lifecycle dispatcher", async move {
            info!("Starting lifecycle endpoint dispatcher...");
            while let Ok(request) = receiver
                .recv()
                .instrument_await("waiting for lifecycle requests...")
                .await
            {
                let manager = manager.clone();
                Self::dispatch(&handler_runtime, manager, request);
            }
        });

        CoordinatorEndpoint {
            sender,
            handles: Mutex::new(vec![handle]),
        }
    }

    fn dispatch(runtime: &RuntimeRef, manager: LifecycleManagerRef, request: LifecycleRequest) {
        match request {
            LifecycleRequest::RegisterShuffle { request, reply } => {
                runtime.spawn(async move {
                    let _ = reply.send(manager.register_shuffle(request).await);
                });
            }
            LifecycleRequest::Revive { request, reply } => {
                runtime.spawn(async move {
                    let _ = reply.send(manager.revive(request).await);
                });
            }
            LifecycleRequest::PartitionSplit { request, reply } => {
                runtime.spawn(async move {
                    let _ = reply.send(manager.partition_split(request).await);
                });
            }
            LifecycleRequest::MapperEnd { request, reply } => {
                runtime.spawn(async move {
                    let _ = reply.send(manager.mapper_end(request).await);
                });
            }
            LifecycleRequest::GetReducerFileGroup { request, reply } => {
                runtime.spawn(async move {
                    let _ = reply.send(manager.get_reducer_file_group(request).await);
                });
            }
            LifecycleRequest::StageEnd { request } => {
                runtime.spawn(async move {
                    manager.trigger_stage_end(request.shuffle_id).await;
                });
            }
            LifecycleRequest::UnregisterShuffle { request } => {
                runtime.spawn(async move {
                    manager.unregister_shuffle(request).await;
                });
            }
        }
    }

    pub fn stop(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    // ==================== requester-side helpers ====================

    pub async fn register_shuffle(
        &self,
        request: RegisterShuffleRequest,
    ) -> Result<RegisterShuffleResponse> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(LifecycleRequest::RegisterShuffle { request, reply })
            .await?;
        Ok(receiver.await?)
    }

    pub async fn revive(&self, request: ReviveRequest) -> Result<ChangeLocationResponse> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(LifecycleRequest::Revive { request, reply })
            .await?;
        Ok(receiver.await?)
    }

    pub async fn partition_split(
        &self,
        request: PartitionSplitRequest,
    ) -> Result<ChangeLocationResponse> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(LifecycleRequest::PartitionSplit { request, reply })
            .await?;
        Ok(receiver.await?)
    }

    pub async fn mapper_end(&self, request: MapperEndRequest) -> Result<MapperEndResponse> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(LifecycleRequest::MapperEnd { request, reply })
            .await?;
        Ok(receiver.await?)
    }

    pub async fn get_reducer_file_group(
        &self,
        request: GetReducerFileGroupRequest,
    ) -> Result<GetReducerFileGroupResponse> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(LifecycleRequest::GetReducerFileGroup { request, reply })
            .await?;
        Ok(receiver.await?)
    }

    /// Fire and forget.
    pub async fn stage_end(&self, request: StageEndRequest) -> Result<()> {
        self.sender
            .send(LifecycleRequest::StageEnd { request })
            .await?;
        Ok(())
    }

    /// Fire and forget.
    pub async fn unregister_shuffle(&self, request: UnregisterShuffleRequest) -> Result<()> {
        self.sender
            .send(LifecycleRequest::UnregisterShuffle { request })
            .await?;
        Ok(())
    }
}
