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

//! The outbound RPC seams. Concrete transports (grpc, tls, ha failover)
//! implement these traits outside this crate; the coordinator only sees the
//! typed calls.

use crate::blacklist::{BlacklistReason, BlacklistRef};
use crate::error::CoordinatorError;
use crate::message::{
    ApplicationHeartbeatRequest, CheckQuotaRequest, CheckQuotaResponse, CommitFilesRequest,
    CommitFilesResponse, DestroyRequest, DestroyResponse, GetBlacklistRequest,
    GetBlacklistResponse, ReleaseSlotsRequest, ReleaseSlotsResponse, RequestSlotsRequest,
    RequestSlotsResponse, ReserveSlotsRequest, ReserveSlotsResponse, UnregisterShuffleRequest,
};
use crate::meta::WorkerInfo;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn request_slots(&self, request: RequestSlotsRequest) -> Result<RequestSlotsResponse>;

    async fn release_slots(&self, request: ReleaseSlotsRequest) -> Result<ReleaseSlotsResponse>;

    async fn get_blacklist(&self, request: GetBlacklistRequest) -> Result<GetBlacklistResponse>;

    async fn unregister_shuffle(&self, request: UnregisterShuffleRequest) -> Result<()>;

    async fn heartbeat_from_application(&self, request: ApplicationHeartbeatRequest)
        -> Result<()>;

    async fn check_quota(&self, request: CheckQuotaRequest) -> Result<CheckQuotaResponse>;
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn reserve_slots(&self, request: ReserveSlotsRequest) -> Result<ReserveSlotsResponse>;

    async fn commit_files(&self, request: CommitFilesRequest) -> Result<CommitFilesResponse>;

    async fn destroy(&self, request: DestroyRequest) -> Result<DestroyResponse>;
}

/// Dials one worker. Invoked lazily, at most once per live handle.
#[async_trait]
pub trait WorkerClientFactory: Send + Sync {
    async fn create(&self, worker: &WorkerInfo) -> Result<Arc<dyn WorkerClient>>;
}

#[derive(Default)]
struct EndpointCell {
    client: tokio::sync::Mutex<Option<Arc<dyn WorkerClient>>>,
}

pub type WorkerEndpointResolverRef = Arc<WorkerEndpointResolver>;

/// Separates worker identity from connection: `WorkerInfo` stays pure data,
/// the resolved handle lives here and is initialized on first use under a
/// per-worker guard. A worker whose endpoint cannot be initialized goes to
/// the blacklist; its identity is untouched.
pub struct WorkerEndpointResolver {
    factory: Arc<dyn WorkerClientFactory>,
    endpoints: DashMap<WorkerInfo, Arc<EndpointCell>>,
    blacklist: BlacklistRef,
}

impl WorkerEndpointResolver {
    pub fn new(
        factory: Arc<dyn WorkerClientFactory>,
        blacklist: BlacklistRef,
    ) -> WorkerEndpointResolverRef {
        Arc::new(WorkerEndpointResolver {
            factory,
            endpoints: DashMap::new(),
            blacklist,
        })
    }

    pub async fn get(
        &self,
        worker: &WorkerInfo,
    ) -> Result<Arc<dyn WorkerClient>, CoordinatorError> {
        let cell = self
            .endpoints
            .entry(worker.clone())
            .or_insert_with(|| Arc::new(EndpointCell::default()))
            .value()
            .clone();

        let mut slot = cell.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        match self.factory.create(worker).await {
            Ok(client) => {
                *slot = Some(client.clone());
                Ok(client)
            }
            Err(err) => {
                self.blacklist
                    .add(worker.clone(), BlacklistReason::CONNECT_FAILED);
                Err(CoordinatorError::WORKER_RPC_FAILED(
                    worker.uid(),
                    err.to_string(),
                ))
            }
        }
    }

    /// Drops a handle so the next use redials.
    pub fn forget(&self, worker: &WorkerInfo) {
        self.endpoints.remove(worker);
    }
}

#[cfg(test)]
mod test {
    use crate::blacklist::Blacklist;
    use crate::error::CoordinatorError;
    use crate::message::{
        CommitFilesRequest, CommitFilesResponse, DestroyRequest, DestroyResponse,
        ReserveSlotsRequest, ReserveSlotsResponse,
    };
    use crate::meta::WorkerInfo;
    use crate::rpc::{WorkerClient, WorkerClientFactory, WorkerEndpointResolver};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NoopWorker;

    #[async_trait]
    impl WorkerClient for NoopWorker {
        async fn reserve_slots(&self, _: ReserveSlotsRequest) -> Result<ReserveSlotsResponse> {
            unimplemented!()
        }
        async fn commit_files(&self, _: CommitFilesRequest) -> Result<CommitFilesResponse> {
            unimplemented!()
        }
        async fn destroy(&self, _: DestroyRequest) -> Result<DestroyResponse> {
            unimplemented!()
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
        broken_host: String,
    }

    #[async_trait]
    impl WorkerClientFactory for CountingFactory {
        async fn create(&self, worker: &WorkerInfo) -> Result<Arc<dyn WorkerClient>> {
            if worker.host == self.broken_host {
                return Err(anyhow!("connection refused"));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopWorker))
        }
    }

    #[tokio::test]
    async fn lazy_single_init_test() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            broken_host: "none".to_string(),
        });
        let blacklist = Blacklist::new();
        let resolver = WorkerEndpointResolver::new(factory.clone(), blacklist);

        let worker = WorkerInfo::new("10.0.0.1", 9097, 9098, 9099, 9100);
        let _ = resolver.get(&worker).await.unwrap();
        let _ = resolver.get(&worker).await.unwrap();
        assert_eq!(1, factory.created.load(Ordering::SeqCst));

        resolver.forget(&worker);
        let _ = resolver.get(&worker).await.unwrap();
        assert_eq!(2, factory.created.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn connect_failure_blacklists_test() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            broken_host: "10.0.0.9".to_string(),
        });
        let blacklist = Blacklist::new();
        let resolver = WorkerEndpointResolver::new(factory, blacklist.clone());

        let broken = WorkerInfo::new("10.0.0.9", 9097, 9098, 9099, 9100);
        match resolver.get(&broken).await {
            Err(CoordinatorError::WORKER_RPC_FAILED(uid, _)) => {
                assert_eq!(broken.uid(), uid)
            }
            _ => panic!(),
        }
        assert!(blacklist.contains(&broken));
    }
}
