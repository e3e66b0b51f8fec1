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

pub mod manager;

use await_tree::{init_global_registry, Config as AwaitTreeConfig, Registry, Span, TreeRoot};
use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub static AWAIT_TREE_REGISTRY: Lazy<AwaitTreeDelegator> = Lazy::new(AwaitTreeDelegator::new);

/// Hands out await-tree roots with process-unique keys, so every long-lived
/// task spawned through [`Runtime::spawn_with_await_tree`] is diagnosable.
#[derive(Clone)]
pub struct AwaitTreeDelegator {
    registry: Registry,
    next_id: Arc<AtomicU64>,
}

impl AwaitTreeDelegator {
    fn new() -> Self {
        init_global_registry(AwaitTreeConfig::default());
        let registry = Registry::current();
        Self {
            registry,
            next_id: Arc::new(Default::default()),
        }
    }

    pub fn register(&self, msg: impl Into<Span>) -> TreeRoot {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry.register(id, msg)
    }
}

pub type RuntimeRef = Arc<Runtime>;

pub struct Runtime {
    inner: tokio::runtime::Runtime,
    #[allow(dead_code)]
    name: String,
}

impl Runtime {
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn(future)
    }

    pub fn spawn_with_await_tree<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = name.to_string();
        self.spawn(async move {
            let root = AWAIT_TREE_REGISTRY.register(name);
            root.instrument(future).await
        })
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.block_on(future)
    }
}

pub fn create_runtime(pool_size: usize, name: &str) -> RuntimeRef {
    let inner = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(pool_size)
        .thread_name(name)
        .enable_all()
        .build()
        .expect("runtime should be created");
    Arc::new(Runtime {
        inner,
        name: name.to_string(),
    })
}

#[cfg(test)]
mod test {
    use crate::runtime::create_runtime;

    #[test]
    fn spawn_and_block_test() {
        let runtime = create_runtime(2, "test-pool");
        let handle = runtime.spawn_with_await_tree("adder", async { 1 + 1 });
        assert_eq!(2, runtime.block_on(handle).unwrap());
    }
}
