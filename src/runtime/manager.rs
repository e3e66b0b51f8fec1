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

use crate::config::RuntimeConfig;
use crate::runtime::{create_runtime, RuntimeRef};
use std::future::Future;

/// The named runtimes of the coordinator: timers and background loops on
/// `default_runtime`, worker/master fan-outs on `rpc_runtime`, the endpoint
/// dispatcher on `dispatch_runtime`.
#[derive(Clone)]
pub struct RuntimeManager {
    pub default_runtime: RuntimeRef,
    pub rpc_runtime: RuntimeRef,
    pub dispatch_runtime: RuntimeRef,
}

impl Default for RuntimeManager {
    fn default() -> Self {
        RuntimeManager::from(Default::default())
    }
}

impl RuntimeManager {
    pub fn from(config: RuntimeConfig) -> Self {
        Self {
            default_runtime: create_runtime(config.default_pool_size, "default"),
            rpc_runtime: create_runtime(config.rpc_pool_size, "rpc"),
            dispatch_runtime: create_runtime(config.dispatch_pool_size, "dispatch"),
        }
    }

    pub fn wait<F: Future>(&self, future: F) -> F::Output {
        self.default_runtime.block_on(future)
    }
}

#[cfg(test)]
mod test {
    use crate::runtime::manager::RuntimeManager;

    #[test]
    fn wait_test() {
        let runtime_manager: RuntimeManager = Default::default();
        let value = runtime_manager.wait(async { 42 });
        assert_eq!(42, value);
    }
}
