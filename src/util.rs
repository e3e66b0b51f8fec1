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

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const COORDINATOR_IP: &str = "COORDINATOR_IP";

/// The address the coordinator advertises to the master in slot requests.
/// The env override wins, then whatever interface routes outward, then
/// loopback for single-process setups.
pub fn coordinator_host() -> String {
    if let Ok(ip) = std::env::var(COORDINATOR_IP) {
        return ip;
    }
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// The worker-side key of all per-shuffle resources, shared with the
/// reserve/commit/destroy requests.
pub fn shuffle_key(app_id: &str, shuffle_id: i32) -> String {
    format!("{}-{}", app_id, shuffle_id)
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
}

pub fn now_timestamp_as_millis() -> u128 {
    unix_now().as_millis()
}

pub fn now_timestamp_as_sec() -> u64 {
    unix_now().as_secs()
}
