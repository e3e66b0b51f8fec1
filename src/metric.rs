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

use log::error;
use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

const COMMIT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 60.0, 120.0, 300.0,
];

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static GAUGE_SHUFFLE_NUMBER: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("shuffle_number", "live shuffles").expect("metric should be created")
});

pub static TOTAL_SHUFFLE_REGISTERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_shuffle_registered", "registered shuffles")
        .expect("metric should be created")
});

pub static TOTAL_REGISTER_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_register_failed", "failed shuffle registrations")
        .expect("metric should be created")
});

pub static TOTAL_REVIVE_REQUEST: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_revive_request", "revive and split requests")
        .expect("metric should be created")
});

pub static TOTAL_RESERVE_RETRY: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_reserve_retry", "reserve slots retry rounds")
        .expect("metric should be created")
});

pub static TOTAL_RESERVE_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_reserve_failed", "terminally failed reservations")
        .expect("metric should be created")
});

pub static TOTAL_COMMIT_FILES_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_commit_files_failed", "failed commit-files rpc")
        .expect("metric should be created")
});

pub static TOTAL_DATA_LOST_SHUFFLE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_data_lost_shuffle", "shuffles ended with data loss")
        .expect("metric should be created")
});

pub static TOTAL_EXPIRED_SHUFFLE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_expired_shuffle", "shuffles dropped by expiration")
        .expect("metric should be created")
});

pub static TOTAL_COMMITTED_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("total_committed_bytes", "bytes committed at stage ends")
        .expect("metric should be created")
});

pub static GAUGE_BLACKLISTED_WORKER_NUMBER: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("blacklisted_worker_number", "blacklisted workers")
        .expect("metric should be created")
});

pub static COMMIT_FILES_DURATION: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("commit_files_duration", "stage end commit duration (seconds)")
            .buckets(COMMIT_DURATION_BUCKETS.to_vec()),
    )
    .expect("metric should be created")
});

pub struct MetricService;

impl MetricService {
    pub fn init() {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(GAUGE_SHUFFLE_NUMBER.clone()),
            Box::new(TOTAL_SHUFFLE_REGISTERED.clone()),
            Box::new(TOTAL_REGISTER_FAILED.clone()),
            Box::new(TOTAL_REVIVE_REQUEST.clone()),
            Box::new(TOTAL_RESERVE_RETRY.clone()),
            Box::new(TOTAL_RESERVE_FAILED.clone()),
            Box::new(TOTAL_COMMIT_FILES_FAILED.clone()),
            Box::new(TOTAL_DATA_LOST_SHUFFLE.clone()),
            Box::new(TOTAL_EXPIRED_SHUFFLE.clone()),
            Box::new(TOTAL_COMMITTED_BYTES.clone()),
            Box::new(GAUGE_BLACKLISTED_WORKER_NUMBER.clone()),
            Box::new(COMMIT_FILES_DURATION.clone()),
        ];
        for collector in collectors {
            if let Err(err) = REGISTRY.register(collector) {
                // double init from embedded setups, keep the first registration
                error!("Errors on registering metric. err: {:?}", err);
            }
        }
    }
}
