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

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app_id: String,

    #[serde(default = "as_default_user_identifier")]
    pub user_identifier: String,

    #[serde(default = "as_default_driver_meta_service_port")]
    pub driver_meta_service_port: u16,

    #[serde(default = "bool::default")]
    pub replicate: bool,

    #[serde(default)]
    pub partition_type: PartitionType,

    #[serde(default = "as_default_partition_split_threshold")]
    pub partition_split_threshold: u64,

    #[serde(default)]
    pub split_mode: SplitMode,

    #[serde(default = "bool::default")]
    pub range_read_filter: bool,

    #[serde(default = "as_default_stage_end_timeout_ms")]
    pub stage_end_timeout_ms: u64,

    #[serde(default = "as_default_remove_shuffle_delay_ms")]
    pub remove_shuffle_delay_ms: u64,

    #[serde(default = "as_default_get_blacklist_delay_ms")]
    pub get_blacklist_delay_ms: u64,

    #[serde(default = "as_default_application_heartbeat_interval_ms")]
    pub application_heartbeat_interval_ms: u64,

    #[serde(default = "as_default_reserve_slots_max_retry")]
    pub reserve_slots_max_retry: u32,

    #[serde(default = "as_default_reserve_slots_retry_wait_ms")]
    pub reserve_slots_retry_wait_ms: u64,

    #[serde(default = "as_default_rpc_max_parallelism")]
    pub rpc_max_parallelism: usize,

    #[serde(default)]
    pub runtime_config: RuntimeConfig,

    #[serde(default)]
    pub log: LogConfig,
}

fn as_default_user_identifier() -> String {
    "default/default".to_string()
}

fn as_default_driver_meta_service_port() -> u16 {
    0
}

fn as_default_partition_split_threshold() -> u64 {
    // 256M
    256 * 1024 * 1024
}

fn as_default_stage_end_timeout_ms() -> u64 {
    240 * 1000
}

fn as_default_remove_shuffle_delay_ms() -> u64 {
    60 * 1000
}

fn as_default_get_blacklist_delay_ms() -> u64 {
    30 * 1000
}

fn as_default_application_heartbeat_interval_ms() -> u64 {
    10 * 1000
}

fn as_default_reserve_slots_max_retry() -> u32 {
    3
}

fn as_default_reserve_slots_retry_wait_ms() -> u64 {
    3 * 1000
}

fn as_default_rpc_max_parallelism() -> usize {
    64
}

// =========================================================

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartitionType {
    REDUCE_PARTITION,
    MAP_PARTITION,
}

impl Default for PartitionType {
    fn default() -> Self {
        PartitionType::REDUCE_PARTITION
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum SplitMode {
    SOFT,
    HARD,
}

impl Default for SplitMode {
    fn default() -> Self {
        SplitMode::SOFT
    }
}

// =========================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default = "as_default_default_pool_size")]
    pub default_pool_size: usize,
    #[serde(default = "as_default_rpc_pool_size")]
    pub rpc_pool_size: usize,
    #[serde(default = "as_default_dispatch_pool_size")]
    pub dispatch_pool_size: usize,
}

fn as_default_default_pool_size() -> usize {
    4
}

fn as_default_rpc_pool_size() -> usize {
    8
}

fn as_default_dispatch_pool_size() -> usize {
    2
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            default_pool_size: as_default_default_pool_size(),
            rpc_pool_size: as_default_rpc_pool_size(),
            dispatch_pool_size: as_default_dispatch_pool_size(),
        }
    }
}

// =========================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    pub path: String,
    pub rotation: RotationConfig,
    #[serde(default = "as_default_log_level")]
    pub level: String,
}

fn as_default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: "/tmp/eddy".to_string(),
            rotation: RotationConfig::Hourly,
            level: as_default_log_level(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum RotationConfig {
    Hourly,
    Daily,
    Never,
}

// =========================================================

const CONFIG_FILE_PATH_KEY: &str = "EDDY_CONF_FILE";

impl Config {
    pub fn from(cfg_path: &str) -> Self {
        let path = Path::new(cfg_path);
        let file_content = fs::read_to_string(path).expect("Failed to read config file");
        toml::from_str(&file_content).unwrap()
    }

    pub fn create_from_env() -> Config {
        let path = match std::env::var(CONFIG_FILE_PATH_KEY) {
            Ok(val) => val,
            _ => panic!(
                "config path must be set in env args. key: {}",
                CONFIG_FILE_PATH_KEY
            ),
        };

        Config::from(&path)
    }

    /// A config with short timers and no replication, for embedded setups.
    pub fn create_simple_config(app_id: String) -> Config {
        let toml_str = format!(
            r#"
        app_id = {:?}
        stage_end_timeout_ms = 2000
        remove_shuffle_delay_ms = 1000
        get_blacklist_delay_ms = 1000
        application_heartbeat_interval_ms = 1000
        reserve_slots_retry_wait_ms = 10
        "#,
            app_id
        );
        toml::from_str(toml_str.as_str()).unwrap()
    }
}

#[cfg(test)]
mod test {
    use crate::config::{Config, PartitionType, RotationConfig, SplitMode};

    #[test]
    fn config_test() {
        let toml_str = r#"
        app_id = "app-1656"
        replicate = true
        partition_type = "MAP_PARTITION"
        split_mode = "HARD"
        reserve_slots_max_retry = 5

        [log]
        path = "/var/log/eddy"
        rotation = "Daily"
        level = "warn"
        "#;

        let decoded: Config = toml::from_str(toml_str).unwrap();
        assert_eq!("app-1656", decoded.app_id);
        assert!(decoded.replicate);
        assert_eq!(PartitionType::MAP_PARTITION, decoded.partition_type);
        assert_eq!(SplitMode::HARD, decoded.split_mode);
        assert_eq!(5, decoded.reserve_slots_max_retry);
        assert_eq!(RotationConfig::Daily, decoded.log.rotation);
        assert_eq!("warn", decoded.log.level);

        // untouched keys fall back to defaults
        assert_eq!(240 * 1000, decoded.stage_end_timeout_ms);
        assert_eq!(64, decoded.rpc_max_parallelism);
        assert_eq!("default/default", decoded.user_identifier);
    }

    #[test]
    fn simple_config_test() {
        let config = Config::create_simple_config("app-simple".to_string());
        assert_eq!("app-simple", config.app_id);
        assert!(!config.replicate);
        assert_eq!(PartitionType::REDUCE_PARTITION, config.partition_type);
        assert_eq!(2000, config.stage_end_timeout_ms);
        assert_eq!("info", config.log.level);
    }
}
