// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::store::TopicMode;

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<BrokerConfig> = OnceCell::new();

/// The loaded configuration, or the defaults when nothing was loaded.
pub fn global_config() -> &'static BrokerConfig {
    GLOBAL_CONFIG.get_or_init(BrokerConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    pub max_msg_size: usize,
    pub log_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            max_msg_size: 4 * 1024 * 1024,
            log_dir: "logs".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PartitionConfig {
    pub topic_name: String,
    pub partition_id: u32,
    pub partition_count: u32,
    pub range_count: u32,
    /// Compress produced messages on the broker before storing them.
    pub compress_msg_in_broker: bool,
    /// Messages up to this size are never compressed.
    pub compress_threshold: usize,
    /// Deadline handed to every store read.
    pub read_timeout_ms: u64,
    pub max_read_count: u32,
    /// Verify compact batches coming from clients before touching them.
    pub validate_client_batch: bool,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig {
            topic_name: "default".to_string(),
            partition_id: 0,
            partition_count: 1,
            range_count: 64,
            compress_msg_in_broker: false,
            compress_threshold: 512,
            read_timeout_ms: 100,
            max_read_count: 1000,
            validate_client_batch: true,
        }
    }
}

impl PartitionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LongPollConfig {
    /// Upper bound of how long a read may stay parked.
    pub max_hold_ms: u64,
    pub maintenance_interval_ms: u64,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        LongPollConfig {
            max_hold_ms: 30_000,
            maintenance_interval_ms: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MirrorConfig {
    pub enabled: bool,
    /// Serve reads while the partition is still catching up.
    pub read_during_bootstrap: bool,
    pub pull_interval_ms: u64,
    pub pull_batch_size: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            enabled: false,
            read_during_bootstrap: false,
            pull_interval_ms: 50,
            pull_batch_size: 500,
            backoff_base_ms: 100,
            backoff_max_ms: 5_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct WriterVersionConfig {
    /// Reject writes that name no writer.
    pub enforce_writer_version: bool,
    pub kv_store_path: String,
}

impl Default for WriterVersionConfig {
    fn default() -> Self {
        WriterVersionConfig {
            enforce_writer_version: false,
            kv_store_path: "data/writer_version.db".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub topic_mode: TopicMode,
    /// Messages kept in memory before writes answer `BrokerBusy`.
    pub capacity: usize,
    /// Messages `recycle_buffer` keeps at least.
    pub retain_count: usize,
    pub recycle_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            topic_mode: TopicMode::Normal,
            capacity: 1_000_000,
            retain_count: 100_000,
            recycle_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub partition: PartitionConfig,
    pub long_poll: LongPollConfig,
    pub mirror: MirrorConfig,
    pub writer_version: WriterVersionConfig,
    pub store: StoreConfig,
}

impl BrokerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<BrokerConfig> {
        let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
            "config file path: {}",
            path.as_ref().to_string_lossy()
        )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;

        let broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.validate()?;
        Ok(broker_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let partition = &self.partition;
        if partition.partition_count == 0 || partition.partition_id >= partition.partition_count {
            return Err(AppError::InvalidValue(format!(
                "partition {} of {}",
                partition.partition_id, partition.partition_count
            )));
        }
        if partition.range_count < partition.partition_count {
            return Err(AppError::InvalidValue(format!(
                "range count {} below partition count {}",
                partition.range_count, partition.partition_count
            )));
        }
        if self.long_poll.maintenance_interval_ms == 0 || self.store.recycle_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "maintenance intervals must be positive".to_string(),
            ));
        }
        if self.mirror.backoff_base_ms > self.mirror.backoff_max_ms {
            return Err(AppError::InvalidValue(format!(
                "mirror backoff base {}ms above max {}ms",
                self.mirror.backoff_base_ms, self.mirror.backoff_max_ms
            )));
        }
        Ok(())
    }
}
