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

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::{PartitionController, PartitionStatus};
use crate::request::ErrorKind;
use crate::service::Shutdown;
use crate::store::TopicMode;

impl PartitionController {
    /// Spawns the periodic work of the partition: answering expired long
    /// polls, waking ready ones and recycling the store.
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let shutdown = self.shutdown.subscribe();
        let controller = self.clone();
        tokio::spawn(async move { controller.maintenance_task(shutdown).await })
    }

    async fn maintenance_task(&self, mut shutdown: Shutdown) {
        let mut poll_interval = interval(Duration::from_millis(
            self.config.long_poll.maintenance_interval_ms.max(1),
        ));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut recycle_interval = interval(Duration::from_millis(
            self.config.store.recycle_interval_ms.max(1),
        ));
        recycle_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    let expired = self.sweep_timeouts();
                    let woken = self.activate_ready();
                    if expired + woken > 0 {
                        trace!(
                            "partition {} long poll tick: {} expired, {} woken",
                            self.identity, expired, woken
                        );
                    }
                }
                _ = recycle_interval.tick() => {
                    self.recycle_buffer();
                    let result = self.recycle_file();
                    if !result.is_ok() {
                        trace!("partition {} recycle file: {:?}", self.identity, result);
                    }
                }
                _ = shutdown.recv() => {}
            }
            if shutdown.is_shutdown() {
                info!("partition {} maintenance task stopped", self.identity);
                break;
            }
        }
    }

    /// Releases buffered messages, frozen once the partition failed.
    pub fn recycle_buffer(&self) -> usize {
        if self.status() == PartitionStatus::Error {
            return 0;
        }
        let released = self.store.recycle_buffer();
        if released > 0 {
            debug!("partition {} released {} messages", self.identity, released);
        }
        released
    }

    /// Memory-only topics have no files, the store is not asked.
    pub fn recycle_file(&self) -> ErrorKind {
        if self.status() == PartitionStatus::Error {
            return ErrorKind::PartitionNotRunning;
        }
        if self.store.topic_mode() == TopicMode::MemoryOnly {
            return ErrorKind::None;
        }
        let result = self.store.recycle_file();
        if result == ErrorKind::Unknown {
            self.set_error("recycle file failed");
        }
        result
    }
}
