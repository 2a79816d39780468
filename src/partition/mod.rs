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

//! One partition of a topic.
//!
//! The `PartitionController` owns the store of the partition and runs every
//! read and write through the same pipeline: status and mirror checks,
//! session checks, writer versions, (de)compression, unmerging and field
//! filtering. Reads that find nothing may park in the long-poll queue until a
//! write wakes them up or they expire.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::message::PartitionIdentity;
use crate::request::{ConsumptionRequest, ErrorKind, MessageResponse};
use crate::service::{BrokerConfig, ShutdownNotifier};
use crate::store::{
    KvWriterVersionStore, MemoryMessageStore, MessageStore, TopicMode, WriterVersionStore,
};
use crate::{AppError, AppResult};

pub use long_poll::{LongPollEntry, LongPollQueue};
pub use mirror::{MirrorFuture, MirrorGate, MirrorPull, MirrorSource, MirrorState};
pub use unmerge::MessageUnmerger;

mod long_poll;
mod mirror;
mod read;
mod tasks;
mod unmerge;
mod write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Recovering,
    Running,
    /// Read only, readers past the end get `SealedTopicReadFinish`.
    Sealed,
    /// The store failed unrecoverably.
    Error,
}

/// A read waiting in the long-poll queue.
#[derive(Debug)]
pub struct PendingRead {
    pub request: ConsumptionRequest,
    pub responder: oneshot::Sender<(ErrorKind, MessageResponse)>,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub struct PartitionController {
    identity: PartitionIdentity,
    config: BrokerConfig,
    status: AtomicCell<PartitionStatus>,
    store: Arc<dyn MessageStore>,
    writer_versions: Arc<dyn WriterVersionStore>,
    long_poll: LongPollQueue<PendingRead>,
    mirror: MirrorGate,
    shutdown: ShutdownNotifier,
}

impl PartitionController {
    pub fn new(
        identity: PartitionIdentity,
        config: &BrokerConfig,
        store: Arc<dyn MessageStore>,
        writer_versions: Arc<dyn WriterVersionStore>,
    ) -> Self {
        PartitionController {
            identity,
            config: config.clone(),
            status: AtomicCell::new(PartitionStatus::Recovering),
            store,
            writer_versions,
            long_poll: LongPollQueue::new(),
            mirror: MirrorGate::new(&config.mirror),
            shutdown: ShutdownNotifier::default(),
        }
    }

    /// Builds the partition described by `config` on top of an in-memory
    /// store, and initializes it.
    pub fn from_config(config: &BrokerConfig) -> AppResult<Arc<Self>> {
        config.validate()?;
        let partition = &config.partition;
        let identity = PartitionIdentity::new(
            partition.topic_name.clone(),
            partition.partition_id,
            partition.partition_count,
            partition.range_count,
        )?;
        let store = Arc::new(MemoryMessageStore::new(&config.store));
        let writer_versions = Arc::new(KvWriterVersionStore::open(
            &config.writer_version.kv_store_path,
        )?);
        let controller = Arc::new(PartitionController::new(
            identity,
            config,
            store,
            writer_versions,
        ));
        controller.init()?;
        Ok(controller)
    }

    /// A mirrored partition stays `Recovering` until its bootstrap finished.
    pub fn init(&self) -> AppResult<()> {
        let status = self.status();
        if status != PartitionStatus::Recovering {
            return Err(AppError::IllegalStateError(format!(
                "init partition {} in status {:?}",
                self.identity, status
            )));
        }
        let max = self.store.get_max_message_id();
        if self.mirror.state() == MirrorState::Bootstrapping {
            info!(
                "partition {} waits for mirror bootstrap, max id {}",
                self.identity, max.msg_id
            );
        } else {
            self.status.store(PartitionStatus::Running);
            info!("partition {} running, max id {}", self.identity, max.msg_id);
        }
        Ok(())
    }

    pub fn identity(&self) -> &PartitionIdentity {
        &self.identity
    }

    pub fn status(&self) -> PartitionStatus {
        self.status.load()
    }

    pub fn mirror_state(&self) -> MirrorState {
        self.mirror.state()
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn pending_reads(&self) -> usize {
        self.long_poll.len()
    }

    /// Stops writes for good and answers every parked read.
    pub fn seal(&self) -> AppResult<()> {
        match self.status() {
            PartitionStatus::Running => {}
            PartitionStatus::Sealed => return Ok(()),
            status => {
                return Err(AppError::PartitionNotRunning(format!(
                    "seal partition {} in status {:?}",
                    self.identity, status
                )))
            }
        }
        self.status.store(PartitionStatus::Sealed);
        let pending = self.long_poll.steal_all();
        info!(
            "partition {} sealed, answering {} parked reads",
            self.identity,
            pending.len()
        );
        self.complete_reads(pending);
        Ok(())
    }

    pub(crate) fn set_error(&self, reason: &str) {
        error!("partition {} failed: {}", self.identity, reason);
        self.status.store(PartitionStatus::Error);
    }

    pub(crate) fn finish_bootstrap(&self) {
        if !self.mirror.mark_synced() {
            return;
        }
        if self
            .status
            .compare_exchange(PartitionStatus::Recovering, PartitionStatus::Running)
            .is_ok()
        {
            info!("partition {} caught up with its mirror source", self.identity);
        } else {
            warn!(
                "partition {} caught up in status {:?}",
                self.identity,
                self.status()
            );
        }
    }

    /// Highest id parked readers may be woken up for.
    pub(crate) fn readable_max_id(&self) -> i64 {
        let max_id = self.store.get_max_message_id().msg_id;
        match self.store.topic_mode() {
            TopicMode::Security => self.store.committed_msg_id().min(max_id),
            _ => max_id,
        }
    }

    /// Spawns the task that mirrors `source` into this partition.
    pub fn start_mirror(
        self: &Arc<Self>,
        source: Arc<dyn MirrorSource>,
    ) -> AppResult<JoinHandle<AppResult<()>>> {
        if self.mirror.state() != MirrorState::Bootstrapping {
            return Err(AppError::IllegalStateError(format!(
                "partition {} has no mirror to bootstrap from",
                self.identity
            )));
        }
        let shutdown = self.shutdown.subscribe();
        let controller = self.clone();
        Ok(tokio::spawn(controller.mirror_task(source, shutdown)))
    }

    /// Stops the background tasks and answers every parked read.
    pub fn shutdown(&self) {
        self.shutdown.notify();
        let pending = self.long_poll.steal_all();
        let session_id = self.store.session_id();
        for entry in pending {
            let _ = entry
                .pending
                .responder
                .send((ErrorKind::NoData, MessageResponse::with_session(session_id)));
        }
        info!("partition {} shut down", self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MirrorConfig;

    pub(crate) fn controller_with(config: &BrokerConfig) -> PartitionController {
        let identity = PartitionIdentity::new("topic", 0, 1, 64).unwrap();
        let store = Arc::new(MemoryMessageStore::new(&config.store));
        let controller = PartitionController::new(
            identity,
            config,
            store,
            Arc::new(KvWriterVersionStore::in_memory()),
        );
        controller.init().unwrap();
        controller
    }

    #[test]
    fn test_lifecycle() {
        let controller = controller_with(&BrokerConfig::default());
        assert_eq!(controller.status(), PartitionStatus::Running);
        assert!(controller.init().is_err());
        controller.seal().unwrap();
        assert_eq!(controller.status(), PartitionStatus::Sealed);
        controller.seal().unwrap();
    }

    #[test]
    fn test_mirrored_partition_recovers_until_synced() {
        let config = BrokerConfig {
            mirror: MirrorConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let controller = controller_with(&config);
        assert_eq!(controller.status(), PartitionStatus::Recovering);
        assert!(controller.seal().is_err());
        controller.finish_bootstrap();
        assert_eq!(controller.status(), PartitionStatus::Running);
        assert_eq!(controller.mirror_state(), MirrorState::Synced);
    }

    #[test]
    fn test_error_status_is_sticky() {
        let controller = controller_with(&BrokerConfig::default());
        controller.set_error("disk gone");
        assert!(controller.seal().is_err());
        assert_eq!(controller.status(), PartitionStatus::Error);
    }
}
