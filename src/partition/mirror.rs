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

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use rand::Rng;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::PartitionController;
use crate::message::{Message, MessageContainer, MessageFormat};
use crate::request::{ErrorKind, ProductionRequest};
use crate::service::{MirrorConfig, Shutdown};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// The partition takes writes from producers.
    Disabled,
    /// Only the mirror loop writes, reads depend on `read_during_bootstrap`.
    Bootstrapping,
    Synced,
}

/// Decides who may touch a mirrored partition.
#[derive(Debug)]
pub struct MirrorGate {
    state: AtomicCell<MirrorState>,
    read_during_bootstrap: bool,
}

impl MirrorGate {
    pub fn new(config: &MirrorConfig) -> Self {
        let state = if config.enabled {
            MirrorState::Bootstrapping
        } else {
            MirrorState::Disabled
        };
        MirrorGate {
            state: AtomicCell::new(state),
            read_during_bootstrap: config.read_during_bootstrap,
        }
    }

    pub fn state(&self) -> MirrorState {
        self.state.load()
    }

    pub fn can_write(&self, replication_mode: bool) -> bool {
        match self.state() {
            MirrorState::Bootstrapping => replication_mode,
            MirrorState::Disabled | MirrorState::Synced => true,
        }
    }

    pub fn can_read(&self) -> bool {
        self.state() != MirrorState::Bootstrapping || self.read_during_bootstrap
    }

    /// Returns false when the gate was not bootstrapping.
    pub fn mark_synced(&self) -> bool {
        self.state
            .compare_exchange(MirrorState::Bootstrapping, MirrorState::Synced)
            .is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MirrorPull {
    /// Messages with their source ids, ascending.
    pub messages: Vec<Message>,
    /// The source has nothing newer than the last pulled message.
    pub caught_up: bool,
}

pub type MirrorFuture<'a> = Pin<Box<dyn Future<Output = AppResult<MirrorPull>> + Send + 'a>>;

/// Where a mirrored partition pulls its messages from.
pub trait MirrorSource: Send + Sync + Debug {
    fn pull(&self, start_id: i64, count: u32) -> MirrorFuture<'_>;
}

/// Exponential backoff with up to 50% jitter either way.
pub(crate) fn backoff_delay(config: &MirrorConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = config
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.backoff_max_ms)
        .max(1);
    let jittered = rand::thread_rng().gen_range(base / 2..=base + base / 2);
    Duration::from_millis(jittered.min(config.backoff_max_ms.max(1)))
}

impl PartitionController {
    /// Pulls from `source` until it reports being caught up, then opens the
    /// partition to producers.
    pub async fn mirror_task(
        self: Arc<Self>,
        source: Arc<dyn MirrorSource>,
        mut shutdown: Shutdown,
    ) -> AppResult<()> {
        let config = self.config.mirror.clone();
        let mut pull_interval = interval(Duration::from_millis(config.pull_interval_ms.max(1)));
        pull_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;
        info!("{} mirror bootstrap started", self.identity);

        loop {
            tokio::select! {
                _ = pull_interval.tick() => {
                    trace!("{} mirror pull tick", self.identity);
                }
                _ = shutdown.recv() => {}
            }
            if shutdown.is_shutdown() {
                info!("{} mirror task stopped by shutdown", self.identity);
                return Ok(());
            }
            if self.mirror.state() != MirrorState::Bootstrapping {
                return Ok(());
            }

            let start_id = self.store.get_max_message_id().msg_id + 1;
            let failure = match source.pull(start_id, config.pull_batch_size).await {
                Ok(pull) => {
                    let result = self.write_mirrored(pull.messages, start_id);
                    if result.is_ok() {
                        failures = 0;
                        if pull.caught_up {
                            self.finish_bootstrap();
                            return Ok(());
                        }
                        continue;
                    }
                    if !result.is_transient() {
                        let reason = format!("mirror write from {} rejected: {}", start_id, result);
                        self.set_error(&reason);
                        return Err(AppError::IllegalStateError(reason));
                    }
                    format!("mirror write from {} answered {}", start_id, result)
                }
                Err(e) => format!("mirror pull from {} failed: {}", start_id, e),
            };

            failures += 1;
            let delay = backoff_delay(&config, failures);
            warn!(
                "{} {}, {} failures in a row, retry in {:?}",
                self.identity, failure, failures, delay
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => {}
            }
        }
    }

    fn write_mirrored(&self, messages: Vec<Message>, start_id: i64) -> ErrorKind {
        if messages.is_empty() {
            return ErrorKind::None;
        }
        let count = messages.len();
        let mut request = ProductionRequest::new(MessageContainer::from_messages(
            messages,
            MessageFormat::Tree,
        ));
        request.replication_mode = true;
        let (result, _) = self.handle_write(request);
        if result.is_ok() {
            debug!("{} mirrored {} messages from {}", self.identity, count, start_id);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirror_config(enabled: bool, read_during_bootstrap: bool) -> MirrorConfig {
        MirrorConfig {
            enabled,
            read_during_bootstrap,
            ..Default::default()
        }
    }

    #[test]
    fn test_gate_while_bootstrapping() {
        let gate = MirrorGate::new(&mirror_config(true, false));
        assert_eq!(gate.state(), MirrorState::Bootstrapping);
        assert!(!gate.can_write(false));
        assert!(gate.can_write(true));
        assert!(!gate.can_read());
        assert!(MirrorGate::new(&mirror_config(true, true)).can_read());

        assert!(gate.mark_synced());
        assert!(!gate.mark_synced());
        assert!(gate.can_write(false));
        assert!(gate.can_read());
    }

    #[test]
    fn test_disabled_gate_is_open() {
        let gate = MirrorGate::new(&mirror_config(false, false));
        assert_eq!(gate.state(), MirrorState::Disabled);
        assert!(gate.can_write(false));
        assert!(gate.can_read());
        assert!(!gate.mark_synced());
    }

    #[test]
    fn test_backoff_stays_bounded() {
        let config = MirrorConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..Default::default()
        };
        for failures in 1..40 {
            let delay = backoff_delay(&config, failures);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(1_000));
        }
        assert!(backoff_delay(&config, 1) <= Duration::from_millis(150));
    }
}
