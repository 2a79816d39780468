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

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{MessageIdInfo, MessageStore, TopicMode};
use crate::message::{Message, MessageBatch, MessageContainer};
use crate::request::{ConsumptionRequest, ErrorKind, ProductionRequest};
use crate::service::StoreConfig;

/// Keeps a partition's messages in memory.
///
/// Ids are contiguous: `messages[i].id == first_id + i`. Recycling drops
/// messages from the front, readers behind `first_id` get `SomeMessageLost`.
#[derive(Debug)]
pub struct MemoryMessageStore {
    topic_mode: TopicMode,
    capacity: usize,
    retain_count: usize,
    session_id: AtomicCell<i64>,
    committed_msg_id: AtomicCell<i64>,
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    messages: VecDeque<Message>,
    first_id: i64,
    next_id: i64,
    last_timestamp: i64,
}

impl StoreInner {
    fn get(&self, id: i64) -> Option<&Message> {
        if id < self.first_id {
            return None;
        }
        self.messages.get((id - self.first_id) as usize)
    }

    fn max_id_info(&self, max_id: i64) -> MessageIdInfo {
        if max_id < 0 {
            return MessageIdInfo::default();
        }
        let timestamp = self
            .get(max_id)
            .map(|message| message.timestamp)
            .unwrap_or(self.last_timestamp);
        MessageIdInfo {
            msg_id: max_id,
            timestamp,
        }
    }
}

impl MemoryMessageStore {
    pub fn new(config: &StoreConfig) -> Self {
        MemoryMessageStore {
            topic_mode: config.topic_mode,
            capacity: config.capacity,
            retain_count: config.retain_count,
            session_id: AtomicCell::new(new_session_id(0)),
            committed_msg_id: AtomicCell::new(-1),
            inner: RwLock::new(StoreInner {
                last_timestamp: -1,
                ..Default::default()
            }),
        }
    }

    /// Starts a new session, clients of the old one have to reset.
    pub fn rotate_session(&self) -> i64 {
        let session_id = new_session_id(self.session_id.load());
        self.session_id.store(session_id);
        debug!("store session rotated to {}", session_id);
        session_id
    }

    /// Makes messages up to `msg_id` visible in security mode.
    pub fn commit_up_to(&self, msg_id: i64) -> i64 {
        let max_id = self.inner.read().next_id - 1;
        let committed = msg_id.min(max_id).max(self.committed_msg_id.load());
        self.committed_msg_id.store(committed);
        committed
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn visible_max_id(&self, inner: &StoreInner) -> i64 {
        match self.topic_mode {
            TopicMode::Security => self.committed_msg_id.load().min(inner.next_id - 1),
            _ => inner.next_id - 1,
        }
    }
}

fn new_session_id(previous: i64) -> i64 {
    chrono::Utc::now().timestamp_micros().max(previous + 1)
}

impl MessageStore for MemoryMessageStore {
    fn get_messages(
        &self,
        request: &ConsumptionRequest,
        timeout: Duration,
    ) -> (ErrorKind, MessageBatch) {
        let mut batch = MessageBatch::empty();
        batch.next_msg_id = request.start_id;
        let Some(inner) = self.inner.try_read_for(timeout) else {
            return (ErrorKind::BrokerBusy, batch);
        };
        let visible_max = self.visible_max_id(&inner);
        let max_info = inner.max_id_info(visible_max);
        batch.max_msg_id = max_info.msg_id;
        batch.max_timestamp = max_info.timestamp;

        if request.start_id < 0 {
            return (ErrorKind::InvalidRequest, batch);
        }
        if request.start_id < inner.first_id {
            batch.next_msg_id = inner.first_id;
            return (ErrorKind::SomeMessageLost, batch);
        }
        if request.start_id > visible_max {
            return (ErrorKind::NoData, batch);
        }

        let filter = &request.filter;
        let count = request.count.max(1) as usize;
        let start = (request.start_id - inner.first_id) as usize;
        let end = (visible_max - inner.first_id + 1) as usize;
        let mut selected = Vec::new();
        let mut last_scanned = request.start_id - 1;
        for message in inner.messages.range(start..end) {
            last_scanned = message.id;
            let wanted = if message.merged {
                filter.may_contain(message.uint16_payload)
            } else {
                filter.matches(message.uint16_payload, message.uint8_mask)
            };
            if wanted {
                selected.push(message.clone());
                if selected.len() == count {
                    break;
                }
            }
        }
        batch.next_msg_id = last_scanned + 1;
        batch.next_timestamp = inner
            .get(batch.next_msg_id)
            .or_else(|| inner.get(last_scanned))
            .map(|message| message.timestamp)
            .unwrap_or(-1);
        trace!(
            "read {} of {} scanned messages from {}",
            selected.len(),
            last_scanned - request.start_id + 1,
            request.start_id
        );
        if selected.is_empty() {
            return (ErrorKind::NoData, batch);
        }
        batch.set_container(MessageContainer::from_messages(
            selected,
            request.message_format,
        ));
        (ErrorKind::None, batch)
    }

    /// Replicated messages keep their ids. Ids already stored are skipped, a
    /// gap behind stored messages stops the append with `SomeMessageLost`.
    fn add_message(&self, request: &ProductionRequest) -> ErrorKind {
        let Some(msgs) = &request.msgs else {
            return ErrorKind::InvalidRequest;
        };
        if msgs.is_empty() {
            return ErrorKind::None;
        }
        let mut inner = self.inner.write();
        if inner.messages.len() + msgs.len() > self.capacity {
            debug!(
                "store holds {} messages, {} more exceed the capacity {}",
                inner.messages.len(),
                msgs.len(),
                self.capacity
            );
            return ErrorKind::BrokerBusy;
        }

        let now = chrono::Utc::now().timestamp_micros();
        let mut result = ErrorKind::None;
        for mut message in msgs.messages() {
            if request.replication_mode {
                if message.id < inner.next_id {
                    trace!("skip replicated message {}, already stored", message.id);
                    continue;
                }
                if message.id > inner.next_id {
                    if !inner.messages.is_empty() {
                        result = ErrorKind::SomeMessageLost;
                        break;
                    }
                    inner.first_id = message.id;
                    inner.next_id = message.id;
                }
            } else {
                message.id = inner.next_id;
                if message.timestamp <= 0 {
                    message.timestamp = now;
                }
            }
            inner.last_timestamp = message.timestamp;
            inner.next_id += 1;
            inner.messages.push_back(message);
        }
        if self.topic_mode != TopicMode::Security {
            self.committed_msg_id.store(inner.next_id - 1);
        }
        result
    }

    fn get_max_message_id(&self) -> MessageIdInfo {
        let inner = self.inner.read();
        inner.max_id_info(inner.next_id - 1)
    }

    fn get_min_message_id_by_time(&self, timestamp: i64) -> (ErrorKind, MessageIdInfo) {
        let inner = self.inner.read();
        match inner.messages.iter().find(|m| m.timestamp >= timestamp) {
            Some(message) => (
                ErrorKind::None,
                MessageIdInfo {
                    msg_id: message.id,
                    timestamp: message.timestamp,
                },
            ),
            None => (ErrorKind::NoData, inner.max_id_info(inner.next_id - 1)),
        }
    }

    fn recycle_buffer(&self) -> usize {
        let mut inner = self.inner.write();
        let mut excess = inner.messages.len().saturating_sub(self.retain_count);
        if self.topic_mode == TopicMode::Security {
            // uncommitted messages stay
            let committed = (self.committed_msg_id.load() - inner.first_id + 1).max(0) as usize;
            excess = excess.min(committed);
        }
        if excess > 0 {
            inner.messages.drain(..excess);
            inner.first_id += excess as i64;
            debug!("recycled {} messages, first id now {}", excess, inner.first_id);
        }
        excess
    }

    fn recycle_file(&self) -> ErrorKind {
        trace!("memory store keeps no files");
        ErrorKind::None
    }

    fn committed_msg_id(&self) -> i64 {
        self.committed_msg_id.load()
    }

    fn topic_mode(&self) -> TopicMode {
        self.topic_mode
    }

    fn session_id(&self) -> i64 {
        self.session_id.load()
    }
}
