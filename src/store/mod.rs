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

//! The storage seam of a partition.
//!
//! A `MessageStore` persists and serves the messages of one partition, a
//! `WriterVersionStore` remembers the newest version of every writer. The
//! partition controller only sees the traits; `MemoryMessageStore` and
//! `KvWriterVersionStore` are the in-process implementations.

use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::MessageBatch;
use crate::request::{ConsumptionRequest, ErrorKind, ProductionRequest};

pub use memory_store::MemoryMessageStore;
pub use writer_version::{KvWriterVersionStore, WriterVersionStore};

mod memory_store;
mod writer_version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicMode {
    #[default]
    Normal,
    /// Nothing ever reaches a file, file recycling has nothing to do.
    MemoryOnly,
    /// Readers only see messages up to the committed id.
    Security,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageIdInfo {
    pub msg_id: i64,
    pub timestamp: i64,
}

impl Default for MessageIdInfo {
    fn default() -> Self {
        MessageIdInfo {
            msg_id: -1,
            timestamp: -1,
        }
    }
}

/// Calls may block up to the deadline they are given.
pub trait MessageStore: Send + Sync + Debug {
    fn get_messages(&self, request: &ConsumptionRequest, timeout: Duration)
        -> (ErrorKind, MessageBatch);

    /// `request.msgs` is already decompressed.
    fn add_message(&self, request: &ProductionRequest) -> ErrorKind;

    fn get_max_message_id(&self) -> MessageIdInfo;

    /// First message stored at or after `timestamp`.
    fn get_min_message_id_by_time(&self, timestamp: i64) -> (ErrorKind, MessageIdInfo);

    /// Releases in-memory messages, returns how many.
    fn recycle_buffer(&self) -> usize;

    fn recycle_file(&self) -> ErrorKind;

    fn committed_msg_id(&self) -> i64;

    fn topic_mode(&self) -> TopicMode;

    /// Changes whenever the store lost its continuity, clients holding an
    /// older session have to reset their cursors.
    fn session_id(&self) -> i64;
}
