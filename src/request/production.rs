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

use bytes::Bytes;

use crate::message::MessageContainer;

/// Messages a producer, or the mirror loop, appends to a partition.
///
/// Either `msgs` or `compressed_msgs` is set. Ids and timestamps of `msgs`
/// are assigned by the store unless `replication_mode` is set, in which case
/// they are kept from the source.
#[derive(Debug, Clone, Default)]
pub struct ProductionRequest {
    pub msgs: Option<MessageContainer>,
    pub compressed_msgs: Option<Bytes>,
    pub writer_name: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub session_id: i64,
    pub replication_mode: bool,
}

impl ProductionRequest {
    pub fn new(msgs: MessageContainer) -> Self {
        ProductionRequest {
            msgs: Some(msgs),
            ..Default::default()
        }
    }

    pub fn with_writer(mut self, writer_name: impl Into<String>, major: u32, minor: u32) -> Self {
        self.writer_name = writer_name.into();
        self.major_version = major;
        self.minor_version = minor;
        self
    }

    pub fn msg_count(&self) -> usize {
        self.msgs.as_ref().map(|msgs| msgs.len()).unwrap_or(0)
    }
}
