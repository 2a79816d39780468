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

use crate::message::MessageBatch;

/// What a read or a write hands back next to its `ErrorKind`.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub batch: MessageBatch,
    pub accepted_msg_count: u32,
    pub committed_msg_id: i64,
    pub session_id: i64,
    /// compressed / uncompressed size of the whole-batch compression
    pub compress_ratio: f32,
    /// compressed / uncompressed size of the per-message decompression
    pub decompress_ratio: f32,
}

impl Default for MessageResponse {
    fn default() -> Self {
        MessageResponse {
            batch: MessageBatch::empty(),
            accepted_msg_count: 0,
            committed_msg_id: -1,
            session_id: 0,
            compress_ratio: 1.0,
            decompress_ratio: 1.0,
        }
    }
}

impl MessageResponse {
    pub fn with_session(session_id: i64) -> Self {
        MessageResponse {
            session_id,
            ..Default::default()
        }
    }
}
