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

use crate::message::constants::{FLAG_COMPRESS, FLAG_MERGED};

/// The atomic unit stored in a partition.
///
/// `id` is the per-partition sequence number. A message expanded from a merged
/// message keeps the parent's id and records its position in
/// `offset_in_raw_msg`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub timestamp: i64,
    pub data: Bytes,
    pub uint16_payload: u16,
    pub uint8_mask: u8,
    pub compress: bool,
    pub merged: bool,
    pub offset_in_raw_msg: u16,
}

impl Message {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Message {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, uint16_payload: u16, uint8_mask: u8) -> Self {
        self.uint16_payload = uint16_payload;
        self.uint8_mask = uint8_mask;
        self
    }

    pub fn with_id(mut self, id: i64, timestamp: i64) -> Self {
        self.id = id;
        self.timestamp = timestamp;
        self
    }

    pub(crate) fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.compress {
            flags |= FLAG_COMPRESS;
        }
        if self.merged {
            flags |= FLAG_MERGED;
        }
        flags
    }

    pub(crate) fn set_flags(&mut self, flags: u8) {
        self.compress = flags & FLAG_COMPRESS != 0;
        self.merged = flags & FLAG_MERGED != 0;
    }
}
