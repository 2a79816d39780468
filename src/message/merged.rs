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

//! Merged messages.
//!
//! A merged message packs several small sub-messages of one merge bucket into
//! a single stored message:
//!
//! - Tag (2 bytes): sub-message count, the high bit marks a compressed region
//! - Region, one entry per sub-message, lz4 compressed as a whole when the
//!   tag says so:
//!   - Uint16 payload (2 bytes)
//!   - Uint8 mask (1 byte)
//!   - Data length (varint)
//!   - Data (variable length)

use bytes::{BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::compress::compress_merged_region;
use crate::message::constants::{MAX_MERGED_SUBS, MERGED_COMPRESSED_BIT, MERGED_TAG_LENGTH};
use crate::message::Message;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubMessage {
    pub uint16_payload: u16,
    pub uint8_mask: u8,
    pub data: Bytes,
}

impl SubMessage {
    pub fn new(data: impl Into<Bytes>, uint16_payload: u16, uint8_mask: u8) -> Self {
        SubMessage {
            uint16_payload,
            uint8_mask,
            data: data.into(),
        }
    }

    /// Expands into a plain message that keeps the parent's id and timestamp.
    pub fn into_message(self, parent: &Message, index: u16) -> Message {
        Message {
            id: parent.id,
            timestamp: parent.timestamp,
            data: self.data,
            uint16_payload: self.uint16_payload,
            uint8_mask: self.uint8_mask,
            compress: false,
            merged: false,
            offset_in_raw_msg: index,
        }
    }
}

/// Writes tag and uncompressed region.
pub fn encode_merged(subs: &[SubMessage]) -> AppResult<Bytes> {
    if subs.len() > MAX_MERGED_SUBS {
        return Err(AppError::InvalidValue(format!(
            "{} sub messages do not fit a merged message",
            subs.len()
        )));
    }
    let size: usize = subs.iter().map(|sub| sub.data.len() + 8).sum();
    let mut buffer = BytesMut::with_capacity(MERGED_TAG_LENGTH + size);
    buffer.put_u16(subs.len() as u16);
    for sub in subs {
        buffer.put_u16(sub.uint16_payload);
        buffer.put_u8(sub.uint8_mask);
        buffer.put_slice(&(sub.data.len() as u64).encode_var_vec());
        buffer.put_slice(&sub.data);
    }
    Ok(buffer.freeze())
}

/// Parses tag and uncompressed region. Sub-message data shares `data`.
pub fn split_merged(data: &Bytes) -> AppResult<Vec<SubMessage>> {
    if data.len() < MERGED_TAG_LENGTH {
        return Err(AppError::InvalidValue(format!(
            "merged message of {} bytes has no tag",
            data.len()
        )));
    }
    let tag = u16::from_be_bytes([data[0], data[1]]);
    if tag & MERGED_COMPRESSED_BIT != 0 {
        return Err(AppError::InvalidValue(
            "merged region is still compressed".to_string(),
        ));
    }
    let count = tag as usize;
    let mut subs = Vec::with_capacity(count.min(data.len() / 4));
    let mut pos = MERGED_TAG_LENGTH;
    while pos < data.len() {
        let index = subs.len();
        let head = data
            .get(pos..pos + 3)
            .ok_or_else(|| truncated(pos, "header", index))?;
        let uint16_payload = u16::from_be_bytes([head[0], head[1]]);
        let uint8_mask = head[2];
        pos += 3;
        let (len, read_size) =
            u64::decode_var(&data[pos..]).ok_or_else(|| truncated(pos, "length", index))?;
        pos += read_size;
        let end = pos
            .checked_add(len as usize)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| truncated(pos, "data", index))?;
        subs.push(SubMessage {
            uint16_payload,
            uint8_mask,
            data: data.slice(pos..end),
        });
        pos = end;
    }
    if subs.len() != count {
        return Err(AppError::InvalidValue(format!(
            "merged tag announces {} sub messages, region holds {}",
            count,
            subs.len()
        )));
    }
    Ok(subs)
}

fn truncated(pos: usize, what: &str, index: usize) -> AppError {
    AppError::InvalidValue(format!(
        "merged region truncated at {} reading {} of sub message {}",
        pos, what, index
    ))
}

/// Producer side batching of small messages into one merged message.
#[derive(Debug, Default)]
pub struct MergedMessageBuilder {
    compress_threshold: usize,
    subs: Vec<SubMessage>,
}

impl MergedMessageBuilder {
    pub fn new(compress_threshold: usize) -> Self {
        MergedMessageBuilder {
            compress_threshold,
            subs: Vec::new(),
        }
    }

    pub fn add(&mut self, sub: SubMessage) -> AppResult<()> {
        if self.subs.len() == MAX_MERGED_SUBS {
            return Err(AppError::InvalidValue(
                "merged message is full".to_string(),
            ));
        }
        self.subs.push(sub);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Drains the collected sub-messages into one merged message.
    ///
    /// The message carries the highest sub payload and the union of the sub
    /// masks, the region is compressed when that shrinks it.
    pub fn build(&mut self, id: i64, timestamp: i64) -> AppResult<Message> {
        if self.subs.is_empty() {
            return Err(AppError::IllegalStateError(
                "no sub message to merge".to_string(),
            ));
        }
        let subs = std::mem::take(&mut self.subs);
        let raw = encode_merged(&subs)?;
        let uint16_payload = subs.iter().map(|s| s.uint16_payload).max().unwrap_or(0);
        let uint8_mask = subs.iter().fold(0, |mask, s| mask | s.uint8_mask);
        let (data, compress) = match compress_merged_region(self.compress_threshold, &raw) {
            Some(compressed) => (compressed, true),
            None => (raw, false),
        };
        Ok(Message {
            id,
            timestamp,
            data,
            uint16_payload,
            uint8_mask,
            compress,
            merged: true,
            offset_in_raw_msg: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::decompress_merged_region;

    fn subs() -> Vec<SubMessage> {
        vec![
            SubMessage::new("alpha", 10, 1),
            SubMessage::new(vec![b'x'; 400], 300, 4),
            SubMessage::new(Bytes::new(), 20, 0),
        ]
    }

    #[test]
    fn test_split_round_trip() {
        let encoded = encode_merged(&subs()).unwrap();
        assert_eq!(split_merged(&encoded).unwrap(), subs());
    }

    #[test]
    fn test_split_rejects_malformed_region() {
        let encoded = encode_merged(&subs()).unwrap();
        assert!(split_merged(&encoded.slice(..1)).is_err());
        assert!(split_merged(&encoded.slice(..encoded.len() - 1)).is_err());

        let mut wrong_count = BytesMut::from(&encoded[..]);
        wrong_count[1] = 7;
        assert!(split_merged(&wrong_count.freeze()).is_err());

        let mut compressed_tag = BytesMut::from(&encoded[..]);
        compressed_tag[0] |= 0x80;
        assert!(split_merged(&compressed_tag.freeze()).is_err());
    }

    #[test]
    fn test_builder_compresses_large_region() {
        let mut builder = MergedMessageBuilder::new(64);
        for sub in subs() {
            builder.add(sub).unwrap();
        }
        let message = builder.build(7, 1000).unwrap();
        assert!(builder.is_empty());
        assert!(message.merged);
        assert!(message.compress);
        assert_eq!(message.uint16_payload, 300);
        assert_eq!(message.uint8_mask, 5);

        let raw = decompress_merged_region(&message.data).unwrap();
        assert_eq!(split_merged(&raw).unwrap(), subs());
    }

    #[test]
    fn test_builder_keeps_small_region_plain() {
        let mut builder = MergedMessageBuilder::new(1024);
        builder.add(SubMessage::new("tiny", 1, 0)).unwrap();
        let message = builder.build(1, 1).unwrap();
        assert!(!message.compress);
        assert_eq!(split_merged(&message.data).unwrap().len(), 1);
        assert!(builder.build(2, 2).is_err());
    }

    #[test]
    fn test_sub_message_expansion_keeps_parent_identity() {
        let parent = Message::new("ignored").with_id(42, 99);
        let expanded = SubMessage::new("child", 5, 2).into_message(&parent, 3);
        assert_eq!(expanded.id, 42);
        assert_eq!(expanded.timestamp, 99);
        assert_eq!(expanded.offset_in_raw_msg, 3);
        assert!(!expanded.merged);
    }
}
