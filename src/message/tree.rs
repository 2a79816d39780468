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

/// The tree container: an owned, mutable sequence of messages.
///
/// Compression, projection and unmerging rewrite `data`/`compress` in place,
/// which is why they always operate on a `TreeBatch`.
use bytes::{BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::message::constants::TREE_MAGIC;
use crate::message::{CodecError, Message};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeBatch {
    pub messages: Vec<Message>,
}

impl TreeBatch {
    pub fn new(messages: Vec<Message>) -> Self {
        TreeBatch { messages }
    }

    pub fn decode(buffer: &Bytes) -> Result<TreeBatch, CodecError> {
        let mut reader = TreeReader { buffer, pos: 0 };
        let magic = reader.read_u8()?;
        if magic != TREE_MAGIC {
            return Err(CodecError::Malformed(format!(
                "unexpected tree magic {:#x}",
                magic
            )));
        }
        let count = reader.read_var_u64()? as usize;
        // every record takes at least 8 bytes, do not trust the count blindly
        let mut messages = Vec::with_capacity(count.min(buffer.len() / 8));
        for _ in 0..count {
            let id = reader.read_var_i64()?;
            let timestamp = reader.read_var_i64()?;
            let uint16_payload = reader.read_u16()?;
            let uint8_mask = reader.read_u8()?;
            let flags = reader.read_u8()?;
            let offset_in_raw_msg = reader.read_var_u64()? as u16;
            let data_len = reader.read_var_u64()? as usize;
            let data = reader.read_bytes(data_len)?;

            let mut message = Message {
                id,
                timestamp,
                data,
                uint16_payload,
                uint8_mask,
                offset_in_raw_msg,
                ..Default::default()
            };
            message.set_flags(flags);
            messages.push(message);
        }
        if reader.pos != buffer.len() {
            return Err(CodecError::Malformed(format!(
                "{} trailing bytes after tree batch",
                buffer.len() - reader.pos
            )));
        }
        Ok(TreeBatch { messages })
    }

    pub fn encode(&self) -> Bytes {
        let data_size: usize = self.messages.iter().map(|m| m.data.len() + 32).sum();
        let mut buffer = BytesMut::with_capacity(data_size + 10);
        buffer.put_u8(TREE_MAGIC);
        buffer.put_slice(&(self.messages.len() as u64).encode_var_vec());
        for message in &self.messages {
            buffer.put_slice(&message.id.encode_var_vec());
            buffer.put_slice(&message.timestamp.encode_var_vec());
            buffer.put_u16(message.uint16_payload);
            buffer.put_u8(message.uint8_mask);
            buffer.put_u8(message.flags());
            buffer.put_slice(&(message.offset_in_raw_msg as u64).encode_var_vec());
            buffer.put_slice(&(message.data.len() as u64).encode_var_vec());
            buffer.put_slice(&message.data);
        }
        buffer.freeze()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Message> {
        self.messages.iter_mut()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

struct TreeReader<'a> {
    buffer: &'a Bytes,
    pos: usize,
}

impl TreeReader<'_> {
    fn remaining(&self) -> &[u8] {
        &self.buffer[self.pos..]
    }

    fn truncated(&self, what: &str) -> CodecError {
        CodecError::Malformed(format!("tree batch truncated at {} reading {}", self.pos, what))
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let value = *self.remaining().first().ok_or_else(|| self.truncated("u8"))?;
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let raw = self
            .remaining()
            .get(..2)
            .ok_or_else(|| self.truncated("u16"))?;
        let value = u16::from_be_bytes([raw[0], raw[1]]);
        self.pos += 2;
        Ok(value)
    }

    fn read_var_i64(&mut self) -> Result<i64, CodecError> {
        let (value, read_size) =
            i64::decode_var(self.remaining()).ok_or_else(|| self.truncated("varint"))?;
        self.pos += read_size;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, CodecError> {
        let (value, read_size) =
            u64::decode_var(self.remaining()).ok_or_else(|| self.truncated("varint"))?;
        self.pos += read_size;
        Ok(value)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Bytes, CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or_else(|| self.truncated("data"))?;
        let data = self.buffer.slice(self.pos..end);
        self.pos = end;
        Ok(data)
    }
}
