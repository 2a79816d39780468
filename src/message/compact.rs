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

/// The compact container: a zero-copy, offset-table based batch encoding.
///
/// A `CompactBatch` never gets mutated. Reads go through `MessageView`, which
/// borrows straight from the underlying buffer; rewrites materialize a
/// `TreeBatch` first and encode back through a `CompactWriter`.
use std::cell::RefCell;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::message::constants::*;
use crate::message::{CodecError, Message};
use crate::utils::with_scratch;

thread_local! {
    static LOCAL_WRITER: RefCell<CompactWriter> = RefCell::new(CompactWriter::default());
}

/// Runs `f` with this worker thread's compact writer.
pub fn with_local_writer<R>(f: impl FnOnce(&mut CompactWriter) -> R) -> R {
    with_scratch(&LOCAL_WRITER, CompactWriter::default, f)
}

#[derive(Clone, PartialEq, Eq)]
pub struct CompactBatch {
    buffer: Bytes,
    count: usize,
}

impl std::fmt::Debug for CompactBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactBatch")
            .field("buffer length", &self.buffer.len())
            .field("count", &self.count)
            .finish()
    }
}

impl CompactBatch {
    /// Parses a compact buffer.
    ///
    /// With `validate` the whole buffer is verified (version, checksum and the
    /// bounds of every record) before a batch is handed out. Without it the
    /// buffer is trusted, only the header and the offset table must be present.
    pub fn decode(buffer: Bytes, validate: bool) -> Result<CompactBatch, CodecError> {
        if buffer.len() < COMPACT_HEADER_SIZE {
            return Err(CodecError::Malformed(format!(
                "compact batch header absent, buffer length {}",
                buffer.len()
            )));
        }
        if buffer[COMPACT_MAGIC_OFFSET] != COMPACT_MAGIC {
            return Err(CodecError::Malformed(format!(
                "unexpected compact magic {:#x}",
                buffer[COMPACT_MAGIC_OFFSET]
            )));
        }
        let count = read_u32(&buffer, MSG_COUNT_OFFSET) as usize;
        let table_end = count
            .checked_mul(OFFSET_ENTRY_LENGTH)
            .and_then(|len| len.checked_add(COMPACT_HEADER_SIZE))
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| {
                CodecError::Malformed(format!(
                    "message vector absent, {} entries do not fit in {} bytes",
                    count,
                    buffer.len()
                ))
            })?;

        let batch = CompactBatch { buffer, count };
        if validate {
            batch.verify(table_end)?;
        }
        Ok(batch)
    }

    fn verify(&self, table_end: usize) -> Result<(), CodecError> {
        let version = self.buffer[COMPACT_VERSION_OFFSET];
        if version != COMPACT_VERSION {
            return Err(CodecError::Malformed(format!(
                "unsupported compact version {}",
                version
            )));
        }

        let expected_crc = read_u32(&self.buffer, CRC_OFFSET);
        let computed_crc = crc32c::crc32c(&self.buffer[COMPACT_HEADER_SIZE..]);
        if expected_crc != computed_crc {
            return Err(CodecError::Malformed(format!(
                "CRC mismatch: expected {}, but found {}",
                expected_crc, computed_crc
            )));
        }

        for index in 0..self.count {
            let offset = self.record_offset(index);
            if offset < table_end {
                return Err(CodecError::Malformed(format!(
                    "record {} at offset {} overlaps the offset table",
                    index, offset
                )));
            }
            if self.record_bounds(offset).is_none() {
                return Err(CodecError::Malformed(format!(
                    "record {} at offset {} overruns the buffer",
                    index, offset
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Random access to a record. Out-of-range indexes, and records of a
    /// trusted buffer that turn out to overrun it, yield `None`.
    pub fn get(&self, index: usize) -> Option<MessageView<'_>> {
        if index >= self.count {
            return None;
        }
        let offset = self.record_offset(index);
        let (data_start, data_end) = self.record_bounds(offset)?;
        Some(MessageView {
            batch: self,
            offset,
            data_start,
            data_end,
        })
    }

    /// Skips, with a warning, records that overrun a trusted buffer.
    pub fn iter(&self) -> impl Iterator<Item = MessageView<'_>> {
        (0..self.count).filter_map(move |index| {
            let view = self.get(index);
            if view.is_none() {
                warn!(
                    "compact record {} of {} overruns the {} byte buffer, skipped",
                    index,
                    self.count,
                    self.buffer.len()
                );
            }
            view
        })
    }

    /// Below `len()` only for a trusted buffer that turned out corrupt.
    pub fn readable_count(&self) -> usize {
        (0..self.count)
            .filter(|&index| self.get(index).is_some())
            .count()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.buffer
    }

    pub fn into_bytes(self) -> Bytes {
        self.buffer
    }

    pub fn to_messages(&self) -> Vec<Message> {
        self.iter().map(|view| view.to_message()).collect()
    }

    fn record_offset(&self, index: usize) -> usize {
        read_u32(
            &self.buffer,
            COMPACT_HEADER_SIZE + index * OFFSET_ENTRY_LENGTH,
        ) as usize
    }

    fn record_bounds(&self, offset: usize) -> Option<(usize, usize)> {
        let data_start = offset.checked_add(RECORD_OVERHEAD)?;
        if data_start > self.buffer.len() {
            return None;
        }
        let data_len = read_u32(&self.buffer, offset + DATA_LEN_OFFSET) as usize;
        let data_end = data_start.checked_add(data_len)?;
        if data_end > self.buffer.len() {
            return None;
        }
        Some((data_start, data_end))
    }
}

/// Zero-copy accessor of one compact record.
#[derive(Clone, Copy)]
pub struct MessageView<'a> {
    batch: &'a CompactBatch,
    offset: usize,
    data_start: usize,
    data_end: usize,
}

impl<'a> MessageView<'a> {
    pub fn id(&self) -> i64 {
        read_u64(&self.batch.buffer, self.offset + ID_OFFSET) as i64
    }

    pub fn timestamp(&self) -> i64 {
        read_u64(&self.batch.buffer, self.offset + TIMESTAMP_OFFSET) as i64
    }

    pub fn uint16_payload(&self) -> u16 {
        read_u16(&self.batch.buffer, self.offset + PAYLOAD_OFFSET)
    }

    pub fn uint8_mask(&self) -> u8 {
        self.batch.buffer[self.offset + MASK_OFFSET]
    }

    pub fn compress(&self) -> bool {
        self.flags() & FLAG_COMPRESS != 0
    }

    pub fn merged(&self) -> bool {
        self.flags() & FLAG_MERGED != 0
    }

    pub fn offset_in_raw_msg(&self) -> u16 {
        read_u16(&self.batch.buffer, self.offset + OFFSET_IN_RAW_OFFSET)
    }

    pub fn data(&self) -> &'a [u8] {
        &self.batch.buffer[self.data_start..self.data_end]
    }

    /// Shares the batch buffer instead of copying the payload.
    pub fn data_bytes(&self) -> Bytes {
        self.batch.buffer.slice(self.data_start..self.data_end)
    }

    pub fn to_message(&self) -> Message {
        let mut message = Message {
            id: self.id(),
            timestamp: self.timestamp(),
            data: self.data_bytes(),
            uint16_payload: self.uint16_payload(),
            uint8_mask: self.uint8_mask(),
            offset_in_raw_msg: self.offset_in_raw_msg(),
            ..Default::default()
        };
        message.set_flags(self.flags());
        message
    }

    fn flags(&self) -> u8 {
        self.batch.buffer[self.offset + FLAGS_OFFSET]
    }
}

impl std::fmt::Debug for MessageView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageView")
            .field("id", &self.id())
            .field("timestamp", &self.timestamp())
            .field("data length", &self.data().len())
            .field("compress", &self.compress())
            .field("merged", &self.merged())
            .finish()
    }
}

/// Append-only builder of compact batches.
///
/// The record arena is reused across batches; `reset` gives back growth beyond
/// the baseline capacity.
#[derive(Debug)]
pub struct CompactWriter {
    records: BytesMut,
    offsets: Vec<u32>,
    baseline_capacity: usize,
}

impl Default for CompactWriter {
    fn default() -> Self {
        CompactWriter::new(DEFAULT_WRITER_CAPACITY)
    }
}

impl CompactWriter {
    pub fn new(baseline_capacity: usize) -> Self {
        CompactWriter {
            records: BytesMut::with_capacity(baseline_capacity),
            offsets: Vec::new(),
            baseline_capacity,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_message(
        &mut self,
        data: &[u8],
        id: i64,
        timestamp: i64,
        uint16_payload: u16,
        uint8_mask: u8,
        offset_in_raw_msg: u16,
        compress: bool,
        merged: bool,
    ) {
        let mut flags = 0;
        if compress {
            flags |= FLAG_COMPRESS;
        }
        if merged {
            flags |= FLAG_MERGED;
        }
        self.offsets.push(self.records.len() as u32);
        self.records.reserve(RECORD_OVERHEAD + data.len());
        self.records.put_i64(id);
        self.records.put_i64(timestamp);
        self.records.put_u16(uint16_payload);
        self.records.put_u8(uint8_mask);
        self.records.put_u8(flags);
        self.records.put_u16(offset_in_raw_msg);
        self.records.put_u32(data.len() as u32);
        self.records.put_slice(data);
    }

    pub fn add(&mut self, message: &Message) {
        self.add_message(
            &message.data,
            message.id,
            message.timestamp,
            message.uint16_payload,
            message.uint8_mask,
            message.offset_in_raw_msg,
            message.compress,
            message.merged,
        );
    }

    pub fn add_view(&mut self, view: &MessageView<'_>) {
        self.add_message(
            view.data(),
            view.id(),
            view.timestamp(),
            view.uint16_payload(),
            view.uint8_mask(),
            view.offset_in_raw_msg(),
            view.compress(),
            view.merged(),
        );
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Emits the batch and resets the writer for the next one.
    pub fn finish(&mut self) -> Bytes {
        let count = self.offsets.len();
        let table_end = COMPACT_HEADER_SIZE + count * OFFSET_ENTRY_LENGTH;
        let mut out = BytesMut::with_capacity(table_end + self.records.len());

        out.put_u8(COMPACT_MAGIC);
        out.put_u8(COMPACT_VERSION);
        out.put_u32(count as u32);
        out.put_u32(0); // crc
        for offset in &self.offsets {
            out.put_u32(table_end as u32 + offset);
        }
        out.put_slice(&self.records);

        let crc = crc32c::crc32c(&out[COMPACT_HEADER_SIZE..]);
        out[CRC_OFFSET..CRC_OFFSET + CRC_LENGTH].copy_from_slice(&crc.to_be_bytes());

        self.reset();
        out.freeze()
    }

    pub fn reset(&mut self) {
        self.offsets.clear();
        self.records.clear();
        if self.records.capacity() > self.baseline_capacity {
            self.records = BytesMut::with_capacity(self.baseline_capacity);
        }
        let baseline_entries = self.baseline_capacity / RECORD_OVERHEAD;
        if self.offsets.capacity() > baseline_entries {
            self.offsets.shrink_to(baseline_entries);
        }
    }

    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }
}

fn read_u16(buffer: &[u8], at: usize) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&buffer[at..at + 2]);
    u16::from_be_bytes(raw)
}

fn read_u32(buffer: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buffer[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64(buffer: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buffer[at..at + 8]);
    u64::from_be_bytes(raw)
}
