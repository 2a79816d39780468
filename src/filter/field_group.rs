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

//! Field group payloads: a flat sequence of named fields.
//!
//! - Name length (varint)
//! - Name (variable length)
//! - Value length (varint)
//! - Value (variable length)
//!
//! repeated until the end of the payload.

use std::cell::RefCell;
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use integer_encoding::VarInt;

use crate::message::CodecError;
use crate::utils::with_scratch;

thread_local! {
    static LOCAL_SCRATCH: RefCell<FieldScratch> = RefCell::new(FieldScratch::default());
}

/// Decode and encode state reused by every filter call on one thread.
#[derive(Debug, Default)]
pub struct FieldScratch {
    pub fields: Vec<(Range<usize>, Range<usize>)>,
    pub writer: FieldGroupWriter,
}

pub fn with_local_scratch<R>(f: impl FnOnce(&mut FieldScratch) -> R) -> R {
    with_scratch(&LOCAL_SCRATCH, FieldScratch::default, f)
}

/// Splits `data` into `(name, value)` ranges, replacing the content of
/// `fields`.
pub fn decode_fields(
    data: &[u8],
    fields: &mut Vec<(Range<usize>, Range<usize>)>,
) -> Result<(), CodecError> {
    fields.clear();
    let mut pos = 0;
    while pos < data.len() {
        let name = read_chunk(data, &mut pos)?;
        let value = read_chunk(data, &mut pos)?;
        fields.push((name, value));
    }
    Ok(())
}

fn read_chunk(data: &[u8], pos: &mut usize) -> Result<Range<usize>, CodecError> {
    let (len, read_size) = u64::decode_var(&data[*pos..]).ok_or_else(|| {
        CodecError::Malformed(format!("field group truncated at {}", *pos))
    })?;
    let start = *pos + read_size;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| {
            CodecError::Malformed(format!(
                "field of {} bytes at {} overruns the payload of {}",
                len,
                start,
                data.len()
            ))
        })?;
    *pos = end;
    Ok(start..end)
}

#[derive(Debug, Default)]
pub struct FieldGroupWriter {
    buffer: BytesMut,
}

impl FieldGroupWriter {
    pub fn add_field(&mut self, name: &[u8], value: &[u8]) {
        self.buffer.put_slice(&(name.len() as u64).encode_var_vec());
        self.buffer.put_slice(name);
        self.buffer.put_slice(&(value.len() as u64).encode_var_vec());
        self.buffer.put_slice(value);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Hands out the encoded fields and leaves the writer empty.
    pub fn finish(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }
}

pub fn encode_field_group<'a>(fields: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Bytes {
    let mut writer = FieldGroupWriter::default();
    for (name, value) in fields {
        writer.add_field(name.as_bytes(), value);
    }
    writer.finish()
}
