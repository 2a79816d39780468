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

//! Whole-batch and per-message compression.
//!
//! Every compressed block is an lz4 block preceded by its uncompressed size as
//! a little endian `u32`, the layout `lz4_flex::decompress_size_prepended`
//! reads. A compressed block only ever replaces data it is strictly shorter
//! than.
//!
//! All operations report `compressed size / uncompressed size` over the data
//! they touched, `1.0` when nothing was eligible.

use std::cell::RefCell;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::message::constants::{MAX_DECOMPRESSED_SIZE, MERGED_COMPRESSED_BIT, MERGED_TAG_LENGTH};
use crate::message::{MessageBatch, MessageContainer, TreeBatch};
use crate::utils::with_scratch;
use crate::{AppError, AppResult};

const SIZE_PREFIX_LENGTH: usize = 4;

thread_local! {
    static LOCAL_COMPRESSOR: RefCell<Compressor> = RefCell::new(Compressor::default());
}

/// Runs `f` with this worker thread's compressor.
pub fn with_local_compressor<R>(f: impl FnOnce(&mut Compressor) -> R) -> R {
    with_scratch(&LOCAL_COMPRESSOR, Compressor::default, f)
}

pub fn compress_batch(batch: &mut MessageBatch) -> f32 {
    with_local_compressor(|compressor| compressor.compress_batch(batch))
}

pub fn decompress_batch(compressed: &[u8]) -> AppResult<MessageContainer> {
    with_local_compressor(|compressor| compressor.decompress_batch(compressed))
}

pub fn decompress_batch_in_place(batch: &mut MessageBatch) -> AppResult<f32> {
    with_local_compressor(|compressor| compressor.decompress_batch_in_place(batch))
}

pub fn compress_messages(container: &mut MessageContainer, threshold: usize) -> f32 {
    with_local_compressor(|compressor| compressor.compress_messages(container, threshold))
}

pub fn decompress_messages(container: &mut MessageContainer, decode_merged: bool) -> AppResult<f32> {
    with_local_compressor(|compressor| compressor.decompress_messages(container, decode_merged))
}

pub fn compress_merged_region(threshold: usize, data: &[u8]) -> Option<Bytes> {
    with_local_compressor(|compressor| compressor.compress_merged_region(threshold, data))
}

pub fn decompress_merged_region(data: &[u8]) -> AppResult<Bytes> {
    with_local_compressor(|compressor| compressor.decompress_merged_region(data))
}

/// lz4 codec with a reusable working buffer.
#[derive(Debug, Default)]
pub struct Compressor {
    scratch: Vec<u8>,
}

impl Compressor {
    /// Compresses `input` into a size prefixed block, `None` unless the block
    /// ends up strictly shorter than `input`.
    pub fn compress_block(&mut self, input: &[u8]) -> Option<Bytes> {
        if input.len() > u32::MAX as usize {
            return None;
        }
        let max_len = SIZE_PREFIX_LENGTH + lz4_flex::block::get_maximum_output_size(input.len());
        self.scratch.clear();
        self.scratch.resize(max_len, 0);
        self.scratch[..SIZE_PREFIX_LENGTH].copy_from_slice(&(input.len() as u32).to_le_bytes());
        let written =
            match lz4_flex::block::compress_into(input, &mut self.scratch[SIZE_PREFIX_LENGTH..]) {
                Ok(written) => written,
                Err(e) => {
                    debug!("lz4 compression of {} bytes failed: {}", input.len(), e);
                    return None;
                }
            };
        let total = SIZE_PREFIX_LENGTH + written;
        if total >= input.len() {
            trace!("compressed {} bytes into {}, keeping it plain", input.len(), total);
            return None;
        }
        Some(Bytes::copy_from_slice(&self.scratch[..total]))
    }

    pub fn decompress_block(&mut self, input: &[u8]) -> AppResult<Bytes> {
        let prefix = input.get(..SIZE_PREFIX_LENGTH).ok_or_else(|| {
            AppError::DecompressMessage(format!("block of {} bytes has no size", input.len()))
        })?;
        let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if size > MAX_DECOMPRESSED_SIZE {
            return Err(AppError::DecompressMessage(format!(
                "declared size {} exceeds {}",
                size, MAX_DECOMPRESSED_SIZE
            )));
        }
        self.scratch.clear();
        self.scratch.resize(size, 0);
        let written =
            lz4_flex::block::decompress_into(&input[SIZE_PREFIX_LENGTH..], &mut self.scratch)
                .map_err(|e| AppError::DecompressMessage(e.to_string()))?;
        if written != size {
            return Err(AppError::DecompressMessage(format!(
                "declared size {}, but found {}",
                size, written
            )));
        }
        Ok(Bytes::copy_from_slice(&self.scratch))
    }

    /// Moves the whole container into `compressed_msgs` as
    /// `format magic | block`. The batch stays as is when that would not
    /// shrink it.
    pub fn compress_batch(&mut self, batch: &mut MessageBatch) -> f32 {
        let Some(container) = batch.container.as_ref() else {
            return 1.0;
        };
        let encoded = container.encode();
        let Some(block) = self.compress_block(&encoded) else {
            return 1.0;
        };
        if block.len() + 1 >= encoded.len() {
            return 1.0;
        }
        let mut compressed = BytesMut::with_capacity(block.len() + 1);
        compressed.put_u8(encoded[0]);
        compressed.put_slice(&block);
        let ratio = compressed.len() as f32 / encoded.len() as f32;
        batch.compressed_msgs = Some(compressed.freeze());
        batch.container = None;
        ratio
    }

    pub fn decompress_batch(&mut self, compressed: &[u8]) -> AppResult<MessageContainer> {
        let (&magic, block) = compressed
            .split_first()
            .ok_or_else(|| AppError::DecompressMessage("empty compressed batch".to_string()))?;
        let encoded = self.decompress_block(block)?;
        if encoded.first() != Some(&magic) {
            return Err(AppError::DecompressMessage(format!(
                "compressed batch announced format {:#x}",
                magic
            )));
        }
        MessageContainer::decode(encoded, true)
            .map_err(|e| AppError::DecompressMessage(e.to_string()))
    }

    pub fn decompress_batch_in_place(&mut self, batch: &mut MessageBatch) -> AppResult<f32> {
        let compressed = batch.compressed_msgs.clone().ok_or_else(|| {
            AppError::DecompressMessage("batch carries no compressed messages".to_string())
        })?;
        let container = self.decompress_batch(&compressed)?;
        let uncompressed_len = container.encode().len().max(1);
        batch.set_container(container);
        Ok(compressed.len() as f32 / uncompressed_len as f32)
    }

    /// Compresses every plain, unmerged message longer than `threshold`.
    ///
    /// A compact container is rewritten only when it holds a candidate, and
    /// keeps its encoding.
    pub fn compress_messages(&mut self, container: &mut MessageContainer, threshold: usize) -> f32 {
        let eligible = |len: usize, compress: bool, merged: bool| {
            len > threshold && !compress && !merged
        };
        let has_candidate = match container {
            MessageContainer::Compact(batch) => batch
                .iter()
                .any(|view| eligible(view.data().len(), view.compress(), view.merged())),
            MessageContainer::Tree(batch) => batch
                .iter()
                .any(|message| eligible(message.data.len(), message.compress, message.merged)),
        };
        if !has_candidate {
            return 1.0;
        }

        let format = container.format();
        let mut tree = take_tree(container);
        let (mut before, mut after) = (0usize, 0usize);
        for message in tree.iter_mut() {
            if !eligible(message.data.len(), message.compress, message.merged) {
                continue;
            }
            before += message.data.len();
            match self.compress_block(&message.data) {
                Some(block) => {
                    after += block.len();
                    message.data = block;
                    message.compress = true;
                }
                None => after += message.data.len(),
            }
        }
        *container = MessageContainer::Tree(tree).convert(format);
        after as f32 / before.max(1) as f32
    }

    /// Decompresses every compressed message. Merged messages only get their
    /// region unwrapped with `decode_merged`.
    ///
    /// On failure the messages decompressed so far stay decompressed.
    pub fn decompress_messages(
        &mut self,
        container: &mut MessageContainer,
        decode_merged: bool,
    ) -> AppResult<f32> {
        let eligible = |compress: bool, merged: bool| compress && (!merged || decode_merged);
        let has_candidate = match container {
            MessageContainer::Compact(batch) => batch
                .iter()
                .any(|view| eligible(view.compress(), view.merged())),
            MessageContainer::Tree(batch) => batch
                .iter()
                .any(|message| eligible(message.compress, message.merged)),
        };
        if !has_candidate {
            return Ok(1.0);
        }

        let format = container.format();
        let mut tree = take_tree(container);
        let (mut compressed, mut uncompressed) = (0usize, 0usize);
        let mut result = Ok(());
        for message in tree.iter_mut() {
            if !eligible(message.compress, message.merged) {
                continue;
            }
            let decompressed = if message.merged {
                self.decompress_merged_region(&message.data)
            } else {
                self.decompress_block(&message.data)
            };
            match decompressed {
                Ok(data) => {
                    compressed += message.data.len();
                    uncompressed += data.len();
                    message.data = data;
                    message.compress = false;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        *container = MessageContainer::Tree(tree).convert(format);
        result.map(|_| compressed as f32 / uncompressed.max(1) as f32)
    }

    /// Compresses the region behind the 2 byte tag of a merged message.
    ///
    /// `None` when the region is not longer than `threshold`, is already
    /// compressed, or tag plus compressed region would not be strictly
    /// shorter than `data`.
    pub fn compress_merged_region(&mut self, threshold: usize, data: &[u8]) -> Option<Bytes> {
        if data.len() <= MERGED_TAG_LENGTH {
            return None;
        }
        let tag = u16::from_be_bytes([data[0], data[1]]);
        let region = &data[MERGED_TAG_LENGTH..];
        if tag & MERGED_COMPRESSED_BIT != 0 || region.len() <= threshold {
            return None;
        }
        let block = self.compress_block(region)?;
        if MERGED_TAG_LENGTH + block.len() >= data.len() {
            return None;
        }
        let mut compressed = BytesMut::with_capacity(MERGED_TAG_LENGTH + block.len());
        compressed.put_u16(tag | MERGED_COMPRESSED_BIT);
        compressed.put_slice(&block);
        Some(compressed.freeze())
    }

    /// Inverse of `compress_merged_region`; a region that is not compressed
    /// comes back unchanged.
    pub fn decompress_merged_region(&mut self, data: &[u8]) -> AppResult<Bytes> {
        if data.len() <= MERGED_TAG_LENGTH {
            return Err(AppError::DecompressMessage(format!(
                "merged message of {} bytes has nothing behind its tag",
                data.len()
            )));
        }
        let tag = u16::from_be_bytes([data[0], data[1]]);
        if tag & MERGED_COMPRESSED_BIT == 0 {
            return Ok(Bytes::copy_from_slice(data));
        }
        let region = self.decompress_block(&data[MERGED_TAG_LENGTH..])?;
        let mut decompressed = BytesMut::with_capacity(MERGED_TAG_LENGTH + region.len());
        decompressed.put_u16(tag & !MERGED_COMPRESSED_BIT);
        decompressed.put_slice(&region);
        Ok(decompressed.freeze())
    }
}

fn take_tree(container: &mut MessageContainer) -> TreeBatch {
    std::mem::replace(container, MessageContainer::Tree(TreeBatch::default())).into_tree()
}
