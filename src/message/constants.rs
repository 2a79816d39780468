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

//! Message Format Constants
//!
//! Offsets and lengths of the two container encodings and of the merged
//! sub-message encoding.
//!
//! # Compact Format
//!
//! The compact batch is addressed through an offset table and can be read
//! without a full parse pass:
//! - Magic (1 byte)
//! - Version (1 byte)
//! - Message count (4 bytes)
//! - CRC32C over everything after the header (4 bytes)
//! - Offset table (4 bytes per message, absolute position of each record)
//! - Records (variable length)
//!
//! Each record is laid out as:
//! - Id (8 bytes)
//! - Timestamp (8 bytes)
//! - Uint16 payload (2 bytes)
//! - Uint8 mask (1 byte)
//! - Flags (1 byte)
//! - Offset in raw message (2 bytes)
//! - Data length (4 bytes)
//! - Data (variable length)
//!
//! # Tree Format
//!
//! Magic (1 byte) followed by a varint message count and varint-framed records.

// Compact batch header offsets and lengths
pub const COMPACT_MAGIC_OFFSET: usize = 0;
pub const COMPACT_MAGIC_LENGTH: usize = 1;
pub const COMPACT_VERSION_OFFSET: usize = COMPACT_MAGIC_OFFSET + COMPACT_MAGIC_LENGTH;
pub const COMPACT_VERSION_LENGTH: usize = 1;
pub const MSG_COUNT_OFFSET: usize = COMPACT_VERSION_OFFSET + COMPACT_VERSION_LENGTH;
pub const MSG_COUNT_LENGTH: usize = 4;
pub const CRC_OFFSET: usize = MSG_COUNT_OFFSET + MSG_COUNT_LENGTH;
pub const CRC_LENGTH: usize = 4;
pub const COMPACT_HEADER_SIZE: usize = CRC_OFFSET + CRC_LENGTH;
pub const OFFSET_ENTRY_LENGTH: usize = 4;

// Compact record field offsets and lengths
pub const ID_OFFSET: usize = 0;
pub const ID_LENGTH: usize = 8;
pub const TIMESTAMP_OFFSET: usize = ID_OFFSET + ID_LENGTH;
pub const TIMESTAMP_LENGTH: usize = 8;
pub const PAYLOAD_OFFSET: usize = TIMESTAMP_OFFSET + TIMESTAMP_LENGTH;
pub const PAYLOAD_LENGTH: usize = 2;
pub const MASK_OFFSET: usize = PAYLOAD_OFFSET + PAYLOAD_LENGTH;
pub const MASK_LENGTH: usize = 1;
pub const FLAGS_OFFSET: usize = MASK_OFFSET + MASK_LENGTH;
pub const FLAGS_LENGTH: usize = 1;
pub const OFFSET_IN_RAW_OFFSET: usize = FLAGS_OFFSET + FLAGS_LENGTH;
pub const OFFSET_IN_RAW_LENGTH: usize = 2;
pub const DATA_LEN_OFFSET: usize = OFFSET_IN_RAW_OFFSET + OFFSET_IN_RAW_LENGTH;
pub const DATA_LEN_LENGTH: usize = 4;
pub const RECORD_OVERHEAD: usize = DATA_LEN_OFFSET + DATA_LEN_LENGTH;

// Special values and defaults

/// Magic value of the compact container
pub const COMPACT_MAGIC: u8 = 0xC5;
/// Current compact format version
pub const COMPACT_VERSION: u8 = 1;
/// Magic value of the tree container
pub const TREE_MAGIC: u8 = 0x7E;

/// Message flag bits
pub const FLAG_COMPRESS: u8 = 0x01;
pub const FLAG_MERGED: u8 = 0x02;

/// Length of the tag in front of a merged message's sub-message region
pub const MERGED_TAG_LENGTH: usize = 2;
/// Tag bit set while the sub-message region is compressed
pub const MERGED_COMPRESSED_BIT: u16 = 0x8000;
/// The remaining tag bits count the sub-messages
pub const MAX_MERGED_SUBS: usize = 0x7FFF;

/// Size of the hash space addressed by `uint16_payload`
pub const HASH_SPACE: u32 = 1 << 16;
/// `uint16_payload >> COMPRESS_MASK_SHIFT` selects one of 64 mask buckets
pub const COMPRESS_MASK_SHIFT: u32 = 10;

/// Default baseline capacity of a compact writer arena
pub const DEFAULT_WRITER_CAPACITY: usize = 64 * 1024;
/// Upper bound accepted from an lz4 size prefix
pub const MAX_DECOMPRESSED_SIZE: usize = 64 * 1024 * 1024;
