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

use crate::message::{MessageFormat, RangeUtil};

/// Hash range and mask a consumer is interested in.
///
/// A message matches when `from <= uint16_payload <= to` and
/// `uint8_mask & uint8_filter_mask == uint8_mask_result`. `merged_to` widens
/// the range for merged messages, which carry the highest hash of their
/// sub-messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFilter {
    pub from: u16,
    pub to: u16,
    pub uint8_filter_mask: u8,
    pub uint8_mask_result: u8,
    pub merged_to: u16,
}

impl Default for RangeFilter {
    fn default() -> Self {
        RangeFilter::new(0, u16::MAX)
    }
}

impl RangeFilter {
    pub fn new(from: u16, to: u16) -> Self {
        RangeFilter {
            from,
            to,
            uint8_filter_mask: 0,
            uint8_mask_result: 0,
            merged_to: to,
        }
    }

    pub fn with_mask(mut self, uint8_filter_mask: u8, uint8_mask_result: u8) -> Self {
        self.uint8_filter_mask = uint8_filter_mask;
        self.uint8_mask_result = uint8_mask_result;
        self
    }

    pub fn resolve_merged_to(&mut self, range_util: &RangeUtil) {
        self.merged_to = range_util.merged_to(self.to).max(self.to);
    }

    pub fn matches(&self, uint16_payload: u16, uint8_mask: u8) -> bool {
        self.from <= uint16_payload
            && uint16_payload <= self.to
            && uint8_mask & self.uint8_filter_mask == self.uint8_mask_result
    }

    /// Coarse check for merged messages; the sub-messages get checked one by
    /// one once expanded.
    pub fn may_contain(&self, uint16_payload: u16) -> bool {
        self.from <= uint16_payload && uint16_payload <= self.merged_to
    }

    /// True when every message of `range` passes this filter anyway.
    pub fn covers(&self, range: (u16, u16)) -> bool {
        self.from <= range.0 && self.to >= range.1 && self.uint8_filter_mask == 0
    }

    pub fn compress_mask(&self) -> u64 {
        RangeUtil::compress_mask(self.from, self.to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    pub user: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub major_version: u32,
    pub minor_version: u32,
    pub support_merge_msg: bool,
}

impl Default for VersionInfo {
    fn default() -> Self {
        VersionInfo {
            major_version: 0,
            minor_version: 0,
            support_merge_msg: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionRequest {
    pub start_id: i64,
    pub count: u32,
    pub filter: RangeFilter,
    pub required_field_names: Vec<String>,
    pub field_filter_desc: String,
    pub can_decompress_msg: bool,
    pub need_compress: bool,
    /// `0` for a consumer that has not seen a session yet
    pub session_id: i64,
    pub message_format: MessageFormat,
    pub auth: AuthInfo,
    pub version_info: VersionInfo,
}

impl ConsumptionRequest {
    pub fn new(start_id: i64, count: u32) -> Self {
        ConsumptionRequest {
            start_id,
            count,
            filter: RangeFilter::default(),
            required_field_names: Vec::new(),
            field_filter_desc: String::new(),
            can_decompress_msg: true,
            need_compress: false,
            session_id: 0,
            message_format: MessageFormat::Compact,
            auth: AuthInfo::default(),
            version_info: VersionInfo::default(),
        }
    }

    pub fn has_field_filter(&self) -> bool {
        !self.required_field_names.is_empty() || !self.field_filter_desc.trim().is_empty()
    }
}

impl std::fmt::Display for ConsumptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(start_id={}, count={}, range=[{}, {}], session={}, format={:?})",
            self.start_id,
            self.count,
            self.filter.from,
            self.filter.to,
            self.session_id,
            self.message_format
        )
    }
}
