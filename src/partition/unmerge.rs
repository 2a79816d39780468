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

use tracing::{trace, warn};

use crate::compress::{decompress_merged_region, with_local_compressor};
use crate::filter::{FieldFilter, FieldVerdict};
use crate::message::{split_merged, Message, MessageContainer};
use crate::request::RangeFilter;
use crate::AppResult;

/// Expands merged messages and applies the consumer's filters to what comes
/// out of them.
#[derive(Debug)]
pub struct MessageUnmerger<'a> {
    filter: &'a RangeFilter,
    field_filter: &'a FieldFilter,
}

impl<'a> MessageUnmerger<'a> {
    pub fn new(filter: &'a RangeFilter, field_filter: &'a FieldFilter) -> Self {
        MessageUnmerger {
            filter,
            field_filter,
        }
    }

    /// Whether a read result has to go through `unmerge` at all. Merged
    /// messages can stay merged when the consumer reads this partition's
    /// whole range and knows how to split them.
    pub fn need_unmerge(
        has_merged_msg: bool,
        filter: &RangeFilter,
        own_range: (u16, u16),
        field_filter: &FieldFilter,
        support_merge_msg: bool,
    ) -> bool {
        field_filter.is_configured()
            || (has_merged_msg && (!support_merge_msg || !filter.covers(own_range)))
    }

    /// Keeps the container's format. A merged message that cannot be split
    /// is passed through unchanged.
    pub fn unmerge(&self, container: MessageContainer) -> MessageContainer {
        let format = container.format();
        let mut unmerged = Vec::with_capacity(container.len());
        for message in container.messages() {
            if message.merged {
                match self.expand(&message, &mut unmerged) {
                    Ok(count) => trace!("message {} expanded into {} messages", message.id, count),
                    Err(e) => {
                        warn!("unmerge message {} failed: {}, pass it through", message.id, e);
                        unmerged.push(message);
                    }
                }
            } else if let Some(message) = self.project(message) {
                unmerged.push(message);
            }
        }
        MessageContainer::from_messages(unmerged, format)
    }

    fn expand(&self, parent: &Message, out: &mut Vec<Message>) -> AppResult<usize> {
        let region = if parent.compress {
            decompress_merged_region(&parent.data)?
        } else {
            parent.data.clone()
        };
        let subs = split_merged(&region)?;
        let before = out.len();
        for (index, sub) in subs.into_iter().enumerate() {
            if !self.filter.matches(sub.uint16_payload, sub.uint8_mask) {
                continue;
            }
            let mut message = sub.into_message(parent, index as u16);
            match self.field_filter.apply(&message.data) {
                FieldVerdict::Rejected => continue,
                FieldVerdict::Unchanged => {}
                FieldVerdict::Projected(data) => message.data = data,
            }
            out.push(message);
        }
        Ok(out.len() - before)
    }

    /// Field filtering of a plain message, `None` when it got filtered out.
    fn project(&self, message: Message) -> Option<Message> {
        if !self.field_filter.is_configured() {
            return Some(message);
        }
        let data = if message.compress {
            match with_local_compressor(|compressor| compressor.decompress_block(&message.data)) {
                Ok(data) => data,
                Err(e) => {
                    warn!("decompress message {} failed: {}, pass it through", message.id, e);
                    return Some(message);
                }
            }
        } else {
            message.data.clone()
        };
        match self.field_filter.apply(&data) {
            FieldVerdict::Rejected => None,
            FieldVerdict::Unchanged => Some(message),
            FieldVerdict::Projected(projected) => Some(Message {
                data: projected,
                compress: false,
                ..message
            }),
        }
    }
}
