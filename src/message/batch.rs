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
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::compact::{with_local_writer, CompactBatch, CompactWriter};
use crate::message::constants::{COMPACT_MAGIC, TREE_MAGIC};
use crate::message::tree::TreeBatch;
use crate::message::{CodecError, Message};

/// The container encoding a client asks for or a store hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageFormat {
    #[default]
    Compact,
    Tree,
}

/// Read operations shared by both container encodings.
pub trait MessageSet {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of the message at `index`; payloads are shared, not copied.
    fn message(&self, index: usize) -> Option<Message>;

    fn has_merged_msg(&self) -> bool;

    fn format(&self) -> MessageFormat;
}

impl MessageSet for CompactBatch {
    fn len(&self) -> usize {
        CompactBatch::len(self)
    }

    fn message(&self, index: usize) -> Option<Message> {
        self.get(index).map(|view| view.to_message())
    }

    fn has_merged_msg(&self) -> bool {
        self.iter().any(|view| view.merged())
    }

    fn format(&self) -> MessageFormat {
        MessageFormat::Compact
    }
}

impl MessageSet for TreeBatch {
    fn len(&self) -> usize {
        TreeBatch::len(self)
    }

    fn message(&self, index: usize) -> Option<Message> {
        self.get(index).cloned()
    }

    fn has_merged_msg(&self) -> bool {
        self.iter().any(|message| message.merged)
    }

    fn format(&self) -> MessageFormat {
        MessageFormat::Tree
    }
}

/// A batch of messages held in exactly one of the two encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContainer {
    Compact(CompactBatch),
    Tree(TreeBatch),
}

impl MessageContainer {
    /// Decodes either encoding, dispatching on the leading magic byte.
    pub fn decode(buffer: Bytes, validate: bool) -> Result<MessageContainer, CodecError> {
        match buffer.first() {
            Some(&COMPACT_MAGIC) => Ok(MessageContainer::Compact(CompactBatch::decode(
                buffer, validate,
            )?)),
            Some(&TREE_MAGIC) => Ok(MessageContainer::Tree(TreeBatch::decode(&buffer)?)),
            Some(magic) => Err(CodecError::Malformed(format!(
                "unknown container magic {:#x}",
                magic
            ))),
            None => Err(CodecError::Malformed("empty container buffer".to_string())),
        }
    }

    pub fn from_messages(messages: Vec<Message>, format: MessageFormat) -> MessageContainer {
        match format {
            MessageFormat::Tree => MessageContainer::Tree(TreeBatch::new(messages)),
            MessageFormat::Compact => MessageContainer::Compact(encode_compact(|writer| {
                messages.iter().for_each(|message| writer.add(message))
            })),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            MessageContainer::Compact(batch) => batch.as_bytes().clone(),
            MessageContainer::Tree(batch) => batch.encode(),
        }
    }

    pub fn into_tree(self) -> TreeBatch {
        match self {
            MessageContainer::Compact(batch) => TreeBatch::new(batch.to_messages()),
            MessageContainer::Tree(batch) => batch,
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.into_tree().messages
    }

    pub fn to_compact(&self) -> CompactBatch {
        match self {
            MessageContainer::Compact(batch) => batch.clone(),
            MessageContainer::Tree(batch) => {
                encode_compact(|writer| batch.iter().for_each(|message| writer.add(message)))
            }
        }
    }

    pub fn convert(self, format: MessageFormat) -> MessageContainer {
        match (self, format) {
            (container @ MessageContainer::Tree(_), MessageFormat::Compact) => {
                MessageContainer::Compact(container.to_compact())
            }
            (MessageContainer::Compact(batch), MessageFormat::Tree) => {
                MessageContainer::Tree(TreeBatch::new(batch.to_messages()))
            }
            (container, _) => container,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MessageContainer::Compact(batch) => batch.len(),
            MessageContainer::Tree(batch) => batch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_merged_msg(&self) -> bool {
        match self {
            MessageContainer::Compact(batch) => MessageSet::has_merged_msg(batch),
            MessageContainer::Tree(batch) => MessageSet::has_merged_msg(batch),
        }
    }

    pub fn format(&self) -> MessageFormat {
        match self {
            MessageContainer::Compact(_) => MessageFormat::Compact,
            MessageContainer::Tree(_) => MessageFormat::Tree,
        }
    }

    /// Iterates owned messages of either encoding.
    pub fn messages(&self) -> Box<dyn Iterator<Item = Message> + '_> {
        match self {
            MessageContainer::Compact(batch) => Box::new(batch.iter().map(|v| v.to_message())),
            MessageContainer::Tree(batch) => Box::new(batch.iter().cloned()),
        }
    }
}

impl MessageSet for MessageContainer {
    fn len(&self) -> usize {
        MessageContainer::len(self)
    }

    fn message(&self, index: usize) -> Option<Message> {
        match self {
            MessageContainer::Compact(batch) => MessageSet::message(batch, index),
            MessageContainer::Tree(batch) => MessageSet::message(batch, index),
        }
    }

    fn has_merged_msg(&self) -> bool {
        MessageContainer::has_merged_msg(self)
    }

    fn format(&self) -> MessageFormat {
        MessageContainer::format(self)
    }
}

fn encode_compact(fill: impl FnOnce(&mut CompactWriter)) -> CompactBatch {
    let buffer = with_local_writer(|writer| {
        writer.reset();
        fill(writer);
        writer.finish()
    });
    // the writer produced this buffer itself, no need to verify it again
    match CompactBatch::decode(buffer, false) {
        Ok(batch) => batch,
        Err(e) => unreachable!("compact writer produced an invalid header: {}", e),
    }
}

/// A read result or write payload together with its cursor bookkeeping.
///
/// Messages live either in `container` or, once the whole batch got
/// compressed, in `compressed_msgs`; never in both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBatch {
    pub container: Option<MessageContainer>,
    pub compressed_msgs: Option<Bytes>,
    pub total_msg_count: u32,
    pub has_merged_msg: bool,
    pub max_msg_id: i64,
    pub max_timestamp: i64,
    pub next_msg_id: i64,
    pub next_timestamp: i64,
}

impl MessageBatch {
    pub fn empty() -> Self {
        MessageBatch {
            max_msg_id: -1,
            max_timestamp: -1,
            ..Default::default()
        }
    }

    pub fn from_container(container: MessageContainer) -> Self {
        let mut batch = MessageBatch::empty();
        batch.set_container(container);
        batch
    }

    /// Replaces the messages and refreshes the derived counters. Records of a
    /// compact batch that cannot be read are dropped, so the count matches
    /// what gets delivered.
    pub fn set_container(&mut self, container: MessageContainer) {
        let container = match container {
            MessageContainer::Compact(batch) if batch.readable_count() < batch.len() => {
                debug!("re-encoding the readable records of a {} record batch", batch.len());
                MessageContainer::Compact(encode_compact(|writer| {
                    batch.iter().for_each(|view| writer.add_view(&view))
                }))
            }
            container => container,
        };
        self.total_msg_count = container.len() as u32;
        self.has_merged_msg = container.has_merged_msg();
        self.compressed_msgs = None;
        self.container = Some(container);
    }

    pub fn take_container(&mut self) -> Option<MessageContainer> {
        self.container.take()
    }

    pub fn len(&self) -> usize {
        self.container.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.compressed_msgs.is_none()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.container
            .as_ref()
            .map(|c| c.messages().collect())
            .unwrap_or_default()
    }
}
