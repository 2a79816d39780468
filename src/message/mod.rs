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

pub use batch::{MessageBatch, MessageContainer, MessageFormat, MessageSet};
pub use compact::{with_local_writer, CompactBatch, CompactWriter, MessageView};
pub use merged::{encode_merged, split_merged, MergedMessageBuilder, SubMessage};
pub use record::Message;
pub use topic_partition::{PartitionIdentity, RangeUtil};
pub use tree::TreeBatch;

pub mod constants;
mod batch;
mod compact;
mod merged;
mod record;
mod topic_partition;
mod tree;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed message buffer: {0}")]
    Malformed(String),
}
