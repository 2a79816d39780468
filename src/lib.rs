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

mod compress;
mod filter;
mod message;
mod partition;
mod request;
mod service;
mod store;
mod utils;

pub use compress::{
    compress_batch, compress_merged_region, compress_messages, decompress_batch,
    decompress_batch_in_place, decompress_merged_region, decompress_messages,
    with_local_compressor, Compressor,
};
pub use filter::{encode_field_group, FieldFilter, FieldVerdict, FilterExpr};
pub use message::{
    encode_merged, split_merged, with_local_writer, CodecError, CompactBatch, CompactWriter,
    MergedMessageBuilder, Message, MessageBatch, MessageContainer, MessageFormat, MessageSet,
    MessageView, PartitionIdentity, RangeUtil, SubMessage, TreeBatch,
};
pub use partition::{
    LongPollEntry, LongPollQueue, MessageUnmerger, MirrorFuture, MirrorGate, MirrorPull,
    MirrorSource, MirrorState, PartitionController, PartitionStatus, PendingRead,
};
pub use request::{
    AuthInfo, ConsumptionRequest, ErrorKind, MessageResponse, ProductionRequest, RangeFilter,
    VersionInfo,
};
pub use service::GLOBAL_CONFIG;
pub use service::{
    global_config, setup_local_tracing, setup_tracing, AppError, AppResult, BrokerConfig,
    GeneralConfig, LongPollConfig, MirrorConfig, PartitionConfig, Shutdown, ShutdownNotifier,
    StoreConfig, WriterVersionConfig,
};
pub use store::{
    KvWriterVersionStore, MemoryMessageStore, MessageIdInfo, MessageStore, TopicMode,
    WriterVersionStore,
};
pub use utils::KvStore;
