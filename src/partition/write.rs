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

use tracing::{debug, trace, warn};

use super::{MirrorState, PartitionController, PartitionStatus};
use crate::compress::{compress_messages, decompress_batch};
use crate::message::{CompactBatch, MessageContainer, RangeUtil};
use crate::request::{ErrorKind, MessageResponse, ProductionRequest};

impl PartitionController {
    fn check_writable(&self, replication_mode: bool) -> Result<(), ErrorKind> {
        match self.status() {
            PartitionStatus::Error => return Err(ErrorKind::PartitionNotRunning),
            PartitionStatus::Sealed => return Err(ErrorKind::TopicSealed),
            PartitionStatus::Running | PartitionStatus::Recovering => {}
        }
        if !self.mirror.can_write(replication_mode) {
            return Err(ErrorKind::PermissionDenied);
        }
        if self.status() == PartitionStatus::Recovering
            && !(replication_mode && self.mirror.state() == MirrorState::Bootstrapping)
        {
            return Err(ErrorKind::PartitionNotRunning);
        }
        Ok(())
    }

    fn check_writer_version(&self, request: &ProductionRequest) -> Result<(), ErrorKind> {
        if request.replication_mode {
            return Ok(());
        }
        if request.writer_name.is_empty() {
            return match self.config.writer_version.enforce_writer_version {
                true => Err(ErrorKind::WriteVersionInvalid),
                false => Ok(()),
            };
        }
        if self.writer_versions.validate_then_update(
            &request.writer_name,
            request.major_version,
            request.minor_version,
        ) {
            Ok(())
        } else {
            debug!(
                "partition {} rejects writer {} version {}.{}",
                self.identity, request.writer_name, request.major_version, request.minor_version
            );
            Err(ErrorKind::WriteVersionInvalid)
        }
    }

    /// Turns the request payload into a plain container ready for the store.
    fn prepare_messages(&self, request: &mut ProductionRequest) -> Result<(), ErrorKind> {
        let mut container = match (request.compressed_msgs.take(), request.msgs.take()) {
            (Some(compressed), _) => decompress_batch(&compressed).map_err(|e| {
                debug!("partition {} got undecodable batch: {}", self.identity, e);
                ErrorKind::DecompressMessage
            })?,
            (None, Some(MessageContainer::Compact(batch)))
                if self.config.partition.validate_client_batch =>
            {
                let batch = CompactBatch::decode(batch.into_bytes(), true).map_err(|e| {
                    debug!("partition {} got malformed batch: {}", self.identity, e);
                    ErrorKind::InvalidRequest
                })?;
                MessageContainer::Compact(batch)
            }
            (None, Some(container)) => container,
            (None, None) => return Err(ErrorKind::InvalidRequest),
        };

        let max_msg_size = self.config.general.max_msg_size;
        if let Some(message) = container
            .messages()
            .find(|message| message.data.len() > max_msg_size)
        {
            debug!(
                "partition {} rejects message of {} bytes",
                self.identity,
                message.data.len()
            );
            return Err(ErrorKind::InvalidRequest);
        }
        if self.config.partition.compress_msg_in_broker && !request.replication_mode {
            let ratio = compress_messages(&mut container, self.config.partition.compress_threshold);
            trace!("partition {} compressed produced messages to {:.2}", self.identity, ratio);
        }
        request.msgs = Some(container);
        Ok(())
    }

    /// Hash slices a write touched, merged messages touch their whole bucket.
    fn written_mask(&self, container: &MessageContainer) -> u64 {
        let range_util = self.identity.range_util();
        container.messages().fold(0, |mask, message| {
            if message.merged {
                let bucket = range_util.merge_bucket(message.uint16_payload);
                let (from, to) = range_util.bucket_range(bucket);
                mask | RangeUtil::compress_mask(from, to)
            } else {
                mask | RangeUtil::payload_mask(message.uint16_payload)
            }
        })
    }

    /// Appends a batch for a producer, or for the mirror loop when
    /// `replication_mode` is set, and wakes the readers waiting for it.
    pub fn handle_write(&self, mut request: ProductionRequest) -> (ErrorKind, MessageResponse) {
        let session_id = self.store.session_id();
        let mut response = MessageResponse::with_session(session_id);
        if let Err(error) = self.check_writable(request.replication_mode) {
            response.committed_msg_id = self.store.committed_msg_id();
            return (error, response);
        }
        if request.session_id != 0 && request.session_id != session_id {
            return (ErrorKind::SessionChanged, response);
        }
        if let Err(error) = self.check_writer_version(&request) {
            return (error, response);
        }
        if let Err(error) = self.prepare_messages(&mut request) {
            return (error, response);
        }

        let result = self.store.add_message(&request);
        let max = self.store.get_max_message_id();
        response.batch.max_msg_id = max.msg_id;
        response.batch.max_timestamp = max.timestamp;
        response.committed_msg_id = self.store.committed_msg_id();
        match result {
            ErrorKind::None => {
                response.accepted_msg_count = request.msg_count() as u32;
                let mask = request
                    .msgs
                    .as_ref()
                    .map(|msgs| self.written_mask(msgs))
                    .unwrap_or(0);
                let woken = self.activate_with_mask(mask);
                if woken > 0 {
                    trace!("partition {} write woke {} reads", self.identity, woken);
                }
            }
            ErrorKind::Unknown => self.set_error("store append failed"),
            other => warn!("partition {} append failed: {:?}", self.identity, other),
        }
        (result, response)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::{Message, MessageFormat};
    use crate::partition::tests::controller_with;
    use crate::request::ConsumptionRequest;
    use crate::service::{BrokerConfig, MirrorConfig};

    fn request_of(data: &[&'static str]) -> ProductionRequest {
        let messages = data.iter().map(|d| Message::new(*d)).collect();
        ProductionRequest::new(MessageContainer::from_messages(messages, MessageFormat::Compact))
    }

    #[test]
    fn test_write_then_read() {
        let controller = controller_with(&BrokerConfig::default());
        let (result, response) = controller.handle_write(request_of(&["a", "b"]));
        assert_eq!(result, ErrorKind::None);
        assert_eq!(response.accepted_msg_count, 2);
        assert_eq!(response.batch.max_msg_id, 1);
        assert_eq!(response.committed_msg_id, 1);
    }

    #[test]
    fn test_compressed_batch_write() {
        let controller = controller_with(&BrokerConfig::default());
        let mut batch = crate::message::MessageBatch::from_container(
            MessageContainer::from_messages(
                vec![Message::new("repeat ".repeat(50)), Message::new("repeat ".repeat(50))],
                MessageFormat::Compact,
            ),
        );
        assert!(crate::compress::compress_batch(&mut batch) < 1.0);
        let request = ProductionRequest {
            compressed_msgs: batch.compressed_msgs.take(),
            ..Default::default()
        };
        let (result, response) = controller.handle_write(request);
        assert_eq!(result, ErrorKind::None);
        assert_eq!(response.accepted_msg_count, 2);

        let request = ProductionRequest {
            compressed_msgs: Some(Bytes::from_static(b"\x01garbage")),
            ..Default::default()
        };
        assert_eq!(controller.handle_write(request).0, ErrorKind::DecompressMessage);
        assert_eq!(
            controller.handle_write(ProductionRequest::default()).0,
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn test_writer_versions() {
        let mut config = BrokerConfig::default();
        let controller = controller_with(&config);
        let write = |name: &str, major: u32, minor: u32| {
            controller
                .handle_write(request_of(&["m"]).with_writer(name, major, minor))
                .0
        };
        assert_eq!(write("w", 1, 1), ErrorKind::None);
        assert_eq!(write("w", 1, 0), ErrorKind::WriteVersionInvalid);
        assert_eq!(write("w", 2, 0), ErrorKind::None);
        assert_eq!(write("", 0, 0), ErrorKind::None);

        config.writer_version.enforce_writer_version = true;
        let controller = controller_with(&config);
        assert_eq!(
            controller.handle_write(request_of(&["m"])).0,
            ErrorKind::WriteVersionInvalid
        );
    }

    #[test]
    fn test_status_gates() {
        let controller = controller_with(&BrokerConfig::default());
        let mut request = request_of(&["m"]);
        request.session_id = controller.store().session_id() - 1;
        assert_eq!(controller.handle_write(request).0, ErrorKind::SessionChanged);

        controller.seal().unwrap();
        assert_eq!(controller.handle_write(request_of(&["m"])).0, ErrorKind::TopicSealed);
        controller.set_error("gone");
        assert_eq!(
            controller.handle_write(request_of(&["m"])).0,
            ErrorKind::PartitionNotRunning
        );
    }

    #[test]
    fn test_mirror_gate_on_writes() {
        let config = BrokerConfig {
            mirror: MirrorConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let controller = controller_with(&config);
        assert_eq!(controller.handle_write(request_of(&["m"])).0, ErrorKind::PermissionDenied);

        let mut replicated = ProductionRequest::new(MessageContainer::from_messages(
            vec![Message::new("r").with_id(5, 10)],
            MessageFormat::Tree,
        ));
        replicated.replication_mode = true;
        assert_eq!(controller.handle_write(replicated).0, ErrorKind::None);
        assert_eq!(controller.store().get_max_message_id().msg_id, 5);

        controller.finish_bootstrap();
        let (result, response) = controller.handle_write(request_of(&["m"]));
        assert_eq!(result, ErrorKind::None);
        assert_eq!(response.batch.max_msg_id, 6);
    }

    #[test]
    fn test_oversized_and_malformed_messages() {
        let mut config = BrokerConfig::default();
        config.general.max_msg_size = 4;
        let controller = controller_with(&config);
        assert_eq!(
            controller.handle_write(request_of(&["too long"])).0,
            ErrorKind::InvalidRequest
        );
        assert_eq!(controller.handle_write(request_of(&["ok"])).0, ErrorKind::None);
    }

    #[test]
    fn test_broker_side_compression() {
        let mut config = BrokerConfig::default();
        config.partition.compress_msg_in_broker = true;
        config.partition.compress_threshold = 32;
        let controller = controller_with(&config);
        let long = "0123456789".repeat(20);
        let request = ProductionRequest::new(MessageContainer::from_messages(
            vec![Message::new(long.clone()), Message::new("short")],
            MessageFormat::Tree,
        ));
        assert_eq!(controller.handle_write(request).0, ErrorKind::None);
        let (_, response) = controller.handle_read(&ConsumptionRequest::new(0, 10));
        let messages = response.batch.messages();
        assert!(messages[0].compress);
        assert!(messages[0].data.len() < long.len());
        assert!(!messages[1].compress);
    }
}
