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

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{
    now_ms, LongPollEntry, MessageUnmerger, MirrorState, PartitionController, PartitionStatus,
    PendingRead,
};
use crate::compress::{compress_batch, decompress_messages};
use crate::filter::FieldFilter;
use crate::request::{ConsumptionRequest, ErrorKind, MessageResponse};
use crate::store::MessageIdInfo;

impl PartitionController {
    fn check_readable(&self) -> Result<(), ErrorKind> {
        match self.status() {
            PartitionStatus::Running | PartitionStatus::Sealed => Ok(()),
            PartitionStatus::Error => Err(ErrorKind::PartitionNotRunning),
            PartitionStatus::Recovering => {
                if self.mirror.state() != MirrorState::Bootstrapping {
                    Err(ErrorKind::PartitionNotRunning)
                } else if self.mirror.can_read() {
                    Ok(())
                } else {
                    Err(ErrorKind::BrokerBusy)
                }
            }
        }
    }

    /// Reads one batch for a consumer.
    ///
    /// Merged messages get expanded when the consumer cannot take them as
    /// they are, messages get decompressed for consumers that cannot do it
    /// themselves, and the batch gets compressed as a whole on request. A
    /// failing (de)compression step leaves the batch as it was.
    pub fn handle_read(&self, request: &ConsumptionRequest) -> (ErrorKind, MessageResponse) {
        let session_id = self.store.session_id();
        let mut response = MessageResponse::with_session(session_id);
        response.committed_msg_id = self.store.committed_msg_id();
        if let Err(error) = self.check_readable() {
            return (error, response);
        }
        if request.session_id != 0 && request.session_id != session_id {
            debug!(
                "partition {} read of session {}, current session {}",
                self.identity, request.session_id, session_id
            );
            return (ErrorKind::SessionChanged, response);
        }
        let field_filter = if request.has_field_filter() {
            match FieldFilter::new(&request.required_field_names, &request.field_filter_desc) {
                Ok(field_filter) => field_filter,
                Err(e) => {
                    debug!("partition {} rejects field filter: {}", self.identity, e);
                    return (ErrorKind::InitFieldFilterFailed, response);
                }
            }
        } else {
            FieldFilter::default()
        };

        let mut request = request.clone();
        request.count = request
            .count
            .min(self.config.partition.max_read_count.max(1));
        request.filter.resolve_merged_to(self.identity.range_util());
        let (result, mut batch) = self
            .store
            .get_messages(&request, self.config.partition.read_timeout());
        if result == ErrorKind::NoData
            && self.status() == PartitionStatus::Sealed
            && batch.max_msg_id < batch.next_msg_id
        {
            response.batch = batch;
            return (ErrorKind::SealedTopicReadFinish, response);
        }
        let Some(mut container) = batch.take_container().filter(|_| result.is_ok()) else {
            response.batch = batch;
            return (result, response);
        };

        if MessageUnmerger::need_unmerge(
            container.has_merged_msg(),
            &request.filter,
            self.identity.own_range(),
            &field_filter,
            request.version_info.support_merge_msg,
        ) {
            container = MessageUnmerger::new(&request.filter, &field_filter).unmerge(container);
        }
        if !request.can_decompress_msg {
            match decompress_messages(&mut container, true) {
                Ok(ratio) => response.decompress_ratio = ratio,
                Err(e) => warn!(
                    "partition {} decompress for {} failed: {}",
                    self.identity, request, e
                ),
            }
        }
        batch.set_container(container.convert(request.message_format));
        if request.need_compress {
            response.compress_ratio = compress_batch(&mut batch);
        }
        trace!(
            "partition {} read {} messages for {}",
            self.identity,
            batch.total_msg_count,
            request
        );
        response.batch = batch;
        (ErrorKind::None, response)
    }

    pub fn handle_get_max_id(&self) -> (ErrorKind, MessageIdInfo) {
        if let Err(error) = self.check_readable() {
            return (error, MessageIdInfo::default());
        }
        (ErrorKind::None, self.store.get_max_message_id())
    }

    pub fn handle_get_min_id_by_time(&self, timestamp: i64) -> (ErrorKind, MessageIdInfo) {
        if let Err(error) = self.check_readable() {
            return (error, MessageIdInfo::default());
        }
        self.store.get_min_message_id_by_time(timestamp)
    }

    /// Parks a read, returns the highest readable id so that a caller racing
    /// with a writer can wake it up right away.
    pub fn add_long_poll(&self, expire_time: i64, pending: PendingRead, start_id: i64) -> i64 {
        let compress_mask = pending.request.filter.compress_mask();
        self.long_poll
            .enqueue(expire_time, pending, start_id, compress_mask);
        self.readable_max_id()
    }

    /// Like `handle_read`, but waits up to `wait` for data when there is
    /// none yet.
    pub async fn read_with_long_poll(
        &self,
        request: ConsumptionRequest,
        wait: Duration,
    ) -> (ErrorKind, MessageResponse) {
        let (result, response) = self.handle_read(&request);
        if result != ErrorKind::NoData || wait.is_zero() {
            return (result, response);
        }
        let hold = wait.min(Duration::from_millis(self.config.long_poll.max_hold_ms));
        let expire_time = now_ms() + hold.as_millis() as i64;
        let start_id = response.batch.next_msg_id.max(request.start_id);
        let (responder, receiver) = oneshot::channel();
        let mut request = request;
        request.start_id = start_id;
        let max_id = self.add_long_poll(expire_time, PendingRead { request, responder }, start_id);
        if max_id >= start_id {
            self.activate_ready();
        }
        match receiver.await {
            Ok(answer) => answer,
            // dropped without answer, only while shutting down
            Err(_) => (result, response),
        }
    }

    /// Wakes up parked reads that can be served now. A `compress_mask` of
    /// `0` wakes readers of any hash range.
    pub(crate) fn activate_with_mask(&self, compress_mask: u64) -> usize {
        let max_id = self.readable_max_id();
        if self.long_poll.can_skip_check(max_id) {
            return 0;
        }
        let ready = self.long_poll.steal_activatable(max_id, compress_mask);
        self.complete_reads(ready)
    }

    pub fn activate_ready(&self) -> usize {
        self.activate_with_mask(0)
    }

    /// Answers the parked reads that ran out of time.
    pub fn sweep_timeouts(&self) -> usize {
        let max_hold = self.config.long_poll.max_hold_ms as i64;
        let expired = self.long_poll.steal_timed_out(now_ms(), max_hold);
        let count = expired.len();
        if count > 0 {
            trace!("partition {} times out {} parked reads", self.identity, count);
        }
        let session_id = self.store.session_id();
        for entry in expired {
            let mut response = MessageResponse::with_session(session_id);
            response.batch.next_msg_id = entry.start_id;
            response.committed_msg_id = self.store.committed_msg_id();
            let _ = entry.pending.responder.send((ErrorKind::NoData, response));
        }
        count
    }

    /// Runs the parked reads again. A read that still finds nothing goes
    /// back into the queue behind what it scanned.
    pub(crate) fn complete_reads(&self, entries: Vec<LongPollEntry<PendingRead>>) -> usize {
        let mut answered = 0;
        let now = now_ms();
        for entry in entries {
            let LongPollEntry {
                expire_time,
                pending,
                ..
            } = entry;
            if pending.responder.is_closed() {
                continue;
            }
            let (result, response) = self.handle_read(&pending.request);
            if result == ErrorKind::NoData && expire_time > now {
                let mut request = pending.request;
                request.start_id = response.batch.next_msg_id.max(request.start_id);
                let start_id = request.start_id;
                let compress_mask = request.filter.compress_mask();
                self.long_poll.enqueue(
                    expire_time,
                    PendingRead {
                        request,
                        responder: pending.responder,
                    },
                    start_id,
                    compress_mask,
                );
                continue;
            }
            answered += 1;
            let _ = pending.responder.send((result, response));
        }
        answered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::compress::compress_merged_region;
    use crate::filter::encode_field_group;
    use crate::message::{
        encode_merged, Message, MessageContainer, MessageFormat, MessageSet, SubMessage,
    };
    use crate::partition::tests::controller_with;
    use crate::request::{ProductionRequest, RangeFilter};
    use crate::service::{BrokerConfig, MirrorConfig};

    fn write(controller: &PartitionController, messages: Vec<Message>) {
        let request =
            ProductionRequest::new(MessageContainer::from_messages(messages, MessageFormat::Tree));
        let (result, _) = controller.handle_write(request);
        assert_eq!(result, ErrorKind::None);
    }

    fn plain(payload: u16, data: &'static str) -> Message {
        Message::new(data).with_payload(payload, 0)
    }

    fn merged(subs: &[SubMessage]) -> Message {
        let encoded = encode_merged(subs).unwrap();
        let payload = subs.iter().map(|sub| sub.uint16_payload).max().unwrap();
        let mut message = match compress_merged_region(0, &encoded) {
            Some(region) => {
                let mut message = Message::new(region);
                message.compress = true;
                message
            }
            None => Message::new(encoded),
        };
        message.merged = true;
        message.with_payload(payload, 0)
    }

    fn read_data(response: &MessageResponse) -> Vec<Bytes> {
        response
            .batch
            .messages()
            .into_iter()
            .map(|message| message.data)
            .collect()
    }

    #[test]
    fn test_read_plain_messages() {
        let controller = controller_with(&BrokerConfig::default());
        write(&controller, vec![plain(1, "a"), plain(2, "b"), plain(3, "c")]);
        let mut request = ConsumptionRequest::new(0, 10);
        request.filter = RangeFilter::new(2, 3);
        let (result, response) = controller.handle_read(&request);
        assert_eq!(result, ErrorKind::None);
        assert_eq!(read_data(&response), vec![Bytes::from("b"), Bytes::from("c")]);
        assert_eq!(response.batch.next_msg_id, 3);
        assert_eq!(response.batch.max_msg_id, 2);
        assert_eq!(response.committed_msg_id, 2);
    }

    #[test]
    fn test_merged_messages_are_split_for_partial_ranges() {
        let controller = controller_with(&BrokerConfig::default());
        let subs = vec![
            SubMessage::new("x".repeat(64), 10, 0),
            SubMessage::new("y".repeat(64), 20, 0),
            SubMessage::new("z".repeat(64), 30, 0),
        ];
        write(&controller, vec![merged(&subs)]);

        let mut request = ConsumptionRequest::new(0, 10);
        request.filter = RangeFilter::new(15, 25);
        let (result, response) = controller.handle_read(&request);
        assert_eq!(result, ErrorKind::None);
        assert_eq!(read_data(&response), vec![Bytes::from("y".repeat(64))]);

        // whole range and merge support: stays merged
        let (_, response) = controller.handle_read(&ConsumptionRequest::new(0, 10));
        assert!(response.batch.has_merged_msg);

        let mut request = ConsumptionRequest::new(0, 10);
        request.version_info.support_merge_msg = false;
        let (_, response) = controller.handle_read(&request);
        assert_eq!(response.batch.total_msg_count, 3);
        assert!(!response.batch.has_merged_msg);
    }

    #[test]
    fn test_decompress_and_compress_for_consumer() {
        let mut config = BrokerConfig::default();
        config.partition.compress_msg_in_broker = true;
        config.partition.compress_threshold = 16;
        let controller = controller_with(&config);
        let data = "abcd".repeat(100);
        write(&controller, vec![Message::new(data.clone()).with_payload(1, 0)]);

        let (_, response) = controller.handle_read(&ConsumptionRequest::new(0, 1));
        assert!(response.batch.messages()[0].compress);

        let mut request = ConsumptionRequest::new(0, 1);
        request.can_decompress_msg = false;
        request.message_format = MessageFormat::Tree;
        let (result, response) = controller.handle_read(&request);
        assert_eq!(result, ErrorKind::None);
        assert!(response.decompress_ratio < 1.0);
        let container = response.batch.container.as_ref().unwrap();
        assert_eq!(container.format(), MessageFormat::Tree);
        assert_eq!(container.message(0).unwrap().data, Bytes::from(data));

        let mut request = ConsumptionRequest::new(0, 1);
        request.can_decompress_msg = false;
        request.need_compress = true;
        let (_, response) = controller.handle_read(&request);
        assert!(response.compress_ratio < 1.0);
        assert!(response.batch.compressed_msgs.is_some());
        assert!(response.batch.container.is_none());
    }

    #[test]
    fn test_field_filter_read() {
        let controller = controller_with(&BrokerConfig::default());
        let keep = encode_field_group([("name", &b"n1"[..]), ("kind", &b"x"[..])]);
        let dropped = encode_field_group([("name", &b"n2"[..]), ("kind", &b"y"[..])]);
        write(
            &controller,
            vec![Message::new(keep).with_payload(1, 0), Message::new(dropped).with_payload(2, 0)],
        );
        let mut request = ConsumptionRequest::new(0, 10);
        request.required_field_names = vec!["name".to_string()];
        request.field_filter_desc = "kind = x".to_string();
        let (result, response) = controller.handle_read(&request);
        assert_eq!(result, ErrorKind::None);
        assert_eq!(
            read_data(&response),
            vec![encode_field_group([("name", &b"n1"[..])])]
        );

        request.field_filter_desc = "kind =".to_string();
        let (result, _) = controller.handle_read(&request);
        assert_eq!(result, ErrorKind::InitFieldFilterFailed);
    }

    #[test]
    fn test_session_and_status_checks() {
        let controller = controller_with(&BrokerConfig::default());
        let mut request = ConsumptionRequest::new(0, 1);
        request.session_id = controller.store().session_id() + 1;
        let (result, response) = controller.handle_read(&request);
        assert_eq!(result, ErrorKind::SessionChanged);
        assert_eq!(response.session_id, controller.store().session_id());

        let (result, _) = controller.handle_read(&ConsumptionRequest::new(0, 1));
        assert_eq!(result, ErrorKind::NoData);
        controller.seal().unwrap();
        let (result, _) = controller.handle_read(&ConsumptionRequest::new(0, 1));
        assert_eq!(result, ErrorKind::SealedTopicReadFinish);

        controller.set_error("broken");
        let (result, _) = controller.handle_read(&ConsumptionRequest::new(0, 1));
        assert_eq!(result, ErrorKind::PartitionNotRunning);
        assert_eq!(controller.handle_get_max_id().0, ErrorKind::PartitionNotRunning);
    }

    #[test]
    fn test_reads_while_bootstrapping() {
        let mut config = BrokerConfig {
            mirror: MirrorConfig {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let controller = controller_with(&config);
        let (result, _) = controller.handle_read(&ConsumptionRequest::new(0, 1));
        assert_eq!(result, ErrorKind::BrokerBusy);

        config.mirror.read_during_bootstrap = true;
        let controller = controller_with(&config);
        let (result, _) = controller.handle_read(&ConsumptionRequest::new(0, 1));
        assert_eq!(result, ErrorKind::NoData);
    }

    #[test]
    fn test_min_id_by_time() {
        let controller = controller_with(&BrokerConfig::default());
        write(
            &controller,
            vec![
                Message::new("a").with_id(0, 100),
                Message::new("b").with_id(0, 200),
            ],
        );
        let (result, info) = controller.handle_get_min_id_by_time(150);
        assert_eq!(result, ErrorKind::None);
        assert_eq!(info.msg_id, 1);
        let (_, info) = controller.handle_get_max_id();
        assert_eq!(info, MessageIdInfo { msg_id: 1, timestamp: 200 });
    }

    #[tokio::test]
    async fn test_long_poll_woken_by_write() {
        let controller = Arc::new(controller_with(&BrokerConfig::default()));
        let reader = controller.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_with_long_poll(ConsumptionRequest::new(0, 10), Duration::from_secs(5))
                .await
        });
        while controller.pending_reads() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        write(&controller, vec![plain(7, "late")]);
        let (result, response) = handle.await.unwrap();
        assert_eq!(result, ErrorKind::None);
        assert_eq!(read_data(&response), vec![Bytes::from("late")]);
        assert_eq!(controller.pending_reads(), 0);
    }

    #[tokio::test]
    async fn test_long_poll_requeues_on_other_ranges() {
        let controller = Arc::new(controller_with(&BrokerConfig::default()));
        let reader = controller.clone();
        let mut request = ConsumptionRequest::new(0, 10);
        request.filter = RangeFilter::new(60_000, u16::MAX);
        let handle = tokio::spawn(async move {
            reader
                .read_with_long_poll(request, Duration::from_millis(300))
                .await
        });
        while controller.pending_reads() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        write(&controller, vec![plain(1, "elsewhere")]);
        assert_eq!(controller.activate_ready(), 0);
        assert_eq!(controller.pending_reads(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(controller.sweep_timeouts(), 1);
        let (result, response) = handle.await.unwrap();
        assert_eq!(result, ErrorKind::NoData);
        assert_eq!(response.batch.next_msg_id, 1);
    }

    #[tokio::test]
    async fn test_seal_answers_parked_reads() {
        let controller = Arc::new(controller_with(&BrokerConfig::default()));
        let reader = controller.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_with_long_poll(ConsumptionRequest::new(0, 10), Duration::from_secs(5))
                .await
        });
        while controller.pending_reads() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.seal().unwrap();
        let (result, _) = handle.await.unwrap();
        assert_eq!(result, ErrorKind::SealedTopicReadFinish);
    }
}
