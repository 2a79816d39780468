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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rstest::{fixture, rstest};
use stonemq_partition::{
    encode_field_group, setup_local_tracing, AppError, AppResult, BrokerConfig, ConsumptionRequest,
    ErrorKind, KvWriterVersionStore, MemoryMessageStore, MergedMessageBuilder, Message,
    MessageContainer, MessageFormat, MessageStore, MirrorFuture, MirrorPull, MirrorSource,
    MirrorState, PartitionController, PartitionIdentity, PartitionStatus, ProductionRequest,
    RangeFilter, SubMessage, TopicMode,
};

#[fixture]
#[once]
fn tracing_setup() {
    setup_local_tracing().unwrap();
}

fn controller(config: &BrokerConfig) -> Arc<PartitionController> {
    let identity = PartitionIdentity::new("orders", 0, 1, 64).unwrap();
    let controller = PartitionController::new(
        identity,
        config,
        Arc::new(MemoryMessageStore::new(&config.store)),
        Arc::new(KvWriterVersionStore::in_memory()),
    );
    controller.init().unwrap();
    Arc::new(controller)
}

fn produce(controller: &PartitionController, messages: Vec<Message>) -> ErrorKind {
    let request = ProductionRequest::new(MessageContainer::from_messages(
        messages,
        MessageFormat::Compact,
    ));
    controller.handle_write(request).0
}

/// Serves a fixed message log, failing the first `failures` pulls.
#[derive(Debug)]
struct VecMirrorSource {
    messages: Vec<Message>,
    failures: AtomicU32,
    pulls: AtomicU32,
}

impl VecMirrorSource {
    fn new(first_id: i64, count: usize, failures: u32) -> Self {
        let messages = (0..count)
            .map(|i| {
                Message::new(format!("mirrored-{}", i))
                    .with_id(first_id + i as i64, 1_000 + i as i64)
                    .with_payload(i as u16, 0)
            })
            .collect();
        VecMirrorSource {
            messages,
            failures: AtomicU32::new(failures),
            pulls: AtomicU32::new(0),
        }
    }
}

impl MirrorSource for VecMirrorSource {
    fn pull(&self, start_id: i64, count: u32) -> MirrorFuture<'_> {
        Box::pin(async move {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err(AppError::MirrorSource("source unreachable".to_string()));
            }
            let messages: Vec<Message> = self
                .messages
                .iter()
                .filter(|message| message.id >= start_id)
                .take(count as usize)
                .cloned()
                .collect();
            let last_id = self.messages.last().map(|message| message.id).unwrap_or(-1);
            let caught_up = messages
                .last()
                .map(|message| message.id == last_id)
                .unwrap_or(true);
            Ok(MirrorPull {
                messages,
                caught_up,
            })
        })
    }
}

#[rstest]
#[tokio::test]
async fn test_mirror_bootstrap_then_open_for_producers(_tracing_setup: ()) -> AppResult<()> {
    let mut config = BrokerConfig::default();
    config.mirror.enabled = true;
    config.mirror.pull_interval_ms = 1;
    config.mirror.pull_batch_size = 3;
    config.mirror.backoff_base_ms = 1;
    config.mirror.backoff_max_ms = 5;
    let controller = controller(&config);
    assert_eq!(controller.status(), PartitionStatus::Recovering);
    assert_eq!(
        produce(&controller, vec![Message::new("early")]),
        ErrorKind::PermissionDenied
    );

    let source = Arc::new(VecMirrorSource::new(100, 10, 2));
    let task = controller.start_mirror(source.clone())?;
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()?;

    assert_eq!(controller.status(), PartitionStatus::Running);
    assert_eq!(controller.mirror_state(), MirrorState::Synced);
    assert!(source.pulls.load(Ordering::SeqCst) >= 6);
    let (_, max) = controller.handle_get_max_id();
    assert_eq!(max.msg_id, 109);

    let (result, response) = controller.handle_read(&ConsumptionRequest::new(100, 100));
    assert_eq!(result, ErrorKind::None);
    assert_eq!(response.batch.total_msg_count, 10);
    assert_eq!(response.batch.messages()[9].timestamp, 1_009);

    assert_eq!(produce(&controller, vec![Message::new("late")]), ErrorKind::None);
    assert_eq!(controller.handle_get_max_id().1.msg_id, 110);
    assert!(controller.start_mirror(source).is_err());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_mirror_task_stops_on_shutdown(_tracing_setup: ()) -> AppResult<()> {
    let mut config = BrokerConfig::default();
    config.mirror.enabled = true;
    config.mirror.backoff_base_ms = 1_000;
    config.mirror.backoff_max_ms = 1_000;
    let controller = controller(&config);
    let source = Arc::new(VecMirrorSource::new(0, 1, u32::MAX));
    let task = controller.start_mirror(source)?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()?;
    assert_eq!(controller.status(), PartitionStatus::Recovering);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn test_mirror_rejected_batch_fails_partition(_tracing_setup: ()) {
    let mut config = BrokerConfig::default();
    config.general.max_msg_size = 8;
    config.mirror.enabled = true;
    config.mirror.pull_interval_ms = 5;
    let controller = controller(&config);
    let source = Arc::new(VecMirrorSource::new(0, 4, 0));
    let task = controller.start_mirror(source.clone()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AppError::IllegalStateError(_))));
    assert_eq!(source.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(controller.status(), PartitionStatus::Error);
    assert_eq!(controller.mirror_state(), MirrorState::Bootstrapping);
}

#[rstest]
#[tokio::test]
async fn test_mirror_busy_store_backs_off(_tracing_setup: ()) {
    let mut config = BrokerConfig::default();
    config.store.capacity = 2;
    config.mirror.enabled = true;
    config.mirror.pull_interval_ms = 1;
    config.mirror.pull_batch_size = 3;
    config.mirror.backoff_base_ms = 20;
    config.mirror.backoff_max_ms = 20;
    let controller = controller(&config);
    let source = Arc::new(VecMirrorSource::new(0, 5, 0));
    let task = controller.start_mirror(source.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let pulls = source.pulls.load(Ordering::SeqCst);
    assert!(pulls >= 2, "pulled {} times", pulls);
    assert!(pulls <= 25, "pulled {} times", pulls);
    assert_eq!(controller.status(), PartitionStatus::Recovering);
    assert_eq!(controller.store().get_max_message_id().msg_id, -1);

    controller.shutdown();
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[rstest]
#[tokio::test]
async fn test_long_poll_with_maintenance(_tracing_setup: ()) {
    let mut config = BrokerConfig::default();
    config.long_poll.maintenance_interval_ms = 2;
    let controller = controller(&config);
    let maintenance = controller.start_maintenance();

    let readers: Vec<_> = [(0u16, 999u16), (1024, 2047)]
        .into_iter()
        .map(|(from, to)| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let mut request = ConsumptionRequest::new(0, 10);
                request.filter = RangeFilter::new(from, to);
                controller
                    .read_with_long_poll(request, Duration::from_millis(500))
                    .await
            })
        })
        .collect();
    while controller.pending_reads() < 2 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert_eq!(
        produce(&controller, vec![Message::new("low").with_payload(10, 0)]),
        ErrorKind::None
    );
    let mut answers = Vec::new();
    for reader in readers {
        answers.push(reader.await.unwrap());
    }
    let (result, response) = &answers[0];
    assert_eq!(*result, ErrorKind::None);
    assert_eq!(response.batch.messages()[0].data, Bytes::from("low"));
    let (result, response) = &answers[1];
    assert_eq!(*result, ErrorKind::NoData);
    assert_eq!(response.batch.next_msg_id, 1);
    assert_eq!(controller.pending_reads(), 0);

    controller.shutdown();
    maintenance.await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_security_mode_wakes_on_commit_only(_tracing_setup: ()) {
    let mut config = BrokerConfig::default();
    config.store.topic_mode = TopicMode::Security;
    let store = Arc::new(MemoryMessageStore::new(&config.store));
    let identity = PartitionIdentity::new("audit", 0, 1, 64).unwrap();
    let controller = Arc::new(PartitionController::new(
        identity,
        &config,
        store.clone(),
        Arc::new(KvWriterVersionStore::in_memory()),
    ));
    controller.init().unwrap();

    let reader = controller.clone();
    let handle = tokio::spawn(async move {
        reader
            .read_with_long_poll(ConsumptionRequest::new(0, 10), Duration::from_secs(5))
            .await
    });
    while controller.pending_reads() == 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(produce(&controller, vec![Message::new("secret")]), ErrorKind::None);
    assert_eq!(controller.activate_ready(), 0);
    assert_eq!(controller.pending_reads(), 1);

    store.commit_up_to(0);
    assert_eq!(controller.activate_ready(), 1);
    let (result, response) = handle.await.unwrap();
    assert_eq!(result, ErrorKind::None);
    assert_eq!(response.committed_msg_id, 0);
}

#[rstest]
fn test_merged_batches_end_to_end(_tracing_setup: ()) -> AppResult<()> {
    let mut config = BrokerConfig::default();
    config.partition.partition_count = 2;
    config.partition.partition_id = 1;
    let identity = PartitionIdentity::new("orders", 1, 2, 64)?;
    let own_range = identity.own_range();
    let controller = PartitionController::new(
        identity,
        &config,
        Arc::new(MemoryMessageStore::new(&config.store)),
        Arc::new(KvWriterVersionStore::in_memory()),
    );
    controller.init()?;

    let mut builder = MergedMessageBuilder::new(64);
    for i in 0..20u16 {
        let fields = encode_field_group([
            ("user", format!("user-{}", i).as_bytes()),
            ("kind", if i % 2 == 0 { &b"even"[..] } else { &b"odd"[..] }),
        ]);
        builder.add(SubMessage::new(fields, own_range.0 + i * 10, (i % 4) as u8))?;
    }
    let merged = builder.build(0, 0)?;
    assert!(merged.merged);
    assert_eq!(produce(&controller, vec![merged]), ErrorKind::None);

    // whole partition range: the merged message is delivered as is
    let mut request = ConsumptionRequest::new(0, 10);
    request.filter = RangeFilter::new(own_range.0, own_range.1);
    let (result, response) = controller.handle_read(&request);
    assert_eq!(result, ErrorKind::None);
    assert!(response.batch.has_merged_msg);
    assert_eq!(response.batch.total_msg_count, 1);

    // narrower range, mask and field filter: split and projected
    request.filter = RangeFilter::new(own_range.0, own_range.0 + 99).with_mask(0b01, 0b00);
    request.required_field_names = vec!["user".to_string()];
    request.field_filter_desc = "kind = even".to_string();
    let (result, response) = controller.handle_read(&request);
    assert_eq!(result, ErrorKind::None);
    assert!(!response.batch.has_merged_msg);
    let users: Vec<Bytes> = response
        .batch
        .messages()
        .into_iter()
        .map(|message| message.data)
        .collect();
    let expected: Vec<Bytes> = [0, 2, 4, 6, 8]
        .iter()
        .map(|i| encode_field_group([("user", format!("user-{}", i).as_bytes())]))
        .collect();
    assert_eq!(users, expected);
    Ok(())
}

#[rstest]
fn test_from_config_persists_writer_versions(_tracing_setup: ()) -> AppResult<()> {
    let dir = tempfile::tempdir()?;
    let mut config = BrokerConfig::default();
    config.writer_version.kv_store_path = dir
        .path()
        .join("writer_version.db")
        .to_string_lossy()
        .to_string();

    let write = |controller: &PartitionController, minor: u32| {
        let request = ProductionRequest::new(MessageContainer::from_messages(
            vec![Message::new("m")],
            MessageFormat::Tree,
        ))
        .with_writer("billing", 1, minor);
        controller.handle_write(request).0
    };
    let controller = PartitionController::from_config(&config)?;
    assert_eq!(write(&controller, 3), ErrorKind::None);
    drop(controller);

    let controller = PartitionController::from_config(&config)?;
    assert_eq!(write(&controller, 2), ErrorKind::WriteVersionInvalid);
    assert_eq!(write(&controller, 3), ErrorKind::None);
    assert_eq!(controller.store().topic_mode(), TopicMode::Normal);
    Ok(())
}
