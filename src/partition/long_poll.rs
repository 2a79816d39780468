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

use parking_lot::RwLock;

/// A read parked until data shows up or it expires.
#[derive(Debug)]
pub struct LongPollEntry<T> {
    /// epoch milliseconds
    pub expire_time: i64,
    pub start_id: i64,
    /// Hash slices the reader is interested in, see `RangeUtil::compress_mask`.
    pub compress_mask: u64,
    pub pending: T,
}

#[derive(Debug)]
struct QueueInner<T> {
    entries: Vec<LongPollEntry<T>>,
    min_start_id: i64,
    max_msg_id: i64,
}

impl<T> QueueInner<T> {
    fn steal_where(&mut self, pred: impl Fn(&LongPollEntry<T>) -> bool) -> Vec<LongPollEntry<T>> {
        let (stolen, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.entries).into_iter().partition(pred);
        self.entries = kept;
        self.min_start_id = self
            .entries
            .iter()
            .map(|entry| entry.start_id)
            .min()
            .unwrap_or(i64::MAX);
        stolen
    }
}

/// Pending reads of one partition.
///
/// `min_start_id` is the smallest start id still queued, `i64::MAX` when
/// empty, and lets writers skip the write lock when nothing can be woken up.
#[derive(Debug)]
pub struct LongPollQueue<T> {
    inner: RwLock<QueueInner<T>>,
}

impl<T> Default for LongPollQueue<T> {
    fn default() -> Self {
        LongPollQueue {
            inner: RwLock::new(QueueInner {
                entries: Vec::new(),
                min_start_id: i64::MAX,
                max_msg_id: -1,
            }),
        }
    }
}

impl<T> LongPollQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the highest message id seen so far, a caller racing with a
    /// writer compares it with `start_id`.
    pub fn enqueue(&self, expire_time: i64, pending: T, start_id: i64, compress_mask: u64) -> i64 {
        let mut inner = self.inner.write();
        inner.entries.push(LongPollEntry {
            expire_time,
            start_id,
            compress_mask,
            pending,
        });
        inner.min_start_id = inner.min_start_id.min(start_id);
        inner.max_msg_id
    }

    /// Entries that expired, or whose remaining wait exceeds `max_hold`,
    /// which only happens when the clock went backwards.
    pub fn steal_timed_out(&self, now: i64, max_hold: i64) -> Vec<LongPollEntry<T>> {
        self.inner.write().steal_where(|entry| {
            let slack = entry.expire_time - now;
            slack <= 0 || slack > max_hold
        })
    }

    /// Entries that can be served now that `new_max_msg_id` is readable. A
    /// non-zero `compress_mask` only wakes readers of the touched slices.
    pub fn steal_activatable(
        &self,
        new_max_msg_id: i64,
        compress_mask: u64,
    ) -> Vec<LongPollEntry<T>> {
        let mut inner = self.inner.write();
        inner.max_msg_id = inner.max_msg_id.max(new_max_msg_id);
        if new_max_msg_id < inner.min_start_id {
            return Vec::new();
        }
        let max_msg_id = inner.max_msg_id;
        inner.steal_where(|entry| {
            entry.start_id <= max_msg_id
                && (compress_mask == 0 || entry.compress_mask & compress_mask != 0)
        })
    }

    pub fn steal_all(&self) -> Vec<LongPollEntry<T>> {
        self.inner.write().steal_where(|_| true)
    }

    /// True when no queued reader can be served up to `max_msg_id`.
    pub fn can_skip_check(&self, max_msg_id: i64) -> bool {
        max_msg_id < self.inner.read().min_start_id
    }

    pub fn min_start_id(&self) -> i64 {
        self.inner.read().min_start_id
    }

    pub fn max_msg_id(&self) -> i64 {
        self.inner.read().max_msg_id
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn queue_with(start_ids: &[i64]) -> LongPollQueue<i64> {
        let queue = LongPollQueue::new();
        for start_id in start_ids {
            queue.enqueue(1_000, *start_id, *start_id, 0);
        }
        queue
    }

    fn stolen_ids(entries: Vec<LongPollEntry<i64>>) -> Vec<i64> {
        entries.into_iter().map(|entry| entry.pending).collect()
    }

    #[test]
    fn test_steal_activatable_scenario() {
        let queue = queue_with(&[5, 10, 15]);
        assert_eq!(queue.min_start_id(), 5);
        assert_eq!(stolen_ids(queue.steal_activatable(12, 0)), vec![5, 10]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.min_start_id(), 15);
        assert_eq!(queue.max_msg_id(), 12);
    }

    #[test]
    fn test_fast_path_below_min_start() {
        let queue = queue_with(&[5, 10]);
        assert!(queue.can_skip_check(4));
        assert!(!queue.can_skip_check(5));
        assert!(queue.steal_activatable(4, 0).is_empty());
        assert_eq!(queue.max_msg_id(), 4);
        assert!(LongPollQueue::<i64>::new().can_skip_check(i64::MAX - 1));
    }

    #[test]
    fn test_max_msg_id_never_decreases() {
        let queue = queue_with(&[100]);
        queue.steal_activatable(50, 0);
        queue.steal_activatable(20, 0);
        assert_eq!(queue.max_msg_id(), 50);
        assert_eq!(queue.enqueue(1_000, 7, 7, 0), 50);
    }

    #[test]
    fn test_compress_mask_matching() {
        let queue = LongPollQueue::new();
        queue.enqueue(1_000, 1, 0, 0b0001);
        queue.enqueue(1_000, 2, 0, 0b0110);
        queue.enqueue(1_000, 3, 0, 0b1000);
        assert_eq!(stolen_ids(queue.steal_activatable(3, 0b0010)), vec![2]);
        assert_eq!(queue.min_start_id(), 0);
        assert_eq!(stolen_ids(queue.steal_activatable(3, 0)), vec![1, 3]);
        assert_eq!(queue.min_start_id(), i64::MAX);
    }

    #[rstest]
    #[case(1_000, vec![1, 2])]
    #[case(500, vec![1])]
    #[case(0, vec![])]
    fn test_steal_timed_out(#[case] now: i64, #[case] expected: Vec<i64>) {
        let queue = LongPollQueue::new();
        queue.enqueue(500, 1, 30, 0);
        queue.enqueue(1_000, 2, 20, 0);
        queue.enqueue(1_500, 3, 10, 0);
        let stolen = stolen_ids(queue.steal_timed_out(now, 10_000));
        assert_eq!(stolen, expected);
        let remaining_min = [(500, 30), (1_000, 20), (1_500, 10)]
            .iter()
            .filter(|(expire, _)| *expire > now)
            .map(|(_, start)| *start)
            .min()
            .unwrap_or(i64::MAX);
        assert_eq!(queue.min_start_id(), remaining_min);
    }

    #[test]
    fn test_implausible_slack_is_timed_out() {
        let queue = LongPollQueue::new();
        queue.enqueue(100_000, 1, 0, 0);
        queue.enqueue(2_000, 2, 0, 0);
        assert_eq!(stolen_ids(queue.steal_timed_out(1_000, 5_000)), vec![1]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_steal_all() {
        let queue = queue_with(&[3, 1, 2]);
        assert_eq!(queue.steal_all().len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.min_start_id(), i64::MAX);
    }

    #[test]
    fn test_min_start_id_tracks_random_operations() {
        let queue = LongPollQueue::new();
        let mut expected: Vec<i64> = Vec::new();
        for round in 0..200 {
            let start_id = rand::random::<u8>() as i64;
            queue.enqueue(1_000, start_id, start_id, 0);
            expected.push(start_id);
            if round % 7 == 0 {
                let stolen = queue.steal_activatable(rand::random::<u8>() as i64, 0);
                let high = queue.max_msg_id();
                assert!(stolen.iter().all(|entry| entry.start_id <= high));
                expected = queue_ids(&queue);
                assert!(expected.iter().all(|id| *id > high) || stolen.is_empty());
            }
            assert_eq!(
                queue.min_start_id(),
                expected.iter().copied().min().unwrap_or(i64::MAX)
            );
        }
    }

    fn queue_ids(queue: &LongPollQueue<i64>) -> Vec<i64> {
        queue.inner.read().entries.iter().map(|entry| entry.start_id).collect()
    }
}
