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

use std::fmt::{Display, Formatter};

use crate::message::constants::{COMPRESS_MASK_SHIFT, HASH_SPACE};
use crate::{AppError, AppResult};

/// Identity of the partition a controller serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionIdentity {
    pub topic_name: String,
    pub partition_id: u32,
    pub partition_count: u32,
    pub range_count: u32,
    range_util: RangeUtil,
}

impl PartitionIdentity {
    pub fn new(
        topic_name: impl Into<String>,
        partition_id: u32,
        partition_count: u32,
        range_count: u32,
    ) -> AppResult<Self> {
        let range_util = RangeUtil::new(partition_count, range_count)?;
        if partition_id >= partition_count {
            return Err(AppError::InvalidValue(format!(
                "partition id {} out of {} partitions",
                partition_id, partition_count
            )));
        }
        Ok(PartitionIdentity {
            topic_name: topic_name.into(),
            partition_id,
            partition_count,
            range_count,
            range_util,
        })
    }

    pub fn range_util(&self) -> &RangeUtil {
        &self.range_util
    }

    /// Inclusive hash range owned by this partition.
    pub fn own_range(&self) -> (u16, u16) {
        self.range_util.partition_range(self.partition_id)
    }
}

impl Display for PartitionIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic_name, self.partition_id)
    }
}

/// Maps the 16 bit hash space onto merge buckets and partitions.
///
/// The hash space is cut into `range_count` contiguous buckets of (almost)
/// equal size, the buckets are handed out to partitions in order. A merged
/// message never spans two buckets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeUtil {
    partition_count: u32,
    range_count: u32,
    /// first hash value of every bucket
    bucket_starts: Vec<u32>,
    /// first bucket of every partition
    partition_starts: Vec<u32>,
}

impl RangeUtil {
    pub fn new(partition_count: u32, range_count: u32) -> AppResult<Self> {
        if partition_count == 0 || range_count < partition_count || range_count > HASH_SPACE {
            return Err(AppError::InvalidValue(format!(
                "range count {} does not fit {} partitions",
                range_count, partition_count
            )));
        }
        let bucket_starts = (0..range_count)
            .map(|bucket| (bucket as u64 * HASH_SPACE as u64 / range_count as u64) as u32)
            .collect();
        let partition_starts = (0..partition_count)
            .map(|partition| {
                (partition as u64 * range_count as u64 / partition_count as u64) as u32
            })
            .collect();
        Ok(RangeUtil {
            partition_count,
            range_count,
            bucket_starts,
            partition_starts,
        })
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    pub fn range_count(&self) -> u32 {
        self.range_count
    }

    /// Index of the bucket `hash` falls in.
    pub fn merge_bucket(&self, hash: u16) -> u32 {
        let after = self
            .bucket_starts
            .partition_point(|start| *start <= hash as u32);
        (after - 1) as u32
    }

    /// Inclusive hash range of a bucket.
    pub fn bucket_range(&self, bucket: u32) -> (u16, u16) {
        let bucket = bucket.min(self.range_count - 1) as usize;
        let start = self.bucket_starts[bucket];
        let end = self
            .bucket_starts
            .get(bucket + 1)
            .copied()
            .unwrap_or(HASH_SPACE);
        (start as u16, (end - 1) as u16)
    }

    pub fn partition_id(&self, hash: u16) -> u32 {
        let bucket = self.merge_bucket(hash);
        let after = self
            .partition_starts
            .partition_point(|start| *start <= bucket);
        (after - 1) as u32
    }

    /// Inclusive hash range owned by `partition_id`.
    pub fn partition_range(&self, partition_id: u32) -> (u16, u16) {
        let partition = partition_id.min(self.partition_count - 1) as usize;
        let first_bucket = self.partition_starts[partition];
        let last_bucket = self
            .partition_starts
            .get(partition + 1)
            .map(|next| next - 1)
            .unwrap_or(self.range_count - 1);
        (
            self.bucket_range(first_bucket).0,
            self.bucket_range(last_bucket).1,
        )
    }

    /// End of the bucket holding `to`. Merged messages carry the highest hash
    /// of their sub-messages, so a reader asking for `[from, to]` has to look
    /// at merged messages up to here.
    pub fn merged_to(&self, to: u16) -> u16 {
        self.bucket_range(self.merge_bucket(to)).1
    }

    /// 64 bit mask with one bit per 1024 wide hash slice touched by `[from, to]`.
    pub fn compress_mask(from: u16, to: u16) -> u64 {
        if from > to {
            return 0;
        }
        let first = (from as u32) >> COMPRESS_MASK_SHIFT;
        let last = (to as u32) >> COMPRESS_MASK_SHIFT;
        (first..=last).fold(0u64, |mask, bit| mask | (1u64 << bit))
    }

    pub fn payload_mask(payload: u16) -> u64 {
        1u64 << ((payload as u32) >> COMPRESS_MASK_SHIFT)
    }
}
