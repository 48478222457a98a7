//! Shard bucket arithmetic
//!
//! Large bots must keep shards of the same bucket (`shard / bucket_size`)
//! on one node. `buckets_per_node` groups buckets further into node slots,
//! which is the unit the reconciliation monitor colocates.

/// Bucket grouping parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketLayout {
    /// Shards per bucket, `0` or `1` disables bucketing
    pub bucket_size: u32,
    /// Buckets per node slot, `0` treats every bucket as its own slot
    pub buckets_per_node: u32,
}

impl BucketLayout {
    pub fn new(bucket_size: u32, buckets_per_node: u32) -> Self {
        Self {
            bucket_size,
            buckets_per_node,
        }
    }

    pub fn bucket_for_shard(&self, shard_id: u32) -> u32 {
        if self.bucket_size > 1 {
            shard_id / self.bucket_size
        } else {
            0
        }
    }

    /// Node slot a shard belongs to; shards with different slots must not
    /// share a node
    pub fn node_slot_for_shard(&self, shard_id: u32) -> u32 {
        let bucket = self.bucket_for_shard(shard_id);
        if self.buckets_per_node != 0 {
            bucket / self.buckets_per_node
        } else {
            bucket
        }
    }

    /// Max shards started at once for one slot, `None` if unbounded
    pub fn batch_limit(&self) -> Option<usize> {
        (self.bucket_size != 0).then_some(self.bucket_size as usize)
    }
}
