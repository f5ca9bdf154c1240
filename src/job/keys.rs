//! Partition-aware job keys.
//!
//! Every key carries the id of the partition that created it in its upper bits, so a
//! command addressed to a job can be routed without a lookup table.

/// Number of low bits reserved for the per-partition counter.
pub const KEY_BITS: u32 = 51;

/// Job keys are partition-scoped but globally unique.
pub type JobKey = i64;

/// Encode a partition id and a local counter into a key.
pub fn encode_key(partition_id: u32, local: i64) -> i64 {
    ((partition_id as i64) << KEY_BITS) + local
}

/// Extract the partition id that produced `key`.
pub fn decode_partition_id(key: i64) -> u32 {
    (key >> KEY_BITS) as u32
}

/// Monotonic key source for one partition.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    partition_id: u32,
    next: i64,
}

impl KeyGenerator {
    pub fn new(partition_id: u32) -> Self {
        Self {
            partition_id,
            next: 1,
        }
    }

    pub fn next_key(&mut self) -> i64 {
        let key = encode_key(self.partition_id, self.next);
        self.next += 1;
        key
    }
}
