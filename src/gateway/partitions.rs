/// Id of the first partition; partition ids are `FIRST_PARTITION_ID..FIRST_PARTITION_ID + count`.
pub const FIRST_PARTITION_ID: u32 = 1;

/// Round-robin walk over all partitions, starting at an arbitrary index.
///
/// Yields every partition exactly once. The partition last returned stays available via
/// [`PartitionIdIterator::current_partition_id`] so a caller can retry it without
/// advancing.
#[derive(Debug, Clone)]
pub struct PartitionIdIterator {
    start: u32,
    count: u32,
    index: u32,
    current: u32,
}

impl PartitionIdIterator {
    pub fn new(start: u32, count: u32) -> Self {
        let start = if count == 0 { 0 } else { start % count };
        Self {
            start,
            count,
            index: 0,
            current: FIRST_PARTITION_ID + start,
        }
    }

    pub fn has_next(&self) -> bool {
        self.index < self.count
    }

    pub fn current_partition_id(&self) -> u32 {
        self.current
    }
}

impl Iterator for PartitionIdIterator {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if !self.has_next() {
            return None;
        }
        self.current = (self.start + self.index) % self.count + FIRST_PARTITION_ID;
        self.index += 1;
        Some(self.current)
    }
}
