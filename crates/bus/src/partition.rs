//! Mapping of partition keys onto bus partitions.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable across processes and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Partition a key belongs to. Every event of one conversation lands on the same partition.
///
/// ```
/// use parley_bus::partition_for;
///
/// let partition = partition_for("conversation-42", 8);
/// assert!(partition < 8);
/// assert_eq!(partition, partition_for("conversation-42", 8));
/// ```
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    (fnv1a(key.as_bytes()) % u64::from(partitions.max(1))) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn keys_spread_over_all_partitions() {
        let used: HashSet<u32> = (0..200)
            .map(|index| partition_for(&format!("conversation-{index}"), 8))
            .collect();
        assert_eq!(used.len(), 8);
    }

    #[test]
    fn single_partition_takes_everything() {
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }
}
