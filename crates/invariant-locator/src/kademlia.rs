//! 256-bit ids, the XOR distance metric, and the k-bucket routing table.

use sha2::{Digest, Sha256};

use crate::{LocatorError, Result};

/// Maximum ids per bucket (the Kademlia K value).
pub const BUCKET_SIZE: usize = 20;

/// Length of an id in bytes.
pub const ID_LEN: usize = 32;

/// A 256-bit peer id or block address under the XOR metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; ID_LEN]);

impl PeerId {
    /// Parse a 64-character lowercase hex string.
    pub fn parse(hex_id: &str) -> Result<Self> {
        let bytes =
            hex::decode(hex_id).map_err(|_| LocatorError::MalformedId(hex_id.to_string()))?;
        let bytes: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| LocatorError::MalformedId(hex_id.to_string()))?;
        Ok(PeerId(bytes))
    }

    /// Map arbitrary bytes into the 256-bit id space. 32-byte inputs pass
    /// through; anything else is normalized by hashing with SHA-256.
    pub fn normalize(bytes: &[u8]) -> Self {
        if let Ok(exact) = <[u8; ID_LEN]>::try_from(bytes) {
            return PeerId(exact);
        }
        let digest = Sha256::digest(bytes);
        PeerId(digest.into())
    }

    /// XOR distance to another id.
    pub fn distance(&self, other: &PeerId) -> [u8; ID_LEN] {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Number of leading zero bits in the XOR distance, which is also the
    /// bucket index.
    /// Equal ids yield 256.
    pub fn prefix_len(&self, other: &PeerId) -> usize {
        for (i, byte) in self.distance(other).iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_LEN * 8
    }

    /// True if `self` is strictly closer to `target` than `other` is. Ties
    /// resolve through the lexicographic comparison of the distance bytes,
    /// so the ordering is total and deterministic.
    pub fn closer_to(&self, other: &PeerId, target: &PeerId) -> bool {
        self.distance(target) < other.distance(target)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Compare two distances; `Less` means `a` is the shorter distance.
pub fn cmp_distance(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Kademlia routing table: 256 buckets indexed by the prefix length of
/// `self XOR peer`, each holding at most [`BUCKET_SIZE`] ids ordered
/// least-recently-seen first.
pub struct RoutingTable {
    own_id: PeerId,
    buckets: Vec<Vec<PeerId>>,
}

impl RoutingTable {
    /// Create an empty table for the given local id.
    pub fn new(own_id: PeerId) -> Self {
        Self {
            own_id,
            buckets: vec![Vec::new(); ID_LEN * 8],
        }
    }

    /// Insert or refresh a peer. A known peer moves to the tail of its
    /// bucket (most recently seen); a full bucket drops its head. This is
    /// the simple LRU stand-in for the full Kademlia liveness probe. The
    /// local id is never inserted.
    pub fn add(&mut self, peer: PeerId) {
        if peer == self.own_id {
            return;
        }
        let idx = self.own_id.prefix_len(&peer);
        if idx >= self.buckets.len() {
            return;
        }
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.iter().position(|p| *p == peer) {
            bucket.remove(pos);
            bucket.push(peer);
            return;
        }

        if bucket.len() < BUCKET_SIZE {
            bucket.push(peer);
        } else {
            bucket.remove(0);
            bucket.push(peer);
        }
    }

    /// The up-to-`count` ids closest to `target` across all buckets,
    /// ascending by distance.
    pub fn closest(&self, target: &PeerId, count: usize) -> Vec<PeerId> {
        let mut all: Vec<PeerId> = self.buckets.iter().flatten().copied().collect();
        all.sort_by(|a, b| cmp_distance(&a.distance(target), &b.distance(target)));
        all.truncate(count);
        all
    }

    /// All ids currently in the table.
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.buckets.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn parse(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    fn padded(suffix: &str) -> PeerId {
        parse(&format!("{:0>64}", suffix))
    }

    fn random_id() -> PeerId {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        PeerId(bytes)
    }

    #[test]
    fn xor_metric_laws() {
        let a = random_id();
        let b = random_id();
        let c = random_id();

        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; ID_LEN]);

        // Triangle equality under bitwise XOR: d(a,c) = d(a,b) ^ d(b,c).
        let ab = a.distance(&b);
        let bc = b.distance(&c);
        let mut via = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            via[i] = ab[i] ^ bc[i];
        }
        assert_eq!(a.distance(&c), via);
    }

    #[test]
    fn xor_of_adjacent_ids() {
        let n1 = padded("1");
        let n2 = padded("2");
        assert_eq!(n1.distance(&n2), padded("3").0);
    }

    #[test]
    fn prefix_len_pins() {
        let one = padded("1");
        let two = padded("2");
        assert_eq!(one.prefix_len(&two), 254);

        let all_ones = parse(&"f".repeat(64));
        let top_clear = parse(&format!("7{}", "f".repeat(63)));
        assert_eq!(all_ones.prefix_len(&top_clear), 0);
        assert_eq!(all_ones.prefix_len(&all_ones), 256);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(PeerId::parse("zz").is_err());
        assert!(PeerId::parse(&"a".repeat(63)).is_err());
        assert!(PeerId::parse(&"a".repeat(66)).is_err());
    }

    #[test]
    fn normalize_hashes_non_256_bit_input() {
        let exact = [7u8; 32];
        assert_eq!(PeerId::normalize(&exact).0, exact);

        let short = PeerId::normalize(b"short");
        assert_eq!(short.0.len(), 32);
        assert_eq!(short, PeerId::normalize(b"short"));
        assert_ne!(short, PeerId::normalize(b"other"));
    }

    #[test]
    fn full_bucket_keeps_twenty() {
        let own = random_id();
        let mut rt = RoutingTable::new(own);

        // Flip the top bit so every peer lands in bucket 0.
        for _ in 0..30 {
            let mut other = random_id();
            other.0[0] = own.0[0] ^ 0x80;
            rt.add(other);
        }
        assert_eq!(rt.snapshot().len(), BUCKET_SIZE);
    }

    #[test]
    fn re_adding_moves_to_tail() {
        // All peers share bucket 0 (top bit flipped relative to self).
        let own = padded("0");
        let top_bit = |low: u8| {
            let mut bytes = [0u8; ID_LEN];
            bytes[0] = 0x80;
            bytes[31] = low;
            PeerId(bytes)
        };
        let mut rt = RoutingTable::new(own);
        let a = top_bit(1);
        let b = top_bit(2);
        rt.add(a);
        rt.add(b);
        rt.add(a); // refresh: b is now the least recently seen

        // Fill the bucket and push one more; the head (b) is evicted.
        for low in 3..=BUCKET_SIZE as u8 {
            rt.add(top_bit(low));
        }
        rt.add(top_bit(200));

        let snapshot = rt.snapshot();
        assert_eq!(snapshot.len(), BUCKET_SIZE);
        assert!(snapshot.contains(&a));
        assert!(!snapshot.contains(&b));
    }

    #[test]
    fn own_id_is_never_inserted() {
        let own = random_id();
        let mut rt = RoutingTable::new(own);
        rt.add(own);
        assert!(rt.snapshot().is_empty());
    }

    #[test]
    fn closest_orders_by_distance() {
        let own = padded("0");
        let mut rt = RoutingTable::new(own);
        for suffix in ["1", "2", "4", "8"] {
            rt.add(padded(suffix));
        }
        let target = padded("1");
        let closest = rt.closest(&target, 3);
        assert_eq!(closest, vec![padded("1"), padded("2"), padded("4")]);
    }
}
