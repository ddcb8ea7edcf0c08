use siphasher::sip::SipHasher24;
use std::collections::BTreeMap;
use std::hash::Hasher;

/// Virtual points placed on the ring for every node.
pub const DEFAULT_REPLICAS: usize = 150;

/// Consistent hash ring over a 32-bit hash space.
///
/// A ring is built once from a membership view and never mutated afterwards;
/// a refresh builds a new ring and swaps it in. Node ids are sorted and
/// deduplicated before points are generated, so every process that observes
/// the same set of nodes builds the same ring regardless of discovery order.
#[derive(Clone, Debug, Default)]
pub struct HashRing {
    points: BTreeMap<u32, usize>,
    nodes: Vec<String>,
    replicas: usize,
}

impl HashRing {
    pub fn build<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_replicas(node_ids, DEFAULT_REPLICAS)
    }

    pub fn with_replicas<I, S>(node_ids: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<String> = node_ids.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();

        let replicas = replicas.max(1);
        let mut points = BTreeMap::new();
        for (idx, id) in nodes.iter().enumerate() {
            for i in 0..replicas {
                // On a collision the node that sorts first keeps the point.
                points
                    .entry(Self::hash_key(&format!("{}#{}", id, i)))
                    .or_insert(idx);
            }
        }

        Self {
            points,
            nodes,
            replicas,
        }
    }

    /// Owner of `key`: the first virtual point at or after the key's hash,
    /// wrapping around to the smallest point.
    pub fn get(&self, key: &str) -> Option<&str> {
        let hash = Self::hash_key(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, &idx)| self.nodes[idx].as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct nodes in the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Member node ids in ring order (sorted).
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.binary_search_by(|n| n.as_str().cmp(node_id)).is_ok()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// SipHash-2-4 (zero key) over the raw key bytes, low 32 bits. The value
    /// must not change between builds; every node places the same points.
    fn hash_key(key: &str) -> u32 {
        let mut hasher = SipHasher24::new();
        hasher.write(key.as_bytes());
        hasher.finish() as u32
    }
}
