//! Which node owns a store key, and which nodes back it up.
//!
//! Placement is rendezvous hashing: every live node gets a weight per key and
//! the nodes are ranked by it. The first is the owner, the next
//! `backup_count` hold backups. When a node leaves only the keys it ranked
//! first for change owner, and each of them moves to its first backup.

/// Live nodes ranked for `key`, owner first. Ties are broken by node id.
pub fn rank_nodes<'a>(key: &str, live_nodes: &'a [String]) -> Vec<&'a str> {
    let key_hash = crc32fast::hash(key.as_bytes());
    let mut ranked: Vec<(u64, &str)> = live_nodes
        .iter()
        .map(|node| (weight(node, key_hash), node.as_str()))
        .collect();
    ranked.sort_unstable_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    ranked.dedup_by(|a, b| a.1 == b.1);
    ranked.into_iter().map(|(_, node)| node).collect()
}

/// The node owning `key`, if any node is live.
pub fn owner_of<'a>(key: &str, live_nodes: &'a [String]) -> Option<&'a str> {
    rank_nodes(key, live_nodes).into_iter().next()
}

/// The nodes holding backups of `key`.
pub fn backup_nodes<'a>(key: &str, live_nodes: &'a [String], backup_count: usize) -> Vec<&'a str> {
    rank_nodes(key, live_nodes)
        .into_iter()
        .skip(1)
        .take(backup_count)
        .collect()
}

/// Stable across processes and releases, unlike `DefaultHasher`.
fn weight(node: &str, key_hash: u32) -> u64 {
    let node_hash = crc32fast::hash(node.as_bytes());
    mix64((u64::from(node_hash) << 32) | u64::from(key_hash))
}

// splitmix64 finalizer
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
