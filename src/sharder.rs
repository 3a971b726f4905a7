//! Consistent-hash sharder (C7, §4.7): builds a ring of virtual replicas
//! over a fixed node set and routes keys (or `{tag}`-extracted hash keys) to
//! the node owning the smallest ring position at or after the key's hash.
//!
//! The ring itself is a sorted `Vec`, searched with a binary search rather
//! than walked; the same "build once, binary-search per lookup" shape the
//! teacher's sorted skip-list index uses for range lookups, just backed by a
//! flat vector since ring membership never changes after construction (§5).

use std::collections::HashMap;

use crc32fast::Hasher;
use futures_util::future::join_all;

use crate::error::{ErrorKind, RedisError, RedisResult};
use crate::handler::Handler;
use crate::resp::{Cmd, Value};

pub const DEFAULT_VIRTUAL_REPLICAS: usize = 160;

struct RingEntry {
    hash: u32,
    node: usize,
}

/// One shard's node id and the `Handler` routing commands to it.
pub struct Node {
    pub id: String,
    pub handler: Handler,
}

/// Single-key operations meaningful on a sharded handler (§4.7); anything
/// else raises *not-supported*.
const SINGLE_KEY_COMMANDS: [&str; 9] = ["GET", "SET", "DEL", "EXISTS", "EXPIRE", "TTL", "INCR", "DECR", "TYPE"];

pub struct Sharder {
    nodes: Vec<Node>,
    ring: Vec<RingEntry>,
}

/// Builds the sorted ring for a node-id list; split out from `Sharder::new`
/// so the ring's shape can be unit-tested without constructing real
/// `Handler`s.
fn build_ring(ids: &[String], virtual_replicas: usize) -> Vec<RingEntry> {
    let mut ring = Vec::with_capacity(ids.len() * virtual_replicas);
    for (idx, id) in ids.iter().enumerate() {
        for replica in 0..virtual_replicas {
            let hash = crc32(&format!("{id}:{replica}"));
            ring.push(RingEntry { hash, node: idx });
        }
    }
    ring.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node.cmp(&b.node)));
    ring
}

fn ring_lookup(ring: &[RingEntry], hash: u32) -> usize {
    let idx = ring.partition_point(|entry| entry.hash < hash);
    if idx == ring.len() { ring[0].node } else { ring[idx].node }
}

impl Sharder {
    pub fn new(nodes: Vec<Node>, virtual_replicas: usize) -> Self {
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let ring = build_ring(&ids, virtual_replicas);
        Sharder { nodes, ring }
    }

    /// Extracts the `{tag}` hash key if `key` contains one, else hashes the
    /// whole key (§4.7).
    fn hash_key(key: &str) -> u32 {
        match extract_tag(key) {
            Some(tag) => crc32(tag),
            None => crc32(key),
        }
    }

    /// Finds the node owning the smallest ring position ≥ the key's hash,
    /// wrapping to the first entry (§4.7).
    pub fn node_for_key(&self, key: &str) -> &Node {
        &self.nodes[ring_lookup(&self.ring, Self::hash_key(key))]
    }

    /// Forwards a single-key command to its owning node; raises
    /// *not-supported* for anything not in the fixed single-key command
    /// list, and for pipelining (which is always unsupported on a sharded
    /// handler, §4.7).
    pub async fn execute_command(&self, key: &str, cmd: &Cmd) -> RedisResult<Value> {
        if !SINGLE_KEY_COMMANDS.contains(&cmd.name()) {
            return Err(RedisError::new(
                ErrorKind::NotSupported,
                format!("'{}' is not a supported sharded single-key operation", cmd.name()),
            ));
        }
        self.node_for_key(key).handler.execute_command(cmd).await
    }

    /// Scatter-gathers an `MGET` across shards, reassembling results in the
    /// caller's original key order (§4.7's required position-mapping
    /// property).
    pub async fn mget(&self, keys: &[&str]) -> RedisResult<Vec<Value>> {
        let mut buckets: HashMap<usize, Vec<(usize, &str)>> = HashMap::new();
        for (position, key) in keys.iter().enumerate() {
            let node_idx = self.node_index_for_key(key);
            buckets.entry(node_idx).or_default().push((position, key));
        }

        let requests = buckets.into_iter().map(|(node_idx, entries)| {
            let handler = &self.nodes[node_idx].handler;
            async move {
                let mut cmd = Cmd::new("MGET");
                for (_, key) in &entries {
                    cmd = cmd.arg(*key);
                }
                let reply = handler.execute_command(&cmd).await?;
                let values = match reply {
                    Value::Array(values) => values,
                    other => return Err(RedisError::new(ErrorKind::InvalidResponse, format!("MGET returned {other:?}"))),
                };
                Ok::<_, RedisError>(entries.into_iter().map(|(pos, _)| pos).zip(values).collect::<Vec<_>>())
            }
        });

        let mut ordered: Vec<Option<Value>> = (0..keys.len()).map(|_| None).collect();
        for result in join_all(requests).await {
            for (position, value) in result? {
                ordered[position] = Some(value);
            }
        }
        Ok(ordered.into_iter().map(|v| v.unwrap_or(Value::Nil)).collect())
    }

    fn node_index_for_key(&self, key: &str) -> usize {
        ring_lookup(&self.ring, Self::hash_key(key))
    }
}

impl std::fmt::Display for Sharder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Redis Sharded Connection: ")?;
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", node.id)?;
        }
        write!(f, ">")
    }
}

fn crc32(s: &str) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(s.as_bytes());
    hasher.finalize()
}

/// Extracts the substring between the first `{` and the next `}` if the key
/// matches `.*\{tag\}.*` (§4.7); an empty tag (`{}`) does not count.
fn extract_tag(key: &str) -> Option<&str> {
    let start = key.find('{')?;
    let end = key[start + 1..].find('}')? + start + 1;
    let tag = &key[start + 1..end];
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn extracts_hash_tag() {
        assert_eq!(extract_tag("user:{42}:profile"), Some("42"));
        assert_eq!(extract_tag("plainkey"), None);
        assert_eq!(extract_tag("empty{}tag"), None);
    }

    #[test]
    fn ring_is_sorted_by_hash() {
        let ring = build_ring(&ids(&["a", "b", "c"]), DEFAULT_VIRTUAL_REPLICAS);
        for pair in ring.windows(2) {
            assert!(pair[0].hash <= pair[1].hash);
        }
        assert_eq!(ring.len(), 3 * DEFAULT_VIRTUAL_REPLICAS);
    }

    #[test]
    fn keys_sharing_a_tag_hash_to_the_same_node() {
        let ring = build_ring(&ids(&["n1", "n2", "n3"]), DEFAULT_VIRTUAL_REPLICAS);
        let a = ring_lookup(&ring, Sharder::hash_key("user:{42}:profile"));
        let b = ring_lookup(&ring, Sharder::hash_key("user:{42}:settings"));
        assert_eq!(a, b);
    }

    #[test]
    fn lookup_wraps_to_first_entry_past_the_largest_hash() {
        let ring = build_ring(&ids(&["solo"]), 4);
        let max_hash = ring.iter().map(|e| e.hash).max().unwrap();
        assert_eq!(ring_lookup(&ring, max_hash.wrapping_add(1)), 0);
    }
}
