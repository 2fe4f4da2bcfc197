use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use crate::topic::TopicMessage;

/// Incomplete chunk groups are dropped after this long.
const GROUP_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct ChunkGroup {
    total: u32,
    parts: BTreeMap<u32, TopicMessage>,
    first_seen: Instant,
}

/// Buffers multi-part log messages until every part of a group has arrived,
/// then releases one synthetic message with the concatenated payload. Expiry
/// runs opportunistically on every feed.
#[derive(Debug)]
pub struct ChunkReassembler {
    groups: Mutex<HashMap<String, ChunkGroup>>,
    max_age: Duration,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            max_age: GROUP_MAX_AGE,
        }
    }

    #[cfg(test)]
    fn with_max_age(max_age: Duration) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            max_age,
        }
    }

    /// Passes unchunked messages straight through. Chunked ones are buffered
    /// by group until complete; a part whose `total` disagrees with the
    /// group's is dropped rather than corrupting what is already buffered.
    pub fn feed(&self, message: TopicMessage) -> Option<TopicMessage> {
        let mut groups = self.groups.lock();
        groups.retain(|group_id, group| {
            let keep = group.first_seen.elapsed() <= self.max_age;
            if !keep {
                warn!(
                    group_id,
                    received = group.parts.len(),
                    expected = group.total,
                    "dropping incomplete chunk group"
                );
            }
            keep
        });

        let Some(chunk) = message.chunk_info.clone() else {
            return Some(message);
        };
        // A single-part "group" is not really chunked.
        if chunk.total <= 1 {
            return Some(TopicMessage {
                chunk_info: None,
                ..message
            });
        }
        let Some(group_id) = chunk.group_id().map(str::to_string) else {
            warn!(
                seq = message.sequence_number,
                "chunked message without a group id, treating as unchunked"
            );
            return Some(TopicMessage {
                chunk_info: None,
                ..message
            });
        };

        let group = groups.entry(group_id.clone()).or_insert_with(|| ChunkGroup {
            total: chunk.total,
            parts: BTreeMap::new(),
            first_seen: Instant::now(),
        });

        if group.total != chunk.total {
            warn!(
                group_id,
                expected = group.total,
                got = chunk.total,
                "chunk part disagrees on group size, dropping it"
            );
            return None;
        }
        if group.parts.contains_key(&chunk.number) {
            warn!(group_id, number = chunk.number, "duplicate chunk part, dropping it");
            return None;
        }

        group.parts.insert(chunk.number, message);

        if group.parts.len() as u32 == group.total {
            return groups.remove(&group_id).map(assemble);
        }

        None
    }
}

/// The synthetic message carries the sequence number and timestamp of the
/// last-indexed part and no chunk info.
fn assemble(group: ChunkGroup) -> TopicMessage {
    let mut payload = Vec::new();
    for part in group.parts.values() {
        payload.extend_from_slice(&part.payload);
    }

    let last = group.parts.values().next_back().expect("non-empty group");
    TopicMessage {
        sequence_number: last.sequence_number,
        consensus_timestamp: last.consensus_timestamp.clone(),
        payload,
        payer: last.payer.clone(),
        chunk_info: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::testing::{chunk_message, plain_message};

    #[test]
    fn passes_unchunked_messages_through() {
        let reassembler = ChunkReassembler::new();
        let message = plain_message(4, b"plain");
        let out = reassembler.feed(message.clone()).unwrap();
        assert_eq!(out.sequence_number, 4);
        assert_eq!(out.payload, b"plain");
    }

    #[test]
    fn single_part_group_is_treated_as_unchunked() {
        let reassembler = ChunkReassembler::new();
        let out = reassembler
            .feed(chunk_message(5, "g", 1, 1, b"whole"))
            .unwrap();
        assert_eq!(out.payload, b"whole");
        assert!(out.chunk_info.is_none());
    }

    #[test]
    fn releases_out_of_order_group_with_last_indexed_metadata() {
        let reassembler = ChunkReassembler::new();
        // part 2 of 2 arrives first, at sequence 2
        assert!(reassembler
            .feed(chunk_message(2, "1749506740.674505590", 2, 2, b"world"))
            .is_none());
        let out = reassembler
            .feed(chunk_message(3, "1749506740.674505590", 1, 2, b"hello "))
            .unwrap();

        assert_eq!(out.payload, b"hello world");
        // metadata of the highest-indexed part, not the last-delivered one
        assert_eq!(out.sequence_number, 2);
        assert_eq!(out.consensus_timestamp, "2.000000001");
        assert!(out.chunk_info.is_none());
    }

    #[test]
    fn drops_part_with_disagreeing_total() {
        let reassembler = ChunkReassembler::new();
        assert!(reassembler.feed(chunk_message(1, "g", 1, 3, b"a")).is_none());
        assert!(reassembler.feed(chunk_message(2, "g", 2, 2, b"b")).is_none());
        // the surviving group still completes with the right total
        assert!(reassembler.feed(chunk_message(3, "g", 2, 3, b"b")).is_none());
        let out = reassembler.feed(chunk_message(4, "g", 3, 3, b"c")).unwrap();
        assert_eq!(out.payload, b"abc");
    }

    #[test]
    fn duplicate_part_is_dropped() {
        let reassembler = ChunkReassembler::new();
        assert!(reassembler.feed(chunk_message(1, "g", 1, 2, b"a")).is_none());
        assert!(reassembler.feed(chunk_message(2, "g", 1, 2, b"x")).is_none());
        let out = reassembler.feed(chunk_message(3, "g", 2, 2, b"b")).unwrap();
        assert_eq!(out.payload, b"ab");
    }

    #[test]
    fn expires_stale_groups() {
        let reassembler = ChunkReassembler::with_max_age(Duration::from_millis(20));
        assert!(reassembler.feed(chunk_message(1, "g", 1, 2, b"a")).is_none());
        std::thread::sleep(Duration::from_millis(40));
        // the sweep on this feed drops the stale group, so the group restarts
        assert!(reassembler.feed(chunk_message(2, "g", 2, 2, b"b")).is_none());
        let out = reassembler.feed(chunk_message(3, "g", 1, 2, b"a")).unwrap();
        assert_eq!(out.payload, b"ab");
    }

    #[test]
    fn independent_groups_do_not_interfere() {
        let reassembler = ChunkReassembler::new();
        assert!(reassembler.feed(chunk_message(1, "g1", 1, 2, b"a")).is_none());
        assert!(reassembler.feed(chunk_message(2, "g2", 1, 2, b"x")).is_none());
        let g1 = reassembler.feed(chunk_message(3, "g1", 2, 2, b"b")).unwrap();
        assert_eq!(g1.payload, b"ab");
        let g2 = reassembler.feed(chunk_message(4, "g2", 2, 2, b"y")).unwrap();
        assert_eq!(g2.payload, b"xy");
    }
}
