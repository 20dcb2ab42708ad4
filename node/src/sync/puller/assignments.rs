//! In-flight assignments with hash, per-peer and height-ordered views.
//!
//! All three views are updated together by every mutation so they always
//! describe the same set.

use super::types::AssignedDownload;
use crate::chain::BlockHeader;
use crate::p2p::PeerId;
use alloy_primitives::B256;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Key of the height-ordered view. `seq` breaks ties between forks at the
/// same height and preserves assignment order within a height.
type HeightKey = (u64, u64);

#[derive(Debug, Clone, Copy)]
struct Entry {
    download: AssignedDownload,
    seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct AssignmentTable {
    by_hash: HashMap<B256, Entry>,
    by_peer: HashMap<PeerId, HashSet<B256>>,
    by_height: BTreeMap<HeightKey, B256>,
    next_seq: u64,
}

/// Released headers regrouped by their original job, in assignment order.
pub(crate) type ReleasedJobs = Vec<(u64, Vec<BlockHeader>)>;

impl AssignmentTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub(crate) fn get(&self, hash: &B256) -> Option<&AssignedDownload> {
        self.by_hash.get(hash).map(|entry| &entry.download)
    }

    /// Adds an assignment. Returns false if the header is already assigned.
    pub(crate) fn insert(&mut self, download: AssignedDownload) -> bool {
        let hash = download.header.hash;
        if self.by_hash.contains_key(&hash) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_hash.insert(hash, Entry { download, seq });
        self.by_peer.entry(download.peer_id).or_default().insert(hash);
        self.by_height.insert((download.header.number, seq), hash);
        true
    }

    pub(crate) fn remove(&mut self, hash: &B256) -> Option<AssignedDownload> {
        let entry = self.by_hash.remove(hash)?;
        let peer_id = entry.download.peer_id;
        if let Some(hashes) = self.by_peer.get_mut(&peer_id) {
            hashes.remove(hash);
            if hashes.is_empty() {
                self.by_peer.remove(&peer_id);
            }
        }
        self.by_height.remove(&(entry.download.header.number, entry.seq));
        Some(entry.download)
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self, peer_id: &PeerId) -> usize {
        self.by_peer.get(peer_id).map_or(0, HashSet::len)
    }

    pub(crate) fn per_peer_counts(&self) -> HashMap<PeerId, usize> {
        self.by_peer
            .iter()
            .map(|(peer_id, hashes)| (*peer_id, hashes.len()))
            .collect()
    }

    /// Removes every assignment held by `peer_id`, in assignment order.
    pub(crate) fn take_for_peer(&mut self, peer_id: &PeerId) -> Vec<AssignedDownload> {
        let Some(hashes) = self.by_peer.remove(peer_id) else {
            return Vec::new();
        };
        let mut entries: Vec<Entry> = hashes
            .iter()
            .filter_map(|hash| self.by_hash.remove(hash))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        for entry in &entries {
            self.by_height.remove(&(entry.download.header.number, entry.seq));
        }
        entries.into_iter().map(|entry| entry.download).collect()
    }

    /// Removes a peer's assignments and regroups them by original job id.
    pub(crate) fn release_for_peer(&mut self, peer_id: &PeerId) -> ReleasedJobs {
        group_by_job(self.take_for_peer(peer_id))
    }

    /// Assignments in ascending height order.
    pub(crate) fn iter_by_height(&self) -> impl Iterator<Item = &AssignedDownload> + '_ {
        self.by_height
            .values()
            .filter_map(|hash| self.by_hash.get(hash).map(|entry| &entry.download))
    }

    pub(crate) fn clear(&mut self) {
        self.by_hash.clear();
        self.by_peer.clear();
        self.by_height.clear();
    }

    /// Cross-view consistency check used by tests.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let per_peer: usize = self.by_peer.values().map(HashSet::len).sum();
        assert_eq!(per_peer, self.by_hash.len(), "per-peer view out of sync");
        assert_eq!(self.by_height.len(), self.by_hash.len(), "height view out of sync");
        let mut last = 0u64;
        for download in self.iter_by_height() {
            assert!(download.header.number >= last, "height view not ascending");
            last = download.header.number;
        }
        for (peer_id, hashes) in &self.by_peer {
            for hash in hashes {
                assert_eq!(self.by_hash.get(hash).map(|e| e.download.peer_id), Some(*peer_id));
            }
        }
    }
}

/// Groups downloads by job id, keeping first-seen job order.
pub(crate) fn group_by_job(downloads: Vec<AssignedDownload>) -> ReleasedJobs {
    let mut grouped: ReleasedJobs = Vec::new();
    let mut positions: HashMap<u64, usize> = HashMap::new();
    for download in downloads {
        match positions.get(&download.job_id) {
            Some(&pos) => grouped[pos].1.push(download.header),
            None => {
                positions.insert(download.job_id, grouped.len());
                grouped.push((download.job_id, vec![download.header]));
            }
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::derive_header_hash;
    use crate::test_utils::test_peer_id;
    use tokio::time::Instant;

    fn header(number: u64, salt: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: derive_header_hash(B256::ZERO, number, salt),
            parent_hash: B256::ZERO,
        }
    }

    fn download(job_id: u64, peer: u8, number: u64) -> AssignedDownload {
        AssignedDownload {
            job_id,
            peer_id: test_peer_id(peer),
            header: header(number, 0),
            assigned_at: Instant::now(),
        }
    }

    #[test]
    fn insert_keeps_views_in_sync() {
        let mut table = AssignmentTable::new();
        assert!(table.insert(download(1, 1, 5)));
        assert!(table.insert(download(1, 2, 3)));
        assert!(table.insert(download(2, 1, 4)));
        table.assert_consistent();
        assert_eq!(table.len(), 3);
        assert_eq!(table.peer_count(&test_peer_id(1)), 2);
        let heights: Vec<u64> = table.iter_by_height().map(|d| d.header.number).collect();
        assert_eq!(heights, vec![3, 4, 5]);
    }

    #[test]
    fn header_is_never_assigned_twice() {
        let mut table = AssignmentTable::new();
        assert!(table.insert(download(1, 1, 5)));
        assert!(!table.insert(download(2, 2, 5)));
        assert_eq!(table.get(&header(5, 0).hash).unwrap().peer_id, test_peer_id(1));
        table.assert_consistent();
    }

    #[test]
    fn same_height_on_two_forks_is_ordered_and_removable() {
        let mut table = AssignmentTable::new();
        let mut fork = download(1, 2, 7);
        fork.header = header(7, 99);
        assert!(table.insert(download(1, 1, 7)));
        assert!(table.insert(fork));
        table.remove(&header(7, 0).hash).unwrap();
        table.assert_consistent();
        assert_eq!(table.iter_by_height().next().unwrap().peer_id, test_peer_id(2));
    }

    #[test]
    fn release_groups_by_job_in_order() {
        let mut table = AssignmentTable::new();
        table.insert(download(1, 1, 10));
        table.insert(download(2, 1, 20));
        table.insert(download(1, 2, 11));
        table.insert(download(1, 1, 12));
        table.insert(download(2, 1, 21));

        let released = table.release_for_peer(&test_peer_id(1));
        table.assert_consistent();
        let numbers: Vec<(u64, Vec<u64>)> = released
            .into_iter()
            .map(|(job, headers)| (job, headers.iter().map(|h| h.number).collect()))
            .collect();
        assert_eq!(numbers, vec![(1, vec![10, 12]), (2, vec![20, 21])]);
        assert_eq!(table.len(), 1);
        assert!(table.release_for_peer(&test_peer_id(1)).is_empty());
    }

    #[test]
    fn remove_unknown_hash_is_noop() {
        let mut table = AssignmentTable::new();
        table.insert(download(1, 1, 1));
        assert!(table.remove(&header(2, 0).hash).is_none());
        assert!(table.remove(&header(1, 0).hash).is_some());
        assert_eq!(table.len(), 0);
        table.assert_consistent();
    }
}
