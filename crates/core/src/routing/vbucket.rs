//! Partitioned bucket routing.

use cbcore_errors::{CoreError, CoreResult, ErrorKind};

/// Key to vbucket to node mapping for a partitioned bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbucketMap {
    entries: Vec<Vec<i32>>,
    num_replicas: usize,
}

impl VbucketMap {
    pub fn new(entries: Vec<Vec<i32>>, num_replicas: usize) -> Self {
        Self { entries, num_replicas }
    }

    pub fn is_valid(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(|e| !e.is_empty())
    }

    pub fn num_vbuckets(&self) -> usize {
        self.entries.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn vbucket_by_key(&self, key: &[u8]) -> u16 {
        if self.entries.is_empty() {
            return 0;
        }
        (crc32fast::hash(key) % self.entries.len() as u32) as u16
    }

    /// Server index owning `replica` of `vbucket`. `-1` marks an unassigned copy.
    pub fn node_by_vbucket(&self, vbucket: u16, replica: u32) -> CoreResult<i32> {
        let entry = self
            .entries
            .get(vbucket as usize)
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidVbucket))?;
        if replica as usize > self.num_replicas {
            return Err(CoreError::new(ErrorKind::InvalidReplica));
        }
        entry
            .get(replica as usize)
            .copied()
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidReplica))
    }

    pub fn node_by_key(&self, key: &[u8], replica: u32) -> CoreResult<i32> {
        self.node_by_vbucket(self.vbucket_by_key(key), replica)
    }

    /// Vbuckets whose copy `replica` lives on `server`.
    pub fn vbuckets_by_server(&self, server: i32, replica: usize) -> Vec<u16> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.get(replica) == Some(&server))
            .map(|(vb, _)| vb as u16)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> VbucketMap {
        let entries = (0..1024).map(|vb| vec![vb % 3, (vb + 1) % 3]).collect();
        VbucketMap::new(entries, 1)
    }

    #[test]
    fn test_vbucket_is_crc_mod_count() {
        let m = map();
        assert_eq!(m.vbucket_by_key(b"k1") as u32, crc32fast::hash(b"k1") % 1024);
    }

    #[test]
    fn test_node_by_key_matches_node_by_vbucket() {
        let m = map();
        for i in 0..200 {
            let key = format!("key-{i}");
            let vb = m.vbucket_by_key(key.as_bytes());
            assert_eq!(m.node_by_key(key.as_bytes(), 0).unwrap(), m.node_by_vbucket(vb, 0).unwrap());
        }
    }

    #[test]
    fn test_invalid_lookups() {
        let m = map();
        assert!(m.node_by_vbucket(5000, 0).unwrap_err().is(ErrorKind::InvalidVbucket));
        assert!(m.node_by_vbucket(1, 2).unwrap_err().is(ErrorKind::InvalidReplica));
        assert_eq!(m.node_by_vbucket(1, 1).unwrap(), 2);
    }

    #[test]
    fn test_vbuckets_by_server() {
        let m = VbucketMap::new(vec![vec![0], vec![1], vec![0]], 0);
        assert_eq!(m.vbuckets_by_server(0, 0), vec![0, 2]);
        assert!(!VbucketMap::new(vec![], 0).is_valid());
    }
}
