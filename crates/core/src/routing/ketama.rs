//! Consistent hashing ring for hashed buckets.

use cbcore_errors::{CoreError, CoreResult, ErrorKind};

/// Hash points placed on the ring for every server.
pub const POINTS_PER_SERVER: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RingPoint {
    hash: u32,
    server: usize,
}

/// A ketama continuum built from the data node list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KetamaContinuum {
    points: Vec<RingPoint>,
}

impl KetamaContinuum {
    pub fn new(servers: &[String]) -> Self {
        let mut points = Vec::with_capacity(servers.len() * POINTS_PER_SERVER);
        for (server, addr) in servers.iter().enumerate() {
            for i in 0..POINTS_PER_SERVER {
                let hash = crc32fast::hash(format!("{addr}-{i}").as_bytes());
                points.push(RingPoint { hash, server });
            }
        }
        points.sort_by_key(|p| (p.hash, p.server));
        Self { points }
    }

    pub fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    /// Server index of the first point at or above the key's hash, wrapping around.
    pub fn node_by_key(&self, key: &[u8]) -> CoreResult<usize> {
        if self.points.is_empty() {
            return Err(CoreError::new(ErrorKind::InvalidServer));
        }
        let hash = crc32fast::hash(key);
        let idx = self.points.partition_point(|p| p.hash < hash);
        let point = self.points.get(idx).unwrap_or(&self.points[0]);
        Ok(point.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<String> {
        vec!["10.0.0.1:11210".into(), "10.0.0.2:11210".into(), "10.0.0.3:11210".into()]
    }

    #[test]
    fn test_ring_has_160_points_per_server() {
        let ring = KetamaContinuum::new(&servers());
        assert_eq!(ring.points.len(), 3 * POINTS_PER_SERVER);
        assert!(ring.points.windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn test_lookup_is_stable_and_spread() {
        let ring = KetamaContinuum::new(&servers());
        let mut seen = [0usize; 3];
        for i in 0..600 {
            let key = format!("doc::{i}");
            let a = ring.node_by_key(key.as_bytes()).unwrap();
            assert_eq!(a, ring.node_by_key(key.as_bytes()).unwrap());
            seen[a] += 1;
        }
        assert!(seen.iter().all(|&n| n > 0));
    }

    #[test]
    fn test_empty_ring_errors() {
        let ring = KetamaContinuum::new(&[]);
        assert!(!ring.is_valid());
        assert!(ring.node_by_key(b"k").is_err());
    }
}
