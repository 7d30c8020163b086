#![forbid(unsafe_code)]

// Port leasing for tap transport egress (the transcoder's listening ports)

use crate::media::types::{MediaError, MediaResult};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tracing::debug;

/// Redraws before giving up on a crowded range
const MAX_DRAWS: usize = 256;

/// Process-wide set of leased ports, each tagged with the owner that holds it.
///
/// Ports are drawn uniformly from the range and redrawn on collision; the set
/// stays small relative to the range, so collisions are rare.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    leases: StdMutex<HashMap<u16, String>>,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> MediaResult<Self> {
        // Pairs need port + 1 inside the range
        if min_port >= max_port {
            return Err(MediaError::ConfigurationError(format!(
                "invalid tap port range {min_port}..={max_port}"
            )));
        }
        Ok(Self {
            min_port,
            max_port,
            leases: StdMutex::new(HashMap::new()),
        })
    }

    /// Leases a single port for `owner`
    pub fn lease(&self, owner: &str) -> MediaResult<u16> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_DRAWS {
            let port = rng.gen_range(self.min_port..=self.max_port);
            if !leases.contains_key(&port) {
                leases.insert(port, owner.to_string());
                debug!("Leased port {} to {}", port, owner);
                return Ok(port);
            }
        }
        Err(self.exhausted())
    }

    /// Leases an RTP port and the RTCP port right above it
    pub fn lease_pair(&self, owner: &str) -> MediaResult<(u16, u16)> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_DRAWS {
            let rtp = rng.gen_range(self.min_port..self.max_port);
            let rtcp = rtp + 1;
            if !leases.contains_key(&rtp) && !leases.contains_key(&rtcp) {
                leases.insert(rtp, owner.to_string());
                leases.insert(rtcp, owner.to_string());
                debug!("Leased port pair {}/{} to {}", rtp, rtcp, owner);
                return Ok((rtp, rtcp));
            }
        }
        Err(self.exhausted())
    }

    /// Releases every port held by `owner`, returning how many were freed
    pub fn release(&self, owner: &str) -> usize {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        let before = leases.len();
        leases.retain(|_, holder| holder != owner);
        let freed = before - leases.len();
        if freed > 0 {
            debug!("Released {} port(s) held by {}", freed, owner);
        }
        freed
    }

    #[cfg(test)]
    pub fn is_leased(&self, port: u16) -> bool {
        self.leases.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.leases.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn exhausted(&self) -> MediaError {
        MediaError::PortsExhausted {
            min: self.min_port,
            max: self.max_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_leases_are_distinct() {
        let allocator = PortAllocator::new(20000, 20999).unwrap();
        let mut seen = HashSet::new();
        for i in 0..300 {
            let port = allocator.lease(&format!("owner-{}", i % 3)).unwrap();
            assert!((20000..=20999).contains(&port));
            assert!(seen.insert(port), "port {port} leased twice");
        }
        assert_eq!(allocator.leased_count(), 300);
    }

    #[test]
    fn test_pairs_are_adjacent_and_distinct() {
        let allocator = PortAllocator::new(20000, 20100).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let (rtp, rtcp) = allocator.lease_pair("tap").unwrap();
            assert_eq!(rtcp, rtp + 1);
            assert!(rtcp <= 20100);
            assert!(seen.insert(rtp));
            assert!(seen.insert(rtcp));
        }
    }

    #[test]
    fn test_release_frees_only_owner_ports() {
        let allocator = PortAllocator::new(20000, 30000).unwrap();
        let (a_rtp, _) = allocator.lease_pair("room-a").unwrap();
        let b = allocator.lease("room-b").unwrap();

        assert_eq!(allocator.release("room-a"), 2);
        assert!(!allocator.is_leased(a_rtp));
        assert!(allocator.is_leased(b));
        assert_eq!(allocator.release("room-a"), 0);
    }

    #[test]
    fn test_exhausted_range_is_an_error() {
        let allocator = PortAllocator::new(20000, 20001).unwrap();
        allocator.lease_pair("tap").unwrap();
        assert!(matches!(
            allocator.lease("tap"),
            Err(MediaError::PortsExhausted { min: 20000, max: 20001 })
        ));
    }

    #[test]
    fn test_rejects_empty_range() {
        assert!(PortAllocator::new(3000, 3000).is_err());
    }
}
