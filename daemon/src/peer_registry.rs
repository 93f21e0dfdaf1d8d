//! UDP peer tracking
//!
//! UDP has no connections, so the server keeps a context per (address,
//! authorisation code) and forgets peers that go quiet.

use crate::decoder::RecordDecoder;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};
use wxpush_replication::SessionIdentity;
use wxpush_transport::UdpFramer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub addr: SocketAddr,
    pub auth_code: u64,
}

/// Session state for one UDP client
pub struct UdpPeer {
    pub identity: Option<SessionIdentity>,
    pub decoder: RecordDecoder,
    /// Stamps replies with this peer's auth code and our sequence
    pub framer: UdpFramer,
}

struct PeerEntry {
    last_seen: Instant,
    state: Arc<Mutex<UdpPeer>>,
}

/// Registry of active UDP peers
pub struct PeerRegistry {
    peers: DashMap<PeerKey, PeerEntry>,
    expiry: Duration,
    mtu: usize,
}

impl PeerRegistry {
    pub fn new(expiry: Duration, mtu: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            expiry,
            mtu,
        })
    }

    /// Look up a peer, creating it if unseen, and mark it as active.
    /// Returns the state and whether it was newly created.
    pub fn touch(&self, key: PeerKey, now: Instant) -> (Arc<Mutex<UdpPeer>>, bool) {
        let mut created = false;
        let mut entry = self.peers.entry(key).or_insert_with(|| {
            created = true;
            debug!(peer = %key.addr, "New UDP peer");
            PeerEntry {
                last_seen: now,
                state: Arc::new(Mutex::new(UdpPeer {
                    identity: None,
                    decoder: RecordDecoder::new(),
                    framer: UdpFramer::new(key.auth_code, self.mtu),
                })),
            }
        });
        entry.last_seen = now;
        (entry.state.clone(), created)
    }

    /// Forget peers idle for longer than the expiry. Returns how many went.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= self.expiry);
        let evicted = before.saturating_sub(self.peers.len());
        if evicted > 0 {
            info!("Evicted {} idle UDP peers", evicted);
        }
        evicted
    }

    /// Get number of tracked peers
    pub fn count(&self) -> usize {
        self.peers.len()
    }
}
