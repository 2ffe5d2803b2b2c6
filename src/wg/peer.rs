use super::{Cidr, Endpoint, Key};

/// One peer line of the live table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgPeerInfo {
    // PublicKey
    pub public_key: Key,

    // Endpoint
    pub endpoint: Option<Endpoint>,

    // AllowedIPs
    pub allowed_ips: Vec<Cidr>,

    // PersistentKeepalive
    pub persistent_keepalive: Option<u32>,

    // LatestHandshake, unix seconds
    pub latest_handshake: Option<i64>,

    // Transfer
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl WgPeerInfo {
    /// Whether the last handshake happened less than `window` seconds before
    /// `now`. A handshake stamped in the future counts as age zero.
    pub fn is_online(&self, now: i64, window: std::time::Duration) -> bool {
        match self.latest_handshake {
            Some(ts) => ((now - ts).max(0) as u64) < window.as_secs(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::WgPeerInfo;

    fn with_handshake(ts: Option<i64>) -> WgPeerInfo {
        WgPeerInfo {
            latest_handshake: ts,
            ..Default::default()
        }
    }

    #[test]
    fn test_online_window() {
        let now = 1_700_000_000;
        let window = Duration::from_secs(120);

        assert!(with_handshake(Some(now - 90)).is_online(now, window));
        assert!(!with_handshake(Some(now - 150)).is_online(now, window));
        assert!(!with_handshake(None).is_online(now, window));
        // clock skew
        assert!(with_handshake(Some(now + 30)).is_online(now, window));
    }
}
