use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::Error;

use super::{Cidr, Key, WgState, WireguardApi, peer::WgPeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    CommandFailed,
    /// The change lands in the table, then the call times out.
    AppliedThenTimedOut,
}

impl Fault {
    fn into_error(self) -> Error {
        match self {
            Fault::Unavailable => Error::DaemonUnavailable("fake wg is down".into()),
            Fault::CommandFailed => Error::DaemonCommandFailed {
                exit_code: Some(1),
                stderr: "injected failure".into(),
            },
            Fault::AppliedThenTimedOut => Error::DaemonCommandFailed {
                exit_code: None,
                stderr: "wg timed out".into(),
            },
        }
    }
}

/// In-memory live table with scripted failures.
#[derive(Debug, Default)]
pub struct FakeWg {
    pub server_key: Key,
    peers: Mutex<HashMap<Key, WgPeerInfo>>,
    faults: Mutex<VecDeque<Fault>>,
    down: Mutex<bool>,
    calls: Mutex<usize>,
    saves: Mutex<usize>,
}

impl FakeWg {
    /// The next `times` daemon calls fail with `fault`.
    pub fn fail_next(&self, fault: Fault, times: usize) {
        self.faults.lock().extend(std::iter::repeat_n(fault, times));
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock() = down;
    }

    pub fn has_peer(&self, key: &Key) -> bool {
        self.peers.lock().contains_key(key)
    }

    pub fn peer(&self, key: &Key) -> Option<WgPeerInfo> {
        self.peers.lock().get(key).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }

    /// Puts a peer in the table behind the manager's back.
    pub fn insert_peer(&self, info: WgPeerInfo) {
        self.peers.lock().insert(info.public_key, info);
    }

    pub fn drop_peer(&self, key: &Key) {
        self.peers.lock().remove(key);
    }

    pub fn set_stats(&self, key: &Key, latest_handshake: Option<i64>, rx: u64, tx: u64) {
        if let Some(peer) = self.peers.lock().get_mut(key) {
            peer.latest_handshake = latest_handshake;
            peer.rx_bytes = rx;
            peer.tx_bytes = tx;
        }
    }

    /// Fails up front, or hands back a fault to raise after the change.
    async fn check(&self) -> Result<Option<Fault>, Error> {
        *self.calls.lock() += 1;

        // let other callers interleave, like a real subprocess would
        tokio::task::yield_now().await;

        if *self.down.lock() {
            return Err(Fault::Unavailable.into_error());
        }

        match self.faults.lock().pop_front() {
            Some(Fault::AppliedThenTimedOut) => Ok(Some(Fault::AppliedThenTimedOut)),
            Some(fault) => Err(fault.into_error()),
            None => Ok(None),
        }
    }
}

fn finish(late: Option<Fault>) -> Result<(), Error> {
    match late {
        Some(fault) => Err(fault.into_error()),
        None => Ok(()),
    }
}

impl WireguardApi for FakeWg {
    type Error = Error;

    async fn get_pub_key(&self, _iface: &str) -> Result<Key, Self::Error> {
        finish(self.check().await?)?;
        Ok(self.server_key)
    }

    async fn add_peer(
        &self,
        _iface: &str,
        peer: Key,
        allowed_ips: &[Cidr],
        _preshared_key: Option<Key>,
    ) -> Result<(), Self::Error> {
        let late = self.check().await?;

        self.peers
            .lock()
            .entry(peer)
            .or_insert_with(|| WgPeerInfo {
                public_key: peer,
                ..Default::default()
            })
            .allowed_ips = allowed_ips.to_vec();

        finish(late)
    }

    async fn remove_peer(&self, _iface: &str, peer: Key) -> Result<(), Self::Error> {
        let late = self.check().await?;
        self.peers.lock().remove(&peer);
        finish(late)
    }

    async fn dump(&self, _iface: &str) -> Result<WgState, Self::Error> {
        finish(self.check().await?)?;

        Ok(WgState {
            interface: None,
            peers: self.peers.lock().values().cloned().collect(),
        })
    }

    async fn save(&self, _iface: &str) -> Result<(), Self::Error> {
        *self.saves.lock() += 1;
        Ok(())
    }
}
