//! Keeps the peer store and the daemon's live table in step.
//!
//! Every mutation runs inside one critical section per instance: read the
//! store, talk to the daemon, then write the store. A daemon failure aborts
//! before the store is touched, so the two sides only drift when the process
//! dies between the daemon call and the store write; [`Reconciler::reconcile`]
//! repairs that.

use std::{future::Future, net::Ipv4Addr};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    settings::Settings,
    store::{Peer, PeerStore, now_epoch_secs},
    wg::{Cidr, Endpoint, Key, KeyPair, WgState, WireguardApi, config, peer::WgPeerInfo},
};

#[derive(Debug, Clone)]
pub struct CreatedPeer {
    pub peer: Peer,
    pub profile: String,
}

/// Stored metadata merged with what the daemon reports right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub id: Uuid,
    pub name: String,
    pub public_key: Key,
    pub address: Ipv4Addr,
    pub enabled: bool,
    pub created_at: i64,
    pub last_used: Option<i64>,
    pub usage_count: u64,

    /// False when the daemon could not be queried; live fields are zero then.
    pub live: bool,
    pub online: bool,
    pub endpoint: Option<Endpoint>,
    pub last_handshake: Option<i64>,
    /// Counters of the current daemon session.
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Traffic since the stored totals were last refreshed.
    pub rx_delta: u64,
    pub tx_delta: u64,
    pub total_rx: u64,
    pub total_tx: u64,
}

#[derive(Debug, Clone)]
pub struct PeerDetails {
    pub view: PeerView,
    pub profile: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub enabled: usize,
    pub online: Vec<PeerView>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
}

pub struct Reconciler<W> {
    store: PeerStore,
    wg: W,
    settings: Settings,
    lock: Mutex<()>,
}

impl<W> Reconciler<W>
where
    W: WireguardApi<Error = Error>,
{
    pub fn new(store: PeerStore, wg: W, settings: Settings) -> Self {
        Self {
            store,
            wg,
            settings,
            lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Allocates an address and keys, registers the peer with the daemon and
    /// only then writes the row. Nothing is kept if the daemon refuses.
    pub async fn create_peer(
        &self,
        name: Option<&str>,
        preshared_key: bool,
    ) -> Result<CreatedPeer> {
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => default_name(),
        };

        let _guard = self.lock.lock().await;

        let taken = self.store.allocated_addresses()?;
        let address = self.settings.pool.allocate(&taken)?;
        let psk = preshared_key.then(Key::random);
        let peer = Peer::new(name, KeyPair::generate(), psk, address);

        // a timed out add may still have landed
        if let Err(err) = self.daemon_set(&peer, true).await {
            log::error!("adding peer {} failed: {err}", peer.name);
            self.undo_add(&peer).await;
            return Err(err);
        }

        if let Err(err) = self.store.insert(&peer) {
            log::error!("storing peer {} failed, rolling back daemon entry", peer.name);
            self.undo_add(&peer).await;
            return Err(err.into());
        }

        self.save().await;
        log::info!("created peer {} ({}) at {}", peer.name, peer.id, peer.address);

        let profile = self.render_profile(&peer);
        Ok(CreatedPeer { peer, profile })
    }

    /// Removes the daemon entry first; the row survives any daemon failure.
    pub async fn delete_peer(&self, id: Uuid) -> Result<Peer> {
        let _guard = self.lock.lock().await;

        let peer = self.store.get(id)?.ok_or(Error::PeerNotFound(id))?;
        self.daemon_set(&peer, false).await?;

        if !self.store.delete(id)? {
            return Err(Error::PeerNotFound(id));
        }

        self.save().await;
        log::info!("deleted peer {} ({})", peer.name, peer.id);

        Ok(peer)
    }

    pub async fn toggle_peer(&self, id: Uuid) -> Result<Peer> {
        let _guard = self.lock.lock().await;

        let peer = self.store.get(id)?.ok_or(Error::PeerNotFound(id))?;
        let enabled = !peer.enabled;
        self.apply_enabled(peer, enabled).await
    }

    /// Same as toggling towards `enabled`, but repeatable.
    pub async fn set_peer_enabled(&self, id: Uuid, enabled: bool) -> Result<Peer> {
        let _guard = self.lock.lock().await;

        let peer = self.store.get(id)?.ok_or(Error::PeerNotFound(id))?;
        self.apply_enabled(peer, enabled).await
    }

    async fn apply_enabled(&self, mut peer: Peer, enabled: bool) -> Result<Peer> {
        self.daemon_set(&peer, enabled).await?;

        if !self.store.set_enabled(peer.id, enabled)? {
            return Err(Error::PeerNotFound(peer.id));
        }
        peer.enabled = enabled;

        self.save().await;
        log::info!(
            "peer {} ({}) {}",
            peer.name,
            peer.id,
            if enabled { "enabled" } else { "disabled" }
        );

        Ok(peer)
    }

    /// All stored peers with live stats joined in. Works with the daemon down,
    /// in which case only stored fields are filled.
    pub async fn list_peers(&self) -> Result<Vec<PeerView>> {
        let peers = self.store.list()?;
        let live = self.live_status().await;
        let now = now_epoch_secs();

        let views = peers
            .iter()
            .map(|peer| {
                let info = live.as_ref().map(|state| state.peer(&peer.public_key));
                self.merge(peer, info, now)
            })
            .collect();

        if let Some(state) = &live {
            self.refresh_counters(&peers, state).await;
        }

        Ok(views)
    }

    /// One peer with its profile. Counts as a use of the profile.
    pub async fn get_peer(&self, id: Uuid) -> Result<PeerDetails> {
        {
            let _guard = self.lock.lock().await;
            if !self.store.record_usage(id, now_epoch_secs())? {
                return Err(Error::PeerNotFound(id));
            }
        }

        let peer = self.store.get(id)?.ok_or(Error::PeerNotFound(id))?;
        let live = self.live_status().await;
        let info = live.as_ref().map(|state| state.peer(&peer.public_key));

        Ok(PeerDetails {
            view: self.merge(&peer, info, now_epoch_secs()),
            profile: self.render_profile(&peer),
        })
    }

    pub async fn summary(&self) -> Result<Summary> {
        let views = self.list_peers().await?;

        Ok(Summary {
            total: views.len(),
            enabled: views.iter().filter(|v| v.enabled).count(),
            online: views.into_iter().filter(|v| v.online).collect(),
        })
    }

    pub async fn reset_counters(&self, id: Uuid) -> Result<()> {
        let _guard = self.lock.lock().await;

        if !self.store.reset_counters(id)? {
            return Err(Error::PeerNotFound(id));
        }

        log::info!("reset counters of peer {id}");
        Ok(())
    }

    /// Re-adds enabled peers missing from the daemon and removes disabled
    /// ones it still has. Live peers unknown to the store are left alone.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _guard = self.lock.lock().await;

        let live = self.wg.dump(&self.settings.interface).await?;
        let peers = self.store.list()?;
        let mut report = ReconcileReport::default();

        for peer in &peers {
            let entry = live.peer(&peer.public_key);
            let route = Cidr::host(peer.address);
            let routed = entry.is_some_and(|e| e.allowed_ips.contains(&route));

            let enable = match (peer.enabled, entry.is_some()) {
                (true, _) if !routed => true,
                (false, true) => false,
                _ => continue,
            };

            match self.daemon_set(peer, enable).await {
                Ok(()) if enable => report.added += 1,
                Ok(()) => report.removed += 1,
                Err(err) => {
                    log::error!("reconcile of peer {} failed: {err}", peer.id);
                    report.failed += 1;
                }
            }
        }

        if report.added + report.removed > 0 {
            self.save().await;
        }

        log::info!(
            "reconciled {}: {} added, {} removed, {} failed",
            self.settings.interface,
            report.added,
            report.removed,
            report.failed
        );

        Ok(report)
    }

    pub fn render_profile(&self, peer: &Peer) -> String {
        config::render(peer, &self.settings)
    }

    async fn live_status(&self) -> Option<WgState> {
        match self.wg.dump(&self.settings.interface).await {
            Ok(state) => Some(state),
            Err(err) => {
                log::warn!("live status unavailable: {err}");
                None
            }
        }
    }

    /// Best effort: a failed write only costs freshness of the totals.
    async fn refresh_counters(&self, peers: &[Peer], state: &WgState) {
        let _guard = self.lock.lock().await;

        for peer in peers {
            let Some(info) = state.peer(&peer.public_key) else {
                continue;
            };

            let grown = info.rx_bytes > peer.total_rx
                || info.tx_bytes > peer.total_tx
                || info.latest_handshake > peer.last_handshake;
            if !grown {
                continue;
            }

            if let Err(err) = self.store.update_counters(
                peer.id,
                info.rx_bytes,
                info.tx_bytes,
                info.latest_handshake,
            ) {
                log::warn!("counter refresh of peer {} failed: {err}", peer.id);
            }
        }
    }

    /// `None` means the daemon was not asked; `Some(None)` means it was and
    /// does not know the peer.
    fn merge(&self, peer: &Peer, info: Option<Option<&WgPeerInfo>>, now: i64) -> PeerView {
        let live = info.is_some();
        let info = info.flatten();

        let (rx, tx) = info.map(|i| (i.rx_bytes, i.tx_bytes)).unwrap_or_default();
        let last_handshake = info
            .and_then(|i| i.latest_handshake)
            .max(peer.last_handshake);

        PeerView {
            id: peer.id,
            name: peer.name.clone(),
            public_key: peer.public_key,
            address: peer.address,
            enabled: peer.enabled,
            created_at: peer.created_at,
            last_used: peer.last_used,
            usage_count: peer.usage_count,
            live,
            online: info.is_some_and(|i| i.is_online(now, self.settings.online_window)),
            endpoint: info.and_then(|i| i.endpoint.clone()),
            last_handshake,
            rx_bytes: rx,
            tx_bytes: tx,
            rx_delta: rx.saturating_sub(peer.total_rx),
            tx_delta: tx.saturating_sub(peer.total_tx),
            total_rx: peer.total_rx.max(rx),
            total_tx: peer.total_tx.max(tx),
        }
    }

    async fn daemon_set(&self, peer: &Peer, enabled: bool) -> Result<()> {
        let allowed = [Cidr::host(peer.address)];

        retry_once(|| {
            self.wg.set_peer_enabled(
                &self.settings.interface,
                peer.public_key,
                &allowed,
                peer.preshared_key,
                enabled,
            )
        })
        .await
    }

    /// Reconciliation never touches keys the store does not know, so a
    /// half-created peer has to go here.
    async fn undo_add(&self, peer: &Peer) {
        if let Err(err) = self
            .wg
            .remove_peer(&self.settings.interface, peer.public_key)
            .await
        {
            log::error!("rollback of {} failed: {err}", peer.public_key);
        }
    }

    async fn save(&self) {
        if !self.settings.save_config {
            return;
        }

        if let Err(err) = self.wg.save(&self.settings.interface).await {
            log::warn!("saving {} config failed: {err}", self.settings.interface);
        }
    }
}

/// Runs `op`, and once more if the first failure looks transient.
async fn retry_once<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(err) if err.is_transient() => {
            log::warn!("wg command failed, retrying once: {err}");
            op().await
        }
        res => res,
    }
}

fn default_name() -> String {
    chrono::Local::now().format("Peer-%Y%m%d-%H%M%S").to_string()
}
