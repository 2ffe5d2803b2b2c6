use std::{net::IpAddr, time::Duration};

use crate::{
    alloc::AddressPool,
    wg::{Cidr, Endpoint, Key, cmd::DEFAULT_TIMEOUT},
};

pub const DEFAULT_ONLINE_WINDOW: Duration = Duration::from_secs(120);
pub const DEFAULT_KEEPALIVE: u32 = 25;

/// Everything the reconciler needs to know about the server side. Passed in
/// at construction, so several instances can coexist in one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub interface: String,
    pub pool: AddressPool,
    pub dns: Vec<IpAddr>,
    /// Routes the client sends through the tunnel.
    pub allowed_ips: Vec<Cidr>,
    pub server_public_key: Key,
    pub server_endpoint: Endpoint,
    pub persistent_keepalive: Option<u32>,
    pub online_window: Duration,
    pub command_timeout: Duration,
    /// Run `wg-quick save` after every change to the live table.
    pub save_config: bool,
}

impl Settings {
    pub fn new(
        interface: impl Into<String>,
        pool: AddressPool,
        server_public_key: Key,
        server_endpoint: Endpoint,
    ) -> Self {
        Self {
            interface: interface.into(),
            pool,
            dns: Vec::new(),
            allowed_ips: vec![Cidr::default()],
            server_public_key,
            server_endpoint,
            persistent_keepalive: Some(DEFAULT_KEEPALIVE),
            online_window: DEFAULT_ONLINE_WINDOW,
            command_timeout: DEFAULT_TIMEOUT,
            save_config: false,
        }
    }
}
