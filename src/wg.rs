use base64::prelude::*;
use config::ParseError;
use instance::WgInterfaceInfo;
use peer::WgPeerInfo;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};
use x25519_dalek::{PublicKey, StaticSecret};

pub mod cmd;
pub mod config;
pub mod dump;
#[cfg(test)]
pub mod fake;
pub mod instance;
pub mod peer;

pub type DecodeError = base64::DecodeSliceError;

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 32]);

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Key {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut inner = [0u8; 32];
        let len = BASE64_STANDARD.decode_slice(s, &mut inner)?;
        if len != inner.len() {
            return Err(ParseError::KeyLength(len));
        }
        Ok(Key(inner))
    }
}

impl Key {
    pub fn random() -> Key {
        Key(rand::random())
    }

    /// Random curve25519 secret, clamped the way `wg genkey` does.
    pub fn private() -> Key {
        let mut bytes: [u8; 32] = rand::random();
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Key(bytes)
    }

    /// Public half of a private key (`wg pubkey`).
    pub fn public_key(&self) -> Key {
        let secret = StaticSecret::from(self.0);
        Key(PublicKey::from(&secret).to_bytes())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Key").field(&self.to_string()).finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: Key,
    pub public_key: Key,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_private(Key::private())
    }

    pub fn from_private(private_key: Key) -> Self {
        Self {
            private_key,
            public_key: private_key.public_key(),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub ip: IpAddr,
    pub mask: u8,
}

impl Cidr {
    /// Single host route, the form the server uses for a peer's allowed-ips.
    pub fn host(ip: impl Into<IpAddr>) -> Self {
        let ip = ip.into();
        let mask = if ip.is_ipv4() { 32 } else { 128 };
        Cidr { ip, mask }
    }
}

impl Default for Cidr {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mask: 0,
        }
    }
}

impl FromStr for Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, mask) = s.split_once('/').unwrap_or((s, ""));
        let ip: IpAddr = ip.trim().parse()?;
        let mask = mask.trim();

        let max = if ip.is_ipv4() { 32 } else { 128 };
        let mask: u8 = if !mask.is_empty() { mask.parse()? } else { max };
        if mask > max {
            return Err(ParseError::InvalidMask(mask));
        }

        Ok(Cidr { ip, mask })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.mask)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Domain(String),
    Ip(SocketAddr),
}

impl From<String> for Endpoint {
    fn from(v: String) -> Self {
        Self::Domain(v)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(v: SocketAddr) -> Self {
        Self::Ip(v)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Domain(dom) => write!(f, "{dom}"),
            Endpoint::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::UnexpectedToken);
        }

        Ok(if let Ok(addr) = s.parse() {
            Self::Ip(addr)
        } else {
            Self::Domain(s.to_string())
        })
    }
}

/// Comma separated list, whitespace around items ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct List<I>(pub Vec<I>);

impl<I: FromStr> FromStr for List<I> {
    type Err = I::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut items = Vec::new();

        for s in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            items.push(s.parse()?);
        }

        Ok(List(items))
    }
}

impl<I: std::fmt::Display> std::fmt::Display for List<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

/// Parsed `wg show <iface> dump`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgState {
    pub interface: Option<WgInterfaceInfo>,
    pub peers: Vec<WgPeerInfo>,
}

impl WgState {
    pub fn peer(&self, key: &Key) -> Option<&WgPeerInfo> {
        self.peers.iter().find(|p| &p.public_key == key)
    }
}

/// The only door to the tunnel daemon. The daemon tracks active peers
/// only; a disabled peer is simply absent from its table.
pub trait WireguardApi {
    type Error;

    async fn get_pub_key(&self, iface: &str) -> Result<Key, Self::Error>;

    /// Adds the peer, or replaces its allowed-ips if it is already present.
    async fn add_peer(
        &self,
        iface: &str,
        peer: Key,
        allowed_ips: &[Cidr],
        preshared_key: Option<Key>,
    ) -> Result<(), Self::Error>;

    /// Removes the peer; removing an absent peer succeeds.
    async fn remove_peer(&self, iface: &str, peer: Key) -> Result<(), Self::Error>;

    async fn set_peer_enabled(
        &self,
        iface: &str,
        peer: Key,
        allowed_ips: &[Cidr],
        preshared_key: Option<Key>,
        enabled: bool,
    ) -> Result<(), Self::Error> {
        if enabled {
            self.add_peer(iface, peer, allowed_ips, preshared_key).await
        } else {
            self.remove_peer(iface, peer).await
        }
    }

    async fn dump(&self, iface: &str) -> Result<WgState, Self::Error>;

    /// Writes the live table back to the interface config file.
    async fn save(&self, iface: &str) -> Result<(), Self::Error>;
}
