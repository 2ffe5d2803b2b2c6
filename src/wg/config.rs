use std::{
    fmt::{self, Write as _},
    net::{AddrParseError, IpAddr},
    num::ParseIntError,
};

use crate::{settings::Settings, store::Peer};

use super::{Cidr, DecodeError, Endpoint, Key, List};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected token")]
    UnexpectedToken,

    #[error("key parse error: {0}")]
    KeyParseError(#[from] DecodeError),

    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("addr parse error: {0}")]
    SocketAddrParseError(#[from] AddrParseError),

    #[error("int parse error: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("invalid prefix length /{0}")]
    InvalidMask(u8),

    #[error("subnet {0} is not ipv4")]
    NotIpv4(Cidr),

    #[error("subnet {0} leaves no room for peers")]
    SubnetTooSmall(Cidr),

    #[error("start offset {0} outside of subnet")]
    InvalidStart(u8),
}

/// Client side `wg-quick` configuration for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub interface: ProfileInterface,
    pub peer: ProfilePeer,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProfileInterface {
    // PrivateKey
    pub private_key: Key,

    // Address
    pub address: Cidr,

    // DNS
    pub dns: Vec<IpAddr>,
}

impl fmt::Debug for ProfileInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileInterface")
            .field("address", &self.address)
            .field("dns", &self.dns)
            .finish_non_exhaustive()
    }
}

/// The server as seen from the client.
#[derive(Clone, PartialEq, Eq)]
pub struct ProfilePeer {
    // PublicKey
    pub public_key: Key,

    // PresharedKey
    pub preshared_key: Option<Key>,

    // AllowedIPs
    pub allowed_ips: Vec<Cidr>,

    // Endpoint
    pub endpoint: Endpoint,

    // PersistentKeepalive
    pub persistent_keepalive: Option<u32>,
}

impl fmt::Debug for ProfilePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilePeer")
            .field("public_key", &self.public_key)
            .field("allowed_ips", &self.allowed_ips)
            .field("endpoint", &self.endpoint)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .finish_non_exhaustive()
    }
}

impl ClientProfile {
    pub fn new(peer: &Peer, settings: &Settings) -> Self {
        ClientProfile {
            interface: ProfileInterface {
                private_key: peer.private_key,
                address: Cidr::host(peer.address),
                dns: settings.dns.clone(),
            },
            peer: ProfilePeer {
                public_key: settings.server_public_key,
                preshared_key: peer.preshared_key,
                allowed_ips: settings.allowed_ips.clone(),
                endpoint: settings.server_endpoint.clone(),
                persistent_keepalive: settings.persistent_keepalive,
            },
        }
    }
}

impl fmt::Display for ClientProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let iface = &self.interface;
        let peer = &self.peer;

        writeln!(out, "[Interface]")?;
        writeln!(out, "PrivateKey = {}", iface.private_key)?;
        writeln!(out, "Address = {}", iface.address)?;
        if !iface.dns.is_empty() {
            writeln!(out, "DNS = {}", List(iface.dns.clone()))?;
        }

        writeln!(out)?;
        writeln!(out, "[Peer]")?;
        writeln!(out, "PublicKey = {}", peer.public_key)?;
        if let Some(psk) = peer.preshared_key {
            writeln!(out, "PresharedKey = {psk}")?;
        }
        writeln!(out, "AllowedIPs = {}", List(peer.allowed_ips.clone()))?;
        writeln!(out, "Endpoint = {}", peer.endpoint)?;
        if let Some(keepalive) = peer.persistent_keepalive {
            write!(out, "PersistentKeepalive = {keepalive}")?;
        }

        f.write_str(out.trim_end())
    }
}

/// Renders the configuration text handed to the client (and to the QR encoder).
pub fn render(peer: &Peer, settings: &Settings) -> String {
    ClientProfile::new(peer, settings).to_string()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::settings::tests::test_settings;
    use crate::store::Peer;
    use crate::wg::KeyPair;

    use super::{ClientProfile, render};

    #[test]
    fn test_render_profile() {
        let settings = test_settings(10);
        let keys = KeyPair::generate();
        let peer = Peer::new("alice", keys, None, Ipv4Addr::new(10, 10, 0, 10));

        let text = render(&peer, &settings);

        assert_eq!(
            text,
            format!(
                "[Interface]
PrivateKey = {}
Address = 10.10.0.10/32
DNS = 1.1.1.1, 1.0.0.1

[Peer]
PublicKey = {}
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = vpn.example.com:51820
PersistentKeepalive = 25",
                keys.private_key, settings.server_public_key,
            )
        );
    }

    #[test]
    fn test_render_profile_with_psk() {
        let mut settings = test_settings(10);
        settings.dns.clear();
        settings.persistent_keepalive = None;

        let psk = crate::wg::Key::random();
        let peer = Peer::new(
            "bob",
            KeyPair::generate(),
            Some(psk),
            Ipv4Addr::new(10, 10, 0, 11),
        );

        let text = render(&peer, &settings);
        let lines: Vec<&str> = text.lines().collect();

        assert!(!text.contains("DNS ="));
        assert!(!text.contains("PersistentKeepalive"));
        assert_eq!(lines[6], format!("PresharedKey = {psk}"));
        assert_eq!(lines.last(), Some(&"Endpoint = vpn.example.com:51820"));
    }

    #[test]
    fn test_profile_debug_hides_secrets() {
        let settings = test_settings(10);
        let keys = KeyPair::generate();
        let psk = crate::wg::Key::random();
        let peer = Peer::new("carol", keys, Some(psk), Ipv4Addr::new(10, 10, 0, 12));

        let debug = format!("{:?}", ClientProfile::new(&peer, &settings));

        assert!(!debug.contains(&keys.private_key.to_string()));
        assert!(!debug.contains(&psk.to_string()));
        assert!(debug.contains("10.10.0.12"));
    }
}
