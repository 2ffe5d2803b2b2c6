//! Grammar of `wg show <iface> dump`.
//!
//! ```text
//! dump      := interface? (NL peer)*
//! interface := private-key TAB public-key TAB listen-port TAB fwmark
//! peer      := public-key TAB psk TAB endpoint TAB allowed-ips TAB
//!              latest-handshake TAB rx-bytes TAB tx-bytes TAB keepalive
//! ```
//!
//! `(none)`, `off` and empty fields mean absent; a handshake of `0` means the
//! peer never connected. Lines that do not fit are skipped with a warning.

use std::str::FromStr;

use super::{
    Cidr, Endpoint, Key, List, WgState, config::ParseError, instance::WgInterfaceInfo,
    peer::WgPeerInfo,
};

const INTERFACE_FIELDS: usize = 4;
const PEER_FIELDS: usize = 8;

pub fn parse_dump(output: &str) -> WgState {
    let mut state = WgState::default();

    for (lineno, line) in output.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let res = match fields.len() {
            INTERFACE_FIELDS if lineno == 0 => parse_interface(&fields).map(|iface| {
                state.interface = Some(iface);
            }),
            PEER_FIELDS => parse_peer(&fields).map(|peer| state.peers.push(peer)),
            n => {
                log::warn!("dump line {}: unexpected field count {n}, skipped", lineno + 1);
                continue;
            }
        };

        if let Err(err) = res {
            log::warn!("dump line {}: {err}, skipped", lineno + 1);
        }
    }

    state
}

fn parse_interface(fields: &[&str]) -> Result<WgInterfaceInfo, ParseError> {
    Ok(WgInterfaceInfo {
        public_key: optional(fields[1])?,
        listen_port: optional(fields[2])?,
        fwmark: match fields[3] {
            "" | "off" => None,
            s => Some(match s.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16)?,
                None => s.parse()?,
            }),
        },
    })
}

fn parse_peer(fields: &[&str]) -> Result<WgPeerInfo, ParseError> {
    let public_key: Key = fields[0].parse()?;
    let endpoint: Option<Endpoint> = optional(fields[2])?;
    let allowed_ips = optional::<List<Cidr>>(fields[3])?
        .map(|list| list.0)
        .unwrap_or_default();

    let latest_handshake = optional::<i64>(fields[4])?.filter(|ts| *ts > 0);

    Ok(WgPeerInfo {
        public_key,
        endpoint,
        allowed_ips,
        persistent_keepalive: optional(fields[7])?,
        latest_handshake,
        rx_bytes: optional(fields[5])?.unwrap_or(0),
        tx_bytes: optional(fields[6])?.unwrap_or(0),
    })
}

fn optional<T>(field: &str) -> Result<Option<T>, ParseError>
where
    T: FromStr,
    ParseError: From<T::Err>,
{
    match field {
        "" | "(none)" | "off" => Ok(None),
        s => Ok(Some(s.parse()?)),
    }
}
