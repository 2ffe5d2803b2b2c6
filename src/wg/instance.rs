use super::Key;

/// Interface line of the live table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgInterfaceInfo {
    // PublicKey
    pub public_key: Option<Key>,

    // ListenPort
    pub listen_port: Option<u16>,

    // FwMark
    pub fwmark: Option<u32>,
}
