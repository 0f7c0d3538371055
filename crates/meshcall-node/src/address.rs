//! Contact address forms: IP literals, domain names and MAC addresses.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// A parsed contact address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IP literal, optionally with an IPv6 zone (`fe80::1%wlan0`).
    Ip { addr: IpAddr, scope: Option<String> },
    /// Hardware address; turned into link-local candidates when connecting.
    Mac([u8; 6]),
    Domain(String),
}

impl Address {
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        if s.is_empty() {
            return None;
        }

        if let Ok(addr) = s.parse::<IpAddr>() {
            return Some(Self::Ip { addr, scope: None });
        }
        if let Some((ip, scope)) = s.split_once('%') {
            if let Ok(addr) = ip.parse::<Ipv6Addr>() {
                if !scope.is_empty() {
                    return Some(Self::Ip {
                        addr: IpAddr::V6(addr),
                        scope: Some(scope.to_string()),
                    });
                }
            }
            return None;
        }
        if let Some(mac) = parse_mac(s) {
            return Some(Self::Mac(mac));
        }
        if is_domain(s) {
            return Some(Self::Domain(s.to_ascii_lowercase()));
        }
        None
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip { addr, scope: None } => write!(f, "{addr}"),
            Self::Ip {
                addr,
                scope: Some(scope),
            } => write!(f, "{addr}%{scope}"),
            Self::Mac(mac) => f.write_str(&format_mac(mac)),
            Self::Domain(name) => f.write_str(name),
        }
    }
}

/// Canonical text form of an address, or `None` if it is not one.
///
/// IP literals and domains are lower-cased, MACs are rendered as
/// lower-case colon-separated octets. Normalizing twice is the same as once.
pub fn normalize_address(input: &str) -> Option<String> {
    Address::parse(input).map(|a| a.to_string())
}

/// Normalize a list, dropping invalid entries and duplicates but keeping order.
pub fn normalize_addresses<I, S>(addresses: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for address in addresses {
        match normalize_address(address.as_ref()) {
            Some(a) if !out.contains(&a) => out.push(a),
            Some(_) => {}
            None => tracing::debug!(address = address.as_ref(), "dropping invalid address"),
        }
    }
    out
}

/// Parse `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let sep = if s.contains(':') { ':' } else { '-' };
    let mut mac = [0u8; 6];
    let mut parts = s.split(sep);
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn is_domain(s: &str) -> bool {
    if s.len() > 253 {
        return false;
    }
    let s = s.strip_suffix('.').unwrap_or(s);
    !s.is_empty()
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
        // all-numeric names are malformed IPs, not hosts
        && s.chars().any(|c| c.is_ascii_alphabetic())
}

/// Modified EUI-64 link-local address (`fe80::/64`) for a MAC.
pub fn eui64_link_local(mac: &[u8; 6]) -> Ipv6Addr {
    Ipv6Addr::new(
        0xfe80,
        0,
        0,
        0,
        u16::from_be_bytes([mac[0] ^ 0x02, mac[1]]),
        u16::from_be_bytes([mac[2], 0xff]),
        u16::from_be_bytes([0xfe, mac[3]]),
        u16::from_be_bytes([mac[4], mac[5]]),
    )
}

/// Inverse of [`eui64_link_local`] for addresses that carry an EUI-64 interface id.
pub fn mac_from_eui64(addr: &Ipv6Addr) -> Option<[u8; 6]> {
    let o = addr.octets();
    if !is_link_local(addr) || o[11] != 0xff || o[12] != 0xfe {
        return None;
    }
    Some([o[8] ^ 0x02, o[9], o[10], o[13], o[14], o[15]])
}

pub fn is_link_local(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Addresses worth storing for a peer seen at `remote`. Link-local peers are
/// kept by MAC when their address carries one, since the scope is local to
/// this host.
pub fn addresses_for_peer(remote: &SocketAddr) -> Vec<String> {
    match remote.ip().to_canonical() {
        IpAddr::V6(v6) if is_link_local(&v6) => mac_from_eui64(&v6)
            .map(|mac| vec![format_mac(&mac)])
            .unwrap_or_default(),
        ip => vec![ip.to_string()],
    }
}
