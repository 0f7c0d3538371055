//! Local IPv6 neighbor table and interface lookup (Linux).
//!
//! Missing tooling or sysfs simply yields empty results.

use std::net::Ipv6Addr;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::address::parse_mac;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub address: Ipv6Addr,
    pub interface: String,
    pub mac: Option<[u8; 6]>,
}

/// Parse `ip -6 neigh show` output, e.g.
/// `fe80::1 dev wlan0 lladdr aa:bb:cc:dd:ee:ff router REACHABLE`.
pub fn parse_neighbors(output: &str) -> Vec<Neighbor> {
    let mut neighbors = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(address) = tokens.first().and_then(|t| t.parse::<Ipv6Addr>().ok()) else {
            continue;
        };
        if tokens.last() == Some(&"FAILED") || tokens.last() == Some(&"INCOMPLETE") {
            continue;
        }
        let value_after = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };
        let Some(interface) = value_after("dev") else {
            continue;
        };
        neighbors.push(Neighbor {
            address,
            interface: interface.to_string(),
            mac: value_after("lladdr").and_then(parse_mac),
        });
    }
    neighbors
}

pub async fn neighbor_table() -> Vec<Neighbor> {
    match Command::new("ip").args(["-6", "neigh", "show"]).output().await {
        Ok(out) if out.status.success() => parse_neighbors(&String::from_utf8_lossy(&out.stdout)),
        Ok(out) => {
            debug!(status = %out.status, "ip neigh failed");
            Vec::new()
        }
        Err(e) => {
            debug!("cannot run ip neigh: {}", e);
            Vec::new()
        }
    }
}

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Index of a network interface by name (`scope_id` for link-local sockets).
pub fn interface_index(name: &str) -> Option<u32> {
    if let Ok(index) = name.parse::<u32>() {
        return Some(index);
    }
    if name.contains('/') {
        return None;
    }
    let path = Path::new(SYS_CLASS_NET).join(name).join("ifindex");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Non-loopback interfaces as `(name, index)`, sorted by index.
pub fn interfaces() -> Vec<(String, u32)> {
    let Ok(entries) = std::fs::read_dir(SYS_CLASS_NET) else {
        return Vec::new();
    };
    let mut out: Vec<(String, u32)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name != "lo")
        .filter_map(|name| interface_index(&name).map(|idx| (name, idx)))
        .collect();
    out.sort_by_key(|(_, idx)| *idx);
    out
}
