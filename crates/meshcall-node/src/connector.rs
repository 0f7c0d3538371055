use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::address::{eui64_link_local, is_link_local, Address};
use crate::error::ConnectError;
use crate::neighbor::{self, Neighbor};
use crate::settings::Settings;

/// Turns a contact's address list into a connected socket.
///
/// Addresses are tried in stored order, one candidate at a time.
#[derive(Debug, Clone)]
pub struct Connector {
    pub port: u16,
    pub timeout: Duration,
    /// Attempts per candidate; zero is treated as one.
    pub retries: u32,
    pub guess_eui64: bool,
    pub use_neighbor_table: bool,
}

/// Neighbor table and interface list, fetched at most once per `connect`.
#[derive(Default)]
struct LinkInfo {
    neighbors: Option<Vec<Neighbor>>,
    interfaces: Option<Vec<(String, u32)>>,
}

impl LinkInfo {
    async fn neighbors(&mut self) -> &[Neighbor] {
        if self.neighbors.is_none() {
            self.neighbors = Some(neighbor::neighbor_table().await);
        }
        self.neighbors.as_deref().unwrap_or_default()
    }

    fn interfaces(&mut self) -> &[(String, u32)] {
        self.interfaces
            .get_or_insert_with(neighbor::interfaces)
            .as_slice()
    }
}

impl Connector {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            timeout: Duration::from_millis(500),
            retries: 1,
            guess_eui64: true,
            use_neighbor_table: false,
        }
    }

    pub fn from_settings(settings: &Settings, port: u16) -> Self {
        Self {
            port,
            timeout: Duration::from_millis(settings.connect_timeout),
            retries: settings.connect_retries,
            guess_eui64: settings.guess_eui64_address,
            use_neighbor_table: settings.use_neighbor_table,
        }
    }

    pub async fn connect(&self, addresses: &[String]) -> Result<TcpStream, ConnectError> {
        if addresses.is_empty() {
            return Err(ConnectError::NoAddress);
        }

        let mut link = LinkInfo::default();
        let mut attempts = 0usize;
        let mut only_unroutable = true;

        for address in addresses {
            let candidates = self.candidates(address, &mut link).await;
            if candidates.is_empty() {
                debug!(address = %address, "no candidates for address");
                continue;
            }
            for candidate in candidates {
                for _ in 0..self.retries.max(1) {
                    attempts += 1;
                    match self.try_connect(candidate).await {
                        Ok(stream) => {
                            debug!(peer = %candidate, attempts, "connected");
                            return Ok(stream);
                        }
                        Err(e) => {
                            trace!(peer = %candidate, "connect failed: {}", e);
                            if !is_unroutable(&e) {
                                only_unroutable = false;
                            }
                        }
                    }
                }
            }
        }

        if only_unroutable {
            Err(ConnectError::NetworkUnreachable)
        } else {
            Err(ConnectError::Unreachable { attempts })
        }
    }

    async fn try_connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        }
    }

    /// Socket addresses to try for one stored address, in order.
    async fn candidates(&self, address: &str, link: &mut LinkInfo) -> Vec<SocketAddr> {
        let Some(parsed) = Address::parse(address) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        match parsed {
            Address::Ip {
                addr: IpAddr::V6(ip),
                scope: Some(scope),
            } => {
                if let Some(index) = neighbor::interface_index(&scope) {
                    out.push(self.v6(ip, index));
                }
            }
            Address::Ip {
                addr: IpAddr::V6(ip),
                scope: None,
            } if is_link_local(&ip) => {
                if self.use_neighbor_table {
                    for n in link.neighbors().await.iter().filter(|n| n.address == ip) {
                        if let Some(index) = neighbor::interface_index(&n.interface) {
                            out.push(self.v6(ip, index));
                        }
                    }
                }
                for (_, index) in link.interfaces() {
                    out.push(self.v6(ip, *index));
                }
            }
            Address::Ip { addr, .. } => out.push(SocketAddr::new(addr, self.port)),
            Address::Domain(name) => match tokio::net::lookup_host((name.as_str(), self.port)).await {
                Ok(resolved) => out.extend(resolved),
                Err(e) => debug!(domain = %name, "resolution failed: {}", e),
            },
            Address::Mac(mac) => {
                if self.use_neighbor_table {
                    for n in link.neighbors().await.iter().filter(|n| n.mac == Some(mac)) {
                        if is_link_local(&n.address) {
                            if let Some(index) = neighbor::interface_index(&n.interface) {
                                out.push(self.v6(n.address, index));
                            }
                        } else {
                            out.push(SocketAddr::new(IpAddr::V6(n.address), self.port));
                        }
                    }
                }
                if self.guess_eui64 {
                    let ip = eui64_link_local(&mac);
                    for (_, index) in link.interfaces() {
                        out.push(self.v6(ip, *index));
                    }
                }
            }
        }
        let mut unique = Vec::with_capacity(out.len());
        for addr in out {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        unique
    }

    fn v6(&self, ip: Ipv6Addr, scope_id: u32) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(ip, self.port, 0, scope_id))
    }
}

/// "No route / no interface" rather than a peer that is off or refusing.
fn is_unroutable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NetworkDown
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn connector(port: u16) -> Connector {
        Connector {
            timeout: Duration::from_millis(300),
            ..Connector::new(port)
        }
    }

    #[tokio::test]
    async fn empty_address_list_fails_immediately() {
        let started = std::time::Instant::now();
        let result = connector(1).connect(&[]).await;
        assert!(matches!(result, Err(ConnectError::NoAddress)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn connects_to_first_reachable_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let addresses = vec!["not valid!".to_string(), "127.0.0.1".to_string()];
        let stream = connector(port).connect(&addresses).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn refused_is_unreachable_with_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut c = connector(port);
        c.retries = 2;
        match c.connect(&["127.0.0.1".to_string()]).await {
            Err(ConnectError::Unreachable { attempts }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_candidates_is_network_unreachable() {
        let c = Connector {
            guess_eui64: false,
            ..connector(1)
        };
        assert!(matches!(
            c.connect(&["00:11:22:33:44:55".to_string(), "???".to_string()])
                .await,
            Err(ConnectError::NetworkUnreachable)
        ));
    }

    #[tokio::test]
    async fn candidates_for_ip_literal_use_port() {
        let c = connector(10001);
        let mut link = LinkInfo::default();
        let got = c.candidates("192.168.1.5", &mut link).await;
        assert_eq!(got, vec!["192.168.1.5:10001".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn candidates_for_scoped_link_local() {
        let c = connector(10001);
        let mut link = LinkInfo::default();
        let got = c.candidates("fe80::1%7", &mut link).await;
        match got.as_slice() {
            [SocketAddr::V6(v6)] => {
                assert_eq!(v6.scope_id(), 7);
                assert_eq!(v6.port(), 10001);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mac_candidates_follow_eui64() {
        let c = connector(10001);
        let mut link = LinkInfo {
            neighbors: Some(Vec::new()),
            interfaces: Some(vec![("eth0".into(), 2), ("wlan0".into(), 3)]),
        };
        let got = c.candidates("00:1a:2b:3c:4d:5e", &mut link).await;
        let expected: Ipv6Addr = "fe80::21a:2bff:fe3c:4d5e".parse().unwrap();
        assert_eq!(got.len(), 2);
        for (addr, scope) in got.iter().zip([2, 3]) {
            match addr {
                SocketAddr::V6(v6) => {
                    assert_eq!(*v6.ip(), expected);
                    assert_eq!(v6.scope_id(), scope);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn mac_candidates_from_neighbor_table() {
        let c = Connector {
            use_neighbor_table: true,
            guess_eui64: false,
            ..connector(10001)
        };
        let mut link = LinkInfo {
            neighbors: Some(vec![Neighbor {
                address: "2001:db8::7".parse().unwrap(),
                interface: "eth0".into(),
                mac: Some([0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            }]),
            interfaces: Some(Vec::new()),
        };
        let got = c.candidates("00:11:22:33:44:55", &mut link).await;
        assert_eq!(got, vec!["[2001:db8::7]:10001".parse::<SocketAddr>().unwrap()]);
    }
}
