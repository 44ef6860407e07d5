/// Port allocation for the agent's heartbeat and activity channels.
///
/// Each candidate is probed by binding a fresh socket and is released again before
/// `allocate_pair` returns, because the agent binds the ports itself in its own
/// process. Nothing stops another process from taking a port between the probe and
/// the agent's bind; handing the live sockets to the child would close that window.
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::config::PortsConfig;

#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    range_start: u16,
    range_end: u16,
}

impl PortAllocator {
    pub fn new(host: IpAddr, range_start: u16, range_end: u16) -> Self {
        Self {
            host,
            range_start,
            range_end,
        }
    }

    /// Build from config. An unparsable `bind_host` falls back to loopback.
    pub fn from_config(config: &PortsConfig) -> Self {
        let host = config.bind_host.parse().unwrap_or_else(|e| {
            tracing::warn!(
                bind_host = %config.bind_host,
                error = %e,
                "invalid ports.bind_host, probing on 127.0.0.1"
            );
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        Self::new(host, config.range_start, config.range_end)
    }

    /// Find two distinct ports in the range that can currently be bound.
    pub fn allocate_pair(&self) -> Result<(u16, u16), PortError> {
        if self.range_start > self.range_end {
            return Err(PortError::InvalidRange {
                start: self.range_start,
                end: self.range_end,
            });
        }

        let mut found = Vec::with_capacity(2);
        for port in self.range_start..=self.range_end {
            // Port 0 asks the OS for an ephemeral port, which the child could never reuse.
            if port == 0 {
                continue;
            }
            if self.is_bindable(port) {
                found.push(port);
                if found.len() == 2 {
                    tracing::debug!(
                        first = found[0],
                        second = found[1],
                        "allocated port pair"
                    );
                    return Ok((found[0], found[1]));
                }
            }
        }

        Err(PortError::Exhausted {
            start: self.range_start,
            end: self.range_end,
        })
    }

    fn is_bindable(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.host, port);
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(port, error = %e, "failed to create probe socket");
                return false;
            }
        };
        // Dropping the socket releases the port.
        socket.bind(&addr.into()).is_ok()
    }
}

/// Errors from port allocation.
#[derive(Debug)]
pub enum PortError {
    InvalidRange { start: u16, end: u16 },
    Exhausted { start: u16, end: u16 },
}

impl std::fmt::Display for PortError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortError::InvalidRange { start, end } => {
                write!(f, "invalid port range {start}-{end}")
            }
            PortError::Exhausted { start, end } => {
                write!(f, "fewer than two free ports in range {start}-{end}")
            }
        }
    }
}

impl std::error::Error for PortError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_allocates_two_distinct_bindable_ports() {
        let allocator = PortAllocator::new(loopback(), 40000, 60000);
        let (a, b) = allocator.allocate_pair().unwrap();
        assert_ne!(a, b);
        assert!((40000..=60000).contains(&a));
        assert!((40000..=60000).contains(&b));

        // Released before return: the caller can bind both.
        let _la = TcpListener::bind((Ipv4Addr::LOCALHOST, a)).unwrap();
        let _lb = TcpListener::bind((Ipv4Addr::LOCALHOST, b)).unwrap();
    }

    #[test]
    fn test_skips_port_in_use() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();

        let allocator = PortAllocator::new(loopback(), port, port.saturating_add(200));
        if let Ok((a, b)) = allocator.allocate_pair() {
            assert_ne!(a, port);
            assert_ne!(b, port);
        }
    }

    #[test]
    fn test_single_busy_port_is_exhausted() {
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();

        let allocator = PortAllocator::new(loopback(), port, port);
        let err = allocator.allocate_pair().unwrap_err();
        assert!(matches!(err, PortError::Exhausted { .. }));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let allocator = PortAllocator::new(loopback(), 6000, 5000);
        assert!(matches!(
            allocator.allocate_pair().unwrap_err(),
            PortError::InvalidRange { .. }
        ));
    }

    #[test]
    fn test_from_config_bad_host_falls_back_to_loopback() {
        let config = PortsConfig {
            bind_host: "not-an-ip".to_string(),
            range_start: 50000,
            range_end: 50100,
        };
        let allocator = PortAllocator::from_config(&config);
        assert_eq!(allocator.host, loopback());
    }
}
