use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Type};
use thiserror::Error;

// expedited forwarding - IP header field indicating that switches should
// prioritise our packets for minimal delay
const IPTOS_DSCP_EF: u32 = 0xb8;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("creating socket: {0}")]
    Socket(io::Error),
    #[error("binding {0}: {1}")]
    Bind(SocketAddrV4, io::Error),
    #[error("no bindable port at or above {0}")]
    PortsExhausted(u16),
}

/// Binds a UDP socket at `base_port`, walking upward past ports that
/// are already taken. Any bind failure other than address-in-use is
/// surfaced as fatal.
pub fn bind_from(base_port: u16) -> Result<UdpSocket, BindError> {
    let mut port = base_port;

    loop {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

        match open_socket(addr) {
            Ok(socket) => return Ok(socket.into()),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                port = port
                    .checked_add(1)
                    .ok_or(BindError::PortsExhausted(base_port))?;
            }
            Err(e) => return Err(BindError::Bind(addr, e)),
        }
    }
}

fn open_socket(bind: SocketAddrV4) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, None)?;

    if let Err(e) = socket.set_tos(IPTOS_DSCP_EF) {
        log::warn!("failed to set IPTOS_DSCP_EF: {e:?}");
    }

    socket.bind(&bind.into())?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn port_of(socket: &UdpSocket) -> u16 {
        match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr.port(),
            other => panic!("unexpected addr {other}"),
        }
    }

    #[test]
    fn walks_past_occupied_ports() {
        // occupy a base port and its successor, then ask for the base
        let holder = UdpSocket::bind("0.0.0.0:0").unwrap();
        let base = port_of(&holder);
        let next = UdpSocket::bind(("0.0.0.0", base + 1));

        let bound = bind_from(base).unwrap();
        let port = port_of(&bound);

        assert_ne!(port, base);
        if next.is_ok() {
            assert!(port >= base + 2);
        }
    }

    #[test]
    fn binds_base_port_when_free() {
        // grab a known-free port, release it, then bind it directly
        let probe = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = port_of(&probe);
        drop(probe);

        let bound = bind_from(port).unwrap();
        assert_eq!(port_of(&bound), port);
    }
}
