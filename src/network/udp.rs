//! UDP socket construction
//!
//! Sockets are built with `socket2` so buffer sizes, address reuse and read
//! timeouts can be set before binding, then handed out as plain blocking
//! `std::net::UdpSocket`s owned by one worker thread each.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Options applied before `bind`
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub recv_buffer_bytes: Option<usize>,
    pub send_buffer_bytes: Option<usize>,
    /// Bounds how long a blocking `recv_from` can delay shutdown
    pub read_timeout: Option<Duration>,
}

impl SocketOptions {
    /// Listening socket for the receive loop
    pub fn receiver(config: &NetworkConfig) -> Self {
        Self {
            reuse_address: true,
            recv_buffer_bytes: Some(config.recv_buffer_bytes),
            send_buffer_bytes: None,
            read_timeout: Some(config.recv_timeout()),
        }
    }

    /// Ephemeral socket for the send loop
    pub fn sender(config: &NetworkConfig) -> Self {
        Self {
            reuse_address: false,
            recv_buffer_bytes: None,
            send_buffer_bytes: Some(config.send_buffer_bytes),
            read_timeout: None,
        }
    }
}

/// Create and bind a UDP socket
pub fn create_socket(addr: SocketAddr, options: &SocketOptions) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;

    if options.reuse_address {
        socket.set_reuse_address(true).map_err(bind_err)?;
    }
    // The OS may clamp or refuse buffer sizes; that only costs headroom
    if let Some(size) = options.recv_buffer_bytes {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("Could not set receive buffer to {} bytes: {}", size, e);
        }
    }
    if let Some(size) = options.send_buffer_bytes {
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!("Could not set send buffer to {} bytes: {}", size, e);
        }
    }
    if let Some(timeout) = options.read_timeout {
        socket.set_read_timeout(Some(timeout)).map_err(bind_err)?;
    }

    socket.bind(&addr.into()).map_err(bind_err)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_loopback_round_trip() {
        let config = NetworkConfig::default();
        let receiver =
            create_socket("127.0.0.1:0".parse().unwrap(), &SocketOptions::receiver(&config))
                .unwrap();
        let sender =
            create_socket("127.0.0.1:0".parse().unwrap(), &SocketOptions::sender(&config))
                .unwrap();

        let target = receiver.local_addr().unwrap();
        sender.send_to(b"ping", target).unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, sender.local_addr().unwrap());
    }

    #[test]
    fn test_read_timeout_applies() {
        let options = SocketOptions {
            read_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), &options).unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 16];
        assert!(socket.recv_from(&mut buf).is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
