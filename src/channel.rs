use crate::error::ChannelError;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// Discovery datagrams are a few hundred bytes; anything longer is truncated and
/// will fail to decode.
const MAX_DATAGRAM_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub ttl: u32,
    pub multicast_loop: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ttl: 1,
            multicast_loop: true,
        }
    }
}

/// A UDP socket bound to `0.0.0.0:port` and joined to one IPv4 multicast group.
///
/// Reads and writes take `&self`, so one `Arc<MulticastChannel>` can be received
/// on by one task while others send on it.
pub struct MulticastChannel {
    socket: UdpSocket,
    group: SocketAddrV4,
    closed: CancellationToken,
}

impl MulticastChannel {
    /// Must be called from within a Tokio runtime.
    pub fn open(group: SocketAddr, options: &ChannelOptions) -> Result<Self, ChannelError> {
        let group = match group {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => v4,
            other => return Err(ChannelError::NotMulticast(other.ip())),
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(ChannelError::Socket)?;

        // Several local processes share the discovery port.
        socket
            .set_reuse_address(true)
            .map_err(|source| ChannelError::SetOption {
                option: "SO_REUSEADDR",
                source,
            })?;
        // Linux shares the port with SO_REUSEADDR alone. SO_REUSEPORT there would
        // hash unicast replies to any one of the sockets on the port.
        #[cfg(all(
            unix,
            not(any(
                target_os = "linux",
                target_os = "android",
                target_os = "solaris",
                target_os = "illumos"
            ))
        ))]
        if let Err(e) = socket.set_reuse_port(true) {
            tracing::debug!("SO_REUSEPORT unavailable on {}: {}", group, e);
        }

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
        socket
            .bind(&bind_addr.into())
            .map_err(|source| ChannelError::Bind {
                addr: bind_addr,
                source,
            })?;

        socket
            .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
            .map_err(|source| ChannelError::Join {
                group: IpAddr::V4(*group.ip()),
                source,
            })?;

        // Only deliver traffic for our own group, even when another channel in
        // this process has joined a different group on the same port.
        #[cfg(target_os = "linux")]
        if let Err(e) = socket.set_multicast_all_v4(false) {
            tracing::warn!("Failed to clear IP_MULTICAST_ALL on {}: {}", group, e);
        }

        if let Err(e) = socket.set_multicast_ttl_v4(options.ttl) {
            tracing::warn!("Failed to set multicast TTL {} on {}: {}", options.ttl, group, e);
        }
        if let Err(e) = socket.set_multicast_loop_v4(options.multicast_loop) {
            tracing::warn!("Failed to set multicast loopback on {}: {}", group, e);
        }

        socket
            .set_nonblocking(true)
            .map_err(|source| ChannelError::SetOption {
                option: "O_NONBLOCK",
                source,
            })?;
        let socket = UdpSocket::from_std(socket.into()).map_err(ChannelError::Socket)?;

        tracing::debug!("Joined multicast group {} (ttl {})", group, options.ttl);
        Ok(Self {
            socket,
            group,
            closed: CancellationToken::new(),
        })
    }

    /// Group address and port this channel is joined to.
    pub fn group(&self) -> SocketAddr {
        SocketAddr::V4(self.group)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChannelError> {
        self.socket.local_addr().map_err(ChannelError::Socket)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Multicast `payload` to the group.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, ChannelError> {
        self.send_to(payload, self.group()).await
    }

    /// Send `payload` to an arbitrary address, multicast or unicast.
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.socket
            .send_to(payload, target)
            .await
            .map_err(|source| ChannelError::Send { target, source })
    }

    /// Wait for the next datagram. Returns [`ChannelError::Closed`] once
    /// [`close`](Self::close) has been called, including for a receive already in flight.
    pub async fn receive(&self) -> Result<(Vec<u8>, SocketAddr), ChannelError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            received = self.socket.recv_from(&mut buf) => {
                let (len, from) = received.map_err(ChannelError::Receive)?;
                buf.truncate(len);
                Ok((buf, from))
            }
        }
    }

    /// Leave the group and wake any pending receive. The socket itself is released
    /// when the last handle is dropped.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self
            .socket
            .leave_multicast_v4(*self.group.ip(), Ipv4Addr::UNSPECIFIED)
        {
            tracing::debug!("Failed to leave multicast group {}: {}", self.group, e);
        }
        tracing::debug!("Closed multicast channel {}", self.group);
    }
}

impl Drop for MulticastChannel {
    fn drop(&mut self) {
        self.close();
    }
}
