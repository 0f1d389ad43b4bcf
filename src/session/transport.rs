use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::shutdown::Shutdown;

/// Errors of a single send or receive attempt. `Closed` means the shared
/// shutdown signal fired; the session treats it as a clean exit, everything
/// else as a transient failure charged against the retry budget.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("conduit closed by shutdown")]
    Closed,
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One datagram conduit to the access-control server. This trait decouples the
/// session state machine from the actual socket so tests can script replies.
#[async_trait]
pub trait Conduit: Send + Sync {
    async fn send(&self, packet: &[u8], deadline: Duration) -> Result<usize, ConduitError>;

    async fn recv(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, ConduitError>;
}

/// A UDP socket bound to the wildcard address of the remote's family, at the
/// same port as the remote, and connected so the stack filters out datagrams
/// from other senders.
pub struct UdpConduit {
    socket: UdpSocket,
    shutdown: Shutdown,
}

impl UdpConduit {
    pub async fn connect(
        remote: SocketAddr,
        bind_device: Option<&str>,
        shutdown: Shutdown,
    ) -> anyhow::Result<UdpConduit> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, remote.port()).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, remote.port()).into(),
        };

        let socket = Socket::new(Domain::for_address(remote), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Some(device) = bind_device {
            bind_to_device(&socket, device)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&local.into())?;

        let socket = UdpSocket::from_std(socket.into())?;
        socket.connect(remote).await?;

        Ok(UdpConduit { socket, shutdown })
    }
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, device: &str) -> anyhow::Result<()> {
    socket.bind_device(Some(device.as_bytes()))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, _device: &str) -> anyhow::Result<()> {
    anyhow::bail!("binding to a device is only supported on linux")
}

#[async_trait]
impl Conduit for UdpConduit {
    async fn send(&self, packet: &[u8], deadline: Duration) -> Result<usize, ConduitError> {
        if self.shutdown.is_triggered() {
            return Err(ConduitError::Closed);
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.triggered() => Err(ConduitError::Closed),
            r = timeout(deadline, self.socket.send(packet)) => match r {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConduitError::TimedOut(deadline)),
            },
        }
    }

    async fn recv(&self, buf: &mut [u8], deadline: Duration) -> Result<usize, ConduitError> {
        if self.shutdown.is_triggered() {
            return Err(ConduitError::Closed);
        }
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.triggered() => Err(ConduitError::Closed),
            r = timeout(deadline, self.socket.recv(buf)) => match r {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConduitError::TimedOut(deadline)),
            },
        }
    }
}
