//! The network-thread multiplexer.
//!
//! The main loop blocks in [`Reactor::recv`] with a deadline-derived
//! timeout; any other thread can interrupt the wait through
//! [`Reactor::wake`]. The UDP flavour implements the wake-up with a
//! magic-tagged datagram to its own loopback address (the portable
//! stand-in for a self-pipe); the in-process flavour is a channel.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::Binding;

const WAKE_MAGIC: &[u8; 8] = b"\0aoowake";

/// One received datagram, or a wake-up/timeout marker.
pub enum Wait {
    Packet(Vec<u8>, SocketAddr),
    Woken,
    TimedOut,
}

/// The I/O seam of the client network loop.
pub trait Reactor: Send + Sync {
    /// Sends a datagram towards `addr`.
    fn send(&self, data: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Waits up to `timeout` for a datagram.
    fn recv(&self, timeout: Duration) -> io::Result<Wait>;

    /// Interrupts a concurrent [`recv`](Self::recv). Callable from any
    /// thread.
    fn wake(&self);

    /// Local address of the underlying socket, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// A [`Binding`] other components can use to send through this
    /// reactor.
    fn binding(&self) -> Binding;
}

/// Reactor over a real UDP socket.
pub struct UdpReactor {
    socket: Arc<UdpSocket>,
    wake_addr: SocketAddr,
}

impl UdpReactor {
    pub fn new(socket: UdpSocket) -> io::Result<Self> {
        let local = socket.local_addr()?;
        // the wake-up datagram is sent to ourselves via loopback
        let wake_addr = match local.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port()),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port()),
        };
        Ok(Self {
            socket: Arc::new(socket),
            wake_addr,
        })
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl Reactor for UdpReactor {
    fn send(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(data, addr).map(|_| ())
    }

    fn recv(&self, timeout: Duration) -> io::Result<Wait> {
        // a zero timeout would mean "block forever" to the OS
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; aoo_wire::MAX_PACKET_SIZE];
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if &buf[..n] == WAKE_MAGIC && from.ip().is_loopback() {
                    Ok(Wait::Woken)
                } else {
                    Ok(Wait::Packet(buf[..n].to_vec(), from))
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Wait::TimedOut)
            }
            Err(e) => Err(e),
        }
    }

    fn wake(&self) {
        let _ = self.socket.send_to(WAKE_MAGIC, self.wake_addr);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn binding(&self) -> Binding {
        Binding::Udp(self.socket.clone())
    }
}

/// In-process reactor: datagrams travel over channels. Used by the test
/// suites in place of real sockets.
pub struct LocalReactor {
    addr: SocketAddr,
    inbox: Receiver<(Vec<u8>, SocketAddr)>,
    inbox_tx: Sender<(Vec<u8>, SocketAddr)>,
    outbox: Sender<(Vec<u8>, SocketAddr)>,
}

impl LocalReactor {
    /// Creates a reactor with the given pretend address. Outgoing
    /// datagrams appear on the returned receiver tagged with their
    /// destination.
    pub fn new(addr: SocketAddr) -> (Self, Receiver<(Vec<u8>, SocketAddr)>) {
        let (inbox_tx, inbox) = crossbeam_channel::unbounded();
        let (outbox, out_rx) = crossbeam_channel::unbounded();
        (
            Self {
                addr,
                inbox,
                inbox_tx,
                outbox,
            },
            out_rx,
        )
    }

    /// Sender for injecting inbound datagrams (the "wire").
    pub fn injector(&self) -> Sender<(Vec<u8>, SocketAddr)> {
        self.inbox_tx.clone()
    }
}

impl Reactor for LocalReactor {
    fn send(&self, data: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.outbox
            .send((data.to_vec(), addr))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn recv(&self, timeout: Duration) -> io::Result<Wait> {
        match self.inbox.recv_timeout(timeout) {
            Ok((data, from)) => {
                if data == WAKE_MAGIC {
                    Ok(Wait::Woken)
                } else {
                    Ok(Wait::Packet(data, from))
                }
            }
            Err(RecvTimeoutError::Timeout) => Ok(Wait::TimedOut),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }

    fn wake(&self) {
        let _ = self.inbox_tx.send((WAKE_MAGIC.to_vec(), self.addr));
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn binding(&self) -> Binding {
        Binding::Local(self.outbox.clone())
    }
}
