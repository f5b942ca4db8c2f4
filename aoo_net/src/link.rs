//! Transport bindings and TCP stream framing.
//!
//! Endpoints are never raw sockets in the core: every send goes through
//! a [`Binding`], a variant over UDP, TCP and an in-process double used
//! by the test suites. TCP carries OSC packets prefixed with a 32-bit
//! big-endian length; [`MessageStream`] reassembles them on the way in.

use aoo_wire::AooError;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

/// Maximum size of a single framed TCP packet. Anything larger is a
/// protocol violation and tears the connection down.
pub const MAX_STREAM_PACKET_SIZE: usize = 1 << 20;

/// A handle capable of delivering datagrams/packets to one destination
/// family.
#[derive(Clone)]
pub enum Binding {
    /// Connectionless UDP; the address selects the destination.
    Udp(Arc<UdpSocket>),
    /// A connected TCP stream; packets are length-prefixed and the
    /// address argument is ignored.
    Tcp(Arc<Mutex<TcpStream>>),
    /// In-process double: `(packet, destination)` pairs on a channel.
    Local(Sender<(Vec<u8>, SocketAddr)>),
}

impl Binding {
    /// Sends one packet. TCP framing is applied here.
    pub fn send(&self, data: &[u8], addr: SocketAddr) -> Result<(), AooError> {
        match self {
            Self::Udp(socket) => socket
                .send_to(data, addr)
                .map(|_| ())
                .map_err(|e| {
                    log::warn!("udp send to {addr} failed: {e}");
                    AooError::Socket
                }),
            Self::Tcp(stream) => {
                let mut stream = stream.lock();
                let size = (data.len() as u32).to_be_bytes();
                stream
                    .write_all(&size)
                    .and_then(|_| stream.write_all(data))
                    .map_err(|e| {
                        log::warn!("tcp send failed: {e}");
                        AooError::Socket
                    })
            }
            Self::Local(tx) => tx
                .send((data.to_vec(), addr))
                .map_err(|_| AooError::Socket),
        }
    }
}

/// Reassembles length-prefixed packets from a TCP byte stream.
#[derive(Debug, Default)]
pub struct MessageStream {
    buffer: Vec<u8>,
}

impl MessageStream {
    /// Appends raw bytes and invokes `on_packet` for every complete
    /// packet.
    pub fn feed(
        &mut self,
        data: &[u8],
        mut on_packet: impl FnMut(&[u8]),
    ) -> Result<(), AooError> {
        self.buffer.extend_from_slice(data);
        let mut pos = 0;
        while self.buffer.len() - pos >= 4 {
            let size =
                u32::from_be_bytes(self.buffer[pos..pos + 4].try_into().unwrap()) as usize;
            if size > MAX_STREAM_PACKET_SIZE {
                return Err(AooError::BadFormat);
            }
            if self.buffer.len() - pos - 4 < size {
                break; // incomplete
            }
            on_packet(&self.buffer[pos + 4..pos + 4 + size]);
            pos += 4 + size;
        }
        self.buffer.drain(..pos);
        Ok(())
    }
}

/// Frames one packet for the TCP transport.
pub fn frame_packet(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

//--------------------------- server link ----------------------------//

use aoo_wire::HostName;
use crossbeam_channel::Receiver;
use std::io::Read;
use std::net::ToSocketAddrs;
use std::time::Duration;

enum LinkTransport {
    Tcp(TcpStream),
    Local {
        /// Framed packets towards the server's stream reassembly.
        tx: Sender<Vec<u8>>,
        /// Whole packets from the server's [`Binding::Local`].
        rx: Receiver<(Vec<u8>, SocketAddr)>,
    },
}

/// The client's connection to the rendezvous server: a non-blocking
/// byte stream plus packet reassembly.
pub struct ServerLink {
    transport: LinkTransport,
    stream: MessageStream,
}

impl ServerLink {
    pub fn from_tcp(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            transport: LinkTransport::Tcp(stream),
            stream: MessageStream::default(),
        })
    }

    /// In-process double: `tx` carries framed packets to the server,
    /// `rx` receives whole packets from it.
    pub fn local(tx: Sender<Vec<u8>>, rx: Receiver<(Vec<u8>, SocketAddr)>) -> Self {
        Self {
            transport: LinkTransport::Local { tx, rx },
            stream: MessageStream::default(),
        }
    }

    /// Sends one packet (length-prefixed).
    pub fn send_packet(&mut self, data: &[u8]) -> Result<(), AooError> {
        let framed = frame_packet(data);
        match &mut self.transport {
            LinkTransport::Tcp(stream) => stream.write_all(&framed).map_err(|e| {
                log::warn!("server link send failed: {e}");
                AooError::Socket
            }),
            LinkTransport::Local { tx, .. } => {
                tx.send(framed).map_err(|_| AooError::Socket)
            }
        }
    }

    /// Drains available inbound bytes, invoking `on_packet` for every
    /// complete packet. `Err(Socket)` means the connection is gone.
    pub fn poll(&mut self, mut on_packet: impl FnMut(&[u8])) -> Result<(), AooError> {
        match &mut self.transport {
            LinkTransport::Tcp(tcp) => {
                let mut buf = [0u8; 4096];
                loop {
                    match tcp.read(&mut buf) {
                        Ok(0) => {
                            log::debug!("server closed the TCP connection");
                            return Err(AooError::Socket);
                        }
                        Ok(n) => self.stream.feed(&buf[..n], &mut on_packet)?,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::warn!("server link read failed: {e}");
                            return Err(AooError::Socket);
                        }
                    }
                }
            }
            LinkTransport::Local { rx, .. } => {
                while let Ok((packet, _)) = rx.try_recv() {
                    on_packet(&packet);
                }
                Ok(())
            }
        }
    }
}

/// Establishes the server link; pluggable so the test suites can run
/// without sockets.
pub trait Connector: Send {
    fn connect(&mut self, host: &HostName) -> Result<ServerLink, crate::ErrorReply>;
}

/// Default connector: resolves the host name and opens a TCP stream
/// with a bounded timeout, preferring IPv4 addresses (rendezvous
/// servers are more likely to be IPv4-only than IPv6-only).
pub struct TcpConnector {
    pub timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self, host: &HostName) -> Result<ServerLink, crate::ErrorReply> {
        let mut addrs: Vec<SocketAddr> = (host.name.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|e| crate::ErrorReply {
                kind: AooError::Socket,
                code: e.raw_os_error().unwrap_or(0),
                message: format!("could not resolve host name: {e}"),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(crate::ErrorReply::with_message(
                AooError::Socket,
                "host name resolved to no addresses",
            ));
        }
        addrs.sort_by_key(|a| a.is_ipv6());

        let mut last_error = None;
        for addr in &addrs {
            log::debug!("trying to connect to {addr}");
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(stream) => {
                    log::info!("connected to {addr}");
                    return ServerLink::from_tcp(stream).map_err(|e| crate::ErrorReply {
                        kind: AooError::Socket,
                        code: e.raw_os_error().unwrap_or(0),
                        message: e.to_string(),
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        let e = last_error.unwrap();
        Err(crate::ErrorReply {
            kind: AooError::Socket,
            code: e.raw_os_error().unwrap_or(0),
            message: format!("could not connect to {host}: {e}"),
        })
    }
}

/// Resolves the server's UDP endpoints (same host and port as TCP).
pub fn resolve_udp_addrs(host: &HostName) -> Result<Vec<SocketAddr>, crate::ErrorReply> {
    let mut addrs: Vec<SocketAddr> = (host.name.as_str(), host.port)
        .to_socket_addrs()
        .map_err(|e| crate::ErrorReply {
            kind: AooError::Socket,
            code: e.raw_os_error().unwrap_or(0),
            message: format!("could not resolve host name: {e}"),
        })?
        .collect();
    addrs.sort_by_key(|a| a.is_ipv6());
    if addrs.is_empty() {
        Err(crate::ErrorReply::with_message(
            AooError::Socket,
            "host name resolved to no addresses",
        ))
    } else {
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_split_packets() {
        let mut stream = MessageStream::default();
        let a = frame_packet(b"hello");
        let b = frame_packet(b"world!");
        let mut bytes = a.clone();
        bytes.extend_from_slice(&b);

        let mut got = Vec::new();
        // feed in awkward chunks
        for chunk in bytes.chunks(3) {
            stream
                .feed(chunk, |packet| got.push(packet.to_vec()))
                .unwrap();
        }
        assert_eq!(got, vec![b"hello".to_vec(), b"world!".to_vec()]);
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let mut stream = MessageStream::default();
        let bad = (u32::MAX).to_be_bytes();
        assert_eq!(
            stream.feed(&bad, |_| unreachable!()),
            Err(AooError::BadFormat)
        );
    }
}
