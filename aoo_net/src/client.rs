//! The client session engine.
//!
//! One instance per node. Control requests are enqueued as commands from
//! any thread and performed on the network thread inside [`Client::run`],
//! which multiplexes the UDP socket (through a [`Reactor`]), the TCP
//! server link, the peer roster and any attached stream engines.
//!
//! Session life cycle: `disconnected -> handshake -> connecting ->
//! connected`. A `connect` request resolves the server and starts UDP
//! probing (`/query`); the query reply carries our public address and
//! triggers the TCP login; a successful login reply completes the
//! session. Any fatal TCP error tears everything down.

use crate::link::{resolve_udp_addrs, Connector, ServerLink, TcpConnector};
use crate::peer::{read_relay_packet, Peer, PeerMessage, PeerSettings};
use crate::reactor::{Reactor, Wait};
use crate::{ClientEvent, ErrorReply, PeerId, ReplyFn, Response};

use aoo_stream::sink::Sink;
use aoo_stream::source::Source;
use aoo_wire::binmsg::{self, MsgType};
use aoo_wire::osc::{OscReader, OscWriter};
use aoo_wire::{
    pattern, read_host, read_metadata, write_addr, write_host, write_metadata, AooError, HostName,
    Id, Metadata, WireError, MAX_PACKET_SIZE,
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use priority_queue::PriorityQueue;
use rustc_hash::FxBuildHasher;
use std::cmp::Reverse;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll floor while a TCP link is alive; bounds the latency of the
/// non-blocking TCP drain.
const POLL_PERIOD: Duration = Duration::from_millis(10);
/// Idle wait when there is nothing to poll but commands.
const IDLE_PERIOD: Duration = Duration::from_millis(250);

/// Observable session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Handshake = 1,
    Connecting = 2,
    Connected = 3,
}

/// Peer-message targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    /// Every connected peer.
    All,
    /// Every connected peer of one group.
    Group(Id),
    /// One peer.
    Peer(PeerId),
}

enum Command {
    Connect {
        host: HostName,
        password: String,
        metadata: Option<Metadata>,
        reply: ReplyFn,
    },
    Disconnect {
        reply: ReplyFn,
    },
    JoinGroup {
        group_name: String,
        group_pwd: String,
        user_name: String,
        user_pwd: String,
        group_md: Option<Metadata>,
        user_md: Option<Metadata>,
        relay: HostName,
        reply: ReplyFn,
    },
    LeaveGroup {
        group: Id,
        reply: ReplyFn,
    },
    UpdateGroup {
        group: Id,
        metadata: Option<Metadata>,
        reply: ReplyFn,
    },
    UpdateUser {
        group: Id,
        metadata: Option<Metadata>,
        reply: ReplyFn,
    },
    CustomRequest {
        data: Metadata,
        flags: i32,
        reply: ReplyFn,
    },
    SendMessage {
        target: MessageTarget,
        message: PeerMessage,
    },
    Quit,
}

/// Connect request state carried through the handshake.
struct Connection {
    host: HostName,
    password: String,
    metadata: Option<Metadata>,
    reply: Option<ReplyFn>,
}

enum Session {
    Disconnected,
    Handshake {
        conn: Connection,
        server_addrs: Vec<SocketAddr>,
        start: Instant,
        last_query: Option<Instant>,
    },
    Connecting {
        conn: Connection,
        link: ServerLink,
        server_addr: SocketAddr,
    },
    Connected {
        link: ServerLink,
        client_id: Id,
        server_relay: bool,
        server_addr: SocketAddr,
        last_ping: Instant,
    },
}

impl Session {
    fn state(&self) -> SessionState {
        match self {
            Self::Disconnected => SessionState::Disconnected,
            Self::Handshake { .. } => SessionState::Handshake,
            Self::Connecting { .. } => SessionState::Connecting,
            Self::Connected { .. } => SessionState::Connected,
        }
    }
}

enum Pending {
    GroupJoin {
        group_name: String,
        user_name: String,
        user_relay: HostName,
        reply: ReplyFn,
    },
    GroupLeave {
        group: Id,
        reply: ReplyFn,
    },
    GroupUpdate {
        reply: ReplyFn,
    },
    UserUpdate {
        group: Id,
        reply: ReplyFn,
    },
    Custom {
        reply: ReplyFn,
    },
}

impl Pending {
    fn fail(self, error: ErrorReply) {
        match self {
            Self::GroupJoin { reply, .. }
            | Self::GroupLeave { reply, .. }
            | Self::GroupUpdate { reply }
            | Self::UserUpdate { reply, .. }
            | Self::Custom { reply } => reply(Err(error)),
        }
    }
}

struct Membership {
    group_id: Id,
    user_id: Id,
    group_name: String,
    /// Relay endpoints for this group, in descending priority.
    relay_list: Vec<SocketAddr>,
}

/// Mutable engine state; touched only on the network thread.
struct Engine {
    session: Session,
    memberships: Vec<Membership>,
    pending: rustc_hash::FxHashMap<Id, Pending>,
    next_token: Id,
}

/// The per-node session engine.
pub struct Client {
    reactor: Arc<dyn Reactor>,
    connector: Mutex<Box<dyn Connector>>,
    engine: Mutex<Engine>,
    state: AtomicU8,
    quit: AtomicBool,
    commands: (Sender<Command>, Receiver<Command>),
    events: (Sender<ClientEvent>, Receiver<ClientEvent>),
    peers: RwLock<Vec<Peer>>,
    sources: RwLock<Vec<Arc<Source>>>,
    sinks: RwLock<Vec<Arc<Sink>>>,
    settings: PeerSettings,
}

impl Client {
    pub fn new(reactor: Arc<dyn Reactor>) -> Self {
        Self::with_connector(reactor, Box::new(TcpConnector::default()))
    }

    /// Creates a client with a custom server connector (used by the
    /// in-process test double).
    pub fn with_connector(reactor: Arc<dyn Reactor>, connector: Box<dyn Connector>) -> Self {
        Self {
            reactor,
            connector: Mutex::new(connector),
            engine: Mutex::new(Engine {
                session: Session::Disconnected,
                memberships: Vec::new(),
                pending: rustc_hash::FxHashMap::default(),
                next_token: 0,
            }),
            state: AtomicU8::new(SessionState::Disconnected as u8),
            quit: AtomicBool::new(false),
            commands: crossbeam_channel::unbounded(),
            events: crossbeam_channel::unbounded(),
            peers: RwLock::new(Vec::new()),
            sources: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            settings: PeerSettings::default(),
        }
    }

    pub fn events(&self) -> Receiver<ClientEvent> {
        self.events.1.clone()
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            0 => SessionState::Disconnected,
            1 => SessionState::Handshake,
            2 => SessionState::Connecting,
            _ => SessionState::Connected,
        }
    }

    //----------------------- control surface ------------------------//

    pub fn connect(
        &self,
        host: HostName,
        password: &str,
        metadata: Option<Metadata>,
        reply: ReplyFn,
    ) {
        self.push(Command::Connect {
            host,
            password: crate::encrypt_password(password),
            metadata,
            reply,
        });
    }

    pub fn disconnect(&self, reply: ReplyFn) {
        self.push(Command::Disconnect { reply });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn join_group(
        &self,
        group_name: &str,
        group_pwd: &str,
        user_name: &str,
        user_pwd: &str,
        group_md: Option<Metadata>,
        user_md: Option<Metadata>,
        relay: HostName,
        reply: ReplyFn,
    ) {
        self.push(Command::JoinGroup {
            group_name: group_name.to_string(),
            group_pwd: crate::encrypt_password(group_pwd),
            user_name: user_name.to_string(),
            user_pwd: crate::encrypt_password(user_pwd),
            group_md,
            user_md,
            relay,
            reply,
        });
    }

    pub fn leave_group(&self, group: Id, reply: ReplyFn) {
        self.push(Command::LeaveGroup { group, reply });
    }

    pub fn update_group(&self, group: Id, metadata: Option<Metadata>, reply: ReplyFn) {
        self.push(Command::UpdateGroup {
            group,
            metadata,
            reply,
        });
    }

    pub fn update_user(&self, group: Id, metadata: Option<Metadata>, reply: ReplyFn) {
        self.push(Command::UpdateUser {
            group,
            metadata,
            reply,
        });
    }

    pub fn custom_request(&self, data: Metadata, flags: i32, reply: ReplyFn) {
        self.push(Command::CustomRequest { data, flags, reply });
    }

    /// Sends an application message to one or more peers; reliable
    /// messages are acknowledged and retransmitted.
    pub fn send_message(&self, target: MessageTarget, message: PeerMessage) {
        self.push(Command::SendMessage { target, message });
    }

    /// Signals the network loop to exit.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        let _ = self.commands.0.send(Command::Quit);
        self.reactor.wake();
    }

    fn push(&self, command: Command) {
        let _ = self.commands.0.send(command);
        self.reactor.wake();
    }

    //----------------------- engine attachment ----------------------//

    pub fn add_source(&self, source: Arc<Source>) {
        self.sources.write().push(source);
    }

    pub fn remove_source(&self, id: Id) {
        self.sources.write().retain(|s| s.id() != id);
    }

    pub fn add_sink(&self, sink: Arc<Sink>) {
        self.sinks.write().push(sink);
    }

    pub fn remove_sink(&self, id: Id) {
        self.sinks.write().retain(|s| s.id() != id);
    }

    //--------------------------- queries ----------------------------//

    /// The UDP address of a connected peer.
    pub fn peer_address(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers
            .read()
            .iter()
            .find(|p| p.peer_id() == peer)
            .and_then(|p| p.address())
    }

    /// Snapshot of the roster: `(id, group, user, address)`.
    pub fn list_peers(&self) -> Vec<(PeerId, String, String, Option<SocketAddr>)> {
        self.peers
            .read()
            .iter()
            .map(|p| {
                (
                    p.peer_id(),
                    p.group_name().to_string(),
                    p.user_name().to_string(),
                    p.address(),
                )
            })
            .collect()
    }

    //-------------------------- main loop ---------------------------//

    /// Runs the network loop until [`Client::quit`]. All I/O and all
    /// command execution happens here.
    pub fn run(&self) {
        // deadline bookkeeping in the style of a timer wheel: the next
        // instant each recurring duty is due
        let mut duties: PriorityQueue<Duty, Reverse<Instant>, FxBuildHasher> =
            PriorityQueue::with_hasher(FxBuildHasher);
        let now = Instant::now();
        duties.push(Duty::Peers, Reverse(now));
        duties.push(Duty::Session, Reverse(now));

        while !self.quit.load(Ordering::Acquire) {
            while let Ok(command) = self.commands.1.try_recv() {
                self.perform(command);
            }
            if self.quit.load(Ordering::Acquire) {
                break;
            }

            self.poll_server_link();

            let now = Instant::now();
            while let Some((&duty, &Reverse(deadline))) = duties.peek() {
                if deadline > now {
                    break;
                }
                let next = match duty {
                    Duty::Session => {
                        self.update_session(now);
                        now + POLL_PERIOD
                    }
                    Duty::Peers => {
                        self.update_peers(now);
                        self.pump_engines();
                        now + POLL_PERIOD
                    }
                };
                duties.change_priority(&duty, Reverse(next));
            }

            let timeout = match self.state() {
                SessionState::Disconnected => IDLE_PERIOD,
                _ => POLL_PERIOD,
            };
            match self.reactor.recv(timeout) {
                Ok(Wait::Packet(data, from)) => {
                    if let Err(e) = self.dispatch_udp(&data, from) {
                        log::debug!("client: dropped UDP packet from {from}: {e}");
                    }
                }
                Ok(Wait::Woken) | Ok(Wait::TimedOut) => {}
                Err(e) => {
                    log::error!("client: reactor failed: {e}");
                    self.close(Some(ErrorReply::with_message(
                        AooError::Socket,
                        e.to_string(),
                    )));
                    break;
                }
            }
        }
        self.close(None);
    }

    //-------------------------- commands ----------------------------//

    fn perform(&self, command: Command) {
        match command {
            Command::Connect {
                host,
                password,
                metadata,
                reply,
            } => self.perform_connect(host, password, metadata, reply),
            Command::Disconnect { reply } => {
                if self.state() == SessionState::Disconnected {
                    reply(Err(ErrorReply::new(AooError::NotConnected)));
                } else {
                    self.close(None);
                    reply(Ok(Response::Disconnect));
                }
            }
            Command::JoinGroup {
                group_name,
                group_pwd,
                user_name,
                user_pwd,
                group_md,
                user_md,
                relay,
                reply,
            } => self.perform_join_group(
                group_name, group_pwd, user_name, user_pwd, group_md, user_md, relay, reply,
            ),
            Command::LeaveGroup { group, reply } => self.perform_leave_group(group, reply),
            Command::UpdateGroup {
                group,
                metadata,
                reply,
            } => self.perform_update(group, metadata, reply, false),
            Command::UpdateUser {
                group,
                metadata,
                reply,
            } => self.perform_update(group, metadata, reply, true),
            Command::CustomRequest { data, flags, reply } => {
                self.perform_custom_request(data, flags, reply)
            }
            Command::SendMessage { target, message } => {
                self.perform_send_message(target, &message)
            }
            Command::Quit => {}
        }
    }

    fn perform_connect(
        &self,
        host: HostName,
        password: String,
        metadata: Option<Metadata>,
        reply: ReplyFn,
    ) {
        let mut engine = self.engine.lock();
        if engine.session.state() != SessionState::Disconnected {
            let kind = if engine.session.state() == SessionState::Connected {
                AooError::AlreadyConnected
            } else {
                AooError::RequestInProgress
            };
            drop(engine);
            reply(Err(ErrorReply::new(kind)));
            return;
        }
        let server_addrs = match resolve_udp_addrs(&host) {
            Ok(addrs) => addrs,
            Err(e) => {
                drop(engine);
                reply(Err(e));
                return;
            }
        };
        log::debug!("client: starting UDP handshake with {host}");
        engine.session = Session::Handshake {
            conn: Connection {
                host,
                password,
                metadata,
                reply: Some(reply),
            },
            server_addrs,
            start: Instant::now(),
            last_query: None,
        };
        self.set_state(SessionState::Handshake);
    }

    #[allow(clippy::too_many_arguments)]
    fn perform_join_group(
        &self,
        group_name: String,
        group_pwd: String,
        user_name: String,
        user_pwd: String,
        group_md: Option<Metadata>,
        user_md: Option<Metadata>,
        relay: HostName,
        reply: ReplyFn,
    ) {
        let mut engine = self.engine.lock();
        if engine.session.state() != SessionState::Connected {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::NotConnected)));
            return;
        }
        if engine.memberships.iter().any(|m| m.group_name == group_name) {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::AlreadyGroupMember)));
            return;
        }
        let token = engine.make_token();
        engine.pending.insert(
            token,
            Pending::GroupJoin {
                group_name: group_name.clone(),
                user_name: user_name.clone(),
                user_relay: relay.clone(),
                reply,
            },
        );

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let result = (|| -> Result<usize, WireError> {
            let mut w = OscWriter::new(&mut buf, pattern::SERVER_GROUP_JOIN, "issssibibsi")?;
            w.i32(token)?;
            w.str(&group_name)?;
            w.str(&group_pwd)?;
            w.str(&user_name)?;
            w.str(&user_pwd)?;
            write_metadata(&mut w, group_md.as_ref())?;
            write_metadata(&mut w, user_md.as_ref())?;
            write_host(&mut w, &relay)?;
            Ok(w.len())
        })();
        match result {
            Ok(len) => {
                let packet = buf[..len].to_vec();
                self.send_server_packet(&mut engine, &packet);
            }
            Err(e) => {
                if let Some(pending) = engine.pending.remove(&token) {
                    drop(engine);
                    pending.fail(ErrorReply::new(e.into()));
                }
            }
        }
    }

    fn perform_leave_group(&self, group: Id, reply: ReplyFn) {
        let mut engine = self.engine.lock();
        if engine.session.state() != SessionState::Connected {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::NotConnected)));
            return;
        }
        if !engine.memberships.iter().any(|m| m.group_id == group) {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::NotGroupMember)));
            return;
        }
        let token = engine.make_token();
        engine
            .pending
            .insert(token, Pending::GroupLeave { group, reply });

        let mut buf = [0u8; 128];
        if let Ok(len) = (|| -> Result<usize, WireError> {
            let mut w = OscWriter::new(&mut buf, pattern::SERVER_GROUP_LEAVE, "ii")?;
            w.i32(token)?;
            w.i32(group)?;
            Ok(w.len())
        })() {
            let packet = buf[..len].to_vec();
            self.send_server_packet(&mut engine, &packet);
        }
    }

    fn perform_update(
        &self,
        group: Id,
        metadata: Option<Metadata>,
        reply: ReplyFn,
        user: bool,
    ) {
        let mut engine = self.engine.lock();
        if engine.session.state() != SessionState::Connected {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::NotConnected)));
            return;
        }
        if !engine.memberships.iter().any(|m| m.group_id == group) {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::NotGroupMember)));
            return;
        }
        let token = engine.make_token();
        let (pattern_, pending) = if user {
            (
                pattern::SERVER_USER_UPDATE,
                Pending::UserUpdate { group, reply },
            )
        } else {
            (pattern::SERVER_GROUP_UPDATE, Pending::GroupUpdate { reply })
        };
        engine.pending.insert(token, pending);

        let mut buf = [0u8; MAX_PACKET_SIZE];
        if let Ok(len) = (|| -> Result<usize, WireError> {
            let mut w = OscWriter::new(&mut buf, pattern_, "iiib")?;
            w.i32(token)?;
            w.i32(group)?;
            write_metadata(&mut w, metadata.as_ref())?;
            Ok(w.len())
        })() {
            let packet = buf[..len].to_vec();
            self.send_server_packet(&mut engine, &packet);
        }
    }

    fn perform_custom_request(&self, data: Metadata, flags: i32, reply: ReplyFn) {
        let mut engine = self.engine.lock();
        if engine.session.state() != SessionState::Connected {
            drop(engine);
            reply(Err(ErrorReply::new(AooError::NotConnected)));
            return;
        }
        let token = engine.make_token();
        engine.pending.insert(token, Pending::Custom { reply });

        let mut buf = [0u8; MAX_PACKET_SIZE];
        if let Ok(len) = (|| -> Result<usize, WireError> {
            let mut w = OscWriter::new(&mut buf, pattern::SERVER_REQUEST, "iiib")?;
            w.i32(token)?;
            w.i32(flags)?;
            write_metadata(&mut w, Some(&data))?;
            Ok(w.len())
        })() {
            let packet = buf[..len].to_vec();
            self.send_server_packet(&mut engine, &packet);
        }
    }

    fn perform_send_message(&self, target: MessageTarget, message: &PeerMessage) {
        let reactor = &*self.reactor;
        let mut send = |data: &[u8], addr: SocketAddr| {
            if let Err(e) = reactor.send(data, addr) {
                log::warn!("client: send to {addr} failed: {e}");
            }
        };
        let mut peers = self.peers.write();
        for peer in peers.iter_mut() {
            let matches = match target {
                MessageTarget::All => true,
                MessageTarget::Group(group) => peer.group_id() == group,
                MessageTarget::Peer(id) => peer.peer_id() == id,
            };
            if matches && peer.connected() {
                peer.send_message(message, &mut send);
            }
        }
    }

    //------------------------ periodic work -------------------------//

    fn update_session(&self, now: Instant) {
        let mut engine = self.engine.lock();
        match &mut engine.session {
            Session::Handshake {
                server_addrs,
                start,
                last_query,
                ..
            } => {
                if now.duration_since(*start)
                    > Duration::from_millis(crate::QUERY_TIMEOUT_MS)
                {
                    log::error!("client: UDP handshake with server timed out");
                    let Session::Handshake { conn, .. } =
                        core::mem::replace(&mut engine.session, Session::Disconnected)
                    else {
                        unreachable!()
                    };
                    self.set_state(SessionState::Disconnected);
                    drop(engine);
                    if let Some(reply) = conn.reply {
                        reply(Err(ErrorReply::new(AooError::UdpHandshakeTimeOut)));
                    }
                    return;
                }
                let due = match last_query {
                    Some(t) => {
                        now.duration_since(*t)
                            >= Duration::from_millis(crate::QUERY_INTERVAL_MS)
                    }
                    None => true,
                };
                if due {
                    *last_query = Some(now);
                    let mut buf = [0u8; 64];
                    if let Ok(w) = OscWriter::new(&mut buf, pattern::SERVER_QUERY, "") {
                        let len = w.len();
                        for addr in server_addrs.iter() {
                            let _ = self.reactor.send(&buf[..len], *addr);
                        }
                    }
                }
            }
            Session::Connected {
                server_addr,
                last_ping,
                link,
                ..
            } => {
                if now.duration_since(*last_ping)
                    >= Duration::from_millis(crate::PING_INTERVAL_MS)
                {
                    *last_ping = now;
                    let mut buf = [0u8; 64];
                    if let Ok(w) = OscWriter::new(&mut buf, pattern::SERVER_PING, "") {
                        let len = w.len();
                        // TCP keeps the session alive, UDP keeps the
                        // NAT mapping alive
                        let _ = link.send_packet(&buf[..len]);
                        let _ = self.reactor.send(&buf[..len], *server_addr);
                    }
                }
            }
            _ => {}
        }
    }

    fn update_peers(&self, now: Instant) {
        let reactor = &*self.reactor;
        let mut send = |data: &[u8], addr: SocketAddr| {
            if let Err(e) = reactor.send(data, addr) {
                log::debug!("client: send to {addr} failed: {e}");
            }
        };
        let mut peers = self.peers.write();
        for peer in peers.iter_mut() {
            peer.update(now, &self.settings, &self.events.0, &mut send);
        }
    }

    /// Pumps the attached stream engines, routing their traffic through
    /// the peer table (for relay wrapping).
    fn pump_engines(&self) {
        let sources: Vec<Arc<Source>> = self.sources.read().clone();
        let sinks: Vec<Arc<Sink>> = self.sinks.read().clone();
        if sources.is_empty() && sinks.is_empty() {
            return;
        }
        let reactor = &*self.reactor;
        let peers = self.peers.read();
        let mut route = |data: &[u8], addr: SocketAddr| {
            // wrap for relayed peers
            for peer in peers.iter() {
                if peer.match_addr(addr) {
                    if let (true, Some(relay)) = (peer.relay_active(), peer.relay_address()) {
                        let mut buf = [0u8; MAX_PACKET_SIZE + 32];
                        if let Ok(len) = crate::peer::write_relay_packet(&mut buf, data, addr) {
                            let _ = reactor.send(&buf[..len], relay);
                        }
                        return;
                    }
                    break;
                }
            }
            let _ = reactor.send(data, addr);
        };
        for source in &sources {
            source.send(&mut route);
        }
        for sink in &sinks {
            sink.send(&mut route);
        }
    }

    //------------------------ UDP dispatch --------------------------//

    fn dispatch_udp(&self, data: &[u8], from: SocketAddr) -> Result<(), AooError> {
        let parsed = pattern::parse(data)?;
        match parsed.msg_type {
            MsgType::Source => {
                for source in self.sources.read().iter() {
                    let _ = source.handle_message(data, from);
                }
                Ok(())
            }
            MsgType::Sink => {
                for sink in self.sinks.read().iter() {
                    let _ = sink.handle_message(data, from);
                }
                Ok(())
            }
            MsgType::Peer => self.dispatch_peer(data, &parsed, from),
            MsgType::Client => self.handle_server_udp(data, &parsed, from),
            MsgType::Relay => {
                // unwrap and dispatch as if it came from the original
                // source address
                let (source_addr, packet) = read_relay_packet(data)?;
                self.dispatch_udp(&packet, source_addr)
            }
            MsgType::Server => Err(AooError::BadFormat),
        }
    }

    fn dispatch_peer(
        &self,
        data: &[u8],
        parsed: &pattern::ParsedPattern,
        from: SocketAddr,
    ) -> Result<(), AooError> {
        // every peer message leads with the group and user id of the
        // sender, in both framings
        if binmsg::is_binary(data) {
            let header = binmsg::read_header(data)?;
            let mut peers = self.peers.write();
            let peer = peers
                .iter_mut()
                .find(|p| p.group_id() == header.group() && p.user_id() == header.user());
            match peer {
                Some(peer) => {
                    peer.handle_binary(header.cmd, &data[header.size..], from, &self.events.0)
                }
                None => {
                    log::warn!(
                        "client: binary message from unknown peer {}|{}",
                        header.group(),
                        header.user()
                    );
                    Err(AooError::NotFound)
                }
            }
        } else {
            let mut r = OscReader::parse(data)?;
            let verb = &r.pattern()[parsed.onset..];
            let group = r.i32()?;
            let user = r.i32()?;
            let mut peers = self.peers.write();
            let peer = peers
                .iter_mut()
                .find(|p| p.group_id() == group && p.user_id() == user);
            match peer {
                Some(peer) => peer.handle_osc(verb, &mut r, from, &self.events.0),
                None => {
                    log::warn!("client: {verb} from unknown peer {group}|{user}");
                    Err(AooError::NotFound)
                }
            }
        }
    }

    /// Server messages arriving over UDP (handshake phase and pongs).
    fn handle_server_udp(
        &self,
        data: &[u8],
        parsed: &pattern::ParsedPattern,
        from: SocketAddr,
    ) -> Result<(), AooError> {
        let mut r = OscReader::parse(data)?;
        let verb = &r.pattern()[parsed.onset..];
        match verb {
            pattern::MSG_QUERY => {
                let public_addr = aoo_wire::read_addr(&mut r)?;
                self.handle_query_reply(public_addr, from);
                Ok(())
            }
            pattern::MSG_PONG => Ok(()),
            _ => {
                log::debug!("client: unexpected server UDP message {verb}");
                Ok(())
            }
        }
    }

    /// The query reply carries our observed public address; time to log
    /// in over TCP.
    fn handle_query_reply(&self, public_addr: SocketAddr, from: SocketAddr) {
        let mut engine = self.engine.lock();
        let engine = &mut *engine;
        if !matches!(engine.session, Session::Handshake { .. }) {
            return; // duplicate reply
        }
        log::debug!("client: server reports our public address as {public_addr}");
        let token = engine.make_token();

        replace_with::replace_with_or_abort(&mut engine.session, |session| {
            let Session::Handshake { mut conn, .. } = session else {
                unreachable!()
            };
            match self.connector.lock().connect(&conn.host) {
                Ok(mut link) => {
                    match self.write_login(token, &conn, public_addr) {
                        Ok(packet) => {
                            if link.send_packet(&packet).is_ok() {
                                self.set_state(SessionState::Connecting);
                                return Session::Connecting {
                                    conn,
                                    link,
                                    server_addr: from,
                                };
                            }
                            if let Some(reply) = conn.reply.take() {
                                reply(Err(ErrorReply::new(AooError::Socket)));
                            }
                        }
                        Err(e) => {
                            if let Some(reply) = conn.reply.take() {
                                reply(Err(ErrorReply::new(e.into())));
                            }
                        }
                    }
                    self.set_state(SessionState::Disconnected);
                    Session::Disconnected
                }
                Err(e) => {
                    log::error!("client: TCP connection failed: {e}");
                    if let Some(reply) = conn.reply.take() {
                        reply(Err(e));
                    }
                    self.set_state(SessionState::Disconnected);
                    Session::Disconnected
                }
            }
        });
    }

    // /aoo/server/login <token> <version> <pwd> <n_addr> <addr>* <md>
    fn write_login(
        &self,
        token: Id,
        conn: &Connection,
        public_addr: SocketAddr,
    ) -> Result<Vec<u8>, WireError> {
        let mut addresses = Vec::new();
        if let Some(local) = self.reactor.local_addr() {
            if !local.ip().is_unspecified() {
                addresses.push(local);
            }
        }
        if !addresses.contains(&public_addr) {
            addresses.push(public_addr);
        }

        let mut tags = arrayvec::ArrayString::<64>::new();
        tags.try_push_str("iisi").map_err(|_| WireError::Overflow)?;
        for _ in &addresses {
            tags.try_push_str("si").map_err(|_| WireError::Overflow)?;
        }
        tags.try_push_str("ib").map_err(|_| WireError::Overflow)?;

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut w = OscWriter::new(&mut buf, pattern::SERVER_LOGIN, &tags)?;
        w.i32(token)?;
        w.i32(aoo_wire::make_version(0) as i32)?;
        w.str(&conn.password)?;
        w.i32(addresses.len() as i32)?;
        for addr in &addresses {
            write_addr(&mut w, *addr)?;
        }
        write_metadata(&mut w, conn.metadata.as_ref())?;
        Ok(w.finish().to_vec())
    }

    //------------------------ TCP handling --------------------------//

    fn poll_server_link(&self) {
        let mut engine = self.engine.lock();
        let link = match &mut engine.session {
            Session::Connecting { link, .. } | Session::Connected { link, .. } => link,
            _ => return,
        };
        let mut packets: Vec<Vec<u8>> = Vec::new();
        let result = link.poll(|packet| packets.push(packet.to_vec()));
        drop(engine);

        if let Err(e) = result {
            log::error!("client: server connection lost: {e}");
            self.close(Some(ErrorReply::new(e)));
            return;
        }
        for packet in packets {
            if let Err(e) = self.handle_server_packet(&packet) {
                log::warn!("client: bad server message: {e}");
            }
        }
    }

    fn handle_server_packet(&self, data: &[u8]) -> Result<(), AooError> {
        let parsed = pattern::parse(data)?;
        if parsed.msg_type != MsgType::Client {
            return Err(AooError::BadFormat);
        }
        let mut r = OscReader::parse(data)?;
        let verb = &r.pattern()[parsed.onset..];
        match verb {
            pattern::MSG_PONG => Ok(()),
            pattern::MSG_LOGIN => self.handle_login_reply(&mut r),
            pattern::MSG_PEER_JOIN => self.handle_peer_add(&mut r),
            pattern::MSG_PEER_LEAVE => self.handle_peer_remove(&mut r),
            pattern::MSG_PEER_CHANGED => self.handle_peer_changed(&mut r),
            pattern::MSG_GROUP_CHANGED => self.handle_group_changed(&mut r),
            pattern::MSG_USER_CHANGED => self.handle_user_changed(&mut r),
            pattern::MSG_GROUP_EJECT => self.handle_group_eject(&mut r),
            pattern::MSG_MESSAGE => {
                let data = read_metadata(&mut r)?.unwrap_or_default();
                let _ = self.events.0.send(ClientEvent::Notification(data));
                Ok(())
            }
            pattern::MSG_GROUP_JOIN
            | pattern::MSG_GROUP_LEAVE
            | pattern::MSG_GROUP_UPDATE
            | pattern::MSG_USER_UPDATE
            | pattern::MSG_REQUEST => self.handle_request_reply(verb, &mut r),
            _ => {
                log::warn!("client: unsupported server message {verb}");
                Err(AooError::NotImplemented)
            }
        }
    }

    fn handle_login_reply(&self, r: &mut OscReader) -> Result<(), AooError> {
        let _token = r.i32()?;
        let result = r.i32()?;
        let mut engine = self.engine.lock();
        if !matches!(engine.session, Session::Connecting { .. }) {
            return Ok(());
        }
        if result == 0 {
            let version = r.i32()? as u32;
            let client_id = r.i32()?;
            let flags = r.i32()?;
            let metadata = read_metadata(r)?;
            if !aoo_wire::check_version(version) {
                drop(engine);
                self.close(Some(ErrorReply::new(AooError::BadArgument)));
                return Ok(());
            }
            let server_relay = flags & crate::server::SERVER_FLAG_RELAY != 0;
            replace_with::replace_with_or_abort(&mut engine.session, |session| {
                let Session::Connecting {
                    mut conn,
                    link,
                    server_addr,
                } = session
                else {
                    unreachable!()
                };
                if let Some(reply) = conn.reply.take() {
                    reply(Ok(Response::Connect {
                        client_id,
                        server_relay,
                        metadata,
                    }));
                }
                Session::Connected {
                    link,
                    client_id,
                    server_relay,
                    server_addr,
                    last_ping: Instant::now(),
                }
            });
            self.set_state(SessionState::Connected);
            log::info!("client: logged in (client id {client_id})");
        } else {
            let kind = AooError::from_code(result).unwrap_or(AooError::BadArgument);
            let code = r.i32().unwrap_or(0);
            let message = r.str().unwrap_or("login failed").to_string();
            log::warn!("client: login failed: {message}");
            let Session::Connecting { mut conn, .. } =
                core::mem::replace(&mut engine.session, Session::Disconnected)
            else {
                unreachable!()
            };
            self.set_state(SessionState::Disconnected);
            drop(engine);
            if let Some(reply) = conn.reply.take() {
                reply(Err(ErrorReply {
                    kind,
                    code,
                    message,
                }));
            }
        }
        Ok(())
    }

    fn handle_request_reply(&self, verb: &str, r: &mut OscReader) -> Result<(), AooError> {
        let token = r.i32()?;
        let result = r.i32()?;
        let mut engine = self.engine.lock();
        let Some(pending) = engine.pending.remove(&token) else {
            log::error!("client: no matching request for token {token}");
            return Ok(());
        };

        if result != 0 {
            let kind = AooError::from_code(result).unwrap_or(AooError::BadArgument);
            let code = r.i32().unwrap_or(0);
            let message = r.str().unwrap_or("request failed").to_string();
            drop(engine);
            pending.fail(ErrorReply {
                kind,
                code,
                message,
            });
            return Ok(());
        }

        match (verb, pending) {
            (
                pattern::MSG_GROUP_JOIN,
                Pending::GroupJoin {
                    group_name,
                    user_name,
                    user_relay,
                    reply,
                },
            ) => {
                let group_id = r.i32()?;
                let _group_flags = r.i32()?;
                let user_id = r.i32()?;
                let _user_flags = r.i32()?;
                let group_metadata = read_metadata(r)?;
                let user_metadata = read_metadata(r)?;
                let private_metadata = read_metadata(r)?;
                let server_relay_host = read_host(r).unwrap_or_default();

                // assemble the relay list in descending priority: our
                // own relay, the server-provided group relay, finally
                // the server itself (when it relays)
                let mut relay_list = Vec::new();
                if user_relay.is_valid() {
                    relay_list.extend(resolve_host(&user_relay));
                }
                if server_relay_host.is_valid() {
                    if user_relay.is_valid() && user_relay != server_relay_host {
                        log::warn!(
                            "group {group_name}: also using server group relay \
                             {server_relay_host} after locally configured {user_relay}"
                        );
                    }
                    relay_list.extend(resolve_host(&server_relay_host));
                }
                if let Session::Connected {
                    server_relay: true,
                    server_addr,
                    ..
                } = &engine.session
                {
                    relay_list.push(*server_addr);
                }

                engine.memberships.push(Membership {
                    group_id,
                    user_id,
                    group_name: group_name.clone(),
                    relay_list,
                });
                drop(engine);
                log::info!("client: joined group {group_name} ({group_id}) as {user_name} ({user_id})");
                reply(Ok(Response::GroupJoin {
                    group_id,
                    user_id,
                    group_metadata,
                    user_metadata,
                    private_metadata,
                }));
                Ok(())
            }
            (pattern::MSG_GROUP_LEAVE, Pending::GroupLeave { group, reply }) => {
                engine.memberships.retain(|m| m.group_id != group);
                drop(engine);
                // remove all peers of that group
                let removed = self.remove_peers_of_group(group);
                for peer in removed {
                    let _ = self.events.0.send(ClientEvent::PeerLeave(peer));
                }
                log::info!("client: left group {group}");
                reply(Ok(Response::GroupLeave));
                Ok(())
            }
            (pattern::MSG_GROUP_UPDATE, Pending::GroupUpdate { reply }) => {
                let metadata = read_metadata(r)?;
                drop(engine);
                reply(Ok(Response::GroupUpdate { metadata }));
                Ok(())
            }
            (pattern::MSG_USER_UPDATE, Pending::UserUpdate { reply, .. }) => {
                let metadata = read_metadata(r)?;
                drop(engine);
                reply(Ok(Response::UserUpdate { metadata }));
                Ok(())
            }
            (pattern::MSG_REQUEST, Pending::Custom { reply }) => {
                let flags = r.i32()?;
                let data = read_metadata(r)?;
                drop(engine);
                reply(Ok(Response::Custom { data, flags }));
                Ok(())
            }
            (_, pending) => {
                drop(engine);
                pending.fail(ErrorReply::new(AooError::BadFormat));
                Err(AooError::BadFormat)
            }
        }
    }

    // /aoo/client/peer/join <gname> <gid> <uname> <uid> <version>
    //     <flags> <n_addr> <addr>* <md> <relay>
    fn handle_peer_add(&self, r: &mut OscReader) -> Result<(), AooError> {
        let group_name = r.str()?.to_string();
        let group_id = r.i32()?;
        let user_name = r.str()?.to_string();
        let user_id = r.i32()?;
        let _version = r.i32()?;
        let _flags = r.i32()?;
        let addr_count = r.i32()?;
        let local_addr = self.reactor.local_addr();
        let mut addresses = Vec::new();
        for _ in 0..addr_count {
            let addr = aoo_wire::read_addr(r)?;
            if aoo_wire::is_ipv4_mapped(&addr) {
                log::warn!("client: ignoring IPv4-mapped peer address {addr}");
                continue;
            }
            // don't accidentally ping ourselves
            if Some(addr) == local_addr {
                continue;
            }
            addresses.push(addr);
        }
        let metadata = read_metadata(r)?;
        let relay = read_host(r).unwrap_or_default();

        let mut engine = self.engine.lock();
        let Some(membership) = engine
            .memberships
            .iter_mut()
            .find(|m| m.group_id == group_id)
        else {
            log::error!("client: peer for group {group_name}, but we are not a member");
            return Err(AooError::NotGroupMember);
        };
        let local_user_id = membership.user_id;

        // the peer's own relay joins the group relay list
        let user_relay: Vec<SocketAddr> = if relay.is_valid() {
            let resolved = resolve_host(&relay);
            membership.relay_list.extend(resolved.iter().copied());
            resolved
        } else {
            Vec::new()
        };
        let group_relay = membership.relay_list.clone();
        drop(engine);

        let mut peers = self.peers.write();
        if peers
            .iter()
            .any(|p| p.group_id() == group_id && p.user_id() == user_id)
        {
            log::error!("client: peer {group_id}|{user_id} already in the roster");
            return Ok(());
        }
        let peer = Peer::new(
            group_name.clone(),
            group_id,
            user_name.clone(),
            user_id,
            local_user_id,
            metadata,
            addresses,
            user_relay,
            group_relay,
        );
        let id = peer.peer_id();
        peers.push(peer);
        drop(peers);

        let _ = self
            .events
            .0
            .send(ClientEvent::PeerHandshake(id, group_name, user_name));
        Ok(())
    }

    // /aoo/client/peer/leave <gid> <uid>
    fn handle_peer_remove(&self, r: &mut OscReader) -> Result<(), AooError> {
        let group = r.i32()?;
        let user = r.i32()?;
        let id = PeerId { group, user };

        let mut peers = self.peers.write();
        let Some(index) = peers.iter().position(|p| p.peer_id() == id) else {
            log::error!("client: cannot remove unknown peer {id}");
            return Err(AooError::NotFound);
        };
        let peer = peers.remove(index);

        // warn if another peer depends on a relay this one provided
        for relay in peer.user_relay() {
            for other in peers.iter() {
                if other.relay_active() && other.relay_address() == Some(*relay) {
                    let _ = self.events.0.send(ClientEvent::Error(ErrorReply::with_message(
                        AooError::NotConnected,
                        format!(
                            "peer {} used a relay provided by {}; the connection may stop working",
                            other.peer_id(),
                            id
                        ),
                    )));
                }
            }
        }
        drop(peers);

        let mut engine = self.engine.lock();
        if let Some(membership) = engine.memberships.iter_mut().find(|m| m.group_id == group) {
            membership
                .relay_list
                .retain(|addr| !peer.user_relay().contains(addr));
        }
        drop(engine);

        // only peers whose handshake completed got a join event
        if peer.connected() {
            let _ = self.events.0.send(ClientEvent::PeerLeave(id));
        }
        log::debug!("client: peer {id} left");
        Ok(())
    }

    fn handle_peer_changed(&self, r: &mut OscReader) -> Result<(), AooError> {
        let group = r.i32()?;
        let user = r.i32()?;
        let metadata = read_metadata(r)?;
        let id = PeerId { group, user };
        let mut peers = self.peers.write();
        if let Some(peer) = peers.iter_mut().find(|p| p.peer_id() == id) {
            peer.set_metadata(metadata.clone());
            drop(peers);
            let _ = self.events.0.send(ClientEvent::PeerUpdate(id, metadata));
            Ok(())
        } else {
            Err(AooError::NotFound)
        }
    }

    fn handle_group_changed(&self, r: &mut OscReader) -> Result<(), AooError> {
        let group = r.i32()?;
        let user = r.i32()?;
        let metadata = read_metadata(r)?;
        let _ = self
            .events
            .0
            .send(ClientEvent::GroupUpdate(group, user, metadata));
        Ok(())
    }

    fn handle_user_changed(&self, r: &mut OscReader) -> Result<(), AooError> {
        let group = r.i32()?;
        let user = r.i32()?;
        let metadata = read_metadata(r)?;
        let _ = self
            .events
            .0
            .send(ClientEvent::UserUpdate(group, user, metadata));
        Ok(())
    }

    // /aoo/client/group/eject <gid>
    fn handle_group_eject(&self, r: &mut OscReader) -> Result<(), AooError> {
        let group = r.i32()?;
        let removed = self.remove_peers_of_group(group);
        for peer in removed {
            let _ = self.events.0.send(ClientEvent::PeerLeave(peer));
        }
        let mut engine = self.engine.lock();
        engine.memberships.retain(|m| m.group_id != group);
        drop(engine);
        let _ = self.events.0.send(ClientEvent::GroupEject(group));
        log::info!("client: ejected from group {group}");
        Ok(())
    }

    //--------------------------- helpers ----------------------------//

    fn remove_peers_of_group(&self, group: Id) -> Vec<PeerId> {
        let mut peers = self.peers.write();
        let mut removed = Vec::new();
        peers.retain(|p| {
            if p.group_id() == group {
                if p.connected() {
                    removed.push(p.peer_id());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    fn send_server_packet(&self, engine: &mut Engine, packet: &[u8]) {
        let link = match &mut engine.session {
            Session::Connecting { link, .. } | Session::Connected { link, .. } => link,
            _ => return,
        };
        if let Err(e) = link.send_packet(packet) {
            log::error!("client: server send failed: {e}");
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Tears the session down: clears peers and memberships, fails
    /// pending requests and (unless the close was requested) emits a
    /// disconnect event.
    fn close(&self, error: Option<ErrorReply>) {
        let mut engine = self.engine.lock();
        let was_connected = !matches!(engine.session, Session::Disconnected);
        let session = core::mem::replace(&mut engine.session, Session::Disconnected);
        let pending: Vec<Pending> = engine.pending.drain().map(|(_, p)| p).collect();
        engine.memberships.clear();
        drop(engine);
        self.set_state(SessionState::Disconnected);

        if let Session::Handshake { mut conn, .. } | Session::Connecting { mut conn, .. } =
            session
        {
            if let Some(reply) = conn.reply.take() {
                reply(Err(error
                    .clone()
                    .unwrap_or_else(|| ErrorReply::new(AooError::NotConnected))));
            }
        }
        for p in pending {
            p.fail(ErrorReply::new(AooError::NotConnected));
        }
        self.peers.write().clear();

        if was_connected {
            if let Some(error) = error {
                let _ = self.events.0.send(ClientEvent::Disconnected(error));
            }
        }
    }
}

impl Engine {
    fn make_token(&mut self) -> Id {
        let token = self.next_token;
        self.next_token += 1;
        token
    }
}

/// Resolves a relay host pair to socket addresses; failures yield an
/// empty list (and a log line) rather than an error, since relays are
/// optional.
fn resolve_host(host: &HostName) -> Vec<SocketAddr> {
    match (host.name.as_str(), host.port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            log::warn!("could not resolve relay {host}: {e}");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Duty {
    Session,
    Peers,
}
