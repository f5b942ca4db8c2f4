//! The client-side image of a remote group member and its UDP path.
//!
//! A peer starts in *handshaking* state with the candidate address list
//! advertised by the server. Handshake pings (empty timetag) go to every
//! candidate until one of them answers; the answering address becomes
//! the *real* address, which may differ from every candidate when the
//! peer sits behind a symmetric NAT. If nothing answers within the query
//! timeout, the path falls back to the group relay (if any) and finally
//! gives up with a timeout event.

use crate::reliable::{
    MessageAck, ReceiveBuffer, ReceivedMessage, SendBuffer, SentMessage, MIN_RESEND_INTERVAL,
};
use crate::{ClientEvent, ErrorReply, PeerId};

use aoo_stream::SendFn;
use aoo_wire::binmsg::{self, MsgType};
use aoo_wire::osc::{OscReader, OscWriter};
use aoo_wire::time::NtpTime;
use aoo_wire::{pattern, AooError, Id, Metadata, WireError, MAX_PACKET_SIZE};

use crossbeam_channel::Sender;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// OSC flag: the message wants acknowledgement.
pub const MESSAGE_RELIABLE: i32 = 1;

// binary message flags
const BIN_RELIABLE: u16 = 0x01;
const BIN_FRAMED: u16 = 0x02;
const BIN_TIMESTAMP: u16 = 0x04;

/// Worst-case preamble of an OSC peer message.
const OSC_MESSAGE_HEADER_SIZE: usize = 120;
/// Worst-case preamble of a binary peer message.
const BIN_MESSAGE_HEADER_SIZE: usize = 12 + 28;

/// EWMA coefficient for the RTT average.
const RTT_COEFF: f64 = 0.5;

/// Timing/packet knobs shared by all peers of a client.
#[derive(Debug, Clone, Copy)]
pub struct PeerSettings {
    pub query_interval: Duration,
    pub query_timeout: Duration,
    pub ping_interval: Duration,
    pub packet_size: usize,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            query_interval: Duration::from_millis(crate::QUERY_INTERVAL_MS),
            query_timeout: Duration::from_millis(crate::QUERY_TIMEOUT_MS),
            ping_interval: Duration::from_millis(crate::PING_INTERVAL_MS),
            packet_size: aoo_stream::DEFAULT_PACKET_SIZE,
        }
    }
}

/// An outgoing application message.
#[derive(Debug, Clone)]
pub struct PeerMessage {
    pub data: Metadata,
    pub tt: NtpTime,
    pub reliable: bool,
}

/// Decoded view of a peer message packet (both framings).
struct MessagePacket<'a> {
    dtype: i32,
    tt: NtpTime,
    sequence: i32,
    total_size: i32,
    num_frames: i32,
    frame: i32,
    data: &'a [u8],
    reliable: bool,
}

pub struct Peer {
    group_name: String,
    user_name: String,
    group_id: Id,
    user_id: Id,
    /// Our own user id within the group.
    local_user_id: Id,
    metadata: Option<Metadata>,
    addresses: Vec<SocketAddr>,
    user_relay: Vec<SocketAddr>,
    group_relay: Vec<SocketAddr>,
    real_address: Option<SocketAddr>,
    relay_address: Option<SocketAddr>,
    start_time: Instant,
    last_ping: Option<Instant>,
    ping_tt1: NtpTime,
    got_ping: bool,
    average_rtt: f64,
    connected: AtomicBool,
    timed_out: bool,
    /// Answer with the framing the peer last used.
    prefer_binary: bool,
    next_sequence_reliable: i32,
    next_sequence_unreliable: i32,
    send_buffer: SendBuffer,
    receive_buffer: ReceiveBuffer,
    current_unreliable: ReceivedMessage,
    send_acks: Vec<MessageAck>,
    received_acks: Vec<MessageAck>,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_name: String,
        group_id: Id,
        user_name: String,
        user_id: Id,
        local_user_id: Id,
        metadata: Option<Metadata>,
        addresses: Vec<SocketAddr>,
        user_relay: Vec<SocketAddr>,
        group_relay: Vec<SocketAddr>,
    ) -> Self {
        log::debug!("create peer {group_name}|{user_name} ({group_id}|{user_id})");
        Self {
            group_name,
            user_name,
            group_id,
            user_id,
            local_user_id,
            metadata,
            addresses,
            user_relay,
            group_relay,
            real_address: None,
            relay_address: None,
            start_time: Instant::now(),
            last_ping: None,
            ping_tt1: NtpTime::EMPTY,
            got_ping: false,
            average_rtt: 0.0,
            connected: AtomicBool::new(false),
            timed_out: false,
            prefer_binary: false,
            next_sequence_reliable: 0,
            next_sequence_unreliable: 0,
            send_buffer: SendBuffer::default(),
            receive_buffer: ReceiveBuffer::default(),
            current_unreliable: ReceiveBuffer::scratch(),
            send_acks: Vec::new(),
            received_acks: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn peer_id(&self) -> PeerId {
        PeerId {
            group: self.group_id,
            user: self.user_id,
        }
    }

    #[inline(always)]
    pub fn group_id(&self) -> Id {
        self.group_id
    }

    #[inline(always)]
    pub fn user_id(&self) -> Id {
        self.user_id
    }

    #[inline(always)]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    #[inline(always)]
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    #[inline(always)]
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn set_metadata(&mut self, metadata: Option<Metadata>) {
        self.metadata = metadata;
    }

    #[inline(always)]
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// The address the handshake actually converged on.
    #[inline(always)]
    pub fn address(&self) -> Option<SocketAddr> {
        self.real_address
    }

    #[inline(always)]
    pub fn relay_active(&self) -> bool {
        self.relay_address.is_some()
    }

    #[inline(always)]
    pub fn relay_address(&self) -> Option<SocketAddr> {
        self.relay_address
    }

    #[inline(always)]
    pub fn user_relay(&self) -> &[SocketAddr] {
        &self.user_relay
    }

    #[inline(always)]
    pub fn average_rtt(&self) -> f64 {
        self.average_rtt
    }

    /// True if the (connected) peer answers from this address.
    pub fn match_addr(&self, addr: SocketAddr) -> bool {
        self.connected() && self.real_address == Some(addr)
    }

    //--------------------------- sending ----------------------------//

    /// Periodic driver: handshake probing, pings/pongs, acks and
    /// reliable retransmissions.
    pub fn update(
        &mut self,
        now: Instant,
        settings: &PeerSettings,
        events: &Sender<ClientEvent>,
        send: SendFn,
    ) {
        if self.connected() {
            self.do_send(now, settings, events, send);
        } else if !self.timed_out {
            self.update_handshake(now, settings, events, send);
        }
    }

    fn update_handshake(
        &mut self,
        now: Instant,
        settings: &PeerSettings,
        events: &Sender<ClientEvent>,
        send: SendFn,
    ) {
        let elapsed = now.duration_since(self.start_time);
        if elapsed > settings.query_timeout {
            // try to fall back to a relay before giving up
            if !self.group_relay.is_empty() && self.relay_address.is_none() {
                self.relay_address = Some(self.group_relay[0]);
                self.start_time = now;
                self.last_ping = None;
                log::warn!(
                    "UDP handshake with {} timed out, trying relay {}",
                    self.peer_id(),
                    self.group_relay[0]
                );
                return;
            }
            let what = if self.relay_active() { "relay" } else { "peer-to-peer" };
            log::error!(
                "could not establish UDP {what} connection to {} within {:?}",
                self.peer_id(),
                settings.query_timeout
            );
            let _ = events.send(ClientEvent::Error(ErrorReply::with_message(
                AooError::UdpHandshakeTimeOut,
                format!("could not establish connection with peer {}", self.peer_id()),
            )));
            let _ = events.send(ClientEvent::PeerTimeout(self.peer_id()));
            self.timed_out = true;
            return;
        }

        let due = match self.last_ping {
            Some(t) => now.duration_since(t) >= settings.query_interval,
            None => true,
        };
        if due {
            // handshake pings go to *every* candidate; the group and
            // user ids let the receiver identify us even when our
            // apparent address is none of the advertised ones (symmetric
            // NAT). The empty timetag marks this as a handshake ping.
            let mut buf = [0u8; 64];
            if let Ok(len) =
                write_ping(&mut buf, pattern::PEER_PING, self.group_id, self.local_user_id, &[
                    NtpTime::EMPTY,
                ])
            {
                let addresses: Vec<SocketAddr> = self.addresses.clone();
                for addr in addresses {
                    self.send_to(&buf[..len], addr, send);
                }
            }
            self.last_ping = Some(now);
        }
    }

    fn do_send(
        &mut self,
        now: Instant,
        settings: &PeerSettings,
        events: &Sender<ClientEvent>,
        send: SendFn,
    ) {
        let _ = events;
        // 1) regular ping
        let ping_due = match self.last_ping {
            Some(t) => now.duration_since(t) >= settings.ping_interval,
            None => true,
        };
        if ping_due {
            let mut buf = [0u8; 64];
            if let Ok(len) = write_ping(
                &mut buf,
                pattern::PEER_PING,
                self.group_id,
                self.local_user_id,
                &[NtpTime::now()],
            ) {
                self.send_connected(&buf[..len], send);
            }
            self.last_ping = Some(now);
        }

        // 2) answer pings; both handshake and regular pings are
        // answered, otherwise the handshake may hang on the other side
        if self.got_ping {
            self.got_ping = false;
            let tt1 = self.ping_tt1;
            let (tt1, tt2) = if tt1.is_empty() {
                (NtpTime::EMPTY, NtpTime::EMPTY)
            } else {
                (tt1, NtpTime::now())
            };
            let mut buf = [0u8; 64];
            if let Ok(len) = write_ping(
                &mut buf,
                pattern::PEER_PONG,
                self.group_id,
                self.local_user_id,
                &[tt1, tt2],
            ) {
                self.send_connected(&buf[..len], send);
            }
        }

        // 3) outgoing acknowledgements, in batches
        while !self.send_acks.is_empty() {
            let batch_len = self.send_acks.len().min(32);
            let batch: Vec<MessageAck> = self.send_acks.drain(..batch_len).collect();
            let mut buf = [0u8; 512];
            let result = if self.prefer_binary {
                write_ack_binary(&mut buf, self.group_id, self.local_user_id, &batch)
            } else {
                write_ack_osc(&mut buf, self.group_id, self.local_user_id, &batch)
            };
            if let Ok(len) = result {
                self.send_connected(&buf[..len], send);
            }
        }

        // 4) incoming acknowledgements
        while let Some(ack) = self.received_acks.pop() {
            if let Some(message) = self.send_buffer.find(ack.sequence) {
                if ack.frame >= 0 {
                    message.ack_frame(ack.frame);
                } else {
                    message.ack_all();
                }
            }
        }

        // 5) drop fully acknowledged messages
        self.send_buffer.pop_complete();

        // 6) retransmit what is still missing
        let elapsed = now.duration_since(self.start_time).as_secs_f64();
        let binary = self.prefer_binary;
        let group = self.group_id;
        let local_user = self.local_user_id;
        let mut packets: Vec<Vec<u8>> = Vec::new();
        for message in self.send_buffer.iter_mut() {
            if !message.need_resend(elapsed) {
                continue;
            }
            let frames: Vec<i32> = message.missing_frames().collect();
            for frame in frames {
                let packet = MessagePacket {
                    dtype: message.dtype,
                    tt: message.tt,
                    sequence: message.sequence,
                    total_size: message.data.len() as i32,
                    num_frames: message.num_frames,
                    frame,
                    data: message.frame(frame),
                    reliable: true,
                };
                let mut buf = [0u8; MAX_PACKET_SIZE];
                let result = if binary {
                    write_message_binary(&mut buf, group, local_user, &packet)
                } else {
                    write_message_osc(&mut buf, group, local_user, &packet)
                };
                if let Ok(len) = result {
                    packets.push(buf[..len].to_vec());
                }
            }
        }
        for packet in packets {
            self.send_connected(&packet, send);
        }
    }

    /// Fragments and transmits an application message.
    pub fn send_message(&mut self, message: &PeerMessage, send: SendFn) {
        let binary = self.prefer_binary;
        let header = if binary {
            BIN_MESSAGE_HEADER_SIZE
        } else {
            OSC_MESSAGE_HEADER_SIZE
        };
        let max_fragment = MAX_PACKET_SIZE.min(aoo_stream::DEFAULT_PACKET_SIZE) - header;
        let total = message.data.data.len();
        let num_frames = total.div_ceil(max_fragment).max(1) as i32;
        let frame_size = max_fragment as i32;

        let sequence = if message.reliable {
            let sequence = self.next_sequence_reliable;
            self.next_sequence_reliable += 1;
            // resend after twice the round trip, within sane bounds
            let interval = (self.average_rtt * 2.0).max(MIN_RESEND_INTERVAL);
            self.send_buffer.push(SentMessage::new(
                message.data.data.clone(),
                message.data.dtype,
                message.tt,
                sequence,
                num_frames,
                frame_size,
                interval,
            ));
            sequence
        } else {
            // unreliable messages use their own sequence space
            let sequence = self.next_sequence_unreliable;
            self.next_sequence_unreliable += 1;
            sequence
        };

        for frame in 0..num_frames {
            let onset = frame as usize * max_fragment;
            let end = (onset + max_fragment).min(total);
            let packet = MessagePacket {
                dtype: message.data.dtype,
                tt: message.tt,
                sequence,
                total_size: total as i32,
                num_frames,
                frame,
                data: &message.data.data[onset..end],
                reliable: message.reliable,
            };
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let result = if binary {
                write_message_binary(&mut buf, self.group_id, self.local_user_id, &packet)
            } else {
                write_message_osc(&mut buf, self.group_id, self.local_user_id, &packet)
            };
            match result {
                Ok(len) => {
                    let data = buf[..len].to_vec();
                    self.send_connected(&data, send);
                }
                Err(e) => log::error!("peer {}: message encode: {e}", self.peer_id()),
            }
        }
    }

    /// Sends to the real address; only valid when connected.
    fn send_connected(&self, data: &[u8], send: SendFn) {
        if let Some(addr) = self.real_address {
            self.send_to(data, addr, send);
        }
    }

    /// Sends towards `addr`, wrapping into the relay framing when the
    /// path goes through a relay.
    fn send_to(&self, data: &[u8], addr: SocketAddr, send: SendFn) {
        match self.relay_address {
            Some(relay) => {
                let mut buf = [0u8; MAX_PACKET_SIZE + 32];
                match write_relay_packet(&mut buf, data, addr) {
                    Ok(len) => send(&buf[..len], relay),
                    Err(e) => log::error!("peer {}: relay wrap: {e}", self.peer_id()),
                }
            }
            None => send(data, addr),
        }
    }

    //-------------------------- receiving ---------------------------//

    /// Handles an OSC peer message already matched to this peer.
    /// `verb` is the pattern suffix after `/aoo/peer`; the reader is
    /// positioned after the group and user arguments.
    pub fn handle_osc(
        &mut self,
        verb: &str,
        r: &mut OscReader,
        from: SocketAddr,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        match verb {
            pattern::MSG_PING => self.handle_ping(r, from, events),
            pattern::MSG_PONG => self.handle_pong(r, from, events),
            pattern::MSG_MESSAGE => {
                self.prefer_binary = false;
                self.handle_client_message_osc(r, events)
            }
            pattern::MSG_ACK => {
                let count = r.i32()?;
                for _ in 0..count {
                    let sequence = r.i32()?;
                    let frame = r.i32()?;
                    self.received_acks.push(MessageAck { sequence, frame });
                }
                Ok(())
            }
            _ => {
                log::warn!("peer {}: unknown message {verb}", self.peer_id());
                Err(AooError::NotImplemented)
            }
        }
    }

    /// Handles a binary peer message (payload after the header).
    pub fn handle_binary(
        &mut self,
        cmd: u8,
        payload: &[u8],
        _from: SocketAddr,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        match cmd {
            binmsg::CMD_MESSAGE => {
                self.prefer_binary = true;
                self.handle_client_message_binary(payload, events)
            }
            binmsg::CMD_ACK => {
                if payload.len() < 4 {
                    return Err(AooError::BadFormat);
                }
                let count = i32::from_be_bytes(payload[..4].try_into().unwrap()) as usize;
                let pairs = payload[4..].chunks_exact(8).take(count);
                for pair in pairs {
                    self.received_acks.push(MessageAck {
                        sequence: i32::from_be_bytes(pair[..4].try_into().unwrap()),
                        frame: i32::from_be_bytes(pair[4..].try_into().unwrap()),
                    });
                }
                Ok(())
            }
            _ => Err(AooError::NotImplemented),
        }
    }

    fn handle_first_ping(&mut self, from: SocketAddr, events: &Sender<ClientEvent>) {
        // The observed address may differ from every candidate when the
        // peer is behind a symmetric NAT; the group/user ids in the ping
        // are what actually identified it.
        if !self.addresses.contains(&from) && self.relay_address.is_none() {
            log::warn!("peer {} is behind a symmetric NAT", self.peer_id());
        }
        self.real_address = Some(from);
        self.connected.store(true, Ordering::Release);
        let _ = events.send(ClientEvent::PeerJoin(
            self.peer_id(),
            self.group_name.clone(),
            self.user_name.clone(),
            from,
        ));
        log::info!(
            "established connection with {} at {from}{}",
            self.peer_id(),
            if self.relay_active() { " (relayed)" } else { "" }
        );
    }

    fn handle_ping(
        &mut self,
        r: &mut OscReader,
        from: SocketAddr,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        if !self.connected() {
            self.handle_first_ping(from, events);
        }
        let tt1 = r.time()?;
        // remember for the pong; handshake pings have an empty timetag
        self.ping_tt1 = tt1;
        self.got_ping = true;
        Ok(())
    }

    fn handle_pong(
        &mut self,
        r: &mut OscReader,
        from: SocketAddr,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        if !self.connected() {
            self.handle_first_ping(from, events);
        }
        let tt1 = r.time()?;
        if tt1.is_empty() {
            return Ok(()); // handshake pong
        }
        let _tt2 = r.time()?;
        let tt3 = NtpTime::now();
        let rtt = NtpTime::duration(tt1, tt3);
        if self.average_rtt > 0.0 {
            self.average_rtt = self.average_rtt * RTT_COEFF + rtt * (1.0 - RTT_COEFF);
        } else {
            self.average_rtt = rtt;
        }
        let _ = events.send(ClientEvent::PeerPing {
            peer: self.peer_id(),
            rtt,
            average_rtt: self.average_rtt,
        });
        Ok(())
    }

    fn handle_client_message_osc(
        &mut self,
        r: &mut OscReader,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        let flags = r.i32()?;
        let packet = MessagePacket {
            sequence: r.i32()?,
            total_size: r.i32()?,
            num_frames: r.i32()?,
            frame: r.i32()?,
            tt: r.time()?,
            dtype: r.i32()?,
            data: r.blob()?,
            reliable: flags & MESSAGE_RELIABLE != 0,
        };
        self.dispatch_message(&packet, events)
    }

    fn handle_client_message_binary(
        &mut self,
        payload: &[u8],
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8], AooError> {
            let out = payload.get(*pos..*pos + n).ok_or(AooError::BadFormat)?;
            *pos += n;
            Ok(out)
        };
        let sequence = i32::from_be_bytes(take(&mut pos, 4)?.try_into().unwrap());
        let flags = u16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap());
        let size = u16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap()) as usize;

        let (total_size, num_frames, frame) = if flags & BIN_FRAMED != 0 {
            let total = i32::from_be_bytes(take(&mut pos, 4)?.try_into().unwrap());
            let num_frames = i16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap());
            let frame = i16::from_be_bytes(take(&mut pos, 2)?.try_into().unwrap());
            (total, num_frames as i32, frame as i32)
        } else {
            (size as i32, 1, 0)
        };

        // timestamp and type ride on the first frame only
        let mut tt = NtpTime::EMPTY;
        let mut dtype = aoo_wire::DATA_UNSPECIFIED;
        if frame == 0 {
            if flags & BIN_TIMESTAMP != 0 {
                tt = NtpTime::from_u64(u64::from_be_bytes(
                    take(&mut pos, 8)?.try_into().unwrap(),
                ));
            }
            dtype = i32::from_be_bytes(take(&mut pos, 4)?.try_into().unwrap());
        }

        let data = take(&mut pos, size)?;
        let packet = MessagePacket {
            dtype,
            tt,
            sequence,
            total_size,
            num_frames,
            frame,
            data,
            reliable: flags & BIN_RELIABLE != 0,
        };
        self.dispatch_message(&packet, events)
    }

    fn dispatch_message(
        &mut self,
        packet: &MessagePacket,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        if packet.num_frames <= 0
            || packet.num_frames as usize > aoo_wire::MAX_FRAME_COUNT
            || packet.total_size < 0
        {
            return Err(AooError::BadFormat);
        }
        if packet.reliable {
            self.dispatch_reliable(packet, events)
        } else {
            self.dispatch_unreliable(packet, events)
        }
    }

    fn dispatch_reliable(
        &mut self,
        packet: &MessagePacket,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        let last_pushed = self.receive_buffer.last_pushed();
        let last_popped = self.receive_buffer.last_popped();

        if packet.sequence <= last_popped {
            // outdated duplicate; still acknowledge, the sender clearly
            // missed our previous ack
            self.send_acks.push(MessageAck {
                sequence: packet.sequence,
                frame: packet.frame,
            });
            return Ok(());
        }

        if packet.sequence > last_pushed {
            // fill holes so ordering survives (sequences start at 0)
            let onset = if last_pushed >= 0 { last_pushed + 1 } else { 0 };
            for missing in onset..packet.sequence {
                self.receive_buffer.push(ReceivedMessage::placeholder(missing));
            }
            let message = self
                .receive_buffer
                .push(ReceivedMessage::placeholder(packet.sequence));
            message.init(packet.num_frames, packet.total_size as usize);
            if !message.add_frame(packet.frame, packet.data) {
                return Err(AooError::BadFormat);
            }
            if packet.frame == 0 {
                message.set_info(packet.dtype, packet.tt);
            }
        } else if let Some(message) = self.receive_buffer.find(packet.sequence) {
            if !message.initialized() {
                message.init(packet.num_frames, packet.total_size as usize);
            }
            if !message.has_frame(packet.frame) {
                if !message.add_frame(packet.frame, packet.data) {
                    return Err(AooError::BadFormat);
                }
                if packet.frame == 0 {
                    message.set_info(packet.dtype, packet.tt);
                }
            }
        } else {
            log::error!(
                "peer {}: no buffer slot for message {}",
                self.peer_id(),
                packet.sequence
            );
        }

        // deliver complete messages in strict order
        while self.receive_buffer.front().is_some_and(ReceivedMessage::complete) {
            let message = self.receive_buffer.pop_front().unwrap();
            let _ = events.send(ClientEvent::PeerMessage {
                peer: self.peer_id(),
                tt: message.tt,
                data: Metadata::new(message.dtype, message.data().to_vec()),
            });
        }

        self.send_acks.push(MessageAck {
            sequence: packet.sequence,
            frame: packet.frame,
        });
        Ok(())
    }

    fn dispatch_unreliable(
        &mut self,
        packet: &MessagePacket,
        events: &Sender<ClientEvent>,
    ) -> Result<(), AooError> {
        if packet.num_frames > 1 {
            // single scratch slot; a sequence change discards any
            // incomplete previous message
            if self.current_unreliable.sequence != packet.sequence {
                self.current_unreliable = ReceivedMessage::placeholder(packet.sequence);
                self.current_unreliable
                    .init(packet.num_frames, packet.total_size as usize);
            }
            if !self.current_unreliable.add_frame(packet.frame, packet.data) {
                return Err(AooError::BadFormat);
            }
            if packet.frame == 0 {
                self.current_unreliable.set_info(packet.dtype, packet.tt);
            }
            if self.current_unreliable.complete() {
                let _ = events.send(ClientEvent::PeerMessage {
                    peer: self.peer_id(),
                    tt: self.current_unreliable.tt,
                    data: Metadata::new(
                        self.current_unreliable.dtype,
                        self.current_unreliable.data().to_vec(),
                    ),
                });
            }
        } else {
            let _ = events.send(ClientEvent::PeerMessage {
                peer: self.peer_id(),
                tt: packet.tt,
                data: Metadata::new(packet.dtype, packet.data.to_vec()),
            });
        }
        Ok(())
    }
}

//------------------------- wire helpers -----------------------------//

/// `/aoo/peer/ping|pong <group> <user> <tt>...`
fn write_ping(
    buf: &mut [u8],
    pattern: &str,
    group: Id,
    user: Id,
    times: &[NtpTime],
) -> Result<usize, WireError> {
    let tags: &str = match times.len() {
        1 => "iit",
        2 => "iitt",
        _ => return Err(WireError::BadFormat),
    };
    let mut w = OscWriter::new(buf, pattern, tags)?;
    w.i32(group)?;
    w.i32(user)?;
    for t in times {
        w.time(*t)?;
    }
    Ok(w.len())
}

// /aoo/peer/msg <group> <user> <flags> <seq> <total> <nframes> <frame>
//     <tt> <type> <data>
fn write_message_osc(
    buf: &mut [u8],
    group: Id,
    user: Id,
    packet: &MessagePacket,
) -> Result<usize, WireError> {
    let mut w = OscWriter::new(buf, pattern::PEER_MESSAGE, "iiiiiiitib")?;
    w.i32(group)?;
    w.i32(user)?;
    w.i32(if packet.reliable { MESSAGE_RELIABLE } else { 0 })?;
    w.i32(packet.sequence)?;
    w.i32(packet.total_size)?;
    w.i32(packet.num_frames)?;
    w.i32(packet.frame)?;
    w.time(packet.tt)?;
    w.i32(packet.dtype)?;
    w.blob(packet.data)?;
    Ok(w.len())
}

// header (group, user), seq (i32), flags (u16), size (u16),
// [total (i32), nframes (i16), frame (i16)], [tt (u64)], [type (i32)],
// data
fn write_message_binary(
    buf: &mut [u8],
    group: Id,
    user: Id,
    packet: &MessagePacket,
) -> Result<usize, WireError> {
    let mut pos = binmsg::write_header_to_from(buf, MsgType::Peer, binmsg::CMD_MESSAGE, group, user)?;

    let framed = packet.num_frames > 1;
    let timestamped = !packet.tt.is_empty();
    let flags = (packet.reliable as u16 * BIN_RELIABLE)
        | (framed as u16 * BIN_FRAMED)
        | (timestamped as u16 * BIN_TIMESTAMP);

    let mut put = |bytes: &[u8]| -> Result<(), WireError> {
        let end = pos + bytes.len();
        if end > buf.len() {
            return Err(WireError::Overflow);
        }
        buf[pos..end].copy_from_slice(bytes);
        pos = end;
        Ok(())
    };

    put(&packet.sequence.to_be_bytes())?;
    put(&flags.to_be_bytes())?;
    put(&(packet.data.len() as u16).to_be_bytes())?;
    if framed {
        put(&packet.total_size.to_be_bytes())?;
        put(&(packet.num_frames as i16).to_be_bytes())?;
        put(&(packet.frame as i16).to_be_bytes())?;
    }
    if packet.frame == 0 {
        if timestamped {
            put(&packet.tt.as_u64().to_be_bytes())?;
        }
        put(&packet.dtype.to_be_bytes())?;
    }
    put(packet.data)?;
    Ok(pos)
}

// /aoo/peer/ack <group> <user> <count> <seq1> <frame1> ...
fn write_ack_osc(
    buf: &mut [u8],
    group: Id,
    user: Id,
    acks: &[MessageAck],
) -> Result<usize, WireError> {
    let mut tags = arrayvec::ArrayString::<128>::new();
    tags.try_push_str("iii").map_err(|_| WireError::Overflow)?;
    for _ in acks {
        tags.try_push_str("ii").map_err(|_| WireError::Overflow)?;
    }
    let mut w = OscWriter::new(buf, pattern::PEER_ACK, &tags)?;
    w.i32(group)?;
    w.i32(user)?;
    w.i32(acks.len() as i32)?;
    for ack in acks {
        w.i32(ack.sequence)?;
        w.i32(ack.frame)?;
    }
    Ok(w.len())
}

// header, count (i32), pairs
fn write_ack_binary(
    buf: &mut [u8],
    group: Id,
    user: Id,
    acks: &[MessageAck],
) -> Result<usize, WireError> {
    let mut pos = binmsg::write_header_to_from(buf, MsgType::Peer, binmsg::CMD_ACK, group, user)?;
    let needed = 4 + acks.len() * 8;
    if buf.len() - pos < needed {
        return Err(WireError::Overflow);
    }
    buf[pos..pos + 4].copy_from_slice(&(acks.len() as i32).to_be_bytes());
    pos += 4;
    for ack in acks {
        buf[pos..pos + 4].copy_from_slice(&ack.sequence.to_be_bytes());
        buf[pos + 4..pos + 8].copy_from_slice(&ack.frame.to_be_bytes());
        pos += 8;
    }
    Ok(pos)
}

/// Wraps a packet for transmission through a relay: binary packets get
/// the binary relay header, OSC packets the `/aoo/relay` envelope.
pub fn write_relay_packet(
    buf: &mut [u8],
    packet: &[u8],
    destination: SocketAddr,
) -> Result<usize, WireError> {
    let destination = aoo_wire::unmapped(destination);
    if binmsg::is_binary(packet) {
        let onset = binmsg::write_relay_header(buf, destination)?;
        let end = onset + packet.len();
        if end > buf.len() {
            return Err(WireError::Overflow);
        }
        buf[onset..end].copy_from_slice(packet);
        Ok(end)
    } else {
        let mut w = OscWriter::new(buf, pattern::RELAY, "sib")?;
        aoo_wire::write_addr(&mut w, destination)?;
        w.blob(packet)?;
        Ok(w.len())
    }
}

/// Unwraps a relayed packet, yielding the original source address and
/// the inner packet (borrowed for binary, copied for OSC).
pub fn read_relay_packet(data: &[u8]) -> Result<(SocketAddr, Vec<u8>), WireError> {
    if binmsg::is_binary(data) {
        let (addr, onset) = binmsg::read_relay_header(data)?;
        Ok((addr, data[onset..].to_vec()))
    } else {
        let mut r = OscReader::parse(data)?;
        if r.pattern() != pattern::RELAY {
            return Err(WireError::BadFormat);
        }
        let addr = aoo_wire::read_addr(&mut r)?;
        let packet = r.blob()?;
        Ok((addr, packet.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_wrap_round_trip_binary() {
        let mut inner = [0u8; 16];
        let n =
            binmsg::write_header_to_from(&mut inner, MsgType::Peer, binmsg::CMD_ACK, 1, 2).unwrap();
        let destination: SocketAddr = "192.0.2.7:1234".parse().unwrap();
        let mut buf = [0u8; 64];
        let len = write_relay_packet(&mut buf, &inner[..n], destination).unwrap();
        let (addr, packet) = read_relay_packet(&buf[..len]).unwrap();
        assert_eq!(addr, destination);
        assert_eq!(packet, &inner[..n]);
    }

    #[test]
    fn relay_wrap_round_trip_osc() {
        let mut inner_buf = [0u8; 64];
        let inner = {
            let mut w = OscWriter::new(&mut inner_buf, pattern::PEER_PING, "iit").unwrap();
            w.i32(1).unwrap();
            w.i32(2).unwrap();
            w.time(NtpTime::EMPTY).unwrap();
            w.finish().to_vec()
        };
        let destination: SocketAddr = "[2001:db8::5]:9000".parse().unwrap();
        let mut buf = [0u8; 256];
        let len = write_relay_packet(&mut buf, &inner, destination).unwrap();
        let (addr, packet) = read_relay_packet(&buf[..len]).unwrap();
        assert_eq!(addr, destination);
        assert_eq!(packet, inner);
    }

    #[test]
    fn binary_message_round_trip() {
        let payload: Vec<u8> = (0..100).collect();
        let packet = MessagePacket {
            dtype: 7,
            tt: NtpTime::from_u64(0xABCDEF),
            sequence: 3,
            total_size: 100,
            num_frames: 2,
            frame: 0,
            data: &payload[..60],
            reliable: true,
        };
        let mut buf = [0u8; 256];
        let len = write_message_binary(&mut buf, 300, 2, &packet).unwrap();

        // decode through a peer and check the ack/assembly path
        let header = binmsg::read_header(&buf[..len]).unwrap();
        assert_eq!(header.group(), 300);
        assert_eq!(header.user(), 2);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut peer = Peer::new(
            "g".into(),
            300,
            "u".into(),
            2,
            1,
            None,
            vec!["127.0.0.1:1000".parse().unwrap()],
            Vec::new(),
            Vec::new(),
        );
        peer.handle_binary(header.cmd, &buf[header.size..len], "127.0.0.1:1000".parse().unwrap(), &events_tx)
            .unwrap();
        // message not complete yet
        assert!(events_rx.try_recv().is_err());

        let packet2 = MessagePacket {
            dtype: aoo_wire::DATA_UNSPECIFIED,
            tt: NtpTime::EMPTY,
            sequence: 3,
            total_size: 100,
            num_frames: 2,
            frame: 1,
            data: &payload[60..],
            reliable: true,
        };
        let len2 = write_message_binary(&mut buf, 300, 2, &packet2).unwrap();
        let header2 = binmsg::read_header(&buf[..len2]).unwrap();
        peer.handle_binary(header2.cmd, &buf[header2.size..len2], "127.0.0.1:1000".parse().unwrap(), &events_tx)
            .unwrap();

        // sequences 0..2 are placeholders, so delivery waits; but the
        // reassembled message must exist and be complete
        let slot = peer.receive_buffer.find(3).unwrap();
        assert!(slot.complete());
        assert_eq!(slot.data(), &payload[..]);
    }
}
