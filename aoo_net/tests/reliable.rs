//! Peer-path tests with a hand-driven wire: reliable delivery across
//! fragment loss, strict ordering, and the relay fallback after a
//! failed direct handshake.

use aoo_net::peer::{Peer, PeerMessage, PeerSettings};
use aoo_net::{ClientEvent, PeerId};
use aoo_wire::osc::OscReader;
use aoo_wire::time::NtpTime;
use aoo_wire::{binmsg, pattern, Metadata};

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

fn addr_a() -> SocketAddr {
    "10.0.0.1:5000".parse().unwrap()
}

fn addr_b() -> SocketAddr {
    "10.0.0.2:5000".parse().unwrap()
}

/// Feeds one datagram into a peer the way the client dispatcher would.
fn dispatch(peer: &mut Peer, data: &[u8], from: SocketAddr, events: &Sender<ClientEvent>) {
    if binmsg::is_binary(data) {
        let header = binmsg::read_header(data).unwrap();
        peer.handle_binary(header.cmd, &data[header.size..], from, events)
            .unwrap();
    } else {
        let parsed = pattern::parse(data).unwrap();
        let mut r = OscReader::parse(data).unwrap();
        let verb = &r.pattern()[parsed.onset..];
        let _group = r.i32().unwrap();
        let _user = r.i32().unwrap();
        peer.handle_osc(verb, &mut r, from, events).unwrap();
    }
}

struct Pair {
    a: Peer,
    b: Peer,
    events_a: (Sender<ClientEvent>, Receiver<ClientEvent>),
    events_b: (Sender<ClientEvent>, Receiver<ClientEvent>),
    settings: PeerSettings,
    now: Instant,
}

impl Pair {
    /// Two peers of group 0; A is user 1, B is user 2.
    fn new() -> Self {
        let a = Peer::new(
            "jam".into(),
            0,
            "bob".into(),
            2,
            1,
            None,
            vec![addr_b()],
            Vec::new(),
            Vec::new(),
        );
        let b = Peer::new(
            "jam".into(),
            0,
            "alice".into(),
            1,
            2,
            None,
            vec![addr_a()],
            Vec::new(),
            Vec::new(),
        );
        Self {
            a,
            b,
            events_a: unbounded(),
            events_b: unbounded(),
            settings: PeerSettings::default(),
            now: Instant::now(),
        }
    }

    /// Runs both peers' periodic updates and exchanges every packet.
    fn pump(&mut self) {
        let mut from_a: Vec<Vec<u8>> = Vec::new();
        self.a.update(self.now, &self.settings, &self.events_a.0, &mut |d, _| {
            from_a.push(d.to_vec())
        });
        for packet in from_a {
            dispatch(&mut self.b, &packet, addr_a(), &self.events_b.0);
        }

        let mut from_b: Vec<Vec<u8>> = Vec::new();
        self.b.update(self.now, &self.settings, &self.events_b.0, &mut |d, _| {
            from_b.push(d.to_vec())
        });
        for packet in from_b {
            dispatch(&mut self.a, &packet, addr_b(), &self.events_a.0);
        }
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    fn handshake(&mut self) {
        for _ in 0..4 {
            self.pump();
            self.advance(Duration::from_millis(150));
        }
        assert!(self.a.connected(), "A did not connect");
        assert!(self.b.connected(), "B did not connect");
        assert_eq!(self.a.address(), Some(addr_b()));
        assert_eq!(self.b.address(), Some(addr_a()));
    }
}

#[test]
fn handshake_converges_and_reports_join() {
    let mut pair = Pair::new();
    pair.handshake();
    assert!(pair
        .events_a
        .1
        .try_iter()
        .any(|e| matches!(e, ClientEvent::PeerJoin(id, ..) if id == PeerId { group: 0, user: 2 })));
    assert!(pair
        .events_b
        .1
        .try_iter()
        .any(|e| matches!(e, ClientEvent::PeerJoin(id, ..) if id == PeerId { group: 0, user: 1 })));
}

#[test]
fn reliable_message_survives_fragment_loss() {
    let mut pair = Pair::new();
    pair.handshake();
    for e in pair.events_b.1.try_iter() {
        drop(e);
    }

    // a 12 KiB message fragments into dozens of packets; drop two of
    // them on first transmission
    let payload: Vec<u8> = (0..12 * 1024).map(|x| (x % 251) as u8).collect();
    let message = PeerMessage {
        data: Metadata::new(42, payload.clone()),
        tt: NtpTime::now(),
        reliable: true,
    };

    let mut packets: Vec<Vec<u8>> = Vec::new();
    pair.a
        .send_message(&message, &mut |d, _| packets.push(d.to_vec()));
    assert!(packets.len() > 10, "expected many fragments");

    for (index, packet) in packets.iter().enumerate() {
        if index == 3 || index == 17 {
            continue; // lost
        }
        dispatch(&mut pair.b, packet, addr_a(), &pair.events_b.0);
    }
    // not deliverable yet
    assert!(pair
        .events_b
        .1
        .try_iter()
        .all(|e| !matches!(e, ClientEvent::PeerMessage { .. })));

    // let acks flow back and the retransmit timer fire
    let mut delivered: Option<Metadata> = None;
    for _ in 0..20 {
        pair.advance(Duration::from_millis(50));
        pair.pump();
        for event in pair.events_b.1.try_iter() {
            if let ClientEvent::PeerMessage { data, .. } = event {
                delivered = Some(data);
            }
        }
        if delivered.is_some() {
            break;
        }
    }
    let delivered = delivered.expect("message was never delivered");
    assert_eq!(delivered.dtype, 42);
    assert_eq!(delivered.data, payload);

    // once everything is acknowledged the sender goes quiet
    for _ in 0..5 {
        pair.advance(Duration::from_secs(2));
        let mut from_a: Vec<Vec<u8>> = Vec::new();
        let now = pair.now;
        pair.a
            .update(now, &pair.settings, &pair.events_a.0, &mut |d, _| {
                from_a.push(d.to_vec())
            });
        for packet in &from_a {
            dispatch(&mut pair.b, packet, addr_a(), &pair.events_b.0);
        }
        let mut from_b: Vec<Vec<u8>> = Vec::new();
        pair.b
            .update(now, &pair.settings, &pair.events_b.0, &mut |d, _| {
                from_b.push(d.to_vec())
            });
        for packet in &from_b {
            dispatch(&mut pair.a, packet, addr_b(), &pair.events_a.0);
        }
        // only pings/pongs may remain on the sender side (B may still
        // flush a last acknowledgement)
        for packet in from_a.iter() {
            if !binmsg::is_binary(packet) {
                let r = OscReader::parse(packet).unwrap();
                assert!(
                    r.pattern() == pattern::PEER_PING || r.pattern() == pattern::PEER_PONG,
                    "unexpected late packet {}",
                    r.pattern()
                );
            }
        }
    }
}

#[test]
fn reliable_messages_deliver_in_send_order() {
    let mut pair = Pair::new();
    pair.handshake();
    for e in pair.events_b.1.try_iter() {
        drop(e);
    }

    // send three messages; withhold the first one's packet until last
    let mut batches: Vec<Vec<Vec<u8>>> = Vec::new();
    for i in 0..3u8 {
        let mut packets = Vec::new();
        pair.a.send_message(
            &PeerMessage {
                data: Metadata::new(1, vec![i; 8]),
                tt: NtpTime::EMPTY,
                reliable: true,
            },
            &mut |d, _| packets.push(d.to_vec()),
        );
        batches.push(packets);
    }

    // deliver 1, 2 first, then 0
    for index in [1usize, 2, 0] {
        for packet in &batches[index] {
            dispatch(&mut pair.b, packet, addr_a(), &pair.events_b.0);
        }
    }

    let received: Vec<u8> = pair
        .events_b
        .1
        .try_iter()
        .filter_map(|e| match e {
            ClientEvent::PeerMessage { data, .. } => Some(data.data[0]),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![0, 1, 2], "strict send order violated");
}

#[test]
fn unreliable_messages_are_fire_and_forget() {
    let mut pair = Pair::new();
    pair.handshake();
    for e in pair.events_b.1.try_iter() {
        drop(e);
    }

    let mut packets = Vec::new();
    pair.a.send_message(
        &PeerMessage {
            data: Metadata::new(5, vec![1, 2, 3]),
            tt: NtpTime::EMPTY,
            reliable: false,
        },
        &mut |d, _| packets.push(d.to_vec()),
    );
    for packet in &packets {
        dispatch(&mut pair.b, packet, addr_a(), &pair.events_b.0);
    }
    assert!(pair
        .events_b
        .1
        .try_iter()
        .any(|e| matches!(e, ClientEvent::PeerMessage { data, .. } if data.data == vec![1, 2, 3])));

    // B never schedules an ack for it
    let mut from_b: Vec<Vec<u8>> = Vec::new();
    let now = pair.now;
    pair.b
        .update(now, &pair.settings, &pair.events_b.0, &mut |d, _| {
            from_b.push(d.to_vec())
        });
    for packet in &from_b {
        if !binmsg::is_binary(packet) {
            let r = OscReader::parse(packet).unwrap();
            assert_ne!(r.pattern(), pattern::PEER_ACK);
        }
    }
}

#[test]
fn handshake_falls_back_to_relay_after_timeout() {
    let relay: SocketAddr = "198.51.100.99:8000".parse().unwrap();
    let (events_tx, events_rx) = unbounded();
    let settings = PeerSettings::default();

    let mut peer = Peer::new(
        "jam".into(),
        0,
        "bob".into(),
        2,
        1,
        None,
        vec![addr_b()],
        Vec::new(),
        vec![relay],
    );

    let mut now = Instant::now();
    let mut sent: Vec<(Vec<u8>, SocketAddr)> = Vec::new();

    // run past the query timeout without any answer
    for _ in 0..60 {
        peer.update(now, &settings, &events_tx, &mut |d, a| {
            sent.push((d.to_vec(), a))
        });
        now += Duration::from_millis(150);
    }
    assert!(peer.relay_active(), "peer should have switched to the relay");
    assert!(!peer.timed_out());

    // handshake pings now travel to the relay, wrapped
    sent.clear();
    peer.update(now, &settings, &events_tx, &mut |d, a| {
        sent.push((d.to_vec(), a))
    });
    assert!(!sent.is_empty());
    for (packet, target) in &sent {
        assert_eq!(*target, relay);
        let r = OscReader::parse(packet).unwrap();
        assert_eq!(r.pattern(), pattern::RELAY);
    }

    // an answer through the relay completes the handshake
    let mut pong = [0u8; 64];
    let len = {
        let mut w =
            aoo_wire::osc::OscWriter::new(&mut pong, pattern::PEER_PONG, "iitt").unwrap();
        w.i32(0).unwrap();
        w.i32(2).unwrap();
        w.time(NtpTime::EMPTY).unwrap();
        w.time(NtpTime::EMPTY).unwrap();
        w.finish().len()
    };
    dispatch(&mut peer, &pong[..len], addr_b(), &events_tx);
    assert!(peer.connected());
    assert!(events_rx
        .try_iter()
        .any(|e| matches!(e, ClientEvent::PeerJoin(..))));

    // if the relay also fails, the peer times out for good
    let (events_tx2, events_rx2) = unbounded();
    let mut peer2 = Peer::new(
        "jam".into(),
        0,
        "bob".into(),
        2,
        1,
        None,
        vec![addr_b()],
        Vec::new(),
        Vec::new(),
    );
    let mut now2 = Instant::now();
    for _ in 0..60 {
        peer2.update(now2, &settings, &events_tx2, &mut |_, _| {});
        now2 += Duration::from_millis(150);
    }
    assert!(peer2.timed_out());
    assert!(events_rx2
        .try_iter()
        .any(|e| matches!(e, ClientEvent::PeerTimeout(id) if id == PeerId { group: 0, user: 2 })));
}
