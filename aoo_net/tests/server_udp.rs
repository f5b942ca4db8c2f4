//! Server UDP plane: query echo, ping, and relay forwarding.

use aoo_net::peer::{read_relay_packet, write_relay_packet};
use aoo_net::server::Server;
use aoo_wire::binmsg::{self, MsgType};
use aoo_wire::osc::{OscReader, OscWriter};
use aoo_wire::pattern;

use std::net::SocketAddr;

fn collect_replies(
    server: &mut Server,
    data: &[u8],
    from: SocketAddr,
) -> Vec<(Vec<u8>, SocketAddr)> {
    let mut out = Vec::new();
    let _ = server.handle_udp_message(data, from, &mut |d, a| out.push((d.to_vec(), a)));
    out
}

#[test]
fn query_echoes_unmapped_public_address() {
    let mut server = Server::new();
    let mut buf = [0u8; 64];
    let len = OscWriter::new(&mut buf, pattern::SERVER_QUERY, "").unwrap().len();

    // a v4-mapped source must be echoed back as plain IPv4
    let mapped: SocketAddr = "[::ffff:203.0.113.1]:5000".parse().unwrap();
    let replies = collect_replies(&mut server, &buf[..len], mapped);
    assert_eq!(replies.len(), 1);
    let (reply, target) = &replies[0];
    assert_eq!(*target, mapped);

    let mut r = OscReader::parse(reply).unwrap();
    assert_eq!(r.pattern(), pattern::CLIENT_QUERY);
    let public = aoo_wire::read_addr(&mut r).unwrap();
    assert_eq!(public, "203.0.113.1:5000".parse::<SocketAddr>().unwrap());
}

#[test]
fn ping_pongs() {
    let mut server = Server::new();
    let mut buf = [0u8; 64];
    let len = OscWriter::new(&mut buf, pattern::SERVER_PING, "").unwrap().len();
    let from: SocketAddr = "198.51.100.1:6000".parse().unwrap();
    let replies = collect_replies(&mut server, &buf[..len], from);
    assert_eq!(replies.len(), 1);
    let r = OscReader::parse(&replies[0].0).unwrap();
    assert_eq!(r.pattern(), pattern::CLIENT_PONG);
}

#[test]
fn relay_rewrites_source_and_forwards() {
    let mut server = Server::new();

    // an inner binary packet from A, wrapped for B
    let mut inner = [0u8; 16];
    let inner_len =
        binmsg::write_header_to_from(&mut inner, MsgType::Peer, binmsg::CMD_ACK, 1, 2).unwrap();
    let a: SocketAddr = "192.0.2.1:4000".parse().unwrap();
    let b: SocketAddr = "192.0.2.2:4000".parse().unwrap();

    let mut wrapped = [0u8; 64];
    let wrapped_len = write_relay_packet(&mut wrapped, &inner[..inner_len], b).unwrap();

    let replies = collect_replies(&mut server, &wrapped[..wrapped_len], a);
    assert_eq!(replies.len(), 1);
    let (forwarded, target) = &replies[0];
    assert_eq!(*target, b);

    // B unwraps and sees A as the source
    let (source, packet) = read_relay_packet(forwarded).unwrap();
    assert_eq!(source, a);
    assert_eq!(packet, &inner[..inner_len]);
}

#[test]
fn relay_source_is_unmapped_across_families() {
    let mut server = Server::new();
    let mut inner = [0u8; 16];
    let inner_len =
        binmsg::write_header_to_from(&mut inner, MsgType::Peer, binmsg::CMD_ACK, 1, 2).unwrap();
    // A talks to the server over a v4-mapped v6 socket
    let a: SocketAddr = "[::ffff:192.0.2.1]:4000".parse().unwrap();
    let b: SocketAddr = "192.0.2.2:4000".parse().unwrap();

    let mut wrapped = [0u8; 64];
    let wrapped_len = write_relay_packet(&mut wrapped, &inner[..inner_len], b).unwrap();
    let replies = collect_replies(&mut server, &wrapped[..wrapped_len], a);
    assert_eq!(replies.len(), 1);

    let (source, _) = read_relay_packet(&replies[0].0).unwrap();
    assert_eq!(source, "192.0.2.1:4000".parse::<SocketAddr>().unwrap());
}

#[test]
fn relay_can_be_disabled() {
    let mut server = Server::new();
    server.set_allow_relay(false);

    let mut inner = [0u8; 16];
    let inner_len =
        binmsg::write_header_to_from(&mut inner, MsgType::Peer, binmsg::CMD_ACK, 1, 2).unwrap();
    let a: SocketAddr = "192.0.2.1:4000".parse().unwrap();
    let b: SocketAddr = "192.0.2.2:4000".parse().unwrap();
    let mut wrapped = [0u8; 64];
    let wrapped_len = write_relay_packet(&mut wrapped, &inner[..inner_len], b).unwrap();

    // silently dropped
    let replies = collect_replies(&mut server, &wrapped[..wrapped_len], a);
    assert!(replies.is_empty());
}
