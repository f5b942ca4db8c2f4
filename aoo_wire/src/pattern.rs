//! OSC address pattern vocabulary and the ingress pattern parser.
//!
//! Only the first few bytes of a datagram are inspected to classify it;
//! foreign traffic is rejected before any argument decoding happens.

use crate::{binmsg, Id, WireError};

pub const DOMAIN: &str = "/aoo";

// type words
pub const TYPE_SOURCE: &str = "/src";
pub const TYPE_SINK: &str = "/sink";
pub const TYPE_SERVER: &str = "/server";
pub const TYPE_CLIENT: &str = "/client";
pub const TYPE_PEER: &str = "/peer";
pub const TYPE_RELAY: &str = "/relay";

// verbs
pub const MSG_PING: &str = "/ping";
pub const MSG_PONG: &str = "/pong";
pub const MSG_LOGIN: &str = "/login";
pub const MSG_QUERY: &str = "/query";
pub const MSG_MESSAGE: &str = "/msg";
pub const MSG_ACK: &str = "/ack";
pub const MSG_DATA: &str = "/data";
pub const MSG_FORMAT: &str = "/format";
pub const MSG_CODEC_CHANGE: &str = "/codecchange";
pub const MSG_INVITE: &str = "/invite";
pub const MSG_UNINVITE: &str = "/uninvite";
pub const MSG_GROUP_JOIN: &str = "/group/join";
pub const MSG_GROUP_LEAVE: &str = "/group/leave";
pub const MSG_GROUP_EJECT: &str = "/group/eject";
pub const MSG_GROUP_UPDATE: &str = "/group/update";
pub const MSG_GROUP_CHANGED: &str = "/group/changed";
pub const MSG_USER_UPDATE: &str = "/user/update";
pub const MSG_USER_CHANGED: &str = "/user/changed";
pub const MSG_PEER_JOIN: &str = "/peer/join";
pub const MSG_PEER_LEAVE: &str = "/peer/leave";
pub const MSG_PEER_CHANGED: &str = "/peer/changed";
pub const MSG_REQUEST: &str = "/request";

/// Compact single-frame stream data pattern (outside the `/aoo` domain).
pub const COMPACT_DATA: &str = "/d";

/// Fully assembled peer patterns.
pub const PEER_PING: &str = "/aoo/peer/ping";
pub const PEER_PONG: &str = "/aoo/peer/pong";
pub const PEER_MESSAGE: &str = "/aoo/peer/msg";
pub const PEER_ACK: &str = "/aoo/peer/ack";
pub const RELAY: &str = "/aoo/relay";

/// Fully assembled server-bound patterns.
pub const SERVER_LOGIN: &str = "/aoo/server/login";
pub const SERVER_QUERY: &str = "/aoo/server/query";
pub const SERVER_PING: &str = "/aoo/server/ping";
pub const SERVER_GROUP_JOIN: &str = "/aoo/server/group/join";
pub const SERVER_GROUP_LEAVE: &str = "/aoo/server/group/leave";
pub const SERVER_GROUP_UPDATE: &str = "/aoo/server/group/update";
pub const SERVER_USER_UPDATE: &str = "/aoo/server/user/update";
pub const SERVER_REQUEST: &str = "/aoo/server/request";

/// Fully assembled client-bound patterns.
pub const CLIENT_LOGIN: &str = "/aoo/client/login";
pub const CLIENT_QUERY: &str = "/aoo/client/query";
pub const CLIENT_PONG: &str = "/aoo/client/pong";
pub const CLIENT_MESSAGE: &str = "/aoo/client/msg";
pub const CLIENT_GROUP_JOIN: &str = "/aoo/client/group/join";
pub const CLIENT_GROUP_LEAVE: &str = "/aoo/client/group/leave";
pub const CLIENT_GROUP_EJECT: &str = "/aoo/client/group/eject";
pub const CLIENT_GROUP_UPDATE: &str = "/aoo/client/group/update";
pub const CLIENT_GROUP_CHANGED: &str = "/aoo/client/group/changed";
pub const CLIENT_USER_UPDATE: &str = "/aoo/client/user/update";
pub const CLIENT_USER_CHANGED: &str = "/aoo/client/user/changed";
pub const CLIENT_PEER_JOIN: &str = "/aoo/client/peer/join";
pub const CLIENT_PEER_LEAVE: &str = "/aoo/client/peer/leave";
pub const CLIENT_PEER_CHANGED: &str = "/aoo/client/peer/changed";
pub const CLIENT_REQUEST: &str = "/aoo/client/request";

/// The id part of a stream address pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternId {
    /// No id in the pattern (control-plane messages).
    None,
    /// Explicit numeric id.
    Id(Id),
    /// `/*` wildcard: addressed to every entity of the type.
    Any,
}

/// Result of classifying an incoming datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPattern {
    pub msg_type: binmsg::MsgType,
    pub id: PatternId,
    /// Byte offset of the verb within the address pattern (or of the
    /// payload for binary messages).
    pub onset: usize,
}

#[inline]
fn strip<'a>(s: &'a [u8], prefix: &str) -> Option<&'a [u8]> {
    s.strip_prefix(prefix.as_bytes())
}

fn parse_id(rem: &[u8]) -> Option<(PatternId, usize)> {
    let rem = rem.strip_prefix(b"/")?;
    if rem.first() == Some(&b'*') {
        return Some((PatternId::Any, 2));
    }
    let len = rem.iter().take_while(|b| b.is_ascii_digit()).count();
    if len == 0 {
        return None;
    }
    let id: Id = core::str::from_utf8(&rem[..len]).ok()?.parse().ok()?;
    Some((PatternId::Id(id), len + 1))
}

/// Classifies a datagram by its leading bytes.
///
/// Binary messages are recognised by the domain bit; OSC messages by the
/// `/aoo` prefix (or the compact `/d` special case, which is treated as
/// sink traffic with the id resolved later from the salt argument).
pub fn parse(data: &[u8]) -> Result<ParsedPattern, WireError> {
    use binmsg::MsgType;

    if binmsg::is_binary(data) {
        let header = binmsg::read_header(data)?;
        return Ok(ParsedPattern {
            msg_type: header.msg_type,
            id: PatternId::None,
            onset: header.size,
        });
    }

    // NB: match on raw bytes; the pattern's trailing NUL padding is part
    // of the datagram, so `data` is not a str.
    if let Some(rem) = strip(data, COMPACT_DATA) {
        if rem.first() == Some(&0) {
            return Ok(ParsedPattern {
                msg_type: MsgType::Sink,
                id: PatternId::None,
                onset: COMPACT_DATA.len(),
            });
        }
    }

    let rem = strip(data, DOMAIN).ok_or(WireError::BadFormat)?;
    let mut onset = DOMAIN.len();

    let with_id = |msg_type, rem: &[u8], onset: usize| {
        let (id, n) = parse_id(rem).ok_or(WireError::BadFormat)?;
        Ok(ParsedPattern {
            msg_type,
            id,
            onset: onset + n,
        })
    };

    if let Some(rem) = strip(rem, TYPE_SOURCE) {
        with_id(MsgType::Source, rem, onset + TYPE_SOURCE.len())
    } else if let Some(rem) = strip(rem, TYPE_SINK) {
        with_id(MsgType::Sink, rem, onset + TYPE_SINK.len())
    } else if strip(rem, TYPE_SERVER).is_some() {
        onset += TYPE_SERVER.len();
        Ok(ParsedPattern {
            msg_type: MsgType::Server,
            id: PatternId::None,
            onset,
        })
    } else if strip(rem, TYPE_CLIENT).is_some() {
        onset += TYPE_CLIENT.len();
        Ok(ParsedPattern {
            msg_type: MsgType::Client,
            id: PatternId::None,
            onset,
        })
    } else if strip(rem, TYPE_PEER).is_some() {
        onset += TYPE_PEER.len();
        Ok(ParsedPattern {
            msg_type: MsgType::Peer,
            id: PatternId::None,
            onset,
        })
    } else if strip(rem, TYPE_RELAY).is_some() {
        onset += TYPE_RELAY.len();
        Ok(ParsedPattern {
            msg_type: MsgType::Relay,
            id: PatternId::None,
            onset,
        })
    } else {
        Err(WireError::BadFormat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binmsg::MsgType;

    fn osc_bytes(pattern: &str) -> Vec<u8> {
        let mut buf = [0u8; 128];
        let w = crate::osc::OscWriter::new(&mut buf, pattern, "").unwrap();
        w.finish().to_vec()
    }

    #[test]
    fn classify_control_patterns() {
        for (pattern, msg_type, verb) in [
            ("/aoo/server/login", MsgType::Server, "/login"),
            ("/aoo/client/peer/join", MsgType::Client, "/peer/join"),
            ("/aoo/peer/ping", MsgType::Peer, "/ping"),
            ("/aoo/relay", MsgType::Relay, ""),
        ] {
            let data = osc_bytes(pattern);
            let parsed = parse(&data).unwrap();
            assert_eq!(parsed.msg_type, msg_type, "{pattern}");
            assert_eq!(parsed.id, PatternId::None);
            assert_eq!(&pattern[parsed.onset..], verb);
        }
    }

    #[test]
    fn classify_stream_patterns() {
        let data = osc_bytes("/aoo/sink/42/data");
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Sink);
        assert_eq!(parsed.id, PatternId::Id(42));
        assert_eq!(&"/aoo/sink/42/data"[parsed.onset..], "/data");

        let data = osc_bytes("/aoo/src/7/ping");
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Source);
        assert_eq!(parsed.id, PatternId::Id(7));

        let data = osc_bytes("/aoo/sink/*/format");
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.id, PatternId::Any);
    }

    #[test]
    fn classify_compact_data() {
        let data = osc_bytes("/d");
        let parsed = parse(&data).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Sink);
        assert_eq!(parsed.onset, 2);
    }

    #[test]
    fn reject_foreign_traffic() {
        assert!(parse(b"/syfala/whatever\0\0").is_err());
        assert!(parse(b"/aoo/bogus\0\0").is_err());
        assert!(parse(b"/aoo/sink/x/data\0").is_err());
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn classify_binary() {
        let mut buf = [0u8; 16];
        let n = crate::binmsg::write_header_to_from(
            &mut buf,
            MsgType::Peer,
            crate::binmsg::CMD_MESSAGE,
            1,
            2,
        )
        .unwrap();
        let parsed = parse(&buf[..n]).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Peer);
        assert_eq!(parsed.onset, n);
    }
}
