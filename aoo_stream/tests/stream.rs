//! End-to-end tests driving a source engine into a sink engine over an
//! in-memory wire, with loss, reordering and retransmission.

use aoo_stream::codec::{CodecRegistry, Format, PcmDepth, PCM_CODEC_NAME};
use aoo_stream::sink::Sink;
use aoo_stream::source::Source;
use aoo_stream::{Endpoint, SinkEvent};
use aoo_wire::time::NtpTime;

use std::net::SocketAddr;

const SR: i32 = 48000;
const BLOCK: i32 = 64;
const CHANNELS: i32 = 2;

fn source_addr() -> SocketAddr {
    "10.0.0.1:9000".parse().unwrap()
}

fn sink_addr() -> SocketAddr {
    "10.0.0.2:9000".parse().unwrap()
}

fn pcm_format() -> Format {
    Format {
        codec: PCM_CODEC_NAME.into(),
        nchannels: CHANNELS,
        samplerate: SR,
        blocksize: BLOCK as i32,
        options: PcmDepth::Float32.to_options(),
    }
}

struct Harness {
    source: Source,
    sink: Sink,
    events: crossbeam_channel::Receiver<SinkEvent>,
    t: f64,
}

impl Harness {
    fn new() -> Self {
        let source = Source::new(1, CodecRegistry::new());
        source.setup(SR, BLOCK, CHANNELS).unwrap();
        source.set_format(pcm_format()).unwrap();
        source
            .add_sink(Endpoint {
                addr: sink_addr(),
                id: 2,
            })
            .unwrap();
        source.start();

        let sink = Sink::new(2, CodecRegistry::new());
        sink.setup(SR, BLOCK, CHANNELS).unwrap();
        let events = sink.events();

        Self {
            source,
            sink,
            events,
            t: 1000.0,
        }
    }

    /// Runs one audio+network tick. `mangle` may reorder or drop the
    /// outgoing source packets. Returns the peak absolute output sample.
    fn tick(&mut self, input: f32, mangle: &mut dyn FnMut(Vec<Vec<u8>>) -> Vec<Vec<u8>>) -> f32 {
        let dt = BLOCK as f64 / SR as f64;
        self.t += dt;
        let t = NtpTime::from_secs(self.t);

        let left = [input; BLOCK as usize];
        let right = [input; BLOCK as usize];
        self.source
            .process(&[&left[..], &right[..]], BLOCK as usize, t);

        // source -> sink
        let mut outgoing: Vec<Vec<u8>> = Vec::new();
        self.source.send(&mut |data, _addr| {
            outgoing.push(data.to_vec());
        });
        for packet in mangle(outgoing) {
            let _ = self.sink.handle_message(&packet, source_addr());
        }

        // sink -> source (format requests, resend requests, pings)
        let mut backward: Vec<Vec<u8>> = Vec::new();
        self.sink.send(&mut |data, _addr| {
            backward.push(data.to_vec());
        });
        for packet in &backward {
            let _ = self.source.handle_message(packet, sink_addr());
        }

        let mut left_out = [0.0f32; BLOCK as usize];
        let mut right_out = [0.0f32; BLOCK as usize];
        self.sink.process(
            &mut [&mut left_out[..], &mut right_out[..]],
            BLOCK as usize,
            t,
        );
        left_out
            .iter()
            .chain(right_out.iter())
            .fold(0.0f32, |m, s| m.max(s.abs()))
    }

    fn drain_events(&self) -> Vec<SinkEvent> {
        self.events.try_iter().collect()
    }
}

fn passthrough(packets: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    packets
}

#[test]
fn stream_reaches_sink() {
    let mut h = Harness::new();
    let mut peak = 0.0f32;
    for _ in 0..600 {
        peak = peak.max(h.tick(0.5, &mut passthrough));
    }
    assert!(peak > 0.4, "no audio came through (peak {peak})");

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SinkEvent::SourceAdded(ep) if ep.id == 1)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SinkEvent::Format(_, f) if f.codec == PCM_CODEC_NAME)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SinkEvent::State(_, aoo_stream::StreamState::Playing))));
    // clean network: nothing lost, nothing resent
    assert!(!events.iter().any(|e| matches!(e, SinkEvent::BlockLost(..))));
    assert!(!events
        .iter()
        .any(|e| matches!(e, SinkEvent::BlockResent(..))));
}

fn is_data_message(packet: &[u8]) -> bool {
    packet.starts_with(b"/aoo/sink/2/data\0") || packet.starts_with(b"/d\0")
}

#[test]
fn lost_blocks_are_recovered_by_retransmission() {
    let mut h = Harness::new();
    // drop the 17th, 18th and 42nd data packets on first transmission;
    // since every tick emits exactly one block, the packet index equals
    // the block sequence
    let drop_set = [17u32, 18, 42];
    let mut data_count = 0u32;
    let mut seen_before = std::collections::HashSet::new();

    for _ in 0..800 {
        h.tick(0.25, &mut |packets| {
            packets
                .into_iter()
                .filter(|p| {
                    if !is_data_message(p) {
                        return true;
                    }
                    if seen_before.insert(p.clone()) {
                        // first copy of this exact datagram
                        let index = data_count;
                        data_count += 1;
                        if drop_set.contains(&index) {
                            return false;
                        }
                    }
                    true
                })
                .collect()
        });
    }

    let events = h.drain_events();
    let resent: i32 = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::BlockResent(_, n) => Some(*n),
            _ => None,
        })
        .sum();
    let lost: i32 = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::BlockLost(_, n) => Some(*n),
            _ => None,
        })
        .sum();
    assert_eq!(lost, 0, "retransmission should have recovered every block");
    assert!(resent >= 3, "expected at least 3 recovered blocks, got {resent}");
}

#[test]
fn reordered_blocks_are_absorbed() {
    let mut h = Harness::new();
    // hold back one data packet for a tick, so its successor overtakes it
    let mut held: Option<Vec<u8>> = None;
    let mut data_count = 0u32;

    for _ in 0..400 {
        h.tick(0.25, &mut |packets| {
            let mut out = Vec::new();
            if let Some(p) = held.take() {
                // release it after the newer packet
                let mut reordered: Vec<Vec<u8>> = Vec::new();
                for q in packets {
                    reordered.push(q);
                }
                reordered.push(p);
                return reordered;
            }
            for p in packets {
                if is_data_message(&p) {
                    data_count += 1;
                    if data_count == 55 {
                        held = Some(p);
                        continue;
                    }
                }
                out.push(p);
            }
            out
        });
    }

    let events = h.drain_events();
    let lost: i32 = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::BlockLost(_, n) => Some(*n),
            _ => None,
        })
        .sum();
    assert_eq!(lost, 0, "a one-packet swap must not lose anything");
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SinkEvent::BlockReordered(..) | SinkEvent::BlockResent(..))),
        "the swap should have been observed"
    );
}

#[test]
fn format_change_bumps_salt_and_resumes() {
    let mut h = Harness::new();
    for _ in 0..300 {
        h.tick(0.5, &mut passthrough);
    }
    let (_, salt_before) = h.source.format().unwrap();

    // double the encoder block size mid-stream
    let mut format = pcm_format();
    format.blocksize = (BLOCK * 2) as i32;
    h.source.set_format(format).unwrap();
    let (_, salt_after) = h.source.format().unwrap();
    assert_ne!(salt_before, salt_after, "salt must change with the format");

    let mut peak = 0.0f32;
    for i in 0..600 {
        let p = h.tick(0.5, &mut passthrough);
        if i > 300 {
            peak = peak.max(p);
        }
    }
    assert!(peak > 0.4, "stream did not resume after format change");

    let formats = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SinkEvent::Format(..)))
        .count();
    assert!(formats >= 2, "expected a second format event");
}

#[test]
fn sender_xrun_recovers_with_empty_blocks() {
    let mut h = Harness::new();
    for _ in 0..300 {
        h.tick(0.5, &mut passthrough);
    }
    // simulate a scheduler stall on the sender
    h.t += 0.25;
    let mut peak = 0.0f32;
    for i in 0..900 {
        let p = h.tick(0.5, &mut passthrough);
        if i > 600 {
            peak = peak.max(p);
        }
    }
    assert!(peak > 0.4, "stream did not survive the sender xrun");
}

#[test]
fn ping_round_trip() {
    let mut h = Harness::new();
    h.source.set_ping_interval_ms(10);
    let source_events = h.source.events();
    for _ in 0..600 {
        h.tick(0.5, &mut passthrough);
    }
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SinkEvent::Ping(..))));
    assert!(source_events
        .try_iter()
        .any(|e| matches!(e, aoo_stream::SourceEvent::PingReply(..))));
}
