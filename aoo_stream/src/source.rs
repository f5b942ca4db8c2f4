//! The sender-side stream engine.
//!
//! The audio callback interleaves its input, runs it through the dynamic
//! resampler (ratio `encoder rate / DLL-estimated local rate`) and parks
//! whole encoder blocks in an SPSC ring. The network thread drains the
//! ring, encodes, fragments into packets of `packet_size - header` bytes
//! and pushes every fragment to every attached sink, keeping a copy in
//! the history ring for retransmission.

use crate::block::HistoryBuffer;
use crate::codec::{CodecRegistry, Encoder, Format};
use crate::event::SourceEvent;
use crate::resample::DynamicResampler;
use crate::timing::{TimeDll, Timer, TimerResult};
use crate::{DataPacket, Endpoint, SendFn};

use aoo_utils::{block_ring, BlockRingRx, BlockRingTx, Latch};
use aoo_wire::osc::{OscReader, OscWriter};
use aoo_wire::time::NtpTime;
use aoo_wire::{pattern, AooError, Id, WireError, MAX_PACKET_SIZE};

use atomic_float::AtomicF64;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::net::SocketAddr;

// Rough upper bound of the OSC data message preamble (pattern, tags,
// ids, sequence, rate, sizes); fragment payloads are sized against it.
const DATA_HEADER_SIZE: usize = 80;

/// Number of silent blocks pushed after a fade-out so the remote decoder
/// drains past its lookahead.
const STOP_DRAIN_BLOCKS: i32 = 4;

/// Host-side audio configuration.
#[derive(Debug, Clone, Copy)]
struct Setup {
    samplerate: i32,
    blocksize: i32,
    nchannels: i32,
}

/// State of one attached sink.
struct SinkDesc {
    ep: Endpoint,
    /// Channel onset at the sink.
    channel: AtomicI32,
    format_changed: Latch,
    protocol_flags: std::sync::atomic::AtomicU8,
}

impl SinkDesc {
    fn snapshot(&self) -> SinkSnapshot {
        SinkSnapshot {
            ep: self.ep,
            channel: self.channel.load(Ordering::Relaxed),
            protocol_flags: self.protocol_flags.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy)]
struct SinkSnapshot {
    ep: Endpoint,
    channel: i32,
    protocol_flags: u8,
}

/// Everything owned by the audio callback.
struct AudioSide {
    timer: Timer,
    dll: TimeDll,
    resampler: DynamicResampler,
    block_tx: BlockRingTx,
    rate_tx: rtrb::Producer<f64>,
    interleave_buf: Vec<f32>,
    /// One encoder block, read out of the resampler before ring commit.
    block_scratch: Vec<f32>,
    last_play: bool,
    silent_frames_left: i32,
}

/// Everything owned by the network thread.
struct NetSide {
    encoder: Box<dyn Encoder>,
    history: HistoryBuffer,
    block_rx: BlockRingRx,
    rate_rx: rtrb::Consumer<f64>,
    sequence: i32,
    prev_sent_samplerate: f64,
    block_buf: Vec<f32>,
    encode_buf: Vec<u8>,
}

/// Per-format generation; replaced wholesale on every format change.
struct Stream {
    format: Format,
    salt: Id,
    audio: Mutex<AudioSide>,
    net: Mutex<NetSide>,
}

struct DataRequest {
    ep: Endpoint,
    salt: Id,
    sequence: i32,
    frame: i32,
}

/// The sender engine. One instance per outgoing stream.
pub struct Source {
    id: AtomicI32,
    registry: CodecRegistry,
    setup: RwLock<Option<Setup>>,
    stream: RwLock<Option<Stream>>,
    sinks: RwLock<Vec<SinkDesc>>,

    play: AtomicBool,
    /// Still emitting (play, fading out, or draining silence).
    active: AtomicBool,
    /// Fade-out finished, waiting for the send queue to run dry.
    flushing: AtomicBool,
    dropped: AtomicI32,
    format_changed: Latch,
    last_ping_time: AtomicF64,

    format_requests: (Sender<Endpoint>, Receiver<Endpoint>),
    data_requests: (Sender<DataRequest>, Receiver<DataRequest>),
    events: (Sender<SourceEvent>, Receiver<SourceEvent>),

    // options
    buffersize_ms: AtomicI32,
    packetsize: AtomicUsize,
    resend_buffersize_ms: AtomicI32,
    redundancy: AtomicI32,
    ping_interval_ms: AtomicI32,
    dynamic_resampling: AtomicBool,
    respect_codec_change: AtomicBool,
    bandwidth: AtomicF64,
}

impl Source {
    pub fn new(id: Id, registry: CodecRegistry) -> Self {
        let events = crossbeam_channel::unbounded();
        Self {
            id: AtomicI32::new(id),
            registry,
            setup: RwLock::new(None),
            stream: RwLock::new(None),
            sinks: RwLock::new(Vec::new()),
            play: AtomicBool::new(false),
            active: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            dropped: AtomicI32::new(0),
            format_changed: Latch::new(),
            last_ping_time: AtomicF64::new(-1e9),
            format_requests: crossbeam_channel::unbounded(),
            data_requests: crossbeam_channel::unbounded(),
            events,
            buffersize_ms: AtomicI32::new(crate::DEFAULT_SOURCE_BUFFER_MS),
            packetsize: AtomicUsize::new(crate::DEFAULT_PACKET_SIZE),
            resend_buffersize_ms: AtomicI32::new(crate::DEFAULT_RESEND_BUFFER_MS),
            redundancy: AtomicI32::new(crate::DEFAULT_REDUNDANCY),
            ping_interval_ms: AtomicI32::new(crate::DEFAULT_PING_INTERVAL_MS),
            dynamic_resampling: AtomicBool::new(true),
            respect_codec_change: AtomicBool::new(false),
            bandwidth: AtomicF64::new(crate::DEFAULT_TIMEFILTER_BANDWIDTH),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> Id {
        self.id.load(Ordering::Relaxed)
    }

    /// Receiver for engine events; the host drains it at its own pace.
    pub fn events(&self) -> Receiver<SourceEvent> {
        self.events.1.clone()
    }

    /// Configures the host-side audio parameters. Must be called before
    /// processing; resets the stream.
    pub fn setup(&self, samplerate: i32, blocksize: i32, nchannels: i32) -> Result<(), AooError> {
        if samplerate <= 0 || blocksize <= 0 || nchannels <= 0 {
            return Err(AooError::BadArgument);
        }
        *self.setup.write() = Some(Setup {
            samplerate,
            blocksize,
            nchannels,
        });
        // rebuild the stream against the new host block size
        let format = self.stream.read().as_ref().map(|s| s.format.clone());
        if let Some(format) = format {
            self.set_format(format)?;
        }
        Ok(())
    }

    /// Sets the stream format, assigning a fresh salt and notifying all
    /// sinks.
    pub fn set_format(&self, format: Format) -> Result<(), AooError> {
        format.validate()?;
        let setup = (*self.setup.read()).ok_or(AooError::BadArgument)?;
        let codec = self
            .registry
            .find(&format.codec)
            .ok_or(AooError::NotFound)?;
        let encoder = codec.make_encoder(&format)?;

        let stream = self.make_stream(&setup, format, encoder);
        *self.stream.write() = Some(stream);

        for sink in self.sinks.read().iter() {
            sink.format_changed.set();
        }
        self.format_changed.set();
        self.last_ping_time.store(-1e9, Ordering::Relaxed);
        Ok(())
    }

    fn make_stream(&self, setup: &Setup, format: Format, encoder: Box<dyn Encoder>) -> Stream {
        let block_samples = format.block_samples();
        let buffersize_ms = self.buffersize_ms.load(Ordering::Relaxed);
        let bufsize =
            ((buffersize_ms as f64 * 1e-3 * format.samplerate as f64) as i32).max(setup.blocksize);
        let nbuffers = (bufsize as usize).div_ceil(format.blocksize as usize).max(1);

        let (block_tx, block_rx) = block_ring(
            NonZeroUsize::new(block_samples).unwrap(),
            nbuffers,
        );
        let (rate_tx, rate_rx) = rtrb::RingBuffer::new(nbuffers);

        let mut resampler = DynamicResampler::default();
        resampler.setup(
            setup.blocksize as usize,
            format.blocksize as usize,
            setup.nchannels as usize,
        );
        resampler.update_rates(setup.samplerate as f64, format.samplerate as f64);

        let mut history = HistoryBuffer::default();
        let resend_ms = self.resend_buffersize_ms.load(Ordering::Relaxed);
        let history_blocks = ((resend_ms as f64 * 1e-3 * format.samplerate as f64) as usize)
            .div_ceil(format.blocksize as usize);
        history.resize(history_blocks);

        let mut timer = Timer::default();
        timer.setup(setup.samplerate, setup.blocksize);

        let salt = make_salt();
        log::debug!(
            "source {}: new stream (salt {salt}, {} ch, {} Hz, block {})",
            self.id(),
            format.nchannels,
            format.samplerate,
            format.blocksize
        );

        Stream {
            audio: Mutex::new(AudioSide {
                timer,
                dll: TimeDll::default(),
                resampler,
                block_tx,
                rate_tx,
                interleave_buf: vec![0.0; (setup.blocksize * setup.nchannels) as usize],
                block_scratch: vec![0.0; block_samples],
                last_play: false,
                silent_frames_left: 0,
            }),
            net: Mutex::new(NetSide {
                encoder,
                history,
                block_rx,
                rate_rx,
                sequence: 0,
                prev_sent_samplerate: 0.0,
                block_buf: vec![0.0; block_samples],
                encode_buf: vec![0u8; block_samples * 8],
            }),
            format,
            salt,
        }
    }

    /// Current format and salt, if a stream is configured.
    pub fn format(&self) -> Option<(Format, Id)> {
        self.stream
            .read()
            .as_ref()
            .map(|s| (s.format.clone(), s.salt))
    }

    //---------------------- sink management -------------------------//

    pub fn add_sink(&self, ep: Endpoint) -> Result<(), AooError> {
        let mut sinks = self.sinks.write();
        if sinks.iter().any(|s| s.ep == ep) {
            return Err(AooError::AlreadyExists);
        }
        let desc = SinkDesc {
            ep,
            channel: AtomicI32::new(0),
            format_changed: Latch::new(),
            protocol_flags: std::sync::atomic::AtomicU8::new(0),
        };
        desc.format_changed.set();
        sinks.push(desc);
        self.format_changed.set();
        log::debug!("source {}: added sink {ep}", self.id());
        Ok(())
    }

    pub fn remove_sink(&self, ep: Endpoint) -> Result<(), AooError> {
        let mut sinks = self.sinks.write();
        let before = sinks.len();
        sinks.retain(|s| s.ep != ep);
        if sinks.len() == before {
            return Err(AooError::NotFound);
        }
        log::debug!("source {}: removed sink {ep}", self.id());
        Ok(())
    }

    pub fn remove_all_sinks(&self) {
        self.sinks.write().clear();
    }

    /// Sets the channel onset this sink should be summed in at.
    pub fn set_sink_channel(&self, ep: Endpoint, channel: i32) -> Result<(), AooError> {
        if channel < 0 {
            return Err(AooError::BadArgument);
        }
        let sinks = self.sinks.read();
        let sink = sinks.iter().find(|s| s.ep == ep).ok_or(AooError::NotFound)?;
        sink.channel.store(channel, Ordering::Relaxed);
        Ok(())
    }

    //---------------------- play state ------------------------------//

    /// Starts the stream with a fade-in on the next block.
    pub fn start(&self) {
        self.play.store(true, Ordering::Release);
    }

    /// Stops the stream: linear fade-out over one process block, then a
    /// short silent drain so the remote decoder flushes its lookahead.
    pub fn stop(&self) {
        self.play.store(false, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_playing(&self) -> bool {
        self.play.load(Ordering::Acquire)
    }

    //------------------------- options ------------------------------//

    pub fn set_buffersize_ms(&self, ms: i32) {
        self.buffersize_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn set_packetsize(&self, size: usize) {
        let clamped = size.clamp(crate::MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        if clamped != size {
            log::warn!("source {}: clamping packet size to {clamped}", self.id());
        }
        self.packetsize.store(clamped, Ordering::Relaxed);
    }

    pub fn set_resend_buffersize_ms(&self, ms: i32) {
        self.resend_buffersize_ms.store(ms.max(0), Ordering::Relaxed);
    }

    /// Number of times each frame is emitted (best effort, orthogonal to
    /// retransmission).
    pub fn set_redundancy(&self, n: i32) {
        self.redundancy.store(n.max(1), Ordering::Relaxed);
    }

    pub fn set_ping_interval_ms(&self, ms: i32) {
        self.ping_interval_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn set_dynamic_resampling(&self, enabled: bool) {
        self.dynamic_resampling.store(enabled, Ordering::Relaxed);
    }

    /// When enabled, codec change requests from sinks are applied
    /// instead of only being surfaced as events.
    pub fn set_respect_codec_change(&self, enabled: bool) {
        self.respect_codec_change.store(enabled, Ordering::Relaxed);
    }

    //------------------------- audio thread -------------------------//

    /// Feeds one block of non-interleaved host audio. `t` is the
    /// callback timestamp. Returns `true` while the engine is emitting.
    pub fn process(&self, data: &[&[f32]], nframes: usize, t: NtpTime) -> bool {
        if !self.play.load(Ordering::Acquire) && !self.active.load(Ordering::Acquire) {
            return false;
        }
        let setup = self.setup.read();
        let Some(setup) = *setup else {
            return false;
        };
        let stream = self.stream.read();
        let Some(stream) = stream.as_ref() else {
            return false;
        };
        let mut audio = stream.audio.lock();
        let audio = &mut *audio;

        match audio.timer.update(t) {
            TimerResult::Reset => {
                let bw = self.bandwidth.load(Ordering::Relaxed);
                audio.dll.setup(setup.samplerate, setup.blocksize, bw, 0.0);
            }
            TimerResult::Xrun(error) => {
                let period = setup.blocksize as f64 / setup.samplerate as f64;
                let nblocks = (error / period + 0.5) as i32;
                log::debug!("source {}: skipping {nblocks} blocks after xrun", self.id());
                self.dropped.fetch_add(nblocks, Ordering::AcqRel);
                audio.timer.reset();
            }
            TimerResult::Ok => {
                let elapsed = audio.timer.elapsed();
                audio.dll.update(elapsed);
            }
        }

        let nominal = setup.samplerate as f64;
        let ignore_dll = !self.dynamic_resampling.load(Ordering::Relaxed)
            || (audio.dll.samplerate() - nominal).abs() > 0.1 * nominal;

        let play = self.play.load(Ordering::Acquire);
        let fade_in = play && !audio.last_play;
        let fade_out = !play && audio.last_play;
        audio.last_play = play;

        if fade_out {
            audio.silent_frames_left = STOP_DRAIN_BLOCKS * stream.format.blocksize;
        }
        let pushing_silence = !fade_out && !play && audio.silent_frames_left > 0;

        if play {
            self.active.store(true, Ordering::Release);
        } else if !fade_out && audio.silent_frames_left <= 0 {
            // fade-out and drain both finished; stop once the send side
            // has emptied the queue
            if !self.flushing.swap(true, Ordering::AcqRel) {
                log::debug!("source {}: drained, flushing out", self.id());
            }
            return false;
        }

        // interleave (with fade gain where needed)
        let nchannels = setup.nchannels as usize;
        let frames = nframes.min(setup.blocksize as usize);
        let buf = &mut audio.interleave_buf[..frames * nchannels];
        if frames > 0 && (fade_in || fade_out || pushing_silence) {
            let delta = if fade_out {
                -1.0 / frames as f32
            } else if pushing_silence {
                0.0
            } else {
                1.0 / frames as f32
            };
            for (channel, samples) in data.iter().take(nchannels).enumerate() {
                let mut gain: f32 = if fade_out { 1.0 } else { 0.0 };
                for (j, &sample) in samples.iter().take(frames).enumerate() {
                    buf[j * nchannels + channel] = sample * gain;
                    gain += delta;
                }
            }
        } else {
            for (channel, samples) in data.iter().take(nchannels).enumerate() {
                for (j, &sample) in samples.iter().take(frames).enumerate() {
                    buf[j * nchannels + channel] = sample;
                }
            }
        }

        // run through the resampler, draining whole encoder blocks into
        // the ring as they become ready
        let block_samples = stream.format.block_samples();
        let encoder_rate = stream.format.samplerate as f64;
        let mut remaining = &buf[..];
        loop {
            let writable = audio.resampler.write_available();
            let n = remaining.len().min(writable);
            if n > 0 {
                audio.resampler.write(&remaining[..n]);
                remaining = &remaining[n..];
            }

            let mut consumed = false;
            while audio.resampler.read_available() >= block_samples
                && audio.block_tx.blocks_writable() > 0
                && audio.rate_tx.slots() > 0
            {
                let scratch = &mut audio.block_scratch[..block_samples];
                audio.resampler.read(scratch);
                let ok = audio.block_tx.write_block(scratch.iter().copied());
                debug_assert!(ok);

                let rate = if ignore_dll {
                    encoder_rate
                } else {
                    audio.dll.samplerate() * (encoder_rate / nominal)
                };
                let _ = audio.rate_tx.push(rate);
                consumed = true;
            }

            if remaining.is_empty() {
                break;
            }
            if !consumed && remaining.len() > audio.resampler.write_available() {
                log::debug!("source {}: resampler full, dropping input", self.id());
                break;
            }
        }

        if audio.silent_frames_left > 0 {
            audio.silent_frames_left -= frames as i32;
        }

        true
    }

    //------------------------ network thread ------------------------//

    /// Runs one send tick: formats, fresh blocks, retransmissions and
    /// pings. Returns `true` if anything was sent.
    pub fn send(&self, send: SendFn) -> bool {
        if !self.play.load(Ordering::Acquire) && !self.active.load(Ordering::Acquire) {
            return false;
        }
        let mut did = false;
        did |= self.send_format(send);
        did |= self.send_data(send);
        did |= self.resend_data(send);
        did |= self.send_ping(send);
        did
    }

    fn send_format(&self, send: SendFn) -> bool {
        let format_changed = self.format_changed.take();
        let have_requests = !self.format_requests.1.is_empty();
        if !format_changed && !have_requests {
            return false;
        }
        let stream = self.stream.read();
        let Some(stream) = stream.as_ref() else {
            return false;
        };
        let (format, salt) = (&stream.format, stream.salt);

        let mut targets: Vec<Endpoint> = Vec::new();
        if format_changed {
            for sink in self.sinks.read().iter() {
                if sink.format_changed.take() {
                    targets.push(sink.ep);
                }
            }
        }
        while let Ok(ep) = self.format_requests.1.try_recv() {
            targets.push(ep);
        }

        let mut buf = [0u8; MAX_PACKET_SIZE];
        for ep in &targets {
            match write_format_message(&mut buf, *ep, self.id(), salt, format) {
                Ok(len) => send(&buf[..len], ep.addr),
                Err(e) => log::error!("source {}: format message: {e}", self.id()),
            }
        }
        !targets.is_empty()
    }

    fn send_data(&self, send: SendFn) -> bool {
        let guard = self.stream.read();
        let Some(stream) = guard.as_ref() else {
            return false;
        };
        let salt = stream.salt;
        let mut net_guard = stream.net.lock();
        let net = &mut *net_guard;
        let mut did = false;

        // dropped blocks (xruns) are announced as empty sentinels so the
        // receiver flushes instead of hunting for retransmissions
        while self.dropped.load(Ordering::Acquire) > 0 {
            let sequence = net.next_sequence();
            let packet = DataPacket {
                sequence,
                samplerate: stream.format.samplerate as f64,
                channel: 0,
                total_size: 0,
                num_frames: 0,
                frame: 0,
                data: &[],
            };
            self.send_packet_to_sinks(&packet, salt, false, send);
            self.dropped.fetch_sub(1, Ordering::AcqRel);
            did = true;
        }

        let block_samples = stream.format.block_samples();
        loop {
            if net.block_rx.blocks_readable() == 0 || net.rate_rx.slots() == 0 {
                break;
            }
            let samplerate = net.rate_rx.pop().unwrap_or(stream.format.samplerate as f64);
            {
                let block_buf = &mut net.block_buf[..block_samples];
                let mut filled = 0;
                net.block_rx.read_block(|a, b| {
                    block_buf[..a.len()].copy_from_slice(a);
                    block_buf[a.len()..a.len() + b.len()].copy_from_slice(b);
                    filled = a.len() + b.len();
                });
                debug_assert_eq!(filled, block_samples);
            }

            let sinks: Vec<SinkSnapshot> =
                self.sinks.read().iter().map(SinkDesc::snapshot).collect();

            let total_size = match net
                .encoder
                .encode(&net.block_buf[..block_samples], &mut net.encode_buf)
            {
                Ok(n) if n > 0 => n,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("source {}: encoder failed: {e}", self.id());
                    continue;
                }
            };

            let sequence = net.next_sequence();

            let max_fragment = self
                .packetsize
                .load(Ordering::Relaxed)
                .saturating_sub(DATA_HEADER_SIZE)
                .max(1);
            let num_frames = total_size.div_ceil(max_fragment);

            net.history.push(
                sequence,
                samplerate,
                &net.encode_buf[..total_size],
                num_frames as i32,
                max_fragment as i32,
            );

            if sinks.is_empty() {
                // drain the queue anyway so the rings don't back up
                continue;
            }

            // only send the rate when it moved enough to matter for the
            // compact framing
            let send_rate = (samplerate - net.prev_sent_samplerate).abs() > 0.1;
            if send_rate {
                net.prev_sent_samplerate = samplerate;
            }

            let redundancy = self.redundancy.load(Ordering::Relaxed).max(1);
            for _ in 0..redundancy {
                for frame in 0..num_frames {
                    let onset = frame * max_fragment;
                    let end = (onset + max_fragment).min(total_size);
                    let packet = DataPacket {
                        sequence,
                        samplerate,
                        channel: 0,
                        total_size: total_size as i32,
                        num_frames: num_frames as i32,
                        frame: frame as i32,
                        data: &net.encode_buf[onset..end],
                    };
                    self.send_packet_to_sinks_with(&packet, salt, send_rate, &sinks, send);
                }
            }
            did = true;
        }

        if !did
            && !self.play.load(Ordering::Acquire)
            && self.flushing.load(Ordering::Acquire)
        {
            log::debug!("source {}: finished flushing out", self.id());
            self.active.store(false, Ordering::Release);
            self.flushing.store(false, Ordering::Release);
        }

        // sequence overflow forces a new stream generation
        let wrapped = net.sequence == i32::MAX;
        drop(net_guard);
        drop(guard);
        if wrapped {
            if let Some(stream) = self.stream.write().as_mut() {
                stream.salt = make_salt();
                stream.net.get_mut().sequence = 0;
            }
            self.format_changed.set();
            for sink in self.sinks.read().iter() {
                sink.format_changed.set();
            }
        }

        did
    }

    fn send_packet_to_sinks(&self, packet: &DataPacket, salt: Id, send_rate: bool, send: SendFn) {
        let sinks: Vec<SinkSnapshot> = self.sinks.read().iter().map(SinkDesc::snapshot).collect();
        self.send_packet_to_sinks_with(packet, salt, send_rate, &sinks, send);
    }

    fn send_packet_to_sinks_with(
        &self,
        packet: &DataPacket,
        salt: Id,
        send_rate: bool,
        sinks: &[SinkSnapshot],
        send: SendFn,
    ) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        for sink in sinks {
            let mut packet = *packet;
            packet.channel = sink.channel;
            let compact = packet.num_frames == 1
                && packet.channel == 0
                && sink.protocol_flags & aoo_wire::PROTOCOL_FLAG_COMPACT_DATA != 0;
            let result = if compact {
                write_compact_data_message(&mut buf, salt, &packet, send_rate)
            } else {
                write_data_message(&mut buf, sink.ep, self.id(), salt, &packet)
            };
            match result {
                Ok(len) => send(&buf[..len], sink.ep.addr),
                Err(e) => log::error!("source {}: data message: {e}", self.id()),
            }
        }
    }

    fn resend_data(&self, send: SendFn) -> bool {
        let stream = self.stream.read();
        let Some(stream) = stream.as_ref() else {
            return false;
        };
        let mut did = false;
        let mut buf = [0u8; MAX_PACKET_SIZE];

        while let Ok(request) = self.data_requests.1.try_recv() {
            if request.salt != stream.salt {
                continue; // outdated request
            }
            let net = stream.net.lock();
            let Some(block) = net.history.find(request.sequence) else {
                log::debug!(
                    "source {}: block {} not in history",
                    self.id(),
                    request.sequence
                );
                continue;
            };
            // copy out under the lock, send after release
            let mut fragments: Vec<(i32, Vec<u8>)> = Vec::new();
            let base = DataPacket {
                sequence: block.sequence,
                samplerate: block.samplerate,
                channel: block.channel,
                total_size: block.size() as i32,
                num_frames: block.num_frames(),
                frame: 0,
                data: &[],
            };
            if request.frame < 0 {
                for frame in 0..block.num_frames() {
                    fragments.push((frame, block.frame(frame).to_vec()));
                }
            } else if request.frame < block.num_frames() {
                fragments.push((request.frame, block.frame(request.frame).to_vec()));
            } else {
                log::warn!("source {}: frame {} out of range", self.id(), request.frame);
            }
            drop(net);

            for (frame, data) in &fragments {
                let packet = DataPacket {
                    frame: *frame,
                    data,
                    ..base
                };
                match write_data_message(&mut buf, request.ep, self.id(), request.salt, &packet) {
                    Ok(len) => send(&buf[..len], request.ep.addr),
                    Err(e) => log::error!("source {}: resend message: {e}", self.id()),
                }
                did = true;
            }
        }
        did
    }

    fn send_ping(&self, send: SendFn) -> bool {
        let interval = self.ping_interval_ms.load(Ordering::Relaxed) as f64 * 1e-3;
        if interval <= 0.0 {
            return false;
        }
        let stream = self.stream.read();
        let Some(stream) = stream.as_ref() else {
            return false;
        };
        let (elapsed, tt) = {
            let audio = stream.audio.lock();
            (audio.timer.elapsed(), audio.timer.absolute())
        };
        let last = self.last_ping_time.load(Ordering::Relaxed);
        if elapsed - last < interval {
            return false;
        }
        self.last_ping_time.store(elapsed, Ordering::Relaxed);

        let mut buf = [0u8; 128];
        for sink in self.sinks.read().iter() {
            match write_ping_message(&mut buf, sink.ep, self.id(), tt) {
                Ok(len) => send(&buf[..len], sink.ep.addr),
                Err(e) => log::error!("source {}: ping message: {e}", self.id()),
            }
        }
        true
    }

    //--------------------- message handling -------------------------//

    /// Handles a datagram addressed to this source.
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) -> Result<(), AooError> {
        let parsed = pattern::parse(data)?;
        if parsed.msg_type != aoo_wire::binmsg::MsgType::Source {
            return Err(AooError::BadFormat);
        }
        match parsed.id {
            pattern::PatternId::Id(id) if id == self.id() => {}
            pattern::PatternId::Any => {}
            _ => return Err(AooError::BadArgument),
        }

        let reader = OscReader::parse(data)?;
        let verb = &reader.pattern()[parsed.onset..];
        let mut r = reader;
        match verb {
            pattern::MSG_FORMAT => self.handle_format_request(&mut r, from),
            pattern::MSG_DATA => self.handle_data_request(&mut r, from),
            pattern::MSG_PING => self.handle_ping_reply(&mut r, from),
            pattern::MSG_INVITE => {
                let id = r.i32()?;
                let _ = self
                    .events
                    .0
                    .send(SourceEvent::Invite(Endpoint { addr: from, id }));
                Ok(())
            }
            pattern::MSG_UNINVITE => {
                let id = r.i32()?;
                let _ = self
                    .events
                    .0
                    .send(SourceEvent::Uninvite(Endpoint { addr: from, id }));
                Ok(())
            }
            pattern::MSG_CODEC_CHANGE => self.handle_codec_change(&mut r, from),
            _ => {
                log::warn!("source {}: unknown message {verb}", self.id());
                Err(AooError::NotImplemented)
            }
        }
    }

    fn handle_format_request(
        &self,
        r: &mut OscReader,
        from: SocketAddr,
    ) -> Result<(), AooError> {
        let id = r.i32()?;
        let version = r.i32()? as u32;
        if !aoo_wire::check_version(version) {
            log::error!("source {}: sink version not supported", self.id());
            return Err(AooError::BadArgument);
        }
        let ep = Endpoint { addr: from, id };
        let sinks = self.sinks.read();
        if let Some(sink) = sinks.iter().find(|s| s.ep == ep) {
            sink.protocol_flags
                .store(aoo_wire::version_flags(version), Ordering::Relaxed);
            let _ = self.format_requests.0.send(ep);
            Ok(())
        } else {
            log::warn!("source {}: format request from unknown sink {ep}", self.id());
            Err(AooError::NotFound)
        }
    }

    fn handle_data_request(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let id = r.i32()?;
        let salt = r.i32()?;
        let ep = Endpoint { addr: from, id };
        if !self.sinks.read().iter().any(|s| s.ep == ep) {
            log::warn!("source {}: data request from unknown sink {ep}", self.id());
            return Err(AooError::NotFound);
        }
        while r.remaining() >= 2 {
            let sequence = r.i32()?;
            let frame = r.i32()?;
            let _ = self.data_requests.0.send(DataRequest {
                ep,
                salt,
                sequence,
                frame,
            });
        }
        Ok(())
    }

    fn handle_ping_reply(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let id = r.i32()?;
        let tt1 = r.time()?;
        let tt2 = r.time()?;
        let lost = if r.remaining() > 0 { r.i32()? } else { 0 };
        let tt3 = NtpTime::now();
        let _ = self.events.0.send(SourceEvent::PingReply(
            Endpoint { addr: from, id },
            tt1,
            tt2,
            tt3,
            lost,
        ));
        Ok(())
    }

    fn handle_codec_change(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let id = r.i32()?;
        let nchannels = r.i32()?;
        let samplerate = r.i32()?;
        let blocksize = r.i32()?;
        let codec = r.str()?.to_string();
        let options = r.blob()?.to_vec();
        let format = Format {
            codec,
            nchannels,
            samplerate,
            blocksize,
            options,
        };
        if self.respect_codec_change.load(Ordering::Relaxed) {
            self.set_format(format)
        } else {
            let _ = self.events.0.send(SourceEvent::CodecChangeRequest(
                Endpoint { addr: from, id },
                format,
            ));
            Ok(())
        }
    }
}

impl NetSide {
    #[inline]
    fn next_sequence(&mut self) -> i32 {
        let seq = self.sequence;
        self.sequence = self.sequence.saturating_add(1);
        seq
    }
}

fn make_salt() -> Id {
    rand::thread_rng().gen_range(0..Id::MAX)
}

//----------------------- message encoding ---------------------------//

// /aoo/sink/<id>/format <src> <version> <salt> <nchannels> <samplerate>
//     <blocksize> <codec> <options>
fn write_format_message(
    buf: &mut [u8],
    ep: Endpoint,
    source_id: Id,
    salt: Id,
    format: &Format,
) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SINK, ep.id, pattern::MSG_FORMAT, "iiiiiisb")?;
    w.i32(source_id)?;
    w.i32(aoo_wire::make_version(aoo_wire::PROTOCOL_FLAG_COMPACT_DATA) as i32)?;
    w.i32(salt)?;
    w.i32(format.nchannels)?;
    w.i32(format.samplerate)?;
    w.i32(format.blocksize)?;
    w.str(&format.codec)?;
    w.blob(&format.options)?;
    Ok(w.len())
}

// /aoo/sink/<id>/data <src> <salt> <seq> <sr> <channel> <totalsize>
//     <nframes> <frame> <data>
fn write_data_message(
    buf: &mut [u8],
    ep: Endpoint,
    source_id: Id,
    salt: Id,
    packet: &DataPacket,
) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SINK, ep.id, pattern::MSG_DATA, "iiidiiiib")?;
    w.i32(source_id)?;
    w.i32(salt)?;
    w.i32(packet.sequence)?;
    w.f64(packet.samplerate)?;
    w.i32(packet.channel)?;
    w.i32(packet.total_size)?;
    w.i32(packet.num_frames)?;
    w.i32(packet.frame)?;
    w.blob(packet.data)?;
    Ok(w.len())
}

// /d <salt> <seq> [<sr>] <data>
fn write_compact_data_message(
    buf: &mut [u8],
    salt: Id,
    packet: &DataPacket,
    send_rate: bool,
) -> Result<usize, WireError> {
    let tags = if send_rate { "iidb" } else { "iib" };
    let mut w = OscWriter::new(buf, pattern::COMPACT_DATA, tags)?;
    w.i32(salt)?;
    w.i32(packet.sequence)?;
    if send_rate {
        w.f64(packet.samplerate)?;
    }
    w.blob(packet.data)?;
    Ok(w.len())
}

// /aoo/sink/<id>/ping <src> <tt>
fn write_ping_message(
    buf: &mut [u8],
    ep: Endpoint,
    source_id: Id,
    tt: NtpTime,
) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SINK, ep.id, pattern::MSG_PING, "it")?;
    w.i32(source_id)?;
    w.time(tt)?;
    Ok(w.len())
}

/// Builds a codec change request (sent by sinks, handled by sources).
pub(crate) fn write_codec_change_message(
    buf: &mut [u8],
    ep: Endpoint,
    sink_id: Id,
    format: &Format,
) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(
        buf,
        pattern::TYPE_SOURCE,
        ep.id,
        pattern::MSG_CODEC_CHANGE,
        "iiiisb",
    )?;
    w.i32(sink_id)?;
    w.i32(format.nchannels)?;
    w.i32(format.samplerate)?;
    w.i32(format.blocksize)?;
    w.str(&format.codec)?;
    w.blob(&format.options)?;
    Ok(w.len())
}

