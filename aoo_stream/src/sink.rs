//! The receiver-side stream engine.
//!
//! Incoming fragments are reassembled per source in a bounded, ordered
//! block queue. Complete (or given-up) blocks are decoded on the network
//! thread into an SPSC ring; the audio callback drains the ring through
//! the dynamic resampler, driven by each block's momentary sample rate
//! against the DLL estimate of the local clock, and sums the result into
//! the host buffer at the source's channel onset.

use crate::block::{AckList, BlockQueue};
use crate::codec::{CodecRegistry, Decoder, Format};
use crate::event::{SinkEvent, StreamState};
use crate::resample::DynamicResampler;
use crate::timing::{TimeDll, Timer, TimerResult};
use crate::{DataPacket, Endpoint, SendFn};

use aoo_utils::{block_ring, BlockRingRx, BlockRingTx, Latch, Tally};
use aoo_wire::osc::{OscReader, OscWriter};
use aoo_wire::time::NtpTime;
use aoo_wire::{pattern, AooError, Id, WireError, MAX_PACKET_SIZE};

use atomic_float::AtomicF64;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};

use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::net::SocketAddr;

/// Extra block-queue slots beyond the audio buffer, absorbing network
/// jitter at small buffer sizes.
const QUEUE_EXTRA_CAPACITY: usize = 8;

/// Don't schedule retransmissions while the queue holds fewer blocks
/// than this; mild reordering would otherwise trigger spurious requests.
const RESEND_CHECK_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Setup {
    samplerate: i32,
    blocksize: i32,
    nchannels: i32,
}

/// Per-block sidecar info travelling next to the sample ring.
#[derive(Debug, Clone, Copy)]
struct BlockInfo {
    samplerate: f64,
    channel: i32,
}

/// Audio-thread half of a per-source stream generation.
struct AudioSide {
    block_rx: BlockRingRx,
    info_rx: rtrb::Consumer<BlockInfo>,
    resampler: DynamicResampler,
    channel: i32,
    samplerate: f64,
    read_buf: Vec<f32>,
}

/// Network-thread half of a per-source stream generation.
struct NetSide {
    decoder: Box<dyn Decoder>,
    queue: BlockQueue,
    acks: AckList,
    block_tx: BlockRingTx,
    info_tx: rtrb::Producer<BlockInfo>,
    /// Highest sequence seen.
    newest: i32,
    /// Next sequence to deliver; -1 until the first packet.
    next: i32,
    /// Sequence to fade in, or -1.
    fadein: i32,
    channel: i32,
    samplerate: f64,
    decode_buf: Vec<f32>,
    /// `(sequence, frame)` pairs scheduled for retransmission
    /// (`frame == -1` requests the whole block).
    resend: Vec<(i32, i32)>,
}

struct Stream {
    format: Format,
    audio: Mutex<AudioSide>,
    net: Mutex<NetSide>,
}

/// Per-source state, independent of the stream generation.
struct SourceDesc {
    ep: Endpoint,
    salt: AtomicI32,
    stream: RwLock<Option<Stream>>,
    protocol_flags: AtomicU8,

    lost: Tally,
    reordered: Tally,
    resent: Tally,
    gap: Tally,
    lost_since_ping: Tally,
    underrun: Latch,
    recover: Latch,
    format_request: Latch,
    /// 0 = stopped, 1 = playing.
    stream_state: AtomicI32,
    /// 0 = none, 1 = invite, 2 = uninvite.
    invite: AtomicI32,
    ping: Mutex<Option<(NtpTime, NtpTime)>>,
    codec_request: Mutex<Option<Format>>,
}

impl SourceDesc {
    fn new(ep: Endpoint) -> Self {
        Self {
            ep,
            salt: AtomicI32::new(aoo_wire::INVALID_ID),
            stream: RwLock::new(None),
            protocol_flags: AtomicU8::new(0),
            lost: Tally::new(),
            reordered: Tally::new(),
            resent: Tally::new(),
            gap: Tally::new(),
            lost_since_ping: Tally::new(),
            underrun: Latch::new(),
            recover: Latch::new(),
            format_request: Latch::new(),
            stream_state: AtomicI32::new(0),
            invite: AtomicI32::new(0),
            ping: Mutex::new(None),
            codec_request: Mutex::new(None),
        }
    }

    fn add_lost(&self, n: i32) {
        if n > 0 {
            self.lost.add(n);
            self.lost_since_ping.add(n);
        }
    }

    /// Updates the observed play state; returns `true` on an edge.
    fn update_state(&self, playing: bool) -> bool {
        self.stream_state.swap(playing as i32, Ordering::AcqRel) != playing as i32
    }
}

/// The receiver engine. One instance per local sink; it multiplexes any
/// number of remote sources.
pub struct Sink {
    id: AtomicI32,
    registry: CodecRegistry,
    setup: RwLock<Option<Setup>>,
    sources: RwLock<Vec<std::sync::Arc<SourceDesc>>>,
    timing: Mutex<(Timer, TimeDll)>,
    real_samplerate: AtomicF64,
    elapsed: AtomicF64,
    events: (Sender<SinkEvent>, Receiver<SinkEvent>),

    // options
    buffersize_ms: AtomicI32,
    packetsize: AtomicUsize,
    resend_limit: AtomicI32,
    resend_interval_ms: AtomicI32,
    resend_max_frames: AtomicI32,
    protocol_flags: AtomicU8,
    dynamic_resampling: AtomicBool,
    bandwidth: AtomicF64,
}

impl Sink {
    pub fn new(id: Id, registry: CodecRegistry) -> Self {
        Self {
            id: AtomicI32::new(id),
            registry,
            setup: RwLock::new(None),
            sources: RwLock::new(Vec::new()),
            timing: Mutex::new((Timer::default(), TimeDll::default())),
            real_samplerate: AtomicF64::new(0.0),
            elapsed: AtomicF64::new(0.0),
            events: crossbeam_channel::unbounded(),
            buffersize_ms: AtomicI32::new(crate::DEFAULT_SINK_BUFFER_MS),
            packetsize: AtomicUsize::new(crate::DEFAULT_PACKET_SIZE),
            resend_limit: AtomicI32::new(crate::DEFAULT_RESEND_LIMIT),
            resend_interval_ms: AtomicI32::new(crate::DEFAULT_RESEND_INTERVAL_MS),
            resend_max_frames: AtomicI32::new(crate::DEFAULT_RESEND_MAX_FRAMES),
            protocol_flags: AtomicU8::new(aoo_wire::PROTOCOL_FLAG_COMPACT_DATA),
            dynamic_resampling: AtomicBool::new(true),
            bandwidth: AtomicF64::new(crate::DEFAULT_TIMEFILTER_BANDWIDTH),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> Id {
        self.id.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Receiver<SinkEvent> {
        self.events.1.clone()
    }

    /// Configures the host-side audio parameters; resets all sources.
    pub fn setup(&self, samplerate: i32, blocksize: i32, nchannels: i32) -> Result<(), AooError> {
        if samplerate <= 0 || blocksize <= 0 || nchannels <= 0 {
            return Err(AooError::BadArgument);
        }
        *self.setup.write() = Some(Setup {
            samplerate,
            blocksize,
            nchannels,
        });
        self.timing.lock().0.setup(samplerate, blocksize);
        // existing streams must be rebuilt against the new block size
        for desc in self.sources.read().iter() {
            desc.format_request.set();
            *desc.stream.write() = None;
        }
        Ok(())
    }

    //----------------------- source access --------------------------//

    fn find_source(&self, ep: Endpoint) -> Option<std::sync::Arc<SourceDesc>> {
        self.sources.read().iter().find(|s| s.ep == ep).cloned()
    }

    fn find_source_by_salt(
        &self,
        addr: SocketAddr,
        salt: Id,
    ) -> Option<std::sync::Arc<SourceDesc>> {
        self.sources
            .read()
            .iter()
            .find(|s| s.ep.addr == addr && s.salt.load(Ordering::Relaxed) == salt)
            .cloned()
    }

    fn add_source(&self, ep: Endpoint) -> std::sync::Arc<SourceDesc> {
        let desc = std::sync::Arc::new(SourceDesc::new(ep));
        self.sources.write().push(desc.clone());
        let _ = self.events.0.send(SinkEvent::SourceAdded(ep));
        log::debug!("sink {}: added source {ep}", self.id());
        desc
    }

    pub fn remove_source(&self, ep: Endpoint) -> Result<(), AooError> {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|s| s.ep != ep);
        (sources.len() != before)
            .then_some(())
            .ok_or(AooError::NotFound)
    }

    /// Asks a source to start sending to us.
    pub fn invite(&self, ep: Endpoint) {
        let desc = self
            .find_source(ep)
            .unwrap_or_else(|| self.add_source(ep));
        desc.invite.store(1, Ordering::Release);
    }

    pub fn uninvite(&self, ep: Endpoint) -> Result<(), AooError> {
        let desc = self.find_source(ep).ok_or(AooError::NotFound)?;
        desc.invite.store(2, Ordering::Release);
        Ok(())
    }

    pub fn uninvite_all(&self) {
        for desc in self.sources.read().iter() {
            desc.invite.store(2, Ordering::Release);
        }
    }

    /// Asks a source to switch to the given codec/format.
    pub fn request_codec_change(&self, ep: Endpoint, format: Format) -> Result<(), AooError> {
        format.validate()?;
        let desc = self.find_source(ep).ok_or(AooError::NotFound)?;
        *desc.codec_request.lock() = Some(format);
        Ok(())
    }

    /// Current fill ratio (0..1) of a source's audio buffer.
    pub fn buffer_fill_ratio(&self, ep: Endpoint) -> Result<f32, AooError> {
        let desc = self.find_source(ep).ok_or(AooError::NotFound)?;
        let guard = desc.stream.read();
        let Some(stream) = guard.as_ref() else {
            return Ok(0.0);
        };
        let audio = stream.audio.lock();
        let capacity = audio.block_rx.capacity_blocks();
        if capacity == 0 {
            return Ok(0.0);
        }
        Ok(audio.block_rx.blocks_readable() as f32 / capacity as f32)
    }

    /// Format of a source, if known.
    pub fn source_format(&self, ep: Endpoint) -> Option<Format> {
        let desc = self.find_source(ep)?;
        let guard = desc.stream.read();
        guard.as_ref().map(|s| s.format.clone())
    }

    //------------------------- options ------------------------------//

    pub fn set_buffersize_ms(&self, ms: i32) {
        self.buffersize_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn set_packetsize(&self, size: usize) {
        let clamped = size.clamp(crate::MIN_PACKET_SIZE, MAX_PACKET_SIZE);
        self.packetsize.store(clamped, Ordering::Relaxed);
    }

    pub fn set_resend_limit(&self, limit: i32) {
        self.resend_limit.store(limit.max(0), Ordering::Relaxed);
    }

    pub fn set_resend_interval_ms(&self, ms: i32) {
        self.resend_interval_ms.store(ms.max(0), Ordering::Relaxed);
    }

    pub fn set_resend_max_frames(&self, n: i32) {
        self.resend_max_frames.store(n.max(1), Ordering::Relaxed);
    }

    pub fn set_dynamic_resampling(&self, enabled: bool) {
        self.dynamic_resampling.store(enabled, Ordering::Relaxed);
    }

    //--------------------- message handling -------------------------//

    /// Handles a datagram addressed to this sink.
    pub fn handle_message(&self, data: &[u8], from: SocketAddr) -> Result<(), AooError> {
        if self.setup.read().is_none() {
            return Err(AooError::BadArgument); // not set up yet
        }
        let parsed = pattern::parse(data)?;
        if parsed.msg_type != aoo_wire::binmsg::MsgType::Sink {
            return Err(AooError::BadFormat);
        }

        let mut r = OscReader::parse(data)?;
        if r.pattern() == pattern::COMPACT_DATA {
            return self.handle_compact_data(&mut r, from);
        }

        match parsed.id {
            pattern::PatternId::Id(id) if id == self.id() => {}
            pattern::PatternId::Any => {}
            _ => return Err(AooError::BadArgument),
        }
        let verb = &r.pattern()[parsed.onset..];
        match verb {
            pattern::MSG_FORMAT => self.handle_format(&mut r, from),
            pattern::MSG_DATA => self.handle_data_message(&mut r, from),
            pattern::MSG_PING => self.handle_ping(&mut r, from),
            _ => {
                log::warn!("sink {}: unknown message {verb}", self.id());
                Err(AooError::NotImplemented)
            }
        }
    }

    // /aoo/sink/<id>/format <src> <version> <salt> <nchannels>
    //     <samplerate> <blocksize> <codec> <options>
    fn handle_format(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let id = r.i32()?;
        let version = r.i32()? as u32;
        if !aoo_wire::check_version(version) {
            log::error!("sink {}: source version not supported", self.id());
            return Err(AooError::BadArgument);
        }
        let salt = r.i32()?;
        let format = Format {
            nchannels: r.i32()?,
            samplerate: r.i32()?,
            blocksize: r.i32()?,
            codec: r.str()?.to_string(),
            options: r.blob()?.to_vec(),
        };
        if id < 0 {
            return Err(AooError::BadArgument);
        }
        let ep = Endpoint { addr: from, id };
        let desc = self
            .find_source(ep)
            .unwrap_or_else(|| self.add_source(ep));
        desc.protocol_flags
            .store(aoo_wire::version_flags(version), Ordering::Relaxed);

        let setup = (*self.setup.read()).ok_or(AooError::BadArgument)?;
        let codec = self
            .registry
            .find(&format.codec)
            .ok_or_else(|| {
                log::error!("sink {}: codec '{}' not supported", self.id(), format.codec);
                AooError::NotFound
            })?;
        let decoder = codec.make_decoder(&format)?;

        let stream = self.make_stream(&setup, format.clone(), decoder);
        *desc.stream.write() = Some(stream);
        desc.salt.store(salt, Ordering::Relaxed);
        desc.recover.set();
        desc.underrun.take();

        let _ = self.events.0.send(SinkEvent::Format(ep, format));
        Ok(())
    }

    fn make_stream(&self, setup: &Setup, format: Format, decoder: Box<dyn Decoder>) -> Stream {
        let block_samples = format.block_samples();
        let buffersize_ms = self.buffersize_ms.load(Ordering::Relaxed);
        let bufsize =
            ((buffersize_ms as f64 * 1e-3 * format.samplerate as f64) as i32).max(setup.blocksize);
        let nbuffers = (bufsize as usize).div_ceil(format.blocksize as usize).max(1);

        let (mut block_tx, block_rx) =
            block_ring(NonZeroUsize::new(block_samples).unwrap(), nbuffers);
        let (mut info_tx, info_rx) = rtrb::RingBuffer::new(nbuffers);

        // start with a full buffer of silence so the resampler has
        // material from the first callback on
        while block_tx.blocks_writable() > 0 && info_tx.slots() > 0 {
            block_tx.write_silence();
            let _ = info_tx.push(BlockInfo {
                samplerate: format.samplerate as f64,
                channel: 0,
            });
        }

        let mut resampler = DynamicResampler::default();
        resampler.setup(
            format.blocksize as usize,
            setup.blocksize as usize,
            format.nchannels as usize,
        );
        resampler.update_rates(format.samplerate as f64, setup.samplerate as f64);

        let mut queue = BlockQueue::default();
        queue.resize(nbuffers + QUEUE_EXTRA_CAPACITY);

        let mut acks = AckList::default();
        acks.configure(
            self.resend_limit.load(Ordering::Relaxed),
            self.resend_interval_ms.load(Ordering::Relaxed) as f64 * 1e-3,
        );

        log::debug!(
            "sink {}: stream with {nbuffers} buffers ({} samples each)",
            self.id(),
            block_samples
        );

        Stream {
            audio: Mutex::new(AudioSide {
                block_rx,
                info_rx,
                resampler,
                channel: 0,
                samplerate: format.samplerate as f64,
                read_buf: vec![0.0; (setup.blocksize * format.nchannels) as usize],
            }),
            net: Mutex::new(NetSide {
                decoder,
                queue,
                acks,
                block_tx,
                info_tx,
                newest: 0,
                next: -1,
                fadein: 0,
                channel: 0,
                samplerate: format.samplerate as f64,
                decode_buf: vec![0.0; block_samples],
                resend: Vec::new(),
            }),
            format,
        }
    }

    // /aoo/sink/<id>/data <src> <salt> <seq> <sr> <channel> <totalsize>
    //     <nframes> <frame> <data>
    fn handle_data_message(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let id = r.i32()?;
        let salt = r.i32()?;
        let packet = DataPacket {
            sequence: r.i32()?,
            samplerate: r.f64()?,
            channel: r.i32()?,
            total_size: r.i32()?,
            num_frames: r.i32()?,
            frame: r.i32()?,
            data: r.blob()?,
        };
        if id < 0 {
            return Err(AooError::BadArgument);
        }
        let ep = Endpoint { addr: from, id };
        match self.find_source(ep) {
            Some(desc) => self.handle_data(&desc, salt, packet),
            None => {
                // unknown source: add it and ask for its format
                let desc = self.add_source(ep);
                desc.format_request.set();
                Ok(())
            }
        }
    }

    // /d <salt> <seq> [<sr>] <data>
    fn handle_compact_data(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let salt = r.i32()?;
        let sequence = r.i32()?;
        let samplerate = if r.remaining() > 1 { r.f64()? } else { 0.0 };
        let data = r.blob()?;
        let Some(desc) = self.find_source_by_salt(from, salt) else {
            // can't identify the source yet; a regular data or format
            // message will establish it
            return Ok(());
        };
        let packet = DataPacket {
            sequence,
            samplerate,
            channel: -1,
            total_size: data.len() as i32,
            num_frames: 1,
            frame: 0,
            data,
        };
        self.handle_data(&desc, salt, packet)
    }

    fn handle_data(
        &self,
        desc: &SourceDesc,
        salt: Id,
        packet: DataPacket,
    ) -> Result<(), AooError> {
        if salt != desc.salt.load(Ordering::Relaxed) {
            // the format changed behind our back (dropped format
            // message); ask for it again and drop the packet
            desc.format_request.set();
            return Ok(());
        }
        let guard = desc.stream.read();
        let Some(stream) = guard.as_ref() else {
            desc.format_request.set();
            return Ok(());
        };
        // basic sanity limits before touching any state
        if packet.num_frames < 0
            || packet.num_frames as usize > aoo_wire::MAX_FRAME_COUNT
            || packet.total_size < 0
            || packet.frame < 0
        {
            return Err(AooError::BadFormat);
        }

        let mut net = stream.net.lock();
        let net = &mut *net;

        if net.next < 0 {
            net.next = packet.sequence;
            net.fadein = net.next;
        }

        if !self.check_packet(desc, net, &stream.format, &packet) {
            return Ok(());
        }
        if !self.add_packet(desc, net, &stream.format, &packet) {
            return Ok(());
        }
        self.process_blocks(desc, net, &stream.format);
        self.check_outdated_blocks(desc, net);
        self.check_missing_blocks(net);
        Ok(())
    }

    /// Pre-insert checks; implements the flush paths. Returns `false`
    /// if the packet must be dropped.
    fn check_packet(
        &self,
        desc: &SourceDesc,
        net: &mut NetSide,
        format: &Format,
        packet: &DataPacket,
    ) -> bool {
        if packet.sequence < net.next {
            // outdated; distinguish resent from plain reordering
            if net.acks.contains(packet.sequence) {
                desc.resent.add(1);
            } else {
                desc.reordered.add(1);
            }
            log::debug!("sink {}: discarded old block {}", self.id(), packet.sequence);
            return false;
        }

        let diff = packet.sequence as i64 - net.newest as i64;
        let large_gap = net.newest > 0 && diff > net.queue.capacity() as i64;
        let recover = desc.recover.take();
        let dropped_block = packet.total_size == 0;
        let underrun = desc.underrun.take();

        if diff < 0 {
            if net.acks.contains(packet.sequence) {
                desc.resent.add(1);
            } else {
                log::debug!("sink {}: block {} out of order", self.id(), packet.sequence);
                desc.reordered.add(1);
            }
        } else {
            if net.newest > 0 && diff > 1 {
                log::debug!("sink {}: skipped {} blocks", self.id(), diff - 1);
            }
            net.newest = packet.sequence;
        }

        if large_gap || recover || dropped_block || underrun {
            desc.add_lost(net.queue.len() as i32);
            if diff > 1 {
                desc.gap.add((diff - 1) as i32);
            }
            net.queue.clear();
            net.acks.clear();
            net.next = packet.sequence;
            let filled = fill_with_silence(net, format);
            if filled > 0 {
                let reason = if large_gap {
                    "transmission gap"
                } else if recover {
                    "sink xrun"
                } else if dropped_block {
                    "source xrun"
                } else {
                    "buffer underrun"
                };
                log::debug!("sink {}: wrote {filled} empty blocks ({reason})", self.id());
                net.fadein = net.next;
            }
            if dropped_block {
                net.next += 1;
                net.fadein = net.next;
                return false;
            }
        }
        true
    }

    /// Inserts the fragment, evicting the oldest block when the queue is
    /// full. Returns `false` if the fragment was dropped.
    fn add_packet(
        &self,
        desc: &SourceDesc,
        net: &mut NetSide,
        format: &Format,
        packet: &DataPacket,
    ) -> bool {
        if net.queue.find(packet.sequence).is_none() {
            if net.queue.is_full() {
                let front = net.queue.front().unwrap();
                let old = front.sequence;
                if old == net.next && front.complete() {
                    // the block about to be read got evicted: genuine
                    // buffer overflow, flush everything
                    desc.add_lost(net.queue.len() as i32);
                    net.queue.clear();
                    net.acks.clear();
                    net.next = packet.sequence;
                    let filled = fill_with_silence(net, format);
                    net.fadein = net.next;
                    log::debug!(
                        "sink {}: buffer overflow, dropped {filled} blocks",
                        self.id()
                    );
                } else {
                    // drop a single old block and substitute silence
                    push_silent_block(net, format);
                    desc.add_lost(1);
                    net.acks.remove(old);
                    net.queue.pop_front();
                    if net.next <= old {
                        net.next = old + 1;
                    }
                    log::debug!("sink {}: dropped block {old} (queue full)", self.id());
                }
            }
            let samplerate = if packet.samplerate > 0.0 {
                packet.samplerate
            } else {
                net.samplerate
            };
            let channel = if packet.channel >= 0 {
                packet.channel
            } else {
                net.channel
            };
            let total = packet.total_size.max(packet.data.len() as i32) as usize;
            net.queue.insert(
                packet.sequence,
                samplerate,
                channel,
                total,
                packet.num_frames.max(1),
            );
        } else if net
            .queue
            .find(packet.sequence)
            .is_some_and(|b| b.has_frame(packet.frame))
        {
            log::debug!(
                "sink {}: frame {} of block {} already received",
                self.id(),
                packet.frame,
                packet.sequence
            );
            return false;
        }

        let block = net.queue.find(packet.sequence).unwrap();
        if !block.add_frame(packet.frame, packet.data) {
            log::warn!(
                "sink {}: malformed fragment {}/{}",
                self.id(),
                packet.sequence,
                packet.frame
            );
            return false;
        }
        if block.complete() {
            net.acks.remove(packet.sequence);
        }
        true
    }

    /// Decodes all consecutive deliverable blocks into the audio ring.
    fn process_blocks(&self, desc: &SourceDesc, net: &mut NetSide, format: &Format) {
        let mut popped = 0usize;
        let mut next = net.next;

        while net.block_tx.blocks_writable() > 0 && net.info_tx.slots() > 0 {
            let fadein;
            enum Deliver {
                Data(usize),
                Silence,
            }
            let action = match net.queue.as_slice().get(popped) {
                Some(block) if block.sequence == next && block.complete() => {
                    fadein = block.sequence == net.fadein;
                    net.samplerate = block.samplerate;
                    net.channel = block.channel;
                    popped += 1;
                    Deliver::Data(popped - 1)
                }
                Some(block) => {
                    if net.acks.get(next).remaining() > 0 {
                        break; // still waiting for retransmission
                    }
                    fadein = false;
                    if block.sequence == next {
                        popped += 1;
                    }
                    log::debug!("sink {}: gave up on block {next}", self.id());
                    desc.add_lost(1);
                    Deliver::Silence
                }
                None => break,
            };

            let block_samples = format.block_samples();
            let decode_result = match action {
                Deliver::Data(index) => {
                    let block = &net.queue.as_slice()[index];
                    net.decoder
                        .decode(Some(block.data()), &mut net.decode_buf[..block_samples])
                }
                Deliver::Silence => net
                    .decoder
                    .decode(None, &mut net.decode_buf[..block_samples]),
            };
            if let Err(e) = decode_result {
                log::warn!("sink {}: decoder failed: {e}", self.id());
                net.decode_buf[..block_samples].fill(0.0);
            }

            if fadein {
                let nchannels = format.nchannels as usize;
                let frames = block_samples / nchannels;
                let delta = 1.0 / frames as f32;
                let mut gain = 0.0f32;
                for frame in net.decode_buf[..block_samples].chunks_exact_mut(nchannels) {
                    for sample in frame {
                        *sample *= gain;
                    }
                    gain += delta;
                }
                net.fadein = -1;
            }

            let ok = net
                .block_tx
                .write_block(net.decode_buf[..block_samples].iter().copied());
            debug_assert!(ok);
            let info = match action {
                Deliver::Data(_) => BlockInfo {
                    samplerate: net.samplerate,
                    channel: net.channel,
                },
                Deliver::Silence => BlockInfo {
                    samplerate: format.samplerate as f64,
                    channel: net.channel,
                },
            };
            let _ = net.info_tx.push(info);

            next += 1;
        }
        net.next = next;

        for _ in 0..popped {
            let sequence = net.queue.front().map(|b| b.sequence);
            if let Some(sequence) = sequence {
                net.acks.remove(sequence);
            }
            net.queue.pop_front();
        }
    }

    /// Pops blocks that fell out of the reassembly window.
    fn check_outdated_blocks(&self, desc: &SourceDesc, net: &mut NetSide) {
        loop {
            let Some(front) = net.queue.front() else {
                break;
            };
            if (net.newest as i64 - front.sequence as i64) < net.queue.capacity() as i64 {
                break;
            }
            let old = front.sequence;
            log::debug!("sink {}: popped outdated block {old}", self.id());
            net.acks.remove(old);
            net.queue.pop_front();
            if net.next <= old {
                net.next = old + 1;
            }
            desc.add_lost(1);
        }
    }

    /// Schedules retransmit requests for missing frames and whole
    /// missing blocks, bounded per tick.
    fn check_missing_blocks(&self, net: &mut NetSide) {
        if net.queue.is_empty() {
            if !net.acks.is_empty() {
                net.acks.clear();
            }
            return;
        }
        if net.queue.len() < RESEND_CHECK_THRESHOLD {
            return;
        }
        let now = self.elapsed.load(Ordering::Relaxed);
        let max_frames = self.resend_max_frames.load(Ordering::Relaxed);
        let mut budget = max_frames;

        // incomplete blocks (except the newest, which may still be
        // arriving)
        let queue_len = net.queue.len();
        'incomplete: for index in 0..queue_len.saturating_sub(1) {
            let block = &net.queue.as_slice()[index];
            if block.complete() {
                continue;
            }
            let sequence = block.sequence;
            let num_frames = block.num_frames();
            let missing: Vec<i32> = (0..num_frames)
                .filter(|&f| !net.queue.as_slice()[index].has_frame(f))
                .collect();
            if net.acks.get(sequence).update(now) {
                for frame in missing {
                    if budget <= 0 {
                        break 'incomplete;
                    }
                    net.resend.push((sequence, frame));
                    budget -= 1;
                }
            }
        }

        // whole blocks missing between `next` and the queued ones
        let mut next = net.next;
        'gaps: for index in 0..net.queue.len() {
            let (sequence, num_frames) = {
                let block = &net.queue.as_slice()[index];
                (block.sequence, block.num_frames())
            };
            let missing = sequence - next;
            for i in 0..missing {
                if net.acks.get(next + i).update(now) {
                    if budget - num_frames < 0 {
                        break 'gaps;
                    }
                    net.resend.push((next + i, -1));
                    budget -= num_frames;
                }
            }
            next = sequence + 1;
        }

        let removed = net.acks.remove_before(net.next);
        if removed > 0 {
            log::trace!("sink {}: gc'd {removed} ack entries", self.id());
        }
    }

    // /aoo/sink/<id>/ping <src> <tt>
    fn handle_ping(&self, r: &mut OscReader, from: SocketAddr) -> Result<(), AooError> {
        let id = r.i32()?;
        let tt1 = r.time()?;
        let ep = Endpoint { addr: from, id };
        let Some(desc) = self.find_source(ep) else {
            log::warn!("sink {}: ping from unknown source {ep}", self.id());
            return Err(AooError::NotFound);
        };
        if desc.stream_state.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let tt2 = NtpTime::now();
        *desc.ping.lock() = Some((tt1, tt2));
        let _ = self.events.0.send(SinkEvent::Ping(ep, tt1, tt2));
        Ok(())
    }

    //------------------------ network thread ------------------------//

    /// Emits pending requests (formats, retransmissions, pings,
    /// invitations). Returns `true` if anything was sent.
    pub fn send(&self, send: SendFn) -> bool {
        let sources: Vec<_> = self.sources.read().clone();
        let mut did = false;
        for desc in &sources {
            did |= self.send_for_source(desc, send);
        }
        did
    }

    fn send_for_source(&self, desc: &SourceDesc, send: SendFn) -> bool {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let mut did = false;
        let ep = desc.ep;

        if desc.format_request.take() {
            if let Ok(len) = write_format_request(
                &mut buf,
                ep,
                self.id(),
                self.protocol_flags.load(Ordering::Relaxed),
            ) {
                send(&buf[..len], ep.addr);
                did = true;
            }
        }

        if let Some(format) = desc.codec_request.lock().take() {
            match crate::source::write_codec_change_message(&mut buf, ep, self.id(), &format) {
                Ok(len) => {
                    send(&buf[..len], ep.addr);
                    did = true;
                }
                Err(e) => log::error!("sink {}: codec change message: {e}", self.id()),
            }
        }

        match desc.invite.swap(0, Ordering::AcqRel) {
            1 => {
                if let Ok(len) = write_invite(&mut buf, ep, self.id(), pattern::MSG_INVITE) {
                    send(&buf[..len], ep.addr);
                    did = true;
                }
            }
            2 => {
                if let Ok(len) = write_invite(&mut buf, ep, self.id(), pattern::MSG_UNINVITE) {
                    send(&buf[..len], ep.addr);
                    did = true;
                }
            }
            _ => {}
        }

        // retransmit requests scheduled by the receive path
        let requests = {
            let guard = desc.stream.read();
            match guard.as_ref() {
                Some(stream) => core::mem::take(&mut stream.net.lock().resend),
                None => Vec::new(),
            }
        };
        if !requests.is_empty() {
            let salt = desc.salt.load(Ordering::Relaxed);
            // each pair costs 8 payload bytes plus 2 tag characters;
            // leave room for the preamble
            let max_pairs = ((self.packetsize.load(Ordering::Relaxed).saturating_sub(64)) / 8)
                .clamp(1, 200);
            for chunk in requests.chunks(max_pairs) {
                match write_data_request(&mut buf, ep, self.id(), salt, chunk) {
                    Ok(len) => {
                        send(&buf[..len], ep.addr);
                        did = true;
                    }
                    Err(e) => log::error!("sink {}: data request: {e}", self.id()),
                }
            }
        }

        if let Some((tt1, tt2)) = desc.ping.lock().take() {
            let lost = desc.lost_since_ping.take();
            match write_ping_reply(&mut buf, ep, self.id(), tt1, tt2, lost) {
                Ok(len) => {
                    send(&buf[..len], ep.addr);
                    did = true;
                }
                Err(e) => log::error!("sink {}: ping reply: {e}", self.id()),
            }
        }
        did
    }

    //------------------------- audio thread -------------------------//

    /// Renders one block of output. `out` holds one slice per channel;
    /// source audio is *summed* into it starting at each stream's
    /// channel onset. Returns `true` if any source produced audio.
    pub fn process(&self, out: &mut [&mut [f32]], nframes: usize, t: NtpTime) -> bool {
        let Some(setup) = *self.setup.read() else {
            return false;
        };
        let nframes = nframes.min(setup.blocksize as usize);
        for channel in out.iter_mut() {
            let n = nframes.min(channel.len());
            channel[..n].fill(0.0);
        }

        let mut need_recover = false;
        {
            let mut timing = self.timing.lock();
            let (timer, dll) = &mut *timing;
            match timer.update(t) {
                TimerResult::Reset => {
                    let bw = self.bandwidth.load(Ordering::Relaxed);
                    dll.setup(setup.samplerate, setup.blocksize, bw, 0.0);
                }
                TimerResult::Xrun(_) => {
                    need_recover = true;
                    timer.reset();
                }
                TimerResult::Ok => {
                    dll.update(timer.elapsed());
                }
            }
            self.elapsed.store(timer.elapsed(), Ordering::Relaxed);

            let nominal = setup.samplerate as f64;
            let estimate = dll.samplerate();
            let ignore = !self.dynamic_resampling.load(Ordering::Relaxed)
                || (estimate - nominal).abs() > 0.1 * nominal;
            self.real_samplerate
                .store(if ignore { nominal } else { estimate }, Ordering::Relaxed);
        }

        let sources: Vec<_> = self.sources.read().clone();
        if need_recover {
            for desc in &sources {
                desc.recover.set();
            }
        }

        let real_rate = self.real_samplerate.load(Ordering::Relaxed);
        let mut did = false;
        for desc in &sources {
            did |= self.process_source(desc, out, nframes, real_rate);
        }
        did
    }

    fn process_source(
        &self,
        desc: &SourceDesc,
        out: &mut [&mut [f32]],
        nframes: usize,
        real_rate: f64,
    ) -> bool {
        // surface accumulated stream statistics
        let lost = desc.lost.take();
        if lost > 0 {
            let _ = self.events.0.send(SinkEvent::BlockLost(desc.ep, lost));
        }
        let reordered = desc.reordered.take();
        if reordered > 0 {
            let _ = self
                .events
                .0
                .send(SinkEvent::BlockReordered(desc.ep, reordered));
        }
        let resent = desc.resent.take();
        if resent > 0 {
            let _ = self.events.0.send(SinkEvent::BlockResent(desc.ep, resent));
        }
        let gap = desc.gap.take();
        if gap > 0 {
            let _ = self.events.0.send(SinkEvent::BlockGap(desc.ep, gap));
        }

        let guard = desc.stream.read();
        let Some(stream) = guard.as_ref() else {
            return false;
        };
        let mut audio = stream.audio.lock();
        let audio = &mut *audio;

        let nchannels = stream.format.nchannels as usize;
        let block_samples = stream.format.block_samples();
        let read_samples = nframes * nchannels;

        while audio.block_rx.blocks_readable() > 0
            && read_samples > audio.resampler.read_available()
            && audio.resampler.write_available() >= block_samples
        {
            if let Ok(info) = audio.info_rx.pop() {
                audio.samplerate = info.samplerate;
                audio.channel = info.channel;
            }
            let resampler = &mut audio.resampler;
            audio.block_rx.read_block(|a, b| {
                resampler.write(a);
                if !b.is_empty() {
                    resampler.write(b);
                }
            });
        }

        audio.resampler.update_rates(audio.samplerate, real_rate);

        if audio.resampler.read_available() >= read_samples {
            let read_buf = &mut audio.read_buf[..read_samples];
            audio.resampler.read(read_buf);

            // sum interleaved -> per-channel host buffers, starting at
            // the stream's channel onset; out-of-range channels are
            // silently ignored
            for i in 0..nchannels {
                let target = i + audio.channel.max(0) as usize;
                let Some(channel) = out.get_mut(target) else {
                    continue;
                };
                for (out_sample, frame) in
                    channel.iter_mut().zip(read_buf.chunks_exact(nchannels))
                {
                    *out_sample += frame[i];
                }
            }

            if desc.update_state(true) {
                let _ = self
                    .events
                    .0
                    .send(SinkEvent::State(desc.ep, StreamState::Playing));
            }
            true
        } else {
            if desc.update_state(false) {
                let _ = self
                    .events
                    .0
                    .send(SinkEvent::State(desc.ep, StreamState::Stopped));
                log::debug!("sink {}: source {} underrun", self.id(), desc.ep);
                desc.underrun.set();
            }
            false
        }
    }
}

/// Pre-fills the audio ring with decoded silence, leaving one block of
/// room; keeps the resampler running across a flush.
fn fill_with_silence(net: &mut NetSide, format: &Format) -> usize {
    let mut count = 0;
    let block_samples = format.block_samples();
    while net.block_tx.blocks_writable() > 1 && net.info_tx.slots() > 1 {
        if net
            .decoder
            .decode(None, &mut net.decode_buf[..block_samples])
            .is_err()
        {
            net.decode_buf[..block_samples].fill(0.0);
        }
        let ok = net
            .block_tx
            .write_block(net.decode_buf[..block_samples].iter().copied());
        debug_assert!(ok);
        let _ = net.info_tx.push(BlockInfo {
            samplerate: format.samplerate as f64,
            channel: net.channel,
        });
        count += 1;
    }
    count
}

/// Pushes one silent block (single-block drop path).
fn push_silent_block(net: &mut NetSide, format: &Format) {
    let block_samples = format.block_samples();
    if net.block_tx.blocks_writable() > 0 && net.info_tx.slots() > 0 {
        if net
            .decoder
            .decode(None, &mut net.decode_buf[..block_samples])
            .is_err()
        {
            net.decode_buf[..block_samples].fill(0.0);
        }
        let _ = net
            .block_tx
            .write_block(net.decode_buf[..block_samples].iter().copied());
        let _ = net.info_tx.push(BlockInfo {
            samplerate: format.samplerate as f64,
            channel: net.channel,
        });
    }
}

//----------------------- message encoding ---------------------------//

// /aoo/src/<id>/format <sink> <version>
fn write_format_request(
    buf: &mut [u8],
    ep: Endpoint,
    sink_id: Id,
    protocol_flags: u8,
) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SOURCE, ep.id, pattern::MSG_FORMAT, "ii")?;
    w.i32(sink_id)?;
    w.i32(aoo_wire::make_version(protocol_flags) as i32)?;
    Ok(w.len())
}

// /aoo/src/<id>/data <sink> <salt> <seq1> <frame1> ...
fn write_data_request(
    buf: &mut [u8],
    ep: Endpoint,
    sink_id: Id,
    salt: Id,
    pairs: &[(i32, i32)],
) -> Result<usize, WireError> {
    let mut tags = arrayvec::ArrayString::<512>::new();
    tags.try_push_str("ii").map_err(|_| WireError::Overflow)?;
    for _ in pairs {
        tags.try_push_str("ii").map_err(|_| WireError::Overflow)?;
    }
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SOURCE, ep.id, pattern::MSG_DATA, &tags)?;
    w.i32(sink_id)?;
    w.i32(salt)?;
    for (sequence, frame) in pairs {
        w.i32(*sequence)?;
        w.i32(*frame)?;
    }
    Ok(w.len())
}

// /aoo/src/<id>/ping <sink> <tt1> <tt2> <lost>
fn write_ping_reply(
    buf: &mut [u8],
    ep: Endpoint,
    sink_id: Id,
    tt1: NtpTime,
    tt2: NtpTime,
    lost: i32,
) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SOURCE, ep.id, pattern::MSG_PING, "itti")?;
    w.i32(sink_id)?;
    w.time(tt1)?;
    w.time(tt2)?;
    w.i32(lost)?;
    Ok(w.len())
}

// /aoo/src/<id>/invite | /uninvite <sink>
fn write_invite(buf: &mut [u8], ep: Endpoint, sink_id: Id, verb: &str) -> Result<usize, WireError> {
    let mut w = OscWriter::with_id(buf, pattern::TYPE_SOURCE, ep.id, verb, "i")?;
    w.i32(sink_id)?;
    Ok(w.len())
}
