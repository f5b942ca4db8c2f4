//! Time-varying sample rate conversion.
//!
//! The resampler is a ring of interleaved samples with a fractional read
//! index. The conversion ratio is updated once per block from the pair
//! `(remote rate, DLL-estimated local rate)`, so small clock drift
//! between sender and receiver is absorbed continuously instead of
//! accumulating into under/overruns.

const EXTRA_SPACE: f64 = 2.5;

#[derive(Debug, Default)]
pub struct DynamicResampler {
    buffer: Vec<f32>,
    nchannels: usize,
    /// Fractional read position in frames.
    read_pos: f64,
    /// Write position in samples.
    write_pos: usize,
    /// Number of unread input samples (fractional after reads).
    balance: f64,
    ratio: f64,
}

impl DynamicResampler {
    /// Allocates for converting between block sizes `nfrom` and `nto`
    /// frames, leaving headroom for rate fluctuations.
    pub fn setup(&mut self, nfrom: usize, nto: usize, nchannels: usize) {
        self.nchannels = nchannels;
        let blocksize = nfrom.max(nto);
        self.buffer.clear();
        let samples = ((blocksize * nchannels) as f64 * EXTRA_SPACE) as usize;
        self.buffer.resize(samples, 0.0);
        self.clear();
    }

    pub fn clear(&mut self) {
        self.ratio = 1.0;
        self.read_pos = 0.0;
        self.write_pos = 0;
        self.balance = 0.0;
    }

    /// Updates the output/input rate ratio.
    #[inline]
    pub fn update_rates(&mut self, sr_from: f64, sr_to: f64) {
        self.ratio = if sr_from == sr_to { 1.0 } else { sr_to / sr_from };
    }

    #[inline(always)]
    pub fn write_available(&self) -> usize {
        (self.buffer.len() as f64 - self.balance) as usize
    }

    #[inline(always)]
    pub fn read_available(&self) -> usize {
        (self.balance * self.ratio) as usize
    }

    /// Writes interleaved samples; the caller must not exceed
    /// [`write_available`](Self::write_available).
    pub fn write(&mut self, data: &[f32]) {
        debug_assert!(data.len() <= self.write_available());
        let size = self.buffer.len();
        let split = (size - self.write_pos).min(data.len());
        self.buffer[self.write_pos..self.write_pos + split].copy_from_slice(&data[..split]);
        self.buffer[..data.len() - split].copy_from_slice(&data[split..]);
        self.write_pos += data.len();
        if self.write_pos >= size {
            self.write_pos -= size;
        }
        self.balance += data.len() as f64;
    }

    /// Reads interleaved samples; the caller must not exceed
    /// [`read_available`](Self::read_available).
    pub fn read(&mut self, out: &mut [f32]) {
        let size = self.buffer.len();
        let nchannels = self.nchannels;
        let limit = size / nchannels;
        let int_pos = self.read_pos as usize;

        if self.ratio != 1.0 || (self.read_pos - int_pos as f64) != 0.0 {
            // interpolating path
            let incr = 1.0 / self.ratio;
            debug_assert!(incr > 0.0);
            for frame in out.chunks_exact_mut(nchannels) {
                let index = self.read_pos as usize;
                let fract = self.read_pos - index as f64;
                for (channel, sample) in frame.iter_mut().enumerate() {
                    let a = self.buffer[index * nchannels + channel] as f64;
                    let b = self.buffer[((index + 1) * nchannels + channel) % size] as f64;
                    *sample = (a + (b - a) * fract) as f32;
                }
                self.read_pos += incr;
                if self.read_pos >= limit as f64 {
                    self.read_pos -= limit as f64;
                }
            }
            self.balance -= out.len() as f64 * incr;
        } else {
            // straight copy fast path
            let pos = int_pos * nchannels;
            let out_len = out.len();
            let split = (size - pos).min(out_len);
            out[..split].copy_from_slice(&self.buffer[pos..pos + split]);
            out[split..].copy_from_slice(&self.buffer[..out_len - split]);
            self.read_pos += (out.len() / nchannels) as f64;
            if self.read_pos >= limit as f64 {
                self.read_pos -= limit as f64;
            }
            self.balance -= out.len() as f64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unity_ratio_passes_through() {
        let mut r = DynamicResampler::default();
        r.setup(4, 4, 2);
        r.update_rates(48e3, 48e3);
        let input: Vec<f32> = (0..8).map(|x| x as f32).collect();
        r.write(&input);
        assert_eq!(r.read_available(), 8);
        let mut out = [0.0f32; 8];
        r.read(&mut out);
        assert_eq!(&out[..], &input[..]);
    }

    #[test]
    fn upsampling_produces_more_output() {
        let mut r = DynamicResampler::default();
        r.setup(64, 64, 1);
        r.update_rates(44100.0, 48000.0);
        let input = vec![1.0f32; 64];
        r.write(&input);
        let avail = r.read_available();
        assert!(avail > 64, "expected > 64, got {avail}");
        let mut out = vec![0.0f32; avail];
        r.read(&mut out);
        // constant signal stays constant under linear interpolation
        for s in &out {
            assert!((s - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn downsampling_produces_less_output() {
        let mut r = DynamicResampler::default();
        r.setup(64, 64, 1);
        r.update_rates(48000.0, 44100.0);
        r.write(&vec![0.5f32; 64]);
        let avail = r.read_available();
        assert!(avail < 64);
        assert!(avail > 0);
    }

    #[test]
    fn wraps_around_the_ring() {
        let mut r = DynamicResampler::default();
        r.setup(4, 4, 1);
        r.update_rates(1.0, 1.0);
        // several writes/reads larger than half the buffer force wraps
        for round in 0..10 {
            let input: Vec<f32> = (0..6).map(|x| (round * 6 + x) as f32).collect();
            r.write(&input);
            let mut out = [0.0f32; 6];
            r.read(&mut out);
            assert_eq!(&out[..], &input[..]);
        }
    }
}
