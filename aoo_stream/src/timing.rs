//! Process-callback timing: the xrun-detecting timer and the DLL time
//! filter estimating the real audio sample rate.

use aoo_wire::time::NtpTime;

/// Tolerance factor for the xrun check, relative to the nominal callback
/// period.
const XRUN_TOLERANCE: f64 = 0.25;

const CHECK_BUFFER_SIZE: usize = 64;

/// Outcome of feeding a callback timestamp to the [`Timer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerResult {
    /// First timestamp after a reset; (re)initialise the DLL.
    Reset,
    /// Normal tick.
    Ok,
    /// The averaged callback period exceeded the nominal period by more
    /// than the tolerance: one or more process ticks took too long.
    /// Carries the estimated error in seconds.
    Xrun(f64),
}

/// Tracks elapsed stream time from callback timestamps and detects
/// dropouts.
///
/// A host splitting its hardware buffer into several engine blocks
/// produces one long delta followed by several short ones; the moving
/// average over a power-of-two window smooths that pattern out, so only
/// genuinely late ticks trip the check.
#[derive(Debug)]
pub struct Timer {
    last: NtpTime,
    elapsed: f64,
    nominal_delta: f64,
    deltas: [f64; CHECK_BUFFER_SIZE],
    sum: f64,
    head: usize,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            last: NtpTime::EMPTY,
            elapsed: 0.0,
            nominal_delta: 0.0,
            deltas: [0.0; CHECK_BUFFER_SIZE],
            sum: 0.0,
            head: 0,
        }
    }
}

impl Timer {
    pub fn setup(&mut self, samplerate: i32, blocksize: i32) {
        self.nominal_delta = blocksize as f64 / samplerate as f64;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.last = NtpTime::EMPTY;
        self.elapsed = 0.0;
        self.deltas.fill(self.nominal_delta);
        self.sum = self.nominal_delta * CHECK_BUFFER_SIZE as f64;
        self.head = 0;
    }

    #[inline(always)]
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    #[inline(always)]
    pub fn absolute(&self) -> NtpTime {
        self.last
    }

    pub fn update(&mut self, t: NtpTime) -> TimerResult {
        if self.last.is_empty() {
            self.last = t;
            return TimerResult::Reset;
        }
        let delta = NtpTime::duration(self.last, t);
        self.last = t;
        self.elapsed += delta;

        // recursive moving average over the last N deltas
        self.head = (self.head + 1) & (CHECK_BUFFER_SIZE - 1);
        self.sum += delta - self.deltas[self.head];
        self.deltas[self.head] = delta;

        let average = self.sum / CHECK_BUFFER_SIZE as f64;
        let average_error = average - self.nominal_delta;
        if average_error > self.nominal_delta * XRUN_TOLERANCE {
            log::warn!(
                "process tick(s) took too long (last period {:.3} ms, average {:.3} ms)",
                delta * 1000.0,
                average * 1000.0
            );
            TimerResult::Xrun((delta - self.nominal_delta).max(0.0))
        } else {
            TimerResult::Ok
        }
    }
}

/// Delay-locked loop estimating the effective sample rate from elapsed
/// stream time, after Fons Adriaensen's design: a second-order feedback
/// loop with coefficients `b = √2·ω`, `c = ω²`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeDll {
    b: f64,
    c: f64,
    t0: f64,
    t1: f64,
    /// Smoothed period estimate.
    e2: f64,
    blocksize: f64,
}

impl TimeDll {
    pub fn setup(&mut self, samplerate: i32, blocksize: i32, bandwidth: f64, t: f64) {
        let period = blocksize as f64 / samplerate as f64;
        let omega = core::f64::consts::TAU * bandwidth * period;
        self.b = core::f64::consts::SQRT_2 * omega;
        self.c = omega * omega;
        self.e2 = period;
        self.t0 = t;
        self.t1 = t + period;
        self.blocksize = blocksize as f64;
    }

    #[inline]
    pub fn update(&mut self, t: f64) {
        let e = t - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
    }

    /// Smoothed callback period in seconds.
    #[inline(always)]
    pub fn period(&self) -> f64 {
        self.e2
    }

    /// Estimated real sample rate.
    #[inline(always)]
    pub fn samplerate(&self) -> f64 {
        self.blocksize / self.e2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: i32 = 48000;
    const BS: i32 = 256;

    #[test]
    fn timer_accumulates_elapsed_time() {
        let mut timer = Timer::default();
        timer.setup(SR, BS);
        let delta = BS as f64 / SR as f64;
        assert_eq!(timer.update(NtpTime::from_secs(100.0)), TimerResult::Reset);
        for i in 1..=10 {
            let t = NtpTime::from_secs(100.0 + i as f64 * delta);
            assert_eq!(timer.update(t), TimerResult::Ok);
        }
        assert!((timer.elapsed() - 10.0 * delta).abs() < 1e-6);
    }

    #[test]
    fn timer_detects_xrun() {
        let mut timer = Timer::default();
        timer.setup(SR, BS);
        timer.update(NtpTime::from_secs(0.0));
        // a whole second of silence is way beyond tolerance
        match timer.update(NtpTime::from_secs(1.0)) {
            TimerResult::Xrun(err) => assert!(err > 0.9),
            other => panic!("expected xrun, got {other:?}"),
        }
    }

    #[test]
    fn dll_converges_to_real_rate() {
        let mut dll = TimeDll::default();
        dll.setup(SR, BS, 0.012, 0.0);
        // the "real" clock runs 0.1% fast
        let real_rate = SR as f64 * 1.001;
        let real_period = BS as f64 / real_rate;
        let mut t = 0.0;
        for _ in 0..20000 {
            t += real_period;
            dll.update(t);
        }
        let estimate = dll.samplerate();
        assert!(
            (estimate - real_rate).abs() < 1.0,
            "estimate {estimate} vs real {real_rate}"
        );
    }
}
