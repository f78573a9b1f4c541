//! Stateful sample-rate conversion between {8 kHz, 24 kHz} PCM16 mono.
//!
//! This is the linear-interpolation fallback path rather than a polyphase
//! SRC: no polyphase resampling crate is in this workspace's dependency
//! graph, and the original telephony bridge itself falls back to exactly
//! this algorithm (persisted fractional position across calls) whenever its
//! preferred high-quality resampler is unavailable.

/// Stateful linear-interpolation resampler for mono PCM16 audio.
///
/// Each direction (8→24, 24→8) needs its own instance: state is a
/// continuous virtual sample-time position plus the last sample from the
/// previous call, so interpolation is seamless across call boundaries
/// without needing to buffer samples.
#[derive(Debug, Clone)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    step: f64,
    next_input_time: f64,
    last_sample: i16,
    has_last_sample: bool,
}

impl Resampler {
    /// Create a resampler converting mono PCM16 from `from_rate` Hz to `to_rate` Hz.
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            step: from_rate as f64 / to_rate as f64,
            next_input_time: 0.0,
            last_sample: 0,
            has_last_sample: false,
        }
    }

    /// Source rate in Hz.
    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Target rate in Hz.
    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Resample one chunk of little-endian PCM16 mono bytes.
    ///
    /// The returned byte count need not be an exact multiple of
    /// `input_len * to_rate / from_rate`: a small residual is retained in
    /// internal state and folded into the next call.
    pub fn resample(&mut self, pcm16_bytes: &[u8]) -> Vec<u8> {
        if self.from_rate == self.to_rate {
            return pcm16_bytes.to_vec();
        }

        let samples: Vec<i16> = pcm16_bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let n = samples.len();
        if n == 0 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity((n as f64 / self.step) as usize + 1);
        loop {
            let t = self.next_input_time;
            let i0 = t.floor() as isize;
            let i1 = i0 + 1;
            if i1 < 0 || i1 as usize >= n {
                break;
            }

            let sample0 = if i0 == -1 {
                if self.has_last_sample { self.last_sample } else { 0 }
            } else {
                samples[i0 as usize]
            };
            let sample1 = samples[i1 as usize];

            let frac = t - i0 as f64;
            let interpolated = sample0 as f64 + (sample1 as f64 - sample0 as f64) * frac;
            out.extend_from_slice(&(interpolated.round() as i16).to_le_bytes());

            self.next_input_time += self.step;
        }

        self.next_input_time -= n as f64;
        self.last_sample = samples[n - 1];
        self.has_last_sample = true;
        out
    }

    /// Discard accumulated internal state. Called on interruption and teardown.
    pub fn reset(&mut self) {
        self.next_input_time = 0.0;
        self.last_sample = 0;
        self.has_last_sample = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FRAME_BYTES_24K, FRAME_BYTES_8K};

    fn silence(bytes: usize) -> Vec<u8> {
        vec![0u8; bytes]
    }

    #[test]
    fn upsample_produces_roughly_three_times_the_samples() {
        let mut r = Resampler::new(8_000, 24_000);
        let input = silence(FRAME_BYTES_8K * 10);
        let mut total = 0usize;
        for _ in 0..10 {
            total += r.resample(&input[..FRAME_BYTES_8K]).len();
        }
        let expected = FRAME_BYTES_8K * 10 * 3;
        assert!((total as isize - expected as isize).unsigned_abs() < 8);
    }

    #[test]
    fn downsample_produces_roughly_a_third_of_the_samples() {
        let mut r = Resampler::new(24_000, 8_000);
        let input = silence(FRAME_BYTES_24K);
        let mut total = 0usize;
        for _ in 0..10 {
            total += r.resample(&input).len();
        }
        let expected = FRAME_BYTES_24K * 10 / 3;
        assert!((total as isize - expected as isize).unsigned_abs() < 8);
    }

    #[test]
    fn reset_clears_state_so_output_restarts_from_zero() {
        let mut r = Resampler::new(8_000, 24_000);
        r.resample(&silence(FRAME_BYTES_8K));
        r.reset();
        assert!(!r.has_last_sample);
        assert_eq!(r.next_input_time, 0.0);
    }

    #[test]
    fn same_rate_is_passthrough() {
        let mut r = Resampler::new(8_000, 8_000);
        let input = vec![1u8, 2, 3, 4];
        assert_eq!(r.resample(&input), input);
    }

    #[test]
    fn each_direction_keeps_independent_state() {
        let mut up = Resampler::new(8_000, 24_000);
        let mut down = Resampler::new(24_000, 8_000);
        up.resample(&silence(FRAME_BYTES_8K));
        assert_eq!(down.next_input_time, 0.0);
    }
}
