//! WSOLA (Waveform-Similarity Overlap-Add) time-stretch for catch-up playback.
//!
//! Used by the [`crate::bridge::AudioBridge`] to speed up 8 kHz playback by
//! 1.00–1.20× when the ring buffer has backed up, draining latency without
//! dropping audio or introducing audible discontinuities.

/// WSOLA time-stretcher operating on mono PCM16 frames at a fixed sample rate.
pub struct TimeStretch {
    frame_size: usize,
    overlap_size: usize,
    search_size: usize,
    leftover: Vec<i16>,
}

impl TimeStretch {
    /// Build a time-stretcher. `frame_ms`/`overlap_ms`/`search_ms` are converted
    /// to sample counts at `sample_rate`; the spec defaults are 20/10/5 ms at 8 kHz,
    /// giving frame/overlap/search sizes of 160/80/40 samples.
    pub fn new(sample_rate: u32, frame_ms: f64, overlap_ms: f64, search_ms: f64) -> Self {
        let to_samples = |ms: f64| (sample_rate as f64 * ms / 1000.0).round() as usize;
        Self {
            frame_size: to_samples(frame_ms),
            overlap_size: to_samples(overlap_ms),
            search_size: to_samples(search_ms),
            leftover: Vec::new(),
        }
    }

    /// Frame size in samples (160 at the 8 kHz / 20 ms default).
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Stretch one chunk of little-endian PCM16 mono bytes by `speed_ratio`.
    ///
    /// Fast path: `|speed_ratio - 1.0| < 0.01` returns the input unchanged
    /// without touching the internal leftover buffer. Otherwise the output
    /// byte count is always a non-negative multiple of `frame_size * 2`.
    pub fn process(&mut self, pcm16_bytes: &[u8], speed_ratio: f64) -> Vec<u8> {
        if (speed_ratio - 1.0).abs() < 0.01 {
            return pcm16_bytes.to_vec();
        }

        let mut samples: Vec<i16> = Vec::with_capacity(self.leftover.len() + pcm16_bytes.len() / 2);
        samples.extend_from_slice(&self.leftover);
        samples.extend(pcm16_bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])));

        if samples.len() < self.frame_size * 2 {
            self.leftover = samples;
            return Vec::new();
        }

        let out_samples = self.wsola(&samples, speed_ratio);

        let mut out_bytes = Vec::with_capacity(out_samples.len() * 2);
        for s in &out_samples {
            out_bytes.extend_from_slice(&s.to_le_bytes());
        }
        out_bytes
    }

    fn wsola(&mut self, audio: &[i16], speed_ratio: f64) -> Vec<i16> {
        let frame_size = self.frame_size;
        let overlap_size = self.overlap_size;
        let search_size = self.search_size as isize;
        let synthesis_hop = frame_size - overlap_size;
        let analysis_hop = ((synthesis_hop as f64) * speed_ratio).round().max(1.0) as isize;

        let mut output: Vec<i16> = Vec::with_capacity(audio.len());
        let first_len = frame_size.min(audio.len());
        output.extend_from_slice(&audio[..first_len]);
        output.resize(frame_size, 0);

        let mut input_pos: isize = frame_size as isize;

        while (input_pos as usize) + frame_size <= audio.len() && input_pos >= 0 {
            let out_len = output.len();
            let ref_start = out_len - overlap_size;
            let reference = output[ref_start..out_len].to_vec();

            let max_start = audio.len() as isize - frame_size as isize;
            let search_min = 0.max(input_pos - search_size);
            let search_max = max_start.min(input_pos + search_size);
            let best_pos = find_best_match(audio, &reference, search_min, search_max, overlap_size);

            let mut frame = vec![0i16; frame_size];
            let avail = audio.len().saturating_sub(best_pos as usize);
            let copy_len = avail.min(frame_size);
            frame[..copy_len]
                .copy_from_slice(&audio[best_pos as usize..best_pos as usize + copy_len]);

            for i in 0..overlap_size {
                let t = hanning_fade(i, overlap_size);
                let old = output[ref_start + i] as f64;
                let new = frame[i] as f64;
                let blended = (old * (1.0 - t) + new * t).round();
                output[ref_start + i] = blended.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            }
            output.extend_from_slice(&frame[overlap_size..]);

            input_pos += analysis_hop;
        }

        let consumed = input_pos.max(0) as usize;
        self.leftover = if consumed < audio.len() {
            audio[consumed.min(audio.len())..].to_vec()
        } else {
            Vec::new()
        };

        let rem = output.len() % frame_size;
        if rem != 0 {
            output.resize(output.len() + (frame_size - rem), 0);
        }
        output
    }

    /// Discard accumulated leftover input. Called on interruption and teardown.
    pub fn reset(&mut self) {
        self.leftover.clear();
    }

    /// True if `output`'s byte length is a multiple of the frame byte size.
    pub fn validate_output(&self, output: &[u8]) -> bool {
        output.len() % (self.frame_size * 2) == 0
    }
}

impl Default for TimeStretch {
    fn default() -> Self {
        Self::new(8_000, 20.0, 10.0, 5.0)
    }
}

/// Rising Hanning-shaped crossfade weight, 0.0 at `i == 0`, 1.0 at `i == len - 1`.
///
/// Taken as the rising half of a full-length Hanning window: a window of
/// `2 * len - 1` samples peaks at its midpoint, so its first `len` samples
/// are exactly the rising ramp this crossfade needs.
fn hanning_fade(i: usize, len: usize) -> f64 {
    if len <= 1 {
        return 1.0;
    }
    apodize::hanning_iter(2 * len - 1).nth(i).unwrap_or(1.0)
}

/// Search `[search_min, search_max]` for the position of maximum normalized
/// cross-correlation between `audio[pos..pos+overlap_size]` and `reference`.
///
/// On a silent reference (norm below `1e-6`), returns the search window's midpoint.
fn find_best_match(
    audio: &[i16],
    reference: &[i16],
    search_min: isize,
    search_max: isize,
    overlap_size: usize,
) -> isize {
    let ref_norm: f64 = reference.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>().sqrt();
    if ref_norm < 1e-6 {
        return (search_min + search_max) / 2;
    }
    if search_max < search_min {
        return search_min.max(0);
    }

    let mut best_pos = search_min;
    let mut best_score = f64::NEG_INFINITY;

    let mut pos = search_min;
    while pos <= search_max {
        let start = pos as usize;
        let end = (start + overlap_size).min(audio.len());
        if end <= start {
            pos += 1;
            continue;
        }
        let window = &audio[start..end];

        let mut dot = 0.0;
        let mut win_sq = 0.0;
        for (w, r) in window.iter().zip(reference.iter()) {
            dot += (*w as f64) * (*r as f64);
            win_sq += (*w as f64) * (*w as f64);
        }
        let win_norm = win_sq.sqrt();
        let score = if win_norm < 1e-6 { 0.0 } else { dot / (win_norm * ref_norm) };

        if score > best_score {
            best_score = score;
            best_pos = pos;
        }
        pos += 1;
    }

    best_pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FRAME_BYTES_8K;

    fn tone(len_samples: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len_samples * 2);
        for i in 0..len_samples {
            let v = ((i as f64 * 0.2).sin() * 8000.0) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn fast_path_returns_input_unchanged_without_consuming_buffer() {
        let mut ts = TimeStretch::default();
        let input = tone(160);
        let out = ts.process(&input, 1.0);
        assert_eq!(out, input);
        assert!(ts.leftover.is_empty());
    }

    #[test]
    fn framing_invariant_holds_across_speed_ratios() {
        for ratio in [0.8, 0.9, 1.05, 1.12, 1.2, 1.5] {
            let mut ts = TimeStretch::default();
            let input = tone(FRAME_BYTES_8K / 2 * 20);
            let out = ts.process(&input, ratio);
            assert!(
                ts.validate_output(&out),
                "ratio {ratio}: output len {} not a multiple of {}",
                out.len(),
                FRAME_BYTES_8K
            );
        }
    }

    #[test]
    fn short_input_is_buffered_and_returns_empty() {
        let mut ts = TimeStretch::default();
        let input = tone(50);
        let out = ts.process(&input, 1.12);
        assert!(out.is_empty());
        assert!(!ts.leftover.is_empty());
    }

    #[test]
    fn reset_clears_leftover_buffer() {
        let mut ts = TimeStretch::default();
        ts.process(&tone(50), 1.12);
        ts.reset();
        assert!(ts.leftover.is_empty());
    }

    #[test]
    fn silent_reference_picks_search_window_midpoint() {
        let audio = vec![0i16; 400];
        let reference = vec![0i16; 80];
        let pos = find_best_match(&audio, &reference, 10, 50, 80);
        assert_eq!(pos, 30);
    }

    proptest::proptest! {
        #[test]
        fn framing_invariant_holds_for_any_ratio_in_range(
            ratio in 0.8f64..1.5,
            extra_samples in 0usize..400,
        ) {
            let mut ts = TimeStretch::default();
            let input = tone(FRAME_BYTES_8K / 2 * 20 + extra_samples);
            let out = ts.process(&input, ratio);
            proptest::prop_assert!(
                ts.validate_output(&out),
                "ratio {ratio}: output len {} not a multiple of frame size",
                out.len()
            );
        }
    }
}
