//! The audio bridge: the model-to-SIP half of the pipeline.
//!
//! Downsamples 24 kHz realtime-model audio to 8 kHz, feeds it through a
//! pull-driven ring buffer with admission control, and applies WSOLA
//! catch-up time-stretch whenever the ring backs up past the high-water
//! mark. [`crate::port::AudioPort`] pulls from this buffer at 20 ms cadence
//! via the [`crate::port::PullSource`] trait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::port::PullSource;
use crate::resample::Resampler;
use crate::timestretch::TimeStretch;
use crate::types::FRAME_BYTES_8K;

/// Ring occupancy, in 20 ms frames, below which catch-up playback ends.
pub const TARGET_FRAMES: usize = 6;
/// Ring occupancy, in frames, at or above which catch-up playback begins.
pub const HIGH_FRAMES: usize = 9;
/// Ring occupancy, in frames, at or above which admission control drops incoming audio.
pub const CAP_FRAMES: usize = 12;
/// Playback speed applied while catching up.
pub const CATCHUP_SPEED_RATIO: f64 = 1.12;
/// Normal (non-catch-up) playback speed.
pub const NORMAL_SPEED_RATIO: f64 = 1.0;

/// Model-to-SIP audio path: ring buffer, downsampler, and catch-up time-stretch.
pub struct AudioBridge {
    ring: Mutex<VecDeque<u8>>,
    downsampler: Mutex<Resampler>,
    stretch: Mutex<TimeStretch>,
    catching_up: AtomicBool,
    enabled: AtomicBool,
    dropped_bytes: AtomicU64,
    outbound_bytes: AtomicU64,
}

impl AudioBridge {
    /// Build a bridge downsampling from `from_hz` (the model's output rate) to 8 kHz.
    pub fn new(from_hz: u32) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(CAP_FRAMES * FRAME_BYTES_8K)),
            downsampler: Mutex::new(Resampler::new(from_hz, 8_000)),
            stretch: Mutex::new(TimeStretch::default()),
            catching_up: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            dropped_bytes: AtomicU64::new(0),
            outbound_bytes: AtomicU64::new(0),
        }
    }

    /// Cumulative bytes successfully delivered to the port.
    pub fn outbound_bytes(&self) -> u64 {
        self.outbound_bytes.load(Ordering::Relaxed)
    }

    /// Cumulative bytes dropped by admission control.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes.load(Ordering::Relaxed)
    }

    /// True while playback is running at [`CATCHUP_SPEED_RATIO`].
    pub fn is_catching_up(&self) -> bool {
        self.catching_up.load(Ordering::Relaxed)
    }

    fn ring_frames(ring: &VecDeque<u8>) -> usize {
        ring.len() / FRAME_BYTES_8K
    }

    /// Accept one chunk of model audio at the bridge's source rate, downsample
    /// it to 8 kHz, stretch it at the current catch-up ratio, and carve the
    /// result into 320-byte frames, admitting each one individually.
    ///
    /// Admission control runs once per frame, not once per chunk: a chunk
    /// that would push the ring past [`CAP_FRAMES`] partway through has its
    /// later frames dropped while its earlier frames are still enqueued.
    pub fn send_to_peer(&self, model_pcm: &[u8]) {
        if model_pcm.is_empty() {
            return;
        }

        let speed_ratio = if self.catching_up.load(Ordering::Relaxed) {
            CATCHUP_SPEED_RATIO
        } else {
            NORMAL_SPEED_RATIO
        };

        let downsampled = self.downsampler.lock().resample(model_pcm);
        if downsampled.is_empty() {
            return;
        }
        let stretched = self.stretch.lock().process(&downsampled, speed_ratio);
        if stretched.is_empty() {
            return;
        }

        for chunk in stretched.chunks(FRAME_BYTES_8K) {
            let mut ring = self.ring.lock();
            if Self::ring_frames(&ring) >= CAP_FRAMES {
                self.dropped_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                warn!(ring_frames = Self::ring_frames(&ring), "audio bridge ring at capacity, dropping frame");
                drop(ring);
                continue;
            }
            ring.extend(chunk.iter().copied());
            let frames_now = Self::ring_frames(&ring);
            drop(ring);
            self.update_hysteresis(frames_now);
        }
    }

    fn update_hysteresis(&self, frames_now: usize) {
        if !self.catching_up.load(Ordering::Relaxed) && frames_now >= HIGH_FRAMES {
            self.catching_up.store(true, Ordering::Relaxed);
            debug!(frames_now, "audio bridge entering catch-up playback");
        } else if self.catching_up.load(Ordering::Relaxed) && frames_now <= TARGET_FRAMES {
            self.catching_up.store(false, Ordering::Relaxed);
            debug!(frames_now, "audio bridge leaving catch-up playback");
        }
    }

    /// Pop the next paced 320-byte 8 kHz frame, padding with silence on underrun.
    pub fn pull_next_8k(&self) -> Bytes {
        if !self.enabled.load(Ordering::Relaxed) {
            return Bytes::from(vec![0u8; FRAME_BYTES_8K]);
        }

        let mut ring = self.ring.lock();
        let take = FRAME_BYTES_8K.min(ring.len());
        let mut frame: Vec<u8> = ring.drain(..take).collect();
        let frames_now = Self::ring_frames(&ring);
        drop(ring);

        if frame.len() < FRAME_BYTES_8K {
            frame.resize(FRAME_BYTES_8K, 0);
        }
        self.update_hysteresis(frames_now);
        self.outbound_bytes.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Bytes::from(frame)
    }

    /// Push `frame_count` silent 320-byte frames directly into the ring,
    /// bypassing the downsampler and time-stretch. Used for speak-first priming.
    pub fn send_prime_silence_direct(&self, frame_count: usize) {
        let mut ring = self.ring.lock();
        for _ in 0..frame_count {
            if Self::ring_frames(&ring) >= CAP_FRAMES {
                break;
            }
            ring.extend(std::iter::repeat(0u8).take(FRAME_BYTES_8K));
        }
    }

    /// Resume delivering real audio after [`Self::stop`] or construction.
    pub fn enable_audio_output(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Drop all buffered audio and reset resampler/time-stretch state.
    /// Returns the number of bytes discarded.
    pub fn clear_audio_queue(&self) -> usize {
        let mut ring = self.ring.lock();
        let cleared = ring.len();
        ring.clear();
        drop(ring);
        self.downsampler.lock().reset();
        self.stretch.lock().reset();
        self.catching_up.store(false, Ordering::Relaxed);
        cleared
    }

    /// Barge-in recovery: clear the queue and resume output.
    pub fn resume_after_interruption(&self) {
        self.clear_audio_queue();
        self.enable_audio_output();
    }

    /// Call teardown: stop delivering audio and release buffered state.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.clear_audio_queue();
    }
}

impl PullSource for AudioBridge {
    fn pull_next_8k(&self) -> Bytes {
        self.pull_next_8k()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len_bytes: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len_bytes);
        for i in 0..(len_bytes / 2) {
            let v = ((i as f64 * 0.1).sin() * 4000.0) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn pull_on_empty_ring_yields_silence() {
        let bridge = AudioBridge::new(24_000);
        let frame = bridge.pull_next_8k();
        assert_eq!(frame.len(), FRAME_BYTES_8K);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn disabled_bridge_yields_silence_even_with_buffered_audio() {
        let bridge = AudioBridge::new(8_000);
        bridge.send_to_peer(&tone(FRAME_BYTES_8K * 3));
        bridge.stop();
        let frame = bridge.pull_next_8k();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn admission_control_drops_once_ring_is_at_cap() {
        let bridge = AudioBridge::new(8_000);
        for _ in 0..(CAP_FRAMES + 5) {
            bridge.send_to_peer(&tone(FRAME_BYTES_8K));
        }
        assert!(bridge.dropped_bytes() > 0);
    }

    #[test]
    fn ring_enters_catchup_above_high_watermark() {
        let bridge = AudioBridge::new(8_000);
        for _ in 0..HIGH_FRAMES {
            bridge.send_to_peer(&tone(FRAME_BYTES_8K));
        }
        assert!(bridge.is_catching_up());
    }

    #[test]
    fn prime_silence_is_audible_as_zero_frames() {
        let bridge = AudioBridge::new(8_000);
        bridge.send_prime_silence_direct(3);
        for _ in 0..3 {
            let frame = bridge.pull_next_8k();
            assert!(frame.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn clear_audio_queue_resets_catchup_state() {
        let bridge = AudioBridge::new(8_000);
        for _ in 0..HIGH_FRAMES {
            bridge.send_to_peer(&tone(FRAME_BYTES_8K));
        }
        assert!(bridge.is_catching_up());
        bridge.clear_audio_queue();
        assert!(!bridge.is_catching_up());
    }

    #[test]
    fn resume_after_interruption_reenables_output() {
        let bridge = AudioBridge::new(8_000);
        bridge.send_to_peer(&tone(FRAME_BYTES_8K));
        bridge.stop();
        bridge.resume_after_interruption();
        bridge.send_to_peer(&tone(FRAME_BYTES_8K));
        let frame = bridge.pull_next_8k();
        assert!(!frame.iter().all(|&b| b == 0));
    }
}
