//! SIP-facing audio port: the bounded-queue boundary between the native
//! media callback thread and the cooperative bridge/session world.

pub mod pool;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::types::FRAME_BYTES_8K;

/// Capacity of the inbound (SIP → core) frame queue.
pub const INCOMING_QUEUE_CAPACITY: usize = 100;
/// Capacity of the outbound (core → SIP, push mode) frame queue.
pub const OUTGOING_QUEUE_CAPACITY: usize = 1_000;

/// A synchronous source of pre-paced 8 kHz frames, pulled by the port in pull mode.
///
/// Implemented by [`crate::bridge::AudioBridge`]. Kept as a trait here so the
/// port has no compile-time dependency on the bridge module.
pub trait PullSource: Send + Sync {
    /// Pop the next paced 320-byte 8 kHz frame.
    fn pull_next_8k(&self) -> Bytes;
}

#[derive(Default)]
struct PortCounters {
    requested: AtomicU64,
    outgoing: AtomicU64,
    outgoing_silence: AtomicU64,
    received: AtomicU64,
}

/// Snapshot of a port's frame counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortCounterSnapshot {
    /// Number of `onFrameRequested` callbacks served.
    pub requested: u64,
    /// Number of non-silent frames returned to the native callback.
    pub outgoing: u64,
    /// Number of silence frames returned to the native callback.
    pub outgoing_silence: u64,
    /// Number of frames accepted by `onFrameReceived`.
    pub received: u64,
}

/// Bounded producer/consumer port exposed to the native SIP media callbacks.
///
/// Exactly one port is leased per live call. `onFrameRequested` /
/// `onFrameReceived` are the synchronous entry points a native callback
/// thread invokes at 20 ms cadence; every other method may be called from
/// cooperative (async) code. The two worlds only ever touch the lock-protected
/// queues and the atomic `active` flag — no native callback ever awaits.
pub struct AudioPort {
    active: AtomicBool,
    reuse_count: AtomicU32,
    incoming_tx: SyncSender<Bytes>,
    incoming_rx: Mutex<Receiver<Bytes>>,
    outgoing_tx: SyncSender<Bytes>,
    outgoing_rx: Mutex<Receiver<Bytes>>,
    frame_requested_event: Mutex<Option<Arc<Notify>>>,
    first_requested_signaled: AtomicBool,
    bridge: Mutex<Option<Arc<dyn PullSource>>>,
    counters: PortCounters,
}

impl AudioPort {
    /// Create a fresh, active port with empty queues.
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = sync_channel(INCOMING_QUEUE_CAPACITY);
        let (outgoing_tx, outgoing_rx) = sync_channel(OUTGOING_QUEUE_CAPACITY);
        Self {
            active: AtomicBool::new(true),
            reuse_count: AtomicU32::new(0),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            outgoing_tx,
            outgoing_rx: Mutex::new(outgoing_rx),
            frame_requested_event: Mutex::new(None),
            first_requested_signaled: AtomicBool::new(false),
            bridge: Mutex::new(None),
            counters: PortCounters::default(),
        }
    }

    /// How many times this port has been recycled through the pool.
    pub fn reuse_count(&self) -> u32 {
        self.reuse_count.load(Ordering::Relaxed)
    }

    /// Snapshot the frame counters.
    pub fn counters(&self) -> PortCounterSnapshot {
        PortCounterSnapshot {
            requested: self.counters.requested.load(Ordering::Relaxed),
            outgoing: self.counters.outgoing.load(Ordering::Relaxed),
            outgoing_silence: self.counters.outgoing_silence.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
        }
    }

    /// Native callback: the SIP stack wants the next 20 ms outbound frame.
    ///
    /// Always returns exactly [`FRAME_BYTES_8K`] bytes. Synchronous, must
    /// return within a few milliseconds; never awaits cooperative work.
    pub fn on_frame_requested(&self) -> Bytes {
        if !self.active.load(Ordering::Acquire) {
            return silence_frame();
        }

        let requested = self.counters.requested.fetch_add(1, Ordering::Relaxed) + 1;
        if requested == 1 && !self.first_requested_signaled.swap(true, Ordering::AcqRel) {
            if let Some(event) = self.frame_requested_event.lock().as_ref() {
                event.notify_one();
            }
        }

        let raw = if let Some(bridge) = self.bridge.lock().as_ref() {
            bridge.pull_next_8k()
        } else {
            match self.outgoing_rx.lock().try_recv() {
                Ok(frame) => frame,
                Err(_) => Bytes::new(),
            }
        };

        let framed = pad_or_truncate(raw, FRAME_BYTES_8K);
        if is_silence(&framed) {
            self.counters.outgoing_silence.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.outgoing.fetch_add(1, Ordering::Relaxed);
        }
        framed
    }

    /// Native callback: the SIP stack delivered one inbound 20 ms frame.
    ///
    /// Drops the frame with a logged warning if the incoming queue is full.
    pub fn on_frame_received(&self, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if let Err(TrySendError::Full(_)) = self.incoming_tx.try_send(frame) {
            warn!("audio port incoming queue full, dropping frame");
        }
    }

    /// Push-mode producer: enqueue one frame for the native callback to emit later.
    pub fn send_frame(&self, frame: Bytes) {
        if let Err(TrySendError::Full(_)) = self.outgoing_tx.try_send(frame) {
            warn!("audio port outgoing queue full, dropping frame");
        }
    }

    /// Pop one inbound frame, if available, without blocking.
    pub fn get_frame(&self) -> Option<Bytes> {
        self.incoming_rx.lock().try_recv().ok()
    }

    /// Drain the incoming queue, returning the number of frames dropped.
    pub fn clear_incoming(&self) -> usize {
        drain(&self.incoming_rx)
    }

    /// Drain the outgoing queue, returning the number of frames dropped.
    pub fn clear_outgoing(&self) -> usize {
        drain(&self.outgoing_rx)
    }

    /// Deactivate the port: subsequent `onFrameRequested` calls yield silence.
    pub fn disable(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// True while the port is serving real audio (as opposed to silence).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Aggressively drain both queues before returning the port to the pool.
    ///
    /// Keeps draining in a tight loop for up to 100 ms, restarting the
    /// window every time the loop actually drained something, so that
    /// jitter-buffered frames arriving mid-drain don't survive into reuse.
    pub fn prepare_for_pool(&self) {
        self.disable();
        *self.bridge.lock() = None;
        *self.frame_requested_event.lock() = None;

        let mut window_start = Instant::now();
        loop {
            let drained = self.clear_incoming() + self.clear_outgoing();
            if drained > 0 {
                window_start = Instant::now();
            }
            if window_start.elapsed() >= Duration::from_millis(100) {
                break;
            }
            if drained == 0 {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Arm the port for a new call: reset counters, clear queues, attach the
    /// frame-requested event and (optionally) a pull-mode bridge.
    pub fn prepare_for_new_call(&self, ready_event: Arc<Notify>, bridge: Option<Arc<dyn PullSource>>) {
        self.counters.requested.store(0, Ordering::Relaxed);
        self.counters.outgoing.store(0, Ordering::Relaxed);
        self.counters.outgoing_silence.store(0, Ordering::Relaxed);
        self.counters.received.store(0, Ordering::Relaxed);
        self.first_requested_signaled.store(false, Ordering::Relaxed);
        self.clear_incoming();
        self.clear_outgoing();
        *self.frame_requested_event.lock() = Some(ready_event);
        *self.bridge.lock() = bridge;
        self.active.store(true, Ordering::Release);
    }

    pub(crate) fn bump_reuse(&self) {
        self.reuse_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for AudioPort {
    fn default() -> Self {
        Self::new()
    }
}

fn silence_frame() -> Bytes {
    Bytes::from_static(&[0u8; FRAME_BYTES_8K])
}

fn pad_or_truncate(mut frame: Bytes, target: usize) -> Bytes {
    if frame.len() == target {
        frame
    } else if frame.len() > target {
        frame.truncate(target);
        frame
    } else {
        let mut buf = bytes::BytesMut::with_capacity(target);
        buf.extend_from_slice(&frame);
        buf.resize(target, 0);
        buf.freeze()
    }
}

fn is_silence(frame: &[u8]) -> bool {
    let check_len = frame.len().min(20);
    frame[..check_len].iter().all(|&b| b == 0)
}

fn drain(rx: &Mutex<Receiver<Bytes>>) -> usize {
    let rx = rx.lock();
    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_port_yields_silence() {
        let port = AudioPort::new();
        port.disable();
        let frame = port.on_frame_requested();
        assert_eq!(frame.len(), FRAME_BYTES_8K);
        assert!(is_silence(&frame));
    }

    #[test]
    fn push_mode_short_frame_is_padded() {
        let port = AudioPort::new();
        port.send_frame(Bytes::from_static(&[1, 2, 3]));
        let frame = port.on_frame_requested();
        assert_eq!(frame.len(), FRAME_BYTES_8K);
        assert_eq!(&frame[..3], &[1, 2, 3]);
        assert!(frame[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn push_mode_long_frame_is_truncated() {
        let port = AudioPort::new();
        port.send_frame(Bytes::from(vec![7u8; FRAME_BYTES_8K + 50]));
        let frame = port.on_frame_requested();
        assert_eq!(frame.len(), FRAME_BYTES_8K);
    }

    #[test]
    fn push_mode_empty_outgoing_queue_yields_silence() {
        let port = AudioPort::new();
        let frame = port.on_frame_requested();
        assert!(is_silence(&frame));
    }

    #[test]
    fn first_frame_requested_signals_event_once() {
        let port = AudioPort::new();
        let notify = Arc::new(Notify::new());
        port.prepare_for_new_call(notify.clone(), None);
        port.on_frame_requested();
        port.on_frame_requested();
        assert_eq!(port.counters().requested, 2);
    }

    #[test]
    fn on_frame_received_drops_on_full_queue() {
        let port = AudioPort::new();
        for _ in 0..INCOMING_QUEUE_CAPACITY {
            port.on_frame_received(Bytes::from_static(&[1u8; FRAME_BYTES_8K]));
        }
        port.on_frame_received(Bytes::from_static(&[1u8; FRAME_BYTES_8K]));
        assert_eq!(port.counters().received, INCOMING_QUEUE_CAPACITY as u64 + 1);
    }

    #[test]
    fn empty_frame_received_is_ignored() {
        let port = AudioPort::new();
        port.on_frame_received(Bytes::new());
        assert_eq!(port.counters().received, 0);
        assert!(port.get_frame().is_none());
    }

    #[test]
    fn prepare_for_new_call_resets_counters_and_reactivates() {
        let port = AudioPort::new();
        port.disable();
        let notify = Arc::new(Notify::new());
        port.prepare_for_new_call(notify, None);
        assert!(port.is_active());
        assert_eq!(port.counters().requested, 0);
    }
}
