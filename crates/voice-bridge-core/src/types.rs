//! Core data types shared across the voice bridge modules.

use bytes::Bytes;
use std::collections::HashMap;

/// A single linear PCM sample.
pub type Sample = i16;

/// Byte length of one 20 ms frame at 8 kHz mono 16-bit PCM.
pub const FRAME_BYTES_8K: usize = 320;

/// Byte length of one 20 ms frame at 24 kHz mono 16-bit PCM.
pub const FRAME_BYTES_24K: usize = 960;

/// Samples elapsed per 20 ms frame at 24 kHz (used for RTP timestamp increments).
pub const SAMPLES_PER_FRAME_24K: u32 = 480;

/// An immutable little-endian PCM16 mono byte sequence.
///
/// Canonical sizes are [`FRAME_BYTES_8K`] and [`FRAME_BYTES_24K`]; nothing in
/// this type enforces that, callers are responsible for framing at the
/// boundary that requires it (the Port and the RTP Stream Producer).
pub type Frame = Bytes;

/// Supported telephony sample rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleRate {
    /// 8 kHz narrowband telephony rate.
    Rate8000,
    /// 24 kHz realtime-model rate.
    Rate24000,
}

impl SampleRate {
    /// The rate in Hz.
    pub fn as_hz(self) -> u32 {
        match self {
            SampleRate::Rate8000 => 8_000,
            SampleRate::Rate24000 => 24_000,
        }
    }
}

/// A decoded RTP packet, payload already at the target session rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// PCM16 mono payload at the session rate (24 kHz), exactly [`FRAME_BYTES_24K`] bytes.
    pub payload: Frame,
    /// RTP timestamp: samples elapsed at the session rate.
    pub timestamp: u32,
    /// Monotonic sequence number, wrapping modulo 2^16.
    pub sequence_number: u16,
    /// RTP payload type.
    pub payload_type: u8,
    /// RTP marker bit.
    pub marker: bool,
}

/// Role attributed to one line of the accumulated transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptRole {
    /// Speech transcribed from the caller.
    User,
    /// Speech synthesized by the assistant.
    Assistant,
}

/// One line of the accumulated session transcript.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    /// Who said this.
    pub role: TranscriptRole,
    /// Transcribed or synthesized text.
    pub text: String,
}

/// Per-call result, always produced even when the call ends in error.
#[derive(Debug, Clone)]
pub struct VoiceBridgeStats {
    /// Wall-clock duration of the call.
    pub duration: std::time::Duration,
    /// Bytes of decoded PCM forwarded from the SIP side to the model.
    pub inbound_audio_bytes: u64,
    /// Bytes of decoded PCM forwarded from the model to the SIP side.
    pub outbound_audio_bytes: u64,
    /// Accumulated transcript lines, in arrival order.
    pub transcripts: Vec<TranscriptEntry>,
    /// Set when the call ended due to an error rather than a normal hangup.
    pub error: Option<String>,
}

impl VoiceBridgeStats {
    /// Number of transcript lines recorded.
    pub fn transcript_count(&self) -> usize {
        self.transcripts.len()
    }
}

/// Aggregate, in-memory counters across every call a process has handled.
///
/// This is ambient observability, not transcript persistence: nothing here
/// is written to storage, it only answers "how is this process doing".
#[derive(Debug, Default, Clone)]
pub struct VoiceBridgeMetrics {
    /// Total calls that have completed teardown.
    pub total_sessions: u64,
    /// Total calls that ended with `VoiceBridgeStats.error.is_some()`.
    pub total_errors: u64,
    /// Sum of every call's duration.
    pub total_duration: std::time::Duration,
    /// Sum of every call's inbound audio bytes.
    pub total_inbound_bytes: u64,
    /// Sum of every call's outbound audio bytes.
    pub total_outbound_bytes: u64,
    /// Most recent error message observed, if any.
    pub last_error: Option<String>,
}

/// Lock-protected recorder that folds [`VoiceBridgeStats`] into [`VoiceBridgeMetrics`].
pub struct VoiceBridgeMetricsRecorder {
    inner: parking_lot::Mutex<VoiceBridgeMetrics>,
}

impl VoiceBridgeMetricsRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            inner: parking_lot::Mutex::new(VoiceBridgeMetrics::default()),
        }
    }

    /// Fold one call's stats into the running aggregate.
    pub fn record(&self, stats: &VoiceBridgeStats) {
        let mut agg = self.inner.lock();
        agg.total_sessions += 1;
        agg.total_duration += stats.duration;
        agg.total_inbound_bytes += stats.inbound_audio_bytes;
        agg.total_outbound_bytes += stats.outbound_audio_bytes;
        if let Some(err) = &stats.error {
            agg.total_errors += 1;
            agg.last_error = Some(err.clone());
        }
    }

    /// Snapshot of the current aggregate.
    pub fn snapshot(&self) -> VoiceBridgeMetrics {
        self.inner.lock().clone()
    }
}

impl Default for VoiceBridgeMetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional observer callbacks invoked by the Event Router and Call Controller.
///
/// Deliberately narrower than the original's hook surface: `close_dialog` and
/// `resume_workflow` belonged to the excluded SIP-transport and workflow
/// layers and have no counterpart here.
#[derive(Default, Clone)]
pub struct VoiceBridgeHooks {
    /// Invoked with every accumulated transcript entry as it becomes final.
    pub on_transcript: Option<std::sync::Arc<dyn Fn(TranscriptEntry) + Send + Sync>>,
    /// Invoked with every chunk of inbound (caller) PCM forwarded to the model.
    pub on_audio_inbound: Option<std::sync::Arc<dyn Fn(Bytes) + Send + Sync>>,
    /// Invoked with every chunk of outbound (assistant) PCM forwarded to the port.
    pub on_audio_outbound: Option<std::sync::Arc<dyn Fn(Bytes) + Send + Sync>>,
}

impl std::fmt::Debug for VoiceBridgeHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceBridgeHooks")
            .field("on_transcript", &self.on_transcript.is_some())
            .field("on_audio_inbound", &self.on_audio_inbound.is_some())
            .field("on_audio_outbound", &self.on_audio_outbound.is_some())
            .finish()
    }
}

/// Named timing phases tracked per call for comparative diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticPhase {
    /// Port leased and ring buffer constructed.
    Ring,
    /// `CallSession` created.
    SessionCreate,
    /// Realtime model WebSocket connected.
    SdkConnect,
    /// Native media-active callback fired.
    MediaActive,
    /// First RTP packet produced from inbound audio.
    FirstRtp,
    /// First TTS audio chunk received from the model.
    FirstTts,
    /// `response.create` sent to the model.
    ResponseCreate,
}

/// Per-call phase timestamps, recorded relative to call start.
#[derive(Debug, Default, Clone)]
pub struct CallDiagnostics {
    /// Wall-clock offsets (from call start) at which each phase completed.
    pub phases: HashMap<DiagnosticPhase, std::time::Duration>,
}

impl CallDiagnostics {
    /// Record a phase completion if it has not already been recorded.
    pub fn mark(&mut self, phase: DiagnosticPhase, elapsed: std::time::Duration) {
        self.phases.entry(phase).or_insert(elapsed);
    }

    /// Duration between two recorded phases, if both were recorded.
    pub fn delta(&self, from: DiagnosticPhase, to: DiagnosticPhase) -> Option<std::time::Duration> {
        let a = *self.phases.get(&from)?;
        let b = *self.phases.get(&to)?;
        b.checked_sub(a)
    }
}

/// Number of most-recent calls' diagnostics retained for comparative analysis.
pub const DIAGNOSTICS_HISTORY_CAP: usize = 50;

/// Bounded rolling history of [`CallDiagnostics`] across the most recent
/// calls a process has handled, gated to a logging collaborator rather than
/// surfaced to every caller.
pub struct DiagnosticsHistory {
    inner: parking_lot::Mutex<std::collections::VecDeque<CallDiagnostics>>,
}

impl DiagnosticsHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self { inner: parking_lot::Mutex::new(std::collections::VecDeque::with_capacity(DIAGNOSTICS_HISTORY_CAP)) }
    }

    /// Record one call's diagnostics, evicting the oldest entry past [`DIAGNOSTICS_HISTORY_CAP`].
    pub fn record(&self, diagnostics: CallDiagnostics) {
        let mut history = self.inner.lock();
        if history.len() >= DIAGNOSTICS_HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(diagnostics);
    }

    /// Snapshot of the retained calls, oldest first.
    pub fn recent(&self) -> Vec<CallDiagnostics> {
        self.inner.lock().iter().cloned().collect()
    }
}

impl Default for DiagnosticsHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_evicts_oldest_past_capacity() {
        let history = DiagnosticsHistory::new();
        for i in 0..(DIAGNOSTICS_HISTORY_CAP + 3) {
            let mut d = CallDiagnostics::default();
            d.mark(DiagnosticPhase::Ring, std::time::Duration::from_millis(i as u64));
            history.record(d);
        }
        let recent = history.recent();
        assert_eq!(recent.len(), DIAGNOSTICS_HISTORY_CAP);
        assert_eq!(recent[0].phases[&DiagnosticPhase::Ring], std::time::Duration::from_millis(3));
    }
}
