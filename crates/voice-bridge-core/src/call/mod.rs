//! Call Controller: the per-call state machine tying together the port,
//! bridge, RTP producer, session adapter, and event router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::AudioBridge;
use crate::codec::InboundCodec;
use crate::config::{EventRouterConfig, SessionParams, FIRST_FRAME_BARRIER_TIMEOUT};
use crate::error::{Error, Result};
use crate::event_router::{EventRouter, RouterHandle};
use crate::port::pool::PortPool;
use crate::port::AudioPort;
use crate::rtp_producer::RtpStreamProducer;
use crate::session::SessionAdapter;
use crate::types::{CallDiagnostics, DiagnosticPhase, VoiceBridgeHooks, VoiceBridgeStats};

fn transition_state(state: &Mutex<CallState>, next: CallState) -> Result<()> {
    let mut state = state.lock();
    if !state.can_transition_to(next) {
        return Err(Error::InvalidStateTransition { from: *state, to: next });
    }
    *state = next;
    Ok(())
}

/// Lifecycle state of one call, mirroring the SIP dialog and media session
/// state jointly.
///
/// ```text
/// ringing -> answered -> media_active -> primed -> running <-> interrupting -> terminated -> closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// SIP INVITE received, not yet answered.
    Ringing,
    /// 200 OK sent, media not yet flowing.
    Answered,
    /// Native media-active callback fired; port is leased and receiving frames.
    MediaActive,
    /// Session opened and (if `speak_first`) primed with initial silence/greeting.
    Primed,
    /// Steady-state bidirectional audio bridging.
    Running,
    /// Caller barge-in is being handled: assistant audio purged, response canceled.
    Interrupting,
    /// Teardown initiated; components are being released in order.
    Terminated,
    /// Teardown complete; the port has been returned to (or evicted from) the pool.
    Closed,
}

impl CallState {
    fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Ringing, Answered)
                | (Answered, MediaActive)
                | (MediaActive, Primed)
                | (Primed, Running)
                | (Running, Interrupting)
                | (Interrupting, Running)
                | (Running, Terminated)
                | (Interrupting, Terminated)
                | (MediaActive, Terminated)
                | (Primed, Terminated)
                | (Answered, Terminated)
                | (Ringing, Terminated)
                | (Terminated, Closed)
        )
    }
}

/// Owns one call end-to-end: acquiring a port, opening the model session,
/// bridging audio in both directions, and tearing everything down in order.
pub struct CallController {
    call_id: Uuid,
    state: Arc<Mutex<CallState>>,
    pool: Arc<PortPool>,
    port: Arc<AudioPort>,
    bridge: Arc<AudioBridge>,
    started_at: Instant,
    diagnostics: Arc<Mutex<CallDiagnostics>>,
    router: Mutex<Option<RouterHandle>>,
    inbound_codec: InboundCodec,
    speak_first: bool,
    media_active_flag: Arc<AtomicBool>,
    /// Stand-in for the native conference mixer slot this call occupies;
    /// derived from the call id since this crate has no native FFI of its own.
    slot_id: u32,
    torn_down: AtomicBool,
}

impl CallController {
    /// Lease a port from `pool` and build a controller in [`CallState::Ringing`].
    pub fn new(pool: Arc<PortPool>, inbound_codec: InboundCodec, speak_first: bool, session_rate_hz: u32) -> Self {
        let call_id = Uuid::new_v4();
        let started_at = Instant::now();
        let bridge = Arc::new(AudioBridge::new(session_rate_hz));
        let ready_event = Arc::new(Notify::new());
        let pull_source: Arc<dyn crate::port::PullSource> = bridge.clone();
        let port = pool.acquire(ready_event, Some(pull_source));
        let diagnostics = Arc::new(Mutex::new(CallDiagnostics::default()));
        diagnostics.lock().mark(DiagnosticPhase::Ring, started_at.elapsed());
        Self {
            call_id,
            state: Arc::new(Mutex::new(CallState::Ringing)),
            pool,
            port,
            bridge,
            started_at,
            diagnostics,
            router: Mutex::new(None),
            inbound_codec,
            speak_first,
            media_active_flag: Arc::new(AtomicBool::new(false)),
            slot_id: call_id.as_u128() as u32,
            torn_down: AtomicBool::new(false),
        }
    }

    /// This call's identifier.
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    fn transition(&self, next: CallState) -> Result<()> {
        debug!(call_id = %self.call_id, to = ?next, "call state transition");
        transition_state(&self.state, next)
    }

    fn mark_phase(&self, phase: DiagnosticPhase) {
        self.diagnostics.lock().mark(phase, self.started_at.elapsed());
    }

    /// SIP side answered (200 OK sent).
    pub fn on_answered(&self) -> Result<()> {
        self.transition(CallState::Answered)
    }

    /// Native media-active callback fired: the port is live on the SIP side.
    pub fn on_media_active(&self) -> Result<()> {
        self.mark_phase(DiagnosticPhase::MediaActive);
        self.media_active_flag.store(true, Ordering::Release);
        self.transition(CallState::MediaActive)
    }

    /// Open the realtime model session, prime playback, and start bridging.
    ///
    /// On `speak_first`, pushes silence frames immediately so the native
    /// jitter buffer has something to consume while waiting up to
    /// [`FIRST_FRAME_BARRIER_TIMEOUT`] for the first `onFrameRequested`, then
    /// asks the model to speak first instead of waiting for caller audio.
    pub async fn start(
        &self,
        ws_url: &str,
        api_key: &str,
        params: &SessionParams,
        router_config: EventRouterConfig,
        hooks: VoiceBridgeHooks,
    ) -> Result<()> {
        self.mark_phase(DiagnosticPhase::SessionCreate);

        if self.speak_first {
            self.bridge.send_prime_silence_direct(12);
        }

        let adapter = SessionAdapter::open(ws_url, api_key, params).await?;
        self.mark_phase(DiagnosticPhase::SdkConnect);

        let (mut writer, reader) = adapter.split();
        if self.speak_first {
            writer.response_create().await?;
            self.mark_phase(DiagnosticPhase::ResponseCreate);
        }

        self.transition(CallState::Primed)?;

        let first_packet_event = Arc::new(Notify::new());
        let rtp =
            RtpStreamProducer::new(self.port.clone(), self.inbound_codec, self.media_active_flag.clone(), first_packet_event.clone());

        tokio::spawn({
            let diagnostics = self.diagnostics.clone();
            let started_at = self.started_at;
            async move {
                first_packet_event.notified().await;
                diagnostics.lock().mark(DiagnosticPhase::FirstRtp, started_at.elapsed());
            }
        });

        let on_barge_in_started: Arc<dyn Fn() + Send + Sync> = {
            let state = self.state.clone();
            Arc::new(move || {
                if let Err(e) = transition_state(&state, CallState::Interrupting) {
                    warn!(error = %e, "failed to transition to interrupting on barge-in");
                }
            })
        };
        let on_barge_in_resolved: Arc<dyn Fn() + Send + Sync> = {
            let state = self.state.clone();
            let bridge = self.bridge.clone();
            Arc::new(move || {
                bridge.resume_after_interruption();
                if let Err(e) = transition_state(&state, CallState::Running) {
                    warn!(error = %e, "failed to transition to running after barge-in resolved");
                }
            })
        };

        let router = EventRouter::new(router_config, self.bridge.clone(), hooks);
        let handle = router.spawn(
            writer,
            reader,
            rtp,
            self.speak_first,
            self.diagnostics.clone(),
            self.started_at,
            on_barge_in_started,
            on_barge_in_resolved,
        );
        *self.router.lock() = Some(handle);

        self.bridge.enable_audio_output();
        self.transition(CallState::Running)
    }

    /// Caller barge-in detected: move to `interrupting` while the event
    /// router purges buffered assistant audio and cancels the response.
    pub fn on_barge_in_started(&self) -> Result<()> {
        self.transition(CallState::Interrupting)
    }

    /// Barge-in resolved: resume steady-state bridging.
    pub fn on_barge_in_resolved(&self) -> Result<()> {
        self.bridge.resume_after_interruption();
        self.transition(CallState::Running)
    }

    /// Whether the event router currently reports an active barge-in.
    pub fn is_barge_in_active(&self) -> bool {
        self.router.lock().as_ref().is_some_and(RouterHandle::is_barge_in_active)
    }

    /// Wait up to [`FIRST_FRAME_BARRIER_TIMEOUT`] for the native side to
    /// request at least one frame, so the caller can decide whether to
    /// proceed without `speak_first` priming.
    pub async fn wait_for_first_frame_requested(&self, ready_event: Arc<Notify>) -> Result<()> {
        tokio::time::timeout(FIRST_FRAME_BARRIER_TIMEOUT, ready_event.notified())
            .await
            .map_err(|_| Error::FirstFrameTimeout)
    }

    /// Tear the call down in the mandated order and return final stats.
    ///
    /// Order: stop the event router (closes the session transport), disable
    /// the port so the native side stops pulling frames, stop the bridge,
    /// release the conference slot, release the port back to the pool, then
    /// record aggregate stats. Idempotent: a second call returns the same
    /// stats without re-running any of the release steps.
    pub async fn teardown(&self, error: Option<String>) -> VoiceBridgeStats {
        self.transition(CallState::Terminated).ok();

        if self.torn_down.swap(true, Ordering::AcqRel) {
            let transcripts = self.router.lock().as_ref().map(RouterHandle::transcripts).unwrap_or_default();
            return VoiceBridgeStats {
                duration: self.started_at.elapsed(),
                inbound_audio_bytes: self.port.counters().received as u64 * crate::types::FRAME_BYTES_8K as u64,
                outbound_audio_bytes: self.bridge.outbound_bytes(),
                transcripts,
                error,
            };
        }

        if let Some(router) = self.router.lock().take() {
            router.stop().await;
        }

        self.port.disable();
        self.bridge.stop();

        if let Err(e) = check_conference_slot_release(self.slot_id, true) {
            warn!(call_id = %self.call_id, error = %e, "conference slot release failed during teardown");
        }

        self.pool.release(self.port.clone());

        self.transition(CallState::Closed).ok();

        let transcripts = self.router.lock().as_ref().map(RouterHandle::transcripts).unwrap_or_default();
        VoiceBridgeStats {
            duration: self.started_at.elapsed(),
            inbound_audio_bytes: self.port.counters().received as u64 * crate::types::FRAME_BYTES_8K as u64,
            outbound_audio_bytes: self.bridge.outbound_bytes(),
            transcripts,
            error,
        }
    }
}

/// A failed native "remove conference slot" call during teardown; the
/// conference slot is leaked and must be surfaced as a critical error rather
/// than silently swallowed.
pub fn check_conference_slot_release(slot_id: u32, native_result_ok: bool) -> Result<()> {
    if native_result_ok {
        Ok(())
    } else {
        warn!(slot_id, "native conference slot removal failed, slot is leaked");
        Err(Error::ConferenceSlotLeak { slot_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_are_accepted() {
        assert!(CallState::Ringing.can_transition_to(CallState::Answered));
        assert!(CallState::Running.can_transition_to(CallState::Interrupting));
        assert!(CallState::Interrupting.can_transition_to(CallState::Running));
        assert!(CallState::Terminated.can_transition_to(CallState::Closed));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert!(!CallState::Ringing.can_transition_to(CallState::Running));
        assert!(!CallState::Closed.can_transition_to(CallState::Ringing));
    }

    #[test]
    fn conference_slot_leak_is_surfaced_as_error() {
        assert!(check_conference_slot_release(7, true).is_ok());
        let err = check_conference_slot_release(7, false).unwrap_err();
        assert!(matches!(err, Error::ConferenceSlotLeak { slot_id: 7 }));
    }

    #[tokio::test]
    async fn controller_starts_in_ringing_and_transitions_to_media_active() {
        let pool = Arc::new(PortPool::new());
        let controller = CallController::new(pool, InboundCodec::Pcmu, false, 24_000);
        assert_eq!(controller.state(), CallState::Ringing);
        controller.on_answered().unwrap();
        controller.on_media_active().unwrap();
        assert_eq!(controller.state(), CallState::MediaActive);
    }
}
