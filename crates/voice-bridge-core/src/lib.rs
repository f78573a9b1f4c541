//! SIP-to-realtime voice bridge core.
//!
//! Bridges PSTN/SIP audio to a realtime speech model: decodes and resamples
//! inbound RTP into the model's session rate, buffers and catch-up-stretches
//! the model's synthesized speech back down to telephony rate, and drives
//! the per-call lifecycle between the two.

pub mod bridge;
pub mod call;
pub mod codec;
pub mod config;
pub mod error;
pub mod event_router;
pub mod port;
pub mod resample;
pub mod rtp_producer;
pub mod session;
pub mod timestretch;
pub mod types;

pub use error::{Error, Result};

/// Commonly used types, re-exported for `use rvoip_voice_bridge_core::prelude::*`.
pub mod prelude {
    pub use crate::bridge::AudioBridge;
    pub use crate::call::{CallController, CallState};
    pub use crate::codec::InboundCodec;
    pub use crate::config::{EventRouterConfig, SessionParams};
    pub use crate::error::{Error, Result};
    pub use crate::event_router::EventRouter;
    pub use crate::port::pool::PortPool;
    pub use crate::port::AudioPort;
    pub use crate::rtp_producer::RtpStreamProducer;
    pub use crate::session::SessionAdapter;
    pub use crate::types::{
        CallDiagnostics, DiagnosticPhase, DiagnosticsHistory, RtpPacket, SampleRate, TranscriptEntry, TranscriptRole,
        VoiceBridgeHooks, VoiceBridgeMetrics, VoiceBridgeMetricsRecorder, VoiceBridgeStats,
    };
}
