//! RTP Stream Producer: turns inbound 8 kHz port frames into a stream of
//! [`RtpPacket`]s carrying 24 kHz PCM16 at the realtime-model session rate.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use rand::Rng;
use tokio::sync::Notify;
use tokio::time::{self, Interval};

use crate::codec::{decode_inbound, InboundCodec};
use crate::port::AudioPort;
use crate::resample::Resampler;
use crate::types::{RtpPacket, FRAME_BYTES_24K, SAMPLES_PER_FRAME_24K};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Accumulates upsampled bytes that don't yet add up to one full 24 kHz frame.
///
/// The resampler's output length per call isn't an exact multiple of
/// [`FRAME_BYTES_24K`], so a remainder is carried forward rather than
/// emitting ragged packets.
#[derive(Default)]
struct UpsampleRemainder {
    buf: Vec<u8>,
}

impl UpsampleRemainder {
    fn push(&mut self, bytes: Vec<u8>) {
        self.buf.extend(bytes);
    }

    fn take_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < FRAME_BYTES_24K {
            return None;
        }
        let frame = Bytes::from(self.buf[..FRAME_BYTES_24K].to_vec());
        self.buf.drain(..FRAME_BYTES_24K);
        Some(frame)
    }
}

/// Polls an [`AudioPort`] for inbound frames, decodes and upsamples them to
/// 24 kHz, and yields [`RtpPacket`]s with monotonically increasing sequence
/// number and timestamp.
///
/// Yields nothing until `media_active` is set, so pre-media noise captured
/// by the native stack before the call is actually bridged never reaches the
/// model. `first_packet_event` is notified once, the moment the very first
/// real packet is produced, so the call controller can record a diagnostics
/// phase for it.
pub struct RtpStreamProducer {
    port: Arc<AudioPort>,
    codec: InboundCodec,
    resampler: Resampler,
    remainder: UpsampleRemainder,
    sequence_number: u16,
    timestamp: u32,
    ticker: Interval,
    media_active: Arc<AtomicBool>,
    first_packet_event: Arc<Notify>,
    first_packet_signaled: bool,
}

impl RtpStreamProducer {
    /// Build a producer pulling from `port`, decoding `codec`, upsampling 8→24 kHz.
    ///
    /// `media_active` gates the first yielded packet; `first_packet_event`
    /// is notified exactly once, on the first packet actually produced.
    pub fn new(
        port: Arc<AudioPort>,
        codec: InboundCodec,
        media_active: Arc<AtomicBool>,
        first_packet_event: Arc<Notify>,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            port,
            codec,
            resampler: Resampler::new(8_000, 24_000),
            remainder: UpsampleRemainder::default(),
            sequence_number: rng.gen(),
            timestamp: rng.gen(),
            ticker: time::interval(POLL_INTERVAL),
            media_active,
            first_packet_event,
            first_packet_signaled: false,
        }
    }

    fn next_packet(&mut self, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            payload,
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
            payload_type: match self.codec {
                InboundCodec::Pcm16 => 97,
                InboundCodec::Pcmu => 0,
                InboundCodec::Pcma => 8,
            },
            marker: self.sequence_number == 0,
        };
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME_24K);
        packet
    }

    fn emit_first_packet(&mut self, payload: Bytes) -> RtpPacket {
        if !self.first_packet_signaled {
            self.first_packet_signaled = true;
            self.first_packet_event.notify_waiters();
        }
        self.next_packet(payload)
    }
}

impl Stream for RtpStreamProducer {
    type Item = RtpPacket;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if !this.media_active.load(Ordering::Acquire) {
            return match Pin::new(&mut this.ticker).poll_tick(cx) {
                Poll::Ready(_) => {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Poll::Pending => Poll::Pending,
            };
        }

        if let Some(frame) = this.remainder.take_frame() {
            return Poll::Ready(Some(this.emit_first_packet(frame)));
        }

        loop {
            if let Some(raw) = this.port.get_frame() {
                let pcm8k = decode_inbound(this.codec, &raw);
                if !pcm8k.is_empty() {
                    let upsampled = this.resampler.resample(&pcm8k);
                    this.remainder.push(upsampled);
                }
                if let Some(frame) = this.remainder.take_frame() {
                    return Poll::Ready(Some(this.emit_first_packet(frame)));
                }
                continue;
            }
            break;
        }

        match Pin::new(&mut this.ticker).poll_tick(cx) {
            Poll::Ready(_) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::g711;

    #[test]
    fn poll_next_is_pending_while_media_inactive() {
        let port = Arc::new(AudioPort::new());
        let media_active = Arc::new(AtomicBool::new(false));
        let first_packet_event = Arc::new(Notify::new());
        let producer = RtpStreamProducer::new(port, InboundCodec::Pcmu, media_active, first_packet_event);
        let mut task = tokio_test::task::spawn(producer);
        tokio_test::assert_pending!(task.enter(|cx, producer| producer.poll_next(cx)));
    }

    #[tokio::test(start_paused = true)]
    async fn yields_packets_with_monotonic_sequence_and_timestamp() {
        let port = Arc::new(AudioPort::new());
        for _ in 0..5 {
            let pcm = vec![0i16; 160];
            let mut bytes = Vec::with_capacity(160);
            for s in pcm {
                bytes.push(g711::encode_ulaw(s));
            }
            port.on_frame_received(Bytes::from(bytes));
        }

        let media_active = Arc::new(AtomicBool::new(true));
        let first_packet_event = Arc::new(Notify::new());
        let mut producer = RtpStreamProducer::new(port, InboundCodec::Pcmu, media_active, first_packet_event);
        let first = futures::StreamExt::next(&mut producer).await.unwrap();
        let second = futures::StreamExt::next(&mut producer).await.unwrap();

        assert_eq!(first.payload.len(), FRAME_BYTES_24K);
        assert_eq!(second.sequence_number, first.sequence_number.wrapping_add(1));
        assert_eq!(second.timestamp, first.timestamp.wrapping_add(SAMPLES_PER_FRAME_24K));
    }

    #[tokio::test(start_paused = true)]
    async fn no_packets_are_produced_before_media_active() {
        let port = Arc::new(AudioPort::new());
        let pcm = vec![0i16; 160];
        let mut bytes = Vec::with_capacity(160);
        for s in pcm {
            bytes.push(g711::encode_ulaw(s));
        }
        port.on_frame_received(Bytes::from(bytes));

        let media_active = Arc::new(AtomicBool::new(false));
        let first_packet_event = Arc::new(Notify::new());
        let mut producer = RtpStreamProducer::new(port, InboundCodec::Pcmu, media_active.clone(), first_packet_event);

        let result = tokio::time::timeout(Duration::from_millis(200), futures::StreamExt::next(&mut producer)).await;
        assert!(result.is_err(), "producer must not yield before media_active is set");

        media_active.store(true, Ordering::Release);
        let packet = tokio::time::timeout(Duration::from_millis(200), futures::StreamExt::next(&mut producer))
            .await
            .expect("producer should yield once media_active is set")
            .unwrap();
        assert_eq!(packet.payload.len(), FRAME_BYTES_24K);
    }

    #[test]
    fn remainder_accumulates_until_full_frame() {
        let mut remainder = UpsampleRemainder::default();
        remainder.push(vec![0u8; FRAME_BYTES_24K - 10]);
        assert!(remainder.take_frame().is_none());
        remainder.push(vec![0u8; 10]);
        assert!(remainder.take_frame().is_some());
    }
}
