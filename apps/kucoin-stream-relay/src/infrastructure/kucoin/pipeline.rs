//! Feed Pipeline
//!
//! classify → decode → publish, for one raw frame at a time. Shared by all
//! upstream sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::classifier::classify;
use super::codec::{DecodeError, FrameDecoder};
use super::session::RawFrame;
use crate::application::ports::{EventPublisher, PublishReport};
use crate::domain::market::EventKind;
use crate::infrastructure::metrics;

/// What happened to a frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Decoded and handed to the publisher.
    Published {
        /// Event kind.
        kind: EventKind,
        /// Fan-out result.
        report: PublishReport,
    },
    /// Market frame that failed to decode; dropped.
    Dropped(DecodeError),
    /// Control or unknown frame; ignored.
    Unclassified,
}

/// Pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PipelineStats {
    /// Frames seen.
    pub frames_received: u64,
    /// Events handed to the publisher.
    pub events_published: u64,
    /// Frames dropped on decode failure.
    pub decode_errors: u64,
    /// Control or unknown frames.
    pub unclassified: u64,
}

/// Frame-to-event pipeline.
pub struct FeedPipeline {
    decoder: FrameDecoder,
    publisher: Arc<dyn EventPublisher>,
    frames_received: AtomicU64,
    events_published: AtomicU64,
    decode_errors: AtomicU64,
    unclassified: AtomicU64,
}

impl FeedPipeline {
    /// Create a pipeline publishing through `publisher`.
    #[must_use]
    pub fn new(decoder: FrameDecoder, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            decoder,
            publisher,
            frames_received: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            unclassified: AtomicU64::new(0),
        }
    }

    /// Run one frame through the pipeline.
    pub fn process(&self, frame: &RawFrame) -> FrameOutcome {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let path = classify(frame.as_str());
        metrics::record_frame_received(path.as_str());

        match self.decoder.decode(path, frame.as_str()) {
            Ok(Some(event)) => {
                let report = self.publisher.publish(&event);
                self.events_published.fetch_add(1, Ordering::Relaxed);
                metrics::record_event_published(event.kind().as_str());
                metrics::record_delivery_losses(report.dropped, report.disconnected);
                FrameOutcome::Published {
                    kind: event.kind(),
                    report,
                }
            }
            Ok(None) => {
                self.unclassified.fetch_add(1, Ordering::Relaxed);
                FrameOutcome::Unclassified
            }
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_decode_error(e.reason());
                tracing::debug!(
                    path = path.as_str(),
                    error = %e,
                    "Dropping undecodable frame"
                );
                FrameOutcome::Dropped(e)
            }
        }
    }

    /// Get counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unclassified: self.unclassified.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::domain::market::MarketEvent;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<MarketEvent>>,
    }

    impl EventPublisher for Recorder {
        fn publish(&self, event: &MarketEvent) -> PublishReport {
            self.events.lock().push(event.clone());
            PublishReport {
                delivered: 1,
                ..PublishReport::default()
            }
        }
    }

    fn pipeline() -> (FeedPipeline, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let publisher: Arc<dyn EventPublisher> = recorder.clone();
        (FeedPipeline::new(FrameDecoder::default(), publisher), recorder)
    }

    #[test]
    fn ticker_frame_is_published() {
        let (pipeline, recorder) = pipeline();
        let frame = RawFrame::new(
            r#"{"type":"message","topic":"/market/ticker:all","subject":"BTC-USDT","data":{"bestAsk":"2","bestBid":"1","time":5}}"#,
        );

        let outcome = pipeline.process(&frame);
        assert!(matches!(
            outcome,
            FrameOutcome::Published {
                kind: EventKind::Ticker,
                ..
            }
        ));
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[test]
    fn bad_frame_is_dropped_not_published() {
        let (pipeline, recorder) = pipeline();
        let frame = RawFrame::new(
            r#"{"type":"message","topic":"/market/candles:BTC-USDT_1min","data":{"symbol":"BTC-USDT","candles":["1","2"]}}"#,
        );

        assert!(matches!(pipeline.process(&frame), FrameOutcome::Dropped(_)));
        assert!(recorder.events.lock().is_empty());
        assert_eq!(pipeline.stats().decode_errors, 1);
    }

    #[test]
    fn control_frames_are_ignored() {
        let (pipeline, recorder) = pipeline();
        pipeline.process(&RawFrame::new(r#"{"id":"1","type":"ack"}"#));

        assert!(recorder.events.lock().is_empty());
        assert_eq!(
            pipeline.stats(),
            PipelineStats {
                frames_received: 1,
                unclassified: 1,
                ..PipelineStats::default()
            }
        );
    }
}
