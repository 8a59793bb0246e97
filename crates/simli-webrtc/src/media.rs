//! Audio capture framing and the media sink boundary
//!
//! The capture pipeline turns floating-point microphone audio (16 kHz
//! context) into the fixed 6000-byte signed 16-bit frames the service
//! consumes. Remote tracks arriving on the peer connection are handed to
//! a [`MediaSink`] implementation; this crate never renders media itself.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use webrtc::track::track_remote::TrackRemote;

/// Sample rate the capture context is expected to run at
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Samples per transmitted audio frame
pub const FRAME_SAMPLES: usize = 3000;

/// Bytes per transmitted audio frame (i16 little-endian)
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Consumer of remote media tracks
///
/// Implemented by the embedding application (render surfaces, recorders).
/// Handlers are invoked from the peer connection's callback context and
/// must not block.
pub trait MediaSink: Send + Sync {
    /// An incoming remote audio track became available
    fn on_audio_track(&self, track: Arc<TrackRemote>);

    /// An incoming remote video track became available
    fn on_video_track(&self, track: Arc<TrackRemote>);
}

/// Sink that drops all tracks; useful headless and in tests
pub struct NullMediaSink;

impl MediaSink for NullMediaSink {
    fn on_audio_track(&self, track: Arc<TrackRemote>) {
        debug!(id = %track.id(), "discarding remote audio track");
    }

    fn on_video_track(&self, track: Arc<TrackRemote>) {
        debug!(id = %track.id(), "discarding remote video track");
    }
}

/// The zero-filled primer frame sent immediately after session activation
pub fn primer_frame() -> Bytes {
    Bytes::from(vec![0u8; FRAME_BYTES])
}

/// Accumulates quantized samples and flushes exactly-full frames
///
/// Accumulation is strictly sequential: samples are never overlapped or
/// dropped within a buffer, and no partial frame is ever emitted.
pub struct AudioFrameBuffer {
    samples: Vec<i16>,
}

impl Default for AudioFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFrameBuffer {
    /// Create an empty frame buffer
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    /// Quantize a chunk of f32 samples, invoking `emit` for every frame
    /// that fills exactly
    pub fn push_samples(&mut self, input: &[f32], mut emit: impl FnMut(Bytes)) {
        for &sample in input {
            self.samples.push(quantize(sample));
            if self.samples.len() == FRAME_SAMPLES {
                emit(encode(&self.samples));
                self.samples.clear();
            }
        }
    }

    /// Number of samples currently buffered (always < FRAME_SAMPLES after
    /// `push_samples` returns)
    pub fn pending(&self) -> usize {
        self.samples.len()
    }
}

/// Quantize one f32 sample into the service's i16 range
fn quantize(sample: f32) -> i16 {
    (f64::from(sample) * 32767.0).round().clamp(-32768.0, 32767.0) as i16
}

fn encode(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(buf)
}

/// Pumps a microphone sample stream through the frame buffer
///
/// Constructed once per `listen_to_mediastream_track` call and torn down
/// during cleanup; dropping the pipeline aborts the pump task.
pub struct AudioCapturePipeline {
    task: JoinHandle<()>,
}

impl AudioCapturePipeline {
    /// Attach a microphone sample stream
    ///
    /// `frame_sink` is invoked once per completed 6000-byte frame; the
    /// task ends when the sample stream closes.
    pub fn attach<F>(mut samples: mpsc::Receiver<Vec<f32>>, frame_sink: F) -> Self
    where
        F: Fn(Bytes) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut buffer = AudioFrameBuffer::new();
            while let Some(chunk) = samples.recv().await {
                buffer.push_samples(&chunk, &frame_sink);
            }
            debug!("microphone sample stream ended");
        });

        Self { task }
    }

    /// Stop the pump task
    pub fn detach(&self) {
        self.task.abort();
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.task.abort();
    }
}
