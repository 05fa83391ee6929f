//! Audio data chunk with metadata.

use std::sync::Arc;
use std::time::Duration;

/// A discrete buffer of mixed audio with associated metadata.
///
/// `AudioChunk` is the unit of data handed from the mixing engine to
/// [`OutputManager::fan_out`](crate::OutputManager::fan_out). Each chunk
/// carries PCM samples plus the timing and format information destinations
/// need to frame their writes.
///
/// Samples are stored in an `Arc<Vec<i16>>` so that fan-out to many output
/// units shares one allocation. Chunks are read-only once handed to the
/// manager.
///
/// # Example
///
/// ```
/// use roomcast::AudioChunk;
/// use std::time::Duration;
///
/// let chunk = AudioChunk::new(vec![0i16; 1600], Duration::ZERO, 16000, 1);
/// assert_eq!(chunk.duration(), Duration::from_millis(100));
///
/// // Cheap clone - shares sample data
/// let chunk2 = chunk.clone();
/// assert_eq!(chunk2.byte_len(), 3200);
/// ```
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// PCM audio samples in 16-bit signed integer format.
    ///
    /// Wrapped in `Arc` for zero-copy sharing between output units.
    pub samples: Arc<Vec<i16>>,

    /// Timestamp from the start of the room session.
    pub timestamp: Duration,

    /// Sample rate in Hz (e.g., 44100, 48000).
    pub sample_rate: u32,

    /// Number of audio channels (1 = mono, 2 = stereo).
    pub channels: u16,
}

impl AudioChunk {
    /// Creates a new `AudioChunk` with the given parameters.
    pub fn new(samples: Vec<i16>, timestamp: Duration, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Arc::new(samples),
            timestamp,
            sample_rate,
            channels,
        }
    }

    /// Creates a new `AudioChunk` from pre-wrapped Arc samples.
    ///
    /// Useful when the producer already holds the samples behind an `Arc`.
    pub fn from_arc(
        samples: Arc<Vec<i16>>,
        timestamp: Duration,
        sample_rate: u32,
        channels: u16,
    ) -> Self {
        Self {
            samples,
            timestamp,
            sample_rate,
            channels,
        }
    }

    /// Returns the duration of this audio chunk.
    ///
    /// Calculated from the number of samples, sample rate, and channel count.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() / self.channels as usize;
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate))
    }

    /// Returns the number of audio frames in this chunk.
    ///
    /// A frame contains one sample per channel.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Returns the size of the sample payload in bytes (16-bit samples).
    ///
    /// This is the figure output statistics account in `bytes_written`.
    pub fn byte_len(&self) -> u64 {
        self.samples.len() as u64 * 2
    }

    /// Returns `true` if this chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_mono_16khz() {
        let chunk = AudioChunk::new(vec![0i16; 1600], Duration::ZERO, 16000, 1);
        assert_eq!(chunk.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_duration_stereo_48khz() {
        let chunk = AudioChunk::new(vec![0i16; 9600], Duration::ZERO, 48000, 2);
        // 9600 samples / 2 channels = 4800 frames / 48000 Hz = 100ms
        assert_eq!(chunk.duration(), Duration::from_millis(100));
    }

    #[test]
    fn test_frame_count() {
        let chunk = AudioChunk::new(vec![0i16; 200], Duration::ZERO, 16000, 2);
        assert_eq!(chunk.frame_count(), 100);
    }

    #[test]
    fn test_byte_len() {
        let chunk = AudioChunk::new(vec![0i16; 500], Duration::ZERO, 48000, 1);
        assert_eq!(chunk.byte_len(), 1000);
    }

    #[test]
    fn test_empty_chunk() {
        let chunk = AudioChunk::new(vec![], Duration::ZERO, 16000, 1);
        assert!(chunk.is_empty());
        assert_eq!(chunk.frame_count(), 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }

    #[test]
    fn test_zero_sample_rate() {
        let chunk = AudioChunk::new(vec![0i16; 100], Duration::ZERO, 0, 1);
        assert_eq!(chunk.duration(), Duration::ZERO);
    }

    #[test]
    fn test_zero_channels() {
        let chunk = AudioChunk::new(vec![0i16; 100], Duration::ZERO, 16000, 0);
        assert_eq!(chunk.duration(), Duration::ZERO);
        assert_eq!(chunk.frame_count(), 0);
    }
}
