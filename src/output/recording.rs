//! Local recording transport writing WAV or raw PCM to disk.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::chunk::AudioChunk;
use crate::config::{RecordingConfig, RecordingFormat};
use crate::error::TransportError;
use crate::output::OutputTransport;

// WAV file format constants
// See: http://soundfile.sapp.org/doc/WaveFormat/

/// Byte offset of the file size field in WAV header (RIFF chunk size).
const WAV_FILE_SIZE_OFFSET: u64 = 4;

/// Byte offset of the data chunk size field in WAV header.
const WAV_DATA_SIZE_OFFSET: u64 = 40;

/// Size of the WAV header in bytes (RIFF + fmt + data chunk headers).
const WAV_HEADER_SIZE: usize = 44;

/// Size of the fmt chunk data (16 bytes for PCM).
const WAV_FMT_CHUNK_SIZE: u32 = 16;

/// Audio format code for PCM (uncompressed).
const WAV_FORMAT_PCM: u16 = 1;

/// Bits per sample for 16-bit audio.
const WAV_BITS_PER_SAMPLE: u16 = 16;

/// Bytes per sample (16-bit = 2 bytes).
const BYTES_PER_SAMPLE: u64 = 2;

/// The built-in transport for `recording` destinations.
///
/// Writes the room's mixed audio to sequence files under the configured
/// directory, as WAV (header finalized on close/rotation) or headerless
/// PCM. When a rotation interval is configured, a new sequence file is
/// opened once the current one covers that much audio.
///
/// All file I/O runs on the blocking thread pool so the unit worker's
/// async loop is never stalled by disk latency.
pub struct RecordingTransport {
    name: String,
    stem: String,
    config: RecordingConfig,
    state: Arc<Mutex<RecState>>,
}

struct RecState {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    file_index: u32,
    samples_written: u64,
    /// Audio time covered by the current file.
    file_audio: Duration,
    sample_rate: u32,
    channels: u16,
}

impl RecordingTransport {
    /// Creates a transport for the given destination name and config.
    ///
    /// `name` becomes the file stem: `<directory>/<name>-NNN.wav`.
    pub fn new(name: impl Into<String>, config: RecordingConfig) -> Self {
        let name = name.into();
        let stem: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        Self {
            name: format!("recording:{name}"),
            stem,
            config,
            state: Arc::new(Mutex::new(RecState {
                writer: None,
                path: PathBuf::new(),
                file_index: 0,
                samples_written: 0,
                file_audio: Duration::ZERO,
                sample_rate: 0,
                channels: 0,
            })),
        }
    }

    fn extension(format: RecordingFormat) -> &'static str {
        match format {
            RecordingFormat::Wav => "wav",
            RecordingFormat::Raw => "pcm",
        }
    }

    /// Writes a complete WAV header with the given parameters.
    fn write_wav_header(
        writer: &mut BufWriter<File>,
        sample_rate: u32,
        channels: u16,
        data_size: u32,
    ) -> std::io::Result<()> {
        // RIFF container header
        writer.write_all(b"RIFF")?;
        let file_size = WAV_HEADER_SIZE as u32 - 8 + data_size;
        writer.write_all(&file_size.to_le_bytes())?;
        writer.write_all(b"WAVE")?;

        // fmt subchunk
        writer.write_all(b"fmt ")?;
        writer.write_all(&WAV_FMT_CHUNK_SIZE.to_le_bytes())?;
        writer.write_all(&WAV_FORMAT_PCM.to_le_bytes())?;
        writer.write_all(&channels.to_le_bytes())?;
        writer.write_all(&sample_rate.to_le_bytes())?;

        let bytes_per_sample = WAV_BITS_PER_SAMPLE / 8;
        let byte_rate = sample_rate * u32::from(channels) * u32::from(bytes_per_sample);
        writer.write_all(&byte_rate.to_le_bytes())?;

        let block_align = channels * bytes_per_sample;
        writer.write_all(&block_align.to_le_bytes())?;
        writer.write_all(&WAV_BITS_PER_SAMPLE.to_le_bytes())?;

        // data subchunk header
        writer.write_all(b"data")?;
        writer.write_all(&data_size.to_le_bytes())?;

        Ok(())
    }

    /// Seeks back and patches the size fields with the final data size.
    fn update_wav_header(writer: &mut BufWriter<File>, data_size: u32) -> std::io::Result<()> {
        let file_size = WAV_HEADER_SIZE as u32 - 8 + data_size;
        writer.seek(SeekFrom::Start(WAV_FILE_SIZE_OFFSET))?;
        writer.write_all(&file_size.to_le_bytes())?;

        writer.seek(SeekFrom::Start(WAV_DATA_SIZE_OFFSET))?;
        writer.write_all(&data_size.to_le_bytes())?;

        writer.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Opens the next sequence file, writing a placeholder header for WAV.
    fn open_next_file(
        state: &mut RecState,
        stem: &str,
        config: &RecordingConfig,
    ) -> Result<(), TransportError> {
        let path = config.directory.join(format!(
            "{stem}-{:03}.{}",
            state.file_index,
            Self::extension(config.format)
        ));
        let file = File::create(&path).map_err(|e| TransportError::file(&path, e))?;
        let mut writer = BufWriter::new(file);

        if config.format == RecordingFormat::Wav {
            Self::write_wav_header(&mut writer, state.sample_rate, state.channels, 0)
                .map_err(|e| TransportError::file(&path, e))?;
        }

        debug!(path = %path.display(), "recording file opened");
        state.writer = Some(writer);
        state.path = path;
        state.file_index += 1;
        state.samples_written = 0;
        state.file_audio = Duration::ZERO;
        Ok(())
    }

    /// Finalizes the current file (patches the WAV header, flushes).
    fn finalize_file(state: &mut RecState, format: RecordingFormat) -> Result<(), TransportError> {
        let data_size = (state.samples_written * BYTES_PER_SAMPLE) as u32;
        if let Some(ref mut writer) = state.writer {
            if format == RecordingFormat::Wav {
                Self::update_wav_header(writer, data_size)
                    .map_err(|e| TransportError::file(&state.path, e))?;
            }
            writer
                .flush()
                .map_err(|e| TransportError::file(&state.path, e))?;
        }
        state.writer = None;
        Ok(())
    }

    /// Appends one chunk, opening/rotating files as needed.
    fn write_blocking(
        state: &mut RecState,
        stem: &str,
        config: &RecordingConfig,
        chunk: &AudioChunk,
    ) -> Result<(), TransportError> {
        if state.writer.is_none() {
            state.sample_rate = chunk.sample_rate;
            state.channels = chunk.channels;
            Self::open_next_file(state, stem, config)?;
        }

        if let Some(ref mut writer) = state.writer {
            for sample in chunk.samples.iter() {
                writer
                    .write_all(&sample.to_le_bytes())
                    .map_err(|e| TransportError::file(&state.path, e))?;
            }
            state.samples_written += chunk.samples.len() as u64;
            state.file_audio += chunk.duration();
        }

        if let Some(limit) = config.max_file_duration {
            if state.file_audio >= limit {
                Self::finalize_file(state, config.format)?;
                Self::open_next_file(state, stem, config)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutputTransport for RecordingTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let directory = self.config.directory.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&directory).map_err(|e| TransportError::file(&directory, e))
        })
        .await
        .map_err(|e| TransportError::transient(format!("connect task panicked: {e}")))??;

        // Files open lazily on first write, when the chunk format is known.
        Ok(())
    }

    async fn write(&mut self, chunk: &AudioChunk) -> Result<(), TransportError> {
        trace!(
            "{}: writing {} samples, ts={:?}",
            self.name,
            chunk.samples.len(),
            chunk.timestamp
        );

        let state = Arc::clone(&self.state);
        let stem = self.stem.clone();
        let config = self.config.clone();
        let chunk = chunk.clone();

        tokio::task::spawn_blocking(move || {
            let mut state = state.blocking_lock();
            Self::write_blocking(&mut state, &stem, &config, &chunk)
        })
        .await
        .map_err(|e| TransportError::transient(format!("write task panicked: {e}")))?
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let state = Arc::clone(&self.state);
        let format = self.config.format;

        tokio::task::spawn_blocking(move || {
            let mut state = state.blocking_lock();
            Self::finalize_file(&mut state, format)
        })
        .await
        .map_err(|e| TransportError::transient(format!("finalize task panicked: {e}")))?
    }
}
