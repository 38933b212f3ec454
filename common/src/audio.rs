//! Audio admission, decoding and resampling.
//!
//! WAV goes through `hound`, MP3 through `symphonia`.  Every decoder returns a
//! mono [`Waveform`] at the file's native rate; [`resample`] then brings it to
//! the configured target rate with rubato's FFT resampler.

use std::io::{Cursor, ErrorKind};
use std::path::Path;

use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Mono audio tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Containers accepted at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
}

/// Native rates outside this range are rejected before resampling.
pub const MIN_SAMPLE_RATE: u32 = 1_000;
pub const MAX_SAMPLE_RATE: u32 = 384_000;

const WAV_MIME: &[&str] = &["audio/wav", "audio/x-wav", "audio/wave"];
const MP3_MIME: &[&str] = &["audio/mpeg", "audio/mp3"];

impl AudioFormat {
    /// Admit an upload by its declared MIME type, falling back to the
    /// filename extension.
    pub fn from_declared(content_type: Option<&str>, filename: Option<&str>) -> Result<Self> {
        let filename = match filename {
            Some(f) if !f.trim().is_empty() => f,
            _ => return Err(PipelineError::decode("No file selected.")),
        };

        if let Some(ct) = content_type {
            let ct = ct.trim().to_ascii_lowercase();
            if WAV_MIME.contains(&ct.as_str()) {
                return Ok(Self::Wav);
            }
            if MP3_MIME.contains(&ct.as_str()) {
                return Ok(Self::Mp3);
            }
        }

        Self::from_extension(Path::new(filename))
            .ok_or_else(|| PipelineError::decode("Only WAV or MP3 files are supported."))
    }

    /// Format implied by a `.wav` / `.mp3` extension (case-insensitive).
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "wav" => Some(Self::Wav),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    /// Recognize the container from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Some(Self::Wav);
        }
        if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
            return Some(Self::Mp3);
        }
        // MPEG audio frame sync: 11 set bits.
        if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
            return Some(Self::Mp3);
        }
        None
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Wav => WAV_MIME[0],
            Self::Mp3 => MP3_MIME[0],
        }
    }
}

/// Decode an in-memory audio file to a mono waveform at its native rate.
///
/// The container is sniffed from the bytes; `declared` is used only when
/// sniffing is inconclusive.
pub fn decode(bytes: &[u8], declared: Option<AudioFormat>) -> Result<Waveform> {
    if bytes.is_empty() {
        return Err(PipelineError::decode("empty audio buffer"));
    }

    let format = AudioFormat::sniff(bytes)
        .or(declared)
        .ok_or_else(|| PipelineError::decode("unrecognized audio container"))?;

    let wave = match format {
        AudioFormat::Wav => decode_wav(bytes)?,
        AudioFormat::Mp3 => decode_mp3(bytes)?,
    };

    if wave.is_empty() {
        return Err(PipelineError::decode("audio contains no samples"));
    }
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&wave.sample_rate) {
        return Err(PipelineError::decode(format!(
            "unsupported sample rate {} Hz (expected {MIN_SAMPLE_RATE}..={MAX_SAMPLE_RATE})",
            wave.sample_rate
        )));
    }
    info!(
        "Decoded {:?}: {} mono samples at {} Hz ({:.2}s)",
        format,
        wave.len(),
        wave.sample_rate,
        wave.duration_seconds()
    );
    Ok(wave)
}

/// Read and decode an audio file, picking the decoder from its extension.
pub fn load_file(path: &Path) -> Result<Waveform> {
    let declared = AudioFormat::from_extension(path);
    let bytes = std::fs::read(path)?;
    decode(&bytes, declared)
        .map_err(|e| match e {
            PipelineError::Decode(msg) => {
                PipelineError::decode(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
}

fn decode_wav(bytes: &[u8]) -> Result<Waveform> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::decode(format!("cannot read WAV: {e}")))?;
    let spec = reader.spec();
    let n_channels = spec.channels as usize;
    if n_channels == 0 {
        return Err(PipelineError::decode("WAV declares zero channels"));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>(),
    }
    .map_err(|e| PipelineError::decode(format!("truncated WAV data: {e}")))?;

    debug!(
        "WAV: {} ch, {} bit {:?}, {} Hz",
        spec.channels, spec.bits_per_sample, spec.sample_format, spec.sample_rate
    );
    Ok(Waveform::new(
        downmix(&samples, n_channels),
        spec.sample_rate,
    ))
}

fn decode_mp3(bytes: &[u8]) -> Result<Waveform> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| PipelineError::decode(format!("cannot read MP3: {e}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| PipelineError::decode("MP3 has no audio track"))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| PipelineError::decode("MP3 has no sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| PipelineError::decode(format!("unsupported codec: {e}")))?;

    let mut mono = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(PipelineError::decode(format!("MP3 read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping corrupt MP3 frame: {e}");
                continue;
            }
            Err(e) => return Err(PipelineError::decode(format!("MP3 decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let n_channels = spec.channels.count();
        let capacity = decoded.capacity();
        if sample_buf
            .as_ref()
            .map_or(true, |b| b.capacity() < capacity * n_channels)
        {
            sample_buf = Some(SampleBuffer::new(capacity as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            mono.extend(downmix(buf.samples(), n_channels));
        }
    }

    Ok(Waveform::new(mono, sample_rate))
}

/// Average interleaved channels into one.
fn downmix(interleaved: &[f32], n_channels: usize) -> Vec<f32> {
    if n_channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(n_channels)
        .map(|frame| frame.iter().sum::<f32>() / n_channels as f32)
        .collect()
}

/// Bring `wave` to `target_sr`.  Identity when the rate already matches.
pub fn resample(wave: Waveform, target_sr: u32) -> Result<Waveform> {
    if wave.sample_rate == target_sr || wave.is_empty() {
        return Ok(Waveform::new(wave.samples, target_sr));
    }
    for rate in [wave.sample_rate, target_sr] {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
            return Err(PipelineError::decode(format!("cannot resample at {rate} Hz")));
        }
    }
    let samples = resample_fft(&wave.samples, wave.sample_rate, target_sr)?;
    Ok(Waveform::new(samples, target_sr))
}

/// Band-limited resampling of a mono signal from `sr_in` to `sr_out`.
///
/// Output length is `ceil(n * sr_out / sr_in)`; the resampler's group delay
/// is trimmed from the front.
fn resample_fft(input: &[f32], sr_in: u32, sr_out: u32) -> Result<Vec<f32>> {
    debug!("Resampling {} → {} Hz", sr_in, sr_out);

    let input_f64: Vec<f64> = input.iter().map(|&s| s as f64).collect();
    let expected =
        ((input.len() as u64 * sr_out as u64 + sr_in as u64 - 1) / sr_in as u64) as usize;

    let chunk_size = 1024;
    let sub_chunks = 2;
    let mut resampler =
        FftFixedIn::<f64>::new(sr_in as usize, sr_out as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| PipelineError::decode(format!("cannot resample {sr_in} Hz: {e}")))?;
    let delay = resampler.output_delay();

    let mut output: Vec<f64> = Vec::with_capacity(expected + delay + chunk_size);

    let frames_needed = resampler.input_frames_next();
    let mut pos = 0;
    while pos + frames_needed <= input_f64.len() {
        let chunk = vec![input_f64[pos..pos + frames_needed].to_vec()];
        let result = resampler
            .process(chunk.as_slice(), None)
            .map_err(|e| PipelineError::decode(format!("resampler error: {e}")))?;
        output.extend_from_slice(&result[0]);
        pos += frames_needed;
    }

    if pos < input_f64.len() {
        let remaining = vec![input_f64[pos..].to_vec()];
        let result = resampler
            .process_partial(Some(remaining.as_slice()), None)
            .map_err(|e| PipelineError::decode(format!("resampler error: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    // Flush the filter tail until the delayed output is complete.
    while output.len() < delay + expected {
        let result = resampler
            .process_partial(None::<&[Vec<f64>]>, None)
            .map_err(|e| PipelineError::decode(format!("resampler error: {e}")))?;
        if result[0].is_empty() {
            break;
        }
        output.extend_from_slice(&result[0]);
    }

    let mut out: Vec<f32> = output
        .into_iter()
        .skip(delay)
        .take(expected)
        .map(|s| s as f32)
        .collect();
    out.resize(expected, 0.0);
    Ok(out)
}
