//! Audio normalization: decode, mix down to mono, resample and cut a fixed window.
//!
//! Every stage is a [`SampleSource`]: a single-pass, pull-based stream of
//! interleaved `f32` frames. Adapters own their upstream by value, so the
//! decoder (and its file handle) is dropped with the last adapter on every
//! exit path.

use crate::error::{BirdclipError, Result};
use ndarray::ArrayView2;
use rubato::{FftFixedIn, Resampler as _};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Samples requested per pull by the window assembler.
pub const READ_CHUNK: usize = 4096;

/// Input block size handed to the FFT resampler.
const RESAMPLE_CHUNK: usize = 1024;

/// A pull-based stream of interleaved samples in [-1.0, 1.0].
pub trait SampleSource {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> usize;

    /// Fill `out` with up to `out.len() / channels()` whole frames.
    ///
    /// Returns the number of samples written (always a multiple of the channel
    /// count). Fewer than requested means the stream is near its end; zero
    /// means it is exhausted. Nothing past the returned count is written.
    fn read(&mut self, out: &mut [f32]) -> Result<usize>;
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn sample_rate(&self) -> u32 {
        (**self).sample_rate()
    }
    fn channels(&self) -> usize {
        (**self).channels()
    }
    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        (**self).read(out)
    }
}

fn whole_frames(len: usize, channels: usize) -> Result<usize> {
    if len < channels {
        return Err(BirdclipError::normalize(format!(
            "read buffer of {len} samples cannot hold a {channels}-channel frame"
        )));
    }
    Ok(len / channels * channels)
}

// ---------------- Sources ----------------

/// Decodes any symphonia-supported container from disk.
pub struct AudioFileReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    pending: Vec<f32>,
    cursor: usize,
    finished: bool,
    stats: DecodeStats,
}

/// Packet outcomes for one stream, to tell a corrupt file from a silent one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DecodeStats {
    skipped_packets: usize,
    frames_decoded: u64,
}

impl DecodeStats {
    /// Check made once the stream ends.
    fn finish(&self) -> Result<()> {
        if self.frames_decoded == 0 && self.skipped_packets > 0 {
            return Err(BirdclipError::decode(format!(
                "no frames decoded, {} corrupt packets skipped",
                self.skipped_packets
            )));
        }
        Ok(())
    }
}

impl AudioFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| BirdclipError::open(format!("{}: {e}", path.display())))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| BirdclipError::open(format!("{}: probe failed: {e}", path.display())))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                BirdclipError::open(format!("{}: no audio track", path.display()))
            })?;
        let track_id = track.id;
        let declared_rate = track.codec_params.sample_rate;
        let declared_channels = track.codec_params.channels.map(|c| c.count());

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| BirdclipError::open(format!("{}: no decoder: {e}", path.display())))?;

        let mut reader = Self {
            format,
            decoder,
            track_id,
            sample_rate: declared_rate.unwrap_or(0),
            channels: declared_channels.unwrap_or(0),
            pending: Vec::new(),
            cursor: 0,
            finished: false,
            stats: DecodeStats::default(),
        };

        // Some containers only reveal the signal layout once a packet is decoded.
        if reader.sample_rate == 0 || reader.channels == 0 {
            reader.fill_pending()?;
        }
        if reader.sample_rate == 0 || reader.channels == 0 {
            return Err(BirdclipError::open(format!(
                "{}: unknown sample rate or channel layout",
                path.display()
            )));
        }

        debug!(
            path = %path.display(),
            sample_rate = reader.sample_rate,
            channels = reader.channels,
            "opened audio source"
        );
        Ok(reader)
    }

    /// Decode the next packet of our track into `pending`. Returns false at end of stream.
    fn fill_pending(&mut self) -> Result<bool> {
        while !self.finished {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.finished = true;
                    break;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.finished = true;
                    break;
                }
                Err(e) => return Err(BirdclipError::decode(format!("packet read failed: {e}"))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("skipping corrupt packet: {e}");
                    self.stats.skipped_packets += 1;
                    continue;
                }
                Err(e) => return Err(BirdclipError::decode(format!("decode failed: {e}"))),
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            if self.channels == 0 {
                self.channels = channels;
            } else if self.channels != channels {
                return Err(BirdclipError::decode(format!(
                    "channel count changed mid-stream ({} -> {channels})",
                    self.channels
                )));
            }
            if self.sample_rate == 0 {
                self.sample_rate = spec.rate;
            }
            if decoded.frames() == 0 {
                continue;
            }

            self.stats.frames_decoded += decoded.frames() as u64;
            let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);
            self.pending.clear();
            self.pending.extend_from_slice(samples.samples());
            self.cursor = 0;
            return Ok(true);
        }
        self.stats.finish()?;
        Ok(false)
    }
}

impl SampleSource for AudioFileReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let want = whole_frames(out.len(), self.channels)?;
        let mut written = 0;
        while written < want {
            if self.cursor == self.pending.len() {
                if !self.fill_pending()? {
                    break;
                }
                continue;
            }
            let n = (want - written).min(self.pending.len() - self.cursor);
            out[written..written + n].copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            written += n;
            self.cursor += n;
        }
        Ok(written)
    }
}

/// PCM that is already in memory, interleaved.
#[derive(Debug, Clone)]
pub struct InterleavedSource {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: usize,
    cursor: usize,
}

impl InterleavedSource {
    /// Trailing samples that do not form a whole frame are dropped.
    pub fn new(mut samples: Vec<f32>, sample_rate: u32, channels: usize) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(BirdclipError::open(format!(
                "invalid layout: {sample_rate} Hz, {channels} channels"
            )));
        }
        samples.truncate(samples.len() / channels * channels);
        Ok(Self {
            samples,
            sample_rate,
            channels,
            cursor: 0,
        })
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        Self::new(samples, sample_rate, 1)
    }
}

impl SampleSource for InterleavedSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let want = whole_frames(out.len(), self.channels)?;
        let n = want.min(self.samples.len() - self.cursor);
        out[..n].copy_from_slice(&self.samples[self.cursor..self.cursor + n]);
        self.cursor += n;
        Ok(n)
    }
}

// ---------------- Channel reduction ----------------

/// Averages each frame across channels. Identity for mono input.
pub struct ChannelReducer<S> {
    inner: S,
    scratch: Vec<f32>,
}

impl<S: SampleSource> ChannelReducer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            scratch: Vec::new(),
        }
    }
}

impl<S: SampleSource> SampleSource for ChannelReducer<S> {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn channels(&self) -> usize {
        1
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let channels = self.inner.channels();
        if channels == 1 {
            return self.inner.read(out);
        }
        self.scratch.resize(out.len() * channels, 0.0);
        let n = self.inner.read(&mut self.scratch)?;
        let frames = n / channels;
        for (dst, frame) in out
            .iter_mut()
            .zip(self.scratch[..frames * channels].chunks_exact(channels))
        {
            *dst = frame.iter().sum::<f32>() / channels as f32;
        }
        Ok(frames)
    }
}

// ---------------- Resampling ----------------

/// Band-limited rate conversion of a mono stream. Identity when rates match.
pub struct Resampler<S> {
    inner: S,
    target_rate: u32,
    fft: Option<FftStage>,
}

struct FftStage {
    engine: FftFixedIn<f32>,
    input: Vec<f32>,
    queue: VecDeque<f32>,
    /// Filter delay still to discard, in output frames.
    skip: usize,
    frames_in: u64,
    frames_out: u64,
    /// Output length owed once upstream is exhausted.
    limit: Option<u64>,
}

impl<S: SampleSource> Resampler<S> {
    pub fn new(inner: S, target_rate: u32) -> Result<Self> {
        if inner.channels() != 1 {
            return Err(BirdclipError::normalize(format!(
                "resampler expects mono input, got {} channels",
                inner.channels()
            )));
        }
        let native_rate = inner.sample_rate();
        let fft = if native_rate == target_rate {
            None
        } else {
            debug!(from = native_rate, to = target_rate, "resampling");
            let engine = FftFixedIn::<f32>::new(
                native_rate as usize,
                target_rate as usize,
                RESAMPLE_CHUNK,
                2,
                1,
            )
            .map_err(|e| {
                BirdclipError::normalize(format!(
                    "cannot resample {native_rate} Hz -> {target_rate} Hz: {e}"
                ))
            })?;
            Some(FftStage {
                skip: engine.output_delay(),
                engine,
                input: Vec::with_capacity(RESAMPLE_CHUNK),
                queue: VecDeque::new(),
                frames_in: 0,
                frames_out: 0,
                limit: None,
            })
        };
        Ok(Self {
            inner,
            target_rate,
            fft,
        })
    }
}

impl FftStage {
    fn push(&mut self, block: &[f32]) {
        for &sample in block {
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            self.queue.push_back(sample);
            self.frames_out += 1;
        }
        if let Some(limit) = self.limit {
            while self.frames_out > limit && self.queue.pop_back().is_some() {
                self.frames_out -= 1;
            }
        }
    }

    fn done(&self) -> bool {
        matches!(self.limit, Some(limit) if self.frames_out >= limit)
    }

    /// Run one resampler block, pulling from upstream until it is exhausted.
    fn refill<S: SampleSource>(&mut self, inner: &mut S, native: u32, target: u32) -> Result<()> {
        if self.limit.is_some() {
            let flushed = self
                .engine
                .process_partial(None::<&[Vec<f32>]>, None)
                .map_err(|e| BirdclipError::normalize(format!("resampler flush failed: {e}")))?;
            self.push(&flushed[0]);
            return Ok(());
        }

        let need = self.engine.input_frames_next();
        self.input.resize(need, 0.0);
        let mut filled = 0;
        while filled < need {
            let n = inner.read(&mut self.input[filled..need])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.frames_in += filled as u64;

        if filled == need {
            let block = self
                .engine
                .process(&[&self.input[..]], None)
                .map_err(|e| BirdclipError::normalize(format!("resampler failed: {e}")))?;
            self.push(&block[0]);
            return Ok(());
        }

        let (native, target) = (native as u64, target as u64);
        self.limit = Some((self.frames_in * target + native - 1) / native);
        if filled > 0 {
            let block = self
                .engine
                .process_partial(Some(&[&self.input[..filled]]), None)
                .map_err(|e| BirdclipError::normalize(format!("resampler failed: {e}")))?;
            self.push(&block[0]);
        } else {
            self.push(&[]);
        }
        Ok(())
    }
}

impl<S: SampleSource> SampleSource for Resampler<S> {
    fn sample_rate(&self) -> u32 {
        self.target_rate
    }

    fn channels(&self) -> usize {
        1
    }

    fn read(&mut self, out: &mut [f32]) -> Result<usize> {
        let native = self.inner.sample_rate();
        let Some(stage) = self.fft.as_mut() else {
            return self.inner.read(out);
        };
        let mut written = 0;
        while written < out.len() {
            if let Some(sample) = stage.queue.pop_front() {
                out[written] = sample;
                written += 1;
                continue;
            }
            if stage.done() {
                break;
            }
            stage.refill(&mut self.inner, native, self.target_rate)?;
        }
        Ok(written)
    }
}

// ---------------- Fixed window ----------------

/// Exactly `len` mono samples at `sample_rate`, ready for the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl NormalizedBuffer {
    /// An all-zero window, the engine's baseline input.
    pub fn silence(len: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0.0; len],
            sample_rate,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Window viewed as a `[1, N]` batch.
    pub fn batch_view(&self) -> ArrayView2<'_, f32> {
        ArrayView2::from_shape((1, self.samples.len()), &self.samples)
            .expect("a contiguous vec always fits a 1xN view")
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.samples
    }

    /// Write the window as a mono 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let to_io = |e: hound::Error| std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
        let mut writer = hound::WavWriter::create(path, spec).map_err(to_io)?;
        for &sample in &self.samples {
            writer.write_sample(sample).map_err(to_io)?;
        }
        writer.finalize().map_err(to_io)?;
        Ok(())
    }
}

/// Pull exactly `len` samples from a mono source.
///
/// Stops pulling as soon as the window is full; a source that runs dry early
/// is followed by silence.
pub fn assemble_window<S: SampleSource + ?Sized>(
    source: &mut S,
    len: usize,
) -> Result<NormalizedBuffer> {
    if source.channels() != 1 {
        return Err(BirdclipError::normalize(format!(
            "window needs mono input, got {} channels",
            source.channels()
        )));
    }
    let mut samples = vec![0.0f32; len];
    let mut index = 0;
    while index < len {
        let want = READ_CHUNK.min(len - index);
        let read = source.read(&mut samples[index..index + want])?;
        if read == 0 {
            break;
        }
        index += read;
    }
    samples[index..].fill(0.0);
    if index < len {
        debug!(collected = index, padded = len - index, "short clip, padding with silence");
    }
    Ok(NormalizedBuffer {
        samples,
        sample_rate: source.sample_rate(),
    })
}

/// Mix down, resample and window any source.
pub fn normalize_source<S: SampleSource>(
    source: S,
    target_rate: u32,
    len: usize,
) -> Result<NormalizedBuffer> {
    let mono = ChannelReducer::new(source);
    let mut resampled = Resampler::new(mono, target_rate)?;
    assemble_window(&mut resampled, len)
}

/// Open `path` and produce its normalized window. The file is closed before returning.
pub fn load_window(path: &Path, target_rate: u32, len: usize) -> Result<NormalizedBuffer> {
    let reader = AudioFileReader::open(path)?;
    normalize_source(reader, target_rate, len)
}
