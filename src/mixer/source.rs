// source.rs - Audio source abstraction

//! Uniform frame producers for the mixer.
//!
//! An `AudioSource` is one of three variants behind a single dispatch
//! surface: a raw PCM byte stream, an opaque decoder, or an in-memory
//! sample. Sources carry their own volume, priority, and playback rate,
//! and are shared with the code that created them; a channel holds an
//! `Arc` and never destroys the source.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::decoder::PcmDecoder;
use crate::mixer::convert::{convert_mix, Converter};
use crate::mixer::types::{AudioFormat, MixerError, MixerResult, SampleFormat, MAX_VOLUME};

/// Byte streams usable by `RawSource` when seeking is available.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// A source as shared between the creating code and the playing channel.
///
/// The mutex is the per-source lock of the engine's lock hierarchy; it
/// guards the position and any decoder state.
pub type SharedSource = Arc<Mutex<AudioSource>>;

fn io_err(e: std::io::Error) -> MixerError {
    MixerError::DeviceError(format!("source io: {}", e))
}

enum RawStream {
    Seekable(Box<dyn ReadSeek>),
    Forward(Box<dyn Read + Send>),
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            RawStream::Seekable(s) => s.read(buf),
            RawStream::Forward(s) => s.read(buf),
        }
    }
}

struct RawSource {
    stream: RawStream,
    /// Byte offset of frame 0 within the stream.
    window_start: u64,
    /// Window length in bytes, when known.
    window_len: Option<u64>,
    pos: u64,
}

struct DecodedSource {
    decoder: Box<dyn PcmDecoder>,
    /// Logical read position in frames.
    pos: u64,
    /// Where the decoder actually is.
    dec_pos: u64,
}

struct SampleSource {
    data: Vec<u8>,
    pos: u64,
}

enum SourceKind {
    Raw(RawSource),
    Decoded(DecodedSource),
    Sample(SampleSource),
}

/// A producer of PCM frames, independent of any channel binding.
pub struct AudioSource {
    kind: SourceKind,
    format: AudioFormat,
    volume: i32,
    priority: i32,
    rate: f32,
    scratch: Vec<u8>,
}

impl AudioSource {
    fn with_kind(kind: SourceKind, format: AudioFormat) -> AudioSource {
        AudioSource {
            kind,
            format,
            volume: MAX_VOLUME,
            priority: 0,
            rate: 1.0,
            scratch: Vec::new(),
        }
    }

    /// A raw PCM source over a seekable byte stream.
    ///
    /// The whole stream is the playback window; its length is probed once
    /// at construction.
    pub fn raw<S: ReadSeek + 'static>(mut stream: S, format: AudioFormat) -> MixerResult<AudioSource> {
        let end = stream.seek(SeekFrom::End(0)).map_err(io_err)?;
        Ok(Self::with_kind(
            SourceKind::Raw(RawSource {
                stream: RawStream::Seekable(Box::new(stream)),
                window_start: 0,
                window_len: Some(end),
                pos: 0,
            }),
            format,
        ))
    }

    /// A raw PCM source over a `[start, start + len)` byte window of a
    /// seekable stream.
    pub fn raw_window<S: ReadSeek + 'static>(
        stream: S,
        format: AudioFormat,
        start: u64,
        len: u64,
    ) -> AudioSource {
        Self::with_kind(
            SourceKind::Raw(RawSource {
                stream: RawStream::Seekable(Box::new(stream)),
                window_start: start,
                window_len: Some(len),
                pos: 0,
            }),
            format,
        )
    }

    /// A raw PCM source over a forward-only reader.
    ///
    /// Such a source can neither rewind nor seek, so it cannot loop and
    /// may be bound to at most one channel at a time.
    pub fn raw_reader<R: Read + Send + 'static>(reader: R, format: AudioFormat) -> AudioSource {
        Self::with_kind(
            SourceKind::Raw(RawSource {
                stream: RawStream::Forward(Box::new(reader)),
                window_start: 0,
                window_len: None,
                pos: 0,
            }),
            format,
        )
    }

    /// A source produced by an opaque decoder.
    pub fn decoded(decoder: Box<dyn PcmDecoder>) -> AudioSource {
        let format = decoder.format();
        Self::with_kind(
            SourceKind::Decoded(DecodedSource { decoder, pos: 0, dec_pos: 0 }),
            format,
        )
    }

    /// An in-memory PCM sample.
    pub fn sample(data: Vec<u8>, format: AudioFormat) -> AudioSource {
        Self::with_kind(SourceKind::Sample(SampleSource { data, pos: 0 }), format)
    }

    /// An in-memory sample pre-converted to the mixer's accumulator
    /// encoding at construction, so playback needs no per-callback
    /// conversion.
    pub fn sample_for_mixer(
        data: Vec<u8>,
        format: AudioFormat,
        mixer: &AudioFormat,
    ) -> MixerResult<AudioSource> {
        let cvt = Converter::setup(format, *mixer)?;
        if cvt.is_identity() {
            return Ok(Self::sample(data, format));
        }
        let mut buf = data;
        let len = buf.len() - buf.len() % format.frame_size();
        let out = cvt.convert(&mut buf, len);
        buf.truncate(out);
        Ok(Self::sample(
            buf,
            AudioFormat::new(mixer.frequency, SampleFormat::Mixer, mixer.channels),
        ))
    }

    /// Wrap this source for sharing with the engine.
    pub fn into_shared(self) -> SharedSource {
        Arc::new(Mutex::new(self))
    }

    /// The source's native format; constant over its lifetime.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Length in frames, or `None` when unknown.
    pub fn length(&self) -> Option<u64> {
        let fs = self.format.frame_size() as u64;
        match &self.kind {
            SourceKind::Raw(r) => r.window_len.map(|b| b / fs),
            SourceKind::Decoded(d) => d.decoder.length_frames(),
            SourceKind::Sample(s) => Some(s.data.len() as u64 / fs),
        }
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: i32) -> MixerResult<()> {
        if !(0..=MAX_VOLUME).contains(&volume) {
            return Err(MixerError::OutOfRange(format!("source volume {}", volume)));
        }
        self.volume = volume;
        Ok(())
    }

    /// Eviction priority; larger values survive longer.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn set_rate(&mut self, rate: f32) -> MixerResult<()> {
        if rate < 0.0 || !rate.is_finite() {
            return Err(MixerError::OutOfRange(format!("source rate {}", rate)));
        }
        self.rate = rate;
        Ok(())
    }

    pub fn can_rewind(&self) -> bool {
        match &self.kind {
            SourceKind::Raw(r) => matches!(r.stream, RawStream::Seekable(_)),
            SourceKind::Decoded(d) => d.decoder.can_seek(),
            SourceKind::Sample(_) => true,
        }
    }

    pub fn can_seek(&self) -> bool {
        self.can_rewind()
    }

    /// Current read position in frames.
    pub fn position(&self) -> u64 {
        match &self.kind {
            SourceKind::Raw(r) => r.pos,
            SourceKind::Decoded(d) => d.pos,
            SourceKind::Sample(s) => s.pos,
        }
    }

    /// Move the read position.
    ///
    /// Streamed sources clamp a position past the end; a sample source
    /// rejects it with `OutOfRange`.
    pub fn set_position(&mut self, frames: u64) -> MixerResult<()> {
        let len = self.length();
        match &mut self.kind {
            SourceKind::Raw(r) => match r.stream {
                RawStream::Seekable(_) => {
                    r.pos = match len {
                        Some(l) => frames.min(l),
                        None => frames,
                    };
                    Ok(())
                }
                RawStream::Forward(_) => Err(MixerError::UnsupportedOperation(
                    "seek on forward-only source".to_string(),
                )),
            },
            SourceKind::Decoded(d) => {
                if !d.decoder.can_seek() {
                    return Err(MixerError::UnsupportedOperation(
                        "seek on non-seekable decoder".to_string(),
                    ));
                }
                d.pos = match len {
                    Some(l) => frames.min(l),
                    None => frames,
                };
                Ok(())
            }
            SourceKind::Sample(s) => {
                let l = len.unwrap_or(0);
                if frames > l {
                    return Err(MixerError::OutOfRange(format!(
                        "position {} past end {}",
                        frames, l
                    )));
                }
                s.pos = frames;
                Ok(())
            }
        }
    }

    /// Return to frame 0.
    pub fn rewind(&mut self) -> MixerResult<()> {
        if !self.can_rewind() {
            return Err(MixerError::UnsupportedOperation(
                "rewind on forward-only source".to_string(),
            ));
        }
        match &mut self.kind {
            SourceKind::Raw(r) => r.pos = 0,
            SourceKind::Decoded(d) => d.pos = 0,
            SourceKind::Sample(s) => s.pos = 0,
        }
        Ok(())
    }

    /// Read raw bytes in the source format.
    ///
    /// `buf.len()` must be a whole number of frames; the return value is
    /// too. 0 means end of stream.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> MixerResult<usize> {
        let fs = self.format.frame_size();
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() % fs != 0 {
            return Err(MixerError::InvalidArgument(format!(
                "read length {} not a multiple of frame size {}",
                buf.len(),
                fs
            )));
        }
        match &mut self.kind {
            SourceKind::Raw(r) => {
                let mut want = buf.len();
                let pos_bytes = r.pos * fs as u64;
                if let Some(total) = r.window_len {
                    if pos_bytes >= total {
                        return Ok(0);
                    }
                    let left = (total - pos_bytes) as usize;
                    want = want.min(left - left % fs);
                    if want == 0 {
                        return Ok(0);
                    }
                }
                if let RawStream::Seekable(s) = &mut r.stream {
                    s.seek(SeekFrom::Start(r.window_start + pos_bytes)).map_err(io_err)?;
                }
                let got = read_fully(&mut r.stream, &mut buf[..want])?;
                let frames = got / fs;
                r.pos += frames as u64;
                Ok(frames * fs)
            }
            SourceKind::Decoded(d) => {
                if d.pos != d.dec_pos {
                    d.dec_pos = d.decoder.seek_frame(d.pos)?;
                    d.pos = d.dec_pos;
                }
                let mut got = 0;
                while got < buf.len() {
                    let n = d.decoder.decode(&mut buf[got..])?;
                    if n == 0 {
                        break;
                    }
                    got += n;
                }
                let frames = got / fs;
                d.pos += frames as u64;
                d.dec_pos = d.pos;
                Ok(frames * fs)
            }
            SourceKind::Sample(s) => {
                let offset = s.pos as usize * fs;
                if offset >= s.data.len() {
                    return Ok(0);
                }
                let avail = s.data.len() - offset;
                let take = buf.len().min(avail - avail % fs);
                buf[..take].copy_from_slice(&s.data[offset..offset + take]);
                s.pos += (take / fs) as u64;
                Ok(take)
            }
        }
    }

    /// Produce up to `frames` frames as accumulator samples.
    ///
    /// With `volume >= 0` the samples are widened and saturating-added
    /// into `out` in one pass; with a negative volume the frames are
    /// written plain (overwriting) for later filter processing. Returns
    /// the number of frames produced; 0 means end of stream.
    pub fn read_frames(&mut self, out: &mut [i32], frames: usize, volume: i32) -> MixerResult<usize> {
        let fmt = self.format;
        let fs = fmt.frame_size();
        let ch = fmt.channels as usize;
        let want = frames.min(out.len() / ch);
        if want == 0 {
            return Ok(0);
        }

        // Sample data can be widened straight from the backing store.
        if let SourceKind::Sample(s) = &mut self.kind {
            let total = (s.data.len() / fs) as u64;
            if s.pos >= total {
                return Ok(0);
            }
            let n = want.min((total - s.pos) as usize);
            let offset = s.pos as usize * fs;
            let raw = &s.data[offset..offset + n * fs];
            let samples = n * ch;
            if volume < 0 {
                out[..samples].fill(0);
                convert_mix(&mut out[..samples], raw, samples, fmt.sample, MAX_VOLUME);
            } else {
                convert_mix(&mut out[..samples], raw, samples, fmt.sample, volume);
            }
            s.pos += n as u64;
            return Ok(n);
        }

        let need = want * fs;
        if self.scratch.len() < need {
            self.scratch.resize(need, 0);
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        let result = self.read_bytes(&mut scratch[..need]);
        self.scratch = scratch;
        let got = result?;
        let n = got / fs;
        if n == 0 {
            return Ok(0);
        }
        let samples = n * ch;
        if volume < 0 {
            out[..samples].fill(0);
            convert_mix(&mut out[..samples], &self.scratch, samples, fmt.sample, MAX_VOLUME);
        } else {
            convert_mix(&mut out[..samples], &self.scratch, samples, fmt.sample, volume);
        }
        Ok(n)
    }

    /// Read every remaining frame.
    ///
    /// Only defined for sources of known length.
    pub fn read_all(&mut self) -> MixerResult<Vec<u8>> {
        let len = self.length().ok_or_else(|| {
            MixerError::UnsupportedOperation("read_all on unknown-length source".to_string())
        })?;
        let fs = self.format.frame_size();
        let remaining = len.saturating_sub(self.position()) as usize;
        let mut buf = vec![0u8; remaining * fs];
        let mut got = 0;
        while got < buf.len() {
            let n = self.read_bytes(&mut buf[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        buf.truncate(got);
        Ok(buf)
    }
}

fn read_fully<R: Read>(stream: &mut R, buf: &mut [u8]) -> MixerResult<usize> {
    let mut got = 0;
    while got < buf.len() {
        let n = stream.read(&mut buf[got..]).map_err(io_err)?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}
