// decoder.rs - Consumed PCM decoder interface

//! The decoder seam between the mixer and file-format code.
//!
//! The engine never parses audio file headers itself; a decoder is an
//! opaque frame producer that reports its native format after opening.
//! `DecodedSource` wraps one of these behind the uniform source
//! interface.

use crate::mixer::types::{AudioFormat, MixerResult};

/// An opened PCM decoder.
///
/// Implementations report their native width and layout; the conversion
/// layer handles any widening, so a decoder must never narrow its output
/// to suit the mixer.
pub trait PcmDecoder: Send {
    /// The decoder's native output format, constant once opened.
    fn format(&self) -> AudioFormat;

    /// Total length in frames, or `None` when the container does not say.
    fn length_frames(&self) -> Option<u64>;

    /// Whether `seek_frame` is usable on this stream.
    fn can_seek(&self) -> bool;

    /// Seek to an absolute frame position.
    ///
    /// Positions past the end are clamped; returns the position actually
    /// reached.
    fn seek_frame(&mut self, frame: u64) -> MixerResult<u64>;

    /// Decode into `buf`, returning the number of bytes produced.
    ///
    /// The result is always a whole number of frames; 0 means end of
    /// stream.
    fn decode(&mut self, buf: &mut [u8]) -> MixerResult<usize>;
}
