// mod.rs - Audio mixer module

//! Interactive channel-based audio mixing engine.
//!
//! The engine is driven by a fixed-rate pull callback from a host audio
//! device. Any number of sources can play at once; each is resampled and
//! reformatted to the negotiated mixer format on the fly, with per-source
//! volume, fade envelopes, looping, timeouts, and optional per-channel
//! and global filters, all summed into a 32-bit accumulator.
//!
//! # Architecture
//!
//! - `types` - Formats, policies, errors, and the time source
//! - `convert` - Accumulator primitives and the conversion descriptor
//! - `source` - The `AudioSource` variants (raw, decoded, sample)
//! - `channel` - Playback slots and the per-callback mix pass
//! - `engine` - The coordinator: channels, groups, admission, callback
//! - `device` - The consumed host-device interface and the test host
//!
//! # Example
//!
//! ```rust
//! use chanmix::mixer::{AudioFormat, AudioSource, DeviceRequest, Engine, NullDevice, SampleFormat, Target, INFINITE};
//!
//! let device = NullDevice::new();
//! let engine = Engine::new(Box::new(device), &DeviceRequest::default()).unwrap();
//! engine.allocate_channels(8).unwrap();
//!
//! let format = AudioFormat::new(22050, SampleFormat::S16_SYS, 2);
//! let source = AudioSource::sample(vec![0; 4 * 1024], format).into_shared();
//! let channel = engine.play(&source, 0, INFINITE, Target::Free).unwrap();
//! assert!(channel >= 0);
//! ```

pub mod channel;
pub mod convert;
pub mod device;
pub mod engine;
pub mod source;
pub mod types;

// Re-export common types for convenience
pub use types::{
    AudioFormat, ChannelState, DeviceRequest, FadeKind, FilterId, GroupId, HookId, ManualClock,
    MixPolicy, MixerError, MixerResult, PlayPolicy, SampleFormat, Target, TimeSource, WallClock,
    INFINITE, MAX_VOLUME,
};

pub use channel::{Channel, FilterFn, FinishedHook};
pub use convert::{
    convert_acc, convert_mix, copy, divide_accumulator, mix, volume_scale, Converter,
};
pub use device::{DeviceCallback, HostDevice, NullDevice};
pub use engine::Engine;
pub use source::{AudioSource, ReadSeek, SharedSource};
