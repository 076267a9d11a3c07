// chanmix - interactive channel-based audio mixing engine

pub mod decoder;
pub mod mixer;

pub use decoder::PcmDecoder;
pub use mixer::{
    AudioFormat, AudioSource, Channel, ChannelState, DeviceRequest, Engine, FilterFn, FilterId,
    FinishedHook, GroupId, HookId, HostDevice, MixPolicy, MixerError, MixerResult, NullDevice,
    PlayPolicy, SampleFormat, SharedSource, Target, INFINITE, MAX_VOLUME,
};
