// device.rs - Host audio device interface

//! The seam between the engine and the host audio device.
//!
//! The device itself lives outside this crate: something that can open a
//! stream close to a requested format, report what it actually granted,
//! and invoke the registered callback with an `i32` accumulator roughly
//! every `buffer_ms`. Converting the accumulator to the device's native
//! sample format on the way out is the host's job (`convert_acc` does the
//! arithmetic).
//!
//! `NullDevice` is the in-process host used by the test suite: it grants
//! a format, captures the callback, and lets a cloned handle pump frames
//! on demand.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::mixer::types::{AudioFormat, DeviceRequest, MixerError, MixerResult};

/// The engine's mix entry point as registered with a host.
///
/// Invoked as `(accumulator, frames)`; the accumulator holds
/// `frames * channels` samples.
pub type DeviceCallback = Arc<dyn Fn(&mut [i32], usize) + Send + Sync>;

/// A host audio device as consumed by the engine.
pub trait HostDevice: Send {
    /// Open a stream near `request` and install `callback`.
    ///
    /// Returns the format actually granted. Opening an already-open
    /// device fails with `InvalidState`; other host failures surface as
    /// `DeviceError`.
    fn open(&mut self, request: &DeviceRequest, callback: DeviceCallback)
        -> MixerResult<AudioFormat>;

    /// Suspend or resume callback delivery.
    fn set_paused(&mut self, paused: bool);

    /// Tear the stream down; the callback will not run again.
    fn close(&mut self);
}

struct NullInner {
    forced: Option<AudioFormat>,
    grant: Option<AudioFormat>,
    callback: Option<DeviceCallback>,
    paused: bool,
    open: bool,
}

/// A host device without hardware behind it.
///
/// Cloning the handle shares the device, so a test can keep one half,
/// hand the other to the engine, and drive callbacks deterministically
/// with `render`.
pub struct NullDevice {
    inner: Arc<Mutex<NullInner>>,
}

impl NullDevice {
    /// A device that grants exactly what is requested.
    pub fn new() -> NullDevice {
        NullDevice {
            inner: Arc::new(Mutex::new(NullInner {
                forced: None,
                grant: None,
                callback: None,
                paused: false,
                open: false,
            })),
        }
    }

    /// A device that negotiates `format` regardless of the request.
    pub fn granting(format: AudioFormat) -> NullDevice {
        let dev = NullDevice::new();
        dev.inner.lock().forced = Some(format);
        dev
    }

    /// Another handle onto the same device.
    pub fn handle(&self) -> NullDevice {
        NullDevice { inner: Arc::clone(&self.inner) }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Run one callback cycle of `frames` frames and return the
    /// accumulator. A closed or paused device yields silence.
    pub fn render(&self, frames: usize) -> Vec<i32> {
        let (callback, channels, paused) = {
            let g = self.inner.lock();
            (
                g.callback.clone(),
                g.grant.map(|f| f.channels as usize).unwrap_or(0),
                g.paused || !g.open,
            )
        };
        let mut buf = vec![0i32; frames * channels];
        if !paused {
            if let Some(cb) = callback {
                cb(&mut buf, frames);
            }
        }
        buf
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice for NullDevice {
    fn open(
        &mut self,
        request: &DeviceRequest,
        callback: DeviceCallback,
    ) -> MixerResult<AudioFormat> {
        let mut g = self.inner.lock();
        if g.open {
            return Err(MixerError::InvalidState("device already open".to_string()));
        }
        let grant = g.forced.unwrap_or_else(|| request.format());
        g.grant = Some(grant);
        g.callback = Some(callback);
        g.paused = false;
        g.open = true;
        Ok(grant)
    }

    fn set_paused(&mut self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    fn close(&mut self) {
        let mut g = self.inner.lock();
        g.open = false;
        g.callback = None;
    }
}
