//! Capture device access
//!
//! This module describes the capture capability the controller needs and
//! ships one implementation of it:
//! - [`CaptureDevice`]: enumerate, open, read signal status, close, hot-plug
//! - [`SignalSampler`]: one locate-open-read-close cycle producing a [`SignalSnapshot`]
//! - [`DisconnectedDevices`]: paths reported gone by hot-plug events
//! - [`v4l2::V4l2Device`]: V4L2 backend built on `v4l2-ctl` and `/dev` watching

#[cfg(test)]
pub(crate) mod fake;
mod hotplug;
mod sampler;
mod signal;
pub mod v4l2;

pub use hotplug::DisconnectedDevices;
pub use sampler::{SamplerError, SignalSampler};
pub use signal::{ColorFormat, FrameType, QuantRange, SatRange, SignalSnapshot, SignalState};

#[cfg(test)]
pub(crate) use signal::locked;

use thiserror::Error;

/// Static information about one capture channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Stable device path used to open the channel
    pub path: String,
    /// Device family, e.g. "USB Capture"
    pub family: String,
    pub product: String,
    pub serial: String,
    pub family_id: u32,
    pub product_id: u32,
    pub bus_info: String,
    /// Video node the recorder reads from, when known
    pub video_path: Option<String>,
}

impl ChannelInfo {
    /// Both ids read as zero when the device could be listed but not queried.
    pub fn is_inaccessible(&self) -> bool {
        self.family_id == 0 && self.product_id == 0
    }
}

/// The device a sample was taken from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub serial: String,
    pub name: String,
    pub path: String,
    pub bus_info: String,
    pub video_path: Option<String>,
}

impl From<&ChannelInfo> for DeviceIdentity {
    fn from(info: &ChannelInfo) -> Self {
        Self {
            serial: info.serial.clone(),
            name: info.product.clone(),
            path: info.path.clone(),
            bus_info: info.bus_info.clone(),
            video_path: info.video_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived(String),
    Left(String),
}

pub type HotplugCallback = Box<dyn Fn(HotplugEvent) + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to enumerate channels: {0}")]
    Enumerate(String),

    #[error("failed to open channel {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("failed to read signal status from {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to register hot-plug callback: {0}")]
    Hotplug(String),
}

/// Capture capability consumed by [`SignalSampler`] and the controller.
pub trait CaptureDevice: Send {
    type Handle;

    fn enumerate_channels(&mut self) -> Result<Vec<ChannelInfo>, DeviceError>;

    fn open_channel(&mut self, path: &str) -> Result<Self::Handle, DeviceError>;

    fn read_signal_status(&mut self, handle: &Self::Handle) -> Result<SignalSnapshot, DeviceError>;

    fn close_channel(&mut self, handle: Self::Handle);

    /// The callback may be invoked from any thread.
    fn register_hotplug(&mut self, callback: HotplugCallback) -> Result<(), DeviceError>;
}
