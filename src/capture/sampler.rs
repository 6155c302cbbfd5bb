use super::{CaptureDevice, ChannelInfo, DeviceError, DeviceIdentity, SignalSnapshot};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("no capture channels found")]
    NoChannels,

    #[error("target device {0} not found")]
    DeviceNotFound(String),

    #[error("device {0} is not accessible, check permissions")]
    AccessDenied(String),

    #[error(transparent)]
    ReadFailed(#[from] DeviceError),
}

/// Locates the target channel and reads one signal snapshot from it.
pub struct SignalSampler<D> {
    device: D,
    family: String,
}

impl<D: CaptureDevice> SignalSampler<D> {
    pub fn new(device: D, family: impl Into<String>) -> Self {
        Self {
            device,
            family: family.into(),
        }
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// `serial` of `None` takes the first channel of the expected family.
    pub fn sample(
        &mut self,
        serial: Option<&str>,
    ) -> Result<(SignalSnapshot, DeviceIdentity), SamplerError> {
        let channels = self.device.enumerate_channels()?;
        if channels.is_empty() {
            return Err(SamplerError::NoChannels);
        }

        let target = self.locate(&channels, serial)?;
        let identity = DeviceIdentity::from(target);

        let handle = self.device.open_channel(&target.path)?;
        let snapshot = self.device.read_signal_status(&handle);
        self.device.close_channel(handle);

        let snapshot = snapshot?;
        debug!("Sampled {} from {}", snapshot, identity.path);
        Ok((snapshot, identity))
    }

    fn locate<'a>(
        &self,
        channels: &'a [ChannelInfo],
        serial: Option<&str>,
    ) -> Result<&'a ChannelInfo, SamplerError> {
        let mut inaccessible = None;
        for channel in channels {
            if channel.is_inaccessible() {
                inaccessible.get_or_insert(channel.path.as_str());
                continue;
            }
            let matched = match serial {
                Some(serial) => channel.serial == serial,
                None => channel.family.contains(&self.family),
            };
            if matched {
                return Ok(channel);
            }
        }

        if let Some(path) = inaccessible {
            return Err(SamplerError::AccessDenied(path.to_string()));
        }
        Err(SamplerError::DeviceNotFound(
            serial.unwrap_or("auto").to_string(),
        ))
    }
}
