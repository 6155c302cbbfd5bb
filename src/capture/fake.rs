//! In-memory capture device for tests

use super::{
    CaptureDevice, ChannelInfo, DeviceError, HotplugCallback, HotplugEvent, SignalSnapshot,
};
use std::sync::{Arc, Mutex};

pub(crate) fn channel(path: &str, serial: &str) -> ChannelInfo {
    ChannelInfo {
        path: path.to_string(),
        family: "USB Capture".to_string(),
        product: "USB Capture HDMI+".to_string(),
        serial: serial.to_string(),
        family_id: 0x2935,
        product_id: 0x0006,
        bus_info: "usb-0000:00:14.0-2".to_string(),
        video_path: Some(path.to_string()),
    }
}

#[derive(Default)]
struct State {
    channels: Vec<ChannelInfo>,
    signal: SignalSnapshot,
    fail_reads: bool,
    opened: usize,
    closed: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeDevice {
    state: Arc<Mutex<State>>,
    hotplug: Arc<Mutex<Option<HotplugCallback>>>,
}

impl FakeDevice {
    pub(crate) fn new(channels: Vec<ChannelInfo>) -> Self {
        let device = Self::default();
        device.state.lock().unwrap().channels = channels;
        device
    }

    pub(crate) fn set_signal(&self, signal: SignalSnapshot) {
        self.state.lock().unwrap().signal = signal;
    }

    pub(crate) fn set_channels(&self, channels: Vec<ChannelInfo>) {
        self.state.lock().unwrap().channels = channels;
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    pub(crate) fn open_count(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn fire(&self, event: HotplugEvent) {
        if let Some(callback) = self.hotplug.lock().unwrap().as_ref() {
            callback(event);
        }
    }
}

impl CaptureDevice for FakeDevice {
    type Handle = String;

    fn enumerate_channels(&mut self) -> Result<Vec<ChannelInfo>, DeviceError> {
        Ok(self.state.lock().unwrap().channels.clone())
    }

    fn open_channel(&mut self, path: &str) -> Result<String, DeviceError> {
        self.state.lock().unwrap().opened += 1;
        Ok(path.to_string())
    }

    fn read_signal_status(&mut self, handle: &String) -> Result<SignalSnapshot, DeviceError> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(DeviceError::Read {
                path: handle.clone(),
                reason: "simulated failure".to_string(),
            });
        }
        Ok(state.signal)
    }

    fn close_channel(&mut self, _handle: String) {
        self.state.lock().unwrap().closed += 1;
    }

    fn register_hotplug(&mut self, callback: HotplugCallback) -> Result<(), DeviceError> {
        *self.hotplug.lock().unwrap() = Some(callback);
        Ok(())
    }
}
