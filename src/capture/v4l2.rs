//! V4L2 capture backend
//!
//! Channels are video nodes matching the configured glob pattern. Device
//! information and the current signal format come from `v4l2-ctl`; hot-plug
//! events come from watching the pattern's directory.

use super::{
    CaptureDevice, ChannelInfo, ColorFormat, DeviceError, FrameType, HotplugCallback,
    HotplugEvent, QuantRange, SignalSnapshot, SignalState, signal::FRAME_DURATION_UNITS_PER_SEC,
};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const V4L2_CTL: &str = "v4l2-ctl";

/// Parsed `v4l2-ctl --info` output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct V4l2Info {
    pub driver: String,
    pub card: String,
    pub model: String,
    pub serial: String,
    pub bus_info: String,
    pub video_capture: bool,
}

pub struct V4l2Device {
    pattern: String,
    watcher: Option<RecommendedWatcher>,
}

pub struct V4l2Handle {
    path: String,
}

impl V4l2Device {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            watcher: None,
        }
    }

    fn describe(&self, path: &str) -> Option<ChannelInfo> {
        let info = match run_v4l2_ctl(&["-d", path, "--info"]) {
            Ok(text) => parse_info(&text),
            Err(reason) if reason.contains("Permission denied") => {
                warn!("No access to {}: {}", path, reason);
                return Some(ChannelInfo {
                    path: path.to_string(),
                    ..Default::default()
                });
            }
            Err(reason) => {
                debug!("Skipping {}: {}", path, reason);
                return None;
            }
        };

        // Metadata nodes of the same device report no video capture capability.
        if !info.video_capture {
            return None;
        }

        let (family_id, product_id) = read_usb_ids(path).unwrap_or((u32::MAX, u32::MAX));
        Some(ChannelInfo {
            path: path.to_string(),
            family: info.card.clone(),
            product: if info.model.is_empty() { info.card } else { info.model },
            serial: info.serial,
            family_id,
            product_id,
            bus_info: info.bus_info,
            video_path: Some(path.to_string()),
        })
    }
}

impl CaptureDevice for V4l2Device {
    type Handle = V4l2Handle;

    fn enumerate_channels(&mut self) -> Result<Vec<ChannelInfo>, DeviceError> {
        let nodes = list_device_nodes(&self.pattern).map_err(DeviceError::Enumerate)?;
        Ok(nodes.iter().filter_map(|path| self.describe(path)).collect())
    }

    fn open_channel(&mut self, path: &str) -> Result<V4l2Handle, DeviceError> {
        std::fs::metadata(path).map_err(|e| DeviceError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(V4l2Handle {
            path: path.to_string(),
        })
    }

    fn read_signal_status(&mut self, handle: &V4l2Handle) -> Result<SignalSnapshot, DeviceError> {
        let text = run_v4l2_ctl(&["-d", &handle.path, "--get-fmt-video", "--get-parm"]).map_err(
            |reason| DeviceError::Read {
                path: handle.path.clone(),
                reason,
            },
        )?;
        Ok(parse_format(&text))
    }

    fn close_channel(&mut self, _handle: V4l2Handle) {}

    fn register_hotplug(&mut self, callback: HotplugCallback) -> Result<(), DeviceError> {
        let pattern = self.pattern.clone();
        let dir = pattern_dir(&pattern);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Hot-plug watch error: {}", e);
                    return;
                }
            };
            for path in &event.paths {
                let path = path.to_string_lossy();
                if !glob_match(&pattern, &path) {
                    continue;
                }
                match event.kind {
                    EventKind::Create(_) => callback(HotplugEvent::Arrived(path.to_string())),
                    EventKind::Remove(_) => callback(HotplugEvent::Left(path.to_string())),
                    _ => {}
                }
            }
        })
        .map_err(|e| DeviceError::Hotplug(e.to_string()))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| DeviceError::Hotplug(format!("{}: {}", dir.display(), e)))?;
        info!("Watching {} for device hot-plug", dir.display());

        self.watcher = Some(watcher);
        Ok(())
    }
}

/// Find the video node whose `--info` reports `serial`.
pub fn video_device_path_by_serial(pattern: &str, serial: &str) -> Option<String> {
    let nodes = list_device_nodes(pattern).ok()?;
    nodes.into_iter().find(|path| {
        run_v4l2_ctl(&["-d", path, "--info"])
            .map(|text| {
                let info = parse_info(&text);
                info.video_capture && info.serial == serial
            })
            .unwrap_or(false)
    })
}

/// Every video capture node matching `pattern`, with its parsed info.
pub fn list_video_devices(pattern: &str) -> Vec<(String, V4l2Info)> {
    let Ok(nodes) = list_device_nodes(pattern) else {
        return Vec::new();
    };
    nodes
        .into_iter()
        .filter_map(|path| {
            let info = parse_info(&run_v4l2_ctl(&["-d", &path, "--info"]).ok()?);
            info.video_capture.then_some((path, info))
        })
        .collect()
}

fn run_v4l2_ctl(args: &[&str]) -> Result<String, String> {
    let output = Command::new(V4L2_CTL)
        .args(args)
        .output()
        .map_err(|e| format!("failed to run {}: {}", V4L2_CTL, e))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn pattern_dir(pattern: &str) -> PathBuf {
    Path::new(pattern)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/dev"))
}

fn list_device_nodes(pattern: &str) -> Result<Vec<String>, String> {
    let dir = pattern_dir(pattern);
    let entries =
        std::fs::read_dir(&dir).map_err(|e| format!("failed to list {}: {}", dir.display(), e))?;
    let mut nodes: Vec<String> = entries
        .flatten()
        .map(|entry| entry.path().to_string_lossy().into_owned())
        .filter(|path| glob_match(pattern, path))
        .collect();
    nodes.sort_by(|a, b| natural_key(a).cmp(&natural_key(b)));
    Ok(nodes)
}

/// Sort `/dev/video10` after `/dev/video2`.
fn natural_key(path: &str) -> (String, u64) {
    let digits = path.len() - path.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (stem, number) = path.split_at(path.len() - digits);
    (stem.to_string(), number.parse().unwrap_or(0))
}

/// Shell-style match supporting `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

fn read_usb_ids(path: &str) -> Option<(u32, u32)> {
    let name = Path::new(path).file_name()?.to_string_lossy().into_owned();
    let usb_dir = Path::new("/sys/class/video4linux").join(name).join("device").join("..");
    let read_hex = |file: &str| -> Option<u32> {
        let text = std::fs::read_to_string(usb_dir.join(file)).ok()?;
        u32::from_str_radix(text.trim(), 16).ok()
    };
    Some((read_hex("idVendor")?, read_hex("idProduct")?))
}

fn split_field(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((key.trim(), value.trim()))
}

pub fn parse_info(text: &str) -> V4l2Info {
    let mut info = V4l2Info::default();
    let mut in_device_caps = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match split_field(line) {
            Some((key, value)) => {
                in_device_caps = key == "Device Caps";
                match key {
                    "Driver name" if info.driver.is_empty() => info.driver = value.to_string(),
                    "Card type" => info.card = value.to_string(),
                    "Model" => info.model = value.to_string(),
                    "Serial" => info.serial = value.to_string(),
                    "Bus info" if info.bus_info.is_empty() => info.bus_info = value.to_string(),
                    _ => {}
                }
            }
            None if in_device_caps && line == "Video Capture" => info.video_capture = true,
            None => {}
        }
    }
    info
}

pub fn parse_format(text: &str) -> SignalSnapshot {
    let mut snapshot = SignalSnapshot::default();
    let mut encoding = String::new();
    let mut pixel_format = String::new();

    for raw in text.lines() {
        let Some((key, value)) = split_field(raw.trim()) else {
            continue;
        };
        match key {
            "Width/Height" => {
                if let Some((w, h)) = value.split_once('/') {
                    snapshot.cx = w.trim().parse().unwrap_or(0);
                    snapshot.cy = h.trim().parse().unwrap_or(0);
                }
            }
            "Pixel Format" => pixel_format = value.to_string(),
            "Field" => {
                let field = value.to_ascii_lowercase();
                snapshot.interlaced = field.starts_with("interlaced")
                    || field == "top"
                    || field == "bottom"
                    || field == "alternate";
                if snapshot.interlaced {
                    snapshot.frame_type = FrameType::Interlaced;
                }
            }
            "YCbCr/HSV Encoding" => encoding = value.to_string(),
            "Quantization" => {
                snapshot.quant_range = if value.contains("Full") {
                    QuantRange::Full
                } else if value.contains("Limited") {
                    QuantRange::Limited
                } else {
                    QuantRange::Unknown
                };
            }
            "Frames per second" => snapshot.frame_duration = parse_frame_duration(value),
            _ => {}
        }
    }

    snapshot.cx_total = snapshot.cx;
    snapshot.cy_total = snapshot.cy;
    snapshot.color_format = color_format(&pixel_format, &encoding);
    (snapshot.aspect_x, snapshot.aspect_y) = reduce_ratio(snapshot.cx, snapshot.cy);
    snapshot.state = if snapshot.cx > 0 && snapshot.cy > 0 {
        SignalState::Locked
    } else {
        SignalState::None
    };
    snapshot
}

/// "60.000 (60/1)" becomes the duration of one frame in 100 ns units.
fn parse_frame_duration(value: &str) -> u32 {
    let fraction = value
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .and_then(|(inner, _)| inner.split_once('/'));
    let Some((num, den)) = fraction else {
        return 0;
    };
    let (Ok(num), Ok(den)) = (num.trim().parse::<u64>(), den.trim().parse::<u64>()) else {
        return 0;
    };
    // The fraction is frames per second, the duration is its inverse.
    if num == 0 {
        return 0;
    }
    u32::try_from(FRAME_DURATION_UNITS_PER_SEC.saturating_mul(den) / num).unwrap_or(0)
}

fn color_format(pixel_format: &str, encoding: &str) -> ColorFormat {
    let fourcc = pixel_format.trim_start_matches('\'');
    if ["RGB", "BGR", "AR24", "XR24", "RX24"].iter().any(|p| fourcc.starts_with(p)) {
        ColorFormat::Rgb
    } else if pixel_format.is_empty() {
        ColorFormat::Unknown
    } else if encoding.contains("2020") {
        ColorFormat::YuvBt2020
    } else if encoding.contains("709") {
        ColorFormat::YuvBt709
    } else {
        ColorFormat::YuvBt601
    }
}

fn reduce_ratio(x: u32, y: u32) -> (u32, u32) {
    fn gcd(a: u32, b: u32) -> u32 {
        if b == 0 {
            a
        } else {
            gcd(b, a % b)
        }
    }
    match gcd(x, y) {
        0 => (0, 0),
        g => (x / g, y / g),
    }
}
