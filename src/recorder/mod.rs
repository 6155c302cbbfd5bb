//! Recorder process supervision
//!
//! The recorder itself is ffmpeg run through `sh -c`. This module builds its
//! command line and output file names; [`process`] supervises the child,
//! [`session`] runs one recording on a worker and finalizes its files, and
//! [`ext_proc`] runs the optional companion process.

pub mod ext_proc;
pub mod process;
pub mod session;

use chrono::{DateTime, Datelike, Local};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::FfmOpts;

/// What the recorder reads from and writes to for one session.
#[derive(Debug, Clone)]
pub struct RecorderInput<'a> {
    pub cx: u32,
    pub cy: u32,
    pub frame_rate: u32,
    pub video_device: &'a str,
    pub audio_device: &'a str,
    pub instance_tag: &'a str,
    pub output: &'a Path,
}

pub fn build_ffmpeg_command(opts: &FfmOpts, input: &RecorderInput<'_>) -> String {
    let audio_device = if input.audio_device.starts_with("-i ") {
        input.audio_device.to_string()
    } else {
        format!("-i {}", input.audio_device)
    };
    let parts = [
        "ffmpeg".to_string(),
        opts.a_fmt.clone(),
        opts.a_nchan.clone(),
        opts.a_opt.clone(),
        audio_device,
        opts.v_fmt.clone(),
        format!("-framerate {}", input.frame_rate),
        format!("-video_size {}x{}", input.cx, input.cy),
        opts.v_opt.clone(),
        format!("-i {}", input.video_device),
        opts.v_enc.clone(),
        opts.pix_fmt.clone(),
        opts.n_threads.clone(),
        opts.a_enc.clone(),
        format!("-metadata comment={}", input.instance_tag),
        input.output.display().to_string(),
        "2>&1".to_string(),
    ];
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace every `{name}` with its value. Unknown names are left as is.
pub fn expand_macros(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{}}}", name), value)
    })
}

/// Output directory for a session starting at `ts`.
pub fn expand_output_path(template: &str, ts: &DateTime<Local>) -> PathBuf {
    let year = format!("{:04}", ts.year());
    let month = format!("{:02}", ts.month());
    PathBuf::from(expand_macros(template, &[("year", &year), ("month", &month)]))
}

pub fn video_file(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, ext))
}

/// `<start>--.<ext>`, renamed once the stop time is known.
pub fn provisional_video_file(dir: &Path, start_ts: &str, ext: &str) -> PathBuf {
    video_file(dir, &format!("{}--", start_ts), ext)
}

pub fn final_video_file(dir: &Path, start_ts: &str, stop_ts: &str, ext: &str) -> PathBuf {
    video_file(dir, &format!("{}--{}", start_ts, stop_ts), ext)
}

/// Rename the provisional file if it still exists. Returns whether it was moved.
pub fn rename_video_file(provisional: &Path, final_path: &Path, message: &str) -> std::io::Result<bool> {
    if !provisional.exists() {
        return Ok(false);
    }
    info!("{} Saving video {}", message, final_path.display());
    std::fs::rename(provisional, final_path)?;
    Ok(true)
}

/// Move con/duct `info.json` and `usage.json` from one prefix to another.
pub fn rename_duct_files(old_prefix: &str, new_prefix: &str) {
    for suffix in ["info.json", "usage.json"] {
        let from = PathBuf::from(format!("{}{}", old_prefix, suffix));
        if !from.exists() {
            continue;
        }
        let to = PathBuf::from(format!("{}{}", new_prefix, suffix));
        info!("Renaming con/duct {}: {} -> {}", suffix, from.display(), to.display());
        if let Err(e) = std::fs::rename(&from, &to) {
            warn!("Failed to rename {}: {}", from.display(), e);
        }
    }
}
