//! Companion process started with every session
//!
//! An optional status command gates the launch: its output must match the
//! configured regex before the exec command runs.

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::process::{run_supervised, ProcessLauncher, ProcessSlot, Signal, TerminationPolicy};
use crate::config::ExtProcOpts;
use crate::session::SessionLogger;
use crate::worker::{RunBody, WorkerContext};

const RESTART_DELAY: Duration = Duration::from_secs(1);
const CHECK_EXEC_LIMIT: Duration = Duration::from_secs(60);

pub fn compile_status_regex(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    let regex = RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .with_context(|| format!("Invalid status regex: {}", pattern))?;
    Ok(Some(regex))
}

fn run_status_command(command: &str) -> Result<(bool, String)> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("Failed to run status command: {}", command))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok((output.status.success(), text))
}

/// Whether the exec command may run. No status command means no gate; a
/// status command without a regex only has to succeed.
pub fn status_allows_exec(opts: &ExtProcOpts, regex: Option<&Regex>, verbose: bool) -> Result<bool> {
    if opts.status_command.is_empty() {
        return Ok(true);
    }
    debug!("Execute status command: {}", opts.status_command);
    let (success, output) = run_status_command(&opts.status_command)?;
    if verbose {
        info!("  [STATUS COMMAND]  : {}", opts.status_command);
        info!("  [OUTPUT]          : {}", output.trim_end());
    }

    let Some(regex) = regex else {
        return Ok(success);
    };
    match regex.find(&output) {
        Some(found) => {
            debug!("Status command matches regex: {}", found.as_str());
            if verbose {
                info!("  [MATCHED]         : {}", found.as_str());
            }
            Ok(true)
        }
        None => {
            info!("  [NOT MATCHED] {}", regex.as_str());
            Ok(false)
        }
    }
}

pub struct ExtProcBody {
    pub opts: ExtProcOpts,
    pub regex: Option<Regex>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub slot: Arc<ProcessSlot>,
    pub logger: Arc<SessionLogger>,
}

impl RunBody for ExtProcBody {
    fn run(&self, ctx: &WorkerContext) -> Result<()> {
        if self.opts.status_delay_ms > 0 {
            info!("Waiting {} ms before the status command", self.opts.status_delay_ms);
            if !ctx.sleep(Duration::from_millis(self.opts.status_delay_ms)) {
                return Ok(());
            }
        }

        if !status_allows_exec(&self.opts, self.regex.as_ref(), false)? {
            info!("External process not started");
            return Ok(());
        }
        if self.opts.exec_command.is_empty() {
            return Ok(());
        }

        loop {
            info!("Execute external process command: {}", self.opts.exec_command);
            let status = run_supervised(
                self.launcher.as_ref(),
                &self.opts.exec_command,
                &self.slot,
                || {},
                |line| self.logger.output(line),
            )?;
            info!("External process exited: {:?}", status);

            if !self.opts.exec_restart_on_exit || ctx.is_cancelled() {
                break;
            }
            if !ctx.sleep(RESTART_DELAY) {
                break;
            }
            warn!("Restarting external process");
        }
        Ok(())
    }

    fn cancel(&self) {
        self.slot.signal(Signal::Kill);
    }
}

/// Interactive check of the status and exec commands (`--ext-proc`).
/// `mode` is one of all, status or exec.
pub fn check(opts: &ExtProcOpts, mode: &str) -> Result<()> {
    let (run_status, run_exec) = match mode {
        "all" => (true, true),
        "status" => (true, false),
        "exec" => (false, true),
        other => anyhow::bail!("Invalid check mode: {}, must be 'all', 'status' or 'exec'", other),
    };

    let mut allowed = true;
    if run_status {
        info!("[Check status command]:");
        let regex = compile_status_regex(&opts.status_regex)?;
        allowed = status_allows_exec(opts, regex.as_ref(), true)?;
    }

    if allowed && run_exec {
        info!("[Check exec command]: {}", opts.exec_command);
        let slot = Arc::new(ProcessSlot::new());
        let stopper = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                std::thread::sleep(CHECK_EXEC_LIMIT);
                slot.terminate("external process check", &TerminationPolicy::companion());
            })
        };
        let status = run_supervised(
            &super::process::ShellLauncher,
            &opts.exec_command,
            &slot,
            || {},
            |line| info!("  [OUTPUT]        : {}", line),
        )?;
        info!("  [DONE] {:?}", status);
        drop(stopper);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::process::ShellLauncher;
    use crate::worker::tests::wait_until;
    use crate::worker::Worker;

    fn opts(status: &str, regex: &str, exec: &str) -> ExtProcOpts {
        ExtProcOpts {
            enabled: true,
            status_command: status.to_string(),
            status_regex: regex.to_string(),
            exec_command: exec.to_string(),
            ..ExtProcOpts::default()
        }
    }

    #[test]
    fn test_status_gate() {
        let matching = opts("printf 'scanner: ready\\n'", "^scanner: ready$", "");
        let regex = compile_status_regex(&matching.status_regex).unwrap();
        assert!(status_allows_exec(&matching, regex.as_ref(), false).unwrap());

        let missing = opts("echo idle", "ready", "");
        let regex = compile_status_regex(&missing.status_regex).unwrap();
        assert!(!status_allows_exec(&missing, regex.as_ref(), false).unwrap());

        assert!(status_allows_exec(&opts("", "", ""), None, false).unwrap());
        assert!(!status_allows_exec(&opts("exit 3", "", ""), None, false).unwrap());
    }

    #[test]
    fn test_body_runs_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let body = ExtProcBody {
            opts: opts(
                "",
                "",
                &format!("touch '{}'; while true; do sleep 0.05; done", marker.display()),
            ),
            regex: None,
            launcher: Arc::new(ShellLauncher),
            slot: Arc::new(ProcessSlot::new()),
            logger: SessionLogger::disabled(false),
        };
        let slot = body.slot.clone();
        let worker = Worker::new("ext-proc", Arc::new(body));
        worker.start().unwrap();

        assert!(wait_until(Duration::from_secs(3), || marker.exists()));
        assert!(slot.terminate("ext proc", &TerminationPolicy::companion()));
        worker.stop().unwrap();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_invalid_mode() {
        assert!(check(&ExtProcOpts::default(), "bogus").is_err());
    }
}
