//! Child process launch, output capture and escalating termination

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Signals sent in order, each followed by a bounded wait for exit.
#[derive(Debug, Clone)]
pub struct TerminationPolicy {
    pub steps: Vec<(Signal, Duration)>,
}

impl TerminationPolicy {
    /// Give the recorder time to finalize the container on SIGINT.
    pub fn recorder() -> Self {
        Self {
            steps: vec![
                (Signal::Interrupt, Duration::from_secs(5)),
                (Signal::Terminate, Duration::from_millis(1500)),
                (Signal::Kill, Duration::from_millis(1500)),
            ],
        }
    }

    pub fn companion() -> Self {
        Self {
            steps: vec![
                (Signal::Interrupt, Duration::from_millis(1500)),
                (Signal::Terminate, Duration::from_millis(1500)),
            ],
        }
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::recorder()
    }
}

/// Starts a command line as a child process with stdout piped.
pub trait ProcessLauncher: Send + Sync + 'static {
    fn launch(&self, command: &str) -> io::Result<Child>;
}

/// Runs commands through `sh -c` in their own process group so signals
/// reach the shell and everything it started.
pub struct ShellLauncher;

impl ProcessLauncher for ShellLauncher {
    fn launch(&self, command: &str) -> io::Result<Child> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd.spawn()
    }
}

/// The child owned by one worker, shared with whoever needs to stop it.
/// The child stays here until reaped, so its pid is never reused while a
/// signal can still be sent to it.
#[derive(Default)]
pub struct ProcessSlot {
    child: Mutex<Option<Child>>,
}

impl ProcessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, child: Child) {
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
    }

    pub fn pid(&self) -> Option<u32> {
        self.child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(Child::id)
    }

    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Signal the child's process group. Returns false when there is no live child.
    pub fn signal(&self, signal: Signal) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(child) = guard.as_mut() else {
            return false;
        };
        if !matches!(child.try_wait(), Ok(None)) {
            return false;
        }
        send_signal(child, signal)
    }

    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive() {
                return true;
            }
            thread::sleep(EXIT_POLL);
        }
        !self.is_alive()
    }

    /// Escalate through `policy` until the child exits. Returns false if
    /// there was nothing to terminate.
    pub fn terminate(&self, label: &str, policy: &TerminationPolicy) -> bool {
        if !self.is_alive() {
            return false;
        }
        for (signal, wait) in &policy.steps {
            info!("Terminating {} with {:?}", label, signal);
            self.signal(*signal);
            if self.wait_for_exit(*wait) {
                info!("{} exited after {:?}", label, signal);
                return true;
            }
        }
        if self.is_alive() {
            warn!("{} is still alive after {:?}", label, policy.steps.last().map(|s| s.0));
        }
        true
    }

    /// Block until the child is reaped and release it.
    fn reap(&self) -> io::Result<Option<ExitStatus>> {
        loop {
            {
                let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(child) = guard.as_mut() else {
                    return Ok(None);
                };
                if let Some(status) = child.try_wait()? {
                    *guard = None;
                    return Ok(Some(status));
                }
            }
            thread::sleep(EXIT_POLL);
        }
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: Signal) -> bool {
    let pgid = child.id() as libc::pid_t;
    // Negative pid addresses the process group created at launch.
    let rc = unsafe { libc::kill(-pgid, signal.as_raw()) };
    if rc != 0 {
        debug!("kill({}, {:?}) failed: {}", -pgid, signal, io::Error::last_os_error());
        return false;
    }
    true
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, signal: Signal) -> bool {
    match signal {
        Signal::Kill => child.kill().is_ok(),
        _ => false,
    }
}

/// Launch `command`, feed its output to `on_line` one chunk at a time and
/// wait for it to exit. `on_activity` fires for every read, even partial ones.
pub fn run_supervised(
    launcher: &dyn ProcessLauncher,
    command: &str,
    slot: &ProcessSlot,
    mut on_activity: impl FnMut(),
    mut on_line: impl FnMut(&str),
) -> io::Result<Option<ExitStatus>> {
    let mut child = launcher.launch(command)?;
    let stdout = child.stdout.take();
    debug!("Launched pid {}: {}", child.id(), command);
    slot.attach(child);

    if let Some(stdout) = stdout {
        if let Err(e) = pump_output(stdout, &mut on_activity, &mut on_line) {
            warn!("Failed to read process output: {}", e);
        }
    }
    slot.reap()
}

/// Split a byte stream into chunks on `\n` or `\r`; empty chunks are skipped.
pub fn pump_output<R: Read>(
    mut reader: R,
    mut on_activity: impl FnMut(),
    mut on_line: impl FnMut(&str),
) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        on_activity();
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    on_line(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        on_line(&String::from_utf8_lossy(&pending));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pump_splits_on_cr_and_lf() {
        let input: &[u8] = b"frame=1\rframe=2\r\nsize=10kB\n\ntail";
        let mut lines = Vec::new();
        let mut reads = 0;
        pump_output(input, || reads += 1, |l| lines.push(l.to_string())).unwrap();
        assert_eq!(lines, vec!["frame=1", "frame=2", "size=10kB", "tail"]);
        assert!(reads >= 1);
    }

    #[test]
    fn test_run_supervised_collects_output() {
        let slot = ProcessSlot::new();
        let mut lines = Vec::new();
        let status = run_supervised(&ShellLauncher, "echo one; echo two", &slot, || {}, |l| {
            lines.push(l.to_string())
        })
        .unwrap();
        assert!(status.unwrap().success());
        assert_eq!(lines, vec!["one", "two"]);
        assert!(!slot.is_alive());
        assert!(!slot.signal(Signal::Kill));
    }

    #[test]
    fn test_terminate_escalates() {
        let slot = Arc::new(ProcessSlot::new());
        let runner = {
            let slot = slot.clone();
            thread::spawn(move || {
                // The trap keeps SIGINT from ending the shell.
                run_supervised(
                    &ShellLauncher,
                    "trap '' INT; while true; do echo tick; sleep 0.05; done",
                    &slot,
                    || {},
                    |_| {},
                )
            })
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !slot.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(slot.is_alive());

        let policy = TerminationPolicy {
            steps: vec![
                (Signal::Interrupt, Duration::from_millis(200)),
                (Signal::Terminate, Duration::from_secs(2)),
            ],
        };
        assert!(slot.terminate("looper", &policy));
        assert!(!slot.is_alive());
        runner.join().unwrap().unwrap();
        assert!(!slot.terminate("looper", &policy));
    }
}
