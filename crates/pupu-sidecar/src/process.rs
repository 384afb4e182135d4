use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessSignal {
    Terminate,
    Kill,
}

/// Handle to a child owned by its watcher task.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<ProcessSignal>,
    exited: CancellationToken,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    /// SIGTERM on unix, a hard kill elsewhere.
    pub fn terminate(&self) {
        let _ = self.signals.send(ProcessSignal::Terminate);
    }

    pub fn kill(&self) {
        let _ = self.signals.send(ProcessSignal::Kill);
    }

    /// Graceful terminate, then a forced kill if the child outlives `grace`.
    /// Returns immediately.
    pub fn shutdown(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        self.terminate();
        let control = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = control.exited() => {}
                _ = tokio::time::sleep(grace) => {
                    tracing::warn!(pid = ?control.pid, "child ignored terminate, killing");
                    control.kill();
                }
            }
        });
    }
}

/// Moves `child` into a watcher task and returns its control handle.
/// `on_exit` runs once, after the child has been reaped.
pub fn watch_child<F>(mut child: Child, on_exit: F) -> ProcessControl
where
    F: FnOnce(std::io::Result<ExitStatus>) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let exited = CancellationToken::new();
    let control = ProcessControl {
        pid: child.id(),
        signals: tx,
        exited: exited.clone(),
    };

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = rx.recv() => match signal {
                    ProcessSignal::Terminate => send_terminate(&mut child),
                    ProcessSignal::Kill => {
                        let _ = child.start_kill();
                    }
                },
            }
        };
        exited.cancel();
        on_exit(status);
    });

    control
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// `(code, signal)` rendered the way exit reasons are reported.
pub fn describe_exit(status: &std::io::Result<ExitStatus>) -> (String, String) {
    let Ok(status) = status else {
        return ("null".to_string(), "null".to_string());
    };
    let code = status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "null".to_string());
    (code, exit_signal(status))
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(libc::SIGHUP) => "SIGHUP".to_string(),
        Some(libc::SIGINT) => "SIGINT".to_string(),
        Some(libc::SIGABRT) => "SIGABRT".to_string(),
        Some(libc::SIGKILL) => "SIGKILL".to_string(),
        Some(libc::SIGSEGV) => "SIGSEGV".to_string(),
        Some(libc::SIGTERM) => "SIGTERM".to_string(),
        Some(other) => other.to_string(),
        None => "null".to_string(),
    }
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> String {
    "null".to_string()
}
