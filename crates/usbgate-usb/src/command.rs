//! Bounded execution of external query commands.
//!
//! A stalled enumeration tool must not stall the gate, so the child is killed
//! once it exceeds its timeout.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use usbgate_core::{GateError, GateResult};

#[derive(Debug, Clone)]
pub(crate) struct TimedCommand {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) status: i32,
}

impl TimedCommand {
    pub(crate) fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub(crate) fn run(&self, args: &[&str]) -> GateResult<Output> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                GateError::DeviceQuery(format!("failed to start {}: {err}", self.binary.display()))
            })?;

        let stdout_pipe = child.stdout.take();
        self.wait_with_timeout(child, stdout_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
    ) -> GateResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(GateError::DeviceQuery(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| GateError::DeviceQuery("stdout reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            status: status.code().unwrap_or(-1),
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<GateResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> GateResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_status() {
        let cmd = TimedCommand::new("/bin/sh", Duration::from_secs(5));
        let out = cmd.run(&["-c", "echo USBSTOR; exit 3"]).unwrap();
        assert_eq!(out.stdout.trim(), "USBSTOR");
        assert_eq!(out.status, 3);
    }

    #[test]
    fn kills_commands_that_overrun() {
        let cmd = TimedCommand::new("/bin/sh", Duration::from_millis(100));
        let started = Instant::now();
        let err = cmd.run(&["-c", "sleep 5"]).unwrap_err();
        assert!(matches!(err, GateError::DeviceQuery(message) if message.contains("timed out")));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_binary_is_a_query_error() {
        let cmd = TimedCommand::new("/nonexistent/wmic", Duration::from_secs(1));
        assert!(matches!(cmd.run(&[]), Err(GateError::DeviceQuery(_))));
    }
}
