//! Subprocess execution with a hard timeout.
//!
//! Every helper binary hwseal touches (`cryptsetup`, `lsblk`, `ip`, ...) goes
//! through [`ProcessRunner`] so provider logic stays testable with fake
//! binaries and deterministic stdout.

use crate::error::{HwsealError, HwsealResult};
use log::debug;
use std::env;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of one invocation.
#[derive(Debug, Clone)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Prefer stderr, fall back to stdout, trimmed.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        self.stdout.trim().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    binary: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Run the binary with `args`, optionally feeding `input` on stdin.
    pub fn run(&self, args: &[&str], input: Option<&[u8]>) -> HwsealResult<Output> {
        debug!("exec {} {}", self.binary.display(), args.join(" "));

        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            HwsealError::Provider(format!(
                "failed to execute {}: {err}",
                self.binary.display()
            ))
        })?;

        // The child may exit before reading stdin; it is still reaped and its
        // diagnostic wins over the broken pipe.
        let mut write_error = None;
        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(payload).and_then(|()| stdin.flush()) {
                    write_error = Some(err);
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let output = self.wait_with_timeout(child, stdout_pipe, stderr_pipe)?;

        match write_error {
            Some(err) if output.success() => Err(HwsealError::Provider(format!(
                "failed to write input to {}: {err}",
                self.binary.display()
            ))),
            Some(err) => {
                debug!("{}: stdin write failed: {err}", self.binary.display());
                Ok(output)
            }
            None => Ok(output),
        }
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> HwsealResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        if exit_status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HwsealError::Provider(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        }

        let stdout = stdout_handle
            .join()
            .map_err(|_| HwsealError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| HwsealError::Provider("stderr reader thread panicked".into()))??;

        let status = exit_status.and_then(|s| s.code()).unwrap_or(-1);
        debug!("{} exited with {status}", self.binary.display());

        Ok(Output {
            stdout,
            stderr,
            status,
        })
    }
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<HwsealResult<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> HwsealResult<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}

/// Locate a helper binary: explicit override, then well-known paths, then `PATH`.
///
/// An override that does not exist is an error rather than a silent fallback.
pub fn resolve_binary(
    name: &str,
    configured: Option<&str>,
    candidates: &[&str],
) -> HwsealResult<PathBuf> {
    if let Some(path) = configured.map(str::trim).filter(|path| !path.is_empty()) {
        let candidate = Path::new(path);
        if !candidate.exists() {
            return Err(HwsealError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate.to_path_buf());
    }

    for candidate in candidates {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }

    find_in_path(name).ok_or_else(|| {
        HwsealError::Provider(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        candidate.exists().then_some(candidate)
    })
}
