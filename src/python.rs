//! Python process runner
//!
//! Spawns the external interpreter and exposes two consumption modes:
//! full buffered completion (exit code + stdout/stderr chunks) and a
//! structured-data side channel (an extra pipe on fd 3 carrying one JSON
//! payload). Exit code is data here, not a failure signal: the wrapped
//! unittest runner reports test failures through a non-zero but meaningful
//! exit code, so `monitor` resolves on any close and only `spawn` itself
//! can fail.

use std::ffi::OsStr;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use os_pipe::PipeReader;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Module-search-path environment variable for the interpreter
const ENV_PYTHON_PATH: &str = "PYTHONPATH";
/// Text-encoding environment variable for the interpreter's std streams
const ENV_IO_ENCODING: &str = "PYTHONIOENCODING";
/// File descriptor the child uses for the structured-data side channel
const DATA_FD: i32 = 3;

/// Text encodings the interpreter's standard streams can be set to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16,
    Utf32,
    Ascii,
    Latin1,
    Cp1252,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Utf16 => "utf-16",
            Encoding::Utf32 => "utf-32",
            Encoding::Ascii => "ascii",
            Encoding::Latin1 => "latin1",
            Encoding::Cp1252 => "cp1252",
        }
    }
}

/// Options for one interpreter invocation
#[derive(Debug, Default, Clone)]
pub struct PythonOptions {
    /// Working directory for the child process
    pub cwd: Option<PathBuf>,
    /// Value for the module-search-path variable, set per invocation
    pub python_path: Option<PathBuf>,
    /// Stream encoding (defaults to UTF-8)
    pub encoding: Option<Encoding>,
    /// Attach the fd-3 structured-data pipe
    pub pipe_data: bool,
}

impl PythonOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_python_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.python_path = Some(dir.into());
        self
    }

    pub fn with_pipe_data(mut self, value: bool) -> Self {
        self.pipe_data = value;
        self
    }
}

/// Raw capture of one subprocess run
#[derive(Debug, Default, Clone)]
pub struct ProcessResult {
    pub process_id: Option<u32>,
    /// None when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Captured stderr, decoded once after the stream closed
    pub errors: Vec<String>,
    /// Captured stdout, decoded once after the stream closed
    pub output: Vec<String>,
}

impl ProcessResult {
    pub fn stdout_text(&self) -> String {
        self.output.concat()
    }

    pub fn stderr_text(&self) -> String {
        self.errors.concat()
    }

    /// Stdout coerced to complete lines for display
    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout_text().lines().map(str::to_string).collect()
    }
}

/// Launcher for external interpreter processes
#[derive(Debug, Clone)]
pub struct Python {
    executable: String,
}

impl Default for Python {
    fn default() -> Self {
        Self::new("python")
    }
}

impl Python {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Spawn an interpreter process. Spawn failure (executable missing,
    /// permission denied) is the only error path; everything the child does
    /// afterwards is reported through [`PythonProcess::monitor`].
    pub fn spawn<I, S>(&self, args: I, options: &PythonOptions) -> Result<PythonProcess>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.executable);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env(
            ENV_IO_ENCODING,
            options.encoding.unwrap_or_default().as_str(),
        );
        if let Some(path) = &options.python_path {
            cmd.env(ENV_PYTHON_PATH, path);
        }
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        // stdin@0, stdout@1, stderr@2, data@3
        let mut side_channel = None;
        let mut parent_writer = None;
        if options.pipe_data {
            let (reader, writer) = os_pipe::pipe().context("Failed to create data pipe")?;
            let writer_fd = writer.as_raw_fd();
            unsafe {
                // Runs in the child between fork and exec: expose the write
                // end as fd 3. dup2 clears close-on-exec on the new fd.
                cmd.pre_exec(move || {
                    if libc::dup2(writer_fd, DATA_FD) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            side_channel = Some(SideChannel { reader });
            parent_writer = Some(writer);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.executable))?;
        // Parent's copy of the write end must close, otherwise the reader
        // never sees EOF.
        drop(parent_writer);

        let pid = child.id();
        debug!(pid, "Spawned python process");
        Ok(PythonProcess {
            child,
            pid,
            side_channel,
        })
    }

    /// Spawn and collect the full buffered result.
    pub async fn execute<I, S>(&self, args: I, options: &PythonOptions) -> Result<ProcessResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.spawn(args, options)?.monitor().await
    }
}

/// A live interpreter process
pub struct PythonProcess {
    child: tokio::process::Child,
    pid: Option<u32>,
    side_channel: Option<SideChannel>,
}

impl PythonProcess {
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Detach the side channel so it can be read concurrently with
    /// [`monitor`](Self::monitor). Returns `None` when the process was
    /// spawned without `pipe_data` or the channel was already taken.
    pub fn take_side_channel(&mut self) -> Option<SideChannel> {
        self.side_channel.take()
    }

    /// Accumulate stdout and stderr to completion and wait for process
    /// close. Resolves regardless of exit code; a non-zero exit is data.
    /// Both streams are drained concurrently with the wait so neither pipe
    /// buffer can fill up and deadlock the child.
    pub async fn monitor(mut self) -> Result<ProcessResult> {
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        // The test runner takes no input; close stdin so the child never
        // blocks reading it.
        drop(self.child.stdin.take());

        let mut child = self.child;
        let (output, errors, status) = tokio::join!(
            read_stream(stdout),
            read_stream(stderr),
            child.wait()
        );
        let status = status.context("Failed waiting for python process")?;

        debug!(pid = self.pid, code = ?status.code(), "Python process closed");
        Ok(ProcessResult {
            process_id: self.pid,
            exit_code: status.code(),
            errors,
            output,
        })
    }
}

/// Read end of the fd-3 structured-data pipe
pub struct SideChannel {
    reader: PipeReader,
}

impl SideChannel {
    /// Read the pipe to end-of-stream and parse one JSON document.
    ///
    /// Side-channel data is a best-effort enhancement over the baseline
    /// stdout/stderr result: no data, a read error, or malformed JSON all
    /// resolve to `None` with a warning instead of failing the run.
    pub async fn read_json(self) -> Option<serde_json::Value> {
        let mut reader = self.reader;
        let read = tokio::task::spawn_blocking(move || {
            let mut text = String::new();
            reader.read_to_string(&mut text).map(|_| text)
        })
        .await;

        let text = match read {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                warn!("Side-channel read error: {}", error);
                return None;
            }
            Err(error) => {
                warn!("Side-channel read task failed: {}", error);
                return None;
            }
        };

        if text.trim().is_empty() {
            warn!("Side channel closed without sending any data");
            return None;
        }

        match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!("Failed to parse side-channel JSON: {}", error);
                None
            }
        }
    }

    /// Helper for awaiting an optional channel inside `tokio::join!`.
    pub async fn read_optional(channel: Option<SideChannel>) -> Option<serde_json::Value> {
        match channel {
            Some(channel) => channel.read_json().await,
            None => None,
        }
    }
}

/// Drain a stream to EOF, then decode the accumulated bytes in one pass so
/// a multi-byte character spanning read boundaries stays intact.
async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<String> {
    let Some(mut stream) = stream else {
        return Vec::new();
    };

    let mut bytes = Vec::new();
    if let Err(error) = stream.read_to_end(&mut bytes).await {
        // Whatever arrived before the error is still usable.
        warn!("Stream read error: {}", error);
    }
    if bytes.is_empty() {
        return Vec::new();
    }
    vec![String::from_utf8_lossy(&bytes).to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_collects_streams_and_exit_code() {
        let shell = Python::new("sh");
        let result = shell
            .execute(
                ["-c", "echo out-line; echo err-line >&2; exit 3"],
                &PythonOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(result.stdout_text().contains("out-line"));
        assert!(result.stderr_text().contains("err-line"));
    }

    #[tokio::test]
    async fn test_monitor_resolves_on_zero_exit() {
        let shell = Python::new("sh");
        let result = shell
            .execute(["-c", "echo hello"], &PythonOptions::new())
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout_lines(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_multibyte_output_survives_read_boundaries() {
        // 4095 filler bytes push the trailing two-byte character across a
        // typical read-buffer boundary.
        let shell = Python::new("sh");
        let result = shell
            .execute(
                ["-c", r#"printf '%4095s' '' | tr ' ' 'a'; printf '\303\251'"#],
                &PythonOptions::new(),
            )
            .await
            .unwrap();

        let text = result.stdout_text();
        assert!(text.ends_with('é'));
        assert!(!text.contains('\u{FFFD}'));
        assert_eq!(text.chars().count(), 4096);
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let missing = Python::new("/nonexistent/interpreter-for-tests");
        let result = missing.spawn(["-c", "true"], &PythonOptions::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_side_channel_reads_one_json_document() {
        let shell = Python::new("sh");
        let mut process = shell
            .spawn(
                ["-c", r#"printf '{"wasSuccessful": true}' >&3; echo plain"#],
                &PythonOptions::new().with_pipe_data(true),
            )
            .unwrap();

        let side = process.take_side_channel();
        let (result, json) = tokio::join!(process.monitor(), SideChannel::read_optional(side));

        let result = result.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(result.stdout_text().contains("plain"));

        let json = json.unwrap();
        assert_eq!(json["wasSuccessful"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_side_channel_without_data_resolves_none() {
        let shell = Python::new("sh");
        let mut process = shell
            .spawn(["-c", "true"], &PythonOptions::new().with_pipe_data(true))
            .unwrap();

        let side = process.take_side_channel();
        let (result, json) = tokio::join!(process.monitor(), SideChannel::read_optional(side));

        assert_eq!(result.unwrap().exit_code, Some(0));
        assert!(json.is_none());
    }

    #[tokio::test]
    async fn test_side_channel_malformed_json_resolves_none() {
        let shell = Python::new("sh");
        let mut process = shell
            .spawn(
                ["-c", "printf 'not-json' >&3"],
                &PythonOptions::new().with_pipe_data(true),
            )
            .unwrap();

        let side = process.take_side_channel();
        let (_, json) = tokio::join!(process.monitor(), SideChannel::read_optional(side));
        assert!(json.is_none());
    }
}
