//! Worker process protocol and launching.
//!
//! Workers speak newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! host -> worker  {"type":"generate","id":7,"text":"Hello.","voice":"af_heart","speed":1.0}
//! worker -> host  {"type":"ready"}
//! worker -> host  {"type":"result","id":7,"path":"/tmp/kokoro-7.wav"}
//! worker -> host  {"type":"error","id":7,"message":"voice not found"}
//! ```
//!
//! Anything on stdout that is not a protocol record is logged and skipped,
//! so a chatty model library cannot corrupt the stream.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Host -> worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Generate {
        id: u64,
        text: String,
        voice: String,
        speed: f32,
    },
}

/// Worker -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Model loaded; the worker accepts requests from now on.
    Ready,
    Result { id: u64, path: PathBuf },
    Error { id: u64, message: String },
}

/// Encode a request as one protocol line (trailing newline included).
pub fn encode_request(request: &WorkerRequest) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    Ok(line)
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines, carrying a trailing partial line over
/// to the next `push`.
///
/// Works on bytes so a multi-byte character split across two reads is
/// reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and return every completed, non-blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Bytes received after the last newline.
    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }
}

// ---------------------------------------------------------------------------
// Launching
// ---------------------------------------------------------------------------

/// Kill switch for a launched worker.
pub trait WorkerHandle: Send {
    /// Forcefully terminate the worker. Must not block.
    fn kill(&mut self);
}

/// The streams and handle of one launched worker.
pub struct WorkerIo {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn WorkerHandle>,
}

/// Starts worker processes for the pool.
pub trait WorkerLauncher: Send + Sync {
    /// Start worker number `index`. Called from inside the tokio runtime.
    fn launch(&self, index: usize) -> io::Result<WorkerIo>;
}

/// Launches workers as child processes from a configured command line.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }

    /// Build from `["python3", "worker.py"]`. Empty → `None`.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program, args))
    }
}

struct ChildHandle {
    index: usize,
    child: Child,
}

impl WorkerHandle for ChildHandle {
    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(worker = self.index, error = %e, "Worker already gone");
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, index: usize) -> io::Result<WorkerIo> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("VOICE_SPEAK_WORKER_INDEX", index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;

        // Model libraries log to stderr; keep it out of the host's terminal.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker = index, "{}", line);
                }
            });
        }

        debug!(worker = index, program = %self.program, pid = ?child.id(), "Worker spawned");

        Ok(WorkerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            handle: Box::new(ChildHandle { index, child }),
        })
    }
}

/// Write one already-encoded line and flush.
pub(crate) async fn write_line<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    line: &str,
) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
