//! In-process fakes for worker processes, players and engines.
//!
//! Fake workers understand a few text conventions:
//! - `"die"` exits the worker without answering
//! - `"fail..."` answers with an error record
//! - a trailing `@<ms>` delays the answer, e.g. `"chunk 2@40"`

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Notify};

use super::engine::LocalEngine;
use super::worker::{WorkerHandle, WorkerIo, WorkerLauncher, WorkerMessage, WorkerRequest};
use super::TtsError;
use crate::audio::{AudioError, Playback};

/// Split `"text@40"` (or `"text@40."`) into `("text", 40ms)`.
pub fn parse_delay(text: &str) -> (&str, Duration) {
    if let Some((head, tail)) = text.rsplit_once('@') {
        let digits: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(ms) = digits.parse::<u64>() {
            return (head, Duration::from_millis(ms));
        }
    }
    (text, Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Worker launcher
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LauncherLog {
    dispatched: Mutex<Vec<(usize, u64)>>,
    in_flight: Mutex<Vec<usize>>,
    max_in_flight: AtomicUsize,
    killed: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Launches fake workers as tokio tasks connected through in-memory pipes.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    dir: Option<PathBuf>,
    silent: HashSet<usize>,
    crash: HashSet<usize>,
    unlaunchable: bool,
    chatty: bool,
    log: Arc<LauncherLog>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write each chunk's text into a real file under `dir`.
    pub fn writing_files(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    /// Worker `index` never reports ready.
    pub fn silent(mut self, index: usize) -> Self {
        self.silent.insert(index);
        self
    }

    /// Worker `index` exits immediately.
    pub fn crash_on_start(mut self, index: usize) -> Self {
        self.crash.insert(index);
        self
    }

    /// Every launch fails.
    pub fn unlaunchable(mut self) -> Self {
        self.unlaunchable = true;
        self
    }

    /// Workers print non-protocol lines around their records.
    pub fn chatty(mut self) -> Self {
        self.chatty = true;
        self
    }

    pub fn result_path(&self, id: u64) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.join(format!("chunk-{}.wav", id)),
            None => PathBuf::from(format!("/tmp/voice-speak-fake-{}.wav", id)),
        }
    }

    /// `(worker, task id)` in the order workers received them.
    pub fn dispatch_log(&self) -> Vec<(usize, u64)> {
        self.log.dispatched.lock().unwrap().clone()
    }

    pub fn max_in_flight_per_worker(&self) -> usize {
        self.log.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn all_killed(&self) -> bool {
        self.log
            .killed
            .lock()
            .unwrap()
            .iter()
            .all(|k| k.load(Ordering::SeqCst))
    }
}

struct FakeHandle {
    kill: Option<oneshot::Sender<()>>,
    killed: Arc<AtomicBool>,
}

impl WorkerHandle for FakeHandle {
    fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, index: usize) -> io::Result<WorkerIo> {
        if self.unlaunchable {
            return Err(io::Error::new(io::ErrorKind::NotFound, "fake worker missing"));
        }

        let (host, worker) = tokio::io::duplex(64 * 1024);
        let (host_out, host_in) = tokio::io::split(host);
        let (kill_tx, kill_rx) = oneshot::channel();
        let killed = Arc::new(AtomicBool::new(false));

        {
            let mut in_flight = self.log.in_flight.lock().unwrap();
            if in_flight.len() <= index {
                in_flight.resize(index + 1, 0);
            }
        }
        self.log.killed.lock().unwrap().push(Arc::clone(&killed));

        let launcher = self.clone();
        tokio::spawn(async move { launcher.run_worker(index, worker, kill_rx).await });

        Ok(WorkerIo {
            stdin: Box::new(host_in),
            stdout: Box::new(host_out),
            handle: Box::new(FakeHandle {
                kill: Some(kill_tx),
                killed,
            }),
        })
    }
}

impl FakeLauncher {
    async fn run_worker(
        self,
        index: usize,
        stream: tokio::io::DuplexStream,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        if self.crash.contains(&index) {
            return;
        }
        let (reader, mut writer) = tokio::io::split(stream);

        // Separate reader so requests are counted the moment they arrive.
        let (req_tx, mut req_rx) = mpsc::unbounded_channel::<WorkerRequest>();
        let log = Arc::clone(&self.log);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(request) = serde_json::from_str::<WorkerRequest>(&line) else {
                    continue;
                };
                let WorkerRequest::Generate { id, .. } = &request;
                log.dispatched.lock().unwrap().push((index, *id));
                let now = {
                    let mut in_flight = log.in_flight.lock().unwrap();
                    in_flight[index] += 1;
                    in_flight[index]
                };
                log.max_in_flight.fetch_max(now, Ordering::SeqCst);
                if req_tx.send(request).is_err() {
                    break;
                }
            }
        });

        if self.chatty {
            let _ = writer.write_all(b"loading voices...\n").await;
        }
        if !self.silent.contains(&index) {
            let _ = send(&mut writer, &WorkerMessage::Ready).await;
        }

        loop {
            let request = tokio::select! {
                _ = &mut kill_rx => break,
                request = req_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let WorkerRequest::Generate { id, text, .. } = request;
            let (text, delay) = parse_delay(&text);

            if text == "die" {
                break;
            }
            tokio::select! {
                _ = &mut kill_rx => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let reply = if text.starts_with("fail") {
                WorkerMessage::Error {
                    id,
                    message: format!("synthesis failed for {}", text),
                }
            } else {
                let path = self.result_path(id);
                if self.dir.is_some() {
                    if let Err(e) = tokio::fs::write(&path, text).await {
                        panic!("fake worker could not write {}: {}", path.display(), e);
                    }
                }
                WorkerMessage::Result { id, path }
            };

            self.log.in_flight.lock().unwrap()[index] -= 1;
            if self.chatty {
                let _ = writer.write_all(b"progress 100%\n").await;
            }
            if send(&mut writer, &reply).await.is_err() {
                break;
            }
        }

        reader_task.abort();
    }
}

async fn send<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, message: &WorkerMessage) -> io::Result<()> {
    let mut line = serde_json::to_string(message).map_err(io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// Records what was played. File contents are recorded when readable.
pub struct FakePlayer {
    played: Mutex<Vec<String>>,
    paths: Mutex<Vec<PathBuf>>,
    duration: Duration,
    stops: AtomicUsize,
    stopped: Notify,
    fail: bool,
}

impl FakePlayer {
    pub fn new(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            duration,
            stops: AtomicUsize::new(0),
            stopped: Notify::new(),
            fail: false,
        })
    }

    /// A player whose every play fails.
    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            duration: Duration::ZERO,
            stops: AtomicUsize::new(0),
            stopped: Notify::new(),
            fail: true,
        })
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` plays have started.
    pub async fn wait_for_plays(&self, n: usize) {
        for _ in 0..500 {
            if self.played.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} plays, saw {:?}", n, self.played());
    }
}

impl Playback for FakePlayer {
    fn play<'a>(
        &'a self,
        path: &'a Path,
    ) -> Pin<Box<dyn Future<Output = Result<(), AudioError>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail {
                return Err(AudioError::NoPlayer {
                    tried: "fake".into(),
                });
            }
            // Register for stop() before the play becomes observable.
            let stopped = self.stopped.notified();
            tokio::pin!(stopped);
            stopped.as_mut().enable();

            let label = match std::fs::read(path) {
                Ok(bytes) if bytes.starts_with(b"RIFF") => format!("wav:{}", bytes.len()),
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => path.display().to_string(),
            };
            self.played.lock().unwrap().push(label);
            self.paths.lock().unwrap().push(path.to_path_buf());

            tokio::select! {
                _ = stopped => {}
                _ = tokio::time::sleep(self.duration) => {}
            }
            Ok(())
        })
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stopped.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Direct-mode engine returning a short burst of samples per chunk.
#[derive(Default)]
pub struct FakeEngine {
    generated: Mutex<Vec<String>>,
    pub fail_load: bool,
}

impl FakeEngine {
    pub fn generated(&self) -> Vec<String> {
        self.generated.lock().unwrap().clone()
    }
}

impl LocalEngine for FakeEngine {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<(), TtsError>> + Send + '_>> {
        Box::pin(async move {
            if self.fail_load {
                Err(TtsError::Init("fake engine missing".into()))
            } else {
                Ok(())
            }
        })
    }

    fn generate<'a>(
        &'a self,
        text: &'a str,
        _voice: &'a str,
        _speed: f32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>, TtsError>> + Send + 'a>> {
        Box::pin(async move {
            let (text, delay) = parse_delay(text);
            tokio::time::sleep(delay).await;
            if text.starts_with("fail") {
                return Err(TtsError::Synthesis(format!("engine rejected {}", text)));
            }
            self.generated.lock().unwrap().push(text.to_string());
            Ok(vec![0.1; 64])
        })
    }

    fn sample_rate(&self) -> u32 {
        16_000
    }
}

// ---------------------------------------------------------------------------
// Speech server
// ---------------------------------------------------------------------------

/// One speech request seen by [`FakeSpeechServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

#[derive(Default)]
struct ServerLog {
    requests: Mutex<Vec<RecordedRequest>>,
    probes: AtomicUsize,
}

/// Minimal OpenAI-style speech server on a random local port.
///
/// Speech responses echo the request `input` (minus any `@ms` delay) as the
/// audio body, or answer `status` with `server exploded` when it is not 200.
pub struct FakeSpeechServer {
    pub url: String,
    log: Arc<ServerLog>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeSpeechServer {
    pub async fn start(status: u16) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(ServerLog::default());

        let server_log = Arc::clone(&log);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&server_log);
                tokio::spawn(async move {
                    let _ = serve_one(stream, status, log).await;
                });
            }
        });

        Self { url, log, task }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.requests.lock().unwrap().clone()
    }

    /// Number of availability probes (`GET /v1/models`).
    pub fn probes(&self) -> usize {
        self.log.probes.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSpeechServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_one(
    mut stream: tokio::net::TcpStream,
    status: u16,
    log: Arc<ServerLog>,
) -> io::Result<()> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let header = |name: &str| {
        head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    };
    let content_length: usize = header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    let body_end = buf.len().min(header_end + content_length);
    let body = &buf[header_end..body_end];

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();

    let (code, payload): (u16, Vec<u8>) = match (method.as_str(), path.as_str()) {
        ("GET", "/v1/models") => {
            log.probes.fetch_add(1, Ordering::SeqCst);
            (200, br#"{"data":[]}"#.to_vec())
        }
        ("POST", "/v1/audio/speech") => {
            let json: serde_json::Value = serde_json::from_slice(body).unwrap_or_default();
            log.requests.lock().unwrap().push(RecordedRequest {
                authorization: header("authorization"),
                body: json.clone(),
            });
            let input = json["input"].as_str().unwrap_or_default().to_string();
            let (label, delay) = parse_delay(&input);
            tokio::time::sleep(delay).await;
            if status == 200 {
                (200, label.as_bytes().to_vec())
            } else {
                (status, b"server exploded".to_vec())
            }
        }
        _ => (404, b"not found".to_vec()),
    };

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        code,
        if code == 200 { "OK" } else { "Error" },
        payload.len()
    )
    .into_bytes();
    if method != "HEAD" {
        response.extend_from_slice(&payload);
    }
    stream.write_all(&response).await?;
    stream.shutdown().await
}
