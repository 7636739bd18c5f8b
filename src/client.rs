//! Serialized request/response client for one worker process.
//!
//! The protocol has no request identifiers, so a response can only be matched
//! to its request by position on the pipe. [`WorkerClient`] therefore holds a
//! single lock across the whole round trip (encode, write, flush, wait,
//! decode): at most one request is ever in flight, and callers queue behind
//! it. Throughput is bounded by the worker's per-request latency.
//!
//! The worker's stdout is consumed by a dedicated reader thread that turns it
//! into a channel of frames. That lets a call wait with an optional deadline
//! instead of blocking on the pipe forever.
//!
//! Once a round trip fails at the transport or protocol level (broken pipe,
//! EOF, timeout, malformed line) the client cannot know whether the stream is
//! still aligned, so it marks the session unusable and every later call fails
//! fast with [`SpeechError::Transport`]. The owned worker is terminated at
//! that point. A worker-reported error leaves the session healthy.

use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::codec::{self, WorkerRequest, WorkerResponse};
use crate::error::{SpeechError, SpeechResult};
use crate::model::RecognitionResult;
use crate::process::{WorkerProcess, WorkerSpec};

/// Anything that can turn text into audio bytes.
pub trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str, lang: &str) -> SpeechResult<Vec<u8>>;
}

type Frame = std::io::Result<Option<Vec<u8>>>;

struct Session {
    writer: Box<dyn Write + Send>,
    /// Worker stdout until the first round trip hands it to the reader thread.
    reader: Option<Box<dyn Read + Send>>,
    frames: Option<Receiver<Frame>>,
    broken: Option<String>,
}

impl Session {
    fn frames(&mut self, name: &str, max_frame_bytes: usize) -> SpeechResult<&Receiver<Frame>> {
        if let Some(reader) = self.reader.take() {
            let (tx, rx) = mpsc::channel();
            thread::Builder::new()
                .name(format!("{name}-stdout"))
                .spawn(move || {
                    let mut reader = BufReader::new(reader);
                    loop {
                        let frame = codec::read_frame(&mut reader, max_frame_bytes);
                        let last = !matches!(frame, Ok(Some(_)));
                        if tx.send(frame).is_err() || last {
                            break;
                        }
                    }
                })
                .map_err(|error| SpeechError::transport("start output reader", error))?;
            self.frames = Some(rx);
        }
        self.frames.as_ref().ok_or_else(reader_gone)
    }

    fn exchange(
        &mut self,
        line: &[u8],
        timeout: Option<Duration>,
        name: &str,
        max_frame_bytes: usize,
    ) -> SpeechResult<WorkerResponse> {
        self.frames(name, max_frame_bytes)?;
        self.writer
            .write_all(line)
            .and_then(|()| self.writer.flush())
            .map_err(|error| SpeechError::transport("write request", error))?;

        let frames = self.frames(name, max_frame_bytes)?;
        let frame = match timeout {
            Some(limit) => match frames.recv_timeout(limit) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SpeechError::Transport(format!(
                        "no response within {}ms",
                        limit.as_millis()
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(reader_gone()),
            },
            None => frames.recv().map_err(|_| reader_gone())?,
        };

        match frame {
            Ok(Some(bytes)) => codec::decode_response(&bytes),
            Ok(None) => Err(SpeechError::Transport(
                "worker closed its output stream".to_owned(),
            )),
            Err(error) => Err(SpeechError::transport("read response", error)),
        }
    }
}

fn reader_gone() -> SpeechError {
    SpeechError::Transport("worker output reader has stopped".to_owned())
}

pub struct WorkerClient {
    name: String,
    response_timeout: Option<Duration>,
    max_frame_bytes: usize,
    session: Mutex<Session>,
    process: Mutex<Option<WorkerProcess>>,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("name", &self.name)
            .field("response_timeout", &self.response_timeout)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl WorkerClient {
    /// Launch the worker described by `spec` and attach to its pipes.
    ///
    /// Any failure here is a [`SpeechError::Launch`]; the caller is expected
    /// to treat it as fatal.
    pub fn start(spec: &WorkerSpec, response_timeout: Option<Duration>) -> SpeechResult<Self> {
        let mut process = WorkerProcess::start(spec)?;
        let (Some(stdin), Some(stdout)) = (process.take_stdin(), process.take_stdout()) else {
            return Err(SpeechError::launch(&spec.name, "worker pipes already taken"));
        };
        let client = Self::from_streams(spec.name.clone(), stdin, stdout, response_timeout);
        *client.lock_process() = Some(process);
        Ok(client)
    }

    /// Run the protocol over an arbitrary writer/reader pair. No process is
    /// owned; `shutdown` only drops the session. The reader is consumed by a
    /// background thread from the first round trip on.
    pub fn from_streams<W, R>(
        name: impl Into<String>,
        writer: W,
        reader: R,
        response_timeout: Option<Duration>,
    ) -> Self
    where
        W: Write + Send + 'static,
        R: Read + Send + 'static,
    {
        Self {
            name: name.into(),
            response_timeout,
            max_frame_bytes: codec::DEFAULT_MAX_FRAME_BYTES,
            session: Mutex::new(Session {
                writer: Box::new(writer),
                reader: Some(Box::new(reader)),
                frames: None,
                broken: None,
            }),
            process: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    /// Cap the length of a response line. A longer line fails the call with
    /// [`SpeechError::Transport`] and closes the session. Applies from the
    /// first round trip; set it before making calls.
    #[must_use]
    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes.max(1);
        self
    }

    #[must_use]
    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Pid of the owned worker, if any and still tracked.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.lock_process().as_ref().map(WorkerProcess::pid)
    }

    /// Whether the session is still usable for round trips.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.lock_session().broken.is_none()
    }

    /// Submit one request and wait for its paired response.
    ///
    /// Returns the payload when the worker answers `ok: true`; maps
    /// `ok: false` to [`SpeechError::WorkerReported`].
    pub fn call(&self, request: &WorkerRequest) -> SpeechResult<Map<String, Value>> {
        self.round_trip(request)?.into_result()
    }

    /// Like [`call`](Self::call) but hands back the decoded response as is.
    pub fn round_trip(&self, request: &WorkerRequest) -> SpeechResult<WorkerResponse> {
        let line = codec::encode_request(request)?;
        let mut session = self.lock_session();
        if let Some(reason) = &session.broken {
            return Err(SpeechError::Transport(format!(
                "worker `{}` session is unusable after earlier failure: {reason}",
                self.name
            )));
        }

        let started_at = Instant::now();
        let outcome = session.exchange(
            &line,
            self.response_timeout,
            &self.name,
            self.max_frame_bytes,
        );
        let elapsed_ms = started_at.elapsed().as_millis();
        match &outcome {
            Ok(response) => {
                tracing::debug!(
                    worker = %self.name,
                    keys = ?request.keys().collect::<Vec<_>>(),
                    ok = response.ok,
                    elapsed_ms,
                    "worker round trip"
                );
            }
            Err(error @ (SpeechError::Transport(_) | SpeechError::Protocol(_))) => {
                session.broken = Some(error.to_string());
                tracing::warn!(
                    worker = %self.name,
                    code = error.error_code(),
                    elapsed_ms,
                    "worker round trip failed; session closed: {error}"
                );
                // A broken session is never reused; stop its worker now.
                if let Err(stop_error) = self.shutdown() {
                    tracing::warn!(worker = %self.name, "failed to stop worker: {stop_error}");
                }
            }
            Err(error) => {
                tracing::warn!(worker = %self.name, elapsed_ms, "worker round trip failed: {error}");
            }
        }
        outcome
    }

    /// Synthesize `text` in `lang` and return the decoded audio bytes.
    pub fn synthesize(&self, text: &str, lang: &str) -> SpeechResult<Vec<u8>> {
        if text.trim().is_empty() || lang.trim().is_empty() {
            return Err(SpeechError::InvalidRequest(
                "synthesis needs non-empty text and lang".to_owned(),
            ));
        }
        let payload = self.call(&WorkerRequest::synthesis(text, lang))?;
        codec::decode_wav_payload(&payload)
    }

    /// Ask the recognition worker to process the audio file at `audio_path`.
    /// The payload is returned untouched.
    pub fn recognize(&self, audio_path: &Path) -> SpeechResult<RecognitionResult> {
        if audio_path.as_os_str().is_empty() {
            return Err(SpeechError::InvalidRequest(
                "recognition needs an audio path".to_owned(),
            ));
        }
        self.call(&WorkerRequest::recognition(audio_path)?)
    }

    /// Terminate the owned worker. A call blocked on the pipe is released with
    /// a transport error once the worker's stdout closes.
    pub fn shutdown(&self) -> SpeechResult<()> {
        let process = self.lock_process().take();
        match process {
            Some(mut process) => process.terminate(),
            None => Ok(()),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_process(&self) -> MutexGuard<'_, Option<WorkerProcess>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Synthesizer for WorkerClient {
    fn synthesize(&self, text: &str, lang: &str) -> SpeechResult<Vec<u8>> {
        WorkerClient::synthesize(self, text, lang)
    }
}
