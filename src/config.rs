use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::process::{DEFAULT_PYTHON_BIN, WorkerSpec};

pub const PYTHON_BIN_ENV: &str = "LINGUA_SPEECH_PYTHON_BIN";
pub const TTS_WORKER_ENV: &str = "LINGUA_SPEECH_TTS_WORKER";
pub const STT_WORKER_ENV: &str = "LINGUA_SPEECH_STT_WORKER";
pub const TIMEOUT_ENV: &str = "LINGUA_SPEECH_TIMEOUT_MS";
pub const BACKFILL_CONCURRENCY_ENV: &str = "LINGUA_SPEECH_BACKFILL_CONCURRENCY";
pub const MAX_FRAME_BYTES_ENV: &str = "LINGUA_SPEECH_MAX_FRAME_BYTES";

pub const TTS_WORKER_NAME: &str = "tts";
pub const STT_WORKER_NAME: &str = "stt";

/// Worker wiring for the host process.
///
/// No TTS worker path means synthesis is disabled, which callers (the
/// backfill job in particular) treat as a normal state rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpeechConfig {
    /// Interpreter for worker scripts; `None` runs entries directly.
    pub interpreter: Option<String>,
    pub tts_worker: Option<PathBuf>,
    pub stt_worker: Option<PathBuf>,
    /// Bounded wait for each response. `None` waits indefinitely.
    pub response_timeout_ms: Option<u64>,
    pub backfill_concurrency: usize,
    /// Longest response line accepted from a worker.
    pub max_frame_bytes: usize,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            interpreter: Some(DEFAULT_PYTHON_BIN.to_owned()),
            tts_worker: None,
            stt_worker: None,
            response_timeout_ms: None,
            backfill_concurrency: 1,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SpeechConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build from a key lookup. An interpreter set to the empty string means
    /// "run the worker entry directly".
    pub fn from_source<F>(mut source: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let interpreter = match source(PYTHON_BIN_ENV) {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().to_owned()),
            None => defaults.interpreter,
        };
        Self {
            interpreter,
            tts_worker: path_from_source(&mut source, TTS_WORKER_ENV),
            stt_worker: path_from_source(&mut source, STT_WORKER_ENV),
            response_timeout_ms: positive_from_source(&mut source, TIMEOUT_ENV),
            backfill_concurrency: positive_from_source(&mut source, BACKFILL_CONCURRENCY_ENV)
                .map_or(defaults.backfill_concurrency, |n| n as usize),
            max_frame_bytes: positive_from_source(&mut source, MAX_FRAME_BYTES_ENV)
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.max_frame_bytes),
        }
    }

    #[must_use]
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    #[must_use]
    pub fn tts_spec(&self) -> Option<WorkerSpec> {
        self.spec(TTS_WORKER_NAME, self.tts_worker.as_ref())
    }

    #[must_use]
    pub fn stt_spec(&self) -> Option<WorkerSpec> {
        self.spec(STT_WORKER_NAME, self.stt_worker.as_ref())
    }

    fn spec(&self, name: &str, entry: Option<&PathBuf>) -> Option<WorkerSpec> {
        entry.map(|entry| {
            WorkerSpec::executable(name, entry.clone()).with_interpreter(self.interpreter.clone())
        })
    }
}

fn path_from_source<F>(source: &mut F, key: &str) -> Option<PathBuf>
where
    F: FnMut(&str) -> Option<String>,
{
    source(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn positive_from_source<F>(source: &mut F, key: &str) -> Option<u64>
where
    F: FnMut(&str) -> Option<String>,
{
    source(key)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}
