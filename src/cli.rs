use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::SpeechConfig;
use crate::model::Language;

#[derive(Debug, Parser)]
#[command(name = "lingua_speech")]
#[command(about = "Drive speech synthesis/recognition workers over a line-delimited JSON pipe")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Synthesize one phrase through the TTS worker.
    Synthesize(SynthesizeArgs),
    /// Run one audio file through the recognition worker.
    Recognize(RecognizeArgs),
    /// Generate audio for every record missing it.
    Backfill(BackfillArgs),
}

/// Worker overrides shared by every subcommand. Unset flags fall back to the
/// `LINGUA_SPEECH_*` environment.
#[derive(Debug, Clone, Default, Args)]
pub struct WorkerArgs {
    /// Path to the worker entry point (script or executable).
    #[arg(long)]
    pub worker: Option<PathBuf>,

    /// Interpreter used to run the worker; pass an empty string to execute
    /// the entry directly.
    #[arg(long)]
    pub python: Option<String>,

    /// Give up on a response after this many milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Synthesis,
    Recognition,
}

impl WorkerArgs {
    /// Overlay these flags on `base`, targeting the worker for `role`.
    #[must_use]
    pub fn apply(&self, mut base: SpeechConfig, role: WorkerRole) -> SpeechConfig {
        if let Some(worker) = &self.worker {
            match role {
                WorkerRole::Synthesis => base.tts_worker = Some(worker.clone()),
                WorkerRole::Recognition => base.stt_worker = Some(worker.clone()),
            }
        }
        if let Some(python) = &self.python {
            base.interpreter = Some(python.trim().to_owned()).filter(|p| !p.is_empty());
        }
        if let Some(timeout_ms) = self.timeout_ms.filter(|ms| *ms > 0) {
            base.response_timeout_ms = Some(timeout_ms);
        }
        base
    }
}

#[derive(Debug, Clone, Args)]
pub struct SynthesizeArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Text (usually an IPA transcription) to speak.
    #[arg(long)]
    pub text: String,

    #[arg(long, value_enum)]
    pub lang: Language,

    /// Where to write the WAV bytes.
    #[arg(long)]
    pub out: PathBuf,

    /// Print a JSON summary instead of plain text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct RecognizeArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Audio file handed to the worker by path.
    #[arg(long)]
    pub audio: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct BackfillArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// JSON record store to reconcile.
    #[arg(long, default_value = ".lingua_speech/records.json")]
    pub store: PathBuf,

    /// Records processed at once (worker calls stay serialized).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Print the full JSON report.
    #[arg(long)]
    pub json: bool,
}
