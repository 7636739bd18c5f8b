#![forbid(unsafe_code)]

pub mod backfill;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod process;
pub mod store;

pub use backfill::BackfillJob;
pub use client::{Synthesizer, WorkerClient};
pub use codec::{WorkerRequest, WorkerResponse};
pub use error::{SpeechError, SpeechResult};
pub use model::{BackfillReport, Language, RecognitionResult, SpeechRecord};
pub use process::{WorkerProcess, WorkerSpec};
pub use store::{AudioStore, JsonFileStore, MemoryStore};
