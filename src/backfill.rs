//! One-shot reconciliation of missing generated audio.
//!
//! The job asks the store, per language, for records whose source text is
//! present and whose audio is absent, synthesizes each missing field, and
//! writes the result back. Failures are per field: they are logged, recorded
//! in the [`BackfillReport`], and never abort the run or undo earlier writes.
//! Because only absent fields are selected, running the job again converges
//! instead of regenerating.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::thread;

use chrono::Utc;

use crate::client::Synthesizer;
use crate::error::SpeechResult;
use crate::model::{
    BackfillReport, BackfillTarget, FailureStage, FieldFailure, Language, MissingField, RecordId,
};
use crate::store::AudioStore;

pub struct BackfillJob<'a> {
    store: &'a dyn AudioStore,
    synthesizer: Option<&'a dyn Synthesizer>,
    concurrency: usize,
}

enum FieldOutcome {
    Generated,
    /// Audio appeared while the field was being generated; it was kept.
    AlreadyFilled,
    Failed(FieldFailure),
}

impl<'a> BackfillJob<'a> {
    /// `synthesizer: None` means TTS is disabled and every run is a no-op.
    pub fn new(store: &'a dyn AudioStore, synthesizer: Option<&'a dyn Synthesizer>) -> Self {
        Self {
            store,
            synthesizer,
            concurrency: 1,
        }
    }

    /// Process up to `workers` records at once. Worker calls are still
    /// serialized by the client; this only overlaps queueing and persistence.
    #[must_use]
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Every record with at least one missing field, ordered by id; fields
    /// within a record follow [`Language::ALL`].
    pub fn collect_targets(&self) -> SpeechResult<Vec<BackfillTarget>> {
        let mut by_record: BTreeMap<RecordId, Vec<MissingField>> = BTreeMap::new();
        for language in Language::ALL {
            for row in self.store.records_missing(language)? {
                by_record.entry(row.record_id).or_default().push(MissingField {
                    language,
                    source_text: row.text,
                    field: language.artifact_field(),
                });
            }
        }
        Ok(by_record
            .into_iter()
            .map(|(record_id, fields)| BackfillTarget { record_id, fields })
            .collect())
    }

    pub fn run(&self) -> SpeechResult<BackfillReport> {
        self.run_filtered(None)
    }

    /// Fill the missing fields of a single record, e.g. right after it was
    /// created or edited.
    pub fn run_for_record(&self, record_id: RecordId) -> SpeechResult<BackfillReport> {
        self.run_filtered(Some(record_id))
    }

    fn run_filtered(&self, only: Option<RecordId>) -> SpeechResult<BackfillReport> {
        let started_at = Utc::now().to_rfc3339();
        let Some(synthesizer) = self.synthesizer else {
            tracing::info!("audio backfill skipped: no synthesizer configured");
            return Ok(BackfillReport {
                finished_at_rfc3339: started_at.clone(),
                started_at_rfc3339: started_at,
                skipped: true,
                ..BackfillReport::default()
            });
        };

        let mut targets = self.collect_targets()?;
        if let Some(record_id) = only {
            targets.retain(|target| target.record_id == record_id);
        }
        let target_count = targets.len();
        let field_count: usize = targets.iter().map(|target| target.fields.len()).sum();
        tracing::info!(
            records = target_count,
            fields = field_count,
            concurrency = self.concurrency,
            "audio backfill started"
        );

        let outcomes = if self.concurrency > 1 && target_count > 1 {
            self.fan_out(synthesizer, targets)
        } else {
            targets
                .iter()
                .flat_map(|target| self.fill_target(synthesizer, target))
                .collect()
        };

        let mut report = BackfillReport {
            started_at_rfc3339: started_at,
            targets: target_count,
            attempted: outcomes.len(),
            ..BackfillReport::default()
        };
        for outcome in outcomes {
            match outcome {
                FieldOutcome::Generated => report.generated += 1,
                FieldOutcome::AlreadyFilled => report.already_filled += 1,
                FieldOutcome::Failed(failure) => report.failures.push(failure),
            }
        }
        report
            .failures
            .sort_by_key(|failure| (failure.record_id, failure.language));
        report.finished_at_rfc3339 = Utc::now().to_rfc3339();

        tracing::info!(
            attempted = report.attempted,
            generated = report.generated,
            already_filled = report.already_filled,
            failed = report.failed(),
            "audio backfill finished"
        );
        Ok(report)
    }

    fn fan_out(
        &self,
        synthesizer: &dyn Synthesizer,
        targets: Vec<BackfillTarget>,
    ) -> Vec<FieldOutcome> {
        let queue = Mutex::new(targets.into_iter());
        let workers = self.concurrency.min(queue_len(&queue));
        thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(|| {
                        let mut outcomes = Vec::new();
                        loop {
                            let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                            let Some(target) = next else {
                                break;
                            };
                            outcomes.extend(self.fill_target(synthesizer, &target));
                        }
                        outcomes
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    }

    fn fill_target(
        &self,
        synthesizer: &dyn Synthesizer,
        target: &BackfillTarget,
    ) -> Vec<FieldOutcome> {
        target
            .fields
            .iter()
            .map(|field| self.fill_field(synthesizer, target.record_id, field))
            .collect()
    }

    fn fill_field(
        &self,
        synthesizer: &dyn Synthesizer,
        record_id: RecordId,
        field: &MissingField,
    ) -> FieldOutcome {
        let language = field.language;
        let audio = match synthesizer.synthesize(&field.source_text, language.code()) {
            Ok(audio) if audio.is_empty() => {
                return failed(
                    record_id,
                    language,
                    FailureStage::Generate,
                    "LS-EMPTY-AUDIO",
                    "synthesizer returned no audio".to_owned(),
                );
            }
            Ok(audio) => audio,
            Err(error) => {
                return failed(
                    record_id,
                    language,
                    FailureStage::Generate,
                    error.error_code(),
                    error.to_string(),
                );
            }
        };

        match self.store.store_artifact(record_id, language, &audio) {
            Ok(false) => {
                tracing::info!(
                    record_id,
                    lang = %language,
                    field = field.field,
                    "audio already present; generated bytes discarded"
                );
                FieldOutcome::AlreadyFilled
            }
            Ok(true) => {
                tracing::info!(
                    record_id,
                    lang = %language,
                    field = field.field,
                    bytes = audio.len(),
                    "audio generated"
                );
                FieldOutcome::Generated
            }
            Err(error) => failed(
                record_id,
                language,
                FailureStage::Persist,
                error.error_code(),
                error.to_string(),
            ),
        }
    }
}

fn failed(
    record_id: RecordId,
    language: Language,
    stage: FailureStage,
    code: &str,
    message: String,
) -> FieldOutcome {
    tracing::warn!(record_id, lang = %language, ?stage, code, "audio backfill field failed: {message}");
    FieldOutcome::Failed(FieldFailure {
        record_id,
        language,
        stage,
        code: code.to_owned(),
        message,
    })
}

fn queue_len<I: ExactSizeIterator>(queue: &Mutex<I>) -> usize {
    queue.lock().unwrap_or_else(PoisonError::into_inner).len()
}
