use std::collections::BTreeMap;
use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type RecordId = i64;

/// Whatever the recognition worker returned. Its shape is owned by the
/// worker and may change between worker versions.
pub type RecognitionResult = Map<String, Value>;

/// Languages that carry a source text / generated audio pair.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Ru,
    En,
    De,
}

impl Language {
    /// Processing order for backfill.
    pub const ALL: [Self; 3] = [Self::Ru, Self::En, Self::De];

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Ru => "ru",
            Self::En => "en",
            Self::De => "de",
        }
    }

    #[must_use]
    pub const fn source_field(self) -> &'static str {
        match self {
            Self::Ru => "text_ru",
            Self::En => "text_en",
            Self::De => "text_de",
        }
    }

    #[must_use]
    pub const fn artifact_field(self) -> &'static str {
        match self {
            Self::Ru => "audio_ru",
            Self::En => "audio_en",
            Self::De => "audio_de",
        }
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|language| language.code().eq_ignore_ascii_case(code.trim()))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A persisted record as far as audio generation is concerned: per-language
/// source text and (possibly absent) generated audio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechRecord {
    pub id: RecordId,
    #[serde(default)]
    pub text: BTreeMap<Language, String>,
    #[serde(default, with = "audio_b64")]
    pub audio: BTreeMap<Language, Vec<u8>>,
}

impl SpeechRecord {
    #[must_use]
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self, language: Language, text: impl Into<String>) -> Self {
        self.text.insert(language, text.into());
        self
    }

    #[must_use]
    pub fn with_audio(mut self, language: Language, audio: Vec<u8>) -> Self {
        self.audio.insert(language, audio);
        self
    }

    /// Non-empty source text whose audio is absent.
    #[must_use]
    pub fn missing_source(&self, language: Language) -> Option<&str> {
        if self.audio.contains_key(&language) {
            return None;
        }
        self.text
            .get(&language)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }
}

/// Row returned by a "missing artifact for language L" query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    pub record_id: RecordId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingField {
    pub language: Language,
    pub source_text: String,
    pub field: &'static str,
}

/// One record with every field the backfill has to fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillTarget {
    pub record_id: RecordId,
    pub fields: Vec<MissingField>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Generate,
    Persist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFailure {
    pub record_id: RecordId,
    pub language: Language,
    pub stage: FailureStage,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillReport {
    pub started_at_rfc3339: String,
    pub finished_at_rfc3339: String,
    /// True when no synthesizer was configured and nothing was attempted.
    pub skipped: bool,
    pub targets: usize,
    pub attempted: usize,
    pub generated: usize,
    /// Fields that gained audio from elsewhere while being generated.
    #[serde(default)]
    pub already_filled: usize,
    pub failures: Vec<FieldFailure>,
}

impl BackfillReport {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Serde adapter storing audio bytes as base64 strings.
mod audio_b64 {
    use std::collections::BTreeMap;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Language;

    pub fn serialize<S: Serializer>(
        audio: &BTreeMap<Language, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        audio
            .iter()
            .map(|(language, bytes)| (*language, STANDARD.encode(bytes)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Language, Vec<u8>>, D::Error> {
        BTreeMap::<Language, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(language, encoded)| {
                STANDARD
                    .decode(encoded)
                    .map(|bytes| (language, bytes))
                    .map_err(|error| D::Error::custom(format!("audio {language}: {error}")))
            })
            .collect()
    }
}
