//! Wire shape of the worker protocol.
//!
//! Each direction carries one compact JSON object per line, UTF-8, newline
//! terminated. There is no length prefix, so every value must be free of raw
//! newlines; JSON string escaping guarantees that for text, and binary
//! payloads travel as standard base64.
//!
//! Requests are flat `string -> string` objects:
//! - synthesis: `{"lang": "ru", "text": "..."}`
//! - recognition: `{"audio_path": "/tmp/upload.ogg"}`
//!
//! Responses carry `ok` (required boolean), an optional `error` string, and
//! any other keys as payload (`wav_b64` for synthesis, an open mapping for
//! recognition).

use std::collections::BTreeMap;
use std::io::{self, BufRead, Read};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SpeechError, SpeechResult};

pub const OK_KEY: &str = "ok";
pub const ERROR_KEY: &str = "error";
pub const TEXT_KEY: &str = "text";
pub const LANG_KEY: &str = "lang";
pub const AUDIO_PATH_KEY: &str = "audio_path";
pub const WAV_KEY: &str = "wav_b64";

/// Largest response line accepted by default (64 MiB of JSON, i.e. a few
/// minutes of base64 WAV).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// One request line: field name to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerRequest {
    fields: BTreeMap<String, String>,
}

impl WorkerRequest {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn synthesis(text: &str, lang: &str) -> Self {
        Self::new().with(TEXT_KEY, text).with(LANG_KEY, lang)
    }

    /// The worker opens the file by name, so the path must survive the trip
    /// through JSON unchanged.
    pub fn recognition(audio_path: &Path) -> SpeechResult<Self> {
        let Some(path) = audio_path.to_str() else {
            return Err(SpeechError::InvalidRequest(format!(
                "audio path {} is not valid UTF-8",
                audio_path.display()
            )));
        };
        Ok(Self::new().with(AUDIO_PATH_KEY, path))
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

/// One decoded response line.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub ok: bool,
    pub error: Option<String>,
    pub payload: Map<String, Value>,
}

impl WorkerResponse {
    #[must_use]
    pub fn success(payload: Map<String, Value>) -> Self {
        Self {
            ok: true,
            error: None,
            payload,
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            payload: Map::new(),
        }
    }

    /// Payload on success, `WorkerReported` otherwise.
    pub fn into_result(self) -> SpeechResult<Map<String, Value>> {
        if self.ok {
            return Ok(self.payload);
        }
        Err(SpeechError::WorkerReported(self.error.unwrap_or_else(|| {
            "worker reported failure without a message".to_owned()
        })))
    }
}

pub fn encode_request(request: &WorkerRequest) -> SpeechResult<Vec<u8>> {
    let mut line = serde_json::to_vec(&request.fields)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse a request line. Used by in-process workers and tests.
pub fn decode_request(line: &[u8]) -> SpeechResult<WorkerRequest> {
    let fields: BTreeMap<String, String> = serde_json::from_slice(trim_newline(line))
        .map_err(|error| SpeechError::Protocol(format!("request is not a string map: {error}")))?;
    Ok(WorkerRequest { fields })
}

pub fn encode_response(response: &WorkerResponse) -> SpeechResult<Vec<u8>> {
    let mut object = response.payload.clone();
    object.insert(OK_KEY.to_owned(), Value::Bool(response.ok));
    match &response.error {
        Some(message) => {
            object.insert(ERROR_KEY.to_owned(), Value::String(message.clone()));
        }
        None => {
            object.remove(ERROR_KEY);
        }
    }
    let mut line = serde_json::to_vec(&Value::Object(object))?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one response line.
///
/// Validation stops at "JSON object with a boolean `ok`"; every other key is
/// handed through as payload.
pub fn decode_response(line: &[u8]) -> SpeechResult<WorkerResponse> {
    let value: Value = serde_json::from_slice(trim_newline(line))
        .map_err(|error| SpeechError::Protocol(format!("response is not valid JSON: {error}")))?;
    let Value::Object(mut object) = value else {
        return Err(SpeechError::Protocol(
            "response is not a JSON object".to_owned(),
        ));
    };

    let ok = match object.remove(OK_KEY) {
        Some(Value::Bool(ok)) => ok,
        Some(other) => {
            return Err(SpeechError::Protocol(format!(
                "`{OK_KEY}` must be a boolean, got {other}"
            )));
        }
        None => {
            return Err(SpeechError::Protocol(format!(
                "response lacks `{OK_KEY}` key"
            )));
        }
    };

    let error = match object.remove(ERROR_KEY) {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message),
        Some(other) => Some(other.to_string()),
    };

    Ok(WorkerResponse {
        ok,
        error,
        payload: object,
    })
}

/// Read one frame (a line without its terminator) of at most `max_len`
/// bytes.
///
/// `Ok(None)` means the peer closed the stream cleanly between frames. A
/// final chunk without a newline means the peer died mid-line and is
/// reported as `UnexpectedEof`. A line longer than `max_len` is
/// `InvalidData`; at most `max_len + 2` bytes are buffered to find that out.
pub fn read_frame<R: BufRead>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>> {
    let budget = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(2);
    let mut line = Vec::new();
    if reader.by_ref().take(budget).read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if u64::try_from(line.len()).unwrap_or(u64::MAX) >= budget {
            return Err(frame_too_long(max_len));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream closed after {} bytes of an unterminated line", line.len()),
        ));
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    if line.len() > max_len {
        return Err(frame_too_long(max_len));
    }
    Ok(Some(line))
}

fn frame_too_long(max_len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("response line exceeds {max_len} bytes"),
    )
}

/// Decode the synthesis payload into raw audio bytes.
pub fn decode_wav_payload(payload: &Map<String, Value>) -> SpeechResult<Vec<u8>> {
    let Some(encoded) = payload.get(WAV_KEY).and_then(Value::as_str) else {
        return Err(SpeechError::Protocol(format!(
            "synthesis response lacks string `{WAV_KEY}`"
        )));
    };
    STANDARD
        .decode(encoded)
        .map_err(|error| SpeechError::Protocol(format!("`{WAV_KEY}` is not valid base64: {error}")))
}

#[must_use]
pub fn wav_payload(audio: &[u8]) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert(WAV_KEY.to_owned(), Value::String(STANDARD.encode(audio)));
    payload
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;

    use super::*;

    #[test]
    fn request_is_one_line_with_single_terminator() {
        let request = WorkerRequest::synthesis("строка\nвторая \"кавычки\"", "ru");
        let line = encode_request(&request).expect("encode");
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(decode_request(&line).expect("decode"), request);
    }

    #[test]
    fn request_keys_are_sorted_and_compact() {
        let line = encode_request(&WorkerRequest::synthesis("hallo", "de")).expect("encode");
        assert_eq!(line, b"{\"lang\":\"de\",\"text\":\"hallo\"}\n");
    }

    #[test]
    fn recognition_request_carries_audio_path() {
        let request = WorkerRequest::recognition(Path::new("/tmp/upload.ogg")).expect("request");
        assert_eq!(request.get(AUDIO_PATH_KEY), Some("/tmp/upload.ogg"));
        assert_eq!(request.keys().collect::<Vec<_>>(), vec![AUDIO_PATH_KEY]);
    }

    #[cfg(unix)]
    #[test]
    fn recognition_request_rejects_non_utf8_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/tmp/upload_\xff.wav"));
        let err = WorkerRequest::recognition(path).expect_err("lossy path");
        assert!(matches!(err, SpeechError::InvalidRequest(_)), "got {err:?}");
    }

    #[test]
    fn decode_request_rejects_non_string_values() {
        let err = decode_request(b"{\"text\":1}\n").expect_err("must fail");
        assert!(matches!(err, SpeechError::Protocol(_)));
    }

    #[test]
    fn response_roundtrip_preserves_fields() {
        let mut payload = Map::new();
        payload.insert("language".to_owned(), json!("en"));
        payload.insert("segments".to_owned(), json!([{"start": 0.0, "text": "hi"}]));
        let response = WorkerResponse::success(payload);
        let line = encode_response(&response).expect("encode");
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(decode_response(&line).expect("decode"), response);

        let failure = WorkerResponse::failure("espeak-ng exited 1");
        let line = encode_response(&failure).expect("encode");
        assert_eq!(decode_response(&line).expect("decode"), failure);
    }

    #[test]
    fn encode_response_drops_stale_error_key_from_payload() {
        let mut payload = Map::new();
        payload.insert(ERROR_KEY.to_owned(), json!("stale"));
        let line = encode_response(&WorkerResponse::success(payload)).expect("encode");
        let decoded = decode_response(&line).expect("decode");
        assert_eq!(decoded.error, None);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = decode_response(b"Traceback (most recent call last):\n").expect_err("fail");
        assert!(matches!(err, SpeechError::Protocol(_)), "got {err:?}");
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = decode_response(b"[true]").expect_err("fail");
        assert!(err.to_string().contains("not a JSON object"), "got {err}");
    }

    #[test]
    fn decode_requires_boolean_ok() {
        let missing = decode_response(b"{\"error\":\"audio_path not provided\"}").unwrap_err();
        assert!(missing.to_string().contains("lacks `ok`"), "got {missing}");

        let wrong = decode_response(b"{\"ok\":\"yes\"}").unwrap_err();
        assert!(wrong.to_string().contains("must be a boolean"), "got {wrong}");
    }

    #[test]
    fn decode_normalizes_error_field() {
        let null = decode_response(b"{\"ok\":false,\"error\":null}").expect("decode");
        assert_eq!(null.error, None);

        let numeric = decode_response(b"{\"ok\":false,\"error\":42}").expect("decode");
        assert_eq!(numeric.error.as_deref(), Some("42"));
    }

    #[test]
    fn into_result_maps_failure_to_worker_reported() {
        let err = WorkerResponse::failure("x").into_result().expect_err("fail");
        match err {
            SpeechError::WorkerReported(message) => assert_eq!(message, "x"),
            other => panic!("unexpected error: {other:?}"),
        }

        let bare = WorkerResponse {
            ok: false,
            error: None,
            payload: Map::new(),
        };
        assert!(bare.into_result().unwrap_err().to_string().contains("without a message"));
    }

    #[test]
    fn read_frame_splits_lines_and_reports_clean_eof() {
        let mut reader = Cursor::new(b"{\"ok\":true}\r\n{\"ok\":false}\n".to_vec());
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).unwrap(), Some(b"{\"ok\":true}".to_vec()));
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).unwrap(), Some(b"{\"ok\":false}".to_vec()));
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).unwrap(), None);
    }

    #[test]
    fn read_frame_flags_truncated_line() {
        let mut reader = Cursor::new(b"{\"ok\":tr".to_vec());
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).expect_err("truncated");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_frame_rejects_oversized_line() {
        let mut exact = Cursor::new(b"12345678\r\n".to_vec());
        assert_eq!(read_frame(&mut exact, 8).unwrap(), Some(b"12345678".to_vec()));

        let mut long = Cursor::new(b"123456789\n".to_vec());
        let err = read_frame(&mut long, 8).expect_err("too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut endless = Cursor::new(vec![b'x'; 4096]);
        let err = read_frame(&mut endless, 16).expect_err("unterminated and too long");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(endless.position(), 18, "reads stop just past the limit");
    }

    #[test]
    fn wav_payload_decodes_to_original_bytes() {
        let audio = b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec();
        let payload = wav_payload(&audio);
        assert_eq!(decode_wav_payload(&payload).expect("decode"), audio);
    }

    #[test]
    fn wav_payload_errors_are_protocol_errors() {
        let missing = decode_wav_payload(&Map::new()).unwrap_err();
        assert!(matches!(missing, SpeechError::Protocol(_)));

        let mut bad = Map::new();
        bad.insert(WAV_KEY.to_owned(), json!("***"));
        let invalid = decode_wav_payload(&bad).unwrap_err();
        assert!(invalid.to_string().contains("not valid base64"), "got {invalid}");
    }
}
