#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use lingua_speech::codec::{self, WorkerRequest, WorkerResponse};
use lingua_speech::process::WorkerSpec;

/// Write a POSIX shell worker into `dir` and return a spec that runs it
/// through `sh`.
pub fn sh_worker(dir: &Path, name: &str, body: &str) -> WorkerSpec {
    let path = dir.join(format!("{name}.sh"));
    std::fs::write(&path, body).expect("write worker script");
    WorkerSpec::executable(name, path).with_interpreter(Some("sh".to_owned()))
}

/// Worker answering every request line with `response` (a JSON object
/// without trailing newline). Emits a diagnostic line on stderr first.
pub fn constant_worker(dir: &Path, name: &str, response: &str) -> WorkerSpec {
    let body = format!(
        "echo 'worker ready' >&2\n\
         while IFS= read -r line; do\n\
         \techo \"request: $line\" >&2\n\
         \tprintf '%s\\n' '{response}'\n\
         done\n"
    );
    sh_worker(dir, name, &body)
}

/// Worker that fails requests for `lang` and returns `AQID` (bytes 1,2,3)
/// for everything else.
pub fn failing_lang_worker(dir: &Path, lang: &str) -> WorkerSpec {
    let body = format!(
        "while IFS= read -r line; do\n\
         \tcase \"$line\" in\n\
         \t*'\"lang\":\"{lang}\"'*) printf '%s\\n' '{{\"ok\":false,\"error\":\"no voice for {lang}\"}}' ;;\n\
         \t*) printf '%s\\n' '{{\"ok\":true,\"wav_b64\":\"AQID\"}}' ;;\n\
         \tesac\n\
         done\n"
    );
    sh_worker(dir, "tts", &body)
}

pub fn missing_entry() -> PathBuf {
    PathBuf::from("/nonexistent_lingua_speech_dir/tts_daemon.py")
}

/// What the in-process worker observed.
#[derive(Debug, Default)]
pub struct FakeLedger {
    pub awaiting_response: bool,
    pub violations: usize,
    pub requests: Vec<WorkerRequest>,
}

/// Worker stdin: forwards each complete line to the worker thread and flags
/// a violation whenever a request arrives while one is still unanswered.
pub struct FakeStdin {
    pending: Vec<u8>,
    ledger: Arc<Mutex<FakeLedger>>,
    lines: Sender<Vec<u8>>,
}

impl Write for FakeStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            {
                let mut ledger = self.ledger.lock().unwrap();
                if ledger.awaiting_response {
                    ledger.violations += 1;
                }
                ledger.awaiting_response = true;
            }
            self.lines
                .send(line)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "fake worker gone"))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Worker stdout: yields response lines as the worker thread produces them.
pub struct FakeStdout {
    chunks: Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl Read for FakeStdout {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.current.len() {
            match self.chunks.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Spawn an in-process worker that takes `delay` per request and answers
/// with `respond`.
pub fn fake_worker<F>(delay: Duration, respond: F) -> (FakeStdin, FakeStdout, Arc<Mutex<FakeLedger>>)
where
    F: Fn(&WorkerRequest) -> WorkerResponse + Send + 'static,
{
    let ledger = Arc::new(Mutex::new(FakeLedger::default()));
    let (line_tx, line_rx) = mpsc::channel::<Vec<u8>>();
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>();

    let worker_ledger = Arc::clone(&ledger);
    thread::spawn(move || {
        for line in line_rx {
            thread::sleep(delay);
            let response = match codec::decode_request(&line) {
                Ok(request) => {
                    let response = respond(&request);
                    worker_ledger.lock().unwrap().requests.push(request);
                    response
                }
                Err(error) => WorkerResponse::failure(error.to_string()),
            };
            let encoded = codec::encode_response(&response).expect("encode response");
            worker_ledger.lock().unwrap().awaiting_response = false;
            if out_tx.send(encoded).is_err() {
                break;
            }
        }
    });

    (
        FakeStdin {
            pending: Vec::new(),
            ledger: Arc::clone(&ledger),
            lines: line_tx,
        },
        FakeStdout {
            chunks: out_rx,
            current: Vec::new(),
            pos: 0,
        },
        ledger,
    )
}
