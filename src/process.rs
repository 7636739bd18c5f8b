use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;

use crate::error::{SpeechError, SpeechResult};
use crate::logging::WORKER_LOG_TARGET;

pub const DEFAULT_PYTHON_BIN: &str = "python3";

/// Environment forced onto every worker so both ends of the pipe agree on
/// UTF-8 regardless of the host locale.
const UTF8_ENV: [(&str, &str); 2] = [("PYTHONIOENCODING", "utf-8"), ("PYTHONUTF8", "1")];

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// How to launch one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Label used in logs and thread names (`tts`, `stt`, ...).
    pub name: String,
    /// Program that runs `entry`. `None` executes `entry` directly.
    pub interpreter: Option<String>,
    pub entry: PathBuf,
    pub env: Vec<(String, String)>,
}

impl WorkerSpec {
    pub fn python(name: impl Into<String>, entry: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            interpreter: Some(DEFAULT_PYTHON_BIN.to_owned()),
            entry: entry.into(),
            env: Vec::new(),
        }
    }

    pub fn executable(name: impl Into<String>, entry: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            interpreter: None,
            entry: entry.into(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_interpreter(mut self, interpreter: Option<String>) -> Self {
        self.interpreter = interpreter.filter(|value| !value.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn rendered(&self) -> String {
        match &self.interpreter {
            Some(interpreter) => format!("{interpreter} {}", self.entry.display()),
            None => self.entry.display().to_string(),
        }
    }

    fn command(&self) -> Command {
        let mut command = match &self.interpreter {
            Some(interpreter) => {
                let mut command = Command::new(interpreter);
                command.arg(&self.entry);
                command
            }
            None => Command::new(&self.entry),
        };
        command.envs(UTF8_ENV);
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command
    }
}

/// A running worker and the protocol ends of its pipes.
///
/// The stderr pipe is handed to a drain thread at start; stdin and stdout
/// stay here until the client takes them. Dropping the value kills and
/// reaps the child.
pub struct WorkerProcess {
    name: String,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    terminated: bool,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    pub fn start(spec: &WorkerSpec) -> SpeechResult<Self> {
        let rendered = spec.rendered();
        if !spec.entry.is_file() {
            return Err(SpeechError::launch(
                rendered,
                format!("entry point `{}` does not exist", spec.entry.display()),
            ));
        }
        if let Some(interpreter) = &spec.interpreter {
            if !command_exists(interpreter) {
                return Err(SpeechError::launch(
                    rendered,
                    format!("interpreter `{interpreter}` not found on PATH"),
                ));
            }
        }

        tracing::info!(worker = %spec.name, command = %rendered, "launching worker");
        let mut child = spec
            .command()
            .spawn()
            .map_err(|error| SpeechError::launch(&rendered, error))?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            reap(&mut child);
            return Err(SpeechError::launch(rendered, "worker stdio pipes unavailable"));
        };

        let drain_name = spec.name.clone();
        let drain = thread::Builder::new()
            .name(format!("{}-stderr", spec.name))
            .spawn(move || {
                let forwarded = forward_diagnostics(&drain_name, stderr);
                tracing::debug!(worker = %drain_name, forwarded, "worker stderr closed");
            });
        if let Err(error) = drain {
            reap(&mut child);
            return Err(SpeechError::launch(rendered, error));
        }

        tracing::info!(worker = %spec.name, pid, "worker started");
        Ok(Self {
            name: spec.name.clone(),
            pid,
            child,
            stdin: Some(stdin),
            stdout: Some(stdout),
            terminated: false,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// `Some(status)` once the worker has exited.
    pub fn try_exit_status(&mut self) -> SpeechResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Kill and reap the worker. Calling it again is a no-op.
    pub fn terminate(&mut self) -> SpeechResult<()> {
        if self.terminated {
            return Ok(());
        }
        self.stdin.take();
        let status = match self.child.try_wait()? {
            Some(status) => status,
            None => {
                let _ = self.child.kill();
                self.child.wait()?
            }
        };
        self.terminated = true;
        tracing::info!(worker = %self.name, pid = self.pid, %status, "worker terminated");
        Ok(())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Err(error) = self.terminate() {
            tracing::warn!(worker = %self.name, pid = self.pid, "failed to reap worker: {error}");
        }
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Forward every non-empty line from `reader` to the log sink until EOF.
/// Returns the number of lines forwarded.
pub(crate) fn forward_diagnostics<R: Read>(worker: &str, reader: R) -> usize {
    let mut forwarded = 0;
    for chunk in BufReader::new(reader).split(b'\n') {
        let Ok(bytes) = chunk else {
            break;
        };
        let line = String::from_utf8_lossy(&bytes);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        tracing::info!(target: WORKER_LOG_TARGET, worker = %worker, "{line}");
        forwarded += 1;
    }
    forwarded
}
