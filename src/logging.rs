//! `tracing` setup for the binary.
//!
//! `RUST_LOG` wins when set. Otherwise the crate logs at INFO and the
//! forwarded worker stderr (target [`WORKER_LOG_TARGET`]) follows
//! `LINGUA_SPEECH_WORKER_LOG`, so a chatty model daemon can be muted
//! (`off`) or traced (`debug`) without touching the rest of the output.
//! `RUST_LOG_FORMAT=json` switches to JSON lines. Output goes to stderr.

use tracing_subscriber::EnvFilter;

/// Target used when forwarding lines from a worker's stderr.
pub const WORKER_LOG_TARGET: &str = "lingua_speech::worker";

/// Level directive for [`WORKER_LOG_TARGET`] (`off`, `warn`, `debug`, ...).
pub const WORKER_LOG_ENV: &str = "LINGUA_SPEECH_WORKER_LOG";

const CRATE_DIRECTIVE: &str = "lingua_speech=info";

/// Filter directives used when `RUST_LOG` is unset.
#[must_use]
pub fn default_directives(worker_level: Option<&str>) -> String {
    match worker_level.map(str::trim).filter(|level| !level.is_empty()) {
        Some(level) => format!("{CRATE_DIRECTIVE},{WORKER_LOG_TARGET}={level}"),
        None => CRATE_DIRECTIVE.to_owned(),
    }
}

fn worker_filter(worker_level: Option<&str>) -> EnvFilter {
    EnvFilter::try_new(default_directives(worker_level)).unwrap_or_else(|error| {
        eprintln!("ignoring {WORKER_LOG_ENV}: {error}");
        EnvFilter::new(CRATE_DIRECTIVE)
    })
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let worker_level = std::env::var(WORKER_LOG_ENV).ok();
        worker_filter(worker_level.as_deref())
    });

    let json = std::env::var("RUST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
