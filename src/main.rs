use clap::Parser;
use lingua_speech::backfill::BackfillJob;
use lingua_speech::cli::{Cli, Command, WorkerRole};
use lingua_speech::client::{Synthesizer, WorkerClient};
use lingua_speech::config::SpeechConfig;
use lingua_speech::store::JsonFileStore;
use lingua_speech::{SpeechError, SpeechResult};

fn main() {
    lingua_speech::logging::init();

    if let Err(error) = run() {
        eprintln!("error [{}]: {error}", error.error_code());
        std::process::exit(1);
    }
}

fn run() -> SpeechResult<()> {
    let cli = Cli::parse();
    let env = SpeechConfig::from_env();

    match cli.command {
        Command::Synthesize(args) => {
            let config = args.worker.apply(env, WorkerRole::Synthesis);
            let spec = config.tts_spec().ok_or_else(|| {
                SpeechError::InvalidRequest("no TTS worker configured (--worker)".to_owned())
            })?;
            let client = WorkerClient::start(&spec, config.response_timeout())?
                .with_max_frame_bytes(config.max_frame_bytes);
            let audio = client.synthesize(&args.text, args.lang.code())?;
            std::fs::write(&args.out, &audio)?;

            if args.json {
                let summary = serde_json::json!({
                    "event": "synthesized",
                    "lang": args.lang,
                    "bytes": audio.len(),
                    "out": args.out.display().to_string(),
                });
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!("{} bytes -> {}", audio.len(), args.out.display());
            }
            client.shutdown()
        }
        Command::Recognize(args) => {
            let config = args.worker.apply(env, WorkerRole::Recognition);
            let spec = config.stt_spec().ok_or_else(|| {
                SpeechError::InvalidRequest("no recognition worker configured (--worker)".to_owned())
            })?;
            let client = WorkerClient::start(&spec, config.response_timeout())?
                .with_max_frame_bytes(config.max_frame_bytes);
            let alignment = client.recognize(&args.audio)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({ "alignment": alignment }))?
            );
            client.shutdown()
        }
        Command::Backfill(args) => {
            let config = args.worker.apply(env, WorkerRole::Synthesis);
            let store = JsonFileStore::open(&args.store)?;
            let client = match config.tts_spec() {
                Some(spec) => Some(
                    WorkerClient::start(&spec, config.response_timeout())?
                        .with_max_frame_bytes(config.max_frame_bytes),
                ),
                None => None,
            };
            let synthesizer = client.as_ref().map(|c| c as &dyn Synthesizer);
            let report = BackfillJob::new(&store, synthesizer)
                .with_concurrency(args.concurrency.unwrap_or(config.backfill_concurrency))
                .run()?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.skipped {
                println!("backfill skipped: TTS disabled");
            } else {
                println!(
                    "backfill: {} generated, {} already filled, {} failed across {} records",
                    report.generated,
                    report.already_filled,
                    report.failed(),
                    report.targets
                );
            }
            match client {
                Some(client) => client.shutdown(),
                None => Ok(()),
            }
        }
    }
}
