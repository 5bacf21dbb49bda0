//! Prompt Replay - run prompt capture against a recorded page
//!
//! Loads a JSON page fixture, runs a full capture session over it (including
//! the scripted mutations and navigations), and prints the captured prompts.
//!
//! # Usage
//!
//! ```bash
//! prompt-replay page.json
//! prompt-replay --format markdown --platform claude page.json
//! ```

use prompt_capture::export::{self, ExportFormat, ExportOptions};
use prompt_capture::replay::{self, PageFixture};
use prompt_capture::{Config, EventBus, PlatformKind};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command line options
#[derive(Debug, Clone, Default)]
struct ReplayArgs {
    fixture: Option<PathBuf>,
    config_path: Option<PathBuf>,
    format: ExportFormat,
    platform: Option<PlatformKind>,
    include_metadata: bool,
    no_timestamps: bool,
}

/// Parse command line arguments
fn parse_args() -> ReplayArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = ReplayArgs::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("Prompt Replay v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    parsed.config_path = Some(PathBuf::from(&args[i]));
                }
            }
            "--format" | "-f" => {
                i += 1;
                if i < args.len() {
                    match args[i].parse() {
                        Ok(format) => parsed.format = format,
                        Err(e) => fail(&e),
                    }
                }
            }
            "--platform" | "-p" => {
                i += 1;
                if i < args.len() {
                    match args[i].parse() {
                        Ok(platform) => parsed.platform = Some(platform),
                        Err(e) => fail(&e),
                    }
                }
            }
            "--metadata" => {
                parsed.include_metadata = true;
            }
            "--no-timestamps" => {
                parsed.no_timestamps = true;
            }
            arg if !arg.starts_with('-') && parsed.fixture.is_none() => {
                parsed.fixture = Some(PathBuf::from(arg));
            }
            _ => fail(&format!("Unknown argument: {}", args[i])),
        }
        i += 1;
    }

    parsed
}

fn fail(message: &str) -> ! {
    eprintln!("{}", message);
    eprintln!("Use --help for usage information.");
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"Prompt Replay - capture prompts from a recorded chat page

USAGE:
    prompt-replay [OPTIONS] <FIXTURE>

OPTIONS:
    -h, --help               Show this help message
    -v, --version            Show version
    -c, --config <PATH>      Path to configuration file
    -f, --format <FORMAT>    Output format: json, text, markdown (default: json)
    -p, --platform <NAME>    Skip detection: chatgpt, gemini, claude, deepseek,
                             qwen-cn, qwen-intl, kimi, doubao
    --metadata               Include prompt ids and DOM positions
    --no-timestamps          Omit timestamps

ENVIRONMENT:
    RUST_LOG                 Overrides the configured log level

EXAMPLES:
    prompt-replay page.json
    prompt-replay --format markdown page.json > prompts.md
    RUST_LOG=prompt_capture=debug prompt-replay page.json
"#
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    let mut config = match &args.config_path {
        Some(path) => Config::try_load_from_path(path)?,
        None => Config::load(),
    };
    if args.platform.is_some() {
        config.general.platform = args.platform;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = args.fixture.as_ref() else {
        fail("Missing fixture path");
    };
    let fixture = PageFixture::from_path(path)?;
    info!("Replaying {:?} ({} steps)", path, fixture.steps.len());

    let prompts = replay::replay(config, &fixture, EventBus::new()).await?;
    info!("Captured {} prompts", prompts.len());

    let options = ExportOptions {
        format: args.format,
        include_timestamp: !args.no_timestamps,
        include_metadata: args.include_metadata,
    };
    println!("{}", export::render(&prompts, &options)?);
    Ok(())
}
