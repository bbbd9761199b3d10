//! AIRefinery - on-device text refinement
//!
//! Rewrites text with a local GGUF model, streaming the result to stdout.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use airefinery::inference::{LlamaCppBackend, LlamaOptions};
use airefinery::prompt::{ChatTemplate, EnhancementMode};
use airefinery::service::{GenerationService, ServiceConfig};
use airefinery::storage::models::{find_default_model, scan_models_directory};
use airefinery::storage::settings::{get_settings_path, init_settings, load_settings, Settings};
use airefinery::storage::{init_storage, StorageError};
use airefinery::{EngineError, GenerationEvent, GenerationReport};

/// AIRefinery: rewrite text with a local language model
#[derive(Parser)]
#[command(name = "airefinery", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Rewrite TEXT and stream the result to stdout.
    Generate {
        /// Text to rewrite (or the full prompt with --raw).
        text: String,

        /// GGUF model to load; defaults to the configured or first discovered model.
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Rewrite style: formalize, persuade or simplify.
        #[arg(long, default_value = "formalize")]
        mode: EnhancementMode,

        /// Extra context about where the text will be used.
        #[arg(short, long)]
        context: Option<String>,

        /// Send TEXT to the model untouched, without instructions or chat template.
        #[arg(long)]
        raw: bool,

        /// Cap on prompt plus generated tokens.
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Sample stochastically instead of greedily.
        #[arg(long)]
        sample: bool,

        /// Sampling temperature.
        #[arg(short, long)]
        temperature: Option<f32>,

        /// Top-k sampling parameter.
        #[arg(long)]
        top_k: Option<i32>,

        /// Top-p sampling parameter.
        #[arg(long)]
        top_p: Option<f32>,

        /// Seed for reproducible sampling.
        #[arg(short, long)]
        seed: Option<u32>,

        /// Decode threads; derived from the hardware when omitted.
        #[arg(long)]
        threads: Option<u32>,
    },
    /// List GGUF models in the models directory.
    Models {
        /// Directory to scan instead of the configured one.
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Create the data directory and write default settings.
    Init {
        /// Overwrite an existing settings file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("No model found in {0}; pass --model")]
    NoModel(PathBuf),
    #[error("Output failed: {0}")]
    Output(#[from] std::io::Error),
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = load_settings();

    // Initialize tracing subscriber for logging; stdout carries generated text only
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)))
        .init();

    info!("Starting AIRefinery v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Models { dir } => list_models(&settings, dir),
        Command::Init { force } => init(force),
        command @ Command::Generate { .. } => generate(settings, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn list_models(settings: &Settings, dir: Option<PathBuf>) -> Result<(), CliError> {
    let directory = dir.unwrap_or_else(|| settings.models_directory.clone());
    let models = scan_models_directory(&directory)?;
    if models.is_empty() {
        eprintln!("No models in {}", directory.display());
    }
    for model in models {
        println!("{:<48} {:>10}", model.filename, model.size_string());
    }
    Ok(())
}

fn init(force: bool) -> Result<(), CliError> {
    let models_dir = init_storage()?;
    let settings_path = get_settings_path()?;
    if init_settings(&settings_path, force)? {
        println!("Wrote {}", settings_path.display());
    } else {
        println!("Kept {} (use --force to overwrite)", settings_path.display());
    }
    println!("Place .gguf models in {}", models_dir.display());
    Ok(())
}

async fn generate(settings: Settings, command: Command) -> Result<(), CliError> {
    let Command::Generate {
        text,
        model,
        mode,
        context,
        raw,
        max_tokens,
        sample,
        temperature,
        top_k,
        top_p,
        seed,
        threads,
    } = command
    else {
        return Ok(());
    };

    let model_path = match model {
        Some(path) => path,
        None => find_default_model(settings.model_path.as_deref(), &settings.models_directory)?
            .ok_or_else(|| CliError::NoModel(settings.models_directory.clone()))?,
    };

    let mut params = settings.generation.clone();
    if let Some(n) = max_tokens {
        params.max_tokens = n;
    }
    params.use_greedy = params.use_greedy && !sample;
    params.temperature = temperature.unwrap_or(params.temperature);
    params.top_k = top_k.unwrap_or(params.top_k);
    params.top_p = top_p.unwrap_or(params.top_p);
    params.seed = seed.or(params.seed);
    params.n_threads = threads.or(params.n_threads);
    params.validate();

    let prompt = if raw {
        text
    } else {
        let instruction = mode.to_prompt(&text, context.as_deref());
        ChatTemplate::exaone(settings.system_prompt.clone()).apply(&instruction)
    };

    let config = ServiceConfig {
        threads: settings.threads,
        hardware_threads: None,
    };
    let options = LlamaOptions {
        gpu_layers: settings.gpu_layers,
    };

    // Model loading blocks for seconds
    let mut service = tokio::task::spawn_blocking(move || {
        let mut service = GenerationService::<LlamaCppBackend>::new(config);
        service.initialize(&model_path, options).map(|info| {
            info!(
                "Loaded {} ({} params, {} ctx)",
                info.path.display(),
                info.metadata.param_count,
                info.metadata.context_length
            );
            service
        })
    })
    .await??;

    let handle = service.handle()?;
    let mut stream = handle.submit_stream(prompt, params)?;
    let mut stdout = std::io::stdout();
    let mut stop_sent = false;

    let outcome = loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(GenerationEvent::Token(piece)) => {
                    stdout.write_all(piece.as_bytes())?;
                    stdout.flush()?;
                }
                Some(GenerationEvent::Done(report)) => break Ok(report),
                Some(GenerationEvent::Failed(e)) => break Err(e),
                None => break Err(EngineError::Abandoned),
            },
            _ = tokio::signal::ctrl_c(), if !stop_sent => {
                info!("Interrupted, stopping generation");
                handle.request_stop();
                stop_sent = true;
            }
        }
    };
    println!();

    tokio::task::spawn_blocking(move || service.shutdown()).await?;

    let report = outcome?;
    print_summary(&report);
    Ok(())
}

fn print_summary(report: &GenerationReport) {
    let stats = &report.stats;
    eprintln!(
        "[{:?}] {} prompt + {} generated tokens | first token {:.2}s | prefill {:.1} tok/s | decode {:.1} tok/s",
        report.finish_reason,
        report.prompt_tokens,
        report.generated_tokens,
        stats.time_to_first_token.unwrap_or_default().as_secs_f64(),
        stats.prefill_tokens_per_second(report.prompt_tokens),
        stats.decode_tokens_per_second()
    );
}
