//! synth-dialogue CLI: run one pipeline stage over a collection.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use synth_dialogue::config::PipelineConfig;
use synth_dialogue::engine::Engine;
use synth_dialogue::llm::Gateway;
use synth_dialogue::pipeline::StageKind;

#[derive(Parser)]
#[command(
    name = "synth-dialogue",
    version,
    about = "Resumable synthetic counseling dialogue pipeline"
)]
struct Cli {
    /// Pipeline configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hide the progress bar.
    #[arg(long, short, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every pending record of a stage.
    Run {
        /// Stage to run.
        #[arg(value_enum)]
        stage: StageKind,

        /// Input collection (overrides the config file).
        #[arg(long)]
        input: Option<PathBuf>,

        /// Output collection (overrides the config file).
        #[arg(long)]
        output: Option<PathBuf>,

        /// Records processed concurrently.
        #[arg(long)]
        workers: Option<usize>,

        /// Completed records between checkpoint flushes.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Attempts per inference call.
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Write a configuration file holding every default.
    Init {
        /// Where to write it.
        #[arg(default_value = "synth-dialogue.toml")]
        path: PathBuf,

        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Show input, done and pending counts without calling the service.
    Status {
        #[arg(value_enum)]
        stage: StageKind,

        #[arg(long)]
        input: Option<PathBuf>,

        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Init { path, force } = &cli.command {
        if path.exists() && !force {
            miette::bail!("{} already exists, pass --force to replace it", path.display());
        }
        PipelineConfig::default().save(path)?;
        println!("wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    config.merge_env();

    match cli.command {
        Commands::Run {
            stage,
            input,
            output,
            workers,
            batch_size,
            max_attempts,
        } => {
            apply_paths(&mut config, stage, input, output);
            if let Some(n) = workers {
                config.engine.workers = n;
            }
            if let Some(n) = batch_size {
                config.engine.batch_size = n;
            }
            if let Some(n) = max_attempts {
                config.engine.max_attempts = n;
            }
            config.validate()?;

            // First signal stops dispatch and flushes; a second one exits immediately.
            let shutdown = Arc::new(AtomicBool::new(false));
            for sig in signal_hook::consts::TERM_SIGNALS {
                signal_hook::flag::register_conditional_shutdown(*sig, 1, Arc::clone(&shutdown))
                    .into_diagnostic()?;
                signal_hook::flag::register(*sig, Arc::clone(&shutdown)).into_diagnostic()?;
            }

            let gateway = Gateway::openai(
                &config.gateway.base_url,
                &config.gateway.api_keys,
                config.gateway.timeout(),
            );
            tracing::info!(backends = gateway.backend_count(), "gateway ready");

            let engine = Engine::new(config.engine.to_engine_config(!cli.quiet), Arc::new(gateway))
                .with_shutdown(shutdown);
            let job = config.job(stage);
            let summary = engine.run(&job)?;

            if summary.interrupted {
                println!("{stage}: interrupted, progress saved to {}", job.output.display());
            }
            println!("{summary}");
        }

        Commands::Status {
            stage,
            input,
            output,
        } => {
            apply_paths(&mut config, stage, input, output);
            config.validate()?;
            let gateway = Gateway::new(Vec::new());
            let engine = Engine::new(config.engine.to_engine_config(false), Arc::new(gateway));
            let status = engine.status(&config.job(stage))?;
            println!("{status}");
        }

        Commands::Init { .. } => {}
    }

    Ok(())
}

fn apply_paths(config: &mut PipelineConfig, stage: StageKind, input: Option<PathBuf>, output: Option<PathBuf>) {
    let settings = config.stages.get_mut(stage);
    if input.is_some() {
        settings.input = input;
    }
    if output.is_some() {
        settings.output = output;
    }
}
