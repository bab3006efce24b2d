mod logging;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stepwise_core::{
    discover_scripts, script_id, CommandExecutor, CommandTarget, EngineConfig, ExecutionEngine,
    ReportLogger, RunSummary, ScriptExpander, Step, StepKind, StepRegistry,
};

#[derive(Debug, Parser)]
#[command(author, version, about = "Runs declarative GUI test scripts")]
struct StepwiseCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every test script under a directory and log the results
    Run {
        /// Engine configuration file (key=value)
        #[arg(long)]
        config: PathBuf,
        /// Directory searched recursively for test scripts
        #[arg(long)]
        test_dir: PathBuf,
        /// Directory receiving `log`, `failLog` and `summary.json`
        #[arg(long)]
        log_dir: PathBuf,
    },
    /// Expand a script and print the flattened step sequence without running it
    Plan {
        /// Path to the test script
        script: PathBuf,
        /// Engine configuration file (key=value)
        #[arg(long)]
        config: PathBuf,
        /// Output format
        #[arg(long, default_value_t = PlanFormat::Text)]
        format: PlanFormat,
    },
    /// List the step kinds a registry mapping can refer to
    Kinds {
        /// Also show the tags registered by this configuration
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlanFormat {
    Text,
    Json,
    Yaml,
}

impl std::fmt::Display for PlanFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            PlanFormat::Text => "text",
            PlanFormat::Json => "json",
            PlanFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Serialize)]
struct PlanResponse<'a> {
    script: String,
    steps: &'a [Step],
}

fn main() -> anyhow::Result<()> {
    logging::init_cli();
    let cli = StepwiseCli::parse();

    match cli.command {
        Command::Run {
            config,
            test_dir,
            log_dir,
        } => run(&config, &test_dir, &log_dir),
        Command::Plan {
            script,
            config,
            format,
        } => plan(&script, &config, format),
        Command::Kinds { config } => kinds(config.as_deref()),
    }
}

fn load_engine_config(path: &Path) -> anyhow::Result<(EngineConfig, Arc<StepRegistry>)> {
    let config = EngineConfig::load(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    let registry = StepRegistry::load(&config.registry_file).with_context(|| {
        format!(
            "failed to load step registry {}",
            config.registry_file.display()
        )
    })?;
    Ok((config, Arc::new(registry)))
}

fn run(config_path: &Path, test_dir: &Path, log_dir: &Path) -> anyhow::Result<()> {
    let (config, registry) = load_engine_config(config_path)?;
    let scripts = discover_scripts(test_dir, &config)
        .with_context(|| format!("failed to list scripts in {}", test_dir.display()))?;
    tracing::info!(count = scripts.len(), dir = %test_dir.display(), "discovered scripts");

    let logger = ReportLogger::spawn_with_hook(
        log_dir,
        // Runs on the logger thread. `exit` skips destructors, so a logging
        // failure leaves the engine's application child running.
        Box::new(|summary: &RunSummary| {
            println!("{}", summary.render_table());
            std::process::exit(summary.exit_status);
        }),
    )
    .with_context(|| format!("failed to open logs in {}", log_dir.display()))?;

    let mut engine = ExecutionEngine::new(
        ScriptExpander::new(registry),
        Box::new(CommandTarget::from_config(&config)),
        Box::new(CommandExecutor::from_config(&config)),
    )
    .with_delays(config.start_delay, config.shutdown_delay);

    for script in &scripts {
        logger.enqueue(engine.run(script));
    }

    let status = logger.wait();
    std::process::exit(status);
}

fn plan(script: &Path, config_path: &Path, format: PlanFormat) -> anyhow::Result<()> {
    let (_, registry) = load_engine_config(config_path)?;
    let expander = ScriptExpander::new(registry);
    let steps = expander.expand(script)?;

    let response = PlanResponse {
        script: script_id(script),
        steps: &steps,
    };
    match format {
        PlanFormat::Text => {
            println!("{} ({} steps)", response.script, steps.len());
            for step in &steps {
                let policy = &step.policy;
                println!(
                    "  - {step} retry={}x{}ms abort={}",
                    policy.retry_times, policy.retry_delay_ms, policy.abort_if_failed
                );
            }
        }
        PlanFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        PlanFormat::Yaml => {
            let yaml = serde_yaml::to_string(&response)?;
            print!("{yaml}");
        }
    }
    Ok(())
}

fn kinds(config_path: Option<&Path>) -> anyhow::Result<()> {
    let registry = match config_path {
        Some(path) => Some(load_engine_config(path)?.1),
        None => None,
    };

    for kind in StepKind::ALL {
        println!("{:<12} {}", kind.as_str(), kind.description());
        if let Some(registry) = &registry {
            let tags: Vec<&str> = registry
                .tags()
                .filter(|(_, registered)| *registered == kind)
                .map(|(tag, _)| tag)
                .collect();
            if !tags.is_empty() {
                println!("{:<12} tags: {}", "", tags.join(", "));
            }
        }
    }
    Ok(())
}
