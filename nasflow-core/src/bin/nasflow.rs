//! nasflow CLI — run and inspect architecture searches
//!
//! Commands:
//!   nasflow run         — run a search from a configuration file
//!   nasflow validate    — check a configuration without building anything
//!   nasflow checkpoints — list and verify the checkpoints of a run
//!   nasflow types       — list registered component types
//!
//! Exit codes: 0 completed, 2 configuration error, 3 runtime abort,
//! 4 paused with a checkpoint.

use log::warn;
use nasflow_core::checkpoint::CheckpointManager;
use nasflow_core::registry::{self, types_for};
use nasflow_core::{NasError, Role, SearchConfig, SearchTrainer, TrainerStatus};
use std::env;
use std::path::PathBuf;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_RUNTIME: i32 = 3;
const EXIT_PAUSED: i32 = 4;

fn print_usage() {
    println!(
        r#"
nasflow — weight-sharing architecture search

Usage: nasflow <command> [options]

Commands:
  run <config> [options]         Run a search (JSON or YAML config)
      --epochs <n>               Override trainer_cfg.epochs
      --checkpoint-dir <dir>     Save checkpoints under <dir>
      --output-dir <dir>         Where the final model is written (default: .)
      --resume                   Continue from the newest checkpoint
  validate <config>              Check a configuration and print the resolved stack
  checkpoints <dir>              List checkpoints and verify their checksums
  types                          List registered component types

Examples:
  nasflow run search.yaml --checkpoint-dir runs/a
  nasflow run search.yaml --checkpoint-dir runs/a --resume
  nasflow validate search.yaml

Ctrl-C pauses at the next epoch boundary and checkpoints; a second Ctrl-C aborts.
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(EXIT_CONFIG);
    }

    let code = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "validate" => cmd_validate(&args[2..]),
        "checkpoints" => cmd_checkpoints(&args[2..]),
        "types" => cmd_types(),
        "help" | "--help" | "-h" => {
            print_usage();
            EXIT_OK
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

/// Print an error and map it onto an exit code
fn report(e: NasError) -> i32 {
    eprintln!("  Error: {}", e);
    if e.is_config() {
        EXIT_CONFIG
    } else {
        EXIT_RUNTIME
    }
}

struct RunArgs {
    config: PathBuf,
    epochs: Option<u64>,
    checkpoint_dir: Option<PathBuf>,
    output_dir: PathBuf,
    resume: bool,
}

fn parse_run_args(args: &[String]) -> Result<RunArgs, String> {
    let mut config = None;
    let mut epochs = None;
    let mut checkpoint_dir = None;
    let mut output_dir = PathBuf::from(".");
    let mut resume = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--epochs" => {
                let value = iter.next().ok_or("--epochs needs a value")?;
                epochs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("--epochs must be a number, got '{}'", value))?,
                );
            }
            "--checkpoint-dir" => {
                checkpoint_dir = Some(PathBuf::from(iter.next().ok_or("--checkpoint-dir needs a value")?));
            }
            "--output-dir" => {
                output_dir = PathBuf::from(iter.next().ok_or("--output-dir needs a value")?);
            }
            "--resume" => resume = true,
            flag if flag.starts_with("--") => return Err(format!("unknown option {}", flag)),
            path if config.is_none() => config = Some(PathBuf::from(path)),
            extra => return Err(format!("unexpected argument '{}'", extra)),
        }
    }
    if resume && checkpoint_dir.is_none() {
        return Err("--resume needs --checkpoint-dir".into());
    }
    Ok(RunArgs {
        config: config.ok_or("missing <config>")?,
        epochs,
        checkpoint_dir,
        output_dir,
        resume,
    })
}

async fn cmd_run(args: &[String]) -> i32 {
    let run = match parse_run_args(args) {
        Ok(run) => run,
        Err(msg) => {
            eprintln!("  {}", msg);
            eprintln!("Usage: nasflow run <config> [--epochs N] [--checkpoint-dir DIR] [--output-dir DIR] [--resume]");
            return EXIT_CONFIG;
        }
    };

    let mut config = match SearchConfig::load(&run.config) {
        Ok(config) => config,
        Err(e) => return report(e),
    };
    if let Some(epochs) = run.epochs {
        if let Err(e) = config.set_epochs(epochs) {
            return report(e);
        }
    }
    let components = match registry::build_all(&config) {
        Ok(components) => components,
        Err(e) => return report(e),
    };
    let mut trainer = match SearchTrainer::new(components, run.checkpoint_dir, run.output_dir) {
        Ok(trainer) => trainer,
        Err(e) => return report(e),
    };
    if run.resume {
        if let Err(e) = trainer.resume() {
            return report(e);
        }
    }

    let control = trainer.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, pausing at the next epoch boundary");
            control.pause();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt, aborting");
            control.abort();
        }
    });

    match trainer.run().await {
        Ok(TrainerStatus::Completed) => {
            println!("\n  Search completed at step {}", trainer.step());
            if let Some(best) = trainer.best() {
                println!("  Best: {}", best.summary());
            }
            EXIT_OK
        }
        Ok(TrainerStatus::Paused) => {
            println!(
                "\n  Paused before epoch {}. Continue with --resume.",
                trainer.state().epoch
            );
            EXIT_PAUSED
        }
        Ok(status) => {
            eprintln!("  Search ended {}", status);
            EXIT_RUNTIME
        }
        Err(e) => report(e),
    }
}

fn cmd_validate(args: &[String]) -> i32 {
    let Some(path) = args.first() else {
        eprintln!("Usage: nasflow validate <config>");
        return EXIT_CONFIG;
    };
    let validated = match SearchConfig::load(path).and_then(|c| registry::validate(&c)) {
        Ok(validated) => validated,
        Err(e) => return report(e),
    };
    println!("\n  Configuration OK, rollout_type {}", validated.rollout_type);
    for component in &validated.components {
        let scheduled: Vec<&str> = component.schedule.names().collect();
        if scheduled.is_empty() {
            println!("  {:<16} {}", component.role.as_str(), component.type_name);
        } else {
            println!(
                "  {:<16} {} (scheduled: {})",
                component.role.as_str(),
                component.type_name,
                scheduled.join(", ")
            );
        }
    }
    EXIT_OK
}

fn cmd_checkpoints(args: &[String]) -> i32 {
    let Some(dir) = args.first() else {
        eprintln!("Usage: nasflow checkpoints <dir>");
        return EXIT_CONFIG;
    };
    let manager = match CheckpointManager::open(dir) {
        Ok(manager) => manager,
        Err(e) => return report(e),
    };
    if manager.is_empty() {
        println!("\n  No checkpoints in {}", dir);
        return EXIT_OK;
    }
    let status = manager.verify_all();
    println!("\n  Checkpoints ({}):", manager.len());
    println!("  {}", "-".repeat(72));
    for (meta, (_, ok)) in manager.list().iter().zip(status.iter()) {
        println!(
            "  v{:<4} epoch {:<5} step {:<7} {} {:>9} bytes  [{}]",
            meta.version,
            meta.epoch,
            meta.global_step,
            meta.timestamp.format("%Y-%m-%d %H:%M:%S"),
            meta.size_bytes,
            if *ok { "ok" } else { "CORRUPT" }
        );
    }
    if status.iter().all(|(_, ok)| *ok) {
        EXIT_OK
    } else {
        EXIT_RUNTIME
    }
}

fn cmd_types() -> i32 {
    println!("\n  Registered component types:");
    for role in Role::ALL {
        println!("  {:<16} {}", role.as_str(), types_for(role).join(", "));
    }
    EXIT_OK
}
