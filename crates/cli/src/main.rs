//! `dagrun` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — translate and validate a workflow descriptor.
//! - `run`      — execute a workflow with the local backend.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

use engine::{ContextStatus, Engine, EngineConfig};
use executor::{builtin_registry, ExecutorConfig, LocalExecutor};

#[derive(Parser)]
#[command(name = "dagrun", about = "DAG workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a workflow descriptor and report structural problems.
    Validate {
        /// Path to the workflow descriptor.
        path: std::path::PathBuf,
        /// Descriptor dialect.
        #[arg(long, default_value = "generic")]
        dialect: String,
    },
    /// Execute a workflow descriptor with the local backend.
    Run {
        /// Path to the workflow descriptor.
        path: std::path::PathBuf,
        /// Descriptor dialect.
        #[arg(long, default_value = "generic")]
        dialect: String,
        /// Root input values as a JSON object.
        #[arg(long, default_value = "{}")]
        inputs: String,
    },
}

fn parse_inputs(raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            eprintln!("❌ --inputs must be a JSON object");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("❌ invalid --inputs JSON: {e}");
            std::process::exit(2);
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path, dialect } => {
            let descriptor = std::fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));

            let registry = dag::TranslatorRegistry::with_defaults();
            match registry.translate(&dialect, &descriptor, &Map::new()) {
                Ok(root) => {
                    let mut nodes = 0usize;
                    let mut links = 0usize;
                    root.walk(&mut |n| {
                        nodes += 1;
                        links += n.links().len();
                    });
                    println!("✅ Workflow is valid: {nodes} node(s), {links} link(s)");
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        Command::Run {
            path,
            dialect,
            inputs,
        } => {
            let descriptor = std::fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));
            let inputs = parse_inputs(&inputs);

            let engine = Arc::new(Engine::new(EngineConfig::default()));
            let rx = engine.attach_dispatcher();
            let local = LocalExecutor::new(
                engine.clone(),
                builtin_registry(),
                ExecutorConfig::default(),
            );
            tokio::spawn(local.run(rx));

            let context_id =
                match engine.create_context_from_descriptor(&dialect, &descriptor, inputs) {
                    Ok(id) => id,
                    Err(e) => {
                        eprintln!("❌ Could not start workflow: {e}");
                        std::process::exit(1);
                    }
                };
            info!(%context_id, "workflow started");

            let mut watch = engine.watch(context_id).expect("context was just created");
            let status = *watch
                .wait_for(|s| s.is_terminal())
                .await
                .expect("engine dropped");

            match status {
                ContextStatus::Completed => {
                    let outputs = engine.outputs(context_id).expect("context completed");
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&Value::Object(outputs))
                            .expect("outputs are valid JSON")
                    );
                }
                _ => {
                    eprintln!("❌ Workflow failed");
                    std::process::exit(1);
                }
            }
        }
    }
}
