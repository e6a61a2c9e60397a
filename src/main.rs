//! # leadflow
//!
//! Command-line front end for the lead workflow engine.
//!
//! Leads are submitted as JSON, researched through an auction between
//! research agents, scored, given outreach copy and a send time, and then
//! either auto-approved or parked for a human reviewer. Every transition is
//! checkpointed under `LEADFLOW_DATA_DIR`, so any command can be run from a
//! fresh process.
//!
//! ## Quick Start
//! ```bash
//! leadflow submit lead.json
//! leadflow status lead-42
//! leadflow approve lead-42 --reviewer alice
//! ```

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Configuration management
mod config;

// =============================================================================
// IMPORTS
// =============================================================================
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use leadflow_engine::lead::{default_registry, lead_pipeline};
use leadflow_engine::{create_store, ApprovalDecision, InstanceId, InstanceStatus, WorkflowExecutor};

use crate::config::Config;

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
#[derive(Parser, Debug)]
#[command(
    name = "leadflow",
    version,
    about = "Checkpointed lead workflow: research auction, scoring, copy and approval",
    long_about = r#"
leadflow moves sales leads through research, qualification, copywriting,
send-time prediction and an approval gate. State is persisted as an
append-only checkpoint log, so instances survive restarts.

EXAMPLES:
  # Submit a lead (or a JSON array of leads) and run until review or done
  leadflow submit lead.json

  # Inspect an instance and its history
  leadflow status lead-42
  leadflow audit lead-42
  leadflow audit --since 2024-05-01T00:00:00Z --until 2024-05-02T00:00:00Z

  # Review
  leadflow approve lead-42 --reviewer alice
  leadflow sweep
"#
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Engine configuration file (JSON)
    #[arg(short = 'c', long = "config", global = true, env = "LEADFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true, default_value = "false")]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit leads from a JSON file and run them
    Submit {
        /// File holding one lead object or an array of them
        #[arg(value_name = "LEAD_JSON")]
        lead: PathBuf,
    },
    /// Show the current state of an instance
    Status { id: String },
    /// Show checkpoint history for an instance or a time window
    Audit {
        /// Instance to audit; omit to query by time
        #[arg(required_unless_present = "since")]
        id: Option<String>,
        /// Window start (RFC 3339)
        #[arg(long, requires = "until", conflicts_with = "id")]
        since: Option<DateTime<Utc>>,
        /// Window end, exclusive (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    /// Approve an instance waiting for review and continue it
    Approve {
        id: String,
        #[arg(long, env = "LEADFLOW_REVIEWER")]
        reviewer: String,
    },
    /// Reject an instance waiting for review
    Reject {
        id: String,
        #[arg(long, env = "LEADFLOW_REVIEWER")]
        reviewer: String,
    },
    /// Resolve overdue reviews and continue the approved ones
    Sweep,
    /// Replay every stored instance and run the unfinished ones
    Resume,
    /// Cancel an instance
    Cancel {
        id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Print the pipeline as a Mermaid diagram
    Graph,
    /// Print the effective configuration
    Config,
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = Config::load(args.config.as_deref())?;
    config.validate()?;
    info!(data_dir = %config.data_dir.display(), "Configuration loaded");

    match args.command {
        Command::Graph => {
            println!("{}", lead_pipeline()?.to_mermaid());
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        command => {
            let executor = Arc::new(build_executor(&config)?);
            execute(&executor, command).await
        }
    }
}

fn build_executor(config: &Config) -> Result<WorkflowExecutor> {
    let store = create_store(&config.store());
    WorkflowExecutor::new(
        lead_pipeline()?,
        default_registry(&config.engine),
        store,
        config.engine.clone(),
    )
    .context("failed to create workflow executor")
}

async fn execute(executor: &Arc<WorkflowExecutor>, command: Command) -> Result<()> {
    match command {
        Command::Submit { lead } => {
            let raw = tokio::fs::read_to_string(&lead)
                .await
                .with_context(|| format!("failed to read {}", lead.display()))?;
            let leads = match serde_json::from_str::<Value>(&raw)
                .with_context(|| format!("{} is not valid JSON", lead.display()))?
            {
                Value::Array(items) => items,
                single => vec![single],
            };

            let mut ids = Vec::with_capacity(leads.len());
            for payload in leads {
                ids.push(executor.submit(payload).await?);
            }
            report(executor.run_many(ids).await);
        }
        Command::Status { id } => {
            let instance = executor.load(&InstanceId::new(id)).await?;
            println!("{}", serde_json::to_string_pretty(&instance)?);
        }
        Command::Audit { id, since, until } => {
            let chain = match (id, since, until) {
                (Some(id), _, _) => executor.audit(&InstanceId::new(id)).await?,
                (None, Some(since), Some(until)) => executor.audit_range(since, until).await?,
                _ => anyhow::bail!("audit needs an instance id or --since and --until"),
            };
            println!("{}", serde_json::to_string_pretty(&chain)?);
        }
        Command::Approve { id, reviewer } => {
            let id = InstanceId::new(id);
            let status = executor.decide(&id, ApprovalDecision::Approve, &reviewer).await?;
            let status = if status == InstanceStatus::Approved {
                executor.run(&id).await?
            } else {
                status
            };
            println!("{id}\t{status}");
        }
        Command::Reject { id, reviewer } => {
            let id = InstanceId::new(id);
            let status = executor.decide(&id, ApprovalDecision::Reject, &reviewer).await?;
            println!("{id}\t{status}");
        }
        Command::Sweep => {
            let resolved = executor.sweep_timeouts().await?;
            let approved: Vec<InstanceId> = resolved
                .iter()
                .filter(|(_, status)| *status == InstanceStatus::Approved)
                .map(|(id, _)| id.clone())
                .collect();
            for (id, status) in &resolved {
                println!("{id}\t{status}\tapproval timed out");
            }
            report(executor.run_many(approved).await);
        }
        Command::Resume => report(executor.resume_all().await?),
        Command::Cancel { id, reason } => {
            let id = InstanceId::new(id);
            let status = executor.cancel(&id, &reason).await?;
            println!("{id}\t{status}");
        }
        Command::Graph | Command::Config => {}
    }
    Ok(())
}

/// Print one line per instance; failures are logged, not fatal
fn report(results: Vec<(InstanceId, Result<InstanceStatus, leadflow_engine::EngineError>)>) {
    for (id, result) in results {
        match result {
            Ok(status) => println!("{id}\t{status}"),
            Err(e) => {
                warn!(instance = %id, error = %e, "instance run failed");
                println!("{id}\terror\t{e}");
            }
        }
    }
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug for the
/// engine and info elsewhere.
fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        "info,leadflow=debug,leadflow_engine=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_submit() {
        let args = Args::parse_from(["leadflow", "--verbose", "submit", "lead.json"]);
        assert!(args.verbose);
        match args.command {
            Command::Submit { lead } => assert_eq!(lead, PathBuf::from("lead.json")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_args_audit_window() {
        let args = Args::parse_from([
            "leadflow",
            "audit",
            "--since",
            "2024-05-01T00:00:00Z",
            "--until",
            "2024-05-02T00:00:00Z",
        ]);
        match args.command {
            Command::Audit { id, since, until } => {
                assert!(id.is_none());
                assert!(since.unwrap() < until.unwrap());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_args_audit_requires_target() {
        assert!(Args::try_parse_from(["leadflow", "audit"]).is_err());
        assert!(Args::try_parse_from(["leadflow", "audit", "--since", "2024-05-01T00:00:00Z"]).is_err());
    }

    #[test]
    fn test_args_approve() {
        let args = Args::parse_from(["leadflow", "approve", "lead-42", "--reviewer", "alice"]);
        match args.command {
            Command::Approve { id, reviewer } => {
                assert_eq!(id, "lead-42");
                assert_eq!(reviewer, "alice");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_and_resume_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let executor = Arc::new(build_executor(&config).unwrap());

        let lead = dir.path().join("lead.json");
        std::fs::write(
            &lead,
            r#"[{"id": "lead-1", "title": "CEO", "email": "ceo@acme.io", "company": "Acme"},
                {"id": "lead-2", "company": "Nobody", "email": "x@gmail.com"}]"#,
        )
        .unwrap();
        execute(&executor, Command::Submit { lead }).await.unwrap();

        let first = executor.load(&InstanceId::new("lead-1")).await.unwrap();
        let second = executor.load(&InstanceId::new("lead-2")).await.unwrap();
        // Thin research gets fallback copy and waits for a reviewer
        assert_eq!(first.status, InstanceStatus::WaitingApproval);
        assert_eq!(first.output("copy").unwrap()["fallback"], serde_json::json!(true));
        assert_eq!(second.status, InstanceStatus::Rejected);

        // A fresh executor over the same directory sees the same state
        let reopened = Arc::new(build_executor(&config).unwrap());
        assert_eq!(reopened.load(&InstanceId::new("lead-2")).await.unwrap(), second);
        let resumed = reopened.resume_all().await.unwrap();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].0, first.id);
        assert_eq!(*resumed[0].1.as_ref().unwrap(), InstanceStatus::WaitingApproval);
    }
}
