//! Command-line surface. Every command prints a JSON document on stdout.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::db::models::CreateSolutionInput;
use crate::db::repos::runs;
use crate::engine::runner::RunOptions;
use crate::engine::scenario::{Scenario, ScenarioCatalog};
use crate::engine::types::{RunStatus, TriggerSource};
use crate::error::AppError;
use crate::AppState;

/// How long a finished `run` waits for deferred similarity searches.
const QUEUE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Self-healing HTTP scenario runner
#[derive(Parser, Debug)]
#[command(
    name = "selfheal-qa",
    version,
    about = "Run declarative HTTP test scenarios with self-healing retries and an error knowledge base",
    after_help = "ENVIRONMENT VARIABLES:\n\
        SELFHEAL_DATABASE_PATH     SQLite database file\n\
        SELFHEAL_PROJECT           Project scope for error patterns\n\
        SELFHEAL_ENVIRONMENT       Default target environment\n\
        SELFHEAL_AUTO_FIX          Enable self-healing retries (true/false)\n\
        SELFHEAL_FIX_THRESHOLD     Minimum fix confidence in [0, 1]\n\
        RUST_LOG                   Log filter (default: info,selfheal_qa=debug)"
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file (overrides config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Project scope for the error knowledge base (overrides config)
    #[arg(long, global = true)]
    pub project: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a scenario file (YAML or JSON)
    Run {
        file: PathBuf,

        /// Directory of scenarios that nested steps may reference
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Target environment label
        #[arg(long = "env")]
        environment: Option<String>,

        /// What started this run: manual, schedule or webhook
        #[arg(long, default_value = "manual")]
        trigger: TriggerSource,

        /// Disable self-healing retries for this run
        #[arg(long)]
        no_auto_fix: bool,
    },

    /// List recent runs
    Runs {
        /// Only runs of this scenario slug
        #[arg(long)]
        scenario: Option<String>,

        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// List error patterns, most frequent first
    Patterns {
        #[arg(long, default_value = "50")]
        limit: i64,
    },

    /// Show one error pattern with its solutions and recent occurrences
    Pattern { id: String },

    /// Attach a documented solution to an error pattern
    AddSolution {
        #[arg(long)]
        pattern: String,

        #[arg(long)]
        title: String,

        #[arg(long)]
        description: String,

        /// Remediation step (repeatable, kept in order)
        #[arg(long = "step")]
        steps: Vec<String>,

        /// File touched by the fix (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
    },

    /// Record that a solution was applied
    SolutionApplied {
        id: String,

        /// The solution did not resolve the error
        #[arg(long)]
        failed: bool,
    },

    /// Mark an error occurrence as resolved
    Resolve { occurrence: String },
}

/// Result of one command: the JSON document to print and whether the
/// process should exit successfully.
#[derive(Debug)]
pub struct CommandOutput {
    pub output: Value,
    pub success: bool,
}

impl CommandOutput {
    fn ok(output: Value) -> Self {
        Self { output, success: true }
    }
}

impl Cli {
    /// Config file and environment first, then global flags on top.
    pub fn load_config(&self) -> Result<AppConfig, AppError> {
        let mut config = AppConfig::load(self.config.as_deref())?;
        if let Some(db) = &self.db {
            config.database_path = db.clone();
        }
        if let Some(project) = &self.project {
            config.project_name = project.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

pub async fn execute(cli: Cli, config: AppConfig) -> Result<CommandOutput, AppError> {
    match cli.command {
        Command::Run {
            file,
            catalog,
            environment,
            trigger,
            no_auto_fix,
        } => {
            let scenario = Scenario::load_file(&file)?;
            let catalog = match catalog {
                Some(dir) => ScenarioCatalog::load_dir(&dir)?,
                None => ScenarioCatalog::new(),
            };
            let state = AppState::init(config, catalog)?;

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupt received, stopping after the current step");
                        cancel.cancel();
                    }
                }
            });

            let options = RunOptions {
                environment,
                trigger,
                auto_fix: no_auto_fix.then_some(false),
                cancel: Some(cancel),
            };
            let report = state.runner.run(&scenario, options).await?;

            if tokio::time::timeout(QUEUE_DRAIN_GRACE, state.dedup.queue().wait_idle())
                .await
                .is_err()
            {
                tracing::warn!(status = ?state.dedup.queue().get_status(), "Background queue still busy at exit");
            }

            let success = report.run.status == RunStatus::Passed;
            Ok(CommandOutput {
                output: json!({
                    "run": report.run,
                    "results": report.results,
                    "notify": report.due_notifications(&scenario),
                    "queue": state.dedup.queue().get_status(),
                }),
                success,
            })
        }

        Command::Runs { scenario, limit } => {
            let state = AppState::init(config, ScenarioCatalog::new())?;
            let runs = runs::list_runs(&state.db, scenario.as_deref(), limit)?;
            Ok(CommandOutput::ok(serde_json::to_value(runs)?))
        }

        Command::Patterns { limit } => {
            let state = AppState::init(config, ScenarioCatalog::new())?;
            let patterns = state
                .dedup
                .list_patterns(Some(&state.config.project_name), limit)?;
            Ok(CommandOutput::ok(serde_json::to_value(patterns)?))
        }

        Command::Pattern { id } => {
            let state = AppState::init(config, ScenarioCatalog::new())?;
            Ok(CommandOutput::ok(serde_json::to_value(state.dedup.pattern_details(&id)?)?))
        }

        Command::AddSolution {
            pattern,
            title,
            description,
            steps,
            files,
        } => {
            let state = AppState::init(config, ScenarioCatalog::new())?;
            let solution = state.dedup.create_solution(&CreateSolutionInput {
                pattern_id: pattern,
                title,
                description,
                steps,
                modified_files: files,
            })?;
            Ok(CommandOutput::ok(serde_json::to_value(solution)?))
        }

        Command::SolutionApplied { id, failed } => {
            let state = AppState::init(config, ScenarioCatalog::new())?;
            let solution = state.dedup.record_solution_applied(&id, !failed)?;
            Ok(CommandOutput::ok(serde_json::to_value(solution)?))
        }

        Command::Resolve { occurrence } => {
            let state = AppState::init(config, ScenarioCatalog::new())?;
            let occurrence = state.dedup.resolve_occurrence(&occurrence)?;
            Ok(CommandOutput::ok(serde_json::to_value(occurrence)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "selfheal-qa",
            "run",
            "flows/login.yaml",
            "--env",
            "prod",
            "--trigger",
            "webhook",
            "--no-auto-fix",
            "--project",
            "reno",
        ])
        .unwrap();

        assert_eq!(cli.project.as_deref(), Some("reno"));
        match cli.command {
            Command::Run {
                file,
                environment,
                trigger,
                no_auto_fix,
                catalog,
            } => {
                assert_eq!(file, PathBuf::from("flows/login.yaml"));
                assert_eq!(environment.as_deref(), Some("prod"));
                assert_eq!(trigger, TriggerSource::Webhook);
                assert!(no_auto_fix);
                assert!(catalog.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_trigger() {
        assert!(Cli::try_parse_from(["selfheal-qa", "run", "x.yaml", "--trigger", "cron"]).is_err());
    }

    #[test]
    fn test_repeatable_solution_steps() {
        let cli = Cli::try_parse_from([
            "selfheal-qa",
            "add-solution",
            "--pattern",
            "p1",
            "--title",
            "Rotate key",
            "--description",
            "Issue a new key",
            "--step",
            "generate",
            "--step",
            "deploy",
        ])
        .unwrap();
        let Command::AddSolution { steps, files, .. } = cli.command else {
            panic!("expected add-solution");
        };
        assert_eq!(steps, vec!["generate", "deploy"]);
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_patterns_command_against_fresh_db() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            database_path: dir.path().join("qa.db"),
            ..Default::default()
        };
        let cli = Cli::try_parse_from(["selfheal-qa", "patterns"]).unwrap();
        let out = execute(cli, config).await.unwrap();
        assert!(out.success);
        assert_eq!(out.output, json!([]));
    }
}
