//! Batch runner for the dimensional ETL engine
//!
//! Loads a YAML run manifest, executes the orchestrated run, prints the
//! aggregated validation report, and exits 0 unless the run failed.
//!
//! # Usage
//!
//! ```bash
//! # Check a manifest without touching any store
//! etl_run check --manifest run.yaml
//!
//! # Execute against the warehouse (requires the database feature)
//! etl_run run --manifest run.yaml
//!
//! # Write the report JSON next to the console summary
//! etl_run run --manifest run.yaml --report report.json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use taxdw_etl::config::RunManifest;
use taxdw_etl::model::ValidationStatus;
use taxdw_etl::RunReport;

#[derive(Parser)]
#[command(name = "etl_run")]
#[command(version = "0.1.0")]
#[command(about = "Dimensional ETL batch runner for the tax data warehouse")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Suppress the per-check listing, print the summary only
    #[arg(long, short, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a run manifest without executing anything
    Check {
        #[arg(short, long)]
        manifest: PathBuf,
    },

    /// Execute a full run against the configured warehouse
    Run {
        #[arg(short, long)]
        manifest: PathBuf,

        /// Also write the report surface as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn print_report(report: &RunReport, quiet: bool) {
    let status = match report.status {
        ValidationStatus::Pass => "PASS".green().bold(),
        ValidationStatus::Warn => "PASS (warnings)".yellow().bold(),
        ValidationStatus::Fail => "FAIL".red().bold(),
    };
    println!(
        "run {} as of {}: {}",
        report.run_id, report.as_of, status
    );
    println!(
        "checks: {} total, {} passed, {} failed, {} warnings (pass rate {:.1}%)",
        report.validation.summary.total_checks,
        report.validation.summary.passed,
        report.validation.summary.failed,
        report.validation.summary.warnings,
        report.validation.summary.pass_rate * 100.0,
    );

    if !quiet {
        for finding in report.validation.findings() {
            let marker = match finding.status {
                ValidationStatus::Fail => "FAIL".red(),
                ValidationStatus::Warn => "WARN".yellow(),
                ValidationStatus::Pass => continue,
            };
            println!("  [{}] {} {}", marker, finding.check_name, finding.details);
        }
        for execution in &report.executions {
            println!(
                "  mapping {}: {:?} extracted={} rejected={} loaded={}",
                execution.mapping_id,
                execution.status,
                execution.rows_extracted,
                execution.rows_rejected,
                execution.rows_loaded,
            );
        }
    }
}

#[cfg(feature = "database")]
async fn execute_run(manifest: &RunManifest) -> anyhow::Result<RunReport> {
    use std::sync::Arc;
    use taxdw_etl::audit::PostgresAuditLog;
    use taxdw_etl::extract::SqlExtractor;
    use taxdw_etl::metadata::DatabaseConfig;
    use taxdw_etl::sequence::PostgresKeySequence;
    use taxdw_etl::sink::PostgresSink;
    use taxdw_etl::EtlEngine;

    let pool = DatabaseConfig::default().connect().await?;
    let engine = EtlEngine::new(
        Arc::new(SqlExtractor::new(pool.clone())),
        Arc::new(PostgresSink::new(pool.clone())),
        Arc::new(PostgresKeySequence::new(pool.clone())),
        Arc::new(PostgresAuditLog::new(pool)),
    );
    Ok(engine.run(manifest).await?)
}

#[cfg(not(feature = "database"))]
async fn execute_run(_manifest: &RunManifest) -> anyhow::Result<RunReport> {
    anyhow::bail!("built without the `database` feature; only `check` is available")
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { manifest } => {
            let parsed = RunManifest::from_path(&manifest)?;
            println!(
                "{}: {} mappings, {} rules",
                "manifest ok".green(),
                parsed.mappings.len(),
                parsed.rules.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { manifest, report } => {
            let parsed = RunManifest::from_path(&manifest)?;
            let run_report = execute_run(&parsed).await?;

            print_report(&run_report, cli.quiet);
            if let Some(path) = report {
                std::fs::write(
                    &path,
                    serde_json::to_string_pretty(&run_report.report_json())?,
                )?;
                println!("report written to {}", path.display());
            }

            Ok(ExitCode::from(run_report.exit_code() as u8))
        }
    }
}
