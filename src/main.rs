use anyhow::Result;
use clap::{Parser, Subcommand};
use dbpulse::config::PerformanceConfig;
use dbpulse::orchestrator::PerformanceOrchestrator;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dbpulse")]
#[command(about = "Adaptive database performance layer for PostgreSQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a query's execution plan and print recommendations
    Analyze {
        /// Read-only SQL statement to analyze
        query: String,
        /// Also print heuristic index suggestions
        #[arg(long)]
        suggest_indexes: bool,
        /// Also print an advisory textual rewrite when one applies
        #[arg(long)]
        rewrite: bool,
    },
    /// Index usage reporting and cleanup
    Indexes {
        #[command(subcommand)]
        command: IndexCommands,
    },
    /// Partition lifecycle management
    Partitions {
        #[command(subcommand)]
        command: PartitionCommands,
    },
    /// Print the performance dashboard
    Dashboard {
        /// Output format: text, table, or json
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Run bootstrap and keep monitoring until interrupted
    Monitor {
        /// Sampling interval override in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Run one bootstrap pass and report per-phase results
    Optimize,
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Report unused, redundant, and missing indexes
    Report,
    /// Drop unused indexes, one at a time
    DropUnused {
        /// Report what would be dropped without dropping
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum PartitionCommands {
    /// Create the partitioned parent and monthly partitions for a table
    Bootstrap {
        table: String,
        date_column: String,
    },
    /// Create partitions for the current and upcoming months
    Ensure {
        table: String,
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
    /// Drop partitions whose entire range is past retention
    DropOld {
        table: String,
        #[arg(long)]
        retention_months: Option<u32>,
    },
    /// Copy rows into the partitioned parent in restartable batches
    Migrate {
        table: String,
        date_column: String,
        #[arg(long)]
        batch_size: Option<u64>,
    },
    /// List partitions of a parent table
    List {
        table: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbpulse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = PerformanceConfig::load()?;
    if let Commands::Monitor {
        interval_ms: Some(interval),
    } = &cli.command
    {
        config.monitor.interval_ms = *interval;
    }
    let orchestrator = Arc::new(PerformanceOrchestrator::new(config.clone())?);

    match cli.command {
        Commands::Analyze {
            query,
            suggest_indexes,
            rewrite,
        } => {
            orchestrator.pool().initialize(config.pool.clone()).await?;
            let analysis = orchestrator.analyzer().analyze(&query).await?;
            println!(
                "Plan root: {} (cost {:.1}, {:.1}ms execution, {:.1}ms planning)",
                analysis.root.node_type,
                analysis.root.total_cost,
                analysis.execution_time_ms,
                analysis.planning_time_ms
            );
            if analysis.recommendations.is_empty() {
                println!("No recommendations.");
            }
            for rec in &analysis.recommendations {
                println!(
                    "[{:?}/{:?}] {} - {}",
                    rec.category, rec.severity, rec.description, rec.estimated_improvement
                );
                for step in &rec.implementation_steps {
                    println!("    - {step}");
                }
            }

            if suggest_indexes {
                let suggestions = orchestrator.analyzer().suggest_indexes(&query).await?;
                println!("\nIndex suggestions: {}", suggestions.len());
                for suggestion in suggestions {
                    println!(
                        "  {:?} index on {}({}){} - ~{} bytes",
                        suggestion.kind,
                        suggestion.table,
                        suggestion.columns.join(", "),
                        suggestion
                            .condition
                            .map(|c| format!(" WHERE {c}"))
                            .unwrap_or_default(),
                        suggestion.estimated_size_bytes
                    );
                }
            }

            if rewrite {
                match orchestrator.analyzer().rewrite_query(&query) {
                    Some(suggestion) => {
                        println!("\nRewritten query:\n{}", suggestion.rewritten);
                        for note in suggestion.notes {
                            println!("  note: {note}");
                        }
                    }
                    None => println!("\nNo rewrite applies."),
                }
            }
        }

        Commands::Indexes { command } => {
            orchestrator.pool().initialize(config.pool.clone()).await?;
            match command {
                IndexCommands::Report => {
                    let report = orchestrator.advisor().analyze_usage().await?;
                    println!("Index hit ratio: {:.3}", report.index_hit_ratio);
                    println!("Unused indexes: {}", report.unused_indexes.len());
                    for index in &report.unused_indexes {
                        println!("  {} on {} ({} bytes)", index.index, index.table, index.size_bytes);
                    }
                    println!("Redundant indexes: {}", report.redundant_indexes.len());
                    for pair in &report.redundant_indexes {
                        println!(
                            "  {} duplicates {} on {}({})",
                            pair.duplicate,
                            pair.kept,
                            pair.table,
                            pair.columns.join(", ")
                        );
                    }
                    println!("Missing index candidates: {}", report.missing_indexes.len());
                    for candidate in &report.missing_indexes {
                        println!("  {}: {}", candidate.table, candidate.reason);
                    }
                }
                IndexCommands::DropUnused { dry_run } => {
                    let outcomes = orchestrator.advisor().drop_unused_indexes(dry_run).await?;
                    for outcome in outcomes {
                        println!(
                            "{} ({}): {:?} - {}",
                            outcome.index, outcome.table, outcome.action, outcome.detail
                        );
                    }
                }
            }
        }

        Commands::Partitions { command } => {
            orchestrator.pool().initialize(config.pool.clone()).await?;
            match command {
                PartitionCommands::Bootstrap { table, date_column } => {
                    let report = orchestrator
                        .partitions()
                        .bootstrap(&table, &date_column)
                        .await?;
                    println!(
                        "Bootstrapped {} covering {} months:",
                        report.parent, report.months_covered
                    );
                    for (name, status) in report.outcomes {
                        println!("  {name}: {status}");
                    }
                }
                PartitionCommands::Ensure { table, months } => {
                    let outcomes = orchestrator
                        .partitions()
                        .ensure_future_partitions(&table, months)
                        .await?;
                    for outcome in outcomes {
                        println!(
                            "{}: {}",
                            outcome.name,
                            if outcome.created { "created" } else { "already existed" }
                        );
                    }
                }
                PartitionCommands::DropOld {
                    table,
                    retention_months,
                } => {
                    let retention =
                        retention_months.unwrap_or(config.partition.retention_months);
                    let outcomes = orchestrator
                        .partitions()
                        .drop_old_partitions(&table, retention)
                        .await?;
                    if outcomes.is_empty() {
                        println!("No partitions past the {retention}-month retention window.");
                    }
                    for outcome in outcomes {
                        println!(
                            "{}: {}",
                            outcome.name,
                            if outcome.dropped {
                                "dropped"
                            } else {
                                outcome.detail.as_str()
                            }
                        );
                    }
                }
                PartitionCommands::Migrate {
                    table,
                    date_column,
                    batch_size,
                } => {
                    let progress = orchestrator
                        .partitions()
                        .migrate_to_partitioned(&table, &date_column, batch_size)
                        .await?;
                    println!(
                        "Migrated {} rows into {} over {} batches ({:.1}% complete)",
                        progress.copied_rows,
                        progress.target,
                        progress.batches,
                        progress.percent_complete
                    );
                }
                PartitionCommands::List { table } => {
                    let partitions = orchestrator.partitions().list_partitions(&table).await?;
                    for descriptor in partitions {
                        println!(
                            "{} [{}, {}): {} rows, {} bytes, {} indexes",
                            descriptor.name,
                            descriptor.range_start,
                            descriptor.range_end,
                            descriptor.row_count,
                            descriptor.size_bytes,
                            descriptor.indexes.len()
                        );
                    }
                }
            }
        }

        Commands::Dashboard { format } => {
            orchestrator.pool().initialize(config.pool.clone()).await?;
            let dashboard = orchestrator.monitor().get_dashboard().await;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&dashboard)?),
                "table" => {
                    for row in dashboard.as_rows() {
                        println!(
                            "{:<28} {:>14.2} {:<12} {:?}",
                            row.metric, row.value, row.unit, row.severity
                        );
                    }
                }
                _ => println!("{}", dashboard.render_text()),
            }
        }

        Commands::Monitor { .. } => {
            let report = orchestrator.bootstrap().await;
            print_bootstrap(&report);
            Arc::clone(&orchestrator).start_auto_optimization();
            println!("Monitoring; press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            orchestrator.shutdown().await;
        }

        Commands::Optimize => {
            let report = orchestrator.bootstrap().await;
            print_bootstrap(&report);
            let pass = orchestrator.optimize_once().await;
            if pass.triggered {
                println!("\nRemediation actions:");
                for action in pass.actions {
                    println!(
                        "  {}: {} - {}",
                        action.action,
                        if action.succeeded { "ok" } else { "failed" },
                        action.detail
                    );
                }
            } else {
                println!("\nHealth score {} - no remediation needed.", pass.health_score);
            }
            orchestrator.shutdown().await;
        }
    }

    Ok(())
}

fn print_bootstrap(report: &dbpulse::orchestrator::BootstrapReport) {
    println!(
        "Bootstrap finished in {}ms ({}):",
        report.total_duration_ms,
        if report.succeeded() {
            "all phases succeeded"
        } else {
            "with failures"
        }
    );
    for phase in &report.phases {
        match &phase.error {
            Some(error) => println!("  {} FAILED after {}ms: {error}", phase.name, phase.duration_ms),
            None => println!("  {} ok in {}ms: {}", phase.name, phase.duration_ms, phase.detail),
        }
    }
}
