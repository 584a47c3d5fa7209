//! CLI subcommand handlers.

use crate::Commands;
use crate::GoldAction;
use crate::LedgerAction;
use crate::SchemaAction;
use anyhow::{Context, bail};
use chrono::{DateTime, NaiveDate, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use strata_core::{
    AggregateRow, FanoutSink, FileStatus, Granularity, JsonlEventSink, LocalObjectStore,
    MetricsSink, Pipeline, PipelineConfig, PipelineRun, RunStatus, SampleGenerator, SampleOptions,
    SchemaVersion, TracingEventSink, load_config,
};
use tokio_util::sync::CancellationToken;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        Commands::Init { force } => handle_init(workspace, force),
        Commands::Generate {
            start,
            days,
            readings_per_day,
            logs,
            seed,
        } => {
            let start = match start {
                Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .with_context(|| format!("invalid start date '{s}'"))?,
                None => SampleOptions::default().start,
            };
            let options = SampleOptions {
                start,
                days,
                readings_per_day,
                logs_per_equipment: logs,
                seed,
            };
            handle_generate(workspace, config_path, options).await
        }
        Commands::Run {
            dataset,
            force_refresh,
            since,
            until,
        } => {
            let range = parse_range(since.as_deref(), until.as_deref())?;
            let (pipeline, metrics) = open_pipeline(workspace, config_path)?;
            let cancel = cancel_on_ctrl_c();
            let runs = match &dataset {
                Some(name) => vec![pipeline.run_dataset(name, &cancel).await?],
                None => pipeline.run_all(&cancel).await?,
            };
            for run in &runs {
                println!("{}", format_run(run));
            }

            if force_refresh {
                let names: Vec<String> = match dataset {
                    Some(name) => vec![name],
                    None => dataset_names(pipeline.config()),
                };
                for name in names {
                    let report = pipeline.force_refresh(&name, range, &cancel).await?;
                    println!(
                        "  {}: {} window(s) refreshed, {} inconsistent",
                        name,
                        report.windows_refreshed,
                        report.inconsistencies.len()
                    );
                }
            }

            if let Some(snapshot) = metrics.snapshot() {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            let failed = runs.iter().filter(|r| r.status == RunStatus::Failed).count();
            if failed > 0 {
                bail!("{failed} run(s) failed");
            }
            Ok(())
        }
        Commands::Watch { interval } => {
            let (pipeline, _) = open_pipeline(workspace, config_path)?;
            let secs = interval.unwrap_or(pipeline.config().schedule.interval_secs);
            println!("Watching every {secs}s. Press Ctrl-C to stop.");
            let cancel = cancel_on_ctrl_c();
            let rounds = pipeline.watch(Duration::from_secs(secs), &cancel).await?;
            println!("Stopped after {rounds} round(s).");
            Ok(())
        }
        Commands::Status { dataset, limit } => {
            let (pipeline, _) = open_pipeline(workspace, config_path)?;
            handle_status(&pipeline, dataset.as_deref(), limit).await
        }
        Commands::Ledger { action } => {
            let (pipeline, _) = open_pipeline(workspace, config_path)?;
            handle_ledger(&pipeline, action).await
        }
        Commands::Schema { action } => {
            let (pipeline, _) = open_pipeline(workspace, config_path)?;
            handle_schema(&pipeline, action).await
        }
        Commands::Gold { action } => {
            let (pipeline, _) = open_pipeline(workspace, config_path)?;
            handle_gold(&pipeline, action).await
        }
    }
}

fn handle_init(workspace: &Path, force: bool) -> anyhow::Result<()> {
    let path = strata_core::config::write_starter_config(workspace, &PipelineConfig::sample(), force)?;
    println!("Configuration written to {}", path.display());
    println!("Next: `strata generate` then `strata run`.");
    Ok(())
}

async fn handle_generate(
    workspace: &Path,
    config_path: Option<&Path>,
    options: SampleOptions,
) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace, config_path)?;
    let objects = LocalObjectStore::new(&config.storage.object_root);
    let mut generator = SampleGenerator::new(options);
    let summary = generator.write_to(&objects).await?;
    println!(
        "Wrote {} file(s) to {}: {} sensor readings ({} anomalies), {} equipment log entries, {} quality metric rows",
        summary.files.len(),
        config.storage.object_root.display(),
        summary.sensor_readings,
        summary.anomalies_injected,
        summary.equipment_logs,
        summary.quality_metrics
    );
    Ok(())
}

async fn handle_status(
    pipeline: &Pipeline,
    dataset: Option<&str>,
    limit: usize,
) -> anyhow::Result<()> {
    let names = match dataset {
        Some(name) => vec![name.to_string()],
        None => dataset_names(pipeline.config()),
    };
    for name in &names {
        let status = pipeline.dataset_status(name).await?;
        println!("{}", status.dataset);
        println!(
            "  schema version: {}",
            status
                .schema_version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".into())
        );
        println!(
            "  files: {} committed, {} failed, {} pending",
            status.files_committed, status.files_failed, status.files_pending
        );
        if status.open_conflicts > 0 {
            println!(
                "  BLOCKED: {} open ledger conflict(s); see `strata ledger conflicts {}`",
                status.open_conflicts, status.dataset
            );
        }
        println!(
            "  rows: bronze {}, silver {}, gold {}",
            status.bronze_rows, status.silver_rows, status.gold_rows
        );
    }

    let runs = pipeline.status(dataset, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded.");
    } else {
        println!("Recent runs:");
        for run in &runs {
            println!("{}", format_run(run));
        }
    }
    Ok(())
}

async fn handle_ledger(pipeline: &Pipeline, action: LedgerAction) -> anyhow::Result<()> {
    let ledger = pipeline.ledger();
    match action {
        LedgerAction::List { dataset, status } => {
            let status = status
                .map(|s| s.parse::<FileStatus>().map_err(anyhow::Error::msg))
                .transpose()?;
            let entries = ledger.entries(&dataset, status).await?;
            if entries.is_empty() {
                println!("No ledger entries.");
            }
            for entry in entries {
                let detail = match (&entry.failure_kind, &entry.failure_reason) {
                    (Some(kind), Some(reason)) => format!(" [{kind}] {reason}"),
                    _ => String::new(),
                };
                println!(
                    "{:<10} {:<48} rows={:<8} v{} {}{}",
                    entry.status.to_string(),
                    entry.file_identity,
                    entry.row_count,
                    entry
                        .schema_version
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".into()),
                    short_hash(&entry.fingerprint),
                    detail
                );
            }
        }
        LedgerAction::Retry { dataset, file } => {
            ledger.retry(&dataset, &file).await?;
            println!("{file} is pending again; the next run re-ingests it.");
        }
        LedgerAction::Conflicts { dataset, all } => {
            let conflicts = ledger.conflicts(&dataset, all).await?;
            if conflicts.is_empty() {
                println!("No conflicts.");
            }
            for c in conflicts {
                println!(
                    "{} committed={} observed={} detected={}{}",
                    c.file_identity,
                    short_hash(&c.committed_fingerprint),
                    short_hash(&c.observed_fingerprint),
                    c.detected_at.to_rfc3339(),
                    if c.acknowledged { " (acknowledged)" } else { "" }
                );
            }
        }
        LedgerAction::Resolve { dataset, file } => {
            let count = ledger.acknowledge(&dataset, &file).await?;
            println!("Acknowledged {count} conflict(s) for {file}; committed data kept.");
        }
    }
    Ok(())
}

async fn handle_schema(pipeline: &Pipeline, action: SchemaAction) -> anyhow::Result<()> {
    let registry = pipeline.registry();
    match action {
        SchemaAction::Show { dataset, version } => {
            let schema = match version {
                Some(v) => registry.version(&dataset, v).await?,
                None => registry
                    .current(&dataset)
                    .await?
                    .map(|v| v.as_ref().clone()),
            };
            match schema {
                Some(schema) => print!("{}", format_schema(&schema)),
                None => println!("No schema published for {dataset}."),
            }
        }
        SchemaAction::History { dataset } => {
            let versions = registry.versions(&dataset).await?;
            if versions.is_empty() {
                println!("No schema published for {dataset}.");
            }
            for v in versions {
                println!(
                    "v{} ({}) {} field(s), {} change(s)",
                    v.version,
                    v.created_at.to_rfc3339(),
                    v.fields.len(),
                    v.changes.len()
                );
                for change in &v.changes {
                    println!("  {}", serde_json::to_string(change)?);
                }
            }
        }
    }
    Ok(())
}

async fn handle_gold(pipeline: &Pipeline, action: GoldAction) -> anyhow::Result<()> {
    match action {
        GoldAction::Show {
            dataset,
            entity,
            granularity,
        } => {
            let granularity = granularity
                .map(|g| g.parse::<Granularity>().map_err(anyhow::Error::msg))
                .transpose()?;
            let rows = pipeline
                .store()
                .gold_rows(&dataset, entity.as_deref(), granularity)
                .await?;
            if rows.is_empty() {
                println!("No gold rows.");
            }
            for row in &rows {
                println!("{}", format_gold_row(row));
            }
        }
        GoldAction::Late { dataset } => {
            let rejected = pipeline.store().late_rejections(&dataset).await?;
            if rejected.is_empty() {
                println!("No late rows rejected.");
            }
            for r in rejected {
                println!(
                    "{} event={} window={} rejected={}",
                    r.entity_key,
                    r.event_time.to_rfc3339(),
                    r.window_start.to_rfc3339(),
                    r.rejected_at.to_rfc3339()
                );
            }
        }
    }
    Ok(())
}

/// Load configuration and anchor relative storage paths at the workspace.
fn load_workspace_config(
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<PipelineConfig> {
    let mut config = load_config(Some(workspace), config_path, None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    resolve_paths(&mut config, workspace);
    Ok(config)
}

fn resolve_paths(config: &mut PipelineConfig, workspace: &Path) {
    let storage = &mut config.storage;
    if storage.object_root.is_relative() {
        storage.object_root = workspace.join(&storage.object_root);
    }
    if storage.database.is_relative() {
        storage.database = workspace.join(&storage.database);
    }
    if let Some(log) = storage.events_log.as_mut() {
        if log.is_relative() {
            *log = workspace.join(&*log);
        }
    }
}

fn open_pipeline(
    workspace: &Path,
    config_path: Option<&Path>,
) -> anyhow::Result<(Pipeline, Arc<MetricsSink>)> {
    let config = load_workspace_config(workspace, config_path)?;
    let metrics = Arc::new(MetricsSink::new());
    let mut sink = FanoutSink::new()
        .with(Arc::new(TracingEventSink))
        .with(metrics.clone());
    if let Some(path) = &config.storage.events_log {
        let jsonl = JsonlEventSink::open(path)
            .with_context(|| format!("cannot open event log {}", path.display()))?;
        sink = sink.with(Arc::new(jsonl));
    }
    let pipeline = Pipeline::open(config, Arc::new(sink))?;
    Ok((pipeline, metrics))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}

fn dataset_names(config: &PipelineConfig) -> Vec<String> {
    config.datasets.iter().map(|d| d.name.clone()).collect()
}

fn parse_range(
    since: Option<&str>,
    until: Option<&str>,
) -> anyhow::Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("invalid RFC 3339 timestamp '{s}'"))
    };
    match (since, until) {
        (None, None) => Ok(None),
        (Some(since), Some(until)) => {
            let (start, end) = (parse(since)?, parse(until)?);
            if start >= end {
                bail!("--since must be before --until");
            }
            Ok(Some((start, end)))
        }
        _ => bail!("--since and --until must be given together"),
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn format_run(run: &PipelineRun) -> String {
    let mut out = format!(
        "{} {} {} stage={} records={}",
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.dataset,
        run.status,
        run.stage,
        run.records_processed
    );
    for item in &run.error_summary {
        out.push_str(&format!("\n  {} x{}", item.kind, item.count));
        for example in &item.examples {
            out.push_str(&format!("\n    {example}"));
        }
    }
    out
}

fn format_schema(schema: &SchemaVersion) -> String {
    let mut out = format!(
        "{} v{}{}\n",
        schema.dataset,
        schema.version,
        schema
            .parent_version
            .map(|p| format!(" (from v{p})"))
            .unwrap_or_default()
    );
    for field in &schema.fields {
        out.push_str(&format!(
            "  {:<24} {}{}\n",
            field.name,
            field.field_type,
            if field.nullable { "?" } else { "" }
        ));
    }
    out
}

fn format_gold_row(row: &AggregateRow) -> String {
    let metrics: Vec<String> = row
        .metrics
        .iter()
        .map(|(name, m)| {
            format!(
                "{name}: n={} mean={:.3} min={:.3} max={:.3}",
                m.count, m.mean, m.min, m.max
            )
        })
        .collect();
    format!(
        "{} {} {} records={} anomalies={} flagged={} {}",
        row.entity_key,
        row.granularity,
        row.window_start.format("%Y-%m-%d %H:%M"),
        row.source_record_count,
        row.anomaly_count,
        row.flagged_count,
        metrics.join(", ")
    )
}
