use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use logwarden::config::{load_pipeline_config, resolve_config_dir, select_services, validate_threshold};
use logwarden::error::{is_source_unavailable, PipelineError};
use logwarden::logs::rotation::{CompressionStats, ServiceResult};
use logwarden::logs::stats_aggregation::AggregatorOptions;
use logwarden::logs::{
    create_parser, render, AlertEngine, AlertLog, CleanupReport, ConsoleMonitorOutput,
    LogSource, PatternSet, PipelineConfig, ReportContext, ReportFormat, RotateOptions,
    RotationManager, RotationOutcome, StatsAggregator,
};

mod cli;

use cli::{AnalysisArgs, CleanupArgs, Cli, Commands, MonitorArgs, RotateArgs};

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_tracing(cli.verbose);

    let config_dir = resolve_config_dir(cli.config.clone());
    debug!("Using config directory {}", config_dir.display());

    let config = match load_pipeline_config(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load pipeline configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Monitor(args) => monitor(&config, args).await,
        Commands::Stats(args) => {
            let format = if args.json { ReportFormat::Json } else { ReportFormat::Text };
            analyse(&config, args, format).await
        }
        Commands::Report { args, format } => {
            let format = if args.json { ReportFormat::Json } else { *format };
            analyse(&config, args, format).await
        }
        Commands::Rotate(args) => rotate(&config, args).await,
        Commands::Cleanup(args) => cleanup(&config, args),
        Commands::Artifacts { service, dir } => artifacts(&config, service, dir.as_deref()),
        Commands::Services => {
            list_services(&config);
            Ok(true)
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Diagnostics go to stderr so stdout stays clean for reports
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn monitor(config: &PipelineConfig, args: &MonitorArgs) -> Result<bool> {
    let source = match (&args.file, &args.service) {
        (Some(path), service) => {
            let service = service.clone().unwrap_or_else(|| service_label_for_path(path));
            LogSource::from_path(service, path)
        }
        (None, Some(name)) if name != "all" => {
            let services = select_services(config, name)?;
            LogSource::from_config(services[0])
        }
        _ => {
            return Err(PipelineError::config(
                "monitor follows a single stream: pass --service NAME or --file PATH",
            )
            .into())
        }
    };

    // Every expression compiles before the stream is opened
    let classifier = match &args.pattern {
        Some(pattern) => PatternSet::from_combined(pattern)?,
        None => PatternSet::from_configs(&config.patterns)?,
    };
    let alert_pattern = args.alert_on.as_deref().unwrap_or(&config.alert.pattern);
    let mut engine = AlertEngine::new(source.service(), alert_pattern, classifier)?;

    if config.alert.persist && !args.no_persist {
        let path = args
            .alert_log
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.alert.log_path));
        engine = engine.with_alert_log(AlertLog::new(path));
    }

    info!("Following {}", source.describe());
    let mut stream = source.follow().await?;
    let mut output = ConsoleMonitorOutput::stdout()
        .with_color(!args.no_color)
        .with_quiet(args.quiet);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let summary = engine.watch(&mut stream, &mut output, shutdown).await?;
    debug!("Monitor stopped: {:?}", summary.stop_reason);
    Ok(true)
}

fn service_label_for_path(path: &str) -> String {
    if path == "-" {
        return "stdin".to_string();
    }
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

/// Sources for stats/report: `--file` wins over configured services
fn analysis_sources(config: &PipelineConfig, args: &AnalysisArgs) -> Result<(String, Vec<LogSource>)> {
    if let Some(path) = &args.file {
        let label = if args.service == "all" {
            service_label_for_path(path)
        } else {
            args.service.clone()
        };
        return Ok((label.clone(), vec![LogSource::from_path(label, path)]));
    }

    let sources = select_services(config, &args.service)?
        .into_iter()
        .map(LogSource::from_config)
        .collect();
    Ok((args.service.clone(), sources))
}

async fn analyse(config: &PipelineConfig, args: &AnalysisArgs, format: ReportFormat) -> Result<bool> {
    let top_n = args.top.unwrap_or(config.stats.top);
    let threshold_secs = args.threshold.unwrap_or(config.stats.threshold_secs);
    validate_threshold(threshold_secs)?;

    let (label, sources) = analysis_sources(config, args)?;
    let mut aggregator = StatsAggregator::new(AggregatorOptions {
        top_n,
        slow_threshold_ms: Some((threshold_secs * 1000.0).round() as u64),
    });

    let mut unavailable = Vec::new();
    for source in &sources {
        let lines = match source.read_lines(args.lines).await {
            Ok(lines) => lines,
            Err(e) if is_source_unavailable(&e) => {
                warn!("Skipping {}: {:#}", source.service(), e);
                unavailable.push(format!("{:#}", e));
                continue;
            }
            Err(e) => return Err(e),
        };

        let parser = create_parser(source.parser_type())?;
        debug!("Read {} lines from {}", lines.len(), source.describe());
        for line in &lines {
            aggregator.ingest(&parser.parse(line));
        }
    }

    if sources.is_empty() || unavailable.len() == sources.len() {
        match unavailable.first() {
            Some(reason) => println!("No data: {}", reason),
            None => println!("No data: no services configured"),
        }
        return Ok(true);
    }

    let snapshot = aggregator.snapshot();
    let rendered = render(&snapshot, format, &ReportContext::new(label))?;

    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, &rendered)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => println!("{}", rendered),
    }

    Ok(true)
}

fn rotation_manager(config: &PipelineConfig, dir: Option<&Path>) -> RotationManager {
    match dir {
        Some(dir) => RotationManager::new(dir, config.rotation.compression_level),
        None => RotationManager::from_config(&config.rotation),
    }
}

async fn rotate(config: &PipelineConfig, args: &RotateArgs) -> Result<bool> {
    let manager = rotation_manager(config, args.dir.as_deref());
    let options = RotateOptions {
        lines: args.lines,
        compress: args.compress || config.rotation.compress,
        max_files: args.max_files.unwrap_or(config.rotation.max_files),
        dry_run: args.dry_run,
    };

    let sources: Vec<LogSource> = select_services(config, &args.service)?
        .into_iter()
        .map(LogSource::from_config)
        .collect();

    if args.dry_run {
        println!("Dry run: no files will be written or deleted");
    }

    let report = manager.rotate_all(&sources, &options).await;
    for result in &report.results {
        print_rotation(result);
    }

    println!(
        "Rotation finished: {} succeeded, {} failed",
        report.succeeded(),
        report.failed()
    );
    let retention_complete = report.results.iter().all(|result| match &result.outcome {
        Ok(RotationOutcome::Rotated { cleanup, .. }) => cleanup.is_complete(),
        _ => true,
    });
    Ok(report.all_succeeded() && retention_complete)
}

fn print_rotation(result: &ServiceResult<RotationOutcome>) {
    match &result.outcome {
        Ok(RotationOutcome::NothingToRotate { service }) => {
            println!("[{}] nothing to rotate", service);
        }
        Ok(RotationOutcome::Rotated {
            artifact,
            lines,
            compression,
            cleanup,
        }) => {
            println!(
                "[{}] wrote {} ({} lines, {})",
                result.service,
                artifact.path.display(),
                lines,
                human_size(artifact.size_bytes)
            );
            if let Some(stats) = compression {
                print_compression(stats);
            }
            print_cleanup(cleanup);
        }
        Ok(RotationOutcome::Planned {
            artifact,
            lines,
            cleanup,
        }) => {
            println!(
                "[{}] would write {} ({} lines)",
                result.service,
                artifact.path.display(),
                lines
            );
            print_cleanup(cleanup);
        }
        Err(e) => println!("[{}] FAILED: {:#}", result.service, e),
    }
}

fn print_compression(stats: &CompressionStats) {
    println!(
        "    compressed {} -> {} ({:.1}% saved)",
        human_size(stats.original_bytes),
        human_size(stats.compressed_bytes),
        stats.savings_percent()
    );
}

fn print_cleanup(report: &CleanupReport) {
    if report.selected.is_empty() {
        println!(
            "    retention: {} of max {} kept, nothing to delete",
            report.kept(),
            report.max_files
        );
        return;
    }

    let verb = if report.dry_run { "would delete" } else { "deleted" };
    for file in &report.selected {
        match report.failed.iter().find(|failure| failure.path == file.path) {
            Some(failure) => println!("    FAILED to delete {}: {}", file.file_name(), failure.reason),
            None => println!("    {} {}", verb, file.file_name()),
        }
    }
    println!(
        "    retention: {} kept, {} {}",
        report.kept(),
        report.selected.len() - report.failed.len(),
        verb
    );
}

fn cleanup(config: &PipelineConfig, args: &CleanupArgs) -> Result<bool> {
    let manager = rotation_manager(config, args.dir.as_deref());
    let max_files = args.max_files.unwrap_or(config.rotation.max_files);
    let dry_run = args.dry_run || !args.force;

    let services: Vec<String> = select_services(config, &args.service)?
        .into_iter()
        .map(|service| service.name.clone())
        .collect();

    if dry_run && !args.dry_run {
        println!("Preview only; pass --force to delete");
    }

    let report = manager.cleanup_all(&services, max_files, dry_run);
    for result in &report.results {
        match &result.outcome {
            Ok(cleanup) => {
                println!("[{}] {} artifacts", result.service, cleanup.total);
                print_cleanup(cleanup);
            }
            Err(e) => println!("[{}] FAILED: {:#}", result.service, e),
        }
    }

    let retention_complete = report
        .results
        .iter()
        .all(|result| result.outcome.as_ref().map_or(true, CleanupReport::is_complete));
    Ok(report.all_succeeded() && retention_complete)
}

fn artifacts(config: &PipelineConfig, service: &str, dir: Option<&Path>) -> Result<bool> {
    let manager = rotation_manager(config, dir);
    let services = select_services(config, service)?;

    for service in services {
        let files = manager.list_artifacts(&service.name)?;
        println!("{} ({} artifacts)", service.name, files.len());
        for file in files {
            println!(
                "  {}  {:>10}  {}",
                file.created_at.format("%Y-%m-%d %H:%M:%S"),
                human_size(file.size_bytes),
                file.file_name()
            );
        }
    }

    Ok(true)
}

fn list_services(config: &PipelineConfig) {
    if config.services.is_empty() {
        println!("No services configured");
        return;
    }

    for service in &config.services {
        let source = LogSource::from_config(service);
        println!(
            "{:<16} {:<8} {}",
            service.name,
            format!("{:?}", service.parser).to_lowercase(),
            source.describe()
        );
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
