//! Command-line surface

use clap::{Args, Parser, Subcommand};
use logwarden::logs::ReportFormat;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "logwarden")]
#[command(
    about = "Log telemetry pipeline: live alerting, access-log statistics, reports, and snapshot rotation"
)]
#[command(version)]
pub struct Cli {
    /// Configuration directory (default: /etc/logwarden/config if exists, otherwise ~/.config/logwarden/config)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print debug diagnostics to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow a live log stream, colour lines and raise alerts
    Monitor(MonitorArgs),
    /// Print access-log statistics
    Stats(AnalysisArgs),
    /// Render a statistics report (text, json or html)
    Report {
        #[command(flatten)]
        args: AnalysisArgs,

        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Html)]
        format: ReportFormat,
    },
    /// Snapshot service logs to timestamped files and apply retention
    Rotate(RotateArgs),
    /// Delete the oldest snapshots beyond the retention limit
    Cleanup(CleanupArgs),
    /// List retained snapshots
    Artifacts {
        /// Service name, or "all"
        #[arg(long, default_value = "all")]
        service: String,

        /// Snapshot directory (default from config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List configured services
    Services,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Service to follow
    #[arg(long)]
    pub service: Option<String>,

    /// Follow this file instead of a configured service ("-" for stdin)
    #[arg(long)]
    pub file: Option<String>,

    /// Alert expression (default from config: "ERROR|CRITICAL|FATAL")
    #[arg(long)]
    pub alert_on: Option<String>,

    /// Classification expression replacing the default pattern set
    #[arg(long)]
    pub pattern: Option<String>,

    /// Alert log path (default from config)
    #[arg(long)]
    pub alert_log: Option<PathBuf>,

    /// Do not append alerts to the alert log
    #[arg(long)]
    pub no_persist: bool,

    /// Disable ANSI colours
    #[arg(long)]
    pub no_color: bool,

    /// Only print alert banners and the summary
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct AnalysisArgs {
    /// Service name, or "all" to merge every configured service
    #[arg(long, default_value = "all")]
    pub service: String,

    /// Analyse this file instead of configured services ("-" for stdin)
    #[arg(long)]
    pub file: Option<String>,

    /// Size of ranked tables
    #[arg(long, value_parser = parse_positive)]
    pub top: Option<usize>,

    /// Slow-request threshold in seconds
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Only analyse the last N lines of each source
    #[arg(long, value_parser = parse_positive)]
    pub lines: Option<usize>,

    /// Machine-readable JSON output
    #[arg(long)]
    pub json: bool,

    /// Write the result to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RotateArgs {
    /// Service name, or "all"
    #[arg(long, default_value = "all")]
    pub service: String,

    /// Only snapshot the last N lines
    #[arg(long, value_parser = parse_positive)]
    pub lines: Option<usize>,

    /// Gzip snapshots
    #[arg(long)]
    pub compress: bool,

    /// Snapshots kept per service (default from config)
    #[arg(long, value_parser = parse_positive)]
    pub max_files: Option<usize>,

    /// Snapshot directory (default from config)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Show what would be written and deleted without touching files
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Service name, or "all"
    #[arg(long, default_value = "all")]
    pub service: String,

    /// Snapshots kept per service (default from config)
    #[arg(long, value_parser = parse_positive)]
    pub max_files: Option<usize>,

    /// Snapshot directory (default from config)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Only list what would be deleted
    #[arg(long)]
    pub dry_run: bool,

    /// Actually delete; without it cleanup only previews
    #[arg(long, conflicts_with = "dry_run")]
    pub force: bool,
}

fn parse_positive(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err("must be a positive integer".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_stats_flags() {
        let cli = Cli::try_parse_from([
            "logwarden", "stats", "--service", "backend", "--top", "5", "--threshold", "0.5", "--json",
        ])
        .unwrap();

        match cli.command {
            Commands::Stats(args) => {
                assert_eq!(args.service, "backend");
                assert_eq!(args.top, Some(5));
                assert_eq!(args.threshold, Some(0.5));
                assert!(args.json);
            }
            other => panic!("Expected stats, got {:?}", other),
        }
    }

    #[test]
    fn test_report_defaults_to_html() {
        let cli = Cli::try_parse_from(["logwarden", "report"]).unwrap();
        match cli.command {
            Commands::Report { args, format } => {
                assert_eq!(format, ReportFormat::Html);
                assert_eq!(args.service, "all");
            }
            other => panic!("Expected report, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_top_rejected() {
        assert!(Cli::try_parse_from(["logwarden", "stats", "--top", "0"]).is_err());
        assert!(Cli::try_parse_from(["logwarden", "rotate", "--max-files", "0"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["logwarden", "services", "--verbose", "--config", "/tmp/c"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c")));
    }

    #[test]
    fn test_force_conflicts_with_dry_run() {
        assert!(Cli::try_parse_from(["logwarden", "cleanup", "--force", "--dry-run"]).is_err());
    }
}
