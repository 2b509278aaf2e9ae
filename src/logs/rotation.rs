//! Snapshot rotation and retention
//!
//! A rotation reads the current content of a service's log source and writes
//! it to `<dir>/<service>_<YYYYMMDD>_<HHMMSS>.log`, optionally gzipped to
//! `.log.gz`. Two rotations within the same second get `_1`, `_2`, ...
//! before the extension; files are created with `create_new`, so concurrent
//! runs never overwrite each other.
//!
//! Retention keeps at most `max_files` artifacts per service and removes the
//! oldest by creation time. Creation time is the timestamp in the file name.
//!
//! Artifact lifecycle:
//!
//! ```text
//! ACTIVE (planned / being written) -> SNAPSHOT -> COMPRESSED (optional) -> EXPIRED (deleted)
//! ```

use crate::error::PipelineError;
use crate::logs::{LogSource, RotationConfig};
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const NAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Lifecycle state of a rotation artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactState {
    /// Planned or still being written
    Active,
    /// Plain snapshot on disk
    Snapshot,
    /// Gzipped snapshot on disk
    Compressed,
    /// Selected for deletion by retention
    Expired,
}

/// A rotation artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionFile {
    pub service: String,
    /// Local time encoded in the file name
    pub created_at: NaiveDateTime,
    pub path: PathBuf,
    pub compressed: bool,
    pub size_bytes: u64,
    pub state: ArtifactState,
    /// Same-second collision counter from the file name
    #[serde(skip)]
    sequence: u32,
}

impl RetentionFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Options for one rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotateOptions {
    /// Only snapshot the last `K` lines
    pub lines: Option<usize>,
    pub compress: bool,
    /// Retention applied after the snapshot
    pub max_files: usize,
    /// Report what would happen without touching the filesystem
    pub dry_run: bool,
}

impl RotateOptions {
    pub fn from_config(config: &RotationConfig) -> Self {
        Self {
            lines: None,
            compress: config.compress,
            max_files: config.max_files,
            dry_run: false,
        }
    }
}

/// Space saved by compressing an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub original_bytes: u64,
    pub compressed_bytes: u64,
}

impl CompressionStats {
    /// Saved space in percent of the original size
    pub fn savings_percent(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        (1.0 - self.compressed_bytes as f64 / self.original_bytes as f64) * 100.0
    }
}

/// Result of a retention pass over one service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub service: String,
    pub dry_run: bool,
    /// Artifacts present before the pass (including a pending one in a dry-run rotation)
    pub total: usize,
    pub max_files: usize,
    /// Oldest first; deleted unless this was a dry run
    pub selected: Vec<RetentionFile>,
    /// Selected artifacts that could not be deleted
    pub failed: Vec<FailedDeletion>,
}

impl CleanupReport {
    pub fn kept(&self) -> usize {
        self.total - self.selected.len() + self.failed.len()
    }

    /// Every selected artifact was removed (or would be, in a dry run)
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An expired artifact that is still on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDeletion {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of rotating one service
#[derive(Debug, Clone, PartialEq)]
pub enum RotationOutcome {
    /// The source had no content; nothing was written
    NothingToRotate { service: String },
    /// A snapshot was written
    Rotated {
        artifact: RetentionFile,
        lines: usize,
        compression: Option<CompressionStats>,
        cleanup: CleanupReport,
    },
    /// Dry run: what a real run would have done
    Planned {
        artifact: RetentionFile,
        lines: usize,
        cleanup: CleanupReport,
    },
}

/// Outcome of one service within a batch
#[derive(Debug)]
pub struct ServiceResult<T> {
    pub service: String,
    pub outcome: Result<T>,
}

/// Per-service results of an all-services operation
#[derive(Debug)]
pub struct BatchReport<T> {
    pub results: Vec<ServiceResult<T>>,
}

impl<T> BatchReport<T> {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

/// Writes snapshots and enforces retention in one directory
#[derive(Debug, Clone)]
pub struct RotationManager {
    dir: PathBuf,
    compression_level: u32,
}

impl RotationManager {
    pub fn new(dir: impl Into<PathBuf>, compression_level: u32) -> Self {
        Self {
            dir: dir.into(),
            compression_level,
        }
    }

    pub fn from_config(config: &RotationConfig) -> Self {
        Self::new(&config.dir, config.compression_level)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `source`, then apply retention for its service
    pub async fn rotate(&self, source: &LogSource, options: &RotateOptions) -> Result<RotationOutcome> {
        let service = source.service();
        validate_service_name(service)?;
        validate_max_files(options.max_files)?;

        let lines = source.read_lines(options.lines).await?;
        if lines.is_empty() {
            info!("Nothing to rotate for {}", service);
            return Ok(RotationOutcome::NothingToRotate {
                service: service.to_string(),
            });
        }

        let mut content = lines.join("\n");
        content.push('\n');
        let created_at = Local::now().naive_local();

        if options.dry_run {
            let artifact = RetentionFile {
                service: service.to_string(),
                created_at,
                path: self.dir.join(artifact_name(service, &created_at, 0, options.compress)),
                compressed: options.compress,
                size_bytes: content.len() as u64,
                state: ArtifactState::Active,
                sequence: 0,
            };
            let cleanup = self.plan_cleanup(service, options.max_files, 1)?;
            return Ok(RotationOutcome::Planned {
                artifact,
                lines: lines.len(),
                cleanup,
            });
        }

        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create rotation directory {}", self.dir.display())
        })?;

        let (path, sequence, mut file) = create_artifact(&self.dir, service, &created_at)?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write snapshot {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync snapshot {}", path.display()))?;
        drop(file);

        let original_bytes = content.len() as u64;
        let mut artifact = RetentionFile {
            service: service.to_string(),
            created_at,
            path,
            compressed: false,
            size_bytes: original_bytes,
            state: ArtifactState::Snapshot,
            sequence,
        };
        info!("Rotated {} lines of {} to {}", lines.len(), service, artifact.path.display());

        let compression = if options.compress {
            let (gz_path, compressed_bytes) = compress_file(&artifact.path, self.compression_level)?;
            artifact.path = gz_path;
            artifact.compressed = true;
            artifact.size_bytes = compressed_bytes;
            artifact.state = ArtifactState::Compressed;
            Some(CompressionStats {
                original_bytes,
                compressed_bytes,
            })
        } else {
            None
        };

        let cleanup = self.cleanup(service, options.max_files, false)?;

        Ok(RotationOutcome::Rotated {
            artifact,
            lines: lines.len(),
            compression,
            cleanup,
        })
    }

    /// Rotate every source in order; one failure does not stop the rest
    pub async fn rotate_all(&self, sources: &[LogSource], options: &RotateOptions) -> BatchReport<RotationOutcome> {
        let mut results = Vec::with_capacity(sources.len());

        for source in sources {
            let outcome = self.rotate(source, options).await;
            if let Err(e) = &outcome {
                error!("Rotation failed for {}: {:#}", source.service(), e);
            }
            results.push(ServiceResult {
                service: source.service().to_string(),
                outcome,
            });
        }

        BatchReport { results }
    }

    /// Artifacts of `service`, oldest first
    pub fn list_artifacts(&self, service: &str) -> Result<Vec<RetentionFile>> {
        validate_service_name(service)?;

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read rotation directory {}", self.dir.display())
                })
            }
        };

        let name_pattern = artifact_pattern(service)?;
        let mut artifacts = Vec::new();

        for entry in entries.filter_map(|entry| entry.ok()) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(caps) = name_pattern.captures(name) else {
                continue;
            };

            let stamp = format!("{}_{}", &caps[1], &caps[2]);
            let Ok(created_at) = NaiveDateTime::parse_from_str(&stamp, NAME_TIME_FORMAT) else {
                debug!("Skipping {} with invalid timestamp", name);
                continue;
            };
            let sequence = caps
                .get(3)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let compressed = caps.get(4).is_some();
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);

            artifacts.push(RetentionFile {
                service: service.to_string(),
                created_at,
                path: entry.path(),
                compressed,
                size_bytes,
                state: if compressed {
                    ArtifactState::Compressed
                } else {
                    ArtifactState::Snapshot
                },
                sequence,
            });
        }

        artifacts.sort_by_key(|a| (a.created_at, a.sequence));
        Ok(artifacts)
    }

    /// Remove the oldest artifacts beyond `max_files`; `dry_run` only reports
    pub fn cleanup(&self, service: &str, max_files: usize, dry_run: bool) -> Result<CleanupReport> {
        let report = self.plan_cleanup(service, max_files, 0)?;
        let mut report = CleanupReport { dry_run, ..report };

        if !dry_run {
            for artifact in &report.selected {
                match fs::remove_file(&artifact.path) {
                    Ok(()) => info!("Deleted expired artifact {}", artifact.path.display()),
                    Err(e) => {
                        error!("Failed to delete artifact {}: {}", artifact.path.display(), e);
                        report.failed.push(FailedDeletion {
                            path: artifact.path.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(report)
    }

    /// Retention over several services; one failure does not stop the rest
    pub fn cleanup_all(&self, services: &[String], max_files: usize, dry_run: bool) -> BatchReport<CleanupReport> {
        let results = services
            .iter()
            .map(|service| {
                let outcome = self.cleanup(service, max_files, dry_run);
                if let Err(e) = &outcome {
                    error!("Cleanup failed for {}: {:#}", service, e);
                }
                ServiceResult {
                    service: service.clone(),
                    outcome,
                }
            })
            .collect();

        BatchReport { results }
    }

    /// Select expired artifacts as if `pending` newer artifacts already existed
    fn plan_cleanup(&self, service: &str, max_files: usize, pending: usize) -> Result<CleanupReport> {
        validate_max_files(max_files)?;

        let artifacts = self.list_artifacts(service)?;
        let total = artifacts.len() + pending;
        let to_remove = total.saturating_sub(max_files).min(artifacts.len());

        let selected = artifacts
            .into_iter()
            .take(to_remove)
            .map(|artifact| RetentionFile {
                state: ArtifactState::Expired,
                ..artifact
            })
            .collect();

        Ok(CleanupReport {
            service: service.to_string(),
            dry_run: true,
            total,
            max_files,
            selected,
            failed: Vec::new(),
        })
    }
}

fn validate_max_files(max_files: usize) -> Result<()> {
    if max_files == 0 {
        return Err(PipelineError::config("max files must be at least 1").into());
    }
    Ok(())
}

/// Service names end up in file names
fn validate_service_name(service: &str) -> Result<()> {
    let valid = !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && service != "."
        && service != "..";
    if !valid {
        return Err(PipelineError::config(format!(
            "service name '{}' cannot be used in artifact names",
            service
        ))
        .into());
    }
    Ok(())
}

fn artifact_name(service: &str, created_at: &NaiveDateTime, sequence: u32, compressed: bool) -> String {
    let suffix = if sequence == 0 {
        String::new()
    } else {
        format!("_{}", sequence)
    };
    let ext = if compressed { ".log.gz" } else { ".log" };
    format!(
        "{}_{}{}{}",
        service,
        created_at.format(NAME_TIME_FORMAT),
        suffix,
        ext
    )
}

fn artifact_pattern(service: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"^{}_(\d{{8}})_(\d{{6}})(?:_(\d+))?\.log(\.gz)?$",
        regex::escape(service)
    ))
    .context("Failed to build artifact name pattern")
}

/// Create a new artifact file, adding a collision suffix when the name is taken
fn create_artifact(dir: &Path, service: &str, created_at: &NaiveDateTime) -> Result<(PathBuf, u32, File)> {
    for sequence in 0..u32::MAX {
        let path = dir.join(artifact_name(service, created_at, sequence, false));
        if dir.join(artifact_name(service, created_at, sequence, true)).exists() {
            continue;
        }

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, sequence, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create snapshot {}", path.display()))
            }
        }
    }

    Err(anyhow::anyhow!("No free artifact name for {} in {}", service, dir.display()))
}

/// Gzip `path` to `<path>.gz`, remove the original, return the new path and size
fn compress_file(path: &Path, level: u32) -> Result<(PathBuf, u64)> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);

    let mut input = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&gz_path)
        .with_context(|| format!("Failed to create {}", gz_path.display()))?;

    let mut encoder = GzEncoder::new(output, Compression::new(level));
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("Failed to compress {}", path.display()))?;
    let output = encoder
        .finish()
        .with_context(|| format!("Failed to finish {}", gz_path.display()))?;
    output.sync_all()?;

    fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;

    let size = fs::metadata(&gz_path)?.len();
    debug!("Compressed {} to {} bytes", gz_path.display(), size);
    Ok((gz_path, size))
}
