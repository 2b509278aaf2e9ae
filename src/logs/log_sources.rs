//! Log sources
//!
//! A [`LogSource`] is where a service's lines come from: a local file, the
//! standard output of a command, or this process's standard input. Sources
//! are read-only; nothing here ever writes back to them.
//!
//! Two access modes:
//! - [`LogSource::read_lines`] reads the current content once (batch tools)
//! - [`LogSource::follow`] returns a [`LineStream`] of live lines (monitor)
//!
//! File following polls the file and restarts from the beginning when the
//! inode changes or the file shrinks.

use crate::error::PipelineError;
use crate::logs::{ParserType, ServiceConfig, SourceConfig};
use anyhow::Result;
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

/// How often a followed file is checked for new content
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lines buffered between a source task and its consumer
const CHANNEL_CAPACITY: usize = 1024;

/// Something that yields lines one at a time until it ends
#[async_trait]
pub trait LineSource: Send {
    /// Next line, `None` once the source has ended
    async fn next_line(&mut self) -> Option<String>;
}

/// Live lines fed by a background reader task
pub struct LineStream {
    receiver: mpsc::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl LineStream {
    /// A finite stream over already collected lines
    pub fn from_lines<I>(lines: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let (sender, receiver) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // Capacity covers every line
            let _ = sender.try_send(line);
        }
        Self {
            receiver,
            task: None,
        }
    }

    fn spawn<F, Fut>(reader: F) -> Self
    where
        F: FnOnce(mpsc::Sender<String>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(reader(sender));
        Self {
            receiver,
            task: Some(task),
        }
    }
}

#[async_trait]
impl LineSource for LineStream {
    async fn next_line(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A named, read-only source of log lines
#[derive(Debug, Clone, PartialEq)]
pub struct LogSource {
    service: String,
    kind: SourceConfig,
    parser: ParserType,
}

impl LogSource {
    pub fn new(service: impl Into<String>, kind: SourceConfig) -> Self {
        Self {
            service: service.into(),
            kind,
            parser: ParserType::Auto,
        }
    }

    /// Create from a configured service
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.name.clone(), config.source.clone()).with_parser(config.parser)
    }

    /// Ad-hoc source for `--file PATH`; `-` means standard input
    pub fn from_path(service: impl Into<String>, path: &str) -> Self {
        let kind = if path == "-" {
            SourceConfig::Stdin
        } else {
            SourceConfig::File {
                path: path.to_string(),
            }
        };
        Self::new(service, kind)
    }

    pub fn with_parser(mut self, parser: ParserType) -> Self {
        self.parser = parser;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn kind(&self) -> &SourceConfig {
        &self.kind
    }

    pub fn parser_type(&self) -> ParserType {
        self.parser
    }

    /// Human readable origin of the lines
    pub fn describe(&self) -> String {
        describe_source(&self.kind)
    }

    /// Read the current content, keeping only the last `limit` lines if set
    pub async fn read_lines(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let text = match &self.kind {
            SourceConfig::File { path } => self.read_file(Path::new(path)).await?,
            SourceConfig::Command { command, .. } => self.run_command(command).await?,
            SourceConfig::Stdin => {
                let mut buf = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| PipelineError::unavailable(&self.service, e.to_string()))?;
                String::from_utf8_lossy(&buf).into_owned()
            }
        };

        let lines = split_lines(&text);
        debug!(
            "Read {} lines from {} ({})",
            lines.len(),
            self.service,
            self.describe()
        );
        Ok(keep_last(lines, limit))
    }

    /// Start following live output
    pub async fn follow(&self) -> Result<LineStream> {
        match &self.kind {
            SourceConfig::File { path } => {
                let path = PathBuf::from(path);
                let state = TailState::at_end(&path).map_err(|e| {
                    PipelineError::unavailable(
                        &self.service,
                        format!("{}: {}", path.display(), e),
                    )
                })?;
                let service = self.service.clone();
                Ok(LineStream::spawn(move |sender| {
                    tail_file(service, path, state, sender)
                }))
            }
            SourceConfig::Command {
                command,
                follow_command,
            } => {
                let command = follow_command.as_deref().unwrap_or(command);
                let argv = split_command(&self.service, command)?;
                let mut child = Command::new(&argv[0])
                    .args(&argv[1..])
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        PipelineError::unavailable(
                            &self.service,
                            format!("failed to run '{}': {}", argv[0], e),
                        )
                    })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    PipelineError::unavailable(&self.service, "command has no standard output")
                })?;
                Ok(LineStream::spawn(move |sender| async move {
                    forward_lines(stdout, sender).await;
                    // Child is killed on drop if the consumer went away first
                    let _ = child.wait().await;
                }))
            }
            // A blocked stdin read must not hold up runtime shutdown, so it
            // runs on a plain thread rather than the blocking pool
            SourceConfig::Stdin => {
                let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
                std::thread::Builder::new()
                    .name("stdin-reader".to_string())
                    .spawn(move || forward_lines_blocking(std::io::stdin().lock(), sender))
                    .map_err(|e| {
                        PipelineError::unavailable(
                            &self.service,
                            format!("failed to start stdin reader: {}", e),
                        )
                    })?;
                Ok(LineStream {
                    receiver,
                    task: None,
                })
            }
        }
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            PipelineError::unavailable(&self.service, format!("{}: {}", path.display(), e))
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn run_command(&self, command: &str) -> Result<String> {
        let argv = split_command(&self.service, command)?;
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                PipelineError::unavailable(
                    &self.service,
                    format!("failed to run '{}': {}", argv[0], e),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .find(|line| !line.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("'{}' exited with {}", argv[0], output.status));

            if output.stdout.is_empty() {
                return Err(PipelineError::unavailable(&self.service, reason).into());
            }
            warn!("Command for {} failed, using partial output: {}", self.service, reason);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Short description of a configured source
pub fn describe_source(kind: &SourceConfig) -> String {
    match kind {
        SourceConfig::File { path } => format!("file {}", path),
        SourceConfig::Command { command, .. } => format!("command `{}`", command),
        SourceConfig::Stdin => "stdin".to_string(),
    }
}

/// Split a command line into program and arguments
fn split_command(service: &str, command: &str) -> Result<Vec<String>> {
    match shlex::split(command) {
        Some(argv) if !argv.is_empty() => Ok(argv),
        _ => Err(PipelineError::config(format!(
            "invalid command for service '{}': {}",
            service, command
        ))
        .into()),
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

fn keep_last(mut lines: Vec<String>, limit: Option<usize>) -> Vec<String> {
    if let Some(limit) = limit {
        if lines.len() > limit {
            lines.drain(..lines.len() - limit);
        }
    }
    lines
}

/// Forward lines until EOF; invalid UTF-8 is replaced, never fatal
async fn forward_lines<R>(reader: R, sender: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                if sender.send(decode_line(&buf)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Stopped reading log stream: {}", e);
                return;
            }
        }
    }
}

/// Blocking counterpart of [`forward_lines`] for a dedicated reader thread
fn forward_lines_blocking<R: BufRead>(mut reader: R, sender: mpsc::Sender<String>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if sender.blocking_send(decode_line(&buf)).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Stopped reading standard input: {}", e);
                return;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Read position and identity of a followed file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TailState {
    position: u64,
    inode: u64,
    size: u64,
}

impl TailState {
    /// Start at the current end of the file
    fn at_end(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            position: metadata.len(),
            inode: metadata.ino(),
            size: metadata.len(),
        })
    }
}

async fn tail_file(service: String, path: PathBuf, mut state: TailState, sender: mpsc::Sender<String>) {
    let mut interval = time::interval(POLL_INTERVAL);

    loop {
        interval.tick().await;

        match read_appended(&path, &mut state) {
            Ok(lines) => {
                for line in lines {
                    if sender.send(line).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => debug!("Error reading {} for {}: {}", path.display(), service, e),
        }
    }
}

/// Complete lines appended since the last call
fn read_appended(path: &Path, state: &mut TailState) -> std::io::Result<Vec<String>> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        // Between rename and recreate during rotation
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let inode = metadata.ino();
    let size = metadata.len();
    if inode != state.inode || size < state.size {
        debug!("{} was rotated or truncated, reading from the start", path.display());
        state.position = 0;
        state.inode = inode;
    }
    state.size = size;

    if size <= state.position {
        return Ok(Vec::new());
    }

    let mut file = OpenOptions::new().read(true).open(path)?;
    file.seek(SeekFrom::Start(state.position))?;
    let mut buf = Vec::new();
    file.take(size - state.position).read_to_end(&mut buf)?;

    // A trailing partial line waits for the next poll
    let complete = match buf.iter().rposition(|b| *b == b'\n') {
        Some(idx) => idx + 1,
        None => return Ok(Vec::new()),
    };
    state.position += complete as u64;

    Ok(split_lines(&String::from_utf8_lossy(&buf[..complete])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_source_unavailable;
    use std::io::Write;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(5);

    fn command(cmd: &str) -> SourceConfig {
        SourceConfig::Command {
            command: cmd.to_string(),
            follow_command: None,
        }
    }

    #[tokio::test]
    async fn test_read_file_last_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "one\ntwo\r\nthree\nfour\n").unwrap();

        let source = LogSource::from_path("backend", path.to_str().unwrap());
        assert_eq!(
            source.read_lines(None).await.unwrap(),
            vec!["one", "two", "three", "four"]
        );
        assert_eq!(source.read_lines(Some(2)).await.unwrap(), vec!["three", "four"]);
        assert_eq!(source.read_lines(Some(10)).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let source = LogSource::from_path("backend", "/nonexistent/dir/app.log");
        let err = source.read_lines(None).await.unwrap_err();
        assert!(is_source_unavailable(&err));

        let err = source.follow().await.err().unwrap();
        assert!(is_source_unavailable(&err));
    }

    #[tokio::test]
    async fn test_empty_file_reads_no_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.log");
        fs::write(&path, "").unwrap();

        let source = LogSource::from_path("db", path.to_str().unwrap());
        assert!(source.read_lines(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_command_output() {
        let source = LogSource::new("backend", command(r"printf 'first\nsecond\n'"));
        assert_eq!(source.read_lines(None).await.unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_command_failures_are_unavailable() {
        let missing = LogSource::new("backend", command("definitely-not-a-real-binary-xyz"));
        assert!(is_source_unavailable(&missing.read_lines(None).await.unwrap_err()));

        let failing = LogSource::new("backend", command("false"));
        assert!(is_source_unavailable(&failing.read_lines(None).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_unbalanced_quotes_are_configuration_error() {
        let source = LogSource::new("backend", command("docker compose logs 'backend"));
        let err = source.read_lines(None).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_follow_file_yields_appended_lines_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.log");
        fs::write(&path, "old line\n").unwrap();

        let source = LogSource::from_path("backend", path.to_str().unwrap());
        let mut stream = source.follow().await.unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "ERROR: disk full").unwrap();
        file.flush().unwrap();

        let line = time::timeout(WAIT, stream.next_line()).await.unwrap();
        assert_eq!(line.as_deref(), Some("ERROR: disk full"));
    }

    #[test]
    fn test_read_appended_handles_truncation_and_partial_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rotating.log");
        fs::write(&path, "a long first line\n").unwrap();
        let mut state = TailState::at_end(&path).unwrap();

        fs::write(&path, "short\npart").unwrap();
        assert_eq!(read_appended(&path, &mut state).unwrap(), vec!["short"]);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "ial\n").unwrap();
        assert_eq!(read_appended(&path, &mut state).unwrap(), vec!["partial"]);
        assert!(read_appended(&path, &mut state).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_follow_command_ends_with_process() {
        let source = LogSource::new(
            "db",
            SourceConfig::Command {
                command: "true".to_string(),
                follow_command: Some(r"printf 'x\ny\n'".to_string()),
            },
        );
        let mut stream = source.follow().await.unwrap();

        assert_eq!(stream.next_line().await.as_deref(), Some("x"));
        assert_eq!(stream.next_line().await.as_deref(), Some("y"));
        assert_eq!(time::timeout(WAIT, stream.next_line()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_follow_command_survives_invalid_utf8() {
        let source = LogSource::new(
            "backend",
            SourceConfig::Command {
                command: "true".to_string(),
                follow_command: Some(r"printf 'first\n\377bad\r\nERROR: after bad byte\n'".to_string()),
            },
        );
        let mut stream = source.follow().await.unwrap();

        let mut received = Vec::new();
        while let Some(line) = time::timeout(WAIT, stream.next_line()).await.unwrap() {
            received.push(line);
        }

        assert_eq!(received, vec!["first", "\u{FFFD}bad", "ERROR: after bad byte"]);
    }

    #[test]
    fn test_blocking_reader_decodes_lossily_and_keeps_going() {
        let input: &[u8] = b"one\n\xffbroken\ntwo\r\nlast without newline";
        let (sender, mut receiver) = mpsc::channel(8);

        forward_lines_blocking(input, sender);

        let mut received = Vec::new();
        while let Ok(line) = receiver.try_recv() {
            received.push(line);
        }
        assert_eq!(
            received,
            vec!["one", "\u{FFFD}broken", "two", "last without newline"]
        );
    }

    #[tokio::test]
    async fn test_stream_from_lines() {
        let mut stream = LineStream::from_lines(vec!["a", "b"]);
        assert_eq!(stream.next_line().await.as_deref(), Some("a"));
        assert_eq!(stream.next_line().await.as_deref(), Some("b"));
        assert_eq!(stream.next_line().await, None);
    }

    #[test]
    fn test_describe_source() {
        assert_eq!(LogSource::from_path("x", "-").describe(), "stdin");
        assert_eq!(
            LogSource::from_path("x", "/var/log/a.log").describe(),
            "file /var/log/a.log"
        );
        assert_eq!(
            LogSource::new("x", command("docker compose logs x")).describe(),
            "command `docker compose logs x`"
        );
    }
}
