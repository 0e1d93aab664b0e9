//! Video analysis collaborator.
//!
//! The analysis itself runs as an external command. The worker only
//! substitutes paths into its arguments, streams its output to the log,
//! bounds its run time and collects the result JSON.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use vproc_models::VideoId;

use crate::error::{WorkerError, WorkerResult};

/// File the analysis command may write its result to, inside the output dir.
pub const RESULT_FILE_NAME: &str = "result.json";

/// Stderr lines kept for the error message of a failed run.
const STDERR_TAIL_LINES: usize = 20;

const DEFAULT_COMMAND: &str =
    "python /app/video-analysis/run.py --video-id {video_id} --input {input} --output {output}";

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub video_id: VideoId,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub result: Value,
    pub duration: Duration,
}

#[async_trait]
pub trait VideoAnalyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> WorkerResult<AnalysisOutput>;
}

/// Analysis command configuration.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Program followed by its arguments. `{video_id}`, `{input}` and
    /// `{output}` are substituted per request.
    pub command: Vec<String>,
    /// Hard limit on one run
    pub timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            command: split_command(DEFAULT_COMMAND),
            timeout: Duration::from_secs(3600),
        }
    }
}

impl AnalyzerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            command: std::env::var("ANALYSIS_COMMAND")
                .map(|s| split_command(&s))
                .unwrap_or_else(|_| split_command(DEFAULT_COMMAND)),
            timeout: Duration::from_secs(
                std::env::var("ANALYSIS_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
        }
    }
}

fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

/// Runs the analysis as a child process.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    config: AnalyzerConfig,
}

impl CommandAnalyzer {
    pub fn new(config: AnalyzerConfig) -> WorkerResult<Self> {
        if config.command.is_empty() {
            return Err(WorkerError::config_error("analysis command is empty"));
        }
        Ok(Self { config })
    }

    pub fn from_env() -> WorkerResult<Self> {
        Self::new(AnalyzerConfig::from_env())
    }

    fn build_args(&self, request: &AnalysisRequest) -> Vec<String> {
        let input = request.input_path.to_string_lossy();
        let output = request.output_dir.to_string_lossy();
        self.config
            .command
            .iter()
            .map(|arg| {
                arg.replace("{video_id}", request.video_id.as_str())
                    .replace("{input}", &input)
                    .replace("{output}", &output)
            })
            .collect()
    }

    async fn read_result(&self, request: &AnalysisRequest, stdout: &str) -> WorkerResult<Value> {
        let result_path = request.output_dir.join(RESULT_FILE_NAME);
        match tokio::fs::read(&result_path).await {
            Ok(bytes) => return Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "output": trimmed })))
    }
}

#[async_trait]
impl VideoAnalyzer for CommandAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> WorkerResult<AnalysisOutput> {
        let args = self.build_args(request);
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| WorkerError::config_error("analysis command is empty"))?;

        tokio::fs::create_dir_all(&request.output_dir).await?;

        info!(video_id = %request.video_id, command = %args.join(" "), "Starting analysis");
        let started = Instant::now();

        let mut child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_task = child.stdout.take().map(|out| tokio::spawn(collect_stdout(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(collect_stderr_tail(err)));

        let status = match tokio::time::timeout(self.config.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out analysis: {}", e);
                }
                return Err(WorkerError::AnalysisTimeout(self.config.timeout));
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        if !status.success() {
            if killed_by_sigkill(&status) {
                return Err(WorkerError::resource_exhausted(
                    "analysis process was killed (SIGKILL), likely out of memory",
                ));
            }
            return Err(WorkerError::analysis_failed(status.code(), stderr_tail.join("\n")));
        }

        let duration = started.elapsed();
        let result = self.read_result(request, &stdout).await?;
        info!(
            video_id = %request.video_id,
            duration_secs = duration.as_secs_f64(),
            "Analysis completed"
        );

        Ok(AnalysisOutput { result, duration })
    }
}

async fn collect_stdout<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut out = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "vproc_worker::analysis", "{}", line);
        out.push_str(&line);
        out.push('\n');
    }
    out
}

async fn collect_stderr_tail<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "vproc_worker::analysis", "{}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect()
}

#[cfg(unix)]
fn killed_by_sigkill(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &std::process::ExitStatus) -> bool {
    false
}
