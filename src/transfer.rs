//! Transfer execution - one invocation of the external bulk transfer tool
//!
//! A [`TransferRequest`] describes what to move: a source address, a
//! destination directory and either an ordered filter rule set or an explicit
//! file list. The [`TransferExecutor`] turns a request into arguments, runs
//! the tool through the [`TransferTool`] seam, classifies the outcome and
//! retries with jittered exponential backoff according to a [`RetryPolicy`].

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::filter::{self, FilterRule};

/// What a transfer should select from the source.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Recursive transfer restricted by ordered include/exclude rules.
    Rules {
        rules: Vec<FilterRule>,
        /// Remove destination files that no longer exist upstream
        delete_extraneous: bool,
    },
    /// Exactly the relative paths listed in a file. Never deletes.
    FileList(PathBuf),
}

/// A single transfer, built fresh for each phase and discarded afterwards
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: String,
    pub destination: PathBuf,
    pub selection: Selection,
}

impl TransferRequest {
    pub fn filtered(
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        rules: Vec<FilterRule>,
        delete_extraneous: bool,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            selection: Selection::Rules {
                rules,
                delete_extraneous,
            },
        }
    }

    pub fn file_list(
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        list: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            selection: Selection::FileList(list.into()),
        }
    }

    /// Whether this request may remove files from the destination.
    pub fn deletes(&self) -> bool {
        matches!(
            self.selection,
            Selection::Rules {
                delete_extraneous: true,
                ..
            }
        )
    }
}

/// Retry and pacing settings for transfers
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to each retry
    pub jitter: Duration,
    /// Upper bound of the random delay before the first attempt
    pub connection_delay: Duration,
}

impl RetryPolicy {
    /// One attempt, no pre-delay and no backoff.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            connection_delay: Duration::ZERO,
        }
    }

    /// Deterministic part of the delay before `attempt` (zero-based, > 0).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_secs(2),
            connection_delay: Duration::from_secs(1),
        }
    }
}

/// Captured result of one tool invocation
#[derive(Debug, Clone, Default)]
pub struct TransferOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl TransferOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Classification of a single attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Upstream refused the connection because it is at its client limit
    ConnectionLimited,
    Failed { exit_code: Option<i32> },
    /// The tool is not installed; retrying cannot help
    ToolMissing,
}

fn connection_limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)max\s+connections").expect("connection limit pattern is valid")
    })
}

/// Classify the result of a tool invocation
pub fn classify(result: &std::io::Result<TransferOutput>) -> AttemptOutcome {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AttemptOutcome::ToolMissing,
        Err(_) => AttemptOutcome::Failed { exit_code: None },
        Ok(output) if output.success() => AttemptOutcome::Succeeded,
        Ok(output) if connection_limit_pattern().is_match(&output.stderr) => {
            AttemptOutcome::ConnectionLimited
        }
        Ok(output) => AttemptOutcome::Failed {
            exit_code: output.exit_code,
        },
    }
}

/// The external transfer program
#[async_trait]
pub trait TransferTool: Send + Sync {
    /// Program name, used for logging and diagnostics
    fn program(&self) -> &str;

    /// Run the program with `args` and wait for it to exit
    async fn invoke(&self, args: &[String]) -> std::io::Result<TransferOutput>;
}

/// Runs rsync (or a compatible program) as a child process
#[derive(Debug, Clone)]
pub struct RsyncTool {
    program: String,
}

impl RsyncTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl TransferTool for RsyncTool {
    fn program(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, args: &[String]) -> std::io::Result<TransferOutput> {
        let output = AsyncCommand::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(TransferOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Suspension point used between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

fn uniform(bound: Duration) -> Duration {
    if bound.is_zero() {
        return Duration::ZERO;
    }
    let secs = rand::thread_rng().gen_range(0.0..=bound.as_secs_f64());
    Duration::try_from_secs_f64(secs).map_or(bound, |delay| delay.min(bound))
}

/// Argument set shared by every invocation
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub base: Vec<String>,
    pub delete: Vec<String>,
}

impl From<&TransferConfig> for TransferOptions {
    fn from(config: &TransferConfig) -> Self {
        Self {
            base: config.options.clone(),
            delete: config.delete_options.clone(),
        }
    }
}

/// Build the full argument list for a request.
///
/// Deletion options are only ever emitted for rule-based requests that ask
/// for them; a file list is a strict subset of the upstream tree and must
/// never drive deletion.
pub fn build_args(options: &TransferOptions, request: &TransferRequest) -> Vec<String> {
    let mut args = options.base.clone();

    match &request.selection {
        Selection::Rules {
            rules,
            delete_extraneous,
        } => {
            if *delete_extraneous {
                args.extend(options.delete.iter().cloned());
            }
            args.extend(filter::to_args(rules));
        }
        Selection::FileList(list) => {
            args.push(format!("--files-from={}", list.display()));
            // --archive does not imply --recursive together with --files-from
            args.push("--recursive".to_string());
            args.push("--relative".to_string());
        }
    }

    args.push(request.source.clone());
    args.push(format!("{}/", request.destination.display()));
    args
}

/// Runs transfer requests with retry and backoff
#[derive(Clone)]
pub struct TransferExecutor {
    tool: Arc<dyn TransferTool>,
    sleeper: Arc<dyn Sleeper>,
    options: TransferOptions,
}

impl TransferExecutor {
    pub fn new(tool: Arc<dyn TransferTool>, options: TransferOptions) -> Self {
        Self {
            tool,
            sleeper: Arc::new(TokioSleeper),
            options,
        }
    }

    /// Replace the sleeper, e.g. with a recording fake
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    /// Render the command line for a request without running it
    pub fn command_line(&self, request: &TransferRequest) -> String {
        let mut parts = vec![self.tool.program().to_string()];
        parts.extend(build_args(&self.options, request));
        parts.join(" ")
    }

    /// Execute a request, retrying transient failures.
    ///
    /// Returns once the transfer succeeded or the policy is exhausted. The
    /// destination directory is created first; partial transfers are left as
    /// the tool left them.
    pub async fn execute(&self, request: &TransferRequest, policy: &RetryPolicy) -> Result<()> {
        tokio::fs::create_dir_all(&request.destination)
            .await
            .with_context(|| {
                format!(
                    "Failed to create destination directory: {}",
                    request.destination.display()
                )
            })?;

        let args = build_args(&self.options, request);
        let command = format!("{} {}", self.tool.program(), args.join(" "));
        let max_attempts = policy.max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = policy.backoff(attempt).saturating_add(uniform(policy.jitter));
                info!(
                    "Retrying in {:.1} seconds (attempt {}/{})",
                    delay.as_secs_f64(),
                    attempt + 1,
                    max_attempts
                );
                self.sleeper.sleep(delay).await;
            } else if !policy.connection_delay.is_zero() {
                // Spread out connections from clients started at the same time
                self.sleeper.sleep(uniform(policy.connection_delay)).await;
            }

            debug!("Executing: {}", command);

            let result = self.tool.invoke(&args).await;
            let outcome = classify(&result);

            match outcome {
                AttemptOutcome::Succeeded => {
                    if let Ok(output) = &result {
                        if !output.stdout.is_empty() {
                            debug!("{}", output.stdout.trim_end());
                        }
                    }
                    return Ok(());
                }
                AttemptOutcome::ToolMissing => {
                    error!(
                        "{} command not found. Please install {}.",
                        self.tool.program(),
                        self.tool.program()
                    );
                    bail!("Transfer program not found: {}", self.tool.program());
                }
                AttemptOutcome::ConnectionLimited | AttemptOutcome::Failed { .. } => {
                    log_failure(&command, &result);
                    if outcome == AttemptOutcome::ConnectionLimited {
                        warn!("Connection limit reached, will retry with delay");
                    }
                    last_failure = Some(describe(&outcome, &result));
                }
            }
        }

        Err(anyhow!(
            "Transfer from {} failed after {} attempt(s): {}",
            request.source,
            max_attempts,
            last_failure.unwrap_or_else(|| "unknown error".to_string())
        ))
    }
}

fn log_failure(command: &str, result: &std::io::Result<TransferOutput>) {
    match result {
        Ok(output) => {
            match output.exit_code {
                Some(code) => error!("Transfer failed with exit code {}", code),
                None => error!("Transfer terminated by signal"),
            }
            error!("Command: {}", command);
            if !output.stderr.is_empty() {
                error!("Error output: {}", output.stderr.trim_end());
            }
            if !output.stdout.is_empty() {
                debug!("Standard output: {}", output.stdout.trim_end());
            }
        }
        Err(e) => {
            error!("Failed to run transfer: {}", e);
            error!("Command: {}", command);
        }
    }
}

fn describe(outcome: &AttemptOutcome, result: &std::io::Result<TransferOutput>) -> String {
    match (outcome, result) {
        (AttemptOutcome::ConnectionLimited, _) => "upstream connection limit reached".to_string(),
        (_, Err(e)) => e.to_string(),
        (_, Ok(output)) => {
            let stderr = output.stderr.trim();
            match (output.exit_code, stderr.lines().last()) {
                (Some(code), Some(line)) => format!("exit code {}: {}", code, line),
                (Some(code), None) => format!("exit code {}", code),
                (None, _) => "terminated by signal".to_string(),
            }
        }
    }
}

/// Whether `program` can be executed, with its version banner
pub async fn probe_tool(program: &str) -> Result<String> {
    let output = AsyncCommand::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run {} --version", program))?;

    if !output.status.success() {
        bail!("{} --version exited with {}", program, output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::filter::FilterRuleBuilder;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    fn executor(tool: Arc<ScriptedTool>, sleeper: Arc<RecordingSleeper>) -> TransferExecutor {
        TransferExecutor::new(tool, options()).with_sleeper(sleeper)
    }

    fn retry_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs_f64(2.0),
            max_delay: Duration::from_secs_f64(30.0),
            jitter: Duration::from_secs(2),
            connection_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_build_args_with_rules_and_delete() {
        let request = TransferRequest::filtered(
            "rsync://mirror/debian/dists/",
            "/srv/debian/dists",
            FilterRuleBuilder::metadata_rules("bookworm"),
            true,
        );

        let args = build_args(&options(), &request);
        assert_eq!(
            args,
            vec![
                "--archive",
                "--verbose",
                "--delete-after",
                "--include=/bookworm/",
                "--include=/bookworm/Release",
                "--include=/bookworm/Release.gpg",
                "--include=/bookworm/InRelease",
                "--exclude=*",
                "rsync://mirror/debian/dists/",
                "/srv/debian/dists/",
            ]
        );
    }

    #[test]
    fn test_build_args_without_delete() {
        let request = TransferRequest::filtered(
            "src/",
            "/dst",
            FilterRuleBuilder::release_files_rules(),
            false,
        );
        assert!(!request.deletes());
        let args = build_args(&options(), &request);
        assert!(!args.iter().any(|a| a.starts_with("--delete")));
    }

    #[test]
    fn test_file_list_never_deletes() {
        let request = TransferRequest::file_list("rsync://mirror/debian/pool/", "/srv/pool", "/tmp/list.txt");
        assert!(!request.deletes());

        let args = build_args(&options(), &request);
        assert!(!args.iter().any(|a| a.starts_with("--delete")));
        assert_eq!(
            &args[2..],
            &[
                "--files-from=/tmp/list.txt",
                "--recursive",
                "--relative",
                "rsync://mirror/debian/pool/",
                "/srv/pool/",
            ]
        );
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&ok()), AttemptOutcome::Succeeded);
        assert_eq!(classify(&connection_limit()), AttemptOutcome::ConnectionLimited);
        assert_eq!(classify(&not_found()), AttemptOutcome::ToolMissing);
        assert_matches!(
            classify(&failure(23, "some files vanished")),
            AttemptOutcome::Failed { exit_code: Some(23) }
        );
        assert_matches!(
            classify(&Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))),
            AttemptOutcome::Failed { exit_code: None }
        );
        assert_eq!(
            classify(&failure(5, "@ERROR: MAX CONNECTIONS (2) reached")),
            AttemptOutcome::ConnectionLimited
        );
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = retry_policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_after_connection_limits_succeeds() {
        let temp = TempDir::new().unwrap();
        let tool = Arc::new(ScriptedTool::scripted(vec![connection_limit(), connection_limit(), ok()]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(tool.clone(), sleeper.clone());

        let request = TransferRequest::filtered("src/", temp.path().join("dst"), vec![], false);
        executor.execute(&request, &retry_policy()).await.expect("third attempt succeeds");

        assert_eq!(tool.calls().len(), 3);
        assert!(temp.path().join("dst").is_dir());

        let delays = sleeper.delays();
        assert_eq!(delays.len(), 3);
        assert!(delays[0] <= Duration::from_secs(1));
        for (k, delay) in delays[1..].iter().enumerate() {
            let base = 2.0 * 2f64.powi(k as i32 + 1);
            let secs = delay.as_secs_f64();
            assert!(secs >= base && secs <= base + 2.0, "delay {} outside [{}, {}]", secs, base, base + 2.0);
        }
    }

    #[tokio::test]
    async fn test_final_attempt_failure_is_terminal() {
        let temp = TempDir::new().unwrap();
        let tool = Arc::new(ScriptedTool::scripted(vec![
            failure(10, "error in socket IO"),
            failure(10, "error in socket IO"),
            failure(12, "error in rsync protocol data stream"),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(tool.clone(), sleeper);

        let request = TransferRequest::filtered("src/", temp.path(), vec![], false);
        let err = executor.execute(&request, &retry_policy()).await.unwrap_err();

        assert_eq!(tool.calls().len(), 3);
        assert!(err.to_string().contains("exit code 12"));
    }

    #[tokio::test]
    async fn test_connection_limit_on_every_attempt_fails() {
        let temp = TempDir::new().unwrap();
        let tool = Arc::new(ScriptedTool::scripted(vec![
            connection_limit(),
            connection_limit(),
            connection_limit(),
            ok(),
        ]));
        let executor = executor(tool.clone(), Arc::new(RecordingSleeper::default()));

        let request = TransferRequest::filtered("src/", temp.path(), vec![], false);
        let err = executor.execute(&request, &retry_policy()).await.unwrap_err();

        assert_eq!(tool.calls().len(), 3);
        assert!(err.to_string().contains("connection limit"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let tool = Arc::new(ScriptedTool::scripted(vec![not_found(), ok()]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(tool.clone(), sleeper.clone());

        let request = TransferRequest::filtered("src/", temp.path(), vec![], false);
        let err = executor.execute(&request, &retry_policy()).await.unwrap_err();

        assert_eq!(tool.calls().len(), 1);
        assert_eq!(sleeper.delays().len(), 1);
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_huge_delays_saturate() {
        let temp = TempDir::new().unwrap();
        let tool = Arc::new(ScriptedTool::scripted(vec![connection_limit(), ok()]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(tool.clone(), sleeper.clone());

        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            jitter: Duration::MAX,
            connection_delay: Duration::MAX,
        };
        let request = TransferRequest::filtered("src/", temp.path(), vec![], false);
        executor.execute(&request, &policy).await.expect("second attempt succeeds");

        let delays = sleeper.delays();
        assert_eq!(delays.len(), 2);
        assert_eq!(delays[1], Duration::MAX);
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_sleeps() {
        let temp = TempDir::new().unwrap();
        let tool = Arc::new(ScriptedTool::scripted(vec![failure(23, "partial transfer"), ok()]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(tool.clone(), sleeper.clone());

        let request = TransferRequest::filtered("src/", temp.path(), vec![], false);
        assert!(executor
            .execute(&request, &RetryPolicy::single_attempt())
            .await
            .is_err());

        assert_eq!(tool.calls().len(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn test_command_line_rendering() {
        let tool = Arc::new(ScriptedTool::succeeding());
        let executor = executor(tool, Arc::new(RecordingSleeper::default()));
        let request = TransferRequest::filtered(
            "host::rocky/9/BaseOS/x86_64/os/",
            "/srv/rocky/9/BaseOS/x86_64/os",
            FilterRuleBuilder::repodata_rules(),
            true,
        );

        assert_eq!(
            executor.command_line(&request),
            "rsync --archive --verbose --delete-after --include=/repodata/ --include=/repodata/** --exclude=* host::rocky/9/BaseOS/x86_64/os/ /srv/rocky/9/BaseOS/x86_64/os/"
        );
    }
}
