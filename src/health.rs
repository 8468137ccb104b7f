//! Preflight checks for repo-sync
//!
//! Verifies the transfer program, the mirror directory and the configuration
//! before any repository is touched.

use crate::transfer::probe_tool;
use crate::Config;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Transfer program installation status
    pub transfer: CheckResult,
    /// Base directory status
    pub base_dir: CheckResult,
    /// Configuration validation status
    pub config: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            transfer: Self::check_transfer_program(&config.transfer.program).await,
            base_dir: Self::check_base_dir(&config.base_dir()),
            config: Self::check_config(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.transfer.passed && self.base_dir.passed && self.config.passed
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        [&self.transfer, &self.base_dir, &self.config]
            .into_iter()
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        [&self.transfer, &self.base_dir, &self.config]
            .into_iter()
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check that the transfer program runs
    pub async fn check_transfer_program(program: &str) -> CheckResult {
        match probe_tool(program).await {
            Ok(version) => CheckResult::ok_with_details(format!("{} installed", program), version),
            Err(e) => CheckResult::error_with_details(
                format!("{} not usable", program),
                format!("{:#}\nInstall {} or set transfer.program", e, program),
            ),
        }
    }

    /// Check the mirror directory is a writable directory, or can be created
    fn check_base_dir(path: &Path) -> CheckResult {
        let display = path.display().to_string();

        if !path.exists() {
            return CheckResult::warning_with_details(
                "Base directory does not exist yet",
                format!("It will be created on first sync: {}", display),
            );
        }

        if !path.is_dir() {
            return CheckResult::error_with_details("Base directory is not a directory", display);
        }

        match tempfile::tempfile_in(path) {
            Ok(_) => CheckResult::ok_with_details("Base directory writable", display),
            Err(e) => CheckResult::error_with_details(
                "Base directory not writable",
                format!("{}: {}", display, e),
            ),
        }
    }

    /// Check that every repository entry validates
    fn check_config(config: &Config) -> CheckResult {
        match config.descriptors() {
            Ok(descriptors) if descriptors.is_empty() => CheckResult::warning_with_details(
                "No repositories configured",
                "Add entries under `repositories` to mirror something",
            ),
            Ok(descriptors) => CheckResult::ok_with_details(
                "Configuration valid",
                format!("{} repositories", descriptors.len()),
            ),
            Err(e) => CheckResult::error_with_details("Configuration invalid", format!("{:#}", e)),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 3] {
        [
            ("Transfer Program", &self.transfer),
            ("Base Directory", &self.base_dir),
            ("Configuration", &self.config),
        ]
    }
}
