use anyhow::{anyhow, bail, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::repository::RepositoryDescriptor;
use crate::transfer::RetryPolicy;

/// Main configuration structure for repo-sync
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Base directory under which every repository is mirrored
    #[serde(default = "default_base_directory")]
    pub base_directory: String,

    /// Transfer tool invocation settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Retry behaviour for failed transfers
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Repositories to mirror, processed in order
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

/// Transfer tool configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransferConfig {
    /// Program to invoke
    #[serde(default = "default_program")]
    pub program: String,

    /// Options passed on every invocation
    #[serde(default = "default_transfer_options")]
    pub options: Vec<String>,

    /// Options added to recursive metadata syncs that may delete stale files
    #[serde(default = "default_delete_options")]
    pub delete_options: Vec<String>,
}

/// Retry configuration, delays in (fractional) seconds
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay: f64,

    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    /// Upper bound of the random delay added to every retry
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Upper bound of the random delay before the first attempt
    #[serde(default = "default_connection_delay")]
    pub connection_delay: f64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "full"
}

/// A repository entry, tagged by packaging flavour
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RepositoryConfig {
    /// Debian/Ubuntu style: dists/ metadata and a shared pool/
    Apt(AptRepositoryConfig),
    /// RPM style: one tree per version/repo/architecture
    Dnf(DnfRepositoryConfig),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AptRepositoryConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub suites: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub include_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DnfRepositoryConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub versions: Vec<String>,
    /// Repository names published for each version
    #[serde(default)]
    pub repos: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub architectures: Vec<String>,
    /// Path appended after the architecture, "/os" on Rocky, empty on EPEL
    #[serde(default = "default_path_suffix")]
    pub path_suffix: String,
    #[serde(default)]
    pub include_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl RepositoryConfig {
    pub fn name(&self) -> &str {
        match self {
            RepositoryConfig::Apt(repo) => &repo.name,
            RepositoryConfig::Dnf(repo) => &repo.name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepositoryConfig::Apt(_) => "apt",
            RepositoryConfig::Dnf(_) => "dnf",
        }
    }
}

// Default value functions
fn default_base_directory() -> String {
    "~/mirror".to_string()
}
fn default_program() -> String {
    "rsync".to_string()
}
fn default_transfer_options() -> Vec<String> {
    [
        "--archive",
        "--hard-links",
        "--copy-links",
        "--verbose",
        "--partial",
        "--append-verify",
        "--timeout=300",
        "--contimeout=60",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_delete_options() -> Vec<String> {
    vec!["--delete-after".to_string()]
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_jitter() -> f64 {
    2.0
}
fn default_connection_delay() -> f64 {
    1.0
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}
fn default_path_suffix() -> String {
    "/os".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// Default implementations
impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            options: default_transfer_options(),
            delete_options: default_delete_options(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            connection_delay: default_connection_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RetryConfig {
    /// Validate and convert into the policy used by the transfer executor
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        if self.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }

        let delays = [
            ("base_delay", self.base_delay),
            ("max_delay", self.max_delay),
            ("jitter", self.jitter),
            ("connection_delay", self.connection_delay),
        ];
        let mut durations = [Duration::ZERO; 4];
        for (slot, (field, value)) in durations.iter_mut().zip(delays) {
            *slot = Duration::try_from_secs_f64(value).map_err(|_| {
                anyhow!(
                    "retry.{} must be a non-negative number of seconds, got {}",
                    field,
                    value
                )
            })?;
        }
        let [base_delay, max_delay, jitter, connection_delay] = durations;

        if self.max_delay < self.base_delay {
            bail!(
                "retry.max_delay ({}) must not be smaller than retry.base_delay ({})",
                self.max_delay,
                self.base_delay
            );
        }

        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay,
            max_delay,
            jitter,
            connection_delay,
        })
    }
}

impl Config {
    /// Load configuration from the default location, writing a default file if none exists.
    ///
    /// The boolean is true when the default file was just created.
    pub fn load_or_create() -> Result<(Self, bool)> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            return Ok((Self::load(&config_path)?, false));
        }

        let mut config = Self::default();

        // Create config directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        config.save(&config_path)?;
        tracing::info!("Created default configuration at: {:?}", config_path);

        config.expand_paths()?;
        Ok((config, true))
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repo-sync").join("repo-sync.yaml"))
    }

    /// Expand `~` and environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.base_directory = shellexpand::full(&self.base_directory)
            .context("Failed to expand base_directory path")?
            .into_owned();

        Ok(())
    }

    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_directory)
    }

    /// The run-wide retry policy
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        self.retry.to_policy().context("Invalid retry settings")
    }

    /// Validate every repository entry into a descriptor.
    ///
    /// Any malformed entry fails the whole call so that nothing is transferred
    /// from a half-valid configuration.
    pub fn descriptors(&self) -> Result<Vec<RepositoryDescriptor>> {
        if self.base_directory.trim().is_empty() {
            bail!("base_directory must not be empty");
        }
        if self.transfer.program.trim().is_empty() {
            bail!("transfer.program must not be empty");
        }
        self.retry_policy()?;
        if !matches!(self.logging.format.as_str(), "compact" | "full") {
            bail!(
                "logging.format must be \"compact\" or \"full\", got {:?}",
                self.logging.format
            );
        }

        let mut seen = HashSet::new();
        let mut descriptors = Vec::with_capacity(self.repositories.len());

        for (index, repo) in self.repositories.iter().enumerate() {
            if !seen.insert(repo.name().to_string()) {
                bail!("Duplicate repository name: {}", repo.name());
            }

            let descriptor = RepositoryDescriptor::from_config(repo).with_context(|| {
                format!("Invalid repository #{} ({:?})", index + 1, repo.name())
            })?;
            descriptors.push(descriptor);
        }

        Ok(descriptors)
    }
}

impl Default for Config {
    fn default() -> Self {
        let debian_components = strings(&["main", "contrib", "non-free", "non-free-firmware"]);
        let apt_architectures = strings(&["amd64", "i386", "all"]);

        Self {
            base_directory: default_base_directory(),
            transfer: TransferConfig::default(),
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            repositories: vec![
                RepositoryConfig::Apt(AptRepositoryConfig {
                    name: "debian".to_string(),
                    url: "rsync://ftp.debian.org/debian".to_string(),
                    suites: strings(&["bookworm", "bookworm-updates", "bookworm-backports"]),
                    components: debian_components.clone(),
                    architectures: apt_architectures.clone(),
                    include_source: false,
                    retry: None,
                }),
                RepositoryConfig::Apt(AptRepositoryConfig {
                    name: "debian-security".to_string(),
                    url: "rsync://rsync.security.debian.org/debian-security".to_string(),
                    suites: strings(&["bookworm-security"]),
                    components: debian_components,
                    architectures: apt_architectures.clone(),
                    include_source: false,
                    retry: None,
                }),
                RepositoryConfig::Apt(AptRepositoryConfig {
                    name: "ubuntu".to_string(),
                    url: "rsync://archive.ubuntu.com/ubuntu".to_string(),
                    suites: strings(&["jammy", "jammy-updates", "jammy-security", "jammy-backports"]),
                    components: strings(&["main", "restricted", "universe", "multiverse"]),
                    architectures: apt_architectures,
                    include_source: false,
                    retry: None,
                }),
                RepositoryConfig::Dnf(DnfRepositoryConfig {
                    name: "rocky".to_string(),
                    url: "msync.rockylinux.org::rocky-linux".to_string(),
                    versions: strings(&["8", "9", "10"]),
                    repos: BTreeMap::from([
                        ("8".to_string(), strings(&["BaseOS", "AppStream", "extras", "PowerTools"])),
                        ("9".to_string(), strings(&["BaseOS", "AppStream", "extras", "CRB"])),
                        ("10".to_string(), strings(&["BaseOS", "AppStream", "extras", "CRB"])),
                    ]),
                    architectures: strings(&["x86_64"]),
                    path_suffix: "/os".to_string(),
                    include_source: false,
                    retry: None,
                }),
                RepositoryConfig::Dnf(DnfRepositoryConfig {
                    name: "epel".to_string(),
                    url: "archive.linux.duke.edu::fedora-epel".to_string(),
                    versions: strings(&["8", "9", "10"]),
                    repos: BTreeMap::from([
                        ("8".to_string(), strings(&["Everything", "Modular"])),
                        ("9".to_string(), strings(&["Everything"])),
                        ("10".to_string(), strings(&["Everything"])),
                    ]),
                    architectures: strings(&["x86_64"]),
                    path_suffix: String::new(),
                    include_source: false,
                    retry: None,
                }),
            ],
        }
    }
}
