//! Common test utilities and helpers for repo-sync tests
use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::path::PathBuf;
use std::process::{Command, Output};

/// Scratch configuration and mirror directories for one test
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Directory used as XDG_CONFIG_HOME for the binary
    pub fn xdg_config_home(&self) -> PathBuf {
        self.temp_dir.child("xdg").path().to_path_buf()
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.temp_dir.child("mirror").path().to_path_buf()
    }

    pub fn config_path(&self) -> PathBuf {
        self.temp_dir.child("repo-sync.yaml").path().to_path_buf()
    }

    pub fn write_config(&self, content: &str) -> PathBuf {
        self.temp_dir
            .child("repo-sync.yaml")
            .write_str(content)
            .expect("Failed to write test config");
        self.config_path()
    }

    /// One APT and one DNF repository against an unreachable host
    pub fn write_minimal_config(&self, program: &str) -> PathBuf {
        let content = format!(
            r#"
base_directory: "{base}"
transfer:
  program: "{program}"
  options: ["--archive", "--verbose"]
  delete_options: ["--delete-after"]
retry:
  max_attempts: 1
  connection_delay: 0.0
repositories:
  - kind: apt
    name: ubuntu
    url: rsync://mirror.invalid/ubuntu
    suites: [x]
    components: [main]
    architectures: [amd64, all]
  - kind: dnf
    name: rocky
    url: mirror.invalid::rocky
    versions: ["9"]
    repos:
      "9": [BaseOS]
    architectures: [x86_64]
"#,
            base = self.mirror_dir().display(),
            program = program,
        );
        self.write_config(&content)
    }

    /// The repo-sync binary with an isolated environment
    pub fn command(&self) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_repo-sync"));
        command
            .env("XDG_CONFIG_HOME", self.xdg_config_home())
            .env("HOME", self.temp_dir.path())
            .env_remove("RUST_LOG");
        command
    }

    /// Run with `--config` pointing at the test config
    pub fn run(&self, args: &[&str]) -> Output {
        self.command()
            .arg("--config")
            .arg(self.config_path())
            .args(args)
            .output()
            .expect("Failed to execute repo-sync")
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Assertion helper for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
