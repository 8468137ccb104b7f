//! Validated repository descriptors and the coordinates they expand into

use anyhow::{bail, Context, Result};
use path_clean::PathClean;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{AptRepositoryConfig, DnfRepositoryConfig, RepositoryConfig};
use crate::transfer::RetryPolicy;

/// Architecture value for packages that are folded into every per-architecture index.
pub const NO_ARCH_MARKER: &str = "all";

/// Metadata subtree of a suite-axis repository.
pub const METADATA_ROOT: &str = "dists";

/// Artifact subtree of a suite-axis repository.
pub const ARTIFACT_ROOT: &str = "pool";

/// A repository to mirror, read-only for the duration of a run
#[derive(Debug, Clone)]
pub struct RepositoryDescriptor {
    pub name: String,
    pub url: String,
    pub topology: Topology,
    /// Overrides the run-wide retry policy when set
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone)]
pub enum Topology {
    /// suites × components × architectures (APT)
    Suites(SuiteTopology),
    /// versions × per-version repos × architectures (DNF)
    Versions(VersionTopology),
}

#[derive(Debug, Clone)]
pub struct SuiteTopology {
    pub suites: Vec<String>,
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    pub include_source: bool,
}

#[derive(Debug, Clone)]
pub struct VersionTopology {
    pub versions: Vec<String>,
    pub repos: BTreeMap<String, Vec<String>>,
    pub architectures: Vec<String>,
    pub path_suffix: String,
    pub include_source: bool,
}

/// One self-contained RPM tree (`repodata/` plus `Packages/`) within a version-axis repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeCoordinate {
    pub version: String,
    pub repo: String,
    /// `None` for the source tree
    pub arch: Option<String>,
    /// Path of the tree root relative to the repository URL and directory
    pub path: String,
}

impl SuiteTopology {
    /// Architectures that have their own `binary-<arch>` subtree.
    pub fn binary_architectures(&self) -> impl Iterator<Item = &str> {
        self.architectures
            .iter()
            .map(String::as_str)
            .filter(|arch| *arch != NO_ARCH_MARKER)
    }
}

impl VersionTopology {
    /// Every tree root in version, repo, architecture order.
    pub fn coordinates(&self) -> Vec<TreeCoordinate> {
        let mut coordinates = Vec::new();

        for version in &self.versions {
            let repos = self.repos.get(version).map(Vec::as_slice).unwrap_or_default();
            for repo in repos {
                for arch in &self.architectures {
                    let mut path = PathBuf::from(version).join(repo).join(arch);
                    let suffix = self.path_suffix.trim_matches('/');
                    if !suffix.is_empty() {
                        path.push(suffix);
                    }

                    coordinates.push(TreeCoordinate {
                        version: version.clone(),
                        repo: repo.clone(),
                        arch: Some(arch.clone()),
                        path: normalize(&path),
                    });
                }

                if self.include_source {
                    let path = PathBuf::from(version).join(repo).join("source").join("tree");
                    coordinates.push(TreeCoordinate {
                        version: version.clone(),
                        repo: repo.clone(),
                        arch: None,
                        path: normalize(&path),
                    });
                }
            }
        }

        coordinates
    }
}

fn normalize(path: &Path) -> String {
    path.clean().to_string_lossy().into_owned()
}

fn require_axis(field: &str, values: &[String]) -> Result<()> {
    if values.is_empty() {
        bail!("`{}` must list at least one entry", field);
    }
    if let Some(bad) = values
        .iter()
        .find(|v| v.trim().is_empty() || v.contains('/') || v.as_str() == "..")
    {
        bail!("`{}` contains an invalid entry: {:?}", field, bad);
    }
    Ok(())
}

impl RepositoryDescriptor {
    /// Validate a configuration entry into a descriptor
    pub fn from_config(config: &RepositoryConfig) -> Result<Self> {
        match config {
            RepositoryConfig::Apt(apt) => Self::from_apt(apt),
            RepositoryConfig::Dnf(dnf) => Self::from_dnf(dnf),
        }
    }

    fn from_apt(apt: &AptRepositoryConfig) -> Result<Self> {
        validate_identity(&apt.name, &apt.url)?;
        require_axis("suites", &apt.suites)?;
        require_axis("components", &apt.components)?;
        require_axis("architectures", &apt.architectures)?;

        let retry = apt
            .retry
            .as_ref()
            .map(|r| r.to_policy())
            .transpose()
            .context("Invalid retry override")?;

        Ok(Self {
            name: apt.name.clone(),
            url: apt.url.trim_end_matches('/').to_string(),
            topology: Topology::Suites(SuiteTopology {
                suites: apt.suites.clone(),
                components: apt.components.clone(),
                architectures: apt.architectures.clone(),
                include_source: apt.include_source,
            }),
            retry,
        })
    }

    fn from_dnf(dnf: &DnfRepositoryConfig) -> Result<Self> {
        validate_identity(&dnf.name, &dnf.url)?;
        require_axis("versions", &dnf.versions)?;
        require_axis("architectures", &dnf.architectures)?;

        for version in &dnf.versions {
            let repos = dnf
                .repos
                .get(version)
                .with_context(|| format!("`repos` has no entry for version {:?}", version))?;
            require_axis(&format!("repos.{}", version), repos)?;
        }

        if dnf.path_suffix.split('/').any(|segment| segment == "..") {
            bail!("`path_suffix` must not leave the architecture directory");
        }

        let retry = dnf
            .retry
            .as_ref()
            .map(|r| r.to_policy())
            .transpose()
            .context("Invalid retry override")?;

        Ok(Self {
            name: dnf.name.clone(),
            url: dnf.url.trim_end_matches('/').to_string(),
            topology: Topology::Versions(VersionTopology {
                versions: dnf.versions.clone(),
                repos: dnf.repos.clone(),
                architectures: dnf.architectures.clone(),
                path_suffix: dnf.path_suffix.clone(),
                include_source: dnf.include_source,
            }),
            retry,
        })
    }

    /// Local directory holding this repository's mirror
    pub fn repo_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(&self.name)
    }

    /// Remote address of a subtree, always with a trailing separator
    pub fn source(&self, relative: &str) -> String {
        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            format!("{}/", self.url)
        } else {
            format!("{}/{}/", self.url, relative)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.topology {
            Topology::Suites(_) => "apt",
            Topology::Versions(_) => "dnf",
        }
    }
}

fn validate_identity(name: &str, url: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("`name` must not be empty");
    }
    if name.contains('/') || name == "." || name == ".." {
        bail!("`name` must be a single directory name, got {:?}", name);
    }
    if url.trim().is_empty() {
        bail!("`url` must not be empty");
    }
    Ok(())
}
