//! Artifact pull driven by an explicit file list

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::index::RequiredArtifactSet;
use crate::repository::{RepositoryDescriptor, TreeCoordinate, ARTIFACT_ROOT};
use crate::transfer::{RetryPolicy, TransferExecutor, TransferRequest};

/// Where artifacts are pulled from and to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRoot {
    pub source: String,
    pub destination: PathBuf,
    /// Leading segment to remove from each artifact path, e.g. `pool`
    pub strip_prefix: Option<String>,
}

impl ArtifactRoot {
    /// The shared `pool/` tree of a suite-axis repository
    pub fn pool(repo: &RepositoryDescriptor, base_dir: &std::path::Path) -> Self {
        Self {
            source: repo.source(ARTIFACT_ROOT),
            destination: repo.repo_dir(base_dir).join(ARTIFACT_ROOT),
            strip_prefix: Some(ARTIFACT_ROOT.to_string()),
        }
    }

    /// A single RPM tree root; its index paths are already relative to it
    pub fn tree(
        repo: &RepositoryDescriptor,
        base_dir: &std::path::Path,
        coordinate: &TreeCoordinate,
    ) -> Self {
        Self {
            source: repo.source(&coordinate.path),
            destination: repo.repo_dir(base_dir).join(&coordinate.path),
            strip_prefix: None,
        }
    }

    /// Sorted, deduplicated list entries relative to this root
    pub fn list_entries(&self, required: &RequiredArtifactSet) -> Vec<String> {
        let entries: BTreeSet<&str> = required
            .iter()
            .map(|path| match &self.strip_prefix {
                Some(prefix) => path.relative_to(prefix),
                None => path.as_str(),
            })
            .collect();
        entries.into_iter().map(str::to_string).collect()
    }
}

/// Fetches exactly the artifacts named by the synced indexes
#[derive(Clone)]
pub struct PoolSynchronizer {
    executor: TransferExecutor,
}

impl PoolSynchronizer {
    pub fn new(executor: TransferExecutor) -> Self {
        Self { executor }
    }

    /// Pull `required` below `root`.
    ///
    /// Returns the number of listed artifacts. An empty set is a no-op.
    pub async fn sync(
        &self,
        root: &ArtifactRoot,
        required: &RequiredArtifactSet,
        policy: &RetryPolicy,
    ) -> Result<usize> {
        if required.is_empty() {
            info!("No artifacts referenced for {}, skipping artifact transfer", root.source);
            return Ok(0);
        }

        let entries = root.list_entries(required);
        let list = write_list(&entries)?;
        debug!("Wrote {} entries to {}", entries.len(), list.path().display());

        info!("Syncing {} artifacts from {}", entries.len(), root.source);
        let request = TransferRequest::file_list(&root.source, &root.destination, list.path());
        self.executor.execute(&request, policy).await?;

        // The list file is removed when `list` drops, on success and on error alike
        Ok(entries.len())
    }
}

fn write_list(entries: &[String]) -> Result<NamedTempFile> {
    let mut list = tempfile::Builder::new()
        .prefix("repo-sync-")
        .suffix(".list")
        .tempfile()
        .context("Failed to create artifact list file")?;

    {
        let mut writer = BufWriter::new(list.as_file_mut());
        for entry in entries {
            writeln!(writer, "{}", entry).context("Failed to write artifact list")?;
        }
        writer.flush().context("Failed to write artifact list")?;
    }

    Ok(list)
}
