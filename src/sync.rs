//! Sync Engine - Orchestrates the two-phase synchronization of each repository
//!
//! For every repository the metadata subtree is pulled first with filter
//! rules, the freshly synced package indexes are read to work out which
//! artifacts are referenced, and then exactly those artifacts are pulled with
//! an explicit file list. Repositories are processed one after another; a
//! failed repository is reported in the summary and does not stop the run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::filter::FilterRuleBuilder;
use crate::index::{IndexCoordinate, PackageIndexExtractor, RequiredArtifactSet};
use crate::pool::{ArtifactRoot, PoolSynchronizer};
use crate::repository::{
    RepositoryDescriptor, SuiteTopology, Topology, VersionTopology, METADATA_ROOT,
};
use crate::transfer::{RetryPolicy, TransferExecutor, TransferRequest};

/// Where a repository is in its sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    MetadataPending,
    MetadataDone,
    Extracting,
    PoolPending,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Done | SyncPhase::Failed)
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::MetadataPending => "metadata-pending",
            SyncPhase::MetadataDone => "metadata-done",
            SyncPhase::Extracting => "extracting",
            SyncPhase::PoolPending => "pool-pending",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn serialize_secs<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Result of syncing one repository
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub name: String,
    pub kind: &'static str,
    /// Final phase, either `Done` or `Failed`
    pub phase: SyncPhase,
    pub artifacts_required: usize,
    pub phases_completed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
}

impl SyncOutcome {
    pub fn succeeded(&self) -> bool {
        self.phase == SyncPhase::Done
    }
}

/// Results from a complete sync run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_secs", serialize_with = "serialize_secs")]
    pub duration: Duration,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<SyncOutcome>,
}

impl RunSummary {
    fn compile(started_at: DateTime<Utc>, duration: Duration, outcomes: Vec<SyncOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        Self {
            started_at,
            duration,
            succeeded,
            failed: outcomes.len() - succeeded,
            outcomes,
        }
    }

    /// Whether every repository synced
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// A single metadata transfer of a repository
#[derive(Debug, Clone)]
pub struct MetadataStep {
    pub label: String,
    pub request: TransferRequest,
    /// A failed required step fails the repository; others only warn
    pub required: bool,
}

/// Phase bookkeeping for one repository
struct PhaseTracker<'a> {
    name: &'a str,
    phase: SyncPhase,
    phases_completed: usize,
}

impl<'a> PhaseTracker<'a> {
    fn new(name: &'a str) -> Self {
        Self {
            name,
            phase: SyncPhase::MetadataPending,
            phases_completed: 0,
        }
    }

    fn advance(&mut self, next: SyncPhase) {
        debug!("{}: {} -> {}", self.name, self.phase, next);
        self.phase = next;
    }

    fn complete_phase(&mut self) {
        self.phases_completed += 1;
    }
}

/// Runs the metadata, extraction and artifact phases for each repository
pub struct RepositorySyncOrchestrator {
    base_dir: PathBuf,
    executor: TransferExecutor,
    extractor: PackageIndexExtractor,
    pool: PoolSynchronizer,
    default_policy: RetryPolicy,
}

impl RepositorySyncOrchestrator {
    pub fn new(base_dir: impl Into<PathBuf>, executor: TransferExecutor, default_policy: RetryPolicy) -> Self {
        Self {
            base_dir: base_dir.into(),
            pool: PoolSynchronizer::new(executor.clone()),
            executor,
            extractor: PackageIndexExtractor::new(),
            default_policy,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn policy_for<'a>(&'a self, repo: &'a RepositoryDescriptor) -> &'a RetryPolicy {
        repo.retry.as_ref().unwrap_or(&self.default_policy)
    }

    /// Sync every repository in order and summarise the results
    pub async fn run(&self, repositories: &[RepositoryDescriptor]) -> RunSummary {
        let started_at = Utc::now();
        let start_time = Instant::now();

        info!("Starting repository synchronization");
        info!("Local base directory: {}", self.base_dir.display());

        let mut outcomes = Vec::with_capacity(repositories.len());
        for repo in repositories {
            outcomes.push(self.sync_repository(repo).await);
        }

        let summary = RunSummary::compile(started_at, start_time.elapsed(), outcomes);

        info!(
            "Synchronization complete in {:.2}s: {} succeeded, {} failed",
            summary.duration.as_secs_f64(),
            summary.succeeded,
            summary.failed
        );

        summary
    }

    /// Sync one repository. Failures are captured in the outcome.
    pub async fn sync_repository(&self, repo: &RepositoryDescriptor) -> SyncOutcome {
        let start_time = Instant::now();
        let mut tracker = PhaseTracker::new(&repo.name);
        let mut artifacts_required = 0;

        info!("Starting sync for repository: {}", repo.name);
        info!("  URL: {}", repo.url);

        let result = self
            .run_phases(repo, &mut tracker, &mut artifacts_required)
            .await;

        let error = match result {
            Ok(()) => {
                info!("Successfully completed sync for {}", repo.name);
                None
            }
            Err(e) => {
                if tracker.phase != SyncPhase::Failed {
                    tracker.advance(SyncPhase::Failed);
                }
                error!("Failed to sync {}: {:#}", repo.name, e);
                Some(format!("{:#}", e))
            }
        };

        debug_assert!(tracker.phase.is_terminal());

        SyncOutcome {
            name: repo.name.clone(),
            kind: repo.kind(),
            phase: tracker.phase,
            artifacts_required,
            phases_completed: tracker.phases_completed,
            error,
            duration: start_time.elapsed(),
        }
    }

    async fn run_phases(
        &self,
        repo: &RepositoryDescriptor,
        tracker: &mut PhaseTracker<'_>,
        artifacts_required: &mut usize,
    ) -> Result<()> {
        let policy = self.policy_for(repo);

        for step in self.metadata_steps(repo) {
            info!("  Syncing {}", step.label);
            match self.executor.execute(&step.request, policy).await {
                Ok(()) => tracker.complete_phase(),
                Err(e) if step.required => {
                    tracker.advance(SyncPhase::Failed);
                    return Err(e.context(format!("Metadata sync failed for {}", step.label)));
                }
                Err(e) => warn!("  Optional metadata {} not synced: {:#}", step.label, e),
            }
        }
        tracker.advance(SyncPhase::MetadataDone);

        tracker.advance(SyncPhase::Extracting);
        let targets = self.required_artifacts(repo);
        *artifacts_required = targets.iter().map(|(_, set)| set.len()).sum();

        if *artifacts_required == 0 {
            info!("  No artifacts referenced by {} indexes", repo.name);
            tracker.advance(SyncPhase::Done);
            return Ok(());
        }

        tracker.advance(SyncPhase::PoolPending);
        for (root, required) in &targets {
            if let Err(e) = self.pool.sync(root, required, policy).await {
                tracker.advance(SyncPhase::Failed);
                return Err(e.context(format!("Artifact sync failed for {}", root.source)));
            }
        }
        tracker.complete_phase();
        tracker.advance(SyncPhase::Done);

        Ok(())
    }

    /// Every metadata transfer for a repository, in execution order
    pub fn metadata_steps(&self, repo: &RepositoryDescriptor) -> Vec<MetadataStep> {
        match &repo.topology {
            Topology::Suites(topology) => self.suite_steps(repo, topology),
            Topology::Versions(topology) => self.version_steps(repo, topology),
        }
    }

    fn suite_steps(&self, repo: &RepositoryDescriptor, topology: &SuiteTopology) -> Vec<MetadataStep> {
        let source = repo.source(METADATA_ROOT);
        let dest = repo.repo_dir(&self.base_dir).join(METADATA_ROOT);
        let step = |label: String, rules, required| MetadataStep {
            label,
            request: TransferRequest::filtered(&source, &dest, rules, true),
            required,
        };

        let mut steps = Vec::new();
        for suite in &topology.suites {
            steps.push(step(
                format!("Release files for {}", suite),
                FilterRuleBuilder::metadata_rules(suite),
                true,
            ));

            for component in &topology.components {
                for arch in topology.binary_architectures() {
                    steps.push(step(
                        format!("{}/{}/binary-{}", suite, component, arch),
                        FilterRuleBuilder::component_arch_rules(suite, component, arch),
                        true,
                    ));
                }

                if topology.include_source {
                    steps.push(step(
                        format!("{}/{}/source", suite, component),
                        FilterRuleBuilder::component_source_rules(suite, component),
                        true,
                    ));
                }

                steps.push(step(
                    format!("{}/{} metadata", suite, component),
                    FilterRuleBuilder::metadata_extras_rules(suite, component),
                    false,
                ));
            }
        }
        steps
    }

    fn version_steps(&self, repo: &RepositoryDescriptor, topology: &VersionTopology) -> Vec<MetadataStep> {
        let repo_dir = repo.repo_dir(&self.base_dir);
        let mut steps = Vec::new();

        for coordinate in topology.coordinates() {
            let source = repo.source(&coordinate.path);
            let dest = repo_dir.join(&coordinate.path);

            steps.push(MetadataStep {
                label: format!("repodata for {}", coordinate.path),
                request: TransferRequest::filtered(&source, &dest, FilterRuleBuilder::repodata_rules(), true),
                required: true,
            });
            steps.push(MetadataStep {
                label: format!("release files for {}", coordinate.path),
                request: TransferRequest::filtered(&source, &dest, FilterRuleBuilder::release_files_rules(), false),
                required: false,
            });
        }
        steps
    }

    /// Artifact roots paired with the artifacts their indexes reference
    pub fn required_artifacts(&self, repo: &RepositoryDescriptor) -> Vec<(ArtifactRoot, RequiredArtifactSet)> {
        let repo_dir = repo.repo_dir(&self.base_dir);

        match &repo.topology {
            Topology::Suites(topology) => {
                let mut coordinates = Vec::new();
                for suite in &topology.suites {
                    for component in &topology.components {
                        for arch in topology.binary_architectures() {
                            coordinates.push(IndexCoordinate::Binary {
                                suite: suite.clone(),
                                component: component.clone(),
                                arch: arch.to_string(),
                            });
                        }
                        if topology.include_source {
                            coordinates.push(IndexCoordinate::Source {
                                suite: suite.clone(),
                                component: component.clone(),
                            });
                        }
                    }
                }

                let required = self.extractor.extract_all(&repo_dir, &coordinates);
                vec![(ArtifactRoot::pool(repo, &self.base_dir), required)]
            }
            Topology::Versions(topology) => topology
                .coordinates()
                .into_iter()
                .map(|coordinate| {
                    let index = IndexCoordinate::Tree {
                        path: coordinate.path.clone(),
                    };
                    let required = self.extractor.extract_all(&repo_dir, [&index]);
                    (ArtifactRoot::tree(repo, &self.base_dir, &coordinate), required)
                })
                .collect(),
        }
    }

    /// Command lines of every metadata transfer, without running them
    pub fn plan(&self, repo: &RepositoryDescriptor) -> Vec<String> {
        self.metadata_steps(repo)
            .iter()
            .map(|step| self.executor.command_line(&step.request))
            .collect()
    }
}
