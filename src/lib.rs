//! repo-sync - Selective package repository mirroring
//!
//! repo-sync keeps local mirrors of Debian/Ubuntu and RPM repositories up to
//! date by driving rsync with repository-aware filter rules instead of copying
//! the whole upstream tree.
//!
//! ## Core Features
//!
//! - **Two-phase sync**: release metadata first, then only the packages the
//!   synced indexes reference
//! - **Topology aware**: suite/component/architecture (APT) and
//!   version/repo/architecture (DNF) layouts
//! - **Resilient transfers**: jittered exponential backoff for busy upstreams
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`repository`]: Validated repository descriptors
//! - [`filter`]: Include/exclude rule sets for metadata transfers
//! - [`transfer`]: Transfer tool invocation and retry
//! - [`index`]: Package index decompression and parsing
//! - [`pool`]: File-list driven artifact transfers
//! - [`sync`]: Per-repository orchestration and run summary
//! - [`health`]: Preflight diagnostics

pub mod config;
pub mod filter;
pub mod health;
pub mod index;
pub mod pool;
pub mod repository;
pub mod sync;
pub mod transfer;

pub use config::Config;
pub use filter::{FilterRule, FilterRuleBuilder};
pub use health::HealthCheck;
pub use index::{ArtifactPath, PackageIndexExtractor, RequiredArtifactSet};
pub use pool::{ArtifactRoot, PoolSynchronizer};
pub use repository::{RepositoryDescriptor, Topology};
pub use sync::{RepositorySyncOrchestrator, RunSummary, SyncOutcome, SyncPhase};
pub use transfer::{RetryPolicy, RsyncTool, TransferExecutor, TransferOptions, TransferRequest};
