use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ReconcileError {
    #[error("invalid input: {0}")]
    #[diagnostic(code(seqr_reconcile::invalid_input))]
    InvalidInput(String),

    #[error("invalid project id: {0}")]
    #[diagnostic(code(seqr_reconcile::unknown_project))]
    UnknownProject(String),

    #[error("genome build {requested} doesn't match the project's genome build which is {project}")]
    #[diagnostic(code(seqr_reconcile::genome_build))]
    GenomeBuildMismatch { requested: String, project: String },

    #[error("unsupported source: {0}")]
    #[diagnostic(
        code(seqr_reconcile::unsupported_source),
        help("copy the file locally before reconciling")
    )]
    UnsupportedSource(String),

    #[error("record store changed during reconciliation (expected revision {expected}, found {found})")]
    #[diagnostic(
        code(seqr_reconcile::conflict),
        help("no changes were written; re-run the command")
    )]
    PersistenceConflict { expected: u64, found: u64 },

    #[error("record store is locked by another writer ({path})")]
    #[diagnostic(
        code(seqr_reconcile::store_locked),
        help("if no other seqr-reconcile run is active, the lock was left by a killed process; delete {path} and re-run")
    )]
    StoreLocked { path: String },

    #[error("{stage} failed: {message}")]
    #[diagnostic(code(seqr_reconcile::collaborator))]
    ExternalCollaborator { stage: &'static str, message: String },

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl ReconcileError {
    pub fn collaborator(stage: &'static str, message: impl Into<String>) -> Self {
        ReconcileError::ExternalCollaborator {
            stage,
            message: message.into(),
        }
    }

    /// Whether the same invocation may succeed if simply re-run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::PersistenceConflict { .. })
    }
}
