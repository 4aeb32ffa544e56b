//! Reconciles externally supplied sample ids (VCF headers, alignment manifests, index sample
//! lists) with the curated individuals of a seqr project, and links the matched samples to a
//! dataset.

pub mod app;
pub mod config;
pub mod domain;
pub mod edit_distance;
pub mod error;
pub mod index;
pub mod ingestion;
pub mod linker;
pub mod output;
pub mod report;
pub mod resolver;
pub mod sources;
pub mod store;
