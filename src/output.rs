use std::io::{self, Write};

use serde::Serialize;

use crate::app::{AlignmentUpdate, ImportResult, ReconcileResult};
use crate::domain::{DatasetEntity, Project};
use crate::linker::LinkOutcome;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_reconcile(result: &ReconcileResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_bams(
        result: &ReconcileResult,
        alignments: Option<&AlignmentUpdate>,
    ) -> io::Result<()> {
        #[derive(Serialize)]
        struct BamsJson<'a> {
            #[serde(flatten)]
            result: &'a ReconcileResult,
            alignments: Option<&'a AlignmentUpdate>,
        }
        Self::print_json(&BamsJson { result, alignments })
    }

    pub fn print_project(project: &Project) -> io::Result<()> {
        Self::print_json(project)
    }

    pub fn print_import(result: &ImportResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_dataset(dataset: &DatasetEntity) -> io::Result<()> {
        Self::print_json(dataset)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_reconcile(result: &ReconcileResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(result.report.summary().as_bytes())?;
        writeln!(stdout, "{}", describe_link(result.link.as_ref()))?;
        if let Some(status) = result.ingestion {
            writeln!(stdout, "Ingestion: {status:?}")?;
        }
        Ok(())
    }

    pub fn print_alignments(update: &AlignmentUpdate) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "Alignment files: {} updated, no change detected for {} rows.",
            update.updated.len(),
            update.unchanged.len()
        )?;
        if !update.skipped.is_empty() {
            writeln!(stdout, "Not recorded (unmatched): {}", update.skipped.join(", "))?;
        }
        Ok(())
    }
}

pub fn describe_link(link: Option<&LinkOutcome>) -> String {
    match link {
        None => "Stopped: some sample ids are unmatched; nothing was written.".to_string(),
        Some(LinkOutcome::AlreadyLoaded { dataset }) => format!(
            "All {} samples in {} are already loaded.",
            dataset.sample_guids.len(),
            dataset.source_locator
        ),
        Some(LinkOutcome::Linked {
            dataset,
            created,
            newly_linked,
        }) => format!(
            "{} dataset {}: {newly_linked} new sample links ({} total).",
            if *created { "Created" } else { "Updated" },
            dataset.guid,
            dataset.sample_guids.len()
        ),
        Some(LinkOutcome::DryRun {
            dataset_exists,
            would_link,
        }) => format!(
            "[dry run] would link {would_link} samples to {} dataset.",
            if *dataset_exists { "the existing" } else { "a new" }
        ),
        Some(LinkOutcome::NothingToLink) => "No samples to link.".to_string(),
    }
}
