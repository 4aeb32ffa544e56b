use std::fmt::Write as _;
use std::io::{self, BufRead, Write};

use serde::Serialize;

use crate::domain::{IndividualRecord, ProjectGuid};
use crate::error::ReconcileError;
use crate::resolver::{AmbiguousMatch, MatchOutcome, Resolution};
use crate::store::RecordWriter;

/// What the provisioning decision is asked about.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionPrompt {
    pub project: ProjectGuid,
    pub project_name: String,
    pub external_ids: Vec<String>,
}

impl ProvisionPrompt {
    pub fn question(&self) -> String {
        format!(
            "Add these {} extra samples to {} as new families and individuals?",
            self.external_ids.len(),
            self.project_name
        )
    }
}

/// The one interactive point of a reconciliation: whether to create placeholder
/// family and individual records for ids that matched nothing.
pub trait ProvisionDecision {
    fn decide(&self, prompt: &ProvisionPrompt) -> bool;
}

impl<F> ProvisionDecision for F
where
    F: Fn(&ProvisionPrompt) -> bool,
{
    fn decide(&self, prompt: &ProvisionPrompt) -> bool {
        self(prompt)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysYes;

impl ProvisionDecision for AlwaysYes {
    fn decide(&self, _prompt: &ProvisionPrompt) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysNo;

impl ProvisionDecision for AlwaysNo {
    fn decide(&self, _prompt: &ProvisionPrompt) -> bool {
        false
    }
}

/// Asks on stderr and reads y/n from stdin. Anything but yes counts as no.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

impl ProvisionDecision for ConsolePrompt {
    fn decide(&self, prompt: &ProvisionPrompt) -> bool {
        let mut stderr = io::stderr();
        for id in &prompt.external_ids {
            let _ = writeln!(stderr, "  {id}");
        }
        let _ = write!(stderr, "{} [y/N] ", prompt.question());
        let _ = stderr.flush();

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchLine {
    pub external_id: String,
    pub individual_guid: String,
    pub individual_id: Option<String>,
    pub sample_guid: Option<String>,
    pub stage: &'static str,
    pub distance: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub project: ProjectGuid,
    pub dry_run: bool,
    pub matched: usize,
    pub unmatched: usize,
    pub ambiguous: usize,
    pub matches: Vec<MatchLine>,
    pub unmatched_ids: Vec<String>,
    pub ambiguous_matches: Vec<AmbiguousMatch>,
    pub provisioned: Vec<IndividualRecord>,
    pub provision_declined: bool,
}

impl ReconciliationReport {
    pub fn from_resolution(project: &ProjectGuid, resolution: &Resolution) -> Self {
        let matches = resolution
            .outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                MatchOutcome::Matched(sample) => Some(MatchLine {
                    external_id: id.clone(),
                    individual_guid: sample.individual_guid.clone(),
                    individual_id: None,
                    sample_guid: Some(sample.guid.clone()),
                    stage: "sample_id",
                    distance: 0,
                }),
                MatchOutcome::MatchedViaIndividual {
                    individual,
                    sample,
                    distance,
                } => Some(MatchLine {
                    external_id: id.clone(),
                    individual_guid: individual.guid.clone(),
                    individual_id: Some(individual.individual_id.clone()),
                    sample_guid: sample.as_ref().map(|s| s.guid.clone()),
                    stage: if *distance == 0 {
                        "individual_id"
                    } else {
                        "edit_distance"
                    },
                    distance: *distance,
                }),
                MatchOutcome::Unmatched | MatchOutcome::AmbiguousReject { .. } => None,
            })
            .collect::<Vec<_>>();
        let unmatched_ids = resolution
            .unmatched_ids()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let ambiguous_matches = resolution.ambiguous();

        Self {
            project: project.clone(),
            dry_run: resolution.dry_run,
            matched: matches.len(),
            unmatched: unmatched_ids.len(),
            ambiguous: ambiguous_matches.len(),
            matches,
            unmatched_ids,
            ambiguous_matches,
            provisioned: Vec::new(),
            provision_declined: false,
        }
    }

    /// Whether the provisioning question applies to this run.
    pub fn needs_provision_decision(&self) -> bool {
        self.unmatched > 0 && !self.dry_run && self.provisioned.is_empty()
    }

    /// Asks `decision` once and, if accepted, creates a family and an individual named
    /// after each unmatched id. Ids that already name an individual are skipped.
    pub fn provision_unmatched(
        &mut self,
        project_name: &str,
        writer: &mut dyn RecordWriter,
        decision: &dyn ProvisionDecision,
    ) -> Result<usize, ReconcileError> {
        if !self.needs_provision_decision() {
            return Ok(0);
        }
        let existing = writer
            .fetch_project_individuals(&self.project)?
            .into_iter()
            .map(|individual| individual.individual_id)
            .collect::<std::collections::HashSet<_>>();
        let external_ids = self
            .unmatched_ids
            .iter()
            .filter(|id| {
                let taken = existing.contains(id.as_str());
                if taken {
                    tracing::warn!(external_id = %id, "individual already exists; not provisioning");
                }
                !taken
            })
            .cloned()
            .collect::<Vec<_>>();
        if external_ids.is_empty() {
            return Ok(0);
        }

        let prompt = ProvisionPrompt {
            project: self.project.clone(),
            project_name: project_name.to_string(),
            external_ids,
        };
        if !decision.decide(&prompt) {
            self.provision_declined = true;
            return Ok(0);
        }

        for id in &prompt.external_ids {
            let individual = writer
                .create_family_and_individual(id, &self.project)
                .map_err(|err| match err {
                    ReconcileError::ExternalCollaborator { .. } => err,
                    other => ReconcileError::collaborator("provision individuals", other.to_string()),
                })?;
            tracing::info!(external_id = %id, guid = %individual.guid, "created family and individual");
            self.provisioned.push(individual);
        }
        Ok(self.provisioned.len())
    }

    /// Plain-text summary with every list sorted, so two runs over the same input print
    /// the same thing.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}{} matched, {} unmatched ({} ambiguous) in {}",
            if self.dry_run { "[dry run] " } else { "" },
            self.matched,
            self.unmatched,
            self.ambiguous,
            self.project
        );
        for line in &self.matches {
            match (&line.individual_id, line.stage) {
                (_, "sample_id") => {
                    let _ = writeln!(out, "  = {} (existing sample)", line.external_id);
                }
                (Some(individual), "individual_id") => {
                    let _ = writeln!(out, "  + {} -> individual {individual}", line.external_id);
                }
                (Some(individual), _) => {
                    let _ = writeln!(
                        out,
                        "  ~ {} -> individual {individual} (edit distance {})",
                        line.external_id, line.distance
                    );
                }
                (None, _) => {}
            }
        }
        if !self.unmatched_ids.is_empty() {
            let _ = writeln!(out, "Unmatched sample ids:");
            for id in &self.unmatched_ids {
                let _ = writeln!(out, "  {id}");
            }
        }
        if !self.ambiguous_matches.is_empty() {
            let _ = writeln!(out, "Ambiguous sample ids (review manually):");
            for item in &self.ambiguous_matches {
                let _ = writeln!(
                    out,
                    "  {} matches {} (edit distance {})",
                    item.external_id,
                    item.candidates.join(", "),
                    item.distance
                );
            }
        }
        if !self.provisioned.is_empty() {
            let _ = writeln!(out, "Created {} new individuals:", self.provisioned.len());
            for individual in &self.provisioned {
                let _ = writeln!(out, "  {}", individual.individual_id);
            }
        }
        out
    }
}
