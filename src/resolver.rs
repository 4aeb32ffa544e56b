//! Matches external sample ids to the individuals of a project.
//!
//! Three stages, each seeing only the ids left over by the previous one:
//!
//! 1. the id is already the `sample_id` of a sample of the requested type;
//! 2. the id (or its mapped individual id) equals an `individual_id`;
//! 3. the id is within `max_edit_distance` of exactly one unclaimed individual id.
//!
//! Ids that tie between several individuals in stage 3 are rejected as ambiguous and left
//! for a human to sort out. An id whose exact individual was already taken by another id
//! stays unmatched and never falls through to stage 3.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::domain::{DatasetType, IndividualRecord, SampleRecord, SampleType};
use crate::edit_distance::distance;
use crate::error::ReconcileError;
use crate::index::IdentifierIndex;
use crate::store::RecordWriter;

/// Which individuals stage 3 may consider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FuzzyEligibility {
    #[default]
    AllIndividuals,
    /// Skip individuals that already own an active sample of the requested type.
    WithoutSampleOfType,
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub sample_type: SampleType,
    pub dataset_type: DatasetType,
    /// 0 disables fuzzy matching. A candidate must be strictly closer than this.
    pub max_edit_distance: usize,
    pub dry_run: bool,
    pub fuzzy_eligibility: FuzzyEligibility,
}

impl ResolveOptions {
    pub fn new(sample_type: SampleType, dataset_type: DatasetType) -> Self {
        Self {
            sample_type,
            dataset_type,
            max_edit_distance: 0,
            dry_run: false,
            fuzzy_eligibility: FuzzyEligibility::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched(SampleRecord),
    /// Bound to an individual; `sample` is `None` until materialized, and stays so in dry runs.
    MatchedViaIndividual {
        individual: IndividualRecord,
        sample: Option<SampleRecord>,
        distance: usize,
    },
    Unmatched,
    AmbiguousReject {
        candidates: Vec<String>,
        distance: usize,
    },
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(
            self,
            MatchOutcome::Matched(_) | MatchOutcome::MatchedViaIndividual { .. }
        )
    }

    pub fn sample(&self) -> Option<&SampleRecord> {
        match self {
            MatchOutcome::Matched(sample) => Some(sample),
            MatchOutcome::MatchedViaIndividual { sample, .. } => sample.as_ref(),
            MatchOutcome::Unmatched | MatchOutcome::AmbiguousReject { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousMatch {
    pub external_id: String,
    pub candidates: Vec<String>,
    pub distance: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub sample_type: SampleType,
    pub dataset_type: DatasetType,
    pub dry_run: bool,
    pub outcomes: BTreeMap<String, MatchOutcome>,
}

impl Resolution {
    /// Every external id bound to a real sample record, in id order.
    pub fn matched_samples(&self) -> Vec<(&str, &SampleRecord)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| outcome.sample().map(|sample| (id.as_str(), sample)))
            .collect()
    }

    /// Ids that matched, including the would-be matches of a dry run.
    pub fn matched_ids(&self) -> BTreeSet<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_match())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Ids left without a match, ambiguous ones included.
    pub fn unmatched_ids(&self) -> BTreeSet<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_match())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn ambiguous(&self) -> Vec<AmbiguousMatch> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                MatchOutcome::AmbiguousReject {
                    candidates,
                    distance,
                } => Some(AmbiguousMatch {
                    external_id: id.clone(),
                    candidates: candidates.clone(),
                    distance: *distance,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Runs the three matching stages for one invocation.
#[derive(Debug, Clone)]
pub struct MatchResolver {
    options: ResolveOptions,
    id_mapping: HashMap<String, String>,
}

impl MatchResolver {
    pub fn new(options: ResolveOptions) -> Self {
        Self {
            options,
            id_mapping: HashMap::new(),
        }
    }

    /// Sample id to individual id overrides, consulted in stage 2.
    pub fn with_id_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.id_mapping = mapping;
        self
    }

    /// Decides every outcome without touching the store. Stage 2 and 3 matches come back
    /// with `sample: None`.
    pub fn plan(
        &self,
        external_ids: &[String],
        index: &mut IdentifierIndex,
    ) -> Result<Resolution, ReconcileError> {
        let ids = self.validate(external_ids, index)?;
        let mut outcomes = BTreeMap::new();
        tracing::info!(count = ids.len(), "sample ids found in source");

        // stage 1: existing samples of this type
        for id in &ids {
            if let Some(sample) = index.lookup_by_sample_id(id) {
                tracing::info!(external_id = %id, "exactly matched existing sample id");
                let sample = sample.clone();
                if let Some(individual_id) = index.individual_id_for_guid(&sample.individual_guid) {
                    let individual_id = individual_id.to_string();
                    index.claim(&individual_id);
                }
                outcomes.insert(id.clone(), MatchOutcome::Matched(sample));
            }
        }

        // stage 2: individual ids, directly or through the mapping
        let mut contested = BTreeSet::new();
        for id in &ids {
            if outcomes.contains_key(id) {
                continue;
            }
            let key = self.id_mapping.get(id).unwrap_or(id);
            let Some(individual) = index.lookup_by_individual_id(key).cloned() else {
                continue;
            };
            if !index.claim(&individual.individual_id) {
                tracing::warn!(
                    external_id = %id,
                    individual_id = %individual.individual_id,
                    "individual already matched by another sample id"
                );
                contested.insert(id.clone());
                continue;
            }
            tracing::info!(external_id = %id, individual_id = %individual.individual_id, "exactly matched individual id");
            outcomes.insert(
                id.clone(),
                MatchOutcome::MatchedViaIndividual {
                    individual,
                    sample: None,
                    distance: 0,
                },
            );
        }

        // stage 3: bounded edit distance against the unclaimed pool
        let max = self.options.max_edit_distance;
        for id in &ids {
            if outcomes.contains_key(id) {
                continue;
            }
            let outcome = if max > 0 && !contested.contains(id) {
                self.fuzzy_match(id, index)
            } else {
                MatchOutcome::Unmatched
            };
            outcomes.insert(id.clone(), outcome);
        }

        let resolution = Resolution {
            sample_type: self.options.sample_type,
            dataset_type: self.options.dataset_type,
            dry_run: self.options.dry_run,
            outcomes,
        };
        tracing::info!(
            matched = resolution.matched_ids().len(),
            unmatched = resolution.unmatched_ids().len(),
            "sample id matching finished"
        );
        Ok(resolution)
    }

    /// [`plan`](Self::plan), then [`materialize`](Self::materialize).
    pub fn resolve(
        &self,
        external_ids: &[String],
        index: &mut IdentifierIndex,
        writer: &mut dyn RecordWriter,
    ) -> Result<Resolution, ReconcileError> {
        let mut resolution = self.plan(external_ids, index)?;
        self.materialize(&mut resolution, writer)?;
        Ok(resolution)
    }

    /// Creates a sample for every individual-level match of a plan. Dry runs are left as
    /// planned.
    pub fn materialize(
        &self,
        resolution: &mut Resolution,
        writer: &mut dyn RecordWriter,
    ) -> Result<(), ReconcileError> {
        if resolution.dry_run {
            return Ok(());
        }
        for (id, outcome) in resolution.outcomes.iter_mut() {
            let MatchOutcome::MatchedViaIndividual {
                individual, sample, ..
            } = outcome
            else {
                continue;
            };
            if sample.is_none() {
                let created = writer
                    .create_sample(
                        id,
                        resolution.sample_type,
                        resolution.dataset_type,
                        individual,
                    )
                    .map_err(|err| match err {
                        ReconcileError::ExternalCollaborator { .. } => err,
                        other => ReconcileError::collaborator("create sample", other.to_string()),
                    })?;
                *sample = Some(created);
            }
        }
        Ok(())
    }

    fn validate(
        &self,
        external_ids: &[String],
        index: &IdentifierIndex,
    ) -> Result<BTreeSet<String>, ReconcileError> {
        if external_ids.is_empty() {
            return Err(ReconcileError::InvalidInput(
                "no sample ids found in source".to_string(),
            ));
        }
        if index.sample_type() != self.options.sample_type {
            return Err(ReconcileError::InvalidInput(format!(
                "index was built for {} samples, not {}",
                index.sample_type(),
                self.options.sample_type
            )));
        }
        if !self.options.dataset_type.supports(self.options.sample_type) {
            return Err(ReconcileError::InvalidInput(format!(
                "{} data is not supported for {} samples",
                self.options.dataset_type, self.options.sample_type
            )));
        }

        let mut ids = BTreeSet::new();
        for id in external_ids {
            if id.trim().is_empty() {
                return Err(ReconcileError::InvalidInput("blank sample id".to_string()));
            }
            if !ids.insert(id.clone()) {
                tracing::warn!(external_id = %id, "duplicate sample id ignored");
            }
        }
        Ok(ids)
    }

    fn fuzzy_match(&self, id: &str, index: &mut IdentifierIndex) -> MatchOutcome {
        let threshold = self.options.max_edit_distance;
        let mut best = threshold;
        let mut candidates: Vec<String> = Vec::new();
        for individual_id in index.unclaimed_individual_ids() {
            if self.options.fuzzy_eligibility == FuzzyEligibility::WithoutSampleOfType {
                let has_sample = index
                    .lookup_by_individual_id(individual_id)
                    .is_some_and(|individual| index.has_sample_of_type(&individual.guid));
                if has_sample {
                    continue;
                }
            }
            let n = distance(id, individual_id);
            if n < best {
                best = n;
                candidates.clear();
                candidates.push(individual_id.to_string());
            } else if n == best && n < threshold {
                candidates.push(individual_id.to_string());
            }
        }

        if candidates.len() > 1 {
            tracing::warn!(
                external_id = %id,
                candidates = %candidates.join(", "),
                distance = best,
                "no match: sample id is equally close to several individual ids"
            );
            return MatchOutcome::AmbiguousReject {
                candidates,
                distance: best,
            };
        }
        let Some(individual) = candidates
            .first()
            .and_then(|only| index.lookup_by_individual_id(only))
            .cloned()
        else {
            return MatchOutcome::Unmatched;
        };

        tracing::info!(
            external_id = %id,
            individual_id = %individual.individual_id,
            distance = best,
            "matched individual id by edit distance"
        );
        index.claim(&individual.individual_id);
        MatchOutcome::MatchedViaIndividual {
            individual,
            sample: None,
            distance: best,
        }
    }
}
