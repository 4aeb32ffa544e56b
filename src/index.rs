use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::{IndividualRecord, SampleRecord, SampleType};

/// Known sample and individual ids of one project for one sample type.
///
/// Built fresh for every reconciliation and never shared: the claimed set is the
/// per-invocation pool of individuals already consumed by a match.
#[derive(Debug, Clone)]
pub struct IdentifierIndex {
    sample_type: SampleType,
    samples_by_id: HashMap<String, SampleRecord>,
    individuals_by_id: HashMap<String, IndividualRecord>,
    individual_ids_by_guid: HashMap<String, String>,
    guids_with_sample: HashSet<String>,
    claimed: HashSet<String>,
}

impl IdentifierIndex {
    /// `samples` may contain other sample types; they are ignored.
    pub fn build(
        sample_type: SampleType,
        samples: impl IntoIterator<Item = SampleRecord>,
        individuals: impl IntoIterator<Item = IndividualRecord>,
    ) -> Self {
        let mut samples_by_id: HashMap<String, SampleRecord> = HashMap::new();
        let mut guids_with_sample = HashSet::new();
        for sample in samples {
            if sample.sample_type != sample_type {
                continue;
            }
            if sample.is_active {
                guids_with_sample.insert(sample.individual_guid.clone());
            }
            match samples_by_id.get(&sample.sample_id) {
                Some(existing) if existing.is_active && !sample.is_active => {}
                _ => {
                    samples_by_id.insert(sample.sample_id.clone(), sample);
                }
            }
        }

        let mut individuals_by_id = HashMap::new();
        let mut individual_ids_by_guid = HashMap::new();
        for individual in individuals {
            individual_ids_by_guid.insert(individual.guid.clone(), individual.individual_id.clone());
            individuals_by_id.insert(individual.individual_id.clone(), individual);
        }

        tracing::debug!(
            samples = samples_by_id.len(),
            individuals = individuals_by_id.len(),
            %sample_type,
            "built identifier index"
        );

        Self {
            sample_type,
            samples_by_id,
            individuals_by_id,
            individual_ids_by_guid,
            guids_with_sample,
            claimed: HashSet::new(),
        }
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    pub fn lookup_by_sample_id(&self, id: &str) -> Option<&SampleRecord> {
        self.samples_by_id.get(id)
    }

    pub fn lookup_by_individual_id(&self, id: &str) -> Option<&IndividualRecord> {
        self.individuals_by_id.get(id)
    }

    pub fn individual_id_for_guid(&self, guid: &str) -> Option<&str> {
        self.individual_ids_by_guid.get(guid).map(String::as_str)
    }

    /// Whether the individual already owns an active sample of this index's type.
    pub fn has_sample_of_type(&self, individual_guid: &str) -> bool {
        self.guids_with_sample.contains(individual_guid)
    }

    pub fn is_claimed(&self, individual_id: &str) -> bool {
        self.claimed.contains(individual_id)
    }

    /// Removes an individual from the fuzzy-match pool. Returns false if it was already claimed.
    pub fn claim(&mut self, individual_id: &str) -> bool {
        self.claimed.insert(individual_id.to_string())
    }

    pub fn unclaimed_individual_ids(&self) -> BTreeSet<&str> {
        self.individuals_by_id
            .keys()
            .filter(|id| !self.claimed.contains(id.as_str()))
            .map(String::as_str)
            .collect()
    }
}
