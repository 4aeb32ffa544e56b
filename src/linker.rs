use serde::Serialize;

use crate::domain::{AnalysisType, DatasetEntity, LoadingStatus, ProjectGuid, SampleRecord};
use crate::error::ReconcileError;
use crate::ingestion::IngestionTrigger;
use crate::resolver::Resolution;
use crate::store::{RecordReader, RecordStore, RecordWriter};

/// Identity of the dataset a source is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkRequest {
    pub analysis_type: AnalysisType,
    pub source_locator: String,
    pub project: ProjectGuid,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkOutcome {
    /// Loaded before, and every matched id is already linked: nothing was done.
    AlreadyLoaded { dataset: DatasetEntity },
    Linked {
        dataset: DatasetEntity,
        created: bool,
        newly_linked: usize,
    },
    DryRun {
        dataset_exists: bool,
        would_link: usize,
    },
    NothingToLink,
}

impl LinkOutcome {
    /// A linked dataset goes to the loading pipeline unless it is loaded or already loading.
    /// Linking new samples resets the status to `Created`; a `Failed` dataset is retried.
    pub fn needs_ingestion(&self) -> bool {
        matches!(
            self,
            LinkOutcome::Linked { dataset, .. }
                if matches!(dataset.loading_status, LoadingStatus::Created | LoadingStatus::Failed)
        )
    }

    pub fn dataset(&self) -> Option<&DatasetEntity> {
        match self {
            LinkOutcome::AlreadyLoaded { dataset } | LinkOutcome::Linked { dataset, .. } => {
                Some(dataset)
            }
            LinkOutcome::DryRun { .. } | LinkOutcome::NothingToLink => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetLinker;

impl DatasetLinker {
    /// Returns the dataset if it is loaded and already holds the sample of every matched id.
    /// An id bound to an individual but without a sample of the requested type yet is never
    /// linked, so call this on the plan, before any sample is created.
    pub fn already_loaded(
        &self,
        reader: &dyn RecordReader,
        request: &LinkRequest,
        resolution: &Resolution,
    ) -> Result<Option<DatasetEntity>, ReconcileError> {
        let Some(dataset) = reader.find_dataset(
            request.analysis_type,
            &request.source_locator,
            &request.project,
        )?
        else {
            return Ok(None);
        };
        if !dataset.is_loaded {
            return Ok(None);
        }
        let all_linked = resolution
            .outcomes
            .values()
            .filter(|outcome| outcome.is_match())
            .all(|outcome| {
                outcome
                    .sample()
                    .is_some_and(|sample| dataset.sample_guids.contains(&sample.guid))
            });
        if all_linked {
            tracing::info!(
                count = resolution.matched_ids().len(),
                source = %request.source_locator,
                "all samples in this source are already loaded"
            );
            return Ok(Some(dataset));
        }
        Ok(None)
    }

    /// Finds or creates the dataset and adds every matched sample to it.
    pub fn link(
        &self,
        writer: &mut dyn RecordWriter,
        request: &LinkRequest,
        resolution: &Resolution,
    ) -> Result<LinkOutcome, ReconcileError> {
        if let Some(dataset) = self.already_loaded(&*writer, request, resolution)? {
            return Ok(LinkOutcome::AlreadyLoaded { dataset });
        }

        if resolution.dry_run {
            let existing = writer.find_dataset(
                request.analysis_type,
                &request.source_locator,
                &request.project,
            )?;
            let would_link = resolution
                .matched_samples()
                .iter()
                .filter(|(_, sample)| {
                    existing
                        .as_ref()
                        .is_none_or(|dataset| !dataset.sample_guids.contains(&sample.guid))
                })
                .count()
                + resolution
                    .outcomes
                    .values()
                    .filter(|outcome| outcome.is_match() && outcome.sample().is_none())
                    .count();
            return Ok(LinkOutcome::DryRun {
                dataset_exists: existing.is_some(),
                would_link,
            });
        }

        let samples = resolution
            .matched_samples()
            .into_iter()
            .map(|(_, sample)| sample.clone())
            .collect::<Vec<SampleRecord>>();
        if samples.is_empty() {
            return Ok(LinkOutcome::NothingToLink);
        }

        let existed = writer
            .find_dataset(
                request.analysis_type,
                &request.source_locator,
                &request.project,
            )?
            .is_some();
        let dataset = writer
            .find_or_create_dataset(
                request.analysis_type,
                &request.source_locator,
                &request.project,
            )
            .map_err(|err| wrap("find or create dataset", err))?;
        let newly_linked = writer
            .link_samples_to_dataset(&dataset.guid, &samples)
            .map_err(|err| wrap("link samples", err))?;
        let dataset = writer
            .find_dataset(
                request.analysis_type,
                &request.source_locator,
                &request.project,
            )?
            .unwrap_or(dataset);
        tracing::info!(
            dataset = %dataset.guid,
            newly_linked,
            total = dataset.sample_guids.len(),
            "linked samples to dataset"
        );
        Ok(LinkOutcome::Linked {
            dataset,
            created: !existed,
            newly_linked,
        })
    }

    /// Fires the loading pipeline for a committed dataset and records the result in its own
    /// small transaction.
    pub fn ingest(
        &self,
        store: &dyn RecordStore,
        dataset: &DatasetEntity,
        trigger: &dyn IngestionTrigger,
    ) -> Result<LoadingStatus, ReconcileError> {
        let status = if trigger.trigger(dataset) {
            LoadingStatus::Loading
        } else {
            tracing::warn!(dataset = %dataset.guid, "ingestion was not accepted");
            LoadingStatus::Failed
        };
        let mut catalog = store.begin()?;
        catalog.set_loading_status(&dataset.guid, status)?;
        store.commit(catalog)?;
        Ok(status)
    }
}

// invalid input stays invalid input; anything else is reported against the stage
fn wrap(stage: &'static str, err: ReconcileError) -> ReconcileError {
    match err {
        ReconcileError::InvalidInput(_)
        | ReconcileError::UnknownProject(_)
        | ReconcileError::ExternalCollaborator { .. } => err,
        other => ReconcileError::collaborator(stage, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{DatasetType, GenomeBuild, SampleType};
    use crate::resolver::MatchOutcome;
    use crate::store::{Catalog, MemoryStore};

    fn project() -> ProjectGuid {
        "R0001_cmg".parse().unwrap()
    }

    fn request() -> LinkRequest {
        LinkRequest {
            analysis_type: AnalysisType::VariantCalls,
            source_locator: "/data/cmg.vcf".to_string(),
            project: project(),
        }
    }

    fn seeded() -> (Catalog, SampleRecord) {
        let mut catalog = Catalog::default();
        catalog
            .create_project(project(), "CMG", GenomeBuild::Grch38)
            .unwrap();
        let individual = catalog.create_family_and_individual("NA1", &project()).unwrap();
        let sample = catalog
            .create_sample("NA1", SampleType::Wes, DatasetType::Variants, &individual)
            .unwrap();
        (catalog, sample)
    }

    fn resolution(outcomes: Vec<(&str, MatchOutcome)>, dry_run: bool) -> Resolution {
        Resolution {
            sample_type: SampleType::Wes,
            dataset_type: DatasetType::Variants,
            dry_run,
            outcomes: outcomes
                .into_iter()
                .map(|(id, outcome)| (id.to_string(), outcome))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn nothing_matched_creates_no_dataset() {
        let (mut catalog, _) = seeded();
        let outcome = DatasetLinker
            .link(
                &mut catalog,
                &request(),
                &resolution(vec![("ZZZ", MatchOutcome::Unmatched)], false),
            )
            .unwrap();
        assert_matches!(outcome, LinkOutcome::NothingToLink);
        assert!(!outcome.needs_ingestion());
        assert!(
            catalog
                .find_dataset(AnalysisType::VariantCalls, "/data/cmg.vcf", &project())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn loaded_dataset_with_every_sample_is_left_alone() {
        let (mut catalog, sample) = seeded();
        let matched = resolution(vec![("NA1", MatchOutcome::Matched(sample))], false);
        let first = DatasetLinker.link(&mut catalog, &request(), &matched).unwrap();
        assert!(first.needs_ingestion());
        let guid = first.dataset().unwrap().guid.clone();
        catalog.set_loading_status(&guid, LoadingStatus::Loaded).unwrap();

        let second = DatasetLinker.link(&mut catalog, &request(), &matched).unwrap();
        assert_matches!(second, LinkOutcome::AlreadyLoaded { ref dataset } if dataset.guid == guid);
        assert!(!second.needs_ingestion());
    }

    #[test]
    fn failed_dataset_is_handed_to_ingestion_again() {
        let (mut catalog, sample) = seeded();
        let matched = resolution(vec![("NA1", MatchOutcome::Matched(sample))], false);
        let first = DatasetLinker.link(&mut catalog, &request(), &matched).unwrap();
        let guid = first.dataset().unwrap().guid.clone();
        catalog.set_loading_status(&guid, LoadingStatus::Failed).unwrap();

        let retry = DatasetLinker.link(&mut catalog, &request(), &matched).unwrap();
        assert_matches!(retry, LinkOutcome::Linked { newly_linked: 0, .. });
        assert!(retry.needs_ingestion());

        catalog.set_loading_status(&guid, LoadingStatus::Loading).unwrap();
        let loading = DatasetLinker.link(&mut catalog, &request(), &matched).unwrap();
        assert!(!loading.needs_ingestion());
    }

    #[test]
    fn individual_without_a_sample_is_not_already_loaded() {
        let (mut catalog, sample) = seeded();
        let individual = catalog
            .fetch_project_individuals(&project())
            .unwrap()
            .remove(0);
        let matched = resolution(vec![("NA1", MatchOutcome::Matched(sample))], false);
        let guid = DatasetLinker
            .link(&mut catalog, &request(), &matched)
            .unwrap()
            .dataset()
            .unwrap()
            .guid
            .clone();
        catalog.set_loading_status(&guid, LoadingStatus::Loaded).unwrap();

        let planned = resolution(
            vec![(
                "NA1",
                MatchOutcome::MatchedViaIndividual {
                    individual,
                    sample: None,
                    distance: 0,
                },
            )],
            false,
        );
        assert!(
            DatasetLinker
                .already_loaded(&catalog, &request(), &planned)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn dry_run_counts_links_without_writing() {
        let (mut catalog, sample) = seeded();
        let before = catalog.staged_writes();
        let matched = resolution(vec![("NA1", MatchOutcome::Matched(sample))], true);

        let outcome = DatasetLinker.link(&mut catalog, &request(), &matched).unwrap();

        assert_matches!(
            outcome,
            LinkOutcome::DryRun {
                dataset_exists: false,
                would_link: 1
            }
        );
        assert_eq!(catalog.staged_writes(), before);
    }

    #[test]
    fn ingestion_status_is_committed_separately() {
        let (catalog, sample) = seeded();
        let store = MemoryStore::with_catalog(catalog);
        let mut txn = store.begin().unwrap();
        let matched = resolution(vec![("NA1", MatchOutcome::Matched(sample))], false);
        let outcome = DatasetLinker.link(&mut txn, &request(), &matched).unwrap();
        store.commit(txn).unwrap();

        let status = DatasetLinker
            .ingest(&store, outcome.dataset().unwrap(), &Unreachable)
            .unwrap();

        assert_eq!(status, LoadingStatus::Failed);
        let stored = store
            .snapshot()
            .unwrap()
            .find_dataset(AnalysisType::VariantCalls, "/data/cmg.vcf", &project())
            .unwrap()
            .unwrap();
        assert_eq!(stored.loading_status, LoadingStatus::Failed);
    }

    struct Unreachable;

    impl IngestionTrigger for Unreachable {
        fn trigger(&self, _dataset: &DatasetEntity) -> bool {
            false
        }
    }

    #[test]
    fn wrap_keeps_caller_errors() {
        assert_matches!(
            wrap("link samples", ReconcileError::InvalidInput("bad".to_string())),
            ReconcileError::InvalidInput(_)
        );
        assert_matches!(
            wrap("link samples", ReconcileError::Filesystem("full".to_string())),
            ReconcileError::ExternalCollaborator { stage: "link samples", .. }
        );
    }
}
