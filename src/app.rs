use std::collections::HashMap;

use serde::Serialize;

use crate::domain::{
    AlignmentFile, AnalysisType, DatasetEntity, GenomeBuild, IndividualRecord, LoadingStatus, Project,
    ProjectGuid,
};
use crate::error::ReconcileError;
use crate::index::IdentifierIndex;
use crate::ingestion::IngestionTrigger;
use crate::linker::{DatasetLinker, LinkOutcome, LinkRequest};
use crate::report::{ProvisionDecision, ReconciliationReport};
use crate::resolver::{MatchResolver, ResolveOptions};
use crate::sources::AlignmentRecord;
use crate::store::{RecordReader, RecordStore, RecordWriter};

/// Everything one reconciliation needs to know about its source.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub project: ProjectGuid,
    /// Checked against the project's build when given.
    pub genome_build: Option<GenomeBuild>,
    pub analysis_type: AnalysisType,
    pub source_locator: String,
    pub external_ids: Vec<String>,
    pub id_mapping: HashMap<String, String>,
    pub options: ResolveOptions,
    /// Stop before any write when some ids stay unmatched.
    pub fail_on_unmatched: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileResult {
    pub report: ReconciliationReport,
    /// `None` when the run stopped on unmatched ids.
    pub link: Option<LinkOutcome>,
    /// Store revision written by this run, if it wrote anything.
    pub revision: Option<u64>,
    pub ingestion: Option<LoadingStatus>,
}

impl ReconcileResult {
    pub fn halted_on_unmatched(&self) -> bool {
        self.link.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub created: Vec<IndividualRecord>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlignmentUpdate {
    pub updated: Vec<AlignmentFile>,
    /// Individual ids whose file path was already on record.
    pub unchanged: Vec<String>,
    /// Manifest ids that did not match an individual.
    pub skipped: Vec<String>,
    pub revision: Option<u64>,
}

pub struct Reconciler<S: RecordStore, T: IngestionTrigger> {
    store: S,
    ingestion: T,
    linker: DatasetLinker,
}

impl<S: RecordStore, T: IngestionTrigger> Reconciler<S, T> {
    pub fn new(store: S, ingestion: T) -> Self {
        Self {
            store,
            ingestion,
            linker: DatasetLinker,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ingestion(&self) -> &T {
        &self.ingestion
    }

    /// Matches the request's ids, optionally provisions leftovers, links the dataset and
    /// commits all of it in one transaction. Ingestion runs after the commit.
    pub fn reconcile(
        &self,
        request: &ReconcileRequest,
        decision: &dyn ProvisionDecision,
    ) -> Result<ReconcileResult, ReconcileError> {
        if request.external_ids.is_empty() {
            return Err(ReconcileError::InvalidInput(format!(
                "no sample ids found in {}",
                request.source_locator
            )));
        }

        let mut catalog = self.store.begin()?;
        let project = require_project(&catalog, &request.project)?;
        if let Some(build) = request.genome_build {
            if build != project.genome_build {
                return Err(ReconcileError::GenomeBuildMismatch {
                    requested: build.to_string(),
                    project: project.genome_build.to_string(),
                });
            }
        }

        let mut index = IdentifierIndex::build(
            request.options.sample_type,
            catalog.fetch_project_samples(&project.guid, request.options.sample_type)?,
            catalog.fetch_project_individuals(&project.guid)?,
        );
        let resolver = MatchResolver::new(request.options.clone())
            .with_id_mapping(request.id_mapping.clone());
        let mut resolution = resolver.plan(&request.external_ids, &mut index)?;

        let report = ReconciliationReport::from_resolution(&project.guid, &resolution);
        if report.matched > 0 {
            tracing::info!(
                "{} of these sample ids matched existing ids in {}",
                report.matched,
                project.name
            );
        }
        if report.unmatched > 0 {
            tracing::info!(
                "{} of these sample ids didn't match any existing ids in {}",
                report.unmatched,
                project.name
            );
        }

        let link_request = LinkRequest {
            analysis_type: request.analysis_type,
            source_locator: request.source_locator.clone(),
            project: project.guid.clone(),
        };
        if let Some(dataset) = self
            .linker
            .already_loaded(&catalog, &link_request, &resolution)?
        {
            return Ok(ReconcileResult {
                report,
                link: Some(LinkOutcome::AlreadyLoaded { dataset }),
                revision: None,
                ingestion: None,
            });
        }

        if request.options.dry_run {
            let link = self.linker.link(&mut catalog, &link_request, &resolution)?;
            return Ok(ReconcileResult {
                report,
                link: Some(link),
                revision: None,
                ingestion: None,
            });
        }

        if request.fail_on_unmatched && report.unmatched > 0 {
            tracing::warn!(
                unmatched = report.unmatched,
                "matches not found for some sample ids; nothing was written"
            );
            return Ok(ReconcileResult {
                report,
                link: None,
                revision: None,
                ingestion: None,
            });
        }

        // samples are created only once nothing above has ended the run
        resolver.materialize(&mut resolution, &mut catalog)?;
        let mut report = ReconciliationReport::from_resolution(&project.guid, &resolution);
        report.provision_unmatched(&project.name, &mut catalog, decision)?;
        let link = self.linker.link(&mut catalog, &link_request, &resolution)?;
        let revision = self.store.commit(catalog)?;

        let ingestion = match link.dataset() {
            Some(dataset) if link.needs_ingestion() => {
                match self.linker.ingest(&self.store, dataset, &self.ingestion) {
                    Ok(status) => Some(status),
                    Err(err) => {
                        tracing::warn!(error = %err, dataset = %dataset.guid, "could not record loading status");
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(ReconcileResult {
            report,
            link: Some(link),
            revision: Some(revision),
            ingestion,
        })
    }

    pub fn init_project(
        &self,
        guid: ProjectGuid,
        name: &str,
        genome_build: GenomeBuild,
    ) -> Result<Project, ReconcileError> {
        let mut catalog = self.store.begin()?;
        let project = catalog.create_project(guid, name, genome_build)?;
        self.store.commit(catalog)?;
        Ok(project)
    }

    /// Adds `(family_id, individual_id)` rows to a project. Ids already present are skipped.
    pub fn import_individuals(
        &self,
        project: &ProjectGuid,
        rows: &[(String, String)],
    ) -> Result<ImportResult, ReconcileError> {
        let mut catalog = self.store.begin()?;
        let project = require_project(&catalog, project)?;
        let mut existing = catalog
            .fetch_project_individuals(&project.guid)?
            .into_iter()
            .map(|individual| individual.individual_id)
            .collect::<std::collections::HashSet<_>>();

        let mut result = ImportResult {
            created: Vec::new(),
            skipped: Vec::new(),
        };
        for (family_id, individual_id) in rows {
            if !existing.insert(individual_id.clone()) {
                result.skipped.push(individual_id.clone());
                continue;
            }
            let individual = catalog.create_individual(family_id, individual_id, &project.guid)?;
            result.created.push(individual);
        }
        self.store.commit(catalog)?;
        Ok(result)
    }

    /// Records that the loading pipeline finished for a dataset.
    pub fn mark_loaded(
        &self,
        project: &ProjectGuid,
        analysis_type: AnalysisType,
        source_locator: &str,
    ) -> Result<DatasetEntity, ReconcileError> {
        let mut catalog = self.store.begin()?;
        require_project(&catalog, project)?;
        let dataset = catalog
            .find_dataset(analysis_type, source_locator, project)?
            .ok_or_else(|| {
                ReconcileError::InvalidInput(format!(
                    "no {analysis_type} dataset for {source_locator} in {project}"
                ))
            })?;
        let dataset = catalog.set_loading_status(&dataset.guid, LoadingStatus::Loaded)?;
        self.store.commit(catalog)?;
        Ok(dataset)
    }

    /// Records each manifest row's file path and sample id on the individual its id matched
    /// in `report`. Rows whose path is already on record are left unchanged; dry-run reports
    /// stage the updates without committing them.
    pub fn record_alignment_files(
        &self,
        report: &ReconciliationReport,
        records: &[AlignmentRecord],
    ) -> Result<AlignmentUpdate, ReconcileError> {
        let individuals = report
            .matches
            .iter()
            .map(|line| (line.external_id.as_str(), line.individual_guid.as_str()))
            .collect::<HashMap<_, _>>();
        let mut catalog = self.store.begin()?;
        let mut update = AlignmentUpdate::default();
        for record in records {
            let Some(individual_guid) = individuals.get(record.individual_id.as_str()) else {
                update.skipped.push(record.individual_id.clone());
                continue;
            };
            let current = catalog.alignment_file(individual_guid)?;
            if current.is_some_and(|file| file.file_path == record.file_path) {
                update.unchanged.push(record.individual_id.clone());
                continue;
            }
            let file = catalog.set_alignment_file(
                individual_guid,
                &record.file_path,
                record.sample_id.as_deref(),
            )?;
            update.updated.push(file);
        }

        if !update.unchanged.is_empty() {
            tracing::info!("No change detected for {} rows", update.unchanged.len());
        }
        if !update.skipped.is_empty() {
            tracing::warn!(
                ids = %update.skipped.join(", "),
                "alignment files not recorded for unmatched individual ids"
            );
        }
        if !report.dry_run {
            update.revision = Some(self.store.commit(catalog)?);
        }
        Ok(update)
    }
}

fn require_project(
    reader: &dyn RecordReader,
    guid: &ProjectGuid,
) -> Result<Project, ReconcileError> {
    reader
        .project(guid)?
        .ok_or_else(|| ReconcileError::UnknownProject(guid.to_string()))
}
