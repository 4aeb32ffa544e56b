use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AlignmentFile, AnalysisType, DatasetEntity, DatasetType, FamilyRecord, GenomeBuild, IndividualRecord,
    LoadingStatus, Project, ProjectGuid, SampleRecord, SampleType, guid_slug,
};
use crate::error::ReconcileError;

/// Read side of the record store.
pub trait RecordReader {
    fn project(&self, guid: &ProjectGuid) -> Result<Option<Project>, ReconcileError>;

    fn fetch_project_samples(
        &self,
        project: &ProjectGuid,
        sample_type: SampleType,
    ) -> Result<Vec<SampleRecord>, ReconcileError>;

    fn fetch_project_individuals(
        &self,
        project: &ProjectGuid,
    ) -> Result<Vec<IndividualRecord>, ReconcileError>;

    fn find_dataset(
        &self,
        analysis_type: AnalysisType,
        source_locator: &str,
        project: &ProjectGuid,
    ) -> Result<Option<DatasetEntity>, ReconcileError>;

    fn alignment_file(
        &self,
        individual_guid: &str,
    ) -> Result<Option<AlignmentFile>, ReconcileError>;
}

/// Write side of the record store. Writes are staged until the owning transaction commits.
pub trait RecordWriter: RecordReader {
    fn create_project(
        &mut self,
        guid: ProjectGuid,
        name: &str,
        genome_build: GenomeBuild,
    ) -> Result<Project, ReconcileError>;

    fn create_sample(
        &mut self,
        sample_id: &str,
        sample_type: SampleType,
        dataset_type: DatasetType,
        individual: &IndividualRecord,
    ) -> Result<SampleRecord, ReconcileError>;

    fn find_or_create_dataset(
        &mut self,
        analysis_type: AnalysisType,
        source_locator: &str,
        project: &ProjectGuid,
    ) -> Result<DatasetEntity, ReconcileError>;

    /// Set-union of `samples` into the dataset. Returns how many links are new.
    fn link_samples_to_dataset(
        &mut self,
        dataset_guid: &str,
        samples: &[SampleRecord],
    ) -> Result<usize, ReconcileError>;

    /// Placeholder pedigree records for an id that matched nothing: the family and the
    /// individual are both named after it.
    fn create_family_and_individual(
        &mut self,
        external_id: &str,
        project: &ProjectGuid,
    ) -> Result<IndividualRecord, ReconcileError> {
        self.create_individual(external_id, external_id, project)
    }

    /// Adds an individual, reusing the family if `family_id` already exists in the project.
    fn create_individual(
        &mut self,
        family_id: &str,
        individual_id: &str,
        project: &ProjectGuid,
    ) -> Result<IndividualRecord, ReconcileError>;

    fn set_loading_status(
        &mut self,
        dataset_guid: &str,
        status: LoadingStatus,
    ) -> Result<DatasetEntity, ReconcileError>;

    /// Replaces the individual's alignment file record, creating it if needed.
    fn set_alignment_file(
        &mut self,
        individual_guid: &str,
        file_path: &str,
        sample_id: Option<&str>,
    ) -> Result<AlignmentFile, ReconcileError>;
}

/// A store hands out [`Catalog`] transactions and commits them all-or-nothing.
pub trait RecordStore {
    fn begin(&self) -> Result<Catalog, ReconcileError>;

    /// Commits every write staged in `catalog`. Returns the new revision.
    fn commit(&self, catalog: Catalog) -> Result<u64, ReconcileError>;
}

/// Snapshot of every record, plus the writes staged against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    families: Vec<FamilyRecord>,
    #[serde(default)]
    individuals: Vec<IndividualRecord>,
    #[serde(default)]
    samples: Vec<SampleRecord>,
    #[serde(default)]
    datasets: Vec<DatasetEntity>,
    #[serde(default)]
    alignment_files: Vec<AlignmentFile>,
    #[serde(skip)]
    staged_writes: usize,
}

impl Catalog {
    pub fn has_staged_writes(&self) -> bool {
        self.staged_writes > 0
    }

    pub fn staged_writes(&self) -> usize {
        self.staged_writes
    }

    fn next_guid(&mut self, prefix: char, readable: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:07}_{}", self.next_id, guid_slug(readable))
    }

    fn require_project(&self, guid: &ProjectGuid) -> Result<&Project, ReconcileError> {
        self.projects
            .iter()
            .find(|project| &project.guid == guid)
            .ok_or_else(|| ReconcileError::UnknownProject(guid.to_string()))
    }

    fn staged(&mut self) {
        self.staged_writes += 1;
    }
}

impl RecordReader for Catalog {
    fn project(&self, guid: &ProjectGuid) -> Result<Option<Project>, ReconcileError> {
        Ok(self.projects.iter().find(|p| &p.guid == guid).cloned())
    }

    fn fetch_project_samples(
        &self,
        project: &ProjectGuid,
        sample_type: SampleType,
    ) -> Result<Vec<SampleRecord>, ReconcileError> {
        let individual_guids = self
            .individuals
            .iter()
            .filter(|individual| &individual.project == project)
            .map(|individual| individual.guid.as_str())
            .collect::<BTreeSet<_>>();
        Ok(self
            .samples
            .iter()
            .filter(|sample| {
                sample.sample_type == sample_type
                    && individual_guids.contains(sample.individual_guid.as_str())
            })
            .cloned()
            .collect())
    }

    fn fetch_project_individuals(
        &self,
        project: &ProjectGuid,
    ) -> Result<Vec<IndividualRecord>, ReconcileError> {
        Ok(self
            .individuals
            .iter()
            .filter(|individual| &individual.project == project)
            .cloned()
            .collect())
    }

    fn find_dataset(
        &self,
        analysis_type: AnalysisType,
        source_locator: &str,
        project: &ProjectGuid,
    ) -> Result<Option<DatasetEntity>, ReconcileError> {
        Ok(self
            .datasets
            .iter()
            .find(|dataset| {
                dataset.analysis_type == analysis_type
                    && dataset.source_locator == source_locator
                    && &dataset.project == project
            })
            .cloned())
    }

    fn alignment_file(
        &self,
        individual_guid: &str,
    ) -> Result<Option<AlignmentFile>, ReconcileError> {
        Ok(self
            .alignment_files
            .iter()
            .find(|file| file.individual_guid == individual_guid)
            .cloned())
    }
}

impl RecordWriter for Catalog {
    fn create_project(
        &mut self,
        guid: ProjectGuid,
        name: &str,
        genome_build: GenomeBuild,
    ) -> Result<Project, ReconcileError> {
        if self.projects.iter().any(|project| project.guid == guid) {
            return Err(ReconcileError::InvalidInput(format!(
                "project already exists: {guid}"
            )));
        }
        let project = Project {
            guid,
            name: name.to_string(),
            genome_build,
        };
        self.projects.push(project.clone());
        self.staged();
        Ok(project)
    }

    fn create_sample(
        &mut self,
        sample_id: &str,
        sample_type: SampleType,
        dataset_type: DatasetType,
        individual: &IndividualRecord,
    ) -> Result<SampleRecord, ReconcileError> {
        if !self.individuals.iter().any(|i| i.guid == individual.guid) {
            return Err(ReconcileError::collaborator(
                "create sample",
                format!("individual {} does not exist", individual.guid),
            ));
        }
        // at most one active sample per individual, sample type and dataset type
        for sample in self.samples.iter_mut().filter(|sample| {
            sample.individual_guid == individual.guid
                && sample.sample_type == sample_type
                && sample.dataset_type == dataset_type
        }) {
            sample.is_active = false;
        }

        let sample = SampleRecord {
            guid: self.next_guid('S', sample_id),
            sample_id: sample_id.to_string(),
            sample_type,
            dataset_type,
            individual_guid: individual.guid.clone(),
            is_active: true,
            created_at: Utc::now(),
        };
        self.samples.push(sample.clone());
        self.staged();
        Ok(sample)
    }

    fn find_or_create_dataset(
        &mut self,
        analysis_type: AnalysisType,
        source_locator: &str,
        project: &ProjectGuid,
    ) -> Result<DatasetEntity, ReconcileError> {
        if let Some(dataset) = self.find_dataset(analysis_type, source_locator, project)? {
            return Ok(dataset);
        }
        self.require_project(project)?;
        let file_name = source_locator.rsplit('/').next().unwrap_or(source_locator);
        let dataset = DatasetEntity {
            guid: self.next_guid('D', file_name),
            analysis_type,
            source_locator: source_locator.to_string(),
            project: project.clone(),
            sample_guids: BTreeSet::new(),
            is_loaded: false,
            loading_status: LoadingStatus::Created,
            created_at: Utc::now(),
            loaded_at: None,
        };
        tracing::info!(%analysis_type, source = source_locator, "created dataset");
        self.datasets.push(dataset.clone());
        self.staged();
        Ok(dataset)
    }

    fn link_samples_to_dataset(
        &mut self,
        dataset_guid: &str,
        samples: &[SampleRecord],
    ) -> Result<usize, ReconcileError> {
        let position = self
            .datasets
            .iter()
            .position(|dataset| dataset.guid == dataset_guid)
            .ok_or_else(|| {
                ReconcileError::collaborator("link samples", format!("no dataset {dataset_guid}"))
            })?;
        let project = self.datasets[position].project.clone();

        for sample in samples {
            let owner = self
                .individuals
                .iter()
                .find(|individual| individual.guid == sample.individual_guid);
            match owner {
                Some(individual) if individual.project == project => {}
                _ => {
                    return Err(ReconcileError::InvalidInput(format!(
                        "sample {} does not belong to project {project}",
                        sample.sample_id
                    )));
                }
            }
        }

        let dataset = &mut self.datasets[position];
        let added = samples
            .iter()
            .filter(|sample| dataset.sample_guids.insert(sample.guid.clone()))
            .count();
        if added > 0 {
            dataset.is_loaded = false;
            dataset.loading_status = LoadingStatus::Created;
            self.staged();
        }
        Ok(added)
    }

    fn create_individual(
        &mut self,
        family_id: &str,
        individual_id: &str,
        project: &ProjectGuid,
    ) -> Result<IndividualRecord, ReconcileError> {
        self.require_project(project)?;
        if family_id.trim().is_empty() || individual_id.trim().is_empty() {
            return Err(ReconcileError::InvalidInput(
                "family and individual ids must not be blank".to_string(),
            ));
        }
        if self
            .individuals
            .iter()
            .any(|i| &i.project == project && i.individual_id == individual_id)
        {
            return Err(ReconcileError::InvalidInput(format!(
                "individual {individual_id} already exists in {project}"
            )));
        }

        let family_guid = match self
            .families
            .iter()
            .find(|f| &f.project == project && f.family_id == family_id)
        {
            Some(family) => family.guid.clone(),
            None => {
                let family = FamilyRecord {
                    guid: self.next_guid('F', family_id),
                    family_id: family_id.to_string(),
                    project: project.clone(),
                };
                let guid = family.guid.clone();
                self.families.push(family);
                guid
            }
        };

        let individual = IndividualRecord {
            guid: self.next_guid('I', individual_id),
            individual_id: individual_id.to_string(),
            family_guid,
            project: project.clone(),
        };
        self.individuals.push(individual.clone());
        self.staged();
        Ok(individual)
    }

    fn set_loading_status(
        &mut self,
        dataset_guid: &str,
        status: LoadingStatus,
    ) -> Result<DatasetEntity, ReconcileError> {
        let dataset = self
            .datasets
            .iter_mut()
            .find(|dataset| dataset.guid == dataset_guid)
            .ok_or_else(|| {
                ReconcileError::collaborator("loading status", format!("no dataset {dataset_guid}"))
            })?;
        dataset.loading_status = status;
        dataset.is_loaded = status == LoadingStatus::Loaded;
        dataset.loaded_at = dataset.is_loaded.then(Utc::now);
        let updated = dataset.clone();
        self.staged();
        Ok(updated)
    }

    fn set_alignment_file(
        &mut self,
        individual_guid: &str,
        file_path: &str,
        sample_id: Option<&str>,
    ) -> Result<AlignmentFile, ReconcileError> {
        if !self.individuals.iter().any(|i| i.guid == individual_guid) {
            return Err(ReconcileError::collaborator(
                "record alignment file",
                format!("individual {individual_guid} does not exist"),
            ));
        }
        let file = AlignmentFile {
            individual_guid: individual_guid.to_string(),
            file_path: file_path.to_string(),
            sample_id: sample_id.map(str::to_string),
            updated_at: Utc::now(),
        };
        match self
            .alignment_files
            .iter_mut()
            .find(|existing| existing.individual_guid == individual_guid)
        {
            Some(existing) => *existing = file.clone(),
            None => self.alignment_files.push(file.clone()),
        }
        self.staged();
        Ok(file)
    }
}

/// Single JSON file holding the whole catalog, replaced atomically on commit.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: Utf8PathBuf,
}

impl JsonStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn lock_path(&self) -> Utf8PathBuf {
        self.path.with_extension("json.lock")
    }

    fn read_catalog(&self) -> Result<Catalog, ReconcileError> {
        if !self.path.as_std_path().exists() {
            return Ok(Catalog::default());
        }
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| ReconcileError::Filesystem(format!("read {}: {err}", self.path)))?;
        serde_json::from_str(&content)
            .map_err(|err| ReconcileError::Filesystem(format!("parse {}: {err}", self.path)))
    }
}

impl RecordStore for JsonStore {
    fn begin(&self) -> Result<Catalog, ReconcileError> {
        self.read_catalog()
    }

    fn commit(&self, mut catalog: Catalog) -> Result<u64, ReconcileError> {
        if !catalog.has_staged_writes() {
            return Ok(catalog.revision);
        }
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;

        let _lock = StoreLock::acquire(self.lock_path())?;
        let found = self.read_catalog()?.revision;
        if found != catalog.revision {
            return Err(ReconcileError::PersistenceConflict {
                expected: catalog.revision,
                found,
            });
        }
        catalog.revision += 1;

        let content = serde_json::to_vec_pretty(&catalog)
            .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix("seqr-reconcile-store")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        tracing::debug!(revision = catalog.revision, path = %self.path, "committed record store");
        Ok(catalog.revision)
    }
}

struct StoreLock {
    path: Utf8PathBuf,
}

impl StoreLock {
    fn acquire(path: Utf8PathBuf) -> Result<Self, ReconcileError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ReconcileError::StoreLocked {
                    path: path.to_string(),
                });
            }
            Err(err) => {
                return Err(ReconcileError::Filesystem(format!("lock {path}: {err}")));
            }
        };
        // the holder's pid, for whoever has to clear a stale lock
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.as_std_path());
    }
}

/// In-process store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    catalog: Mutex<Catalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(catalog: Catalog) -> Self {
        Self {
            catalog: Mutex::new(catalog),
        }
    }

    /// Copy of the last committed state.
    pub fn snapshot(&self) -> Result<Catalog, ReconcileError> {
        self.begin()
    }
}

impl RecordStore for MemoryStore {
    fn begin(&self) -> Result<Catalog, ReconcileError> {
        let guard = self
            .catalog
            .lock()
            .map_err(|_| ReconcileError::collaborator("record store", "lock poisoned"))?;
        let mut catalog = guard.clone();
        catalog.staged_writes = 0;
        Ok(catalog)
    }

    fn commit(&self, mut catalog: Catalog) -> Result<u64, ReconcileError> {
        let mut guard = self
            .catalog
            .lock()
            .map_err(|_| ReconcileError::collaborator("record store", "lock poisoned"))?;
        if !catalog.has_staged_writes() {
            return Ok(guard.revision);
        }
        if guard.revision != catalog.revision {
            return Err(ReconcileError::PersistenceConflict {
                expected: catalog.revision,
                found: guard.revision,
            });
        }
        catalog.revision += 1;
        catalog.staged_writes = 0;
        let revision = catalog.revision;
        *guard = catalog;
        Ok(revision)
    }
}
