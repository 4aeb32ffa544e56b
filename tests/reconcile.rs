use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use assert_matches::assert_matches;

use seqr_reconcile::app::{ReconcileRequest, Reconciler};
use seqr_reconcile::domain::{
    AnalysisType, DatasetEntity, DatasetType, GenomeBuild, LoadingStatus, ProjectGuid, SampleType,
};
use seqr_reconcile::error::ReconcileError;
use seqr_reconcile::ingestion::IngestionTrigger;
use seqr_reconcile::linker::LinkOutcome;
use seqr_reconcile::report::{AlwaysNo, AlwaysYes, ProvisionPrompt};
use seqr_reconcile::resolver::ResolveOptions;
use seqr_reconcile::sources::parse_alignment_manifest;
use seqr_reconcile::store::{Catalog, MemoryStore, RecordReader, RecordStore, RecordWriter};

const SOURCE: &str = "/data/cmg/callset.vcf.gz";

#[derive(Default)]
struct MockIngestion {
    reject: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockIngestion {
    fn rejecting() -> Self {
        Self {
            reject: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl IngestionTrigger for MockIngestion {
    fn trigger(&self, dataset: &DatasetEntity) -> bool {
        self.calls.lock().unwrap().push(dataset.guid.clone());
        !self.reject.load(Ordering::SeqCst)
    }
}

/// Refuses every commit, like a store that lost its disk mid-run.
struct RefusingStore {
    inner: MemoryStore,
}

impl RecordStore for RefusingStore {
    fn begin(&self) -> Result<Catalog, ReconcileError> {
        self.inner.begin()
    }

    fn commit(&self, _catalog: Catalog) -> Result<u64, ReconcileError> {
        Err(ReconcileError::collaborator("record store commit", "disk full"))
    }
}

/// Lets another writer commit first, so the reconciler's transaction is stale.
struct RacingStore {
    inner: MemoryStore,
}

impl RecordStore for RacingStore {
    fn begin(&self) -> Result<Catalog, ReconcileError> {
        self.inner.begin()
    }

    fn commit(&self, catalog: Catalog) -> Result<u64, ReconcileError> {
        let mut other = self.inner.begin()?;
        other.create_individual("FAM_LATE", "LATE1", &project())?;
        self.inner.commit(other)?;
        self.inner.commit(catalog)
    }
}

fn project() -> ProjectGuid {
    "R0001_cmg".parse().unwrap()
}

fn seeded_store(individuals: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    let mut catalog = store.begin().unwrap();
    catalog
        .create_project(project(), "CMG", GenomeBuild::Grch38)
        .unwrap();
    for id in individuals {
        catalog
            .create_individual(&format!("FAM_{id}"), id, &project())
            .unwrap();
    }
    store.commit(catalog).unwrap();
    store
}

fn request(ids: &[&str], max_edit_distance: usize) -> ReconcileRequest {
    let mut options = ResolveOptions::new(SampleType::Wes, DatasetType::Variants);
    options.max_edit_distance = max_edit_distance;
    ReconcileRequest {
        project: project(),
        genome_build: None,
        analysis_type: AnalysisType::VariantCalls,
        source_locator: SOURCE.to_string(),
        external_ids: ids.iter().map(|id| id.to_string()).collect(),
        id_mapping: HashMap::new(),
        options,
        fail_on_unmatched: false,
    }
}

fn sample_ids(store: &MemoryStore) -> Vec<String> {
    let mut ids = store
        .snapshot()
        .unwrap()
        .fetch_project_samples(&project(), SampleType::Wes)
        .unwrap()
        .into_iter()
        .map(|sample| sample.sample_id)
        .collect::<Vec<_>>();
    ids.sort();
    ids
}

#[test]
fn exact_individual_matches_create_samples_and_link_them() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "S2", "S3"]), MockIngestion::default());

    let result = reconciler
        .reconcile(&request(&["S1", "S2"], 0), &AlwaysNo)
        .unwrap();

    assert_eq!(result.report.matched, 2);
    assert_eq!(result.report.unmatched, 0);
    assert_eq!(sample_ids(reconciler.store()), vec!["S1", "S2"]);
    let dataset = assert_matches!(
        result.link,
        Some(LinkOutcome::Linked { dataset, created: true, newly_linked: 2 }) => dataset
    );
    assert_eq!(dataset.sample_guids.len(), 2);
    assert_eq!(result.ingestion, Some(LoadingStatus::Loading));
    assert_eq!(reconciler.ingestion().calls(), vec![dataset.guid.clone()]);

    let snapshot = reconciler.store().snapshot().unwrap();
    let stored = snapshot
        .find_dataset(AnalysisType::VariantCalls, SOURCE, &project())
        .unwrap()
        .unwrap();
    assert_eq!(stored.loading_status, LoadingStatus::Loading);
    assert!(!stored.is_loaded);
}

#[test]
fn unique_close_individual_is_matched() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "S9"]), MockIngestion::default());

    let result = reconciler
        .reconcile(&request(&["S1x"], 2), &AlwaysNo)
        .unwrap();

    assert_eq!(result.report.matched, 1);
    let line = &result.report.matches[0];
    assert_eq!(line.individual_id.as_deref(), Some("S1"));
    assert_eq!(line.distance, 1);
    assert_eq!(line.stage, "edit_distance");
    assert_eq!(sample_ids(reconciler.store()), vec!["S1x"]);
}

#[test]
fn tied_candidates_leave_the_id_unmatched() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "Sx"]), MockIngestion::default());

    let result = reconciler
        .reconcile(&request(&["S1x"], 2), &AlwaysNo)
        .unwrap();

    assert_eq!(result.report.matched, 0);
    assert_eq!(result.report.unmatched_ids, vec!["S1x"]);
    assert_eq!(result.report.ambiguous_matches.len(), 1);
    assert_eq!(result.report.ambiguous_matches[0].candidates, vec!["S1", "Sx"]);
    assert!(result.report.provision_declined);
    assert_matches!(result.link, Some(LinkOutcome::NothingToLink));
    assert!(sample_ids(reconciler.store()).is_empty());
    assert!(reconciler.ingestion().calls().is_empty());
}

#[test]
fn distance_at_threshold_is_not_a_match() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());

    let result = reconciler
        .reconcile(&request(&["S1x"], 1), &AlwaysNo)
        .unwrap();

    assert_eq!(result.report.unmatched_ids, vec!["S1x"]);
    assert!(result.report.ambiguous_matches.is_empty());
}

#[test]
fn dry_run_writes_nothing_and_never_asks() {
    let store = seeded_store(&["S1"]);
    let before = store.snapshot().unwrap().revision;
    let reconciler = Reconciler::new(store, MockIngestion::default());
    let mut request = request(&["S1", "NEW1"], 0);
    request.options.dry_run = true;
    let never = |_: &ProvisionPrompt| -> bool { panic!("a dry run must not ask to provision") };

    let result = reconciler.reconcile(&request, &never).unwrap();

    assert!(result.report.dry_run);
    assert_eq!(result.report.matched, 1);
    assert_eq!(result.report.unmatched_ids, vec!["NEW1"]);
    assert_matches!(
        result.link,
        Some(LinkOutcome::DryRun { dataset_exists: false, would_link: 1 })
    );
    assert_eq!(result.revision, None);
    let snapshot = reconciler.store().snapshot().unwrap();
    assert_eq!(snapshot.revision, before);
    assert_eq!(snapshot.fetch_project_individuals(&project()).unwrap().len(), 1);
    assert!(sample_ids(reconciler.store()).is_empty());
    assert!(
        snapshot
            .find_dataset(AnalysisType::VariantCalls, SOURCE, &project())
            .unwrap()
            .is_none()
    );
}

#[test]
fn rerunning_the_same_source_links_nothing_new() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "S2"]), MockIngestion::default());
    let request = request(&["S1", "S2"], 0);
    reconciler.reconcile(&request, &AlwaysNo).unwrap();
    let revision = reconciler.store().snapshot().unwrap().revision;

    let again = reconciler.reconcile(&request, &AlwaysNo).unwrap();

    assert_eq!(again.report.matches.iter().filter(|m| m.stage == "sample_id").count(), 2);
    assert_matches!(
        again.link,
        Some(LinkOutcome::Linked { created: false, newly_linked: 0, .. })
    );
    assert_eq!(again.ingestion, None);
    assert_eq!(reconciler.store().snapshot().unwrap().revision, revision);
    assert_eq!(reconciler.ingestion().calls().len(), 1);
}

#[test]
fn loaded_dataset_short_circuits_until_new_samples_arrive() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "S2", "S3"]), MockIngestion::default());
    reconciler
        .reconcile(&request(&["S1", "S2"], 0), &AlwaysNo)
        .unwrap();
    let loaded = reconciler
        .mark_loaded(&project(), AnalysisType::VariantCalls, SOURCE)
        .unwrap();
    assert!(loaded.is_loaded);
    assert!(loaded.loaded_at.is_some());

    let repeat = reconciler
        .reconcile(&request(&["S1", "S2"], 0), &AlwaysNo)
        .unwrap();
    assert_matches!(repeat.link, Some(LinkOutcome::AlreadyLoaded { .. }));
    assert_eq!(repeat.revision, None);

    let grown = reconciler
        .reconcile(&request(&["S1", "S2", "S3"], 0), &AlwaysNo)
        .unwrap();
    let dataset = assert_matches!(
        grown.link,
        Some(LinkOutcome::Linked { dataset, newly_linked: 1, .. }) => dataset
    );
    assert_eq!(dataset.sample_guids.len(), 3);
    assert!(!dataset.is_loaded);
    assert_eq!(reconciler.ingestion().calls().len(), 2);
}

#[test]
fn rejected_ingestion_is_recorded_as_failed() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::rejecting());

    let result = reconciler.reconcile(&request(&["S1"], 0), &AlwaysNo).unwrap();

    assert_eq!(result.ingestion, Some(LoadingStatus::Failed));
    let dataset = reconciler
        .store()
        .snapshot()
        .unwrap()
        .find_dataset(AnalysisType::VariantCalls, SOURCE, &project())
        .unwrap()
        .unwrap();
    assert_eq!(dataset.loading_status, LoadingStatus::Failed);
    assert_eq!(dataset.sample_guids.len(), 1);
}

#[test]
fn failed_ingestion_is_retried_on_the_next_run() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::rejecting());
    let first = reconciler.reconcile(&request(&["S1"], 0), &AlwaysNo).unwrap();
    assert_eq!(first.ingestion, Some(LoadingStatus::Failed));

    reconciler.ingestion().set_rejecting(false);
    let second = reconciler.reconcile(&request(&["S1"], 0), &AlwaysNo).unwrap();

    assert_matches!(
        second.link,
        Some(LinkOutcome::Linked { newly_linked: 0, .. })
    );
    assert_eq!(second.ingestion, Some(LoadingStatus::Loading));
    assert_eq!(reconciler.ingestion().calls().len(), 2);
    let dataset = reconciler
        .store()
        .snapshot()
        .unwrap()
        .find_dataset(AnalysisType::VariantCalls, SOURCE, &project())
        .unwrap()
        .unwrap();
    assert_eq!(dataset.loading_status, LoadingStatus::Loading);
}

#[test]
fn loaded_exome_sample_does_not_hide_a_new_genome_sample() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    reconciler.reconcile(&request(&["S1"], 0), &AlwaysNo).unwrap();
    reconciler
        .mark_loaded(&project(), AnalysisType::VariantCalls, SOURCE)
        .unwrap();

    let mut genome = request(&["S1"], 0);
    genome.options = ResolveOptions::new(SampleType::Wgs, DatasetType::Variants);
    let result = reconciler.reconcile(&genome, &AlwaysNo).unwrap();

    let dataset = assert_matches!(
        result.link,
        Some(LinkOutcome::Linked { dataset, newly_linked: 1, .. }) => dataset
    );
    let stored = reconciler
        .store()
        .snapshot()
        .unwrap()
        .fetch_project_samples(&project(), SampleType::Wgs)
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(
        result.report.matches[0].sample_guid.as_deref(),
        Some(stored[0].guid.as_str())
    );
    assert!(dataset.sample_guids.contains(&stored[0].guid));
    assert_eq!(dataset.sample_guids.len(), 2);
    assert_eq!(result.ingestion, Some(LoadingStatus::Loading));
}

#[test]
fn accepted_provisioning_makes_ids_match_next_time() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    let asked = Mutex::new(Vec::new());
    let decision = |prompt: &ProvisionPrompt| {
        asked.lock().unwrap().push(prompt.external_ids.clone());
        true
    };

    let first = reconciler
        .reconcile(&request(&["S1", "NEW1"], 0), &decision)
        .unwrap();

    assert_eq!(*asked.lock().unwrap(), vec![vec!["NEW1".to_string()]]);
    assert_eq!(first.report.provisioned.len(), 1);
    assert_eq!(first.report.provisioned[0].individual_id, "NEW1");
    assert_eq!(first.report.unmatched_ids, vec!["NEW1"]);
    assert_eq!(sample_ids(reconciler.store()), vec!["S1"]);

    let second = reconciler
        .reconcile(&request(&["S1", "NEW1"], 0), &AlwaysNo)
        .unwrap();
    assert_eq!(second.report.unmatched, 0);
    assert_eq!(sample_ids(reconciler.store()), vec!["NEW1", "S1"]);
}

#[test]
fn fail_on_unmatched_writes_nothing() {
    let store = seeded_store(&["S1"]);
    let before = store.snapshot().unwrap().revision;
    let reconciler = Reconciler::new(store, MockIngestion::default());
    let mut request = request(&["S1", "ZZZ"], 0);
    request.fail_on_unmatched = true;

    let result = reconciler.reconcile(&request, &AlwaysYes).unwrap();

    assert!(result.halted_on_unmatched());
    assert!(result.report.provisioned.is_empty());
    assert_eq!(reconciler.store().snapshot().unwrap().revision, before);
    assert!(sample_ids(reconciler.store()).is_empty());
    assert!(reconciler.ingestion().calls().is_empty());
}

#[test]
fn genome_build_must_match_the_project() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    let mut request = request(&["S1"], 0);
    request.genome_build = Some(GenomeBuild::Grch37);

    assert_matches!(
        reconciler.reconcile(&request, &AlwaysNo),
        Err(ReconcileError::GenomeBuildMismatch { .. })
    );
}

#[test]
fn unknown_project_is_rejected() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    let mut request = request(&["S1"], 0);
    request.project = "R0404_missing".parse().unwrap();

    assert_matches!(
        reconciler.reconcile(&request, &AlwaysNo),
        Err(ReconcileError::UnknownProject(_))
    );
}

#[test]
fn structural_variants_need_exome_or_genome_samples() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    let mut request = request(&["S1"], 0);
    request.options = ResolveOptions::new(SampleType::Rna, DatasetType::Sv);

    assert_matches!(
        reconciler.reconcile(&request, &AlwaysNo),
        Err(ReconcileError::InvalidInput(_))
    );
}

#[test]
fn failed_commit_leaves_the_store_untouched() {
    let store = RefusingStore {
        inner: seeded_store(&["S1", "S2"]),
    };
    let reconciler = Reconciler::new(store, MockIngestion::default());

    let err = reconciler
        .reconcile(&request(&["S1", "S2"], 0), &AlwaysNo)
        .unwrap_err();

    assert_matches!(err, ReconcileError::ExternalCollaborator { .. });
    assert!(sample_ids(&reconciler.store().inner).is_empty());
    assert!(reconciler.ingestion().calls().is_empty());
}

#[test]
fn concurrent_writer_causes_a_conflict() {
    let store = RacingStore {
        inner: seeded_store(&["S1"]),
    };
    let reconciler = Reconciler::new(store, MockIngestion::default());

    let err = reconciler
        .reconcile(&request(&["S1"], 0), &AlwaysNo)
        .unwrap_err();

    assert_matches!(err, ReconcileError::PersistenceConflict { .. });
    assert!(err.is_retryable());
    assert!(sample_ids(&reconciler.store().inner).is_empty());
}

#[test]
fn alignments_get_their_own_dataset() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "S2"]), MockIngestion::default());
    reconciler
        .reconcile(&request(&["S1", "S2"], 0), &AlwaysNo)
        .unwrap();

    let bams = ReconcileRequest {
        analysis_type: AnalysisType::Alignment,
        source_locator: "/data/cmg/bams.tsv".to_string(),
        options: ResolveOptions::new(SampleType::Wes, DatasetType::Alignment),
        ..request(&["S1"], 0)
    };
    let result = reconciler.reconcile(&bams, &AlwaysNo).unwrap();

    let dataset = assert_matches!(
        result.link,
        Some(LinkOutcome::Linked { dataset, created: true, newly_linked: 1 }) => dataset
    );
    assert_eq!(dataset.analysis_type, AnalysisType::Alignment);
    // the existing exome sample is reused rather than duplicated
    let snapshot = reconciler.store().snapshot().unwrap();
    let samples = snapshot
        .fetch_project_samples(&project(), SampleType::Wes)
        .unwrap();
    assert_eq!(samples.len(), 2);
    let s1 = samples.iter().find(|s| s.sample_id == "S1").unwrap();
    assert!(dataset.sample_guids.contains(&s1.guid));
}

#[test]
fn reuploaded_alignment_manifest_is_reported_unchanged() {
    let reconciler = Reconciler::new(seeded_store(&["S1", "S2"]), MockIngestion::default());
    let manifest = parse_alignment_manifest(
        "S1\t/bams/S1.bam\nS2\t/crams/S2.cram\tS2_wgs\nZZZ\t/bams/ZZZ.bam\n",
    )
    .unwrap();
    let bams = ReconcileRequest {
        analysis_type: AnalysisType::Alignment,
        source_locator: "/data/cmg/bams.tsv".to_string(),
        external_ids: manifest.external_ids(),
        options: ResolveOptions::new(SampleType::Wes, DatasetType::Alignment),
        ..request(&[], 0)
    };

    let first = reconciler.reconcile(&bams, &AlwaysNo).unwrap();
    let update = reconciler
        .record_alignment_files(&first.report, &manifest.records)
        .unwrap();
    assert_eq!(update.updated.len(), 2);
    assert!(update.unchanged.is_empty());
    assert_eq!(update.skipped, vec!["ZZZ"]);
    let snapshot = reconciler.store().snapshot().unwrap();
    let s2 = snapshot
        .fetch_project_individuals(&project())
        .unwrap()
        .into_iter()
        .find(|individual| individual.individual_id == "S2")
        .unwrap();
    let file = snapshot.alignment_file(&s2.guid).unwrap().unwrap();
    assert_eq!(file.file_path, "/crams/S2.cram");
    assert_eq!(file.sample_id.as_deref(), Some("S2_wgs"));

    let again = reconciler.reconcile(&bams, &AlwaysNo).unwrap();
    let update = reconciler
        .record_alignment_files(&again.report, &manifest.records)
        .unwrap();
    assert!(update.updated.is_empty());
    assert_eq!(update.unchanged, vec!["S1", "S2"]);
    assert_eq!(update.revision, Some(snapshot.revision));

    let moved = parse_alignment_manifest("S1\t/bams/S1.v2.bam\nS2\t/crams/S2.cram\n").unwrap();
    let update = reconciler
        .record_alignment_files(&again.report, &moved.records)
        .unwrap();
    assert_eq!(update.updated.len(), 1);
    assert_eq!(update.updated[0].file_path, "/bams/S1.v2.bam");
    assert_eq!(update.unchanged, vec!["S2"]);
}

#[test]
fn same_inputs_resolve_the_same_way_on_fresh_stores() {
    let individuals = ["NA100", "NA101", "HG002", "HG003", "S1", "Sx"];
    let ids = ["NA100b", "NA10", "HG02", "S1x", "HG003", "ZZZ9"];
    let run = || {
        let reconciler = Reconciler::new(seeded_store(&individuals), MockIngestion::default());
        let report = reconciler.reconcile(&request(&ids, 2), &AlwaysNo).unwrap().report;
        let matched = report
            .matches
            .iter()
            .map(|line| {
                (
                    line.external_id.clone(),
                    line.individual_guid.clone(),
                    line.sample_guid.clone(),
                    line.distance,
                )
            })
            .collect::<Vec<_>>();
        (matched, report.unmatched_ids, report.ambiguous_matches)
    };

    let first = run();
    let second = run();

    assert_eq!(first, second);
    let matched = first.0.iter().map(|m| m.0.as_str()).collect::<Vec<_>>();
    assert_eq!(matched, vec!["HG003", "HG02", "NA100b"]);
    assert_eq!(first.1, vec!["NA10", "S1x", "ZZZ9"]);
    assert_eq!(first.2.len(), 2);
}

#[test]
fn imported_individuals_share_families() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    let rows = vec![
        ("FAM2".to_string(), "NA2".to_string()),
        ("FAM2".to_string(), "NA3".to_string()),
        ("FAM_S1".to_string(), "S1".to_string()),
    ];

    let result = reconciler.import_individuals(&project(), &rows).unwrap();

    assert_eq!(result.created.len(), 2);
    assert_eq!(result.created[0].family_guid, result.created[1].family_guid);
    assert_eq!(result.skipped, vec!["S1"]);
}

#[test]
fn mark_loaded_needs_an_existing_dataset() {
    let reconciler = Reconciler::new(seeded_store(&["S1"]), MockIngestion::default());
    assert_matches!(
        reconciler.mark_loaded(&project(), AnalysisType::VariantCalls, SOURCE),
        Err(ReconcileError::InvalidInput(_))
    );
}
