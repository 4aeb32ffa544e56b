use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use seqr_reconcile::app::{ReconcileRequest, ReconcileResult, Reconciler};
use seqr_reconcile::config::{ConfigLoader, ProvisionPolicy, ResolvedConfig};
use seqr_reconcile::domain::{AnalysisType, DatasetType, GenomeBuild, ProjectGuid, SampleType};
use seqr_reconcile::error::ReconcileError;
use seqr_reconcile::ingestion::{IngestionTrigger, trigger_for};
use seqr_reconcile::output::{JsonOutput, OutputMode, TextOutput};
use seqr_reconcile::report::{AlwaysNo, AlwaysYes, ConsolePrompt, ProvisionDecision};
use seqr_reconcile::resolver::{FuzzyEligibility, ResolveOptions};
use seqr_reconcile::sources;
use seqr_reconcile::store::JsonStore;

const UNMATCHED_EXIT_CODE: u8 = 5;

#[derive(Parser)]
#[command(name = "seqr-reconcile")]
#[command(about = "Match sequencing sample ids against a project's individuals and link datasets")]
#[command(version)]
struct Cli {
    /// Path to seqr-reconcile.json
    #[arg(long, global = true)]
    config: Option<String>,

    /// Overrides the record store path from the config
    #[arg(long, global = true)]
    store: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    /// Never prompt; unmatched ids are not provisioned unless --provision yes is given
    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Reconcile the samples of a VCF callset")]
    Vcf(VcfArgs),
    #[command(about = "Reconcile a sample list exported from a variant index")]
    Index(IndexArgs),
    #[command(about = "Reconcile a BAM/CRAM manifest")]
    Bams(BamsArgs),
    #[command(about = "Create a project in the record store")]
    InitProject(InitProjectArgs),
    #[command(about = "Add families and individuals from a two-column file")]
    AddIndividuals(AddIndividualsArgs),
    #[command(about = "Record that a dataset finished loading")]
    MarkLoaded(MarkLoadedArgs),
}

#[derive(Args, Clone)]
struct MatchArgs {
    /// Project guid, e.g. R0001_cmg
    #[arg(long)]
    project: ProjectGuid,

    #[arg(long, value_enum)]
    sample_type: SampleType,

    #[arg(long, value_parser = parse_genome_build)]
    genome_build: Option<GenomeBuild>,

    /// Fuzzy-match ids closer than this many edits to an individual id; 0 disables
    #[arg(long)]
    max_edit_distance: Option<usize>,

    #[arg(long, value_enum)]
    fuzzy_eligibility: Option<FuzzyEligibility>,

    /// Two columns: sample id, individual id
    #[arg(long)]
    mapping_file: Option<PathBuf>,

    /// Report what would happen without writing anything
    #[arg(long, alias = "validate-only")]
    dry_run: bool,

    /// Write nothing when any id stays unmatched
    #[arg(long)]
    fail_on_unmatched: bool,

    /// Whether to create families and individuals for unmatched ids
    #[arg(long, value_enum)]
    provision: Option<ProvisionPolicy>,
}

#[derive(Args)]
struct VcfArgs {
    path: PathBuf,

    #[arg(long, value_enum, default_value_t = DatasetType::Variants)]
    dataset_type: DatasetType,

    #[command(flatten)]
    matching: MatchArgs,
}

#[derive(Args)]
struct IndexArgs {
    /// One sample id per line
    sample_list: PathBuf,

    /// Index the samples were loaded into; identifies the dataset
    #[arg(long)]
    index_name: String,

    #[arg(long, value_enum, default_value_t = DatasetType::Variants)]
    dataset_type: DatasetType,

    #[command(flatten)]
    matching: MatchArgs,
}

#[derive(Args)]
struct BamsArgs {
    /// Rows of individual id, file path and an optional sample id
    manifest: PathBuf,

    #[command(flatten)]
    matching: MatchArgs,
}

#[derive(Args)]
struct InitProjectArgs {
    guid: ProjectGuid,

    #[arg(long)]
    name: String,

    #[arg(long, value_parser = parse_genome_build)]
    genome_build: GenomeBuild,
}

#[derive(Args)]
struct AddIndividualsArgs {
    #[arg(long)]
    project: ProjectGuid,

    /// Two columns: family id, individual id
    path: PathBuf,
}

#[derive(Args)]
struct MarkLoadedArgs {
    #[arg(long)]
    project: ProjectGuid,

    #[arg(long, value_enum, default_value_t = AnalysisType::VariantCalls)]
    analysis_type: AnalysisType,

    /// The file path or index name the dataset was linked from
    source: String,
}

fn parse_genome_build(value: &str) -> Result<GenomeBuild, String> {
    value.parse::<GenomeBuild>().map_err(|err| err.to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<ReconcileError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &ReconcileError) -> u8 {
    match error {
        ReconcileError::InvalidInput(_)
        | ReconcileError::UnknownProject(_)
        | ReconcileError::GenomeBuildMismatch { .. }
        | ReconcileError::UnsupportedSource(_) => 2,
        ReconcileError::PersistenceConflict { .. } => 3,
        ReconcileError::StoreLocked { .. }
        | ReconcileError::ExternalCollaborator { .. }
        | ReconcileError::Filesystem(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(store) = &cli.store {
        config.store_path = Utf8PathBuf::from(store.as_str());
    }
    tracing::debug!(store = %config.store_path, "using record store");

    let store = JsonStore::new(config.store_path.clone());
    let ingestion = trigger_for(&config.ingestion)?;
    let reconciler = Reconciler::new(store, ingestion);

    match cli.command {
        Commands::Vcf(args) => {
            let external_ids = sources::read_vcf_sample_ids(&args.path)?;
            let request = match_request(
                &args.matching,
                &config,
                AnalysisType::VariantCalls,
                args.dataset_type,
                args.path.display().to_string(),
                external_ids,
            )?;
            run_reconcile(
                &reconciler,
                &request,
                &args.matching,
                &config,
                cli.non_interactive,
                output_mode,
            )
        }
        Commands::Index(args) => {
            let external_ids = sources::read_sample_list(&args.sample_list)?;
            let request = match_request(
                &args.matching,
                &config,
                AnalysisType::VariantCalls,
                args.dataset_type,
                args.index_name.clone(),
                external_ids,
            )?;
            run_reconcile(
                &reconciler,
                &request,
                &args.matching,
                &config,
                cli.non_interactive,
                output_mode,
            )
        }
        Commands::Bams(args) => {
            let manifest = sources::read_alignment_manifest(&args.manifest)?;
            for row in &manifest.invalid {
                tracing::warn!(
                    individual = %row.individual_id,
                    file = %row.file_path,
                    "{}",
                    row.reason
                );
            }
            let request = match_request(
                &args.matching,
                &config,
                AnalysisType::Alignment,
                DatasetType::Alignment,
                args.manifest.display().to_string(),
                manifest.external_ids(),
            )?;
            let decision = provision_decision(&args.matching, &config, cli.non_interactive);
            let result = reconciler.reconcile(&request, decision.as_ref())?;
            let alignments = if result.halted_on_unmatched() {
                None
            } else {
                Some(reconciler.record_alignment_files(&result.report, &manifest.records)?)
            };
            match output_mode {
                OutputMode::Json => {
                    JsonOutput::print_bams(&result, alignments.as_ref()).into_diagnostic()?
                }
                OutputMode::Text => {
                    TextOutput::print_reconcile(&result).into_diagnostic()?;
                    if let Some(update) = &alignments {
                        TextOutput::print_alignments(update).into_diagnostic()?;
                    }
                }
            }
            Ok(exit_code(&result))
        }
        Commands::InitProject(args) => {
            let project = reconciler.init_project(args.guid, &args.name, args.genome_build)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_project(&project).into_diagnostic()?,
                OutputMode::Text => println!(
                    "Created project {} ({}, GRCh{})",
                    project.guid, project.name, project.genome_build
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::AddIndividuals(args) => {
            let rows = sources::read_individual_rows(&args.path)?;
            let result = reconciler.import_individuals(&args.project, &rows)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_import(&result).into_diagnostic()?,
                OutputMode::Text => {
                    println!("Created {} individuals", result.created.len());
                    if !result.skipped.is_empty() {
                        println!("Already present: {}", result.skipped.join(", "));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::MarkLoaded(args) => {
            let dataset =
                reconciler.mark_loaded(&args.project, args.analysis_type, &args.source)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_dataset(&dataset).into_diagnostic()?,
                OutputMode::Text => println!(
                    "Dataset {} marked loaded ({} samples)",
                    dataset.guid,
                    dataset.sample_guids.len()
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn match_request(
    args: &MatchArgs,
    config: &ResolvedConfig,
    analysis_type: AnalysisType,
    dataset_type: DatasetType,
    source_locator: String,
    external_ids: Vec<String>,
) -> Result<ReconcileRequest, ReconcileError> {
    let id_mapping = match &args.mapping_file {
        Some(path) => sources::read_id_mapping(path)?,
        None => Default::default(),
    };
    let mut options = ResolveOptions::new(args.sample_type, dataset_type);
    options.max_edit_distance = args.max_edit_distance.unwrap_or(config.max_edit_distance);
    options.fuzzy_eligibility = args.fuzzy_eligibility.unwrap_or(config.fuzzy_eligibility);
    options.dry_run = args.dry_run;

    Ok(ReconcileRequest {
        project: args.project.clone(),
        genome_build: args.genome_build,
        analysis_type,
        source_locator,
        external_ids,
        id_mapping,
        options,
        fail_on_unmatched: args.fail_on_unmatched,
    })
}

fn provision_decision(
    args: &MatchArgs,
    config: &ResolvedConfig,
    non_interactive: bool,
) -> Box<dyn ProvisionDecision> {
    match args.provision.unwrap_or(config.provision) {
        ProvisionPolicy::Yes => Box::new(AlwaysYes),
        ProvisionPolicy::No => Box::new(AlwaysNo),
        ProvisionPolicy::Ask if non_interactive || !std::io::stdin().is_terminal() => {
            tracing::debug!("no terminal to ask on; unmatched ids will not be provisioned");
            Box::new(AlwaysNo)
        }
        ProvisionPolicy::Ask => Box::new(ConsolePrompt),
    }
}

fn run_reconcile<T: IngestionTrigger>(
    reconciler: &Reconciler<JsonStore, T>,
    request: &ReconcileRequest,
    args: &MatchArgs,
    config: &ResolvedConfig,
    non_interactive: bool,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let decision = provision_decision(args, config, non_interactive);
    let result = reconciler.reconcile(request, decision.as_ref())?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_reconcile(&result).into_diagnostic()?,
        OutputMode::Text => TextOutput::print_reconcile(&result).into_diagnostic()?,
    }
    Ok(exit_code(&result))
}

fn exit_code(result: &ReconcileResult) -> ExitCode {
    if result.halted_on_unmatched() {
        return ExitCode::from(UNMATCHED_EXIT_CODE);
    }
    ExitCode::SUCCESS
}
