//! Pulls sample identifiers out of the files a reconciliation starts from.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use serde::Serialize;

use crate::error::ReconcileError;

const VCF_FIXED_COLUMNS: usize = 9;
const ALIGNMENT_EXTENSIONS: &[&str] = &[".bam", ".cram"];

fn reject_remote(path: &Path) -> Result<(), ReconcileError> {
    let display = path.to_string_lossy();
    if display.contains("://") {
        return Err(ReconcileError::UnsupportedSource(display.into_owned()));
    }
    if !path.is_file() {
        return Err(ReconcileError::InvalidInput(format!("{display} not found")));
    }
    Ok(())
}

fn open_text(path: &Path) -> Result<Box<dyn BufRead>, ReconcileError> {
    reject_remote(path)?;
    let file = File::open(path)
        .map_err(|err| ReconcileError::Filesystem(format!("open {}: {err}", path.display())))?;
    let gzipped = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "gz" | "bgz"));
    let reader: Box<dyn Read> = if gzipped {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::new(reader)))
}

/// Sample ids from the `#CHROM` header line of a VCF, plain or gzip/bgzip compressed.
pub fn read_vcf_sample_ids(path: &Path) -> Result<Vec<String>, ReconcileError> {
    let reader = open_text(path)?;
    for line in reader.lines() {
        let line = line.map_err(|err| {
            ReconcileError::InvalidInput(format!("unreadable VCF {}: {err}", path.display()))
        })?;
        if line.starts_with("#CHROM") {
            return parse_vcf_header_line(&line);
        }
        if !line.starts_with('#') {
            break;
        }
    }
    Err(ReconcileError::InvalidInput(format!(
        "no #CHROM header line in {}",
        path.display()
    )))
}

pub fn parse_vcf_header_line(line: &str) -> Result<Vec<String>, ReconcileError> {
    let fields = line.trim_end_matches(['\r', '\n']).split('\t').collect::<Vec<_>>();
    if fields.len() < VCF_FIXED_COLUMNS {
        return Err(ReconcileError::InvalidInput(format!(
            "VCF header has {} columns, expected at least {VCF_FIXED_COLUMNS}",
            fields.len()
        )));
    }
    let samples = fields[VCF_FIXED_COLUMNS..]
        .iter()
        .map(|field| field.trim().to_string())
        .collect::<Vec<_>>();
    if let Some(bad) = samples.iter().find(|id| id.is_empty() || id.contains(char::is_whitespace)) {
        return Err(ReconcileError::InvalidInput(format!(
            "invalid VCF sample column: {bad:?}"
        )));
    }
    Ok(samples)
}

/// One id per line, as exported from an index's sample list. Blank lines and `#` comments
/// are skipped.
pub fn read_sample_list(path: &Path) -> Result<Vec<String>, ReconcileError> {
    let reader = open_text(path)?;
    let mut ids = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|err| ReconcileError::Filesystem(err.to_string()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        ids.push(trimmed.to_string());
    }
    Ok(ids)
}

fn split_row(line: &str) -> Vec<String> {
    let delimiter = if line.contains('\t') { '\t' } else { ',' };
    line.split(delimiter)
        .map(|cell| cell.trim().to_string())
        .collect()
}

fn data_rows(text: &str) -> impl Iterator<Item = (usize, Vec<String>)> + '_ {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(number, line)| (number + 1, split_row(line)))
}

/// Two columns, sample id then individual id.
pub fn parse_id_mapping(text: &str) -> Result<HashMap<String, String>, ReconcileError> {
    let mut mapping = HashMap::new();
    for (number, row) in data_rows(text) {
        let [sample_id, individual_id] = row.as_slice() else {
            return Err(ReconcileError::InvalidInput(format!(
                "mapping file line {number}: must contain 2 columns: {}",
                row.join(", ")
            )));
        };
        mapping.insert(sample_id.clone(), individual_id.clone());
    }
    Ok(mapping)
}

pub fn read_id_mapping(path: &Path) -> Result<HashMap<String, String>, ReconcileError> {
    reject_remote(path)?;
    let text = fs::read_to_string(path)
        .map_err(|err| ReconcileError::Filesystem(format!("read {}: {err}", path.display())))?;
    parse_id_mapping(&text)
}

/// Pedigree rows of `family_id, individual_id`.
pub fn parse_individual_rows(text: &str) -> Result<Vec<(String, String)>, ReconcileError> {
    data_rows(text)
        .map(|(number, row)| match row.as_slice() {
            [family_id, individual_id] if !family_id.is_empty() && !individual_id.is_empty() => {
                Ok((family_id.clone(), individual_id.clone()))
            }
            _ => Err(ReconcileError::InvalidInput(format!(
                "individuals file line {number}: must contain family id and individual id: {}",
                row.join(", ")
            ))),
        })
        .collect()
}

pub fn read_individual_rows(path: &Path) -> Result<Vec<(String, String)>, ReconcileError> {
    reject_remote(path)?;
    let text = fs::read_to_string(path)
        .map_err(|err| ReconcileError::Filesystem(format!("read {}: {err}", path.display())))?;
    parse_individual_rows(&text)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlignmentRecord {
    pub individual_id: String,
    pub file_path: String,
    pub sample_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidAlignmentRow {
    pub individual_id: String,
    pub file_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlignmentManifest {
    pub records: Vec<AlignmentRecord>,
    pub invalid: Vec<InvalidAlignmentRow>,
}

impl AlignmentManifest {
    /// Individual ids with at least one usable alignment file, in first-seen order.
    pub fn external_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.records
            .iter()
            .filter(|record| seen.insert(record.individual_id.as_str()))
            .map(|record| record.individual_id.clone())
            .collect()
    }
}

/// Rows of `individual_id, file_path[, sample_id]`, tab- or comma-separated.
///
/// A row with the wrong number of columns rejects the whole manifest. Rows whose file is
/// not a `.bam` or `.cram` are kept aside in `invalid`.
pub fn parse_alignment_manifest(text: &str) -> Result<AlignmentManifest, ReconcileError> {
    let mut manifest = AlignmentManifest::default();
    for (number, row) in data_rows(text) {
        if !(2..=3).contains(&row.len()) {
            return Err(ReconcileError::InvalidInput(format!(
                "manifest line {number}: must contain 2 or 3 columns: {}",
                row.join(", ")
            )));
        }
        let individual_id = row[0].clone();
        let file_path = row[1].clone();
        if !ALIGNMENT_EXTENSIONS
            .iter()
            .any(|suffix| file_path.ends_with(suffix))
        {
            manifest.invalid.push(InvalidAlignmentRow {
                individual_id,
                reason: format!(
                    "invalid file extension, valid extensions are {}",
                    ALIGNMENT_EXTENSIONS.join(", ")
                ),
                file_path,
            });
            continue;
        }
        let sample_id = row.get(2).filter(|id| !id.is_empty()).cloned();
        manifest.records.push(AlignmentRecord {
            individual_id,
            file_path,
            sample_id,
        });
    }
    Ok(manifest)
}

pub fn read_alignment_manifest(path: &Path) -> Result<AlignmentManifest, ReconcileError> {
    reject_remote(path)?;
    let text = fs::read_to_string(path)
        .map_err(|err| ReconcileError::Filesystem(format!("read {}: {err}", path.display())))?;
    parse_alignment_manifest(&text)
}
