use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

static PROJECT_GUID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^R\d{4}_[A-Za-z0-9_\-]+$").expect("valid project guid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
#[value(rename_all = "UPPERCASE")]
pub enum SampleType {
    Wes,
    Wgs,
    Rna,
    Array,
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleType::Wes => write!(f, "WES"),
            SampleType::Wgs => write!(f, "WGS"),
            SampleType::Rna => write!(f, "RNA"),
            SampleType::Array => write!(f, "ARRAY"),
        }
    }
}

impl FromStr for SampleType {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "WES" => Ok(SampleType::Wes),
            "WGS" => Ok(SampleType::Wgs),
            "RNA" => Ok(SampleType::Rna),
            "ARRAY" => Ok(SampleType::Array),
            _ => Err(ReconcileError::InvalidInput(format!(
                "unsupported sample type: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
#[value(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Variants,
    Sv,
    Alignment,
}

impl DatasetType {
    /// Whether samples of `sample_type` can carry this kind of data.
    pub fn supports(&self, sample_type: SampleType) -> bool {
        match self {
            DatasetType::Variants => true,
            DatasetType::Sv => matches!(sample_type, SampleType::Wes | SampleType::Wgs),
            DatasetType::Alignment => !matches!(sample_type, SampleType::Array),
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetType::Variants => write!(f, "VARIANTS"),
            DatasetType::Sv => write!(f, "SV"),
            DatasetType::Alignment => write!(f, "ALIGNMENT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[value(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisType {
    VariantCalls,
    Alignment,
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisType::VariantCalls => write!(f, "VARIANT_CALLS"),
            AnalysisType::Alignment => write!(f, "ALIGNMENT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum GenomeBuild {
    #[serde(rename = "37")]
    #[value(name = "37")]
    Grch37,
    #[serde(rename = "38")]
    #[value(name = "38")]
    Grch38,
}

impl fmt::Display for GenomeBuild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenomeBuild::Grch37 => write!(f, "37"),
            GenomeBuild::Grch38 => write!(f, "38"),
        }
    }
}

impl FromStr for GenomeBuild {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_start_matches("GRCh") {
            "37" => Ok(GenomeBuild::Grch37),
            "38" => Ok(GenomeBuild::Grch38),
            _ => Err(ReconcileError::InvalidInput(format!(
                "unsupported genome build: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectGuid(String);

impl ProjectGuid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectGuid {
    type Err = ReconcileError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !PROJECT_GUID_RE.is_match(trimmed) {
            return Err(ReconcileError::InvalidInput(format!(
                "malformed project guid: {value}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for ProjectGuid {
    type Error = ReconcileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProjectGuid> for String {
    fn from(value: ProjectGuid) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub guid: ProjectGuid,
    pub name: String,
    pub genome_build: GenomeBuild,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub guid: String,
    pub family_id: String,
    pub project: ProjectGuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualRecord {
    pub guid: String,
    pub individual_id: String,
    pub family_guid: String,
    pub project: ProjectGuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub guid: String,
    pub sample_id: String,
    pub sample_type: SampleType,
    pub dataset_type: DatasetType,
    pub individual_guid: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStatus {
    Created,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntity {
    pub guid: String,
    pub analysis_type: AnalysisType,
    pub source_locator: String,
    pub project: ProjectGuid,
    pub sample_guids: BTreeSet<String>,
    pub is_loaded: bool,
    pub loading_status: LoadingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub loaded_at: Option<DateTime<Utc>>,
}

/// The alignment file on record for an individual, as uploaded from a BAM/CRAM manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentFile {
    pub individual_guid: String,
    pub file_path: String,
    /// Sample id inside the file, when it differs from the individual id.
    #[serde(default)]
    pub sample_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Lowercased, underscore-joined form of a human id, used as the readable tail of a guid.
pub fn guid_slug(value: &str) -> String {
    let slug = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    slug.chars().take(20).collect()
}
