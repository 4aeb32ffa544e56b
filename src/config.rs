use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::resolver::FuzzyEligibility;

pub const CONFIG_FILE_NAME: &str = "seqr-reconcile.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionPolicy {
    #[default]
    Ask,
    Yes,
    No,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store_path: Option<String>,
    #[serde(default)]
    pub max_edit_distance: Option<usize>,
    #[serde(default)]
    pub fuzzy_eligibility: Option<FuzzyEligibility>,
    #[serde(default)]
    pub provision: Option<ProvisionPolicy>,
    #[serde(default)]
    pub ingestion: Option<IngestionEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionEntry {
    Webhook(String),
    Log,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionTarget {
    Log,
    Webhook(String),
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub store_path: Utf8PathBuf,
    pub max_edit_distance: usize,
    pub fuzzy_eligibility: FuzzyEligibility,
    pub provision: ProvisionPolicy,
    pub ingestion: IngestionTarget,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit `path` must exist. Without one, `./seqr-reconcile.json` and then the user
    /// config directory are tried, and defaults apply if neither exists.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, ReconcileError> {
        let config_path = match path {
            Some(path) => Some(PathBuf::from(path)),
            None => Self::discover(),
        };

        let config = match config_path {
            Some(config_path) => {
                let content = fs::read_to_string(&config_path)
                    .map_err(|_| ReconcileError::ConfigRead(config_path.clone()))?;
                serde_json::from_str(&content)
                    .map_err(|err| ReconcileError::ConfigParse(err.to_string()))?
            }
            None => Config::default(),
        };

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ReconcileError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(ReconcileError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let ingestion = match config.ingestion {
            None | Some(IngestionEntry::Log) => IngestionTarget::Log,
            Some(IngestionEntry::Webhook(url)) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ReconcileError::ConfigParse(format!(
                        "ingestion webhook must be an http(s) url: {url}"
                    )));
                }
                IngestionTarget::Webhook(url)
            }
        };

        Ok(ResolvedConfig {
            schema_version,
            store_path: config
                .store_path
                .map(Utf8PathBuf::from)
                .unwrap_or_else(default_store_path),
            max_edit_distance: config.max_edit_distance.unwrap_or(0),
            fuzzy_eligibility: config.fuzzy_eligibility.unwrap_or_default(),
            provision: config.provision.unwrap_or_default(),
            ingestion,
        })
    }

    fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        ProjectDirs::from("org", "seqr", "seqr-reconcile")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }
}

pub fn default_store_path() -> Utf8PathBuf {
    Utf8PathBuf::from(".seqr-reconcile").join("records.json")
}
