use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;

use crate::config::IngestionTarget;
use crate::domain::DatasetEntity;
use crate::error::ReconcileError;

/// Hook into the external loading pipeline. Fire-and-forget: the only thing reported back
/// is whether the request was accepted.
pub trait IngestionTrigger {
    fn trigger(&self, dataset: &DatasetEntity) -> bool;
}

impl<T: IngestionTrigger + ?Sized> IngestionTrigger for Box<T> {
    fn trigger(&self, dataset: &DatasetEntity) -> bool {
        (**self).trigger(dataset)
    }
}

pub fn trigger_for(target: &IngestionTarget) -> Result<Box<dyn IngestionTrigger>, ReconcileError> {
    Ok(match target {
        IngestionTarget::Log => Box::new(LogIngestion),
        IngestionTarget::Webhook(url) => Box::new(WebhookIngestion::new(url)?),
    })
}

/// Records the request in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogIngestion;

impl IngestionTrigger for LogIngestion {
    fn trigger(&self, dataset: &DatasetEntity) -> bool {
        tracing::info!(
            dataset = %dataset.guid,
            source = %dataset.source_locator,
            samples = dataset.sample_guids.len(),
            "loading dataset"
        );
        true
    }
}

#[derive(Debug, Serialize)]
struct IngestionRequest<'a> {
    dataset_guid: &'a str,
    project: &'a str,
    analysis_type: String,
    source_locator: &'a str,
    sample_guids: Vec<&'a str>,
}

/// POSTs the dataset to a loading service.
#[derive(Clone)]
pub struct WebhookIngestion {
    client: Client,
    url: String,
}

impl WebhookIngestion {
    pub fn new(url: &str) -> Result<Self, ReconcileError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("seqr-reconcile/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ReconcileError::collaborator("ingestion", err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| ReconcileError::collaborator("ingestion", err.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl IngestionTrigger for WebhookIngestion {
    fn trigger(&self, dataset: &DatasetEntity) -> bool {
        let body = IngestionRequest {
            dataset_guid: &dataset.guid,
            project: dataset.project.as_str(),
            analysis_type: dataset.analysis_type.to_string(),
            source_locator: &dataset.source_locator,
            sample_guids: dataset.sample_guids.iter().map(String::as_str).collect(),
        };
        match self.client.post(&self.url).json(&body).send() {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    status = response.status().as_u16(),
                    url = %self.url,
                    "ingestion request rejected"
                );
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, url = %self.url, "ingestion request failed");
                false
            }
        }
    }
}
