use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::graph::WorkflowDocument;

/// Body of `POST /prompt`.
#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    prompt: &'a WorkflowDocument,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct PromptResponse {
    prompt_id: String,
}

/// A file produced by an output node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_artifact_type")]
    pub folder_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullpath: Option<String>,
}

fn default_artifact_type() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub gifs: Vec<Artifact>,
    #[serde(default)]
    pub videos: Vec<Artifact>,
    #[serde(default)]
    pub images: Vec<Artifact>,
}

impl NodeOutput {
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.gifs.iter().chain(&self.videos).chain(&self.images)
    }
}

/// Entry of `GET /history/{job}` for a finished job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobHistory {
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, payload]` pairs recorded while the job ran.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

impl JobStatus {
    pub fn is_error(&self) -> bool {
        self.status_str == "error"
    }

    /// Node id and message of the recorded `execution_error`, if any.
    pub fn execution_error(&self) -> Option<(String, String)> {
        self.messages
            .iter()
            .find(|(name, _)| name == "execution_error")
            .map(|(_, payload)| {
                let field = |key: &str| {
                    payload
                        .get(key)
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or_default()
                        .trim()
                        .to_string()
                };
                (field("node_id"), field("exception_message"))
            })
    }
}

impl JobHistory {
    /// Artifacts grouped by the node that produced them; nodes without any
    /// files are omitted.
    pub fn artifacts(&self) -> Vec<(&str, Vec<&Artifact>)> {
        self.outputs
            .iter()
            .map(|(node_id, output)| (node_id.as_str(), output.artifacts().collect::<Vec<_>>()))
            .filter(|(_, artifacts)| !artifacts.is_empty())
            .collect()
    }

    /// Fails when the engine recorded the job as errored.
    pub fn ensure_succeeded(&self, job_id: &str) -> Result<()> {
        let Some(status) = self.status.as_ref().filter(|status| status.is_error()) else {
            return Ok(());
        };
        match status.execution_error() {
            Some((node_id, message)) if !node_id.is_empty() => {
                bail!("job {job_id} failed on node {node_id}: {message}")
            }
            Some((_, message)) if !message.is_empty() => bail!("job {job_id} failed: {message}"),
            _ => bail!("job {job_id} failed without an error message"),
        }
    }
}

/// HTTP client for the node execution engine.
#[derive(Debug)]
pub struct EngineClient {
    base_url: Url,
    client_id: String,
    client: reqwest::Client,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid engine base URL")?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url,
            client_id: Uuid::new_v4().to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("failed to build URL for path: {path}"))
    }

    /// Queues a workflow via `POST /prompt` and returns the job id.
    pub async fn submit(&self, document: &WorkflowDocument) -> Result<String> {
        let url = self.url("/prompt")?;
        let body = PromptRequest {
            prompt: document,
            client_id: &self.client_id,
        };
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("failed to reach execution engine")?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = resp.text().await.unwrap_or_default();
            bail!("engine /prompt returned HTTP {status}: {}", detail.trim());
        }

        let queued: PromptResponse = resp
            .json()
            .await
            .context("failed to parse /prompt response")?;
        info!(job_id = %queued.prompt_id, "Queued workflow");
        Ok(queued.prompt_id)
    }

    /// `GET /history/{job}`; `None` while the job has not finished.
    pub async fn history(&self, job_id: &str) -> Result<Option<JobHistory>> {
        let url = self.url(&format!("/history/{job_id}"))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch history for job {job_id}"))?;

        if !resp.status().is_success() {
            bail!(
                "engine /history/{job_id} returned HTTP {}",
                resp.status().as_u16()
            );
        }

        let mut entries: BTreeMap<String, JobHistory> = resp
            .json()
            .await
            .context("failed to parse history response")?;
        Ok(entries.remove(job_id))
    }

    /// Polls history until the job finishes or `timeout` elapses. A job the
    /// engine marked as errored is returned as an error.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<JobHistory> {
        let started = Instant::now();
        loop {
            if let Some(history) = self.history(job_id).await? {
                info!(job_id, elapsed = ?started.elapsed(), "Job finished");
                history.ensure_succeeded(job_id)?;
                return Ok(history);
            }
            if started.elapsed() >= timeout {
                bail!("job {job_id} did not finish within {}s", timeout.as_secs());
            }
            debug!(job_id, "Job still running");
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Downloads one artifact via `GET /view`.
    pub async fn fetch_artifact(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        let url = self.url("/view")?;
        let resp = self
            .client
            .get(url)
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.folder_type.as_str()),
            ])
            .send()
            .await
            .with_context(|| format!("failed to fetch artifact {}", artifact.filename))?;

        if !resp.status().is_success() {
            bail!(
                "engine /view?filename={} returned HTTP {}",
                artifact.filename,
                resp.status().as_u16()
            );
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read artifact {}", artifact.filename))?;
        Ok(bytes.to_vec())
    }
}
