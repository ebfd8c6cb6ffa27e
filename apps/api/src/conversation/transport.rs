use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::conversation::context::ContextResolution;
use crate::conversation::locator::ThreadLocation;
use crate::conversation::turn::{AssistantTurnRequest, AssistantTurnResponse};
use crate::models::conversation::ConversationMessage;

/// What a conversation session needs from the backend.
#[async_trait]
pub trait TurnBackend: Send + Sync {
    async fn locate_thread(&self, analysis_id: Uuid) -> Result<ThreadLocation>;

    async fn fetch_context(
        &self,
        analysis_id: Uuid,
        section: Option<&str>,
    ) -> Result<Option<ContextResolution>>;

    /// Visible transcript, oldest first.
    async fn load_transcript(&self, analysis_id: Uuid) -> Result<Vec<ConversationMessage>>;

    async fn send_turn(&self, request: &AssistantTurnRequest) -> Result<AssistantTurnResponse>;
}

/// `TurnBackend` over the service's HTTP API.
#[derive(Clone)]
pub struct HttpTurnBackend {
    client: Client,
    base_url: String,
}

impl HttpTurnBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            // Above the server's worst-case poll ceiling.
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .context("Failed to build HTTP client")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned an error status"))?;
        response
            .json()
            .await
            .with_context(|| format!("GET {url} returned an unexpected body"))
    }
}

#[async_trait]
impl TurnBackend for HttpTurnBackend {
    async fn locate_thread(&self, analysis_id: Uuid) -> Result<ThreadLocation> {
        self.get_json(&format!("/api/v1/conversations/{analysis_id}/thread"), &[])
            .await
    }

    async fn fetch_context(
        &self,
        analysis_id: Uuid,
        section: Option<&str>,
    ) -> Result<Option<ContextResolution>> {
        let query: Vec<(&str, &str)> = section.map(|s| ("section", s)).into_iter().collect();
        let resolution: ContextResolution = self
            .get_json(
                &format!("/api/v1/conversations/{analysis_id}/context"),
                &query,
            )
            .await?;
        Ok(Some(resolution))
    }

    async fn load_transcript(&self, analysis_id: Uuid) -> Result<Vec<ConversationMessage>> {
        self.get_json(&format!("/api/v1/conversations/{analysis_id}/messages"), &[])
            .await
    }

    async fn send_turn(&self, request: &AssistantTurnRequest) -> Result<AssistantTurnResponse> {
        let url = format!("{}/api/v1/assistant-turn", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {url} returned an error status"))?;
        response
            .json()
            .await
            .with_context(|| format!("POST {url} returned an unexpected body"))
    }
}
