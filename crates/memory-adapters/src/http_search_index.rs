use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use memory_core::connectors::{IndexObject, SearchIndex};
use memory_core::error::MemoryError;
use memory_core::types::SearchHit;

/// HTTP client for the external hybrid search index (C4). The index is a
/// separate service; this adapter only knows its wire contract, never its
/// storage engine.
#[derive(Debug, Clone)]
pub struct HttpSearchIndex {
    client: Client,
    base_url: String,
}

impl HttpSearchIndex {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, MemoryError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MemoryError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn network_err(e: reqwest::Error) -> MemoryError {
    MemoryError::DependencyUnavailable(format!("search index unreachable: {e}"))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MemoryError> {
    if response.status().is_success() {
        Ok(response)
    } else if response.status() == StatusCode::SERVICE_UNAVAILABLE {
        Err(MemoryError::DependencyUnavailable(
            "search index returned 503".to_string(),
        ))
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(MemoryError::SearchIndex(format!(
            "unexpected status {status}: {body}"
        )))
    }
}

#[derive(Serialize)]
struct UpsertObjectRequest {
    id: String,
    actor_id: String,
    memory_id: String,
    text: String,
    creation_time: DateTime<Utc>,
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct SearchRequestBody<'a> {
    actor_id: &'a str,
    memory_id: &'a str,
    query: &'a str,
    query_vector: &'a [f32],
    top_k: usize,
    alpha: f32,
}

#[derive(Deserialize)]
struct SearchResponseBody {
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct ContextResponseBody {
    document: Option<String>,
    creation_time: Option<DateTime<Utc>>,
    score: Option<f32>,
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn upsert_entry(&self, object: IndexObject, embedding: Vec<f32>) -> Result<(), MemoryError> {
        let body = UpsertObjectRequest {
            id: object.id,
            actor_id: object.actor_id,
            memory_id: object.memory_id,
            text: object.text,
            creation_time: object.creation_time,
            embedding,
        };
        let response = self
            .client
            .post(self.url("/v1/entries"))
            .json(&body)
            .send()
            .await
            .map_err(network_err)?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_entry(&self, actor_id: &str, entry_id: &str) -> Result<(), MemoryError> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/entries/{entry_id}")))
            .query(&[("actor_id", actor_id)])
            .send()
            .await
            .map_err(network_err)?;
        check_status(response).await?;
        Ok(())
    }

    async fn upsert_context(&self, object: IndexObject, embedding: Vec<f32>) -> Result<(), MemoryError> {
        let body = UpsertObjectRequest {
            id: object.id,
            actor_id: object.actor_id,
            memory_id: object.memory_id,
            text: object.text,
            creation_time: object.creation_time,
            embedding,
        };
        let response = self
            .client
            .post(self.url("/v1/contexts"))
            .json(&body)
            .send()
            .await
            .map_err(network_err)?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_context(&self, actor_id: &str, context_id: &str) -> Result<(), MemoryError> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/contexts/{context_id}")))
            .query(&[("actor_id", actor_id)])
            .send()
            .await
            .map_err(network_err)?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_vault(&self, actor_id: &str, vault_id: &str) -> Result<(), MemoryError> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/vaults/{vault_id}")))
            .query(&[("actor_id", actor_id)])
            .send()
            .await
            .map_err(network_err)?;
        match check_status(response).await {
            Ok(_) => Ok(()),
            Err(MemoryError::SearchIndex(msg)) if msg.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_memory(&self, actor_id: &str, memory_id: &str) -> Result<(), MemoryError> {
        let response = self
            .client
            .delete(self.url(&format!("/v1/memories/{memory_id}")))
            .query(&[("actor_id", actor_id)])
            .send()
            .await
            .map_err(network_err)?;
        match check_status(response).await {
            Ok(_) => Ok(()),
            Err(MemoryError::SearchIndex(msg)) if msg.contains("404") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn search(
        &self,
        actor_id: &str,
        memory_id: &str,
        query: &str,
        query_vector: &[f32],
        top_k: usize,
        alpha: f32,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let body = SearchRequestBody {
            actor_id,
            memory_id,
            query,
            query_vector,
            top_k,
            alpha,
        };
        let response = self
            .client
            .post(self.url("/v1/search"))
            .json(&body)
            .send()
            .await
            .map_err(network_err)?;
        let response = check_status(response).await?;
        let parsed: SearchResponseBody = response
            .json()
            .await
            .map_err(|e| MemoryError::SearchIndex(format!("malformed search response: {e}")))?;
        Ok(parsed.hits)
    }

    async fn latest_context(
        &self,
        actor_id: &str,
        memory_id: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>, MemoryError> {
        let response = self
            .client
            .get(self.url("/v1/contexts/latest"))
            .query(&[("actor_id", actor_id), ("memory_id", memory_id)])
            .send()
            .await
            .map_err(network_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let parsed: ContextResponseBody = response
            .json()
            .await
            .map_err(|e| MemoryError::SearchIndex(format!("malformed context response: {e}")))?;
        Ok(parsed.document.zip(parsed.creation_time))
    }

    async fn best_context(
        &self,
        actor_id: &str,
        memory_id: &str,
        query: &str,
        query_vector: &[f32],
        alpha: f32,
    ) -> Result<Option<(String, DateTime<Utc>, f32)>, MemoryError> {
        let body = SearchRequestBody {
            actor_id,
            memory_id,
            query,
            query_vector,
            top_k: 1,
            alpha,
        };
        let response = self
            .client
            .post(self.url("/v1/contexts/best"))
            .json(&body)
            .send()
            .await
            .map_err(network_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        let parsed: ContextResponseBody = response
            .json()
            .await
            .map_err(|e| MemoryError::SearchIndex(format!("malformed context response: {e}")))?;
        match (parsed.document, parsed.creation_time, parsed.score) {
            (Some(doc), Some(ts), Some(score)) => Ok(Some((doc, ts, score))),
            _ => Ok(None),
        }
    }

    async fn ping(&self) -> Result<(), MemoryError> {
        let response = self
            .client
            .get(self.url("/healthz"))
            .send()
            .await
            .map_err(network_err)?;
        check_status(response).await?;
        Ok(())
    }
}
