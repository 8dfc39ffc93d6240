//! Text Completion Service used by the support chat

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::Error;
use crate::fetch::Fetch;

/// Interface of the completion backend: one prompt in, one answer out
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, Error>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

/// Client for a `models/{model}:generateContent` REST endpoint
pub struct GenerativeClient {
    url: String,
    key: String,
    model: String,
    client: Client,
}

impl GenerativeClient {
    pub fn new(url: &str, key: &str, model: &str, client: Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            model: model.to_string(),
            client,
        }
    }

    /// Build from the completion settings of a backend configuration
    pub fn from_config(config: &BackendConfig, client: Client) -> Self {
        Self::new(
            &config.completion_url,
            &config.completion_key,
            &config.completion_model,
            client,
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.url, self.model)
    }
}

#[async_trait]
impl TextCompletion for GenerativeClient {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        debug!("Requesting completion from {} ({} chars)", self.model, prompt.len());
        let response: GenerateResponse = Fetch::post(&self.client, &self.endpoint())
            .header("x-goog-api-key", &self.key)
            .json(&request)?
            .execute()
            .await?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        let text = text.trim();
        if text.is_empty() {
            return Err(Error::completion("no candidate text in response"));
        }
        Ok(text.to_string())
    }
}

/// Answers from a fixed script, then a fallback line.
/// Records every prompt it receives.
pub struct CannedCompletion {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl CannedCompletion {
    pub fn new(fallback: &str) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: fallback.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a reply to be returned before the fallback
    pub fn with_reply(self, reply: &str) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply.to_string());
        self
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TextCompletion for CannedCompletion {
    async fn generate(&self, prompt: &str) -> Result<String, Error> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        Ok(reply.unwrap_or_else(|| self.fallback.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_generate_reads_first_candidate() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/test-model:generateContent"))
            .and(header("x-goog-api-key", "ai-key"))
            .and(body_json(json!({
                "contents": [{ "parts": [{ "text": "How do I earn points?" }] }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {
                        "role": "model",
                        "parts": [{ "text": "Post a donation offer. " }, { "text": "An admin confirms it." }]
                    }
                }]
            })))
            .mount(&mock_server)
            .await;

        let client = GenerativeClient::new(&mock_server.uri(), "ai-key", "test-model", Client::new());
        let text = client.generate("How do I earn points?").await.unwrap();
        assert_eq!(text, "Post a donation offer. An admin confirms it.");
    }

    #[tokio::test]
    async fn test_empty_candidates_are_completion_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .mount(&mock_server)
            .await;

        let client = GenerativeClient::new(&mock_server.uri(), "ai-key", "test-model", Client::new());
        assert!(matches!(
            client.generate("hello").await,
            Err(Error::Completion(_))
        ));
    }

    #[tokio::test]
    async fn test_quota_errors_surface_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota exceeded"))
            .mount(&mock_server)
            .await;

        let client = GenerativeClient::new(&mock_server.uri(), "ai-key", "test-model", Client::new());
        match client.generate("hello").await {
            Err(Error::Api { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_canned_replies_then_fallback() {
        let canned = CannedCompletion::new("An administrator will follow up.").with_reply("Hi!");
        assert_eq!(canned.generate("one").await.unwrap(), "Hi!");
        assert_eq!(
            canned.generate("two").await.unwrap(),
            "An administrator will follow up."
        );
        assert_eq!(canned.prompts(), vec!["one".to_string(), "two".to_string()]);
    }
}
