//! Research backend client.
//!
//! Research agents do not edit files: they post their prompt to a
//! chat-completions endpoint and record the answer through the transcript
//! and dataset sinks. Requests carry a Bearer token and honour a 30 s
//! timeout.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::EngineConfig;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

pub struct ResearchClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl ResearchClient {
    /// Returns `None` when no research credential is configured — research
    /// agents are disabled in that case.
    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        let api_key = config.research_api_key.clone()?;
        let client = reqwest::Client::builder()
            .timeout(config.research_timeout)
            .build()
            .ok()?;
        Some(Self {
            client,
            url: config.research_url.clone(),
            model: config.research_model.clone(),
            api_key,
        })
    }

    /// Ask one question; returns the assistant's answer text.
    pub async fn query(&self, system_prompt: &str, question: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": question},
            ],
        });

        debug!(url = %self.url, model = %self.model, "research query");
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("research backend unreachable")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("research backend returned {status}: {text}"));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("research backend returned malformed JSON")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("research backend returned no choices"))
    }
}
