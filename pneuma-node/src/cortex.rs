//! Local model access for Guardians.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pneuma_core::{Assignment, Role, TIMEOUT_SECONDS};
use serde::{Deserialize, Serialize};

const PROPOSER_SYSTEM: &str = "You are the proposer in a two-round expert debate. \
     Answer the user's request directly and precisely.";
const CRITIC_SYSTEM: &str = "You are the critic in a two-round expert debate. \
     Review the proposer's answer to the user's request: point out errors and omissions, \
     then give a corrected answer.";

/// Produces debate content for an assignment.
#[async_trait]
pub trait Cortex: Send + Sync {
    async fn generate(&self, assignment: &Assignment) -> Result<String>;
}

/// OpenAI-compatible `/v1/chat/completions` client.
#[derive(Debug, Clone)]
pub struct HttpCortex {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl HttpCortex {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECONDS))
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Cortex for HttpCortex {
    async fn generate(&self, assignment: &Assignment) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages_for(assignment),
        };
        let response = self
            .http_client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .context("cortex request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("cortex returned {status}: {body}");
        }
        let completion: ChatCompletionResponse =
            response.json().await.context("parsing cortex response")?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("cortex response has no choices")
    }
}

fn messages_for(assignment: &Assignment) -> Vec<ChatMessage> {
    let system = match assignment.role {
        Role::Proposer => PROPOSER_SYSTEM,
        Role::Critic => CRITIC_SYSTEM,
    };
    let user = match &assignment.prior {
        Some(prior) => format!(
            "Request:\n{}\n\nProposer's answer:\n{}",
            assignment.prompt, prior
        ),
        None => assignment.prompt.clone(),
    };
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: system.to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: user,
        },
    ]
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}
