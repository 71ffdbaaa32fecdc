// src/classify/llm.rs
//! OpenAI-compatible chat-completions classifier.
//!
//! The model is asked for a JSON array with exactly one object per input, in
//! input order. Code fences around the array are tolerated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ClassifyError, ClassifyInput, Classifier, RawLabel};
use crate::config::ClassifierConfig;
use crate::taxonomy::Category;

/// Longest body excerpt sent per article.
const BODY_CHARS: usize = 600;

pub struct LlmClassifier {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl LlmClassifier {
    pub fn new(api_key: impl Into<String>, cfg: &ClassifierConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("market-news-pipeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            endpoint: format!("{}/chat/completions", cfg.base_url.trim_end_matches('/')),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }
}

fn system_prompt() -> String {
    let mut s = String::from(
        "You categorize financial news articles. For each numbered article pick exactly one \
         category from this list:\n",
    );
    for c in Category::ASSIGNABLE {
        s.push_str(&format!("- {}: {}\n", c.as_str(), c.describe()));
    }
    s.push_str(
        "Also give a short secondary label (a few words, or \"\" if nothing fits).\n\
         Reply with ONLY a JSON array, one object per article, in the same order: \
         [{\"category\": \"...\", \"secondary_label\": \"...\"}]",
    );
    s
}

fn user_prompt(batch: &[ClassifyInput]) -> String {
    let mut s = String::new();
    for (i, item) in batch.iter().enumerate() {
        let body: String = item.body.chars().take(BODY_CHARS).collect();
        s.push_str(&format!("{}. {}\n{}\n\n", i + 1, item.title, body));
    }
    s
}

/// Pull the label array out of a model reply.
pub fn parse_labels(content: &str) -> Result<Vec<RawLabel>, ClassifyError> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Reply {
        List(Vec<RawLabel>),
        Wrapped { results: Vec<RawLabel> },
    }

    match serde_json::from_str::<Reply>(unfenced) {
        Ok(Reply::List(v)) | Ok(Reply::Wrapped { results: v }) => Ok(v),
        Err(e) => Err(ClassifyError::Malformed(e.to_string())),
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, batch: &[ClassifyInput]) -> Result<Vec<RawLabel>, ClassifyError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let sys = system_prompt();
        let user = user_prompt(batch);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &sys,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.temperature,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| ClassifyError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ClassifyError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ClassifyError::from_status(status.as_u16(), text));
        }

        let body: Resp =
            serde_json::from_str(&text).map_err(|e| ClassifyError::Malformed(e.to_string()))?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ClassifyError::Malformed("no choices in response".into()))?;
        parse_labels(content)
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}
