//! Answer-generation backends.
//!
//! Concrete implementations of [`docent_core::generate::Generator`]:
//! - **[`OllamaGenerator`]** uses Ollama's `/api/chat`; streaming replies
//!   arrive as newline-delimited JSON objects.
//! - **[`OpenAiGenerator`]** uses an OpenAI-compatible
//!   `/v1/chat/completions`; streaming replies arrive as SSE `data:` lines.
//!
//! Both render the fused context through [`PromptBuilder`] and send it as a
//! single user message.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use docent_core::generate::{GenerationRequest, Generator, TokenStream};
use docent_core::prompt::PromptBuilder;

use crate::config::GenerationConfig;
use crate::embedding::DEFAULT_OLLAMA_URL;

const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// What one line of a streaming response means.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Token(String),
    Skip,
    Done,
}

/// Splits a byte stream into lines and maps each through `parse`.
///
/// Ends after the first [`StreamLine::Done`], the first error, or the end
/// of the body.
fn line_stream(
    body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    parse: fn(&str) -> Result<StreamLine>,
) -> TokenStream {
    struct State {
        body: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
        buffer: Vec<u8>,
        ready: VecDeque<Result<String>>,
        finished: bool,
    }

    let state = State {
        body,
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                if item.is_err() {
                    state.finished = true;
                    state.ready.clear();
                }
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    // A chunk may end mid-character; decode whole lines only.
                    state.buffer.extend_from_slice(&bytes);
                    while let Some(line_end) = state.buffer.iter().position(|&b| b == b'\n') {
                        let raw: Vec<u8> = state.buffer.drain(..=line_end).collect();
                        let line = String::from_utf8_lossy(&raw);
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match parse(line) {
                            Ok(StreamLine::Token(t)) => state.ready.push_back(Ok(t)),
                            Ok(StreamLine::Skip) => {}
                            Ok(StreamLine::Done) => {
                                state.finished = true;
                                break;
                            }
                            Err(e) => {
                                state.ready.push_back(Err(e));
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => state.ready.push_back(Err(anyhow!("stream interrupted: {}", e))),
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    let rest = String::from_utf8_lossy(&rest);
                    if let Ok(StreamLine::Token(t)) = parse(rest.trim()) {
                        state.ready.push_back(Ok(t));
                    }
                }
            }
        }
    })
    .boxed()
}

async fn check_status(response: reqwest::Response, label: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{} API error {}: {}", label, status, body)
}

// ============ Ollama ============

pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: Option<f32>,
    prompts: PromptBuilder,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig, prompts: PromptBuilder) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            url: config
                .url
                .as_deref()
                .unwrap_or(DEFAULT_OLLAMA_URL)
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            prompts,
        })
    }

    fn body(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        let prompt = self
            .prompts
            .build(&request.question, &request.context, &request.history);
        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": [{"role": "user", "content": prompt}],
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["options"] = serde_json::json!({ "temperature": t });
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Ollama connection error (is Ollama running at {}?)", self.url))?;
        check_status(response, "Ollama").await
    }
}

fn parse_ollama_line(line: &str) -> Result<StreamLine> {
    if line.is_empty() {
        return Ok(StreamLine::Skip);
    }
    let json: serde_json::Value =
        serde_json::from_str(line).with_context(|| format!("Invalid Ollama stream line: {}", line))?;
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama error: {}", err);
    }
    let content = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    if !content.is_empty() {
        return Ok(StreamLine::Token(content.to_string()));
    }
    if json.get("done").and_then(|d| d.as_bool()) == Some(true) {
        return Ok(StreamLine::Done);
    }
    Ok(StreamLine::Skip)
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let response = self.send(&self.body(&request, false)).await?;
        let json: serde_json::Value = response.json().await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        let response = self.send(&self.body(&request, true)).await?;
        Ok(line_stream(response.bytes_stream().boxed(), parse_ollama_line))
    }

    async fn health_check(&self) -> bool {
        match self.client.get(format!("{}/api/tags", self.url)).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.url))
            .send()
            .await?;
        let json: serde_json::Value = check_status(response, "Ollama").await?.json().await?;
        Ok(json
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============ OpenAI-compatible ============

/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f32>,
    prompts: PromptBuilder,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig, prompts: PromptBuilder) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            base_url: config
                .url
                .as_deref()
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            prompts,
        })
    }

    fn body(&self, request: &GenerationRequest, stream: bool) -> serde_json::Value {
        let prompt = self
            .prompts
            .build(&request.question, &request.context, &request.history);
        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": [{"role": "user", "content": prompt}],
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        check_status(response, "OpenAI").await
    }
}

fn parse_openai_line(line: &str) -> Result<StreamLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(StreamLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamLine::Done);
    }
    let json: serde_json::Value =
        serde_json::from_str(data).with_context(|| format!("Invalid OpenAI stream chunk: {}", data))?;
    match json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
    {
        Some(content) if !content.is_empty() => Ok(StreamLine::Token(content.to_string())),
        _ => Ok(StreamLine::Skip),
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String> {
        let response = self.send(&self.body(&request, false)).await?;
        let json: serde_json::Value = response.json().await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream> {
        let response = self.send(&self.body(&request, true)).await?;
        Ok(line_stream(response.bytes_stream().boxed(), parse_openai_line))
    }

    async fn health_check(&self) -> bool {
        self.list_models().await.is_ok()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let json: serde_json::Value = check_status(response, "OpenAI").await?.json().await?;
        Ok(json
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Builds the configured [`Generator`].
pub fn create_generator(
    config: &GenerationConfig,
    prompts: PromptBuilder,
) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config, prompts)?)),
        "openai" => Ok(Arc::new(OpenAiGenerator::new(config, prompts)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
