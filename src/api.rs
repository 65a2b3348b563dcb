use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::Config;

/// A single turn of the conversation as the Generative Language API models it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    // "user" or "model"; absent on some streamed chunks
    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    // Set on reasoning summaries, which are not part of the reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role("user", text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_role("model", text)
    }

    fn with_role(role: &str, text: impl Into<String>) -> Self {
        Content {
            role: role.to_string(),
            parts: vec![Part {
                text: Some(text.into()),
                thought: None,
            }],
        }
    }

    /// Concatenated text of every non-thought part.
    fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.thought != Some(true))
            .filter_map(|p| p.text.as_deref())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,

    // Present instead of candidates when the prompt itself was rejected
    prompt_feedback: Option<PromptFeedback>,

    usage_metadata: Option<UsageMetadata>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,

    // Ex: 'STOP' | 'MAX_TOKENS' | 'SAFETY' | 'RECITATION' | 'OTHER'
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
struct ErrorResponse {
    code: i32,
    message: String,

    // Ex: 'INVALID_ARGUMENT' | 'PERMISSION_DENIED' | 'RESOURCE_EXHAUSTED'
    status: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ErrorResponseContainer {
    error: ErrorResponse,
}

impl ErrorResponse {
    fn into_error(self) -> anyhow::Error {
        anyhow!(
            "API request failed with code {} ({}): {}",
            self.code,
            self.status.as_deref().unwrap_or("UNKNOWN"),
            self.message
        )
    }
}

/// Something that turns the conversation so far into the model's next reply.
///
/// `on_chunk` receives the reply piece by piece; the pieces concatenate to the
/// returned string.
#[async_trait(?Send)]
pub trait GenerativeModel {
    async fn generate(
        &self,
        contents: &[Content],
        on_chunk: &mut dyn for<'a> FnMut(&'a str) -> Result<()>,
    ) -> Result<String>;
}

/// `ApiClient` talks to the Gemini Generative Language REST API for one model.
///
/// Each call is stateless on the server side, so the caller passes the whole
/// conversation in `contents`. Depending on `config.stream` the reply is either
/// fetched in one request or read as server-sent events, and `on_chunk` sees the
/// text as soon as it is available.
pub struct ApiClient {
    config: Config,
    http: Client,
}

impl ApiClient {
    pub fn new(config: Config) -> Self {
        ApiClient {
            config,
            http: Client::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        self.config
            .model_id
            .strip_prefix("models/")
            .unwrap_or(&self.config.model_id)
    }

    fn url(&self) -> String {
        let base = self.config.api.trim_end_matches('/');
        if self.config.stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                base,
                self.model_id()
            )
        } else {
            format!("{}/v1beta/models/{}:generateContent", base, self.model_id())
        }
    }

    /// Constructs the request body for the conversation in `contents`.
    ///
    /// `generationConfig` is only included when at least one sampling option is
    /// set, and then only with the options that are set. A configured system
    /// prompt is sent as `systemInstruction` on every request.
    fn build_request_body(&self, contents: &[Content]) -> serde_json::Value {
        let mut body = json!({
            "contents": contents,
        });

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = self.config.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(temp) = self.config.temp {
            generation_config.insert("temperature".into(), json!(temp));
        }
        if let Some(top_p) = self.config.top_p {
            generation_config.insert("topP".into(), json!(top_p));
        }
        if let Some(top_k) = self.config.top_k {
            generation_config.insert("topK".into(), json!(top_k));
        }
        if let Some(seed) = self.config.seed {
            generation_config.insert("seed".into(), json!(seed));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }

        if let Some(system_prompt) = &self.config.system_prompt {
            body["systemInstruction"] = json!({
                "parts": [{ "text": system_prompt }]
            });
        }

        body
    }

    /// Reads an SSE response to the end, forwarding each text fragment to
    /// `on_chunk` and returning the assembled reply.
    async fn process_streaming_response(
        &self,
        mut response: reqwest::Response,
        on_chunk: &mut dyn for<'a> FnMut(&'a str) -> Result<()>,
    ) -> Result<String> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut reply = String::new();
        let mut last: Option<GenerateContentResponse> = None;

        loop {
            let chunk = response.chunk().await?;
            let finished = chunk.is_none();
            match chunk {
                Some(bytes) => buffer.extend_from_slice(&bytes),
                // a final event may arrive without its trailing newline
                None if !buffer.is_empty() => buffer.push(b'\n'),
                None => {}
            }

            for payload in drain_sse_data(&mut buffer) {
                if payload == "[DONE]" {
                    continue;
                }
                let parsed = parse_payload(&payload)?;
                if let Some(candidate) = parsed.candidates.first() {
                    if let Some(content) = &candidate.content {
                        let fragment = content.text();
                        if !fragment.is_empty() {
                            on_chunk(&fragment)?;
                            reply.push_str(&fragment);
                        }
                    }
                }
                last = Some(parsed);
            }

            if finished {
                break;
            }
        }

        let last = last.ok_or_else(|| anyhow!("stream ended without any events"))?;
        log_usage(&last);
        if reply.is_empty() {
            // surfaces the block or finish reason
            reply_text(&last)?;
        }

        Ok(reply)
    }
}

#[async_trait(?Send)]
impl GenerativeModel for ApiClient {
    async fn generate(
        &self,
        contents: &[Content],
        on_chunk: &mut dyn for<'a> FnMut(&'a str) -> Result<()>,
    ) -> Result<String> {
        let body = self.build_request_body(contents);

        debug!(
            model = %self.model_id(),
            turns = contents.len(),
            stream = self.config.stream,
            "Gemini API request"
        );

        let response = self
            .http
            .post(self.url())
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("failed to reach the Gemini API")?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(match serde_json::from_str::<ErrorResponseContainer>(&text) {
                Ok(container) => container.error.into_error(),
                Err(_) => anyhow!("API request failed with status {}: {}", status, text),
            });
        }

        if self.config.stream {
            self.process_streaming_response(response, on_chunk).await
        } else {
            let response_text = response.text().await?;
            let parsed = parse_payload(&response_text)?;
            log_usage(&parsed);
            let reply = reply_text(&parsed)?;
            on_chunk(&reply)?;
            Ok(reply)
        }
    }
}

/// Parses one response object, turning an error envelope into an `Err`.
fn parse_payload(json_str: &str) -> Result<GenerateContentResponse> {
    if let Ok(container) = serde_json::from_str::<ErrorResponseContainer>(json_str) {
        return Err(container.error.into_error());
    }

    serde_json::from_str::<GenerateContentResponse>(json_str)
        .map_err(|e| anyhow!("Failed to parse JSON: {}\nRaw JSON: {}", e, json_str))
}

/// Extracts the reply text of the first candidate.
fn reply_text(response: &GenerateContentResponse) -> Result<String> {
    let Some(candidate) = response.candidates.first() else {
        match response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            Some(reason) => bail!("the prompt was blocked by the API (reason: {})", reason),
            None => bail!("the API returned no candidates"),
        }
    };

    let text = candidate
        .content
        .as_ref()
        .map(Content::text)
        .unwrap_or_default();
    if text.is_empty() {
        if let Some(reason) = candidate.finish_reason.as_deref().filter(|r| *r != "STOP") {
            bail!("the reply contained no text (finish reason: {})", reason);
        }
    }

    Ok(text)
}

fn log_usage(response: &GenerateContentResponse) {
    if let Some(usage) = &response.usage_metadata {
        debug!(
            model_version = response.model_version.as_deref().unwrap_or("unknown"),
            prompt_tokens = usage.prompt_token_count.unwrap_or(0),
            reply_tokens = usage.candidates_token_count.unwrap_or(0),
            total_tokens = usage.total_token_count.unwrap_or(0),
            "Gemini API usage"
        );
    }
}

/// Removes every complete line from `buffer` and returns the payloads of the
/// `data:` lines among them. Incomplete trailing bytes stay in the buffer.
fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        if let Some(data) = line.trim().strip_prefix("data:") {
            payloads.push(data.trim_start().to_string());
        }
    }
    payloads
}
