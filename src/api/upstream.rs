use super::client::ByteStream;
use super::logging::{debug_payload_enabled, emit_debug_payload};
use crate::config::ProxyConfig;
use crate::types::{ChatRequest, HistoryTurn, Role};
use crate::util::{env_non_empty, is_local_endpoint_url};
use anyhow::{anyhow, bail, Result};
use futures::StreamExt;
use serde_json::{json, Value};

const PROTOCOL_ENV: &str = "HYDRO_API_PROTOCOL";
const ERROR_BODY_PREVIEW_CHARS: usize = 512;
const SYSTEM_PROMPT: &str = "You are the assistant of a hydraulic engineering 3D viewer.\n\
Answer chat questions concisely in plain text.\n\
When the message is exactly one of run_cfd_simulation, run_flood_routing or run_sediment_transport, \
act as the simulation backend: stream a line-oriented solver log and report progress with markers \
of the exact form [PROGRESS:n] where n is an integer from 0 to 100, increasing as work advances.\n\
When the message is generate_diagram, describe the diagram briefly.\n\
For simulations and diagrams, finish the response with a single JSON object holding the results. \
Do not use the character '{' anywhere before that final object.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiProtocol {
    Gemini,
    OpenAiChatCompletions,
}

impl ApiProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiProtocol::Gemini => "gemini",
            ApiProtocol::OpenAiChatCompletions => "openai",
        }
    }
}

/// Streaming client for the generative-content provider behind the relay.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    api_key: Option<String>,
    model: String,
    api_url: String,
    protocol: ApiProtocol,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let protocol = env_non_empty(PROTOCOL_ENV)
            .and_then(|value| parse_protocol(&value))
            .unwrap_or_else(|| infer_api_protocol(&config.upstream_url));

        Ok(Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            api_url: config.upstream_url.clone(),
            protocol,
        })
    }

    pub fn protocol(&self) -> ApiProtocol {
        self.protocol
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_local_endpoint(&self) -> bool {
        is_local_endpoint_url(&self.api_url)
    }

    /// Opens one streaming generation call. Never retried.
    pub async fn create_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        let request_url = self.request_url();
        let payload = match self.protocol {
            ApiProtocol::Gemini => gemini_payload(request, SYSTEM_PROMPT),
            ApiProtocol::OpenAiChatCompletions => {
                openai_payload(&self.model, request, SYSTEM_PROMPT)
            }
        };

        if debug_payload_enabled() {
            emit_debug_payload(&request_url, &payload);
        }

        let mut http_request = self
            .http
            .post(&request_url)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &self.api_key {
            http_request = match self.protocol {
                ApiProtocol::Gemini => http_request.header("x-goog-api-key", api_key),
                ApiProtocol::OpenAiChatCompletions => {
                    http_request.header("authorization", format!("Bearer {api_key}"))
                }
            };
        }

        let response = http_request
            .send()
            .await
            .map_err(|error| map_upstream_error(error, &request_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
            bail!(
                "upstream '{}' returned HTTP {}: {}",
                request_url,
                status,
                preview.trim()
            );
        }

        let request_url_for_stream = request_url.clone();
        let stream = response.bytes_stream().map(move |item| {
            item.map_err(|error| map_upstream_error(error, &request_url_for_stream))
        });
        Ok(Box::pin(stream))
    }

    fn request_url(&self) -> String {
        match self.protocol {
            ApiProtocol::Gemini => gemini_stream_url(&self.api_url, &self.model),
            ApiProtocol::OpenAiChatCompletions => {
                adapt_to_openai_chat_completions_url(&self.api_url)
            }
        }
    }
}

fn map_upstream_error(error: reqwest::Error, request_url: &str) -> anyhow::Error {
    if error.is_connect() {
        return anyhow!("cannot reach upstream '{}': {}", request_url, error);
    }
    if error.is_timeout() {
        return anyhow!("upstream request to '{}' timed out: {}", request_url, error);
    }
    if let Some(status) = error.status() {
        return anyhow!("upstream '{}' returned HTTP {}: {}", request_url, status, error);
    }
    anyhow!("upstream request to '{}' failed: {}", request_url, error)
}

fn parse_protocol(value: &str) -> Option<ApiProtocol> {
    match value.trim().to_ascii_lowercase().as_str() {
        "gemini" | "google" | "generative_language" => Some(ApiProtocol::Gemini),
        "openai" | "chat" | "chat_completions" | "openai_chat_completions" => {
            Some(ApiProtocol::OpenAiChatCompletions)
        }
        _ => None,
    }
}

fn infer_api_protocol(api_url: &str) -> ApiProtocol {
    let normalized = api_url.trim().trim_end_matches('/').to_ascii_lowercase();
    if normalized.contains("/chat/completions") || normalized.ends_with("/v1") {
        ApiProtocol::OpenAiChatCompletions
    } else {
        ApiProtocol::Gemini
    }
}

fn gemini_stream_url(api_url: &str, model: &str) -> String {
    let normalized = api_url.trim().trim_end_matches('/');
    let base = if normalized.contains(":streamGenerateContent") {
        normalized.to_string()
    } else {
        format!("{normalized}/models/{model}:streamGenerateContent")
    };
    if base.contains("alt=sse") {
        base
    } else if base.contains('?') {
        format!("{base}&alt=sse")
    } else {
        format!("{base}?alt=sse")
    }
}

fn adapt_to_openai_chat_completions_url(api_url: &str) -> String {
    let normalized = api_url.trim().trim_end_matches('/');
    if normalized.ends_with("/chat/completions") {
        return normalized.to_string();
    }
    if normalized.ends_with("/v1") {
        return format!("{normalized}/chat/completions");
    }
    normalized.to_string()
}

fn gemini_payload(request: &ChatRequest, system_prompt: &str) -> Value {
    let mut contents: Vec<Value> = request.history.iter().map(gemini_content).collect();
    contents.push(json!({
        "role": Role::User.as_str(),
        "parts": [{ "text": request.message }],
    }));

    json!({
        "systemInstruction": { "parts": [{ "text": system_prompt }] },
        "contents": contents,
    })
}

fn gemini_content(turn: &HistoryTurn) -> Value {
    json!({
        "role": turn.role.as_str(),
        "parts": [{ "text": turn.text }],
    })
}

fn openai_payload(model: &str, request: &ChatRequest, system_prompt: &str) -> Value {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(json!({ "role": "system", "content": system_prompt }));
    for turn in &request.history {
        let role = match turn.role {
            Role::User => "user",
            Role::Model => "assistant",
        };
        messages.push(json!({ "role": role, "content": turn.text }));
    }
    messages.push(json!({ "role": "user", "content": request.message }));

    json!({
        "model": model,
        "stream": true,
        "messages": messages,
    })
}
