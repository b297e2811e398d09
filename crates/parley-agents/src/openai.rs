use crate::providers::{ChatMessage, LlmProvider, LlmRequest, LlmResponse, Usage};
use async_trait::async_trait;
use parley_common::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Error codes / message fragments the API uses for an oversized prompt.
const OVERFLOW_CODES: &[&str] = &["context_length_exceeded", "string_above_max_length"];
const OVERFLOW_FRAGMENTS: &[&str] = &[
    "maximum context length",
    "context length",
    "too many tokens",
    "reduce the length",
];

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let openai_request = convert_request(request);

        let mut builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&openai_request);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &error_text));
        }

        let openai_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Failed to parse OpenAI response: {e}")))?;

        convert_response(openai_response)
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

fn convert_request(request: &LlmRequest) -> OpenAiRequest<'_> {
    OpenAiRequest {
        model: &request.model,
        messages: &request.messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        frequency_penalty: request.frequency_penalty,
        presence_penalty: request.presence_penalty,
    }
}

fn convert_response(response: OpenAiResponse) -> Result<LlmResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Upstream("No choices in response".to_string()))?;

    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        model: response.model,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        stop_reason: choice.finish_reason,
    })
}

/// Map a non-success HTTP response to an error, separating context overflow
/// from everything else.
fn classify_error(status: StatusCode, body: &str) -> Error {
    let detail = serde_json::from_str::<OpenAiErrorEnvelope>(body)
        .map(|envelope| envelope.error)
        .ok();

    let is_overflow = if status == StatusCode::PAYLOAD_TOO_LARGE {
        true
    } else if status == StatusCode::BAD_REQUEST
        && let Some(detail) = &detail
    {
        let code_matches = detail
            .code
            .as_deref()
            .is_some_and(|code| OVERFLOW_CODES.contains(&code));
        let message = detail.message.to_ascii_lowercase();
        code_matches || OVERFLOW_FRAGMENTS.iter().any(|f| message.contains(f))
    } else {
        false
    };

    let message = detail
        .map(|d| d.message)
        .unwrap_or_else(|| body.to_string());
    if is_overflow {
        debug!("OpenAI reported context overflow: {message}");
        Error::ContextOverflow(message)
    } else {
        Error::Upstream(format!("OpenAI API error (status={}): {message}", status.as_u16()))
    }
}

// Request Types
#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
}

// Response Types
#[derive(Deserialize)]
struct OpenAiResponse {
    model: String,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiErrorEnvelope {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    message: String,
    #[serde(default)]
    code: Option<String>,
}
