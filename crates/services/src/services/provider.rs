use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;

/// A lazy, finite, non-restartable sequence of text fragments. Chunk
/// boundaries are provider-determined and may split mid-word; consumption
/// order is the only guarantee.
pub type ChunkStream = BoxStream<'static, String>;

/// Returned verbatim by the model when the prompt carries too little signal
/// to name a contract. Callers treat a matching title as a business-level
/// rejection, not a system error.
pub const INSUFFICIENT_TITLE_SENTINEL: &str =
    "does not contain information to generate a contract title";

pub fn is_insufficient_title(title: &str) -> bool {
    title
        .to_lowercase()
        .contains("does not contain information")
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned malformed output: {0}")]
    Malformed(String),
    #[error("provider returned an empty response")]
    Empty,
}

/// Boundary to the generative text backend. Single-shot calls retry
/// internally; chunk streams are never retried once streaming has begun.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn title_for(&self, prompt: &str) -> Result<String, ProviderError>;

    /// Ordered section titles for the contract. The request asks for at
    /// least 10 sections but the returned length is not enforced; callers
    /// must tolerate fewer.
    async fn outline_for(&self, prompt: &str) -> Result<Vec<String>, ProviderError>;

    async fn write_section(
        &self,
        prompt: &str,
        section_title: &str,
    ) -> Result<ChunkStream, ProviderError>;

    /// Streams the complete modified document, not a diff.
    async fn edit(
        &self,
        document: &str,
        instruction: &str,
    ) -> Result<ChunkStream, ProviderError>;

    async fn suggest_edits(&self, document: &str) -> Result<Vec<String>, ProviderError>;
}

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const SUGGESTION_LIMIT: usize = 5;
const SUGGESTION_CONTEXT_LIMIT: usize = 2000;

/// Gemini-backed implementation of [`ContentProvider`]. Streaming calls use
/// the `alt=sse` wire format decoded with `eventsource-stream`.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into(),
        }
    }

    // Up to 3 attempts, exponential backoff between 2s and 10s.
    fn retry_policy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(2)
    }

    fn request_body(prompt: &str, structured: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        if structured {
            body["generationConfig"] =
                serde_json::json!({ "responseMimeType": "application/json" });
        }
        body
    }

    async fn generate_once(&self, prompt: &str, structured: bool) -> Result<String, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(prompt, structured))
            .send()
            .await?
            .error_for_status()?;
        let parsed: GenerateContentResponse = response.json().await?;
        let text = parsed.text();
        if text.is_empty() {
            return Err(ProviderError::Empty);
        }
        Ok(text)
    }

    async fn generate_with_retry(
        &self,
        prompt: &str,
        structured: bool,
    ) -> Result<String, ProviderError> {
        (|| self.generate_once(prompt, structured))
            .retry(Self::retry_policy())
            .notify(|err: &ProviderError, delay: Duration| {
                tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "retrying provider call");
            })
            .await
    }

    /// Opens a streaming generation request. Only the initial call is
    /// retried; once chunks flow, a failure degrades to a visible error
    /// fragment terminating the stream.
    async fn open_stream(
        &self,
        prompt: &str,
        error_label: String,
    ) -> Result<ChunkStream, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let body = Self::request_body(prompt, false);
        let response = (|| async {
            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, ProviderError>(response)
        })
        .retry(Self::retry_policy())
        .notify(|err: &ProviderError, delay: Duration| {
            tracing::warn!(error = %err, delay_ms = delay.as_millis() as u64, "retrying provider stream open");
        })
        .await?;

        Ok(sse_chunk_stream(response, error_label))
    }
}

#[async_trait]
impl ContentProvider for GeminiProvider {
    async fn title_for(&self, prompt: &str) -> Result<String, ProviderError> {
        let request = format!(
            "You are a legal expert. Based on the user's request, generate a title for the contract.\n\
             User Request: {prompt}\n\
             Just return a one line answer.\n\
             If the title cannot be determined from the request, respond with '{INSUFFICIENT_TITLE_SENTINEL}'."
        );
        let title = self.generate_with_retry(&request, false).await?;
        Ok(title.trim().to_string())
    }

    async fn outline_for(&self, prompt: &str) -> Result<Vec<String>, ProviderError> {
        let request = format!(
            "You are a precise legal paralegal. Based on the user's request, generate a standard \
             Table of Contents for the contract. Return ONLY a JSON array of at least 10 section titles.\n\
             User Request: {prompt}\n\
             Example Output:\n\
             [\"1. Introduction\", \"2. Definitions\", \"3. Terms and Conditions\", \"4. Confidentiality\", \"5. Termination\", \"6. Governing Law\"]"
        );
        let raw = self.generate_with_retry(&request, true).await?;
        parse_string_array(&raw)
    }

    async fn write_section(
        &self,
        prompt: &str,
        section_title: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let request = format!(
            "You are a senior legal counsel. Write the following section of the contract based on the user's request:\n\
             Section Title: {section_title}\n\
             User Request: {prompt}\n\
             Use formal, clear legal language appropriate for a binding agreement. Avoid placeholders, \
             be specific. Use consistent numbering and subclauses if needed.\n\
             Do not include markdown. Just return plain text."
        );
        self.open_stream(
            &request,
            format!("Error generating section '{section_title}'"),
        )
        .await
    }

    async fn edit(
        &self,
        document: &str,
        instruction: &str,
    ) -> Result<ChunkStream, ProviderError> {
        let request = format!(
            "You are a professional contract editor. Modify the existing contract based on the user's instruction.\n\
             Preserve the overall structure and formatting, make only the requested changes, and keep \
             existing clause numbers and headings unless asked to change them.\n\
             Output the COMPLETE modified contract, not just the changes.\n\n\
             CURRENT CONTRACT:\n{document}\n\n\
             EDIT INSTRUCTION: {instruction}"
        );
        self.open_stream(&request, "Error editing contract".to_string())
            .await
    }

    async fn suggest_edits(&self, document: &str) -> Result<Vec<String>, ProviderError> {
        let context: String = document.chars().take(SUGGESTION_CONTEXT_LIMIT).collect();
        let request = format!(
            "You are a contract review expert. Analyze the given contract and suggest 3-5 common \
             improvements or modifications. Provide suggestions as short, actionable prompts a user \
             could use to edit the contract. Return ONLY a JSON array of suggestion strings.\n\n\
             CONTRACT TO ANALYZE:\n{context}"
        );
        let suggestions = match self
            .generate_with_retry(&request, true)
            .await
            .and_then(|raw| parse_string_array(&raw))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                // Suggestions are advisory; a provider hiccup falls back to
                // canned prompts instead of failing the request.
                tracing::warn!(error = %err, "edit suggestion generation failed, using defaults");
                default_suggestions()
            }
        };
        Ok(suggestions.into_iter().take(SUGGESTION_LIMIT).collect())
    }
}

pub fn default_suggestions() -> Vec<String> {
    [
        "Add termination clause",
        "Clarify payment terms",
        "Include dispute resolution",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn sse_chunk_stream(response: reqwest::Response, error_label: String) -> ChunkStream {
    let events = response.bytes_stream().eventsource();
    Box::pin(futures::stream::unfold(Some(events), move |state| {
        let error_label = error_label.clone();
        async move {
            let mut events = state?;
            loop {
                match events.next().await {
                    Some(Ok(event)) => {
                        let text = extract_stream_text(&event.data);
                        if text.is_empty() {
                            continue;
                        }
                        return Some((text, Some(events)));
                    }
                    Some(Err(err)) => {
                        return Some((format!("{error_label}: {err}"), None));
                    }
                    None => return None,
                }
            }
        }
    }))
}

fn extract_stream_text(data: &str) -> String {
    serde_json::from_str::<GenerateContentResponse>(data)
        .map(|chunk| chunk.text())
        .unwrap_or_default()
}

fn parse_string_array(raw: &str) -> Result<Vec<String>, ProviderError> {
    let trimmed = strip_code_fences(raw);
    serde_json::from_str::<Vec<String>>(trimmed)
        .map_err(|err| ProviderError::Malformed(format!("expected JSON string array: {err}")))
}

/// Models occasionally wrap structured output in a markdown code fence even
/// when asked for raw JSON.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn text(&self) -> String {
        self.candidates
            .iter()
            .filter_map(|candidate| candidate.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .filter_map(|part| part.text.as_deref())
            .collect()
    }
}
