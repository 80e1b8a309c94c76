//! OpenAI-compatible chat-completions client that writes verses.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    application::generator::{GenerationError, VerseGenerator},
    config::GeneratorSettings,
    domain::{
        language::Language,
        verse::{Verse, VerseDraft},
    },
};

use super::error::InfraError;

const SOURCE: &str = "infra::generator";

const SYSTEM_PROMPT: &str = "You are a Bible reference assistant. \
Reply with a single JSON object and nothing else.";

/// Longest upstream error body kept in a [`GenerationError::Upstream`].
const MAX_ERROR_BODY_CHARS: usize = 512;

pub struct OpenAiVerseGenerator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiVerseGenerator {
    pub fn new(settings: &GeneratorSettings) -> Result<Self, InfraError> {
        let api_key = settings
            .api_key
            .clone()
            .ok_or(InfraError::MissingApiKey)?;

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(InfraError::GeneratorClient)?;

        let endpoint = format!(
            "{}/chat/completions",
            settings.api_base.as_str().trim_end_matches('/')
        );

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }

    fn request_body(&self, language: Language) -> ChatCompletionRequest<'_> {
        ChatCompletionRequest {
            model: &self.model,
            temperature: self.temperature,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt(language),
                },
            ],
        }
    }
}

#[async_trait]
impl VerseGenerator for OpenAiVerseGenerator {
    async fn generate(&self, language: Language) -> Result<Verse, GenerationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(language))
            .send()
            .await
            .map_err(|err| GenerationError::transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(GenerationError::upstream(
                status.as_u16(),
                truncate(&body, MAX_ERROR_BODY_CHARS),
            ));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::malformed(format!("invalid completion body: {err}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GenerationError::malformed("completion carried no content"))?;

        let verse = parse_verse(&content)?;
        debug!(
            target = SOURCE,
            language = %language,
            reference = %verse.reference(),
            "verse generated"
        );
        Ok(verse)
    }
}

fn user_prompt(language: Language) -> String {
    format!(
        "Pick a single random Bible verse and give it in {name} ({tag}). \
Respond with a JSON object with exactly these fields: \
\"book\" (the book name in {name}), \"chapter\" (integer), \
\"verse\" (integer) and \"text\" (the verse text in {name}).",
        name = language.display_name(),
        tag = language.tag(),
    )
}

/// Parses model output into a verse, ignoring prose or code fences around
/// the JSON object.
pub(crate) fn parse_verse(content: &str) -> Result<Verse, GenerationError> {
    let json = extract_json_object(content)
        .ok_or_else(|| GenerationError::malformed("no JSON object in completion"))?;
    let draft: VerseDraft = serde_json::from_str(json)
        .map_err(|err| GenerationError::malformed(format!("unexpected verse shape: {err}")))?;
    Ok(Verse::try_from(draft)?)
}

fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (start < end).then(|| &content[start..=end])
}

fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
