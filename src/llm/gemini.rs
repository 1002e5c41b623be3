use async_trait::async_trait;
use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use log::info;
use serde::{ Deserialize, Serialize };

use super::{ ClientConfig, ClientError, GenerativeClient, HistoryEntry, InlineImage };
use crate::models::chat::{ ChatReply, Source };

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_VISION_MODEL: &str = "gemini-2.5-flash-image";

/// Label used when a grounding chunk arrives without a web title.
const DEFAULT_SOURCE_TITLE: &str = "مصدر أكاديمي";

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<RequestPart>,
}

impl Content {
    fn user(parts: Vec<RequestPart>) -> Self {
        Self { role: "user".to_string(), parts }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineDataPart,
    },
}

impl RequestPart {
    fn text(text: &str) -> Self {
        RequestPart::Text { text: text.to_string() }
    }

    fn inline_image(image: &InlineImage) -> Self {
        RequestPart::InlineData {
            inline_data: InlineDataPart {
                mime_type: image.mime_type.clone(),
                data: STANDARD.encode(&image.data),
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataPart {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<RequestPart>,
}

impl SystemInstruction {
    fn from_text(text: &str) -> Self {
        Self { parts: vec![RequestPart::text(text)] }
    }
}

#[derive(Serialize)]
struct Tool {
    google_search: GoogleSearchTool,
}

impl Tool {
    fn google_search() -> Self {
        Self { google_search: GoogleSearchTool {} }
    }
}

#[derive(Serialize)]
struct GoogleSearchTool {}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "thinkingConfig", skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Serialize)]
struct ThinkingConfig {
    #[serde(rename = "thinkingBudget")]
    thinking_budget: i32,
}

#[derive(Deserialize, Debug)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
    #[serde(rename = "groundingMetadata")]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GroundingMetadata {
    #[serde(rename = "groundingChunks", default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Debug)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Deserialize, Debug)]
struct WebSource {
    title: Option<String>,
    uri: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    chat_model: String,
    vision_model: String,
    base_url: String,
    thinking_budget: i32,
}

impl GeminiClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key,
            chat_model: config.chat_model.unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            vision_model: config.vision_model.unwrap_or_else(||
                DEFAULT_VISION_MODEL.to_string()
            ),
            base_url: config.base_url.unwrap_or_else(|| GEMINI_API_BASE.to_string()),
            thinking_budget: config.thinking_budget,
        }
    }

    fn chat_request(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
        system_instruction: &str
    ) -> GenerateContentRequest {
        let mut contents: Vec<Content> = history
            .iter()
            .map(|turn| Content {
                role: turn.role.as_str().to_string(),
                parts: vec![RequestPart::text(&turn.text)],
            })
            .collect();
        contents.push(Content::user(vec![RequestPart::text(prompt)]));

        GenerateContentRequest {
            contents,
            system_instruction: Some(SystemInstruction::from_text(system_instruction)),
            tools: Some(vec![Tool::google_search()]),
            generation_config: Some(GenerationConfig {
                thinking_config: Some(ThinkingConfig {
                    thinking_budget: self.thinking_budget,
                }),
            }),
        }
    }

    fn vision_request(&self, image: &InlineImage, prompt: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![
                Content::user(
                    vec![RequestPart::inline_image(image), RequestPart::text(prompt)]
                )
            ],
            system_instruction: None,
            tools: None,
            generation_config: None,
        }
    }

    fn grounded_request(&self, prompt: &str, system_instruction: &str) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: vec![Content::user(vec![RequestPart::text(prompt)])],
            system_instruction: Some(SystemInstruction::from_text(system_instruction)),
            tools: Some(vec![Tool::google_search()]),
            generation_config: None,
        }
    }

    async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest
    ) -> Result<GenerateContentResponse, ClientError> {
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            model,
            self.api_key
        );
        info!("GeminiClient::generate() → model={}", model);

        let response = self.http
            .post(&url)
            .json(request)
            .send().await
            .map_err(|e| ClientError::Request { model: model.to_string(), source: e })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                model: model.to_string(),
                status: status.as_u16(),
                message: decode_error_message(&body),
            });
        }

        response
            .json::<GenerateContentResponse>().await
            .map_err(|e| ClientError::Decode {
                model: model.to_string(),
                detail: e.to_string(),
            })
    }
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    async fn generate_chat(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
        system_instruction: &str
    ) -> Result<ChatReply, ClientError> {
        let request = self.chat_request(prompt, history, system_instruction);
        let response = self.generate(&self.chat_model, &request).await?;
        Ok(normalize_reply(&response))
    }

    async fn generate_vision(
        &self,
        image: &InlineImage,
        prompt: &str
    ) -> Result<String, ClientError> {
        let request = self.vision_request(image, prompt);
        let response = self.generate(&self.vision_model, &request).await?;
        Ok(extract_text(&response))
    }

    async fn generate_grounded(
        &self,
        prompt: &str,
        system_instruction: &str
    ) -> Result<ChatReply, ClientError> {
        let request = self.grounded_request(prompt, system_instruction);
        let response = self.generate(&self.chat_model, &request).await?;
        Ok(normalize_reply(&response))
    }
}

fn normalize_reply(response: &GenerateContentResponse) -> ChatReply {
    ChatReply {
        text: extract_text(response),
        sources: extract_sources(response),
    }
}

/// Concatenated text of the first candidate. A response without candidates
/// or text parts normalizes to the empty string, which callers map to
/// their own fallback wording.
fn extract_text(response: &GenerateContentResponse) -> String {
    response.candidates
        .first()
        .and_then(|candidate| candidate.content.as_ref())
        .map(|content| {
            content.parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect()
        })
        .unwrap_or_default()
}

/// Every grounding chunk maps to a source, unfiltered and in order. A chunk
/// without a usable title gets the generic academic label, a chunk without
/// a uri gets an empty one.
fn extract_sources(response: &GenerateContentResponse) -> Vec<Source> {
    response.candidates
        .first()
        .and_then(|candidate| candidate.grounding_metadata.as_ref())
        .map(|metadata| metadata.grounding_chunks.iter().map(source_from_chunk).collect())
        .unwrap_or_default()
}

fn source_from_chunk(chunk: &GroundingChunk) -> Source {
    let web = chunk.web.as_ref();
    let title = web
        .and_then(|w| w.title.clone())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| DEFAULT_SOURCE_TITLE.to_string());
    let uri = web.and_then(|w| w.uri.clone()).unwrap_or_default();
    Source { title, uri }
}

fn decode_error_message(body: &str) -> String {
    serde_json
        ::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.message)
        .unwrap_or_else(|| body.trim().to_string())
}
