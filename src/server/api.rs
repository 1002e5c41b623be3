use crate::agent::Assistant;
use crate::cli::Args;
use crate::llm::{ HistoryEntry, InlineImage };
use crate::models::chat::{ ChatReply, Persona, Source };

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{ get, post },
    Router,
    extract::State,
    response::IntoResponse,
    http::StatusCode,
    Json,
};
use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use chrono::Utc;
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, error };

#[derive(Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub persona: Persona,
}

#[derive(Serialize)]
struct ChatResponse {
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sources: Vec<Source>,
    timestamp: i64,
}

#[derive(Deserialize)]
pub struct VisionRequest {
    /// Base64-encoded image bytes.
    pub image: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    pub prompt: String,
}

fn default_mime_type() -> String {
    "image/jpeg".to_string()
}

#[derive(Serialize)]
struct VisionResponse {
    text: String,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

#[derive(Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
}

#[derive(Clone)]
struct AppState {
    assistant: Arc<Assistant>,
}

pub async fn start_http_server(
    http_port: u16,
    assistant: Arc<Assistant>,
    args: Args
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("0.0.0.0:{}", http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let app_state = AppState { assistant };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/vision", post(vision_handler))
        .route("/api/news", get(news_handler))
        .route("/api/reload-prompts", get(reload_prompts_handler))
        .layer(cors)
        .with_state(app_state);

    if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        let cert_path = args.tls_cert_path.as_ref().unwrap();
        let key_path = args.tls_key_path.as_ref().unwrap();

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            cert_path,
            key_path
        ).await?;

        tokio::spawn(async move {
            let result = axum_server
                ::bind_rustls(addr, tls_config)
                .serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS server started with TLS enabled");
    } else {
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                }
            }
        });

        info!("HTTP server started");
    }

    Ok(())
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>
) -> impl IntoResponse {
    if request.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError { error: "prompt must not be empty".to_string() }),
        ).into_response();
    }

    let reply = match
        state.assistant.chat(&request.prompt, &request.history, request.persona).await
    {
        Ok(reply) => reply,
        Err(e) => {
            error!("Chat request failed: {}", e);
            let prompts = state.assistant.prompts().await;
            ChatReply {
                text: prompts.chat_error.clone(),
                sources: Vec::new(),
            }
        }
    };

    Json(ChatResponse {
        text: reply.text,
        sources: reply.sources,
        timestamp: Utc::now().timestamp(),
    }).into_response()
}

async fn vision_handler(
    State(state): State<AppState>,
    Json(request): Json<VisionRequest>
) -> impl IntoResponse {
    let data = match STANDARD.decode(request.image.as_bytes()) {
        Ok(data) => data,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiError { error: format!("Invalid base64 image payload: {}", e) }),
            ).into_response();
        }
    };
    let image = InlineImage { data, mime_type: request.mime_type };

    let text = match state.assistant.analyze_vision(&image, &request.prompt).await {
        Ok(text) => text,
        Err(e) => {
            error!("Vision request failed: {}", e);
            state.assistant.prompts().await.vision_error.clone()
        }
    };

    Json(VisionResponse { text }).into_response()
}

async fn news_handler(State(state): State<AppState>) -> impl IntoResponse {
    let reply = match state.assistant.fetch_latest_news().await {
        Ok(reply) => reply,
        Err(e) => {
            error!("News request failed: {}", e);
            let prompts = state.assistant.prompts().await;
            ChatReply {
                text: prompts.news_error.clone(),
                sources: Vec::new(),
            }
        }
    };

    Json(ChatResponse {
        text: reply.text,
        sources: reply.sources,
        timestamp: Utc::now().timestamp(),
    }).into_response()
}

async fn reload_prompts_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.assistant.reload_prompts_if_changed().await {
        Ok(true) =>
            (
                StatusCode::OK,
                Json(ReloadResponse { success: true, message: "Prompts reloaded".to_string() }),
            ).into_response(),
        Ok(false) =>
            (
                StatusCode::OK,
                Json(ReloadResponse { success: true, message: "Prompts unchanged".to_string() }),
            ).into_response(),
        Err(e) =>
            (
                StatusCode::BAD_REQUEST,
                Json(ReloadResponse { success: false, message: format!("Reload error: {}", e) }),
            ).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::config::prompt::PersonaPrompts;
    use crate::llm::{ ClientError, GenerativeClient };

    struct StubClient {
        text: String,
        fail: bool,
    }

    #[async_trait]
    impl GenerativeClient for StubClient {
        async fn generate_chat(
            &self,
            _prompt: &str,
            _history: &[HistoryEntry],
            _system_instruction: &str
        ) -> Result<ChatReply, ClientError> {
            if self.fail {
                return Err(ClientError::Configuration("down".to_string()));
            }
            Ok(ChatReply { text: self.text.clone(), sources: Vec::new() })
        }

        async fn generate_vision(
            &self,
            _image: &InlineImage,
            _prompt: &str
        ) -> Result<String, ClientError> {
            if self.fail {
                return Err(ClientError::Configuration("down".to_string()));
            }
            Ok(self.text.clone())
        }

        async fn generate_grounded(
            &self,
            _prompt: &str,
            _system_instruction: &str
        ) -> Result<ChatReply, ClientError> {
            if self.fail {
                return Err(ClientError::Configuration("down".to_string()));
            }
            Ok(ChatReply {
                text: self.text.clone(),
                sources: vec![Source {
                    title: "إعلان رسمي".to_string(),
                    uri: "https://21umas.edu.ye/news".to_string(),
                }],
            })
        }
    }

    fn state(fail: bool) -> AppState {
        let client = Arc::new(StubClient { text: "النص".to_string(), fail });
        AppState {
            assistant: Arc::new(
                Assistant::with_client(
                    client,
                    Arc::new(PersonaPrompts::default()),
                    Persona::General
                )
            ),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn chat_returns_the_reply_with_a_timestamp() {
        let request = ChatRequest {
            prompt: "سؤال".to_string(),
            history: Vec::new(),
            persona: Persona::General,
        };
        let response = chat_handler(State(state(false)), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["text"], "النص");
        assert!(json["timestamp"].is_i64());
    }

    #[tokio::test]
    async fn chat_rejects_a_blank_prompt() {
        let request = ChatRequest {
            prompt: "   ".to_string(),
            history: Vec::new(),
            persona: Persona::General,
        };
        let response = chat_handler(State(state(false)), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_failure_is_rendered_as_the_fixed_wording() {
        let prompts = PersonaPrompts::default();
        let request = ChatRequest {
            prompt: "سؤال".to_string(),
            history: Vec::new(),
            persona: Persona::General,
        };
        let response = chat_handler(State(state(true)), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["text"], prompts.chat_error);
        assert!(json.get("sources").is_none());
    }

    #[tokio::test]
    async fn vision_rejects_undecodable_payloads() {
        let request = VisionRequest {
            image: "%%% not base64 %%%".to_string(),
            mime_type: "image/jpeg".to_string(),
            prompt: "حلل".to_string(),
        };
        let response = vision_handler(State(state(false)), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn vision_decodes_and_answers() {
        let request = VisionRequest {
            image: STANDARD.encode([0xffu8, 0xd8, 0xff, 0xe0]),
            mime_type: "image/jpeg".to_string(),
            prompt: "حلل".to_string(),
        };
        let response = vision_handler(State(state(false)), Json(request)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["text"], "النص");
    }

    #[tokio::test]
    async fn news_failure_is_rendered_as_the_fixed_wording() {
        let prompts = PersonaPrompts::default();
        let response = news_handler(State(state(true))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["text"], prompts.news_error);
    }

    #[tokio::test]
    async fn news_carries_its_sources() {
        let response = news_handler(State(state(false))).await.into_response();
        let json = body_json(response).await;
        assert_eq!(json["sources"][0]["title"], "إعلان رسمي");
    }
}
