use log::info;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cli::Args;
use crate::config::prompt::{ self, PersonaPrompts, PromptError };
use crate::llm::{
    new_client,
    ClientConfig,
    ClientError,
    GenerativeClient,
    HistoryEntry,
    InlineImage,
};
use crate::models::chat::{ ChatReply, Persona };

/// Persona-aware front of the model gateway. Composes the system
/// instruction for each call, forwards it to the generative client, and
/// turns degenerate successes (an empty completion) into the fixed Arabic
/// wording. Transport failures stay typed; each surface decides how to
/// render them.
pub struct Assistant {
    client: Arc<dyn GenerativeClient>,
    prompts: RwLock<Arc<PersonaPrompts>>,
    prompts_path: Option<String>,
    default_persona: Persona,
}

impl Assistant {
    pub fn new(args: &Args) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let config = ClientConfig {
            api_key: args.gemini_api_key.clone(),
            chat_model: args.chat_model.clone(),
            vision_model: args.vision_model.clone(),
            base_url: args.gemini_base_url.clone(),
            thinking_budget: args.thinking_budget,
        };
        let client = new_client(&config)?;
        info!(
            "Gemini client configured: ChatModel={}, VisionModel={}, BaseURL={}",
            config.chat_model.as_deref().unwrap_or("adapter default"),
            config.vision_model.as_deref().unwrap_or("adapter default"),
            config.base_url.as_deref().unwrap_or("adapter default")
        );

        let default_persona: Persona = args.persona.parse()?;
        let prompts = match args.prompts_path.as_deref() {
            Some(path) if !path.trim().is_empty() => prompt::load_prompts(path)?,
            _ => Arc::new(PersonaPrompts::default()),
        };

        Ok(Self {
            client,
            prompts: RwLock::new(prompts),
            prompts_path: args.prompts_path.clone(),
            default_persona,
        })
    }

    /// Assembles an assistant around a caller-provided client.
    pub fn with_client(
        client: Arc<dyn GenerativeClient>,
        prompts: Arc<PersonaPrompts>,
        default_persona: Persona
    ) -> Self {
        Self {
            client,
            prompts: RwLock::new(prompts),
            prompts_path: None,
            default_persona,
        }
    }

    pub fn default_persona(&self) -> Persona {
        self.default_persona
    }

    /// Current prompt set. Cheap to call; hands out the shared snapshot.
    pub async fn prompts(&self) -> Arc<PersonaPrompts> {
        self.prompts.read().await.clone()
    }

    /// Reloads the prompt-override file when its mtime moved forward.
    /// Returns whether a reload happened.
    pub async fn reload_prompts_if_changed(&self) -> Result<bool, PromptError> {
        let path = match self.prompts_path.as_deref() {
            Some(path) if !path.trim().is_empty() => path,
            _ => {
                return Ok(false);
            }
        };
        let current = self.prompts.read().await.clone();
        match prompt::reload_prompts_if_changed(path, &current)? {
            Some(new_prompts) => {
                *self.prompts.write().await = new_prompts;
                info!("Prompt overrides reloaded from '{}'", path);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Grounded chat completion for one conversation turn. The persona
    /// decides the system instruction; an empty completion is replaced by
    /// the fixed "could not formulate an answer" wording.
    pub async fn chat(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
        persona: Persona
    ) -> Result<ChatReply, ClientError> {
        let prompts = self.prompts().await;
        let instruction = prompts.system_instruction_for(persona);
        let mut reply = self.client.generate_chat(prompt, history, &instruction).await?;
        if reply.text.is_empty() {
            reply.text = prompts.chat_fallback.clone();
        }
        Ok(reply)
    }

    /// Runs the vision model over one image, framing the caller's prompt
    /// with the academic-expert preamble.
    pub async fn analyze_vision(
        &self,
        image: &InlineImage,
        prompt: &str
    ) -> Result<String, ClientError> {
        let prompts = self.prompts().await;
        let framed = format!("{}{}", prompts.vision_prefix, prompt);
        let text = self.client.generate_vision(image, &framed).await?;
        if text.is_empty() {
            return Ok(prompts.vision_fallback.clone());
        }
        Ok(text)
    }

    /// One-shot grounded fetch of the latest university announcements.
    pub async fn fetch_latest_news(&self) -> Result<ChatReply, ClientError> {
        let prompts = self.prompts().await;
        let mut reply = self.client
            .generate_grounded(&prompts.news_prompt, &prompts.news_instruction).await?;
        if reply.text.is_empty() {
            reply.text = prompts.news_fallback.clone();
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use crate::models::chat::Source;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Chat {
            prompt: String,
            history_len: usize,
            instruction: String,
        },
        Vision {
            prompt: String,
            mime_type: String,
        },
        Grounded {
            prompt: String,
            instruction: String,
        },
    }

    struct ScriptedClient {
        text: String,
        sources: Vec<Source>,
        fail: bool,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedClient {
        fn replying(text: &str) -> Self {
            Self {
                text: text.to_string(),
                sources: Vec::new(),
                fail: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                text: String::new(),
                sources: Vec::new(),
                fail: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn error() -> ClientError {
            ClientError::Status {
                model: "gemini-2.5-flash".to_string(),
                status: 503,
                message: "unavailable".to_string(),
            }
        }

        fn recorded(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenerativeClient for ScriptedClient {
        async fn generate_chat(
            &self,
            prompt: &str,
            history: &[HistoryEntry],
            system_instruction: &str
        ) -> Result<ChatReply, ClientError> {
            self.calls.lock().unwrap().push(Call::Chat {
                prompt: prompt.to_string(),
                history_len: history.len(),
                instruction: system_instruction.to_string(),
            });
            if self.fail {
                return Err(Self::error());
            }
            Ok(ChatReply { text: self.text.clone(), sources: self.sources.clone() })
        }

        async fn generate_vision(
            &self,
            image: &InlineImage,
            prompt: &str
        ) -> Result<String, ClientError> {
            self.calls.lock().unwrap().push(Call::Vision {
                prompt: prompt.to_string(),
                mime_type: image.mime_type.clone(),
            });
            if self.fail {
                return Err(Self::error());
            }
            Ok(self.text.clone())
        }

        async fn generate_grounded(
            &self,
            prompt: &str,
            system_instruction: &str
        ) -> Result<ChatReply, ClientError> {
            self.calls.lock().unwrap().push(Call::Grounded {
                prompt: prompt.to_string(),
                instruction: system_instruction.to_string(),
            });
            if self.fail {
                return Err(Self::error());
            }
            Ok(ChatReply { text: self.text.clone(), sources: self.sources.clone() })
        }
    }

    fn assistant_with(client: Arc<ScriptedClient>) -> Assistant {
        Assistant::with_client(client, Arc::new(PersonaPrompts::default()), Persona::General)
    }

    #[tokio::test]
    async fn advisor_chat_extends_the_system_instruction() {
        let client = Arc::new(ScriptedClient::replying("الإجابة"));
        let assistant = assistant_with(client.clone());
        let prompts = PersonaPrompts::default();

        let history = vec![HistoryEntry {
            role: crate::models::chat::Role::Model,
            text: prompts.greeting_general.clone(),
        }];
        let reply = assistant.chat("ما شروط القبول؟", &history, Persona::Advisor).await.unwrap();
        assert_eq!(reply.text, "الإجابة");

        match &client.recorded()[0] {
            Call::Chat { prompt, history_len, instruction } => {
                assert_eq!(prompt, "ما شروط القبول؟");
                assert_eq!(*history_len, 1);
                assert!(instruction.starts_with(&prompts.system_instruction));
                assert!(instruction.ends_with(&prompts.advisor_suffix));
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[tokio::test]
    async fn general_chat_uses_the_bare_instruction() {
        let client = Arc::new(ScriptedClient::replying("الإجابة"));
        let assistant = assistant_with(client.clone());
        let prompts = PersonaPrompts::default();

        assistant.chat("سؤال", &[], Persona::General).await.unwrap();
        match &client.recorded()[0] {
            Call::Chat { instruction, .. } => {
                assert_eq!(instruction, &prompts.system_instruction);
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[tokio::test]
    async fn an_empty_completion_becomes_the_chat_fallback() {
        let client = Arc::new(ScriptedClient::replying(""));
        let assistant = assistant_with(client);
        let prompts = PersonaPrompts::default();

        let reply = assistant.chat("سؤال", &[], Persona::General).await.unwrap();
        assert_eq!(reply.text, prompts.chat_fallback);
        assert!(reply.sources.is_empty());
    }

    #[tokio::test]
    async fn a_transport_failure_stays_typed() {
        let client = Arc::new(ScriptedClient::failing());
        let assistant = assistant_with(client);

        match assistant.chat("سؤال", &[], Persona::General).await {
            Err(ClientError::Status { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected a status error, got {:?}", other.map(|r| r.text)),
        }
    }

    #[tokio::test]
    async fn vision_prompts_are_framed_with_the_expert_preamble() {
        let client = Arc::new(ScriptedClient::replying("تحليل"));
        let assistant = assistant_with(client.clone());
        let prompts = PersonaPrompts::default();

        let image = InlineImage { data: vec![1, 2, 3], mime_type: "image/png".to_string() };
        let text = assistant.analyze_vision(&image, "ما هذا التحليل؟").await.unwrap();
        assert_eq!(text, "تحليل");

        match &client.recorded()[0] {
            Call::Vision { prompt, mime_type } => {
                assert!(prompt.starts_with(&prompts.vision_prefix));
                assert!(prompt.ends_with("ما هذا التحليل؟"));
                assert_eq!(mime_type, "image/png");
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }

    #[tokio::test]
    async fn an_empty_vision_result_becomes_its_fallback() {
        let client = Arc::new(ScriptedClient::replying(""));
        let assistant = assistant_with(client);
        let prompts = PersonaPrompts::default();

        let image = InlineImage { data: vec![1], mime_type: "image/jpeg".to_string() };
        let text = assistant.analyze_vision(&image, "صورة").await.unwrap();
        assert_eq!(text, prompts.vision_fallback);
    }

    #[tokio::test]
    async fn news_runs_the_configured_prompt_one_shot() {
        let client = Arc::new(ScriptedClient::replying(""));
        let assistant = assistant_with(client.clone());
        let prompts = PersonaPrompts::default();

        let reply = assistant.fetch_latest_news().await.unwrap();
        assert_eq!(reply.text, prompts.news_fallback);

        match &client.recorded()[0] {
            Call::Grounded { prompt, instruction } => {
                assert_eq!(prompt, &prompts.news_prompt);
                assert_eq!(instruction, &prompts.news_instruction);
            }
            other => panic!("unexpected call: {:?}", other),
        }
    }
}
