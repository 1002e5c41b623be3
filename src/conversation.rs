use log::error;
use std::sync::Arc;

use crate::config::prompt::PersonaPrompts;
use crate::llm::{ ClientError, HistoryEntry };
use crate::models::chat::{ ChatReply, Message, Persona };

/// Snapshot handed to the model gateway when a send begins. The history
/// holds every message that preceded the prompt, greeting included.
#[derive(Clone, Debug)]
pub struct OutboundTurn {
    pub prompt: String,
    pub history: Vec<HistoryEntry>,
    pub persona: Persona,
    pub epoch: u64,
}

/// Ordered transcript of one conversation plus its send state.
///
/// The transcript always starts with the persona greeting. A send is a
/// two-phase affair: `begin_send` appends the user message and marks the
/// turn in flight, `resolve` appends the model reply (or the fixed error
/// wording) and clears the flag. At most one turn is in flight at a time;
/// `begin_send` refuses a second one. Switching persona resets the
/// transcript and bumps the epoch so a reply still in flight for the old
/// transcript resolves into nothing.
pub struct ChatSession {
    persona: Persona,
    messages: Vec<Message>,
    pending: bool,
    epoch: u64,
    prompts: Arc<PersonaPrompts>,
}

impl ChatSession {
    pub fn new(persona: Persona, prompts: Arc<PersonaPrompts>) -> Self {
        let mut session = Self {
            persona,
            messages: Vec::new(),
            pending: false,
            epoch: 0,
            prompts,
        };
        session.reset();
        session
    }

    fn reset(&mut self) {
        self.messages.clear();
        self.messages.push(Message::model(self.prompts.greeting(self.persona), Vec::new()));
        self.pending = false;
        self.epoch += 1;
    }

    pub fn persona(&self) -> Persona {
        self.persona
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The transcript is never empty: reset always seeds it with the
    /// greeting.
    pub fn greeting(&self) -> &Message {
        &self.messages[0]
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Starts a turn. Returns `None` without touching the transcript when
    /// the input is empty or whitespace, or when a turn is already in
    /// flight.
    pub fn begin_send(&mut self, input: &str) -> Option<OutboundTurn> {
        if input.trim().is_empty() || self.pending {
            return None;
        }

        let history: Vec<HistoryEntry> = self.messages
            .iter()
            .map(|message| HistoryEntry {
                role: message.role,
                text: message.text.clone(),
            })
            .collect();

        self.messages.push(Message::user(input));
        self.pending = true;

        Some(OutboundTurn {
            prompt: input.to_string(),
            history,
            persona: self.persona,
            epoch: self.epoch,
        })
    }

    /// Lands the gateway outcome for the turn started at `epoch`. A failed
    /// call becomes a model message with the fixed error wording. A stale
    /// epoch means the transcript was reset while the call was in flight;
    /// the outcome is discarded and `None` returned.
    pub fn resolve(
        &mut self,
        epoch: u64,
        result: Result<ChatReply, ClientError>
    ) -> Option<&Message> {
        if epoch != self.epoch || !self.pending {
            return None;
        }
        self.pending = false;

        let message = match result {
            Ok(reply) => Message::model(reply.text, reply.sources),
            Err(err) => {
                error!("Chat turn failed: {}", err);
                Message::model(self.prompts.chat_error.clone(), Vec::new())
            }
        };
        self.messages.push(message);
        self.messages.last()
    }

    /// Switches persona and resets the transcript to that persona's
    /// greeting, dropping any turn still in flight.
    pub fn set_persona(&mut self, persona: Persona) {
        self.persona = persona;
        self.reset();
    }
}
