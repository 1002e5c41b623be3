use serde::{ Serialize, Deserialize };

use crate::models::chat::{ Persona, Source };

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "chat")] Chat {
        content: String,
    },
    #[serde(rename = "set_persona")] SetPersona {
        persona: Persona,
    },
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The conversation was (re)initialized and holds only the greeting.
    #[serde(rename = "reset")] Reset {
        persona: Persona,
        greeting: String,
        timestamp: i64,
    },
    #[serde(rename = "response")] Response {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sources: Vec<Source>,
        timestamp: i64,
    },
    #[serde(rename = "error")] Error {
        message: String,
    },
    #[serde(rename = "processing")]
    Processing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_chat_frame_deserializes() {
        let frame = r#"{"type":"chat","content":"ما هي شروط القبول؟"}"#;
        match serde_json::from_str::<ClientMessage>(frame).unwrap() {
            ClientMessage::Chat { content } => assert_eq!(content, "ما هي شروط القبول؟"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn client_persona_frame_deserializes() {
        let frame = r#"{"type":"set_persona","persona":"advisor"}"#;
        match serde_json::from_str::<ClientMessage>(frame).unwrap() {
            ClientMessage::SetPersona { persona } => assert_eq!(persona, Persona::Advisor),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn response_frame_is_tagged_and_drops_empty_sources() {
        let frame = ServerMessage::Response {
            content: "جواب".to_string(),
            sources: Vec::new(),
            timestamp: 1,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"response""#));
        assert!(!json.contains("sources"));
    }
}
