use chrono::Utc;
use serde::{ Serialize, Deserialize };
use std::fmt;
use std::str::FromStr;

/// Fallback label for a source whose title came back empty.
pub const SOURCE_LINK_LABEL: &str = "رابط مصدر";

const SOURCE_LABEL_MAX_CHARS: usize = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    #[default]
    General,
    Advisor,
}

impl Persona {
    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::General => "general",
            Persona::Advisor => "advisor",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsePersonaError {
    message: String,
}

impl fmt::Display for ParsePersonaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParsePersonaError {}
impl FromStr for Persona {
    type Err = ParsePersonaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "general" => Ok(Persona::General),
            "advisor" => Ok(Persona::Advisor),
            _ =>
                Err(ParsePersonaError {
                    message: format!("Invalid persona: '{}'", s),
                }),
        }
    }
}

/// One citation returned alongside a grounded completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

impl Source {
    /// Label suitable for rendering as a link: the title cut to 30
    /// characters, or a generic Arabic label when the title is empty.
    pub fn short_label(&self) -> String {
        if self.title.is_empty() {
            return SOURCE_LINK_LABEL.to_string();
        }
        if self.title.chars().count() <= SOURCE_LABEL_MAX_CHARS {
            return self.title.clone();
        }
        let cut: String = self.title.chars().take(SOURCE_LABEL_MAX_CHARS).collect();
        format!("{}...", cut)
    }
}

/// Normalized result of a single model call: the completion text plus
/// whatever citations the grounding pipeline attached to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub text: String,
    pub sources: Vec<Source>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grounding_sources: Vec<Source>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now().timestamp(),
            grounding_sources: Vec::new(),
        }
    }

    pub fn model(text: impl Into<String>, grounding_sources: Vec<Source>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            timestamp: Utc::now().timestamp(),
            grounding_sources,
        }
    }
}
