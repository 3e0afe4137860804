//! Generation input and output

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    Text(String),
    Messages(Vec<Message>),
}

impl From<&str> for Input {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    /// The progress callback asked the engine to stop
    Cancelled,
    ContextLimitReached,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputStats {
    pub tokens_count_input: u64,
    pub tokens_count_output: u64,
    pub duration_secs: f64,
}

impl OutputStats {
    pub fn tokens_per_second(&self) -> f64 {
        if self.duration_secs <= 0.0 {
            return 0.0;
        }
        self.tokens_count_output as f64 / self.duration_secs
    }
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Generated text split into the model's thinking and its answer.
///
/// While thinking is still open, `response` is `None`. Text without a
/// thinking block is all response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedText {
    pub reasoning: Option<String>,
    pub response: Option<String>,
}

impl ParsedText {
    pub fn parse(original: &str) -> Self {
        let non_empty = |text: &str| {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        };

        let Some((before, rest)) = original.split_once(THINK_OPEN) else {
            return Self {
                reasoning: None,
                response: non_empty(original),
            };
        };
        match rest.split_once(THINK_CLOSE) {
            Some((reasoning, after)) => Self {
                reasoning: non_empty(reasoning),
                response: non_empty(&format!("{before}{after}")),
            },
            None => Self {
                reasoning: non_empty(rest),
                response: None,
            },
        }
    }

    /// Decode the response as JSON
    pub fn structured_response<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_str(self.response.as_deref()?).ok()
    }
}

/// Generated output.
///
/// Partial outputs are cumulative: `text` is everything generated so far.
/// The final output returned by a run replaces, rather than extends, the last
/// partial one. `text` is the original text, thinking included; see
/// [`Output::parsed`] for the split view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub text: String,
    pub stats: OutputStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl Output {
    pub fn parsed(&self) -> ParsedText {
        ParsedText::parse(&self.text)
    }

    /// Parse the response as JSON, for runs constrained by a JSON schema grammar
    pub fn structured<T: DeserializeOwned>(&self) -> Option<T> {
        self.parsed().structured_response()
    }

    pub fn was_cancelled(&self) -> bool {
        self.finish_reason == Some(FinishReason::Cancelled)
    }
}
