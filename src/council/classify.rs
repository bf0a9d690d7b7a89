//! Query classification
//!
//! One low-temperature call decides the route: `factual` and `chat` get a
//! direct chairman response, `deliberation` gets the full council. Any parse
//! failure defaults to deliberation, the safe (if expensive) branch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{ChatMessage, RetryOpts};
use crate::prompts::extract_json_block;

use super::Council;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub requires_tools: bool,
    #[serde(default)]
    pub reasoning: String,
}

impl Default for Classification {
    fn default() -> Self {
        Self {
            kind: "deliberation".to_string(),
            requires_tools: false,
            reasoning: "classification unavailable, defaulting to deliberation".to_string(),
        }
    }
}

impl Classification {
    pub fn is_direct(&self) -> bool {
        matches!(self.kind.as_str(), "factual" | "chat")
    }
}

const VALID_KINDS: &[&str] = &["factual", "chat", "deliberation"];

impl Council {
    pub async fn classify_message(&self, query: &str) -> Classification {
        let prompt = format!(
            "Classify this user message for routing.\n\n\
             MESSAGE: \"{query}\"\n\n\
             Categories:\n\
             - factual: a simple factual question with a short, checkable answer\n\
             - chat: small talk, greetings, or conversational filler\n\
             - deliberation: anything open-ended, comparative, creative, or multi-faceted \
             that benefits from multiple perspectives\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"type\": \"factual|chat|deliberation\", \"requires_tools\": true or false, \
             \"reasoning\": \"one sentence\"}}"
        );

        let model = self.config.classification_model();
        let result = self
            .client
            .query_with_retry(
                &model,
                &[ChatMessage::user(prompt)],
                RetryOpts {
                    timeout: Some(Duration::from_secs(15)),
                    max_retries: Some(1),
                    temperature: Some(0.0),
                    ..Default::default()
                },
            )
            .await;

        let Ok(response) = result else {
            return Classification::default();
        };

        match serde_json::from_str::<Classification>(&extract_json_block(&response.content)) {
            Ok(classification) if VALID_KINDS.contains(&classification.kind.as_str()) => {
                debug!(kind = classification.kind, "message classified");
                classification
            }
            _ => Classification::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_deliberation() {
        let classification = Classification::default();
        assert_eq!(classification.kind, "deliberation");
        assert!(!classification.is_direct());
    }

    #[test]
    fn test_factual_and_chat_are_direct() {
        for kind in ["factual", "chat"] {
            let c = Classification {
                kind: kind.into(),
                requires_tools: false,
                reasoning: String::new(),
            };
            assert!(c.is_direct());
        }
    }

    #[test]
    fn test_deserializes_wire_shape() {
        let c: Classification = serde_json::from_str(
            r#"{"type": "factual", "requires_tools": true, "reasoning": "simple lookup"}"#,
        )
        .unwrap();
        assert_eq!(c.kind, "factual");
        assert!(c.requires_tools);
    }
}
