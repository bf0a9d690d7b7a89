//! Conversation title generation
//!
//! A short chairman call turns the first user message into a title. Thinking
//! models wrap their output in `<think>` blocks, which are stripped; a
//! truncated query is the fallback when the model fails.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::client::{ChatMessage, ModelClient, RetryOpts};

const MAX_TITLE_WORDS: usize = 6;
const FALLBACK_CHARS: usize = 40;

static THINK_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("think regex"));

pub struct TitleService {
    client: Arc<ModelClient>,
}

impl TitleService {
    pub fn new(client: Arc<ModelClient>) -> Self {
        Self { client }
    }

    /// Generate a title for a conversation from its first user message.
    /// Always returns something usable.
    pub async fn generate_title(&self, user_message: &str) -> String {
        let prompt = format!(
            "Write a title for a conversation that starts with this message. At most \
             {MAX_TITLE_WORDS} words, no quotes, no punctuation at the end, just the title.\n\n\
             MESSAGE: {user_message}"
        );

        let model = self.client.config().chairman_model();
        let result = self
            .client
            .query_with_retry(
                &model,
                &[ChatMessage::user(prompt)],
                RetryOpts {
                    for_title: true,
                    max_retries: Some(1),
                    temperature: Some(0.3),
                    ..Default::default()
                },
            )
            .await;

        match result {
            Ok(response) => {
                let cleaned = clean_title(&response.content);
                if cleaned.is_empty() {
                    fallback_title(user_message)
                } else {
                    debug!(title = cleaned, "title generated");
                    cleaned
                }
            }
            Err(_) => fallback_title(user_message),
        }
    }
}

fn clean_title(raw: &str) -> String {
    let without_thinking = THINK_BLOCK_RE.replace_all(raw, "");

    // Reasoning output without closing tags: keep only the last line, which
    // is where such models put the actual answer.
    let last_line = without_thinking
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");

    let trimmed = last_line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '.' || c == ':')
        .trim();

    trimmed
        .split_whitespace()
        .take(MAX_TITLE_WORDS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn fallback_title(user_message: &str) -> String {
    let mut title: String = user_message.chars().take(FALLBACK_CHARS).collect();
    if user_message.chars().count() > FALLBACK_CHARS {
        title.push_str("...");
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_strips_think_blocks() {
        let raw = "<think>The user asks about weather, so...</think>\nWeather in Berlin";
        assert_eq!(clean_title(raw), "Weather in Berlin");
    }

    #[test]
    fn test_clean_caps_word_count() {
        let raw = "A very long title with far too many words in it";
        assert_eq!(clean_title(raw).split_whitespace().count(), MAX_TITLE_WORDS);
    }

    #[test]
    fn test_clean_strips_quotes() {
        assert_eq!(clean_title("\"Rust Memory Model\""), "Rust Memory Model");
    }

    #[test]
    fn test_fallback_truncates() {
        let long = "x".repeat(60);
        let title = fallback_title(&long);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), FALLBACK_CHARS + 3);
    }
}
