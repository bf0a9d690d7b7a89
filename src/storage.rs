//! Conversation storage
//!
//! One JSON document per conversation under the data directory. The core
//! only reads documents and appends messages; the final council answer is
//! additionally mirrored to a markdown file beside the data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::council::{Stage1Entry, Stage2Entry};
use crate::mcp::ToolOutcome;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        stage1: Vec<Stage1Entry>,
        stage2: Vec<Stage2Entry>,
        stage3: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_result: Option<ToolOutcome>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub created_at: String,
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationMeta {
    pub id: String,
    pub created_at: String,
    pub title: String,
    pub message_count: usize,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<f64>,
    pub tags: Vec<String>,
}

static TAGS_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<!--\s*tags:\s*([^|]+)").expect("tags regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"#\w+").expect("tag regex"));
static UNSAFE_FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("filename regex"));

/// Filesystem-backed conversation store.
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn conversation_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(format!("{id}.json"))
    }

    fn ensure_data_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))
    }

    /// Create a conversation titled `Conversation <first-8-of-id>`.
    pub fn create_conversation(&self) -> Result<Conversation> {
        let id = Uuid::new_v4().to_string();
        let conversation = Conversation {
            title: format!("Conversation {}", &id[..8]),
            id,
            created_at: Utc::now().to_rfc3339(),
            messages: vec![],
            deleted: false,
            deleted_at: None,
        };
        self.save(&conversation)?;
        Ok(conversation)
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        let content = std::fs::read_to_string(self.conversation_path(id)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn save(&self, conversation: &Conversation) -> Result<()> {
        self.ensure_data_dir()?;
        let json = serde_json::to_string_pretty(conversation)?;
        std::fs::write(self.conversation_path(&conversation.id), json)
            .with_context(|| format!("writing conversation {}", conversation.id))
    }

    /// Metadata for every stored conversation, newest first. Tags come from
    /// an optional `<!-- tags: #a #b | ... -->` comment in the first user
    /// message.
    pub fn list(&self) -> Vec<ConversationMeta> {
        let Ok(entries) = std::fs::read_dir(&self.data_dir) else {
            return vec![];
        };

        let mut conversations: Vec<ConversationMeta> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let content = std::fs::read_to_string(e.path()).ok()?;
                let conversation: Conversation = serde_json::from_str(&content).ok()?;
                Some(ConversationMeta {
                    tags: extract_tags(&conversation),
                    message_count: conversation.messages.len(),
                    id: conversation.id,
                    created_at: conversation.created_at,
                    title: conversation.title,
                    deleted: conversation.deleted,
                    deleted_at: conversation.deleted_at,
                })
            })
            .collect();

        conversations.sort_by(|a, b| {
            let ts = |meta: &ConversationMeta| {
                DateTime::parse_from_rfc3339(&meta.created_at)
                    .map(|d| d.timestamp_micros())
                    .unwrap_or(0)
            };
            ts(b).cmp(&ts(a))
        });

        conversations
    }

    pub fn add_user_message(&self, id: &str, content: &str) -> Result<()> {
        let mut conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;
        conversation.messages.push(Message::User {
            content: content.to_string(),
        });
        self.save(&conversation)
    }

    pub fn add_assistant_message(
        &self,
        id: &str,
        stage1: Vec<Stage1Entry>,
        stage2: Vec<Stage2Entry>,
        stage3: Value,
        tool_result: Option<ToolOutcome>,
    ) -> Result<()> {
        let mut conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;
        conversation.messages.push(Message::Assistant {
            stage1,
            stage2,
            stage3,
            tool_result,
        });
        self.save(&conversation)
    }

    pub fn update_title(&self, id: &str, title: &str) -> Result<()> {
        let mut conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;
        conversation.title = title.to_string();
        self.save(&conversation)
    }

    /// Keep messages up to and including `index`; used by re-runs.
    pub fn truncate_messages(&self, id: &str, index: usize) -> Result<()> {
        let mut conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;
        conversation.messages.truncate(index + 1);
        self.save(&conversation)
    }

    pub fn soft_delete(&self, id: &str) -> Result<()> {
        let mut conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;
        conversation.deleted = true;
        conversation.deleted_at = Some(Utc::now().timestamp_millis() as f64 / 1000.0);
        self.save(&conversation)
    }

    pub fn restore(&self, id: &str) -> Result<()> {
        let mut conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;
        conversation.deleted = false;
        conversation.deleted_at = None;
        self.save(&conversation)
    }

    pub fn delete_permanent(&self, id: &str) -> bool {
        std::fs::remove_file(self.conversation_path(id)).is_ok()
    }

    /// Mirror the final answer to `<sanitized_title>__<UTC timestamp>.md`
    /// beside the data directory.
    pub fn save_final_answer_markdown(&self, id: &str, final_answer: &str) -> Result<PathBuf> {
        let conversation = self
            .get(id)
            .with_context(|| format!("conversation {id} not found"))?;

        let safe_title: String = UNSAFE_FILENAME_RE
            .replace_all(&conversation.title, "_")
            .chars()
            .take(100)
            .collect();

        let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let filename = format!("{safe_title}__{timestamp}.md");
        let path = self
            .data_dir
            .parent()
            .unwrap_or(&self.data_dir)
            .join(filename);

        let user_query = conversation
            .messages
            .iter()
            .find_map(|m| match m {
                Message::User { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or("");

        let markdown = format!(
            "# {title}\n\n**Generated:** {generated} UTC\n\n## User Query\n\n{user_query}\n\n\
             ## Final Council Answer\n\n{final_answer}\n",
            title = conversation.title,
            generated = Utc::now().format("%Y-%m-%d %H:%M:%S"),
        );

        std::fs::write(&path, markdown)
            .with_context(|| format!("writing final answer to {}", path.display()))?;
        info!(path = %path.display(), "saved final answer markdown");
        Ok(path)
    }
}

fn extract_tags(conversation: &Conversation) -> Vec<String> {
    let first_user = conversation.messages.iter().find_map(|m| match m {
        Message::User { content } => Some(content.as_str()),
        _ => None,
    });

    let Some(content) = first_user else {
        return vec![];
    };
    let Some(caps) = TAGS_COMMENT_RE.captures(content) else {
        return vec![];
    };

    TAG_RE
        .find_iter(&caps[1])
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_create_uses_id_prefix_title() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let conversation = storage.create_conversation().unwrap();
        assert_eq!(
            conversation.title,
            format!("Conversation {}", &conversation.id[..8])
        );
    }

    #[test]
    fn test_append_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let conversation = storage.create_conversation().unwrap();

        storage
            .add_user_message(&conversation.id, "hello")
            .unwrap();
        storage
            .add_assistant_message(
                &conversation.id,
                vec![],
                vec![],
                json!({"model": "chair", "response": "hi"}),
                None,
            )
            .unwrap();

        let loaded = storage.get(&conversation.id).unwrap();
        assert_eq!(loaded.messages.len(), 2);
        match &loaded.messages[1] {
            Message::Assistant { stage3, .. } => {
                assert_eq!(stage3["response"], "hi");
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn test_tags_from_first_user_message() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let conversation = storage.create_conversation().unwrap();
        storage
            .add_user_message(
                &conversation.id,
                "<!-- tags: #Rust #async | meta --> How do futures work?",
            )
            .unwrap();

        let list = storage.list();
        assert_eq!(list[0].tags, vec!["#rust", "#async"]);
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let conversation = storage.create_conversation().unwrap();

        storage.soft_delete(&conversation.id).unwrap();
        assert!(storage.get(&conversation.id).unwrap().deleted);

        storage.restore(&conversation.id).unwrap();
        let restored = storage.get(&conversation.id).unwrap();
        assert!(!restored.deleted);
        assert!(restored.deleted_at.is_none());
    }

    #[test]
    fn test_truncate_for_rerun() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let conversation = storage.create_conversation().unwrap();
        for text in ["one", "two", "three"] {
            storage.add_user_message(&conversation.id, text).unwrap();
        }

        storage.truncate_messages(&conversation.id, 0).unwrap();
        assert_eq!(storage.get(&conversation.id).unwrap().messages.len(), 1);
    }

    #[test]
    fn test_final_answer_markdown() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let storage = Storage::new(&data_dir);
        let conversation = storage.create_conversation().unwrap();
        storage
            .add_user_message(&conversation.id, "what is rust?")
            .unwrap();

        let path = storage
            .save_final_answer_markdown(&conversation.id, "A systems language.")
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("## User Query"));
        assert!(content.contains("what is rust?"));
        assert!(content.contains("A systems language."));
        // The mirror lands beside the data dir, not inside it.
        assert_eq!(path.parent().unwrap(), dir.path());
    }

    #[test]
    fn test_list_sorted_newest_first() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let mut first = storage.create_conversation().unwrap();
        first.created_at = "2026-01-01T00:00:00+00:00".into();
        storage.save(&first).unwrap();
        let mut second = storage.create_conversation().unwrap();
        second.created_at = "2026-06-01T00:00:00+00:00".into();
        storage.save(&second).unwrap();

        let list = storage.list();
        assert_eq!(list[0].id, second.id);
        assert_eq!(list[1].id, first.id);
    }
}
