//! Memory adapter over the knowledge-graph MCP server
//!
//! A thin translation layer: episodes are classified into human memory
//! types and written to per-type groups, searches fan out across all groups
//! with query expansion, and a confidence model decides whether retrieved
//! memories can answer a query outright. Identity facts (user and AI names)
//! are preloaded once in the background behind a latch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::client::{ChatMessage, ModelClient, RetryOpts};
use crate::config::Config;
use crate::events::{Event, EventSender};
use crate::mcp::McpRegistry;
use crate::prompts::extract_json_block;

const GRAPH_SERVER_NAME: &str = "graphiti";
const MEMORY_GROUP_PREFIX: &str = "llm_council";

/// Human memory types used to partition the graph into groups.
pub const MEMORY_TYPES: &[(&str, &str)] = &[
    ("episodic", "Personal experiences, events, and specific moments in time"),
    ("semantic", "General knowledge, facts, concepts, and meanings"),
    ("procedural", "How to do things, skills, processes, and step-by-step instructions"),
    ("priming", "Associations, patterns, and contextual cues that influence responses"),
    ("emotional", "Feelings, sentiments, and emotional context"),
    ("prospective", "Future intentions, plans, reminders, and goals"),
    ("autobiographical", "Information about the user's identity, preferences, and personal details"),
    ("spatial", "Location-based information, navigation, and spatial relationships"),
];

#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub kind: &'static str,
    pub memory_type: String,
    pub group_id: String,
    pub content: String,
    pub created_at: String,
    pub uuid: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfidenceResult {
    pub confidence: f64,
    pub reasoning: String,
    pub recommended_answer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryResponse {
    pub response: String,
    pub confidence: f64,
    pub memories_used: usize,
    pub reasoning: String,
}

#[derive(Debug, Default)]
struct IdentityState {
    loaded: bool,
    user_name: Option<String>,
    ai_name: Option<String>,
}

pub struct MemoryService {
    client: Arc<ModelClient>,
    registry: Arc<McpRegistry>,
    config: Arc<Config>,
    available: bool,
    identity: RwLock<IdentityState>,
    identity_loaded: Notify,
}

static USER_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)user(?:'s)?\s+name\s+is\s+(\w+)",
        r"(?i)name\s+is\s+(\w+)",
        r"(?i)called\s+(\w+)",
        r"(?i)known\s+as\s+(\w+)",
        r"(?i)i\s+am\s+(\w+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static AI_NAME_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(?:your|ai|assistant)\s+name\s+is\s+(\w+)",
        r"(?i)known\s+as\s+(\w+)",
        r"(?i)shall\s+be\s+(?:called\s+)?(\w+)",
        r"(?i)recognized\s+as\s+(\w+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

impl MemoryService {
    pub fn new(client: Arc<ModelClient>, registry: Arc<McpRegistry>, config: Arc<Config>) -> Self {
        let available = config.memory.enabled && registry.has_server(GRAPH_SERVER_NAME);
        if available {
            info!(group = config.memory.group_id, "memory service available");
        } else {
            info!("memory service unavailable, gate will be skipped");
        }
        Self {
            client,
            registry,
            config,
            available,
            identity: RwLock::new(IdentityState::default()),
            identity_loaded: Notify::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Kick off the background identity preload. Callers either check the
    /// latch or wait on it; names are exposed only once loaded.
    pub fn initialize(self: &Arc<Self>) {
        if !self.available {
            return;
        }
        let service = self.clone();
        tokio::spawn(async move {
            service.load_names_from_memory().await;
        });
    }

    pub async fn names_loaded(&self) -> bool {
        self.identity.read().await.loaded
    }

    pub async fn wait_for_names(&self, timeout: Duration) -> bool {
        if self.identity.read().await.loaded {
            return true;
        }
        tokio::time::timeout(timeout, self.identity_loaded.notified())
            .await
            .is_ok()
    }

    /// Identity block for system-prompt injection; empty until loaded.
    pub async fn identity_context(&self) -> String {
        let identity = self.identity.read().await;
        if !identity.loaded {
            return String::new();
        }

        let mut parts = vec![];
        if let Some(ai_name) = &identity.ai_name {
            parts.push(format!("Your name is {ai_name}."));
        }
        if let Some(user_name) = &identity.user_name {
            parts.push(format!("The user's name is {user_name}."));
        }

        if parts.is_empty() {
            String::new()
        } else {
            format!("IDENTITY FROM MEMORY:\n{}", parts.join(" "))
        }
    }

    async fn load_names_from_memory(&self) {
        let search_groups = json!([
            format!("{MEMORY_GROUP_PREFIX}_autobiographical"),
            format!("{MEMORY_GROUP_PREFIX}_semantic"),
            format!("{MEMORY_GROUP_PREFIX}_episodic"),
        ]);

        let ai_name = self
            .search_name(
                json!({
                    "query": "AI assistant name known as",
                    "group_ids": search_groups.clone(),
                    "max_nodes": 20,
                }),
                &AI_NAME_PATTERNS,
            )
            .await;

        let user_name = self
            .search_name(
                json!({
                    "query": "user name is called",
                    "group_ids": search_groups,
                    "max_nodes": 20,
                }),
                &USER_NAME_PATTERNS,
            )
            .await;

        let mut identity = self.identity.write().await;
        identity.ai_name = ai_name;
        identity.user_name = user_name;
        identity.loaded = true;
        info!(
            user = ?identity.user_name,
            ai = ?identity.ai_name,
            "identity preload finished"
        );
        drop(identity);
        self.identity_loaded.notify_waiters();
    }

    async fn search_name(&self, args: Value, patterns: &[Regex]) -> Option<String> {
        let outcome = self
            .registry
            .call_tool(&format!("{GRAPH_SERVER_NAME}.search_nodes"), args)
            .await;
        if outcome.is_failed() {
            return None;
        }

        let nodes = parse_result_list(&outcome.extracted_output(), "nodes");
        for node in nodes {
            let name = node.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let summary = node.get("summary").and_then(|v| v.as_str()).unwrap_or("");
            let text = format!("{name} {summary}");
            for pattern in patterns {
                if let Some(caps) = pattern.captures(&text) {
                    let found = caps[1].to_string();
                    let mut chars = found.chars();
                    let capitalized = chars
                        .next()
                        .map(|c| c.to_uppercase().collect::<String>() + chars.as_str())
                        .unwrap_or(found);
                    return Some(capitalized);
                }
            }
        }
        None
    }

    /// Classify content into one or more memory types with the
    /// categorization model; unknown answers fall back to the base group.
    pub async fn classify_memory_types(&self, content: &str) -> HashSet<String> {
        if !self.config.memory.categorization_enabled {
            return HashSet::from(["general".to_string()]);
        }

        let type_descriptions: Vec<String> = MEMORY_TYPES
            .iter()
            .map(|(name, description)| format!("- {name}: {description}"))
            .collect();
        let snippet: String = content.chars().take(500).collect();

        let prompt = format!(
            "Classify the following content into one or more memory types.\n\
             Return ONLY the type names separated by commas, nothing else.\n\n\
             Memory Types:\n{}\n\nContent to classify:\n\"{snippet}\"\n\n\
             Types (comma-separated):",
            type_descriptions.join("\n"),
        );

        let model = self.config.categorization_model();
        let result = self
            .client
            .query_with_retry(
                &model,
                &[ChatMessage::user(prompt)],
                RetryOpts {
                    timeout: Some(Duration::from_secs(30)),
                    max_retries: Some(0),
                    temperature: Some(0.1),
                    ..Default::default()
                },
            )
            .await;

        if let Ok(response) = result {
            let lower = response.content.to_lowercase();
            let found: HashSet<String> = MEMORY_TYPES
                .iter()
                .filter(|(name, _)| lower.contains(name))
                .map(|(name, _)| name.to_string())
                .collect();
            if !found.is_empty() {
                debug!(types = ?found, "memory classified");
                return found;
            }
        }

        HashSet::from(["general".to_string()])
    }

    fn group_id_for_type(&self, memory_type: &str) -> String {
        if memory_type == "general" {
            self.config.memory.group_id.clone()
        } else {
            format!("{MEMORY_GROUP_PREFIX}_{memory_type}")
        }
    }

    fn all_group_ids(&self) -> Vec<String> {
        let mut groups = vec![self.config.memory.group_id.clone()];
        groups.extend(
            MEMORY_TYPES
                .iter()
                .map(|(name, _)| format!("{MEMORY_GROUP_PREFIX}_{name}")),
        );
        groups
    }

    /// Write an episode to every classified type group plus the base group.
    pub async fn record_episode(
        &self,
        content: &str,
        source_description: &str,
        episode_type: &str,
        metadata: Value,
    ) -> bool {
        if !self.available {
            return false;
        }

        let reference_time = Utc::now();
        let mut memory_types = self.classify_memory_types(content).await;
        memory_types.insert("general".to_string());

        let all_types: Vec<&String> = memory_types.iter().collect();
        let mut recorded = 0usize;

        for memory_type in &memory_types {
            let group_id = self.group_id_for_type(memory_type);

            let mut episode_metadata = metadata.clone();
            if let Value::Object(map) = &mut episode_metadata {
                map.insert("memory_type".into(), json!(memory_type));
                map.insert("all_types".into(), json!(all_types));
            }

            let episode = json!({
                "name": format!("{episode_type}_{}", reference_time.format("%Y%m%d_%H%M%S")),
                "episode_body": content,
                "source": "council",
                "source_description": source_description,
                "reference_time": reference_time.to_rfc3339(),
                "group_id": group_id,
                "metadata": episode_metadata.to_string(),
            });

            let outcome = self
                .registry
                .call_tool(&format!("{GRAPH_SERVER_NAME}.add_memory"), episode)
                .await;

            if outcome.is_failed() {
                warn!(group = group_id, "failed to record episode");
            } else {
                recorded += 1;
            }
        }

        recorded > 0
    }

    /// Hand-authored query expansions for identity and preference lookups.
    pub fn expand_search_query(query: &str) -> Vec<String> {
        let mut expanded = vec![query.to_string()];
        let lower = query.to_lowercase();

        if ["your name", "what's your name", "who are you", "what are you called", "my name"]
            .iter()
            .any(|p| lower.contains(p))
        {
            expanded.extend(
                [
                    "name identity called known as",
                    "shall be known as",
                    "my name is",
                    "identity name",
                ]
                .map(String::from),
            );
        }

        if ["about yourself", "describe yourself", "who are you", "what are you"]
            .iter()
            .any(|p| lower.contains(p))
        {
            expanded.extend(["identity description personality", "characteristics traits"].map(String::from));
        }

        if ["prefer", "like", "favorite", "favourite"]
            .iter()
            .any(|p| lower.contains(p))
        {
            expanded.extend(["preference favorite likes dislikes", "prefers wants likes"].map(String::from));
        }

        expanded
    }

    /// Node- and fact-search across every group for each expanded query,
    /// deduplicating by uuid.
    pub async fn search_memories(&self, query: &str, limit: usize) -> Vec<MemoryHit> {
        if !self.available {
            return vec![];
        }

        let mut memories = vec![];
        let mut seen_uuids: HashSet<String> = HashSet::new();
        let per_search = (limit / 2).max(1);

        for search_query in Self::expand_search_query(query) {
            for group_id in self.all_group_ids() {
                let memory_type = group_id
                    .strip_prefix(&format!("{MEMORY_GROUP_PREFIX}_"))
                    .unwrap_or("general")
                    .to_string();

                let facts = self
                    .registry
                    .call_tool(
                        &format!("{GRAPH_SERVER_NAME}.search_memory_facts"),
                        json!({
                            "query": search_query,
                            "group_ids": [group_id],
                            "max_facts": per_search,
                        }),
                    )
                    .await;
                if !facts.is_failed() {
                    for fact in parse_result_list(&facts.extracted_output(), "facts") {
                        let uuid = fact.get("uuid").and_then(|v| v.as_str()).unwrap_or("");
                        if uuid.is_empty() || !seen_uuids.insert(uuid.to_string()) {
                            continue;
                        }
                        memories.push(MemoryHit {
                            kind: "fact",
                            memory_type: memory_type.clone(),
                            group_id: group_id.clone(),
                            content: fact
                                .get("fact")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            created_at: fact
                                .get("created_at")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            uuid: uuid.to_string(),
                        });
                    }
                }

                let nodes = self
                    .registry
                    .call_tool(
                        &format!("{GRAPH_SERVER_NAME}.search_nodes"),
                        json!({
                            "query": search_query,
                            "group_ids": [group_id],
                            "max_nodes": per_search,
                        }),
                    )
                    .await;
                if !nodes.is_failed() {
                    for node in parse_result_list(&nodes.extracted_output(), "nodes") {
                        let uuid = node.get("uuid").and_then(|v| v.as_str()).unwrap_or("");
                        if uuid.is_empty() || !seen_uuids.insert(uuid.to_string()) {
                            continue;
                        }
                        let content = node
                            .get("summary")
                            .and_then(|v| v.as_str())
                            .or_else(|| node.get("name").and_then(|v| v.as_str()))
                            .unwrap_or("")
                            .to_string();
                        memories.push(MemoryHit {
                            kind: "node",
                            memory_type: memory_type.clone(),
                            group_id: group_id.clone(),
                            content,
                            created_at: node
                                .get("created_at")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string(),
                            uuid: uuid.to_string(),
                        });
                    }
                }
            }
        }

        debug!(count = memories.len(), "memory search finished");
        memories
    }

    /// Ask the confidence model whether the memories answer the query,
    /// weighting each memory by age up to `max_memory_age_days`.
    pub async fn calculate_confidence(
        &self,
        query: &str,
        memories: &[MemoryHit],
    ) -> ConfidenceResult {
        if memories.is_empty() {
            return ConfidenceResult {
                reasoning: "No relevant memories found".into(),
                ..Default::default()
            };
        }

        let now = Utc::now();
        let max_age_secs = self.config.memory.max_memory_age_days as f64 * 86_400.0;

        let memories_text: Vec<String> = memories
            .iter()
            .take(10)
            .map(|m| {
                let recency = DateTime::parse_from_rfc3339(&m.created_at)
                    .map(|created| {
                        let age = (now - created.with_timezone(&Utc)).num_seconds() as f64;
                        if age > max_age_secs {
                            0.0
                        } else {
                            1.0 - age / max_age_secs
                        }
                    })
                    .unwrap_or(0.5);
                format!(
                    "- [{}:{}] {} (created: {}, recency weight: {:.2})",
                    m.memory_type,
                    m.kind,
                    m.content,
                    if m.created_at.is_empty() { "unknown" } else { &m.created_at },
                    recency,
                )
            })
            .collect();

        let prompt = format!(
            "You are evaluating whether stored memories can answer a user query with high \
             confidence.\n\n\
             USER QUERY: {query}\n\n\
             RETRIEVED MEMORIES (with recency):\n{}\n\n\
             EVALUATION CRITERIA:\n\
             1. RELEVANCE (0-1): How directly do the memories address the query?\n\
             2. COMPLETENESS (0-1): Do the memories contain enough to fully answer?\n\
             3. RECENCY (0-1): Are the memories recent enough to be trusted?\n\
             4. CERTAINTY (0-1): How confident can we be that they are still accurate?\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"confidence\": <0-1>, \"reasoning\": \"<brief>\", \
             \"recommended_answer\": \"<answer from memories if confidence >= 0.7, else null>\"}}",
            memories_text.join("\n"),
        );

        let model = self.config.confidence_model();
        let result = self
            .client
            .query_with_retry(
                &model,
                &[ChatMessage::user(prompt)],
                RetryOpts {
                    timeout: Some(Duration::from_secs(30)),
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await;

        let Ok(response) = result else {
            return ConfidenceResult {
                reasoning: "Confidence model failed to respond".into(),
                ..Default::default()
            };
        };

        let Ok(parsed) =
            serde_json::from_str::<Value>(&extract_json_block(&response.content))
        else {
            return ConfidenceResult {
                reasoning: "Failed to parse confidence response".into(),
                ..Default::default()
            };
        };

        ConfidenceResult {
            confidence: parsed
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            reasoning: parsed
                .get("reasoning")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            recommended_answer: parsed
                .get("recommended_answer")
                .and_then(|v| v.as_str())
                .map(String::from),
        }
    }

    /// The memory gate: search, score, and answer directly when confidence
    /// clears the threshold and an answer was recommended.
    pub async fn get_memory_response(
        &self,
        query: &str,
        events: &EventSender,
    ) -> Option<MemoryResponse> {
        if !self.available {
            return None;
        }

        let memories = self.search_memories(query, 10).await;
        if memories.is_empty() {
            events.send(Event::MemoryCheckComplete {
                using_memory: false,
                confidence: 0.0,
            });
            return None;
        }

        events.send(Event::MemorySearchComplete {
            found_memories: memories.len(),
            sample: memories
                .iter()
                .take(3)
                .map(|m| m.content.chars().take(100).collect())
                .collect(),
        });

        let result = self.calculate_confidence(query, &memories).await;
        let threshold = self.config.memory.confidence_threshold;

        events.send(Event::MemoryConfidenceCalculated {
            confidence: result.confidence,
            threshold,
            reasoning: result.reasoning.clone(),
        });

        if result.confidence >= threshold {
            if let Some(answer) = result.recommended_answer {
                return Some(MemoryResponse {
                    response: answer,
                    confidence: result.confidence,
                    memories_used: memories.len(),
                    reasoning: result.reasoning,
                });
            }
        }

        events.send(Event::MemoryCheckComplete {
            using_memory: false,
            confidence: result.confidence,
        });
        None
    }

    pub async fn record_user_message(&self, content: &str, conversation_id: &str) {
        self.record_episode(
            content,
            "user",
            "user_message",
            json!({"conversation_id": conversation_id}),
        )
        .await;
    }

    pub async fn record_council_response(
        &self,
        content: &str,
        model: &str,
        stage: u8,
        conversation_id: &str,
    ) {
        self.record_episode(
            content,
            &format!("council:{model}"),
            &format!("stage{stage}_response"),
            json!({"conversation_id": conversation_id, "model": model, "stage": stage}),
        )
        .await;
    }

    pub async fn record_chairman_synthesis(
        &self,
        content: &str,
        model: &str,
        conversation_id: &str,
    ) {
        self.record_episode(
            content,
            &format!("chairman:{model}"),
            "chairman_synthesis",
            json!({"conversation_id": conversation_id, "model": model}),
        )
        .await;
    }

    pub async fn record_direct_response(
        &self,
        query: &str,
        response: &str,
        model: &str,
        conversation_id: &str,
    ) {
        let combined = format!("Q: {query}\n\nA: {response}");
        self.record_episode(
            &combined,
            &format!("direct:{model}"),
            "direct_response",
            json!({"conversation_id": conversation_id, "model": model}),
        )
        .await;
    }

    /// Status document for the read-only HTTP endpoint.
    pub fn status(&self) -> Value {
        let memory = &self.config.memory;
        json!({
            "available": self.available,
            "enabled": memory.enabled,
            "confidence_threshold": memory.confidence_threshold,
            "max_memory_age_days": memory.max_memory_age_days,
            "group_id": memory.group_id,
            "record_user_messages": memory.record_user_messages,
            "record_council_responses": memory.record_council_responses,
            "record_chairman_synthesis": memory.record_chairman_synthesis,
        })
    }
}

/// Graph tool results come back as either `{"facts": [...]}`-style objects
/// or bare arrays; accept both.
fn parse_result_list(output: &Value, key: &str) -> Vec<Value> {
    match output {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get(key) {
                items.clone()
            } else if let Some(inner) = map.get("result") {
                parse_result_list(inner, key)
            } else {
                vec![]
            }
        }
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_for_identity_queries() {
        let expanded = MemoryService::expand_search_query("What's my name?");
        assert!(expanded.len() > 1);
        assert!(expanded.iter().any(|q| q.contains("my name is")));
        assert_eq!(expanded[0], "What's my name?");
    }

    #[test]
    fn test_expansion_passthrough_for_plain_queries() {
        let expanded = MemoryService::expand_search_query("how do rockets work");
        assert_eq!(expanded, vec!["how do rockets work"]);
    }

    #[test]
    fn test_parse_result_list_shapes() {
        let bare = json!([{"uuid": "1"}]);
        assert_eq!(parse_result_list(&bare, "facts").len(), 1);

        let keyed = json!({"facts": [{"uuid": "1"}, {"uuid": "2"}]});
        assert_eq!(parse_result_list(&keyed, "facts").len(), 2);

        let nested = json!({"result": {"nodes": [{"uuid": "3"}]}});
        assert_eq!(parse_result_list(&nested, "nodes").len(), 1);

        assert!(parse_result_list(&json!("text"), "facts").is_empty());
    }

    #[test]
    fn test_user_name_pattern_extraction() {
        let text = "The user's name is Mark and they like chess";
        let caps = USER_NAME_PATTERNS[0].captures(text).unwrap();
        assert_eq!(&caps[1], "Mark");
    }
}
