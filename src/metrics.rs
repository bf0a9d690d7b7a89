//! Per-model quality metrics
//!
//! Counters and rolling evaluation scores per model, persisted as a metrics
//! JSON plus an auto-generated markdown mirror. The stage engine uses
//! `evaluator_for` to pick a peer model for background response evaluation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const MAX_EVAL_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct EvalScores {
    pub verbosity: u8,
    pub expertise: u8,
    pub adherence: u8,
    pub clarity: u8,
    pub overall: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalHistory {
    pub verbosity: Vec<u8>,
    pub expertise: Vec<u8>,
    pub adherence: Vec<u8>,
    pub clarity: Vec<u8>,
    pub overall: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AverageScores {
    pub verbosity: f64,
    pub expertise: f64,
    pub adherence: f64,
    pub clarity: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub retries: u64,
    pub total_tokens_generated: u64,
    pub total_generation_time_ms: f64,
    #[serde(default)]
    pub evaluations: EvalHistory,
    #[serde(default)]
    pub average_scores: AverageScores,
    pub composite_rating: f64,
    pub rank: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MetricsData {
    models: HashMap<String, ModelMetrics>,
    last_updated: Option<String>,
}

/// File-backed metrics store. Writes happen on every record, matching the
/// append-anytime usage from background evaluation tasks.
pub struct MetricsStore {
    json_path: PathBuf,
    md_path: PathBuf,
    valid_models: Vec<String>,
    data: Mutex<MetricsData>,
}

impl MetricsStore {
    pub fn load(data_dir: &std::path::Path, valid_models: Vec<String>) -> Self {
        let json_path = data_dir.join("llm_metrics.json");
        let md_path = data_dir.join("llm_metrics.md");

        let data = std::fs::read_to_string(&json_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self {
            json_path,
            md_path,
            valid_models,
            data: Mutex::new(data),
        }
    }

    pub fn record_query_result(
        &self,
        model: &str,
        success: bool,
        tokens_generated: u64,
        generation_time_ms: f64,
        retried: bool,
    ) {
        let mut data = self.data.lock().unwrap();
        let entry = data.models.entry(model.to_string()).or_default();

        entry.total_queries += 1;
        if success {
            entry.successful_queries += 1;
            entry.total_tokens_generated += tokens_generated;
            entry.total_generation_time_ms += generation_time_ms;
        } else {
            entry.failed_queries += 1;
        }
        if retried {
            entry.retries += 1;
        }

        self.save(&mut data);
    }

    pub fn record_evaluation(&self, model: &str, scores: EvalScores) {
        let mut data = self.data.lock().unwrap();
        let entry = data.models.entry(model.to_string()).or_default();

        entry.evaluations.verbosity.push(scores.verbosity);
        entry.evaluations.expertise.push(scores.expertise);
        entry.evaluations.adherence.push(scores.adherence);
        entry.evaluations.clarity.push(scores.clarity);
        entry.evaluations.overall.push(scores.overall);

        for history in [
            &mut entry.evaluations.verbosity,
            &mut entry.evaluations.expertise,
            &mut entry.evaluations.adherence,
            &mut entry.evaluations.clarity,
            &mut entry.evaluations.overall,
        ] {
            if history.len() > MAX_EVAL_HISTORY {
                let excess = history.len() - MAX_EVAL_HISTORY;
                history.drain(..excess);
            }
        }

        let avg = |v: &[u8]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().map(|s| *s as f64).sum::<f64>() / v.len() as f64
            }
        };
        entry.average_scores = AverageScores {
            verbosity: avg(&entry.evaluations.verbosity),
            expertise: avg(&entry.evaluations.expertise),
            adherence: avg(&entry.evaluations.adherence),
            clarity: avg(&entry.evaluations.clarity),
            overall: avg(&entry.evaluations.overall),
        };

        // Weighted composite: expertise and adherence dominate.
        entry.composite_rating = entry.average_scores.verbosity * 0.1
            + entry.average_scores.expertise * 0.3
            + entry.average_scores.adherence * 0.3
            + entry.average_scores.clarity * 0.15
            + entry.average_scores.overall * 0.15;

        Self::update_rankings(&mut data);
        self.save(&mut data);
    }

    fn update_rankings(data: &mut MetricsData) {
        let mut rated: Vec<(String, f64)> = data
            .models
            .iter()
            .map(|(id, m)| (id.clone(), m.composite_rating))
            .collect();
        rated.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (rank, (id, _)) in rated.into_iter().enumerate() {
            if let Some(entry) = data.models.get_mut(&id) {
                entry.rank = rank as u32 + 1;
            }
        }
    }

    /// Drop entries for models no longer in the configured set.
    pub fn cleanup_invalid_models(&self) -> Vec<String> {
        let mut data = self.data.lock().unwrap();
        let invalid: Vec<String> = data
            .models
            .keys()
            .filter(|id| !self.valid_models.contains(id))
            .cloned()
            .collect();

        for id in &invalid {
            data.models.remove(id);
            warn!(model = id.as_str(), "removed stale model from metrics");
        }

        if !invalid.is_empty() {
            Self::update_rankings(&mut data);
            self.save(&mut data);
        }
        invalid
    }

    /// Best evaluator for a target model: the highest-rated valid model that
    /// is not the target, falling back to a random other valid model.
    pub fn evaluator_for(&self, target_model: &str) -> Option<String> {
        let data = self.data.lock().unwrap();

        let mut candidates: Vec<(&String, f64)> = data
            .models
            .iter()
            .filter(|(id, m)| {
                id.as_str() != target_model
                    && m.composite_rating > 0.0
                    && self.valid_models.contains(id)
            })
            .map(|(id, m)| (id, m.composite_rating))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((id, _)) = candidates.first() {
            return Some((*id).clone());
        }

        let others: Vec<&String> = self
            .valid_models
            .iter()
            .filter(|id| id.as_str() != target_model)
            .collect();
        others.choose(&mut rand::rng()).map(|id| (*id).clone())
    }

    pub fn all_metrics(&self) -> Value {
        let data = self.data.lock().unwrap();
        serde_json::to_value(&*data).unwrap_or_default()
    }

    /// Models sorted by rank with headline numbers, for the API.
    pub fn model_ranking(&self) -> Value {
        let data = self.data.lock().unwrap();
        let mut ranking: Vec<Value> = data
            .models
            .iter()
            .map(|(id, m)| {
                let success_rate = if m.total_queries > 0 {
                    m.successful_queries as f64 / m.total_queries as f64 * 100.0
                } else {
                    0.0
                };
                let tokens_per_sec = if m.total_generation_time_ms > 0.0 {
                    m.total_tokens_generated as f64 / (m.total_generation_time_ms / 1000.0)
                } else {
                    0.0
                };
                serde_json::json!({
                    "model": id,
                    "rank": m.rank,
                    "composite_rating": (m.composite_rating * 100.0).round() / 100.0,
                    "total_queries": m.total_queries,
                    "success_rate": (success_rate * 10.0).round() / 10.0,
                    "avg_tokens_per_sec": (tokens_per_sec * 10.0).round() / 10.0,
                    "average_scores": m.average_scores,
                })
            })
            .collect();
        ranking.sort_by_key(|v| v["rank"].as_u64().unwrap_or(u64::MAX));
        Value::Array(ranking)
    }

    fn save(&self, data: &mut MetricsData) {
        data.last_updated = Some(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());

        if let Some(parent) = self.json_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&*data) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.json_path, json) {
                    warn!(error = %e, "failed to write metrics json");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize metrics"),
        }

        if let Err(e) = std::fs::write(&self.md_path, Self::render_markdown(data)) {
            warn!(error = %e, "failed to write metrics markdown");
        }
    }

    fn render_markdown(data: &MetricsData) -> String {
        let mut sorted: Vec<(&String, &ModelMetrics)> = data.models.iter().collect();
        sorted.sort_by_key(|(_, m)| m.rank);

        let mut lines = vec![
            "# Council Model Metrics".to_string(),
            String::new(),
            format!(
                "**Last Updated:** {}",
                data.last_updated.as_deref().unwrap_or("N/A")
            ),
            String::new(),
            "## Model Rankings".to_string(),
            String::new(),
            "| Rank | Model | Rating | Success Rate | Evaluations |".to_string(),
            "|------|-------|--------|--------------|-------------|".to_string(),
        ];

        for (id, m) in &sorted {
            let success_rate = if m.total_queries > 0 {
                format!(
                    "{:.1}%",
                    m.successful_queries as f64 / m.total_queries as f64 * 100.0
                )
            } else {
                "N/A".to_string()
            };
            let display = if id.len() > 40 {
                format!("{}...", &id[..40])
            } else {
                (*id).clone()
            };
            lines.push(format!(
                "| {} | {} | {:.2}/5.0 | {} | {} |",
                m.rank,
                display,
                m.composite_rating,
                success_rate,
                m.evaluations.overall.len(),
            ));
        }

        lines.push(String::new());
        lines.push("## Detailed Scores".to_string());
        lines.push(String::new());

        for (id, m) in &sorted {
            lines.extend([
                format!("### {id}"),
                String::new(),
                format!("- **Composite Rating:** {:.2}/5.0", m.composite_rating),
                format!("- **Rank:** #{}", m.rank),
                String::new(),
                "| Category | Score |".to_string(),
                "|----------|-------|".to_string(),
                format!("| Verbosity | {:.1}/5.0 |", m.average_scores.verbosity),
                format!("| Expertise | {:.1}/5.0 |", m.average_scores.expertise),
                format!("| Adherence | {:.1}/5.0 |", m.average_scores.adherence),
                format!("| Clarity | {:.1}/5.0 |", m.average_scores.clarity),
                format!("| Overall | {:.1}/5.0 |", m.average_scores.overall),
                String::new(),
                format!(
                    "**Stats:** {}/{} successful queries, {} retries",
                    m.successful_queries, m.total_queries, m.retries
                ),
                String::new(),
            ]);
        }

        lines.join("\n")
    }
}
