//! Stage-2 ranking text parsing and aggregate rank computation
//!
//! Rankers are asked for a `FINAL RANKING:` block with one
//! `N. Response X (k/5) - reason` line per response. Parsing is forgiving:
//! ratings fall back through three grammars and then to positional values,
//! and a missing block degrades to mention-order scanning.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::Stage2Entry;

/// Assign anonymized labels `Response A`, `Response B`, ... in stage-1
/// order. The mapping is stable across rounds.
pub fn make_labels(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("Response {}", (b'A' + (i % 26) as u8) as char))
        .collect()
}

static RANK_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+[.)]\s*(Response [A-Z])").expect("rank line regex"));

static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Response [A-Z]").expect("label regex"));

/// Parse a ranker's output into (ordered labels, label -> rating).
///
/// Rating extraction tries `(N/5)`, then `: N/5`, then `- N/5` next to the
/// label; labels never rated get their positional rating (1st = 5, 2nd = 4,
/// down to 1).
pub fn parse_ranking(text: &str, labels: &[String]) -> (Vec<String>, HashMap<String, f64>) {
    let block = text
        .rfind("FINAL RANKING:")
        .map(|idx| &text[idx..])
        .unwrap_or(text);

    let mut parsed: Vec<String> = vec![];
    for caps in RANK_LINE_RE.captures_iter(block) {
        let label = caps[1].to_string();
        if labels.contains(&label) && !parsed.contains(&label) {
            parsed.push(label);
        }
    }

    // No numbered block at all: fall back to mention order over the text.
    if parsed.is_empty() {
        for m in LABEL_RE.find_iter(block) {
            let label = m.as_str().to_string();
            if labels.contains(&label) && !parsed.contains(&label) {
                parsed.push(label);
            }
        }
    }

    let mut ratings: HashMap<String, f64> = HashMap::new();
    for label in labels {
        if let Some(rating) = extract_rating(block, label) {
            ratings.insert(label.clone(), rating);
        }
    }

    // Positional fallback for anything the ranker did not rate explicitly.
    for (position, label) in parsed.iter().enumerate() {
        ratings
            .entry(label.clone())
            .or_insert_with(|| (5_i64 - position as i64).max(1) as f64);
    }

    (parsed, ratings)
}

fn extract_rating(text: &str, label: &str) -> Option<f64> {
    let patterns = [
        format!(r"{label}\s*\((\d+(?:\.\d+)?)/5\)"),
        format!(r"{label}\s*:\s*(\d+(?:\.\d+)?)/5"),
        format!(r"{label}\s*-\s*(\d+(?:\.\d+)?)/5"),
    ];

    for pattern in &patterns {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(caps) = re.captures(text) {
                if let Ok(value) = caps[1].parse::<f64>() {
                    return Some(value.clamp(1.0, 5.0));
                }
            }
        }
    }
    None
}

/// Per-label feedback sentences pulled from a ranking text. At most
/// `max_items` are consolidated downstream.
pub fn extract_feedback(text: &str, label: &str) -> Vec<String> {
    let pattern = format!(r"{label}[^.!?\n]*[.!?]");
    let Ok(re) = Regex::new(&pattern) else {
        return vec![];
    };
    re.find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateRank {
    pub model: String,
    pub average_position: f64,
    pub rankings_counted: usize,
    pub rank: usize,
}

/// Aggregate over the final round: each model's average position across all
/// rankings that reference its label; lower is better; ties break by
/// stage-1 insertion order.
pub fn calculate_aggregate_rankings(
    final_round: &[Stage2Entry],
    label_to_model: &[(String, String)],
) -> Vec<AggregateRank> {
    let mut positions: HashMap<&str, Vec<usize>> = HashMap::new();

    for entry in final_round {
        for (position, label) in entry.parsed_ranking.iter().enumerate() {
            if let Some((_, model)) = label_to_model.iter().find(|(l, _)| l == label) {
                positions.entry(model.as_str()).or_default().push(position + 1);
            }
        }
    }

    let mut aggregates: Vec<AggregateRank> = label_to_model
        .iter()
        .filter_map(|(_, model)| {
            let model_positions = positions.get(model.as_str())?;
            let average =
                model_positions.iter().sum::<usize>() as f64 / model_positions.len() as f64;
            Some(AggregateRank {
                model: model.clone(),
                average_position: average,
                rankings_counted: model_positions.len(),
                rank: 0,
            })
        })
        .collect();

    // Stable sort keeps insertion order among equal averages.
    aggregates.sort_by(|a, b| {
        a.average_position
            .partial_cmp(&b.average_position)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for (index, agg) in aggregates.iter_mut().enumerate() {
        agg.rank = index + 1;
    }

    aggregates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels3() -> Vec<String> {
        make_labels(3)
    }

    fn entry(model: &str, parsed: &[&str]) -> Stage2Entry {
        Stage2Entry {
            model: model.to_string(),
            ranking_text: String::new(),
            parsed_ranking: parsed.iter().map(|s| s.to_string()).collect(),
            quality_ratings: HashMap::new(),
            round: 1,
        }
    }

    #[test]
    fn test_labels_are_stable_bijection() {
        assert_eq!(
            make_labels(3),
            vec!["Response A", "Response B", "Response C"]
        );
    }

    #[test]
    fn test_parse_canonical_block() {
        let text = "Some analysis first.\n\nFINAL RANKING:\n\
                    1. Response B (5/5) - thorough and accurate\n\
                    2. Response A (3/5) - missed edge cases\n\
                    3. Response C (1/5) - incorrect conclusion\n";
        let (order, ratings) = parse_ranking(text, &labels3());
        assert_eq!(order, vec!["Response B", "Response A", "Response C"]);
        assert_eq!(ratings["Response B"], 5.0);
        assert_eq!(ratings["Response A"], 3.0);
        assert_eq!(ratings["Response C"], 1.0);
    }

    #[test]
    fn test_colon_and_dash_rating_grammars() {
        let text = "FINAL RANKING:\n1. Response A: 4/5 good\n2. Response B - 2/5 weak\n";
        let (_, ratings) = parse_ranking(text, &labels3());
        assert_eq!(ratings["Response A"], 4.0);
        assert_eq!(ratings["Response B"], 2.0);
    }

    #[test]
    fn test_positional_fallback_when_unrated() {
        let text = "FINAL RANKING:\n1. Response C\n2. Response A\n3. Response B\n";
        let (order, ratings) = parse_ranking(text, &labels3());
        assert_eq!(order, vec!["Response C", "Response A", "Response B"]);
        assert_eq!(ratings["Response C"], 5.0);
        assert_eq!(ratings["Response A"], 4.0);
        assert_eq!(ratings["Response B"], 3.0);
    }

    #[test]
    fn test_missing_block_scans_mentions() {
        let text = "I think Response B is best, then Response A. Response C trails.";
        let (order, _) = parse_ranking(text, &labels3());
        assert_eq!(order, vec!["Response B", "Response A", "Response C"]);
    }

    #[test]
    fn test_unknown_labels_ignored() {
        let text = "FINAL RANKING:\n1. Response Z (5/5)\n2. Response A (4/5)\n";
        let (order, ratings) = parse_ranking(text, &labels3());
        assert_eq!(order, vec!["Response A"]);
        assert!(!ratings.contains_key("Response Z"));
    }

    #[test]
    fn test_ratings_clamped_to_scale() {
        let text = "FINAL RANKING:\n1. Response A (9/5)\n";
        let (_, ratings) = parse_ranking(text, &labels3());
        assert_eq!(ratings["Response A"], 5.0);
    }

    #[test]
    fn test_last_final_ranking_block_wins() {
        let text = "FINAL RANKING:\n1. Response A (2/5)\n\nOn reflection:\n\
                    FINAL RANKING:\n1. Response B (5/5)\n2. Response A (4/5)\n";
        let (order, ratings) = parse_ranking(text, &labels3());
        assert_eq!(order[0], "Response B");
        assert_eq!(ratings["Response A"], 4.0);
    }

    #[test]
    fn test_aggregate_average_positions() {
        let label_to_model = vec![
            ("Response A".to_string(), "model-a".to_string()),
            ("Response B".to_string(), "model-b".to_string()),
        ];
        let round = vec![
            entry("model-a", &["Response B", "Response A"]),
            entry("model-b", &["Response B", "Response A"]),
        ];
        let aggregates = calculate_aggregate_rankings(&round, &label_to_model);
        assert_eq!(aggregates[0].model, "model-b");
        assert_eq!(aggregates[0].average_position, 1.0);
        assert_eq!(aggregates[0].rank, 1);
        assert_eq!(aggregates[1].model, "model-a");
        assert_eq!(aggregates[1].average_position, 2.0);
    }

    #[test]
    fn test_aggregate_stable_under_ranker_identity_permutation() {
        let label_to_model = vec![
            ("Response A".to_string(), "model-a".to_string()),
            ("Response B".to_string(), "model-b".to_string()),
        ];
        let forward = vec![
            entry("model-a", &["Response A", "Response B"]),
            entry("model-b", &["Response B", "Response A"]),
        ];
        let swapped = vec![
            entry("model-b", &["Response B", "Response A"]),
            entry("model-a", &["Response A", "Response B"]),
        ];
        let a = calculate_aggregate_rankings(&forward, &label_to_model);
        let b = calculate_aggregate_rankings(&swapped, &label_to_model);
        assert_eq!(a[0].model, b[0].model);
        assert_eq!(a[0].average_position, b[0].average_position);
    }

    #[test]
    fn test_aggregate_tie_breaks_by_insertion_order() {
        let label_to_model = vec![
            ("Response A".to_string(), "model-a".to_string()),
            ("Response B".to_string(), "model-b".to_string()),
        ];
        // Mirror-image rankings: both models average 1.5.
        let round = vec![
            entry("r1", &["Response A", "Response B"]),
            entry("r2", &["Response B", "Response A"]),
        ];
        let aggregates = calculate_aggregate_rankings(&round, &label_to_model);
        assert_eq!(aggregates[0].model, "model-a");
        assert_eq!(aggregates[1].model, "model-b");
    }

    #[test]
    fn test_feedback_extraction() {
        let text = "Response A misses the cost analysis. Overall strong field. \
                    Response A should cite sources!";
        let feedback = extract_feedback(text, "Response A");
        assert_eq!(feedback.len(), 2);
        assert!(feedback[0].contains("cost analysis"));
    }
}
