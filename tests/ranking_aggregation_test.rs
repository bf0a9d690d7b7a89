// Stage-2 parsing and aggregation invariants: label bijection, rating
// fallbacks, and rank stability laws.

use std::collections::HashMap;

use conclave::council::Stage2Entry;
use conclave::council::ranking::{calculate_aggregate_rankings, make_labels, parse_ranking};

fn entry(model: &str, text: &str, labels: &[String]) -> Stage2Entry {
    let (parsed_ranking, quality_ratings) = parse_ranking(text, labels);
    Stage2Entry {
        model: model.to_string(),
        ranking_text: text.to_string(),
        parsed_ranking,
        quality_ratings,
        round: 1,
    }
}

#[test]
fn labels_form_stable_bijection_with_entries() {
    for n in 1..=6 {
        let labels = make_labels(n);
        assert_eq!(labels.len(), n);
        // All distinct.
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), n);
        // Deterministic across calls.
        assert_eq!(labels, make_labels(n));
    }
}

#[test]
fn parsed_labels_are_subset_of_round_labels() {
    let labels = make_labels(3);
    let text = "FINAL RANKING:\n1. Response B (4/5) - good\n2. Response Q (5/5) - not a label\n\
                3. Response A (2/5) - weak";
    let (parsed, ratings) = parse_ranking(text, &labels);

    for label in &parsed {
        assert!(labels.contains(label));
    }
    for label in ratings.keys() {
        assert!(labels.contains(label));
    }
}

#[test]
fn label_to_model_composition_yields_model_permutation() {
    let labels = make_labels(3);
    let models = ["alpha", "beta", "gamma"];
    let label_to_model: Vec<(String, String)> = labels
        .iter()
        .cloned()
        .zip(models.iter().map(|m| m.to_string()))
        .collect();

    let text = "FINAL RANKING:\n1. Response C (5/5)\n2. Response A (4/5)\n3. Response B (3/5)";
    let (parsed, _) = parse_ranking(text, &labels);

    let mapped: Vec<&str> = parsed
        .iter()
        .map(|label| {
            label_to_model
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, m)| m.as_str())
                .unwrap()
        })
        .collect();

    let mut sorted = mapped.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["alpha", "beta", "gamma"]);
}

#[test]
fn unmentioned_labels_receive_positional_ratings() {
    let labels = make_labels(4);
    let text = "FINAL RANKING:\n1. Response D\n2. Response A\n3. Response C\n4. Response B";
    let (_, ratings) = parse_ranking(text, &labels);
    assert_eq!(ratings["Response D"], 5.0);
    assert_eq!(ratings["Response A"], 4.0);
    assert_eq!(ratings["Response C"], 3.0);
    assert_eq!(ratings["Response B"], 2.0);
}

#[test]
fn aggregate_is_stable_under_ranker_identity_permutation() {
    let labels = make_labels(3);
    let label_to_model: Vec<(String, String)> = labels
        .iter()
        .cloned()
        .zip(["m1", "m2", "m3"].iter().map(|m| m.to_string()))
        .collect();

    let texts = [
        "FINAL RANKING:\n1. Response B (5/5)\n2. Response A (3/5)\n3. Response C (2/5)",
        "FINAL RANKING:\n1. Response B (5/5)\n2. Response C (4/5)\n3. Response A (2/5)",
        "FINAL RANKING:\n1. Response A (4/5)\n2. Response B (4/5)\n3. Response C (3/5)",
    ];

    let forward: Vec<Stage2Entry> = texts
        .iter()
        .enumerate()
        .map(|(i, text)| entry(&format!("ranker-{i}"), text, &labels))
        .collect();
    let mut reversed = forward.clone();
    reversed.reverse();

    let a = calculate_aggregate_rankings(&forward, &label_to_model);
    let b = calculate_aggregate_rankings(&reversed, &label_to_model);

    let order_a: Vec<&str> = a.iter().map(|r| r.model.as_str()).collect();
    let order_b: Vec<&str> = b.iter().map(|r| r.model.as_str()).collect();
    assert_eq!(order_a, order_b);
    // m2 (Response B) is ranked 1st twice and 2nd once: best average.
    assert_eq!(order_a[0], "m2");
}

#[test]
fn aggregate_not_stable_under_rank_list_permutation() {
    let labels = make_labels(2);
    let label_to_model: Vec<(String, String)> = labels
        .iter()
        .cloned()
        .zip(["m1", "m2"].iter().map(|m| m.to_string()))
        .collect();

    let original = vec![entry(
        "r",
        "FINAL RANKING:\n1. Response A (5/5)\n2. Response B (3/5)",
        &labels,
    )];
    let permuted = vec![entry(
        "r",
        "FINAL RANKING:\n1. Response B (5/5)\n2. Response A (3/5)",
        &labels,
    )];

    let a = calculate_aggregate_rankings(&original, &label_to_model);
    let b = calculate_aggregate_rankings(&permuted, &label_to_model);
    assert_ne!(a[0].model, b[0].model);
}

#[test]
fn single_model_council_degenerates_cleanly() {
    let labels = make_labels(1);
    let label_to_model = vec![("Response A".to_string(), "only".to_string())];
    let round = vec![entry(
        "only",
        "FINAL RANKING:\n1. Response A (1/5) - needs work",
        &labels,
    )];

    let aggregates = calculate_aggregate_rankings(&round, &label_to_model);
    assert_eq!(aggregates.len(), 1);
    assert_eq!(aggregates[0].rank, 1);
    assert_eq!(aggregates[0].average_position, 1.0);

    // A 1/5 rating is below the default 1.5 floor, so refinement can still
    // trigger for a single-label round.
    let ratings: HashMap<String, f64> = round[0].quality_ratings.clone();
    assert!(ratings["Response A"] < 1.5);
}
