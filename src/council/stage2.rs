//! Stage 2: anonymized ranking with refinement rounds
//!
//! Responses get stable labels in stage-1 order; every council model ranks
//! the anonymized set each round. A response rated below the quality
//! threshold by any ranker is refined by its owning model with consolidated
//! peer feedback, then the next round re-ranks. The loop exits when no
//! rating falls below the threshold or the round budget is spent.

use std::collections::HashMap;

use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::client::{ChatMessage, StreamEvent};
use crate::events::{Event, EventSender};
use crate::prompts::final_ranking_format_block;
use crate::tracker::Timing;

use super::ranking::{extract_feedback, make_labels, parse_ranking};
use super::{Council, Stage1Entry, Stage2Entry, drain_model_stream};

/// Feedback items consolidated per refined response.
const MAX_FEEDBACK_ITEMS: usize = 3;

/// Per-label lifecycle within the round loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelState {
    Ranked,
    RefinementQueued,
    Refined,
    Final,
}

impl LabelState {
    fn as_str(&self) -> &'static str {
        match self {
            LabelState::Ranked => "ranked",
            LabelState::RefinementQueued => "refinement_queued",
            LabelState::Refined => "refined",
            LabelState::Final => "final",
        }
    }
}

impl Council {
    /// Run the ranking rounds. Returns every round's entries (tagged with
    /// their round number), the label-to-model mapping in stage-1 order,
    /// and deliberation metadata including the final round number.
    pub async fn stage2_collect_rankings(
        &self,
        query: &str,
        stage1: &[Stage1Entry],
        events: &EventSender,
    ) -> (Vec<Stage2Entry>, Vec<(String, String)>, Value) {
        let labels = make_labels(stage1.len());
        let label_to_model: Vec<(String, String)> = labels
            .iter()
            .cloned()
            .zip(stage1.iter().map(|e| e.model.clone()))
            .collect();

        let mut current_responses: HashMap<String, String> = labels
            .iter()
            .cloned()
            .zip(stage1.iter().map(|e| e.response.clone()))
            .collect();
        let mut label_states: HashMap<String, LabelState> = labels
            .iter()
            .map(|l| (l.clone(), LabelState::Ranked))
            .collect();

        // Cross-review off caps the stage at a single ranking round.
        let max_rounds = if self.config.deliberation.enable_cross_review {
            self.config.deliberation.max_rounds.max(1)
        } else {
            1
        };
        // Threshold is a fraction of the 5-point scale: 0.3 -> 1.5/5.
        let rating_floor = self.config.deliberation.quality_threshold * 5.0;

        let mut all_entries: Vec<Stage2Entry> = vec![];
        let mut total_refined = 0usize;
        let mut converged = false;
        let mut rounds_completed = 0u8;

        for round in 1..=max_rounds {
            rounds_completed = round;
            events.send(Event::RoundStart { round, max_rounds });

            let round_entries = self
                .collect_round_rankings(query, &labels, &current_responses, round, events)
                .await;

            let low_labels = low_rated_labels(&round_entries, &labels, rating_floor);
            all_entries.extend(round_entries.iter().cloned());

            if low_labels.is_empty() {
                converged = true;
                events.send(Event::RoundComplete { round, refined: 0 });
                break;
            }
            if round == max_rounds {
                events.send(Event::RoundComplete { round, refined: 0 });
                break;
            }

            for label in &low_labels {
                label_states.insert(label.clone(), LabelState::RefinementQueued);
            }

            let mut refined_this_round = 0usize;
            for label in &low_labels {
                let Some((_, model)) = label_to_model.iter().find(|(l, _)| l == label) else {
                    continue;
                };
                let previous = current_responses.get(label).cloned().unwrap_or_default();
                let feedback = consolidate_feedback(&round_entries, label);

                events.send(Event::RefinementStart {
                    model: model.clone(),
                    label: label.clone(),
                    round,
                });

                let refined = self
                    .refine_response(query, model, &previous, &feedback, events)
                    .await;

                if let Some(text) = refined {
                    current_responses.insert(label.clone(), text);
                    label_states.insert(label.clone(), LabelState::Refined);
                    refined_this_round += 1;
                }

                events.send(Event::RefinementComplete {
                    model: model.clone(),
                    label: label.clone(),
                    round,
                });
            }

            total_refined += refined_this_round;
            events.send(Event::RoundComplete {
                round,
                refined: refined_this_round,
            });

            // Labels re-enter the ranked state for the next round.
            for state in label_states.values_mut() {
                if *state == LabelState::Refined {
                    *state = LabelState::Ranked;
                }
            }
        }

        for state in label_states.values_mut() {
            *state = LabelState::Final;
        }

        let metadata = json!({
            "rounds_completed": rounds_completed,
            "converged": converged,
            "total_refinements": total_refined,
            "quality_threshold": self.config.deliberation.quality_threshold,
            "label_states": label_states
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str()))
                .collect::<HashMap<_, _>>(),
        });

        info!(
            rounds = rounds_completed,
            converged, refinements = total_refined, "stage2 finished"
        );

        (all_entries, label_to_model, metadata)
    }

    async fn collect_round_rankings(
        &self,
        query: &str,
        labels: &[String],
        current_responses: &HashMap<String, String>,
        round: u8,
        events: &EventSender,
    ) -> Vec<Stage2Entry> {
        let prompt = build_ranking_prompt(query, labels, current_responses);
        let messages = vec![ChatMessage::user(prompt)];
        let max_tokens = self.config.response_config.max_tokens.stage2;
        let models = self.config.council_models();

        let tasks: Vec<_> = models
            .iter()
            .map(|model| {
                let messages = messages.clone();
                let events = events.clone();
                async move {
                    let mut last_timing = Timing::default();
                    let streamed = drain_model_stream(
                        &self.client,
                        model,
                        &messages,
                        max_tokens,
                        |event, tracker| {
                            last_timing = tracker.timing();
                            match event {
                                StreamEvent::Token { delta, content } => {
                                    events.send(Event::Stage2Token {
                                        model: model.clone(),
                                        delta: delta.clone(),
                                        content: content.clone(),
                                        round,
                                        timing: last_timing,
                                    })
                                }
                                StreamEvent::Thinking { delta, content } => {
                                    events.send(Event::Stage2Thinking {
                                        model: model.clone(),
                                        delta: delta.clone(),
                                        content: content.clone(),
                                        round,
                                        timing: last_timing,
                                    })
                                }
                                _ => {}
                            }
                        },
                    )
                    .await;

                    let text = streamed.effective_content();
                    if text.trim().is_empty() {
                        debug!(model, round, "ranker produced nothing, dropped");
                        return None;
                    }

                    events.send(Event::Stage2ModelComplete {
                        model: model.clone(),
                        round,
                        timing: last_timing,
                    });

                    Some((model.clone(), text))
                }
            })
            .collect();

        join_all(tasks)
            .await
            .into_iter()
            .flatten()
            .map(|(model, text)| {
                let (parsed_ranking, quality_ratings) = parse_ranking(&text, labels);
                Stage2Entry {
                    model,
                    ranking_text: text,
                    parsed_ranking,
                    quality_ratings,
                    round,
                }
            })
            .collect()
    }

    async fn refine_response(
        &self,
        query: &str,
        model: &str,
        previous: &str,
        feedback: &str,
        events: &EventSender,
    ) -> Option<String> {
        let prompt = format!(
            "Your answer to the question below was rated poorly by peer reviewers. Improve it \
             using their feedback. Keep what was right; fix what they flagged.\n\n\
             QUESTION: {query}\n\n\
             YOUR PREVIOUS ANSWER:\n{previous}\n\n\
             PEER FEEDBACK:\n{feedback}\n\n\
             Write the improved answer only, no preamble."
        );
        let messages = vec![ChatMessage::user(prompt)];
        let max_tokens = self.config.response_config.max_tokens.stage1;

        let streamed = drain_model_stream(
            &self.client,
            model,
            &messages,
            max_tokens,
            |event, tracker| {
                if let StreamEvent::Token { delta, content } = event {
                    events.send(Event::RefinementToken {
                        model: model.to_string(),
                        delta: delta.clone(),
                        content: content.clone(),
                        timing: tracker.timing(),
                    });
                }
            },
        )
        .await;

        let text = streamed.effective_content();
        if text.trim().is_empty() { None } else { Some(text) }
    }
}

fn build_ranking_prompt(
    query: &str,
    labels: &[String],
    current_responses: &HashMap<String, String>,
) -> String {
    let mut prompt = format!(
        "Several anonymous responses to the same question are listed below. Evaluate each for \
         accuracy, completeness, and clarity, then rank them.\n\n## Question\n{query}\n\n"
    );

    for label in labels {
        let response = current_responses
            .get(label)
            .map(String::as_str)
            .unwrap_or("");
        prompt.push_str(&format!("## {label}\n{response}\n\n"));
    }

    prompt.push_str(&final_ranking_format_block(labels));
    prompt
}

/// Labels any ranker rated below the floor this round.
fn low_rated_labels(entries: &[Stage2Entry], labels: &[String], floor: f64) -> Vec<String> {
    labels
        .iter()
        .filter(|label| {
            entries.iter().any(|entry| {
                entry
                    .quality_ratings
                    .get(*label)
                    .map(|rating| *rating < floor)
                    .unwrap_or(false)
            })
        })
        .cloned()
        .collect()
}

/// Up to three feedback sentences about a label, joined by `|`.
fn consolidate_feedback(entries: &[Stage2Entry], label: &str) -> String {
    let items: Vec<String> = entries
        .iter()
        .flat_map(|entry| extract_feedback(&entry.ranking_text, label))
        .take(MAX_FEEDBACK_ITEMS)
        .collect();

    if items.is_empty() {
        "Reviewers rated this response poorly without specific feedback.".to_string()
    } else {
        items.join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_ratings(ratings: &[(&str, f64)], text: &str) -> Stage2Entry {
        Stage2Entry {
            model: "ranker".into(),
            ranking_text: text.into(),
            parsed_ranking: vec![],
            quality_ratings: ratings
                .iter()
                .map(|(l, r)| (l.to_string(), *r))
                .collect(),
            round: 1,
        }
    }

    #[test]
    fn test_low_rated_labels_below_floor() {
        let labels = vec!["Response A".to_string(), "Response B".to_string()];
        let entries = vec![entry_with_ratings(
            &[("Response A", 1.0), ("Response B", 4.0)],
            "",
        )];
        let low = low_rated_labels(&entries, &labels, 1.5);
        assert_eq!(low, vec!["Response A"]);
    }

    #[test]
    fn test_floor_is_exclusive() {
        let labels = vec!["Response A".to_string()];
        let entries = vec![entry_with_ratings(&[("Response A", 1.5)], "")];
        // Exactly at the floor is not "below threshold".
        assert!(low_rated_labels(&entries, &labels, 1.5).is_empty());
    }

    #[test]
    fn test_feedback_capped_at_three() {
        let text = "Response A lacks depth. Response A misses sources. \
                    Response A is verbose. Response A buries the lede.";
        let entries = vec![entry_with_ratings(&[], text)];
        let feedback = consolidate_feedback(&entries, "Response A");
        assert_eq!(feedback.matches(" | ").count(), 2);
    }

    #[test]
    fn test_feedback_placeholder_when_none_found() {
        let entries = vec![entry_with_ratings(&[], "no mentions here")];
        let feedback = consolidate_feedback(&entries, "Response A");
        assert!(feedback.contains("without specific feedback"));
    }

    #[test]
    fn test_ranking_prompt_contains_all_labels() {
        let labels = vec!["Response A".to_string(), "Response B".to_string()];
        let mut responses = HashMap::new();
        responses.insert("Response A".to_string(), "first".to_string());
        responses.insert("Response B".to_string(), "second".to_string());
        let prompt = build_ranking_prompt("the question", &labels, &responses);
        assert!(prompt.contains("## Response A\nfirst"));
        assert!(prompt.contains("## Response B\nsecond"));
        assert!(prompt.contains("FINAL RANKING:"));
    }
}
