// Date resolver laws: relative tokens resolve against a fixed "today",
// and resolution is what the multi-step planner relies on for correctness.

use chrono::NaiveDate;

use conclave::tools::dates::{is_date_reference, resolve_date_reference};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn yesterday_is_exactly_one_day_back() {
    for (today, expected) in [
        (date(2026, 7, 29), "2026-07-28"),
        (date(2026, 1, 1), "2025-12-31"),
        (date(2024, 3, 1), "2024-02-29"), // leap year
    ] {
        assert_eq!(resolve_date_reference("YESTERDAY", today), expected);
    }
}

#[test]
fn last_day_is_greatest_past_date_with_that_weekday() {
    // 2026-07-29 is a Wednesday.
    let wednesday = date(2026, 7, 29);

    for (token, expected) in [
        ("LAST TUESDAY", date(2026, 7, 28)),
        ("LAST MONDAY", date(2026, 7, 27)),
        ("LAST THURSDAY", date(2026, 7, 23)),
        ("LAST WEDNESDAY", date(2026, 7, 22)), // today's weekday: a week ago
    ] {
        let resolved = resolve_date_reference(token, wednesday);
        assert_eq!(resolved, expected.format("%Y-%m-%d").to_string());
        // The law: resolved date is strictly before today and at most 7 days back.
        assert!(expected < wednesday);
        assert!((wednesday - expected).num_days() <= 7);
    }
}

#[test]
fn this_and_next_day_semantics() {
    let wednesday = date(2026, 7, 29);

    // THIS of today's weekday is today.
    assert_eq!(resolve_date_reference("THIS WEDNESDAY", wednesday), "2026-07-29");
    // NEXT of today's weekday is a week ahead.
    assert_eq!(resolve_date_reference("NEXT WEDNESDAY", wednesday), "2026-08-05");
    // NEXT of a later weekday lands in next week, past that weekday's THIS.
    assert_eq!(resolve_date_reference("THIS FRIDAY", wednesday), "2026-07-31");
    assert_eq!(resolve_date_reference("NEXT FRIDAY", wednesday), "2026-08-07");
}

#[test]
fn resolution_is_case_insensitive() {
    let today = date(2026, 7, 29);
    assert_eq!(
        resolve_date_reference("last tuesday", today),
        resolve_date_reference("LAST TUESDAY", today),
    );
}

#[test]
fn non_references_pass_through_unchanged() {
    let today = date(2026, 7, 29);
    for literal in ["2026-07-01", "Berlin", "tuesday market"] {
        assert!(!is_date_reference(literal));
        assert_eq!(resolve_date_reference(literal, today), literal);
    }
}

#[test]
fn every_symbolic_token_is_detected() {
    let tokens = [
        "YESTERDAY",
        "TODAY",
        "TOMORROW",
        "LAST WEEK",
        "NEXT WEEK",
        "LAST MONDAY",
        "THIS SATURDAY",
        "NEXT SUNDAY",
        "LAST_FRIDAY",
    ];
    for token in tokens {
        assert!(is_date_reference(token), "{token} should be recognized");
    }
}
