//! Symbolic date token resolution
//!
//! Execution plans may carry tokens like `YESTERDAY` or `LAST TUESDAY` in
//! tool parameters; they are resolved against the current date only at
//! execution time, never at planning time.

use chrono::{Datelike, Days, NaiveDate, Weekday};

const DAY_NAMES: &[(&str, Weekday)] = &[
    ("MONDAY", Weekday::Mon),
    ("TUESDAY", Weekday::Tue),
    ("WEDNESDAY", Weekday::Wed),
    ("THURSDAY", Weekday::Thu),
    ("FRIDAY", Weekday::Fri),
    ("SATURDAY", Weekday::Sat),
    ("SUNDAY", Weekday::Sun),
];

/// True when the value is a symbolic date reference this resolver handles.
pub fn is_date_reference(value: &str) -> bool {
    let upper = value.to_uppercase();
    let upper = upper.trim();

    if matches!(
        upper,
        "YESTERDAY" | "TODAY" | "TOMORROW" | "LAST WEEK" | "LAST_WEEK" | "NEXT WEEK" | "NEXT_WEEK"
    ) {
        return true;
    }

    DAY_NAMES.iter().any(|(day, _)| {
        ["LAST", "THIS", "NEXT"].iter().any(|prefix| {
            upper.contains(&format!("{prefix} {day}")) || upper.contains(&format!("{prefix}_{day}"))
        })
    })
}

/// Resolve a date reference to `YYYY-MM-DD` relative to `today`.
/// Unrecognized values pass through unchanged.
///
/// `LAST <day>` is the most recent past occurrence (a full week back when
/// today is that day). `THIS <day>` is the current week's occurrence (today
/// when today matches). `NEXT <day>` is next week's occurrence (a week ahead
/// when today matches).
pub fn resolve_date_reference(value: &str, today: NaiveDate) -> String {
    let upper = value.to_uppercase();
    let upper = upper.trim();
    let fmt = |d: NaiveDate| d.format("%Y-%m-%d").to_string();

    match upper {
        "YESTERDAY" => return fmt(today - Days::new(1)),
        "TODAY" => return fmt(today),
        "TOMORROW" => return fmt(today + Days::new(1)),
        "LAST WEEK" | "LAST_WEEK" => return fmt(today - Days::new(7)),
        "NEXT WEEK" | "NEXT_WEEK" => return fmt(today + Days::new(7)),
        _ => {}
    }

    let today_num = today.weekday().num_days_from_monday() as i64;

    for (day_name, weekday) in DAY_NAMES {
        let day_num = weekday.num_days_from_monday() as i64;

        if upper.contains(&format!("LAST {day_name}")) || upper.contains(&format!("LAST_{day_name}"))
        {
            let mut days_ago = (today_num - day_num).rem_euclid(7);
            if days_ago == 0 {
                days_ago = 7;
            }
            return fmt(today - Days::new(days_ago as u64));
        }

        if upper.contains(&format!("THIS {day_name}")) || upper.contains(&format!("THIS_{day_name}"))
        {
            let days_until = (day_num - today_num).rem_euclid(7);
            return fmt(today + Days::new(days_until as u64));
        }

        if upper.contains(&format!("NEXT {day_name}")) || upper.contains(&format!("NEXT_{day_name}"))
        {
            let mut days_until = (day_num - today_num).rem_euclid(7);
            days_until = if days_until == 0 { 7 } else { days_until + 7 };
            return fmt(today + Days::new(days_until as u64));
        }
    }

    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_simple_references() {
        // 2026-07-29 is a Wednesday.
        let today = date(2026, 7, 29);
        assert_eq!(resolve_date_reference("YESTERDAY", today), "2026-07-28");
        assert_eq!(resolve_date_reference("TODAY", today), "2026-07-29");
        assert_eq!(resolve_date_reference("TOMORROW", today), "2026-07-30");
        assert_eq!(resolve_date_reference("LAST WEEK", today), "2026-07-22");
        assert_eq!(resolve_date_reference("NEXT WEEK", today), "2026-08-05");
    }

    #[test]
    fn test_last_day_is_most_recent_past() {
        let wednesday = date(2026, 7, 29);
        // Last Tuesday from Wednesday is one day back.
        assert_eq!(
            resolve_date_reference("LAST TUESDAY", wednesday),
            "2026-07-28"
        );
        // Last Friday crosses the week boundary.
        assert_eq!(
            resolve_date_reference("LAST FRIDAY", wednesday),
            "2026-07-24"
        );
    }

    #[test]
    fn test_last_same_day_goes_back_a_week() {
        let wednesday = date(2026, 7, 29);
        assert_eq!(
            resolve_date_reference("LAST WEDNESDAY", wednesday),
            "2026-07-22"
        );
    }

    #[test]
    fn test_this_day_current_week() {
        let wednesday = date(2026, 7, 29);
        // Today matches: today.
        assert_eq!(
            resolve_date_reference("THIS WEDNESDAY", wednesday),
            "2026-07-29"
        );
        assert_eq!(
            resolve_date_reference("THIS FRIDAY", wednesday),
            "2026-07-31"
        );
    }

    #[test]
    fn test_next_day_next_week() {
        let wednesday = date(2026, 7, 29);
        // Today matches: a full week ahead.
        assert_eq!(
            resolve_date_reference("NEXT WEDNESDAY", wednesday),
            "2026-08-05"
        );
        // Friday is later this week, so NEXT pushes a week past it.
        assert_eq!(
            resolve_date_reference("NEXT FRIDAY", wednesday),
            "2026-08-07"
        );
    }

    #[test]
    fn test_underscore_variants() {
        let wednesday = date(2026, 7, 29);
        assert_eq!(
            resolve_date_reference("LAST_TUESDAY", wednesday),
            "2026-07-28"
        );
        assert!(is_date_reference("LAST_TUESDAY"));
        assert!(is_date_reference("next monday"));
    }

    #[test]
    fn test_unrecognized_passes_through() {
        let today = date(2026, 7, 29);
        assert_eq!(resolve_date_reference("2026-01-15", today), "2026-01-15");
        assert!(!is_date_reference("2026-01-15"));
        assert!(!is_date_reference("Paris"));
    }
}
