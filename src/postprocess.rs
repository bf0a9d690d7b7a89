//! Output post-processing
//!
//! Refusal detection over tool-augmented direct responses, placeholder image
//! stripping over synthesized markdown, and blank-line collapsing.

use once_cell::sync::Lazy;
use regex::Regex;

/// Phrases that indicate the model ignored tool output and answered from its
/// (stale) parameters instead.
const REFUSAL_PHRASES: &[&str] = &[
    "cannot access real-time",
    "can't access real-time",
    "cannot access the internet",
    "don't have access to real-time",
    "do not have access to real-time",
    "don't have access to current",
    "unable to access the internet",
    "cannot browse the internet",
    "my training data ends",
    "my training data only goes",
    "my knowledge cutoff",
    "my knowledge cut-off",
    "as an ai, i don't have access",
    "i don't have real-time",
];

/// True when the response contains any canned refusal phrase.
pub fn is_refusal(response: &str) -> bool {
    let lower = response.to_lowercase();
    REFUSAL_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

static IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[[^\]]*\]\(([^)]*)\)").expect("image regex"));

static BLANK_LINES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("blank regex"));

/// URL substrings that mark a markdown image as a hallucinated placeholder.
const PLACEHOLDER_MARKERS: &[&str] = &[
    "via.placeholder.com",
    "example.com",
    "?text=",
    "/placeholder",
];

fn is_placeholder_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

/// Remove markdown images pointing at placeholder URLs, then collapse runs
/// of three or more newlines. Idempotent; images with real URLs survive.
pub fn strip_fake_images(text: &str) -> String {
    let stripped = IMAGE_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let url = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if is_placeholder_url(url) {
            String::new()
        } else {
            caps[0].to_string()
        }
    });

    BLANK_LINES_RE.replace_all(&stripped, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_detected() {
        assert!(is_refusal(
            "I cannot access real-time information, but generally..."
        ));
        assert!(is_refusal("My training data ends in 2023."));
        assert!(!is_refusal("According to the search results, it rained."));
    }

    #[test]
    fn test_placeholder_images_removed() {
        let text = "Before\n\n![chart](https://via.placeholder.com/300)\n\nAfter";
        let result = strip_fake_images(text);
        assert!(!result.contains("via.placeholder.com"));
        assert!(result.contains("Before"));
        assert!(result.contains("After"));
    }

    #[test]
    fn test_real_images_survive() {
        let text = "![diagram](https://upload.wikimedia.org/real.png)";
        assert_eq!(strip_fake_images(text), text);
    }

    #[test]
    fn test_query_string_placeholder() {
        let text = "![x](https://img.site/gen?text=Hello)";
        assert!(!strip_fake_images(text).contains("img.site"));
    }

    #[test]
    fn test_stripping_is_idempotent() {
        let text = "A\n\n\n\n![p](https://example.com/img.png)\n\n\nB\n![ok](https://real.host/i.png)";
        let once = strip_fake_images(text);
        let twice = strip_fake_images(&once);
        assert_eq!(once, twice);
        assert!(once.contains("real.host"));
    }

    #[test]
    fn test_blank_lines_collapsed() {
        let text = "a\n\n\n\n\nb";
        assert_eq!(strip_fake_images(text), "a\n\nb");
    }
}
