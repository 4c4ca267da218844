use std::sync::LazyLock;

use pharmcall_scheduler::ExtractedData;
use regex::Regex;

static PRICE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s*(\d{1,3}(?:,\d{3})+|\d+)(\.\d{1,2})?").expect("hardcoded regex pattern is valid")
});

const DENIALS: &[&str] = &[
    "out of stock",
    "not in stock",
    "don't have",
    "do not have",
    "don't carry",
    "do not carry",
    "no longer carry",
    "not available",
    "unavailable",
    "backordered",
    "back order",
    "back-order",
];

const CONFIRMATIONS: &[&str] = &[
    "in stock",
    "we have it",
    "we do have",
    "we have that",
    "have it available",
    "is available",
    "we carry",
    "can fill",
];

const CLEAN_ENDINGS: &[&str] = &[
    "customer-ended-call",
    "assistant-ended-call",
    "assistant-said-end-call-phrase",
];

const NOTES_MAX_CHARS: usize = 280;

/// Heuristic read of a pharmacy call transcript.
///
/// Denials are checked first so "not available" never counts as "available".
pub fn extract(transcript: &str) -> ExtractedData {
    let lower = transcript.to_lowercase();
    let availability = if DENIALS.iter().any(|p| lower.contains(p)) {
        Some(false)
    } else if CONFIRMATIONS.iter().any(|p| lower.contains(p)) {
        Some(true)
    } else {
        None
    };

    ExtractedData {
        availability,
        price: extract_price(transcript),
        notes: notes(transcript),
    }
}

/// First dollar amount in `text`, e.g. `$1,249.50` -> 1249.5.
pub fn extract_price(text: &str) -> Option<f64> {
    let caps = PRICE_REGEX.captures(text)?;
    let whole = caps.get(1)?.as_str().replace(',', "");
    let cents = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    format!("{whole}{cents}").parse().ok()
}

fn notes(transcript: &str) -> String {
    let trimmed = transcript.trim();
    match trimmed.char_indices().nth(NOTES_MAX_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Confidence in the extracted result: longer calls that ended cleanly score
/// higher. Always within 0.0–1.0.
pub fn confidence(duration_secs: u32, ended_reason: Option<&str>) -> f64 {
    // Tenths, so the common scores come out exact.
    let mut tenths: u32 = 5;
    if duration_secs > 30 {
        tenths += 2;
    }
    if duration_secs > 60 {
        tenths += 1;
    }
    if ended_reason.is_some_and(|r| CLEAN_ENDINGS.iter().any(|e| *e == r)) {
        tenths += 2;
    }
    f64::from(tenths.min(10)) / 10.0
}

/// Normalise a US phone number to E.164. Numbers already in `+` form are kept
/// if their digit count is plausible.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if raw.trim_start().starts_with('+') {
        return (8..=15).contains(&digits.len()).then(|| format!("+{digits}"));
    }
    match digits.len() {
        10 => Some(format!("+1{digits}")),
        11 if digits.starts_with('1') => Some(format!("+{digits}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirms_stock_and_price() {
        let data = extract("Yes, we have it in stock. It's $45.99 without insurance.");
        assert_eq!(data.availability, Some(true));
        assert_eq!(data.price, Some(45.99));
    }

    #[test]
    fn denial_wins_over_confirmation_words() {
        let data = extract("Sorry, that's not available, we're out of stock until next week.");
        assert_eq!(data.availability, Some(false));
        assert_eq!(data.price, None);
    }

    #[test]
    fn unclear_transcript_leaves_availability_unknown() {
        let data = extract("Please hold while I check with the pharmacist.");
        assert_eq!(data.availability, None);
        assert_eq!(data.notes, "Please hold while I check with the pharmacist.");
    }

    #[test]
    fn price_with_thousands_separator() {
        assert_eq!(extract_price("that runs $1,249.50 a month"), Some(1249.5));
        assert_eq!(extract_price("about $ 30"), Some(30.0));
        assert_eq!(extract_price("thirty dollars"), None);
    }

    #[test]
    fn long_notes_are_truncated() {
        let long = "a".repeat(400);
        assert_eq!(notes(&long).chars().count(), NOTES_MAX_CHARS + 1);
    }

    #[test]
    fn confidence_scales_with_duration_and_ending() {
        assert_eq!(confidence(10, None), 0.5);
        assert_eq!(confidence(45, None), 0.7);
        assert_eq!(confidence(90, Some("customer-ended-call")), 1.0);
        assert_eq!(confidence(90, Some("customer-busy")), 0.8);
    }

    #[test]
    fn phone_normalisation() {
        assert_eq!(normalize_phone("(555) 010-1234").as_deref(), Some("+15550101234"));
        assert_eq!(normalize_phone("1-555-010-1234").as_deref(), Some("+15550101234"));
        assert_eq!(normalize_phone("+44 20 7946 0958").as_deref(), Some("+442079460958"));
        assert_eq!(normalize_phone("555-0100"), None);
        assert_eq!(normalize_phone(""), None);
    }
}
