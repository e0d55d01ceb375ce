//! Raw record normalization: validation, date parsing, filtering,
//! platform canonicalization, escaping, dedupe and ordering.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use streamdigest_shared::{ContentItem, DateRange, RawRecord};

/// Longest description kept, in characters (including the ellipsis).
pub const MAX_DESCRIPTION_CHARS: usize = 200;

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Known misspellings seen in source data.
const PLATFORM_FIXUPS: &[(&str, &str)] = &[("Parmount+", "Paramount+")];

/// Canonical names keyed by platform slug (`+` spelled `-plus`).
const PLATFORM_SLUGS: &[(&str, &str)] = &[
    ("hbo-max", "HBO Max"),
    ("disney-plus", "Disney+"),
    ("disney", "Disney"),
    ("netflix", "Netflix"),
    ("hulu", "Hulu"),
    ("amazon-prime", "Prime Video"),
    ("prime-video", "Prime Video"),
    ("peacock", "Peacock"),
    ("paramount-plus", "Paramount+"),
    ("paramount", "Paramount"),
    ("apple-tv", "Apple TV"),
    ("espn", "ESPN"),
    ("espn-plus", "ESPN+"),
    ("showtime", "Showtime"),
    ("starz", "Starz"),
    ("amc", "AMC"),
    ("amc-plus", "AMC+"),
    ("discovery", "Discovery"),
    ("discovery-plus", "Discovery+"),
    ("servustv", "ServusTV"),
    ("bbc", "BBC"),
    ("fox", "FOX"),
    ("nbc", "NBC"),
    ("abc", "ABC"),
    ("cbs", "CBS"),
];

/// Why a record did not become a [`ContentItem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Missing required field or unparseable date.
    Malformed(String),
    /// Outside the requested range.
    OutOfRange,
    /// Matched an excluded keyword.
    Excluded(String),
}

/// Result of normalizing one batch of raw records.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    /// Sorted, deduplicated items.
    pub items: Vec<ContentItem>,
    /// Malformed records skipped.
    pub skipped: usize,
    /// Well-formed records dropped by range or keyword policy.
    pub filtered: usize,
    /// Duplicates collapsed into an earlier record.
    pub duplicates: usize,
    /// One message per skipped record.
    pub warnings: Vec<String>,
}

/// Turns raw records into canonical content items.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    excluded_keywords: Vec<String>,
}

impl Normalizer {
    pub fn new(excluded_keywords: &[String]) -> Self {
        Self {
            excluded_keywords: excluded_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Normalize every record, keeping the first of each duplicate.
    pub fn normalize(&self, range: &DateRange, records: Vec<RawRecord>) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();
        let mut seen = HashSet::new();

        for (position, record) in records.into_iter().enumerate() {
            match self.normalize_record(range, record) {
                Ok(item) => {
                    if seen.insert(item.dedupe_key()) {
                        outcome.items.push(item);
                    } else {
                        outcome.duplicates += 1;
                    }
                }
                Err(Rejection::Malformed(reason)) => {
                    outcome.skipped += 1;
                    outcome
                        .warnings
                        .push(format!("skipped record #{position}: {reason}"));
                }
                Err(Rejection::OutOfRange) => outcome.filtered += 1,
                Err(Rejection::Excluded(keyword)) => {
                    debug!(position, keyword, "record excluded by keyword");
                    outcome.filtered += 1;
                }
            }
        }

        outcome.items.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.platform.to_lowercase().cmp(&b.platform.to_lowercase()))
                .then_with(|| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
        });
        outcome
    }

    /// Validate and canonicalize a single record.
    pub fn normalize_record(
        &self,
        range: &DateRange,
        record: RawRecord,
    ) -> Result<ContentItem, Rejection> {
        let title = required(record.title, "title")?;
        let platform = required(record.platform, "platform")?;
        let date_text = required(record.date, "date")?;
        let date = parse_date(&date_text, range)
            .ok_or_else(|| Rejection::Malformed(format!("unparseable date '{date_text}'")))?;

        if !range.contains(date) {
            return Err(Rejection::OutOfRange);
        }

        let platform = canonical_platform(&platform);
        let kind = record.kind.as_deref().map(collapse_whitespace);

        let haystack = format!(
            "{title} {} {platform}",
            kind.as_deref().unwrap_or_default()
        )
        .to_lowercase();
        if let Some(keyword) = self
            .excluded_keywords
            .iter()
            .find(|k| haystack.contains(k.as_str()))
        {
            return Err(Rejection::Excluded(keyword.clone()));
        }

        Ok(ContentItem {
            title: escape_html(&collapse_whitespace(&title)),
            date,
            platform,
            kind: kind.filter(|k| !k.is_empty()).map(|k| escape_html(&k)),
            description: record
                .description
                .map(|d| collapse_whitespace(&d))
                .filter(|d| !d.is_empty())
                .map(|d| escape_html(&truncate_chars(&d, MAX_DESCRIPTION_CHARS))),
            platform_logo: record.platform_logo.filter(|s| !s.trim().is_empty()),
            image_url: record.image_url.filter(|s| !s.trim().is_empty()),
            link: record.link.filter(|s| !s.trim().is_empty()),
            country: record.country.filter(|s| !s.trim().is_empty()),
        })
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, Rejection> {
    field
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Rejection::Malformed(format!("missing {name}")))
}

/// Parse an ISO date or a calendar header.
///
/// Accepted headers: `Friday, December 15, 2024`, `December 15, 2024`,
/// `Friday, December 15`, `December 15`. The weekday is ignored. A missing
/// year is taken from `range`, preferring the year that lands inside it.
pub fn parse_date(text: &str, range: &DateRange) -> Option<NaiveDate> {
    let text = collapse_whitespace(text);
    if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        return Some(date);
    }

    let text = strip_weekday(&text);
    if let Ok(date) = NaiveDate::parse_from_str(text, "%B %d, %Y") {
        return Some(date);
    }

    let without_year = text.trim_end_matches(',');
    let mut years = vec![range.start.year()];
    if range.end.year() != range.start.year() {
        years.push(range.end.year());
    }
    let candidates: Vec<NaiveDate> = years
        .into_iter()
        .filter_map(|year| {
            NaiveDate::parse_from_str(&format!("{without_year} {year}"), "%B %d %Y").ok()
        })
        .collect();

    candidates
        .iter()
        .copied()
        .find(|d| range.contains(*d))
        .or_else(|| candidates.first().copied())
}

fn strip_weekday(text: &str) -> &str {
    if let Some((head, rest)) = text.split_once(',') {
        if WEEKDAYS.contains(&head.trim().to_lowercase().as_str()) {
            return rest.trim();
        }
    }
    text
}

/// Canonical platform name: typo fixups, then slug mapping.
pub fn canonical_platform(raw: &str) -> String {
    let mut name = collapse_whitespace(raw);
    for (typo, fixed) in PLATFORM_FIXUPS {
        if name.contains(typo) {
            name = name.replace(typo, fixed);
        }
    }

    let slug = platform_slug(&name);
    PLATFORM_SLUGS
        .iter()
        .find(|(key, _)| *key == slug)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(name)
}

fn platform_slug(name: &str) -> String {
    let spelled = name.replace('+', " plus");
    let mut slug = String::with_capacity(spelled.len());
    for c in spelled.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Escape text for inclusion in HTML.
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Truncate to `max` characters, ending in `...` when shortened.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> DateRange {
        DateRange::parse("2024-01-01", "2024-01-03").unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(title: &str, date: &str, platform: &str) -> RawRecord {
        RawRecord {
            title: Some(title.into()),
            date: Some(date.into()),
            platform: Some(platform.into()),
            ..RawRecord::default()
        }
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(&["Sports".to_string(), "NFL".to_string()])
    }

    #[test]
    fn parses_calendar_header_formats() {
        let r = range();
        assert_eq!(parse_date("2024-01-02", &r), Some(date("2024-01-02")));
        assert_eq!(parse_date("Tuesday, January 2, 2024", &r), Some(date("2024-01-02")));
        assert_eq!(parse_date("January 2, 2024", &r), Some(date("2024-01-02")));
        assert_eq!(parse_date("Tuesday, January 2", &r), Some(date("2024-01-02")));
        assert_eq!(parse_date("january 2", &r), Some(date("2024-01-02")));
        assert_eq!(parse_date("Someday soon", &r), None);
    }

    #[test]
    fn ignores_mismatched_weekday() {
        // The source occasionally mislabels the weekday; the date wins.
        assert_eq!(
            parse_date("Friday, January 2, 2024", &range()),
            Some(date("2024-01-02"))
        );
    }

    #[test]
    fn infers_year_across_new_year() {
        let r = DateRange::parse("2023-12-30", "2024-01-02").unwrap();
        assert_eq!(parse_date("December 31", &r), Some(date("2023-12-31")));
        assert_eq!(parse_date("Monday, January 1", &r), Some(date("2024-01-01")));
    }

    #[test]
    fn dedupes_and_sorts() {
        let records = vec![
            record("Zoo", "2024-01-02", "Netflix"),
            record("The Bear", "2024-01-01", "Hulu"),
            record("the  bear", "Monday, January 1", "hulu"),
            record("Alpha", "2024-01-02", "Netflix"),
            record("Fargo", "2024-01-02", "FX"),
        ];
        let outcome = normalizer().normalize(&range(), records);

        let titles: Vec<&str> = outcome.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, ["The Bear", "Fargo", "Alpha", "Zoo"]);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn skips_malformed_records_with_warnings() {
        let records = vec![
            record("The Bear", "2024-01-01", "Hulu"),
            RawRecord {
                title: None,
                ..record("", "2024-01-01", "Hulu")
            },
            record("No Date", "sometime", "Hulu"),
            RawRecord {
                platform: Some("  ".into()),
                ..record("No Platform", "2024-01-01", "")
            },
        ];
        let outcome = normalizer().normalize(&range(), records);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(outcome.warnings.len(), 3);
        assert!(outcome.warnings[0].contains("missing title"));
        assert!(outcome.warnings[1].contains("unparseable date"));
    }

    #[test]
    fn filters_out_of_range_and_excluded() {
        let records = vec![
            record("Later Show", "2024-02-01", "Hulu"),
            record("Monday Night", "2024-01-01", "NFL Network"),
            RawRecord {
                kind: Some("Live Sports".into()),
                ..record("Big Game", "2024-01-01", "Peacock")
            },
            record("Kept", "2024-01-03", "Peacock"),
        ];
        let outcome = normalizer().normalize(&range(), records);
        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.filtered, 3);
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn canonicalizes_platforms() {
        assert_eq!(canonical_platform("Parmount+"), "Paramount+");
        assert_eq!(canonical_platform("disney-plus"), "Disney+");
        assert_eq!(canonical_platform("Disney+"), "Disney+");
        assert_eq!(canonical_platform("prime video"), "Prime Video");
        assert_eq!(canonical_platform("HBO  Max"), "HBO Max");
        assert_eq!(canonical_platform("Acorn TV"), "Acorn TV");
    }

    #[test]
    fn escapes_and_truncates_text() {
        let long = "word ".repeat(60);
        let records = vec![RawRecord {
            kind: Some("Movie".into()),
            description: Some(long),
            ..record("Tom & Jerry <Live>", "2024-01-01", "Max")
        }];
        let outcome = normalizer().normalize(&range(), records);
        let item = &outcome.items[0];
        assert_eq!(item.title, "Tom &amp; Jerry &lt;Live&gt;");
        let description = item.description.as_deref().unwrap();
        assert!(description.ends_with("..."));
        assert!(description.chars().count() <= MAX_DESCRIPTION_CHARS);
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_chars("short", 200), "short");
        assert_eq!(truncate_chars("abcdefghij", 8), "abcde...");
    }
}
