//! Derived display fields for stored records.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use regex::Regex;
use thiserror::Error;

use crate::Comment;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeriveError {
    #[error("invalid installs string: {0:?}")]
    InvalidInstalls(String),
}

static RE_MARKS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[™®©]").unwrap());
static RE_IO_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\.io\b").unwrap());
static RE_SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[/|]+").unwrap());
static RE_DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\s-]").unwrap());
static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static RE_DASHES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-+").unwrap());

/// URL slug built from the leading segment of an app title.
pub fn slug(title: &str) -> String {
    let s = RE_MARKS.replace_all(leading_segment(title), "");
    let s = RE_IO_SUFFIX.replace_all(&s, "-io");
    let s = RE_SEPARATORS.replace_all(&s, "-");
    let s = RE_DISALLOWED.replace_all(&s, "");
    let s = RE_WHITESPACE.replace_all(&s, "-");
    let s = RE_DASHES.replace_all(&s, "-");
    s.to_lowercase().trim_matches('-').to_string()
}

fn leading_segment(title: &str) -> &str {
    let s = title.split(':').next().unwrap_or_default();
    let s = s.split(',').next().unwrap_or_default();
    let s = s.split(" x ").next().unwrap_or_default();
    // a dash followed by a space is a separator inside the name, not a suffix marker
    match s
        .char_indices()
        .find(|(i, c)| *c == '-' && !s[i + 1..].starts_with(' '))
    {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Rounds half away from zero to one decimal place and drops a trailing `.0`.
pub fn one_decimal(value: f64) -> String {
    let rounded = format!("{:.1}", (value * 10.0).round() / 10.0);
    match rounded.strip_suffix(".0") {
        Some(whole) => whole.to_string(),
        None => rounded,
    }
}

pub fn category_url(genre_id: &str) -> String {
    genre_id.to_ascii_lowercase().replace('_', "-")
}

/// Scales a store install bucket such as `"1,000,000+"` by `percent` and renders it.
pub fn display_installs(raw: &str, percent: u32) -> Result<String, DeriveError> {
    let digits: String = raw.chars().filter(|c| *c != ',' && *c != '+').collect();
    let num: u64 = digits
        .trim()
        .parse()
        .map_err(|_| DeriveError::InvalidInstalls(raw.to_string()))?;
    let value = f64::from(percent) / 100.0 * num as f64;

    let scaled = |divider: f64, suffix: &str| format!("{}{suffix}", one_decimal(value / divider));

    Ok(if value >= 1e12 {
        scaled(1e12, "T+")
    } else if value >= 1e9 {
        scaled(1e9, "B+")
    } else if value >= 1e6 {
        scaled(1e6, "M+")
    } else if value >= 1e3 {
        scaled(1e3, "K+")
    } else {
        format!("{}+", value.floor() as u64)
    })
}

/// Display percentage applied to install buckets, 30 to 40 inclusive.
pub fn random_install_percent<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.random_range(30..=40)
}

/// Capitalised 4-5 letter handle followed by 1-2 digits.
pub fn generate_username<R: Rng + ?Sized>(rng: &mut R) -> String {
    let letters = rng.random_range(4..=5);
    let digits = rng.random_range(1..=2);
    let mut out = String::with_capacity(letters + digits);
    for i in 0..letters {
        let c = (b'a' + rng.random_range(0..26u8)) as char;
        out.push(if i == 0 { c.to_ascii_uppercase() } else { c });
    }
    for _ in 0..digits {
        out.push(char::from(b'0' + rng.random_range(0..10u8)));
    }
    out
}

pub fn random_comment_date<R: Rng + ?Sized>(rng: &mut R) -> DateTime<Utc> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single();
    let end = Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).single();
    match (start, end) {
        (Some(start), Some(end)) => {
            let span = (end - start).num_milliseconds();
            start + chrono::Duration::milliseconds(rng.random_range(0..span))
        }
        _ => Utc::now(),
    }
}

/// Attaches generated authorship to raw review texts.
pub fn build_comments<R: Rng + ?Sized>(texts: Vec<String>, rng: &mut R) -> Vec<Comment> {
    texts
        .into_iter()
        .map(|text| Comment {
            text,
            username: generate_username(rng),
            date: random_comment_date(rng),
        })
        .collect()
}
