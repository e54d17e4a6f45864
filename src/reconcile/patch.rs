//! Field-by-field change detection for REST entities
//!
//! Entities are flat string maps. A write is only issued when a field
//! differs after type-aware normalization, which keeps converged devices
//! quiet and stops fields the router derives itself from flapping.

use std::collections::BTreeMap;

pub type Entry = BTreeMap<String, String>;

/// How a field is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Trimmed exact match
    Text,
    /// Trimmed, ASCII case-insensitive
    TextIgnoreCase,
    /// Comma separated set, order and whitespace ignored
    Csv,
    /// Integer where `0`, negatives and empty mean "unset"
    OptionalInt,
    /// Duration in seconds; accepts `25`, `25s`, `1m30s`, `00:01:30`
    Seconds,
    Bool,
    /// Host part of an endpoint, brackets ignored
    Endpoint,
}

impl FieldKind {
    pub fn normalize(self, raw: &str) -> String {
        match self {
            FieldKind::Text => raw.trim().to_string(),
            FieldKind::TextIgnoreCase => raw.trim().to_ascii_lowercase(),
            FieldKind::Csv => normalize_csv(raw),
            FieldKind::OptionalInt => normalize_optional_int(raw),
            FieldKind::Seconds => match parse_routeros_duration(raw) {
                Some(0) => String::new(),
                Some(secs) => secs.to_string(),
                None => raw.trim().to_string(),
            },
            FieldKind::Bool => normalize_bool(raw).to_string(),
            FieldKind::Endpoint => raw.trim().trim_matches(|c| c == '[' || c == ']').to_string(),
        }
    }
}

/// Sorted, comma-joined set of the non-empty trimmed parts
pub fn normalize_csv(raw: &str) -> String {
    let mut values: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    values.sort_unstable();
    values.join(",")
}

/// `0`, negatives and empty collapse to empty; non-numbers pass through trimmed
pub fn normalize_optional_int(raw: &str) -> String {
    let raw = raw.trim();
    match raw.parse::<i64>() {
        Ok(value) if value <= 0 => String::new(),
        Ok(value) => value.to_string(),
        Err(_) => raw.to_string(),
    }
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

pub fn normalize_bool(raw: &str) -> &'static str {
    if parse_bool(raw) {
        "true"
    } else {
        "false"
    }
}

/// Parse RouterOS durations such as `25s`, `1m30s`, `2h`, `1w2d` or `00:01:30`
///
/// Plain integers are seconds. Sub-second parts (`ms`) are dropped.
pub fn parse_routeros_duration(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(0);
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }

    if raw.contains(':') {
        let mut total = 0u64;
        for part in raw.split(':') {
            let value: u64 = part.split('.').next()?.parse().ok()?;
            total = total.checked_mul(60)?.checked_add(value)?;
        }
        return Some(total);
    }

    let mut total = 0u64;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            'w' => 7 * 24 * 3600,
            'd' => 24 * 3600,
            'h' => 3600,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                0
            }
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// First present key, trimmed; empty when none is present
pub fn value<'a>(entry: &'a Entry, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|key| entry.get(*key))
        .map(|v| v.trim())
        .unwrap_or_default()
}

pub fn int_value(entry: &Entry, keys: &[&str]) -> u32 {
    value(entry, keys).parse().unwrap_or_default()
}

pub fn u64_value(entry: &Entry, keys: &[&str]) -> u64 {
    value(entry, keys).parse().unwrap_or_default()
}

pub fn bool_value(entry: &Entry, keys: &[&str]) -> bool {
    parse_bool(value(entry, keys))
}

/// Whether any desired field differs from the current entity
///
/// Fields missing from `schema` compare as `FieldKind::Text`; a field absent
/// on the current entity compares as empty.
pub fn needs_patch(current: &Entry, desired: &Entry, schema: &[(&str, FieldKind)]) -> bool {
    desired.iter().any(|(field, wanted)| {
        let kind = schema
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, kind)| *kind)
            .unwrap_or(FieldKind::Text);
        let observed = current.get(field).map(String::as_str).unwrap_or_default();
        kind.normalize(observed) != kind.normalize(wanted)
    })
}
