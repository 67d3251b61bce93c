//! Field normalizer: raw scraped text to typed, canonical values.
//!
//! `clean_water_name` produces the matching key used by both location resolution and the
//! stocking natural key, so it must stay deterministic and idempotent.

use chrono::NaiveDate;
use serde::Serialize;
use troutlytics_core::{columns, NormalizedRow, RawRow, SOURCE_DATE_FORMATS};

/// Abbreviations the source uses inside water names, expanded during cleaning.
pub const WATER_NAME_ABBREVIATIONS: &[(&str, &str)] = &[
    ("lk", "lake"),
    ("lks", "lakes"),
    ("pd", "pond"),
    ("pds", "ponds"),
    ("cr", "creek"),
    ("crk", "creek"),
    ("res", "reservoir"),
    ("rsvr", "reservoir"),
    ("prk", "park"),
    ("co", "county"),
    ("mt", "mount"),
    ("ft", "fort"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidDate,
    InvalidQuantity,
    MissingField,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub reason: RejectReason,
    pub field: &'static str,
    pub detail: String,
}

impl RejectedRow {
    fn new(reason: RejectReason, field: &'static str, detail: impl Into<String>) -> Self {
        Self {
            reason,
            field,
            detail: detail.into(),
        }
    }
}

pub fn normalize(raw: &RawRow) -> Result<NormalizedRow, RejectedRow> {
    let water_name_raw = required(raw, columns::WATER)?;
    let water_name_cleaned = clean_water_name(water_name_raw);
    if water_name_cleaned.is_empty() {
        return Err(RejectedRow::new(
            RejectReason::MissingField,
            columns::WATER,
            format!("{water_name_raw:?} has no name left after cleaning"),
        ));
    }

    let date_text = cell(raw, columns::DATE).ok_or_else(|| {
        RejectedRow::new(RejectReason::InvalidDate, columns::DATE, "missing stock date")
    })?;
    let event_date = parse_event_date(date_text).ok_or_else(|| {
        RejectedRow::new(
            RejectReason::InvalidDate,
            columns::DATE,
            format!("unrecognized date {date_text:?}"),
        )
    })?;

    let species = title_case(required(raw, columns::SPECIES)?);
    let hatchery = title_case(required(raw, columns::HATCHERY)?);

    let count_text = cell(raw, columns::COUNT).ok_or_else(|| {
        RejectedRow::new(RejectReason::InvalidQuantity, columns::COUNT, "missing fish count")
    })?;
    let stocked_fish = parse_count(count_text).ok_or_else(|| {
        RejectedRow::new(
            RejectReason::InvalidQuantity,
            columns::COUNT,
            format!("not a non-negative whole number: {count_text:?}"),
        )
    })?;

    let weight = match cell(raw, columns::WEIGHT) {
        None => None,
        Some(text) => Some(parse_non_negative(text).ok_or_else(|| {
            RejectedRow::new(
                RejectReason::InvalidQuantity,
                columns::WEIGHT,
                format!("not a non-negative number: {text:?}"),
            )
        })?),
    };

    Ok(NormalizedRow {
        event_date,
        water_name_raw: water_name_raw.to_string(),
        water_name_cleaned,
        species,
        hatchery,
        stocked_fish,
        weight,
    })
}

fn cell<'a>(raw: &'a RawRow, column: &str) -> Option<&'a str> {
    raw.get(column).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn required<'a>(raw: &'a RawRow, column: &'static str) -> Result<&'a str, RejectedRow> {
    cell(raw, column)
        .ok_or_else(|| RejectedRow::new(RejectReason::MissingField, column, "empty or absent"))
}

pub fn parse_event_date(text: &str) -> Option<NaiveDate> {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    SOURCE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&text, fmt).ok())
}

/// Parses `"1,500"`, `"2000 fish"` or `"3.1 fish/lb"` style cells. Signs are kept so the
/// caller can reject negatives.
fn parse_quantity(text: &str) -> Option<f64> {
    let compact = text.trim().replace(',', "");
    let split = compact
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(compact.len());
    let (number, unit) = compact.split_at(split);
    let unit_ok = unit
        .chars()
        .all(|c| c.is_alphabetic() || c.is_whitespace() || c == '/' || c == '.');
    if !unit_ok {
        return None;
    }
    number.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_non_negative(text: &str) -> Option<f64> {
    parse_quantity(text).filter(|v| *v >= 0.0)
}

fn parse_count(text: &str) -> Option<u32> {
    let value = parse_non_negative(text)?;
    if value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return None;
    }
    Some(value as u32)
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical water-body name: parenthesized descriptors dropped, lowercase, apostrophes
/// removed, other punctuation treated as whitespace, abbreviations expanded.
pub fn clean_water_name(raw: &str) -> String {
    let lowered = strip_parenthesized(raw)
        .to_lowercase()
        .replace(['\'', '\u{2019}'], "");
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(expand_abbreviation)
        .collect::<Vec<_>>()
        .join(" ")
}

fn expand_abbreviation(token: &str) -> &str {
    WATER_NAME_ABBREVIATIONS
        .iter()
        .find(|(short, _)| *short == token)
        .map(|(_, long)| *long)
        .unwrap_or(token)
}

/// Removes `(...)` segments; an unclosed `(` drops the rest of the text.
fn strip_parenthesized(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut depth = 0usize;
    for c in raw.chars() {
        match c {
            '(' => {
                depth += 1;
                out.push(' ');
            }
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample() -> RawRow {
        raw(&[
            ("date", "03/15/2024"),
            ("water", "Battle Ground Lk"),
            ("species", "RAINBOW"),
            ("hatchery", "skamania"),
            ("count", "1,500"),
            ("weight", "2.5"),
        ])
    }

    #[test]
    fn sample_row_normalizes() {
        let row = normalize(&sample()).unwrap();
        assert_eq!(row.event_date, NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        assert_eq!(row.water_name_raw, "Battle Ground Lk");
        assert_eq!(row.water_name_cleaned, "battle ground lake");
        assert_eq!(row.species, "Rainbow");
        assert_eq!(row.hatchery, "Skamania");
        assert_eq!(row.stocked_fish, 1500);
        assert_eq!(row.weight, Some(2.5));
    }

    #[test]
    fn cleaning_handles_source_quirks() {
        assert_eq!(clean_water_name("  Battle   Ground LK (Clark County) "), "battle ground lake");
        assert_eq!(clean_water_name("Hunter's Pd"), "hunters pond");
        assert_eq!(clean_water_name("Lake Sacajawea-North"), "lake sacajawea north");
        assert_eq!(clean_water_name("Mt. Pilchuck Res."), "mount pilchuck reservoir");
        assert_eq!(clean_water_name("Swift (closed"), "swift");
        assert_eq!(clean_water_name("(Region 5)"), "");
    }

    #[test]
    fn cleaning_is_idempotent() {
        for name in [
            "Battle Ground Lk (Clark County)",
            "Hunter's Pd",
            "KLINELINE   PD.",
            "Mt. Pilchuck Res.",
            "Lk Lk Pd",
            "Ft Borst Park Pd",
        ] {
            let once = clean_water_name(name);
            assert_eq!(clean_water_name(&once), once, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn dates_accept_the_source_layouts() {
        for text in ["03/15/2024", "Mar 15, 2024", "March 15, 2024", " Mar  15,  2024 "] {
            assert_eq!(
                parse_event_date(text),
                NaiveDate::from_ymd_opt(2024, 3, 15),
                "{text:?}"
            );
        }
        assert_eq!(parse_event_date("15/03/2024"), None);
    }

    #[test]
    fn bad_dates_are_rejected() {
        let mut row = sample();
        row.insert("date".into(), "soon".into());
        assert_eq!(normalize(&row).unwrap_err().reason, RejectReason::InvalidDate);

        row.remove("date");
        assert_eq!(normalize(&row).unwrap_err().reason, RejectReason::InvalidDate);
    }

    #[test]
    fn quantities_are_parsed_permissively() {
        assert_eq!(parse_count("2,000 fish"), Some(2000));
        assert_eq!(parse_count("12"), Some(12));
        assert_eq!(parse_count("-20"), None);
        assert_eq!(parse_count("12.5"), None);
        assert_eq!(parse_count("about 40"), None);
        assert_eq!(parse_count("40 #3"), None);
        assert_eq!(parse_non_negative("3.1 fish/lb"), Some(3.1));
    }

    #[test]
    fn bad_quantities_are_rejected() {
        let mut row = sample();
        row.insert("count".into(), "-20".into());
        let rejected = normalize(&row).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::InvalidQuantity);
        assert_eq!(rejected.field, "count");

        let mut row = sample();
        row.insert("weight".into(), "heavy".into());
        assert_eq!(normalize(&row).unwrap_err().field, "weight");
    }

    #[test]
    fn blank_weight_is_absent() {
        let mut row = sample();
        row.insert("weight".into(), "  ".into());
        assert_eq!(normalize(&row).unwrap().weight, None);
    }

    #[test]
    fn names_that_clean_to_nothing_are_rejected() {
        let mut row = sample();
        row.insert("water".into(), "(unnamed)".into());
        let rejected = normalize(&row).unwrap_err();
        assert_eq!(rejected.reason, RejectReason::MissingField);
        assert_eq!(rejected.field, "water");
    }
}
