//! Canonical field resolution and row parsing for scan exports.
//!
//! Input is either raw CSV text (delimiter detected, quoting honored) or rows
//! already split by an upstream decoder. Output is typed `ParsedRecord`s plus
//! skip counters; a bad row never fails the batch.

use std::collections::HashMap;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use scantrack_core::{
    canonical_key, class_id_for_name, class_name, EntityKind, GuildRecord, ParsedRecord,
    PlayerRecord, RawRow,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "scantrack-parse";

const IDENTIFIER_ALIASES_PLAYER: [&str; 2] = ["ID", "Identifier"];
const IDENTIFIER_ALIASES_GUILD: [&str; 1] = ["Guild Identifier"];
const TIMESTAMP_ALIASES: [&str; 3] = ["Timestamp", "Time", "Date"];
const SERVER_ALIASES: [&str; 2] = ["Server", "World"];
const NAME_ALIASES_PLAYER: [&str; 1] = ["Name"];
const NAME_ALIASES_GUILD: [&str; 3] = ["Guild Name", "Name", "Guild"];
const GUILD_ID_ALIASES: [&str; 2] = ["Guild Identifier", "Guild ID"];
const GUILD_NAME_ALIASES: [&str; 2] = ["Guild", "Guild Name"];
const LEVEL_ALIASES: [&str; 3] = ["Level", "Lvl", "Stufe"];
const CLASS_ALIASES: [&str; 2] = ["Class", "Klasse"];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("csv decode failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("input contains no header line")]
    EmptyInput,
}

/// Case/whitespace/underscore-insensitive lookup from a canonical key to the
/// first observed header that spells it. Absent fields resolve to `None`;
/// there is no failure path.
#[derive(Debug, Clone)]
pub struct FieldResolver {
    by_canonical: HashMap<String, String>,
}

impl FieldResolver {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut by_canonical = HashMap::new();
        for header in headers {
            let canon = canonical_key(header.as_ref());
            if canon.is_empty() {
                continue;
            }
            by_canonical
                .entry(canon)
                .or_insert_with(|| header.as_ref().to_string());
        }
        Self { by_canonical }
    }

    /// Observed header registered for a canonical key, if any.
    pub fn header_for(&self, key: &str) -> Option<&str> {
        self.by_canonical.get(&canonical_key(key)).map(String::as_str)
    }

    /// First non-empty value for a canonical key. Falls back to a linear scan
    /// of the row's own headers; rows can carry columns the batch header list
    /// never saw.
    pub fn value<'a>(&self, row: &'a RawRow, key: &str) -> Option<&'a str> {
        let canon = canonical_key(key);
        if let Some(header) = self.by_canonical.get(&canon) {
            if let Some(value) = row.get(header) {
                if !value.trim().is_empty() {
                    return Some(value);
                }
            }
        }
        row.iter()
            .find(|(header, value)| canonical_key(header) == canon && !value.trim().is_empty())
            .map(|(_, value)| value)
    }

    /// First non-empty match across aliases, in alias order.
    pub fn first_of<'a>(&self, row: &'a RawRow, aliases: &[&str]) -> Option<&'a str> {
        aliases.iter().find_map(|alias| self.value(row, alias))
    }

    /// First alias value that parses as a number.
    pub fn first_numeric(&self, row: &RawRow, aliases: &[&str]) -> Option<f64> {
        aliases
            .iter()
            .filter_map(|alias| self.value(row, alias))
            .find_map(|value| value.trim().replace(',', ".").parse::<f64>().ok())
    }
}

/// Parses a timestamp cell. Accepted forms, in order: 13-digit epoch millis,
/// 10-digit epoch seconds, `dd.mm.yyyy HH:mm[:ss]` (local), RFC 3339,
/// `YYYY-MM-DD[ T]HH:MM[:SS]` (local), bare `YYYY-MM-DD` at local midnight.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if value.chars().all(|c| c.is_ascii_digit()) {
        if value.len() == 13 {
            return value.parse::<i64>().ok().map(|millis| millis / 1000);
        }
        if value.len() == 10 {
            return value.parse::<i64>().ok();
        }
    }

    for format in ["%d.%m.%Y %H:%M:%S", "%d.%m.%Y %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(local_epoch(naive));
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp());
    }

    for format in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(local_epoch(naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0)?;
        return Some(local_epoch(naive));
    }

    None
}

fn local_epoch(naive: NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

/// Input to one import run: rows an upstream decoder already split, or the
/// raw CSV text of an uploaded export.
#[derive(Debug, Clone)]
pub enum ImportInput {
    Rows {
        headers: Vec<String>,
        rows: Vec<RawRow>,
    },
    RawText(String),
}

/// Per-batch row accounting. Each skipped row bumps exactly one reason
/// counter; the batch itself never fails on a bad row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub total_rows: usize,
    pub accepted: usize,
    pub missing_identifier: usize,
    pub bad_timestamp: usize,
    pub missing_server: usize,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub rows: Vec<ParsedRecord>,
    pub stats: ParseStats,
    pub headers: Vec<String>,
}

enum SkipReason {
    MissingIdentifier,
    BadTimestamp,
    MissingServer,
}

/// Picks the delimiter with the highest occurrence count in the header line.
/// Candidates are comma, semicolon, tab and pipe; comma wins ties.
pub fn detect_delimiter(header_line: &str) -> u8 {
    let mut best = b',';
    let mut best_count = header_line.matches(',').count();
    for candidate in [b';', b'\t', b'|'] {
        let count = header_line.matches(candidate as char).count();
        if count > best_count {
            best = candidate;
            best_count = count;
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct DecodedCsv {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub delimiter: u8,
}

/// Decodes raw CSV text: strips the BOM, normalizes line endings, detects the
/// delimiter, honors double-quote escaping, drops blank and all-empty lines,
/// and assigns `column_{i+1}` placeholder names to unnamed columns.
pub fn decode_csv_text(raw: &str) -> Result<DecodedCsv, ParseError> {
    let text = normalize_text(raw);
    let header_line = text.lines().find(|line| !line.trim().is_empty());
    let Some(header_line) = header_line else {
        return Err(ParseError::EmptyInput);
    };
    let delimiter = detect_delimiter(header_line);
    debug!(delimiter = %char::from(delimiter), "detected csv delimiter");

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut headers: Vec<String> = Vec::new();
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        if headers.is_empty() {
            headers = record
                .iter()
                .enumerate()
                .map(|(i, cell)| placeholder_or(cell, i))
                .collect();
            continue;
        }
        let row: RawRow = record
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let header = headers
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| placeholder_name(i));
                (header, cell.to_string())
            })
            .collect();
        rows.push(row);
    }

    if headers.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    Ok(DecodedCsv {
        headers,
        rows,
        delimiter,
    })
}

fn normalize_text(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

fn placeholder_name(index: usize) -> String {
    format!("column_{}", index + 1)
}

fn placeholder_or(cell: &str, index: usize) -> String {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        placeholder_name(index)
    } else {
        trimmed.to_string()
    }
}

/// Parses one import input into typed records. Text inputs are decoded first;
/// pre-split rows go straight to per-row resolution.
pub fn parse_input(kind: EntityKind, input: ImportInput) -> Result<ParseOutcome, ParseError> {
    match input {
        ImportInput::Rows { headers, rows } => Ok(parse_rows(kind, headers, rows)),
        ImportInput::RawText(text) => {
            let decoded = decode_csv_text(&text)?;
            Ok(parse_rows(kind, decoded.headers, decoded.rows))
        }
    }
}

/// Resolves every row against the batch header list. Rows missing an
/// identifier, a parsable timestamp or a server are counted and dropped, in
/// that evaluation order.
pub fn parse_rows(kind: EntityKind, headers: Vec<String>, rows: Vec<RawRow>) -> ParseOutcome {
    let resolver = FieldResolver::new(&headers);
    let mut stats = ParseStats {
        total_rows: rows.len(),
        ..ParseStats::default()
    };
    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        match build_record(kind, &resolver, row) {
            Ok(record) => {
                stats.accepted += 1;
                records.push(record);
            }
            Err(SkipReason::MissingIdentifier) => stats.missing_identifier += 1,
            Err(SkipReason::BadTimestamp) => stats.bad_timestamp += 1,
            Err(SkipReason::MissingServer) => stats.missing_server += 1,
        }
    }

    debug!(
        kind = %kind,
        total = stats.total_rows,
        accepted = stats.accepted,
        missing_identifier = stats.missing_identifier,
        bad_timestamp = stats.bad_timestamp,
        missing_server = stats.missing_server,
        "parsed scan rows"
    );

    ParseOutcome {
        rows: records,
        stats,
        headers,
    }
}

fn build_record(
    kind: EntityKind,
    resolver: &FieldResolver,
    row: RawRow,
) -> Result<ParsedRecord, SkipReason> {
    let identifier_aliases: &[&str] = match kind {
        EntityKind::Players => &IDENTIFIER_ALIASES_PLAYER,
        EntityKind::Guilds => &IDENTIFIER_ALIASES_GUILD,
    };
    let entity_id = resolver
        .first_of(&row, identifier_aliases)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(SkipReason::MissingIdentifier)?
        .to_string();

    let timestamp_sec = resolver
        .first_of(&row, &TIMESTAMP_ALIASES)
        .and_then(parse_timestamp)
        .ok_or(SkipReason::BadTimestamp)?;

    let server = resolver
        .first_of(&row, &SERVER_ALIASES)
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .ok_or(SkipReason::MissingServer)?;

    match kind {
        EntityKind::Players => {
            let name = resolver
                .first_of(&row, &NAME_ALIASES_PLAYER)
                .unwrap_or_default()
                .trim()
                .to_string();
            let guild_identifier = resolver
                .first_of(&row, &GUILD_ID_ALIASES)
                .map(|v| v.trim().to_string());
            let guild_name = resolver
                .first_of(&row, &GUILD_NAME_ALIASES)
                .map(|v| v.trim().to_string());
            let level = resolver
                .first_numeric(&row, &LEVEL_ALIASES)
                .map(|v| v.max(0.0) as u32);
            let (class_id, class_name) = resolve_class(resolver, &row);
            Ok(ParsedRecord::Player(PlayerRecord {
                entity_id,
                server,
                name,
                timestamp_sec,
                guild_identifier,
                guild_name,
                level,
                class_id,
                class_name,
                raw: row,
            }))
        }
        EntityKind::Guilds => {
            let name = resolver
                .first_of(&row, &NAME_ALIASES_GUILD)
                .unwrap_or_default()
                .trim()
                .to_string();
            Ok(ParsedRecord::Guild(GuildRecord {
                entity_id,
                server,
                name,
                timestamp_sec,
                raw: row,
            }))
        }
    }
}

/// Class cells are either a numeric id mapped through the fixed table, or a
/// free-text name matched back to an id canonically. Free text that matches
/// nothing keeps the text with no id.
fn resolve_class(resolver: &FieldResolver, row: &RawRow) -> (Option<u32>, Option<String>) {
    let Some(cell) = resolver.first_of(row, &CLASS_ALIASES) else {
        return (None, None);
    };
    let trimmed = cell.trim();
    if let Ok(id) = trimmed.parse::<u32>() {
        return match class_name(id) {
            Some(name) => (Some(id), Some(name.to_string())),
            None => (None, None),
        };
    }
    match class_id_for_name(trimmed) {
        Some(id) => (Some(id), class_name(id).map(str::to_string)),
        None => (None, Some(trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn resolver_matches_spelling_variants_and_prefers_first_header() {
        let resolver = FieldResolver::new(["Guild_Identifier", "guild identifier", "Level"]);
        assert_eq!(resolver.header_for("Guild Identifier"), Some("Guild_Identifier"));

        let r = row(&[("Guild_Identifier", "g9"), ("Level", "311")]);
        assert_eq!(resolver.value(&r, "guild identifier"), Some("g9"));
        assert_eq!(resolver.first_of(&r, &["Lvl", "Level"]), Some("311"));
    }

    #[test]
    fn resolver_falls_back_to_row_local_headers() {
        let resolver = FieldResolver::new(["Name"]);
        let r = row(&[("Name", "a"), ("STUFE", "42")]);
        // "Stufe" never appeared in the batch header list
        assert_eq!(resolver.value(&r, "Stufe"), Some("42"));
        assert_eq!(resolver.value(&r, "Class"), None);
    }

    #[test]
    fn resolver_skips_empty_cells() {
        let resolver = FieldResolver::new(["Level", "Lvl"]);
        let r = row(&[("Level", "  "), ("Lvl", "301")]);
        assert_eq!(resolver.first_of(&r, &["Level", "Lvl"]), Some("301"));
    }

    #[test]
    fn delimiter_detection_counts_header_occurrences() {
        assert_eq!(detect_delimiter("ID,Name,Server"), b',');
        assert_eq!(detect_delimiter("ID;Name;Server;Level"), b';');
        assert_eq!(detect_delimiter("ID\tName\tServer"), b'\t');
        assert_eq!(detect_delimiter("ID|Name|Server"), b'|');
        // tie falls back to comma
        assert_eq!(detect_delimiter("ID"), b',');
    }

    #[test]
    fn timestamp_parser_accepts_the_documented_forms() {
        assert_eq!(parse_timestamp("1700000000"), Some(1_700_000_000));
        assert_eq!(parse_timestamp("1700000000000"), Some(1_700_000_000));
        assert_eq!(parse_timestamp(" 1700000000 "), Some(1_700_000_000));

        let expected = Local
            .with_ymd_and_hms(2025, 2, 21, 14, 30, 0)
            .earliest()
            .map(|dt| dt.timestamp());
        assert_eq!(parse_timestamp("21.02.2025 14:30"), expected);
        assert_eq!(
            parse_timestamp("21.02.2025 14:30:00"),
            expected
        );

        let expected_iso = Local
            .with_ymd_and_hms(2025, 2, 21, 0, 0, 0)
            .earliest()
            .map(|dt| dt.timestamp());
        assert_eq!(parse_timestamp("2025-02-21"), expected_iso);

        assert_eq!(parse_timestamp("not-a-date"), None);
        assert_eq!(parse_timestamp(""), None);
        // digit strings of odd length are not epoch values
        assert_eq!(parse_timestamp("12345"), None);
    }

    #[test]
    fn csv_decode_strips_bom_and_honors_quotes() {
        let text = "\u{feff}ID,Name,Server\r\n\"p1\",\"Alice, the Bold\",eu1\n";
        let decoded = decode_csv_text(text).expect("decoded");
        assert_eq!(decoded.delimiter, b',');
        assert_eq!(decoded.headers, vec!["ID", "Name", "Server"]);
        assert_eq!(decoded.rows.len(), 1);
        assert_eq!(decoded.rows[0].get("Name"), Some("Alice, the Bold"));
    }

    #[test]
    fn csv_decode_drops_blank_lines_and_names_headerless_columns() {
        let text = "ID,,Server\np1,foo,eu1,extra\n\n ,,\np2,bar,eu2\n";
        let decoded = decode_csv_text(text).expect("decoded");
        assert_eq!(decoded.headers, vec!["ID", "column_2", "Server"]);
        assert_eq!(decoded.rows.len(), 2);
        // cell past the header list got a positional placeholder
        assert_eq!(decoded.rows[0].get("column_4"), Some("extra"));
    }

    #[test]
    fn csv_decode_rejects_empty_input() {
        assert!(matches!(decode_csv_text(""), Err(ParseError::EmptyInput)));
        assert!(matches!(decode_csv_text("\n  \n"), Err(ParseError::EmptyInput)));
    }

    #[test]
    fn skip_counters_follow_the_evaluation_order() {
        let headers = vec!["ID".into(), "Timestamp".into(), "Server".into()];
        let rows = vec![
            row(&[("ID", ""), ("Timestamp", "nope"), ("Server", "")]),
            row(&[("ID", "p1"), ("Timestamp", "nope"), ("Server", "")]),
            row(&[("ID", "p2"), ("Timestamp", "1700000000"), ("Server", " ")]),
            row(&[("ID", "p3"), ("Timestamp", "1700000000"), ("Server", "eu1")]),
        ];
        let outcome = parse_rows(EntityKind::Players, headers, rows);
        assert_eq!(outcome.stats.total_rows, 4);
        assert_eq!(outcome.stats.missing_identifier, 1);
        assert_eq!(outcome.stats.bad_timestamp, 1);
        assert_eq!(outcome.stats.missing_server, 1);
        assert_eq!(outcome.stats.accepted, 1);
        assert_eq!(outcome.rows[0].entity_id(), "p3");
        assert_eq!(outcome.rows[0].server(), "EU1");
    }

    #[test]
    fn player_rows_resolve_level_class_and_guild_fields() {
        let headers: Vec<String> = ["ID", "Name", "Server", "Timestamp", "Stufe", "Class", "Guild"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = vec![row(&[
            ("ID", "p1"),
            ("Name", "Alice"),
            ("Server", "eu1"),
            ("Timestamp", "1700000000"),
            ("Stufe", "312.0"),
            ("Class", "5"),
            ("Guild", "Knights"),
        ])];
        let outcome = parse_rows(EntityKind::Players, headers, rows);
        let ParsedRecord::Player(player) = &outcome.rows[0] else {
            panic!("expected player record");
        };
        assert_eq!(player.level, Some(312));
        assert_eq!(player.class_id, Some(5));
        assert_eq!(player.class_name.as_deref(), Some("Battle Mage"));
        assert_eq!(player.guild_name.as_deref(), Some("Knights"));
    }

    #[test]
    fn free_text_class_maps_back_to_an_id() {
        let resolver = FieldResolver::new(["Class"]);
        let r = row(&[("Class", "demon_hunter")]);
        assert_eq!(resolve_class(&resolver, &r), (Some(7), Some("Demon Hunter".to_string())));

        let unknown = row(&[("Class", "Pirate")]);
        assert_eq!(resolve_class(&resolver, &unknown), (None, Some("Pirate".to_string())));

        let out_of_table = row(&[("Class", "99")]);
        assert_eq!(resolve_class(&resolver, &out_of_table), (None, None));
    }

    #[test]
    fn guild_rows_use_the_guild_identifier_column() {
        let headers: Vec<String> = ["Guild Identifier", "Name", "Server", "Timestamp"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = vec![row(&[
            ("Guild Identifier", "g1"),
            ("Name", "Knights"),
            ("Server", "eu1"),
            ("Timestamp", "1700000000"),
        ])];
        let outcome = parse_rows(EntityKind::Guilds, headers, rows);
        assert_eq!(outcome.stats.accepted, 1);
        let ParsedRecord::Guild(guild) = &outcome.rows[0] else {
            panic!("expected guild record");
        };
        assert_eq!(guild.entity_id, "g1");
        assert_eq!(guild.name, "Knights");
    }

    #[test]
    fn semicolon_exports_parse_end_to_end() {
        let text = "ID;Name;Server;Timestamp\np1;Alice;eu1;1700000000\np2;Bob;eu1;1700000100\n";
        let outcome =
            parse_input(EntityKind::Players, ImportInput::RawText(text.to_string()))
                .expect("parsed");
        assert_eq!(outcome.stats.accepted, 2);
        assert_eq!(outcome.headers, vec!["ID", "Name", "Server", "Timestamp"]);
    }
}
