//! Core domain model and persisted document shapes for ScanTrack.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "scantrack-core";

/// Separator between scan key segments. Entity ids and server codes observed
/// in real exports never contain a double underscore.
pub const KEY_SEPARATOR: &str = "__";

/// Numeric fallback timestamps above this magnitude are epoch milliseconds.
pub const EPOCH_MILLIS_THRESHOLD: i64 = 9_999_999_999;

/// Collection names shared by every store backend.
pub mod collections {
    pub const PLAYER_SCANS: &str = "player_scans";
    pub const GUILD_SCANS: &str = "guild_scans";
    pub const PLAYER_LATEST: &str = "player_latest";
    pub const GUILD_LATEST: &str = "guild_latest";
    pub const PLAYER_HISTORY_WEEKLY: &str = "player_history_weekly";
    pub const PLAYER_HISTORY_MONTHLY: &str = "player_history_monthly";
    pub const GUILD_HISTORY_WEEKLY: &str = "guild_history_weekly";
    pub const GUILD_HISTORY_MONTHLY: &str = "guild_history_monthly";
    pub const RANK_INDEX: &str = "rank_index";
}

/// Normalizes a header or field name for matching: lowercased, with all
/// whitespace and underscores removed, so `Guild Identifier`,
/// `guild_identifier` and `GUILDIDENTIFIER` compare equal.
pub fn canonical_key(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Idempotency key for one observed row: `entity__server__seconds`.
pub fn scan_key(entity_id: &str, server: &str, timestamp_sec: i64) -> String {
    format!("{entity_id}{KEY_SEPARATOR}{server}{KEY_SEPARATOR}{timestamp_sec}")
}

/// Discriminator carried by every import request and report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Players,
    Guilds,
}

impl EntityKind {
    pub fn scan_collection(self) -> &'static str {
        match self {
            EntityKind::Players => collections::PLAYER_SCANS,
            EntityKind::Guilds => collections::GUILD_SCANS,
        }
    }

    pub fn latest_collection(self) -> &'static str {
        match self {
            EntityKind::Players => collections::PLAYER_LATEST,
            EntityKind::Guilds => collections::GUILD_LATEST,
        }
    }

    pub fn weekly_collection(self) -> &'static str {
        match self {
            EntityKind::Players => collections::PLAYER_HISTORY_WEEKLY,
            EntityKind::Guilds => collections::GUILD_HISTORY_WEEKLY,
        }
    }

    pub fn monthly_collection(self) -> &'static str {
        match self {
            EntityKind::Players => collections::PLAYER_HISTORY_MONTHLY,
            EntityKind::Guilds => collections::GUILD_HISTORY_MONTHLY,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Players => f.write_str("players"),
            EntityKind::Guilds => f.write_str("guilds"),
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "players" | "player" => Ok(EntityKind::Players),
            "guilds" | "guild" => Ok(EntityKind::Guilds),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// One raw input row: the observed headers paired with their cell values, in
/// input order. Headers are free-form and may repeat; `get` returns the first
/// match. Values are always strings, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow(Vec<(String, String)>);

impl RawRow {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, header: impl Into<String>, value: impl Into<String>) {
        self.0.push((header.into(), value.into()));
    }

    /// First value stored under an exactly matching header.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(h, v)| (h.as_str(), v.as_str()))
    }

    pub fn headers(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(h, _)| h.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Header→value map for persistence; the first value wins when a header
    /// repeats within the row.
    pub fn to_value_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for (header, value) in &self.0 {
            map.entry(header.clone()).or_insert_with(|| value.clone());
        }
        map
    }

    pub fn all_values_empty(&self) -> bool {
        self.0.iter().all(|(_, v)| v.trim().is_empty())
    }
}

impl FromIterator<(String, String)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Fixed class-id → display-name table. Ids are 1-based; free-text class
/// cells are matched back to an id by canonical-name comparison.
pub const CLASS_NAMES: [&str; 11] = [
    "Warrior",
    "Mage",
    "Scout",
    "Assassin",
    "Battle Mage",
    "Berserker",
    "Demon Hunter",
    "Druid",
    "Bard",
    "Necromancer",
    "Paladin",
];

pub fn class_name(id: u32) -> Option<&'static str> {
    if id == 0 {
        return None;
    }
    CLASS_NAMES.get(id as usize - 1).copied()
}

pub fn class_id_for_name(name: &str) -> Option<u32> {
    let wanted = canonical_key(name);
    if wanted.is_empty() {
        return None;
    }
    CLASS_NAMES
        .iter()
        .position(|candidate| canonical_key(candidate) == wanted)
        .map(|idx| idx as u32 + 1)
}

/// One accepted player row, typed at the parse boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub entity_id: String,
    pub server: String,
    pub name: String,
    pub timestamp_sec: i64,
    pub guild_identifier: Option<String>,
    pub guild_name: Option<String>,
    pub level: Option<u32>,
    pub class_id: Option<u32>,
    pub class_name: Option<String>,
    pub raw: RawRow,
}

/// One accepted guild row, typed at the parse boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildRecord {
    pub entity_id: String,
    pub server: String,
    pub name: String,
    pub timestamp_sec: i64,
    pub raw: RawRow,
}

/// Typed union the whole pipeline operates on; raw untyped maps never travel
/// past the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedRecord {
    Player(PlayerRecord),
    Guild(GuildRecord),
}

impl ParsedRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            ParsedRecord::Player(_) => EntityKind::Players,
            ParsedRecord::Guild(_) => EntityKind::Guilds,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            ParsedRecord::Player(p) => &p.entity_id,
            ParsedRecord::Guild(g) => &g.entity_id,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            ParsedRecord::Player(p) => &p.server,
            ParsedRecord::Guild(g) => &g.server,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ParsedRecord::Player(p) => &p.name,
            ParsedRecord::Guild(g) => &g.name,
        }
    }

    pub fn timestamp_sec(&self) -> i64 {
        match self {
            ParsedRecord::Player(p) => p.timestamp_sec,
            ParsedRecord::Guild(g) => g.timestamp_sec,
        }
    }

    pub fn raw(&self) -> &RawRow {
        match self {
            ParsedRecord::Player(p) => &p.raw,
            ParsedRecord::Guild(g) => &g.raw,
        }
    }

    pub fn scan_key(&self) -> String {
        scan_key(self.entity_id(), self.server(), self.timestamp_sec())
    }
}

/// Persisted record of one observed row. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDocument {
    pub key: String,
    pub kind: EntityKind,
    pub entity_id: String,
    pub server: String,
    pub name: String,
    pub timestamp_sec: i64,
    pub values: BTreeMap<String, String>,
}

impl ScanDocument {
    pub fn from_record(record: &ParsedRecord) -> Self {
        Self {
            key: record.scan_key(),
            kind: record.kind(),
            entity_id: record.entity_id().to_string(),
            server: record.server().to_string(),
            name: record.name().to_string(),
            timestamp_sec: record.timestamp_sec(),
            values: record.raw().to_value_map(),
        }
    }
}

/// Most recent observed state for one entity plus derived search fields and
/// dropdown metadata. `timestamp_sec` is monotonically non-decreasing across
/// writes; the guard skips any candidate that is not strictly newer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestDocument {
    pub entity_id: String,
    pub server: String,
    pub name: String,
    pub timestamp_sec: i64,
    pub values: BTreeMap<String, String>,
    pub name_folded: String,
    pub search_tokens: Vec<String>,
    pub search_prefixes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_name_folded: Option<String>,
    pub updated_at_sec: i64,
}

/// Weekly or monthly rollup of one entity's scans within the current batch.
/// Upserted by merge so replaying the same batch converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBucketDocument {
    pub entity_id: String,
    pub period_id: String,
    pub period_start_sec: i64,
    pub period_end_sec: i64,
    pub last_timestamp_sec: i64,
    pub values: BTreeMap<String, String>,
}

/// Leaderboard partition: a metric group crossed with a server or `all`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RankScope {
    pub group: String,
    pub server_key: String,
}

impl RankScope {
    pub const ALL: &'static str = "all";

    pub fn new(group: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            server_key: server_key.into(),
        }
    }

    pub fn id(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.group, self.server_key)
    }
}

/// Ranked leaderboard snapshot for one `(date_key, scope)`. The arrays are
/// parallel, sorted descending by value, with `ranks[i] == i + 1`. Rebuilt
/// wholesale on every import that touches the scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBucketDocument {
    pub n: usize,
    pub ids: Vec<String>,
    pub vals: Vec<i64>,
    pub ranks: Vec<u32>,
    pub group: String,
    pub server_key: String,
    pub metric: String,
    pub date_key: String,
    pub generated_at_sec: i64,
}

/// Input contract for the derived-stats collaborator.
#[derive(Debug, Clone)]
pub struct StatsInput<'a> {
    pub entity_id: &'a str,
    pub name: &'a str,
    pub class_name: Option<&'a str>,
    pub level: Option<u32>,
    pub server: &'a str,
    pub guild_identifier: Option<&'a str>,
    pub guild_name: Option<&'a str>,
    pub values: &'a RawRow,
    pub timestamp_sec: i64,
    pub updated_at_sec: i64,
}

/// Output of the derived-stats collaborator; `sum` feeds the ranking scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedStats {
    pub sum: i64,
    pub group: String,
    pub server_key: String,
}

/// Pure derivation function supplied by the caller. The engine stores the
/// result and uses `sum` as the ranking metric; it never observes side
/// effects from implementations.
pub trait StatsDeriver: Send + Sync {
    fn derive(&self, input: &StatsInput<'_>) -> DerivedStats;
}
