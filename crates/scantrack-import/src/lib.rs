//! The import pipeline: per-entity grouping, the latest-write guard, period
//! aggregation, idempotent scan persistence and ranking index construction.
//!
//! One run is a single sequential flow: parse, scan flush, latest pass,
//! history flush, index flush. Entities are independent within a run and the
//! store's create-if-absent semantics are the only cross-run coordination, so
//! re-running the same import is replay-safe by design.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use scantrack_core::{
    canonical_key, collections, DerivedStats, EntityKind, HistoryBucketDocument,
    IndexBucketDocument, LatestDocument, ParsedRecord, RankScope, ScanDocument, StatsDeriver,
    StatsInput, EPOCH_MILLIS_THRESHOLD, KEY_SEPARATOR,
};
use scantrack_parse::{parse_input, parse_timestamp};
use scantrack_storage::{
    BatchLimits, BatchOrchestrator, BatchPhase, DocumentStore, WriteMode, WriteOp, WriteOutcome,
    WriteStatus, DEFAULT_CHUNK_PAUSE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub use scantrack_parse::ImportInput;

pub const CRATE_NAME: &str = "scantrack-import";

// ---------------------------------------------------------------------------
// search-field derivation

/// Diacritic-stripped, lowercased form of a display name.
pub fn fold_name(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whitespace-split tokens of a folded name, at least two characters,
/// deduplicated in first-seen order.
pub fn search_tokens(folded: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in folded.split_whitespace() {
        if token.chars().count() < 2 {
            continue;
        }
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Every character prefix (length >= 1) of every token, deduplicated, for
/// prefix search against the latest index.
pub fn search_prefixes(tokens: &[String]) -> Vec<String> {
    let mut prefixes: Vec<String> = Vec::new();
    for token in tokens {
        let mut prefix = String::new();
        for c in token.chars() {
            prefix.push(c);
            if !prefixes.iter().any(|p| p == &prefix) {
                prefixes.push(prefix.clone());
            }
        }
    }
    prefixes
}

// ---------------------------------------------------------------------------
// aggregation policy

const DEFAULT_MAX_OF_FIELDS: [&str; 6] = [
    "Strength",
    "Dexterity",
    "Intelligence",
    "Constitution",
    "Luck",
    "Armor",
];

/// Classifies headers into max-of fields versus last-value fields. Matching
/// is canonical-name membership plus canonical substring rules. The defaults
/// cover the base attributes and anything mentioning "equipment"; exports
/// with other column conventions can supply their own policy file.
#[derive(Debug, Clone)]
pub struct AggregationPolicy {
    canonical_max: BTreeSet<String>,
    canonical_substrings: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    max_of: Vec<String>,
    #[serde(default)]
    substrings: Vec<String>,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OF_FIELDS, ["equipment"])
    }
}

impl AggregationPolicy {
    pub fn new<M, S>(max_of: M, substrings: S) -> Self
    where
        M: IntoIterator,
        M::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        Self {
            canonical_max: max_of
                .into_iter()
                .map(|f| canonical_key(f.as_ref()))
                .filter(|f| !f.is_empty())
                .collect(),
            canonical_substrings: substrings
                .into_iter()
                .map(|s| canonical_key(s.as_ref()))
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(text).context("parsing aggregation policy")?;
        Ok(Self::new(file.max_of, file.substrings))
    }

    pub fn from_yaml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn is_max_of(&self, header: &str) -> bool {
        let canon = canonical_key(header);
        self.canonical_max.contains(&canon)
            || self
                .canonical_substrings
                .iter()
                .any(|needle| canon.contains(needle.as_str()))
    }
}

// ---------------------------------------------------------------------------
// period bucketing

fn local_time(ts: i64) -> DateTime<Local> {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .expect("accepted timestamps stay within chrono range")
}

fn local_epoch(naive: NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| naive.and_utc().timestamp())
}

/// ISO week id, Monday start: `YYYY-Www`.
pub fn week_id(ts: i64) -> String {
    let week = local_time(ts).iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Calendar month id: `YYYY-MM`.
pub fn month_id(ts: i64) -> String {
    let date = local_time(ts).date_naive();
    format!("{:04}-{:02}", date.year(), date.month())
}

/// Monday 00:00:00 to Sunday 23:59:59, local time.
pub fn week_bounds(ts: i64) -> (i64, i64) {
    let date = local_time(ts).date_naive();
    let monday = date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64);
    let sunday = monday + chrono::Duration::days(6);
    (
        local_epoch(monday.and_hms_opt(0, 0, 0).expect("midnight exists")),
        local_epoch(sunday.and_hms_opt(23, 59, 59).expect("end of day exists")),
    )
}

/// First to last calendar day of the month, local time.
pub fn month_bounds(ts: i64) -> (i64, i64) {
    let date = local_time(ts).date_naive();
    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month");
    let next_month = if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
    .expect("first of next month");
    let last = next_month.pred_opt().expect("last of month");
    (
        local_epoch(first.and_hms_opt(0, 0, 0).expect("midnight exists")),
        local_epoch(last.and_hms_opt(23, 59, 59).expect("end of day exists")),
    )
}

/// Local calendar date of a timestamp: `YYYY-MM-DD`. Ranking scopes key on
/// this, so re-importing a historical scan rebuilds that day's leaderboard.
pub fn date_key(ts: i64) -> String {
    local_time(ts).format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Copy)]
enum Period {
    Weekly,
    Monthly,
}

impl Period {
    fn id(self, ts: i64) -> String {
        match self {
            Period::Weekly => week_id(ts),
            Period::Monthly => month_id(ts),
        }
    }

    fn bounds(self, ts: i64) -> (i64, i64) {
        match self {
            Period::Weekly => week_bounds(ts),
            Period::Monthly => month_bounds(ts),
        }
    }

    fn collection(self, kind: EntityKind) -> &'static str {
        match self {
            Period::Weekly => kind.weekly_collection(),
            Period::Monthly => kind.monthly_collection(),
        }
    }
}

// ---------------------------------------------------------------------------
// field aggregation

/// Digits-only numeric reading of a cell, used for max comparison. The
/// original cell text is what gets stored.
fn numeric_cell_value(cell: &str) -> Option<i64> {
    let digits: String = cell.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// Reduces one bucket of chronologically sorted records into a value per
/// observed header. Max-of fields keep the first-seen cell with the numeric
/// maximum; everything else takes the last non-empty cell.
pub fn aggregate_values(
    records: &[&ParsedRecord],
    headers: &[String],
    policy: &AggregationPolicy,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for header in headers {
        let value = if policy.is_max_of(header) {
            let mut best: Option<(i64, &str)> = None;
            for record in records {
                if let Some(cell) = record.raw().get(header) {
                    if let Some(numeric) = numeric_cell_value(cell) {
                        if best.map_or(true, |(current, _)| numeric > current) {
                            best = Some((numeric, cell));
                        }
                    }
                }
            }
            best.map(|(_, cell)| cell.to_string()).unwrap_or_default()
        } else {
            records
                .iter()
                .rev()
                .find_map(|record| {
                    record
                        .raw()
                        .get(header)
                        .filter(|cell| !cell.trim().is_empty())
                })
                .map(str::to_string)
                .unwrap_or_default()
        };
        out.insert(header.clone(), value);
    }
    out
}

// ---------------------------------------------------------------------------
// latest-write guard

/// Timestamp of a stored latest document. Prefers the raw timestamp cell the
/// scan carried; falls back to untagged numeric fields, where values above
/// the magnitude threshold are read as epoch millis. The threshold is a
/// heuristic over legacy data, not a type guarantee.
pub fn stored_latest_timestamp_sec(doc: &Value) -> Option<i64> {
    if let Some(values) = doc.get("values").and_then(Value::as_object) {
        for (header, cell) in values {
            if canonical_key(header) == "timestamp" {
                if let Some(ts) = cell.as_str().and_then(parse_timestamp) {
                    return Some(ts);
                }
            }
        }
    }
    for field in ["ts", "timestamp", "timestamp_sec"] {
        if let Some(numeric) = doc.get(field).and_then(Value::as_i64) {
            return Some(if numeric > EPOCH_MILLIS_THRESHOLD {
                numeric / 1000
            } else {
                numeric
            });
        }
    }
    None
}

/// Builds the latest document for a candidate record: derived search fields
/// plus the dropdown metadata players carry.
pub fn build_latest_document(record: &ParsedRecord, updated_at_sec: i64) -> LatestDocument {
    let name_folded = fold_name(record.name());
    let search_tokens = search_tokens(&name_folded);
    let search_prefixes = search_prefixes(&search_tokens);
    let (level, class_name, guild_name) = match record {
        ParsedRecord::Player(player) => (
            player.level,
            player.class_name.clone(),
            player.guild_name.clone(),
        ),
        ParsedRecord::Guild(_) => (None, None, None),
    };
    let guild_name_folded = guild_name.as_deref().map(fold_name);
    LatestDocument {
        entity_id: record.entity_id().to_string(),
        server: record.server().to_string(),
        name: record.name().to_string(),
        timestamp_sec: record.timestamp_sec(),
        values: record.raw().to_value_map(),
        name_folded,
        search_tokens,
        search_prefixes,
        level,
        class_name,
        guild_name,
        guild_name_folded,
        updated_at_sec,
    }
}

// ---------------------------------------------------------------------------
// derived stats

const BASE_ATTRIBUTES: [&str; 5] = [
    "Strength",
    "Dexterity",
    "Intelligence",
    "Constitution",
    "Luck",
];

/// Default derived-stats collaborator: sums the five base attributes and
/// groups by canonical class name.
pub struct AttributeSumDeriver;

impl StatsDeriver for AttributeSumDeriver {
    fn derive(&self, input: &StatsInput<'_>) -> DerivedStats {
        let sum = BASE_ATTRIBUTES
            .iter()
            .filter_map(|attribute| {
                let canon = canonical_key(attribute);
                input
                    .values
                    .iter()
                    .find(|(header, _)| canonical_key(header) == canon)
                    .and_then(|(_, cell)| numeric_cell_value(cell))
            })
            .sum();
        let group = input
            .class_name
            .map(canonical_key)
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| "unclassed".to_string());
        DerivedStats {
            sum,
            group,
            server_key: input.server.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ranking

/// Per-run accumulator of `(entity, metric)` pairs per `(date, scope)`.
/// Discarded at run end; nothing survives between runs.
#[derive(Debug, Default)]
pub struct RankAccumulator {
    scopes: BTreeMap<(String, RankScope), Vec<(String, i64)>>,
}

impl RankAccumulator {
    pub fn add(&mut self, date_key: &str, scope: RankScope, entity_id: &str, value: i64) {
        self.scopes
            .entry((date_key.to_string(), scope))
            .or_default()
            .push((entity_id.to_string(), value));
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn into_scopes(self) -> impl Iterator<Item = ((String, RankScope), Vec<(String, i64)>)> {
        self.scopes.into_iter()
    }
}

/// Sorts entries descending by value (stable, so ties keep encounter order)
/// and assigns dense 1-based ranks. The document replaces any prior snapshot
/// for the scope wholesale.
pub fn build_index_document(
    date_key: &str,
    scope: &RankScope,
    entries: &[(String, i64)],
    generated_at_sec: i64,
) -> IndexBucketDocument {
    let mut sorted: Vec<&(String, i64)> = entries.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));
    IndexBucketDocument {
        n: sorted.len(),
        ids: sorted.iter().map(|entry| entry.0.clone()).collect(),
        vals: sorted.iter().map(|entry| entry.1).collect(),
        ranks: (1..=sorted.len() as u32).collect(),
        group: scope.group.clone(),
        server_key: scope.server_key.clone(),
        metric: "sum".to_string(),
        date_key: date_key.to_string(),
        generated_at_sec,
    }
}

// ---------------------------------------------------------------------------
// configuration

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub store_dir: PathBuf,
    pub chunk_pause: Duration,
    pub limits: BatchLimits,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./scantrack_store"),
            chunk_pause: DEFAULT_CHUNK_PAUSE,
            limits: BatchLimits::default(),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_dir: std::env::var("SCANTRACK_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            chunk_pause: std::env::var("SCANTRACK_CHUNK_PAUSE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_pause),
            limits: BatchLimits {
                many_small: env_usize("SCANTRACK_CHUNK_SCANS", defaults.limits.many_small),
                few_large: env_usize("SCANTRACK_CHUNK_LATEST", defaults.limits.few_large),
                aggregated: env_usize("SCANTRACK_CHUNK_AGGREGATED", defaults.limits.aggregated),
            },
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// progress + report

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPass {
    Scans,
    Latest,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Prepare,
    Write,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub pass: ProgressPass,
    pub phase: ProgressPhase,
    pub current: usize,
    pub total: usize,
    pub created: usize,
    pub duplicate: usize,
    pub error: usize,
    pub kind: EntityKind,
}

pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

pub struct ImportRequest {
    pub kind: EntityKind,
    pub input: ImportInput,
    pub progress: Option<ProgressFn>,
}

impl ImportRequest {
    pub fn new(kind: EntityKind, input: ImportInput) -> Self {
        Self {
            kind,
            input,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImportCounts {
    pub rows_total: usize,
    pub rows_accepted: usize,
    pub missing_identifier: usize,
    pub bad_timestamp: usize,
    pub missing_server: usize,
    pub scans_created: usize,
    pub scans_duplicate: usize,
    pub scans_error: usize,
    pub latest_written: usize,
    pub latest_skipped: usize,
    pub history_buckets: usize,
    pub rank_indices: usize,
}

/// Summary of one import run. `results` carries the per-scan-key outcomes so
/// callers get uniform feedback regardless of the write strategy used.
#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub kind: EntityKind,
    pub counts: ImportCounts,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    pub results: Vec<WriteOutcome>,
}

// ---------------------------------------------------------------------------
// the pipeline

pub struct ImportPipeline {
    store: Arc<dyn DocumentStore>,
    deriver: Arc<dyn StatsDeriver>,
    policy: AggregationPolicy,
    config: ImportConfig,
}

impl ImportPipeline {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            deriver: Arc::new(AttributeSumDeriver),
            policy: AggregationPolicy::default(),
            config: ImportConfig::default(),
        }
    }

    pub fn with_deriver(mut self, deriver: Arc<dyn StatsDeriver>) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: ImportConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs one import end to end. Row-level problems are counted, write
    /// conflicts are classified as duplicates, and only guild write failures
    /// that are neither abort the run; partial progress stays durable.
    pub async fn run(&self, request: ImportRequest) -> Result<ImportReport> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let kind = request.kind;
        let progress = request.progress.clone();
        info!(%run_id, kind = %kind, "import run starting");

        let parsed = parse_input(kind, request.input).context("parsing import input")?;
        let headers = parsed.headers;
        let mut counts = ImportCounts {
            rows_total: parsed.stats.total_rows,
            rows_accepted: parsed.stats.accepted,
            missing_identifier: parsed.stats.missing_identifier,
            bad_timestamp: parsed.stats.bad_timestamp,
            missing_server: parsed.stats.missing_server,
            ..ImportCounts::default()
        };
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        // group by entity, first-encounter order, ascending timestamps
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<ParsedRecord>> = HashMap::new();
        for record in parsed.rows {
            let entity_id = record.entity_id().to_string();
            if !groups.contains_key(&entity_id) {
                order.push(entity_id.clone());
            }
            groups.entry(entity_id).or_default().push(record);
        }
        for records in groups.values_mut() {
            records.sort_by_key(|record| record.timestamp_sec());
        }

        let orchestrator = BatchOrchestrator::new(self.store.clone(), self.config.chunk_pause);

        // scan pass: create-only, one document per accepted row
        let mut scan_ops = Vec::new();
        for entity_id in &order {
            for record in &groups[entity_id] {
                let doc = serde_json::to_value(ScanDocument::from_record(record))
                    .context("serializing scan document")?;
                scan_ops.push(WriteOp::new(
                    kind.scan_collection(),
                    record.scan_key(),
                    doc,
                    WriteMode::Create,
                ));
            }
        }
        let scan_results = self
            .flush_pass(
                &orchestrator,
                scan_ops,
                self.config.limits.many_small,
                Some(ProgressPass::Scans),
                &progress,
                kind,
            )
            .await;
        for outcome in &scan_results {
            match outcome.status {
                WriteStatus::Created => counts.scans_created += 1,
                WriteStatus::Duplicate => counts.scans_duplicate += 1,
                WriteStatus::Error => {
                    counts.scans_error += 1;
                    errors.push(format!(
                        "scan {}: {}",
                        outcome.key,
                        outcome.message.as_deref().unwrap_or("unknown write failure")
                    ));
                }
            }
        }

        // latest pass: strict-greater guard against the stored timestamp
        let updated_at_sec = Utc::now().timestamp();
        let mut latest_ops = Vec::new();
        let mut rank_acc = RankAccumulator::default();
        for entity_id in &order {
            let records = &groups[entity_id];
            let Some(candidate) = records.last() else {
                continue;
            };
            let stored = self
                .store
                .get(kind.latest_collection(), entity_id)
                .await
                .with_context(|| format!("reading stored latest for {entity_id}"))?;
            let stored_ts = stored.as_ref().and_then(stored_latest_timestamp_sec);
            if !stored_ts.map_or(true, |ts| candidate.timestamp_sec() > ts) {
                counts.latest_skipped += 1;
                debug!(entity = %entity_id, "candidate not newer than stored latest; skipping");
                continue;
            }
            let doc = build_latest_document(candidate, updated_at_sec);
            latest_ops.push(WriteOp::new(
                kind.latest_collection(),
                entity_id.clone(),
                serde_json::to_value(&doc).context("serializing latest document")?,
                WriteMode::Set,
            ));
            if let ParsedRecord::Player(player) = candidate {
                let derived = self.deriver.derive(&StatsInput {
                    entity_id: &player.entity_id,
                    name: &player.name,
                    class_name: player.class_name.as_deref(),
                    level: player.level,
                    server: &player.server,
                    guild_identifier: player.guild_identifier.as_deref(),
                    guild_name: player.guild_name.as_deref(),
                    values: &player.raw,
                    timestamp_sec: player.timestamp_sec,
                    updated_at_sec,
                });
                let day = date_key(player.timestamp_sec);
                rank_acc.add(
                    &day,
                    RankScope::new(RankScope::ALL, RankScope::ALL),
                    entity_id,
                    derived.sum,
                );
                rank_acc.add(
                    &day,
                    RankScope::new(derived.group.clone(), RankScope::ALL),
                    entity_id,
                    derived.sum,
                );
                rank_acc.add(
                    &day,
                    RankScope::new(derived.group, derived.server_key),
                    entity_id,
                    derived.sum,
                );
            }
        }
        let latest_results = self
            .flush_pass(
                &orchestrator,
                latest_ops,
                self.config.limits.few_large,
                Some(ProgressPass::Latest),
                &progress,
                kind,
            )
            .await;
        counts.latest_written =
            absorb_write_outcomes("latest", kind, &latest_results, &mut errors, &mut warnings)?;

        // history pass: week and month buckets over the batch, merge-upserted
        let mut history_ops = Vec::new();
        for entity_id in &order {
            let records = &groups[entity_id];
            for period in [Period::Weekly, Period::Monthly] {
                let mut buckets: BTreeMap<String, Vec<&ParsedRecord>> = BTreeMap::new();
                for record in records {
                    buckets
                        .entry(period.id(record.timestamp_sec()))
                        .or_default()
                        .push(record);
                }
                for (period_id, bucket) in buckets {
                    let Some(newest) = bucket.last() else {
                        continue;
                    };
                    let (period_start_sec, period_end_sec) = period.bounds(newest.timestamp_sec());
                    let doc = HistoryBucketDocument {
                        entity_id: entity_id.clone(),
                        period_id: period_id.clone(),
                        period_start_sec,
                        period_end_sec,
                        last_timestamp_sec: newest.timestamp_sec(),
                        values: aggregate_values(&bucket, &headers, &self.policy),
                    };
                    history_ops.push(WriteOp::new(
                        period.collection(kind),
                        format!("{entity_id}{KEY_SEPARATOR}{period_id}"),
                        serde_json::to_value(&doc).context("serializing history bucket")?,
                        WriteMode::Merge,
                    ));
                }
            }
        }
        let history_results = self
            .flush_pass(
                &orchestrator,
                history_ops,
                self.config.limits.aggregated,
                Some(ProgressPass::History),
                &progress,
                kind,
            )
            .await;
        counts.history_buckets =
            absorb_write_outcomes("history", kind, &history_results, &mut errors, &mut warnings)?;

        // index pass: full replacement per touched (date, scope)
        let generated_at_sec = Utc::now().timestamp();
        let mut index_ops = Vec::new();
        for ((day, scope), entries) in rank_acc.into_scopes() {
            let doc = build_index_document(&day, &scope, &entries, generated_at_sec);
            index_ops.push(WriteOp::new(
                collections::RANK_INDEX,
                format!("{day}{KEY_SEPARATOR}{}", scope.id()),
                serde_json::to_value(&doc).context("serializing rank index")?,
                WriteMode::Set,
            ));
        }
        let index_results = self
            .flush_pass(
                &orchestrator,
                index_ops,
                self.config.limits.aggregated,
                None,
                &progress,
                kind,
            )
            .await;
        counts.rank_indices =
            absorb_write_outcomes("rank index", kind, &index_results, &mut errors, &mut warnings)?;

        let report = ImportReport {
            run_id,
            kind,
            counts,
            errors,
            warnings,
            duration_ms: started.elapsed().as_millis() as u64,
            results: scan_results,
        };
        info!(
            %run_id,
            kind = %kind,
            scans_created = report.counts.scans_created,
            scans_duplicate = report.counts.scans_duplicate,
            latest_written = report.counts.latest_written,
            history_buckets = report.counts.history_buckets,
            rank_indices = report.counts.rank_indices,
            duration_ms = report.duration_ms,
            "import run complete"
        );
        Ok(report)
    }

    async fn flush_pass(
        &self,
        orchestrator: &BatchOrchestrator,
        ops: Vec<WriteOp>,
        chunk_size: usize,
        pass: Option<ProgressPass>,
        progress: &Option<ProgressFn>,
        kind: EntityKind,
    ) -> Vec<WriteOutcome> {
        let callback = progress.clone();
        orchestrator
            .flush(ops, chunk_size, move |batch| {
                let (Some(pass), Some(callback)) = (pass, callback.as_ref()) else {
                    return;
                };
                callback(ProgressEvent {
                    pass,
                    phase: match batch.phase {
                        BatchPhase::Prepare => ProgressPhase::Prepare,
                        BatchPhase::Write => ProgressPhase::Write,
                        BatchPhase::Done => ProgressPhase::Done,
                    },
                    current: batch.current,
                    total: batch.total,
                    created: batch.created,
                    duplicate: batch.duplicate,
                    error: batch.error,
                    kind,
                });
            })
            .await
    }
}

/// Folds a pass's outcomes into the report. Conflict-shaped outcomes are a
/// benign skip; real failures abort the run for guilds and are reported per
/// item for players.
fn absorb_write_outcomes(
    pass: &str,
    kind: EntityKind,
    outcomes: &[WriteOutcome],
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> Result<usize> {
    let mut created = 0;
    for outcome in outcomes {
        match outcome.status {
            WriteStatus::Created => created += 1,
            WriteStatus::Duplicate => {
                warn!(pass, key = %outcome.key, "write hit an existing protected document; skipping");
                warnings.push(format!(
                    "{pass} write skipped for {}: existing or protected document",
                    outcome.key
                ));
            }
            WriteStatus::Error => {
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "unknown write failure".to_string());
                if kind == EntityKind::Guilds {
                    bail!("guild {pass} write failed for {}: {message}", outcome.key);
                }
                errors.push(format!("{pass} {}: {message}", outcome.key));
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scantrack_core::{GuildRecord, PlayerRecord, RawRow};
    use scantrack_storage::MemoryStore;
    use std::sync::Mutex;

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect()
    }

    fn guild_record(ts: i64, pairs: &[(&str, &str)]) -> ParsedRecord {
        ParsedRecord::Guild(GuildRecord {
            entity_id: "g1".into(),
            server: "EU1".into(),
            name: "Knights".into(),
            timestamp_sec: ts,
            raw: raw(pairs),
        })
    }

    fn test_config() -> ImportConfig {
        ImportConfig {
            chunk_pause: Duration::ZERO,
            ..ImportConfig::default()
        }
    }

    fn players_csv() -> String {
        [
            "ID,Name,Server,Timestamp,Class,Level,Strength,Dexterity,Intelligence,Constitution,Luck,Guild",
            "p1,Alice,eu1,1700000000,1,310,100,90,80,120,60,Knights",
            "p1,Alice,eu1,1700000600,1,311,105,90,80,120,60,Knights",
        ]
        .join("\n")
    }

    #[test]
    fn folding_strips_diacritics_and_lowercases() {
        assert_eq!(fold_name("Älvà Stárk"), "alva stark");
        assert_eq!(fold_name("ÜBER"), "uber");
    }

    #[test]
    fn tokens_require_two_chars_and_dedupe() {
        let tokens = search_tokens("x alva the alva");
        assert_eq!(tokens, vec!["alva", "the"]);
    }

    #[test]
    fn prefixes_cover_every_token_prefix() {
        let prefixes = search_prefixes(&["ab".to_string(), "ac".to_string()]);
        assert_eq!(prefixes, vec!["a", "ab", "ac"]);
    }

    #[test]
    fn policy_classifies_attributes_and_equipment_columns() {
        let policy = AggregationPolicy::default();
        assert!(policy.is_max_of("Strength"));
        assert!(policy.is_max_of("strength"));
        assert!(policy.is_max_of("Equipment Weapon"));
        assert!(policy.is_max_of("weapon_equipment_slot"));
        assert!(!policy.is_max_of("Name"));
        assert!(!policy.is_max_of("Guild"));
    }

    #[test]
    fn policy_loads_from_yaml() {
        let policy = AggregationPolicy::from_yaml_str(
            "max_of:\n  - Honor\n  - Fortress Level\nsubstrings:\n  - gear\n",
        )
        .expect("policy");
        assert!(policy.is_max_of("honor"));
        assert!(policy.is_max_of("Fortress_Level"));
        assert!(policy.is_max_of("Gear Slot 3"));
        assert!(!policy.is_max_of("Strength"));
    }

    #[test]
    fn period_ids_and_bounds_are_local_calendar_windows() {
        // Friday 2025-02-21 14:30 local
        let ts = Local
            .with_ymd_and_hms(2025, 2, 21, 14, 30, 0)
            .earliest()
            .expect("local ts")
            .timestamp();
        assert_eq!(week_id(ts), "2025-W08");
        assert_eq!(month_id(ts), "2025-02");
        assert_eq!(date_key(ts), "2025-02-21");

        let (week_start, week_end) = week_bounds(ts);
        let expected_start = Local
            .with_ymd_and_hms(2025, 2, 17, 0, 0, 0)
            .earliest()
            .expect("monday")
            .timestamp();
        let expected_end = Local
            .with_ymd_and_hms(2025, 2, 23, 23, 59, 59)
            .earliest()
            .expect("sunday")
            .timestamp();
        assert_eq!((week_start, week_end), (expected_start, expected_end));

        let (month_start, month_end) = month_bounds(ts);
        let expected_month_start = Local
            .with_ymd_and_hms(2025, 2, 1, 0, 0, 0)
            .earliest()
            .expect("first")
            .timestamp();
        let expected_month_end = Local
            .with_ymd_and_hms(2025, 2, 28, 23, 59, 59)
            .earliest()
            .expect("last")
            .timestamp();
        assert_eq!((month_start, month_end), (expected_month_start, expected_month_end));
    }

    #[test]
    fn max_of_aggregation_keeps_the_original_cell_of_the_numeric_max() {
        let records = vec![
            guild_record(100, &[("Strength", "12")]),
            guild_record(200, &[("Strength", "")]),
            guild_record(300, &[("Strength", "7")]),
            guild_record(400, &[("Strength", "19x")]),
        ];
        let refs: Vec<&ParsedRecord> = records.iter().collect();
        let values = aggregate_values(
            &refs,
            &["Strength".to_string()],
            &AggregationPolicy::default(),
        );
        assert_eq!(values.get("Strength").map(String::as_str), Some("19x"));
    }

    #[test]
    fn max_of_ties_keep_the_first_seen_cell() {
        let records = vec![
            guild_record(100, &[("Armor", "50a")]),
            guild_record(200, &[("Armor", "50b")]),
        ];
        let refs: Vec<&ParsedRecord> = records.iter().collect();
        let values =
            aggregate_values(&refs, &["Armor".to_string()], &AggregationPolicy::default());
        assert_eq!(values.get("Armor").map(String::as_str), Some("50a"));
    }

    #[test]
    fn last_value_aggregation_scans_backward_for_non_empty() {
        let records = vec![
            guild_record(100, &[("Guild", "A")]),
            guild_record(200, &[("Guild", "")]),
            guild_record(300, &[("Guild", "B")]),
            guild_record(400, &[("Guild", "")]),
        ];
        let refs: Vec<&ParsedRecord> = records.iter().collect();
        let values =
            aggregate_values(&refs, &["Guild".to_string()], &AggregationPolicy::default());
        assert_eq!(values.get("Guild").map(String::as_str), Some("B"));

        let empty = aggregate_values(
            &refs,
            &["Missing".to_string()],
            &AggregationPolicy::default(),
        );
        assert_eq!(empty.get("Missing").map(String::as_str), Some(""));
    }

    #[test]
    fn ranking_is_descending_stable_with_dense_ranks() {
        let entries = vec![
            ("p1".to_string(), 10),
            ("p2".to_string(), 30),
            ("p3".to_string(), 30),
            ("p4".to_string(), 5),
        ];
        let scope = RankScope::new("all", "all");
        let doc = build_index_document("2025-02-21", &scope, &entries, 0);
        assert_eq!(doc.n, 4);
        assert_eq!(doc.ids, vec!["p2", "p3", "p1", "p4"]);
        assert_eq!(doc.vals, vec![30, 30, 10, 5]);
        assert_eq!(doc.ranks, vec![1, 2, 3, 4]);
        assert_eq!(doc.metric, "sum");
    }

    #[test]
    fn stored_timestamp_prefers_raw_cell_then_coerces_numeric_fields() {
        let with_cell = serde_json::json!({
            "values": {"Time stamp": "ignored", "Timestamp": "1700000000"},
            "ts": 5,
        });
        assert_eq!(stored_latest_timestamp_sec(&with_cell), Some(1_700_000_000));

        let millis = serde_json::json!({"ts": 1_700_000_000_000i64});
        assert_eq!(stored_latest_timestamp_sec(&millis), Some(1_700_000_000));

        let seconds = serde_json::json!({"timestamp": 1_700_000_000i64});
        assert_eq!(stored_latest_timestamp_sec(&seconds), Some(1_700_000_000));

        let own_shape = serde_json::json!({"timestamp_sec": 1_700_000_000i64});
        assert_eq!(stored_latest_timestamp_sec(&own_shape), Some(1_700_000_000));

        assert_eq!(stored_latest_timestamp_sec(&serde_json::json!({})), None);
    }

    #[test]
    fn attribute_sum_deriver_sums_and_groups_by_class() {
        let values = raw(&[
            ("Strength", "100"),
            ("Dexterity", "90"),
            ("Intelligence", "80"),
            ("Constitution", "120"),
            ("Luck", "60"),
            ("Level", "310"),
        ]);
        let input = StatsInput {
            entity_id: "p1",
            name: "Alice",
            class_name: Some("Battle Mage"),
            level: Some(310),
            server: "EU1",
            guild_identifier: None,
            guild_name: None,
            values: &values,
            timestamp_sec: 1_700_000_000,
            updated_at_sec: 1_700_000_000,
        };
        let derived = AttributeSumDeriver.derive(&input);
        assert_eq!(derived.sum, 450);
        assert_eq!(derived.group, "battlemage");
        assert_eq!(derived.server_key, "EU1");
    }

    #[test]
    fn latest_document_carries_search_and_dropdown_fields() {
        let record = ParsedRecord::Player(PlayerRecord {
            entity_id: "p1".into(),
            server: "EU1".into(),
            name: "Älva Stark".into(),
            timestamp_sec: 1_700_000_000,
            guild_identifier: Some("g1".into()),
            guild_name: Some("Chevaliers Noirs".into()),
            level: Some(310),
            class_id: Some(2),
            class_name: Some("Mage".into()),
            raw: raw(&[("Name", "Älva Stark")]),
        });
        let doc = build_latest_document(&record, 42);
        assert_eq!(doc.name_folded, "alva stark");
        assert_eq!(doc.search_tokens, vec!["alva", "stark"]);
        assert!(doc.search_prefixes.contains(&"a".to_string()));
        assert!(doc.search_prefixes.contains(&"stark".to_string()));
        assert_eq!(doc.guild_name_folded.as_deref(), Some("chevaliers noirs"));
        assert_eq!(doc.updated_at_sec, 42);
    }

    #[tokio::test]
    async fn two_rows_produce_one_latest_two_scans_and_both_buckets() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store.clone()).with_config(test_config());
        let report = pipeline
            .run(ImportRequest::new(
                EntityKind::Players,
                ImportInput::RawText(players_csv()),
            ))
            .await
            .expect("run");

        assert_eq!(report.counts.rows_accepted, 2);
        assert_eq!(report.counts.scans_created, 2);
        assert_eq!(report.counts.latest_written, 1);
        assert_eq!(report.counts.history_buckets, 2);
        // global, per-class, per-class-per-server
        assert_eq!(report.counts.rank_indices, 3);
        assert!(report.errors.is_empty());

        let latest = store
            .get("player_latest", "p1")
            .await
            .expect("get")
            .expect("latest present");
        assert_eq!(latest["timestamp_sec"], 1_700_000_600);
        assert_eq!(latest["values"]["Level"], "311");

        assert_eq!(store.document_count("player_scans").await, 2);
        assert_eq!(store.document_count("player_history_weekly").await, 1);
        assert_eq!(store.document_count("player_history_monthly").await, 1);

        let weekly = store
            .get("player_history_weekly", &format!("p1__{}", week_id(1_700_000_600)))
            .await
            .expect("get")
            .expect("weekly bucket");
        // max-of field keeps the bucket max, last-value field the newest cell
        assert_eq!(weekly["values"]["Strength"], "105");
        assert_eq!(weekly["values"]["Level"], "311");
        assert_eq!(weekly["last_timestamp_sec"], 1_700_000_600);
    }

    #[tokio::test]
    async fn replaying_the_same_csv_reports_only_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store.clone()).with_config(test_config());
        let first = pipeline
            .run(ImportRequest::new(
                EntityKind::Players,
                ImportInput::RawText(players_csv()),
            ))
            .await
            .expect("first run");
        assert_eq!(first.counts.scans_created, 2);

        let second = pipeline
            .run(ImportRequest::new(
                EntityKind::Players,
                ImportInput::RawText(players_csv()),
            ))
            .await
            .expect("second run");
        assert_eq!(second.counts.scans_created, 0);
        assert_eq!(second.counts.scans_duplicate, 2);
        // candidate equals stored latest, strict guard skips it
        assert_eq!(second.counts.latest_written, 0);
        assert_eq!(second.counts.latest_skipped, 1);
        assert!(second
            .results
            .iter()
            .all(|r| r.status == WriteStatus::Duplicate));
    }

    #[tokio::test]
    async fn older_batches_leave_the_latest_untouched() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store.clone()).with_config(test_config());
        pipeline
            .run(ImportRequest::new(
                EntityKind::Players,
                ImportInput::RawText(players_csv()),
            ))
            .await
            .expect("newer run");

        let older = [
            "ID,Name,Server,Timestamp,Level",
            "p1,Alice,eu1,1699999000,309",
        ]
        .join("\n");
        let report = pipeline
            .run(ImportRequest::new(
                EntityKind::Players,
                ImportInput::RawText(older),
            ))
            .await
            .expect("older run");
        assert_eq!(report.counts.latest_written, 0);
        assert_eq!(report.counts.latest_skipped, 1);
        assert_eq!(report.counts.scans_created, 1);

        let latest = store
            .get("player_latest", "p1")
            .await
            .expect("get")
            .expect("latest present");
        assert_eq!(latest["timestamp_sec"], 1_700_000_600);
    }

    #[tokio::test]
    async fn guild_imports_build_latest_and_history_but_no_rankings() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store.clone()).with_config(test_config());
        let csv = [
            "Guild Identifier,Name,Server,Timestamp,Member Count",
            "g1,Knights,eu1,1700000000,38",
            "g2,Dragons,eu1,1700000000,50",
        ]
        .join("\n");
        let report = pipeline
            .run(ImportRequest::new(
                EntityKind::Guilds,
                ImportInput::RawText(csv),
            ))
            .await
            .expect("run");
        assert_eq!(report.counts.scans_created, 2);
        assert_eq!(report.counts.latest_written, 2);
        assert_eq!(report.counts.history_buckets, 4);
        assert_eq!(report.counts.rank_indices, 0);
        assert_eq!(store.document_count("rank_index").await, 0);
    }

    #[tokio::test]
    async fn progress_passes_fire_in_pipeline_order() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ImportPipeline::new(store).with_config(test_config());
        let seen: Arc<Mutex<Vec<(ProgressPass, ProgressPhase)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            sink.lock().expect("lock").push((event.pass, event.phase));
        });
        pipeline
            .run(
                ImportRequest::new(
                    EntityKind::Players,
                    ImportInput::RawText(players_csv()),
                )
                .with_progress(progress),
            )
            .await
            .expect("run");

        let events = seen.lock().expect("lock").clone();
        let passes: Vec<ProgressPass> = events
            .iter()
            .filter(|(_, phase)| *phase == ProgressPhase::Prepare)
            .map(|(pass, _)| *pass)
            .collect();
        assert_eq!(
            passes,
            vec![ProgressPass::Scans, ProgressPass::Latest, ProgressPass::History]
        );
        assert!(events.contains(&(ProgressPass::Scans, ProgressPhase::Done)));
        assert!(events.contains(&(ProgressPass::History, ProgressPhase::Done)));
    }

    #[tokio::test]
    async fn player_write_failures_are_reported_per_item() {
        let store = Arc::new(MemoryStore::new().with_write_failure("poison"));
        let pipeline = ImportPipeline::new(store).with_config(test_config());
        let csv = [
            "ID,Name,Server,Timestamp",
            "poison,Alice,eu1,1700000000",
            "p2,Bob,eu1,1700000000",
        ]
        .join("\n");
        let report = pipeline
            .run(ImportRequest::new(
                EntityKind::Players,
                ImportInput::RawText(csv),
            ))
            .await
            .expect("run completes despite item failures");
        assert_eq!(report.counts.scans_created, 1);
        assert_eq!(report.counts.scans_error, 1);
        assert!(report.errors.iter().any(|e| e.contains("poison")));
    }

    #[tokio::test]
    async fn guild_write_failures_abort_the_run() {
        let store = Arc::new(MemoryStore::new().with_write_failure("g1"));
        let pipeline = ImportPipeline::new(store).with_config(test_config());
        let csv = [
            "Guild Identifier,Name,Server,Timestamp",
            "g1,Knights,eu1,1700000000",
        ]
        .join("\n");
        let err = pipeline
            .run(ImportRequest::new(
                EntityKind::Guilds,
                ImportInput::RawText(csv),
            ))
            .await
            .expect_err("latest write failure should abort");
        assert!(err.to_string().contains("guild latest write failed"));
    }

    #[tokio::test]
    async fn protected_guild_latest_is_skipped_with_a_warning() {
        let store = Arc::new(MemoryStore::with_create_only(&["guild_latest"]));
        let pipeline = ImportPipeline::new(store.clone()).with_config(test_config());
        let csv = |ts: i64, members: u32| {
            [
                "Guild Identifier,Name,Server,Timestamp,Member Count".to_string(),
                format!("g1,Knights,eu1,{ts},{members}"),
            ]
            .join("\n")
        };

        let first = pipeline
            .run(ImportRequest::new(
                EntityKind::Guilds,
                ImportInput::RawText(csv(1_700_000_000, 38)),
            ))
            .await
            .expect("first run");
        assert_eq!(first.counts.latest_written, 1);

        // the newer batch passes the guard but the store refuses the overwrite
        let second = pipeline
            .run(ImportRequest::new(
                EntityKind::Guilds,
                ImportInput::RawText(csv(1_700_000_600, 39)),
            ))
            .await
            .expect("protected overwrite is swallowed, not fatal");
        assert_eq!(second.counts.scans_created, 1);
        assert_eq!(second.counts.latest_written, 0);
        assert!(second.errors.is_empty());
        assert!(second
            .warnings
            .iter()
            .any(|w| w.contains("latest") && w.contains("g1")));

        let latest = store
            .get("guild_latest", "g1")
            .await
            .expect("get")
            .expect("latest present");
        assert_eq!(latest["timestamp_sec"], 1_700_000_000);
    }
}
