//! Core domain model and match scoring for Binder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;

pub const CRATE_NAME: &str = "binder-core";

/// The two synchronization pipelines sharing the same executor/scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Pricing,
    Metadata,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pricing => "pricing",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pricing" => Some(Self::Pricing),
            "metadata" => Some(Self::Metadata),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    SucceededWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::SucceededWithErrors => "succeeded_with_errors",
            Self::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "succeeded_with_errors" => Some(Self::SucceededWithErrors),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "scheduled" => Some(Self::Scheduled),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Live progress of one job, pushed to subscribers and served over JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressView {
    pub job_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub items_total: u64,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
}

/// One finished or running job execution, as shown in job history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecordView {
    pub id: i64,
    pub kind: JobKind,
    pub trigger_kind: TriggerKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub items_total: u64,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
}

/// Identifying fields of an inventory card, read by the sync engine.
/// The CRUD layer owns these; the engine never writes them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentity {
    pub id: i64,
    pub name: String,
    pub set_id: Option<String>,
    pub set_name: Option<String>,
    pub number: Option<String>,
    pub rarity: Option<String>,
    pub category: Option<String>,
}

/// A single parsed result from an external search response. Every field the
/// parser could not extract stays `None`; the scorer works over whatever is
/// present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub name: Option<String>,
    pub set_name: Option<String>,
    pub number: Option<String>,
    pub variant: Option<String>,
    pub external_id: Option<String>,
    pub detail_url: Option<String>,
    pub image_url: Option<String>,
    pub ungraded_cents: Option<i64>,
}

impl CandidateRecord {
    /// How many optional fields carry a value. Used as the tiebreak between
    /// equally scored candidates.
    pub fn populated_fields(&self) -> usize {
        [
            self.name.is_some(),
            self.set_name.is_some(),
            self.number.is_some(),
            self.variant.is_some(),
            self.external_id.is_some(),
            self.detail_url.is_some(),
            self.image_url.is_some(),
            self.ungraded_cents.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

/// Grade-keyed prices in cents, as scraped from the pricing source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceData {
    pub ungraded_cents: Option<i64>,
    pub psa9_cents: Option<i64>,
    pub psa10_cents: Option<i64>,
    pub bgs10_cents: Option<i64>,
}

impl PriceData {
    pub fn is_empty(&self) -> bool {
        self.ungraded_cents.is_none()
            && self.psa9_cents.is_none()
            && self.psa10_cents.is_none()
            && self.bgs10_cents.is_none()
    }
}

/// Normalized card metadata from the metadata source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardDetails {
    pub external_id: String,
    pub name: Option<String>,
    pub set_id: Option<String>,
    pub set_name: Option<String>,
    pub number: Option<String>,
    pub supertype: Option<String>,
    pub rarity: Option<String>,
    pub hp: Option<i64>,
    pub retreat_cost: Option<i64>,
    pub types: Vec<String>,
    pub artist: Option<String>,
    pub flavor_text: Option<String>,
    pub evolves_from: Option<String>,
    pub image_url: Option<String>,
    pub attacks: Option<JsonValue>,
    pub weaknesses: Option<JsonValue>,
    pub resistances: Option<JsonValue>,
    pub legalities: Option<JsonValue>,
}

/// The final, chosen, full-detail record for one card from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub source: String,
    pub external_id: String,
    pub detail_url: Option<String>,
    pub prices: Option<PriceData>,
    pub details: Option<CardDetails>,
    pub fetched_at: DateTime<Utc>,
}

/// Outcome of resolving one card against one source. `Unavailable` means the
/// source itself looks down, which callers treat differently from a miss.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedRecord),
    NotFound,
    Unavailable,
}

/// What we know about the card we are trying to match externally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchQuery {
    pub name: String,
    pub set_name: Option<String>,
    pub number: Option<String>,
    pub variant: Option<String>,
}

impl MatchQuery {
    pub fn from_identity(card: &CardIdentity) -> Self {
        Self {
            name: card.name.clone(),
            set_name: card.set_name.clone(),
            number: card.number.clone(),
            variant: card.rarity.clone(),
        }
    }
}

/// Lowercase and strip everything non-alphanumeric.
pub fn normalize(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Comparison key for a card number. Printed numbers come in shapes like
/// "57/111", "#GG44" or "057"; the key is the part before the slash with
/// leading zeros dropped, so "4/102", "#4" and "004" all compare equal.
pub fn number_key(input: &str) -> String {
    let head = input.split('/').next().unwrap_or(input);
    let normalized = normalize(head);
    if normalized.chars().all(|c| c.is_ascii_digit()) {
        let trimmed = normalized.trim_start_matches('0');
        if trimmed.is_empty() {
            return "0".to_string();
        }
        return trimmed.to_string();
    }
    normalized
}

const EXACT_NAME_SCORE: f64 = 100.0;
const PARTIAL_NAME_SCORE: f64 = 50.0;
const FUZZY_NAME_WEIGHT: f64 = 40.0;
const EXACT_SET_BONUS: f64 = 30.0;
const PARTIAL_SET_BONUS: f64 = 15.0;
const VARIANT_BONUS: f64 = 10.0;
const MIN_NAME_SCORE: f64 = 30.0;
const MIN_TOTAL_SCORE: f64 = 50.0;

/// Score one candidate against the query. `None` disqualifies the candidate:
/// it has no name, its name is too far off, or it carries a card number that
/// contradicts the query's. A number absent on either side skips that
/// criterion entirely instead of counting against the candidate.
fn score_candidate(query: &MatchQuery, candidate: &CandidateRecord) -> Option<f64> {
    let candidate_name = candidate.name.as_deref()?;
    let query_name = normalize(&query.name);
    let cand_name = normalize(candidate_name);
    if query_name.is_empty() || cand_name.is_empty() {
        return None;
    }

    if let (Some(query_number), Some(cand_number)) =
        (query.number.as_deref(), candidate.number.as_deref())
    {
        if number_key(query_number) != number_key(cand_number) {
            return None;
        }
    }

    let name_score = if cand_name == query_name {
        EXACT_NAME_SCORE
    } else if cand_name.contains(&query_name) || query_name.contains(&cand_name) {
        PARTIAL_NAME_SCORE
    } else {
        jaro_winkler(&query_name, &cand_name) * FUZZY_NAME_WEIGHT
    };
    if name_score < MIN_NAME_SCORE {
        return None;
    }

    let mut score = name_score;

    if let (Some(query_set), Some(cand_set)) =
        (query.set_name.as_deref(), candidate.set_name.as_deref())
    {
        let qs = normalize(query_set);
        let cs = normalize(cand_set);
        if !qs.is_empty() && !cs.is_empty() {
            if qs == cs {
                score += EXACT_SET_BONUS;
            } else if qs.contains(&cs) || cs.contains(&qs) {
                score += PARTIAL_SET_BONUS;
            }
        }
    }

    if let (Some(query_variant), Some(cand_variant)) =
        (query.variant.as_deref(), candidate.variant.as_deref())
    {
        if variant_tokens_overlap(query_variant, cand_variant) {
            score += VARIANT_BONUS;
        }
    }

    Some(score)
}

fn variant_tokens_overlap(a: &str, b: &str) -> bool {
    let tokens_b: Vec<String> = b
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .collect();
    a.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
        .any(|t| tokens_b.contains(&t))
}

/// Select the best-scoring candidate above the confidence threshold, or
/// `None` when nothing clears it. Deterministic over its inputs: ties on
/// score fall to the candidate with more populated fields, then to the
/// earliest in the list.
pub fn select_best_match<'a>(
    query: &MatchQuery,
    candidates: &'a [CandidateRecord],
) -> Option<&'a CandidateRecord> {
    let mut best: Option<(f64, usize, &CandidateRecord)> = None;
    for candidate in candidates {
        let Some(score) = score_candidate(query, candidate) else {
            continue;
        };
        if score < MIN_TOTAL_SCORE {
            continue;
        }
        let richness = candidate.populated_fields();
        let better = match &best {
            None => true,
            Some((best_score, best_richness, _)) => {
                score > *best_score || (score == *best_score && richness > *best_richness)
            }
        };
        if better {
            best = Some((score, richness, candidate));
        }
    }
    best.map(|(_, _, candidate)| candidate)
}
