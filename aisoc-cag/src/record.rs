//! Record normalization: raw SIEM events into bounded knowledge units
//!
//! A raw event is an arbitrary JSON object. Both the flat archive layout
//! (`rule_level`, `rule_description`, `agent_name`, ...) and the nested alert
//! layout (`rule.level`, `rule.description`, `agent.name`, ...) are accepted.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::{CagError, Result};

/// Highest rule level a SIEM event can carry
pub const MAX_SEVERITY: u8 = 15;

/// Description budget inside a knowledge unit
pub const MAX_DESCRIPTION_CHARS: usize = 300;

/// Default raw log budget inside a knowledge unit
pub const DEFAULT_MAX_RAW_CHARS: usize = 1000;

/// Default budget for the whole rendered unit
pub const DEFAULT_MAX_UNIT_CHARS: usize = 1000;

/// A raw event as delivered by the SIEM query layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent {
    fields: Map<String, Value>,
}

impl RawEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a top-level field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a field; dotted paths walk nested objects when no flat key matches
    pub fn get(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(path) {
            return Some(value);
        }

        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// First non-blank textual value among `paths`
    fn text(&self, paths: &[&str]) -> Option<String> {
        paths.iter().find_map(|path| match self.get(path)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Array(items) => {
                let joined = items
                    .iter()
                    .filter_map(|v| match v {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                (!joined.is_empty()).then_some(joined)
            }
            _ => None,
        })
    }

    /// First integer value among `paths` (numbers or numeric strings)
    fn integer(&self, paths: &[&str]) -> Option<i64> {
        paths.iter().find_map(|path| match self.get(path)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

impl From<Map<String, Value>> for RawEvent {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

/// Priority tier derived from the rule level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatPriority {
    pub fn from_level(level: u8) -> Self {
        match level {
            10.. => Self::Critical,
            7..=9 => Self::High,
            4..=6 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Lowest rule level that still maps to this tier
    pub fn min_level(&self) -> u8 {
        match self {
            Self::Critical => 10,
            Self::High => 7,
            Self::Medium => 4,
            Self::Low => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl fmt::Display for ThreatPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatPriority {
    type Err = CagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(CagError::ConfigError(format!("unknown priority tier: {other}"))),
        }
    }
}

/// Threat families recognised in raw log text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatIndicator {
    PotentialSecurityEvent,
    AuthenticationEvent,
    PotentialDataExfiltration,
    MalwareDetection,
    BruteForceAttack,
    WebAttack,
}

impl ThreatIndicator {
    pub const ALL: [ThreatIndicator; 6] = [
        Self::PotentialSecurityEvent,
        Self::AuthenticationEvent,
        Self::PotentialDataExfiltration,
        Self::MalwareDetection,
        Self::BruteForceAttack,
        Self::WebAttack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PotentialSecurityEvent => "POTENTIAL_SECURITY_EVENT",
            Self::AuthenticationEvent => "AUTHENTICATION_EVENT",
            Self::PotentialDataExfiltration => "POTENTIAL_DATA_EXFILTRATION",
            Self::MalwareDetection => "MALWARE_DETECTION",
            Self::BruteForceAttack => "BRUTE_FORCE_ATTACK",
            Self::WebAttack => "WEB_ATTACK",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::PotentialSecurityEvent => &["failed", "denied", "blocked", "unauthorized"],
            Self::AuthenticationEvent => &["ssh", "login", "authentication"],
            Self::PotentialDataExfiltration => &["powershell", "invoke-webrequest", "wget", "curl"],
            Self::MalwareDetection => &["malware", "virus", "trojan", "backdoor"],
            Self::BruteForceAttack => &["brute", "force", "multiple", "repeated"],
            Self::WebAttack => &["xss", "sql injection", "modsecurity", "libinjection"],
        }
    }

    /// Indicators whose keywords appear in already lower-cased text
    pub fn detect(haystack: &str) -> Vec<ThreatIndicator> {
        Self::ALL
            .into_iter()
            .filter(|indicator| indicator.keywords().iter().any(|kw| haystack.contains(kw)))
            .collect()
    }
}

impl fmt::Display for ThreatIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized, length-bounded security record
///
/// Fields are read-only once the normalizer has produced the unit, so the
/// rendered `text` always agrees with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeUnit {
    source_id: String,
    timestamp: DateTime<Utc>,
    severity_level: u8,
    agent_name: String,
    description: String,
    raw_text: String,
    rule_id: Option<String>,
    rule_groups: Option<String>,
    indicators: Vec<ThreatIndicator>,
    text: String,
}

impl KnowledgeUnit {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn severity_level(&self) -> u8 {
        self.severity_level
    }

    pub fn priority(&self) -> ThreatPriority {
        ThreatPriority::from_level(self.severity_level)
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn rule_id(&self) -> Option<&str> {
        self.rule_id.as_deref()
    }

    pub fn rule_groups(&self) -> Option<&str> {
        self.rule_groups.as_deref()
    }

    pub fn indicators(&self) -> &[ThreatIndicator] {
        &self.indicators
    }

    /// The stable single-line rendering that enters the prefix document
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Outcome of normalizing a batch of raw events
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub units: Vec<KnowledgeUnit>,
    pub rejected: usize,
}

/// Converts raw events into knowledge units
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    max_raw_chars: usize,
    max_unit_chars: usize,
}

impl Default for RecordNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RAW_CHARS, DEFAULT_MAX_UNIT_CHARS)
    }
}

impl RecordNormalizer {
    pub fn new(max_raw_chars: usize, max_unit_chars: usize) -> Self {
        Self {
            max_raw_chars,
            max_unit_chars: max_unit_chars.max(64),
        }
    }

    /// Normalize a single event
    pub fn normalize(&self, event: &RawEvent) -> Result<KnowledgeUnit> {
        let raw_timestamp = event
            .text(&["timestamp", "@timestamp"])
            .ok_or(CagError::MalformedRecord {
                field: "timestamp",
                reason: "is missing".to_string(),
            })?;
        let timestamp = parse_timestamp(&raw_timestamp).ok_or_else(|| CagError::MalformedRecord {
            field: "timestamp",
            reason: format!("cannot be parsed: {raw_timestamp:?}"),
        })?;

        let description = event
            .text(&["rule_description", "description", "rule.description"])
            .ok_or(CagError::MalformedRecord {
                field: "description",
                reason: "is missing".to_string(),
            })?;

        let agent_name = single_line(event, &["agent_name", "agent.name"])
            .unwrap_or_else(|| "unknown".to_string());
        let severity_level = event
            .integer(&["rule_level", "rule.level", "level"])
            .unwrap_or(0)
            .clamp(0, MAX_SEVERITY as i64) as u8;
        let rule_id = single_line(event, &["rule_id", "rule.id"]);
        let rule_groups = single_line(event, &["rule_groups", "rule.groups"]);
        let full_log = event.text(&["full_log"]).unwrap_or_default();

        let source_id = single_line(event, &["id", "_id"])
            .unwrap_or_else(|| derive_source_id(&timestamp, &agent_name, &description));

        let description = truncate_chars(&collapse_whitespace(&description), MAX_DESCRIPTION_CHARS);
        let raw_text = truncate_chars(&collapse_whitespace(&full_log), self.max_raw_chars);

        let haystack = format!(
            "{} {} {}",
            description,
            raw_text,
            rule_groups.as_deref().unwrap_or("")
        )
        .to_lowercase();
        let indicators = ThreatIndicator::detect(&haystack);

        let mut unit = KnowledgeUnit {
            source_id,
            timestamp,
            severity_level,
            agent_name,
            description,
            raw_text,
            rule_id,
            rule_groups,
            indicators,
            text: String::new(),
        };
        unit.text = truncate_chars(&render(&unit), self.max_unit_chars);
        Ok(unit)
    }

    /// Normalize many events, dropping the malformed ones
    pub fn normalize_batch(&self, events: &[RawEvent]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();

        for (index, event) in events.iter().enumerate() {
            match self.normalize(event) {
                Ok(unit) => batch.units.push(unit),
                Err(e) => {
                    warn!("Dropping record #{}: {}", index, e);
                    batch.rejected += 1;
                }
            }
        }

        debug!(
            "Normalized {} records ({} rejected)",
            batch.units.len(),
            batch.rejected
        );
        batch
    }
}

fn render(unit: &KnowledgeUnit) -> String {
    let mut text = format!(
        "[{} L{}] {} | id={} | agent={} | rule={} | {}",
        unit.priority(),
        unit.severity_level,
        unit.timestamp.format("%Y-%m-%d %H:%M:%S"),
        unit.source_id,
        unit.agent_name,
        unit.rule_id.as_deref().unwrap_or("-"),
        unit.description,
    );
    if let Some(groups) = &unit.rule_groups {
        text.push_str(&format!(" | groups: {groups}"));
    }
    if !unit.raw_text.is_empty() {
        text.push_str(&format!(" | log: {}", unit.raw_text));
    }
    if !unit.indicators.is_empty() {
        let labels: Vec<&str> = unit.indicators.iter().map(|i| i.as_str()).collect();
        text.push_str(&format!(" | indicators: {}", labels.join(", ")));
    }
    text
}

fn derive_source_id(timestamp: &DateTime<Utc>, agent: &str, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update([0x1f]);
    hasher.update(agent.as_bytes());
    hasher.update([0x1f]);
    hasher.update(description.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Parse the timestamp layouts seen in SIEM exports
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Wazuh alerts: 2024-05-01T10:00:00.123+0000
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Truncate on a char boundary, marking the cut with `...`
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Text field flattened onto one line
fn single_line(event: &RawEvent, paths: &[&str]) -> Option<String> {
    event
        .text(paths)
        .map(|value| collapse_whitespace(&value))
        .filter(|value| !value.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(level: i64, description: &str) -> RawEvent {
        RawEvent::new()
            .with("id", "evt-1")
            .with("timestamp", "2024-05-01T10:00:00Z")
            .with("agent_name", "web-01")
            .with("rule_level", level)
            .with("rule_description", description)
    }

    #[test]
    fn test_normalize_flat_record() {
        let normalizer = RecordNormalizer::default();
        let unit = normalizer
            .normalize(&event(7, "sshd: authentication failed").with("full_log", "Failed password for root"))
            .unwrap();

        assert_eq!(unit.source_id(), "evt-1");
        assert_eq!(unit.severity_level(), 7);
        assert_eq!(unit.priority(), ThreatPriority::High);
        assert_eq!(unit.agent_name(), "web-01");
        assert!(unit.text().starts_with("[HIGH L7] 2024-05-01 10:00:00"));
        assert!(unit.text().contains("log: Failed password for root"));
        assert!(unit.indicators().contains(&ThreatIndicator::AuthenticationEvent));
        assert!(unit.indicators().contains(&ThreatIndicator::PotentialSecurityEvent));
    }

    #[test]
    fn test_normalize_nested_alert() {
        let raw: RawEvent = serde_json::from_value(json!({
            "timestamp": "2024-05-01T10:00:00.123+0000",
            "agent": { "name": "db-02", "id": "004" },
            "rule": { "level": "12", "description": "SQL injection attempt", "id": 31103, "groups": ["web", "attack"] },
            "full_log": "GET /?id=1' OR '1'='1"
        }))
        .unwrap();

        let unit = RecordNormalizer::default().normalize(&raw).unwrap();
        assert_eq!(unit.agent_name(), "db-02");
        assert_eq!(unit.severity_level(), 12);
        assert_eq!(unit.rule_id(), Some("31103"));
        assert_eq!(unit.rule_groups(), Some("web,attack"));
        assert_eq!(unit.priority(), ThreatPriority::Critical);
        assert!(unit.indicators().contains(&ThreatIndicator::WebAttack));
        // no id field: derived from content
        assert_eq!(unit.source_id().len(), 16);
    }

    #[test]
    fn test_missing_required_fields() {
        let normalizer = RecordNormalizer::default();

        let no_ts = RawEvent::new().with("rule_description", "x");
        assert!(matches!(
            normalizer.normalize(&no_ts),
            Err(CagError::MalformedRecord { field: "timestamp", .. })
        ));

        let bad_ts = RawEvent::new()
            .with("timestamp", "yesterday")
            .with("rule_description", "x");
        assert!(matches!(
            normalizer.normalize(&bad_ts),
            Err(CagError::MalformedRecord { field: "timestamp", .. })
        ));

        let blank_desc = RawEvent::new()
            .with("timestamp", "2024-05-01 10:00:00")
            .with("rule_description", "   ");
        assert!(matches!(
            normalizer.normalize(&blank_desc),
            Err(CagError::MalformedRecord { field: "description", .. })
        ));
    }

    #[test]
    fn test_defaults_and_clamping() {
        let raw = RawEvent::new()
            .with("timestamp", "2024-05-01 10:00:00")
            .with("description", "odd level")
            .with("rule_level", 99);
        let unit = RecordNormalizer::default().normalize(&raw).unwrap();
        assert_eq!(unit.severity_level(), MAX_SEVERITY);
        assert_eq!(unit.agent_name(), "unknown");
    }

    #[test]
    fn test_unit_text_is_bounded() {
        let normalizer = RecordNormalizer::new(1000, 200);
        let long_log = "A".repeat(5000);
        let unit = normalizer
            .normalize(&event(3, "noisy").with("full_log", long_log))
            .unwrap();
        assert_eq!(unit.text().chars().count(), 200);
        assert!(unit.text().ends_with("..."));
        assert!(unit.raw_text().chars().count() <= 1000);
    }

    #[test]
    fn test_derived_source_id_is_stable() {
        let raw = RawEvent::new()
            .with("timestamp", "2024-05-01 10:00:00")
            .with("description", "same");
        let normalizer = RecordNormalizer::default();
        let a = normalizer.normalize(&raw).unwrap();
        let b = normalizer.normalize(&raw).unwrap();
        assert_eq!(a.source_id(), b.source_id());
    }

    #[test]
    fn test_normalize_batch_drops_bad_records() {
        let events = vec![
            event(5, "ok"),
            RawEvent::new().with("rule_description", "no timestamp"),
            event(9, "also ok").with("id", "evt-2"),
        ];
        let batch = RecordNormalizer::default().normalize_batch(&events);
        assert_eq!(batch.units.len(), 2);
        assert_eq!(batch.rejected, 1);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        let text = "ééééé";
        assert_eq!(truncate_chars(text, 10), text);
        assert_eq!(truncate_chars(text, 4), "é...");
    }

    #[test]
    fn test_priority_tiers() {
        assert_eq!(ThreatPriority::from_level(15), ThreatPriority::Critical);
        assert_eq!(ThreatPriority::from_level(9), ThreatPriority::High);
        assert_eq!(ThreatPriority::from_level(4), ThreatPriority::Medium);
        assert_eq!(ThreatPriority::from_level(3), ThreatPriority::Low);
        assert!(ThreatPriority::Critical > ThreatPriority::High);
        assert_eq!(ThreatPriority::High.min_level(), 7);
        assert_eq!("Critical".parse::<ThreatPriority>().unwrap(), ThreatPriority::Critical);
        assert!("severe".parse::<ThreatPriority>().is_err());
    }

    #[test]
    fn test_multiline_fields_stay_on_one_line() {
        let raw = event(8, "sshd: brute force\nattempt")
            .with("agent_name", "web-01\n[CRITICAL L15] forged line")
            .with("rule_id", "5712\n")
            .with("rule_groups", "sshd,\n  authentication_failures");
        let unit = RecordNormalizer::default().normalize(&raw).unwrap();

        assert!(!unit.text().contains('\n'));
        assert_eq!(unit.agent_name(), "web-01 [CRITICAL L15] forged line");
        assert_eq!(unit.rule_id(), Some("5712"));
        assert_eq!(unit.rule_groups(), Some("sshd, authentication_failures"));
        assert!(unit.text().starts_with("[HIGH L8]"));
    }
}
