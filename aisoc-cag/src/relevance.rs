//! Keyword, severity and recency ranking of knowledge units
//!
//! Used at build time to decide which units enter the prefix document, and at
//! query time to trace which cached units a question touches. A heuristic,
//! not a search engine.

use serde::Serialize;
use std::cmp::Ordering;

use crate::record::KnowledgeUnit;

const DESCRIPTION_WEIGHT: u32 = 5;
const CONTEXT_WEIGHT: u32 = 3;
const RAW_WEIGHT: u32 = 2;
const SEVERITY_INTENT_BONUS: u32 = 4;

const STOP_WORDS: &[&str] = &[
    "a", "about", "all", "an", "and", "any", "are", "as", "at", "be", "by", "can", "do", "does",
    "for", "from", "give", "happened", "has", "have", "how", "i", "in", "is", "it", "list", "me",
    "my", "of", "on", "or", "please", "recent", "show", "tell", "that", "the", "there", "this",
    "to", "us", "was", "were", "what", "when", "which", "who", "why", "with", "yang", "apa",
    "ada", "dan", "di", "ke",
];

/// Words that ask for the most severe events rather than naming a topic
const HIGH_SEVERITY_WORDS: &[&str] = &[
    "critical", "severe", "urgent", "serious", "dangerous", "high", "highest", "kritis",
    "berbahaya",
];
const MEDIUM_SEVERITY_WORDS: &[&str] = &["medium", "moderate", "warning", "warnings"];

/// Threat-hunting expansions: trigger words and the vocabulary they pull in
const EXPANSIONS: &[(&[&str], &[&str])] = &[
    (
        &["xss", "cross-site", "script", "scripting"],
        &["xss", "cross-site", "scripting", "libinjection", "modsecurity", "security2"],
    ),
    (
        &["brute", "force", "login", "failed", "authentication", "ssh", "autentikasi"],
        &["authentication", "failed", "login", "brute", "force", "ssh"],
    ),
    (
        &["exfiltration", "exfil", "transfer", "download", "eksfiltrasi"],
        &["exfiltration", "powershell", "invoke-webrequest", "transfer"],
    ),
    (
        &["malware", "virus", "suspicious", "trojan", "backdoor", "mencurigakan"],
        &["malware", "virus", "trojan", "backdoor", "suspicious"],
    ),
    (
        &["network", "connection", "port", "scanning", "scan", "jaringan", "koneksi"],
        &["network", "connection", "port", "scanning", "traffic"],
    ),
    (
        &["sql", "injection", "sqli", "database"],
        &["sql", "injection", "database"],
    ),
];

/// Parsed question: distinct lower-case terms plus any severity intent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryTerms {
    terms: Vec<String>,
    severity_floor: Option<u8>,
}

impl QueryTerms {
    pub fn parse(question: &str) -> Self {
        let lowered = question.to_lowercase();
        let mut terms: Vec<String> = Vec::new();
        let mut severity_floor: Option<u8> = None;

        let words = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .map(|w| w.trim_matches('-'))
            .filter(|w| w.chars().count() >= 2 && !STOP_WORDS.contains(w));

        for word in words {
            if HIGH_SEVERITY_WORDS.contains(&word) {
                severity_floor = Some(severity_floor.map_or(7, |f| f.max(7)));
            } else if MEDIUM_SEVERITY_WORDS.contains(&word) {
                severity_floor = Some(severity_floor.unwrap_or(4));
            }
            push_distinct(&mut terms, word);
        }

        let originals = terms.clone();
        for (triggers, vocabulary) in EXPANSIONS {
            if originals.iter().any(|t| triggers.contains(&t.as_str())) {
                for word in vocabulary.iter() {
                    push_distinct(&mut terms, word);
                }
            }
        }

        Self {
            terms,
            severity_floor,
        }
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Minimum severity the question asks for, if it asks at all
    pub fn severity_floor(&self) -> Option<u8> {
        self.severity_floor
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.severity_floor.is_none()
    }

    /// Field-weighted score of a unit against these terms
    pub fn score_unit(&self, unit: &KnowledgeUnit) -> u32 {
        let description = unit.description().to_lowercase();
        let context = format!(
            "{} {}",
            unit.agent_name(),
            unit.rule_groups().unwrap_or_default()
        )
        .to_lowercase();
        let indicators: Vec<&str> = unit.indicators().iter().map(|i| i.as_str()).collect();
        let raw = format!("{} {}", unit.raw_text(), indicators.join(" ")).to_lowercase();

        let mut score = 0;
        for term in &self.terms {
            if description.contains(term.as_str()) {
                score += DESCRIPTION_WEIGHT;
            }
            if context.contains(term.as_str()) {
                score += CONTEXT_WEIGHT;
            }
            if raw.contains(term.as_str()) {
                score += RAW_WEIGHT;
            }
        }
        score + self.severity_bonus(unit.severity_level())
    }

    /// Score of a flat line of text, for callers that only see rendered units
    pub fn score_line(&self, line: &str, severity: u8) -> u32 {
        let line = line.to_lowercase();
        let hits = self
            .terms
            .iter()
            .filter(|term| line.contains(term.as_str()))
            .count() as u32;
        hits * DESCRIPTION_WEIGHT + self.severity_bonus(severity)
    }

    fn severity_bonus(&self, severity: u8) -> u32 {
        match self.severity_floor {
            Some(floor) if severity >= floor => SEVERITY_INTENT_BONUS,
            _ => 0,
        }
    }
}

fn push_distinct(terms: &mut Vec<String>, word: &str) {
    if !terms.iter().any(|t| t == word) {
        terms.push(word.to_string());
    }
}

/// A unit together with the score it was ranked by
#[derive(Debug, Clone, Serialize)]
pub struct RankedUnit {
    pub unit: KnowledgeUnit,
    pub score: u32,
}

/// Score every unit and return the best `top_n`
///
/// Without a question the score is the severity level. Ties fall back to the
/// newest timestamp, then to the smallest `source_id`.
pub fn rank(units: &[KnowledgeUnit], question: Option<&str>, top_n: usize) -> Vec<RankedUnit> {
    let terms = question.map(QueryTerms::parse);

    let mut ranked: Vec<RankedUnit> = units
        .iter()
        .map(|unit| RankedUnit {
            score: match &terms {
                Some(terms) => terms.score_unit(unit),
                None => unit.severity_level() as u32,
            },
            unit: unit.clone(),
        })
        .collect();

    ranked.sort_by(compare_ranked);
    ranked.truncate(top_n);
    ranked
}

/// Units the question actually touches (score above zero), best first
pub fn matching(units: &[KnowledgeUnit], question: &str) -> Vec<RankedUnit> {
    let terms = QueryTerms::parse(question);
    if terms.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<RankedUnit> = units
        .iter()
        .filter_map(|unit| {
            let score = terms.score_unit(unit);
            (score > 0).then(|| RankedUnit {
                unit: unit.clone(),
                score,
            })
        })
        .collect();

    ranked.sort_by(compare_ranked);
    ranked
}

fn compare_ranked(a: &RankedUnit, b: &RankedUnit) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.unit.timestamp().cmp(&a.unit.timestamp()))
        .then_with(|| a.unit.source_id().cmp(b.unit.source_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RawEvent, RecordNormalizer};

    fn unit(id: &str, ts: &str, level: i64, description: &str, log: &str) -> KnowledgeUnit {
        RecordNormalizer::default()
            .normalize(
                &RawEvent::new()
                    .with("id", id)
                    .with("timestamp", ts)
                    .with("agent_name", "web-01")
                    .with("rule_level", level)
                    .with("rule_description", description)
                    .with("full_log", log),
            )
            .unwrap()
    }

    #[test]
    fn test_parse_drops_stop_words_and_expands() {
        let terms = QueryTerms::parse("Show me all SSH login attempts!");
        assert!(terms.terms().contains(&"ssh".to_string()));
        assert!(terms.terms().contains(&"brute".to_string()));
        assert!(!terms.terms().contains(&"show".to_string()));
        assert!(!terms.terms().contains(&"me".to_string()));
        assert_eq!(terms.severity_floor(), None);
    }

    #[test]
    fn test_parse_severity_intent() {
        assert_eq!(QueryTerms::parse("show critical issues").severity_floor(), Some(7));
        assert_eq!(QueryTerms::parse("any medium alerts").severity_floor(), Some(4));
        assert!(QueryTerms::parse("the a of").is_empty());
    }

    #[test]
    fn test_rank_without_question_prefers_severity_then_recency() {
        let units = vec![
            unit("a", "2024-05-01T10:00:00Z", 3, "low", ""),
            unit("b", "2024-05-01T09:00:00Z", 9, "old severe", ""),
            unit("c", "2024-05-01T11:00:00Z", 9, "new severe", ""),
            unit("d", "2024-05-01T08:00:00Z", 7, "high", ""),
        ];

        let ranked = rank(&units, None, 3);
        let ids: Vec<&str> = ranked.iter().map(|r| r.unit.source_id()).collect();
        assert_eq!(ids, vec!["c", "b", "d"]);
        assert_eq!(ranked[0].score, 9);
    }

    #[test]
    fn test_rank_ties_broken_by_source_id() {
        let units = vec![
            unit("z", "2024-05-01T10:00:00Z", 5, "same", ""),
            unit("m", "2024-05-01T10:00:00Z", 5, "same", ""),
        ];
        let ranked = rank(&units, None, 10);
        assert_eq!(ranked[0].unit.source_id(), "m");
        assert_eq!(ranked[1].unit.source_id(), "z");
    }

    #[test]
    fn test_rank_with_question_weights_fields() {
        let units = vec![
            unit("desc", "2024-05-01T10:00:00Z", 3, "powershell download", ""),
            unit("log", "2024-05-01T10:00:00Z", 3, "process created", "powershell.exe -enc"),
            unit("none", "2024-05-01T12:00:00Z", 12, "disk full", ""),
        ];

        let ranked = rank(&units, Some("powershell"), 3);
        assert_eq!(ranked[0].unit.source_id(), "desc");
        assert_eq!(ranked[1].unit.source_id(), "log");
        assert_eq!(ranked[2].score, 0);
    }

    #[test]
    fn test_matching_only_returns_touched_units() {
        let units = vec![
            unit("xss", "2024-05-01T10:00:00Z", 6, "XSS attempt blocked by ModSecurity", ""),
            unit("disk", "2024-05-01T10:00:00Z", 3, "disk full", ""),
        ];

        let matched = matching(&units, "any cross-site scripting?");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].unit.source_id(), "xss");

        assert!(matching(&units, "the").is_empty());
    }

    #[test]
    fn test_score_line() {
        let terms = QueryTerms::parse("critical ssh events");
        let line = "[CRITICAL L12] ... | sshd: brute force";
        assert!(terms.score_line(line, 12) > terms.score_line("[LOW L2] disk full", 2));
    }
}
