//! Knowledge cache builder: ranked units into a bounded, warmed prefix
//!
//! Building is split in two. [`KnowledgeCacheBuilder::plan`] is pure: it picks
//! the units that fit the budget, renders the prefix document and computes the
//! fingerprint. [`KnowledgeCacheBuilder::warm`] is the expensive part that runs
//! the document through the backend once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::GenerationBackend;
use crate::cache::entry::CacheEntry;
use crate::cache::types::{sha256_hex, Fingerprint};
use crate::error::{CagError, Result};
use crate::record::{KnowledgeUnit, ThreatPriority};

const FINGERPRINT_DOMAIN: &[u8] = b"aisoc-cag/v1";

const SECURITY_CONTEXT: &str = "You are a cybersecurity analyst specialized in Wazuh security logs and threat hunting.\n\
Your expertise includes:\n\
- Identifying attack patterns, brute-force attempts and suspicious activity\n\
- Analyzing events by timestamp, affected agent and indicators of compromise\n\
- Interpreting Wazuh rule levels and classifications\n\
- Giving actionable security recommendations\n\
Only use the events in the knowledge base below. If they do not answer the question, say so.";

const KNOWLEDGE_OPEN: &str = "=== KNOWLEDGE BASE ===\n";
const KNOWLEDGE_CLOSE: &str = "=== END OF KNOWLEDGE BASE ===\n";
const CLOSING: &str = "\nAnswer the security questions that follow using the knowledge base above. \
Reference event ids where relevant.\n";

/// Size limit for the prefix document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Budget {
    /// Unicode scalar values
    Characters(usize),
    /// Tokens as counted by the backend
    Tokens(usize),
}

impl Budget {
    pub fn limit(&self) -> usize {
        match self {
            Budget::Characters(n) | Budget::Tokens(n) => *n,
        }
    }

    fn measure(&self, text: &str, backend: &dyn GenerationBackend) -> usize {
        match self {
            Budget::Characters(_) => text.chars().count(),
            Budget::Tokens(_) => backend.count_tokens(text),
        }
    }
}

/// Outcome of planning a build; no backend work has happened yet
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub snapshot_id: String,
    pub fingerprint: Fingerprint,
    /// Units in prefix order
    pub units: Vec<KnowledgeUnit>,
    /// Ranked units that did not fit
    pub dropped: usize,
    pub document: String,
    /// Measured size of `document` under the budget's unit
    pub used: usize,
}

/// Builds prefix documents and warms them into cache entries
#[derive(Debug, Clone)]
pub struct KnowledgeCacheBuilder {
    budget: Budget,
    response_language: Option<String>,
}

impl KnowledgeCacheBuilder {
    pub fn new(budget: Budget, response_language: Option<String>) -> Self {
        Self {
            budget,
            response_language,
        }
    }

    pub fn budget(&self) -> Budget {
        self.budget
    }

    fn preamble(&self) -> String {
        let mut preamble = SECURITY_CONTEXT.to_string();
        if let Some(language) = &self.response_language {
            preamble.push_str(&format!(" Respond in {}.", language));
        }
        preamble.push_str("\n\n");
        preamble.push_str(KNOWLEDGE_OPEN);
        preamble
    }

    /// Choose the units that fit and render the prefix document
    ///
    /// Units are taken in the given order; the first one that does not fit
    /// ends the prefix and it and everything after it are dropped.
    pub fn plan(
        &self,
        snapshot_id: &str,
        units: &[KnowledgeUnit],
        backend: &dyn GenerationBackend,
    ) -> Result<BuildPlan> {
        if units.is_empty() {
            return Err(CagError::CacheBuild(
                "no valid knowledge units to cache".to_string(),
            ));
        }

        let preamble = self.preamble();
        let closing = format!("{}{}", KNOWLEDGE_CLOSE, CLOSING);
        let limit = self.budget.limit();

        // segments are measured separately, which never undercounts
        let mut used = self.budget.measure(&preamble, backend) + self.budget.measure(&closing, backend);
        let mut body = String::new();
        let mut kept: Vec<KnowledgeUnit> = Vec::new();
        let mut section: Option<ThreatPriority> = None;

        for unit in units {
            let header = (section != Some(unit.priority())).then(|| section_header(unit.priority()));
            let line = format!("{}\n", unit.text());

            let cost = header
                .as_deref()
                .map_or(0, |h| self.budget.measure(h, backend))
                + self.budget.measure(&line, backend);
            if used + cost > limit {
                break;
            }

            used += cost;
            if let Some(header) = header {
                body.push_str(&header);
                section = Some(unit.priority());
            }
            body.push_str(&line);
            kept.push(unit.clone());
        }

        if kept.is_empty() {
            return Err(CagError::CacheBuild(format!(
                "budget of {} cannot fit a single knowledge unit ({} needed before any unit)",
                limit,
                self.budget.measure(&preamble, backend) + self.budget.measure(&closing, backend)
            )));
        }

        let dropped = units.len() - kept.len();
        let document = format!("{}{}{}", preamble, body, closing);
        let fingerprint = fingerprint(&kept, &document, backend.name());

        debug!(
            "Planned cache {} for '{}': {} units kept, {} dropped, {}/{} used",
            fingerprint.short(),
            snapshot_id,
            kept.len(),
            dropped,
            used,
            limit
        );

        Ok(BuildPlan {
            snapshot_id: snapshot_id.to_string(),
            fingerprint,
            units: kept,
            dropped,
            document,
            used,
        })
    }

    /// Run a plan through the backend once and wrap the result as an entry
    pub async fn warm(
        &self,
        plan: &BuildPlan,
        backend: &dyn GenerationBackend,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let started = std::time::Instant::now();
        let warm = backend.warm(&plan.document).await?;

        if warm.origin_length == 0 || warm.state.is_empty() {
            return Err(CagError::CacheBuild(format!(
                "backend {} produced an empty prefix state",
                backend.name()
            )));
        }

        info!(
            "Warmed cache {} in {}ms ({} units, origin length {}, {} state bytes)",
            plan.fingerprint.short(),
            started.elapsed().as_millis(),
            plan.units.len(),
            warm.origin_length,
            warm.state.len()
        );

        Ok(CacheEntry::new(
            plan.fingerprint.clone(),
            plan.snapshot_id.clone(),
            backend.name(),
            warm,
            plan.units.clone(),
            plan.dropped,
            ttl,
        ))
    }

    /// Plan and warm in one go
    pub async fn build(
        &self,
        snapshot_id: &str,
        units: &[KnowledgeUnit],
        backend: &dyn GenerationBackend,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let plan = self.plan(snapshot_id, units, backend)?;
        self.warm(&plan, backend, ttl).await
    }
}

fn section_header(priority: ThreatPriority) -> String {
    match priority {
        ThreatPriority::Critical => "=== CRITICAL SECURITY EVENTS ===\n".to_string(),
        other => format!("=== {} PRIORITY SECURITY EVENTS ===\n", other),
    }
}

/// Content fingerprint over the ordered unit set, the document and the backend
pub fn fingerprint(units: &[KnowledgeUnit], document: &str, backend: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    hasher.update([0]);
    hasher.update(backend.as_bytes());
    hasher.update([0]);
    hasher.update(sha256_hex(document.as_bytes()).as_bytes());
    for unit in units {
        hasher.update([0x1e]);
        hasher.update(unit.source_id().as_bytes());
        hasher.update([0x1f]);
        hasher.update(sha256_hex(unit.text().as_bytes()).as_bytes());
    }
    Fingerprint::from_hasher(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExtractiveBackend;
    use crate::record::{RawEvent, RecordNormalizer};

    fn unit(id: &str, level: i64) -> KnowledgeUnit {
        RecordNormalizer::default()
            .normalize(
                &RawEvent::new()
                    .with("id", id)
                    .with("timestamp", "2024-05-01T10:00:00Z")
                    .with("agent_name", "web-01")
                    .with("rule_level", level)
                    .with("rule_description", format!("event {id}")),
            )
            .unwrap()
    }

    fn overhead(builder: &KnowledgeCacheBuilder) -> usize {
        builder.preamble().chars().count()
            + KNOWLEDGE_CLOSE.chars().count()
            + CLOSING.chars().count()
    }

    #[test]
    fn test_plan_keeps_order_and_sections() {
        let backend = ExtractiveBackend::new();
        let builder = KnowledgeCacheBuilder::new(Budget::Characters(100_000), None);
        let units = vec![unit("a", 12), unit("b", 11), unit("c", 8), unit("d", 2)];

        let plan = builder.plan("snap", &units, &backend).unwrap();
        assert_eq!(plan.units.len(), 4);
        assert_eq!(plan.dropped, 0);

        let doc = &plan.document;
        let critical = doc.find("=== CRITICAL SECURITY EVENTS ===").unwrap();
        let high = doc.find("=== HIGH PRIORITY SECURITY EVENTS ===").unwrap();
        let low = doc.find("=== LOW PRIORITY SECURITY EVENTS ===").unwrap();
        assert!(critical < doc.find("id=a").unwrap());
        assert!(doc.find("id=b").unwrap() < high);
        assert!(high < doc.find("id=c").unwrap());
        assert!(low < doc.find("id=d").unwrap());
        assert_eq!(doc.matches("=== CRITICAL SECURITY EVENTS ===").count(), 1);
        assert!(doc.ends_with(CLOSING));
    }

    #[test]
    fn test_plan_drops_tail_deterministically() {
        let backend = ExtractiveBackend::new();
        let sizing = KnowledgeCacheBuilder::new(Budget::Characters(0), None);
        let units = vec![unit("a", 9), unit("b", 9), unit("c", 9)];

        // room for the header and exactly two lines
        let line = units[0].text().chars().count() + 1;
        let header = section_header(ThreatPriority::High).chars().count();
        let limit = overhead(&sizing) + header + 2 * line;

        let builder = KnowledgeCacheBuilder::new(Budget::Characters(limit), None);
        let plan = builder.plan("snap", &units, &backend).unwrap();
        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.dropped, 1);
        assert!(plan.used <= limit);
        assert_eq!(plan.document.chars().count(), plan.used);

        let again = builder.plan("snap", &units, &backend).unwrap();
        assert_eq!(plan.fingerprint, again.fingerprint);
    }

    #[test]
    fn test_plan_rejects_empty_and_tiny_budgets() {
        let backend = ExtractiveBackend::new();
        let builder = KnowledgeCacheBuilder::new(Budget::Characters(10), None);

        assert!(matches!(
            builder.plan("snap", &[], &backend),
            Err(CagError::CacheBuild(_))
        ));
        assert!(matches!(
            builder.plan("snap", &[unit("a", 5)], &backend),
            Err(CagError::CacheBuild(_))
        ));
    }

    #[test]
    fn test_fingerprint_depends_on_order_and_language() {
        let backend = ExtractiveBackend::new();
        let builder = KnowledgeCacheBuilder::new(Budget::Tokens(100_000), None);

        let forward = builder
            .plan("snap", &[unit("a", 5), unit("b", 5)], &backend)
            .unwrap();
        let reversed = builder
            .plan("snap", &[unit("b", 5), unit("a", 5)], &backend)
            .unwrap();
        assert_ne!(forward.fingerprint, reversed.fingerprint);

        let localized = KnowledgeCacheBuilder::new(Budget::Tokens(100_000), Some("Indonesian".into()))
            .plan("snap", &[unit("a", 5), unit("b", 5)], &backend)
            .unwrap();
        assert_ne!(forward.fingerprint, localized.fingerprint);
        assert!(localized.document.contains("Respond in Indonesian."));
    }

    #[tokio::test]
    async fn test_build_produces_entry() {
        let backend = ExtractiveBackend::new();
        let builder = KnowledgeCacheBuilder::new(Budget::Tokens(100_000), None);

        let entry = builder
            .build("snap", &[unit("a", 12), unit("b", 3)], &backend, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(entry.metadata.record_count, 2);
        assert_eq!(entry.metadata.max_severity, 12);
        assert_eq!(entry.metadata.backend, "extractive");
        assert!(entry.metadata.origin_length > 0);
        assert!(entry.verify_state().is_ok());
    }
}
