//! Event file loading
//!
//! Accepts a JSON array of events, an OpenSearch search response
//! (`hits.hits[]._source`), or JSON Lines. `-` reads standard input.

use aisoc_cag::RawEvent;
use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::Path;

pub fn load_events(path: &Path) -> Result<Vec<RawEvent>> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read events from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read events from {:?}", path))?
    };

    parse_events(&text)
}

pub fn parse_events(text: &str) -> Result<Vec<RawEvent>> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    // a single JSON document first, JSON Lines otherwise
    if let Ok(document) = serde_json::from_str::<Value>(trimmed) {
        return from_document(document);
    }

    let mut events = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON on line {}", number + 1))?;
        match value {
            Value::Object(map) => events.push(RawEvent::from(map)),
            _ => bail!("Line {} is not a JSON object", number + 1),
        }
    }
    Ok(events)
}

fn from_document(document: Value) -> Result<Vec<RawEvent>> {
    match document {
        Value::Array(items) => Ok(objects(items)),
        Value::Object(mut map) => {
            if let Some(Value::Array(hits)) = map
                .get_mut("hits")
                .and_then(|hits| hits.get_mut("hits"))
                .map(Value::take)
            {
                return Ok(hits.into_iter().filter_map(search_hit).collect());
            }
            if let Some(Value::Array(items)) = map.remove("events") {
                return Ok(objects(items));
            }
            Ok(vec![RawEvent::from(map)])
        }
        _ => bail!("Expected a JSON array or object of events"),
    }
}

fn objects(items: Vec<Value>) -> Vec<RawEvent> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(RawEvent::from(map)),
            _ => None,
        })
        .collect()
}

/// `_source` of a search hit, carrying the hit's `_id` along
fn search_hit(hit: Value) -> Option<RawEvent> {
    let Value::Object(mut hit) = hit else {
        return None;
    };
    let mut source: Map<String, Value> = match hit.remove("_source") {
        Some(Value::Object(source)) => source,
        _ => return None,
    };
    if let Some(id) = hit.remove("_id") {
        source.entry("_id").or_insert(id);
    }
    Some(RawEvent::from(source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_array() {
        let events = parse_events(r#"[{"id": "a"}, {"id": "b"}, 42]"#).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].get("id"), Some(&Value::from("b")));
    }

    #[test]
    fn test_parse_search_response() {
        let text = r#"{"hits": {"total": 2, "hits": [
            {"_id": "x1", "_source": {"rule": {"level": 9}}},
            {"_id": "x2", "_source": {"_id": "kept", "rule": {"level": 3}}}
        ]}}"#;
        let events = parse_events(text).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].get("_id"), Some(&Value::from("x1")));
        assert_eq!(events[0].get("rule.level"), Some(&Value::from(9)));
        assert_eq!(events[1].get("_id"), Some(&Value::from("kept")));
    }

    #[test]
    fn test_parse_json_lines() {
        let text = "{\"id\": \"a\"}\n\n{\"id\": \"b\"}\n";
        assert_eq!(parse_events(text).unwrap().len(), 2);
        assert!(parse_events("{\"id\": \"a\"}\n[1]\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"events": [{{"id": "a"}}]}}"#).unwrap();

        let events = load_events(file.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert!(parse_events("   ").unwrap().is_empty());
    }
}
