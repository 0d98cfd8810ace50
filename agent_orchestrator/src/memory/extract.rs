//! Pure extraction of fact candidates from task output.
//!
//! Two shapes are recognised. A JSON document `{"facts": [...]}` whose entries carry
//! either `subject`/`predicate`/`value` or `note`, plus optional `importance` and
//! `tags`. Otherwise, any line containing `fact: subject | predicate | value` or
//! `note: text`, where `!high` style markers set importance and `#word` adds a tag.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::{FactContent, Importance, MemoryFact};
use crate::task::TaskId;

static DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(fact|note):\s*(.+)$").expect("directive regex is valid")
});
static IMPORTANCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)!(low|normal|high|critical)\b").expect("importance regex is valid")
});
static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)#([\w-]+)").expect("tag regex is valid"));

#[derive(Deserialize)]
struct FactDocument {
    facts: Vec<RawFact>,
}

#[derive(Deserialize)]
struct RawFact {
    subject: Option<String>,
    predicate: Option<String>,
    value: Option<serde_json::Value>,
    note: Option<String>,
    #[serde(default)]
    importance: Option<Importance>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Fact candidates in `output`, in order of appearance. Malformed entries are skipped.
pub fn extract_facts(task_id: TaskId, output: &str, at: DateTime<Utc>) -> Vec<MemoryFact> {
    let drafts = match parse_document(output) {
        Some(drafts) => drafts,
        None => parse_directives(output),
    };

    drafts
        .into_iter()
        .enumerate()
        .map(|(position, (content, importance, tags))| {
            MemoryFact::new(task_id, position, content, at)
                .with_importance(importance)
                .with_tags(tags)
        })
        .collect()
}

type Draft = (FactContent, Importance, Vec<String>);

fn parse_document(output: &str) -> Option<Vec<Draft>> {
    let trimmed = output.trim();
    let start = trimmed.find('{')?;
    let doc: FactDocument = serde_json::from_str(&trimmed[start..]).ok()?;

    Some(
        doc.facts
            .into_iter()
            .filter_map(|raw| {
                let content = match (raw.subject, raw.predicate, raw.value, raw.note) {
                    (Some(subject), Some(predicate), Some(value), _) => {
                        let value = match value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        triple(&subject, &predicate, &value)?
                    }
                    (_, _, _, Some(text)) if !text.trim().is_empty() => FactContent::Note {
                        text: text.trim().to_string(),
                    },
                    _ => return None,
                };
                Some((
                    content,
                    raw.importance.unwrap_or_default(),
                    normalize_tags(raw.tags),
                ))
            })
            .collect(),
    )
}

fn parse_directives(output: &str) -> Vec<Draft> {
    let mut drafts = Vec::new();
    for line in output.lines() {
        let Some(caps) = DIRECTIVE.captures(line) else {
            continue;
        };
        let body = caps[2].to_string();

        let importance = IMPORTANCE
            .captures_iter(&body)
            .filter_map(|c| Importance::parse(&c[1]))
            .last()
            .unwrap_or_default();
        let tags = normalize_tags(TAG.captures_iter(&body).map(|c| c[1].to_string()).collect());
        let stripped = TAG.replace_all(&IMPORTANCE.replace_all(&body, ""), "").trim().to_string();

        let content = if caps[1].eq_ignore_ascii_case("fact") {
            let parts: Vec<&str> = stripped.split('|').collect();
            match parts.as_slice() {
                [subject, predicate, value] => triple(subject, predicate, value),
                _ => None,
            }
        } else if stripped.is_empty() {
            None
        } else {
            Some(FactContent::Note { text: stripped })
        };

        if let Some(content) = content {
            drafts.push((content, importance, tags));
        }
    }
    drafts
}

fn triple(subject: &str, predicate: &str, value: &str) -> Option<FactContent> {
    let (subject, predicate, value) = (subject.trim(), predicate.trim(), value.trim());
    if subject.is_empty() || predicate.is_empty() || value.is_empty() {
        return None;
    }
    Some(FactContent::Triple {
        subject: subject.to_string(),
        predicate: predicate.to_string(),
        value: value.to_string(),
    })
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<String> = tags
        .into_iter()
        .map(|t| t.trim().trim_start_matches('#').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}
