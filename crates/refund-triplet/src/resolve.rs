//! Post-processing of raw per-page extractions into a single
//! deduplicated, type-coerced, citation-assigned entity/relationship
//! set (§4.T).

use std::collections::HashMap;

use refund_ontology::PolicySchema;
use serde_json::Value;
use tracing::warn;

use crate::extraction::{RawEntity, RawRelationship};
use crate::pages::Page;

const FUZZY_SIMILARITY_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct ResolvedEntity {
    pub label: String,
    pub name: String,
    pub properties: HashMap<String, Value>,
    pub source_citation: String,
}

#[derive(Debug, Clone)]
pub struct ResolvedRelationship {
    pub from_label: String,
    pub from_name: String,
    pub rel_type: String,
    pub to_label: String,
    pub to_name: String,
}

#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    pub entities: Vec<ResolvedEntity>,
    pub relationships: Vec<ResolvedRelationship>,
    pub dropped_relationship_warnings: Vec<String>,
}

/// Dedupes entities across every page's raw extraction by
/// `(label.lower, name.lower)`, keeping the first occurrence's
/// properties merged with any later duplicate's additional properties.
pub fn dedupe_entities(raw_entities: Vec<(RawEntity, &Page)>) -> Vec<(RawEntity, Page)> {
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    let mut deduped: Vec<(RawEntity, Page)> = Vec::new();

    for (entity, page) in raw_entities {
        let Some(name) = entity.properties.get("name").and_then(Value::as_str) else { continue };
        let key = (entity.label.to_lowercase(), name.to_lowercase());

        if let Some(&idx) = seen.get(&key) {
            for (k, v) in entity.properties {
                deduped[idx].0.properties.entry(k).or_insert(v);
            }
        } else {
            seen.insert(key, deduped.len());
            deduped.push((entity, page.clone()));
        }
    }
    deduped
}

/// Coerces each property to its schema-declared type, e.g. `"15 days"`
/// to the integer `15` for a property declared `integer`.
pub fn coerce_types(schema: &PolicySchema, label: &str, properties: &mut HashMap<String, Value>) {
    let Some(node_spec) = schema.nodes.iter().find(|n| n.label == label) else { return };

    for prop_spec in &node_spec.properties {
        let Some(value) = properties.get(&prop_spec.name) else { continue };
        let coerced = match prop_spec.property_type.as_str() {
            "integer" => extract_number(value).map(|n| Value::from(n as i64)),
            "float" => extract_number(value).map(Value::from),
            "bool" => extract_bool(value).map(Value::Bool),
            _ => None,
        };
        if let Some(coerced) = coerced {
            properties.insert(prop_spec.name.clone(), coerced);
        }
    }
}

fn extract_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.split_whitespace().find_map(|token| {
            let cleaned: String = token.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-').collect();
            cleaned.parse::<f64>().ok()
        }),
        _ => None,
    }
}

fn extract_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Fuzzy relationship resolution: when `from_name`/`to_name` doesn't
/// match a known entity exactly, tries a similarity match (ratio >=
/// 0.8) against entities sharing the same label; drops the
/// relationship (recording a warning) when nothing is close enough.
pub fn resolve_relationships(
    raw_relationships: &[RawRelationship],
    known_names_by_label: &HashMap<String, Vec<String>>,
) -> (Vec<ResolvedRelationship>, Vec<String>) {
    let mut resolved = Vec::new();
    let mut warnings = Vec::new();

    for rel in raw_relationships {
        let from_name = match resolve_name(&rel.from_label, &rel.from_name, known_names_by_label) {
            Some(name) => name,
            None => {
                warnings.push(format!(
                    "dropped relationship {} -> {}: no entity matching from_name '{}' (label {})",
                    rel.from_name, rel.to_name, rel.from_name, rel.from_label
                ));
                continue;
            }
        };
        let to_name = match resolve_name(&rel.to_label, &rel.to_name, known_names_by_label) {
            Some(name) => name,
            None => {
                warnings.push(format!(
                    "dropped relationship {} -> {}: no entity matching to_name '{}' (label {})",
                    rel.from_name, rel.to_name, rel.to_name, rel.to_label
                ));
                continue;
            }
        };

        resolved.push(ResolvedRelationship {
            from_label: rel.from_label.clone(),
            from_name,
            rel_type: rel.rel_type.clone(),
            to_label: rel.to_label.clone(),
            to_name,
        });
    }

    for warning in &warnings {
        warn!(target: "refund.triplet", "{warning}");
    }
    (resolved, warnings)
}

fn resolve_name(label: &str, name: &str, known_names_by_label: &HashMap<String, Vec<String>>) -> Option<String> {
    let candidates = known_names_by_label.get(label)?;
    if candidates.iter().any(|c| c.eq_ignore_ascii_case(name)) {
        return candidates.iter().find(|c| c.eq_ignore_ascii_case(name)).cloned();
    }

    candidates
        .iter()
        .map(|candidate| (candidate, strsim::jaro_winkler(&name.to_lowercase(), &candidate.to_lowercase())))
        .filter(|(_, score)| *score >= FUZZY_SIMILARITY_THRESHOLD)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .map(|(candidate, _)| candidate.clone())
}

/// Citation assignment: locates `text_excerpt` in the combined markdown
/// via exact substring, then a 50-char prefix, then a 5-word phrase, in
/// that order; defaults to the first page of the first file when none
/// resolve.
pub fn assign_citation(text_excerpt: &str, lines: &[&str], default_citation: &str) -> String {
    if let Some(line_idx) = find_substring_line(lines, text_excerpt) {
        return format!("line{}", line_idx);
    }

    let prefix: String = text_excerpt.chars().take(50).collect();
    if !prefix.trim().is_empty() {
        if let Some(line_idx) = find_substring_line(lines, &prefix) {
            return format!("line{}", line_idx);
        }
    }

    let phrase: String = text_excerpt.split_whitespace().take(5).collect::<Vec<_>>().join(" ");
    if !phrase.trim().is_empty() {
        if let Some(line_idx) = find_substring_line(lines, &phrase) {
            return format!("line{}", line_idx);
        }
    }

    default_citation.to_string()
}

fn find_substring_line(lines: &[&str], needle: &str) -> Option<usize> {
    if needle.trim().is_empty() {
        return None;
    }
    lines.iter().position(|line| line.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use refund_ontology::{NodeSpec, PropertySpec};

    fn sample_schema() -> PolicySchema {
        PolicySchema {
            nodes: vec![NodeSpec {
                label: "ReturnRule".into(),
                description: "d".into(),
                properties: vec![
                    PropertySpec { name: "name".into(), property_type: "string".into(), required: true, description: None },
                    PropertySpec { name: "days_allowed".into(), property_type: "integer".into(), required: false, description: None },
                ],
                constraints: vec![],
            }],
            relationships: vec![],
            design_rationale: String::new(),
        }
    }

    #[test]
    fn coerces_string_with_units_to_integer() {
        let schema = sample_schema();
        let mut props = HashMap::new();
        props.insert("days_allowed".to_string(), Value::String("15 days".to_string()));
        coerce_types(&schema, "ReturnRule", &mut props);
        assert_eq!(props.get("days_allowed"), Some(&Value::from(15i64)));
    }

    #[test]
    fn leaves_unknown_label_untouched() {
        let schema = sample_schema();
        let mut props = HashMap::new();
        props.insert("x".to_string(), Value::String("y".to_string()));
        coerce_types(&schema, "UnknownLabel", &mut props);
        assert_eq!(props.get("x"), Some(&Value::String("y".to_string())));
    }

    #[test]
    fn fuzzy_resolution_matches_close_name() {
        let mut known = HashMap::new();
        known.insert("ReturnRule".to_string(), vec!["Electronics Return Window".to_string()]);
        let rels = vec![RawRelationship {
            from_label: "ProductCategory".into(),
            from_name: "Electronics".into(),
            rel_type: "HAS_RETURN_RULE".into(),
            to_label: "ReturnRule".into(),
            to_name: "Electronic Return Window".into(),
        }];
        let mut known_full = known.clone();
        known_full.insert("ProductCategory".to_string(), vec!["Electronics".to_string()]);
        let (resolved, warnings) = resolve_relationships(&rels, &known_full);
        assert_eq!(resolved.len(), 1);
        assert!(warnings.is_empty());
        assert_eq!(resolved[0].to_name, "Electronics Return Window");
    }

    #[test]
    fn unmatched_relationship_is_dropped_with_warning() {
        let mut known = HashMap::new();
        known.insert("ProductCategory".to_string(), vec!["Electronics".to_string()]);
        known.insert("ReturnRule".to_string(), vec!["Apparel Return Window".to_string()]);
        let rels = vec![RawRelationship {
            from_label: "ProductCategory".into(),
            from_name: "Electronics".into(),
            rel_type: "HAS_RETURN_RULE".into(),
            to_label: "ReturnRule".into(),
            to_name: "Completely Unrelated Thing".into(),
        }];
        let (resolved, warnings) = resolve_relationships(&rels, &known);
        assert!(resolved.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn assign_citation_finds_exact_substring() {
        let lines = vec!["line zero", "the quick brown fox", "line two"];
        let citation = assign_citation("quick brown fox", &lines, "default.pdf:page1:line1");
        assert_eq!(citation, "line1");
    }

    #[test]
    fn assign_citation_falls_back_to_default() {
        let lines = vec!["nothing relevant here"];
        let citation = assign_citation("totally absent text", &lines, "default.pdf:page1:line1");
        assert_eq!(citation, "default.pdf:page1:line1");
    }
}
