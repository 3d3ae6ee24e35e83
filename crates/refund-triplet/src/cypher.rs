//! Cypher emission: one `MERGE` per resolved entity, one
//! `MATCH ... MERGE` per surviving relationship (§4.T).

use serde_json::Value;

use crate::resolve::{ResolvedEntity, ResolvedRelationship};

pub fn emit_entity_merge(entity: &ResolvedEntity) -> String {
    let mut props: Vec<String> = entity
        .properties
        .iter()
        .filter(|(k, _)| k.as_str() != "source_citation")
        .map(|(k, v)| format!("{k}: {}", format_value(v)))
        .collect();
    props.sort();
    props.push(format!("source_citation: {}", format_value(&Value::String(entity.source_citation.clone()))));

    format!("MERGE (n:{} {{{}}})", entity.label, props.join(", "))
}

pub fn emit_relationship_merge(rel: &ResolvedRelationship) -> String {
    format!(
        "MATCH (a:{} {{name: {}}}), (b:{} {{name: {}}}) MERGE (a)-[:{}]->(b)",
        rel.from_label,
        format_value(&Value::String(rel.from_name.clone())),
        rel.to_label,
        format_value(&Value::String(rel.to_name.clone())),
        rel.rel_type,
    )
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => format!("\"{}\"", other.to_string().replace('"', "\\\"")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn string_values_are_double_quoted_and_escaped() {
        let mut properties = HashMap::new();
        properties.insert("name".to_string(), Value::String("Say \"hi\"".to_string()));
        let entity = ResolvedEntity {
            label: "ReturnRule".into(),
            name: "Say \"hi\"".into(),
            properties,
            source_citation: "f.pdf:page1:line1".into(),
        };
        let cypher = emit_entity_merge(&entity);
        assert!(cypher.contains(r#"\"hi\""#));
        assert!(cypher.starts_with("MERGE (n:ReturnRule"));
    }

    #[test]
    fn numeric_values_are_unquoted() {
        let mut properties = HashMap::new();
        properties.insert("days_allowed".to_string(), Value::from(30));
        let entity = ResolvedEntity {
            label: "ReturnRule".into(),
            name: "Standard".into(),
            properties,
            source_citation: "f.pdf:page1:line1".into(),
        };
        let cypher = emit_entity_merge(&entity);
        assert!(cypher.contains("days_allowed: 30"));
        assert!(!cypher.contains("days_allowed: \"30\""));
    }

    #[test]
    fn relationship_merge_matches_both_endpoints_by_name() {
        let rel = ResolvedRelationship {
            from_label: "ProductCategory".into(),
            from_name: "Electronics".into(),
            rel_type: "HAS_RETURN_RULE".into(),
            to_label: "ReturnRule".into(),
            to_name: "Standard".into(),
        };
        let cypher = emit_relationship_merge(&rel);
        assert_eq!(
            cypher,
            r#"MATCH (a:ProductCategory {name: "Electronics"}), (b:ReturnRule {name: "Standard"}) MERGE (a)-[:HAS_RETURN_RULE]->(b)"#
        );
    }
}
