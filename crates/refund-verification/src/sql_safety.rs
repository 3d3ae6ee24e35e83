//! §4.P.1: the safety policy gating the `llm_find_orders` fallback's
//! LLM-generated SQL before it ever reaches [`refund_orders_db::OrdersDb::execute_readonly_select`].

use refund_error::{Classify, ErrorCode};

const ALLOWED_TABLES: &[&str] = &["customers", "orders", "order_items", "refund_cases"];

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant", "revoke", "exec",
    "execute", "call", "copy", "merge",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SqlSafetyError {
    #[error("query must start with SELECT")]
    NotASelect,
    #[error("query must end with a LIMIT placeholder")]
    MissingTrailingLimit,
    #[error("query must not contain a semicolon")]
    ContainsSemicolon,
    #[error("query must not contain SQL comments")]
    ContainsComment,
    #[error("query contains a forbidden keyword: {0}")]
    ForbiddenKeyword(String),
    #[error("query references pg_catalog or information_schema")]
    CatalogAccess,
    #[error("query contains a bare UNION or WITH")]
    SetOperation,
    #[error("query references a table outside the allow-list: {0}")]
    DisallowedTable(String),
    #[error("placeholder count ({placeholders}) does not match parameter count ({params})")]
    PlaceholderMismatch { placeholders: usize, params: usize },
    #[error("final parameter is not a valid limit integer")]
    InvalidLimitParam,
    #[error("requested limit {requested} exceeds the configured max {max_limit}")]
    LimitExceedsMax { requested: u32, max_limit: u32 },
}

impl Classify for SqlSafetyError {
    fn code(&self) -> ErrorCode {
        ErrorCode::SqlValidationFailed
    }
}

/// Validates a generated `SELECT` statement against the allow-list
/// policy. Does not execute anything; callers pass the validated text
/// straight to `OrdersDb::execute_readonly_select`.
pub fn validate_select_sql(sql: &str, params: &[String], max_limit: u32) -> Result<(), SqlSafetyError> {
    let trimmed = sql.trim();
    let lowered = trimmed.to_ascii_lowercase();

    if !lowered.starts_with("select") {
        return Err(SqlSafetyError::NotASelect);
    }
    if trimmed.contains(';') {
        return Err(SqlSafetyError::ContainsSemicolon);
    }
    if lowered.contains("--") || lowered.contains("/*") {
        return Err(SqlSafetyError::ContainsComment);
    }
    if lowered.contains("pg_catalog") || lowered.contains("information_schema") {
        return Err(SqlSafetyError::CatalogAccess);
    }
    if contains_word(&lowered, "union") || contains_word(&lowered, "with") {
        return Err(SqlSafetyError::SetOperation);
    }
    for keyword in FORBIDDEN_KEYWORDS {
        if contains_word(&lowered, keyword) {
            return Err(SqlSafetyError::ForbiddenKeyword((*keyword).to_string()));
        }
    }

    let referenced_tables = extract_referenced_tables(&lowered);
    for table in &referenced_tables {
        if !ALLOWED_TABLES.contains(&table.as_str()) {
            return Err(SqlSafetyError::DisallowedTable(table.clone()));
        }
    }

    if !trailing_limit_placeholder(&lowered) {
        return Err(SqlSafetyError::MissingTrailingLimit);
    }

    let placeholder_count = count_placeholders(trimmed);
    if placeholder_count != params.len() {
        return Err(SqlSafetyError::PlaceholderMismatch { placeholders: placeholder_count, params: params.len() });
    }

    let final_param = params.last().ok_or(SqlSafetyError::InvalidLimitParam)?;
    let limit: u32 = final_param.parse().map_err(|_| SqlSafetyError::InvalidLimitParam)?;
    if limit > max_limit {
        return Err(SqlSafetyError::LimitExceedsMax { requested: limit, max_limit });
    }

    Ok(())
}

/// §4.P.1: the deterministic shortlist size, independent of whatever
/// limit the generator itself proposed.
pub fn desired_shortlist_size(has_strong_identifier: bool, max_limit: u32) -> u32 {
    if has_strong_identifier {
        1
    } else {
        5.min(max_limit)
    }
}

/// Overrides the generated query's trailing `LIMIT` parameter with the
/// deterministic shortlist size, per §4.P.1's final sentence.
pub fn override_limit_param(mut params: Vec<String>, desired_limit: u32) -> Vec<String> {
    if let Some(last) = params.last_mut() {
        *last = desired_limit.to_string();
    } else {
        params.push(desired_limit.to_string());
    }
    params
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.split(|c: char| !c.is_alphanumeric() && c != '_').any(|token| token == word)
}

fn trailing_limit_placeholder(lowered: &str) -> bool {
    let trimmed = lowered.trim_end();
    let Some(limit_pos) = trimmed.rfind("limit") else { return false };
    let tail = trimmed[limit_pos + "limit".len()..].trim();
    !tail.is_empty() && tail.chars().all(|c| c == '$' || c.is_ascii_digit())
}

fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 {
                count += 1;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    count
}

/// Extracts lowercase table identifiers following `from`/`join`, a
/// pragmatic approximation rather than a full SQL parser — sufficient
/// because the generator only ever emits simple single-clause selects.
fn extract_referenced_tables(lowered: &str) -> Vec<String> {
    let tokens: Vec<&str> = lowered.split_whitespace().collect();
    let mut tables = Vec::new();
    for (idx, token) in tokens.iter().enumerate() {
        if (*token == "from" || *token == "join") && idx + 1 < tokens.len() {
            let candidate = tokens[idx + 1].trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
            if !candidate.is_empty() {
                tables.push(candidate.to_string());
            }
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_well_formed_query() {
        let sql = "SELECT o.order_id FROM orders o JOIN customers c ON c.customer_id = o.customer_id WHERE lower(c.customer_email) = lower($1) LIMIT $2";
        assert!(validate_select_sql(sql, &["a@b.com".into(), "5".into()], 200).is_ok());
    }

    #[test]
    fn rejects_non_select_statements() {
        let err = validate_select_sql("DELETE FROM orders", &[], 200).unwrap_err();
        assert_eq!(err, SqlSafetyError::NotASelect);
    }

    #[test]
    fn rejects_semicolons() {
        let sql = "SELECT * FROM orders; DROP TABLE orders LIMIT $1";
        assert_eq!(validate_select_sql(sql, &["1".into()], 200).unwrap_err(), SqlSafetyError::ContainsSemicolon);
    }

    #[test]
    fn rejects_disallowed_tables() {
        let sql = "SELECT * FROM pg_shadow LIMIT $1";
        assert_eq!(
            validate_select_sql(sql, &["1".into()], 200).unwrap_err(),
            SqlSafetyError::DisallowedTable("pg_shadow".into())
        );
    }

    #[test]
    fn rejects_missing_trailing_limit() {
        let sql = "SELECT * FROM orders";
        assert_eq!(validate_select_sql(sql, &[], 200).unwrap_err(), SqlSafetyError::MissingTrailingLimit);
    }

    #[test]
    fn rejects_placeholder_mismatch() {
        let sql = "SELECT * FROM orders WHERE customer_id = $1 LIMIT $2";
        assert_eq!(
            validate_select_sql(sql, &["only-one".into()], 200).unwrap_err(),
            SqlSafetyError::PlaceholderMismatch { placeholders: 2, params: 1 }
        );
    }

    #[test]
    fn rejects_limit_over_max() {
        let sql = "SELECT * FROM orders LIMIT $1";
        assert_eq!(
            validate_select_sql(sql, &["500".into()], 200).unwrap_err(),
            SqlSafetyError::LimitExceedsMax { requested: 500, max_limit: 200 }
        );
    }

    #[test]
    fn desired_shortlist_is_one_with_strong_identifier() {
        assert_eq!(desired_shortlist_size(true, 200), 1);
        assert_eq!(desired_shortlist_size(false, 200), 5);
        assert_eq!(desired_shortlist_size(false, 3), 3);
    }

    #[test]
    fn override_limit_replaces_final_param() {
        let params = vec!["a@b.com".into(), "50".into()];
        assert_eq!(override_limit_param(params, 1), vec!["a@b.com".to_string(), "1".to_string()]);
    }
}
