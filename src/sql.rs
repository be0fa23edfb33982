//! SQL text utilities
//!
//! Statement splitting, comment stripping and classification are done on the
//! PostgreSQL token stream, so semicolons and keywords inside string literals,
//! quoted identifiers, dollar-quoted bodies and comments are never mistaken
//! for statement structure. Statements are cut from the submitted text by
//! token span, so literals reach the database byte for byte.

use crate::review::SyntaxType;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, Whitespace};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("Failed to tokenize SQL: {0}")]
    Tokenize(String),
}

const DDL_VERBS: &[&str] = &["create", "alter", "drop", "truncate", "rename", "comment"];
const DML_VERBS: &[&str] = &["insert", "update", "delete", "merge", "copy", "replace", "upsert"];
const READ_VERBS: &[&str] = &["select", "show", "explain"];

static READ_QUERY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(select|show|explain)\b").unwrap());
static SELECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^select\b").unwrap());
static LIMIT_N: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blimit\s*(\d+)\s*$").unwrap());
static LIMIT_OFFSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blimit\s*(\d+)\s*offset\s*(\d+)\s*$").unwrap());
static LIMIT_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\blimit\s*(\d+)\s*,\s*(\d+)\s*$").unwrap());

fn tokenize(sql: &str) -> Result<Vec<Token>, SqlError> {
    let dialect = PostgreSqlDialect {};
    Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| SqlError::Tokenize(e.to_string()))
}

/// Tokens paired with the exact source text each was read from
fn lex(sql: &str) -> Result<Vec<(Token, &str)>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| SqlError::Tokenize(e.to_string()))?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    // locations are 1-based lines and 1-based character columns
    let offset = |location: Location| -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&start) = line_starts.get(line) else {
            return sql.len();
        };
        let column = (location.column as usize).saturating_sub(1);
        sql[start..]
            .char_indices()
            .nth(column)
            .map_or(sql.len(), |(i, _)| start + i)
    };

    Ok(tokens
        .into_iter()
        .map(|t| {
            let text = sql.get(offset(t.span.start)..offset(t.span.end)).unwrap_or("");
            (t.token, text)
        })
        .collect())
}

fn is_comment(token: &Token) -> bool {
    matches!(
        token,
        Token::Whitespace(Whitespace::SingleLineComment { .. })
            | Token::Whitespace(Whitespace::MultiLineComment(_))
    )
}

/// Split a batch into statements, dropping comments and empty statements.
/// Returned statements carry no trailing semicolon.
pub fn split_statements(sql: &str) -> Result<Vec<String>, SqlError> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for (token, text) in lex(sql)? {
        match token {
            Token::SemiColon => {
                let statement = current.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                current.clear();
            }
            ref t if is_comment(t) => current.push(' '),
            _ => current.push_str(text),
        }
    }

    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.to_string());
    }
    Ok(statements)
}

/// Strip comments from SQL text; text that cannot be tokenized is returned trimmed
pub fn remove_comments(sql: &str) -> String {
    match lex(sql) {
        Ok(tokens) => tokens
            .iter()
            .map(|(t, text)| if is_comment(t) { " " } else { *text })
            .collect::<String>()
            .trim()
            .to_string(),
        Err(_) => sql.trim().to_string(),
    }
}

/// Unquoted words of a statement, lowercased, in order
pub fn words(statement: &str) -> Vec<String> {
    tokenize(statement)
        .map(|tokens| {
            tokens
                .into_iter()
                .filter_map(|t| match t {
                    Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_lowercase()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Classify one statement as DDL, DML or neither
pub fn syntax_type(statement: &str) -> SyntaxType {
    let words = words(statement);
    let Some(first) = words.first() else {
        return SyntaxType::Unknown;
    };

    if DDL_VERBS.contains(&first.as_str()) {
        SyntaxType::Ddl
    } else if DML_VERBS.contains(&first.as_str()) {
        SyntaxType::Dml
    } else if first == "with" && words.iter().any(|w| DML_VERBS.contains(&w.as_str())) {
        // data-modifying CTE
        SyntaxType::Dml
    } else {
        SyntaxType::Unknown
    }
}

/// True for statements that only read: select/show/explain and plain CTE queries
pub fn is_read_statement(statement: &str) -> bool {
    let words = words(statement);
    match words.first().map(String::as_str) {
        Some(verb) if READ_VERBS.contains(&verb) => true,
        Some("with") => !words.iter().any(|w| DML_VERBS.contains(&w.as_str())),
        _ => false,
    }
}

/// Outcome of screening text submitted to the query feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCheck {
    pub msg: String,
    pub bad_query: bool,
    pub filtered_sql: String,
    pub has_star: bool,
}

/// Strip comments, keep only the first statement and enforce the read verb allow-list
pub fn query_check(sql: &str) -> QueryCheck {
    let mut result = QueryCheck {
        msg: String::new(),
        bad_query: false,
        filtered_sql: sql.trim().to_string(),
        has_star: false,
    };

    match split_statements(sql) {
        Ok(statements) => match statements.into_iter().next() {
            Some(first) => result.filtered_sql = first,
            None => {
                result.bad_query = true;
                result.msg = "No valid SQL statement".to_string();
                return result;
            }
        },
        Err(e) => {
            result.bad_query = true;
            result.msg = e.to_string();
            return result;
        }
    }

    if !READ_QUERY.is_match(&result.filtered_sql) {
        result.bad_query = true;
        result.msg = "Unsupported query type, only SELECT, SHOW and EXPLAIN are allowed".to_string();
        return result;
    }
    if result.filtered_sql.contains('*') {
        result.has_star = true;
        result.msg = "SQL statement contains *".to_string();
    }
    result
}

/// Cap a read statement's row count at `limit`.
///
/// An existing trailing `LIMIT m` becomes `LIMIT min(limit, m)`; without one a
/// limit clause is appended. `limit == 0` means no cap. Only `SELECT` is
/// rewritten; other statements just get their terminator.
pub fn filter_sql(sql: &str, limit: u64) -> String {
    let sql = sql.trim().trim_end_matches(';').trim();
    if limit == 0 || !SELECT.is_match(sql) {
        return format!("{};", sql);
    }

    if let Some(caps) = LIMIT_OFFSET.captures(sql) {
        let existing: u64 = caps[1].parse().unwrap_or(limit);
        let offset = caps[2].to_string();
        let effective = limit.min(existing);
        return format!("{};", LIMIT_OFFSET.replace(sql, format!("limit {} offset {}", effective, offset)));
    }
    if let Some(caps) = LIMIT_COMMA.captures(sql) {
        let offset = caps[1].to_string();
        let existing: u64 = caps[2].parse().unwrap_or(limit);
        let effective = limit.min(existing);
        return format!("{};", LIMIT_COMMA.replace(sql, format!("limit {} offset {}", effective, offset)));
    }
    if let Some(caps) = LIMIT_N.captures(sql) {
        let existing: u64 = caps[1].parse().unwrap_or(limit);
        let effective = limit.min(existing);
        return format!("{};", LIMIT_N.replace(sql, format!("limit {}", effective)));
    }
    format!("{} limit {};", sql, limit)
}

/// Stable identifier of a statement, used to address in-flight schema changes
pub fn fingerprint(statement: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(statement.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_respects_literals_and_comments() {
        let sql = "insert into t values ('a;b'); -- trailing; comment\n\
                   update t set s = $$x;y$$ where id = 1;\n\
                   /* block; */ delete from t where id = 2";
        let statements = split_statements(sql).unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0], "insert into t values ('a;b')");
        assert!(statements[1].starts_with("update t set s = $$x;y$$"));
        assert_eq!(statements[2], "delete from t where id = 2");
    }

    #[test]
    fn test_split_keeps_escaped_quotes() {
        let sql = "update t set name = 'O''Brien' where id = 1;\n\
                   insert into t (note) values (E'a\\'b;c');\n\
                   select \"we\"\"ird\" from t";
        let statements = split_statements(sql).unwrap();
        assert_eq!(
            statements,
            vec![
                "update t set name = 'O''Brien' where id = 1".to_string(),
                "insert into t (note) values (E'a\\'b;c')".to_string(),
                "select \"we\"\"ird\" from t".to_string(),
            ]
        );
    }

    #[test]
    fn test_split_keeps_multibyte_text() {
        let statements = split_statements("-- café\nupdate t set s = 'naïve' where id = 1; select 'ü'").unwrap();
        assert_eq!(statements, vec!["update t set s = 'naïve' where id = 1", "select 'ü'"]);
    }

    #[test]
    fn test_split_drops_empty_statements() {
        assert_eq!(split_statements(" ; ;select 1;;").unwrap(), vec!["select 1".to_string()]);
        assert!(split_statements("-- only a comment").unwrap().is_empty());
    }

    #[test]
    fn test_remove_comments() {
        assert_eq!(remove_comments("-- note\nDELETE FROM t"), "DELETE FROM t");
        assert_eq!(remove_comments("/* x */ select 1"), "select 1");
        assert_eq!(remove_comments("select 'it''s' -- note"), "select 'it''s'");
    }

    #[test]
    fn test_syntax_type() {
        assert_eq!(syntax_type("ALTER TABLE t ADD COLUMN c INT"), SyntaxType::Ddl);
        assert_eq!(syntax_type("truncate t"), SyntaxType::Ddl);
        assert_eq!(syntax_type("DELETE FROM t"), SyntaxType::Dml);
        assert_eq!(syntax_type("with x as (delete from t returning *) select * from x"), SyntaxType::Dml);
        assert_eq!(syntax_type("select 1"), SyntaxType::Unknown);
        assert_eq!(syntax_type("grant select on t to u"), SyntaxType::Unknown);
    }

    #[test]
    fn test_read_statements() {
        assert!(is_read_statement("SELECT * FROM t"));
        assert!(is_read_statement("show search_path"));
        assert!(is_read_statement("with x as (select 1) select * from x"));
        assert!(!is_read_statement("with x as (select 1) insert into t select * from x"));
        assert!(!is_read_statement("update t set a = 1"));
        // quoted identifiers are not verbs
        assert!(!is_read_statement("insert into \"select\" values (1)"));
    }

    #[test]
    fn test_query_check_rejects_writes() {
        let check = query_check("delete from t");
        assert!(check.bad_query);

        let check = query_check("/* hi */ select id from t; drop table t;");
        assert!(!check.bad_query);
        assert_eq!(check.filtered_sql, "select id from t");
    }

    #[test]
    fn test_query_check_flags_star() {
        let check = query_check("select * from t");
        assert!(!check.bad_query);
        assert!(check.has_star);
    }

    #[test]
    fn test_filter_sql_rewrites_existing_limit() {
        assert_eq!(filter_sql("select * from t limit 5", 2), "select * from t limit 2;");
        assert_eq!(filter_sql("select * from t limit 5;", 100), "select * from t limit 5;");
        assert_eq!(filter_sql("SELECT a FROM t LIMIT 50 OFFSET 10", 20), "SELECT a FROM t limit 20 offset 10;");
        assert_eq!(filter_sql("select a from t limit 10, 50", 20), "select a from t limit 20 offset 10;");
    }

    #[test]
    fn test_filter_sql_appends_limit() {
        assert_eq!(filter_sql("select * from t", 10), "select * from t limit 10;");
        assert_eq!(filter_sql("show search_path", 10), "show search_path;");
        assert_eq!(filter_sql("select * from t", 0), "select * from t;");
    }

    #[test]
    fn test_effective_limit_is_minimum() {
        for (requested, existing) in [(1u64, 9u64), (9, 1), (5, 5), (1000, 3)] {
            let sql = filter_sql(&format!("select id from t limit {}", existing), requested);
            assert_eq!(sql, format!("select id from t limit {};", requested.min(existing)));
        }
    }

    #[test]
    fn test_fingerprint_ignores_surrounding_whitespace() {
        assert_eq!(fingerprint(" alter table t add c int "), fingerprint("alter table t add c int"));
        assert_eq!(fingerprint("x").len(), 64);
    }
}
