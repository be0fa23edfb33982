//! Rollback derivation
//!
//! Builds the inverse of reversible DDL. Anything that cannot be undone from
//! the statement text alone gets an explanatory comment instead.

use crate::sql::{remove_comments, split_statements};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const IDENT: &str = r#"(?:"[^"]+"|[\w$]+)(?:\.(?:"[^"]+"|[\w$]+))?"#;

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^create\s+(?:unlogged\s+)?table\s+(?:if\s+not\s+exists\s+)?({IDENT})")).unwrap()
});
static CREATE_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)^create\s+(?:unique\s+)?index\s+(?:concurrently\s+)?(?:if\s+not\s+exists\s+)?({IDENT})\s+on\b"
    ))
    .unwrap()
});
static CREATE_SCHEMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?is)^create\s+schema\s+(?:if\s+not\s+exists\s+)?({IDENT})")).unwrap());
static CREATE_VIEW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^create\s+(?:materialized\s+)?view\s+(?:if\s+not\s+exists\s+)?({IDENT})")).unwrap()
});
static ALTER_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?({IDENT})\s+(.*)$")).unwrap()
});
static ADD_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?is)^add\s+constraint\s+({IDENT})")).unwrap());
static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^add\s+(?:column\s+)?(?:if\s+not\s+exists\s+)?({IDENT})\s+\S")).unwrap()
});
static RENAME_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(&format!(r"(?is)^rename\s+to\s+({IDENT})\s*$")).unwrap());
static RENAME_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?is)^rename\s+(?:column\s+)?({IDENT})\s+to\s+({IDENT})\s*$")).unwrap()
});

/// A statement paired with its inverse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStatement {
    pub statement: String,
    pub rollback: String,
}

/// Inverse statements for a batch, in the batch's order
pub fn derive_rollback(sql: &str) -> Vec<RollbackStatement> {
    let statements = match split_statements(sql) {
        Ok(statements) => statements,
        Err(e) => {
            return vec![RollbackStatement {
                statement: sql.trim().to_string(),
                rollback: format!("-- Cannot derive rollback: {}", e),
            }]
        }
    };

    statements
        .into_iter()
        .map(|statement| {
            let rollback = inverse(&remove_comments(&statement))
                .unwrap_or_else(|| format!("-- Cannot auto-rollback: {}", summary(&statement)));
            RollbackStatement { statement, rollback }
        })
        .collect()
}

/// Rollback script: inverses applied last-first
pub fn rollback_script(statements: &[RollbackStatement]) -> String {
    statements
        .iter()
        .rev()
        .map(|s| s.rollback.clone())
        .collect::<Vec<_>>()
        .join("\n")
}

fn inverse(statement: &str) -> Option<String> {
    if let Some(caps) = CREATE_TABLE.captures(statement) {
        return Some(format!("DROP TABLE IF EXISTS {};", &caps[1]));
    }
    if let Some(caps) = CREATE_INDEX.captures(statement) {
        return Some(format!("DROP INDEX IF EXISTS {};", &caps[1]));
    }
    if let Some(caps) = CREATE_SCHEMA.captures(statement) {
        return Some(format!("DROP SCHEMA IF EXISTS {};", &caps[1]));
    }
    if let Some(caps) = CREATE_VIEW.captures(statement) {
        let kind = if statement.to_lowercase().contains("materialized") {
            "MATERIALIZED VIEW"
        } else {
            "VIEW"
        };
        return Some(format!("DROP {} IF EXISTS {};", kind, &caps[1]));
    }

    let caps = ALTER_TABLE.captures(statement)?;
    let table = &caps[1];
    let action = caps[2].trim();
    // several comma-separated actions are not split apart
    if action.contains(',') {
        return None;
    }

    if let Some(c) = ADD_CONSTRAINT.captures(action) {
        return Some(format!("ALTER TABLE {} DROP CONSTRAINT {};", table, &c[1]));
    }
    if let Some(c) = ADD_COLUMN.captures(action) {
        return Some(format!("ALTER TABLE {} DROP COLUMN {};", table, &c[1]));
    }
    if let Some(c) = RENAME_TABLE.captures(action) {
        let new_name = &c[1];
        // the renamed table keeps its schema
        let old_name = table.rsplit('.').next().unwrap_or(table);
        let renamed = match table.rsplit_once('.') {
            Some((schema, _)) if !new_name.contains('.') => format!("{}.{}", schema, new_name),
            _ => new_name.to_string(),
        };
        return Some(format!("ALTER TABLE {} RENAME TO {};", renamed, old_name));
    }
    if let Some(c) = RENAME_COLUMN.captures(action) {
        return Some(format!("ALTER TABLE {} RENAME COLUMN {} TO {};", table, &c[2], &c[1]));
    }
    None
}

fn summary(statement: &str) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > 80 {
        format!("{}...", flat.chars().take(80).collect::<String>())
    } else {
        flat
    }
}
