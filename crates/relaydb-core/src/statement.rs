//! SQL statement classification by leading keyword.
//!
//! The middleware never parses SQL beyond what routing needs: the first
//! token decides read vs. write vs. DDL, and a shallow scan pulls out the
//! target table name for lock acquisition.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// How a statement is routed: reads are load-balanced, writes and DDL go
/// through two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatementKind {
    Read,
    Write,
    Ddl,
}

impl StatementKind {
    pub fn is_write(self) -> bool {
        !matches!(self, StatementKind::Read)
    }
}

/// Uppercased leading keyword of a statement, or "UNKNOWN".
pub fn keyword(sql: &str) -> String {
    sql.trim()
        .split_whitespace()
        .next()
        .map(|w| w.to_ascii_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

/// Classify a statement by its leading keyword.
pub fn classify(sql: &str) -> Result<StatementKind> {
    match keyword(sql).as_str() {
        "SELECT" => Ok(StatementKind::Read),
        "INSERT" | "UPDATE" | "DELETE" => Ok(StatementKind::Write),
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" => Ok(StatementKind::Ddl),
        kw => Err(CoreError::BadStatement(kw.to_string())),
    }
}

/// Extract the table a statement operates on, if the shallow grammar
/// recognizes one. Callers fall back to a coarse sentinel lock when this
/// returns `None`.
pub fn target_table(sql: &str) -> Option<String> {
    let tokens: Vec<String> = sql
        .split_whitespace()
        .map(|t| t.to_string())
        .collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_ascii_uppercase()).collect();
    if upper.is_empty() {
        return None;
    }

    let table_at = |idx: usize| -> Option<String> {
        tokens.get(idx).map(|t| clean_identifier(t)).filter(|t| !t.is_empty())
    };

    match upper[0].as_str() {
        "INSERT" if upper.get(1).map(String::as_str) == Some("INTO") => table_at(2),
        "UPDATE" => table_at(1),
        "DELETE" if upper.get(1).map(String::as_str) == Some("FROM") => table_at(2),
        "SELECT" => {
            let from = upper.iter().position(|t| t == "FROM")?;
            table_at(from + 1)
        }
        "CREATE" | "DROP" | "ALTER" if upper.get(1).map(String::as_str) == Some("TABLE") => {
            // skip IF [NOT] EXISTS
            let mut idx = 2;
            if upper.get(idx).map(String::as_str) == Some("IF") {
                while idx < upper.len() && upper[idx] != "EXISTS" {
                    idx += 1;
                }
                idx += 1;
            }
            table_at(idx)
        }
        "TRUNCATE" => {
            if upper.get(1).map(String::as_str) == Some("TABLE") {
                table_at(2)
            } else {
                table_at(1)
            }
        }
        _ => None,
    }
}

/// Quote a value for embedding in a SQL literal, doubling single quotes.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

fn clean_identifier(token: &str) -> String {
    token
        .trim_matches(|c: char| c == '`' || c == '"' || c == ';' || c == ',')
        .split('(')
        .next()
        .unwrap_or("")
        .to_string()
}
