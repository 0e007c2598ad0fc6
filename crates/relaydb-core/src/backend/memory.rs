//! In-memory reference backend.
//!
//! Implements the `Backend` seam over a small relational store that
//! understands the statement shapes the middleware itself emits: single-table
//! INSERT/UPDATE/DELETE with equality predicates, projected SELECT, and
//! CREATE/DROP/TRUNCATE TABLE. Sessions buffer their writes; `prepare`
//! validates them against committed state (UNIQUE constraints) and `commit`
//! applies them atomically.
//!
//! Auto-assigned `id` values follow the cluster convention: stride equal to
//! the cluster size, offset equal to the node id, so locally generated keys
//! never collide across replicas.
//!
//! Fault injection: `fail_matching` makes any statement containing the given
//! fragment fail, which lets tests force NO votes and backend errors.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{Backend, BackendSession, Row};
use crate::error::{CoreError, Result};

/// Shared in-memory relational store.
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        MemoryBackend {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner {
    tables: Mutex<HashMap<String, Table>>,
    unique: Mutex<HashSet<(String, String)>>,
    next_id: AtomicU64,
    stride: u64,
    fail_matching: Mutex<Option<String>>,
    queries: AtomicU64,
}

#[derive(Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<HashMap<String, String>>,
}

impl MemoryBackend {
    /// Create a store whose auto-ids are `offset, offset+stride, …`.
    pub fn new(stride: u64, offset: u64) -> Self {
        let first = if offset == 0 { stride.max(1) } else { offset };
        MemoryBackend {
            inner: Arc::new(Inner {
                tables: Mutex::new(HashMap::new()),
                unique: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(first),
                stride: stride.max(1),
                fail_matching: Mutex::new(None),
                queries: AtomicU64::new(0),
            }),
        }
    }

    /// Declare a UNIQUE constraint checked at prepare/commit time.
    pub fn add_unique(&self, table: &str, column: &str) {
        self.inner
            .unique
            .lock()
            .insert((table.to_string(), column.to_string()));
    }

    /// Make statements containing `fragment` fail; `None` clears the fault.
    pub fn fail_matching(&self, fragment: Option<&str>) {
        *self.inner.fail_matching.lock() = fragment.map(|s| s.to_string());
    }

    /// Number of SELECTs served, fault-injected ones included.
    pub fn query_count(&self) -> u64 {
        self.inner.queries.load(Ordering::Relaxed)
    }
}

impl Backend for MemoryBackend {
    type Session = MemorySession;

    fn begin(&self) -> Result<MemorySession> {
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            buffered: Vec::new(),
            finished: false,
        })
    }

    fn ping(&self) -> bool {
        true
    }
}

/// A buffered transaction over the shared store.
pub struct MemorySession {
    inner: Arc<Inner>,
    buffered: Vec<WriteOp>,
    finished: bool,
}

impl BackendSession for MemorySession {
    fn execute(&mut self, sql: &str) -> Result<u64> {
        self.inner.check_fault(sql)?;
        let op = parse_write(sql)?;
        let affected = self.inner.provisional_count(&op);
        self.buffered.push(op);
        Ok(affected)
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.inner.queries.fetch_add(1, Ordering::Relaxed);
        self.inner.check_fault(sql)?;
        let select = parse_select(sql)?;
        Ok(self.inner.run_select(&select))
    }

    fn prepare(&mut self) -> Result<()> {
        self.inner.validate(&self.buffered)
    }

    fn commit(&mut self) -> Result<u64> {
        if self.finished {
            return Err(CoreError::Backend("session already finished".to_string()));
        }
        self.inner.validate(&self.buffered)?;
        let applied = self.inner.apply(std::mem::take(&mut self.buffered));
        self.finished = true;
        Ok(applied)
    }

    fn rollback(&mut self) -> Result<()> {
        self.buffered.clear();
        self.finished = true;
        Ok(())
    }
}

impl Inner {
    fn check_fault(&self, sql: &str) -> Result<()> {
        if let Some(fragment) = self.fail_matching.lock().as_deref() {
            if sql.contains(fragment) {
                return Err(CoreError::Backend(format!(
                    "injected fault on statement matching {fragment:?}"
                )));
            }
        }
        Ok(())
    }

    /// Affected-row estimate against current committed state.
    fn provisional_count(&self, op: &WriteOp) -> u64 {
        let tables = self.tables.lock();
        match op {
            WriteOp::Insert { .. } => 1,
            WriteOp::Update { table, filter, .. } | WriteOp::Delete { table, filter } => tables
                .get(table)
                .map(|t| t.rows.iter().filter(|r| matches_filter(r, filter)).count() as u64)
                .unwrap_or(0),
            WriteOp::Truncate { table } => tables
                .get(table)
                .map(|t| t.rows.len() as u64)
                .unwrap_or(0),
            WriteOp::Create { .. } | WriteOp::Drop { .. } => 0,
        }
    }

    fn validate(&self, buffered: &[WriteOp]) -> Result<()> {
        let unique = self.unique.lock();
        if unique.is_empty() {
            return Ok(());
        }
        let tables = self.tables.lock();
        for (table, column) in unique.iter() {
            let mut seen: HashSet<String> = tables
                .get(table)
                .map(|t| {
                    t.rows
                        .iter()
                        .filter_map(|r| r.get(column).cloned())
                        .collect()
                })
                .unwrap_or_default();
            for op in buffered {
                if let WriteOp::Insert { table: t, values } = op {
                    if t != table {
                        continue;
                    }
                    if let Some((_, v)) = values.iter().find(|(c, _)| c == column) {
                        if !seen.insert(v.clone()) {
                            return Err(CoreError::Backend(format!(
                                "duplicate value {v:?} for unique column {table}.{column}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn apply(&self, buffered: Vec<WriteOp>) -> u64 {
        let mut tables = self.tables.lock();
        let mut affected = 0;
        for op in buffered {
            match op {
                WriteOp::Insert { table, values } => {
                    let entry = tables.entry(table).or_default();
                    let mut row: HashMap<String, String> = HashMap::new();
                    for (col, val) in values {
                        if !entry.columns.contains(&col) {
                            entry.columns.push(col.clone());
                        }
                        row.insert(col, val);
                    }
                    if !row.contains_key("id") {
                        let id = self.next_id.fetch_add(self.stride, Ordering::Relaxed);
                        if !entry.columns.contains(&"id".to_string()) {
                            entry.columns.insert(0, "id".to_string());
                        }
                        row.insert("id".to_string(), id.to_string());
                    }
                    entry.rows.push(row);
                    affected += 1;
                }
                WriteOp::Update { table, set, filter } => {
                    if let Some(entry) = tables.get_mut(&table) {
                        for (col, _) in &set {
                            if !entry.columns.contains(col) {
                                entry.columns.push(col.clone());
                            }
                        }
                        for row in entry.rows.iter_mut() {
                            if matches_filter(row, &filter) {
                                for (col, val) in &set {
                                    row.insert(col.clone(), val.clone());
                                }
                                affected += 1;
                            }
                        }
                    }
                }
                WriteOp::Delete { table, filter } => {
                    if let Some(entry) = tables.get_mut(&table) {
                        let before = entry.rows.len();
                        entry.rows.retain(|r| !matches_filter(r, &filter));
                        affected += (before - entry.rows.len()) as u64;
                    }
                }
                WriteOp::Create { table } => {
                    tables.entry(table).or_default();
                }
                WriteOp::Drop { table } => {
                    tables.remove(&table);
                }
                WriteOp::Truncate { table } => {
                    if let Some(entry) = tables.get_mut(&table) {
                        affected += entry.rows.len() as u64;
                        entry.rows.clear();
                    }
                }
            }
        }
        affected
    }

    fn run_select(&self, select: &Select) -> Vec<Row> {
        let tables = self.tables.lock();
        let Some(table) = tables.get(&select.table) else {
            return Vec::new();
        };
        let columns: Vec<&String> = if select.columns.is_empty() {
            table.columns.iter().collect()
        } else {
            select.columns.iter().collect()
        };
        table
            .rows
            .iter()
            .filter(|r| matches_filter(r, &select.filter))
            .map(|r| {
                columns
                    .iter()
                    .map(|c| r.get(*c).cloned().unwrap_or_default())
                    .collect()
            })
            .collect()
    }
}

fn matches_filter(row: &HashMap<String, String>, filter: &[(String, String)]) -> bool {
    filter
        .iter()
        .all(|(col, val)| row.get(col).map(|v| v == val).unwrap_or(false))
}

// ---------------------------------------------------------------------------
// Statement parsing (the subset the middleware emits)
// ---------------------------------------------------------------------------

enum WriteOp {
    Insert {
        table: String,
        values: Vec<(String, String)>,
    },
    Update {
        table: String,
        set: Vec<(String, String)>,
        filter: Vec<(String, String)>,
    },
    Delete {
        table: String,
        filter: Vec<(String, String)>,
    },
    Create {
        table: String,
    },
    Drop {
        table: String,
    },
    Truncate {
        table: String,
    },
}

struct Select {
    columns: Vec<String>,
    table: String,
    filter: Vec<(String, String)>,
}

fn parse_write(sql: &str) -> Result<WriteOp> {
    let sql = sql.trim().trim_end_matches(';');
    let rest = sql;
    if let Some(rest) = strip_keyword(rest, "INSERT") {
        let rest = strip_keyword(rest, "INTO")
            .ok_or_else(|| bad(sql, "expected INTO"))?;
        let (table, rest) = take_identifier(rest)?;
        let (cols_raw, rest) = take_parenthesized(rest)?;
        let rest = strip_keyword(rest, "VALUES")
            .ok_or_else(|| bad(sql, "expected VALUES"))?;
        let (vals_raw, _) = take_parenthesized(rest)?;
        let columns: Vec<String> = cols_raw
            .split(',')
            .map(|c| c.trim().trim_matches('`').to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let values = split_values(&vals_raw)?;
        if columns.len() != values.len() {
            return Err(bad(sql, "column/value count mismatch"));
        }
        return Ok(WriteOp::Insert {
            table,
            values: columns.into_iter().zip(values).collect(),
        });
    }
    if let Some(rest) = strip_keyword(rest, "UPDATE") {
        let (table, rest) = take_identifier(rest)?;
        let rest = strip_keyword(rest, "SET").ok_or_else(|| bad(sql, "expected SET"))?;
        let (set_raw, where_raw) = split_where(rest);
        let set = parse_assignments(&set_raw)?;
        let filter = parse_conditions(&where_raw)?;
        return Ok(WriteOp::Update { table, set, filter });
    }
    if let Some(rest) = strip_keyword(rest, "DELETE") {
        let rest = strip_keyword(rest, "FROM").ok_or_else(|| bad(sql, "expected FROM"))?;
        let (table, rest) = take_identifier(rest)?;
        let (_, where_raw) = split_where(rest);
        let filter = parse_conditions(&where_raw)?;
        return Ok(WriteOp::Delete { table, filter });
    }
    if let Some(rest) = strip_keyword(rest, "CREATE") {
        let rest = strip_keyword(rest, "TABLE").ok_or_else(|| bad(sql, "expected TABLE"))?;
        let rest = strip_keyword(rest, "IF NOT EXISTS").unwrap_or(rest);
        let (table, _) = take_identifier(rest)?;
        return Ok(WriteOp::Create { table });
    }
    if let Some(rest) = strip_keyword(rest, "DROP") {
        let rest = strip_keyword(rest, "TABLE").ok_or_else(|| bad(sql, "expected TABLE"))?;
        let rest = strip_keyword(rest, "IF EXISTS").unwrap_or(rest);
        let (table, _) = take_identifier(rest)?;
        return Ok(WriteOp::Drop { table });
    }
    if let Some(rest) = strip_keyword(rest, "TRUNCATE") {
        let rest = strip_keyword(rest, "TABLE").unwrap_or(rest);
        let (table, _) = take_identifier(rest)?;
        return Ok(WriteOp::Truncate { table });
    }
    if let Some(rest) = strip_keyword(rest, "ALTER") {
        let rest = strip_keyword(rest, "TABLE").ok_or_else(|| bad(sql, "expected TABLE"))?;
        let (table, _) = take_identifier(rest)?;
        // schema changes are a no-op in the schemaless store
        return Ok(WriteOp::Create { table });
    }
    Err(bad(sql, "unsupported write statement"))
}

fn parse_select(sql: &str) -> Result<Select> {
    let sql = sql.trim().trim_end_matches(';');
    let rest = strip_keyword(sql, "SELECT").ok_or_else(|| bad(sql, "expected SELECT"))?;
    let from = find_keyword(rest, "FROM").ok_or_else(|| bad(sql, "expected FROM"))?;
    let cols_raw = rest[..from].trim();
    let columns: Vec<String> = if cols_raw == "*" {
        Vec::new()
    } else {
        cols_raw
            .split(',')
            .map(|c| c.trim().trim_matches('`').to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };
    let rest = &rest[from + "FROM".len()..];
    let (table, rest) = take_identifier(rest)?;
    let (_, where_raw) = split_where(rest);
    let filter = parse_conditions(&where_raw)?;
    Ok(Select {
        columns,
        table,
        filter,
    })
}

fn bad(sql: &str, why: &str) -> CoreError {
    CoreError::Backend(format!("{why} in {sql:?}"))
}

/// Case-insensitive keyword prefix strip; keywords may contain spaces.
fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let mut rest = input.trim_start();
    for word in keyword.split_whitespace() {
        let trimmed = rest.trim_start();
        if trimmed.len() < word.len() || !trimmed[..word.len()].eq_ignore_ascii_case(word) {
            return None;
        }
        let after = &trimmed[word.len()..];
        if !after.is_empty() && !after.starts_with(|c: char| c.is_whitespace() || c == '(') {
            return None;
        }
        rest = after;
    }
    Some(rest)
}

/// Byte offset of a standalone keyword outside quotes.
fn find_keyword(input: &str, keyword: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < input.len() {
        if !input.is_char_boundary(i) {
            i += 1;
            continue;
        }
        let c = bytes[i] as char;
        if c == '\'' {
            in_quote = !in_quote;
            i += 1;
            continue;
        }
        if !in_quote
            && input.len() - i >= keyword.len()
            && input[i..i + keyword.len()].eq_ignore_ascii_case(keyword)
        {
            let before_ok = i == 0 || (bytes[i - 1] as char).is_whitespace();
            let after = i + keyword.len();
            let after_ok =
                after == input.len() || (bytes[after] as char).is_whitespace();
            if before_ok && after_ok {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn take_identifier(input: &str) -> Result<(String, &str)> {
    let trimmed = input.trim_start();
    let end = trimmed
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(trimmed.len());
    let ident = trimmed[..end].trim_matches('`').to_string();
    if ident.is_empty() {
        return Err(CoreError::Backend("missing identifier".to_string()));
    }
    Ok((ident, &trimmed[end..]))
}

/// Take a `( … )` group, quote-aware; returns (inner, remainder).
fn take_parenthesized(input: &str) -> Result<(String, &str)> {
    let trimmed = input.trim_start();
    if !trimmed.starts_with('(') {
        return Err(CoreError::Backend("expected opening parenthesis".to_string()));
    }
    let bytes = trimmed.as_bytes();
    let mut in_quote = false;
    let mut depth = 0usize;
    for i in 0..trimmed.len() {
        match bytes[i] as char {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return Ok((trimmed[1..i].to_string(), &trimmed[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(CoreError::Backend("unbalanced parentheses".to_string()))
}

/// Split the WHERE clause off; returns (head, where-body).
fn split_where(input: &str) -> (String, String) {
    match find_keyword(input, "WHERE") {
        Some(idx) => (
            input[..idx].trim().to_string(),
            input[idx + "WHERE".len()..].trim().to_string(),
        ),
        None => (input.trim().to_string(), String::new()),
    }
}

/// Comma-separated values, quote-aware; literals unquoted, `''` unescaped.
fn split_values(input: &str) -> Result<Vec<String>> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quote => {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_quote = false;
                }
            }
            '\'' => in_quote = true,
            ',' if !in_quote => {
                values.push(std::mem::take(&mut current).trim().to_string());
            }
            _ => {
                if in_quote {
                    current.push(c);
                } else if !c.is_whitespace() {
                    current.push(c);
                }
            }
        }
    }
    if in_quote {
        return Err(CoreError::Backend("unterminated string literal".to_string()));
    }
    values.push(current.trim().to_string());
    Ok(values)
}

/// `col = 'value'` pairs separated by top-level commas.
fn parse_assignments(input: &str) -> Result<Vec<(String, String)>> {
    split_top_level(input, ',')
        .into_iter()
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_equality(&part))
        .collect()
}

/// `col = 'value'` conjunctions joined by AND.
fn parse_conditions(input: &str) -> Result<Vec<(String, String)>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut rest = input.to_string();
    loop {
        match find_keyword(&rest, "AND") {
            Some(idx) => {
                out.push(parse_equality(&rest[..idx])?);
                rest = rest[idx + "AND".len()..].to_string();
            }
            None => {
                out.push(parse_equality(&rest)?);
                return Ok(out);
            }
        }
    }
}

fn parse_equality(part: &str) -> Result<(String, String)> {
    let eq = part
        .find('=')
        .ok_or_else(|| CoreError::Backend(format!("expected equality in {part:?}")))?;
    let col = part[..eq].trim().trim_matches('`').to_string();
    let values = split_values(part[eq + 1..].trim())?;
    match values.as_slice() {
        [value] => Ok((col, value.clone())),
        _ => Err(CoreError::Backend(format!("expected single value in {part:?}"))),
    }
}

fn split_top_level(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for c in input.chars() {
        match c {
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            c if c == sep && !in_quote => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}
