//! Parsing of catalog index definitions
//!
//! PostgreSQL only exposes some index facts through the text of
//! `pg_indexes.indexdef`, e.g.
//! `CREATE UNIQUE INDEX idx ON public.t USING btree (a, ((b + c))) WHERE (d > 0)`.
//! These helpers are pure so the grammar can be tested without a server.

use crate::error::{AppError, AppResult};
use once_cell::sync::Lazy;
use regex::Regex;

static METHOD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"USING (\w+) ").expect("valid regex"));

/// Access method (`btree`, `gin`, ...) or an empty string when absent
pub fn index_method(def: &str) -> String {
    METHOD_RE
        .captures(def)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Split the key column list into its terms.
///
/// Terms are separated by top-level commas only: commas nested in
/// parentheses (expression indexes such as `((a, b))` or `lower((x)::text)`)
/// or in quoted identifiers/literals stay inside their term. Anything after
/// the closing parenthesis of the key list (`INCLUDE`, `WITH`, `WHERE`) is
/// ignored.
pub fn index_column_expressions(def: &str) -> AppResult<Vec<String>> {
    let invalid = || AppError::Driver(format!("invalid index statement: {:?}", def));

    let anchor = def
        .find(" USING ")
        .or_else(|| def.find(" ON "))
        .ok_or_else(invalid)?;
    let open = def[anchor..].find('(').map(|i| anchor + i).ok_or_else(invalid)?;

    let mut terms = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for ch in def[open + 1..].chars() {
        if let Some(q) = quote {
            current.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' if depth == 0 => {
                push_term(&mut terms, &current).ok_or_else(invalid)?;
                return Ok(terms);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            ',' if depth == 0 => {
                push_term(&mut terms, &current).ok_or_else(invalid)?;
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    Err(invalid())
}

fn push_term(terms: &mut Vec<String>, raw: &str) -> Option<()> {
    let term = raw.trim();
    if term.is_empty() {
        return None;
    }
    terms.push(term.to_string());
    Some(())
}
