//! SQL parsing entry points and identifier utilities.
//!
//! `sqlparser` with the generic dialect supplies the single AST used for
//! incoming statements and for calculated-field expressions. Parsing is
//! total: syntax errors become [`PlanError::Parse`] and oversized input is
//! rejected before the tokenizer runs.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::ast::{Expr, Ident, ObjectName, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::ALL_KEYWORDS;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::{PlanError, PlanResult};

/// Upper bound on incoming SQL statements.
pub const MAX_SQL_BYTES: usize = 1024 * 1024;

/// Upper bound on manifest JSON documents.
pub const MAX_MANIFEST_BYTES: usize = 16 * 1024 * 1024;

/// Identifiers that can be emitted bare. Anything else is quoted; the rule
/// is stricter than most engines' (uppercase forces quoting) so that
/// planned SQL round-trips case-sensitively.
static BARE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap());

/// Parse exactly one statement.
pub fn parse_statement(sql: &str) -> PlanResult<Statement> {
    if sql.len() > MAX_SQL_BYTES {
        return Err(PlanError::InputTooLarge {
            what: "SQL statement",
            limit: MAX_SQL_BYTES,
            actual: sql.len(),
        });
    }
    let mut statements =
        Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| PlanError::Parse {
            message: format!("{e} in {}", excerpt(sql)),
        })?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        0 => Err(PlanError::Parse {
            message: "empty statement".to_string(),
        }),
        n => Err(PlanError::Parse {
            message: format!("expected a single statement, found {n}"),
        }),
    }
}

/// Parse a standalone expression (the calculated-field language).
pub fn parse_expression(sql: &str) -> PlanResult<Expr> {
    if sql.len() > MAX_SQL_BYTES {
        return Err(PlanError::InputTooLarge {
            what: "expression",
            limit: MAX_SQL_BYTES,
            actual: sql.len(),
        });
    }
    let dialect = GenericDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(sql)
        .map_err(|e| PlanError::Parse {
            message: format!("{e} in {}", excerpt(sql)),
        })?;
    let expr = parser.parse_expr().map_err(|e| PlanError::Parse {
        message: format!("{e} in {}", excerpt(sql)),
    })?;
    if !matches!(parser.peek_token().token, Token::EOF) {
        return Err(PlanError::Parse {
            message: format!("trailing input after expression in {}", excerpt(sql)),
        });
    }
    Ok(expr)
}

/// Whether `name` must be quoted when emitted.
pub fn needs_quoting(name: &str) -> bool {
    !BARE_IDENT.is_match(name) || ALL_KEYWORDS.contains(&name.to_uppercase().as_str())
}

/// Render an identifier, quoting only when required.
pub fn quote_ident(name: &str) -> String {
    if needs_quoting(name) {
        format!("\"{}\"", name.replace('"', "\"\""))
    } else {
        name.to_string()
    }
}

/// Render a dotted, per-part-quoted reference.
pub fn quote_qualified(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| quote_ident(p))
        .collect::<Vec<_>>()
        .join(".")
}

/// Build an AST identifier, quoting only when required.
pub fn ident(name: &str) -> Ident {
    if needs_quoting(name) {
        Ident::with_quote('"', name)
    } else {
        Ident::new(name)
    }
}

/// The identifier values of an object name, quoting stripped.
pub fn object_name_values(name: &ObjectName) -> Vec<&str> {
    name.0.iter().map(|i| i.value.as_str()).collect()
}

/// A bounded excerpt of the input, safe to embed in error messages.
pub fn excerpt(sql: &str) -> String {
    const LIMIT: usize = 120;
    let trimmed = sql.trim();
    if trimmed.len() <= LIMIT {
        return format!("'{trimmed}'");
    }
    let mut end = LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("'{}…'", &trimmed[..end])
}
