//! SQL statement construction for the generic CRUD operations.
//!
//! Table and column names are always quoted. Selection clauses come from
//! provider code and are passed through with bound arguments.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::types::{Row, Selection, Values};
use crate::{ProviderError, ProviderResult};

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name (`schema.table`).
pub fn qualified_table(schema: Option<&str>, table: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(table),
    }
}

/// Check a comma-separated `column [ASC|DESC]` list and return it quoted.
pub fn validate_order_by(order_by: &str) -> ProviderResult<String> {
    let mut terms = Vec::new();
    for raw in order_by.split(',') {
        let mut parts = raw.split_whitespace();
        let column = parts
            .next()
            .ok_or_else(|| ProviderError::InvalidOperation(format!("empty ORDER BY term in {order_by:?}")))?;
        let direction = match parts.next() {
            None => None,
            Some(d) if d.eq_ignore_ascii_case("asc") => Some("ASC"),
            Some(d) if d.eq_ignore_ascii_case("desc") => Some("DESC"),
            Some(other) => {
                return Err(ProviderError::InvalidOperation(format!(
                    "unsupported ORDER BY direction {other:?}"
                )))
            }
        };
        if parts.next().is_some() {
            return Err(ProviderError::InvalidOperation(format!(
                "malformed ORDER BY term {raw:?}"
            )));
        }
        match direction {
            Some(direction) => terms.push(format!("{} {}", quote_ident(column), direction)),
            None => terms.push(quote_ident(column)),
        }
    }
    Ok(terms.join(", "))
}

fn where_clause(selection: Option<&Selection>) -> (String, Vec<Value>) {
    match selection {
        Some(s) if !s.clause.trim().is_empty() => (format!(" WHERE {}", s.clause), s.args.clone()),
        _ => (String::new(), Vec::new()),
    }
}

/// Insert one row and return its rowid.
pub fn insert(conn: &Connection, table: &str, values: &Values) -> ProviderResult<i64> {
    if values.is_empty() {
        conn.execute(&format!("INSERT INTO {table} DEFAULT VALUES"), [])?;
        return Ok(conn.last_insert_rowid());
    }

    let columns: Vec<String> = values.keys().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(values.values()))?;
    Ok(conn.last_insert_rowid())
}

/// Update matching rows and return the number changed.
pub fn update(
    conn: &Connection,
    table: &str,
    values: &Values,
    selection: Option<&Selection>,
) -> ProviderResult<usize> {
    if values.is_empty() {
        return Err(ProviderError::InvalidOperation(
            "update without any column values".to_string(),
        ));
    }

    let assignments: Vec<String> = values
        .keys()
        .enumerate()
        .map(|(i, c)| format!("{} = ?{}", quote_ident(c), i + 1))
        .collect();
    let (filter, filter_args) = where_clause(selection);
    let sql = format!("UPDATE {table} SET {}{filter}", assignments.join(", "));

    let args = values.values().cloned().chain(filter_args);
    Ok(conn.execute(&sql, params_from_iter(args))?)
}

/// Delete matching rows and return the number removed.
pub fn delete(conn: &Connection, table: &str, selection: Option<&Selection>) -> ProviderResult<usize> {
    let (filter, args) = where_clause(selection);
    let sql = format!("DELETE FROM {table}{filter}");
    Ok(conn.execute(&sql, params_from_iter(args))?)
}

/// Run a select and collect every row.
pub fn select(
    conn: &Connection,
    table: &str,
    columns: Option<&[String]>,
    selection: Option<&Selection>,
    order_by: Option<&str>,
) -> ProviderResult<Vec<Row>> {
    let projection = match columns {
        Some(columns) if !columns.is_empty() => columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    };
    let (filter, args) = where_clause(selection);
    let ordering = match order_by {
        Some(order_by) if !order_by.trim().is_empty() => {
            format!(" ORDER BY {}", validate_order_by(order_by)?)
        }
        _ => String::new(),
    };
    let sql = format!("SELECT {projection} FROM {table}{filter}{ordering}");

    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt.query_map(params_from_iter(args), |row| {
        let mut out = Row::new();
        for (i, name) in names.iter().enumerate() {
            out.insert(name.clone(), row.get::<_, Value>(i)?);
        }
        Ok(out)
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}
