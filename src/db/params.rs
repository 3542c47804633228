//! Parameter binding and bulk VALUES expansion.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

/// Placeholder in bulk insert statements that receives the expanded rows.
pub const VALUES_PLACEHOLDER: &str = "%s";

pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// One page of a bulk insert: the statement text and its flattened parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValuesPage<'a> {
    pub sql: String,
    pub params: Vec<&'a QueryParam>,
}

/// Expand `INSERT ... VALUES %s` into multi-row statements of at most
/// `page_size` rows each.
///
/// PostgreSQL placeholders are numbered from `$1` within each page; MySQL and
/// SQLite use `?`.
pub(crate) fn expand_values<'a>(
    sql: &str,
    rows: &'a [Vec<QueryParam>],
    page_size: usize,
    db_type: DatabaseType,
) -> DbResult<Vec<ValuesPage<'a>>> {
    let mut parts = sql.split(VALUES_PLACEHOLDER);
    let (head, tail) = match (parts.next(), parts.next(), parts.next()) {
        (Some(head), Some(tail), None) => (head, tail),
        _ => {
            return Err(DbError::invalid_input(format!(
                "Bulk statement must contain exactly one '{}' placeholder",
                VALUES_PLACEHOLDER
            )));
        }
    };
    if page_size == 0 {
        return Err(DbError::invalid_input("page_size must be greater than 0"));
    }

    let arity = match rows.first() {
        Some(first) if !first.is_empty() => first.len(),
        Some(_) => return Err(DbError::invalid_input("Rows must contain at least one value")),
        None => return Ok(Vec::new()),
    };
    if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != arity) {
        return Err(DbError::invalid_input(format!(
            "Row {} has {} values, expected {}",
            idx,
            row.len(),
            arity
        )));
    }

    let pages = rows
        .chunks(page_size)
        .map(|chunk| {
            let mut n = 0usize;
            let tuples: Vec<String> = chunk
                .iter()
                .map(|row| {
                    let marks: Vec<String> = row
                        .iter()
                        .map(|_| {
                            n += 1;
                            match db_type {
                                DatabaseType::PostgreSQL => format!("${}", n),
                                _ => "?".to_string(),
                            }
                        })
                        .collect();
                    format!("({})", marks.join(", "))
                })
                .collect();
            ValuesPage {
                sql: format!("{}{}{}", head, tuples.join(", "), tail),
                params: chunk.iter().flatten().collect(),
            }
        })
        .collect();

    Ok(pages)
}
