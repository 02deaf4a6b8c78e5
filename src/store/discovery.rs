//! Backing-table discovery.
//!
//! A table qualifies as a backing table iff it exposes all required columns,
//! matched case-insensitively. Discovery runs once at startup.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbBackend, FromQueryResult, Statement};

use crate::error::AppResult;
use crate::store::REQUIRED_COLUMNS;

#[derive(Debug, FromQueryResult)]
struct NameRow {
    name: String,
}

/// List the tables of `db` that can store cached responses.
///
/// # Errors
///
/// Returns `AppError::Storage` when introspection fails.
pub async fn response_tables(db: &DatabaseConnection) -> AppResult<Vec<String>> {
    let rows = db
        .query_all(Statement::from_string(
            DbBackend::Sqlite,
            "SELECT name FROM sqlite_schema WHERE type = 'table' ORDER BY name",
        ))
        .await?;

    let mut tables = Vec::new();
    for row in rows {
        let Ok(NameRow { name }) = NameRow::from_query_result(&row, "") else {
            continue;
        };
        if is_response_table(db, &name).await? {
            tables.push(name);
        }
    }
    Ok(tables)
}

async fn is_response_table(db: &DatabaseConnection, table: &str) -> AppResult<bool> {
    let rows = db
        .query_all(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT lower(name) AS name FROM pragma_table_info(?)",
            [table.into()],
        ))
        .await?;

    let columns: Vec<String> = rows
        .iter()
        .filter_map(|row| NameRow::from_query_result(row, "").ok())
        .map(|row| row.name)
        .collect();

    Ok(REQUIRED_COLUMNS
        .iter()
        .all(|required| columns.iter().any(|c| c == required)))
}
