//! Generic resolve-or-create of rows by their natural key.

use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnection};
use sqlx::{Row, Sqlite};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Float(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Null => query.bind(Option::<String>::None),
    }
}

async fn find_id(
    conn: &mut SqliteConnection,
    table: &str,
    keys: &[(&str, SqlValue)],
) -> Result<Option<i64>, sqlx::Error> {
    let predicate = keys
        .iter()
        .map(|(column, _)| format!("{column} IS ?"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let sql = format!("SELECT id FROM {table} WHERE {predicate} ORDER BY id LIMIT 1");
    let mut query = sqlx::query(&sql);
    for (_, value) in keys {
        query = bind_value(query, value);
    }
    let row = query.fetch_optional(&mut *conn).await?;
    row.map(|row| row.try_get::<i64, _>(0)).transpose()
}

/// Id of the row in `table` whose `keys` columns match, inserting it (with
/// `defaults` for the remaining columns) when absent. Existing rows are never
/// updated. `NULL` key values match `NULL` columns.
///
/// Table and column names are trusted identifiers; values are always bound.
pub async fn upsert_by_natural_key(
    conn: &mut SqliteConnection,
    table: &str,
    keys: &[(&str, SqlValue)],
    defaults: &[(&str, SqlValue)],
) -> Result<i64, sqlx::Error> {
    if let Some(id) = find_id(conn, table, keys).await? {
        return Ok(id);
    }

    let columns: Vec<&str> = keys.iter().chain(defaults).map(|(column, _)| *column).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT DO NOTHING",
        columns.join(", ")
    );
    let mut query = sqlx::query(&sql);
    for (_, value) in keys.iter().chain(defaults) {
        query = bind_value(query, value);
    }
    let result = query.execute(&mut *conn).await?;
    if result.rows_affected() == 1 {
        return Ok(result.last_insert_rowid());
    }

    // Lost a race with a matching row, or a unique column clashed.
    find_id(conn, table, keys)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::{connect_in_memory, run_migrations};

    #[tokio::test]
    async fn repeated_calls_resolve_to_the_same_row() {
        let pool = connect_in_memory().await.expect("pool");
        run_migrations(&pool).await.expect("migrate");
        let mut tx = pool.begin().await.expect("tx");

        let first = upsert_by_natural_key(
            &mut tx,
            "companies",
            &[("name", "Acme".into())],
            &[("logo_url", "https://cdn.example/a.png".into())],
        )
        .await
        .expect("insert");
        let second = upsert_by_natural_key(
            &mut tx,
            "companies",
            &[("name", "Acme".into())],
            &[("logo_url", "https://cdn.example/other.png".into())],
        )
        .await
        .expect("lookup");
        assert_eq!(first, second);

        let logo: String = sqlx::query("SELECT logo_url FROM companies WHERE id = ?")
            .bind(first)
            .fetch_one(&mut *tx)
            .await
            .expect("row")
            .get(0);
        assert_eq!(logo, "https://cdn.example/a.png");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn null_key_values_match_null_columns() {
        let pool = connect_in_memory().await.expect("pool");
        run_migrations(&pool).await.expect("migrate");
        let mut conn = pool.acquire().await.expect("conn");

        let keys = [("code", SqlValue::from("en")), ("level", SqlValue::from(None::<String>))];
        let a = upsert_by_natural_key(&mut conn, "languages", &keys, &[]).await.expect("a");
        let b = upsert_by_natural_key(&mut conn, "languages", &keys, &[]).await.expect("b");
        let c = upsert_by_natural_key(
            &mut conn,
            "languages",
            &[("code", "en".into()), ("level", "C1".into())],
            &[],
        )
        .await
        .expect("c");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
