use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use catrec_core::TargetRecord;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::store::{is_safe_identifier, RecordStore, StoreError, TargetFilter};

/// Table layout of the target catalog. Every name must pass
/// [`is_safe_identifier`]; values are always bound as parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgStoreConfig {
    pub table: String,
    pub id_column: String,
    pub title_column: String,
    /// Payload keys copied into columns of the same name on insert.
    pub insert_columns: Vec<String>,
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            table: "books".to_string(),
            id_column: "id".to_string(),
            title_column: "title".to_string(),
            insert_columns: vec!["locator".to_string()],
        }
    }
}

impl PgStoreConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        let names = [&self.table, &self.id_column, &self.title_column]
            .into_iter()
            .chain(self.insert_columns.iter());
        for name in names {
            if !is_safe_identifier(name) {
                return Err(StoreError::Rejected(format!("unsafe SQL identifier '{name}'")));
            }
        }
        Ok(())
    }

    fn select_sql(&self, field: &str, missing_only: bool) -> String {
        let Self {
            table,
            id_column: id,
            title_column: title,
            ..
        } = self;
        let filter = if missing_only {
            format!(" WHERE ({field} IS NULL OR btrim({field}::text) = '')")
        } else {
            String::new()
        };
        format!(
            "SELECT {id}::text AS id, {title}::text AS title, {field}::text AS value \
             FROM {table}{filter} ORDER BY {id} LIMIT $1 OFFSET $2"
        )
    }

    fn update_sql(&self, field: &str) -> String {
        let Self {
            table, id_column: id, ..
        } = self;
        format!(
            "UPDATE {table} SET {field} = $1 WHERE {id}::text = $2 \
             AND ({field} IS NULL OR btrim({field}::text) = '' OR {field}::text = $1)"
        )
    }

    /// Columns and values written for one insert payload: the title, then
    /// every configured insert column the payload carries.
    fn insert_bindings<'a>(
        &'a self,
        payload: &'a BTreeMap<String, String>,
    ) -> Result<(Vec<&'a str>, Vec<&'a str>), StoreError> {
        let title = payload
            .get("title")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| StoreError::Rejected("insert payload has no title".to_string()))?;

        let mut columns = vec![self.title_column.as_str()];
        let mut values = vec![title.as_str()];
        for column in &self.insert_columns {
            if let Some(value) = payload.get(column) {
                columns.push(column.as_str());
                values.push(value.as_str());
            }
        }
        Ok((columns, values))
    }

    fn insert_sql(&self, columns: &[&str]) -> String {
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) RETURNING {}::text",
            self.table,
            columns.join(", "),
            self.id_column
        )
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Backend(anyhow::Error::new(other)),
    }
}

/// PostgreSQL-backed target catalog.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    config: PgStoreConfig,
}

impl PgStore {
    pub async fn connect(
        url: &str,
        config: PgStoreConfig,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(map_sqlx)?;
        Ok(Self { pool, config })
    }

    fn check_field(field: &str) -> Result<(), StoreError> {
        if is_safe_identifier(field) {
            Ok(())
        } else {
            Err(StoreError::Rejected(format!("unsafe SQL identifier '{field}'")))
        }
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn fetch_page(
        &self,
        filter: &TargetFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<TargetRecord>, StoreError> {
        Self::check_field(&filter.field)?;
        let sql = self.config.select_sql(&filter.field, filter.missing_only);
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| -> Result<TargetRecord, StoreError> {
                Ok(TargetRecord {
                    id: row.try_get::<String, _>("id").map_err(map_sqlx)?,
                    title: row
                        .try_get::<Option<String>, _>("title")
                        .map_err(map_sqlx)?
                        .unwrap_or_default(),
                    existing_value: row.try_get::<Option<String>, _>("value").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    async fn apply(&self, id: &str, field: &str, value: &str) -> Result<(), StoreError> {
        Self::check_field(field)?;
        let sql = self.config.update_sql(field);
        let done = sqlx::query(&sql)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        if done.rows_affected() > 0 {
            return Ok(());
        }

        let exists_sql = format!(
            "SELECT 1 FROM {} WHERE {}::text = $1",
            self.config.table, self.config.id_column
        );
        let exists = sqlx::query(&exists_sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .is_some();
        if exists {
            Err(StoreError::Conflict {
                id: id.to_string(),
                field: field.to_string(),
            })
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    async fn insert(&self, payload: &BTreeMap<String, String>) -> Result<String, StoreError> {
        let (columns, values) = self.config.insert_bindings(payload)?;
        let sql = self.config.insert_sql(&columns);
        let mut query = sqlx::query(&sql);
        for value in values {
            query = query.bind(value);
        }
        let row = query.fetch_one(&self.pool).await.map_err(map_sqlx)?;
        row.try_get::<String, _>(0).map_err(map_sqlx)
    }

    async fn list_titles(&self) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "SELECT {}::text AS title FROM {} ORDER BY {}",
            self.config.title_column, self.config.table, self.config.id_column
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                row.try_get::<Option<String>, _>("title")
                    .map(Option::unwrap_or_default)
                    .map_err(map_sqlx)
            })
            .collect()
    }
}
