//! Export queries
//!
//! Builds the COUNT and page queries for one export from a single shared
//! predicate, so the persisted `total_rows` and the streamed rows cannot
//! drift apart under concurrent writes. Pages are offset-based with the
//! stable ordering `created_at ASC, id ASC`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::JobResult;
use crate::jobs::models::{ExportFilters, ResourceType};

/// One export's resource kind plus its filter set.
pub struct ExportQuery {
    resource_type: ResourceType,
    filters: ExportFilters,
}

impl ExportQuery {
    pub fn new(resource_type: ResourceType, filters: Option<ExportFilters>) -> Self {
        Self {
            resource_type,
            filters: filters.unwrap_or_default(),
        }
    }

    /// Row count under the same predicate the pages use.
    pub async fn count(&self, pool: &PgPool) -> JobResult<i64> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {}",
            self.resource_type.table_name()
        ));
        self.push_predicate(&mut qb);
        let (count,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
        Ok(count)
    }

    /// Fetch one page as export records (renamed, export-ready field names).
    pub async fn fetch_page(
        &self,
        pool: &PgPool,
        limit: i64,
        offset: i64,
    ) -> JobResult<Vec<Map<String, Value>>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM {}",
            self.columns(),
            self.resource_type.table_name()
        ));
        self.push_predicate(&mut qb);
        qb.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb.build().fetch_all(pool).await?;
        rows.iter()
            .map(|row| self.row_to_record(row).map_err(Into::into))
            .collect()
    }

    fn columns(&self) -> &'static str {
        match self.resource_type {
            ResourceType::Users => "id, email, name, role, active, created_at, updated_at",
            ResourceType::Articles => {
                "id, slug, title, body, author_id, tags, status, published_at, created_at, updated_at"
            },
            ResourceType::Comments => "id, article_id, user_id, body, created_at, updated_at",
        }
    }

    /// The shared WHERE clause. Filters that do not apply to the resource
    /// kind are ignored; rejecting them is the HTTP layer's concern.
    fn push_predicate<'a>(&'a self, qb: &mut QueryBuilder<'a, Postgres>) {
        let f = &self.filters;
        qb.push(" WHERE 1=1");

        if let Some(ids) = &f.ids {
            qb.push(" AND id = ANY(");
            qb.push_bind(ids);
            qb.push(")");
        }
        if let Some(t) = f.created_after {
            qb.push(" AND created_at > ");
            qb.push_bind(t);
        }
        if let Some(t) = f.created_before {
            qb.push(" AND created_at < ");
            qb.push_bind(t);
        }
        if let Some(t) = f.updated_after {
            qb.push(" AND updated_at > ");
            qb.push_bind(t);
        }
        if let Some(t) = f.updated_before {
            qb.push(" AND updated_at < ");
            qb.push_bind(t);
        }

        match self.resource_type {
            ResourceType::Users => {
                if let Some(active) = f.active {
                    qb.push(" AND active = ");
                    qb.push_bind(active);
                }
            },
            ResourceType::Articles => {
                if let Some(status) = &f.status {
                    qb.push(" AND status = ");
                    qb.push_bind(status);
                }
                if let Some(author_id) = f.author_id {
                    qb.push(" AND author_id = ");
                    qb.push_bind(author_id);
                }
            },
            ResourceType::Comments => {
                if let Some(article_id) = f.article_id {
                    qb.push(" AND article_id = ");
                    qb.push_bind(article_id);
                }
                if let Some(user_id) = f.user_id {
                    qb.push(" AND user_id = ");
                    qb.push_bind(user_id);
                }
            },
        }
    }

    fn row_to_record(&self, row: &PgRow) -> Result<Map<String, Value>, sqlx::Error> {
        let mut record = Map::new();
        match self.resource_type {
            ResourceType::Users => {
                put_uuid(&mut record, "id", row.try_get("id")?);
                put_str(&mut record, "email", row.try_get("email")?);
                put_str(&mut record, "name", row.try_get("name")?);
                put_str(&mut record, "role", row.try_get("role")?);
                record.insert("active".to_string(), Value::Bool(row.try_get("active")?));
                put_time(&mut record, "created_at", row.try_get("created_at")?);
                put_time(&mut record, "updated_at", row.try_get("updated_at")?);
            },
            ResourceType::Articles => {
                put_uuid(&mut record, "id", row.try_get("id")?);
                put_str(&mut record, "slug", row.try_get("slug")?);
                put_str(&mut record, "title", row.try_get("title")?);
                put_str(&mut record, "body", row.try_get("body")?);
                put_uuid(&mut record, "author_id", row.try_get("author_id")?);
                let tags: sqlx::types::Json<Vec<String>> = row.try_get("tags")?;
                record.insert(
                    "tags".to_string(),
                    Value::Array(tags.0.into_iter().map(Value::String).collect()),
                );
                put_str(&mut record, "status", row.try_get("status")?);
                put_opt_time(&mut record, "published_at", row.try_get("published_at")?);
                put_time(&mut record, "created_at", row.try_get("created_at")?);
                put_time(&mut record, "updated_at", row.try_get("updated_at")?);
            },
            ResourceType::Comments => {
                put_uuid(&mut record, "id", row.try_get("id")?);
                put_uuid(&mut record, "article_id", row.try_get("article_id")?);
                put_uuid(&mut record, "user_id", row.try_get("user_id")?);
                put_str(&mut record, "body", row.try_get("body")?);
                put_time(&mut record, "created_at", row.try_get("created_at")?);
                put_time(&mut record, "updated_at", row.try_get("updated_at")?);
            },
        }
        Ok(record)
    }
}

/// Restrict a record to the caller's projection list, in list order.
/// Unknown names come out as null so CSV columns stay aligned.
pub fn apply_projection(record: &Map<String, Value>, fields: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    for field in fields {
        out.insert(
            field.clone(),
            record.get(field).cloned().unwrap_or(Value::Null),
        );
    }
    out
}

fn put_uuid(record: &mut Map<String, Value>, key: &str, id: Uuid) {
    record.insert(key.to_string(), Value::String(id.to_string()));
}

fn put_str(record: &mut Map<String, Value>, key: &str, value: String) {
    record.insert(key.to_string(), Value::String(value));
}

fn put_time(record: &mut Map<String, Value>, key: &str, t: DateTime<Utc>) {
    record.insert(
        key.to_string(),
        Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
}

fn put_opt_time(record: &mut Map<String, Value>, key: &str, t: Option<DateTime<Utc>>) {
    record.insert(
        key.to_string(),
        match t {
            Some(t) => Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true)),
            None => Value::Null,
        },
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sql_of(resource_type: ResourceType, filters: ExportFilters) -> String {
        let query = ExportQuery::new(resource_type, Some(filters));
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM t");
        query.push_predicate(&mut qb);
        qb.into_sql()
    }

    #[test]
    fn test_predicate_includes_applicable_filters() {
        let sql = sql_of(
            ResourceType::Users,
            ExportFilters {
                active: Some(true),
                created_after: Some(Utc::now()),
                ..Default::default()
            },
        );
        assert!(sql.contains("active ="));
        assert!(sql.contains("created_at >"));
    }

    #[test]
    fn test_predicate_ignores_inapplicable_filters() {
        // Article/comment filters on a users export are silently dropped.
        let sql = sql_of(
            ResourceType::Users,
            ExportFilters {
                status: Some("published".to_string()),
                article_id: Some(Uuid::new_v4()),
                ..Default::default()
            },
        );
        assert!(!sql.contains("status ="));
        assert!(!sql.contains("article_id ="));
    }

    #[test]
    fn test_predicate_article_filters() {
        let sql = sql_of(
            ResourceType::Articles,
            ExportFilters {
                status: Some("draft".to_string()),
                author_id: Some(Uuid::new_v4()),
                ids: Some(vec![Uuid::new_v4()]),
                ..Default::default()
            },
        );
        assert!(sql.contains("id = ANY("));
        assert!(sql.contains("status ="));
        assert!(sql.contains("author_id ="));
    }

    #[test]
    fn test_apply_projection_orders_and_fills_nulls() {
        let record = json!({"id": "x", "email": "a@b.c", "name": "Ann"});
        let record = record.as_object().unwrap();
        let projected = apply_projection(
            record,
            &["name".to_string(), "email".to_string(), "missing".to_string()],
        );
        let keys: Vec<&String> = projected.keys().collect();
        assert_eq!(keys, ["name", "email", "missing"]);
        assert_eq!(projected["missing"], Value::Null);
    }
}
