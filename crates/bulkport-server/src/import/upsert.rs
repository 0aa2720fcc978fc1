//! Upsert engine
//!
//! Takes one batch of validated records and lands it in a single database
//! transaction. Each row runs behind its own savepoint so a failing row
//! rolls back alone while the rest of the batch commits; one commit per
//! batch amortizes fsync cost instead of paying it per row.
//!
//! Matching is by natural key: `email` for users, `slug` for articles,
//! `id` for comments. Existing rows get their mutable fields updated;
//! missing rows are inserted (with a generated UUID when the client sent
//! none).

use std::collections::{HashMap, HashSet};

use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::error;
use uuid::Uuid;

use crate::error::{JobError, JobResult};
use crate::jobs::models::RowError;
use crate::validate::{NormalizedArticle, NormalizedComment, NormalizedUser};

/// A validated record plus the input row it came from.
#[derive(Debug, Clone)]
pub struct RowItem<T> {
    pub row: i64,
    pub record: T,
}

/// Counters and errors from one batch.
#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    pub successful: i64,
    pub failed: i64,
    pub skipped: i64,
    pub errors: Vec<RowError>,
}

#[derive(Clone)]
pub struct UpsertEngine {
    pool: PgPool,
}

impl UpsertEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn upsert_users(
        &self,
        batch: Vec<RowItem<NormalizedUser>>,
    ) -> JobResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let rows: Vec<i64> = batch.iter().map(|i| i.row).collect();
        let batch = dedupe_batch(batch, &mut outcome, "email", |r| Some(r.email.clone()));
        if batch.is_empty() {
            return Ok(outcome);
        }
        let result: JobResult<BatchOutcome> = async {
            let mut tx = self.pool.begin().await?;

            let emails: Vec<String> = batch.iter().map(|i| i.record.email.clone()).collect();
            let existing: Vec<(Uuid, String)> =
                sqlx::query_as("SELECT id, email FROM users WHERE email = ANY($1)")
                    .bind(&emails)
                    .fetch_all(&mut *tx)
                    .await?;
            let existing: HashMap<String, Uuid> =
                existing.into_iter().map(|(id, email)| (email, id)).collect();

            for item in &batch {
                let existing_id = existing.get(&item.record.email).copied();
                sqlx::query("SAVEPOINT row_guard").execute(&mut *tx).await?;
                let written = write_user_row(&mut tx, &item.record, existing_id).await;
                settle_row(&mut tx, item.row, written, &["email", "role"], &mut outcome)
                    .await?;
            }

            tx.commit().await?;
            Ok(outcome)
        }
        .await;

        finish_batch(result, &rows)
    }

    // ------------------------------------------------------------------
    // Articles
    // ------------------------------------------------------------------

    pub async fn upsert_articles(
        &self,
        batch: Vec<RowItem<NormalizedArticle>>,
    ) -> JobResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let rows: Vec<i64> = batch.iter().map(|i| i.row).collect();
        let batch = dedupe_batch(batch, &mut outcome, "slug", |r| Some(r.slug.clone()));
        if batch.is_empty() {
            return Ok(outcome);
        }
        let result: JobResult<BatchOutcome> = async {
            let mut tx = self.pool.begin().await?;

            let slugs: Vec<String> = batch.iter().map(|i| i.record.slug.clone()).collect();
            let existing: Vec<(Uuid, String)> =
                sqlx::query_as("SELECT id, slug FROM articles WHERE slug = ANY($1)")
                    .bind(&slugs)
                    .fetch_all(&mut *tx)
                    .await?;
            let existing: HashMap<String, Uuid> =
                existing.into_iter().map(|(id, slug)| (slug, id)).collect();

            // Any user may author an article; only existence matters.
            let author_ids: Vec<Uuid> = batch.iter().map(|i| i.record.author_id).collect();
            let valid_authors = fetch_existing_ids(&mut tx, "users", &author_ids).await?;

            for item in &batch {
                if !valid_authors.contains(&item.record.author_id) {
                    outcome.failed += 1;
                    outcome.errors.push(
                        RowError::new(
                            item.row,
                            Some("author_id".to_string()),
                            "author_id references a missing user",
                        )
                        .with_value(item.record.author_id.to_string()),
                    );
                    continue;
                }
                let existing_id = existing.get(&item.record.slug).copied();
                sqlx::query("SAVEPOINT row_guard").execute(&mut *tx).await?;
                let written = write_article_row(&mut tx, &item.record, existing_id).await;
                settle_row(
                    &mut tx,
                    item.row,
                    written,
                    &["slug", "status", "author_id"],
                    &mut outcome,
                )
                .await?;
            }

            tx.commit().await?;
            Ok(outcome)
        }
        .await;

        finish_batch(result, &rows)
    }

    // ------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------

    pub async fn upsert_comments(
        &self,
        batch: Vec<RowItem<NormalizedComment>>,
    ) -> JobResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let rows: Vec<i64> = batch.iter().map(|i| i.row).collect();
        // Comments match by client-supplied id; rows without one can never
        // collide in-batch.
        let batch = dedupe_batch(batch, &mut outcome, "id", |r| {
            r.id.map(|id| id.to_string())
        });
        if batch.is_empty() {
            return Ok(outcome);
        }
        let result: JobResult<BatchOutcome> = async {
            let mut tx = self.pool.begin().await?;

            let ids: Vec<Uuid> = batch.iter().filter_map(|i| i.record.id).collect();
            let existing = fetch_existing_ids(&mut tx, "comments", &ids).await?;

            let article_ids: Vec<Uuid> = batch.iter().map(|i| i.record.article_id).collect();
            let valid_articles = fetch_existing_ids(&mut tx, "articles", &article_ids).await?;
            let user_ids: Vec<Uuid> = batch.iter().map(|i| i.record.user_id).collect();
            let valid_users = fetch_existing_ids(&mut tx, "users", &user_ids).await?;

            for item in &batch {
                if !valid_articles.contains(&item.record.article_id) {
                    outcome.failed += 1;
                    outcome.errors.push(
                        RowError::new(
                            item.row,
                            Some("article_id".to_string()),
                            "article_id references a missing article",
                        )
                        .with_value(item.record.article_id.to_string()),
                    );
                    continue;
                }
                if !valid_users.contains(&item.record.user_id) {
                    outcome.failed += 1;
                    outcome.errors.push(
                        RowError::new(
                            item.row,
                            Some("user_id".to_string()),
                            "user_id references a missing user",
                        )
                        .with_value(item.record.user_id.to_string()),
                    );
                    continue;
                }

                let exists = item
                    .record
                    .id
                    .map(|id| existing.contains(&id))
                    .unwrap_or(false);
                sqlx::query("SAVEPOINT row_guard").execute(&mut *tx).await?;
                let written = write_comment_row(&mut tx, &item.record, exists).await;
                settle_row(
                    &mut tx,
                    item.row,
                    written,
                    &["id", "article_id", "user_id"],
                    &mut outcome,
                )
                .await?;
            }

            tx.commit().await?;
            Ok(outcome)
        }
        .await;

        finish_batch(result, &rows)
    }
}

// ----------------------------------------------------------------------
// Row writes
// ----------------------------------------------------------------------

async fn write_user_row(
    tx: &mut Transaction<'_, Postgres>,
    r: &NormalizedUser,
    existing_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    match existing_id {
        Some(id) => {
            sqlx::query(
                r#"
                UPDATE users
                SET name = $2, role = $3, active = $4, updated_at = COALESCE($5, NOW())
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&r.name)
            .bind(r.role.as_str())
            .bind(r.active)
            .bind(r.updated_at)
            .execute(&mut **tx)
            .await?;
        },
        None => {
            sqlx::query(
                r#"
                INSERT INTO users (id, email, name, role, active, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()), COALESCE($7, NOW()))
                "#,
            )
            .bind(r.id.unwrap_or_else(Uuid::new_v4))
            .bind(&r.email)
            .bind(&r.name)
            .bind(r.role.as_str())
            .bind(r.active)
            .bind(r.created_at)
            .bind(r.updated_at)
            .execute(&mut **tx)
            .await?;
        },
    }
    Ok(())
}

async fn write_article_row(
    tx: &mut Transaction<'_, Postgres>,
    r: &NormalizedArticle,
    existing_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    match existing_id {
        Some(id) => {
            sqlx::query(
                r#"
                UPDATE articles
                SET title = $2, body = $3, author_id = $4, tags = $5,
                    status = $6, published_at = $7, updated_at = COALESCE($8, NOW())
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&r.title)
            .bind(&r.body)
            .bind(r.author_id)
            .bind(Json(&r.tags))
            .bind(r.status.as_str())
            .bind(r.published_at)
            .bind(r.updated_at)
            .execute(&mut **tx)
            .await?;
        },
        None => {
            sqlx::query(
                r#"
                INSERT INTO articles
                    (id, slug, title, body, author_id, tags, status, published_at,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                        COALESCE($9, NOW()), COALESCE($10, NOW()))
                "#,
            )
            .bind(r.id.unwrap_or_else(Uuid::new_v4))
            .bind(&r.slug)
            .bind(&r.title)
            .bind(&r.body)
            .bind(r.author_id)
            .bind(Json(&r.tags))
            .bind(r.status.as_str())
            .bind(r.published_at)
            .bind(r.created_at)
            .bind(r.updated_at)
            .execute(&mut **tx)
            .await?;
        },
    }
    Ok(())
}

async fn write_comment_row(
    tx: &mut Transaction<'_, Postgres>,
    r: &NormalizedComment,
    exists: bool,
) -> Result<(), sqlx::Error> {
    if exists {
        sqlx::query(
            r#"
            UPDATE comments
            SET body = $2, article_id = $3, user_id = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(r.id.unwrap_or_default())
        .bind(&r.body)
        .bind(r.article_id)
        .bind(r.user_id)
        .execute(&mut **tx)
        .await?;
    } else {
        sqlx::query(
            r#"
            INSERT INTO comments (id, article_id, user_id, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, COALESCE($5, NOW()), NOW())
            "#,
        )
        .bind(r.id.unwrap_or_else(Uuid::new_v4))
        .bind(r.article_id)
        .bind(r.user_id)
        .bind(&r.body)
        .bind(r.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Shared plumbing
// ----------------------------------------------------------------------

/// In-batch duplicate detection; rows whose key is `None` always pass.
fn dedupe_batch<T>(
    batch: Vec<RowItem<T>>,
    outcome: &mut BatchOutcome,
    field: &str,
    key: impl Fn(&T) -> Option<String>,
) -> Vec<RowItem<T>> {
    let mut first_seen: HashMap<String, i64> = HashMap::new();
    let mut kept = Vec::with_capacity(batch.len());

    for item in batch {
        match key(&item.record) {
            Some(k) => match first_seen.get(&k) {
                Some(first_row) => {
                    outcome.failed += 1;
                    outcome.errors.push(
                        RowError::new(
                            item.row,
                            Some(field.to_string()),
                            format!(
                                "Duplicate {} in import file: {} (first seen on row {})",
                                field, k, first_row
                            ),
                        )
                        .with_value(k),
                    );
                },
                None => {
                    first_seen.insert(k, item.row);
                    kept.push(item);
                },
            },
            None => kept.push(item),
        }
    }

    kept
}

async fn fetch_existing_ids(
    tx: &mut Transaction<'_, Postgres>,
    table: &str,
    ids: &[Uuid],
) -> Result<HashSet<Uuid>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows: Vec<(Uuid,)> =
        sqlx::query_as(&format!("SELECT id FROM {} WHERE id = ANY($1)", table))
            .bind(ids)
            .fetch_all(&mut **tx)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Settle one row after its write attempt: release the savepoint on
/// success, roll back to it and record the classified error otherwise.
/// Only errors meaning the connection itself is gone propagate.
async fn settle_row(
    tx: &mut Transaction<'_, Postgres>,
    row: i64,
    written: Result<(), sqlx::Error>,
    candidate_fields: &[&str],
    outcome: &mut BatchOutcome,
) -> JobResult<()> {
    match written {
        Ok(()) => {
            sqlx::query("RELEASE SAVEPOINT row_guard")
                .execute(&mut **tx)
                .await?;
            outcome.successful += 1;
        },
        Err(e) if is_connection_fatal(&e) => return Err(e.into()),
        Err(e) => {
            sqlx::query("ROLLBACK TO SAVEPOINT row_guard")
                .execute(&mut **tx)
                .await?;
            let (field, message) = classify_db_error(&e, candidate_fields);
            outcome.failed += 1;
            outcome.errors.push(RowError::new(row, field, message));
        },
    }
    Ok(())
}

/// True when the error means the connection or transaction is unusable, so
/// the whole batch must fail rather than the row.
fn is_connection_fatal(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}

/// Map a per-row database error onto a field and message.
fn classify_db_error(e: &sqlx::Error, candidate_fields: &[&str]) -> (Option<String>, String) {
    if let sqlx::Error::Database(db) = e {
        let constraint = db.constraint().unwrap_or_default().to_lowercase();
        let field = candidate_fields
            .iter()
            .find(|f| constraint.contains(**f))
            .map(|f| f.to_string());

        return match db.code().as_deref() {
            // unique_violation: almost always the natural key under race
            Some("23505") => (
                field.or_else(|| candidate_fields.first().map(|f| f.to_string())),
                "already exists (unique constraint)".to_string(),
            ),
            // foreign_key_violation: a referenced row vanished after the
            // pre-check
            Some("23503") => (field, "referenced record no longer exists".to_string()),
            // check_violation / invalid input for an enum-like column
            Some("23514") | Some("22P02") => (field, format!("invalid value: {}", db.message())),
            _ => (None, db.message().to_string()),
        };
    }
    (None, e.to_string())
}

/// Turn a transaction-level failure into a whole-batch failure outcome;
/// connection-level failures keep propagating.
fn finish_batch(result: JobResult<BatchOutcome>, rows: &[i64]) -> JobResult<BatchOutcome> {
    match result {
        Ok(outcome) => Ok(outcome),
        Err(JobError::Database(e)) if !is_connection_fatal(&e) => {
            error!(error = %e, "batch transaction failed, all rows counted as failed");
            let mut outcome = BatchOutcome {
                failed: rows.len() as i64,
                ..Default::default()
            };
            outcome.errors.push(RowError::new(
                rows.first().copied().unwrap_or(0),
                None,
                format!("batch transaction failed: {}", e),
            ));
            Ok(outcome)
        },
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::validate::UserRole;

    fn user(row: i64, email: &str) -> RowItem<NormalizedUser> {
        RowItem {
            row,
            record: NormalizedUser {
                id: None,
                email: email.to_string(),
                name: format!("User {}", row),
                role: UserRole::Reader,
                active: true,
                created_at: None,
                updated_at: None,
            },
        }
    }

    #[test]
    fn test_dedupe_flags_second_occurrence() {
        let mut outcome = BatchOutcome::default();
        let batch = vec![
            user(1, "alice@example.com"),
            user(2, "bob@example.com"),
            user(3, "alice@example.com"),
        ];
        let kept = dedupe_batch(batch, &mut outcome, "email", |r| Some(r.email.clone()));

        assert_eq!(kept.len(), 2);
        assert_eq!(outcome.failed, 1);
        let err = &outcome.errors[0];
        assert_eq!(err.row, 3);
        assert_eq!(err.field.as_deref(), Some("email"));
        assert!(err
            .message
            .contains("Duplicate email in import file: alice@example.com (first seen on row 1)"));
    }

    #[test]
    fn test_dedupe_passes_keyless_rows() {
        let mut outcome = BatchOutcome::default();
        let batch = vec![user(1, "a@b.c"), user(2, "d@e.f")];
        let kept = dedupe_batch(batch, &mut outcome, "id", |_| None);
        assert_eq!(kept.len(), 2);
        assert_eq!(outcome.failed, 0);
    }

    #[test]
    fn test_classify_non_database_error_is_generic() {
        let (field, message) = classify_db_error(&sqlx::Error::RowNotFound, &["email"]);
        assert!(field.is_none());
        assert!(!message.is_empty());
    }

    #[test]
    fn test_finish_batch_absorbs_transaction_error() {
        let rows = vec![5, 6, 7];
        let result = finish_batch(Err(JobError::Database(sqlx::Error::RowNotFound)), &rows);
        let outcome = result.unwrap();
        assert_eq!(outcome.failed, 3);
        assert_eq!(outcome.successful, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].row, 5);
    }

    #[test]
    fn test_finish_batch_propagates_connection_loss() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "gone",
        ));
        let result = finish_batch(Err(JobError::Database(io)), &[1]);
        assert!(result.is_err());
    }
}
