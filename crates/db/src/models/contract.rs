use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool, Type};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "contract_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Generating,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Contract {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub prompt: String,
    pub content: Option<String>,
    pub status: ContractStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateContract {
    pub user_id: Uuid,
    pub title: String,
    pub prompt: String,
}

#[derive(Debug, Default, Deserialize, TS)]
pub struct UpdateContract {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<ContractStatus>,
    pub completed_at: Option<DateTime<Utc>>,
}

const CONTRACT_COLUMNS: &str =
    "id, user_id, title, prompt, content, status, created_at, completed_at, updated_at";

impl Contract {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateContract,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Contract>(&format!(
            "INSERT INTO contracts (id, user_id, title, prompt, status)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {CONTRACT_COLUMNS}"
        ))
        .bind(id)
        .bind(data.user_id)
        .bind(&data.title)
        .bind(&data.prompt)
        .bind(ContractStatus::Generating)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Contract>(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    /// The caller's contracts, newest first. The id tiebreak keeps pages
    /// stable when rows share a creation timestamp.
    pub async fn find_for_user(
        pool: &SqlitePool,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Contract>(&format!(
            "SELECT {CONTRACT_COLUMNS} FROM contracts
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Partial update. `completed_at` is kept consistent with the status: it
    /// is only ever set while the contract is completed.
    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        data: &UpdateContract,
    ) -> Result<Option<Self>, sqlx::Error> {
        let Some(existing) = Self::find_by_id(pool, id).await? else {
            return Ok(None);
        };

        let title = data.title.clone().unwrap_or(existing.title);
        let content = data.content.clone().or(existing.content);
        let status = data.status.unwrap_or(existing.status);
        let completed_at = match status {
            ContractStatus::Completed => data
                .completed_at
                .or(existing.completed_at)
                .or_else(|| Some(Utc::now())),
            _ => None,
        };

        sqlx::query_as::<_, Contract>(&format!(
            "UPDATE contracts
             SET title = $2,
                 content = $3,
                 status = $4,
                 completed_at = $5,
                 updated_at = datetime('now', 'subsec')
             WHERE id = $1
             RETURNING {CONTRACT_COLUMNS}"
        ))
        .bind(id)
        .bind(title)
        .bind(content)
        .bind(status)
        .bind(completed_at)
        .fetch_optional(pool)
        .await
    }

    /// Overwrites the accumulated content without touching the status. Used
    /// for the throttled mid-generation flushes; a missing row is reported as
    /// `false` so best-effort cleanup stays safe.
    pub async fn update_content(
        pool: &SqlitePool,
        id: Uuid,
        content: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE contracts
             SET content = $2, updated_at = datetime('now', 'subsec')
             WHERE id = $1",
        )
        .bind(id)
        .bind(content)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn complete(pool: &SqlitePool, id: Uuid, content: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE contracts
             SET content = $2,
                 status = $3,
                 completed_at = datetime('now', 'subsec'),
                 updated_at = datetime('now', 'subsec')
             WHERE id = $1",
        )
        .bind(id)
        .bind(content)
        .bind(ContractStatus::Completed)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Marks the contract cancelled, optionally overwriting the content with
    /// whatever partial text accumulated before the cancellation.
    pub async fn cancel(
        pool: &SqlitePool,
        id: Uuid,
        partial_content: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE contracts
             SET status = $2,
                 content = COALESCE($3, content),
                 updated_at = datetime('now', 'subsec')
             WHERE id = $1",
        )
        .bind(id)
        .bind(ContractStatus::Cancelled)
        .bind(partial_content)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Creates an edited version as a brand-new completed row. The original
    /// row is left untouched; history is append-only.
    pub async fn create_version(
        pool: &SqlitePool,
        original_id: Uuid,
        content: &str,
        user_id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        Self::create_version_as(pool, original_id, content, user_id, ContractStatus::Completed)
            .await
    }

    /// Version creation with an explicit status, used to preserve partial
    /// edit output as a cancelled row. Returns `None` when the original no
    /// longer exists.
    pub async fn create_version_as(
        pool: &SqlitePool,
        original_id: Uuid,
        content: &str,
        user_id: Uuid,
        status: ContractStatus,
    ) -> Result<Option<Self>, sqlx::Error> {
        let Some(original) = Self::find_by_id(pool, original_id).await? else {
            return Ok(None);
        };

        let completed_at = match status {
            ContractStatus::Completed => Some(Utc::now()),
            _ => None,
        };

        let version = sqlx::query_as::<_, Contract>(&format!(
            "INSERT INTO contracts (id, user_id, title, prompt, content, status, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {CONTRACT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(format!("{} (Edited)", original.title))
        .bind(&original.prompt)
        .bind(content)
        .bind(status)
        .bind(completed_at)
        .fetch_one(pool)
        .await?;
        Ok(Some(version))
    }
}
