use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
pub struct CreateUser {
    pub email: String,
    pub password_hash: String,
}

impl User {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateUser,
        id: Uuid,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "INSERT INTO users (id, email, password_hash)
             VALUES ($1, $2, $3)
             RETURNING id, email, password_hash, created_at",
        )
        .bind(id)
        .bind(&data.email)
        .bind(&data.password_hash)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_email(
        pool: &SqlitePool,
        email: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            "SELECT id, email, password_hash, created_at FROM users WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DBService;

    #[tokio::test]
    async fn create_and_find() {
        let db = DBService::new_in_memory().await.expect("db");
        let user = User::create(
            &db.pool,
            &CreateUser {
                email: "a@example.com".to_string(),
                password_hash: "hash".to_string(),
            },
            Uuid::new_v4(),
        )
        .await
        .expect("create");

        let by_email = User::find_by_email(&db.pool, "a@example.com")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(by_email.id, user.id);
        assert!(
            User::find_by_email(&db.pool, "missing@example.com")
                .await
                .expect("query")
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let db = DBService::new_in_memory().await.expect("db");
        let data = CreateUser {
            email: "a@example.com".to_string(),
            password_hash: "hash".to_string(),
        };
        User::create(&db.pool, &data, Uuid::new_v4()).await.expect("create");
        assert!(User::create(&db.pool, &data, Uuid::new_v4()).await.is_err());
    }
}
