use async_trait::async_trait;
use sqlx::PgPool;

use herald_common::types::{NotificationKind, NotificationRecord};

use super::{MembershipDirectory, NotificationSink, PreferenceLookup, RecipientDirectory};

/// PostgreSQL-backed collaborators sharing one pool.
#[derive(Clone)]
pub struct PgCollaborators {
    pool: PgPool,
}

impl PgCollaborators {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgCollaborators {
    async fn persist(&self, record: &NotificationRecord) -> anyhow::Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO notifications (id, user_id, tenant_id, kind, title, body, data, message_id, delivered_live, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.tenant_id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.data)
        .bind(&record.message_id)
        .bind(record.delivered_live)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(message_id = %record.message_id, "Notification already persisted");
        }
        Ok(())
    }
}

#[async_trait]
impl PreferenceLookup for PgCollaborators {
    async fn live_delivery_enabled(&self, user_id: &str, kind: NotificationKind) -> anyhow::Result<bool> {
        // A kind-specific row wins over the user's '*' row.
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT live_delivery FROM notification_preferences
            WHERE user_id = $1 AND kind IN ($2, '*')
            ORDER BY kind = '*'
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_none_or(|(enabled,)| enabled))
    }
}

#[async_trait]
impl RecipientDirectory for PgCollaborators {
    async fn user_id_by_email(&self, email: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT id FROM users WHERE lower(email) = lower($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn friendship_counterpart(
        &self,
        friendship_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT CASE WHEN requester_id = $2 THEN addressee_id ELSE requester_id END
            FROM friendships
            WHERE id = $1 AND $2 IN (requester_id, addressee_id)
            "#,
        )
        .bind(friendship_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }
}

#[async_trait]
impl MembershipDirectory for PgCollaborators {
    async fn tenants_of(&self, user_id: &str) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT company_id FROM company_members WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
