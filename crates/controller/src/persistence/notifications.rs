use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub device_id: Option<Uuid>,
    pub level: String,
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_notification(
    pool: &Db,
    device_id: Option<Uuid>,
    level: &str,
    kind: &str,
    message: &str,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO notifications (id, device_id, level, kind, message)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(id)
    .bind(device_id)
    .bind(level)
    .bind(kind)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn list_notifications(pool: &Db, kind: &str) -> Result<Vec<NotificationRecord>> {
    let records = sqlx::query_as::<_, NotificationRecord>(
        r#"
        SELECT id, device_id, level, kind, message, created_at
        FROM notifications
        WHERE kind = ?1
        ORDER BY created_at, id
        "#,
    )
    .bind(kind)
    .fetch_all(pool)
    .await?;
    Ok(records)
}
