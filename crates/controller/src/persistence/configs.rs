use chrono::{DateTime, Utc};
use common::api::ConfigStatus;
use sqlx::types::Json;
use sqlx::{FromRow, Sqlite, Transaction};
use uuid::Uuid;

use super::{ContextVars, Db};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct ConfigRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub backend: String,
    #[sqlx(rename = "config_json")]
    pub config: Json<serde_json::Value>,
    #[sqlx(rename = "context_json")]
    pub context: Json<ContextVars>,
    #[sqlx(try_from = "String")]
    pub status: ConfigStatus,
    pub error_reason: String,
    pub checksum: Option<String>,
    pub deactivated_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewConfig {
    pub id: Uuid,
    pub device_id: Uuid,
    pub backend: String,
    pub config: serde_json::Value,
    pub context: ContextVars,
}

/// Content columns written back after a mutation was compiled.
#[derive(Debug, Clone)]
pub struct ConfigContentUpdate<'a> {
    pub backend: &'a str,
    pub config: &'a serde_json::Value,
    pub context: &'a ContextVars,
}

/// Filter used by bulk operations over configs.
#[derive(Debug, Clone, Default)]
pub struct ConfigFilter {
    pub organization_id: Option<Uuid>,
    pub backend: Option<String>,
    pub template_id: Option<Uuid>,
    pub exclude_deactivation: bool,
}

const SELECT_CONFIG: &str = r#"
    SELECT
        c.id,
        c.device_id,
        c.backend,
        c.config_json,
        c.context_json,
        c.status,
        c.error_reason,
        c.checksum,
        c.deactivated_checksum,
        c.created_at,
        c.updated_at
    FROM configs c
"#;

pub async fn create_config_tx(tx: &mut Transaction<'_, Sqlite>, config: &NewConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO configs (id, device_id, backend, config_json, context_json, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(config.id)
    .bind(config.device_id)
    .bind(&config.backend)
    .bind(Json(&config.config))
    .bind(Json(&config.context))
    .bind(ConfigStatus::Modified.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_config(pool: &Db, id: Uuid) -> Result<Option<ConfigRecord>> {
    let record = sqlx::query_as::<_, ConfigRecord>(&format!("{SELECT_CONFIG} WHERE c.id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn get_config_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
) -> Result<Option<ConfigRecord>> {
    let record = sqlx::query_as::<_, ConfigRecord>(&format!("{SELECT_CONFIG} WHERE c.id = ?1"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(record)
}

pub async fn get_config_for_device(pool: &Db, device_id: Uuid) -> Result<Option<ConfigRecord>> {
    let record =
        sqlx::query_as::<_, ConfigRecord>(&format!("{SELECT_CONFIG} WHERE c.device_id = ?1"))
            .bind(device_id)
            .fetch_optional(pool)
            .await?;
    Ok(record)
}

pub async fn list_config_ids(pool: &Db, filter: &ConfigFilter) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT c.id
        FROM configs c
        JOIN devices d ON d.id = c.device_id
        WHERE (?1 IS NULL OR d.organization_id = ?1)
          AND (?2 IS NULL OR c.backend = ?2)
          AND (?3 IS NULL OR EXISTS (
                SELECT 1 FROM config_templates ct
                WHERE ct.config_id = c.id AND ct.template_id = ?3
          ))
          AND (?4 = 0 OR c.status NOT IN ('deactivating', 'deactivated'))
        ORDER BY c.created_at, c.id
        "#,
    )
    .bind(filter.organization_id)
    .bind(&filter.backend)
    .bind(filter.template_id)
    .bind(filter.exclude_deactivation)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn update_content_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    update: ConfigContentUpdate<'_>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE configs
        SET backend = ?2, config_json = ?3, context_json = ?4, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(update.backend)
    .bind(Json(update.config))
    .bind(Json(update.context))
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

pub async fn update_status_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    status: ConfigStatus,
    error_reason: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE configs
        SET status = ?2, error_reason = ?3, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(error_reason)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

pub async fn update_checksum_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    checksum: &str,
) -> Result<u64> {
    let result = sqlx::query("UPDATE configs SET checksum = ?2 WHERE id = ?1")
        .bind(id)
        .bind(checksum)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub async fn update_deactivated_checksum_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    checksum: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE configs SET deactivated_checksum = ?2 WHERE id = ?1")
        .bind(id)
        .bind(checksum)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub async fn template_ids_tx(
    tx: &mut Transaction<'_, Sqlite>,
    config_id: Uuid,
) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT template_id FROM config_templates
        WHERE config_id = ?1
        ORDER BY sort_order
        "#,
    )
    .bind(config_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids)
}

pub async fn template_ids(pool: &Db, config_id: Uuid) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT template_id FROM config_templates
        WHERE config_id = ?1
        ORDER BY sort_order
        "#,
    )
    .bind(config_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Rewrite the ordered template set of a config.
pub async fn replace_templates_tx(
    tx: &mut Transaction<'_, Sqlite>,
    config_id: Uuid,
    template_ids: &[Uuid],
) -> Result<()> {
    sqlx::query("DELETE FROM config_templates WHERE config_id = ?1")
        .bind(config_id)
        .execute(&mut **tx)
        .await?;
    for (position, template_id) in template_ids.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO config_templates (config_id, template_id, sort_order)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(config_id)
        .bind(template_id)
        .bind(position as i64)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn config_ids_for_template(pool: &Db, template_id: Uuid) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT config_id FROM config_templates
        WHERE template_id = ?1
        ORDER BY config_id
        "#,
    )
    .bind(template_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
