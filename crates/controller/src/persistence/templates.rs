use chrono::{DateTime, Utc};
use common::api::TemplateType;
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};
use uuid::Uuid;

use super::{ContextVars, Db};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct TemplateRecord {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub template_type: TemplateType,
    pub backend: String,
    pub vpn_id: Option<Uuid>,
    pub is_default: bool,
    pub required: bool,
    pub auto_cert: bool,
    #[sqlx(rename = "default_values_json")]
    pub default_values: Json<ContextVars>,
    #[sqlx(rename = "config_json")]
    pub config: Json<serde_json::Value>,
    #[sqlx(rename = "tags_json")]
    pub tags: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TemplateRecord {
    /// Shared templates are usable by every organization.
    pub fn usable_by(&self, organization_id: Uuid) -> bool {
        self.organization_id
            .is_none_or(|owner| owner == organization_id)
    }
}

/// Row written on create and update; invariants are enforced by the
/// template service before it reaches storage.
#[derive(Debug, Clone)]
pub struct TemplateRow {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub template_type: TemplateType,
    pub backend: String,
    pub vpn_id: Option<Uuid>,
    pub is_default: bool,
    pub required: bool,
    pub auto_cert: bool,
    pub default_values: ContextVars,
    pub config: serde_json::Value,
    pub tags: Vec<String>,
}

const SELECT_TEMPLATE: &str = r#"
    SELECT
        t.id,
        t.organization_id,
        t.name,
        t.template_type,
        t.backend,
        t.vpn_id,
        t.is_default,
        t.required,
        t.auto_cert,
        t.default_values_json,
        t.config_json,
        t.tags_json,
        t.created_at,
        t.updated_at
    FROM templates t
"#;

pub async fn insert_template(pool: &Db, row: &TemplateRow) -> Result<TemplateRecord> {
    sqlx::query(
        r#"
        INSERT INTO templates (
            id,
            organization_id,
            name,
            template_type,
            backend,
            vpn_id,
            is_default,
            required,
            auto_cert,
            default_values_json,
            config_json,
            tags_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
    )
    .bind(row.id)
    .bind(row.organization_id)
    .bind(&row.name)
    .bind(row.template_type.as_str())
    .bind(&row.backend)
    .bind(row.vpn_id)
    .bind(row.is_default)
    .bind(row.required)
    .bind(row.auto_cert)
    .bind(Json(&row.default_values))
    .bind(Json(&row.config))
    .bind(Json(&row.tags))
    .execute(pool)
    .await?;

    get_template(pool, row.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("template insert did not return row"))
}

pub async fn update_template(pool: &Db, row: &TemplateRow) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE templates
        SET name = ?2,
            template_type = ?3,
            backend = ?4,
            vpn_id = ?5,
            is_default = ?6,
            required = ?7,
            auto_cert = ?8,
            default_values_json = ?9,
            config_json = ?10,
            tags_json = ?11,
            updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(row.template_type.as_str())
    .bind(&row.backend)
    .bind(row.vpn_id)
    .bind(row.is_default)
    .bind(row.required)
    .bind(row.auto_cert)
    .bind(Json(&row.default_values))
    .bind(Json(&row.config))
    .bind(Json(&row.tags))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_template(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM templates WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn get_template(pool: &Db, id: Uuid) -> Result<Option<TemplateRecord>> {
    let record =
        sqlx::query_as::<_, TemplateRecord>(&format!("{SELECT_TEMPLATE} WHERE t.id = ?1"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(record)
}

/// Load templates preserving the order of `ids`; unknown ids are skipped.
pub async fn get_templates_ordered_tx(
    tx: &mut Transaction<'_, Sqlite>,
    ids: &[Uuid],
) -> Result<Vec<TemplateRecord>> {
    fetch_ordered(&mut **tx, ids).await
}

async fn fetch_ordered<'e, E>(executor: E, ids: &[Uuid]) -> Result<Vec<TemplateRecord>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder = QueryBuilder::<Sqlite>::new(SELECT_TEMPLATE);
    builder.push(" WHERE t.id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    let mut records = builder
        .build_query_as::<TemplateRecord>()
        .fetch_all(executor)
        .await?;
    records.sort_by_key(|record| ids.iter().position(|id| *id == record.id));
    Ok(records)
}

/// Default templates usable by an organization for a backend, required
/// templates first and then by name.
pub async fn default_templates_tx(
    tx: &mut Transaction<'_, Sqlite>,
    organization_id: Uuid,
    backend: &str,
) -> Result<Vec<TemplateRecord>> {
    let records = sqlx::query_as::<_, TemplateRecord>(&format!(
        r#"{SELECT_TEMPLATE}
        WHERE t.is_default = 1
          AND t.backend = ?2
          AND (t.organization_id IS NULL OR t.organization_id = ?1)
        ORDER BY t.required DESC, t.name ASC
        "#
    ))
    .bind(organization_id)
    .bind(backend)
    .fetch_all(&mut **tx)
    .await?;
    Ok(records)
}

/// Required templates usable by an organization for a backend, by name.
pub async fn required_templates_tx(
    tx: &mut Transaction<'_, Sqlite>,
    organization_id: Uuid,
    backend: &str,
) -> Result<Vec<TemplateRecord>> {
    let records = sqlx::query_as::<_, TemplateRecord>(&format!(
        r#"{SELECT_TEMPLATE}
        WHERE t.required = 1
          AND t.backend = ?2
          AND (t.organization_id IS NULL OR t.organization_id = ?1)
        ORDER BY t.name ASC
        "#
    ))
    .bind(organization_id)
    .bind(backend)
    .fetch_all(&mut **tx)
    .await?;
    Ok(records)
}

/// Templates usable by an organization for a backend that carry any of
/// `tags`, by name.
pub async fn templates_with_tags_tx(
    tx: &mut Transaction<'_, Sqlite>,
    organization_id: Uuid,
    backend: &str,
    tags: &[String],
) -> Result<Vec<TemplateRecord>> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }
    let records = sqlx::query_as::<_, TemplateRecord>(&format!(
        r#"{SELECT_TEMPLATE}
        WHERE t.backend = ?2
          AND (t.organization_id IS NULL OR t.organization_id = ?1)
          AND t.tags_json != '[]'
        ORDER BY t.name ASC
        "#
    ))
    .bind(organization_id)
    .bind(backend)
    .fetch_all(&mut **tx)
    .await?;
    Ok(records
        .into_iter()
        .filter(|record| record.tags.iter().any(|tag| tags.contains(tag)))
        .collect())
}

pub async fn name_exists(
    pool: &Db,
    organization_id: Option<Uuid>,
    name: &str,
) -> Result<bool> {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM templates
        WHERE name = ?2
          AND ((?1 IS NULL AND organization_id IS NULL) OR organization_id = ?1)
        "#,
    )
    .bind(organization_id)
    .bind(name)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
