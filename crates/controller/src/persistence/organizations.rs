use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};
use sqlx::types::Json;
use uuid::Uuid;

use super::{ContextVars, Db};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct OrganizationRecord {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub registration_enabled: bool,
    pub shared_secret: String,
    #[sqlx(rename = "context_json")]
    pub context: Json<ContextVars>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub id: Uuid,
    pub name: String,
    pub shared_secret: String,
    pub registration_enabled: bool,
    pub context: ContextVars,
}

impl NewOrganization {
    pub fn new(name: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            shared_secret: shared_secret.into(),
            registration_enabled: true,
            context: ContextVars::new(),
        }
    }
}

const SELECT_ORGANIZATION: &str = r#"
    SELECT
        id,
        name,
        is_active,
        registration_enabled,
        shared_secret,
        context_json,
        created_at,
        updated_at
    FROM organizations
"#;

pub async fn create_organization(pool: &Db, new_org: NewOrganization) -> Result<OrganizationRecord> {
    sqlx::query(
        r#"
        INSERT INTO organizations (id, name, shared_secret, registration_enabled, context_json)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(new_org.id)
    .bind(&new_org.name)
    .bind(&new_org.shared_secret)
    .bind(new_org.registration_enabled)
    .bind(Json(&new_org.context))
    .execute(pool)
    .await?;

    get_organization(pool, new_org.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("organization insert did not return row"))
}

pub async fn get_organization(pool: &Db, id: Uuid) -> Result<Option<OrganizationRecord>> {
    let record = sqlx::query_as::<_, OrganizationRecord>(&format!("{SELECT_ORGANIZATION} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn get_organization_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
) -> Result<Option<OrganizationRecord>> {
    let record = sqlx::query_as::<_, OrganizationRecord>(&format!("{SELECT_ORGANIZATION} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(record)
}

pub async fn find_by_shared_secret(pool: &Db, secret: &str) -> Result<Option<OrganizationRecord>> {
    let record = sqlx::query_as::<_, OrganizationRecord>(&format!(
        "{SELECT_ORGANIZATION} WHERE shared_secret = ?1"
    ))
    .bind(secret)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn update_context(pool: &Db, id: Uuid, context: &ContextVars) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE organizations
        SET context_json = ?2, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(Json(context))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn update_flags(
    pool: &Db,
    id: Uuid,
    is_active: bool,
    registration_enabled: bool,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE organizations
        SET is_active = ?2, registration_enabled = ?3, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(is_active)
    .bind(registration_enabled)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
