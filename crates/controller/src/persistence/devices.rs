use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, Sqlite, Transaction};
use uuid::Uuid;

use super::{ContextVars, Db};
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub group_id: Option<Uuid>,
    pub name: String,
    pub mac_address: String,
    pub key: String,
    pub hardware_id: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub system: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub group_id: Option<Uuid>,
    pub name: String,
    pub mac_address: String,
    pub key: String,
    pub hardware_id: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub system: Option<String>,
}

/// Inventory fields a device may refresh when it registers again.
#[derive(Debug, Clone, Default)]
pub struct DeviceInventoryUpdate {
    pub name: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub system: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DeviceGroupRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    #[sqlx(rename = "context_json")]
    pub context: Json<ContextVars>,
}

const SELECT_DEVICE: &str = r#"
    SELECT
        id,
        organization_id,
        group_id,
        name,
        mac_address,
        key,
        hardware_id,
        model,
        os,
        system,
        created_at,
        updated_at
    FROM devices
"#;

pub async fn create_device_tx(tx: &mut Transaction<'_, Sqlite>, device: &NewDevice) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO devices (
            id,
            organization_id,
            group_id,
            name,
            mac_address,
            key,
            hardware_id,
            model,
            os,
            system
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(device.id)
    .bind(device.organization_id)
    .bind(device.group_id)
    .bind(&device.name)
    .bind(&device.mac_address)
    .bind(&device.key)
    .bind(&device.hardware_id)
    .bind(&device.model)
    .bind(&device.os)
    .bind(&device.system)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_device(pool: &Db, id: Uuid) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(&format!("{SELECT_DEVICE} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn get_device_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(&format!("{SELECT_DEVICE} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(record)
}

pub async fn find_by_key(
    pool: &Db,
    organization_id: Uuid,
    key: &str,
) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(&format!(
        "{SELECT_DEVICE} WHERE organization_id = ?1 AND key = ?2"
    ))
    .bind(organization_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn find_by_mac_address(
    pool: &Db,
    organization_id: Uuid,
    mac_address: &str,
) -> Result<Option<DeviceRecord>> {
    let record = sqlx::query_as::<_, DeviceRecord>(&format!(
        "{SELECT_DEVICE} WHERE organization_id = ?1 AND lower(mac_address) = lower(?2)"
    ))
    .bind(organization_id)
    .bind(mac_address)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn update_inventory_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    update: &DeviceInventoryUpdate,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE devices
        SET name = COALESCE(?2, name),
            model = COALESCE(?3, model),
            os = COALESCE(?4, os),
            system = COALESCE(?5, system),
            updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(&update.name)
    .bind(&update.model)
    .bind(&update.os)
    .bind(&update.system)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

pub async fn set_group_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
    group_id: Option<Uuid>,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE devices SET group_id = ?2, updated_at = datetime('now') WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(group_id)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

pub async fn create_group(
    pool: &Db,
    organization_id: Uuid,
    name: &str,
    context: &ContextVars,
) -> Result<DeviceGroupRecord> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO device_groups (id, organization_id, name, context_json)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(name)
    .bind(Json(context))
    .execute(pool)
    .await?;

    get_group(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("device group insert did not return row"))
}

pub async fn get_group(pool: &Db, id: Uuid) -> Result<Option<DeviceGroupRecord>> {
    let record = sqlx::query_as::<_, DeviceGroupRecord>(
        r#"
        SELECT id, organization_id, name, context_json
        FROM device_groups
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_group_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
) -> Result<Option<DeviceGroupRecord>> {
    let record = sqlx::query_as::<_, DeviceGroupRecord>(
        r#"
        SELECT id, organization_id, name, context_json
        FROM device_groups
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(record)
}

/// Replace the ordered template set of a device group.
pub async fn set_group_templates(pool: &Db, group_id: Uuid, template_ids: &[Uuid]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM device_group_templates WHERE group_id = ?1")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    for (position, template_id) in template_ids.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO device_group_templates (group_id, template_id, sort_order)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(group_id)
        .bind(template_id)
        .bind(position as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn group_template_ids_tx(
    tx: &mut Transaction<'_, Sqlite>,
    group_id: Uuid,
) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT template_id FROM device_group_templates
        WHERE group_id = ?1
        ORDER BY sort_order
        "#,
    )
    .bind(group_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{migrations, organizations};

    #[tokio::test]
    async fn lookup_by_mac_address_ignores_case() {
        let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
        migrations::run_migrations(&pool).await.expect("migrations");
        let org = organizations::create_organization(
            &pool,
            organizations::NewOrganization::new("acme", "s3cret"),
        )
        .await
        .expect("org");

        let device = NewDevice {
            id: Uuid::new_v4(),
            organization_id: org.id,
            group_id: None,
            name: "router-1".into(),
            mac_address: "AA:BB:CC:00:11:22".into(),
            key: "k".repeat(32),
            hardware_id: None,
            model: None,
            os: None,
            system: None,
        };
        let mut tx = pool.begin().await.expect("tx");
        create_device_tx(&mut tx, &device).await.expect("insert");
        tx.commit().await.expect("commit");

        let found = find_by_mac_address(&pool, org.id, "aa:bb:cc:00:11:22")
            .await
            .expect("query")
            .expect("device");
        assert_eq!(found.id, device.id);
        assert!(
            find_by_key(&pool, org.id, "missing")
                .await
                .expect("query")
                .is_none()
        );
    }
}
