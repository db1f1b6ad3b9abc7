use chrono::{DateTime, Utc};
use common::api::VpnBackend;
use sqlx::types::Json;
use sqlx::{FromRow, Sqlite, Transaction};
use uuid::Uuid;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, FromRow)]
pub struct VpnRecord {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub host: String,
    #[sqlx(try_from = "String")]
    pub backend: VpnBackend,
    pub ca_id: Option<Uuid>,
    pub cert_id: Option<Uuid>,
    pub dh: String,
    /// Shared secret servers present to fetch their own configuration.
    pub key: String,
    /// IPv4 network in CIDR notation the tunnel addresses come from.
    pub subnet: Option<String>,
    pub ip_address: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    #[sqlx(rename = "config_json")]
    pub config: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct VpnRow {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub host: String,
    pub backend: VpnBackend,
    pub ca_id: Option<Uuid>,
    pub cert_id: Option<Uuid>,
    pub dh: String,
    pub key: String,
    pub subnet: Option<String>,
    pub ip_address: Option<String>,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct VpnClientRecord {
    pub id: Uuid,
    pub config_id: Uuid,
    pub vpn_id: Uuid,
    pub template_id: Uuid,
    pub cert_id: Option<Uuid>,
    pub auto_cert: bool,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub ip_address: Option<String>,
    pub vni: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewVpnClient {
    pub id: Uuid,
    pub config_id: Uuid,
    pub vpn_id: Uuid,
    pub template_id: Uuid,
    pub cert_id: Option<Uuid>,
    pub auto_cert: bool,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
    pub ip_address: Option<String>,
    pub vni: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CaRecord {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub name: String,
    pub common_name: String,
    pub certificate: String,
    pub private_key: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct CertRecord {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub ca_id: Option<Uuid>,
    pub name: String,
    pub common_name: String,
    pub certificate: String,
    pub private_key: String,
    pub revoked: bool,
}

#[derive(Debug, Clone)]
pub struct NewCert {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub ca_id: Option<Uuid>,
    pub name: String,
    pub common_name: String,
    pub certificate: String,
    pub private_key: String,
}

const SELECT_VPN: &str = r#"
    SELECT
        id,
        organization_id,
        name,
        host,
        backend,
        ca_id,
        cert_id,
        dh,
        key,
        subnet,
        ip_address,
        public_key,
        private_key,
        config_json,
        created_at,
        updated_at
    FROM vpns
"#;

const SELECT_VPN_CLIENT: &str = r#"
    SELECT
        id,
        config_id,
        vpn_id,
        template_id,
        cert_id,
        auto_cert,
        public_key,
        private_key,
        ip_address,
        vni
    FROM vpn_clients
"#;

pub async fn insert_vpn_tx(tx: &mut Transaction<'_, Sqlite>, row: &VpnRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vpns (
            id, organization_id, name, host, backend, ca_id, cert_id, dh,
            key, subnet, ip_address, public_key, private_key, config_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(row.id)
    .bind(row.organization_id)
    .bind(&row.name)
    .bind(&row.host)
    .bind(row.backend.as_str())
    .bind(row.ca_id)
    .bind(row.cert_id)
    .bind(&row.dh)
    .bind(&row.key)
    .bind(&row.subnet)
    .bind(&row.ip_address)
    .bind(&row.public_key)
    .bind(&row.private_key)
    .bind(Json(&row.config))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn update_vpn_tx(tx: &mut Transaction<'_, Sqlite>, row: &VpnRow) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE vpns
        SET name = ?2,
            host = ?3,
            backend = ?4,
            ca_id = ?5,
            cert_id = ?6,
            dh = ?7,
            subnet = ?8,
            ip_address = ?9,
            public_key = ?10,
            private_key = ?11,
            config_json = ?12,
            updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(row.id)
    .bind(&row.name)
    .bind(&row.host)
    .bind(row.backend.as_str())
    .bind(row.ca_id)
    .bind(row.cert_id)
    .bind(&row.dh)
    .bind(&row.subnet)
    .bind(&row.ip_address)
    .bind(&row.public_key)
    .bind(&row.private_key)
    .bind(Json(&row.config))
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected())
}

/// Store generated DH parameters unless they were already replaced.
pub async fn replace_dh(pool: &Db, id: Uuid, expected: &str, dh: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE vpns SET dh = ?3, updated_at = datetime('now')
        WHERE id = ?1 AND dh = ?2
        "#,
    )
    .bind(id)
    .bind(expected)
    .bind(dh)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn get_vpn(pool: &Db, id: Uuid) -> Result<Option<VpnRecord>> {
    let record = sqlx::query_as::<_, VpnRecord>(&format!("{SELECT_VPN} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(record)
}

pub async fn get_vpn_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<Option<VpnRecord>> {
    let record = sqlx::query_as::<_, VpnRecord>(&format!("{SELECT_VPN} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(record)
}

pub async fn insert_vpn_client_tx(
    tx: &mut Transaction<'_, Sqlite>,
    client: &NewVpnClient,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO vpn_clients (
            id, config_id, vpn_id, template_id, cert_id, auto_cert,
            public_key, private_key, ip_address, vni
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(client.id)
    .bind(client.config_id)
    .bind(client.vpn_id)
    .bind(client.template_id)
    .bind(client.cert_id)
    .bind(client.auto_cert)
    .bind(&client.public_key)
    .bind(&client.private_key)
    .bind(&client.ip_address)
    .bind(client.vni)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn vpn_clients_for_config_tx(
    tx: &mut Transaction<'_, Sqlite>,
    config_id: Uuid,
) -> Result<Vec<VpnClientRecord>> {
    let records = sqlx::query_as::<_, VpnClientRecord>(&format!(
        "{SELECT_VPN_CLIENT} WHERE config_id = ?1 ORDER BY created_at, id"
    ))
    .bind(config_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(records)
}

pub async fn vpn_clients_for_config(pool: &Db, config_id: Uuid) -> Result<Vec<VpnClientRecord>> {
    let records = sqlx::query_as::<_, VpnClientRecord>(&format!(
        "{SELECT_VPN_CLIENT} WHERE config_id = ?1 ORDER BY created_at, id"
    ))
    .bind(config_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn delete_vpn_client_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM vpn_clients WHERE id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

/// Tunnel addresses already handed out to the clients of a server.
pub async fn client_addresses_tx(
    tx: &mut Transaction<'_, Sqlite>,
    vpn_id: Uuid,
) -> Result<Vec<String>> {
    let addresses = sqlx::query_scalar::<_, String>(
        "SELECT ip_address FROM vpn_clients WHERE vpn_id = ?1 AND ip_address IS NOT NULL",
    )
    .bind(vpn_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(addresses)
}

pub async fn highest_vni_tx(tx: &mut Transaction<'_, Sqlite>, vpn_id: Uuid) -> Result<Option<i64>> {
    let vni = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT MAX(vni) FROM vpn_clients WHERE vpn_id = ?1",
    )
    .bind(vpn_id)
    .fetch_one(&mut **tx)
    .await?;
    Ok(vni)
}

/// Clients of a server that carry tunnel addressing, in creation order.
pub async fn addressed_clients(pool: &Db, vpn_id: Uuid) -> Result<Vec<VpnClientRecord>> {
    let records = sqlx::query_as::<_, VpnClientRecord>(&format!(
        "{SELECT_VPN_CLIENT} WHERE vpn_id = ?1 AND auto_cert = 1 AND ip_address IS NOT NULL ORDER BY created_at, id"
    ))
    .bind(vpn_id)
    .fetch_all(pool)
    .await?;
    Ok(records)
}

pub async fn config_ids_for_vpn(pool: &Db, vpn_id: Uuid) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT config_id FROM vpn_clients WHERE vpn_id = ?1 ORDER BY config_id",
    )
    .bind(vpn_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn config_ids_for_cert(pool: &Db, cert_id: Uuid) -> Result<Vec<Uuid>> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        "SELECT config_id FROM vpn_clients WHERE cert_id = ?1 ORDER BY config_id",
    )
    .bind(cert_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn insert_ca(
    pool: &Db,
    organization_id: Option<Uuid>,
    name: &str,
    common_name: &str,
    certificate: &str,
    private_key: &str,
) -> Result<CaRecord> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO cas (id, organization_id, name, common_name, certificate, private_key)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(name)
    .bind(common_name)
    .bind(certificate)
    .bind(private_key)
    .execute(pool)
    .await?;

    get_ca(pool, id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("ca insert did not return row"))
}

pub async fn get_ca(pool: &Db, id: Uuid) -> Result<Option<CaRecord>> {
    let record = sqlx::query_as::<_, CaRecord>(
        r#"
        SELECT id, organization_id, name, common_name, certificate, private_key
        FROM cas
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_ca_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<Option<CaRecord>> {
    let record = sqlx::query_as::<_, CaRecord>(
        r#"
        SELECT id, organization_id, name, common_name, certificate, private_key
        FROM cas
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(record)
}

pub async fn insert_cert_tx(tx: &mut Transaction<'_, Sqlite>, cert: &NewCert) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO certs (id, organization_id, ca_id, name, common_name, certificate, private_key)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(cert.id)
    .bind(cert.organization_id)
    .bind(cert.ca_id)
    .bind(&cert.name)
    .bind(&cert.common_name)
    .bind(&cert.certificate)
    .bind(&cert.private_key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_cert(pool: &Db, id: Uuid) -> Result<Option<CertRecord>> {
    let record = sqlx::query_as::<_, CertRecord>(
        r#"
        SELECT id, organization_id, ca_id, name, common_name, certificate, private_key, revoked
        FROM certs
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

pub async fn get_cert_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: Uuid,
) -> Result<Option<CertRecord>> {
    let record = sqlx::query_as::<_, CertRecord>(
        r#"
        SELECT id, organization_id, ca_id, name, common_name, certificate, private_key, revoked
        FROM certs
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(record)
}

pub async fn update_cert_material(
    pool: &Db,
    id: Uuid,
    certificate: &str,
    private_key: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE certs
        SET certificate = ?2, private_key = ?3, revoked = 0, updated_at = datetime('now')
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(certificate)
    .bind(private_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn mark_cert_revoked(pool: &Db, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE certs SET revoked = 1, updated_at = datetime('now') WHERE id = ?1",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn delete_cert_tx(tx: &mut Transaction<'_, Sqlite>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM certs WHERE id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub async fn count_certs(pool: &Db) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM certs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
