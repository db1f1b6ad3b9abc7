use std::collections::BTreeMap;

use sqlx::SqlitePool;

pub mod configs;
pub mod devices;
pub mod migrations;
pub mod notifications;
pub mod organizations;
pub mod templates;
pub mod vpns;

pub type Db = SqlitePool;

/// Variable map stored on organizations, groups, configs and templates.
pub type ContextVars = BTreeMap<String, serde_json::Value>;

pub use configs::{ConfigContentUpdate, ConfigFilter, ConfigRecord, NewConfig};
pub use devices::{DeviceGroupRecord, DeviceInventoryUpdate, DeviceRecord, NewDevice};
pub use migrations::{MigrationLabel, MigrationRunOutcome, MigrationSnapshot};
pub use notifications::NotificationRecord;
pub use organizations::{NewOrganization, OrganizationRecord};
pub use templates::{TemplateRecord, TemplateRow};
pub use vpns::{CaRecord, CertRecord, NewCert, NewVpnClient, VpnClientRecord, VpnRecord, VpnRow};
