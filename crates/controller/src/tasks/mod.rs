//! Idempotent background work queued by services once their transaction
//! committed.

use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::events::ModifiedAction;

pub mod dh;
pub mod runner;

pub use runner::{RetryPolicy, TaskMode, TaskRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundTask {
    /// Replace the placeholder DH parameters of an openvpn server.
    GenerateDh { vpn_id: Uuid },
    /// Attach a default or required template to every eligible config.
    PropagateTemplate { template_id: Uuid },
    /// Recompile configs whose inputs changed outside their own row.
    RecheckConfigs {
        config_ids: Vec<Uuid>,
        action: ModifiedAction,
    },
    /// Re-evaluate every config of an organization after a settings edit.
    InvalidateOrganization { organization_id: Uuid },
}

impl BackgroundTask {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundTask::GenerateDh { .. } => "generate_dh",
            BackgroundTask::PropagateTemplate { .. } => "propagate_template",
            BackgroundTask::RecheckConfigs { .. } => "recheck_configs",
            BackgroundTask::InvalidateOrganization { .. } => "invalidate_organization",
        }
    }
}

pub(crate) fn execute(state: AppState, task: BackgroundTask) -> BoxFuture<'static, crate::Result<()>> {
    Box::pin(async move {
        match task {
            BackgroundTask::GenerateDh { vpn_id } => dh::generate_dh(&state, vpn_id).await,
            BackgroundTask::PropagateTemplate { template_id } => {
                crate::services::templates::propagate(&state, template_id)
                    .await
                    .map(|_| ())
            }
            BackgroundTask::RecheckConfigs { config_ids, action } => {
                crate::services::configs::recheck_many(&state, &config_ids, action).await
            }
            BackgroundTask::InvalidateOrganization { organization_id } => {
                crate::services::organizations::recheck_organization(&state, organization_id).await
            }
        }
    })
}
