use tracing::{debug, info};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::persistence::vpns;
use crate::pki::DH_PLACEHOLDER;

/// Generate DH parameters for a server still carrying the placeholder.
/// A generated value equal to the placeholder leaves the server untouched.
pub async fn generate_dh(state: &AppState, vpn_id: Uuid) -> crate::Result<()> {
    let Some(vpn) = vpns::get_vpn(&state.db, vpn_id).await? else {
        debug!(%vpn_id, "vpn server gone before dh generation");
        return Ok(());
    };
    if vpn.dh != DH_PLACEHOLDER {
        debug!(%vpn_id, "vpn server already has dh parameters");
        return Ok(());
    }

    let dh = state.dh_generator.generate(state.vpn.dh_length).await?;
    if dh == DH_PLACEHOLDER {
        info!(%vpn_id, "generated dh equals placeholder, skipping update");
        return Ok(());
    }

    let updated = vpns::replace_dh(&state.db, vpn_id, DH_PLACEHOLDER, &dh).await?;
    if updated == 0 {
        debug!(%vpn_id, "dh parameters replaced concurrently");
        return Ok(());
    }
    info!(%vpn_id, bits = state.vpn.dh_length, "dh parameters generated");
    crate::services::vpn::server_changed(state, vpn_id).await
}
