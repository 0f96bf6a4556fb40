pub mod admin;
pub mod auth;
pub mod automation;
pub mod devices;
pub mod fleet;
pub mod firmware;
pub mod health;
pub mod inventory;
pub mod zigbee;

use fleet_core::error::{CoreError, ErrorKind};
use fleet_core::model::{Device, HomeId};
use fleet_core::storage::Storage;

use super::auth::AuthenticatedUser;
use super::error::ApiResult;
use crate::state::AppState;

/// Owner-or-admin gate on a home.
pub async fn ensure_home_access(
    app: &AppState,
    authed: &AuthenticatedUser,
    home_id: HomeId,
) -> ApiResult<()> {
    if authed.is_admin() {
        return Ok(());
    }
    let home = app
        .store
        .get_home(home_id)
        .await
        .map_err(CoreError::from)?
        .ok_or_else(|| CoreError::not_found(format!("home {}", home_id.0)))?;
    if home.owner_user_id != authed.user.id {
        return Err(CoreError::new(ErrorKind::Forbidden, "not your home").into());
    }
    Ok(())
}

pub async fn ensure_device_access(
    app: &AppState,
    authed: &AuthenticatedUser,
    device: &Device,
) -> ApiResult<()> {
    let Some(home_id) = device.home_id else {
        // unhomed devices are only reachable by admins
        return if authed.is_admin() {
            Ok(())
        } else {
            Err(CoreError::new(ErrorKind::Forbidden, "device has no home").into())
        };
    };
    ensure_home_access(app, authed, home_id).await
}
