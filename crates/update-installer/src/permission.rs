use tracing::{error, info, warn};

use crate::{
    config::PERMISSION_GATE_MIN_SDK, error::UpdateError, platform::InstallPermissionProbe,
};

/// Fails with `PermissionRequired` unless this app may install packages.
///
/// On denial the settings screen is opened once and the attempt ends; the
/// caller has to start over after the user flips the switch.
pub fn ensure_install_permission<P: InstallPermissionProbe + ?Sized>(
    probe: &P,
    package: &str,
) -> Result<(), UpdateError> {
    let sdk = probe.sdk_version();
    if sdk < PERMISSION_GATE_MIN_SDK {
        info!("SDK {sdk} predates the unknown-sources grant, skipping permission check");
        return Ok(());
    }

    let allowed = probe
        .can_request_package_installs()
        .map_err(|e| UpdateError::session(&e.context("canRequestPackageInstalls failed")))?;
    if allowed {
        return Ok(());
    }

    warn!("Install permission missing for {package}, opening settings");
    if let Err(e) = probe.open_unknown_sources_settings(package) {
        error!("Failed to open unknown sources settings: {e:#}");
    }
    Err(UpdateError::PermissionRequired)
}
