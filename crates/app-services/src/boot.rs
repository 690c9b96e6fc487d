//! Relaunch after device boot so the web layer can re-register its
//! scheduled notifications.

use tracing::{error, info};

pub const ACTION_BOOT_COMPLETED: &str = "android.intent.action.BOOT_COMPLETED";
pub const ACTION_QUICKBOOT_POWERON: &str = "android.intent.action.QUICKBOOT_POWERON";

pub trait Relauncher {
    /// Starts the launch activity on a new task. `Ok(false)` when the
    /// package manager has no launch intent for this app.
    fn launch_app(&self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    Ignored,
    Relaunched,
    NoLaunchIntent,
    Failed,
}

pub fn is_boot_action(action: Option<&str>) -> bool {
    matches!(action, Some(ACTION_BOOT_COMPLETED | ACTION_QUICKBOOT_POWERON))
}

pub fn on_boot_broadcast<R: Relauncher + ?Sized>(relauncher: &R, action: Option<&str>) -> BootOutcome {
    if !is_boot_action(action) {
        return BootOutcome::Ignored;
    }

    info!("Boot completed, launching app to reschedule notifications");
    match relauncher.launch_app() {
        Ok(true) => BootOutcome::Relaunched,
        Ok(false) => BootOutcome::NoLaunchIntent,
        Err(e) => {
            error!("Relaunch after boot failed: {e:#}");
            BootOutcome::Failed
        }
    }
}
