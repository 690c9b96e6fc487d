//! The operating-system seams the update flow calls through.
//!
//! On device these are JNI bindings to `PackageManager`, `PackageInstaller`
//! and `Context`; in tests they are recording fakes.

use std::{any::Any, fmt, sync::Arc};

use anyhow::Result;

pub type SessionId = i32;

/// Parameters of a full-install session.
#[derive(Debug, Clone, Default)]
pub struct SessionParams {
    /// Size hint for the package about to be written.
    pub size_bytes: Option<u64>,
}

/// Where the installer should deliver the asynchronous outcome of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTarget {
    /// Broadcast action the status receiver filters on.
    pub action: String,
    /// The broadcast is restricted to this package.
    pub package: String,
    /// Request code of the broadcast `PendingIntent`; the session id.
    pub request_code: SessionId,
}

/// The confirmation screen the installer hands back with a
/// pending-user-action status. Opaque to the core; the platform layer
/// downcasts it back to whatever it stored.
#[derive(Clone)]
pub struct ConfirmationIntent {
    inner: Arc<dyn Any + Send + Sync>,
}

impl ConfirmationIntent {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }
}

impl fmt::Debug for ConfirmationIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfirmationIntent").finish_non_exhaustive()
    }
}

pub trait InstallPermissionProbe: Send + Sync {
    /// `Build.VERSION.SDK_INT`
    fn sdk_version(&self) -> i32;

    /// `PackageManager.canRequestPackageInstalls()`
    fn can_request_package_installs(&self) -> Result<bool>;

    /// Opens the "install unknown apps" settings screen scoped to `package`.
    fn open_unknown_sources_settings(&self, package: &str) -> Result<()>;
}

/// One open `PackageInstaller.Session`.
pub trait SessionHandle: Send {
    fn open_write(&mut self, name: &str, length: Option<u64>) -> Result<()>;
    fn write(&mut self, chunk: &[u8]) -> Result<()>;
    fn fsync(&mut self) -> Result<()>;
    /// Closes the write stream. Must be called before `commit`.
    fn close_write(&mut self) -> Result<()>;
    fn commit(&mut self, target: &StatusTarget) -> Result<()>;
    fn abandon(&mut self);
    fn close(&mut self);
}

pub trait PackageInstallerHost: Send + Sync {
    fn create_session(&self, params: &SessionParams) -> Result<SessionId>;
    fn open_session(&self, id: SessionId) -> Result<Box<dyn SessionHandle>>;
    /// Registers the process-wide receiver for `action` broadcasts.
    fn register_status_receiver(&self, action: &str) -> Result<()>;
    fn unregister_status_receiver(&self);
}

pub trait AppLauncher: Send + Sync {
    fn start_confirmation(&self, intent: &ConfirmationIntent) -> Result<()>;
    /// Starts the launch activity on a fresh task and finishes the current one.
    fn relaunch_app(&self) -> Result<()>;
}

pub trait Platform: InstallPermissionProbe + PackageInstallerHost + AppLauncher {}

impl<T> Platform for T where T: InstallPermissionProbe + PackageInstallerHost + AppLauncher {}
