//! Download-and-install flow behind the web layer's `UpdateInstaller` plugin.
//!
//! A request is fetched over HTTP into a scratch file, gated on the
//! "install unknown apps" grant, streamed into a `PackageInstaller` session
//! and committed. The installer's asynchronous status broadcast is then
//! correlated back to the waiting caller.

pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod error;
pub mod fetcher;
pub mod permission;
pub mod platform;
pub mod session;
pub mod status;

pub use config::UpdaterConfig;
pub use coordinator::{InstallStatusSink, UpdateCoordinator, UpdateRequest};
pub use correlator::{CallResult, CorrelatorState, Delivery, InstallOutcome, InstallResultCorrelator};
pub use error::{DownloadFailure, UpdateError};
pub use fetcher::{DownloadedArtifact, Fetcher, HttpFetcher};
pub use platform::{
    AppLauncher, ConfirmationIntent, InstallPermissionProbe, PackageInstallerHost,
    Platform, SessionHandle, SessionId, SessionParams, StatusTarget,
};
pub use session::{InstallSession, SessionState};
pub use status::{InstallStatus, InstallStatusNotification};
