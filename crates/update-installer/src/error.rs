use std::fmt;

use thiserror::Error;

/// Why a download did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    /// The server answered with a status outside `[200, 300)`.
    HttpStatus(u16),
    /// Connect, read or local write failure.
    Transport(String),
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadFailure::HttpStatus(code) => write!(f, "HTTP {code}"),
            DownloadFailure::Transport(cause) => f.write_str(cause),
        }
    }
}

/// Every way a `downloadAndInstall` call can end without `{installed: true}`.
///
/// The display strings are what the web layer sees as the rejection message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Download failed: {0}")]
    DownloadFailed(DownloadFailure),

    #[error("Install permission required. Enable 'Install unknown apps' then try again.")]
    PermissionRequired,

    #[error("Update failed: {0}")]
    InstallSessionFailed(String),

    #[error("{}", rejection_message(*status, message.as_deref()))]
    InstallRejected {
        status: i32,
        message: Option<String>,
    },

    #[error("An update is already in progress")]
    Busy,

    #[error("Timed out waiting for the install result")]
    ResultTimedOut,

    #[error("Update was abandoned before the install finished")]
    Abandoned,
}

fn rejection_message(status: i32, message: Option<&str>) -> String {
    match message {
        Some(msg) if !msg.is_empty() => msg.to_string(),
        _ => format!("Install failed (status {status})"),
    }
}

impl UpdateError {
    pub fn missing_url() -> Self {
        UpdateError::InvalidRequest("Missing url".to_string())
    }

    pub fn http_status(code: u16) -> Self {
        UpdateError::DownloadFailed(DownloadFailure::HttpStatus(code))
    }

    pub fn transport(cause: impl fmt::Display) -> Self {
        UpdateError::DownloadFailed(DownloadFailure::Transport(cause.to_string()))
    }

    /// Folds a platform error chain into a session failure, keeping every cause.
    pub fn session(err: &anyhow::Error) -> Self {
        UpdateError::InstallSessionFailed(format!("{err:#}"))
    }

    /// Short machine-readable code for the bridge's reject payload.
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::InvalidRequest(_) => "INVALID_REQUEST",
            UpdateError::DownloadFailed(_) => "DOWNLOAD_FAILED",
            UpdateError::PermissionRequired => "PERMISSION_REQUIRED",
            UpdateError::InstallSessionFailed(_) => "INSTALL_SESSION_FAILED",
            UpdateError::InstallRejected { .. } => "INSTALL_REJECTED",
            UpdateError::Busy => "BUSY",
            UpdateError::ResultTimedOut => "RESULT_TIMED_OUT",
            UpdateError::Abandoned => "ABANDONED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_message_matches_bridge_text() {
        assert_eq!(
            UpdateError::http_status(404).to_string(),
            "Download failed: HTTP 404"
        );
    }

    #[test]
    fn rejection_falls_back_to_generic_message() {
        let err = UpdateError::InstallRejected {
            status: 3,
            message: Some(String::new()),
        };
        assert_eq!(err.to_string(), "Install failed (status 3)");

        let err = UpdateError::InstallRejected {
            status: 1,
            message: Some("INSTALL_FAILED_UPDATE_INCOMPATIBLE".to_string()),
        };
        assert_eq!(err.to_string(), "INSTALL_FAILED_UPDATE_INCOMPATIBLE");
    }

    #[test]
    fn session_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("broken pipe").context("openWrite failed");
        assert_eq!(
            UpdateError::session(&err).to_string(),
            "Update failed: openWrite failed: broken pipe"
        );
    }
}
