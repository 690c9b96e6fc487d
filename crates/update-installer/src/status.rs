use crate::platform::{ConfirmationIntent, SessionId};

/// `PackageInstaller.STATUS_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    PendingUserAction,
    Success,
    Failure,
    Blocked,
    Aborted,
    Invalid,
    Conflict,
    Storage,
    Incompatible,
    Timeout,
    Unknown(i32),
}

impl InstallStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => InstallStatus::PendingUserAction,
            0 => InstallStatus::Success,
            1 => InstallStatus::Failure,
            2 => InstallStatus::Blocked,
            3 => InstallStatus::Aborted,
            4 => InstallStatus::Invalid,
            5 => InstallStatus::Conflict,
            6 => InstallStatus::Storage,
            7 => InstallStatus::Incompatible,
            8 => InstallStatus::Timeout,
            other => InstallStatus::Unknown(other),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            InstallStatus::PendingUserAction => -1,
            InstallStatus::Success => 0,
            InstallStatus::Failure => 1,
            InstallStatus::Blocked => 2,
            InstallStatus::Aborted => 3,
            InstallStatus::Invalid => 4,
            InstallStatus::Conflict => 5,
            InstallStatus::Storage => 6,
            InstallStatus::Incompatible => 7,
            InstallStatus::Timeout => 8,
            InstallStatus::Unknown(raw) => raw,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != InstallStatus::PendingUserAction
    }
}

/// One install-status broadcast, already unpacked from its intent extras.
#[derive(Debug, Clone)]
pub struct InstallStatusNotification {
    pub action: String,
    /// `None` when the broadcast carried no session id extra.
    pub session_id: Option<SessionId>,
    pub status: InstallStatus,
    pub message: Option<String>,
    pub confirmation: Option<ConfirmationIntent>,
}

impl InstallStatusNotification {
    /// Builds a notification from raw extras. A missing status extra reads as
    /// `STATUS_FAILURE`, the way `getIntExtra` with that default does.
    pub fn from_extras(
        action: impl Into<String>,
        session_id: Option<SessionId>,
        status: Option<i32>,
        message: Option<String>,
        confirmation: Option<ConfirmationIntent>,
    ) -> Self {
        Self {
            action: action.into(),
            session_id,
            status: status.map_or(InstallStatus::Failure, InstallStatus::from_raw),
            message,
            confirmation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_status_reads_as_failure() {
        let n = InstallStatusNotification::from_extras("a", Some(7), None, None, None);
        assert_eq!(n.status, InstallStatus::Failure);
        assert!(n.status.is_terminal());
    }

    #[test]
    fn unknown_codes_survive_the_mapping() {
        assert_eq!(InstallStatus::from_raw(42), InstallStatus::Unknown(42));
        assert_eq!(InstallStatus::from_raw(-1).as_raw(), -1);
        assert!(!InstallStatus::from_raw(-1).is_terminal());
    }
}
