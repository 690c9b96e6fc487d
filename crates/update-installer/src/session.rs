use std::{fs::File, io::Read};

use tracing::{debug, info, warn};

use crate::{
    error::UpdateError,
    fetcher::DownloadedArtifact,
    platform::{PackageInstallerHost, SessionHandle, SessionId, SessionParams, StatusTarget},
    status::InstallStatus,
};

const COPY_BUFFER_LEN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Writing,
    Committed,
    NeedsUserConfirmation,
    Succeeded,
    Failed,
}

impl SessionState {
    /// Applies an installer status to a committed session. Statuses arriving
    /// before commit or after a terminal state leave the state untouched.
    pub fn advance(self, status: InstallStatus) -> SessionState {
        match self {
            SessionState::Committed | SessionState::NeedsUserConfirmation => match status {
                InstallStatus::PendingUserAction => SessionState::NeedsUserConfirmation,
                InstallStatus::Success => SessionState::Succeeded,
                _ => SessionState::Failed,
            },
            other => other,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Failed)
    }
}

/// An open install session. Dropping it before `commit` abandons the
/// session; the handle is closed on every path.
pub struct InstallSession {
    id: SessionId,
    state: SessionState,
    handle: Box<dyn SessionHandle>,
}

impl InstallSession {
    pub fn create<H: PackageInstallerHost + ?Sized>(
        host: &H,
        params: &SessionParams,
    ) -> Result<Self, UpdateError> {
        let id = host
            .create_session(params)
            .map_err(|e| UpdateError::session(&e.context("createSession failed")))?;
        let handle = host
            .open_session(id)
            .map_err(|e| UpdateError::session(&e.context("openSession failed")))?;
        debug!("Opened install session {id}");
        Ok(Self {
            id,
            state: SessionState::Created,
            handle,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Streams the artifact into the session under `name`.
    pub fn write_artifact(
        &mut self,
        artifact: &DownloadedArtifact,
        name: &str,
    ) -> Result<u64, UpdateError> {
        if self.state != SessionState::Created {
            return Err(UpdateError::InstallSessionFailed(format!(
                "session {} is {:?}, not ready for writing",
                self.id, self.state
            )));
        }
        self.state = SessionState::Writing;

        let copied = self
            .copy_into_session(artifact, name)
            .map_err(|e| UpdateError::session(&e))?;
        info!("Wrote {copied} bytes into install session {}", self.id);
        Ok(copied)
    }

    fn copy_into_session(
        &mut self,
        artifact: &DownloadedArtifact,
        name: &str,
    ) -> anyhow::Result<u64> {
        let mut source = File::open(&artifact.path)?;
        self.handle.open_write(name, Some(artifact.byte_length))?;

        let mut buffer = [0u8; COPY_BUFFER_LEN];
        let mut copied = 0u64;
        loop {
            let read = source.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            self.handle.write(&buffer[..read])?;
            copied += read as u64;
        }

        self.handle.fsync()?;
        self.handle.close_write()?;
        Ok(copied)
    }

    /// Commits the written session. The outcome arrives later as a status
    /// broadcast addressed by `target`.
    pub fn commit(mut self, target: &StatusTarget) -> Result<SessionId, UpdateError> {
        if self.state != SessionState::Writing {
            return Err(UpdateError::InstallSessionFailed(format!(
                "session {} is {:?}, nothing to commit",
                self.id, self.state
            )));
        }

        self.handle
            .commit(target)
            .map_err(|e| UpdateError::session(&e.context("commit failed")))?;
        self.state = SessionState::Committed;
        info!("Committed install session {}", self.id);
        Ok(self.id)
    }
}

impl Drop for InstallSession {
    fn drop(&mut self) {
        if self.state != SessionState::Committed {
            warn!("Abandoning install session {} in state {:?}", self.id, self.state);
            self.handle.abandon();
        }
        self.handle.close();
    }
}
