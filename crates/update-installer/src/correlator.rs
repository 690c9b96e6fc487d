//! Single-slot correlation between the one in-flight update call and the
//! installer's asynchronous status broadcast.
//!
//! The slot moves `Idle -> Preparing -> AwaitingResult -> Idle`. Whatever
//! path empties it (a terminal status, or a failure on the worker before the
//! result arrives) also completes the caller, and it can only be emptied
//! once per ticket, so every caller is completed exactly once.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    error::UpdateError,
    platform::{ConfirmationIntent, PackageInstallerHost, SessionId},
    session::SessionState,
    status::{InstallStatus, InstallStatusNotification},
};

/// The terminal result handed back to the web layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOutcome {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl InstallOutcome {
    pub fn installed() -> Self {
        Self {
            installed: true,
            error_message: None,
        }
    }
}

pub type CallResult = Result<InstallOutcome, UpdateError>;

/// Identifies one accepted call. Completions carrying a stale ticket are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    Preparing,
    AwaitingResult {
        session_id: SessionId,
        session_state: SessionState,
    },
}

/// What a status notification did to the slot.
#[derive(Debug)]
pub enum Delivery {
    /// Nothing is waiting for this notification.
    Ignored,
    /// The installer wants the user to confirm; the call is still pending.
    ConfirmationRequested(Option<ConfirmationIntent>),
    /// The call was completed with this result.
    Resolved(CallResult),
}

enum Slot {
    Idle,
    Preparing {
        ticket: Ticket,
        responder: oneshot::Sender<CallResult>,
    },
    AwaitingResult {
        ticket: Ticket,
        session_id: SessionId,
        session_state: SessionState,
        responder: oneshot::Sender<CallResult>,
    },
}

struct SlotGuarded {
    slot: Slot,
    next_ticket: u64,
    listener_registered: bool,
}

pub struct InstallResultCorrelator {
    host: Arc<dyn PackageInstallerHost>,
    action: String,
    inner: Mutex<SlotGuarded>,
}

impl InstallResultCorrelator {
    pub fn new(host: Arc<dyn PackageInstallerHost>, action: impl Into<String>) -> Self {
        Self {
            host,
            action: action.into(),
            inner: Mutex::new(SlotGuarded {
                slot: Slot::Idle,
                next_ticket: 1,
                listener_registered: false,
            }),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn state(&self) -> CorrelatorState {
        match &self.inner.lock().slot {
            Slot::Idle => CorrelatorState::Idle,
            Slot::Preparing { .. } => CorrelatorState::Preparing,
            Slot::AwaitingResult {
                session_id,
                session_state,
                ..
            } => CorrelatorState::AwaitingResult {
                session_id: *session_id,
                session_state: *session_state,
            },
        }
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock().listener_registered
    }

    /// Claims the slot for a new call, or fails with `Busy` while another
    /// call is outstanding.
    pub fn begin(&self) -> Result<(Ticket, oneshot::Receiver<CallResult>), UpdateError> {
        let mut inner = self.inner.lock();
        if !matches!(inner.slot, Slot::Idle) {
            warn!("Rejecting update request: another install is in flight");
            return Err(UpdateError::Busy);
        }

        let ticket = Ticket(inner.next_ticket);
        inner.next_ticket += 1;
        let (responder, receiver) = oneshot::channel();
        inner.slot = Slot::Preparing { ticket, responder };
        debug!("Update call {ticket:?} accepted");
        Ok((ticket, receiver))
    }

    /// Moves `ticket` to awaiting the result of `session_id` and makes sure
    /// the status receiver is registered. Must happen before the commit so a
    /// fast broadcast cannot be missed.
    pub fn await_session(&self, ticket: Ticket, session_id: SessionId) -> Result<(), UpdateError> {
        let mut inner = self.inner.lock();
        let slot = std::mem::replace(&mut inner.slot, Slot::Idle);
        let responder = match slot {
            Slot::Preparing {
                ticket: current,
                responder,
            } if current == ticket => responder,
            other => {
                inner.slot = other;
                warn!("Call {ticket:?} is no longer pending; not awaiting session {session_id}");
                return Err(UpdateError::Abandoned);
            }
        };

        if !inner.listener_registered {
            if let Err(e) = self.host.register_status_receiver(&self.action) {
                error!("Failed to register install status receiver: {e:#}");
                let err = UpdateError::session(&e.context("registering status receiver"));
                let _ = responder.send(Err(err.clone()));
                return Err(err);
            }
            inner.listener_registered = true;
        }

        inner.slot = Slot::AwaitingResult {
            ticket,
            session_id,
            session_state: SessionState::Committed,
            responder,
        };
        info!("Awaiting install result for session {session_id}");
        Ok(())
    }

    /// Completes `ticket` with `err` if it still owns the slot. Returns
    /// whether this call did the completing.
    pub fn reject(&self, ticket: Ticket, err: UpdateError) -> bool {
        let responder = {
            let mut inner = self.inner.lock();
            let owns = match &inner.slot {
                Slot::Preparing { ticket: t, .. } | Slot::AwaitingResult { ticket: t, .. } => {
                    *t == ticket
                }
                Slot::Idle => false,
            };
            if !owns {
                debug!("Dropping rejection for settled call {ticket:?}: {err}");
                return false;
            }
            match std::mem::replace(&mut inner.slot, Slot::Idle) {
                Slot::Preparing { responder, .. } => responder,
                Slot::AwaitingResult { responder, .. } => {
                    self.release_listener(&mut inner);
                    responder
                }
                Slot::Idle => return false,
            }
        };

        warn!("Update call {ticket:?} failed: {err}");
        if responder.send(Err(err)).is_err() {
            debug!("Caller of {ticket:?} went away before the rejection");
        }
        true
    }

    /// Unregisters the status receiver. Runs under the slot lock so a call
    /// arming right after cannot have its fresh registration removed.
    fn release_listener(&self, inner: &mut SlotGuarded) {
        if std::mem::replace(&mut inner.listener_registered, false) {
            self.host.unregister_status_receiver();
        }
    }

    /// Applies one status broadcast to the slot.
    ///
    /// A broadcast without a session id is taken to be about the session in
    /// flight, since only one can be.
    pub fn deliver(&self, notification: &InstallStatusNotification) -> Delivery {
        if notification.action != self.action {
            debug!("Ignoring broadcast with action {}", notification.action);
            return Delivery::Ignored;
        }

        let (session, result, responder) = {
            let mut inner = self.inner.lock();
            let Slot::AwaitingResult {
                session_id,
                session_state,
                ..
            } = &mut inner.slot
            else {
                debug!(
                    "No call awaiting an install result; dropping status {:?} for session {:?}",
                    notification.status, notification.session_id
                );
                return Delivery::Ignored;
            };
            let session = *session_id;

            match notification.session_id {
                Some(id) if id != session => {
                    warn!("Status for session {id} while awaiting session {session}; ignoring");
                    return Delivery::Ignored;
                }
                Some(_) => {}
                None => debug!("Status without a session id; applying to session {session}"),
            }

            *session_state = session_state.advance(notification.status);
            if !notification.status.is_terminal() {
                info!("Session {session} needs user confirmation");
                return Delivery::ConfirmationRequested(notification.confirmation.clone());
            }

            let Slot::AwaitingResult { responder, .. } =
                std::mem::replace(&mut inner.slot, Slot::Idle)
            else {
                return Delivery::Ignored;
            };
            self.release_listener(&mut inner);

            let result = match notification.status {
                InstallStatus::Success => Ok(InstallOutcome::installed()),
                status => Err(UpdateError::InstallRejected {
                    status: status.as_raw(),
                    message: notification.message.clone(),
                }),
            };
            (session, result, responder)
        };

        match &result {
            Ok(_) => info!("Session {session} installed"),
            Err(e) => warn!("Session {session} rejected: {e}"),
        }
        if responder.send(result.clone()).is_err() {
            debug!("Caller went away before the install result arrived");
        }
        Delivery::Resolved(result)
    }
}
