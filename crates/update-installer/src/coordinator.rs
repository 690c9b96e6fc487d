use std::{path::Path, sync::Arc};

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    config::{SESSION_WRITE_NAME, UpdaterConfig},
    correlator::{CallResult, CorrelatorState, Delivery, InstallResultCorrelator, Ticket},
    error::UpdateError,
    fetcher::{DownloadedArtifact, Fetcher, HttpFetcher},
    permission::ensure_install_permission,
    platform::{Platform, SessionParams, StatusTarget},
    session::InstallSession,
    status::InstallStatusNotification,
};

/// Payload of the bridge's `downloadAndInstall` call.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub url: Option<String>,
}

struct Job {
    ticket: Ticket,
    url: String,
}

struct Shared<P> {
    config: UpdaterConfig,
    platform: Arc<P>,
    fetcher: Arc<dyn Fetcher>,
    correlator: InstallResultCorrelator,
}

/// Entry point for the web layer's update call.
///
/// Requests are validated, claim the single correlation slot, and are run by
/// one background worker in arrival order. The call completes when the
/// installer reports a terminal status for the committed session, or when
/// any step before that fails.
pub struct UpdateCoordinator<P: Platform + 'static> {
    shared: Arc<Shared<P>>,
    jobs: mpsc::Sender<Job>,
}

impl<P: Platform + 'static> UpdateCoordinator<P> {
    /// Builds a coordinator downloading over HTTP. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: UpdaterConfig, platform: Arc<P>) -> Result<Self, UpdateError> {
        let fetcher = HttpFetcher::new(&config)?;
        Ok(Self::with_fetcher(config, platform, Arc::new(fetcher)))
    }

    pub fn with_fetcher(
        config: UpdaterConfig,
        platform: Arc<P>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let correlator = InstallResultCorrelator::new(platform.clone(), config.status_action());
        let shared = Arc::new(Shared {
            config,
            platform,
            fetcher,
            correlator,
        });

        let (jobs, queue) = mpsc::channel(1);
        tokio::spawn(run_worker(shared.clone(), queue));

        Self { shared, jobs }
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.shared.config
    }

    pub fn state(&self) -> CorrelatorState {
        self.shared.correlator.state()
    }

    /// Handle for the broadcast side to report install status with.
    pub fn status_sink(&self) -> InstallStatusSink<P> {
        InstallStatusSink {
            shared: self.shared.clone(),
        }
    }

    /// Parses a bridge payload and runs it.
    pub async fn handle_json(&self, payload: &str) -> CallResult {
        let request: UpdateRequest = serde_json::from_str(payload)
            .map_err(|e| UpdateError::InvalidRequest(format!("Malformed request: {e}")))?;
        self.handle_request(request).await
    }

    pub async fn handle_request(&self, request: UpdateRequest) -> CallResult {
        let url = request.url.unwrap_or_default();
        self.download_and_install(&url).await
    }

    /// Downloads the package at `url`, installs it and waits for the result.
    ///
    /// Fails with `Busy` while another call is outstanding.
    pub async fn download_and_install(&self, url: &str) -> CallResult {
        let url = url.trim();
        if url.is_empty() {
            return Err(UpdateError::missing_url());
        }
        if let Err(e) = reqwest::Url::parse(url) {
            return Err(UpdateError::InvalidRequest(format!("Invalid url: {e}")));
        }

        let (ticket, receiver) = self.shared.correlator.begin()?;
        info!("Starting update {ticket:?} from {url}");

        let job = Job {
            ticket,
            url: url.to_string(),
        };
        if self.jobs.send(job).await.is_err() {
            error!("Update worker is gone");
            self.shared.correlator.reject(ticket, UpdateError::Abandoned);
            return Err(UpdateError::Abandoned);
        }

        let received = match self.shared.config.result_timeout() {
            None => receiver.await,
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    warn!("No install result for {ticket:?} within {limit:?}");
                    self.shared.correlator.reject(ticket, UpdateError::ResultTimedOut);
                    return Err(UpdateError::ResultTimedOut);
                }
            },
        };

        received.unwrap_or(Err(UpdateError::Abandoned))
    }
}

/// Receives the installer's status broadcasts and applies them to the
/// pending call. Cheap to clone; safe to call from any thread.
pub struct InstallStatusSink<P: Platform + 'static> {
    shared: Arc<Shared<P>>,
}

impl<P: Platform + 'static> Clone for InstallStatusSink<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P: Platform + 'static> InstallStatusSink<P> {
    pub fn action(&self) -> &str {
        self.shared.correlator.action()
    }

    pub fn deliver(&self, notification: InstallStatusNotification) -> Delivery {
        let delivery = self.shared.correlator.deliver(&notification);
        match &delivery {
            Delivery::ConfirmationRequested(Some(intent)) => {
                if let Err(e) = self.shared.platform.start_confirmation(intent) {
                    error!("Failed to show install confirmation: {e:#}");
                }
            }
            Delivery::ConfirmationRequested(None) => {
                warn!("Installer asked for confirmation without an intent to show");
            }
            Delivery::Resolved(Ok(_)) if self.shared.config.restart_after_install => {
                info!("Update installed, relaunching");
                if let Err(e) = self.shared.platform.relaunch_app() {
                    // The caller already has its answer; the user can reopen the app.
                    debug!("Relaunch after install failed: {e:#}");
                }
            }
            _ => {}
        }
        delivery
    }
}

async fn run_worker<P: Platform + 'static>(
    shared: Arc<Shared<P>>,
    mut queue: mpsc::Receiver<Job>,
) {
    while let Some(job) = queue.recv().await {
        let ticket = job.ticket;
        if let Err(err) = prepare_and_commit(&shared, job).await {
            shared.correlator.reject(ticket, err);
        }
    }
    debug!("Update worker stopped");
}

async fn prepare_and_commit<P: Platform + 'static>(
    shared: &Arc<Shared<P>>,
    job: Job,
) -> Result<(), UpdateError> {
    let dest = shared.config.scratch_path();
    let outcome = fetch_and_install(shared, job, &dest).await;
    remove_scratch(&dest);
    outcome
}

async fn fetch_and_install<P: Platform + 'static>(
    shared: &Arc<Shared<P>>,
    job: Job,
    dest: &Path,
) -> Result<(), UpdateError> {
    let artifact = shared.fetcher.fetch(&job.url, dest).await?;

    let worker = shared.clone();
    let ticket = job.ticket;
    tokio::task::spawn_blocking(move || install_artifact(&worker, ticket, &artifact))
        .await
        .map_err(|e| UpdateError::InstallSessionFailed(format!("install task failed: {e}")))?
}

fn install_artifact<P: Platform + 'static>(
    shared: &Shared<P>,
    ticket: Ticket,
    artifact: &DownloadedArtifact,
) -> Result<(), UpdateError> {
    let package = shared.config.package_name();
    ensure_install_permission(shared.platform.as_ref(), package)?;

    let params = SessionParams {
        size_bytes: Some(artifact.byte_length),
    };
    let mut session = InstallSession::create(shared.platform.as_ref(), &params)?;
    session.write_artifact(artifact, SESSION_WRITE_NAME)?;

    let target = StatusTarget {
        action: shared.correlator.action().to_string(),
        package: package.to_string(),
        request_code: session.id(),
    };
    shared.correlator.await_session(ticket, session.id())?;
    session.commit(&target)?;
    Ok(())
}

fn remove_scratch(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {e}", path.display()),
    }
}
