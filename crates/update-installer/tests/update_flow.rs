use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicI32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::{Router, http::StatusCode, routing::get};
use habitency_update_installer::{
    AppLauncher, ConfirmationIntent, CorrelatorState, Delivery, DownloadFailure,
    DownloadedArtifact, Fetcher, InstallOutcome, InstallPermissionProbe,
    InstallStatusNotification, PackageInstallerHost, SessionHandle, SessionId, SessionParams,
    StatusTarget, UpdateCoordinator, UpdateError, UpdaterConfig,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const PACKAGE: &str = "com.truelytech.habitency";
const APK_BODY: &[u8] = b"PK\x03\x04 fake package body";

#[derive(Default)]
struct Log {
    settings_opened: AtomicUsize,
    sessions_created: AtomicUsize,
    registered: AtomicUsize,
    unregistered: AtomicUsize,
    confirmations: AtomicUsize,
    relaunches: AtomicUsize,
    abandoned: AtomicUsize,
    written: Mutex<Vec<u8>>,
    session_sizes: Mutex<Vec<Option<u64>>>,
    committed: Mutex<Vec<StatusTarget>>,
}

struct FakePlatform {
    sdk: i32,
    can_install: bool,
    fail_commit: bool,
    fail_relaunch: bool,
    next_session: AtomicI32,
    log: Arc<Log>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self {
            sdk: 34,
            can_install: true,
            fail_commit: false,
            fail_relaunch: false,
            next_session: AtomicI32::new(100),
            log: Arc::new(Log::default()),
        }
    }
}

struct FakeSession {
    fail_commit: bool,
    log: Arc<Log>,
}

impl SessionHandle for FakeSession {
    fn open_write(&mut self, _name: &str, _length: Option<u64>) -> Result<()> {
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.log.written.lock().extend_from_slice(chunk);
        Ok(())
    }

    fn fsync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close_write(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self, target: &StatusTarget) -> Result<()> {
        if self.fail_commit {
            bail!("session sealed by another installer");
        }
        self.log.committed.lock().push(target.clone());
        Ok(())
    }

    fn abandon(&mut self) {
        self.log.abandoned.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {}
}

impl InstallPermissionProbe for FakePlatform {
    fn sdk_version(&self) -> i32 {
        self.sdk
    }

    fn can_request_package_installs(&self) -> Result<bool> {
        Ok(self.can_install)
    }

    fn open_unknown_sources_settings(&self, _package: &str) -> Result<()> {
        self.log.settings_opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl PackageInstallerHost for FakePlatform {
    fn create_session(&self, params: &SessionParams) -> Result<SessionId> {
        self.log.sessions_created.fetch_add(1, Ordering::SeqCst);
        self.log.session_sizes.lock().push(params.size_bytes);
        Ok(self.next_session.fetch_add(1, Ordering::SeqCst))
    }

    fn open_session(&self, _id: SessionId) -> Result<Box<dyn SessionHandle>> {
        Ok(Box::new(FakeSession {
            fail_commit: self.fail_commit,
            log: self.log.clone(),
        }))
    }

    fn register_status_receiver(&self, _action: &str) -> Result<()> {
        self.log.registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_status_receiver(&self) {
        self.log.unregistered.fetch_add(1, Ordering::SeqCst);
    }
}

impl AppLauncher for FakePlatform {
    fn start_confirmation(&self, _intent: &ConfirmationIntent) -> Result<()> {
        self.log.confirmations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn relaunch_app(&self) -> Result<()> {
        self.log.relaunches.fetch_add(1, Ordering::SeqCst);
        if self.fail_relaunch {
            bail!("no launch intent");
        }
        Ok(())
    }
}

#[derive(Default)]
struct StubFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, _url: &str, dest: &Path) -> Result<DownloadedArtifact, UpdateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, APK_BODY)
            .await
            .map_err(UpdateError::transport)?;
        Ok(DownloadedArtifact {
            path: dest.to_path_buf(),
            byte_length: APK_BODY.len() as u64,
        })
    }
}

struct Harness {
    coordinator: Arc<UpdateCoordinator<FakePlatform>>,
    log: Arc<Log>,
    fetcher: Arc<StubFetcher>,
    scratch: TempDir,
}

fn harness_with(platform: FakePlatform, tweak: impl FnOnce(&mut UpdaterConfig)) -> Harness {
    let scratch = tempfile::tempdir().expect("tempdir");
    let mut config = UpdaterConfig::new(scratch.path(), PACKAGE);
    tweak(&mut config);
    let log = platform.log.clone();
    let fetcher = Arc::new(StubFetcher::default());
    let coordinator = Arc::new(UpdateCoordinator::with_fetcher(
        config,
        Arc::new(platform),
        fetcher.clone(),
    ));
    Harness {
        coordinator,
        log,
        fetcher,
        scratch,
    }
}

fn harness(platform: FakePlatform) -> Harness {
    harness_with(platform, |_| {})
}

type CallHandle = tokio::task::JoinHandle<Result<InstallOutcome, UpdateError>>;

fn start(h: &Harness, url: &str) -> CallHandle {
    let coordinator = h.coordinator.clone();
    let url = url.to_string();
    tokio::spawn(async move { coordinator.download_and_install(&url).await })
}

async fn wait_for_session(h: &Harness) -> SessionId {
    for _ in 0..200 {
        if let CorrelatorState::AwaitingResult { session_id, .. } = h.coordinator.state() {
            return session_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("install session was never committed");
}

fn notify(h: &Harness, session_id: SessionId, status: i32) -> Delivery {
    notify_raw(h, Some(session_id), status)
}

fn notify_raw(h: &Harness, session_id: Option<SessionId>, status: i32) -> Delivery {
    let sink = h.coordinator.status_sink();
    sink.deliver(InstallStatusNotification::from_extras(
        sink.action().to_string(),
        session_id,
        Some(status),
        None,
        None,
    ))
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

#[tokio::test]
async fn empty_url_fails_before_any_download() {
    let h = harness(FakePlatform::default());

    for url in ["", "   "] {
        assert_eq!(
            h.coordinator.download_and_install(url).await,
            Err(UpdateError::InvalidRequest("Missing url".into()))
        );
    }
    assert_eq!(
        h.coordinator.handle_json("{}").await,
        Err(UpdateError::InvalidRequest("Missing url".into()))
    );
    assert!(matches!(
        h.coordinator.handle_json("not json").await,
        Err(UpdateError::InvalidRequest(_))
    ));

    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.coordinator.state(), CorrelatorState::Idle);
}

#[tokio::test]
async fn http_404_fails_without_install_work() {
    let addr = serve(Router::new().route(
        "/habitex.apk",
        get(|| async { (StatusCode::NOT_FOUND, "missing") }),
    ))
    .await;
    let scratch = tempfile::tempdir().expect("tempdir");
    let platform = Arc::new(FakePlatform::default());
    let coordinator = UpdateCoordinator::new(
        UpdaterConfig::new(scratch.path(), PACKAGE),
        platform.clone(),
    )
    .expect("coordinator");

    let result = coordinator
        .download_and_install(&format!("http://{addr}/habitex.apk"))
        .await;

    assert_eq!(
        result,
        Err(UpdateError::DownloadFailed(DownloadFailure::HttpStatus(404)))
    );
    assert_eq!(platform.log.sessions_created.load(Ordering::SeqCst), 0);
    assert_eq!(platform.log.registered.load(Ordering::SeqCst), 0);
    assert!(!coordinator.config().scratch_path().exists());
    assert_eq!(coordinator.state(), CorrelatorState::Idle);
}

#[tokio::test]
async fn http_200_install_success_resolves_and_relaunches() {
    let addr = serve(Router::new().route("/habitex.apk", get(|| async { APK_BODY }))).await;
    let scratch = tempfile::tempdir().expect("tempdir");
    let platform = Arc::new(FakePlatform::default());
    let coordinator = Arc::new(
        UpdateCoordinator::new(UpdaterConfig::new(scratch.path(), PACKAGE), platform.clone())
            .expect("coordinator"),
    );

    let call = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .download_and_install(&format!("http://{addr}/habitex.apk"))
                .await
        })
    };

    let mut session_id = None;
    for _ in 0..200 {
        if let CorrelatorState::AwaitingResult { session_id: id, .. } = coordinator.state() {
            session_id = Some(id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let session_id = session_id.expect("session committed");

    let sink = coordinator.status_sink();
    sink.deliver(InstallStatusNotification::from_extras(
        sink.action().to_string(),
        Some(session_id),
        Some(0),
        None,
        None,
    ));

    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
    assert_eq!(platform.log.written.lock().as_slice(), APK_BODY);
    assert_eq!(
        platform.log.session_sizes.lock().as_slice(),
        &[Some(APK_BODY.len() as u64)]
    );
    assert_eq!(platform.log.relaunches.load(Ordering::SeqCst), 1);
    assert_eq!(platform.log.unregistered.load(Ordering::SeqCst), 1);

    let committed = platform.log.committed.lock();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].request_code, session_id);
    assert_eq!(committed[0].package, PACKAGE);
    assert_eq!(committed[0].action, "com.truelytech.habitency.INSTALL_STATUS");
}

#[tokio::test]
async fn duplicate_terminal_notifications_complete_once() {
    let h = harness(FakePlatform::default());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;

    assert!(matches!(notify(&h, session_id, 0), Delivery::Resolved(Ok(_))));
    assert!(matches!(notify(&h, session_id, 0), Delivery::Ignored));
    assert!(matches!(notify(&h, session_id, 1), Delivery::Ignored));

    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
    assert_eq!(h.log.relaunches.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.registered.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.unregistered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pending_user_action_defers_resolution_until_success() {
    let h = harness(FakePlatform::default());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;

    let sink = h.coordinator.status_sink();
    let delivery = sink.deliver(InstallStatusNotification::from_extras(
        sink.action().to_string(),
        Some(session_id),
        Some(-1),
        None,
        Some(ConfirmationIntent::new("confirm-install")),
    ));
    assert!(matches!(delivery, Delivery::ConfirmationRequested(Some(_))));
    assert_eq!(h.log.confirmations.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!call.is_finished());

    notify(&h, session_id, 0);
    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
}

#[tokio::test]
async fn denied_permission_opens_settings_once_and_skips_session() {
    let h = harness(FakePlatform {
        can_install: false,
        ..FakePlatform::default()
    });

    let result = start(&h, "https://updates.example.com/habitex.apk")
        .await
        .expect("join");

    assert_eq!(result, Err(UpdateError::PermissionRequired));
    assert_eq!(h.log.settings_opened.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.sessions_created.load(Ordering::SeqCst), 0);
    assert_eq!(h.coordinator.state(), CorrelatorState::Idle);
    assert!(!h.scratch.path().join("habitex-update.apk").exists());
}

#[tokio::test]
async fn old_platform_installs_without_permission_gate() {
    let h = harness(FakePlatform {
        sdk: 24,
        can_install: false,
        ..FakePlatform::default()
    });
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;
    notify(&h, session_id, 0);

    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
    assert_eq!(h.log.settings_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_call_is_rejected_busy_without_disturbing_the_first() {
    let h = harness(FakePlatform::default());
    let first = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;

    let second = h
        .coordinator
        .download_and_install("https://updates.example.com/other.apk")
        .await;
    assert_eq!(second, Err(UpdateError::Busy));
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);

    notify(&h, session_id, 0);
    assert_eq!(first.await.expect("join"), Ok(InstallOutcome::installed()));

    let third = start(&h, "https://updates.example.com/habitex.apk");
    let next_session = wait_for_session(&h).await;
    assert_ne!(next_session, session_id);
    notify(&h, next_session, 0);
    assert_eq!(third.await.expect("join"), Ok(InstallOutcome::installed()));
}

#[tokio::test]
async fn status_without_session_id_settles_and_frees_the_slot() {
    let h = harness(FakePlatform::default());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    wait_for_session(&h).await;

    assert!(matches!(notify_raw(&h, None, 1), Delivery::Resolved(Err(_))));
    let err = call.await.expect("join").expect_err("failure status");
    assert_eq!(err.to_string(), "Install failed (status 1)");
    assert_eq!(h.coordinator.state(), CorrelatorState::Idle);

    let next = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;
    notify(&h, session_id, 0);
    assert_eq!(next.await.expect("join"), Ok(InstallOutcome::installed()));
}

#[tokio::test]
async fn blank_package_name_targets_the_default_package() {
    let h = harness_with(FakePlatform::default(), |config| config.package_name.clear());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;
    notify(&h, session_id, 0);

    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
    assert_eq!(h.log.committed.lock()[0].package, PACKAGE);
}

#[tokio::test]
async fn failure_status_rejects_with_installer_message() {
    let h = harness(FakePlatform::default());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;

    let sink = h.coordinator.status_sink();
    sink.deliver(InstallStatusNotification::from_extras(
        sink.action().to_string(),
        Some(session_id),
        Some(7),
        Some("INSTALL_FAILED_OLDER_SDK".into()),
        None,
    ));

    let err = call.await.expect("join").expect_err("install rejected");
    assert_eq!(
        err,
        UpdateError::InstallRejected {
            status: 7,
            message: Some("INSTALL_FAILED_OLDER_SDK".into()),
        }
    );
    assert_eq!(h.log.relaunches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_status_extra_rejects_generically() {
    let h = harness(FakePlatform::default());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;

    let sink = h.coordinator.status_sink();
    sink.deliver(InstallStatusNotification::from_extras(
        sink.action().to_string(),
        Some(session_id),
        None,
        None,
        None,
    ));

    let err = call.await.expect("join").expect_err("install rejected");
    assert_eq!(err.to_string(), "Install failed (status 1)");
}

#[tokio::test]
async fn commit_failure_rejects_and_releases_listener() {
    let h = harness(FakePlatform {
        fail_commit: true,
        ..FakePlatform::default()
    });

    let err = start(&h, "https://updates.example.com/habitex.apk")
        .await
        .expect("join")
        .expect_err("commit fails");

    assert!(matches!(err, UpdateError::InstallSessionFailed(_)));
    assert_eq!(h.log.abandoned.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.registered.load(Ordering::SeqCst), 1);
    assert_eq!(h.log.unregistered.load(Ordering::SeqCst), 1);
    assert_eq!(h.coordinator.state(), CorrelatorState::Idle);
}

#[tokio::test]
async fn relaunch_failure_does_not_change_the_outcome() {
    let h = harness(FakePlatform {
        fail_relaunch: true,
        ..FakePlatform::default()
    });
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;
    notify(&h, session_id, 0);

    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
    assert_eq!(h.log.relaunches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restart_can_be_disabled() {
    let h = harness_with(FakePlatform::default(), |config| {
        config.restart_after_install = false;
    });
    let call = start(&h, "https://updates.example.com/habitex.apk");
    let session_id = wait_for_session(&h).await;
    notify(&h, session_id, 0);

    assert_eq!(call.await.expect("join"), Ok(InstallOutcome::installed()));
    assert_eq!(h.log.relaunches.load(Ordering::SeqCst), 0);
}

// Known gap: without a result timeout a lost broadcast leaves the call
// pending for good.
#[tokio::test]
async fn call_stays_pending_when_no_terminal_broadcast_arrives() {
    let h = harness(FakePlatform::default());
    let call = start(&h, "https://updates.example.com/habitex.apk");
    wait_for_session(&h).await;

    let waited = tokio::time::timeout(Duration::from_millis(200), call).await;
    assert!(waited.is_err(), "call completed without a broadcast");
    assert!(matches!(
        h.coordinator.state(),
        CorrelatorState::AwaitingResult { .. }
    ));
}

#[tokio::test]
async fn result_timeout_clears_the_slot() {
    let h = harness_with(FakePlatform::default(), |config| {
        config.result_timeout_ms = Some(300);
    });

    let call = start(&h, "https://updates.example.com/habitex.apk");
    wait_for_session(&h).await;
    let result = call.await.expect("join");

    assert_eq!(result, Err(UpdateError::ResultTimedOut));
    assert_eq!(h.coordinator.state(), CorrelatorState::Idle);
    assert_eq!(h.log.unregistered.load(Ordering::SeqCst), 1);
}
