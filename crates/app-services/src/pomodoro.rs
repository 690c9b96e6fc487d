//! Foreground service that keeps a running Pomodoro visible while the app
//! is in the background. The countdown itself is drawn by the system
//! chronometer, so nothing here ticks.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const CHANNEL_ID: &str = "habitency_pomodoro_running";
pub const CHANNEL_NAME: &str = "Pomodoro Running";
pub const CHANNEL_DESCRIPTION: &str = "Shows the running Pomodoro timer";
pub const NOTIFICATION_ID: i32 = 42420;
pub const DEFAULT_TITLE: &str = "Pomodoro";
pub const DEFAULT_BODY: &str = "Timer is running";

/// Android O: notification channels and `startForegroundService`.
const FOREGROUND_SERVICE_MIN_SDK: i32 = 26;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PomodoroError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Foreground service failed: {0}")]
    Service(String),
}

/// Payload of the bridge's `start` call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub end_at_epoch_ms: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// The extras handed to the service with its start intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartCommand {
    pub end_at_epoch_ms: i64,
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceLaunch {
    /// `Context.startForegroundService`
    Foreground,
    /// `Context.startService`
    Plain,
}

impl ServiceLaunch {
    pub fn for_sdk(sdk: i32) -> Self {
        if sdk >= FOREGROUND_SERVICE_MIN_SDK {
            ServiceLaunch::Foreground
        } else {
            ServiceLaunch::Plain
        }
    }
}

pub trait ForegroundHost: Send + Sync {
    fn sdk_version(&self) -> i32;
    fn start_service(&self, launch: ServiceLaunch, command: &StartCommand) -> anyhow::Result<()>;
    fn stop_service(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// `NotificationManager.IMPORTANCE_LOW`
    pub importance: i32,
    pub lockscreen_public: bool,
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            id: CHANNEL_ID,
            name: CHANNEL_NAME,
            description: CHANNEL_DESCRIPTION,
            importance: 2,
            lockscreen_public: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundNotification {
    /// Present when the platform needs the channel created first.
    pub channel: Option<ChannelSpec>,
    pub notification_id: i32,
    pub channel_id: &'static str,
    pub title: String,
    pub body: String,
    pub ongoing: bool,
    pub only_alert_once: bool,
    pub category: &'static str,
    /// `NotificationCompat.PRIORITY_LOW`
    pub priority: i32,
    /// Count-down chronometer target, epoch millis.
    pub countdown_until: Option<i64>,
}

impl ForegroundNotification {
    pub fn build(sdk: i32, command: &StartCommand) -> Self {
        Self {
            channel: (sdk >= FOREGROUND_SERVICE_MIN_SDK).then(ChannelSpec::default),
            notification_id: NOTIFICATION_ID,
            channel_id: CHANNEL_ID,
            title: text_or(command.title.as_deref(), DEFAULT_TITLE),
            body: text_or(command.body.as_deref(), DEFAULT_BODY),
            ongoing: true,
            only_alert_once: true,
            category: "service",
            priority: -1,
            countdown_until: (command.end_at_epoch_ms > 0).then_some(command.end_at_epoch_ms),
        }
    }
}

fn text_or(value: Option<&str>, fallback: &str) -> String {
    match value {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => fallback.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// `Service.START_STICKY`
    Sticky,
    /// `Service.START_NOT_STICKY`
    NotSticky,
}

impl StartMode {
    pub fn as_raw(self) -> i32 {
        match self {
            StartMode::Sticky => 1,
            StartMode::NotSticky => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartCommandAction {
    /// The service was restarted without an intent; stop it.
    StopSelf,
    ShowForeground(ForegroundNotification),
}

/// What the service does in `onStartCommand`.
pub fn on_start_command(
    sdk: i32,
    command: Option<&StartCommand>,
) -> (StartCommandAction, StartMode) {
    match command {
        None => (StartCommandAction::StopSelf, StartMode::NotSticky),
        Some(command) => (
            StartCommandAction::ShowForeground(ForegroundNotification::build(sdk, command)),
            StartMode::Sticky,
        ),
    }
}

/// Bridge-facing start/stop of the countdown service.
pub struct PomodoroForeground<H: ForegroundHost> {
    host: Arc<H>,
}

impl<H: ForegroundHost> PomodoroForeground<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    pub fn start_json(&self, payload: &str) -> Result<(), PomodoroError> {
        let request: StartRequest = serde_json::from_str(payload)
            .map_err(|e| PomodoroError::InvalidRequest(format!("Malformed request: {e}")))?;
        self.start(request)
    }

    pub fn start(&self, request: StartRequest) -> Result<(), PomodoroError> {
        let end_at_epoch_ms = match request.end_at_epoch_ms {
            Some(value) if value > 0 => value,
            _ => {
                return Err(PomodoroError::InvalidRequest(
                    "endAtEpochMs is required".to_string(),
                ));
            }
        };

        let command = StartCommand {
            end_at_epoch_ms,
            title: request.title,
            body: request.body,
        };
        let launch = ServiceLaunch::for_sdk(self.host.sdk_version());
        info!("Starting Pomodoro service until {end_at_epoch_ms} ({launch:?})");

        self.host
            .start_service(launch, &command)
            .map_err(|e| PomodoroError::Service(format!("{e:#}")))
    }

    pub fn stop(&self) -> Result<(), PomodoroError> {
        self.host.stop_service().map_err(|e| {
            warn!("Stopping Pomodoro service failed: {e:#}");
            PomodoroError::Service(format!("{e:#}"))
        })
    }
}
