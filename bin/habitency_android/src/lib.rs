#![cfg(target_os = "android")]
//! Native half of the Habitency Android shell.
//!
//! The Java side is a thin layer of plugin, receiver and service classes
//! that forward into the `HabitencyNative` entry points below.

mod jvm;
mod platform;

use std::{
    ffi::{CString, c_char, c_int},
    fs::File,
    io::{BufRead, BufReader},
    os::unix::io::FromRawFd,
    sync::{Arc, Once, OnceLock},
    thread,
};

use anyhow::Result;
use habitency_app_services::{
    BootOutcome, PomodoroForeground, StartCommand, StartCommandAction, is_boot_action,
    on_boot_broadcast, on_start_command,
};
use habitency_update_installer::{
    CallResult, ConfirmationIntent, InstallStatusNotification, InstallStatusSink,
    UpdateCoordinator, UpdateError, UpdaterConfig,
};
use jni::{
    JNIEnv,
    objects::{GlobalRef, JClass, JObject, JString, JValue},
    sys::{jboolean, jlong, jstring},
};
use serde_json::json;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

use crate::{
    jvm::{
        EXTRA_SESSION_ID, clear_exception, ensure_context, optional_string, set_activity,
        with_context,
    },
    platform::AndroidPlatform,
};

const LOG_TAG: &str = "Habitency";
const ANDROID_LOG_INFO: c_int = 4;

const EXTRA_STATUS: &str = "android.content.pm.extra.STATUS";
const EXTRA_STATUS_MESSAGE: &str = "android.content.pm.extra.STATUS_MESSAGE";
const EXTRA_INTENT: &str = "android.intent.extra.INTENT";
const STATUS_FAILURE: i32 = 1;

#[link(name = "log")]
unsafe extern "C" {
    fn __android_log_write(prio: c_int, tag: *const c_char, text: *const c_char) -> c_int;
}

struct Shell {
    runtime: Runtime,
    updater: UpdateCoordinator<AndroidPlatform>,
    status: InstallStatusSink<AndroidPlatform>,
    pomodoro: PomodoroForeground<AndroidPlatform>,
}

static SHELL: OnceLock<Shell> = OnceLock::new();
static LOGGING: Once = Once::new();

fn init_logging() {
    LOGGING.call_once(|| {
        redirect_stdout_to_logcat();
        init_tracing();
    });
}

fn init_tracing() {
    if let Err(e) = LogTracer::init() {
        eprintln!("log bridge already installed: {e}");
    }
    let filter = EnvFilter::new(
        "info,habitency_android=trace,habitency_update_installer=debug,habitency_app_services=debug,jni=info",
    );
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .without_time()
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("tracing subscriber already installed: {e}");
    }
}

fn redirect_stdout_to_logcat() {
    let mut pipes = [0; 2];
    if unsafe { libc::pipe(pipes.as_mut_ptr()) } < 0 {
        return;
    }
    let [read_fd, write_fd] = pipes;
    unsafe {
        libc::dup2(write_fd, libc::STDOUT_FILENO);
        libc::dup2(write_fd, libc::STDERR_FILENO);
    }

    let spawned = thread::Builder::new()
        .name("logcat-pipe".to_string())
        .spawn(move || {
            let Ok(tag) = CString::new(LOG_TAG) else {
                return;
            };
            let reader = BufReader::new(unsafe { File::from_raw_fd(read_fd) });
            for line in reader.lines().map_while(|line| line.ok()) {
                let Ok(text) = CString::new(line) else {
                    continue;
                };
                unsafe {
                    __android_log_write(ANDROID_LOG_INFO, tag.as_ptr(), text.as_ptr());
                }
            }
        });
    if spawned.is_err() {
        unsafe {
            libc::close(read_fd);
        }
    }
}

fn build_shell(env: &mut JNIEnv<'_>, context: &JObject<'_>) -> Result<Shell> {
    let sdk = jvm::sdk_version(env)?;
    let package = jvm::package_name(env, context)?;
    let cache_dir = jvm::cache_dir(env, context)?;
    info!("Starting Habitency native layer for {package} (SDK {sdk})");

    let platform = Arc::new(AndroidPlatform::new(env, sdk, package.clone())?);
    let config = UpdaterConfig::new(cache_dir, package).with_env_overrides();
    debug!("Updater config: {config:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("habitency-update")
        .build()?;
    let updater = {
        let _guard = runtime.enter();
        UpdateCoordinator::new(config, platform.clone())?
    };
    let status = updater.status_sink();
    let pomodoro = PomodoroForeground::new(platform);

    Ok(Shell {
        runtime,
        updater,
        status,
        pomodoro,
    })
}

fn init_shell(env: &mut JNIEnv<'_>, activity: &JObject<'_>) -> Result<&'static Shell> {
    ensure_context(env, activity)?;
    set_activity(env, activity)?;
    if let Some(shell) = SHELL.get() {
        return Ok(shell);
    }
    let shell = build_shell(env, activity)?;
    Ok(SHELL.get_or_init(|| shell))
}

fn new_jstring(env: &mut JNIEnv<'_>, value: Option<String>) -> jstring {
    let Some(value) = value else {
        return std::ptr::null_mut();
    };
    match env.new_string(value) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Failed to create Java string: {e}");
            clear_exception(env);
            std::ptr::null_mut()
        }
    }
}

/// Called from the main activity's `onCreate`. Returns `false` when the
/// native layer could not start; the web layer then runs without updates.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativeInit(
    mut env: JNIEnv,
    _class: JClass,
    activity: JObject,
) -> jboolean {
    init_logging();
    match init_shell(&mut env, &activity) {
        Ok(_) => 1,
        Err(e) => {
            error!("Native init failed: {e:#}");
            clear_exception(&mut env);
            0
        }
    }
}

/// Called from the main activity's `onDestroy`.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativeDetachActivity(
    mut env: JNIEnv,
    _class: JClass,
) {
    if let Err(e) = set_activity(&mut env, &JObject::null()) {
        warn!("Failed to drop activity reference: {e:#}");
    }
}

/// `UpdateInstaller.downloadAndInstall`. The callback receives
/// `resolve(String json)` or `reject(String message, String code)` exactly
/// once, on a runtime thread; `UpdateInstallerPlugin` moves it to the main
/// looper before touching the bridge call.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativeDownloadAndInstall(
    mut env: JNIEnv,
    _class: JClass,
    payload: JString,
    callback: JObject,
) {
    let callback = match env.new_global_ref(&callback) {
        Ok(callback) => callback,
        Err(e) => {
            error!("Failed to retain update callback: {e}");
            clear_exception(&mut env);
            return;
        }
    };

    let Some(shell) = SHELL.get() else {
        settle(
            &callback,
            Err(UpdateError::InvalidRequest("Native layer is not initialized".to_string())),
        );
        return;
    };

    let payload = match optional_string(&mut env, JObject::from(payload)) {
        Ok(payload) => payload.unwrap_or_else(|| "{}".to_string()),
        Err(e) => {
            clear_exception(&mut env);
            settle(
                &callback,
                Err(UpdateError::InvalidRequest(format!("Malformed request: {e:#}"))),
            );
            return;
        }
    };

    shell.runtime.spawn(async move {
        let result = shell.updater.handle_json(&payload).await;
        settle(&callback, result);
    });
}

fn settle(callback: &GlobalRef, result: CallResult) {
    let delivered = with_context(|env, _| {
        match &result {
            Ok(outcome) => {
                let json = env.new_string(serde_json::to_string(outcome)?)?;
                env.call_method(
                    callback,
                    "resolve",
                    "(Ljava/lang/String;)V",
                    &[JValue::Object(&json)],
                )?;
            }
            Err(err) => {
                let message = env.new_string(err.to_string())?;
                let code = env.new_string(err.code())?;
                env.call_method(
                    callback,
                    "reject",
                    "(Ljava/lang/String;Ljava/lang/String;)V",
                    &[JValue::Object(&message), JValue::Object(&code)],
                )?;
            }
        }
        Ok(())
    });
    if let Err(e) = delivered {
        error!("Failed to settle update call ({result:?}): {e:#}");
    }
}

/// `InstallStatusReceiver.onReceive`.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativeOnInstallStatus(
    mut env: JNIEnv,
    _class: JClass,
    intent: JObject,
) {
    let Some(shell) = SHELL.get() else {
        debug!("Install status arrived before init; ignoring");
        return;
    };

    match read_status(&mut env, &intent) {
        Ok(notification) => {
            shell.status.deliver(notification);
        }
        Err(e) => {
            clear_exception(&mut env);
            warn!("Unreadable install status broadcast: {e:#}");
        }
    }
}

fn read_status(env: &mut JNIEnv<'_>, intent: &JObject<'_>) -> Result<InstallStatusNotification> {
    let action = env
        .call_method(intent, "getAction", "()Ljava/lang/String;", &[])?
        .l()?;
    let action = optional_string(env, action)?.unwrap_or_default();

    let session_id = optional_int_extra(env, intent, EXTRA_SESSION_ID)?;
    let status = optional_int_extra(env, intent, EXTRA_STATUS)?;

    let message_key = env.new_string(EXTRA_STATUS_MESSAGE)?;
    let message = env
        .call_method(
            intent,
            "getStringExtra",
            "(Ljava/lang/String;)Ljava/lang/String;",
            &[JValue::Object(&message_key)],
        )?
        .l()?;
    let message = optional_string(env, message)?;

    let intent_key = env.new_string(EXTRA_INTENT)?;
    let confirm = env
        .call_method(
            intent,
            "getParcelableExtra",
            "(Ljava/lang/String;)Landroid/os/Parcelable;",
            &[JValue::Object(&intent_key)],
        )?
        .l()?;
    let confirmation = if confirm.is_null() {
        None
    } else {
        Some(ConfirmationIntent::new(env.new_global_ref(&confirm)?))
    };

    Ok(InstallStatusNotification::from_extras(
        action,
        session_id,
        status,
        message,
        confirmation,
    ))
}

fn optional_int_extra(env: &mut JNIEnv<'_>, intent: &JObject<'_>, key: &str) -> Result<Option<i32>> {
    let key = env.new_string(key)?;
    let present = env
        .call_method(intent, "hasExtra", "(Ljava/lang/String;)Z", &[JValue::Object(&key)])?
        .z()?;
    if !present {
        return Ok(None);
    }
    let value = env
        .call_method(
            intent,
            "getIntExtra",
            "(Ljava/lang/String;I)I",
            &[JValue::Object(&key), JValue::Int(STATUS_FAILURE)],
        )?
        .i()?;
    Ok(Some(value))
}

/// `PomodoroForeground.start`. Returns `null` on success, otherwise the
/// message to reject the bridge call with.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativePomodoroStart(
    mut env: JNIEnv,
    _class: JClass,
    payload: JString,
) -> jstring {
    let Some(shell) = SHELL.get() else {
        return new_jstring(&mut env, Some("Native layer is not initialized".to_string()));
    };
    let payload = match optional_string(&mut env, JObject::from(payload)) {
        Ok(payload) => payload.unwrap_or_else(|| "{}".to_string()),
        Err(e) => {
            clear_exception(&mut env);
            return new_jstring(&mut env, Some(format!("Malformed request: {e:#}")));
        }
    };

    let failure = shell.pomodoro.start_json(&payload).err().map(|e| e.to_string());
    new_jstring(&mut env, failure)
}

/// `PomodoroForeground.stop`.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativePomodoroStop(
    mut env: JNIEnv,
    _class: JClass,
) -> jstring {
    let Some(shell) = SHELL.get() else {
        return new_jstring(&mut env, Some("Native layer is not initialized".to_string()));
    };
    let failure = shell.pomodoro.stop().err().map(|e| e.to_string());
    new_jstring(&mut env, failure)
}

/// `PomodoroForegroundService.onStartCommand`. Returns the JSON the service
/// builds its notification from, or `null` if it could not be produced.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativeOnStartCommand(
    mut env: JNIEnv,
    _class: JClass,
    has_intent: jboolean,
    end_at_epoch_ms: jlong,
    title: JString,
    body: JString,
) -> jstring {
    init_logging();
    match start_command_json(&mut env, has_intent != 0, end_at_epoch_ms, title, body) {
        Ok(json) => new_jstring(&mut env, Some(json)),
        Err(e) => {
            clear_exception(&mut env);
            error!("Pomodoro start command failed: {e:#}");
            std::ptr::null_mut()
        }
    }
}

fn start_command_json(
    env: &mut JNIEnv<'_>,
    has_intent: bool,
    end_at_epoch_ms: i64,
    title: JString<'_>,
    body: JString<'_>,
) -> Result<String> {
    let sdk = jvm::sdk_version(env)?;
    let command = if has_intent {
        Some(StartCommand {
            end_at_epoch_ms,
            title: optional_string(env, JObject::from(title))?,
            body: optional_string(env, JObject::from(body))?,
        })
    } else {
        None
    };

    let (action, mode) = on_start_command(sdk, command.as_ref());
    let value = match action {
        StartCommandAction::StopSelf => json!({
            "stopSelf": true,
            "startMode": mode.as_raw(),
        }),
        StartCommandAction::ShowForeground(notification) => json!({
            "stopSelf": false,
            "startMode": mode.as_raw(),
            "notification": notification,
        }),
    };
    Ok(serde_json::to_string(&value)?)
}

/// `BootReceiver.onReceive`. Returns whether the app was launched.
#[unsafe(no_mangle)]
pub extern "system" fn Java_com_truelytech_habitency_HabitencyNative_nativeOnBoot(
    mut env: JNIEnv,
    _class: JClass,
    context: JObject,
    action: JString,
) -> jboolean {
    init_logging();
    match handle_boot(&mut env, &context, action) {
        Ok(BootOutcome::Relaunched) => 1,
        Ok(outcome) => {
            debug!("Boot broadcast handled: {outcome:?}");
            0
        }
        Err(e) => {
            clear_exception(&mut env);
            error!("Boot broadcast failed: {e:#}");
            0
        }
    }
}

fn handle_boot(env: &mut JNIEnv<'_>, context: &JObject<'_>, action: JString<'_>) -> Result<BootOutcome> {
    let action = optional_string(env, JObject::from(action))?;
    if !is_boot_action(action.as_deref()) {
        return Ok(BootOutcome::Ignored);
    }

    ensure_context(env, context)?;
    let sdk = jvm::sdk_version(env)?;
    let package = jvm::package_name(env, context)?;
    let platform = AndroidPlatform::new(env, sdk, package)?;
    Ok(on_boot_broadcast(&platform, action.as_deref()))
}
