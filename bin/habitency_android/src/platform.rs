//! `PackageInstaller`, `PackageManager` and `Context` bindings behind the
//! update and Pomodoro seams.

use anyhow::{Context as _, Result, bail};
use habitency_app_services::{ForegroundHost, Relauncher, ServiceLaunch, StartCommand};
use habitency_update_installer::{
    AppLauncher, ConfirmationIntent, InstallPermissionProbe, PackageInstallerHost, SessionHandle,
    SessionId, SessionParams, StatusTarget,
};
use jni::{
    JNIEnv,
    objects::{GlobalRef, JClass, JObject, JValue},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::jvm::{
    EXTRA_SESSION_ID, FLAG_ACTIVITY_CLEAR_TOP, FLAG_ACTIVITY_NEW_TASK, add_flags,
    current_activity, finish_affinity, launch_intent, new_intent, start_activity, with_context,
};

pub const POMODORO_SERVICE_CLASS: &str = "com.truelytech.habitency.PomodoroForegroundService";
const STATUS_RECEIVER_CLASS: &str = "com/truelytech/habitency/InstallStatusReceiver";
const ACTION_MANAGE_UNKNOWN_APP_SOURCES: &str = "android.settings.MANAGE_UNKNOWN_APP_SOURCES";

const MODE_FULL_INSTALL: i32 = 1;
const FLAG_UPDATE_CURRENT: i32 = 0x0800_0000;
const FLAG_MUTABLE: i32 = 0x0200_0000;
const RECEIVER_NOT_EXPORTED: i32 = 0x4;

pub struct AndroidPlatform {
    sdk: i32,
    package: String,
    /// Loaded on a Java thread; app classes are invisible to `FindClass`
    /// from threads attached by native code.
    receiver_class: GlobalRef,
    receiver: Mutex<Option<GlobalRef>>,
}

impl AndroidPlatform {
    /// Must run on a thread that entered from Java.
    pub fn new(env: &mut JNIEnv<'_>, sdk: i32, package: String) -> Result<Self> {
        let class = env
            .find_class(STATUS_RECEIVER_CLASS)
            .context("loading status receiver class")?;
        let receiver_class = env.new_global_ref(&class)?;
        Ok(Self {
            sdk,
            package,
            receiver_class,
            receiver: Mutex::new(None),
        })
    }
}

fn package_installer<'local>(
    env: &mut JNIEnv<'local>,
    context: &JObject<'_>,
) -> Result<JObject<'local>> {
    let pm = env
        .call_method(context, "getPackageManager", "()Landroid/content/pm/PackageManager;", &[])?
        .l()?;
    Ok(env
        .call_method(
            &pm,
            "getPackageInstaller",
            "()Landroid/content/pm/PackageInstaller;",
            &[],
        )?
        .l()?)
}

impl InstallPermissionProbe for AndroidPlatform {
    fn sdk_version(&self) -> i32 {
        self.sdk
    }

    fn can_request_package_installs(&self) -> Result<bool> {
        with_context(|env, context| {
            let pm = env
                .call_method(context, "getPackageManager", "()Landroid/content/pm/PackageManager;", &[])?
                .l()?;
            Ok(env.call_method(&pm, "canRequestPackageInstalls", "()Z", &[])?.z()?)
        })
    }

    fn open_unknown_sources_settings(&self, package: &str) -> Result<()> {
        with_context(|env, context| {
            let uri_string = env.new_string(format!("package:{package}"))?;
            let uri = env
                .call_static_method(
                    "android/net/Uri",
                    "parse",
                    "(Ljava/lang/String;)Landroid/net/Uri;",
                    &[JValue::Object(&uri_string)],
                )?
                .l()?;
            let action = env.new_string(ACTION_MANAGE_UNKNOWN_APP_SOURCES)?;
            let intent = env.new_object(
                "android/content/Intent",
                "(Ljava/lang/String;Landroid/net/Uri;)V",
                &[JValue::Object(&action), JValue::Object(&uri)],
            )?;
            add_flags(env, &intent, FLAG_ACTIVITY_NEW_TASK)?;
            start_activity(env, context, &intent)
        })
    }
}

impl PackageInstallerHost for AndroidPlatform {
    fn create_session(&self, params: &SessionParams) -> Result<SessionId> {
        let size = params.size_bytes.and_then(|len| i64::try_from(len).ok());
        with_context(|env, context| {
            let installer = package_installer(env, context)?;
            let session_params = env.new_object(
                "android/content/pm/PackageInstaller$SessionParams",
                "(I)V",
                &[JValue::Int(MODE_FULL_INSTALL)],
            )?;
            if let Some(size) = size {
                env.call_method(&session_params, "setSize", "(J)V", &[JValue::Long(size)])?;
            }
            Ok(env
                .call_method(
                    &installer,
                    "createSession",
                    "(Landroid/content/pm/PackageInstaller$SessionParams;)I",
                    &[JValue::Object(&session_params)],
                )?
                .i()?)
        })
    }

    fn open_session(&self, id: SessionId) -> Result<Box<dyn SessionHandle>> {
        let session = with_context(|env, context| {
            let installer = package_installer(env, context)?;
            let session = env
                .call_method(
                    &installer,
                    "openSession",
                    "(I)Landroid/content/pm/PackageInstaller$Session;",
                    &[JValue::Int(id)],
                )?
                .l()?;
            Ok(env.new_global_ref(&session)?)
        })?;

        Ok(Box::new(AndroidSession {
            id,
            sdk: self.sdk,
            session,
            stream: None,
        }))
    }

    fn register_status_receiver(&self, action: &str) -> Result<()> {
        let mut slot = self.receiver.lock();
        if slot.is_some() {
            return Ok(());
        }

        let sdk = self.sdk;
        let receiver = with_context(|env, context| {
            let class = <&JClass>::from(self.receiver_class.as_obj());
            let receiver = env.new_object(class, "()V", &[])?;
            let action = env.new_string(action)?;
            let filter = env.new_object(
                "android/content/IntentFilter",
                "(Ljava/lang/String;)V",
                &[JValue::Object(&action)],
            )?;

            if sdk >= 33 {
                env.call_method(
                    context,
                    "registerReceiver",
                    "(Landroid/content/BroadcastReceiver;Landroid/content/IntentFilter;I)Landroid/content/Intent;",
                    &[
                        JValue::Object(&receiver),
                        JValue::Object(&filter),
                        JValue::Int(RECEIVER_NOT_EXPORTED),
                    ],
                )?;
            } else {
                env.call_method(
                    context,
                    "registerReceiver",
                    "(Landroid/content/BroadcastReceiver;Landroid/content/IntentFilter;)Landroid/content/Intent;",
                    &[JValue::Object(&receiver), JValue::Object(&filter)],
                )?;
            }
            Ok(env.new_global_ref(&receiver)?)
        })?;

        debug!("Install status receiver registered");
        *slot = Some(receiver);
        Ok(())
    }

    fn unregister_status_receiver(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };

        let result = with_context(|env, context| {
            env.call_method(
                context,
                "unregisterReceiver",
                "(Landroid/content/BroadcastReceiver;)V",
                &[JValue::Object(receiver.as_obj())],
            )?;
            Ok(())
        });
        match result {
            Ok(()) => debug!("Install status receiver unregistered"),
            Err(e) => warn!("Failed to unregister install status receiver: {e:#}"),
        }
    }
}

impl AppLauncher for AndroidPlatform {
    fn start_confirmation(&self, intent: &ConfirmationIntent) -> Result<()> {
        let Some(confirm) = intent.downcast_ref::<GlobalRef>() else {
            bail!("confirmation intent is not a platform intent");
        };
        with_context(|env, context| {
            add_flags(env, confirm.as_obj(), FLAG_ACTIVITY_NEW_TASK)?;
            start_activity(env, context, confirm.as_obj())
        })
    }

    fn relaunch_app(&self) -> Result<()> {
        with_context(|env, context| {
            let Some(intent) = launch_intent(env, context, &self.package)? else {
                bail!("no launch intent for {}", self.package);
            };
            add_flags(env, &intent, FLAG_ACTIVITY_NEW_TASK | FLAG_ACTIVITY_CLEAR_TOP)?;
            start_activity(env, context, &intent)?;

            if let Some(activity) = current_activity() {
                finish_affinity(env, activity.as_obj())?;
            }
            Ok(())
        })
    }
}

impl Relauncher for AndroidPlatform {
    fn launch_app(&self) -> Result<bool> {
        with_context(|env, context| {
            let Some(intent) = launch_intent(env, context, &self.package)? else {
                return Ok(false);
            };
            add_flags(env, &intent, FLAG_ACTIVITY_NEW_TASK)?;
            start_activity(env, context, &intent)?;
            Ok(true)
        })
    }
}

impl ForegroundHost for AndroidPlatform {
    fn sdk_version(&self) -> i32 {
        self.sdk
    }

    fn start_service(&self, launch: ServiceLaunch, command: &StartCommand) -> Result<()> {
        with_context(|env, context| {
            let intent = service_intent(env, &self.package)?;
            let end_key = env.new_string("endAtEpochMs")?;
            env.call_method(
                &intent,
                "putExtra",
                "(Ljava/lang/String;J)Landroid/content/Intent;",
                &[JValue::Object(&end_key), JValue::Long(command.end_at_epoch_ms)],
            )?;
            for (key, value) in [("title", &command.title), ("body", &command.body)] {
                let Some(value) = value else { continue };
                let key = env.new_string(key)?;
                let value = env.new_string(value)?;
                env.call_method(
                    &intent,
                    "putExtra",
                    "(Ljava/lang/String;Ljava/lang/String;)Landroid/content/Intent;",
                    &[JValue::Object(&key), JValue::Object(&value)],
                )?;
            }

            let method = match launch {
                ServiceLaunch::Foreground => "startForegroundService",
                ServiceLaunch::Plain => "startService",
            };
            env.call_method(
                context,
                method,
                "(Landroid/content/Intent;)Landroid/content/ComponentName;",
                &[JValue::Object(&intent)],
            )?;
            info!("Pomodoro service start requested via {method}");
            Ok(())
        })
    }

    fn stop_service(&self) -> Result<()> {
        with_context(|env, context| {
            let intent = service_intent(env, &self.package)?;
            env.call_method(
                context,
                "stopService",
                "(Landroid/content/Intent;)Z",
                &[JValue::Object(&intent)],
            )?;
            Ok(())
        })
    }
}

fn service_intent<'local>(env: &mut JNIEnv<'local>, package: &str) -> Result<JObject<'local>> {
    let intent = env.new_object("android/content/Intent", "()V", &[])?;
    let package = env.new_string(package)?;
    let class_name = env.new_string(POMODORO_SERVICE_CLASS)?;
    env.call_method(
        &intent,
        "setClassName",
        "(Ljava/lang/String;Ljava/lang/String;)Landroid/content/Intent;",
        &[JValue::Object(&package), JValue::Object(&class_name)],
    )?;
    Ok(intent)
}

/// One open `PackageInstaller.Session` and its write stream.
struct AndroidSession {
    id: SessionId,
    sdk: i32,
    session: GlobalRef,
    stream: Option<GlobalRef>,
}

impl AndroidSession {
    fn stream(&self) -> Result<&GlobalRef> {
        self.stream
            .as_ref()
            .with_context(|| format!("session {} has no open write stream", self.id))
    }
}

impl SessionHandle for AndroidSession {
    fn open_write(&mut self, name: &str, length: Option<u64>) -> Result<()> {
        let length = length.and_then(|len| i64::try_from(len).ok()).unwrap_or(-1);
        let stream = with_context(|env, _| {
            let name = env.new_string(name)?;
            let stream = env
                .call_method(
                    self.session.as_obj(),
                    "openWrite",
                    "(Ljava/lang/String;JJ)Ljava/io/OutputStream;",
                    &[JValue::Object(&name), JValue::Long(0), JValue::Long(length)],
                )?
                .l()?;
            Ok(env.new_global_ref(&stream)?)
        })?;
        self.stream = Some(stream);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        with_context(|env, _| {
            let bytes = env.byte_array_from_slice(chunk)?;
            let len = i32::try_from(chunk.len())?;
            env.call_method(
                stream.as_obj(),
                "write",
                "([BII)V",
                &[JValue::Object(&bytes), JValue::Int(0), JValue::Int(len)],
            )?;
            Ok(())
        })
    }

    fn fsync(&mut self) -> Result<()> {
        let stream = self.stream()?;
        with_context(|env, _| {
            env.call_method(
                self.session.as_obj(),
                "fsync",
                "(Ljava/io/OutputStream;)V",
                &[JValue::Object(stream.as_obj())],
            )?;
            Ok(())
        })
    }

    fn close_write(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        with_context(|env, _| {
            env.call_method(stream.as_obj(), "close", "()V", &[])?;
            Ok(())
        })
    }

    fn commit(&mut self, target: &StatusTarget) -> Result<()> {
        // The installer fills the status extras into this intent, which an
        // immutable PendingIntent would drop. Android 12 requires the flag.
        let mut flags = FLAG_UPDATE_CURRENT;
        if self.sdk >= 31 {
            flags |= FLAG_MUTABLE;
        }

        with_context(|env, context| {
            let intent = new_intent(env, &target.action)?;
            let package = env.new_string(&target.package)?;
            env.call_method(
                &intent,
                "setPackage",
                "(Ljava/lang/String;)Landroid/content/Intent;",
                &[JValue::Object(&package)],
            )?;
            let session_key = env.new_string(EXTRA_SESSION_ID)?;
            env.call_method(
                &intent,
                "putExtra",
                "(Ljava/lang/String;I)Landroid/content/Intent;",
                &[JValue::Object(&session_key), JValue::Int(target.request_code)],
            )?;
            let pending = env
                .call_static_method(
                    "android/app/PendingIntent",
                    "getBroadcast",
                    "(Landroid/content/Context;ILandroid/content/Intent;I)Landroid/app/PendingIntent;",
                    &[
                        JValue::Object(context),
                        JValue::Int(target.request_code),
                        JValue::Object(&intent),
                        JValue::Int(flags),
                    ],
                )?
                .l()?;
            let sender = env
                .call_method(&pending, "getIntentSender", "()Landroid/content/IntentSender;", &[])?
                .l()?;
            env.call_method(
                self.session.as_obj(),
                "commit",
                "(Landroid/content/IntentSender;)V",
                &[JValue::Object(&sender)],
            )?;
            Ok(())
        })
    }

    fn abandon(&mut self) {
        let result = with_context(|env, _| {
            env.call_method(self.session.as_obj(), "abandon", "()V", &[])?;
            Ok(())
        });
        if let Err(e) = result {
            warn!("Failed to abandon session {}: {e:#}", self.id);
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.close_write() {
            debug!("Closing write stream of session {} failed: {e:#}", self.id);
        }
        let result = with_context(|env, _| {
            env.call_method(self.session.as_obj(), "close", "()V", &[])?;
            Ok(())
        });
        if let Err(e) = result {
            debug!("Failed to close session {}: {e:#}", self.id);
        }
    }
}
