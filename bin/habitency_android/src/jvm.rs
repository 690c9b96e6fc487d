use std::sync::OnceLock;

use anyhow::{Result, anyhow, bail};
use jni::{
    JNIEnv, JavaVM,
    objects::{GlobalRef, JClass, JObject, JString, JValue},
};
use parking_lot::Mutex;
use tracing::{info, warn};

pub const FLAG_ACTIVITY_NEW_TASK: i32 = 0x1000_0000;
pub const FLAG_ACTIVITY_CLEAR_TOP: i32 = 0x0400_0000;
pub const EXTRA_SESSION_ID: &str = "android.content.pm.extra.SESSION_ID";

const NATIVE_CLASS: &str = "com/truelytech/habitency/HabitencyNative";

static APP_CONTEXT: OnceLock<GlobalRef> = OnceLock::new();
/// `HabitencyNative`, resolved on a Java thread for use from native ones.
static MAIN_THREAD_HOPS: OnceLock<GlobalRef> = OnceLock::new();
static ACTIVITY: Mutex<Option<GlobalRef>> = Mutex::new(None);

/// Publishes the application context through `ndk_context` the first time
/// any entry point runs. Receivers may start the process without the
/// activity ever being created, so every entry point calls this.
pub fn ensure_context(env: &mut JNIEnv<'_>, context: &JObject<'_>) -> Result<()> {
    if MAIN_THREAD_HOPS.get().is_none() {
        let class = env.find_class(NATIVE_CLASS)?;
        let _ = MAIN_THREAD_HOPS.set(env.new_global_ref(&class)?);
    }
    if APP_CONTEXT.get().is_some() {
        return Ok(());
    }

    let app_context = env
        .call_method(context, "getApplicationContext", "()Landroid/content/Context;", &[])?
        .l()?;
    let app_context = if app_context.is_null() {
        env.new_global_ref(context)?
    } else {
        env.new_global_ref(&app_context)?
    };

    let vm = env.get_java_vm()?;
    if APP_CONTEXT.set(app_context).is_ok() {
        if let Some(global) = APP_CONTEXT.get() {
            unsafe {
                ndk_context::initialize_android_context(
                    vm.get_java_vm_pointer().cast(),
                    global.as_obj().as_raw().cast(),
                );
            }
            info!("Android context initialized");
        }
    }
    Ok(())
}

pub fn set_activity(env: &mut JNIEnv<'_>, activity: &JObject<'_>) -> Result<()> {
    let global = if activity.is_null() {
        None
    } else {
        Some(env.new_global_ref(activity)?)
    };
    *ACTIVITY.lock() = global;
    Ok(())
}

pub fn current_activity() -> Option<GlobalRef> {
    ACTIVITY.lock().clone()
}

/// Runs `f` on the current thread with the application context, inside its
/// own local reference frame.
pub fn with_context<T>(f: impl FnOnce(&mut JNIEnv<'_>, &JObject<'_>) -> Result<T>) -> Result<T> {
    if APP_CONTEXT.get().is_none() {
        bail!("Android context is not initialized");
    }

    let ctx = ndk_context::android_context();
    let vm = unsafe { JavaVM::from_raw(ctx.vm().cast()) }?;
    let mut env = vm.attach_current_thread_permanently()?;
    let context = unsafe { JObject::from_raw(ctx.context().cast()) };

    env.with_local_frame(16, |env| {
        let result = f(env, &context);
        if result.is_err() {
            clear_exception(env);
        }
        result
    })
}

pub fn clear_exception(env: &mut JNIEnv<'_>) {
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_describe();
        let _ = env.exception_clear();
    }
}

pub fn sdk_version(env: &mut JNIEnv<'_>) -> Result<i32> {
    Ok(env
        .get_static_field("android/os/Build$VERSION", "SDK_INT", "I")?
        .i()?)
}

pub fn package_name(env: &mut JNIEnv<'_>, context: &JObject<'_>) -> Result<String> {
    let name = env
        .call_method(context, "getPackageName", "()Ljava/lang/String;", &[])?
        .l()?;
    Ok(env.get_string(&JString::from(name))?.into())
}

pub fn cache_dir(env: &mut JNIEnv<'_>, context: &JObject<'_>) -> Result<String> {
    let dir = env
        .call_method(context, "getCacheDir", "()Ljava/io/File;", &[])?
        .l()?;
    let path = env
        .call_method(&dir, "getAbsolutePath", "()Ljava/lang/String;", &[])?
        .l()?;
    Ok(env.get_string(&JString::from(path))?.into())
}

pub fn optional_string(env: &mut JNIEnv<'_>, value: JObject<'_>) -> Result<Option<String>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(env.get_string(&JString::from(value))?.into()))
}

pub fn new_intent<'local>(env: &mut JNIEnv<'local>, action: &str) -> Result<JObject<'local>> {
    let action = env.new_string(action)?;
    Ok(env.new_object(
        "android/content/Intent",
        "(Ljava/lang/String;)V",
        &[JValue::Object(&action)],
    )?)
}

pub fn add_flags(env: &mut JNIEnv<'_>, intent: &JObject<'_>, flags: i32) -> Result<()> {
    env.call_method(
        intent,
        "addFlags",
        "(I)Landroid/content/Intent;",
        &[JValue::Int(flags)],
    )?;
    Ok(())
}

fn main_thread_hops() -> Result<&'static GlobalRef> {
    MAIN_THREAD_HOPS
        .get()
        .ok_or_else(|| anyhow!("{NATIVE_CLASS} is not loaded"))
}

/// Queues `startActivity` on the main looper.
pub fn start_activity(env: &mut JNIEnv<'_>, context: &JObject<'_>, intent: &JObject<'_>) -> Result<()> {
    let class = main_thread_hops()?;
    env.call_static_method(
        <&JClass>::from(class.as_obj()),
        "startActivityOnMain",
        "(Landroid/content/Context;Landroid/content/Intent;)V",
        &[JValue::Object(context), JValue::Object(intent)],
    )?;
    Ok(())
}

/// Queues `finishAffinity` on the main looper, behind any pending activity
/// start.
pub fn finish_affinity(env: &mut JNIEnv<'_>, activity: &JObject<'_>) -> Result<()> {
    let class = main_thread_hops()?;
    env.call_static_method(
        <&JClass>::from(class.as_obj()),
        "finishAffinityOnMain",
        "(Landroid/app/Activity;)V",
        &[JValue::Object(activity)],
    )?;
    Ok(())
}

/// `PackageManager.getLaunchIntentForPackage`, or `None` when the package
/// has no launcher entry.
pub fn launch_intent<'local>(
    env: &mut JNIEnv<'local>,
    context: &JObject<'_>,
    package: &str,
) -> Result<Option<JObject<'local>>> {
    let pm = env
        .call_method(context, "getPackageManager", "()Landroid/content/pm/PackageManager;", &[])?
        .l()?;
    let package_jstr = env.new_string(package)?;
    let intent = env
        .call_method(
            &pm,
            "getLaunchIntentForPackage",
            "(Ljava/lang/String;)Landroid/content/Intent;",
            &[JValue::Object(&package_jstr)],
        )?
        .l()?;
    if intent.is_null() {
        warn!("No launch intent for {package}");
        return Ok(None);
    }
    Ok(Some(intent))
}
