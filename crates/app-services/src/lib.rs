pub mod boot;
pub mod pomodoro;

pub use boot::{BootOutcome, Relauncher, is_boot_action, on_boot_broadcast};
pub use pomodoro::{
    ForegroundHost, ForegroundNotification, PomodoroError, PomodoroForeground, ServiceLaunch,
    StartCommand, StartCommandAction, StartMode, StartRequest, on_start_command,
};
