use std::sync::OnceLock;

use owo_colors::OwoColorize;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

use crate::jit::{STATUS_BOUNDS, STATUS_CONTINUE, STATUS_ERROR, STATUS_HALTED, STATUS_YIELDED};

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init(default_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ansi = ansi_enabled();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

pub fn category_native() -> String {
    paint("NATIVE", |text| format!("{}", text.bright_green().bold()))
}

pub fn category_interp() -> String {
    paint("INTERP", |text| format!("{}", text.bright_cyan().bold()))
}

pub fn category_codegen() -> String {
    paint("CODEGEN", |text| format!("{}", text.bright_magenta().bold()))
}

/// Name of a status returned by compiled code, colored by severity.
pub fn status_label(status: i32) -> String {
    let name = match status {
        STATUS_CONTINUE => "continue",
        STATUS_HALTED => "halted",
        STATUS_YIELDED => "yielded",
        STATUS_ERROR => "error",
        STATUS_BOUNDS => "bounds",
        _ => "unknown",
    };
    if !ansi_enabled() {
        return name.to_string();
    }
    match status {
        STATUS_CONTINUE | STATUS_HALTED => format!("{}", name.bright_green()),
        STATUS_YIELDED => format!("{}", name.bright_yellow()),
        _ => format!("{}", name.bright_red()),
    }
}

fn paint(text: &str, colored: impl FnOnce(&str) -> String) -> String {
    if ansi_enabled() {
        colored(text)
    } else {
        text.to_string()
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        let _ = enable_ansi_support();
        return true;
    }
    let windows_vt = enable_ansi_support().is_ok();
    windows_vt || supports_color::on_cached(Stream::Stderr).is_some()
}

#[cfg(windows)]
fn enable_ansi_support() -> windows::core::Result<()> {
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::Console::{
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle, STD_ERROR_HANDLE,
        SetConsoleMode,
    };

    unsafe {
        let handle = GetStdHandle(STD_ERROR_HANDLE)?;
        if handle == HANDLE::default() {
            return Ok(());
        }
        let mut mode = std::mem::zeroed();
        GetConsoleMode(handle, &mut mode)?;
        SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING)?;
        Ok(())
    }
}

#[cfg(not(windows))]
fn enable_ansi_support() -> Result<(), ()> {
    Err(())
}
