//! ANSI transcript banners for batch commands.
//!
//! Banners mark the phases of one host's run in its transcript. The
//! transcript is replayed in a browser terminal, so styling is always on
//! regardless of whether the engine itself runs on a TTY.

use chrono::Local;
use console::Style;

use super::{ExecCommand, ExecHostCommand, SYSTEM_USER_ID};

fn green() -> Style {
    Style::new().green().bright().force_styling(true)
}

fn blue() -> Style {
    Style::new().blue().bright().force_styling(true)
}

fn red() -> Style {
    Style::new().red().bright().force_styling(true)
}

fn yellow() -> Style {
    Style::new().yellow().bright().force_styling(true)
}

fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Default)]
struct Banner {
    out: String,
}

impl Banner {
    fn new() -> Self {
        Self::default()
    }

    /// `> title    <timestamp>`
    fn heading(mut self, style: &Style, title: &str) -> Self {
        self.out
            .push_str(&style.apply_to(format!("{:<16}", title)).to_string());
        self.out.push_str(&now());
        self.out.push('\n');
        self
    }

    fn field(mut self, label: &str, value: impl std::fmt::Display) -> Self {
        self.out
            .push_str(&blue().apply_to(format!("{:<10}", label)).to_string());
        self.out.push_str(&value.to_string());
        self.out.push('\n');
        self
    }

    fn text(mut self, text: &str) -> Self {
        self.out.push_str(text);
        self.out.push('\n');
        self
    }

    fn newline(mut self) -> Self {
        self.out.push('\n');
        self
    }

    fn build(self) -> String {
        self.out
    }
}

/// Opening block: who runs what, where, with which limits
pub fn preparing(command: &ExecCommand, host: &ExecHostCommand) -> String {
    let operator = if command.user_id == SYSTEM_USER_ID {
        command.username.clone()
    } else {
        format!("{} ({})", command.username, command.user_id)
    };
    let timeout = if command.timeout.is_zero() {
        "none".to_string()
    } else {
        format_interval(command.timeout.as_millis() as u64)
    };

    let mut banner = Banner::new()
        .heading(&green(), "> preparing")
        .field("exec:", command.exec_id)
        .field("desc:", &command.description)
        .field("user:", operator);
    if let Some(seq) = command.exec_seq {
        banner = banner.field("seq:", format!("#{}", seq));
    }
    banner = banner
        .field("host:", format!("{} ({})", host.host_name, host.host_id))
        .field("address:", &host.host_address)
        .field("timeout:", timeout)
        .field("script:", command.script_exec)
        .newline()
        .heading(&green(), "> command")
        .text(&host.command)
        .newline();
    if !command.script_exec {
        banner = banner.heading(&green(), "> start");
    }
    banner.build()
}

pub fn uploading(script_path: &str) -> String {
    Banner::new()
        .newline()
        .heading(&green(), "> uploading")
        .field("path:", script_path)
        .build()
}

/// Upload finished; the script starts right after
pub fn uploaded() -> String {
    Banner::new()
        .heading(&green(), "< uploaded")
        .newline()
        .heading(&green(), "> start")
        .build()
}

pub fn upload_failed() -> String {
    Banner::new().heading(&red(), "< upload failed").build()
}

pub fn interrupted() -> String {
    Banner::new()
        .newline()
        .heading(&yellow(), "< interrupted")
        .build()
}

pub fn failed(cause: &str) -> String {
    Banner::new()
        .newline()
        .heading(&red(), "< failed")
        .field("cause:", red().apply_to(cause))
        .build()
}

pub fn timeout() -> String {
    Banner::new()
        .newline()
        .heading(&yellow(), "< timeout")
        .build()
}

/// Natural end of the remote command, whatever its exit code
pub fn completed(exit_code: i32, used_ms: u64) -> String {
    let exit_style = if exit_code == 0 { green() } else { red() };
    Banner::new()
        .newline()
        .heading(&green(), "< completed")
        .field("exit:", exit_style.apply_to(exit_code))
        .field(
            "used:",
            format!("{} ({} ms)", format_interval(used_ms), used_ms),
        )
        .build()
}

/// `1d 2h 3m 4s`, leading zero units omitted, seconds always shown
pub fn format_interval(ms: u64) -> String {
    let total_secs = ms / 1000;
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if days > 0 || hours > 0 || minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    parts.push(format!("{}s", seconds));
    parts.join(" ")
}
