use std::cell::RefCell;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use relaunch_installer::TransferObserver;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal())
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self { style }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", paint_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

fn status_style(status: &str) -> Style {
    let color = match status {
        "ok" => AnsiColor::BrightGreen,
        "warn" => AnsiColor::BrightYellow,
        "err" => AnsiColor::BrightRed,
        _ => AnsiColor::BrightBlue,
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn paint_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => render_status_line(style, status, message),
        OutputStyle::Rich => format!(
            "{} {message}",
            colorize(status_style(status), status_badge(status))
        ),
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

pub(crate) fn render_download_summary(
    style: OutputStyle,
    downloaded: u64,
    elapsed: Duration,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }
    Some(render_status_line(
        style,
        "ok",
        &format!(
            "downloaded {} in {}",
            HumanBytes(downloaded),
            format_elapsed(elapsed)
        ),
    ))
}

struct ActiveTransfer {
    bar: ProgressBar,
    downloaded: u64,
    started_at: Instant,
}

/// Download progress on an interactive terminal; silent otherwise.
pub(crate) struct TerminalProgress {
    style: OutputStyle,
    active: RefCell<Option<ActiveTransfer>>,
}

impl TerminalProgress {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self {
            style,
            active: RefCell::new(None),
        }
    }
}

impl TransferObserver for TerminalProgress {
    fn started(&self, _url: &str, total: Option<u64>) {
        if self.style == OutputStyle::Plain {
            return;
        }
        let bar = match total {
            Some(total) => ProgressBar::new(total.max(1)),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan.bold} {msg:<10} [{bar:20.cyan/blue}] {bytes}/{total_bytes} {elapsed_precise}",
        ) {
            bar.set_style(style.tick_chars(".oO@* ").progress_chars("=>-"));
        }
        bar.set_message("download");
        bar.enable_steady_tick(Duration::from_millis(80));
        *self.active.borrow_mut() = Some(ActiveTransfer {
            bar,
            downloaded: 0,
            started_at: Instant::now(),
        });
    }

    fn advanced(&self, downloaded: u64) {
        if let Some(active) = self.active.borrow_mut().as_mut() {
            active.downloaded = downloaded;
            active.bar.set_position(downloaded);
        }
    }

    fn finished(&self) {
        let Some(active) = self.active.borrow_mut().take() else {
            return;
        };
        active.bar.finish_and_clear();
        if let Some(line) =
            render_download_summary(self.style, active.downloaded, active.started_at.elapsed())
        {
            println!("{line}");
        }
    }
}
