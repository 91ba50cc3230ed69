//! Spinners and build progress with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Progress display for container runs.
///
/// Follows `dpkg-buildpackage: info:` and debhelper `dh_*` lines, plus the
/// `I:` phase lines of debootstrap. Shows an indicatif spinner in a terminal
/// and prints only the phase lines otherwise.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new_spinner();
            let template = ProgressStyle::with_template(
                "  {spinner:.blue} {prefix:.bold}  {msg:.dim}  {elapsed:.dim}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            println!("{}...", label);
            None
        };
        Self { bar }
    }

    /// Feed one output line
    pub fn on_line(&self, line: String) {
        match (parse_phase(&line), &self.bar) {
            (Some(phase), Some(bar)) => bar.set_message(phase.to_string()),
            (Some(phase), None) => println!("  {}", phase),
            (None, Some(bar)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    bar.set_message(truncate(trimmed, 60));
                }
            }
            (None, None) => {}
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

fn truncate(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        return line.to_string();
    }
    let head: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}

/// Extract a build phase from an output line
fn parse_phase(line: &str) -> Option<&str> {
    if let Some(info) = line.strip_prefix("dpkg-buildpackage: info: ") {
        return Some(info.trim());
    }
    if let Some(info) = line.strip_prefix("I: ") {
        return Some(info.trim());
    }
    let trimmed = line.trim_start();
    if trimmed.len() != line.len() && trimmed.starts_with("dh_") {
        return trimmed.split_whitespace().next();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_non_interactive() {
        let ctx = UiContext::non_interactive();
        let mut spinner = TaskSpinner::new(&ctx);
        spinner.start("Resolving dependencies...");
        spinner.stop("Done");
        spinner.start("Building...");
        spinner.stop_error("Failed");
    }

    #[test]
    fn parse_phase_dpkg_info() {
        assert_eq!(
            parse_phase("dpkg-buildpackage: info: source package hello"),
            Some("source package hello")
        );
    }

    #[test]
    fn parse_phase_debhelper() {
        assert_eq!(
            parse_phase("   dh_auto_build -O--buildsystem=autoconf"),
            Some("dh_auto_build")
        );
        // unindented dh_ lines are not debhelper's own sequence output
        assert_eq!(parse_phase("dh_auto_build"), None);
    }

    #[test]
    fn parse_phase_debootstrap() {
        assert_eq!(parse_phase("I: Retrieving Release "), Some("Retrieving Release"));
    }

    #[test]
    fn parse_phase_other_lines() {
        assert!(parse_phase("gcc -O2 -c hello.c").is_none());
        assert!(parse_phase("").is_none());
    }

    #[test]
    fn truncate_long_lines() {
        assert_eq!(truncate("short", 60), "short");
        let long = "x".repeat(80);
        let cut = truncate(&long, 60);
        assert_eq!(cut.chars().count(), 60);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn build_progress_non_interactive() {
        let ctx = UiContext::non_interactive();
        let progress = BuildProgress::new(&ctx, "hello");
        progress.on_line("dpkg-buildpackage: info: source package hello".to_string());
        progress.on_line("make[1]: Entering directory '/srv'".to_string());
        progress.finish();
    }
}
