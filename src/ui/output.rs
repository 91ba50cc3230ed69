//! Step-style status lines
//!
//! Every line has a fancy rendering through `cliclack` and a plain tagged
//! rendering (`[OK]`, `[WARN]`, ...) for logs and CI.

use super::context::UiContext;
use crate::layer::{LayerId, Tier};
use console::{style, StyledObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Ok,
    Warn,
    Fail,
    Info,
}

impl Level {
    fn tag(self) -> StyledObject<&'static str> {
        match self {
            Level::Ok => style("[OK]").green(),
            Level::Warn => style("[WARN]").yellow(),
            Level::Fail => style("[FAIL]").red(),
            Level::Info => style("[INFO]").blue(),
        }
    }

    fn paint<D>(self, value: D) -> StyledObject<D> {
        match self {
            Level::Ok => style(value).green(),
            Level::Warn => style(value).yellow(),
            Level::Fail => style(value).red(),
            Level::Info => style(value).blue(),
        }
    }
}

fn step(ctx: &UiContext, level: Level, message: &str) {
    if !ctx.use_fancy_output() {
        println!("  {} {}", level.tag(), message);
        return;
    }
    let _ = match level {
        Level::Ok => cliclack::log::success(message),
        Level::Warn => cliclack::log::warning(message),
        Level::Fail => cliclack::log::error(message),
        Level::Info => cliclack::log::info(message),
    };
}

fn outro(ctx: &UiContext, level: Level, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(level.paint(message).bold()).ok();
    } else {
        let tag = match level {
            Level::Fail => style("[ERROR]").red(),
            other => other.tag(),
        };
        println!("{} {}", tag, message);
    }
}

pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::intro(style(title).blue().bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Ok, message);
}

pub fn outro_error(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Fail, message);
}

pub fn outro_warn(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Warn, message);
}

/// Bold header above a group of steps
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.use_fancy_output() {
        cliclack::log::info(style(title).bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    step(ctx, Level::Ok, message);
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    let detail = if ctx.use_fancy_output() {
        style(detail).dim().to_string()
    } else {
        detail.to_string()
    };
    step(ctx, Level::Ok, &format!("{} ({})", message, detail));
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    step(ctx, Level::Warn, message);
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    let hint = if ctx.use_fancy_output() {
        style(hint).dim().to_string()
    } else {
        hint.to_string()
    };
    step(ctx, Level::Warn, &format!("{} - {}", message, hint));
}

pub fn step_error(ctx: &UiContext, message: &str) {
    step(ctx, Level::Fail, message);
}

pub fn step_info(ctx: &UiContext, message: &str) {
    step(ctx, Level::Info, message);
}

/// `[L2] dependencies layer 3f9c0a12d4e5 (14 packages)`
pub fn layer_line(tier: Tier, id: &LayerId, note: Option<&str>) -> String {
    let mut line = format!("[{}] {} layer {}", tier.label(), tier, id);
    if let Some(note) = note {
        line.push_str(&format!(" ({})", note));
    }
    line
}

/// One finished layer of a build chain
pub fn layer_ready(ctx: &UiContext, tier: Tier, id: &LayerId, note: Option<&str>) {
    step(ctx, Level::Ok, &layer_line(tier, id, note));
}

/// Dimmed secondary line
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        println!("  {}", style(message).dim());
    }
}

pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.use_fancy_output() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}
