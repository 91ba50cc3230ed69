//! Terminal output for the CLI
//!
//! Uses `cliclack` for spinners and prompts in a terminal, with plain
//! line-oriented output when stdout is not a TTY or a CI system is detected.
//!
//! # Example
//!
//! ```rust,ignore
//! use conbuilder::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//!
//! ui::intro(&ctx, "conbuilder create");
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Bootstrapping sid...");
//! spinner.stop("Base layer ready");
//!
//! if ui::confirm(&ctx, "Delete 3 layers?", false).await? { /* ... */ }
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, layer_line, layer_ready, outro_error, outro_success, outro_warn, remark,
    section, step_error, step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{BuildProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, ConbuilderTheme};
