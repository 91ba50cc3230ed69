//! Interactive vs CI detection

use std::io::IsTerminal;

/// Environment variables set by common CI systems
const CI_ENV_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "JENKINS_URL",
    "BUILDKITE",
    "DEBIAN_SALSA_CI",
];

/// Decides how output is rendered
#[derive(Debug, Clone)]
pub struct UiContext {
    /// Spinners and prompts are allowed
    interactive: bool,
    /// --yes was passed
    auto_yes: bool,
}

impl UiContext {
    /// Interactive only on a terminal (both ends) outside CI
    pub fn detect() -> Self {
        let terminal = std::io::stdout().is_terminal() && std::io::stdin().is_terminal();
        Self {
            interactive: terminal && !running_in_ci(|var| std::env::var_os(var).is_some()),
            auto_yes: false,
        }
    }

    /// Plain output, never prompts
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
        }
    }

    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    /// Spinners and cliclack bars; the same as interactive today
    pub fn use_fancy_output(&self) -> bool {
        self.interactive
    }
}

fn running_in_ci(is_set: impl Fn(&str) -> bool) -> bool {
    CI_ENV_VARS.iter().any(|var| is_set(var))
}
