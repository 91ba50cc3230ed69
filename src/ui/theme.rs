//! cliclack theme

use cliclack::ThemeState;
use console::Style;

/// Blue while a layer is being worked on, green once it is sealed
#[derive(Debug, Clone, Default)]
pub struct ConbuilderTheme;

fn state_style(state: &ThemeState, done: Style) -> Style {
    match state {
        ThemeState::Active => Style::new().blue(),
        ThemeState::Error(_) => Style::new().red(),
        ThemeState::Cancel => Style::new().dim(),
        ThemeState::Submit => done,
    }
}

impl cliclack::Theme for ConbuilderTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        state_style(state, Style::new().blue().dim())
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        state_style(state, Style::new().green())
    }
}

/// Install the theme for every later prompt and spinner
pub fn init_theme() {
    cliclack::set_theme(ConbuilderTheme);
}
