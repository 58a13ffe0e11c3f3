use strum_macros::{AsRefStr, Display, EnumIter};

/// States of one application lifecycle.
///
/// ```text
/// INITIAL → STARTING → STARTED → STOPPING → STOPPED → EXIT
///               └──────── failed start ───────┘
/// ```
///
/// `STOPPED` and `EXIT` are sinks: a lifecycle in either state can never be
/// started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationState {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
    Exit,
}

impl ApplicationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_display_and_order() {
        assert_eq!(ApplicationState::Initial.to_string(), "INITIAL");
        assert_eq!(ApplicationState::Stopping.as_ref(), "STOPPING");
        assert!(ApplicationState::Starting < ApplicationState::Started);
        assert!(ApplicationState::Stopped < ApplicationState::Exit);
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ApplicationState::iter()
            .filter(|state| state.is_terminal())
            .collect();
        assert_eq!(terminal, vec![ApplicationState::Stopped, ApplicationState::Exit]);
    }
}
