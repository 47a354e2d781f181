//! The user-visible console log.
//!
//! Programs and the runtime itself log leveled lines here; the host reads
//! them back after a run. Cleared at the start of every execution.

/// Console log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

/// An append-only leveled log.
#[derive(Debug, Default)]
pub struct LogConsole {
    log: Vec<(Level, String)>,
}

impl LogConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, level: Level, message: impl Into<String>) {
        self.log.push((level, message.into()));
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }

    pub fn entries(&self) -> &[(Level, String)] {
        &self.log
    }

    /// The most recent error entry, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.log
            .iter()
            .rev()
            .find(|(level, _)| *level == Level::Error)
            .map(|(_, message)| message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_keep_order_and_levels() {
        let mut console = LogConsole::new();
        console.log(Level::Info, "starting");
        console.log(Level::Error, "boom");
        console.log(Level::Debug, "detail");

        assert_eq!(console.entries().len(), 3);
        assert_eq!(console.last_error(), Some("boom"));

        console.clear();
        assert!(console.entries().is_empty());
        assert!(console.last_error().is_none());
    }
}
