//! Per-session counters.

use std::fmt;

use serde::Serialize;

/// Counters of one coordinator session.
///
/// Reset on every activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Instruction events received from the hook.
    pub events: u64,
    /// Instructions the engine processed.
    pub processed: u64,
    /// Instructions skipped by the optimization policy.
    pub skipped: u64,
    /// Instructions that failed and left the state untouched.
    pub isolated_errors: u64,
    /// Taint triggers emitted.
    pub triggers: u64,
    /// Path constraints appended.
    pub constraints: u64,
    /// Snapshots captured.
    pub snapshots_captured: u64,
    /// Snapshots restored.
    pub snapshots_restored: u64,
    /// Symbolic variables created by symbolize and taint actions.
    pub symbolized: u64,
}

impl ExecutionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fraction of events the engine actually processed.
    #[must_use]
    pub fn processing_ratio(&self) -> f64 {
        if self.events == 0 {
            0.0
        } else {
            self.processed as f64 / self.events as f64
        }
    }

    /// Returns true if nothing happened yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for ExecutionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Instructions:       {}", self.events)?;
        writeln!(
            f,
            "  processed:        {} ({:.1}%)",
            self.processed,
            self.processing_ratio() * 100.0
        )?;
        writeln!(f, "  skipped:          {}", self.skipped)?;
        writeln!(f, "  errors:           {}", self.isolated_errors)?;
        writeln!(f, "Taint triggers:     {}", self.triggers)?;
        writeln!(f, "Path constraints:   {}", self.constraints)?;
        writeln!(
            f,
            "Snapshots:          {} captured, {} restored",
            self.snapshots_captured, self.snapshots_restored
        )?;
        write!(f, "Symbolized inputs:  {}", self.symbolized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_and_display() {
        let mut stats = ExecutionStats::new();
        assert!(stats.is_empty());
        assert_eq!(stats.processing_ratio(), 0.0);

        stats.events = 4;
        stats.processed = 1;
        stats.skipped = 3;
        assert!((stats.processing_ratio() - 0.25).abs() < f64::EPSILON);

        let text = stats.to_string();
        assert!(text.contains("processed:        1 (25.0%)"));
        assert!(text.ends_with("Symbolized inputs:  0"));
    }
}
