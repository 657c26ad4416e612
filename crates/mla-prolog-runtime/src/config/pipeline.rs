use super::logger::{LogLevel, LoggerConfig};

/// Configuration for the pipeline executor.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Logger configuration for wave and flag events.
    #[serde(default)]
    pub logger: LoggerConfig<PipelineLogLevel>,

    /// Maximum time an engine waits on a single cross-engine flag before the run is aborted.
    #[serde(default = "default_watchdog_timeout_ms")]
    pub watchdog_timeout_ms: u64,

    /// Reject plans whose variant selector doesn't decode to the plan's own classification.
    #[serde(default = "default_strict_selector")]
    pub strict_selector: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            logger: Default::default(),
            watchdog_timeout_ms: default_watchdog_timeout_ms(),
            strict_selector: default_strict_selector(),
        }
    }
}

impl PipelineConfig {
    /// The watchdog timeout as a [Duration](core::time::Duration).
    pub fn watchdog_timeout(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.watchdog_timeout_ms)
    }
}

fn default_watchdog_timeout_ms() -> u64 {
    10_000
}

fn default_strict_selector() -> bool {
    true
}

/// Log levels for the pipeline executor.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum PipelineLogLevel {
    /// Pipeline logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// Wave boundaries and stalls are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Every engine program, with its raises and waits, is logged as well.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for PipelineLogLevel {}
