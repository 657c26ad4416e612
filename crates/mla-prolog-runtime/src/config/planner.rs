use super::logger::{LogLevel, LoggerConfig};

/// Size reserved for the inner matmul library when the platform does not report one.
pub const DEFAULT_LIBAPI_WORKSPACE_BYTES: u64 = 16 * 1024 * 1024;

/// Slack added on top of the computed workspace size.
pub const DEFAULT_SAFETY_PAD_BYTES: u64 = 1024 * 1024 * 1024;

/// Configuration for the tiling planner.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PlannerConfig {
    /// Logger configuration for planning decisions.
    #[serde(default)]
    pub logger: LoggerConfig<PlannerLogLevel>,

    /// Scratch bytes requested by the inner matmul library.
    #[serde(default = "default_libapi_workspace_bytes")]
    pub libapi_workspace_bytes: u64,

    /// Padding added to every reported workspace size.
    #[serde(default = "default_safety_pad_bytes")]
    pub safety_pad_bytes: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            logger: Default::default(),
            libapi_workspace_bytes: default_libapi_workspace_bytes(),
            safety_pad_bytes: default_safety_pad_bytes(),
        }
    }
}

fn default_libapi_workspace_bytes() -> u64 {
    DEFAULT_LIBAPI_WORKSPACE_BYTES
}

fn default_safety_pad_bytes() -> u64 {
    DEFAULT_SAFETY_PAD_BYTES
}

/// Log levels for the tiling planner.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum PlannerLogLevel {
    /// Planner logging is disabled.
    #[default]
    #[serde(rename = "disabled")]
    Disabled,

    /// The selected tiling and variant selector are logged.
    #[serde(rename = "basic")]
    Basic,

    /// Every workspace region and partition is logged as well.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for PlannerLogLevel {}
