use super::{pipeline::PipelineConfig, planner::PlannerConfig};
use alloc::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static PROLOG_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// File names searched when loading the configuration from disk.
const CONFIG_FILE_NAMES: [&str; 2] = ["mla-prolog.toml", "MlaProlog.toml"];

/// Represents the global configuration, combining planner and pipeline settings.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration for the tiling planner.
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Configuration for the pipeline executor.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `mla-prolog.toml` or
    /// `MlaProlog.toml` in the current directory or its parents, then from the user config
    /// directory. If no file is found, a default configuration is used.
    ///
    /// # Notes
    ///
    /// Calling this function takes a global lock. Read the values you need once, at planner or
    /// executor construction, instead of fetching the config in hot loops.
    pub fn get() -> Arc<Self> {
        let mut state = PROLOG_GLOBAL_CONFIG.lock();

        if let Some(config) = state.as_ref() {
            return config.clone();
        }

        cfg_if::cfg_if! {
            if #[cfg(feature = "std")] {
                let config = Self::from_current_dir().override_from_env();
            } else {
                let config = Self::default();
            }
        }

        let config = Arc::new(config);
        *state = Some(config.clone());
        config
    }

    /// Save the current configuration to the provided file path.
    #[cfg(feature = "std")]
    pub fn save_default<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<()> {
        use std::io::Write;

        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = PROLOG_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    /// Overrides configuration fields based on environment variables.
    #[cfg(feature = "std")]
    pub fn override_from_env(mut self) -> Self {
        use super::{pipeline::PipelineLogLevel, planner::PlannerLogLevel};

        if let Ok(val) = std::env::var("MLA_PROLOG_DEBUG_LOG") {
            self.planner.logger.level = PlannerLogLevel::Full;
            self.pipeline.logger.level = PipelineLogLevel::Basic;

            match val.as_str() {
                "stdout" => {
                    self.planner.logger.stdout = true;
                    self.pipeline.logger.stdout = true;
                }
                "stderr" => {
                    self.planner.logger.stderr = true;
                    self.pipeline.logger.stderr = true;
                }
                "1" | "true" => {
                    let file_path = "/tmp/mla-prolog.log";
                    self.planner.logger.file = Some(file_path.into());
                    self.pipeline.logger.file = Some(file_path.into());
                }
                "0" | "false" => {
                    self.planner.logger.level = PlannerLogLevel::Disabled;
                    self.pipeline.logger.level = PipelineLogLevel::Disabled;
                }
                file_path => {
                    self.planner.logger.file = Some(file_path.into());
                    self.pipeline.logger.file = Some(file_path.into());
                }
            }
        }

        if let Ok(val) = std::env::var("MLA_PROLOG_WATCHDOG_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => self.pipeline.watchdog_timeout_ms = ms,
                _ => log::warn!("Ignoring invalid MLA_PROLOG_WATCHDOG_MS value {val:?}"),
            }
        }

        self
    }

    // Traverses up the directory tree until a valid configuration file is found or the root is
    // reached, then tries the user config directory.
    #[cfg(feature = "std")]
    fn from_current_dir() -> Self {
        if let Ok(mut dir) = std::env::current_dir() {
            loop {
                for name in CONFIG_FILE_NAMES {
                    if let Ok(content) = Self::from_file_path(dir.join(name)) {
                        return content;
                    }
                }

                if !dir.pop() {
                    break;
                }
            }
        }

        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("mla-prolog").join(CONFIG_FILE_NAMES[0]);
            if let Ok(content) = Self::from_file_path(path) {
                return content;
            }
        }

        Self::default()
    }

    // Loads configuration from a specified file path.
    #[cfg(feature = "std")]
    fn from_file_path<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match toml::from_str(&content) {
            Ok(val) => val,
            Err(err) => panic!("The file provided doesn't have the right format => {err:?}"),
        };

        Ok(config)
    }
}
