use super::GlobalConfig;
use crate::config::{pipeline::PipelineLogLevel, planner::PlannerLogLevel};
use alloc::{string::ToString, sync::Arc, vec::Vec};
use core::fmt::Display;
use hashbrown::HashMap;

#[cfg(feature = "std")]
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Configuration for one logging category, parameterized by a log level type.
///
/// Several sinks can be enabled at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled.
    #[serde(default)]
    #[cfg(feature = "std")]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional forwarding to the `log` crate at the given level.
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this category.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            #[cfg(feature = "std")]
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: Some(LogCrateLevel::Debug),
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

/// Fans planner and pipeline messages out to the sinks configured for each category.
#[derive(Debug)]
pub struct Logger {
    loggers: Vec<LoggerKind>,
    planner_index: Vec<usize>,
    pipeline_index: Vec<usize>,

    /// Global configuration the sinks were built from.
    pub config: Arc<GlobalConfig>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Hash, PartialEq, Eq)]
enum LoggerId {
    #[cfg(feature = "std")]
    File(PathBuf),
    #[cfg(feature = "std")]
    Stdout,
    #[cfg(feature = "std")]
    Stderr,
    LogCrate(LogCrateLevel),
}

impl Logger {
    /// Creates a new `Logger` from the global configuration.
    ///
    /// Opening file sinks makes this relatively expensive; build one per planner or executor.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Creates a new `Logger` from an explicit configuration.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        let mut loggers = Vec::new();
        let mut planner_index = Vec::new();
        let mut pipeline_index = Vec::new();
        let mut logger2index = HashMap::<LoggerId, usize>::new();

        if config.planner.logger.level != PlannerLogLevel::Disabled {
            register_logger(
                &config.planner.logger,
                &mut planner_index,
                &mut loggers,
                &mut logger2index,
            );
        }

        if config.pipeline.logger.level != PipelineLogLevel::Disabled {
            register_logger(
                &config.pipeline.logger,
                &mut pipeline_index,
                &mut loggers,
                &mut logger2index,
            );
        }

        Self {
            loggers,
            planner_index,
            pipeline_index,
            config,
        }
    }

    /// Logs a planner message to every configured planner sink.
    pub fn log_planner<S: Display>(&mut self, msg: &S) {
        let indices = core::mem::take(&mut self.planner_index);
        self.log_all(msg, &indices);
        self.planner_index = indices;
    }

    /// Logs a pipeline message to every configured pipeline sink.
    pub fn log_pipeline<S: Display>(&mut self, msg: &S) {
        let indices = core::mem::take(&mut self.pipeline_index);
        self.log_all(msg, &indices);
        self.pipeline_index = indices;
    }

    /// Current planner log level.
    pub fn log_level_planner(&self) -> PlannerLogLevel {
        self.config.planner.logger.level
    }

    /// Current pipeline log level.
    pub fn log_level_pipeline(&self) -> PipelineLogLevel {
        self.config.pipeline.logger.level
    }

    fn log_all<S: Display>(&mut self, msg: &S, indices: &[usize]) {
        match indices {
            [] => {}
            [index] => self.loggers[*index].log(msg),
            _ => {
                let msg = msg.to_string();
                for index in indices {
                    self.loggers[*index].log(&msg);
                }
            }
        }
    }
}

fn register_logger<L: LogLevel>(
    kind: &LoggerConfig<L>,
    setting_index: &mut Vec<usize>,
    loggers: &mut Vec<LoggerKind>,
    logger2index: &mut HashMap<LoggerId, usize>,
) {
    let mut push = |id: LoggerId, build: &dyn Fn() -> Option<LoggerKind>| {
        if let Some(index) = logger2index.get(&id) {
            setting_index.push(*index);
        } else if let Some(logger) = build() {
            let index = loggers.len();
            logger2index.insert(id, index);
            loggers.push(logger);
            setting_index.push(index);
        }
    };

    #[cfg(feature = "std")]
    if let Some(file) = &kind.file {
        let append = kind.append;
        push(LoggerId::File(file.clone()), &|| {
            FileLogger::new(file, append).map(LoggerKind::File)
        });
    }

    #[cfg(feature = "std")]
    if kind.stdout {
        push(LoggerId::Stdout, &|| Some(LoggerKind::Stdout));
    }

    #[cfg(feature = "std")]
    if kind.stderr {
        push(LoggerId::Stderr, &|| Some(LoggerKind::Stderr));
    }

    if let Some(level) = kind.log {
        push(LoggerId::LogCrate(level), &|| Some(LoggerKind::Log(level)));
    }
}

#[derive(Debug)]
enum LoggerKind {
    #[cfg(feature = "std")]
    File(FileLogger),
    #[cfg(feature = "std")]
    Stdout,
    #[cfg(feature = "std")]
    Stderr,
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            #[cfg(feature = "std")]
            LoggerKind::File(file_logger) => file_logger.log(msg),
            #[cfg(feature = "std")]
            LoggerKind::Stdout => println!("{msg}"),
            #[cfg(feature = "std")]
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

#[derive(Debug)]
#[cfg(feature = "std")]
struct FileLogger {
    writer: BufWriter<File>,
}

#[cfg(feature = "std")]
impl FileLogger {
    fn new(path: &PathBuf, append: bool) -> Option<Self> {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path);

        match file {
            Ok(file) => Some(Self {
                writer: BufWriter::new(file),
            }),
            Err(err) => {
                log::warn!("Unable to open log file {path:?}: {err}");
                None
            }
        }
    }

    fn log<S: Display>(&mut self, msg: &S) {
        let written = writeln!(self.writer, "{msg}").and_then(|_| self.writer.flush());
        if let Err(err) = written {
            log::warn!("Unable to write to log file: {err}");
        }
    }
}
