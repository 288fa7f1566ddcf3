// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Line-oriented backend for the `log` facade.
//!
//! Records are rendered either as plain text or as one JSON object per line and
//! written to a log file, stdout, or both. Key-values attached with the `log`
//! kv syntax (`info!(status = "ok"; "run completed")`) become extra fields.

use log::kv::{self, Key, Value, VisitSource};
use log::{LevelFilter, Log, Metadata, Record};
use serde_json::{Map, Value as JsonValue};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("creating log directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("opening log file {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("installing logger: {0}")]
    AlreadySet(#[from] log::SetLoggerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub level: LevelFilter,
    /// Appended to when set; parent directories are created.
    pub file: Option<PathBuf>,
    pub format: Format,
    pub also_stdout: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file: None,
            format: Format::Text,
            also_stdout: true,
        }
    }
}

/// Map a configuration level name to a filter. Unknown names mean `info`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

pub struct Logger {
    app: &'static str,
    level: LevelFilter,
    format: Format,
    file: Option<Mutex<File>>,
    stdout: bool,
}

impl Logger {
    pub fn new(app: &'static str, config: &Config) -> Result<Self, InitError> {
        let file = match config.file {
            Some(ref path) => Some(Mutex::new(open_log_file(path)?)),
            None => None,
        };
        // Never drop records on the floor: without a file, stdout is the sink.
        let stdout = config.also_stdout || file.is_none();
        Ok(Self {
            app,
            level: config.level,
            format: config.format,
            file,
            stdout,
        })
    }
}

/// Install the global logger. Can only succeed once per process.
pub fn init(app: &'static str, config: &Config) -> Result<(), InitError> {
    let logger = Logger::new(app, config)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(config.level);
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File, InitError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| InitError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Open {
            path: path.to_path_buf(),
            source,
        })
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = render_line(self.format, self.app, record, OffsetDateTime::now_utc());
        line.push('\n');

        if let Some(ref file) = self.file
            && let Ok(mut f) = file.lock()
        {
            let _ = f.write_all(line.as_bytes());
        }
        if self.stdout {
            let _ = io::stdout().lock().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Some(ref file) = self.file
            && let Ok(mut f) = file.lock()
        {
            let _ = f.flush();
        }
        let _ = io::stdout().flush();
    }
}

struct CollectPairs<'a>(&'a mut Vec<(String, String)>);

impl<'kvs> VisitSource<'kvs> for CollectPairs<'_> {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), kv::Error> {
        self.0.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

/// Render one record without the trailing newline.
pub fn render_line(format: Format, app: &str, record: &Record, now: OffsetDateTime) -> String {
    let time = now
        .format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    let mut pairs = Vec::new();
    let _ = record.key_values().visit(&mut CollectPairs(&mut pairs));

    match format {
        Format::Text => {
            let mut line = format!(
                "{time} {:<5} [{}] {} app={app}",
                record.level(),
                record.target(),
                record.args()
            );
            for (k, v) in pairs {
                if v.contains(char::is_whitespace) {
                    line.push_str(&format!(" {k}={v:?}"));
                } else {
                    line.push_str(&format!(" {k}={v}"));
                }
            }
            line
        }
        Format::Json => {
            let mut obj = Map::new();
            obj.insert("time".into(), JsonValue::String(time));
            obj.insert("level".into(), JsonValue::String(record.level().to_string()));
            obj.insert("app".into(), JsonValue::String(app.to_string()));
            obj.insert("target".into(), JsonValue::String(record.target().to_string()));
            obj.insert("msg".into(), JsonValue::String(record.args().to_string()));
            for (k, v) in pairs {
                obj.insert(k, JsonValue::String(v));
            }
            JsonValue::Object(obj).to_string()
        }
    }
}
