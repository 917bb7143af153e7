use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps printable ASCII and whitespace only.
pub fn filter_printable_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect()
}

/// Escapes control characters so a line stays on one line in the log file.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

/// Creates the parent directory of `path` when it has one.
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
            std::fs::create_dir_all(parent)
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
        })
    }
}

/// Log sink writing every event to stdout and, when configured, to a file.
///
/// One logger is built per invocation and handed to whatever needs it; call
/// [`Logger::flush`] before the process exits.
#[derive(Clone)]
pub struct Logger {
    component: String,
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    raw_display: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, component: &str) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            ensure_parent_dir(&path)?;

            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self {
            component: component.to_string(),
            writer,
            raw_display: false,
        })
    }

    /// Logger that only prints to stdout.
    pub fn console(component: &str) -> Self {
        Self {
            component: component.to_string(),
            writer: None,
            raw_display: false,
        }
    }

    /// Print unfiltered text on the console. The file always gets escaped text.
    pub fn with_raw_display(mut self, raw_display: bool) -> Self {
        self.raw_display = raw_display;
        self
    }

    /// Same sink, different component name.
    pub fn named(&self, component: &str) -> Self {
        Self {
            component: component.to_string(),
            writer: self.writer.clone(),
            raw_display: self.raw_display,
        }
    }

    pub async fn log(&self, level: Level, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("{} [{}] {}: {}\n", timestamp, level, self.component, message);

        if self.raw_display {
            print!("{}", log_line);
        } else {
            print!("{}", filter_printable_chars(&log_line));
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let file_line = format!(
                "{} [{}] {}: {}\n",
                timestamp,
                level,
                self.component,
                safe_log_string(message)
            );
            let _ = writer.write_all(file_line.as_bytes());
            let _ = writer.flush();
        }
    }

    pub async fn info(&self, message: &str) {
        self.log(Level::Info, message).await
    }

    pub async fn warn(&self, message: &str) {
        self.log(Level::Warning, message).await
    }

    pub async fn error(&self, message: &str) {
        self.log(Level::Error, message).await
    }

    /// Logs a failure together with its full cause chain.
    pub async fn exception(&self, message: &str, err: &anyhow::Error) {
        self.log(Level::Error, &format!("{}: {:#}", message, err)).await;
        for (depth, cause) in err.chain().enumerate().skip(1) {
            self.log(Level::Error, &format!("  caused by [{}]: {}", depth, cause))
                .await;
        }
    }

    pub async fn peer(&self, client_addr: &SocketAddr, message: &str) {
        self.info(&format!("{} {}", client_addr, message)).await
    }

    /// Multi-line framed block, used for received message dumps.
    pub async fn log_verbose(&self, client_addr: &SocketAddr, title: &str, details: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let separator = "=".repeat(60);

        let block = |details: &str| {
            format!(
                "{}\n{} {} {}\n{}\n{}\n{}\n\n",
                separator, timestamp, client_addr, title, separator, details, separator
            )
        };

        if self.raw_display {
            print!("{}", block(details));
        } else {
            print!("{}", filter_printable_chars(&block(&safe_log_string(details))));
        }

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(block(&safe_log_string(details)).as_bytes());
            let _ = writer.flush();
        }
    }

    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            let _ = writer.lock().await.flush();
        }
    }
}
