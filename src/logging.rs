//! Log output: `[timestamp] [level] message` lines to the console and to a
//! size-rotated file under the log directory.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Settings;

/// Formats events as `[2024-01-01 10:00:00.123] [INFO] message key=value`
#[derive(Debug, Clone, Copy, Default)]
pub struct BracketedFormat;

impl<S, N> FormatEvent<S, N> for BracketedFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = chrono::Local::now();
        write!(
            writer,
            "[{}] [{}] ",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Append-only log file that rotates to `<name>.1 .. <name>.N` once it
/// would grow past `max_bytes`.
#[derive(Debug)]
pub struct RollingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RollingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups == 0 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))?;

        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Console and rotated-file logging for the long-running orchestrator
pub fn init(settings: &Settings, verbose: bool) -> Result<()> {
    let log_file = settings.log_file();
    let file = RollingFile::open(
        &log_file,
        settings.logging.max_bytes,
        settings.logging.backups,
    )
    .with_context(|| format!("Failed to open log file: {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(tracing_subscriber::fmt::layer().event_format(BracketedFormat))
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(BracketedFormat)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(())
}

/// Console-only logging on stderr, for one-shot commands
pub fn init_console(verbose: bool) {
    // Ignore a second install (tests, embedding)
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(BracketedFormat)
                .with_writer(io::stderr),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_keeps_backups() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs").join("orchestrator.log");
        let mut log = RollingFile::open(&path, 16, 2).unwrap();

        for i in 0..5 {
            log.write_all(format!("line number {}\n", i).as_bytes())
                .unwrap();
        }
        log.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "line number 4\n");
        assert_eq!(
            fs::read_to_string(temp.path().join("logs/orchestrator.log.1")).unwrap(),
            "line number 3\n"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("logs/orchestrator.log.2")).unwrap(),
            "line number 2\n"
        );
        assert!(!temp.path().join("logs/orchestrator.log.3").exists());
    }

    #[test]
    fn test_reopen_continues_size_count() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("orchestrator.log");
        fs::write(&path, "0123456789").unwrap();

        let mut log = RollingFile::open(&path, 12, 1).unwrap();
        log.write_all(b"abcdef").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "abcdef");
        assert_eq!(
            fs::read_to_string(temp.path().join("orchestrator.log.1")).unwrap(),
            "0123456789"
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_bracketed_format() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .event_format(BracketedFormat)
                .with_ansi(false)
                .with_writer(move || writer.clone()),
        );

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(task = "exp1", "Service lost");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.starts_with('['));
        assert!(output.contains("] [WARN] "));
        assert!(output.contains("Service lost"));
        assert!(output.contains("task=\"exp1\""));
        assert!(output.ends_with('\n'));
    }
}
