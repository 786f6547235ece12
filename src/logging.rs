use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, SystemTime};

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();
static FILE_SINK: Mutex<Option<FileSink>> = Mutex::new(None);

/// Rotate the durable log once it grows past this size.
pub const MAX_LOG_FILE_BYTES: u64 = 256 * 1024;

#[allow(dead_code)]
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Append-only log file on the storage card, kept for post-mortem diagnosis.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Open `path` for appending, moving an oversized log to `<path>.old` first.
    pub fn open(path: &Path, max_bytes: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::metadata(path).map(|m| m.len() > max_bytes).unwrap_or(false) {
            let mut old = path.as_os_str().to_owned();
            old.push(".old");
            fs::rename(path, PathBuf::from(old))?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Errors are synced right away; everything else on `flush`.
    pub fn write_line(&mut self, level: Level, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        if level == Level::Error {
            self.file.sync_data()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

fn compact_timestamp(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

fn short_module(path: Option<&str>) -> &str {
    let module = path
        .unwrap_or("unknown")
        .rsplit("::")
        .next()
        .unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((idx, _)) => &module[..idx],
        None => module,
    }
}

/// Plain (uncolored) line as written to the log file.
fn format_plain(ts: &str, level: Level, module: &str, message: &str) -> String {
    format!("{} [{:<5}] {:>12} | {}", ts, level.as_str(), module, message)
}

/// Colored, uptime-stamped console logger that mirrors every line to the log file
struct EnhancedLogger;

impl log::Log for EnhancedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Time since boot
        let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now()
            .duration_since(*boot_time)
            .unwrap_or_default();
        let ts = compact_timestamp(elapsed);

        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };
        let module = short_module(record.module_path());
        let message = format!("{}", record.args());

        // Console output (serial)
        println!(
            "{}{} [{}] {:>12} | {}{}",
            color, ts, level_char, module, message, colors::RESET
        );

        // Durable copy; skip rather than block if another thread holds the file
        if let Ok(mut sink) = FILE_SINK.try_lock() {
            if let Some(sink) = sink.as_mut() {
                let line = format_plain(&ts, record.level(), module, &message);
                if let Err(e) = sink.write_line(record.level(), &line) {
                    println!("log file write failed: {}", e);
                }
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = FILE_SINK.lock() {
            if let Some(sink) = sink.as_mut() {
                let _ = sink.sync();
            }
        }
    }
}

static LOGGER: EnhancedLogger = EnhancedLogger;

/// Initialize the console logger with colors and timestamps
pub fn init_logger() -> anyhow::Result<()> {
    let _ = BOOT_TIME.set(SystemTime::now());
    log::set_logger(&LOGGER).map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    log::set_max_level(LevelFilter::Info);

    println!("{}┌─────────────────────────────────────────┐{}", colors::BRIGHT_GREEN, colors::RESET);
    println!(
        "{}│   {:<38}│{}",
        colors::BRIGHT_GREEN,
        crate::version::banner(),
        colors::RESET
    );
    println!("{}└─────────────────────────────────────────┘{}", colors::BRIGHT_GREEN, colors::RESET);
    Ok(())
}

/// Start mirroring log lines to `path`. Called once the storage card is mounted.
pub fn attach_log_file(path: &Path) -> io::Result<()> {
    let sink = FileSink::open(path, MAX_LOG_FILE_BYTES)?;
    log::info!("Logging to {}", sink.path().display());
    if let Ok(mut slot) = FILE_SINK.lock() {
        *slot = Some(sink);
    }
    Ok(())
}

/// Stop writing to the log file, e.g. before the card is unmounted.
pub fn detach_log_file() {
    if let Ok(mut slot) = FILE_SINK.lock() {
        if let Some(mut sink) = slot.take() {
            let _ = sink.sync();
        }
    }
}

/// Parse a level name; `None` for anything unrecognised
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => Some(LevelFilter::Off),
        "error" => Some(LevelFilter::Error),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "info" => Some(LevelFilter::Info),
        "debug" => Some(LevelFilter::Debug),
        "trace" => Some(LevelFilter::Trace),
        _ => None,
    }
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(lf) => {
            log::set_max_level(lf);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_switch_units() {
        assert_eq!(compact_timestamp(Duration::from_millis(1_250)), "  1.250s");
        assert_eq!(compact_timestamp(Duration::from_secs(125)), " 2m05s");
        assert_eq!(compact_timestamp(Duration::from_secs(3 * 3600 + 120)), " 3h02m");
    }

    #[test]
    fn module_is_last_segment_truncated() {
        assert_eq!(short_module(Some("edge_digitizer::ota::flasher")), "flasher");
        assert_eq!(short_module(Some("a::verylongmodulename")), "verylongmodu");
        assert_eq!(short_module(None), "unknown");
    }

    #[test]
    fn logger_installs_once() {
        init_logger().unwrap();
        let again = init_logger().unwrap_err();
        assert!(again.to_string().contains("Failed to initialize logger"));
        log::info!("logger installed");
    }

    #[test]
    fn level_names() {
        assert_eq!(parse_level("WARNING"), Some(LevelFilter::Warn));
        assert_eq!(parse_level(" debug "), Some(LevelFilter::Debug));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn file_sink_appends_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("ota.log");

        let mut sink = FileSink::open(&path, 64).unwrap();
        let line = format_plain("  0.001s", Level::Error, "flasher", "image corrupted");
        sink.write_line(Level::Error, &line).unwrap();
        sink.write_line(Level::Info, &"x".repeat(80)).unwrap();
        sink.sync().unwrap();
        drop(sink);

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("  0.001s [ERROR]      flasher | image corrupted\n"));

        let sink = FileSink::open(&path, 64).unwrap();
        drop(sink);
        assert!(dir.path().join("log").join("ota.log.old").exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }
}
