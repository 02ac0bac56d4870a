// src/logging.rs
//
// Process log: every `tlog!` line goes to stderr, and to a log file once
// `init_file_logging` has been called.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Name of the symlink that always points at the newest log file.
const LATEST_LINK: &str = "pinbridge.log";

/// Open log file, if file logging is on.
pub(crate) static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

/// Local wall-clock prefix for log lines.
pub(crate) fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Write one already-formatted line to stderr and the log file.
pub(crate) fn write_line(message: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", stamp(), message);
    eprintln!("{}", line);
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// Start appending to `<log_dir>/<YYYYmmdd-HHMMSS>-pinbridge.log`.
/// On Unix `pinbridge.log` is re-pointed at the new file.
pub(crate) fn init_file_logging(log_dir: &Path) -> Result<PathBuf, String> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {}", log_dir.display(), e))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-pinbridge.log")
        .to_string();
    let log_path = log_dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| format!("Failed to open log file {}: {}", log_path.display(), e))?;

    #[cfg(unix)]
    {
        let link = log_dir.join(LATEST_LINK);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            write_line(format_args!("[logging] Could not link {}: {}", LATEST_LINK, e));
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    write_line(format_args!("[logging] Writing log to {}", log_path.display()));

    Ok(log_path)
}

/// Close the log file; later lines go to stderr only.
pub(crate) fn stop_file_logging() {
    let was_open = LOG_FILE
        .lock()
        .map(|mut guard| guard.take().is_some())
        .unwrap_or(false);
    if was_open {
        write_line(format_args!("[logging] File logging stopped"));
    }
}

/// `eprintln!` with a timestamp, mirrored to the log file when enabled.
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::write_line(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_format() {
        let s = stamp();
        // HH:MM:SS.mmm
        assert_eq!(s.len(), 12);
        assert_eq!(&s[2..3], ":");
        assert_eq!(&s[8..9], ".");
    }

    #[test]
    fn test_file_logging_writes_lines() {
        let dir = std::env::temp_dir().join(format!(
            "pinbridge-logging-{}-{}",
            std::process::id(),
            crate::io::now_us()
        ));
        let path = init_file_logging(&dir).unwrap();
        tlog!("[test] marker line {}", 42);
        stop_file_logging();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("[test] marker line 42"));
        #[cfg(unix)]
        assert!(dir.join(LATEST_LINK).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
