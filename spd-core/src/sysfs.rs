//! Thin helpers for the kernel file interfaces
//!
//! Every monitor opens and closes its own descriptors per poll; nothing here
//! caches open files. Reads go through [`read_trimmed`] / [`consume`], writes
//! through [`write_str`], and POLLPRI-capable attributes are waited on with
//! [`wait_pri`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use spd_error::{DaemonError, Result};

/// Outcome of waiting on a sysfs attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// The kernel signalled POLLPRI/POLLERR; the value should be re-read
    Updated,
    /// The wait elapsed without a notification
    TimedOut,
}

/// Read a file to a string with the trailing newline stripped
pub fn read_trimmed(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| DaemonError::file_read(path, e))?;
    Ok(raw.trim().to_string())
}

/// Read a file and parse it as a decimal integer
pub fn read_i64(path: impl AsRef<Path>) -> Result<i64> {
    let path = path.as_ref();
    let value = read_trimmed(path)?;
    value
        .parse::<i64>()
        .map_err(|_| DaemonError::value_parse(path, value))
}

/// Write a string to a control file
pub fn write_str(path: impl AsRef<Path>, value: &str) -> Result<()> {
    let path = path.as_ref();
    std::fs::write(path, value).map_err(|e| DaemonError::file_write(path, e))
}

/// Read an already-open attribute from the beginning
///
/// Sysfs attributes must be re-read from offset zero after a notification.
pub fn consume(file: &File, path: &Path) -> Result<String> {
    let mut file_ref = file;
    file_ref
        .seek(SeekFrom::Start(0))
        .map_err(|e| DaemonError::file_read(path, e))?;
    let mut buf = String::new();
    file_ref
        .read_to_string(&mut buf)
        .map_err(|e| DaemonError::file_read(path, e))?;
    Ok(buf.trim().to_string())
}

/// Block until the attribute signals POLLPRI|POLLERR or the timeout elapses
///
/// The caller must have consumed the current value first, otherwise the poll
/// returns immediately.
pub fn wait_pri(file: &File, path: &Path, timeout: Duration) -> Result<NodeEvent> {
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

    // SAFETY: pfd points to a valid pollfd for the duration of the call and
    // nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(DaemonError::Poll {
            path: path.to_path_buf(),
            source: std::io::Error::last_os_error(),
        });
    }
    if rc == 0 {
        Ok(NodeEvent::TimedOut)
    } else {
        Ok(NodeEvent::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("spd-sysfs-{}-{}", std::process::id(), name));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn read_trimmed_strips_newline() {
        let path = temp_file("trim", "42\n");
        assert_eq!(read_trimmed(&path).unwrap(), "42");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn read_i64_rejects_garbage() {
        let path = temp_file("garbage", "not-a-number\n");
        assert!(matches!(
            read_i64(&path),
            Err(DaemonError::ValueParse { .. })
        ));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn consume_rewinds_between_reads() {
        let path = temp_file("rewind", "7\n");
        let file = File::open(&path).unwrap();
        assert_eq!(consume(&file, &path).unwrap(), "7");
        assert_eq!(consume(&file, &path).unwrap(), "7");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = read_trimmed("/nonexistent/spd-core-test").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/spd-core-test"));
    }
}
