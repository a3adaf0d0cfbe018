//! Power-hint sink
//!
//! The coordinator only needs [`HintSink::send_hint`]; the platform
//! power-management service behind it is an external collaborator. The
//! production adapter talks a one-line-JSON request/ack protocol over a Unix
//! socket, connecting lazily and reconnecting on the hint after a failure.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spd_error::{DaemonError, Result};
use tracing::{debug, info, warn};

use crate::monitor::relock;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Destination for power-mode hints
pub trait HintSink: Send + Sync {
    fn send_hint(&self, mode: &str, enable: bool) -> Result<()>;
}

#[derive(Serialize)]
struct HintRequest<'a> {
    mode: &'a str,
    enable: bool,
}

#[derive(Deserialize)]
struct HintAck {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Client for the platform power-management service.
///
/// One JSON object per line in each direction. The connection is established
/// on first use and dropped on any I/O failure; the next hint reconnects.
pub struct PowerServiceClient {
    socket_path: PathBuf,
    conn: Mutex<Option<BufReader<UnixStream>>>,
}

impl PowerServiceClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn connect(&self) -> Result<BufReader<UnixStream>> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            DaemonError::SinkConnect { path: self.socket_path.clone(), source: e }
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).ok();
        stream.set_write_timeout(Some(IO_TIMEOUT)).ok();
        info!("Connected to power service at {}", self.socket_path.display());
        Ok(BufReader::new(stream))
    }

    fn exchange(&self, conn: &mut BufReader<UnixStream>, mode: &str, enable: bool) -> Result<()> {
        let request = serde_json::to_string(&HintRequest { mode, enable })
            .map_err(|e| DaemonError::SinkDispatch { mode: mode.into(), reason: e.to_string() })?;
        let stream = conn.get_ref();
        let mut writer = stream;
        writeln!(writer, "{}", request).map_err(|e| DaemonError::SinkDispatch {
            mode: mode.into(),
            reason: e.to_string(),
        })?;

        let mut line = String::new();
        conn.read_line(&mut line).map_err(|e| DaemonError::SinkDispatch {
            mode: mode.into(),
            reason: e.to_string(),
        })?;
        if line.is_empty() {
            return Err(DaemonError::SinkDispatch {
                mode: mode.into(),
                reason: "connection closed by power service".into(),
            });
        }
        let ack: HintAck = serde_json::from_str(line.trim()).map_err(|e| {
            DaemonError::SinkDispatch { mode: mode.into(), reason: e.to_string() }
        })?;
        if !ack.ok {
            return Err(DaemonError::SinkDispatch {
                mode: mode.into(),
                reason: ack.error.unwrap_or_else(|| "rejected".into()),
            });
        }
        debug!("Power service acknowledged {}={}", mode, enable);
        Ok(())
    }
}

impl HintSink for PowerServiceClient {
    fn send_hint(&self, mode: &str, enable: bool) -> Result<()> {
        let mut guard = relock(self.conn.lock());
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };
        match self.exchange(&mut conn, mode, enable) {
            Ok(()) => {
                *guard = Some(conn);
                Ok(())
            }
            Err(e) => {
                // Drop the connection; the next hint dials again
                warn!("Power service exchange failed, will reconnect: {}", e);
                Err(e)
            }
        }
    }
}

/// Test double collecting every forwarded hint
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, bool)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hints forwarded so far, in order
    pub fn sent(&self) -> Vec<(String, bool)> {
        relock(self.sent.lock()).clone()
    }

    /// Hints for one mode only
    pub fn sent_for(&self, mode: &str) -> Vec<bool> {
        relock(self.sent.lock())
            .iter()
            .filter(|(m, _)| m == mode)
            .map(|&(_, enable)| enable)
            .collect()
    }
}

impl HintSink for RecordingSink {
    fn send_hint(&self, mode: &str, enable: bool) -> Result<()> {
        relock(self.sent.lock()).push((mode.to_string(), enable));
        Ok(())
    }
}
