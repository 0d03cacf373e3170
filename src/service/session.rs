//! Inbound telemetry sessions.
//!
//! One guest feeds the daemon at a time. A newer connection always replaces
//! the current one, which covers a guest that rebooted before the old socket
//! timed out on the host side.

use crate::common::error::Result;
use crate::common::protocol::{MAX_FRAME_LEN, TelemetryFrame};
use crate::service::state::{FanTable, Freshness, GpuState};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Accepted, no valid frame yet
    Connecting,
    Connected,
    /// Still open but nothing arrived within the staleness timeout
    Stale,
    Disconnected,
}

#[derive(Debug)]
pub struct Connection {
    pub peer: SocketAddr,
    pub established_at: Instant,
    pub last_activity: Option<Instant>,
    pub status: ConnectionStatus,
}

impl Connection {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            established_at: Instant::now(),
            last_activity: None,
            status: ConnectionStatus::Connecting,
        }
    }
}

pub struct SessionManager {
    table: FanTable,
    listener: TcpListener,
    staleness_timeout: Duration,
}

/// Aborts the serving task when replaced or when the manager goes away.
struct ActiveSession(Option<JoinHandle<()>>);

impl ActiveSession {
    fn replace(&mut self, next: JoinHandle<()>, peer: SocketAddr) {
        if let Some(previous) = self.0.take() {
            if !previous.is_finished() {
                info!("Telemetry from {} replaces the current session", peer);
            }
            previous.abort();
        }
        self.0 = Some(next);
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl SessionManager {
    pub async fn bind(
        host: &str,
        port: u16,
        table: FanTable,
        staleness_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("Listening for telemetry on {}", listener.local_addr()?);

        Ok(Self {
            table,
            listener,
            staleness_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, keeping only the newest one.
    pub async fn run(self) {
        let mut active = ActiveSession(None);

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let task = tokio::spawn(serve(
                        stream,
                        peer,
                        self.table.clone(),
                        self.staleness_timeout,
                    ));
                    active.replace(task, peer);
                }
                Err(e) => {
                    warn!("Failed to accept telemetry connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr, table: FanTable, staleness: Duration) {
    let mut conn = Connection::new(peer);
    info!("Telemetry connection from {}", peer);

    let mut reader = BufReader::new(stream);
    let mut line = Vec::with_capacity(512);
    let mut unknown = BTreeSet::new();

    loop {
        // One byte over the limit tells an oversized frame from a full one
        let budget = (MAX_FRAME_LEN + 1).saturating_sub(line.len()) as u64;
        let read = timeout(
            staleness,
            (&mut reader).take(budget).read_until(b'\n', &mut line),
        )
        .await;

        match read {
            Err(_) => {
                if conn.status != ConnectionStatus::Stale {
                    warn!("No telemetry from {} for {:?}", peer, staleness);
                    conn.status = ConnectionStatus::Stale;
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!("Telemetry connection from {} failed: {}", peer, e);
                break;
            }
            Ok(Ok(0)) => {
                info!("Telemetry connection from {} closed", peer);
                break;
            }
            Ok(Ok(_)) => {}
        }

        if !line.ends_with(b"\n") {
            if line.len() > MAX_FRAME_LEN {
                warn!(
                    "Frame from {} exceeds {} bytes, closing connection",
                    peer, MAX_FRAME_LEN
                );
                break;
            }
            continue;
        }

        let now = Instant::now();
        let text = String::from_utf8_lossy(&line).into_owned();
        if text.trim().is_empty() {
            line.clear();
            continue;
        }

        match TelemetryFrame::decode(&text) {
            Ok(frame) => {
                if conn.status == ConnectionStatus::Stale {
                    info!("Telemetry from {} resumed", peer);
                }
                conn.status = ConnectionStatus::Connected;
                conn.last_activity = Some(now);
                ingest(&mut table.lock(), &frame, now, &mut unknown);
            }
            Err(e) => warn!("Dropping frame from {}: {}", peer, e),
        }
        line.clear();
    }

    conn.status = ConnectionStatus::Disconnected;
    debug!(
        "Session with {} lasted {:?}",
        conn.peer,
        conn.established_at.elapsed()
    );
    table.expire_all();
}

/// Record every sample of a frame on the fans it drives.
///
/// Returns how many fan states were updated. GPU ids no fan references are
/// warned about once per session.
pub fn ingest(
    states: &mut BTreeMap<String, GpuState>,
    frame: &TelemetryFrame,
    now: Instant,
    unknown: &mut BTreeSet<String>,
) -> usize {
    if frame.is_heartbeat() {
        debug!("Heartbeat {}", frame.sequence);
        return 0;
    }

    let mut updated = 0;
    for sample in &frame.samples {
        let mut matched = false;
        for state in states
            .values_mut()
            .filter(|s| s.reference_gpu == sample.gpu_id)
        {
            state.record(sample.clone(), now);
            matched = true;
            updated += 1;
        }

        if matched {
            debug!(
                "{}: {}m°C (seq {})",
                sample.gpu_id, sample.value_millidegree, sample.sequence
            );
        } else if unknown.insert(sample.gpu_id.clone()) {
            warn!("Ignoring telemetry for unconfigured GPU {}", sample.gpu_id);
        }
    }

    updated
}

/// Reclassify every fan's data and log the edges.
///
/// A fan coming back to fresh data forgets its hysteresis history, so the
/// first new sample is applied as-is.
pub fn watchdog(states: &mut BTreeMap<String, GpuState>, now: Instant, staleness: Duration) {
    for state in states.values_mut() {
        let next = state.classify(now, staleness);
        if next == state.freshness {
            continue;
        }

        match next {
            Freshness::Fresh => {
                info!("{}: receiving temperatures from {}", state.fan_id, state.reference_gpu);
                state.hysteresis.reset();
            }
            Freshness::Stale => warn!(
                "{}: no fresh temperature from {} within {:?}, using failsafe speed",
                state.fan_id, state.reference_gpu, staleness
            ),
            Freshness::Never => {}
        }
        state.freshness = next;
    }
}
