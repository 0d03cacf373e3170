//! Outbound telemetry connection.
//!
//! The link is an explicit state machine:
//! `Disconnected -> Connecting -> Connected -> (failure) Backoff -> Connecting ...`
//! Every network operation is bounded by one sample interval, and a frame that
//! cannot be delivered right now is dropped rather than queued.

use crate::common::config::ClientSettings;
use crate::common::error::FanError;
use crate::common::protocol::TelemetryFrame;
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// Outcome of offering one frame to the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
}

/// Capped exponential reconnect delay
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait after the failure being recorded now
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct TelemetryLink {
    host: String,
    port: u16,
    state: LinkState,
    stream: Option<TcpStream>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    op_timeout: Duration,
    failures: u32,
    reconnects: u64,
}

impl TelemetryLink {
    pub fn new(settings: &ClientSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            state: LinkState::Disconnected,
            stream: None,
            backoff: Backoff::new(settings.backoff_initial, settings.backoff_max),
            retry_at: None,
            op_timeout: settings.sleep_interval,
            failures: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Consecutive failures since the last delivered frame
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Delay the next failure will be penalised with
    pub fn pending_backoff(&self) -> Duration {
        self.backoff.peek()
    }

    /// Offer a frame to the server, connecting first if needed.
    ///
    /// Never blocks past one sample interval and never returns an error: a
    /// failure moves the link into backoff and the frame is discarded.
    pub async fn send(&mut self, frame: &TelemetryFrame) -> Delivery {
        let now = Instant::now();

        if self.state == LinkState::Backoff {
            match self.retry_at {
                Some(at) if now < at => {
                    debug!(
                        "Link in backoff for another {:?}, dropping frame {}",
                        at - now,
                        frame.sequence
                    );
                    return Delivery::Dropped;
                }
                _ => self.state = LinkState::Disconnected,
            }
        }

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode frame {}: {}", frame.sequence, e);
                return Delivery::Dropped;
            }
        };

        let deadline = now + self.op_timeout;
        match timeout_at(deadline, self.deliver(&bytes)).await {
            Ok(Ok(())) => {
                self.record_delivery();
                Delivery::Sent
            }
            Ok(Err(e)) => {
                self.record_failure(now, &e);
                Delivery::Dropped
            }
            Err(_) => {
                let e = FanError::LinkFailure(format!(
                    "no progress within {:?}",
                    self.op_timeout
                ));
                self.record_failure(now, &e);
                Delivery::Dropped
            }
        }
    }

    async fn deliver(&mut self, bytes: &[u8]) -> Result<(), FanError> {
        if self.stream.is_none() {
            self.state = LinkState::Connecting;
            debug!("Connecting to {}:{}", self.host, self.port);
            let stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    FanError::LinkFailure(format!("connect to {}:{}: {}", self.host, self.port, e))
                })?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle: {}", e);
            }
            self.stream = Some(stream);
            self.state = LinkState::Connected;
            info!("Connected to fan daemon at {}:{}", self.host, self.port);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FanError::LinkFailure("no stream after connect".to_string()))?;
        stream
            .write_all(bytes)
            .await
            .map_err(|e| FanError::LinkFailure(format!("send: {}", e)))
    }

    pub(crate) fn record_delivery(&mut self) {
        if self.failures > 0 {
            self.reconnects += 1;
            info!(
                "Telemetry resumed after {} failed attempt(s) (total reconnects: {})",
                self.failures, self.reconnects
            );
        }
        self.failures = 0;
        self.retry_at = None;
        self.state = LinkState::Connected;
        self.backoff.reset();
    }

    pub(crate) fn record_failure(&mut self, now: Instant, reason: &FanError) {
        self.stream = None;
        self.failures += 1;
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        self.state = LinkState::Backoff;

        if self.failures == 1 {
            warn!("{}; retrying in {:?}", reason, delay);
        } else {
            debug!(
                "{} (attempt {}); retrying in {:?}",
                reason, self.failures, delay
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::protocol::TemperatureSample;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn settings(port: u16) -> ClientSettings {
        ClientSettings {
            host: "127.0.0.1".to_string(),
            port,
            sleep_interval: Duration::from_millis(500),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            sensors: BTreeMap::new(),
        }
    }

    fn frame(sequence: u64) -> TelemetryFrame {
        TelemetryFrame::new(
            sequence,
            vec![TemperatureSample {
                gpu_id: "gpu0".to_string(),
                value_millidegree: 60000,
                sequence,
                timestamp_ms: 0,
            }],
        )
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_cap_below_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failures_grow_backoff_and_delivery_resets_it() {
        let mut link = TelemetryLink::new(&settings(7777));
        let now = Instant::now();
        let reason = FanError::LinkFailure("refused".to_string());

        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            link.record_failure(now, &reason);
            let delay = link.retry_at.unwrap() - now;
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(link.state(), LinkState::Backoff);
        assert_eq!(link.failures(), 10);

        link.record_delivery();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.failures(), 0);
        assert_eq!(link.reconnects(), 1);
        assert_eq!(link.pending_backoff(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_refused_connection_enters_backoff_and_drops() {
        let mut link = TelemetryLink::new(&settings(closed_port()));

        assert_eq!(link.send(&frame(1)).await, Delivery::Dropped);
        assert_eq!(link.state(), LinkState::Backoff);
        assert_eq!(link.failures(), 1);

        // Still inside the 1s backoff window: no new attempt is made
        assert_eq!(link.send(&frame(2)).await, Delivery::Dropped);
        assert_eq!(link.failures(), 1);
        assert_eq!(link.pending_backoff(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_frames_arrive_as_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut link = TelemetryLink::new(&settings(port));

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut received = Vec::new();
            for _ in 0..2 {
                let line = lines.next_line().await.unwrap().unwrap();
                received.push(TelemetryFrame::decode(&line).unwrap());
            }
            received
        });

        assert_eq!(link.send(&frame(1)).await, Delivery::Sent);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.send(&frame(2)).await, Delivery::Sent);

        let received = server.await.unwrap();
        assert_eq!(received[0].sequence, 1);
        assert_eq!(received[1].sequence, 2);
        assert_eq!(received[1].samples[0].value_millidegree, 60000);
    }

    #[tokio::test]
    async fn test_reconnects_once_server_comes_up() {
        let port = closed_port();
        let mut settings = settings(port);
        settings.backoff_initial = Duration::from_millis(20);
        let mut link = TelemetryLink::new(&settings);

        assert_eq!(link.send(&frame(1)).await, Delivery::Dropped);
        assert_eq!(link.state(), LinkState::Backoff);

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let line = BufReader::new(stream).lines().next_line().await.unwrap().unwrap();
            TelemetryFrame::decode(&line).unwrap()
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(link.send(&frame(2)).await, Delivery::Sent);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.reconnects(), 1);
        assert_eq!(link.failures(), 0);
        assert_eq!(link.pending_backoff(), Duration::from_millis(20));

        assert_eq!(server.await.unwrap().sequence, 2);
    }
}
