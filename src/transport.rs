//! # EMS Telegram Transport
//!
//! This module moves whole telegrams between the protocol engine and the bus
//! driver. The driver owns the serial link and the bus timing; it exchanges
//! telegrams with the engine through two named, bounded message queues.
//!
//! ## Responsibilities
//!
//! - Start and stop the bus driver ([`BusDriver`])
//! - Open both queues, retrying on a fixed interval until they exist
//! - Discard a stale backlog left behind by a long running driver
//! - Drop both queues after a queue failure so the caller can reconnect
//! - Validate length and checksum of every received frame
//! - Keep statistics ([`TransportStats`])
//!
//! Every queue operation blocks, so it runs on the runtime's blocking pool.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ems_bus::config::EngineConfig;
//! use ems_bus::queue::posix::PosixConnector;
//! use ems_bus::transport::{ExternalDriver, TelegramTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let transport = TelegramTransport::new(
//!         &config,
//!         Arc::new(PosixConnector),
//!         Arc::new(ExternalDriver::new()),
//!     );
//!
//!     transport.start(&config.link).await?;
//!     transport.connect().await?;
//!
//!     while let Some(telegram) = transport.receive().await? {
//!         println!("{}", telegram);
//!     }
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::catalog::MSG_ONLINE_DEVICES;
use crate::config::{EngineConfig, TransportConfig};
use crate::error::{EmsError, EmsResult};
use crate::logging::{DriverLogLevel, TelegramLogger};
use crate::queue::{MessageQueue, QueueConnector, QueueDirection};
use crate::telegram::{BusAddress, Telegram, MIN_TELEGRAM_LENGTH};

/// Bus driver abstraction
///
/// The driver runs the physical side of the bus: it owns the serial link,
/// answers the bus master's polls and feeds the queues. It may live in
/// another process, in the kernel or in the same process.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; the transport shares them with
/// the engine.
#[async_trait]
pub trait BusDriver: Send + Sync + fmt::Debug {
    /// Start serving the bus on `link`
    ///
    /// # Arguments
    ///
    /// * `link` - serial link identifier, opaque to the transport
    ///
    /// # Errors
    ///
    /// * `EmsError::Startup` - the driver cannot begin serving the link
    async fn start(&self, link: &str) -> EmsResult<()>;

    /// Stop serving the bus
    async fn stop(&self) -> EmsResult<()>;

    /// Change the driver's verbosity bits
    fn set_log_level(&self, level: DriverLogLevel);

    /// Driver side counters
    ///
    /// Keys follow the driver's own naming (`rx_total`, `rx_crc`,
    /// `tx_fail`, ...). Drivers without counters return an empty map.
    fn stats(&self) -> BTreeMap<String, u64>;
}

/// Driver running outside this process
///
/// Starting only checks that the link exists; the driver process creates
/// the queues once it is attached.
#[derive(Debug, Default)]
pub struct ExternalDriver {
    log_level: AtomicU8,
    running: AtomicBool,
}

impl ExternalDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BusDriver for ExternalDriver {
    async fn start(&self, link: &str) -> EmsResult<()> {
        if link.is_empty() || !Path::new(link).exists() {
            return Err(EmsError::startup(format!("Bus link {} does not exist", link)));
        }
        self.running.store(true, Ordering::SeqCst);
        info!("Using bus link {}", link);
        Ok(())
    }

    async fn stop(&self) -> EmsResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_log_level(&self, level: DriverLogLevel) {
        self.log_level.store(level.bits(), Ordering::SeqCst);
    }

    fn stats(&self) -> BTreeMap<String, u64> {
        let mut stats = BTreeMap::new();
        stats.insert(
            "logging".to_string(),
            u64::from(self.log_level.load(Ordering::SeqCst)),
        );
        stats.insert(
            "running".to_string(),
            u64::from(self.running.load(Ordering::SeqCst)),
        );
        stats
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub connect_attempts: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub short_frames: u64,
    pub oversize_frames: u64,
    pub checksum_failures: u64,
    pub frames_dispatched: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub frames_drained: u64,
}

impl TransportStats {
    /// Flatten into key/value counters
    pub fn to_map(&self) -> BTreeMap<String, u64> {
        [
            ("connect_attempts", self.connect_attempts),
            ("reconnects", self.reconnects),
            ("frames_received", self.frames_received),
            ("short_frames", self.short_frames),
            ("oversize_frames", self.oversize_frames),
            ("checksum_failures", self.checksum_failures),
            ("frames_dispatched", self.frames_dispatched),
            ("frames_sent", self.frames_sent),
            ("send_failures", self.send_failures),
            ("frames_drained", self.frames_drained),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    connect_attempts: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    short_frames: AtomicU64,
    oversize_frames: AtomicU64,
    checksum_failures: AtomicU64,
    frames_dispatched: AtomicU64,
    frames_sent: AtomicU64,
    send_failures: AtomicU64,
    frames_drained: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        TransportStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            short_frames: self.short_frames.load(Ordering::Relaxed),
            oversize_frames: self.oversize_frames.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            frames_drained: self.frames_drained.load(Ordering::Relaxed),
        }
    }
}

/// Result of a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Attempts needed, including the successful one
    pub attempts: u64,
    /// Stale frames discarded from the inbound queue
    pub drained: usize,
    /// Whether the online-devices request was sent after draining
    pub bootstrapped: bool,
}

#[derive(Debug, Default)]
struct Queues {
    inbound: Option<Arc<dyn MessageQueue>>,
    outbound: Option<Arc<dyn MessageQueue>>,
}

/// Queue based telegram transport
pub struct TelegramTransport {
    config: TransportConfig,
    client_id: BusAddress,
    connector: Arc<dyn QueueConnector>,
    driver: Arc<dyn BusDriver>,
    logger: TelegramLogger,
    log_level: AtomicU8,
    queues: RwLock<Queues>,
    running: AtomicBool,
    stats: StatsCounters,
}

impl fmt::Debug for TelegramTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramTransport")
            .field("config", &self.config)
            .field("client_id", &self.client_id)
            .field("driver", &self.driver)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl TelegramTransport {
    /// Create a transport; nothing is opened until [`connect`](Self::connect)
    pub fn new(
        config: &EngineConfig,
        connector: Arc<dyn QueueConnector>,
        driver: Arc<dyn BusDriver>,
    ) -> Self {
        Self {
            config: config.transport.clone(),
            client_id: config.client_id,
            connector,
            driver,
            logger: TelegramLogger::tracing(config.telegram_logging),
            log_level: AtomicU8::new(config.driver_log_level().bits()),
            queues: RwLock::new(Queues::default()),
            running: AtomicBool::new(false),
            stats: StatsCounters::default(),
        }
    }

    /// Replace the telegram logger
    pub fn with_logger(mut self, logger: TelegramLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn client_id(&self) -> BusAddress {
        self.client_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        let queues = self.queues.read();
        queues.inbound.is_some() && queues.outbound.is_some()
    }

    pub fn log_level(&self) -> DriverLogLevel {
        DriverLogLevel::from_bits_truncate(self.log_level.load(Ordering::SeqCst))
    }

    /// Change the verbosity of both the driver and the telegram dumps
    pub fn set_log_level(&self, level: DriverLogLevel) {
        self.log_level.store(level.bits(), Ordering::SeqCst);
        self.driver.set_log_level(level);
    }

    /// Start the bus driver
    ///
    /// # Errors
    ///
    /// * `EmsError::Startup` - the driver refused to start
    pub async fn start(&self, link: &str) -> EmsResult<()> {
        self.driver.set_log_level(self.log_level());
        self.driver.start(link).await.map_err(|e| match e {
            EmsError::Startup { .. } => e,
            other => EmsError::startup(other.to_string()),
        })?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Open both queues
    ///
    /// Retries every `retry_interval` for as long as the transport is
    /// running. When both queues open on the first attempt and the inbound
    /// queue is already full, the backlog is stale: it is drained and one
    /// online-devices read request is sent to the boiler. A queue failing
    /// while it is checked or drained counts as a failed attempt.
    ///
    /// # Errors
    ///
    /// * `EmsError::Connection` - the transport was stopped while retrying
    pub async fn connect(&self) -> EmsResult<ConnectOutcome> {
        let mut attempts = 0u64;
        loop {
            if !self.is_running() {
                return Err(EmsError::connection("Transport stopped before connecting"));
            }
            attempts += 1;
            StatsCounters::bump(&self.stats.connect_attempts);

            let result = match self.open_queues().await {
                Ok((inbound, outbound)) => {
                    {
                        let mut queues = self.queues.write();
                        queues.inbound = Some(Arc::clone(&inbound));
                        queues.outbound = Some(outbound);
                    }
                    self.settle(attempts, inbound).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => {
                    info!("Connected to {} and {}", self.config.inbound_queue, self.config.outbound_queue);
                    return Ok(outcome);
                }
                Err(e) => {
                    self.disconnect();
                    debug!("Connect attempt {} failed: {}", attempts, e);
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
            }
        }
    }

    async fn settle(&self, attempts: u64, inbound: Arc<dyn MessageQueue>) -> EmsResult<ConnectOutcome> {
        let full = inbound.is_full()?;
        if attempts > 1 || !full {
            return Ok(ConnectOutcome {
                attempts,
                drained: 0,
                bootstrapped: false,
            });
        }

        let drained = self.drain(inbound).await?;
        info!("Discarded {} stale telegrams", drained);
        let request = Telegram::read_request(self.client_id, self.config.boiler_address, MSG_ONLINE_DEVICES);
        self.send(&request).await?;
        Ok(ConnectOutcome {
            attempts,
            drained,
            bootstrapped: true,
        })
    }

    /// Drop both queues and connect again
    ///
    /// Used after a queue failure, typically a restarted driver. The new
    /// connection goes through the same retry loop and backlog check as
    /// [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// * `EmsError::Connection` - the transport was stopped while retrying
    pub async fn reconnect(&self) -> EmsResult<ConnectOutcome> {
        self.disconnect();
        StatsCounters::bump(&self.stats.reconnects);
        self.connect().await
    }

    fn disconnect(&self) {
        let mut queues = self.queues.write();
        queues.inbound = None;
        queues.outbound = None;
    }

    async fn open_queues(&self) -> EmsResult<(Arc<dyn MessageQueue>, Arc<dyn MessageQueue>)> {
        let connector = Arc::clone(&self.connector);
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> EmsResult<(Arc<dyn MessageQueue>, Arc<dyn MessageQueue>)> {
            let outbound = connector.open(
                &config.outbound_queue,
                QueueDirection::Send,
                config.capacity,
                config.max_frame,
            )?;
            let inbound = connector.open(
                &config.inbound_queue,
                QueueDirection::Receive,
                config.capacity,
                config.max_frame,
            )?;
            Ok((inbound, outbound))
        })
        .await?
    }

    async fn drain(&self, inbound: Arc<dyn MessageQueue>) -> EmsResult<usize> {
        let drained = tokio::task::spawn_blocking(move || {
            let mut drained = 0usize;
            while inbound.try_receive()?.is_some() {
                drained += 1;
            }
            Ok::<_, EmsError>(drained)
        })
        .await??;
        self.stats
            .frames_drained
            .fetch_add(drained as u64, Ordering::Relaxed);
        Ok(drained)
    }

    fn inbound(&self) -> EmsResult<Arc<dyn MessageQueue>> {
        self.queues
            .read()
            .inbound
            .clone()
            .ok_or_else(|| EmsError::connection("Inbound queue not connected"))
    }

    fn outbound(&self) -> EmsResult<Arc<dyn MessageQueue>> {
        self.queues
            .read()
            .outbound
            .clone()
            .ok_or_else(|| EmsError::connection("Outbound queue not connected"))
    }

    /// Wait up to `receive_timeout` for one frame
    ///
    /// Returns `Ok(None)` when nothing arrived or the frame was discarded.
    /// Short frames are dropped silently; oversize frames and checksum
    /// failures are logged and dropped.
    ///
    /// # Errors
    ///
    /// * `EmsError::Connection` - queues are not connected
    /// * `EmsError::Io` - the queue failed; both queues are dropped
    pub async fn receive(&self) -> EmsResult<Option<Telegram>> {
        let inbound = self.inbound()?;
        let timeout = self.config.receive_timeout();
        let frame = match tokio::task::spawn_blocking(move || inbound.receive(timeout)).await? {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.disconnect();
                return Err(e);
            }
        };
        Ok(self.accept(&frame))
    }

    fn accept(&self, frame: &[u8]) -> Option<Telegram> {
        if frame.len() < MIN_TELEGRAM_LENGTH {
            StatsCounters::bump(&self.stats.short_frames);
            trace!("Dropped short frame of {} bytes", frame.len());
            return None;
        }
        if frame.len() > self.config.max_frame {
            StatsCounters::bump(&self.stats.oversize_frames);
            warn!("Dropped oversize frame of {} bytes", frame.len());
            return None;
        }
        if self.log_level().logs_packets() {
            self.logger.log_telegram("RX", frame);
        }

        match Telegram::parse(frame) {
            Ok(telegram) => {
                StatsCounters::bump(&self.stats.frames_received);
                Some(telegram)
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.checksum_failures);
                warn!("Dropped frame {}: {}", hex::encode(frame), e);
                None
            }
        }
    }

    /// Queue one telegram for the bus
    ///
    /// Blocks while the outbound queue is full. No acknowledgement is
    /// awaited from the bus. A failing queue drops both queues; the next
    /// receive then reports the loss.
    pub async fn send(&self, telegram: &Telegram) -> EmsResult<()> {
        let outbound = self.outbound()?;
        let frame = telegram.to_bytes();
        if self.log_level().logs_packets() {
            self.logger.log_telegram("TX", &frame);
        }

        match tokio::task::spawn_blocking(move || outbound.send(&frame)).await? {
            Ok(()) => {
                StatsCounters::bump(&self.stats.frames_sent);
                Ok(())
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.send_failures);
                if !matches!(e, EmsError::Frame { .. }) {
                    self.disconnect();
                }
                Err(e)
            }
        }
    }

    pub(crate) fn record_dispatched(&self) {
        StatsCounters::bump(&self.stats.frames_dispatched);
    }

    /// Stop the driver and close both queues
    ///
    /// A receive already blocked in the queue returns within one receive
    /// timeout.
    pub async fn close(&self) -> EmsResult<()> {
        self.running.store(false, Ordering::SeqCst);
        self.disconnect();
        self.driver.stop().await
    }

    pub fn get_stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    /// Transport counters merged with the driver's counters
    pub fn stats(&self) -> BTreeMap<String, u64> {
        let mut stats = self.driver.stats();
        stats.extend(self.get_stats().to_map());
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::{MemoryBroker, MemoryQueue};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct TestDriver {
        fail_start: bool,
        level: AtomicU8,
    }

    #[async_trait]
    impl BusDriver for TestDriver {
        async fn start(&self, _link: &str) -> EmsResult<()> {
            if self.fail_start {
                return Err(EmsError::io("no such device"));
            }
            Ok(())
        }

        async fn stop(&self) -> EmsResult<()> {
            Ok(())
        }

        fn set_log_level(&self, level: DriverLogLevel) {
            self.level.store(level.bits(), Ordering::SeqCst);
        }

        fn stats(&self) -> BTreeMap<String, u64> {
            BTreeMap::from([("rx_total".to_string(), 7)])
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.transport.retry_interval_ms = 10;
        config.transport.receive_timeout_ms = 20;
        config
    }

    fn transport(broker: &Arc<MemoryBroker>) -> TelegramTransport {
        TelegramTransport::new(&config(), broker.clone(), Arc::new(TestDriver::default()))
    }

    fn queues(broker: &MemoryBroker) -> (Arc<MemoryQueue>, Arc<MemoryQueue>) {
        (
            broker.create("/ems_bus_rx", 10, 32),
            broker.create("/ems_bus_tx", 10, 32),
        )
    }

    #[tokio::test]
    async fn test_start_failure_is_startup_error() {
        let broker = MemoryBroker::new();
        let driver = TestDriver {
            fail_start: true,
            ..Default::default()
        };
        let transport = TelegramTransport::new(&config(), broker, Arc::new(driver));
        let err = transport.start("/dev/null").await.unwrap_err();
        assert!(matches!(err, EmsError::Startup { .. }));
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_connect_retries_until_queues_exist() {
        let broker = MemoryBroker::new();
        queues(&broker);
        broker.fail_next_opens(3);

        let transport = transport(&broker);
        transport.start("/dev/null").await.unwrap();
        let outcome = transport.connect().await.unwrap();
        assert_eq!(outcome.attempts, 4);
        assert!(!outcome.bootstrapped);
        assert!(transport.is_connected());
        assert_eq!(transport.get_stats().connect_attempts, 4);
    }

    #[tokio::test]
    async fn test_connect_requires_running() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        assert!(transport.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_full_backlog_is_drained() {
        let broker = MemoryBroker::new();
        let (rx, tx) = queues(&broker);
        let frame = Telegram::new(0x08, 0x00, 0x18, 0, vec![0x32]).unwrap().to_bytes();
        for _ in 0..10 {
            rx.send(&frame).unwrap();
        }

        let transport = transport(&broker);
        transport.start("/dev/null").await.unwrap();
        let outcome = transport.connect().await.unwrap();
        assert!(outcome.bootstrapped);
        assert_eq!(outcome.drained, 10);
        assert!(rx.is_empty().unwrap());

        let sent = tx.snapshot();
        assert_eq!(sent, vec![vec![0x0B, 0x88, 0x07, 0x00, 0x20, crate::telegram::checksum(&[0x0B, 0x88, 0x07, 0x00, 0x20])]]);
    }

    #[tokio::test]
    async fn test_receive_filters_frames() {
        let broker = MemoryBroker::new();
        let (rx, _tx) = queues(&broker);
        let transport = transport(&broker);
        transport.start("/dev/null").await.unwrap();
        transport.connect().await.unwrap();

        let good = Telegram::new(0x08, 0x00, 0x18, 0, vec![0x32]).unwrap().to_bytes();
        let mut corrupt = good.clone();
        corrupt[4] ^= 0x01;

        rx.send(&[0x08, 0x00, 0x18]).unwrap();
        rx.send(&corrupt).unwrap();
        rx.send(&good).unwrap();

        assert!(transport.receive().await.unwrap().is_none());
        assert!(transport.receive().await.unwrap().is_none());
        let telegram = transport.receive().await.unwrap().unwrap();
        assert_eq!(telegram.identification, 0x18);
        assert!(transport.receive().await.unwrap().is_none());

        let stats = transport.get_stats();
        assert_eq!(stats.short_frames, 1);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.frames_received, 1);
    }

    #[tokio::test]
    async fn test_send_and_stats() {
        let broker = MemoryBroker::new();
        let (_rx, tx) = queues(&broker);
        let transport = transport(&broker);
        transport.start("/dev/null").await.unwrap();
        transport.connect().await.unwrap();

        let request = Telegram::read_request(0x0B, 0x18, 0x02);
        transport.send(&request).await.unwrap();
        assert_eq!(
            tx.receive(Duration::from_millis(10)).unwrap(),
            Some(request.to_bytes())
        );

        let stats = transport.stats();
        assert_eq!(stats["frames_sent"], 1);
        assert_eq!(stats["rx_total"], 7);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(transport.send(&request).await.is_err());
    }

    fn good_frame() -> Vec<u8> {
        Telegram::new(0x08, 0x00, 0x18, 0, vec![0x32]).unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_reconnect_after_driver_restart() {
        let broker = MemoryBroker::new();
        queues(&broker);
        let transport = Arc::new(transport(&broker));
        transport.start("/dev/null").await.unwrap();
        transport.connect().await.unwrap();

        broker.close("/ems_bus_rx");
        broker.close("/ems_bus_tx");
        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, EmsError::Io { .. }));
        assert!(!transport.is_connected());

        let reconnect = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.reconnect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (rx, tx) = queues(&broker);
        let outcome = reconnect.await.unwrap().unwrap();
        assert!(outcome.attempts > 1);
        assert!(!outcome.bootstrapped);

        rx.send(&good_frame()).unwrap();
        let telegram = transport.receive().await.unwrap().unwrap();
        assert_eq!(telegram.identification, 0x18);
        transport.send(&Telegram::read_request(0x0B, 0x08, 0x02)).await.unwrap();
        assert_eq!(tx.len().unwrap(), 1);
        assert_eq!(transport.get_stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_queue_failure_while_connecting_is_retried() {
        let broker = MemoryBroker::new();
        let (rx, _tx) = queues(&broker);
        // Still registered, but every call on it fails
        rx.close();

        let transport = Arc::new(transport(&broker));
        transport.start("/dev/null").await.unwrap();
        let connect = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.is_connected());

        broker.unlink("/ems_bus_rx");
        broker.create("/ems_bus_rx", 10, 32);
        let outcome = connect.await.unwrap().unwrap();
        assert!(outcome.attempts > 1);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_failed_send_drops_queues() {
        let broker = MemoryBroker::new();
        queues(&broker);
        let transport = transport(&broker);
        transport.start("/dev/null").await.unwrap();
        transport.connect().await.unwrap();

        broker.close("/ems_bus_tx");
        let request = Telegram::read_request(0x0B, 0x08, 0x02);
        assert!(transport.send(&request).await.is_err());
        assert!(!transport.is_connected());
        assert_eq!(transport.get_stats().send_failures, 1);
        assert!(matches!(
            transport.receive().await,
            Err(EmsError::Connection { .. })
        ));
    }

    #[tokio::test]
    async fn test_packet_level_dumps_through_logger() {
        let broker = MemoryBroker::new();
        let (rx, _tx) = queues(&broker);
        let lines = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let callback: crate::logging::LogCallback = {
            let lines = Arc::clone(&lines);
            Box::new(move |_level, message: &str| lines.lock().push(message.to_string()))
        };
        let logger = TelegramLogger::with_mode(
            Some(callback),
            crate::logging::LogLevel::Debug,
            crate::logging::LoggingMode::Interpreted,
        );
        let transport = transport(&broker).with_logger(logger);
        transport.start("/dev/null").await.unwrap();
        transport.connect().await.unwrap();

        rx.send(&good_frame()).unwrap();
        transport.receive().await.unwrap().unwrap();
        assert!(lines.lock().is_empty());

        transport.set_log_level(DriverLogLevel::ERROR | DriverLogLevel::PACKET);
        rx.send(&good_frame()).unwrap();
        transport.receive().await.unwrap().unwrap();
        transport.send(&Telegram::read_request(0x0B, 0x08, 0x02)).await.unwrap();

        let lines = lines.lock();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("RX "));
        assert!(lines[1].starts_with("TX "));
    }

    #[tokio::test]
    async fn test_external_driver_requires_link() {
        let driver = ExternalDriver::new();
        assert!(driver.start("/nonexistent/ttyEMS").await.is_err());
        driver.set_log_level(DriverLogLevel::ERROR | DriverLogLevel::PACKET);
        assert_eq!(driver.stats()["logging"], 0x09);
    }
}
