//! # EMS Protocol Engine
//!
//! The engine turns bus traffic into device state. It follows the online
//! bitmap broadcast by the boiler, identifies every new device from its
//! version message, keeps the last known contents of every message a device
//! sends and reports discoveries and updates to an [`EventSink`].
//!
//! ## Address lifecycle
//!
//! ```text
//!  Offline --(bitmap bit set)--> OnlineUnidentified --(known product)--> Identified
//!     ^                                   |                                  |
//!     +---------------(bitmap bit cleared)+----------------------------------+
//! ```
//!
//! Messages from addresses that are not identified are decoded for logging
//! only; no state is kept for them.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ems_bus::config::EngineConfig;
//! use ems_bus::engine::{BusEvent, ChannelSink, ProtocolEngine};
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
//!     let (sink, mut events) = ChannelSink::new(64);
//!     let engine = ProtocolEngine::new(config, transport, Arc::new(sink))?;
//!
//!     let handle = engine.start().await?;
//!     while let Some(event) = events.recv().await {
//!         if let BusEvent::Discovered { device, .. } = &event {
//!             println!("Found {} at 0x{:02x}", device.product_name, device.address);
//!         }
//!     }
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::catalog::{DeviceCatalog, MessageCatalog, MSG_ONLINE_DEVICES, MSG_VERSION, PRODUCT_ID_FIELD};
use crate::config::EngineConfig;
use crate::error::{EmsError, EmsResult};
use crate::field::Value;
use crate::logging::DriverLogLevel;
use crate::message::{Message, MessageLayout};
use crate::registry::{DeviceInfo, DeviceRegistry};
use crate::telegram::{BusAddress, Telegram};
use crate::transport::{ConnectOutcome, TelegramTransport};

/// Notification produced by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    /// A device was identified; carries its version message
    Discovered {
        device: DeviceInfo,
        #[serde(skip)]
        message: Message,
        changed_fields: Vec<String>,
    },
    /// A message of an identified device arrived
    ///
    /// Sent even when no field changed.
    Updated {
        device: DeviceInfo,
        #[serde(skip)]
        message: Message,
        changed_fields: Vec<String>,
    },
}

impl BusEvent {
    pub fn device(&self) -> &DeviceInfo {
        match self {
            BusEvent::Discovered { device, .. } | BusEvent::Updated { device, .. } => device,
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            BusEvent::Discovered { message, .. } | BusEvent::Updated { message, .. } => message,
        }
    }

    pub fn changed_fields(&self) -> &[String] {
        match self {
            BusEvent::Discovered { changed_fields, .. } | BusEvent::Updated { changed_fields, .. } => {
                changed_fields
            }
        }
    }

    pub fn is_discovered(&self) -> bool {
        matches!(self, BusEvent::Discovered { .. })
    }
}

/// Receiver of engine events
///
/// The engine awaits `notify` with no device or message lock held, so a sink
/// may call back into the engine (for example `set_value`). Events of one
/// message arrive in the order of its updates; a slow sink delays the events
/// of that message but not its decoding.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, event: BusEvent);
}

/// Sink forwarding events into a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<BusEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BusEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn notify(&self, event: BusEvent) {
        if self.sender.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Sink discarding all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn notify(&self, _event: BusEvent) {}
}

/// Capability to run background tasks
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Spawns onto the current tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSpawner;

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

struct EngineInner {
    config: EngineConfig,
    messages: MessageCatalog,
    devices: DeviceCatalog,
    registry: DeviceRegistry,
    transport: TelegramTransport,
    sink: Arc<dyn EventSink>,
    spawner: Arc<dyn TaskSpawner>,
    running: AtomicBool,
}

/// EMS protocol engine
///
/// Cheap to clone; all clones drive the same bus.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("client_id", &self.inner.config.client_id)
            .field("link", &self.inner.config.link)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProtocolEngine {
    /// Create an engine with the built-in catalogues
    pub fn new(
        config: EngineConfig,
        transport: TelegramTransport,
        sink: Arc<dyn EventSink>,
    ) -> EmsResult<Self> {
        Self::with_catalogs(
            config,
            MessageCatalog::builtin()?,
            DeviceCatalog::builtin(),
            transport,
            sink,
            Arc::new(TokioSpawner),
        )
    }

    /// Create an engine with caller supplied catalogues and spawner
    ///
    /// # Errors
    ///
    /// * `EmsError::Configuration` - invalid configuration, or an initial
    ///   request names a message missing from the message catalogue
    pub fn with_catalogs(
        config: EngineConfig,
        messages: MessageCatalog,
        devices: DeviceCatalog,
        transport: TelegramTransport,
        sink: Arc<dyn EventSink>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> EmsResult<Self> {
        config.validate()?;
        if transport.client_id() != config.client_id {
            return Err(EmsError::configuration(format!(
                "Transport sends as 0x{:02x}, engine is 0x{:02x}",
                transport.client_id(),
                config.client_id
            )));
        }
        for product in devices.products() {
            for &identification in devices.initial_requests(product.device_type) {
                if !messages.contains(identification) {
                    return Err(EmsError::configuration(format!(
                        "Initial request 0x{:02X} for {} is not a known message",
                        identification,
                        product.device_type
                    )));
                }
            }
        }

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                messages,
                devices,
                registry: DeviceRegistry::new(),
                transport,
                sink,
                spawner,
                running: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn client_id(&self) -> BusAddress {
        self.inner.config.client_id
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn message_catalog(&self) -> &MessageCatalog {
        &self.inner.messages
    }

    pub fn device_catalog(&self) -> &DeviceCatalog {
        &self.inner.devices
    }

    pub fn transport(&self) -> &TelegramTransport {
        &self.inner.transport
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the bus driver and the receive loop
    ///
    /// # Errors
    ///
    /// * `EmsError::Startup` - the transport cannot start or the engine
    ///   already runs; the engine stays stopped
    pub async fn start(&self) -> EmsResult<EngineHandle> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(EmsError::startup("Engine already running"));
        }
        if let Err(e) = self.inner.transport.start(&self.inner.config.link).await {
            self.inner.running.store(false, Ordering::SeqCst);
            error!("Cannot start bus on {}: {}", self.inner.config.link, e);
            return Err(e);
        }

        info!(
            "EMS engine started on {} as 0x{:02x}",
            self.inner.config.link, self.inner.config.client_id
        );
        let (finished_tx, finished) = watch::channel(false);
        let engine = self.clone();
        self.inner.spawner.spawn(Box::pin(async move {
            engine.run().await;
            finished_tx.send_replace(true);
        }));
        Ok(EngineHandle {
            engine: self.clone(),
            finished,
        })
    }

    async fn run(self) {
        match self.inner.transport.connect().await {
            Ok(outcome) => Self::log_connect(outcome),
            Err(e) => {
                debug!("Receive loop not started: {}", e);
                return;
            }
        }

        while self.is_running() {
            match self.inner.transport.receive().await {
                Ok(Some(telegram)) => {
                    self.inner.transport.record_dispatched();
                    let engine = self.clone();
                    self.inner.spawner.spawn(Box::pin(async move {
                        if let Err(e) = engine.dispatch(telegram).await {
                            match e {
                                EmsError::UnknownMessage { .. } => debug!("{}", e),
                                _ => warn!("{}", e),
                            }
                        }
                    }));
                }
                Ok(None) => {}
                Err(e) => {
                    if !self.is_running() {
                        break;
                    }
                    error!("Receive failed: {}, reconnecting", e);
                    match self.inner.transport.reconnect().await {
                        Ok(outcome) => Self::log_connect(outcome),
                        Err(e) => {
                            debug!("Reconnect abandoned: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        debug!("Receive loop finished");
    }

    fn log_connect(outcome: ConnectOutcome) {
        if outcome.bootstrapped {
            info!("Discarded {} stale telegrams, requested online devices", outcome.drained);
        }
    }

    /// Stop the receive loop and close the transport
    ///
    /// A receive already waiting in the queue finishes within one receive
    /// timeout.
    pub async fn stop(&self) -> EmsResult<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping EMS engine");
        self.inner.transport.close().await
    }

    /// Transport and driver counters
    pub fn stats(&self) -> BTreeMap<String, u64> {
        self.inner.transport.stats()
    }

    pub fn set_log_level(&self, level: DriverLogLevel) {
        self.inner.transport.set_log_level(level);
    }

    /// Process one validated telegram
    ///
    /// Errors concern this telegram only; no state was changed.
    ///
    /// # Errors
    ///
    /// * `EmsError::UnknownMessage` - identification code not in the catalogue
    /// * `EmsError::OutOfRange` - update outside the message bounds
    pub async fn dispatch(&self, telegram: Telegram) -> EmsResult<()> {
        if telegram.is_read_request() {
            trace!(
                "Read request 0x{:02X} from 0x{:02x} to 0x{:02x}",
                telegram.identification,
                telegram.src,
                telegram.destination()
            );
            return Ok(());
        }

        let layout = self
            .inner
            .messages
            .get(telegram.identification)
            .ok_or_else(|| EmsError::unknown_message(telegram.identification))?;
        let src = telegram.src & 0x7F;
        let offset = usize::from(telegram.offset);

        if telegram.identification == MSG_ONLINE_DEVICES {
            return self.update_online_devices(layout, &telegram.payload, offset).await;
        }
        if telegram.identification == MSG_VERSION && !self.inner.registry.is_identified(src).await {
            return self.identify(src, layout, &telegram.payload, offset).await;
        }

        let (event, ticket) = {
            let state = self.inner.registry.slot(src).read().await;
            let device = match state.device() {
                Some(device) => device,
                None => {
                    let mut message = Message::new(Arc::clone(layout));
                    message.parse(&telegram.payload, offset)?;
                    debug!(
                        "{} from unidentified 0x{:02x} ({})",
                        layout.name(),
                        src,
                        state.name()
                    );
                    message.dump();
                    return Ok(());
                }
            };

            let cached = device.message(layout);
            let mut message = cached.lock().await;
            let changed = message.parse(&telegram.payload, offset)?;
            let changed_fields = message.field_names(&changed);
            trace!(
                "0x{:02x} {} changed {:?}",
                src,
                layout.name(),
                changed_fields
            );
            let event = BusEvent::Updated {
                device: device.info(),
                message: message.clone(),
                changed_fields,
            };
            (event, cached.ticket())
        };

        ticket.wait_turn().await;
        self.inner.sink.notify(event).await;
        Ok(())
    }

    async fn update_online_devices(
        &self,
        layout: &Arc<MessageLayout>,
        payload: &[u8],
        offset: usize,
    ) -> EmsResult<()> {
        if offset + payload.len() > layout.length() {
            return Err(EmsError::out_of_range(offset, payload.len(), layout.length()));
        }

        let change = self.inner.registry.apply_online_update(payload, offset).await;
        for &address in &change.went_offline {
            info!("Device 0x{:02x} went offline", address);
        }
        for &address in &change.came_online {
            if address == self.inner.config.client_id {
                continue;
            }
            info!("Device 0x{:02x} came online, requesting version", address);
            if let Err(e) = self.read_request(address, MSG_VERSION).await {
                warn!("Version request to 0x{:02x} failed: {}", address, e);
            }
        }
        Ok(())
    }

    async fn identify(
        &self,
        src: BusAddress,
        layout: &Arc<MessageLayout>,
        payload: &[u8],
        offset: usize,
    ) -> EmsResult<()> {
        let mut message = Message::new(Arc::clone(layout));
        let changed = message.parse(payload, offset)?;
        let product_id = match message.value(PRODUCT_ID_FIELD).and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                debug!("Version message from 0x{:02x} without product id", src);
                return Ok(());
            }
        };
        let product = match u8::try_from(product_id)
            .ok()
            .and_then(|id| self.inner.devices.lookup(id))
        {
            Some(product) => *product,
            None => {
                error!("Found unknown device with product id {} at 0x{:02x}", product_id, src);
                return Ok(());
            }
        };

        let (info, ticket) = match self.inner.registry.identify(src, product, message.clone()).await {
            Some(identified) => identified,
            None => return Ok(()),
        };
        info!(
            "Found {} {} at 0x{:02x} (product {})",
            product.device_type, product.name, src, product.id
        );

        for &identification in self.inner.devices.initial_requests(product.device_type) {
            if let Err(e) = self.read_request(src, identification).await {
                warn!("Initial request 0x{:02X} to 0x{:02x} failed: {}", identification, src, e);
            }
        }

        let changed_fields = message.field_names(&changed);
        ticket.wait_turn().await;
        self.inner
            .sink
            .notify(BusEvent::Discovered {
                device: info,
                message,
                changed_fields,
            })
            .await;
        Ok(())
    }

    /// Ask a device for the whole of a message
    pub async fn read_request(&self, address: BusAddress, identification: u8) -> EmsResult<()> {
        debug!("Reading message 0x{:02X} from 0x{:02x}", identification, address);
        let telegram = Telegram::read_request(self.inner.config.client_id, address, identification);
        self.inner.transport.send(&telegram).await
    }

    /// Write a new value of one field to a device
    ///
    /// Boolean fields are written as their whole byte with only their bit
    /// changed. The write is fire-and-forget; the device reports its new
    /// state with its next message.
    ///
    /// # Errors
    ///
    /// * `EmsError::DeviceNotOnline` - the address is not identified
    /// * `EmsError::WriteNotSupported` - the product or the message is read-only
    /// * `EmsError::UnknownMessage` / `EmsError::UnknownField` - no such message or field
    /// * `EmsError::Encode` - the value cannot be encoded; nothing is sent
    pub async fn set_value(
        &self,
        address: BusAddress,
        identification: u8,
        field_name: &str,
        value: impl Into<Value>,
    ) -> EmsResult<()> {
        let value = value.into();
        let address = address & 0x7F;
        let telegram = {
            let state = self.inner.registry.slot(address).read().await;
            let device = state
                .device()
                .ok_or_else(|| EmsError::device_not_online(address))?;
            let product = device.product();
            if product.flags.is_read_only() {
                return Err(EmsError::write_not_supported(address, product.name));
            }

            let layout = self
                .inner
                .messages
                .get(identification)
                .ok_or_else(|| EmsError::unknown_message(identification))?;
            if !layout.writable() {
                return Err(EmsError::write_not_supported(
                    address,
                    format!("{} ({})", product.name, layout.name()),
                ));
            }
            let field = layout
                .field(field_name)
                .ok_or_else(|| EmsError::unknown_field(identification, field_name))?;
            if let Some(unit) = field.unit {
                if !unit.contains(&value) {
                    warn!("Value {} of {} is outside the range of {}", value, field.name, unit);
                }
            }

            let cached = device.message(layout);
            let (position, bytes) = cached.lock().await.encode_field_for_write(field_name, &value)?;
            let position = u8::try_from(position)
                .map_err(|_| EmsError::internal(format!("Field {} beyond offset 255", field.name)))?;
            Telegram::write(self.inner.config.client_id, address, identification, position, &bytes)?
        };

        info!(
            "Writing {} = {} to 0x{:02x} message 0x{:02X}",
            field_name, value, address, identification
        );
        self.inner.transport.send(&telegram).await
    }
}

/// Handle of a started engine
#[derive(Debug)]
pub struct EngineHandle {
    engine: ProtocolEngine,
    finished: watch::Receiver<bool>,
}

impl EngineHandle {
    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Whether the receive loop has returned
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Stop the engine and wait for the receive loop to finish
    ///
    /// A loop whose task was dropped by its spawner counts as finished.
    pub async fn stop(mut self) -> EmsResult<()> {
        self.engine.stop().await?;
        let _ = self.finished.wait_for(|finished| *finished).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MSG_UBA_MONITOR_FAST, MSG_UBA_SET_VALUES};
    use crate::queue::memory::{MemoryBroker, MemoryQueue};
    use crate::queue::MessageQueue;
    use crate::transport::BusDriver;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct TestDriver;

    #[async_trait]
    impl BusDriver for TestDriver {
        async fn start(&self, _link: &str) -> EmsResult<()> {
            Ok(())
        }

        async fn stop(&self) -> EmsResult<()> {
            Ok(())
        }

        fn set_log_level(&self, _level: DriverLogLevel) {}

        fn stats(&self) -> BTreeMap<String, u64> {
            BTreeMap::new()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<BusEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn notify(&self, event: BusEvent) {
            self.events.lock().push(event);
        }
    }

    struct Fixture {
        engine: ProtocolEngine,
        sink: Arc<RecordingSink>,
        tx: Arc<MemoryQueue>,
    }

    async fn connected_transport(config: &EngineConfig) -> (TelegramTransport, Arc<MemoryQueue>) {
        let broker = MemoryBroker::new();
        broker.create("/ems_bus_rx", 10, 32);
        let tx = broker.create("/ems_bus_tx", 10, 32);

        let transport = TelegramTransport::new(config, broker, Arc::new(TestDriver));
        transport.start("/dev/null").await.unwrap();
        transport.connect().await.unwrap();
        (transport, tx)
    }

    async fn fixture() -> Fixture {
        let config = EngineConfig::default();
        let (transport, tx) = connected_transport(&config).await;
        let sink = Arc::new(RecordingSink::default());
        let engine = ProtocolEngine::new(config, transport, sink.clone()).unwrap();
        Fixture { engine, sink, tx }
    }

    fn telegram(src: u8, identification: u8, offset: u8, payload: &[u8]) -> Telegram {
        Telegram::new(src, 0x00, identification, offset, payload.to_vec()).unwrap()
    }

    fn sent(tx: &MemoryQueue) -> Vec<Telegram> {
        let mut frames = Vec::new();
        while let Some(frame) = tx.try_receive().unwrap() {
            frames.push(Telegram::parse(&frame).unwrap());
        }
        frames
    }

    /// Online bitmap with the boiler (0x08) and this node (0x0B)
    async fn boiler_online(fixture: &Fixture) {
        let bitmap = telegram(0x08, MSG_ONLINE_DEVICES, 0, &[0x09, 0, 0, 0, 0, 0, 0, 0]);
        fixture.engine.dispatch(bitmap).await.unwrap();
    }

    async fn boiler_identified(fixture: &Fixture) {
        boiler_online(fixture).await;
        // MC10 boiler, product id 123
        let version = telegram(0x08, MSG_VERSION, 0, &[123, 3, 2]);
        fixture.engine.dispatch(version).await.unwrap();
    }

    #[tokio::test]
    async fn test_bitmap_requests_version_except_own_address() {
        let fixture = fixture().await;
        boiler_online(&fixture).await;

        let requests = sent(&fixture.tx);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].destination(), 0x08);
        assert!(requests[0].is_read_request());
        assert_eq!(requests[0].identification, MSG_VERSION);
        assert!(fixture.sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_version_identifies_and_requests_initial_messages() {
        let fixture = fixture().await;
        boiler_identified(&fixture).await;

        let requested: Vec<u8> = sent(&fixture.tx).iter().map(|t| t.identification).collect();
        assert_eq!(requested, vec![0x02, 0x18, 0x19, 0x1A, 0x33, 0x34]);

        let events = fixture.sink.events.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_discovered());
        assert_eq!(events[0].device().address, 0x08);
        assert!(events[0].changed_fields().contains(&"product_id".to_string()));
        drop(events);

        assert!(fixture.engine.registry().is_identified(0x08).await);
        assert!(fixture.engine.registry().message(0x08, MSG_VERSION).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_product_stays_unidentified() {
        let fixture = fixture().await;
        boiler_online(&fixture).await;
        fixture
            .engine
            .dispatch(telegram(0x08, MSG_VERSION, 0, &[0xEE, 1, 0]))
            .await
            .unwrap();

        assert!(!fixture.engine.registry().is_identified(0x08).await);
        assert!(fixture.sink.events.lock().is_empty());

        fixture
            .engine
            .dispatch(telegram(0x08, MSG_UBA_MONITOR_FAST, 0, &[0x32]))
            .await
            .unwrap();
        assert!(fixture.sink.events.lock().is_empty());
        assert!(fixture.engine.registry().message(0x08, MSG_UBA_MONITOR_FAST).await.is_none());
    }

    #[tokio::test]
    async fn test_updates_and_removal() {
        let fixture = fixture().await;
        boiler_identified(&fixture).await;
        let engine = &fixture.engine;

        engine.dispatch(telegram(0x08, MSG_UBA_MONITOR_FAST, 0, &[0x32])).await.unwrap();
        engine.dispatch(telegram(0x08, MSG_UBA_MONITOR_FAST, 0, &[0x32])).await.unwrap();
        engine.dispatch(telegram(0x08, MSG_UBA_MONITOR_FAST, 0, &[0x28])).await.unwrap();
        {
            let events = fixture.sink.events.lock();
            assert_eq!(events.len(), 4);
            assert!(events[2].changed_fields().is_empty());
            assert_eq!(events[3].changed_fields(), ["forward_temp_set".to_string()]);
            assert_eq!(events[3].message().value("forward_temp_set"), Some(&Value::Integer(40)));
        }

        let err = engine
            .dispatch(telegram(0x08, MSG_UBA_MONITOR_FAST, 24, &[1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmsError::OutOfRange { .. }));

        engine
            .dispatch(telegram(0x08, MSG_ONLINE_DEVICES, 0, &[0x08, 0, 0, 0, 0, 0, 0, 0]))
            .await
            .unwrap();
        assert!(!engine.registry().is_identified(0x08).await);
        assert!(engine.registry().message(0x08, MSG_UBA_MONITOR_FAST).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_message_and_read_requests() {
        let fixture = fixture().await;
        let err = fixture
            .engine
            .dispatch(telegram(0x08, 0xF0, 0, &[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, EmsError::UnknownMessage { code: 0xF0 }));

        let poll = Telegram::read_request(0x10, 0x08, MSG_UBA_MONITOR_FAST);
        fixture.engine.dispatch(poll).await.unwrap();
        assert!(fixture.sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_set_value() {
        let fixture = fixture().await;
        let engine = &fixture.engine;

        let err = engine.set_value(0x08, MSG_UBA_SET_VALUES, "boiler_temp", 60i64).await.unwrap_err();
        assert!(matches!(err, EmsError::DeviceNotOnline { address: 0x08 }));

        boiler_identified(&fixture).await;
        sent(&fixture.tx);

        engine.set_value(0x08, MSG_UBA_SET_VALUES, "boiler_temp", 60i64).await.unwrap();
        let writes = sent(&fixture.tx);
        assert_eq!(writes.len(), 1);
        assert!(!writes[0].is_read_request());
        assert_eq!(writes[0].src, 0x0B);
        assert_eq!(writes[0].destination(), 0x08);
        assert_eq!(writes[0].identification, MSG_UBA_SET_VALUES);
        assert_eq!(writes[0].payload.as_ref(), &[60]);

        let err = engine.set_value(0x08, MSG_UBA_SET_VALUES, "no_such_field", 1i64).await.unwrap_err();
        assert!(matches!(err, EmsError::UnknownField { .. }));
        let err = engine.set_value(0x08, MSG_UBA_MONITOR_FAST, "forward_temp_set", 1i64).await.unwrap_err();
        assert!(matches!(err, EmsError::WriteNotSupported { .. }));
        assert!(sent(&fixture.tx).is_empty());
    }

    #[tokio::test]
    async fn test_version_from_offline_address_is_ignored() {
        let fixture = fixture().await;
        boiler_online(&fixture).await;
        sent(&fixture.tx);

        // RC35 (product 86) answering from 0x10, which the bitmap never listed
        fixture
            .engine
            .dispatch(telegram(0x10, MSG_VERSION, 0, &[86, 1, 4]))
            .await
            .unwrap();

        assert!(!fixture.engine.registry().is_identified(0x10).await);
        assert!(fixture.engine.registry().message(0x10, MSG_VERSION).await.is_none());
        assert!(fixture.sink.events.lock().is_empty());
        assert!(sent(&fixture.tx).is_empty());
    }

    /// Sink that answers every set-values update with a write
    #[derive(Default)]
    struct WritingSink {
        engine: std::sync::OnceLock<ProtocolEngine>,
        results: Mutex<Vec<EmsResult<()>>>,
    }

    #[async_trait]
    impl EventSink for WritingSink {
        async fn notify(&self, event: BusEvent) {
            if event.is_discovered() || event.message().identification() != MSG_UBA_SET_VALUES {
                return;
            }
            if let Some(engine) = self.engine.get() {
                let result = engine.set_value(0x08, MSG_UBA_SET_VALUES, "heat_power", 50i64).await;
                self.results.lock().push(result);
            }
        }
    }

    #[tokio::test]
    async fn test_sink_may_write_from_notify() {
        let config = EngineConfig::default();
        let (transport, tx) = connected_transport(&config).await;
        let sink = Arc::new(WritingSink::default());
        let engine = ProtocolEngine::new(config, transport, sink.clone()).unwrap();
        sink.engine.set(engine.clone()).unwrap();

        engine
            .dispatch(telegram(0x08, MSG_ONLINE_DEVICES, 0, &[0x09, 0, 0, 0, 0, 0, 0, 0]))
            .await
            .unwrap();
        engine.dispatch(telegram(0x08, MSG_VERSION, 0, &[123, 3, 2])).await.unwrap();
        sent(&tx);

        let update = telegram(0x08, MSG_UBA_SET_VALUES, 0, &[55, 100, 0]);
        tokio::time::timeout(std::time::Duration::from_secs(2), engine.dispatch(update))
            .await
            .expect("dispatch blocked by the sink")
            .unwrap();

        let results = sink.results.lock();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        let writes = sent(&tx);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].offset, 1);
        assert_eq!(writes[0].payload.as_ref(), &[50]);
    }

    #[derive(Default)]
    struct CountingSpawner {
        spawned: std::sync::atomic::AtomicUsize,
        run_tasks: bool,
    }

    impl TaskSpawner for CountingSpawner {
        fn spawn(&self, task: BoxFuture<'static, ()>) {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            if self.run_tasks {
                tokio::spawn(task);
            }
        }
    }

    fn engine_with_spawner(spawner: Arc<CountingSpawner>) -> ProtocolEngine {
        let broker = MemoryBroker::new();
        broker.create("/ems_bus_rx", 10, 32);
        broker.create("/ems_bus_tx", 10, 32);
        let config = EngineConfig::default();
        let transport = TelegramTransport::new(&config, broker, Arc::new(TestDriver));
        ProtocolEngine::with_catalogs(
            config,
            MessageCatalog::builtin().unwrap(),
            DeviceCatalog::builtin(),
            transport,
            Arc::new(NullSink),
            spawner,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_receive_loop_runs_on_injected_spawner() {
        let spawner = Arc::new(CountingSpawner {
            run_tasks: true,
            ..Default::default()
        });
        let engine = engine_with_spawner(spawner.clone());

        let handle = engine.start().await.unwrap();
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        assert!(!handle.is_finished());
        handle.stop().await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_stop_returns_when_spawner_drops_the_loop() {
        let spawner = Arc::new(CountingSpawner::default());
        let engine = engine_with_spawner(spawner.clone());

        let handle = engine.start().await.unwrap();
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        tokio::time::timeout(std::time::Duration::from_secs(2), handle.stop())
            .await
            .expect("stop waited for a dropped loop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_initial_requests_must_be_known() {
        let broker = MemoryBroker::new();
        let config = EngineConfig::default();
        let transport = TelegramTransport::new(&config, broker, Arc::new(TestDriver));
        let devices = DeviceCatalog::new(
            DeviceCatalog::builtin().products().to_vec(),
            std::collections::HashMap::from([(crate::catalog::DeviceType::Boiler, vec![0xF0])]),
        );
        let result = ProtocolEngine::with_catalogs(
            config,
            MessageCatalog::builtin().unwrap(),
            devices,
            transport,
            Arc::new(NullSink),
            Arc::new(TokioSpawner),
        );
        assert!(matches!(result, Err(EmsError::Configuration { .. })));
    }
}
