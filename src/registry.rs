//! Registry of devices present on the bus
//!
//! Each bus address owns one slot holding its [`AddressState`]. Slots are
//! `tokio::sync::RwLock`s: message dispatch holds a read lock while it
//! decodes into the device's cached messages, presence changes and device
//! identification take the write lock. A device removed while a decode is
//! in flight is therefore removed only after that decode finished, and
//! later decodes observe the `Offline` state.
//!
//! Events are delivered after all locks are released. Every cached message
//! hands out [`EventTicket`]s while its lock is held, and a ticket waits for
//! its predecessors, so events of one message keep the order of the updates.
//!
//! The online bitmap is mirrored from the bus master's device broadcast and
//! is the only source of presence and removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, Notify, RwLock};
use tracing::{debug, info};

use crate::catalog::{DeviceType, Product, ProductVariant};
use crate::field::Value;
use crate::message::{Message, MessageLayout};
use crate::telegram::BusAddress;

/// Number of address slots (7 bit bus addresses)
pub const MAX_ADDRESSES: usize = 128;

/// Size of the online bitmap in bytes
pub const BITMAP_LENGTH: usize = 8;

/// First address covered by the bitmap
pub const BITMAP_FIRST_ADDRESS: u8 = 8;

/// One bit per bus address 8..=71
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OnlineBitmap([u8; BITMAP_LENGTH]);

/// Addresses whose presence changed between two bitmaps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitmapChange {
    pub came_online: Vec<BusAddress>,
    pub went_offline: Vec<BusAddress>,
}

impl BitmapChange {
    pub fn is_empty(&self) -> bool {
        self.came_online.is_empty() && self.went_offline.is_empty()
    }
}

impl OnlineBitmap {
    pub fn new(bytes: [u8; BITMAP_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; BITMAP_LENGTH] {
        &self.0
    }

    /// Bus address of a bit
    pub fn address(byte: usize, bit: usize) -> BusAddress {
        ((byte + 1) * 8 + bit) as BusAddress
    }

    /// Copy of the bitmap with a partial update applied
    ///
    /// Bytes beyond the bitmap (the device broadcast is longer) are ignored.
    pub fn with_update(&self, update: &[u8], offset: usize) -> Self {
        let mut bytes = self.0;
        for (i, byte) in update.iter().enumerate() {
            if let Some(slot) = bytes.get_mut(offset + i) {
                *slot = *byte;
            }
        }
        Self(bytes)
    }

    pub fn is_online(&self, address: BusAddress) -> bool {
        if address < BITMAP_FIRST_ADDRESS {
            return false;
        }
        let index = usize::from(address - BITMAP_FIRST_ADDRESS);
        self.0
            .get(index / 8)
            .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
    }

    /// Online addresses in ascending order
    pub fn addresses(&self) -> Vec<BusAddress> {
        (0..BITMAP_LENGTH * 8)
            .filter(|i| self.0[i / 8] & (1 << (i % 8)) != 0)
            .map(|i| Self::address(i / 8, i % 8))
            .collect()
    }

    /// Bit by bit difference to a newer bitmap
    pub fn diff(&self, newer: &OnlineBitmap) -> BitmapChange {
        let mut change = BitmapChange::default();
        for byte in 0..BITMAP_LENGTH {
            let toggled = self.0[byte] ^ newer.0[byte];
            for bit in 0..8 {
                let mask = 1u8 << bit;
                if toggled & mask == 0 {
                    continue;
                }
                let address = Self::address(byte, bit);
                if newer.0[byte] & mask != 0 {
                    change.came_online.push(address);
                } else {
                    change.went_offline.push(address);
                }
            }
        }
        change
    }
}

/// Public identity of an identified device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub address: BusAddress,
    pub product_id: u8,
    pub product_name: String,
    pub device_type: DeviceType,
    pub variant: ProductVariant,
    pub read_only: bool,
}

/// Delivery order of the events of one message
#[derive(Debug, Default)]
struct EventOrder {
    issued: AtomicU64,
    delivered: AtomicU64,
    turn: Notify,
}

/// Place in the event order of a cached message
///
/// Dropping the ticket lets the next one proceed.
#[derive(Debug)]
pub struct EventTicket {
    order: Arc<EventOrder>,
    seq: u64,
}

impl EventTicket {
    /// Wait until all earlier tickets of the message are dropped
    pub async fn wait_turn(&self) {
        loop {
            let turn = self.order.turn.notified();
            if self.order.delivered.load(Ordering::Acquire) >= self.seq {
                return;
            }
            turn.await;
        }
    }
}

impl Drop for EventTicket {
    fn drop(&mut self) {
        self.order.delivered.fetch_max(self.seq + 1, Ordering::AcqRel);
        self.order.turn.notify_waiters();
    }
}

/// Last known state of one message of a device
#[derive(Debug)]
pub struct CachedMessage {
    message: Mutex<Message>,
    order: Arc<EventOrder>,
}

impl CachedMessage {
    fn new(message: Message) -> Self {
        Self {
            message: Mutex::new(message),
            order: Arc::new(EventOrder::default()),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, Message> {
        self.message.lock().await
    }

    /// Next place in the event order
    ///
    /// Take it while holding the message lock so tickets follow the order
    /// of the updates.
    pub fn ticket(&self) -> EventTicket {
        EventTicket {
            order: Arc::clone(&self.order),
            seq: self.order.issued.fetch_add(1, Ordering::AcqRel),
        }
    }
}

/// Identified device and its message cache
#[derive(Debug)]
pub struct Device {
    address: BusAddress,
    product: Product,
    messages: parking_lot::Mutex<HashMap<u8, Arc<CachedMessage>>>,
}

impl Device {
    pub fn new(address: BusAddress, product: Product) -> Self {
        Self {
            address,
            product,
            messages: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> BusAddress {
        self.address
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            address: self.address,
            product_id: self.product.id,
            product_name: self.product.name.to_string(),
            device_type: self.product.device_type,
            variant: self.product.variant,
            read_only: self.product.flags.is_read_only(),
        }
    }

    /// Cached message for a layout, created empty on first use
    pub fn message(&self, layout: &Arc<MessageLayout>) -> Arc<CachedMessage> {
        self.messages
            .lock()
            .entry(layout.identification())
            .or_insert_with(|| Arc::new(CachedMessage::new(Message::new(Arc::clone(layout)))))
            .clone()
    }

    /// Cached message if one exists
    pub fn cached_message(&self, identification: u8) -> Option<Arc<CachedMessage>> {
        self.messages.lock().get(&identification).cloned()
    }

    /// Identification codes with a cached message, sorted
    pub fn message_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.messages.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn store(&self, message: Message) -> Arc<CachedMessage> {
        let identification = message.layout().identification();
        let cached = Arc::new(CachedMessage::new(message));
        self.messages.lock().insert(identification, Arc::clone(&cached));
        cached
    }
}

/// Discovery state of one bus address
#[derive(Debug, Default)]
pub enum AddressState {
    #[default]
    Offline,
    /// Present in the online bitmap, product not (yet) known
    OnlineUnidentified,
    Identified(Device),
}

impl AddressState {
    pub fn device(&self) -> Option<&Device> {
        match self {
            AddressState::Identified(device) => Some(device),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AddressState::Offline => "offline",
            AddressState::OnlineUnidentified => "online, unidentified",
            AddressState::Identified(_) => "identified",
        }
    }
}

/// Table of bus addresses and their devices
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Vec<RwLock<AddressState>>,
    bitmap: Mutex<OnlineBitmap>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_ADDRESSES).map(|_| RwLock::new(AddressState::Offline)).collect(),
            bitmap: Mutex::new(OnlineBitmap::default()),
        }
    }

    /// Lock slot of an address (read flag stripped)
    pub fn slot(&self, address: BusAddress) -> &RwLock<AddressState> {
        &self.slots[usize::from(address & 0x7F)]
    }

    /// Apply a (partial) online bitmap update
    ///
    /// Addresses turning on move from `Offline` to `OnlineUnidentified`;
    /// identified devices stay identified. Addresses turning off are set
    /// `Offline`, dropping the device and its messages. The bitmap lock is
    /// held for the whole transition.
    pub async fn apply_online_update(&self, update: &[u8], offset: usize) -> BitmapChange {
        let mut bitmap = self.bitmap.lock().await;
        let newer = bitmap.with_update(update, offset);
        let change = bitmap.diff(&newer);

        for &address in &change.came_online {
            let mut state = self.slot(address).write().await;
            if matches!(*state, AddressState::Offline) {
                *state = AddressState::OnlineUnidentified;
            }
            debug!("Device 0x{:02X} came online ({})", address, state.name());
        }

        for &address in &change.went_offline {
            let mut state = self.slot(address).write().await;
            if let AddressState::Identified(device) = &*state {
                info!(
                    "Removing device 0x{:02X} ({}) with {} cached messages",
                    address,
                    device.product.name,
                    device.message_ids().len()
                );
            }
            *state = AddressState::Offline;
        }

        *bitmap = newer;
        change
    }

    /// Register the product of an address
    ///
    /// Only an address the online bitmap lists and that is not identified
    /// yet becomes `Identified`. The version message is stored as the
    /// device's first cached message. Returns the device info and the
    /// event ticket of the version message, or `None` if the address is
    /// offline or already identified.
    pub async fn identify(
        &self,
        address: BusAddress,
        product: Product,
        version: Message,
    ) -> Option<(DeviceInfo, EventTicket)> {
        let mut state = self.slot(address).write().await;
        if !matches!(*state, AddressState::OnlineUnidentified) {
            debug!(
                "Ignoring {} for 0x{:02X}, address is {}",
                product.name,
                address & 0x7F,
                state.name()
            );
            return None;
        }
        let device = Device::new(address & 0x7F, product);
        let ticket = device.store(version).ticket();
        let info = device.info();
        *state = AddressState::Identified(device);
        Some((info, ticket))
    }

    pub async fn online_bitmap(&self) -> OnlineBitmap {
        *self.bitmap.lock().await
    }

    pub async fn is_identified(&self, address: BusAddress) -> bool {
        self.slot(address).read().await.device().is_some()
    }

    pub async fn device_info(&self, address: BusAddress) -> Option<DeviceInfo> {
        self.slot(address).read().await.device().map(Device::info)
    }

    /// All identified devices in address order
    pub async fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for slot in &self.slots {
            if let Some(device) = slot.read().await.device() {
                devices.push(device.info());
            }
        }
        devices
    }

    /// Snapshot of a cached message
    pub async fn message(&self, address: BusAddress, identification: u8) -> Option<Message> {
        let state = self.slot(address).read().await;
        let cached = state.device()?.cached_message(identification)?;
        let snapshot = cached.lock().await.clone();
        Some(snapshot)
    }

    /// Decoded value of a cached message field
    pub async fn value(&self, address: BusAddress, identification: u8, field: &str) -> Option<Value> {
        self.message(address, identification)
            .await
            .and_then(|message| message.value(field).cloned())
    }
}
