//! Message and device catalogues
//!
//! Both catalogues are immutable lookup tables built once at startup, either
//! from the built-in tables of known EMS messages and products or from rows
//! supplied by the embedding application.
//!
//! Product ids are not unique in the known product list (several revisions
//! and device families share an id). Lookups return the first matching row,
//! so the table order is significant.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{EmsError, EmsResult};
use crate::field::Field;
use crate::message::{MessageLayout, MessageRow};
use crate::units::Unit;

/// Version message, answered by every device
pub const MSG_VERSION: u8 = 0x02;
pub const MSG_RC_TIME: u8 = 0x06;
/// Online device bitmap broadcast by the bus master
pub const MSG_ONLINE_DEVICES: u8 = 0x07;
pub const MSG_UBA_MONITOR_FAST: u8 = 0x18;
pub const MSG_UBA_MONITOR_SLOW: u8 = 0x19;
pub const MSG_UBA_SET_VALUES: u8 = 0x1A;
pub const MSG_UBA_DRINKWATER_PARAM: u8 = 0x33;
pub const MSG_UBA_DRINKWATER_MONITOR: u8 = 0x34;
pub const MSG_HC_DRINKWATER_PARAM: u8 = 0x37;
pub const MSG_HC1_PARAM: u8 = 0x3D;
pub const MSG_HC1_MONITOR: u8 = 0x3E;

/// Field of the version message carrying the product id
pub const PRODUCT_ID_FIELD: &str = "product_id";

/// Kind of device on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceType {
    None = 0,
    ServiceKey = 1,
    Boiler = 2,
    Thermostat = 3,
    Mixer = 4,
    Solar = 5,
    HeatPump = 6,
    Gateway = 7,
    Other = 8,
    Switch = 9,
    Controller = 10,
    Connector = 11,
    Unknown = 12,
}

impl DeviceType {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::None => "none",
            DeviceType::ServiceKey => "service key",
            DeviceType::Boiler => "boiler",
            DeviceType::Thermostat => "thermostat",
            DeviceType::Mixer => "mixer",
            DeviceType::Solar => "solar panel",
            DeviceType::HeatPump => "heat pump",
            DeviceType::Gateway => "gateway",
            DeviceType::Other => "other device",
            DeviceType::Switch => "switch",
            DeviceType::Controller => "controller",
            DeviceType::Connector => "connector",
            DeviceType::Unknown => "unknown device",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Model family of a product
///
/// Selects the message set a thermostat or solar module speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductVariant {
    #[default]
    None,
    Easy,
    Rc10,
    Rc20,
    Rc30,
    Rc35,
    Rc300,
    Junkers,
    /// Solar module, first generation
    Sm10,
    /// Solar module, second generation
    Sm100,
}

bitflags! {
    /// Capability flags of a product
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProductFlags: u8 {
        /// Product does not accept writes
        const NO_WRITE = 0x80;
    }
}

impl ProductFlags {
    /// Check if writes to the product are rejected
    pub fn is_read_only(&self) -> bool {
        self.contains(ProductFlags::NO_WRITE)
    }
}

/// One row of the device catalogue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Product {
    pub id: u8,
    pub device_type: DeviceType,
    pub name: &'static str,
    pub variant: ProductVariant,
    pub flags: ProductFlags,
}

impl Product {
    pub const fn new(
        id: u8,
        device_type: DeviceType,
        name: &'static str,
        variant: ProductVariant,
        flags: ProductFlags,
    ) -> Self {
        Self {
            id,
            device_type,
            name,
            variant,
            flags,
        }
    }
}

/// Product id to device identity
#[derive(Debug, Clone)]
pub struct DeviceCatalog {
    products: Vec<Product>,
    initial_requests: HashMap<DeviceType, Vec<u8>>,
}

impl DeviceCatalog {
    /// Build a catalogue from caller supplied rows
    pub fn new(products: Vec<Product>, initial_requests: HashMap<DeviceType, Vec<u8>>) -> Self {
        Self { products, initial_requests }
    }

    /// Catalogue of known EMS products
    pub fn builtin() -> Self {
        let initial_requests = HashMap::from([
            (
                DeviceType::Boiler,
                vec![
                    MSG_UBA_MONITOR_FAST,
                    MSG_UBA_MONITOR_SLOW,
                    MSG_UBA_SET_VALUES,
                    MSG_UBA_DRINKWATER_PARAM,
                    MSG_UBA_DRINKWATER_MONITOR,
                ],
            ),
            (
                DeviceType::Thermostat,
                vec![MSG_HC1_PARAM, MSG_HC1_MONITOR, MSG_HC_DRINKWATER_PARAM],
            ),
        ]);
        Self::new(PRODUCTS.to_vec(), initial_requests)
    }

    /// First row whose id matches
    pub fn lookup(&self, product_id: u8) -> Option<&Product> {
        self.products.iter().find(|p| p.id == product_id)
    }

    /// Messages to request once a device of this type is identified
    pub fn initial_requests(&self, device_type: DeviceType) -> &[u8] {
        self.initial_requests
            .get(&device_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// Identification code to message layout
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    layouts: HashMap<u8, Arc<MessageLayout>>,
}

impl MessageCatalog {
    /// Validate rows and build the lookup map
    ///
    /// The version and online bitmap messages drive discovery and must be
    /// present.
    pub fn from_rows(rows: Vec<MessageRow>) -> EmsResult<Self> {
        let mut layouts = HashMap::with_capacity(rows.len());
        for row in rows {
            let identification = row.identification;
            let layout = MessageLayout::from_row(row)?;
            if layouts.insert(identification, Arc::new(layout)).is_some() {
                return Err(EmsError::configuration(format!(
                    "Duplicate message 0x{:02X}",
                    identification
                )));
            }
        }

        let version = layouts
            .get(&MSG_VERSION)
            .ok_or_else(|| EmsError::configuration("Version message 0x02 missing"))?;
        if version.field(PRODUCT_ID_FIELD).is_none() {
            return Err(EmsError::configuration(format!(
                "Version message has no {} field",
                PRODUCT_ID_FIELD
            )));
        }
        let online = layouts
            .get(&MSG_ONLINE_DEVICES)
            .ok_or_else(|| EmsError::configuration("Online bitmap message 0x07 missing"))?;
        if online.length() < 8 {
            return Err(EmsError::configuration("Online bitmap message shorter than 8 bytes"));
        }

        Ok(Self { layouts })
    }

    /// Catalogue of known EMS messages
    pub fn builtin() -> EmsResult<Self> {
        Self::from_rows(builtin_messages())
    }

    pub fn get(&self, identification: u8) -> Option<&Arc<MessageLayout>> {
        self.layouts.get(&identification)
    }

    pub fn contains(&self, identification: u8) -> bool {
        self.layouts.contains_key(&identification)
    }

    /// Identification codes, sorted
    pub fn identifications(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.layouts.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

const RW: ProductFlags = ProductFlags::empty();
const RO: ProductFlags = ProductFlags::NO_WRITE;

#[rustfmt::skip]
const PRODUCTS: &[Product] = &[
    // Bus masters, usually at 0x08
    Product::new(72, DeviceType::Boiler, "MC10 Module", ProductVariant::None, RW),
    Product::new(123, DeviceType::Boiler, "Buderus GBx72/Nefit Trendline/Junkers Cerapur/Worcester Greenstar Si/27i", ProductVariant::None, RW),
    Product::new(133, DeviceType::Boiler, "Buderus GB125/Logamatic MC110", ProductVariant::None, RW),
    Product::new(115, DeviceType::Boiler, "Nefit Topline/Buderus GB162", ProductVariant::None, RW),
    Product::new(203, DeviceType::Boiler, "Buderus Logamax U122/Junkers Cerapur", ProductVariant::None, RW),
    Product::new(208, DeviceType::Boiler, "Buderus Logamax plus/GB192/Bosch Condens GC9000", ProductVariant::None, RW),
    Product::new(64, DeviceType::Boiler, "Sieger BK13,BK15/Nefit Smartline/Buderus GB1x2", ProductVariant::None, RW),
    Product::new(234, DeviceType::Boiler, "Buderus Logamax Plus GB122", ProductVariant::None, RW),
    Product::new(95, DeviceType::Boiler, "Bosch Condens 2500/Buderus Logamax GB062/Junkers Cerapur Top/Worcester Greenstar i/Generic HT3", ProductVariant::None, RW),
    Product::new(122, DeviceType::Boiler, "Nefit Proline", ProductVariant::None, RW),
    Product::new(170, DeviceType::Boiler, "Buderus Logano GB212", ProductVariant::None, RW),
    Product::new(172, DeviceType::Boiler, "Nefit Enviline", ProductVariant::None, RW),
    // Solar modules
    Product::new(73, DeviceType::Solar, "SM10 Solar Module", ProductVariant::Sm10, RW),
    Product::new(163, DeviceType::Solar, "SM100 Solar Module", ProductVariant::Sm100, RW),
    Product::new(101, DeviceType::Solar, "Junkers ISM1 Solar Module", ProductVariant::Sm100, RW),
    Product::new(162, DeviceType::Solar, "SM50 Solar Module", ProductVariant::Sm100, RW),
    // Mixing modules
    Product::new(160, DeviceType::Mixer, "MM100 Mixing Module", ProductVariant::None, RW),
    Product::new(161, DeviceType::Mixer, "MM200 Mixing Module", ProductVariant::None, RW),
    Product::new(69, DeviceType::Mixer, "MM10 Mixer Module", ProductVariant::None, RW),
    Product::new(159, DeviceType::Mixer, "MM50 Mixing Module", ProductVariant::None, RW),
    Product::new(79, DeviceType::Mixer, "MM100 Mixer Module", ProductVariant::None, RW),
    Product::new(80, DeviceType::Mixer, "MM200 Mixer Module", ProductVariant::None, RW),
    Product::new(78, DeviceType::Mixer, "MM400 Mixer Module", ProductVariant::None, RW),
    // Heat pumps
    Product::new(252, DeviceType::HeatPump, "HeatPump Module", ProductVariant::None, RW),
    Product::new(200, DeviceType::HeatPump, "HeatPump Module", ProductVariant::None, RW),
    // Switches, controllers, connectors and gateways
    Product::new(71, DeviceType::Switch, "WM10 Switch Module", ProductVariant::None, RW),
    Product::new(68, DeviceType::Controller, "BC10/RFM20 Receiver", ProductVariant::None, RW),
    Product::new(218, DeviceType::Controller, "Junkers M200/Buderus RFM200 Receiver", ProductVariant::None, RW),
    Product::new(190, DeviceType::Controller, "BC10 Base Controller", ProductVariant::None, RW),
    Product::new(114, DeviceType::Controller, "BC10 Base Controller", ProductVariant::None, RW),
    Product::new(125, DeviceType::Controller, "BC25 Base Controller", ProductVariant::None, RW),
    Product::new(169, DeviceType::Controller, "BC40 Base Controller", ProductVariant::None, RW),
    Product::new(152, DeviceType::Controller, "Controller", ProductVariant::None, RW),
    Product::new(95, DeviceType::Controller, "HT3 Controller", ProductVariant::None, RW),
    Product::new(230, DeviceType::Controller, "BC Base Controller", ProductVariant::None, RW),
    Product::new(205, DeviceType::Connector, "Nefit Moduline Easy Connect", ProductVariant::None, RW),
    Product::new(206, DeviceType::Connector, "Bosch Easy Connect", ProductVariant::None, RW),
    Product::new(171, DeviceType::Connector, "EMS-OT OpenTherm converter", ProductVariant::None, RW),
    Product::new(189, DeviceType::Gateway, "Web Gateway KM200", ProductVariant::None, RW),
    // Thermostats, Easy family (read only)
    Product::new(202, DeviceType::Thermostat, "Logamatic TC100/Nefit Moduline Easy", ProductVariant::Easy, RO),
    Product::new(203, DeviceType::Thermostat, "Bosch EasyControl CT200", ProductVariant::Easy, RO),
    Product::new(157, DeviceType::Thermostat, "Buderus RC200/Bosch CW100/Junkers CW100", ProductVariant::None, RO),
    // Thermostats, Buderus/Nefit
    Product::new(79, DeviceType::Thermostat, "RC10/Moduline 100", ProductVariant::Rc10, RW),
    Product::new(77, DeviceType::Thermostat, "RC20/Moduline 300", ProductVariant::Rc20, RW),
    Product::new(93, DeviceType::Thermostat, "RC20RF", ProductVariant::Rc20, RW),
    Product::new(67, DeviceType::Thermostat, "RC30", ProductVariant::Rc30, RW),
    Product::new(78, DeviceType::Thermostat, "RC30/Moduline 400", ProductVariant::Rc30, RW),
    Product::new(86, DeviceType::Thermostat, "RC35", ProductVariant::Rc35, RW),
    Product::new(158, DeviceType::Thermostat, "RC300/RC310/Moduline 3000/Bosch CW400/W-B Sense II", ProductVariant::Rc300, RW),
    Product::new(165, DeviceType::Thermostat, "RC100/Moduline 1010", ProductVariant::Rc300, RO),
    // Thermostats, Sieger
    Product::new(76, DeviceType::Thermostat, "Sieger ES73", ProductVariant::Rc35, RW),
    // Thermostats, Junkers (read only)
    Product::new(105, DeviceType::Thermostat, "Junkers FW100", ProductVariant::Junkers, RO),
    Product::new(106, DeviceType::Thermostat, "Junkers FW200", ProductVariant::Junkers, RO),
    Product::new(107, DeviceType::Thermostat, "Junkers FR100", ProductVariant::Junkers, RO),
    Product::new(108, DeviceType::Thermostat, "Junkers FR110", ProductVariant::Junkers, RO),
    Product::new(111, DeviceType::Thermostat, "Junkers FR10", ProductVariant::Junkers, RO),
    Product::new(191, DeviceType::Thermostat, "Junkers FR120", ProductVariant::Junkers, RO),
    Product::new(192, DeviceType::Thermostat, "Junkers FW120", ProductVariant::Junkers, RO),
    Product::new(147, DeviceType::Thermostat, "Junkers FR50", ProductVariant::Junkers, RO),
];

const ONLINE_DEVICE_NAMES: [&str; 64] = [
    "device_08", "device_09", "device_10", "device_11", "device_12", "device_13", "device_14", "device_15",
    "device_16", "device_17", "device_18", "device_19", "device_20", "device_21", "device_22", "device_23",
    "device_24", "device_25", "device_26", "device_27", "device_28", "device_29", "device_30", "device_31",
    "device_32", "device_33", "device_34", "device_35", "device_36", "device_37", "device_38", "device_39",
    "device_40", "device_41", "device_42", "device_43", "device_44", "device_45", "device_46", "device_47",
    "device_48", "device_49", "device_50", "device_51", "device_52", "device_53", "device_54", "device_55",
    "device_56", "device_57", "device_58", "device_59", "device_60", "device_61", "device_62", "device_63",
    "device_64", "device_65", "device_66", "device_67", "device_68", "device_69", "device_70", "device_71",
];

const VERSION: &[Field] = &[
    Field::integer(0, 1, "product_id", "Product ID"),
    Field::integer(1, 1, "ver_major", "Version Major"),
    Field::integer(2, 1, "ver_minor", "Version Minor"),
];

const RC_TIME: &[Field] = &[
    Field::date_time(0, 6, "time", "Time"),
    Field::integer(6, 1, "dow", "Day of week"),
    Field::boolean(7, 0, "dst", "Daylight saving"),
    Field::boolean(7, 1, "radio", "Radio clock"),
    Field::boolean(7, 2, "bad_time", "Time incorrect"),
    Field::boolean(7, 3, "bad_date", "Date incorrect"),
    Field::boolean(7, 4, "enabled", "Clock enabled"),
];

const ERROR_LOG: &[Field] = &[
    Field::string(0, 2, "display", "Display code"),
    Field::integer(2, 2, "code", "Error code"),
    Field::date_time(4, 5, "timestamp", "Time stamp"),
    Field::integer(9, 2, "duration", "Duration").with_unit(Unit::Minute),
    Field::integer(11, 1, "source", "Source bus address"),
];

const UBA_OPERATION_TIME: &[Field] = &[
    Field::integer(0, 3, "duration", "Operation duration").with_unit(Unit::Minute),
];

const UBA_MAINTENANCE_SETTINGS: &[Field] = &[
    Field::integer(0, 1, "timestamp_unit", "Maintenance log timestamp unit").with_unit(Unit::UbaMsTimestamp),
    Field::integer(1, 1, "remaining_time", "Remaining time to next maintenance")
        .with_unit(Unit::Hour)
        .multiplied_by(100),
    Field::date(2, "next_maintenance", "Date of next maintenance"),
];

const UBA_SETTINGS: &[Field] = &[
    Field::flag(0, 0xFF, "boiler_heating", "Boiler heating activated").with_unit(Unit::OnOff),
    Field::integer(1, 1, "boiler_temp", "Boiler heating temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(2, 1, "boiler_max", "Maximum boiler power").with_unit(Unit::Percent),
    Field::integer(3, 1, "boiler_min", "Minimum boiler power").with_unit(Unit::Percent),
    Field::integer(4, 1, "stop_hysteresis", "Stop hysteresis").with_unit(Unit::Celsius).signed(),
    Field::integer(5, 1, "start_hysteresis", "Start hysteresis").with_unit(Unit::Celsius).signed(),
    Field::integer(6, 1, "anti_swing_time", "Anti-swinging time").with_unit(Unit::Minute),
    Field::integer(8, 1, "follow_up_time", "Boiler stop follow up time").with_unit(Unit::Minute),
    Field::integer(9, 1, "pump_max", "Heat circuit pump maximum power").with_unit(Unit::Percent),
    Field::integer(10, 1, "pump_min", "Heat circuit pump minimum power").with_unit(Unit::Percent),
];

const UBA_MONITOR_FAST: &[Field] = &[
    Field::integer(0, 1, "forward_temp_set", "Set forward flow temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(1, 2, "forward_temp", "Current forward flow temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(3, 1, "burner_power_max", "Maximum burner power").with_unit(Unit::Percent),
    Field::integer(4, 1, "burner_power", "Current burner power").with_unit(Unit::Percent),
    Field::boolean(7, 0, "valve1", "Gas valve 1").with_unit(Unit::OpenClosed),
    Field::boolean(7, 1, "valve2", "Gas valve 2").with_unit(Unit::OpenClosed),
    Field::boolean(7, 2, "fan", "Fan").with_unit(Unit::OnOff),
    Field::boolean(7, 3, "ignition", "Ignition").with_unit(Unit::OnOff),
    Field::boolean(7, 4, "boiler_pump", "Boiler pump").with_unit(Unit::OnOff),
    Field::boolean(7, 5, "drinkwater_valve", "Drink water valve").with_unit(Unit::OpenClosed),
    Field::boolean(7, 6, "drinkwater_pump", "Drink water circulation pump").with_unit(Unit::OnOff),
    Field::integer(9, 2, "boiler_temp", "Boiler temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(11, 2, "drinkwater_temp", "Drink water temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(13, 2, "return_current", "Current return flow temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(15, 2, "flame_power", "Flame current").with_unit(Unit::MicroAmpere).divided_by(10),
    Field::integer(17, 1, "pressure", "System pressure").with_unit(Unit::Bar).divided_by(10),
    Field::string(18, 2, "service_code", "Service code"),
    Field::integer(20, 2, "error_code", "Error code"),
    Field::integer(23, 2, "intake_temp", "Intake temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
];

const UBA_MONITOR_SLOW: &[Field] = &[
    Field::integer(0, 2, "outside_temp", "Outside temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(2, 2, "boiler_temp", "Boiler temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(4, 2, "exhaust_temp", "Exhaust temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(9, 1, "pump_power", "Pump power").with_unit(Unit::Percent),
    Field::integer(10, 3, "burner_starts", "Burner starts"),
    Field::integer(13, 3, "burner_total", "Burner total operation time").with_unit(Unit::Minute),
    Field::integer(16, 3, "burner_stage2", "Burner time in stage 2").with_unit(Unit::Minute),
    Field::integer(19, 3, "burner_heat", "Burner time heating").with_unit(Unit::Minute),
    Field::integer(22, 3, "burner_drinkwater", "Burner time heating drink water").with_unit(Unit::Minute),
];

const UBA_SET_VALUES: &[Field] = &[
    Field::integer(0, 1, "boiler_temp", "Boiler set temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(1, 1, "heat_power", "Heat circuit power").with_unit(Unit::Percent),
    Field::integer(2, 1, "drinkwater_power", "Requested drink water power").with_unit(Unit::Percent),
];

const UBA_MAINTENANCE: &[Field] = &[
    Field::integer(0, 1, "need_maintenance", "Maintenance necessary").with_unit(Unit::UbaMmNeed),
];

const UBA_FUNCTION_TEST: &[Field] = &[
    Field::flag(0, 0x5A, "test_on", "Test mode activated").with_unit(Unit::OnOff),
    Field::integer(1, 1, "burner_power", "Burner power").with_unit(Unit::Percent),
    Field::integer(3, 1, "boiler_power", "Boiler power").with_unit(Unit::Percent),
    Field::integer(4, 1, "valve", "3-way-valve setting").with_unit(Unit::UbaFtValve),
    Field::flag(5, 0xFF, "pump_on", "Heat circuit pump").with_unit(Unit::OnOff),
];

const UBA_DRINKWATER_PARAM: &[Field] = &[
    Field::boolean(0, 3, "installed", "Drink water system installed").with_unit(Unit::YesNo),
    Field::flag(1, 0xFF, "activated", "Drink water system activated").with_unit(Unit::YesNo),
    Field::integer(2, 1, "set_temp", "Drink water set temperature").with_unit(Unit::Celsius).signed(),
    Field::flag(6, 0xFF, "pump_installed", "Drink water circulation pump installed").with_unit(Unit::YesNo),
    Field::integer(7, 1, "pump_cycle", "Drink water circulation pump switch cycle")
        .with_unit(Unit::Minute)
        .multiplied_by(3),
    Field::integer(8, 1, "desinfection_temp", "Drink water thermal desinfection temperature")
        .with_unit(Unit::Celsius)
        .signed(),
    Field::integer(9, 1, "mode", "Drink water operation mode").with_unit(Unit::DwMode),
    Field::integer(10, 1, "use_valve", "Drink water loading system type").with_unit(Unit::DwLoading),
];

const UBA_DRINKWATER_MONITOR: &[Field] = &[
    Field::integer(0, 1, "set_temp", "Drink water set temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(1, 2, "sensor1_temp", "Drink water sensor 1 temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(3, 2, "sensor2_temp", "Drink water sensor 2 temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::boolean(5, 0, "day_mode", "Drink water day mode").with_unit(Unit::YesNo),
    Field::boolean(5, 1, "oneshot", "Drink water one shot heating").with_unit(Unit::YesNo),
    Field::boolean(5, 2, "desinfection", "Drink water thermal desinfection running").with_unit(Unit::YesNo),
    Field::boolean(5, 3, "enabled", "Drink water heating enabled").with_unit(Unit::YesNo),
    Field::boolean(5, 4, "reheat", "Drink water re-heating").with_unit(Unit::YesNo),
    Field::boolean(5, 5, "set_reached", "Drink water set temperature reached").with_unit(Unit::YesNo),
    Field::boolean(6, 0, "sens1err", "Drink water sensor 1 error").with_unit(Unit::YesNo),
    Field::boolean(6, 1, "sens2err", "Drink water sensor 2 error").with_unit(Unit::YesNo),
    Field::boolean(6, 2, "desinfect_error", "Drink water thermal desinfection error").with_unit(Unit::YesNo),
    Field::boolean(7, 3, "pump_day", "Drink water circulation in day mode").with_unit(Unit::YesNo),
    Field::boolean(7, 4, "pump_manual", "Drink water circulation in manual mode").with_unit(Unit::YesNo),
    Field::integer(8, 1, "system_type", "Drink water system type").with_unit(Unit::DwType),
    Field::integer(9, 1, "current_flow", "Drink water current flow").with_unit(Unit::LiterPerMin).divided_by(10),
    Field::integer(10, 3, "heating_time", "Drink water total heating time").with_unit(Unit::Minute),
    Field::integer(13, 3, "heating_runs", "Drink water total heating runs"),
];

const UBA_FLAGS: &[Field] = &[
    Field::integer(0, 1, "data1", "Data 1"),
    Field::integer(1, 1, "data2", "Data 2"),
];

const HC_DRINKWATER_PARAM: &[Field] = &[
    Field::integer(0, 1, "heating_program", "Drinkwater heating program").with_unit(Unit::HwDcProgram),
    Field::integer(1, 1, "circulation_program", "Drinkwater circulation program").with_unit(Unit::HwDcProgram),
    Field::integer(2, 1, "operation", "Drinkwater operation mode").with_unit(Unit::OffOnAuto),
    Field::integer(3, 1, "pump", "Drinkwater pump operation").with_unit(Unit::OffOnAuto),
    Field::flag(4, 0xFF, "desinfection_on", "Drinkwater thermal desinfection").with_unit(Unit::OnOff),
    Field::integer(5, 1, "desinfection_day", "Drinkwater thermal desinfection week day").with_unit(Unit::WeekDay),
    Field::integer(6, 1, "desinfection_hour", "Drinkwater thermal desinfection hour").with_unit(Unit::Hour),
    Field::integer(8, 1, "desinfection_temp", "Drinkwater thermal desinfection maximum temperature")
        .with_unit(Unit::Celsius)
        .signed(),
    Field::flag(9, 0xFF, "one_shot", "One-shot drinkwater heating").with_unit(Unit::OnOff),
];

const HC_PARAM: &[Field] = &[
    Field::integer(0, 1, "install_type", "Installation type").with_unit(Unit::HcInstallation),
    Field::integer(1, 1, "night_temp", "Night temperature").with_unit(Unit::Celsius).divided_by(2).signed(),
    Field::integer(2, 1, "day_temp", "Day temperature").with_unit(Unit::Celsius).divided_by(2).signed(),
    Field::integer(3, 1, "holiday_temp", "Holiday temperature").with_unit(Unit::Celsius).divided_by(2).signed(),
    Field::integer(4, 1, "room_influence_temp", "Room influence temperature")
        .with_unit(Unit::Celsius)
        .divided_by(2)
        .signed(),
    Field::integer(6, 1, "room_offset_temp", "Room offset temperature")
        .with_unit(Unit::Celsius)
        .divided_by(2)
        .signed(),
    Field::integer(7, 1, "operation", "Operating mode").with_unit(Unit::HcOperation),
    Field::flag(8, 0xFF, "screed_drying", "Screed drying").with_unit(Unit::OnOff),
    Field::integer(15, 1, "max_forward_temp", "Max forward flow temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(16, 1, "min_forward_temp", "Min forward flow temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(17, 1, "lay_out_temp", "Lay out temperature").with_unit(Unit::Celsius).signed(),
    Field::flag(19, 0xFF, "onoff_optimization", "On/off optimization").with_unit(Unit::OnOff),
    Field::integer(22, 1, "summer_threshold", "Summer threshold").with_unit(Unit::Celsius).signed(),
    Field::integer(23, 1, "antifreeze_temp", "Antifreeze temperature").with_unit(Unit::Celsius).signed(),
    Field::integer(25, 1, "work_mode", "Work mode").with_unit(Unit::HcWorkMode),
    Field::integer(26, 1, "remote", "Remote model").with_unit(Unit::HcRemote),
];

const HC_MONITOR: &[Field] = &[
    Field::boolean(0, 0, "optimize_on", "Optimize turn on").with_unit(Unit::YesNo),
    Field::boolean(0, 1, "optimize_off", "Optimize turn off").with_unit(Unit::YesNo),
    Field::boolean(0, 2, "automatic_mode", "Automatic mode").with_unit(Unit::YesNo),
    Field::boolean(0, 3, "drinkwater_preferred", "Drinkwater preferred").with_unit(Unit::YesNo),
    Field::boolean(0, 4, "screed_mode", "Screed drying mode").with_unit(Unit::YesNo),
    Field::boolean(0, 5, "vacation_mode", "Vacation mode").with_unit(Unit::YesNo),
    Field::boolean(0, 6, "frost_protection", "Frost protection").with_unit(Unit::YesNo),
    Field::boolean(0, 7, "manual", "Manual mode").with_unit(Unit::YesNo),
    Field::boolean(1, 0, "summer_mode", "Summer mode").with_unit(Unit::YesNo),
    Field::boolean(1, 1, "day_mode", "Day mode").with_unit(Unit::YesNo),
    Field::boolean(1, 2, "remote_offline", "Remote offline").with_unit(Unit::YesNo),
    Field::boolean(1, 3, "remote_error", "Remote error").with_unit(Unit::YesNo),
    Field::boolean(1, 4, "forward_error", "Forward flow sensor error").with_unit(Unit::YesNo),
    Field::boolean(1, 5, "forward_max", "Forward max flow").with_unit(Unit::YesNo),
    Field::boolean(1, 6, "external_error", "External error").with_unit(Unit::YesNo),
    Field::boolean(1, 7, "party_pause", "Party pause mode").with_unit(Unit::YesNo),
    Field::integer(2, 1, "room_set_temp", "Set room temperature").with_unit(Unit::Celsius).divided_by(2).signed(),
    Field::integer(3, 2, "room_current_temp", "Current room temperature")
        .with_unit(Unit::Celsius)
        .divided_by(10)
        .signed(),
    Field::integer(5, 1, "optimize_on_time", "Optimize turn on time"),
    Field::integer(6, 1, "optimize_off_time", "Optimize turn off time"),
    Field::integer(7, 1, "curve_minus_10", "Heating curve at -10 °C").signed(),
    Field::integer(8, 1, "curve_0", "Heating curve at 0 °C").signed(),
    Field::integer(9, 1, "curve_plus_10", "Heating curve at 10 °C").signed(),
    Field::integer(10, 2, "room_adaption", "Room temperature adaption speed").divided_by(100).signed(),
    Field::integer(12, 1, "boiler_power", "Requested boiler power").with_unit(Unit::Percent),
    Field::boolean(13, 2, "party_state", "Party mode").with_unit(Unit::OnOff),
    Field::boolean(13, 3, "pause_state", "Pause mode").with_unit(Unit::OnOff),
    Field::boolean(13, 6, "vacation_state", "Vacation mode").with_unit(Unit::OnOff),
    Field::boolean(13, 7, "holiday_state", "Holiday mode").with_unit(Unit::OnOff),
    Field::integer(14, 1, "forward_temp", "Calculated forward temp").with_unit(Unit::Celsius).signed(),
];

const RC_OUTDOOR: &[Field] = &[
    Field::integer(0, 1, "damped_temp", "Damped outdoor temperature").with_unit(Unit::Celsius).signed(),
];

fn online_devices() -> Vec<Field> {
    ONLINE_DEVICE_NAMES
        .iter()
        .enumerate()
        .map(|(i, &name)| {
            Field::boolean(i / 8, (i % 8) as u8, name, "Device online").with_unit(Unit::Device)
        })
        .collect()
}

/// Rows of all known EMS messages
pub fn builtin_messages() -> Vec<MessageRow> {
    let mut rows = vec![
        MessageRow::new(MSG_VERSION, "Version", 3, VERSION),
        MessageRow::new(MSG_RC_TIME, "RcTime", 8, RC_TIME),
        MessageRow::new(MSG_ONLINE_DEVICES, "UbaDevices", 13, &online_devices()),
        MessageRow::new(0x10, "UbaError1", 96, ERROR_LOG),
        MessageRow::new(0x11, "UbaError2", 96, ERROR_LOG),
        MessageRow::new(0x12, "RcErrors", 96, ERROR_LOG),
        MessageRow::new(0x13, "RcResetErrors", 96, ERROR_LOG),
        MessageRow::new(0x14, "UbaOperationTime", 3, UBA_OPERATION_TIME),
        MessageRow::new(0x15, "UbaMaintenanceSettings", 5, UBA_MAINTENANCE_SETTINGS),
        MessageRow::new(0x16, "UbaSettings", 11, UBA_SETTINGS),
        MessageRow::new(MSG_UBA_MONITOR_FAST, "UbaMonitorFast", 25, UBA_MONITOR_FAST),
        MessageRow::new(MSG_UBA_MONITOR_SLOW, "UbaMonitorSlow", 25, UBA_MONITOR_SLOW),
        MessageRow::new(MSG_UBA_SET_VALUES, "UbaSetValues", 4, UBA_SET_VALUES).writable(),
        MessageRow::new(0x1C, "UbaMaintenance", 1, UBA_MAINTENANCE),
        MessageRow::new(0x1D, "UbaFunctionTest", 11, UBA_FUNCTION_TEST),
        MessageRow::new(MSG_UBA_DRINKWATER_PARAM, "UbaDrinkwaterParameter", 11, UBA_DRINKWATER_PARAM)
            .writable(),
        MessageRow::new(MSG_UBA_DRINKWATER_MONITOR, "UbaDrinkwaterMonitor", 16, UBA_DRINKWATER_MONITOR),
        MessageRow::new(0x35, "UbaFlags", 2, UBA_FLAGS),
        MessageRow::new(MSG_HC_DRINKWATER_PARAM, "HcDrinkwaterParam", 10, HC_DRINKWATER_PARAM).writable(),
        MessageRow::new(0xA3, "RcOutdoor", 3, RC_OUTDOOR),
    ];

    for (param, monitor, param_name, monitor_name) in HEAT_CIRCUITS {
        rows.push(MessageRow::new(param, param_name, 27, HC_PARAM).writable());
        rows.push(MessageRow::new(monitor, monitor_name, 15, HC_MONITOR));
    }
    rows
}

/// Parameter and monitor messages of the four heat circuits
const HEAT_CIRCUITS: [(u8, u8, &str, &str); 4] = [
    (MSG_HC1_PARAM, MSG_HC1_MONITOR, "Hc1Param", "Hc1Monitor"),
    (0x47, 0x48, "Hc2Param", "Hc2Monitor"),
    (0x51, 0x52, "Hc3Param", "Hc3Monitor"),
    (0x5B, 0x5C, "Hc4Param", "Hc4Monitor"),
];
