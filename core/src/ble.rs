use std::time::Duration;

use uuid::Uuid;

use crate::buffer::NotificationSink;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BleDeviceInfo {
    pub address: String,
    pub name: String,
    pub rssi: i16,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BleError {
    #[error("bluetooth permission denied")]
    PermissionDenied,
    #[error("bluetooth is powered off")]
    BluetoothOff,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("no known serial service on device")]
    ServiceNotFound,
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(String),
    #[error("GATT error: {0}")]
    Gatt(String),
    #[error("not connected")]
    Disconnected,
    #[error("timed out")]
    Timeout,
}

/// GATT services dive computers use as a byte pipe.
pub const SERIAL_SERVICES: &[(&str, Uuid)] = &[
    (
        "Nordic UART",
        Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E),
    ),
    (
        "Shearwater",
        Uuid::from_u128(0xFE25C237_0ECE_443C_B0AA_E02033E7029D),
    ),
    (
        "Heinrichs-Weikamp Terminal I/O",
        Uuid::from_u128(0x0000FEFB_0000_1000_8000_00805F9B34FB),
    ),
    (
        "Suunto",
        Uuid::from_u128(0x98AE7120_E62E_11E3_BADD_0002A5D5C51B),
    ),
    (
        "Scubapro u-blox",
        Uuid::from_u128(0x2456E1B9_26E2_8F83_E744_F34F01E9D701),
    ),
    (
        "Mares",
        Uuid::from_u128(0x544E326B_5B72_C6B0_1C46_41C1BC448118),
    ),
    (
        "Pelagic",
        Uuid::from_u128(0xCB3C4555_D670_4670_BC20_B61DBC851E9A),
    ),
];

pub fn is_serial_service(uuid: &Uuid) -> bool {
    SERIAL_SERVICES.iter().any(|(_, known)| known == uuid)
}

/// Host-side BLE central able to find and connect peripherals.
pub trait BleCentral {
    type Connection: BleConnection;

    fn scan(&mut self, timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError>;

    /// Establish the physical link. Service discovery is a separate step.
    fn connect(&mut self, address: &str) -> Result<Self::Connection, BleError>;
}

/// One physical connection. Notifications and link loss are reported on the
/// backend's own delivery context through the [`NotificationSink`].
pub trait BleConnection: Send {
    fn address(&self) -> &str;

    fn name(&self) -> Option<String>;

    fn discover_services(&mut self) -> Result<(), BleError>;

    fn subscribe(&mut self, sink: NotificationSink) -> Result<(), BleError>;

    /// Unacknowledged write. Success means the stack accepted the bytes.
    fn write_without_response(&mut self, data: &[u8]) -> Result<(), BleError>;

    fn disconnect(&mut self) -> Result<(), BleError>;
}
