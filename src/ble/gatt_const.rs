use bluer::Uuid;

// ESP BluFi service used by the radar family
pub const BLUFI_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000ffff_0000_1000_8000_00805f9b34fb);
pub const BLUFI_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb); //phone -> device
pub const BLUFI_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb); //device -> phone

// UART style service exposed by the sleepace boards
pub const UART_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const UART_WRITE_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const UART_NOTIFY_CHAR_UUID: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// The characteristics a session needs on the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write_char: Uuid,
    pub notify_char: Uuid,
}

pub const BLUFI_PROFILE: GattProfile = GattProfile {
    service: BLUFI_SERVICE_UUID,
    write_char: BLUFI_WRITE_CHAR_UUID,
    notify_char: BLUFI_NOTIFY_CHAR_UUID,
};

pub const UART_PROFILE: GattProfile = GattProfile {
    service: UART_SERVICE_UUID,
    write_char: UART_WRITE_CHAR_UUID,
    notify_char: UART_NOTIFY_CHAR_UUID,
};

pub const KNOWN_PROFILES: [GattProfile; 2] = [BLUFI_PROFILE, UART_PROFILE];
