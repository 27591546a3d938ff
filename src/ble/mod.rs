mod bluer_transport;
mod device;
mod discovery;
pub mod gatt_const;
mod scanner;
mod transport;

#[cfg(test)]
pub(crate) mod sim;

pub use bluer_transport::BluerTransport;
pub use device::{
    DeviceAddress, DeviceFamily, DeviceHandle, RadarHandle, SleepaceHandle,
};
pub use discovery::BluerAdvertisementSource;
pub use scanner::{
    Advertisement, AdvertisementSource, ScanFilter, ScanRecord, ScanStream,
    Scanner,
};
pub use transport::{DeviceTransport, LinkEvent, LinkEventSender};

#[cfg(test)]
pub use scanner::MockAdvertisementSource;
#[cfg(test)]
pub use transport::MockDeviceTransport;
