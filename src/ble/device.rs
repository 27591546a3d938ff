use serde::{Deserialize, Serialize};

/// MAC-like identifier of a peripheral, key of every per-device state.
pub type DeviceAddress = String;

/// Vendor family of a peripheral, fixed when the scan is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    Radar,
    Sleepace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RadarHandle {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepaceHandle {
    pub address: DeviceAddress,
    pub name: Option<String>,
}

/// A discovered peripheral, resolved to its family once at discovery time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceHandle {
    Radar(RadarHandle),
    Sleepace(SleepaceHandle),
}

impl DeviceHandle {
    pub fn new(
        family: DeviceFamily, address: DeviceAddress, name: Option<String>,
    ) -> Self {
        match family {
            DeviceFamily::Radar => {
                DeviceHandle::Radar(RadarHandle { address, name })
            }
            DeviceFamily::Sleepace => {
                DeviceHandle::Sleepace(SleepaceHandle { address, name })
            }
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        match self {
            DeviceHandle::Radar(handle) => &handle.address,
            DeviceHandle::Sleepace(handle) => &handle.address,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            DeviceHandle::Radar(handle) => handle.name.as_deref(),
            DeviceHandle::Sleepace(handle) => handle.name.as_deref(),
        }
    }

    pub fn family(&self) -> DeviceFamily {
        match self {
            DeviceHandle::Radar(_) => DeviceFamily::Radar,
            DeviceHandle::Sleepace(_) => DeviceFamily::Sleepace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_resolves_family() {
        let radar = DeviceHandle::new(
            DeviceFamily::Radar,
            "AA:BB:CC:DD:EE:FF".to_string(),
            Some("TSBLU_01".to_string()),
        );
        assert_eq!(radar.family(), DeviceFamily::Radar);
        assert_eq!(radar.address(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(radar.name(), Some("TSBLU_01"));

        let board = DeviceHandle::new(
            DeviceFamily::Sleepace,
            "11:22:33:44:55:66".to_string(),
            None,
        );
        assert!(matches!(board, DeviceHandle::Sleepace(_)));
        assert_eq!(board.name(), None);
    }
}
