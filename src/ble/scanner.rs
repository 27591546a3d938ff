//! Scan session: discovers peripherals of one family, filters them and
//! emits each address at most once per session.
//!
//! A later advertisement for an address already emitted replaces the stored
//! record but is not emitted again, so callers get a stable list even when
//! the signal strength changes.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use log::{debug, info, trace};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time::sleep,
};
use tokio_stream::wrappers::ReceiverStream;

use super::device::{DeviceAddress, DeviceFamily, DeviceHandle};
use crate::error::{ProvisionError, Result};

#[cfg(test)]
use mockall::automock;

/// One advertisement event as seen by the radio.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub service_uuids: Vec<String>,
    pub raw: Vec<u8>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdvertisementSource: Send + Sync + 'static {
    /// Starts radio discovery. Dropping the returned stream stops it.
    async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>>;
}

/// Exactly one filter policy is active per scan session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScanFilter {
    #[default]
    None,
    /// Substring of the advertised name, so a prefix matches too.
    Name(String),
    /// Case insensitive substring of the address.
    Mac(String),
    /// Case insensitive substring of any advertised service UUID.
    Uuid(String),
}

impl ScanFilter {
    pub fn matches(&self, adv: &Advertisement) -> bool {
        match self {
            ScanFilter::None => true,
            ScanFilter::Name(pattern) => adv
                .name
                .as_deref()
                .map_or(false, |name| name.contains(pattern.as_str())),
            ScanFilter::Mac(pattern) => adv
                .address
                .to_ascii_uppercase()
                .contains(&pattern.to_ascii_uppercase()),
            ScanFilter::Uuid(pattern) => {
                let pattern = pattern.to_ascii_lowercase();
                adv.service_uuids
                    .iter()
                    .any(|uuid| uuid.to_ascii_lowercase().contains(&pattern))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub advertisement: Vec<u8>,
    pub discovered_at: SystemTime,
    pub handle: DeviceHandle,
}

impl ScanRecord {
    fn from_advertisement(family: DeviceFamily, adv: Advertisement) -> Self {
        Self {
            handle: DeviceHandle::new(
                family,
                adv.address.clone(),
                adv.name.clone(),
            ),
            address: adv.address,
            name: adv.name,
            rssi: adv.rssi,
            advertisement: adv.raw,
            discovered_at: SystemTime::now(),
        }
    }
}

/// Lazy sequence of discovered devices; ends with the scan session.
pub type ScanStream = ReceiverStream<ScanRecord>;

type ScanResults = Arc<Mutex<HashMap<DeviceAddress, ScanRecord>>>;

pub struct Scanner {
    source: Arc<dyn AdvertisementSource>,
    scan_period: Duration,
    channel_capacity: usize,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    //map of the current session, a restart installs a new one
    results: Mutex<ScanResults>,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn AdvertisementSource>, scan_period: Duration,
        channel_capacity: usize,
    ) -> Self {
        Self {
            source,
            scan_period,
            channel_capacity,
            stop_tx: Mutex::new(None),
            results: Mutex::new(ScanResults::default()),
        }
    }

    /// Starts a new scan session, stopping the previous one and clearing its
    /// results.
    ///
    /// # Errors
    ///
    /// Returns `ScanFailed` if the radio refuses to start discovery.
    pub async fn start_scan(
        &self, family: DeviceFamily, filter: ScanFilter,
    ) -> std::result::Result<ScanStream, ProvisionError> {
        self.stop_scan().await;
        let results = ScanResults::default();
        *self.results.lock().await = results.clone();

        let advertisements = self
            .source
            .advertisements()
            .await
            .map_err(|e| ProvisionError::ScanFailed(e.to_string()))?;

        let (record_tx, record_rx) = mpsc::channel(self.channel_capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        *self.stop_tx.lock().await = Some(stop_tx);

        info!("Scan started for {:?} with filter {:?}", family, filter);

        tokio::spawn(run_scan_session(
            advertisements,
            family,
            filter,
            self.scan_period,
            results,
            record_tx,
            stop_rx,
        ));

        Ok(ReceiverStream::new(record_rx))
    }

    /// Stops the running scan session, if any.
    pub async fn stop_scan(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().await.take() {
            let _ = stop_tx.send(());
        }
    }

    /// Latest record of every device seen in the current session.
    pub async fn results(&self) -> Vec<ScanRecord> {
        let results = self.results.lock().await.clone();
        let records = results.lock().await;
        records.values().cloned().collect()
    }
}

async fn run_scan_session(
    mut advertisements: BoxStream<'static, Advertisement>,
    family: DeviceFamily, filter: ScanFilter, scan_period: Duration,
    results: ScanResults, record_tx: mpsc::Sender<ScanRecord>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let period = sleep(scan_period);
    tokio::pin!(period);

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                info!("Scan stopped");
                break;
            }

            _ = &mut period => {
                info!("Scan period elapsed");
                break;
            }

            adv = advertisements.next() => {
                let Some(adv) = adv else {
                    debug!("Advertisement stream ended");
                    break;
                };

                if !filter.matches(&adv) {
                    trace!("Filtered out advertisement of {}", adv.address);
                    continue;
                }

                let record = ScanRecord::from_advertisement(family, adv);
                let first_seen = results
                    .lock()
                    .await
                    .insert(record.address.clone(), record.clone())
                    .is_none();

                if !first_seen {
                    trace!("Device {} already reported", record.address);
                    continue;
                }

                debug!("Device discovered: {} {:?}", record.address, record.name);
                if record_tx.send(record).await.is_err() {
                    debug!("Scan consumer went away");
                    break;
                }
            }
        }
    }
}
