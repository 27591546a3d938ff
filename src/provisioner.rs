//! Caller-facing provisioning service.
//!
//! Each provision or status query owns a fresh device session for its whole
//! lifetime and tears it down exactly once when it resolves. Only one
//! operation may run per address; `cancel` ends it from outside.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use log::{info, warn};
use tokio::{
    sync::{oneshot, watch, Mutex},
    time::timeout,
};

use crate::ble::{
    AdvertisementSource, DeviceAddress, DeviceFamily, DeviceHandle,
    DeviceTransport, ScanFilter, ScanStream, Scanner,
};
use crate::config::ProvisionerConfig;
use crate::error::ProvisionError;
use crate::provisioning::{
    DeviceHistory, DeviceStatusReport, HistorySink, Pipeline, Progress,
    ProvisioningRequest, ProvisioningResult,
};
use crate::session::DeviceSession;

type ActiveOps = Arc<Mutex<HashMap<DeviceAddress, ActiveOp>>>;

struct ActiveOp {
    id: u64,
    //cancel signal and the end of the session task, taken by `cancel`
    cancel: Option<(oneshot::Sender<()>, BoxFuture<'static, ()>)>,
}

pub struct BleProvisioner {
    transport: Arc<dyn DeviceTransport>,
    scanner: Scanner,
    config: ProvisionerConfig,
    history: Option<Arc<dyn HistorySink>>,
    active: ActiveOps,
    next_op: AtomicU64,
}

impl BleProvisioner {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        advertisement_source: Arc<dyn AdvertisementSource>,
        config: ProvisionerConfig,
    ) -> Self {
        let scanner = Scanner::new(
            advertisement_source,
            config.scan_period(),
            config.channel_capacity,
        );

        Self {
            transport,
            scanner,
            config,
            history: None,
            active: ActiveOps::default(),
            next_op: AtomicU64::new(0),
        }
    }

    /// Hands every successful provisioning to `sink`.
    pub fn with_history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    pub async fn scan(
        &self, family: DeviceFamily, filter: ScanFilter,
    ) -> Result<ScanStream, ProvisionError> {
        self.scanner.start_scan(family, filter).await
    }

    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await;
    }

    /// Runs the provisioning pipeline against the request target. Always
    /// resolves exactly once, failures included.
    pub async fn provision(
        &self, request: ProvisioningRequest,
    ) -> ProvisioningResult {
        let address = request.address().clone();

        if let Err(e) = request.validate() {
            warn!("Rejected provisioning of {}: {}", address, e);
            return ProvisioningResult::failed(address, e, false, false);
        }

        let session = self.open_session(&address);
        let (op_id, cancel_rx) = match self.register(&session).await {
            Ok(op) => op,
            Err(e) => {
                warn!("Rejected provisioning of {}: {}", address, e);
                return ProvisioningResult::failed(address, e, false, false);
            }
        };

        info!("Provisioning {}", address);

        let (pipeline, progress) = Pipeline::new(session.clone());

        let outcome = guarded(
            pipeline.provision(&request),
            self.config.provision_timeout(),
            &progress,
            cancel_rx,
        )
        .await;

        self.finish(pipeline, session, op_id).await;

        let Progress { wifi_configured, server_configured, .. } =
            *progress.borrow();

        let result = match outcome {
            Ok(()) => {
                self.record_history(&request).await;
                ProvisioningResult::succeeded(
                    address,
                    wifi_configured,
                    server_configured,
                )
            }
            Err(e) => ProvisioningResult::failed(
                address,
                e,
                wifi_configured,
                server_configured,
            ),
        };

        match &result.error {
            None => info!("Provisioning of {} succeeded", result.address),
            Some(e) => {
                warn!("Provisioning of {} failed: {}", result.address, e)
            }
        }

        result
    }

    /// Reads firmware version and network status of a device.
    pub async fn query_status(
        &self, handle: &DeviceHandle,
    ) -> Result<DeviceStatusReport, ProvisionError> {
        let address = handle.address().clone();
        let session = self.open_session(&address);
        let (op_id, cancel_rx) = self.register(&session).await?;

        let (pipeline, progress) = Pipeline::new(session.clone());

        let outcome = guarded(
            pipeline.query_status(),
            self.config.status_timeout(),
            &progress,
            cancel_rx,
        )
        .await;

        self.finish(pipeline, session, op_id).await;

        let (version, status) = outcome.map_err(|e| {
            warn!("Status query of {} failed: {}", address, e);
            e
        })?;

        let report = DeviceStatusReport {
            address,
            version,
            status,
            queried_at: SystemTime::now(),
        };
        info!("Device status: {:#?}", report);

        Ok(report)
    }

    /// Cancels the operation running on `address` and waits until its
    /// device session is torn down. Returns false if there was none.
    pub async fn cancel(&self, address: &str) -> bool {
        let (id, (cancel_tx, stopped)) = {
            let mut active = self.active.lock().await;
            match active.get_mut(address) {
                Some(op) => match op.cancel.take() {
                    Some(cancel) => (op.id, cancel),
                    None => return false,
                },
                None => return false,
            }
        };

        info!("Cancelling operation on {}", address);
        let _ = cancel_tx.send(());
        stopped.await;
        release(&self.active, address, id).await;
        true
    }

    fn open_session(&self, address: &DeviceAddress) -> DeviceSession {
        DeviceSession::spawn(
            address.clone(),
            self.transport.clone(),
            self.config.session_settings(),
        )
    }

    /// Claims the session address for one operation. The claim is released
    /// once the session task ends, also when the operation future is dropped
    /// before it resolves.
    async fn register(
        &self, session: &DeviceSession,
    ) -> Result<(u64, oneshot::Receiver<()>), ProvisionError> {
        let address = session.address().clone();
        let id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        {
            let mut active = self.active.lock().await;
            if active.contains_key(&address) {
                return Err(ProvisionError::InvalidRequest(format!(
                    "An operation is already running on {}",
                    address
                )));
            }

            let cancel = Some((cancel_tx, session.stopped()));
            active.insert(address.clone(), ActiveOp { id, cancel });
        }

        let active = self.active.clone();
        let stopped = session.stopped();
        tokio::spawn(async move {
            stopped.await;
            release(&active, &address, id).await;
        });

        Ok((id, cancel_rx))
    }

    /// Tears the session down and frees its address before returning, so
    /// the next operation on it starts on a clean link.
    async fn finish(&self, pipeline: Pipeline, session: DeviceSession, id: u64) {
        let stopped = session.stopped();
        session.disconnect().await;

        let address = session.address().clone();
        drop(pipeline);
        drop(session);

        stopped.await;
        release(&self.active, &address, id).await;
    }

    async fn record_history(&self, request: &ProvisioningRequest) {
        let Some(sink) = &self.history else { return };

        if let Err(e) = sink.record(DeviceHistory::from_request(request)).await {
            warn!("Error recording history of {}: {}", request.address(), e);
        }
    }
}

async fn release(
    active: &Mutex<HashMap<DeviceAddress, ActiveOp>>, address: &str, id: u64,
) {
    let mut active = active.lock().await;
    if active.get(address).is_some_and(|op| op.id == id) {
        active.remove(address);
    }
}

/// Bounds `operation` by `limit` and ends it early on cancellation. A
/// timeout is reported as the failure of the stage that was running.
async fn guarded<T>(
    operation: impl Future<Output = Result<T, ProvisionError>>,
    limit: Duration, progress: &watch::Receiver<Progress>,
    cancel_rx: oneshot::Receiver<()>,
) -> Result<T, ProvisionError> {
    tokio::select! {
        outcome = timeout(limit, operation) => match outcome {
            Ok(result) => result,
            Err(_) => {
                let stage = progress.borrow().stage;
                warn!("Operation timed out after {:?} in {:?}", limit, stage);
                Err(stage.error(format!("timed out after {:?}", limit)))
            }
        },

        _ = cancel_rx => Err(ProvisionError::Cancelled),
    }
}
