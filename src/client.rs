use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DEFAULT_HTTP_PORT, DEFAULT_MAX_PAGES, DEFAULT_TCP_PORT, DEFAULT_USERNAME, GatewayConfig};
use crate::frame::DecodedFrame;
use crate::http::HttpTransport;
use crate::listener::{ListenerConfig, ListenerHandle, StatusListener};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{
    ControlCommand, ac_list_query, brand_query, build_control_query, device_info_query,
    parse_brand_info, parse_device_info, parse_units,
};
use crate::state::DeviceTable;
use crate::types::*;
use crate::{Error, Result};

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CHANGE_CAPACITY: usize = 256;
const FRAME_QUEUE_DEPTH: usize = 64;

type ChangeCallback = Box<dyn Fn(&DeviceChange) + Send + Sync>;

/// When to stop walking the AC list.
#[derive(Debug, Clone, Copy)]
struct Paging {
    max_pages: u32,
    page_size: Option<u32>,
}

pub struct GatewayClientBuilder {
    host: String,
    tcp_port: u16,
    http_port: u16,
    username: String,
    password: String,
    http_timeout: Duration,
    listener: ListenerConfig,
    paging: Paging,
    change_capacity: usize,
    change_callbacks: Vec<ChangeCallback>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl GatewayClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            tcp_port: DEFAULT_TCP_PORT,
            http_port: DEFAULT_HTTP_PORT,
            username: DEFAULT_USERNAME.to_string(),
            password: String::new(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            listener: ListenerConfig::default(),
            paging: Paging {
                max_pages: DEFAULT_MAX_PAGES,
                page_size: None,
            },
            change_capacity: DEFAULT_CHANGE_CAPACITY,
            change_callbacks: Vec::new(),
            log_mode: None,
            log_path: None,
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut builder = Self::new(config.host.clone())
            .tcp_port(config.tcp_port)
            .http_port(config.http_port)
            .credentials(config.username.clone(), config.password.clone())
            .http_timeout(config.http_timeout())
            .connect_timeout(config.connect_timeout())
            .reconnect_backoff(config.reconnect_backoff())
            .inactivity_timeout(config.inactivity_timeout())
            .max_pages(config.max_pages);
        if let Some(size) = config.page_size {
            builder = builder.page_size(size);
        }
        if let Some(path) = &config.message_log_path {
            builder = builder.message_log(config.message_log_mode, path.clone());
        }
        builder
    }

    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    pub fn http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Deadline for one whole HTTP request, connect included.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.listener.connect_timeout = timeout;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.listener.reconnect_backoff = backoff;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.listener.inactivity_timeout = timeout;
        self
    }

    pub fn max_pages(mut self, pages: u32) -> Self {
        self.paging.max_pages = pages.max(1);
        self
    }

    /// Treat a page with fewer than `size` units as the last one.
    pub fn page_size(mut self, size: u32) -> Self {
        self.paging.page_size = Some(size);
        self
    }

    /// How far a subscriber may fall behind before losing changes.
    pub fn change_capacity(mut self, capacity: usize) -> Self {
        self.change_capacity = capacity;
        self
    }

    /// Called for every applied update, from a dedicated task.
    pub fn on_change(mut self, f: impl Fn(&DeviceChange) + Send + Sync + 'static) -> Self {
        self.change_callbacks.push(Box::new(f));
        self
    }

    /// Called once per field-level event of every applied update.
    pub fn on_event(self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.on_change(move |change| {
            for event in change.events() {
                f(&event);
            }
        })
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    /// Fails only if the message log file cannot be opened.
    pub fn build(self) -> Result<GatewayClient> {
        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Arc::new(Mutex::new(MessageLogger::new(mode, &path)?))),
            _ => None,
        };

        let http = HttpTransport::new(
            self.host.clone(),
            self.http_port,
            &self.username,
            &self.password,
            self.http_timeout,
        )
        .with_logger(logger.clone());

        let table = Arc::new(DeviceTable::with_capacity(self.change_capacity));
        // subscribe now so callbacks also see updates applied before start()
        let pending_changes = (!self.change_callbacks.is_empty()).then(|| table.subscribe());

        Ok(GatewayClient {
            tcp_addr: format!("{}:{}", self.host, self.tcp_port),
            http,
            listener_config: self.listener,
            paging: self.paging,
            table,
            info: Mutex::new(None),
            brand: Mutex::new(None),
            callbacks: Arc::new(self.change_callbacks),
            pending_changes: Mutex::new(pending_changes),
            logger,
            running: Mutex::new(None),
        })
    }
}

/// Background tasks owned by a started client.
struct Running {
    listener: ListenerHandle,
    ingest: JoinHandle<()>,
    dispatch: Option<JoinHandle<broadcast::Receiver<DeviceChange>>>,
    cancel: CancellationToken,
}

/// Client for one Zhong Hong gateway: HTTP for discovery and control, the
/// TCP broadcast for live status.
pub struct GatewayClient {
    tcp_addr: String,
    http: HttpTransport,
    listener_config: ListenerConfig,
    paging: Paging,
    table: Arc<DeviceTable>,
    info: Mutex<Option<GatewayInfo>>,
    brand: Mutex<Option<BrandInfo>>,
    callbacks: Arc<Vec<ChangeCallback>>,
    /// Callback receiver while no dispatcher is running; changes queue here.
    pending_changes: Mutex<Option<broadcast::Receiver<DeviceChange>>>,
    logger: Option<Arc<Mutex<MessageLogger>>>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GatewayClient {
    pub fn builder(host: impl Into<String>) -> GatewayClientBuilder {
        GatewayClientBuilder::new(host)
    }

    /// Start listening for status broadcasts. Calling it again while running
    /// does nothing. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            debug!("client already started");
            return;
        }

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let listener = StatusListener::new(self.tcp_addr.clone(), self.listener_config.clone(), frames_tx)
            .with_logger(self.logger.clone())
            .spawn();
        let ingest = tokio::spawn(ingest_frames(frames_rx, self.table.clone()));

        let cancel = CancellationToken::new();
        let dispatch = lock(&self.pending_changes).take().map(|changes| {
            tokio::spawn(dispatch_changes(changes, self.callbacks.clone(), cancel.clone()))
        });

        info!(addr = %self.tcp_addr, "gateway client started");
        *running = Some(Running {
            listener,
            ingest,
            dispatch,
            cancel,
        });
    }

    /// Stop all background tasks and wait for them to finish.
    pub async fn stop(&self) {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        running.listener.stop().await;
        // the listener owned the only frame sender
        if let Err(e) = running.ingest.await {
            warn!("ingestion task failed: {e}");
        }
        if let Some(dispatch) = running.dispatch {
            match dispatch.await {
                // keep queueing for a later start()
                Ok(changes) => *lock(&self.pending_changes) = Some(changes),
                Err(e) => warn!("change dispatcher failed: {e}"),
            }
        }
        info!("gateway client stopped");
    }

    /// Query gateway info, brand and the full AC list. The results are
    /// published only when every request succeeds.
    pub async fn discover(&self) -> Result<Discovery> {
        let body = self.http.request(&device_info_query()).await?;
        let (model, firmware, hardware_id) = parse_device_info(&body)?;
        let brand = self.fetch_brand().await?;
        let units = self.fetch_units(Some(brand.max_devices)).await?;

        let info = GatewayInfo {
            model,
            firmware,
            hardware_id,
            brand,
        };
        info!(
            model = %info.model,
            firmware = %info.firmware,
            brand = %brand.name(),
            devices = units.len(),
            "gateway discovered"
        );
        *lock(&self.brand) = Some(brand);
        *lock(&self.info) = Some(info.clone());

        let devices = self
            .table
            .apply_http_snapshot(&units)
            .into_iter()
            .map(|change| (change.identity, change.current))
            .collect();
        Ok(Discovery { info, devices })
    }

    /// Brand, protocol and configured unit count. The count bounds later
    /// AC list scans.
    pub async fn get_brand(&self) -> Result<BrandInfo> {
        let brand = self.fetch_brand().await?;
        *lock(&self.brand) = Some(brand);
        Ok(brand)
    }

    async fn fetch_brand(&self) -> Result<BrandInfo> {
        let body = self.http.request(&brand_query()).await?;
        let brand = parse_brand_info(&body)?;
        debug!(brand = brand.brand, protocol = brand.protocol, max = brand.max_devices, "brand info");
        Ok(brand)
    }

    /// Info from the last successful [`discover`](Self::discover).
    pub fn gateway_info(&self) -> Option<GatewayInfo> {
        lock(&self.info).clone()
    }

    /// Re-read the AC list and apply it as one snapshot. Returns the number
    /// of units reported.
    pub async fn refresh_all(&self) -> Result<usize> {
        let limit = lock(&self.brand).map(|b| b.max_devices);
        let units = self.fetch_units(limit).await?;
        self.table.apply_http_snapshot(&units);
        debug!(devices = units.len(), "refreshed AC list");
        Ok(units.len())
    }

    async fn fetch_units(&self, limit: Option<u16>) -> Result<Vec<UnitSnapshot>> {
        let mut all = Vec::new();

        for page in 0..self.paging.max_pages {
            let body = self.http.request(&ac_list_query(page)).await?;
            let units = parse_units(&body)?;
            let count = units.len();
            trace!(page, count, "AC list page");
            all.extend(units);

            if count == 0 {
                break;
            }
            if let Some(limit) = limit
                && limit > 0
                && all.len() >= usize::from(limit)
            {
                break;
            }
            if let Some(size) = self.paging.page_size
                && (count as u32) < size
            {
                break;
            }
            if page + 1 == self.paging.max_pages {
                warn!(pages = self.paging.max_pages, "AC list page limit reached");
            }
        }

        Ok(all)
    }

    /// Send one control command. The device must have been seen in an AC
    /// list so its control index is known. The command is retried once on a
    /// transport failure and followed by a best-effort refresh.
    pub async fn send_command(&self, identity: DeviceIdentity, command: &ControlCommand) -> Result<()> {
        let index = self
            .table
            .control_index(identity)
            .ok_or(Error::UnknownDevice(identity))?;
        let query = build_control_query(index, command)?;

        info!(device = %identity, idx = index, "sending control command");
        if let Some(logger) = &self.logger {
            lock(logger).log_command(identity, &query);
        }

        match self.http.request(&query).await {
            Ok(_) => {}
            Err(e) if e.is_transport() => {
                warn!(device = %identity, "control request failed ({e}), retrying once");
                self.http.request(&query).await?;
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self.refresh_all().await {
            warn!(device = %identity, "refresh after command failed: {e}");
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChange> {
        self.table.subscribe()
    }

    pub fn device(&self, identity: DeviceIdentity) -> Result<DeviceStatus> {
        self.table.get(identity)
    }

    pub fn devices(&self) -> Vec<(DeviceIdentity, DeviceStatus)> {
        self.table.devices()
    }

    /// Devices not updated within `max_age`.
    pub fn stale_devices(&self, max_age: Duration) -> Vec<DeviceIdentity> {
        self.table.stale(max_age)
    }

    pub fn listener_state(&self) -> ListenerState {
        lock(&self.running)
            .as_ref()
            .map(|r| r.listener.state())
            .unwrap_or_default()
    }

    pub fn is_tcp_connected(&self) -> bool {
        self.listener_state() == ListenerState::Listening
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        // dropping the listener handle cancels the listener; ingestion ends
        // with it
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
        }
    }
}

async fn ingest_frames(mut frames: mpsc::Receiver<DecodedFrame>, table: Arc<DeviceTable>) {
    while let Some(frame) = frames.recv().await {
        table.apply_tcp_update(frame.identity, &frame.report);
    }
    trace!("frame ingestion finished");
}

async fn dispatch_changes(
    mut changes: broadcast::Receiver<DeviceChange>,
    callbacks: Arc<Vec<ChangeCallback>>,
    cancel: CancellationToken,
) -> broadcast::Receiver<DeviceChange> {
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };
        match change {
            Ok(change) => {
                for cb in callbacks.iter() {
                    cb(&change);
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "change callbacks fell behind, dropped oldest changes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_from_config() {
        let mut cfg = GatewayConfig::new("10.0.0.9");
        cfg.tcp_port = 19999;
        cfg.page_size = Some(10);
        cfg.reconnect_backoff_secs = 3;
        let client = GatewayClientBuilder::from_config(&cfg).build().unwrap();

        assert_eq!(client.tcp_addr, "10.0.0.9:19999");
        assert_eq!(client.http.addr(), "10.0.0.9:80");
        assert_eq!(client.paging.page_size, Some(10));
        assert_eq!(client.paging.max_pages, 20);
        assert_eq!(client.listener_config.reconnect_backoff, Duration::from_secs(3));
    }

    #[test]
    fn fresh_client_is_idle() {
        let client = GatewayClient::builder("127.0.0.1").build().unwrap();
        assert_eq!(client.listener_state(), ListenerState::Disconnected);
        assert!(!client.is_tcp_connected());
        assert!(client.devices().is_empty());
        assert!(client.gateway_info().is_none());
    }

    #[tokio::test]
    async fn command_for_unknown_device_fails_without_io() {
        // nothing listens on port 1; any I/O would surface as a transport error
        let client = GatewayClient::builder("127.0.0.1").http_port(1).build().unwrap();
        let err = client
            .send_command(DeviceIdentity::new(1, 2, 5), &ControlCommand::new().power(true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDevice(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let client = GatewayClient::builder("127.0.0.1")
            .tcp_port(1)
            .reconnect_backoff(Duration::from_millis(50))
            .on_change(|_| {})
            .build()
            .unwrap();
        client.start();
        client.start();
        client.stop().await;
        assert_eq!(client.listener_state(), ListenerState::Disconnected);
        client.stop().await;
    }
}
