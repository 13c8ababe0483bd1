use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::ready;
use futures::{Stream, StreamExt};
use stream_cancel::{Trigger, Valved};
use tokio::sync::broadcast;
use tokio::sync::broadcast::Sender;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::common::services;
use crate::radio::{AdvertisementStream, Radio};
use crate::{Advertisement, DeviceEvent, DeviceList, DeviceListChange, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct ScanConfig {
    /// Only peripherals advertising this service are reported.
    service: Uuid,
    /// Filters the found devices based on local name.
    name_filter: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
    /// Minimum time between two update events of the same device.
    refresh_interval: Duration,
    /// Maximum results before the scan is stopped.
    max_results: Option<usize>,
    /// The scan is stopped when timeout duration is reached.
    timeout: Option<Duration>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service: services::USER_INTERFACE,
            name_filter: None,
            refresh_interval: Duration::from_secs(1),
            max_results: None,
            timeout: None,
        }
    }
}

impl ScanConfig {
    /// Scan for peripherals advertising given service
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.service = uuid;
        self
    }

    /// Filter scanned devices based on the device name
    pub fn filter_by_name(mut self, func: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.name_filter = Some(Box::new(func));
        self
    }

    /// Report updates of a known device at most once per given interval
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Stop the scan after given number of matches
    pub fn stop_after_matches(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    /// Stop the scan after the first match
    pub fn stop_after_first_match(self) -> Self {
        self.stop_after_matches(1)
    }

    /// Stop the scan after given duration
    pub fn stop_after_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require that the scanned devices have a name
    pub fn require_name(self) -> Self {
        if self.name_filter.is_none() {
            self.filter_by_name(|name| !name.is_empty())
        } else {
            self
        }
    }

    fn accepts(&self, advertisement: &Advertisement) -> bool {
        match (&self.name_filter, &advertisement.name) {
            (None, _) => true,
            (Some(filter), Some(name)) => filter(name),
            (Some(_), None) => false,
        }
    }
}

/// Discovers peripherals and keeps one entry per device.
pub struct Scanner {
    radio: Arc<dyn Radio>,
    devices: Arc<RwLock<DeviceList>>,
    /// `None` marks the end of a scan that reached a stop condition.
    event_sender: Sender<Option<DeviceEvent>>,
    advertisement_sender: Sender<Option<Advertisement>>,
    active_scan: Option<ActiveScan>,
    device_stream_stoppers: Arc<RwLock<Vec<Trigger>>>,
}

struct ActiveScan {
    stopper: Trigger,
    /// Cleared by the listen task when a stop condition ends the scan.
    running: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (advertisement_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            radio,
            devices: Arc::new(RwLock::new(DeviceList::default())),
            event_sender,
            advertisement_sender,
            active_scan: None,
            device_stream_stoppers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.active_scan
            .as_ref()
            .map_or(false, |scan| scan.running.load(Ordering::SeqCst))
    }

    /// Start scanning for ble devices. Devices found by an earlier scan are forgotten.
    pub async fn start(&mut self, config: ScanConfig) -> Result<()> {
        if self.is_scanning() {
            log::info!("Scanner is already started.");
            return Ok(());
        }

        *self.devices.write().unwrap() = DeviceList::new(config.refresh_interval);

        log::info!("Starting the scan for service {}", config.service);
        let advertisements = self.radio.start_scan(config.service).await?;

        let ctx = ScanContext {
            result_count: 0,
            radio: self.radio.clone(),
            config,
            devices: self.devices.clone(),
            event_sender: self.event_sender.clone(),
            advertisement_sender: self.advertisement_sender.clone(),
        };
        let (stopper, advertisements) = Valved::new(advertisements);
        let running = Arc::new(AtomicBool::new(true));
        let listener_running = running.clone();

        tokio::spawn(async move {
            ctx.listen(advertisements, listener_running).await;
        });

        self.active_scan = Some(ActiveScan { stopper, running });

        Ok(())
    }

    /// Stop scanning for ble devices. Does nothing when no scan is running.
    pub async fn stop(&mut self) -> Result<()> {
        match self.active_scan.take() {
            Some(scan) if scan.running.swap(false, Ordering::SeqCst) => {
                drop(scan.stopper);
                self.device_stream_stoppers.write().unwrap().clear();
                self.radio.stop_scan().await?;
            }
            _ => log::info!("Scanner is already stopped"),
        }

        Ok(())
    }

    /// Snapshot of the devices found so far, in discovery order.
    pub fn devices(&self) -> Vec<Advertisement> {
        self.devices.read().unwrap().iter().cloned().collect()
    }

    /// Create a new stream that receives device list events.
    pub fn device_event_stream(
        &mut self,
    ) -> Valved<Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>> {
        let receiver = self.event_sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = DeviceEvent> + Send>> =
            Box::pin(until_scan_end(receiver).filter_map(ready));

        self.valved(stream)
    }

    /// Create a new stream that receives newly discovered devices.
    pub fn device_stream(&mut self) -> Valved<Pin<Box<dyn Stream<Item = Advertisement> + Send>>> {
        let receiver = self.event_sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = Advertisement> + Send>> =
            Box::pin(until_scan_end(receiver).filter_map(|x| async move {
                match x {
                    Some(DeviceEvent::Discovered(advertisement)) => Some(advertisement),
                    _ => None,
                }
            }));

        self.valved(stream)
    }

    /// Create a new stream that receives every advertisement, duplicates included.
    pub fn advertisement_stream(
        &mut self,
    ) -> Valved<Pin<Box<dyn Stream<Item = Advertisement> + Send>>> {
        let receiver = self.advertisement_sender.subscribe();

        let stream: Pin<Box<dyn Stream<Item = Advertisement> + Send>> =
            Box::pin(until_scan_end(receiver).filter_map(ready));

        self.valved(stream)
    }

    fn valved<T: Stream>(&mut self, stream: T) -> Valved<T> {
        let (trigger, stream) = Valved::new(stream);
        self.device_stream_stoppers.write().unwrap().push(trigger);
        stream
    }
}

/// Items of a scan channel up to the end-of-scan marker.
fn until_scan_end<T: Clone + Send + 'static>(
    receiver: broadcast::Receiver<Option<T>>,
) -> impl Stream<Item = Option<T>> + Send {
    BroadcastStream::new(receiver)
        .filter_map(|x| ready(x.ok()))
        .take_while(|x| ready(x.is_some()))
}

struct ScanContext {
    /// Number of distinct devices found so far
    result_count: usize,
    radio: Arc<dyn Radio>,
    /// Configurations for the scan, such as filters and stop conditions
    config: ScanConfig,
    /// Devices found during this scan, shared with the scanner
    devices: Arc<RwLock<DeviceList>>,
    /// Channel for device list events
    event_sender: Sender<Option<DeviceEvent>>,
    /// Channel for raw advertisements
    advertisement_sender: Sender<Option<Advertisement>>,
}

impl ScanContext {
    async fn listen(
        mut self,
        mut advertisements: Valved<AdvertisementStream>,
        running: Arc<AtomicBool>,
    ) {
        let start_time = Instant::now();

        while let Some(advertisement) = advertisements.next().await {
            self.on_advertisement(advertisement);

            let timeout_reached = self
                .config
                .timeout
                .filter(|timeout| Instant::now().duration_since(start_time).ge(timeout))
                .is_some();
            let max_result_reached = self
                .config
                .max_results
                .filter(|max_results| self.result_count >= *max_results)
                .is_some();

            if timeout_reached || max_result_reached {
                log::info!("Scanner stop condition reached.");
                if running.swap(false, Ordering::SeqCst) {
                    if let Err(e) = self.radio.stop_scan().await {
                        log::warn!("Could not stop the scan: {}", e);
                    }
                    // Streams end once they have delivered everything sent before this.
                    self.event_sender.send(None).ok();
                    self.advertisement_sender.send(None).ok();
                }
                break;
            }
        }

        log::info!("Scanner was stopped.");
    }

    fn on_advertisement(&mut self, advertisement: Advertisement) {
        log::trace!("Advertisement: {:?}", advertisement);

        if !self.config.accepts(&advertisement) {
            return;
        }

        self.advertisement_sender
            .send(Some(advertisement.clone()))
            .ok();

        let change = self.devices.write().unwrap().apply(advertisement);
        let event = match change {
            Some(DeviceListChange::Inserted(index)) => {
                self.result_count += 1;
                self.device_at(index).map(DeviceEvent::Discovered)
            }
            Some(DeviceListChange::Updated(index)) => self.device_at(index).map(DeviceEvent::Updated),
            None => None,
        };

        if let Some(event) = event {
            if let DeviceEvent::Discovered(device) = &event {
                log::info!("Found device: {} ({})", device.display_name(), device.identity);
            }
            self.event_sender.send(Some(event)).ok();
        }
    }

    fn device_at(&self, index: usize) -> Option<Advertisement> {
        self.devices.read().unwrap().get(index).cloned()
    }
}
