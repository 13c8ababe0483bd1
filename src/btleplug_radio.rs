use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::radio::{
    AdvertisementStream, GattCompletion, GattOperation, GattRequest, Generation, Radio,
    RadioEvent, RadioEventStream,
};
use crate::{Advertisement, DiscoveredCharacteristic, Error, PeripheralIdentity, Result};

const COMPLETION_CHANNEL_CAPACITY: usize = 256;

type Known = Arc<Mutex<HashMap<PeripheralIdentity, Peripheral>>>;
type Completions = broadcast::Sender<(PeripheralIdentity, RadioEvent)>;

/// [`Radio`] backed by the host bluetooth stack through `btleplug`.
///
/// Requests for one peripheral are executed in order by a dedicated task.
pub struct BtleplugRadio {
    _manager: Manager,
    adapter: Adapter,
    /// Peripherals seen while scanning, by identity
    known: Known,
    /// Request queues of the per-peripheral workers
    workers: Mutex<HashMap<PeripheralIdentity, mpsc::UnboundedSender<(Generation, GattRequest)>>>,
    completions: Completions,
}

impl BtleplugRadio {
    /// Uses the first bluetooth adapter.
    pub async fn new() -> Result<Self> {
        Self::with_adapter_index(0).await
    }

    pub async fn with_adapter_index(index: usize) -> Result<Self> {
        let manager = Manager::new().await?;
        let mut adapters = manager.adapters().await?;

        if index >= adapters.len() {
            return Err(Error::AdapterNotFound { index });
        }

        let adapter = adapters.swap_remove(index);

        log::trace!("Using adapter: {:?}", adapter);

        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);

        Ok(Self {
            _manager: manager,
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(HashMap::new()),
            completions,
        })
    }

    fn spawn_worker(
        &self,
        identity: &PeripheralIdentity,
    ) -> mpsc::UnboundedSender<(Generation, GattRequest)> {
        let (sender, requests) = mpsc::unbounded_channel();
        let worker = Worker {
            identity: identity.clone(),
            adapter: self.adapter.clone(),
            known: self.known.clone(),
            completions: self.completions.clone(),
            forwarders: HashMap::new(),
        };
        tokio::spawn(worker.run(requests));
        sender
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn start_scan(&self, service: Uuid) -> Result<AdvertisementStream> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await?;

        let adapter = self.adapter.clone();
        let known = self.known.clone();

        Ok(Box::pin(events.filter_map(move |event| {
            let adapter = adapter.clone();
            let known = known.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok().flatten()?;
                let rssi = properties.rssi?;

                let identity = PeripheralIdentity::new(id.to_string());
                known.lock().unwrap().insert(identity.clone(), peripheral);

                Some(Advertisement::new(identity, properties.local_name, rssi))
            }
        })))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn events(&self, peripheral: &PeripheralIdentity) -> Result<RadioEventStream> {
        let target = peripheral.clone();
        let adapter_events = self.adapter.events().await?.filter_map(move |event| {
            let target = target.clone();
            async move {
                match event {
                    CentralEvent::DeviceDisconnected(id) if id.to_string() == target.as_str() => {
                        Some(RadioEvent::Disconnected)
                    }
                    CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                        Some(RadioEvent::PoweredOff)
                    }
                    _ => None,
                }
            }
        });

        let target = peripheral.clone();
        let completions = BroadcastStream::new(self.completions.subscribe()).filter_map(
            move |item| {
                let target = target.clone();
                async move {
                    match item {
                        Ok((identity, event)) if identity == target => Some(event),
                        Ok(_) => None,
                        Err(e) => {
                            log::warn!("Completions for {} were lost: {}", target, e);
                            None
                        }
                    }
                }
            },
        );

        Ok(Box::pin(futures::stream::select(adapter_events, completions)))
    }

    fn submit(&self, peripheral: &PeripheralIdentity, generation: Generation, request: GattRequest) {
        let mut workers = self.workers.lock().unwrap();

        let sender = workers
            .entry(peripheral.clone())
            .or_insert_with(|| self.spawn_worker(peripheral));

        if let Err(mpsc::error::SendError(request)) = sender.send((generation, request)) {
            // The worker is gone; start a fresh one for this request.
            let sender = self.spawn_worker(peripheral);
            sender.send(request).ok();
            workers.insert(peripheral.clone(), sender);
        }
    }
}

struct Worker {
    identity: PeripheralIdentity,
    adapter: Adapter,
    known: Known,
    completions: Completions,
    /// Notification forwarders by characteristic
    forwarders: HashMap<Uuid, JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<(Generation, GattRequest)>) {
        while let Some((generation, request)) = requests.recv().await {
            log::trace!("{} {} request {:?}", self.identity, generation, request);

            let operation = request.operation();
            let event = match self.resolve().await {
                Ok(peripheral) => self.perform(&peripheral, generation, request).await,
                Err(e) => Err(e),
            };

            let event = match event {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => Self::failure(generation, operation, e),
            };
            self.completions.send((self.identity.clone(), event)).ok();
        }

        self.stop_forwarders();
    }

    async fn perform(
        &mut self,
        peripheral: &Peripheral,
        generation: Generation,
        request: GattRequest,
    ) -> Result<Option<RadioEvent>> {
        let completion = match request {
            GattRequest::Connect => {
                if !peripheral.is_connected().await? {
                    peripheral.connect().await?;
                }
                GattCompletion::Connected
            }
            GattRequest::Disconnect => {
                self.stop_forwarders();
                if let Err(e) = peripheral.disconnect().await {
                    log::warn!("Could not disconnect {}: {}", self.identity, e);
                }
                GattCompletion::Disconnected
            }
            GattRequest::DiscoverServices { service } => {
                peripheral.discover_services().await?;
                let services = peripheral
                    .services()
                    .into_iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| *uuid == service)
                    .collect();
                GattCompletion::ServicesDiscovered(services)
            }
            GattRequest::DiscoverCharacteristics {
                service,
                characteristics,
            } => {
                let found = peripheral
                    .characteristics()
                    .into_iter()
                    .filter(|c| c.service_uuid == service && characteristics.contains(&c.uuid))
                    .map(|c| DiscoveredCharacteristic::new(c.uuid, c.properties))
                    .collect();
                GattCompletion::CharacteristicsDiscovered {
                    service,
                    characteristics: found,
                }
            }
            GattRequest::Read { characteristic } => {
                let target = Self::characteristic(peripheral, characteristic)?;
                let value = peripheral.read(&target).await?;
                GattCompletion::ValueUpdated {
                    characteristic,
                    value,
                }
            }
            GattRequest::Write {
                characteristic,
                value,
                write_type,
            } => {
                let target = Self::characteristic(peripheral, characteristic)?;
                peripheral.write(&target, &value, write_type).await?;
                match write_type {
                    WriteType::WithResponse => GattCompletion::WriteConfirmed {
                        characteristic,
                        value,
                    },
                    WriteType::WithoutResponse => return Ok(None),
                }
            }
            GattRequest::SetNotify {
                characteristic,
                enable,
            } => {
                let target = Self::characteristic(peripheral, characteristic)?;
                if enable {
                    peripheral.subscribe(&target).await?;
                    self.forward_notifications(peripheral, generation, characteristic)
                        .await?;
                } else {
                    peripheral.unsubscribe(&target).await?;
                    if let Some(forwarder) = self.forwarders.remove(&characteristic) {
                        forwarder.abort();
                    }
                }
                GattCompletion::NotificationStateUpdated {
                    characteristic,
                    enabled: enable,
                }
            }
        };

        Ok(Some(RadioEvent::completed(generation, completion)))
    }

    async fn forward_notifications(
        &mut self,
        peripheral: &Peripheral,
        generation: Generation,
        characteristic: Uuid,
    ) -> Result<()> {
        let mut notifications = peripheral.notifications().await?;
        let completions = self.completions.clone();
        let identity = self.identity.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                let event = RadioEvent::completed(
                    generation,
                    GattCompletion::ValueUpdated {
                        characteristic,
                        value: notification.value,
                    },
                );
                completions.send((identity.clone(), event)).ok();
            }
        });

        if let Some(previous) = self.forwarders.insert(characteristic, forwarder) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_forwarders(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }

    async fn resolve(&self) -> Result<Peripheral> {
        let cached = self.known.lock().unwrap().get(&self.identity).cloned();
        if let Some(peripheral) = cached {
            return Ok(peripheral);
        }

        for peripheral in self.adapter.peripherals().await? {
            if peripheral.id().to_string() == self.identity.as_str() {
                self.known
                    .lock()
                    .unwrap()
                    .insert(self.identity.clone(), peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(Error::UnknownPeripheral(self.identity.clone()))
    }

    fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::Btleplug(btleplug::Error::NoSuchCharacteristic))
    }

    fn failure(generation: Generation, operation: GattOperation, error: Error) -> RadioEvent {
        match operation {
            GattOperation::Connect => {
                log::warn!("Connect failed: {}", error);
                RadioEvent::completed(generation, GattCompletion::ConnectFailed)
            }
            GattOperation::Disconnect => {
                RadioEvent::completed(generation, GattCompletion::Disconnected)
            }
            operation => RadioEvent::completed(
                generation,
                GattCompletion::Failed {
                    operation,
                    reason: error.to_string(),
                },
            ),
        }
    }
}
