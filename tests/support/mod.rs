//! Scripted radio for driving sessions and scanners without hardware.

#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thingy_ble::common::{characteristics, services};
use thingy_ble::{
    Advertisement, AdvertisementStream, CharPropFlags, DiscoveredCharacteristic, GattCompletion,
    GattRequest, Generation, PeripheralIdentity, Radio, RadioEvent, RadioEventStream, Result,
    SessionEvent, SessionEvents,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const WAIT: Duration = Duration::from_secs(1);
pub const QUIET: Duration = Duration::from_millis(50);

#[derive(Default)]
struct State {
    radio_events: Option<mpsc::UnboundedSender<RadioEvent>>,
    advertisements: Option<mpsc::UnboundedSender<Advertisement>>,
    start_scan_calls: usize,
    stop_scan_calls: usize,
}

pub struct FakeRadio {
    state: Mutex<State>,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Generation, GattRequest)>>,
    request_sender: mpsc::UnboundedSender<(Generation, GattRequest)>,
}

impl FakeRadio {
    pub fn new() -> Self {
        let (request_sender, requests) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            requests: tokio::sync::Mutex::new(requests),
            request_sender,
        }
    }

    /// Next request submitted by the session.
    pub async fn request(&self) -> (Generation, GattRequest) {
        let mut requests = self.requests.lock().await;
        timeout(WAIT, requests.recv())
            .await
            .expect("no request submitted")
            .expect("radio dropped")
    }

    pub async fn expect(&self, expected: GattRequest) -> Generation {
        let (generation, request) = self.request().await;
        assert_eq!(request, expected);
        generation
    }

    pub fn assert_no_request(&self) {
        let mut requests = self.requests.try_lock().expect("requests are being awaited");
        if let Ok(request) = requests.try_recv() {
            panic!("unexpected request {:?}", request);
        }
    }

    pub fn complete(&self, generation: Generation, completion: GattCompletion) {
        self.emit(RadioEvent::completed(generation, completion));
    }

    pub fn emit(&self, event: RadioEvent) {
        let state = self.state.lock().unwrap();
        let sender = state.radio_events.as_ref().expect("session is not listening");
        sender.send(event).unwrap();
    }

    pub fn advertise(&self, advertisement: Advertisement) {
        let state = self.state.lock().unwrap();
        let sender = state.advertisements.as_ref().expect("no scan is running");
        sender.send(advertisement).unwrap();
    }

    pub fn start_scan_calls(&self) -> usize {
        self.state.lock().unwrap().start_scan_calls
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.state.lock().unwrap().stop_scan_calls
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn start_scan(&self, _service: uuid::Uuid) -> Result<AdvertisementStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.advertisements = Some(sender);
        state.start_scan_calls += 1;
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.advertisements = None;
        state.stop_scan_calls += 1;
        Ok(())
    }

    async fn events(&self, _peripheral: &PeripheralIdentity) -> Result<RadioEventStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state.lock().unwrap().radio_events = Some(sender);
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }

    fn submit(&self, _peripheral: &PeripheralIdentity, generation: Generation, request: GattRequest) {
        self.request_sender.send((generation, request)).unwrap();
    }
}

pub fn led(properties: CharPropFlags) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic::new(characteristics::LED, properties)
}

pub fn button(properties: CharPropFlags) -> DiscoveredCharacteristic {
    DiscoveredCharacteristic::new(characteristics::BUTTON, properties)
}

pub fn discover_services_request() -> GattRequest {
    GattRequest::DiscoverServices {
        service: services::USER_INTERFACE,
    }
}

pub fn discover_characteristics_request() -> GattRequest {
    GattRequest::DiscoverCharacteristics {
        service: services::USER_INTERFACE,
        characteristics: vec![characteristics::LED, characteristics::BUTTON],
    }
}

pub fn read_request(characteristic: uuid::Uuid) -> GattRequest {
    GattRequest::Read { characteristic }
}

/// Drives a session from `connect` up to characteristic discovery and returns
/// the generation of the connection.
pub async fn connect_with(
    radio: &FakeRadio,
    found: Vec<DiscoveredCharacteristic>,
) -> Generation {
    let generation = radio.expect(GattRequest::Connect).await;
    radio.complete(generation, GattCompletion::Connected);

    radio.expect(discover_services_request()).await;
    radio.complete(
        generation,
        GattCompletion::ServicesDiscovered(vec![services::USER_INTERFACE]),
    );

    radio.expect(discover_characteristics_request()).await;
    radio.complete(
        generation,
        GattCompletion::CharacteristicsDiscovered {
            service: services::USER_INTERFACE,
            characteristics: found,
        },
    );
    generation
}

pub async fn next_event(events: &mut SessionEvents) -> SessionEvent {
    timeout(WAIT, events.next())
        .await
        .expect("no session event")
        .expect("session event stream ended")
}

pub async fn assert_no_event(events: &mut SessionEvents) {
    if let Ok(Some(event)) = timeout(QUIET, events.next()).await {
        panic!("unexpected event {:?}", event);
    }
}
