use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::WriteType;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::characteristic::{decode_flag, encode_flag, CharacteristicHandle};
use crate::common::{characteristics, services};
use crate::observer::{CapabilitySet, SessionEvent, SessionEvents};
use crate::radio::{GattCompletion, GattOperation, GattRequest, Generation, Radio, RadioEvent};
use crate::{Advertisement, Error, PeripheralIdentity, Result};

pub struct SessionConfig {
    /// Service holding the LED and button characteristics.
    service: Uuid,
    led_characteristic: Uuid,
    button_characteristic: Uuid,
    /// Longest time spent between connecting and becoming ready.
    discovery_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: services::USER_INTERFACE,
            led_characteristic: characteristics::LED,
            button_characteristic: characteristics::BUTTON,
            discovery_timeout: Some(Duration::from_secs(10)),
        }
    }
}

impl SessionConfig {
    /// Service to discover after connecting
    pub fn service(mut self, uuid: Uuid) -> Self {
        self.service = uuid;
        self
    }

    /// UUID of the LED characteristic
    pub fn led_characteristic(mut self, uuid: Uuid) -> Self {
        self.led_characteristic = uuid;
        self
    }

    /// UUID of the button characteristic
    pub fn button_characteristic(mut self, uuid: Uuid) -> Self {
        self.button_characteristic = uuid;
        self
    }

    /// Give up and disconnect if discovery has not finished after given duration
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    /// Wait for discovery without a time limit
    pub fn no_discovery_timeout(mut self) -> Self {
        self.discovery_timeout = None;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    SubscribingNotifications,
    Ready,
    Disconnecting,
}

impl ConnectionState {
    fn is_discovering(self) -> bool {
        matches!(
            self,
            ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
                | ConnectionState::SubscribingNotifications
        )
    }

    /// States in which characteristic handles may be used.
    fn is_linked(self) -> bool {
        self.is_discovering() || self == ConnectionState::Ready
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    ReadLed,
    ReadButton,
    WriteLed(bool),
}

/// Connection to one Thingy peripheral.
///
/// Commands are queued to a private task that owns all connection state and
/// return immediately; results arrive on the [`SessionEvents`] stream returned
/// by [`Session::new`]. Dropping the session disconnects the peripheral.
pub struct Session {
    identity: PeripheralIdentity,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Session {
    /// Creates a session for `identity` and spawns its task on the current
    /// tokio runtime.
    pub fn new(
        radio: Arc<dyn Radio>,
        identity: PeripheralIdentity,
        config: SessionConfig,
    ) -> (Self, SessionEvents) {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (state_sender, state) = watch::channel(ConnectionState::Idle);

        let actor = SessionActor {
            identity: identity.clone(),
            radio,
            config,
            state: ConnectionState::Idle,
            generation: Generation::default(),
            led: None,
            button: None,
            deadline: None,
            events: event_sender,
            state_sender,
        };
        tokio::spawn(actor.run(command_receiver));

        let session = Session {
            identity,
            commands,
            state,
        };
        (session, SessionEvents::new(event_receiver))
    }

    /// Creates a session for the peripheral behind a scanned advertisement.
    pub fn for_advertisement(
        radio: Arc<dyn Radio>,
        advertisement: &Advertisement,
        config: SessionConfig,
    ) -> (Self, SessionEvents) {
        Self::new(radio, advertisement.identity.clone(), config)
    }

    #[inline]
    pub fn identity(&self) -> &PeripheralIdentity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Connect to the peripheral. Ignored unless the session is idle.
    pub fn connect(&self) -> Result<()> {
        self.send(Command::Connect)
    }

    /// Tear down the connection, whatever its state.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect)
    }

    /// Read the LED state. Reported through [`SessionEvent::LedChanged`].
    pub fn read_led(&self) -> Result<()> {
        self.send(Command::ReadLed)
    }

    /// Read the button state. Reported through [`SessionEvent::ButtonChanged`].
    pub fn read_button(&self) -> Result<()> {
        self.send(Command::ReadButton)
    }

    pub fn write_led(&self, on: bool) -> Result<()> {
        self.send(Command::WriteLed(on))
    }

    pub fn turn_on_led(&self) -> Result<()> {
        self.write_led(true)
    }

    pub fn turn_off_led(&self) -> Result<()> {
        self.write_led(false)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for Session {}

impl PartialEq<PeripheralIdentity> for Session {
    fn eq(&self, other: &PeripheralIdentity) -> bool {
        &self.identity == other
    }
}

impl PartialEq<Advertisement> for Session {
    fn eq(&self, other: &Advertisement) -> bool {
        self.identity == other.identity
    }
}

struct SessionActor {
    identity: PeripheralIdentity,
    radio: Arc<dyn Radio>,
    config: SessionConfig,
    state: ConnectionState,
    /// Requests and handles of the current connection attempt carry this tag.
    generation: Generation,
    led: Option<CharacteristicHandle>,
    button: Option<CharacteristicHandle>,
    /// End of the discovery phase, when a timeout is configured.
    deadline: Option<Instant>,
    events: mpsc::UnboundedSender<SessionEvent>,
    state_sender: watch::Sender<ConnectionState>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut radio_events = match self.radio.events(&self.identity).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Could not listen to radio events for {}: {}", self.identity, e);
                return;
            }
        };

        loop {
            let deadline = self.deadline;
            let timeout = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                event = radio_events.next() => match event {
                    Some(event) => self.on_radio_event(event),
                    None => {
                        log::warn!("Radio event stream for {} ended", self.identity);
                        self.tear_down();
                        break;
                    }
                },
                _ = timeout => self.on_discovery_timeout(),
            }
        }

        if self.state != ConnectionState::Idle {
            self.radio
                .submit(&self.identity, self.generation, GattRequest::Disconnect);
        }
        log::debug!("Session for {} stopped", self.identity);
    }

    fn on_command(&mut self, command: Command) {
        log::trace!("{} command {:?} in state {:?}", self.identity, command, self.state);

        match command {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect(),
            Command::ReadLed => self.read_led(),
            Command::ReadButton => self.read_button(),
            Command::WriteLed(on) => self.write_led(on),
        }
    }

    fn connect(&mut self) {
        if self.state != ConnectionState::Idle {
            log::debug!("{} is not idle ({:?}), ignoring connect", self.identity, self.state);
            return;
        }

        self.generation = self.generation.next();
        log::info!("Connecting to {} ({})", self.identity, self.generation);
        self.set_state(ConnectionState::Connecting);
        self.submit(GattRequest::Connect);
    }

    fn disconnect(&mut self) {
        log::info!("Cancelling connection to {}", self.identity);

        if self.state != ConnectionState::Idle {
            // Replies to anything still in flight are now stale.
            self.generation = self.generation.next();
            self.deadline = None;
            self.set_state(ConnectionState::Disconnecting);
        }
        self.submit(GattRequest::Disconnect);
    }

    fn read_led(&mut self) {
        if let Some(led) = self.linked(self.led) {
            if led.is_readable() {
                log::debug!("Reading LED characteristic of {}", self.identity);
                self.submit(led.read());
            } else {
                log::warn!("Can't read LED state of {}", self.identity);
                self.emit(SessionEvent::LedChanged { on: false });
            }
        }
    }

    fn read_button(&mut self) {
        if let Some(button) = self.linked(self.button) {
            if button.is_readable() {
                log::debug!("Reading button characteristic of {}", self.identity);
                self.submit(button.read());
            } else {
                log::warn!("Can't read button state of {}", self.identity);
                self.emit(SessionEvent::ButtonChanged { pressed: false });
            }
        }
    }

    fn write_led(&mut self, on: bool) {
        let led = match self.linked(self.led) {
            Some(led) => led,
            None => return,
        };
        let value = encode_flag(on);

        match led.write_type() {
            Some(WriteType::WithResponse) => {
                log::debug!("Writing LED value {:?} with response", value);
                self.submit(led.write(&value, WriteType::WithResponse));
            }
            Some(WriteType::WithoutResponse) => {
                log::debug!("Writing LED value {:?} without response", value);
                self.submit(led.write(&value, WriteType::WithoutResponse));
                // No confirmation is ever delivered for this write mode.
                self.emit(SessionEvent::LedChanged { on });
            }
            None => log::warn!("LED characteristic of {} is not writable", self.identity),
        }
    }

    fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Completed {
                generation,
                completion,
            } => {
                if generation != self.generation || self.state == ConnectionState::Idle {
                    log::trace!(
                        "Dropping stale completion {:?} ({}, current {})",
                        completion,
                        generation,
                        self.generation
                    );
                    return;
                }
                self.on_completion(completion);
            }
            // A failed attempt is reported as `ConnectFailed` instead.
            RadioEvent::Disconnected if self.state == ConnectionState::Connecting => {
                log::debug!("Ignoring link loss of {} while connecting", self.identity);
            }
            RadioEvent::Disconnected => {
                log::info!("{} disconnected", self.identity);
                self.tear_down();
            }
            RadioEvent::PoweredOff => {
                log::warn!("Radio powered off while attached to {}", self.identity);
                self.tear_down();
            }
        }
    }

    fn on_completion(&mut self, completion: GattCompletion) {
        match completion {
            GattCompletion::Connected => self.on_connected(),
            GattCompletion::ConnectFailed => {
                log::warn!("Could not connect to {}", self.identity);
                self.tear_down();
            }
            GattCompletion::Disconnected => {
                log::info!("{} disconnected", self.identity);
                self.tear_down();
            }
            GattCompletion::ServicesDiscovered(found) => self.on_services_discovered(&found),
            GattCompletion::CharacteristicsDiscovered {
                service,
                characteristics,
            } => {
                if self.state != ConnectionState::DiscoveringCharacteristics
                    || service != self.config.service
                {
                    return;
                }
                for characteristic in characteristics {
                    let handle = CharacteristicHandle::new(characteristic, self.generation);
                    if characteristic.uuid == self.config.led_characteristic {
                        log::debug!("LED characteristic found");
                        self.led = self.led.or(Some(handle));
                    } else if characteristic.uuid == self.config.button_characteristic {
                        log::debug!("Button characteristic found");
                        self.button = self.button.or(Some(handle));
                    }
                }
                self.on_characteristics_discovered();
            }
            GattCompletion::NotificationStateUpdated {
                characteristic,
                enabled,
            } => {
                let is_button = self.button.map(|b| b.uuid()) == Some(characteristic);
                if is_button && self.state == ConnectionState::SubscribingNotifications {
                    log::debug!("Button notifications enabled: {}", enabled);
                    self.become_ready();
                    self.read_button();
                    self.read_led();
                }
            }
            GattCompletion::ValueUpdated {
                characteristic,
                value,
            } => self.on_value(characteristic, &value),
            GattCompletion::WriteConfirmed {
                characteristic,
                value,
            } => {
                if self.matches(self.led, characteristic) {
                    log::debug!("LED value written: {:?}", value);
                    self.emit(SessionEvent::LedChanged {
                        on: decode_flag(&value),
                    });
                }
            }
            GattCompletion::Failed { operation, reason } => self.on_failure(operation, &reason),
        }
    }

    fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        log::info!("Connected to {}", self.identity);

        self.set_state(ConnectionState::DiscoveringServices);
        self.deadline = self
            .config
            .discovery_timeout
            .map(|timeout| Instant::now() + timeout);
        self.submit(GattRequest::DiscoverServices {
            service: self.config.service,
        });
    }

    fn on_services_discovered(&mut self, found: &[Uuid]) {
        if self.state != ConnectionState::DiscoveringServices {
            return;
        }
        if !found.contains(&self.config.service) {
            log::warn!(
                "Service {} not found on {} (got {:?})",
                self.config.service,
                self.identity,
                found
            );
            return;
        }

        log::debug!("Service found, discovering LED and button characteristics");
        self.set_state(ConnectionState::DiscoveringCharacteristics);
        self.submit(GattRequest::DiscoverCharacteristics {
            service: self.config.service,
            characteristics: vec![
                self.config.led_characteristic,
                self.config.button_characteristic,
            ],
        });
    }

    fn on_characteristics_discovered(&mut self) {
        match self.button {
            Some(button) if button.is_notifiable() => {
                log::debug!("Enabling button notifications");
                self.set_state(ConnectionState::SubscribingNotifications);
                self.submit(button.subscribe());
            }
            Some(_) => {
                // Nothing to subscribe to; the state can still be read.
                self.become_ready();
                self.read_button();
                self.read_led();
            }
            None => {
                self.become_ready();
                self.read_led();
            }
        }
    }

    fn on_value(&mut self, characteristic: Uuid, value: &[u8]) {
        if self.matches(self.led, characteristic) {
            self.emit(SessionEvent::LedChanged {
                on: decode_flag(value),
            });
        } else if self.matches(self.button, characteristic) {
            log::debug!("Button value changed to {:?}", value);
            self.emit(SessionEvent::ButtonChanged {
                pressed: decode_flag(value),
            });
        } else {
            log::trace!("Ignoring value of unknown characteristic {}", characteristic);
        }
    }

    fn on_failure(&mut self, operation: GattOperation, reason: &str) {
        if operation == GattOperation::SetNotify
            && self.state == ConnectionState::SubscribingNotifications
        {
            // The button can still be read; carry on without notifications.
            log::warn!(
                "Could not enable button notifications on {}: {}",
                self.identity,
                reason
            );
            self.become_ready();
            self.read_button();
            self.read_led();
        } else if self.state.is_discovering() {
            log::warn!(
                "{:?} failed on {} during discovery: {}",
                operation,
                self.identity,
                reason
            );
            self.abort();
        } else {
            log::warn!("{:?} failed on {}: {}", operation, self.identity, reason);
        }
    }

    fn on_discovery_timeout(&mut self) {
        log::warn!(
            "Discovery on {} did not finish in time ({:?})",
            self.identity,
            self.state
        );
        self.abort();
    }

    /// Gives up on the current connection and tells the radio to drop the link.
    fn abort(&mut self) {
        self.tear_down();
        self.submit(GattRequest::Disconnect);
    }

    fn become_ready(&mut self) {
        self.deadline = None;
        self.set_state(ConnectionState::Ready);

        let capabilities = CapabilitySet {
            led_supported: self.led.is_some(),
            button_supported: self.button.is_some(),
        };
        log::info!("{} ready: {:?}", self.identity, capabilities);
        self.emit(SessionEvent::Connected(capabilities));
    }

    /// Single exit path back to idle. Safe to call repeatedly.
    fn tear_down(&mut self) {
        if self.state == ConnectionState::Idle {
            return;
        }

        self.led = None;
        self.button = None;
        self.deadline = None;
        self.generation = self.generation.next();
        self.set_state(ConnectionState::Idle);
        self.emit(SessionEvent::Disconnected);
    }

    /// Returns the handle only while it belongs to a live connection.
    fn linked(&self, handle: Option<CharacteristicHandle>) -> Option<CharacteristicHandle> {
        handle.filter(|h| self.state.is_linked() && h.generation() == self.generation)
    }

    fn matches(&self, handle: Option<CharacteristicHandle>, characteristic: Uuid) -> bool {
        self.linked(handle)
            .map_or(false, |h| h.uuid() == characteristic)
    }

    fn submit(&self, request: GattRequest) {
        self.radio.submit(&self.identity, self.generation, request);
    }

    fn set_state(&mut self, state: ConnectionState) {
        log::trace!("{}: {:?} -> {:?}", self.identity, self.state, state);
        self.state = state;
        self.state_sender.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            log::trace!("No one is listening to {} events", self.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_discovery_and_ready_states_are_linked() {
        use ConnectionState::*;

        for state in [
            DiscoveringServices,
            DiscoveringCharacteristics,
            SubscribingNotifications,
            Ready,
        ] {
            assert!(state.is_linked(), "{:?}", state);
        }
        for state in [Idle, Connecting, Disconnecting] {
            assert!(!state.is_linked(), "{:?}", state);
        }
        assert!(!Ready.is_discovering());
    }

    #[test]
    fn default_config_targets_the_thingy() {
        let config = SessionConfig::default();
        assert_eq!(config.service, services::USER_INTERFACE);
        assert_eq!(config.led_characteristic, characteristics::LED);
        assert_eq!(config.button_characteristic, characteristics::BUTTON);
        assert_eq!(config.discovery_timeout, Some(Duration::from_secs(10)));
        assert_eq!(
            SessionConfig::default().no_discovery_timeout().discovery_timeout,
            None
        );
    }
}
