//! Boundary between the session state machine and the platform radio stack.
//!
//! Requests are fire-and-forget. Their results come back on the peripheral's
//! event stream as [`RadioEvent::Completed`], tagged with the generation the
//! request was submitted under, so replies that outlive their connection can
//! be recognised and dropped.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use btleplug::api::WriteType;
use futures::Stream;
use uuid::Uuid;

use crate::{Advertisement, DiscoveredCharacteristic, PeripheralIdentity, Result};

pub type AdvertisementStream = Pin<Box<dyn Stream<Item = Advertisement> + Send>>;
pub type RadioEventStream = Pin<Box<dyn Stream<Item = RadioEvent> + Send>>;

/// Connection attempt counter. Every connection attempt of a session runs
/// under a fresh generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattRequest {
    Connect,
    Disconnect,
    DiscoverServices {
        service: Uuid,
    },
    DiscoverCharacteristics {
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    Read {
        characteristic: Uuid,
    },
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    SetNotify {
        characteristic: Uuid,
        enable: bool,
    },
}

impl GattRequest {
    pub fn operation(&self) -> GattOperation {
        match self {
            GattRequest::Connect => GattOperation::Connect,
            GattRequest::Disconnect => GattOperation::Disconnect,
            GattRequest::DiscoverServices { .. } => GattOperation::DiscoverServices,
            GattRequest::DiscoverCharacteristics { .. } => GattOperation::DiscoverCharacteristics,
            GattRequest::Read { .. } => GattOperation::Read,
            GattRequest::Write { .. } => GattOperation::Write,
            GattRequest::SetNotify { .. } => GattOperation::SetNotify,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOperation {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    Read,
    Write,
    SetNotify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCompletion {
    Connected,
    ConnectFailed,
    /// Reply to a disconnect request.
    Disconnected,
    ServicesDiscovered(Vec<Uuid>),
    CharacteristicsDiscovered {
        service: Uuid,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    NotificationStateUpdated {
        characteristic: Uuid,
        enabled: bool,
    },
    /// Read result or notification.
    ValueUpdated {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Acknowledged write, echoing the written value.
    WriteConfirmed {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Failed {
        operation: GattOperation,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    Completed {
        generation: Generation,
        completion: GattCompletion,
    },
    /// The link to the peripheral was lost.
    Disconnected,
    /// The radio was switched off or became unavailable.
    PoweredOff,
}

impl RadioEvent {
    pub fn completed(generation: Generation, completion: GattCompletion) -> Self {
        RadioEvent::Completed {
            generation,
            completion,
        }
    }
}

/// Platform central role. Owned by the application and shared by the
/// [`Scanner`](crate::Scanner) and every [`Session`](crate::Session).
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Starts scanning for peripherals advertising `service`. Repeated
    /// advertisements of the same peripheral are passed through.
    async fn start_scan(&self, service: Uuid) -> Result<AdvertisementStream>;

    /// Stops scanning. Does nothing if no scan is running.
    async fn stop_scan(&self) -> Result<()>;

    /// Event stream for one peripheral: request completions, notifications
    /// and link loss.
    async fn events(&self, peripheral: &PeripheralIdentity) -> Result<RadioEventStream>;

    /// Queues a request for `peripheral`. Must not block.
    fn submit(&self, peripheral: &PeripheralIdentity, generation: Generation, request: GattRequest);
}
