//! BLE client for the LED and button of a Nordic Thingy.
//!
//! A [`Scanner`] finds peripherals advertising the Thingy user interface
//! service and keeps one entry per device. A [`Session`] connects to one of
//! them, discovers the LED and button characteristics, subscribes to button
//! notifications and then accepts LED reads and writes. Peripherals exposing
//! only some of the characteristics are still usable; the capabilities found
//! are reported with [`SessionEvent::Connected`].
//!
//! All radio access goes through the [`Radio`] trait. [`BtleplugRadio`] talks
//! to the host bluetooth stack; tests can provide their own implementation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use thingy_ble::{BtleplugRadio, Error, ScanConfig, Scanner, Session, SessionConfig, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     pretty_env_logger::init();
//!
//!     let radio = Arc::new(BtleplugRadio::new().await?);
//!
//!     // Find the first Thingy
//!     let mut scanner = Scanner::new(radio.clone());
//!     let mut devices = scanner.device_stream();
//!     scanner.start(ScanConfig::default()).await?;
//!     let device = devices.next().await.unwrap();
//!     scanner.stop().await?;
//!
//!     // Connect and switch the LED on once ready
//!     let (session, mut events) = Session::for_advertisement(radio, &device, SessionConfig::default());
//!     session.connect()?;
//!
//!     while let Some(event) = events.next().await {
//!         match event {
//!             SessionEvent::Connected(capabilities) if capabilities.led_supported => {
//!                 session.turn_on_led()?;
//!             }
//!             SessionEvent::ButtonChanged { pressed } => println!("Button pressed: {}", pressed),
//!             SessionEvent::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//!```

#![warn(clippy::all, future_incompatible, nonstandard_style, rust_2018_idioms)]

pub use btleplug::api::{CharPropFlags, WriteType};

pub use btleplug_radio::BtleplugRadio;
pub use characteristic::{decode_flag, encode_flag, DiscoveredCharacteristic};
pub use device::{
    Advertisement, DeviceEvent, DeviceList, DeviceListChange, PeripheralIdentity,
    UNKNOWN_DEVICE_NAME,
};
pub use error::{Error, Result};
pub use observer::{CapabilitySet, SessionEvent, SessionEvents, SessionObserver};
pub use radio::{
    AdvertisementStream, GattCompletion, GattOperation, GattRequest, Generation, Radio,
    RadioEvent, RadioEventStream,
};
pub use scanner::{ScanConfig, Scanner};
pub use session::{ConnectionState, Session, SessionConfig};

mod btleplug_radio;
mod device;
mod error;
mod observer;
mod radio;
mod scanner;
mod session;

mod characteristic;
pub mod common;
