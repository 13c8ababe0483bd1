//! This example connects to the first Thingy found, mirrors the button on the LED
//! and disconnects after ten button presses.

use std::sync::Arc;

use futures::StreamExt;
use thingy_ble::{
    BtleplugRadio, CapabilitySet, Error, ScanConfig, Scanner, Session, SessionConfig,
    SessionObserver,
};

struct Console {
    presses: usize,
}

impl SessionObserver for Console {
    fn connected(&mut self, capabilities: CapabilitySet) {
        println!("Connected: {:?}", capabilities);
    }

    fn disconnected(&mut self) {
        println!("Disconnected");
    }

    fn button_changed(&mut self, pressed: bool) {
        println!("Button {}", if pressed { "pressed" } else { "released" });
        if pressed {
            self.presses += 1;
        }
    }

    fn led_changed(&mut self, on: bool) {
        println!("LED {}", if on { "on" } else { "off" });
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let radio = Arc::new(BtleplugRadio::new().await?);

    // Find the first device advertising the Thingy user interface service
    let mut scanner = Scanner::new(radio.clone());
    let mut device_stream = scanner.device_stream();
    scanner
        .start(ScanConfig::default().stop_after_first_match())
        .await?;

    let device = match device_stream.next().await {
        Some(device) => device,
        None => return Ok(()),
    };
    println!("Found {} ({} dBm)", device.display_name(), device.rssi);
    scanner.stop().await?;

    let (session, mut events) =
        Session::for_advertisement(radio, &device, SessionConfig::default());
    session.connect()?;

    let mut console = Console { presses: 0 };
    let mut closing = false;
    while let Some(event) = events.next().await {
        event.dispatch(&mut console);

        match event {
            thingy_ble::SessionEvent::ButtonChanged { pressed } => session.write_led(pressed)?,
            thingy_ble::SessionEvent::Disconnected => break,
            _ => {}
        }

        if console.presses >= 10 && !closing {
            session.disconnect()?;
            closing = true;
        }
    }

    Ok(())
}
