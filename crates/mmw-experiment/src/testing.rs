//! A simulated bench for unit tests.
//!
//! The lock-in's `SNAP? 1,2` reply is derived from the synthesizer's current
//! frequency (`X = f`, `Y = -f/2`), so a row can be traced back to the value
//! that was applied before it was sampled.

#![allow(clippy::unwrap_used)]

use crate::config::InstrumentSettings;
use crate::session::Session;
use mmw_driver_pasternack::Pe11s390Driver;
use mmw_hardware::mock::{SimulatedBus, SimulatedUsb};
use mmw_hardware::{BusSettings, Instrument, Prologix, UsbDevice};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const USB_TIMEOUT: Duration = Duration::from_millis(50);

/// Simulated Prologix bus plus USB synthesizer.
pub struct SimulatedBench {
    pub bus: SimulatedBus,
    pub usb: SimulatedUsb,
    pub snaps: Arc<Mutex<usize>>,
}

impl SimulatedBench {
    pub fn new() -> Self {
        Self::failing_after(None)
    }

    /// A bench whose lock-in answers garbage from snap number `fail_after` on.
    pub fn failing_after(fail_after: Option<usize>) -> Self {
        let frequency = Arc::new(Mutex::new(10.0_f64));
        let snaps = Arc::new(Mutex::new(0usize));

        let usb = {
            let frequency = Arc::clone(&frequency);
            let mut power = 0.0_f64;
            let mut rf = 0u8;
            SimulatedUsb::new(move |cmd: &str| {
                if cmd == "*IDN?" {
                    return Some(b"Pasternack,PE11S390\n".to_vec());
                }
                if let Some(v) = cmd.strip_prefix("FREQ:SET ").and_then(|v| v.strip_suffix(';')) {
                    *frequency.lock().unwrap() = v.parse().ok()?;
                    return None;
                }
                if let Some(v) = cmd.strip_prefix("POWE:SET ").and_then(|v| v.strip_suffix(';')) {
                    power = v.parse().ok()?;
                    return None;
                }
                if let Some(v) = cmd.strip_prefix("POWE:RF ").and_then(|v| v.strip_suffix(';')) {
                    rf = v.parse().ok()?;
                    return None;
                }
                match cmd {
                    "FREQ:RETACT?;" => {
                        Some(format!("{};\n", *frequency.lock().unwrap()).into_bytes())
                    }
                    "POWE:SET?;" => Some(format!("{};\n", power).into_bytes()),
                    "POWE:RF?;" => Some(format!("{};\n", rf).into_bytes()),
                    _ => None,
                }
            })
        };

        let bus = SimulatedBus::new();
        {
            let frequency = Arc::clone(&frequency);
            let snaps = Arc::clone(&snaps);
            bus.attach(8, move |cmd: &str| {
                if cmd != "SNAP? 1,2" {
                    return None;
                }
                let mut count = snaps.lock().unwrap();
                *count += 1;
                if fail_after.is_some_and(|n| *count > n) {
                    return Some(b"ERR\n".to_vec());
                }
                let f = *frequency.lock().unwrap();
                Some(format!("{},{}\n", f, -f / 2.0).into_bytes())
            });
        }
        {
            let mut hz = 1000.0_f64;
            bus.attach(10, move |cmd: &str| {
                if let Some(v) = cmd.strip_prefix("FREQ ") {
                    hz = v.parse().ok()?;
                    return None;
                }
                (cmd == "FREQ?").then(|| format!("{}\n", hz).into_bytes())
            });
        }

        Self { bus, usb, snaps }
    }

    pub fn snap_count(&self) -> usize {
        *self.snaps.lock().unwrap()
    }
}

/// A connected, uninitialized session over `sim` with a multiplier of 18.
pub async fn bench(sim: &SimulatedBench) -> Session {
    let settings = BusSettings {
        read_timeout: Duration::from_millis(100),
        flush_timeout: Duration::from_millis(1),
        ..BusSettings::default()
    };
    let bus = Prologix::with_port("sim", Box::new(sim.bus.port()), &settings)
        .await
        .unwrap();
    let device = UsbDevice::from_port("/dev/usbtmc0", Box::new(sim.usb.port()), USB_TIMEOUT)
        .await
        .unwrap();
    let synthesizer = Pe11s390Driver::new(Instrument::from_usb_device(device, USB_TIMEOUT));
    Session::connect(bus, synthesizer, &InstrumentSettings::default(), 18.0)
        .await
        .unwrap()
}

/// Device lines sent while `address` was selected.
pub fn device_lines(bus: &SimulatedBus, address: u8) -> Vec<String> {
    let mut current = None;
    let mut lines = Vec::new();
    for line in bus.transcript() {
        if let Some(rest) = line.strip_prefix("++addr ") {
            current = rest.trim().parse::<u8>().ok();
        } else if !line.starts_with("++") && current == Some(address) {
            lines.push(line);
        }
    }
    lines
}
