//! Agilent / HP signal sources and bench supplies.
//!
//! - [`agilent_33220a`]: function generator driving the chopper
//! - [`hp_8350b`]: sweep oscillator
//! - [`agilent_e3631a`]: triple-output DC supply
//! - [`agilent_e3633a`]: single-output DC supply

pub mod agilent_33220a;
pub mod agilent_e3631a;
pub mod agilent_e3633a;
pub mod hp_8350b;

pub use agilent_33220a::{Agilent33220aDriver, TriggerSource, VoltageUnit, Waveform};
pub use agilent_e3631a::{AgilentE3631aDriver, Rail};
pub use agilent_e3633a::AgilentE3633aDriver;
pub use hp_8350b::{Frequency, FrequencyUnit, Hp8350bDriver, TimeUnit};
