//! Stanford Research Systems drivers.
//!
//! Currently the SR830 DSP lock-in amplifier and its binary scan-buffer format.

pub mod scan;
pub mod sr830;

pub use scan::{decode_buffer, decode_point};
pub use sr830::{Channel, ScanData, SnapParam, Sr830Driver};
