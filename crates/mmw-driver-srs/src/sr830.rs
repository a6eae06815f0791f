//! Stanford Research Systems SR830 DSP lock-in amplifier.
//!
//! Reference: SR830 User's Manual, chapter 5 (Remote Programming).
//!
//! Protocol Overview:
//! - GPIB through the shared Prologix controller, default address 8
//! - ASCII commands, LF terminated, replies LF terminated
//! - Sensitivity, time constant, slope and sample rate are selected by index
//!   into fixed tables; the driver accepts physical values and rounds them
//! - `SNAP?` reads up to six outputs at the same instant
//! - `TRCL?` returns the scan buffer in a 4-byte binary format, see [`crate::scan`]
//!
//! `initialize_instrument` routes replies to GPIB (`OUTX 1`). Without it the
//! instrument answers on RS-232 and every query times out.

use crate::scan::{decode_buffer, BYTES_PER_POINT};
use async_trait::async_trait;
use mmw_core::{AppResult, DaqError, Reply};
use mmw_hardware::{Command, Instrument, InstrumentDriver, SettingTable};
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument, warn};

/// Default GPIB address on the bench.
pub const DEFAULT_ADDRESS: u8 = 8;

/// Maximum number of outputs one `SNAP?` can return.
pub const MAX_SNAP: usize = 6;

/// Points the scan buffer holds.
pub const BUFFER_POINTS: f64 = 16383.0;

// =============================================================================
// Setting tables
// =============================================================================

/// Full-scale sensitivity in volts, indexed by `SENS`.
pub const SENSITIVITY_VOLTS: SettingTable = SettingTable::new(
    "sensitivity",
    &[
        2e-9, 5e-9, 1e-8, 2e-8, 5e-8, 1e-7, 2e-7, 5e-7, 1e-6, 2e-6, 5e-6, 1e-5, 2e-5, 5e-5, 1e-4,
        2e-4, 5e-4, 1e-3, 2e-3, 5e-3, 1e-2, 2e-2, 5e-2, 0.1, 0.2, 0.5, 1.0,
    ],
);

/// Time constant in milliseconds, indexed by `OFLT`.
pub const TIME_CONSTANT_MS: SettingTable = SettingTable::new(
    "time constant",
    &[
        0.01, 0.03, 0.1, 0.3, 1.0, 3.0, 10.0, 30.0, 100.0, 300.0, 1e3, 3e3, 1e4, 3e4, 1e5, 3e5,
        1e6, 3e6, 1e7, 3e7,
    ],
);

/// Low-pass filter slope in dB/octave, indexed by `OFSL`.
pub const SLOPE_DB_PER_OCTAVE: SettingTable =
    SettingTable::new("low-pass slope", &[6.0, 12.0, 18.0, 24.0]);

/// Buffer sample rate in Hz, indexed by `SRAT`. Index 14 is "trigger".
pub const SAMPLE_RATE_HZ: SettingTable = SettingTable::new(
    "sample rate",
    &[
        0.0625, 0.125, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 512.0,
    ],
);

/// `SRAT` index selecting external triggering.
pub const SAMPLE_RATE_TRIGGER: usize = 14;

// =============================================================================
// Wire-coded settings
// =============================================================================

macro_rules! wire_codes {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code),+
        }

        impl $name {
            /// Code sent on the wire.
            pub fn code(self) -> u8 {
                self as u8
            }

            /// Setting for a code read back from the instrument.
            pub fn from_code(code: usize) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_codes! {
    /// `FMOD`: where the reference comes from.
    ReferenceSource {
        /// Reference input connector.
        External = 0,
        /// Internal oscillator.
        Internal = 1,
    }
}

wire_codes! {
    /// `RSLP`: what edge of the external reference is tracked.
    ReferenceTrigger {
        /// Sine zero crossing.
        Sine = 0,
        /// TTL rising edge.
        TtlRising = 1,
        /// TTL falling edge.
        TtlFalling = 2,
    }
}

wire_codes! {
    /// `ISRC`: signal input.
    InputConfiguration {
        /// Voltage, single ended.
        A = 0,
        /// Voltage, differential.
        AMinusB = 1,
        /// Current, 1 MΩ gain.
        Current1M = 2,
        /// Current, 100 MΩ gain.
        Current100M = 3,
    }
}

wire_codes! {
    /// `IGND`: input shield.
    InputGrounding {
        /// Floating shield.
        Float = 0,
        /// Grounded shield.
        Ground = 1,
    }
}

wire_codes! {
    /// `ICPL`: input coupling.
    InputCoupling {
        /// AC coupled.
        Ac = 0,
        /// DC coupled.
        Dc = 1,
    }
}

wire_codes! {
    /// `ILIN`: line notch filters.
    NotchFilter {
        /// No filters.
        Out = 0,
        /// Line notch.
        Line = 1,
        /// 2× line notch.
        DoubleLine = 2,
        /// Both notches.
        Both = 3,
    }
}

wire_codes! {
    /// `RMOD`: dynamic reserve.
    ReserveMode {
        /// High reserve.
        High = 0,
        /// Normal.
        Normal = 1,
        /// Low noise.
        LowNoise = 2,
    }
}

wire_codes! {
    /// `DDEF 1`: what channel 1 displays.
    Channel1Display {
        /// X.
        X = 0,
        /// R.
        R = 1,
        /// X noise.
        XNoise = 2,
        /// Aux input 1.
        Aux1 = 3,
        /// Aux input 2.
        Aux2 = 4,
    }
}

wire_codes! {
    /// `DDEF 2`: what channel 2 displays.
    Channel2Display {
        /// Y.
        Y = 0,
        /// θ.
        Theta = 1,
        /// Y noise.
        YNoise = 2,
        /// Aux input 3.
        Aux3 = 3,
        /// Aux input 4.
        Aux4 = 4,
    }
}

wire_codes! {
    /// `DDEF` ratio: none, or divide by the first or second aux input of the channel.
    DisplayRatio {
        /// No ratio.
        None = 0,
        /// Aux 1 (channel 1) or Aux 3 (channel 2).
        First = 1,
        /// Aux 2 (channel 1) or Aux 4 (channel 2).
        Second = 2,
    }
}

wire_codes! {
    /// `FPOP`: front-panel CH1/CH2 output source.
    FrontPanelOutput {
        /// Whatever the display shows.
        Display = 0,
        /// X for CH1, Y for CH2.
        Native = 1,
    }
}

wire_codes! {
    /// Output quantity for offsets (`OEXP`, `AOFF`) and `OUTP?`.
    OutputParameter {
        /// In-phase.
        X = 1,
        /// Quadrature.
        Y = 2,
        /// Magnitude.
        R = 3,
        /// Phase; readable via `OUTP?` only.
        Theta = 4,
    }
}

wire_codes! {
    /// `OEXP` expand factor.
    OffsetExpand {
        /// ×1.
        X1 = 0,
        /// ×10.
        X10 = 1,
        /// ×100.
        X100 = 2,
    }
}

wire_codes! {
    /// `OUTX`: where replies are sent.
    OutputInterface {
        /// RS-232.
        Rs232 = 0,
        /// GPIB.
        Gpib = 1,
    }
}

wire_codes! {
    /// `SEND`: what happens when the buffer fills.
    EndOfBuffer {
        /// Stop.
        Shot = 0,
        /// Wrap around.
        Loop = 1,
    }
}

wire_codes! {
    /// `TSTR`: whether a trigger starts the scan.
    TriggerStart {
        /// Trigger does not start the scan.
        Off = 0,
        /// Trigger starts the scan.
        On = 1,
    }
}

wire_codes! {
    /// Display channel / buffer number.
    Channel {
        /// Channel 1.
        One = 1,
        /// Channel 2.
        Two = 2,
    }
}

wire_codes! {
    /// Quantities `SNAP?` can capture.
    SnapParam {
        /// X.
        X = 1,
        /// Y.
        Y = 2,
        /// R.
        R = 3,
        /// θ.
        Theta = 4,
        /// Aux input 1.
        Aux1 = 5,
        /// Aux input 2.
        Aux2 = 6,
        /// Aux input 3.
        Aux3 = 7,
        /// Aux input 4.
        Aux4 = 8,
        /// Reference frequency.
        RefFreq = 9,
        /// Channel 1 display.
        Ch1 = 10,
        /// Channel 2 display.
        Ch2 = 11,
    }
}

impl SnapParam {
    /// Upper-case name used in saved files and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            SnapParam::X => "X",
            SnapParam::Y => "Y",
            SnapParam::R => "R",
            SnapParam::Theta => "THETA",
            SnapParam::Aux1 => "AUX1",
            SnapParam::Aux2 => "AUX2",
            SnapParam::Aux3 => "AUX3",
            SnapParam::Aux4 => "AUX4",
            SnapParam::RefFreq => "REF_FREQ",
            SnapParam::Ch1 => "CH1",
            SnapParam::Ch2 => "CH2",
        }
    }
}

impl fmt::Display for SnapParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SnapParam {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        (1..=11)
            .filter_map(SnapParam::from_code)
            .find(|p| p.name() == upper)
            .ok_or_else(|| DaqError::InvalidParameter(format!("unknown snap parameter '{}'", s)))
    }
}

/// Both scan buffers read back after a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanData {
    /// Channel 1 buffer.
    pub channel1: Vec<f64>,
    /// Channel 2 buffer.
    pub channel2: Vec<f64>,
}

impl ScanData {
    /// Points per channel.
    pub fn len(&self) -> usize {
        self.channel1.len()
    }

    /// `true` when nothing was stored.
    pub fn is_empty(&self) -> bool {
        self.channel1.is_empty()
    }
}

// =============================================================================
// Command builders
// =============================================================================

/// Builders for every SR830 command the driver sends.
pub mod commands {
    use super::*;

    /// `*IDN?`
    pub fn identify() -> Command {
        Command::query("*IDN?")
    }

    /// `PHAS <deg>`
    pub fn set_phase(degrees: f64) -> Command {
        Command::write(format!("PHAS {}", degrees))
    }

    /// `FMOD <i>`
    pub fn set_reference_source(source: ReferenceSource) -> Command {
        Command::write(format!("FMOD {}", source.code()))
    }

    /// `FREQ <hz>`
    pub fn set_reference_frequency(hz: f64) -> Command {
        Command::write(format!("FREQ {}", hz))
    }

    /// `RSLP <i>`
    pub fn set_reference_trigger(trigger: ReferenceTrigger) -> Command {
        Command::write(format!("RSLP {}", trigger.code()))
    }

    /// `HARM <n>`
    pub fn set_harmonic(harmonic: u32) -> Command {
        Command::write(format!("HARM {}", harmonic))
    }

    /// `SLVL <v>`
    pub fn set_sine_amplitude(volts: f64) -> Command {
        Command::write(format!("SLVL {}", volts))
    }

    /// `ISRC <i>`
    pub fn set_input_configuration(input: InputConfiguration) -> Command {
        Command::write(format!("ISRC {}", input.code()))
    }

    /// `IGND <i>`
    pub fn set_input_grounding(grounding: InputGrounding) -> Command {
        Command::write(format!("IGND {}", grounding.code()))
    }

    /// `ICPL <i>`
    pub fn set_input_coupling(coupling: InputCoupling) -> Command {
        Command::write(format!("ICPL {}", coupling.code()))
    }

    /// `ILIN <i>`
    pub fn set_notch_filter(notch: NotchFilter) -> Command {
        Command::write(format!("ILIN {}", notch.code()))
    }

    /// `SENS <i>`
    pub fn set_sensitivity_index(index: usize) -> Command {
        Command::write(format!("SENS {}", index))
    }

    /// `RMOD <i>`
    pub fn set_reserve_mode(mode: ReserveMode) -> Command {
        Command::write(format!("RMOD {}", mode.code()))
    }

    /// `OFLT <i>`
    pub fn set_time_constant_index(index: usize) -> Command {
        Command::write(format!("OFLT {}", index))
    }

    /// `OFSL <i>`
    pub fn set_slope_index(index: usize) -> Command {
        Command::write(format!("OFSL {}", index))
    }

    /// `SYNC <0|1>`
    pub fn set_sync_filter(on: bool) -> Command {
        Command::write(format!("SYNC {}", u8::from(on)))
    }

    /// `DDEF 1,<display>,<ratio>`
    pub fn set_channel1_display(display: Channel1Display, ratio: DisplayRatio) -> Command {
        Command::write(format!("DDEF 1,{},{}", display.code(), ratio.code()))
    }

    /// `DDEF 2,<display>,<ratio>`
    pub fn set_channel2_display(display: Channel2Display, ratio: DisplayRatio) -> Command {
        Command::write(format!("DDEF 2,{},{}", display.code(), ratio.code()))
    }

    /// `FPOP <ch>,<source>`
    pub fn set_front_panel_output(channel: Channel, output: FrontPanelOutput) -> Command {
        Command::write(format!("FPOP {},{}", channel.code(), output.code()))
    }

    /// `OEXP <param>,<percent>,<expand>`
    pub fn set_offset(parameter: OutputParameter, percent: f64, expand: OffsetExpand) -> Command {
        Command::write(format!(
            "OEXP {},{},{}",
            parameter.code(),
            percent,
            expand.code()
        ))
    }

    /// `AOFF <param>`
    pub fn auto_offset(parameter: OutputParameter) -> Command {
        Command::write(format!("AOFF {}", parameter.code()))
    }

    /// `AUXV <ch>,<v>`
    pub fn set_aux_output(channel: u8, volts: f64) -> Command {
        Command::write(format!("AUXV {},{}", channel, volts))
    }

    /// `OUTX <i>`
    pub fn set_output_interface(interface: OutputInterface) -> Command {
        Command::write(format!("OUTX {}", interface.code()))
    }

    /// `OVRM <0|1>`
    pub fn set_remote_override(on: bool) -> Command {
        Command::write(format!("OVRM {}", u8::from(on)))
    }

    /// `KCLK <0|1>`
    pub fn set_key_click(on: bool) -> Command {
        Command::write(format!("KCLK {}", u8::from(on)))
    }

    /// `ALRM <0|1>`
    pub fn set_alarm(on: bool) -> Command {
        Command::write(format!("ALRM {}", u8::from(on)))
    }

    /// `SSET <slot>`
    pub fn save_setup(slot: u8) -> Command {
        Command::write(format!("SSET {}", slot))
    }

    /// `RSET <slot>`
    pub fn recall_setup(slot: u8) -> Command {
        Command::write(format!("RSET {}", slot))
    }

    /// `SRAT <i>`
    pub fn set_sample_rate_index(index: usize) -> Command {
        Command::write(format!("SRAT {}", index))
    }

    /// `SEND <i>`
    pub fn set_end_of_buffer(mode: EndOfBuffer) -> Command {
        Command::write(format!("SEND {}", mode.code()))
    }

    /// `TSTR <i>`
    pub fn set_trigger_start(mode: TriggerStart) -> Command {
        Command::write(format!("TSTR {}", mode.code()))
    }

    /// `OUTP? <param>`
    pub fn output(parameter: OutputParameter) -> Command {
        Command::query(format!("OUTP? {}", parameter.code()))
    }

    /// `OUTR? <ch>`
    pub fn channel_output(channel: Channel) -> Command {
        Command::query(format!("OUTR? {}", channel.code()))
    }

    /// `SNAP? <codes>`
    pub fn snap(params: &[SnapParam]) -> Command {
        let codes: Vec<String> = params.iter().map(|p| p.code().to_string()).collect();
        Command::query(format!("SNAP? {}", codes.join(",")))
    }

    /// `TRCL? <ch>,<start>,<count>`
    pub fn trace_binary(channel: Channel, start: usize, count: usize) -> Command {
        Command::query(format!("TRCL? {},{},{}", channel.code(), start, count))
    }
}

// =============================================================================
// Driver
// =============================================================================

/// SR830 driver.
#[derive(Debug)]
pub struct Sr830Driver {
    instrument: Instrument,
}

impl Sr830Driver {
    /// Driver over an unopened or open instrument.
    pub fn new(instrument: Instrument) -> Self {
        Self { instrument }
    }

    async fn send(&self, command: Command) -> AppResult<()> {
        self.instrument.send(&command).await
    }

    async fn number(&self, query: &str) -> AppResult<f64> {
        self.instrument.ask_number(&Command::query(query)).await
    }

    async fn coded<T>(&self, query: &str, parse: fn(usize) -> Option<T>) -> AppResult<T> {
        let code = self.instrument.ask_index(&Command::query(query)).await?;
        parse(code).ok_or_else(|| {
            DaqError::Decode(format!("{}: unexpected code {} for {}", self.name(), code, query))
        })
    }

    async fn table_value(&self, query: &str, table: &SettingTable) -> AppResult<f64> {
        let index = self.instrument.ask_index(&Command::query(query)).await?;
        table.value(index).ok_or_else(|| {
            DaqError::Decode(format!(
                "{}: {} index {} out of range",
                self.name(),
                table.name(),
                index
            ))
        })
    }

    /// `*IDN?` reply.
    pub async fn identify(&self) -> AppResult<String> {
        Ok(self.instrument.ask(&commands::identify()).await?.to_string())
    }

    // --- Reference -----------------------------------------------------------

    /// Reference phase shift in degrees.
    pub async fn reference_phase(&self) -> AppResult<f64> {
        self.number("PHAS?").await
    }

    /// Set the reference phase shift, -360..=729.99 degrees.
    #[instrument(skip(self), err)]
    pub async fn set_reference_phase(&self, degrees: f64) -> AppResult<()> {
        if !(-360.0..=729.99).contains(&degrees) {
            return Err(DaqError::InvalidParameter(format!(
                "phase {} deg outside -360..729.99",
                degrees
            )));
        }
        self.send(commands::set_phase(degrees)).await
    }

    /// Reference source.
    pub async fn reference_source(&self) -> AppResult<ReferenceSource> {
        self.coded("FMOD?", ReferenceSource::from_code).await
    }

    /// Select the reference source.
    pub async fn set_reference_source(&self, source: ReferenceSource) -> AppResult<()> {
        self.send(commands::set_reference_source(source)).await
    }

    /// Reference frequency in Hz.
    pub async fn reference_frequency(&self) -> AppResult<f64> {
        self.number("FREQ?").await
    }

    /// Internal oscillator frequency in Hz.
    #[instrument(skip(self), err)]
    pub async fn set_reference_frequency(&self, hz: f64) -> AppResult<()> {
        if !(0.001..=102_000.0).contains(&hz) {
            return Err(DaqError::InvalidParameter(format!(
                "reference frequency {} Hz outside 1 mHz..102 kHz",
                hz
            )));
        }
        self.send(commands::set_reference_frequency(hz)).await
    }

    /// External reference trigger.
    pub async fn reference_trigger(&self) -> AppResult<ReferenceTrigger> {
        self.coded("RSLP?", ReferenceTrigger::from_code).await
    }

    /// Select the external reference trigger.
    pub async fn set_reference_trigger(&self, trigger: ReferenceTrigger) -> AppResult<()> {
        self.send(commands::set_reference_trigger(trigger)).await
    }

    /// Detection harmonic.
    pub async fn detection_harmonic(&self) -> AppResult<u32> {
        Ok(self.instrument.ask_index(&Command::query("HARM?")).await? as u32)
    }

    /// Set the detection harmonic, 1..=19999.
    pub async fn set_detection_harmonic(&self, harmonic: u32) -> AppResult<()> {
        if !(1..=19_999).contains(&harmonic) {
            return Err(DaqError::InvalidParameter(format!(
                "harmonic {} outside 1..19999",
                harmonic
            )));
        }
        self.send(commands::set_harmonic(harmonic)).await
    }

    /// Sine output amplitude in volts rms.
    pub async fn sine_output_amplitude(&self) -> AppResult<f64> {
        self.number("SLVL?").await
    }

    /// Set the sine output amplitude, 0.004..=5.0 V rms.
    pub async fn set_sine_output_amplitude(&self, volts: f64) -> AppResult<()> {
        if !(0.004..=5.0).contains(&volts) {
            return Err(DaqError::InvalidParameter(format!(
                "sine amplitude {} V outside 0.004..5.0",
                volts
            )));
        }
        self.send(commands::set_sine_amplitude(volts)).await
    }

    // --- Input -----------------------------------------------------------------

    /// Signal input configuration.
    pub async fn input_configuration(&self) -> AppResult<InputConfiguration> {
        self.coded("ISRC?", InputConfiguration::from_code).await
    }

    /// Select the signal input.
    pub async fn set_input_configuration(&self, input: InputConfiguration) -> AppResult<()> {
        self.send(commands::set_input_configuration(input)).await
    }

    /// Input shield grounding.
    pub async fn input_grounding(&self) -> AppResult<InputGrounding> {
        self.coded("IGND?", InputGrounding::from_code).await
    }

    /// Set input shield grounding.
    pub async fn set_input_grounding(&self, grounding: InputGrounding) -> AppResult<()> {
        self.send(commands::set_input_grounding(grounding)).await
    }

    /// Input coupling.
    pub async fn input_coupling(&self) -> AppResult<InputCoupling> {
        self.coded("ICPL?", InputCoupling::from_code).await
    }

    /// Set input coupling.
    pub async fn set_input_coupling(&self, coupling: InputCoupling) -> AppResult<()> {
        self.send(commands::set_input_coupling(coupling)).await
    }

    /// Line notch filter state.
    pub async fn notch_filter(&self) -> AppResult<NotchFilter> {
        self.coded("ILIN?", NotchFilter::from_code).await
    }

    /// Set the line notch filters.
    pub async fn set_notch_filter(&self, notch: NotchFilter) -> AppResult<()> {
        self.send(commands::set_notch_filter(notch)).await
    }

    // --- Gain and filters ------------------------------------------------------

    /// Full-scale sensitivity in volts.
    pub async fn sensitivity(&self) -> AppResult<f64> {
        self.table_value("SENS?", &SENSITIVITY_VOLTS).await
    }

    /// Select the smallest full scale at or above `volts` (1 V when none is).
    ///
    /// Returns the selected full scale.
    #[instrument(skip(self), err)]
    pub async fn set_sensitivity(&self, volts: f64) -> AppResult<f64> {
        let index = SENSITIVITY_VOLTS.at_least(volts);
        self.send(commands::set_sensitivity_index(index)).await?;
        Ok(SENSITIVITY_VOLTS.value(index).unwrap_or(volts))
    }

    /// Dynamic reserve mode.
    pub async fn reserve_mode(&self) -> AppResult<ReserveMode> {
        self.coded("RMOD?", ReserveMode::from_code).await
    }

    /// Set the dynamic reserve mode.
    pub async fn set_reserve_mode(&self, mode: ReserveMode) -> AppResult<()> {
        self.send(commands::set_reserve_mode(mode)).await
    }

    /// Time constant in milliseconds.
    pub async fn time_constant(&self) -> AppResult<f64> {
        self.table_value("OFLT?", &TIME_CONSTANT_MS).await
    }

    /// Select the shortest time constant at or above `ms` (30 ks when none is).
    ///
    /// Returns the selected time constant in milliseconds.
    #[instrument(skip(self), err)]
    pub async fn set_time_constant(&self, ms: f64) -> AppResult<f64> {
        let index = TIME_CONSTANT_MS.at_least(ms);
        self.send(commands::set_time_constant_index(index)).await?;
        Ok(TIME_CONSTANT_MS.value(index).unwrap_or(ms))
    }

    /// Low-pass slope in dB/octave.
    pub async fn low_pass_slope(&self) -> AppResult<f64> {
        self.table_value("OFSL?", &SLOPE_DB_PER_OCTAVE).await
    }

    /// Select the steepest slope at or below `db_per_octave` (6 dB/oct when none is).
    ///
    /// Returns the selected slope.
    #[instrument(skip(self), err)]
    pub async fn set_low_pass_slope(&self, db_per_octave: f64) -> AppResult<f64> {
        let index = SLOPE_DB_PER_OCTAVE.at_most(db_per_octave);
        self.send(commands::set_slope_index(index)).await?;
        Ok(SLOPE_DB_PER_OCTAVE.value(index).unwrap_or(db_per_octave))
    }

    /// Synchronous filter state.
    pub async fn synchronous_filter(&self) -> AppResult<bool> {
        Ok(self.instrument.ask_index(&Command::query("SYNC?")).await? == 1)
    }

    /// Enable the synchronous filter (effective below 200 Hz).
    pub async fn set_synchronous_filter(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_sync_filter(on)).await
    }

    // --- Display and outputs -----------------------------------------------------

    /// `(display, ratio)` codes shown on a channel.
    pub async fn channel_display(&self, channel: Channel) -> AppResult<(u8, u8)> {
        let reply = self
            .instrument
            .ask(&Command::query(format!("DDEF? {}", channel.code())))
            .await?
            .to_string();
        let mut fields = reply.split(',').map(|f| f.trim().parse::<u8>());
        match (fields.next(), fields.next()) {
            (Some(Ok(display)), Some(Ok(ratio))) => Ok((display, ratio)),
            _ => Err(DaqError::Decode(format!(
                "{}: malformed DDEF? reply '{}'",
                self.name(),
                reply
            ))),
        }
    }

    /// Choose what channel 1 displays.
    pub async fn set_channel1_display(
        &self,
        display: Channel1Display,
        ratio: DisplayRatio,
    ) -> AppResult<()> {
        self.send(commands::set_channel1_display(display, ratio)).await
    }

    /// Choose what channel 2 displays.
    pub async fn set_channel2_display(
        &self,
        display: Channel2Display,
        ratio: DisplayRatio,
    ) -> AppResult<()> {
        self.send(commands::set_channel2_display(display, ratio)).await
    }

    /// Front-panel output source of a channel.
    pub async fn front_panel_output(&self, channel: Channel) -> AppResult<FrontPanelOutput> {
        self.coded(
            &format!("FPOP? {}", channel.code()),
            FrontPanelOutput::from_code,
        )
        .await
    }

    /// Route a channel's front-panel output.
    pub async fn set_front_panel_output(
        &self,
        channel: Channel,
        output: FrontPanelOutput,
    ) -> AppResult<()> {
        self.send(commands::set_front_panel_output(channel, output)).await
    }

    /// `(percent, expand)` offset of X, Y or R.
    pub async fn offset(&self, parameter: OutputParameter) -> AppResult<(f64, OffsetExpand)> {
        let reply = self
            .instrument
            .ask(&Command::query(format!("OEXP? {}", parameter.code())))
            .await?
            .to_string();
        let mut fields = reply.split(',').map(str::trim);
        let percent = fields.next().and_then(|f| f.parse::<f64>().ok());
        let expand = fields
            .next()
            .and_then(|f| f.parse::<usize>().ok())
            .and_then(OffsetExpand::from_code);
        match (percent, expand) {
            (Some(percent), Some(expand)) => Ok((percent, expand)),
            _ => Err(DaqError::Decode(format!(
                "{}: malformed OEXP? reply '{}'",
                self.name(),
                reply
            ))),
        }
    }

    /// Set the offset of X, Y or R in percent of full scale, -105..=105.
    pub async fn set_offset(
        &self,
        parameter: OutputParameter,
        percent: f64,
        expand: OffsetExpand,
    ) -> AppResult<()> {
        if parameter == OutputParameter::Theta {
            return Err(DaqError::InvalidParameter("θ has no offset".into()));
        }
        if !(-105.0..=105.0).contains(&percent) {
            return Err(DaqError::InvalidParameter(format!(
                "offset {}% outside -105..105",
                percent
            )));
        }
        self.send(commands::set_offset(parameter, percent, expand)).await
    }

    /// Zero the X, Y and R offsets.
    pub async fn clear_offsets(&self) -> AppResult<()> {
        for parameter in [OutputParameter::X, OutputParameter::Y, OutputParameter::R] {
            self.set_offset(parameter, 0.0, OffsetExpand::X1).await?;
        }
        Ok(())
    }

    /// Auto-offset X, Y or R.
    pub async fn auto_offset(&self, parameter: OutputParameter) -> AppResult<()> {
        if parameter == OutputParameter::Theta {
            return Err(DaqError::InvalidParameter("θ has no offset".into()));
        }
        self.send(commands::auto_offset(parameter)).await
    }

    // --- Auxiliary I/O -----------------------------------------------------------

    fn check_aux(channel: u8) -> AppResult<()> {
        if (1..=4).contains(&channel) {
            Ok(())
        } else {
            Err(DaqError::InvalidParameter(format!(
                "aux channel {} outside 1..4",
                channel
            )))
        }
    }

    /// Aux input voltage (1/3 mV resolution).
    pub async fn aux_input(&self, channel: u8) -> AppResult<f64> {
        Self::check_aux(channel)?;
        self.number(&format!("OAUX? {}", channel)).await
    }

    /// Aux output voltage.
    pub async fn aux_output(&self, channel: u8) -> AppResult<f64> {
        Self::check_aux(channel)?;
        self.number(&format!("AUXV? {}", channel)).await
    }

    /// Set an aux output, -10.5..=10.5 V.
    pub async fn set_aux_output(&self, channel: u8, volts: f64) -> AppResult<()> {
        Self::check_aux(channel)?;
        if !(-10.5..=10.5).contains(&volts) {
            return Err(DaqError::InvalidParameter(format!(
                "aux output {} V outside -10.5..10.5",
                volts
            )));
        }
        self.send(commands::set_aux_output(channel, volts)).await
    }

    // --- Setup -----------------------------------------------------------------

    /// Reply interface.
    pub async fn output_interface(&self) -> AppResult<OutputInterface> {
        self.coded("OUTX?", OutputInterface::from_code).await
    }

    /// Choose where replies go.
    pub async fn set_output_interface(&self, interface: OutputInterface) -> AppResult<()> {
        self.send(commands::set_output_interface(interface)).await
    }

    /// Allow front-panel use while under remote control.
    pub async fn set_remote_override(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_remote_override(on)).await
    }

    /// Key click state.
    pub async fn key_click(&self) -> AppResult<bool> {
        Ok(self.instrument.ask_index(&Command::query("KCLK?")).await? == 1)
    }

    /// Enable key clicks.
    pub async fn set_key_click(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_key_click(on)).await
    }

    /// Alarm state.
    pub async fn alarm(&self) -> AppResult<bool> {
        Ok(self.instrument.ask_index(&Command::query("ALRM?")).await? == 1)
    }

    /// Enable audible alarms.
    pub async fn set_alarm(&self, on: bool) -> AppResult<()> {
        self.send(commands::set_alarm(on)).await
    }

    fn check_slot(slot: u8) -> AppResult<()> {
        if (1..=9).contains(&slot) {
            Ok(())
        } else {
            Err(DaqError::InvalidParameter(format!(
                "setup slot {} outside 1..9",
                slot
            )))
        }
    }

    /// Save the current setup to slot 1..=9.
    pub async fn save_setup(&self, slot: u8) -> AppResult<()> {
        Self::check_slot(slot)?;
        self.send(commands::save_setup(slot)).await
    }

    /// Recall the setup stored in slot 1..=9.
    pub async fn recall_setup(&self, slot: u8) -> AppResult<()> {
        Self::check_slot(slot)?;
        self.send(commands::recall_setup(slot)).await
    }

    /// Auto gain.
    pub async fn auto_gain(&self) -> AppResult<()> {
        self.send(Command::write("AGAN")).await
    }

    /// Auto reserve.
    pub async fn auto_reserve(&self) -> AppResult<()> {
        self.send(Command::write("ARSV")).await
    }

    /// Auto phase.
    pub async fn auto_phase(&self) -> AppResult<()> {
        self.send(Command::write("APHS")).await
    }

    // --- Data storage ------------------------------------------------------------

    /// Buffer sample rate in Hz, `None` when triggered externally.
    pub async fn sample_rate(&self) -> AppResult<Option<f64>> {
        let index = self.instrument.ask_index(&Command::query("SRAT?")).await?;
        if index == SAMPLE_RATE_TRIGGER {
            return Ok(None);
        }
        SAMPLE_RATE_HZ.value(index).map(Some).ok_or_else(|| {
            DaqError::Decode(format!("{}: sample rate index {} out of range", self.name(), index))
        })
    }

    /// Select the lowest sample rate at or above `hz` (512 Hz when none is).
    ///
    /// Returns the selected rate.
    pub async fn set_sample_rate(&self, hz: f64) -> AppResult<f64> {
        let index = SAMPLE_RATE_HZ.at_least(hz);
        self.send(commands::set_sample_rate_index(index)).await?;
        Ok(SAMPLE_RATE_HZ.value(index).unwrap_or(hz))
    }

    /// Sample on the external trigger input.
    pub async fn set_sample_rate_triggered(&self) -> AppResult<()> {
        self.send(commands::set_sample_rate_index(SAMPLE_RATE_TRIGGER))
            .await
    }

    /// Seconds until the buffer fills at the current rate, `None` when triggered.
    pub async fn storage_time(&self) -> AppResult<Option<f64>> {
        Ok(self.sample_rate().await?.map(|hz| BUFFER_POINTS / hz))
    }

    /// End-of-buffer behaviour.
    pub async fn end_of_buffer(&self) -> AppResult<EndOfBuffer> {
        self.coded("SEND?", EndOfBuffer::from_code).await
    }

    /// Set the end-of-buffer behaviour.
    pub async fn set_end_of_buffer(&self, mode: EndOfBuffer) -> AppResult<()> {
        self.send(commands::set_end_of_buffer(mode)).await
    }

    /// Software trigger.
    pub async fn trigger(&self) -> AppResult<()> {
        self.send(Command::write("TRIG")).await
    }

    /// Trigger-starts-scan mode.
    pub async fn trigger_start(&self) -> AppResult<TriggerStart> {
        self.coded("TSTR?", TriggerStart::from_code).await
    }

    /// Set whether a trigger starts the scan.
    pub async fn set_trigger_start(&self, mode: TriggerStart) -> AppResult<()> {
        self.send(commands::set_trigger_start(mode)).await
    }

    /// Reset, then start filling the buffer. Returns the storage time.
    pub async fn start_scan(&self) -> AppResult<Option<f64>> {
        self.send(Command::write("REST")).await?;
        let storage = self.storage_time().await?;
        self.send(Command::write("STRT")).await?;
        info!("{}: scan started, storage time {:?} s", self.name(), storage);
        Ok(storage)
    }

    /// Pause the scan.
    pub async fn pause_scan(&self) -> AppResult<()> {
        self.send(Command::write("PAUS")).await
    }

    /// Clear the buffer.
    pub async fn reset_scan(&self) -> AppResult<()> {
        self.send(Command::write("REST")).await
    }

    // --- Data transfer -----------------------------------------------------------

    /// One output value.
    pub async fn output(&self, parameter: OutputParameter) -> AppResult<f64> {
        self.instrument.ask_number(&commands::output(parameter)).await
    }

    /// A channel display value.
    pub async fn channel_value(&self, channel: Channel) -> AppResult<f64> {
        self.instrument
            .ask_number(&commands::channel_output(channel))
            .await
    }

    /// Capture several outputs at the same instant.
    ///
    /// At most six are captured; extra requests are dropped with a warning.
    /// Results keep the request order.
    #[instrument(skip(self), err)]
    pub async fn snap_values(&self, params: &[SnapParam]) -> AppResult<Vec<(SnapParam, Reply)>> {
        if params.is_empty() {
            return Err(DaqError::InvalidParameter("nothing to snap".into()));
        }
        let params = if params.len() > MAX_SNAP {
            warn!(
                "{}: SNAP? takes at most {} values, dropping {}",
                self.name(),
                MAX_SNAP,
                params.len() - MAX_SNAP
            );
            &params[..MAX_SNAP]
        } else {
            params
        };

        let reply = self.instrument.ask(&commands::snap(params)).await?.to_string();
        let fields: Vec<&str> = reply.split(',').collect();
        if fields.len() != params.len() {
            return Err(DaqError::Decode(format!(
                "{}: SNAP? returned {} values for {} requested",
                self.name(),
                fields.len(),
                params.len()
            )));
        }

        Ok(params
            .iter()
            .zip(fields)
            .map(|(&param, field)| (param, Reply::coerce(field)))
            .collect())
    }

    /// `(X, Y)` at the same instant.
    pub async fn snap_xy(&self) -> AppResult<(f64, f64)> {
        let values = self.snap_values(&[SnapParam::X, SnapParam::Y]).await?;
        let number = |i: usize| {
            values
                .get(i)
                .and_then(|(_, reply)| reply.as_f64())
                .ok_or_else(|| DaqError::Decode(format!("{}: non-numeric snap value", self.name())))
        };
        Ok((number(0)?, number(1)?))
    }

    /// Points stored in the buffer.
    pub async fn scanned_data_length(&self) -> AppResult<usize> {
        self.instrument.ask_index(&Command::query("SPTS?")).await
    }

    /// Read `count` points of a channel buffer from `start`.
    ///
    /// # Errors
    ///
    /// [`DaqError::ScanLength`] if the instrument returns a different amount.
    #[instrument(skip(self), err)]
    pub async fn scanned_data(
        &self,
        channel: Channel,
        start: usize,
        count: usize,
    ) -> AppResult<Vec<f64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let command = commands::trace_binary(channel, start, count);
        let line = command.lines().concat();
        let bytes = self
            .instrument
            .query_raw(&line, count * BYTES_PER_POINT)
            .await?;
        decode_buffer(&bytes, count)
    }

    /// Pause the scan.
    pub async fn stop_scan(&self) -> AppResult<()> {
        self.pause_scan().await
    }

    /// Both buffers in full.
    pub async fn scan_data(&self) -> AppResult<ScanData> {
        let length = self.scanned_data_length().await?;
        Ok(ScanData {
            channel1: self.scanned_data(Channel::One, 0, length).await?,
            channel2: self.scanned_data(Channel::Two, 0, length).await?,
        })
    }
}

#[async_trait]
impl InstrumentDriver for Sr830Driver {
    fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn instrument_mut(&mut self) -> &mut Instrument {
        &mut self.instrument
    }

    async fn initialize_instrument(&self) -> AppResult<()> {
        self.set_output_interface(OutputInterface::Gpib).await
    }
}
