//! The bench session.
//!
//! A [`Session`] owns one driver per physical instrument and the Prologix
//! controller they share. It is built once, passed by reference to sweeps and
//! monitors, and closed once at the end. There is no process-wide instrument
//! state.
//!
//! ```text
//!   Session::open ──▶ initialize ──▶ configure / sweep steps ──▶ close
//! ```
//!
//! [`crate::sweep::sweep`] and [`crate::monitor::monitor`] close the session
//! on every exit path, including failures.

use crate::config::{BenchConfig, InstrumentSettings};
use mmw_core::{AppResult, DaqError};
use mmw_driver_agilent::agilent_33220a::{Agilent33220aDriver, Waveform};
use mmw_driver_pasternack::Pe11s390Driver;
use mmw_driver_srs::sr830::{
    Channel, EndOfBuffer, FrontPanelOutput, InputConfiguration, InputCoupling, InputGrounding,
    NotchFilter, ReferenceSource, ReferenceTrigger, ReserveMode, Sr830Driver, TriggerStart,
};
use mmw_hardware::{Instrument, InstrumentDriver, Prologix};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Instruments of one bench, opened together.
#[derive(Debug)]
pub struct Session {
    bus: Arc<Prologix>,
    lock_in: Sr830Driver,
    function_generator: Agilent33220aDriver,
    synthesizer: Pe11s390Driver,
    frequency_multiplier: f64,
    closed: bool,
}

impl Session {
    /// Open the Prologix port and the synthesizer device file from `config`,
    /// then [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// `DaqError::TransportOpen` when either transport is missing. Callers
    /// treat that as fatal.
    pub async fn open(config: &BenchConfig) -> AppResult<Self> {
        let bus = Prologix::open(&config.bus).await?;
        let synthesizer = Pe11s390Driver::usb(
            config.instruments.synthesizer_path.clone(),
            config.instruments.usb_timeout,
        );
        Self::connect(
            bus,
            synthesizer,
            &config.instruments,
            config.sweep.frequency_multiplier,
        )
        .await
    }

    /// Attach drivers to an open bus and open every instrument.
    ///
    /// Nothing is sent to the GPIB instruments yet; see [`initialize`](Self::initialize).
    pub async fn connect(
        bus: Arc<Prologix>,
        mut synthesizer: Pe11s390Driver,
        instruments: &InstrumentSettings,
        frequency_multiplier: f64,
    ) -> AppResult<Self> {
        let mut lock_in = Sr830Driver::new(
            Instrument::gpib(Arc::clone(&bus), instruments.lock_in_address).with_name("Lock-In"),
        );
        let mut function_generator = Agilent33220aDriver::new(
            Instrument::gpib(Arc::clone(&bus), instruments.function_generator_address)
                .with_name("Function Generator"),
        );
        synthesizer
            .instrument_mut()
            .set_name("Frequency Synthesizer");

        synthesizer.open().await?;
        lock_in.open().await?;
        function_generator.open().await?;

        info!(
            "Session connected: lock-in @{}, function generator @{}, synthesizer {}",
            instruments.lock_in_address,
            instruments.function_generator_address,
            instruments.synthesizer_path.display()
        );

        Ok(Self {
            bus,
            lock_in,
            function_generator,
            synthesizer,
            frequency_multiplier,
            closed: false,
        })
    }

    /// Put every instrument into the bench's measurement state.
    ///
    /// The synthesizer output ends up off, the lock-in is reset onto an
    /// external TTL reference with front-panel outputs following the display,
    /// and the function generator produces a square wave with output and
    /// sweep off.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> AppResult<()> {
        self.synthesizer.initialize_instrument().await?;

        let lock_in = &self.lock_in;
        lock_in.initialize_instrument().await?;
        lock_in.reset().await?;
        lock_in.set_input_grounding(InputGrounding::Ground).await?;
        lock_in.set_input_coupling(InputCoupling::Ac).await?;
        lock_in.set_input_configuration(InputConfiguration::A).await?;
        lock_in.set_notch_filter(NotchFilter::Out).await?;
        lock_in.set_reserve_mode(ReserveMode::LowNoise).await?;
        lock_in.set_reference_source(ReferenceSource::External).await?;
        lock_in
            .set_reference_trigger(ReferenceTrigger::TtlRising)
            .await?;
        lock_in.set_trigger_start(TriggerStart::Off).await?;
        lock_in.set_end_of_buffer(EndOfBuffer::Shot).await?;
        lock_in
            .set_front_panel_output(Channel::One, FrontPanelOutput::Display)
            .await?;
        lock_in
            .set_front_panel_output(Channel::Two, FrontPanelOutput::Display)
            .await?;

        let function_generator = &self.function_generator;
        function_generator.initialize_instrument().await?;
        function_generator.set_waveform(Waveform::Square).await?;
        function_generator.set_output(false).await?;
        function_generator.set_sweep_state(false).await?;

        info!("Bench initialized");
        Ok(())
    }

    /// The shared bus controller.
    pub fn bus(&self) -> &Arc<Prologix> {
        &self.bus
    }

    /// SR830 lock-in amplifier.
    pub fn lock_in(&self) -> &Sr830Driver {
        &self.lock_in
    }

    /// Agilent 33220A driving the chopper.
    pub fn function_generator(&self) -> &Agilent33220aDriver {
        &self.function_generator
    }

    /// PE11S390 feeding the multiplier chain.
    pub fn synthesizer(&self) -> &Pe11s390Driver {
        &self.synthesizer
    }

    /// `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // --- Source ----------------------------------------------------------------

    /// Product of the multipliers between synthesizer and sample.
    pub fn frequency_multiplier(&self) -> f64 {
        self.frequency_multiplier
    }

    /// Change the multiplier used to translate source frequencies.
    pub fn set_frequency_multiplier(&mut self, multiplier: f64) -> AppResult<()> {
        if !(multiplier > 0.0) {
            return Err(DaqError::InvalidParameter(format!(
                "frequency multiplier must be positive, got {}",
                multiplier
            )));
        }
        self.frequency_multiplier = multiplier;
        Ok(())
    }

    /// Source frequency after the multiplier chain, in GHz.
    pub async fn source_frequency(&self) -> AppResult<f64> {
        Ok(self.synthesizer.frequency().await? * self.frequency_multiplier)
    }

    /// Set the source frequency after the multiplier chain, in GHz.
    pub async fn set_source_frequency(&self, ghz: f64) -> AppResult<()> {
        self.synthesizer
            .set_frequency(ghz / self.frequency_multiplier)
            .await
    }

    /// Synthesizer power in dBm.
    pub async fn source_power(&self) -> AppResult<f64> {
        self.synthesizer.power().await
    }

    /// Set the synthesizer power in dBm.
    pub async fn set_source_power(&self, dbm: f64) -> AppResult<()> {
        self.synthesizer.set_power(dbm).await
    }

    /// Synthesizer RF output state.
    pub async fn source_enabled(&self) -> AppResult<bool> {
        self.synthesizer.output().await
    }

    /// Switch the synthesizer RF output.
    pub async fn set_source_enabled(&self, on: bool) -> AppResult<()> {
        self.synthesizer.set_output(on).await
    }

    // --- Chopper ---------------------------------------------------------------

    /// Chopper frequency in kHz.
    pub async fn chopper_frequency(&self) -> AppResult<f64> {
        Ok(self.function_generator.frequency().await? / 1000.0)
    }

    /// Set the chopper frequency in kHz.
    pub async fn set_chopper_frequency(&self, khz: f64) -> AppResult<()> {
        self.function_generator.set_frequency(khz * 1000.0).await
    }

    /// Chopper amplitude in volts.
    pub async fn chopper_amplitude(&self) -> AppResult<f64> {
        self.function_generator.amplitude().await
    }

    /// Set the chopper amplitude in volts.
    pub async fn set_chopper_amplitude(&self, volts: f64) -> AppResult<()> {
        self.function_generator.set_amplitude(volts).await
    }

    /// Switch the chopper drive.
    pub async fn set_chopper_enabled(&self, on: bool) -> AppResult<()> {
        self.function_generator.set_output(on).await
    }

    // --- Lock-in ---------------------------------------------------------------

    /// Round `ms` up to a supported time constant. Returns the one selected.
    pub async fn set_time_constant(&self, ms: f64) -> AppResult<f64> {
        self.lock_in.set_time_constant(ms).await
    }

    /// Round `volts` up to a supported sensitivity. Returns the one selected.
    pub async fn set_sensitivity(&self, volts: f64) -> AppResult<f64> {
        self.lock_in.set_sensitivity(volts).await
    }

    /// Round `db_per_octave` down to a supported slope. Returns the one selected.
    pub async fn set_low_pass_slope(&self, db_per_octave: f64) -> AppResult<f64> {
        self.lock_in.set_low_pass_slope(db_per_octave).await
    }

    /// `(X, Y)` captured at the same instant.
    pub async fn snap_xy(&self) -> AppResult<(f64, f64)> {
        self.lock_in.snap_xy().await
    }

    // --- Teardown --------------------------------------------------------------

    /// Close every instrument. Safe to call more than once.
    ///
    /// All instruments are attempted even when one fails.
    pub async fn close(&mut self) -> AppResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut errors = Vec::new();
        if let Err(e) = self.synthesizer.close().await {
            warn!("Failed to close {}: {}", self.synthesizer.name(), e);
            errors.push(e);
        }
        if let Err(e) = self.lock_in.close().await {
            warn!("Failed to close {}: {}", self.lock_in.name(), e);
            errors.push(e);
        }
        if let Err(e) = self.function_generator.close().await {
            warn!("Failed to close {}: {}", self.function_generator.name(), e);
            errors.push(e);
        }

        if errors.is_empty() {
            info!("Session closed");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}
