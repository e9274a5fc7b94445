//! Python bindings, built with the `python` feature.
//!
//! ```python
//! from pulsecompiler_backend import PulseCompiler
//!
//! comp = PulseCompiler(open("pulser.json").read())
//! comp.add_ttl_pulse("866DP", 1e-6, 5e-6)
//! comp.compile()
//! assert comp.switch_count() == 2
//! ```

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyBytes;

use crate::compiler::SequenceCompiler;
use crate::config::HardwareConfig;
use crate::error::Error;
use crate::program::CompiledSequence;
use crate::pulse::{DdsPulse, TtlPulse};
use crate::units::{Decibel, Frequency, Phase, Power, Time};

fn to_py_err(err: Error) -> PyErr {
    PyValueError::new_err(err.to_string())
}

/// Collects pulses with times in seconds and compiles them on demand. Pulses are validated
/// as they are added.
#[pyclass]
pub struct PulseCompiler {
    config: HardwareConfig,
    ttl_pulses: Vec<TtlPulse>,
    dds_pulses: Vec<DdsPulse>,
    lengths: Vec<Time>,
    compiled: Option<CompiledSequence>,
}

impl PulseCompiler {
    fn compiler(&self) -> Result<SequenceCompiler, Error> {
        let mut compiler = SequenceCompiler::new(&self.config);
        compiler.add_ttl_pulses(&self.ttl_pulses)?;
        compiler.add_dds_pulses(&self.dds_pulses)?;
        for length in &self.lengths {
            compiler.extend_sequence_length(*length)?;
        }
        Ok(compiler)
    }

    fn compiled(&self) -> PyResult<&CompiledSequence> {
        self.compiled
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("Sequence has not been compiled"))
    }
}

#[pymethods]
impl PulseCompiler {
    /// Builds a compiler from a JSON hardware description.
    #[new]
    pub fn new(config_json: &str) -> PyResult<Self> {
        let config = HardwareConfig::from_json_str(config_json).map_err(to_py_err)?;
        Ok(Self {
            config,
            ttl_pulses: Vec::new(),
            dds_pulses: Vec::new(),
            lengths: Vec::new(),
            compiled: None,
        })
    }

    pub fn add_ttl_pulse(&mut self, channel: &str, start: f64, duration: f64) -> PyResult<()> {
        let pulse = TtlPulse::new(channel, Time::from_secs(start), Time::from_secs(duration));
        let mut compiler = self.compiler().map_err(to_py_err)?;
        compiler.add_ttl_pulse(&pulse).map_err(to_py_err)?;
        self.ttl_pulses.push(pulse);
        self.compiled = None;
        Ok(())
    }

    #[pyo3(signature = (
        channel, start, duration, frequency, amplitude,
        phase=0., ramp_rate=0., amp_ramp_rate=0.
    ))]
    pub fn add_dds_pulse(
        &mut self,
        channel: &str,
        start: f64,
        duration: f64,
        frequency: f64,
        amplitude: f64,
        phase: f64,
        ramp_rate: f64,
        amp_ramp_rate: f64,
    ) -> PyResult<()> {
        let pulse = DdsPulse::new(
            channel,
            Time::from_secs(start),
            Time::from_secs(duration),
            Frequency::new(frequency),
            Power::new(amplitude),
        )
        .with_phase(Phase::new(phase))
        .with_ramp_rate(Frequency::new(ramp_rate))
        .with_amp_ramp_rate(Decibel::new(amp_ramp_rate));
        let mut compiler = self.compiler().map_err(to_py_err)?;
        compiler.add_dds_pulse(&pulse).map_err(to_py_err)?;
        self.dds_pulses.push(pulse);
        self.compiled = None;
        Ok(())
    }

    pub fn extend_sequence_length(&mut self, length: f64) -> PyResult<()> {
        let length = Time::from_secs(length);
        let mut compiler = self.compiler().map_err(to_py_err)?;
        compiler.extend_sequence_length(length).map_err(to_py_err)?;
        self.lengths.push(length);
        self.compiled = None;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.ttl_pulses.clear();
        self.dds_pulses.clear();
        self.lengths.clear();
        self.compiled = None;
    }

    pub fn compile(&mut self) -> PyResult<()> {
        let compiled = self.compiler().and_then(|c| c.compile()).map_err(to_py_err)?;
        self.compiled = Some(compiled);
        Ok(())
    }

    pub fn switch_count(&self) -> PyResult<usize> {
        Ok(self.compiled()?.switch_count())
    }

    pub fn ttl_program(&self, py: Python) -> PyResult<PyObject> {
        let bytes = self.compiled()?.ttl_program_bytes();
        Ok(PyBytes::new(py, &bytes).to_object(py))
    }

    /// Channel states as a `(steps, channels)` array of 0 and 1.
    pub fn ttl_states(&self, py: Python) -> PyResult<PyObject> {
        let states = self.compiled()?.ttl_states();
        Ok(numpy::PyArray::from_array(py, &states).to_object(py))
    }

    pub fn dds_program(&self, channel: &str, py: Python) -> PyResult<Option<PyObject>> {
        let program = self.compiled()?.dds_program(channel);
        Ok(program.map(|p| PyBytes::new(py, &p.to_bytes()).to_object(py)))
    }

    /// `(time in seconds, channel states)` per switching step.
    pub fn human_readable_ttl(&self) -> PyResult<Vec<(f64, String)>> {
        let rows = self.compiled()?.human_readable_ttl();
        Ok(rows.into_iter().map(|(t, bits)| (t.as_secs(), bits)).collect())
    }

    /// `(channel, frequency in MHz, amplitude in dBm)` per programmed DDS word.
    pub fn human_readable_dds(&self) -> PyResult<Vec<(String, f64, f64)>> {
        let rows = self.compiled()?.human_readable_dds();
        Ok(rows
            .into_iter()
            .map(|(name, freq, ampl)| (name, freq.value(), ampl.value()))
            .collect())
    }
}

#[pymodule]
fn pulsecompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PulseCompiler>()?;
    Ok(())
}
