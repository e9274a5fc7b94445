//! Output of the compiler: the switching table and the DDS word lists, ready to be written to a
//! pulser.
//!
//! ## TTL program
//! The switching table has one row per distinct switching step, the first row always at step 0.
//! Each row holds the state (0 or 1) of every channel from that step until the next row. On the
//! wire, a row is two 32-bit numbers, the step and the channel word (bit `n` set when channel `n`
//! is high), and the table ends with two zero numbers. Each number is written as its upper 16 bits
//! followed by its lower 16 bits, both little-endian:
//! ```
//! use pulsecompiler_backend::program::num_to_hex;
//!
//! assert_eq!(num_to_hex(0x0102_0304), [0x02, 0x01, 0x04, 0x03]);
//! ```
//!
//! ## DDS program
//! One word list per DDS channel: the state before the first DDS switch, then the state after each
//! DDS switching step of the sequence. The board moves to its next word on every `AdvanceDDS`
//! strobe and rewinds on `ResetDDS`.

use indexmap::IndexMap;
use ndarray::{Array2, ArrayView2};

use crate::config::DdsChannelConfig;
use crate::dds::{DdsWord, DDS_TERMINATOR};
use crate::units::{Frequency, Power, Time};
use crate::utils::TimeResolution;

/// Wire representation of a 32-bit table entry.
pub fn num_to_hex(number: u32) -> [u8; 4] {
    let [b0, b1, b2, b3] = number.to_le_bytes();
    [b2, b3, b0, b1]
}

/// Word list of one DDS channel, in programming order.
#[derive(Clone, Debug, PartialEq)]
pub struct DdsProgram {
    channel: DdsChannelConfig,
    words: Vec<DdsWord>,
}

impl DdsProgram {
    pub(crate) fn new(channel: DdsChannelConfig, words: Vec<DdsWord>) -> Self {
        Self { channel, words }
    }

    pub fn name(&self) -> &str {
        &self.channel.name
    }
    pub fn address(&self) -> u8 {
        self.channel.address
    }
    /// Remote server programming this channel, if it is not local to the pulser.
    pub fn remote(&self) -> Option<&str> {
        self.channel.remote.as_deref()
    }
    pub fn words(&self) -> &[DdsWord] {
        &self.words
    }

    /// Words in board byte order followed by the terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 * self.words.len() + DDS_TERMINATOR.len());
        for word in &self.words {
            buf.extend_from_slice(&word.to_bytes());
        }
        buf.extend_from_slice(&DDS_TERMINATOR);
        buf
    }

    /// Frequency and amplitude of every word.
    pub fn human_readable(&self) -> Vec<(Frequency, Power)> {
        self.words
            .iter()
            .map(|word| (word.frequency(&self.channel), word.amplitude(&self.channel)))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct CompiledSequence {
    resolution: TimeResolution,
    /// Channel names indexed by channel number, empty for unassigned numbers.
    channel_names: Vec<String>,
    steps: Vec<i64>,
    states: Array2<u8>,
    dds_programs: IndexMap<String, DdsProgram>,
    switch_count: usize,
}

impl CompiledSequence {
    pub(crate) fn new(
        resolution: TimeResolution,
        channel_names: Vec<String>,
        steps: Vec<i64>,
        states: Array2<u8>,
        dds_programs: IndexMap<String, DdsProgram>,
        switch_count: usize,
    ) -> Self {
        assert_eq!(steps.len(), states.nrows());
        assert_eq!(channel_names.len(), states.ncols());
        Self {
            resolution,
            channel_names,
            steps,
            states,
            dds_programs,
            switch_count,
        }
    }

    pub fn time_resolution(&self) -> TimeResolution {
        self.resolution
    }

    /// Distinct switching steps, ascending, starting at 0.
    pub fn steps(&self) -> &[i64] {
        &self.steps
    }

    /// Channel states, one row per entry of [`CompiledSequence::steps`] and one column per
    /// channel number.
    pub fn ttl_states(&self) -> ArrayView2<u8> {
        self.states.view()
    }

    /// Number of switches charged against the pulser's capacity.
    pub fn switch_count(&self) -> usize {
        self.switch_count
    }

    /// Time of the last switching step.
    pub fn duration(&self) -> Time {
        self.resolution
            .to_time(self.steps.last().copied().unwrap_or(0))
    }

    /// State of the channel called `name` over `[steps[i], steps[i + 1])`, for every row `i`.
    pub fn channel_states(&self, name: &str) -> Option<Vec<u8>> {
        let column = self.channel_names.iter().position(|n| n == name)?;
        Some(self.states.column(column).to_vec())
    }

    /// Rows of the switching table as `(step, channel word)`.
    pub fn ttl_program(&self) -> Vec<(u32, u32)> {
        self.steps
            .iter()
            .zip(self.states.rows())
            .map(|(&step, row)| {
                let word = row
                    .iter()
                    .enumerate()
                    .fold(0u32, |word, (chan, &state)| word | (state as u32) << chan);
                // steps fit in u32, checked when the configuration is built
                (step as u32, word)
            })
            .collect()
    }

    /// Switching table in wire format, terminator included.
    pub fn ttl_program_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * (self.steps.len() + 1));
        for (step, word) in self.ttl_program() {
            buf.extend_from_slice(&num_to_hex(step));
            buf.extend_from_slice(&num_to_hex(word));
        }
        buf.extend_from_slice(&num_to_hex(0));
        buf.extend_from_slice(&num_to_hex(0));
        buf
    }

    /// Switching table as `(time, states)`, where `states` has one `'0'`/`'1'` character per
    /// channel, channel 0 first.
    pub fn human_readable_ttl(&self) -> Vec<(Time, String)> {
        self.steps
            .iter()
            .zip(self.states.rows())
            .map(|(&step, row)| {
                let bits = row
                    .iter()
                    .map(|&state| if state == 0 { '0' } else { '1' })
                    .collect();
                (self.resolution.to_time(step), bits)
            })
            .collect()
    }

    /// Every programmed DDS word as `(channel, frequency, amplitude)`, channel by channel.
    pub fn human_readable_dds(&self) -> Vec<(String, Frequency, Power)> {
        self.dds_programs
            .values()
            .flat_map(|program| {
                program
                    .human_readable()
                    .into_iter()
                    .map(|(freq, ampl)| (program.name().to_string(), freq, ampl))
            })
            .collect()
    }

    pub fn has_dds(&self) -> bool {
        !self.dds_programs.is_empty()
    }

    pub fn dds_programs(&self) -> &IndexMap<String, DdsProgram> {
        &self.dds_programs
    }

    pub fn dds_program(&self, name: &str) -> Option<&DdsProgram> {
        self.dds_programs.get(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Range;
    use ndarray::array;

    fn compiled() -> CompiledSequence {
        CompiledSequence::new(
            TimeResolution::FORTY_NS,
            vec!["a".to_string(), String::new(), "c".to_string()],
            vec![0, 25, 0x0001_0002],
            array![[0, 0, 0], [1, 0, 1], [0, 0, 1]],
            IndexMap::new(),
            4,
        )
    }

    #[test]
    fn ttl_rows() {
        let seq = compiled();
        assert_eq!(seq.ttl_program(), vec![(0, 0), (25, 0b101), (0x0001_0002, 0b100)]);
        assert_eq!(seq.channel_states("c"), Some(vec![0, 1, 1]));
        assert_eq!(seq.channel_states("b"), None);
        assert_eq!(seq.duration(), Time::from_ps(0x0001_0002 * 40_000));
    }

    #[test]
    fn ttl_bytes() {
        let bytes = compiled().ttl_program_bytes();
        assert_eq!(bytes.len(), 4 * 8);
        assert_eq!(&bytes[8..16], &[0, 0, 25, 0, 0, 0, 5, 0]);
        assert_eq!(&bytes[16..20], &[1, 0, 2, 0]);
        assert!(bytes[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn human_readable() {
        let rows = compiled().human_readable_ttl();
        assert_eq!(rows[1], (Time::from_us(1.), "101".to_string()));
    }

    #[test]
    fn dds_bytes() {
        let channel = DdsChannelConfig::new(
            0,
            Range::new(0., 800.),
            Range::new(-48., 6.),
            Frequency::new(100.),
            Power::new(-48.),
        );
        let program = DdsProgram::new(channel, vec![DdsWord(0), DdsWord(0xFFFF << 64)]);
        let bytes = program.to_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[18..20], &[0xFF, 0xFF]);
        assert_eq!(&bytes[32..], &DDS_TERMINATOR);
        let readable = program.human_readable();
        assert_eq!(readable[0], (Frequency::new(0.), Power::new(-48.)));
        assert_eq!(readable[1].1, Power::new(6.));
    }
}
