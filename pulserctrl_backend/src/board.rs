//! The pulser board: the vendor boundary of the control backend.
//!
//! ## Overview
//! [`PulserBoard`] lists the primitive operations the FPGA pulser exposes: writing the switching
//! table, selecting and programming DDS channels, and running the table once or in a loop. The
//! server only ever talks to the board through this trait.
//!
//! [`SimulatedBoard`] implements it in-process. Execution happens on a worker thread driven by a
//! [`CmdChan`]: each iteration of the programmed sequence lasts as long as its last switching
//! step. Every call is recorded in a [`BoardLog`] that can be inspected while the server owns the
//! board.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use pulsecompiler_backend::{num_to_hex, TimeResolution};

use crate::error::{PulserError, Result};
use crate::worker_cmd_chan::{CmdChan, CmdRecvr, WorkerCmd};

pub trait PulserBoard: Send {
    /// Writes the switching table, terminator included.
    fn program_board(&mut self, ttl_program: &[u8]) -> Result<()>;
    /// Repetitions of the next looped run, 0 for an endless loop.
    fn set_number_repetitions(&mut self, repetitions: u32) -> Result<()>;
    fn reset_seq_counter(&mut self) -> Result<()>;
    fn reset_ram(&mut self) -> Result<()>;
    fn start_single(&mut self) -> Result<()>;
    fn start_looped(&mut self) -> Result<()>;
    fn stop_single(&mut self) -> Result<()>;
    fn stop_looped(&mut self) -> Result<()>;
    fn is_seq_done(&mut self) -> Result<bool>;
    fn how_many_sequences_done(&mut self) -> Result<u32>;

    /// Drives `channel` from the manual state `state`, ignoring the sequence.
    fn set_manual(&mut self, channel: usize, state: bool) -> Result<()>;
    /// Drives `channel` from the sequence, optionally inverted.
    fn set_auto(&mut self, channel: usize, inversion: bool) -> Result<()>;

    fn initialize_dds(&mut self) -> Result<()>;
    fn reset_all_dds(&mut self) -> Result<()>;
    fn advance_all_dds(&mut self) -> Result<()>;
    fn set_dds_channel(&mut self, address: u8) -> Result<()>;
    /// Writes the word list of the selected DDS channel.
    fn program_dds(&mut self, program: &[u8]) -> Result<()>;

    fn set_mode_normal(&mut self) -> Result<()>;
    fn set_mode_differential(&mut self) -> Result<()>;
    /// Collection time of one normal-mode reading.
    fn set_pmt_count_rate(&mut self, collection_time: Duration) -> Result<()>;
    fn reset_fifo_normal(&mut self) -> Result<()>;
    /// Drains the normal-mode count FIFO, one wire word per reading.
    fn get_normal_counts(&mut self) -> Result<Vec<u8>>;
    fn reset_fifo_readout(&mut self) -> Result<()>;
    /// Drains the readout count FIFO, one wire word per readout.
    fn get_readout_counts(&mut self) -> Result<Vec<u8>>;
    fn reset_fifo_resolved(&mut self) -> Result<()>;
    /// Drains the time-tag FIFO, one wire word per detected photon.
    fn get_resolved_counts(&mut self) -> Result<Vec<u8>>;
    /// Starts sequences `delay_us` after each zero crossing of the mains.
    fn enable_line_trigger(&mut self, delay_us: u32) -> Result<()>;
    fn disable_line_trigger(&mut self) -> Result<()>;
}

/// A call received by a [`SimulatedBoard`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BoardCall {
    ProgramBoard(Vec<u8>),
    SetNumberRepetitions(u32),
    ResetSeqCounter,
    ResetRam,
    StartSingle,
    StartLooped,
    StopSingle,
    StopLooped,
    SetManual(usize, bool),
    SetAuto(usize, bool),
    InitializeDds,
    ResetAllDds,
    AdvanceAllDds,
    SetDdsChannel(u8),
    ProgramDds(Vec<u8>),
    SetModeNormal,
    SetModeDifferential,
    SetPmtCountRate(Duration),
    ResetFifoNormal,
    ResetFifoReadout,
    ResetFifoResolved,
    EnableLineTrigger(u32),
    DisableLineTrigger,
}

/// Shared record of the calls received by a [`SimulatedBoard`].
#[derive(Clone, Default)]
pub struct BoardLog {
    calls: Arc<Mutex<Vec<BoardCall>>>,
}

impl BoardLog {
    fn push(&self, call: BoardCall) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<BoardCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

#[derive(Default)]
struct Fifos {
    normal: Vec<u8>,
    readout: Vec<u8>,
    resolved: Vec<u8>,
}

/// Detector feeding the counter FIFOs of a [`SimulatedBoard`].
#[derive(Clone, Default)]
pub struct PhotonSource {
    fifos: Arc<Mutex<Fifos>>,
}

impl PhotonSource {
    /// Queues a normal-mode reading. `repump_off` marks differential readings taken with the
    /// repump light off.
    pub fn push_count(&self, count: u32, repump_off: bool) {
        let word = (count & !REPUMP_OFF_BIT) | if repump_off { REPUMP_OFF_BIT } else { 0 };
        self.fifos.lock().normal.extend_from_slice(&num_to_hex(word));
    }

    pub fn push_readout(&self, count: u32) {
        self.fifos.lock().readout.extend_from_slice(&num_to_hex(count));
    }

    /// Queues a photon arriving `ticks` time-tag ticks into the sequence.
    pub fn push_timetag(&self, ticks: u32) {
        self.fifos.lock().resolved.extend_from_slice(&num_to_hex(ticks));
    }
}

struct RunState {
    done: bool,
    completed: u32,
}

/// Status bit of a normal-mode reading taken with the repump light off.
pub const REPUMP_OFF_BIT: u32 = 1 << 31;

/// Words of a buffer in the pulser's wire order, the inverse of [`num_to_hex`].
pub fn wire_words(buf: &[u8]) -> impl Iterator<Item = u32> + '_ {
    buf.chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[2], word[3], word[0], word[1]]))
}

/// Last switching step of a wire-format switching table.
fn last_step(ttl_program: &[u8]) -> u32 {
    wire_words(ttl_program).step_by(2).max().unwrap_or(0)
}

fn run_worker(
    mut recvr: CmdRecvr,
    state: Arc<Mutex<RunState>>,
    iteration_time: Arc<Mutex<Duration>>,
) {
    let mut pending = recvr.recv();
    loop {
        let repetitions = match pending {
            WorkerCmd::Run { repetitions } => repetitions,
            WorkerCmd::Close => return,
            WorkerCmd::Stop | WorkerCmd::FinishIteration => {
                pending = recvr.recv();
                continue;
            }
        };
        let duration = *iteration_time.lock();
        let mut last_iteration = false;
        let mut next = None;
        'run: loop {
            let deadline = Instant::now() + duration;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match recvr.recv_timeout(deadline - now) {
                    Some(WorkerCmd::FinishIteration) => last_iteration = true,
                    Some(cmd @ (WorkerCmd::Stop | WorkerCmd::Close | WorkerCmd::Run { .. })) => {
                        next = Some(cmd);
                        break 'run;
                    }
                    None => {}
                }
            }
            let mut run = state.lock();
            run.completed += 1;
            if last_iteration || (repetitions != 0 && run.completed >= repetitions) {
                run.done = true;
                break;
            }
        }
        log::debug!("Simulated run ended after {} iterations", state.lock().completed);
        pending = match next {
            Some(cmd) => cmd,
            None => recvr.recv(),
        };
    }
}

/// In-process pulser executing sequences in real time on a worker thread.
pub struct SimulatedBoard {
    resolution: TimeResolution,
    log: BoardLog,
    cmd_chan: CmdChan,
    state: Arc<Mutex<RunState>>,
    iteration_time: Arc<Mutex<Duration>>,
    repetitions: u32,
    looping: bool,
    photons: PhotonSource,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedBoard {
    pub fn new(resolution: TimeResolution) -> Self {
        let cmd_chan = CmdChan::new();
        let recvr = cmd_chan.new_recvr();
        let state = Arc::new(Mutex::new(RunState {
            done: true,
            completed: 0,
        }));
        let iteration_time = Arc::new(Mutex::new(Duration::ZERO));
        let worker = {
            let state = state.clone();
            let iteration_time = iteration_time.clone();
            thread::spawn(move || run_worker(recvr, state, iteration_time))
        };
        Self {
            resolution,
            log: BoardLog::default(),
            cmd_chan,
            state,
            iteration_time,
            repetitions: 0,
            looping: false,
            photons: PhotonSource::default(),
            worker: Some(worker),
        }
    }

    pub fn log(&self) -> BoardLog {
        self.log.clone()
    }

    pub fn photons(&self) -> PhotonSource {
        self.photons.clone()
    }

    fn run(&mut self, repetitions: u32) {
        self.state.lock().done = false;
        self.cmd_chan.send(WorkerCmd::Run { repetitions });
    }

    // An interrupted run counts as done
    fn interrupt(&mut self) {
        self.state.lock().done = true;
        self.cmd_chan.send(WorkerCmd::Stop);
    }
}

impl PulserBoard for SimulatedBoard {
    fn program_board(&mut self, ttl_program: &[u8]) -> Result<()> {
        if ttl_program.len() % 8 != 0 {
            return Err(PulserError::Board(format!(
                "switching table of {} bytes is not a whole number of rows",
                ttl_program.len()
            )));
        }
        let steps = last_step(ttl_program) as i64;
        let picos = self.resolution.to_time(steps).as_ps() as u64;
        *self.iteration_time.lock() = Duration::from_nanos(picos / 1000);
        self.log.push(BoardCall::ProgramBoard(ttl_program.to_vec()));
        Ok(())
    }
    fn set_number_repetitions(&mut self, repetitions: u32) -> Result<()> {
        self.repetitions = repetitions;
        self.log.push(BoardCall::SetNumberRepetitions(repetitions));
        Ok(())
    }
    fn reset_seq_counter(&mut self) -> Result<()> {
        self.state.lock().completed = 0;
        self.log.push(BoardCall::ResetSeqCounter);
        Ok(())
    }
    fn reset_ram(&mut self) -> Result<()> {
        self.log.push(BoardCall::ResetRam);
        Ok(())
    }
    fn start_single(&mut self) -> Result<()> {
        if self.looping && !self.state.lock().done {
            self.cmd_chan.send(WorkerCmd::FinishIteration);
        } else {
            self.looping = false;
            self.run(1);
        }
        self.log.push(BoardCall::StartSingle);
        Ok(())
    }
    fn start_looped(&mut self) -> Result<()> {
        self.looping = true;
        self.run(self.repetitions);
        self.log.push(BoardCall::StartLooped);
        Ok(())
    }
    fn stop_single(&mut self) -> Result<()> {
        self.interrupt();
        self.log.push(BoardCall::StopSingle);
        Ok(())
    }
    fn stop_looped(&mut self) -> Result<()> {
        self.looping = false;
        self.interrupt();
        self.log.push(BoardCall::StopLooped);
        Ok(())
    }
    fn is_seq_done(&mut self) -> Result<bool> {
        Ok(self.state.lock().done)
    }
    fn how_many_sequences_done(&mut self) -> Result<u32> {
        Ok(self.state.lock().completed)
    }
    fn set_manual(&mut self, channel: usize, state: bool) -> Result<()> {
        self.log.push(BoardCall::SetManual(channel, state));
        Ok(())
    }
    fn set_auto(&mut self, channel: usize, inversion: bool) -> Result<()> {
        self.log.push(BoardCall::SetAuto(channel, inversion));
        Ok(())
    }
    fn initialize_dds(&mut self) -> Result<()> {
        self.log.push(BoardCall::InitializeDds);
        Ok(())
    }
    fn reset_all_dds(&mut self) -> Result<()> {
        self.log.push(BoardCall::ResetAllDds);
        Ok(())
    }
    fn advance_all_dds(&mut self) -> Result<()> {
        self.log.push(BoardCall::AdvanceAllDds);
        Ok(())
    }
    fn set_dds_channel(&mut self, address: u8) -> Result<()> {
        self.log.push(BoardCall::SetDdsChannel(address));
        Ok(())
    }
    fn program_dds(&mut self, program: &[u8]) -> Result<()> {
        self.log.push(BoardCall::ProgramDds(program.to_vec()));
        Ok(())
    }
    fn set_mode_normal(&mut self) -> Result<()> {
        self.log.push(BoardCall::SetModeNormal);
        Ok(())
    }
    fn set_mode_differential(&mut self) -> Result<()> {
        self.log.push(BoardCall::SetModeDifferential);
        Ok(())
    }
    fn set_pmt_count_rate(&mut self, collection_time: Duration) -> Result<()> {
        self.log.push(BoardCall::SetPmtCountRate(collection_time));
        Ok(())
    }
    fn reset_fifo_normal(&mut self) -> Result<()> {
        self.photons.fifos.lock().normal.clear();
        self.log.push(BoardCall::ResetFifoNormal);
        Ok(())
    }
    fn get_normal_counts(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.photons.fifos.lock().normal))
    }
    fn reset_fifo_readout(&mut self) -> Result<()> {
        self.photons.fifos.lock().readout.clear();
        self.log.push(BoardCall::ResetFifoReadout);
        Ok(())
    }
    fn get_readout_counts(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.photons.fifos.lock().readout))
    }
    fn reset_fifo_resolved(&mut self) -> Result<()> {
        self.photons.fifos.lock().resolved.clear();
        self.log.push(BoardCall::ResetFifoResolved);
        Ok(())
    }
    fn get_resolved_counts(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.photons.fifos.lock().resolved))
    }
    fn enable_line_trigger(&mut self, delay_us: u32) -> Result<()> {
        self.log.push(BoardCall::EnableLineTrigger(delay_us));
        Ok(())
    }
    fn disable_line_trigger(&mut self) -> Result<()> {
        self.log.push(BoardCall::DisableLineTrigger);
        Ok(())
    }
}

impl Drop for SimulatedBoard {
    fn drop(&mut self) {
        self.cmd_chan.send(WorkerCmd::Close);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Simulated board worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn program(last: u32) -> Vec<u8> {
        [0, 0, last, 1, 0, 0].into_iter().flat_map(num_to_hex).collect()
    }

    fn wait_done(board: &mut SimulatedBoard) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !board.is_seq_done().unwrap() {
            assert!(Instant::now() < deadline, "board never finished");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn reads_last_step() {
        assert_eq!(last_step(&program(0x0001_0002)), 0x0001_0002);
        assert_eq!(last_step(&[]), 0);
    }

    #[test]
    fn runs_repetitions() {
        let mut board = SimulatedBoard::new(TimeResolution::FORTY_NS);
        // 25_000 steps of 40 ns: 1 ms per iteration
        board.program_board(&program(25_000)).unwrap();
        board.set_number_repetitions(3).unwrap();
        board.reset_seq_counter().unwrap();
        board.start_looped().unwrap();
        assert!(!board.is_seq_done().unwrap());
        wait_done(&mut board);
        assert_eq!(board.how_many_sequences_done().unwrap(), 3);
    }

    #[test]
    fn finishes_endless_loop() {
        let mut board = SimulatedBoard::new(TimeResolution::FORTY_NS);
        board.program_board(&program(25_000)).unwrap();
        board.set_number_repetitions(0).unwrap();
        board.start_looped().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(!board.is_seq_done().unwrap());
        board.start_single().unwrap();
        wait_done(&mut board);
        assert!(board.how_many_sequences_done().unwrap() >= 1);
        assert!(board.log().calls().contains(&BoardCall::StartLooped));
    }

    #[test]
    fn fifos_drain_on_read() {
        let mut board = SimulatedBoard::new(TimeResolution::FORTY_NS);
        let photons = board.photons();
        photons.push_count(1200, true);
        photons.push_readout(7);
        photons.push_readout(0x0001_0003);
        let normal: Vec<_> = wire_words(&board.get_normal_counts().unwrap()).collect();
        assert_eq!(normal, vec![REPUMP_OFF_BIT | 1200]);
        assert!(board.get_normal_counts().unwrap().is_empty());

        board.reset_fifo_readout().unwrap();
        assert!(board.get_readout_counts().unwrap().is_empty());
        photons.push_readout(5);
        // high half-word first, each half little-endian
        assert_eq!(board.get_readout_counts().unwrap(), vec![0, 0, 5, 0]);
    }

    #[test]
    fn stop_interrupts_run() {
        let mut board = SimulatedBoard::new(TimeResolution::FORTY_NS);
        // 1 s per iteration
        board.program_board(&program(25_000_000)).unwrap();
        board.start_single().unwrap();
        board.stop_single().unwrap();
        assert!(board.is_seq_done().unwrap());
        thread::sleep(Duration::from_millis(20));
        assert!(board.is_seq_done().unwrap());
        assert_eq!(board.how_many_sequences_done().unwrap(), 0);
    }
}
