use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Commands driving the execution worker of a simulated board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    /// Run the programmed sequence, `repetitions` times or until stopped if 0.
    Run { repetitions: u32 },
    /// Let the current iteration of an endless run finish, then stop.
    FinishIteration,
    Stop,
    Close,
}

pub struct CmdChan {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>, // (msg_num: usize, worker_cmd: WorkerCmd)
    condvar: Arc<Condvar>,
}
impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, WorkerCmd::Stop))),
            condvar: Arc::new(Condvar::new()),
        }
    }
    pub fn new_recvr(&self) -> CmdRecvr {
        // A receiver reacts on messages posted after its creation
        let (msg_num, _cmd_val) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }
    pub fn send(&self, cmd: WorkerCmd) {
        let mut mutex_guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *mutex_guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`CmdChan`]. Only the latest command is kept: a receiver that falls behind
/// skips to it.
pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}
impl CmdRecvr {
    fn take(&mut self, msg_num: usize, cmd_val: WorkerCmd) -> WorkerCmd {
        if msg_num > self.viewed_msg_num + 1 {
            log::debug!(
                "Worker skipped {} commands, latest is {:?}",
                msg_num - self.viewed_msg_num - 1,
                cmd_val
            );
        }
        self.viewed_msg_num = msg_num;
        cmd_val
    }

    /// Blocks until a new command is posted.
    pub fn recv(&mut self) -> WorkerCmd {
        let cmd = self.cmd.clone();
        let mut mutex_guard = cmd.lock();
        while mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut mutex_guard);
        }
        let (msg_num, cmd_val) = *mutex_guard;
        self.take(msg_num, cmd_val)
    }

    /// Waits at most `timeout` for a new command.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<WorkerCmd> {
        let cmd = self.cmd.clone();
        let mut mutex_guard = cmd.lock();
        if mutex_guard.0 == self.viewed_msg_num {
            // Spurious wakeups end the wait early, the caller re-checks its deadline
            self.condvar.wait_for(&mut mutex_guard, timeout);
        }
        if mutex_guard.0 == self.viewed_msg_num {
            return None;
        }
        let (msg_num, cmd_val) = *mutex_guard;
        Some(self.take(msg_num, cmd_val))
    }
}
