//! Single-vCPU run loop.
//!
//! The loop alternates strictly between guest and host: one resume call,
//! then one exit fully handled on the host, then the next resume. It stops
//! on a clean halt or on the first fatal error.

use std::fmt;

use log::{error, info, trace, warn};

use crate::error::{Error, Result};
use crate::exit::{ExitAction, ExitHandler};

/// Something the run loop can drive: a vCPU plus the memory it runs in.
pub trait Machine {
    /// Run the guest until its next exit and hand that exit to `handler`.
    fn resume(&mut self, handler: &mut dyn ExitHandler) -> Result<ExitAction>;

    /// Log the current register state, plus the top of the stack if asked.
    fn dump_state(&mut self, include_stack: bool) -> Result<()>;
}

/// Run loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not started yet.
    Idle,
    /// The guest is being resumed.
    Running,
    /// The guest executed `HLT`.
    Halted,
    /// A fatal error ended the run.
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => write!(f, "idle"),
            RunState::Running => write!(f, "running"),
            RunState::Halted => write!(f, "halted"),
            RunState::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Number of resume calls issued, including the one that halted.
    pub resumes: u64,
    /// Final state; always [`RunState::Halted`] for a successful run.
    pub state: RunState,
}

/// Drives a [`Machine`] until it halts.
#[derive(Debug)]
pub struct RunLoop {
    trace_exits: bool,
    dump_stack: bool,
    state: RunState,
    resumes: u64,
}

impl RunLoop {
    /// Create a run loop. `trace_exits` dumps registers after every handled
    /// exit; `dump_stack` adds the stack to the final dump.
    pub fn new(trace_exits: bool, dump_stack: bool) -> Self {
        Self {
            trace_exits,
            dump_stack,
            state: RunState::Idle,
            resumes: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Resume calls issued so far.
    pub fn resumes(&self) -> u64 {
        self.resumes
    }

    /// Resume `machine` until it halts or fails.
    ///
    /// A guest that never halts and never faults keeps this running forever.
    pub fn run<M: Machine + ?Sized>(
        &mut self,
        machine: &mut M,
        handler: &mut dyn ExitHandler,
    ) -> Result<RunSummary> {
        self.state = RunState::Running;
        info!("starting run loop");

        loop {
            self.resumes += 1;
            trace!("KVM_RUN #{}", self.resumes);

            match machine.resume(handler) {
                Ok(ExitAction::Continue) => {
                    if self.trace_exits {
                        machine.dump_state(false)?;
                    }
                }
                Ok(ExitAction::Halt) => {
                    self.state = RunState::Halted;
                    info!("guest halted after {} resume call(s)", self.resumes);
                    if let Err(dump_err) = machine.dump_state(self.dump_stack) {
                        warn!("could not dump guest state: {dump_err}");
                    }
                    return Ok(RunSummary {
                        resumes: self.resumes,
                        state: self.state,
                    });
                }
                Err(e) => {
                    self.state = RunState::Failed;
                    error!("run loop failed after {} resume call(s)", self.resumes);
                    if e.is_guest_fatal() {
                        let with_stack =
                            self.dump_stack && matches!(e, Error::InternalError { .. });
                        if let Err(dump_err) = machine.dump_state(with_stack) {
                            warn!("could not dump guest state: {dump_err}");
                        }
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::{IoDirection, VcpuExit};
    use std::collections::VecDeque;

    enum Step {
        Hlt,
        SerialOut(u8),
        MmioRead,
        InternalError,
        UnknownExit(u32),
    }

    /// Scripted machine: each resume replays the next step.
    struct FakeMachine {
        script: VecDeque<Step>,
        dumps: Vec<bool>,
        mmio_values: Vec<u8>,
        fail_dumps: bool,
    }

    impl FakeMachine {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: script.into(),
                dumps: Vec::new(),
                mmio_values: Vec::new(),
                fail_dumps: false,
            }
        }
    }

    impl Machine for FakeMachine {
        fn resume(&mut self, handler: &mut dyn ExitHandler) -> Result<ExitAction> {
            match self.script.pop_front().expect("script exhausted") {
                Step::Hlt => handler.handle_exit(VcpuExit::Hlt),
                Step::SerialOut(byte) => {
                    let mut data = [byte];
                    handler.handle_exit(VcpuExit::Io {
                        direction: IoDirection::Out,
                        port: 0x3f8,
                        size: 1,
                        count: 1,
                        data: &mut data,
                    })
                }
                Step::MmioRead => {
                    let mut data = [0u8];
                    let action = handler.handle_exit(VcpuExit::MmioRead {
                        addr: 0x1000_0000,
                        data: &mut data,
                    });
                    self.mmio_values.push(data[0]);
                    action
                }
                Step::InternalError => handler.handle_exit(VcpuExit::InternalError { suberror: 1 }),
                Step::UnknownExit(reason) => handler.handle_exit(VcpuExit::Unknown(reason)),
            }
        }

        fn dump_state(&mut self, include_stack: bool) -> Result<()> {
            self.dumps.push(include_stack);
            if self.fail_dumps {
                return Err(Error::NoSuchVcpu(0));
            }
            Ok(())
        }
    }

    fn dispatcher() -> (crate::device::ExitDispatcher, crate::device::serial::tests::TestWriter) {
        let writer = crate::device::serial::tests::TestWriter::default();
        let serial = crate::device::Serial::with_output(Box::new(writer.clone()));
        (crate::device::ExitDispatcher::with_serial(serial), writer)
    }

    #[test]
    fn test_single_halt() {
        let (mut handler, _) = dispatcher();
        let mut machine = FakeMachine::new(vec![Step::Hlt]);
        let mut run_loop = RunLoop::new(false, true);

        let summary = run_loop.run(&mut machine, &mut handler).unwrap();
        assert_eq!(summary.resumes, 1);
        assert_eq!(summary.state, RunState::Halted);
        assert_eq!(machine.dumps, vec![true]);
    }

    #[test]
    fn test_halt_survives_failed_dump() {
        let (mut handler, _) = dispatcher();
        let mut machine = FakeMachine::new(vec![Step::Hlt]);
        machine.fail_dumps = true;
        let mut run_loop = RunLoop::new(false, true);

        let summary = run_loop.run(&mut machine, &mut handler).unwrap();
        assert_eq!(summary.state, RunState::Halted);
        assert_eq!(machine.dumps, vec![true]);
    }

    #[test]
    fn test_serial_then_halt() {
        let (mut handler, writer) = dispatcher();
        let mut machine = FakeMachine::new(vec![Step::SerialOut(b'A'), Step::Hlt]);
        let mut run_loop = RunLoop::new(false, false);

        let summary = run_loop.run(&mut machine, &mut handler).unwrap();
        assert_eq!(summary.resumes, 2);
        assert_eq!(&*writer.data.lock().unwrap(), b"A");
        assert_eq!(handler.stats().serial_bytes, 1);
        assert_eq!(machine.dumps, vec![false]);
    }

    #[test]
    fn test_mmio_read_does_not_stop_the_loop() {
        let (mut handler, _) = dispatcher();
        let mut machine = FakeMachine::new(vec![Step::MmioRead, Step::MmioRead, Step::Hlt]);
        let mut run_loop = RunLoop::new(true, true);

        let summary = run_loop.run(&mut machine, &mut handler).unwrap();
        assert_eq!(summary.resumes, 3);
        assert_eq!(machine.mmio_values, vec![0x12, 0x12]);
        // one trace dump per handled exit, then the final dump
        assert_eq!(machine.dumps, vec![false, false, true]);
    }

    #[test]
    fn test_unknown_exit_is_fatal() {
        let (mut handler, _) = dispatcher();
        let mut machine = FakeMachine::new(vec![Step::SerialOut(b'x'), Step::UnknownExit(0x8)]);
        let mut run_loop = RunLoop::new(false, true);

        let err = run_loop.run(&mut machine, &mut handler).unwrap_err();
        assert!(matches!(err, Error::UnhandledExit { reason: 0x8 }));
        assert_eq!(run_loop.state(), RunState::Failed);
        assert_eq!(run_loop.resumes(), 2);
        assert_eq!(machine.dumps, vec![false]);
    }

    #[test]
    fn test_internal_error_dumps_stack() {
        let (mut handler, _) = dispatcher();
        let mut machine = FakeMachine::new(vec![Step::InternalError]);
        let mut run_loop = RunLoop::new(false, true);

        assert!(run_loop.run(&mut machine, &mut handler).is_err());
        assert_eq!(machine.dumps, vec![true]);
        assert_eq!(RunState::Failed.to_string(), "failed");
    }
}
