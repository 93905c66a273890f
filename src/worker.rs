//! Running the engine on its own thread.
//!
//! A front end holds a [`SimHandle`]; the engine runs on a dedicated thread
//! behind it. The two sides share nothing but the atomic [`Machine`] and a
//! pair of channels:
//!
//! - [`Command`]s flow to the engine. Passive commands (breakpoints, memory
//!   pokes, loads) are applied immediately, even mid-run; active commands
//!   (run and the steps) start execution, or come back as
//!   [`Notification::Busy`] if execution is already underway.
//! - [`Notification`]s flow back: batched console output while running, and
//!   a [`Notification::Done`] when an active command finishes.
//!
//! Reads never need a command: the front end inspects the shared machine
//! directly. Likewise keystrokes and cancellation go through the machine
//! and the cancel flag, so they cut ahead of anything queued in the
//! mailbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tracing::debug;

use crate::isa::{IsaKind, Reg};
use crate::obj::{ObjImage, SourceMap};
use crate::sim::console::{ConsoleSink, FlushPolicy};
use crate::sim::{Machine, Psw, Simulator, StopReason};

/// How often the idle engine retries a budget-deferred console flush.
const FLUSH_RETRY: Duration = Duration::from_millis(10);

/// A request from the front end to the engine.
#[derive(Debug, Clone)]
pub enum Command {
    /// Copy an object image into memory and point the PC at it.
    LoadObj(ObjImage),
    /// Replace the address-to-source-line map.
    SetSourceMap(SourceMap),
    /// Run until the machine stops.
    Run,
    /// Execute one instruction.
    StepIn,
    /// Run until the current frame returns.
    StepOut,
    /// Execute the next instruction, running any call it makes to completion.
    StepOver,
    /// Add a breakpoint.
    SetBreakpoint(u16),
    /// Remove a breakpoint.
    ClearBreakpoint(u16),
    /// Remove every breakpoint.
    ClearAllBreakpoints,
    /// Write one memory cell (with device side effects).
    WriteMem {
        /// The address to write.
        addr: u16,
        /// The word to write there.
        value: u16,
    },
    /// Write one general-purpose register.
    WriteReg {
        /// The register to write.
        reg: Reg,
        /// The word to write there.
        value: u16,
    },
    /// Set the program counter.
    SetPc(u16),
    /// Set the PSW (normalized on write).
    SetPsw(u16),
    /// Retune console flushing. The attached sink and any buffered output
    /// survive the swap.
    SetFlushPolicy(FlushPolicy),
    /// Zero the machine back to its power-on state.
    Reset,
    /// Refill memory and registers with (optionally seeded) random words.
    Randomize {
        /// RNG seed; `None` seeds from entropy.
        seed: Option<u64>,
    },
    /// Stop the engine thread.
    Shutdown,
}

/// A message from the engine to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// An active command finished, and why it stopped.
    ///
    /// Console output held back by the sliding-window flush budget may
    /// still trail this message; the idle engine keeps retrying delivery
    /// until the buffer drains, so the tail arrives without another
    /// command.
    Done(StopReason),
    /// A chunk of console output.
    Console(String),
    /// An active command arrived while one was already executing. The
    /// running operation continues; the new one is discarded.
    Busy,
}

/// Errors surfaced at the handle boundary.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum StateError {
    /// A register number outside 0–7.
    #[error("no such register: R{0}")]
    RegOutOfRange(u8),
    /// The engine thread is gone.
    #[error("engine disconnected")]
    Disconnected,
}

/// Adapts the notification channel into a console sink.
struct NotifySink(Sender<Notification>);
impl ConsoleSink for NotifySink {
    fn deliver(&mut self, chunk: String) {
        let _ = self.0.send(Notification::Console(chunk));
    }
}

/// The engine half: owns the simulator, drains the mailbox.
struct Engine {
    sim: Simulator,
    rx: Receiver<Command>,
    tx: Sender<Notification>,
}

impl Engine {
    fn run(mut self) {
        debug!("engine thread up");
        loop {
            // A budget-deferred flush can leave output behind after the
            // final flush of an operation. Poll while any remains so the
            // tail reaches the front end without waiting for a command.
            let cmd = if self.sim.console_buffered() > 0 {
                match self.rx.recv_timeout(FLUSH_RETRY) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => {
                        self.sim.flush_console();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                let Ok(cmd) = self.rx.recv() else { break };
                cmd
            };
            match cmd {
                Command::Shutdown => break,
                Command::Run | Command::StepIn | Command::StepOut | Command::StepOver => {
                    if !self.execute(cmd) {
                        break;
                    }
                }
                passive => apply_passive(&mut self.sim, passive),
            }
        }
        debug!("engine thread down");
    }

    /// Runs one active command to completion, keeping the mailbox drained
    /// along the way. Returns false if a shutdown arrived mid-run.
    fn execute(&mut self, cmd: Command) -> bool {
        let Engine { sim, rx, tx } = self;
        let mut shutdown = false;
        let mut tripwire = |sim: &mut Simulator| loop {
            match rx.try_recv() {
                Ok(Command::Shutdown) => {
                    shutdown = true;
                    return false;
                }
                Ok(
                    Command::Run | Command::StepIn | Command::StepOut | Command::StepOver,
                ) => {
                    let _ = tx.send(Notification::Busy);
                }
                Ok(passive) => apply_passive(sim, passive),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => {
                    shutdown = true;
                    return false;
                }
            }
        };

        let reason = match cmd {
            Command::Run => sim.run_while(&mut tripwire),
            Command::StepIn => sim.step_in(),
            Command::StepOut => sim.step_out_while(&mut tripwire),
            Command::StepOver => sim.step_over_while(&mut tripwire),
            // Routed here by the caller; nothing else is active.
            _ => return true,
        };
        if shutdown {
            return false;
        }
        let _ = self.tx.send(Notification::Done(reason));
        true
    }
}

/// Applies a passive command to the simulator.
fn apply_passive(sim: &mut Simulator, cmd: Command) {
    match cmd {
        Command::LoadObj(obj) => sim.load_obj(&obj),
        Command::SetSourceMap(map) => sim.set_source_map(map),
        Command::SetBreakpoint(addr) => {
            sim.breakpoints.insert(addr);
        }
        Command::ClearBreakpoint(addr) => {
            sim.breakpoints.remove(&addr);
        }
        Command::ClearAllBreakpoints => sim.breakpoints.clear(),
        Command::WriteMem { addr, value } => sim.write_mem(addr, value),
        Command::WriteReg { reg, value } => sim.machine.reg[reg].set(value),
        Command::SetPc(addr) => sim.machine.pc.set(addr),
        Command::SetPsw(word) => sim.machine.psw.set(Psw::new(word).get()),
        Command::SetFlushPolicy(policy) => sim.set_flush_policy(policy),
        Command::Reset => sim.reset(),
        Command::Randomize { seed } => sim.machine.randomize(seed),
        // Active commands and shutdown are routed by the callers.
        Command::Run
        | Command::StepIn
        | Command::StepOut
        | Command::StepOver
        | Command::Shutdown => {}
    }
}

/// The front-end half: shared machine state plus the channel endpoints.
///
/// Dropping the handle asks the engine to shut down without waiting for it;
/// call [`shutdown`](SimHandle::shutdown) to join the thread.
#[derive(Debug)]
pub struct SimHandle {
    machine: Arc<Machine>,
    tx: Sender<Command>,
    rx: Receiver<Notification>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimHandle {
    /// Spawns an engine thread around a fresh machine.
    pub fn spawn(isa: IsaKind) -> Self {
        let mut sim = Simulator::new(isa);
        let machine = Arc::clone(&sim.machine);
        let cancel = sim.cancel_flag();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (note_tx, note_rx) = crossbeam_channel::unbounded();
        sim.set_console_sink(Box::new(NotifySink(note_tx.clone())));

        let thread = std::thread::spawn(move || {
            Engine {
                sim,
                rx: cmd_rx,
                tx: note_tx,
            }
            .run()
        });

        SimHandle {
            machine,
            tx: cmd_tx,
            rx: note_rx,
            cancel,
            thread: Some(thread),
        }
    }

    /// The shared machine state, readable (and pokeable) at any time.
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Sends a command to the engine.
    pub fn send(&self, cmd: Command) -> Result<(), StateError> {
        self.tx.send(cmd).map_err(|_| StateError::Disconnected)
    }

    /// Writes a register, validating the register number first.
    pub fn write_reg(&self, reg: u8, value: u16) -> Result<(), StateError> {
        let reg = Reg::try_from(reg).map_err(|_| StateError::RegOutOfRange(reg))?;
        self.send(Command::WriteReg { reg, value })
    }

    /// Delivers a keystroke. Bypasses the mailbox: the device register is
    /// shared, so the key is visible to the very next instruction cycle.
    pub fn key(&self, ch: u8) {
        self.machine.post_key(ch);
    }

    /// Asks a running operation to stop at the next cycle boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// The notification stream from the engine.
    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.rx
    }

    /// Stops the engine and joins its thread.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(Command::Shutdown);
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        // Best effort; no join, so dropping never blocks.
        let _ = self.tx.send(Command::Shutdown);
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sim::device::{DDR, MCR};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Collects console output until a `Done` arrives.
    fn wait_done(handle: &SimHandle) -> (StopReason, String) {
        let mut console = String::new();
        loop {
            match handle.notifications().recv_timeout(TIMEOUT) {
                Ok(Notification::Done(reason)) => return (reason, console),
                Ok(Notification::Console(chunk)) => console.push_str(&chunk),
                Ok(Notification::Busy) => panic!("unexpected busy"),
                Err(e) => panic!("no notification: {e}"),
            }
        }
    }

    #[test]
    fn run_to_halt_with_console_output() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        // LD R1,#4 ; STI R1,#4 ; AND R2,R2,#0 ; STI R2,#3 ; filler ;
        // 'H' ; ->DDR ; ->MCR
        let image = ObjImage::new(
            0x3000,
            vec![0x2204, 0xB204, 0x54A0, 0xB403, 0x0000, 0x0048, DDR, MCR],
        );
        handle.send(Command::LoadObj(image)).unwrap();
        handle.send(Command::Run).unwrap();

        let (reason, console) = wait_done(&handle);
        assert_eq!(reason, StopReason::ClockOff);
        assert_eq!(console, "H");
        assert!(!handle.machine().clock_enabled());
        handle.shutdown();
    }

    #[test]
    fn second_run_reports_busy_and_cancel_stops() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        handle
            .send(Command::LoadObj(ObjImage::new(0x3000, vec![0x0FFF])))
            .unwrap();
        handle.send(Command::Run).unwrap();
        handle.send(Command::Run).unwrap();

        assert_eq!(
            handle.notifications().recv_timeout(TIMEOUT).unwrap(),
            Notification::Busy
        );
        handle.cancel();
        let (reason, _) = wait_done(&handle);
        assert_eq!(reason, StopReason::Cancelled);
        handle.shutdown();
    }

    #[test]
    fn breakpoints_apply_through_the_mailbox() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        // AND R0,R0,#0 ; ADD R0,R0,#1 ; BRnzp #-1
        handle
            .send(Command::LoadObj(ObjImage::new(
                0x3000,
                vec![0x5020, 0x1021, 0x0FFF],
            )))
            .unwrap();
        handle.send(Command::SetBreakpoint(0x3002)).unwrap();
        handle.send(Command::Run).unwrap();

        let (reason, _) = wait_done(&handle);
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(handle.machine().pc.get(), 0x3002);
        handle.shutdown();
    }

    #[test]
    fn step_in_executes_exactly_one_instruction() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        handle
            .send(Command::LoadObj(ObjImage::new(
                0x3000,
                vec![0x1021, 0x1021],
            )))
            .unwrap();
        handle.send(Command::StepIn).unwrap();
        let (reason, _) = wait_done(&handle);
        assert_eq!(reason, StopReason::StepDone);
        assert_eq!(handle.machine().pc.get(), 0x3001);
        handle.shutdown();
    }

    #[test]
    fn keystroke_lands_in_the_device_registers() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        handle.key(b'x');
        assert_eq!(handle.machine().mem[crate::sim::device::KBDR].get(), u16::from(b'x'));
        assert_eq!(
            handle.machine().mem[crate::sim::device::KBSR].get() & 0x8000,
            0x8000
        );
        handle.shutdown();
    }

    #[test]
    fn register_writes_are_validated() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        assert_eq!(handle.write_reg(9, 5), Err(StateError::RegOutOfRange(9)));
        handle.write_reg(3, 0xABCD).unwrap();
        // Writes are asynchronous; synchronize on a step completing.
        handle.send(Command::StepIn).unwrap();
        let _ = wait_done(&handle);
        let r3 = Reg::try_from(3).unwrap();
        assert_eq!(handle.machine().reg[r3].get(), 0xABCD);
        handle.shutdown();
    }

    #[test]
    fn deferred_console_tail_arrives_after_done() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        handle
            .send(Command::SetFlushPolicy(FlushPolicy {
                flush_bytes: 1,
                flush_interval: Duration::from_millis(0),
                window: Duration::from_millis(150),
                window_budget: 4,
            }))
            .unwrap();

        // Poke one character into the display register per step; memory is
        // zeroed, so each step executes a never-taken branch. The window
        // budget admits four single-byte chunks and defers the fifth.
        let mut seen = String::new();
        for &ch in b"HELLO" {
            handle
                .send(Command::WriteMem {
                    addr: DDR,
                    value: u16::from(ch),
                })
                .unwrap();
            handle.send(Command::StepIn).unwrap();
            let (reason, chunk) = wait_done(&handle);
            assert_eq!(reason, StopReason::StepDone);
            seen.push_str(&chunk);
        }

        // The deferred tail is delivered while the engine sits idle, with
        // no further commands sent.
        while seen != "HELLO" {
            match handle.notifications().recv_timeout(TIMEOUT).unwrap() {
                Notification::Console(chunk) => seen.push_str(&chunk),
                other => panic!("unexpected notification: {other:?}"),
            }
        }
        handle.shutdown();
    }

    #[test]
    fn shutdown_joins_the_engine_thread() {
        let handle = SimHandle::spawn(IsaKind::Lc);
        handle.send(Command::Run).unwrap();
        // The machine free-runs through uninitialized memory; shutdown must
        // still come back promptly.
        handle.shutdown();
    }
}
