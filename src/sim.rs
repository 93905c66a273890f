//! The execution engine: machine state, the instruction cycle, traps and
//! interrupts, and debugger-grade run control.
//!
//! [`Machine`] is the architectural state (memory, registers, PC, PSW, the
//! shadow stack pointers, and the interrupt latch), built entirely out of
//! atomic [`Word`]s so it can sit behind an [`Arc`] and be inspected or
//! poked from another thread while the engine runs.
//!
//! [`Simulator`] wraps a machine with everything that belongs to the engine
//! thread alone: the ISA policy, breakpoints, the cancellation flag, and the
//! buffered console. Its run-control surface is:
//!
//! | Operation                   | Stops when                                |
//! |-----------------------------|-------------------------------------------|
//! | [`run`](Simulator::run)     | clock off, breakpoint, cancel, tripwire   |
//! | [`step_in`](Simulator::step_in) | one instruction has executed          |
//! | [`step_out`](Simulator::step_out) | the current frame has returned      |
//! | [`step_over`](Simulator::step_over) | the next instruction (and any call it makes) has finished |
//!
//! Every operation re-enables the clock on entry, so stepping through a
//! `HALT` and then stepping again resumes the machine instead of wedging.

pub mod console;
pub mod device;
pub mod mem;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::isa::reg_consts::{R6, R7};
use crate::isa::{Exception, FlowClass, ImmOrReg, IsaKind, Reg};
use crate::obj::{ObjImage, SourceMap};
use console::{Console, ConsoleSink, FlushPolicy};
use device::{DSR, KBSR};
use mem::{MemArray, RegFile, Word};

/// Initial program counter.
pub const PC_INIT: u16 = 0x3000;
/// Initial PSW: user mode, priority 0, condition code Z.
pub const PSW_INIT: u16 = 0x8002;
/// Initial user stack pointer (grows down from the device page).
pub const USER_SP_INIT: u16 = 0xFE00;
/// Initial supervisor stack pointer (grows down from the user space base).
pub const SUPER_SP_INIT: u16 = 0x3000;

/// Bits of the PSW that are actually wired up.
const PSW_MASK: u16 = 0b1000_0111_0001_1111;

/// The processor status word.
///
/// | Bits  | Field                                      |
/// |-------|--------------------------------------------|
/// | 15    | privilege: 0 = supervisor, 1 = user        |
/// | 10:8  | running priority                           |
/// | 4     | Carry (variant ISA arithmetic only)        |
/// | 3     | Overflow (variant ISA arithmetic only)     |
/// | 2:0   | N, Z, P condition codes (exactly one set)  |
///
/// This is a value-type view: read the machine's PSW word into a `Psw`,
/// manipulate it, and write it back.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Psw(u16);

impl Psw {
    /// Interprets a raw word as a PSW, dropping unwired bits and
    /// normalizing a malformed condition code to Z.
    pub fn new(word: u16) -> Self {
        let mut psw = Psw(word & PSW_MASK);
        if !matches!(psw.cc(), 0b100 | 0b010 | 0b001) {
            psw.set_cc(0b010);
        }
        psw
    }

    /// The raw word.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Whether the machine is in supervisor mode.
    pub fn is_privileged(self) -> bool {
        self.0 & 0x8000 == 0
    }
    /// The running priority (0–7).
    pub fn priority(self) -> u8 {
        ((self.0 >> 8) & 0b111) as u8
    }
    /// The condition code bits (N = `0b100`, Z = `0b010`, P = `0b001`).
    pub fn cc(self) -> u8 {
        (self.0 & 0b111) as u8
    }
    /// The Carry flag.
    pub fn carry(self) -> bool {
        self.0 & 0x0010 != 0
    }
    /// The Overflow flag.
    pub fn overflow(self) -> bool {
        self.0 & 0x0008 != 0
    }

    /// Sets or clears supervisor mode.
    pub fn set_privileged(&mut self, privileged: bool) {
        match privileged {
            true => self.0 &= 0x7FFF,
            false => self.0 |= 0x8000,
        }
    }
    /// Sets the running priority.
    pub fn set_priority(&mut self, priority: u8) {
        self.0 = (self.0 & !0x0700) | u16::from(priority & 0b111) << 8;
    }
    /// Sets the condition code. Anything that is not exactly one flag is
    /// normalized to Z.
    pub fn set_cc(&mut self, cc: u8) {
        let cc = match cc {
            0b100 | 0b010 | 0b001 => cc,
            _ => 0b010,
        };
        self.0 = (self.0 & !0b111) | u16::from(cc);
    }
    /// Sets the condition code from a result's sign.
    pub fn set_cc_from(&mut self, result: u16) {
        self.set_cc(match result {
            0 => 0b010,
            r if r & 0x8000 != 0 => 0b100,
            _ => 0b001,
        });
    }
    /// Sets the Carry and Overflow flags.
    pub fn set_carry_overflow(&mut self, carry: bool, overflow: bool) {
        self.0 &= !0b11000;
        if carry {
            self.0 |= 0x0010;
        }
        if overflow {
            self.0 |= 0x0008;
        }
    }
}

impl std::fmt::Display for Psw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.is_privileged() {
            true => f.write_str("supervisor")?,
            false => f.write_str("user")?,
        }
        write!(f, ", priority {}", self.priority())?;
        let cc = match self.cc() {
            0b100 => 'N',
            0b001 => 'P',
            _ => 'Z',
        };
        write!(f, ", cc {cc}")
    }
}

/// The shared architectural state of one machine.
///
/// Every field is atomic, so a `Machine` behind an [`Arc`] can be read and
/// written from any thread without locks. Cross-field consistency is only
/// guaranteed when the engine is paused; a mid-cycle observer may see a PC
/// that is ahead of the registers, which is fine for a live state view.
#[derive(Debug)]
pub struct Machine {
    /// The 2^16-word address space, device registers included.
    pub mem: MemArray,
    /// The general-purpose register file.
    pub reg: RegFile,
    /// The program counter.
    pub pc: Word,
    /// The processor status word (interpret with [`Psw`]).
    pub psw: Word,
    /// R6 as last seen in user mode, while the supervisor stack is active.
    pub saved_usp: Word,
    /// R6 as last seen in supervisor mode, while the user stack is active.
    pub saved_ssp: Word,
    pending: device::Pending,
}

impl Machine {
    /// Creates a machine in its power-on state.
    pub fn new() -> Self {
        let machine = Machine {
            mem: MemArray::new(),
            reg: RegFile::new(),
            pc: Word::new(0),
            psw: Word::new(0),
            saved_usp: Word::new(0),
            saved_ssp: Word::new(0),
            pending: device::Pending::default(),
        };
        machine.apply_defaults();
        machine
    }

    /// Resets PC, PSW, stack pointers, device registers, and the interrupt
    /// latch to their power-on values. Memory and the other registers are
    /// left alone.
    fn apply_defaults(&self) {
        self.pc.set(PC_INIT);
        self.psw.set(PSW_INIT);
        self.reg[R6].set(USER_SP_INIT);
        self.saved_usp.set(USER_SP_INIT);
        self.saved_ssp.set(SUPER_SP_INIT);
        self.mem[DSR].set(0x8000);
        self.mem[KBSR].set(0);
        self.mem[device::KBDR].set(0);
        self.mem[device::DDR].set(0);
        self.mem[device::MCR].set(0);
        self.pending.clear();
    }

    /// Zeroes memory and registers, then restores the power-on defaults.
    pub fn reset(&self) {
        self.mem.fill(&mut ());
        self.reg.fill(&mut ());
        self.apply_defaults();
    }

    /// Fills memory and registers with seeded random words, then restores
    /// the power-on defaults. Useful for flushing out code that relies on
    /// uninitialized state.
    pub fn randomize(&self, seed: Option<u64>) {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.mem.fill(&mut rng);
        self.reg.fill(&mut rng);
        self.apply_defaults();
    }
}
impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

/// Why a run-control operation returned.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StopReason {
    /// The clock-enable bit of the MCR was cleared (the program halted).
    ClockOff,
    /// The PC landed on a breakpoint. The clock is left enabled so the
    /// next operation resumes cleanly.
    Breakpoint,
    /// The cancellation flag was raised from another thread.
    Cancelled,
    /// The caller's tripwire asked to stop.
    Tripwire,
    /// The step operation ran to completion.
    StepDone,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::ClockOff => f.write_str("halted"),
            StopReason::Breakpoint => f.write_str("hit breakpoint"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::Tripwire => f.write_str("paused"),
            StopReason::StepDone => f.write_str("step complete"),
        }
    }
}

/// What one instruction cycle did, beyond executing the instruction.
struct Cycle {
    /// Whether the cycle ended by redirecting through the exception or
    /// interrupt table (trap calls do not count).
    redirected: bool,
}

/// The execution engine for one machine.
pub struct Simulator {
    /// The machine being simulated. Clone the [`Arc`] to observe state from
    /// another thread.
    pub machine: Arc<Machine>,
    /// Addresses execution pauses at. Checked before fetch, except on the
    /// first cycle of an operation so a stopped machine can leave the
    /// breakpoint it is sitting on.
    pub breakpoints: HashSet<u16>,
    /// Instructions executed since construction or reset.
    pub instructions_run: u64,
    isa: IsaKind,
    cancel: Arc<AtomicBool>,
    console: Console,
    source_map: SourceMap,
}

impl Simulator {
    /// Creates a simulator around a fresh machine.
    pub fn new(isa: IsaKind) -> Self {
        Simulator::with_machine(Arc::new(Machine::new()), isa)
    }

    /// Creates a simulator around an existing (possibly shared) machine.
    pub fn with_machine(machine: Arc<Machine>, isa: IsaKind) -> Self {
        Simulator {
            machine,
            breakpoints: HashSet::new(),
            instructions_run: 0,
            isa,
            cancel: Arc::new(AtomicBool::new(false)),
            console: Console::new(FlushPolicy::default()),
            source_map: SourceMap::new(),
        }
    }

    /// The flag that cancels a running operation.
    ///
    /// Store `true` from any thread; the engine checks it between cycles,
    /// returns [`StopReason::Cancelled`], and clears it again.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Attaches the sink console output is flushed to.
    pub fn set_console_sink(&mut self, sink: Box<dyn ConsoleSink>) {
        self.console.set_sink(sink);
    }

    /// Replaces the console flush tuning without disturbing the attached
    /// sink or any bytes still buffered.
    pub fn set_flush_policy(&mut self, policy: FlushPolicy) {
        self.console.set_policy(policy);
    }

    /// Console bytes buffered but not yet delivered, typically because a
    /// flush was deferred by the sliding-window budget.
    pub fn console_buffered(&self) -> usize {
        self.console.buffered()
    }

    /// Retries delivery of any buffered console output.
    pub fn flush_console(&mut self) {
        self.console.flush();
    }

    /// Replaces the address-to-source-line map.
    pub fn set_source_map(&mut self, map: SourceMap) {
        self.source_map = map;
    }

    /// The source line the PC currently sits on, if the map knows it.
    pub fn current_source_line(&self) -> Option<u32> {
        self.source_map.line_at(self.pc())
    }

    /// Copies an object image into memory and points the PC at its origin.
    ///
    /// PSW, stack pointers, device registers, and the interrupt latch are
    /// reset; the rest of memory is untouched, so handlers and vector
    /// tables can be loaded as separate images before the program itself.
    pub fn load_obj(&mut self, obj: &ObjImage) {
        let m = &self.machine;
        let mut addr = obj.origin();
        for &word in obj.words() {
            m.mem[addr].set(word);
            addr = addr.wrapping_add(1);
        }
        m.pc.set(obj.origin());
        m.psw.set(PSW_INIT);
        m.reg[R6].set(USER_SP_INIT);
        m.saved_usp.set(USER_SP_INIT);
        m.saved_ssp.set(SUPER_SP_INIT);
        m.mem[DSR].fetch_or(0x8000);
        m.mem[KBSR].set(0);
        m.pending.clear();
        debug!(origin = obj.origin(), len = obj.words().len(), "loaded object image");
    }

    /// Zeroes the machine and the instruction counter.
    pub fn reset(&mut self) {
        self.machine.reset();
        self.instructions_run = 0;
    }

    // ===== state accessors used by instruction execution =====

    /// The current PSW.
    pub fn psw(&self) -> Psw {
        Psw(self.machine.psw.get() & PSW_MASK)
    }

    /// The current PC.
    pub fn pc(&self) -> u16 {
        self.machine.pc.get()
    }

    pub(crate) fn set_pc(&mut self, addr: u16) {
        self.machine.pc.set(addr);
    }

    pub(crate) fn offset_pc(&mut self, off: i16) {
        let pc = self.pc().wrapping_add_signed(off);
        self.machine.pc.set(pc);
    }

    /// Reads a general-purpose register.
    pub fn reg(&self, reg: Reg) -> u16 {
        self.machine.reg[reg].get()
    }

    pub(crate) fn set_reg(&mut self, reg: Reg, value: u16) {
        self.machine.reg[reg].set(value);
    }

    /// Writes a register and folds the result's sign into the condition code.
    pub(crate) fn set_reg_cc(&mut self, reg: Reg, value: u16) {
        self.machine.reg[reg].set(value);
        let mut psw = self.psw();
        psw.set_cc_from(value);
        self.machine.psw.set(psw.get());
    }

    pub(crate) fn set_carry_overflow(&mut self, carry: bool, overflow: bool) {
        let mut psw = self.psw();
        psw.set_carry_overflow(carry, overflow);
        self.machine.psw.set(psw.get());
    }

    pub(crate) fn operand_value(&self, operand: ImmOrReg) -> u16 {
        match operand {
            ImmOrReg::Imm(imm) => imm as u16,
            ImmOrReg::Reg(reg) => self.reg(reg),
        }
    }

    pub(crate) fn link_r7(&mut self) {
        let pc = self.pc();
        self.machine.reg[R7].set(pc);
    }

    /// Reads memory with device side effects (an executed load).
    pub fn read_mem(&mut self, addr: u16) -> u16 {
        self.machine.mem_read(addr)
    }

    /// Writes memory with device side effects (an executed store).
    pub fn write_mem(&mut self, addr: u16, value: u16) {
        self.machine.mem_write(addr, value);
    }

    // ===== traps, exceptions, interrupts =====

    /// Executes a trap call: stack switch, push PSW and PC, vector.
    pub(crate) fn trap(&mut self, vect: u8) {
        self.enter_vector(u16::from(vect), None);
    }

    /// Redirects through a vector table entry.
    ///
    /// If the machine is in user mode, R6 swaps to the supervisor stack
    /// first. The old PSW and PC are pushed, the machine enters supervisor
    /// mode with condition code Z, and (for interrupts) the running
    /// priority is raised. The PC is loaded from the table entry.
    fn enter_vector(&mut self, table_entry: u16, priority: Option<u8>) {
        let m = &self.machine;
        let mut psw = Psw(m.psw.get() & PSW_MASK);
        let old_psw = psw.get();
        let pc = m.pc.get();
        if !psw.is_privileged() {
            m.saved_usp.set(m.reg[R6].get());
            m.reg[R6].set(m.saved_ssp.get());
        }
        let sp = m.reg[R6].get();
        m.mem[sp.wrapping_sub(1)].set(old_psw);
        m.mem[sp.wrapping_sub(2)].set(pc);
        m.reg[R6].set(sp.wrapping_sub(2));

        psw.set_privileged(true);
        if let Some(priority) = priority {
            psw.set_priority(priority);
        }
        psw.set_cc(0b010);
        m.psw.set(psw.get());
        m.pc.set(m.mem[table_entry].get());
    }

    /// Executes `RTI`: pop PC and PSW, and swap back to the user stack if
    /// the popped PSW is a user-mode one. Privileged.
    pub(crate) fn rti(&mut self) -> Result<(), Exception> {
        if !self.psw().is_privileged() {
            return Err(Exception::PrivilegeViolation);
        }
        let m = &self.machine;
        let sp = m.reg[R6].get();
        let pc = m.mem[sp].get();
        let psw = Psw::new(m.mem[sp.wrapping_add(1)].get());
        m.reg[R6].set(sp.wrapping_add(2));
        m.pc.set(pc);
        m.psw.set(psw.get());
        if !psw.is_privileged() {
            m.saved_ssp.set(m.reg[R6].get());
            m.reg[R6].set(m.saved_usp.get());
        }
        Ok(())
    }

    // ===== the instruction cycle =====

    /// Runs one full instruction cycle: fetch, execute, drain the display,
    /// and deliver a pending interrupt if its priority wins.
    fn step(&mut self) -> Cycle {
        let word = self.machine.mem[self.pc()].get();
        self.machine.pc.fetch_add(1);

        let mut redirected = false;
        let result = match self.isa {
            IsaKind::Lc => crate::isa::lc::execute(self, word),
            IsaKind::Tm => crate::isa::tm::execute(self, word),
        };
        if let Err(ex) = result {
            debug!(vector = ex.vector(), "exception raised");
            self.enter_vector(0x0100 + u16::from(ex.vector()), None);
            redirected = true;
        }

        if let Some(ch) = self.machine.pump_display() {
            self.console.push(ch);
        }
        self.console.tick();

        // Interrupts wait out a cycle that already redirected, so a handler
        // always gets its first instruction in.
        if !redirected {
            if let Some(intr) = self.machine.pending.peek() {
                if (intr.priority & 0b111) > self.psw().priority() {
                    self.machine.pending.clear();
                    debug!(vector = intr.vector, priority = intr.priority, "interrupt delivered");
                    self.enter_vector(0x0100 + u16::from(intr.vector), Some(intr.priority));
                    redirected = true;
                }
            }
        }

        self.instructions_run += 1;
        Cycle { redirected }
    }

    // ===== run control =====

    /// Runs until the clock goes off, a breakpoint is hit, the operation
    /// is cancelled, or `tripwire` returns false.
    ///
    /// `tripwire` is polled before every cycle; it is how an engine thread
    /// stays responsive to its mailbox while the machine free-runs.
    pub fn run_while(&mut self, mut tripwire: impl FnMut(&mut Self) -> bool) -> StopReason {
        self.machine.set_clock(true);
        let mut first = true;
        let reason = loop {
            if self.cancel.swap(false, Ordering::Relaxed) {
                break StopReason::Cancelled;
            }
            if !self.machine.clock_enabled() {
                break StopReason::ClockOff;
            }
            if !first && self.breakpoints.contains(&self.pc()) {
                break StopReason::Breakpoint;
            }
            if !tripwire(self) {
                break StopReason::Tripwire;
            }
            self.step();
            first = false;
        };
        self.console.flush();
        reason
    }

    /// Runs until the machine stops on its own.
    pub fn run(&mut self) -> StopReason {
        self.run_while(|_| true)
    }

    /// Executes exactly one instruction, breakpoints notwithstanding.
    pub fn step_in(&mut self) -> StopReason {
        self.machine.set_clock(true);
        self.step();
        let reason = match self.machine.clock_enabled() {
            true => StopReason::StepDone,
            false => StopReason::ClockOff,
        };
        self.console.flush();
        reason
    }

    /// Runs until the current subroutine frame returns.
    pub fn step_out(&mut self) -> StopReason {
        self.step_out_while(|_| true)
    }

    /// [`step_out`](Simulator::step_out) with a tripwire, polled per cycle.
    pub fn step_out_while(&mut self, mut tripwire: impl FnMut(&mut Self) -> bool) -> StopReason {
        self.machine.set_clock(true);
        let reason = self.unwind(1, true, &mut tripwire);
        self.console.flush();
        reason
    }

    /// Executes the next instruction; if it calls a subroutine or trap, also
    /// runs the callee to completion.
    pub fn step_over(&mut self) -> StopReason {
        self.step_over_while(|_| true)
    }

    /// [`step_over`](Simulator::step_over) with a tripwire, polled per cycle.
    pub fn step_over_while(&mut self, mut tripwire: impl FnMut(&mut Self) -> bool) -> StopReason {
        self.machine.set_clock(true);
        let word = self.machine.mem[self.pc()].get();
        let reason = if self.isa.flow_class(word) == FlowClass::Call {
            let cycle = self.step();
            // An interrupt landing on the same cycle nests one frame deeper,
            // so the unwind has one more return to wait for.
            let depth = 1 + i32::from(cycle.redirected);
            if self.machine.clock_enabled() {
                self.unwind(depth, false, &mut tripwire)
            } else {
                StopReason::ClockOff
            }
        } else {
            let _ = self.step();
            match self.machine.clock_enabled() {
                true => StopReason::StepDone,
                false => StopReason::ClockOff,
            }
        };
        self.console.flush();
        reason
    }

    /// Runs until `depth` frames have returned, tracking calls, returns,
    /// and engine-injected redirections (exceptions and interrupts) against
    /// the counter. `skip_first_bp` suppresses the breakpoint check on the
    /// first cycle so a paused machine can leave the breakpoint it is on.
    fn unwind(
        &mut self,
        mut depth: i32,
        skip_first_bp: bool,
        tripwire: &mut dyn FnMut(&mut Self) -> bool,
    ) -> StopReason {
        let mut first = skip_first_bp;
        loop {
            if self.cancel.swap(false, Ordering::Relaxed) {
                return StopReason::Cancelled;
            }
            if !self.machine.clock_enabled() {
                return StopReason::ClockOff;
            }
            if !first && self.breakpoints.contains(&self.pc()) {
                return StopReason::Breakpoint;
            }
            if !tripwire(self) {
                return StopReason::Tripwire;
            }
            let word = self.machine.mem[self.pc()].get();
            match self.isa.flow_class(word) {
                FlowClass::Call => depth += 1,
                FlowClass::Return => depth -= 1,
                FlowClass::Other => {}
            }
            let cycle = self.step();
            if cycle.redirected {
                depth += 1;
            }
            first = false;
            if depth <= 0 {
                return StopReason::StepDone;
            }
        }
    }
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("isa", &self.isa)
            .field("pc", &self.pc())
            .field("psw", &self.psw())
            .field("breakpoints", &self.breakpoints)
            .field("instructions_run", &self.instructions_run)
            .finish_non_exhaustive()
    }
}

/// The engine must be movable onto a worker thread.
#[allow(dead_code)]
fn assert_send() {
    fn check<T: Send>() {}
    check::<Simulator>();
}
