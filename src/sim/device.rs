//! Memory-mapped devices and the interrupt signal.
//!
//! The device registers live in the top page of the address space:
//!
//! | Address  | Register | Meaning                                        |
//! |----------|----------|------------------------------------------------|
//! | `0xFE00` | KBSR     | bit 15: key ready, bit 14: interrupt enable    |
//! | `0xFE02` | KBDR     | last key's character (low byte)                |
//! | `0xFE04` | DSR      | bit 15: display ready to accept a character    |
//! | `0xFE06` | DDR      | character to display (low byte)                |
//! | `0xFFFE` | MCR      | bit 15: clock enable                           |
//!
//! Reading KBDR acknowledges the key (clears KBSR ready); writing DDR hands
//! a character to the display (clears DSR ready until the engine drains it).
//!
//! Because device registers are ordinary [`Word`]s in shared memory, a
//! front-end thread can poke them directly; the engine observes the change
//! on its next cycle.
//!
//! [`Word`]: super::mem::Word

use std::sync::atomic::{AtomicU16, Ordering};

use super::Machine;

/// Keyboard status register address.
pub const KBSR: u16 = 0xFE00;
/// Keyboard data register address.
pub const KBDR: u16 = 0xFE02;
/// Display status register address.
pub const DSR: u16 = 0xFE04;
/// Display data register address.
pub const DDR: u16 = 0xFE06;
/// Machine control register address.
pub const MCR: u16 = 0xFFFE;

/// Keyboard interrupt vector.
pub const KB_INTV: u8 = 0x80;
/// Keyboard interrupt priority.
pub const KB_INTP: u8 = 0b100;

/// An external interrupt request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Interrupt {
    /// Vector code; the table entry is `0x0100 + vector`.
    pub vector: u8,
    /// Priority (0–7). Delivered only when strictly above the running
    /// priority in the PSW.
    pub priority: u8,
}

/// A single-slot interrupt latch.
///
/// Packs valid/priority/vector into one atomic so raising from another
/// thread never tears. A later request overwrites an undelivered earlier
/// one; the devices here only ever re-raise the same request, so nothing
/// is lost in practice.
#[derive(Debug, Default)]
pub(crate) struct Pending(AtomicU16);

const PENDING_VALID: u16 = 0x8000;

impl Pending {
    pub(crate) fn raise(&self, intr: Interrupt) {
        let packed = PENDING_VALID | u16::from(intr.priority & 0b111) << 8 | u16::from(intr.vector);
        self.0.store(packed, Ordering::Relaxed);
    }

    pub(crate) fn peek(&self) -> Option<Interrupt> {
        let packed = self.0.load(Ordering::Relaxed);
        (packed & PENDING_VALID != 0).then(|| Interrupt {
            vector: packed as u8,
            priority: ((packed >> 8) & 0b111) as u8,
        })
    }

    pub(crate) fn clear(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Machine {
    /// Whether the clock-enable bit of the MCR is set.
    pub fn clock_enabled(&self) -> bool {
        self.mem[MCR].get() & 0x8000 != 0
    }

    /// Sets or clears the clock-enable bit of the MCR.
    pub fn set_clock(&self, enabled: bool) {
        if enabled {
            self.mem[MCR].fetch_or(0x8000);
        } else {
            self.mem[MCR].fetch_and(0x7FFF);
        }
    }

    /// Latches an interrupt request for delivery between instructions.
    pub fn raise_interrupt(&self, intr: Interrupt) {
        self.pending.raise(intr);
    }

    /// Delivers a key press to the keyboard device.
    ///
    /// Sets KBDR and the KBSR ready bit; if the program has enabled keyboard
    /// interrupts (KBSR bit 14), also raises the keyboard interrupt.
    pub fn post_key(&self, ch: u8) {
        self.mem[KBDR].set(u16::from(ch));
        let kbsr = self.mem[KBSR].fetch_or(0x8000);
        if kbsr & 0x4000 != 0 {
            self.raise_interrupt(Interrupt { vector: KB_INTV, priority: KB_INTP });
        }
    }

    /// Reads memory as an executed load would, applying device side effects.
    pub(crate) fn mem_read(&self, addr: u16) -> u16 {
        let value = self.mem[addr].get();
        if addr == KBDR {
            // Reading the data register acknowledges the key.
            self.mem[KBSR].fetch_and(0x7FFF);
        }
        value
    }

    /// Writes memory as an executed store would, applying device side effects.
    pub(crate) fn mem_write(&self, addr: u16, value: u16) {
        self.mem[addr].set(value);
        if addr == DDR {
            // The display is busy until the engine drains the character.
            self.mem[DSR].fetch_and(0x7FFF);
        }
    }

    /// Drains a character from the display, if one is waiting.
    ///
    /// Called once per cycle by the engine. Returns the drained character
    /// and marks the display ready again.
    pub(crate) fn pump_display(&self) -> Option<u8> {
        if self.mem[DSR].get() & 0x8000 == 0 {
            let ch = self.mem[DDR].get() as u8;
            self.mem[DSR].fetch_or(0x8000);
            Some(ch)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn key_sets_ready_and_read_acknowledges() {
        let machine = Machine::new();
        machine.post_key(b'q');
        assert_eq!(machine.mem[KBSR].get() & 0x8000, 0x8000);
        assert_eq!(machine.mem_read(KBDR), u16::from(b'q'));
        assert_eq!(machine.mem[KBSR].get() & 0x8000, 0);
        // No interrupt without the enable bit.
        assert_eq!(machine.pending.peek(), None);
    }

    #[test]
    fn key_raises_interrupt_when_enabled() {
        let machine = Machine::new();
        machine.mem[KBSR].set(0x4000);
        machine.post_key(b'q');
        assert_eq!(
            machine.pending.peek(),
            Some(Interrupt { vector: KB_INTV, priority: KB_INTP })
        );
    }

    #[test]
    fn display_write_then_pump() {
        let machine = Machine::new();
        machine.mem[DSR].set(0x8000);
        machine.mem_write(DDR, u16::from(b'H'));
        assert_eq!(machine.mem[DSR].get() & 0x8000, 0);
        assert_eq!(machine.pump_display(), Some(b'H'));
        assert_eq!(machine.mem[DSR].get() & 0x8000, 0x8000);
        assert_eq!(machine.pump_display(), None);
    }

    #[test]
    fn pending_latch_packs_and_clears() {
        let pending = Pending::default();
        pending.raise(Interrupt { vector: 0x80, priority: 4 });
        assert_eq!(pending.peek(), Some(Interrupt { vector: 0x80, priority: 4 }));
        pending.clear();
        assert_eq!(pending.peek(), None);
    }
}
