//! Memory and register-file primitives.
//!
//! Every architectural cell is a [`Word`]: a 16-bit value held in an atomic
//! so the machine state can be shared between the engine thread and a
//! front-end thread without locks. All accesses use relaxed ordering; the
//! command/notification channels provide whatever cross-thread ordering the
//! protocol needs, so the atomics only have to guarantee tear-free reads of
//! individual cells.
//!
//! [`WordFiller`] abstracts over how cells get (re)initialized, so resetting
//! to zero and randomizing with a seeded RNG share one code path.

use std::ops::Index;
use std::sync::atomic::{AtomicU16, Ordering};

use rand::rngs::StdRng;
use rand::Rng;

use crate::isa::Reg;

/// A 16-bit machine word, shareable across threads.
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct Word(AtomicU16);

impl Word {
    /// Creates a new word with the given value.
    pub fn new(value: u16) -> Self {
        Word(AtomicU16::new(value))
    }

    /// Reads the word's value.
    pub fn get(&self) -> u16 {
        self.0.load(Ordering::Relaxed)
    }

    /// Writes the word's value.
    pub fn set(&self, value: u16) {
        self.0.store(value, Ordering::Relaxed)
    }

    /// Sets the given bits, returning the previous value.
    pub fn fetch_or(&self, mask: u16) -> u16 {
        self.0.fetch_or(mask, Ordering::Relaxed)
    }

    /// Clears the bits not in the mask, returning the previous value.
    pub fn fetch_and(&self, mask: u16) -> u16 {
        self.0.fetch_and(mask, Ordering::Relaxed)
    }

    /// Adds to the word (wrapping), returning the previous value.
    pub fn fetch_add(&self, delta: u16) -> u16 {
        self.0.fetch_add(delta, Ordering::Relaxed)
    }
}

impl From<u16> for Word {
    fn from(value: u16) -> Self {
        Word::new(value)
    }
}

/// A strategy for initializing machine words.
pub trait WordFiller {
    /// Generates the next word.
    fn generate(&mut self) -> u16;
}
/// Fill with zero.
impl WordFiller for () {
    fn generate(&mut self) -> u16 {
        0
    }
}
/// Fill with a fixed value.
impl WordFiller for u16 {
    fn generate(&mut self) -> u16 {
        *self
    }
}
/// Fill with seeded random values.
impl WordFiller for StdRng {
    fn generate(&mut self) -> u16 {
        self.gen()
    }
}

/// The full 2^16-word address space.
#[derive(Debug)]
pub struct MemArray(Box<[Word; 1 << 16]>);

impl MemArray {
    /// Creates a zero-filled address space.
    pub fn new() -> Self {
        MemArray(make_boxed_array(&mut ()))
    }

    /// Overwrites every cell using the given filler.
    pub fn fill<F: WordFiller>(&self, filler: &mut F) {
        for word in self.0.iter() {
            word.set(filler.generate());
        }
    }
}
impl Default for MemArray {
    fn default() -> Self {
        MemArray::new()
    }
}
impl Index<u16> for MemArray {
    type Output = Word;

    fn index(&self, addr: u16) -> &Self::Output {
        &self.0[usize::from(addr)]
    }
}

/// The 8-register file.
#[derive(Debug)]
pub struct RegFile([Word; 8]);

impl RegFile {
    /// Creates a zero-filled register file.
    pub fn new() -> Self {
        RegFile(std::array::from_fn(|_| Word::new(0)))
    }

    /// Overwrites every register using the given filler.
    pub fn fill<F: WordFiller>(&self, filler: &mut F) {
        for word in self.0.iter() {
            word.set(filler.generate());
        }
    }
}
impl Default for RegFile {
    fn default() -> Self {
        RegFile::new()
    }
}
impl Index<Reg> for RegFile {
    type Output = Word;

    fn index(&self, reg: Reg) -> &Self::Output {
        &self.0[usize::from(reg)]
    }
}

/// Builds a boxed word array on the heap without blowing the stack.
fn make_boxed_array<F: WordFiller, const N: usize>(filler: &mut F) -> Box<[Word; N]> {
    let words: Box<[Word]> = std::iter::repeat_with(|| Word::new(filler.generate()))
        .take(N)
        .collect();
    words
        .try_into()
        .unwrap_or_else(|_| unreachable!("exactly {N} words were collected"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    use super::*;
    use crate::isa::reg_consts::*;

    #[test]
    fn word_bit_operations() {
        let w = Word::new(0x00FF);
        assert_eq!(w.fetch_or(0x8000), 0x00FF);
        assert_eq!(w.get(), 0x80FF);
        assert_eq!(w.fetch_and(0x7FFF), 0x80FF);
        assert_eq!(w.get(), 0x00FF);
        w.set(0xFFFF);
        assert_eq!(w.fetch_add(1), 0xFFFF);
        assert_eq!(w.get(), 0x0000);
    }

    #[test]
    fn mem_starts_zeroed_and_indexes_by_address() {
        let mem = MemArray::new();
        assert_eq!(mem[0x0000].get(), 0);
        assert_eq!(mem[0xFFFF].get(), 0);
        mem[0x3000].set(0x1234);
        assert_eq!(mem[0x3000].get(), 0x1234);
    }

    #[test]
    fn seeded_fill_is_reproducible() {
        let a = RegFile::new();
        let b = RegFile::new();
        a.fill(&mut StdRng::seed_from_u64(17));
        b.fill(&mut StdRng::seed_from_u64(17));
        for r in 0..8 {
            let r = Reg::try_from(r).unwrap();
            assert_eq!(a[r].get(), b[r].get());
        }
        assert!(a[R0].get() != 0 || a[R1].get() != 0);
    }
}
