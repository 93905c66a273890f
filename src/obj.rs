//! Object images and source maps.
//!
//! The simulator does not parse or assemble anything; it consumes an
//! [`ObjImage`] produced by an external assembler. An object image is a load
//! origin followed by the words to place contiguously from that origin.
//!
//! Assemblers that track debug information can also hand over a
//! [`SourceMap`], mapping loaded addresses back to source lines.

use std::collections::HashMap;

use thiserror::Error;

/// Errors raised while constructing an [`ObjImage`].
#[derive(Debug, PartialEq, Eq, Error)]
pub enum ObjError {
    /// The raw word sequence held no origin word.
    #[error("object image is empty")]
    Empty,
}

/// An assembled program: a load origin and the words placed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjImage {
    origin: u16,
    words: Vec<u16>,
}

impl ObjImage {
    /// Creates an object image from an origin and its program words.
    pub fn new(origin: u16, words: Vec<u16>) -> Self {
        Self { origin, words }
    }

    /// Parses the raw object format: first word is the load origin, the rest
    /// are the program words loaded contiguously from there.
    pub fn from_words(raw: &[u16]) -> Result<Self, ObjError> {
        let (&origin, words) = raw.split_first().ok_or(ObjError::Empty)?;
        Ok(Self { origin, words: words.to_vec() })
    }

    /// The load origin.
    pub fn origin(&self) -> u16 {
        self.origin
    }

    /// The program words, in load order.
    pub fn words(&self) -> &[u16] {
        &self.words
    }
}

/// A map from loaded addresses to source line numbers.
///
/// This is opaque debugger input; the simulator only ever queries it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap(HashMap<u16, u32>);

impl SourceMap {
    /// Creates an empty source map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `addr` was assembled from source line `line`.
    pub fn insert(&mut self, addr: u16, line: u32) {
        self.0.insert(addr, line);
    }

    /// Looks up the source line for an address, if one is known.
    pub fn line_at(&self, addr: u16) -> Option<u32> {
        self.0.get(&addr).copied()
    }
}

impl FromIterator<(u16, u32)> for SourceMap {
    fn from_iter<T: IntoIterator<Item = (u16, u32)>>(iter: T) -> Self {
        Self(HashMap::from_iter(iter))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn raw_format_splits_origin() {
        let obj = ObjImage::from_words(&[0x3000, 0x5020, 0xF025]).unwrap();
        assert_eq!(obj.origin(), 0x3000);
        assert_eq!(obj.words(), &[0x5020, 0xF025]);
    }

    #[test]
    fn empty_image_is_rejected() {
        assert_eq!(ObjImage::from_words(&[]), Err(ObjError::Empty));
    }

    #[test]
    fn source_map_lookup() {
        let map: SourceMap = [(0x3000, 4), (0x3001, 5)].into_iter().collect();
        assert_eq!(map.line_at(0x3000), Some(4));
        assert_eq!(map.line_at(0x3001), Some(5));
        assert_eq!(map.line_at(0x3002), None);
    }
}
