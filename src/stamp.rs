// This module is the stamping runtime that generated snippet routines link against. CodeBuffer
// is the output cursor: it appends bytes and knows the address the code will run at, so
// pc-relative holes can be computed against the actual write position. Cont is how a caller
// hands a continuation to a routine, either as a resolved address or as a pending Fixup. A
// Fixup threads a singly linked list through the 4-byte holes of every site that jumps to the
// same not-yet-placed target: each hole stores the previous head (the offset of the prior site
// relative to the fixup's base, or -1), and the fixup keeps the offset of the newest site.
// Resolving the fixup walks the list once and overwrites every hole with its real displacement.

//! Runtime patch protocol for stamped templates.

use std::cell::Cell;
use thiserror::Error;

/// Link value terminating a fixup list.
pub const FIXUP_SENTINEL: i32 = -1;

/// Errors raised while walking or resolving a fixup list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StampError {
    #[error("fixup site at offset {offset} lies outside the {len}-byte buffer")]
    SiteOutOfBounds { offset: i64, len: usize },

    #[error("fixup list does not terminate")]
    Cycle,

    #[error("displacement from {site:#x} to {target:#x} does not fit in 32 bits")]
    DisplacementOverflow { site: u64, target: u64 },
}

/// `target - (site + 4)` as a rel32 displacement.
fn rel32(site: u64, target: u64) -> Option<i32> {
    let disp = (target as i64).wrapping_sub(site as i64).wrapping_sub(4);
    i32::try_from(disp).ok()
}

/// Growable output buffer for code that will execute at `base`.
#[derive(Debug, Clone, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    base: u64,
}

impl CodeBuffer {
    pub fn new(base: u64) -> Self {
        Self {
            bytes: Vec::new(),
            base,
        }
    }

    pub fn with_capacity(base: u64, capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            base,
        }
    }

    /// Address the first byte of the buffer will execute at.
    pub fn base_address(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address of the next byte to be written.
    pub fn position(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Copy literal template bytes.
    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn put_abs64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    /// Write the low 32 bits of `value`.
    pub fn put_abs32(&mut self, value: u64) {
        self.put(&(value as u32).to_le_bytes());
    }

    /// Write a displacement to `target` relative to the end of the hole.
    ///
    /// # Panics
    /// If `target` is out of rel32 range of the write position.
    pub fn put_rel32(&mut self, target: u64) {
        let site = self.position();
        let disp = rel32(site, target).unwrap_or_else(|| {
            panic!("rel32 target {target:#x} out of range of site {site:#x}")
        });
        self.put(&disp.to_le_bytes());
    }

    /// Rel32 hole aimed at a continuation, linking into its fixup when the
    /// target is not placed yet.
    pub fn put_cont_rel32(&mut self, cont: Cont<'_>) {
        match cont {
            Cont::Addr(target) => self.put_rel32(target),
            Cont::Pending(fixup) => {
                let previous = fixup.link(self.position());
                self.put(&previous.to_le_bytes());
            }
        }
    }

    /// Absolute 64-bit hole aimed at a continuation.
    ///
    /// # Panics
    /// If the continuation is still pending: only rel32 holes can be deferred.
    pub fn put_cont_abs64(&mut self, cont: Cont<'_>) {
        self.put_abs64(cont.expect_address());
    }

    /// Absolute 32-bit hole aimed at a continuation.
    ///
    /// # Panics
    /// If the continuation is still pending.
    pub fn put_cont_abs32(&mut self, cont: Cont<'_>) {
        self.put_abs32(cont.expect_address());
    }

    fn offset_of(&self, address: u64) -> Result<usize, StampError> {
        let offset = address as i64 - self.base as i64;
        if offset < 0 || offset as usize + 4 > self.bytes.len() {
            return Err(StampError::SiteOutOfBounds {
                offset,
                len: self.bytes.len(),
            });
        }
        Ok(offset as usize)
    }

    fn read_i32(&self, offset: usize) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        i32::from_le_bytes(raw)
    }

    fn write_i32(&mut self, offset: usize, value: i32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// A continuation argument of a stamping routine.
#[derive(Debug, Clone, Copy)]
pub enum Cont<'f> {
    /// The continuation is already placed at this address.
    Addr(u64),
    /// The continuation is not placed yet; holes are linked into the fixup.
    Pending(&'f Fixup),
}

impl Cont<'_> {
    fn expect_address(self) -> u64 {
        match self {
            Cont::Addr(address) => address,
            Cont::Pending(_) => panic!("absolute continuation hole needs a resolved address"),
        }
    }
}

impl<'f> From<&'f Fixup> for Cont<'f> {
    fn from(fixup: &'f Fixup) -> Self {
        Cont::Pending(fixup)
    }
}

/// Pending rel32 sites sharing one not-yet-placed target.
#[derive(Debug)]
pub struct Fixup {
    base: u64,
    head: Cell<i32>,
}

impl Fixup {
    /// Fixup whose site offsets are relative to `base`.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            head: Cell::new(FIXUP_SENTINEL),
        }
    }

    /// Fixup for sites stamped into `buf`.
    pub fn for_buffer(buf: &CodeBuffer) -> Self {
        Self::new(buf.base_address())
    }

    pub fn base_address(&self) -> u64 {
        self.base
    }

    /// Offset of the most recent site, or [`FIXUP_SENTINEL`].
    pub fn head(&self) -> i32 {
        self.head.get()
    }

    pub fn is_empty(&self) -> bool {
        self.head.get() == FIXUP_SENTINEL
    }

    /// Make `site` the new head and return the previous head.
    fn link(&self, site: u64) -> i32 {
        let offset = i32::try_from(site as i64 - self.base as i64)
            .unwrap_or_else(|_| panic!("fixup site {site:#x} too far from base {:#x}", self.base));
        self.head.replace(offset)
    }

    /// Site offsets from newest to oldest.
    pub fn sites(&self, buf: &CodeBuffer) -> Result<Vec<i32>, StampError> {
        let mut sites = Vec::new();
        let mut at = self.head.get();
        while at != FIXUP_SENTINEL {
            if sites.len() > buf.len() / 4 {
                return Err(StampError::Cycle);
            }
            let offset = buf.offset_of(self.base.wrapping_add(at as i64 as u64))?;
            sites.push(at);
            at = buf.read_i32(offset);
        }
        Ok(sites)
    }

    /// Patch every linked site with its displacement to `target` and empty
    /// the list. Returns the number of sites patched.
    ///
    /// On error nothing is written and the list is left intact.
    pub fn resolve(&self, buf: &mut CodeBuffer, target: u64) -> Result<usize, StampError> {
        let patches = self
            .sites(buf)?
            .into_iter()
            .map(|at| {
                let site = self.base.wrapping_add(at as i64 as u64);
                let disp = rel32(site, target).ok_or(StampError::DisplacementOverflow { site, target })?;
                Ok((buf.offset_of(site)?, disp))
            })
            .collect::<Result<Vec<_>, StampError>>()?;
        for (offset, disp) in &patches {
            buf.write_i32(*offset, *disp);
        }
        self.head.set(FIXUP_SENTINEL);
        log::trace!("resolved {} fixup sites to {target:#x}", patches.len());
        Ok(patches.len())
    }
}

/// Called by generated routines for a live-register count they were not
/// compiled for.
#[cold]
pub fn unknown_variant(snippet: &str, num_int_regs_in_use: usize) -> ! {
    panic!("internal error: `{snippet}` has no variant for {num_int_regs_in_use} live int registers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel32_is_relative_to_end_of_hole() {
        let mut buf = CodeBuffer::new(0x1000);
        buf.put(&[0xe9]);
        buf.put_rel32(0x1000);
        // hole at 0x1001, next byte at 0x1005
        assert_eq!(&buf.bytes()[1..], &(-5i32).to_le_bytes());
    }

    #[test]
    fn abs32_truncates() {
        let mut buf = CodeBuffer::new(0);
        buf.put_abs32(0x1_2345_6789);
        assert_eq!(buf.bytes(), &0x2345_6789u32.to_le_bytes());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn far_rel32_panics() {
        let mut buf = CodeBuffer::new(0);
        buf.put_rel32(0x1_0000_0000);
    }

    #[test]
    fn pending_links_previous_head() {
        let mut buf = CodeBuffer::new(0x4000);
        let fixup = Fixup::for_buffer(&buf);
        buf.put(&[0x90, 0xe9]);
        buf.put_cont_rel32(Cont::from(&fixup));
        assert_eq!(fixup.head(), 2);
        assert_eq!(&buf.bytes()[2..6], &FIXUP_SENTINEL.to_le_bytes());
        assert_eq!(fixup.sites(&buf).unwrap(), vec![2]);
    }

    #[test]
    #[should_panic(expected = "resolved address")]
    fn absolute_hole_cannot_be_deferred() {
        let mut buf = CodeBuffer::new(0);
        let fixup = Fixup::for_buffer(&buf);
        buf.put_cont_abs64(Cont::Pending(&fixup));
    }

    #[test]
    fn corrupted_list_is_reported() {
        let mut buf = CodeBuffer::new(0);
        let fixup = Fixup::for_buffer(&buf);
        buf.put(&[0xe9]);
        buf.put_cont_rel32(Cont::Pending(&fixup));
        // point the hole at itself
        let head = fixup.head();
        buf.write_i32(1, head);
        assert_eq!(fixup.sites(&buf), Err(StampError::Cycle));

        buf.write_i32(1, 100);
        assert!(matches!(
            fixup.sites(&buf),
            Err(StampError::SiteOutOfBounds { offset: 100, .. })
        ));
    }
}
