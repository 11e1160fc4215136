//! Content-defined segmentation of a byte stream.
//!
//! The input is split into variable-length segments whose boundaries depend
//! only on local content, so an insertion or deletion near the start of a
//! stream does not move boundaries later on.  Successive dumps of a slowly
//! changing source therefore share most of their segments, and a new dump
//! only has to store the segments whose bytes actually changed.
//!
//! Boundaries come from a Fletcher-style rolling checksum over a sliding
//! window: twin sums `s1`/`s2`, each truncated to 16 bits, rolled one byte at
//! a time (the same weak-checksum family rsync uses for block matching).  A
//! byte position is a cut point when the combined 32-bit value falls in a
//! fixed residue class; the class size is chosen so that, past the minimum
//! segment length, cuts arrive about once per 3 MiB, for a mean segment
//! length of about 4 MiB.  The window state is reset at every segment start,
//! so identical input yields the identical segment sequence on every run and
//! platform.

use std::io::{self, Read};

/// Segments are never shorter than this (except the final one).
pub const MIN_SEG_LEN: usize = 1 << 20;
/// Segments are force-cut at this length even if no boundary is found.
pub const MAX_SEG_LEN: usize = 16 << 20;

/// Cut probability past the minimum is 1 in this many bytes.
const BOUNDARY_MODULUS: u32 = 3 << 20;
/// Rolling checksum window.
const WINDOW_LEN: usize = 4096;
/// Source read granularity.
const READ_BUF_LEN: usize = 64 * 1024;

// ── Rolling checksum ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct RollingSum {
    s1: u32,
    s2: u32,
}

impl RollingSum {
    fn new() -> RollingSum {
        RollingSum { s1: 0, s2: 0 }
    }

    /// Add a byte while the window is still filling.
    #[inline]
    fn push(&mut self, byte: u8) {
        self.s1 = (self.s1 + byte as u32) & 0xffff;
        self.s2 = (self.s2 + self.s1) & 0xffff;
    }

    /// Slide the full window one byte: drop `out`, take in `inb`.
    #[inline]
    fn roll(&mut self, out: u8, inb: u8) {
        self.s1 = self.s1.wrapping_add(inb as u32).wrapping_sub(out as u32) & 0xffff;
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub((WINDOW_LEN as u32).wrapping_mul(out as u32))
            & 0xffff;
    }

    #[inline]
    fn is_boundary(&self) -> bool {
        let combined = (self.s2 << 16) | self.s1;
        combined % BOUNDARY_MODULUS == BOUNDARY_MODULUS - 1
    }
}

// ── Chunker ──────────────────────────────────────────────────────────────────

/// Lazily splits a reader into segments; the concatenation of all yielded
/// segments equals the input.
pub struct Chunker<R: Read> {
    src: R,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    failed: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(src: R) -> Chunker<R> {
        Chunker { src, buf: vec![0u8; READ_BUF_LEN], start: 0, end: 0, eof: false, failed: false }
    }

    /// Produce the next segment, or `None` at end of input.
    pub fn next_segment(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut seg: Vec<u8> = Vec::new();
        let mut sum = RollingSum::new();
        loop {
            if self.start == self.end {
                if self.eof {
                    break;
                }
                let n = self.fill()?;
                if n == 0 {
                    self.eof = true;
                    break;
                }
            }
            let slice = &self.buf[self.start..self.end];
            let mut consumed = 0;
            let mut cut = false;
            for &byte in slice {
                consumed += 1;
                seg.push(byte);
                let len = seg.len();
                if len <= WINDOW_LEN {
                    sum.push(byte);
                } else {
                    sum.roll(seg[len - 1 - WINDOW_LEN], byte);
                }
                if len >= MAX_SEG_LEN || (len >= MIN_SEG_LEN && sum.is_boundary()) {
                    cut = true;
                    break;
                }
            }
            self.start += consumed;
            if cut {
                return Ok(Some(seg));
            }
        }
        Ok(if seg.is_empty() { None } else { Some(seg) })
    }

    fn fill(&mut self) -> io::Result<usize> {
        loop {
            match self.src.read(&mut self.buf) {
                Ok(n) => {
                    self.start = 0;
                    self.end = n;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_segment() {
            Ok(Some(seg)) => Some(Ok(seg)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
