// Boundary-column records exchanged between adjacent pipeline stages.
//
// Produced by the alignment kernel and forwarded verbatim by the cell stream
// transport. The controller only ever reasons about their size.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Bytes occupied by one [`Cell`] on the wire and in checkpoint files.
pub const CELL_SIZE: usize = 8;

/// Bytes occupied by one [`GlobalScore`] on the wire.
pub const SCORE_SIZE: usize = 8;

// ── Cell Kind ────────────────────────────────────────────────────────────────

/// Which interpretation the second word of a cell carries.
///
/// The discriminant never travels on the wire: both sides of a stream agree
/// on it out of band (the kernel stage that produces the column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    /// Gap-extension value (`f` / `e` in the recurrence).
    Gap,
    /// Traceback or event field.
    Event,
}

// ── Cell ─────────────────────────────────────────────────────────────────────

/// Tagged second word of a [`Cell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellAux {
    Gap(i32),
    Event(i32),
}

impl CellAux {
    pub fn kind(&self) -> CellKind {
        match self {
            Self::Gap(_) => CellKind::Gap,
            Self::Event(_) => CellKind::Event,
        }
    }

    /// Raw 32-bit payload regardless of the tag.
    pub fn raw(&self) -> i32 {
        match *self {
            Self::Gap(v) | Self::Event(v) => v,
        }
    }

    pub fn from_raw(kind: CellKind, raw: i32) -> Self {
        match kind {
            CellKind::Gap => Self::Gap(raw),
            CellKind::Event => Self::Event(raw),
        }
    }
}

/// One dynamic-programming boundary cell.
///
/// Wire layout (8 bytes, native endian, 8-byte aligned in the kernel):
///
/// ```text
/// ┌──────────┬──────────────┐
/// │ h: i32   │ aux: i32     │
/// └──────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub h: i32,
    pub aux: CellAux,
}

impl Cell {
    pub fn gap(h: i32, f: i32) -> Self {
        Self { h, aux: CellAux::Gap(f) }
    }

    pub fn event(h: i32, e: i32) -> Self {
        Self { h, aux: CellAux::Event(e) }
    }

    pub fn to_bytes(&self) -> [u8; CELL_SIZE] {
        let mut out = [0u8; CELL_SIZE];
        out[..4].copy_from_slice(&self.h.to_ne_bytes());
        out[4..].copy_from_slice(&self.aux.raw().to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; CELL_SIZE], kind: CellKind) -> Self {
        let h = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let raw = i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            h,
            aux: CellAux::from_raw(kind, raw),
        }
    }

    /// Append the wire encoding of `cells` to `out`.
    pub fn encode_all(cells: &[Cell], out: &mut Vec<u8>) {
        out.reserve(cells.len() * CELL_SIZE);
        for cell in cells {
            out.extend_from_slice(&cell.to_bytes());
        }
    }

    /// Decode every complete cell in `bytes`. Trailing partial bytes are an
    /// error: callers slice to a cell boundary first.
    pub fn decode_all(bytes: &[u8], kind: CellKind) -> Result<Vec<Cell>> {
        if bytes.len() % CELL_SIZE != 0 {
            return Err(StrandError::Wire(format!(
                "{} bytes is not a whole number of {CELL_SIZE}-byte cells",
                bytes.len()
            )));
        }
        Ok(bytes
            .chunks_exact(CELL_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; CELL_SIZE];
                raw.copy_from_slice(chunk);
                Cell::from_bytes(&raw, kind)
            })
            .collect())
    }
}

// ── Global Score ─────────────────────────────────────────────────────────────

/// Final alignment score of one partition, sent once after its cell stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalScore(pub i64);

impl GlobalScore {
    pub fn to_bytes(&self) -> [u8; SCORE_SIZE] {
        self.0.to_ne_bytes()
    }

    pub fn from_bytes(bytes: [u8; SCORE_SIZE]) -> Self {
        Self(i64::from_ne_bytes(bytes))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
