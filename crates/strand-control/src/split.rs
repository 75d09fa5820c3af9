//! Split vector: one weight per virtual partition, grouped in per-round
//! slices of `fleet` consecutive entries.
//!
//! ```text
//!   round 0           round 1           round 2
//! ┌────┬────┬────┐ ┌────┬────┬────┐ ┌────┬────┬────┐
//! │ w0 │ w1 │ w2 │ │ w3 │ w4 │ w5 │ │ w6 │ w7 │ w8 │   (fleet = 3)
//! └────┴────┴────┘ └────┴────┴────┘ └────┴────┴────┘
//!   each slice sums to the normalization constant (1000 or 10000)
//! ```
//!
//! Round-0 weights come from the configured per-node overrides. Every later
//! slice is proposed from the previous slice and the measured throughput of
//! its stages, then normalized; a proposal that swings too far is discarded
//! and the previous slice is carried forward instead.

use serde::Serialize;

/// Maximum accepted ratio between a new proposal and the proposals already
/// made for earlier slots of the same slice.
pub const STABILITY_LIMIT: i64 = 2;

/// Slice total for a fleet of `fleet` workers.
pub fn normalization(fleet: usize) -> u32 {
    if fleet < 16 {
        1000
    } else {
        10000
    }
}

/// Outcome of one steady-state proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proposal {
    /// Raw products `previous weight × rate`, one per stage.
    pub raw: Vec<i64>,
    /// `false` when any proposal was zero or violated the stability guard.
    pub balanced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SplitVector {
    weights: Vec<u32>,
}

impl SplitVector {
    /// Build `rounds` slices for a fleet whose per-node override weights are
    /// `overrides` (one per node, in pipeline order).
    pub fn initial(rounds: u32, overrides: &[u32]) -> Self {
        let fleet = overrides.len();
        let mut split = Self {
            weights: Vec::with_capacity(rounds as usize * fleet),
        };
        for _ in 0..rounds {
            split.weights.extend(even_slice(fleet));
        }
        if fleet == 0 {
            return split;
        }
        split.weights[..fleet].copy_from_slice(overrides);
        for round in 0..rounds as usize {
            split.rebalance(round * fleet, fleet);
        }
        split
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weights of the slice starting at `start`.
    pub fn slice(&self, start: usize, fleet: usize) -> &[u32] {
        let end = (start + fleet).min(self.weights.len());
        &self.weights[start.min(end)..end]
    }

    /// Normalize the slice `[start, start + fleet)` so it sums to the
    /// normalization constant with every slot at least 1. The last slot
    /// absorbs the rounding remainder.
    pub fn rebalance(&mut self, start: usize, fleet: usize) {
        if fleet == 0 {
            return;
        }
        self.ensure_len(start + fleet, fleet);
        let norm = normalization(fleet);
        let slice = &mut self.weights[start..start + fleet];

        let total: u64 = slice.iter().map(|&w| u64::from(w)).sum();
        if total == 0 {
            slice.copy_from_slice(&even_slice(fleet));
            return;
        }
        for w in slice.iter_mut() {
            *w = (u64::from(norm) * u64::from(*w) / total) as u32;
            if *w == 0 {
                *w = 1;
            }
        }
        absorb_remainder(slice, norm);
    }

    /// Propose the slice at `start` from the slice before it and the measured
    /// per-stage `rates`, writing the raw products in place.
    ///
    /// Each proposal is checked against the proposals already written for
    /// earlier slots of the same slice, so the guard depends on stage order.
    pub fn propose(&mut self, start: usize, fleet: usize, rates: &[f64]) -> Proposal {
        self.ensure_len(start + fleet, fleet);
        let mut raw = Vec::with_capacity(fleet);
        let mut balanced = start >= fleet && rates.len() == fleet;

        for (j, rate) in rates.iter().take(fleet).enumerate() {
            let previous = start
                .checked_sub(fleet)
                .map(|base| self.weights[base + j])
                .unwrap_or(0);
            let proposed = (f64::from(previous) * rate).clamp(0.0, f64::from(u32::MAX)) as i64;
            raw.push(proposed);

            if proposed == 0 {
                balanced = false;
                continue;
            }
            for earlier in &self.weights[start..start + j] {
                let earlier = i64::from(*earlier);
                if proposed > STABILITY_LIMIT * earlier || proposed < earlier / STABILITY_LIMIT {
                    balanced = false;
                }
            }
            self.weights[start + j] = proposed as u32;
        }

        Proposal { raw, balanced }
    }

    /// Copy the slice before `start` into the slice at `start`.
    pub fn carry_forward(&mut self, start: usize, fleet: usize) {
        if start < fleet {
            return;
        }
        self.ensure_len(start + fleet, fleet);
        self.weights.copy_within(start - fleet..start, start);
    }

    /// Re-split every slice from `part` up to `vgpu` evenly for a fleet of
    /// `fleet` workers, truncating or extending the vector to `vgpu` entries.
    /// Remainder goes to the first slots.
    pub fn refresh(&mut self, part: u32, vgpu: u32, fleet: usize) {
        self.weights.resize(vgpu as usize, 0);
        if fleet == 0 {
            return;
        }
        let even = even_slice(fleet);
        let mut start = part as usize;
        while start < self.weights.len() {
            let end = (start + fleet).min(self.weights.len());
            self.weights[start..end].copy_from_slice(&even[..end - start]);
            start = end;
        }
    }

    /// Extend with even slices until the vector covers `len` entries.
    fn ensure_len(&mut self, len: usize, fleet: usize) {
        while self.weights.len() < len {
            let missing = len - self.weights.len();
            let even = even_slice(fleet);
            self.weights.extend_from_slice(&even[..missing.min(fleet)]);
        }
    }
}

/// `normalization / fleet` per slot, remainder spread over the first slots.
fn even_slice(fleet: usize) -> Vec<u32> {
    if fleet == 0 {
        return Vec::new();
    }
    let norm = normalization(fleet) as usize;
    let base = norm / fleet;
    let extra = norm % fleet;
    (0..fleet)
        .map(|i| (base + usize::from(i < extra)) as u32)
        .collect()
}

fn absorb_remainder(slice: &mut [u32], norm: u32) {
    let sum: i64 = slice.iter().map(|&w| i64::from(w)).sum();
    let mut residual = i64::from(norm) - sum;
    let last = slice.len() - 1;

    if residual >= 0 || i64::from(slice[last]) + residual >= 1 {
        slice[last] = (i64::from(slice[last]) + residual) as u32;
        return;
    }
    // The clamp to 1 overshot and the last slot cannot pay it back alone.
    while residual < 0 {
        let Some((idx, &max)) = slice.iter().enumerate().max_by_key(|(_, w)| **w) else {
            return;
        };
        if max <= 1 {
            return;
        }
        let take = (i64::from(max) - 1).min(-residual);
        slice[idx] -= take as u32;
        residual += take;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
