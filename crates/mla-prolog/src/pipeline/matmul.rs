use alloc::{vec, vec::Vec};
use core::ops::Range;
use mla_prolog_runtime::{
    DispatchCounters, EngineId, EngineState, engine::StateTracker,
};

use crate::pipeline::MatmulInput;
use crate::tiling::BaseTile;

/// Row-major operand window: `rows x cols` elements with a row stride.
#[derive(new, Debug, Clone, Copy)]
pub struct Operand<'a, E> {
    data: &'a [E],
    rows: usize,
    cols: usize,
    stride: usize,
}

impl<'a, E: Copy> Operand<'a, E> {
    /// Dense operand.
    pub fn dense(data: &'a [E], rows: usize, cols: usize) -> Self {
        Self::new(data, rows, cols, cols)
    }

    fn at(&self, row: usize, col: usize) -> E {
        self.data[row * self.stride + col]
    }
}

/// Tiled matmul of one engine.
///
/// The right operand streams through two stage buffers: while tile `k` is consumed, tile `k + 1`
/// is loaded into the other half. The accumulator tile is drained once the reduction is done.
pub struct TileMatmul<'a> {
    engine: EngineId,
    tracker: &'a mut StateTracker,
    counters: &'a DispatchCounters,
}

impl<'a> TileMatmul<'a> {
    pub fn new(
        engine: EngineId,
        tracker: &'a mut StateTracker,
        counters: &'a DispatchCounters,
    ) -> Self {
        Self {
            engine,
            tracker,
            counters,
        }
    }

    /// Computes `lhs x rhs[:, columns]`, returned row-major `[lhs.rows, columns.len()]`.
    pub fn run<I: MatmulInput>(
        &mut self,
        lhs: Operand<'_, I>,
        rhs: Operand<'_, I>,
        columns: Range<usize>,
        base: BaseTile,
    ) -> Vec<I::Out> {
        let rows = lhs.rows;
        let width = columns.len();
        let reduction = lhs.cols;
        let mut out = vec![I::narrow(I::Acc::default()); rows * width];

        if rows == 0 || width == 0 {
            return out;
        }

        let tile_n = (base.n as usize).max(1);
        let tile_k = (base.k as usize).max(1);
        let mut stage: [Vec<I>; 2] = [Vec::new(), Vec::new()];

        for n_start in columns.clone().step_by(tile_n) {
            let n_end = (n_start + tile_n).min(columns.end);
            let n_len = n_end - n_start;
            let mut acc = vec![I::Acc::default(); rows * n_len];

            self.tracker.enter(self.engine, EngineState::Loading);
            load(&rhs, 0..tile_k.min(reduction), n_start..n_end, &mut stage[0]);

            for (index, k_start) in (0..reduction).step_by(tile_k).enumerate() {
                let k_end = (k_start + tile_k).min(reduction);
                let current = index % 2;

                if k_end < reduction {
                    let next = (k_end + tile_k).min(reduction);
                    load(&rhs, k_end..next, n_start..n_end, &mut stage[1 - current]);
                }

                self.tracker.enter(self.engine, EngineState::Computing);
                let tile = &stage[current];
                for row in 0..rows {
                    let acc_row = &mut acc[row * n_len..(row + 1) * n_len];
                    for k in k_start..k_end {
                        let a = lhs.at(row, k);
                        let rhs_row = &tile[(k - k_start) * n_len..(k - k_start + 1) * n_len];
                        for (acc, b) in acc_row.iter_mut().zip(rhs_row) {
                            *acc = I::mul_add(*acc, a, *b);
                        }
                    }
                }
                self.counters.matmul();
            }

            self.tracker.enter(self.engine, EngineState::Draining);
            let offset = n_start - columns.start;
            for row in 0..rows {
                for col in 0..n_len {
                    out[row * width + offset + col] = I::narrow(acc[row * n_len + col]);
                }
            }
        }

        out
    }
}

fn load<E: Copy>(rhs: &Operand<'_, E>, rows: Range<usize>, cols: Range<usize>, buffer: &mut Vec<E>) {
    buffer.clear();
    for row in rows {
        let start = row * rhs.stride;
        buffer.extend_from_slice(&rhs.data[start + cols.start..start + cols.end]);
    }
}
