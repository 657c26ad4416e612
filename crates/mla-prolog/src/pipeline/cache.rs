use alloc::{format, vec, vec::Vec};

use crate::components::{
    ActualSeqMode, CacheLayout, EmptyMode, ExecutionError, ShapeDescriptor, TokenLayout,
};
use crate::pipeline::{PrologInputs, TensorElement, io::buffer_mismatch};
use crate::tiling::PrologPlan;

/// Where tokens land in the paged caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlots {
    layout: CacheLayout,
    block_size: usize,
    slots: Vec<Option<usize>>,
}

impl CacheSlots {
    /// Resolves the slot of every token, `None` for tokens that aren't written.
    pub fn resolve(plan: &PrologPlan, inputs: &PrologInputs) -> Result<Self, ExecutionError> {
        let shape = &plan.shape;
        let tokens = shape.tokens() as usize;
        let capacity = shape.cache_slots() as usize;

        if plan.scenario.empty == EmptyMode::EmptyCache {
            return Ok(Self {
                layout: plan.scenario.cache,
                block_size: shape.block_size as usize,
                slots: vec![None; tokens],
            });
        }

        let index = inputs
            .cache_index
            .as_slice::<i64>()
            .ok_or_else(|| buffer_mismatch("cache_index", format!("must be int64, got {}", inputs.cache_index.elem())))?;

        let raw: Vec<i64> = match plan.scenario.cache.is_block_table() {
            false => {
                if index.len() < tokens {
                    return Err(buffer_mismatch(
                        "cache_index",
                        format!("has {} entries for {tokens} tokens", index.len()),
                    ));
                }
                index[..tokens].to_vec()
            }
            true => block_table_slots(plan, inputs, index)?,
        };

        let slots = raw
            .into_iter()
            .enumerate()
            .map(|(token, slot)| match slot {
                slot if slot < 0 => Ok(None),
                slot if slot as usize >= capacity => Err(ExecutionError::CacheSlotOutOfRange {
                    token: token as u32,
                    slot,
                    capacity,
                }),
                slot => Ok(Some(slot as usize)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            layout: plan.scenario.cache,
            block_size: shape.block_size as usize,
            slots,
        })
    }

    /// Slot of `token`.
    pub fn slot(&self, token: u32) -> Option<usize> {
        self.slots.get(token as usize).copied().flatten()
    }

    /// Writes `row` as the cache row of `token`. Returns whether anything was written.
    pub fn write_row<E: TensorElement>(&self, cache: &mut [E], token: u32, row: &[E]) -> bool {
        let Some(slot) = self.slot(token) else {
            return false;
        };

        let width = row.len();
        if self.layout.is_nz() {
            let c0 = E::ELEM.dma_align() as usize;
            for (channel, value) in row.iter().enumerate() {
                cache[nz_offset(slot, channel, width, self.block_size, c0)] = *value;
            }
        } else {
            cache[slot * width..(slot + 1) * width].copy_from_slice(row);
        }
        true
    }

    /// Writes every `(token, row)` pair. Returns the number of rows written.
    pub fn scatter<E: TensorElement>(&self, cache: &mut [E], rows: &[(u32, Vec<E>)]) -> u64 {
        rows.iter()
            .filter(|(token, row)| self.write_row(cache, *token, row))
            .count() as u64
    }
}

/// Element offset of `(slot, channel)` in a fractal cache whose blocks are stored as
/// `[width / c0, block_size, c0]`.
pub fn nz_offset(slot: usize, channel: usize, width: usize, block_size: usize, c0: usize) -> usize {
    let block = slot / block_size;
    let position = slot % block_size;

    block * block_size * width + (channel / c0) * block_size * c0 + position * c0 + channel % c0
}

fn block_table_slots(
    plan: &PrologPlan,
    inputs: &PrologInputs,
    table: &[i64],
) -> Result<Vec<i64>, ExecutionError> {
    let shape: &ShapeDescriptor = &plan.shape;
    let block_size = shape.block_size as i64;
    let max_blocks = match inputs.cache_index.shape.as_slice() {
        [_, max_blocks] => *max_blocks,
        other => {
            return Err(buffer_mismatch(
                "cache_index",
                format!("block table must be [batch, max_blocks], got {other:?}"),
            ));
        }
    };

    let positions = token_positions(plan, inputs)?;
    let mut slots = Vec::with_capacity(positions.len());

    for (batch, position) in positions {
        let entry = batch * max_blocks + position / block_size as usize;
        let block = match table.get(entry) {
            Some(block) if position / (block_size as usize) < max_blocks => *block,
            _ => {
                return Err(buffer_mismatch(
                    "cache_index",
                    format!("has no block for request {batch} position {position}"),
                ));
            }
        };
        slots.push(match block < 0 {
            true => -1,
            false => block * block_size + position as i64 % block_size,
        });
    }

    Ok(slots)
}

/// `(request, position)` of every token.
fn token_positions(
    plan: &PrologPlan,
    inputs: &PrologInputs,
) -> Result<Vec<(usize, usize)>, ExecutionError> {
    let tokens = plan.shape.tokens() as usize;

    match (plan.scenario.actual_len, plan.shape.layout) {
        (ActualSeqMode::EnQLen, _) => {
            let ends = inputs
                .actual_seq_len
                .as_ref()
                .and_then(|tensor| tensor.as_slice::<i64>())
                .ok_or_else(|| buffer_mismatch("actual_seq_len", "must be int64 and present".into()))?;

            let mut positions = Vec::with_capacity(tokens);
            let mut start = 0usize;
            for (batch, end) in ends.iter().enumerate() {
                let end = (*end).clamp(start as i64, tokens as i64) as usize;
                positions.extend((start..end).map(|token| (batch, token - start)));
                start = end;
            }
            if positions.len() != tokens {
                return Err(buffer_mismatch(
                    "actual_seq_len",
                    format!("covers {} of {tokens} tokens", positions.len()),
                ));
            }

            Ok(positions)
        }
        (ActualSeqMode::Disabled, TokenLayout::Batched { seq, .. }) => {
            let seq = seq as usize;
            Ok((0..tokens).map(|token| (token / seq, token % seq)).collect())
        }
        (ActualSeqMode::Disabled, TokenLayout::Fused { .. }) => {
            Ok((0..tokens).map(|token| (0, token)).collect())
        }
    }
}
