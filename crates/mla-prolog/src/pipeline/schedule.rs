use alloc::vec::Vec;
use core::ops::Range;
use mla_prolog_runtime::{
    EngineId, EngineKind, FlagScope, Instruction, Program, Topology, Wave,
    engine::WaveProgram, topology::VECTOR_ENGINES_PER_MATRIX,
};

use crate::components::{EmptyMode, SplitStrategy};
use crate::pipeline::PipelineFlag;
use crate::tiling::PrologPlan;

/// Compute stages of the prolog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrologStage {
    MatmulCq,
    MatmulCkvKr,
    MatmulQcQr,
    MatmulQn,
    NormalizeCq,
    NormalizeScatterCkv,
    RopeScatterKr,
    RopeQr,
    DequantizeQc,
    QuantizeQn,
}

impl PrologStage {
    /// Engine class running the stage.
    pub fn engine_kind(&self) -> EngineKind {
        match self {
            PrologStage::MatmulCq
            | PrologStage::MatmulCkvKr
            | PrologStage::MatmulQcQr
            | PrologStage::MatmulQn => EngineKind::Matrix,
            _ => EngineKind::Vector,
        }
    }
}

type PrologInstruction = Instruction<PrologStage, PipelineFlag>;

/// Programs of every engine of one run.
#[derive(Debug, Clone)]
pub struct PrologSchedule {
    /// One per matrix engine.
    pub matrix: Vec<Program<PrologStage, PipelineFlag>>,
    /// One per vector engine, paired `2c` and `2c + 1` with matrix engine `c`.
    pub vector: Vec<Program<PrologStage, PipelineFlag>>,
}

impl PrologSchedule {
    /// Fixes the instruction stream of every engine.
    pub fn build(plan: &PrologPlan) -> Self {
        let block_dim = plan.block_dim();
        let mut matrix = Vec::with_capacity(block_dim as usize);
        let mut vector = Vec::with_capacity((block_dim * VECTOR_ENGINES_PER_MATRIX) as usize);

        for pair in 0..block_dim {
            let scope = flag_scope(plan, pair);
            let waves = waves(plan, pair);

            matrix.push(Program::new(
                EngineId::matrix(pair),
                waves
                    .iter()
                    .map(|wave| WaveProgram::new(*wave, matrix_wave(plan, scope)))
                    .collect(),
            ));
            for lane in 0..VECTOR_ENGINES_PER_MATRIX {
                vector.push(Program::new(
                    EngineId::vector(pair * VECTOR_ENGINES_PER_MATRIX + lane),
                    waves
                        .iter()
                        .map(|wave| WaveProgram::new(*wave, vector_wave(plan, scope)))
                        .collect(),
                ));
            }
        }

        Self { matrix, vector }
    }

    /// Waves run by matrix engines, summed over engines.
    pub fn matrix_waves(&self) -> usize {
        self.matrix.iter().map(|program| program.waves.len()).sum()
    }
}

/// Flag scope of the pair around matrix engine `pair`.
pub fn flag_scope(plan: &PrologPlan, pair: u32) -> FlagScope {
    match plan.scenario.split {
        SplitStrategy::ByToken => FlagScope::Pair(pair),
        SplitStrategy::ByColumn => FlagScope::Global,
    }
}

/// Token slices processed by the pair around matrix engine `pair`.
pub fn waves(plan: &PrologPlan, pair: u32) -> Vec<Wave> {
    let step = plan.tiling.step.max(1);
    let tokens = match plan.tiling.token_split {
        Some(split) => split.tokens(pair),
        None => 0..plan.shape.tokens(),
    };

    tokens
        .clone()
        .step_by(step as usize)
        .enumerate()
        .map(|(index, start)| Wave::new(index as u32, start, step.min(tokens.end - start)))
        .collect()
}

/// Wave relative rows handled by `vector` out of `rows`.
pub fn vector_rows(plan: &PrologPlan, vector: u32, rows: u32) -> Range<u32> {
    match plan.scenario.split {
        SplitStrategy::ByToken => {
            let half = rows / 2;
            match Topology::is_back_vector(vector) {
                false => 0..half,
                true => half..rows,
            }
        }
        SplitStrategy::ByColumn => {
            let parts = rows
                .min(plan.tiling.vector_block_num)
                .min(plan.block_dim() * VECTOR_ENGINES_PER_MATRIX);
            chunk(vector, parts, rows)
        }
    }
}

/// Heads handled by `vector` when dequantization is split by head.
pub fn vector_heads(plan: &PrologPlan, vector: u32) -> Range<u32> {
    let heads = plan.shape.heads;

    match plan.scenario.split {
        SplitStrategy::ByToken => chunk(
            vector % VECTOR_ENGINES_PER_MATRIX,
            VECTOR_ENGINES_PER_MATRIX,
            heads,
        ),
        SplitStrategy::ByColumn => chunk(
            vector,
            heads.min(plan.block_dim() * VECTOR_ENGINES_PER_MATRIX),
            heads,
        ),
    }
}

fn chunk(index: u32, parts: u32, len: u32) -> Range<u32> {
    if index >= parts {
        return len..len;
    }

    let size = len.div_ceil(parts);
    let start = (index * size).min(len);
    start..(start + size).min(len)
}

fn matrix_wave(plan: &PrologPlan, scope: FlagScope) -> Vec<PrologInstruction> {
    let quant = plan.scenario.quant;
    let mut program = Vec::with_capacity(12);

    program.push(Instruction::Compute(PrologStage::MatmulCq));
    program.push(raise(PipelineFlag::MmCq, scope));
    if plan.scenario.empty != EmptyMode::EmptyCache {
        program.push(Instruction::Compute(PrologStage::MatmulCkvKr));
        program.push(raise(PipelineFlag::MmCkvKr, scope));
    }

    program.push(wait(PipelineFlag::VecNormCq, scope));
    program.push(Instruction::Compute(PrologStage::MatmulQcQr));
    program.push(raise(PipelineFlag::MmQcQr, scope));

    if quant.query_weight_quantized() {
        program.push(wait(PipelineFlag::VecDequantQc, scope));
    } else if scope == FlagScope::Global {
        // Head slices of the absorption span columns written by other matrix engines.
        program.push(wait(PipelineFlag::MmQcQr, scope));
    }

    program.push(Instruction::Compute(PrologStage::MatmulQn));
    if quant.query_quantized() {
        program.push(raise(PipelineFlag::MmQn, scope));
    }
    program.push(wait(PipelineFlag::WaveDrained, scope));

    program
}

fn vector_wave(plan: &PrologPlan, scope: FlagScope) -> Vec<PrologInstruction> {
    let quant = plan.scenario.quant;
    let mut program = Vec::with_capacity(14);

    program.push(wait(PipelineFlag::MmCq, scope));
    program.push(Instruction::Compute(PrologStage::NormalizeCq));
    program.push(raise(PipelineFlag::VecNormCq, scope));

    if plan.scenario.empty != EmptyMode::EmptyCache {
        program.push(wait(PipelineFlag::MmCkvKr, scope));
        program.push(Instruction::Compute(PrologStage::NormalizeScatterCkv));
        program.push(Instruction::Compute(PrologStage::RopeScatterKr));
    }

    program.push(wait(PipelineFlag::MmQcQr, scope));
    program.push(Instruction::Compute(PrologStage::RopeQr));
    if quant.query_weight_quantized() {
        program.push(Instruction::Compute(PrologStage::DequantizeQc));
        program.push(raise(PipelineFlag::VecDequantQc, scope));
    }

    if quant.query_quantized() {
        program.push(wait(PipelineFlag::MmQn, scope));
        program.push(Instruction::Compute(PrologStage::QuantizeQn));
    }
    program.push(raise(PipelineFlag::WaveDrained, scope));

    program
}

fn raise(flag: PipelineFlag, scope: FlagScope) -> PrologInstruction {
    Instruction::Raise { flag, scope }
}

fn wait(flag: PipelineFlag, scope: FlagScope) -> PrologInstruction {
    Instruction::Wait { flag, scope }
}
