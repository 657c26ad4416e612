use alloc::vec::Vec;
use mla_prolog_runtime::{
    memory::{REGION_ALIGNMENT, RegionSpec},
    topology::F32_BLOCK_LANES,
};
use serde::{Deserialize, Serialize};

use crate::components::{ElemType, EmptyMode, QuantMode, ScenarioClassification, ShapeDescriptor};

/// Intermediate tensors kept in the scratch workspace, in pipeline order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
    derive_more::Display,
)]
pub enum RegionKind {
    DequantScaleStaging,
    CqResult,
    CkvKrResult,
    NormalizedCq,
    QcQrResult,
    DequantizedQc,
    QnResult,
}

impl RegionKind {
    /// Every kind, in allocation order.
    pub const ALL: [RegionKind; 7] = [
        RegionKind::DequantScaleStaging,
        RegionKind::CqResult,
        RegionKind::CkvKrResult,
        RegionKind::NormalizedCq,
        RegionKind::QcQrResult,
        RegionKind::DequantizedQc,
        RegionKind::QnResult,
    ];

    /// Static name, for arena diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            RegionKind::DequantScaleStaging => "dequant_scale_staging",
            RegionKind::CqResult => "cq_result",
            RegionKind::CkvKrResult => "ckv_kr_result",
            RegionKind::NormalizedCq => "normalized_cq",
            RegionKind::QcQrResult => "qc_qr_result",
            RegionKind::DequantizedQc => "dequantized_qc",
            RegionKind::QnResult => "qn_result",
        }
    }
}

/// One region of the workspace.
///
/// A region holds `slots` independent copies of a `step x width` row-major tile, one per
/// engine pair under split-by-token.
#[derive(new, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceRegion {
    /// What the region holds.
    pub kind: RegionKind,
    /// Element type.
    pub elem: ElemType,
    /// Elements per token row.
    pub width: u32,
    /// Token rows per slot.
    pub rows: u32,
    /// Number of slots.
    pub slots: u32,
    /// Byte offset within the planned workspace.
    pub offset: u64,
    /// Size in bytes, aligned.
    pub bytes: u64,
}

impl WorkspaceRegion {
    /// Elements in one slot.
    pub fn slot_len(&self) -> usize {
        self.rows as usize * self.width as usize
    }

    /// End offset.
    pub fn end(&self) -> u64 {
        self.offset + self.bytes
    }
}

/// Ordered, non overlapping regions of the scratch workspace.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceLayout {
    regions: Vec<WorkspaceRegion>,
}

/// Element types of the intermediates for one quant mode.
pub fn region_elem(kind: RegionKind, quant: QuantMode) -> ElemType {
    match kind {
        RegionKind::DequantScaleStaging => ElemType::F32,
        RegionKind::CqResult | RegionKind::CkvKrResult => match quant.input_quantized() {
            true => ElemType::I32,
            false => ElemType::BF16,
        },
        RegionKind::NormalizedCq => match quant.query_weight_quantized() {
            true => ElemType::I8,
            false => ElemType::BF16,
        },
        RegionKind::QcQrResult => match quant.query_weight_quantized() {
            true => ElemType::I32,
            false => ElemType::BF16,
        },
        RegionKind::DequantizedQc | RegionKind::QnResult => ElemType::BF16,
    }
}

impl WorkspaceLayout {
    /// Lays out the regions a scenario needs.
    ///
    /// `step` is the wave size and `slots` the number of per pair copies.
    pub fn build(
        shape: &ShapeDescriptor,
        scenario: &ScenarioClassification,
        step: u32,
        slots: u32,
    ) -> Self {
        let mut regions = Vec::new();
        let mut offset = 0u64;

        if scenario.empty == EmptyMode::EmptyQuery {
            return Self { regions };
        }

        for kind in RegionKind::ALL {
            let Some(width) = Self::width(kind, shape, scenario) else {
                continue;
            };
            let elem = region_elem(kind, scenario.quant);
            let bytes = step as u64 * width as u64 * elem.size() as u64 * slots as u64;
            let bytes = bytes.div_ceil(REGION_ALIGNMENT) * REGION_ALIGNMENT;

            regions.push(WorkspaceRegion::new(
                kind, elem, width, step, slots, offset, bytes,
            ));
            offset += bytes;
        }

        Self { regions }
    }

    fn width(
        kind: RegionKind,
        shape: &ShapeDescriptor,
        scenario: &ScenarioClassification,
    ) -> Option<u32> {
        let quant = scenario.quant;

        match kind {
            RegionKind::DequantScaleStaging => scenario
                .stages_dequant_scales()
                .then_some(F32_BLOCK_LANES as u32),
            RegionKind::CqResult => Some(shape.cq),
            RegionKind::CkvKrResult => {
                (scenario.empty != EmptyMode::EmptyCache).then_some(shape.ckv_kr_width())
            }
            RegionKind::NormalizedCq => (region_elem(kind, quant)
                != region_elem(RegionKind::CqResult, quant))
            .then_some(shape.cq),
            RegionKind::QcQrResult => Some(shape.qc_qr_width()),
            RegionKind::DequantizedQc => quant
                .query_weight_quantized()
                .then_some(shape.heads * shape.head_dim),
            RegionKind::QnResult => quant.query_quantized().then_some(shape.heads * shape.ckv),
        }
    }

    /// The region of `kind`, if present.
    pub fn region(&self, kind: RegionKind) -> Option<&WorkspaceRegion> {
        self.regions.iter().find(|region| region.kind == kind)
    }

    /// The region actually backing `kind`. An elided normalized query lives in place, in
    /// the compressed query result.
    pub fn storage(&self, kind: RegionKind) -> Option<&WorkspaceRegion> {
        match (kind, self.region(kind)) {
            (_, Some(region)) => Some(region),
            (RegionKind::NormalizedCq, None) => self.region(RegionKind::CqResult),
            _ => None,
        }
    }

    /// Regions in allocation order.
    pub fn regions(&self) -> &[WorkspaceRegion] {
        &self.regions
    }

    /// Bytes spanned by every region.
    pub fn total_bytes(&self) -> u64 {
        self.regions.last().map(|region| region.end()).unwrap_or(0)
    }

    /// Arena placement of every region.
    pub fn specs(&self) -> Vec<RegionSpec> {
        self.regions
            .iter()
            .map(|region| RegionSpec::new(region.kind.name(), region.offset, region.bytes))
            .collect()
    }
}
