use core::fmt::Display;
use serde::{Deserialize, Serialize};

use crate::components::{
    ActualSeqMode, CacheLayout, EmptyMode, QuantMode, ScenarioClassification, SplitStrategy,
};

const BASE: u64 = 10_000_000_000_000_000;
const CACHE_DIGIT: u32 = 0;
const TYPE_DIGIT: u32 = 1;
const QUANT_DIGIT: u32 = 2;
const DEQUANT_OPT_DIGIT: u32 = 3;
const GROUP_COMPUTE_DIGIT: u32 = 4;
const EMPTY_DIGIT: u32 = 5;
const ACTUAL_LEN_DIGIT: u32 = 6;
const SPLIT_DIGIT: u32 = 15;

/// Digits every selector may carry, used to reject stray digits on decode.
const USED_DIGITS: [u32; 8] = [
    CACHE_DIGIT,
    TYPE_DIGIT,
    QUANT_DIGIT,
    DEQUANT_OPT_DIGIT,
    GROUP_COMPUTE_DIGIT,
    EMPTY_DIGIT,
    ACTUAL_LEN_DIGIT,
    SPLIT_DIGIT,
];

/// Flat dispatch key of one scenario, one decimal digit per tag over a fixed base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantSelector(u64);

/// The specialized pipeline a selector designates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// No token: the pipeline doesn't run.
    EmptyQuery,
    /// One kernel per classification.
    Kernel(ScenarioClassification),
}

impl VariantSelector {
    /// Packs a classification.
    pub fn encode(scenario: &ScenarioClassification) -> Self {
        if scenario.empty == EmptyMode::EmptyQuery {
            return Self(BASE + digit(EMPTY_DIGIT, EmptyMode::EmptyQuery.tag()));
        }

        let (type_value, quant) = match scenario.quant.tag() {
            None => (1, 0),
            Some(tag) => (2, tag),
        };
        let actual_len = match scenario.actual_len {
            ActualSeqMode::Disabled => 0,
            ActualSeqMode::EnQLen => 1,
        };
        let split = match scenario.split {
            SplitStrategy::ByColumn => 0,
            SplitStrategy::ByToken => 1,
        };

        Self(
            BASE + digit(CACHE_DIGIT, scenario.cache.tag())
                + digit(TYPE_DIGIT, type_value)
                + digit(QUANT_DIGIT, quant)
                + digit(DEQUANT_OPT_DIGIT, scenario.dequant_opt as u64)
                + digit(GROUP_COMPUTE_DIGIT, scenario.group_compute as u64)
                + digit(EMPTY_DIGIT, scenario.empty.tag())
                + digit(ACTUAL_LEN_DIGIT, actual_len)
                + digit(SPLIT_DIGIT, split),
        )
    }

    /// Wraps a raw selector, e.g. one received from a caller.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Unpacks the selector, `None` when a digit is out of range.
    pub fn decode(&self) -> Option<Variant> {
        let offset = self.0.checked_sub(BASE)?;
        if offset >= BASE {
            return None;
        }
        let stray = USED_DIGITS
            .iter()
            .fold(offset, |rest, &position| rest - digit(position, read(offset, position)));
        if stray != 0 {
            return None;
        }

        let empty = EmptyMode::from_tag(read(offset, EMPTY_DIGIT))?;
        if empty == EmptyMode::EmptyQuery {
            return match offset == digit(EMPTY_DIGIT, empty.tag()) {
                true => Some(Variant::EmptyQuery),
                false => None,
            };
        }

        let quant = match (read(offset, TYPE_DIGIT), read(offset, QUANT_DIGIT)) {
            (1, 0) => QuantMode::NoQuant,
            (2, tag) => QuantMode::from_tag(Some(tag))?,
            _ => return None,
        };

        Some(Variant::Kernel(ScenarioClassification {
            quant,
            cache: CacheLayout::from_tag(read(offset, CACHE_DIGIT))?,
            empty,
            actual_len: match read(offset, ACTUAL_LEN_DIGIT) {
                0 => ActualSeqMode::Disabled,
                1 => ActualSeqMode::EnQLen,
                _ => return None,
            },
            split: match read(offset, SPLIT_DIGIT) {
                0 => SplitStrategy::ByColumn,
                1 => SplitStrategy::ByToken,
                _ => return None,
            },
            group_compute: flag(read(offset, GROUP_COMPUTE_DIGIT))?,
            dequant_opt: flag(read(offset, DEQUANT_OPT_DIGIT))?,
        }))
    }
}

impl Display for VariantSelector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Variant {
    /// Variant of a classification, as the planner encodes it.
    pub fn of(scenario: &ScenarioClassification) -> Self {
        match scenario.empty {
            EmptyMode::EmptyQuery => Variant::EmptyQuery,
            _ => Variant::Kernel(*scenario),
        }
    }
}

fn digit(position: u32, value: u64) -> u64 {
    value * 10u64.pow(position)
}

fn read(offset: u64, position: u32) -> u64 {
    offset / 10u64.pow(position) % 10
}

fn flag(value: u64) -> Option<bool> {
    match value {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}
