use alloc::vec::Vec;
use bytemuck::Pod;
use core::fmt::Display;
use core::marker::PhantomData;
use std::sync::RwLock;

/// Alignment, in bytes, of every region start.
pub const REGION_ALIGNMENT: u64 = 32;

/// Placement of one region inside the workspace.
#[derive(new, Debug, Clone, PartialEq, Eq)]
pub struct RegionSpec {
    /// Region name, for diagnostics.
    pub name: &'static str,
    /// Byte offset of the region within the workspace.
    pub offset: u64,
    /// Region size in bytes.
    pub bytes: u64,
}

/// Index of a region inside an [Arena].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub(crate) usize);

/// Typed window into one region: an element offset, a length and an element type.
///
/// Views are plain descriptors. Data is only reached through [Arena::read] and
/// [Arena::write], which check bounds and alignment against the region.
#[derive(Debug)]
pub struct ArenaView<T> {
    region: RegionId,
    byte_offset: usize,
    len: usize,
    _elem: PhantomData<T>,
}

impl<T> Clone for ArenaView<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArenaView<T> {}

impl<T: Pod> ArenaView<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset within the region.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Size in bytes.
    pub fn bytes(&self) -> usize {
        self.len * core::mem::size_of::<T>()
    }

    /// Sub-view of `len` elements starting `offset` elements in.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Self, ArenaError> {
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(ArenaError::OutOfBounds {
                region: self.region.0,
                end: offset
                    .saturating_add(len)
                    .saturating_mul(core::mem::size_of::<T>())
                    .saturating_add(self.byte_offset),
                bytes: self.byte_offset + self.bytes(),
            });
        }

        Ok(Self {
            region: self.region,
            byte_offset: self.byte_offset + offset * core::mem::size_of::<T>(),
            len,
            _elem: PhantomData,
        })
    }
}

/// Errors raised when touching the arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// The region index doesn't exist.
    UnknownRegion(usize),
    /// A view reaches past the end of its region.
    OutOfBounds {
        /// Region index.
        region: usize,
        /// End of the requested range, in bytes.
        end: usize,
        /// Region size, in bytes.
        bytes: usize,
    },
    /// A view doesn't start on an element boundary.
    Misaligned {
        /// Region index.
        region: usize,
        /// Start of the view, in bytes.
        byte_offset: usize,
        /// Element size of the view.
        elem_size: usize,
    },
    /// An engine panicked while holding a region lock.
    Poisoned(&'static str),
}

impl Display for ArenaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArenaError::UnknownRegion(index) => write!(f, "no arena region with index {index}"),
            ArenaError::OutOfBounds { region, end, bytes } => write!(
                f,
                "view ending at byte {end} overflows region {region} of {bytes} bytes"
            ),
            ArenaError::Misaligned {
                region,
                byte_offset,
                elem_size,
            } => write!(
                f,
                "view at byte {byte_offset} of region {region} is not aligned for {elem_size}-byte elements"
            ),
            ArenaError::Poisoned(name) => write!(f, "region {name} lock is poisoned"),
        }
    }
}

#[derive(Debug)]
struct ArenaRegion {
    spec: RegionSpec,
    // Backed by u64 words so every region start is 8-byte aligned.
    storage: RwLock<Vec<u64>>,
}

/// Scratch workspace split into independently locked regions.
///
/// Engines write disjoint ranges of a region; the per-region lock only keeps concurrent
/// accesses memory safe, ordering between producer and consumer comes from the flags.
#[derive(Debug)]
pub struct Arena {
    regions: Vec<ArenaRegion>,
}

impl Arena {
    /// Allocates every region up front, zero filled.
    pub fn new<I: IntoIterator<Item = RegionSpec>>(specs: I) -> Self {
        let regions = specs
            .into_iter()
            .map(|spec| {
                let words = spec.bytes.div_ceil(8) as usize;
                ArenaRegion {
                    spec,
                    storage: RwLock::new(alloc::vec![0u64; words]),
                }
            })
            .collect();

        Self { regions }
    }

    /// Region handle by position in the construction order.
    pub fn region(&self, index: usize) -> Result<RegionId, ArenaError> {
        if index < self.regions.len() {
            Ok(RegionId(index))
        } else {
            Err(ArenaError::UnknownRegion(index))
        }
    }

    /// Placement of a region.
    pub fn spec(&self, region: RegionId) -> Result<&RegionSpec, ArenaError> {
        self.regions
            .get(region.0)
            .map(|region| &region.spec)
            .ok_or(ArenaError::UnknownRegion(region.0))
    }

    /// Number of regions.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Total bytes held by the arena.
    pub fn total_bytes(&self) -> u64 {
        self.regions.iter().map(|region| region.spec.bytes).sum()
    }

    /// Typed view of `len` elements starting at element `offset` of `region`.
    pub fn view<T: Pod>(
        &self,
        region: RegionId,
        offset: usize,
        len: usize,
    ) -> Result<ArenaView<T>, ArenaError> {
        let spec = self.spec(region)?;
        let size = core::mem::size_of::<T>();
        let overflow = || ArenaError::OutOfBounds {
            region: region.0,
            end: usize::MAX,
            bytes: spec.bytes as usize,
        };
        let byte_offset = offset.checked_mul(size).ok_or_else(overflow)?;
        let end = len
            .checked_mul(size)
            .and_then(|bytes| bytes.checked_add(byte_offset))
            .ok_or_else(overflow)?;

        if end as u64 > spec.bytes {
            return Err(ArenaError::OutOfBounds {
                region: region.0,
                end,
                bytes: spec.bytes as usize,
            });
        }

        Ok(ArenaView {
            region,
            byte_offset,
            len,
            _elem: PhantomData,
        })
    }

    /// Runs `func` over the elements of `view`.
    pub fn read<T: Pod, R>(
        &self,
        view: &ArenaView<T>,
        func: impl FnOnce(&[T]) -> R,
    ) -> Result<R, ArenaError> {
        let region = self.get(view.region)?;
        let storage = region
            .storage
            .read()
            .map_err(|_| ArenaError::Poisoned(region.spec.name))?;
        let bytes: &[u8] = bytemuck::cast_slice(storage.as_slice());
        let window = bytes
            .get(view.byte_offset..view.byte_offset + view.bytes())
            .ok_or_else(|| out_of_bounds(view, bytes.len()))?;
        let items = bytemuck::try_cast_slice::<u8, T>(window).map_err(|_| ArenaError::Misaligned {
            region: view.region.0,
            byte_offset: view.byte_offset,
            elem_size: core::mem::size_of::<T>(),
        })?;

        Ok(func(items))
    }

    /// Runs `func` over the elements of `view`, mutably.
    pub fn write<T: Pod, R>(
        &self,
        view: &ArenaView<T>,
        func: impl FnOnce(&mut [T]) -> R,
    ) -> Result<R, ArenaError> {
        let region = self.get(view.region)?;
        let mut storage = region
            .storage
            .write()
            .map_err(|_| ArenaError::Poisoned(region.spec.name))?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(storage.as_mut_slice());
        let total = bytes.len();
        let window = bytes
            .get_mut(view.byte_offset..view.byte_offset + view.bytes())
            .ok_or_else(|| out_of_bounds(view, total))?;
        let items =
            bytemuck::try_cast_slice_mut::<u8, T>(window).map_err(|_| ArenaError::Misaligned {
                region: view.region.0,
                byte_offset: view.byte_offset,
                elem_size: core::mem::size_of::<T>(),
            })?;

        Ok(func(items))
    }

    /// Copies the elements of `view` out.
    pub fn to_vec<T: Pod>(&self, view: &ArenaView<T>) -> Result<Vec<T>, ArenaError> {
        self.read(view, |items| items.to_vec())
    }

    /// Overwrites `view` with `values`, which must have the same length.
    pub fn store<T: Pod>(&self, view: &ArenaView<T>, values: &[T]) -> Result<(), ArenaError> {
        if values.len() != view.len {
            return Err(ArenaError::OutOfBounds {
                region: view.region.0,
                end: view.byte_offset + values.len() * core::mem::size_of::<T>(),
                bytes: view.byte_offset + view.bytes(),
            });
        }
        self.write(view, |items| items.copy_from_slice(values))
    }

    fn get(&self, region: RegionId) -> Result<&ArenaRegion, ArenaError> {
        self.regions
            .get(region.0)
            .ok_or(ArenaError::UnknownRegion(region.0))
    }
}

fn out_of_bounds<T: Pod>(view: &ArenaView<T>, bytes: usize) -> ArenaError {
    ArenaError::OutOfBounds {
        region: view.region.0,
        end: view.byte_offset + view.bytes(),
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::new([
            RegionSpec::new("first", 0, 64),
            RegionSpec::new("second", 64, 128),
        ])
    }

    #[test]
    fn views_are_bounds_checked() {
        let arena = arena();
        let region = arena.region(0).unwrap();

        assert!(arena.view::<u32>(region, 0, 16).is_ok());
        assert!(matches!(
            arena.view::<u32>(region, 1, 16),
            Err(ArenaError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn overflowing_views_are_out_of_bounds() {
        let arena = arena();
        let region = arena.region(0).unwrap();

        assert!(matches!(
            arena.view::<u64>(region, usize::MAX / 4, 1),
            Err(ArenaError::OutOfBounds { .. })
        ));
        assert!(matches!(
            arena.view::<u32>(region, 4, usize::MAX / 2),
            Err(ArenaError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn unknown_region_is_rejected() {
        assert_eq!(arena().region(2), Err(ArenaError::UnknownRegion(2)));
    }

    #[test]
    fn written_values_are_read_back() {
        let arena = arena();
        let region = arena.region(1).unwrap();
        let view = arena.view::<i32>(region, 4, 3).unwrap();

        arena.store(&view, &[1, -2, 3]).unwrap();

        assert_eq!(arena.to_vec(&view).unwrap(), vec![1, -2, 3]);
    }

    #[test]
    fn sub_views_stay_inside_parent() {
        let arena = arena();
        let region = arena.region(0).unwrap();
        let view = arena.view::<u16>(region, 0, 8).unwrap();

        assert_eq!(view.slice(4, 4).unwrap().byte_offset(), 8);
        assert!(view.slice(6, 4).is_err());
    }
}
