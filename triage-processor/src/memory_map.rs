//! Address-space lookups over a snapshot's memory regions.

use std::cmp::Ordering;

use triage_common::{MemoryRegion, RegionLabel};

use crate::SnapshotError;

/// The result of looking up an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Mapped(&'a MemoryRegion),
    Unmapped,
}

/// A coarse classification of an address, as used by the heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass<'a> {
    /// Close enough to zero that it's most likely a null pointer plus a small offset
    NearNull,
    Mapped(&'a MemoryRegion),
    Unmapped,
}

/// A validated, read-only view of a snapshot's memory regions.
///
/// Regions are kept sorted by start address and never overlap, so lookups are a binary search.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'a> {
    regions: &'a [MemoryRegion],
    null_page_radius: u64,
}

fn compare_address_to_region(address: u64, region: &MemoryRegion) -> Ordering {
    if region.contains(address) {
        Ordering::Equal
    } else if region.start.0 > address {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

impl<'a> MemoryMap<'a> {
    /// Validate `regions` and build a map over them.
    ///
    /// # Errors
    ///
    /// Fails if a region is empty or inverted, or if the regions aren't sorted by start address
    /// or overlap.
    pub fn new(regions: &'a [MemoryRegion], null_page_radius: u64) -> Result<Self, SnapshotError> {
        for region in regions {
            if region.start >= region.end {
                return Err(SnapshotError::EmptyRegion {
                    start: region.start,
                    end: region.end,
                });
            }
        }
        for pair in regions.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            if next.start < previous.start {
                return Err(SnapshotError::UnsortedRegions {
                    previous: previous.start,
                    next: next.start,
                });
            }
            if next.start < previous.end {
                return Err(SnapshotError::OverlappingRegions {
                    previous_end: previous.end,
                    next_start: next.start,
                });
            }
        }
        Ok(MemoryMap {
            regions,
            null_page_radius,
        })
    }

    /// Find the region containing `address`.
    pub fn lookup(&self, address: u64) -> Lookup<'a> {
        match self
            .regions
            .binary_search_by(|region| compare_address_to_region(address, region))
        {
            Ok(index) => Lookup::Mapped(&self.regions[index]),
            Err(_) => Lookup::Unmapped,
        }
    }

    /// The region containing `address`, if any.
    pub fn region(&self, address: u64) -> Option<&'a MemoryRegion> {
        match self.lookup(address) {
            Lookup::Mapped(region) => Some(region),
            Lookup::Unmapped => None,
        }
    }

    pub fn region_label(&self, address: u64) -> Option<RegionLabel> {
        self.region(address).map(|region| region.label)
    }

    pub fn is_near_null(&self, address: u64) -> bool {
        address < self.null_page_radius
    }

    pub fn null_page_radius(&self) -> u64 {
        self.null_page_radius
    }

    /// Near-null takes precedence over whatever happens to be mapped at low addresses.
    pub fn classify(&self, address: u64) -> AddressClass<'a> {
        if self.is_near_null(address) {
            return AddressClass::NearNull;
        }
        match self.lookup(address) {
            Lookup::Mapped(region) => AddressClass::Mapped(region),
            Lookup::Unmapped => AddressClass::Unmapped,
        }
    }

    /// Whether the snapshot carried any regions at all.
    ///
    /// With an empty map every address looks unmapped, so heuristics that depend on mappings
    /// must abstain.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &'a [MemoryRegion] {
        self.regions
    }

    pub fn is_executable(&self, address: u64) -> bool {
        self.region(address)
            .is_some_and(|region| region.permissions.execute)
    }

    pub fn is_writable(&self, address: u64) -> bool {
        self.region(address)
            .is_some_and(|region| region.permissions.write)
    }

    pub fn has_stack(&self) -> bool {
        self.regions
            .iter()
            .any(|region| region.label == RegionLabel::Stack)
    }

    pub fn in_stack(&self, address: u64) -> bool {
        self.region(address)
            .is_some_and(|region| region.label == RegionLabel::Stack)
    }

    pub fn in_heap(&self, address: u64) -> bool {
        self.region(address)
            .is_some_and(|region| region.label == RegionLabel::Heap)
    }

    /// The stack region whose guard zone contains `address`.
    ///
    /// Stacks grow down, so the guard zone is the unmapped `distance` bytes just below the start
    /// of a stack region.
    pub fn stack_guard_for(&self, address: u64, distance: u64) -> Option<&'a MemoryRegion> {
        if self.region(address).is_some() {
            return None;
        }
        self.regions.iter().find(|region| {
            region.label == RegionLabel::Stack
                && address < region.start.0
                && region.start.0 - address <= distance
        })
    }

    pub fn is_stack_guard(&self, address: u64, distance: u64) -> bool {
        self.stack_guard_for(address, distance).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use triage_common::Permissions;

    fn regions() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion::new(0x1000, 0x2000, Permissions::READ_ONLY, RegionLabel::Unknown),
            MemoryRegion::new(0x40_0000, 0x40_1000, Permissions::READ_EXECUTE, RegionLabel::Module),
            MemoryRegion::new(0x60_0000, 0x62_0000, Permissions::READ_WRITE, RegionLabel::Heap),
            MemoryRegion::new(0x7ff0_0000, 0x7ff2_0000, Permissions::READ_WRITE, RegionLabel::Stack),
        ]
    }

    #[test]
    fn test_lookup() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();

        assert_eq!(map.lookup(0x40_0000), Lookup::Mapped(&regions[1]));
        assert_eq!(map.lookup(0x40_0fff), Lookup::Mapped(&regions[1]));
        assert_eq!(map.lookup(0x40_1000), Lookup::Unmapped);
        assert_eq!(map.lookup(0), Lookup::Unmapped);
        assert_eq!(map.lookup(u64::MAX), Lookup::Unmapped);
        assert!(map.is_executable(0x40_0800));
        assert!(!map.is_writable(0x40_0800));
        assert!(map.in_heap(0x61_0000));
        assert!(map.in_stack(0x7ff1_0000));
        assert_eq!(map.region_label(0x61_0000), Some(RegionLabel::Heap));
        assert_eq!(map.region_label(0x3000), None);
    }

    #[test]
    fn test_classify() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        assert_eq!(map.classify(0x8), AddressClass::NearNull);
        assert_eq!(map.classify(0x1008), AddressClass::Mapped(&regions[0]));
        assert_eq!(map.classify(0x3000), AddressClass::Unmapped);

        // mapped memory inside the radius is still near null
        let map = MemoryMap::new(&regions, 0x10000).unwrap();
        assert_eq!(map.classify(0x1008), AddressClass::NearNull);
    }

    #[test]
    fn test_guard_zone() {
        let regions = regions();
        let map = MemoryMap::new(&regions, 0x1000).unwrap();
        assert_eq!(
            map.stack_guard_for(0x7fef_f000, 0x10000),
            Some(&regions[3])
        );
        assert!(map.is_stack_guard(0x7fef_fff8, 0x10000));
        assert_eq!(map.stack_guard_for(0x7fe0_0000, 0x10000), None);
        assert_eq!(map.stack_guard_for(0x7ff1_0000, 0x10000), None);
    }

    #[test]
    fn test_invalid_regions() {
        let mut bad = regions();
        bad.swap(1, 2);
        assert!(matches!(
            MemoryMap::new(&bad, 0x1000),
            Err(SnapshotError::UnsortedRegions { .. })
        ));

        let mut bad = regions();
        bad[1].end = triage_common::Address(0x60_0001);
        assert!(matches!(
            MemoryMap::new(&bad, 0x1000),
            Err(SnapshotError::OverlappingRegions { .. })
        ));

        let mut bad = regions();
        bad[0].end = bad[0].start;
        assert!(matches!(
            MemoryMap::new(&bad, 0x1000),
            Err(SnapshotError::EmptyRegion { .. })
        ));

        assert!(MemoryMap::new(&[], 0x1000).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_matches_linear_scan() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        let mut regions = Vec::new();
        let mut cursor = 0x1_0000u64;
        for _ in 0..200 {
            cursor += rng.gen_range(0..0x4000);
            let len = rng.gen_range(1..0x2000);
            regions.push(MemoryRegion::new(
                cursor,
                cursor + len,
                Permissions::READ_WRITE,
                RegionLabel::Anonymous,
            ));
            cursor += len;
        }
        let map = MemoryMap::new(&regions, 0x1000).unwrap();

        for _ in 0..5000 {
            let address = rng.gen_range(0..cursor + 0x1000);
            let expected = regions.iter().find(|region| region.contains(address));
            assert_eq!(map.region(address), expected, "address {address:#x}");
        }
    }
}
