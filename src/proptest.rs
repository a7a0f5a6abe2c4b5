//! Property-Based Tests for Geometry and Parity Arithmetic
//!
//! Uses proptest to systematically verify the chunk mapper and the XOR
//! kernel across the full range of array shapes.
//!
//! # Test Properties
//!
//! 1. **Mapper Bijection**: map(sector) → unmap = sector for every
//!    device count
//! 2. **Chunk Confinement**: a sector and its chunk boundaries land on
//!    the same device
//! 3. **XOR Algebra**: the rolling update is associative with the full
//!    recompute and is its own inverse

#![cfg(test)]

use proptest::prelude::*;

use crate::chunk::{Geometry, MAX_DATA_DEVICES, SECTORS_PER_CHUNK};
use crate::offload::xor_update;

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for valid array widths.
fn device_count_strategy() -> impl Strategy<Value = usize> {
    1usize..=MAX_DATA_DEVICES
}

/// Strategy for global sector numbers well past several stripe rounds.
fn sector_strategy() -> impl Strategy<Value = u64> {
    0u64..1_000_000
}

/// Strategy for equal-length byte triples.
fn lane_triple_strategy() -> impl Strategy<Value = (Vec<u8>, Vec<u8>, Vec<u8>)> {
    (1usize..512).prop_flat_map(|len| {
        (
            prop::collection::vec(any::<u8>(), len),
            prop::collection::vec(any::<u8>(), len),
            prop::collection::vec(any::<u8>(), len),
        )
    })
}

// =============================================================================
// Mapper Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: map then unmap returns the original global sector.
    #[test]
    fn prop_map_unmap_bijection(
        devices in device_count_strategy(),
        sector in sector_strategy(),
    ) {
        let geo = Geometry::new(devices).unwrap();
        let (device_index, local_sector) = geo.map(sector);
        prop_assert!(device_index < devices);
        prop_assert_eq!(geo.unmap(device_index, local_sector), sector);
    }

    /// Property: distinct global sectors never collide on one device slot.
    #[test]
    fn prop_map_injective_within_chunk(
        devices in device_count_strategy(),
        sector in sector_strategy(),
        other in 1u64..SECTORS_PER_CHUNK,
    ) {
        let geo = Geometry::new(devices).unwrap();
        let a = geo.map(sector);
        let b = geo.map(sector + other);
        prop_assert_ne!(a, b);
    }

    /// Property: every sector of a chunk maps to the chunk's device, and
    /// the closed chunk interval contains the sector.
    #[test]
    fn prop_chunk_confinement(
        devices in device_count_strategy(),
        sector in sector_strategy(),
    ) {
        let geo = Geometry::new(devices).unwrap();

        let start = geo.chunk_start_sector(sector);
        let end = geo.chunk_end_sector(sector);
        prop_assert!(start <= sector && sector <= end);
        prop_assert_eq!(end - start + 1, SECTORS_PER_CHUNK);

        prop_assert_eq!(geo.device_index(start), geo.device_index(sector));
        prop_assert_eq!(geo.device_index(end), geo.device_index(sector));
    }

    /// Property: consecutive chunks land on consecutive devices, wrapping
    /// at the array width.
    #[test]
    fn prop_round_robin_rotation(
        devices in device_count_strategy(),
        sector in sector_strategy(),
    ) {
        let geo = Geometry::new(devices).unwrap();
        let here = geo.device_index(sector);
        let next = geo.device_index(geo.chunk_end_sector(sector) + 1);
        prop_assert_eq!(next, (here + 1) % devices);
    }
}

// =============================================================================
// XOR Kernel Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the rolling update equals a full recompute. Starting
    /// from P = old, writing new must leave P = new.
    #[test]
    fn prop_rolling_update_matches_recompute(
        (old, new, _) in lane_triple_strategy(),
    ) {
        let mut parity = old.clone();
        xor_update(&mut parity, &old, &new);
        prop_assert_eq!(parity, new);
    }

    /// Property: the update is its own inverse under old/new swap.
    #[test]
    fn prop_update_self_inverse(
        (parity, old, new) in lane_triple_strategy(),
    ) {
        let original = parity.clone();
        let mut parity = parity;
        xor_update(&mut parity, &old, &new);
        xor_update(&mut parity, &new, &old);
        prop_assert_eq!(parity, original);
    }

    /// Property: applying two updates in either order gives the same
    /// parity (the lanes commute).
    #[test]
    fn prop_updates_commute(
        (parity, a_old, a_new) in lane_triple_strategy(),
    ) {
        let len = parity.len();
        let b_old: Vec<u8> = a_new.iter().map(|b| b.wrapping_mul(3)).collect();
        let b_new: Vec<u8> = a_old.iter().map(|b| b.wrapping_add(7)).collect();

        let mut forward = parity.clone();
        xor_update(&mut forward, &a_old[..len], &a_new[..len]);
        xor_update(&mut forward, &b_old[..len], &b_new[..len]);

        let mut reverse = parity;
        xor_update(&mut reverse, &b_old[..len], &b_new[..len]);
        xor_update(&mut reverse, &a_old[..len], &a_new[..len]);

        prop_assert_eq!(forward, reverse);
    }
}
