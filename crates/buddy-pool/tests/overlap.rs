#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use buddy_pool::{HEADER_ALIGN, Pool};
use proptest::{collection::vec, prelude::*};

proptest! {
    #[test]
    fn allocations_never_overlap(
        seed_exp in 6_u8..14,
        sizes in vec(0_usize..6000, 1..64),
    ) {
        let pool = Pool::with_seed(seed_exp, 2).unwrap();
        let mut regions = sizes
            .iter()
            .map(|&size| {
                let ptr = pool.allocate(size).unwrap();
                let info = unsafe { pool.block_info(ptr) };
                prop_assert!(info.class.usable_size() >= size);
                prop_assert_eq!(ptr.as_ptr().addr() % HEADER_ALIGN, 0);
                // the whole block, header included, belongs to this request
                Ok((info.address, info.address + info.class.size()))
            })
            .collect::<Result<Vec<_>, TestCaseError>>()?;

        regions.sort_unstable();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0, "{:#x?} overlaps {:#x?}", pair[0], pair[1]);
        }
        prop_assert_eq!(pool.snapshot().check_invariants(), Ok(()));
    }

    #[test]
    fn freed_memory_is_reused_without_overlap(
        sizes in vec(1_usize..2000, 2..48),
        free_mask in vec(any::<bool>(), 48),
    ) {
        let pool = Pool::with_seed(12, 1).unwrap();
        let mut live = Vec::new();
        for (&size, &free) in sizes.iter().zip(&free_mask) {
            let ptr = pool.allocate(size).unwrap();
            unsafe { ptr.as_ptr().write_bytes(0x5a, size) };
            if free {
                unsafe { pool.deallocate(ptr) };
            } else {
                live.push((ptr, size));
            }
        }
        for &(ptr, size) in &live {
            let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
            prop_assert!(bytes.iter().all(|&b| b == 0x5a));
        }

        let mut regions = live
            .iter()
            .map(|&(ptr, _)| {
                let info = unsafe { pool.block_info(ptr) };
                (info.address, info.address + info.class.size())
            })
            .collect::<Vec<_>>();
        regions.sort_unstable();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
        prop_assert_eq!(pool.snapshot().check_invariants(), Ok(()));
    }
}
