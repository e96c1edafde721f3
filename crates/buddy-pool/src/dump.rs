//! Read-only snapshots of a pool's size-class table.
//!
//! A [`TableSnapshot`] copies every linked block header out of the table, so
//! it can be inspected, printed and checked after the pool lock is released.

use core::fmt;

use arrayvec::ArrayVec;

use crate::{
    class::{CLASS_COUNT, SizeClass},
    header::{BlockHeader, BlockState},
    table::SizeClassTable,
};

/// Copy of one block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the header.
    pub address: usize,
    pub prev: usize,
    pub next: usize,
    /// Address of the header of the enclosing chunk.
    pub chunk_base: usize,
    pub state: BlockState,
    pub class: SizeClass,
    /// Split levels open inside the chunk. Only meaningful on a chunk base.
    pub split_depth: u32,
    /// Class the chunk was acquired with. Only meaningful on a chunk base.
    pub chunk_class: SizeClass,
}

impl BlockInfo {
    /// # Safety
    ///
    /// `header` must point to a live header.
    pub(crate) unsafe fn read(header: *const BlockHeader) -> Self {
        unsafe {
            Self {
                address: header.addr(),
                prev: (*header).prev.addr(),
                next: (*header).next.addr(),
                chunk_base: (*header).chunk_base.addr(),
                state: (*header).state,
                class: (*header).class,
                split_depth: (*header).split_depth,
                chunk_class: (*header).chunk_class,
            }
        }
    }

    /// Returns `true` if the block is the base of its chunk.
    #[must_use]
    pub fn is_chunk_base(&self) -> bool {
        self.address == self.chunk_base
    }

    /// Returns the offset of the block from the start of its chunk.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.address - self.chunk_base
    }
}

/// Blocks linked in one class list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSnapshot {
    pub class: SizeClass,
    pub free_bytes: usize,
    /// Blocks in list order, head first.
    pub blocks: Vec<BlockInfo>,
}

impl ClassSnapshot {
    /// Returns the number of free blocks in the list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.blocks.iter().filter(|block| block.state.is_free()).count()
    }
}

/// Copy of every non-empty class list of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    classes: ArrayVec<ClassSnapshot, CLASS_COUNT>,
}

impl TableSnapshot {
    pub(crate) fn capture(table: &SizeClassTable) -> Self {
        let classes = SizeClass::all()
            .filter(|&class| !table.head(class).is_null())
            .map(|class| ClassSnapshot {
                class,
                free_bytes: table.free_bytes(class),
                blocks: table
                    .blocks(class)
                    .map(|block| unsafe { BlockInfo::read(block) })
                    .collect(),
            })
            .collect();
        Self { classes }
    }

    /// Returns the non-empty classes, ascending.
    #[must_use]
    pub fn classes(&self) -> &[ClassSnapshot] {
        &self.classes
    }

    /// Returns the list of `class`, or `None` if it is empty.
    #[must_use]
    pub fn class(&self, class: SizeClass) -> Option<&ClassSnapshot> {
        self.classes.iter().find(|snapshot| snapshot.class == class)
    }

    /// Returns `true` if no block is linked in any class.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns the free-byte counter of `class`.
    #[must_use]
    pub fn free_bytes(&self, class: SizeClass) -> usize {
        self.class(class).map_or(0, |snapshot| snapshot.free_bytes)
    }

    /// Returns the sum of all free-byte counters.
    #[must_use]
    pub fn total_free_bytes(&self) -> usize {
        self.classes.iter().map(|snapshot| snapshot.free_bytes).sum()
    }

    /// Returns the number of blocks linked in `class`.
    #[must_use]
    pub fn block_count(&self, class: SizeClass) -> usize {
        self.class(class).map_or(0, |snapshot| snapshot.blocks.len())
    }

    /// Returns every block, ascending by class and in list order within a
    /// class.
    pub fn blocks(&self) -> impl Iterator<Item = &BlockInfo> {
        self.classes.iter().flat_map(|snapshot| &snapshot.blocks)
    }

    /// Returns the block whose header is at `address`.
    #[must_use]
    pub fn find(&self, address: usize) -> Option<&BlockInfo> {
        self.blocks().find(|block| block.address == address)
    }

    /// Returns every chunk base, ascending by address.
    #[must_use]
    pub fn chunk_bases(&self) -> Vec<&BlockInfo> {
        let mut bases = self
            .blocks()
            .filter(|block| block.is_chunk_base())
            .collect::<Vec<_>>();
        bases.sort_by_key(|block| block.address);
        bases
    }

    /// Checks the structural invariants of the table this snapshot was taken
    /// from, returning the first violation found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for snapshot in &self.classes {
            check_class(snapshot)?;
        }

        for block in self.blocks() {
            let Some(base) = self.find(block.chunk_base).filter(|base| base.is_chunk_base())
            else {
                return Err(InvariantViolation::DanglingChunkBase {
                    address: block.address,
                    chunk_base: block.chunk_base,
                });
            };
            let offset = block.offset();
            if !offset.is_multiple_of(block.class.size())
                || offset + block.class.size() > base.chunk_class.size()
            {
                return Err(InvariantViolation::Misaligned {
                    address: block.address,
                    chunk_base: block.chunk_base,
                    class: block.class,
                });
            }
        }

        for base in self.chunk_bases() {
            let (pieces, covered) = self
                .blocks()
                .filter(|block| block.chunk_base == base.address)
                .fold((0, 0), |(pieces, covered), block| {
                    (pieces + 1, covered + block.class.size())
                });
            if usize::try_from(base.split_depth).ok() != Some(pieces - 1) {
                return Err(InvariantViolation::SplitDepthMismatch {
                    chunk_base: base.address,
                    split_depth: base.split_depth,
                    pieces,
                });
            }
            if covered != base.chunk_class.size() {
                return Err(InvariantViolation::ChunkCoverage {
                    chunk_base: base.address,
                    covered,
                    expected: base.chunk_class.size(),
                });
            }
        }

        Ok(())
    }
}

fn check_class(snapshot: &ClassSnapshot) -> Result<(), InvariantViolation> {
    let blocks = &snapshot.blocks;
    let len = blocks.len();
    for (i, block) in blocks.iter().enumerate() {
        if block.class != snapshot.class {
            return Err(InvariantViolation::ClassMismatch {
                list: snapshot.class,
                address: block.address,
                class: block.class,
            });
        }
        let next = &blocks[(i + 1) % len];
        let prev = &blocks[(i + len - 1) % len];
        if block.next != next.address || block.prev != prev.address {
            return Err(InvariantViolation::BrokenLink {
                class: snapshot.class,
                address: block.address,
            });
        }
    }

    let expected = snapshot.free_count() * snapshot.class.size();
    if snapshot.free_bytes != expected {
        return Err(InvariantViolation::FreeBytesMismatch {
            class: snapshot.class,
            counted: snapshot.free_bytes,
            expected,
        });
    }
    Ok(())
}

/// A structural invariant of the size-class table that does not hold.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
#[non_exhaustive]
pub enum InvariantViolation {
    #[display("class {class}: links around block {address:#x} are inconsistent")]
    BrokenLink { class: SizeClass, address: usize },
    #[display("block {address:#x} of class {class} is linked in the list of class {list}")]
    ClassMismatch {
        list: SizeClass,
        address: usize,
        class: SizeClass,
    },
    #[display("block {address:#x} refers to {chunk_base:#x}, which is not a chunk base")]
    DanglingChunkBase { address: usize, chunk_base: usize },
    #[display("class {class}: free-byte counter is {counted}, free blocks add up to {expected}")]
    FreeBytesMismatch {
        class: SizeClass,
        counted: usize,
        expected: usize,
    },
    #[display("block {address:#x} of class {class} is misplaced in chunk {chunk_base:#x}")]
    Misaligned {
        address: usize,
        chunk_base: usize,
        class: SizeClass,
    },
    #[display("chunk {chunk_base:#x} has split depth {split_depth} but {pieces} piece(s)")]
    SplitDepthMismatch {
        chunk_base: usize,
        split_depth: u32,
        pieces: usize,
    },
    #[display("chunk {chunk_base:#x} covers {covered} bytes, expected {expected}")]
    ChunkCoverage {
        chunk_base: usize,
        covered: usize,
        expected: usize,
    },
}

impl fmt::Display for TableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "+------------------------------------------+")?;
        writeln!(f, "|            size-class table              |")?;
        writeln!(f, "+------------------------------------------+")?;
        if self.classes.is_empty() {
            writeln!(f, "(empty)")?;
        }
        for snapshot in &self.classes {
            writeln!(
                f,
                "class {:>2} ({} bytes): {} block(s), {} free byte(s)",
                snapshot.class,
                snapshot.class.size(),
                snapshot.blocks.len(),
                snapshot.free_bytes,
            )?;
            for block in &snapshot.blocks {
                write!(
                    f,
                    "  {:#014x}  prev={:#014x} next={:#014x} base={:#014x} {:<8}",
                    block.address, block.prev, block.next, block.chunk_base, block.state,
                )?;
                if block.is_chunk_base() {
                    write!(f, " depth={}", block.split_depth)?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn class(exp: u8) -> SizeClass {
        SizeClass::new(exp).unwrap()
    }

    fn info(address: usize, chunk_base: usize, class: SizeClass) -> BlockInfo {
        BlockInfo {
            address,
            prev: address,
            next: address,
            chunk_base,
            state: BlockState::Free,
            class,
            split_depth: 0,
            chunk_class: class,
        }
    }

    /// Two-piece chunk of class 7 at 0x1000: an occupied low half and a free
    /// high half, both of class 6.
    fn split_chunk() -> TableSnapshot {
        let mut low = info(0x1000, 0x1000, class(6));
        low.prev = 0x1040;
        low.next = 0x1040;
        low.state = BlockState::Occupied;
        low.split_depth = 1;
        low.chunk_class = class(7);
        let mut high = info(0x1040, 0x1000, class(6));
        high.prev = 0x1000;
        high.next = 0x1000;

        let mut classes = ArrayVec::new();
        classes.push(ClassSnapshot {
            class: class(6),
            free_bytes: 64,
            blocks: vec![low, high],
        });
        TableSnapshot { classes }
    }

    #[test]
    fn test_capture_empty_table() {
        let snapshot = TableSnapshot::capture(&SizeClassTable::new());
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.total_free_bytes(), 0);
        assert_eq!(snapshot.check_invariants(), Ok(()));
        assert!(snapshot.to_string().contains("(empty)"));
    }

    #[test]
    fn test_queries() {
        let snapshot = split_chunk();
        assert_eq!(snapshot.check_invariants(), Ok(()));
        assert_eq!(snapshot.free_bytes(class(6)), 64);
        assert_eq!(snapshot.free_bytes(class(7)), 0);
        assert_eq!(snapshot.block_count(class(6)), 2);
        assert_eq!(snapshot.class(class(6)).unwrap().free_count(), 1);
        assert_eq!(snapshot.chunk_bases().len(), 1);
        assert_eq!(snapshot.find(0x1040).unwrap().offset(), 64);
        assert_eq!(snapshot.find(0x2000), None);

        let dump = snapshot.to_string();
        assert!(dump.contains("class  6 (64 bytes): 2 block(s), 64 free byte(s)"));
        assert!(dump.contains("occupied"));
        assert!(dump.contains("depth=1"));
    }

    #[test]
    fn test_detects_free_bytes_mismatch() {
        let mut snapshot = split_chunk();
        snapshot.classes[0].free_bytes = 128;
        assert_eq!(
            snapshot.check_invariants(),
            Err(InvariantViolation::FreeBytesMismatch {
                class: class(6),
                counted: 128,
                expected: 64,
            })
        );
    }

    #[test]
    fn test_detects_broken_link() {
        let mut snapshot = split_chunk();
        snapshot.classes[0].blocks[1].next = 0x1040;
        assert_eq!(
            snapshot.check_invariants(),
            Err(InvariantViolation::BrokenLink {
                class: class(6),
                address: 0x1040,
            })
        );
    }

    #[test]
    fn test_detects_split_depth_mismatch() {
        let mut snapshot = split_chunk();
        snapshot.classes[0].blocks[0].split_depth = 0;
        let err = snapshot.check_invariants().unwrap_err();
        assert!(matches!(err, InvariantViolation::SplitDepthMismatch { pieces: 2, .. }));
        assert_eq!(
            err.to_string(),
            "chunk 0x1000 has split depth 0 but 2 piece(s)"
        );
    }

    #[test]
    fn test_detects_misaligned_block() {
        let mut snapshot = split_chunk();
        let high = &mut snapshot.classes[0].blocks[1];
        high.address = 0x1020;
        snapshot.classes[0].blocks[0].prev = 0x1020;
        snapshot.classes[0].blocks[0].next = 0x1020;
        assert!(matches!(
            snapshot.check_invariants(),
            Err(InvariantViolation::Misaligned { address: 0x1020, .. })
        ));
    }

    #[test]
    fn test_detects_dangling_chunk_base() {
        let mut snapshot = split_chunk();
        snapshot.classes[0].blocks[1].chunk_base = 0x3000;
        assert_eq!(
            snapshot.check_invariants(),
            Err(InvariantViolation::DanglingChunkBase {
                address: 0x1040,
                chunk_base: 0x3000,
            })
        );
    }
}
