//! Per-invocation replay of a compiled deep-copy program.
//!
//! The cursor is a small state machine: it walks the program forward, emitting one region per
//! root or transfer job and silently stepping pointer arrays, and when it runs off the end it
//! backtracks through an explicit stack of array walks until one has elements left. The shared
//! program is never mutated; all per-job state lives in the cursor.

use crate::error::{OffloadError, OffloadResult};
use crate::rtt::program::{JobKind, RttProgram, SizeBinding};
use crate::rtt::types::{MapType, TypeDescriptor};
use crate::utils::WORD_SIZE;
use std::ptr;

/// Where the cursor reads pointer slots from.
pub trait PointerSource {
    fn read_pointer(&self, addr: usize) -> usize;
}

/// Reads pointer slots straight out of this process's memory.
#[derive(Debug)]
pub struct RawMemory(());

impl RawMemory {
    /// # Safety
    /// Every slot address the cursor derives (the root range and every range reachable
    /// through it) must be readable for as long as this source is used.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self(())
    }
}

impl PointerSource for RawMemory {
    fn read_pointer(&self, addr: usize) -> usize {
        // SAFETY: guaranteed by the contract of `RawMemory::new`.
        unsafe { ptr::read_unaligned(addr as *const usize) }
    }
}

/// The argument a deep copy starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootArgument {
    pub begin: usize,
    pub base: usize,
    pub size: usize,
    pub map_type: MapType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Root,
    Nested,
}

/// One range to map. For nested ranges `base` is the host slot holding `begin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub kind: RegionKind,
    pub base: usize,
    pub begin: usize,
    pub size: usize,
    pub map_type: MapType,
    pub level: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Region(Region),
    End,
}

#[derive(Debug, Clone, Copy, Default)]
struct JobState {
    base: usize,
    idx: usize,
    size: usize,
}

pub struct RttCursor<'a> {
    program: &'a RttProgram,
    source: &'a dyn PointerSource,
    root: RootArgument,
    origin: MapType,
    states: Vec<JobState>,
    pos: usize,
    returning: bool,
    stack: Vec<usize>,
    finished: bool,
}

impl std::fmt::Debug for RttCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RttCursor")
            .field("program", &self.program.id())
            .field("pos", &self.pos)
            .field("returning", &self.returning)
            .field("stack", &self.stack)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<'a> RttCursor<'a> {
    /// Bind `program` to one invocation.
    ///
    /// # Errors
    /// Rejects map types that cannot drive a deep copy, descriptors with too few sizes, and a
    /// root size that disagrees with the descriptor.
    pub fn new(
        program: &'a RttProgram,
        desc: &TypeDescriptor,
        root: RootArgument,
        source: &'a dyn PointerSource,
    ) -> OffloadResult<Self> {
        root.map_type.validate_nested()?;

        let sizes = desc.sizes();
        if sizes.len() < program.sizes_needed() {
            return Err(OffloadError::InvalidDescriptor(format!(
                "type {}: {} sizes given, {} needed",
                desc.id(),
                sizes.len(),
                program.sizes_needed()
            )));
        }
        if root.size != sizes[0] {
            return Err(OffloadError::InvalidDescriptor(format!(
                "type {}: root size {} does not match descriptor size {}",
                desc.id(),
                root.size,
                sizes[0]
            )));
        }

        let states = program
            .jobs()
            .iter()
            .map(|job| JobState {
                size: match job.size {
                    SizeBinding::None => 0,
                    SizeBinding::Bytes(k) => sizes[k],
                    SizeBinding::Slots(k) => sizes[k] / WORD_SIZE,
                },
                ..JobState::default()
            })
            .collect();

        Ok(Self {
            program,
            source,
            root,
            origin: root.map_type - MapType::TARGET_PARAM,
            states,
            pos: 1,
            returning: false,
            stack: Vec::new(),
            finished: false,
        })
    }

    /// First job at or after `pos` that is not a skip.
    fn next_active(&self, pos: usize) -> Option<usize> {
        let jobs = self.program.jobs();
        (pos..jobs.len()).find(|&p| jobs[p].kind != JobKind::Skip)
    }

    fn prime_array(&mut self, after: usize, base: usize) {
        let program = self.program;
        if let Some(next) = self.next_active(after)
            && program.jobs()[next].kind == JobKind::UpdatePtr
        {
            let st = &mut self.states[next];
            st.base = base;
            st.idx = 0;
        }
    }

    fn has_more(&self, pos: usize) -> bool {
        let st = &self.states[pos];
        st.base != 0 && st.idx < st.size
    }

    /// Produce the next region, or [`Step::End`] once the traversal is complete. Calling it
    /// again after the end keeps returning [`Step::End`].
    ///
    /// # Panics
    /// Panics if the cursor walks forward onto the end job, which a compiled program never
    /// allows.
    pub fn advance(&mut self) -> Step {
        if self.finished {
            return Step::End;
        }
        let program = self.program;
        let jobs = program.jobs();

        loop {
            if self.returning {
                loop {
                    let Some(&pos) = self.stack.last() else {
                        self.finished = true;
                        return Step::End;
                    };
                    if self.has_more(pos) {
                        self.pos = pos;
                        self.returning = false;
                        break;
                    }
                    self.stack.pop();
                }
            }

            let pos = self.pos;
            let Some(job) = jobs.get(pos) else {
                self.returning = true;
                continue;
            };

            match job.kind {
                JobKind::End => unreachable!("deep-copy cursor walked onto the end job"),
                JobKind::Skip => self.pos += 1,
                JobKind::UpdatePtr => {
                    if self.stack.last() != Some(&pos) {
                        self.stack.push(pos);
                    }
                    if !self.has_more(pos) {
                        self.returning = true;
                        continue;
                    }
                    let st = &mut self.states[pos];
                    let slot = st.base + st.idx * WORD_SIZE;
                    st.idx += 1;

                    self.pos += 1;
                    if let Some(next) = self.next_active(pos + 1) {
                        self.states[next].base = slot;
                    }
                }
                JobKind::DataTransfer => {
                    let slot = self.states[pos].base;
                    let begin = if slot == 0 {
                        0
                    } else {
                        self.source.read_pointer(slot)
                    };
                    let size = self.states[pos].size;

                    self.pos += 1;
                    self.prime_array(pos + 1, begin);
                    return Step::Region(Region {
                        kind: RegionKind::Nested,
                        base: slot,
                        begin,
                        size,
                        map_type: self.origin | MapType::PTR_AND_OBJ,
                        level: job.level,
                    });
                }
                JobKind::RootRegion => {
                    self.pos += 1;
                    self.prime_array(pos + 1, self.root.begin);
                    return Step::Region(Region {
                        kind: RegionKind::Root,
                        base: self.root.base,
                        begin: self.root.begin,
                        size: self.root.size,
                        map_type: self.root.map_type,
                        level: 0,
                    });
                }
            }
        }
    }
}

impl Iterator for RttCursor<'_> {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        match self.advance() {
            Step::Region(region) => Some(region),
            Step::End => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::types::RttCode;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// Synthetic memory: every slot points somewhere distinct without touching real memory.
    struct Synthetic;

    impl PointerSource for Synthetic {
        fn read_pointer(&self, addr: usize) -> usize {
            (addr + WORD_SIZE) << 4
        }
    }

    struct Table(HashMap<usize, usize>);

    impl PointerSource for Table {
        fn read_pointer(&self, addr: usize) -> usize {
            self.0.get(&addr).copied().unwrap_or(0)
        }
    }

    fn nested(map: MapType) -> MapType {
        map | MapType::NESTED
    }

    fn chain(extents: &[usize], payload: usize) -> TypeDescriptor {
        let mut codes = vec![RttCode::TID | 11, RttCode::PTR];
        codes.extend(std::iter::repeat_n(RttCode::PTR, extents.len()));
        codes.push(RttCode::BUILTIN);
        let mut sizes: Vec<usize> = extents.iter().map(|e| e * WORD_SIZE).collect();
        sizes.push(payload);
        TypeDescriptor::new(codes, sizes).unwrap()
    }

    fn root(size: usize) -> RootArgument {
        RootArgument {
            begin: 0x1000,
            base: 0x1000,
            size,
            map_type: nested(MapType::TO | MapType::FROM | MapType::TARGET_PARAM),
        }
    }

    #[test]
    fn walks_an_array_of_pointers() {
        // struct { int *a[4]; } passed by pointer.
        let desc = chain(&[4], 4);
        let program = RttProgram::compile(&desc).unwrap();
        let mem: HashMap<usize, usize> = (0..4).map(|i| (0x1000 + i * 8, 0x9000 + i * 0x100)).collect();
        let mem = Table(mem);
        let mut cursor = RttCursor::new(&program, &desc, root(32), &mem).unwrap();

        let Step::Region(first) = cursor.advance() else {
            panic!("expected the root region");
        };
        assert_eq!(first.kind, RegionKind::Root);
        assert_eq!((first.begin, first.size), (0x1000, 32));
        assert!(first.map_type.contains(MapType::TARGET_PARAM));

        for i in 0..4 {
            let Step::Region(r) = cursor.advance() else {
                panic!("expected element {i}");
            };
            assert_eq!(r.kind, RegionKind::Nested);
            assert_eq!(r.base, 0x1000 + i * 8);
            assert_eq!(r.begin, 0x9000 + i * 0x100);
            assert_eq!(r.size, 4);
            assert!(r.map_type.contains(MapType::PTR_AND_OBJ));
            assert!(!r.map_type.contains(MapType::TARGET_PARAM));
        }
        assert_eq!(cursor.advance(), Step::End);
        assert_eq!(cursor.advance(), Step::End);
    }

    #[test]
    fn backtracks_through_nested_arrays() {
        let desc = chain(&[3, 2], 16);
        let program = RttProgram::compile(&desc).unwrap();
        let regions: Vec<Region> = RttCursor::new(&program, &desc, root(24), &Synthetic)
            .unwrap()
            .collect();

        // Root, then per outer element one row and its two leaves.
        assert_eq!(regions.len(), 1 + 3 * (1 + 2));
        let levels: Vec<usize> = regions.iter().map(|r| r.level).collect();
        assert_eq!(levels, vec![0, 1, 2, 2, 1, 2, 2, 1, 2, 2]);
        assert_eq!(regions.iter().filter(|r| r.level == 2).count(), 6);
    }

    #[test]
    fn null_slots_are_not_followed() {
        let desc = chain(&[2, 2], 8);
        let program = RttProgram::compile(&desc).unwrap();
        // Only the second row exists.
        let mut mem = HashMap::new();
        mem.insert(0x1008, 0x2000);
        let mem = Table(mem);
        let regions: Vec<Region> = RttCursor::new(&program, &desc, root(16), &mem)
            .unwrap()
            .collect();

        let begins: Vec<usize> = regions.iter().map(|r| r.begin).collect();
        assert_eq!(begins, vec![0x1000, 0, 0x2000, 0, 0]);
    }

    #[test]
    fn zero_extent_arrays_end_immediately() {
        let desc = chain(&[0], 4);
        let program = RttProgram::compile(&desc).unwrap();
        let regions: Vec<Region> = RttCursor::new(&program, &desc, root(0), &Synthetic)
            .unwrap()
            .collect();
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn init_validates_arguments() {
        let desc = chain(&[4], 4);
        let program = RttProgram::compile(&desc).unwrap();

        let mut plain = root(32);
        plain.map_type = MapType::TO;
        assert!(RttCursor::new(&program, &desc, plain, &Synthetic).is_err());

        assert!(matches!(
            RttCursor::new(&program, &desc, root(16), &Synthetic),
            Err(OffloadError::InvalidDescriptor(_))
        ));

        let short = TypeDescriptor::new(
            vec![RttCode::TID | 11, RttCode::PTR, RttCode::PTR, RttCode::BUILTIN],
            vec![32],
        )
        .unwrap();
        assert!(RttCursor::new(&program, &short, root(32), &Synthetic).is_err());
    }

    proptest! {
        #[test]
        fn terminates_with_product_of_extents(extents in prop::collection::vec(1usize..5, 1..4)) {
            let desc = chain(&extents, 8);
            let program = RttProgram::compile(&desc).unwrap();
            let mut cursor = RttCursor::new(&program, &desc, root(extents[0] * WORD_SIZE), &Synthetic).unwrap();

            let bound: usize = 1 + extents.iter().scan(1, |acc, e| { *acc *= e; Some(*acc) }).sum::<usize>();
            let mut leaves = 0;
            let mut steps = 0;
            while let Step::Region(r) = cursor.advance() {
                steps += 1;
                prop_assert!(steps <= bound);
                if r.level == extents.len() {
                    leaves += 1;
                }
            }
            prop_assert_eq!(steps, bound);
            prop_assert_eq!(leaves, extents.iter().product::<usize>());
        }
    }
}
