use crate::error::{OffloadError, OffloadResult};
use crate::mm::layout::AddressLayout;
use crate::utils::{align_down, page_align, page_size};
use std::collections::BTreeMap;
use std::io;
use std::sync::Mutex;

// Attempts at finding a window before giving up; each failed attempt skips one candidate.
const RESERVE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CommittedRegion {
    end: usize,
    ref_count: u32,
}

/// An inaccessible reservation of host address space, inside which read-write pages are
/// committed on demand.
///
/// The reservation is created with `MAP_FIXED_NOREPLACE`, so it never clobbers an existing
/// mapping; everything committed later is placed with `MAP_FIXED` strictly inside it.
/// Dropping the reservation unmaps the whole range, committed pages included.
#[derive(Debug)]
pub struct AddressReservation {
    base: usize,
    len: usize,
    committed: Mutex<BTreeMap<usize, CommittedRegion>>,
}

impl AddressReservation {
    /// Reserve `[base, base + len)`.
    ///
    /// # Errors
    /// Fails with `AlreadyExists` if any part of the range is mapped already.
    pub fn reserve(base: usize, len: usize) -> io::Result<Self> {
        let ret = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_NORESERVE
                    | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };

        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Kernels older than 4.17 treat the flag as a plain hint.
        if ret as usize != base {
            unsafe {
                libc::munmap(ret, len);
            }
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }

        Ok(Self {
            base,
            len,
            committed: Mutex::new(BTreeMap::new()),
        })
    }

    /// Probe for a free window of `slices` slices and reserve it, retrying past candidates
    /// another mapping claimed in the meantime.
    ///
    /// # Errors
    /// Returns an error if no candidate window could be reserved.
    pub fn reserve_window(slice_bits: u32, slices: usize) -> OffloadResult<(AddressLayout, Self)> {
        let mut skip = Vec::new();

        for _ in 0..RESERVE_ATTEMPTS {
            let layout = AddressLayout::probe(slice_bits, slices, &skip)?;
            match Self::reserve(layout.base(), layout.len()) {
                Ok(reservation) => return Ok((layout, reservation)),
                Err(e) => {
                    log::debug!("Window {:#x} unavailable: {e}", layout.base());
                    skip.push(layout.base());
                }
            }
        }

        Err(OffloadError::AddressSpaceExhausted)
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.base && addr + len <= self.base + self.len
    }

    /// Make `[begin, begin + size)` readable and writable.
    ///
    /// A range already inside a committed region only bumps that region's reference count; a
    /// range starting inside (or right after) a region and running past its end extends the
    /// region in place. Anything else becomes a new region.
    ///
    /// # Errors
    /// Fails if the range leaves the reservation, collides with a region it cannot extend,
    /// or the kernel refuses the mapping.
    pub fn register(&self, begin: usize, size: usize) -> OffloadResult<()> {
        let align_begin = align_down(begin, page_size());
        let align_end = page_align(begin + size);

        if !self.contains(align_begin, align_end - align_begin) {
            return Err(OffloadError::AddressSpaceExhausted);
        }

        let mut committed = self
            .committed
            .lock()
            .map_err(|_| OffloadError::General("region registry poisoned".into()))?;

        let prev = committed
            .range(..=align_begin)
            .next_back()
            .filter(|(_, r)| r.end >= align_begin)
            .map(|(&start, r)| (start, *r));

        if let Some((start, region)) = prev {
            if region.end >= align_end {
                if let Some(r) = committed.get_mut(&start) {
                    r.ref_count += 1;
                }
                return Ok(());
            }

            // Extend forward, provided nothing is committed in the way.
            if committed.range(region.end..align_end).next().is_some() {
                return Err(OffloadError::General(format!(
                    "cannot extend region {start:#x}..{:#x} to {align_end:#x}",
                    region.end
                )));
            }
            Self::commit(region.end, align_end - region.end)?;
            if let Some(r) = committed.get_mut(&start) {
                r.end = align_end;
                r.ref_count += 1;
            }
            log::debug!("Extended region {start:#x} to {align_end:#x}");
            return Ok(());
        }

        if committed.range(align_begin..align_end).next().is_some() {
            return Err(OffloadError::General(format!(
                "range {align_begin:#x}..{align_end:#x} straddles a committed region"
            )));
        }

        Self::commit(align_begin, align_end - align_begin)?;
        committed.insert(
            align_begin,
            CommittedRegion {
                end: align_end,
                ref_count: 1,
            },
        );
        Ok(())
    }

    /// Committed regions as `(begin, end, ref_count)`, ascending.
    #[must_use]
    pub fn regions(&self) -> Vec<(usize, usize, u32)> {
        self.committed
            .lock()
            .map(|c| c.iter().map(|(&b, r)| (b, r.end, r.ref_count)).collect())
            .unwrap_or_default()
    }

    fn commit(addr: usize, len: usize) -> OffloadResult<()> {
        // MAP_FIXED is safe here: callers only pass ranges inside our own reservation.
        let ret = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        debug_assert_eq!(ret as usize, addr);
        Ok(())
    }
}

impl Drop for AddressReservation {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        if ret != 0 {
            log::error!(
                "Failed to release reservation {:#x}: {}",
                self.base,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> (AddressLayout, AddressReservation) {
        AddressReservation::reserve_window(32, 1).unwrap()
    }

    #[test]
    fn reservation_refuses_overlap() {
        let (layout, res) = window();
        assert!(AddressReservation::reserve(layout.base(), page_size()).is_err());
        drop(res);
    }

    #[test]
    fn committed_pages_are_writable() {
        let (_, res) = window();
        let pg = page_size();
        res.register(res.base(), pg).unwrap();
        unsafe {
            let p = res.base() as *mut u64;
            p.write(0xfeed_beef);
            assert_eq!(p.read(), 0xfeed_beef);
        }
        assert_eq!(res.regions(), vec![(res.base(), res.base() + pg, 1)]);
    }

    #[test]
    fn registration_extends_and_counts() {
        let (_, res) = window();
        let pg = page_size();
        let base = res.base();

        res.register(base, pg).unwrap();
        // Contained.
        res.register(base + 8, 16).unwrap();
        assert_eq!(res.regions(), vec![(base, base + pg, 2)]);

        // Adjacent and longer: extends in place.
        res.register(base + pg, 2 * pg).unwrap();
        assert_eq!(res.regions(), vec![(base, base + 3 * pg, 3)]);

        // Detached.
        res.register(base + 10 * pg, pg).unwrap();
        assert_eq!(res.regions().len(), 2);

        unsafe {
            let p = (base + 3 * pg - 8) as *mut u64;
            p.write(7);
            assert_eq!(p.read(), 7);
        }
    }

    #[test]
    fn registration_outside_window_fails() {
        let (_, res) = window();
        assert!(matches!(
            res.register(res.base() + res.len(), 16),
            Err(OffloadError::AddressSpaceExhausted)
        ));
    }
}
