#![allow(clippy::cast_sign_loss)]

use std::sync::OnceLock;

/// Machine word size; every translation table field and every patched pointer is one word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

const FALLBACK_PAGE_SIZE: usize = 4096;

#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
#[must_use]
pub const fn checked_align_up(val: usize, align: usize) -> Option<usize> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn align_down(val: usize, align: usize) -> usize {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: usize, align: usize) -> bool {
    val & (align - 1) == 0
}

/// Host page size as reported by `sysconf`, cached after the first query.
#[must_use]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret <= 0 {
            FALLBACK_PAGE_SIZE
        } else {
            ret as usize
        }
    })
}

#[must_use]
pub fn page_align(size: usize) -> usize {
    align_up(size, page_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(0x2000, 0x1000));
        assert!(!is_aligned(0x2008, 0x1000));
    }

    #[test]
    fn checked_alignment_near_the_top() {
        assert_eq!(checked_align_up(17, 16), Some(32));
        assert_eq!(checked_align_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
        assert_eq!(checked_align_up(usize::MAX - 14, 16), None);
        assert_eq!(checked_align_up(usize::MAX, 4096), None);
    }

    #[test]
    fn page_size_is_power_of_two() {
        let pg = page_size();
        assert!(pg >= 4096);
        assert!(pg.is_power_of_two());
        assert_eq!(page_align(1), pg);
    }
}
