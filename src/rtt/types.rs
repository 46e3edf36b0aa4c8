use crate::error::{OffloadError, OffloadResult};
use bitflags::bitflags;
use std::fmt;

/// One entry of a runtime type descriptor.
///
/// Codes are bit-tested, not compared: a code is a pointer when [`RttCode::PTR`] is set, and
/// so on. The first code of every descriptor carries [`RttCode::TID`] plus the call-site id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RttCode(pub u64);

impl RttCode {
    pub const BUILTIN: u64 = 0x01;
    pub const PTR: u64 = 0x02;
    pub const STRUCT: u64 = 0x2 << 60;
    pub const TID: u64 = 0x4 << 60;

    #[must_use]
    pub const fn is_builtin(self) -> bool {
        self.0 & Self::BUILTIN != 0
    }

    #[must_use]
    pub const fn is_ptr(self) -> bool {
        self.0 & Self::PTR != 0
    }

    #[must_use]
    pub const fn is_struct(self) -> bool {
        self.0 & Self::STRUCT != 0
    }

    #[must_use]
    pub const fn is_tid(self) -> bool {
        self.0 & Self::TID != 0
    }

    /// Call-site id carried by a TID code.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn id(self) -> u32 {
        (self.0 & !Self::TID) as u32
    }
}

impl fmt::Debug for RttCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RttCode({:#x})", self.0)
    }
}

bitflags! {
    /// Map-type bits attached to every mapped argument.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapType: u64 {
        const TO = 0x001;
        const FROM = 0x002;
        const ALWAYS = 0x004;
        const DELETE = 0x008;
        const PTR_AND_OBJ = 0x010;
        const TARGET_PARAM = 0x020;
        const RETURN_PARAM = 0x040;
        const PRIVATE = 0x080;
        const LITERAL = 0x100;
        const IMPLICIT = 0x200;
        /// Argument is a deep-copy expression with a runtime type descriptor.
        const NESTED = 0x800;
        const MEMBER_OF = 0xffff_0000_0000_0000;
    }
}

impl MapType {
    /// Kinds a deep-copy expression cannot carry.
    pub const UNSUPPORTED_NESTED: Self = Self::RETURN_PARAM
        .union(Self::PRIVATE)
        .union(Self::LITERAL)
        .union(Self::IMPLICIT);

    /// Check that this map type can drive a deep copy.
    ///
    /// # Errors
    /// Rejects types without [`MapType::NESTED`] and types carrying any of
    /// [`MapType::UNSUPPORTED_NESTED`].
    pub fn validate_nested(self) -> OffloadResult<()> {
        if !self.contains(Self::NESTED) {
            return Err(OffloadError::InvalidDescriptor(format!(
                "map type {:#x} is not a deep-copy expression",
                self.bits()
            )));
        }
        let bad = self & Self::UNSUPPORTED_NESTED;
        if !bad.is_empty() {
            return Err(OffloadError::InvalidDescriptor(format!(
                "map type {:#x} not supported for deep copy",
                bad.bits()
            )));
        }
        Ok(())
    }
}

/// A compact runtime type descriptor, as emitted per call site.
///
/// `codes[0]` is the TID code naming the call site; the remaining codes describe the pointer
/// chain. `sizes` holds one byte size per pointer level, outermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    codes: Vec<RttCode>,
    sizes: Vec<usize>,
}

impl TypeDescriptor {
    /// # Errors
    /// Fails if the first code is not a TID code or there are no sizes.
    pub fn new(codes: Vec<u64>, sizes: Vec<usize>) -> OffloadResult<Self> {
        let codes: Vec<RttCode> = codes.into_iter().map(RttCode).collect();
        match codes.first() {
            Some(c) if c.is_tid() => {}
            _ => {
                return Err(OffloadError::InvalidDescriptor(
                    "descriptor must start with a type id".into(),
                ));
            }
        }
        if sizes.is_empty() {
            return Err(OffloadError::InvalidDescriptor("descriptor has no sizes".into()));
        }
        Ok(Self { codes, sizes })
    }

    /// Call-site id; programs are cached under it.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.codes[0].id()
    }

    /// Type codes following the id.
    #[must_use]
    pub fn type_codes(&self) -> &[RttCode] {
        &self.codes[1..]
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_predicates() {
        let tid = RttCode(RttCode::TID | 42);
        assert!(tid.is_tid());
        assert_eq!(tid.id(), 42);
        assert!(RttCode(RttCode::PTR).is_ptr());
        assert!(!RttCode(RttCode::PTR).is_builtin());
        assert!(RttCode(RttCode::STRUCT).is_struct());
        assert!(!RttCode(RttCode::STRUCT).is_ptr());
    }

    #[test]
    fn nested_map_types() {
        let ok = MapType::TO | MapType::FROM | MapType::NESTED | MapType::TARGET_PARAM;
        assert!(ok.validate_nested().is_ok());

        assert!((MapType::TO | MapType::FROM).validate_nested().is_err());
        for bad in [
            MapType::RETURN_PARAM,
            MapType::PRIVATE,
            MapType::LITERAL,
            MapType::IMPLICIT,
        ] {
            assert!(matches!(
                (MapType::NESTED | MapType::TO | bad).validate_nested(),
                Err(OffloadError::InvalidDescriptor(_))
            ));
        }
    }

    #[test]
    fn descriptor_requires_type_id() {
        assert!(TypeDescriptor::new(vec![RttCode::PTR], vec![8]).is_err());
        assert!(TypeDescriptor::new(vec![RttCode::TID | 1, RttCode::PTR], vec![]).is_err());

        let desc = TypeDescriptor::new(
            vec![RttCode::TID | 7, RttCode::PTR, RttCode::PTR, RttCode::BUILTIN],
            vec![32, 4],
        )
        .unwrap();
        assert_eq!(desc.id(), 7);
        assert_eq!(desc.type_codes().len(), 3);
    }
}
