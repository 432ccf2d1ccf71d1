use std::fmt;
use std::num::NonZero;
use std::ptr::{self, NonNull};

use crate::slot::Slot;

/// Address of a managed (garbage-collected) object.
///
/// The table treats the value as opaque: it is only stored, compared for identity and handed
/// to the collector during root scanning. Managed objects are aligned to
/// [`OBJECT_ALIGNMENT`][Self::OBJECT_ALIGNMENT] bytes, which keeps the low bits of the address
/// free for the slot encoding.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectRef(NonZero<u64>);

impl ObjectRef {
    /// Required alignment of managed object addresses.
    pub const OBJECT_ALIGNMENT: u64 = 8;

    /// Creates an object reference from a managed object address.
    ///
    /// Returns `None` if the address is null or not aligned to
    /// [`OBJECT_ALIGNMENT`][Self::OBJECT_ALIGNMENT].
    #[must_use]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr % Self::OBJECT_ALIGNMENT != 0 {
            return None;
        }

        match NonZero::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// The managed object address.
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The kind of indirect reference a handle represents, encoded in its low bits.
///
/// Only [`RefKind::Local`] handles belong to a [`LocalRefTable`][crate::LocalRefTable]; the
/// other kinds are issued by other parts of the runtime and are rejected by the table.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum RefKind {
    /// A reference to an argument spilled on a managed-to-native transition frame.
    Transition = 0,

    /// A reference held in a per-thread local reference table.
    Local = 1,

    /// A long-lived reference held in a process-wide table.
    Global = 2,

    /// A long-lived reference that does not keep its object alive.
    WeakGlobal = 3,
}

impl RefKind {
    pub(crate) const BITS: u32 = 2;
    pub(crate) const MASK: usize = (1 << Self::BITS) - 1;

    const fn from_bits(bits: usize) -> Self {
        match bits & Self::MASK {
            0 => Self::Transition,
            1 => Self::Local,
            2 => Self::Global,
            _ => Self::WeakGlobal,
        }
    }
}

impl fmt::Display for RefKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transition => "transition",
            Self::Local => "local",
            Self::Global => "global",
            Self::WeakGlobal => "weak global",
        };

        f.write_str(name)
    }
}

/// Opaque indirect handle to a managed object, given to native code instead of a raw pointer.
///
/// The handle is one machine word: the address of the slot holding the reference with the
/// [`RefKind`] in the low two bits. Slots of references created with verification enabled
/// live at an offset of 1 to 3 slots into a 4-slot group, so bits 3 and 4 of the handle
/// carry the serial number the handle was created with.
///
/// A handle stays valid only until it is removed from its table or the segment it was created
/// in is popped. Use [`LocalRefTable::validate_reference()`][crate::LocalRefTable::validate_reference]
/// to check a handle of unknown provenance.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct LocalRef(NonZero<usize>);

impl LocalRef {
    /// Reconstructs a handle from a raw value previously obtained from
    /// [`as_raw()`][Self::as_raw] (e.g. a value that passed through native code).
    ///
    /// Returns `None` for zero, which native code uses for "no reference".
    #[must_use]
    pub const fn from_raw(raw: usize) -> Option<Self> {
        match NonZero::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// The raw handle value to hand to native code.
    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0.get()
    }

    /// The kind of reference encoded in the handle.
    #[must_use]
    pub const fn kind(self) -> RefKind {
        RefKind::from_bits(self.0.get())
    }

    pub(crate) fn from_slot(slot: NonNull<Slot>) -> Self {
        let addr = slot.as_ptr().expose_provenance();

        debug_assert_eq!(addr & RefKind::MASK, 0, "slot is not sufficiently aligned");

        Self(
            NonZero::new(addr | RefKind::Local as usize)
                .expect("tagged handle has the local kind bit set"),
        )
    }

    /// Address of the slot the handle points to, without the kind tag.
    pub(crate) fn slot_addr(self) -> usize {
        self.0.get() & !RefKind::MASK
    }

    /// Pointer to the slot the handle points to. Only dereferenceable for valid handles.
    pub(crate) fn slot_ptr(self) -> *mut Slot {
        ptr::with_exposed_provenance_mut(self.slot_addr())
    }
}

impl fmt::Debug for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRef")
            .field("slot", &format_args!("{:#x}", self.slot_addr()))
            .field("kind", &self.kind())
            .finish()
    }
}

/// Receives each live reference of a table during root scanning.
///
/// The visitor may overwrite the reference to relocate the object; the new value is written
/// back into the slot, so existing handles resolve to the relocated object.
pub trait RootVisitor {
    /// Visits one live reference.
    fn visit_root(&mut self, root: &mut ObjectRef);
}

impl<F> RootVisitor for F
where
    F: FnMut(&mut ObjectRef),
{
    fn visit_root(&mut self, root: &mut ObjectRef) {
        self(root);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_eq_size, assert_impl_all};

    use super::*;

    assert_impl_all!(LocalRef: Send, Sync, Copy);
    assert_impl_all!(ObjectRef: Send, Sync, Copy);
    assert_eq_size!(LocalRef, usize);
    assert_eq_size!(Option<LocalRef>, usize);

    #[test]
    fn object_ref_rejects_null_and_misaligned() {
        assert!(ObjectRef::new(0).is_none());
        assert!(ObjectRef::new(0x1004).is_none());
        assert_eq!(ObjectRef::new(0x1008).unwrap().addr(), 0x1008);
    }

    #[test]
    fn object_ref_display_is_hex() {
        assert_eq!(ObjectRef::new(0xff8).unwrap().to_string(), "0xff8");
    }

    #[test]
    fn kind_is_decoded_from_low_bits() {
        assert_eq!(LocalRef::from_raw(0x1000).unwrap().kind(), RefKind::Transition);
        assert_eq!(LocalRef::from_raw(0x1001).unwrap().kind(), RefKind::Local);
        assert_eq!(LocalRef::from_raw(0x1002).unwrap().kind(), RefKind::Global);
        assert_eq!(LocalRef::from_raw(0x1003).unwrap().kind(), RefKind::WeakGlobal);
    }

    #[test]
    fn raw_roundtrip_strips_kind_for_slot_address() {
        let handle = LocalRef::from_raw(0xABC1).unwrap();

        assert_eq!(handle.as_raw(), 0xABC1);
        assert_eq!(handle.slot_addr(), 0xABC0);
        assert!(LocalRef::from_raw(0).is_none());
    }

    #[test]
    fn closures_are_root_visitors() {
        let mut visited = 0;
        let mut visitor = |root: &mut ObjectRef| {
            visited += 1;
            *root = ObjectRef::new(root.addr() + 8).unwrap();
        };

        let mut root = ObjectRef::new(0x1000).unwrap();
        visitor.visit_root(&mut root);

        assert_eq!(root.addr(), 0x1008);
        assert_eq!(visited, 1);
    }
}
