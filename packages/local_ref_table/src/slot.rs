//! Storage format of a single table entry.
//!
//! Valid bit patterns of the low 32 bits (the high bits are only used by references):
//!
//! ```text
//!                   33222222222211111111110000000000
//!                   10987654321098765432109876543210
//!   null:           00000000000000000000000000000000  // Only above the top index.
//!   reference:      <----- reference value ----->000  // See `ObjectRef::OBJECT_ALIGNMENT`.
//!   free:           <-------- next free --------->01
//!   serial number:  <------ serial number ------->10  // Verification mode group header.
//! ```
//!
//! Serial number entries only appear as the first entry of a naturally aligned group of
//! [`ENTRIES_PER_CHECKED_REFERENCE`] entries. The serial number in the range `[1, 3]` selects
//! which of the other three entries of the group is currently in use.

use std::fmt;

use crate::ObjectRef;

/// Number of slots consumed by one reference created with verification enabled: one header
/// holding the serial number plus three candidate slots rotated through on reuse.
pub const ENTRIES_PER_CHECKED_REFERENCE: u32 = 4;

/// Size of one slot in bytes.
pub(crate) const SLOT_SIZE: usize = size_of::<Slot>();

const FLAG_FREE: u64 = 1 << 0;
const FLAG_SERIAL_NUMBER: u64 = 1 << 1;
const FIELD_SHIFT: u32 = 2;
const FIELD_BITS: u32 = u32::BITS - FIELD_SHIFT;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;

/// The next-free value that terminates the free list.
pub(crate) const FREE_LIST_END: u32 = (1 << FIELD_BITS) - 1;

/// Written into slots that are popped off the top so that stale reads stand out.
const DEAD_SLOT_VALUE: u64 = 0xdead_10c0;

// The reference encoding relies on the flag bits being clear in every object address.
const _: () = assert!(ObjectRef::OBJECT_ALIGNMENT > FLAG_FREE);
const _: () = assert!(ObjectRef::OBJECT_ALIGNMENT > FLAG_SERIAL_NUMBER);
const _: () = assert!(DEAD_SLOT_VALUE % ObjectRef::OBJECT_ALIGNMENT == 0);

/// One table entry. See the module documentation for the encoding.
#[repr(C, align(8))]
pub(crate) struct Slot {
    raw: u64,
}

// Handles carry their kind in the low bits of the slot address.
const _: () = assert!(align_of::<Slot>() > crate::RefKind::MASK);
const _: () = assert!(SLOT_SIZE == 8);

/// Decoded view of a [`Slot`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SlotState {
    Null,
    Reference(ObjectRef),
    Free { next_free: u32 },
    SerialNumber(u32),
}

impl Slot {
    #[cfg(test)]
    pub(crate) const fn null() -> Self {
        Self { raw: 0 }
    }

    pub(crate) fn is_null(&self) -> bool {
        self.raw == 0
    }

    pub(crate) fn is_free(&self) -> bool {
        self.raw & FLAG_FREE != 0
    }

    pub(crate) fn is_serial_number(&self) -> bool {
        self.raw & FLAG_SERIAL_NUMBER != 0
    }

    pub(crate) fn reference(&self) -> ObjectRef {
        debug_assert!(!self.is_free() && !self.is_serial_number() && !self.is_null());

        ObjectRef::new(self.raw).expect("slot holding a reference has a valid object address")
    }

    pub(crate) fn set_reference(&mut self, obj: ObjectRef) {
        self.raw = obj.addr();
    }

    pub(crate) fn next_free(&self) -> u32 {
        debug_assert!(self.is_free() && !self.is_serial_number());

        self.field()
    }

    pub(crate) fn set_next_free(&mut self, next_free: u32) {
        self.raw = Self::encode_field(next_free) | FLAG_FREE;
    }

    pub(crate) fn serial_number(&self) -> u32 {
        debug_assert!(self.is_serial_number() && !self.is_free());

        self.field()
    }

    /// Reads the serial number field whatever the slot currently holds. The slot may have held
    /// a reference or a free list link before verification was enabled.
    pub(crate) fn serial_number_unchecked(&self) -> u32 {
        self.field()
    }

    pub(crate) fn set_serial_number(&mut self, serial_number: u32) {
        self.raw = Self::encode_field(serial_number) | FLAG_SERIAL_NUMBER;
    }

    pub(crate) fn set_dead(&mut self) {
        self.raw = DEAD_SLOT_VALUE;
    }

    pub(crate) fn state(&self) -> SlotState {
        if self.is_null() {
            SlotState::Null
        } else if self.is_free() {
            SlotState::Free {
                next_free: self.field(),
            }
        } else if self.is_serial_number() {
            SlotState::SerialNumber(self.field())
        } else {
            SlotState::Reference(self.reference())
        }
    }

    fn field(&self) -> u32 {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to the field width, which fits in u32"
        )]
        let field = ((self.raw >> FIELD_SHIFT) & FIELD_MASK) as u32;

        field
    }

    fn encode_field(value: u32) -> u64 {
        debug_assert!(u64::from(value) <= FIELD_MASK, "slot field value {value} out of range");

        u64::from(value) << FIELD_SHIFT
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state().fmt(f)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn null_slot() {
        let slot = Slot::null();

        assert!(slot.is_null());
        assert!(!slot.is_free());
        assert!(!slot.is_serial_number());
        assert_eq!(slot.state(), SlotState::Null);
    }

    #[test]
    fn reference_slot() {
        let obj = ObjectRef::new(0x7fff_1234_5678).unwrap();
        let mut slot = Slot::null();

        slot.set_reference(obj);

        assert!(!slot.is_free());
        assert!(!slot.is_serial_number());
        assert_eq!(slot.reference(), obj);
        assert_eq!(slot.state(), SlotState::Reference(obj));
    }

    #[test]
    fn free_slot_holds_next_index() {
        let mut slot = Slot::null();

        slot.set_next_free(12345);
        assert!(slot.is_free());
        assert!(!slot.is_serial_number());
        assert_eq!(slot.next_free(), 12345);

        slot.set_next_free(FREE_LIST_END);
        assert_eq!(slot.next_free(), FREE_LIST_END);
        assert_eq!(
            slot.state(),
            SlotState::Free {
                next_free: FREE_LIST_END
            }
        );
    }

    #[test]
    fn serial_number_slot() {
        let mut slot = Slot::null();

        slot.set_serial_number(3);

        assert!(slot.is_serial_number());
        assert!(!slot.is_free());
        assert_eq!(slot.serial_number(), 3);
        assert_eq!(slot.state(), SlotState::SerialNumber(3));
    }

    #[test]
    fn unchecked_serial_number_reads_any_state() {
        let mut slot = Slot::null();
        assert_eq!(slot.serial_number_unchecked(), 0);

        slot.set_next_free(6);
        assert_eq!(slot.serial_number_unchecked() % ENTRIES_PER_CHECKED_REFERENCE, 2);
    }

    #[test]
    fn dead_slot_reads_as_reference() {
        let mut slot = Slot::null();

        slot.set_dead();

        assert!(!slot.is_null());
        assert!(!slot.is_free());
        assert!(!slot.is_serial_number());
    }
}
