//! Volatile cell for memory shared with the SIE
//!
//! Conforms to the RAL register API, so the `read_reg!` family of
//! macros works on buffer descriptors.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        // Safety: T is Copy, and the cell is never borrowed.
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

// Descriptors live in statics; the SIE is the only other party.
unsafe impl<T: Send> Sync for VCell<T> {}
