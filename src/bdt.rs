//! Buffer Descriptor Table (BDT)
//!
//! The module implements a RAL-compatible interface for working
//! with buffer descriptors. Each endpoint has four descriptors:
//! receive even, receive odd, transmit even, transmit odd.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::endpoint::{DataToggle, Parity};
use crate::ral;
use crate::vcell::VCell;
use core::sync::atomic::{compiler_fence, AtomicBool, Ordering};
use usb_device::UsbDirection;

/// Number of endpoints the controller supports
pub const ENDPOINT_COUNT: usize = 16;

/// Who may touch a buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Owner {
    /// Firmware may read and write the descriptor
    Firmware,
    /// The SIE owns the descriptor; firmware must not write it
    Hardware,
}

#[repr(C)]
pub struct BufferDescriptor {
    pub CONTROL: VCell<u32>,
    pub ADDRESS: VCell<u32>,
}

impl BufferDescriptor {
    pub const fn new() -> Self {
        BufferDescriptor {
            CONTROL: VCell::new(0),
            ADDRESS: VCell::new(0),
        }
    }

    /// Returns the current owner of this descriptor
    pub fn owner(&self) -> Owner {
        if ral::read_reg!(crate::bdt, self, CONTROL, OWN == 1) {
            Owner::Hardware
        } else {
            Owner::Firmware
        }
    }

    /// Returns the byte count
    ///
    /// After a token completes, this is the number of bytes moved by the SIE.
    pub fn byte_count(&self) -> usize {
        ral::read_reg!(crate::bdt, self, CONTROL, BC) as usize
    }

    /// Returns the data toggle value stored in this descriptor
    pub fn toggle(&self) -> DataToggle {
        if ral::read_reg!(crate::bdt, self, CONTROL, DATA01 == 1) {
            DataToggle::Data1
        } else {
            DataToggle::Data0
        }
    }

    /// Returns the token PID the SIE wrote back
    ///
    /// Only meaningful when firmware owns the descriptor.
    pub fn token_pid(&self) -> u8 {
        ral::read_reg!(crate::bdt, self, CONTROL, TOK_PID) as u8
    }

    /// Returns the buffer address
    pub fn address(&self) -> u32 {
        self.ADDRESS.read()
    }

    /// Hand the descriptor to the SIE
    ///
    /// The SIE may start using the descriptor as soon as `OWN` is set, so the
    /// address and size are written first. Caller must make sure that firmware
    /// owns the descriptor, and must issue a barrier before the SIE needs to see
    /// the change.
    pub fn arm(&self, address: *const u8, size: usize, toggle: DataToggle) {
        self.ADDRESS.write(address as u32);
        ral::write_reg!(crate::bdt, self, CONTROL,
            BC: size as u32,
            DATA01: toggle as u32,
            DTS: 1
        );
        compiler_fence(Ordering::SeqCst);
        ral::modify_reg!(crate::bdt, self, CONTROL, OWN: 1);
    }

    /// Arm the descriptor with the stall bit set
    pub fn stall(&self) {
        ral::write_reg!(crate::bdt, self, CONTROL, BDT_STALL: 1, DTS: 1);
        compiler_fence(Ordering::SeqCst);
        ral::modify_reg!(crate::bdt, self, CONTROL, OWN: 1);
    }

    /// Reset the descriptor to a firmware-owned, empty state
    ///
    /// Only safe to use when the SIE can't be touching the descriptor: after a
    /// bus reset, or while the endpoint is disabled.
    pub fn clear(&self) {
        self.CONTROL.write(0);
    }
}

pub mod CONTROL {
    pub mod BDT_STALL {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NINC {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod KEEP {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DTS {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TOK_PID {
        pub const offset: u32 = 2;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DATA01 {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod OWN {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod BC {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x3FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Computes the descriptor index for an endpoint, direction, and buffer half
pub const fn index(endpoint: usize, direction: UsbDirection, parity: Parity) -> usize {
    let tx = matches!(direction, UsbDirection::In) as usize;
    endpoint * 4 + tx * 2 + parity as usize
}

/// The whole table, four descriptors per endpoint
///
/// The controller only stores address bits 9 through 31, so the table
/// must be 512-byte aligned.
#[repr(C, align(512))]
pub struct Table([BufferDescriptor; ENDPOINT_COUNT * 4]);

impl Table {
    pub const fn new() -> Self {
        const BD: BufferDescriptor = BufferDescriptor::new();
        Table([BD; ENDPOINT_COUNT * 4])
    }

    /// Returns the descriptor for `endpoint`, `direction` and `parity`
    pub fn get(&self, endpoint: usize, direction: UsbDirection, parity: Parity) -> &BufferDescriptor {
        &self.0[index(endpoint, direction, parity)]
    }

    /// Returns the table's base address, for the BDTPAGE registers
    pub fn as_ptr(&self) -> *const BufferDescriptor {
        self.0.as_ptr()
    }

    /// Clear every descriptor
    pub fn clear(&self) {
        self.0.iter().for_each(BufferDescriptor::clear);
    }
}

/// The descriptor table for one controller
///
/// Allocate it as a `static`, and hand it to [`UsbOtg`](crate::otg::UsbOtg).
///
/// ```
/// use bdt_usbd::bdt::DescriptorTable;
///
/// static BDT: DescriptorTable = DescriptorTable::new();
/// ```
pub struct DescriptorTable {
    table: Table,
    taken: AtomicBool,
}

impl DescriptorTable {
    pub const fn new() -> Self {
        DescriptorTable {
            table: Table::new(),
            taken: AtomicBool::new(false),
        }
    }

    /// Claim the table
    ///
    /// Returns `None` if it was already claimed.
    pub(crate) fn take(&'static self) -> Option<&'static Table> {
        let taken = self.taken.swap(true, Ordering::SeqCst);
        (!taken).then_some(&self.table)
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<BufferDescriptor>() == 8) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<Table>() == 512) as usize];

#[cfg(test)]
mod test {
    use super::{index, BufferDescriptor, Owner, Table};
    use crate::endpoint::{DataToggle, Parity};
    use crate::ral;
    use usb_device::UsbDirection;

    #[test]
    fn byte_count() {
        let bd = BufferDescriptor::new();
        ral::write_reg!(super, &bd, CONTROL, BC: u32::max_value());
        assert_eq!(bd.CONTROL.read(), 0x3FF << 16);
        assert_eq!(bd.byte_count(), 0x3FF);
    }

    #[test]
    fn own() {
        let bd = BufferDescriptor::new();
        assert_eq!(bd.owner(), Owner::Firmware);
        ral::write_reg!(super, &bd, CONTROL, OWN: 1);
        assert_eq!(bd.CONTROL.read(), 1 << 7);
        assert_eq!(bd.owner(), Owner::Hardware);
    }

    #[test]
    fn arm() {
        let bd = BufferDescriptor::new();
        let buffer = [0u8; 64];
        bd.arm(buffer.as_ptr(), 64, DataToggle::Data1);
        assert_eq!(bd.CONTROL.read(), (64 << 16) | (1 << 7) | (1 << 6) | (1 << 3));
        assert_eq!(bd.address(), buffer.as_ptr() as u32);
        assert_eq!(bd.owner(), Owner::Hardware);
        assert_eq!(bd.toggle(), DataToggle::Data1);
    }

    #[test]
    fn token_pid() {
        let bd = BufferDescriptor::new();
        // SIE writes the SETUP PID over the DTS and stall bits
        bd.CONTROL.write((8 << 16) | (0xD << 2));
        assert_eq!(bd.token_pid(), 0xD);
        assert_eq!(bd.byte_count(), 8);
    }

    #[test]
    fn stall() {
        let bd = BufferDescriptor::new();
        bd.stall();
        assert_eq!(bd.CONTROL.read(), (1 << 7) | (1 << 3) | (1 << 2));
    }

    #[test]
    fn indexing() {
        assert_eq!(index(0, UsbDirection::Out, Parity::Even), 0);
        assert_eq!(index(0, UsbDirection::Out, Parity::Odd), 1);
        assert_eq!(index(0, UsbDirection::In, Parity::Even), 2);
        assert_eq!(index(0, UsbDirection::In, Parity::Odd), 3);
        assert_eq!(index(3, UsbDirection::In, Parity::Odd), 15);
        assert_eq!(index(15, UsbDirection::In, Parity::Odd), 63);
    }

    #[test]
    fn table_is_claimed_once() {
        static BDT: super::DescriptorTable = super::DescriptorTable::new();
        let table = BDT.take().unwrap();
        assert_eq!(table.as_ptr() as usize % 512, 0);
        assert!(BDT.take().is_none());
    }

    #[test]
    fn table_alignment() {
        let table = Table::new();
        assert_eq!(table.as_ptr() as usize % 512, 0);
    }
}
