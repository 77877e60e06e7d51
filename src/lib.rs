//! A USB device stack for the USB-OTG full-speed controller
//!
//! `bdt-usbd` drives the buffer-descriptor-table (BDT) USB controller found
//! in Kinetis-style microcontrollers. It implements the endpoint transfer
//! engine, control transfers and standard device requests, and a CDC-ACM
//! virtual serial port on top.
//!
//! The stack is layered:
//!
//! - [`otg::UsbOtg`] owns the registers and the descriptor table, behind the
//!   [`hal::Hardware`] trait.
//! - [`endpoint::Endpoint`] turns token events into transfers.
//! - [`device::Device`] dispatches interrupts, answers standard requests,
//!   and delegates everything else to a [`device::Class`].
//! - [`cdc::CdcAcm`] is a class; [`cdc::Pipe`] is its application side.
//!
//! To interface the library, you must define a safe implementation of [`Peripherals`].
//!
//! ```no_run
//! use bdt_usbd::{
//!     bdt::DescriptorTable,
//!     cdc::{CdcAcm, Pipe},
//!     descriptors::CDC_ACM,
//!     device::Device,
//!     otg::UsbOtg,
//!     Peripherals,
//! };
//!
//! struct Usb0;
//! unsafe impl Peripherals for Usb0 {
//!     fn usb(&self) -> *const () {
//!         0x4007_2000 as *const ()
//!     }
//! }
//!
//! static BDT: DescriptorTable = DescriptorTable::new();
//! static SERIAL: Pipe<256> = Pipe::new();
//! static mut EP_MEMORY: [u8; 1024] = [0; 1024];
//!
//! let mut otg = UsbOtg::new(Usb0, &BDT);
//! otg.initialize();
//!
//! // Safety: only taken once
//! let memory = unsafe { &mut *core::ptr::addr_of_mut!(EP_MEMORY) };
//! let mut device = Device::new(otg, CdcAcm::new(&SERIAL), &CDC_ACM, memory).unwrap();
//! device.hardware_mut().set_interrupts(true);
//! device.hardware_mut().attach();
//!
//! // In the USB interrupt:
//! device.poll();
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

mod buffer;
mod ral;
mod vcell;

pub mod bdt;
pub mod cdc;
pub mod control;
pub mod descriptors;
pub mod device;
pub mod endpoint;
pub mod hal;
pub mod otg;

pub use control::{Control, Outcome};
pub use device::{Class, Device, Endpoints};
pub use endpoint::{Capabilities, EndpointConfig, TransferState};
pub use hal::Hardware;

/// A type that owns the USB-OTG register block
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the USB-OTG registers. The pointer returned by
/// [`usb()`](Peripherals::usb) is assumed to be valid, and
/// will be cast to a register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals`, for a PAC that hands
/// out the USB0 block as a singleton:
///
/// ```
/// # mod pac {
/// #   pub struct USB0 { _p: () }
/// #   impl USB0 { pub const PTR: *const () = 0x4007_2000 as *const (); }
/// #   pub fn take() -> Option<USB0> { Some(USB0 { _p: () }) }
/// # }
/// use bdt_usbd::Peripherals;
///
/// struct Usb0(pac::USB0);
///
/// unsafe impl Peripherals for Usb0 {
///     fn usb(&self) -> *const () {
///         pac::USB0::PTR
///     }
/// }
///
/// let usb = Usb0(pac::take().unwrap());
/// assert_eq!(usb.usb(), 0x4007_2000 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB-OTG registers
    fn usb(&self) -> *const ();
}
