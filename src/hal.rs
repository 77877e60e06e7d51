//! The boundary between the protocol engine and the USB controller
//!
//! Everything above this module speaks in endpoints, directions and buffer
//! halves. Raw register and descriptor bits stay below it, in the
//! [`otg`](crate::otg) implementation.

use crate::bdt::Owner;
use crate::endpoint::{Capabilities, DataToggle, Parity};
use usb_device::{endpoint::EndpointType, UsbDirection};

/// Token PIDs written back by the SIE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum Pid {
    Out = 0x1,
    In = 0x9,
    Setup = 0xD,
}

impl Pid {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x1 => Some(Pid::Out),
            0x9 => Some(Pid::In),
            0xD => Some(Pid::Setup),
            _ => None,
        }
    }
}

/// A completed token, as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct Token {
    pub endpoint: usize,
    pub direction: UsbDirection,
    /// The buffer half that the SIE used
    pub parity: Parity,
    pub pid: Pid,
}

/// A snapshot of one buffer descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub owner: Owner,
    pub byte_count: usize,
    pub toggle: DataToggle,
}

bitflags::bitflags! {
    /// USB interrupt causes
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupt : u8 {
        const USB_RESET = 1 << 0;
        const ERROR = 1 << 1;
        const SOF = 1 << 2;
        const TOKEN_DONE = 1 << 3;
        const SLEEP = 1 << 4;
        const RESUME = 1 << 5;
        const STALL = 1 << 7;
    }
}

/// Operations the protocol engine needs from a USB controller
pub trait Hardware {
    /// Read the state of a buffer descriptor
    fn descriptor(&self, endpoint: usize, direction: UsbDirection, parity: Parity) -> Descriptor;

    /// Hand a buffer descriptor to the SIE
    ///
    /// Returns `WouldBlock`, and leaves the descriptor alone, if the SIE
    /// already owns it.
    fn arm(
        &mut self,
        endpoint: usize,
        direction: UsbDirection,
        parity: Parity,
        buffer: *const u8,
        size: usize,
        toggle: DataToggle,
    ) -> usb_device::Result<()>;

    /// Enable handshaking on an endpoint
    fn enable_endpoint(&mut self, endpoint: usize, capabilities: Capabilities, kind: EndpointType);

    /// Disable an endpoint, and reclaim its descriptors
    ///
    /// Once the endpoint is disabled the SIE no longer owns its descriptors.
    /// The SIE's buffer half selection is left alone.
    fn disable_endpoint(&mut self, endpoint: usize);

    /// Stall or unstall an endpoint
    fn set_stalled(&mut self, endpoint: usize, stalled: bool);

    /// Indicates if the endpoint is stalled
    fn is_stalled(&self, endpoint: usize) -> bool;

    /// Set the device address
    fn set_address(&mut self, address: u8);

    /// Let the SIE process tokens again, after it suspended itself on a SETUP
    fn resume_token_processing(&mut self);

    /// Respond to a bus reset: reclaim every descriptor, return the SIE to the
    /// even buffers, and go back to address zero
    fn bus_reset(&mut self);

    /// Return the pending interrupt causes
    fn poll(&mut self) -> Interrupt;

    /// Pop the next completed token
    ///
    /// Only valid while `TOKEN_DONE` is pending. Clears `TOKEN_DONE`.
    fn token(&mut self) -> Token;

    /// Acknowledge interrupt causes
    fn clear(&mut self, interrupts: Interrupt);

    /// The current frame number
    fn frame_number(&self) -> u16;
}

/// A simulated SIE and host, for tests
///
/// Descriptor bits are kept in a real [`Table`](crate::bdt::Table). The
/// host side moves bytes to and from the armed buffers, hands descriptors
/// back to firmware, and queues the resulting tokens.
#[cfg(test)]
pub(crate) mod sim {
    use super::{Descriptor, Hardware, Interrupt, Pid, Token};
    use crate::bdt::{index, Owner, Table, ENDPOINT_COUNT};
    use crate::endpoint::{Capabilities, DataToggle, Parity};
    use std::{boxed::Box, collections::VecDeque, vec::Vec};
    use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

    /// A packet seen on the wire
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Packet {
        pub data: Vec<u8>,
        pub toggle: DataToggle,
    }

    pub struct Sim {
        table: Box<Table>,
        addresses: [*const u8; ENDPOINT_COUNT * 4],
        /// Next buffer half the SIE will use, per descriptor pair
        sie_parity: [Parity; ENDPOINT_COUNT * 2],
        tokens: VecDeque<Token>,
        pending: Interrupt,
        pub enabled: [Option<(Capabilities, EndpointType)>; ENDPOINT_COUNT],
        pub stalled: [bool; ENDPOINT_COUNT],
        pub address: u8,
        pub resumed: usize,
        pub frame: u16,
    }

    impl Sim {
        pub fn new() -> Self {
            Sim {
                table: Box::new(Table::new()),
                addresses: [core::ptr::null(); ENDPOINT_COUNT * 4],
                sie_parity: [Parity::Even; ENDPOINT_COUNT * 2],
                tokens: VecDeque::new(),
                pending: Interrupt::empty(),
                enabled: [None; ENDPOINT_COUNT],
                stalled: [false; ENDPOINT_COUNT],
                address: 0,
                resumed: 0,
                frame: 0,
            }
        }

        fn pair(endpoint: usize, direction: UsbDirection) -> usize {
            endpoint * 2 + matches!(direction, UsbDirection::In) as usize
        }

        /// Claim the descriptor the SIE would use next, if it's armed
        fn claim(&mut self, endpoint: usize, direction: UsbDirection) -> Option<(usize, Parity)> {
            if self.stalled[endpoint] {
                self.pending |= Interrupt::STALL;
                return None;
            }
            let parity = self.sie_parity[Self::pair(endpoint, direction)];
            let bd = self.table.get(endpoint, direction, parity);
            if bd.owner() == Owner::Hardware {
                Some((index(endpoint, direction, parity), parity))
            } else {
                None
            }
        }

        fn complete(
            &mut self,
            endpoint: usize,
            direction: UsbDirection,
            parity: Parity,
            pid: Pid,
            count: usize,
        ) {
            let bd = self.table.get(endpoint, direction, parity);
            let toggle = bd.toggle() as u32;
            bd.CONTROL
                .write(((count as u32) << 16) | (toggle << 6) | ((pid as u32) << 2));
            let pair = Self::pair(endpoint, direction);
            self.sie_parity[pair] = self.sie_parity[pair].flip();
            self.tokens.push_back(Token {
                endpoint,
                direction,
                parity,
                pid,
            });
            self.pending |= Interrupt::TOKEN_DONE;
        }

        /// The host issues an IN token; returns the packet, or `None` for a NAK
        pub fn host_in(&mut self, endpoint: usize) -> Option<Packet> {
            let (idx, parity) = self.claim(endpoint, UsbDirection::In)?;
            let bd = self.table.get(endpoint, UsbDirection::In, parity);
            let size = bd.byte_count();
            let toggle = bd.toggle();
            let mut data = std::vec![0; size];
            for (offset, byte) in data.iter_mut().enumerate() {
                *byte = unsafe { self.addresses[idx].add(offset).read_volatile() };
            }
            self.complete(endpoint, UsbDirection::In, parity, Pid::In, size);
            Some(Packet { data, toggle })
        }

        fn host_write(&mut self, endpoint: usize, data: &[u8], pid: Pid) -> Option<DataToggle> {
            let (idx, parity) = self.claim(endpoint, UsbDirection::Out)?;
            let bd = self.table.get(endpoint, UsbDirection::Out, parity);
            assert!(data.len() <= bd.byte_count(), "babble on EP{endpoint}");
            let toggle = bd.toggle();
            let dst = self.addresses[idx] as *mut u8;
            for (offset, byte) in data.iter().enumerate() {
                unsafe { dst.add(offset).write_volatile(*byte) };
            }
            self.complete(endpoint, UsbDirection::Out, parity, pid, data.len());
            Some(toggle)
        }

        /// The host sends an OUT packet; returns its toggle, or `None` for a NAK
        pub fn host_out(&mut self, endpoint: usize, data: &[u8]) -> Option<DataToggle> {
            self.host_write(endpoint, data, Pid::Out)
        }

        /// The host sends a SETUP packet
        pub fn host_setup(&mut self, endpoint: usize, setup: [u8; 8]) -> Option<DataToggle> {
            self.host_write(endpoint, &setup, Pid::Setup)
        }

        /// Raise interrupt causes that don't come from tokens
        pub fn raise(&mut self, interrupts: Interrupt) {
            self.pending |= interrupts;
        }

        pub fn is_armed(&self, endpoint: usize, direction: UsbDirection) -> bool {
            [Parity::Even, Parity::Odd]
                .iter()
                .any(|&parity| self.table.get(endpoint, direction, parity).owner() == Owner::Hardware)
        }

        pub fn pending_tokens(&self) -> usize {
            self.tokens.len()
        }
    }

    impl Hardware for Sim {
        fn descriptor(&self, endpoint: usize, direction: UsbDirection, parity: Parity) -> Descriptor {
            let bd = self.table.get(endpoint, direction, parity);
            Descriptor {
                owner: bd.owner(),
                byte_count: bd.byte_count(),
                toggle: bd.toggle(),
            }
        }

        fn arm(
            &mut self,
            endpoint: usize,
            direction: UsbDirection,
            parity: Parity,
            buffer: *const u8,
            size: usize,
            toggle: DataToggle,
        ) -> usb_device::Result<()> {
            let bd = self.table.get(endpoint, direction, parity);
            if bd.owner() == Owner::Hardware {
                return Err(UsbError::WouldBlock);
            }
            bd.arm(buffer, size, toggle);
            self.addresses[index(endpoint, direction, parity)] = buffer;
            Ok(())
        }

        fn enable_endpoint(&mut self, endpoint: usize, capabilities: Capabilities, kind: EndpointType) {
            self.enabled[endpoint] = Some((capabilities, kind));
        }

        fn disable_endpoint(&mut self, endpoint: usize) {
            self.enabled[endpoint] = None;
            for direction in [UsbDirection::Out, UsbDirection::In] {
                for parity in [Parity::Even, Parity::Odd] {
                    self.table.get(endpoint, direction, parity).clear();
                }
            }
        }

        fn set_stalled(&mut self, endpoint: usize, stalled: bool) {
            self.stalled[endpoint] = stalled;
        }

        fn is_stalled(&self, endpoint: usize) -> bool {
            self.stalled[endpoint]
        }

        fn set_address(&mut self, address: u8) {
            self.address = address;
        }

        fn resume_token_processing(&mut self) {
            self.resumed += 1;
        }

        fn bus_reset(&mut self) {
            self.table.clear();
            self.sie_parity = [Parity::Even; ENDPOINT_COUNT * 2];
            self.tokens.clear();
            self.stalled = [false; ENDPOINT_COUNT];
            self.address = 0;
        }

        fn poll(&mut self) -> Interrupt {
            self.pending
        }

        fn token(&mut self) -> Token {
            let token = self.tokens.pop_front().expect("no token pending");
            if self.tokens.is_empty() {
                self.pending.remove(Interrupt::TOKEN_DONE);
            }
            token
        }

        fn clear(&mut self, interrupts: Interrupt) {
            self.pending.remove(interrupts);
        }

        fn frame_number(&self) -> u16 {
            self.frame
        }
    }
}
