//! The USB-OTG full-speed controller
//!
//! [`UsbOtg`] drives the SIE registers and the buffer descriptor table. It
//! implements [`Hardware`], so it plugs into a [`Device`](crate::device::Device).

use crate::bdt::{DescriptorTable, Owner, Table};
use crate::endpoint::{Capabilities, DataToggle, Parity};
use crate::hal::{Descriptor, Hardware, Interrupt, Pid, Token};
use crate::ral::{self, endpoint_control};
use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

/// A USB-OTG controller, in device mode
pub struct UsbOtg {
    usb: ral::usb::Instance,
    table: &'static Table,
}

impl UsbOtg {
    /// Create the controller driver
    ///
    /// Creation only takes ownership of the registers and the table. Call
    /// [`initialize()`](UsbOtg::initialize) next.
    ///
    /// # Panics
    ///
    /// Panics if `table` already belongs to another controller.
    pub fn new<P: crate::Peripherals>(peripherals: P, table: &'static DescriptorTable) -> Self {
        let table = match table.take() {
            Some(table) => table,
            None => panic!("Descriptor table already in use"),
        };
        // Safety: Peripherals promises that this is the register block, and
        // that nothing else owns it.
        let usb = unsafe { ral::usb::Instance::new(peripherals.usb()) };
        UsbOtg { usb, table }
    }

    /// Reset the module, and set it up as a full-speed device
    ///
    /// Assumes the USB clock is running. Interrupts stay off, and the device
    /// stays detached.
    pub fn initialize(&mut self) {
        ral::write_reg!(ral::usb, self.usb, USBTRC0, USBRESET: 1);
        while ral::read_reg!(ral::usb, self.usb, USBTRC0, USBRESET == 1) {}

        self.table.clear();
        let base = self.table.as_ptr() as usize;
        ral::write_reg!(ral::usb, self.usb, BDTPAGE1, BDTBA: (base >> 9) as u8);
        ral::write_reg!(ral::usb, self.usb, BDTPAGE2, (base >> 16) as u8);
        ral::write_reg!(ral::usb, self.usb, BDTPAGE3, (base >> 24) as u8);

        ral::write_reg!(ral::usb, self.usb, ISTAT, 0xFF);
        ral::write_reg!(ral::usb, self.usb, ERRSTAT, 0xFF);
        ral::write_reg!(ral::usb, self.usb, INTEN, 0);
        ral::write_reg!(ral::usb, self.usb, ERREN, 0);

        // Out of suspend, no host-mode pulldowns
        ral::write_reg!(ral::usb, self.usb, USBCTRL, 0);
        ral::write_reg!(ral::usb, self.usb, CTL, USBENSOFEN: 1);
    }

    /// Enable (`true`) or disable (`false`) USB interrupts
    pub fn set_interrupts(&mut self, interrupts: bool) {
        if interrupts {
            // Keep this in sync with Device::poll()
            ral::write_reg!(ral::usb, self.usb, INTEN,
                USBRST: 1, ERROR: 1, SOFTOK: 1, TOKDNE: 1, SLEEP: 1, RESUME: 1, STALL: 1);
            ral::write_reg!(ral::usb, self.usb, ERREN, 0xFF);
        } else {
            ral::write_reg!(ral::usb, self.usb, INTEN, 0);
            ral::write_reg!(ral::usb, self.usb, ERREN, 0);
        }
    }

    /// Enable the D+ pull-up, so the host sees the device
    pub fn attach(&mut self) {
        ral::write_reg!(ral::usb, self.usb, CONTROL, DPPULLUPNONOTG: 1);
    }

    /// Release D+, and drop off the bus
    pub fn detach(&mut self) {
        ral::write_reg!(ral::usb, self.usb, CONTROL, 0);
    }

    /// Put the transceiver to sleep, after the bus suspends
    pub fn suspend(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, USBCTRL, SUSP: 1);
    }

    /// Wake the transceiver
    pub fn resume(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, USBCTRL, SUSP: 0);
    }
}

impl Hardware for UsbOtg {
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
        // The SIE may start on the descriptor right away
        cortex_m::asm::dsb();
        Ok(())
    }

    fn enable_endpoint(&mut self, endpoint: usize, capabilities: Capabilities, kind: EndpointType) {
        let handshake = !matches!(kind, EndpointType::Isochronous { .. }) as u8;
        let control = (kind == EndpointType::Control) as u8;
        let endptctrl = endpoint_control::register(&self.usb, endpoint);
        ral::write_reg!(
            endpoint_control,
            &endptctrl,
            ENDPT,
            EPHSHK: handshake,
            EPTXEN: capabilities.contains(Capabilities::TX) as u8,
            EPRXEN: capabilities.contains(Capabilities::RX) as u8,
            EPCTLDIS: 1 - control
        );
    }

    fn disable_endpoint(&mut self, endpoint: usize) {
        let endptctrl = endpoint_control::register(&self.usb, endpoint);
        ral::write_reg!(endpoint_control, &endptctrl, ENDPT, 0);
        for direction in [UsbDirection::Out, UsbDirection::In] {
            for parity in [Parity::Even, Parity::Odd] {
                self.table.get(endpoint, direction, parity).clear();
            }
        }
    }

    fn set_stalled(&mut self, endpoint: usize, stalled: bool) {
        let endptctrl = endpoint_control::register(&self.usb, endpoint);
        ral::modify_reg!(endpoint_control, &endptctrl, ENDPT, EPSTALL: stalled as u8);
    }

    fn is_stalled(&self, endpoint: usize) -> bool {
        let endptctrl = endpoint_control::register(&self.usb, endpoint);
        ral::read_reg!(endpoint_control, &endptctrl, ENDPT, EPSTALL == 1)
    }

    fn set_address(&mut self, address: u8) {
        ral::write_reg!(ral::usb, self.usb, ADDR, ADDR: address);
    }

    fn resume_token_processing(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, CTL, TXSUSPENDTOKENBUSY: 0);
    }

    fn bus_reset(&mut self) {
        ral::modify_reg!(ral::usb, self.usb, CTL, ODDRST: 1);
        self.table.clear();
        for endpoint in 0..crate::bdt::ENDPOINT_COUNT {
            let endptctrl = endpoint_control::register(&self.usb, endpoint);
            ral::write_reg!(endpoint_control, &endptctrl, ENDPT, 0);
        }
        ral::write_reg!(ral::usb, self.usb, ADDR, 0);
        ral::write_reg!(ral::usb, self.usb, ERRSTAT, 0xFF);
        ral::modify_reg!(ral::usb, self.usb, CTL, ODDRST: 0);
    }

    fn poll(&mut self) -> Interrupt {
        // Interrupt bits match ISTAT; ATTACH is host-only
        Interrupt::from_bits_truncate(ral::read_reg!(ral::usb, self.usb, ISTAT))
    }

    fn token(&mut self) -> Token {
        // STAT is only valid until TOKDNE clears
        let endpoint = ral::read_reg!(ral::usb, self.usb, STAT, ENDP) as usize;
        let direction = if ral::read_reg!(ral::usb, self.usb, STAT, TX == 1) {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        let parity = if ral::read_reg!(ral::usb, self.usb, STAT, ODD == 1) {
            Parity::Odd
        } else {
            Parity::Even
        };
        ral::write_reg!(ral::usb, self.usb, ISTAT, TOKDNE: 1);

        let pid = Pid::from_bits(self.table.get(endpoint, direction, parity).token_pid())
            .unwrap_or(match direction {
                UsbDirection::In => Pid::In,
                UsbDirection::Out => Pid::Out,
            });
        Token {
            endpoint,
            direction,
            parity,
            pid,
        }
    }

    fn clear(&mut self, interrupts: Interrupt) {
        if interrupts.contains(Interrupt::ERROR) {
            ral::write_reg!(ral::usb, self.usb, ERRSTAT, 0xFF);
        }
        ral::write_reg!(ral::usb, self.usb, ISTAT, interrupts.bits());
    }

    fn frame_number(&self) -> u16 {
        let low = ral::read_reg!(ral::usb, self.usb, FRMNUML) as u16;
        let high = ral::read_reg!(ral::usb, self.usb, FRMNUMH) as u16;
        ((high & 0x7) << 8) | low
    }
}
