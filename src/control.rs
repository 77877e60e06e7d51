//! Control transfers on endpoint 0
//!
//! A control transfer has three stages: SETUP, an optional DATA stage, and
//! STATUS. This module adds the toggle and phase sequencing for those stages
//! to the general [`Endpoint`], and provides [`Control`], the handle that a
//! request handler uses to answer one SETUP packet.

use crate::bdt::Owner;
use crate::endpoint::{DataToggle, Endpoint, TransferState};
use crate::hal::Hardware;
use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection, UsbError,
};

/// Size of a SETUP packet
pub const SETUP_LEN: usize = 8;

/// Decode a SETUP packet
pub fn parse_setup(setup: &[u8; SETUP_LEN]) -> Request {
    let request_type = setup[0];
    Request {
        direction: if request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        },
        request_type: match (request_type >> 5) & 0b11 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        },
        recipient: match request_type & 0b1_1111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        },
        request: setup[1],
        value: u16::from_le_bytes([setup[2], setup[3]]),
        index: u16::from_le_bytes([setup[4], setup[5]]),
        length: u16::from_le_bytes([setup[6], setup[7]]),
    }
}

impl Endpoint {
    /// Arm reception of the next SETUP packet
    ///
    /// SETUP packets are always DATA0.
    pub fn start_setup_transaction<H: Hardware>(&mut self, hw: &mut H) -> usb_device::Result<()> {
        self.set_state(TransferState::Idle);
        self.set_toggle(UsbDirection::Out, DataToggle::Data0);
        self.start_rx_transaction(hw, TransferState::Idle, SETUP_LEN)
    }

    /// Note that a SETUP packet arrived
    ///
    /// The first data stage packet after SETUP is DATA1, in either direction.
    pub fn setup_received(&mut self) {
        self.set_state(TransferState::Idle);
        self.set_toggle(UsbDirection::Out, DataToggle::Data1);
        self.set_toggle(UsbDirection::In, DataToggle::Data1);
    }

    /// Send a zero-length, DATA1 status packet
    pub fn start_tx_status<H: Hardware>(&mut self, hw: &mut H) -> usb_device::Result<()> {
        self.set_toggle(UsbDirection::In, DataToggle::Data1);
        self.start_tx_transaction(hw, TransferState::StatusIn, &[])
    }

    /// Arm SETUP reception, unless the receive descriptor is already armed
    pub fn check_setup_ready<H: Hardware>(&mut self, hw: &mut H) {
        let parity = self.parity(UsbDirection::Out);
        if hw.descriptor(self.number(), UsbDirection::Out, parity).owner == Owner::Firmware {
            if let Err(_err) = self.start_setup_transaction(hw) {
                warn!("EP{} can't receive SETUP {:?}", self.number(), _err);
            }
        }
    }

    /// Copy the SETUP packet out of the receive buffer
    pub fn read_setup(&self) -> [u8; SETUP_LEN] {
        let mut setup = [0; SETUP_LEN];
        self.read_packet(&mut setup);
        setup
    }

    /// Send `data` as the data stage of a device-to-host request
    ///
    /// The response is truncated to the host's `wLength`. A trailing ZLP is
    /// owed when the response is shorter than `wLength`, so the host can tell
    /// a full last packet from more data.
    pub fn start_data_in<H: Hardware>(
        &mut self,
        hw: &mut H,
        request: &Request,
        data: &[u8],
    ) -> usb_device::Result<()> {
        let length = (request.length as usize).min(data.len());
        if length < request.length as usize {
            self.set_need_zlp();
        }
        self.start_tx_transaction(hw, TransferState::DataIn, &data[..length])
    }

    /// Receive the data stage of a host-to-device request
    ///
    /// Returns `BufferOverflow` if the whole stage won't fit. The host would
    /// keep sending after the device acknowledged a partial stage.
    pub fn start_data_out<H: Hardware>(&mut self, hw: &mut H, request: &Request) -> usb_device::Result<()> {
        if request.length as usize > self.capacity() {
            warn!("EP{} {} byte data stage won't fit", self.number(), request.length);
            return Err(UsbError::BufferOverflow);
        }
        self.start_rx_transaction(hw, TransferState::DataOut, request.length as usize)
    }

    /// Receive the zero-length status packet that ends a device-to-host request
    pub fn start_rx_status<H: Hardware>(&mut self, hw: &mut H) -> usb_device::Result<()> {
        self.start_rx_transaction(hw, TransferState::StatusOut, 0)
    }
}

/// Result of offering a SETUP request to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Outcome {
    /// The handler answered, or rejected, the request
    Handled,
    /// The handler doesn't know the request
    Unhandled,
}

/// Answers one SETUP request
///
/// Every method consumes the handle; a request is answered exactly once.
/// Dropping the handle, and returning [`Outcome::Unhandled`], passes the
/// request on.
pub struct Control<'a, H> {
    ep0: &'a mut Endpoint,
    hw: &'a mut H,
    request: Request,
}

impl<'a, H: Hardware> Control<'a, H> {
    pub(crate) fn new(ep0: &'a mut Endpoint, hw: &'a mut H, request: Request) -> Self {
        Control { ep0, hw, request }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Answer a device-to-host request with `data`
    pub fn accept_with(self, data: &[u8]) -> Outcome {
        if self.request.direction != UsbDirection::In {
            warn!("Data for a host-to-device request {:?}", self.request);
            return self.reject();
        }
        match self.ep0.start_data_in(&mut *self.hw, &self.request, data) {
            Ok(()) => Outcome::Handled,
            Err(_err) => {
                warn!("EP0 IN failed {:?}", _err);
                self.reject()
            }
        }
    }

    /// Accept a request that has no data stage
    pub fn accept(self) -> Outcome {
        match self.ep0.start_tx_status(&mut *self.hw) {
            Ok(()) => Outcome::Handled,
            Err(_err) => {
                warn!("EP0 status failed {:?}", _err);
                self.reject()
            }
        }
    }

    /// Accept a host-to-device request, and receive its data stage
    ///
    /// The data is delivered once the whole stage arrives.
    pub fn receive(self) -> Outcome {
        if self.request.direction != UsbDirection::Out || self.request.length == 0 {
            return self.reject();
        }
        match self.ep0.start_data_out(&mut *self.hw, &self.request) {
            Ok(()) => Outcome::Handled,
            Err(_err) => {
                warn!("EP0 OUT failed {:?}", _err);
                self.reject()
            }
        }
    }

    /// Refuse the request with a STALL
    pub fn reject(self) -> Outcome {
        self.ep0.stall(&mut *self.hw);
        Outcome::Handled
    }
}

#[cfg(test)]
mod test {
    use super::{parse_setup, Control, Outcome};
    use crate::endpoint::{test::endpoint, Capabilities, DataToggle, TransferState};
    use crate::hal::{sim::Sim, Hardware};
    use usb_device::{
        control::{Recipient, RequestType},
        UsbDirection,
    };

    #[test]
    fn parse_get_descriptor() {
        let request = parse_setup(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]);
        assert_eq!(request.direction, UsbDirection::In);
        assert_eq!(request.request_type, RequestType::Standard);
        assert_eq!(request.recipient, Recipient::Device);
        assert_eq!(request.request, 6);
        assert_eq!(request.value, 0x0100);
        assert_eq!(request.index, 0);
        assert_eq!(request.length, 64);
    }

    #[test]
    fn parse_class_request() {
        let request = parse_setup(&[0x21, 0x20, 0x00, 0x00, 0x01, 0x00, 0x07, 0x00]);
        assert_eq!(request.direction, UsbDirection::Out);
        assert_eq!(request.request_type, RequestType::Class);
        assert_eq!(request.recipient, Recipient::Interface);
        assert_eq!(request.request, 0x20);
        assert_eq!(request.index, 1);
        assert_eq!(request.length, 7);
    }

    #[test]
    fn setup_is_data0() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 64, 64);
        ep0.set_toggle(UsbDirection::Out, DataToggle::Data1);
        ep0.start_setup_transaction(&mut sim).unwrap();
        assert_eq!(sim.host_setup(0, [0; 8]), Some(DataToggle::Data0));
    }

    #[test]
    fn data_stage_after_setup_is_data1() {
        for direction in [UsbDirection::In, UsbDirection::Out] {
            let mut ep0 = endpoint(0, Capabilities::CONTROL, 64, 64);
            ep0.setup_received();
            assert_eq!(ep0.toggle(direction), DataToggle::Data1);
            assert_eq!(ep0.state(), TransferState::Idle);
        }
    }

    #[test]
    fn status_in_is_data1_zlp() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 64, 64);
        ep0.start_tx_status(&mut sim).unwrap();
        assert_eq!(ep0.state(), TransferState::StatusIn);
        let packet = sim.host_in(0).unwrap();
        assert!(packet.data.is_empty());
        assert_eq!(packet.toggle, DataToggle::Data1);

        let token = sim.token();
        ep0.flip_parity(token.direction, token.parity);
        assert_eq!(ep0.handle_in_token(&mut sim), Some(TransferState::StatusIn));
        assert_eq!(ep0.state(), TransferState::Idle);
    }

    #[test]
    fn check_setup_ready_is_idempotent() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 64, 64);
        ep0.check_setup_ready(&mut sim);
        assert!(sim.is_armed(0, UsbDirection::Out));
        ep0.set_toggle(UsbDirection::Out, DataToggle::Data1);
        // Already armed, so nothing changes
        ep0.check_setup_ready(&mut sim);
        assert_eq!(ep0.toggle(UsbDirection::Out), DataToggle::Data1);
    }

    #[test]
    fn check_setup_ready_needs_a_receive_endpoint() {
        let mut sim = Sim::new();
        let mut ep = endpoint(1, Capabilities::TX, 16, 16);
        ep.check_setup_ready(&mut sim);
        assert!(!sim.is_armed(1, UsbDirection::Out));
        assert_eq!(ep.state(), TransferState::Idle);
    }

    #[test]
    fn short_response_owes_zlp() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 8, 64);
        let request = parse_setup(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(Control::new(&mut ep0, &mut sim, request).accept_with(&[1; 16]), Outcome::Handled);

        let mut sizes = std::vec::Vec::new();
        while let Some(packet) = sim.host_in(0) {
            sizes.push(packet.data.len());
            let token = sim.token();
            ep0.flip_parity(token.direction, token.parity);
            ep0.handle_in_token(&mut sim);
        }
        assert_eq!(sizes, [8, 8, 0]);
    }

    #[test]
    fn response_truncated_to_length() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 8, 64);
        let request = parse_setup(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x08, 0x00]);
        Control::new(&mut ep0, &mut sim, request).accept_with(&[1; 16]);

        let packet = sim.host_in(0).unwrap();
        assert_eq!(packet.data.len(), 8);
        let token = sim.token();
        ep0.flip_parity(token.direction, token.parity);
        assert_eq!(ep0.handle_in_token(&mut sim), Some(TransferState::DataIn));
        assert!(sim.host_in(0).is_none());
    }

    #[test]
    fn failed_response_forgets_zlp() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 8, 16);
        // Short of wLength, but too big to stage
        let request = parse_setup(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xFF, 0x00]);
        assert_eq!(Control::new(&mut ep0, &mut sim, request).accept_with(&[1; 32]), Outcome::Handled);
        assert!(sim.is_stalled(0));
        sim.set_stalled(0, false);

        let request = parse_setup(&[0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0x10, 0x00]);
        Control::new(&mut ep0, &mut sim, request).accept_with(&[1; 16]);
        let mut sizes = std::vec::Vec::new();
        while let Some(packet) = sim.host_in(0) {
            sizes.push(packet.data.len());
            let token = sim.token();
            ep0.flip_parity(token.direction, token.parity);
            ep0.handle_in_token(&mut sim);
        }
        assert_eq!(sizes, [8, 8]);
        assert_eq!(ep0.state(), TransferState::Idle);
    }

    #[test]
    fn oversized_data_stage_stalls() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 64, 64);
        let request = parse_setup(&[0x40, 0x42, 0x00, 0x00, 0x00, 0x00, 0x41, 0x00]);
        assert_eq!(Control::new(&mut ep0, &mut sim, request).receive(), Outcome::Handled);
        assert!(sim.is_stalled(0));
        assert!(!sim.is_armed(0, UsbDirection::Out));
    }

    #[test]
    fn reject_stalls() {
        let mut sim = Sim::new();
        let mut ep0 = endpoint(0, Capabilities::CONTROL, 64, 64);
        let request = parse_setup(&[0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x04, 0x00]);
        // Host-to-device with data can't be answered with data
        assert_eq!(Control::new(&mut ep0, &mut sim, request).accept_with(&[0]), Outcome::Handled);
        assert!(sim.is_stalled(0));
        assert_eq!(ep0.state(), TransferState::Stall);
    }
}
