//! The device-level dispatcher
//!
//! [`Device`] owns the controller, endpoint 0, and every class endpoint.
//! Call [`Device::poll`] from the USB interrupt. It reads the interrupt
//! causes, answers standard requests itself, and hands everything else to
//! a [`Class`].

use crate::bdt::ENDPOINT_COUNT;
use crate::buffer::Allocator;
use crate::control::{Control, Outcome};
use crate::descriptors::{kind, DescriptorSet};
use crate::endpoint::{Capabilities, Endpoint, EndpointConfig, TransferState};
use crate::hal::{Hardware, Interrupt, Pid, Token};
use usb_device::{
    control::{Recipient, Request, RequestType},
    device::UsbDeviceState,
    endpoint::EndpointType,
    UsbDirection, UsbError,
};

/// Largest transfer that endpoint 0 stages
pub const CONTROL_CAPACITY: usize = 256;

/// Largest string descriptor we'll encode
const STRING_CAPACITY: usize = 128;

/// Class endpoints, lent to a [`Class`] while it handles an event
pub struct Endpoints<'a, H> {
    hw: &'a mut H,
    endpoints: &'a mut [Option<Endpoint>; ENDPOINT_COUNT],
}

impl<'a, H: Hardware> Endpoints<'a, H> {
    /// Borrow endpoint `number`, along with the controller that moves its data
    pub fn get(&mut self, number: u8) -> Option<(&mut Endpoint, &mut H)> {
        let ep = self.endpoints.get_mut(number as usize)?.as_mut()?;
        Some((ep, &mut *self.hw))
    }

    /// The transfer state of endpoint `number`
    pub fn state(&self, number: u8) -> Option<TransferState> {
        self.endpoints
            .get(number as usize)?
            .as_ref()
            .map(Endpoint::state)
    }

    pub fn frame_number(&self) -> u16 {
        self.hw.frame_number()
    }
}

/// Log a completion that nobody handles
pub fn unhandled(_endpoint: usize, _state: TransferState) {
    warn!("EP{} completed {:?}, but nothing handles it", _endpoint, _state);
}

/// A USB device class
///
/// A class declares its endpoints, answers class and vendor requests, and
/// reacts to transfer completions. Every method runs in the USB interrupt.
pub trait Class {
    /// The endpoints this class uses
    ///
    /// Read once, when the [`Device`] is created. Endpoint 0 belongs to the
    /// device.
    fn endpoints(&self) -> &[EndpointConfig];

    /// The host reset the bus
    fn reset(&mut self) {}

    /// The host selected the configuration
    ///
    /// Class endpoints are enabled, idle, and on DATA0. Bulk receive
    /// endpoints are already armed for one packet.
    fn configured<H: Hardware>(&mut self, _endpoints: &mut Endpoints<'_, H>) {}

    /// Answer a SETUP request that isn't a standard request
    ///
    /// Return [`Outcome::Unhandled`] to stall it.
    fn control_request<H: Hardware>(&mut self, _xfer: Control<'_, H>) -> Outcome {
        Outcome::Unhandled
    }

    /// The data stage of a request accepted with [`Control::receive`] arrived
    ///
    /// Return [`Outcome::Handled`] to acknowledge it, or
    /// [`Outcome::Unhandled`] to stall it.
    fn control_out(&mut self, _request: &Request, _data: &[u8]) -> Outcome {
        Outcome::Unhandled
    }

    /// A transfer on a class endpoint finished
    fn transfer_complete<H: Hardware>(
        &mut self,
        _endpoints: &mut Endpoints<'_, H>,
        endpoint: usize,
        state: TransferState,
    ) {
        unhandled(endpoint, state)
    }

    /// Called on every [`Device::poll`] while configured, after tokens are handled
    ///
    /// Start work that the application queued since the last interrupt.
    fn poll<H: Hardware>(&mut self, _endpoints: &mut Endpoints<'_, H>) {}

    /// Called on every start-of-frame while configured
    fn start_of_frame<H: Hardware>(&mut self, _endpoints: &mut Endpoints<'_, H>) {}
}

/// A USB device
pub struct Device<H, C> {
    hw: H,
    class: C,
    descriptors: &'static DescriptorSet,
    ep0: Endpoint,
    endpoints: [Option<Endpoint>; ENDPOINT_COUNT],
    state: UsbDeviceState,
    /// The state to return to after a resume
    suspended: Option<UsbDeviceState>,
    /// Takes effect once the SET_ADDRESS status stage completes
    pending_address: Option<u8>,
    /// The request whose OUT data stage is in flight
    pending_request: Option<Request>,
    configuration: u8,
    remote_wakeup: bool,
}

impl<H: Hardware, C: Class> Device<H, C> {
    /// Create a device
    ///
    /// Endpoint buffers for endpoint 0 and the class come out of `memory`.
    /// Fails with `EndpointMemoryOverflow` if they don't fit, or
    /// `InvalidEndpoint` if the class claims endpoint 0, or one endpoint
    /// twice.
    ///
    /// The device stays quiet until the first bus reset.
    pub fn new(
        hw: H,
        class: C,
        descriptors: &'static DescriptorSet,
        memory: &'static mut [u8],
    ) -> usb_device::Result<Self> {
        let mut memory = Allocator::new(memory);
        let ep0 = Endpoint::new(
            EndpointConfig {
                number: 0,
                kind: EndpointType::Control,
                capabilities: Capabilities::CONTROL,
                max_packet_size: descriptors.max_packet_size_0(),
                capacity: CONTROL_CAPACITY,
            },
            &mut memory,
        )?;

        const NONE: Option<Endpoint> = None;
        let mut endpoints = [NONE; ENDPOINT_COUNT];
        for config in class.endpoints() {
            let number = config.number as usize;
            let slot = endpoints
                .get_mut(number)
                .filter(|_| number != 0)
                .ok_or(UsbError::InvalidEndpoint)?;
            if slot.is_some() {
                return Err(UsbError::InvalidEndpoint);
            }
            *slot = Some(Endpoint::new(*config, &mut memory)?);
        }
        debug!("{} bytes of endpoint memory unused", memory.remaining());

        Ok(Device {
            hw,
            class,
            descriptors,
            ep0,
            endpoints,
            state: UsbDeviceState::Default,
            suspended: None,
            pending_address: None,
            pending_request: None,
            configuration: 0,
            remote_wakeup: false,
        })
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    pub fn state(&self) -> UsbDeviceState {
        self.state
    }

    /// The selected configuration, or zero
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.remote_wakeup
    }

    pub fn control_endpoint(&self) -> &Endpoint {
        &self.ep0
    }

    pub fn endpoint(&self, number: u8) -> Option<&Endpoint> {
        self.endpoints.get(number as usize)?.as_ref()
    }

    /// Lend the class endpoints out, for work outside of an event
    pub fn endpoints(&mut self) -> Endpoints<'_, H> {
        Endpoints {
            hw: &mut self.hw,
            endpoints: &mut self.endpoints,
        }
    }

    /// Stall, or unstall, a class endpoint
    pub fn set_stalled(&mut self, number: u8, stalled: bool) {
        if stalled {
            self.halt(number as usize);
        } else {
            self.clear_halt(number as usize);
        }
    }

    /// Handle every pending USB interrupt cause
    pub fn poll(&mut self) {
        let status = self.hw.poll();

        if status.contains(Interrupt::USB_RESET) {
            debug!("RESET");
            self.bus_reset();
            self.hw.clear(Interrupt::all());
            return;
        }

        if status.contains(Interrupt::ERROR) {
            warn!("USB ERROR");
            self.hw.clear(Interrupt::ERROR);
        }

        if status.contains(Interrupt::STALL) {
            self.hw.clear(Interrupt::STALL);
            self.on_stall_sent();
        }

        while self.hw.poll().contains(Interrupt::TOKEN_DONE) {
            let token = self.hw.token();
            self.on_token(token);
        }

        if self.state == UsbDeviceState::Configured {
            let mut endpoints = Endpoints {
                hw: &mut self.hw,
                endpoints: &mut self.endpoints,
            };
            self.class.poll(&mut endpoints);
        }

        if status.contains(Interrupt::SOF) {
            self.hw.clear(Interrupt::SOF);
            if self.state == UsbDeviceState::Configured {
                let mut endpoints = Endpoints {
                    hw: &mut self.hw,
                    endpoints: &mut self.endpoints,
                };
                self.class.start_of_frame(&mut endpoints);
            }
        }

        if status.contains(Interrupt::SLEEP) {
            self.hw.clear(Interrupt::SLEEP);
            if self.suspended.is_none() {
                debug!("SUSPEND");
                self.suspended = Some(self.state);
                self.state = UsbDeviceState::Suspend;
            }
        }

        if status.contains(Interrupt::RESUME) {
            self.hw.clear(Interrupt::RESUME);
            if let Some(state) = self.suspended.take() {
                debug!("RESUME");
                self.state = state;
            }
        }
    }

    fn bus_reset(&mut self) {
        self.hw.bus_reset();
        for ep in self.endpoints.iter_mut().flatten() {
            self.hw.disable_endpoint(ep.number());
            ep.reset();
        }
        self.ep0.reset();
        self.hw
            .enable_endpoint(0, Capabilities::CONTROL, EndpointType::Control);

        self.state = UsbDeviceState::Default;
        self.suspended = None;
        self.pending_address = None;
        self.pending_request = None;
        self.configuration = 0;
        self.remote_wakeup = false;
        self.class.reset();

        if let Err(_err) = self.ep0.start_setup_transaction(&mut self.hw) {
            warn!("EP0 can't receive SETUP {:?}", _err);
        }
    }

    /// The SIE answered a token with STALL
    ///
    /// A stalled control endpoint recovers on the next SETUP, so unstall it
    /// and listen for one. Other endpoints stay halted until the host
    /// clears them.
    fn on_stall_sent(&mut self) {
        if self.hw.is_stalled(0) {
            debug!("EP0 STALL sent");
            self.ep0.clear_stall(&mut self.hw);
            self.ep0.check_setup_ready(&mut self.hw);
        }
    }

    fn on_token(&mut self, token: Token) {
        trace!("{:?}", token);
        if token.endpoint == 0 {
            self.ep0.flip_parity(token.direction, token.parity);
            let done = match (token.pid, token.direction) {
                (Pid::Setup, _) => {
                    self.on_setup();
                    None
                }
                (_, UsbDirection::In) => self.ep0.handle_in_token(&mut self.hw),
                (_, UsbDirection::Out) => self.ep0.handle_out_token(&mut self.hw, token.parity),
            };
            if let Some(state) = done {
                self.on_control_complete(state);
            }
            return;
        }

        let Some(ep) = self
            .endpoints
            .get_mut(token.endpoint)
            .and_then(Option::as_mut)
        else {
            warn!("Token for unknown EP{}", token.endpoint);
            return;
        };
        ep.flip_parity(token.direction, token.parity);
        let done = match token.direction {
            UsbDirection::In => ep.handle_in_token(&mut self.hw),
            UsbDirection::Out => ep.handle_out_token(&mut self.hw, token.parity),
        };
        if let Some(state) = done {
            let mut endpoints = Endpoints {
                hw: &mut self.hw,
                endpoints: &mut self.endpoints,
            };
            self.class
                .transfer_complete(&mut endpoints, token.endpoint, state);
        }
    }

    fn on_setup(&mut self) {
        let setup = self.ep0.read_setup();
        self.ep0.setup_received();
        self.pending_request = None;

        let request = crate::control::parse_setup(&setup);
        debug!("SETUP {:?}", request);

        let outcome = match self.standard_request(&request) {
            Outcome::Unhandled => {
                let xfer = Control::new(&mut self.ep0, &mut self.hw, request);
                self.class.control_request(xfer)
            }
            handled => handled,
        };
        match outcome {
            Outcome::Unhandled => {
                warn!("Unhandled request {:?}", request);
                self.ep0.stall(&mut self.hw);
            }
            Outcome::Handled if self.ep0.state() == TransferState::DataOut => {
                self.pending_request = Some(request);
            }
            Outcome::Handled => {}
        }

        self.hw.resume_token_processing();
    }

    fn on_control_complete(&mut self, state: TransferState) {
        match state {
            TransferState::DataIn => {
                if let Err(_err) = self.ep0.start_rx_status(&mut self.hw) {
                    warn!("EP0 status OUT failed {:?}", _err);
                }
            }
            TransferState::DataOut => self.on_control_data(),
            TransferState::StatusIn => {
                if let Some(address) = self.pending_address.take() {
                    debug!("ADDRESS {}", address);
                    self.hw.set_address(address);
                    self.state = if address == 0 {
                        UsbDeviceState::Default
                    } else {
                        UsbDeviceState::Addressed
                    };
                }
                self.ep0.check_setup_ready(&mut self.hw);
            }
            TransferState::StatusOut => self.ep0.check_setup_ready(&mut self.hw),
            _state => {
                warn!("EP0 completed {:?}", _state);
            }
        }
    }

    fn on_control_data(&mut self) {
        let Some(request) = self.pending_request.take() else {
            warn!("EP0 data without a request");
            self.ep0.stall(&mut self.hw);
            return;
        };
        let mut data = [0; CONTROL_CAPACITY];
        let size = self.ep0.read(&mut data);
        match self.class.control_out(&request, &data[..size]) {
            Outcome::Handled => {
                if let Err(_err) = self.ep0.start_tx_status(&mut self.hw) {
                    warn!("EP0 status IN failed {:?}", _err);
                }
            }
            Outcome::Unhandled => {
                warn!("Unhandled data for {:?}", request);
                self.ep0.stall(&mut self.hw);
            }
        }
    }

    /// Answer a chapter 9 request
    fn standard_request(&mut self, request: &Request) -> Outcome {
        if request.request_type != RequestType::Standard {
            return Outcome::Unhandled;
        }
        let ep_number = (request.index & 0x0F) as usize;

        match (request.direction, request.recipient, request.request) {
            (UsbDirection::In, Recipient::Device, Request::GET_STATUS) => {
                let status: u16 = (self.remote_wakeup as u16) << 1;
                self.control(request).accept_with(&status.to_le_bytes())
            }
            (UsbDirection::In, Recipient::Interface, Request::GET_STATUS) => {
                self.control(request).accept_with(&[0, 0])
            }
            (UsbDirection::In, Recipient::Endpoint, Request::GET_STATUS) => {
                if ep_number != 0 && self.endpoint(ep_number as u8).is_none() {
                    return self.control(request).reject();
                }
                let halted = self.hw.is_stalled(ep_number) as u8;
                self.control(request).accept_with(&[halted, 0])
            }
            (UsbDirection::Out, Recipient::Device, Request::CLEAR_FEATURE)
                if request.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
            {
                self.remote_wakeup = false;
                self.control(request).accept()
            }
            (UsbDirection::Out, Recipient::Device, Request::SET_FEATURE)
                if request.value == Request::FEATURE_DEVICE_REMOTE_WAKEUP =>
            {
                self.remote_wakeup = true;
                self.control(request).accept()
            }
            (UsbDirection::Out, Recipient::Endpoint, Request::CLEAR_FEATURE)
                if request.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                if ep_number != 0 {
                    self.clear_halt(ep_number);
                }
                self.control(request).accept()
            }
            (UsbDirection::Out, Recipient::Endpoint, Request::SET_FEATURE)
                if request.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                if ep_number != 0 {
                    self.halt(ep_number);
                }
                self.control(request).accept()
            }
            (UsbDirection::Out, Recipient::Device, Request::SET_ADDRESS) => {
                self.pending_address = Some((request.value & 0x7F) as u8);
                self.control(request).accept()
            }
            (UsbDirection::In, Recipient::Device, Request::GET_DESCRIPTOR) => self.get_descriptor(request),
            (UsbDirection::In, Recipient::Device, Request::GET_CONFIGURATION) => {
                let configuration = self.configuration;
                self.control(request).accept_with(&[configuration])
            }
            (UsbDirection::Out, Recipient::Device, Request::SET_CONFIGURATION) => {
                match request.value as u8 {
                    0 => {
                        self.deconfigure();
                        self.control(request).accept()
                    }
                    value if value == self.descriptors.configuration_value() => {
                        self.configure(value);
                        self.control(request).accept()
                    }
                    _ => self.control(request).reject(),
                }
            }
            (UsbDirection::In, Recipient::Interface, Request::GET_INTERFACE) => {
                self.control(request).accept_with(&[0])
            }
            (UsbDirection::Out, Recipient::Interface, Request::SET_INTERFACE) => {
                if request.value == 0 {
                    self.control(request).accept()
                } else {
                    self.control(request).reject()
                }
            }
            _ => Outcome::Unhandled,
        }
    }

    fn control(&mut self, request: &Request) -> Control<'_, H> {
        Control::new(&mut self.ep0, &mut self.hw, *request)
    }

    fn get_descriptor(&mut self, request: &Request) -> Outcome {
        let descriptors = self.descriptors;
        let [index, descriptor_type] = request.value.to_le_bytes();
        match descriptor_type {
            kind::DEVICE => self.control(request).accept_with(descriptors.device),
            kind::CONFIGURATION => self.control(request).accept_with(descriptors.configuration),
            kind::STRING => {
                let mut buffer = [0; STRING_CAPACITY];
                match descriptors.string(index, &mut buffer) {
                    Some(string) => self.control(request).accept_with(string),
                    None => self.control(request).reject(),
                }
            }
            _ => self.control(request).reject(),
        }
    }

    /// Enable and reset every class endpoint, and prime the bulk receivers
    fn configure(&mut self, value: u8) {
        for ep in self.endpoints.iter_mut().flatten() {
            let config = *ep.config();
            let number = ep.number();
            self.hw.disable_endpoint(number);
            ep.clear_stall(&mut self.hw);
            self.hw
                .enable_endpoint(number, config.capabilities, config.kind);
            if config.kind == EndpointType::Bulk && config.capabilities.contains(Capabilities::RX) {
                let size = ep.max_packet_size();
                if let Err(_err) = ep.start_rx_transaction(&mut self.hw, TransferState::DataOut, size) {
                    warn!("EP{} can't receive {:?}", number, _err);
                }
            }
        }
        self.configuration = value;
        self.state = UsbDeviceState::Configured;
        debug!("CONFIGURED {}", value);

        let mut endpoints = Endpoints {
            hw: &mut self.hw,
            endpoints: &mut self.endpoints,
        };
        self.class.configured(&mut endpoints);
    }

    fn deconfigure(&mut self) {
        for ep in self.endpoints.iter_mut().flatten() {
            self.hw.disable_endpoint(ep.number());
            ep.set_state(TransferState::Idle);
        }
        self.configuration = 0;
        if self.state == UsbDeviceState::Configured {
            self.state = UsbDeviceState::Addressed;
        }
    }

    fn halt(&mut self, number: usize) {
        if let Some(ep) = self.endpoints.get_mut(number).and_then(Option::as_mut) {
            ep.stall(&mut self.hw);
        }
    }

    /// Clear a halt, reclaiming descriptors that were armed before it
    fn clear_halt(&mut self, number: usize) {
        let Some(ep) = self.endpoints.get_mut(number).and_then(Option::as_mut) else {
            return;
        };
        let config = *ep.config();
        self.hw.disable_endpoint(number);
        ep.clear_stall(&mut self.hw);
        self.hw
            .enable_endpoint(number, config.capabilities, config.kind);
        if self.state == UsbDeviceState::Configured
            && config.kind == EndpointType::Bulk
            && config.capabilities.contains(Capabilities::RX)
        {
            let size = ep.max_packet_size();
            if let Err(_err) = ep.start_rx_transaction(&mut self.hw, TransferState::DataOut, size) {
                warn!("EP{} can't receive {:?}", number, _err);
            }
        }
    }
}
