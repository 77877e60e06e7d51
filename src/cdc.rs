//! CDC-ACM virtual serial port
//!
//! The class is split in two. [`CdcAcm`] belongs to the [`Device`](crate::device::Device),
//! and runs in the USB interrupt. [`Pipe`] is shared with the application,
//! usually as a `static`. They meet in two byte queues, guarded by a
//! critical section.
//!
//! ```no_run
//! use bdt_usbd::cdc::{CdcAcm, Pipe};
//!
//! static SERIAL: Pipe<256> = Pipe::new();
//!
//! let class = CdcAcm::new(&SERIAL);
//! // Hand `class` to a Device, and poll the device from the USB interrupt.
//!
//! let mut buffer = [0; 64];
//! let received = SERIAL.receive(&mut buffer);
//! SERIAL.send(&buffer[..received]);
//! ```
//!
//! Sent bytes go out on the next device poll, which a send hook can trigger,
//! or at the latest on the next frame. Received bytes wait in the pipe; when
//! it's full, the bulk OUT endpoint NAKs until the application catches up.

use crate::control::{Control, Outcome};
use crate::descriptors::{
    CDC_COMM_INTERFACE, CDC_DATA_IN_ENDPOINT, CDC_DATA_MAX_PACKET_SIZE, CDC_DATA_OUT_ENDPOINT,
    CDC_NOTIFICATION_ENDPOINT, CDC_NOTIFICATION_MAX_PACKET_SIZE,
};
use crate::device::{unhandled, Class, Endpoints};
use crate::endpoint::{Capabilities, EndpointConfig, TransferState};
use crate::hal::Hardware;
use core::cell::RefCell;
use critical_section::Mutex;
use heapless::Deque;
use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointType,
};

const SET_LINE_CODING: u8 = 0x20;
const GET_LINE_CODING: u8 = 0x21;
const SET_CONTROL_LINE_STATE: u8 = 0x22;
const SEND_BREAK: u8 = 0x23;

const SERIAL_STATE_NOTIFICATION: u8 = 0x20;

/// Largest transfer on the bulk IN endpoint
pub const DATA_IN_CAPACITY: usize = 64;

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum ParityType {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Serial line parameters, as chosen by the host
///
/// Stored as the host sent them. The device doesn't drive a real UART, so
/// unknown codes are kept, and read back, unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub struct LineCoding {
    pub baud_rate: u32,
    /// `bCharFormat`
    pub stop_bits: u8,
    /// `bParityType`
    pub parity: u8,
    pub data_bits: u8,
}

impl LineCoding {
    /// Size of the encoded structure
    pub const LEN: usize = 7;

    /// 9600 baud, 8N1
    pub const DEFAULT: LineCoding = LineCoding {
        baud_rate: 9600,
        stop_bits: 0,
        parity: 0,
        data_bits: 8,
    };

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let [b0, b1, b2, b3] = self.baud_rate.to_le_bytes();
        [b0, b1, b2, b3, self.stop_bits, self.parity, self.data_bits]
    }

    /// Decode the first seven bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::LEN] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(LineCoding {
            baud_rate: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits: bytes[4],
            parity: bytes[5],
            data_bits: bytes[6],
        })
    }

    pub fn stop_bits(&self) -> Option<StopBits> {
        match self.stop_bits {
            0 => Some(StopBits::One),
            1 => Some(StopBits::OnePointFive),
            2 => Some(StopBits::Two),
            _ => None,
        }
    }

    pub fn parity_type(&self) -> Option<ParityType> {
        match self.parity {
            0 => Some(ParityType::None),
            1 => Some(ParityType::Odd),
            2 => Some(ParityType::Even),
            3 => Some(ParityType::Mark),
            4 => Some(ParityType::Space),
            _ => None,
        }
    }
}

impl Default for LineCoding {
    fn default() -> Self {
        Self::DEFAULT
    }
}

bitflags::bitflags! {
    /// Modem control lines, as set by the host
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlLineState : u16 {
        /// Data terminal ready
        const DTR = 1 << 0;
        /// Request to send; carrier control for half duplex modems
        const RTS = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Serial state, as reported to the host
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SerialState : u16 {
        /// Receive carrier, `bRxCarrier`
        const DCD = 1 << 0;
        /// Transmit carrier, `bTxCarrier`
        const DSR = 1 << 1;
        const BREAK = 1 << 2;
        const RING = 1 << 3;
        const FRAMING = 1 << 4;
        const PARITY = 1 << 5;
        /// Received data was dropped
        const OVERRUN = 1 << 6;
    }
}

/// A break requested by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum Break {
    Off,
    /// Break for this many milliseconds
    Millis(u16),
    /// Break until the host ends it
    Indefinite,
}

impl Break {
    fn from_value(value: u16) -> Self {
        match value {
            0 => Break::Off,
            0xFFFF => Break::Indefinite,
            ms => Break::Millis(ms),
        }
    }
}

/// Build a SERIAL_STATE notification
fn serial_state_notification(state: SerialState) -> [u8; 10] {
    let [s0, s1] = state.bits().to_le_bytes();
    [
        0xA1,
        SERIAL_STATE_NOTIFICATION,
        0,
        0,
        CDC_COMM_INTERFACE,
        0,
        2,
        0,
        s0,
        s1,
    ]
}

/// Append as much of `data` as fits, and return how much that was
fn push<const N: usize>(queue: &mut Deque<u8, N>, data: &[u8]) -> usize {
    data.iter()
        .take_while(|&&byte| queue.push_back(byte).is_ok())
        .count()
}

/// Copy the oldest bytes into `dst`, without removing them
fn peek<const N: usize>(queue: &Deque<u8, N>, dst: &mut [u8]) -> usize {
    let mut size = 0;
    for (dst, &byte) in dst.iter_mut().zip(queue.iter()) {
        *dst = byte;
        size += 1;
    }
    size
}

/// Move the oldest bytes into `dst`
fn pop<const N: usize>(queue: &mut Deque<u8, N>, dst: &mut [u8]) -> usize {
    dst.iter_mut()
        .map_while(|dst| queue.pop_front().map(|byte| *dst = byte))
        .count()
}

fn free<const N: usize>(queue: &Deque<u8, N>) -> usize {
    queue.capacity() - queue.len()
}

struct Shared<const N: usize> {
    /// Device to host
    tx: Deque<u8, N>,
    /// Host to device
    rx: Deque<u8, N>,
    line_coding: LineCoding,
    control_line_state: ControlLineState,
    serial_state: SerialState,
    break_state: Break,
    ready: Option<fn()>,
    kick: Option<fn()>,
}

/// The application's side of a virtual serial port
///
/// Every method is non-blocking, and safe to call from any context.
pub struct Pipe<const N: usize> {
    shared: Mutex<RefCell<Shared<N>>>,
}

impl<const N: usize> Pipe<N> {
    pub const fn new() -> Self {
        Pipe {
            shared: Mutex::new(RefCell::new(Shared {
                tx: Deque::new(),
                rx: Deque::new(),
                line_coding: LineCoding::DEFAULT,
                control_line_state: ControlLineState::empty(),
                serial_state: SerialState::empty(),
                break_state: Break::Off,
                ready: None,
                kick: None,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Shared<N>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.shared.borrow_ref_mut(cs)))
    }

    /// Queue bytes for the host
    ///
    /// Returns how many bytes fit. Calls the send hook, if there is one, so
    /// the transfer can start before the next frame.
    pub fn send(&self, data: &[u8]) -> usize {
        let (size, kick) = self.with(|shared| (push(&mut shared.tx, data), shared.kick));
        if let Some(kick) = kick.filter(|_| size > 0) {
            kick();
        }
        size
    }

    /// Take bytes that the host sent
    pub fn receive(&self, buffer: &mut [u8]) -> usize {
        self.with(|shared| pop(&mut shared.rx, buffer))
    }

    /// Room for bytes to send
    pub fn send_capacity(&self) -> usize {
        self.with(|shared| free(&shared.tx))
    }

    /// Bytes waiting to be received
    pub fn available(&self) -> usize {
        self.with(|shared| shared.rx.len())
    }

    /// Called, from the USB interrupt, when everything queued was sent
    pub fn set_ready_hook(&self, hook: Option<fn()>) {
        self.with(|shared| shared.ready = hook)
    }

    /// Called from [`send`](Self::send), after new bytes are queued
    ///
    /// Pend the USB interrupt here, with `cortex_m::peripheral::NVIC::pend`.
    /// The next [`Device::poll`](crate::device::Device::poll) starts the
    /// transfer if bulk IN is idle. Without a hook, the transfer starts on the
    /// next frame.
    pub fn set_send_hook(&self, hook: Option<fn()>) {
        self.with(|shared| shared.kick = hook)
    }

    pub fn line_coding(&self) -> LineCoding {
        self.with(|shared| shared.line_coding)
    }

    pub fn control_line_state(&self) -> ControlLineState {
        self.with(|shared| shared.control_line_state)
    }

    pub fn break_state(&self) -> Break {
        self.with(|shared| shared.break_state)
    }

    pub fn serial_state(&self) -> SerialState {
        self.with(|shared| shared.serial_state)
    }

    /// Report a new serial state to the host
    ///
    /// The host is notified on the next frame, if the state changed.
    pub fn set_serial_state(&self, state: SerialState) {
        self.with(|shared| shared.serial_state = state)
    }
}

impl<const N: usize> Default for Pipe<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The interrupt side of a virtual serial port
pub struct CdcAcm<const N: usize> {
    pipe: &'static Pipe<N>,
    endpoints: [EndpointConfig; 3],
    /// The last serial state the host saw
    notified: SerialState,
}

impl<const N: usize> CdcAcm<N> {
    pub fn new(pipe: &'static Pipe<N>) -> Self {
        CdcAcm {
            pipe,
            endpoints: [
                EndpointConfig {
                    number: CDC_NOTIFICATION_ENDPOINT,
                    kind: EndpointType::Interrupt,
                    capabilities: Capabilities::TX,
                    max_packet_size: CDC_NOTIFICATION_MAX_PACKET_SIZE as usize,
                    capacity: CDC_NOTIFICATION_MAX_PACKET_SIZE as usize,
                },
                EndpointConfig {
                    number: CDC_DATA_OUT_ENDPOINT,
                    kind: EndpointType::Bulk,
                    capabilities: Capabilities::RX,
                    max_packet_size: CDC_DATA_MAX_PACKET_SIZE as usize,
                    capacity: CDC_DATA_MAX_PACKET_SIZE as usize,
                },
                EndpointConfig {
                    number: CDC_DATA_IN_ENDPOINT,
                    kind: EndpointType::Bulk,
                    capabilities: Capabilities::TX,
                    max_packet_size: CDC_DATA_MAX_PACKET_SIZE as usize,
                    capacity: DATA_IN_CAPACITY,
                },
            ],
            notified: SerialState::empty(),
        }
    }

    pub fn pipe(&self) -> &'static Pipe<N> {
        self.pipe
    }

    /// Start the next bulk IN transfer, if the endpoint is free
    ///
    /// Returns `false` if there was nothing to send.
    fn send_next<H: Hardware>(&mut self, endpoints: &mut Endpoints<'_, H>) -> bool {
        let Some((ep, hw)) = endpoints.get(CDC_DATA_IN_ENDPOINT) else {
            return false;
        };
        if ep.state() != TransferState::Idle {
            return true;
        }
        let mut chunk = [0; DATA_IN_CAPACITY];
        let size = self.pipe.with(|shared| peek(&shared.tx, &mut chunk));
        if size == 0 {
            return false;
        }
        // Always terminate the host's read, even on a full packet
        ep.set_need_zlp();
        match ep.start_tx_transaction(hw, TransferState::DataIn, &chunk[..size]) {
            Ok(()) => {
                self.pipe.with(|shared| {
                    for _ in 0..size {
                        shared.tx.pop_front();
                    }
                });
                true
            }
            Err(_err) => {
                warn!("CDC IN failed {:?}", _err);
                true
            }
        }
    }

    /// Tell the application that everything was sent
    fn ready(&self) {
        if let Some(hook) = self.pipe.with(|shared| shared.ready) {
            hook();
        }
    }

    /// Arm bulk OUT for another packet, unless the pipe can't take it
    fn resume_receive<H: Hardware>(&mut self, endpoints: &mut Endpoints<'_, H>) {
        let Some((ep, hw)) = endpoints.get(CDC_DATA_OUT_ENDPOINT) else {
            return;
        };
        let max = ep.max_packet_size();
        if self.pipe.with(|shared| free(&shared.rx)) < max {
            ep.set_state(TransferState::Throttle);
            return;
        }
        if let Err(_err) = ep.start_rx_transaction(hw, TransferState::DataOut, max) {
            warn!("CDC OUT failed {:?}", _err);
        }
    }

    fn received<H: Hardware>(&mut self, endpoints: &mut Endpoints<'_, H>) {
        let Some((ep, _)) = endpoints.get(CDC_DATA_OUT_ENDPOINT) else {
            return;
        };
        let mut packet = [0; CDC_DATA_MAX_PACKET_SIZE as usize];
        let size = ep.read(&mut packet);
        self.pipe.with(|shared| {
            if push(&mut shared.rx, &packet[..size]) < size {
                shared.serial_state |= SerialState::OVERRUN;
            }
        });
        self.resume_receive(endpoints);
    }

    /// Send a SERIAL_STATE notification if the state changed
    fn notify<H: Hardware>(&mut self, endpoints: &mut Endpoints<'_, H>) {
        let state = self.pipe.serial_state();
        if state == self.notified {
            return;
        }
        let Some((ep, hw)) = endpoints.get(CDC_NOTIFICATION_ENDPOINT) else {
            return;
        };
        if ep.state() != TransferState::Idle {
            return;
        }
        let notification = serial_state_notification(state);
        if ep
            .start_tx_transaction(hw, TransferState::DataIn, &notification)
            .is_ok()
        {
            debug!("CDC serial state {:?}", state);
            self.notified = state;
        }
    }
}

impl<const N: usize> Class for CdcAcm<N> {
    fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    fn reset(&mut self) {
        self.notified = SerialState::empty();
    }

    fn configured<H: Hardware>(&mut self, _endpoints: &mut Endpoints<'_, H>) {
        self.notified = SerialState::empty();
    }

    fn control_request<H: Hardware>(&mut self, xfer: Control<'_, H>) -> Outcome {
        let request = *xfer.request();
        if request.request_type != RequestType::Class
            || request.recipient != Recipient::Interface
            || request.index != CDC_COMM_INTERFACE as u16
        {
            return Outcome::Unhandled;
        }
        match request.request {
            SET_LINE_CODING => xfer.receive(),
            GET_LINE_CODING => {
                let line_coding = self.pipe.line_coding();
                xfer.accept_with(&line_coding.to_bytes())
            }
            SET_CONTROL_LINE_STATE => {
                let lines = ControlLineState::from_bits_truncate(request.value);
                debug!("CDC lines {:?}", lines);
                self.pipe.with(|shared| shared.control_line_state = lines);
                xfer.accept()
            }
            SEND_BREAK => {
                let state = Break::from_value(request.value);
                self.pipe.with(|shared| shared.break_state = state);
                xfer.accept()
            }
            _ => Outcome::Unhandled,
        }
    }

    fn control_out(&mut self, request: &Request, data: &[u8]) -> Outcome {
        if request.request != SET_LINE_CODING {
            return Outcome::Unhandled;
        }
        match LineCoding::from_bytes(data) {
            Some(line_coding) => {
                debug!("CDC {:?}", line_coding);
                self.pipe.with(|shared| shared.line_coding = line_coding);
                Outcome::Handled
            }
            None => Outcome::Unhandled,
        }
    }

    fn transfer_complete<H: Hardware>(
        &mut self,
        endpoints: &mut Endpoints<'_, H>,
        endpoint: usize,
        state: TransferState,
    ) {
        match (endpoint as u8, state) {
            (CDC_DATA_OUT_ENDPOINT, TransferState::DataOut) => self.received(endpoints),
            (CDC_DATA_IN_ENDPOINT, TransferState::DataIn) => {
                if !self.send_next(endpoints) {
                    self.ready();
                }
            }
            (CDC_NOTIFICATION_ENDPOINT, TransferState::DataIn) => self.notify(endpoints),
            _ => unhandled(endpoint, state),
        }
    }

    fn poll<H: Hardware>(&mut self, endpoints: &mut Endpoints<'_, H>) {
        self.send_next(endpoints);
    }

    fn start_of_frame<H: Hardware>(&mut self, endpoints: &mut Endpoints<'_, H>) {
        self.notify(endpoints);
        self.send_next(endpoints);
        if endpoints.state(CDC_DATA_OUT_ENDPOINT) == Some(TransferState::Throttle) {
            self.resume_receive(endpoints);
        }
    }
}
