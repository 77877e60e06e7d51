//! Endpoint state machine and transfer engine
//!
//! An [`Endpoint`] turns token-complete events into multi-packet transfers.
//! Each event advances the state machine by exactly one step, so every
//! method is bounded and safe to call from the USB interrupt.
//!
//! An endpoint owns two buffers from endpoint memory:
//!
//! - the *packet* buffer, one max packet long, which both receive descriptors
//!   point at;
//! - the *staging* buffer, which holds a whole transfer. Transmit descriptors
//!   point into it directly; received packets are copied into it.

use crate::bdt::Owner;
use crate::buffer::{Allocator, Buffer};
use crate::hal::Hardware;
use usb_device::{endpoint::EndpointType, UsbDirection, UsbError};

bitflags::bitflags! {
    /// Which directions an endpoint may transfer in
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities : u8 {
        /// Device to host
        const TX = 1 << 0;
        /// Host to device
        const RX = 1 << 1;
        /// Both directions, as required by endpoint 0
        const CONTROL = Self::TX.bits() | Self::RX.bits();
    }
}

/// The phase of an endpoint's current transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
pub enum TransferState {
    /// No transfer
    Idle,
    /// Sending data packets to the host
    DataIn,
    /// Receiving data packets from the host
    DataOut,
    /// Sending a handshake packet
    StatusIn,
    /// Receiving a handshake packet
    StatusOut,
    /// Held by a class, until it can accept more data
    Throttle,
    /// Stalled, until explicitly cleared
    Stall,
    /// Held by a class, to signal something out-of-band
    Complete,
}

/// The DATA0 / DATA1 packet sequence bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum DataToggle {
    Data0 = 0,
    Data1 = 1,
}

impl DataToggle {
    pub fn flip(self) -> Self {
        match self {
            DataToggle::Data0 => DataToggle::Data1,
            DataToggle::Data1 => DataToggle::Data0,
        }
    }
}

/// Selects the even or odd buffer descriptor of a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt_03::Format))]
#[repr(u8)]
pub enum Parity {
    Even = 0,
    Odd = 1,
}

impl Parity {
    pub fn flip(self) -> Self {
        match self {
            Parity::Even => Parity::Odd,
            Parity::Odd => Parity::Even,
        }
    }
}

/// Static description of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub number: u8,
    pub kind: EndpointType,
    pub capabilities: Capabilities,
    pub max_packet_size: usize,
    /// Largest transfer the endpoint can stage
    pub capacity: usize,
}

/// Byte accounting for one transfer
///
/// `transferred + remaining` doesn't change while a transfer runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Transfer {
    transferred: usize,
    remaining: usize,
    /// A trailing zero-length packet is still owed
    zlp: bool,
}

const fn slot(direction: UsbDirection) -> usize {
    match direction {
        UsbDirection::Out => 0,
        UsbDirection::In => 1,
    }
}

/// A USB endpoint
pub struct Endpoint {
    config: EndpointConfig,
    state: TransferState,
    toggle: [DataToggle; 2],
    parity: [Parity; 2],
    transfer: Transfer,
    need_zlp: bool,
    packet: Option<Buffer>,
    staging: Buffer,
}

impl Endpoint {
    /// Allocate an endpoint's buffers from endpoint memory
    pub(crate) fn new(config: EndpointConfig, memory: &mut Allocator) -> usb_device::Result<Self> {
        let packet = if config.capabilities.contains(Capabilities::RX) {
            Some(
                memory
                    .allocate(config.max_packet_size)
                    .ok_or(UsbError::EndpointMemoryOverflow)?,
            )
        } else {
            None
        };
        let staging = memory
            .allocate(config.capacity.max(config.max_packet_size))
            .ok_or(UsbError::EndpointMemoryOverflow)?;
        Ok(Endpoint {
            config,
            state: TransferState::Idle,
            toggle: [DataToggle::Data0; 2],
            parity: [Parity::Even; 2],
            transfer: Transfer::default(),
            need_zlp: false,
            packet,
            staging,
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn number(&self) -> usize {
        self.config.number as usize
    }

    pub fn max_packet_size(&self) -> usize {
        self.config.max_packet_size
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Move the endpoint into a state that's driven by a class
    ///
    /// Meant for `Throttle`, `Complete`, and returning to `Idle`.
    pub fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    pub fn toggle(&self, direction: UsbDirection) -> DataToggle {
        self.toggle[slot(direction)]
    }

    pub(crate) fn set_toggle(&mut self, direction: UsbDirection, toggle: DataToggle) {
        self.toggle[slot(direction)] = toggle;
    }

    /// The buffer half that will carry the next packet in `direction`
    pub fn parity(&self, direction: UsbDirection) -> Parity {
        self.parity[slot(direction)]
    }

    /// The largest transfer the endpoint can stage
    pub fn capacity(&self) -> usize {
        self.staging.len()
    }

    /// Bytes moved so far in the current, or last, transfer
    pub fn transferred(&self) -> usize {
        self.transfer.transferred
    }

    /// Bytes still expected in the current transfer
    pub fn remaining(&self) -> usize {
        self.transfer.remaining
    }

    /// Request a trailing zero-length packet for the next transmission
    ///
    /// Only sent if the transmission ends on a full packet.
    pub fn set_need_zlp(&mut self) {
        self.need_zlp = true;
    }

    /// Return to the power-on state: idle, DATA0, even buffers
    pub fn reset(&mut self) {
        self.state = TransferState::Idle;
        self.toggle = [DataToggle::Data0; 2];
        self.parity = [Parity::Even; 2];
        self.transfer = Transfer::default();
        self.need_zlp = false;
    }

    /// Record a completed packet in `direction`
    ///
    /// `used` is the buffer half the SIE reports for the token. The next packet
    /// goes in the other half.
    pub fn flip_parity(&mut self, direction: UsbDirection, used: Parity) {
        self.parity[slot(direction)] = used.flip();
    }

    /// Copy the last received packet, as the SIE wrote it, into `dst`
    pub(crate) fn read_packet(&self, dst: &mut [u8]) -> usize {
        self.packet
            .as_ref()
            .map_or(0, |packet| packet.volatile_read(0, dst))
    }

    /// Copy the bytes received by the last receive transfer into `dst`
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let size = dst.len().min(self.transfer.transferred);
        self.staging.volatile_read(0, &mut dst[..size])
    }

    fn require(&self, capability: Capabilities) -> usb_device::Result<()> {
        if self.config.capabilities.contains(capability) {
            Ok(())
        } else {
            warn!("EP{} can't {:?}", self.number(), capability);
            Err(UsbError::InvalidEndpoint)
        }
    }

    fn is_firmware_owned<H: Hardware>(&self, hw: &H, direction: UsbDirection) -> bool {
        let ep = self.number();
        [Parity::Even, Parity::Odd]
            .iter()
            .all(|&parity| hw.descriptor(ep, direction, parity).owner == Owner::Firmware)
    }

    /// Start sending `data` to the host
    ///
    /// Each packet is at most one max packet long. The transfer ends with a
    /// zero-length packet if [`set_need_zlp`](Self::set_need_zlp) was called, and
    /// the data fills its last packet. An empty `data` sends one empty packet.
    ///
    /// Returns `WouldBlock` if the SIE still owns a transmit descriptor, which means
    /// a previous transmission is in flight. The endpoint doesn't change.
    pub fn start_tx_transaction<H: Hardware>(
        &mut self,
        hw: &mut H,
        state: TransferState,
        data: &[u8],
    ) -> usb_device::Result<()> {
        // A ZLP request only applies to this transmission, even if it fails
        let zlp = core::mem::take(&mut self.need_zlp);
        self.require(Capabilities::TX)?;
        if !self.is_firmware_owned(hw, UsbDirection::In) {
            warn!("EP{} IN descriptor busy", self.number());
            return Err(UsbError::WouldBlock);
        }
        if data.len() > self.staging.len() {
            warn!("EP{} {} bytes won't fit", self.number(), data.len());
            return Err(UsbError::BufferOverflow);
        }

        self.staging.volatile_write(0, data);
        self.transfer = Transfer {
            transferred: 0,
            remaining: data.len(),
            zlp,
        };
        self.state = state;
        self.next_tx_packet(hw)
    }

    /// Arm the transmit descriptor for the next packet of the transfer
    fn next_tx_packet<H: Hardware>(&mut self, hw: &mut H) -> usb_device::Result<()> {
        let max = self.config.max_packet_size;
        let size = self.transfer.remaining.min(max);
        if size < max {
            self.transfer.zlp = false;
        }
        let address = self.staging.as_ptr().wrapping_add(self.transfer.transferred);
        let direction = UsbDirection::In;
        hw.arm(
            self.number(),
            direction,
            self.parity(direction),
            address,
            size,
            self.toggle(direction),
        )?;
        self.transfer.transferred += size;
        self.transfer.remaining -= size;
        trace!("EP{} IN {} bytes", self.number(), size);
        Ok(())
    }

    /// Start receiving up to `size` bytes from the host
    ///
    /// The receive descriptor is always armed for a full packet; bytes beyond
    /// `size` are dropped. `size` is clamped to the staging capacity.
    pub fn start_rx_transaction<H: Hardware>(
        &mut self,
        hw: &mut H,
        state: TransferState,
        size: usize,
    ) -> usb_device::Result<()> {
        self.require(Capabilities::RX)?;
        let capacity = self.staging.len();
        if size > capacity {
            debug!("EP{} OUT clamped to {} bytes", self.number(), capacity);
        }
        self.transfer = Transfer {
            transferred: 0,
            remaining: size.min(capacity),
            zlp: false,
        };
        self.state = state;
        self.arm_rx(hw)
    }

    pub(crate) fn arm_rx<H: Hardware>(&mut self, hw: &mut H) -> usb_device::Result<()> {
        let direction = UsbDirection::Out;
        let Some(packet) = &self.packet else {
            return Err(UsbError::InvalidEndpoint);
        };
        hw.arm(
            self.number(),
            direction,
            self.parity(direction),
            packet.as_ptr(),
            self.config.max_packet_size,
            self.toggle(direction),
        )
        .map_err(|err| {
            warn!("EP{} OUT descriptor busy", self.number());
            err
        })
    }

    /// Move a received packet from the packet buffer to the staging buffer
    ///
    /// Returns the packet's size on the wire.
    fn save_rx_data(&mut self, received: usize) -> usize {
        if received == 0 {
            debug!("EP{} empty OUT packet", self.number());
        }
        let size = received.min(self.transfer.remaining);
        if let Some(packet) = &self.packet {
            self.staging.copy_from(self.transfer.transferred, packet, size);
        }
        self.transfer.transferred += size;
        self.transfer.remaining -= size;
        received
    }

    /// Handle a completed IN token
    ///
    /// Returns the completed state once the whole transfer is done.
    pub fn handle_in_token<H: Hardware>(&mut self, hw: &mut H) -> Option<TransferState> {
        let direction = UsbDirection::In;
        self.set_toggle(direction, self.toggle(direction).flip());

        match self.state {
            TransferState::DataIn => {
                if self.transfer.remaining > 0 || self.transfer.zlp {
                    if let Err(_err) = self.next_tx_packet(hw) {
                        warn!("EP{} IN stalled mid-transfer {:?}", self.number(), _err);
                    }
                    None
                } else {
                    self.state = TransferState::Idle;
                    Some(TransferState::DataIn)
                }
            }
            TransferState::StatusIn => {
                self.state = TransferState::Idle;
                Some(TransferState::StatusIn)
            }
            TransferState::Stall => {
                warn!("EP{} IN token while stalled", self.number());
                None
            }
            _state => {
                warn!("EP{} unexpected IN token in {:?}", self.number(), _state);
                self.state = TransferState::Idle;
                None
            }
        }
    }

    /// Handle a completed OUT token
    ///
    /// Returns the completed state once the whole transfer is done.
    pub fn handle_out_token<H: Hardware>(&mut self, hw: &mut H, parity: Parity) -> Option<TransferState> {
        let direction = UsbDirection::Out;
        let received = hw.descriptor(self.number(), direction, parity).byte_count;
        self.set_toggle(direction, self.toggle(direction).flip());

        match self.state {
            TransferState::DataOut => {
                let size = self.save_rx_data(received);
                if size < self.config.max_packet_size || self.transfer.remaining == 0 {
                    self.state = TransferState::Idle;
                    Some(TransferState::DataOut)
                } else {
                    if let Err(_err) = self.arm_rx(hw) {
                        warn!("EP{} OUT stalled mid-transfer {:?}", self.number(), _err);
                    }
                    None
                }
            }
            TransferState::StatusOut => {
                self.state = TransferState::Idle;
                Some(TransferState::StatusOut)
            }
            TransferState::Stall => {
                warn!("EP{} OUT token while stalled", self.number());
                None
            }
            _state => {
                warn!("EP{} unexpected OUT token in {:?}", self.number(), _state);
                self.state = TransferState::Idle;
                None
            }
        }
    }

    /// Stall the endpoint
    ///
    /// Aborts the logical transfer. Toggles and buffer selectors are kept.
    pub fn stall<H: Hardware>(&mut self, hw: &mut H) {
        debug!("EP{} STALL", self.number());
        self.state = TransferState::Stall;
        hw.set_stalled(self.number(), true);
    }

    /// Clear a stall, and return both directions to DATA0
    pub fn clear_stall<H: Hardware>(&mut self, hw: &mut H) {
        hw.set_stalled(self.number(), false);
        self.toggle = [DataToggle::Data0; 2];
        self.state = TransferState::Idle;
        self.need_zlp = false;
    }
}
