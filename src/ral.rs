//! Register access for the USB-OTG full-speed controller
//!
//! There's no RAL crate that covers every part carrying this peripheral, so
//! the register block and its fields are described here, in a layout that the
//! `ral-registers` macros understand. Only the registers used by the driver
//! are named; everything else is reserved padding.
//!
//! Registers are 8 bits wide, and sit on a 32-bit stride.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg, RORegister, RWRegister};

macro_rules! bit {
    ($name:ident, $offset:expr) => {
        pub mod $name {
            pub const offset: u8 = $offset;
            pub const mask: u8 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    };
}

pub mod usb {
    use super::{RORegister, RWRegister};

    #[repr(C)]
    pub struct RegisterBlock {
        _otg: [u8; 0x80],
        pub ISTAT: RWRegister<u8>,
        _reserved0: [u8; 3],
        pub INTEN: RWRegister<u8>,
        _reserved1: [u8; 3],
        pub ERRSTAT: RWRegister<u8>,
        _reserved2: [u8; 3],
        pub ERREN: RWRegister<u8>,
        _reserved3: [u8; 3],
        pub STAT: RORegister<u8>,
        _reserved4: [u8; 3],
        pub CTL: RWRegister<u8>,
        _reserved5: [u8; 3],
        pub ADDR: RWRegister<u8>,
        _reserved6: [u8; 3],
        pub BDTPAGE1: RWRegister<u8>,
        _reserved7: [u8; 3],
        pub FRMNUML: RORegister<u8>,
        _reserved8: [u8; 3],
        pub FRMNUMH: RORegister<u8>,
        _reserved9: [u8; 3],
        _token: [u8; 4],
        _softhld: [u8; 4],
        pub BDTPAGE2: RWRegister<u8>,
        _reserved10: [u8; 3],
        pub BDTPAGE3: RWRegister<u8>,
        _reserved11: [u8; 3 + 8],
        pub ENDPT: [Endpt; 16],
        pub USBCTRL: RWRegister<u8>,
        _reserved12: [u8; 3],
        _observe: [u8; 4],
        pub CONTROL: RWRegister<u8>,
        _reserved13: [u8; 3],
        pub USBTRC0: RWRegister<u8>,
        _reserved14: [u8; 3],
    }

    /// One endpoint control register, with its padding
    #[repr(C)]
    pub struct Endpt {
        pub ENDPT: RWRegister<u8>,
        _reserved: [u8; 3],
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x110) as usize];

    /// An owned pointer to the USB register block
    pub struct Instance {
        addr: *const RegisterBlock,
    }

    impl Instance {
        /// # Safety
        ///
        /// `addr` must point to a USB-OTG register block, and the caller must
        /// not create another `Instance` for the same block.
        pub const unsafe fn new(addr: *const ()) -> Self {
            Instance { addr: addr.cast() }
        }
    }

    impl core::ops::Deref for Instance {
        type Target = RegisterBlock;
        fn deref(&self) -> &RegisterBlock {
            // Safety: see Instance::new
            unsafe { &*self.addr }
        }
    }

    // Safety: Instance is the unique owner of the block
    unsafe impl Send for Instance {}

    pub mod ISTAT {
        bit!(USBRST, 0);
        bit!(ERROR, 1);
        bit!(SOFTOK, 2);
        bit!(TOKDNE, 3);
        bit!(SLEEP, 4);
        bit!(RESUME, 5);
        bit!(ATTACH, 6);
        bit!(STALL, 7);
    }

    pub mod INTEN {
        pub use super::ISTAT::*;
    }

    pub mod STAT {
        bit!(ODD, 2);
        bit!(TX, 3);
        pub mod ENDP {
            pub const offset: u8 = 4;
            pub const mask: u8 = 0xF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod CTL {
        bit!(USBENSOFEN, 0);
        bit!(ODDRST, 1);
        bit!(RESUME, 2);
        bit!(HOSTMODEEN, 3);
        bit!(RESET, 4);
        bit!(TXSUSPENDTOKENBUSY, 5);
    }

    pub mod ADDR {
        pub mod ADDR {
            pub const offset: u8 = 0;
            pub const mask: u8 = 0x7F << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod BDTPAGE1 {
        pub mod BDTBA {
            pub const offset: u8 = 1;
            pub const mask: u8 = 0x7F << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod USBCTRL {
        bit!(PDE, 6);
        bit!(SUSP, 7);
    }

    pub mod CONTROL {
        bit!(DPPULLUPNONOTG, 4);
    }

    pub mod USBTRC0 {
        bit!(USBRESET, 7);
    }
}

/// The RAL API requires us to treat all endpoint control registers as unique.
/// This function and the helper module make it look like there's one.
pub mod endpoint_control {
    use crate::ral;

    pub struct EndptCtrl<'a> {
        pub ENDPT: &'a ral::RWRegister<u8>,
    }

    pub mod ENDPT {
        bit!(EPHSHK, 0);
        bit!(EPSTALL, 1);
        bit!(EPTXEN, 2);
        bit!(EPRXEN, 3);
        bit!(EPCTLDIS, 4);
    }

    pub fn register(usb: &ral::usb::Instance, endpoint: usize) -> EndptCtrl<'_> {
        match usb.ENDPT.get(endpoint) {
            Some(endpt) => EndptCtrl {
                ENDPT: &endpt.ENDPT,
            },
            None => unreachable!("ENDPT register {} doesn't exist", endpoint),
        }
    }
}
