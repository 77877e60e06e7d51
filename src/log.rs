//! Logging interface, contingent on the hidden `__log` feature
//!
//! The driver runs inside the USB interrupt. Only enable `__log` when
//! debugging, and only with a logger that doesn't write to this USB port!

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::debug!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::warn!($($args)*)
    };
}

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::trace!($($args)*)
    };
}
