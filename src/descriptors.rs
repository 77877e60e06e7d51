//! Static USB descriptors
//!
//! Descriptors are plain byte tables, laid out as USB 2.0 and CDC 1.1
//! describe them. [`CDC_ACM`] is the descriptor set for a single virtual
//! serial port.

/// Descriptor types
pub mod kind {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const CS_INTERFACE: u8 = 0x24;
}

/// A complete, immutable set of descriptors
#[derive(Debug, Clone, Copy)]
pub struct DescriptorSet {
    pub device: &'static [u8],
    /// The configuration descriptor, followed by all of its interface,
    /// functional and endpoint descriptors
    pub configuration: &'static [u8],
    /// The one supported language
    pub language: u16,
    /// String descriptors, starting at index 1
    pub strings: &'static [&'static str],
}

impl DescriptorSet {
    /// Max packet size of endpoint 0
    pub fn max_packet_size_0(&self) -> usize {
        self.device.get(7).copied().unwrap_or(8) as usize
    }

    /// The `bConfigurationValue` of the only configuration
    pub fn configuration_value(&self) -> u8 {
        self.configuration.get(5).copied().unwrap_or(1)
    }

    /// Encode string descriptor `index` into `buffer`
    ///
    /// Index zero is the language table. Strings that don't fit in `buffer`
    /// are truncated. Returns `None` for an unknown index.
    pub fn string<'b>(&self, index: u8, buffer: &'b mut [u8]) -> Option<&'b [u8]> {
        let limit = buffer.len().min(u8::MAX as usize) & !1;
        if limit < 4 {
            return None;
        }
        let len = if index == 0 {
            buffer[2..4].copy_from_slice(&self.language.to_le_bytes());
            4
        } else {
            let string = self.strings.get(index as usize - 1)?;
            let mut len = 2;
            for unit in string.encode_utf16() {
                if len + 2 > limit {
                    break;
                }
                buffer[len..len + 2].copy_from_slice(&unit.to_le_bytes());
                len += 2;
            }
            len
        };
        buffer[0] = len as u8;
        buffer[1] = kind::STRING;
        Some(&buffer[..len])
    }
}

/// Interface number of the CDC communication (control) interface
pub const CDC_COMM_INTERFACE: u8 = 0;
/// Interface number of the CDC data interface
pub const CDC_DATA_INTERFACE: u8 = 1;

/// Interrupt IN endpoint for serial state notifications
pub const CDC_NOTIFICATION_ENDPOINT: u8 = 1;
/// Bulk OUT endpoint, host to device
pub const CDC_DATA_OUT_ENDPOINT: u8 = 2;
/// Bulk IN endpoint, device to host
pub const CDC_DATA_IN_ENDPOINT: u8 = 3;

pub const CONTROL_MAX_PACKET_SIZE: u8 = 64;
pub const CDC_NOTIFICATION_MAX_PACKET_SIZE: u8 = 16;
pub const CDC_DATA_MAX_PACKET_SIZE: u8 = 16;

const VENDOR_ID: u16 = 0x16D0;
const PRODUCT_ID: u16 = 0x8888;
const DEVICE_RELEASE: u16 = 0x0001;

const fn lo(value: u16) -> u8 {
    value.to_le_bytes()[0]
}

const fn hi(value: u16) -> u8 {
    value.to_le_bytes()[1]
}

#[rustfmt::skip]
static CDC_ACM_DEVICE: [u8; 18] = [
    18, kind::DEVICE,
    0x00, 0x02,                     // bcdUSB 2.00
    0x02, 0x00, 0x00,               // CDC, no subclass or protocol
    CONTROL_MAX_PACKET_SIZE,
    lo(VENDOR_ID), hi(VENDOR_ID),
    lo(PRODUCT_ID), hi(PRODUCT_ID),
    lo(DEVICE_RELEASE), hi(DEVICE_RELEASE),
    1, 2, 3,                        // manufacturer, product, serial
    1,                              // configurations
];

const CDC_ACM_CONFIGURATION_LEN: usize = 67;

#[rustfmt::skip]
static CDC_ACM_CONFIGURATION: [u8; CDC_ACM_CONFIGURATION_LEN] = [
    9, kind::CONFIGURATION,
    CDC_ACM_CONFIGURATION_LEN as u8, 0,
    2,                              // interfaces
    1,                              // bConfigurationValue
    4,                              // iConfiguration
    0x80,                           // bus powered, no remote wakeup
    250,                            // 500 mA

    // CDC communication interface
    9, kind::INTERFACE,
    CDC_COMM_INTERFACE, 0,
    1,                              // endpoints
    0x02, 0x02, 0x01,               // CDC, ACM, V.250
    6,
    // Header
    5, kind::CS_INTERFACE, 0x00, 0x10, 0x01,
    // Call management: handled by the device, over the data interface
    5, kind::CS_INTERFACE, 0x01, 0x01, CDC_DATA_INTERFACE,
    // ACM: line coding, control line state and break
    4, kind::CS_INTERFACE, 0x02, 0x06,
    // Union
    5, kind::CS_INTERFACE, 0x06, CDC_COMM_INTERFACE, CDC_DATA_INTERFACE,
    // Notification endpoint
    7, kind::ENDPOINT,
    0x80 | CDC_NOTIFICATION_ENDPOINT, 0x03,
    CDC_NOTIFICATION_MAX_PACKET_SIZE, 0,
    255,

    // CDC data interface
    9, kind::INTERFACE,
    CDC_DATA_INTERFACE, 0,
    2,
    0x0A, 0x00, 0x00,
    7,
    7, kind::ENDPOINT,
    CDC_DATA_OUT_ENDPOINT, 0x02,
    CDC_DATA_MAX_PACKET_SIZE, 0,
    1,
    7, kind::ENDPOINT,
    0x80 | CDC_DATA_IN_ENDPOINT, 0x02,
    CDC_DATA_MAX_PACKET_SIZE, 0,
    1,
];

/// A CDC-ACM virtual serial port
pub const CDC_ACM: DescriptorSet = DescriptorSet {
    device: &CDC_ACM_DEVICE,
    configuration: &CDC_ACM_CONFIGURATION,
    language: 0x0C09,
    strings: &[
        "pgo",
        "SMT-Oven",
        "SMT-OVEN-0001",
        "Default configuration",
        "CDC Interface",
        "CDC Control Interface",
        "CDC Data Interface",
    ],
};

#[cfg(test)]
mod test {
    use super::{kind, CDC_ACM};

    /// Walk the configuration, yielding (type, descriptor)
    fn walk(mut bytes: &[u8]) -> std::vec::Vec<(u8, &[u8])> {
        let mut found = std::vec::Vec::new();
        while !bytes.is_empty() {
            let len = bytes[0] as usize;
            assert!(len >= 2 && len <= bytes.len());
            found.push((bytes[1], &bytes[..len]));
            bytes = &bytes[len..];
        }
        found
    }

    #[test]
    fn device() {
        let device = CDC_ACM.device;
        assert_eq!(device.len(), device[0] as usize);
        assert_eq!(device[1], kind::DEVICE);
        assert_eq!(CDC_ACM.max_packet_size_0(), 64);
        assert_eq!(&device[8..12], &[0xD0, 0x16, 0x88, 0x88]);
    }

    #[test]
    fn configuration_total_length() {
        let config = CDC_ACM.configuration;
        let total = u16::from_le_bytes([config[2], config[3]]) as usize;
        assert_eq!(total, config.len());
        assert_eq!(CDC_ACM.configuration_value(), 1);
    }

    #[test]
    fn configuration_layout() {
        let types: std::vec::Vec<u8> = walk(CDC_ACM.configuration).iter().map(|(t, _)| *t).collect();
        assert_eq!(
            types,
            [
                kind::CONFIGURATION,
                kind::INTERFACE,
                kind::CS_INTERFACE,
                kind::CS_INTERFACE,
                kind::CS_INTERFACE,
                kind::CS_INTERFACE,
                kind::ENDPOINT,
                kind::INTERFACE,
                kind::ENDPOINT,
                kind::ENDPOINT,
            ]
        );
        let endpoints: std::vec::Vec<u8> = walk(CDC_ACM.configuration)
            .iter()
            .filter(|(t, _)| *t == kind::ENDPOINT)
            .map(|(_, d)| d[2])
            .collect();
        assert_eq!(endpoints, [0x81, 0x02, 0x83]);
    }

    #[test]
    fn language() {
        let mut buffer = [0; 64];
        assert_eq!(CDC_ACM.string(0, &mut buffer), Some(&[4, 3, 0x09, 0x0C][..]));
    }

    #[test]
    fn strings() {
        let mut buffer = [0; 64];
        assert_eq!(
            CDC_ACM.string(1, &mut buffer),
            Some(&[8, 3, b'p', 0, b'g', 0, b'o', 0][..])
        );
        let serial = CDC_ACM.string(3, &mut buffer).unwrap();
        assert_eq!(serial.len(), 2 + 2 * "SMT-OVEN-0001".len());
        assert!(CDC_ACM.string(8, &mut buffer).is_none());
    }

    #[test]
    fn strings_are_truncated() {
        let mut buffer = [0; 9];
        let string = CDC_ACM.string(4, &mut buffer).unwrap();
        assert_eq!(string.len(), 8);
        assert_eq!(string[0], 8);
    }
}
