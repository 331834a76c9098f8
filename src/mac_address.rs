//! Bluetooth device addresses.
//!
//! Both the reporting address of an advertisement and the source MAC embedded
//! in a format 5 payload use this type, so registry keys and decoded fields
//! compare and render the same way regardless of which backend produced them.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit Bluetooth device address in transmission (big-endian) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from the little-endian byte order used on the HCI wire.
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Errors returned when parsing a MAC address string.
#[derive(Error, Debug, PartialEq)]
pub enum ParseMacError {
    #[error("expected 6 octets, got {0}")]
    OctetCount(usize),
    #[error("octet {index} is not two hex digits: {octet:?}")]
    BadOctet { index: usize, octet: String },
}

/// Accepts `AA:BB:CC:DD:EE:FF` and `aa-bb-cc-dd-ee-ff`.
impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains('-') { '-' } else { ':' };
        let count = s.split(separator).count();
        if count != 6 {
            return Err(ParseMacError::OctetCount(count));
        }

        let mut bytes = [0u8; 6];
        for (index, (octet, byte)) in s.split(separator).zip(bytes.iter_mut()).enumerate() {
            let valid = octet.len() == 2 && octet.bytes().all(|b| b.is_ascii_hexdigit());
            *byte = match u8::from_str_radix(octet, 16) {
                Ok(value) if valid => value,
                _ => {
                    return Err(ParseMacError::BadOctet {
                        index,
                        octet: octet.to_string(),
                    });
                }
            };
        }
        Ok(MacAddress(bytes))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}
