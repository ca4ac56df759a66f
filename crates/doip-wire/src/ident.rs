//! Vehicle and entity identifiers

use std::fmt;

use crate::WireError;

/// Entity identifier broadcast in vehicle announcements (typically the MAC).
pub type Eid = [u8; 6];

/// Group identifier broadcast in vehicle announcements.
pub type Gid = [u8; 6];

/// 17-character vehicle identification number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vin([u8; 17]);

impl Vin {
    pub const LENGTH: usize = 17;

    /// Build a VIN from exactly 17 printable ASCII characters.
    pub fn new(s: &str) -> Result<Self, WireError> {
        let bytes = s.as_bytes();
        if bytes.len() != Self::LENGTH {
            return Err(WireError::InvalidVin(format!(
                "expected {} characters, got {}",
                Self::LENGTH,
                bytes.len()
            )));
        }
        if !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(WireError::InvalidVin(format!("non-ASCII character in {s:?}")));
        }
        let mut vin = [0u8; Self::LENGTH];
        vin.copy_from_slice(bytes);
        Ok(Self(vin))
    }

    pub fn from_bytes(bytes: [u8; 17]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 17] {
        &self.0
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl std::str::FromStr for Vin {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Whether `address` lies in the external-tester range ISO 13400-2 assigns
/// for routing activation source addresses (0x0E00..=0x0FFF).
pub fn is_valid_source_address(address: u16) -> bool {
    (0x0E00..=0x0FFF).contains(&address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vin_requires_17_ascii_chars() {
        assert!(Vin::new("WAUZZZ8V9KA123456").is_ok());
        assert!(Vin::new("TOOSHORT").is_err());
        assert!(Vin::new("WAUZZZ8V9KA12345\u{e9}").is_err());
    }

    #[test]
    fn vin_displays_as_text() {
        let vin = Vin::new("WAUZZZ8V9KA123456").unwrap();
        assert_eq!(vin.to_string(), "WAUZZZ8V9KA123456");
    }

    #[test]
    fn tester_address_range() {
        assert!(is_valid_source_address(0x0E00));
        assert!(is_valid_source_address(0x0E80));
        assert!(is_valid_source_address(0x0FFF));
        assert!(!is_valid_source_address(0x0DFF));
        assert!(!is_valid_source_address(0x1000));
        assert!(!is_valid_source_address(0xD010));
    }
}
