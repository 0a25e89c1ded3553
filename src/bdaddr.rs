use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum_macros::Display;

use crate::error::BdAddrParseError;

/// A 48-bit Bluetooth device address.
///
/// ```
/// use earbud_core::BdAddr;
///
/// let addr: BdAddr = "00:02:5b:00:ee:01".parse()?;
/// assert_eq!("00:02:5b:00:ee:01", addr.to_string());
/// # Ok::<(), earbud_core::BdAddrParseError>(())
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// The all-zero address, used as "no peer".
    pub const ZERO: Self = Self([0; 6]);

    /// Creates an address from its six bytes, most significant first.
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Returns the raw address bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Returns `true` for the all-zero address.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|byte| hex::encode([*byte]))
            .collect::<Vec<_>>()
            .join(":");
        f.write_str(&rendered)
    }
}

impl FromStr for BdAddr {
    type Err = BdAddrParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(':').collect();
        if parts.len() != 6 {
            return Err(BdAddrParseError::WrongLength {
                value: value.to_string(),
            });
        }

        let mut bytes = [0_u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            let decoded = hex::decode(part).map_err(|_| BdAddrParseError::InvalidOctet {
                octet: part.to_string(),
            })?;
            let [byte] = decoded.as_slice() else {
                return Err(BdAddrParseError::InvalidOctet {
                    octet: part.to_string(),
                });
            };
            *slot = *byte;
        }
        Ok(Self(bytes))
    }
}

/// Address type carried with link keys.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrType {
    #[default]
    #[strum(to_string = "public")]
    Public,
    #[strum(to_string = "random")]
    Random,
}

impl AddrType {
    pub(crate) fn as_wire(self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Random => 1,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Public),
            1 => Some(Self::Random),
            _ => None,
        }
    }
}

/// Radio transport a link runs over.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    #[strum(to_string = "bredr")]
    BrEdr,
    #[strum(to_string = "ble")]
    Ble,
}
