use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ADDRESS_HEX_LENGTH: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid address: {0}")]
    Invalid(String),
}

/// Returns true for `0x` followed by exactly 40 hex digits, in any case.
pub fn is_valid_address(input: &str) -> bool {
    match input.strip_prefix("0x") {
        Some(digits) => {
            digits.len() == ADDRESS_HEX_LENGTH && digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// A 20-byte account address, normalized to lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in messages, e.g. `0xb5d85cbf...2f43f511`.
    pub fn short(&self) -> String {
        format!("{}...{}", &self.0[..10], &self.0[self.0.len() - 8..])
    }

    /// The address as a 32-byte ABI word, hex encoded without prefix.
    pub fn abi_word(&self) -> String {
        format!("{:0>64}", &self.0[2..])
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if is_valid_address(trimmed) {
            Ok(Self(trimmed.to_ascii_lowercase()))
        } else {
            Err(AddressError::Invalid(s.to_string()))
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
