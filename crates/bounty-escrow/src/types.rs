use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest indivisible unit of the escrowed token.
///
/// Amounts are plain base units; the engine never deals in fractional
/// display denominations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenAmount(u128);

impl TokenAmount {
    pub const ZERO: Self = Self(0);

    pub fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    pub fn to_base_units(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque authenticated caller identity, supplied by the host per call.
///
/// Identities are account-id strings; the engine never verifies them, it
/// only compares them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_arithmetic() {
        let a = TokenAmount::from_base_units(2000);
        let b = TokenAmount::from_base_units(500);

        assert_eq!(a.checked_sub(b), Some(TokenAmount::from_base_units(1500)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(b.saturating_sub(a), TokenAmount::ZERO);
        assert_eq!(
            a.checked_add(b),
            Some(TokenAmount::from_base_units(2500))
        );
        assert_eq!(
            TokenAmount::from_base_units(u128::MAX).checked_add(b),
            None
        );
    }

    #[test]
    fn account_id_round_trip() {
        let id = AccountId::new("company1");
        assert_eq!(id.as_str(), "company1");
        assert_eq!(id, AccountId::from("company1"));
        assert_ne!(id, AccountId::from("company2"));
    }
}
