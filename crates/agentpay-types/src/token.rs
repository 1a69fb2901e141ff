//! Supported settlement tokens
//!
//! The broker never touches the chain itself; tokens here only select the
//! adapter tag and the approval policy. Decimal scaling happens in the token
//! adapter outside the core.

use crate::{AgentPayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Token a payment is denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Token {
    /// The chain's native token
    #[serde(rename = "primary-native")]
    Native,
    /// ERC-20 stablecoin
    #[serde(rename = "erc20-stable")]
    Stable,
}

impl Token {
    /// All supported tokens
    pub const SUPPORTED: [Token; 2] = [Token::Native, Token::Stable];

    /// Wire/persistence string form
    pub fn as_str(&self) -> &'static str {
        match self {
            Token::Native => "primary-native",
            Token::Stable => "erc20-stable",
        }
    }

    /// Tag selecting the on-chain adapter for this token
    pub fn adapter_tag(&self) -> &'static str {
        match self {
            Token::Native => "native",
            Token::Stable => "erc20",
        }
    }

    /// ERC-20 transfers need an allowance step before funds can lock
    pub fn requires_approval(&self) -> bool {
        matches!(self, Token::Stable)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Token {
    type Err = AgentPayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "primary-native" => Ok(Token::Native),
            "erc20-stable" => Ok(Token::Stable),
            other => Err(AgentPayError::invalid_input(
                "token",
                format!("unsupported token {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parse() {
        assert_eq!("primary-native".parse::<Token>().unwrap(), Token::Native);
        assert_eq!("erc20-stable".parse::<Token>().unwrap(), Token::Stable);
        assert!("doge".parse::<Token>().is_err());
    }

    #[test]
    fn test_approval_policy() {
        assert!(!Token::Native.requires_approval());
        assert!(Token::Stable.requires_approval());
    }
}
