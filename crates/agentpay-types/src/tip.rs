//! Tipping types
//!
//! A tip is a payment attributed to a repository reference and directed at a
//! named recipient, carried operationally by an escrow.

use crate::{AgentPayError, EscrowId, Result, TipId, Token};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a GitHub owner or repository name segment
pub const MAX_SEGMENT_LEN: usize = 39;

/// Check a string against the GitHub naming rule: alphanumeric with interior
/// hyphens, no leading/trailing hyphen, 1..=39 characters
pub fn is_github_name(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_SEGMENT_LEN {
        return false;
    }
    let bytes = s.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

fn is_eth_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s.as_bytes()[2..].iter().all(|b| b.is_ascii_hexdigit())
}

/// A `<owner>/<name>` repository reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parse and validate an `<owner>/<name>` reference
    pub fn parse(s: &str) -> Result<Self> {
        let (owner, name) = s.split_once('/').ok_or_else(|| {
            AgentPayError::invalid_input("repo", format!("{s} is not an owner/name reference"))
        })?;
        if !is_github_name(owner) || !is_github_name(name) {
            return Err(AgentPayError::invalid_input(
                "repo",
                format!("{s} violates the repository naming rule"),
            ));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl TryFrom<String> for RepoRef {
    type Error = AgentPayError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<RepoRef> for String {
    fn from(r: RepoRef) -> Self {
        r.to_string()
    }
}

/// Who a tip pays out to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TipRecipient {
    /// A GitHub username
    GitHub(String),
    /// A 40-hex-character address prefixed `0x`
    Address(String),
}

impl TipRecipient {
    /// Parse a recipient: a GitHub username or an `0x` address
    pub fn parse(s: &str) -> Result<Self> {
        if is_eth_address(s) {
            return Ok(Self::Address(s.to_string()));
        }
        if is_github_name(s) {
            return Ok(Self::GitHub(s.to_string()));
        }
        Err(AgentPayError::invalid_input(
            "recipient",
            format!("{s} is neither a GitHub username nor a 0x address"),
        ))
    }
}

impl fmt::Display for TipRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitHub(name) => f.write_str(name),
            Self::Address(addr) => f.write_str(addr),
        }
    }
}

impl TryFrom<String> for TipRecipient {
    type Error = AgentPayError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<TipRecipient> for String {
    fn from(r: TipRecipient) -> Self {
        r.to_string()
    }
}

/// State of a tip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipState {
    Pending,
    EscrowCreated,
    Funded,
    Locked,
    Released,
    Cancelled,
}

impl TipState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Cancelled)
    }

    /// Cancellation is allowed from any pre-released state
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::EscrowCreated => "escrow_created",
            Self::Funded => "funded",
            Self::Locked => "locked",
            Self::Released => "released",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-chain settlement record for a released tip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSettlement {
    pub tx_hash: String,
    pub block_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<u64>,
    pub settled_at: DateTime<Utc>,
}

/// Instants of each tip transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipTimeline {
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl TipTimeline {
    pub fn starting(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            escrow_created_at: None,
            funded_at: None,
            locked_at: None,
            released_at: None,
            cancelled_at: None,
        }
    }
}

/// A repository-attributed tip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tip {
    /// Unique tip ID
    pub id: TipId,
    /// Repository the tip is attributed to
    pub repo: RepoRef,
    /// Who is tipping
    pub tipper: String,
    /// Who gets paid
    pub recipient: TipRecipient,
    /// Amount in the token's display unit
    pub amount: Decimal,
    /// Settlement token
    pub token: Token,
    /// Optional message to the recipient
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional issue the tip relates to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
    /// Optional commit the tip relates to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
    /// Escrow carrying the settlement, once created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_id: Option<EscrowId>,
    /// External hash reported when the escrow was funded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub funding_hash: Option<String>,
    /// Settlement record, once released
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement: Option<TipSettlement>,
    /// Reason recorded at cancellation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Current state
    pub state: TipState,
    /// Transition instants
    pub timeline: TipTimeline,
}

/// Parameters for creating a tip; strings are validated by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTip {
    pub repo: String,
    pub tipper: String,
    pub recipient: String,
    pub amount: Decimal,
    pub token: Token,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_ref: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse() {
        let repo = RepoRef::parse("octo-org/a-repo").unwrap();
        assert_eq!(repo.owner, "octo-org");
        assert_eq!(repo.name, "a-repo");
        assert_eq!(repo.to_string(), "octo-org/a-repo");

        assert!(RepoRef::parse("no-slash").is_err());
        assert!(RepoRef::parse("-bad/name").is_err());
        assert!(RepoRef::parse("owner/name-").is_err());
        assert!(RepoRef::parse("owner/na me").is_err());
    }

    #[test]
    fn test_segment_length_boundary() {
        let exactly = "a".repeat(MAX_SEGMENT_LEN);
        let over = "a".repeat(MAX_SEGMENT_LEN + 1);
        assert!(RepoRef::parse(&format!("{exactly}/{exactly}")).is_ok());
        assert!(RepoRef::parse(&format!("{over}/repo")).is_err());
        assert!(RepoRef::parse(&format!("owner/{over}")).is_err());
    }

    #[test]
    fn test_recipient_parse() {
        assert!(matches!(
            TipRecipient::parse("octocat").unwrap(),
            TipRecipient::GitHub(_)
        ));
        let addr = format!("0x{}", "ab12".repeat(10));
        assert!(matches!(
            TipRecipient::parse(&addr).unwrap(),
            TipRecipient::Address(_)
        ));
        assert!(TipRecipient::parse("0x1234").is_err());
        assert!(TipRecipient::parse(&"a".repeat(40)).is_err());
    }

    #[test]
    fn test_tip_state_cancellable() {
        assert!(TipState::Pending.is_cancellable());
        assert!(TipState::Locked.is_cancellable());
        assert!(!TipState::Released.is_cancellable());
        assert!(!TipState::Cancelled.is_cancellable());
    }
}
