//! Ledger Entry States
//!
//! ```text
//! (none) ──▶ PENDING ──┬──▶ DONE
//!    │       WAIT_USER ─┤
//!    │                  └──▶ CANCELED
//!    └──────────────────────▶ DONE        (immediate transfers)
//! ```
//!
//! State IDs are stored in PostgreSQL as SMALLINT.
//! Terminal states: DONE (40), CANCELED (-10)

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum XferStatus {
    /// Funds reserved, awaiting confirmation by the caller or a peer
    Pending = 10,

    /// Funds reserved, awaiting confirmation by the account holder
    WaitUser = 20,

    /// Terminal: value moved
    Done = 40,

    /// Terminal: reservation released
    Canceled = -10,
}

impl XferStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, XferStatus::Done | XferStatus::Canceled)
    }

    /// Funds are held in `reserved` on the source account
    #[inline]
    pub fn is_reserved(&self) -> bool {
        matches!(self, XferStatus::Pending | XferStatus::WaitUser)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            10 => Some(XferStatus::Pending),
            20 => Some(XferStatus::WaitUser),
            40 => Some(XferStatus::Done),
            -10 => Some(XferStatus::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            XferStatus::Pending => "PENDING",
            XferStatus::WaitUser => "WAIT_USER",
            XferStatus::Done => "DONE",
            XferStatus::Canceled => "CANCELED",
        }
    }

    /// Error for an attempted transition out of a terminal state
    pub fn terminal_error(&self) -> Option<super::XferError> {
        match self {
            XferStatus::Done => Some(super::XferError::AlreadyCompleted),
            XferStatus::Canceled => Some(super::XferError::AlreadyCanceled),
            _ => None,
        }
    }
}

impl fmt::Display for XferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for XferStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        XferStatus::from_id(value).ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xfer::XferError;

    #[test]
    fn test_terminal_states() {
        assert!(XferStatus::Done.is_terminal());
        assert!(XferStatus::Canceled.is_terminal());
        assert!(!XferStatus::Pending.is_terminal());
        assert!(!XferStatus::WaitUser.is_terminal());
    }

    #[test]
    fn test_terminal_errors() {
        assert_eq!(
            XferStatus::Done.terminal_error(),
            Some(XferError::AlreadyCompleted)
        );
        assert_eq!(
            XferStatus::Canceled.terminal_error(),
            Some(XferError::AlreadyCanceled)
        );
        assert_eq!(XferStatus::WaitUser.terminal_error(), None);
    }

    #[test]
    fn test_invalid_state_id() {
        assert!(XferStatus::from_id(0).is_none());
        assert_eq!(XferStatus::try_from(40), Ok(XferStatus::Done));
    }

    #[test]
    fn test_display() {
        assert_eq!(XferStatus::WaitUser.to_string(), "WAIT_USER");
        assert_eq!(XferStatus::Canceled.to_string(), "CANCELED");
    }
}
