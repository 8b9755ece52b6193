//! Close-status codes and control-frame limits per RFC 6455.

use std::borrow::Cow;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::error::{Error, Result};

/// Maximum payload of a ping frame (control frames carry at most 125 bytes).
pub const MAX_PING_PAYLOAD: usize = 125;

/// Maximum close reason: 125 bytes minus the 2-byte status code.
pub const MAX_CLOSE_REASON: usize = 123;

/// 1000 Normal Closure.
pub const NORMAL: u16 = 1000;
/// 1001 Going Away.
pub const GOING_AWAY: u16 = 1001;
/// 1005 No Status Received. Never appears on the wire.
pub const NO_STATUS: u16 = 1005;
/// 1006 Abnormal Closure. Never appears on the wire.
pub const ABNORMAL: u16 = 1006;
/// 1010 Mandatory Extension. Client-only; invalid as a server stop code.
pub const MANDATORY_EXTENSION: u16 = 1010;

/// Reserved codes must not be transmitted in a close frame; closing with
/// one tears the connection down without the closing handshake.
pub fn is_reserved(code: u16) -> bool {
    matches!(code, NO_STATUS | ABNORMAL)
}

/// Validates a (code, reason) pair supplied to a stop operation.
pub fn check_close(code: u16, reason: &str) -> Result<()> {
    if code == MANDATORY_EXTENSION {
        return Err(Error::config(
            "1010 (mandatory extension) cannot be sent by a server",
        ));
    }
    if is_reserved(code) && !reason.is_empty() {
        return Err(Error::config(format!(
            "close code {} is reserved and takes no reason",
            code
        )));
    }
    check_reason(reason)
}

pub fn check_reason(reason: &str) -> Result<()> {
    if reason.len() > MAX_CLOSE_REASON {
        return Err(Error::config(format!(
            "close reason exceeds {} UTF-8 bytes",
            MAX_CLOSE_REASON
        )));
    }
    Ok(())
}

pub fn check_ping_payload(payload: &str) -> Result<()> {
    if payload.len() > MAX_PING_PAYLOAD {
        return Err(Error::config(format!(
            "ping payload exceeds {} UTF-8 bytes",
            MAX_PING_PAYLOAD
        )));
    }
    Ok(())
}

/// Builds the close frame for (code, reason), or `None` when the code is
/// reserved and the socket must be torn down frameless.
pub fn close_frame(code: u16, reason: &str) -> Option<CloseFrame<'static>> {
    if is_reserved(code) {
        return None;
    }
    Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.to_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes() {
        assert!(is_reserved(1005));
        assert!(is_reserved(1006));
        assert!(!is_reserved(1000));
        assert!(!is_reserved(1001));
        assert!(!is_reserved(3000));
    }

    #[test]
    fn mandatory_extension_rejected() {
        assert!(check_close(1010, "x").is_err());
        assert!(check_close(1010, "").is_err());
    }

    #[test]
    fn reserved_with_reason_rejected() {
        assert!(check_close(1005, "nonempty").is_err());
        assert!(check_close(1006, "nonempty").is_err());
        assert!(check_close(1005, "").is_ok());
        assert!(check_close(1006, "").is_ok());
    }

    #[test]
    fn reason_boundary() {
        let exact = "r".repeat(MAX_CLOSE_REASON);
        let over = "r".repeat(MAX_CLOSE_REASON + 1);
        assert!(check_close(1000, &exact).is_ok());
        assert!(check_close(1000, &over).is_err());
    }

    #[test]
    fn ping_boundary() {
        let exact = "p".repeat(MAX_PING_PAYLOAD);
        let over = "p".repeat(MAX_PING_PAYLOAD + 1);
        assert!(check_ping_payload(&exact).is_ok());
        assert!(check_ping_payload(&over).is_err());
    }

    #[test]
    fn reserved_close_has_no_frame() {
        assert!(close_frame(1005, "").is_none());
        assert!(close_frame(1006, "").is_none());
        let frame = close_frame(1001, "going away").unwrap();
        assert_eq!(u16::from(frame.code), 1001);
        assert_eq!(frame.reason, "going away");
    }
}
