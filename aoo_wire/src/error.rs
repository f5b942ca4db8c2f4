//! Protocol-wide error kinds.
//!
//! Errors are carried as values: per-request failures travel through
//! reply callbacks as `(kind, system code, message)` triples, and the
//! numeric codes are part of the wire contract (they appear in error
//! replies).

use crate::WireError;

/// Every failure kind the protocol distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum AooError {
    #[error("bad argument")]
    BadArgument = 1,
    #[error("malformed packet")]
    BadFormat,
    #[error("socket error")]
    Socket,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("request already in progress")]
    RequestInProgress,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("insufficient buffer")]
    InsufficientBuffer,
    #[error("not permitted")]
    NotPermitted,
    #[error("wrong password")]
    WrongPassword,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("group does not exist")]
    GroupDoesNotExist,
    #[error("not a group member")]
    NotGroupMember,
    #[error("already a group member")]
    AlreadyGroupMember,
    #[error("cannot create group")]
    CannotCreateGroup,
    #[error("cannot create user")]
    CannotCreateUser,
    #[error("UDP handshake timed out")]
    UdpHandshakeTimeOut,
    #[error("request not handled")]
    UnhandledRequest,
    #[error("not implemented")]
    NotImplemented,
    #[error("operation would block")]
    WouldBlock,
}

impl From<WireError> for AooError {
    #[inline]
    fn from(e: WireError) -> Self {
        match e {
            WireError::BadFormat => Self::BadFormat,
            WireError::Overflow => Self::InsufficientBuffer,
        }
    }
}

impl AooError {
    /// Numeric code as carried in error replies.
    #[inline(always)]
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        use AooError::*;
        Some(match code {
            1 => BadArgument,
            2 => BadFormat,
            3 => Socket,
            4 => OutOfMemory,
            5 => NotConnected,
            6 => AlreadyConnected,
            7 => RequestInProgress,
            8 => NotFound,
            9 => AlreadyExists,
            10 => InsufficientBuffer,
            11 => NotPermitted,
            12 => WrongPassword,
            13 => UserAlreadyExists,
            14 => GroupDoesNotExist,
            15 => NotGroupMember,
            16 => AlreadyGroupMember,
            17 => CannotCreateGroup,
            18 => CannotCreateUser,
            19 => UdpHandshakeTimeOut,
            20 => UnhandledRequest,
            21 => NotImplemented,
            22 => WouldBlock,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=22 {
            let e = AooError::from_code(code).unwrap();
            assert_eq!(e.code(), code);
        }
        assert_eq!(AooError::from_code(0), None);
        assert_eq!(AooError::from_code(23), None);
    }
}
