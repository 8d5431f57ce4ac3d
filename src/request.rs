use crate::iostate::IosId;
use crate::proto::Message;

/// Remote-I/O operations, plus the internal ops the dispatcher schedules for
/// itself. Internal ops never appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    Status = 0,
    Open = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    Connect = 5,
    Bind = 6,
    Listen = 7,
    Ioctl = 8,
    GetAddrInfo = 9,
    GetSockName = 10,
    GetPeerName = 11,
    GetSockOpt = 12,
    SetSockOpt = 13,
    HalfClose = 14,
    SigConnR = 15,
    SigConnW = 16,
}

impl OpCode {
    pub fn from_u32(op: u32) -> Option<OpCode> {
        Some(match op {
            0 => OpCode::Status,
            1 => OpCode::Open,
            2 => OpCode::Close,
            3 => OpCode::Read,
            4 => OpCode::Write,
            5 => OpCode::Connect,
            6 => OpCode::Bind,
            7 => OpCode::Listen,
            8 => OpCode::Ioctl,
            9 => OpCode::GetAddrInfo,
            10 => OpCode::GetSockName,
            11 => OpCode::GetPeerName,
            12 => OpCode::GetSockOpt,
            13 => OpCode::SetSockOpt,
            14 => OpCode::HalfClose,
            15 => OpCode::SigConnR,
            16 => OpCode::SigConnW,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Ops the dispatcher schedules internally; rejected if seen on the wire.
    pub fn is_internal(self) -> bool {
        matches!(self, OpCode::HalfClose | OpCode::SigConnR | OpCode::SigConnW)
    }

    /// Whether a completed handler replies with a STATUS message. OPEN
    /// replies out of band on the handle it carries; the transfer and
    /// teardown ops never reply at all.
    pub(crate) fn replies(self) -> bool {
        !matches!(
            self,
            OpCode::Status
                | OpCode::Open
                | OpCode::Read
                | OpCode::Write
                | OpCode::Close
                | OpCode::HalfClose
                | OpCode::SigConnR
                | OpCode::SigConnW
        )
    }
}

/// A work item: an operation bound to its message and iostate, parkable on a
/// wait queue while the operation is pending on readiness. Holds one iostate
/// reference for its whole lifetime.
pub(crate) struct Request {
    pub op: OpCode,
    pub msg: Option<Message>,
    pub ios: Option<IosId>,
}

impl Request {
    pub(crate) fn wire(op: OpCode, msg: Message, ios: Option<IosId>) -> Request {
        Request {
            op,
            msg: Some(msg),
            ios,
        }
    }

    pub(crate) fn internal(op: OpCode, ios: IosId) -> Request {
        Request {
            op,
            msg: None,
            ios: Some(ios),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_round_trip() {
        for raw in 0..=16u32 {
            let op = OpCode::from_u32(raw).unwrap();
            assert_eq!(op.raw(), raw);
        }
        assert_eq!(OpCode::from_u32(17), None);
    }

    #[test]
    fn reply_discipline() {
        assert!(OpCode::Connect.replies());
        assert!(OpCode::GetSockOpt.replies());
        assert!(!OpCode::Open.replies());
        assert!(!OpCode::Read.replies());
        assert!(!OpCode::Write.replies());
        assert!(!OpCode::Close.replies());
        assert!(!OpCode::SigConnR.replies());
    }
}
