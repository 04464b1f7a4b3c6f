use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Standard close codes exchanged during the close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum CloseStatus {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    NoStatusReceived,
    AbnormalClosure,
    InvalidFramePayloadData,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalServerErr,
    ServiceRestart,
    TryAgainLater,
    TlsHandshake,
}

impl CloseStatus {
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::NormalClosure => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::ProtocolError => 1002,
            CloseStatus::UnsupportedData => 1003,
            CloseStatus::NoStatusReceived => 1005,
            CloseStatus::AbnormalClosure => 1006,
            CloseStatus::InvalidFramePayloadData => 1007,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::MessageTooBig => 1009,
            CloseStatus::MandatoryExtension => 1010,
            CloseStatus::InternalServerErr => 1011,
            CloseStatus::ServiceRestart => 1012,
            CloseStatus::TryAgainLater => 1013,
            CloseStatus::TlsHandshake => 1015,
        }
    }

    /// Code put in an outgoing close frame. 1005, 1006 and 1015 are reserved
    /// for local reporting and go out as `GoingAway` instead.
    pub fn wire_code(self) -> u16 {
        match self {
            CloseStatus::NoStatusReceived
            | CloseStatus::AbnormalClosure
            | CloseStatus::TlsHandshake => CloseStatus::GoingAway.code(),
            other => other.code(),
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.code(), self)
    }
}

impl From<CloseStatus> for u16 {
    fn from(status: CloseStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for CloseStatus {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        let status = match code {
            1000 => CloseStatus::NormalClosure,
            1001 => CloseStatus::GoingAway,
            1002 => CloseStatus::ProtocolError,
            1003 => CloseStatus::UnsupportedData,
            1005 => CloseStatus::NoStatusReceived,
            1006 => CloseStatus::AbnormalClosure,
            1007 => CloseStatus::InvalidFramePayloadData,
            1008 => CloseStatus::PolicyViolation,
            1009 => CloseStatus::MessageTooBig,
            1010 => CloseStatus::MandatoryExtension,
            1011 => CloseStatus::InternalServerErr,
            1012 => CloseStatus::ServiceRestart,
            1013 => CloseStatus::TryAgainLater,
            1015 => CloseStatus::TlsHandshake,
            other => return Err(format!("unknown close code {}", other)),
        };
        Ok(status)
    }
}

impl TryFrom<CloseCode> for CloseStatus {
    type Error = String;

    fn try_from(code: CloseCode) -> Result<Self, Self::Error> {
        CloseStatus::try_from(u16::from(code))
    }
}

impl From<CloseStatus> for CloseCode {
    fn from(status: CloseStatus) -> Self {
        CloseCode::from(status.wire_code())
    }
}
