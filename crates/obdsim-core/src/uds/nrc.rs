//! UDS Negative Response Codes (NRC)

use std::fmt;

/// The NRC set this simulator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NegativeResponseCode {
    ServiceNotSupported = 0x11,
    SubFunctionNotSupported = 0x12,
    IncorrectMessageLengthOrFormat = 0x13,
    BusyRepeatRequest = 0x21,
    ConditionsNotCorrect = 0x22,
    RequestSequenceError = 0x24,
    RequestOutOfRange = 0x31,
    SecurityAccessDenied = 0x33,
    InvalidKey = 0x35,
    ExceededNumberOfAttempts = 0x36,
    SubFunctionNotSupportedInActiveSession = 0x7E,
    ServiceNotSupportedInActiveSession = 0x7F,
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        nrc as u8
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServiceNotSupported => "ServiceNotSupported",
            Self::SubFunctionNotSupported => "SubFunctionNotSupported",
            Self::IncorrectMessageLengthOrFormat => "IncorrectMessageLengthOrFormat",
            Self::BusyRepeatRequest => "BusyRepeatRequest",
            Self::ConditionsNotCorrect => "ConditionsNotCorrect",
            Self::RequestSequenceError => "RequestSequenceError",
            Self::RequestOutOfRange => "RequestOutOfRange",
            Self::SecurityAccessDenied => "SecurityAccessDenied",
            Self::InvalidKey => "InvalidKey",
            Self::ExceededNumberOfAttempts => "ExceededNumberOfAttempts",
            Self::SubFunctionNotSupportedInActiveSession => {
                "SubFunctionNotSupportedInActiveSession"
            }
            Self::ServiceNotSupportedInActiveSession => "ServiceNotSupportedInActiveSession",
        };
        write!(f, "{name} ({:#04X})", *self as u8)
    }
}
