//! Per-operation status codes.
//!
//! Every item in a batched service call ends with exactly one of these codes.
//! The numeric values follow the protocol's registered status code table so
//! the session layer can encode them without a lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! status_codes {
    ($( $(#[$meta:meta])* $name:ident = $code:literal ),+ $(,)?) => {
        /// Outcome of a single operation item.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum StatusCode {
            $( $(#[$meta])* $name, )+
        }

        impl StatusCode {
            /// The registered 32-bit code.
            #[must_use]
            pub const fn code(self) -> u32 {
                match self {
                    $( Self::$name => $code, )+
                }
            }

            /// The symbolic name, e.g. `BadNodeIdUnknown`.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )+
                }
            }

            /// Looks up a status code by its registered value.
            #[must_use]
            pub fn from_code(code: u32) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$name), )+
                    _ => None,
                }
            }
        }
    };
}

status_codes! {
    Good = 0x0000_0000,
    GoodNoData = 0x00A5_0000,
    UncertainReferenceOutOfServer = 0x406C_0000,
    BadUnexpectedError = 0x8001_0000,
    BadInternalError = 0x8002_0000,
    BadTimeout = 0x800A_0000,
    BadNothingToDo = 0x800F_0000,
    BadTooManyOperations = 0x8010_0000,
    BadUserAccessDenied = 0x801F_0000,
    BadSessionIdInvalid = 0x8025_0000,
    BadRequestCancelledByClient = 0x802C_0000,
    BadWaitingForInitialData = 0x8032_0000,
    BadNodeIdInvalid = 0x8033_0000,
    BadNodeIdUnknown = 0x8034_0000,
    BadAttributeIdInvalid = 0x8035_0000,
    BadIndexRangeInvalid = 0x8036_0000,
    BadIndexRangeNoData = 0x8037_0000,
    BadDataEncodingInvalid = 0x8038_0000,
    BadNotReadable = 0x803A_0000,
    BadNotWritable = 0x803B_0000,
    BadNotSupported = 0x803D_0000,
    BadNotFound = 0x803E_0000,
    BadMonitoringModeInvalid = 0x8041_0000,
    BadMonitoredItemIdInvalid = 0x8042_0000,
    BadMonitoredItemFilterInvalid = 0x8043_0000,
    BadMonitoredItemFilterUnsupported = 0x8044_0000,
    BadFilterNotAllowed = 0x8045_0000,
    BadEventFilterInvalid = 0x8047_0000,
    BadContentFilterInvalid = 0x8048_0000,
    BadFilterOperandInvalid = 0x8049_0000,
    BadContinuationPointInvalid = 0x804A_0000,
    BadNoContinuationPoints = 0x804B_0000,
    BadReferenceTypeIdInvalid = 0x804C_0000,
    BadBrowseDirectionInvalid = 0x804D_0000,
    BadNodeIdExists = 0x805E_0000,
    BadNodeClassInvalid = 0x805F_0000,
    BadBrowseNameInvalid = 0x8060_0000,
    BadViewIdUnknown = 0x806B_0000,
    BadNoMatch = 0x806F_0000,
    BadHistoryOperationInvalid = 0x8071_0000,
    BadHistoryOperationUnsupported = 0x8072_0000,
    BadWriteNotSupported = 0x8073_0000,
    BadTypeMismatch = 0x8074_0000,
    BadMethodInvalid = 0x8075_0000,
    BadArgumentsMissing = 0x8076_0000,
    BadEntryExists = 0x809F_0000,
    BadNoEntryExists = 0x80A0_0000,
    BadInvalidArgument = 0x80AB_0000,
    BadTooManyArguments = 0x80E5_0000,
    BadTypeDefinitionInvalid = 0x80ED_0000,
    BadSecurityModeInsufficient = 0x80E6_0000,
    BadNotExecutable = 0x8111_0000,
}

impl StatusCode {
    /// Severity bits are `00`.
    #[must_use]
    pub const fn is_good(self) -> bool {
        self.code() & 0xC000_0000 == 0
    }

    /// Severity bits are `01`.
    #[must_use]
    pub const fn is_uncertain(self) -> bool {
        self.code() & 0xC000_0000 == 0x4000_0000
    }

    /// Severity bits are `10`.
    #[must_use]
    pub const fn is_bad(self) -> bool {
        self.code() & 0x8000_0000 != 0
    }

    /// True for the codes that mean "exists but forbidden" rather than
    /// "does not exist".
    #[must_use]
    pub const fn is_permission_error(self) -> bool {
        matches!(
            self,
            Self::BadUserAccessDenied | Self::BadSecurityModeInsufficient
        )
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::Good
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.code())
    }
}
