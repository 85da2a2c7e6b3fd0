//! Response and per-target result codes shared by every relay operation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of outcomes the relay reports, both as the top-level response
/// code of a request and as the per-target entries of its results map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    TooManyRequests,
    TooManyTargets,
    BadDataInRequest,
    BadTargets,
    TargetOffline,
    TargetNotFriends,
    TargetLacksPermissions,
    Unknown,
    Timeout,
    IncludedSelfInBodySwap,
    TooFewTargets,
    SenderAlreadyInSession,
    TargetAlreadyInSession,
    SenderNotInSession,
    SenderNotGhost,
    PossessionDesynchronization,
    UnexpectedState,
}

impl ResultCode {
    pub const COUNT: usize = 18;

    pub const ALL: [ResultCode; Self::COUNT] = [
        ResultCode::Success,
        ResultCode::TooManyRequests,
        ResultCode::TooManyTargets,
        ResultCode::BadDataInRequest,
        ResultCode::BadTargets,
        ResultCode::TargetOffline,
        ResultCode::TargetNotFriends,
        ResultCode::TargetLacksPermissions,
        ResultCode::Unknown,
        ResultCode::Timeout,
        ResultCode::IncludedSelfInBodySwap,
        ResultCode::TooFewTargets,
        ResultCode::SenderAlreadyInSession,
        ResultCode::TargetAlreadyInSession,
        ResultCode::SenderNotInSession,
        ResultCode::SenderNotGhost,
        ResultCode::PossessionDesynchronization,
        ResultCode::UnexpectedState,
    ];

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Stable index used by the metrics counters.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::TooManyRequests => "too_many_requests",
            ResultCode::TooManyTargets => "too_many_targets",
            ResultCode::BadDataInRequest => "bad_data_in_request",
            ResultCode::BadTargets => "bad_targets",
            ResultCode::TargetOffline => "target_offline",
            ResultCode::TargetNotFriends => "target_not_friends",
            ResultCode::TargetLacksPermissions => "target_lacks_permissions",
            ResultCode::Unknown => "unknown",
            ResultCode::Timeout => "timeout",
            ResultCode::IncludedSelfInBodySwap => "included_self_in_body_swap",
            ResultCode::TooFewTargets => "too_few_targets",
            ResultCode::SenderAlreadyInSession => "sender_already_in_session",
            ResultCode::TargetAlreadyInSession => "target_already_in_session",
            ResultCode::SenderNotInSession => "sender_not_in_session",
            ResultCode::SenderNotGhost => "sender_not_ghost",
            ResultCode::PossessionDesynchronization => "possession_desynchronization",
            ResultCode::UnexpectedState => "unexpected_state",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
