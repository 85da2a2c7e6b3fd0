//! Request validation: friend codes, target lists and action payloads.
//!
//! Everything here runs synchronously before the relay touches the network,
//! so a rejected request has no partial effects.

use std::collections::HashSet;

use crate::relay::codes::ResultCode;
use crate::relay::protocol::{
    ActionPayload, CameraPayload, ChatChannel, HypnosisPayload, MovementPayload, SpeakPayload,
};

pub const MAX_FRIEND_CODE_LEN: usize = 64;
pub const MAX_EMOTE_LEN: usize = 64;
pub const MAX_SPEAK_LEN: usize = 500;
pub const MAX_HYPNOSIS_LINES: usize = 20;
pub const MAX_HYPNOSIS_LINE_LEN: usize = 100;
pub const MAX_HYPNOSIS_SPEED: u8 = 100;
pub const MAX_HYPNOSIS_DURATION_SECS: u32 = 3600;
pub const MAX_OPAQUE_DATA_LEN: usize = 64 * 1024;

/// Validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("friend code is empty")]
    EmptyFriendCode,

    #[error("friend code is too long (maximum {max} characters)")]
    FriendCodeTooLong { max: usize },

    #[error("friend code contains whitespace or control characters")]
    FriendCodeInvalidCharacters,

    #[error("no targets given")]
    NoTargets,

    #[error("target list contains {0} more than once")]
    DuplicateTarget(String),

    #[error("sender listed itself as a target")]
    SelfTarget,

    #[error("sender listed itself in a body swap")]
    SelfInBodySwap,

    #[error("too many targets ({count}, maximum {max})")]
    TooManyTargets { count: usize, max: usize },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid payload: {0}")]
    BadData(String),
}

impl ValidationError {
    /// Result code reported to the sender for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            ValidationError::TooManyTargets { .. } => ResultCode::TooManyTargets,
            ValidationError::SelfInBodySwap => ResultCode::IncludedSelfInBodySwap,
            ValidationError::BadData(_) => ResultCode::BadDataInRequest,
            ValidationError::EmptyFriendCode
            | ValidationError::FriendCodeTooLong { .. }
            | ValidationError::FriendCodeInvalidCharacters
            | ValidationError::NoTargets
            | ValidationError::DuplicateTarget(_)
            | ValidationError::SelfTarget
            | ValidationError::InvalidTarget(_) => ResultCode::BadTargets,
        }
    }
}

/// Validate the shape of a friend code.
pub fn validate_friend_code(code: &str) -> Result<(), ValidationError> {
    if code.is_empty() {
        return Err(ValidationError::EmptyFriendCode);
    }
    if code.chars().count() > MAX_FRIEND_CODE_LEN {
        return Err(ValidationError::FriendCodeTooLong {
            max: MAX_FRIEND_CODE_LEN,
        });
    }
    if code.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::FriendCodeInvalidCharacters);
    }
    Ok(())
}

/// How the sender's own friend code is treated when it shows up in a target list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfTargetPolicy {
    Reject,
    RejectAsBodySwap,
}

/// Validate a target list against the sender and the configured cap.
pub fn validate_targets(
    sender: &str,
    targets: &[String],
    max_targets: usize,
    policy: SelfTargetPolicy,
) -> Result<(), ValidationError> {
    if targets.is_empty() {
        return Err(ValidationError::NoTargets);
    }
    if targets.len() > max_targets {
        return Err(ValidationError::TooManyTargets {
            count: targets.len(),
            max: max_targets,
        });
    }
    let mut seen = HashSet::with_capacity(targets.len());
    for target in targets {
        validate_friend_code(target).map_err(|e| ValidationError::InvalidTarget(e.to_string()))?;
        if target == sender {
            return Err(match policy {
                SelfTargetPolicy::Reject => ValidationError::SelfTarget,
                SelfTargetPolicy::RejectAsBodySwap => ValidationError::SelfInBodySwap,
            });
        }
        if !seen.insert(target.as_str()) {
            return Err(ValidationError::DuplicateTarget(target.clone()));
        }
    }
    Ok(())
}

fn bad(msg: impl Into<String>) -> ValidationError {
    ValidationError::BadData(msg.into())
}

fn validate_opaque(name: &str, data: &str) -> Result<(), ValidationError> {
    if data.is_empty() {
        return Err(bad(format!("{name} data is empty")));
    }
    if data.len() > MAX_OPAQUE_DATA_LEN {
        return Err(bad(format!("{name} data exceeds {MAX_OPAQUE_DATA_LEN} bytes")));
    }
    Ok(())
}

fn validate_speak(p: &SpeakPayload) -> Result<(), ValidationError> {
    if p.message.trim().is_empty() {
        return Err(bad("message is empty"));
    }
    if p.message.chars().count() > MAX_SPEAK_LEN {
        return Err(bad(format!("message exceeds {MAX_SPEAK_LEN} characters")));
    }
    if p.message.chars().any(|c| c.is_control()) {
        return Err(bad("message contains control characters"));
    }
    match p.channel {
        ChatChannel::Linkshell | ChatChannel::CrossWorldLinkshell => {
            if p.channel.required_flag(p.extra.as_deref()).is_none() {
                return Err(bad("linkshell index must be 1-8"));
            }
        }
        ChatChannel::Tell => {
            if p.extra.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(bad("tell needs a recipient"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_hypnosis(p: &HypnosisPayload) -> Result<(), ValidationError> {
    if p.text.len() > MAX_HYPNOSIS_LINES {
        return Err(bad(format!("more than {MAX_HYPNOSIS_LINES} spiral lines")));
    }
    if p.text.iter().any(|l| l.chars().count() > MAX_HYPNOSIS_LINE_LEN) {
        return Err(bad(format!("spiral line exceeds {MAX_HYPNOSIS_LINE_LEN} characters")));
    }
    if p.speed > MAX_HYPNOSIS_SPEED {
        return Err(bad(format!("speed above {MAX_HYPNOSIS_SPEED}")));
    }
    if p.duration_secs == 0 || p.duration_secs > MAX_HYPNOSIS_DURATION_SECS {
        return Err(bad(format!("duration must be 1-{MAX_HYPNOSIS_DURATION_SECS} seconds")));
    }
    Ok(())
}

fn validate_camera(p: &CameraPayload) -> Result<(), ValidationError> {
    if !(p.horizontal.is_finite() && p.vertical.is_finite() && p.zoom.is_finite()) {
        return Err(bad("camera values must be finite"));
    }
    if p.zoom < 0.0 {
        return Err(bad("camera zoom is negative"));
    }
    Ok(())
}

fn validate_movement(p: &MovementPayload) -> Result<(), ValidationError> {
    if [p.direction, p.turn, p.backward, p.left]
        .iter()
        .all(|v| v.is_finite())
    {
        Ok(())
    } else {
        Err(bad("movement values must be finite"))
    }
}

fn validate_lock_code(lock_code: Option<&str>) -> Result<(), ValidationError> {
    match lock_code {
        Some(code) if code.trim().is_empty() => Err(bad("lock code is empty")),
        _ => Ok(()),
    }
}

/// Validate an inbound action payload. Relay-originated payloads (queries,
/// assignments, sync notifications) are never accepted from clients.
pub fn validate_payload(payload: &ActionPayload) -> Result<(), ValidationError> {
    match payload {
        ActionPayload::Emote(p) => {
            let emote = p.emote.trim();
            if emote.is_empty() || emote.chars().count() > MAX_EMOTE_LEN {
                return Err(bad(format!("emote must be 1-{MAX_EMOTE_LEN} characters")));
            }
            if emote.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(bad("emote contains whitespace"));
            }
            Ok(())
        }
        ActionPayload::Speak(p) => validate_speak(p),
        ActionPayload::Transform(p) => {
            if !p.apply.customization && !p.apply.equipment {
                return Err(bad("transform applies nothing"));
            }
            validate_opaque("appearance", &p.appearance)?;
            validate_lock_code(p.lock_code.as_deref())
        }
        ActionPayload::Twinning(p) => {
            if p.attributes.is_empty() {
                return Err(bad("twinning swaps no attributes"));
            }
            if p.identity.character_name.trim().is_empty() {
                return Err(bad("twinning identity has no character name"));
            }
            validate_lock_code(p.lock_code.as_deref())
        }
        ActionPayload::BodySwap(p) => {
            if p.attributes.is_empty() {
                return Err(bad("body swap swaps no attributes"));
            }
            if let Some(identity) = &p.sender_identity {
                if identity.character_name.trim().is_empty() {
                    return Err(bad("sender identity has no character name"));
                }
            }
            validate_lock_code(p.lock_code.as_deref())
        }
        ActionPayload::Hypnosis(p) => validate_hypnosis(p),
        ActionPayload::HypnosisStop | ActionPayload::PossessionEnd => Ok(()),
        ActionPayload::Moodles { data } => validate_opaque("moodles", data),
        ActionPayload::CustomizePlus { data } => validate_opaque("customize+", data),
        ActionPayload::Honorific { data } => validate_opaque("honorific", data),
        ActionPayload::PossessionBegin(p) => {
            if p.character_name.trim().is_empty() || p.character_world.trim().is_empty() {
                return Err(bad("possession begin needs a character name and world"));
            }
            Ok(())
        }
        ActionPayload::PossessionCamera(p) => validate_camera(p),
        ActionPayload::PossessionMovement(p) => validate_movement(p),
        ActionPayload::BodySwapQuery
        | ActionPayload::BodySwapAssignment(_)
        | ActionPayload::OnlineStatus(_)
        | ActionPayload::Permissions(_) => Err(bad("relay-only payload")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{ApplyFlags, EmotePayload, TransformPayload};

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn friend_code_rules() {
        assert!(validate_friend_code("ABC-123").is_ok());
        assert_eq!(validate_friend_code(""), Err(ValidationError::EmptyFriendCode));
        assert_eq!(
            validate_friend_code("has space"),
            Err(ValidationError::FriendCodeInvalidCharacters)
        );
        let long = "x".repeat(MAX_FRIEND_CODE_LEN + 1);
        assert!(matches!(
            validate_friend_code(&long),
            Err(ValidationError::FriendCodeTooLong { .. })
        ));
    }

    #[test]
    fn target_list_rules_map_to_codes() {
        let cases = vec![
            (codes(&[]), ResultCode::BadTargets),
            (codes(&["A", "A"]), ResultCode::BadTargets),
            (codes(&["A", "S"]), ResultCode::BadTargets),
            (codes(&["A", ""]), ResultCode::BadTargets),
            (codes(&["A", "B", "C", "D"]), ResultCode::TooManyTargets),
        ];
        for (targets, expected) in cases {
            let err = validate_targets("S", &targets, 3, SelfTargetPolicy::Reject).unwrap_err();
            assert_eq!(err.code(), expected, "targets {:?}", targets);
        }
        assert!(validate_targets("S", &codes(&["A", "B"]), 3, SelfTargetPolicy::Reject).is_ok());
    }

    #[test]
    fn body_swap_self_target_has_its_own_code() {
        let err = validate_targets("S", &codes(&["A", "S"]), 5, SelfTargetPolicy::RejectAsBodySwap)
            .unwrap_err();
        assert_eq!(err.code(), ResultCode::IncludedSelfInBodySwap);
    }

    #[test]
    fn payload_rules() {
        let ok = ActionPayload::Emote(EmotePayload {
            emote: "dance".into(),
            display_log_message: true,
        });
        assert!(validate_payload(&ok).is_ok());

        let empty_emote = ActionPayload::Emote(EmotePayload {
            emote: "  ".into(),
            display_log_message: false,
        });
        assert_eq!(validate_payload(&empty_emote).unwrap_err().code(), ResultCode::BadDataInRequest);

        let nothing = ActionPayload::Transform(TransformPayload {
            appearance: "blob".into(),
            apply: ApplyFlags::default(),
            lock_code: None,
        });
        assert!(validate_payload(&nothing).is_err());

        let nan = ActionPayload::PossessionCamera(CameraPayload {
            horizontal: f32::NAN,
            vertical: 0.0,
            zoom: 1.0,
        });
        assert!(validate_payload(&nan).is_err());

        assert!(validate_payload(&ActionPayload::BodySwapQuery).is_err());
    }

    #[test]
    fn speak_channel_extras() {
        let speak = |channel, extra: Option<&str>| {
            ActionPayload::Speak(SpeakPayload {
                message: "hello".into(),
                channel,
                extra: extra.map(str::to_string),
            })
        };
        assert!(validate_payload(&speak(ChatChannel::Say, None)).is_ok());
        assert!(validate_payload(&speak(ChatChannel::Linkshell, Some("2"))).is_ok());
        assert!(validate_payload(&speak(ChatChannel::Linkshell, Some("0"))).is_err());
        assert!(validate_payload(&speak(ChatChannel::Tell, None)).is_err());
        assert!(validate_payload(&speak(ChatChannel::Tell, Some("Someone Else"))).is_ok());
    }
}
