//! Request, command and response types exchanged through the relay.
//!
//! A client sends a [`Request`] naming its targets. The relay delivers one
//! [`Command`] per target, stamped with the sender's friend code, and answers
//! the sender with a [`Response`] whose results map holds one [`ResultCode`]
//! per target actually attempted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::codes::ResultCode;
use super::permissions::SpeakPermissions;

/// RPC method identifiers, one per action family plus the relay's own
/// query and notification methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Emote,
    Speak,
    Transform,
    Twinning,
    BodySwap,
    /// Relay-initiated query for a participant's current body, used by body swaps.
    BodySwapQuery,
    Hypnosis,
    HypnosisStop,
    Moodles,
    CustomizePlus,
    Honorific,
    PossessionBegin,
    PossessionCamera,
    PossessionMovement,
    PossessionEnd,
    SyncOnlineStatus,
    SyncPermissions,
}

impl Method {
    pub fn id(self) -> &'static str {
        match self {
            Method::Emote => "Emote",
            Method::Speak => "Speak",
            Method::Transform => "Transform",
            Method::Twinning => "Twinning",
            Method::BodySwap => "BodySwap",
            Method::BodySwapQuery => "BodySwap.Query",
            Method::Hypnosis => "Hypnosis",
            Method::HypnosisStop => "HypnosisStop",
            Method::Moodles => "Moodles",
            Method::CustomizePlus => "CustomizePlus",
            Method::Honorific => "Honorific",
            Method::PossessionBegin => "Possession.Begin",
            Method::PossessionCamera => "Possession.Camera",
            Method::PossessionMovement => "Possession.Movement",
            Method::PossessionEnd => "Possession.End",
            Method::SyncOnlineStatus => "Sync.OnlineStatus",
            Method::SyncPermissions => "Sync.Permissions",
        }
    }

    pub fn is_possession_stream(self) -> bool {
        matches!(self, Method::PossessionCamera | Method::PossessionMovement)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Chat channel a speak command is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatChannel {
    Roleplay,
    Say,
    Yell,
    Shout,
    Tell,
    Party,
    Alliance,
    FreeCompany,
    PvPTeam,
    Echo,
    /// 1-based linkshell index carried in [`SpeakPayload::extra`].
    Linkshell,
    /// 1-based cross-world linkshell index carried in [`SpeakPayload::extra`].
    CrossWorldLinkshell,
}

impl ChatChannel {
    /// Speak flag a channel needs. Linkshell channels need a valid index.
    pub fn required_flag(self, extra: Option<&str>) -> Option<SpeakPermissions> {
        let index = || extra.and_then(|e| e.trim().parse::<u8>().ok());
        match self {
            ChatChannel::Roleplay => Some(SpeakPermissions::ROLEPLAY),
            ChatChannel::Say => Some(SpeakPermissions::SAY),
            ChatChannel::Yell => Some(SpeakPermissions::YELL),
            ChatChannel::Shout => Some(SpeakPermissions::SHOUT),
            ChatChannel::Tell => Some(SpeakPermissions::TELL),
            ChatChannel::Party => Some(SpeakPermissions::PARTY),
            ChatChannel::Alliance => Some(SpeakPermissions::ALLIANCE),
            ChatChannel::FreeCompany => Some(SpeakPermissions::FREE_COMPANY),
            ChatChannel::PvPTeam => Some(SpeakPermissions::PVP_TEAM),
            ChatChannel::Echo => Some(SpeakPermissions::ECHO),
            ChatChannel::Linkshell => index().and_then(SpeakPermissions::linkshell),
            ChatChannel::CrossWorldLinkshell => index().and_then(SpeakPermissions::cross_world_linkshell),
        }
    }
}

/// Which parts of an appearance a transform applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyFlags {
    #[serde(default)]
    pub customization: bool,
    #[serde(default)]
    pub equipment: bool,
}

/// Which character attributes a twinning or body swap carries over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SwapAttributes {
    #[serde(default)]
    pub customization: bool,
    #[serde(default)]
    pub equipment: bool,
    #[serde(default)]
    pub mods: bool,
    #[serde(default)]
    pub moodles: bool,
    #[serde(default)]
    pub customize_plus: bool,
    #[serde(default)]
    pub honorific: bool,
}

impl SwapAttributes {
    pub fn is_empty(&self) -> bool {
        !(self.customization
            || self.equipment
            || self.mods
            || self.moodles
            || self.customize_plus
            || self.honorific)
    }
}

/// A character's name, world and serialized appearance, as reported by the
/// client that currently renders it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharacterIdentity {
    pub character_name: String,
    pub character_world: String,
    /// Opaque appearance blob produced by the client.
    #[serde(default)]
    pub appearance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotePayload {
    pub emote: String,
    #[serde(default)]
    pub display_log_message: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakPayload {
    pub message: String,
    pub channel: ChatChannel,
    /// Linkshell index or tell recipient, depending on the channel.
    #[serde(default)]
    pub extra: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPayload {
    pub appearance: String,
    pub apply: ApplyFlags,
    /// Present when the transformation should persist until unlocked.
    #[serde(default)]
    pub lock_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinningPayload {
    pub identity: CharacterIdentity,
    pub attributes: SwapAttributes,
    #[serde(default)]
    pub lock_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodySwapPayload {
    pub attributes: SwapAttributes,
    /// The sender's own identity when the sender joins the swap.
    #[serde(default)]
    pub sender_identity: Option<CharacterIdentity>,
    #[serde(default)]
    pub lock_code: Option<String>,
}

/// Body assigned to one participant by a body swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodySwapAssignment {
    pub identity: CharacterIdentity,
    pub attributes: SwapAttributes,
    #[serde(default)]
    pub lock_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypnosisPayload {
    #[serde(default)]
    pub text: Vec<String>,
    pub speed: u8,
    pub duration_secs: u32,
    #[serde(default)]
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PossessionBeginPayload {
    pub character_name: String,
    pub character_world: String,
}

/// Absolute camera state. Each packet replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPayload {
    pub horizontal: f32,
    pub vertical: f32,
    pub zoom: f32,
}

/// Absolute movement input. Each packet replaces the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovementPayload {
    pub direction: f32,
    pub turn: f32,
    pub backward: f32,
    pub left: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineStatusPayload {
    pub online: bool,
    /// What the notified friend may now do to the sender, when online.
    #[serde(default)]
    pub permissions: Option<super::permissions::PermissionEdge>,
}

/// Payload of a request or command. The variant selects the method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum ActionPayload {
    Emote(EmotePayload),
    Speak(SpeakPayload),
    Transform(TransformPayload),
    Twinning(TwinningPayload),
    BodySwap(BodySwapPayload),
    BodySwapQuery,
    BodySwapAssignment(BodySwapAssignment),
    Hypnosis(HypnosisPayload),
    HypnosisStop,
    Moodles { data: String },
    CustomizePlus { data: String },
    Honorific { data: String },
    PossessionBegin(PossessionBeginPayload),
    PossessionCamera(CameraPayload),
    PossessionMovement(MovementPayload),
    PossessionEnd,
    OnlineStatus(OnlineStatusPayload),
    Permissions(super::permissions::PermissionEdge),
}

impl ActionPayload {
    pub fn method(&self) -> Method {
        match self {
            ActionPayload::Emote(_) => Method::Emote,
            ActionPayload::Speak(_) => Method::Speak,
            ActionPayload::Transform(_) => Method::Transform,
            ActionPayload::Twinning(_) => Method::Twinning,
            ActionPayload::BodySwap(_) | ActionPayload::BodySwapAssignment(_) => Method::BodySwap,
            ActionPayload::BodySwapQuery => Method::BodySwapQuery,
            ActionPayload::Hypnosis(_) => Method::Hypnosis,
            ActionPayload::HypnosisStop => Method::HypnosisStop,
            ActionPayload::Moodles { .. } => Method::Moodles,
            ActionPayload::CustomizePlus { .. } => Method::CustomizePlus,
            ActionPayload::Honorific { .. } => Method::Honorific,
            ActionPayload::PossessionBegin(_) => Method::PossessionBegin,
            ActionPayload::PossessionCamera(_) => Method::PossessionCamera,
            ActionPayload::PossessionMovement(_) => Method::PossessionMovement,
            ActionPayload::PossessionEnd => Method::PossessionEnd,
            ActionPayload::OnlineStatus(_) => Method::SyncOnlineStatus,
            ActionPayload::Permissions(_) => Method::SyncPermissions,
        }
    }
}

/// Inbound request from a sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub target_friend_codes: Vec<String>,
    pub payload: ActionPayload,
}

impl Request {
    pub fn new(targets: &[&str], payload: ActionPayload) -> Self {
        Self {
            target_friend_codes: targets.iter().map(|t| t.to_string()).collect(),
            payload,
        }
    }
}

/// What a target receives: the original sender plus the action payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub sender_friend_code: String,
    pub payload: ActionPayload,
}

/// Typed data a target may attach to its reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyPayload {
    Identity(CharacterIdentity),
}

/// A target's reply to a forwarded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub result: ResultCode,
    #[serde(default)]
    pub payload: Option<ReplyPayload>,
}

impl ActionResult {
    pub fn success() -> Self {
        Self {
            result: ResultCode::Success,
            payload: None,
        }
    }

    pub fn with_code(result: ResultCode) -> Self {
        Self { result, payload: None }
    }

    pub fn identity(identity: CharacterIdentity) -> Self {
        Self {
            result: ResultCode::Success,
            payload: Some(ReplyPayload::Identity(identity)),
        }
    }
}

/// Optional data returned to the sender alongside the results map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// The identity assigned to the sender by a body swap it took part in.
    AssignedIdentity(CharacterIdentity),
}

/// Answer returned to the sender of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub response_code: ResultCode,
    pub results: HashMap<String, ResultCode>,
    #[serde(default)]
    pub payload: Option<ResponsePayload>,
}

impl Response {
    /// A request rejected before any per-target work.
    pub fn rejected(code: ResultCode) -> Self {
        Self {
            response_code: code,
            results: HashMap::new(),
            payload: None,
        }
    }

    /// A request that was accepted and processed.
    pub fn processed(results: HashMap<String, ResultCode>) -> Self {
        Self {
            response_code: ResultCode::Success,
            results,
            payload: None,
        }
    }

    pub fn result_for(&self, friend_code: &str) -> Option<ResultCode> {
        self.results.get(friend_code).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linkshell_channel_needs_index() {
        assert_eq!(
            ChatChannel::Linkshell.required_flag(Some("4")),
            Some(SpeakPermissions::LS4)
        );
        assert_eq!(ChatChannel::Linkshell.required_flag(None), None);
        assert_eq!(ChatChannel::CrossWorldLinkshell.required_flag(Some("12")), None);
        assert_eq!(ChatChannel::Say.required_flag(None), Some(SpeakPermissions::SAY));
    }

    #[test]
    fn payload_selects_method() {
        let p = ActionPayload::Emote(EmotePayload {
            emote: "wave".into(),
            display_log_message: false,
        });
        assert_eq!(p.method(), Method::Emote);
        assert_eq!(ActionPayload::PossessionEnd.method().id(), "Possession.End");
        assert!(Method::PossessionMovement.is_possession_stream());
        assert!(!Method::PossessionBegin.is_possession_stream());
    }

    #[test]
    fn request_json_shape() {
        let req = Request::new(
            &["FC-1"],
            ActionPayload::Speak(SpeakPayload {
                message: "hi".into(),
                channel: ChatChannel::Say,
                extra: None,
            }),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["target_friend_codes"][0], "FC-1");
        assert_eq!(json["payload"]["kind"], "Speak");
        assert_eq!(json["payload"]["data"]["channel"], "Say");
    }
}
