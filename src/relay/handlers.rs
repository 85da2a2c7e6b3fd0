//! Per-method request handling.
//!
//! Every inbound request is validated first (payload shape, then the target
//! list) and only then routed: possession methods go to the session manager,
//! body swaps to the swap coordinator and everything else through the
//! standard forwarding path with the permissions its payload requires.

use log::{debug, trace};
use std::sync::Arc;

use super::body_swap::BodySwapCoordinator;
use super::codes::ResultCode;
use super::forward::ForwardedRequestManager;
use super::permissions::{ElevatedPermissions, PermissionSet, PrimaryPermissions, SpeakPermissions};
use super::possession::PossessionSessionManager;
use super::protocol::{ActionPayload, Request, Response, SwapAttributes};
use crate::logutil::{escape_log, redact_code};
use crate::metrics;
use crate::validation::{validate_payload, validate_targets, SelfTargetPolicy, ValidationError};

/// Primary flags a twinning or body swap needs for the attributes it carries.
pub fn attribute_permissions(attributes: &SwapAttributes) -> PrimaryPermissions {
    let mut flags = PrimaryPermissions::empty();
    if attributes.customization {
        flags |= PrimaryPermissions::CUSTOMIZATION;
    }
    if attributes.equipment {
        flags |= PrimaryPermissions::EQUIPMENT;
    }
    if attributes.mods {
        flags |= PrimaryPermissions::MODS;
    }
    if attributes.moodles {
        flags |= PrimaryPermissions::MOODLES;
    }
    if attributes.customize_plus {
        flags |= PrimaryPermissions::CUSTOMIZE_PLUS;
    }
    if attributes.honorific {
        flags |= PrimaryPermissions::HONORIFIC;
    }
    flags
}

fn lock_permissions(lock_code: &Option<String>) -> ElevatedPermissions {
    if lock_code.is_some() {
        ElevatedPermissions::PERMANENT_TRANSFORMATION
    } else {
        ElevatedPermissions::empty()
    }
}

/// Permissions a target must have granted the sender for `payload`.
///
/// Possession stream and end packets are gated by session membership
/// instead, and relay-originated payloads never come from clients; both
/// require nothing here.
pub fn required_permissions(payload: &ActionPayload) -> PermissionSet {
    match payload {
        ActionPayload::Emote(_) => PermissionSet::primary(PrimaryPermissions::EMOTE),
        ActionPayload::Speak(p) => PermissionSet::speak(
            p.channel
                .required_flag(p.extra.as_deref())
                .unwrap_or_else(SpeakPermissions::all),
        ),
        ActionPayload::Transform(p) => {
            let mut primary = PrimaryPermissions::empty();
            if p.apply.customization {
                primary |= PrimaryPermissions::CUSTOMIZATION;
            }
            if p.apply.equipment {
                primary |= PrimaryPermissions::EQUIPMENT;
            }
            PermissionSet {
                primary,
                elevated: lock_permissions(&p.lock_code),
                ..PermissionSet::default()
            }
        }
        ActionPayload::Twinning(p) => PermissionSet {
            primary: PrimaryPermissions::TWINNING | attribute_permissions(&p.attributes),
            elevated: lock_permissions(&p.lock_code),
            ..PermissionSet::default()
        },
        ActionPayload::BodySwap(p) => PermissionSet {
            primary: PrimaryPermissions::BODY_SWAP | attribute_permissions(&p.attributes),
            elevated: lock_permissions(&p.lock_code),
            ..PermissionSet::default()
        },
        ActionPayload::Hypnosis(_) | ActionPayload::HypnosisStop => {
            PermissionSet::primary(PrimaryPermissions::HYPNOSIS)
        }
        ActionPayload::Moodles { .. } => PermissionSet::primary(PrimaryPermissions::MOODLES),
        ActionPayload::CustomizePlus { .. } => {
            PermissionSet::primary(PrimaryPermissions::CUSTOMIZE_PLUS)
        }
        ActionPayload::Honorific { .. } => PermissionSet::primary(PrimaryPermissions::HONORIFIC),
        ActionPayload::PossessionBegin(_) => {
            PermissionSet::elevated(ElevatedPermissions::POSSESSION)
        }
        ActionPayload::PossessionCamera(_)
        | ActionPayload::PossessionMovement(_)
        | ActionPayload::PossessionEnd
        | ActionPayload::BodySwapQuery
        | ActionPayload::BodySwapAssignment(_)
        | ActionPayload::OnlineStatus(_)
        | ActionPayload::Permissions(_) => PermissionSet::default(),
    }
}

/// Routes validated requests to the component that handles their method.
pub struct RequestRouter {
    forward: Arc<ForwardedRequestManager>,
    possession: Arc<PossessionSessionManager>,
    body_swap: Arc<BodySwapCoordinator>,
    max_targets: usize,
}

impl RequestRouter {
    pub fn new(
        forward: Arc<ForwardedRequestManager>,
        possession: Arc<PossessionSessionManager>,
        body_swap: Arc<BodySwapCoordinator>,
        max_targets: usize,
    ) -> Self {
        Self {
            forward,
            possession,
            body_swap,
            max_targets,
        }
    }

    pub async fn handle(&self, sender: &str, request: Request) -> Response {
        metrics::inc_requests_handled();
        let method = request.payload.method();
        trace!("{} request from {}", method, redact_code(sender));

        if let Err(e) = self.validate(sender, &request) {
            metrics::inc_rejected();
            debug!(
                "{} from {} rejected: {}",
                method,
                redact_code(sender),
                escape_log(&e.to_string())
            );
            return Response::rejected(e.code());
        }

        let Request {
            target_friend_codes: targets,
            payload,
        } = request;
        let required = required_permissions(&payload);
        match payload {
            ActionPayload::PossessionBegin(begin) => {
                self.possession.begin(sender, &targets[0], begin).await
            }
            ActionPayload::PossessionCamera(_) | ActionPayload::PossessionMovement(_) => {
                self.possession.stream(sender, payload).await
            }
            ActionPayload::PossessionEnd => self.possession.end(sender).await,
            ActionPayload::BodySwap(swap) => {
                self.body_swap.swap(sender, &targets, swap, required).await
            }
            other => {
                self.forward
                    .check_permissions_and_send(sender, &targets, method, required, other)
                    .await
            }
        }
    }

    /// Stateless checks. Stream and end packets address the sender's session,
    /// so their target lists are not inspected.
    fn validate(&self, sender: &str, request: &Request) -> Result<(), ValidationError> {
        validate_payload(&request.payload)?;
        let targets = &request.target_friend_codes;
        match &request.payload {
            ActionPayload::PossessionCamera(_)
            | ActionPayload::PossessionMovement(_)
            | ActionPayload::PossessionEnd => Ok(()),
            ActionPayload::PossessionBegin(_) => {
                validate_targets(sender, targets, self.max_targets, SelfTargetPolicy::Reject)?;
                if targets.len() > 1 {
                    return Err(ValidationError::TooManyTargets {
                        count: targets.len(),
                        max: 1,
                    });
                }
                Ok(())
            }
            ActionPayload::BodySwap(_) => validate_targets(
                sender,
                targets,
                self.max_targets,
                SelfTargetPolicy::RejectAsBodySwap,
            ),
            _ => validate_targets(sender, targets, self.max_targets, SelfTargetPolicy::Reject),
        }
    }
}

/// Request outcome worth surfacing in a one-line log summary.
pub fn summarize(response: &Response) -> String {
    if response.response_code != ResultCode::Success {
        return response.response_code.to_string();
    }
    let delivered = response.results.values().filter(|c| c.is_success()).count();
    format!("{}/{} delivered", delivered, response.results.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::{
        ApplyFlags, BodySwapPayload, ChatChannel, SpeakPayload, TransformPayload,
    };

    #[test]
    fn speak_requires_channel_flag() {
        let payload = ActionPayload::Speak(SpeakPayload {
            message: "hi".into(),
            channel: ChatChannel::CrossWorldLinkshell,
            extra: Some("3".into()),
        });
        assert_eq!(
            required_permissions(&payload),
            PermissionSet::speak(SpeakPermissions::CWL3)
        );
    }

    #[test]
    fn locked_transform_needs_elevated_flag() {
        let payload = ActionPayload::Transform(TransformPayload {
            appearance: "blob".into(),
            apply: ApplyFlags {
                customization: true,
                equipment: true,
            },
            lock_code: Some("1234".into()),
        });
        let required = required_permissions(&payload);
        assert_eq!(
            required.primary,
            PrimaryPermissions::CUSTOMIZATION | PrimaryPermissions::EQUIPMENT
        );
        assert_eq!(required.elevated, ElevatedPermissions::PERMANENT_TRANSFORMATION);
    }

    #[test]
    fn body_swap_needs_flag_per_attribute() {
        let payload = ActionPayload::BodySwap(BodySwapPayload {
            attributes: SwapAttributes {
                equipment: true,
                honorific: true,
                ..SwapAttributes::default()
            },
            sender_identity: None,
            lock_code: None,
        });
        assert_eq!(
            required_permissions(&payload).primary,
            PrimaryPermissions::BODY_SWAP
                | PrimaryPermissions::EQUIPMENT
                | PrimaryPermissions::HONORIFIC
        );
        assert!(required_permissions(&ActionPayload::PossessionEnd).is_empty());
    }

    #[test]
    fn summary_reads_counts() {
        let mut results = std::collections::HashMap::new();
        results.insert("A".to_string(), ResultCode::Success);
        results.insert("B".to_string(), ResultCode::TargetOffline);
        assert_eq!(summarize(&Response::processed(results)), "1/2 delivered");
        assert_eq!(summarize(&Response::rejected(ResultCode::TooManyRequests)), "too_many_requests");
    }
}
