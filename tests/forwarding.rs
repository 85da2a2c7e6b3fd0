use friendrelay::relay::permissions::{PrimaryPermissions, SpeakPermissions};
use friendrelay::relay::protocol::{ChatChannel, EmotePayload, SpeakPayload};
use friendrelay::relay::{
    ActionPayload, LoopbackScript, Method, PermissionEdge, PermissionSet, PermissionStore,
    Request, ResultCode,
};
mod common;

fn emote() -> ActionPayload {
    ActionPayload::Emote(EmotePayload {
        emote: "wave".into(),
        display_log_message: false,
    })
}

#[tokio::test]
async fn speak_reaches_permitted_target() {
    let h = common::harness(&["S", "T"]).await;
    h.grant("T", "S", PermissionSet::speak(SpeakPermissions::SAY)).await;

    let resp = h
        .server
        .handle_request(
            "S",
            Request::new(
                &["T"],
                ActionPayload::Speak(SpeakPayload {
                    message: "hi".into(),
                    channel: ChatChannel::Say,
                    extra: None,
                }),
            ),
        )
        .await;

    assert_eq!(resp.response_code, ResultCode::Success);
    assert_eq!(resp.result_for("T"), Some(ResultCode::Success));
    let received = h.client("T").received();
    let (method, command) = received.last().unwrap();
    assert_eq!(*method, Method::Speak);
    assert_eq!(command.sender_friend_code, "S");
}

#[tokio::test]
async fn missing_emote_permission_sends_nothing() {
    let h = common::harness(&["S", "T"]).await;
    h.grant("T", "S", PermissionSet::speak(SpeakPermissions::SAY)).await;

    let resp = h.server.handle_request("S", Request::new(&["T"], emote())).await;
    assert_eq!(resp.result_for("T"), Some(ResultCode::TargetLacksPermissions));
    assert_eq!(h.client("T").received_count(Method::Emote), 0);
}

#[tokio::test]
async fn fan_out_isolates_each_target() {
    // A is a friend but offline, B is permitted, C is a friend without the flag.
    let h = common::harness(&["S", "B", "C"]).await;
    h.grant("A", "S", PermissionSet::primary(PrimaryPermissions::EMOTE)).await;
    h.grant("B", "S", PermissionSet::primary(PrimaryPermissions::EMOTE)).await;
    h.grant("C", "S", PermissionSet::primary(PrimaryPermissions::MOODLES)).await;

    let resp = h
        .server
        .handle_request("S", Request::new(&["A", "B", "C"], emote()))
        .await;
    assert_eq!(resp.response_code, ResultCode::Success);
    assert_eq!(resp.results.len(), 3);
    assert_eq!(resp.result_for("A"), Some(ResultCode::TargetOffline));
    assert_eq!(resp.result_for("B"), Some(ResultCode::Success));
    assert_eq!(resp.result_for("C"), Some(ResultCode::TargetLacksPermissions));
}

#[tokio::test]
async fn unknown_sender_and_non_friend_target() {
    let h = common::harness(&["S", "T"]).await;
    let resp = h.server.handle_request("S", Request::new(&["T"], emote())).await;
    assert_eq!(resp.result_for("T"), Some(ResultCode::TargetNotFriends));

    let resp = h.server.handle_request("ghost", Request::new(&["T"], emote())).await;
    assert_eq!(resp.response_code, ResultCode::UnexpectedState);
    assert!(resp.results.is_empty());
}

#[tokio::test]
async fn deny_overrides_global_default() {
    let h = common::harness(&["S", "T"]).await;
    h.store
        .update_global_permissions("T", PermissionSet::primary(PrimaryPermissions::EMOTE))
        .await
        .unwrap();
    h.store
        .update_single_permissions(
            PermissionEdge::inherit("T", "S")
                .denying(PermissionSet::primary(PrimaryPermissions::EMOTE)),
        )
        .await
        .unwrap();

    let resp = h.server.handle_request("S", Request::new(&["T"], emote())).await;
    assert_eq!(resp.result_for("T"), Some(ResultCode::TargetLacksPermissions));

    h.store
        .update_single_permissions(PermissionEdge::inherit("T", "S"))
        .await
        .unwrap();
    let resp = h.server.handle_request("S", Request::new(&["T"], emote())).await;
    assert_eq!(resp.result_for("T"), Some(ResultCode::Success));
}

#[tokio::test(start_paused = true)]
async fn slow_target_does_not_hold_back_others() {
    let h = common::harness(&["S", "Fast", "Slow", "Broken"]).await;
    for t in ["Fast", "Slow", "Broken"] {
        h.grant(t, "S", PermissionSet::primary(PrimaryPermissions::EMOTE)).await;
    }
    h.client("Slow").script(Method::Emote, LoopbackScript::Stall);
    h.client("Broken")
        .script(Method::Emote, LoopbackScript::Fail("plugin crashed".into()));

    let resp = h
        .server
        .handle_request("S", Request::new(&["Fast", "Slow", "Broken"], emote()))
        .await;
    assert_eq!(resp.response_code, ResultCode::Success);
    assert_eq!(resp.result_for("Fast"), Some(ResultCode::Success));
    assert_eq!(resp.result_for("Slow"), Some(ResultCode::Timeout));
    assert_eq!(resp.result_for("Broken"), Some(ResultCode::Unknown));
}

#[tokio::test]
async fn malformed_requests_are_rejected_before_delivery() {
    let h = common::harness(&["S", "T"]).await;
    h.grant("T", "S", PermissionSet::all()).await;

    let cases = vec![
        (Request::new(&[], emote()), ResultCode::BadTargets),
        (Request::new(&["T", "T"], emote()), ResultCode::BadTargets),
        (Request::new(&["S"], emote()), ResultCode::BadTargets),
        (
            Request::new(
                &["T"],
                ActionPayload::Emote(EmotePayload {
                    emote: String::new(),
                    display_log_message: false,
                }),
            ),
            ResultCode::BadDataInRequest,
        ),
        (
            Request::new(&["T"], ActionPayload::BodySwapQuery),
            ResultCode::BadDataInRequest,
        ),
    ];
    for (request, expected) in cases {
        let resp = h.server.handle_request("S", request).await;
        assert_eq!(resp.response_code, expected);
        assert!(resp.results.is_empty());
    }
    assert!(h.client("T").received().is_empty());
}

#[tokio::test]
async fn target_cap_is_enforced() {
    let mut config = common::test_config();
    config.relay.max_targets = 2;
    let h = common::harness_with(config, &["S"]).await;
    let resp = h
        .server
        .handle_request("S", Request::new(&["A", "B", "C"], emote()))
        .await;
    assert_eq!(resp.response_code, ResultCode::TooManyTargets);
}
