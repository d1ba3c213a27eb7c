mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{app, app_with, call, create_room, join, register};

#[tokio::test]
async fn register_login_and_duplicate_username() {
    let app = app();
    register(&app, "alice").await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "alice", "password": "another-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "alice", "password": "hunter22-long" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({ "username": "alice", "password": "wrong-password" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn weak_registration_is_rejected() {
    let app = app();
    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "bo", "password": "hunter22-long" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "bobby", "password": "short" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn refresh_rotation_and_reuse() {
    let app = app();
    let user = register(&app, "dana").await;
    let t1 = user.refresh;

    let (status, body) = call(&app, Method::POST, "/auth/refresh", None, Some(json!({ "refresh_token": t1 }))).await;
    assert_eq!(status, StatusCode::OK);
    let t2 = body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(t1, t2);

    // replaying T1 is a reuse signal
    let (status, body) = call(&app, Method::POST, "/auth/refresh", None, Some(json!({ "refresh_token": t1 }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    // and the whole family, T2 included, is gone
    let (status, _) = call(&app, Method::POST, "/auth/refresh", None, Some(json!({ "refresh_token": t2 }))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_refresh_tokens() {
    let app = app();
    let user = register(&app, "erin").await;

    let (status, _) = call(&app, Method::POST, "/auth/logout", Some(&user.access), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        Method::POST,
        "/auth/refresh",
        None,
        Some(json!({ "refresh_token": user.refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_routes_need_an_access_token() {
    let app = app();
    let user = register(&app, "frank").await;

    let (status, _) = call(&app, Method::GET, "/rooms", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::GET, "/rooms", Some(&user.refresh), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&app, Method::GET, "/rooms", Some(&user.access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn rooms_join_by_invite() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;

    assert_eq!(join(&app, &bob, "no-such-code").await, StatusCode::NOT_FOUND);
    assert_eq!(join(&app, &bob, &invite).await, StatusCode::OK);
    assert_eq!(join(&app, &bob, &invite).await, StatusCode::OK);

    let (_, rooms) = call(&app, Method::GET, "/rooms", Some(&bob.access), None).await;
    assert_eq!(rooms[0]["id"], room_id.as_str());
    assert_eq!(rooms[0]["role"], "member");

    let (_, rooms) = call(&app, Method::GET, "/rooms", Some(&alice.access), None).await;
    assert_eq!(rooms[0]["role"], "owner");
}

#[tokio::test]
async fn history_is_members_only_and_paginates() {
    let app = app();
    let alice = register(&app, "alice").await;
    let eve = register(&app, "eve").await;
    let (room_id, _) = create_room(&app, &alice, "general").await;
    let uri = format!("/rooms/{}/messages", room_id);

    for i in 0..3 {
        let (status, _) = call(
            &app,
            Method::POST,
            &uri,
            Some(&alice.access),
            Some(json!({ "content": format!("message {}", i) })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let (status, _) = call(&app, Method::GET, &uri, Some(&eve.access), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, page) = call(&app, Method::GET, &format!("{}?limit=2", uri), Some(&alice.access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["messages"][0]["content"], "message 2");
    assert_eq!(page["messages"][1]["content"], "message 1");
    let cursor = page["next_cursor"].as_str().unwrap();

    let (_, older) = call(
        &app,
        Method::GET,
        &format!("{}?limit=2&cursor={}", uri, cursor),
        Some(&alice.access),
        None,
    )
    .await;
    assert_eq!(older["messages"].as_array().unwrap().len(), 1);
    assert_eq!(older["messages"][0]["content"], "message 0");
    assert!(older["next_cursor"].is_null());
}

#[tokio::test]
async fn posted_messages_are_validated() {
    let app = app();
    let alice = register(&app, "alice").await;
    let (room_id, _) = create_room(&app, &alice, "general").await;
    let uri = format!("/rooms/{}/messages", room_id);

    let (status, _) = call(&app, Method::POST, &uri, Some(&alice.access), Some(json!({ "content": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        &uri,
        Some(&alice.access),
        Some(json!({ "content": "x".repeat(4001) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        Method::POST,
        &uri,
        Some(&alice.access),
        Some(json!({
            "content": "see file",
            "attachment": { "key": "k/1", "name": "a.pdf", "type": "application/pdf", "size": 10 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["attachment"]["type"], "application/pdf");
    assert_eq!(body["user_id"], alice.id.as_str());
}

#[tokio::test]
async fn ban_requires_rank_and_blocks_rejoin() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let carol = register(&app, "carol").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;
    join(&app, &bob, &invite).await;
    join(&app, &carol, &invite).await;
    let bans = format!("/rooms/{}/bans", room_id);

    // members cannot moderate
    let (status, _) = call(&app, Method::POST, &bans, Some(&bob.access), Some(json!({ "user_id": carol.id }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &app,
        Method::POST,
        &bans,
        Some(&alice.access),
        Some(json!({ "user_id": bob.id, "reason": "spam" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connections_closed"], 0);

    assert_eq!(join(&app, &bob, &invite).await, StatusCode::FORBIDDEN);
    let (status, _) = call(
        &app,
        Method::GET,
        &format!("/rooms/{}/messages", room_id),
        Some(&bob.access),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok", "rooms_online": 0 }));
}

#[tokio::test]
async fn unban_lets_a_banned_user_rejoin() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;
    join(&app, &bob, &invite).await;

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/rooms/{}/bans", room_id),
        Some(&alice.access),
        Some(json!({ "user_id": bob.id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(join(&app, &bob, &invite).await, StatusCode::FORBIDDEN);

    let unban = format!("/rooms/{}/bans/{}", room_id, bob.id);
    let (status, _) = call(&app, Method::DELETE, &unban, Some(&bob.access), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, Method::DELETE, &unban, Some(&alice.access), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, &unban, Some(&alice.access), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert_eq!(join(&app, &bob, &invite).await, StatusCode::OK);
}

#[tokio::test]
async fn muted_member_cannot_post_until_unmuted() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;
    join(&app, &bob, &invite).await;
    let mutes = format!("/rooms/{}/mutes", room_id);
    let messages = format!("/rooms/{}/messages", room_id);

    // members cannot moderate
    let (status, _) = call(&app, Method::POST, &mutes, Some(&bob.access), Some(json!({ "user_id": alice.id }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &app,
        Method::POST,
        &mutes,
        Some(&alice.access),
        Some(json!({ "user_id": bob.id, "minutes": 30, "reason": "cool off" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["user_id"], bob.id.as_str());
    assert!(body["until"].is_string());

    let (status, _) = call(&app, Method::POST, &messages, Some(&bob.access), Some(json!({ "content": "hello?" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // muted members still read
    let (status, body) = call(&app, Method::GET, &messages, Some(&bob.access), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"].as_array().unwrap().len(), 0);

    let unmute = format!("/rooms/{}/mutes/{}", room_id, bob.id);
    let (status, _) = call(&app, Method::DELETE, &unmute, Some(&alice.access), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, &unmute, Some(&alice.access), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::POST, &messages, Some(&bob.access), Some(json!({ "content": "hello!" }))).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn mentions_keep_only_room_members() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let carol = register(&app, "carol").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;
    join(&app, &bob, &invite).await;
    let messages = format!("/rooms/{}/messages", room_id);

    let (status, body) = call(
        &app,
        Method::POST,
        &messages,
        Some(&alice.access),
        Some(json!({ "content": "@bob @carol lunch?", "mentions": [bob.id, carol.id, bob.id] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["mentions"], json!([bob.id]));

    let (_, history) = call(&app, Method::GET, &messages, Some(&bob.access), None).await;
    assert_eq!(history["messages"][0]["mentions"], json!([bob.id]));
}

#[tokio::test]
async fn reactions_over_rest_return_counts() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let carol = register(&app, "carol").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;
    join(&app, &bob, &invite).await;

    let (_, message) = call(
        &app,
        Method::POST,
        &format!("/rooms/{}/messages", room_id),
        Some(&alice.access),
        Some(json!({ "content": "ship it" })),
    )
    .await;
    let reactions = format!("/messages/{}/reactions", message["id"].as_str().unwrap());
    let thumbs = json!({ "emoji": "👍" });

    let (status, body) = call(&app, Method::POST, &reactions, Some(&alice.access), Some(thumbs.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!([{ "emoji": "👍", "count": 1 }]));

    let (_, body) = call(&app, Method::POST, &reactions, Some(&bob.access), Some(thumbs.clone())).await;
    assert_eq!(body, json!([{ "emoji": "👍", "count": 2 }]));

    // adding twice is a no-op
    let (status, body) = call(&app, Method::POST, &reactions, Some(&bob.access), Some(thumbs.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{ "emoji": "👍", "count": 2 }]));

    let (status, body) = call(&app, Method::DELETE, &reactions, Some(&bob.access), Some(thumbs.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{ "emoji": "👍", "count": 1 }]));

    let (status, _) = call(&app, Method::POST, &reactions, Some(&carol.access), Some(thumbs.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(&app, Method::POST, &reactions, Some(&bob.access), Some(json!({ "emoji": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = format!("/messages/{}/reactions", uuid::Uuid::new_v4());
    let (status, _) = call(&app, Method::POST, &missing, Some(&bob.access), Some(thumbs)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn receipts_over_rest_count_room_messages_only() {
    let app = app();
    let alice = register(&app, "alice").await;
    let bob = register(&app, "bob").await;
    let carol = register(&app, "carol").await;
    let (room_id, invite) = create_room(&app, &alice, "general").await;
    join(&app, &bob, &invite).await;

    let (_, message) = call(
        &app,
        Method::POST,
        &format!("/rooms/{}/messages", room_id),
        Some(&alice.access),
        Some(json!({ "content": "read me" })),
    )
    .await;
    let ids = json!({ "message_ids": [message["id"], uuid::Uuid::new_v4()] });

    let delivered = format!("/rooms/{}/receipts/delivered", room_id);
    let (status, body) = call(&app, Method::POST, &delivered, Some(&bob.access), Some(ids.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["recorded"], 1);

    let read = format!("/rooms/{}/receipts/read", room_id);
    let (status, body) = call(&app, Method::POST, &read, Some(&bob.access), Some(ids.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recorded"], 1);

    let (status, _) = call(&app, Method::POST, &read, Some(&carol.access), Some(ids)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn auth_requests_are_rate_limited() {
    let app = app_with(&[("MURMUR_AUTH_RATE_LIMIT", "2")]);
    register(&app, "alice").await;
    register(&app, "bob").await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": "carol", "password": "hunter22-long" })),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "rate limited");

    // other routes are not counted
    let (status, _) = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn repeated_failed_logins_lock_the_username() {
    let app = app_with(&[("MURMUR_LOGIN_MAX_FAILURES", "2")]);
    register(&app, "alice").await;
    register(&app, "bob").await;

    let login = |username: &'static str, password: &'static str| {
        let app = app.clone();
        async move {
            call(
                &app,
                Method::POST,
                "/auth/login",
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await
            .0
        }
    };

    assert_eq!(login("alice", "wrong-password").await, StatusCode::UNAUTHORIZED);
    assert_eq!(login("alice", "wrong-password").await, StatusCode::UNAUTHORIZED);
    assert_eq!(login("alice", "hunter22-long").await, StatusCode::TOO_MANY_REQUESTS);

    // a success clears earlier failures
    assert_eq!(login("bob", "wrong-password").await, StatusCode::UNAUTHORIZED);
    assert_eq!(login("bob", "hunter22-long").await, StatusCode::OK);
    assert_eq!(login("bob", "wrong-password").await, StatusCode::UNAUTHORIZED);
    assert_eq!(login("bob", "hunter22-long").await, StatusCode::OK);
}
