//! End-to-end scenarios over the in-process mock transport.

use resclient_client::{
    mock::{MockConn, MockServer},
    ClientError, ClientEvent, Resource, ResourceEvent, ResClient, StreamExt, Value,
};
use resclient_core::{codes, ResError};
use serde_json::json;

fn client() -> (ResClient, MockServer) {
    let (connector, server) = MockServer::new();
    (ResClient::builder("ws://mock").connector(connector).build(), server)
}

// Issues a `get`, accepts the connection (when `conn` is None) and
// answers the subscribe with `result`.
async fn get_resource(
    client: &ResClient,
    server: &mut MockServer,
    conn: Option<MockConn>,
    rid: &str,
    result: serde_json::Value,
) -> (MockConn, Resource) {
    let task = tokio::spawn({
        let client = client.clone();
        let rid = rid.to_owned();
        async move { client.get(rid).await }
    });
    let mut conn = match conn {
        Some(conn) => conn,
        None => server.accept().await.expect("client gone"),
    };
    let req = conn.next_request().await.expect("no subscribe request");
    assert_eq!(req.method, format!("subscribe.{rid}"));
    conn.result(req.id, result);
    let resource = task.await.unwrap().expect("get failed");
    (conn, resource)
}

fn data(v: serde_json::Value) -> Value {
    Value::Data(v)
}

#[tokio::test]
async fn basic_get_subscribes_and_materializes() {
    let (client, mut server) = client();
    let (mut conn, resource) =
        get_resource(&client, &mut server, None, "x.a", json!({"models": {"x.a": {"msg": "hi"}}}))
            .await;

    let model = resource.as_model().expect("expected a model");
    assert_eq!(model.get("msg"), Some(data(json!("hi"))));

    // the second get resolves from cache without another request: the
    // next frame the server sees is the probe call
    let second = client.get("x.a").await.unwrap();
    assert!(second.same_resource(&resource));

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("x.a", "probe", None).await }
    });
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "call.x.a.probe");
    conn.ack(req.id);
    call.await.unwrap().unwrap();
}

#[tokio::test]
async fn model_change_emits_old_values() {
    let (client, mut server) = client();
    let (conn, resource) =
        get_resource(&client, &mut server, None, "x.a", json!({"models": {"x.a": {"msg": "hi"}}}))
            .await;
    let (_id, mut events) = client.resource_on("x.a", None).await.unwrap();

    conn.event("x.a", "change", json!({"values": {"msg": "bye", "n": 42}}));

    match events.next().await.unwrap() {
        ResourceEvent::Change { old_values } => {
            assert_eq!(old_values.len(), 2);
            assert_eq!(old_values["msg"], Some(data(json!("hi"))));
            assert_eq!(old_values["n"], None);
        }
        other => panic!("expected change, got {other:?}"),
    }
    let model = resource.as_model().unwrap();
    assert_eq!(model.get("msg"), Some(data(json!("bye"))));
    assert_eq!(model.get("n"), Some(data(json!(42))));
}

#[tokio::test]
async fn nested_reference_shares_the_cached_object() {
    let (client, mut server) = client();
    let (mut conn, p) = get_resource(
        &client,
        &mut server,
        None,
        "p",
        json!({"models": {"p": {"child": {"rid": "c"}}, "c": {"v": 1}}}),
    )
    .await;

    // c resolves from cache; p.child is that same object
    let c = client.get("c").await.unwrap();
    let child = p.as_model().unwrap().get("child").unwrap();
    assert!(child.as_resource().unwrap().same_resource(&c));

    // severing the reference evicts c; the next get dials the server
    conn.event("p", "change", json!({"values": {"child": {"action": "delete"}}}));
    let refetch = tokio::spawn({
        let client = client.clone();
        async move { client.get("c").await }
    });
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.c");
    conn.result(req.id, json!({"models": {"c": {"v": 2}}}));
    let c2 = refetch.await.unwrap().unwrap();
    assert!(!c2.same_resource(&c));
}

#[tokio::test]
async fn cycle_materializes_and_collapses_on_unsubscribe() {
    let (client, mut server) = client();
    let (mut conn, a) = get_resource(
        &client,
        &mut server,
        None,
        "a",
        json!({"models": {"a": {"next": {"rid": "b"}}, "b": {"next": {"rid": "a"}}}}),
    )
    .await;

    // both resources observe each other
    let b = client.get("b").await.unwrap();
    assert!(a.as_model().unwrap().get("next").unwrap().as_resource().unwrap().same_resource(&b));
    assert!(b.as_model().unwrap().get("next").unwrap().as_resource().unwrap().same_resource(&a));

    // the server drops the subscription; the whole cycle is evicted, so
    // the next get subscribes afresh
    conn.send(json!({"event": "a.unsubscribe"}));
    let refetch = tokio::spawn({
        let client = client.clone();
        async move { client.get("a").await }
    });
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.a");
    conn.result(req.id, json!({"models": {"a": {"fresh": true}}}));
    let a2 = refetch.await.unwrap().unwrap();
    assert!(!a2.same_resource(&a));
}

#[tokio::test(start_paused = true)]
async fn disconnect_marks_stale_and_reconnect_syncs_models() {
    let (client, mut server) = client();
    let (_connect_id, mut client_events) = client.on(None);
    let (mut conn, resource) =
        get_resource(&client, &mut server, None, "x", json!({"models": {"x": {"msg": "hi"}}}))
            .await;
    let (_id, mut events) = client.resource_on("x", None).await.unwrap();
    assert!(matches!(client_events.next().await.unwrap(), ClientEvent::Connect));

    conn.close();
    assert!(matches!(client_events.next().await.unwrap(), ClientEvent::Error(_)));
    assert!(matches!(client_events.next().await.unwrap(), ClientEvent::Close));

    // the reconnect timer fires (time is virtual) and the stale resource
    // is resubscribed straight from the connect path
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.x");
    conn.result(req.id, json!({"models": {"x": {"msg": "bye"}}}));

    match events.next().await.unwrap() {
        ResourceEvent::Change { old_values } => {
            assert_eq!(old_values["msg"], Some(data(json!("hi"))));
        }
        other => panic!("expected change, got {other:?}"),
    }
    assert_eq!(resource.as_model().unwrap().get("msg"), Some(data(json!("bye"))));
    assert!(matches!(client_events.next().await.unwrap(), ClientEvent::Connect));
}

#[tokio::test(start_paused = true)]
async fn reconnect_with_unchanged_state_emits_nothing() {
    let (client, mut server) = client();
    let snapshot = json!({"models": {"x": {"msg": "hi", "n": 1}}});
    let (mut conn, resource) =
        get_resource(&client, &mut server, None, "x", snapshot.clone()).await;
    let (_id, mut events) = client.resource_on("x", None).await.unwrap();

    conn.close();
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    conn.result(req.id, snapshot);

    // let the sync settle, then verify silence and identical state
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(events.try_next().is_err(), "expected no events for an unchanged model");
    assert_eq!(resource.as_model().unwrap().get("msg"), Some(data(json!("hi"))));
    assert_eq!(resource.as_model().unwrap().get("n"), Some(data(json!(1))));
}

#[tokio::test(start_paused = true)]
async fn collection_resync_emits_lcs_diff() {
    let (client, mut server) = client();
    let (mut conn, resource) = get_resource(
        &client,
        &mut server,
        None,
        "list",
        json!({"collections": {"list": [1, 2, 3, 4, 5]}}),
    )
    .await;
    let (_id, mut events) = client.resource_on("list", None).await.unwrap();

    conn.close();
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.list");
    conn.result(req.id, json!({"collections": {"list": [1, 3, 4, 6, 5]}}));

    match events.next().await.unwrap() {
        ResourceEvent::Remove { idx, value } => {
            assert_eq!(idx, 1);
            assert_eq!(value, data(json!(2)));
        }
        other => panic!("expected remove, got {other:?}"),
    }
    match events.next().await.unwrap() {
        ResourceEvent::Add { idx, value } => {
            assert_eq!(idx, 3);
            assert_eq!(value, data(json!(6)));
        }
        other => panic!("expected add, got {other:?}"),
    }
    let items = resource.as_collection().unwrap().items();
    let expected: Vec<Value> = [1, 3, 4, 6, 5].iter().map(|n| data(json!(n))).collect();
    assert_eq!(items, expected);
}

#[tokio::test]
async fn collection_add_and_remove_events() {
    let (client, mut server) = client();
    let (conn, resource) = get_resource(
        &client,
        &mut server,
        None,
        "list",
        json!({"collections": {"list": ["a", "b"]}}),
    )
    .await;
    let (_id, mut events) = client.resource_on("list", None).await.unwrap();

    conn.event("list", "add", json!({"value": "c", "idx": 2}));
    match events.next().await.unwrap() {
        ResourceEvent::Add { idx, value } => {
            assert_eq!(idx, 2);
            assert_eq!(value, data(json!("c")));
        }
        other => panic!("expected add, got {other:?}"),
    }

    conn.event("list", "remove", json!({"idx": 0}));
    match events.next().await.unwrap() {
        ResourceEvent::Remove { idx, value } => {
            assert_eq!(idx, 0);
            assert_eq!(value, data(json!("a")));
        }
        other => panic!("expected remove, got {other:?}"),
    }
    assert_eq!(resource.as_collection().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn orphaned_listened_resource_goes_stale_and_resubscribes() {
    let (client, mut server) = client();
    let (mut conn, _list) = get_resource(
        &client,
        &mut server,
        None,
        "list",
        json!({"collections": {"list": [{"rid": "m"}]}, "models": {"m": {"v": 1}}}),
    )
    .await;
    let (_id, mut events) = client.resource_on("m", None).await.unwrap();

    // the only edge to m is severed; with a live listener it goes stale
    // and is resubscribed after the stale delay
    conn.event("list", "remove", json!({"idx": 0}));

    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.m");
    conn.result(req.id, json!({"models": {"m": {"v": 2}}}));
    match events.next().await.unwrap() {
        ResourceEvent::Change { old_values } => {
            assert_eq!(old_values["v"], Some(data(json!(1))));
        }
        other => panic!("expected change, got {other:?}"),
    }
}

#[tokio::test]
async fn custom_events_pass_through() {
    let (client, mut server) = client();
    let (conn, _resource) =
        get_resource(&client, &mut server, None, "x", json!({"models": {"x": {"v": 1}}})).await;
    let (_id, mut events) = client.resource_on("x", None).await.unwrap();

    conn.event("x", "pinged", json!({"at": 7}));
    match events.next().await.unwrap() {
        ResourceEvent::Custom { name, data } => {
            assert_eq!(name, "pinged");
            assert_eq!(data, Some(json!({"at": 7})));
        }
        other => panic!("expected custom event, got {other:?}"),
    }
}

#[tokio::test]
async fn call_resolves_and_errors_reject_with_event() {
    let (client, mut server) = client();
    let (_err_id, mut client_events) = client.on(Some("error"));

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("x.a", "add", Some(json!({"n": 1}))).await }
    });
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "call.x.a.add");
    assert_eq!(req.params, Some(json!({"n": 1})));
    conn.result(req.id, json!(42));
    assert_eq!(call.await.unwrap().unwrap(), json!(42));

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call("x.a", "add", None).await }
    });
    let req = conn.next_request().await.unwrap();
    conn.error(req.id, ResError::new("custom.fail", "nope"));
    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_code("custom.fail"));

    // call-bound errors are also surfaced as a client error event
    match client_events.next().await.unwrap() {
        ClientEvent::Error(e) => assert_eq!(e.code, "custom.fail"),
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn authenticate_uses_the_auth_action() {
    let (client, mut server) = client();
    let auth = tokio::spawn({
        let client = client.clone();
        async move { client.authenticate("auth.svc", "login", Some(json!({"token": "t"}))).await }
    });
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "auth.auth.svc.login");
    conn.ack(req.id);
    assert_eq!(auth.await.unwrap().unwrap(), serde_json::Value::Null);
}

#[tokio::test]
async fn create_materializes_the_new_resource() {
    let (client, mut server) = client();
    let create = tokio::spawn({
        let client = client.clone();
        async move { client.create("notes", Some(json!({"text": "todo"}))).await }
    });
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "new.notes");
    assert_eq!(req.params, Some(json!({"text": "todo"})));
    conn.result(req.id, json!({"rid": "notes.1", "models": {"notes.1": {"text": "todo"}}}));

    let resource = create.await.unwrap().unwrap();
    assert_eq!(resource.rid().as_str(), "notes.1");
    assert_eq!(resource.as_model().unwrap().get("text"), Some(data(json!("todo"))));

    // created resources are cached and subscribed
    let again = client.get("notes.1").await.unwrap();
    assert!(again.same_resource(&resource));
}

#[tokio::test]
async fn set_model_rewrites_absent_props_to_delete() {
    let (client, mut server) = client();
    let set = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .set_model(
                    "x.a",
                    [("msg".to_owned(), Some(json!("hi"))), ("old".to_owned(), None)],
                )
                .await
        }
    });
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "call.x.a.set");
    assert_eq!(req.params, Some(json!({"msg": "hi", "old": {"action": "delete"}})));
    conn.ack(req.id);
    set.await.unwrap().unwrap();
}

#[tokio::test]
async fn invalid_arguments_fail_before_dispatch() {
    let (client, _server) = client();
    assert!(matches!(client.get("").await, Err(ClientError::InvalidArgument(_))));
    assert!(matches!(
        client.call("x.a", "", None).await,
        Err(ClientError::InvalidArgument(_))
    ));
    assert!(matches!(
        client.authenticate("", "login", None).await,
        Err(ClientError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn resource_on_unknown_rid_is_not_found() {
    let (client, _server) = client();
    match client.resource_on("ghost", None).await {
        Err(ClientError::NotFound(rid)) => assert_eq!(rid.as_str(), "ghost"),
        other => panic!("expected not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn last_listener_drop_unsubscribes_and_evicts() {
    let (client, mut server) = client();
    let (mut conn, resource) =
        get_resource(&client, &mut server, None, "x.a", json!({"models": {"x.a": {"v": 1}}}))
            .await;
    let (id, _events) = client.resource_on("x.a", None).await.unwrap();

    let off = tokio::spawn({
        let client = client.clone();
        async move { client.resource_off("x.a", id).await }
    });
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "unsubscribe.x.a");
    conn.ack(req.id);
    off.await.unwrap().unwrap();

    // the item is gone; a new get dials the server again
    let refetch = tokio::spawn({
        let client = client.clone();
        async move { client.get("x.a").await }
    });
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.x.a");
    conn.result(req.id, json!({"models": {"x.a": {"v": 2}}}));
    let fresh = refetch.await.unwrap().unwrap();
    assert!(!fresh.same_resource(&resource));
}

#[tokio::test]
async fn connect_failure_rejects_the_call() {
    let (client, server) = client();
    server.fail_next_connects(1);
    let err = client.call("x.a", "probe", None).await.unwrap_err();
    assert!(err.is_code(codes::CONNECTION_ERROR));
}

#[tokio::test]
async fn disconnect_rejects_in_flight_work() {
    let (client, mut server) = client();
    let (_id, mut client_events) = client.on(Some("close"));

    let get = tokio::spawn({
        let client = client.clone();
        async move { client.get("x.a").await }
    });
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.x.a");

    client.disconnect();
    let err = get.await.unwrap().unwrap_err();
    assert!(err.is_code(codes::DISCONNECT));
    assert!(matches!(client_events.next().await.unwrap(), ClientEvent::Close));
}

#[tokio::test]
async fn on_connect_hook_runs_before_queued_sends() {
    let (connector, mut server) = MockServer::new();
    let client = ResClient::builder("ws://mock")
        .connector(connector)
        .on_connect(|client| async move {
            client.authenticate("auth.svc", "login", None).await.map(|_| ())
        })
        .build();

    let get = tokio::spawn({
        let client = client.clone();
        async move { client.get("x.a").await }
    });
    let mut conn = server.accept().await.unwrap();

    // the hook's auth goes out first; the queued subscribe only after the
    // hook resolved
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "auth.auth.svc.login");
    conn.ack(req.id);

    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.x.a");
    conn.result(req.id, json!({"models": {"x.a": {"v": 1}}}));
    get.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_hook_closes_and_retries() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let attempts = Arc::new(AtomicUsize::new(0));
    let (connector, mut server) = MockServer::new();
    let client = ResClient::builder("ws://mock")
        .connector(connector)
        .on_connect({
            let attempts = attempts.clone();
            move |_client| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ClientError::Protocol("auth backend down".to_owned()))
                    } else {
                        Ok(())
                    }
                }
            }
        })
        .build();

    let get = tokio::spawn({
        let client = client.clone();
        async move { client.get("x.a").await }
    });

    // first connection dies to the failing hook
    let _first = server.accept().await.unwrap();
    // the retry succeeds and serves the queued subscribe
    let mut conn = server.accept().await.unwrap();
    let req = conn.next_request().await.unwrap();
    assert_eq!(req.method, "subscribe.x.a");
    conn.result(req.id, json!({"models": {"x.a": {"v": 1}}}));
    get.await.unwrap().unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
