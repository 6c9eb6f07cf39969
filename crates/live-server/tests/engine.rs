// crates/live-server/tests/engine.rs
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use live_core::{Params, Patch};
use live_protocol::Event;
use live_server::handler::scoped_event_name;
use live_server::{shutdown, Engine, EngineConfig, Handler, LiveError, SessionId, Socket, SocketId, ShutdownTrigger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

fn counter_handler() -> Handler<Counter> {
    Handler::<Counter>::new()
        .with_render(|ctx| {
            if ctx.assigns.value == 13 {
                return Err(anyhow!("unlucky"));
            }
            Ok(format!("<main><h1>{}</h1></main>", ctx.assigns.value))
        })
        .handle_event("inc", |_socket, c, p| Ok(Counter { value: c.value + p.int("by").max(1) }))
        .handle_event("set", |_socket, _c, p| Ok(Counter { value: p.int("to") }))
        .handle_event("fail", |_socket, _c, _p| Err(anyhow!("nope")))
        .handle_event("go", |socket, c, _p| {
            socket.redirect("/next");
            Ok(Counter { value: c.value + 1 })
        })
        .handle_event("go-and-fail", |socket, _c, _p| {
            socket.redirect("/never");
            Err(anyhow!("changed my mind"))
        })
        .handle_self("tick", |_socket, c, payload| {
            Ok(Counter {
                value: c.value + payload.as_i64().unwrap_or(1),
            })
        })
        .handle_params(|_socket, c, p| {
            if p.contains_key("start") {
                Ok(Counter { value: p.int("start") })
            } else {
                Ok(c.clone())
            }
        })
}

struct Harness {
    engine: Arc<Engine<Counter>>,
    _trigger: ShutdownTrigger,
}

fn harness(handler: Handler<Counter>) -> Harness {
    let (trigger, signal) = shutdown::channel();
    let config = EngineConfig {
        send_budget_ms: 200,
        ..EngineConfig::default()
    };
    Harness {
        engine: Engine::new(handler, config, signal),
        _trigger: trigger,
    }
}

async fn attach(
    engine: &Engine<Counter>,
    session: &str,
) -> (Arc<Socket<Counter>>, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(16);
    let socket = engine
        .attach(&SessionId::new(session), &Params::new(), tx)
        .await
        .expect("attach");
    (socket, rx)
}

async fn next_event(rx: &mut mpsc::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

fn params(pairs: &[(&str, Value)]) -> Value {
    let map: serde_json::Map<String, Value> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Value::Object(map)
}

#[tokio::test]
async fn http_mount_renders_full_anchored_document() {
    let h = harness(counter_handler());
    let html = h
        .engine
        .mount_http(&SessionId::new("s1"), &Params::new())
        .await
        .unwrap();

    assert!(html.starts_with("<html><head></head>"), "{html}");
    assert!(html.contains(r#"<body live-rendered="">"#), "{html}");
    assert!(html.contains(r#"<main><h1 _l_1_0_0="">0</h1></main>"#), "{html}");
    assert_eq!(h.engine.connection_count().await, 0);
}

#[tokio::test]
async fn attach_without_parked_state_sends_one_root_patch() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;

    let event = rx.try_recv().expect("first render");
    assert_eq!(event.kind, "patch");
    let patches = event.patches().unwrap();
    assert_eq!(patches.len(), 1);
    assert!(patches[0].is_root());
    assert!(patches[0].html.contains(r#"<h1 _l_1_0_0="">0</h1>"#));

    assert!(socket.connected());
    assert!(socket.has_rendered().await);
    assert_eq!(h.engine.connection_count().await, 1);
}

#[tokio::test]
async fn attach_after_http_mount_rehydrates_without_resending() {
    let h = harness(counter_handler());
    let mut query = Params::new();
    query.insert("start", "5");
    let html = h
        .engine
        .mount_http(&SessionId::new("s1"), &query)
        .await
        .unwrap();
    assert!(html.contains(">5</h1>"));

    let (socket, mut rx) = attach(&h.engine, "s1").await;
    assert!(rx.try_recv().is_err(), "client already shows this render");
    assert_eq!(socket.with_assigns(|c| c.value).await, 5);
}

#[tokio::test]
async fn event_patches_only_the_changed_element() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    h.engine
        .handle_event(&socket, &Event::new("inc").with_id(1))
        .await
        .unwrap();

    let event = rx.try_recv().unwrap();
    assert_eq!(
        event.patches().unwrap(),
        vec![Patch::new(vec![1, 0, 0], r#"<h1 _l_1_0_0="">1</h1>"#)]
    );
}

#[tokio::test]
async fn event_params_reach_the_handler() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    let event = Event::new("inc").with_data(params(&[("by", json!("4"))]));
    h.engine.handle_event(&socket, &event).await.unwrap();
    assert_eq!(socket.with_assigns(|c| c.value).await, 4);
}

#[tokio::test]
async fn unknown_event_has_no_handler() {
    let h = harness(counter_handler());
    let (socket, _rx) = attach(&h.engine, "s1").await;

    let err = h
        .engine
        .handle_event(&socket, &Event::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::NoEventHandler(name) if name == "missing"));
}

#[tokio::test]
async fn non_object_data_is_malformed_params() {
    let h = harness(counter_handler());
    let (socket, _rx) = attach(&h.engine, "s1").await;

    let event = Event::new("inc").with_data(json!([1]));
    let err = h.engine.handle_event(&socket, &event).await.unwrap_err();
    assert!(matches!(err, LiveError::MalformedParams(_)));
    assert_eq!(socket.with_assigns(|c| c.value).await, 0);
}

#[tokio::test]
async fn failing_handler_leaves_assigns_and_client_alone() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    h.engine.handle_event(&socket, &Event::new("inc")).await.unwrap();
    rx.try_recv().unwrap();

    let err = h
        .engine
        .handle_event(&socket, &Event::new("fail"))
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::Handler { ref event, .. } if event == "fail"));
    assert_eq!(socket.with_assigns(|c| c.value).await, 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn render_failure_keeps_the_last_good_tree() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    let unlucky = Event::new("set").with_data(params(&[("to", json!(13))]));
    let err = h.engine.handle_event(&socket, &unlucky).await.unwrap_err();
    assert!(matches!(err, LiveError::Render(_)));
    assert!(rx.try_recv().is_err());

    // Diffed against the render the client still shows.
    let two = Event::new("set").with_data(params(&[("to", json!(2))]));
    h.engine.handle_event(&socket, &two).await.unwrap();
    assert_eq!(
        rx.try_recv().unwrap().patches().unwrap(),
        vec![Patch::new(vec![1, 0, 0], r#"<h1 _l_1_0_0="">2</h1>"#)]
    );
}

#[tokio::test]
async fn redirect_goes_out_after_the_render() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    h.engine.handle_event(&socket, &Event::new("go")).await.unwrap();
    assert_eq!(rx.try_recv().unwrap().kind, "patch");
    let redirect = rx.try_recv().unwrap();
    assert_eq!(redirect.kind, "redirect");
    assert_eq!(redirect.data, Some(json!("/next")));
}

#[tokio::test]
async fn failed_handler_drops_its_redirect() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    assert!(h
        .engine
        .handle_event(&socket, &Event::new("go-and-fail"))
        .await
        .is_err());
    h.engine.handle_event(&socket, &Event::new("inc")).await.unwrap();
    assert_eq!(rx.try_recv().unwrap().kind, "patch");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn self_event_runs_only_the_matching_handler() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    socket.self_event("tick", 5).unwrap();
    let event = next_event(&mut rx).await;
    assert_eq!(
        event.patches().unwrap(),
        vec![Patch::new(vec![1, 0, 0], r#"<h1 _l_1_0_0="">5</h1>"#)]
    );

    let err = h
        .engine
        .handle_self(&socket, &Event::self_event("missing", Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::NoEventHandler(_)));
    assert_eq!(socket.with_assigns(|c| c.value).await, 5);
}

#[tokio::test]
async fn params_handlers_fold_in_registration_order() {
    let handler = counter_handler().handle_params(|_socket, c, _p| Ok(Counter { value: c.value * 2 }));
    let h = harness(handler);
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    let event = Event::new("params").with_data(params(&[("start", json!("3"))]));
    h.engine.handle_params(&socket, &event).await.unwrap();
    assert_eq!(socket.with_assigns(|c| c.value).await, 6);
}

#[tokio::test]
async fn params_fold_keeps_results_before_a_failure() {
    let handler = counter_handler().handle_params(|_socket, c, p| {
        if p.contains_key("reject") {
            Err(anyhow!("rejected"))
        } else {
            Ok(c.clone())
        }
    });
    let h = harness(handler);
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    let event = Event::new("params").with_data(params(&[("start", json!("3")), ("reject", json!("1"))]));
    let err = h.engine.handle_params(&socket, &event).await.unwrap_err();
    assert!(matches!(err, LiveError::Handler { ref event, .. } if event == "params"));
    // The first handler's result was committed before the second failed.
    assert_eq!(socket.with_assigns(|c| c.value).await, 3);
}

#[tokio::test]
async fn failing_params_handler_fails_the_attach() {
    let handler = counter_handler().handle_params(|_socket, _c, _p| Err(anyhow!("bad query")));
    let h = harness(handler);
    let (tx, _rx) = mpsc::channel(16);
    let err = h
        .engine
        .attach(&SessionId::new("s1"), &Params::new(), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::Handler { ref event, .. } if event == "params"));
    assert_eq!(h.engine.connection_count().await, 0);
}

#[tokio::test]
async fn lookups_by_id_and_session() {
    let h = harness(counter_handler());
    let (socket, _rx) = attach(&h.engine, "s1").await;
    let (_other, _rx2) = attach(&h.engine, "s2").await;

    let by_session = h
        .engine
        .get_socket_by_session(&SessionId::new("s1"))
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&by_session, &socket));

    let by_id = h.engine.get_socket(&SocketId::from(&SessionId::new("s2"))).await;
    assert!(by_id.is_some());
    assert!(h.engine.get_socket_by_session(&SessionId::new("s3")).await.is_none());
}

#[tokio::test]
async fn reattaching_a_session_replaces_the_old_socket() {
    let h = harness(counter_handler());
    let (first, _rx1) = attach(&h.engine, "s1").await;
    let (second, _rx2) = attach(&h.engine, "s1").await;

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(h.engine.connection_count().await, 1);

    // Unmounting the stale socket must not evict the new one.
    h.engine.unmount(&first).await;
    assert_eq!(h.engine.connection_count().await, 1);
}

#[tokio::test]
async fn missing_renderer_is_a_configuration_error() {
    let h = harness(Handler::new());
    let err = h
        .engine
        .mount_http(&SessionId::new("s1"), &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::NoRenderer));

    let (tx, _rx) = mpsc::channel(1);
    let err = h
        .engine
        .attach(&SessionId::new("s1"), &Params::new(), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::NoRenderer));
}

#[tokio::test]
async fn component_self_reaches_the_scoped_handler() {
    let h = harness(counter_handler());
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    socket.handle_component_self("clock", "tick", |_socket, c, _payload| {
        Ok(Counter { value: c.value + 10 })
    });
    socket.component_self("clock", "tick", Value::Null).unwrap();

    next_event(&mut rx).await;
    assert_eq!(socket.with_assigns(|c| c.value).await, 10);
}

#[tokio::test]
async fn unmount_parks_a_snapshot_and_drops_scoped_handlers() {
    let h = harness(counter_handler());
    let session = SessionId::new("s1");
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();
    h.engine.handle_event(&socket, &Event::new("inc")).await.unwrap();
    socket.handle_component_self("clock", "tick", |_socket, c, _payload| Ok(c.clone()));

    h.engine.unmount(&socket).await;
    assert!(socket.is_closed());
    assert_eq!(h.engine.connection_count().await, 0);

    let parked = h
        .engine
        .state_store()
        .get(SocketId::from(&session))
        .await
        .unwrap();
    assert_eq!(parked.assigns, json!({ "value": 1 }));
    assert!(parked.render.contains(">1</h1>"));

    // A quick reconnect picks up where the socket left off.
    let (again, mut rx) = attach(&h.engine, "s1").await;
    assert!(rx.try_recv().is_err());
    assert_eq!(again.with_assigns(|c| c.value).await, 1);

    let scoped = Event::self_event(scoped_event_name(&session, "clock", "tick"), Value::Null);
    let err = h.engine.handle_self(&again, &scoped).await.unwrap_err();
    assert!(matches!(err, LiveError::NoEventHandler(_)));
}

#[tokio::test]
async fn broadcast_reaches_every_socket() {
    let h = harness(counter_handler());
    let (a, mut rx_a) = attach(&h.engine, "a").await;
    let (b, mut rx_b) = attach(&h.engine, "b").await;
    rx_a.try_recv().unwrap();
    rx_b.try_recv().unwrap();

    h.engine
        .broadcast(Event::self_event("tick", 2))
        .await
        .unwrap();

    next_event(&mut rx_a).await;
    next_event(&mut rx_b).await;
    assert_eq!(a.with_assigns(|c| c.value).await, 2);
    assert_eq!(b.with_assigns(|c| c.value).await, 2);
}

#[tokio::test]
async fn self_event_failures_reach_the_error_callback() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handler = counter_handler()
        .handle_self("boom", |_socket, _c, _payload| Err(anyhow!("exploded")))
        .with_error(move |err| {
            let _ = seen_tx.send(err.to_string());
        });
    let h = harness(handler);
    let (socket, mut rx) = attach(&h.engine, "s1").await;
    rx.try_recv().unwrap();

    // No caller to return to: the loop hands the failure to the callback.
    socket.self_event("boom", Value::Null).unwrap();
    let reported = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reported.contains("exploded"), "{reported}");
    assert!(rx.try_recv().is_err());
    assert_eq!(socket.with_assigns(|c| c.value).await, 0);
}

#[tokio::test]
async fn panicking_self_handler_closes_only_its_socket() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handler = counter_handler()
        .handle_self("boom", |socket, c, _payload| {
            if socket.session().as_str() == "a" {
                panic!("self handler blew up");
            }
            Ok(c.clone())
        })
        .with_error(move |err| {
            let _ = seen_tx.send(matches!(err, LiveError::HandlerPanic));
        });
    let h = harness(handler);
    let (a, mut rx_a) = attach(&h.engine, "a").await;
    let (b, mut rx_b) = attach(&h.engine, "b").await;
    rx_a.try_recv().unwrap();
    rx_b.try_recv().unwrap();

    h.engine
        .broadcast(Event::self_event("boom", Value::Null))
        .await
        .unwrap();
    let panicked = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(panicked);

    // The loop survived: later broadcasts still reach the healthy socket.
    h.engine
        .broadcast(Event::self_event("tick", 3))
        .await
        .unwrap();
    assert_eq!(next_event(&mut rx_b).await.kind, "patch");
    assert_eq!(b.with_assigns(|c| c.value).await, 3);
    assert!(a.is_closed());
    assert!(!b.is_closed());
}

#[tokio::test]
async fn panicking_mount_leaves_nothing_registered() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handler = counter_handler()
        .with_mount(|socket, c| {
            if socket.connected() {
                panic!("mount blew up");
            }
            Ok(c.clone())
        })
        .with_error(move |err| {
            let _ = seen_tx.send(matches!(err, LiveError::HandlerPanic));
        });
    let h = harness(handler);
    let (tx, mut rx) = mpsc::channel(16);
    let engine = h.engine.clone();
    let attached = tokio::spawn(async move {
        engine
            .attach(&SessionId::new("s1"), &Params::new(), tx)
            .await
            .map(|_| ())
    });

    let result = attached.await.expect("attach task finished");
    assert!(matches!(result, Err(LiveError::HandlerPanic)));
    assert!(seen_rx.try_recv().unwrap());
    assert_eq!(h.engine.connection_count().await, 0);
    assert!(h.engine.get_socket_by_session(&SessionId::new("s1")).await.is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_self_events_never_overlap() {
    let inside = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let handler = {
        let (inside, overlaps, runs) = (inside.clone(), overlaps.clone(), runs.clone());
        counter_handler().handle_self("slow", move |_socket, c, _payload| {
            if inside.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(20));
            inside.store(false, Ordering::SeqCst);
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(Counter { value: c.value + 1 })
        })
    };
    let h = harness(handler);
    let mut sockets = Vec::new();
    let mut receivers = Vec::new();
    for session in ["a", "b", "c", "d"] {
        let (socket, rx) = attach(&h.engine, session).await;
        sockets.push(socket);
        receivers.push(rx);
    }

    let tasks: Vec<_> = sockets
        .iter()
        .map(|socket| {
            let engine = h.engine.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                engine
                    .handle_self(&socket, &Event::self_event("slow", Value::Null))
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn local_broadcasts_are_rate_limited() {
    let (_trigger, signal) = shutdown::channel();
    let config = EngineConfig {
        broadcast_interval_ms: 100,
        broadcast_burst: 2,
        ..EngineConfig::default()
    };
    let engine = Engine::new(counter_handler(), config, signal);

    let started = tokio::time::Instant::now();
    for _ in 0..4 {
        engine.broadcast(Event::self_event("tick", 1)).await.unwrap();
    }
    // Two from the burst, then one per interval.
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn broadcast_waiting_for_a_token_is_cancelled_by_shutdown() {
    let (trigger, signal) = shutdown::channel();
    let config = EngineConfig {
        broadcast_interval_ms: 3_600_000,
        broadcast_burst: 1,
        ..EngineConfig::default()
    };
    let engine = Engine::new(counter_handler(), config, signal);
    engine.broadcast(Event::self_event("tick", 1)).await.unwrap();

    let waiting = tokio::spawn({
        let engine = engine.clone();
        async move { engine.broadcast(Event::self_event("tick", 1)).await }
    });
    tokio::task::yield_now().await;
    trigger.trigger();

    assert!(matches!(waiting.await.unwrap(), Err(LiveError::Cancelled)));
}
