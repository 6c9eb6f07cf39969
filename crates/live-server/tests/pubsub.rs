// crates/live-server/tests/pubsub.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use live_core::Params;
use live_protocol::Event;
use live_server::types::BroadcastHook;
use live_server::{
    shutdown, Engine, EngineConfig, Handler, LiveError, LocalTransport, PubSub, RateLimiter, SessionId, Shutdown,
    Subscriber, TransportMessage,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Clock {
    ticks: u64,
}

fn clock_engine(shutdown: Shutdown) -> Arc<Engine<Clock>> {
    let handler = Handler::<Clock>::new()
        .with_render(|ctx| Ok(format!("<p>{}</p>", ctx.assigns.ticks)))
        .handle_self("tick", |_socket, c, _payload| Ok(Clock { ticks: c.ticks + 1 }));
    Engine::new(handler, EngineConfig::default(), shutdown)
}

async fn attached(engine: &Engine<Clock>, session: &str) -> mpsc::Receiver<Event> {
    let (tx, mut rx) = mpsc::channel(16);
    engine
        .attach(&SessionId::new(session), &Params::new(), tx)
        .await
        .unwrap();
    rx.recv().await.unwrap();
    rx
}

async fn next_patch(rx: &mut mpsc::Receiver<Event>) -> Event {
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("patch in time")
        .unwrap();
    assert_eq!(event.kind, "patch");
    event
}

#[tokio::test]
async fn broadcast_from_one_engine_reaches_every_subscriber() {
    let (_trigger, signal) = shutdown::channel();
    let router = PubSub::from_config(LocalTransport::new(), &EngineConfig::default(), signal.clone());
    let first = clock_engine(signal.clone());
    let second = clock_engine(signal.clone());
    router.subscribe("clock", first.clone());
    router.subscribe("clock", second.clone());
    assert_eq!(router.subscriber_count("clock"), 2);

    let mut rx_first = attached(&first, "a").await;
    let mut rx_second = attached(&second, "b").await;

    first.broadcast(Event::self_event("tick", 1)).await.unwrap();

    next_patch(&mut rx_first).await;
    next_patch(&mut rx_second).await;
}

#[tokio::test]
async fn other_topics_are_not_delivered() {
    let (_trigger, signal) = shutdown::channel();
    let router = PubSub::from_config(LocalTransport::new(), &EngineConfig::default(), signal.clone());
    let subscribed = clock_engine(signal.clone());
    router.subscribe("clock", subscribed.clone());
    let mut rx = attached(&subscribed, "a").await;

    router
        .publish("weather", Event::self_event("tick", 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dropped_subscribers_are_pruned() {
    let (_trigger, signal) = shutdown::channel();
    let router = PubSub::from_config(LocalTransport::new(), &EngineConfig::default(), signal.clone());
    let engine = clock_engine(signal.clone());
    router.subscribe("clock", engine.clone());
    drop(engine);

    assert_eq!(router.subscriber_count("clock"), 0);
    router.receive(TransportMessage {
        topic: "clock".into(),
        event: Event::self_event("tick", 1),
    });
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Subscriber for Recorder {
    fn receive(&self, event: Event) {
        self.events.lock().unwrap().push(event.kind);
    }

    fn redirect_broadcasts(&self, _hook: BroadcastHook) {}
}

#[tokio::test(start_paused = true)]
async fn publish_is_rate_limited() {
    let (_trigger, signal) = shutdown::channel();
    let limiter = RateLimiter::new(Duration::from_millis(100), 2);
    let router = PubSub::new(LocalTransport::new(), limiter, signal);
    let recorder = Arc::new(Recorder::default());
    router.subscribe("t", recorder.clone());

    let started = tokio::time::Instant::now();
    for _ in 0..4 {
        router.publish("t", Event::new("e")).await.unwrap();
    }
    // Two from the burst, then one per interval.
    assert!(started.elapsed() >= Duration::from_millis(200));

    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(recorder.events.lock().unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn publish_waiting_on_the_limiter_is_cancelled_by_shutdown() {
    let (trigger, signal) = shutdown::channel();
    let limiter = RateLimiter::new(Duration::from_secs(3600), 1);
    let router = PubSub::new(LocalTransport::new(), limiter, signal);
    router.publish("t", Event::new("e")).await.unwrap();

    let waiting = tokio::spawn({
        let router = router.clone();
        async move { router.publish("t", Event::new("e")).await }
    });
    tokio::task::yield_now().await;
    trigger.trigger();

    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(LiveError::Cancelled)));
}
