//! Property 6: exiting a state cancels every timer it scheduled, and none of
//! those timers may post afterwards. Also covers the 50us minimum interval
//! for periodic timers (§9.4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hsm_engine::prelude::*;

struct ScheduleOnEnter {
    duration: Duration,
    periodic: bool,
    scheduled_ok: Arc<AtomicBool>,
}

#[async_trait]
impl EnterHandler for ScheduleOnEnter {
    async fn on_enter(&self, ctx: &mut TransitionContext<'_>) -> EngineResult<()> {
        let result = ctx.schedule(Arc::new(|| Message::new(TimerFired)), self.duration, self.periodic);
        self.scheduled_ok.store(result.is_ok(), Ordering::SeqCst);
        if let Ok(handle) = result {
            // Only exercised for the min-interval-rejection test's tree, which
            // never runs long enough to observe the timer; drop it cleanly.
            std::mem::forget(handle);
        }
        Ok(())
    }
}

struct TimerFired;

struct GoToIdle;

#[async_trait]
impl MessageHandler for GoToIdle {
    async fn on_message(&self, _ctx: &mut MessageContext<'_>, msg: &Message) -> EngineResult<MessageResult> {
        if msg.downcast_ref::<TimerFired>().is_some() {
            return Ok(MessageResult::Unhandled);
        }
        Ok(MessageResult::go_to(StateKey::new("Idle")))
    }
}

fn build_tree(duration: Duration, periodic: bool, scheduled_ok: Arc<AtomicBool>) -> NodeDef {
    let active = NodeDef::new(StateKey::new("Active"), NodeKind::Leaf)
        .on_enter(Arc::new(ScheduleOnEnter {
            duration,
            periodic,
            scheduled_ok,
        }))
        .on_message(Arc::new(GoToIdle));
    let idle = NodeDef::new(StateKey::new("Idle"), NodeKind::Leaf);

    NodeDef::new(StateKey::new("R"), NodeKind::Root)
        .child(active)
        .child(idle)
        .initial_child(Arc::new(|_ctx| StateKey::new("Active")))
}

#[tokio::test(start_paused = true)]
async fn exiting_cancels_its_timers_before_they_can_fire() {
    let scheduled_ok = Arc::new(AtomicBool::new(false));
    let tree = build_tree(Duration::from_millis(50), false, scheduled_ok.clone());
    let engine = Engine::new(tree, EngineConfig::default()).unwrap();
    engine.start(StartOptions::new()).await.unwrap();
    assert!(scheduled_ok.load(Ordering::SeqCst));

    let mut processed = engine.processed_messages();
    engine.post(Message::new(())).await.unwrap(); // Active -> Idle, should cancel the timer
    processed.recv().await.unwrap(); // drain the event for the transition we just drove

    tokio::time::advance(Duration::from_millis(200)).await;

    assert!(
        processed.try_recv().is_err(),
        "a cancelled timer must never post its message"
    );
}

#[tokio::test]
async fn periodic_intervals_below_the_minimum_are_rejected() {
    let scheduled_ok = Arc::new(AtomicBool::new(true));
    let tree = build_tree(Duration::from_micros(10), true, scheduled_ok.clone());
    let engine = Engine::new(tree, EngineConfig::default()).unwrap();
    engine.start(StartOptions::new()).await.unwrap();

    assert!(!scheduled_ok.load(Ordering::SeqCst));
}
