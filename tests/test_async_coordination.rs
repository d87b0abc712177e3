//! Actors: child machines, promises, callbacks, observables
//!
//! What it tests:
//! - Spawning a child machine with autoForward and replying via sendParent
//! - Promise actors: resolution as `done.invoke.<id>`, rejection as
//!   `error.execution`
//! - Callback workers wired through emitter/receiver
//! - Observable streams feeding the parent mailbox
//! - Null actors outside a live interpreter, and owner-exit stopping
//!
//! Why it matters:
//! - Child emissions must serialize through the parent's queue — a parent
//!   state is never observed mid-transition — and lifecycle is the half of
//!   the actor model that silently leaks when it regresses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use statechart::{
    assign, assign_with, interpret, send, send_parent, stay, to, ActorRef, ActorSource, Event,
    Machine, SpawnOptions, TransitionConfig,
};

#[derive(Clone, Debug, PartialEq)]
struct ParentCtx {
    child: Option<ActorRef>,
    pongs: u32,
}

fn ponger() -> Machine<()> {
    Machine::builder("ponger", ())
        .initial("idle")
        .state("idle", |s| {
            s.on("PING", stay().internal().action(send_parent("PONG")))
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn auto_forwarded_pings_come_back_as_pongs() {
    let machine = Machine::builder("parent", ParentCtx { child: None, pongs: 0 })
        .initial("active")
        .state("active", |s| {
            s.entry(assign_with(|ctx: &ParentCtx, _, spawner| ParentCtx {
                child: Some(spawner.spawn_with(
                    ponger(),
                    SpawnOptions::named("pong-machine").auto_forward(),
                )),
                pongs: ctx.pongs,
            }))
            .on(
                "PONG",
                stay().internal().action(assign(|ctx: &ParentCtx, _| ParentCtx {
                    child: ctx.child.clone(),
                    pongs: ctx.pongs + 1,
                })),
            )
        })
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    for _ in 0..3 {
        service.send("PING").unwrap();
    }
    // Each PING was forwarded to the child after parent processing; the
    // child's PONG drained from the parent mailbox within the same send.
    assert_eq!(service.state().context.pongs, 3);
}

#[derive(Clone, Debug, PartialEq)]
struct FetchCtx {
    request: Option<ActorRef>,
    response: Option<String>,
}

#[tokio::test]
async fn promise_resolution_routes_done_invoke() {
    let machine = Machine::builder("fetcher", FetchCtx { request: None, response: None })
        .initial("loading")
        .state("loading", |s| {
            s.entry(assign_with(|ctx: &FetchCtx, _, spawner| FetchCtx {
                request: Some(spawner.spawn_with(
                    ActorSource::promise(async { Ok(json!("response")) }),
                    SpawnOptions::named("my-promise"),
                )),
                response: ctx.response.clone(),
            }))
            .on(
                "done.invoke.my-promise",
                to("success").action(assign(|ctx: &FetchCtx, ev: &Event| FetchCtx {
                    request: ctx.request.clone(),
                    response: ev.data.as_str().map(str::to_string),
                })),
            )
            .on("error.execution", to("failure"))
        })
        .state("success", |s| s.final_state())
        .state("failure", |s| s)
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    let final_state = service.run().await.unwrap();
    assert!(final_state.matches("success"));
    assert!(final_state.done);
    assert_eq!(final_state.context.response.as_deref(), Some("response"));
}

#[tokio::test]
async fn promise_rejection_routes_error_execution() {
    let machine = Machine::builder("fetcher", FetchCtx { request: None, response: None })
        .initial("loading")
        .state("loading", |s| {
            s.entry(assign_with(|ctx: &FetchCtx, _, spawner| FetchCtx {
                request: Some(spawner.spawn(ActorSource::promise(async {
                    Err(json!("connection reset"))
                }))),
                response: ctx.response.clone(),
            }))
            .on("error.execution", to("failure"))
        })
        .state("failure", |s| s.final_state())
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    let final_state = service.run().await.unwrap();
    assert!(final_state.matches("failure"));
}

#[derive(Clone, Debug, PartialEq)]
struct OracleCtx {
    oracle: Option<ActorRef>,
    answer: Option<i64>,
}

#[tokio::test]
async fn callback_actor_echoes_through_the_parent_queue() {
    let machine = Machine::builder("seeker", OracleCtx { oracle: None, answer: None })
        .initial("curious")
        .state("curious", |s| {
            s.entry(assign_with(|ctx: &OracleCtx, _, spawner| OracleCtx {
                oracle: Some(spawner.spawn_with(
                    ActorSource::callback(|emitter, receiver| {
                        receiver.on_event(move |event| {
                            if event.name == "ASK" {
                                emitter.send(Event::with_data("ANSWER", json!(42)));
                            }
                        });
                        None
                    }),
                    SpawnOptions::named("oracle"),
                )),
                answer: ctx.answer.clone(),
            }))
            .on("POKE", stay().internal().action(send("ASK").to_child("oracle")))
            .on(
                "ANSWER",
                stay().internal().action(assign(|ctx: &OracleCtx, ev: &Event| OracleCtx {
                    oracle: ctx.oracle.clone(),
                    answer: ev.data.as_i64(),
                })),
            )
        })
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    service.send("POKE").unwrap();
    assert_eq!(service.state().context.answer, Some(42));
}

#[derive(Clone, Debug, PartialEq)]
struct TickCtx {
    ticker: Option<ActorRef>,
    ticks: u32,
}

#[tokio::test]
async fn observable_emissions_are_enqueued_on_the_parent() {
    let machine = Machine::builder("watcher", TickCtx { ticker: None, ticks: 0 })
        .initial("watching")
        .state("watching", |s| {
            s.entry(assign_with(|ctx: &TickCtx, _, spawner| TickCtx {
                ticker: Some(spawner.spawn(ActorSource::observable(futures::stream::iter([
                    Event::new("TICK"),
                    Event::new("TICK"),
                    Event::new("TICK"),
                ])))),
                ticks: ctx.ticks,
            }))
            .on(
                "TICK",
                stay().internal().action(assign(|ctx: &TickCtx, _| TickCtx {
                    ticker: ctx.ticker.clone(),
                    ticks: ctx.ticks + 1,
                })),
            )
        })
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    service.run_until_idle().await.unwrap();
    assert_eq!(service.state().context.ticks, 3);
}

#[tokio::test]
async fn sync_children_report_updates_to_the_parent() {
    #[derive(Clone, Debug, PartialEq)]
    struct SyncCtx {
        child: Option<ActorRef>,
        updates: u32,
    }

    let machine = Machine::builder("observer", SyncCtx { child: None, updates: 0 })
        .initial("active")
        .state("active", |s| {
            s.entry(assign_with(|ctx: &SyncCtx, _, spawner| SyncCtx {
                child: Some(spawner.spawn_with(
                    ponger(),
                    SpawnOptions::named("synced").sync().auto_forward(),
                )),
                updates: ctx.updates,
            }))
            .on(
                statechart::event::UPDATE_EVENT,
                stay().internal().action(assign(|ctx: &SyncCtx, _| SyncCtx {
                    child: ctx.child.clone(),
                    updates: ctx.updates + 1,
                })),
            )
        })
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    service.send("PING").unwrap();
    // The forwarded PING made the child transition; sync children report
    // progress as xstate.update events.
    assert!(service.state().context.updates >= 1);
}

#[test]
fn spawn_outside_a_live_interpreter_yields_a_null_actor() {
    let machine = Machine::builder("loner", FetchCtx { request: None, response: None })
        .initial("loading")
        .state("loading", |s| {
            s.entry(assign_with(|ctx: &FetchCtx, _, spawner| FetchCtx {
                request: Some(spawner.spawn_with(
                    ActorSource::promise(async { Ok(json!(1)) }),
                    SpawnOptions::named("dormant"),
                )),
                response: ctx.response.clone(),
            }))
        })
        .build()
        .unwrap();

    // Reading the initial state spawns nothing: the ref is a callable no-op.
    let initial = machine.initial_state().unwrap();
    let actor = initial.context.request.clone().unwrap();
    assert_eq!(actor.id(), "dormant");
    actor.send("PING");

    // Reading it again does not re-run the entry assign.
    let again = machine.initial_state().unwrap();
    assert_eq!(
        again.context.request.as_ref().unwrap(),
        initial.context.request.as_ref().unwrap()
    );
}

#[tokio::test]
async fn actors_stop_when_their_owning_state_exits() {
    let stopped = Arc::new(AtomicBool::new(false));
    let stopped_probe = Arc::clone(&stopped);

    #[derive(Clone, Debug, PartialEq)]
    struct RoomCtx {
        worker: Option<ActorRef>,
    }

    let machine = Machine::builder("room", RoomCtx { worker: None })
        .initial("occupied")
        .state("occupied", |s| {
            s.entry(assign_with(move |_, _, spawner| {
                let flag = Arc::clone(&stopped_probe);
                RoomCtx {
                    worker: Some(spawner.spawn_with(
                        ActorSource::callback(move |_, _| {
                            Some(Box::new(move || flag.store(true, Ordering::SeqCst)))
                        }),
                        SpawnOptions::named("lamp"),
                    )),
                }
            }))
            .on("LEAVE", to("empty"))
        })
        .state("empty", |s| s)
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    assert!(!stopped.load(Ordering::SeqCst));
    service.send("LEAVE").unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    assert!(service.state().matches("empty"));
}

#[tokio::test]
async fn child_machine_completion_reports_done_invoke() {
    #[derive(Clone, Debug, PartialEq)]
    struct BossCtx {
        worker: Option<ActorRef>,
    }

    let machine = Machine::builder("boss", BossCtx { worker: None })
        .initial("delegating")
        .state("delegating", |s| {
            s.entry(assign_with(move |_, _, spawner| BossCtx {
                worker: Some(spawner.spawn_with(
                    Machine::builder("one-shot", ())
                        .initial("working")
                        .state("working", |w| w.on("FINISH", to("finished")))
                        .state("finished", |w| w.final_state())
                        .build()
                        .unwrap(),
                    SpawnOptions::named("worker"),
                )),
            }))
            .on("DELEGATE", stay().internal().action(send("FINISH").to_child("worker")))
            .on("done.invoke.worker", to("satisfied"))
        })
        .state("satisfied", |s| s.final_state())
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    service.send("DELEGATE").unwrap();
    assert!(service.state().matches("satisfied"));
    assert!(service.state().done);
}

#[tokio::test]
async fn guarded_transitions_also_see_actor_replies() {
    // A child emission and a guard together: the reply's payload decides.
    #[derive(Clone, Debug, PartialEq)]
    struct JudgeCtx {
        scorer: Option<ActorRef>,
    }

    let machine = Machine::builder("judge", JudgeCtx { scorer: None })
        .initial("waiting")
        .state("waiting", |s| {
            s.entry(assign_with(|_, _, spawner| JudgeCtx {
                scorer: Some(spawner.spawn_with(
                    ActorSource::callback(|emitter, receiver| {
                        receiver.on_event(move |event| {
                            let doubled = event.data.as_i64().unwrap_or(0) * 2;
                            emitter.send(Event::with_data("SCORED", json!(doubled)));
                        });
                        None
                    }),
                    SpawnOptions::named("scorer"),
                )),
            }))
            .on(
                "SCORED",
                TransitionConfig::to("accepted")
                    .when(|_, ev: &Event| ev.data.as_i64().unwrap_or(0) >= 10),
            )
            .on("SCORED", to("rejected"))
        })
        .state("accepted", |s| s)
        .state("rejected", |s| s)
        .build()
        .unwrap();

    let mut service = interpret(machine).unwrap();
    service.start().unwrap();
    let scorer = service.state().context.scorer.clone().unwrap();
    scorer.send(Event::with_data("SCORE", json!(6)));
    service.run_until_idle().await.unwrap();
    assert!(service.state().matches("accepted"));
}
