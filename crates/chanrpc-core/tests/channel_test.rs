//! End-to-end tests for channels.
//!
//! A page and a frame each get a `Runtime`, joined by the loopback transport
//! and driven by one deterministic `EventLoop`. The frame plays the child.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use chanrpc_core::{
    connect, Call, Channel, ChannelConfig, ChannelError, ContextId, EventLoop, HandlerError,
    LoopbackContext, Message, RemoteError, Role, Runtime, Transaction, Value,
};

const PAGE: &str = "https://page.example";
const FRAME: &str = "https://frame.example";

struct Harness {
    event_loop: Rc<EventLoop>,
    page: Runtime,
    frame: Runtime,
    to_frame: Rc<LoopbackContext>,
    to_page: Rc<LoopbackContext>,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let event_loop = EventLoop::new();
        let page = Runtime::new(ContextId::new(), event_loop.clone());
        let frame = Runtime::new(ContextId::new(), event_loop.clone());
        let (to_frame, to_page) = connect(&page, PAGE, &frame, FRAME);
        Self {
            event_loop,
            page,
            frame,
            to_frame,
            to_page,
        }
    }

    fn page_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.to_frame.clone(), FRAME)
    }

    fn frame_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.to_page.clone(), PAGE).with_role(Role::Child)
    }

    /// Build a parent channel in the page and a child channel in the frame,
    /// without running the handshake.
    fn build(&self) -> (Channel, Channel) {
        let page = self.page.build(self.page_config()).unwrap();
        let frame = self.frame.build(self.frame_config()).unwrap();
        (page, frame)
    }

    /// Build both channels and complete the handshake.
    fn ready(&self) -> (Channel, Channel) {
        let (page, frame) = self.build();
        self.run();
        assert!(page.is_ready() && frame.is_ready());
        (page, frame)
    }

    fn run(&self) {
        self.event_loop.run_until_idle();
    }
}

type Log<T> = Rc<RefCell<Vec<T>>>;

fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

/// Records the id of every request a channel posts.
fn request_ids(config: ChannelConfig) -> (ChannelConfig, Log<u64>) {
    let ids = log();
    let sink = ids.clone();
    let config = config.on_post_message(move |_, message| {
        if let Message::Request { id, .. } = message {
            sink.borrow_mut().push(*id);
        }
        Ok(())
    });
    (config, ids)
}

#[test]
fn test_handshake_marks_both_sides_ready() {
    let h = Harness::new();
    let (page, frame) = h.build();
    assert!(!page.is_ready());
    assert!(!frame.is_ready());

    h.run();

    assert!(page.is_ready());
    assert!(frame.is_ready());
    // The page answered the ping; the frame's ping was answered.
    assert!(page.debug_id().ends_with("-R"));
    assert!(frame.debug_id().ends_with("-L"));
}

#[test]
fn test_ready_observers_fire_once() {
    let h = Harness::new();
    let fired = log();
    let (page_fired, frame_fired) = (fired.clone(), fired.clone());
    let _page = h
        .page
        .build(h.page_config().on_ready(move |_| page_fired.borrow_mut().push("page")))
        .unwrap();
    let _frame = h
        .frame
        .build(h.frame_config().on_ready(move |_| frame_fired.borrow_mut().push("frame")))
        .unwrap();
    h.run();
    assert_eq!(*fired.borrow(), vec!["page", "frame"]);
}

#[test]
fn test_round_trip() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    frame
        .bind("double", |_, params| {
            Ok(Value::from(params.as_i64().unwrap_or_default() * 2))
        })
        .unwrap();

    let results = log();
    let sink = results.clone();
    page.call(
        Call::new("double")
            .params(21)
            .success(move |result| sink.borrow_mut().push(result)),
    )
    .unwrap();
    assert_eq!(page.outstanding(), 1);

    h.run();

    let results = results.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().and_then(Value::as_i64), Some(42));
    assert_eq!(page.outstanding(), 0);
    assert_eq!(frame.open(), 0);
    assert_eq!(h.page.outstanding_transactions(), 0);
}

#[test]
fn test_absent_result_is_none() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    frame.bind("nothing", |_, _| Ok(Value::callback(|_| {}))).unwrap();

    let results = log();
    let sink = results.clone();
    page.call(Call::new("nothing").success(move |result| sink.borrow_mut().push(result)))
        .unwrap();
    h.run();
    assert_eq!(*results.borrow(), vec![None]);
}

#[test]
fn test_delayed_return_completes_later() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    let held: Rc<RefCell<Option<Transaction>>> = Rc::new(RefCell::new(None));
    let slot = held.clone();
    frame
        .bind("slow", move |invocation, _| {
            let transaction = invocation.transaction().cloned().ok_or("not a request")?;
            assert!(transaction.delay_return(true));
            *slot.borrow_mut() = Some(transaction);
            Ok(Value::from("ignored"))
        })
        .unwrap();

    let results = log();
    let sink = results.clone();
    page.call(Call::new("slow").success(move |result| sink.borrow_mut().push(result)))
        .unwrap();
    h.run();
    assert!(results.borrow().is_empty());
    assert_eq!(frame.open(), 1);

    let transaction = held.borrow_mut().take().unwrap();
    transaction.complete("done").unwrap();
    assert!(matches!(
        transaction.complete("again"),
        Err(ChannelError::StaleTransaction(_))
    ));
    assert!(matches!(
        transaction.error("late", "too late"),
        Err(ChannelError::StaleTransaction(_))
    ));
    h.run();

    let results = results.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().and_then(Value::as_str), Some("done"));
    assert_eq!(frame.open(), 0);
}

#[test]
fn test_handler_error_pair_reaches_caller() {
    let h = Harness::new();
    let page = h.page.build(h.page_config()).unwrap();
    let wire = log();
    let sink = wire.clone();
    let frame = h
        .frame
        .build(h.frame_config().on_post_message(move |_, message| {
            if let Message::Error { error, message, .. } = message {
                sink.borrow_mut().push((error.clone(), message.clone()));
            }
            Ok(())
        }))
        .unwrap();
    h.run();
    frame
        .bind("validate", |_, _| Err(HandlerError::from(("bad_input", "explain"))))
        .unwrap();

    let errors = log();
    let sink = errors.clone();
    page.call(
        Call::new("validate")
            .success(|_| panic!("unexpected success"))
            .error(move |err| sink.borrow_mut().push(err)),
    )
    .unwrap();
    h.run();

    assert_eq!(
        *wire.borrow(),
        vec![("bad_input".to_string(), Some("explain".to_string()))]
    );
    assert_eq!(*errors.borrow(), vec![RemoteError::new("bad_input", "explain")]);
    assert_eq!(page.outstanding(), 0);
}

#[test]
fn test_raised_string_is_runtime_error() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    frame.bind("fail", |_, _| Err("boom".into())).unwrap();

    let errors = log();
    let sink = errors.clone();
    page.call(
        Call::new("fail")
            .success(|_| panic!("unexpected success"))
            .error(move |err| sink.borrow_mut().push(err)),
    )
    .unwrap();
    h.run();
    assert_eq!(*errors.borrow(), vec![RemoteError::new("runtime_error", "boom")]);
}

#[test]
fn test_progress_callback_is_forwarded() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    frame
        .bind("work", |_, params| {
            let progress = params
                .get("onProgress")
                .and_then(Value::as_callback)
                .cloned()
                .ok_or("no progress callback")?;
            progress.invoke(50)?;
            progress.invoke(100)?;
            Ok(Value::from(params.get("job").cloned().unwrap_or_default()))
        })
        .unwrap();

    let progress = log();
    let results = log();
    let (progress_sink, result_sink) = (progress.clone(), results.clone());
    page.call(
        Call::new("work")
            .params(Value::object([
                ("job", Value::from("build")),
                (
                    "onProgress",
                    Value::callback(move |p| {
                        progress_sink.borrow_mut().push(p.as_i64().unwrap_or(-1))
                    }),
                ),
            ]))
            .success(move |result| result_sink.borrow_mut().push(result)),
    )
    .unwrap();
    h.run();

    assert_eq!(*progress.borrow(), vec![50, 100]);
    assert_eq!(
        results.borrow()[0].as_ref().and_then(Value::as_str),
        Some("build")
    );
}

#[test]
fn test_callbacks_after_completion_are_stale() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    let stubs = log();
    let sink = stubs.clone();
    frame
        .bind("keep", move |_, params| {
            if let Some(cb) = params.pointer("handlers/0").and_then(Value::as_callback) {
                sink.borrow_mut().push(cb.clone());
            }
            Ok(Value::Null)
        })
        .unwrap();

    page.call(
        Call::new("keep")
            .params(Value::object([(
                "handlers",
                Value::Array(vec![Value::callback(|_| {}), Value::from(1)]),
            )]))
            .success(|_| {}),
    )
    .unwrap();
    h.run();

    let stub = stubs.borrow()[0].clone();
    assert_eq!(stub.path(), Some("handlers/0"));
    assert!(matches!(
        stub.invoke(1),
        Err(ChannelError::StaleTransaction(_))
    ));
}

#[test]
fn test_undeclared_callback_is_rejected() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    let outcome = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    frame
        .bind("m", move |invocation, _| {
            let transaction = invocation.transaction().ok_or("not a request")?;
            *sink.borrow_mut() = Some(transaction.invoke("nope", 1));
            Ok(Value::Null)
        })
        .unwrap();
    page.call(Call::new("m").success(|_| {})).unwrap();
    h.run();
    assert!(matches!(
        outcome.borrow().as_ref(),
        Some(Err(ChannelError::UnknownCallback(name))) if name == "nope"
    ));
}

#[test]
fn test_out_of_range_callback_index_is_skipped() {
    let h = Harness::new();
    let (_page, frame) = h.ready();
    let lengths = log();
    let sink = lengths.clone();
    frame
        .bind("m", move |_, params| {
            let len = params.get("list").and_then(Value::as_array).map(Vec::len);
            sink.borrow_mut().push(len);
            Ok(Value::Null)
        })
        .unwrap();

    for (id, index) in [(7, "18446744073709551615"), (8, "1099511627776")] {
        let payload = format!(
            r#"{{"id": {}, "method": "m", "params": {{"list": []}}, "callbacks": ["list/{}"]}}"#,
            id, index
        );
        h.frame
            .deliver(&payload, h.page.local_context(), PAGE)
            .unwrap();
    }
    assert_eq!(*lengths.borrow(), vec![Some(0), Some(0)]);
}

#[test]
fn test_unknown_callback_invocation_is_dropped() {
    let h = Harness::new();
    let (config, ids) = request_ids(h.page_config());
    let page = h.page.build(config).unwrap();
    let _frame = h.frame.build(h.frame_config()).unwrap();
    h.run();

    let invoked = Rc::new(Cell::new(0));
    let sink = invoked.clone();
    page.call(
        Call::new("hold")
            .params(Value::object([(
                "cb",
                Value::callback(move |_| sink.set(sink.get() + 1)),
            )]))
            .success(|_| {}),
    )
    .unwrap();
    h.run();
    let id = ids.borrow()[0];

    let wrong_path = format!(r#"{{"id": {}, "callback": "nope", "params": 1}}"#, id);
    let wrong_id = format!(
        r#"{{"id": {}, "callback": "cb", "params": 1}}"#,
        id.wrapping_add(1)
    );
    for payload in [wrong_path, wrong_id] {
        h.page
            .deliver(&payload, h.frame.local_context(), FRAME)
            .unwrap();
    }
    assert_eq!(invoked.get(), 0);
    assert_eq!(page.outstanding(), 1);

    // The declared path on the live id still reaches the callback.
    let declared = format!(r#"{{"id": {}, "callback": "cb", "params": 1}}"#, id);
    h.page
        .deliver(&declared, h.frame.local_context(), FRAME)
        .unwrap();
    assert_eq!(invoked.get(), 1);
}

#[test]
fn test_timeout_then_late_response_is_ignored() {
    let h = Harness::new();
    let (config, ids) = request_ids(h.page_config());
    let page = h.page.build(config).unwrap();
    let _frame = h.frame.build(h.frame_config()).unwrap();
    h.run();

    let successes = Rc::new(Cell::new(0));
    let errors = log();
    let (success_sink, error_sink) = (successes.clone(), errors.clone());
    page.call(
        Call::new("never")
            .timeout(Duration::from_millis(10))
            .success(move |_| success_sink.set(success_sink.get() + 1))
            .error(move |err| error_sink.borrow_mut().push(err)),
    )
    .unwrap();
    h.run();
    assert!(errors.borrow().is_empty());

    h.event_loop.advance(Duration::from_millis(10));
    {
        let errors = errors.borrow();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_timeout());
        assert_eq!(
            errors[0].message.as_deref(),
            Some("timeout (10ms) exceeded on method 'never'")
        );
    }
    assert_eq!(page.outstanding(), 0);
    assert_eq!(h.page.outstanding_transactions(), 0);

    let id = ids.borrow()[0];
    let late = format!(r#"{{"id": {}, "result": "late"}}"#, id);
    h.page
        .deliver(&late, h.frame.local_context(), FRAME)
        .unwrap();
    h.event_loop.advance(Duration::from_millis(100));
    assert_eq!(successes.get(), 0);
    assert_eq!(errors.borrow().len(), 1);
}

#[test]
fn test_default_timeout_applies() {
    let h = Harness::new();
    let page = h
        .page
        .build(h.page_config().with_default_timeout(Duration::from_millis(25)))
        .unwrap();
    let _frame = h.frame.build(h.frame_config()).unwrap();
    h.run();

    let errors = log();
    let sink = errors.clone();
    page.call(
        Call::new("never")
            .success(|_| {})
            .error(move |err| sink.borrow_mut().push(err.code)),
    )
    .unwrap();
    h.event_loop.advance(Duration::from_millis(24));
    assert!(errors.borrow().is_empty());
    h.event_loop.advance(Duration::from_millis(1));
    assert_eq!(*errors.borrow(), vec!["timeout_error".to_string()]);
}

#[test]
fn test_overlapping_binding_is_rejected() {
    let h = Harness::new();
    let _wildcard = h
        .page
        .build(ChannelConfig::new(h.to_frame.clone(), "*").with_scope("a"))
        .unwrap();
    let err = h
        .page
        .build(ChannelConfig::new(h.to_frame.clone(), "http://x.com").with_scope("a"))
        .unwrap_err();
    assert!(matches!(err, ChannelError::DuplicateBinding { .. }));

    // A different scope does not overlap.
    h.page
        .build(ChannelConfig::new(h.to_frame.clone(), "http://x.com").with_scope("b"))
        .unwrap();
}

#[test]
fn test_destroy_with_call_in_flight_leaves_no_residue() {
    let h = Harness::new();
    let (config, ids) = request_ids(h.page_config());
    let page = h.page.build(config).unwrap();
    // Keeps the page listening after `page` is gone.
    let _other = h
        .page
        .build(h.page_config().with_scope("other"))
        .unwrap();
    let frame = h.frame.build(h.frame_config()).unwrap();
    h.run();
    frame.bind("m", |_, _| Ok(Value::from(1))).unwrap();

    let successes = Rc::new(Cell::new(0));
    let sink = successes.clone();
    page.call(Call::new("m").success(move |_| sink.set(sink.get() + 1)))
        .unwrap();
    page.destroy();
    assert_eq!(h.page.outstanding_transactions(), 0);

    h.run();
    let id = ids.borrow()[0];
    h.page
        .deliver(
            &format!(r#"{{"id": {}, "result": 2}}"#, id),
            h.frame.local_context(),
            FRAME,
        )
        .unwrap();
    assert_eq!(successes.get(), 0);
    assert!(h.page.is_listening());
}

#[test]
fn test_ids_are_unique_across_channels() {
    let h = Harness::new();
    let (config_a, ids_a) = request_ids(h.page_config().with_scope("a"));
    let (config_b, ids_b) = request_ids(h.page_config().with_scope("b"));
    let a = h.page.build(config_a).unwrap();
    let b = h.page.build(config_b).unwrap();
    let _frame_a = h.frame.build(h.frame_config().with_scope("a")).unwrap();
    let _frame_b = h.frame.build(h.frame_config().with_scope("b")).unwrap();
    h.run();

    for _ in 0..3 {
        a.call(Call::new("m").success(|_| {})).unwrap();
        b.call(Call::new("m").success(|_| {})).unwrap();
    }
    let mut all: Vec<u64> = ids_a.borrow().iter().chain(ids_b.borrow().iter()).copied().collect();
    assert_eq!(all.len(), 6);
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 6);
    assert_eq!(h.page.outstanding_transactions(), 6);
}

#[test]
fn test_queued_messages_flush_most_recent_first() {
    let h = Harness::new();
    let (page, frame) = h.build();
    let seen = log();
    let sink = seen.clone();
    frame
        .bind("log", move |invocation, params| {
            assert!(invocation.is_notification());
            sink.borrow_mut().push(params.as_i64().unwrap_or_default());
            Ok(Value::Null)
        })
        .unwrap();

    for n in 1..=3 {
        page.notify("log", Value::from(n)).unwrap();
    }
    h.run();
    assert_eq!(*seen.borrow(), vec![3, 2, 1]);
}

#[test]
fn test_scopes_route_independently() {
    let h = Harness::new();
    let pages: Vec<Channel> = ["a", "b"]
        .iter()
        .map(|s| h.page.build(h.page_config().with_scope(*s)).unwrap())
        .collect();
    let frames: Vec<Channel> = ["a", "b"]
        .iter()
        .map(|s| h.frame.build(h.frame_config().with_scope(*s)).unwrap())
        .collect();
    h.run();
    for frame in &frames {
        let scope = frame.scope().to_string();
        frame
            .bind("who", move |_, _| Ok(Value::from(scope.as_str())))
            .unwrap();
    }

    let answers = log();
    for page in &pages {
        let sink = answers.clone();
        page.call(Call::new("who").success(move |r| {
            sink.borrow_mut()
                .push(r.and_then(|v| v.as_str().map(str::to_string)))
        }))
        .unwrap();
    }
    h.run();
    assert_eq!(
        *answers.borrow(),
        vec![Some("a".to_string()), Some("b".to_string())]
    );
}

#[test]
fn test_notification_error_propagates_to_dispatcher() {
    let h = Harness::new();
    let (_page, frame) = h.ready();
    frame
        .bind("explode", |_, _| Err(HandlerError::from(("bad", "thing"))))
        .unwrap();

    let err = h
        .frame
        .deliver(r#"{"method": "explode"}"#, h.page.local_context(), PAGE)
        .unwrap_err();
    match err {
        ChannelError::Handler {
            method,
            code,
            message,
        } => {
            assert_eq!(method, "explode");
            assert_eq!(code, "bad");
            assert_eq!(message, "thing");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_unbound_request_gets_no_answer() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    let answered = Rc::new(Cell::new(false));
    let (ok, failed) = (answered.clone(), answered.clone());
    page.call(
        Call::new("missing")
            .success(move |_| ok.set(true))
            .error(move |_| failed.set(true)),
    )
    .unwrap();
    h.run();
    assert!(!answered.get());
    assert_eq!(page.outstanding(), 1);
    assert_eq!(frame.open(), 0);

    // Notifications to unbound methods are dropped as well.
    page.notify("missing", None).unwrap();
    h.run();
}

#[test]
fn test_wrong_sender_origin_is_not_routed() {
    let h = Harness::new();
    let page = h
        .page
        .build(ChannelConfig::new(h.to_frame.clone(), "https://other.example"))
        .unwrap();
    let _frame = h.frame.build(h.frame_config()).unwrap();
    h.run();
    assert!(!page.is_ready());
}

#[test]
fn test_listener_detaches_with_last_channel() {
    let h = Harness::new();
    let (_page, frame) = h.ready();
    let hits = Rc::new(Cell::new(0));
    let sink = hits.clone();
    frame
        .bind("ping", move |_, _| {
            sink.set(sink.get() + 1);
            Ok(Value::Null)
        })
        .unwrap();
    let payload = r#"{"method": "ping"}"#;
    h.frame
        .deliver(payload, h.page.local_context(), PAGE)
        .unwrap();
    assert_eq!(hits.get(), 1);

    frame.destroy();
    assert!(!h.frame.is_listening());
    h.frame
        .deliver(payload, h.page.local_context(), PAGE)
        .unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_handler_may_destroy_its_own_channel() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    let handle = frame.clone();
    frame
        .bind("quit", move |_, _| {
            handle.destroy();
            Ok(Value::from("bye"))
        })
        .unwrap();

    let answered = Rc::new(Cell::new(false));
    let sink = answered.clone();
    page.call(Call::new("quit").success(move |_| sink.set(true)))
        .unwrap();
    h.run();

    assert!(frame.is_destroyed());
    assert!(!answered.get());
    assert_eq!(h.frame.live_channels(), 0);
}

#[test]
fn test_observer_failures_do_not_interrupt_dispatch() {
    let h = Harness::new();
    let page = h
        .page
        .build(
            h.page_config()
                .on_post_message(|_, _| Err(anyhow::anyhow!("post observer down")))
                .on_got_message(|_, _| Err(anyhow::anyhow!("got observer down"))),
        )
        .unwrap();
    let frame = h.frame.build(h.frame_config()).unwrap();
    h.run();
    frame.bind("m", |_, _| Ok(Value::from(true))).unwrap();

    let results = log();
    let sink = results.clone();
    page.call(Call::new("m").success(move |r| sink.borrow_mut().push(r)))
        .unwrap();
    h.run();
    assert_eq!(*results.borrow(), vec![Some(Value::Bool(true))]);
}

#[test]
fn test_closed_transport_drops_traffic() {
    let h = Harness::new();
    let (page, frame) = h.ready();
    frame.bind("m", |_, _| Ok(Value::Null)).unwrap();
    h.to_frame.close();

    let answered = Rc::new(Cell::new(false));
    let sink = answered.clone();
    page.call(Call::new("m").success(move |_| sink.set(true)))
        .unwrap();
    h.run();
    assert!(!answered.get());
    assert_eq!(frame.open(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn test_round_trip_on_tokio() {
    use chanrpc_core::TokioScheduler;

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let scheduler = Rc::new(TokioScheduler);
            let page = Runtime::new(ContextId::new(), scheduler.clone());
            let frame = Runtime::new(ContextId::new(), scheduler);
            let (to_frame, to_page) = connect(&page, PAGE, &frame, FRAME);
            let page_channel = page.build(ChannelConfig::new(to_frame, FRAME)).unwrap();
            let frame_channel = frame
                .build(ChannelConfig::new(to_page, PAGE).with_role(Role::Child))
                .unwrap();
            frame_channel
                .bind("echo", |_, params| Ok(params))
                .unwrap();

            let (tx, rx) = tokio::sync::oneshot::channel();
            page_channel
                .call(
                    Call::new("echo")
                        .params("hello")
                        .success(move |result| {
                            let _ = tx.send(result);
                        }),
                )
                .unwrap();

            let result = tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .expect("no response")
                .expect("sender dropped");
            assert_eq!(result.as_ref().and_then(Value::as_str), Some("hello"));
        })
        .await;
}
