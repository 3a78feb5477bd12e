//! End-to-end dataflow runs through the runtime harness: boot the platform,
//! build a graph through the public operation surface, let the workers chew
//! through it, shut down, and assert on what executed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use edt_lite_core::datablock::DbProps;
use edt_lite_core::event::LATCH_DECR_SLOT;
use edt_lite_core::msg::Payload;
use edt_lite_core::{
    DbAccessMode, EdtCreate, EdtProps, EventKind, EventParams, Runtime, RuntimeConfig,
    RuntimeError, NULL_GUID,
};

async fn boot(pds: u16, workers: u32) -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::boot(RuntimeConfig::multi(pds, workers))
        .await
        .unwrap()
}

/// Scenario 1: a zero-param zero-dep task runs once, shutdown returns 0.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hello_runs_once() {
    let mut rt = boot(1, 2).await;
    let ran = Arc::new(AtomicU32::new(0));

    {
        let ran = ran.clone();
        rt.spawn_main(move |ctx| {
            ran.fetch_add(1, Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap();
    }

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

/// Scenario 2: sticky chain — A depends on E, B satisfies E; A runs exactly
/// once, after B.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sticky_chain_of_two() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let log = Arc::new(spin::Mutex::new(Vec::<&'static str>::new()));

    let evt = pd.event_create(EventKind::Sticky, true).unwrap();

    let tpl_a = {
        let log = log.clone();
        pd.edt_template_create("a", 0, 1, move |ctx| {
            log.lock().push("a");
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (a, _) = pd.edt_create(EdtCreate::new(tpl_a)).unwrap();
    pd.add_dependence(evt, a, 0).unwrap();

    let tpl_b = {
        let log = log.clone();
        pd.edt_template_create("b", 0, 0, move |ctx| {
            log.lock().push("b");
            ctx.pd().event_satisfy(evt, NULL_GUID).unwrap();
            NULL_GUID
        })
        .unwrap()
    };
    pd.edt_create(EdtCreate::new(tpl_b)).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(*log.lock(), vec!["b", "a"]);
}

/// Scenario 3: a FINISH-scope parent spawns three children; the output
/// event fires only after all three reap, and triggers the shutdown task.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finish_scope_with_three_children() {
    let mut rt = boot(1, 3).await;
    let pd = rt.pd(0);
    let children_done = Arc::new(AtomicU32::new(0));
    let seen_at_fire = Arc::new(AtomicU32::new(u32::MAX));

    let child_tpl = {
        let children_done = children_done.clone();
        pd.edt_template_create("child", 0, 0, move |_ctx| {
            children_done.fetch_add(1, Ordering::SeqCst);
            NULL_GUID
        })
        .unwrap()
    };

    let parent_tpl = {
        pd.edt_template_create("parent", 0, 1, move |ctx| {
            for _ in 0..3 {
                ctx.pd()
                    .edt_create(EdtCreate::new(child_tpl).props(EdtProps::default()))
                    .unwrap();
            }
            NULL_GUID
        })
        .unwrap()
    };

    // Hold the parent on one control slot so the output event can be wired
    // before anything fires.
    let (parent, out) = pd
        .edt_create(
            EdtCreate::new(parent_tpl)
                .depc(1)
                .props(EdtProps::FINISH | EdtProps::OEVT_VALID),
        )
        .unwrap();
    assert!(!out.is_null());

    let after_tpl = {
        let children_done = children_done.clone();
        let seen_at_fire = seen_at_fire.clone();
        pd.edt_template_create("after", 0, 1, move |ctx| {
            seen_at_fire.store(children_done.load(Ordering::SeqCst), Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (after, _) = pd.edt_create(EdtCreate::new(after_tpl)).unwrap();
    pd.add_dependence(out, after, 0).unwrap();

    // Release the parent.
    pd.add_dependence(NULL_GUID, parent, 0).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(
        seen_at_fire.load(Ordering::SeqCst),
        3,
        "output event fired before the finish scope drained"
    );
}

/// Scenario 4: a counted event with nb_deps = 4 feeds four consumers off
/// one producer satisfy, then self-destroys.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counted_broadcast_of_four() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let ran = Arc::new(AtomicU32::new(0));

    let evt = pd
        .event_create_params(EventKind::Counted, EventParams::Counted { nb_deps: 4 })
        .unwrap();

    let tpl = {
        let ran = ran.clone();
        pd.edt_template_create("consumer", 0, 1, move |ctx| {
            if ran.fetch_add(1, Ordering::SeqCst) == 3 {
                ctx.pd().shutdown(0);
            }
            NULL_GUID
        })
        .unwrap()
    };
    for _ in 0..4 {
        let (c, _) = pd.edt_create(EdtCreate::new(tpl)).unwrap();
        pd.add_dependence(evt, c, 0).unwrap();
    }

    pd.event_satisfy(evt, NULL_GUID).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    // All registrations drained: the event destroyed itself.
    assert!(pd.guid_provider.lookup(evt).is_none());
}

/// Scenario 5: channel FIFO — ten producer satisfies pair with ten consumer
/// registrations in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_fifo_of_ten() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let order = Arc::new(spin::Mutex::new(Vec::<u64>::new()));

    let ch = pd
        .event_create_params(
            EventKind::Channel,
            EventParams::Channel {
                max_gen: 1,
                nb_sat: 1,
                nb_deps: 1,
            },
        )
        .unwrap();

    let tpl = {
        let order = order.clone();
        pd.edt_template_create("consumer", 0, 1, move |ctx| {
            let db = ctx.db(0).expect("channel payload should be a block");
            let value = u64::from_le_bytes(db.read()[..8].try_into().unwrap());
            let mut o = order.lock();
            o.push(value);
            if o.len() == 10 {
                ctx.pd().shutdown(0);
            }
            NULL_GUID
        })
        .unwrap()
    };

    for i in 0..10u64 {
        let db = pd.create_local_db(&i.to_le_bytes()).unwrap();
        pd.event_satisfy(ch, db).unwrap();
        let (c, _) = pd.edt_create(EdtCreate::new(tpl)).unwrap();
        pd.add_dependence(ch, c, 0).unwrap();
    }

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(*order.lock(), (0..10).collect::<Vec<u64>>());
}

/// A bounded channel applies back-pressure once a full generation of
/// satisfies is queued.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_bounded_backpressure() {
    let mut rt = boot(1, 1).await;
    let pd = rt.pd(0);
    let ch = pd
        .event_create_params(
            EventKind::Channel,
            EventParams::Channel {
                max_gen: 1,
                nb_sat: 1,
                nb_deps: 1,
            },
        )
        .unwrap();
    pd.event_satisfy(ch, NULL_GUID).unwrap();
    let second = pd.event_satisfy(ch, NULL_GUID);
    assert!(matches!(second, Err(RuntimeError::Busy(_))));

    pd.shutdown(0);
    rt.wait_shutdown().await.unwrap();
}

/// Deferred calls replay after the function returns; non-deferrable
/// operations are rejected with E_PERM at capture time.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deferred_satisfy_replays_after_return() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let db_create_refused = Arc::new(AtomicBool::new(false));
    let consumer_ran = Arc::new(AtomicBool::new(false));

    let evt = pd.event_create(EventKind::Sticky, true).unwrap();

    let consumer_tpl = {
        let consumer_ran = consumer_ran.clone();
        pd.edt_template_create("consumer", 0, 1, move |ctx| {
            consumer_ran.store(true, Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (consumer, _) = pd.edt_create(EdtCreate::new(consumer_tpl)).unwrap();
    pd.add_dependence(evt, consumer, 0).unwrap();

    let main_tpl = {
        let db_create_refused = db_create_refused.clone();
        pd.edt_template_create("producer", 0, 0, move |ctx| {
            let refused = ctx.defer(Payload::DbCreate {
                size: 8,
                props: DbProps::default(),
                hint: None,
                affinity: NULL_GUID,
                guid_out: NULL_GUID,
            });
            db_create_refused.store(
                matches!(refused, Err(RuntimeError::Perm(_))),
                Ordering::SeqCst,
            );
            ctx.defer(Payload::DepSatisfy {
                dest: evt,
                payload: NULL_GUID,
                slot: 0,
            })
            .unwrap();
            NULL_GUID
        })
        .unwrap()
    };
    pd.edt_create(EdtCreate::new(main_tpl)).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert!(consumer_ran.load(Ordering::SeqCst));
    assert!(db_create_refused.load(Ordering::SeqCst));
}

/// A block written under the creator's hold is visible to a later
/// exclusive-writer acquire, which parks until the creator releases.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ew_acquire_parks_until_release() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let seen = Arc::new(AtomicU64::new(0));

    let evt = pd.event_create(EventKind::Sticky, true).unwrap();

    let reader_tpl = {
        let seen = seen.clone();
        pd.edt_template_create("reader", 0, 1, move |ctx| {
            let db = ctx.db(0).unwrap();
            seen.store(
                u64::from_le_bytes(db.read()[..8].try_into().unwrap()),
                Ordering::SeqCst,
            );
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (reader, _) = pd.edt_create(EdtCreate::new(reader_tpl)).unwrap();
    pd.add_dependence_mode(evt, reader, 0, DbAccessMode::Ew)
        .unwrap();

    let writer_tpl = pd
        .edt_template_create("writer", 0, 0, move |ctx| {
            let db = ctx.pd().db_create(8, DbProps::default(), None).unwrap();
            {
                let provider = &ctx.pd().guid_provider;
                let handle = provider.lookup(db).unwrap();
                let block = handle.as_db().unwrap();
                block.write()[..8].copy_from_slice(&0xC0FFEEu64.to_le_bytes());
            }
            // Satisfy while still holding the block RW: the reader's EW
            // acquire must park until the epilogue releases.
            ctx.pd().event_satisfy(evt, db).unwrap();
            NULL_GUID
        })
        .unwrap();
    pd.edt_create(EdtCreate::new(writer_tpl)).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(seen.load(Ordering::SeqCst), 0xC0FFEE);
}

/// Written bytes survive release and reach any later acquirer before the
/// block is destroyed.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn db_round_trip_between_release_and_destroy() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let seen = Arc::new(AtomicU64::new(0));

    let evt = pd.event_create(EventKind::Sticky, true).unwrap();

    let reader_tpl = {
        let seen = seen.clone();
        pd.edt_template_create("reader", 0, 1, move |ctx| {
            let db_guid = ctx.depv[0].guid;
            let db = ctx.db(0).unwrap();
            seen.store(
                u64::from_le_bytes(db.read()[..8].try_into().unwrap()),
                Ordering::SeqCst,
            );
            ctx.pd().db_destroy(db_guid).ok();
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (reader, _) = pd.edt_create(EdtCreate::new(reader_tpl)).unwrap();
    pd.add_dependence_mode(evt, reader, 0, DbAccessMode::Ro)
        .unwrap();

    let writer_tpl = pd
        .edt_template_create("writer", 0, 0, move |ctx| {
            let db = ctx.pd().db_create(8, DbProps::default(), None).unwrap();
            {
                let provider = &ctx.pd().guid_provider;
                let handle = provider.lookup(db).unwrap();
                handle.as_db().unwrap().write()[..8].copy_from_slice(&77u64.to_le_bytes());
            }
            // Explicit early release; the epilogue must not release twice.
            ctx.pd().db_release(db).unwrap();
            ctx.pd().event_satisfy(evt, db).unwrap();
            NULL_GUID
        })
        .unwrap();
    pd.edt_create(EdtCreate::new(writer_tpl)).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(seen.load(Ordering::SeqCst), 77);
}

/// paramc > 0 with an empty paramv is rejected with E_INVAL.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn param_count_mismatch_rejected() {
    let mut rt = boot(1, 1).await;
    let pd = rt.pd(0);
    let tpl = pd
        .edt_template_create("one-param", 1, 0, |_ctx| NULL_GUID)
        .unwrap();
    let err = pd.edt_create(EdtCreate::new(tpl));
    assert!(matches!(err, Err(RuntimeError::Inval(_))));

    // Params flow through to the function.
    let sum = Arc::new(AtomicU64::new(0));
    let tpl2 = {
        let sum = sum.clone();
        pd.edt_template_create("two-param", 2, 0, move |ctx| {
            sum.store(ctx.paramv[0] + ctx.paramv[1], Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    pd.edt_create(EdtCreate::new(tpl2).params(vec![40, 2])).unwrap();
    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(sum.load(Ordering::SeqCst), 42);
}

/// Destroying a CREATED task is legal; a later satisfy of its slots is
/// benign (an error code, not a crash).
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_created_task_then_satisfy_is_benign() {
    let mut rt = boot(1, 1).await;
    let pd = rt.pd(0);
    let tpl = pd
        .edt_template_create("never-runs", 0, 1, |_ctx| NULL_GUID)
        .unwrap();
    let (edt, _) = pd.edt_create(EdtCreate::new(tpl)).unwrap();
    pd.edt_destroy(edt).unwrap();
    assert!(pd.add_dependence(NULL_GUID, edt, 0).is_err());

    pd.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}

/// Latch wiring through the raw satisfy surface: INCR twice, DECR twice,
/// waiters fire on the zero crossing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn latch_fires_at_zero() {
    let mut rt = boot(1, 2).await;
    let pd = rt.pd(0);
    let fired = Arc::new(AtomicBool::new(false));

    let latch = pd
        .event_create_params(EventKind::Latch, EventParams::Latch { counter: 1 })
        .unwrap();
    let tpl = {
        let fired = fired.clone();
        pd.edt_template_create("on-zero", 0, 1, move |ctx| {
            fired.store(true, Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (edt, _) = pd.edt_create(EdtCreate::new(tpl)).unwrap();
    pd.add_dependence(latch, edt, 0).unwrap();

    pd.event_satisfy_slot(latch, NULL_GUID, 0).unwrap(); // counter 2
    pd.event_satisfy_slot(latch, NULL_GUID, LATCH_DECR_SLOT)
        .unwrap(); // counter 1
    assert!(!fired.load(Ordering::SeqCst));
    pd.event_satisfy_slot(latch, NULL_GUID, LATCH_DECR_SLOT)
        .unwrap(); // zero: fires and self-destructs

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert!(fired.load(Ordering::SeqCst));
    assert!(pd.guid_provider.lookup(latch).is_none());
}

/// Idempotent events drop repeat satisfies; sticky events report them.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_double_satisfy_contracts() {
    let mut rt = boot(1, 1).await;
    let pd = rt.pd(0);

    let idem = pd.event_create(EventKind::Idem, true).unwrap();
    let payload = pd.create_local_db(&1u64.to_le_bytes()).unwrap();
    pd.event_satisfy(idem, payload).unwrap();
    pd.event_satisfy(idem, NULL_GUID).unwrap(); // silently dropped
    assert_eq!(pd.event_get(idem).unwrap(), payload);

    let sticky = pd.event_create(EventKind::Sticky, true).unwrap();
    pd.event_satisfy(sticky, payload).unwrap();
    assert!(pd.event_satisfy(sticky, NULL_GUID).is_err());

    pd.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}

/// Priority hints order the default scheduler; statistics and the progress
/// probe observe the run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hints_and_progress_probe() {
    let mut rt = boot(1, 1).await;
    let pd = rt.pd(0);

    let tpl = pd
        .edt_template_create("noop", 0, 0, |_ctx| NULL_GUID)
        .unwrap();
    pd.hint_set_value(tpl, edt_lite_core::HintProp::EdtPriority, 7)
        .unwrap();
    assert_eq!(
        pd.hint_get_value(tpl, edt_lite_core::HintProp::EdtPriority)
            .unwrap(),
        Some(7)
    );
    pd.edt_create(EdtCreate::new(tpl)).unwrap();

    // Give the worker a moment, then probe.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let (edts, msgs) = pd.monitor_progress().unwrap();
    assert!(edts >= 1, "expected at least one executed task, got {edts}");
    assert!(msgs > 0);

    let snap = pd.stats.snapshot();
    assert!(snap.edts_created >= 1);
    assert!(snap.msgs_processed > 0);

    pd.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}

/// Affinity guids name policy domains.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn affinity_guids_name_domains() {
    let mut rt = boot(2, 1).await;
    let pd = rt.pd(0);
    assert_eq!(pd.affinity_count(), 2);
    let a1 = pd.affinity_at(1).unwrap();
    assert_eq!(pd.affinity_location(a1).unwrap(), 1);
    assert_eq!(pd.affinity_location(pd.affinity_current()).unwrap(), 0);
    assert!(pd.affinity_at(2).is_err());

    pd.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}

/// The trace stream captures task lifecycle records when enabled.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trace_stream_captures_run() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut config = RuntimeConfig::single(2);
    config.trace_enabled = true;
    config.system_worker = true;
    let mut rt = Runtime::boot(config).await.unwrap();

    rt.spawn_main(|ctx| {
        ctx.pd().shutdown(0);
        NULL_GUID
    })
    .unwrap();
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);

    let records = rt.trace_records();
    assert!(!records.is_empty(), "trace buffer should have records");
    use edt_lite_core::trace::{TraceAction, TraceType};
    assert!(records
        .iter()
        .any(|r| r.ttype == TraceType::Task && r.action == TraceAction::Create));
    assert!(records
        .iter()
        .any(|r| r.ttype == TraceType::Task && r.action == TraceAction::ExecuteEnd));
}

/// A recursive task graph: fib(n) spawns fib(n-1) and fib(n-2), a combiner
/// joins their result events, and the value flows up through sticky events
/// and data-blocks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recursive_fib_graph() {
    let mut rt = boot(1, 3).await;
    let pd = rt.pd(0);
    let answer = Arc::new(AtomicU64::new(0));

    fn write_result(ctx: &edt_lite_core::EdtContext, result_evt: edt_lite_core::Guid, value: u64) {
        let db = ctx.pd().db_create(8, DbProps::default(), None).unwrap();
        {
            let handle = ctx.pd().guid_provider.lookup(db).unwrap();
            handle.as_db().unwrap().write()[..8].copy_from_slice(&value.to_le_bytes());
        }
        ctx.pd().event_satisfy(result_evt, db).unwrap();
    }

    fn read_u64(ctx: &edt_lite_core::EdtContext, slot: usize) -> u64 {
        let db = ctx.db(slot).expect("operand block");
        u64::from_le_bytes(db.read()[..8].try_into().unwrap())
    }

    // The combiner adds the two operand blocks and fires the result event
    // passed through paramv.
    let sum_tpl = pd
        .edt_template_create("fib-sum", 1, 2, move |ctx| {
            let result_evt = edt_lite_core::Guid(ctx.paramv[0]);
            let total = read_u64(ctx, 0) + read_u64(ctx, 1);
            write_result(ctx, result_evt, total);
            NULL_GUID
        })
        .unwrap();

    // fib(n): paramv = [n, result_event]. The template guid is fed back
    // through the cell so the closure can recurse.
    let fib_tpl_cell = Arc::new(AtomicU64::new(0));
    let fib_tpl = {
        let fib_tpl_cell = fib_tpl_cell.clone();
        pd.edt_template_create("fib", 2, 0, move |ctx| {
            let n = ctx.paramv[0];
            let result_evt = edt_lite_core::Guid(ctx.paramv[1]);
            if n < 2 {
                write_result(ctx, result_evt, n);
                return NULL_GUID;
            }
            let me = edt_lite_core::Guid(fib_tpl_cell.load(Ordering::SeqCst));
            let pd = ctx.pd();
            let r1 = pd.event_create(EventKind::Sticky, true).unwrap();
            let r2 = pd.event_create(EventKind::Sticky, true).unwrap();
            pd.edt_create(
                EdtCreate::new(sum_tpl)
                    .params(vec![result_evt.0])
                    .depv(vec![r1, r2])
                    .props(EdtProps::default()),
            )
            .unwrap();
            pd.edt_create(
                EdtCreate::new(me)
                    .params(vec![n - 1, r1.0])
                    .props(EdtProps::default()),
            )
            .unwrap();
            pd.edt_create(
                EdtCreate::new(me)
                    .params(vec![n - 2, r2.0])
                    .props(EdtProps::default()),
            )
            .unwrap();
            NULL_GUID
        })
        .unwrap()
    };
    fib_tpl_cell.store(fib_tpl.0, Ordering::SeqCst);

    let result = pd.event_create(EventKind::Sticky, true).unwrap();
    let report_tpl = {
        let answer = answer.clone();
        pd.edt_template_create("report", 0, 1, move |ctx| {
            answer.store(read_u64(ctx, 0), Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (report, _) = pd.edt_create(EdtCreate::new(report_tpl)).unwrap();
    pd.add_dependence(result, report, 0).unwrap();

    pd.edt_create(
        EdtCreate::new(fib_tpl)
            .params(vec![10, result.0])
            .props(EdtProps::default()),
    )
    .unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(answer.load(Ordering::SeqCst), 55);
}

/// Shutdown codes propagate to the environment.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_code_propagates() {
    let mut rt = boot(1, 1).await;
    rt.spawn_main(|ctx| {
        ctx.pd().shutdown(17);
        NULL_GUID
    })
    .unwrap();
    assert_eq!(rt.wait_shutdown().await.unwrap(), 17);
}
