//! Cross-domain runs: metadata cloning, peer satisfaction pushes, task
//! moves, remote block acquisition, and the labelled collective reduction.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use edt_lite_core::{
    CollectiveParams, EdtCreate, EventKind, EventParams, Guid, Hint, HintKind, HintProp, RedOp,
    Runtime, RuntimeConfig, RuntimeError, NULL_GUID,
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

/// Poll until a remote event's metadata has been cloned locally.
async fn wait_cloned(pd: &Arc<edt_lite_core::PolicyDomain>, evt: Guid) -> Guid {
    for _ in 0..200 {
        match pd.event_get(evt) {
            Ok(data) => return data,
            Err(RuntimeError::Pending(_)) => {
                tokio::time::sleep(Duration::from_millis(5)).await
            }
            Err(e) => panic!("unexpected resolution error: {e}"),
        }
    }
    panic!("clone never landed for {evt}");
}

/// A sticky event owned by domain 1 feeds a task on domain 0: the consumer
/// registers on the local replica, the satisfy propagates through M_SAT,
/// and the payload block is fetched across domains.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_sticky_clone_and_satisfy() {
    let mut rt = boot(2, 2).await;
    let pd0 = rt.pd(0);
    let pd1 = rt.pd(1);
    let seen = Arc::new(AtomicU64::new(0));

    // Master copy and payload live on domain 1.
    let evt = pd1.event_create(EventKind::Sticky, true).unwrap();
    let db = pd1.create_local_db(&0xDEAD_BEEFu64.to_le_bytes()).unwrap();

    // Consumer on domain 0; its registration pulls the event's metadata.
    let tpl = {
        let seen = seen.clone();
        pd0.edt_template_create("consumer", 0, 1, move |ctx| {
            let block = ctx.db(0).expect("payload block should be acquired");
            seen.store(
                u64::from_le_bytes(block.read()[..8].try_into().unwrap()),
                Ordering::SeqCst,
            );
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };
    let (consumer, _) = pd0.edt_create(EdtCreate::new(tpl)).unwrap();
    pd0.add_dependence(evt, consumer, 0).unwrap();

    // Wait for the replica, then satisfy through it: the local copy fires
    // immediately and M_SAT carries the payload back to the master.
    let data = wait_cloned(&pd0, evt).await;
    assert!(data.is_uninitialized());
    pd0.event_satisfy(evt, db).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(seen.load(Ordering::SeqCst), 0xDEAD_BEEF);
    // The master observed the satisfaction too.
    assert_eq!(pd1.event_get(evt).unwrap(), db);
}

/// Cloned sticky metadata snapshots round-trip to identity across the
/// serialization boundary.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clone_snapshot_identity() {
    let mut rt = boot(2, 1).await;
    let pd0 = rt.pd(0);
    let pd1 = rt.pd(1);

    let evt = pd1.event_create(EventKind::Sticky, true).unwrap();
    let payload = pd1.create_local_db(&9u64.to_le_bytes()).unwrap();
    pd1.event_satisfy(evt, payload).unwrap();

    // The replica of an already-satisfied event carries the payload in its
    // snapshot; no M_SAT is needed.
    let data = wait_cloned(&pd0, evt).await;
    assert_eq!(data, payload);

    pd0.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}

/// M_DEL cascades destruction along the peer list.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_cascades_to_replicas() {
    let mut rt = boot(2, 1).await;
    let pd0 = rt.pd(0);
    let pd1 = rt.pd(1);

    let evt = pd1.event_create(EventKind::Sticky, true).unwrap();
    wait_cloned(&pd0, evt).await;
    // Let the replica's M_REG land before destroying.
    tokio::time::sleep(Duration::from_millis(50)).await;

    pd1.event_destroy(evt).unwrap();
    for _ in 0..200 {
        if pd0.guid_provider.lookup(evt).is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(
        pd0.guid_provider.lookup(evt).is_none(),
        "replica should be torn down by M_DEL"
    );

    pd0.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}

/// An affinity hint naming a remote domain moves the task: it executes on
/// the destination's workers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn move_follows_affinity_hint() {
    let mut rt = boot(2, 2).await;
    let pd0 = rt.pd(0);
    let ran_at = Arc::new(AtomicU32::new(u32::MAX));

    let tpl = {
        let ran_at = ran_at.clone();
        pd0.edt_template_create("roamer", 0, 0, move |ctx| {
            ran_at.store(u32::from(ctx.pd().location()), Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };

    let mut hint = Hint::new(HintKind::Edt);
    hint.set(HintProp::EdtAffinity, pd0.affinity_at(1).unwrap().0)
        .unwrap();
    pd0.edt_create(EdtCreate::new(tpl).hint(hint)).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(ran_at.load(Ordering::SeqCst), 1, "task should run on domain 1");
}

/// A template created on one domain is cloned on demand when another
/// domain instantiates from it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_template_clones_on_demand() {
    let mut rt = boot(2, 2).await;
    let pd0 = rt.pd(0);
    let pd1 = rt.pd(1);
    let ran_at = Arc::new(AtomicU32::new(u32::MAX));

    let tpl = {
        let ran_at = ran_at.clone();
        pd0.edt_template_create("shared", 0, 0, move |ctx| {
            ran_at.store(u32::from(ctx.pd().location()), Ordering::SeqCst);
            ctx.pd().shutdown(0);
            NULL_GUID
        })
        .unwrap()
    };

    // The create parks on the template proxy and replays once the clone
    // lands; the task itself runs on domain 1.
    pd1.edt_create(EdtCreate::new(tpl)).unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(ran_at.load(Ordering::SeqCst), 1);
}

/// Scenario 6: labelled u64-add reduction across four domains; every
/// domain contributes its rank and every consumer observes the same sum.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collective_sum_across_four_domains() {
    let mut rt = boot(4, 2).await;
    let params = EventParams::Collective(CollectiveParams {
        arity: 2,
        max_gen: 2,
        nb_datum: 1,
        nb_contribs: 4,
        nb_contribs_pd: 1,
        op: RedOp::u64_add(),
    });

    // Deferred creation: every domain races to materialise its tree node.
    let mut evts = Vec::new();
    for p in 0..4 {
        let evt = rt
            .pd(p)
            .event_create_labelled("rank-sum", EventKind::Collective, Some(params.clone()))
            .unwrap();
        evts.push(evt);
    }
    assert!(evts.windows(2).all(|w| w[0] == w[1]), "one guid everywhere");
    let evt = evts[0];

    let results = Arc::new(spin::Mutex::new(vec![0u64; 4]));
    let done = Arc::new(AtomicU32::new(0));
    for p in 0..4u16 {
        let pd = rt.pd(p);
        let results = results.clone();
        let done = done.clone();
        let tpl = pd
            .edt_template_create("consumer", 0, 1, move |ctx| {
                let db = ctx.db(0).expect("reduction result block");
                let sum = u64::from_le_bytes(db.read()[..8].try_into().unwrap());
                results.lock()[usize::from(ctx.pd().location())] = sum;
                if done.fetch_add(1, Ordering::SeqCst) == 3 {
                    ctx.pd().shutdown(0);
                }
                NULL_GUID
            })
            .unwrap();
        let (c, _) = pd.edt_create(EdtCreate::new(tpl)).unwrap();
        pd.add_dependence(evt, c, 0).unwrap();
    }

    // Contributions: rank of each domain.
    for p in 0..4u16 {
        rt.pd(p)
            .event_collective_satisfy_slot(evt, &u64::from(p).to_le_bytes(), 0)
            .unwrap();
    }

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(*results.lock(), vec![6, 6, 6, 6], "0+1+2+3 everywhere");
}

/// Two overlapping generations of the same collective reduce independently.
/// One worker per domain keeps the consumer execution order observable.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn collective_generations_overlap() {
    let mut rt = boot(2, 1).await;
    let params = EventParams::Collective(CollectiveParams {
        arity: 2,
        max_gen: 2,
        nb_datum: 1,
        nb_contribs: 2,
        nb_contribs_pd: 1,
        op: RedOp::u64_add(),
    });
    for p in 0..2 {
        rt.pd(p)
            .event_create_labelled("gen-sum", EventKind::Collective, Some(params.clone()))
            .unwrap();
    }
    let evt = rt
        .pd(0)
        .event_create_labelled("gen-sum", EventKind::Collective, Some(params))
        .unwrap();

    let sums = Arc::new(spin::Mutex::new(Vec::<u64>::new()));
    let done = Arc::new(AtomicU32::new(0));
    let pd0 = rt.pd(0);
    let tpl = {
        let sums = sums.clone();
        let done = done.clone();
        pd0.edt_template_create("consumer", 0, 1, move |ctx| {
            let db = ctx.db(0).unwrap();
            sums.lock()
                .push(u64::from_le_bytes(db.read()[..8].try_into().unwrap()));
            if done.fetch_add(1, Ordering::SeqCst) == 1 {
                ctx.pd().shutdown(0);
            }
            NULL_GUID
        })
        .unwrap()
    };
    // One consumer per generation, registered up front on domain 0.
    for _ in 0..2 {
        let (c, _) = pd0.edt_create(EdtCreate::new(tpl)).unwrap();
        pd0.add_dependence(evt, c, 0).unwrap();
    }

    // Both generations in flight before either completes on domain 1.
    pd0.event_collective_satisfy_slot(evt, &10u64.to_le_bytes(), 0)
        .unwrap();
    pd0.event_collective_satisfy_slot(evt, &20u64.to_le_bytes(), 0)
        .unwrap();
    rt.pd(1)
        .event_collective_satisfy_slot(evt, &1u64.to_le_bytes(), 0)
        .unwrap();
    rt.pd(1)
        .event_collective_satisfy_slot(evt, &2u64.to_le_bytes(), 0)
        .unwrap();

    let code = rt.wait_shutdown().await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(*sums.lock(), vec![11, 22], "generations pair in order");
}

/// Labelled creation races are benign: every caller gets the canonical
/// guid.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn labelled_creation_race_is_benign() {
    let mut rt = boot(2, 1).await;
    let pd0 = rt.pd(0);

    let a = pd0
        .event_create_labelled("shared-sticky", EventKind::Sticky, None)
        .unwrap();
    let b = pd0
        .event_create_labelled("shared-sticky", EventKind::Sticky, None)
        .unwrap();
    assert_eq!(a, b);
    // The non-owner adopts the same guid without materialising a master.
    let c = rt
        .pd(1)
        .event_create_labelled("shared-sticky", EventKind::Sticky, None)
        .unwrap();
    assert_eq!(a, c);

    pd0.shutdown(0);
    assert_eq!(rt.wait_shutdown().await.unwrap(), 0);
}
