//! Behavioural guarantees of the reactive graph and of resources.

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use spark_reactive::{
    batch, computed, create_resource, effect, flush_animation_frame, flush_microtasks,
    run_until_idle, signal, spawn_local, AbortSignal, RefreshOptions, ReactiveError,
    ResourceOptions,
};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

#[test]
fn writing_the_current_value_notifies_nobody() {
    let values = [0i64, -7, i64::MAX];
    for value in values {
        let s = signal(value);
        let runs = Rc::new(Cell::new(0));
        let (s2, r2) = (s.clone(), runs.clone());
        let _fx = effect(move || {
            let _ = s2.get();
            r2.set(r2.get() + 1);
        });

        s.set(s.peek());
        run_until_idle();
        assert_eq!(runs.get(), 1, "value {value}");
    }
}

#[test]
fn subscriptions_match_the_latest_run() {
    let flag = signal(true);
    let x = signal(0);
    let y = signal(0);
    let runs = Rc::new(Cell::new(0));

    let (f2, x2, y2, r2) = (flag.clone(), x.clone(), y.clone(), runs.clone());
    let fx = effect(move || {
        r2.set(r2.get() + 1);
        if f2.get() {
            let _ = x2.get();
        } else {
            let _ = y2.get();
        }
    });
    assert_eq!((x.subscriber_count(), y.subscriber_count()), (1, 0));

    flag.set(false);
    flush_microtasks();
    assert_eq!((x.subscriber_count(), y.subscriber_count()), (0, 1));
    assert_eq!(fx.dep_count(), 2);

    // x is no longer read: writing it does not re-run the effect
    x.set(5);
    flush_microtasks();
    assert_eq!(runs.get(), 2);

    y.set(1);
    flush_microtasks();
    assert_eq!(runs.get(), 3);
}

#[test]
fn computed_is_consistent_right_after_a_write() {
    let price = signal(10);
    let qty = signal(3);
    let (p2, q2) = (price.clone(), qty.clone());
    let total = computed(move || p2.get() * q2.get());

    assert_eq!(total.get(), 30);
    price.set(11);
    assert_eq!(total.get(), 33);
    batch(|| {
        qty.set(4);
        assert_eq!(total.get(), 44, "consistent inside a batch too");
    });
}

#[test]
fn batch_reruns_an_effect_once_in_one_frame() {
    let a = signal(0);
    let b = signal(0);
    let runs = Rc::new(Cell::new(0));

    let (a2, b2, r2) = (a.clone(), b.clone(), runs.clone());
    let _fx = effect(move || {
        let _ = a2.get() + b2.get();
        r2.set(r2.get() + 1);
    });

    batch(|| {
        a.set(1);
        b.set(2);
    });

    // Batched notifications go to the frame queue, not the microtask queue
    flush_microtasks();
    assert_eq!(runs.get(), 1);
    flush_animation_frame();
    assert_eq!(runs.get(), 2);
}

type Senders = Rc<RefCell<VecDeque<oneshot::Sender<Result<u32, ReactiveError>>>>>;

type Fetch = LocalBoxFuture<'static, Result<u32, ReactiveError>>;

fn gated(calls: Rc<Cell<u32>>, senders: Senders) -> impl Fn(AbortSignal) -> Fetch {
    move |_abort| {
        calls.set(calls.get() + 1);
        let (tx, rx) = oneshot::channel();
        senders.borrow_mut().push_back(tx);
        async move { rx.await.unwrap_or(Err(ReactiveError::Aborted)) }.boxed_local()
    }
}

fn finish(senders: &Senders, result: Result<u32, ReactiveError>) {
    let tx = senders.borrow_mut().pop_front().expect("a pending fetch");
    let _ = tx.send(result);
    run_until_idle();
}

#[test]
fn concurrent_refreshes_issue_one_fetch() {
    let calls = Rc::new(Cell::new(0));
    let senders: Senders = Rc::default();
    let fetcher = gated(calls.clone(), senders.clone());
    let resource = create_resource(fetcher, ResourceOptions::default());
    finish(&senders, Ok(1));

    let done = Rc::new(Cell::new(0));
    for _ in 0..2 {
        let handle = resource.refresh();
        let d = done.clone();
        spawn_local(async move {
            handle.await;
            d.set(d.get() + 1);
        });
    }
    run_until_idle();
    assert_eq!(calls.get(), 2);
    assert_eq!(done.get(), 0);

    finish(&senders, Ok(2));
    assert_eq!(done.get(), 2);
    assert_eq!(resource.data(), Some(2));
}

#[test]
fn forced_refresh_hides_the_aborted_run() {
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let (o1, o2) = (outcomes.clone(), outcomes.clone());
    let options = ResourceOptions::default()
        .on_success(move |v: &u32| o1.borrow_mut().push(format!("ok {v}")))
        .on_error(move |e| o2.borrow_mut().push(format!("err {e}")));

    let calls = Rc::new(Cell::new(0));
    let senders: Senders = Rc::default();
    let resource = create_resource(gated(calls.clone(), senders.clone()), options);

    let _ = resource.refresh_with(RefreshOptions::forced());
    run_until_idle();
    assert_eq!(calls.get(), 2);

    finish(&senders, Err(ReactiveError::msg("stale failure")));
    assert_eq!(resource.error(), None);
    assert!(outcomes.borrow().is_empty());

    finish(&senders, Ok(42));
    assert_eq!(resource.data(), Some(42));
    assert_eq!(resource.error(), None);
    assert_eq!(*outcomes.borrow(), vec![String::from("ok 42")]);
}
