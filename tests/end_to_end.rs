//! End-to-end scenarios driving a [`Kernel`] the way a host would: define
//! sources and computations, observe, mutate, and let the scheduler settle.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use reactive_kernel::{
    value, values_equal, BodyOutputs, CellResult, DefinitionStatus, Kernel, ProblemReason, ReactiveModuleOptions,
    VariableId,
};

fn int(v: i64) -> reactive_kernel::DynValue {
    value(v)
}

fn as_i64(v: &reactive_kernel::DynValue) -> i64 {
    *v.as_any().downcast_ref::<i64>().expect("expected an i64 value")
}

fn recording_observer() -> (reactive_kernel::ObserverCallback, Rc<RefCell<Vec<CellResult>>>) {
    let log: Rc<RefCell<Vec<CellResult>>> = Rc::new(RefCell::new(Vec::new()));
    let log2 = Rc::clone(&log);
    let cb: reactive_kernel::ObserverCallback = Rc::new(move |r: &CellResult| log2.borrow_mut().push(r.clone()));
    (cb, log)
}

fn success_values(log: &Rc<RefCell<Vec<CellResult>>>) -> Vec<i64> {
    log.borrow()
        .iter()
        .filter_map(|r| match r {
            CellResult::Success(v) => Some(as_i64(v)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn chain_recomputes_downstream_exactly_once_per_update() {
    let kernel = Kernel::default();
    let x = VariableId::new("x");
    let vy = VariableId::new("vy");
    let vz = VariableId::new("vz");

    kernel.define_source(x.clone(), Some(int(1)));

    let y_runs = Rc::new(RefCell::new(0u32));
    let y_runs2 = Rc::clone(&y_runs);
    kernel.define_computation(
        "Y",
        [x.clone()],
        [vy.clone()],
        Rc::new(move |scope, _cancel| {
            let y_runs = Rc::clone(&y_runs2);
            Box::pin(async move {
                *y_runs.borrow_mut() += 1;
                let x_val = as_i64(&scope.get("x").await?);
                let mut out = BodyOutputs::default();
                out.insert("vy".to_string(), int(x_val + 1));
                Ok(out)
            })
        }),
    );

    let z_runs = Rc::new(RefCell::new(0u32));
    let z_runs2 = Rc::clone(&z_runs);
    kernel.define_computation(
        "Z",
        [vy.clone()],
        [vz.clone()],
        Rc::new(move |scope, _cancel| {
            let z_runs = Rc::clone(&z_runs2);
            Box::pin(async move {
                *z_runs.borrow_mut() += 1;
                let y_val = as_i64(&scope.get("vy").await?);
                let mut out = BodyOutputs::default();
                out.insert("vz".to_string(), int(y_val * 2));
                Ok(out)
            })
        }),
    );

    let (cb, log) = recording_observer();
    kernel.observe(&vz, cb).unwrap();
    kernel.wait_idle().await;
    assert_eq!(success_values(&log), vec![4]);

    kernel.update_source(&x, int(10)).unwrap();
    kernel.wait_idle().await;
    assert_eq!(success_values(&log), vec![4, 22]);

    assert_eq!(*y_runs.borrow(), 2);
    assert_eq!(*z_runs.borrow(), 2);
}

#[tokio::test]
async fn diamond_runs_each_computation_exactly_twice() {
    let kernel = Kernel::default();
    let a = VariableId::new("a");
    let vb = VariableId::new("vb");
    let vc = VariableId::new("vc");
    let vd = VariableId::new("vd");

    kernel.define_source(a.clone(), Some(int(1)));

    let b_runs = Rc::new(RefCell::new(0u32));
    let b_runs2 = Rc::clone(&b_runs);
    kernel.define_computation(
        "B",
        [a.clone()],
        [vb.clone()],
        Rc::new(move |scope, _cancel| {
            let b_runs = Rc::clone(&b_runs2);
            Box::pin(async move {
                *b_runs.borrow_mut() += 1;
                let a_val = as_i64(&scope.get("a").await?);
                let mut out = BodyOutputs::default();
                out.insert("vb".to_string(), int(a_val * 2));
                Ok(out)
            })
        }),
    );

    let c_runs = Rc::new(RefCell::new(0u32));
    let c_runs2 = Rc::clone(&c_runs);
    kernel.define_computation(
        "C",
        [a.clone()],
        [vc.clone()],
        Rc::new(move |scope, _cancel| {
            let c_runs = Rc::clone(&c_runs2);
            Box::pin(async move {
                *c_runs.borrow_mut() += 1;
                let a_val = as_i64(&scope.get("a").await?);
                let mut out = BodyOutputs::default();
                out.insert("vc".to_string(), int(a_val + 5));
                Ok(out)
            })
        }),
    );

    let d_runs = Rc::new(RefCell::new(0u32));
    let d_runs2 = Rc::clone(&d_runs);
    kernel.define_computation(
        "D",
        [vb.clone(), vc.clone()],
        [vd.clone()],
        Rc::new(move |scope, _cancel| {
            let d_runs = Rc::clone(&d_runs2);
            Box::pin(async move {
                *d_runs.borrow_mut() += 1;
                let b_val = as_i64(&scope.get("vb").await?);
                let c_val = as_i64(&scope.get("vc").await?);
                let mut out = BodyOutputs::default();
                out.insert("vd".to_string(), int(b_val + c_val));
                Ok(out)
            })
        }),
    );

    let (cb, log) = recording_observer();
    kernel.observe(&vd, cb).unwrap();
    kernel.wait_idle().await;
    assert_eq!(success_values(&log), vec![8]);

    kernel.update_source(&a, int(10)).unwrap();
    kernel.wait_idle().await;
    assert_eq!(success_values(&log), vec![8, 35]);

    assert_eq!(*d_runs.borrow(), 2);
    assert_eq!(*b_runs.borrow(), 2);
    assert_eq!(*c_runs.borrow(), 2);
}

#[tokio::test]
async fn a_superseded_run_is_cancelled_and_never_delivered() {
    let kernel = Kernel::default();
    let x = VariableId::new("x");
    let vy = VariableId::new("vy");

    kernel.define_source(x.clone(), Some(int(1)));

    let starts = Rc::new(RefCell::new(0u32));
    let starts2 = Rc::clone(&starts);
    kernel.define_computation(
        "Y",
        [x.clone()],
        [vy.clone()],
        Rc::new(move |scope, _cancel| {
            let starts = Rc::clone(&starts2);
            Box::pin(async move {
                *starts.borrow_mut() += 1;
                let x_val = as_i64(&scope.get("x").await?);
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut out = BodyOutputs::default();
                out.insert("vy".to_string(), int(x_val * 10));
                Ok(out)
            })
        }),
    );

    let (cb, log) = recording_observer();
    kernel.observe(&vy, cb).unwrap();

    let kernel2 = kernel.clone();
    let x2 = x.clone();
    tokio::join!(kernel.wait_idle(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        kernel2.update_source(&x2, int(2)).unwrap();
    });
    kernel.wait_idle().await;

    assert_eq!(success_values(&log), vec![20]);
    assert_eq!(*starts.borrow(), 2);
}

#[tokio::test]
async fn a_problematic_computation_recovers_once_its_missing_input_appears() {
    let kernel = Kernel::default();
    let a = VariableId::new("A_src");
    let vb = VariableId::new("vB");

    let status = kernel.define_computation(
        "B",
        [a.clone()],
        [vb.clone()],
        Rc::new(move |scope, _cancel| {
            Box::pin(async move {
                let a_val = as_i64(&scope.get("A_src").await?);
                let mut out = BodyOutputs::default();
                out.insert("vB".to_string(), int(a_val + 1));
                Ok(out)
            })
        }),
    );
    match status {
        DefinitionStatus::Problematic(errs) => assert_eq!(errs[0].reason, ProblemReason::MissingInput),
        DefinitionStatus::Healthy => panic!("expected a problematic definition"),
    }

    let (cb, log) = recording_observer();
    kernel.observe(&vb, cb).unwrap();
    assert!(matches!(log.borrow().last(), Some(CellResult::Fatal(_))));

    kernel.define_source(a.clone(), Some(int(10)));
    kernel.wait_idle().await;

    assert_eq!(success_values(&log), vec![11]);
}

#[tokio::test]
async fn first_win_duplicate_output_recovers_once_the_winner_is_removed() {
    let kernel = Kernel::default();
    let v = VariableId::new("v_shared");

    kernel.define_computation(
        "B1",
        [],
        [v.clone()],
        Rc::new(|_scope, _cancel| {
            Box::pin(async move {
                let mut out = BodyOutputs::default();
                out.insert("v_shared".to_string(), int(1));
                Ok(out)
            })
        }),
    );

    let (cb, log) = recording_observer();
    kernel.observe(&v, cb).unwrap();
    kernel.wait_idle().await;
    assert_eq!(success_values(&log), vec![1]);

    let status = kernel.define_computation(
        "B2",
        [],
        [v.clone()],
        Rc::new(|_scope, _cancel| {
            Box::pin(async move {
                let mut out = BodyOutputs::default();
                out.insert("v_shared".to_string(), int(2));
                Ok(out)
            })
        }),
    );
    match status {
        DefinitionStatus::Problematic(errs) => assert_eq!(errs[0].reason, ProblemReason::DuplicateOutput),
        DefinitionStatus::Healthy => panic!("expected a problematic (conflicting) definition"),
    }
    assert!(values_equal(kernel.peek(&v).unwrap().result.as_value().unwrap(), &int(1)));

    kernel.remove_computation(&reactive_kernel::ComputationId::new("B1"));
    kernel.wait_idle().await;

    assert_eq!(success_values(&log), vec![1, 2]);
}

#[tokio::test]
async fn a_mutual_cycle_recovers_once_redefined_to_break_it() {
    let kernel = Kernel::default();
    let v_a = VariableId::new("vA");
    let v_b = VariableId::new("vB2");
    let v_c = VariableId::new("vC");

    kernel.define_computation(
        "A",
        [v_c.clone()],
        [v_a.clone()],
        Rc::new(|scope, _cancel| {
            Box::pin(async move {
                let c_val = as_i64(&scope.get("vC").await?);
                let mut out = BodyOutputs::default();
                out.insert("vA".to_string(), int(c_val + 1));
                Ok(out)
            })
        }),
    );
    kernel.define_computation(
        "B",
        [v_a.clone()],
        [v_b.clone()],
        Rc::new(|scope, _cancel| {
            Box::pin(async move {
                let a_val = as_i64(&scope.get("vA").await?);
                let mut out = BodyOutputs::default();
                out.insert("vB2".to_string(), int(a_val + 1));
                Ok(out)
            })
        }),
    );
    let status = kernel.define_computation(
        "C",
        [v_b.clone()],
        [v_c.clone()],
        Rc::new(|scope, _cancel| {
            Box::pin(async move {
                let b_val = as_i64(&scope.get("vB2").await?);
                let mut out = BodyOutputs::default();
                out.insert("vC".to_string(), int(b_val + 1));
                Ok(out)
            })
        }),
    );
    match status {
        DefinitionStatus::Problematic(errs) => assert_eq!(errs[0].reason, ProblemReason::CircularDependency),
        DefinitionStatus::Healthy => panic!("expected the closing definition to be cyclic"),
    }

    let problems = kernel.get_problem_computations();
    let names: Vec<&str> = problems.iter().map(|p| p.id.as_str()).collect();
    assert!(names.contains(&"A"));
    assert!(names.contains(&"B"));
    assert!(names.contains(&"C"));
    assert!(problems.iter().all(|p| p.reason == ProblemReason::CircularDependency));

    let x = VariableId::new("X");
    kernel.define_source(x.clone(), Some(int(1)));

    kernel.redefine_computation(
        "C",
        [x.clone()],
        [v_c.clone()],
        Rc::new(|scope, _cancel| {
            Box::pin(async move {
                let x_val = as_i64(&scope.get("X").await?);
                let mut out = BodyOutputs::default();
                out.insert("vC".to_string(), int(x_val * 100));
                Ok(out)
            })
        }),
    );
    kernel.wait_idle().await;

    assert!(kernel.get_problem_computations().is_empty());
    assert!(values_equal(kernel.peek(&v_c).unwrap().result.as_value().unwrap(), &int(100)));
    assert!(values_equal(kernel.peek(&v_a).unwrap().result.as_value().unwrap(), &int(101)));
    assert!(values_equal(kernel.peek(&v_b).unwrap().result.as_value().unwrap(), &int(102)));
}

#[tokio::test]
async fn observe_count_reaching_zero_stops_execution() {
    let kernel = Kernel::default();
    let x = VariableId::new("x");
    let vy = VariableId::new("vy");
    kernel.define_source(x.clone(), Some(int(1)));

    let runs = Rc::new(RefCell::new(0u32));
    let runs2 = Rc::clone(&runs);
    kernel.define_computation(
        "Y",
        [x.clone()],
        [vy.clone()],
        Rc::new(move |_scope, _cancel| {
            let runs = Rc::clone(&runs2);
            Box::pin(async move {
                *runs.borrow_mut() += 1;
                let mut out = BodyOutputs::default();
                out.insert("vy".to_string(), int(1));
                Ok(out)
            })
        }),
    );

    // Nothing observes `vy`; an update must not schedule any work.
    kernel.update_source(&x, int(2)).unwrap();
    kernel.wait_idle().await;
    assert_eq!(*runs.borrow(), 0);

    let unsub = kernel.observe(&vy, Rc::new(|_: &CellResult| {})).unwrap();
    kernel.wait_idle().await;
    assert_eq!(*runs.borrow(), 1);

    unsub.unsubscribe();
    kernel.update_source(&x, int(3)).unwrap();
    kernel.wait_idle().await;
    assert_eq!(*runs.borrow(), 1);
}

#[tokio::test]
async fn input_pruning_skips_the_body_when_upstream_value_is_unchanged() {
    let kernel = Kernel::default();
    let x = VariableId::new("x");
    let vy = VariableId::new("vy");
    let vz = VariableId::new("vz");
    kernel.define_source(x.clone(), Some(int(1)));

    let y_runs = Rc::new(RefCell::new(0u32));
    let y_runs2 = Rc::clone(&y_runs);
    kernel.define_computation(
        "Y",
        [x.clone()],
        [vy.clone()],
        Rc::new(move |scope, _cancel| {
            let y_runs = Rc::clone(&y_runs2);
            Box::pin(async move {
                *y_runs.borrow_mut() += 1;
                let x_val = as_i64(&scope.get("x").await?);
                let mut out = BodyOutputs::default();
                // Parity: 1 and 3 both land on the same output value, so a
                // real source write doesn't always change what `vy` holds.
                out.insert("vy".to_string(), int(x_val % 2));
                Ok(out)
            })
        }),
    );

    let z_runs = Rc::new(RefCell::new(0u32));
    let z_runs2 = Rc::clone(&z_runs);
    kernel.define_computation(
        "Z",
        [vy.clone()],
        [vz.clone()],
        Rc::new(move |scope, _cancel| {
            let z_runs = Rc::clone(&z_runs2);
            Box::pin(async move {
                *z_runs.borrow_mut() += 1;
                let y_val = as_i64(&scope.get("vy").await?);
                let mut out = BodyOutputs::default();
                out.insert("vz".to_string(), int(y_val + 100));
                Ok(out)
            })
        }),
    );

    let (cb, log) = recording_observer();
    kernel.observe(&vz, cb).unwrap();
    kernel.wait_idle().await;
    assert_eq!(success_values(&log), vec![101]);
    assert_eq!(*y_runs.borrow(), 1);
    assert_eq!(*z_runs.borrow(), 1);

    kernel.update_source(&x, int(3)).unwrap();
    kernel.wait_idle().await;

    // `vy` is transitively dirtied and re-runs, but 3 has the same parity
    // as 1: its value never actually changes, so `vz`'s runtime input never
    // advances past the version it last saw and its body is pruned.
    assert_eq!(*y_runs.borrow(), 2);
    assert_eq!(*z_runs.borrow(), 1);
    assert_eq!(success_values(&log), vec![101]);
}

#[tokio::test]
async fn kernel_with_custom_options_still_settles() {
    let kernel = Kernel::new(ReactiveModuleOptions::new().with_assert_invariants(true).with_max_concurrent(4));
    let x = VariableId::new("x");
    kernel.define_source(x.clone(), Some(int(7)));
    let snapshot = kernel.peek(&x).unwrap();
    assert!(values_equal(snapshot.result.as_value().unwrap(), &int(7)));
}
