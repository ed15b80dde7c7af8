//! Integration tests for the sleuth promise engine

use std::cell::RefCell;
use std::rc::Rc;

use sleuth::{Engine, Fault, MemoryCollector, Resolution, Value};

/// Opt into engine tracing with e.g. `RUST_LOG=sleuth=trace cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn delayed(engine: &Engine, ms: u64, value: &str) -> Resolution {
    Resolution::Nested(engine.delay(ms, Value::from(value)))
}

fn rejected(engine: &Engine, reason: &str) -> Resolution {
    Resolution::Nested(engine.reject(Value::from(reason)))
}

mod settlement {
    use super::*;

    #[test]
    fn test_first_settlement_wins() {
        super::init_tracing();
        let engine = Engine::new();
        let deferred = engine.defer();
        let observed = Rc::new(RefCell::new(Vec::new()));
        let log = observed.clone();
        deferred.promise.then(move |value| {
            log.borrow_mut().push(value);
            Resolution::None
        });
        deferred.settlement.resolve(Value::from("first")).unwrap();
        deferred.settlement.reject(Value::from("second"));
        deferred.settlement.resolve(Value::from("third")).unwrap();
        engine.run();
        assert!(deferred.promise.is_resolved());
        assert_eq!(*observed.borrow(), vec![Value::from("first")]);
    }

    #[test]
    fn test_settlement_is_never_observed_synchronously() {
        let engine = Engine::new();
        let seen = Rc::new(RefCell::new(false));
        let flag = seen.clone();
        let promise = engine.resolve(Value::from(1));
        promise.then(move |_| {
            *flag.borrow_mut() = true;
            Resolution::None
        });
        assert!(!*seen.borrow());
        engine.run();
        assert!(*seen.borrow());
    }

    #[test]
    fn test_missing_handlers_propagate_both_outcomes() {
        let engine = Engine::new();

        let value_child = engine
            .resolve(Value::from("payload"))
            .catch(|r| Resolution::Value(r));
        let reason_child = engine
            .reject(Value::from("reason"))
            .then(|v| Resolution::Value(v));
        engine.run();

        assert!(value_child.is_resolved());
        assert_eq!(value_child.payload(), Value::from("payload"));
        assert!(reason_child.is_rejected());
        assert_eq!(reason_child.payload(), Value::from("reason"));
    }

    #[test]
    fn test_notifications_reach_subscribers_in_order() {
        let engine = Engine::new();
        let deferred = engine.defer();
        let updates = Rc::new(RefCell::new(Vec::new()));
        let log = updates.clone();
        deferred
            .promise
            .notified(move |data| log.borrow_mut().push(data));
        for pct in [30, 55, 90, 100] {
            deferred.settlement.notify(Value::from(pct));
        }
        deferred.settlement.resolve(Value::Undefined).unwrap();
        engine.run();
        assert_eq!(
            *updates.borrow(),
            vec![
                Value::from(30),
                Value::from(55),
                Value::from(90),
                Value::from(100)
            ]
        );
    }
}

mod resolution {
    use super::*;

    #[test]
    fn test_self_resolution_always_rejects() {
        let engine = Engine::new();
        let deferred = engine.defer();
        deferred
            .settlement
            .resolve(deferred.promise.clone())
            .unwrap();
        engine.run();
        assert!(deferred.promise.is_rejected());
        match deferred.promise.payload() {
            Value::Fault(fault) => assert_eq!(fault.name, "TypeError"),
            other => panic!("expected a type error, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_failure_rejects_child() {
        let engine = Engine::new();
        let child = engine
            .resolve(Value::from(1))
            .then(|_| Resolution::Failure(Value::Fault(Fault::new("handler blew up"))));
        engine.run();
        assert!(child.is_rejected());
        assert_eq!(
            child.payload(),
            Value::Fault(Fault::new("handler blew up"))
        );
    }

    #[test]
    fn test_recovery_through_catch() {
        let engine = Engine::new();
        let recovered = engine
            .reject(Value::from("transient"))
            .catch(|_| Resolution::Value(Value::from("fallback")))
            .then(|v| Resolution::Value(v));
        engine.run();
        assert!(recovered.is_resolved());
        assert_eq!(recovered.payload(), Value::from("fallback"));
    }

    #[test]
    fn test_nested_chain_flattens_through_multiple_levels() {
        let engine = Engine::new();
        let inner_engine = engine.clone();
        let flattened = engine.resolve(Value::from(1)).then(move |_| {
            let deeper = inner_engine.clone();
            Resolution::Nested(
                inner_engine
                    .delay(10, Value::from(2))
                    .then(move |_| Resolution::Nested(deeper.delay(10, Value::from(3)))),
            )
        });
        engine.run();
        assert_eq!(flattened.payload(), Value::Number(3.0));
    }

    #[test]
    fn test_ancestor_return_settles_and_keeps_tree_acyclic() {
        let engine = Engine::new();
        let root = engine.resolve(Value::from("base"));
        let ancestor = root.clone();
        let child = root.then(move |_| Resolution::Nested(ancestor));
        let tail = child.then(|v| Resolution::Value(v));
        engine.run();
        assert!(child.is_settled());
        assert!(tail.is_settled());
        assert_eq!(tail.payload(), Value::from("base"));
    }
}

mod combinators {
    use super::*;

    #[test]
    fn test_all_preserves_input_order_despite_completion_order() {
        let engine = Engine::new();
        let joined = engine.all(vec![
            delayed(&engine, 10, "a"),
            delayed(&engine, 20, "b"),
        ]);
        engine.run();
        assert_eq!(
            joined.payload(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );

        let engine = Engine::new();
        let joined = engine.all(vec![
            delayed(&engine, 20, "a"),
            delayed(&engine, 10, "b"),
        ]);
        engine.run();
        assert_eq!(
            joined.payload(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_race_fastest_resolution_wins() {
        let engine = Engine::new();
        let winner = engine.race(vec![
            delayed(&engine, 100, "a"),
            delayed(&engine, 10, "b"),
        ]);
        engine.run();
        assert_eq!(winner.payload(), Value::from("b"));
    }

    #[test]
    fn test_some_settles_as_soon_as_quorum_met() {
        let engine = Engine::new();
        let quorum = engine.some(
            vec![
                delayed(&engine, 20, "a"),
                rejected(&engine, "broken"),
                delayed(&engine, 10, "b"),
            ],
            2,
        );
        engine.run();
        assert!(quorum.is_resolved());
        // Input-index order, not completion order.
        assert_eq!(
            quorum.payload(),
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_some_rejects_without_waiting_for_stragglers() {
        let engine = Engine::new();
        // A straggler that never settles: the quorum must not wait for it.
        let gate = engine.defer();
        let quorum = engine.some(
            vec![
                rejected(&engine, "one"),
                rejected(&engine, "two"),
                Resolution::Nested(gate.promise.clone()),
            ],
            2,
        );
        engine.run();
        assert!(quorum.is_rejected());
        assert!(!gate.promise.is_settled());
        let reason = quorum.payload();
        match reason {
            Value::Fault(fault) => {
                assert!(fault.message.starts_with("2 promises failed"));
            }
            other => panic!("expected aggregated fault, got {:?}", other),
        }
    }

    #[test]
    fn test_settle_all_never_rejects() {
        let engine = Engine::new();
        let joined = engine.settle_all(vec![
            delayed(&engine, 5, "ok"),
            rejected(&engine, "bad"),
        ]);
        engine.run();
        assert!(joined.is_resolved());
        let list = joined.payload();
        let records = list.as_list().unwrap();
        assert_eq!(records[0].as_map().unwrap()["status"], Value::from("resolved"));
        assert_eq!(records[1].as_map().unwrap()["status"], Value::from("rejected"));
    }

    #[test]
    fn test_hash_join_keyed_results() {
        let engine = Engine::new();
        let joined = engine.hash(vec![
            ("fast".to_string(), delayed(&engine, 5, "f")),
            ("slow".to_string(), delayed(&engine, 50, "s")),
            ("bad".to_string(), rejected(&engine, "oops")),
        ]);
        engine.run();
        let map = joined.payload();
        let map = map.as_map().unwrap();
        assert_eq!(map["fast"], Value::from("f"));
        assert_eq!(map["slow"], Value::from("s"));
        assert_eq!(map["bad"], Value::from("oops"));
    }

    #[test]
    fn test_combinator_progress_notifications() {
        let engine = Engine::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        engine
            .settle_all(vec![delayed(&engine, 5, "x"), delayed(&engine, 10, "y")])
            .notified(move |pct| log.borrow_mut().push(pct));
        engine.run();
        assert_eq!(
            *seen.borrow(),
            vec![Value::from(0), Value::from(50), Value::from(100)]
        );
    }
}

mod instance_helpers {
    use super::*;

    #[test]
    fn test_tap_then_spread_pipeline() {
        let engine = Engine::new();
        let tapped = Rc::new(RefCell::new(None));
        let slot = tapped.clone();
        let outcome = engine
            .all(vec![delayed(&engine, 5, "a"), delayed(&engine, 10, "b")])
            .tap(move |value| *slot.borrow_mut() = Some(value.clone()))
            .spread(|args| {
                let joined = args
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("+");
                Resolution::Value(Value::from(joined))
            });
        engine.run();
        assert_eq!(outcome.payload(), Value::from("a+b"));
        assert!(tapped.borrow().is_some());
    }

    #[test]
    fn test_finally_runs_regardless_of_outcome() {
        let engine = Engine::new();
        let runs = Rc::new(RefCell::new(0));
        for promise in [
            engine.resolve(Value::from(1)),
            engine.reject(Value::from("e")),
        ] {
            let count = runs.clone();
            promise.finally(move |_| {
                *count.borrow_mut() += 1;
                Resolution::None
            });
        }
        engine.run();
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    fn test_timeout_races_timer_against_settlement() {
        let engine = Engine::new();
        let slow = engine
            .delay(100, Value::from("never"))
            .timeout(50, Some(Value::from("took too long")));
        let fast = engine
            .delay(10, Value::from("made it"))
            .timeout(50, None);
        engine.run();
        assert!(slow.is_rejected());
        assert_eq!(slow.payload(), Value::from("took too long"));
        assert!(fast.is_resolved());
        assert_eq!(fast.payload(), Value::from("made it"));
    }

    #[test]
    fn test_call_wraps_synchronous_work() {
        let engine = Engine::new();
        let result = engine.call(|| Resolution::Value(Value::from(21 * 2)));
        engine.run();
        assert_eq!(result.payload(), Value::Number(42.0));
    }
}

mod timing {
    use super::*;

    #[test]
    fn test_passive_only_tree_publishes_nothing() {
        let engine = Engine::new();
        let collector = Rc::new(MemoryCollector::new());
        engine.add_collector(collector.clone());
        engine
            .delay(5, Value::from(1))
            .track_as("leaf", true)
            .done();
        engine.run();
        assert!(collector.is_empty());
    }

    #[test]
    fn test_one_active_tag_publishes_passive_leaves_by_name() {
        let engine = Engine::new();
        let collector = Rc::new(MemoryCollector::new());
        engine.add_collector(collector.clone());
        engine
            .delay(5, Value::from(1))
            .track_as("active-root", false)
            .then(|v| Resolution::Value(v))
            .track_as("passive-leaf", true)
            .done();
        engine.run();
        let collected = collector.take();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].name, "active-root");
        assert_eq!(collected[0].children[0].name, "passive-leaf");
    }

    #[test]
    fn test_sane_timings_nest_recursively() {
        let engine = Engine::new();
        let collector = Rc::new(MemoryCollector::new());
        engine.add_collector(collector.clone());
        engine.use_sane_timings(true);
        let later = engine.clone();
        engine
            .delay(10, Value::from(1))
            .track_as("outer", false)
            .then(move |v| Resolution::Nested(later.delay(20, v)))
            .done();
        engine.run();
        let collected = collector.take();
        assert_eq!(collected.len(), 1);
        fn check(node: &sleuth::TimingSnapshot) {
            for child in &node.children {
                assert!(node.start <= child.start);
                assert!(node.stop >= child.stop);
                check(child);
            }
        }
        check(&collected[0]);
    }

    #[test]
    fn test_collector_removal_stops_publication() {
        let engine = Engine::new();
        let collector = Rc::new(MemoryCollector::new());
        let id = engine.add_collector(collector.clone());
        assert!(engine.remove_collector(id));
        assert!(!engine.remove_collector(id));
        engine
            .resolve(Value::from(1))
            .track_as("op", false)
            .done();
        engine.run();
        assert!(collector.is_empty());
    }
}

mod diagnostics {
    use super::*;

    #[test]
    fn test_done_with_trace_locates_deepest_rejection() {
        let engine = Engine::new();
        engine.set_trace_enabled(true);
        let root = engine
            .reject(Value::from("root cause"))
            .track_as("request", false);
        root.then(|v| Resolution::Value(v)).track_as("render", true);
        engine.run();
        root.done();
        engine.run();
        let uncaught = engine.take_uncaught_rejections();
        assert_eq!(uncaught.len(), 1);
        assert_eq!(
            uncaught[0].trace.as_deref(),
            Some(" at trackAs: request\n at function: render")
        );
    }

    #[test]
    fn test_handled_rejection_suppresses_escalation() {
        let engine = Engine::new();
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        engine.on_unhandled_rejection(move |event| {
            *slot.borrow_mut() = Some(event.reason.clone());
            event.handled = true;
        });
        engine.reject(Value::from("captured")).done();
        engine.run();
        assert_eq!(*seen.borrow(), Some(Value::from("captured")));
        assert!(engine.take_uncaught_rejections().is_empty());
    }

    #[test]
    fn test_done_with_observer_then_escalation() {
        let engine = Engine::new();
        let observed = Rc::new(RefCell::new(None));
        let slot = observed.clone();
        engine
            .reject(Value::from("seen and escalated"))
            .done_with(move |reason| *slot.borrow_mut() = Some(reason));
        engine.run();
        assert_eq!(
            *observed.borrow(),
            Some(Value::from("seen and escalated"))
        );
        assert_eq!(engine.take_uncaught_rejections().len(), 1);
    }
}

mod fault_injection {
    use super::*;

    #[test]
    fn test_injected_faults_reject_with_random_error() {
        let engine = Engine::new();
        engine.set_random_error_rate(1.0).unwrap();
        let promise = engine.delay(5, Value::from("unreachable"));
        engine.run();
        assert!(promise.is_rejected());
        assert_eq!(
            promise.payload(),
            Value::Fault(Fault::new("random error!"))
        );
    }

    #[test]
    fn test_injection_applies_to_combinators() {
        let engine = Engine::new();
        engine.set_random_error_rate(1.0).unwrap();
        let joined = engine.all(vec![Resolution::Value(Value::from(1))]);
        engine.run();
        assert!(joined.is_rejected());
    }

    #[test]
    fn test_injected_faults_flow_through_ordinary_handling() {
        let engine = Engine::new();
        engine.seed_random(7);
        engine.set_random_error_rate(1.0).unwrap();
        let recovered = engine
            .delay(5, Value::from("x"))
            .catch(|reason| {
                assert_eq!(reason, Value::Fault(Fault::new("random error!")));
                Resolution::Value(Value::from("recovered"))
            });
        engine.run();
        assert_eq!(recovered.payload(), Value::from("recovered"));
    }

    #[test]
    fn test_seeded_rate_is_deterministic() {
        let outcomes = |seed: u64| {
            let engine = Engine::new();
            engine.seed_random(seed);
            engine.set_random_error_rate(0.5).unwrap();
            let promises: Vec<_> = (0..32)
                .map(|i| engine.delay(1, Value::from(i)))
                .collect();
            engine.run();
            promises.iter().map(|p| p.is_rejected()).collect::<Vec<_>>()
        };
        assert_eq!(outcomes(42), outcomes(42));
    }
}
