//! Property-based coverage of the §8 testable properties. `proptest` drives
//! the inputs; each property spins up a throwaway tokio runtime since the
//! `proptest!` macro itself only accepts synchronous test bodies.

mod common;

use latticeflow::arg::{ArgValue, Direction, ManagedPlaceholder};
use latticeflow::job::{ArgSpec, JobContext, JobKind};
use latticeflow::{Axis, Chunk, EngineError, JobDefinition, WorkflowDefinition};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(fut)
}

fn uppercase_chain(
    input: &std::path::Path,
    output: &std::path::Path,
    calls: Arc<AtomicUsize>,
) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new("prop_uppercase");

    let read_calls = calls.clone();
    def.add(JobDefinition {
        name: "read".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![ArgSpec::Managed(ManagedPlaceholder::File {
            path: input.to_string_lossy().to_string(),
            direction: Direction::In,
        })],
        ret: Some(ManagedPlaceholder::Obj {
            name: "text".to_string(),
            axes: vec![],
            direction: Direction::Out,
        }),
        kind: JobKind::Transform,
        func: Some(Arc::new(move |_env, args| {
            read_calls.fetch_add(1, Ordering::SeqCst);
            let ArgValue::Path(path) = &args[0] else { unreachable!() };
            Ok(Some(serde_json::json!(std::fs::read_to_string(path)?)))
        })),
        subworkflow: None,
    });

    let write_calls = calls;
    def.add(JobDefinition {
        name: "write".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::Obj {
                name: "text".to_string(),
                axes: vec![],
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::File {
                path: output.to_string_lossy().to_string(),
                direction: Direction::Out,
            }),
        ],
        ret: None,
        kind: JobKind::Transform,
        func: Some(Arc::new(move |_env, args| {
            write_calls.fetch_add(1, Ordering::SeqCst);
            let ArgValue::Object(value) = &args[0] else { unreachable!() };
            let ArgValue::Path(path) = &args[1] else { unreachable!() };
            std::fs::write(path, value.as_str().unwrap_or_default().to_uppercase())?;
            Ok(None)
        })),
        subworkflow: None,
    });

    def
}

proptest! {
    /// §8 property 1 (idempotence): whatever the input payload, a second run
    /// against the same pipeline directory resubmits no job.
    #[test]
    fn idempotent_across_reruns(payload in "[a-zA-Z0-9 ]{1,40}") {
        let fixture = common::PipelineFixture::new();
        let input = fixture.path("input.txt");
        let output = fixture.path("output.txt");
        std::fs::write(&input, &payload).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        block_on(common::run(
            uppercase_chain(&input, &output, calls.clone()),
            &fixture.root,
            common::default_options(),
        ))
        .expect("first run succeeds");
        prop_assert_eq!(std::fs::read_to_string(&output).unwrap(), payload.to_uppercase());
        let calls_after_first = calls.load(Ordering::SeqCst);

        block_on(common::run(
            uppercase_chain(&input, &output, calls.clone()),
            &fixture.root,
            common::default_options(),
        ))
        .expect("second run succeeds");
        prop_assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
    }

    /// §8 property 2 (determinism of out-of-date): regenerating the graph
    /// twice in a row with no intervening writes must flag the same set of
    /// instances as out of date both times.
    #[test]
    fn out_of_date_set_is_stable_across_regenerations(payload in "[a-zA-Z0-9]{1,20}") {
        let fixture = common::PipelineFixture::new();
        let input = fixture.path("input.txt");
        let output = fixture.path("output.txt");
        std::fs::write(&input, &payload).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let def = uppercase_chain(&input, &output, calls);

        let mut instance = latticeflow::WorkflowInstance::open(def, &fixture.root).unwrap();
        instance.graph.regenerate().unwrap();
        let first: HashSet<String> = instance.graph.explain_lines_keys();
        instance.graph.regenerate().unwrap();
        let second: HashSet<String> = instance.graph.explain_lines_keys();
        prop_assert_eq!(first, second);
    }

    /// §8 property 6 (split expansion): splitting a string into one chunk per
    /// distinct character produces exactly one per-chunk job invocation and a
    /// merge whose output carries two characters per distinct input character,
    /// regardless of how many distinct characters the input has.
    #[test]
    fn split_expansion_matches_distinct_chunk_count(chars in prop::collection::hash_set(prop::char::range('a', 'z'), 1..8)) {
        let fixture = common::PipelineFixture::new();
        let output = fixture.path("merged.txt");
        let distinct: Vec<char> = chars.into_iter().collect();
        let source: String = distinct.iter().collect();
        let bychar = Axis::new("bychar");
        let mut def = WorkflowDefinition::new("prop_split");
        let produce_calls = Arc::new(AtomicUsize::new(0));

        def.add(JobDefinition {
            name: "split_chars".to_string(),
            axes: vec![],
            context: Default::default(),
            args: vec![],
            ret: Some(ManagedPlaceholder::Chunks { axis: bychar.clone(), direction: Direction::Out }),
            kind: JobKind::Split { new_axis: bychar.clone() },
            func: Some(Arc::new(move |_env, _args| {
                let chunks: Vec<Chunk> = source.chars().map(|c| Chunk::from(c.to_string())).collect();
                Ok(Some(serde_json::to_value(&chunks)?))
            })),
            subworkflow: None,
        });

        let counted = produce_calls.clone();
        def.add(JobDefinition {
            name: "dash".to_string(),
            axes: vec![bychar.clone()],
            context: Default::default(),
            args: vec![ArgSpec::Managed(ManagedPlaceholder::Inst { axis: bychar.clone() })],
            ret: Some(ManagedPlaceholder::Obj { name: "dashed".to_string(), axes: vec![], direction: Direction::Out }),
            kind: JobKind::Transform,
            func: Some(Arc::new(move |_env, args| {
                counted.fetch_add(1, Ordering::SeqCst);
                let ArgValue::Chunk(chunk) = &args[0] else { unreachable!() };
                Ok(Some(serde_json::json!(format!("{chunk}-"))))
            })),
            subworkflow: None,
        });

        def.add(JobDefinition {
            name: "merge".to_string(),
            axes: vec![],
            context: Default::default(),
            args: vec![
                ArgSpec::Managed(ManagedPlaceholder::Obj { name: "dashed".to_string(), axes: vec![bychar], direction: Direction::In }),
                ArgSpec::Managed(ManagedPlaceholder::File { path: output.to_string_lossy().to_string(), direction: Direction::Out }),
            ],
            ret: None,
            kind: JobKind::Transform,
            func: Some(Arc::new(|_env, args| {
                let ArgValue::ObjectMap(entries) = &args[0] else { unreachable!() };
                let merged: String = entries.iter().map(|(_, v)| v.as_str().unwrap_or_default()).collect();
                let ArgValue::Path(path) = &args[1] else { unreachable!() };
                std::fs::write(path, merged)?;
                Ok(None)
            })),
            subworkflow: None,
        });

        block_on(common::run(def, &fixture.root, common::default_options()))
            .expect("split/transform/merge succeeds");

        prop_assert_eq!(produce_calls.load(Ordering::SeqCst), distinct.len());
        let merged = std::fs::read_to_string(&output).unwrap();
        prop_assert_eq!(merged.len(), distinct.len() * 2);
    }

    /// §8 property 8 (retry budget): a job succeeds iff it reaches a
    /// succeeding attempt within `budget + 1` tries; otherwise the whole run
    /// fails exactly once the budget is spent, never earlier or later.
    #[test]
    fn retry_budget_is_exact(budget in 0u32..4, succeed_offset in 0usize..5) {
        let fixture = common::PipelineFixture::new();
        let input = fixture.path("input.txt");
        std::fs::write(&input, b"payload").unwrap();
        let output = fixture.path("output.txt");
        let calls = Arc::new(AtomicUsize::new(0));
        let succeed_on_attempt = 1 + succeed_offset;

        let mut def = WorkflowDefinition::new("prop_retry");
        let counted = calls.clone();
        def.add(JobDefinition {
            name: "flaky".to_string(),
            axes: vec![],
            context: JobContext { num_retry: budget, ..Default::default() },
            args: vec![
                ArgSpec::Managed(ManagedPlaceholder::File { path: input.to_string_lossy().to_string(), direction: Direction::In }),
                ArgSpec::Managed(ManagedPlaceholder::File { path: output.to_string_lossy().to_string(), direction: Direction::Out }),
            ],
            ret: None,
            kind: JobKind::Transform,
            func: Some(Arc::new(move |_env, args| {
                let attempt = counted.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < succeed_on_attempt {
                    return Err(EngineError::IncompleteJob(format!("synthetic failure on attempt {attempt}")));
                }
                let (ArgValue::Path(src), ArgValue::Path(dst)) = (&args[0], &args[1]) else { unreachable!() };
                std::fs::copy(src, dst)?;
                Ok(None)
            })),
            subworkflow: None,
        });

        let result = block_on(common::run(def, &fixture.root, common::default_options()));
        let allowed_attempts = budget as usize + 1;

        if succeed_on_attempt <= allowed_attempts {
            prop_assert!(result.is_ok());
            prop_assert_eq!(calls.load(Ordering::SeqCst), succeed_on_attempt);
            prop_assert!(output.exists());
        } else {
            prop_assert!(matches!(result, Err(EngineError::PipelineFailed)));
            prop_assert_eq!(calls.load(Ordering::SeqCst), allowed_attempts);
            prop_assert!(!output.exists());
        }
    }

    /// §8 property 5 (cycle detection): two jobs whose file resources form a
    /// mutual dependency are always rejected, regardless of definition order.
    #[test]
    fn cycle_is_always_detected_regardless_of_definition_order(swap_order in any::<bool>()) {
        let dir = tempfile::tempdir().unwrap();
        let x = dir.path().join("x.txt");
        let y = dir.path().join("y.txt");

        let job_a = JobDefinition {
            name: "a".to_string(),
            axes: vec![],
            context: Default::default(),
            args: vec![
                ArgSpec::Managed(ManagedPlaceholder::File { path: y.to_string_lossy().to_string(), direction: Direction::In }),
                ArgSpec::Managed(ManagedPlaceholder::File { path: x.to_string_lossy().to_string(), direction: Direction::Out }),
            ],
            ret: None,
            kind: JobKind::Transform,
            func: Some(Arc::new(|_env, _args| Ok(None))),
            subworkflow: None,
        };
        let job_b = JobDefinition {
            name: "b".to_string(),
            axes: vec![],
            context: Default::default(),
            args: vec![
                ArgSpec::Managed(ManagedPlaceholder::File { path: x.to_string_lossy().to_string(), direction: Direction::In }),
                ArgSpec::Managed(ManagedPlaceholder::File { path: y.to_string_lossy().to_string(), direction: Direction::Out }),
            ],
            ret: None,
            kind: JobKind::Transform,
            func: Some(Arc::new(|_env, _args| Ok(None))),
            subworkflow: None,
        };

        let mut def = WorkflowDefinition::new("prop_cycle");
        if swap_order {
            def.add(job_b);
            def.add(job_a);
        } else {
            def.add(job_a);
            def.add(job_b);
        }

        let mut instance = latticeflow::WorkflowInstance::open(def, &dir.path().join("pipeline")).unwrap();
        let err = instance.graph.regenerate().unwrap_err();
        prop_assert!(matches!(err, EngineError::DependencyCycle { .. }));
    }
}
