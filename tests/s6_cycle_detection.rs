//! S6: two jobs whose declared resources form a cycle must be rejected at
//! regeneration time rather than deadlocking the scheduler (§8 property 5).

use latticeflow::arg::{Direction, ManagedPlaceholder};
use latticeflow::job::{ArgSpec, JobKind};
use latticeflow::{EngineError, JobDefinition, WorkflowDefinition, WorkflowInstance};
use std::sync::Arc;

#[tokio::test]
async fn mutually_dependent_files_are_rejected_as_a_cycle() {
    // Arrange: job "a" reads y and writes x; job "b" reads x and writes y.
    let dir = tempfile::tempdir().unwrap();
    let x = dir.path().join("x.txt");
    let y = dir.path().join("y.txt");

    let mut def = WorkflowDefinition::new("cyclic");
    def.add(JobDefinition {
        name: "a".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::File {
                path: y.to_string_lossy().to_string(),
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::File {
                path: x.to_string_lossy().to_string(),
                direction: Direction::Out,
            }),
        ],
        ret: None,
        kind: JobKind::Transform,
        func: Some(Arc::new(|_env, _args| Ok(None))),
        subworkflow: None,
    });
    def.add(JobDefinition {
        name: "b".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::File {
                path: x.to_string_lossy().to_string(),
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::File {
                path: y.to_string_lossy().to_string(),
                direction: Direction::Out,
            }),
        ],
        ret: None,
        kind: JobKind::Transform,
        func: Some(Arc::new(|_env, _args| Ok(None))),
        subworkflow: None,
    });

    // Act
    let mut instance = WorkflowInstance::open(def, &dir.path().join("pipeline")).unwrap();
    let err = instance.graph.regenerate().unwrap_err();

    // Assert
    assert!(matches!(err, EngineError::DependencyCycle { .. }));
}
