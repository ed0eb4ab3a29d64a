//! S2: a split job fans the input's characters out onto a fresh axis keyed
//! by position (not by value — characters repeat), a per-chunk job appends a
//! dash to each, and a merge job gathers them back in chunk order (§8
//! property 6: split expansion; the hard part is that axis chunk *values*
//! collide while each node must still resolve to its own character).

mod common;

use latticeflow::arg::{ArgValue, Direction, ManagedPlaceholder};
use latticeflow::job::{ArgSpec, JobKind};
use latticeflow::node::Node;
use latticeflow::resource::{Resource, ResourceKey};
use latticeflow::{Axis, Chunk, JobDefinition, WorkflowDefinition};
use std::sync::Arc;

fn chunk_index(node: &Node, axis: &Axis) -> i64 {
    match node.chunk_for(axis) {
        Some(Chunk::Int(i)) => *i,
        _ => panic!("expected an integer chunk for {axis}"),
    }
}

fn build_workflow(input: &std::path::Path, output: &std::path::Path) -> WorkflowDefinition {
    let bychar = Axis::new("bychar");
    let mut def = WorkflowDefinition::new("split_by_char");

    def.add(JobDefinition {
        name: "split_chars".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![ArgSpec::Managed(ManagedPlaceholder::File {
            path: input.to_string_lossy().to_string(),
            direction: Direction::In,
        })],
        ret: Some(ManagedPlaceholder::Chunks {
            axis: bychar.clone(),
            direction: Direction::Out,
        }),
        kind: JobKind::Split {
            new_axis: bychar.clone(),
        },
        func: Some(Arc::new(move |env, args| {
            let ArgValue::Path(path) = &args[0] else { unreachable!() };
            let content = std::fs::read_to_string(path)?;
            // Each axis chunk is the character's index, not the character
            // itself: the same letter appears more than once in the input,
            // so the chunk set could not key on value alone. The character
            // is carried separately as a per-node object.
            let mut chunks = Vec::new();
            for (i, ch) in content.chars().enumerate() {
                let node = Node::root().extended(bychar.clone(), Chunk::Int(i as i64));
                let key = ResourceKey::object("char", node);
                let bytes = serde_json::to_vec(&ch.to_string())?;
                env.resources.write_object(&Resource::object(key), &bytes)?;
                chunks.push(Chunk::Int(i as i64));
            }
            Ok(Some(serde_json::to_value(&chunks)?))
        })),
        subworkflow: None,
    });

    def.add(JobDefinition {
        name: "dash".to_string(),
        axes: vec![bychar.clone()],
        context: Default::default(),
        args: vec![ArgSpec::Managed(ManagedPlaceholder::Obj {
            name: "char".to_string(),
            axes: vec![],
            direction: Direction::In,
        })],
        ret: Some(ManagedPlaceholder::Obj {
            name: "dashed".to_string(),
            axes: vec![],
            direction: Direction::Out,
        }),
        kind: JobKind::Transform,
        func: Some(Arc::new(|_env, args| {
            let ArgValue::Object(value) = &args[0] else {
                unreachable!()
            };
            let ch = value.as_str().unwrap_or_default();
            Ok(Some(serde_json::json!(format!("{ch}-"))))
        })),
        subworkflow: None,
    });

    def.add(JobDefinition {
        name: "merge".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::Obj {
                name: "dashed".to_string(),
                axes: vec![bychar.clone()],
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
            let ArgValue::ObjectMap(entries) = &args[0] else {
                unreachable!()
            };
            let mut sorted = entries.clone();
            sorted.sort_by_key(|(n, _)| chunk_index(n, &Axis::new("bychar")));
            let merged: String = sorted
                .iter()
                .map(|(_, v)| v.as_str().unwrap_or_default())
                .collect();
            let ArgValue::Path(path) = &args[1] else {
                unreachable!()
            };
            std::fs::write(path, merged)?;
            Ok(None)
        })),
        subworkflow: None,
    });

    def
}

#[tokio::test]
async fn split_transform_merge_reconstructs_in_chunk_order() {
    let fixture = common::PipelineFixture::new();
    let input = fixture.path("input.txt");
    let output = fixture.path("merged.txt");
    let lines: Vec<String> = (1..=8).map(|i| format!("line{i}")).collect();
    std::fs::write(&input, lines.join("\n")).unwrap();

    let def = build_workflow(&input, &output);
    common::run(def, &fixture.root, common::default_options())
        .await
        .expect("split/transform/merge pipeline succeeds");

    let merged = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        merged,
        "l-i-n-e-1-\n-l-i-n-e-2-\n-l-i-n-e-3-\n-l-i-n-e-4-\n-l-i-n-e-5-\n-l-i-n-e-6-\n-l-i-n-e-7-\n-l-i-n-e-8-"
    );
}
