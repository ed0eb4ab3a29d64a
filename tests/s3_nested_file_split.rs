//! S3: a two-level file split. The outer split fans an 8-line input into 2
//! `byline_a` groups of 4 lines each; each group is re-split by `byline_b`
//! into 2 chunks of 2 lines; a per-(byline_a, byline_b) job prefixes each
//! line with its line number within that chunk and its outer chunk index;
//! two merge jobs gather the result back in chunk order.

mod common;

use latticeflow::arg::{ArgValue, Direction, ManagedPlaceholder};
use latticeflow::job::{ArgSpec, JobKind};
use latticeflow::node::Node;
use latticeflow::{Axis, Chunk, JobDefinition, WorkflowDefinition};
use std::sync::Arc;

const LINES_PER_GROUP_A: usize = 4;
const LINES_PER_GROUP_B: usize = 2;
const TOTAL_LINES: usize = 8;

fn chunk_index(node: &Node, axis: &Axis) -> i64 {
    match node.chunk_for(axis) {
        Some(Chunk::Int(i)) => *i,
        _ => panic!("expected an integer chunk for {axis}"),
    }
}

fn build_workflow(input: &std::path::Path, output: &std::path::Path) -> WorkflowDefinition {
    let byline_a = Axis::new("byline_a");
    let byline_b = Axis::new("byline_b");
    let mut def = WorkflowDefinition::new("nested_file_split");

    def.add(JobDefinition {
        name: "split_byline_a".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![ArgSpec::Managed(ManagedPlaceholder::File {
            path: input.to_string_lossy().to_string(),
            direction: Direction::In,
        })],
        ret: Some(ManagedPlaceholder::Chunks {
            axis: byline_a.clone(),
            direction: Direction::Out,
        }),
        kind: JobKind::Split {
            new_axis: byline_a.clone(),
        },
        func: Some(Arc::new(move |env, args| {
            let ArgValue::Path(path) = &args[0] else { unreachable!() };
            let content = std::fs::read_to_string(path)?;
            let lines: Vec<&str> = content.lines().collect();
            let mut chunks = Vec::new();
            for (i, group) in lines.chunks(LINES_PER_GROUP_A).enumerate() {
                let node = Node::root().extended(Axis::new("byline_a"), Chunk::Int(i as i64));
                let key = latticeflow::ResourceKey::object("input_data", node);
                let path = env.resources.temp_path(&key);
                std::fs::create_dir_all(path.parent().unwrap())?;
                let body: String = group.iter().map(|l| format!("{l}\n")).collect();
                std::fs::write(&path, body)?;
                chunks.push(Chunk::Int(i as i64));
            }
            Ok(Some(serde_json::to_value(&chunks)?))
        })),
        subworkflow: None,
    });

    def.add(JobDefinition {
        name: "split_byline_b".to_string(),
        axes: vec![byline_a.clone()],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::TempFile {
                name: "input_data".to_string(),
                axes: vec![],
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::Inst { axis: byline_a.clone() }),
        ],
        ret: Some(ManagedPlaceholder::Chunks {
            axis: byline_b.clone(),
            direction: Direction::Out,
        }),
        kind: JobKind::Split {
            new_axis: byline_b.clone(),
        },
        func: Some(Arc::new(move |env, args| {
            let ArgValue::Path(path) = &args[0] else { unreachable!() };
            let ArgValue::Chunk(a_chunk) = &args[1] else { unreachable!() };
            let content = std::fs::read_to_string(path)?;
            let lines: Vec<&str> = content.lines().collect();
            let mut chunks = Vec::new();
            for (j, group) in lines.chunks(LINES_PER_GROUP_B).enumerate() {
                let parent = Node::root().extended(Axis::new("byline_a"), a_chunk.clone());
                let node = parent.extended(Axis::new("byline_b"), Chunk::Int(j as i64));
                let key = latticeflow::ResourceKey::object("input_data", node);
                let path = env.resources.temp_path(&key);
                std::fs::create_dir_all(path.parent().unwrap())?;
                let body: String = group.iter().map(|l| format!("{l}\n")).collect();
                std::fs::write(&path, body)?;
                chunks.push(Chunk::Int(j as i64));
            }
            Ok(Some(serde_json::to_value(&chunks)?))
        })),
        subworkflow: None,
    });

    def.add(JobDefinition {
        name: "do".to_string(),
        axes: vec![byline_a.clone(), byline_b.clone()],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::TempFile {
                name: "input_data".to_string(),
                axes: vec![],
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::Inst { axis: byline_a.clone() }),
        ],
        ret: Some(ManagedPlaceholder::TempFile {
            name: "output_data".to_string(),
            axes: vec![],
            direction: Direction::Out,
        }),
        kind: JobKind::Transform,
        func: Some(Arc::new(move |_env, args| {
            let ArgValue::Path(path) = &args[0] else { unreachable!() };
            let ArgValue::Chunk(a_chunk) = &args[1] else { unreachable!() };
            let content = std::fs::read_to_string(path)?;
            let mut out = String::new();
            for (line_number, line) in content.lines().enumerate() {
                out.push_str(&format!("{line_number}{a_chunk}{line}\n"));
            }
            Ok(Some(serde_json::json!(out)))
        })),
        subworkflow: None,
    });

    def.add(JobDefinition {
        name: "merge_byline_a".to_string(),
        axes: vec![byline_a.clone()],
        context: Default::default(),
        args: vec![ArgSpec::Managed(ManagedPlaceholder::TempFile {
            name: "output_data".to_string(),
            axes: vec![byline_b.clone()],
            direction: Direction::In,
        })],
        ret: Some(ManagedPlaceholder::TempFile {
            name: "output_data".to_string(),
            axes: vec![],
            direction: Direction::Out,
        }),
        kind: JobKind::Transform,
        func: Some(Arc::new(move |_env, args| {
            let ArgValue::PathMap(entries) = &args[0] else { unreachable!() };
            let mut sorted = entries.clone();
            sorted.sort_by_key(|(n, _)| chunk_index(n, &Axis::new("byline_b")));
            let mut merged = String::new();
            for (_, path) in &sorted {
                merged.push_str(&std::fs::read_to_string(path)?);
            }
            Ok(Some(serde_json::json!(merged)))
        })),
        subworkflow: None,
    });

    def.add(JobDefinition {
        name: "merge_byline_b".to_string(),
        axes: vec![],
        context: Default::default(),
        args: vec![
            ArgSpec::Managed(ManagedPlaceholder::TempFile {
                name: "output_data".to_string(),
                axes: vec![byline_a.clone()],
                direction: Direction::In,
            }),
            ArgSpec::Managed(ManagedPlaceholder::File {
                path: output.to_string_lossy().to_string(),
                direction: Direction::Out,
            }),
        ],
        ret: None,
        kind: JobKind::Transform,
        func: Some(Arc::new(|_env, args| {
            let ArgValue::PathMap(entries) = &args[0] else { unreachable!() };
            let mut sorted = entries.clone();
            sorted.sort_by_key(|(n, _)| chunk_index(n, &Axis::new("byline_a")));
            let mut merged = String::new();
            for (_, path) in &sorted {
                merged.push_str(&std::fs::read_to_string(path)?);
            }
            let ArgValue::Path(out_path) = &args[1] else { unreachable!() };
            std::fs::write(out_path, merged)?;
            Ok(None)
        })),
        subworkflow: None,
    });

    def
}

#[tokio::test]
async fn nested_split_transform_merge_reconstructs_line_prefixed_output() {
    let fixture = common::PipelineFixture::new();
    let input = fixture.path("input.txt");
    let output = fixture.path("merged.txt");
    let lines: Vec<String> = (1..=TOTAL_LINES).map(|i| format!("line{i}")).collect();
    std::fs::write(&input, lines.join("\n") + "\n").unwrap();

    let def = build_workflow(&input, &output);
    common::run(def, &fixture.root, common::default_options())
        .await
        .expect("nested split/transform/merge pipeline succeeds");

    let merged = std::fs::read_to_string(&output).unwrap();
    assert_eq!(
        merged,
        "00line1\n10line2\n00line3\n10line4\n01line5\n11line6\n01line7\n11line8\n"
    );
}
