use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use waymark::checkpoint::Checkpoint;
use waymark::clock::parse_stamp_ms;
use waymark::engine::{Engine, EngineConfig, PipelineStatus};
use waymark::events::EventKind;
use waymark::graph::{Graph, Node};
use waymark::handlers::{core_registry, NodeHandler, StageContext};
use waymark::interviewer::QueueInterviewer;
use waymark::logsink::{EventFilter, EventLogStore};
use waymark::outcome::Outcome;
use waymark::parse::parse_dot;
use waymark::WaymarkError;

#[tokio::test(flavor = "current_thread")]
async fn per_node_events_are_ordered_and_timestamps_monotone() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            a [shape=box]
            exit [shape=Msquare]
            start -> a -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = Engine::new()
        .run(&graph, EngineConfig::default())
        .await
        .expect("run should succeed");

    // started precedes completed for every node.
    let mut per_node: BTreeMap<&str, Vec<EventKind>> = BTreeMap::new();
    for event in &result.events {
        if let Some(node_id) = event.node_id.as_deref() {
            per_node.entry(node_id).or_default().push(event.kind);
        }
    }
    for (node_id, kinds) in per_node {
        assert_eq!(
            kinds,
            vec![EventKind::StageStarted, EventKind::StageCompleted],
            "unexpected event order for node {node_id}"
        );
    }

    let stamps: Vec<u64> = result
        .events
        .iter()
        .filter_map(|event| parse_stamp_ms(&event.timestamp))
        .collect();
    assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[tokio::test(flavor = "current_thread")]
async fn external_cancellation_stops_dispatch_and_checkpoints() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            a [shape=box]
            blocker [shape=box]
            exit [shape=Msquare]
            start -> a -> blocker -> exit
        }
        "#,
    )
    .expect("graph should parse");

    struct BlockingHandler;

    #[async_trait]
    impl NodeHandler for BlockingHandler {
        async fn execute(
            &self,
            _stage: &StageContext,
            node: &Node,
            _graph: &Graph,
        ) -> Result<Outcome, WaymarkError> {
            if node.id == "blocker" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(Outcome::success())
        }
    }

    let temp = TempDir::new().expect("temp dir should create");
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let mut registry = core_registry();
    registry.register_type("codergen", Arc::new(BlockingHandler));
    let result = Engine::with_registry(registry)
        .run(
            &graph,
            EngineConfig {
                run_id: Some("run-cancel".to_string()),
                artifacts_base: Some(temp.path().to_path_buf()),
                cancel,
                ..EngineConfig::default()
            },
        )
        .await
        .expect("run should return");

    assert_eq!(result.status, PipelineStatus::Canceled);
    assert_eq!(
        result.events.last().map(|event| event.kind),
        Some(EventKind::PipelineFailed)
    );
    // blocker never completed.
    assert!(!result
        .events
        .iter()
        .any(|event| event.kind == EventKind::StageCompleted
            && event.node_id.as_deref() == Some("blocker")));

    // The final checkpoint reflects completed nodes only; resume would retry
    // the in-flight node.
    let checkpoint =
        Checkpoint::load_from_path(&temp.path().join("run-cancel/checkpoint.json"))
            .expect("checkpoint should load");
    assert_eq!(
        checkpoint.completed_nodes,
        vec!["start".to_string(), "a".to_string()]
    );
    assert_eq!(checkpoint.next_node.as_deref(), Some("blocker"));
}

#[tokio::test(flavor = "current_thread")]
async fn human_gate_routes_on_selected_answer() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            gate [shape=hexagon, label="Ship it?"]
            ship [shape=box]
            fix [shape=box]
            exit [shape=Msquare]
            start -> gate
            gate -> ship [label="Approve", condition="human.selected=Approve"]
            gate -> fix [label="Revise", condition="human.selected=Revise"]
            ship -> exit
            fix -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = Engine::new()
        .run(
            &graph,
            EngineConfig {
                interviewer: Arc::new(QueueInterviewer::with_answers(["Revise"])),
                ..EngineConfig::default()
            },
        )
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert!(result.completed_nodes.iter().any(|node| node == "fix"));
    assert!(!result.completed_nodes.iter().any(|node| node == "ship"));
}

#[tokio::test(flavor = "current_thread")]
async fn event_log_store_captures_run_events_for_queries() {
    let temp = TempDir::new().expect("temp dir should create");
    let event_log = Arc::new(EventLogStore::new(temp.path()).expect("store should create"));
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            a [shape=box]
            exit [shape=Msquare]
            start -> a -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = Engine::new()
        .run(
            &graph,
            EngineConfig {
                run_id: Some("run-logged".to_string()),
                event_log: Some(Arc::clone(&event_log)),
                ..EngineConfig::default()
            },
        )
        .await
        .expect("run should succeed");
    assert_eq!(result.status, PipelineStatus::Success);

    let persisted = event_log
        .query("run-logged", &EventFilter::default())
        .expect("query should succeed");
    assert_eq!(persisted.len(), result.events.len());

    let summary = event_log
        .summarize("run-logged")
        .expect("summary should succeed");
    assert_eq!(summary.by_kind.get("stage.completed"), Some(&3));

    let tail = event_log.tail("run-logged", 1).expect("tail should succeed");
    assert_eq!(tail[0].kind, EventKind::PipelineCompleted);
}

#[tokio::test(flavor = "current_thread")]
async fn verify_node_gates_on_command_exit_code() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            check [shape=octagon, command="test 1 = 1"]
            broken [shape=octagon, command="test 1 = 2"]
            fallback [shape=box]
            exit [shape=Msquare]
            start -> check
            check -> broken [condition="outcome=success"]
            broken -> exit [condition="outcome=success"]
            broken -> fallback [condition="outcome=fail"]
            fallback -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = Engine::new()
        .run(&graph, EngineConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Success);
    assert!(result.completed_nodes.iter().any(|node| node == "fallback"));
    assert_eq!(
        result.context.get("verify.exit_code"),
        Some(&serde_json::json!(1))
    );
}

#[tokio::test(flavor = "current_thread")]
async fn verify_command_postcheck_vetoes_success() {
    let graph = parse_dot(
        r#"
        digraph G {
            start [shape=Mdiamond]
            work [shape=box, verify_command="test 1 = 2"]
            exit [shape=Msquare]
            start -> work -> exit
        }
        "#,
    )
    .expect("graph should parse");

    let result = Engine::new()
        .run(&graph, EngineConfig::default())
        .await
        .expect("run should succeed");

    assert_eq!(result.status, PipelineStatus::Fail);
    assert!(result
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("verify_command"));
}
