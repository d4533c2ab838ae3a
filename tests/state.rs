//! Compilation errors, queries, snapshots and the local execution pool.

mod common;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::harness;
use planrunner::ambiance::TriggerInfo;
use planrunner::execution::{InMemoryStore, NodeExecutionStore};
use planrunner::orchestration::TimelineListener;
use planrunner::plan::Definition;
use planrunner::{
    load_definition, CompileError, Engine, EngineConfig, ExecutionSnapshot, NodeExecutionQuery,
    PlanCreator, Projection, Status, StepRegistry,
};

const TWO_STEPS: &str = r#"
pipeline:
  identifier: small
  name: Small
  stages:
    - stage:
        identifier: only
        spec:
          execution:
            steps:
              - step:
                  identifier: first
                  type: ShellScript
                  spec:
                    script: succeed
              - step:
                  identifier: second
                  type: Noop
"#;

fn compile(yaml: &str) -> Result<planrunner::Plan, CompileError> {
    let definition = Definition::from_yaml_str(yaml)?;
    PlanCreator::standard(StepRegistry::with_builtins()).compile(&definition)
}

#[test]
fn test_compile_errors_are_specific() {
    let unknown = compile(
        r#"
pipeline:
  identifier: p
  stages:
    - stage:
        identifier: s
        spec:
          execution:
            steps:
              - step:
                  identifier: x
                  type: Teleport
"#,
    );
    assert!(matches!(unknown, Err(CompileError::UnknownStepType { .. })));

    let duplicate = compile(
        r#"
pipeline:
  identifier: p
  stages:
    - stage:
        identifier: s
        spec:
          execution:
            steps:
              - step:
                  identifier: x
                  type: Noop
              - step:
                  identifier: x
                  type: Noop
"#,
    );
    assert!(matches!(
        duplicate,
        Err(CompileError::DuplicateIdentifier { ref identifier, .. }) if identifier == "x"
    ));

    let rollback = compile(
        r#"
pipeline:
  identifier: p
  failureStrategies:
    - onFailure:
        errors: [AllErrors]
        action:
          type: StageRollback
  stages:
    - stage:
        identifier: s
        spec:
          execution:
            steps:
              - step:
                  identifier: x
                  type: Noop
"#,
    );
    assert!(matches!(rollback, Err(CompileError::RollbackNotDefined { .. })));

    let unhandled = compile("teleport:\n  identifier: p\n");
    assert!(matches!(unhandled, Err(CompileError::NoCreator { .. })));
}

#[test]
fn test_load_definition_from_yaml_and_json() {
    let dir = TempDir::new().unwrap();

    let yaml_path = dir.path().join("pipeline.yaml");
    fs::write(&yaml_path, TWO_STEPS).unwrap();
    let from_yaml = load_definition(&yaml_path).unwrap();
    assert_eq!(from_yaml.name(), "Small");

    let value: serde_json::Value = serde_yaml::from_str(TWO_STEPS).unwrap();
    let json_path = dir.path().join("pipeline.json");
    fs::write(&json_path, serde_json::to_string(&value).unwrap()).unwrap();
    let from_json = load_definition(&json_path).unwrap();
    assert_eq!(from_json.name(), "Small");

    let missing = load_definition(dir.path().join("nope.yaml"));
    assert!(matches!(missing, Err(CompileError::Parse(_))));
}

#[test]
fn test_projection_limits_fields() {
    let h = harness();
    let id = h.run(TWO_STEPS);

    let rows = h.engine.query(
        &NodeExecutionQuery::for_plan(&id).with_statuses([Status::Succeeded]),
        &Projection::fields(["identifier", "status"]),
    );
    assert!(!rows.is_empty());
    for row in &rows {
        assert_eq!(row.len(), 2);
        assert_eq!(row["status"], "SUCCEEDED");
    }
    assert!(rows.iter().any(|r| r["identifier"] == "second"));

    let everything = h
        .engine
        .query(&NodeExecutionQuery::for_plan(&id), &Projection::all());
    assert!(everything.iter().all(|r| r.contains_key("ambiance")));
}

#[test]
fn test_snapshot_round_trip() {
    let h = harness();
    let id = h.run(TWO_STEPS);
    let dir = TempDir::new().unwrap();

    let snapshot = ExecutionSnapshot::capture(h.engine.store().as_ref(), &id).unwrap();
    let path = snapshot.save(dir.path()).unwrap();
    assert!(path.exists());

    let loaded = ExecutionSnapshot::load(dir.path(), &id).unwrap();
    assert_eq!(loaded.node_executions.len(), snapshot.node_executions.len());

    let store = InMemoryStore::new();
    loaded.restore_into(&store).unwrap();
    assert_eq!(store.plan_execution(&id).unwrap().status, Status::Succeeded);

    let original = h.engine.store().get(&h.node(&id, "second").uuid).unwrap();
    assert_eq!(store.get(&original.uuid).unwrap(), original);

    ExecutionSnapshot::delete(dir.path(), &id).unwrap();
    assert!(!path.exists());
}

#[test]
fn test_timeline_records_spans() {
    let timeline = Arc::new(TimelineListener::new());
    let engine = Engine::builder()
        .with_execution_pool(Arc::new(common::ScriptedPool::new()))
        .with_listener(timeline.clone())
        .build();

    let plan = compile(TWO_STEPS).unwrap();
    engine
        .start_plan(plan, BTreeMap::new(), TriggerInfo::default())
        .unwrap();
    engine.run_until_idle();

    let durations = timeline.durations();
    assert!(durations.contains_key("first"));
    assert!(durations.contains_key("second"));

    let chart = timeline.gantt_chart();
    assert!(chart.contains("first"));
    assert!(chart.contains("second"));
}

#[test]
fn test_local_pool_runs_bash() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        state_dir: dir.path().to_path_buf(),
        ..EngineConfig::default()
    };
    let engine = Engine::builder().with_config(config).build();

    let plan = compile(
        r#"
pipeline:
  identifier: real
  stages:
    - stage:
        identifier: s
        spec:
          execution:
            steps:
              - step:
                  identifier: greet
                  type: ShellScript
                  spec:
                    script: GREETING="hello $NAME"
                    env:
                      NAME: world
                    outputVariables: [GREETING]
              - step:
                  identifier: broken
                  type: ShellScript
                  spec:
                    script: exit 3
"#,
    )
    .unwrap();
    let id = engine
        .start_plan(plan, BTreeMap::new(), TriggerInfo::default())
        .unwrap();

    let execution = engine
        .run_until_complete(&id, Duration::from_secs(30))
        .unwrap();
    assert_eq!(execution.status, Status::Failed);

    let outputs = engine.store().outputs(&id);
    let greeting = outputs.iter().find(|o| o.name == "GREETING").unwrap();
    assert_eq!(greeting.value, serde_json::json!("hello world"));

    let broken = engine
        .store()
        .find(&NodeExecutionQuery::for_plan(&id))
        .into_iter()
        .find(|r| r.identifier == "broken")
        .unwrap();
    assert_eq!(broken.status, Status::Failed);
}

#[test]
fn test_config_file_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("planrunner.yaml");
    fs::write(&path, "workers: 2\ntask_timeout_secs: 5\n").unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert_eq!(config.workers, 2);
    assert_eq!(config.task_timeout(), Duration::from_secs(5));
    assert_eq!(
        config.retention_ttl_secs,
        EngineConfig::default().retention_ttl_secs
    );

    fs::write(&path, "workers: [").unwrap();
    assert!(EngineConfig::load(&path).is_err());
}
