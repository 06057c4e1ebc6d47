//! Scheduler integration tests.
//!
//! Exercises DAG execution end to end against the shell runner: failure
//! propagation, gate conditions, output propagation, artifact flow,
//! concurrency limits, cancellation, and resume.

use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

use gantry::core::{ArtifactStore, EventStore, JobExecutor, Pipeline, RunLimits, Scheduler};
use gantry::domain::{JobStatus, Run, RunState, TriggerContext};
use gantry::runners::ShellRunner;

fn scheduler(base: &std::path::Path, concurrency: usize) -> Scheduler {
    let executor = JobExecutor::new(
        Arc::new(ShellRunner::new()),
        Arc::new(ArtifactStore::new(base)),
        RunLimits::default(),
    );
    Scheduler::new(Arc::new(executor), concurrency)
}

async fn run_in(
    base: &std::path::Path,
    yaml: &str,
    trigger: TriggerContext,
    concurrency: usize,
) -> Run {
    let pipeline = Pipeline::from_yaml(yaml).unwrap();
    let store = Arc::new(EventStore::open_in(base, Uuid::new_v4()).await.unwrap());
    let (_cancel_tx, cancel) = watch::channel(false);
    scheduler(base, concurrency)
        .run(&pipeline, trigger, store, cancel)
        .await
        .unwrap()
}

async fn run_yaml(yaml: &str) -> Run {
    let temp = TempDir::new().unwrap();
    run_in(temp.path(), yaml, TriggerContext::default(), 4).await
}

const DIAMOND_YAML: &str = r#"
name: diamond
jobs:
  test:
    steps: [{name: unit tests, run: "TEST_CMD"}]
  lint:
    steps: [{name: clippy, run: "true"}]
  build:
    needs: [test, lint]
    steps: [{name: compile, run: "true"}]
  docker:
    needs: [build]
    steps: [{name: image, run: "true"}]
"#;

#[tokio::test]
async fn failing_test_skips_build_and_docker() {
    let run = run_yaml(&DIAMOND_YAML.replace("TEST_CMD", "exit 1")).await;

    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.job_status("test"), Some(JobStatus::Failed));
    assert_eq!(run.job_status("lint"), Some(JobStatus::Succeeded));
    assert_eq!(run.job_status("build"), Some(JobStatus::Skipped));
    assert_eq!(run.job_status("docker"), Some(JobStatus::Skipped));
}

#[tokio::test]
async fn all_green_diamond_completes() {
    let run = run_yaml(&DIAMOND_YAML.replace("TEST_CMD", "true")).await;

    assert_eq!(run.state, RunState::Completed);
    assert!(run.all_succeeded());
}

#[tokio::test]
async fn failing_scan_fails_docker_and_skips_deploy() {
    let run = run_yaml(
        r#"
name: scan
jobs:
  test:
    steps: [{name: t, run: "true"}]
  lint:
    steps: [{name: l, run: "true"}]
  build:
    needs: [test, lint]
    steps: [{name: b, run: "true"}]
  docker:
    needs: [build]
    steps:
      - name: build image
        run: "true"
      - name: scan image
        run: "echo 'critical CVE found' >&2; exit 1"
  deploy:
    needs: [docker]
    steps: [{name: d, run: "true"}]
"#,
    )
    .await;

    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.job_status("docker"), Some(JobStatus::Failed));
    assert_eq!(run.job_status("deploy"), Some(JobStatus::Skipped));

    let docker = &run.jobs["docker"];
    assert_eq!(docker.exit_code, Some(1));
    assert!(docker.error.as_deref().unwrap().contains("critical CVE"));
}

#[tokio::test]
async fn outputs_propagate_exactly() {
    let temp = TempDir::new().unwrap();
    let probe = temp.path().join("observed.txt");

    let yaml = format!(
        r#"
name: outputs
jobs:
  build:
    outputs: [image_tag]
    steps:
      - name: publish
        run: echo image_tag=app:abc123 >> "$GANTRY_OUTPUT"
  deploy:
    needs: [build]
    steps:
      - name: consume
        run: printf '%s' '${{needs.build.image_tag}}' > {probe}
"#,
        probe = probe.display()
    );

    let run = run_in(temp.path(), &yaml, TriggerContext::default(), 4).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(
        run.jobs["build"].outputs.get("image_tag").unwrap(),
        "app:abc123"
    );
    assert_eq!(std::fs::read_to_string(&probe).unwrap(), "app:abc123");
}

#[tokio::test]
async fn undeclared_output_reference_fails_consumer() {
    let run = run_yaml(
        r#"
name: missing-output
jobs:
  build:
    steps: [{name: b, run: "true"}]
  deploy:
    needs: [build]
    steps: [{name: d, run: "echo ${needs.build.image_tag}"}]
"#,
    )
    .await;

    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.job_status("build"), Some(JobStatus::Succeeded));
    assert_eq!(run.job_status("deploy"), Some(JobStatus::Failed));
}

#[tokio::test]
async fn continue_on_error_admits_dependents() {
    let run = run_yaml(
        r#"
name: soft-fail
jobs:
  canary:
    continue_on_error: true
    steps: [{name: c, run: "exit 1"}]
  release:
    needs: [canary]
    steps: [{name: r, run: "true"}]
"#,
    )
    .await;

    // The dependent ran, but the run still reports the failure
    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.job_status("canary"), Some(JobStatus::Failed));
    assert_eq!(run.job_status("release"), Some(JobStatus::Succeeded));
}

#[tokio::test]
async fn false_condition_skips_job_and_dependents() {
    let trigger = TriggerContext::new("push", "feature/x", "abc", "ci");
    let temp = TempDir::new().unwrap();
    let run = run_in(
        temp.path(),
        r#"
name: gated
jobs:
  build:
    steps: [{name: b, run: "true"}]
  publish:
    needs: [build]
    if: branch == "main"
    steps: [{name: p, run: "true"}]
  announce:
    needs: [publish]
    steps: [{name: a, run: "true"}]
"#,
        trigger,
        4,
    )
    .await;

    // A condition skip is not a failure
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.job_status("build"), Some(JobStatus::Succeeded));
    assert_eq!(run.job_status("publish"), Some(JobStatus::Skipped));
    assert_eq!(run.job_status("announce"), Some(JobStatus::Skipped));
}

#[tokio::test]
async fn failure_gate_runs_cleanup() {
    let run = run_yaml(
        r#"
name: cleanup
jobs:
  deploy:
    steps: [{name: d, run: "exit 1"}]
  rollback:
    needs: [deploy]
    if: failure()
    steps: [{name: r, run: "true"}]
  celebrate:
    needs: [deploy]
    steps: [{name: c, run: "true"}]
"#,
    )
    .await;

    assert!(matches!(run.state, RunState::Failed { .. }));
    assert_eq!(run.job_status("rollback"), Some(JobStatus::Succeeded));
    assert_eq!(run.job_status("celebrate"), Some(JobStatus::Skipped));
}

#[tokio::test]
async fn best_effort_step_does_not_fail_job() {
    let run = run_yaml(
        r#"
name: soft-step
jobs:
  test:
    steps:
      - name: optional suite
        run: "exit 1"
        best_effort: true
      - name: required suite
        run: "true"
  report:
    needs: [test]
    steps: [{name: r, run: "true"}]
"#,
    )
    .await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.job_status("test"), Some(JobStatus::Succeeded));
    assert_eq!(run.job_status("report"), Some(JobStatus::Succeeded));
}

#[tokio::test]
async fn artifacts_flow_between_jobs() {
    let temp = TempDir::new().unwrap();
    let probe = temp.path().join("fetched.txt");

    let yaml = format!(
        r#"
name: artifacts
jobs:
  build:
    artifacts:
      - name: dist
        path: out/dist.bin
    steps:
      - name: make
        run: mkdir -p out && printf 'payload-v1' > out/dist.bin
  deploy:
    needs: [build]
    fetch:
      - job: build
        artifact: dist
    steps:
      - name: inspect
        run: cp dist {}
"#,
        probe.display()
    );

    let run = run_in(temp.path(), &yaml, TriggerContext::default(), 4).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.jobs["build"].artifacts.len(), 1);
    assert_eq!(std::fs::read_to_string(&probe).unwrap(), "payload-v1");
}

#[tokio::test]
async fn workspaces_are_isolated_between_jobs() {
    // Without an artifact fetch, files from one job are invisible downstream
    let run = run_yaml(
        r#"
name: isolation
jobs:
  writer:
    steps: [{name: w, run: "touch scratch.txt"}]
  reader:
    needs: [writer]
    steps: [{name: r, run: "test ! -f scratch.txt"}]
"#,
    )
    .await;

    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn concurrency_one_serializes_jobs() {
    let temp = TempDir::new().unwrap();
    let lock_probe = temp.path().join("overlap");

    // Each job fails if it observes another job mid-flight
    let yaml = format!(
        r#"
name: serial
jobs:
  a:
    steps: [{{name: s, run: "test ! -f {probe} && touch {probe} && sleep 0.2 && rm {probe}"}}]
  b:
    steps: [{{name: s, run: "test ! -f {probe} && touch {probe} && sleep 0.2 && rm {probe}"}}]
  c:
    steps: [{{name: s, run: "test ! -f {probe} && touch {probe} && sleep 0.2 && rm {probe}"}}]
"#,
        probe = lock_probe.display()
    );

    let run = run_in(temp.path(), &yaml, TriggerContext::default(), 1).await;

    assert_eq!(run.state, RunState::Completed);
    assert!(run.all_succeeded());
}

#[tokio::test]
async fn independent_jobs_run_in_parallel() {
    let temp = TempDir::new().unwrap();

    // Each job waits for the other's marker; deadlocks unless both run
    // concurrently. The step timeout bounds the failure mode.
    let yaml = format!(
        r#"
name: parallel
jobs:
  left:
    steps:
      - name: s
        run: "touch {dir}/left && for i in $(seq 1 50); do test -f {dir}/right && exit 0; sleep 0.1; done; exit 1"
        timeout_seconds: 10
  right:
    steps:
      - name: s
        run: "touch {dir}/right && for i in $(seq 1 50); do test -f {dir}/left && exit 0; sleep 0.1; done; exit 1"
        timeout_seconds: 10
"#,
        dir = temp.path().display()
    );

    let run = run_in(temp.path(), &yaml, TriggerContext::default(), 2).await;

    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn cancellation_skips_everything_unfinished() {
    let temp = TempDir::new().unwrap();
    let pipeline = Pipeline::from_yaml(
        r#"
name: cancel
jobs:
  slow:
    steps: [{name: s, run: "sleep 10"}]
  after:
    needs: [slow]
    steps: [{name: s, run: "true"}]
"#,
    )
    .unwrap();

    let store = Arc::new(
        EventStore::open_in(temp.path(), Uuid::new_v4())
            .await
            .unwrap(),
    );
    let (cancel_tx, cancel) = watch::channel(false);
    let sched = scheduler(temp.path(), 2);

    let handle = tokio::spawn(async move {
        sched
            .run(&pipeline, TriggerContext::default(), store, cancel)
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    cancel_tx.send(true).unwrap();

    let run = handle.await.unwrap().unwrap();

    assert_eq!(run.state, RunState::Cancelled);
    assert_eq!(run.job_status("slow"), Some(JobStatus::Skipped));
    assert_eq!(run.job_status("after"), Some(JobStatus::Skipped));
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let yaml = DIAMOND_YAML.replace("TEST_CMD", "exit 1");
    let first = run_yaml(&yaml).await;
    let second = run_yaml(&yaml).await;

    for job_id in ["test", "lint", "build", "docker"] {
        assert_eq!(first.job_status(job_id), second.job_status(job_id));
    }
}

#[tokio::test]
async fn resume_reruns_only_unfinished_jobs() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("a-runs");
    let flag = temp.path().join("fixed");

    let yaml = format!(
        r#"
name: resumable
jobs:
  prepare:
    outputs: [version]
    steps:
      - name: count
        run: echo ran >> {counter} && echo version=1.2.3 >> "$GANTRY_OUTPUT"
  flaky:
    needs: [prepare]
    steps:
      - name: gate
        run: test -f {flag}
  finish:
    needs: [flaky]
    steps:
      - name: f
        run: test "${{needs.prepare.version}}" = 1.2.3
"#,
        counter = counter.display(),
        flag = flag.display()
    );

    let pipeline = Pipeline::from_yaml(&yaml).unwrap();
    let run_id = Uuid::new_v4();

    // First attempt: flaky fails, finish is skipped
    {
        let store = Arc::new(EventStore::open_in(temp.path(), run_id).await.unwrap());
        let (_tx, cancel) = watch::channel(false);
        let run = scheduler(temp.path(), 2)
            .run(&pipeline, TriggerContext::default(), store, cancel)
            .await
            .unwrap();

        assert!(matches!(run.state, RunState::Failed { .. }));
        assert_eq!(run.job_status("flaky"), Some(JobStatus::Failed));
        assert_eq!(run.job_status("finish"), Some(JobStatus::Skipped));
    }

    // Fix the environment, resume the same run
    std::fs::write(&flag, b"").unwrap();
    {
        let store = Arc::new(EventStore::open_in(temp.path(), run_id).await.unwrap());
        let (_tx, cancel) = watch::channel(false);
        let run = scheduler(temp.path(), 2)
            .resume(&pipeline, store, cancel)
            .await
            .unwrap();

        assert_eq!(run.state, RunState::Completed);
        assert!(run.all_succeeded());
    }

    // prepare executed exactly once across both attempts, and its recorded
    // output satisfied finish on resume
    assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn no_job_starts_before_dependencies_succeed() {
    let temp = TempDir::new().unwrap();
    let order = temp.path().join("order.log");

    let yaml = format!(
        r#"
name: ordering
jobs:
  first:
    steps: [{{name: s, run: "sleep 0.2 && echo first >> {order}"}}]
  second:
    needs: [first]
    steps: [{{name: s, run: "echo second >> {order}"}}]
"#,
        order = order.display()
    );

    let run = run_in(temp.path(), &yaml, TriggerContext::default(), 4).await;

    assert_eq!(run.state, RunState::Completed);
    let recorded = std::fs::read_to_string(&order).unwrap();
    assert_eq!(recorded.lines().collect::<Vec<_>>(), vec!["first", "second"]);
}
