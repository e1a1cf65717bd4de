
use std::sync::Arc;

use stage_runner::config::{PipelineConfig, RunConfig};
use stage_runner::manifest::Manifest;
use stage_runner::pipeline::Pipeline;
use stage_runner::progress::{Phase, ProgressEvent};
use test_harness::{fast_marker, POLL, TOKEN};

fn manifest(dir: &std::path::Path) -> Manifest {
    let d = dir.display();
    format!(
        r#"{{
        "stages": [
            {{ "name": "Pairwise", "threads": 2, "jobs": [
                {{ "name": "pair_1", "args": ["sh", "-c", "echo '{TOKEN}'"],
                   "stdout": "{d}/pair_1.stdout", "marker": "{d}/pair_1.stdout" }},
                {{ "name": "pair_2", "args": ["sh", "-c", "echo '{TOKEN}' > {d}/pair_2.out; echo '{TOKEN}'"],
                   "stdout": "{d}/pair_2.stdout", "marker": "{d}/pair_2.stdout",
                   "output": "{d}/pair_2.out", "after": "pair_1" }}
            ] }},
            {{ "name": "Characterize", "background": true, "jobs": [
                {{ "name": "char_1", "args": ["sh", "-c", "exit 0"],
                   "stdout": "{d}/char_1.stdout", "marker": "{d}/char_1.stdout" }}
            ] }}
        ]
    }}"#
    )
    .parse()
    .unwrap()
}

fn config(dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        run: RunConfig::new(1, POLL),
        marker: fast_marker(),
        report_path: Some(dir.join("pipeline.report")),
        status_log: Some(dir.join("status.log")),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_manifest_stages_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest(dir.path());
    let pipeline = Arc::new(Pipeline::new(config(dir.path())));

    let background_stage = &manifest.stages[1];
    let handle = pipeline.spawn_stage(
        background_stage.build(&pipeline).unwrap(),
        background_stage.run_config(&pipeline.config().run),
    );

    let stage = &manifest.stages[0];
    let mut batch = stage.build(&pipeline).unwrap();
    let ok = pipeline
        .run_stage_with(&mut batch, &stage.run_config(&pipeline.config().run))
        .await
        .unwrap();
    assert!(ok);
    assert!(batch.jobs()[1].output_found());

    let (background, outcome) = handle.await.unwrap();
    assert!(!outcome.unwrap());
    assert_eq!(
        background.simple_report(),
        format!("Job failed: {}\n", dir.path().join("char_1.stdout").display())
    );
    pipeline.shutdown().await;

    let report = std::fs::read_to_string(dir.path().join("pipeline.report")).unwrap();
    assert!(report.contains("Pairwise: sh -c echo 'END of output'"));
    assert!(report.contains("  Completed 2 jobs on 2 threads"));
    assert!(report.contains("  Result Found"));
    assert!(report.contains("Begin machine parsable segment for: Characterize"));
    assert!(report.contains("  Stdout INCOMPLETE:"));

    let events: Vec<ProgressEvent> = std::fs::read_to_string(dir.path().join("status.log"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    for group in ["Pairwise", "Characterize"] {
        let phases: Vec<Phase> = events
            .iter()
            .filter(|e| e.group == group)
            .map(|e| e.phase)
            .collect();
        assert_eq!(phases.first(), Some(&Phase::StageStart));
        assert_eq!(phases.last(), Some(&Phase::StageComplete));
    }
    assert!(events
        .iter()
        .any(|e| e.group == "Pairwise" && e.phase == Phase::StagePctDone && e.value == "100.0"));
}

#[tokio::test]
async fn test_empty_stage_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(config(dir.path()));
    let manifest: Manifest = r#"{ "stages": [ { "name": "Nothing" } ] }"#.parse().unwrap();

    let mut batch = manifest.stages[0].build(&pipeline).unwrap();
    assert!(pipeline.run_stage(&mut batch).await.unwrap());
    assert!(!dir.path().join("pipeline.report").exists());
}

#[tokio::test]
async fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{ "run": { "concurrency_limit": 6, "throttle": 2 },
             "marker": { "success_token": "DONE" },
             "cluster": { "log_dir": "/scratch/logs", "native_spec": "-pe openmp $numthreads" } }"#,
    )
    .unwrap();

    let config = PipelineConfig::load(&path).unwrap();
    assert_eq!(config.run.concurrency_limit, 6);
    assert_eq!(config.run.poll_interval_ms, 10);
    assert_eq!(config.run.throttle, Some(2));
    assert_eq!(config.marker.success_token, "DONE");
    assert_eq!(config.marker.tries, 20);
    assert!(config.cluster.is_enabled());

    let pipeline = Pipeline::new(config);
    assert!(pipeline.gateway().is_some());
}
