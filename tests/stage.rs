mod common;

use std::fs;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8Path;

use common::{
    FailingFilter, Fixture, RecordingSink, UppercaseFilter, WriteSource, output, stage_id,
};
use kira_pipeline::domain::{LogCategory, StageKind};
use kira_pipeline::error::PipelineError;
use kira_pipeline::ledger::Outcome;
use kira_pipeline::log_store::LogStore;
use kira_pipeline::store::ObjectStore;
use kira_pipeline::stage::{
    FilterLogic, SourceLogic, Stage, StageBehavior, StageContext, StageOutput, StagedInput,
};

fn filter_stage(logic: impl FilterLogic + 'static) -> Stage {
    Stage::new(
        stage_id(1, "normalize"),
        "",
        StageBehavior::Filter(Box::new(logic)),
        output("001-normalize"),
    )
}

fn sink_stage(seen: Arc<Mutex<Vec<kira_pipeline::FileRef>>>) -> Stage {
    Stage::new(
        stage_id(2, "publish"),
        "",
        StageBehavior::Sink(Box::new(RecordingSink { seen })),
        output("002-publish"),
    )
}

#[test]
fn filter_publishes_outputs_and_cleans_up() {
    let fixture = Fixture::new();
    let a = fixture.put_remote("data/geo/raw", "a.pcl", 100, b"gene\t1\n");
    let stage = filter_stage(UppercaseFilter::default());

    let record = stage.process(&fixture.services, &[a], 100).unwrap();

    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.processed, 1);
    assert_eq!(record.outputs.len(), 1);
    assert_eq!(
        record.outputs[0].path().as_str(),
        "data/geo/001-normalize/a.out.100.none"
    );
    assert_eq!(fixture.read_remote(&record.outputs[0]), b"GENE\t1\n");
    assert!(!fixture.workspace_root(stage.id(), 100).as_std_path().exists());

    let recorded = fixture
        .services
        .ledger()
        .last(stage.id(), 100)
        .unwrap()
        .unwrap();
    assert_eq!(recorded, record);
}

#[test]
fn failed_stage_persists_logs_before_reporting() {
    let fixture = Fixture::new();
    let a = fixture.put_remote("data/geo/raw", "a.pcl", 100, b"x");
    let stage = filter_stage(FailingFilter);

    let err = stage.process(&fixture.services, &[a], 100).unwrap_err();

    assert_matches!(
        &err,
        PipelineError::StageFailed { stage, timestamp: 100, logs, .. }
            if stage == "001-normalize" && logs.len() == 2
    );
    assert_matches!(err.cause(), PipelineError::StageLogic { .. });

    let logs = fixture.services.logs();
    let log = logs
        .get(LogCategory::Log, "001-normalize/run.log", Some(100))
        .unwrap();
    assert_eq!(log, b"starting\n");
    let error = logs
        .get(LogCategory::Error, "001-normalize/run.err", Some(100))
        .unwrap();
    assert_eq!(error, b"matrix is malformed\n");

    assert!(!fixture.workspace_root(stage.id(), 100).as_std_path().exists());
    let record = fixture
        .services
        .ledger()
        .last(stage.id(), 100)
        .unwrap()
        .unwrap();
    assert_eq!(record.outcome, Outcome::Failed);
    assert_eq!(record.logs.len(), 2);
    assert!(record.error.unwrap().contains("matrix is malformed"));
}

#[test]
fn zero_input_sink_processes_nothing() {
    let fixture = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stage = sink_stage(seen.clone());

    let record = stage.sink(&fixture.services, &[], 100).unwrap();

    assert_eq!(record.processed, 0);
    assert!(record.outputs.is_empty());
    assert!(seen.lock().unwrap().is_empty());
    assert!(fixture.store.list(Utf8Path::new("")).unwrap().is_empty());
}

#[test]
fn zero_byte_inputs_are_skipped() {
    let fixture = Fixture::new();
    let empty = fixture.put_remote("data/geo/raw", "empty.pcl", 100, b"");
    let full = fixture.put_remote("data/geo/raw", "full.pcl", 100, b"1");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stage = sink_stage(seen.clone());

    let record = stage.sink(&fixture.services, &[empty, full.clone()], 100).unwrap();

    assert_eq!(record.processed, 1);
    assert_eq!(*seen.lock().unwrap(), vec![full]);
}

#[test]
fn wrong_entry_point_is_misuse() {
    let fixture = Fixture::new();
    let sink = sink_stage(Arc::default());
    let filter = filter_stage(UppercaseFilter::default());

    let err = sink.process(&fixture.services, &[], 100).unwrap_err();
    assert_matches!(
        err,
        PipelineError::Misuse { operation: "process", ref kind, .. } if kind == "sink"
    );
    assert!(filter.sink(&fixture.services, &[], 100).unwrap_err().is_misuse());
    assert!(filter.retrieve(&fixture.services, 100).unwrap_err().is_misuse());
    assert!(sink.recover(&fixture.services, &[], 100).unwrap_err().is_misuse());
    assert!(filter.recover_sink(&fixture.services, &[], 100).unwrap_err().is_misuse());
    assert!(sink.stage_out(&fixture.services, Vec::new(), 100).unwrap_err().is_misuse());

    assert!(!fixture.workspace_root(sink.id(), 100).as_std_path().exists());
    assert!(fixture.services.ledger().last(sink.id(), 100).unwrap().is_none());
}

#[test]
fn source_without_outputs_fails() {
    let fixture = Fixture::new();
    let stage = Stage::new(
        stage_id(0, "discover"),
        "",
        StageBehavior::Source(Box::new(WriteSource { files: Vec::new() })),
        output("000-discover"),
    );
    assert_eq!(stage.kind(), StageKind::Source);

    let err = stage.retrieve(&fixture.services, 100).unwrap_err();
    assert_matches!(err.cause(), PipelineError::StageLogic { .. });
}

#[test]
fn repeated_filter_run_is_idempotent() {
    let fixture = Fixture::new();
    let a = fixture.put_remote("data/geo/raw", "a.pcl", 100, b"abc");
    let b = fixture.put_remote("data/geo/raw", "b.pcl", 100, b"def");
    let stage = filter_stage(UppercaseFilter::default());

    let first = stage
        .process(&fixture.services, &[a.clone(), b.clone()], 100)
        .unwrap();
    let second = stage.process(&fixture.services, &[a, b], 100).unwrap();

    assert_eq!(first.outputs, second.outputs);
    assert_eq!(fixture.read_remote(&second.outputs[0]), b"ABC");
    assert_eq!(fixture.read_remote(&second.outputs[1]), b"DEF");
}

#[test]
fn unclean_workspace_blocks_run_until_recovered() {
    let fixture = Fixture::new();
    let a = fixture.put_remote("data/geo/raw", "a.pcl", 100, b"abc");
    let stage = filter_stage(UppercaseFilter::default());

    let dirs = fixture.services.workspace().layout(stage.id(), 100);
    fs::create_dir_all(dirs.output.as_std_path()).unwrap();
    fs::write(dirs.output.join("partial.out").as_std_path(), b"half").unwrap();

    let err = stage
        .process(&fixture.services, &[a.clone()], 100)
        .unwrap_err();
    assert_matches!(err, PipelineError::StageInit { .. });
    assert!(dirs.root.as_std_path().exists());

    let record = stage.recover(&fixture.services, &[a], 100).unwrap();
    assert_eq!(record.outputs.len(), 1);
    assert!(!dirs.root.as_std_path().exists());
}

#[test]
fn recover_reuses_recorded_outputs() {
    struct CountingSource {
        calls: Arc<Mutex<usize>>,
    }

    impl SourceLogic for CountingSource {
        fn retrieve(
            &self,
            ctx: &mut StageContext<'_>,
        ) -> Result<Vec<StageOutput>, PipelineError> {
            *self.calls.lock().unwrap() += 1;
            let path = ctx.dirs().output.join("a.pcl");
            fs::write(path.as_std_path(), b"a").unwrap();
            Ok(vec![StageOutput::Local(path)])
        }
    }

    let fixture = Fixture::new();
    let calls = Arc::new(Mutex::new(0));
    let stage = Stage::new(
        stage_id(0, "discover"),
        "",
        StageBehavior::Source(Box::new(CountingSource {
            calls: calls.clone(),
        })),
        output("000-discover"),
    );

    let first = stage.retrieve(&fixture.services, 100).unwrap();
    let recovered = stage.recover(&fixture.services, &[], 100).unwrap();
    assert_eq!(first, recovered);
    assert_eq!(*calls.lock().unwrap(), 1);

    fixture.services.gateway().remove(&first.outputs[0]).unwrap();
    let rerun = stage.recover(&fixture.services, &[], 100).unwrap();
    assert_eq!(rerun.outputs, first.outputs);
    assert_eq!(*calls.lock().unwrap(), 2);
}

#[test]
fn meta_files_carry_over_between_runs() {
    struct MetaSource;

    impl SourceLogic for MetaSource {
        fn retrieve(
            &self,
            ctx: &mut StageContext<'_>,
        ) -> Result<Vec<StageOutput>, PipelineError> {
            let seen = ctx.dirs().meta.join("seen.txt");
            let mut content = fs::read_to_string(seen.as_std_path()).unwrap_or_default();
            content.push_str(&format!("{}\n", ctx.timestamp()));
            fs::write(seen.as_std_path(), &content).unwrap();

            let path = ctx.dirs().output.join("ids.txt");
            fs::write(path.as_std_path(), &content).unwrap();
            Ok(vec![StageOutput::Local(path)])
        }
    }

    let fixture = Fixture::new();
    let stage = Stage::new(
        stage_id(0, "discover"),
        "",
        StageBehavior::Source(Box::new(MetaSource)),
        output("000-discover"),
    );

    stage.retrieve(&fixture.services, 100).unwrap();
    let second = stage.retrieve(&fixture.services, 200).unwrap();

    assert_eq!(fixture.read_remote(&second.outputs[0]), b"100\n200\n");
    let bundles = fixture
        .services
        .gateway()
        .list(&fixture.services.workspace().remote_meta_dir(stage.id()))
        .unwrap();
    assert_eq!(bundles.len(), 2);
}

#[test]
fn log_files_are_classified_by_name() {
    assert_eq!(LogStore::classify("convert.out"), LogCategory::Out);
    assert_eq!(LogStore::classify("convert.err"), LogCategory::Error);
    assert_eq!(LogStore::classify("run.log"), LogCategory::Log);
    assert_eq!(LogStore::classify("notes.md"), LogCategory::Other);
}

#[test]
fn inputs_staging_to_the_same_file_are_rejected() {
    let fixture = Fixture::new();
    let from_x = fixture.put_remote("data/x", "a.pcl", 100, b"from-x");
    let from_y = fixture.put_remote("data/y", "a.pcl", 100, b"from-y");
    let older = fixture.put_remote("data/x", "a.pcl", 90, b"older");
    let logic = UppercaseFilter::default();
    let seen = logic.seen.clone();
    let stage = filter_stage(logic);

    let err = stage
        .process(&fixture.services, &[from_x.clone(), from_y], 100)
        .unwrap_err();
    assert_matches!(err.cause(), PipelineError::Transfer { .. });

    let err = stage
        .process(&fixture.services, &[older, from_x], 100)
        .unwrap_err();
    assert_matches!(err.cause(), PipelineError::Transfer { .. });

    assert!(seen.lock().unwrap().is_empty());
    assert!(
        fixture
            .store
            .list(Utf8Path::new("data/geo/001-normalize"))
            .unwrap()
            .is_empty()
    );
}

#[test]
fn meta_filter_rerun_at_same_timestamp_is_idempotent() {
    struct SeenCounter;

    impl FilterLogic for SeenCounter {
        fn process(
            &self,
            inputs: &[StagedInput],
            ctx: &mut StageContext<'_>,
        ) -> Result<Vec<StageOutput>, PipelineError> {
            let seen = ctx.dirs().meta.join("seen.txt");
            let mut content = fs::read_to_string(seen.as_std_path()).unwrap_or_default();
            for input in inputs {
                content.push_str(&format!("{}\n", input.file_ref.name()));
            }
            fs::write(seen.as_std_path(), &content).unwrap();

            let path = ctx.dirs().output.join("count.txt");
            fs::write(path.as_std_path(), content.lines().count().to_string()).unwrap();
            Ok(vec![StageOutput::Local(path)])
        }
    }

    let fixture = Fixture::new();
    let a = fixture.put_remote("data/geo/raw", "a.pcl", 100, b"a");
    let b = fixture.put_remote("data/geo/raw", "b.pcl", 200, b"b");
    let stage = filter_stage(SeenCounter);

    let first = stage.process(&fixture.services, &[a.clone()], 100).unwrap();
    let again = stage.process(&fixture.services, &[a], 100).unwrap();
    assert_eq!(first.outputs, again.outputs);
    assert_eq!(fixture.read_remote(&again.outputs[0]), b"1");

    let next = stage.process(&fixture.services, &[b], 200).unwrap();
    assert_eq!(fixture.read_remote(&next.outputs[0]), b"2");
}

#[test]
fn failed_stage_out_records_what_was_published() {
    struct HalfMissing;

    impl FilterLogic for HalfMissing {
        fn process(
            &self,
            _inputs: &[StagedInput],
            ctx: &mut StageContext<'_>,
        ) -> Result<Vec<StageOutput>, PipelineError> {
            let good = ctx.dirs().output.join("good.out");
            fs::write(good.as_std_path(), b"ok").unwrap();
            let missing = ctx.dirs().output.join("missing.out");
            Ok(vec![StageOutput::Local(good), StageOutput::Local(missing)])
        }
    }

    let fixture = Fixture::new();
    let stage = filter_stage(HalfMissing);

    assert!(stage.process(&fixture.services, &[], 100).is_err());

    let record = fixture
        .services
        .ledger()
        .last(stage.id(), 100)
        .unwrap()
        .unwrap();
    assert_eq!(record.outcome, Outcome::Failed);
    let outputs: Vec<String> = record.outputs.iter().map(ToString::to_string).collect();
    assert_eq!(outputs, vec!["data/geo/001-normalize/good.out.100.none"]);
    assert_eq!(fixture.read_remote(&record.outputs[0]), b"ok");
}
