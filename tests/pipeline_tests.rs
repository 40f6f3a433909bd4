//! Worker pipeline tests against a scripted tool runtime
//!
//! Each test builds a definition + fixture tree in a temp directory, queues the instance in a fresh store,
//! and runs it through `Pipeline::run_single_test` the way a `run-one` worker would.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tempfile::TempDir;
use toolcheck::capture::{Channel, DiagnosticChannels, DiagnosticSink};
use toolcheck::pipeline::Pipeline;
use toolcheck::tool::{ToolError, ToolRuntime};
use toolcheck_core::{Env, Parameter, RunResult, Status, TestDefinition, definition};
use toolcheck_store::ResultStore;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

const TEST_ID: &str = "nv5_toolbox.Buffer.default";

/// What the fake tool does when invoked.
enum Script {
    /// Write `contents` to the path in parameter `out`
    WriteOutput(&'static [u8]),
    Fail(&'static str),
    Panic,
    /// Succeed without touching anything
    Nothing,
}

struct FakeRuntime {
    script: Script,
    calls: Mutex<Vec<(PathBuf, String, BTreeMap<String, String>)>>,
}

impl FakeRuntime {
    fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ToolRuntime for FakeRuntime {
    fn invoke(
        &self,
        toolbox: &Path,
        alias: &str,
        params: &BTreeMap<String, String>,
        channels: &DiagnosticChannels,
    ) -> Result<(), ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((toolbox.to_path_buf(), alias.to_string(), params.clone()));
        channels.emit(Channel::Message, "Start Time: now");
        match &self.script {
            Script::WriteOutput(contents) => {
                fs::write(&params["out"], contents)?;
                Ok(())
            }
            Script::Fail(message) => {
                channels.emit(Channel::Error, message);
                Err(ToolError::Failed {
                    what: alias.to_string(),
                    status: "exit status: 1".to_string(),
                    message: message.to_string(),
                })
            }
            Script::Panic => panic!("tool blew up"),
            Script::Nothing => Ok(()),
        }
    }

    fn list_tools(&self, _toolbox: &Path) -> Result<Vec<String>, ToolError> {
        Ok(Vec::new())
    }

    fn describe_parameters(&self, _toolbox: &Path, _alias: &str) -> Result<Vec<Parameter>, ToolError> {
        Ok(Vec::new())
    }
}

struct Fixture {
    dir: TempDir,
    store: ResultStore,
    definition_path: PathBuf,
    run_id: i64,
}

impl Fixture {
    fn test_dir(&self) -> PathBuf {
        self.dir.path().join("tests").join(TEST_ID)
    }

    fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    fn toolboxes(&self) -> PathBuf {
        self.dir.path().join("toolboxes").join("target")
    }

    fn run(&self, runtime: &FakeRuntime) -> RunResult {
        self.run_as(runtime, self.run_id)
    }

    fn run_as(&self, runtime: &FakeRuntime, run_id: i64) -> RunResult {
        Pipeline::new(&self.store, runtime, self.toolboxes())
            .with_scratch_root(self.scratch())
            .run_single_test(&self.definition_path, run_id, Env::Target, BoxMakeWriter::new(io::sink))
            .unwrap()
    }

    /// Queue and claim the same instance again under a new run.
    fn requeue(&self) -> i64 {
        let run = self
            .store
            .enqueue_run(&[TEST_ID.to_string()], &[Env::Target], false, Utc::now() - Duration::minutes(1))
            .unwrap()
            .unwrap();
        assert_eq!(self.store.dequeue(Env::Target).unwrap().unwrap().run_id, run.run_id);
        run.run_id
    }

    fn set_outputs(&self, outputs: &[&str]) {
        let mut test = definition::parse(&fs::read_to_string(&self.definition_path).unwrap()).unwrap();
        test.outputs = outputs.iter().map(|o| o.to_string()).collect();
        fs::write(&self.definition_path, definition::serialize(&test)).unwrap();
    }

    fn instance(&self) -> (Status, Option<RunResult>) {
        let snapshot = self.store.fetch_all().unwrap();
        let row = snapshot
            .instances
            .iter()
            .find(|i| i.env == Env::Target && i.test_id == TEST_ID)
            .unwrap();
        (row.status, row.run_result)
    }

    fn log_text(&self) -> String {
        let logs = self.test_dir().join("logs");
        let entries: Vec<_> = fs::read_dir(&logs).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(entries.len(), 1, "expected one log in {}", logs.display());
        fs::read_to_string(&entries[0]).unwrap()
    }
}

/// Definition with `out = inputs/result.tif` and `outputs = [inputs/result.tif]`, queued and dequeued for target.
fn fixture(run_local: bool, with_inputs: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let test_dir = dir.path().join("tests").join(TEST_ID);
    fs::create_dir_all(test_dir.join("inputs")).unwrap();
    if with_inputs {
        fs::write(test_dir.join("inputs").join("spans.csv"), "id,len\n1,152\n").unwrap();
    }

    let mut test = TestDefinition::new("nv5_toolbox/nv5_toolbox.atbx", "Buffer");
    test.description = "buffer spans".to_string();
    test.run_local = run_local;
    test.parameters = vec![
        Parameter::new("in_table", "inputs/spans.csv"),
        Parameter::new("distance", "152"),
        Parameter::new("out", "inputs/result.tif"),
    ];
    test.outputs = vec!["inputs/result.tif".to_string()];
    let definition_path = test_dir.join(format!("{TEST_ID}.ini"));
    fs::write(&definition_path, definition::serialize(&test)).unwrap();

    let store = ResultStore::open(dir.path().join("results.sqlite"));
    let run = store
        .enqueue_run(&[TEST_ID.to_string()], &[Env::Target], false, Utc::now() - Duration::minutes(1))
        .unwrap()
        .unwrap();
    store.dequeue(Env::Target).unwrap().unwrap();

    Fixture {
        dir,
        store,
        definition_path,
        run_id: run.run_id,
    }
}

#[test]
fn test_pass_materializes_byte_identical_output() {
    let fx = fixture(true, true);
    let bytes: &[u8] = b"II*\x00raster\xff\x00bytes";
    let runtime = FakeRuntime::new(Script::WriteOutput(bytes));

    assert_eq!(fx.run(&runtime), RunResult::Pass);
    assert_eq!(fx.instance(), (Status::Complete, Some(RunResult::Pass)));

    let staged = fx.scratch().join(format!("inputs_target_{TEST_ID}"));
    let saved = fx.test_dir().join(format!("outputs_target_{TEST_ID}")).join("result.tif");
    assert_eq!(fs::read(&saved).unwrap(), fs::read(staged.join("result.tif")).unwrap());
    assert_eq!(fs::read(&saved).unwrap(), bytes);
    assert!(staged.join("spans.csv").is_file(), "inputs were staged");
}

#[test]
fn test_parameters_point_into_staged_copy() {
    let fx = fixture(true, true);
    let runtime = FakeRuntime::new(Script::WriteOutput(b"x"));
    fx.run(&runtime);

    let calls = runtime.calls.lock().unwrap();
    let (toolbox, alias, params) = &calls[0];
    let staged = fx.scratch().join(format!("inputs_target_{TEST_ID}"));
    assert_eq!(toolbox, &fx.toolboxes().join("nv5_toolbox/nv5_toolbox.atbx"));
    assert_eq!(alias, "Buffer");
    assert_eq!(params["distance"], "152");
    assert_eq!(PathBuf::from(&params["in_table"]), staged.join("spans.csv"));
}

#[test]
fn test_non_local_stages_beside_definition() {
    let fx = fixture(false, true);
    let runtime = FakeRuntime::new(Script::WriteOutput(b"x"));

    assert_eq!(fx.run(&runtime), RunResult::Pass);
    assert!(fx.test_dir().join(format!("inputs_target_{TEST_ID}")).join("result.tif").is_file());
    assert!(!fx.scratch().join(format!("inputs_target_{TEST_ID}")).exists());
}

#[test]
fn test_empty_inputs_fail_without_invoking_tool() {
    let fx = fixture(true, false);
    let runtime = FakeRuntime::new(Script::WriteOutput(b"x"));

    assert_eq!(fx.run(&runtime), RunResult::Fail);
    assert_eq!(runtime.call_count(), 0);
    assert_eq!(fx.instance(), (Status::Complete, Some(RunResult::Fail)));
    assert!(fx.log_text().contains("No inputs in"));
}

#[test]
fn test_tool_failure_is_logged_and_leaves_outputs_alone() {
    let fx = fixture(true, true);
    let runtime = FakeRuntime::new(Script::Fail("ERROR 000865: Input Features does not exist"));

    assert_eq!(fx.run(&runtime), RunResult::Fail);
    assert_eq!(fx.instance(), (Status::Complete, Some(RunResult::Fail)));
    assert!(!fx.test_dir().join(format!("outputs_target_{TEST_ID}")).exists());

    let log = fx.log_text();
    assert!(log.contains("ERROR 000865: Input Features does not exist"));
    assert!(log.contains("FAIL: tool invocation failed"));
    assert!(log.contains("Start Time: now"), "tool messages reach the log at DEBUG");
}

#[test]
fn test_tool_failure_keeps_outputs_of_an_earlier_pass() {
    let fx = fixture(true, true);
    assert_eq!(fx.run(&FakeRuntime::new(Script::WriteOutput(b"first pass"))), RunResult::Pass);
    let saved = fx.test_dir().join(format!("outputs_target_{TEST_ID}")).join("result.tif");
    let modified = fs::metadata(&saved).unwrap().modified().unwrap();

    let second_run = fx.requeue();
    let runtime = FakeRuntime::new(Script::Fail("ERROR 000210: Cannot create output"));
    assert_eq!(fx.run_as(&runtime, second_run), RunResult::Fail);

    assert_eq!(fs::read(&saved).unwrap(), b"first pass");
    assert_eq!(fs::metadata(&saved).unwrap().modified().unwrap(), modified);
    let outputs: Vec<_> = fs::read_dir(saved.parent().unwrap()).unwrap().collect();
    assert_eq!(outputs.len(), 1);
}

#[derive(Default)]
struct Recorder(Mutex<Vec<(Channel, String)>>);

impl DiagnosticSink for Recorder {
    fn emit(&self, channel: Channel, text: &str) {
        self.0.lock().unwrap().push((channel, text.to_string()));
    }
}

#[test]
fn test_tool_errors_still_reach_the_callers_sink() {
    let fx = fixture(true, true);
    let recorder = Arc::new(Recorder::default());
    let channels = DiagnosticChannels::new(recorder.clone());
    let runtime = FakeRuntime::new(Script::Fail("ERROR 000865: Input Features does not exist"));

    let result = Pipeline::new(&fx.store, &runtime, fx.toolboxes())
        .with_channels(channels.clone())
        .with_scratch_root(fx.scratch())
        .run_single_test(&fx.definition_path, fx.run_id, Env::Target, BoxMakeWriter::new(io::sink))
        .unwrap();
    assert_eq!(result, RunResult::Fail);

    // "Start Time" went to the log only.
    assert_eq!(
        recorder.0.lock().unwrap().clone(),
        vec![(Channel::Error, "ERROR 000865: Input Features does not exist".to_string())]
    );
    channels.emit(Channel::Message, "after the test");
    assert_eq!(recorder.0.lock().unwrap().len(), 2, "capture ends with the test");
}

#[test]
fn test_output_outside_test_directory_is_malformed() {
    let fx = fixture(true, true);
    fx.set_outputs(&["inputs/result.tif", "inputs/../../escaped.txt"]);
    // What `inputs/../../escaped.txt` resolves to under the scratch root.
    fs::write(fx.dir.path().join("escaped.txt"), "not a test output").unwrap();
    let runtime = FakeRuntime::new(Script::WriteOutput(b"x"));

    assert_eq!(fx.run(&runtime), RunResult::Fail);
    assert_eq!(runtime.call_count(), 1);
    assert!(!fx.dir.path().join("tests").join("escaped.txt").exists());
    assert!(!fx.test_dir().join(format!("outputs_target_{TEST_ID}")).exists());
    assert!(fx.log_text().contains("leaves the test directory"));
}

#[test]
fn test_tool_panic_is_recorded_as_fail() {
    let fx = fixture(true, true);
    let runtime = FakeRuntime::new(Script::Panic);

    assert_eq!(fx.run(&runtime), RunResult::Fail);
    assert_eq!(fx.instance(), (Status::Complete, Some(RunResult::Fail)));
    assert!(fx.log_text().contains("tool panicked: tool blew up"));
}

#[test]
fn test_missing_declared_output_is_malformed() {
    let fx = fixture(true, true);
    let runtime = FakeRuntime::new(Script::Nothing);

    assert_eq!(fx.run(&runtime), RunResult::Fail);
    assert!(fx.log_text().contains("is neither a file nor a directory"));
}

#[test]
fn test_unparseable_definition_fails() {
    let fx = fixture(true, true);
    fs::write(&fx.definition_path, "[test]\nalias = Buffer\n").unwrap();
    let runtime = FakeRuntime::new(Script::Nothing);

    assert_eq!(fx.run(&runtime), RunResult::Fail);
    assert_eq!(runtime.call_count(), 0);
    assert!(fx.log_text().contains("invalid definition"));
}

#[test]
fn test_unqueued_instance_is_a_store_error() {
    let fx = fixture(true, true);
    let runtime = FakeRuntime::new(Script::Nothing);
    let err = Pipeline::new(&fx.store, &runtime, fx.toolboxes())
        .with_scratch_root(fx.scratch())
        .run_single_test(&fx.definition_path, fx.run_id + 1, Env::Target, BoxMakeWriter::new(io::sink))
        .unwrap_err();
    assert!(err.to_string().contains("illegal status transition"), "{err}");
    assert_eq!(runtime.call_count(), 0);
}
