//! Scripted generator
//!
//! Answers every stage with a sensible default and lets a test override
//! responses, inject failures, add latency or hang a call until it is
//! cancelled. Scripts are keyed by stage, or by file path for CODE_GEN.

use crate::fixtures::{requirements_json, ABC_FILES};
use async_trait::async_trait;
use parking_lot::Mutex;
use stagecraft_core::{
    ExternalGenerator, GenerationError, GenerationRequest, GeneratorSettings, Stage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Target {
    Stage(Stage),
    File(String),
}

impl Target {
    fn of(request: &GenerationRequest) -> Self {
        match &request.file {
            Some(unit) => Target::File(unit.path.clone()),
            None => Target::Stage(request.stage),
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Reply(String),
    Fail(GenerationError),
    Hang,
}

/// One observed generator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub stage: Stage,
    pub file: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Debug, Default)]
struct Script {
    /// One-off steps consumed in order
    queued: VecDeque<Step>,
    /// Answer once the queue is empty
    sticky: Option<Step>,
}

#[derive(Debug)]
pub struct ScriptedGenerator {
    project_name: String,
    files: Vec<String>,
    scripts: Mutex<HashMap<Target, Script>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new("todo", &ABC_FILES)
    }
}

impl ScriptedGenerator {
    /// Generator whose structured stages describe `files` under `project_name`
    #[must_use]
    pub fn new(project_name: &str, files: &[&str]) -> Self {
        Self {
            project_name: project_name.to_string(),
            files: files.iter().map(|f| (*f).to_string()).collect(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep before answering each call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn script(&self, target: Target, f: impl FnOnce(&mut Script)) {
        f(self.scripts.lock().entry(target).or_default());
    }

    /// Always answer `stage` with `text`
    pub fn respond(&self, stage: Stage, text: impl Into<String>) {
        self.script(Target::Stage(stage), |s| s.sticky = Some(Step::Reply(text.into())));
    }

    /// Answer the next call for `stage` with `text`
    pub fn respond_once(&self, stage: Stage, text: impl Into<String>) {
        self.script(Target::Stage(stage), |s| s.queued.push_back(Step::Reply(text.into())));
    }

    /// Fail the next `times` calls for `stage`
    pub fn fail(&self, stage: Stage, error: GenerationError, times: usize) {
        self.script(Target::Stage(stage), |s| {
            s.queued.extend(std::iter::repeat(Step::Fail(error)).take(times));
        });
    }

    /// Never answer the next call for `stage`
    pub fn hang(&self, stage: Stage) {
        self.script(Target::Stage(stage), |s| s.queued.push_back(Step::Hang));
    }

    /// Always answer the CODE_GEN file at `path` with `text`
    pub fn respond_file(&self, path: &str, text: impl Into<String>) {
        self.script(Target::File(path.to_string()), |s| {
            s.sticky = Some(Step::Reply(text.into()));
        });
    }

    /// Answer the next call for the CODE_GEN file at `path` with `text`
    pub fn respond_file_once(&self, path: &str, text: impl Into<String>) {
        self.script(Target::File(path.to_string()), |s| {
            s.queued.push_back(Step::Reply(text.into()));
        });
    }

    /// Fail the next `times` calls for the CODE_GEN file at `path`
    pub fn fail_file(&self, path: &str, error: GenerationError, times: usize) {
        self.script(Target::File(path.to_string()), |s| {
            s.queued.extend(std::iter::repeat(Step::Fail(error)).take(times));
        });
    }

    /// Never answer the next call for the CODE_GEN file at `path`
    pub fn hang_file(&self, path: &str) {
        self.script(Target::File(path.to_string()), |s| s.queued.push_back(Step::Hang));
    }

    /// Every call so far, in arrival order
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Calls made for `stage` (CODE_GEN counts each file)
    #[must_use]
    pub fn calls_for(&self, stage: Stage) -> usize {
        self.calls.lock().iter().filter(|c| c.stage == stage).count()
    }

    /// Calls made for one CODE_GEN file
    #[must_use]
    pub fn file_calls(&self, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.file.as_deref() == Some(path))
            .count()
    }

    /// Highest number of calls observed running at once
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, request: &GenerationRequest) -> Step {
        let target = Target::of(request);
        let mut scripts = self.scripts.lock();
        if let Some(script) = scripts.get_mut(&target) {
            if let Some(step) = script.queued.pop_front() {
                return step;
            }
            if let Some(step) = &script.sticky {
                return step.clone();
            }
        }
        Step::Reply(self.default_reply(request))
    }

    fn default_reply(&self, request: &GenerationRequest) -> String {
        match (request.stage, &request.file) {
            (Stage::RequirementsStructured | Stage::Scaffold, _) => {
                let files: Vec<&str> = self.files.iter().map(String::as_str).collect();
                requirements_json(&self.project_name, &files)
            }
            (Stage::CodeGen, Some(unit)) => {
                format!("```python\n# {}\ndef run():\n    pass\n```", unit.path)
            }
            (stage, _) => match &request.feedback {
                Some(feedback) => format!("{stage} for {} (revised: {feedback})", request.brief),
                None => format!("{stage} for {}", request.brief),
            },
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExternalGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _settings: &GeneratorSettings,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        self.calls.lock().push(RecordedCall {
            stage: request.stage,
            file: request.file.as_ref().map(|u| u.path.clone()),
            feedback: request.feedback.clone(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self.next_step(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match step {
            Step::Reply(text) => Ok(text),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
        }
    }
}
