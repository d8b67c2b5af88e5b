//! Scripted [`CommandRunner`] for tests of the daemons built on this crate.

use parking_lot::Mutex;

use crate::exec::{CommandRunner, ExecutionError, Invocation};

type Handler = dyn Fn(&[String]) -> Result<Vec<String>, ExecutionError> + Send + Sync;

/// Records every invocation and answers from a handler closure.
///
/// Pipelines are recorded as one call: producer argv, `"|"`, consumer argv.
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    handler: Box<Handler>,
}

impl FakeRunner {
    /// Creates a runner answering with `handler`.
    pub fn new(
        handler: impl Fn(&[String]) -> Result<Vec<String>, ExecutionError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        }
    }

    /// A runner that succeeds with no output for everything.
    pub fn silent() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }

    /// Splits canned output into lines.
    pub fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    /// Every recorded argv, oldest first.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Number of recorded invocations.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// True if an invocation with exactly this argv was recorded.
    pub fn called_with(&self, argv: &[&str]) -> bool {
        self.calls
            .lock()
            .iter()
            .any(|call| call.iter().map(String::as_str).eq(argv.iter().copied()))
    }

    /// Forgets recorded invocations.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, argv: Vec<String>) -> Result<Vec<String>, ExecutionError> {
        self.calls.lock().push(argv.clone());
        (self.handler)(&argv)
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> Result<Vec<String>, ExecutionError> {
        let argv = invocation.argv()?;
        self.record(argv)
    }

    fn pipe(
        &self,
        producer: &Invocation,
        consumer: &Invocation,
    ) -> Result<Vec<String>, ExecutionError> {
        let mut argv = producer.argv()?;
        argv.push("|".to_string());
        argv.extend(consumer.argv()?);
        self.record(argv)
    }
}
