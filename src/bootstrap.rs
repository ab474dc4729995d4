//! Engine bootstrap: instantiate the native module with an adaptive memory budget.

use crate::native::NativeEngine;
use crate::vfs::VirtualFileSystem;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const DEFAULT_MEMORY_BUDGET: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MEMORY_STEP: u64 = 16 * 1024 * 1024;
pub const DEFAULT_FILE_ROOT: &str = "/vfs";

/// Line sink receiving the engine's diagnostic output.
pub type DiagnosticSink = Rc<dyn Fn(&str)>;

#[derive(Clone, Default)]
pub struct DiagnosticSinks {
    pub stdout: Option<DiagnosticSink>,
    pub stderr: Option<DiagnosticSink>,
}

impl DiagnosticSinks {
    pub fn print(&self, line: &str) {
        debug!(target: "viewer_bridge::engine", "{line}");
        if let Some(sink) = &self.stdout {
            sink(line);
        }
    }

    pub fn print_err(&self, line: &str) {
        warn!(target: "viewer_bridge::engine", "{line}");
        if let Some(sink) = &self.stderr {
            sink(line);
        }
    }
}

impl fmt::Debug for DiagnosticSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticSinks")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub memory_budget: u64,
    pub memory_step: u64,
    pub file_root: String,
    pub sinks: DiagnosticSinks,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            memory_step: DEFAULT_MEMORY_STEP,
            file_root: DEFAULT_FILE_ROOT.to_string(),
            sinks: DiagnosticSinks::default(),
        }
    }
}

/// What the module receives for one instantiation attempt.
pub struct InstantiateRequest<'a> {
    pub memory_budget: u64,
    pub file_root: &'a str,
    pub sinks: &'a DiagnosticSinks,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstantiateError {
    /// The runtime could not reserve the requested memory; a smaller budget may succeed.
    #[error("allocation of {budget} bytes failed")]
    OutOfMemory { budget: u64 },
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

/// A freshly instantiated runtime that has not signalled readiness yet.
pub struct Instantiated {
    pub engine: Rc<dyn NativeEngine>,
    pub files: Rc<dyn VirtualFileSystem>,
    pub ready: oneshot::Receiver<()>,
}

/// A loadable native engine module.
pub trait EngineModule {
    fn name(&self) -> &str;
    fn instantiate(&self, request: &InstantiateRequest<'_>) -> Result<Instantiated, InstantiateError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BootstrapError {
    #[error("memory exhausted after {attempts} attempts (last budget {last_budget} bytes)")]
    MemoryExhausted { attempts: u32, last_budget: u64 },
    #[error("engine instantiation failed: {0}")]
    Fatal(String),
    #[error("engine runtime aborted before signalling readiness")]
    InitAborted,
    #[error("invalid bootstrap options: {0}")]
    InvalidOptions(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Instantiated,
    OutOfMemory,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapAttempt {
    pub memory_budget: u64,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub attempts: Vec<BootstrapAttempt>,
}

impl BootstrapReport {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// A ready engine runtime.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Rc<dyn NativeEngine>,
    files: Rc<dyn VirtualFileSystem>,
    memory_budget: u64,
    module: String,
    report: BootstrapReport,
}

impl EngineHandle {
    pub fn engine(&self) -> Rc<dyn NativeEngine> {
        self.engine.clone()
    }

    pub fn files(&self) -> Rc<dyn VirtualFileSystem> {
        self.files.clone()
    }

    pub fn file_root(&self) -> &str {
        self.files.root()
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn report(&self) -> &BootstrapReport {
        &self.report
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("module", &self.module)
            .field("memory_budget", &self.memory_budget)
            .field("file_root", &self.file_root())
            .field("attempts", &self.report.attempt_count())
            .finish()
    }
}

/// Upper bound on instantiation attempts for a budget and step.
pub fn max_attempts(budget: u64, step: u64) -> u64 {
    if step == 0 {
        return 1;
    }
    budget.div_ceil(step)
}

/// Instantiates `module`, shrinking the memory budget by `options.memory_step` after every
/// allocation failure, then waits for the runtime's readiness signal.
pub async fn create_runtime<M: EngineModule + ?Sized>(
    module: &M,
    options: RuntimeOptions,
) -> Result<EngineHandle, BootstrapError> {
    if options.memory_budget == 0 {
        return Err(BootstrapError::InvalidOptions("memory budget must be positive"));
    }
    if options.memory_step == 0 {
        return Err(BootstrapError::InvalidOptions("memory step must be positive"));
    }

    let mut report = BootstrapReport::default();
    let mut budget = options.memory_budget;
    let instantiated = loop {
        let request =
            InstantiateRequest { memory_budget: budget, file_root: &options.file_root, sinks: &options.sinks };
        debug!(module = module.name(), budget, "instantiating engine module");
        match module.instantiate(&request) {
            Ok(instantiated) => {
                report.attempts.push(BootstrapAttempt { memory_budget: budget, outcome: AttemptOutcome::Instantiated });
                break instantiated;
            }
            Err(InstantiateError::OutOfMemory { .. }) => {
                report.attempts.push(BootstrapAttempt { memory_budget: budget, outcome: AttemptOutcome::OutOfMemory });
                let next = budget.saturating_sub(options.memory_step);
                warn!(module = module.name(), budget, next, "engine allocation failed, shrinking memory budget");
                if next == 0 {
                    return Err(BootstrapError::MemoryExhausted {
                        attempts: report.attempt_count(),
                        last_budget: budget,
                    });
                }
                budget = next;
            }
            Err(InstantiateError::Fatal(message)) => {
                report.attempts.push(BootstrapAttempt { memory_budget: budget, outcome: AttemptOutcome::Fatal });
                return Err(BootstrapError::Fatal(message));
            }
        }
    };

    instantiated.ready.await.map_err(|_| BootstrapError::InitAborted)?;
    info!(module = module.name(), budget, attempts = report.attempt_count(), "engine runtime ready");
    Ok(EngineHandle {
        engine: instantiated.engine,
        files: instantiated.files,
        memory_budget: budget,
        module: module.name().to_string(),
        report,
    })
}
