//! Job compilers: expand a job's settings into a DAG of tasks.
//!
//! Each job type maps to exactly one compiler. The registry is an
//! explicit map built at startup. Compilers never touch the store
//! directly: they emit tasks into a [`CompileContext`], and the job
//! service inserts the whole batch in one transaction, so a half-compiled
//! job can never leak runnable tasks.

pub mod blender_render;
pub mod blender_render_progressive;
pub mod blender_video_chunks;
pub mod chunk_generator;
pub mod commands;
pub mod exec_command;
pub mod sleep;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::database::models::{JobDbModel, ManagerDbModel, TaskDbModel, TaskType};
use crate::{Error, Result};
use commands::Command;

pub use chunk_generator::ChunkGenerator;

/// Compilation context handed to a [`JobCompiler`].
///
/// Collects the tasks the compiler creates; the job service persists them
/// afterwards. Also exposes the job's Manager so compilers can gate tasks
/// on advertised worker capabilities.
pub struct CompileContext<'c> {
    pub job: &'c JobDbModel,
    manager: Option<&'c ManagerDbModel>,
    tasks: Vec<TaskDbModel>,
}

impl<'c> CompileContext<'c> {
    pub fn new(job: &'c JobDbModel, manager: Option<&'c ManagerDbModel>) -> Self {
        Self {
            job,
            manager,
            tasks: Vec::new(),
        }
    }

    /// Create an under-construction task and return its ID for use as a
    /// parent of later tasks.
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        task_type: TaskType,
        commands: Vec<Command>,
        parents: &[String],
        priority: i64,
    ) -> Result<String> {
        let task = TaskDbModel::new(self.job, name, task_type, &commands, parents, priority)?;
        let task_id = task.id.clone();
        self.tasks.push(task);
        Ok(task_id)
    }

    /// Whether the job's Manager advertised support for the given task
    /// type. An unknown Manager advertises nothing.
    pub fn manager_supports(&self, task_type: TaskType) -> bool {
        self.manager
            .map(|m| m.supports_task_type(task_type.as_str()))
            .unwrap_or(false)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn into_tasks(self) -> Vec<TaskDbModel> {
        self.tasks
    }
}

/// A compiler for one job type.
pub trait JobCompiler: Send + Sync {
    /// The job-type string this compiler is registered under.
    fn job_type(&self) -> &'static str;

    /// Settings that must be present for compilation to make sense.
    fn required_settings(&self) -> &'static [&'static str] {
        &[]
    }

    /// Validate the job settings without creating any task. Idempotent
    /// and side-effect free; reports every missing setting at once.
    fn validate_job_settings(&self, job: &JobDbModel) -> Result<()> {
        validate_required_settings(self.required_settings(), job)
    }

    /// Expand the (validated) job into tasks. Must be deterministic for
    /// identical input so a job can be recreated.
    fn compile(&self, ctx: &mut CompileContext) -> Result<()>;
}

/// Check that all required settings are present, naming every missing one.
pub fn validate_required_settings(required: &[&str], job: &JobDbModel) -> Result<()> {
    let settings = job.get_settings();
    let missing: Vec<&str> = required
        .iter()
        .filter(|key| !settings.contains_key(**key))
        .copied()
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    let noun = if missing.len() == 1 {
        "setting"
    } else {
        "settings"
    };
    Err(Error::job_setting(format!(
        "Job {} is missing required {noun}: {}",
        job.id,
        missing.join(", ")
    )))
}

/// Map from job-type string to its compiler.
pub struct CompilerRegistry {
    compilers: HashMap<&'static str, Box<dyn JobCompiler>>,
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self {
            compilers: HashMap::new(),
        }
    }

    /// Registry with all built-in job types.
    pub fn with_default_compilers() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(sleep::SleepCompiler));
        registry.register(Box::new(exec_command::ExecCommandCompiler));
        registry.register(Box::new(blender_render::BlenderRenderCompiler));
        registry.register(Box::new(
            blender_render_progressive::BlenderRenderProgressiveCompiler,
        ));
        registry.register(Box::new(blender_video_chunks::BlenderVideoChunksCompiler));
        registry
    }

    pub fn register(&mut self, compiler: Box<dyn JobCompiler>) {
        self.compilers.insert(compiler.job_type(), compiler);
    }

    pub fn get(&self, job_type: &str) -> Option<&dyn JobCompiler> {
        self.compilers.get(job_type).map(|c| c.as_ref())
    }

    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.compilers.keys().copied().collect();
        types.sort_unstable();
        types
    }
}

impl Default for CompilerRegistry {
    fn default() -> Self {
        Self::with_default_compilers()
    }
}

/// The intermediate directory for a job's render output: a sibling of the
/// final directory, suffixed with the job creation timestamp so recreated
/// jobs get a fresh one deterministically.
pub fn intermediate_path(job: &JobDbModel, render_path: &Path) -> Result<PathBuf> {
    let created = job.created_at_utc()?;
    let dir_name = render_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let intermediate = format!(
        "{dir_name}__intermediate-{}",
        created.format("%Y-%m-%d_%H%M%S")
    );
    Ok(render_path.with_file_name(intermediate))
}
