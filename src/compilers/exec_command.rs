//! Exec-command job compiler: runs a single shell command.
//!
//! For ad hoc admin debugging only.

use crate::Result;
use crate::database::models::TaskType;

use super::commands::Command;
use super::{CompileContext, JobCompiler};

pub struct ExecCommandCompiler;

impl JobCompiler for ExecCommandCompiler {
    fn job_type(&self) -> &'static str {
        "exec-command"
    }

    fn required_settings(&self) -> &'static [&'static str] {
        &["cmd"]
    }

    fn compile(&self, ctx: &mut CompileContext) -> Result<()> {
        let job = ctx.job;
        tracing::info!(job_id = %job.id, "compiling exec-command job");

        let cmd = job.setting_str("cmd")?;
        ctx.add_task(
            "exec-command",
            TaskType::Debug,
            vec![Command::Exec { cmd }],
            &[],
            0,
        )?;
        Ok(())
    }
}
