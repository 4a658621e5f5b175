//! Sleep job compiler: sleeps for N seconds per frame chunk.
//!
//! Used for testing the whole pipeline without involving Blender.

use crate::database::models::TaskType;
use crate::utils::frames::{RangeStyle, frame_range_merge, iter_frame_range};
use crate::{Error, Result};

use super::commands::Command;
use super::{CompileContext, JobCompiler};

pub struct SleepCompiler;

impl JobCompiler for SleepCompiler {
    fn job_type(&self) -> &'static str {
        "sleep"
    }

    fn required_settings(&self) -> &'static [&'static str] {
        &["frames", "chunk_size", "time_in_seconds"]
    }

    fn compile(&self, ctx: &mut CompileContext) -> Result<()> {
        let job = ctx.job;
        tracing::info!(job_id = %job.id, "compiling sleep job");

        let frames = job.setting_str("frames")?;
        let chunk_size = job.setting_i64("chunk_size")?;
        let time_in_seconds = job.setting_i64("time_in_seconds")?;
        if chunk_size < 1 {
            return Err(Error::job_setting("setting \"chunk_size\" must be at least 1"));
        }

        for chunk_frames in iter_frame_range(&frames, chunk_size as usize)? {
            let name = format!(
                "sleep-{}",
                frame_range_merge(&chunk_frames, RangeStyle::Dash)
            );
            ctx.add_task(
                name,
                TaskType::Sleep,
                vec![
                    Command::Echo {
                        message: "Preparing to sleep".to_string(),
                    },
                    Command::Sleep { time_in_seconds },
                ],
                &[],
                0,
            )?;
        }

        tracing::info!(job_id = %job.id, task_count = ctx.task_count(), "created sleep tasks");
        Ok(())
    }
}
