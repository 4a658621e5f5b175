//! Basic Blender render job compiler.
//!
//! Splits the frame range into chunks and renders each chunk in an
//! independent task, writing into an intermediate directory. When the job
//! asks for an image-sequence-to-video step and the Manager's workers can
//! encode video, a single encoding task is chained behind all render
//! tasks. A final file-management task moves the intermediate directory
//! into place, safely backing up any pre-existing destination.

use std::path::{Path, PathBuf};

use crate::database::models::TaskType;
use crate::utils::frames::{RangeStyle, frame_range_merge, iter_frame_range};
use crate::{Error, Result};

use super::commands::Command;
use super::{CompileContext, JobCompiler, intermediate_path};

pub struct BlenderRenderCompiler;

impl JobCompiler for BlenderRenderCompiler {
    fn job_type(&self) -> &'static str {
        "blender-render"
    }

    fn required_settings(&self) -> &'static [&'static str] {
        &["blender_cmd", "filepath", "render_output", "frames", "chunk_size"]
    }

    fn validate_job_settings(&self, job: &crate::database::models::JobDbModel) -> Result<()> {
        super::validate_required_settings(self.required_settings(), job)?;

        if job.setting_i64("chunk_size")? < 1 {
            return Err(Error::job_setting("setting \"chunk_size\" must be at least 1"));
        }
        // fps is optional, but when present it gates the video task and
        // must be numeric.
        if job.setting("fps").is_some() {
            job.setting_f64("fps")?;
        }
        Ok(())
    }

    fn compile(&self, ctx: &mut CompileContext) -> Result<()> {
        let job = ctx.job;
        tracing::info!(job_id = %job.id, "compiling blender-render job");

        let blender_cmd = job.setting_str("blender_cmd")?;
        let filepath = job.setting_str("filepath")?;
        let render_output = PathBuf::from(job.setting_str("render_output")?);
        let frames = job.setting_str("frames")?;
        let chunk_size = job.setting_i64("chunk_size")? as usize;
        let format = job.setting_str("format").ok();

        // The render output contains a filename pattern ('######' or
        // similar); its parent is the directory the frames land in.
        let render_path = render_output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let intermediate = intermediate_path(job, &render_path)?;
        let intermediate_output = intermediate.join(
            render_output
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "######".to_string()),
        );

        let mut render_task_ids = Vec::new();
        for chunk_frames in iter_frame_range(&frames, chunk_size)? {
            let frame_range = frame_range_merge(&chunk_frames, RangeStyle::Dash);
            let frame_range_bstyle = frame_range_merge(&chunk_frames, RangeStyle::Blender);

            let task_id = ctx.add_task(
                format!("blender-render-{frame_range}"),
                TaskType::BlenderRender,
                vec![Command::BlenderRender {
                    blender_cmd: blender_cmd.clone(),
                    filepath: filepath.clone(),
                    format: format.clone(),
                    render_output: Some(intermediate_output.to_string_lossy().into_owned()),
                    frames: frame_range_bstyle,
                }],
                &[],
                0,
            )?;
            render_task_ids.push(task_id);
        }

        let video_task_id = self.make_video_task(ctx, &intermediate, &render_task_ids)?;

        // The move runs after whatever the last stage is.
        let move_parents = match video_task_id {
            Some(task_id) => vec![task_id],
            None => render_task_ids,
        };
        ctx.add_task(
            "move-to-final",
            TaskType::FileManagement,
            vec![Command::MoveToFinal {
                src: intermediate.to_string_lossy().into_owned(),
                dest: render_path.to_string_lossy().into_owned(),
            }],
            &move_parents,
            0,
        )?;

        tracing::info!(job_id = %job.id, task_count = ctx.task_count(), "created render tasks");
        Ok(())
    }
}

impl BlenderRenderCompiler {
    /// Create the image-sequence-to-video task, when the job settings ask
    /// for one and the Manager can run it.
    fn make_video_task(
        &self,
        ctx: &mut CompileContext,
        intermediate: &Path,
        render_task_ids: &[String],
    ) -> Result<Option<String>> {
        let job = ctx.job;
        let (Ok(fps), Ok(extension)) = (
            job.setting_f64("fps"),
            job.setting_str("output_file_extension"),
        ) else {
            return Ok(None);
        };
        if !ctx.manager_supports(TaskType::VideoEncoding) {
            tracing::debug!(
                job_id = %job.id,
                "manager does not support video-encoding, skipping video task"
            );
            return Ok(None);
        }

        let image_ext = image_extension(job.setting_str("format").ok().as_deref());
        let stem = Path::new(&job.setting_str("filepath")?)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string());

        let task_id = ctx.add_task(
            "create-video",
            TaskType::VideoEncoding,
            vec![Command::CreateVideo {
                input_files: intermediate
                    .join(format!("*.{image_ext}"))
                    .to_string_lossy()
                    .into_owned(),
                output_file: intermediate
                    .join(format!("{stem}{extension}"))
                    .to_string_lossy()
                    .into_owned(),
                fps,
            }],
            render_task_ids,
            0,
        )?;
        Ok(Some(task_id))
    }
}

/// File extension of the frames Blender writes for a given render format.
fn image_extension(format: Option<&str>) -> &'static str {
    match format.map(str::to_ascii_uppercase).as_deref() {
        Some("EXR" | "OPEN_EXR") => "exr",
        Some("JPEG" | "JPG") => "jpg",
        Some("TGA") => "tga",
        _ => "png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{JobDbModel, ManagerDbModel, TaskDbModel};

    fn render_job(extra: serde_json::Value) -> JobDbModel {
        let mut settings = serde_json::json!({
            "blender_cmd": "{blender}",
            "filepath": "/jobs/shot_010.blend",
            "render_output": "/render/shot_010/frames-######",
            "format": "EXR",
            "frames": "1-6",
            "chunk_size": 3,
        });
        if let (Some(base), Some(add)) = (settings.as_object_mut(), extra.as_object()) {
            for (key, value) in add {
                base.insert(key.clone(), value.clone());
            }
        }
        let mut job = JobDbModel::new(
            "render",
            "",
            "blender-render",
            settings,
            "project-1",
            "user-1",
            "manager-1",
            50,
            false,
        );
        job.created_at = "2026-08-06T10:00:00+00:00".to_string();
        job
    }

    fn compile(job: &JobDbModel, manager: &ManagerDbModel) -> Vec<TaskDbModel> {
        let compiler = BlenderRenderCompiler;
        compiler.validate_job_settings(job).unwrap();
        let mut ctx = CompileContext::new(job, Some(manager));
        compiler.compile(&mut ctx).unwrap();
        ctx.into_tasks()
    }

    #[test]
    fn test_image_extension() {
        assert_eq!(image_extension(Some("EXR")), "exr");
        assert_eq!(image_extension(Some("exr")), "exr");
        assert_eq!(image_extension(Some("JPEG")), "jpg");
        assert_eq!(image_extension(None), "png");
    }

    #[test]
    fn test_render_tasks_are_siblings_writing_to_intermediate() {
        let job = render_job(serde_json::json!({}));
        let tasks = compile(&job, &ManagerDbModel::new("manager-1", "farm"));

        // 2 render chunks plus the final move; no video without fps.
        assert_eq!(tasks.len(), 3);
        let renders: Vec<&TaskDbModel> = tasks
            .iter()
            .filter(|t| t.name.starts_with("blender-render-"))
            .collect();
        assert_eq!(renders.len(), 2);
        for render in &renders {
            assert!(render.is_root());
            match &render.get_commands().unwrap()[0] {
                Command::BlenderRender { render_output, .. } => {
                    let output = render_output.as_deref().unwrap();
                    assert!(output.contains("__intermediate-2026-08-06_100000"));
                }
                other => panic!("expected blender_render, got {}", other.name()),
            }
        }

        let move_task = tasks.iter().find(|t| t.name == "move-to-final").unwrap();
        let parents = move_task.get_parents();
        assert_eq!(parents.len(), 2);
        for render in &renders {
            assert!(parents.contains(&render.id));
        }
    }

    #[test]
    fn test_video_task_gated_on_manager_support() {
        let job = render_job(serde_json::json!({
            "fps": 24,
            "output_file_extension": ".mp4",
        }));

        // Manager without video-encoding workers: no video task.
        let mut manager = ManagerDbModel::new("manager-1", "farm");
        manager.worker_task_types = Some(r#"["blender-render", "file-management"]"#.to_string());
        let tasks = compile(&job, &manager);
        assert!(!tasks.iter().any(|t| t.name == "create-video"));

        // Manager with video-encoding workers: the move runs after the
        // video task, which runs after every render.
        manager.worker_task_types = None;
        let tasks = compile(&job, &manager);
        let video = tasks.iter().find(|t| t.name == "create-video").unwrap();
        assert_eq!(video.get_parents().len(), 2);
        let move_task = tasks.iter().find(|t| t.name == "move-to-final").unwrap();
        assert_eq!(move_task.get_parents(), vec![video.id.clone()]);
    }
}
