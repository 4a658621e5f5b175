//! Progressive Blender render job compiler.
//!
//! Renders increasing numbers of Cycles samples and merges them into a
//! progressively refining output, so users see a rough image quickly and
//! a converged one later. Sample chunks come from [`ChunkGenerator`];
//! each chunk renders per frame-chunk, then merges into the previous
//! result by weighted average. Preview images and videos are generated
//! after every chunk, chained sequentially so they never overlap even
//! though the render/merge DAG is wide.

use std::path::{Path, PathBuf};

use crate::database::models::{JobDbModel, TaskType};
use crate::jobs::rna_overrides::{RNA_OVERRIDES_FILENAME, as_python_file, validate_rna_overrides};
use crate::utils::frames::{RangeStyle, frame_range_merge, iter_frame_range};
use crate::{Error, Result};

use super::chunk_generator::{ChunkGenerator, DEFAULT_UNCAPPED_CHUNKS};
use super::commands::Command;
use super::{CompileContext, JobCompiler, intermediate_path};

pub struct BlenderRenderProgressiveCompiler;

impl JobCompiler for BlenderRenderProgressiveCompiler {
    fn job_type(&self) -> &'static str {
        "blender-render-progressive"
    }

    fn required_settings(&self) -> &'static [&'static str] {
        &[
            "blender_cmd",
            "filepath",
            "render_output",
            "frames",
            "chunk_size",
            "format",
            "cycles_sample_count",
            "cycles_sample_cap",
        ]
    }

    fn validate_job_settings(&self, job: &JobDbModel) -> Result<()> {
        super::validate_required_settings(self.required_settings(), job)?;

        let format = job.setting_str("format")?;
        if format.to_ascii_uppercase() != "EXR" {
            return Err(Error::job_setting(format!(
                "Job {} must use format=\"EXR\", not {format:?}",
                job.id
            )));
        }

        // Predicting the filename Blender will write requires a precise
        // frame placeholder.
        let render_output = job.setting_str("render_output")?;
        if !render_output.ends_with("######") || render_output.ends_with("#######") {
            return Err(Error::job_setting(
                "setting \"render_output\" must end in exactly 6 \"#\" marks",
            ));
        }

        if job.setting_i64("chunk_size")? < 1 {
            return Err(Error::job_setting("setting \"chunk_size\" must be at least 1"));
        }
        if job.setting_i64("cycles_sample_count")? < 1 {
            return Err(Error::job_setting(
                "setting \"cycles_sample_count\" must be at least 1",
            ));
        }
        if job.setting_i64("cycles_sample_cap")? < 1 {
            return Err(Error::job_setting(
                "setting \"cycles_sample_cap\" must be at least 1",
            ));
        }

        if let Some(lines) = rna_override_lines(job)? {
            validate_rna_overrides(&lines)?;
        }
        Ok(())
    }

    fn compile(&self, ctx: &mut CompileContext) -> Result<()> {
        let job = ctx.job;
        tracing::info!(job_id = %job.id, "compiling blender-render-progressive job");

        let blender_cmd = job.setting_str("blender_cmd")?;
        let filepath = job.setting_str("filepath")?;
        let render_output = PathBuf::from(job.setting_str("render_output")?);
        let frames = job.setting_str("frames")?;
        let chunk_size = job.setting_i64("chunk_size")? as usize;
        let sample_count = job.setting_i64("cycles_sample_count")? as u32;
        let sample_cap = job.setting_i64("cycles_sample_cap")? as u32;

        let render_path = render_output
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let intermediate = intermediate_path(job, &render_path)?;

        let frame_chunks: Vec<Vec<i64>> = iter_frame_range(&frames, chunk_size)?.collect();
        if frame_chunks.is_empty() {
            return Err(Error::job_setting("setting \"frames\" yields no frames"));
        }

        let destroy_task_id = ctx.add_task(
            "destroy-preexisting-intermediate",
            TaskType::FileManagement,
            vec![Command::RemoveTree {
                path: intermediate.to_string_lossy().into_owned(),
            }],
            &[],
            0,
        )?;
        let rna_task_id = self.make_rna_overrides_task(ctx, &intermediate, &destroy_task_id)?;
        let render_parent = rna_task_id.unwrap_or(destroy_task_id);

        let generator = ChunkGenerator::new(sample_count, sample_cap, DEFAULT_UNCAPPED_CHUNKS);
        let sample_chunks = generator.chunks();
        let num_chunks = sample_chunks.len() as u32;

        let paths = ProgressivePaths {
            intermediate,
            render_path,
            render_output,
        };

        // Per frame-chunk, the task the next merge depends on: the publish
        // task after chunk 0, the previous merge task afterwards.
        let mut next_merge_deps: Vec<String> = Vec::new();
        let mut prev_samples_to: u32 = 0;
        let mut prev_preview_image: Option<String> = None;
        let mut prev_preview_video: Option<String> = None;

        for (chunk_idx, &(samples_from, samples_to)) in sample_chunks.iter().enumerate() {
            let render_task_ids = self.make_progressive_render_tasks(
                ctx,
                &paths,
                &frame_chunks,
                &render_parent,
                &blender_cmd,
                &filepath,
                chunk_idx,
                num_chunks,
                samples_from,
                samples_to,
            )?;

            let stage_task_ids = if chunk_idx == 0 {
                // Nothing to merge yet, just publish the first renders.
                let publish_task_id = self.make_publish_first_chunk_task(
                    ctx,
                    &paths,
                    &frame_chunks,
                    &render_task_ids,
                    samples_from,
                    samples_to,
                )?;
                next_merge_deps = vec![publish_task_id.clone(); frame_chunks.len()];
                vec![publish_task_id]
            } else {
                debug_assert_eq!(next_merge_deps.len(), render_task_ids.len());
                let merge_task_ids = self.make_merge_tasks(
                    ctx,
                    &paths,
                    &frame_chunks,
                    &next_merge_deps,
                    &render_task_ids,
                    &blender_cmd,
                    chunk_idx,
                    prev_samples_to,
                    samples_from,
                    samples_to,
                )?;
                next_merge_deps = merge_task_ids.clone();
                merge_task_ids
            };

            let (preview_image, preview_video) = self.make_preview_tasks(
                ctx,
                &paths,
                &blender_cmd,
                &filepath,
                chunk_idx,
                samples_to,
                &stage_task_ids,
                prev_preview_image.take(),
                prev_preview_video.take(),
            )?;
            prev_preview_image = Some(preview_image);
            prev_preview_video = preview_video;

            prev_samples_to = samples_to;
        }

        tracing::info!(
            job_id = %job.id,
            task_count = ctx.task_count(),
            sample_chunks = num_chunks,
            "created progressive render tasks"
        );
        Ok(())
    }
}

/// Paths shared by all stages of one progressive compile.
struct ProgressivePaths {
    intermediate: PathBuf,
    render_path: PathBuf,
    render_output: PathBuf,
}

impl ProgressivePaths {
    /// Intermediate render output pattern, '######' placeholder included.
    fn render_output_pattern(&self, samples_from: u32, samples_to: u32) -> PathBuf {
        self.intermediate
            .join(format!("render-smpl-{samples_from:04}-{samples_to:04}-frm-######"))
    }

    /// Intermediate merge output pattern, '######' placeholder included.
    fn merge_output_pattern(&self, samples_to: u32) -> PathBuf {
        self.intermediate
            .join(format!("merge-smpl-{samples_to:04}-frm-######"))
    }

    /// Replace the '######' placeholder with a concrete EXR frame name.
    fn expand_frame(pattern: &Path, frame: i64) -> String {
        pattern
            .to_string_lossy()
            .replace("######", &format!("{frame:06}.exr"))
    }
}

impl BlenderRenderProgressiveCompiler {
    fn make_rna_overrides_task(
        &self,
        ctx: &mut CompileContext,
        intermediate: &Path,
        destroy_task_id: &str,
    ) -> Result<Option<String>> {
        let Some(lines) = rna_override_lines(ctx.job)? else {
            return Ok(None);
        };
        if lines.is_empty() {
            return Ok(None);
        }

        let task_id = ctx.add_task(
            "create-rna-overrides",
            TaskType::FileManagement,
            vec![Command::CreatePythonFile {
                filepath: intermediate
                    .join(RNA_OVERRIDES_FILENAME)
                    .to_string_lossy()
                    .into_owned(),
                contents: as_python_file(&lines),
            }],
            &[destroy_task_id.to_string()],
            0,
        )?;
        Ok(Some(task_id))
    }

    #[allow(clippy::too_many_arguments)]
    fn make_progressive_render_tasks(
        &self,
        ctx: &mut CompileContext,
        paths: &ProgressivePaths,
        frame_chunks: &[Vec<i64>],
        render_parent: &str,
        blender_cmd: &str,
        filepath: &str,
        chunk_idx: usize,
        num_chunks: u32,
        samples_from: u32,
        samples_to: u32,
    ) -> Result<Vec<String>> {
        let render_output = paths.render_output_pattern(samples_from, samples_to);
        let mut task_ids = Vec::with_capacity(frame_chunks.len());

        for chunk_frames in frame_chunks {
            let frame_range = frame_range_merge(chunk_frames, RangeStyle::Dash);
            let frame_range_bstyle = frame_range_merge(chunk_frames, RangeStyle::Blender);

            let task_id = ctx.add_task(
                format!("render-smpl{samples_from}-{samples_to}-frm{frame_range}"),
                TaskType::BlenderRender,
                vec![Command::BlenderRenderProgressive {
                    blender_cmd: blender_cmd.to_string(),
                    filepath: filepath.to_string(),
                    format: Some("EXR".to_string()),
                    // Render to the intermediate location, not the final
                    // output.
                    render_output: render_output.to_string_lossy().into_owned(),
                    frames: frame_range_bstyle,
                    cycles_num_chunks: num_chunks,
                    cycles_chunk: chunk_idx as u32 + 1,
                    cycles_samples_from: samples_from,
                    cycles_samples_to: samples_to,
                }],
                &[render_parent.to_string()],
                -(chunk_idx as i64) * 10,
            )?;
            task_ids.push(task_id);
        }
        Ok(task_ids)
    }

    /// Publish the first chunk of renders by copying them into place;
    /// there is nothing to merge yet.
    fn make_publish_first_chunk_task(
        &self,
        ctx: &mut CompileContext,
        paths: &ProgressivePaths,
        frame_chunks: &[Vec<i64>],
        parents: &[String],
        samples_from: u32,
        samples_to: u32,
    ) -> Result<String> {
        let src_pattern = paths.render_output_pattern(samples_from, samples_to);

        let mut commands = vec![Command::MoveOutOfWay {
            src: paths.render_path.to_string_lossy().into_owned(),
        }];
        for chunk_frames in frame_chunks {
            for &frame in chunk_frames {
                commands.push(Command::CopyFile {
                    src: ProgressivePaths::expand_frame(&src_pattern, frame),
                    dest: ProgressivePaths::expand_frame(&paths.render_output, frame),
                });
            }
        }

        ctx.add_task(
            "publish-first-chunk",
            TaskType::FileManagement,
            commands,
            parents,
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn make_merge_tasks(
        &self,
        ctx: &mut CompileContext,
        paths: &ProgressivePaths,
        frame_chunks: &[Vec<i64>],
        merge_parents: &[String],
        render_task_ids: &[String],
        blender_cmd: &str,
        chunk_idx: usize,
        prev_samples_to: u32,
        samples_from: u32,
        samples_to: u32,
    ) -> Result<Vec<String>> {
        // The first merge takes a render output as input1; later merges
        // take the previous merge output.
        let input1_pattern = if chunk_idx == 1 {
            paths.render_output_pattern(1, prev_samples_to)
        } else {
            paths.merge_output_pattern(prev_samples_to)
        };
        let input2_pattern = paths.render_output_pattern(samples_from, samples_to);
        let output_pattern = paths.merge_output_pattern(samples_to);

        let weight1 = prev_samples_to;
        let weight2 = samples_to - samples_from + 1;

        let mut task_ids = Vec::with_capacity(frame_chunks.len());
        for (frame_chunk_idx, chunk_frames) in frame_chunks.iter().enumerate() {
            let mut commands = Vec::with_capacity(chunk_frames.len() * 2);
            for &frame in chunk_frames {
                let merged = ProgressivePaths::expand_frame(&output_pattern, frame);
                commands.push(Command::MergeProgressiveRenders {
                    input1: ProgressivePaths::expand_frame(&input1_pattern, frame),
                    input2: ProgressivePaths::expand_frame(&input2_pattern, frame),
                    output: merged.clone(),
                    weight1,
                    weight2,
                    blender_cmd: blender_cmd.to_string(),
                });
                commands.push(Command::CopyFile {
                    src: merged,
                    dest: ProgressivePaths::expand_frame(&paths.render_output, frame),
                });
            }

            let frame_range = frame_range_merge(chunk_frames, RangeStyle::Dash);
            let task_id = ctx.add_task(
                format!("merge-to-smpl{samples_to}-frm{frame_range}"),
                TaskType::ExrMerge,
                commands,
                &[
                    merge_parents[frame_chunk_idx].clone(),
                    render_task_ids[frame_chunk_idx].clone(),
                ],
                -(chunk_idx as i64) * 10 - 1,
            )?;
            task_ids.push(task_id);
        }
        Ok(task_ids)
    }

    /// Create the preview image task and, when the Manager can encode
    /// video, the preview video task for this chunk. Both chain onto
    /// their predecessor so previews are generated strictly in order.
    #[allow(clippy::too_many_arguments)]
    fn make_preview_tasks(
        &self,
        ctx: &mut CompileContext,
        paths: &ProgressivePaths,
        blender_cmd: &str,
        filepath: &str,
        chunk_idx: usize,
        samples_to: u32,
        stage_task_ids: &[String],
        prev_preview_image: Option<String>,
        prev_preview_video: Option<String>,
    ) -> Result<(String, Option<String>)> {
        let mut image_parents = stage_task_ids.to_vec();
        if let Some(prev) = prev_preview_image {
            image_parents.push(prev);
        }

        let preview_image_id = ctx.add_task(
            format!("preview-images-smpl{samples_to}"),
            TaskType::BlenderRender,
            vec![Command::ExrSequenceToJpeg {
                blender_cmd: blender_cmd.to_string(),
                filepath: filepath.to_string(),
                exr_glob: paths.render_path.join("*.exr").to_string_lossy().into_owned(),
                output_pattern: paths
                    .intermediate
                    .join("preview-######.jpg")
                    .to_string_lossy()
                    .into_owned(),
            }],
            &image_parents,
            -(chunk_idx as i64) * 10 - 2,
        )?;

        let fps = ctx.job.setting_f64("fps").ok();
        let Some(fps) = fps else {
            return Ok((preview_image_id, None));
        };
        if !ctx.manager_supports(TaskType::VideoEncoding) {
            return Ok((preview_image_id, None));
        }

        let mut video_parents = vec![preview_image_id.clone()];
        if let Some(prev) = prev_preview_video {
            video_parents.push(prev);
        }
        let preview_video_id = ctx.add_task(
            format!("preview-video-smpl{samples_to}"),
            TaskType::VideoEncoding,
            vec![Command::CreateVideo {
                input_files: paths
                    .intermediate
                    .join("preview-*.jpg")
                    .to_string_lossy()
                    .into_owned(),
                output_file: paths
                    .render_path
                    .join("preview.mp4")
                    .to_string_lossy()
                    .into_owned(),
                fps,
            }],
            &video_parents,
            -(chunk_idx as i64) * 10 - 3,
        )?;
        Ok((preview_image_id, Some(preview_video_id)))
    }
}

/// The job's RNA override lines, when set. Every entry must be a string.
pub(crate) fn rna_override_lines(job: &JobDbModel) -> Result<Option<Vec<String>>> {
    match job.setting("rna_overrides") {
        None => Ok(None),
        Some(serde_json::Value::Array(items)) => {
            let mut lines = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_json::Value::String(line) => lines.push(line),
                    other => {
                        return Err(Error::job_setting(format!(
                            "setting \"rna_overrides\" must be a list of strings, found {other}"
                        )));
                    }
                }
            }
            Ok(Some(lines))
        }
        Some(other) => Err(Error::job_setting(format!(
            "setting \"rna_overrides\" must be a list of strings, not {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::database::models::{ManagerDbModel, TaskDbModel};

    fn progressive_job(extra: serde_json::Value) -> JobDbModel {
        let mut settings = serde_json::json!({
            "blender_cmd": "{blender}",
            "filepath": "/jobs/shot_010.blend",
            "render_output": "/render/shot_010/######",
            "frames": "1-4",
            "chunk_size": 2,
            "format": "EXR",
            "cycles_sample_count": 400,
            "cycles_sample_cap": 100,
        });
        if let (Some(base), Some(add)) = (settings.as_object_mut(), extra.as_object()) {
            for (key, value) in add {
                base.insert(key.clone(), value.clone());
            }
        }
        let mut job = JobDbModel::new(
            "progressive",
            "",
            "blender-render-progressive",
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

    fn video_capable_manager() -> ManagerDbModel {
        let mut manager = ManagerDbModel::new("manager-1", "farm");
        manager.worker_task_types = Some(
            r#"["blender-render", "exr-merge", "file-management", "video-encoding"]"#.to_string(),
        );
        manager
    }

    fn compile(job: &JobDbModel, manager: &ManagerDbModel) -> Vec<TaskDbModel> {
        let compiler = BlenderRenderProgressiveCompiler;
        compiler.validate_job_settings(job).unwrap();
        let mut ctx = CompileContext::new(job, Some(manager));
        compiler.compile(&mut ctx).unwrap();
        ctx.into_tasks()
    }

    fn by_name<'t>(tasks: &'t [TaskDbModel], name: &str) -> &'t TaskDbModel {
        tasks
            .iter()
            .find(|t| t.name == name)
            .unwrap_or_else(|| panic!("no task named {name}"))
    }

    #[test]
    fn test_validate_requires_exr() {
        let mut job = progressive_job(serde_json::json!({}));
        let mut settings = job.get_settings();
        settings.insert("format".to_string(), serde_json::json!("PNG"));
        job.settings = serde_json::Value::Object(settings).to_string();

        let err = BlenderRenderProgressiveCompiler
            .validate_job_settings(&job)
            .unwrap_err();
        assert!(err.to_string().contains("EXR"));
    }

    #[test]
    fn test_validate_requires_frame_placeholder() {
        let mut job = progressive_job(serde_json::json!({}));
        let mut settings = job.get_settings();
        settings.insert(
            "render_output".to_string(),
            serde_json::json!("/render/shot_010/#######"),
        );
        job.settings = serde_json::Value::Object(settings).to_string();

        assert!(
            BlenderRenderProgressiveCompiler
                .validate_job_settings(&job)
                .is_err()
        );
    }

    #[test]
    fn test_task_graph_shape() {
        // 2 frame chunks, and 400 samples capped at 100 give 6 sample
        // chunks: 1-10, 11-49, 50-133, 134-222, 223-311, 312-400.
        let job = progressive_job(serde_json::json!({"fps": 24}));
        let tasks = compile(&job, &video_capable_manager());
        assert_eq!(tasks.len(), 36);

        let mut per_type: HashMap<&str, usize> = HashMap::new();
        for task in &tasks {
            *per_type.entry(task.task_type.as_str()).or_default() += 1;
        }
        // 12 renders + 6 preview-image tasks run in Blender.
        assert_eq!(per_type["blender-render"], 18);
        assert_eq!(per_type["exr-merge"], 10);
        // destroy + publish tasks.
        assert_eq!(per_type["file-management"], 2);
        assert_eq!(per_type["video-encoding"], 6);

        // All render tasks hang off the destroy-intermediate root.
        let destroy = by_name(&tasks, "destroy-preexisting-intermediate");
        assert!(destroy.is_root());
        for task in tasks.iter().filter(|t| t.name.starts_with("render-smpl")) {
            assert_eq!(task.get_parents(), vec![destroy.id.clone()]);
        }

        // The first chunk publishes instead of merging.
        let publish = by_name(&tasks, "publish-first-chunk");
        assert_eq!(publish.get_parents().len(), 2);

        // The second chunk merges publish output with the new renders.
        let merge = by_name(&tasks, "merge-to-smpl49-frm1,2");
        let render = by_name(&tasks, "render-smpl11-49-frm1,2");
        assert_eq!(
            merge.get_parents(),
            vec![publish.id.clone(), render.id.clone()]
        );
        match &merge.get_commands().unwrap()[0] {
            Command::MergeProgressiveRenders {
                weight1, weight2, input1, ..
            } => {
                assert_eq!(*weight1, 10);
                assert_eq!(*weight2, 39);
                assert!(input1.contains("render-smpl-0001-0010"));
            }
            other => panic!("expected merge command, got {}", other.name()),
        }

        // Later merges read the previous merge output.
        let merge = by_name(&tasks, "merge-to-smpl133-frm1,2");
        match &merge.get_commands().unwrap()[0] {
            Command::MergeProgressiveRenders { input1, weight1, .. } => {
                assert!(input1.contains("merge-smpl-0049"));
                assert_eq!(*weight1, 49);
            }
            other => panic!("expected merge command, got {}", other.name()),
        }

        // Preview tasks chain onto their predecessors so generation is
        // strictly sequential.
        let first_image = by_name(&tasks, "preview-images-smpl10");
        let second_image = by_name(&tasks, "preview-images-smpl49");
        assert!(second_image.get_parents().contains(&first_image.id));
        let first_video = by_name(&tasks, "preview-video-smpl10");
        let second_video = by_name(&tasks, "preview-video-smpl49");
        assert!(second_video.get_parents().contains(&first_video.id));
        assert!(second_video.get_parents().contains(&second_image.id));
    }

    #[test]
    fn test_no_preview_videos_without_encoding_support() {
        let job = progressive_job(serde_json::json!({"fps": 24}));
        let mut manager = video_capable_manager();
        manager.worker_task_types =
            Some(r#"["blender-render", "exr-merge", "file-management"]"#.to_string());

        let tasks = compile(&job, &manager);
        assert!(!tasks.iter().any(|t| t.name.starts_with("preview-video")));
        assert!(tasks.iter().any(|t| t.name.starts_with("preview-images")));
    }

    #[test]
    fn test_rna_overrides_root_task() {
        let job = progressive_job(serde_json::json!({
            "rna_overrides": ["import bpy", "bpy.context.scene.cycles.samples = 400"],
        }));
        let tasks = compile(&job, &video_capable_manager());

        let destroy = by_name(&tasks, "destroy-preexisting-intermediate");
        let rna = by_name(&tasks, "create-rna-overrides");
        assert_eq!(rna.get_parents(), vec![destroy.id.clone()]);
        match &rna.get_commands().unwrap()[0] {
            Command::CreatePythonFile { contents, filepath } => {
                assert!(contents.ends_with("samples = 400\n"));
                assert!(filepath.ends_with("rna_overrides.py"));
            }
            other => panic!("expected create_python_file, got {}", other.name()),
        }

        // With overrides present, renders hang off the override task.
        for task in tasks.iter().filter(|t| t.name.starts_with("render-smpl")) {
            assert_eq!(task.get_parents(), vec![rna.id.clone()]);
        }
    }

    #[test]
    fn test_compile_is_deterministic_in_shape() {
        let job = progressive_job(serde_json::json!({}));
        let manager = video_capable_manager();
        let first = compile(&job, &manager);
        let second = compile(&job, &manager);

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.commands, b.commands);
            assert_eq!(a.priority, b.priority);
        }
    }
}
