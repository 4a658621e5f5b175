//! Blender video-chunks job compiler.
//!
//! Renders the video as PNG frame chunks, encodes each chunk into a
//! partial video, concatenates the partials with ffmpeg, optionally
//! renders and muxes the audio track, and finally moves the result to
//! its destination with a uniqueness counter in the filename.

use std::path::{Path, PathBuf};

use crate::database::models::{JobDbModel, TaskType};
use crate::utils::frames::{RangeStyle, frame_range_merge, frame_range_start_end, iter_frame_range};
use crate::{Error, Result};

use super::commands::Command;
use super::{CompileContext, JobCompiler};

pub struct BlenderVideoChunksCompiler;

impl JobCompiler for BlenderVideoChunksCompiler {
    fn job_type(&self) -> &'static str {
        "blender-video-chunks"
    }

    fn required_settings(&self) -> &'static [&'static str] {
        &[
            "filepath",
            "render_output",
            "frames",
            "chunk_size",
            "output_file_extension",
            "images_or_video",
            "fps",
            "extract_audio",
        ]
    }

    fn validate_job_settings(&self, job: &JobDbModel) -> Result<()> {
        super::validate_required_settings(self.required_settings(), job)?;

        let images_or_video = job.setting_str("images_or_video")?;
        if images_or_video != "video" {
            return Err(Error::job_setting(format!(
                "Job {} is rendering {images_or_video:?}, but job type requires video",
                job.id
            )));
        }
        job.setting_bool("extract_audio")?;
        job.setting_f64("fps")?;
        if job.setting_i64("chunk_size")? < 1 {
            return Err(Error::job_setting("setting \"chunk_size\" must be at least 1"));
        }
        Ok(())
    }

    fn compile(&self, ctx: &mut CompileContext) -> Result<()> {
        let job = ctx.job;
        tracing::info!(job_id = %job.id, "compiling blender-video-chunks job");

        if !ctx.manager_supports(TaskType::VideoEncoding) {
            return Err(Error::validation(format!(
                "Manager {} does not support video-encoding tasks, which this job type requires",
                job.manager_id
            )));
        }

        let blender_cmd = job
            .setting_str("blender_cmd")
            .unwrap_or_else(|_| "{blender}".to_string());
        let filepath = job.setting_str("filepath")?;
        let frames = job.setting_str("frames")?;
        let chunk_size = job.setting_i64("chunk_size")? as usize;
        let extension = job.setting_str("output_file_extension")?;
        let fps = job.setting_f64("fps")?;
        let extract_audio = job.setting_bool("extract_audio")?;

        // For this job type the filename in the render output setting is
        // irrelevant; only its directory is used.
        let final_output_dir = PathBuf::from(job.setting_str("render_output")?)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let frames_dir = final_output_dir.join("frames");
        let audio_path = frames_dir.join("audio.aac");
        let video_path = frames_dir.join("video.mkv");
        let muxed_path = frames_dir.join("muxed.mkv");
        let final_output_path = final_output_dir.join(final_output_name(job, &filepath, &extension)?);

        let moow_task_id = ctx.add_task(
            "move-out-of-way",
            TaskType::FileManagement,
            vec![Command::MoveOutOfWay {
                src: frames_dir.to_string_lossy().into_owned(),
            }],
            &[],
            0,
        )?;

        // Per frame chunk: render PNG frames, then encode them to a
        // partial video.
        let mut encode_task_ids = Vec::new();
        for chunk_frames in iter_frame_range(&frames, chunk_size)? {
            let frame_range = frame_range_merge(&chunk_frames, RangeStyle::Dash);
            let frame_range_bstyle = frame_range_merge(&chunk_frames, RangeStyle::Blender);

            let first_frame = chunk_frames[0];
            let last_frame = chunk_frames[chunk_frames.len() - 1];
            let chunk_name = format!("chunk-{first_frame:05}-{last_frame:05}");
            let chunk_output = frames_dir.join(&chunk_name).join("######.png");

            let render_task_id = ctx.add_task(
                format!("frame-chunk-{frame_range}"),
                TaskType::BlenderRender,
                vec![Command::BlenderRender {
                    blender_cmd: blender_cmd.clone(),
                    filepath: filepath.clone(),
                    format: Some("PNG".to_string()),
                    render_output: Some(chunk_output.to_string_lossy().into_owned()),
                    frames: frame_range_bstyle,
                }],
                &[moow_task_id.clone()],
                0,
            )?;

            let encode_task_id = ctx.add_task(
                format!("video-chunk-{frame_range}"),
                TaskType::VideoEncoding,
                vec![Command::CreateVideo {
                    input_files: chunk_output
                        .with_file_name("*.png")
                        .to_string_lossy()
                        .into_owned(),
                    output_file: frames_dir
                        .join(format!("{chunk_name}{extension}"))
                        .to_string_lossy()
                        .into_owned(),
                    fps,
                }],
                &[render_task_id],
                0,
            )?;
            encode_task_ids.push(encode_task_id);
        }

        let concat_task_id = ctx.add_task(
            "concatenate-videos",
            TaskType::VideoEncoding,
            vec![Command::ConcatenateVideos {
                input_files: frames_dir
                    .join(format!("chunk-*{extension}"))
                    .to_string_lossy()
                    .into_owned(),
                output_file: video_path.to_string_lossy().into_owned(),
            }],
            &encode_task_ids,
            0,
        )?;

        let (final_parent, final_src) = if extract_audio {
            let audio_task_id = self.make_extract_audio_task(
                ctx,
                &blender_cmd,
                &filepath,
                &frames,
                &audio_path,
                &moow_task_id,
            )?;
            let mux_task_id = ctx.add_task(
                "mux-audio-video",
                TaskType::VideoEncoding,
                vec![Command::MuxAudio {
                    audio_file: audio_path.to_string_lossy().into_owned(),
                    video_file: video_path.to_string_lossy().into_owned(),
                    output_file: muxed_path.to_string_lossy().into_owned(),
                }],
                &[audio_task_id, concat_task_id],
                0,
            )?;
            (mux_task_id, muxed_path)
        } else {
            (concat_task_id, video_path)
        };

        ctx.add_task(
            "move-with-counter",
            TaskType::FileManagement,
            vec![Command::MoveWithCounter {
                src: final_src.to_string_lossy().into_owned(),
                dest: final_output_path.to_string_lossy().into_owned(),
            }],
            &[final_parent],
            0,
        )?;

        tracing::info!(job_id = %job.id, task_count = ctx.task_count(), "created video-chunk tasks");
        Ok(())
    }
}

impl BlenderVideoChunksCompiler {
    /// Render the audio with Blender, then re-encode it to AAC. Returns
    /// the task the mux step depends on.
    fn make_extract_audio_task(
        &self,
        ctx: &mut CompileContext,
        blender_cmd: &str,
        filepath: &str,
        frames: &str,
        audio_path: &Path,
        moow_task_id: &str,
    ) -> Result<String> {
        // Assumes the frame range is continuous; audio extraction spans
        // the full range either way.
        let bounds = frame_range_start_end(frames)?;
        let flac_path = audio_path.with_extension("flac");

        let render_task_id = ctx.add_task(
            "render-audio",
            TaskType::BlenderRender,
            vec![Command::BlenderRenderAudio {
                blender_cmd: blender_cmd.to_string(),
                filepath: filepath.to_string(),
                render_output: flac_path.to_string_lossy().into_owned(),
                frame_start: bounds.map(|(start, _)| start),
                frame_end: bounds.map(|(_, end)| end),
            }],
            &[moow_task_id.to_string()],
            0,
        )?;

        ctx.add_task(
            "encode-audio",
            TaskType::VideoEncoding,
            vec![Command::EncodeAudio {
                input_file: flac_path.to_string_lossy().into_owned(),
                output_file: audio_path.to_string_lossy().into_owned(),
                codec: "aac".to_string(),
                bitrate: "192k".to_string(),
            }],
            &[render_task_id],
            0,
        )
    }
}

/// The dated final output filename. Derives the date from the job's
/// creation time so recompiling an unchanged job is deterministic; the
/// worker-side uniqueness counter handles collisions with earlier runs.
fn final_output_name(job: &JobDbModel, filepath: &str, extension: &str) -> Result<String> {
    let stem = Path::new(filepath)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
        .replace(".flamenco", "");
    let created = job.created_at_utc()?;
    Ok(format!("{}-{stem}{extension}", created.format("%Y_%m_%d")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ManagerDbModel, TaskDbModel};

    fn video_job(extract_audio: bool) -> JobDbModel {
        let mut job = JobDbModel::new(
            "vid",
            "",
            "blender-video-chunks",
            serde_json::json!({
                "filepath": "/jobs/shot_010.flamenco.blend",
                "render_output": "/render/shot_010/video/output",
                "frames": "1-4",
                "chunk_size": 2,
                "output_file_extension": ".mkv",
                "images_or_video": "video",
                "fps": 24,
                "extract_audio": extract_audio,
            }),
            "project-1",
            "user-1",
            "manager-1",
            50,
            false,
        );
        job.created_at = "2026-08-06T10:00:00+00:00".to_string();
        job
    }

    fn compile(job: &JobDbModel) -> Vec<TaskDbModel> {
        let compiler = BlenderVideoChunksCompiler;
        compiler.validate_job_settings(job).unwrap();
        let manager = ManagerDbModel::new("manager-1", "farm");
        let mut ctx = CompileContext::new(job, Some(&manager));
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
    fn test_final_output_name() {
        let job = video_job(false);
        let name = final_output_name(&job, "/jobs/shot_010.flamenco.blend", ".mkv").unwrap();
        assert_eq!(name, "2026_08_06-shot_010.mkv");
    }

    #[test]
    fn test_validate_rejects_image_output() {
        let mut job = video_job(false);
        let mut settings = job.get_settings();
        settings.insert("images_or_video".to_string(), serde_json::json!("images"));
        job.settings = serde_json::Value::Object(settings).to_string();
        assert!(BlenderVideoChunksCompiler.validate_job_settings(&job).is_err());
    }

    #[test]
    fn test_graph_without_audio() {
        let tasks = compile(&video_job(false));
        // moow + 2x(render+encode) + concat + move.
        assert_eq!(tasks.len(), 7);

        let concat = by_name(&tasks, "concatenate-videos");
        assert_eq!(concat.get_parents().len(), 2);

        let move_task = by_name(&tasks, "move-with-counter");
        assert_eq!(move_task.get_parents(), vec![concat.id.clone()]);
        match &move_task.get_commands().unwrap()[0] {
            Command::MoveWithCounter { src, dest } => {
                assert!(src.ends_with("video.mkv"));
                assert!(dest.ends_with("2026_08_06-shot_010.mkv"));
            }
            other => panic!("expected move_with_counter, got {}", other.name()),
        }
    }

    #[test]
    fn test_graph_with_audio() {
        let tasks = compile(&video_job(true));
        // moow + 2x(render+encode) + concat + render-audio + encode-audio
        // + mux + move.
        assert_eq!(tasks.len(), 10);

        let concat = by_name(&tasks, "concatenate-videos");
        let encode_audio = by_name(&tasks, "encode-audio");
        let mux = by_name(&tasks, "mux-audio-video");
        let mux_parents = mux.get_parents();
        assert!(mux_parents.contains(&concat.id));
        assert!(mux_parents.contains(&encode_audio.id));

        let move_task = by_name(&tasks, "move-with-counter");
        assert_eq!(move_task.get_parents(), vec![mux.id.clone()]);
        match &move_task.get_commands().unwrap()[0] {
            Command::MoveWithCounter { src, .. } => assert!(src.ends_with("muxed.mkv")),
            other => panic!("expected move_with_counter, got {}", other.name()),
        }

        // Audio rendering spans the whole frame range.
        let render_audio = by_name(&tasks, "render-audio");
        match &render_audio.get_commands().unwrap()[0] {
            Command::BlenderRenderAudio {
                frame_start,
                frame_end,
                ..
            } => {
                assert_eq!(*frame_start, Some(1));
                assert_eq!(*frame_end, Some(4));
            }
            other => panic!("expected blender_render_audio, got {}", other.name()),
        }
    }
}
