//! Typed task commands.
//!
//! A command is a single instruction a Manager's worker executes. On the
//! wire each command is `{"name": ..., "settings": {...}}` with a
//! snake_case name derived from the command kind; these names are stable
//! contract surface for existing Managers.

use serde::{Deserialize, Serialize};

/// One worker instruction. Immutable once attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "settings", rename_all = "snake_case")]
pub enum Command {
    Echo {
        message: String,
    },
    Sleep {
        time_in_seconds: i64,
    },
    /// Runs a shell command; for admin debugging only.
    Exec {
        cmd: String,
    },
    BlenderRender {
        /// Blender executable to run, usually the `{blender}` variable
        /// replaced by the Manager.
        blender_cmd: String,
        /// Blend file path.
        filepath: String,
        /// Output format; defaults to the format in the blend file.
        format: Option<String>,
        /// Output path; defaults to the path in the blend file.
        render_output: Option<String>,
        /// Frames to render, as a Blender-style frame range.
        frames: String,
    },
    BlenderRenderProgressive {
        blender_cmd: String,
        filepath: String,
        format: Option<String>,
        render_output: String,
        frames: String,
        /// Total number of Cycles sample chunks.
        cycles_num_chunks: u32,
        /// Sample chunk rendered by this command, base-1.
        cycles_chunk: u32,
        /// First Cycles sample number, base-1 inclusive.
        cycles_samples_from: u32,
        /// Last Cycles sample number, base-1 inclusive.
        cycles_samples_to: u32,
    },
    /// Renders the audio of a blend file to a standalone audio file.
    BlenderRenderAudio {
        blender_cmd: String,
        filepath: String,
        render_output: String,
        frame_start: Option<i64>,
        frame_end: Option<i64>,
    },
    /// Merges two Cycles outputs into one by weighted average.
    MergeProgressiveRenders {
        input1: String,
        input2: String,
        output: String,
        /// Cumulative sample count behind `input1`.
        weight1: u32,
        /// Sample count behind `input2`.
        weight2: u32,
        blender_cmd: String,
    },
    /// Moves a file or directory out of the way by renaming it with its
    /// modification timestamp appended.
    MoveOutOfWay {
        src: String,
    },
    /// Moves a directory to its final place, safely backing up a
    /// pre-existing destination first.
    MoveToFinal {
        src: String,
        dest: String,
    },
    /// Moves a file to its destination, appending a uniqueness counter to
    /// the filename when the destination exists. An existing numeric
    /// prefix in the stem is preserved.
    MoveWithCounter {
        src: String,
        dest: String,
    },
    CopyFile {
        src: String,
        dest: String,
    },
    /// Deletes an entire directory tree without creating a backup.
    RemoveTree {
        path: String,
    },
    /// Encodes an image sequence into a video file.
    CreateVideo {
        input_files: String,
        output_file: String,
        fps: f64,
    },
    ConcatenateVideos {
        input_files: String,
        output_file: String,
    },
    EncodeAudio {
        input_file: String,
        output_file: String,
        codec: String,
        bitrate: String,
    },
    MuxAudio {
        audio_file: String,
        video_file: String,
        output_file: String,
    },
    /// Converts an EXR frame sequence to JPEG preview images.
    ExrSequenceToJpeg {
        blender_cmd: String,
        filepath: String,
        exr_glob: String,
        output_pattern: String,
    },
    /// Writes a Python file, e.g. the RNA override snippet loaded by
    /// render commands.
    CreatePythonFile {
        filepath: String,
        contents: String,
    },
}

impl Command {
    /// The stable wire name of this command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Echo { .. } => "echo",
            Self::Sleep { .. } => "sleep",
            Self::Exec { .. } => "exec",
            Self::BlenderRender { .. } => "blender_render",
            Self::BlenderRenderProgressive { .. } => "blender_render_progressive",
            Self::BlenderRenderAudio { .. } => "blender_render_audio",
            Self::MergeProgressiveRenders { .. } => "merge_progressive_renders",
            Self::MoveOutOfWay { .. } => "move_out_of_way",
            Self::MoveToFinal { .. } => "move_to_final",
            Self::MoveWithCounter { .. } => "move_with_counter",
            Self::CopyFile { .. } => "copy_file",
            Self::RemoveTree { .. } => "remove_tree",
            Self::CreateVideo { .. } => "create_video",
            Self::ConcatenateVideos { .. } => "concatenate_videos",
            Self::EncodeAudio { .. } => "encode_audio",
            Self::MuxAudio { .. } => "mux_audio",
            Self::ExrSequenceToJpeg { .. } => "exr_sequence_to_jpeg",
            Self::CreatePythonFile { .. } => "create_python_file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let cmd = Command::MoveOutOfWay {
            src: "/render/out".to_string(),
        };
        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "name": "move_out_of_way",
                "settings": {"src": "/render/out"},
            })
        );
    }

    #[test]
    fn test_name_matches_serialized_tag() {
        let commands = [
            Command::Echo {
                message: "hi".to_string(),
            },
            Command::MergeProgressiveRenders {
                input1: "a".to_string(),
                input2: "b".to_string(),
                output: "c".to_string(),
                weight1: 10,
                weight2: 40,
                blender_cmd: "{blender}".to_string(),
            },
            Command::CreateVideo {
                input_files: "*.jpg".to_string(),
                output_file: "out.mp4".to_string(),
                fps: 24.0,
            },
        ];
        for cmd in commands {
            let value = serde_json::to_value(&cmd).unwrap();
            assert_eq!(value["name"], cmd.name());
        }
    }

    #[test]
    fn test_round_trip() {
        let cmd = Command::BlenderRenderProgressive {
            blender_cmd: "{blender}".to_string(),
            filepath: "/jobs/shot.blend".to_string(),
            format: Some("EXR".to_string()),
            render_output: "/render/smpl/######".to_string(),
            frames: "1..10".to_string(),
            cycles_num_chunks: 6,
            cycles_chunk: 2,
            cycles_samples_from: 11,
            cycles_samples_to: 49,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
