//! RNA overrides for Blender render jobs.
//!
//! RNA overrides are user-provided Python snippets that set scene
//! properties before rendering. They are injected into the task graph by
//! the progressive render compiler; this module only checks that they
//! are syntactically valid Python. The code may still raise when run
//! (e.g. accessing `bpy.scene` instead of `bpy.context.scene`), but a
//! syntax error is caught before any task graph is touched.

use rustpython_parser::{Mode, parse};

use crate::{Error, Result};

/// Filename the overrides are written to inside the intermediate
/// directory.
pub const RNA_OVERRIDES_FILENAME: &str = "rna_overrides.py";

/// Check that the RNA override lines parse as Python.
///
/// Returns an [`Error::RnaOverrideSyntax`] with the offending line number
/// and parser message on failure; the overrides are never executed.
pub fn validate_rna_overrides(lines: &[String]) -> Result<()> {
    let source = lines.join("\n");

    match parse(&source, Mode::Module, RNA_OVERRIDES_FILENAME) {
        Ok(_) => Ok(()),
        Err(parse_error) => {
            let offset = usize::from(parse_error.offset);
            let line = source[..offset.min(source.len())]
                .bytes()
                .filter(|&b| b == b'\n')
                .count()
                + 1;
            Err(Error::RnaOverrideSyntax {
                line,
                message: parse_error.error.to_string(),
            })
        }
    }
}

/// The override lines as a single Python file body.
pub fn as_python_file(lines: &[String]) -> String {
    let mut contents = lines.join("\n");
    contents.push('\n');
    contents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_valid_overrides() {
        let overrides = lines(&[
            "import bpy",
            "bpy.context.scene.cycles.samples = 400",
            "bpy.context.scene.render.resolution_percentage = 50",
        ]);
        assert!(validate_rna_overrides(&overrides).is_ok());
    }

    #[test]
    fn test_empty_overrides() {
        assert!(validate_rna_overrides(&[]).is_ok());
    }

    #[test]
    fn test_syntax_error_reports_line() {
        let overrides = lines(&[
            "bpy.context.scene.cycles.samples = 400",
            "this is not valid python",
        ]);
        match validate_rna_overrides(&overrides) {
            Err(Error::RnaOverrideSyntax { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_as_python_file() {
        let overrides = lines(&["a = 1", "b = 2"]);
        assert_eq!(as_python_file(&overrides), "a = 1\nb = 2\n");
    }
}
