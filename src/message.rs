//! Turn runner errors into failure messages with a source location.

use std::path::{MAIN_SEPARATOR, Path};

use lsp_types::{Location, Position, Range, Url};
use serde::{Deserialize, Serialize};

use crate::{logging::clean_ansi, task::ErrorWithDiff, workspace::normalize};

/// A failure message as shown by the test explorer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestMessage {
    pub message: String,
    /// Present together with `actual_output` for assertion diffs.
    pub expected_output: Option<String>,
    pub actual_output: Option<String>,
    pub location: Option<Location>,
}

/// Build the message for `error` raised in a test declared in `file_path`.
///
/// The location comes from the first stack frame inside `file_path`. Frames
/// are 1-based on both axes and both are shifted down by one.
pub fn test_message_for_error(error: &ErrorWithDiff, file_path: &Path) -> TestMessage {
    let mut message = match (&error.actual, &error.expected) {
        (Some(actual), Some(expected)) if actual != "undefined" && expected != "undefined" => {
            TestMessage {
                message: clean_ansi(&error.message),
                expected_output: Some(expected.clone()),
                actual_output: Some(actual.clone()),
                location: None,
            }
        }
        _ => TestMessage {
            message: clean_ansi(&error.message),
            expected_output: None,
            actual_output: None,
            location: None,
        },
    };

    let target = normalize(file_path);
    message.location = error.stacks.iter().find_map(|frame| {
        let (Some(line), Some(column)) = (frame.line, frame.column) else {
            return None;
        };
        let frame_path = frame.file.replace(['/', '\\'], &MAIN_SEPARATOR.to_string());
        if normalize(Path::new(&frame_path)) != target {
            return None;
        }
        let uri = Url::from_file_path(&target).ok()?;
        let position = Position {
            line: line.saturating_sub(1),
            character: column.saturating_sub(1),
        };
        Some(Location {
            uri,
            range: Range {
                start: position,
                end: position,
            },
        })
    });

    message
}

/// Join error stacks (or messages when no stack was captured) into the text
/// stored on a node.
pub fn format_errors(errors: &[ErrorWithDiff]) -> String {
    errors
        .iter()
        .map(|error| clean_ansi(error.stack.as_deref().unwrap_or(&error.message)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::task::ParsedStack;

    fn frame(file: &str, line: Option<u32>, column: Option<u32>) -> ParsedStack {
        ParsedStack {
            method: String::new(),
            file: file.to_string(),
            line,
            column,
        }
    }

    #[test]
    fn diff_when_actual_and_expected_present() {
        let error = ErrorWithDiff {
            message: "expected 1 to be 2".into(),
            actual: Some("1".into()),
            expected: Some("2".into()),
            ..Default::default()
        };
        let message = test_message_for_error(&error, Path::new("/a/b.test.js"));
        assert_eq!(message.expected_output.as_deref(), Some("2"));
        assert_eq!(message.actual_output.as_deref(), Some("1"));
    }

    #[test]
    fn undefined_values_fall_back_to_plain_message() {
        let error = ErrorWithDiff {
            message: "\u{1b}[31mboom\u{1b}[39m".into(),
            actual: Some("undefined".into()),
            expected: Some("2".into()),
            ..Default::default()
        };
        let message = test_message_for_error(&error, Path::new("/a/b.test.js"));
        assert_eq!(message.message, "boom");
        assert!(message.expected_output.is_none());
        assert!(message.actual_output.is_none());
    }

    #[test]
    fn first_matching_frame_gives_location() {
        let file = PathBuf::from("/a/b.test.js");
        let error = ErrorWithDiff {
            message: "boom".into(),
            stacks: vec![
                frame("/a/helper.js", Some(1), Some(1)),
                frame("/a/b.test.js", None, Some(4)),
                frame("/a/b.test.js", Some(10), Some(3)),
                frame("/a/b.test.js", Some(20), Some(5)),
            ],
            ..Default::default()
        };
        let location = test_message_for_error(&error, &file).location.unwrap();
        assert_eq!(location.uri, Url::from_file_path(&file).unwrap());
        assert_eq!(location.range.start, Position { line: 9, character: 2 });
        assert_eq!(location.range.end, location.range.start);
    }

    #[test]
    fn no_location_without_matching_frame() {
        let error = ErrorWithDiff {
            message: "boom".into(),
            stacks: vec![frame("/elsewhere.js", Some(1), Some(1))],
            ..Default::default()
        };
        assert!(
            test_message_for_error(&error, Path::new("/a/b.test.js"))
                .location
                .is_none()
        );
    }

    #[test]
    fn errors_join_stacks_before_messages() {
        let errors = [
            ErrorWithDiff {
                message: "first".into(),
                stack: Some("Error: first\n    at x".into()),
                ..Default::default()
            },
            ErrorWithDiff {
                message: "second".into(),
                ..Default::default()
            },
        ];
        assert_eq!(format_errors(&errors), "Error: first\n    at x\nsecond");
    }
}
