//! State of the interactive editing surface.

use serde::{Deserialize, Serialize};

/// Program shown in the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorProgram {
    /// Syntax used for highlighting.
    pub syntax: String,
    /// Runtime the program is run with.
    pub runtime: String,
    /// Program text.
    pub code: String,
}

/// What the embedding UI should display.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorState {
    /// Whether the editor is shown.
    pub visible: bool,
    /// Program loaded into the editor, if any.
    pub program: Option<EditorProgram>,
}
