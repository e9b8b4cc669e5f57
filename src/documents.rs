//! Host document model and virtual koan-cell documents
//!
//! The concrete editor document store lives outside this crate; the
//! session controller reaches it through [`DocumentHost`]. Virtual
//! documents (`koan-cell:` scheme) are synthetic read-only views of one
//! challenge's code body and never touch the filesystem, only the
//! in-memory cell map.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// URI scheme for virtual challenge-code documents
pub const CELL_SCHEME: &str = "koan-cell";

/// Content served for a cell that has not been populated yet
const CELL_CONTENT_DEFAULT: &str = "# The code body for this challenge has not been loaded yet.\n";

/// The host editor's document model, as seen by the session controller
#[async_trait]
pub trait DocumentHost: Send + Sync {
    /// Read the current text of the document at `uri`.
    async fn read(&self, uri: &str) -> Result<String>;

    /// Replace the document's full range with `text`.
    async fn replace_all(&self, uri: &str, text: &str) -> Result<()>;

    /// Open a document in an adjacent editor pane.
    async fn open_beside(&self, uri: &str) -> Result<()>;

    /// Surface a transient, dismissable error notification to the user.
    fn notify_error(&self, message: &str);
}

/// In-memory provider for `koan-cell:` virtual documents
#[derive(Debug, Default)]
pub struct VirtualDocuments {
    cells: Mutex<HashMap<String, String>>,
}

impl VirtualDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// The virtual URI for one member id: `koan-cell:<member_id>.py`.
    pub fn uri_for(member_id: &str) -> String {
        format!("{}:{}.py", CELL_SCHEME, member_id)
    }

    /// Extract the member id from a virtual URI, if it is one.
    pub fn member_from_uri(uri: &str) -> Option<&str> {
        uri.strip_prefix(CELL_SCHEME)?
            .strip_prefix(':')?
            .strip_suffix(".py")
    }

    /// Resolve a virtual URI to its content. Unknown cells get a default
    /// placeholder so resolution never fails.
    pub fn provide(&self, uri: &str) -> String {
        let member_id = match Self::member_from_uri(uri) {
            Some(member_id) => member_id,
            None => return CELL_CONTENT_DEFAULT.to_string(),
        };
        self.cells
            .lock()
            .expect("cell map lock poisoned")
            .get(member_id)
            .cloned()
            .unwrap_or_else(|| CELL_CONTENT_DEFAULT.to_string())
    }

    /// Store the current code body for one member id.
    pub fn update_cell(&self, member_id: &str, content: impl Into<String>) {
        debug!(member_id, "Updating virtual cell");
        self.cells
            .lock()
            .expect("cell map lock poisoned")
            .insert(member_id.to_string(), content.into());
    }
}
