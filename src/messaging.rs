//! Messaging protocol between the editing surface and the host
//!
//! A closed vocabulary of command tags with fixed payload shapes, modeled
//! as serde tagged unions so the payload shape per tag is enforced at
//! decode time. All messages are one-way and fire-and-forget; correlation
//! happens structurally through `member_id` on the receiving side.

use serde::{Deserialize, Serialize};

use crate::testing::TestSuite;

/// One addressable unit of exercise content, keyed by the Python function
/// name (`member_id` in the protocol)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeData {
    /// Python function identifier, used verbatim as the correlation key
    pub name: String,
    /// Rendered function docstring
    pub instruction: String,
    /// Challenge function code body
    pub code: String,
}

/// Snapshot of one host document sent to the UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub file_name: String,
    pub uri: String,
    pub language: String,
    pub line_count: usize,
    pub encoding: String,
    pub content: String,
}

/// Commands sent from the UI surface to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum UiCommand {
    /// Sent once on UI load to request initial data
    #[serde(rename = "ready")]
    DataReady,

    /// Full replacement of the raw manifest text (un-debounced)
    #[serde(rename = "update")]
    DocumentUpdate { text: String },

    /// Debounced live edit of one challenge's code body
    #[serde(rename = "code-update")]
    CodeUpdate { member_id: String, code: String },

    #[serde(rename = "code-run")]
    CodeRunTests { member_id: String },

    #[serde(rename = "code-open-virtual")]
    CodeOpenVirtual { member_id: String },

    #[serde(rename = "code-reset")]
    CodeReset { member_id: String },

    #[serde(rename = "code-format")]
    CodeFormat { member_id: String },

    #[serde(rename = "output-clear")]
    OutputClear { member_id: String },
}

/// Commands sent from the host to the UI surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum HostCommand {
    /// Initial data bundle for a freshly opened (or re-rendered) session
    #[serde(rename = "initialize")]
    DataInitialize {
        #[serde(rename = "documentInfo")]
        document_info: DocumentInfo,
        #[serde(rename = "pythonDocumentInfo")]
        python_document_info: DocumentInfo,
        challenges: Vec<ChallengeData>,
    },

    /// Result delivery for one test run, keyed by member id
    #[serde(rename = "output-update")]
    OutputUpdate { member_id: String, suite: TestSuite },
}

/// Why an inbound message was rejected
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown or malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl UiCommand {
    /// Decode one inbound message. Unknown tags and malformed payloads are
    /// errors the dispatcher logs and drops; they never throw past it.
    pub fn decode(value: serde_json::Value) -> Result<UiCommand, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Member id this command correlates with, when it has one.
    pub fn member_id(&self) -> Option<&str> {
        match self {
            UiCommand::CodeUpdate { member_id, .. }
            | UiCommand::CodeRunTests { member_id }
            | UiCommand::CodeOpenVirtual { member_id }
            | UiCommand::CodeReset { member_id }
            | UiCommand::CodeFormat { member_id }
            | UiCommand::OutputClear { member_id } => Some(member_id),
            UiCommand::DataReady | UiCommand::DocumentUpdate { .. } => None,
        }
    }
}
