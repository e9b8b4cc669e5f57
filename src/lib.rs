//! Host-side core of an interactive Python koan workbench.
//!
//! An editor front end opens a koan manifest document; this crate parses
//! the manifest, introspects the exercise file, runs individual challenge
//! tests in an external interpreter subprocess, and streams normalized
//! results back to the UI over a tagged message protocol.
//!
//! The main entry point is [`model::EditorModel`], one per open manifest
//! document, tracked in a [`model::SessionRegistry`]. Everything that
//! touches the outside world (the editor's document store, the
//! interpreter subprocesses) sits behind a trait so the controller can be
//! driven in tests without an editor or a Python installation.

pub mod code;
pub mod config;
pub mod documents;
pub mod identity;
pub mod launcher;
pub mod manifest;
pub mod messaging;
pub mod model;
pub mod python;
pub mod testing;
pub mod updater;

pub use config::KoanConfig;
pub use documents::DocumentHost;
pub use messaging::{HostCommand, UiCommand};
pub use model::{EditorModel, SessionRegistry};
pub use testing::{TestStatus, TestSuite};
