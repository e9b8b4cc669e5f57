//! Editor session controller
//!
//! One `EditorModel` per open manifest document: it owns the parsed
//! manifest, the resolved sibling file bindings and the challenge
//! snapshot, routes inbound UI commands to actions, and delivers results
//! back over the outbound channel. Sessions are tracked in a
//! `SessionRegistry` keyed by document URI so no two controllers ever
//! hold the same document.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::code::{ChallengeSource, PythonChallengeSource};
use crate::config::KoanConfig;
use crate::documents::{DocumentHost, VirtualDocuments};
use crate::launcher::{PythonLauncher, TestLauncher};
use crate::manifest::Manifest;
use crate::messaging::{ChallengeData, DocumentInfo, HostCommand, UiCommand};
use crate::python::Python;
use crate::testing::TestSuite;
use crate::updater::{CodeUpdater, PythonUpdater};

/// Lifecycle of one editor session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Running,
    Idle,
    Disposed,
}

/// Data re-derived on every (re-)initialization
#[derive(Default)]
struct SessionData {
    manifest: Option<Manifest>,
    challenges: Vec<ChallengeData>,
}

/// Per-document session controller
pub struct EditorModel {
    /// Self-handle for background tasks spawned by the handlers
    this: Weak<EditorModel>,
    /// URI of the owning manifest document
    uri: String,
    /// Filesystem path of the manifest document, for sibling resolution
    manifest_path: PathBuf,
    config: KoanConfig,
    host: Arc<dyn DocumentHost>,
    launcher: Arc<dyn TestLauncher>,
    updater: Arc<dyn CodeUpdater>,
    source: Arc<dyn ChallengeSource>,
    virtual_docs: Arc<VirtualDocuments>,
    outbound: mpsc::UnboundedSender<HostCommand>,
    state: Mutex<SessionState>,
    session: Mutex<SessionData>,
    /// Members with an active test run; new requests for them are rejected
    in_flight: Mutex<HashSet<String>>,
    /// Pending debounce timers for live code edits, keyed by member id.
    /// The sequence number lets a fired timer remove its own entry without
    /// clobbering a newer timer for the same member.
    debounce: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    debounce_seq: AtomicU64,
}

impl EditorModel {
    /// Create a session wired to the production Python collaborators.
    /// Returns the model and the receiving end of its outbound channel.
    pub fn open(
        uri: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
        host: Arc<dyn DocumentHost>,
        config: KoanConfig,
    ) -> (Arc<EditorModel>, mpsc::UnboundedReceiver<HostCommand>) {
        let python = Python::new(config.python_executable.clone());
        let launcher = Arc::new(PythonLauncher::new(
            python.clone(),
            config.convention.clone(),
            config.test_timeout,
        ));
        let updater = Arc::new(PythonUpdater::new(
            python.clone(),
            config.updater_script.clone(),
        ));
        let source = Arc::new(PythonChallengeSource::new(
            python,
            config.parser_script.clone(),
        ));
        Self::with_parts(uri, manifest_path, host, launcher, updater, source, config)
    }

    /// Create a session with explicit collaborators (tests use fakes here).
    pub fn with_parts(
        uri: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
        host: Arc<dyn DocumentHost>,
        launcher: Arc<dyn TestLauncher>,
        updater: Arc<dyn CodeUpdater>,
        source: Arc<dyn ChallengeSource>,
        config: KoanConfig,
    ) -> (Arc<EditorModel>, mpsc::UnboundedReceiver<HostCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let uri = uri.into();
        let manifest_path = manifest_path.into();
        let model = Arc::new_cyclic(|this| EditorModel {
            this: this.clone(),
            uri,
            manifest_path,
            config,
            host,
            launcher,
            updater,
            source,
            virtual_docs: Arc::new(VirtualDocuments::new()),
            outbound: tx,
            state: Mutex::new(SessionState::Uninitialized),
            session: Mutex::new(SessionData::default()),
            in_flight: Mutex::new(HashSet::new()),
            debounce: Mutex::new(HashMap::new()),
            debounce_seq: AtomicU64::new(0),
        });
        (model, rx)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn virtual_documents(&self) -> &Arc<VirtualDocuments> {
        &self.virtual_docs
    }

    // Initialization
    //--------------------------------------------------

    /// Parse the manifest, load the exercise document and its challenge
    /// metadata, and send the initial data bundle to the UI. A manifest
    /// decode failure aborts initialization of this session only.
    pub async fn initialize(&self) {
        if self.state() == SessionState::Disposed {
            return;
        }

        let manifest_text = match self.host.read(&self.uri).await {
            Ok(text) => text,
            Err(error) => {
                error!("Failed to read manifest document {}: {:#}", self.uri, error);
                self.host
                    .notify_error(&format!("Failed to read koan manifest: {}", error));
                return;
            }
        };

        let manifest = match Manifest::parse(&manifest_text) {
            Ok(manifest) => manifest,
            Err(error) => {
                error!("Invalid koan manifest {}: {}", self.uri, error);
                self.host
                    .notify_error(&format!("Invalid koan manifest: {}", error));
                return;
            }
        };

        let exercise_path = manifest.exercise_path(&self.manifest_dir());
        let exercise_uri = uri_of(&exercise_path);
        let exercise_text = match self.host.read(&exercise_uri).await {
            Ok(text) => text,
            Err(error) => {
                error!("Failed to read exercise file {}: {:#}", exercise_uri, error);
                self.host
                    .notify_error(&format!("Failed to read exercise file: {}", error));
                return;
            }
        };

        // Challenge metadata is an enhancement; a parser failure renders an
        // empty challenge list instead of aborting the session.
        let challenges = match self.source.challenges(&exercise_path).await {
            Ok(challenges) => challenges,
            Err(error) => {
                error!("Failed to parse challenges: {:#}", error);
                vec![]
            }
        };

        // Populate the virtual cells now that the code bodies are known.
        for challenge in &challenges {
            self.virtual_docs
                .update_cell(&challenge.name, challenge.code.clone());
        }

        {
            let mut session = self.session.lock().expect("session lock poisoned");
            session.manifest = Some(manifest);
            session.challenges = challenges.clone();
        }

        self.send(HostCommand::DataInitialize {
            document_info: document_info(&self.uri, "json", &manifest_text),
            python_document_info: document_info(&exercise_uri, "python", &exercise_text),
            challenges,
        });

        self.transition(SessionState::Ready);
        info!("Session initialized for {}", self.uri);
    }

    /// The owning manifest document changed externally: re-parse and
    /// re-render. In-flight runs are not cancelled; they report against
    /// the member id they were started with.
    pub async fn on_document_changed(&self) {
        if self.state() == SessionState::Disposed {
            return;
        }
        debug!("Manifest document changed externally: {}", self.uri);
        self.initialize().await;
    }

    /// Stop processing messages and cancel pending debounce timers.
    /// In-flight subprocess executions are not killed.
    pub fn dispose(&self) {
        *self.state.lock().expect("state lock poisoned") = SessionState::Disposed;
        for (_, (_, handle)) in self
            .debounce
            .lock()
            .expect("debounce lock poisoned")
            .drain()
        {
            handle.abort();
        }
        info!("Session disposed for {}", self.uri);
    }

    // Messaging
    //--------------------------------------------------

    /// Route one inbound UI message. Unknown commands are logged and
    /// dropped; nothing here ever escapes to the caller.
    pub async fn dispatch(&self, message: serde_json::Value) {
        if self.state() == SessionState::Disposed {
            warn!("Dropping message for disposed session {}", self.uri);
            return;
        }

        let command = match UiCommand::decode(message) {
            Ok(command) => command,
            Err(error) => {
                warn!("Dropping inbound message: {}", error);
                return;
            }
        };

        match command {
            UiCommand::DataReady => self.initialize().await,
            UiCommand::DocumentUpdate { text } => self.handle_document_update(&text).await,
            UiCommand::CodeUpdate { member_id, code } => self.handle_code_update(member_id, code),
            UiCommand::CodeRunTests { member_id } => self.handle_run_tests(member_id),
            UiCommand::CodeOpenVirtual { member_id } => self.handle_open_virtual(&member_id).await,
            UiCommand::CodeReset { member_id } => self.handle_reset(member_id),
            UiCommand::CodeFormat { member_id } => {
                warn!("Code format requested for {} but not implemented", member_id);
                self.host.notify_error("Code format is not implemented yet.");
            }
            UiCommand::OutputClear { member_id } => {
                debug!("Output clear for {} is handled by the UI", member_id);
            }
        }
    }

    // Document editing
    //--------------------------------------------------

    /// Direct, un-debounced full replace of the manifest text.
    async fn handle_document_update(&self, text: &str) {
        if let Err(error) = self.host.replace_all(&self.uri, text).await {
            error!("Failed to update manifest document: {:#}", error);
            self.host
                .notify_error(&format!("Failed to update koan manifest: {}", error));
        }
    }

    /// Debounced live code edit: a new edit for the same member cancels
    /// and restarts the timer, so only the last edit's content is ever
    /// sent to the updater subprocess (last-write-wins, not a queue).
    fn handle_code_update(&self, member_id: String, code: String) {
        let seq = self.debounce_seq.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.debounce.lock().expect("debounce lock poisoned");
        if let Some((_, previous)) = timers.remove(&member_id) {
            previous.abort();
        }

        let model = self.to_arc();
        let delay = self.config.debounce;
        let member = member_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            model.persist_code(&member, &code).await;
            // Drop our own map entry unless a newer edit replaced it.
            let mut timers = model.debounce.lock().expect("debounce lock poisoned");
            if timers.get(&member).is_some_and(|(stored, _)| *stored == seq) {
                timers.remove(&member);
            }
        });
        timers.insert(member_id, (seq, handle));
    }

    /// Run the updater subprocess and apply its output as a whole-document
    /// edit. On failure the document is left unchanged.
    async fn persist_code(&self, member_id: &str, code: &str) {
        let Some(exercise_path) = self.exercise_path() else {
            warn!("Code update for {} before manifest was loaded", member_id);
            return;
        };

        match self.updater.update(&exercise_path, member_id, code).await {
            Ok(content) => {
                let exercise_uri = uri_of(&exercise_path);
                if let Err(error) = self.host.replace_all(&exercise_uri, &content).await {
                    error!("Failed to apply code update: {:#}", error);
                    self.host
                        .notify_error(&format!("Failed to apply code update: {}", error));
                    return;
                }
                self.virtual_docs.update_cell(member_id, code);
            }
            Err(error) => {
                error!("Updater failed for {}: {:#}", member_id, error);
                self.host.notify_error(&format!(
                    "Failed to update code for {}: {}",
                    member_id, error
                ));
            }
        }
    }

    // Test execution
    //--------------------------------------------------

    /// Start a test run for one member. A member with an active run
    /// rejects the new request outright; the active run's result is the
    /// one the UI gets. Runs for different members proceed concurrently.
    fn handle_run_tests(&self, member_id: String) {
        {
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            if !in_flight.insert(member_id.clone()) {
                warn!("Test run already in flight for {}, request rejected", member_id);
                return;
            }
        }

        let Some(test_path) = self.test_path() else {
            warn!("Test run for {} before manifest was loaded", member_id);
            self.clear_in_flight(&member_id);
            return;
        };

        self.transition(SessionState::Running);
        info!("Starting test run for {}", member_id);

        let model = self.to_arc();
        tokio::spawn(async move {
            let suite = match model.launcher.execute(&test_path, &member_id).await {
                Ok(suite) => suite,
                Err(error) => {
                    // Launch failures become a normal protocol message, never
                    // an unhandled rejection.
                    error!("Test execution failed for {}: {:#}", member_id, error);
                    let identity = model.config.convention.resolve(&test_path, &member_id);
                    TestSuite::failure(
                        &identity,
                        &member_id,
                        format!("Test execution failed: {:#}", error),
                    )
                }
            };

            if let Err(violation) = suite.check_protocol() {
                error!("Discarding malformed suite for {}: {}", member_id, violation);
            } else {
                model.send(HostCommand::OutputUpdate {
                    member_id: member_id.clone(),
                    suite,
                });
            }
            model.clear_in_flight(&member_id);
        });
    }

    fn clear_in_flight(&self, member_id: &str) {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        in_flight.remove(member_id);
        if in_flight.is_empty() {
            self.transition(SessionState::Idle);
        }
    }

    // Virtual documents
    //--------------------------------------------------

    async fn handle_open_virtual(&self, member_id: &str) {
        let uri = VirtualDocuments::uri_for(member_id);
        if let Err(error) = self.host.open_beside(&uri).await {
            error!("Failed to open virtual document {}: {:#}", uri, error);
            self.host
                .notify_error(&format!("Failed to open code view: {}", error));
        }
    }

    /// Restore a challenge's code body to its pristine snapshot.
    fn handle_reset(&self, member_id: String) {
        let pristine = {
            let session = self.session.lock().expect("session lock poisoned");
            session
                .challenges
                .iter()
                .find(|challenge| challenge.name == member_id)
                .map(|challenge| challenge.code.clone())
        };

        match pristine {
            Some(code) => {
                let model = self.to_arc();
                tokio::spawn(async move {
                    model.persist_code(&member_id, &code).await;
                });
            }
            None => {
                warn!("Reset requested for unknown challenge {}", member_id);
                self.host
                    .notify_error(&format!("Unknown challenge: {}", member_id));
            }
        }
    }

    // Helpers
    //--------------------------------------------------

    /// Strong self-handle for background tasks. The weak pointer is
    /// upgradable for as long as a method can be called on `&self`.
    fn to_arc(&self) -> Arc<EditorModel> {
        self.this.upgrade().expect("session controller dropped")
    }

    fn manifest_dir(&self) -> PathBuf {
        self.manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn exercise_path(&self) -> Option<PathBuf> {
        let session = self.session.lock().expect("session lock poisoned");
        session
            .manifest
            .as_ref()
            .map(|manifest| manifest.exercise_path(&self.manifest_dir()))
    }

    fn test_path(&self) -> Option<PathBuf> {
        let session = self.session.lock().expect("session lock poisoned");
        session
            .manifest
            .as_ref()
            .map(|manifest| manifest.test_path(&self.manifest_dir()))
    }

    fn send(&self, message: HostCommand) {
        if self.outbound.send(message).is_err() {
            warn!("UI channel closed, dropping outbound message");
        }
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state != SessionState::Disposed {
            *state = next;
        }
    }

    #[cfg(test)]
    fn pending_debounce_timers(&self) -> usize {
        self.debounce.lock().expect("debounce lock poisoned").len()
    }
}

/// Sessions keyed by manifest document URI; at most one per document.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<EditorModel>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session. Replacing an existing session for the same URI
    /// disposes the old one first.
    pub fn insert(&self, model: Arc<EditorModel>) {
        let mut sessions = self.sessions.lock().expect("session map lock poisoned");
        if let Some(previous) = sessions.insert(model.uri().to_string(), model) {
            previous.dispose();
        }
    }

    pub fn get(&self, uri: &str) -> Option<Arc<EditorModel>> {
        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .get(uri)
            .cloned()
    }

    /// Route a workspace document-change notification to the owning
    /// session, if any. Changes to unrelated documents are ignored.
    pub async fn on_document_changed(&self, uri: &str) {
        if let Some(model) = self.get(uri) {
            model.on_document_changed().await;
        }
    }

    /// Dispose and forget the session for a closed document.
    pub fn dispose(&self, uri: &str) {
        let removed = self
            .sessions
            .lock()
            .expect("session map lock poisoned")
            .remove(uri);
        if let Some(model) = removed {
            model.dispose();
        }
    }
}

fn uri_of(path: &Path) -> String {
    path.display().to_string()
}

fn document_info(uri: &str, language: &str, content: &str) -> DocumentInfo {
    let file_name = uri
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .last()
        .unwrap_or(uri);
    DocumentInfo {
        file_name: file_name.to_string(),
        uri: uri.to_string(),
        language: language.to_string(),
        line_count: content.lines().count(),
        encoding: "utf-8".to_string(),
        content: content.to_string(),
    }
}
