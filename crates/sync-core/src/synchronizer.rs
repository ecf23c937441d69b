//! DocumentSynchronizer: keeps one external document and one diagram session
//! in sync.
//!
//! Change detection works on normalized snapshots:
//!
//! 1. An external edit is pushed into the session only if its snapshot
//!    differs from the last accepted one.
//! 2. A session change is rendered for the document's output format and
//!    written back only if the rendered snapshot differs.
//! 3. Each accepted change replaces the last snapshot *before* the write, so
//!    the echo coming back from the other side compares equal and stops.
//!
//! The `ChangeGuard` drops same-direction events while a propagation in that
//! direction is in flight.

use crate::config::SyncConfig;
use crate::document::{DocumentEvent, DocumentHost, DocumentUri};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::format::{FormatError, FormatPipeline, OutputFormat};
use crate::guard::{ChangeGuard, Direction};
use crate::normalize::{NormalizedSnapshot, normalize_for};
use crate::session::{DiagramSession, SessionError, SessionEvent};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("attach must be called from within a Tokio runtime")]
    NoRuntime,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What a synchronizer is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    PropagatingExternalToSession,
    PropagatingSessionToExternal,
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The change was written to the other side.
    Propagated,
    /// Nothing semantically changed; no write.
    Unchanged,
    /// The host reported a change with an empty change set.
    EmptyChange,
    /// A propagation in the same direction was in flight; event dropped.
    GuardHeld,
    /// The document is on a read-only scheme; no write attempted.
    ReadOnly,
    /// Script conversion failed; the persisted text was kept.
    ConversionFailed,
    /// The write failed and was reported.
    Failed,
    /// The session is gone or the synchronizer was disposed.
    Abandoned,
    /// The session received its initial content.
    Loaded,
    /// The document was saved on the session's request.
    Saved,
}

/// Last accepted snapshot plus a generation counter, so a failed write only
/// rolls back if nothing newer was accepted in the meantime.
struct SnapshotCell {
    generation: u64,
    snapshot: NormalizedSnapshot,
}

/// Event queued for the dispatcher task.
enum Dispatch {
    Document(DocumentEvent),
    Session(SessionEvent),
}

struct Accepted {
    generation: u64,
    previous: NormalizedSnapshot,
}

/// Per-session orchestrator. One instance per open diagram.
pub struct DocumentSynchronizer {
    uri: DocumentUri,
    format: OutputFormat,
    read_only: bool,
    ignore_empty_changes: bool,
    document: Arc<dyn DocumentHost>,
    session: Arc<dyn DiagramSession>,
    pipeline: FormatPipeline,
    guard: ChangeGuard,
    last: Mutex<SnapshotCell>,
    disposed: AtomicBool,
    diagnostics: Arc<EventBus<SyncEvent>>,
}

impl DocumentSynchronizer {
    pub fn new(
        document: Arc<dyn DocumentHost>,
        session: Arc<dyn DiagramSession>,
        config: &SyncConfig,
        diagnostics: Arc<EventBus<SyncEvent>>,
    ) -> Self {
        let uri = document.uri().clone();
        let format = OutputFormat::from_file_name(uri.file_name(), &config.suffixes);
        let read_only = uri.is_read_only(&config.read_only_schemes);

        Self {
            uri,
            format,
            read_only,
            ignore_empty_changes: config.ignore_empty_changes,
            document,
            session,
            pipeline: FormatPipeline::new(config.indent),
            guard: ChangeGuard::new(),
            last: Mutex::new(SnapshotCell {
                generation: 0,
                snapshot: NormalizedSnapshot::Unparseable,
            }),
            disposed: AtomicBool::new(false),
            diagnostics,
        }
    }

    pub fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn state(&self) -> SyncState {
        if self.guard.is_held(Direction::SessionToExternal) {
            SyncState::PropagatingSessionToExternal
        } else if self.guard.is_held(Direction::ExternalToSession) {
            SyncState::PropagatingExternalToSession
        } else {
            SyncState::Idle
        }
    }

    /// The last accepted snapshot.
    pub fn last_snapshot(&self) -> NormalizedSnapshot {
        self.lock_last().snapshot.clone()
    }

    /// Stop reacting to events. Propagations resuming after this are abandoned.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Subscribe to the document's and the session's event streams.
    ///
    /// Events are handed to one dispatcher task per synchronizer, which starts
    /// their handlers in arrival order and drives them on a single task. An
    /// event arriving while a propagation is suspended is handled right away,
    /// as on a single-threaded event loop, whatever the runtime flavor. Drop
    /// or dispose the returned binding to detach.
    pub fn attach(self: &Arc<Self>) -> Result<SyncBinding> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let document_sub = {
            let tx = tx.clone();
            self.document.events().subscribe(move |event: DocumentEvent| {
                let _ = tx.send(Dispatch::Document(event));
            })
        };
        let session_sub = self.session.events().subscribe(move |event: SessionEvent| {
            let _ = tx.send(Dispatch::Session(event));
        });

        runtime.spawn(Self::dispatch(Arc::downgrade(self), rx));

        debug!("Attached synchronizer for {} ({:?})", self.uri, self.format);
        Ok(SyncBinding {
            synchronizer: Arc::clone(self),
            subscriptions: vec![document_sub, session_sub],
        })
    }

    /// Dispatcher loop: runs until both subscriptions are gone, then lets the
    /// handlers still in flight finish.
    async fn dispatch(weak: Weak<Self>, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                biased;

                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let Some(sync) = weak.upgrade() else { break };
                    in_flight.push(sync.handle(event));
                }

                Some(_) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }
        while in_flight.next().await.is_some() {}
    }

    async fn handle(self: Arc<Self>, event: Dispatch) -> Outcome {
        match event {
            Dispatch::Document(event) => self.on_document_changed(event).await,
            Dispatch::Session(event) => self.on_session_event(event).await,
        }
    }

    /// Dispatch a session event to its handler.
    pub async fn on_session_event(&self, event: SessionEvent) -> Outcome {
        match event {
            SessionEvent::Changed { payload } => self.on_session_changed(&payload).await,
            SessionEvent::Initialized => self.on_session_initialized().await,
            SessionEvent::SaveRequested => self.on_save_requested().await,
        }
    }

    /// External text changed: push it into the session if it means something.
    pub async fn on_document_changed(&self, event: DocumentEvent) -> Outcome {
        if self.is_disposed() {
            return Outcome::Abandoned;
        }

        let DocumentEvent::Changed {
            revision,
            text,
            changes,
        } = event;

        if changes.is_empty() && self.ignore_empty_changes {
            debug!("Ignoring empty change set for {} (rev {})", self.uri, revision);
            return Outcome::EmptyChange;
        }

        let direction = Direction::ExternalToSession;
        match self
            .guard
            .run_guarded(direction, self.propagate_to_session(&text))
            .await
        {
            Some(outcome) => outcome,
            None => {
                debug!("Dropping document change for {} (rev {}): propagation in flight", self.uri, revision);
                Outcome::GuardHeld
            }
        }
    }

    async fn propagate_to_session(&self, text: &str) -> Outcome {
        let direction = Direction::ExternalToSession;
        let Some(accepted) = self.accept(normalize_for(self.format, text)) else {
            debug!("Document change for {} is not significant", self.uri);
            self.emit_unchanged(direction);
            return Outcome::Unchanged;
        };

        match self.session.merge(text).await {
            Ok(()) => {
                info!("Merged external edit of {} into session", self.uri);
                self.emit_propagated(direction);
                Outcome::Propagated
            }
            Err(SessionError::Unavailable) => self.abandon(direction),
            Err(e) => {
                self.roll_back(accepted);
                self.fail(direction, &e)
            }
        }
    }

    /// Session changed: render, compare and write back to the document.
    pub async fn on_session_changed(&self, payload: &str) -> Outcome {
        if self.is_disposed() {
            return Outcome::Abandoned;
        }
        if self.read_only {
            debug!("Not writing to read-only document {}", self.uri);
            return Outcome::ReadOnly;
        }

        let direction = Direction::SessionToExternal;
        match self
            .guard
            .run_guarded(direction, self.propagate_to_document(payload))
            .await
        {
            Some(outcome) => outcome,
            None => {
                debug!("Dropping session change for {}: propagation in flight", self.uri);
                Outcome::GuardHeld
            }
        }
    }

    async fn propagate_to_document(&self, payload: &str) -> Outcome {
        let direction = Direction::SessionToExternal;

        // Script conversion updates the persisted script in place
        let current = match self.format {
            OutputFormat::ConvertedScript => match self.document.text().await {
                Ok(text) => text,
                Err(e) => return self.fail(direction, &e),
            },
            _ => String::new(),
        };

        let output = match self
            .pipeline
            .render(self.format, payload, &current, self.session.as_ref())
            .await
        {
            Ok(output) => output,
            Err(FormatError::Conversion(message)) => {
                warn!("Script conversion for {} failed, keeping previous text: {}", self.uri, message);
                self.diagnostics.emit(SyncEvent::ConversionFailed {
                    uri: self.uri.to_string(),
                    message,
                });
                return Outcome::ConversionFailed;
            }
            Err(FormatError::Session(SessionError::Unavailable)) => return self.abandon(direction),
            Err(e) => return self.fail(direction, &e),
        };

        // The session may have been closed while rendering
        if self.is_disposed() {
            return self.abandon(direction);
        }

        let Some(accepted) = self.accept(normalize_for(self.format, &output)) else {
            debug!("Session change for {} is not significant", self.uri);
            self.emit_unchanged(direction);
            return Outcome::Unchanged;
        };

        let written = async {
            self.document.replace_text(&output).await?;
            self.document.save().await
        };
        match written.await {
            Ok(()) => {
                info!("Wrote session change to {}", self.uri);
                self.emit_propagated(direction);
                Outcome::Propagated
            }
            Err(e) => {
                self.roll_back(accepted);
                self.fail(direction, &e)
            }
        }
    }

    /// Session booted: hand it the document's current text.
    pub async fn on_session_initialized(&self) -> Outcome {
        if self.is_disposed() {
            return Outcome::Abandoned;
        }

        let direction = Direction::ExternalToSession;
        let text = match self.document.text().await {
            Ok(text) => text,
            Err(e) => return self.fail(direction, &e),
        };

        match self.session.load(&text) {
            Ok(()) => {
                let mut last = self.lock_last();
                last.generation += 1;
                last.snapshot = normalize_for(self.format, &text);
                debug!("Loaded {} into session", self.uri);
                Outcome::Loaded
            }
            Err(SessionError::Unavailable) => self.abandon(direction),
            Err(e) => self.fail(direction, &e),
        }
    }

    /// Session asked for a save.
    pub async fn on_save_requested(&self) -> Outcome {
        if self.is_disposed() {
            return Outcome::Abandoned;
        }
        if self.read_only {
            return Outcome::ReadOnly;
        }

        match self.document.save().await {
            Ok(()) => {
                debug!("Saved {} on session request", self.uri);
                Outcome::Saved
            }
            Err(e) => self.fail(Direction::SessionToExternal, &e),
        }
    }

    fn lock_last(&self) -> std::sync::MutexGuard<'_, SnapshotCell> {
        self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the last snapshot with `snapshot` unless they are equal.
    fn accept(&self, snapshot: NormalizedSnapshot) -> Option<Accepted> {
        let mut last = self.lock_last();
        if last.snapshot == snapshot {
            return None;
        }
        last.generation += 1;
        let previous = std::mem::replace(&mut last.snapshot, snapshot);
        Some(Accepted {
            generation: last.generation,
            previous,
        })
    }

    /// Undo `accepted` after a failed write, unless something newer replaced it.
    fn roll_back(&self, accepted: Accepted) {
        let mut last = self.lock_last();
        if last.generation == accepted.generation {
            last.snapshot = accepted.previous;
        }
    }

    fn fail(&self, direction: Direction, err: &dyn std::error::Error) -> Outcome {
        error!("Failed to sync {} ({}): {}", self.uri, direction, err);
        self.diagnostics.emit(SyncEvent::PropagationFailed {
            uri: self.uri.to_string(),
            direction,
            message: err.to_string(),
        });
        Outcome::Failed
    }

    fn abandon(&self, direction: Direction) -> Outcome {
        info!("Session for {} is gone, abandoning {} propagation", self.uri, direction);
        Outcome::Abandoned
    }

    fn emit_propagated(&self, direction: Direction) {
        self.diagnostics.emit(SyncEvent::Propagated {
            uri: self.uri.to_string(),
            direction,
        });
    }

    fn emit_unchanged(&self, direction: Direction) {
        self.diagnostics.emit(SyncEvent::Unchanged {
            uri: self.uri.to_string(),
            direction,
        });
    }
}

/// Live subscriptions of an attached synchronizer.
///
/// Dropping it detaches every callback; `dispose` additionally abandons
/// propagations still in flight.
pub struct SyncBinding {
    synchronizer: Arc<DocumentSynchronizer>,
    subscriptions: Vec<Subscription>,
}

impl SyncBinding {
    pub fn synchronizer(&self) -> &Arc<DocumentSynchronizer> {
        &self.synchronizer
    }

    pub fn dispose(self) {
        self.synchronizer.dispose();
        for subscription in self.subscriptions {
            subscription.dispose();
        }
        debug!("Detached synchronizer for {}", self.synchronizer.uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::InMemoryDocument;
    use crate::format::ORIGIN_ID;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn diagram(label: &str, modified: &str) -> String {
        format!(
            "<mxfile host=\"{ORIGIN_ID}\" modified=\"{modified}\">\n  <diagram id=\"p1\">\n    <mxGraphModel dx=\"10\" dy=\"20\">\n      <root>\n        <mxCell id=\"2\" value=\"{label}\"/>\n      </root>\n    </mxGraphModel>\n  </diagram>\n</mxfile>\n"
        )
    }

    /// Session fake recording every command.
    #[derive(Default)]
    struct FakeSession {
        loads: Mutex<Vec<String>>,
        merges: Mutex<Vec<String>>,
        svg: Mutex<String>,
        script: Mutex<Option<String>>,
        unavailable: AtomicBool,
        /// Existing script handed to each conversion
        converted_from: Mutex<Vec<String>>,
        /// (entered, release) pair pausing `merge` until released
        merge_gate: Option<(Arc<Notify>, Arc<Notify>)>,
        /// Same for `export_embedded_image`
        export_gate: Option<(Arc<Notify>, Arc<Notify>)>,
        events: Arc<EventBus<SessionEvent>>,
    }

    impl FakeSession {
        fn gated() -> (Self, Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            let session = Self {
                merge_gate: Some((Arc::clone(&entered), Arc::clone(&release))),
                ..Self::default()
            };
            (session, entered, release)
        }

        fn gated_export() -> (Self, Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            let session = Self {
                export_gate: Some((Arc::clone(&entered), Arc::clone(&release))),
                ..Self::default()
            };
            (session, entered, release)
        }

        fn merges(&self) -> Vec<String> {
            self.merges.lock().unwrap().clone()
        }

        fn loads(&self) -> Vec<String> {
            self.loads.lock().unwrap().clone()
        }

        fn check(&self) -> crate::session::Result<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(SessionError::Unavailable)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl DiagramSession for FakeSession {
        fn load(&self, text: &str) -> crate::session::Result<()> {
            self.check()?;
            self.loads.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn merge(&self, text: &str) -> crate::session::Result<()> {
            self.check()?;
            self.merges.lock().unwrap().push(text.to_string());
            if let Some((entered, release)) = &self.merge_gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(())
        }

        async fn export_embedded_image(&self) -> crate::session::Result<Vec<u8>> {
            self.check()?;
            if let Some((entered, release)) = &self.export_gate {
                entered.notify_one();
                release.notified().await;
            }
            Ok(self.svg.lock().unwrap().as_bytes().to_vec())
        }

        async fn convert_to_script(&self, _xml: &str, existing: &str) -> crate::session::Result<String> {
            self.check()?;
            self.converted_from.lock().unwrap().push(existing.to_string());
            self.script
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| SessionError::Conversion("shape not supported".into()))
        }

        fn events(&self) -> Arc<EventBus<SessionEvent>> {
            Arc::clone(&self.events)
        }
    }

    struct Fixture {
        document: Arc<InMemoryDocument>,
        session: Arc<FakeSession>,
        sync: Arc<DocumentSynchronizer>,
        diagnostics: Arc<Mutex<Vec<SyncEvent>>>,
        _diagnostics_sub: Subscription,
    }

    fn fixture_with(uri: DocumentUri, text: &str, session: FakeSession, config: SyncConfig) -> Fixture {
        let document = Arc::new(InMemoryDocument::new(uri, text));
        let session = Arc::new(session);
        let bus = Arc::new(EventBus::new());
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let diagnostics_sub = bus.subscribe({
            let diagnostics = Arc::clone(&diagnostics);
            move |event| diagnostics.lock().unwrap().push(event)
        });

        let sync = Arc::new(DocumentSynchronizer::new(
            document.clone(),
            session.clone(),
            &config,
            bus,
        ));
        Fixture {
            document,
            session,
            sync,
            diagnostics,
            _diagnostics_sub: diagnostics_sub,
        }
    }

    fn fixture(path: &str, text: &str) -> Fixture {
        fixture_with(DocumentUri::file(path), text, FakeSession::default(), SyncConfig::default())
    }

    fn changed(text: &str) -> DocumentEvent {
        DocumentEvent::Changed {
            revision: 1,
            text: text.to_string(),
            changes: vec![crate::document::TextChange::whole("", text)],
        }
    }

    /// Let the dispatcher task run queued handlers to completion.
    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_initialization_loads_document() {
        let text = diagram("A", "t0");
        let f = fixture("a.drawio", &text);

        assert_eq!(f.sync.on_session_initialized().await, Outcome::Loaded);
        assert_eq!(f.session.loads(), vec![text.clone()]);
        assert_eq!(f.sync.last_snapshot(), crate::normalize::normalize(&text));
    }

    #[tokio::test]
    async fn test_cosmetic_external_edit_is_not_merged() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;

        let reformatted: String = diagram("A", "t1").lines().map(str::trim).collect();
        assert_eq!(f.sync.on_document_changed(changed(&reformatted)).await, Outcome::Unchanged);
        assert!(f.session.merges().is_empty());
    }

    #[tokio::test]
    async fn test_external_edit_is_merged() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;

        let edited = diagram("B", "t0");
        assert_eq!(f.sync.on_document_changed(changed(&edited)).await, Outcome::Propagated);
        assert_eq!(f.session.merges(), vec![edited]);
        assert_eq!(f.sync.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_empty_change_set() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;

        let event = DocumentEvent::Changed {
            revision: 3,
            text: diagram("B", "t0"),
            changes: vec![],
        };
        assert_eq!(f.sync.on_document_changed(event.clone()).await, Outcome::EmptyChange);
        assert!(f.session.merges().is_empty());

        let config = SyncConfig {
            ignore_empty_changes: false,
            ..SyncConfig::default()
        };
        let f = fixture_with(DocumentUri::file("a.drawio"), &diagram("A", "t0"), FakeSession::default(), config);
        f.sync.on_session_initialized().await;
        assert_eq!(f.sync.on_document_changed(event).await, Outcome::Propagated);
    }

    #[tokio::test]
    async fn test_session_edit_is_written_and_saved() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;

        let payload = r#"<mxfile host="other" modified="t5"><diagram id="p1"><mxGraphModel><root><mxCell id="2" value="C"/></root></mxGraphModel></diagram></mxfile>"#;
        assert_eq!(f.sync.on_session_changed(payload).await, Outcome::Propagated);

        let written = f.document.current_text();
        assert!(written.starts_with(&format!("<mxfile host=\"{ORIGIN_ID}\"")));
        assert!(written.contains("value=\"C\""));
        assert_eq!(f.document.saved_text(), Some(written.clone()));
        assert_eq!(f.document.revision(), 1);

        // The host echoes our own write back: nothing to merge
        assert_eq!(f.sync.on_document_changed(changed(&written)).await, Outcome::Unchanged);
        assert!(f.session.merges().is_empty());
    }

    #[tokio::test]
    async fn test_volatile_session_change_is_not_written() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;

        let touched = diagram("A", "t9").replace("dx=\"10\"", "dx=\"400\"");
        assert_eq!(f.sync.on_session_changed(&touched).await, Outcome::Unchanged);
        assert_eq!(f.document.revision(), 0);
        assert_eq!(f.document.saved_text(), None);
    }

    #[tokio::test]
    async fn test_read_only_document_is_never_written() {
        let f = fixture_with(
            DocumentUri::new("git", "/repo/a.drawio"),
            &diagram("A", "t0"),
            FakeSession::default(),
            SyncConfig::default(),
        );
        f.sync.on_session_initialized().await;

        assert_eq!(f.sync.on_session_changed(&diagram("Z", "t1")).await, Outcome::ReadOnly);
        assert_eq!(f.sync.on_session_changed("not xml at all").await, Outcome::ReadOnly);
        assert_eq!(f.sync.on_save_requested().await, Outcome::ReadOnly);
        assert_eq!(f.document.current_text(), diagram("A", "t0"));
        assert_eq!(f.document.revision(), 0);
    }

    #[tokio::test]
    async fn test_reentrant_external_change_is_dropped() {
        let (session, entered, release) = FakeSession::gated();
        let f = fixture_with(DocumentUri::file("a.drawio"), &diagram("A", "t0"), session, SyncConfig::default());
        f.sync.on_session_initialized().await;

        let first = tokio::spawn({
            let sync = Arc::clone(&f.sync);
            async move { sync.on_document_changed(changed(&diagram("B", "t0"))).await }
        });
        entered.notified().await;
        assert_eq!(f.sync.state(), SyncState::PropagatingExternalToSession);

        let second = f.sync.on_document_changed(changed(&diagram("C", "t0"))).await;
        assert_eq!(second, Outcome::GuardHeld);
        assert_eq!(f.session.merges().len(), 1);

        // The other direction is not blocked
        assert_eq!(f.sync.on_session_changed(&diagram("D", "t0")).await, Outcome::Propagated);

        release.notify_one();
        assert_eq!(first.await.unwrap(), Outcome::Propagated);
        assert_eq!(f.sync.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_failed_conversion_keeps_script() {
        let old_script = "# generated\nnodes = ['A']\n";
        let f = fixture("flow.py", old_script);
        f.sync.on_session_initialized().await;

        assert_eq!(f.sync.on_session_changed(&diagram("B", "t1")).await, Outcome::ConversionFailed);
        assert_eq!(f.document.current_text(), old_script);
        assert_eq!(f.document.revision(), 0);
        assert!(matches!(
            f.diagnostics.lock().unwrap().last(),
            Some(SyncEvent::ConversionFailed { .. })
        ));

        *f.session.script.lock().unwrap() = Some("nodes = ['B']\n".into());
        assert_eq!(f.sync.on_session_changed(&diagram("B", "t1")).await, Outcome::Propagated);
        assert_eq!(f.document.current_text(), "nodes = ['B']\n");
    }

    #[tokio::test]
    async fn test_conversion_starts_from_persisted_script() {
        let f = fixture("flow.py", "import os\nflow = {}\n");
        *f.session.script.lock().unwrap() = Some("import os\nflow = {'A': {}}\n".into());
        f.sync.on_session_initialized().await;

        assert_eq!(f.sync.on_session_changed(&diagram("A", "t1")).await, Outcome::Propagated);
        assert_eq!(f.document.current_text(), "import os\nflow = {'A': {}}\n");

        *f.session.script.lock().unwrap() = Some("import os\nflow = {'B': {}}\n".into());
        assert_eq!(f.sync.on_session_changed(&diagram("B", "t2")).await, Outcome::Propagated);
        assert_eq!(
            *f.session.converted_from.lock().unwrap(),
            vec!["import os\nflow = {}\n".to_string(), "import os\nflow = {'A': {}}\n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reentrant_session_change_is_dropped() {
        let (session, entered, release) = FakeSession::gated_export();
        *session.svg.lock().unwrap() =
            "<svg xmlns=\"http://www.w3.org/2000/svg\" content=\"&lt;mxfile/&gt;\"/>".into();
        let f = fixture_with(DocumentUri::file("a.drawio.svg"), "<svg/>", session, SyncConfig::default());
        f.sync.on_session_initialized().await;

        let first = tokio::spawn({
            let sync = Arc::clone(&f.sync);
            async move { sync.on_session_changed("<mxfile/>").await }
        });
        entered.notified().await;
        assert_eq!(f.sync.state(), SyncState::PropagatingSessionToExternal);

        // A second session change while the export is pending is not written
        assert_eq!(f.sync.on_session_changed("<mxfile><diagram/></mxfile>").await, Outcome::GuardHeld);
        assert_eq!(f.document.revision(), 0);

        release.notify_one();
        assert_eq!(first.await.unwrap(), Outcome::Propagated);
        assert_eq!(f.document.revision(), 1);
        assert_eq!(f.sync.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_embedded_svg_document() {
        let session = FakeSession::default();
        *session.svg.lock().unwrap() =
            "<svg xmlns=\"http://www.w3.org/2000/svg\" content=\"&lt;mxfile/&gt;\"><g/></svg>".into();
        let f = fixture_with(DocumentUri::file("a.drawio.svg"), "<svg/>", session, SyncConfig::default());
        f.sync.on_session_initialized().await;
        assert_eq!(f.sync.format(), OutputFormat::EmbeddedSvg);

        assert_eq!(f.sync.on_session_changed("<mxfile/>").await, Outcome::Propagated);
        assert!(f.document.current_text().starts_with(&format!("<svg host=\"{ORIGIN_ID}\"")));

        // Same export again: nothing new to write
        assert_eq!(f.sync.on_session_changed("<mxfile/>").await, Outcome::Unchanged);
        assert_eq!(f.document.revision(), 1);
    }

    #[tokio::test]
    async fn test_apply_failure_is_reported_and_retried() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;
        f.document.reject_edits(Some("file is locked"));

        let payload = diagram("B", "t1");
        assert_eq!(f.sync.on_session_changed(&payload).await, Outcome::Failed);
        assert_eq!(f.sync.state(), SyncState::Idle);
        assert!(matches!(
            f.diagnostics.lock().unwrap().last(),
            Some(SyncEvent::PropagationFailed { direction: Direction::SessionToExternal, .. })
        ));

        // Snapshot was rolled back, so the same change goes through later
        f.document.reject_edits(None);
        assert_eq!(f.sync.on_session_changed(&payload).await, Outcome::Propagated);
    }

    #[tokio::test]
    async fn test_unavailable_session_is_abandoned() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;
        f.session.unavailable.store(true, Ordering::SeqCst);

        assert_eq!(f.sync.on_document_changed(changed(&diagram("B", "t0"))).await, Outcome::Abandoned);
        assert!(f.diagnostics.lock().unwrap().iter().all(|e| !matches!(e, SyncEvent::PropagationFailed { .. })));
    }

    #[tokio::test]
    async fn test_save_request() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        f.sync.on_session_initialized().await;
        let before = f.sync.last_snapshot();

        assert_eq!(f.sync.on_session_event(SessionEvent::SaveRequested).await, Outcome::Saved);
        assert_eq!(f.document.saved_text(), Some(diagram("A", "t0")));
        assert_eq!(f.sync.last_snapshot(), before);
    }

    #[tokio::test]
    async fn test_attached_synchronizer_converges() {
        let f = fixture("a.drawio", &diagram("A", "t0"));
        let binding = f.sync.attach().unwrap();
        let session_events = f.session.events();

        session_events.emit(SessionEvent::Initialized);
        settle().await;
        assert_eq!(f.session.loads().len(), 1);

        // Diagram edit: written once, the document echo is not merged back
        session_events.emit(SessionEvent::Changed {
            payload: diagram("B", "t1"),
        });
        settle().await;
        assert_eq!(f.document.revision(), 1);
        assert!(f.session.merges().is_empty());

        // External edit: merged once
        f.document.edit(&diagram("C", "t1"));
        settle().await;
        assert_eq!(f.session.merges().len(), 1);

        // The session echoes the merged text with fresh bookkeeping: no write
        session_events.emit(SessionEvent::Changed {
            payload: diagram("C", "t2"),
        });
        settle().await;
        assert_eq!(f.document.revision(), 2);

        assert_eq!(
            crate::normalize::normalize(&f.document.current_text()),
            crate::normalize::normalize(&diagram("C", "t2"))
        );

        binding.dispose();
        assert_eq!(session_events.subscriber_count(), 0);
        assert_eq!(f.document.events().subscriber_count(), 0);

        f.document.edit(&diagram("D", "t3"));
        settle().await;
        assert_eq!(f.session.merges().len(), 1);
        assert_eq!(f.sync.on_session_changed(&diagram("E", "t3")).await, Outcome::Abandoned);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_attached_edits_apply_in_order() {
        for _ in 0..50 {
            let f = fixture("a.drawio", &diagram("0", "t0"));
            let binding = f.sync.attach().unwrap();
            let session_events = f.session.events();
            f.sync.on_session_initialized().await;

            for label in 1..=5 {
                session_events.emit(SessionEvent::Changed {
                    payload: diagram(&label.to_string(), "t1"),
                });
            }

            for _ in 0..200 {
                if f.document.revision() == 5 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;

            assert_eq!(f.document.revision(), 5);
            assert!(f.document.current_text().contains("value=\"5\""));
            assert!(f.session.merges().is_empty());
            binding.dispose();
        }
    }

    #[test]
    fn test_attach_requires_runtime() {
        let f = fixture("a.drawio", "<mxfile/>");
        assert!(matches!(f.sync.attach(), Err(SyncError::NoRuntime)));
    }
}
