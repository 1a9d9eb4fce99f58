//! Live two-way binding between a shared document and a text model.
//!
//! One binding exists per session, created lazily when the first editor
//! widget attaches. It owns the sync in both directions:
//!
//! ```text
//! remote update ──► SharedDocument ──► TextModel ──► widgets (render)
//! widget typing ──► TextModel ──► SharedDocument ──► transport (broadcast)
//! ```
//!
//! Echoes are cut with an `applying_to_model` guard: while the binding is
//! pushing document text into the model, the model-change listener ignores
//! the resulting event. Widgets attach and detach with set semantics; an
//! empty widget set keeps the binding alive so background sync continues
//! while no widget is visible. Only `destroy()` (session close) tears the
//! binding down.
//!
//! The connection's awareness channel doubles as the local cursor
//! broadcast: every attached widget's cursor movements are written into the
//! local awareness state for peers to render.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::awareness::Awareness;
use crate::document::SharedDocument;
use crate::editor::{EditorWidget, ListenerHandle, TextModel};

/// Binding construction errors.
#[derive(Debug, Clone)]
pub enum BindingError {
    /// The text model was disposed before the binding could attach.
    ModelDisposed,
}

impl std::fmt::Display for BindingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelDisposed => write!(f, "Text model was disposed"),
        }
    }
}

impl std::error::Error for BindingError {}

/// The two-way document/model binding for one session.
pub struct EditorBinding {
    document: Arc<SharedDocument>,
    model: Arc<TextModel>,
    awareness: Arc<Awareness>,
    /// Attached widgets plus their cursor-listener handles.
    editors: Mutex<HashMap<Uuid, (Arc<dyn EditorWidget>, ListenerHandle)>>,
    applying_to_model: Arc<AtomicBool>,
    destroyed: AtomicBool,
    /// Document/model subscriptions, dropped on destroy.
    subscriptions: Mutex<Vec<ListenerHandle>>,
}

impl EditorBinding {
    /// Wire `document` and `model` together, registering `editors` as the
    /// initially attached widgets.
    pub fn new(
        document: Arc<SharedDocument>,
        model: Arc<TextModel>,
        editors: Vec<Arc<dyn EditorWidget>>,
        awareness: Arc<Awareness>,
    ) -> Result<Arc<Self>, BindingError> {
        if model.is_disposed() {
            return Err(BindingError::ModelDisposed);
        }

        let binding = Arc::new(Self {
            document: Arc::clone(&document),
            model: Arc::clone(&model),
            awareness,
            editors: Mutex::new(HashMap::new()),
            applying_to_model: Arc::new(AtomicBool::new(false)),
            destroyed: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });

        // Align the model with the document before any live traffic.
        binding.pull_document_into_model();

        let mut subscriptions = binding.subscriptions.lock().unwrap();

        // Document -> model: applied remote updates refresh the buffer.
        let weak = Arc::downgrade(&binding);
        subscriptions.push(document.on_remote_update(move |_| {
            if let Some(binding) = weak.upgrade() {
                binding.pull_document_into_model();
            }
        }));

        // Model -> document: widget edits become CRDT ops, unless the event
        // is our own document->model write.
        let weak = Arc::downgrade(&binding);
        subscriptions.push(model.on_change(move |new_value| {
            let Some(binding) = weak.upgrade() else {
                return;
            };
            if binding.applying_to_model.load(Ordering::SeqCst) {
                return;
            }
            binding.document.set_text(new_value);
        }));

        drop(subscriptions);

        for editor in editors {
            binding.add_editor(editor);
        }
        Ok(binding)
    }

    fn pull_document_into_model(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let text = self.document.text();
        self.applying_to_model.store(true, Ordering::SeqCst);
        self.model.set_value(&text);
        self.applying_to_model.store(false, Ordering::SeqCst);
    }

    pub fn document(&self) -> Arc<SharedDocument> {
        Arc::clone(&self.document)
    }

    pub fn model(&self) -> Arc<TextModel> {
        Arc::clone(&self.model)
    }

    /// Attach a widget. Idempotent per widget id.
    pub fn add_editor(&self, editor: Arc<dyn EditorWidget>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let id = editor.id();
        let mut editors = self.editors.lock().unwrap();
        if editors.contains_key(&id) {
            return;
        }

        // The widget's cursor feeds the local awareness state so peers can
        // render it.
        let awareness = Arc::clone(&self.awareness);
        let cursor_widget = Arc::clone(&editor);
        let cursor_handle = editor.on_cursor_change(Box::new(move || {
            awareness.set_cursor(Some(cursor_widget.view_state().cursor));
        }));

        editors.insert(id, (editor, cursor_handle));
    }

    /// Detach a widget. The binding stays alive even when the set empties.
    pub fn remove_editor(&self, editor_id: Uuid) {
        self.editors.lock().unwrap().remove(&editor_id);
    }

    pub fn has_editor(&self, editor_id: Uuid) -> bool {
        self.editors.lock().unwrap().contains_key(&editor_id)
    }

    pub fn editor_count(&self) -> usize {
        self.editors.lock().unwrap().len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Detach all widgets and stop syncing. Called from session close.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.editors.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::UserInfo;
    use crate::editor::HeadlessWidget;

    fn setup() -> (Arc<SharedDocument>, Arc<TextModel>, Arc<Awareness>) {
        let document = SharedDocument::new("f1").unwrap();
        document.set_text("initial");
        let model = TextModel::new("f1", "initial", "rust");
        let awareness = Arc::new(Awareness::new(document.client_id()));
        awareness.set_user(UserInfo {
            name: "Alice".into(),
            color: "ff8800".into(),
            email: "alice@example.com".into(),
        });
        (document, model, awareness)
    }

    #[test]
    fn test_model_edit_reaches_document() {
        let (document, model, awareness) = setup();
        let _binding =
            EditorBinding::new(Arc::clone(&document), Arc::clone(&model), vec![], awareness)
                .unwrap();

        model.set_value("initial plus typing");
        assert_eq!(document.text(), "initial plus typing");
    }

    #[test]
    fn test_remote_update_reaches_model() {
        let (document, model, awareness) = setup();
        let _binding =
            EditorBinding::new(Arc::clone(&document), Arc::clone(&model), vec![], awareness)
                .unwrap();

        let remote = SharedDocument::new("f1").unwrap();
        remote.apply_remote_update(&document.encode_full_state()).unwrap();
        remote.set_text("initial, remotely extended");

        let sv = document.state_vector();
        document.apply_remote_update(&remote.encode_state(&sv)).unwrap();

        assert_eq!(model.get_value(), "initial, remotely extended");
    }

    #[test]
    fn test_no_echo_loop() {
        let (document, model, awareness) = setup();
        let _binding =
            EditorBinding::new(Arc::clone(&document), Arc::clone(&model), vec![], awareness)
                .unwrap();

        let before = model.version();
        model.set_value("edited once");
        // Exactly one version bump: the binding must not re-apply the same
        // text back into the model.
        assert_eq!(model.version(), before + 1);
        assert_eq!(document.text(), "edited once");
    }

    #[test]
    fn test_construction_aligns_model_with_document() {
        let (document, _, awareness) = setup();
        document.set_text("document is ahead");
        let model = TextModel::new("f1", "stale", "rust");

        let _binding =
            EditorBinding::new(document, Arc::clone(&model), vec![], awareness).unwrap();
        assert_eq!(model.get_value(), "document is ahead");
    }

    #[test]
    fn test_disposed_model_rejected() {
        let (document, model, awareness) = setup();
        model.dispose();
        assert!(matches!(
            EditorBinding::new(document, model, vec![], awareness),
            Err(BindingError::ModelDisposed)
        ));
    }

    #[test]
    fn test_widget_set_semantics() {
        let (document, model, awareness) = setup();
        let binding = EditorBinding::new(document, model, vec![], awareness).unwrap();

        let first = HeadlessWidget::new();
        let second = HeadlessWidget::new();

        binding.add_editor(first.clone());
        binding.add_editor(second.clone());
        binding.add_editor(first.clone()); // idempotent
        assert_eq!(binding.editor_count(), 2);

        binding.remove_editor(first.id());
        assert_eq!(binding.editor_count(), 1);
        assert!(binding.has_editor(second.id()));
        assert!(!binding.is_destroyed());
    }

    #[test]
    fn test_empty_widget_set_keeps_syncing() {
        let (document, model, awareness) = setup();
        let binding =
            EditorBinding::new(Arc::clone(&document), Arc::clone(&model), vec![], awareness)
                .unwrap();

        let widget = HeadlessWidget::new();
        binding.add_editor(widget.clone());
        binding.remove_editor(widget.id());
        assert_eq!(binding.editor_count(), 0);

        // Background sync still runs with no widget attached.
        model.set_value("typed while hidden");
        assert_eq!(document.text(), "typed while hidden");
    }

    #[test]
    fn test_destroy_stops_sync() {
        let (document, model, awareness) = setup();
        let binding =
            EditorBinding::new(Arc::clone(&document), Arc::clone(&model), vec![], awareness)
                .unwrap();
        binding.destroy();

        model.set_value("after destroy");
        assert_eq!(document.text(), "initial");
        assert!(binding.is_destroyed());
    }

    #[test]
    fn test_cursor_movement_feeds_awareness() {
        let (document, model, awareness) = setup();
        let binding =
            EditorBinding::new(document, model, vec![], Arc::clone(&awareness)).unwrap();

        let widget = HeadlessWidget::new();
        binding.add_editor(widget.clone());

        widget.move_cursor(7, 3);
        let cursor = awareness.local_state().unwrap().cursor.unwrap();
        assert_eq!(cursor.line, 7);
        assert_eq!(cursor.column, 3);
    }
}
