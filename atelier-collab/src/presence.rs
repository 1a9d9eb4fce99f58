//! Remote-cursor presence rendering.
//!
//! Turns the awareness channel into a CSS style block for the editor's
//! remote-cursor decorations: one rule set per remote peer, colored with
//! the peer's declared color and labeled with their name (name + email on
//! hover). The renderer re-runs on every awareness change and once at
//! start, replacing its previous style block each time — no accumulation.
//!
//! Filtering rules, in order:
//! 1. the local user is skipped (matched by email),
//! 2. peers whose `active_file` differs from this renderer's file are
//!    skipped (no cross-file cursor noise),
//! 3. peers with a missing name or a color that is not six hex digits are
//!    skipped (client version skew sends arbitrary shapes).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::awareness::{Awareness, PeerState};
use crate::editor::ListenerHandle;

/// Where synthesized style blocks go — the document head in a real host.
pub trait StyleSink: Send + Sync {
    /// Replace (or insert) the block named `id`.
    fn replace(&self, id: &str, css: &str);
    /// Remove the block named `id`, if present.
    fn remove(&self, id: &str);
}

/// In-memory [`StyleSink`] for tests and headless embedders.
#[derive(Default)]
pub struct MemoryStyleSink {
    blocks: Mutex<HashMap<String, String>>,
}

impl MemoryStyleSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, id: &str) -> Option<String> {
        self.blocks.lock().unwrap().get(id).cloned()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}

impl StyleSink for MemoryStyleSink {
    fn replace(&self, id: &str, css: &str) {
        self.blocks
            .lock()
            .unwrap()
            .insert(id.to_string(), css.to_string());
    }

    fn remove(&self, id: &str) {
        self.blocks.lock().unwrap().remove(id);
    }
}

/// Renders remote-peer cursor styles for one file's editor.
pub struct PresenceRenderer {
    awareness: Arc<Awareness>,
    sink: Arc<dyn StyleSink>,
    style_id: String,
    active_file: String,
    local_email: String,
    _subscription: Mutex<Option<ListenerHandle>>,
}

impl PresenceRenderer {
    /// Start rendering presence for `active_file`, excluding `local_email`.
    ///
    /// Renders once immediately, then on every awareness change until the
    /// renderer is dropped.
    pub fn new(
        awareness: Arc<Awareness>,
        active_file: &str,
        local_email: &str,
        sink: Arc<dyn StyleSink>,
    ) -> Arc<Self> {
        let renderer = Arc::new(Self {
            awareness: Arc::clone(&awareness),
            sink,
            style_id: format!("presence-{active_file}"),
            active_file: active_file.to_string(),
            local_email: local_email.to_string(),
            _subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&renderer);
        let handle = awareness.on_change(move |_| {
            if let Some(renderer) = weak.upgrade() {
                renderer.render();
            }
        });
        *renderer._subscription.lock().unwrap() = Some(handle);

        renderer.render();
        renderer
    }

    /// Recompute and publish the style block.
    pub fn render(&self) {
        // Remove-then-replace keeps re-renders idempotent even if the sink
        // treats replace as insert.
        self.sink.remove(&self.style_id);
        let css = build_stylesheet(
            &self.awareness.states(),
            &self.local_email,
            &self.active_file,
        );
        if !css.is_empty() {
            self.sink.replace(&self.style_id, &css);
        }
    }

    pub fn style_id(&self) -> &str {
        &self.style_id
    }
}

impl Drop for PresenceRenderer {
    fn drop(&mut self) {
        self.sink.remove(&self.style_id);
    }
}

/// Build the combined style block for all renderable peers.
///
/// Pure function so the filtering rules are testable in isolation. Output
/// is ordered by client id for determinism.
pub fn build_stylesheet(
    states: &HashMap<u64, PeerState>,
    local_email: &str,
    active_file: &str,
) -> String {
    let mut client_ids: Vec<&u64> = states.keys().collect();
    client_ids.sort();

    let mut css = String::new();
    for client_id in client_ids {
        let state = &states[client_id];
        if state.user.email == local_email {
            continue;
        }
        if state.active_file.as_deref() != Some(active_file) {
            continue;
        }
        if state.validate().is_err() {
            continue;
        }
        css.push_str(&peer_rules(*client_id, state));
    }
    css
}

fn peer_rules(client_id: u64, state: &PeerState) -> String {
    let color = &state.user.color;
    let name = css_escape(&state.user.name);
    let email = css_escape(&state.user.email);
    let mut rules = String::new();
    rules.push_str(&format!(
        ".remote-selection-{client_id} {{ background-color: #{color}44; }}\n"
    ));
    rules.push_str(&format!(
        ".remote-cursor-{client_id} {{ border-left: 2px solid #{color}; }}\n"
    ));
    rules.push_str(&format!(
        ".remote-cursor-{client_id}::after {{ content: \"{name}\"; background-color: #{color}; }}\n"
    ));
    rules.push_str(&format!(
        ".remote-cursor-{client_id}:hover::after {{ content: \"{name} ({email})\"; }}\n"
    ));
    rules
}

fn css_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
