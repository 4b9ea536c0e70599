// Editor binding adapter: the boundary between the widget and the engine.
//
// A thin translation layer with one hard rule: a programmatic mutation
// must never re-enter the engine as a local edit. Remote deltas are
// applied inside an "applying remote" scope that the widget's change
// path consults through `filter_local_edit`.

use cowrite_common::types::{CursorLocator, PeerId, PeerIdentity, PresenceState};

use crate::engine::replica::{EditEvent, MutationDelta};

/// The consumed widget contract, implemented by the embedding
/// application. The engine never reaches past this into rendering.
pub trait EditorWidget {
    /// Apply one buffer change in visible-character coordinates.
    fn apply_mutation(&mut self, doc: &str, delta: &MutationDelta);
    /// Draw or move a collaborator's cursor decoration.
    fn render_cursor(&mut self, peer: &PeerId, locator: &CursorLocator, identity: &PeerIdentity);
    /// Remove a collaborator's cursor decoration.
    fn clear_cursor(&mut self, peer: &PeerId);
}

/// Binds one widget to a room session's deltas and presence stream.
pub struct EditorBinding<W: EditorWidget> {
    widget: W,
    applying_remote: bool,
}

impl<W: EditorWidget> EditorBinding<W> {
    pub fn new(widget: W) -> Self {
        Self { widget, applying_remote: false }
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    /// Gate for the widget's change events: returns the edit to hand to
    /// the session, or `None` when the change is one of our own remote
    /// mutations echoing back through the widget's change detection.
    pub fn filter_local_edit(&self, edit: EditEvent) -> Option<EditEvent> {
        if self.applying_remote {
            return None;
        }
        Some(edit)
    }

    /// Whether a remote mutation is being applied right now. Widget glue
    /// that cannot call `filter_local_edit` synchronously can poll this.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote
    }

    /// Apply merged remote deltas to the widget. The deltas come out of
    /// the merge in final coordinates, so an in-flight local edit is
    /// never clobbered by offsets captured before the remote change.
    pub fn apply_remote(&mut self, doc: &str, deltas: &[MutationDelta]) {
        self.applying_remote = true;
        for delta in deltas {
            self.widget.apply_mutation(doc, delta);
        }
        self.applying_remote = false;
    }

    /// Reflect a presence change as a cursor decoration. A peer without
    /// a cursor locator (or without presence at all) is cleared.
    pub fn apply_presence(&mut self, peer: &PeerId, state: Option<&PresenceState>) {
        match state.and_then(|s| s.cursor.as_ref().map(|cursor| (cursor, &s.identity))) {
            Some((locator, identity)) => self.widget.render_cursor(peer, locator, identity),
            None => self.widget.clear_cursor(peer),
        }
    }
}
