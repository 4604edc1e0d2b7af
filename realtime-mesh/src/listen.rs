//! Receiving notifications of published snapshots and removed sections.
//!
//! This is [`nosy`], in its thread-safe configuration. [`MeshEvent`]s are delivered
//! synchronously on the committing producer's thread while the section is locked, so a
//! listener should only enqueue the message or set a flag. In particular, a listener must not
//! wait for another commit to the same section. The typical pattern is for a listener to hold
//! a channel sender or a `Weak` reference to a queue, which is drained by a separate part of
//! the program (such as the render loop).

pub use nosy::sync::DynListener;
pub use nosy::{IntoListener, Listen, Listener};
pub(crate) use nosy::sync::Notifier;

use crate::MeshEvent;

/// Sending half of a `flume` channel is a listener that is alive as long as the receiver is.
impl Listener<MeshEvent> for flume::Sender<MeshEvent> {
    fn receive(&self, messages: &[MeshEvent]) -> bool {
        messages
            .iter()
            .all(|message| self.send(message.clone()).is_ok())
    }
}
