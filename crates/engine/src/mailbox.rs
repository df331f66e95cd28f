//! Actor mailbox plumbing.
//!
//! Every execution actor owns an unbounded mpsc receiver and processes one
//! message to completion per loop iteration; that loop iteration is the
//! actor's *tick*. Unbounded sends keep self-addressed messages (timers,
//! loop-in tool results) deadlock-free.

use tokio::sync::mpsc;

/// The sending half of an actor's mailbox.
pub struct Addr<M> {
    tx: mpsc::UnboundedSender<M>,
}

impl<M> Clone for Addr<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> Addr<M> {
    /// Enqueue a message. Returns false when the actor is gone.
    pub fn send(&self, msg: M) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create an actor mailbox pair.
pub fn mailbox<M>() -> (Addr<M>, mpsc::UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Addr { tx }, rx)
}
