//! Typed channels between a session task and the handles that feed it.
//!
//! A session owns its state and drains an [`Inbox`]. Everything else talks to
//! it through cloneable [`Mailbox`] handles; questions that need an answer go
//! through [`QueryHandle::ask`] and carry a [`Reply`].

use derive_more::From;
use tokio::sync::{mpsc, oneshot};

/// Receiving end of a session's mailbox.
#[derive(Debug, From)]
pub struct Inbox<M>(mpsc::UnboundedReceiver<M>);

impl<M> Inbox<M> {
    /// `None` once every [`Mailbox`] is dropped and the backlog is drained.
    pub async fn recv(&mut self) -> Option<M> {
        self.0.recv().await
    }
}

#[derive(Debug, From)]
pub struct Mailbox<M>(mpsc::UnboundedSender<M>);

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> Mailbox<M> {
    /// Fails once the owning session has exited.
    pub fn post(&self, message: M) -> crate::Result<()> {
        self.0
            .send(message)
            .map_err(|_| crate::err!("session inbox closed"))
    }
}

pub fn mailbox<M>() -> (Mailbox<M>, Inbox<M>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Mailbox(sender), Inbox(receiver))
}

#[derive(Debug)]
pub struct Reply<T>(oneshot::Sender<T>);

impl<T> Reply<T> {
    /// Returns whether the asker was still waiting.
    pub fn answer(self, value: T) -> bool {
        self.0.send(value).is_ok()
    }
}

pub type QueryHandle<Q, A> = Mailbox<(Q, Reply<A>)>;

pub type QueryInbox<Q, A> = Inbox<(Q, Reply<A>)>;

impl<Q, A> QueryHandle<Q, A> {
    pub async fn ask(&self, query: Q) -> crate::Result<A> {
        let (reply, answer) = oneshot::channel();
        self.post((query, Reply(reply)))?;
        answer
            .await
            .map_err(|_| crate::err!("session dropped the query unanswered"))
    }
}
