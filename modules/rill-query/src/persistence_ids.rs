//! Identifier listing queries. Simpler than the paged sources: one set
//! snapshot, and for the live variant a channel of newly registered
//! identifiers, de-duplicated against everything already emitted.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::Stream;

use rill_events::{keys, JournalStore, Subscription};

use crate::error::QueryError;

enum State {
    Subscribing {
        fut: BoxFuture<'static, rill_events::Result<Subscription>>,
    },
    Loading {
        fut: BoxFuture<'static, rill_events::Result<Vec<String>>>,
    },
    Draining,
    Following,
    Done,
}

pub(crate) struct IdSource<S: JournalStore> {
    store: S,
    live: bool,
    buffer: VecDeque<String>,
    seen: HashSet<String>,
    subscription: Option<Subscription>,
    state: State,
}

impl<S: JournalStore> IdSource<S> {
    pub(crate) fn new(store: S, live: bool) -> Self {
        let state = if live {
            let subscribing = store.clone();
            State::Subscribing {
                fut: Box::pin(async move { subscribing.subscribe(keys::ids_channel()).await }),
            }
        } else {
            Self::load(&store)
        };
        Self {
            store,
            live,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            subscription: None,
            state,
        }
    }

    fn load(store: &S) -> State {
        let store = store.clone();
        State::Loading {
            fut: Box::pin(async move { store.persistence_ids().await }),
        }
    }
}

impl<S: JournalStore> Stream for IdSource<S> {
    type Item = Result<String, QueryError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, State::Done) {
                State::Done => return Poll::Ready(None),

                State::Subscribing { mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Subscribing { fut };
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(subscription)) => {
                        this.subscription = Some(subscription);
                        this.state = Self::load(&this.store);
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                },

                State::Loading { mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Loading { fut };
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(mut ids)) => {
                        ids.sort();
                        for id in ids {
                            if this.seen.insert(id.clone()) {
                                this.buffer.push_back(id);
                            }
                        }
                        this.state = State::Draining;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                },

                State::Draining => {
                    if let Some(id) = this.buffer.pop_front() {
                        this.state = State::Draining;
                        return Poll::Ready(Some(Ok(id)));
                    }
                    if !this.live {
                        return Poll::Ready(None);
                    }
                    this.state = State::Following;
                }

                State::Following => {
                    let Some(sub) = this.subscription.as_mut() else {
                        // Subscription lost: no further identifiers will
                        // ever arrive, but a live stream does not fail.
                        this.state = State::Following;
                        return Poll::Pending;
                    };
                    match sub.poll_message(cx) {
                        Poll::Pending => {
                            this.state = State::Following;
                            return Poll::Pending;
                        }
                        Poll::Ready(None) => {
                            tracing::debug!("Identifier channel closed; query parked");
                            this.subscription = None;
                            this.state = State::Following;
                            return Poll::Pending;
                        }
                        Poll::Ready(Some(id)) => {
                            this.state = State::Following;
                            if this.seen.insert(id.clone()) {
                                return Poll::Ready(Some(Ok(id)));
                            }
                            // Duplicate registration notice; keep waiting.
                        }
                    }
                }
            }
        }
    }
}
