//! The per-query source state machine.
//!
//! Each query is one [`EventSource`]: a hand-implemented [`Stream`] whose
//! `poll_next` is the single serialized handler for the three things that
//! can happen to a query — downstream demand, completion of the one
//! in-flight page read, and change notifications. All cursor, buffer, and
//! state mutations happen inside it; the async store callbacks and pub/sub
//! messages are marshalled here through owned futures and the
//! subscription's channel, so no locking is needed.
//!
//! A source suspends in exactly three places: waiting for demand (between
//! polls), waiting for the in-flight page, and waiting for a notification
//! (live queries that exhausted the store).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::Stream;

use rill_events::{parse_notification, Subscription};

use crate::error::QueryError;
use crate::journal::EventEnvelope;

/// One fetched entry before filtering. `index` is the position the query
/// orders by: the sequence nr for by-id pages, the tag-local index for
/// by-tag pages.
pub(crate) struct Candidate {
    pub index: u64,
    pub sequence_nr: u64,
    pub persistence_id: String,
    pub payload: serde_json::Value,
    pub deleted: bool,
}

/// One page of candidates. `last_index` is the index of the last entry
/// the store examined — including entries the fetcher already dropped —
/// so the cursor can resume strictly past it. `None` means an empty page.
pub(crate) struct Page {
    pub entries: Vec<Candidate>,
    pub last_index: Option<u64>,
}

/// The seam between the shared state machine and the two query families.
/// A fetcher knows how to read one page and where its notifications come
/// from; the futures it returns own their data (the store is cloned in).
pub(crate) trait Fetcher: Send + Unpin + 'static {
    /// Entries with index in `[lo, hi]`, ascending.
    fn fetch(&self, lo: u64, hi: u64) -> BoxFuture<'static, rill_events::Result<Page>>;

    /// Name of the pub/sub channel carrying this query's notifications.
    fn channel(&self) -> String;

    /// Open the notification subscription.
    fn subscribe(&self) -> BoxFuture<'static, rill_events::Result<Subscription>>;
}

enum State {
    /// Live only: the subscription is opening. Entered before the first
    /// read so no notification can slip past it.
    Subscribing {
        fut: BoxFuture<'static, rill_events::Result<Subscription>>,
    },
    /// No read in flight. Buffered envelopes may remain to deliver.
    Idle,
    /// One page read in flight. `notified` records that a change
    /// notification arrived meanwhile: the in-flight result may already
    /// be stale, so an empty result must trigger one more read.
    Querying {
        fut: BoxFuture<'static, rill_events::Result<Page>>,
        notified: bool,
    },
    /// Live only: the store is exhausted; parked until a notification.
    WaitingForNotification,
    Done,
}

pub(crate) struct EventSource<F: Fetcher> {
    fetcher: F,
    live: bool,
    /// Next index to fetch. Never rewound.
    current: u64,
    /// Inclusive upper bound of the query.
    to: u64,
    /// Page size; also the soft bound of `buffer`.
    max: usize,
    channel: String,
    buffer: VecDeque<EventEnvelope>,
    subscription: Option<Subscription>,
    state: State,
}

impl<F: Fetcher> EventSource<F> {
    pub(crate) fn new(fetcher: F, from: u64, to: u64, live: bool, max: usize) -> Self {
        let state = if live {
            State::Subscribing {
                fut: fetcher.subscribe(),
            }
        } else {
            State::Idle
        };
        let channel = fetcher.channel();
        Self {
            fetcher,
            live,
            current: from,
            to,
            max,
            channel,
            buffer: VecDeque::new(),
            subscription: None,
            state,
        }
    }

    fn page_hi(&self) -> u64 {
        self.current
            .saturating_add(self.max as u64 - 1)
            .min(self.to)
    }

    fn start_query(&self) -> State {
        let hi = self.page_hi();
        tracing::trace!(channel = %self.channel, lo = self.current, hi, "Issuing page read");
        State::Querying {
            fut: self.fetcher.fetch(self.current, hi),
            notified: false,
        }
    }

    /// Advance the cursor past the page and move the survivors of the
    /// filtering policy into the buffer.
    fn apply_page(&mut self, page: Page) -> Result<(), QueryError> {
        let Some(last_index) = page.last_index else {
            return Ok(());
        };
        let mut previous: Option<u64> = None;
        for candidate in page.entries {
            if previous.is_some_and(|p| candidate.index <= p) {
                // A disordered page would break the strict offset
                // ordering downstream relies on.
                return Err(QueryError::Protocol(format!(
                    "page not in ascending index order at {}",
                    candidate.index
                )));
            }
            previous = Some(candidate.index);
            // Deleted records and out-of-range indices are dropped but
            // still advance the cursor past them.
            if candidate.deleted || candidate.index < self.current || candidate.index > self.to {
                continue;
            }
            self.buffer.push_back(EventEnvelope {
                offset: candidate.index,
                persistence_id: candidate.persistence_id,
                sequence_nr: candidate.sequence_nr,
                payload: candidate.payload,
            });
        }
        // Resume strictly after the last examined index; never rewind.
        self.current = self.current.max(last_index.saturating_add(1));
        Ok(())
    }

    /// Consume every queued notification without blocking. Returns whether
    /// any of them parsed as a valid sequence nr / index.
    fn drain_notifications(&mut self, cx: &mut Context<'_>) -> bool {
        let mut notified = false;
        loop {
            let Some(sub) = self.subscription.as_mut() else {
                return notified;
            };
            match sub.poll_message(cx) {
                Poll::Pending => return notified,
                Poll::Ready(None) => {
                    self.subscription = None;
                    return notified;
                }
                Poll::Ready(Some(payload)) => {
                    if parse_notification(&self.channel, &payload).is_some() {
                        notified = true;
                    }
                }
            }
        }
    }

    /// Await one valid notification. `Ready(false)` means the subscription
    /// is gone and no wake-up will ever come.
    fn poll_valid_notification(&mut self, cx: &mut Context<'_>) -> Poll<bool> {
        loop {
            let Some(sub) = self.subscription.as_mut() else {
                return Poll::Ready(false);
            };
            match sub.poll_message(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    self.subscription = None;
                    return Poll::Ready(false);
                }
                Poll::Ready(Some(payload)) => {
                    if parse_notification(&self.channel, &payload).is_some() {
                        return Poll::Ready(true);
                    }
                }
            }
        }
    }
}

impl<F: Fetcher> Stream for EventSource<F> {
    type Item = Result<EventEnvelope, QueryError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            // Take the state; every arm either restores it or moves on.
            // A fatal error leaves `Done` behind.
            match std::mem::replace(&mut this.state, State::Done) {
                State::Done => return Poll::Ready(None),

                State::Subscribing { mut fut } => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Subscribing { fut };
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(subscription)) => {
                        this.subscription = Some(subscription);
                        this.state = State::Idle;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                },

                State::Idle => {
                    if let Some(envelope) = this.buffer.pop_front() {
                        if !this.live && this.buffer.is_empty() && this.current > this.to {
                            // Nothing past `to` can ever match; no need
                            // for a final empty read.
                            this.state = State::Done;
                        } else {
                            this.state = State::Idle;
                        }
                        return Poll::Ready(Some(Ok(envelope)));
                    }
                    if this.current > this.to {
                        if !this.live {
                            return Poll::Ready(None);
                        }
                        // A live query past its bound can never emit
                        // again, but it does not complete on data.
                        this.state = State::WaitingForNotification;
                        continue;
                    }
                    this.state = this.start_query();
                }

                State::Querying { mut fut, notified } => {
                    let notified = notified | this.drain_notifications(cx);
                    match fut.as_mut().poll(cx) {
                        Poll::Pending => {
                            this.state = State::Querying { fut, notified };
                            return Poll::Pending;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                        Poll::Ready(Ok(page)) => {
                            let empty = page.last_index.is_none();
                            if let Err(e) = this.apply_page(page) {
                                return Poll::Ready(Some(Err(e)));
                            }
                            if !empty {
                                // Deliver from the buffer, or requery at
                                // once if everything was filtered out.
                                this.state = State::Idle;
                            } else if notified {
                                // The notification promised more than the
                                // finished read saw.
                                this.state = this.start_query();
                            } else if this.live {
                                this.state = State::WaitingForNotification;
                            } else {
                                return Poll::Ready(None);
                            }
                        }
                    }
                }

                State::WaitingForNotification => match this.poll_valid_notification(cx) {
                    Poll::Ready(true) => {
                        tracing::trace!(channel = %this.channel, "Notification; resuming");
                        this.state = State::Idle;
                    }
                    Poll::Ready(false) => {
                        // Subscription lost: liveness is gone but the
                        // stream does not fail. Parked for good.
                        tracing::debug!(channel = %this.channel, "Notification channel closed; query parked");
                        this.state = State::WaitingForNotification;
                        return Poll::Pending;
                    }
                    Poll::Pending => {
                        this.state = State::WaitingForNotification;
                        return Poll::Pending;
                    }
                },
            }
        }
    }
}
