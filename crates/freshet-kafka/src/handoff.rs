//! Rendezvous hand-off channel for record batches.
//!
//! A capacity-0 channel: a non-blocking send succeeds only when the
//! receiver is already parked waiting, and an awaited send completes only
//! once the receiver has taken the value. Buffering here would let the
//! event loop run ahead of downstream, so no slot survives a hand-off.
//!
//! The channel can be closed from either side, optionally with an error
//! that is surfaced to the receiver before end-of-stream. The first close
//! wins; later closes report `false` so the caller can route the dropped
//! error elsewhere.

use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::ReceiverError;

/// Creates a connected rendezvous sender/receiver pair.
pub(crate) fn handoff<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            slot: None,
            receiver_waiting: false,
            recv_waker: None,
            send_waker: None,
            closed: false,
            error: None,
        }),
    });
    (
        HandoffSender {
            shared: Arc::clone(&shared),
        },
        HandoffReceiver { shared },
    )
}

/// Error returned by [`HandoffSender::try_send`].
#[derive(Debug)]
pub(crate) enum TrySendError<T> {
    /// No receiver is currently waiting; the value is handed back.
    Full(T),
    /// The channel is closed; the value is handed back.
    Closed(T),
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    slot: Option<T>,
    receiver_waiting: bool,
    recv_waker: Option<Waker>,
    send_waker: Option<Waker>,
    closed: bool,
    error: Option<ReceiverError>,
}

impl<T> State<T> {
    fn register_recv(&mut self, cx: &Context<'_>) {
        match &self.recv_waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => self.recv_waker = Some(cx.waker().clone()),
        }
    }

    fn register_send(&mut self, cx: &Context<'_>) {
        match &self.send_waker {
            Some(w) if w.will_wake(cx.waker()) => {}
            _ => self.send_waker = Some(cx.waker().clone()),
        }
    }
}

impl<T> Shared<T> {
    /// Marks the channel closed. Returns `false` if it already was.
    fn close(&self, error: Option<ReceiverError>) -> bool {
        let (recv_waker, send_waker);
        {
            let mut st = self.state.lock();
            if st.closed {
                return false;
            }
            st.closed = true;
            st.error = error;
            recv_waker = st.recv_waker.take();
            send_waker = st.send_waker.take();
        }
        if let Some(w) = recv_waker {
            w.wake();
        }
        if let Some(w) = send_waker {
            w.wake();
        }
        true
    }
}

/// Sending half of the rendezvous channel.
pub(crate) struct HandoffSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Hands `value` to a receiver that is already waiting.
    ///
    /// Fails with [`TrySendError::Full`] when no receiver is parked (the
    /// rendezvous would have to block) and [`TrySendError::Closed`] after
    /// the channel closed.
    pub(crate) fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let waker;
        {
            let mut st = self.shared.state.lock();
            if st.closed {
                return Err(TrySendError::Closed(value));
            }
            if st.slot.is_some() || !st.receiver_waiting {
                return Err(TrySendError::Full(value));
            }
            st.slot = Some(value);
            st.receiver_waiting = false;
            waker = st.recv_waker.take();
        }
        if let Some(w) = waker {
            w.wake();
        }
        Ok(())
    }

    /// Hands `value` to the receiver, waiting until it is taken.
    ///
    /// # Errors
    ///
    /// Returns `Err(())` if the channel closes before the hand-off
    /// completes.
    pub(crate) fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            shared: &self.shared,
            value: Some(value),
            deposited: false,
        }
    }

    /// Returns `true` once the channel has been closed from either side.
    pub(crate) fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Closes the channel, surfacing `error` to the receiver if given.
    ///
    /// Returns `false` if the channel was already closed (first close
    /// wins and `error` is dropped).
    pub(crate) fn close(&self, error: Option<ReceiverError>) -> bool {
        self.shared.close(error)
    }
}

/// Future returned by [`HandoffSender::send`].
pub(crate) struct SendFuture<'a, T> {
    shared: &'a Shared<T>,
    value: Option<T>,
    deposited: bool,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T> std::future::Future for SendFuture<'_, T> {
    type Output = Result<(), ()>;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let waker;
        {
            let mut st = this.shared.state.lock();
            if st.closed {
                if this.deposited {
                    // Undelivered deposit dies with the channel.
                    st.slot = None;
                }
                return Poll::Ready(Err(()));
            }
            if let Some(value) = this.value.take() {
                if st.slot.is_none() {
                    st.slot = Some(value);
                    this.deposited = true;
                    st.receiver_waiting = false;
                    waker = st.recv_waker.take();
                } else {
                    this.value = Some(value);
                    st.register_send(cx);
                    return Poll::Pending;
                }
            } else if this.deposited {
                if st.slot.is_none() {
                    return Poll::Ready(Ok(()));
                }
                st.register_send(cx);
                return Poll::Pending;
            } else {
                // Completed future polled again.
                return Poll::Ready(Ok(()));
            }
        }
        if let Some(w) = waker {
            w.wake();
        }
        // Deposited just now; wait until the receiver takes it.
        let mut st = this.shared.state.lock();
        if this.deposited && st.slot.is_none() {
            return Poll::Ready(Ok(()));
        }
        st.register_send(cx);
        Poll::Pending
    }
}

/// Receiving half of the rendezvous channel.
pub(crate) struct HandoffReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> HandoffReceiver<T> {
    /// Polls for the next hand-off.
    ///
    /// Yields `Some(Ok(value))` per successful hand-off, `Some(Err(e))`
    /// once for an error close, then `None`.
    pub(crate) fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<T, ReceiverError>>> {
        let (value, waker) = {
            let mut st = self.shared.state.lock();
            match st.slot.take() {
                Some(value) => {
                    st.receiver_waiting = false;
                    (value, st.send_waker.take())
                }
                None => {
                    if st.closed {
                        if let Some(e) = st.error.take() {
                            return Poll::Ready(Some(Err(e)));
                        }
                        return Poll::Ready(None);
                    }
                    st.receiver_waiting = true;
                    st.register_recv(cx);
                    return Poll::Pending;
                }
            }
        };
        if let Some(w) = waker {
            w.wake();
        }
        Poll::Ready(Some(Ok(value)))
    }

    /// Awaits the next hand-off.
    pub(crate) async fn recv(&mut self) -> Option<Result<T, ReceiverError>> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Closes the channel from the receiving side.
    pub(crate) fn close(&self) {
        self.shared.close(None);
    }
}

impl<T> Drop for HandoffReceiver<T> {
    fn drop(&mut self) {
        self.shared.close(None);
    }
}
