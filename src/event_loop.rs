//! The event processing thread.
//!
//! Every daemon-originated [`Notification`] and every scheduled timeout runs on the one thread
//! driving an [`EventLoop`]. Notifications are delivered in the order they were posted, so changes
//! coming from a single remote object are observed in the order the object emitted them.

use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use futures_util::future::{BoxFuture, FutureExt};

use crate::transport::Notification;

/// Consumes notifications on the event loop thread.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, notification: Notification) -> BoxFuture<'_, ()>;
}

/// Identifies a timeout scheduled with [`LoopHandle::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

enum Message {
    Notification(Notification),
    Attach(Arc<dyn Dispatch>),
    Schedule {
        id: TimerId,
        deadline: Instant,
        callback: BoxFuture<'static, ()>,
    },
    Cancel(TimerId),
    Sync(Sender<()>),
    Quit,
}

/// A cloneable handle used to talk to a running [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Message>,
    next_timer: Arc<AtomicU64>,
}

impl LoopHandle {
    /// Queues a notification for delivery. Returns `false` if the loop has exited.
    pub fn post(&self, notification: Notification) -> bool {
        self.tx.send(Message::Notification(notification)).is_ok()
    }

    /// Adds a consumer of notifications.
    ///
    /// Notifications posted before the first consumer is attached are held back and delivered to
    /// it.
    pub fn attach(&self, dispatcher: Arc<dyn Dispatch>) {
        let _ = self.tx.send(Message::Attach(dispatcher));
    }

    /// Runs `callback` on the loop thread once `delay` has passed.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = TimerId(self.next_timer.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(Message::Schedule {
            id,
            deadline: Instant::now() + delay,
            callback: callback.boxed(),
        });
        id
    }

    /// Cancels a pending timeout. Does nothing if it already ran.
    pub fn cancel(&self, id: TimerId) {
        let _ = self.tx.send(Message::Cancel(id));
    }

    /// Blocks until everything posted before this call has been processed.
    ///
    /// Must not be called from the loop thread itself.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        if self.tx.send(Message::Sync(tx)).is_ok() {
            let _ = rx.recv();
        }
    }

    /// Asks the loop to exit after processing what is already queued.
    pub fn quit(&self) {
        let _ = self.tx.send(Message::Quit);
    }
}

struct Timer {
    id: TimerId,
    deadline: Instant,
    callback: BoxFuture<'static, ()>,
}

/// A cooperative loop delivering notifications and timeouts on a single thread.
pub struct EventLoop {
    rx: Receiver<Message>,
    dispatchers: Vec<Arc<dyn Dispatch>>,
    held_back: VecDeque<Notification>,
    timers: Vec<Timer>,
}

impl EventLoop {
    pub fn new() -> (Self, LoopHandle) {
        let (tx, rx) = mpsc::channel();
        let event_loop = Self {
            rx,
            dispatchers: Vec::new(),
            held_back: VecDeque::new(),
            timers: Vec::new(),
        };
        let handle = LoopHandle {
            tx,
            next_timer: Arc::new(AtomicU64::new(0)),
        };
        (event_loop, handle)
    }

    /// Starts a new loop on a dedicated background thread.
    pub fn spawn() -> io::Result<(LoopHandle, JoinHandle<()>)> {
        let (event_loop, handle) = Self::new();
        let thread = thread::Builder::new()
            .name("tuhi-events".into())
            .spawn(move || event_loop.run())?;
        Ok((handle, thread))
    }

    /// Runs until [`LoopHandle::quit`] is called or every handle is dropped.
    pub fn run(mut self) {
        log::debug!("event loop running");
        loop {
            self.fire_due_timers();

            let message = match self.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match self.rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            match message {
                Message::Notification(notification) => self.deliver(notification),
                Message::Attach(dispatcher) => {
                    self.dispatchers.push(dispatcher);
                    while let Some(notification) = self.held_back.pop_front() {
                        self.deliver(notification);
                    }
                }
                Message::Schedule {
                    id,
                    deadline,
                    callback,
                } => self.timers.push(Timer {
                    id,
                    deadline,
                    callback,
                }),
                Message::Cancel(id) => self.timers.retain(|timer| timer.id != id),
                Message::Sync(reply) => {
                    let _ = reply.send(());
                }
                Message::Quit => break,
            }
        }
        log::debug!("event loop exited");
    }

    fn deliver(&mut self, notification: Notification) {
        match self.dispatchers.as_slice() {
            [] => {
                log::trace!("holding back event from {}", notification.target);
                self.held_back.push_back(notification);
            }
            [dispatcher] => pollster::block_on(dispatcher.dispatch(notification)),
            dispatchers => {
                for dispatcher in dispatchers {
                    pollster::block_on(dispatcher.dispatch(notification.clone()));
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|timer| timer.deadline).min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = self
            .timers
            .drain(..)
            .partition(|timer| timer.deadline <= now);
        self.timers = pending;

        let mut due = due;
        due.sort_by_key(|timer| timer.deadline);
        for timer in due {
            log::trace!("timeout {:?} fired", timer.id);
            pollster::block_on(timer.callback);
        }
    }
}
