// Notification layer for the containers.
//
// A ContainerSubject owns the subscriber plus the two edge latches behind
// notify_once. A NotifyingContainer wraps any MpmcContainer, tracks the
// element count, and reports every insert and remove plus the two
// edge-triggered threshold events.

use crate::MpmcContainer;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Events a container reports to its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEvent {
    /// A value was inserted.
    Insert,
    /// A value was removed.
    Remove,
    /// The element count dropped to the partly-empty threshold.
    PartlyEmpty,
    /// The element count rose to the almost-full threshold.
    AlmostFull,
}

/// Subscriber side of the notification layer.
pub trait ContainerObserver: Send + Sync {
    fn on_event(&self, event: ContainerEvent);
}

impl<O: ContainerObserver + ?Sized> ContainerObserver for Arc<O> {
    fn on_event(&self, event: ContainerEvent) {
        (**self).on_event(event)
    }
}

/// Delivers events to one observer. Threshold events are edge-triggered: a
/// repeated delivery is suppressed until the complementary threshold has
/// fired in between.
pub struct ContainerSubject<O> {
    observer: O,
    partly_empty_seen: AtomicBool,
    almost_full_seen: AtomicBool,
}

impl<O: ContainerObserver> ContainerSubject<O> {
    pub fn new(observer: O) -> Self {
        Self {
            observer,
            partly_empty_seen: AtomicBool::new(false),
            almost_full_seen: AtomicBool::new(false),
        }
    }

    /// Deliver `event` unconditionally.
    pub fn notify(&self, event: ContainerEvent) {
        self.observer.on_event(event);
    }

    /// Deliver a threshold event once per edge; re-arms on the complementary
    /// transition. Non-threshold events pass straight through.
    pub fn notify_once(&self, event: ContainerEvent) {
        let (own, complementary) = match event {
            ContainerEvent::PartlyEmpty => (&self.partly_empty_seen, &self.almost_full_seen),
            ContainerEvent::AlmostFull => (&self.almost_full_seen, &self.partly_empty_seen),
            _ => {
                self.notify(event);
                return;
            }
        };
        complementary.store(false, Ordering::Release);
        if !own.swap(true, Ordering::AcqRel) {
            self.notify(event);
        }
    }
}

pub const DEFAULT_PARTLY_EMPTY_FACTOR: f64 = 0.8;
pub const DEFAULT_ALMOST_FULL_FACTOR: f64 = 0.9;

/// Wraps a container with an element count and a notification subject.
pub struct NotifyingContainer<T, C, O> {
    inner: C,
    subject: ContainerSubject<O>,
    count: AtomicUsize,
    partly_empty_at: usize,
    almost_full_at: usize,
    _payload: PhantomData<fn(T) -> T>,
}

impl<T, C, O> NotifyingContainer<T, C, O>
where
    T: Send,
    C: MpmcContainer<T>,
    O: ContainerObserver,
{
    /// Wrap `inner` with the default threshold factors. `capacity` is the
    /// threshold base: bounded containers pass their element count, the
    /// unbounded queue a nominal high-water mark.
    pub fn new(inner: C, capacity: usize, observer: O) -> Self {
        Self::with_factors(
            inner,
            capacity,
            DEFAULT_PARTLY_EMPTY_FACTOR,
            DEFAULT_ALMOST_FULL_FACTOR,
            observer,
        )
    }

    pub fn with_factors(
        inner: C,
        capacity: usize,
        partly_empty_factor: f64,
        almost_full_factor: f64,
        observer: O,
    ) -> Self {
        assert!(capacity > 0, "threshold base must be positive");
        let clip = capacity - 1;
        Self {
            inner,
            subject: ContainerSubject::new(observer),
            count: AtomicUsize::new(0),
            partly_empty_at: ((capacity as f64 * partly_empty_factor).round() as usize).min(clip),
            almost_full_at: ((capacity as f64 * almost_full_factor).round() as usize).min(clip),
            _payload: PhantomData,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Elements currently in the container, as tracked by this wrapper.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, C, O> MpmcContainer<T> for NotifyingContainer<T, C, O>
where
    T: Send + 'static,
    C: MpmcContainer<T>,
    O: ContainerObserver + 'static,
{
    type PushError = C::PushError;
    type PopError = C::PopError;

    fn push(&self, item: T) -> Result<(), Self::PushError> {
        self.inner.push(item)?;
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        self.subject.notify(ContainerEvent::Insert);
        if count >= self.almost_full_at {
            self.subject.notify_once(ContainerEvent::AlmostFull);
        }
        Ok(())
    }

    fn pop(&self) -> Result<T, Self::PopError> {
        let value = self.inner.pop()?;
        let count = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        self.subject.notify(ContainerEvent::Remove);
        if count <= self.partly_empty_at {
            self.subject.notify_once(ContainerEvent::PartlyEmpty);
        }
        Ok(value)
    }

    fn available(&self) -> bool {
        self.inner.available()
    }

    fn empty(&self) -> bool {
        self.inner.empty()
    }
}

impl<T, C, O> fmt::Debug for NotifyingContainer<T, C, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingContainer")
            .field("count", &self.count.load(Ordering::Relaxed))
            .field("partly_empty_at", &self.partly_empty_at)
            .field("almost_full_at", &self.almost_full_at)
            .finish()
    }
}
