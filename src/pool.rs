//! Bounded managed connection pool.
//!
//! A [`Pool`] hands out [`Object`]s created and recycled by a [`Manager`].
//! Objects return to the pool when dropped; connections that fail the
//! recycle check are discarded and replaced. Waiting for a free slot is
//! fair (FIFO) via the semaphore.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::dropguard::DropGuard;

/// Manager responsible for creating new pooled objects and recycling
/// existing ones.
#[async_trait]
pub trait Manager: Send + Sync {
    /// Type of objects this manager creates and recycles.
    type Type: Send;
    /// Error returned when creating or recycling fails.
    type Error: Send;

    /// Creates a new instance of [`Manager::Type`].
    async fn create(&self) -> Result<Self::Type, Self::Error>;

    /// Checks whether an existing instance can be handed out again.
    async fn recycle(&self, obj: &mut Self::Type) -> Result<(), RecycleError<Self::Error>>;

    /// Called when an object is permanently removed from the pool.
    fn detach(&self, _obj: &mut Self::Type) {}
}

/// Error returned by [`Manager::recycle`].
#[derive(Debug)]
pub enum RecycleError<E> {
    /// Recycling failed for a reason not reported by the backend.
    Message(String),
    /// The backend reported an error.
    Backend(E),
}

impl<E> From<E> for RecycleError<E> {
    fn from(e: E) -> Self {
        Self::Backend(e)
    }
}

impl<E: fmt::Display> fmt::Display for RecycleError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "recycle failed: {}", msg),
            Self::Backend(e) => write!(f, "recycle failed: {}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RecycleError<E> {}

/// Error returned by [`Pool::get`].
#[derive(Debug)]
pub enum PoolError<E> {
    /// The pool has been closed.
    Closed,
    /// The backend reported an error.
    Backend(E),
}

impl<E> From<E> for PoolError<E> {
    fn from(e: E) -> Self {
        Self::Backend(e)
    }
}

impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "pool has been closed"),
            Self::Backend(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for PoolError<E> {}

/// The current pool status.
#[derive(Clone, Copy, Debug)]
pub struct Status {
    /// The maximum size of the pool.
    pub max_size: usize,
    /// The current size of the pool.
    pub size: usize,
    /// The number of idle objects in the pool. Negative while futures are
    /// waiting for an object.
    pub available: isize,
}

/// Wrapper around a pooled object which returns it to its [`Pool`] on
/// drop.
#[must_use]
pub struct Object<M: Manager> {
    inner: Option<ObjectInner<M>>,
}

struct ObjectInner<M: Manager> {
    obj: M::Type,
    pool: Weak<PoolInner<M>>,
}

impl<M: Manager> Drop for Object<M> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Some(pool) = inner.pool.upgrade() {
                pool.return_object(inner);
            }
        }
    }
}

impl<M: Manager> Deref for Object<M> {
    type Target = M::Type;

    fn deref(&self) -> &M::Type {
        &self.inner.as_ref().expect("object already taken").obj
    }
}

impl<M: Manager> DerefMut for Object<M> {
    fn deref_mut(&mut self) -> &mut M::Type {
        &mut self.inner.as_mut().expect("object already taken").obj
    }
}

impl<M> fmt::Debug for Object<M>
where
    M: Manager,
    M::Type: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("obj", &self.inner.as_ref().map(|inner| &inner.obj))
            .finish()
    }
}

/// Generic connection pool.
///
/// Cloning is cheap; clones share the same internal state.
pub struct Pool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").finish()
    }
}

struct PoolInner<M: Manager> {
    manager: M,
    slots: Mutex<Slots<ObjectInner<M>>>,
    available: AtomicIsize,
    semaphore: Semaphore,
}

struct Slots<T> {
    vec: VecDeque<T>,
    size: usize,
    max_size: usize,
}

impl<M: Manager> Pool<M> {
    /// Creates a new pool with the given manager and maximum size.
    pub fn new(manager: M, max_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                slots: Mutex::new(Slots {
                    vec: VecDeque::with_capacity(max_size),
                    size: 0,
                    max_size,
                }),
                available: AtomicIsize::new(0),
                semaphore: Semaphore::new(max_size),
            }),
        }
    }

    /// Retrieves an object from this pool or waits for one to become
    /// available.
    pub async fn get(&self) -> Result<Object<M>, PoolError<M::Error>> {
        let _ = self.inner.available.fetch_sub(1, Ordering::Relaxed);
        let available_guard = DropGuard::new(|| {
            let _ = self.inner.available.fetch_add(1, Ordering::Relaxed);
        });

        let permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .map_err(|_| PoolError::Closed)?;

        let obj = loop {
            let existing = self.inner.slots.lock().unwrap().vec.pop_front();
            match existing {
                Some(mut inner) => match self.inner.manager.recycle(&mut inner.obj).await {
                    Ok(()) => break inner,
                    Err(_) => {
                        // The object died while idle. Remove it and try
                        // the next slot (or create a fresh one).
                        let _ = self.inner.available.fetch_sub(1, Ordering::Relaxed);
                        self.inner.slots.lock().unwrap().size -= 1;
                        self.inner.manager.detach(&mut inner.obj);
                    }
                },
                None => {
                    let obj = self
                        .inner
                        .manager
                        .create()
                        .await
                        .map_err(PoolError::Backend)?;
                    self.inner.slots.lock().unwrap().size += 1;
                    let _ = self.inner.available.fetch_add(1, Ordering::Relaxed);
                    break ObjectInner {
                        obj,
                        pool: Arc::downgrade(&self.inner),
                    };
                }
            }
        };

        available_guard.disarm();
        permit.forget();
        Ok(Object { inner: Some(obj) })
    }

    /// Closes this pool: drops all idle objects and makes current and
    /// future [`Pool::get`] calls fail with [`PoolError::Closed`].
    /// Checked-out objects are discarded when they come back.
    pub fn close(&self) {
        self.inner.semaphore.close();
        let drained: Vec<ObjectInner<M>> = {
            let mut slots = self.inner.slots.lock().unwrap();
            slots.max_size = 0;
            let drained: Vec<_> = slots.vec.drain(..).collect();
            slots.size -= drained.len();
            drained
        };
        let _ = self.inner.available.fetch_sub(drained.len() as isize, Ordering::Relaxed);
        for mut inner in drained {
            self.inner.manager.detach(&mut inner.obj);
        }
    }

    /// Indicates whether this pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }

    /// Retrieves the [`Status`] of this pool.
    #[must_use]
    pub fn status(&self) -> Status {
        let slots = self.inner.slots.lock().unwrap();
        Status {
            max_size: slots.max_size,
            size: slots.size,
            available: self.inner.available.load(Ordering::Relaxed),
        }
    }

    /// Returns the manager of this pool.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }
}

impl<M: Manager> PoolInner<M> {
    fn return_object(&self, mut inner: ObjectInner<M>) {
        let mut slots = self.slots.lock().unwrap();
        if slots.size <= slots.max_size {
            slots.vec.push_back(inner);
            drop(slots);
            let _ = self.available.fetch_add(1, Ordering::Relaxed);
            self.semaphore.add_permits(1);
        } else {
            slots.size -= 1;
            drop(slots);
            self.manager.detach(&mut inner.obj);
        }
    }
}
