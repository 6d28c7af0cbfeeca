use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Objects that can live in an `ObjectPool`. `reclaim` restores the object
/// to a neutral state before it goes back on the shelf.
pub trait Reclaim {
    fn reclaim(&mut self);
}

impl Reclaim for Vec<u8> {
    fn reclaim(&mut self) {
        self.clear();
    }
}

/// Typed pool of reusable objects. Takes a factory for cold allocations
/// and keeps at most `capacity` reclaimed instances around. The pool is a
/// cheap-to-clone handle over shared state.
pub struct ObjectPool<T> {
    shared: Arc<ObjectShared<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> ObjectPool<T> {
        ObjectPool {
            shared: self.shared.clone(),
        }
    }
}

struct ObjectShared<T> {
    make: Box<dyn Fn() -> T + Send + Sync>,
    shelf: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Reclaim + Send + 'static> ObjectPool<T> {
    pub fn new<F: Fn() -> T + Send + Sync + 'static>(capacity: usize, make: F) -> ObjectPool<T> {
        ObjectPool {
            shared: Arc::new(ObjectShared {
                make: Box::new(make),
                shelf: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Takes an object off the shelf, or constructs one if the shelf is
    /// empty.
    pub fn take(&self) -> Pooled<T> {
        let object = {
            let mut shelf = self
                .shared
                .shelf
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            shelf.pop()
        };

        Pooled {
            pool: self.shared.clone(),
            object: Some(object.unwrap_or_else(|| (self.shared.make)())),
        }
    }

    /// Number of objects currently on the shelf.
    pub fn pooled(&self) -> usize {
        self.shared
            .shelf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl<T: Reclaim> ObjectShared<T> {
    fn give_back(&self, mut object: T) {
        object.reclaim();

        let mut shelf = self.shelf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if shelf.len() < self.capacity {
            shelf.push(object);
        }
    }
}

/// RAII handle to a pooled object. Dropping reclaims the object back into
/// the pool.
pub struct Pooled<T: Reclaim + Send + 'static> {
    pool: Arc<ObjectShared<T>>,
    object: Option<T>,
}

impl<T: Reclaim + Send + 'static> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.object.as_ref().expect("Pooled object already released")
    }
}

impl<T: Reclaim + Send + 'static> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("Pooled object already released")
    }
}

impl<T: Reclaim + Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.give_back(object);
        }
    }
}
