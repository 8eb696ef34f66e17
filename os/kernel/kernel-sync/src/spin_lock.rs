use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// Holder id used by [`SpinLock::lock`] when the caller does not name a CPU.
pub const NO_CPU: usize = usize::MAX;

/// Mutual exclusion lock with a diagnostic name and holder tracking.
pub struct SpinLock<T> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    /// CPU holding the lock, [`NO_CPU`] when anonymous or free.
    cpu: AtomicUsize,
    name: &'static str,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self::named("anonymous", inner)
    }

    pub const fn named(name: &'static str, inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            cpu: AtomicUsize::new(NO_CPU),
            name,
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether `cpu` currently holds the lock.
    #[inline]
    #[must_use]
    pub fn holding(&self, cpu: usize) -> bool {
        self.locked.load(Ordering::Relaxed) && self.cpu.load(Ordering::Relaxed) == cpu
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Spin until acquired (TATAS), then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard { lock: self }
    }

    /// Acquire on behalf of `cpu` and record it as the holder.
    ///
    /// # Panics
    /// Panics if `cpu` already holds the lock; spinning would never end.
    #[inline]
    pub fn lock_on(&self, cpu: usize) -> SpinLockGuard<'_, T> {
        if cpu != NO_CPU && self.holding(cpu) {
            panic!("acquire: {} already held by cpu {cpu}", self.name);
        }
        self.acquire();
        self.cpu.store(cpu, Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    fn acquire(&self) {
        // Fast path: take the lock if it looks free.
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Contended path: spin on a read, then retry CAS.
            while self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.locked.load(Ordering::Relaxed) {
                    spin_loop();
                }
            }
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.cpu.store(NO_CPU, Ordering::Relaxed);
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}
