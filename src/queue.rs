//! Lock-free MPMC queue (C3)
//!
//! A Michael–Scott linked queue with a sentinel node, feeding the journal's
//! group-commit worker. Reclamation goes through `crossbeam-epoch` rather
//! than freeing a dequeued node inline: an unsafe immediate free is the one
//! bug the design notes call out explicitly in the source this distills
//! from, so nodes are retired into the current epoch and only reclaimed once
//! no thread can still observe them.
//!
//! `is_empty` is a separate, non-destructive probe — the batch worker must
//! be able to check for pending work without consuming it.

use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};

struct Node<T> {
    value: Option<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            value: None,
            next: Atomic::null(),
        }
    }
}

/// A lock-free, multi-producer multi-consumer FIFO queue.
///
/// FIFO order is preserved per-producer; interleaving across producers is
/// unspecified, matching the Michael–Scott algorithm's guarantees.
pub struct LockFreeQueue<T> {
    head: Atomic<Node<T>>,
    tail: Atomic<Node<T>>,
    // Not part of the MS algorithm proper: a cheap approximate length used
    // only for diagnostics, never for correctness decisions.
    approx_len: AtomicPtr<()>,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    pub fn new() -> Self {
        let guard = epoch::pin();
        let sentinel = Owned::new(Node::sentinel()).into_shared(&guard);
        Self {
            head: Atomic::from(sentinel),
            tail: Atomic::from(sentinel),
            approx_len: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn enqueue(&self, value: T) {
        let guard = epoch::pin();
        let new_node = Owned::new(Node {
            value: Some(value),
            next: Atomic::null(),
        });
        let new_node = new_node.into_shared(&guard);

        loop {
            let tail = self.tail.load(Ordering::Acquire, &guard);
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, &guard);

            if next.is_null() {
                if tail_ref
                    .next
                    .compare_exchange(
                        Shared::null(),
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    )
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail,
                        new_node,
                        Ordering::Release,
                        Ordering::Relaxed,
                        &guard,
                    );
                    return;
                }
            } else {
                // Tail is lagging; help advance it before retrying.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
            }
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            let tail = self.tail.load(Ordering::Acquire, &guard);
            let head_ref = unsafe { head.deref() };
            let next = head_ref.next.load(Ordering::Acquire, &guard);

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail lagging behind a node that's already linked; help it along.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    &guard,
                );
                continue;
            }

            let next_ref = match unsafe { next.as_ref() } {
                Some(r) => r,
                None => continue,
            };

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, &guard)
                .is_ok()
            {
                // Safety: `head` is now unreachable from any live traversal
                // starting at the new head; defer its reclamation to the
                // epoch collector rather than freeing it here.
                unsafe {
                    guard.defer_destroy(head);
                }
                // `value` lives in the *next* node under MS's dummy-head
                // convention; read it out before anyone else can reuse it.
                let value = unsafe {
                    let next_mut = next_ref as *const Node<T> as *mut Node<T>;
                    (*next_mut).value.take()
                };
                return value;
            }
        }
    }

    /// Non-destructive probe: true if the queue currently has no pending
    /// elements. Never consumes an entry, unlike calling `dequeue` to check.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Ordering::Acquire, &guard);
        let tail = self.tail.load(Ordering::Acquire, &guard);
        let head_ref = unsafe { head.deref() };
        let next = head_ref.next.load(Ordering::Acquire, &guard);
        head == tail && next.is_null()
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        let guard = epoch::pin();
        let sentinel = self.head.load(Ordering::Acquire, &guard);
        unsafe {
            guard.defer_destroy(sentinel);
        }
    }
}
