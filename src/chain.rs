//! Doubly-linked index chains threaded through the request arena.
//!
//! The loop keeps its requests on a handful of lists (submissions, active
//! timers, active wake-ups, the generic active list). The links live inside
//! the slots themselves, so pushing and removing never allocates and removal
//! is O(1). Each slot remembers which chain currently holds it, so a request
//! can be pulled out without knowing where it is.

use crate::recycler::Recycler;

/// An index that links nowhere.
pub(crate) const NIL: usize = usize::MAX;

/// Which loop queue a slot currently sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueId {
    /// In no queue. Only valid transiently, while a slot is being moved.
    Detached,
    Submission,
    Timers,
    WakeUps,
    Active,
}

/// The intrusive part of a slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Links {
    pub prev: usize,
    pub next: usize,
    pub queue: QueueId,
}

impl Links {
    pub fn detached() -> Self {
        Links {
            prev: NIL,
            next: NIL,
            queue: QueueId::Detached,
        }
    }
}

/// Anything that carries chain links.
pub(crate) trait Linked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// One doubly-linked list of arena indices.
pub(crate) struct Chain {
    id: QueueId,
    head: usize,
    tail: usize,
    len: usize,
}

impl Chain {
    pub fn new(id: QueueId) -> Self {
        Chain {
            id,
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Index of the first element, if any. Walk onwards through the slots'
    /// `next` links.
    pub fn head(&self) -> Option<usize> {
        if self.head == NIL {
            None
        } else {
            Some(self.head)
        }
    }

    /// Append a detached slot at the back.
    pub fn push_back<T: Linked>(&mut self, slots: &mut Recycler<T>, idx: usize) {
        {
            let links = slots[idx].links_mut();
            assert_eq!(links.queue, QueueId::Detached);
            links.queue = self.id;
            links.prev = self.tail;
            links.next = NIL;
        }
        if self.tail != NIL {
            slots[self.tail].links_mut().next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    /// Unlink a slot from this chain, leaving it detached.
    pub fn remove<T: Linked>(&mut self, slots: &mut Recycler<T>, idx: usize) {
        let (prev, next) = {
            let links = slots[idx].links_mut();
            assert_eq!(links.queue, self.id);
            let out = (links.prev, links.next);
            *links = Links::detached();
            out
        };
        if prev != NIL {
            slots[prev].links_mut().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            slots[next].links_mut().prev = prev;
        } else {
            self.tail = prev;
        }
        self.len -= 1;
    }

    /// Detach and return the first slot.
    pub fn pop_front<T: Linked>(&mut self, slots: &mut Recycler<T>) -> Option<usize> {
        let idx = self.head()?;
        self.remove(slots, idx);
        Some(idx)
    }

    /// Collect the member indices in order. The snapshot lets the caller
    /// mutate the chain (and the slots) while iterating over it.
    pub fn indices<T: Linked>(&self, slots: &Recycler<T>) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut at = self.head;
        while at != NIL {
            out.push(at);
            at = slots[at].links().next;
        }
        out
    }

    /// Forget all members. The slots' links must be reset separately; this
    /// is only used by loop teardown which clears both sides.
    pub fn reset(&mut self) {
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        links: Links,
        value: u32,
    }

    impl Linked for Node {
        fn links(&self) -> &Links {
            &self.links
        }
        fn links_mut(&mut self) -> &mut Links {
            &mut self.links
        }
    }

    fn node(value: u32) -> Node {
        Node {
            links: Links::detached(),
            value,
        }
    }

    #[test]
    fn push_pop_order() {
        let mut slots = Recycler::new();
        let mut chain = Chain::new(QueueId::Submission);
        let a = slots.store(node(1));
        let b = slots.store(node(2));
        let c = slots.store(node(3));
        chain.push_back(&mut slots, a);
        chain.push_back(&mut slots, b);
        chain.push_back(&mut slots, c);
        assert_eq!(3, chain.len());
        assert_eq!(vec![a, b, c], chain.indices(&slots));

        assert_eq!(Some(a), chain.pop_front(&mut slots));
        assert_eq!(1, slots[a].value);
        assert_eq!(QueueId::Detached, slots[a].links().queue);
        assert_eq!(vec![b, c], chain.indices(&slots));
    }

    #[test]
    fn remove_middle_and_ends() {
        let mut slots = Recycler::new();
        let mut chain = Chain::new(QueueId::Active);
        let ids: Vec<usize> = (0..5).map(|v| slots.store(node(v))).collect();
        for &idx in &ids {
            chain.push_back(&mut slots, idx);
        }

        chain.remove(&mut slots, ids[2]);
        assert_eq!(vec![ids[0], ids[1], ids[3], ids[4]], chain.indices(&slots));
        chain.remove(&mut slots, ids[0]);
        chain.remove(&mut slots, ids[4]);
        assert_eq!(vec![ids[1], ids[3]], chain.indices(&slots));
        assert_eq!(2, chain.len());

        // Removed nodes can be pushed again
        chain.push_back(&mut slots, ids[0]);
        assert_eq!(vec![ids[1], ids[3], ids[0]], chain.indices(&slots));
    }

    #[test]
    #[should_panic]
    fn remove_foreign() {
        let mut slots = Recycler::new();
        let mut submission = Chain::new(QueueId::Submission);
        let mut active = Chain::new(QueueId::Active);
        let a = slots.store(node(1));
        submission.push_back(&mut slots, a);
        active.remove(&mut slots, a); // Wrong chain
    }

    #[test]
    fn empty_pop() {
        let mut slots: Recycler<Node> = Recycler::new();
        let mut chain = Chain::new(QueueId::Timers);
        assert!(chain.is_empty());
        assert_eq!(None, chain.pop_front(&mut slots));
    }
}
