// Copyright 2025 plexus Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Eviction-order list over a slab arena.
//!
//! Nodes are addressed by stable slot tokens instead of intrusive next/prev
//! pointers, so a cache entry only records a slot id and detaching an entry
//! (freeze) is an index swap, not a pointer nulling. `head` is the
//! most-recent/most-important end; `next` walks toward `tail`.
//!
//! The list is owned by whichever single thread runs maintenance tasks; it
//! performs no synchronization of its own.

use plexus_common::slab::{Slab, Token};

struct Node<T> {
    item: T,
    prev: Option<Token>,
    next: Option<Token>,
    linked: bool,
}

pub(crate) struct OrderList<T> {
    slab: Slab<Node<T>>,
    head: Option<Token>,
    tail: Option<Token>,
    linked: usize,
}

impl<T> Default for OrderList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderList<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slab: Slab::new(),
            head: None,
            tail: None,
            linked: 0,
        }
    }

    /// Allocate a slot for `item` and link it at the head.
    pub(crate) fn insert_head(&mut self, item: T) -> Token {
        let token = self.alloc(item);
        self.attach_head(token);
        token
    }

    /// Allocate a slot for `item` and link it at the tail.
    pub(crate) fn insert_tail(&mut self, item: T) -> Token {
        let token = self.alloc(item);
        self.attach_tail(token);
        token
    }

    fn alloc(&mut self, item: T) -> Token {
        self.slab.insert(Node {
            item,
            prev: None,
            next: None,
            linked: false,
        })
    }

    /// Unlink a node from the chain, keeping its slot. No-op when already
    /// detached.
    pub(crate) fn detach(&mut self, token: Token) {
        let Some(node) = self.slab.get(token) else {
            return;
        };
        if !node.linked {
            return;
        }
        let (prev, next) = (node.prev, node.next);

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }

        let node = self.node_mut(token);
        node.prev = None;
        node.next = None;
        node.linked = false;
        self.linked -= 1;
    }

    /// Link a detached node at the head.
    pub(crate) fn attach_head(&mut self, token: Token) {
        debug_assert!(!self.node(token).linked);
        let old = self.head;
        {
            let node = self.node_mut(token);
            node.prev = None;
            node.next = old;
            node.linked = true;
        }
        match old {
            Some(o) => self.node_mut(o).prev = Some(token),
            None => self.tail = Some(token),
        }
        self.head = Some(token);
        self.linked += 1;
    }

    /// Link a detached node at the tail.
    pub(crate) fn attach_tail(&mut self, token: Token) {
        debug_assert!(!self.node(token).linked);
        let old = self.tail;
        {
            let node = self.node_mut(token);
            node.prev = old;
            node.next = None;
            node.linked = true;
        }
        match old {
            Some(o) => self.node_mut(o).next = Some(token),
            None => self.head = Some(token),
        }
        self.tail = Some(token);
        self.linked += 1;
    }

    /// Move a linked node to the head.
    pub(crate) fn move_to_head(&mut self, token: Token) {
        if self.head == Some(token) {
            return;
        }
        self.detach(token);
        self.attach_head(token);
    }

    /// Swap a linked node with its head-side neighbor. No-op at the head.
    pub(crate) fn promote(&mut self, token: Token) {
        let Some(anchor) = self.prev(token) else {
            return;
        };
        self.detach(token);
        self.attach_ahead(token, anchor);
    }

    /// Link a detached node on the head side of `anchor`.
    fn attach_ahead(&mut self, token: Token, anchor: Token) {
        debug_assert!(!self.node(token).linked);
        debug_assert!(self.node(anchor).linked);
        let prev = self.node(anchor).prev;
        {
            let node = self.node_mut(token);
            node.prev = prev;
            node.next = Some(anchor);
            node.linked = true;
        }
        self.node_mut(anchor).prev = Some(token);
        match prev {
            Some(p) => self.node_mut(p).next = Some(token),
            None => self.head = Some(token),
        }
        self.linked += 1;
    }

    /// Unlink a node and free its slot, returning the item.
    pub(crate) fn remove(&mut self, token: Token) -> Option<T> {
        self.detach(token);
        self.slab.remove(token).map(|node| node.item)
    }

    pub(crate) fn head(&self) -> Option<Token> {
        self.head
    }

    pub(crate) fn tail(&self) -> Option<Token> {
        self.tail
    }

    /// The tail-side neighbor of a linked node.
    pub(crate) fn next(&self, token: Token) -> Option<Token> {
        self.slab.get(token).and_then(|n| n.next)
    }

    /// The head-side neighbor of a linked node.
    pub(crate) fn prev(&self, token: Token) -> Option<Token> {
        self.slab.get(token).and_then(|n| n.prev)
    }

    pub(crate) fn get(&self, token: Token) -> Option<&T> {
        self.slab.get(token).map(|n| &n.item)
    }

    pub(crate) fn is_linked(&self, token: Token) -> bool {
        self.slab.get(token).is_some_and(|n| n.linked)
    }

    /// Number of linked nodes (detached slots excluded).
    pub(crate) fn linked_len(&self) -> usize {
        self.linked
    }

    pub(crate) fn clear(&mut self) {
        self.slab.clear();
        self.head = None;
        self.tail = None;
        self.linked = 0;
    }

    fn node(&self, token: Token) -> &Node<T> {
        self.slab.get(token).expect("order list token out of sync")
    }

    fn node_mut(&mut self, token: Token) -> &mut Node<T> {
        self.slab
            .get_mut(token)
            .expect("order list token out of sync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(list: &OrderList<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cursor = list.head();
        while let Some(token) = cursor {
            out.push(*list.get(token).unwrap());
            cursor = list.next(token);
        }
        out
    }

    #[test]
    fn test_attach_detach() {
        let mut list = OrderList::new();
        let a = list.insert_head(1);
        let _b = list.insert_head(2);
        let c = list.insert_tail(3);
        assert_eq!(items(&list), vec![2, 1, 3]);
        assert_eq!(list.linked_len(), 3);

        list.detach(a);
        assert_eq!(items(&list), vec![2, 3]);
        assert!(!list.is_linked(a));
        // Detaching twice is a no-op; the slot survives for re-attachment.
        list.detach(a);
        list.attach_tail(a);
        assert_eq!(items(&list), vec![2, 3, 1]);

        list.move_to_head(c);
        assert_eq!(items(&list), vec![3, 2, 1]);

        assert_eq!(list.remove(c), Some(3));
        assert_eq!(items(&list), vec![2, 1]);
        assert_eq!(list.remove(c), None);
    }

    #[test]
    fn test_promote_walks_toward_head() {
        let mut list = OrderList::new();
        let _a = list.insert_tail(1);
        let _b = list.insert_tail(2);
        let c = list.insert_tail(3);
        assert_eq!(items(&list), vec![1, 2, 3]);

        list.promote(c);
        assert_eq!(items(&list), vec![1, 3, 2]);
        list.promote(c);
        assert_eq!(items(&list), vec![3, 1, 2]);
        // Already at the head: no-op.
        list.promote(c);
        assert_eq!(items(&list), vec![3, 1, 2]);
        assert_eq!(list.head(), Some(c));
        assert_eq!(list.tail().map(|t| *list.get(t).unwrap()), Some(2));
    }
}
