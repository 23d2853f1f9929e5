//! Ordered per-table index over buffered rows.
//!
//! A bounded-level skip list keyed by [`RowKey`] (timestamp plus insertion
//! sequence). Nodes are owned objects addressed by index and reference row
//! bytes in the generation's buffer blocks through a [`RowRef`] handle; there
//! is no raw-pointer layout. Nodes are append-only within a generation: a
//! duplicate timestamp is a distinct row because the disambiguator is part of
//! the key, and an exact key match is rejected rather than overwritten.

use crate::types::RowKey;
use rand::Rng;

/// Maximum number of index lanes per node.
pub const SKIPLIST_MAX_LEVEL: usize = 5;

/// Probability of promoting a node one lane higher.
const SKIPLIST_P: f64 = 0.25;

/// Sentinel node index meaning "end of lane".
const NIL: u32 = u32::MAX;

/// Handle to one encoded row inside a generation's buffer blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRef {
    /// Index of the block within the owning generation.
    pub block: u32,
    /// Byte offset of the row within the block.
    pub offset: u32,
    /// Encoded row length in bytes.
    pub len: u32,
}

#[derive(Debug)]
struct Node {
    key: RowKey,
    row: RowRef,
    next: [u32; SKIPLIST_MAX_LEVEL],
}

/// Skip list holding all buffered rows of one table in ascending key order.
#[derive(Debug)]
pub struct SkipList {
    nodes: Vec<Node>,
    head: [u32; SKIPLIST_MAX_LEVEL],
    level: usize,
}

impl SkipList {
    /// Creates an empty list. The first lane is always populated once rows
    /// arrive; higher lanes grow with the random level draw.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            head: [NIL; SKIPLIST_MAX_LEVEL],
            level: 1,
        }
    }

    /// Number of rows in the list.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the list holds no rows.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn random_level() -> usize {
        let mut rng = rand::rng();
        let mut level = 1;
        while level < SKIPLIST_MAX_LEVEL && rng.random::<f64>() < SKIPLIST_P {
            level += 1;
        }
        level
    }

    /// Links a new node for `key` referencing `row`.
    ///
    /// Returns true if the key was newly inserted, false if the exact tuple
    /// key is already present (the row is left untouched so the caller can
    /// roll back its slab allocation).
    pub fn insert(&mut self, key: RowKey, row: RowRef) -> bool {
        // update[lvl] = index of the last node before the insertion point on
        // that lane, or NIL when the insertion point follows the head.
        let mut update = [NIL; SKIPLIST_MAX_LEVEL];
        let mut cur = NIL;
        for lvl in (0..self.level).rev() {
            let mut next = match cur {
                NIL => self.head[lvl],
                c => self.nodes[c as usize].next[lvl],
            };
            while next != NIL && self.nodes[next as usize].key < key {
                cur = next;
                next = self.nodes[cur as usize].next[lvl];
            }
            update[lvl] = cur;
        }

        let candidate = match update[0] {
            NIL => self.head[0],
            c => self.nodes[c as usize].next[0],
        };
        if candidate != NIL && self.nodes[candidate as usize].key == key {
            return false;
        }

        let node_level = Self::random_level();
        if node_level > self.level {
            // Lanes above the current height start at the head.
            for lvl in self.level..node_level {
                update[lvl] = NIL;
            }
            self.level = node_level;
        }

        let idx = self.nodes.len() as u32;
        let mut node = Node {
            key,
            row,
            next: [NIL; SKIPLIST_MAX_LEVEL],
        };
        for lvl in 0..node_level {
            match update[lvl] {
                NIL => {
                    node.next[lvl] = self.head[lvl];
                    self.head[lvl] = idx;
                }
                prev => {
                    node.next[lvl] = self.nodes[prev as usize].next[lvl];
                    self.nodes[prev as usize].next[lvl] = idx;
                }
            }
        }
        self.nodes.push(node);
        true
    }

    /// Creates a forward iterator positioned at the first row.
    pub fn iter(&self) -> SkipListIter<'_> {
        SkipListIter {
            list: self,
            cur: self.head[0],
        }
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy, forward-only cursor over a [`SkipList`] in ascending key order.
///
/// Restartable by creating a new iterator; the commit pipeline keeps one
/// cursor per table across file ids and drains it with [`peek`] /
/// [`advance`].
///
/// [`peek`]: SkipListIter::peek
/// [`advance`]: SkipListIter::advance
#[derive(Debug)]
pub struct SkipListIter<'a> {
    list: &'a SkipList,
    cur: u32,
}

impl<'a> SkipListIter<'a> {
    /// The row under the cursor, or `None` when exhausted.
    pub fn peek(&self) -> Option<(RowKey, RowRef)> {
        if self.cur == NIL {
            return None;
        }
        let node = &self.list.nodes[self.cur as usize];
        Some((node.key, node.row))
    }

    /// Moves the cursor one row forward.
    pub fn advance(&mut self) {
        if self.cur != NIL {
            self.cur = self.list.nodes[self.cur as usize].next[0];
        }
    }
}

impl<'a> Iterator for SkipListIter<'a> {
    type Item = (RowKey, RowRef);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.peek();
        self.advance();
        item
    }
}
