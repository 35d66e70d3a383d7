//! Fixed-capacity red-black tree of non-overlapping [`Region`]s.
//!
//! Nodes live in an inline slot array and link to each other by index, so the
//! tree can be moved freely and never allocates. Two regions compare equal
//! when they overlap; that is what rejects overlapping inserts and what makes
//! point lookups work.

use super::{Region, RegionError};
use core::cmp::Ordering;
use kernel_memory_addresses::VirtualAddress;

type Link = Option<usize>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Color {
    Red,
    Black,
}

#[derive(Copy, Clone, Debug)]
struct Node {
    region: Region,
    color: Color,
    parent: Link,
    left: Link,
    right: Link,
}

#[derive(Copy, Clone, Debug)]
enum Slot {
    Free(Link),
    Used(Node),
}

/// Ordering of two regions; overlapping regions are `Equal`.
fn compare(a: &Region, b: &Region) -> Ordering {
    if a.to <= b.from {
        Ordering::Less
    } else if a.from >= b.to {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

pub struct RbTree<const N: usize> {
    slots: [Slot; N],
    root: Link,
    free: Link,
    len: usize,
}

impl<const N: usize> RbTree<N> {
    pub const fn new() -> Self {
        let mut slots = [Slot::Free(None); N];
        let mut i = 0;
        while i + 1 < N {
            slots[i] = Slot::Free(Some(i + 1));
            i += 1;
        }
        Self {
            slots,
            root: None,
            free: if N == 0 { None } else { Some(0) },
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub fn region(&self, id: usize) -> &Region {
        &self.node(id).region
    }

    pub fn insert(&mut self, region: Region) -> Result<usize, RegionError> {
        let mut parent = None;
        let mut cursor = self.root;
        let mut is_left = false;
        while let Some(c) = cursor {
            parent = Some(c);
            match compare(&region, &self.node(c).region) {
                Ordering::Less => {
                    is_left = true;
                    cursor = self.node(c).left;
                }
                Ordering::Greater => {
                    is_left = false;
                    cursor = self.node(c).right;
                }
                Ordering::Equal => {
                    return Err(RegionError::Overlap {
                        from: region.from,
                        to: region.to,
                    });
                }
            }
        }

        let id = self.free.ok_or(RegionError::TreeFull)?;
        let Slot::Free(next_free) = self.slots[id] else {
            panic!("region tree free list points at used slot {id}");
        };
        self.free = next_free;
        self.slots[id] = Slot::Used(Node {
            region,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });

        match parent {
            None => self.root = Some(id),
            Some(p) if is_left => self.node_mut(p).left = Some(id),
            Some(p) => self.node_mut(p).right = Some(id),
        }
        self.insert_fixup(id);
        self.len += 1;
        Ok(id)
    }

    /// Unlink node `z` and return its region.
    pub fn remove(&mut self, z: usize) -> Region {
        let removed = *self.node(z);
        let mut y_color = removed.color;
        let x;
        let x_parent;

        if removed.left.is_none() {
            x = removed.right;
            x_parent = removed.parent;
            self.transplant(z, removed.right);
        } else if removed.right.is_none() {
            x = removed.left;
            x_parent = removed.parent;
            self.transplant(z, removed.left);
        } else {
            let y = self.minimum(Self::child(removed.right));
            y_color = self.node(y).color;
            x = self.node(y).right;
            if self.node(y).parent == Some(z) {
                x_parent = Some(y);
            } else {
                x_parent = self.node(y).parent;
                self.transplant(y, x);
                self.node_mut(y).right = removed.right;
                self.set_parent(removed.right, Some(y));
            }
            self.transplant(z, Some(y));
            self.node_mut(y).left = removed.left;
            self.set_parent(removed.left, Some(y));
            self.node_mut(y).color = removed.color;
        }

        if y_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.slots[z] = Slot::Free(self.free);
        self.free = Some(z);
        self.len -= 1;
        removed.region
    }

    /// Node whose region contains `addr`.
    pub fn find(&self, addr: VirtualAddress) -> Option<usize> {
        let mut cursor = self.root;
        while let Some(c) = cursor {
            let r = &self.node(c).region;
            cursor = if addr < r.from {
                self.node(c).left
            } else if addr >= r.to {
                self.node(c).right
            } else {
                return Some(c);
            };
        }
        None
    }

    /// Lowest node whose region ends above `addr`.
    pub fn first_ending_above(&self, addr: VirtualAddress) -> Option<usize> {
        let mut best = None;
        let mut cursor = self.root;
        while let Some(c) = cursor {
            if self.node(c).region.to > addr {
                best = Some(c);
                cursor = self.node(c).left;
            } else {
                cursor = self.node(c).right;
            }
        }
        best
    }

    pub fn first(&self) -> Option<usize> {
        self.root.map(|r| self.minimum(r))
    }

    pub fn successor(&self, id: usize) -> Option<usize> {
        if let Some(r) = self.node(id).right {
            return Some(self.minimum(r));
        }
        let mut child = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).right != Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    fn node(&self, id: usize) -> &Node {
        match &self.slots[id] {
            Slot::Used(node) => node,
            Slot::Free(_) => panic!("region tree slot {id} is not in use"),
        }
    }

    fn node_mut(&mut self, id: usize) -> &mut Node {
        match &mut self.slots[id] {
            Slot::Used(node) => node,
            Slot::Free(_) => panic!("region tree slot {id} is not in use"),
        }
    }

    fn child(link: Link) -> usize {
        link.unwrap_or_else(|| panic!("red-black tree lost a child"))
    }

    fn parent_of(&self, id: usize) -> usize {
        self.node(id)
            .parent
            .unwrap_or_else(|| panic!("red-black tree node {id} has no parent"))
    }

    fn is_red(&self, link: Link) -> bool {
        link.is_some_and(|i| self.node(i).color == Color::Red)
    }

    fn set_color(&mut self, link: Link, color: Color) {
        if let Some(i) = link {
            self.node_mut(i).color = color;
        }
    }

    fn set_parent(&mut self, link: Link, parent: Link) {
        if let Some(i) = link {
            self.node_mut(i).parent = parent;
        }
    }

    fn minimum(&self, mut id: usize) -> usize {
        while let Some(l) = self.node(id).left {
            id = l;
        }
        id
    }

    /// Replace the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: usize, v: Link) {
        let up = self.node(u).parent;
        match up {
            None => self.root = v,
            Some(p) if self.node(p).left == Some(u) => self.node_mut(p).left = v,
            Some(p) => self.node_mut(p).right = v,
        }
        self.set_parent(v, up);
    }

    fn rotate_left(&mut self, x: usize) {
        let y = Self::child(self.node(x).right);
        let beta = self.node(y).left;
        self.node_mut(x).right = beta;
        self.set_parent(beta, Some(x));
        self.transplant(x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: usize) {
        let y = Self::child(self.node(x).left);
        let beta = self.node(y).right;
        self.node_mut(x).left = beta;
        self.set_parent(beta, Some(x));
        self.transplant(x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        while let Some(p) = self.node(z).parent
            && self.node(p).color == Color::Red
        {
            let g = self.parent_of(p);
            if self.node(g).left == Some(p) {
                let uncle = self.node(g).right;
                if self.is_red(uncle) {
                    self.set_color(Some(p), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(g), Color::Red);
                    z = g;
                } else {
                    if self.node(p).right == Some(z) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.parent_of(z);
                    let g = self.parent_of(p);
                    self.set_color(Some(p), Color::Black);
                    self.set_color(Some(g), Color::Red);
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.node(g).left;
                if self.is_red(uncle) {
                    self.set_color(Some(p), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(g), Color::Red);
                    z = g;
                } else {
                    if self.node(p).left == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.parent_of(z);
                    let g = self.parent_of(p);
                    self.set_color(Some(p), Color::Black);
                    self.set_color(Some(g), Color::Red);
                    self.rotate_left(g);
                }
            }
        }
        self.set_color(self.root, Color::Black);
    }

    fn delete_fixup(&mut self, mut x: Link, mut x_parent: Link) {
        while x != self.root && !self.is_red(x) {
            let Some(p) = x_parent else { break };
            if x == self.node(p).left {
                let mut w = Self::child(self.node(p).right);
                if self.is_red(Some(w)) {
                    self.set_color(Some(w), Color::Black);
                    self.set_color(Some(p), Color::Red);
                    self.rotate_left(p);
                    w = Self::child(self.node(p).right);
                }
                if !self.is_red(self.node(w).left) && !self.is_red(self.node(w).right) {
                    self.set_color(Some(w), Color::Red);
                    x = Some(p);
                    x_parent = self.node(p).parent;
                } else {
                    if !self.is_red(self.node(w).right) {
                        self.set_color(self.node(w).left, Color::Black);
                        self.set_color(Some(w), Color::Red);
                        self.rotate_right(w);
                        w = Self::child(self.node(p).right);
                    }
                    self.node_mut(w).color = self.node(p).color;
                    self.set_color(Some(p), Color::Black);
                    self.set_color(self.node(w).right, Color::Black);
                    self.rotate_left(p);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let mut w = Self::child(self.node(p).left);
                if self.is_red(Some(w)) {
                    self.set_color(Some(w), Color::Black);
                    self.set_color(Some(p), Color::Red);
                    self.rotate_right(p);
                    w = Self::child(self.node(p).left);
                }
                if !self.is_red(self.node(w).left) && !self.is_red(self.node(w).right) {
                    self.set_color(Some(w), Color::Red);
                    x = Some(p);
                    x_parent = self.node(p).parent;
                } else {
                    if !self.is_red(self.node(w).left) {
                        self.set_color(self.node(w).right, Color::Black);
                        self.set_color(Some(w), Color::Red);
                        self.rotate_left(w);
                        w = Self::child(self.node(p).left);
                    }
                    self.node_mut(w).color = self.node(p).color;
                    self.set_color(Some(p), Color::Black);
                    self.set_color(self.node(w).left, Color::Black);
                    self.rotate_right(p);
                    x = self.root;
                    x_parent = None;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Check the red-black and ordering invariants; returns the black height.
    #[cfg(test)]
    pub fn validate(&self) -> usize {
        assert!(!self.is_red(self.root), "red root");
        self.validate_subtree(self.root, None)
    }

    #[cfg(test)]
    fn validate_subtree(&self, link: Link, parent: Link) -> usize {
        let Some(id) = link else { return 1 };
        let node = self.node(id);
        assert_eq!(node.parent, parent, "broken parent link at {id}");
        if node.color == Color::Red {
            assert!(
                !self.is_red(node.left) && !self.is_red(node.right),
                "red-red at {id}"
            );
        }
        if let Some(l) = node.left {
            assert!(
                self.node(l).region.to <= node.region.from,
                "left child out of order"
            );
        }
        if let Some(r) = node.right {
            assert!(
                self.node(r).region.from >= node.region.to,
                "right child out of order"
            );
        }
        let lh = self.validate_subtree(node.left, Some(id));
        let rh = self.validate_subtree(node.right, Some(id));
        assert_eq!(lh, rh, "black height mismatch at {id}");
        lh + usize::from(node.color == Color::Black)
    }
}
