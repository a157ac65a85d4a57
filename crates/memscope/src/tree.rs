//! Level-order walk over pointer-linked trees in target memory.
//!
//! The walk keeps a FIFO of pending nodes and a set of every address ever
//! queued. A child pointer that is already in the set is reported as a
//! duplicate instead of being queued, so a cycle or shared subtree in
//! corrupt memory costs one event and the walk still terminates. Nodes are
//! read when they are queued, never twice.

use crate::address::Address;
use crate::decode::{self, Bitness, Fields, Record};
use crate::error::Result;
use crate::memory::{MemResult, MemoryReader};
use crate::session::Session;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Write};
use tracing::debug;

/// RTL_SPLAY_LINKS on a 32-bit target.
#[derive(Debug, Clone, Copy)]
pub struct TreeItem32 {
    pub parent: u32,
    pub left: u32,
    pub right: u32,
}

impl Record for TreeItem32 {
    const SIZE: usize = 12;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        TreeItem32 {
            parent: f.u32(),
            left: f.u32(),
            right: f.u32(),
        }
    }
}

/// RTL_SPLAY_LINKS on a 64-bit target.
#[derive(Debug, Clone, Copy)]
pub struct TreeItem64 {
    pub parent: u64,
    pub left: u64,
    pub right: u64,
}

impl Record for TreeItem64 {
    const SIZE: usize = 24;

    fn decode(data: &[u8]) -> Self {
        let mut f = Fields::new(data);
        TreeItem64 {
            parent: f.u64(),
            left: f.u64(),
            right: f.u64(),
        }
    }
}

/// The three links of one node, widened to 64 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Links {
    pub parent: u64,
    pub left: u64,
    pub right: u64,
}

impl From<TreeItem32> for Links {
    fn from(item: TreeItem32) -> Self {
        Links {
            parent: item.parent as u64,
            left: item.left as u64,
            right: item.right as u64,
        }
    }
}

impl From<TreeItem64> for Links {
    fn from(item: TreeItem64) -> Self {
        Links {
            parent: item.parent,
            left: item.left,
            right: item.right,
        }
    }
}

/// Where a node keeps its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeShape {
    /// Parent, left and right pointers at the start of the node.
    SplayLinks,
    /// `_RTL_BALANCED_NODE`: the parent field carries balance bits in its
    /// low three bits.
    Balanced { left: u64, right: u64, parent_value: u64 },
    /// Singly linked: one `next` pointer, walked as a left-only chain.
    List { next: u64 },
}

const BALANCE_BITS: u64 = 0x7;

impl NodeShape {
    /// Link offsets of `_RTL_BALANCED_NODE` from the session's symbols.
    pub fn balanced_node(session: &Session) -> Result<Self> {
        Ok(NodeShape::Balanced {
            left: session.field_offset("nt!_RTL_BALANCED_NODE", "Left")?,
            right: session.field_offset("nt!_RTL_BALANCED_NODE", "Right")?,
            parent_value: session.field_offset("nt!_RTL_BALANCED_NODE", "ParentValue")?,
        })
    }

    pub fn read_links(&self, mem: &dyn MemoryReader, node: u64, bitness: Bitness) -> MemResult<Links> {
        let pointer = |offset: u64| -> MemResult<u64> {
            let data = mem.read_virtual_exact(node.wrapping_add(offset), bitness.pointer_size())?;
            Ok(Fields::new(&data).pointer(bitness))
        };
        match *self {
            NodeShape::SplayLinks => Ok(match bitness {
                Bitness::Bit32 => decode::load::<TreeItem32>(mem, node)?.into(),
                Bitness::Bit64 => decode::load::<TreeItem64>(mem, node)?.into(),
            }),
            NodeShape::Balanced {
                left,
                right,
                parent_value,
            } => Ok(Links {
                parent: pointer(parent_value)? & !BALANCE_BITS,
                left: pointer(left)?,
                right: pointer(right)?,
            }),
            NodeShape::List { next } => Ok(Links {
                parent: 0,
                left: pointer(next)?,
                right: 0,
            }),
        }
    }
}

/// One node as the walk reached it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeVisit {
    pub level: u32,
    /// Position within its level.
    pub index: u32,
    pub node: u64,
    pub parent: u64,
    pub left: u64,
    pub right: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TreeEvent {
    Visit(TreeVisit),
    /// A child pointer to a node that was already queued.
    Duplicate { address: u64 },
    /// A child pointer whose node could not be read.
    Unreadable { address: u64 },
}

struct Pending {
    level: u32,
    node: u64,
    links: Links,
}

/// Level-order walk from `root`. A null root yields no events.
pub fn walk(mem: &dyn MemoryReader, root: u64, shape: &NodeShape, bitness: Bitness) -> Vec<TreeEvent> {
    let mut events = Vec::new();
    let mut queue = VecDeque::new();
    let mut visited = HashSet::new();
    // Nodes whose links failed to read. Never counted as visited.
    let mut unreadable = HashSet::new();

    let mut enqueue = |level: u32, node: u64, queue: &mut VecDeque<Pending>, events: &mut Vec<TreeEvent>| {
        if visited.contains(&node) {
            debug!("Tree node {:#x} reached twice", node);
            events.push(TreeEvent::Duplicate { address: node });
            return;
        }
        if unreadable.contains(&node) {
            events.push(TreeEvent::Unreadable { address: node });
            return;
        }
        match shape.read_links(mem, node, bitness) {
            Ok(links) => {
                visited.insert(node);
                queue.push_back(Pending { level, node, links });
            }
            Err(e) => {
                debug!("Tree node {:#x} unreadable: {}", node, e);
                unreadable.insert(node);
                events.push(TreeEvent::Unreadable { address: node });
            }
        }
    };

    if root != 0 {
        enqueue(0, root, &mut queue, &mut events);
    }

    let mut current_level = 0;
    let mut index = 0;
    while let Some(item) = queue.pop_front() {
        if item.level != current_level {
            current_level = item.level;
            index = 0;
        }
        events.push(TreeEvent::Visit(TreeVisit {
            level: item.level,
            index,
            node: item.node,
            parent: item.links.parent,
            left: item.links.left,
            right: item.links.right,
        }));
        index += 1;

        for child in [item.links.left, item.links.right] {
            if child != 0 {
                enqueue(item.level + 1, child, &mut queue, &mut events);
            }
        }
    }
    events
}

/// Follow parent links from `node` to the root. Stops at a null or
/// self-referencing parent, or at the first node seen twice.
pub fn move_to_root(mem: &dyn MemoryReader, node: u64, shape: &NodeShape, bitness: Bitness) -> MemResult<u64> {
    let mut current = node;
    let mut seen = HashSet::new();
    while seen.insert(current) {
        let parent = shape.read_links(mem, current, bitness)?.parent;
        if parent == 0 || parent == current {
            break;
        }
        if seen.contains(&parent) {
            debug!("Parent chain from {:#x} loops at {:#x}", node, parent);
            break;
        }
        current = parent;
    }
    Ok(current)
}

pub fn render_event(event: &TreeEvent, out: &mut dyn Write) -> fmt::Result {
    match event {
        TreeEvent::Visit(v) => writeln!(
            out,
            "L={:04x}#{:04x} {} : P= {} L= {} R= {}",
            v.level,
            v.index,
            Address(v.node),
            Address(v.parent),
            Address(v.left),
            Address(v.right)
        ),
        TreeEvent::Duplicate { address } => writeln!(out, "Item {} was duplicated!", Address(*address)),
        TreeEvent::Unreadable { address } => writeln!(out, "Item {} could not be read", Address(*address)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTarget;

    fn node64(mock: &mut MockTarget, at: u64, parent: u64, left: u64, right: u64) {
        mock.write_u64(at, parent);
        mock.write_u64(at + 8, left);
        mock.write_u64(at + 16, right);
    }

    fn visits(events: &[TreeEvent]) -> Vec<TreeVisit> {
        events
            .iter()
            .filter_map(|e| match e {
                TreeEvent::Visit(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_self_cycle_visits_once() {
        let mut mock = MockTarget::new();
        node64(&mut mock, 0x1000, 0, 0, 0x1000);
        let events = walk(&mock, 0x1000, &NodeShape::SplayLinks, Bitness::Bit64);
        assert_eq!(
            events,
            vec![
                TreeEvent::Visit(TreeVisit {
                    level: 0,
                    index: 0,
                    node: 0x1000,
                    parent: 0,
                    left: 0,
                    right: 0x1000,
                }),
                TreeEvent::Duplicate { address: 0x1000 },
            ]
        );
    }

    #[test]
    fn test_level_order_and_index_reset() {
        let mut mock = MockTarget::new();
        //        a
        //      b   c
        //     d     e
        node64(&mut mock, 0x1000, 0, 0x1100, 0x1200);
        node64(&mut mock, 0x1100, 0x1000, 0x1300, 0);
        node64(&mut mock, 0x1200, 0x1000, 0, 0x1400);
        node64(&mut mock, 0x1300, 0x1100, 0, 0);
        node64(&mut mock, 0x1400, 0x1200, 0, 0);
        let events = walk(&mock, 0x1000, &NodeShape::SplayLinks, Bitness::Bit64);
        let order: Vec<(u32, u32, u64)> = visits(&events).iter().map(|v| (v.level, v.index, v.node)).collect();
        assert_eq!(
            order,
            vec![
                (0, 0, 0x1000),
                (1, 0, 0x1100),
                (1, 1, 0x1200),
                (2, 0, 0x1300),
                (2, 1, 0x1400),
            ]
        );
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_shared_child_and_unreadable() {
        let mut mock = MockTarget::new();
        // Both children of the root point at the same node; that node's left
        // child is unmapped.
        node64(&mut mock, 0x1000, 0, 0x1100, 0x1100);
        node64(&mut mock, 0x1100, 0x1000, 0x9000, 0);
        let events = walk(&mock, 0x1000, &NodeShape::SplayLinks, Bitness::Bit64);
        assert_eq!(visits(&events).len(), 2);
        assert!(events.contains(&TreeEvent::Duplicate { address: 0x1100 }));
        assert!(events.contains(&TreeEvent::Unreadable { address: 0x9000 }));

        assert!(walk(&mock, 0, &NodeShape::SplayLinks, Bitness::Bit64).is_empty());
    }

    #[test]
    fn test_unreadable_node_reached_twice() {
        let mut mock = MockTarget::new();
        // Two nodes both point at the same unmapped address.
        node64(&mut mock, 0x1000, 0, 0x1100, 0x1200);
        node64(&mut mock, 0x1100, 0x1000, 0x9000, 0);
        node64(&mut mock, 0x1200, 0x1000, 0, 0x9000);
        let events = walk(&mock, 0x1000, &NodeShape::SplayLinks, Bitness::Bit64);
        assert_eq!(visits(&events).len(), 3);
        let unreadable = events
            .iter()
            .filter(|e| **e == TreeEvent::Unreadable { address: 0x9000 })
            .count();
        assert_eq!(unreadable, 2);
        assert!(!events.contains(&TreeEvent::Duplicate { address: 0x9000 }));
    }

    #[test]
    fn test_narrow_nodes() {
        let mut mock = MockTarget::new();
        mock.write_virtual(0x1000, &[0, 0, 0, 0, 0x00, 0x20, 0, 0, 0, 0, 0, 0]);
        mock.write_virtual(0x2000, &[0x00, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let events = walk(&mock, 0x1000, &NodeShape::SplayLinks, Bitness::Bit32);
        let v = visits(&events);
        assert_eq!(v.len(), 2);
        assert_eq!(v[1].parent, 0x1000);
    }

    #[test]
    fn test_balanced_node_masks_balance_bits() {
        let mut mock = MockTarget::new();
        let shape = NodeShape::Balanced {
            left: 0,
            right: 8,
            parent_value: 16,
        };
        // root 0x1000 <- 0x1100 <- 0x1200, balance bits set on each parent.
        node64(&mut mock, 0x1000, 0, 0x1100, 0);
        mock.write_u64(0x1010, 0x2);
        node64(&mut mock, 0x1100, 0, 0x1200, 0);
        mock.write_u64(0x1110, 0x1001);
        node64(&mut mock, 0x1200, 0, 0, 0);
        mock.write_u64(0x1210, 0x1102);
        assert_eq!(move_to_root(&mock, 0x1200, &shape, Bitness::Bit64).unwrap(), 0x1000);

        let events = walk(&mock, 0x1000, &shape, Bitness::Bit64);
        let v = visits(&events);
        assert_eq!(v.len(), 3);
        assert_eq!(v[2].parent, 0x1100);
    }

    #[test]
    fn test_move_to_root_stops_on_loop() {
        let mut mock = MockTarget::new();
        node64(&mut mock, 0x1000, 0x1100, 0, 0);
        node64(&mut mock, 0x1100, 0x1000, 0, 0);
        let root = move_to_root(&mock, 0x1000, &NodeShape::SplayLinks, Bitness::Bit64).unwrap();
        assert_eq!(root, 0x1100);
    }

    #[test]
    fn test_render() {
        let mut out = String::new();
        render_event(
            &TreeEvent::Visit(TreeVisit {
                level: 1,
                index: 2,
                node: 0xffff_8000_0000_1000,
                parent: 0xffff_8000_0000_0800,
                left: 0,
                right: 0,
            }),
            &mut out,
        )
        .unwrap();
        render_event(&TreeEvent::Duplicate { address: 0x1000 }, &mut out).unwrap();
        assert_eq!(
            out,
            "L=0001#0002 ffff8000`00001000 : P= ffff8000`00000800 L= 00000000 R= 00000000\n\
             Item 00001000 was duplicated!\n"
        );
    }
}
