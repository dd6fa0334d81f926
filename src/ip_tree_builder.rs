//! IP Tree Builder for MMDB Format
//!
//! Builds a binary search tree for IP address lookups following the MMDB
//! specification. Inserts are longest-prefix aware: a less specific
//! prefix inserted after a more specific one backfills around it, and a
//! more specific prefix splits an existing data leaf.

use crate::mmdb::{IpVersion, MmdbError, RecordSize};
use crate::network::{addr_to_int, Network};

/// IP tree builder using arena allocation
#[derive(Debug)]
pub struct IpTreeBuilder {
    record_size: RecordSize,
    /// All nodes in the tree (arena)
    nodes: Vec<Node>,
    /// IP version (determines tree depth)
    ip_version: IpVersion,
}

/// A node in the IP tree
#[derive(Debug, Clone)]
struct Node {
    /// Left child (bit 0)
    left: NodePointer,
    /// Right child (bit 1)
    right: NodePointer,
}

/// Node pointer: another node, a data leaf, or empty
///
/// Data leaves remember their prefix length so longest-prefix insertion
/// can tell which of two overlapping records wins. The length never
/// reaches the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePointer {
    /// Points to another node (value is node ID)
    Node(u32),
    /// Points to data section (data offset, prefix length)
    Data(u32, u8),
    /// Empty (not found marker)
    Empty,
}

impl IpTreeBuilder {
    /// Create a tree builder for one IP version
    pub fn new(ip_version: IpVersion, record_size: RecordSize) -> Self {
        Self {
            record_size,
            nodes: vec![Node::new_empty()],
            ip_version,
        }
    }

    /// The IP version this tree holds
    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// Insert a network with its data section offset
    pub fn insert(&mut self, network: Network, data_offset: u32) -> Result<(), MmdbError> {
        let is_v4_tree = self.ip_version == IpVersion::V4;
        if network.is_ipv4() != is_v4_tree {
            return Err(MmdbError::InvalidNetwork(format!(
                "cannot insert {} into an {} tree",
                network, self.ip_version
            )));
        }

        let shift = 128 - self.ip_version.bits() as u32;
        let bits = addr_to_int(network.addr()) << shift;
        self.insert_bits(bits, network.prefix_len(), data_offset);
        Ok(())
    }

    /// Insert left-aligned address bits down to `prefix_len`
    fn insert_bits(&mut self, bits: u128, prefix_len: u8, data_offset: u32) {
        if prefix_len == 0 {
            // The whole address space: backfill everything reachable.
            self.backfill_less_specific(0, data_offset, 0);
            return;
        }

        let mut node_id = 0u32;

        for depth in 0..prefix_len {
            let bit = ((bits >> (127 - depth)) & 1) as u8;

            let child = {
                let node = &self.nodes[node_id as usize];
                if bit == 0 {
                    node.left
                } else {
                    node.right
                }
            };

            if depth + 1 == prefix_len {
                // Reached the target depth.
                match child {
                    NodePointer::Empty => {
                        self.set_child(node_id, bit, NodePointer::Data(data_offset, prefix_len));
                    }
                    NodePointer::Data(_, existing_len) => {
                        // Equal or more specific data replaces; otherwise
                        // the existing more specific record stands.
                        if prefix_len >= existing_len {
                            self.set_child(
                                node_id,
                                bit,
                                NodePointer::Data(data_offset, prefix_len),
                            );
                        }
                    }
                    NodePointer::Node(child_id) => {
                        // More specific prefixes already live deeper; fill
                        // the gaps they leave without disturbing them.
                        self.backfill_less_specific(child_id, data_offset, prefix_len);
                    }
                }
                return;
            }

            // Need to descend further.
            match child {
                NodePointer::Empty => {
                    let new_id = self.allocate_node();
                    self.set_child(node_id, bit, NodePointer::Node(new_id));
                    node_id = new_id;
                }
                NodePointer::Node(child_id) => {
                    node_id = child_id;
                }
                NodePointer::Data(existing_offset, existing_len) => {
                    // A less specific record sits on the way down. Split
                    // it into a node whose children both keep the record,
                    // then continue toward the more specific insert.
                    let new_id = self.allocate_node();
                    self.nodes[new_id as usize].left =
                        NodePointer::Data(existing_offset, existing_len);
                    self.nodes[new_id as usize].right =
                        NodePointer::Data(existing_offset, existing_len);
                    self.set_child(node_id, bit, NodePointer::Node(new_id));
                    node_id = new_id;
                }
            }
        }
    }

    fn set_child(&mut self, node_id: u32, bit: u8, pointer: NodePointer) {
        let node = &mut self.nodes[node_id as usize];
        if bit == 0 {
            node.left = pointer;
        } else {
            node.right = pointer;
        }
    }

    fn allocate_node(&mut self) -> u32 {
        let id = self.nodes.len() as u32;
        self.nodes.push(Node::new_empty());
        id
    }

    /// Fill a subtree's gaps with a less specific record
    ///
    /// Empty pointers take the new record; existing records are replaced
    /// only when the new prefix is more specific than theirs.
    fn backfill_less_specific(&mut self, node_id: u32, data_offset: u32, prefix_len: u8) {
        for bit in 0..2u8 {
            let child = {
                let node = &self.nodes[node_id as usize];
                if bit == 0 {
                    node.left
                } else {
                    node.right
                }
            };
            match child {
                NodePointer::Empty => {
                    self.set_child(node_id, bit, NodePointer::Data(data_offset, prefix_len));
                }
                NodePointer::Data(_, existing_len) => {
                    if prefix_len > existing_len {
                        self.set_child(node_id, bit, NodePointer::Data(data_offset, prefix_len));
                    }
                }
                NodePointer::Node(child_id) => {
                    self.backfill_less_specific(child_id, data_offset, prefix_len);
                }
            }
        }
    }

    /// Serialise the tree
    ///
    /// Returns the tree bytes and the node count.
    pub fn build(&self) -> Result<(Vec<u8>, u32), MmdbError> {
        let node_count = self.nodes.len() as u32;
        let node_size = self.record_size.node_bytes();
        let mut tree_bytes = vec![0u8; node_count as usize * node_size];

        for (node_id, node) in self.nodes.iter().enumerate() {
            let left = self.pointer_to_value(node.left, node_count)?;
            let right = self.pointer_to_value(node.right, node_count)?;
            match self.record_size {
                RecordSize::Bits24 => write_24bit_node(&mut tree_bytes, node_id, left, right),
                RecordSize::Bits28 => write_28bit_node(&mut tree_bytes, node_id, left, right),
                RecordSize::Bits32 => write_32bit_node(&mut tree_bytes, node_id, left, right),
            }
        }

        Ok((tree_bytes, node_count))
    }

    /// Convert a node pointer to its on-disk record value
    fn pointer_to_value(&self, pointer: NodePointer, node_count: u32) -> Result<u32, MmdbError> {
        match pointer {
            NodePointer::Empty => Ok(node_count),
            NodePointer::Node(id) => {
                if id >= node_count {
                    return Err(MmdbError::InvalidFormat(format!(
                        "node id {} exceeds node count {}",
                        id, node_count
                    )));
                }
                Ok(id)
            }
            NodePointer::Data(offset, _) => node_count
                .checked_add(16)
                .and_then(|base| base.checked_add(offset))
                .ok_or_else(|| {
                    MmdbError::InvalidFormat(format!(
                        "data pointer overflow: node_count={} offset={}",
                        node_count, offset
                    ))
                }),
        }
    }
}

impl Node {
    fn new_empty() -> Self {
        Self {
            left: NodePointer::Empty,
            right: NodePointer::Empty,
        }
    }
}

/// Write a 24-bit node (6 bytes per node)
fn write_24bit_node(tree: &mut [u8], node_id: usize, left: u32, right: u32) {
    let offset = node_id * 6;
    tree[offset] = ((left >> 16) & 0xFF) as u8;
    tree[offset + 1] = ((left >> 8) & 0xFF) as u8;
    tree[offset + 2] = (left & 0xFF) as u8;
    tree[offset + 3] = ((right >> 16) & 0xFF) as u8;
    tree[offset + 4] = ((right >> 8) & 0xFF) as u8;
    tree[offset + 5] = (right & 0xFF) as u8;
}

/// Write a 28-bit node (7 bytes per node)
///
/// Layout: [Left 24 bits][Middle 8 bits][Right 24 bits], with the middle
/// byte holding the high nibble of each side.
fn write_28bit_node(tree: &mut [u8], node_id: usize, left: u32, right: u32) {
    let offset = node_id * 7;
    tree[offset] = ((left >> 16) & 0xFF) as u8;
    tree[offset + 1] = ((left >> 8) & 0xFF) as u8;
    tree[offset + 2] = (left & 0xFF) as u8;
    tree[offset + 3] = ((((left >> 24) & 0x0F) << 4) | ((right >> 24) & 0x0F)) as u8;
    tree[offset + 4] = ((right >> 16) & 0xFF) as u8;
    tree[offset + 5] = ((right >> 8) & 0xFF) as u8;
    tree[offset + 6] = (right & 0xFF) as u8;
}

/// Write a 32-bit node (8 bytes per node)
fn write_32bit_node(tree: &mut [u8], node_id: usize, left: u32, right: u32) {
    let offset = node_id * 8;
    tree[offset..offset + 4].copy_from_slice(&left.to_be_bytes());
    tree[offset + 4..offset + 8].copy_from_slice(&right.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_empty_tree() {
        let builder = IpTreeBuilder::new(IpVersion::V4, RecordSize::Bits24);
        let (bytes, node_count) = builder.build().unwrap();
        assert_eq!(node_count, 1);
        assert_eq!(bytes.len(), 6);
        // Both records hold the not-found marker (node_count).
        assert_eq!(bytes, vec![0, 0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_insert_cidr() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4, RecordSize::Bits24);
        builder.insert(net("192.168.0.0/16"), 200).unwrap();
        let (bytes, node_count) = builder.build().unwrap();
        assert!(node_count > 1);
        assert_eq!(bytes.len(), node_count as usize * 6);
    }

    #[test]
    fn test_insert_multiple() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4, RecordSize::Bits24);
        builder.insert(net("192.168.1.0/24"), 100).unwrap();
        builder.insert(net("10.0.0.0/8"), 200).unwrap();
        builder.insert(net("172.16.0.0/12"), 300).unwrap();
        let (bytes, node_count) = builder.build().unwrap();
        assert!(node_count > 3);
        assert_eq!(bytes.len(), node_count as usize * 6);
    }

    #[test]
    fn test_insert_ipv6() {
        let mut builder = IpTreeBuilder::new(IpVersion::V6, RecordSize::Bits24);
        builder.insert(net("2001:db8::/64"), 100).unwrap();
        let (_, node_count) = builder.build().unwrap();
        assert!(node_count > 1);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4, RecordSize::Bits24);
        assert!(builder.insert(net("::1/128"), 100).is_err());

        let mut builder = IpTreeBuilder::new(IpVersion::V6, RecordSize::Bits24);
        assert!(builder.insert(net("10.0.0.0/8"), 100).is_err());
    }

    #[test]
    fn test_specific_then_broad_backfills() {
        // Inserting /24 after /32 must keep the /32 and fill around it.
        let mut builder = IpTreeBuilder::new(IpVersion::V4, RecordSize::Bits24);
        builder.insert(net("192.0.2.1/32"), 100).unwrap();
        builder.insert(net("192.0.2.0/24"), 200).unwrap();

        let host = builder.find(net("192.0.2.1/32"));
        assert_eq!(host, Some(100));
        let sibling = builder.find(net("192.0.2.0/32"));
        assert_eq!(sibling, Some(200));
    }

    #[test]
    fn test_broad_then_specific_splits() {
        let mut builder = IpTreeBuilder::new(IpVersion::V4, RecordSize::Bits24);
        builder.insert(net("192.0.2.0/24"), 200).unwrap();
        builder.insert(net("192.0.2.1/32"), 100).unwrap();

        assert_eq!(builder.find(net("192.0.2.1/32")), Some(100));
        assert_eq!(builder.find(net("192.0.2.2/32")), Some(200));
    }

    impl IpTreeBuilder {
        /// Test helper: longest-prefix data offset for a host network
        fn find(&self, network: Network) -> Option<u32> {
            let shift = 128 - self.ip_version.bits() as u32;
            let bits = addr_to_int(network.addr()) << shift;
            let mut node_id = 0u32;
            for depth in 0..network.prefix_len() {
                let bit = ((bits >> (127 - depth)) & 1) as u8;
                let node = &self.nodes[node_id as usize];
                let child = if bit == 0 { node.left } else { node.right };
                match child {
                    NodePointer::Node(id) => node_id = id,
                    NodePointer::Data(offset, _) => return Some(offset),
                    NodePointer::Empty => return None,
                }
            }
            None
        }
    }
}
