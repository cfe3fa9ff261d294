//! The automaton container and its binary node/arc format.
//!
//! An [`Fst`] maps sorted input label sequences to outputs. Arcs are packed
//! into one contiguous byte sequence; each node is either a variable-width
//! linear chain scanned forward or a fixed-width array searched by binary
//! search on the label.
//!
//! ## Arc wire format
//!
//! ```text
//! arc       := [flags: u8] [label] [output]? [final_output]? [target: vlong]?
//! array node:= [0x20 marker] [num_arcs: vint] [bytes_per_arc: vint]
//!              arc_0 .. arc_(n-1)     // each padded to bytes_per_arc
//! ```
//!
//! Flag bits (one byte per arc):
//!
//! | bit | meaning |
//! |-----|---------|
//! | 0   | source state is final on this label |
//! | 1   | last arc of its node |
//! | 2   | target node starts right after this arc (no pointer written) |
//! | 3   | target has no outgoing arcs (no pointer written) |
//! | 4   | an output follows the label |
//! | 5   | a final output follows the output |
//! | 6   | (packed only) target pointer is delta-coded vs current position |
//!
//! `0x20` alone (bit 5 without bit 0) is illegal as an arc flag and doubles
//! as the fixed-array node marker.
//!
//! During build every node's bytes are written in natural order and then
//! reversed in place, so the reverse reader consumes them front-to-back;
//! byte offset 0 is a pad so no real node lands on the reserved address 0.
//!
//! ## Container stream
//!
//! ```text
//! ["FST"] [version: i32 BE]
//! [packed: u8] [has_empty: u8] ([empty_len: vint] [empty bytes])?
//! [input_type: u8] ([dense-id table])?
//! [start: vlong] [nodes: vlong] [arcs: vlong] [arcs_with_output: vlong]
//! [num_bytes: vlong] [arc bytes...]
//! ```

use std::io::{Read, Write};

use tracing::debug;

use crate::builder::UnCompiledNode;
use crate::bytes::{
    read_byte_from, read_int_from, read_vint_from, read_vlong_from, write_int_to, write_vint_to,
    write_vlong_to, ByteStore, BytesReader, StoreBytesReader,
};
use crate::error::{FstError, Result};
use crate::outputs::Outputs;
use crate::packed_ints::{GrowableIntVec, PackedIntVec};

pub(crate) const BIT_FINAL_ARC: u8 = 1 << 0;
pub(crate) const BIT_LAST_ARC: u8 = 1 << 1;
pub(crate) const BIT_TARGET_NEXT: u8 = 1 << 2;
pub(crate) const BIT_STOP_NODE: u8 = 1 << 3;
pub(crate) const BIT_ARC_HAS_OUTPUT: u8 = 1 << 4;
pub(crate) const BIT_ARC_HAS_FINAL_OUTPUT: u8 = 1 << 5;
/// Packed automatons only: target is delta-coded vs the current position.
pub(crate) const BIT_TARGET_DELTA: u8 = 1 << 6;

/// Marker for fixed-array nodes; illegal as a standalone arc flag byte.
pub(crate) const ARCS_AS_FIXED_ARRAY: u8 = BIT_ARC_HAS_FINAL_OUTPUT;

/// Nodes at depth <= this with at least [`FIXED_ARRAY_NUM_ARCS_SHALLOW`]
/// arcs are laid out as fixed arrays.
const FIXED_ARRAY_SHALLOW_DISTANCE: i32 = 3;
const FIXED_ARRAY_NUM_ARCS_SHALLOW: usize = 5;
/// Nodes with at least this many arcs are fixed arrays at any depth.
const FIXED_ARRAY_NUM_ARCS_DEEP: usize = 10;

const FILE_FORMAT_NAME: &[u8] = b"FST";
/// First version with the optional packed form.
pub(crate) const VERSION_PACKED: i32 = 3;
/// vint arc targets and vint `bytes_per_arc` in array headers.
pub(crate) const VERSION_VINT_TARGET: i32 = 4;
const VERSION_CURRENT: i32 = VERSION_VINT_TARGET;

/// Virtual final sink state; never serialized.
pub(crate) const FINAL_END_NODE: i64 = -1;
/// Virtual non-final sink state; never serialized.
pub(crate) const NON_FINAL_END_NODE: i64 = 0;

/// Synthetic label on an arc signaling that the source state is final.
pub const END_LABEL: i32 = -1;

/// Number of root arcs cached by label.
const ROOT_ARC_CACHE_SIZE: usize = 0x80;

#[cfg(target_pointer_width = "64")]
pub const DEFAULT_MAX_BLOCK_BITS: u32 = 30;
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_MAX_BLOCK_BITS: u32 = 28;

/// Width of one input label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    /// Unsigned byte labels, 0..=255.
    Byte1,
    /// Unsigned 16-bit labels, big-endian on the wire.
    Byte2,
    /// Non-negative 32-bit labels, vint on the wire.
    Byte4,
}

impl InputType {
    fn to_byte(self) -> u8 {
        match self {
            InputType::Byte1 => 0,
            InputType::Byte2 => 1,
            InputType::Byte4 => 2,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(InputType::Byte1),
            1 => Ok(InputType::Byte2),
            2 => Ok(InputType::Byte4),
            _ => Err(FstError::Format(format!("invalid input type tag {b}"))),
        }
    }

    pub(crate) fn write_label(self, out: &mut ByteStore, label: i32) {
        debug_assert!(label >= 0);
        match self {
            InputType::Byte1 => {
                debug_assert!(label <= 0xFF);
                out.write_byte(label as u8);
            }
            InputType::Byte2 => {
                debug_assert!(label <= 0xFFFF);
                out.write_short(label as u16);
            }
            InputType::Byte4 => out.write_vint(label as u32),
        }
    }

    pub(crate) fn read_label(self, reader: &mut dyn BytesReader) -> Result<i32> {
        match self {
            InputType::Byte1 => Ok(reader.read_byte()? as i32),
            InputType::Byte2 => Ok(reader.read_short()? as i32),
            InputType::Byte4 => {
                let v = reader.read_vint()?;
                if v > i32::MAX as u32 {
                    return Err(FstError::Format(format!("label {v} out of range")));
                }
                Ok(v as i32)
            }
        }
    }
}

/// Traversal cursor: one arc plus enough state to reach its siblings.
///
/// An `Arc` is plain mutable scratch owned by the caller; the reading
/// routines on [`Fst`] fill it in place. Concurrent readers each use their
/// own `Arc` and their own [`BytesReader`].
#[derive(Debug, Clone)]
pub struct Arc<V> {
    /// Input label, or [`END_LABEL`] for the synthetic final arc.
    pub label: i32,
    /// Output accumulated on this arc.
    pub output: V,
    /// Output added when the target is final and traversal stops here.
    pub next_final_output: V,
    /// Target node (address, or ordinal during an ordinal-addressed build);
    /// <= 0 means a virtual sink.
    pub target: i64,
    /// Source node of this arc (ordinal-addressed builds only).
    pub(crate) node: i64,
    pub(crate) flags: u8,
    /// Byte position of the following sibling arc; for a synthetic final
    /// arc this holds the real node to re-enter instead.
    pub(crate) next_arc: i64,
    // Fixed-array cursor state; bytes_per_arc == 0 means linear.
    pub(crate) pos_arcs_start: i64,
    pub(crate) bytes_per_arc: usize,
    pub(crate) arc_idx: i32,
    pub(crate) num_arcs: usize,
}

impl<V: Clone> Arc<V> {
    /// Fresh cursor; `no_output` seeds the output fields.
    pub fn new(no_output: V) -> Self {
        Arc {
            label: 0,
            output: no_output.clone(),
            next_final_output: no_output,
            target: 0,
            node: 0,
            flags: 0,
            next_arc: 0,
            pos_arcs_start: 0,
            bytes_per_arc: 0,
            arc_idx: 0,
            num_arcs: 0,
        }
    }

    pub fn copy_from(&mut self, other: &Arc<V>) {
        self.label = other.label;
        self.output = other.output.clone();
        self.next_final_output = other.next_final_output.clone();
        self.target = other.target;
        self.node = other.node;
        self.flags = other.flags;
        self.next_arc = other.next_arc;
        self.pos_arcs_start = other.pos_arcs_start;
        self.bytes_per_arc = other.bytes_per_arc;
        self.arc_idx = other.arc_idx;
        self.num_arcs = other.num_arcs;
    }

    #[inline]
    pub(crate) fn flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    /// True if this is the last arc of its node.
    pub fn is_last(&self) -> bool {
        self.flag(BIT_LAST_ARC)
    }

    /// True if the source state is final on this arc's label.
    pub fn is_final(&self) -> bool {
        self.flag(BIT_FINAL_ARC)
    }

    /// True if the target node has outgoing arcs.
    pub fn target_has_arcs(&self) -> bool {
        self.target > 0
    }
}

/// A byte-serialized, acyclic finite state transducer.
///
/// Create one through [`crate::Builder`], or [`Fst::load`] a previously
/// saved image. Once finished or loaded, the automaton is immutable and
/// safe to read from many threads, each with its own [`Arc`] cursor and
/// [`Fst::bytes_reader`].
#[derive(Debug)]
pub struct Fst<O: Outputs> {
    pub(crate) input_type: InputType,
    pub(crate) bytes: ByteStore,
    pub(crate) start_node: i64,
    pub(crate) empty_output: Option<O::Value>,
    pub(crate) outputs: O,
    pub(crate) no_output: O::Value,
    pub(crate) node_count: u64,
    pub(crate) arc_count: u64,
    pub(crate) arc_with_output_count: u64,
    pub(crate) packed: bool,
    /// Dense id -> absolute address, present only in packed automatons.
    pub(crate) node_ref_to_address: Option<PackedIntVec>,
    pub(crate) version: i32,
    pub(crate) allow_array_arcs: bool,
    pub(crate) last_frozen_node: i64,
    /// Ordinal -> address, kept only while building for a later pack.
    pub(crate) node_address: Option<GrowableIntVec>,
    /// Ordinal -> in-degree, kept only while building for a later pack.
    pub(crate) in_counts: Option<GrowableIntVec>,
    cached_root_arcs: Vec<Option<Arc<O::Value>>>,
    bytes_per_arc_scratch: Vec<usize>,
}

impl<O: Outputs> Fst<O> {
    /// New empty automaton for building. `will_pack` retains the ordinal
    /// and in-degree tables that [`Fst::pack`] requires.
    pub(crate) fn new(
        input_type: InputType,
        outputs: O,
        will_pack: bool,
        allow_array_arcs: bool,
        bytes_page_bits: u32,
    ) -> Self {
        let no_output = outputs.no_output();
        let mut bytes = ByteStore::new(bytes_page_bits);
        // Pad so no real node gets address 0, which is reserved for the
        // virtual non-final sink.
        bytes.write_byte(0);
        let (node_address, in_counts) = if will_pack {
            (Some(GrowableIntVec::new()), Some(GrowableIntVec::new()))
        } else {
            (None, None)
        };
        Fst {
            input_type,
            bytes,
            start_node: -1,
            empty_output: None,
            outputs,
            no_output,
            node_count: 0,
            arc_count: 0,
            arc_with_output_count: 0,
            packed: false,
            node_ref_to_address: None,
            version: VERSION_CURRENT,
            allow_array_arcs,
            last_frozen_node: 0,
            node_address,
            in_counts,
            cached_root_arcs: Vec::new(),
            bytes_per_arc_scratch: Vec::new(),
        }
    }

    /// New empty packed automaton; the pack rewrite fills it in.
    pub(crate) fn new_packed(input_type: InputType, outputs: O, bytes_page_bits: u32) -> Self {
        let no_output = outputs.no_output();
        Fst {
            input_type,
            bytes: ByteStore::new(bytes_page_bits),
            start_node: -1,
            empty_output: None,
            outputs,
            no_output,
            node_count: 0,
            arc_count: 0,
            arc_with_output_count: 0,
            packed: true,
            node_ref_to_address: None,
            version: VERSION_CURRENT,
            allow_array_arcs: false,
            last_frozen_node: 0,
            node_address: None,
            in_counts: None,
            cached_root_arcs: Vec::new(),
            bytes_per_arc_scratch: Vec::new(),
        }
    }

    pub fn input_type(&self) -> InputType {
        self.input_type
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    /// Output of the empty input sequence, if accepted.
    pub fn empty_output(&self) -> Option<&O::Value> {
        self.empty_output.as_ref()
    }

    /// Serialized nodes (the virtual sinks are not counted).
    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    pub fn arc_count(&self) -> u64 {
        self.arc_count
    }

    pub fn arc_with_output_count(&self) -> u64 {
        self.arc_with_output_count
    }

    /// True if this automaton was produced by the pack rewrite.
    pub fn is_packed(&self) -> bool {
        self.packed
    }

    pub(crate) fn set_empty_output(&mut self, v: O::Value) -> Result<()> {
        self.empty_output = match self.empty_output.take() {
            Some(current) => Some(self.outputs.merge(&current, &v)?),
            None => Some(v),
        };
        Ok(())
    }

    /// Freeze the automaton: fix the start node, trim the byte buffer, and
    /// populate the root-arc cache.
    pub(crate) fn finish(&mut self, mut new_start_node: i64) -> Result<()> {
        if self.start_node != -1 {
            return Err(FstError::IllegalState("already finished".to_string()));
        }
        if new_start_node == FINAL_END_NODE && self.empty_output.is_some() {
            new_start_node = 0;
        }
        self.start_node = new_start_node;
        self.bytes.finish();
        self.cache_root_arcs()?;
        debug!(
            nodes = self.node_count,
            arcs = self.arc_count,
            bytes = self.bytes.position(),
            "finished automaton"
        );
        Ok(())
    }

    #[inline]
    pub(crate) fn node_address_of(&self, node: i64) -> i64 {
        match &self.node_address {
            Some(table) => table.get(node as usize) as i64,
            None => node,
        }
    }

    /// Reader positioned for this automaton's byte layout: forward for
    /// packed, reverse otherwise.
    pub fn bytes_reader(&self) -> StoreBytesReader<'_> {
        if self.packed {
            StoreBytesReader::Forward(self.bytes.forward_reader())
        } else {
            StoreBytesReader::Reverse(self.bytes.reverse_reader())
        }
    }

    pub(crate) fn cache_root_arcs(&mut self) -> Result<()> {
        let mut cache: Vec<Option<Arc<O::Value>>> = vec![None; ROOT_ARC_CACHE_SIZE];
        let mut arc = Arc::new(self.no_output.clone());
        self.first_arc(&mut arc);
        if arc.target_has_arcs() {
            let mut reader = self.bytes_reader();
            let target = arc.target;
            self.read_first_real_target_arc(target, &mut arc, &mut reader)?;
            loop {
                debug_assert!(arc.label != END_LABEL);
                if (arc.label as usize) < cache.len() {
                    cache[arc.label as usize] = Some(arc.clone());
                } else {
                    break;
                }
                if arc.is_last() {
                    break;
                }
                self.read_next_real_arc(&mut arc, &mut reader)?;
            }
        }
        self.cached_root_arcs = cache;
        Ok(())
    }

    fn should_expand(&self, node: &UnCompiledNode<O::Value>) -> bool {
        self.allow_array_arcs
            && ((node.depth <= FIXED_ARRAY_SHALLOW_DISTANCE
                && node.num_arcs >= FIXED_ARRAY_NUM_ARCS_SHALLOW)
                || node.num_arcs >= FIXED_ARRAY_NUM_ARCS_DEEP)
    }

    /// Serialize one compiled node by appending its arcs to the byte
    /// buffer. Returns the node's address (or ordinal, for ordinal-
    /// addressed builds); zero-arc nodes collapse to the virtual sinks.
    pub(crate) fn add_node(&mut self, node_in: &UnCompiledNode<O::Value>) -> Result<i64> {
        if node_in.num_arcs == 0 {
            return Ok(if node_in.is_final {
                FINAL_END_NODE
            } else {
                NON_FINAL_END_NODE
            });
        }

        let start_address = self.bytes.position();

        let do_fixed_array = self.should_expand(node_in);
        if do_fixed_array && self.bytes_per_arc_scratch.len() < node_in.num_arcs {
            self.bytes_per_arc_scratch.resize(node_in.num_arcs, 0);
        }

        self.arc_count += node_in.num_arcs as u64;

        let last_arc = node_in.num_arcs - 1;
        let mut last_arc_start = self.bytes.position();
        let mut max_bytes_per_arc = 0usize;

        for arc_idx in 0..node_in.num_arcs {
            let arc = &node_in.arcs[arc_idx];
            let target = arc.target.compiled_address()?;

            let mut flags = 0u8;
            if arc_idx == last_arc {
                flags |= BIT_LAST_ARC;
            }
            if target > 0 && self.last_frozen_node == target && !do_fixed_array {
                flags |= BIT_TARGET_NEXT;
            }
            if arc.is_final {
                flags |= BIT_FINAL_ARC;
                if arc.next_final_output != self.no_output {
                    flags |= BIT_ARC_HAS_FINAL_OUTPUT;
                }
            } else {
                debug_assert!(arc.next_final_output == self.no_output);
            }

            let target_has_arcs = target > 0;
            if !target_has_arcs {
                flags |= BIT_STOP_NODE;
            } else if let Some(in_counts) = self.in_counts.as_mut() {
                let t = target as usize;
                in_counts.set(t, in_counts.get(t) + 1);
            }

            if arc.output != self.no_output {
                flags |= BIT_ARC_HAS_OUTPUT;
            }

            self.bytes.write_byte(flags);
            self.input_type.write_label(&mut self.bytes, arc.label);

            if arc.output != self.no_output {
                self.outputs.write(&arc.output, &mut self.bytes)?;
                self.arc_with_output_count += 1;
            }
            if arc.next_final_output != self.no_output {
                self.outputs
                    .write_final_output(&arc.next_final_output, &mut self.bytes)?;
            }
            if target_has_arcs && flags & BIT_TARGET_NEXT == 0 {
                self.bytes.write_vlong(target as u64);
            }

            // First pass of the array layout writes arcs at natural width
            // and records each length.
            if do_fixed_array {
                let arc_bytes = (self.bytes.position() - last_arc_start) as usize;
                self.bytes_per_arc_scratch[arc_idx] = arc_bytes;
                last_arc_start = self.bytes.position();
                max_bytes_per_arc = max_bytes_per_arc.max(arc_bytes);
            }
        }

        if do_fixed_array {
            debug_assert!(max_bytes_per_arc > 0);

            // header(u8) + num_arcs(vint) + bytes_per_arc(vint)
            let mut header = [0u8; 11];
            let mut header_len = 0usize;
            header[header_len] = ARCS_AS_FIXED_ARRAY;
            header_len += 1;
            write_vint_into(&mut header, &mut header_len, node_in.num_arcs as u32);
            write_vint_into(&mut header, &mut header_len, max_bytes_per_arc as u32);

            let fixed_array_start = start_address + header_len as i64;

            // Expand the arcs in place, back to front, so overlapping
            // copies always move bytes toward higher addresses.
            let mut src_pos = self.bytes.position();
            let mut dest_pos =
                fixed_array_start + (node_in.num_arcs * max_bytes_per_arc) as i64;
            debug_assert!(dest_pos >= src_pos);
            if dest_pos > src_pos {
                self.bytes.skip_bytes(dest_pos - src_pos);
                for arc_idx in (0..node_in.num_arcs).rev() {
                    dest_pos -= max_bytes_per_arc as i64;
                    src_pos -= self.bytes_per_arc_scratch[arc_idx] as i64;
                    if src_pos != dest_pos {
                        debug_assert!(dest_pos > src_pos);
                        self.bytes
                            .copy_bytes(src_pos, dest_pos, self.bytes_per_arc_scratch[arc_idx]);
                    }
                }
            }

            self.bytes.write_bytes_at(start_address, &header[..header_len]);
        }

        let this_node_address = self.bytes.position() - 1;
        self.bytes.reverse(start_address, this_node_address);

        // The ordinal table indexes with a 31-bit int.
        if self.node_address.is_some() && self.node_count == i32::MAX as u64 {
            return Err(FstError::CapacityExceeded(
                "ordinal-addressed automaton cannot exceed 2^31 - 1 nodes".to_string(),
            ));
        }

        self.node_count += 1;
        let node = match self.node_address.as_mut() {
            Some(table) => {
                // Ordinals start at 1; 0 stays reserved for the sink.
                table.set(self.node_count as usize, this_node_address as u64);
                self.node_count as i64
            }
            None => this_node_address,
        };
        self.last_frozen_node = node;

        Ok(node)
    }

    /// Initialize `arc` as the virtual incoming arc to the start node.
    pub fn first_arc(&self, arc: &mut Arc<O::Value>) {
        arc.label = 0;
        arc.node = 0;
        arc.next_arc = 0;
        arc.pos_arcs_start = 0;
        arc.bytes_per_arc = 0;
        arc.arc_idx = 0;
        arc.num_arcs = 0;
        if let Some(empty) = &self.empty_output {
            arc.flags = BIT_FINAL_ARC | BIT_LAST_ARC;
            arc.next_final_output = empty.clone();
            if *empty != self.no_output {
                arc.flags |= BIT_ARC_HAS_FINAL_OUTPUT;
            }
        } else {
            arc.flags = BIT_LAST_ARC;
            arc.next_final_output = self.no_output.clone();
        }
        arc.output = self.no_output.clone();
        // If only the empty input is accepted, start_node is 0.
        arc.target = self.start_node;
    }

    /// Follow `follow` and read the first arc of its target. A final
    /// `follow` yields the synthetic [`END_LABEL`] arc first.
    pub fn read_first_target_arc<R: BytesReader>(
        &self,
        follow: &Arc<O::Value>,
        arc: &mut Arc<O::Value>,
        reader: &mut R,
    ) -> Result<()> {
        if follow.is_final() {
            arc.label = END_LABEL;
            arc.output = follow.next_final_output.clone();
            arc.flags = BIT_FINAL_ARC;
            if follow.target <= 0 {
                arc.flags |= BIT_LAST_ARC;
            } else {
                arc.node = follow.target;
                // The node to re-enter on read_next_arc, not a byte position.
                arc.next_arc = follow.target;
            }
            arc.target = FINAL_END_NODE;
            Ok(())
        } else {
            self.read_first_real_target_arc(follow.target, arc, reader)
        }
    }

    /// Read the first arc of `node` (a real node, not a sink sentinel).
    pub fn read_first_real_target_arc<R: BytesReader>(
        &self,
        node: i64,
        arc: &mut Arc<O::Value>,
        reader: &mut R,
    ) -> Result<()> {
        let address = self.node_address_of(node);
        reader.set_position(address);
        arc.node = node;

        if reader.read_byte()? == ARCS_AS_FIXED_ARRAY {
            arc.num_arcs = reader.read_vint()? as usize;
            arc.bytes_per_arc = self.read_bytes_per_arc(reader)?;
            arc.arc_idx = -1;
            arc.pos_arcs_start = reader.position();
            arc.next_arc = arc.pos_arcs_start;
        } else {
            arc.next_arc = address;
            arc.bytes_per_arc = 0;
        }
        self.read_next_real_arc(arc, reader)
    }

    fn read_bytes_per_arc<R: BytesReader>(&self, reader: &mut R) -> Result<usize> {
        if self.packed || self.version >= VERSION_VINT_TARGET {
            Ok(reader.read_vint()? as usize)
        } else {
            let v = reader.read_int()?;
            if v <= 0 {
                return Err(FstError::Format(format!("invalid bytes_per_arc {v}")));
            }
            Ok(v as usize)
        }
    }

    fn read_unpacked_node_target<R: BytesReader>(&self, reader: &mut R) -> Result<i64> {
        if self.version < VERSION_VINT_TARGET {
            Ok(reader.read_int()? as i64)
        } else {
            Ok(reader.read_vlong()? as i64)
        }
    }

    /// Follow `follow` and read the *last* arc of its target.
    pub fn read_last_target_arc<R: BytesReader>(
        &self,
        follow: &Arc<O::Value>,
        arc: &mut Arc<O::Value>,
        reader: &mut R,
    ) -> Result<()> {
        if !follow.target_has_arcs() {
            debug_assert!(follow.is_final());
            arc.label = END_LABEL;
            arc.target = FINAL_END_NODE;
            arc.output = follow.next_final_output.clone();
            arc.flags = BIT_LAST_ARC;
            return Ok(());
        }
        reader.set_position(self.node_address_of(follow.target));
        arc.node = follow.target;
        let b = reader.read_byte()?;
        if b == ARCS_AS_FIXED_ARRAY {
            // Array: jump straight to the end.
            arc.num_arcs = reader.read_vint()? as usize;
            arc.bytes_per_arc = self.read_bytes_per_arc(reader)?;
            arc.pos_arcs_start = reader.position();
            arc.arc_idx = arc.num_arcs as i32 - 2;
        } else {
            arc.flags = b;
            arc.bytes_per_arc = 0;
            // Linear: scan forward, discarding arc bodies, until the last.
            while !arc.is_last() {
                self.input_type.read_label(reader)?;
                if arc.flag(BIT_ARC_HAS_OUTPUT) {
                    self.outputs.read(reader)?;
                }
                if arc.flag(BIT_ARC_HAS_FINAL_OUTPUT) {
                    self.outputs.read_final_output(reader)?;
                }
                if arc.flag(BIT_STOP_NODE) || arc.flag(BIT_TARGET_NEXT) {
                    // No target pointer encoded.
                } else if self.packed {
                    reader.read_vlong()?;
                } else {
                    self.read_unpacked_node_target(reader)?;
                }
                arc.flags = reader.read_byte()?;
            }
            // Un-read the flag byte of the last arc so it parses whole.
            reader.skip_bytes(-1);
            arc.next_arc = reader.position();
        }
        self.read_next_real_arc(arc, reader)?;
        debug_assert!(arc.is_last());
        Ok(())
    }

    /// Advance to the next arc of the current node. The current arc must
    /// not be the last one.
    pub fn read_next_arc<R: BytesReader>(
        &self,
        arc: &mut Arc<O::Value>,
        reader: &mut R,
    ) -> Result<()> {
        if arc.label == END_LABEL {
            // The synthetic final arc stores the real node in next_arc.
            if arc.next_arc <= 0 {
                return Err(FstError::IllegalState(
                    "cannot read next arc when the current arc is last".to_string(),
                ));
            }
            self.read_first_real_target_arc(arc.next_arc, arc, reader)
        } else {
            self.read_next_real_arc(arc, reader)
        }
    }

    /// Peek the label of the following sibling arc without touching `arc`.
    /// Must not be called when `arc` is the last arc of its node.
    pub fn read_next_arc_label<R: BytesReader>(
        &self,
        arc: &Arc<O::Value>,
        reader: &mut R,
    ) -> Result<i32> {
        debug_assert!(!arc.is_last());
        if arc.label == END_LABEL {
            let pos = self.node_address_of(arc.next_arc);
            reader.set_position(pos);
            let b = reader.read_byte()?;
            if b == ARCS_AS_FIXED_ARRAY {
                reader.read_vint()?;
                self.read_bytes_per_arc(reader)?;
            } else {
                reader.set_position(pos);
            }
        } else if arc.bytes_per_arc != 0 {
            // Arcs are at fixed entries.
            reader.set_position(arc.pos_arcs_start);
            reader.skip_bytes((1 + arc.arc_idx as i64) * arc.bytes_per_arc as i64);
        } else {
            reader.set_position(arc.next_arc);
        }
        reader.read_byte()?; // skip flags
        self.input_type.read_label(reader)
    }

    /// Advance to the next real arc of the current node.
    pub fn read_next_real_arc<R: BytesReader>(
        &self,
        arc: &mut Arc<O::Value>,
        reader: &mut R,
    ) -> Result<()> {
        if arc.bytes_per_arc != 0 {
            // Continuing arc in a fixed array.
            arc.arc_idx += 1;
            debug_assert!((arc.arc_idx as usize) < arc.num_arcs);
            reader.set_position(arc.pos_arcs_start);
            reader.skip_bytes(arc.arc_idx as i64 * arc.bytes_per_arc as i64);
        } else {
            reader.set_position(arc.next_arc);
        }
        arc.flags = reader.read_byte()?;
        if arc.flags == ARCS_AS_FIXED_ARRAY {
            return Err(FstError::Format(
                "fixed-array marker found where an arc flag byte was expected".to_string(),
            ));
        }
        if arc.flag(BIT_ARC_HAS_FINAL_OUTPUT) && !arc.flag(BIT_FINAL_ARC) {
            return Err(FstError::Format(
                "arc has a final output but is not final".to_string(),
            ));
        }
        if arc.flag(BIT_STOP_NODE) && arc.flag(BIT_TARGET_NEXT) {
            return Err(FstError::Format(
                "stop-node and target-next are mutually exclusive".to_string(),
            ));
        }
        arc.label = self.input_type.read_label(reader)?;

        if arc.flag(BIT_ARC_HAS_OUTPUT) {
            arc.output = self.outputs.read(reader)?;
        } else {
            arc.output = self.no_output.clone();
        }
        if arc.flag(BIT_ARC_HAS_FINAL_OUTPUT) {
            arc.next_final_output = self.outputs.read_final_output(reader)?;
        } else {
            arc.next_final_output = self.no_output.clone();
        }

        if arc.flag(BIT_STOP_NODE) {
            if arc.flag(BIT_FINAL_ARC) {
                arc.target = FINAL_END_NODE;
            } else {
                return Err(FstError::Format(
                    "arc reaches a non-final dead-end state".to_string(),
                ));
            }
            arc.next_arc = reader.position();
        } else if arc.flag(BIT_TARGET_NEXT) {
            arc.next_arc = reader.position();
            if self.node_address.is_none() {
                if !arc.flag(BIT_LAST_ARC) {
                    if arc.bytes_per_arc == 0 {
                        // Linear node: scan past the remaining siblings.
                        self.seek_to_next_node(reader)?;
                    } else {
                        reader.set_position(arc.pos_arcs_start);
                        reader.skip_bytes((arc.bytes_per_arc * arc.num_arcs) as i64);
                    }
                }
                arc.target = reader.position();
            } else {
                // Ordinal addressing: the next node is the next ordinal down.
                arc.target = arc.node - 1;
                debug_assert!(arc.target > 0);
            }
        } else {
            if self.packed {
                let pos = reader.position();
                let code = reader.read_vlong()? as i64;
                if arc.flag(BIT_TARGET_DELTA) {
                    arc.target = pos + code;
                } else if let Some(table) = &self.node_ref_to_address {
                    if (code as usize) < table.len() {
                        arc.target = table.get(code as usize) as i64;
                    } else {
                        arc.target = code;
                    }
                } else {
                    arc.target = code;
                }
            } else {
                arc.target = self.read_unpacked_node_target(reader)?;
            }
            arc.next_arc = reader.position();
        }
        Ok(())
    }

    fn seek_to_next_node<R: BytesReader>(&self, reader: &mut R) -> Result<()> {
        loop {
            let flags = reader.read_byte()?;
            self.input_type.read_label(reader)?;

            if flags & BIT_ARC_HAS_OUTPUT != 0 {
                self.outputs.read(reader)?;
            }
            if flags & BIT_ARC_HAS_FINAL_OUTPUT != 0 {
                self.outputs.read_final_output(reader)?;
            }
            if flags & BIT_STOP_NODE == 0 && flags & BIT_TARGET_NEXT == 0 {
                if self.packed {
                    reader.read_vlong()?;
                } else {
                    self.read_unpacked_node_target(reader)?;
                }
            }
            if flags & BIT_LAST_ARC != 0 {
                return Ok(());
            }
        }
    }

    /// True if `follow`'s target node is laid out as a fixed array.
    pub fn is_expanded_target<R: BytesReader>(
        &self,
        follow: &Arc<O::Value>,
        reader: &mut R,
    ) -> Result<bool> {
        if !follow.target_has_arcs() {
            Ok(false)
        } else {
            reader.set_position(self.node_address_of(follow.target));
            Ok(reader.read_byte()? == ARCS_AS_FIXED_ARRAY)
        }
    }

    /// Look up the arc with `label` leaving `follow`'s target, filling
    /// `arc` in place. Returns `false` (with `arc` unspecified) when no
    /// such arc exists; that is a normal miss, not an error.
    pub fn find_target_arc<R: BytesReader>(
        &self,
        label: i32,
        follow: &Arc<O::Value>,
        arc: &mut Arc<O::Value>,
        reader: &mut R,
    ) -> Result<bool> {
        if label == END_LABEL {
            if follow.is_final() {
                if follow.target <= 0 {
                    arc.flags = BIT_LAST_ARC;
                } else {
                    arc.flags = 0;
                    // Set up read_next_arc: next_arc is a node, not a position.
                    arc.next_arc = follow.target;
                    arc.node = follow.target;
                }
                arc.output = follow.next_final_output.clone();
                arc.label = END_LABEL;
                arc.target = FINAL_END_NODE;
                return Ok(true);
            } else {
                return Ok(false);
            }
        }

        // Short-circuit through the root arc cache.
        if follow.target == self.start_node
            && label >= 0
            && (label as usize) < self.cached_root_arcs.len()
        {
            return Ok(match &self.cached_root_arcs[label as usize] {
                Some(cached) => {
                    arc.copy_from(cached);
                    true
                }
                None => false,
            });
        }

        if !follow.target_has_arcs() {
            return Ok(false);
        }

        reader.set_position(self.node_address_of(follow.target));
        arc.node = follow.target;

        if reader.read_byte()? == ARCS_AS_FIXED_ARRAY {
            // Binary search on the label.
            arc.num_arcs = reader.read_vint()? as usize;
            arc.bytes_per_arc = self.read_bytes_per_arc(reader)?;
            arc.pos_arcs_start = reader.position();
            let mut low = 0i64;
            let mut high = arc.num_arcs as i64 - 1;
            while low <= high {
                let mid = (low + high) >> 1;
                reader.set_position(arc.pos_arcs_start);
                reader.skip_bytes(arc.bytes_per_arc as i64 * mid + 1);
                let mid_label = self.input_type.read_label(reader)?;
                if mid_label < label {
                    low = mid + 1;
                } else if mid_label > label {
                    high = mid - 1;
                } else {
                    arc.arc_idx = mid as i32 - 1;
                    self.read_next_real_arc(arc, reader)?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        // Linear scan; arcs are sorted by label.
        self.read_first_real_target_arc(follow.target, arc, reader)?;
        loop {
            if arc.label == label {
                return Ok(true);
            } else if arc.label > label || arc.is_last() {
                return Ok(false);
            }
            self.read_next_real_arc(arc, reader)?;
        }
    }

    /// Serialize to the container byte stream.
    pub fn save<W: Write>(&self, out: &mut W) -> Result<()> {
        if self.start_node == -1 {
            return Err(FstError::IllegalState("call finish first".to_string()));
        }
        if self.node_address.is_some() {
            return Err(FstError::IllegalState(
                "automaton was built for packing; pack it before saving".to_string(),
            ));
        }
        out.write_all(FILE_FORMAT_NAME)?;
        write_int_to(out, self.version)?;
        out.write_all(&[u8::from(self.packed)])?;
        match &self.empty_output {
            Some(empty) => {
                out.write_all(&[1])?;
                let mut scratch = ByteStore::new(10);
                self.outputs.write_final_output(empty, &mut scratch)?;
                let mut empty_bytes = scratch.to_vec();
                if !self.packed {
                    // Stored reversed so the reverse reader decodes it.
                    empty_bytes.reverse();
                }
                write_vint_to(out, empty_bytes.len() as u32)?;
                out.write_all(&empty_bytes)?;
            }
            None => out.write_all(&[0])?,
        }
        out.write_all(&[self.input_type.to_byte()])?;
        if self.packed {
            let table = self.node_ref_to_address.as_ref().ok_or_else(|| {
                FstError::IllegalState("packed automaton lost its deref table".to_string())
            })?;
            table.save(out)?;
        }
        write_vlong_to(out, self.start_node as u64)?;
        write_vlong_to(out, self.node_count)?;
        write_vlong_to(out, self.arc_count)?;
        write_vlong_to(out, self.arc_with_output_count)?;
        let num_bytes = self.bytes.position();
        write_vlong_to(out, num_bytes as u64)?;
        self.bytes.write_to(out)?;
        Ok(())
    }

    /// Load a previously saved automaton.
    pub fn load<R: Read>(reader: &mut R, outputs: O) -> Result<Self> {
        Self::load_with_max_block_bits(reader, outputs, DEFAULT_MAX_BLOCK_BITS)
    }

    /// Load with an explicit page-size cap for the arc byte buffer.
    pub fn load_with_max_block_bits<R: Read>(
        reader: &mut R,
        outputs: O,
        max_block_bits: u32,
    ) -> Result<Self> {
        if !(1..=30).contains(&max_block_bits) {
            return Err(FstError::CapacityExceeded(format!(
                "max_block_bits must be in 1..=30; got {max_block_bits}"
            )));
        }

        let mut name = [0u8; FILE_FORMAT_NAME.len()];
        reader.read_exact(&mut name)?;
        if name != FILE_FORMAT_NAME {
            return Err(FstError::Format(format!(
                "invalid format name {name:?}, expected {FILE_FORMAT_NAME:?}"
            )));
        }
        let version = read_int_from(reader)?;
        if !(VERSION_PACKED..=VERSION_VINT_TARGET).contains(&version) {
            return Err(FstError::Format(format!(
                "unsupported version {version}, expected {VERSION_PACKED}..={VERSION_VINT_TARGET}"
            )));
        }
        let packed = read_byte_from(reader)? == 1;

        let no_output = outputs.no_output();
        let empty_output = if read_byte_from(reader)? == 1 {
            let num_bytes = read_vint_from(reader)? as u64;
            let empty_store = ByteStore::from_reader(reader, num_bytes, 1 << 10)?;
            let value = if packed {
                let mut r = empty_store.forward_reader();
                outputs.read_final_output(&mut r)?
            } else {
                let mut r = empty_store.reverse_reader();
                if num_bytes > 0 {
                    r.set_position(num_bytes as i64 - 1);
                }
                outputs.read_final_output(&mut r)?
            };
            Some(value)
        } else {
            None
        };

        let input_type = InputType::from_byte(read_byte_from(reader)?)?;
        let node_ref_to_address = if packed {
            Some(PackedIntVec::load(reader)?)
        } else {
            None
        };
        let start_node = read_vlong_from(reader)? as i64;
        let node_count = read_vlong_from(reader)?;
        let arc_count = read_vlong_from(reader)?;
        let arc_with_output_count = read_vlong_from(reader)?;
        let num_bytes = read_vlong_from(reader)?;
        let bytes = ByteStore::from_reader(reader, num_bytes, 1 << max_block_bits)?;

        let mut fst = Fst {
            input_type,
            bytes,
            start_node,
            empty_output,
            outputs,
            no_output,
            node_count,
            arc_count,
            arc_with_output_count,
            packed,
            node_ref_to_address,
            version,
            allow_array_arcs: false,
            last_frozen_node: 0,
            node_address: None,
            in_counts: None,
            cached_root_arcs: Vec::new(),
            bytes_per_arc_scratch: Vec::new(),
        };
        fst.cache_root_arcs()?;
        debug!(
            nodes = fst.node_count,
            arcs = fst.arc_count,
            packed = fst.packed,
            version = fst.version,
            "loaded automaton"
        );
        Ok(fst)
    }
}

fn write_vint_into(buf: &mut [u8], pos: &mut usize, mut v: u32) {
    while v >= 0x80 {
        buf[*pos] = (v as u8 & 0x7F) | 0x80;
        *pos += 1;
        v >>= 7;
    }
    buf[*pos] = v as u8;
    *pos += 1;
}
