//! Incremental construction of a minimal automaton from sorted inputs.
//!
//! The builder keeps a frontier of uncompiled nodes, one per position of
//! the current input. When the next input diverges, the orphaned suffix of
//! the previous input is frozen bottom-up into the byte format, sharing
//! already-frozen suffix nodes through an open-addressed [`NodeHash`].
//! Outputs are pushed toward the root only as far as inputs share a
//! prefix, so each accepted path sums to exactly its output.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use tracing::debug;

use crate::error::{FstError, Result};
use crate::fst::{Arc, Fst, InputType};
use crate::outputs::Outputs;
use crate::packed_ints::{bytes_required, GrowableIntVec};

/// Construction knobs.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Share frozen suffix nodes via the dedup hash. Disabling produces a
    /// (larger) prefix trie.
    pub do_share_suffix: bool,
    /// Allow fixed-array node layout for fan-out nodes.
    pub allow_array_arcs: bool,
    /// Retain the node-ordinal and in-degree tables so the finished
    /// automaton can be packed.
    pub will_pack: bool,
    /// Page size exponent for the arc byte buffer.
    pub bytes_page_bits: u32,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        BuilderOptions {
            do_share_suffix: true,
            allow_array_arcs: true,
            will_pack: false,
            bytes_page_bits: 15,
        }
    }
}

/// Builds a minimal automaton from `(input, output)` pairs added in sorted
/// input order.
pub struct Builder<O: Outputs> {
    fst: Fst<O>,
    no_output: O::Value,
    dedup_hash: Option<NodeHash>,
    last_input: Vec<i32>,
    /// Pending nodes for the current input, indexed by depth.
    frontier: Vec<UnCompiledNode<O::Value>>,
}

impl<O: Outputs> Builder<O>
where
    O::Value: Hash,
{
    pub fn new(input_type: InputType, outputs: O) -> Self {
        Self::with_options(input_type, outputs, &BuilderOptions::default())
    }

    pub fn with_options(input_type: InputType, outputs: O, options: &BuilderOptions) -> Self {
        let fst = Fst::new(
            input_type,
            outputs,
            options.will_pack,
            options.allow_array_arcs,
            options.bytes_page_bits,
        );
        let no_output = fst.no_output.clone();
        let frontier = (0..10)
            .map(|depth| UnCompiledNode::new(no_output.clone(), depth))
            .collect();
        Builder {
            fst,
            no_output,
            dedup_hash: options.do_share_suffix.then(NodeHash::new),
            last_input: Vec::new(),
            frontier,
        }
    }

    /// Number of inputs added so far.
    pub fn term_count(&self) -> u64 {
        self.frontier[0].input_count
    }

    /// Add the next input/output pair. Inputs must arrive in ascending
    /// order; adding the same input twice merges the outputs through the
    /// codec. The empty input is only accepted first.
    pub fn add(&mut self, input: &[i32], output: O::Value) -> Result<()> {
        if !self.last_input.is_empty() && input < self.last_input.as_slice() {
            return Err(FstError::IllegalState(format!(
                "inputs added out of order: {input:?} after {:?}",
                self.last_input
            )));
        }

        while self.frontier.len() < input.len() + 1 {
            let depth = self.frontier.len() as i32;
            self.frontier
                .push(UnCompiledNode::new(self.no_output.clone(), depth));
        }

        if input.is_empty() {
            // Finalness lives on incoming arcs, so the empty input is
            // carried on the container instead of in the byte format.
            self.frontier[0].input_count += 1;
            self.frontier[0].is_final = true;
            return self.fst.set_empty_output(output);
        }

        // Shared prefix with the previous input.
        let mut pos = 0;
        let prefix_stop = self.last_input.len().min(input.len());
        loop {
            self.frontier[pos].input_count += 1;
            if pos >= prefix_stop || self.last_input[pos] != input[pos] {
                break;
            }
            pos += 1;
        }
        let prefix_len_plus1 = pos + 1;

        // The previous input's suffix is now orphaned; freeze it.
        self.freeze_tail(prefix_len_plus1)?;

        // Grow arcs for this input's tail.
        for i in prefix_len_plus1..=input.len() {
            self.frontier[i - 1].add_arc(input[i - 1], BuilderNode::Uncompiled(i), &self.no_output);
            self.frontier[i].input_count += 1;
        }

        let last_idx = input.len();
        let is_duplicate =
            self.last_input.len() == input.len() && prefix_len_plus1 == input.len() + 1;
        if !is_duplicate {
            self.frontier[last_idx].is_final = true;
            self.frontier[last_idx].output = self.no_output.clone();
        }

        // Push conflicting outputs forward, only as far as needed.
        let mut output = output;
        for i in 1..prefix_len_plus1 {
            let label = input[i - 1];
            let last_output = self.frontier[i - 1].last_output(label).clone();
            if last_output != self.no_output {
                let common = self.fst.outputs.common(&output, &last_output);
                let word_suffix = self.fst.outputs.subtract(&last_output, &common);
                self.frontier[i].prepend_output(&self.fst.outputs, &word_suffix);
                self.frontier[i - 1].set_last_output(label, common.clone());
                output = self.fst.outputs.subtract(&output, &common);
            }
        }

        if is_duplicate {
            // Same input more than once in a row, mapping to two outputs.
            let merged = self
                .fst
                .outputs
                .merge(&self.frontier[last_idx].output, &output)?;
            self.frontier[last_idx].output = merged;
        } else {
            // The leftover output is private to this input's divergent arc.
            self.frontier[prefix_len_plus1 - 1].set_last_output(input[prefix_len_plus1 - 1], output);
        }

        self.last_input.clear();
        self.last_input.extend_from_slice(input);
        Ok(())
    }

    /// Freeze the finished automaton and return it.
    pub fn finish(mut self) -> Result<Fst<O>> {
        let term_count = self.frontier[0].input_count;
        self.freeze_tail(0)?;
        let start = self.compile_node(0)?;
        self.fst.finish(start)?;
        debug!(
            terms = term_count,
            nodes = self.fst.node_count,
            arcs = self.fst.arc_count,
            "builder finished"
        );
        Ok(self.fst)
    }

    /// Compile frontier nodes `last_input.len()` down to
    /// `max(1, prefix_len_plus1)`, wiring each into its parent's last arc.
    fn freeze_tail(&mut self, prefix_len_plus1: usize) -> Result<()> {
        let down_to = prefix_len_plus1.max(1);
        if self.last_input.len() < down_to {
            return Ok(());
        }
        for idx in (down_to..=self.last_input.len()).rev() {
            let next_final_output = self.frontier[idx].output.clone();
            // A zero-arc state is encoded as final on the incoming arc;
            // the traversal layer cannot represent a non-final dead end.
            let is_final = self.frontier[idx].is_final || self.frontier[idx].num_arcs == 0;
            let node = self.compile_node(idx)?;
            self.frontier[idx - 1].replace_last(
                self.last_input[idx - 1],
                BuilderNode::Compiled(node),
                next_final_output,
                is_final,
            );
        }
        Ok(())
    }

    fn compile_node(&mut self, node_index: usize) -> Result<i64> {
        let node = match self.dedup_hash.as_mut() {
            Some(hash) if self.frontier[node_index].num_arcs > 0 => {
                hash.add(&mut self.fst, &self.frontier[node_index])?
            }
            _ => self.fst.add_node(&self.frontier[node_index])?,
        };
        self.frontier[node_index].clear(&self.no_output);
        Ok(node)
    }
}

/// A frozen (compiled) node address, or an index into the frontier.
pub(crate) enum BuilderNode {
    Compiled(i64),
    Uncompiled(usize),
}

impl BuilderNode {
    pub(crate) fn compiled_address(&self) -> Result<i64> {
        match self {
            BuilderNode::Compiled(node) => Ok(*node),
            BuilderNode::Uncompiled(_) => Err(FstError::IllegalState(
                "arc target has not been compiled".to_string(),
            )),
        }
    }
}

pub(crate) struct BuilderArc<V> {
    pub(crate) label: i32,
    pub(crate) target: BuilderNode,
    pub(crate) is_final: bool,
    pub(crate) output: V,
    pub(crate) next_final_output: V,
}

/// A pending node: seen, not yet serialized.
pub(crate) struct UnCompiledNode<V> {
    pub(crate) num_arcs: usize,
    pub(crate) arcs: Vec<BuilderArc<V>>,
    /// Pending output of this state when final.
    pub(crate) output: V,
    pub(crate) is_final: bool,
    pub(crate) input_count: u64,
    /// Distance from the root; fixed for a frontier slot even when reused.
    pub(crate) depth: i32,
}

impl<V: Clone + PartialEq> UnCompiledNode<V> {
    fn new(no_output: V, depth: i32) -> Self {
        UnCompiledNode {
            num_arcs: 0,
            arcs: Vec::new(),
            output: no_output,
            is_final: false,
            input_count: 0,
            depth,
        }
    }

    fn clear(&mut self, no_output: &V) {
        self.num_arcs = 0;
        self.is_final = false;
        self.output = no_output.clone();
        self.input_count = 0;
    }

    fn add_arc(&mut self, label: i32, target: BuilderNode, no_output: &V) {
        debug_assert!(label >= 0);
        debug_assert!(self.num_arcs == 0 || label > self.arcs[self.num_arcs - 1].label);
        let arc = BuilderArc {
            label,
            target,
            is_final: false,
            output: no_output.clone(),
            next_final_output: no_output.clone(),
        };
        if self.num_arcs == self.arcs.len() {
            self.arcs.push(arc);
        } else {
            self.arcs[self.num_arcs] = arc;
        }
        self.num_arcs += 1;
    }

    fn last_output(&self, label: i32) -> &V {
        debug_assert!(self.num_arcs > 0);
        debug_assert_eq!(self.arcs[self.num_arcs - 1].label, label);
        &self.arcs[self.num_arcs - 1].output
    }

    fn set_last_output(&mut self, label: i32, new_output: V) {
        debug_assert!(self.num_arcs > 0);
        debug_assert_eq!(self.arcs[self.num_arcs - 1].label, label);
        self.arcs[self.num_arcs - 1].output = new_output;
    }

    fn replace_last(
        &mut self,
        label: i32,
        target: BuilderNode,
        next_final_output: V,
        is_final: bool,
    ) {
        debug_assert!(self.num_arcs > 0);
        let arc = &mut self.arcs[self.num_arcs - 1];
        debug_assert_eq!(arc.label, label);
        arc.target = target;
        arc.next_final_output = next_final_output;
        arc.is_final = is_final;
    }

    fn prepend_output<O: Outputs<Value = V>>(&mut self, outputs: &O, prefix: &V) {
        for arc in &mut self.arcs[..self.num_arcs] {
            arc.output = outputs.add(prefix, &arc.output);
        }
        if self.is_final {
            self.output = outputs.add(prefix, &self.output);
        }
    }
}

/// Open-addressed table of frozen node addresses, for suffix sharing.
///
/// Quadratic probing, rehash at 2/3 occupancy. Address 0 marks an empty
/// slot (no real node lands there; byte 0 is the reserved pad).
struct NodeHash {
    table: GrowableIntVec,
    count: usize,
    mask: u64,
}

impl NodeHash {
    fn new() -> Self {
        NodeHash {
            table: GrowableIntVec::with_capacity(16, 1),
            count: 0,
            mask: 15,
        }
    }

    /// Return the address of a frozen node equal to `node`, freezing it
    /// now if no equal node exists yet.
    fn add<O: Outputs>(&mut self, fst: &mut Fst<O>, node: &UnCompiledNode<O::Value>) -> Result<i64>
    where
        O::Value: Hash,
    {
        let h = hash_uncompiled(fst, node);
        let mut pos = h & self.mask;
        let mut probe = 0u64;
        loop {
            let existing = self.table.get(pos as usize) as i64;
            if existing == 0 {
                let address = fst.add_node(node)?;
                #[cfg(debug_assertions)]
                {
                    let frozen = hash_frozen(fst, address)?;
                    debug_assert_eq!(frozen, h, "frozen node hash must match pending hash");
                }
                self.count += 1;
                self.table.set(pos as usize, address as u64);
                if self.count > 2 * self.table.len() / 3 {
                    self.rehash(fst)?;
                }
                return Ok(address);
            } else if nodes_equal(fst, node, existing)? {
                return Ok(existing);
            }
            probe += 1;
            pos = (pos + probe) & self.mask;
        }
    }

    fn rehash<O: Outputs>(&mut self, fst: &Fst<O>) -> Result<()>
    where
        O::Value: Hash,
    {
        let new_len = 2 * self.table.len();
        let old = std::mem::replace(
            &mut self.table,
            GrowableIntVec::with_capacity(new_len, bytes_required(self.count as u64)),
        );
        self.mask = new_len as u64 - 1;
        for i in 0..old.len() {
            let address = old.get(i);
            if address != 0 {
                self.insert_frozen(fst, address as i64)?;
            }
        }
        Ok(())
    }

    fn insert_frozen<O: Outputs>(&mut self, fst: &Fst<O>, address: i64) -> Result<()>
    where
        O::Value: Hash,
    {
        let h = hash_frozen(fst, address)?;
        let mut pos = h & self.mask;
        let mut probe = 0u64;
        loop {
            if self.table.get(pos as usize) == 0 {
                self.table.set(pos as usize, address as u64);
                return Ok(());
            }
            probe += 1;
            pos = (pos + probe) & self.mask;
        }
    }
}

fn hash_value<V: Hash>(value: &V) -> u64 {
    let mut state = FxHasher::default();
    value.hash(&mut state);
    state.finish()
}

const HASH_PRIME: u64 = 31;

fn hash_uncompiled<O: Outputs>(fst: &Fst<O>, node: &UnCompiledNode<O::Value>) -> u64
where
    O::Value: Hash,
{
    let mut h = 0u64;
    for arc in &node.arcs[..node.num_arcs] {
        h = HASH_PRIME.wrapping_mul(h).wrapping_add(arc.label as u64);
        if let BuilderNode::Compiled(target) = arc.target {
            if target != 0 {
                h = HASH_PRIME
                    .wrapping_mul(h)
                    .wrapping_add((target ^ (target >> 32)) as u64);
            }
        }
        if arc.output != fst.no_output {
            h = HASH_PRIME.wrapping_mul(h).wrapping_add(hash_value(&arc.output));
        }
        if arc.next_final_output != fst.no_output {
            h = HASH_PRIME
                .wrapping_mul(h)
                .wrapping_add(hash_value(&arc.next_final_output));
        }
        if arc.is_final {
            h = h.wrapping_add(17);
        }
    }
    h
}

fn hash_frozen<O: Outputs>(fst: &Fst<O>, address: i64) -> Result<u64>
where
    O::Value: Hash,
{
    let mut h = 0u64;
    let mut reader = fst.bytes_reader();
    let mut arc = Arc::new(fst.no_output.clone());
    fst.read_first_real_target_arc(address, &mut arc, &mut reader)?;
    loop {
        h = HASH_PRIME.wrapping_mul(h).wrapping_add(arc.label as u64);
        if arc.target != 0 {
            h = HASH_PRIME
                .wrapping_mul(h)
                .wrapping_add((arc.target ^ (arc.target >> 32)) as u64);
        }
        if arc.output != fst.no_output {
            h = HASH_PRIME.wrapping_mul(h).wrapping_add(hash_value(&arc.output));
        }
        if arc.next_final_output != fst.no_output {
            h = HASH_PRIME
                .wrapping_mul(h)
                .wrapping_add(hash_value(&arc.next_final_output));
        }
        if arc.is_final() {
            h = h.wrapping_add(17);
        }
        if arc.is_last() {
            return Ok(h);
        }
        fst.read_next_real_arc(&mut arc, &mut reader)?;
    }
}

/// Compare a pending node against a frozen node by re-reading the frozen
/// node's arcs from the byte stream.
fn nodes_equal<O: Outputs>(
    fst: &Fst<O>,
    node: &UnCompiledNode<O::Value>,
    address: i64,
) -> Result<bool> {
    let mut reader = fst.bytes_reader();
    let mut scratch = Arc::new(fst.no_output.clone());
    fst.read_first_real_target_arc(address, &mut scratch, &mut reader)?;
    if scratch.bytes_per_arc != 0 && node.num_arcs != scratch.num_arcs {
        return Ok(false);
    }
    for idx in 0..node.num_arcs {
        let arc = &node.arcs[idx];
        if arc.label != scratch.label
            || arc.is_final != scratch.is_final()
            || arc.output != scratch.output
            || arc.next_final_output != scratch.next_final_output
        {
            return Ok(false);
        }
        if let BuilderNode::Compiled(target) = arc.target {
            if target != scratch.target {
                return Ok(false);
            }
        }
        if scratch.is_last() {
            return Ok(idx == node.num_arcs - 1);
        }
        fst.read_next_real_arc(&mut scratch, &mut reader)?;
    }
    Ok(false)
}
