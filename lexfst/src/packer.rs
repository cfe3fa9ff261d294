//! Pack rewrite: re-emit a finished automaton in a smaller encoding.
//!
//! High in-degree nodes get dense ids resolved through a side table, and
//! remaining pointers are delta-coded against the write position when
//! that is cheaper than the absolute form. Because re-encoding moves every
//! node, target addresses are only correct once node addresses stop
//! changing; the rewrite loops until a pass observes no movement.
//!
//! Nodes are re-emitted in descending ordinal order so that the
//! target-is-next encoding between neighboring ordinals survives, and the
//! output is consumed by a forward reader (no per-node byte reversal).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{FstError, Result};
use crate::fst::{
    Arc, Fst, ARCS_AS_FIXED_ARRAY, BIT_ARC_HAS_FINAL_OUTPUT, BIT_ARC_HAS_OUTPUT, BIT_FINAL_ARC,
    BIT_LAST_ARC, BIT_STOP_NODE, BIT_TARGET_DELTA, BIT_TARGET_NEXT,
};
use crate::outputs::Outputs;
use crate::packed_ints::{bytes_required, GrowableIntVec, PackedIntVec};

/// Candidate for the dense-id table, ordered by in-degree with ties going
/// to the smaller ordinal.
#[derive(PartialEq, Eq)]
struct NodeAndInCount {
    node: i64,
    count: u64,
}

impl Ord for NodeAndInCount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.count
            .cmp(&other.count)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for NodeAndInCount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<O: Outputs + Clone> Fst<O> {
    /// Produce a packed copy of this automaton.
    ///
    /// Requires an automaton built with ordinal addressing (the builder's
    /// `will_pack` option). The `max_deref_nodes` highest in-degree nodes
    /// (with at least `min_in_count_deref` incoming arcs) are addressed
    /// through the dense-id table. The in-degree table is consumed.
    pub fn pack(&mut self, min_in_count_deref: u64, max_deref_nodes: usize) -> Result<Fst<O>> {
        if self.start_node == -1 {
            return Err(FstError::IllegalState("call finish first".to_string()));
        }
        if self.node_address.is_none() || self.in_counts.is_none() {
            return Err(FstError::IllegalState(
                "automaton was not built with ordinal addressing; cannot pack".to_string(),
            ));
        }

        // Select the top nodes by in-degree with a bounded min-heap.
        let top_node_map = {
            let in_counts = self.in_counts.as_ref().expect("checked above");
            let top_n = max_deref_nodes.min(in_counts.len());
            let mut queue: BinaryHeap<std::cmp::Reverse<NodeAndInCount>> =
                BinaryHeap::with_capacity(top_n);
            if top_n > 0 {
                for node in 0..in_counts.len() {
                    let count = in_counts.get(node);
                    if count < min_in_count_deref {
                        continue;
                    }
                    let candidate = NodeAndInCount {
                        node: node as i64,
                        count,
                    };
                    if queue.len() < top_n {
                        queue.push(std::cmp::Reverse(candidate));
                    } else if candidate > queue.peek().expect("non-empty").0 {
                        queue.pop();
                        queue.push(std::cmp::Reverse(candidate));
                    }
                }
            }
            let mut map = FxHashMap::default();
            for dense_id in (0..queue.len()).rev() {
                let entry = queue.pop().expect("sized by loop").0;
                map.insert(entry.node, dense_id);
            }
            map
        };
        // The in-degree table has served its purpose; free it.
        self.in_counts = None;

        let node_count = self.node_count;
        let total_bytes = self.bytes.position();

        // Coarse first guess: mirror each node's distance from the end.
        let mut new_node_address = GrowableIntVec::with_capacity(
            1 + node_count as usize,
            bytes_required(total_bytes as u64),
        );
        {
            let node_address = self.node_address.as_ref().expect("checked above");
            for node in 1..=node_count as usize {
                new_node_address.set(node, 1 + total_bytes as u64 - node_address.get(node));
            }
        }

        let mut reader = self.bytes_reader();
        let mut arc: Arc<O::Value> = Arc::new(self.no_output.clone());
        let mut pass = 0u32;

        // Iterate until no node address changes.
        let mut fst = loop {
            pass += 1;
            let mut changed = false;
            let mut changed_count = 0u64;
            let mut neg_delta = false;
            let mut address_error: i64 = 0;

            let mut fst = Fst::new_packed(
                self.input_type,
                self.outputs.clone(),
                self.bytes.block_bits(),
            );
            // Byte 0 stays reserved for the virtual sink.
            fst.bytes.write_byte(0);

            for node in (1..=node_count as i64).rev() {
                fst.node_count += 1;
                let address = fst.bytes.position();
                if address as u64 != new_node_address.get(node as usize) {
                    address_error = address - new_node_address.get(node as usize) as i64;
                    changed = true;
                    new_node_address.set(node as usize, address as u64);
                    changed_count += 1;
                }

                let mut node_arc_count = 0u64;
                let mut bytes_per_arc = 0usize;
                let mut retry = false;
                let mut any_neg_delta = false;

                // A fixed-array node whose re-encoded arcs outgrow the
                // assumed width is truncated and rewritten wider.
                'write_node: loop {
                    self.read_first_real_target_arc(node, &mut arc, &mut reader)?;

                    let use_arc_array = arc.bytes_per_arc != 0;
                    if use_arc_array {
                        if bytes_per_arc == 0 {
                            bytes_per_arc = arc.bytes_per_arc;
                        }
                        fst.bytes.write_byte(ARCS_AS_FIXED_ARRAY);
                        fst.bytes.write_vint(arc.num_arcs as u32);
                        fst.bytes.write_vint(bytes_per_arc as u32);
                    }

                    let mut max_bytes_per_arc = 0usize;
                    loop {
                        let arc_start_pos = fst.bytes.position();
                        node_arc_count += 1;

                        let mut flags = 0u8;
                        if arc.is_last() {
                            flags |= BIT_LAST_ARC;
                        }
                        if !use_arc_array && node != 1 && arc.target == node - 1 {
                            flags |= BIT_TARGET_NEXT;
                        }
                        if arc.is_final() {
                            flags |= BIT_FINAL_ARC;
                            if arc.next_final_output != self.no_output {
                                flags |= BIT_ARC_HAS_FINAL_OUTPUT;
                            }
                        } else {
                            debug_assert!(arc.next_final_output == self.no_output);
                        }
                        if !arc.target_has_arcs() {
                            flags |= BIT_STOP_NODE;
                        }
                        if arc.output != self.no_output {
                            flags |= BIT_ARC_HAS_OUTPUT;
                        }

                        let do_write_target =
                            arc.target_has_arcs() && flags & BIT_TARGET_NEXT == 0;
                        let mut abs_ptr = 0i64;
                        if do_write_target {
                            abs_ptr = match top_node_map.get(&arc.target) {
                                Some(&dense_id) => dense_id as i64,
                                None => {
                                    top_node_map.len() as i64
                                        + new_node_address.get(arc.target as usize) as i64
                                        + address_error
                                }
                            };
                            // Estimated delta: flag and label still unwritten.
                            let mut delta = new_node_address.get(arc.target as usize) as i64
                                + address_error
                                - fst.bytes.position()
                                - 2;
                            if delta < 0 {
                                any_neg_delta = true;
                                delta = 0;
                            }
                            if delta < abs_ptr {
                                flags |= BIT_TARGET_DELTA;
                            }
                        }

                        debug_assert!(flags != ARCS_AS_FIXED_ARRAY);
                        fst.bytes.write_byte(flags);
                        fst.input_type.write_label(&mut fst.bytes, arc.label);

                        if arc.output != self.no_output {
                            self.outputs.write(&arc.output, &mut fst.bytes)?;
                            if !retry {
                                fst.arc_with_output_count += 1;
                            }
                        }
                        if arc.next_final_output != self.no_output {
                            self.outputs
                                .write_final_output(&arc.next_final_output, &mut fst.bytes)?;
                        }

                        if do_write_target {
                            let mut delta = new_node_address.get(arc.target as usize) as i64
                                + address_error
                                - fst.bytes.position();
                            if delta < 0 {
                                any_neg_delta = true;
                                delta = 0;
                            }
                            if flags & BIT_TARGET_DELTA != 0 {
                                fst.bytes.write_vlong(delta as u64);
                            } else {
                                fst.bytes.write_vlong(abs_ptr as u64);
                            }
                        }

                        if use_arc_array {
                            let arc_bytes = (fst.bytes.position() - arc_start_pos) as usize;
                            max_bytes_per_arc = max_bytes_per_arc.max(arc_bytes);
                            // May move the cursor backwards if this arc
                            // outgrew the width; the retry below rewrites
                            // the whole node.
                            fst.bytes.skip_bytes(
                                arc_start_pos + bytes_per_arc as i64 - fst.bytes.position(),
                            );
                        }

                        if arc.is_last() {
                            break;
                        }
                        self.read_next_real_arc(&mut arc, &mut reader)?;
                    }

                    if use_arc_array {
                        if max_bytes_per_arc == bytes_per_arc
                            || (retry && max_bytes_per_arc <= bytes_per_arc)
                        {
                            break 'write_node;
                        }
                    } else {
                        break 'write_node;
                    }

                    bytes_per_arc = max_bytes_per_arc;
                    fst.bytes.truncate(address);
                    node_arc_count = 0;
                    retry = true;
                    any_neg_delta = false;
                }

                neg_delta |= any_neg_delta;
                fst.arc_count += node_arc_count;
            }

            debug!(
                pass,
                changed_count,
                bytes = fst.bytes.position(),
                "pack pass complete"
            );

            if !changed {
                // Nodes only point at already-emitted (higher-ordinal)
                // nodes, so a converged pass can have no negative deltas.
                debug_assert!(!neg_delta);
                break fst;
            }
        };

        let mut max_address = 0u64;
        for &node in top_node_map.keys() {
            max_address = max_address.max(new_node_address.get(node as usize));
        }
        let mut node_ref_to_address =
            PackedIntVec::new(top_node_map.len(), bytes_required(max_address));
        for (&node, &dense_id) in &top_node_map {
            node_ref_to_address.set(dense_id, new_node_address.get(node as usize));
        }
        fst.node_ref_to_address = Some(node_ref_to_address);

        fst.start_node = new_node_address.get(self.start_node as usize) as i64;
        if let Some(empty) = &self.empty_output {
            fst.set_empty_output(empty.clone())?;
        }

        debug_assert_eq!(fst.node_count, self.node_count);
        debug_assert_eq!(fst.arc_count, self.arc_count);
        debug_assert_eq!(fst.arc_with_output_count, self.arc_with_output_count);

        fst.bytes.finish();
        fst.cache_root_arcs()?;
        debug!(
            passes = pass,
            deref_nodes = top_node_map.len(),
            bytes = fst.bytes.position(),
            "packed automaton"
        );
        Ok(fst)
    }
}
