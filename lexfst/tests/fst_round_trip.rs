//! End-to-end properties of the automaton: round trips, cache and
//! binary-search agreement, acyclicity, pack equivalence, and save/load
//! idempotence.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lexfst::{
    Arc, Builder, BuilderOptions, Fst, FstError, InputType, PositiveIntOutputs, END_LABEL,
};

fn labels(s: &str) -> Vec<i32> {
    s.bytes().map(|b| b as i32).collect()
}

fn lookup(fst: &Fst<PositiveIntOutputs>, input: &[i32]) -> Option<u64> {
    let mut reader = fst.bytes_reader();
    let mut arc = Arc::new(0u64);
    fst.first_arc(&mut arc);
    let mut output = 0u64;
    for &label in input {
        let follow = arc.clone();
        if !fst
            .find_target_arc(label, &follow, &mut arc, &mut reader)
            .unwrap()
        {
            return None;
        }
        output += arc.output;
    }
    let follow = arc.clone();
    if fst
        .find_target_arc(END_LABEL, &follow, &mut arc, &mut reader)
        .unwrap()
    {
        Some(output + arc.output)
    } else {
        None
    }
}

fn lookup_str(fst: &Fst<PositiveIntOutputs>, input: &str) -> Option<u64> {
    lookup(fst, &labels(input))
}

fn build(words: &[(&str, u64)]) -> Fst<PositiveIntOutputs> {
    build_with(words, &BuilderOptions::default())
}

fn build_with(words: &[(&str, u64)], options: &BuilderOptions) -> Fst<PositiveIntOutputs> {
    let mut builder = Builder::with_options(InputType::Byte1, PositiveIntOutputs, options);
    for (word, output) in words {
        builder.add(&labels(word), *output).unwrap();
    }
    builder.finish().unwrap()
}

fn save_to_vec(fst: &Fst<PositiveIntOutputs>) -> Vec<u8> {
    let mut bytes = Vec::new();
    fst.save(&mut bytes).unwrap();
    bytes
}

/// Visit every reachable node, handing each node's address and its
/// enumerated arcs to `visit`.
fn for_each_node(fst: &Fst<PositiveIntOutputs>, mut visit: impl FnMut(i64, &[Arc<u64>])) {
    let mut reader = fst.bytes_reader();
    let mut first = Arc::new(0u64);
    fst.first_arc(&mut first);
    if first.target <= 0 {
        return;
    }
    let mut pending = vec![first.target];
    let mut seen = std::collections::HashSet::new();
    seen.insert(first.target);
    while let Some(node) = pending.pop() {
        let mut arc = Arc::new(0u64);
        fst.read_first_real_target_arc(node, &mut arc, &mut reader)
            .unwrap();
        let mut arcs = Vec::new();
        loop {
            arcs.push(arc.clone());
            if arc.target > 0 && seen.insert(arc.target) {
                pending.push(arc.target);
            }
            if arc.is_last() {
                break;
            }
            fst.read_next_real_arc(&mut arc, &mut reader).unwrap();
        }
        visit(node, &arcs);
    }
}

#[test]
fn test_literal_round_trip() {
    let fst = build(&[("car", 5), ("cart", 7), ("cat", 3)]);
    assert_eq!(lookup_str(&fst, "cat"), Some(3));
    assert_eq!(lookup_str(&fst, "car"), Some(5));
    assert_eq!(lookup_str(&fst, "cart"), Some(7));
    assert_eq!(lookup_str(&fst, "ca"), None);
    assert_eq!(lookup_str(&fst, "carts"), None);
    assert_eq!(lookup_str(&fst, ""), None);

    // The saved/loaded image answers identically.
    let loaded = Fst::load(&mut save_to_vec(&fst).as_slice(), PositiveIntOutputs).unwrap();
    assert_eq!(lookup_str(&loaded, "cat"), Some(3));
    assert_eq!(lookup_str(&loaded, "car"), Some(5));
    assert_eq!(lookup_str(&loaded, "cart"), Some(7));
    assert_eq!(lookup_str(&loaded, "ca"), None);
}

#[test]
fn test_single_entry_counters() {
    let fst = build(&[("a", 1)]);
    assert_eq!(fst.node_count(), 1);
    assert_eq!(fst.arc_count(), 1);
    assert_eq!(fst.arc_with_output_count(), 1);
    assert_eq!(lookup_str(&fst, "a"), Some(1));
}

#[test]
fn test_empty_input_only() {
    let mut builder = Builder::new(InputType::Byte1, PositiveIntOutputs);
    builder.add(&[], 42).unwrap();
    let fst = builder.finish().unwrap();

    assert_eq!(lookup_str(&fst, ""), Some(42));
    for b in 0..=255i32 {
        assert_eq!(lookup(&fst, &[b]), None, "byte {b}");
    }

    let loaded = Fst::load(&mut save_to_vec(&fst).as_slice(), PositiveIntOutputs).unwrap();
    assert_eq!(lookup_str(&loaded, ""), Some(42));
    assert_eq!(lookup_str(&loaded, "a"), None);
}

#[test]
fn test_fixed_array_root_binary_search() {
    // Eleven root arcs force the fixed-array layout at any depth; the
    // label range straddles the root-cache bound so lookups above 0x7F
    // take the binary search rather than the cache.
    let entries: Vec<(i32, u64)> = (120..131).map(|label| (label, label as u64)).collect();
    let mut builder = Builder::new(InputType::Byte1, PositiveIntOutputs);
    for &(label, output) in &entries {
        builder.add(&[label], output).unwrap();
    }
    let fst = builder.finish().unwrap();

    let mut reader = fst.bytes_reader();
    let mut first = Arc::new(0u64);
    fst.first_arc(&mut first);
    assert!(fst.is_expanded_target(&first, &mut reader).unwrap());

    for &(label, output) in &entries {
        assert_eq!(lookup(&fst, &[label]), Some(output), "label {label}");
    }
    assert_eq!(lookup(&fst, &[119]), None);
    assert_eq!(lookup(&fst, &[131]), None);
}

#[test]
fn test_binary_search_agrees_with_linear_scan() {
    // A gappy fan-out node at depth 1: fixed-array form, and being below
    // the root it is never served from the root-arc cache.
    let words = [
        ("xb", 2u64),
        ("xd", 4),
        ("xf", 6),
        ("xh", 8),
        ("xj", 10),
        ("xl", 12),
    ];
    let fst = build(&words);

    let mut reader = fst.bytes_reader();
    let mut first = Arc::new(0u64);
    fst.first_arc(&mut first);
    let mut x_arc = Arc::new(0u64);
    assert!(fst
        .find_target_arc(b'x' as i32, &first, &mut x_arc, &mut reader)
        .unwrap());
    assert!(fst.is_expanded_target(&x_arc, &mut reader).unwrap());

    // Collect the fan-out node's arcs by linear enumeration.
    let mut by_label = BTreeMap::new();
    for_each_node(&fst, |node, arcs| {
        if node == x_arc.target {
            for arc in arcs {
                by_label.insert(arc.label, (arc.output, arc.target));
            }
        }
    });
    assert_eq!(by_label.len(), words.len());

    for label in 0..=(b'l' as i32 + 1) {
        let mut arc = Arc::new(0u64);
        let found = fst
            .find_target_arc(label, &x_arc, &mut arc, &mut reader)
            .unwrap();
        match by_label.get(&label) {
            Some(&(output, target)) => {
                assert!(found, "label {label} must be found");
                assert_eq!(arc.output, output);
                assert_eq!(arc.target, target);
            }
            None => assert!(!found, "label {label} must be absent"),
        }
    }
}

#[test]
fn test_root_cache_agrees_with_scan() {
    let words = [("ant", 1u64), ("bat", 2), ("cow", 3), ("owl", 4), ("zebu", 5)];
    let fst = build(&words);

    let mut reader = fst.bytes_reader();
    let mut first = Arc::new(0u64);
    fst.first_arc(&mut first);

    // Ground truth: the root node's arcs read straight off the bytes.
    let mut by_label = BTreeMap::new();
    for_each_node(&fst, |node, arcs| {
        if node == first.target {
            for arc in arcs {
                by_label.insert(arc.label, arc.output);
            }
        }
    });

    // find_target_arc from the start node goes through the 128-entry
    // cache; every answer must match the scan.
    for label in 0..128i32 {
        let mut arc = Arc::new(0u64);
        let found = fst
            .find_target_arc(label, &first, &mut arc, &mut reader)
            .unwrap();
        match by_label.get(&label) {
            Some(&output) => {
                assert!(found, "label {label}");
                assert_eq!(arc.output, output, "label {label}");
            }
            None => assert!(!found, "label {label}"),
        }
    }
}

#[test]
fn test_acyclic_and_single_last_arc() {
    let words = [
        ("mop", 10u64),
        ("moth", 11),
        ("pop", 12),
        ("star", 13),
        ("stop", 14),
        ("top", 15),
    ];
    let fst = build(&words);

    let mut nodes = 0u64;
    for_each_node(&fst, |node, arcs| {
        nodes += 1;
        let last_count = arcs.iter().filter(|a| a.is_last()).count();
        assert_eq!(last_count, 1, "node {node} must have exactly one last arc");
        assert!(arcs.last().unwrap().is_last());
        for arc in arcs {
            assert!(
                arc.target <= 0 || arc.target < node,
                "arc target {} must precede source {node}",
                arc.target
            );
        }
    });
    assert_eq!(nodes, fst.node_count());
}

#[test]
fn test_save_idempotent() {
    let fst = build(&[("deep", 4), ("deeper", 6), ("deepest", 8), ("dig", 1)]);
    let image = save_to_vec(&fst);
    let loaded = Fst::load(&mut image.as_slice(), PositiveIntOutputs).unwrap();
    assert_eq!(save_to_vec(&loaded), image);
}

#[test]
fn test_save_idempotent_packed() {
    let options = BuilderOptions {
        will_pack: true,
        ..BuilderOptions::default()
    };
    let mut fst = build_with(&[("ab", 1), ("ac", 2), ("ad", 3)], &options);

    // An ordinal-addressed automaton must be packed before saving.
    let mut sink = Vec::new();
    assert!(matches!(
        fst.save(&mut sink),
        Err(FstError::IllegalState(_))
    ));

    let packed = fst.pack(1, 64).unwrap();
    let image = save_to_vec(&packed);
    let loaded = Fst::load(&mut image.as_slice(), PositiveIntOutputs).unwrap();
    assert!(loaded.is_packed());
    assert_eq!(save_to_vec(&loaded), image);
    assert_eq!(lookup_str(&loaded, "ac"), Some(2));
}

#[test]
fn test_pack_equivalence() {
    let words = [("ab", 1u64), ("ac", 2), ("ad", 3)];
    let options = BuilderOptions {
        will_pack: true,
        ..BuilderOptions::default()
    };
    let mut fst = build_with(&words, &options);
    let packed = fst.pack(1, 64).unwrap();

    assert_eq!(packed.node_count(), fst.node_count());
    assert_eq!(packed.arc_count(), fst.arc_count());
    for (word, output) in words {
        assert_eq!(lookup_str(&packed, word), Some(output));
    }
    assert_eq!(lookup_str(&packed, "ab "), None);
    assert_eq!(lookup_str(&packed, "b"), None);
}

#[test]
fn test_byte4_labels() {
    // Codepoint-sized labels take the vint label codec.
    let inputs: Vec<(Vec<i32>, u64)> = vec![
        (vec![65, 0x1F600], 7),
        (vec![65, 0x1F601], 9),
        (vec![0x2603], 3),
    ];
    let mut sorted = inputs.clone();
    sorted.sort();
    let mut builder = Builder::new(InputType::Byte4, PositiveIntOutputs);
    for (input, output) in &sorted {
        builder.add(input, *output).unwrap();
    }
    let fst = builder.finish().unwrap();

    for (input, output) in &inputs {
        assert_eq!(lookup(&fst, input), Some(*output));
    }
    assert_eq!(lookup(&fst, &[65]), None);
    assert_eq!(lookup(&fst, &[0x1F600]), None);

    let loaded = Fst::load(&mut save_to_vec(&fst).as_slice(), PositiveIntOutputs).unwrap();
    for (input, output) in &inputs {
        assert_eq!(lookup(&loaded, input), Some(*output));
    }
}

#[test]
fn test_byte2_labels() {
    let inputs: Vec<(Vec<i32>, u64)> = vec![
        (vec![7, 300], 1),
        (vec![7, 40_000], 2),
        (vec![65_535], 3),
    ];
    let mut builder = Builder::new(InputType::Byte2, PositiveIntOutputs);
    for (input, output) in &inputs {
        builder.add(input, *output).unwrap();
    }
    let fst = builder.finish().unwrap();
    for (input, output) in &inputs {
        assert_eq!(lookup(&fst, input), Some(*output));
    }
    assert_eq!(lookup(&fst, &[7]), None);
}

#[test]
fn test_load_version3_int_targets() {
    // Version 3 encodes unpacked arc targets as fixed-width big-endian
    // 32-bit ints. Hand-build an image accepting "ab" and "cb":
    //   node @2:  {b: final, stop}
    //   root @14: {a -> 2 (int target), c -> 2 (int target)}
    // Arc bytes are per-node reversed, as the builder would emit them.
    let arc_bytes: Vec<u8> = vec![
        0,    // pad: address 0 is reserved
        b'b', 0x0B, // node @2, reversed: [flags FINAL|LAST|STOP, 'b']
        2, 0, 0, 0, b'c', 0x02, // root arc c, reversed: [flags LAST, 'c', target int 2]
        2, 0, 0, 0, b'a', 0x00, // root arc a, reversed: [flags 0, 'a', target int 2]
    ];
    let mut image = Vec::new();
    image.extend_from_slice(b"FST");
    image.extend_from_slice(&3i32.to_be_bytes()); // version
    image.push(0); // not packed
    image.push(0); // no empty output
    image.push(0); // input type: byte labels
    image.push(14); // start node (vlong)
    image.push(2); // node count
    image.push(3); // arc count
    image.push(0); // arcs with output
    image.push(arc_bytes.len() as u8); // num bytes (vlong)
    image.extend_from_slice(&arc_bytes);

    let fst = Fst::load(&mut image.as_slice(), PositiveIntOutputs).unwrap();
    assert_eq!(fst.node_count(), 2);
    assert_eq!(lookup_str(&fst, "ab"), Some(0));
    assert_eq!(lookup_str(&fst, "cb"), Some(0));
    assert_eq!(lookup_str(&fst, "a"), None);
    assert_eq!(lookup_str(&fst, "b"), None);

    // Re-saving keeps the version-3 image byte-identical.
    assert_eq!(save_to_vec(&fst), image);
}

#[test]
fn test_arc_enumeration_operations() {
    let fst = build(&[("car", 5), ("cart", 7), ("cat", 3)]);
    let mut reader = fst.bytes_reader();

    // Walk to the state after "ca".
    let mut arc = Arc::new(0u64);
    fst.first_arc(&mut arc);
    for label in labels("ca") {
        let follow = arc.clone();
        assert!(fst
            .find_target_arc(label, &follow, &mut arc, &mut reader)
            .unwrap());
    }
    let ca_state = arc.clone();

    // "ca" is not accepted, so the first arc is a real one.
    let mut cursor = Arc::new(0u64);
    fst.read_first_target_arc(&ca_state, &mut cursor, &mut reader)
        .unwrap();
    assert_eq!(cursor.label, b'r' as i32);
    assert!(!cursor.is_last());

    // Peeking must not move the cursor.
    let peeked = fst.read_next_arc_label(&cursor, &mut reader).unwrap();
    assert_eq!(peeked, b't' as i32);
    assert_eq!(cursor.label, b'r' as i32);

    fst.read_next_arc(&mut cursor, &mut reader).unwrap();
    assert_eq!(cursor.label, b't' as i32);
    assert!(cursor.is_last());

    // read_last_target_arc lands on the same arc directly.
    let mut last = Arc::new(0u64);
    fst.read_last_target_arc(&ca_state, &mut last, &mut reader)
        .unwrap();
    assert_eq!(last.label, b't' as i32);
    assert!(last.is_last());

    // A final follow with onward arcs yields the synthetic arc first,
    // and read_next_arc re-enters the real arcs.
    let r_arc = {
        let mut arc = Arc::new(0u64);
        fst.first_arc(&mut arc);
        for label in labels("car") {
            let follow = arc.clone();
            assert!(fst
                .find_target_arc(label, &follow, &mut arc, &mut reader)
                .unwrap());
        }
        arc
    };
    assert!(r_arc.is_final());
    let mut synth = Arc::new(0u64);
    fst.read_first_target_arc(&r_arc, &mut synth, &mut reader)
        .unwrap();
    assert_eq!(synth.label, END_LABEL);
    assert!(!synth.is_last());
    assert_eq!(fst.read_next_arc_label(&synth, &mut reader).unwrap(), b't' as i32);
    fst.read_next_arc(&mut synth, &mut reader).unwrap();
    assert_eq!(synth.label, b't' as i32);

    // A synthetic arc at a dead end is last; advancing past it is misuse.
    let t_arc = {
        let mut arc = Arc::new(0u64);
        fst.first_arc(&mut arc);
        for label in labels("cart") {
            let follow = arc.clone();
            assert!(fst
                .find_target_arc(label, &follow, &mut arc, &mut reader)
                .unwrap());
        }
        arc
    };
    let mut end = Arc::new(0u64);
    fst.read_first_target_arc(&t_arc, &mut end, &mut reader)
        .unwrap();
    assert_eq!(end.label, END_LABEL);
    assert!(end.is_last());
    assert!(matches!(
        fst.read_next_arc(&mut end, &mut reader),
        Err(FstError::IllegalState(_))
    ));
}

#[test]
fn test_randomized_round_trip() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut entries: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
    while entries.len() < 500 {
        let len = rng.gen_range(1..=12);
        let word: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect();
        let output = rng.gen_range(0..1_000_000u64);
        entries.entry(word).or_insert(output);
    }

    let options = BuilderOptions {
        will_pack: true,
        ..BuilderOptions::default()
    };
    let mut builder = Builder::with_options(InputType::Byte1, PositiveIntOutputs, &options);
    for (word, output) in &entries {
        let input: Vec<i32> = word.iter().map(|&b| b as i32).collect();
        builder.add(&input, *output).unwrap();
    }
    let mut fst = builder.finish().unwrap();

    let check = |fst: &Fst<PositiveIntOutputs>, what: &str| {
        for (word, output) in &entries {
            let input: Vec<i32> = word.iter().map(|&b| b as i32).collect();
            assert_eq!(lookup(fst, &input), Some(*output), "{what}: {word:?}");
        }
        // Probe misses: prefixes and mutated words.
        let mut rng = StdRng::seed_from_u64(7);
        for (word, _) in entries.iter().take(100) {
            let mut probe = word.clone();
            probe.push(rng.gen_range(b'g'..=b'z'));
            assert!(
                !entries.contains_key(&probe),
                "probe unexpectedly present"
            );
            let input: Vec<i32> = probe.iter().map(|&b| b as i32).collect();
            assert_eq!(lookup(fst, &input), None, "{what}: miss {probe:?}");
        }
    };

    check(&fst, "built");

    let packed = fst.pack(2, 256).unwrap();
    assert_eq!(packed.node_count(), fst.node_count());
    assert_eq!(packed.arc_count(), fst.arc_count());
    assert_eq!(packed.arc_with_output_count(), fst.arc_with_output_count());
    check(&packed, "packed");

    let image = save_to_vec(&packed);
    let loaded = Fst::load(&mut image.as_slice(), PositiveIntOutputs).unwrap();
    check(&loaded, "loaded packed");
    assert_eq!(save_to_vec(&loaded), image);
}
