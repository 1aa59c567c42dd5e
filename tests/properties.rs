//! # Conformance Properties
//!
//! The invariants a correct store must keep: reopen roundtrips, header
//! alternation, allocator monotonicity, proxy quarantine, interning
//! idempotence, skip-list ordering, and graph incidence. Where a
//! property is about the on-disk image, the file is inspected directly.

use pindb::{FlushMode, OrderSpec, Store, StoreError, StoreOptions};
use tempfile::tempdir;

const HEADER_STATUS_AT: usize = 32;
const HEADER_REVISION_AT: usize = 40;
const SLOT1_AT: usize = 4096;

fn read_slot_status(image: &[u8], slot: usize) -> u8 {
    image[slot * SLOT1_AT + HEADER_STATUS_AT]
}

fn read_slot_revision(image: &[u8], slot: usize) -> u64 {
    let at = slot * SLOT1_AT + HEADER_REVISION_AT;
    u64::from_le_bytes(image[at..at + 8].try_into().unwrap())
}

mod reopen_roundtrip {
    use super::*;

    #[test]
    fn every_value_reachable_from_root_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("roundtrip.pin");

        let options = StoreOptions::new().file_size(1 << 16).populate(|schema| {
            schema.structure("Agent", &[("name", "bytes"), ("age", "int")])?;
            schema.list_of("Agents", "Agent")?;
            schema.structure(
                "Root",
                &[("agents", "Agents"), ("motto", "bytes"), ("count", "int")],
            )
        });

        {
            let store = Store::open(&path, options).unwrap();
            let root = store.root().unwrap();
            root.set_field("motto", "shaken, not stirred").unwrap();
            root.set_field("count", 7).unwrap();

            let agents_value = store.new_instance("Agents").unwrap();
            root.set_field("agents", &agents_value).unwrap();
            let agents = agents_value.as_list().unwrap();
            for (name, age) in [("bond", 37i64), ("m", 61)] {
                let agent = store.new_instance("Agent").unwrap();
                agent.set_field("name", name).unwrap();
                agent.set_field("age", age).unwrap();
                agents.insert(&agent).unwrap();
            }
            drop(agents);
            drop(agents_value);
            store.close().unwrap();
        }

        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let root = store.root().unwrap();

        assert_eq!(
            root.field("motto").unwrap().unwrap().bytes().unwrap(),
            b"shaken, not stirred"
        );
        assert_eq!(
            root.field("count").unwrap().unwrap().get_int().unwrap(),
            7
        );

        let agents = root.field("agents").unwrap().unwrap().as_list().unwrap();
        let names: Vec<Vec<u8>> = agents
            .iter()
            .unwrap()
            .into_iter()
            .map(|a| a.unwrap().field("name").unwrap().unwrap().bytes().unwrap())
            .collect();
        // insert() prepends, so the last inserted agent iterates first.
        assert_eq!(names, vec![b"m".to_vec(), b"bond".to_vec()]);

        drop(agents);
        store.close().unwrap();
    }
}

mod header_alternation {
    use super::*;

    fn options() -> StoreOptions {
        StoreOptions::new()
            .file_size(1 << 14)
            .populate(|schema| schema.structure("Root", &[("count", "int")]))
    }

    #[test]
    fn revision_strictly_increases_on_every_flush() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("rev.pin"), options()).unwrap();

        let first = store.revision().unwrap();
        store.flush(FlushMode::Sync).unwrap();
        let second = store.revision().unwrap();
        store.flush(FlushMode::Sync).unwrap();
        let third = store.revision().unwrap();

        assert!(second > first);
        assert!(third > second);
        store.close().unwrap();
    }

    #[test]
    fn after_close_the_current_header_is_unambiguous() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("headers.pin");

        let store = Store::open(&path, options()).unwrap();
        store.root().unwrap().set_field("count", 1).unwrap();
        store.flush(FlushMode::Sync).unwrap();
        store.root().unwrap().set_field("count", 2).unwrap();
        store.close().unwrap();
        drop(store);

        let image = std::fs::read(&path).unwrap();
        let statuses = [read_slot_status(&image, 0), read_slot_status(&image, 1)];
        let clean: Vec<usize> = (0..2).filter(|&s| statuses[s] == b'C').collect();

        assert!(!clean.is_empty(), "at least one header slot must be clean");
        if clean.len() == 2 {
            assert_ne!(
                read_slot_revision(&image, 0),
                read_slot_revision(&image, 1),
                "two clean slots must disagree on revision"
            );
        }

        // Alternation: committing again flips which slot carries the
        // highest revision.
        let highest_before = (0..2)
            .filter(|&s| statuses[s] == b'C')
            .max_by_key(|&s| read_slot_revision(&image, s))
            .unwrap();

        // One further commit (the close) flips the current slot.
        let store = Store::open(&path, StoreOptions::new()).unwrap();
        store.close().unwrap();
        drop(store);

        let image = std::fs::read(&path).unwrap();
        let highest_after = (0..2)
            .filter(|&s| read_slot_status(&image, s) == b'C')
            .max_by_key(|&s| read_slot_revision(&image, s))
            .unwrap();
        assert_ne!(
            highest_before, highest_after,
            "the current slot must alternate across commits"
        );
    }
}

mod allocator_monotonicity {
    use super::*;

    #[test]
    fn free_offset_never_decreases_and_allocations_are_disjoint() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("alloc.pin"),
            StoreOptions::new()
                .file_size(1 << 14)
                .populate(|schema| schema.structure("Root", &[("count", "int")])),
        )
        .unwrap();

        let mark0 = store.free_offset().unwrap();
        let a = store.new_bytes(b"first allocation").unwrap();
        let mark1 = store.free_offset().unwrap();
        let b = store.new_bytes(b"second allocation").unwrap();
        let mark2 = store.free_offset().unwrap();

        assert!(mark1 > mark0);
        assert!(mark2 > mark1);

        // Disjoint ranges: the second allocation starts past the first
        // one's last byte (4-byte length prefix + payload).
        assert!(a.offset() + 4 + 16 <= b.offset());

        drop(a);
        drop(b);
        store.close().unwrap();
    }

    #[test]
    fn exhausting_the_file_fails_full_without_partial_state() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("full.pin"),
            StoreOptions::new()
                .file_size(1)
                .populate(|schema| schema.structure("Root", &[("name", "bytes")])),
        )
        .unwrap();

        let huge = vec![0u8; 64 * 1024];
        let err = store.new_bytes(&huge).unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Full)));

        // The store remains usable.
        let small = store.new_bytes(b"still fits").unwrap();
        assert_eq!(small.bytes().unwrap(), b"still fits");
        drop(small);
        store.close().unwrap();
    }
}

mod proxy_quarantine {
    use super::*;

    #[test]
    fn any_user_proxy_blocks_close_until_dropped() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("quarantine.pin"),
            StoreOptions::new()
                .file_size(1 << 14)
                .populate(|schema| schema.structure("Root", &[("name", "bytes")])),
        )
        .unwrap();

        let holder = store.new_bytes(b"outstanding").unwrap();
        assert_eq!(store.live_proxy_count(), 1);

        let err = store.close().unwrap_err();
        assert!(matches!(
            StoreError::of(&err),
            Some(StoreError::Proxies(1))
        ));

        // Still open and usable after the refused close.
        assert!(store.revision().is_ok());

        drop(holder);
        store.close().unwrap();
    }
}

mod interning_idempotence {
    use super::*;

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        haystack
            .windows(needle.len())
            .filter(|window| *window == needle)
            .count()
    }

    #[test]
    fn interned_bytes_appear_exactly_once_in_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("intern.pin");
        let needle = b"a-byte-sequence-that-appears-nowhere-else";

        {
            let store = Store::open(
                &path,
                StoreOptions::new()
                    .file_size(1 << 14)
                    .populate(|schema| schema.structure("Root", &[("name", "bytes")])),
            )
            .unwrap();

            let first = store.intern(needle).unwrap();
            let second = store.intern(needle).unwrap();
            let third = store.intern(needle).unwrap();

            assert_eq!(first.offset(), second.offset());
            assert_eq!(second.offset(), third.offset());

            drop(first);
            drop(second);
            drop(third);
            store.close().unwrap();
        }

        let image = std::fs::read(&path).unwrap();
        assert_eq!(count_occurrences(&image, needle), 1);
    }
}

mod skip_list_order {
    use super::*;

    #[test]
    fn many_random_inserts_iterate_nondecreasing() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("order.pin"),
            StoreOptions::new().file_size(1 << 18).populate(|schema| {
                schema.skip_list_of("Ints", "int", OrderSpec::Natural)?;
                schema.structure("Root", &[("ints", "Ints")])
            }),
        )
        .unwrap();

        let list_value = store.new_instance("Ints").unwrap();
        store
            .root()
            .unwrap()
            .set_field("ints", &list_value)
            .unwrap();
        let ints = list_value.as_skip_list().unwrap();

        // A fixed pseudo-random sequence with repeats.
        let mut x: i64 = 0x243F6A8885A308D3u64 as i64;
        let mut inserted = Vec::new();
        for _ in 0..200 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let v = x % 50;
            ints.insert(v).unwrap();
            inserted.push(v);
        }

        let iterated: Vec<i64> = ints
            .iter()
            .unwrap()
            .into_iter()
            .map(|v| v.get_int().unwrap())
            .collect();

        inserted.sort();
        assert_eq!(iterated, inserted);

        drop(ints);
        drop(list_value);
        store.close().unwrap();
    }
}

mod graph_incidence {
    use super::*;

    #[test]
    fn every_edge_is_on_exactly_its_two_incidence_lists() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("incidence.pin"),
            StoreOptions::new().file_size(1 << 16).populate(|schema| {
                schema.structure("City", &[("name", "bytes")])?;
                schema.node_of("CityNode", "City")?;
                schema.edge("Road", "int", "CityNode", "CityNode")?;
                schema.list_of("Cities", "CityNode")?;
                schema.structure("Root", &[("cities", "Cities")])
            }),
        )
        .unwrap();

        let cities_value = store.new_instance("Cities").unwrap();
        store
            .root()
            .unwrap()
            .set_field("cities", &cities_value)
            .unwrap();
        let cities = cities_value.as_list().unwrap();

        let mut nodes = Vec::new();
        for name in ["london", "paris", "rome"] {
            let city = store.new_instance("City").unwrap();
            city.set_field("name", name).unwrap();
            let node = store.new_node("CityNode", &city).unwrap();
            cities.append(node.proxy()).unwrap();
            nodes.push(node);
        }

        let roads = [
            store.new_edge("Road", &nodes[0], &nodes[1], 340).unwrap(),
            store.new_edge("Road", &nodes[1], &nodes[2], 1100).unwrap(),
            store.new_edge("Road", &nodes[0], &nodes[2], 1400).unwrap(),
        ];
        let endpoints = [(0usize, 1usize), (1, 2), (0, 2)];

        for (road, (from, to)) in roads.iter().zip(endpoints) {
            let out = nodes[from].out_edges("Road").unwrap();
            assert!(out.iter().any(|e| e.is_same_as(road.proxy())));

            let inbound = nodes[to].in_edges("Road").unwrap();
            assert!(inbound.iter().any(|e| e.is_same_as(road.proxy())));

            // The edge appears on no other node's lists.
            for (i, node) in nodes.iter().enumerate() {
                if i != from {
                    assert!(!node
                        .out_edges("Road")
                        .unwrap()
                        .iter()
                        .any(|e| e.is_same_as(road.proxy())));
                }
                if i != to {
                    assert!(!node
                        .in_edges("Road")
                        .unwrap()
                        .iter()
                        .any(|e| e.is_same_as(road.proxy())));
                }
            }
        }

        // Most-recently-inserted first on shared lists.
        let out_of_london = nodes[0].out_edges("Road").unwrap();
        assert_eq!(out_of_london.len(), 2);
        assert!(out_of_london[0].is_same_as(roads[2].proxy()));
        assert!(out_of_london[1].is_same_as(roads[0].proxy()));

        drop(roads);
        drop(nodes);
        drop(cities);
        drop(cities_value);
        store.close().unwrap();
    }
}

mod post_open_definition {
    use super::*;
    use pindb::Descriptor;

    #[test]
    fn a_type_defined_on_an_open_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("define.pin");

        {
            let store = Store::open(
                &path,
                StoreOptions::new()
                    .file_size(1 << 14)
                    .populate(|schema| schema.structure("Root", &[("name", "bytes")])),
            )
            .unwrap();

            store
                .define(Descriptor::Struct {
                    name: "Gadget".to_owned(),
                    bases: vec![],
                    volatile_bases: vec![],
                    fields: vec![("label".to_owned(), "bytes".to_owned())],
                })
                .unwrap();

            let gadget = store.new_instance("Gadget").unwrap();
            gadget.set_field("label", "jetpack").unwrap();
            store.root().unwrap().set_field("name", "Q branch").unwrap();
            drop(gadget);
            store.close().unwrap();
        }

        let store = Store::open(&path, StoreOptions::new()).unwrap();
        assert!(store.type_of("Gadget").is_ok());

        // The reloaded type is fully usable.
        let gadget = store.new_instance("Gadget").unwrap();
        gadget.set_field("label", "exploding pen").unwrap();
        assert_eq!(
            gadget.field("label").unwrap().unwrap().bytes().unwrap(),
            b"exploding pen"
        );
        drop(gadget);
        store.close().unwrap();
    }

    #[test]
    fn descriptors_referencing_unknown_types_are_rejected() {
        let dir = tempdir().unwrap();
        let store = Store::open(
            dir.path().join("bad_define.pin"),
            StoreOptions::new()
                .file_size(1 << 14)
                .populate(|schema| schema.structure("Root", &[])),
        )
        .unwrap();

        let err = store
            .define(Descriptor::List {
                name: "Ghosts".to_owned(),
                elem: "Ghost".to_owned(),
            })
            .unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Value(_))));

        store.close().unwrap();
    }
}

mod buffers {
    use super::*;

    #[test]
    fn buffer_roundtrips_with_shape_and_strides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buffer.pin");

        {
            let store = Store::open(
                &path,
                StoreOptions::new().file_size(1 << 14).populate(|schema| {
                    schema.buffer("Snapshot")?;
                    schema.structure("Root", &[("snap", "Snapshot")])
                }),
            )
            .unwrap();

            let data: Vec<u8> = (0..24).collect();
            let snap = store.new_buffer("Snapshot", "B", 1, &[4, 6], &data).unwrap();
            store
                .root()
                .unwrap()
                .set_field("snap", snap.proxy())
                .unwrap();

            assert_eq!(snap.shape().unwrap(), vec![4, 6]);
            assert_eq!(snap.strides().unwrap(), vec![6, 1]);
            assert_eq!(snap.format().unwrap(), b"B");

            // The view is read-write.
            snap.write_at(0, &[99]).unwrap();
            drop(snap);
            store.close().unwrap();
        }

        let store = Store::open(&path, StoreOptions::new()).unwrap();
        let snap = store
            .root()
            .unwrap()
            .field("snap")
            .unwrap()
            .unwrap()
            .as_buffer()
            .unwrap();

        let bytes = snap.bytes().unwrap();
        assert_eq!(bytes[0], 99);
        assert_eq!(bytes[1], 1);
        assert_eq!(bytes.len(), 24);

        // Only the buffer's own C-contiguous layout can be served.
        assert!(snap.bytes_strided(&[6, 1]).is_ok());
        let err = snap.bytes_strided(&[1, 4]).unwrap_err();
        assert!(matches!(StoreError::of(&err), Some(StoreError::Value(_))));

        drop(snap);
        store.close().unwrap();
    }
}
