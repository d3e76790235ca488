use std::sync::Arc;

use crate::placement::scripted_placement::ScriptedPlacement;
use crate::segment::SegmentBackend;

use self::format::init_logging;

use super::*;


const NODES: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

fn directory() -> Directory<ScriptedPlacement> {
    Directory::new(ScriptedPlacement::new(&NODES))
}

fn names(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}{i}")).collect()
}

/// `(capacity, used, size, offset)` of a variable.
fn sizes(dir: &Directory<ScriptedPlacement>, name: &str) -> (usize, usize, usize, usize) {
    let loc = dir.find_verbose(name).unwrap();
    (loc.block_capacity, loc.block_used, loc.size, loc.offset)
}

#[test]
fn test_1() {
    let _guard = init_logging();
    let mut dir = directory();

    dir.allocate(&names("block", 10), 1024).unwrap();
    dir.allocate(&names("_block", 5), 2048).unwrap();

    let blocks: Vec<_> = dir.list_blocks().into_iter().map(|(_, name)| name).collect();
    assert_eq!(blocks.len(), 15);
    for name in names("block", 10).iter().chain(&names("_block", 5)) {
        assert!(blocks.contains(name), "{name} should be listed.");
    }

    let verbose = dir.list_blocks_verbose();
    assert_eq!(verbose.len(), 15);
    for summary in &verbose {
        let expected = match summary.name.starts_with('_') {
            true => 2048,
            false => 1024,
        };
        assert_eq!((summary.capacity, summary.used), (expected, 0));
    }
    assert_eq!(dir.placement().segments.live().len(), 15);
    assert_eq!(dir.len(), 15);

    dir.clear().unwrap();
    assert!(dir.list_blocks().is_empty());
    assert!(dir.is_empty());
    assert!(dir.placement().segments.is_empty());
}

#[test]
fn test_2() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 10), 1024).unwrap();

    assert!(matches!(dir.find("x"), Err(Error::NotFound(_))));

    dir.insert("x", 4).unwrap();
    dir.find("x").unwrap();
    assert_eq!(sizes(&dir, "x"), (1024, 4, 4, 0));

    assert!(matches!(dir.find("y"), Err(Error::NotFound(_))));

    dir.insert("y", 8).unwrap();
    assert_eq!(sizes(&dir, "x"), (1024, 12, 4, 0));
    assert_eq!(sizes(&dir, "y"), (1024, 12, 8, 4));

    assert!(dir.find("p").is_err());
    assert!(dir.find("q").is_err());

    assert!(matches!(
        dir.insert("z", 2048),
        Err(Error::OutOfSpace { size: 2048, .. })
    ));
    assert!(dir.find("z").is_err());

    dir.clear().unwrap();

    dir.allocate(&["block0"], 1024).unwrap();
    dir.insert("x", 4).unwrap();
    dir.insert("y", 8).unwrap();
    assert!(matches!(
        dir.insert("z", 1013),
        Err(Error::OutOfSpace { .. })
    ));
}

#[test]
fn test_3() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 10), 1024).unwrap();

    dir.insert("x", 4).unwrap();
    assert_eq!(sizes(&dir, "x"), (1024, 4, 4, 0));

    assert_eq!(dir.remove("x"), Some(Variable { size: 4, offset: 0 }));
    assert!(matches!(dir.find("x"), Err(Error::NotFound(_))));
    assert!(dir.list_blocks_verbose().iter().all(|b| b.used == 0));

    // Offsets keep growing after a removal.
    dir.insert("x", 4).unwrap();
    dir.insert("y", 8).unwrap();
    assert_eq!(sizes(&dir, "x"), (1024, 12, 4, 4));
    assert_eq!(sizes(&dir, "y"), (1024, 12, 8, 8));

    dir.remove("x");
    assert_eq!(sizes(&dir, "y"), (1024, 8, 8, 8));
    assert!(dir.find("x").is_err());

    dir.remove("y");
    assert!(dir.find("y").is_err());

    // Removing what isn't there is fine.
    assert_eq!(dir.remove("y"), None);
    assert_eq!(dir.remove("never"), None);
}

#[test]
fn test_4() {
    let _guard = init_logging();
    let mut dir = directory();

    assert!(matches!(dir.find("x"), Err(Error::NotFound(_))));
    assert!(dir.find_verbose("x").is_err());
    assert_eq!(dir.remove("x"), None);
    assert!(matches!(
        dir.insert("x", 1),
        Err(Error::OutOfSpace { size: 1, .. })
    ));
    assert!(dir.nodes().is_empty());
    assert!(dir.list_blocks().is_empty());

    dir.clear().unwrap();
    dir.clear().unwrap();
    assert!(dir.placement().submitted.is_empty(), "Nothing should reach the workers.");
}

#[test]
fn test_5() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 7), 64).unwrap();
    assert_eq!(dir.placement().submitted.len(), 7);

    dir.clear().unwrap();
    let teardowns = &dir.placement().submitted[7..];
    assert_eq!(teardowns.len(), NODES.len(), "One teardown task per node.");

    let mut destroyed: Vec<_> = teardowns
        .iter()
        .flat_map(|(_, task)| match task {
            Task::Destroy { names } => names.clone(),
            other => panic!("unexpected task {other:?}"),
        })
        .collect();
    destroyed.sort();
    let mut expected = names("block", 7);
    expected.sort();
    assert_eq!(destroyed, expected);

    // Blocks are destroyed on the node that holds them.
    for (node, task) in teardowns {
        let Task::Destroy { names } = task else { unreachable!() };
        let i: usize = names[0].trim_start_matches("block").parse().unwrap();
        assert_eq!(node.as_str(), NODES[i % NODES.len()]);
    }

    dir.clear().unwrap();
    assert_eq!(dir.placement().submitted.len(), 7 + NODES.len());
}

#[test]
fn test_6() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&["a", "b"], 64).unwrap();

    assert!(matches!(
        dir.allocate(&["c", "a"], 64),
        Err(Error::DuplicateBlock(n)) if n == "a"
    ));
    assert!(matches!(
        dir.allocate(&["c", "d", "c"], 64),
        Err(Error::DuplicateBlock(n)) if n == "c"
    ));
    assert!(matches!(dir.allocate(&["c"], 0), Err(Error::InvalidSize)));
    assert_eq!(dir.placement().submitted.len(), 2, "Rejected before any remote work.");

    dir.allocate::<&str>(&[], 64).unwrap();
    assert_eq!(dir.len(), 2);
}

#[test]
fn test_7() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.placement_mut().fail_on = Some(1);

    assert!(matches!(
        dir.allocate(&names("block", 3), 64),
        Err(Error::Placement(PlacementError::WorkerLost(_)))
    ));
    assert!(dir.list_blocks().is_empty());
    // Orphans of the failed batch.
    assert_eq!(dir.placement().segments.live(), vec!["block0", "block2"]);
    assert_eq!(dir.placement().outstanding(), 0);
}

#[test]
fn test_8() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 3), 16).unwrap();
    dir.insert("a", 10).unwrap();
    dir.insert("b", 10).unwrap();
    dir.insert("c", 6).unwrap();

    assert_eq!(dir.find("a").unwrap(), (NodeId::from(NODES[0]), "block0".to_owned()));
    assert_eq!(dir.find("b").unwrap(), (NodeId::from(NODES[1]), "block1".to_owned()));
    // First fit, not best fit.
    assert_eq!(dir.find("c").unwrap(), (NodeId::from(NODES[0]), "block0".to_owned()));
    assert_eq!(sizes(&dir, "c"), (16, 16, 6, 10));

    assert!(matches!(dir.insert("a", 1), Err(Error::VariableExists(_))));
    assert_eq!(dir.block("block0").unwrap().used(), 16);
}

#[test]
fn test_9() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 4), 32).unwrap();
    dir.insert("x", 8).unwrap();
    dir.insert("y", 30).unwrap();
    // block3 shares the first node with block0, so it is visited before block1.
    assert_eq!(dir.find("y").unwrap().1, "block3");

    let released = dir.release("block0").unwrap();
    assert_eq!(released.name(), "block0");
    assert!(released.contains("x"));
    assert!(matches!(dir.find("x"), Err(Error::NotFound(_))));
    assert_eq!(dir.find("y").unwrap().1, "block3");
    assert_eq!(dir.len(), 3);
    assert!(!dir.placement().segments.live().contains(&"block0".to_owned()));
    assert_eq!(dir.nodes()[0].as_str(), NODES[0]);

    dir.release("block3").unwrap();
    assert!(dir.find("y").is_err());
    assert_eq!(
        dir.nodes(),
        vec![NodeId::from(NODES[1]), NodeId::from(NODES[2])]
    );

    assert!(matches!(dir.release("block0"), Err(Error::UnknownBlock(_))));

    // Released names can be used again.
    dir.insert("x", 2).unwrap();
    assert_eq!(dir.find("x").unwrap().1, "block1");
    dir.allocate(&["block0"], 32).unwrap();
    assert_eq!(dir.len(), 3);
}

#[test]
fn test_10() {
    let _guard = init_logging();
    let mut dir = directory();
    let segments = Arc::clone(&dir.placement().segments);
    dir.allocate(&names("block", 5), 128).unwrap();
    dir.insert("x", 4).unwrap();
    assert_eq!(segments.live().len(), 5);

    drop(dir);
    assert!(segments.is_empty());
}

#[test]
fn test_11() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 3), 64).unwrap();
    dir.insert("x", 4).unwrap();

    // The second of three teardown tasks fails.
    let next = dir.placement().submitted.len() as u64;
    dir.placement_mut().fail_on = Some(next + 1);
    assert!(dir.clear().is_err());
    assert_eq!(dir.len(), 3, "State is kept for a retry.");
    assert_eq!(sizes(&dir, "x"), (64, 4, 4, 0));
    assert_eq!(dir.placement().outstanding(), 0);

    dir.placement_mut().fail_on = None;
    dir.clear().unwrap();
    assert!(dir.is_empty());
    assert!(dir.placement().segments.is_empty());
}

#[test]
fn test_12() {
    let _guard = init_logging();
    let config = DirectoryConfig::with_policy(CapacityPolicy::BumpCursor);
    let mut dir = Directory::with_config(ScriptedPlacement::new(&NODES), config);
    assert_eq!(dir.config().policy, CapacityPolicy::BumpCursor);

    dir.allocate(&["only"], 16).unwrap();
    dir.insert("x", 12).unwrap();
    dir.remove("x");
    assert!(matches!(dir.insert("y", 8), Err(Error::OutOfSpace { .. })));

    // Same sequence with the default policy starts a new generation.
    let mut dir = directory();
    dir.allocate(&["only"], 16).unwrap();
    dir.insert("x", 12).unwrap();
    dir.remove("x");
    assert_eq!(dir.insert("y", 8).unwrap(), 0);
    assert_eq!(dir.block("only").unwrap().policy(), CapacityPolicy::ReclaimOnRemove);
}

#[test]
fn test_13() {
    let _guard = init_logging();
    let mut dir = Directory::new(ScriptedPlacement::new(&["solo"]));
    dir.allocate(&names("block", 3), 64).unwrap();
    assert_eq!(dir.nodes(), vec![NodeId::from("solo")]);

    // A segment the directory doesn't know about still blocks the name.
    dir.placement().segments.create("taken", 8).unwrap();
    assert!(matches!(
        dir.allocate(&["taken"], 64),
        Err(Error::Placement(PlacementError::AlreadyExists(_)))
    ));
    assert!(dir.block("taken").is_none());
}

#[test]
fn test_14() {
    let _guard = init_logging();
    let mut dir = directory();
    assert!(matches!(dir.insert("x", 0), Err(Error::InvalidSize)));
    dir.allocate(&["a"], 8).unwrap();
    assert!(matches!(dir.insert("x", 0), Err(Error::InvalidSize)));
    assert_eq!(dir.insert("x", 8).unwrap(), 0);
    assert!(matches!(dir.insert("y", 1), Err(Error::OutOfSpace { .. })));
}

#[test]
fn test_15() {
    let _guard = init_logging();
    let mut dir = directory();
    // The second block runs, but the service loses track of where.
    dir.placement_mut().fail_locate = Some(1);

    assert!(matches!(
        dir.allocate(&names("block", 3), 64),
        Err(Error::Placement(PlacementError::WorkerLost(_)))
    ));
    assert!(dir.is_empty());
    assert!(dir.nodes().is_empty());
    assert_eq!(dir.placement().outstanding(), 0);
    assert_eq!(dir.placement().segments.live(), names("block", 3));
}

#[test]
fn test_16() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&names("block", 3), 64).unwrap();
    dir.insert("x", 4).unwrap();

    let next = dir.placement().submitted.len() as u64;
    dir.placement_mut().fail_locate = Some(next + 1);
    assert!(matches!(
        dir.clear(),
        Err(Error::Placement(PlacementError::WorkerLost(_)))
    ));
    assert_eq!(dir.len(), 3, "State is kept for a retry.");
    assert_eq!(sizes(&dir, "x"), (64, 4, 4, 0));
    assert_eq!(dir.placement().outstanding(), 0);

    dir.placement_mut().fail_locate = None;
    dir.clear().unwrap();
    assert!(dir.is_empty());
    assert!(dir.placement().segments.is_empty());
}

#[test]
fn test_17() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.placement_mut().report_capacity = Some(32);

    assert!(matches!(
        dir.allocate(&["a", "b"], 64),
        Err(Error::Placement(PlacementError::Mismatch { .. }))
    ));
    assert!(dir.is_empty());
    assert_eq!(dir.placement().outstanding(), 0);
}

#[test]
fn test_18() {
    let _guard = init_logging();
    let mut dir = directory();
    dir.allocate(&["keep", "spin0"], 16).unwrap();

    for i in 1..10 {
        dir.release(&format!("spin{}", i - 1)).unwrap();
        dir.allocate(&[format!("spin{i}")], 16).unwrap();
        assert_eq!(dir.arena.len(), 2, "Released slots are reused.");
    }
    assert_eq!(dir.len(), 2);

    dir.insert("x", 16).unwrap();
    dir.insert("y", 16).unwrap();
    assert_eq!(dir.find("x").unwrap().1, "keep");
    assert_eq!(dir.find("y").unwrap().1, "spin9");
    assert!(matches!(dir.insert("z", 1), Err(Error::OutOfSpace { .. })));
}
