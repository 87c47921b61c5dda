use super::state::{MergeSide, MergeStage, RenameCache};
use super::{DirRenameDetection, MergeCtxt, MergeEngine, MergeOpts};
use crate::error::OrtResult;
use crate::obj::{Commit, FileMode, Oid};
use crate::odb::{MemOdb, Odb};
use crate::path::OrtPath;
use crate::test_utils::{build_tree, build_tree_ents, flatten_tree, tree_paths, TestEnt};

fn labeled_opts() -> MergeOpts {
    MergeOpts {
        side1_label: "SIDE1".to_owned(),
        side2_label: "SIDE2".to_owned(),
        detect_directory_renames: DirRenameDetection::True,
        ..MergeOpts::default()
    }
}

fn message_text(outcome: &super::MergeOutcome) -> String {
    outcome.messages.values().cloned().collect::<Vec<_>>().join("")
}

#[test]
fn clean_rename_on_one_side_carries_the_other_sides_edit() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "a/foo" => "one\n");
    let side1 = tree_in!(odb: "a/foo" => "one changed\n");
    let side2 = tree_in!(odb: "a/bar" => "one\n");

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(outcome.clean);
    assert!(outcome.unmerged.is_empty());
    assert_eq!(flatten_tree(&odb, outcome.tree), vec![("a/bar".to_owned(), "one changed\n".to_owned())]);
    Ok(())
}

#[test]
fn modify_delete_leaves_the_modified_version_and_two_stages() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "x" => "a\n");
    let side1 = tree_in!(odb: "x" => "a modified\n");
    let side2 = tree_in!(odb);

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);
    assert_eq!(flatten_tree(&odb, outcome.tree), vec![("x".to_owned(), "a modified\n".to_owned())]);

    assert_eq!(outcome.unmerged.len(), 2);
    assert_eq!(outcome.unmerged[0].path, "x");
    assert_eq!(outcome.unmerged[0].stage, MergeStage::Base);
    assert_eq!(outcome.unmerged[1].stage, MergeStage::Ours);
    assert_eq!(outcome.unmerged[1].mode, FileMode::REG);

    let text = message_text(&outcome);
    assert!(text.contains("modify/delete"), "unexpected messages: {}", text);
    assert!(text.contains("SIDE1") && text.contains("SIDE2"), "labels missing: {}", text);
    Ok(())
}

#[test]
fn directory_rename_pulls_new_files_along() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "olddir/a" => "a\n", "olddir/b" => "b\n", "olddir/c" => "c\n");
    let side1 = tree_in!(odb: "newdir/a" => "a\n", "newdir/b" => "b\n", "newdir/c" => "c\n");
    let side2 = tree_in!(odb:
        "olddir/a" => "a\n",
        "olddir/b" => "b\n",
        "olddir/c" => "c\n",
        "olddir/d" => "new\n",
    );

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(outcome.clean, "messages: {}", message_text(&outcome));
    assert_eq!(
        tree_paths(&odb, outcome.tree),
        vec!["newdir/a", "newdir/b", "newdir/c", "newdir/d"]
    );
    assert!(message_text(&outcome).contains("Path updated"));
    Ok(())
}

#[test]
fn rename_rename_to_two_targets_conflicts_at_both() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "f" => "content\n");
    let side1 = tree_in!(odb: "g" => "content\n");
    let side2 = tree_in!(odb: "h" => "content\n");

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);

    let unmerged_paths: Vec<&str> =
        outcome.unmerged.iter().map(|entry| entry.path.as_str()).collect();
    assert!(unmerged_paths.contains(&"g"));
    assert!(unmerged_paths.contains(&"h"));

    let text = message_text(&outcome);
    assert!(text.contains("renamed to g in SIDE1 and to h in SIDE2"), "messages: {}", text);
    Ok(())
}

#[test]
fn file_directory_conflict_moves_the_file_aside() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb);
    let side1 = tree_in!(odb: "p" => "file\n");
    let side2 = tree_in!(odb: "p/inside" => "dir\n");

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);
    assert_eq!(
        flatten_tree(&odb, outcome.tree),
        vec![
            ("p/inside".to_owned(), "dir\n".to_owned()),
            ("p~SIDE1".to_owned(), "file\n".to_owned()),
        ]
    );
    assert!(message_text(&outcome).contains("directory in the way"));
    Ok(())
}

#[test]
fn content_conflict_writes_markers_and_three_stages() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "file" => "1\n2\n3\n");
    let side1 = tree_in!(odb: "file" => "1\n2a\n3\n");
    let side2 = tree_in!(odb: "file" => "1\n2b\n3\n");

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);

    let flat = flatten_tree(&odb, outcome.tree);
    assert_eq!(flat.len(), 1);
    let content = &flat[0].1;
    assert!(content.contains("<<<<<<<"), "no markers in {:?}", content);
    assert!(content.contains("2a") && content.contains("2b"));

    // filemask 7: all three stages recorded
    let stages: Vec<MergeStage> = outcome.unmerged.iter().map(|entry| entry.stage).collect();
    assert_eq!(stages, vec![MergeStage::Base, MergeStage::Ours, MergeStage::Theirs]);
    Ok(())
}

#[test]
fn merging_identical_trees_is_the_identity() -> OrtResult<()> {
    let odb = MemOdb::new();
    let tree = tree_in!(odb: "a" => "a\n", "d/b" => "b\n");
    let outcome = MergeEngine::new(&odb).merge_trees(Some(tree), tree, tree, &MergeOpts::default())?;
    assert!(outcome.clean);
    assert_eq!(outcome.tree, tree);
    Ok(())
}

#[test]
fn unchanged_side_fast_forwards_to_the_other() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "a" => "a\n");
    let changed = tree_in!(odb: "a" => "b\n", "c" => "c\n");

    let mut engine = MergeEngine::new(&odb);
    let ff1 = engine.merge_trees(Some(base), changed, base, &MergeOpts::default())?;
    assert!(ff1.clean);
    assert_eq!(ff1.tree, changed);

    let ff2 = engine.merge_trees(Some(base), base, changed, &MergeOpts::default())?;
    assert!(ff2.clean);
    assert_eq!(ff2.tree, changed);
    Ok(())
}

#[test]
fn clean_merges_commute() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "a/foo" => "one\n", "keep" => "k\n");
    let x = tree_in!(odb: "a/foo" => "one changed\n", "keep" => "k\n");
    let y = tree_in!(odb: "a/bar" => "one\n", "keep" => "k\n");

    let mut engine = MergeEngine::new(&odb);
    let xy = engine.merge_trees(Some(base), x, y, &labeled_opts())?;
    engine.clear_rename_cache();
    let yx = engine.merge_trees(Some(base), y, x, &labeled_opts())?;
    assert!(xy.clean && yx.clean);
    assert_eq!(xy.tree, yx.tree);
    Ok(())
}

#[test]
fn identical_additions_on_both_sides_are_clean() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb);
    let side1 = tree_in!(odb: "n" => "x\n", "a" => "1\n");
    let side2 = tree_in!(odb: "n" => "x\n", "b" => "2\n");

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &MergeOpts::default())?;
    assert!(outcome.clean);
    assert_eq!(tree_paths(&odb, outcome.tree), vec!["a", "b", "n"]);
    Ok(())
}

#[test]
fn rename_with_edits_on_both_sides_merges_content_at_the_new_path() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base_content = "l1\nl2\nl3\nl4\nl5\nl6\nl7\nl8\n";
    let ours_content = "l1\nl2\nl3\nl4\nl5\nl6\nl7\nl8 changed\n";
    let theirs_content = "l1 changed\nl2\nl3\nl4\nl5\nl6\nl7\nl8\n";

    let base = tree_in!(odb: "old.txt" => base_content);
    let side1 = tree_in!(odb: "old.txt" => ours_content);
    let side2 = tree_in!(odb: "new.txt" => theirs_content);

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(outcome.clean, "messages: {}", message_text(&outcome));
    assert_eq!(
        flatten_tree(&odb, outcome.tree),
        vec![("new.txt".to_owned(), "l1 changed\nl2\nl3\nl4\nl5\nl6\nl7\nl8 changed\n".to_owned())]
    );
    Ok(())
}

#[test]
fn directory_rename_split_is_unclean_and_applies_nothing() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "old/f1" => "1\n", "old/f2" => "2\n", "seen" => "s\n");
    let side1 = tree_in!(odb: "new1/f1" => "1\n", "new2/f2" => "2\n", "seen" => "s\n");
    let side2 = tree_in!(odb:
        "old/f1" => "1\n",
        "old/f2" => "2\n",
        "old/d" => "new\n",
        "seen" => "s\n",
    );

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);
    // the ambiguous directory rename is not applied: d stays where side2 put it
    assert!(tree_paths(&odb, outcome.tree).contains(&"old/d".to_owned()));
    assert!(message_text(&outcome).contains("directory rename split"));
    Ok(())
}

#[test]
fn rename_cache_reuse_matches_detection_from_scratch() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "a/foo" => "one\n");
    let side1 = tree_in!(odb: "a/bar" => "one\n");
    let side2 = tree_in!(odb: "a/foo" => "one plus\n");
    let side2_next = tree_in!(odb: "a/foo" => "one plus more\n");

    let mut engine = MergeEngine::new(&odb);
    let first = engine.merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(first.clean);
    assert_eq!(
        flatten_tree(&odb, first.tree),
        vec![("a/bar".to_owned(), "one plus\n".to_owned())]
    );

    // next pick in the sequence: the previous side2 becomes the base and the
    // previous result carries side1, which is exactly what makes the side1
    // cache valid
    engine.declare_rename_cache_valid(MergeSide::Side1);
    let cached = engine.merge_trees(Some(side2), first.tree, side2_next, &labeled_opts())?;

    let fresh =
        MergeEngine::new(&odb).merge_trees(Some(side2), first.tree, side2_next, &labeled_opts())?;
    assert_eq!(cached.clean, fresh.clean);
    assert_eq!(cached.tree, fresh.tree);
    assert!(cached.clean);
    assert_eq!(
        flatten_tree(&odb, cached.tree),
        vec![("a/bar".to_owned(), "one plus more\n".to_owned())]
    );
    Ok(())
}

#[test]
fn trivial_subtree_change_is_adopted_without_recursing() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "d/x" => "1\n", "f" => "a\n");
    let side1 = tree_in!(odb: "d/x" => "1\n", "f" => "b\n");
    let side2 = tree_in!(odb: "d/x" => "1\n", "d/y" => "2\n", "f" => "a\n");

    let outcome =
        MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &MergeOpts::default())?;
    assert!(outcome.clean);
    assert_eq!(
        flatten_tree(&odb, outcome.tree),
        vec![
            ("d/x".to_owned(), "1\n".to_owned()),
            ("d/y".to_owned(), "2\n".to_owned()),
            ("f".to_owned(), "b\n".to_owned()),
        ]
    );
    Ok(())
}

#[test]
fn mode_change_on_one_side_wins_cleanly() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = build_tree_ents(&odb, &[("tool".to_owned(), TestEnt::File("run\n"))]);
    let side1 = build_tree_ents(&odb, &[("tool".to_owned(), TestEnt::Exec("run\n"))]);
    let side2 = build_tree_ents(&odb, &[("tool".to_owned(), TestEnt::File("run more\n"))]);

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(outcome.clean);

    let tree = odb.read_tree(outcome.tree)?;
    let entry = tree.entries.iter().find(|entry| entry.name == "tool").unwrap();
    assert_eq!(entry.mode, FileMode::EXEC);
    assert_eq!(odb.read_blob(entry.oid)?, b"run more\n");
    Ok(())
}

#[test]
fn distinct_types_are_recorded_side_by_side() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb);
    let side1 = build_tree_ents(&odb, &[("p".to_owned(), TestEnt::File("data\n"))]);
    let side2 = build_tree_ents(&odb, &[("p".to_owned(), TestEnt::Link("target"))]);

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);
    assert!(message_text(&outcome).contains("distinct types"));

    let tree = odb.read_tree(outcome.tree)?;
    let names: Vec<&str> = tree.entries.iter().map(|entry| entry.name.as_str()).collect();
    assert_eq!(names, vec!["p~SIDE1", "p~SIDE2"]);
    Ok(())
}

fn write_commit(odb: &MemOdb, tree: Oid, parents: &[Oid], time: i64) -> Oid {
    odb.write_commit(&Commit {
        tree,
        parents: parents.iter().copied().collect(),
        time,
        message: "generated commit".to_owned(),
    })
    .unwrap()
}

#[test]
fn submodule_fast_forward_merges_cleanly() -> OrtResult<()> {
    let odb = MemOdb::new();
    let sub_base = write_commit(&odb, Oid::EMPTY_TREE, &[], 1);
    let sub_mid = write_commit(&odb, Oid::EMPTY_TREE, &[sub_base], 2);
    let sub_tip = write_commit(&odb, Oid::EMPTY_TREE, &[sub_mid], 3);

    let base = build_tree_ents(&odb, &[("m".to_owned(), TestEnt::Gitlink(sub_base))]);
    let side1 = build_tree_ents(&odb, &[("m".to_owned(), TestEnt::Gitlink(sub_mid))]);
    let side2 = build_tree_ents(&odb, &[("m".to_owned(), TestEnt::Gitlink(sub_tip))]);

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(outcome.clean, "messages: {}", message_text(&outcome));
    let tree = odb.read_tree(outcome.tree)?;
    let entry = tree.entries.iter().next().unwrap();
    assert_eq!(entry.mode, FileMode::GITLINK);
    assert_eq!(entry.oid, sub_tip);
    Ok(())
}

#[test]
fn diverged_submodules_conflict_with_a_note() -> OrtResult<()> {
    let odb = MemOdb::new();
    let sub_base = write_commit(&odb, Oid::EMPTY_TREE, &[], 1);
    let sub_a = write_commit(&odb, Oid::EMPTY_TREE, &[sub_base], 2);
    let sub_b = write_commit(&odb, Oid::EMPTY_TREE, &[sub_base], 3);

    let base = build_tree_ents(&odb, &[("m".to_owned(), TestEnt::Gitlink(sub_base))]);
    let side1 = build_tree_ents(&odb, &[("m".to_owned(), TestEnt::Gitlink(sub_a))]);
    let side2 = build_tree_ents(&odb, &[("m".to_owned(), TestEnt::Gitlink(sub_b))]);

    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &labeled_opts())?;
    assert!(!outcome.clean);
    assert!(message_text(&outcome).contains("Failed to merge submodule"));
    Ok(())
}

#[test]
fn renormalize_treats_crlf_only_changes_as_unmodified() -> OrtResult<()> {
    let odb = MemOdb::new();
    let base = tree_in!(odb: "x" => "a\r\nb\r\n", "keep" => "k\n");
    let side1 = tree_in!(odb: "x" => "a\nb\n", "keep" => "k\n");
    let side2 = tree_in!(odb: "keep" => "k\n");

    let opts = MergeOpts { renormalize: true, ..labeled_opts() };
    let outcome = MergeEngine::new(&odb).merge_trees(Some(base), side1, side2, &opts)?;
    assert!(outcome.clean, "messages: {}", message_text(&outcome));
    assert_eq!(tree_paths(&odb, outcome.tree), vec!["keep"]);
    Ok(())
}

#[test]
fn recursive_merge_synthesizes_a_virtual_ancestor() -> OrtResult<()> {
    let odb = MemOdb::new();
    let tree_o = tree_in!(odb: "f" => "base\n");
    let tree_a = tree_in!(odb: "f" => "a\n");
    let tree_b = tree_in!(odb: "f" => "b\n");
    let tree_c = tree_in!(odb: "f" => "m\n", "c" => "c\n");
    let tree_d = tree_in!(odb: "f" => "m\n", "d" => "d\n");

    let o = write_commit(&odb, tree_o, &[], 1);
    let a = write_commit(&odb, tree_a, &[o], 2);
    let b = write_commit(&odb, tree_b, &[o], 3);
    // criss-cross: c and d are both merges of a and b
    let c = write_commit(&odb, tree_c, &[a, b], 4);
    let d = write_commit(&odb, tree_d, &[b, a], 5);

    let outcome = MergeEngine::new(&odb).merge_commits(c, d, &labeled_opts())?;
    assert!(outcome.clean, "messages: {}", message_text(&outcome));
    assert_eq!(
        flatten_tree(&odb, outcome.tree),
        vec![
            ("c".to_owned(), "c\n".to_owned()),
            ("d".to_owned(), "d\n".to_owned()),
            ("f".to_owned(), "m\n".to_owned()),
        ]
    );
    Ok(())
}

#[test]
fn path_map_invariants_hold_after_resolution() -> OrtResult<()> {
    let odb = MemOdb::new();
    // a deliberately messy merge: df conflict, modify/delete, rename, content conflict
    let base = tree_in!(odb:
        "del" => "gone\n",
        "edit" => "1\n2\n3\n",
        "a/foo" => "one\n",
    );
    let side1 = tree_in!(odb:
        "del" => "gone but modified\n",
        "edit" => "1\n2a\n3\n",
        "a/foo" => "one changed\n",
        "p" => "file\n",
    );
    let side2 = tree_in!(odb:
        "edit" => "1\n2b\n3\n",
        "a/bar" => "one\n",
        "p/inside" => "dir\n",
    );

    let opts = labeled_opts();
    let mut cache = RenameCache::default();
    let mut ctxt = MergeCtxt::new(&odb, &opts, &mut cache, 0);
    let outcome = ctxt.merge([Some(base), Some(side1), Some(side2)])?;
    assert!(!outcome.clean);

    let mut expected_unmerged: Vec<OrtPath> = vec![];
    for (&path, info) in &ctxt.paths {
        // a role contributes a file xor a directory
        assert_eq!(info.filemask & info.dirmask, 0, "role overlap at `{}`", path);
        // a resolved record is absent exactly when it has no mode
        if info.clean {
            assert_eq!(info.is_null(), info.result.mode.is_none());
        }
        if !info.clean && info.filemask != 0 {
            expected_unmerged.push(path);
        }
    }

    let mut actual_unmerged: Vec<OrtPath> =
        outcome.unmerged.iter().map(|entry| entry.path).collect();
    actual_unmerged.sort();
    actual_unmerged.dedup();
    expected_unmerged.sort();
    assert_eq!(actual_unmerged, expected_unmerged);
    Ok(())
}

#[test]
fn merging_without_a_common_ancestor_keeps_single_side_additions() -> OrtResult<()> {
    let odb = MemOdb::new();
    let side = tree_in!(odb: "only" => "o\n");
    let empty = tree_in!(odb);

    // no base: `only` exists on one side and nowhere else, a plain addition
    let outcome = MergeEngine::new(&odb).merge_trees(None, side, empty, &MergeOpts::default())?;
    assert!(outcome.clean);
    assert_eq!(outcome.tree, build_tree(&odb, &[("only", "o\n")]));

    let both_empty = MergeEngine::new(&odb).merge_trees(None, empty, empty, &MergeOpts::default())?;
    assert!(both_empty.clean);
    assert_eq!(both_empty.tree, empty);
    Ok(())
}
