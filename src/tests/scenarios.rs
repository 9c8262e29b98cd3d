//! End-to-end runs of the build and execute pipelines against the in-memory
//! toolchain, with real archive directories on disk.

use pretty_assertions::assert_eq;

use super::fixtures::{path_info, store_path, FakeWorld, REV_0, REV_1};
use crate::errors::Error;
use crate::instruction::build::{build_instruction_dir, BuildRequest, ARCHIVE_FOLDER};
use crate::instruction::execute::execute_instruction_dir;
use crate::instruction::{Command, Instruction, StoreRoot, SwitchMode};

/// Two revisions of one host: r1 differs from r0 by a single added package.
fn world() -> FakeWorld {
    let mut w = FakeWorld::new("testvm");
    w.add(path_info("libc", &[]));
    w.add(path_info("hello", &["libc"]));
    w.add(path_info("sysr0", &["hello", "libc"]));
    w.add(path_info("newpkg", &["libc"]));
    w.add(path_info("sysr1", &["hello", "newpkg", "libc"]));
    w.add_system(&REV_0, "sysr0");
    w.add_system(&REV_1, "sysr1");
    w
}

fn request(past_revs: &[&str], new_rev: &str, mode: SwitchMode) -> BuildRequest {
    BuildRequest {
        flake_uri: "git+file:///config".to_string(),
        hostname: "testvm".to_string(),
        past_revs: past_revs.iter().map(|r| r.to_string()).collect(),
        new_rev: new_rev.to_string(),
        mode,
        full_narinfos: false,
    }
}

fn archive_file_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// S1: a full install ships the whole closure and activates immediately.
#[tokio::test]
async fn full_install_ships_everything_and_activates() {
    let world = world();
    let workdir = tempfile::tempdir().unwrap();

    let instruction =
        build_instruction_dir(&world, &request(&[], &REV_0, SwitchMode::Immediate), workdir.path())
            .await
            .unwrap();

    match &instruction.commands[..] {
        [Command::Load {
            archive_path,
            item,
            delta_dependencies,
            partial_narinfos,
        }, Command::Switch { mode, .. }] => {
            assert_eq!(archive_path, ARCHIVE_FOLDER);
            assert_eq!(item.nix_path, store_path("sysr0"));
            assert_eq!(item.git_revision, *REV_0);
            assert!(delta_dependencies.is_empty());
            assert!(!partial_narinfos);
            assert_eq!(*mode, SwitchMode::Immediate);
        }
        other => panic!("unexpected command list: {other:?}"),
    }

    // Data and info entries for the entire closure of r0.
    let archive_dir = workdir.path().join("instruction").join(ARCHIVE_FOLDER);
    let narinfos = archive_file_names(&archive_dir)
        .into_iter()
        .filter(|n| n.ends_with(".narinfo"))
        .count();
    assert_eq!(narinfos, 3);
    assert_eq!(archive_file_names(&archive_dir.join("nar")).len(), 3);

    // An empty target ends up with the closure present and r0 activated.
    let target = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    execute_instruction_dir(
        &world,
        &workdir.path().join("instruction"),
        target.path(),
        state.path(),
    )
    .await
    .unwrap();

    let expected: std::collections::BTreeSet<_> =
        ["libc", "hello", "sysr0"].iter().map(|n| store_path(n)).collect();
    assert_eq!(world.store_contents(target.path()), expected);
    assert_eq!(
        world.activations(),
        vec![(store_path("sysr0"), SwitchMode::Immediate)]
    );

    // The cache recorded every shipped info file.
    let cached = crate::cache::list_info_files(
        state.path(),
        &expected.iter().cloned().collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(cached.len(), 3);

    // Executing the same instruction again reaches the same final state.
    execute_instruction_dir(
        &world,
        &workdir.path().join("instruction"),
        target.path(),
        state.path(),
    )
    .await
    .unwrap();
    assert_eq!(world.store_contents(target.path()), expected);
    assert_eq!(world.activations().len(), 2);
}

/// S2: an incremental update ships only the added paths and relies on the
/// target's cache for the rest of the metadata.
#[tokio::test]
async fn incremental_update_ships_only_the_delta() {
    let world = world();
    let workdir = tempfile::tempdir().unwrap();

    let instruction =
        build_instruction_dir(&world, &request(&[&REV_0], &REV_1, SwitchMode::Immediate), workdir.path())
            .await
            .unwrap();

    match &instruction.commands[0] {
        Command::Load {
            delta_dependencies,
            partial_narinfos,
            item,
            ..
        } => {
            assert_eq!(
                delta_dependencies,
                &vec![StoreRoot {
                    nix_path: store_path("sysr0"),
                    git_revision: REV_0.clone(),
                }]
            );
            assert!(*partial_narinfos);
            assert_eq!(item.nix_path, store_path("sysr1"));
        }
        other => panic!("expected a load command, got {other:?}"),
    }

    // Only the two added paths travel, as data and as info.
    let archive_dir = workdir.path().join("instruction").join(ARCHIVE_FOLDER);
    let expected_infos: Vec<String> = {
        let mut v: Vec<String> = ["newpkg", "sysr1"]
            .iter()
            .map(|n| format!("{}.narinfo", store_path(n).hash_part().unwrap()))
            .collect();
        v.sort();
        v
    };
    let infos: Vec<String> = archive_file_names(&archive_dir)
        .into_iter()
        .filter(|n| n.ends_with(".narinfo"))
        .collect();
    assert_eq!(infos, expected_infos);
    assert_eq!(archive_file_names(&archive_dir.join("nar")).len(), 2);

    // A target running r0, with r0's metadata cached.
    let target = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    world.seed_store(target.path(), "sysr0");
    world.write_cache_entries(state.path(), &["sysr0"]);

    execute_instruction_dir(
        &world,
        &workdir.path().join("instruction"),
        target.path(),
        state.path(),
    )
    .await
    .unwrap();

    let expected: std::collections::BTreeSet<_> = ["libc", "hello", "newpkg", "sysr0", "sysr1"]
        .iter()
        .map(|n| store_path(n))
        .collect();
    assert_eq!(world.store_contents(target.path()), expected);
    assert_eq!(
        world.activations(),
        vec![(store_path("sysr1"), SwitchMode::Immediate)]
    );

    // The cache gained exactly what this instruction shipped.
    let all_paths: Vec<_> = expected.into_iter().collect();
    let cached = crate::cache::list_info_files(state.path(), &all_paths)
        .await
        .unwrap();
    assert_eq!(cached.len(), 5);
}

/// S3: a next-reboot switch creates the generation without touching the
/// running system.
#[tokio::test]
async fn next_reboot_switch_defers_activation() {
    let world = world();
    let workdir = tempfile::tempdir().unwrap();

    build_instruction_dir(&world, &request(&[&REV_0], &REV_1, SwitchMode::NextReboot), workdir.path())
        .await
        .unwrap();

    let target = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    world.seed_store(target.path(), "sysr0");
    world.write_cache_entries(state.path(), &["sysr0"]);

    execute_instruction_dir(
        &world,
        &workdir.path().join("instruction"),
        target.path(),
        state.path(),
    )
    .await
    .unwrap();

    assert_eq!(
        world.activations(),
        vec![(store_path("sysr1"), SwitchMode::NextReboot)]
    );
}

/// S4: a hostname the flake does not declare fails before any build work.
#[tokio::test]
async fn unknown_hostname_fails_listing_available() {
    let world = world();
    let workdir = tempfile::tempdir().unwrap();

    let mut request = request(&[], &REV_0, SwitchMode::Immediate);
    request.hostname = "ghost".to_string();

    let err = build_instruction_dir(&world, &request, workdir.path())
        .await
        .unwrap_err();
    match err {
        Error::UnknownHostname {
            requested,
            available,
        } => {
            assert_eq!(requested, "ghost");
            assert_eq!(available, vec!["testvm".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Nothing was built into the scratch store.
    assert!(world.store_contents(&workdir.path().join("store")).is_empty());
}

/// S5: a target whose cache lacks the dependency metadata refuses the
/// partial import before anything changes.
#[tokio::test]
async fn missing_dependency_metadata_aborts_cleanly() {
    let world = world();
    let workdir = tempfile::tempdir().unwrap();

    build_instruction_dir(&world, &request(&[&REV_0], &REV_1, SwitchMode::Immediate), workdir.path())
        .await
        .unwrap();

    let target = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    world.seed_store(target.path(), "sysr0");
    // No cache entries written: the target never received r0's metadata.

    let err = execute_instruction_dir(
        &world,
        &workdir.path().join("instruction"),
        target.path(),
        state.path(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::MissingDependencyMetadata(_)));

    // No import, no activation.
    let r0_closure: std::collections::BTreeSet<_> =
        ["libc", "hello", "sysr0"].iter().map(|n| store_path(n)).collect();
    assert_eq!(world.store_contents(target.path()), r0_closure);
    assert!(world.activations().is_empty());
}

/// S6: a switch anywhere but last is rejected with no side effects.
#[tokio::test]
async fn switch_before_load_is_rejected() {
    let world = world();
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(ARCHIVE_FOLDER)).unwrap();

    let item = StoreRoot {
        nix_path: store_path("sysr0"),
        git_revision: REV_0.clone(),
    };
    let malformed = Instruction::new(vec![
        Command::Switch {
            item: item.clone(),
            mode: SwitchMode::Immediate,
        },
        Command::Load {
            archive_path: ARCHIVE_FOLDER.to_string(),
            item,
            delta_dependencies: vec![],
            partial_narinfos: false,
        },
    ]);
    std::fs::write(dir.path().join("instruction.json"), malformed.to_json()).unwrap();

    let target = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    let err = execute_instruction_dir(&world, dir.path(), target.path(), state.path())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InvalidInstruction { reason } if reason == "switch must be last"
    ));
    assert!(world.activations().is_empty());
    assert!(world.store_contents(target.path()).is_empty());
}
