//! Unit tests for the managed server lifecycle.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};

use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{FakeRobot, MemoryStateStore, ScriptedRunner, server};

const TWO_DISKS: &str = "sda 1.8T disk\nsdb 1.8T disk\n";

struct World {
    listener: TcpListener,
    api: FakeRobot,
    runner: ScriptedRunner,
    allocator: PrivateIpAllocator,
    store: MemoryStateStore,
    inventory: ServerInventory,
}

impl World {
    fn lifecycle(&self) -> ServerLifecycle<'_, FakeRobot, ScriptedRunner, MemoryStateStore> {
        let port = self.listener.local_addr().expect("listener address").port();
        ServerLifecycle::new(
            &self.api,
            self.runner.clone(),
            &self.allocator,
            &self.store,
            &self.inventory,
        )
        .with_session_config(SessionConfig {
            port,
            ..SessionConfig::default()
        })
        .with_pipeline_config(PipelineConfig {
            wait_timeout_secs: 2,
            wait_extension_secs: 1,
            first_boot_wait_secs: 2,
            reboot_settle_secs: 0,
            poll_interval_secs: 1,
            attempt_timeout_secs: 1,
            ..PipelineConfig::default()
        })
    }

    fn script_successful_run(&self) {
        self.runner.push_success();
        self.runner.push_output(Some(0), TWO_DISKS, "");
        self.runner.push_successes(9);
    }
}

#[fixture]
fn world() -> World {
    World {
        listener: TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind listener"),
        api: FakeRobot::new(),
        runner: ScriptedRunner::new(),
        allocator: PrivateIpAllocator::new(),
        store: MemoryStateStore::new(),
        inventory: ServerInventory::new(),
    }
}

#[fixture]
fn declared() -> ManagedServer {
    ManagedServer {
        name: String::from("web"),
        server_number: 321,
        server_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        description: String::from("edge node"),
        vswitch_id: Some(4321),
        version: 1,
        arch: crate::payload::Architecture::Amd64,
        encryption_passphrase: Secret::new("correct horse"),
        raid_level: 1,
        no_uefi: false,
        rescue_authorized_key_fingerprints: BTreeSet::from([String::from("aa:bb:cc")]),
        node_labels: Vec::new(),
        taints: Vec::new(),
        cluster_url: None,
        cluster_token: None,
        extra_script: None,
    }
}

async fn created(world: &World, declared: ManagedServer) -> ManagedServerState {
    world.script_successful_run();
    world
        .lifecycle()
        .create(declared)
        .await
        .expect("create should succeed")
}

#[rstest]
#[tokio::test]
async fn create_allocates_names_attaches_and_provisions(world: World, declared: ManagedServer) {
    let state = created(&world, declared).await;

    assert!(state.provisioned);
    assert_eq!(state.local_ip, Some(Ipv4Addr::new(10, 1, 0, 2)));
    assert!(state.id.as_deref().is_some_and(|id| id.starts_with("configuration-")));
    assert!(state.server_name.starts_with("web-"));
    assert_eq!(state.server_name.len(), "web-".len() + SUFFIX_LEN);
    assert_eq!(state.last_completed_stage, Some(PipelineStage::FirstBootSession));
    let calls = world.api.calls();
    assert_eq!(
        calls,
        vec![
            format!("set_server_name 321 {}", state.robot_name),
            String::from("add_server_to_vswitch 4321 127.0.0.1"),
            String::from("activate_rescue 321 aa:bb:cc"),
            String::from("reset 321 hw"),
        ]
    );
    assert_eq!(world.store.load(321).expect("load"), Some(state));
}

#[rstest]
#[tokio::test]
async fn create_refuses_existing_state(world: World, declared: ManagedServer) {
    created(&world, declared.clone()).await;
    let mut other_name = declared.clone();
    other_name.name = String::from("web2");

    for again in [declared, other_name] {
        let err = world
            .lifecycle()
            .create(again)
            .await
            .expect_err("second create should fail");

        assert_eq!(
            err,
            LifecycleError::AlreadyManaged {
                name: String::from("web"),
                server_number: 321,
            }
        );
    }
    assert_eq!(world.api.call_count("activate_rescue"), 1);
    assert_eq!(world.allocator.in_use(), vec![Ipv4Addr::new(10, 1, 0, 2)]);
}

#[rstest]
#[tokio::test]
async fn rename_only_renames_in_place(world: World, declared: ManagedServer) {
    let prior = created(&world, declared.clone()).await;
    let calls_before = world.api.calls();
    let mut renamed = declared;
    renamed.name = String::from("web2");

    let state = world
        .lifecycle()
        .apply(renamed)
        .await
        .expect("rename should succeed");

    assert!(state.robot_name.starts_with("web2-"));
    assert_eq!(state.local_ip, prior.local_ip);
    assert_eq!(state.id, prior.id);
    assert!(state.provisioned);
    let calls = world.api.calls();
    let added = calls.get(calls_before.len()..).unwrap_or_default();
    assert_eq!(added, [format!("set_server_name 321 {}", state.robot_name)]);
    assert_eq!(world.api.call_count("activate_rescue"), 1);
    assert_eq!(world.store.scan().expect("scan"), vec![state]);
    assert!(world.store.find_by_name("web").expect("find").is_none());
    assert_eq!(world.allocator.in_use(), vec![Ipv4Addr::new(10, 1, 0, 2)]);
}

#[rstest]
#[tokio::test]
async fn rename_onto_another_managed_name_is_refused(world: World, declared: ManagedServer) {
    let prior = created(&world, declared.clone()).await;
    let mut neighbour = prior.clone();
    neighbour.declared.name = String::from("api");
    neighbour.declared.server_number = 322;
    world.store.save(&neighbour).expect("save neighbour");
    let mut renamed = declared;
    renamed.name = String::from("api");

    let err = world
        .lifecycle()
        .apply(renamed)
        .await
        .expect_err("rename should be refused");

    assert_eq!(
        err,
        LifecycleError::AlreadyManaged {
            name: String::from("api"),
            server_number: 322,
        }
    );
    assert_eq!(world.store.load(321).expect("load"), Some(prior));
    assert_eq!(world.api.call_count("set_server_name"), 1);
}

#[rstest]
#[tokio::test]
async fn moving_a_name_to_another_server_requires_replacement(
    world: World,
    declared: ManagedServer,
) {
    created(&world, declared.clone()).await;
    let mut moved = declared;
    moved.server_number = 999;

    let err = world
        .lifecycle()
        .apply(moved)
        .await
        .expect_err("apply should be refused");

    assert_eq!(
        err,
        LifecycleError::RequiresReplacement {
            name: String::from("web"),
            field: "server_number",
        }
    );
    assert!(world.store.load(999).expect("load").is_none());
}

#[rstest]
#[tokio::test]
async fn failed_attach_on_create_is_retried(world: World, declared: ManagedServer) {
    world.api.fail_on("add_server_to_vswitch");

    let err = world
        .lifecycle()
        .apply(declared.clone())
        .await
        .expect_err("attach should fail");

    assert!(
        matches!(err, LifecycleError::Provider { operation: "vswitch attach", .. }),
        "{err}"
    );
    assert!(world.store.scan().expect("scan").is_empty());
    assert!(world.allocator.in_use().is_empty());
    assert_eq!(world.api.call_count("activate_rescue"), 0);

    world.api.recover("add_server_to_vswitch");
    world.script_successful_run();
    let state = world
        .lifecycle()
        .apply(declared)
        .await
        .expect("retry should succeed");

    assert!(state.provisioned);
    // one rejected attach, one accepted
    assert_eq!(world.api.call_count("add_server_to_vswitch"), 2);
    assert_eq!(world.api.call_count("set_server_name"), 2);
    assert_eq!(
        world.api.calls().last().map(String::as_str),
        Some("reset 321 hw")
    );
}

#[rstest]
#[tokio::test]
async fn failed_switch_move_is_retried(world: World, declared: ManagedServer) {
    let prior = created(&world, declared.clone()).await;
    let mut moved = declared;
    moved.vswitch_id = Some(99);
    world.api.fail_on("add_server_to_vswitch");

    world
        .lifecycle()
        .apply(moved.clone())
        .await
        .expect_err("attach should fail");

    assert_eq!(world.store.load(321).expect("load"), Some(prior));

    world.api.recover("add_server_to_vswitch");
    let state = world
        .lifecycle()
        .apply(moved)
        .await
        .expect("retry should succeed");

    assert_eq!(state.declared.vswitch_id, Some(99));
    assert_eq!(
        world.api.calls().last().map(String::as_str),
        Some("add_server_to_vswitch 99 127.0.0.1")
    );
    assert_eq!(world.api.call_count("activate_rescue"), 1);
}

fn break_declaration(declared: &mut ManagedServer, field: &str) {
    match field {
        "rescue_authorized_key_fingerprints" => {
            declared.rescue_authorized_key_fingerprints = BTreeSet::from([String::from("  ")]);
        }
        "cluster_url" => declared.cluster_url = Some(String::from("https://10.0.0.120:6443")),
        "encryption passphrase" => declared.encryption_passphrase = Secret::new(""),
        "raid level" => declared.raid_level = 3,
        other => panic!("no way to break {other}"),
    }
}

#[rstest]
#[case::no_keys("rescue_authorized_key_fingerprints")]
#[case::half_cluster("cluster_url")]
#[case::empty_passphrase("encryption passphrase")]
#[case::raid("raid level")]
#[tokio::test]
async fn bad_declarations_fail_before_any_side_effect(
    world: World,
    declared: ManagedServer,
    #[case] field: &'static str,
) {
    let mut bad = declared;
    break_declaration(&mut bad, field);

    let err = world
        .lifecycle()
        .apply(bad)
        .await
        .expect_err("apply should refuse");

    assert!(
        matches!(err, LifecycleError::InvalidDeclaration { field: reported, .. } if reported == field),
        "{err}"
    );
    assert!(world.api.calls().is_empty());
    assert!(world.allocator.in_use().is_empty());
    assert!(world.store.scan().expect("scan").is_empty());
    assert_eq!(world.store.save_count(), 0);
}

#[rstest]
#[tokio::test]
async fn bad_update_fails_before_any_side_effect(world: World, declared: ManagedServer) {
    let prior = created(&world, declared.clone()).await;
    let calls_before = world.api.calls().len();
    let mut bad = declared;
    bad.name = String::from("web2");
    bad.rescue_authorized_key_fingerprints = BTreeSet::new();

    let err = world
        .lifecycle()
        .apply(bad)
        .await
        .expect_err("apply should refuse");

    assert!(matches!(err, LifecycleError::InvalidDeclaration { .. }), "{err}");
    assert_eq!(world.api.calls().len(), calls_before);
    assert_eq!(world.store.load(321).expect("load"), Some(prior));
}

#[rstest]
#[tokio::test]
async fn description_change_keeps_everything_else(world: World, declared: ManagedServer) {
    let prior = created(&world, declared.clone()).await;
    let calls_before = world.api.calls().len();
    let mut changed = declared;
    changed.description = String::from("moved racks");

    let state = world
        .lifecycle()
        .update(&prior, changed)
        .await
        .expect("update should succeed");

    assert_eq!(state.local_ip, prior.local_ip);
    assert_eq!(state.server_name, prior.server_name);
    assert_eq!(state.id, prior.id);
    assert_eq!(state.declared.description, "moved racks");
    assert_eq!(world.api.calls().len(), calls_before);
}

#[rstest]
#[tokio::test]
async fn version_bump_reprovisions_with_same_address(world: World, declared: ManagedServer) {
    let prior = created(&world, declared.clone()).await;
    world.script_successful_run();
    let mut changed = declared;
    changed.version = 2;

    let state = world
        .lifecycle()
        .apply(changed)
        .await
        .expect("apply should succeed");

    assert_eq!(state.local_ip, prior.local_ip);
    assert_eq!(state.id, prior.id);
    assert_ne!(state.server_name, prior.server_name);
    assert!(state.provisioned);
    assert_eq!(world.api.call_count("activate_rescue"), 2);
    assert_eq!(world.api.call_count("add_server_to_vswitch"), 1);
    assert_eq!(world.allocator.in_use(), vec![Ipv4Addr::new(10, 1, 0, 2)]);
}

#[rstest]
#[case::server_number("server_number")]
#[case::server_ip("server_ip")]
#[tokio::test]
async fn identity_changes_require_replacement(
    world: World,
    declared: ManagedServer,
    #[case] field: &'static str,
) {
    let prior = created(&world, declared.clone()).await;
    let mut changed = declared;
    if field == "server_number" {
        changed.server_number = 999;
    } else {
        changed.server_ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
    }

    let err = world
        .lifecycle()
        .update(&prior, changed)
        .await
        .expect_err("update should be refused");

    assert_eq!(
        err,
        LifecycleError::RequiresReplacement {
            name: String::from("web"),
            field,
        }
    );
}

#[rstest]
#[tokio::test]
async fn failed_create_keeps_address_and_resumes(world: World, declared: ManagedServer) {
    world.runner.push_success();
    world.runner.push_output(Some(0), "sda 1.8T disk\n", "");

    let err = world
        .lifecycle()
        .apply(declared.clone())
        .await
        .expect_err("create should fail");

    let LifecycleError::Provision { ref source } = err else {
        panic!("expected provisioning failure, got {err}");
    };
    assert_eq!(source.summary, "invalid disk count");
    let partial = world.store.load(321).expect("load").expect("partial state");
    assert!(!partial.provisioned);
    assert_eq!(partial.last_completed_stage, Some(PipelineStage::SessionOpen));
    assert_eq!(partial.local_ip, Some(Ipv4Addr::new(10, 1, 0, 2)));
    assert!(world.allocator.is_held(Ipv4Addr::new(10, 1, 0, 2)));

    world.script_successful_run();
    let state = world
        .lifecycle()
        .apply(declared)
        .await
        .expect("retry should succeed");

    assert!(state.provisioned);
    assert_eq!(state.local_ip, partial.local_ip);
    assert_eq!(state.server_name, partial.server_name);
    assert_eq!(world.api.call_count("set_server_name"), 1);
}

#[rstest]
#[tokio::test]
async fn delete_releases_address_even_when_cancel_fails(world: World, declared: ManagedServer) {
    created(&world, declared).await;
    world.api.fail_on("cancel_server");

    let removed = world
        .lifecycle()
        .delete("web")
        .await
        .expect("delete should succeed");

    assert!(removed);
    assert!(world.store.load(321).expect("load").is_none());
    assert!(world.allocator.in_use().is_empty());
    assert_eq!(world.api.call_count("cancel_server"), 1);
}

#[rstest]
#[tokio::test]
async fn delete_of_unknown_name_is_a_no_op(world: World) {
    let removed = world.lifecycle().delete("ghost").await.expect("delete");

    assert!(!removed);
    assert!(world.api.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn read_drops_state_for_vanished_server(world: World, declared: ManagedServer) {
    created(&world, declared).await;
    world.api.set_servers(vec![server(111, "other", "198.51.100.2")]);

    let refreshed = world.lifecycle().read("web").await.expect("read");

    assert!(refreshed.is_none());
    assert!(world.store.load(321).expect("load").is_none());
    assert!(world.allocator.in_use().is_empty());
}

#[rstest]
#[tokio::test]
async fn read_keeps_state_for_listed_server(world: World, declared: ManagedServer) {
    let state = created(&world, declared).await;
    world
        .api
        .set_servers(vec![server(321, &state.robot_name, "127.0.0.1")]);

    let refreshed = world.lifecycle().read("web").await.expect("read");

    assert_eq!(refreshed, Some(state));
}

#[rstest]
#[case::empty("")]
#[case::leading_hyphen("-web")]
#[case::underscore("web_1")]
#[tokio::test]
async fn invalid_names_are_rejected(world: World, declared: ManagedServer, #[case] name: &str) {
    let mut bad = declared;
    bad.name = name.to_owned();

    let err = world
        .lifecycle()
        .create(bad)
        .await
        .expect_err("create should refuse");

    assert!(matches!(err, LifecycleError::InvalidDeclaration { field: "name", .. }), "{err}");
    assert!(world.allocator.in_use().is_empty());
}

#[rstest]
#[tokio::test]
async fn seeding_marks_stored_addresses(world: World, declared: ManagedServer) {
    let state = created(&world, declared).await;
    let fresh = PrivateIpAllocator::new();

    let seeded = seed_allocator(&world.store, &fresh).expect("seed");

    assert_eq!(seeded, 1);
    assert_eq!(fresh.in_use(), vec![state.local_ip.expect("address")]);
    assert_eq!(fresh.acquire().expect("acquire"), Ipv4Addr::new(10, 1, 0, 3));
}

#[test]
fn secrets_are_redacted_in_debug_output() {
    let secret = Secret::new("hunter2");

    assert_eq!(format!("{secret:?}"), "Secret(***)");
    assert_eq!(secret.expose(), "hunter2");
}

#[test]
fn suffixes_are_lowercase_hex() {
    let suffix = random_suffix();

    assert_eq!(suffix.len(), SUFFIX_LEN);
    assert!(suffix.chars().all(|ch| ch.is_ascii_hexdigit() && !ch.is_ascii_uppercase()));
    let names = ServerNames::with_suffix("db", "0a1b2c");
    assert_eq!(names.server_name, "db-0a1b2c");
    assert_eq!(names.robot_name, "db-0a1b2c");
}

#[test]
fn file_store_keys_by_server_number_with_private_modes() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let root = camino::Utf8PathBuf::from_path_buf(dir.path().join("state")).expect("utf-8 path");
    let store = FileStateStore::new(root.clone());
    let mut state = ManagedServerState {
        id: None,
        declared: declared(),
        local_ip: Some(Ipv4Addr::new(10, 1, 0, 9)),
        server_name: String::from("web-abcdef"),
        robot_name: String::from("web-abcdef"),
        last_completed_stage: Some(PipelineStage::RunImaging),
        provisioned: false,
    };

    assert_eq!(store.load(321).expect("load missing"), None);
    store.save(&state).expect("save");
    state.declared.name = String::from("web2");
    store.save(&state).expect("save renamed");

    assert_eq!(store.load(321).expect("load"), Some(state.clone()));
    assert_eq!(store.scan().expect("scan"), vec![state.clone()]);
    assert_eq!(store.find_by_name("web2").expect("find"), Some(state));
    assert_eq!(store.find_by_name("web").expect("find"), None);

    let dir_mode = std::fs::metadata(&root).expect("dir metadata").permissions().mode();
    let file_mode = std::fs::metadata(root.join("server-321.json"))
        .expect("file metadata")
        .permissions()
        .mode();
    assert_eq!(dir_mode & 0o777, 0o700);
    assert_eq!(file_mode & 0o777, 0o600);
    let names: Vec<String> = std::fs::read_dir(&root)
        .expect("list")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![String::from("server-321.json")]);

    store.remove(321).expect("remove");
    store.remove(321).expect("remove twice");
    assert!(store.scan().expect("scan").is_empty());
}
