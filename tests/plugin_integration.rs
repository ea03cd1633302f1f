use scene_sync::config::{ParticipantRole, SessionConfig};
use scene_sync::engine::Engine;
use scene_sync::network::transport::LoopbackLink;
use scene_sync::network::PeerId;
use scene_sync::plugin::input::{Key, SharedKeyboard, UserInputPlugin};
use scene_sync::plugin::{Execution, PluginError, PluginState};
use scene_sync::scene::{EntityType, Vector3};
use std::time::{Duration, Instant};

const HOST_USER: &str = "host_00000001";
const GUEST_USER: &str = "guest_00000002";
const FRAME: f32 = 0.1;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine(role: ParticipantRole, user: &str) -> Engine {
    let mut config = SessionConfig::for_role(role);
    config.unique_user_name = user.to_string();
    Engine::new(config)
}

fn connected_pair(host_keys: &SharedKeyboard, guest_keys: &SharedKeyboard) -> (Engine, Engine) {
    let mut host = engine(ParticipantRole::Host, HOST_USER);
    let mut guest = engine(ParticipantRole::Guest, GUEST_USER);
    host.add_plugin(UserInputPlugin::new(host_keys.clone()));
    guest.add_plugin(UserInputPlugin::new(guest_keys.clone()));

    let (host_end, guest_end) = LoopbackLink::pair();
    host.attach_peer(PeerId(2), host_end).expect("host link");
    guest.attach_peer(PeerId(1), guest_end).expect("guest link");
    assert!(host.start().is_empty());
    assert!(guest.start().is_empty());
    (host, guest)
}

fn exchange(host: &mut Engine, guest: &mut Engine, rounds: usize) {
    for _ in 0..rounds {
        host.step_frame(FRAME);
        guest.step_frame(FRAME);
    }
}

#[test]
fn participants_see_each_others_users() {
    init_logging();
    let host_keys = SharedKeyboard::new();
    let guest_keys = SharedKeyboard::new();
    let (mut host, mut guest) = connected_pair(&host_keys, &guest_keys);

    exchange(&mut host, &mut guest, 2);

    for engine in [&host, &guest] {
        let directory = engine.directory();
        assert!(directory.get_node(HOST_USER).is_some());
        assert!(directory.get_node(GUEST_USER).is_some());
        let tag = directory.get(&format!("{GUEST_USER}_tag")).expect("guest tag");
        assert_eq!(tag.entity_type(), EntityType::GeometryText);
        assert_eq!(tag.parent_node_name().as_deref(), Some(GUEST_USER));
    }
    assert!(host
        .directory()
        .get(HOST_USER)
        .expect("host user")
        .is_host_created()
        .expect("alive"));
    assert!(!host
        .directory()
        .get(GUEST_USER)
        .expect("guest user")
        .is_host_created()
        .expect("alive"));

    guest_keys.press(Key::D);
    exchange(&mut host, &mut guest, 2);
    guest_keys.release_all();
    exchange(&mut host, &mut guest, 1);
    host.step_frame(FRAME);

    let on_guest = guest.directory().get_node(GUEST_USER).expect("guest user");
    let on_host = host.directory().get_node(GUEST_USER).expect("guest user on host");
    let moved = on_guest.position().expect("position");
    assert!(moved.x > 0.0);
    assert_eq!(on_host.position().expect("position"), moved);

    let stats = host.replication().expect("replication").stats();
    assert!(stats.packets_received >= 2);
    assert_eq!(stats.frame_issues, 0);

    guest.shutdown();
    host.step_frame(FRAME);
    assert!(host.directory().get(GUEST_USER).is_none());
    assert!(host.directory().get(&format!("{GUEST_USER}_tag")).is_none());
    assert!(host.directory().get(HOST_USER).is_some());
    host.shutdown();
}

#[test]
fn failed_plugin_does_not_stop_the_others() {
    init_logging();
    let mut host = engine(ParticipantRole::Host, HOST_USER);
    let first = host.add_plugin(UserInputPlugin::new(SharedKeyboard::new()));
    // same user name, so its name tag collides
    let second = host.add_plugin(UserInputPlugin::new(SharedKeyboard::new()));

    let failures = host.start();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, second);
    assert!(matches!(failures[0].1, PluginError::InitFailed { .. }));

    let scheduler = host.scheduler();
    assert_eq!(scheduler.state(first), Some(PluginState::Running));
    assert_eq!(scheduler.state(second), Some(PluginState::Stopped));
    let replication = scheduler.find("replication").expect("replication");
    assert_eq!(scheduler.state(replication), Some(PluginState::Running));

    host.step_frame(FRAME);
    assert_eq!(host.frames(), 1);
}

#[test]
fn threaded_input_moves_until_suspended() {
    init_logging();
    let keys = SharedKeyboard::new();
    let mut local = engine(ParticipantRole::Local, HOST_USER);
    local
        .scheduler_mut()
        .set_run_interval(Duration::from_millis(2));
    let input = local.add_plugin(UserInputPlugin::new(keys.clone()).with_execution(Execution::Threaded));
    assert!(local.start().is_empty());

    let node = local.directory().get_node(HOST_USER).expect("user node");
    keys.press(Key::PageUp);
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.position().expect("position").y < 3.0 {
        assert!(Instant::now() < deadline, "threaded plugin never stepped");
        std::thread::sleep(Duration::from_millis(2));
    }

    local.scheduler_mut().suspend(input).expect("suspend");
    std::thread::sleep(Duration::from_millis(20));
    let parked = node.position().expect("position");
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(node.position().expect("position"), parked);

    local.scheduler_mut().restart(input).expect("restart");
    let deadline = Instant::now() + Duration::from_secs(5);
    while node.position().expect("position") == parked {
        assert!(Instant::now() < deadline, "threaded plugin never resumed");
        std::thread::sleep(Duration::from_millis(2));
    }

    local.shutdown();
    assert_eq!(local.scheduler().state(input), Some(PluginState::Stopped));
    let stopped = node.position().expect("position");
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(node.position().expect("position"), stopped);
    assert_ne!(stopped, Vector3::ZERO);
}
