use parking_lot::Mutex;
use scene_sync::event::{Event, EventBus, EventGroup, EventType};
use scene_sync::scene::{EntityType, SceneDirectory, Vector3};
use std::sync::Arc;

fn recorder(bus: &EventBus, group: EventGroup) -> Arc<Mutex<Vec<(String, EventType)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe(group, move |event: &Event| {
        sink.lock().push((event.subject.clone(), event.kind));
    });
    seen
}

#[test]
fn directory_changes_arrive_on_their_group() {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = Arc::new(EventBus::new());
    let directory = SceneDirectory::new(Arc::clone(&bus), true);
    let nodes = recorder(&bus, EventGroup::Node);
    let geometry = recorder(&bus, EventGroup::Geometry);

    let room = directory.create_node("room1").expect("room");
    room.set_position(Vector3::new(1.0, 2.0, 3.0)).expect("position");
    let cylinder = directory
        .create_entity("cyl1", EntityType::GeometryCylinder)
        .expect("cylinder");
    cylinder.set_parent_node(&room).expect("parent");
    directory.destroy("cyl1");

    assert_eq!(
        *nodes.lock(),
        vec![
            ("room1".to_string(), EventType::NodeCreate),
            ("room1".to_string(), EventType::NodePosition),
        ]
    );
    assert_eq!(
        *geometry.lock(),
        vec![
            ("cyl1".to_string(), EventType::GeometryCreate),
            ("cyl1".to_string(), EventType::GeometryParent),
            ("cyl1".to_string(), EventType::GeometryDelete),
        ]
    );
}

#[test]
fn handlers_may_mutate_the_scene_they_observe() {
    let bus = Arc::new(EventBus::new());
    let directory = Arc::new(SceneDirectory::new(Arc::clone(&bus), true));

    // every new geometry is parented to a per-geometry anchor node
    let weak = Arc::downgrade(&directory);
    bus.subscribe(EventGroup::Geometry, move |event| {
        if event.kind != EventType::GeometryCreate {
            return;
        }
        let Some(directory) = weak.upgrade() else {
            return;
        };
        let anchor = directory
            .create_node(&format!("{}_anchor", event.subject))
            .expect("anchor");
        if let Some(geometry) = directory.get(&event.subject) {
            geometry.set_parent_node(&anchor).expect("parent");
        }
    });
    let nodes = recorder(&bus, EventGroup::Node);

    directory
        .create_entity("lamp", EntityType::GeometrySphere)
        .expect("lamp");

    let lamp = directory.get("lamp").expect("lamp");
    assert_eq!(lamp.parent_node_name().as_deref(), Some("lamp_anchor"));
    assert_eq!(
        *nodes.lock(),
        vec![("lamp_anchor".to_string(), EventType::NodeCreate)]
    );
}

#[test]
fn publishing_from_many_threads_reaches_every_subscriber() {
    let bus = Arc::new(EventBus::new());
    let seen = recorder(&bus, EventGroup::Light);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                for index in 0..25 {
                    bus.publish(&Event::new(
                        format!("light{worker}_{index}"),
                        EventType::LightDiffuse,
                    ));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("publisher thread");
    }

    assert_eq!(seen.lock().len(), 100);
    assert_eq!(bus.published_count(), 100);
}
