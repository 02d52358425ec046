//! Event log behavior through the public store API.

use std::sync::Arc;

use rstest::rstest;
use shadowsync_events::{DeviceStatus, EventData, EventType, EventsFilter, NewEvent};
use shadowsync_id::{DeviceId, TenantId};
use shadowsync_manager::store::{EventStore, MemoryEventStore};

fn tenant(id: &str) -> TenantId {
    TenantId::parse(id).unwrap()
}

fn device(id: &str) -> DeviceId {
    DeviceId::parse(id).unwrap()
}

async fn seeded() -> (Arc<dyn EventStore>, TenantId) {
    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::default());
    let t1 = tenant("t1");
    for data in [
        EventData::status_changed(device("foo"), DeviceStatus::Accepted),
        EventData::decommissioned(device("bar")),
        EventData::provisioned(device("baz")),
        EventData::provisioned(device("foo")),
    ] {
        store.append(NewEvent::new(t1.clone(), data)).await.unwrap();
    }
    store
        .append(NewEvent::new(tenant("t2"), EventData::provisioned(device("foo"))))
        .await
        .unwrap();
    (store, t1)
}

#[tokio::test]
async fn mixed_events_come_back_in_insertion_order() {
    let store = MemoryEventStore::default();
    let t1 = tenant("t1");
    let payloads = vec![
        EventData::status_changed(device("foo"), DeviceStatus::Accepted),
        EventData::decommissioned(device("bar")),
        EventData::provisioned(device("baz")),
    ];

    for data in &payloads {
        store.append(NewEvent::new(t1.clone(), data.clone())).await.unwrap();
    }

    let events = store
        .query(&t1, &EventsFilter::new().page(0, 10))
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events.iter().map(|e| e.event_type()).collect::<Vec<_>>(),
        vec![
            EventType::DeviceStatusChanged,
            EventType::DeviceDecommissioned,
            EventType::DeviceProvisioned,
        ]
    );
    for (event, data) in events.iter().zip(&payloads) {
        assert_eq!(&event.data, data);
        assert_eq!(event.tenant_id, t1);
    }
}

#[tokio::test]
async fn skip_and_limit_select_second_oldest() {
    let (store, t1) = seeded().await;
    let all = store.query(&t1, &EventsFilter::new()).await.unwrap();

    let page = store
        .query(&t1, &EventsFilter::new().page(1, 1))
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, all[1].id);
}

#[rstest]
#[case::all(EventsFilter::new(), 4)]
#[case::provisioned(EventsFilter::new().event_type(EventType::DeviceProvisioned), 2)]
#[case::decommissioned(EventsFilter::new().event_type(EventType::DeviceDecommissioned), 1)]
#[case::shadow_updated(EventsFilter::new().event_type(EventType::DeviceShadowUpdated), 0)]
#[case::device(EventsFilter::new().device(device("foo")), 2)]
#[case::device_and_type(
    EventsFilter::new().device(device("foo")).event_type(EventType::DeviceProvisioned),
    1
)]
#[case::past_end(EventsFilter::new().page(10, 10), 0)]
#[tokio::test]
async fn filters_narrow_results(#[case] filter: EventsFilter, #[case] expected: usize) {
    let (store, t1) = seeded().await;
    let events = store.query(&t1, &filter).await.unwrap();
    assert_eq!(events.len(), expected);
    assert!(events.iter().all(|e| filter.matches(e)));
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let (store, t1) = seeded().await;
    let t2 = tenant("t2");

    let theirs = store.query(&t2, &EventsFilter::new()).await.unwrap();
    assert_eq!(theirs.len(), 1);
    assert!(theirs.iter().all(|e| e.tenant_id == t2));

    let ours = store.query(&t1, &EventsFilter::new()).await.unwrap();
    for event in &ours {
        assert!(store.get(&t2, event.id).await.unwrap_err().is_not_found());
    }

    let empty = store.query(&tenant("t3"), &EventsFilter::new()).await.unwrap();
    assert!(empty.is_empty());
}
