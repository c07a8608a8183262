//! Single-worker delivery ordering.
//!
//! Verifies that a single rank, single thread run delivers events in
//! `(time, priority desc, insertion order)` order and at exactly their
//! delivery times.

use std::sync::Arc;

use parking_lot::Mutex;

use lockstep::{Engine, EngineConfig, Event, LinkSpec, RankInfo, SimTime};

const LINK: u64 = 1;

#[test]
fn events_pop_in_time_then_priority_order() {
    let mut engine = Engine::new(0, EngineConfig::single_thread(), None).unwrap();
    let worker = RankInfo::new(0, 0);

    let link = engine
        .connect(LinkSpec::new(LINK, worker, worker, 0))
        .unwrap()
        .expect("send side is local");

    let delivered: Arc<Mutex<Vec<(SimTime, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sim = engine.simulation(0);
    {
        let delivered = Arc::clone(&delivered);
        engine
            .register_handler(0, LINK, move |event| {
                // Delivery happens at exactly the stamped time.
                assert_eq!(sim.current_cycle(), event.delivery_time);
                delivered.lock().push((event.delivery_time, event.priority));
            })
            .unwrap();
    }

    // Times {5, 3, 7, 3}; the second time-3 event carries priority 1 and
    // must be delivered before the priority-0 one.
    link.send(5, Event::new(Vec::new()));
    link.send(3, Event::new(Vec::new()));
    link.send(7, Event::new(Vec::new()));
    link.send(3, Event::new(Vec::new()).with_priority(1));

    let report = engine.run(1_000).unwrap();

    assert_eq!(report.events_delivered, 4);
    assert_eq!(*delivered.lock(), vec![(3, 1), (3, 0), (5, 0), (7, 0)]);
}

#[test]
fn same_key_events_deliver_in_insertion_order() {
    let mut engine = Engine::new(0, EngineConfig::single_thread(), None).unwrap();
    let worker = RankInfo::new(0, 0);

    let link = engine
        .connect(LinkSpec::new(LINK, worker, worker, 0))
        .unwrap()
        .unwrap();

    let delivered: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let delivered = Arc::clone(&delivered);
        engine
            .register_handler(0, LINK, move |event| {
                delivered.lock().push(event.payload);
            })
            .unwrap();
    }

    for tag in 0..8u8 {
        link.send(10, Event::new(vec![tag]));
    }

    engine.run(100).unwrap();

    let order: Vec<u8> = delivered.lock().iter().map(|p| p[0]).collect();
    assert_eq!(order, (0..8).collect::<Vec<u8>>());
}

#[test]
fn run_stops_at_max_time() {
    let mut engine = Engine::new(0, EngineConfig::single_thread(), None).unwrap();
    let worker = RankInfo::new(0, 0);

    let link = engine
        .connect(LinkSpec::new(LINK, worker, worker, 0))
        .unwrap()
        .unwrap();

    let delivered = Arc::new(Mutex::new(0u64));
    {
        let delivered = Arc::clone(&delivered);
        engine
            .register_handler(0, LINK, move |_| *delivered.lock() += 1)
            .unwrap();
    }

    link.send(10, Event::new(Vec::new()));
    link.send(500, Event::new(Vec::new()));

    let report = engine.run(50).unwrap();

    // The event beyond the bound stays undelivered.
    assert_eq!(*delivered.lock(), 1);
    assert_eq!(report.events_delivered, 1);
    assert_eq!(report.end_time, None);
}
