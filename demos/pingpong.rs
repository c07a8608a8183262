//! Two workers ping-ponging an event across a thread boundary.
//!
//! Run with: `cargo run --example pingpong`

use std::sync::Arc;

use lockstep::{Engine, EngineConfig, Event, LinkSpec, RankInfo};

const DRIVER: u64 = 1;
const PING: u64 = 2;
const PONG: u64 = 3;
const ROUNDS: u64 = 10;

fn main() {
    let mut engine = Engine::new(0, EngineConfig::threads(2, 50), None).expect("engine");
    let thread0 = RankInfo::new(0, 0);
    let thread1 = RankInfo::new(0, 1);

    let driver = engine
        .connect(LinkSpec::new(DRIVER, thread0, thread0, 0))
        .expect("wire driver link")
        .expect("send side is local");
    let ping = engine
        .connect(LinkSpec::new(PING, thread0, thread1, 50))
        .expect("wire ping link")
        .expect("send side is local");
    let pong = engine
        .connect(LinkSpec::new(PONG, thread1, thread0, 50))
        .expect("wire pong link")
        .expect("send side is local");

    // One component on thread 0 owns the exchange; it drops its exit
    // reference after the last round.
    let exit = engine.exit();
    exit.ref_inc(1, 0);

    {
        let ping = Arc::clone(&ping);
        engine
            .register_handler(0, DRIVER, move |_| {
                ping.send(0, Event::new(vec![0]));
            })
            .expect("driver handler");
    }
    {
        let sim = engine.simulation(1);
        engine
            .register_handler(1, PING, move |event| {
                println!("[thread 1] ping {} at t={}", event.payload[0], sim.current_cycle());
                pong.send(0, Event::new(event.payload));
            })
            .expect("ping handler");
    }
    {
        let exit = engine.exit();
        let sim = engine.simulation(0);
        engine
            .register_handler(0, PONG, move |event| {
                let round = u64::from(event.payload[0]);
                println!("[thread 0] pong {} at t={}", round, sim.current_cycle());
                if round + 1 < ROUNDS {
                    ping.send(0, Event::new(vec![event.payload[0] + 1]));
                } else {
                    exit.ref_dec(1, 0);
                }
            })
            .expect("pong handler");
    }

    driver.send(10, Event::new(Vec::new()));

    let report = engine.run(u64::MAX).expect("run");
    println!(
        "{}",
        serde_json::to_string_pretty(&report.export_stats()).expect("stats")
    );
}
