//! Fires a burst of conflicting rating updates at one replica, to exercise gossip convergence
//! under load. Point several of these at different replicas of the same group and compare their
//! logs afterwards.
//!
//! ```text
//! $ cargo run --example bombard -- 127.0.0.1:4001 --count 100
//! ```

use rand::Rng;
use reelsync::clock::VectorClock;
use reelsync::oplog::Op;
use reelsync::rpc::{Reply, Request, Transport};
use reelsync::spawn::UdpTransport;
use std::time::Duration;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = pico_args::Arguments::from_env();
    let count: usize = args.opt_value_from_str("--count")?.unwrap_or(100);
    let endpoint: String = args.free_from_str()?;

    let transport = UdpTransport::default();
    let mut rng = rand::thread_rng();
    let mut ts = VectorClock::new();
    let mut sent = 0;
    while sent < count {
        let value = f64::from(rng.gen_range(0u8..=1));
        let request = Request::Update {
            op: Op::UpdateRating { user_id: 1, movie_id: 1, value },
            prev: ts.clone(),
        };
        match transport.call(&endpoint, request) {
            Ok(Reply::Updated { ts: update_ts }) => {
                ts = VectorClock::merge_max(&ts, &update_ts);
                sent += 1;
            }
            Ok(other) => return Err(format!("unexpected reply: {:?}", other).into()),
            Err(err) => eprintln!("retrying after: {}", err),
        }
        std::thread::sleep(Duration::from_millis(rng.gen_range(0..10)));
    }
    println!("sent {} updates, final clock {}", sent, ts);
    Ok(())
}
