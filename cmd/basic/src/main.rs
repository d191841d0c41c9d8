//! Minimal demo: two yielding fibers, a sleeper, and a pipe handoff.
//!
//! Run with `RUST_LOG=info cargo run -p strand-basic`.

use anyhow::Result;
use strand::{io, sleep_ms, spawn, yield_now, Runtime};

fn main() -> Result<()> {
    strand::logging::initialize();

    let mut runtime = Runtime::new();

    runtime.spawn(|| {
        for i in 0..4 {
            log::info!("ping {}", i);
            yield_now();
        }
    });
    runtime.spawn(|| {
        for i in 0..4 {
            log::info!("pong {}", i);
            yield_now();
        }
    });
    runtime.spawn(|| {
        sleep_ms(100);
        log::info!("timer fired after 100 ms");
    });
    runtime.spawn(|| {
        let (r, w) = io::pipe().expect("pipe");
        spawn(move || {
            let mut buf = [0u8; 32];
            let n = io::read(r, &mut buf, 1000).expect("read");
            log::info!("pipe delivered {:?}", std::str::from_utf8(&buf[..n]).unwrap());
            io::close(r).expect("close read end");
        });
        spawn(move || {
            sleep_ms(50);
            io::write(w, b"hello fibers", -1).expect("write");
            io::close(w).expect("close write end");
        });
    });

    runtime.run();
    log::info!("all fibers finished");
    Ok(())
}
