//! TCP echo server: one fiber per connection.
//!
//! Run with `RUST_LOG=info cargo run -p strand-echo -- 127.0.0.1:7000`,
//! then `nc 127.0.0.1 7000`.

use anyhow::Result;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use strand::{io, spawn, Runtime};

fn main() -> Result<()> {
    strand::logging::initialize();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string())
        .parse()?;

    let mut runtime = Runtime::new();
    runtime.block_on(move || {
        let listener = match io::listen(&addr, 1024) {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("bind {} failed: {}", addr, e);
                return;
            }
        };
        log::info!("echo server listening on {}", addr);

        loop {
            match io::accept(listener, -1) {
                Ok(conn) => {
                    spawn(move || serve(conn));
                }
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    break;
                }
            }
        }
        let _ = io::close(listener);
    });
    Ok(())
}

fn serve(conn: RawFd) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match io::read(conn, &mut buf, -1) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log::warn!("read on fd {} failed: {}", conn, e);
                break;
            }
        };
        let mut sent = 0;
        while sent < n {
            match io::write(conn, &buf[sent..n], -1) {
                Ok(m) => sent += m,
                Err(e) => {
                    log::warn!("write on fd {} failed: {}", conn, e);
                    let _ = io::close(conn);
                    return;
                }
            }
        }
    }
    let _ = io::close(conn);
}
