//! Minimal echo server.
//!
//! Run with an XCM address, e.g.:
//!
//! ```text
//! cargo run --example echo-server -- utls:127.0.0.1:13001
//! ```
//!
//! Clients connect to the same address with any XCM client; co-resident
//! UTLS clients end up on local IPC automatically.

fn main() -> xcm::Result<()> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "utls:127.0.0.1:13001".to_string());

    let mut server = xcm::server(&addr)?;
    println!(
        "listening on {} ({})",
        server.local_addr().unwrap_or(addr),
        server.transport()
    );

    loop {
        let mut conn = server.accept()?;
        println!("accepted {} connection", conn.transport());

        let mut buf = vec![0u8; conn.max_msg()];
        loop {
            match conn.receive(&mut buf) {
                Ok(0) => break,
                Ok(len) => conn.send(&buf[..len])?,
                Err(err) => {
                    eprintln!("connection error: {err}");
                    break;
                }
            }
        }
    }
}
