//! `idleased` serves an identifier lease bank over HTTP/JSON.
//!
//! ```text
//! $ idleased 127.0.0.1:8080 &
//! $ curl -X PUT 'http://127.0.0.1:8080/id/alloc?name=build-7&timeout=300'
//! {"id":0,"client":"build-7","timeout":300,"token":1772882419}
//! $ curl 'http://127.0.0.1:8080/id/0'
//! {"id":0,"client":"build-7"}
//! $ curl -X PUT 'http://127.0.0.1:8080/id/release?id=0&token=1772882419'
//! {"error":"success"}
//! ```
//!
//! Release and reset failures answer `406 Not Acceptable` with the reason
//! in the `error` field; malformed parameters answer `400` outright.

use std::net::SocketAddr;
use std::process::exit;

use anyhow::Context;
use clap::Parser;
use idlease_bank::Bank;

mod http;

#[derive(Debug, Parser)]
#[command(author, version, about = "Serve an identifier lease bank over HTTP", long_about = None)]
struct Cli {
    /// Socket address to listen on, e.g. 127.0.0.1:8080
    addr: SocketAddr,
    /// Lowest identifier the bank may lease
    #[arg(long, default_value_t = 0)]
    min: u32,
    /// One past the highest identifier; equal bounds select the full
    /// 32-bit space
    #[arg(long, default_value_t = 0)]
    max: u32,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_target(false).compact().init();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let bank = Bank::new(cli.min, cli.max);
    let served = http::serve(cli.addr, bank.clone())
        .with_context(|| format!("serving {}", cli.addr));
    bank.shutdown();
    served
}
