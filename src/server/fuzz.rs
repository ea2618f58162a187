use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use tokio::runtime::Runtime;

use super::*;

fn root() -> PathBuf {
    std::env::var("RS_SERVE_ROOT")
        .expect("set RS_SERVE_ROOT for fuzzing")
        .into()
}

/// Feed arbitrary bytes to the request handler as one connection.
pub fn handle(data: &[u8]) {
    let ctx = ServeCtx::new(
        config::DEFAULT_PORT,
        config::DEFAULT_HOSTNAME.into(),
        root(),
        DEFAULT_TIMEOUT,
    )
    .unwrap();
    let peer = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0);

    let rt = Runtime::new().unwrap();
    rt.block_on(async move {
        let mut r = data;
        let mut w = tokio::io::sink();
        ctx.handle(&mut r, &mut w, &peer).await;
    });
}
