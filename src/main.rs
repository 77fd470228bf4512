//! vlproxy - CLI entry point

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vlproxy::{Proxy, ProxyConfig, VERSION};

#[derive(Parser, Debug)]
#[command(name = "vlproxy")]
#[command(version = VERSION)]
#[command(about = "Client-side SOCKS5 proxy daemon over a VLESS outbound")]
struct Args {
    /// Path to the proxy configuration file
    #[arg(short = 'f', long = "config")]
    config: PathBuf,

    /// Local bind address
    #[arg(short = 'b', long = "bind", default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Local bind port
    #[arg(short = 'p', long = "port", default_value_t = 9898)]
    port: u16,
}

fn main() -> anyhow::Result<()> {
    // rustls needs a process-wide crypto provider before any TLS handshake
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vlproxy-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vlproxy=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!("vlproxy v{}", VERSION);

    let config = match ProxyConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "loaded proxy \"{}\" ({}:{})",
        config.name, config.server, config.port
    );

    let bind = SocketAddr::new(args.bind, args.port);
    let proxy = match Proxy::listen(config, bind).await {
        Ok(p) => p,
        Err(e) => {
            error!("failed to bind {}: {}", bind, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = proxy.run().await {
        error!("proxy error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
