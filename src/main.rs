//! fbws - shared frame buffer window server
//!
//! ```text
//! fbws serve --width 800 --height 600     # start the server
//! fbws serve --view                       # ...and show the buffer (feature `viewer`)
//! fbws probe --addr 127.0.0.1:17986       # draw a test window and watch events
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fbws::config::{Config, DEFAULT_PORT};
use fbws::protocol::Event;
use fbws::{Client, PropertyMode, Rect, Region, Server};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Property key the probe stores its title under.
const TITLE_KEY: u32 = 1;

#[derive(Parser)]
#[command(name = "fbws")]
#[command(about = "Shared frame buffer window server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the window server
    Serve {
        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address (e.g., 127.0.0.1)
        #[arg(short, long)]
        bind: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        /// Bits per pixel: 8, 16, 24 or 32
        #[arg(long)]
        bpp: Option<u32>,

        /// Show the frame buffer in a local window
        #[arg(long)]
        view: bool,

        /// Viewer refresh interval in milliseconds
        #[arg(long)]
        refresh: Option<u64>,
    },

    /// Connect, draw a test window and print incoming events
    Probe {
        #[arg(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
        addr: String,

        /// Fill color as 0xRRGGBB
        #[arg(long, default_value = "0x3366cc", value_parser = parse_color)]
        color: u32,

        #[arg(long, default_value = "fbws probe")]
        title: String,

        /// Seconds to keep printing events (0 = until the server hangs up)
        #[arg(long, default_value = "5")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fbws=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            port,
            width,
            height,
            bpp,
            view,
            refresh,
        } => {
            let mut cfg = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            if let Some(width) = width {
                cfg.display.width = width;
            }
            if let Some(height) = height {
                cfg.display.height = height;
            }
            if let Some(bpp) = bpp {
                cfg.display.bits_per_pixel = bpp;
            }
            if let Some(refresh) = refresh {
                cfg.viewer.refresh_ms = refresh;
            }
            run_serve(cfg, view).await
        }
        Commands::Probe {
            addr,
            color,
            title,
            wait,
        } => run_probe(&addr, color, &title, wait).await,
    }
}

fn parse_color(s: &str) -> Result<u32> {
    let hex = s.trim_start_matches("0x").trim_start_matches('#');
    u32::from_str_radix(hex, 16).with_context(|| format!("invalid color {:?}", s))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run_serve(config: Config, view: bool) -> Result<()> {
    let server = Server::start(&config).await?;
    eprintln!("fbws listening on {}", server.local_addr()?);

    if !view {
        server.run(shutdown_signal()).await;
        return Ok(());
    }

    #[cfg(feature = "viewer")]
    {
        let handle = server.handle();
        tokio::spawn(server.run(shutdown_signal()));
        return fbws::viewer::run(handle, Duration::from_millis(config.viewer.refresh_ms)).await;
    }

    #[cfg(not(feature = "viewer"))]
    {
        drop(server);
        anyhow::bail!("--view needs a build with the `viewer` feature");
    }
}

async fn run_probe(addr: &str, color: u32, title: &str, wait: u64) -> Result<()> {
    let mut client = Client::connect(addr).await?;
    let hs = client.handshake();
    info!(
        "connected: {}x{}x{} shmid {}",
        hs.width, hs.height, hs.bits_per_pixel, hs.shm_handle
    );

    let mut fb = client.attach_frame_buffer()?;
    let window = client.create_window(0).await?;
    let rect = Rect::new(
        (hs.width / 4) as i32,
        (hs.height / 4) as i32,
        hs.width / 2,
        hs.height / 2,
    );
    client.set_region(window, Region::new(vec![rect])).await?;
    fb.fill_rect(rect, color)?;

    client.add_property(window, TITLE_KEY).await?;
    client
        .set_property(window, TITLE_KEY, PropertyMode::Replace, title.as_bytes())
        .await?;
    let stored = client.get_property(window, TITLE_KEY).await?;
    println!(
        "window {} title {:?}",
        window,
        String::from_utf8_lossy(&stored)
    );

    let deadline = (wait > 0).then(|| tokio::time::Instant::now() + Duration::from_secs(wait));
    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, client.next_event()).await {
                Ok(next) => next?,
                Err(_) => break,
            },
            None => client.next_event().await?,
        };
        match next {
            Some(Event::Pointer {
                x, y, state, time_ms, ..
            }) => println!("pointer {:>5} ms  ({}, {}) buttons {:#x}", time_ms, x, y, state),
            Some(other) => println!("{:?}", other),
            None => {
                println!("server hung up");
                break;
            }
        }
    }
    Ok(())
}
