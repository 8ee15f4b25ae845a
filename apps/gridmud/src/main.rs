use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use gridworld::arbiter::{Arbiter, EVENT_QUEUE_CAP};
use gridworld::config::ServerConfig;
use gridworld::player::PlayerStore;
use gridworld::registry::Registry;
use gridworld::session::{SessionCtx, handle_conn};
use gridworld::viewport::Composer;
use gridworld::world::World;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{Level, info, warn};

fn usage_and_exit() -> ! {
    eprintln!(
        "gridmud (grid world server)\n\n\
USAGE:\n  gridmud [--port PORT]\n\n\
ENV:\n  GRIDMUD_STATIC   optional; default static (holds server.yaml, areas/, player/)\n  RUST_LOG         optional; default info\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Config {
    static_dir: PathBuf,
    port: Option<u16>,
}

fn parse_args() -> Config {
    let static_dir: PathBuf = std::env::var("GRIDMUD_STATIC")
        .unwrap_or_else(|_| "static".to_string())
        .into();
    let mut port = None;

    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--port" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                port = Some(v.parse().unwrap_or_else(|_| usage_and_exit()));
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config { static_dir, port }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        match term {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(err = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gridmud=info,gridworld=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let mut server = ServerConfig::load(&cfg.static_dir)?;
    if let Some(p) = cfg.port {
        server.port = p;
    }

    let world = Arc::new(World::load_dir(&cfg.static_dir.join("areas"))?);
    let start = server.start_location(&world)?;
    let players = server.players_dir(&cfg.static_dir);
    info!(start = %start, players = %players.display(), map = ?server.map, "world ready");

    let registry = Arc::new(Registry::new(PlayerStore::new(players), start));
    let (quit_tx, quit_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAP);
    let arbiter = Arbiter::new(world, registry.clone(), Composer::new(server.map));
    let arbiter_task = tokio::spawn(arbiter.run(events_rx, quit_rx.clone()));

    let bind = server.bind_addr();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "gridmud listening");

    let ctx = SessionCtx {
        registry,
        events: events_tx,
    };
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let ctx = ctx.clone();
                let quit = quit_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_conn(stream, peer.to_string(), ctx, quit).await {
                        warn!(peer = %peer, err = %format!("{e:#}"), "connection ended with error");
                    }
                });
            }
            _ = &mut shutdown => break,
        }
    }

    info!("shutting down");
    quit_tx.send_replace(true);
    drop(ctx);
    arbiter_task.await.context("arbiter task")?;
    Ok(())
}
