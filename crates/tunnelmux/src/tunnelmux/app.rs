use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::tunnelmux::{
    admin,
    config::{self, Config, ServerConfig, TunnelMode},
    dispatch::{ConnClass, DispatchRules, PortDispatcher},
    logging,
    proxy::{Processor, TunnelServer, TunnelSpec, UdpTunnel},
    quota::{ClientLimits, ClientQuotas, QuotaOracle},
    telemetry,
    tunnel::{
        bridge::Bridge,
        client::{Client, ClientOptions},
        local,
        manager::Manager,
        rendezvous::RendezvousServer,
        server::{ClientAuth, SecretTunnel, Server, ServerOptions},
        transport::{Transport, TransportListener, tcp::TcpTransport, udp::UdpTransport, ws::WsListener},
    },
};

type Tasks = JoinSet<anyhow::Result<()>>;

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path=%resolved.path.display(), source=%resolved.source, "config: created new config file");
    }

    if cfg.server.is_none() && cfg.client.is_none() {
        anyhow::bail!("config: nothing to run (set [server] and/or [client])");
    }

    tracing::info!(
        config=%resolved.path.display(),
        server_enabled=cfg.server.is_some(),
        client_enabled=cfg.client.is_some(),
        clients=cfg.clients.len(),
        tunnels=cfg.tunnels.len(),
        "tunnelmux: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let conns = Arc::new(telemetry::ConnRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Tasks = JoinSet::new();

    let manager = match &cfg.server {
        Some(sc) => Some(start_server(&cfg, sc, prom.clone(), conns.clone(), &mut tasks, &shutdown_rx).await?),
        None => None,
    };

    if let Some(cc) = &cfg.client {
        let mux = cfg.timeouts.mux();
        let client = Client::new(ClientOptions {
            server_addr: cc.server_addr.clone(),
            transport: cc.transport,
            ws_path: cc.ws_path.clone(),
            vkey: cc.vkey.clone(),
            dial_timeout: cc.dial_timeout,
            mux: mux.clone(),
        })?;
        let dialer = client.dialer();
        for spec in &cc.locals {
            tasks.spawn(local::run_local(spec.clone(), dialer.clone(), mux.clone(), shutdown_rx.clone()));
        }
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        },
    };
    let _ = shutdown_tx.send(true);

    if let Some(m) = &manager {
        m.close_all().await;
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks still running after 5s; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

/// Wires the bridge, the public tunnels, rendezvous and the admin API.
async fn start_server(
    cfg: &Config,
    sc: &ServerConfig,
    prom: Arc<metrics_exporter_prometheus::PrometheusHandle>,
    conns: telemetry::SharedConns,
    tasks: &mut Tasks,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<Arc<Manager>> {
    let manager = Arc::new(Manager::new());
    let quotas = Arc::new(ClientQuotas::new(cfg.clients.iter().map(|c| {
        (
            c.id.clone(),
            ClientLimits {
                max_conn: c.max_conn,
                flow_limit: c.flow_limit,
            },
        )
    })));

    let rendezvous = if sc.p2p_port != 0 {
        let r = RendezvousServer::bind(&sc.bind_addr(sc.p2p_port)).await?;
        tracing::info!(addr=?r.local_addr(), public=%sc.p2p_public_addr, "rendezvous: listening");
        let sd = shutdown.clone();
        let run = r.clone();
        tasks.spawn(async move {
            run.run(sd).await;
            Ok(())
        });
        Some(r)
    } else {
        None
    };

    let server = Server::new(
        ServerOptions {
            clients: cfg
                .clients
                .iter()
                .map(|c| ClientAuth {
                    id: c.id.clone(),
                    vkey: c.vkey.clone(),
                    compress: c.compress,
                    crypt: c.crypt,
                })
                .collect(),
            secrets: cfg
                .tunnels
                .iter()
                .filter(|t| matches!(t.mode, TunnelMode::Secret | TunnelMode::P2p))
                .map(|t| SecretTunnel {
                    id: t.id.clone(),
                    client: t.client.clone(),
                    password: t.password.clone(),
                    target: t.targets[0].clone(),
                    p2p: t.mode == TunnelMode::P2p,
                })
                .collect(),
            mux: cfg.timeouts.mux(),
            handshake_timeout: cfg.timeouts.handshake_timeout,
            p2p_addr: sc.p2p_public_addr.clone(),
        },
        manager.clone(),
        quotas.clone(),
        rendezvous,
    );

    let dispatcher = sc.collapses(&cfg.tunnels).then(|| {
        PortDispatcher::new(DispatchRules {
            bridge_host: sc.bridge_host.clone(),
            bridge_path: sc.bridge_path.clone(),
            web_host: sc.web_host.clone(),
            timeout: sc.classify_timeout,
            ..DispatchRules::default()
        })
    });

    // Bridge listeners.
    let tcp = TcpTransport::new();
    let mut bridges: Vec<Box<dyn TransportListener>> = Vec::new();
    match &dispatcher {
        Some(d) => bridges.push(Box::new(d.listener(ConnClass::BridgeControl))),
        None => bridges.push(tcp.listen(&sc.bind_addr(sc.bridge_port)).await?),
    }
    if sc.ws_port != 0 {
        let inner: Box<dyn TransportListener> = match &dispatcher {
            Some(d) if sc.ws_port == sc.bridge_port => Box::new(d.listener(ConnClass::BridgeWs)),
            _ => tcp.listen(&sc.bind_addr(sc.ws_port)).await?,
        };
        bridges.push(Box::new(WsListener::new(inner, &sc.bridge_path)));
    }
    if sc.kcp_port != 0 {
        bridges.push(UdpTransport::new().listen(&sc.bind_addr(sc.kcp_port)).await?);
    }
    for ln in bridges {
        tasks.spawn(server.clone().serve(ln, shutdown.clone()));
    }

    // Public tunnels.
    let vkeys: std::collections::HashMap<&str, &config::ClientEntry> =
        cfg.clients.iter().map(|c| (c.id.as_str(), c)).collect();
    for t in &cfg.tunnels {
        let processor = match t.mode {
            TunnelMode::Tcp | TunnelMode::Udp => Processor::TcpRelay,
            TunnelMode::Http => Processor::HttpProxy,
            TunnelMode::Secret | TunnelMode::P2p => continue,
        };
        let owner = vkeys
            .get(t.client.as_str())
            .with_context(|| format!("tunnel {}: unknown client {}", t.id, t.client))?;
        let bridge: Arc<dyn Bridge> = manager.clone();
        let quota: Arc<dyn QuotaOracle> = quotas.clone();
        let spec = TunnelSpec {
            id: t.id.clone(),
            client: t.client.clone(),
            targets: t.targets.clone(),
            proxy_protocol: t.proxy_protocol,
            compress: owner.compress,
            crypt: owner.crypt,
            vkey: owner.vkey.clone(),
            auth_user: t.auth_user.clone(),
            auth_password: t.auth_password.clone(),
            handshake_timeout: cfg.timeouts.handshake_timeout,
        };

        if t.mode == TunnelMode::Udp {
            let sock = tokio::net::UdpSocket::bind(sc.bind_addr(t.port))
                .await
                .with_context(|| format!("tunnel {}: bind udp port {}", t.id, t.port))?;
            let ut = UdpTunnel::new(spec, bridge, quota, conns.clone(), cfg.timeouts.udp_idle_timeout);
            tasks.spawn(ut.serve(sock, shutdown.clone()));
            continue;
        }

        let ln: Box<dyn TransportListener> = match &dispatcher {
            Some(d) if t.port == sc.bridge_port => {
                let class = match processor {
                    Processor::HttpProxy => ConnClass::HttpProxy,
                    Processor::TcpRelay => ConnClass::HttpsProxy,
                };
                Box::new(d.listener(class))
            }
            _ => tcp.listen(&sc.bind_addr(t.port)).await?,
        };
        tracing::info!(tunnel=%t.id, client=%t.client, port=t.port, mode=?t.mode, "proxy: tunnel listening");

        let ts = TunnelServer::new(spec, processor, bridge, quota, conns.clone());
        let sd = shutdown.clone();
        tasks.spawn(async move { ts.start(ln, sd).await });
    }

    // Admin API.
    let admin_state = admin::AdminState {
        prom,
        conns,
        manager: Some(manager.clone()),
        quotas: Some(quotas),
    };
    match &dispatcher {
        Some(d) if sc.web_port == sc.bridge_port => {
            tasks.spawn(admin::serve_dispatched(d.listener(ConnClass::Manager), admin_state, shutdown.clone()));
        }
        _ if sc.web_port != 0 => {
            let addr: SocketAddr = sc
                .bind_addr(sc.web_port)
                .parse()
                .with_context(|| format!("invalid admin address {}:{}", sc.bind_host, sc.web_port))?;
            tasks.spawn(admin::serve_with_shutdown(addr, admin_state, shutdown.clone()));
        }
        _ => {}
    }

    if let Some(d) = dispatcher {
        if !sc.bridge_host.is_empty() {
            tracing::info!(
                bridge_host=%sc.bridge_host,
                "dispatch: TLS bridge connections are recognized but not terminated; they will be closed"
            );
        }
        let ln = TcpListener::bind(sc.bind_addr(sc.bridge_port))
            .await
            .with_context(|| format!("bind bridge port {}", sc.bridge_port))?;
        tasks.spawn(d.serve(ln, shutdown.clone()));
    }

    Ok(manager)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
