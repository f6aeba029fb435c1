//! Construct-then-wire startup, event dispatch between components, and
//! graceful shutdown (§4.8).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use crate::config::WarrenConfig;
use crate::connections::{ConnectionRole as DescriptorRole, ConnectionsList};
use crate::control::ControlServer;
use crate::crypto::{identity::Identity, Crypter};
use crate::error::WarrenError;
use crate::front::{FrontConfig, FrontMultiplexer};
use crate::session::{ConnectionRole as SessionRole, SessionEvent, SessionManager};
use crate::tracker::{TrackerClient, TrackerEvent};
use crate::transport::ReliableTransport;

/// One tracker's fully wired subsystem: its link plus the session manager
/// and front multiplexer serving connections that tracker advertises.
struct TrackerStack {
    client: Arc<TrackerClient>,
    session_manager: Arc<SessionManager>,
    front: Arc<FrontMultiplexer>,
}

/// Load configuration, construct every component in dependency order, wire
/// them together, and run until a shutdown signal arrives.
pub async fn run(config_dir: PathBuf, instance: String) -> Result<(), WarrenError> {
    let config_path = config_dir.join("warren.conf");
    let config = WarrenConfig::from_file(&config_path)?;

    let identity = Identity::from_file(&config.daemon.identity_key)?;
    let identity_public = identity.public_key();
    let crypter = Arc::new(Mutex::new(Crypter::new(identity)));

    let connections_path = config.daemon.runtime_dir.join(format!("{instance}.connections.json"));
    let connections = Arc::new(ConnectionsList::load(connections_path));

    let transport = ReliableTransport::listen(config.daemon.udp_port).await?;
    info!(port = config.daemon.udp_port, "reliable transport bound");

    let mut stacks: HashMap<String, TrackerStack> = HashMap::new();
    for tracker_config in &config.trackers {
        let (session_events_tx, session_events_rx) = mpsc::channel(256);
        let session_manager = SessionManager::new(
            transport.clone(),
            crypter.clone(),
            tracker_config.name.clone(),
            connections.clone(),
            session_events_tx,
        );

        let (tracker_events_tx, tracker_events_rx) = mpsc::channel(256);
        let client = TrackerClient::new(
            tracker_config.clone(),
            config.daemon.ca_bundle.clone(),
            identity_public,
            connections.clone(),
            tracker_events_tx,
        );

        let front = FrontMultiplexer::new(session_manager.clone(), client.clone());
        tokio::spawn(front.clone().run(session_events_rx));

        tokio::spawn(dispatch_tracker_events(
            tracker_config.name.clone(),
            client.clone(),
            session_manager.clone(),
            front.clone(),
            connections.clone(),
            crypter.clone(),
            tracker_events_rx,
        ));

        restore_active_connections(&tracker_config.name, &connections, &session_manager, &front).await;

        stacks.insert(
            tracker_config.name.clone(),
            TrackerStack {
                client,
                session_manager,
                front,
            },
        );
    }

    let trackers_for_control: HashMap<String, Arc<TrackerClient>> =
        stacks.iter().map(|(name, stack)| (name.clone(), stack.client.clone())).collect();

    let socket_path = config.daemon.runtime_dir.join(format!("{instance}.sock"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = ControlServer::new(socket_path, trackers_for_control, connections.clone());
    let control_task = tokio::spawn(control.serve(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown requested, tearing down");

    for (name, stack) in &stacks {
        let active = connections.get(name).await;
        for path in active.active.keys() {
            stack.session_manager.close_connection(path).await;
        }
    }

    let _ = shutdown_tx.send(true);
    match control_task.await {
        Ok(Err(e)) => warn!(error = %e, "control server exited with an error"),
        Err(e) => warn!(error = %e, "control server task panicked during shutdown"),
        Ok(Ok(())) => {}
    }

    if let Err(e) = connections.save().await {
        error!(error = %e, "failed to persist connections list on shutdown");
    }

    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await
    };

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl+C");
}

/// Re-establish front registration and dial out for every connection
/// already known from a previous run, before the tracker link even comes up.
async fn restore_active_connections(
    tracker_name: &str,
    connections: &Arc<ConnectionsList>,
    session_manager: &Arc<SessionManager>,
    front: &Arc<FrontMultiplexer>,
) {
    let active = connections.get(tracker_name).await;
    for descriptor in active.active.values() {
        let role = match descriptor.role {
            DescriptorRole::Server => SessionRole::Server,
            DescriptorRole::Client => SessionRole::Client,
        };
        let front_config = FrontConfig {
            connection_name: descriptor.path.clone(),
            role,
            connect_address: descriptor.connect_address.clone(),
            connect_port: descriptor.connect_port,
            listen_address: descriptor.listen_address.clone(),
            listen_port: descriptor.listen_port,
        };
        if let Err(e) = front.register(front_config).await {
            warn!(connection = %descriptor.path, error = %e, "failed to register restored connection");
            continue;
        }
        if descriptor.fixed {
            let candidates = [(descriptor.connect_address.clone(), descriptor.connect_port)];
            if let Err(e) = session_manager.open(&descriptor.path, role, &candidates).await {
                warn!(connection = %descriptor.path, error = %e, "failed to dial restored connection");
            }
        }
    }
}

async fn dispatch_tracker_events(
    tracker_name: String,
    client: Arc<TrackerClient>,
    session_manager: Arc<SessionManager>,
    front: Arc<FrontMultiplexer>,
    connections: Arc<ConnectionsList>,
    crypter: Arc<Mutex<Crypter>>,
    mut events: mpsc::Receiver<TrackerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TrackerEvent::Registered { daemon_name } => {
                info!(tracker = %tracker_name, daemon_name, "registered with tracker");
                for descriptor in connections.get(&tracker_name).await.active.values() {
                    let connected = front.is_established(&descriptor.path).await;
                    client
                        .report_status(&descriptor.path, descriptor.role, connected, &descriptor.listen_address, descriptor.listen_port)
                        .await;
                }
            }
            TrackerEvent::ServerAvailable {
                path,
                internal_address,
                internal_port,
                external_address,
                external_port,
                server_identity,
                name,
            } => {
                bind_peer_name(&connections, &crypter, &tracker_name, &path, server_identity, &name).await;
                dial_advertised_peer(
                    &connections,
                    &session_manager,
                    &tracker_name,
                    path,
                    internal_address,
                    internal_port,
                    external_address,
                    external_port,
                )
                .await;
            }
            TrackerEvent::PeerAvailable {
                path,
                internal_address,
                internal_port,
                external_address,
                external_port,
                peer_identity,
                name,
            } => {
                bind_peer_name(&connections, &crypter, &tracker_name, &path, peer_identity, &name).await;
                dial_advertised_peer(
                    &connections,
                    &session_manager,
                    &tracker_name,
                    path,
                    internal_address,
                    internal_port,
                    external_address,
                    external_port,
                )
                .await;
            }
            TrackerEvent::AddressRequest { path, .. } => {
                let internal = front
                    .local_listen_address(&path)
                    .await
                    .unwrap_or_default();
                client
                    .respond_to_address_request(
                        String::new(),
                        crate::proto::tracker::AddressResponse {
                            message_id: String::new(),
                            path,
                            internal_address: internal.0,
                            internal_port: internal.1 as u32,
                            external_address: String::new(),
                            external_port: 0,
                        },
                    )
                    .await;
            }
            TrackerEvent::ConnectionRemoved { path } => {
                session_manager.close_connection(&path).await;
                front.unregister(&path).await;
            }
        }
    }
}

/// Cache the tracker-claimed canonical name for `identity` so the crypter
/// can later resolve it against a connection's fixed-peer allow-list, and
/// persist it onto the descriptor for operator visibility (§4.6).
async fn bind_peer_name(
    connections: &Arc<ConnectionsList>,
    crypter: &Arc<Mutex<Crypter>>,
    tracker_name: &str,
    path: &str,
    identity: Vec<u8>,
    name: &str,
) {
    if name.is_empty() {
        return;
    }
    if let Ok(identity) = <[u8; 32]>::try_from(identity.as_slice()) {
        crypter.lock().await.bind_identity_name(tracker_name, identity, name.to_string());
    }
    connections.update_server_name(tracker_name, path, name).await;
}

async fn dial_advertised_peer(
    connections: &Arc<ConnectionsList>,
    session_manager: &Arc<SessionManager>,
    tracker_name: &str,
    path: String,
    internal_address: String,
    internal_port: u16,
    external_address: String,
    external_port: u16,
) {
    let candidates = [(internal_address, internal_port), (external_address, external_port)];
    let role = connections
        .get(tracker_name)
        .await
        .active
        .get(&path)
        .map(|d| match d.role {
            DescriptorRole::Server => SessionRole::Server,
            DescriptorRole::Client => SessionRole::Client,
        })
        .unwrap_or(SessionRole::Client);
    if let Err(e) = session_manager.open(&path, role, &candidates).await {
        warn!(connection = %path, error = %e, "failed to open session toward advertised peer");
    }
}
