use std::time::Duration;

use anyhow::Result;
use iroh::EndpointId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::ArenaConfig;
use crate::core::replication::{ApplyOutcome, Mirror, ReplicationChannel};
use crate::core::round::{RoundController, RoundEvent, RoundPhase};
use crate::engine::network::{read_frame, NetworkManager, PeerLink};
use crate::engine::sim::Autopilot;
use crate::engine::EngineEvent;

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Peers that must be connected before the round starts.
    pub min_peers: usize,
    pub tick: Duration,
    /// How long the intro plays before the map opens.
    pub intro: Duration,
    pub autoplay: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            min_peers: 1,
            tick: Duration::from_millis(50),
            intro: Duration::from_secs(3),
            autoplay: false,
        }
    }
}

/// Owns the authoritative round and is its only writer.
pub struct HostRunner {
    network: NetworkManager,
    controller: RoundController,
    options: HostOptions,
}

impl HostRunner {
    pub async fn new(config: ArenaConfig, options: HostOptions) -> Result<Self> {
        let controller = RoundController::new(config, ReplicationChannel::host())?;
        Ok(Self {
            network: NetworkManager::new().await?,
            controller,
            options,
        })
    }

    pub fn local_id(&self) -> EndpointId {
        self.network.local_id()
    }

    pub async fn run(mut self) -> Result<()> {
        let endpoint = self.network.endpoint.clone();
        let (event_tx, mut event_rx) = mpsc::channel::<EngineEvent>(32);
        tokio::spawn(NetworkManager::start_accept_loop(endpoint, event_tx));

        let local_id = self.local_id();
        println!("Your Endpoint ID: {local_id}");
        info!(endpoint = %local_id, seed = self.controller.seed(), min_peers = self.options.min_peers, "hosting arena");

        let mut peers: Vec<PeerLink> = Vec::new();
        let mut ticker = tokio::time::interval(self.options.tick);
        let mut intro_deadline: Option<Instant> = None;
        let mut autopilot = self
            .options
            .autoplay
            .then(|| Autopilot::new(self.controller.seed(), 4));

        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => match event {
                    EngineEvent::PeerJoined(mut link) => {
                        let mut delivered = true;
                        for envelope in self.controller.join_snapshot()? {
                            if let Err(e) = link.send(&envelope).await {
                                warn!(peer = %link.id, error = %e, "join snapshot not delivered");
                                delivered = false;
                                break;
                            }
                        }
                        if !delivered {
                            link.close();
                            continue;
                        }
                        peers.push(link);
                        info!(peers = peers.len(), "peer joined");

                        if self.controller.phase() == RoundPhase::Idle
                            && peers.len() >= self.options.min_peers
                        {
                            self.controller.start()?;
                            intro_deadline = Some(Instant::now() + self.options.intro);
                        }
                    }
                    EngineEvent::PeerLeft(id) => {
                        peers.retain(|p| p.id != id);
                        info!(peer = %id, peers = peers.len(), "peer left");
                    }
                },

                _ = ticker.tick() => {
                    self.controller.tick(self.options.tick)?;
                    if intro_deadline.is_some_and(|at| Instant::now() >= at) {
                        intro_deadline = None;
                        self.controller.intro_complete()?;
                    }
                    if let Some(bot) = autopilot.as_mut() {
                        bot.step(&mut self.controller)?;
                    }
                    for event in self.controller.drain_events() {
                        log_event(&event);
                    }
                    fan_out(&mut peers, &mut self.controller).await;
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down host");
                    break;
                }
            }
        }

        for link in peers {
            link.close();
        }
        Ok(())
    }
}

/// Sends every queued envelope to every peer. A peer whose stream fails is
/// dropped; the others keep receiving.
async fn fan_out(peers: &mut Vec<PeerLink>, controller: &mut RoundController) {
    let outbox = controller.drain_outbox();
    if outbox.is_empty() {
        return;
    }
    let mut failed = Vec::new();
    for (idx, link) in peers.iter_mut().enumerate() {
        for envelope in &outbox {
            if let Err(e) = link.send(envelope).await {
                warn!(peer = %link.id, error = %e, "dropping peer after send failure");
                failed.push(idx);
                break;
            }
        }
    }
    for idx in failed.into_iter().rev() {
        peers.swap_remove(idx).close();
    }
}

fn log_event(event: &RoundEvent) {
    match event {
        RoundEvent::MapGenerated { seed } => info!(seed, "map generated"),
        RoundEvent::MapReady => info!("map ready"),
        RoundEvent::BombPlaced { bomb, owner, pos } => {
            debug!(?bomb, ?owner, %pos, "bomb placed")
        }
        RoundEvent::Exploded {
            bomb,
            origin,
            affected,
        } => info!(?bomb, %origin, cells = affected.len(), "explosion"),
        RoundEvent::PowerUpSpawned { pos, kind } => info!(%pos, ?kind, "power-up spawned"),
        RoundEvent::PowerUpCollected { player, pos, kind } => {
            info!(?player, %pos, ?kind, "power-up collected")
        }
        RoundEvent::PowerUpDestroyed { pos } => debug!(%pos, "power-up destroyed"),
    }
}

/// Client: follows the host's replication stream into a local mirror until the
/// host goes away or the user interrupts. Returns the final mirror.
pub async fn run_client(host: EndpointId) -> Result<Mirror> {
    let network = NetworkManager::new().await?;
    let (conn, mut recv) = network.connect(host).await?;
    let mut mirror = Mirror::new();

    loop {
        tokio::select! {
            frame = read_frame(&mut recv) => {
                let Some(envelope) = frame? else {
                    info!("host closed the replication stream");
                    break;
                };
                let (round, seq, kind) = (envelope.round, envelope.seq, envelope.msg.kind());
                let was_ready = mirror.is_map_ready();
                let outcome = mirror.apply(envelope);
                match outcome {
                    ApplyOutcome::Rejected => warn!(round, seq, kind, "envelope rejected"),
                    _ => debug!(round, seq, kind, ?outcome, "envelope applied"),
                }
                if !was_ready && mirror.is_map_ready() {
                    if let Some(grid) = mirror.grid() {
                        info!(round, "map ready");
                        println!("{grid}");
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }

    conn.close(0u32.into(), b"done");
    if let Some(grid) = mirror.grid() {
        println!("{grid}");
    }
    Ok(mirror)
}
