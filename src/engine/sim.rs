//! In-process host plus mirrors over a lossy-looking delivery queue.
//!
//! Every broadcast reaches every mirror at least once, but possibly late,
//! possibly twice, and in any order. Used by the `simulate` command and the
//! convergence tests.
use std::collections::BTreeMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::core::config::ArenaConfig;
use crate::core::error::ArenaResult;
use crate::core::grid::{CellType, GridModel};
use crate::core::replication::{ApplyOutcome, Entity, EntityId, Envelope, Mirror, ReplicationChannel};
use crate::core::round::{BombPlacement, PlayerId, RoundController, RoundEvent, RoundPhase};

/// Stand-in for the player layer: places bombs on random free cells and walks
/// onto random power-ups.
pub struct Autopilot {
    rng: StdRng,
    players: Vec<PlayerId>,
    bomb_chance: f64,
    pickup_chance: f64,
}

impl Autopilot {
    pub fn new(seed: u64, players: u32) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            players: (1..=players).map(PlayerId).collect(),
            bomb_chance: 0.3,
            pickup_chance: 0.1,
        }
    }

    pub fn step(&mut self, round: &mut RoundController) -> ArenaResult<()> {
        if !round.map_ready() {
            return Ok(());
        }
        for player in self.players.clone() {
            if self.rng.random_bool(self.bomb_chance) {
                let free: Vec<_> = round
                    .grid()
                    .positions()
                    .filter(|&p| round.cell_type(p).is_ok_and(|c| c.traits().accepts_bomb))
                    .collect();
                if !free.is_empty() {
                    let pos = free[self.rng.random_range(0..free.len())];
                    let world = round.world_position(pos)?;
                    if let BombPlacement::Rejected(reason) = round.place_bomb(player, world)? {
                        debug!(?player, %pos, ?reason, "autopilot bomb rejected");
                    }
                }
            }
            if self.rng.random_bool(self.pickup_chance) {
                let targets = round.grid().positions_of(CellType::PowerUp);
                if !targets.is_empty() {
                    let pos = targets[self.rng.random_range(0..targets.len())];
                    let world = round.world_position(pos)?;
                    round.consume_power_up(player, world)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub seed: u64,
    pub mirrors: usize,
    pub ticks: u32,
    pub tick: Duration,
    /// Ticks between a round start and its intro completing.
    pub intro_ticks: u32,
    pub players: u32,
    pub duplicate_chance: f64,
    pub max_delay_ticks: u32,
    /// Adds one more mirror at this tick, synced from a join snapshot.
    pub late_join_tick: Option<u32>,
    /// Aborts the running round at this tick and starts a new one.
    pub restart_tick: Option<u32>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            mirrors: 3,
            ticks: 600,
            tick: Duration::from_millis(100),
            intro_ticks: 20,
            players: 4,
            duplicate_chance: 0.2,
            max_delay_ticks: 5,
            late_join_tick: None,
            restart_tick: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimReport {
    pub ticks: u32,
    pub rounds: u32,
    pub broadcasts: usize,
    pub deliveries: usize,
    pub duplicates: usize,
    pub stale: usize,
    pub bombs_placed: usize,
    pub explosions: usize,
    pub power_ups_spawned: usize,
    pub power_ups_collected: usize,
    pub max_power_ups_seen: usize,
    pub converged: bool,
}

struct InFlight {
    due: u32,
    order: u64,
    target: usize,
    envelope: Envelope,
}

pub struct Simulation {
    options: SimOptions,
    controller: RoundController,
    autopilot: Autopilot,
    mirrors: Vec<Mirror>,
    in_flight: Vec<InFlight>,
    rng: StdRng,
    now: u32,
    intro_at: Option<u32>,
    report: SimReport,
}

impl Simulation {
    pub fn new(mut config: ArenaConfig, options: SimOptions) -> ArenaResult<Self> {
        config.seed.get_or_insert(options.seed);
        let controller = RoundController::new(config, ReplicationChannel::host())?;
        Ok(Self {
            autopilot: Autopilot::new(options.seed ^ 0x5eed, options.players),
            rng: StdRng::seed_from_u64(options.seed.wrapping_add(1)),
            mirrors: (0..options.mirrors).map(|_| Mirror::new()).collect(),
            in_flight: Vec::new(),
            controller,
            now: 0,
            intro_at: None,
            report: SimReport::default(),
            options,
        })
    }

    pub fn controller(&self) -> &RoundController {
        &self.controller
    }

    pub fn mirrors(&self) -> &[Mirror] {
        &self.mirrors
    }

    /// Runs every configured tick, then drains the delivery queue and checks
    /// that each mirror matches the host.
    pub fn run(mut self) -> ArenaResult<(SimReport, Self)> {
        self.begin_round()?;
        for _ in 0..self.options.ticks {
            self.step()?;
        }
        self.flush()?;
        self.report.ticks = self.now;
        self.report.converged = self.converged();
        info!(
            ticks = self.report.ticks,
            deliveries = self.report.deliveries,
            duplicates = self.report.duplicates,
            explosions = self.report.explosions,
            converged = self.report.converged,
            "simulation finished"
        );
        Ok((self.report.clone(), self))
    }

    fn begin_round(&mut self) -> ArenaResult<()> {
        self.controller.start()?;
        self.intro_at = Some(self.now + self.options.intro_ticks);
        self.report.rounds += 1;
        Ok(())
    }

    fn step(&mut self) -> ArenaResult<()> {
        self.now += 1;

        if self.options.restart_tick == Some(self.now) {
            debug!(tick = self.now, "restarting round");
            self.controller.reset()?;
            self.begin_round()?;
        }
        if self.intro_at.is_some_and(|at| self.now >= at)
            && self.controller.phase() == RoundPhase::AnimatingIntro
        {
            self.controller.intro_complete()?;
            self.intro_at = None;
        }

        self.controller.tick(self.options.tick)?;
        self.autopilot.step(&mut self.controller)?;
        self.record_events();
        self.schedule_outbox();

        if self.options.late_join_tick == Some(self.now) {
            let target = self.mirrors.len();
            self.mirrors.push(Mirror::new());
            for envelope in self.controller.join_snapshot()? {
                self.enqueue(target, envelope);
            }
        }

        self.deliver(|f, now| f.due <= now);
        Ok(())
    }

    fn flush(&mut self) -> ArenaResult<()> {
        self.schedule_outbox();
        self.deliver(|_, _| true);
        Ok(())
    }

    fn record_events(&mut self) {
        for event in self.controller.drain_events() {
            match event {
                RoundEvent::BombPlaced { .. } => self.report.bombs_placed += 1,
                RoundEvent::Exploded { .. } => self.report.explosions += 1,
                RoundEvent::PowerUpSpawned { .. } => self.report.power_ups_spawned += 1,
                RoundEvent::PowerUpCollected { .. } => self.report.power_ups_collected += 1,
                _ => {}
            }
        }
        self.report.max_power_ups_seen = self
            .report
            .max_power_ups_seen
            .max(self.controller.power_up_count());
    }

    fn schedule_outbox(&mut self) {
        for envelope in self.controller.drain_outbox() {
            self.report.broadcasts += 1;
            for target in 0..self.mirrors.len() {
                if self.rng.random_bool(self.options.duplicate_chance) {
                    self.report.duplicates += 1;
                    self.enqueue(target, envelope.clone());
                }
                self.enqueue(target, envelope.clone());
            }
        }
    }

    fn enqueue(&mut self, target: usize, envelope: Envelope) {
        let delay = self.rng.random_range(0..=self.options.max_delay_ticks);
        self.in_flight.push(InFlight {
            due: self.now + delay,
            order: self.rng.random(),
            target,
            envelope,
        });
    }

    fn deliver(&mut self, ready: impl Fn(&InFlight, u32) -> bool) {
        let now = self.now;
        let (mut due, rest): (Vec<_>, Vec<_>) =
            self.in_flight.drain(..).partition(|f| ready(f, now));
        self.in_flight = rest;
        due.sort_by_key(|f| f.order);
        for flight in due {
            let outcome = self.mirrors[flight.target].apply(flight.envelope);
            self.report.deliveries += 1;
            if outcome == ApplyOutcome::Stale {
                self.report.stale += 1;
            }
        }
    }

    /// True when every mirror holds the host grid, the host entity set and the
    /// host's ready flag.
    pub fn converged(&self) -> bool {
        let host_entities = entity_map(self.controller.entities());
        self.mirrors.iter().all(|mirror| {
            mirror.grid() == Some(self.controller.grid())
                && mirror.round() == Some(self.controller.round())
                && mirror.is_map_ready() == self.controller.map_ready()
                && entity_map(mirror.entities().copied()) == host_entities
        })
    }

    pub fn host_grid(&self) -> &GridModel {
        self.controller.grid()
    }
}

fn entity_map(entities: impl IntoIterator<Item = Entity>) -> BTreeMap<EntityId, Entity> {
    entities.into_iter().map(|e| (e.id, e)).collect()
}
