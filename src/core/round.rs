//! Host-side round orchestration.
//!
//! The controller owns the canonical grid and every piece of round state. It
//! is driven by one tick loop; all writes go through it and are mirrored to
//! the replication outbox in the same call, so each broadcast is complete and
//! self-consistent when it leaves.
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::config::ArenaConfig;
use crate::core::error::{ArenaError, ArenaResult};
use crate::core::explosion::{self, BlastOutcome};
use crate::core::grid::{CellType, GridModel, GridPos, WorldPos};
use crate::core::mapgen::{self, EmptyCellPool, Placement, PowerUpKind};
use crate::core::replication::{
    Entity, EntityId, EntityKind, Envelope, GridSnapshot, ReplicationChannel, ReplicationMsg,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundPhase {
    Idle,
    Generating,
    AnimatingIntro,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

/// Bombs are replicated entities; their id doubles as the bomb handle.
pub type BombId = EntityId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveBomb {
    pub id: BombId,
    pub owner: PlayerId,
    pub origin: GridPos,
    pub radius: u32,
    pub detonate_at: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loadout {
    pub bomb_capacity: u32,
    pub blast_radius: u32,
    pub speed_upgrades: u32,
}

impl Loadout {
    fn starting(config: &ArenaConfig) -> Self {
        Self {
            bomb_capacity: config.starting_bomb_capacity,
            blast_radius: config.starting_blast_radius,
            speed_upgrades: 0,
        }
    }

    fn apply(&mut self, kind: PowerUpKind) {
        match kind {
            PowerUpKind::BlastRadius => self.blast_radius += 1,
            PowerUpKind::ExtraBomb => self.bomb_capacity += 1,
            PowerUpKind::Speed => self.speed_upgrades += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementRejection {
    MapNotReady,
    CellOccupied(CellType),
    BombLimitReached { capacity: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BombPlacement {
    Placed(BombId),
    Rejected(PlacementRejection),
}

/// Notifications for the presentation layer, drained once per tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundEvent {
    MapGenerated { seed: u64 },
    MapReady,
    BombPlaced { bomb: BombId, owner: PlayerId, pos: GridPos },
    /// Emitted once per detonation, chained ones included.
    Exploded {
        bomb: BombId,
        origin: GridPos,
        affected: Vec<GridPos>,
    },
    PowerUpSpawned { pos: GridPos, kind: PowerUpKind },
    PowerUpCollected { player: PlayerId, pos: GridPos, kind: PowerUpKind },
    PowerUpDestroyed { pos: GridPos },
}

pub struct RoundController {
    config: ArenaConfig,
    channel: ReplicationChannel,
    seed: u64,
    rng: StdRng,
    grid: GridModel,
    phase: RoundPhase,
    map_ready: bool,
    layout: Vec<Placement>,
    pool: EmptyCellPool,
    power_ups: BTreeMap<GridPos, (EntityId, PowerUpKind)>,
    bombs: BTreeMap<BombId, ActiveBomb>,
    loadouts: BTreeMap<PlayerId, Loadout>,
    clock: Duration,
    next_power_up_at: Option<Duration>,
    next_entity: u64,
    events: Vec<RoundEvent>,
}

impl RoundController {
    pub fn new(config: ArenaConfig, channel: ReplicationChannel) -> ArenaResult<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let grid = GridModel::new(config.grid_size, config.geometry)?;
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
            grid,
            config,
            channel,
            phase: RoundPhase::Idle,
            map_ready: false,
            layout: Vec::new(),
            pool: EmptyCellPool::default(),
            power_ups: BTreeMap::new(),
            bombs: BTreeMap::new(),
            loadouts: BTreeMap::new(),
            clock: Duration::ZERO,
            next_power_up_at: None,
            next_entity: 1,
            events: Vec::new(),
        })
    }

    fn require_phase(&self, operation: &'static str, phase: RoundPhase) -> ArenaResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(ArenaError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn next_entity_id(&mut self) -> EntityId {
        let id = EntityId(self.next_entity);
        self.next_entity += 1;
        id
    }

    /// Handles the "start game" signal: generates the map and broadcasts the
    /// full snapshot exactly once. A failed generation leaves the round stuck
    /// in `Generating` until `reset`.
    pub fn start(&mut self) -> ArenaResult<()> {
        self.channel.authorize("start round")?;
        self.require_phase("start", RoundPhase::Idle)?;

        self.phase = RoundPhase::Generating;
        info!(seed = self.seed, round = self.channel.round(), "generating map");

        let generated = match mapgen::generate(&mut self.grid, &self.config, &mut self.rng) {
            Ok(generated) => generated,
            Err(e) => {
                error!(error = %e, "map generation failed");
                return Err(e);
            }
        };

        for (pos, kind) in generated.power_ups {
            let id = self.next_entity_id();
            self.power_ups.insert(pos, (id, kind));
        }
        self.layout = generated.layout;
        self.pool = generated.pool;
        self.events.push(RoundEvent::MapGenerated { seed: self.seed });

        self.phase = RoundPhase::AnimatingIntro;
        let snapshot = self.capture();
        self.channel.broadcast(ReplicationMsg::Snapshot(snapshot))?;
        Ok(())
    }

    /// Handles the intro-finished signal and opens the round for play.
    pub fn intro_complete(&mut self) -> ArenaResult<()> {
        self.channel.authorize("finish intro")?;
        self.require_phase("intro_complete", RoundPhase::AnimatingIntro)?;
        self.phase = RoundPhase::Ready;
        self.map_ready = true;
        self.channel.broadcast(ReplicationMsg::MapReady)?;
        self.events.push(RoundEvent::MapReady);
        info!(round = self.channel.round(), "map ready");
        Ok(())
    }

    /// Aborts the current round from any phase and prepares a fresh one.
    pub fn reset(&mut self) -> ArenaResult<()> {
        self.channel.authorize("reset round")?;
        let seed = self.rng.random();
        self.channel.begin_round();
        self.grid = GridModel::new(self.config.grid_size, self.config.geometry)?;
        self.seed = seed;
        self.rng = StdRng::seed_from_u64(seed);
        self.phase = RoundPhase::Idle;
        self.map_ready = false;
        self.layout.clear();
        self.pool = EmptyCellPool::default();
        self.power_ups.clear();
        self.bombs.clear();
        self.loadouts.clear();
        self.clock = Duration::ZERO;
        self.next_power_up_at = None;
        self.next_entity = 1;
        self.events.clear();
        info!(round = self.channel.round(), seed, "round reset");
        Ok(())
    }

    /// Advances the round clock and resolves everything that fell due: bomb
    /// fuses first, then the power-up respawn timer.
    pub fn tick(&mut self, dt: Duration) -> ArenaResult<()> {
        self.channel.authorize("advance round")?;
        self.clock += dt;
        if self.phase != RoundPhase::Ready {
            return Ok(());
        }

        let mut due: Vec<&ActiveBomb> = self
            .bombs
            .values()
            .filter(|b| b.detonate_at <= self.clock)
            .collect();
        due.sort_by_key(|b| (b.detonate_at, b.id));
        let due: Vec<BombId> = due.into_iter().map(|b| b.id).collect();
        for id in due {
            // An earlier blast in this tick may already have chained it.
            if self.bombs.contains_key(&id) {
                self.detonate(id)?;
            }
        }

        self.run_power_up_cadence()
    }

    fn run_power_up_cadence(&mut self) -> ArenaResult<()> {
        if self.power_up_count() >= self.config.max_power_ups {
            self.next_power_up_at = None;
            return Ok(());
        }
        match self.next_power_up_at {
            None => {
                let secs = self
                    .rng
                    .random_range(self.config.respawn_min_secs..=self.config.respawn_max_secs);
                self.next_power_up_at = Some(self.clock + Duration::from_secs(secs));
                debug!(secs, "power-up respawn scheduled");
            }
            Some(at) if self.clock >= at => {
                self.next_power_up_at = None;
                self.spawn_power_up()?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Places one power-up on a free pool cell. Returns `None` when the count
    /// is already at its maximum or no pool cell is free.
    pub fn spawn_power_up(&mut self) -> ArenaResult<Option<GridPos>> {
        self.channel.authorize("spawn power-up")?;
        self.require_phase("spawn_power_up", RoundPhase::Ready)?;
        if self.power_up_count() >= self.config.max_power_ups {
            return Ok(None);
        }
        let Some(pos) = self.pool.draw(&self.grid, &mut self.rng) else {
            debug!("no free pool cell for power-up");
            return Ok(None);
        };
        let kind = PowerUpKind::random(&mut self.rng);
        let id = self.next_entity_id();
        self.grid.set_cell_type(pos, CellType::PowerUp)?;
        self.power_ups.insert(pos, (id, kind));

        self.channel.broadcast(ReplicationMsg::SetCells {
            cells: vec![(pos, CellType::PowerUp)],
        })?;
        self.channel.broadcast(ReplicationMsg::Spawn(Entity {
            id,
            kind: EntityKind::PowerUp(kind),
            pos,
        }))?;
        self.events.push(RoundEvent::PowerUpSpawned { pos, kind });
        debug!(%pos, ?kind, count = self.power_up_count(), "power-up spawned");
        Ok(Some(pos))
    }

    /// Bomb placement request from the player layer. Only `Empty` and
    /// `PlayerSpawn` cells take a bomb, and only while the map is ready.
    pub fn place_bomb(&mut self, owner: PlayerId, world: WorldPos) -> ArenaResult<BombPlacement> {
        self.channel.authorize("place bomb")?;
        if !self.map_ready {
            return Ok(BombPlacement::Rejected(PlacementRejection::MapNotReady));
        }
        let pos = self.grid.world_to_grid(world)?;
        let cell = self.grid.cell_type(pos)?;
        if !cell.traits().accepts_bomb {
            return Ok(BombPlacement::Rejected(PlacementRejection::CellOccupied(cell)));
        }

        let loadout = self.loadout(owner);
        let active = self.bombs.values().filter(|b| b.owner == owner).count();
        if active >= loadout.bomb_capacity as usize {
            return Ok(BombPlacement::Rejected(
                PlacementRejection::BombLimitReached {
                    capacity: loadout.bomb_capacity,
                },
            ));
        }

        let id = self.next_entity_id();
        let bomb = ActiveBomb {
            id,
            owner,
            origin: pos,
            radius: loadout.blast_radius,
            detonate_at: self.clock + Duration::from_secs_f32(self.config.bomb_fuse_secs),
        };
        self.grid.set_cell_type(pos, CellType::Bomb)?;
        self.bombs.insert(id, bomb);

        self.channel.broadcast(ReplicationMsg::SetCells {
            cells: vec![(pos, CellType::Bomb)],
        })?;
        self.channel.broadcast(ReplicationMsg::Spawn(Self::bomb_entity(&bomb)))?;
        self.events.push(RoundEvent::BombPlaced {
            bomb: id,
            owner,
            pos,
        });
        debug!(?owner, %pos, radius = bomb.radius, "bomb placed");
        Ok(BombPlacement::Placed(id))
    }

    /// Detonates a bomb now, along with every bomb its blast chains into.
    /// Returns one outcome per detonation in resolution order.
    pub fn detonate(&mut self, bomb: BombId) -> ArenaResult<Vec<BlastOutcome>> {
        self.channel.authorize("detonate bomb")?;
        if !self.bombs.contains_key(&bomb) {
            return Err(ArenaError::UnknownBomb(bomb));
        }

        let mut queue = VecDeque::from([bomb]);
        let mut outcomes = Vec::new();
        while let Some(id) = queue.pop_front() {
            let Some(active) = self.bombs.remove(&id) else {
                continue;
            };
            let outcome = explosion::propagate(&mut self.grid, active.origin, active.radius)?;

            let mut despawned = vec![id];
            for pos in &outcome.destroyed_power_ups {
                if let Some((entity, _)) = self.power_ups.remove(pos) {
                    despawned.push(entity);
                    self.events.push(RoundEvent::PowerUpDestroyed { pos: *pos });
                }
                self.pool.insert(*pos);
            }
            for pos in &outcome.destroyed_walls {
                self.pool.insert(*pos);
            }
            for pos in &outcome.chained_bombs {
                queue.extend(
                    self.bombs
                        .values()
                        .filter(|b| b.origin == *pos)
                        .map(|b| b.id),
                );
            }

            self.channel.broadcast(ReplicationMsg::ClearCells {
                coordinates: outcome.clear_batch(&self.grid),
            })?;
            for entity in despawned {
                self.channel.broadcast(ReplicationMsg::Despawn(entity))?;
            }

            debug!(
                ?id,
                origin = %active.origin,
                affected = outcome.affected.len(),
                walls = outcome.destroyed_walls.len(),
                "bomb detonated"
            );
            self.events.push(RoundEvent::Exploded {
                bomb: id,
                origin: active.origin,
                affected: outcome.affected.clone(),
            });
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Power-up pickup from the player layer. Clears the cell and upgrades the
    /// player's loadout; `None` when there was nothing to pick up.
    pub fn consume_power_up(
        &mut self,
        player: PlayerId,
        world: WorldPos,
    ) -> ArenaResult<Option<PowerUpKind>> {
        self.channel.authorize("consume power-up")?;
        let pos = self.grid.world_to_grid(world)?;
        if self.grid.cell_type(pos)? != CellType::PowerUp {
            return Ok(None);
        }
        self.grid.clear_cell(pos)?;
        self.pool.insert(pos);
        self.channel.broadcast(ReplicationMsg::ClearCells {
            coordinates: vec![pos],
        })?;

        let Some((entity, kind)) = self.power_ups.remove(&pos) else {
            warn!(%pos, "power-up cell without a registered power-up");
            return Ok(None);
        };
        self.channel.broadcast(ReplicationMsg::Despawn(entity))?;
        self.loadouts
            .entry(player)
            .or_insert_with(|| Loadout::starting(&self.config))
            .apply(kind);
        self.events
            .push(RoundEvent::PowerUpCollected { player, pos, kind });
        debug!(?player, %pos, ?kind, "power-up collected");
        Ok(Some(kind))
    }

    /// Host mutator for arbitrary cell edits. Bombs and power-ups have their
    /// own entry points and are refused here.
    pub fn set_cell_type(&mut self, pos: GridPos, value: CellType) -> ArenaResult<bool> {
        self.channel.authorize("set cell type")?;
        if matches!(value, CellType::Bomb | CellType::PowerUp) {
            return Err(ArenaError::ReservedCellType(value));
        }
        let previous = self.grid.cell_type(pos)?;
        let changed = self.grid.set_cell_type(pos, value)?;
        if changed {
            self.release_occupant(pos, previous)?;
            if value == CellType::Empty {
                self.pool.insert(pos);
            }
            self.channel.broadcast(ReplicationMsg::SetCells {
                cells: vec![(pos, value)],
            })?;
        }
        Ok(changed)
    }

    pub fn clear_cell(&mut self, pos: GridPos) -> ArenaResult<bool> {
        self.channel.authorize("clear cell")?;
        let previous = self.grid.cell_type(pos)?;
        let changed = self.grid.clear_cell(pos)?;
        if changed {
            self.release_occupant(pos, previous)?;
            self.pool.insert(pos);
            self.channel.broadcast(ReplicationMsg::ClearCells {
                coordinates: vec![pos],
            })?;
        }
        Ok(changed)
    }

    fn release_occupant(&mut self, pos: GridPos, previous: CellType) -> ArenaResult<()> {
        match previous {
            CellType::PowerUp => {
                if let Some((entity, _)) = self.power_ups.remove(&pos) {
                    self.channel.broadcast(ReplicationMsg::Despawn(entity))?;
                }
            }
            CellType::Bomb => {
                let ids: Vec<BombId> = self
                    .bombs
                    .values()
                    .filter(|b| b.origin == pos)
                    .map(|b| b.id)
                    .collect();
                for id in ids {
                    self.bombs.remove(&id);
                    self.channel.broadcast(ReplicationMsg::Despawn(id))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Envelopes to hand a participant that connects mid-round: the current
    /// snapshot, followed by the ready signal once the intro has played.
    pub fn join_snapshot(&mut self) -> ArenaResult<Vec<Envelope>> {
        self.channel.authorize("send join snapshot")?;
        if matches!(self.phase, RoundPhase::Idle | RoundPhase::Generating) {
            return Ok(Vec::new());
        }
        let snapshot = self.capture();
        let mut envelopes = vec![self.channel.seal(ReplicationMsg::Snapshot(snapshot))?];
        if self.map_ready {
            envelopes.push(self.channel.seal(ReplicationMsg::MapReady)?);
        }
        Ok(envelopes)
    }

    fn capture(&self) -> GridSnapshot {
        GridSnapshot::capture(&self.grid, self.entities())
    }

    fn bomb_entity(bomb: &ActiveBomb) -> Entity {
        Entity {
            id: bomb.id,
            kind: EntityKind::Bomb {
                owner: bomb.owner,
                radius: bomb.radius,
            },
            pos: bomb.origin,
        }
    }

    pub fn entities(&self) -> Vec<Entity> {
        let bombs = self.bombs.values().map(Self::bomb_entity);
        let power_ups = self.power_ups.iter().map(|(pos, (id, kind))| Entity {
            id: *id,
            kind: EntityKind::PowerUp(*kind),
            pos: *pos,
        });
        bombs.chain(power_ups).collect()
    }

    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        self.channel.drain()
    }

    pub fn drain_events(&mut self) -> Vec<RoundEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn cell_type(&self, pos: GridPos) -> ArenaResult<CellType> {
        self.grid.cell_type(pos)
    }

    pub fn world_position(&self, pos: GridPos) -> ArenaResult<WorldPos> {
        self.grid.world_position(pos)
    }

    pub fn world_to_grid(&self, world: WorldPos) -> ArenaResult<GridPos> {
        self.grid.world_to_grid(world)
    }

    pub fn is_valid(&self, pos: GridPos) -> bool {
        self.grid.is_valid(pos)
    }

    pub fn grid(&self) -> &GridModel {
        &self.grid
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn channel(&self) -> &ReplicationChannel {
        &self.channel
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn map_ready(&self) -> bool {
        self.map_ready
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn round(&self) -> u32 {
        self.channel.round()
    }

    pub fn clock(&self) -> Duration {
        self.clock
    }

    pub fn power_up_count(&self) -> usize {
        self.power_ups.len()
    }

    pub fn power_ups(&self) -> impl Iterator<Item = (GridPos, PowerUpKind)> + '_ {
        self.power_ups.iter().map(|(pos, (_, kind))| (*pos, *kind))
    }

    pub fn bombs(&self) -> impl Iterator<Item = &ActiveBomb> + '_ {
        self.bombs.values()
    }

    pub fn layout(&self) -> &[Placement] {
        &self.layout
    }

    pub fn pool(&self) -> &EmptyCellPool {
        &self.pool
    }

    pub fn loadout(&self, player: PlayerId) -> Loadout {
        self.loadouts
            .get(&player)
            .copied()
            .unwrap_or_else(|| Loadout::starting(&self.config))
    }
}
