//! Host to participant replication: a typed, host-gated outbox and the
//! receiver-side `Mirror`.
//!
//! Delivery is fire-and-forget, at-least-once and unordered. Every envelope
//! carries the round it belongs to and a per-round sequence number; the mirror
//! resolves duplicates and reordering with per-cell last-writer-wins, so the
//! transport never has to.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::{ArenaError, ArenaResult};
use crate::core::grid::{CellType, GridGeometry, GridModel, GridPos, WorldPos};
use crate::core::mapgen::PowerUpKind;
use crate::core::round::PlayerId;

/// Incremental envelopes kept while a mirror waits for its first snapshot.
const MAX_PENDING: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Bomb { owner: PlayerId, radius: u32 },
    PowerUp(PowerUpKind),
}

/// Transient object sitting on a cell: a live bomb or an uncollected power-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    pub pos: GridPos,
}

/// Full replacement state for a mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub size: i32,
    pub geometry: GridGeometry,
    pub coordinates: Vec<GridPos>,
    pub world_positions: Vec<WorldPos>,
    pub cell_types: Vec<CellType>,
    pub entities: Vec<Entity>,
}

impl GridSnapshot {
    pub fn capture(grid: &GridModel, entities: Vec<Entity>) -> Self {
        let (coordinates, world_positions) = grid
            .world_positions()
            .iter()
            .map(|(pos, world)| (*pos, *world))
            .unzip();
        Self {
            size: grid.size(),
            geometry: *grid.geometry(),
            coordinates,
            world_positions,
            cell_types: grid.cells().to_vec(),
            entities,
        }
    }

    fn into_grid(self) -> ArenaResult<(GridModel, Vec<Entity>)> {
        if self.coordinates.len() != self.world_positions.len() {
            return Err(ArenaError::MalformedSnapshot(format!(
                "{} coordinates but {} world positions",
                self.coordinates.len(),
                self.world_positions.len()
            )));
        }
        let grid = GridModel::from_parts(
            self.size,
            self.geometry,
            self.cell_types,
            self.coordinates.into_iter().zip(self.world_positions),
        )?;
        Ok((grid, self.entities))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMsg {
    Snapshot(GridSnapshot),
    /// Clear each listed cell to `Empty` unless it is an indestructible wall.
    ClearCells { coordinates: Vec<GridPos> },
    SetCells { cells: Vec<(GridPos, CellType)> },
    Spawn(Entity),
    Despawn(EntityId),
    MapReady,
}

impl ReplicationMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationMsg::Snapshot(_) => "snapshot",
            ReplicationMsg::ClearCells { .. } => "clear_cells",
            ReplicationMsg::SetCells { .. } => "set_cells",
            ReplicationMsg::Spawn(_) => "spawn",
            ReplicationMsg::Despawn(_) => "despawn",
            ReplicationMsg::MapReady => "map_ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub round: u32,
    pub seq: u64,
    pub msg: ReplicationMsg,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_stdvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Outbox for replication messages. Only a `Role::Host` channel may enqueue.
#[derive(Debug, Clone)]
pub struct ReplicationChannel {
    role: Role,
    round: u32,
    next_seq: u64,
    outbox: VecDeque<Envelope>,
}

impl ReplicationChannel {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            round: 1,
            next_seq: 1,
            outbox: VecDeque::new(),
        }
    }

    pub fn host() -> Self {
        Self::new(Role::Host)
    }

    pub fn peer() -> Self {
        Self::new(Role::Peer)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub(crate) fn authorize(&self, operation: &'static str) -> ArenaResult<()> {
        if self.is_host() {
            Ok(())
        } else {
            warn!(operation, "rejected mutation from non-host participant");
            Err(ArenaError::UnauthorizedMutation { operation })
        }
    }

    /// Stamps a message for direct delivery to one participant (join-time
    /// sync) without queueing it for everyone.
    pub fn seal(&mut self, msg: ReplicationMsg) -> ArenaResult<Envelope> {
        self.authorize("seal replication message")?;
        Ok(self.stamp(msg))
    }

    /// Queues a message for every participant and returns its sequence number.
    pub fn broadcast(&mut self, msg: ReplicationMsg) -> ArenaResult<u64> {
        self.authorize("broadcast replication message")?;
        let envelope = self.stamp(msg);
        let seq = envelope.seq;
        debug!(seq, kind = envelope.msg.kind(), "queued broadcast");
        self.outbox.push_back(envelope);
        Ok(seq)
    }

    fn stamp(&mut self, msg: ReplicationMsg) -> Envelope {
        let envelope = Envelope {
            round: self.round,
            seq: self.next_seq,
            msg,
        };
        self.next_seq += 1;
        envelope
    }

    pub fn drain(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    /// Starts a new round. Envelopes of the aborted round that were never
    /// handed to the transport are dropped whole.
    pub(crate) fn begin_round(&mut self) {
        self.round += 1;
        self.next_seq = 1;
        self.outbox.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied; `changed` counts cells and entities that actually moved.
    Applied { changed: usize },
    /// Held until the first snapshot arrives.
    Buffered,
    /// From an earlier round, or a snapshot older than the current base.
    Stale,
    /// Structurally invalid, or no room left to buffer it; nothing changed.
    Rejected,
}

/// Read-only replica of the host grid, updated only by received envelopes.
#[derive(Debug, Clone, Default)]
pub struct Mirror {
    round: Option<u32>,
    grid: Option<GridModel>,
    versions: Vec<u64>,
    base_seq: u64,
    pending: Vec<Envelope>,
    entities: BTreeMap<EntityId, (u64, Entity)>,
    tombstones: BTreeSet<EntityId>,
    map_ready: bool,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, envelope: Envelope) -> ApplyOutcome {
        match self.round {
            Some(round) if envelope.round < round => return ApplyOutcome::Stale,
            Some(round) if envelope.round > round => {
                debug!(from = round, to = envelope.round, "mirror following new round");
                *self = Self::default();
                self.round = Some(envelope.round);
            }
            Some(_) => {}
            None => self.round = Some(envelope.round),
        }

        match envelope.msg {
            ReplicationMsg::Snapshot(snapshot) => self.apply_snapshot(envelope.seq, snapshot),
            ReplicationMsg::MapReady => {
                let changed = usize::from(!self.map_ready);
                self.map_ready = true;
                ApplyOutcome::Applied { changed }
            }
            _ if self.grid.is_none() => {
                // Anything already buffered may be newer than the snapshot,
                // so nothing buffered is evicted; the newcomer is refused.
                if self.pending.len() >= MAX_PENDING {
                    warn!(seq = envelope.seq, "mirror pending buffer full, refusing update");
                    return ApplyOutcome::Rejected;
                }
                self.pending.push(envelope);
                ApplyOutcome::Buffered
            }
            _ => self.apply_incremental(envelope),
        }
    }

    fn apply_snapshot(&mut self, seq: u64, snapshot: GridSnapshot) -> ApplyOutcome {
        if self.grid.is_some() && seq <= self.base_seq {
            return ApplyOutcome::Stale;
        }
        let (mut grid, entities) = match snapshot.into_grid() {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "rejected snapshot");
                return ApplyOutcome::Rejected;
            }
        };

        let mut versions = vec![seq; grid.cells().len()];
        if let Some(old) = self.grid.as_ref().filter(|old| old.size() == grid.size()) {
            // Cells updated after this snapshot was taken keep their newer value.
            for pos in old.positions() {
                let Ok(idx) = old.index(pos) else { continue };
                if self.versions[idx] > seq && grid.set_cell_type(pos, old.cells()[idx]).is_ok() {
                    versions[idx] = self.versions[idx];
                }
            }
        }

        let mut merged: BTreeMap<EntityId, (u64, Entity)> = entities
            .into_iter()
            .filter(|e| !self.tombstones.contains(&e.id))
            .map(|e| (e.id, (seq, e)))
            .collect();
        for (id, (version, entity)) in &self.entities {
            if *version > seq {
                merged.insert(*id, (*version, *entity));
            }
        }

        let changed = grid.cells().len();
        self.grid = Some(grid);
        self.versions = versions;
        self.entities = merged;
        self.base_seq = seq;

        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|e| e.seq);
        for envelope in pending {
            self.apply_incremental(envelope);
        }

        ApplyOutcome::Applied { changed }
    }

    fn apply_incremental(&mut self, envelope: Envelope) -> ApplyOutcome {
        let seq = envelope.seq;
        let Some(grid) = self.grid.as_mut() else {
            return ApplyOutcome::Buffered;
        };
        // Already folded into the base snapshot.
        if seq <= self.base_seq {
            return ApplyOutcome::Stale;
        }
        let mut changed = 0;

        match envelope.msg {
            ReplicationMsg::ClearCells { coordinates } => {
                for pos in coordinates {
                    let Ok(idx) = grid.index(pos) else {
                        warn!(%pos, "clear for out-of-bounds cell ignored");
                        continue;
                    };
                    if self.versions[idx] >= seq || grid.cells()[idx] == CellType::IndestructibleWall {
                        continue;
                    }
                    self.versions[idx] = seq;
                    if grid.clear_cell(pos).unwrap_or(false) {
                        changed += 1;
                    }
                }
            }
            ReplicationMsg::SetCells { cells } => {
                for (pos, value) in cells {
                    let Ok(idx) = grid.index(pos) else {
                        warn!(%pos, "set for out-of-bounds cell ignored");
                        continue;
                    };
                    if self.versions[idx] >= seq || grid.cells()[idx] == CellType::IndestructibleWall {
                        continue;
                    }
                    self.versions[idx] = seq;
                    if grid.set_cell_type(pos, value).unwrap_or(false) {
                        changed += 1;
                    }
                }
            }
            ReplicationMsg::Spawn(entity) => {
                if !self.tombstones.contains(&entity.id) {
                    let previous = self.entities.insert(entity.id, (seq, entity));
                    changed += usize::from(previous.is_none());
                }
            }
            ReplicationMsg::Despawn(id) => {
                self.tombstones.insert(id);
                changed += usize::from(self.entities.remove(&id).is_some());
            }
            ReplicationMsg::MapReady => {
                changed += usize::from(!self.map_ready);
                self.map_ready = true;
            }
            ReplicationMsg::Snapshot(_) => return ApplyOutcome::Rejected,
        }

        ApplyOutcome::Applied { changed }
    }

    pub fn round(&self) -> Option<u32> {
        self.round
    }

    pub fn is_synced(&self) -> bool {
        self.grid.is_some()
    }

    /// Ready once the host announced it and a base state is present.
    pub fn is_map_ready(&self) -> bool {
        self.map_ready && self.grid.is_some()
    }

    pub fn grid(&self) -> Option<&GridModel> {
        self.grid.as_ref()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn cell_type(&self, pos: GridPos) -> ArenaResult<CellType> {
        self.grid.as_ref().ok_or(ArenaError::NotSynced)?.cell_type(pos)
    }

    pub fn world_position(&self, pos: GridPos) -> ArenaResult<WorldPos> {
        self.grid.as_ref().ok_or(ArenaError::NotSynced)?.world_position(pos)
    }

    pub fn world_to_grid(&self, world: WorldPos) -> ArenaResult<GridPos> {
        self.grid.as_ref().ok_or(ArenaError::NotSynced)?.world_to_grid(world)
    }

    pub fn is_valid(&self, pos: GridPos) -> bool {
        self.grid.as_ref().is_some_and(|g| g.is_valid(pos))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.entities.values().map(|(_, e)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_grid() -> GridModel {
        let mut grid = GridModel::new(5, GridGeometry::default()).unwrap();
        for pos in grid.positions().collect::<Vec<_>>() {
            grid.record_world_position(pos).unwrap();
            let cell = if pos.x % 2 == 1 && pos.y % 2 == 1 {
                CellType::IndestructibleWall
            } else if pos.x == 2 {
                CellType::Wall
            } else {
                CellType::Empty
            };
            grid.set_cell_type(pos, cell).unwrap();
        }
        grid
    }

    fn snapshot_envelope(channel: &mut ReplicationChannel, grid: &GridModel) -> Envelope {
        channel
            .seal(ReplicationMsg::Snapshot(GridSnapshot::capture(grid, Vec::new())))
            .unwrap()
    }

    #[test]
    fn snapshot_reproduces_host_grid() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let mut mirror = Mirror::new();
        let outcome = mirror.apply(snapshot_envelope(&mut channel, &grid));
        assert_eq!(outcome, ApplyOutcome::Applied { changed: 25 });
        assert_eq!(mirror.grid(), Some(&grid));
    }

    #[test]
    fn duplicate_clear_is_idempotent() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let mut mirror = Mirror::new();
        mirror.apply(snapshot_envelope(&mut channel, &grid));

        let clear = channel
            .seal(ReplicationMsg::ClearCells {
                coordinates: vec![GridPos::new(2, 0), GridPos::new(1, 1), GridPos::new(0, 0)],
            })
            .unwrap();
        assert_eq!(mirror.apply(clear.clone()), ApplyOutcome::Applied { changed: 1 });
        let once = mirror.grid().cloned();
        assert_eq!(mirror.apply(clear), ApplyOutcome::Applied { changed: 0 });
        assert_eq!(mirror.grid().cloned(), once);
        assert_eq!(
            mirror.cell_type(GridPos::new(1, 1)).unwrap(),
            CellType::IndestructibleWall
        );
    }

    #[test]
    fn updates_before_snapshot_are_buffered_then_replayed() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let snapshot = snapshot_envelope(&mut channel, &grid);
        let clear = channel
            .seal(ReplicationMsg::ClearCells {
                coordinates: vec![GridPos::new(2, 4)],
            })
            .unwrap();

        let mut mirror = Mirror::new();
        assert_eq!(mirror.apply(clear), ApplyOutcome::Buffered);
        assert!(mirror.cell_type(GridPos::new(2, 4)).is_err());
        mirror.apply(snapshot);
        assert_eq!(mirror.pending(), 0);
        assert_eq!(mirror.cell_type(GridPos::new(2, 4)).unwrap(), CellType::Empty);
    }

    #[test]
    fn older_set_cannot_undo_newer_clear() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let mut mirror = Mirror::new();
        mirror.apply(snapshot_envelope(&mut channel, &grid));

        let pos = GridPos::new(0, 2);
        let set = channel
            .seal(ReplicationMsg::SetCells {
                cells: vec![(pos, CellType::PowerUp)],
            })
            .unwrap();
        let clear = channel
            .seal(ReplicationMsg::ClearCells {
                coordinates: vec![pos],
            })
            .unwrap();
        mirror.apply(clear);
        mirror.apply(set);
        assert_eq!(mirror.cell_type(pos).unwrap(), CellType::Empty);
    }

    #[test]
    fn late_snapshot_keeps_newer_cells() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let mut mirror = Mirror::new();
        mirror.apply(snapshot_envelope(&mut channel, &grid));

        let stale_resync = snapshot_envelope(&mut channel, &grid);
        let pos = GridPos::new(2, 2);
        let clear = channel
            .seal(ReplicationMsg::ClearCells {
                coordinates: vec![pos],
            })
            .unwrap();
        mirror.apply(clear);
        mirror.apply(stale_resync);
        assert_eq!(mirror.cell_type(pos).unwrap(), CellType::Empty);
    }

    #[test]
    fn set_never_overwrites_indestructible() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let mut mirror = Mirror::new();
        mirror.apply(snapshot_envelope(&mut channel, &grid));
        let pos = GridPos::new(3, 3);
        mirror.apply(
            channel
                .seal(ReplicationMsg::SetCells {
                    cells: vec![(pos, CellType::Bomb)],
                })
                .unwrap(),
        );
        assert_eq!(mirror.cell_type(pos).unwrap(), CellType::IndestructibleWall);
    }

    #[test]
    fn despawn_before_spawn_stays_despawned() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let mut mirror = Mirror::new();
        mirror.apply(snapshot_envelope(&mut channel, &grid));
        let entity = Entity {
            id: EntityId(7),
            kind: EntityKind::PowerUp(PowerUpKind::Speed),
            pos: GridPos::new(0, 2),
        };
        let spawn = channel.seal(ReplicationMsg::Spawn(entity)).unwrap();
        let despawn = channel.seal(ReplicationMsg::Despawn(entity.id)).unwrap();
        mirror.apply(despawn);
        mirror.apply(spawn);
        assert_eq!(mirror.entities().count(), 0);
    }

    #[test]
    fn full_pending_buffer_refuses_new_updates_and_keeps_old_ones() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let snapshot = snapshot_envelope(&mut channel, &grid);
        let mut mirror = Mirror::new();

        let first = GridPos::new(2, 0);
        let clear_first = channel
            .seal(ReplicationMsg::ClearCells {
                coordinates: vec![first],
            })
            .unwrap();
        assert_eq!(mirror.apply(clear_first), ApplyOutcome::Buffered);
        for _ in 1..MAX_PENDING {
            let noop = channel.seal(ReplicationMsg::Despawn(EntityId(99))).unwrap();
            assert_eq!(mirror.apply(noop), ApplyOutcome::Buffered);
        }
        let overflow = channel
            .seal(ReplicationMsg::ClearCells {
                coordinates: vec![GridPos::new(2, 4)],
            })
            .unwrap();
        assert_eq!(mirror.apply(overflow), ApplyOutcome::Rejected);
        assert_eq!(mirror.pending(), MAX_PENDING);

        mirror.apply(snapshot);
        assert_eq!(mirror.cell_type(first).unwrap(), CellType::Empty);
    }

    #[test]
    fn updates_older_than_the_base_snapshot_are_stale() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let entity = Entity {
            id: EntityId(3),
            kind: EntityKind::Bomb {
                owner: PlayerId(1),
                radius: 1,
            },
            pos: GridPos::new(0, 0),
        };
        let spawn = channel.seal(ReplicationMsg::Spawn(entity)).unwrap();
        let _despawn = channel.seal(ReplicationMsg::Despawn(entity.id)).unwrap();
        let snapshot = snapshot_envelope(&mut channel, &grid);

        let mut mirror = Mirror::new();
        mirror.apply(snapshot);
        assert_eq!(mirror.apply(spawn), ApplyOutcome::Stale);
        assert_eq!(mirror.entities().count(), 0);
    }

    #[test]
    fn older_round_is_stale_and_newer_round_resets() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let first = snapshot_envelope(&mut channel, &grid);
        let mut mirror = Mirror::new();
        mirror.apply(first.clone());
        mirror.apply(channel.seal(ReplicationMsg::MapReady).unwrap());
        assert!(mirror.is_map_ready());

        channel.begin_round();
        let ready = channel.seal(ReplicationMsg::MapReady).unwrap();
        assert_eq!(mirror.apply(ready), ApplyOutcome::Applied { changed: 1 });
        assert!(!mirror.is_synced());
        assert_eq!(mirror.round(), Some(2));
        assert_eq!(mirror.apply(first), ApplyOutcome::Stale);
    }

    #[test]
    fn peer_channel_cannot_enqueue() {
        let mut channel = ReplicationChannel::peer();
        let err = channel.broadcast(ReplicationMsg::MapReady).unwrap_err();
        assert!(matches!(err, ArenaError::UnauthorizedMutation { .. }));
        assert!(channel.seal(ReplicationMsg::MapReady).is_err());
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn malformed_snapshot_is_rejected_whole() {
        let grid = host_grid();
        let mut snapshot = GridSnapshot::capture(&grid, Vec::new());
        snapshot.cell_types.pop();
        let mut mirror = Mirror::new();
        let outcome = mirror.apply(Envelope {
            round: 1,
            seq: 1,
            msg: ReplicationMsg::Snapshot(snapshot),
        });
        assert_eq!(outcome, ApplyOutcome::Rejected);
        assert!(!mirror.is_synced());
    }

    #[test]
    fn oversized_snapshot_from_the_wire_is_rejected() {
        let snapshot = GridSnapshot {
            size: 46341,
            geometry: GridGeometry::default(),
            coordinates: Vec::new(),
            world_positions: Vec::new(),
            cell_types: Vec::new(),
            entities: Vec::new(),
        };
        let bytes = Envelope {
            round: 1,
            seq: 1,
            msg: ReplicationMsg::Snapshot(snapshot),
        }
        .to_bytes()
        .unwrap();
        let mut mirror = Mirror::new();
        let outcome = mirror.apply(Envelope::from_bytes(&bytes).unwrap());
        assert_eq!(outcome, ApplyOutcome::Rejected);
        assert!(!mirror.is_synced());
    }

    #[test]
    fn snapshot_with_zero_pitch_is_rejected() {
        let grid = host_grid();
        let mut snapshot = GridSnapshot::capture(&grid, Vec::new());
        snapshot.geometry.pitch = 0.0;
        let mut mirror = Mirror::new();
        let outcome = mirror.apply(Envelope {
            round: 1,
            seq: 1,
            msg: ReplicationMsg::Snapshot(snapshot),
        });
        assert_eq!(outcome, ApplyOutcome::Rejected);
    }

    #[test]
    fn envelope_survives_the_wire() {
        let grid = host_grid();
        let mut channel = ReplicationChannel::host();
        let envelope = snapshot_envelope(&mut channel, &grid);
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), envelope);
    }
}
