//! Game lifecycle tracker. Owns the phase machine, the single tracked
//! game identity, and every derived artifact: ticks, 5-tick OHLC, god
//! candles, quality flags, the live-state singleton, and the rug
//! broadcast. The tracker is pure: it consumes snapshots and returns
//! effects, and the runtime applies them to the store and the stream hub.

use chrono::Utc;
use core_types::outbound::{GodCandleFrame, RugFrame, SCHEMA_VERSION};
use core_types::{
    GamePhase, GameSnapshot, GameTick, GameUpdate, GodCandle, LiveState, OhlcIndex,
    PhaseTransition, PrngStatus, PrngTrackingRecord, QualityFlags,
};

/// Cooldown threshold separating COOLDOWN from PRE_ROUND, in ms.
const PRE_ROUND_WINDOW_MS: i64 = 10_000;
/// Tick gap beyond which the quality tracker flags a hole.
const LARGE_GAP_TICKS: i64 = 10;
/// Single-tick price ratio that constitutes a god candle.
const GOD_CANDLE_RATIO: f64 = 10.0;
/// God candles only occur while price is under this cap.
const GOD_CANDLE_PRICE_CAP: f64 = 100.0;
/// Ticks aggregated per OHLC index.
pub const OHLC_WINDOW: i64 = 5;

/// Side effect the runtime must apply, in order.
#[derive(Debug, Clone)]
pub enum TrackerEffect {
    UpsertGame { game_id: String, update: GameUpdate },
    UpsertTick(GameTick),
    UpsertOhlc(OhlcIndex),
    InsertGodCandle(GodCandle),
    UpsertPrng(PrngTrackingRecord),
    SetLiveState(LiveState),
    BroadcastGodCandle(GodCandleFrame),
    BroadcastRug(RugFrame),
}

#[derive(Debug, Clone)]
struct OhlcAccum {
    index: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl OhlcAccum {
    fn start(index: i64, price: f64) -> Self {
        Self {
            index,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn absorb(&mut self, price: f64) {
        self.close = price;
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
    }

    fn to_record(&self, game_id: &str) -> OhlcIndex {
        OhlcIndex {
            game_id: game_id.to_string(),
            index: self.index,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            start_tick: self.index * OHLC_WINDOW,
            end_tick: self.index * OHLC_WINDOW + (OHLC_WINDOW - 1),
        }
    }
}

#[derive(Debug)]
struct TrackedGame {
    game_id: String,
    version: Option<String>,
    server_seed_hash: Option<String>,
    last_tick: Option<i64>,
    last_price: Option<f64>,
    peak: f64,
    quality: QualityFlags,
    ohlc: Option<OhlcAccum>,
    rug_tick: Option<i64>,
    end_price: Option<f64>,
}

impl TrackedGame {
    fn new(snap: &GameSnapshot, game_id: String) -> Self {
        let pf = snap.provably_fair.as_ref();
        Self {
            game_id,
            version: pf.and_then(|p| p.version.clone()),
            server_seed_hash: pf.and_then(|p| p.server_seed_hash.clone()),
            last_tick: None,
            last_price: None,
            peak: 1.0,
            quality: QualityFlags::default(),
            ohlc: None,
            rug_tick: None,
            end_price: None,
        }
    }
}

pub struct GameTracker {
    phase: GamePhase,
    tracked: Option<TrackedGame>,
    games_tracked: u64,
}

impl Default for GameTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GameTracker {
    pub fn new() -> Self {
        Self {
            phase: GamePhase::Waiting,
            tracked: None,
            games_tracked: 0,
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn tracked_game_id(&self) -> Option<&str> {
        self.tracked.as_ref().map(|t| t.game_id.as_str())
    }

    /// Total games that entered tracking since startup.
    pub fn games_tracked(&self) -> u64 {
        self.games_tracked
    }

    /// Feeds one authoritative snapshot through the phase machine and
    /// returns the effects to apply, in order.
    pub fn on_snapshot(&mut self, snap: &GameSnapshot) -> Vec<TrackerEffect> {
        let mut effects = Vec::new();

        match self.phase {
            GamePhase::Rug => self.in_rug(snap, &mut effects),
            GamePhase::Active => self.in_active(snap, &mut effects),
            _ => self.in_idle(snap, &mut effects),
        }

        effects.push(TrackerEffect::SetLiveState(self.live_state(snap)));
        effects
    }

    /// WAITING / COOLDOWN / PRE_ROUND: no tracked game yet. The ACTIVE
    /// gate is the only way in; everything else just moves the idle
    /// phase along the cooldown timeline.
    fn in_idle(&mut self, snap: &GameSnapshot, effects: &mut Vec<TrackerEffect>) {
        if snap.is_active() && !snap.is_rugged() {
            self.enter_active(snap, effects);
            return;
        }

        let cooldown = snap.cooldown_timer.unwrap_or(0);
        let allow_pre_round = snap.allow_pre_round_buys.unwrap_or(false);

        match self.phase {
            GamePhase::Waiting if !snap.is_active() && cooldown > PRE_ROUND_WINDOW_MS => {
                self.phase = GamePhase::Cooldown;
            }
            GamePhase::Cooldown
                if cooldown <= PRE_ROUND_WINDOW_MS
                    && cooldown > 0
                    && allow_pre_round
                    && !snap.is_active() =>
            {
                self.phase = GamePhase::PreRound;
            }
            _ => {}
        }
    }

    fn enter_active(&mut self, snap: &GameSnapshot, effects: &mut Vec<TrackerEffect>) {
        let Some(game_id) = snap.game_id.clone() else {
            tracing::warn!("active snapshot without gameId; not tracking");
            return;
        };

        let from = self.phase;
        self.phase = GamePhase::Active;
        let tracked = TrackedGame::new(snap, game_id.clone());
        let now = Utc::now();

        effects.push(TrackerEffect::UpsertGame {
            game_id: game_id.clone(),
            update: GameUpdate {
                phase: Some(GamePhase::Active),
                version: tracked.version.clone(),
                server_seed_hash: tracked.server_seed_hash.clone(),
                start_time: Some(now),
                has_god_candle: Some(false),
                prng_verified: Some(false),
                phase_transition: Some(PhaseTransition {
                    from,
                    to: GamePhase::Active,
                    tick: snap.tick_count,
                    at: now,
                }),
                ..GameUpdate::default()
            },
        });
        effects.push(TrackerEffect::UpsertPrng(PrngTrackingRecord {
            game_id: game_id.clone(),
            status: PrngStatus::Tracking,
            server_seed_hash: tracked.server_seed_hash.clone(),
            server_seed: None,
            verification: None,
        }));

        self.games_tracked += 1;
        tracing::info!(game_id = %game_id, "tracking new game");
        self.tracked = Some(tracked);
        self.process_tick(snap, effects);
    }

    fn in_active(&mut self, snap: &GameSnapshot, effects: &mut Vec<TrackerEffect>) {
        let tracked_id = self
            .tracked
            .as_ref()
            .map(|t| t.game_id.clone())
            .unwrap_or_default();

        match snap.game_id.as_deref() {
            Some(id) if id == tracked_id => {}
            Some(other) => {
                tracing::warn!(
                    tracked = %tracked_id,
                    snapshot = %other,
                    "snapshot for a different game while tracking; ignored"
                );
                return;
            }
            None => return,
        }

        self.process_tick(snap, effects);

        if snap.is_rugged() {
            self.enter_rug(snap, effects);
        }
    }

    /// Derives tick, OHLC, god-candle, and quality artifacts from one
    /// in-game snapshot.
    fn process_tick(&mut self, snap: &GameSnapshot, effects: &mut Vec<TrackerEffect>) {
        let Some(tracked) = self.tracked.as_mut() else {
            return;
        };
        let Some(tick) = snap.tick_count else {
            return;
        };
        let Some(price) = snap.price else {
            // Still a quality-relevant observation: a snapshot with no
            // usable price cannot advance the tick artifacts.
            return;
        };

        let mut quality = tracked.quality.clone();
        if let Some(last) = tracked.last_tick {
            if tick <= last {
                quality.duplicate_or_out_of_order = true;
            }
            if tick - last > LARGE_GAP_TICKS {
                quality.large_gap = true;
            }
        }
        if price <= 0.0 {
            quality.price_non_positive = true;
        }
        quality.last_checked_at = Some(Utc::now());
        tracked.quality = quality.clone();
        effects.push(TrackerEffect::UpsertGame {
            game_id: tracked.game_id.clone(),
            update: GameUpdate {
                quality: Some(quality),
                ..GameUpdate::default()
            },
        });

        let is_new_tick = tracked.last_tick.map(|last| tick > last).unwrap_or(true);
        if is_new_tick {
            effects.push(TrackerEffect::UpsertTick(GameTick {
                game_id: tracked.game_id.clone(),
                tick,
                price,
            }));

            let index = tick / OHLC_WINDOW;
            match tracked.ohlc.as_mut() {
                Some(accum) if accum.index == index => accum.absorb(price),
                _ => tracked.ohlc = Some(OhlcAccum::start(index, price)),
            }
            if let Some(accum) = tracked.ohlc.as_ref() {
                effects.push(TrackerEffect::UpsertOhlc(accum.to_record(&tracked.game_id)));
            }

            if let Some(prev) = tracked.last_price {
                if prev > 0.0 && price / prev >= GOD_CANDLE_RATIO {
                    let candle = GodCandle {
                        game_id: tracked.game_id.clone(),
                        tick_index: tick,
                        from_price: prev,
                        to_price: price,
                        ratio: price / prev,
                        version: tracked.version.clone().unwrap_or_else(|| "v3".to_string()),
                        under_cap: prev <= GOD_CANDLE_PRICE_CAP,
                    };
                    tracing::info!(
                        game_id = %candle.game_id,
                        tick = candle.tick_index,
                        ratio = candle.ratio,
                        "god candle detected"
                    );
                    effects.push(TrackerEffect::InsertGodCandle(candle.clone()));
                    effects.push(TrackerEffect::UpsertGame {
                        game_id: tracked.game_id.clone(),
                        update: GameUpdate {
                            has_god_candle: Some(true),
                            ..GameUpdate::default()
                        },
                    });
                    effects.push(TrackerEffect::BroadcastGodCandle(GodCandleFrame {
                        schema: SCHEMA_VERSION,
                        kind: "god_candle",
                        game_id: candle.game_id,
                        tick: candle.tick_index,
                        from_price: candle.from_price,
                        to_price: candle.to_price,
                        ratio: candle.ratio,
                        ts: Utc::now(),
                    }));
                }
            }

            if price > tracked.peak {
                tracked.peak = price;
            }
            tracked.last_tick = Some(tick);
            tracked.last_price = Some(price);
        }
    }

    fn enter_rug(&mut self, snap: &GameSnapshot, effects: &mut Vec<TrackerEffect>) {
        let Some(tracked) = self.tracked.as_mut() else {
            return;
        };
        let now = Utc::now();
        let rug_tick = snap.tick_count.or(tracked.last_tick);
        let end_price = snap.price.or(tracked.last_price);
        tracked.rug_tick = rug_tick;
        tracked.end_price = end_price;

        self.phase = GamePhase::Rug;
        tracing::info!(
            game_id = %tracked.game_id,
            tick = rug_tick.unwrap_or(-1),
            "rug detected; awaiting history"
        );

        effects.push(TrackerEffect::UpsertGame {
            game_id: tracked.game_id.clone(),
            update: GameUpdate {
                phase: Some(GamePhase::Rug),
                end_time: Some(now),
                rug_tick,
                end_price,
                peak_multiplier: Some(tracked.peak),
                phase_transition: Some(PhaseTransition {
                    from: GamePhase::Active,
                    to: GamePhase::Rug,
                    tick: rug_tick,
                    at: now,
                }),
                ..GameUpdate::default()
            },
        });
        effects.push(TrackerEffect::BroadcastRug(RugFrame {
            schema: SCHEMA_VERSION,
            kind: "rug",
            game_id: tracked.game_id.clone(),
            tick: rug_tick.unwrap_or(0),
            end_price: end_price.unwrap_or(0.0),
            ts: now,
        }));
    }

    /// RUG: waiting for the cooldown snapshot that carries the ended
    /// game in `gameHistory`. Extraction matches on game id, never on
    /// array position.
    fn in_rug(&mut self, snap: &GameSnapshot, effects: &mut Vec<TrackerEffect>) {
        let Some(history) = snap.game_history.as_ref() else {
            return;
        };
        let Some(tracked) = self.tracked.take() else {
            self.phase = GamePhase::Waiting;
            return;
        };

        let entry = history
            .iter()
            .find(|e| e.id.as_deref() == Some(tracked.game_id.as_str()));

        let Some(entry) = entry else {
            tracing::error!(
                game_id = %tracked.game_id,
                history_len = history.len(),
                "history arrived without the tracked game; resetting tracking"
            );
            effects.push(TrackerEffect::UpsertPrng(PrngTrackingRecord {
                game_id: tracked.game_id.clone(),
                status: PrngStatus::MissingExpected,
                server_seed_hash: tracked.server_seed_hash.clone(),
                server_seed: None,
                verification: None,
            }));
            self.phase = GamePhase::Waiting;
            return;
        };

        let now = Utc::now();
        let pf = entry.provably_fair.as_ref();
        let server_seed = pf.and_then(|p| p.server_seed.clone());
        let server_seed_hash = pf
            .and_then(|p| p.server_seed_hash.clone())
            .or_else(|| tracked.server_seed_hash.clone());
        let total_ticks = if entry.prices.is_empty() {
            None
        } else {
            Some(entry.prices.len() as i64 - 1)
        };
        let peak = entry.peak_multiplier.or(Some(tracked.peak));

        effects.push(TrackerEffect::UpsertGame {
            game_id: tracked.game_id.clone(),
            update: GameUpdate {
                phase: Some(GamePhase::Completed),
                total_ticks,
                peak_multiplier: peak,
                server_seed: server_seed.clone(),
                server_seed_hash: server_seed_hash.clone(),
                quality: Some(tracked.quality.clone()),
                history_entry: serde_json::to_value(entry).ok(),
                phase_transition: Some(PhaseTransition {
                    from: GamePhase::Rug,
                    to: GamePhase::Completed,
                    tick: tracked.rug_tick,
                    at: now,
                }),
                ..GameUpdate::default()
            },
        });

        let status = if server_seed.is_some() {
            PrngStatus::Complete
        } else {
            PrngStatus::AwaitingSeed
        };
        effects.push(TrackerEffect::UpsertPrng(PrngTrackingRecord {
            game_id: tracked.game_id.clone(),
            status,
            server_seed_hash,
            server_seed,
            verification: None,
        }));

        tracing::info!(
            game_id = %tracked.game_id,
            total_ticks = total_ticks.unwrap_or(-1),
            seed_revealed = status == PrngStatus::Complete,
            "authoritative history extracted"
        );
        self.phase = GamePhase::Cooldown;
    }

    fn live_state(&self, snap: &GameSnapshot) -> LiveState {
        LiveState {
            game_id: snap.game_id.clone(),
            phase: Some(self.phase),
            active: snap.active,
            rugged: snap.rugged,
            price: snap.price,
            tick_count: snap.tick_count,
            cooldown_timer: snap.cooldown_timer,
            provably_fair: snap.provably_fair.clone(),
            updated_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::GameHistoryEntry;
    use core_types::ProvablyFair;

    fn snap(v: serde_json::Value) -> GameSnapshot {
        GameSnapshot::parse(&v)
    }

    fn active_snap(game_id: &str, tick: i64, price: f64) -> GameSnapshot {
        snap(serde_json::json!({
            "gameId": game_id,
            "active": true,
            "rugged": false,
            "price": price,
            "tickCount": tick,
            "cooldownTimer": 0,
            "provablyFair": {"serverSeedHash": "hash-1", "version": "v3"}
        }))
    }

    fn ticks_of(effects: &[TrackerEffect]) -> Vec<GameTick> {
        effects
            .iter()
            .filter_map(|e| match e {
                TrackerEffect::UpsertTick(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn cooldown_and_pre_round_gates() {
        let mut tracker = GameTracker::new();
        assert_eq!(tracker.phase(), GamePhase::Waiting);

        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g0", "active": false, "cooldownTimer": 10001
        })));
        assert_eq!(tracker.phase(), GamePhase::Cooldown);

        // 10000 without the pre-round flag must not flip.
        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g0", "active": false, "cooldownTimer": 10000
        })));
        assert_eq!(tracker.phase(), GamePhase::Cooldown);

        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g0", "active": false, "cooldownTimer": 10000, "allowPreRoundBuys": true
        })));
        assert_eq!(tracker.phase(), GamePhase::PreRound);
    }

    #[test]
    fn active_gate_starts_tracking() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g0", "active": false, "cooldownTimer": 12000
        })));
        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g0", "active": false, "cooldownTimer": 5000, "allowPreRoundBuys": true
        })));

        let effects = tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        assert_eq!(tracker.phase(), GamePhase::Active);
        assert_eq!(tracker.tracked_game_id(), Some("g1"));
        assert_eq!(tracker.games_tracked(), 1);

        assert!(effects.iter().any(|e| matches!(
            e,
            TrackerEffect::UpsertPrng(p) if p.status == PrngStatus::Tracking
        )));
        assert_eq!(ticks_of(&effects).len(), 1);
    }

    #[test]
    fn mismatched_game_id_is_ignored_while_tracking() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        let effects = tracker.on_snapshot(&active_snap("g2", 1, 2.0));
        assert!(ticks_of(&effects).is_empty());
        assert_eq!(tracker.tracked_game_id(), Some("g1"));
    }

    #[test]
    fn duplicate_tick_sets_quality_flag_and_stores_once() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        tracker.on_snapshot(&active_snap("g1", 1, 1.1));
        let effects = tracker.on_snapshot(&active_snap("g1", 1, 1.1));

        assert!(ticks_of(&effects).is_empty());
        let quality = effects.iter().find_map(|e| match e {
            TrackerEffect::UpsertGame { update, .. } => update.quality.clone(),
            _ => None,
        });
        assert!(quality.expect("quality update").duplicate_or_out_of_order);
    }

    #[test]
    fn large_gap_flagged_beyond_ten_ticks() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        let effects = tracker.on_snapshot(&active_snap("g1", 11, 1.2));
        let quality = effects
            .iter()
            .find_map(|e| match e {
                TrackerEffect::UpsertGame { update, .. } => update.quality.clone(),
                _ => None,
            })
            .expect("quality update");
        assert!(quality.large_gap);
        assert!(!quality.duplicate_or_out_of_order);
    }

    #[test]
    fn ohlc_windows_aggregate_five_ticks() {
        let mut tracker = GameTracker::new();
        let prices = [1.0, 1.2, 0.9, 1.5, 1.1, 2.0, 1.8];
        let mut last_ohlc = Vec::new();
        for (tick, price) in prices.iter().enumerate() {
            let effects = tracker.on_snapshot(&active_snap("g1", tick as i64, *price));
            for e in effects {
                if let TrackerEffect::UpsertOhlc(o) = e {
                    last_ohlc.push(o);
                }
            }
        }

        let index0 = last_ohlc
            .iter()
            .filter(|o| o.index == 0)
            .last()
            .expect("index 0");
        assert_eq!(index0.open, 1.0);
        assert_eq!(index0.close, 1.1);
        assert_eq!(index0.high, 1.5);
        assert_eq!(index0.low, 0.9);
        assert_eq!(index0.start_tick, 0);
        assert_eq!(index0.end_tick, 4);

        let index1 = last_ohlc
            .iter()
            .filter(|o| o.index == 1)
            .last()
            .expect("index 1");
        assert_eq!(index1.open, 2.0);
        assert_eq!(index1.close, 1.8);
    }

    #[test]
    fn god_candle_detected_with_cap_guard() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 2.0));
        let effects = tracker.on_snapshot(&active_snap("g1", 1, 20.0));

        let candle = effects
            .iter()
            .find_map(|e| match e {
                TrackerEffect::InsertGodCandle(c) => Some(c.clone()),
                _ => None,
            })
            .expect("god candle");
        assert_eq!(candle.tick_index, 1);
        assert_eq!(candle.from_price, 2.0);
        assert!(candle.under_cap);
        assert!(effects
            .iter()
            .any(|e| matches!(e, TrackerEffect::BroadcastGodCandle(_))));
        assert!(effects.iter().any(|e| matches!(
            e,
            TrackerEffect::UpsertGame { update, .. } if update.has_god_candle == Some(true)
        )));
    }

    #[test]
    fn god_candle_over_cap_is_not_under_cap() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 120.0));
        let effects = tracker.on_snapshot(&active_snap("g1", 1, 1300.0));
        let candle = effects
            .iter()
            .find_map(|e| match e {
                TrackerEffect::InsertGodCandle(c) => Some(c.clone()),
                _ => None,
            })
            .expect("god candle");
        assert!(!candle.under_cap);
    }

    #[test]
    fn rug_emits_frame_and_updates_game() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        tracker.on_snapshot(&active_snap("g1", 1, 1.4));

        let effects = tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g1", "active": true, "rugged": true,
            "price": 0.020000000000000018, "tickCount": 2
        })));
        assert_eq!(tracker.phase(), GamePhase::Rug);

        let rug = effects
            .iter()
            .find_map(|e| match e {
                TrackerEffect::BroadcastRug(r) => Some(r.clone()),
                _ => None,
            })
            .expect("rug frame");
        assert_eq!(rug.tick, 2);
        assert_eq!(rug.end_price, 0.020000000000000018);

        assert!(effects.iter().any(|e| matches!(
            e,
            TrackerEffect::UpsertGame { update, .. }
                if update.phase == Some(GamePhase::Rug) && update.rug_tick == Some(2)
        )));
    }

    #[test]
    fn history_extraction_matches_by_id_not_position() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g1", "active": true, "rugged": true, "price": 0.02, "tickCount": 1
        })));

        // History leads with a different game; g1 sits at position 1.
        let decoy = GameHistoryEntry {
            id: Some("g0".to_string()),
            prices: vec![1.0],
            peak_multiplier: Some(1.0),
            provably_fair: None,
            rugged: Some(true),
        };
        let ended = GameHistoryEntry {
            id: Some("g1".to_string()),
            prices: vec![1.0, 1.4, 0.02],
            peak_multiplier: Some(1.4),
            provably_fair: Some(ProvablyFair {
                server_seed: Some("seed-1".to_string()),
                server_seed_hash: Some("hash-1".to_string()),
                version: Some("v3".to_string()),
            }),
            rugged: Some(true),
        };
        let mut cooldown = snap(serde_json::json!({
            "gameId": "g2", "active": false, "cooldownTimer": 15000
        }));
        cooldown.game_history = Some(vec![decoy, ended]);

        let effects = tracker.on_snapshot(&cooldown);
        assert_eq!(tracker.phase(), GamePhase::Cooldown);
        assert_eq!(tracker.tracked_game_id(), None);

        let completed = effects
            .iter()
            .find_map(|e| match e {
                TrackerEffect::UpsertGame { game_id, update }
                    if update.phase == Some(GamePhase::Completed) =>
                {
                    Some((game_id.clone(), update.clone()))
                }
                _ => None,
            })
            .expect("completed game update");
        assert_eq!(completed.0, "g1");
        assert_eq!(completed.1.total_ticks, Some(2));
        assert_eq!(completed.1.server_seed.as_deref(), Some("seed-1"));

        assert!(effects.iter().any(|e| matches!(
            e,
            TrackerEffect::UpsertPrng(p)
                if p.status == PrngStatus::Complete && p.server_seed.as_deref() == Some("seed-1")
        )));
    }

    #[test]
    fn history_without_tracked_game_resets_tracking() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g1", "active": true, "rugged": true, "price": 0.02, "tickCount": 1
        })));

        let mut cooldown = snap(serde_json::json!({
            "gameId": "g2", "active": false, "cooldownTimer": 15000
        }));
        cooldown.game_history = Some(vec![GameHistoryEntry {
            id: Some("g-other".to_string()),
            prices: vec![1.0],
            peak_multiplier: Some(1.0),
            provably_fair: None,
            rugged: Some(true),
        }]);

        let effects = tracker.on_snapshot(&cooldown);
        assert_eq!(tracker.phase(), GamePhase::Waiting);
        assert_eq!(tracker.tracked_game_id(), None);
        assert!(effects.iter().any(|e| matches!(
            e,
            TrackerEffect::UpsertPrng(p) if p.status == PrngStatus::MissingExpected
        )));
    }

    #[test]
    fn history_without_seed_awaits_seed() {
        let mut tracker = GameTracker::new();
        tracker.on_snapshot(&active_snap("g1", 0, 1.0));
        tracker.on_snapshot(&snap(serde_json::json!({
            "gameId": "g1", "active": true, "rugged": true, "price": 0.02, "tickCount": 1
        })));

        let mut cooldown = snap(serde_json::json!({
            "gameId": "g2", "active": false, "cooldownTimer": 15000
        }));
        cooldown.game_history = Some(vec![GameHistoryEntry {
            id: Some("g1".to_string()),
            prices: vec![1.0, 0.02],
            peak_multiplier: Some(1.0),
            provably_fair: None,
            rugged: Some(true),
        }]);

        let effects = tracker.on_snapshot(&cooldown);
        assert!(effects.iter().any(|e| matches!(
            e,
            TrackerEffect::UpsertPrng(p) if p.status == PrngStatus::AwaitingSeed
        )));
    }

    #[test]
    fn live_state_follows_every_snapshot() {
        let mut tracker = GameTracker::new();
        let effects = tracker.on_snapshot(&active_snap("g1", 3, 1.7));
        let live = effects
            .iter()
            .find_map(|e| match e {
                TrackerEffect::SetLiveState(l) => Some(l.clone()),
                _ => None,
            })
            .expect("live state");
        assert_eq!(live.game_id.as_deref(), Some("g1"));
        assert_eq!(live.phase, Some(GamePhase::Active));
        assert_eq!(live.tick_count, Some(3));
    }

    #[test]
    fn full_game_produces_expected_artifact_counts() {
        let mut tracker = GameTracker::new();
        let mut tick_count = 0usize;
        let mut ohlc_max_index = 0i64;

        for tick in 0..33i64 {
            let rugged = tick == 32;
            let price = if rugged { 0.020000000000000018 } else { 1.0 + tick as f64 * 0.01 };
            let effects = tracker.on_snapshot(&snap(serde_json::json!({
                "gameId": "G1", "active": true, "rugged": rugged,
                "price": price, "tickCount": tick,
                "provablyFair": {"serverSeedHash": "h", "version": "v3"}
            })));
            for e in &effects {
                match e {
                    TrackerEffect::UpsertTick(_) => tick_count += 1,
                    TrackerEffect::UpsertOhlc(o) => ohlc_max_index = ohlc_max_index.max(o.index),
                    _ => {}
                }
            }
        }

        assert_eq!(tick_count, 33);
        assert_eq!(ohlc_max_index, 6); // ceil(33 / 5) = 7 windows, indices 0..=6
        assert_eq!(tracker.phase(), GamePhase::Rug);
    }
}
