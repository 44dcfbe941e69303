//! Deterministic aggregation of per-source opinions into a directional
//! signal with a calibrated confidence.
//!
//! Thresholds by valid-source count:
//!   one    : directional >= 0.80; NEUTRAL >= 0.65 resolved by regime bias
//!            (confidence passed through undiluted)
//!   two    : agreement: weighted sum >= 0.75; disagreement: score margin
//!            >= 0.70
//!   three+ : argmax direction; margin over runner-up, normalized by the
//!            total active score mass, >= 0.80; regime tie-break, drop on
//!            residual tie
//!
//! Emitted confidence is always the calibrated value; thresholds compare
//! the raw score.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::calibration::CalibratorHandle;
use crate::adapters::PriceAnchor;
use crate::config::ConsensusSettings;
use crate::fingerprint;
use crate::models::{
    Action, AssetClass, CalibrationTag, ContributingSource, Direction, Regime, RegimeKind, Signal,
    SourceOpinion, SymbolSpec, Validity,
};

const SINGLE_DIRECTIONAL_MIN: f64 = 0.80;
const SINGLE_NEUTRAL_MIN: f64 = 0.65;
const TWO_AGREE_MIN: f64 = 0.75;
const TWO_DISAGREE_MIN: f64 = 0.70;
const MULTI_MARGIN_MIN: f64 = 0.80;

/// Base weights per source, one track per asset class.
#[derive(Debug, Clone, Default)]
pub struct TrackWeights {
    pub stock: HashMap<String, f64>,
    pub crypto: HashMap<String, f64>,
}

impl TrackWeights {
    fn track(&self, class: AssetClass) -> &HashMap<String, f64> {
        match class {
            AssetClass::Stock => &self.stock,
            AssetClass::Crypto => &self.crypto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSignalReason {
    NoValidSources,
    BelowThreshold,
    Tie,
    NoRegimeBias,
    NoPriceAnchor,
}

#[derive(Debug)]
pub enum ConsensusOutcome {
    Emit(SignalDraft),
    NoSignal(NoSignalReason),
}

/// An emitted decision before identity assignment. The caller supplies the
/// signal id (live ids are time-ordered; the backtester uses deterministic
/// ones) and the fingerprint is sealed at that point.
#[derive(Debug, Clone)]
pub struct SignalDraft {
    pub symbol: String,
    pub action: Action,
    pub raw_confidence: f64,
    pub calibrated_confidence: f64,
    pub calibration: CalibrationTag,
    pub entry_price: f64,
    pub target_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub regime: Regime,
    pub strategy_version: String,
    pub generated_at: DateTime<Utc>,
    pub contributing_sources: Vec<ContributingSource>,
}

impl SignalDraft {
    pub fn into_signal(self, signal_id: String) -> Signal {
        let mut signal = Signal {
            signal_id,
            symbol: self.symbol,
            action: self.action,
            confidence: self.calibrated_confidence,
            entry_price: self.entry_price,
            target_price: self.target_price,
            stop_price: self.stop_price,
            regime: self.regime,
            strategy_version: self.strategy_version,
            generated_at: self.generated_at,
            contributing_sources: self.contributing_sources,
            fingerprint: String::new(),
            calibration: self.calibration,
            outcome: None,
            pnl_pct: None,
            order_refs: Vec::new(),
        };
        signal.fingerprint = fingerprint::compute(&signal);
        signal
    }
}

/// Time-ordered live id: zero-padded microsecond hex prefix keeps
/// lexicographic order aligned with generation order.
pub fn live_signal_id(now: DateTime<Utc>) -> String {
    let micros = now.timestamp_micros().max(0);
    let tail = uuid::Uuid::new_v4().simple().to_string();
    format!("{:016x}-{}", micros, &tail[..8])
}

pub struct ConsensusEngine {
    settings: ConsensusSettings,
    weights: TrackWeights,
    calibrator: Arc<CalibratorHandle>,
}

struct WeightedOpinion<'a> {
    opinion: &'a SourceOpinion,
    weight: f64,
}

impl ConsensusEngine {
    pub fn new(
        settings: ConsensusSettings,
        weights: TrackWeights,
        calibrator: Arc<CalibratorHandle>,
    ) -> Self {
        Self {
            settings,
            weights,
            calibrator,
        }
    }

    pub fn calibrator(&self) -> &Arc<CalibratorHandle> {
        &self.calibrator
    }

    pub fn evaluate(
        &self,
        symbol: &SymbolSpec,
        opinions: &[SourceOpinion],
        regime: Regime,
        anchor: Option<PriceAnchor>,
        now: DateTime<Utc>,
    ) -> ConsensusOutcome {
        let track = self.weights.track(symbol.class);

        // Active set: valid opinions with a configured weight, renormalized.
        let mut active: Vec<WeightedOpinion> = opinions
            .iter()
            .filter(|o| o.validity == Validity::Ok)
            .filter_map(|o| {
                track
                    .get(&o.source_id)
                    .map(|w| WeightedOpinion { opinion: o, weight: *w })
            })
            .collect();

        if active.is_empty() {
            return ConsensusOutcome::NoSignal(NoSignalReason::NoValidSources);
        }
        let total_weight: f64 = active.iter().map(|a| a.weight).sum();
        for a in &mut active {
            a.weight /= total_weight;
        }

        let decided = match active.len() {
            1 => self.single_source(&active[0], regime),
            2 => self.two_sources(&active),
            _ => self.many_sources(&active, regime),
        };

        let (direction, raw_confidence) = match decided {
            Ok(pair) => pair,
            Err(reason) => return ConsensusOutcome::NoSignal(reason),
        };
        let Some(action) = Action::from_direction(direction) else {
            return ConsensusOutcome::NoSignal(NoSignalReason::BelowThreshold);
        };

        // Price anchoring is mandatory: no fresh trade price, no signal.
        let Some(anchor) = anchor else {
            debug!(symbol = %symbol.symbol, "signal dropped: no price anchor");
            return ConsensusOutcome::NoSignal(NoSignalReason::NoPriceAnchor);
        };

        let (target_price, stop_price) = self.protective_prices(action, &anchor, regime);

        let curve = self.calibrator.current();
        let calibrated_confidence = curve.apply(raw_confidence);
        let calibration = curve.tag();

        let contributing_sources = active
            .iter()
            .map(|a| ContributingSource {
                source_id: a.opinion.source_id.clone(),
                direction: a.opinion.direction,
                weight: a.weight,
                confidence: a.opinion.confidence,
            })
            .collect();

        ConsensusOutcome::Emit(SignalDraft {
            symbol: symbol.symbol.clone(),
            action,
            raw_confidence,
            calibrated_confidence,
            calibration,
            entry_price: anchor.price,
            target_price: Some(target_price),
            stop_price: Some(stop_price),
            regime,
            strategy_version: self.settings.strategy_version.clone(),
            generated_at: now,
            contributing_sources,
        })
    }

    fn single_source(
        &self,
        source: &WeightedOpinion<'_>,
        regime: Regime,
    ) -> Result<(Direction, f64), NoSignalReason> {
        let op = source.opinion;
        if op.direction.is_directional() {
            if op.confidence >= SINGLE_DIRECTIONAL_MIN {
                return Ok((op.direction, op.confidence));
            }
            return Err(NoSignalReason::BelowThreshold);
        }
        if op.confidence >= SINGLE_NEUTRAL_MIN {
            let bias = regime.kind.dominant_bias();
            if bias == Direction::Neutral {
                return Err(NoSignalReason::NoRegimeBias);
            }
            // Confidence passes through undiluted.
            return Ok((bias, op.confidence));
        }
        Err(NoSignalReason::BelowThreshold)
    }

    fn two_sources(&self, active: &[WeightedOpinion<'_>]) -> Result<(Direction, f64), NoSignalReason> {
        let (a, b) = (&active[0], &active[1]);
        let score = |w: &WeightedOpinion<'_>| w.weight * w.opinion.confidence;

        if a.opinion.direction == b.opinion.direction {
            if !a.opinion.direction.is_directional() {
                return Err(NoSignalReason::BelowThreshold);
            }
            let combined = score(a) + score(b);
            if combined >= TWO_AGREE_MIN {
                return Ok((a.opinion.direction, combined));
            }
            return Err(NoSignalReason::BelowThreshold);
        }

        let (winner, loser) = if score(a) >= score(b) { (a, b) } else { (b, a) };
        if !winner.opinion.direction.is_directional() {
            return Err(NoSignalReason::BelowThreshold);
        }
        let margin = score(winner) - score(loser);
        if margin >= TWO_DISAGREE_MIN {
            return Ok((winner.opinion.direction, margin));
        }
        Err(NoSignalReason::BelowThreshold)
    }

    /// Three or more: per-direction score mass, margin over the runner-up
    /// normalized by the total mass so renormalized weights cancel out.
    fn many_sources(
        &self,
        active: &[WeightedOpinion<'_>],
        regime: Regime,
    ) -> Result<(Direction, f64), NoSignalReason> {
        let mut scores: HashMap<Direction, f64> = HashMap::new();
        let mut total = 0.0;
        for a in active {
            let s = a.weight * a.opinion.confidence;
            *scores.entry(a.opinion.direction).or_insert(0.0) += s;
            total += s;
        }
        if total <= 0.0 {
            return Err(NoSignalReason::BelowThreshold);
        }

        let mut ranked: Vec<(Direction, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (mut winner, top) = ranked[0];
        let runner_up = ranked.get(1).map(|(_, s)| *s).unwrap_or(0.0);

        if (top - runner_up).abs() < f64::EPSILON && ranked.len() > 1 {
            // Exact tie: prefer the regime-aligned direction, else drop.
            let bias = regime.kind.dominant_bias();
            let aligned = ranked
                .iter()
                .take(2)
                .find(|(d, _)| *d == bias)
                .map(|(d, _)| *d);
            match aligned {
                Some(d) => winner = d,
                None => return Err(NoSignalReason::Tie),
            }
        }

        if winner == Direction::Neutral {
            return Err(NoSignalReason::BelowThreshold);
        }

        let raw = ((top - runner_up) / total).clamp(0.0, 1.0);
        if raw >= MULTI_MARGIN_MIN {
            Ok((winner, raw))
        } else {
            Err(NoSignalReason::BelowThreshold)
        }
    }

    fn protective_prices(&self, action: Action, anchor: &PriceAnchor, regime: Regime) -> (f64, f64) {
        let stop_mult = if regime.kind == RegimeKind::Crisis {
            self.settings.stop_vol_multiple * self.settings.crisis_stop_factor
        } else {
            self.settings.stop_vol_multiple
        };
        let target_dist = anchor.price * anchor.volatility * self.settings.target_vol_multiple;
        let stop_dist = anchor.price * anchor.volatility * stop_mult;

        match action {
            Action::Buy => (anchor.price + target_dist, anchor.price - stop_dist),
            Action::Sell => (anchor.price - target_dist, anchor.price + stop_dist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap()
    }

    fn spec() -> SymbolSpec {
        SymbolSpec::new("AAPL", AssetClass::Stock)
    }

    fn anchor() -> Option<PriceAnchor> {
        Some(PriceAnchor {
            price: 187.0,
            as_of: now(),
            volatility: 0.01,
        })
    }

    fn regime(kind: RegimeKind) -> Regime {
        Regime {
            kind,
            strength: 0.7,
            classified_at: now(),
        }
    }

    fn opinion(source: &str, direction: Direction, confidence: f64) -> SourceOpinion {
        SourceOpinion {
            source_id: source.to_string(),
            symbol: "AAPL".to_string(),
            produced_at: now(),
            direction,
            confidence,
            indicators: serde_json::Map::new(),
            validity: Validity::Ok,
        }
    }

    fn engine_with(weights: &[(&str, f64)]) -> ConsensusEngine {
        let map: HashMap<String, f64> =
            weights.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        ConsensusEngine::new(
            ConsensusSettings::default(),
            TrackWeights {
                stock: map.clone(),
                crypto: map,
            },
            Arc::new(CalibratorHandle::identity()),
        )
    }

    fn expect_emit(outcome: ConsensusOutcome) -> SignalDraft {
        match outcome {
            ConsensusOutcome::Emit(draft) => draft,
            ConsensusOutcome::NoSignal(reason) => panic!("expected signal, got {:?}", reason),
        }
    }

    fn expect_none(outcome: ConsensusOutcome) -> NoSignalReason {
        match outcome {
            ConsensusOutcome::NoSignal(reason) => reason,
            ConsensusOutcome::Emit(draft) => panic!("expected no signal, got {:?}", draft.action),
        }
    }

    #[test]
    fn no_valid_sources_no_signal() {
        let engine = engine_with(&[("a", 1.0)]);
        let mut op = opinion("a", Direction::Long, 0.9);
        op.validity = Validity::Unavailable;
        let reason = expect_none(engine.evaluate(&spec(), &[op], regime(RegimeKind::Bull), anchor(), now()));
        assert_eq!(reason, NoSignalReason::NoValidSources);
    }

    #[test]
    fn single_neutral_accepted_with_regime_bias() {
        // S1: one valid NEUTRAL at 0.70 in BULL -> BUY at 0.70.
        let engine = engine_with(&[("a", 1.0)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Neutral, 0.70)],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        ));
        assert_eq!(draft.action, Action::Buy);
        assert!((draft.calibrated_confidence - 0.70).abs() < 1e-12);
        assert_eq!(draft.calibration, CalibrationTag::Raw);
    }

    #[test]
    fn single_neutral_below_floor_rejected() {
        // S2: NEUTRAL at 0.60 -> nothing.
        let engine = engine_with(&[("a", 1.0)]);
        let reason = expect_none(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Neutral, 0.60)],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        ));
        assert_eq!(reason, NoSignalReason::BelowThreshold);
    }

    #[test]
    fn single_neutral_at_exact_floor_emits() {
        let engine = engine_with(&[("a", 1.0)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Neutral, 0.65)],
            regime(RegimeKind::Bear),
            anchor(),
            now(),
        ));
        assert_eq!(draft.action, Action::Sell);
    }

    #[test]
    fn single_neutral_in_chop_has_no_bias() {
        let engine = engine_with(&[("a", 1.0)]);
        let reason = expect_none(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Neutral, 0.80)],
            regime(RegimeKind::Chop),
            anchor(),
            now(),
        ));
        assert_eq!(reason, NoSignalReason::NoRegimeBias);
    }

    #[test]
    fn single_directional_at_exact_threshold_emits() {
        let engine = engine_with(&[("a", 1.0)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Short, 0.80)],
            regime(RegimeKind::Chop),
            anchor(),
            now(),
        ));
        assert_eq!(draft.action, Action::Sell);
        assert!((draft.raw_confidence - 0.80).abs() < 1e-12);
    }

    #[test]
    fn two_agreeing_sources_sum_weighted_confidence() {
        let engine = engine_with(&[("a", 0.5), ("b", 0.5)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[
                opinion("a", Direction::Long, 0.80),
                opinion("b", Direction::Long, 0.72),
            ],
            regime(RegimeKind::Chop),
            anchor(),
            now(),
        ));
        assert_eq!(draft.action, Action::Buy);
        assert!((draft.raw_confidence - 0.76).abs() < 1e-9);
    }

    #[test]
    fn two_agreeing_below_threshold_rejected() {
        let engine = engine_with(&[("a", 0.5), ("b", 0.5)]);
        let reason = expect_none(engine.evaluate(
            &spec(),
            &[
                opinion("a", Direction::Long, 0.70),
                opinion("b", Direction::Long, 0.70),
            ],
            regime(RegimeKind::Chop),
            anchor(),
            now(),
        ));
        assert_eq!(reason, NoSignalReason::BelowThreshold);
    }

    #[test]
    fn two_disagreeing_sources_margin_wins() {
        let engine = engine_with(&[("a", 0.8), ("b", 0.2)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[
                opinion("a", Direction::Long, 0.95),
                opinion("b", Direction::Short, 0.20),
            ],
            regime(RegimeKind::Chop),
            anchor(),
            now(),
        ));
        // margin = 0.8*0.95 - 0.2*0.20 = 0.72
        assert_eq!(draft.action, Action::Buy);
        assert!((draft.raw_confidence - 0.72).abs() < 1e-9);
    }

    #[test]
    fn three_source_margin_below_threshold() {
        // S3: LONG 0.57 vs SHORT 0.24, margin/total = 0.407 -> no signal.
        let engine = engine_with(&[("a", 0.4), ("b", 0.3), ("c", 0.3)]);
        let reason = expect_none(engine.evaluate(
            &spec(),
            &[
                opinion("a", Direction::Long, 0.9),
                opinion("b", Direction::Long, 0.7),
                opinion("c", Direction::Short, 0.8),
            ],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        ));
        assert_eq!(reason, NoSignalReason::BelowThreshold);
    }

    #[test]
    fn three_source_dominant_direction_emits() {
        let engine = engine_with(&[("a", 0.4), ("b", 0.3), ("c", 0.3)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[
                opinion("a", Direction::Long, 0.95),
                opinion("b", Direction::Long, 0.90),
                opinion("c", Direction::Short, 0.05),
            ],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        ));
        assert_eq!(draft.action, Action::Buy);
        assert!(draft.raw_confidence >= 0.80);
    }

    #[test]
    fn exact_tie_prefers_regime_aligned_direction() {
        let engine = engine_with(&[("a", 0.5), ("b", 0.5), ("c", 0.0000001)]);
        // a and b cancel exactly after renormalization; c is negligible.
        let outcome = engine.evaluate(
            &spec(),
            &[
                opinion("a", Direction::Long, 0.8),
                opinion("b", Direction::Short, 0.8),
                opinion("c", Direction::Neutral, 0.0),
            ],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        );
        // Tie resolves toward BULL/Long but the margin is ~0, so no emit.
        assert_eq!(expect_none(outcome), NoSignalReason::BelowThreshold);
    }

    #[test]
    fn missing_anchor_drops_signal() {
        let engine = engine_with(&[("a", 1.0)]);
        let reason = expect_none(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Long, 0.9)],
            regime(RegimeKind::Bull),
            None,
            now(),
        ));
        assert_eq!(reason, NoSignalReason::NoPriceAnchor);
    }

    #[test]
    fn crisis_tightens_stops() {
        let engine = engine_with(&[("a", 1.0)]);
        let normal = expect_emit(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Long, 0.9)],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        ));
        let crisis = expect_emit(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Long, 0.9)],
            regime(RegimeKind::Crisis),
            anchor(),
            now(),
        ));
        let normal_stop_dist = normal.entry_price - normal.stop_price.unwrap();
        let crisis_stop_dist = crisis.entry_price - crisis.stop_price.unwrap();
        assert!(crisis_stop_dist < normal_stop_dist);
    }

    #[test]
    fn draft_seals_fingerprint() {
        let engine = engine_with(&[("a", 1.0)]);
        let draft = expect_emit(engine.evaluate(
            &spec(),
            &[opinion("a", Direction::Long, 0.9)],
            regime(RegimeKind::Bull),
            anchor(),
            now(),
        ));
        let signal = draft.into_signal(live_signal_id(now()));
        assert!(crate::fingerprint::verify(&signal));
    }
}
