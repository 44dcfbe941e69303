//! Signal Fingerprinting
//! Mission: Verifiable, client-recomputable digests over immutable signal fields

use chrono::SecondsFormat;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::Signal;

/// Canonical JSON over the immutable fields: keys sorted lexicographically,
/// no whitespace, numbers in shortest round-trip form, absent prices as
/// nulls. Clients recompute this byte-for-byte.
pub fn canonical_serialization(signal: &Signal) -> String {
    fn price(v: Option<f64>) -> Value {
        v.map(Value::from).unwrap_or(Value::Null)
    }

    // serde_json::Map preserves insertion order, so insert in key order.
    let mut fields = Map::new();
    fields.insert("action".into(), Value::from(signal.action.as_str()));
    fields.insert("confidence".into(), Value::from(signal.confidence));
    fields.insert("entry_price".into(), Value::from(signal.entry_price));
    fields.insert("signal_id".into(), Value::from(signal.signal_id.as_str()));
    fields.insert("stop_price".into(), price(signal.stop_price));
    fields.insert("strategy".into(), Value::from(signal.strategy_version.as_str()));
    fields.insert("symbol".into(), Value::from(signal.symbol.as_str()));
    fields.insert("target_price".into(), price(signal.target_price));
    fields.insert(
        "timestamp".into(),
        Value::from(
            signal
                .generated_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    );

    Value::Object(fields).to_string()
}

/// Lowercase hex SHA-256 of the canonical serialization.
pub fn compute(signal: &Signal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_serialization(signal).as_bytes());
    hex::encode(hasher.finalize())
}

/// True when the stored fingerprint matches a recomputation.
pub fn verify(signal: &Signal) -> bool {
    signal.fingerprint == compute(signal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, CalibrationTag, Regime, Signal};
    use chrono::{TimeZone, Utc};

    fn sample() -> Signal {
        let generated_at = Utc.with_ymd_and_hms(2024, 6, 3, 14, 31, 7).unwrap();
        let mut s = Signal {
            signal_id: "0005f2a1b3c4d5e6-9f3a1c2b".to_string(),
            symbol: "AAPL".to_string(),
            action: Action::Buy,
            confidence: 0.81,
            entry_price: 187.25,
            target_price: Some(191.0),
            stop_price: Some(185.1),
            regime: Regime::cold_start(generated_at),
            strategy_version: "consensus-v1".to_string(),
            generated_at,
            contributing_sources: Vec::new(),
            fingerprint: String::new(),
            calibration: CalibrationTag::Raw,
            outcome: None,
            pnl_pct: None,
            order_refs: Vec::new(),
        };
        s.fingerprint = compute(&s);
        s
    }

    #[test]
    fn canonical_form_is_sorted_and_compact() {
        let s = sample();
        let canon = canonical_serialization(&s);
        assert!(!canon.contains(' '));
        let action_pos = canon.find("\"action\"").unwrap();
        let symbol_pos = canon.find("\"symbol\"").unwrap();
        let ts_pos = canon.find("\"timestamp\"").unwrap();
        assert!(action_pos < symbol_pos && symbol_pos < ts_pos);
    }

    #[test]
    fn round_trip_verifies() {
        let s = sample();
        assert_eq!(s.fingerprint.len(), 64);
        assert!(s.fingerprint.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(verify(&s));
    }

    #[test]
    fn mutating_an_immutable_field_breaks_verification() {
        let mut s = sample();
        s.entry_price += 0.01;
        assert!(!verify(&s));
    }

    #[test]
    fn mutable_fields_do_not_affect_fingerprint() {
        let mut s = sample();
        let before = s.fingerprint.clone();
        s.outcome = Some(crate::models::SignalOutcome::Win);
        s.pnl_pct = Some(1.3);
        assert_eq!(compute(&s), before);
    }

    #[test]
    fn absent_prices_hash_differently_from_zero() {
        let mut a = sample();
        a.target_price = None;
        let mut b = sample();
        b.target_price = Some(0.0);
        assert_ne!(compute(&a), compute(&b));
    }
}
