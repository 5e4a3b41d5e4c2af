//! Snapshot model and query engine for balance watching.
//!
//! The crate owns everything with real semantics:
//! - [`Observation`] and its two-field textual codec.
//! - [`nearest`], the nearest-timestamp lookup over an unsorted history.
//! - [`Recorder`] and [`DeltaReporter`], which wire a [`BalanceSource`] to a [`SnapshotStore`].
//!
//! Storage and network access live behind the two traits so that the
//! front end decides which file and which endpoint are used.

use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Fractional digits kept for every persisted balance.
pub const BALANCE_SCALE: u32 = 6;

/// Column names of a serialized observation, in field order.
pub const RECORD_FIELDS: [&str; 2] = ["timestamp", "balance"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WatchError {
    #[error("balance source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("no snapshot history at {0}")]
    StoreNotFound(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("snapshot store has no observations")]
    EmptyStore,
    #[error("storage error: {0}")]
    Storage(String),
}

/// One sampled balance.
///
/// Ordering is by timestamp first, so a history can be sorted for indexed
/// lookups without changing the type.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub struct Observation {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub balance: Decimal,
}

impl Observation {
    /// Builds an observation, rounding the balance to [`BALANCE_SCALE`] digits.
    #[must_use]
    pub fn new(timestamp: OffsetDateTime, balance: Decimal) -> Self {
        Self {
            timestamp,
            balance: round_balance(balance),
        }
    }

    /// Serializes into `[timestamp, balance]` text fields.
    ///
    /// # Errors
    /// Returns [`WatchError::Parse`] when the timestamp has no RFC3339 form
    /// (years outside 0000..=9999, sub-minute offsets) or the balance is
    /// negative.
    pub fn to_record(&self) -> Result<[String; 2], WatchError> {
        if self.balance.is_sign_negative() {
            return Err(WatchError::Parse(format!(
                "balance must be non-negative, got '{}'",
                format_balance(self.balance)
            )));
        }

        Ok([
            format_timestamp(self.timestamp)?,
            format_balance(self.balance),
        ])
    }

    /// Parses the two text fields written by [`Observation::to_record`].
    ///
    /// # Errors
    /// Returns [`WatchError::Parse`] when either field is malformed or the
    /// balance is negative.
    pub fn from_record(timestamp: &str, balance: &str) -> Result<Self, WatchError> {
        Ok(Self::new(parse_timestamp(timestamp)?, parse_balance(balance)?))
    }
}

/// Result of comparing a live balance against the closest stored snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaReport {
    pub address: String,
    #[serde(with = "time::serde::rfc3339")]
    pub target: OffsetDateTime,
    pub matched: Observation,
    pub current_balance: Decimal,
    pub delta: Decimal,
}

impl DeltaReport {
    #[must_use]
    pub fn new(
        address: &str,
        target: OffsetDateTime,
        matched: Observation,
        current_balance: Decimal,
    ) -> Self {
        let current_balance = round_balance(current_balance);
        Self {
            address: address.to_string(),
            target,
            matched,
            current_balance,
            delta: current_balance - matched.balance,
        }
    }

    /// Absolute distance between the query target and the matched snapshot.
    #[must_use]
    pub fn distance(&self) -> Duration {
        (self.matched.timestamp - self.target).abs()
    }
}

pub trait BalanceSource {
    fn source_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn current_balance(&self, address: &str) -> Result<Decimal, WatchError>;
}

pub trait SnapshotStore {
    #[allow(clippy::missing_errors_doc)]
    fn append(&self, observation: &Observation) -> Result<(), WatchError>;

    #[allow(clippy::missing_errors_doc)]
    fn load_all(&self) -> Result<Vec<Observation>, WatchError>;
}

/// Samples a source and appends the result to a store.
pub struct Recorder<'a> {
    source: &'a dyn BalanceSource,
    store: &'a dyn SnapshotStore,
}

impl<'a> Recorder<'a> {
    #[must_use]
    pub fn new(source: &'a dyn BalanceSource, store: &'a dyn SnapshotStore) -> Self {
        Self { source, store }
    }

    /// Records the balance of `address` at the current UTC instant.
    ///
    /// # Errors
    /// Propagates [`WatchError::SourceUnavailable`] from the source and any
    /// storage error from the append.
    pub fn record(&self, address: &str) -> Result<Observation, WatchError> {
        self.record_at(address, now_utc())
    }

    /// Records the balance of `address` stamped with `timestamp`.
    ///
    /// The source is queried before the store is touched.
    ///
    /// # Errors
    /// Same as [`Recorder::record`]; a negative sample is reported as
    /// [`WatchError::SourceUnavailable`] and nothing is appended.
    pub fn record_at(
        &self,
        address: &str,
        timestamp: OffsetDateTime,
    ) -> Result<Observation, WatchError> {
        let balance = self.source.current_balance(address)?;
        let observation = Observation::new(timestamp, balance);
        if observation.balance.is_sign_negative() {
            return Err(WatchError::SourceUnavailable(format!(
                "{} returned negative balance {balance} for {address}",
                self.source.source_name()
            )));
        }
        self.store.append(&observation)?;
        Ok(observation)
    }
}

/// Answers "how much changed since T" against the stored history.
pub struct DeltaReporter<'a> {
    source: &'a dyn BalanceSource,
    store: &'a dyn SnapshotStore,
}

impl<'a> DeltaReporter<'a> {
    #[must_use]
    pub fn new(source: &'a dyn BalanceSource, store: &'a dyn SnapshotStore) -> Self {
        Self { source, store }
    }

    /// Matches `target` against the history, then fetches the live balance.
    ///
    /// # Errors
    /// Returns [`WatchError::StoreNotFound`] or [`WatchError::Parse`] from the
    /// load, [`WatchError::EmptyStore`] when the history has no rows, and
    /// [`WatchError::SourceUnavailable`] from the source.
    pub fn report(&self, address: &str, target: OffsetDateTime) -> Result<DeltaReport, WatchError> {
        let observations = self.store.load_all()?;
        let matched = *nearest(&observations, target)?;
        let current = self.source.current_balance(address)?;
        Ok(DeltaReport::new(address, target, matched, current))
    }
}

/// Returns the observation closest in time to `target`.
///
/// Input order is not assumed to be sorted. Among equidistant observations
/// the first one in iteration order wins.
///
/// # Errors
/// Returns [`WatchError::EmptyStore`] when `observations` is empty.
pub fn nearest(
    observations: &[Observation],
    target: OffsetDateTime,
) -> Result<&Observation, WatchError> {
    let mut best: Option<(&Observation, Duration)> = None;
    for observation in observations {
        let distance = (observation.timestamp - target).abs();
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((observation, distance)),
        }
    }

    best.map(|(observation, _)| observation)
        .ok_or(WatchError::EmptyStore)
}

/// Parses an RFC3339 timestamp, keeping its offset.
///
/// # Errors
/// Returns [`WatchError::Parse`] when the text is not RFC3339 with an offset.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, WatchError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| WatchError::Parse(format!("invalid RFC3339 timestamp '{value}': {err}")))
}

/// Formats a timestamp as RFC3339 without normalizing its offset.
///
/// # Errors
/// Returns [`WatchError::Parse`] when the value has no RFC3339 representation.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, WatchError> {
    value
        .format(&Rfc3339)
        .map_err(|err| WatchError::Parse(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses a non-negative decimal balance.
///
/// # Errors
/// Returns [`WatchError::Parse`] for non-numeric or negative input.
pub fn parse_balance(value: &str) -> Result<Decimal, WatchError> {
    let parsed = Decimal::from_str(value)
        .map_err(|err| WatchError::Parse(format!("invalid balance '{value}': {err}")))?;

    if parsed < Decimal::ZERO {
        return Err(WatchError::Parse(format!(
            "balance must be non-negative, got '{value}'"
        )));
    }

    Ok(round_balance(parsed))
}

/// Formats a balance with exactly [`BALANCE_SCALE`] fractional digits.
#[must_use]
pub fn format_balance(value: Decimal) -> String {
    round_balance(value).to_string()
}

/// Like [`format_balance`] but always carries a sign.
#[must_use]
pub fn format_signed_balance(value: Decimal) -> String {
    if value < Decimal::ZERO {
        format_balance(value)
    } else {
        format!("+{}", format_balance(value))
    }
}

/// Rounds to [`BALANCE_SCALE`] digits and pins the scale there, so that
/// `Display` and serde output always carry six fractional digits.
fn round_balance(value: Decimal) -> Decimal {
    let mut rounded =
        value.round_dp_with_strategy(BALANCE_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(BALANCE_SCALE);
    if rounded.is_zero() {
        rounded.set_sign_positive(true);
    }
    rounded
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::{Cell, RefCell};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_ts(value: &str) -> OffsetDateTime {
        must_ok(parse_timestamp(value))
    }

    fn must_dec(value: &str) -> Decimal {
        must_ok(Decimal::from_str(value))
    }

    fn fixture_observation(timestamp: &str, balance: &str) -> Observation {
        Observation::new(must_ts(timestamp), must_dec(balance))
    }

    struct FixedSource {
        balance: Option<Decimal>,
        calls: Cell<usize>,
    }

    impl FixedSource {
        fn returning(balance: &str) -> Self {
            Self {
                balance: Some(must_dec(balance)),
                calls: Cell::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                balance: None,
                calls: Cell::new(0),
            }
        }
    }

    impl BalanceSource for FixedSource {
        fn source_name(&self) -> &'static str {
            "fixed"
        }

        fn current_balance(&self, _address: &str) -> Result<Decimal, WatchError> {
            self.calls.set(self.calls.get() + 1);
            self.balance
                .ok_or_else(|| WatchError::SourceUnavailable("fixture outage".to_string()))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        rows: RefCell<Option<Vec<Observation>>>,
    }

    impl SnapshotStore for MemoryStore {
        fn append(&self, observation: &Observation) -> Result<(), WatchError> {
            self.rows
                .borrow_mut()
                .get_or_insert_with(Vec::new)
                .push(*observation);
            Ok(())
        }

        fn load_all(&self) -> Result<Vec<Observation>, WatchError> {
            self.rows
                .borrow()
                .clone()
                .ok_or_else(|| WatchError::StoreNotFound("memory".to_string()))
        }
    }

    #[test]
    fn record_fields_round_trip() {
        let observation = fixture_observation("2025-01-06T00:00:00Z", "100.5");
        let [timestamp, balance] = must_ok(observation.to_record());

        assert_eq!(timestamp, "2025-01-06T00:00:00Z");
        assert_eq!(balance, "100.500000");
        assert_eq!(
            must_ok(Observation::from_record(&timestamp, &balance)),
            observation
        );
    }

    #[test]
    fn record_fields_keep_offset_and_fraction() {
        let observation = fixture_observation("2025-07-15T12:00:00.123456+02:00", "0.000001");
        let [timestamp, balance] = must_ok(observation.to_record());

        assert_eq!(timestamp, "2025-07-15T12:00:00.123456+02:00");
        assert_eq!(balance, "0.000001");

        let parsed = must_ok(Observation::from_record(&timestamp, &balance));
        assert_eq!(parsed.timestamp.offset(), observation.timestamp.offset());
        assert_eq!(parsed, observation);
    }

    #[test]
    fn new_rounds_to_store_scale() {
        let observation = fixture_observation("2025-01-06T00:00:00Z", "1.2345675");
        assert_eq!(observation.balance, must_dec("1.234568"));
        assert_eq!(format_balance(observation.balance), "1.234568");
    }

    #[test]
    fn from_record_rejects_malformed_fields() {
        assert!(matches!(
            Observation::from_record("yesterday", "1.000000"),
            Err(WatchError::Parse(_))
        ));
        assert!(matches!(
            Observation::from_record("2025-01-06T00:00:00", "1.000000"),
            Err(WatchError::Parse(_))
        ));
        assert!(matches!(
            Observation::from_record("2025-01-06T00:00:00Z", "lots"),
            Err(WatchError::Parse(_))
        ));
        assert!(matches!(
            Observation::from_record("2025-01-06T00:00:00Z", "-1.000000"),
            Err(WatchError::Parse(_))
        ));
    }

    #[test]
    fn nearest_picks_minimum_distance_in_unsorted_input() {
        let observations = vec![
            fixture_observation("2025-01-10T00:00:00Z", "3"),
            fixture_observation("2025-01-01T00:00:00Z", "1"),
            fixture_observation("2025-01-05T00:00:00Z", "2"),
        ];

        let matched = must_ok(nearest(&observations, must_ts("2025-01-04T00:00:00Z")));
        assert_eq!(matched.balance, must_dec("2"));
    }

    #[test]
    fn nearest_compares_instants_across_offsets() {
        let observations = vec![
            fixture_observation("2025-01-06T10:00:00+09:00", "1"),
            fixture_observation("2025-01-06T00:30:00Z", "2"),
        ];

        // 10:00+09:00 is 01:00Z, one hour from the target; 00:30Z is half an hour.
        let matched = must_ok(nearest(&observations, must_ts("2025-01-06T00:00:00Z")));
        assert_eq!(matched.balance, must_dec("2"));
    }

    #[test]
    fn nearest_breaks_ties_by_append_order() {
        let first = fixture_observation("2025-01-07T00:00:00Z", "7");
        let second = fixture_observation("2025-01-05T00:00:00Z", "5");
        let target = must_ts("2025-01-06T00:00:00Z");

        assert_eq!(must_ok(nearest(&[first, second], target)).balance, must_dec("7"));
        assert_eq!(must_ok(nearest(&[second, first], target)).balance, must_dec("5"));
    }

    #[test]
    fn nearest_on_empty_history_is_empty_store() {
        let result = nearest(&[], must_ts("2025-01-06T00:00:00Z"));
        assert_eq!(result, Err(WatchError::EmptyStore));
    }

    #[test]
    fn delta_keeps_sign_and_magnitude() {
        let matched = fixture_observation("2025-01-06T00:00:00Z", "5.000000");
        let target = must_ts("2025-01-06T00:00:00Z");

        let gain = DeltaReport::new("addr", target, matched, must_dec("5.250000"));
        assert_eq!(gain.delta, must_dec("0.25"));
        assert_eq!(format_signed_balance(gain.delta), "+0.250000");

        let loss = DeltaReport::new("addr", target, matched, must_dec("4.900000"));
        assert_eq!(loss.delta, must_dec("-0.1"));
        assert_eq!(format_signed_balance(loss.delta), "-0.100000");
    }

    #[test]
    fn delta_report_distance_is_absolute() {
        let matched = fixture_observation("2025-01-06T00:00:00Z", "1");
        let report = DeltaReport::new(
            "addr",
            must_ts("2025-01-05T12:00:00Z"),
            matched,
            must_dec("1"),
        );
        assert_eq!(report.distance(), Duration::hours(12));
        assert_eq!(format_signed_balance(report.delta), "+0.000000");
    }

    #[test]
    fn recorder_appends_sampled_balance() {
        let source = FixedSource::returning("42.1234567");
        let store = MemoryStore::default();
        let recorder = Recorder::new(&source, &store);

        let observation = must_ok(recorder.record_at("addr", must_ts("2025-01-06T00:00:00Z")));

        assert_eq!(observation.balance, must_dec("42.123457"));
        assert_eq!(must_ok(store.load_all()), vec![observation]);
    }

    #[test]
    fn recorder_rejects_negative_sample_without_append() {
        let source = FixedSource::returning("-1");
        let store = MemoryStore::default();

        let result =
            Recorder::new(&source, &store).record_at("addr", must_ts("2025-01-06T00:00:00Z"));

        assert!(matches!(result, Err(WatchError::SourceUnavailable(_))));
        assert_eq!(source.calls.get(), 1);
        assert_eq!(
            store.load_all(),
            Err(WatchError::StoreNotFound("memory".to_string()))
        );
    }

    #[test]
    fn to_record_refuses_balance_the_codec_cannot_read_back() {
        let observation = fixture_observation("2025-01-06T00:00:00Z", "-1");
        assert!(matches!(observation.to_record(), Err(WatchError::Parse(_))));

        let zero = fixture_observation("2025-01-06T00:00:00Z", "-0.0000001");
        let [_, balance] = must_ok(zero.to_record());
        assert_eq!(balance, "0.000000");
    }

    #[test]
    fn recorder_stamps_current_utc_instant() {
        let source = FixedSource::returning("1");
        let store = MemoryStore::default();
        let before = now_utc();

        let observation = must_ok(Recorder::new(&source, &store).record("addr"));

        assert!(observation.timestamp >= before);
        assert_eq!(observation.timestamp.offset(), UtcOffset::UTC);
    }

    #[test]
    fn recorder_propagates_source_failure_without_append() {
        let source = FixedSource::failing();
        let store = MemoryStore::default();

        let result = Recorder::new(&source, &store).record("addr");

        assert!(matches!(result, Err(WatchError::SourceUnavailable(_))));
        assert_eq!(
            store.load_all(),
            Err(WatchError::StoreNotFound("memory".to_string()))
        );
    }

    #[test]
    fn reporter_on_missing_store_skips_source() {
        let source = FixedSource::returning("1");
        let store = MemoryStore::default();

        let result =
            DeltaReporter::new(&source, &store).report("addr", must_ts("2025-01-06T00:00:00Z"));

        assert!(matches!(result, Err(WatchError::StoreNotFound(_))));
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn reporter_on_empty_store_is_empty_store() {
        let source = FixedSource::returning("1");
        let store = MemoryStore {
            rows: RefCell::new(Some(Vec::new())),
        };

        let result =
            DeltaReporter::new(&source, &store).report("addr", must_ts("2025-01-06T00:00:00Z"));

        assert_eq!(result, Err(WatchError::EmptyStore));
    }

    #[test]
    fn reporter_surfaces_source_failure() {
        let source = FixedSource::failing();
        let store = MemoryStore::default();
        must_ok(store.append(&fixture_observation("2025-01-06T00:00:00Z", "1")));

        let result =
            DeltaReporter::new(&source, &store).report("addr", must_ts("2025-01-06T00:00:00Z"));

        assert!(matches!(result, Err(WatchError::SourceUnavailable(_))));
    }

    #[test]
    fn reporter_matches_closest_snapshot() {
        let store = MemoryStore::default();
        must_ok(store.append(&fixture_observation("2025-01-06T00:00:00Z", "100")));
        must_ok(store.append(&fixture_observation("2025-01-08T00:00:00Z", "103.5")));
        let source = FixedSource::returning("105");

        let report = must_ok(
            DeltaReporter::new(&source, &store).report("addrA", must_ts("2025-01-06T12:00:00Z")),
        );

        assert_eq!(report.matched.timestamp, must_ts("2025-01-06T00:00:00Z"));
        assert_eq!(report.current_balance, must_dec("105"));
        assert_eq!(format_signed_balance(report.delta), "+5.000000");
        assert_eq!(report.distance(), Duration::hours(12));
    }

    #[test]
    fn report_json_uses_rfc3339_and_string_decimals() {
        let matched = fixture_observation("2025-01-06T00:00:00Z", "5");
        let report = DeltaReport::new(
            "addr",
            must_ts("2025-01-06T01:00:00Z"),
            matched,
            must_dec("5.25"),
        );

        let value = must_ok(serde_json::to_value(&report));
        assert_eq!(value["target"], "2025-01-06T01:00:00Z");
        assert_eq!(value["matched"]["timestamp"], "2025-01-06T00:00:00Z");
        assert_eq!(value["address"], "addr");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_nearest_is_optimal_and_first_among_ties(
            offsets in prop::collection::vec(-500_000i64..500_000, 1..40),
            target_offset in -600_000i64..600_000,
        ) {
            let base = must_ts("2025-01-01T00:00:00Z");
            let observations: Vec<Observation> = offsets
                .iter()
                .enumerate()
                .map(|(index, seconds)| {
                    Observation::new(base + Duration::seconds(*seconds), Decimal::from(index))
                })
                .collect();
            let target = base + Duration::seconds(target_offset);

            let matched = must_ok(nearest(&observations, target));
            let best = (matched.timestamp - target).abs();

            for observation in &observations {
                prop_assert!(best <= (observation.timestamp - target).abs());
            }

            let first_tied = observations
                .iter()
                .position(|observation| (observation.timestamp - target).abs() == best);
            prop_assert_eq!(first_tied.map(Decimal::from), Some(matched.balance));
        }
    }
}
