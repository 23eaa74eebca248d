// =============================================================================
// Session Clock — market-hours predicate and session-aligned bucket math
// =============================================================================
//
// All multi-minute candle boundaries are aligned to the session open, not the
// unix epoch: a bucket starts at `session_open + k * interval`. The NSE cash
// session runs 09:15–15:30 IST, Monday to Friday.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};

use crate::types::Timeframe;

/// IST offset (+05:30) in seconds.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 1800;

/// Session clock for a single daily cash session.
#[derive(Debug, Clone)]
pub struct SessionClock {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
}

impl SessionClock {
    /// The NSE cash session: 09:15–15:30 IST.
    pub fn nse() -> Self {
        Self {
            offset: FixedOffset::east_opt(IST_OFFSET_SECS).expect("valid IST offset"),
            open: NaiveTime::from_hms_opt(9, 15, 0).expect("valid open time"),
            close: NaiveTime::from_hms_opt(15, 30, 0).expect("valid close time"),
        }
    }

    /// A custom session, used by tests.
    #[cfg(test)]
    pub fn with_hours(open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            offset: FixedOffset::east_opt(IST_OFFSET_SECS).expect("valid IST offset"),
            open,
            close,
        }
    }

    /// True when `ts` falls on a trading weekday inside session hours
    /// (inclusive open, exclusive close).
    pub fn is_market_open(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&self.offset);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        t >= self.open && t < self.close
    }

    /// Session open instant for the trading day containing `ts`, or `None`
    /// when `ts` is on a weekend.
    pub fn session_open(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = ts.with_timezone(&self.offset);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return None;
        }
        let open_local = self
            .offset
            .from_local_datetime(&local.date_naive().and_time(self.open))
            .single()?;
        Some(open_local.with_timezone(&Utc))
    }

    /// Session close instant for the trading day containing `ts`.
    pub fn session_close(&self, ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = ts.with_timezone(&self.offset);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return None;
        }
        let close_local = self
            .offset
            .from_local_datetime(&local.date_naive().and_time(self.close))
            .single()?;
        Some(close_local.with_timezone(&Utc))
    }

    /// Session-aligned bucket start containing `ts` for the given timeframe:
    /// `session_open + k * interval` for integer k. Returns `None` outside
    /// session hours.
    pub fn bucket_start(&self, ts: DateTime<Utc>, tf: Timeframe) -> Option<DateTime<Utc>> {
        if !self.is_market_open(ts) {
            return None;
        }
        let open = self.session_open(ts)?;
        let elapsed_mins = (ts - open).num_minutes();
        let k = elapsed_mins / tf.minutes();
        Some(open + Duration::minutes(k * tf.minutes()))
    }

    /// End instant (exclusive) of the bucket starting at `bucket_start`.
    pub fn bucket_end(&self, bucket_start: DateTime<Utc>, tf: Timeframe) -> DateTime<Utc> {
        bucket_start + Duration::minutes(tf.minutes())
    }

    /// True when `ts` lies within the final `minutes` of the session.
    /// Target and time-based exits are refused here.
    pub fn in_closing_window(&self, ts: DateTime<Utc>, minutes: i64) -> bool {
        match self.session_close(ts) {
            Some(close) => self.is_market_open(ts) && ts >= close - Duration::minutes(minutes),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// 2024-06-12 is a Wednesday.
    fn at_ist(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        let offset = FixedOffset::east_opt(IST_OFFSET_SECS).unwrap();
        offset
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2024, 6, 12)
                    .unwrap()
                    .and_hms_opt(h, m, s)
                    .unwrap(),
            )
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn market_hours_predicate() {
        let clock = SessionClock::nse();
        assert!(!clock.is_market_open(at_ist(9, 14, 59)));
        assert!(clock.is_market_open(at_ist(9, 15, 0)));
        assert!(clock.is_market_open(at_ist(12, 0, 0)));
        assert!(clock.is_market_open(at_ist(15, 29, 59)));
        assert!(!clock.is_market_open(at_ist(15, 30, 0)));
    }

    #[test]
    fn weekend_is_closed() {
        let clock = SessionClock::nse();
        // 2024-06-15 is a Saturday.
        let offset = FixedOffset::east_opt(IST_OFFSET_SECS).unwrap();
        let sat = offset
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2024, 6, 15)
                    .unwrap()
                    .and_hms_opt(11, 0, 0)
                    .unwrap(),
            )
            .unwrap()
            .with_timezone(&Utc);
        assert!(!clock.is_market_open(sat));
        assert!(clock.session_open(sat).is_none());
    }

    #[test]
    fn one_minute_buckets_align_to_session_open() {
        let clock = SessionClock::nse();
        let ts = at_ist(9, 17, 42);
        let bucket = clock.bucket_start(ts, Timeframe::M1).unwrap();
        assert_eq!(bucket, at_ist(9, 17, 0));
    }

    #[test]
    fn higher_timeframe_buckets_are_session_aligned() {
        let clock = SessionClock::nse();
        let open = clock.session_open(at_ist(10, 0, 0)).unwrap();

        // Any in-session instant must land on open + k*interval for both
        // 25m and 125m.
        for (h, m) in [(9, 15), (9, 40), (10, 5), (12, 33), (15, 29)] {
            let ts = at_ist(h, m, 11);
            for tf in [Timeframe::M25, Timeframe::M125] {
                let bucket = clock.bucket_start(ts, tf).unwrap();
                let offset_mins = (bucket - open).num_minutes();
                assert_eq!(offset_mins % tf.minutes(), 0, "{tf} bucket misaligned at {h}:{m}");
                assert!(bucket <= ts && ts < clock.bucket_end(bucket, tf));
            }
        }

        // 09:40 starts the second 25m bucket.
        assert_eq!(
            clock.bucket_start(at_ist(9, 40, 0), Timeframe::M25).unwrap(),
            at_ist(9, 40, 0)
        );
        // 11:20 = open + 125m starts the second 125m bucket.
        assert_eq!(
            clock.bucket_start(at_ist(11, 20, 0), Timeframe::M125).unwrap(),
            at_ist(11, 20, 0)
        );
    }

    #[test]
    fn out_of_session_has_no_bucket() {
        let clock = SessionClock::nse();
        assert!(clock.bucket_start(at_ist(8, 0, 0), Timeframe::M1).is_none());
        assert!(clock.bucket_start(at_ist(16, 0, 0), Timeframe::M25).is_none());
    }

    #[test]
    fn closing_window() {
        let clock = SessionClock::nse();
        assert!(!clock.in_closing_window(at_ist(15, 24, 59), 5));
        assert!(clock.in_closing_window(at_ist(15, 25, 0), 5));
        assert!(clock.in_closing_window(at_ist(15, 29, 30), 5));
        // After close the market is shut, not "closing".
        assert!(!clock.in_closing_window(at_ist(15, 31, 0), 5));
    }
}
