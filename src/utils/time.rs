use chrono::{DateTime, Duration, DurationRound, Utc};

/// Start of the UTC hour containing `ts`.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_hour_bucket() {
        let ts = Utc.with_ymd_and_hms(2026, 2, 3, 14, 59, 59).unwrap();
        assert_eq!(
            hour_bucket(ts),
            Utc.with_ymd_and_hms(2026, 2, 3, 14, 0, 0).unwrap()
        );
        assert_eq!(hour_bucket(hour_bucket(ts)), hour_bucket(ts));
    }
}
