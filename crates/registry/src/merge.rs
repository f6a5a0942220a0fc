use fleetlink_protocol::DeviceRecord;

/// Applies a conflicting report onto the registry's record.
///
/// The report with the greater derived last-activity value (max of
/// last-heartbeat and last-seen) wins the merge wholesale; there is no
/// field-by-field arbitration. On a tie — including two reports with no
/// timestamps at all — the existing value is kept (stability bias).
///
/// Status is deliberately NOT merged here; liveness transitions belong to
/// the reconciler. Returns `true` if the incoming report won.
pub(crate) fn merge_report(existing: &mut DeviceRecord, incoming: &DeviceRecord) -> bool {
    let incoming_wins = match (existing.last_activity(), incoming.last_activity()) {
        (Some(cur), Some(new)) => new > cur,
        (None, Some(_)) => true,
        _ => false,
    };
    if !incoming_wins {
        return false;
    }

    if !incoming.name.is_empty() {
        existing.name = incoming.name.clone();
    }
    if !incoming.attributes.is_null() {
        existing.attributes = incoming.attributes.clone();
    }
    // Timestamps stay monotonic even when the payload is replaced.
    if let Some(seen) = incoming.last_seen {
        if existing.last_seen.is_none_or(|prev| seen > prev) {
            existing.last_seen = Some(seen);
        }
    }
    if let Some(beat) = incoming.last_heartbeat {
        if existing.last_heartbeat.is_none_or(|prev| beat > prev) {
            existing.last_heartbeat = Some(beat);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fleetlink_protocol::LivenessStatus;

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(id: &str, seen: Option<i64>, beat: Option<i64>) -> DeviceRecord {
        let mut rec = DeviceRecord::new(id);
        rec.last_seen = seen.map(at);
        rec.last_heartbeat = beat.map(at);
        rec
    }

    #[test]
    fn fresher_report_wins_wholesale() {
        let mut existing = record("d1", Some(100), None);
        existing.name = "old".into();
        existing.attributes = serde_json::json!({"battery": 10});

        let mut incoming = record("d1", Some(200), None);
        incoming.name = "new".into();
        incoming.attributes = serde_json::json!({"battery": 90});

        assert!(merge_report(&mut existing, &incoming));
        assert_eq!(existing.name, "new");
        assert_eq!(existing.attributes["battery"], 90);
    }

    #[test]
    fn stale_report_is_discarded() {
        let mut existing = record("d1", Some(200), None);
        existing.name = "current".into();
        let mut incoming = record("d1", Some(100), None);
        incoming.name = "stale".into();

        assert!(!merge_report(&mut existing, &incoming));
        assert_eq!(existing.name, "current");
    }

    #[test]
    fn tie_keeps_existing() {
        let mut existing = record("d1", Some(100), None);
        existing.name = "current".into();
        let mut incoming = record("d1", Some(100), None);
        incoming.name = "contender".into();

        assert!(!merge_report(&mut existing, &incoming));
        assert_eq!(existing.name, "current");
    }

    #[test]
    fn heartbeat_counts_toward_activity() {
        // incoming last_seen is older, but its heartbeat is the freshest
        // activity overall, so it wins.
        let mut existing = record("d1", Some(150), None);
        let incoming = record("d1", Some(100), Some(300));
        assert!(merge_report(&mut existing, &incoming));
        assert_eq!(existing.last_heartbeat, Some(at(300)));
        // last_seen stays monotonic: not regressed to 100.
        assert_eq!(existing.last_seen, Some(at(150)));
    }

    #[test]
    fn merge_never_touches_status() {
        let mut existing = record("d1", Some(100), None);
        existing.status = LivenessStatus::Online;
        let mut incoming = record("d1", Some(200), None);
        incoming.status = LivenessStatus::Offline;

        merge_report(&mut existing, &incoming);
        assert_eq!(existing.status, LivenessStatus::Online);
    }

    #[test]
    fn timestampless_existing_loses_to_timestamped() {
        let mut existing = record("d1", None, None);
        let incoming = record("d1", Some(50), None);
        assert!(merge_report(&mut existing, &incoming));
    }

    #[test]
    fn both_timestampless_keeps_existing() {
        let mut existing = record("d1", None, None);
        existing.name = "current".into();
        let mut incoming = record("d1", None, None);
        incoming.name = "contender".into();
        assert!(!merge_report(&mut existing, &incoming));
        assert_eq!(existing.name, "current");
    }
}
