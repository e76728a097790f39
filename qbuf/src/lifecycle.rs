//! The periodic sweep implementing the four-state qbuf lifecycle.
//!
//! Runs inside the manager's own `tokio::select!` loop (see `manager::run`), so it is naturally
//! serialized with every other command - there is no separate task and no lock to take.

use crate::{
    entity::Status,
    manager::ManagerState,
};
use iox_time::Time;

/// Counts from one sweep, used for logging and metrics; not part of any public API.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepSummary {
    pub(crate) dropped: u64,
    pub(crate) to_expiring_idle: u64,
    pub(crate) to_expiring_incomplete: u64,
}

pub(crate) fn sweep(state: &mut ManagerState, now: Time) -> SweepSummary {
    let mut summary = SweepSummary::default();
    let incomplete_release_ms = state.config.incomplete_release_ms;

    let mut to_remove = Vec::new();
    for (qbuf_ref, qbuf) in state.qbufs.iter_mut() {
        match qbuf.status {
            Status::Expired => {
                to_remove.push(*qbuf_ref);
            }
            Status::CollectingChunks => {
                if idle_for_ms(now, qbuf.last_accessed) > incomplete_release_ms {
                    qbuf.status = Status::Expiring;
                    summary.to_expiring_incomplete += 1;
                }
            }
            Status::ServingFetches => {
                if idle_for_ms(now, qbuf.last_accessed) > qbuf.expire_after_ms {
                    qbuf.status = Status::Expiring;
                    summary.to_expiring_idle += 1;
                }
            }
            Status::Expiring => {}
        }
    }

    for qbuf_ref in &to_remove {
        if let Some(qbuf) = state.qbufs.shift_remove(qbuf_ref) {
            if !qbuf.is_spilled() {
                state.total_inmem_bytes = state.total_inmem_bytes.saturating_sub(qbuf.inmem_bytes);
            }
            summary.dropped += 1;
        }
    }

    // Recompute from survivors rather than trust incremental bookkeeping alone; keeps
    // `total_size = Σ size_bytes` true even after removals this sweep just performed.
    state.total_size = state.qbufs.values().map(|q| q.size_bytes).sum();

    summary
}

fn idle_for_ms(now: Time, last_accessed: Time) -> u64 {
    match now.checked_duration_since(last_accessed) {
        Some(d) => d.as_millis() as u64,
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ManagerConfig,
        entity::{QBuf, Schema},
        key_codec::QBufRef,
        manager::test_support::new_state_for_tests,
        value::{Direction, NullsOrder, OrderByField},
    };
    use iox_time::MockProvider;
    use std::{sync::Arc, time::Duration};

    fn schema() -> Schema {
        Schema {
            columns: vec![],
            order_by: vec![OrderByField {
                position: 0,
                direction: Direction::Asc,
                nulls: NullsOrder::Last,
            }],
        }
    }

    #[test]
    fn incomplete_qbuf_expires_after_its_timeout() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let config = ManagerConfig {
            incomplete_release_ms: 1_000,
            ..ManagerConfig::default()
        };
        let mut state = new_state_for_tests(config, clock.clone());

        let qbuf_ref = QBufRef::new();
        let qbuf = QBuf::new(qbuf_ref, "t".into(), schema(), 3, 60_000, clock.now());
        state.qbufs.insert(qbuf_ref, qbuf);

        clock.inc(Duration::from_millis(1_001));
        let summary = sweep(&mut state, clock.now());

        assert_eq!(summary.to_expiring_incomplete, 1);
        assert_eq!(state.qbufs.get(&qbuf_ref).unwrap().status, Status::Expiring);
    }

    #[test]
    fn serving_qbuf_expires_after_expire_after_ms() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let config = ManagerConfig::default();
        let mut state = new_state_for_tests(config, clock.clone());

        let qbuf_ref = QBufRef::new();
        let mut qbuf = QBuf::new(qbuf_ref, "t".into(), schema(), 1, 500, clock.now());
        qbuf.status = Status::ServingFetches;
        state.qbufs.insert(qbuf_ref, qbuf);

        clock.inc(Duration::from_millis(501));
        let summary = sweep(&mut state, clock.now());

        assert_eq!(summary.to_expiring_idle, 1);
        assert_eq!(state.qbufs.get(&qbuf_ref).unwrap().status, Status::Expiring);
    }

    #[test]
    fn expired_qbuf_is_dropped_next_sweep() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let mut state = new_state_for_tests(ManagerConfig::default(), clock.clone());

        let qbuf_ref = QBufRef::new();
        let mut qbuf = QBuf::new(qbuf_ref, "t".into(), schema(), 1, 500, clock.now());
        qbuf.status = Status::Expired;
        qbuf.size_bytes = 42;
        state.qbufs.insert(qbuf_ref, qbuf);
        state.total_size = 42;

        let summary = sweep(&mut state, clock.now());

        assert_eq!(summary.dropped, 1);
        assert!(state.qbufs.get(&qbuf_ref).is_none());
        assert_eq!(state.total_size, 0);
    }

    #[test]
    fn expiring_qbuf_is_left_alone() {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let mut state = new_state_for_tests(ManagerConfig::default(), clock.clone());

        let qbuf_ref = QBufRef::new();
        let mut qbuf = QBuf::new(qbuf_ref, "t".into(), schema(), 1, 500, clock.now());
        qbuf.status = Status::Expiring;
        state.qbufs.insert(qbuf_ref, qbuf);

        clock.inc(Duration::from_secs(3600));
        sweep(&mut state, clock.now());

        assert_eq!(state.qbufs.get(&qbuf_ref).unwrap().status, Status::Expiring);
    }
}
