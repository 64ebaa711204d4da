//! Serializable snapshot isolation: rw-antidependency edges and the
//! commit-time dangerous-structure check.
//!
//! Edges are recorded eagerly while transactions run:
//! - at read time, when a reader resolves a version some concurrent writer
//!   has already superseded;
//! - at write time, for every concurrent reader registered on the version a
//!   writer supersedes.
//!
//! [`validate_commit`] runs under the commit mutex, so "committed" in the
//! rules below means "committed before this transaction".

use ssidb_error::SsiAbortReason;
use ssidb_types::TxnId;
use tracing::{debug, warn};

use crate::config::SsiPolicy;
use crate::metrics::MvccMetrics;
use crate::registry::{TxnRegistry, TxnShared, TxnStatus};

/// Record `reader -rw-> writer`. Returns `true` if the edge is new.
///
/// The two endpoint locks are taken one after the other, never nested.
pub fn mark_rw_edge(reader: &TxnShared, writer: &TxnShared, metrics: &MvccMetrics) -> bool {
    if reader.txn_id == writer.txn_id {
        return false;
    }
    let out_new = reader.add_out_edge(writer.txn_id);
    let in_new = writer.add_in_edge(reader.txn_id);
    if out_new || in_new {
        metrics.record_rw_edge();
        debug!(
            reader = %reader.txn_id,
            writer = %writer.txn_id,
            "rw-antidependency recorded"
        );
    }
    out_new || in_new
}

/// Whether an edge endpoint still counts. Unknown (pruned) records are
/// treated as live.
fn is_live(registry: &TxnRegistry, txn: TxnId) -> bool {
    registry.status(txn) != Some(TxnStatus::Aborted)
}

/// Whether `txn` committed before the caller. Unknown records are treated
/// as committed.
fn is_committed(registry: &TxnRegistry, txn: TxnId) -> bool {
    registry
        .status(txn)
        .is_none_or(|status| status == TxnStatus::Committed)
}

/// Decide whether `txn` may commit.
///
/// Both policies discount edges whose other endpoint aborted.
/// - [`SsiPolicy::PivotFlags`]: abort if a live in-edge and a live out-edge
///   exist.
/// - [`SsiPolicy::CommitOrdered`]: abort if a live in-edge exists and some
///   out-edge points at a transaction that already committed.
///
/// Under either policy, `txn` also aborts if an out-edge target `P` already
/// committed while `P` itself has an out-edge to a transaction that
/// committed no later than `P` (the committed pivot can no longer be
/// aborted, so its reader must be).
///
/// # Errors
///
/// Returns the [`SsiAbortReason`] when `txn` must abort.
pub fn validate_commit(
    txn: &TxnShared,
    registry: &TxnRegistry,
    policy: SsiPolicy,
) -> Result<(), SsiAbortReason> {
    let _span = tracing::info_span!(
        "ssi_validate",
        txn_id = %txn.txn_id,
        ?policy,
        in_rw = txn.in_conflict(),
        out_rw = txn.out_conflict(),
    )
    .entered();

    if !txn.in_conflict() && !txn.out_conflict() {
        return Ok(());
    }

    let state = txn.ssi_state();
    let live_in = state.rw_in_from.iter().any(|&id| is_live(registry, id));
    let pivot = live_in
        && match policy {
            SsiPolicy::PivotFlags => state.rw_out_to.iter().any(|&id| is_live(registry, id)),
            SsiPolicy::CommitOrdered => state
                .rw_out_to
                .iter()
                .any(|&id| is_committed(registry, id)),
        };
    if pivot {
        warn!(txn_id = %txn.txn_id, ?policy, "ssi abort: pivot");
        return Err(SsiAbortReason::Pivot);
    }

    for &target in &state.rw_out_to {
        let Some(pivot) = registry.get(target) else {
            continue;
        };
        let Some(pivot_ts) = pivot.commit_ts() else {
            continue;
        };
        let pivot_out = pivot.ssi_state().rw_out_to;
        let committed_first = pivot_out.iter().any(|&q| {
            q != txn.txn_id
                && registry
                    .get(q)
                    .is_none_or(|record| record.commit_ts().is_some_and(|q_ts| q_ts <= pivot_ts))
        });
        if committed_first {
            warn!(
                txn_id = %txn.txn_id,
                pivot = %target,
                "ssi abort: reader of committed pivot"
            );
            return Err(SsiAbortReason::CommittedPivot);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssidb_types::Timestamp;

    fn txn(n: u64) -> TxnId {
        TxnId::new(n).unwrap()
    }

    fn setup(n: u64) -> (TxnRegistry, Vec<std::sync::Arc<TxnShared>>, MvccMetrics) {
        let reg = TxnRegistry::new();
        let txns = (1..=n).map(|i| reg.begin(txn(i), || Timestamp::BOOTSTRAP)).collect();
        (reg, txns, MvccMetrics::new())
    }

    #[test]
    fn test_self_edge_is_ignored() {
        let (_reg, t, m) = setup(1);
        assert!(!mark_rw_edge(&t[0], &t[0], &m));
        assert!(!t[0].in_conflict());
    }

    #[test]
    fn test_no_edges_commits() {
        let (reg, t, _m) = setup(1);
        for policy in [SsiPolicy::PivotFlags, SsiPolicy::CommitOrdered] {
            assert_eq!(validate_commit(&t[0], &reg, policy), Ok(()));
        }
    }

    #[test]
    fn test_write_skew_first_committer_wins_under_commit_ordered() {
        let (reg, t, m) = setup(2);
        mark_rw_edge(&t[0], &t[1], &m);
        mark_rw_edge(&t[1], &t[0], &m);

        assert_eq!(validate_commit(&t[0], &reg, SsiPolicy::CommitOrdered), Ok(()));
        t[0].mark_committed(Timestamp::new(2), true);

        assert_eq!(
            validate_commit(&t[1], &reg, SsiPolicy::CommitOrdered),
            Err(SsiAbortReason::Pivot)
        );
    }

    #[test]
    fn test_pivot_flags_aborts_first_committer() {
        let (reg, t, m) = setup(2);
        mark_rw_edge(&t[0], &t[1], &m);
        mark_rw_edge(&t[1], &t[0], &m);

        assert_eq!(
            validate_commit(&t[0], &reg, SsiPolicy::PivotFlags),
            Err(SsiAbortReason::Pivot)
        );
        t[0].mark_aborted(Timestamp::BOOTSTRAP);
        assert_eq!(
            validate_commit(&t[1], &reg, SsiPolicy::PivotFlags),
            Ok(()),
            "edges to an aborted transaction are discounted"
        );
    }

    #[test]
    fn test_committed_pivot_aborts_its_reader() {
        // t1 -rw-> t2 -rw-> t3, t3 commits, then t2, then t1 tries.
        let (reg, t, m) = setup(3);
        mark_rw_edge(&t[0], &t[1], &m);
        mark_rw_edge(&t[1], &t[2], &m);

        t[2].mark_committed(Timestamp::new(2), true);
        t[1].mark_committed(Timestamp::new(3), true);

        assert_eq!(
            validate_commit(&t[0], &reg, SsiPolicy::CommitOrdered),
            Err(SsiAbortReason::CommittedPivot)
        );
    }

    #[test]
    fn test_out_edge_to_uncommitted_is_harmless_under_commit_ordered() {
        let (reg, t, m) = setup(3);
        mark_rw_edge(&t[2], &t[0], &m);
        mark_rw_edge(&t[0], &t[1], &m);
        assert_eq!(validate_commit(&t[0], &reg, SsiPolicy::CommitOrdered), Ok(()));
        assert_eq!(m.snapshot().rw_edges_marked, 2);
    }
}
