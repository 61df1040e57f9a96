// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History lookup for workflow decisions.
//!
//! Workflow code allocates a sequence number for every non-deterministic call
//! in call order. On a replay the same calls arrive with the same numbers and
//! are answered from history instead of being executed again. The replay
//! horizon is the highest sequence number recorded before the current
//! invocation started; concurrent decisions of the invocation itself land
//! above it in any order.
//!
//! | History at `seq`                  | Result                                   |
//! |-----------------------------------|------------------------------------------|
//! | completed, same decision          | [`Lookup::Replayed`]                     |
//! | scheduled, same decision          | [`Lookup::Resume`] (run it, keep the seq)|
//! | different decision                | [`Lookup::Nondeterministic`]             |
//! | missing, at or below the horizon  | [`Lookup::Nondeterministic`]             |
//! | missing, above the horizon        | [`Lookup::Fresh`]                        |

use crate::engine::{Decision, HistoryEvent, Outcome};

/// How a decision at a given sequence number relates to recorded history.
#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    /// The decision completed before; answer with the recorded outcome.
    Replayed {
        outcome: &'a Outcome,
        /// More history from before the invocation follows this decision
        replaying: bool,
    },
    /// The decision was scheduled but never completed; execute it again.
    Resume {
        /// More history from before the invocation follows this decision
        replaying: bool,
    },
    /// First time this decision is made.
    Fresh,
    /// History disagrees with the code being replayed.
    Nondeterministic(String),
}

/// Classify the decision at `seq` against `history`.
///
/// `history` must be ordered by sequence number, as returned by the engine.
/// `horizon` is the highest sequence number recorded before the invocation
/// started, 0 for a first run.
pub fn lookup<'a>(
    history: &'a [HistoryEvent],
    seq: u64,
    decision: &Decision,
    horizon: u64,
) -> Lookup<'a> {
    match history.binary_search_by_key(&seq, |event| event.seq) {
        Ok(index) => {
            let event = &history[index];
            if event.decision != *decision {
                return Lookup::Nondeterministic(format!(
                    "decision {} is {} in history but workflow code made {}",
                    seq, event.decision, decision
                ));
            }
            let replaying = seq < horizon;
            match &event.outcome {
                Some(outcome) => Lookup::Replayed { outcome, replaying },
                None => Lookup::Resume { replaying },
            }
        }
        Err(_) if seq <= horizon => Lookup::Nondeterministic(format!(
            "decision {} ({}) is missing from history but later decisions were recorded",
            seq, decision
        )),
        Err(_) => Lookup::Fresh,
    }
}
