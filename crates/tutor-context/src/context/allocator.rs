//! Budget allocation over classified runs of the compactable region.
//!
//! HIGH messages are always kept, even past the budget. MEDIUM messages fill
//! whatever budget remains, earliest first. LOW messages are always dropped.
//! Both output lists are in conversation order, not bucket order.

use crate::context::classifier::ImportanceClass;
use crate::error::ContextError;

/// A maximal contiguous span of store positions sharing one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub class: ImportanceClass,
    /// First store position (inclusive).
    pub start: usize,
    /// One past the last store position.
    pub end: usize,
}

impl Run {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn positions(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }
}

/// Group per-position classes into runs. `classes[i]` belongs to store
/// position `first_position + i`.
pub fn build_runs(first_position: usize, classes: &[ImportanceClass]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for (offset, class) in classes.iter().enumerate() {
        let position = first_position + offset;
        match runs.last_mut() {
            Some(run) if run.class == *class => run.end = position + 1,
            _ => runs.push(Run {
                class: *class,
                start: position,
                end: position + 1,
            }),
        }
    }
    runs
}

/// Result of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Store positions kept verbatim, in order.
    pub kept: Vec<usize>,
    /// Store positions removed from the wire sequence, in order.
    pub dropped: Vec<usize>,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Whether one budget slot is held for a summary message.
    pub summary_slot: bool,
}

impl Allocation {
    /// Messages plus summary slot this allocation will emit.
    pub fn emitted(&self) -> usize {
        self.kept.len() + usize::from(self.summary_slot)
    }
}

fn check_runs(runs: &[Run]) -> Result<(), ContextError> {
    let mut cursor = None;
    for run in runs {
        if run.is_empty() {
            return Err(ContextError::ClassificationError(format!(
                "empty run at position {}",
                run.start
            )));
        }
        if cursor.is_some_and(|end| run.start < end) {
            return Err(ContextError::ClassificationError(format!(
                "run {}..{} overlaps or precedes the previous run",
                run.start, run.end
            )));
        }
        cursor = Some(run.end);
    }
    Ok(())
}

/// Split runs into kept and dropped positions under `budget`.
pub fn allocate(runs: &[Run], budget: usize) -> Result<Allocation, ContextError> {
    check_runs(runs)?;

    let high: usize = runs
        .iter()
        .filter(|r| r.class == ImportanceClass::High)
        .map(Run::len)
        .sum();
    let mut medium_slots = budget.saturating_sub(high);

    let mut allocation = Allocation {
        high,
        ..Default::default()
    };
    for run in runs {
        for position in run.positions() {
            let keep = match run.class {
                ImportanceClass::High => true,
                ImportanceClass::Medium => {
                    allocation.medium += 1;
                    if medium_slots > 0 {
                        medium_slots -= 1;
                        true
                    } else {
                        false
                    }
                }
                ImportanceClass::Low => {
                    allocation.low += 1;
                    false
                }
            };
            if keep {
                allocation.kept.push(position);
            } else {
                allocation.dropped.push(position);
            }
        }
    }
    Ok(allocation)
}

/// Like [`allocate`], but when something is dropped and `reserve_summary` is
/// set, hold back one budget slot for the summary message.
///
/// No slot is held when HIGH alone meets the budget: nothing beyond the HIGH
/// set is retained in that case, a summary included.
pub fn allocate_with_summary(
    runs: &[Run],
    budget: usize,
    reserve_summary: bool,
) -> Result<Allocation, ContextError> {
    let first = allocate(runs, budget)?;
    if !reserve_summary || first.dropped.is_empty() || budget <= first.high {
        return Ok(first);
    }
    let mut reserved = allocate(runs, budget - 1)?;
    reserved.summary_slot = true;
    Ok(reserved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ImportanceClass::{High, Low, Medium};

    #[test]
    fn build_runs_groups_contiguous_classes() {
        let runs = build_runs(1, &[Medium, Medium, High, Low, Low, Medium]);
        assert_eq!(
            runs,
            vec![
                Run { class: Medium, start: 1, end: 3 },
                Run { class: High, start: 3, end: 4 },
                Run { class: Low, start: 4, end: 6 },
                Run { class: Medium, start: 6, end: 7 },
            ]
        );
    }

    #[test]
    fn medium_fills_budget_in_order() {
        let runs = build_runs(1, &[Medium; 20]);
        let alloc = allocate(&runs, 10).unwrap();
        assert_eq!(alloc.kept, (1..11).collect::<Vec<_>>());
        assert_eq!(alloc.dropped, (11..21).collect::<Vec<_>>());
    }

    #[test]
    fn kept_is_in_conversation_order() {
        let runs = build_runs(1, &[Medium, High, Low, Medium, High]);
        let alloc = allocate(&runs, 3).unwrap();
        // Two HIGH leave one MEDIUM slot, taken by the earliest MEDIUM.
        assert_eq!(alloc.kept, vec![1, 2, 5]);
        assert_eq!(alloc.dropped, vec![3, 4]);
    }

    #[test]
    fn high_overflows_budget() {
        let runs = build_runs(1, &[High, Medium, High, High, Low]);
        let alloc = allocate(&runs, 2).unwrap();
        assert_eq!(alloc.kept, vec![1, 3, 4]);
        assert_eq!(alloc.dropped, vec![2, 5]);
        assert_eq!(alloc.high, 3);
    }

    #[test]
    fn low_is_dropped_even_with_room() {
        let runs = build_runs(1, &[Low, Medium, Low]);
        let alloc = allocate(&runs, 10).unwrap();
        assert_eq!(alloc.kept, vec![2]);
        assert_eq!(alloc.dropped, vec![1, 3]);
    }

    #[test]
    fn summary_slot_takes_one_medium() {
        let runs = build_runs(1, &[Medium; 20]);
        let alloc = allocate_with_summary(&runs, 10, true).unwrap();
        assert!(alloc.summary_slot);
        assert_eq!(alloc.kept.len(), 9);
        assert_eq!(alloc.emitted(), 10);
    }

    #[test]
    fn no_summary_slot_when_nothing_dropped() {
        let runs = build_runs(1, &[Medium; 5]);
        let alloc = allocate_with_summary(&runs, 10, true).unwrap();
        assert!(!alloc.summary_slot);
        assert!(alloc.dropped.is_empty());
    }

    #[test]
    fn no_summary_slot_when_high_fills_budget() {
        let runs = build_runs(1, &[High, High, Medium, High]);
        let alloc = allocate_with_summary(&runs, 3, true).unwrap();
        assert!(!alloc.summary_slot);
        assert_eq!(alloc.kept, vec![1, 2, 4]);
    }

    #[test]
    fn emitted_never_exceeds_budget_or_high() {
        let patterns: [&[ImportanceClass]; 4] = [
            &[High, Medium, Low, Medium, Medium, High],
            &[Low, Low, Low],
            &[High, High, High, High],
            &[Medium, High, Medium, Low, High, Medium, Medium],
        ];
        for classes in patterns {
            let runs = build_runs(1, classes);
            for budget in 0..8 {
                for reserve in [false, true] {
                    let alloc = allocate_with_summary(&runs, budget, reserve).unwrap();
                    assert!(alloc.emitted() <= budget.max(alloc.high));
                    assert_eq!(alloc.kept.len() + alloc.dropped.len(), classes.len());
                }
            }
        }
    }

    #[test]
    fn overlapping_runs_are_rejected() {
        let runs = vec![
            Run { class: Medium, start: 1, end: 4 },
            Run { class: High, start: 3, end: 5 },
        ];
        assert!(matches!(
            allocate(&runs, 5),
            Err(ContextError::ClassificationError(_))
        ));
    }
}
