use ulid::Ulid;

use crate::model::*;

// ── Slot Catalog ──────────────────────────────────────────────────

/// Compute the bookable slots of one duration class for a day.
///
/// `units` must be the day's units sorted by start. Every unit start is a
/// candidate; a candidate survives only if the units from it onward are
/// contiguous, free, and cover exactly `[start, start + duration)`, and that
/// span lies inside the working hours and clear of every break. Failing
/// candidates are omitted rather than returned as unavailable.
///
/// `own` lets a caller treat units held by its own reservation as free.
/// `not_before` drops candidates starting earlier (same-day notice).
pub fn compute_slots(
    units: &[AvailabilityUnit],
    hours: &WorkingHours,
    duration: Minute,
    own: Option<Ulid>,
    not_before: Option<Minute>,
) -> Vec<ComputedSlot> {
    if hours.window().is_none() {
        return Vec::new();
    }
    let mut slots = Vec::new();
    for (i, first) in units.iter().enumerate() {
        if not_before.is_some_and(|cutoff| first.span.start < cutoff) {
            continue;
        }
        let Some(span) = Span::starting_at(first.span.start, duration) else {
            continue;
        };
        if !hours.admits(&span) {
            continue;
        }
        if covering_run(&units[i..], span, own).is_some() {
            slots.push(ComputedSlot {
                id: first.id,
                span,
                is_available: true,
            });
        }
    }
    slots
}

/// Number of units from `run[0]` that tile `span` exactly, provided each is
/// free for `own` and they are back to back. `None` on a gap, a taken unit,
/// or a unit boundary that overshoots `span.end`.
pub fn covering_run(run: &[AvailabilityUnit], span: Span, own: Option<Ulid>) -> Option<usize> {
    let mut cursor = span.start;
    for (n, unit) in run.iter().enumerate() {
        if unit.span.start != cursor || !unit.is_free_for(own) {
            return None;
        }
        cursor = unit.span.end;
        if cursor == span.end {
            return Some(n + 1);
        }
        if cursor > span.end {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const H: Minute = 60;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
    }

    /// Back-to-back units of `width` minutes covering `[from, to)`.
    fn grid(from: Minute, to: Minute, width: Minute) -> Vec<AvailabilityUnit> {
        let sid = Ulid::new();
        (from..to)
            .step_by(width as usize)
            .map(|start| AvailabilityUnit {
                id: Ulid::new(),
                service_id: sid,
                date: day(),
                span: Span::new(start, start + width),
                is_available: true,
                held_by: None,
            })
            .collect()
    }

    fn office_hours() -> WorkingHours {
        WorkingHours::new(9 * H, 17 * H, vec![Span::new(12 * H, 13 * H)])
    }

    fn starts(slots: &[ComputedSlot]) -> Vec<String> {
        slots.iter().map(|s| s.start_clock()).collect()
    }

    #[test]
    fn sixty_minute_slot_never_crosses_break() {
        let units = grid(9 * H, 17 * H, 30);
        let slots = compute_slots(&units, &office_hours(), 60, None, None);
        let s = starts(&slots);
        assert!(s.contains(&"11:00".to_string()));
        assert!(!s.contains(&"11:30".to_string()));
        assert!(!s.contains(&"12:00".to_string()));
        assert!(!s.contains(&"12:30".to_string()));
        assert!(s.contains(&"13:00".to_string()));
        assert!(!s.contains(&"16:30".to_string())); // would run past close
        assert_eq!(slots.len(), 12);
    }

    #[test]
    fn thirty_minute_slots_fill_open_units() {
        let units = grid(9 * H, 17 * H, 30);
        let slots = compute_slots(&units, &office_hours(), 30, None, None);
        assert_eq!(slots.len(), 14);
        assert!(slots.iter().all(|s| s.is_available));
        assert_eq!(slots[0].id, units[0].id);
    }

    #[test]
    fn returned_slots_stay_inside_hours_and_clear_of_breaks() {
        let hours = WorkingHours::new(
            8 * H + 30,
            18 * H,
            vec![Span::new(10 * H, 10 * H + 15), Span::new(13 * H, 14 * H)],
        );
        let units = grid(7 * H, 19 * H, 15);
        for duration in [15, 30, 45, 60, 90] {
            for slot in compute_slots(&units, &hours, duration, None, None) {
                assert!(hours.window().unwrap().contains_span(&slot.span));
                assert!(hours.breaks.iter().all(|b| !b.overlaps(&slot.span)));
                assert_eq!(slot.span.minutes(), duration);
            }
        }
    }

    #[test]
    fn taken_unit_removes_every_slot_that_spans_it() {
        let mut units = grid(9 * H, 12 * H, 30);
        units[2].is_available = false; // 10:00-10:30
        let s60 = starts(&compute_slots(&units, &office_hours(), 60, None, None));
        assert_eq!(s60, vec!["09:00", "10:30", "11:00"]);
        let s30 = starts(&compute_slots(&units, &office_hours(), 30, None, None));
        assert!(!s30.contains(&"10:00".to_string()));
        assert_eq!(s30.len(), 5);
    }

    #[test]
    fn gap_between_units_breaks_contiguity() {
        let mut units = grid(9 * H, 11 * H, 30);
        units.remove(1); // no unit for 09:30-10:00
        let s60 = starts(&compute_slots(&units, &office_hours(), 60, None, None));
        assert_eq!(s60, vec!["10:00"]);
    }

    #[test]
    fn inactive_hours_yield_nothing() {
        let units = grid(9 * H, 17 * H, 30);
        assert!(compute_slots(&units, &WorkingHours::closed(), 30, None, None).is_empty());
    }

    #[test]
    fn own_hold_counts_as_free() {
        let mut units = grid(9 * H, 10 * H, 30);
        let own = Ulid::new();
        for u in units.iter_mut() {
            u.is_available = false;
            u.held_by = Some(own);
        }
        assert!(compute_slots(&units, &office_hours(), 60, None, None).is_empty());
        let mine = compute_slots(&units, &office_hours(), 60, Some(own), None);
        assert_eq!(starts(&mine), vec!["09:00"]);
    }

    #[test]
    fn not_before_drops_earlier_starts() {
        let units = grid(9 * H, 12 * H, 30);
        let slots = compute_slots(&units, &office_hours(), 30, None, Some(10 * H + 15));
        assert_eq!(starts(&slots), vec!["10:30", "11:00", "11:30"]);
    }

    #[test]
    fn covering_run_rejects_overshoot() {
        let units = grid(9 * H, 11 * H, 45);
        assert_eq!(covering_run(&units, Span::new(9 * H, 10 * H), None), None);
        assert_eq!(covering_run(&units, Span::new(9 * H, 10 * H + 30), None), Some(2));
    }

    #[test]
    fn compute_is_idempotent() {
        let units = grid(9 * H, 17 * H, 30);
        let a = compute_slots(&units, &office_hours(), 60, None, None);
        let b = compute_slots(&units, &office_hours(), 60, None, None);
        assert_eq!(a, b);
    }
}
