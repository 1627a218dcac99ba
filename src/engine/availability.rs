use crate::model::*;

// ── Free-time computation ─────────────────────────────────────────

/// Occupied time inside `window`, clamped to it, merged into disjoint spans.
pub fn occupied_spans(resource: &ResourceState, window: &Span) -> Vec<Span> {
    let mut occupied: Vec<Span> = resource
        .overlapping(window)
        .map(|i| Span::new(i.span.start.max(window.start), i.span.end.min(window.end)))
        .collect();
    occupied.sort_by_key(|s| s.start);
    merge_overlapping(&occupied)
}

/// Gaps in `window` not covered by any active booking or block.
pub fn free_spans(resource: &ResourceState, window: &Span, min_duration_ms: Option<Ms>) -> Vec<Span> {
    let occupied = occupied_spans(resource, window);
    let mut free = subtract_intervals(&[*window], &occupied);
    if let Some(min_dur) = min_duration_ms {
        free.retain(|span| span.duration_ms() >= min_dur);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
