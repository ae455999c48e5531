//! Snapshot retention selection.

/// Split `stages` into `(keep, delete)`.
///
/// The first and last stages are always kept, plus the `retention` most recent.
/// Both outputs are sorted ascending.
pub fn select_retained(stages: &[u32], retention: usize) -> (Vec<u32>, Vec<u32>) {
    let mut sorted = stages.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let (Some(&first), Some(&last)) = (sorted.first(), sorted.last()) else {
        return (Vec::new(), Vec::new());
    };
    let recent_floor = sorted.len().saturating_sub(retention);

    let mut keep = Vec::new();
    let mut delete = Vec::new();
    for (idx, stage) in sorted.into_iter().enumerate() {
        if stage == first || stage == last || idx >= recent_floor {
            keep.push(stage);
        } else {
            delete.push(stage);
        }
    }
    (keep, delete)
}
