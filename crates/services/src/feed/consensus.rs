//! Agreement on an event's effective time.
//!
//! Each peer attests the time it first saw an event. Peers do not trust one
//! another's clocks, so the consensus is a mean over the attestations with
//! Tukey fences (1.5 × IQR) applied first. A minority of wildly wrong
//! clocks cannot drag the result outside the honest cluster.

/// Consensus over the first `n` received times. `None` for no input.
pub fn calculate_consensus_time(times: &[f64], n: usize) -> Option<f64> {
    let take = n.min(times.len());
    if take == 0 {
        return None;
    }
    let mut sample: Vec<f64> = times[..take].to_vec();
    sample.sort_by(f64::total_cmp);

    let q1 = quantile(&sample, 0.25);
    let q3 = quantile(&sample, 0.75);
    let iqr = q3 - q1;
    let (low, high) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

    let (sum, count) = sample
        .iter()
        .filter(|t| **t >= low && **t <= high)
        .fold((0.0, 0usize), |(sum, count), t| (sum + t, count + 1));
    // Q1 and Q3 always lie within the fences, so count > 0
    Some(sum / count.max(1) as f64)
}

/// Linear-interpolated quantile of a sorted, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
