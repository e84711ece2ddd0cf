/// Useful enumerations for muon identification and charges.
pub mod enums;
/// Three- and four-vectors and the invariant mass of a muon pair.
pub mod vectors;

/// Histogram edges of evenly spaced `bins` over a given `range`.
///
/// # See Also
/// [`find_bin`]
pub fn get_bin_edges(bins: usize, range: (f64, f64)) -> Vec<f64> {
    let bin_width = (range.1 - range.0) / (bins as f64);
    (0..=bins)
        .map(|i| range.0 + (i as f64 * bin_width))
        .collect()
}

/// Find the bin index for a value given sorted bin edges.
///
/// Returns `None` for underflow, overflow, and `NaN`. Bins are closed on the left, so a value
/// equal to an interior edge lands in the bin that edge opens.
pub fn find_bin(edges: &[f64], value: f64) -> Option<usize> {
    let n_edges = edges.len();
    if n_edges < 2 || !(value >= edges[0] && value < edges[n_edges - 1]) {
        return None;
    }
    // first edge strictly greater than `value`, always in 1..n_edges here
    let upper = edges.partition_point(|edge| *edge <= value);
    Some(upper - 1)
}

/// Check that a list of bin edges describes at least one bin and increases strictly.
pub fn edges_are_valid(edges: &[f64]) -> bool {
    edges.len() >= 2
        && edges.iter().all(|edge| edge.is_finite())
        && edges.windows(2).all(|pair| pair[0] < pair[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bin_edges() {
        let edges = get_bin_edges(3, (0.0, 3.0));
        assert_eq!(edges, vec![0.0, 1.0, 2.0, 3.0]);
        let edges = get_bin_edges(620, (-0.4, 2.7));
        assert_eq!(edges.len(), 621);
        assert_relative_eq!(edges[0], -0.4);
        assert_relative_eq!(edges[620], 2.7, epsilon = 1e-12);
    }

    #[test]
    fn test_find_bin_edge_cases() {
        let edges = vec![0.0, 1.0, 2.0, 3.0];
        assert_eq!(find_bin(&edges, -0.5), None);
        assert_eq!(find_bin(&edges, 3.0), None);
        assert_eq!(find_bin(&edges, 0.0), Some(0));
        assert_eq!(find_bin(&edges, 1.0), Some(1));
        assert_eq!(find_bin(&edges, 2.99), Some(2));
        assert_eq!(find_bin(&edges, f64::NAN), None);
        assert_eq!(find_bin(&[1.0], 1.0), None);
    }

    #[test]
    fn test_edge_validation() {
        assert!(edges_are_valid(&[0.0, 0.5, 2.0]));
        assert!(!edges_are_valid(&[0.0, 0.5, 0.5]));
        assert!(!edges_are_valid(&[1.0, 0.5]));
        assert!(!edges_are_valid(&[1.0]));
        assert!(!edges_are_valid(&[0.0, f64::INFINITY]));
    }
}
