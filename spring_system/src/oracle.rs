use common::interfaces::AssignmentOracle;
use common::state::{Assignment, Frame};
use common::Float;

/// A greedy nearest-neighbour assignment oracle.
///
/// Truth slots are visited in order and each claims its closest still
/// unclaimed predicted point, which keeps the correspondence one-to-one
/// and fully deterministic. Quadratic in the cloud size, which is fine at
/// the particle counts the rollout protocol caps correspondence at.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestNeighbourOracle;

impl NearestNeighbourOracle {
    /// Greedily matches every truth slot to a distinct predicted index.
    fn greedy_match<T: Float>(predicted: &Frame<T>, truth: &Frame<T>) -> Vec<usize> {
        assert_eq!(
            predicted.len(),
            truth.len(),
            "assignment requires equally sized clouds"
        );

        let mut claimed = vec![false; predicted.len()];
        let mut mapping = Vec::with_capacity(truth.len());

        for t in truth {
            let mut best = None;
            let mut best_dist = T::infinity();
            for (j, p) in predicted.iter().enumerate() {
                if claimed[j] {
                    continue;
                }
                let dist = (*p - *t).norm_sq();
                if dist < best_dist {
                    best_dist = dist;
                    best = Some(j);
                }
            }
            let j = best.expect("unclaimed predicted point exists for each truth slot");
            claimed[j] = true;
            mapping.push(j);
        }

        mapping
    }
}

impl<T: Float> AssignmentOracle<T> for NearestNeighbourOracle {
    fn assign(&self, predicted: &Frame<T>, truth: &Frame<T>, _cap: usize) -> Assignment {
        Assignment(Self::greedy_match(predicted, truth))
    }

    fn distance_assign(
        &self,
        predicted: &Frame<T>,
        truth: &Frame<T>,
        cap: usize,
    ) -> (T, Assignment) {
        let mapping = Self::greedy_match(predicted, truth);

        let counted = truth.len().min(cap).max(1);
        let mut total = T::zero();
        for (i, &j) in mapping.iter().enumerate().take(counted) {
            total = total + (predicted[j] - truth[i]).norm_sq();
        }
        let distance = total / T::from(counted).expect("pair count fits in the float type");

        (distance, Assignment(mapping))
    }
}

#[cfg(test)]
mod tests {
    use super::NearestNeighbourOracle;
    use common::interfaces::AssignmentOracle;
    use common::vector::Vector;

    fn point(x: f64) -> Vector<f64, 3> {
        Vector::new([x, 0.0, 0.0])
    }

    #[test]
    fn test_assignment_is_one_to_one() {
        let predicted = vec![point(0.0), point(1.0), point(2.0), point(3.0)];
        let truth = vec![point(2.9), point(0.1), point(2.1), point(1.2)];

        let assignment = NearestNeighbourOracle.assign(&predicted, &truth, 3000);
        let mut seen = assignment.0.clone();
        seen.sort_unstable();
        seen.dedup();

        assert_eq!(seen.len(), predicted.len());
    }

    #[test]
    fn test_identity_clouds_have_zero_distance() {
        let cloud = vec![point(0.0), point(0.5), point(1.0)];
        let (distance, assignment) =
            NearestNeighbourOracle.distance_assign(&cloud, &cloud, 3000);

        assert_eq!(distance, 0.0);
        assert_eq!(assignment.0, vec![0, 1, 2]);
    }

    #[test]
    fn test_distance_averages_over_capped_pairs() {
        let predicted = vec![point(0.0), point(1.0)];
        let truth = vec![point(0.2), point(1.2)];

        let (all, _) = NearestNeighbourOracle.distance_assign(&predicted, &truth, 2);
        let (capped, _) = NearestNeighbourOracle.distance_assign(&predicted, &truth, 1);

        // Both pairs carry the same squared distance, so the capped mean
        // matches the full one.
        assert!((all - 0.04).abs() < 1e-12);
        assert!((capped - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_permuted_truth_recovers_permutation() {
        let predicted = vec![point(0.0), point(1.0), point(2.0)];
        let truth = vec![point(2.0), point(0.0), point(1.0)];

        let assignment = NearestNeighbourOracle.assign(&predicted, &truth, 3000);
        assert_eq!(assignment.0, vec![2, 0, 1]);
    }
}
