//! Density-based clustering over cosine distance.

use std::collections::VecDeque;

use rayon::prelude::*;

use crate::vectors::normalized;

/// Label given to points that belong to no cluster.
pub const NOISE: i64 = -1;

const UNVISITED: i64 = i64::MIN;

/// Cluster `points` with DBSCAN using `1 - cosine similarity` as distance.
///
/// A point's neighborhood is every point within `eps`, itself included, and
/// a point is a core point when its neighborhood has at least `min_samples`
/// members. Clusters are numbered from 0 in the order their first core point
/// appears in `points`, so the same input always yields the same labels.
pub fn dbscan(points: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<i64> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }

    let unit: Vec<Vec<f32>> = points.iter().map(|p| normalized(p)).collect();

    // O(n^2) distance pass; the only expensive part.
    let neighborhoods: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .filter(|&j| i == j || 1.0 - dot(&unit[i], &unit[j]) <= eps)
                .collect()
        })
        .collect();

    let mut labels = vec![UNVISITED; n];
    let mut next_label = 0;

    for i in 0..n {
        if labels[i] != UNVISITED {
            continue;
        }
        if neighborhoods[i].len() < min_samples {
            labels[i] = NOISE;
            continue;
        }

        let cluster = next_label;
        next_label += 1;
        labels[i] = cluster;

        let mut queue: VecDeque<usize> = neighborhoods[i].iter().copied().collect();
        while let Some(q) = queue.pop_front() {
            if labels[q] == NOISE {
                // Border point reached from a core point.
                labels[q] = cluster;
                continue;
            }
            if labels[q] != UNVISITED {
                continue;
            }
            labels[q] = cluster;
            if neighborhoods[q].len() >= min_samples {
                queue.extend(neighborhoods[q].iter().copied());
            }
        }
    }

    labels
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_clusters_and_noise() {
        let points = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.98, 0.05, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.02, 0.99, 0.0],
            vec![0.0, 0.0, 1.0],
        ];
        let labels = dbscan(&points, 0.1, 2);
        assert_eq!(labels, vec![0, 0, 1, 1, NOISE]);
    }

    #[test]
    fn test_min_samples_one_makes_singletons() {
        let points = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert_eq!(dbscan(&points, 0.1, 1), vec![0, 1]);
    }

    #[test]
    fn test_border_point_joins_cluster() {
        // b is within eps of a and c, but a and c are not within eps of
        // each other; with min_samples 3 only b is a core point.
        let a = vec![1.0, 0.0];
        let b = vec![(0.15f32).cos(), (0.15f32).sin()];
        let c = vec![(0.3f32).cos(), (0.3f32).sin()];
        let eps = 1.0 - (0.2f32).cos();

        let labels = dbscan(&[a, b, c], eps, 3);
        assert_eq!(labels, vec![0, 0, 0]);
    }

    #[test]
    fn test_empty_input() {
        assert!(dbscan(&[], 0.5, 2).is_empty());
    }
}
