//! Strategies splitting a dataset across clients.
//!
//! Every strategy assigns each sample to exactly one client and is deterministic for a
//! given seed.

use std::{collections::BTreeMap, fmt, str::FromStr};

use rand::{seq::SliceRandom, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma};

use super::DataError;
use crate::config::PartitionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    /// Same-sized random shards.
    Iid,
    /// Every client only sees a few classes.
    ClassNoiid,
    /// Client sizes and class mixtures drawn from Dirichlet distributions.
    DirichletNoiid,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Partition::Iid => "iid",
            Partition::ClassNoiid => "class_noiid",
            Partition::DirichletNoiid => "dirichlet_noiid",
        })
    }
}

impl FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "iid" => Ok(Partition::Iid),
            "class_noiid" => Ok(Partition::ClassNoiid),
            "dirichlet_noiid" => Ok(Partition::DirichletNoiid),
            _ => Err(format!(
                "unknown partition {:?}, expected one of: iid, class_noiid, dirichlet_noiid",
                s
            )),
        }
    }
}

/// Split the samples with the given labels across `num_clients` clients.
///
/// Returns, for every client, the indices of its samples.
pub fn partition_indices(
    labels: &[i64],
    num_clients: usize,
    partition: Partition,
    seed: u64,
    params: PartitionConfig,
) -> Result<Vec<Vec<usize>>, DataError> {
    if num_clients == 0 {
        return Err(DataError::NoClients(num_clients));
    }
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    match partition {
        Partition::Iid => Ok(iid(labels.len(), num_clients, &mut rng)),
        Partition::ClassNoiid => Ok(class_noiid(labels, num_clients, &mut rng)),
        Partition::DirichletNoiid => dirichlet_noiid(labels, num_clients, params, &mut rng),
    }
}

fn iid<R: Rng>(len: usize, num_clients: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(rng);
    crate::world::client_groups(len, num_clients)
        .into_iter()
        .map(|range| indices[range].to_vec())
        .collect()
}

/// Sample indices grouped by label, labels in increasing order, each group shuffled.
fn indices_by_class<R: Rng>(labels: &[i64], rng: &mut R) -> Vec<Vec<usize>> {
    let mut classes: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (index, &label) in labels.iter().enumerate() {
        classes.entry(label).or_default().push(index);
    }
    classes
        .into_iter()
        .map(|(_, mut indices)| {
            indices.shuffle(rng);
            indices
        })
        .collect()
}

/// Minimum and maximum number of classes per client, for ten classes.
fn classes_per_client_bounds(num_clients: usize) -> (usize, usize) {
    match num_clients {
        1 => (10, 10),
        2 => (7, 8),
        3 => (6, 8),
        4 => (5, 7),
        5 => (5, 6),
        6 => (4, 6),
        7 => (4, 5),
        _ => (3, 5),
    }
}

/// The classes every client draws, between the bounds for `num_clients` clients.
fn pick_classes<R: Rng>(num_classes: usize, num_clients: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let (cmin, cmax) = classes_per_client_bounds(num_clients);
    let class_ids: Vec<usize> = (0..num_classes).collect();
    (0..num_clients)
        .map(|_| {
            let count = rng.gen_range(cmin..=cmax).min(num_classes);
            class_ids.choose_multiple(rng, count).copied().collect()
        })
        .collect()
}

/// The clients owning every class: the clients that picked it, or a random client for the
/// classes nobody picked.
fn class_owners<R: Rng>(
    picks: &[Vec<usize>],
    num_classes: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let mut owners: Vec<Vec<usize>> = vec![Vec::new(); num_classes];
    for (client, classes) in picks.iter().enumerate() {
        for &class in classes {
            owners[class].push(client);
        }
    }
    for class_owners in owners.iter_mut().filter(|owners| owners.is_empty()) {
        class_owners.push(rng.gen_range(0..picks.len()));
    }
    owners
}

fn class_noiid<R: Rng>(labels: &[i64], num_clients: usize, rng: &mut R) -> Vec<Vec<usize>> {
    let classes = indices_by_class(labels, rng);
    if classes.is_empty() {
        return vec![Vec::new(); num_clients];
    }
    let picks = pick_classes(classes.len(), num_clients, rng);
    let owners = class_owners(&picks, classes.len(), rng);

    let mut clients = vec![Vec::new(); num_clients];
    for (indices, class_owners) in classes.iter().zip(&owners) {
        let weights: Vec<f64> = class_owners
            .iter()
            .map(|_| rng.gen_range(0.1..1.0))
            .collect();
        for (owner, share) in class_owners
            .iter()
            .zip(split_by_weights(indices, &weights))
        {
            clients[*owner].extend(share);
        }
    }
    clients
}

fn dirichlet<R: Rng>(alpha: f64, len: usize, rng: &mut R) -> Result<Vec<f64>, DataError> {
    let gamma = Gamma::new(alpha, 1.0).map_err(|_| DataError::InvalidAlpha(alpha))?;
    let mut draws: Vec<f64> = (0..len).map(|_| gamma.sample(rng)).collect();
    let total: f64 = draws.iter().sum();
    if total > 0.0 {
        draws.iter_mut().for_each(|draw| *draw /= total);
    } else {
        draws.iter_mut().for_each(|draw| *draw = 1.0 / len as f64);
    }
    Ok(draws)
}

fn dirichlet_noiid<R: Rng>(
    labels: &[i64],
    num_clients: usize,
    params: PartitionConfig,
    rng: &mut R,
) -> Result<Vec<Vec<usize>>, DataError> {
    let classes = indices_by_class(labels, rng);
    let sizes = dirichlet(params.alpha1, num_clients, rng)?;
    let mixtures = (0..num_clients)
        .map(|_| dirichlet(params.alpha2, classes.len(), rng))
        .collect::<Result<Vec<_>, _>>()?;

    let mut clients = vec![Vec::new(); num_clients];
    for (class, indices) in classes.iter().enumerate() {
        let weights: Vec<f64> = sizes
            .iter()
            .zip(mixtures.iter())
            .map(|(size, mixture)| size * mixture[class])
            .collect();
        for (client, share) in split_by_weights(indices, &weights).into_iter().enumerate() {
            clients[client].extend(share);
        }
    }
    Ok(clients)
}

/// Cut `indices` in consecutive chunks whose sizes follow `weights`.
fn split_by_weights(indices: &[usize], weights: &[f64]) -> Vec<Vec<usize>> {
    let total: f64 = weights.iter().sum();
    let len = indices.len();
    let mut chunks = Vec::with_capacity(weights.len());
    let mut start = 0;
    let mut cumulative = 0.0;
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight;
        let end = if i + 1 == weights.len() {
            len
        } else if total > 0.0 {
            ((cumulative / total * len as f64).round() as usize).clamp(start, len)
        } else {
            start
        };
        chunks.push(indices[start..end].to_vec());
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(len: usize, classes: i64) -> Vec<i64> {
        (0..len as i64).map(|i| i % classes).collect()
    }

    fn assert_exact_cover(parts: &[Vec<usize>], len: usize) {
        let mut all: Vec<usize> = parts.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..len).collect::<Vec<_>>());
    }

    #[test]
    fn test_parse_partition() {
        assert_eq!("class_noiid".parse::<Partition>(), Ok(Partition::ClassNoiid));
        assert!("noiid".parse::<Partition>().is_err());
        assert_eq!(Partition::DirichletNoiid.to_string(), "dirichlet_noiid");
    }

    #[test]
    fn test_iid() {
        let labels = labels(103, 10);
        let parts =
            partition_indices(&labels, 4, Partition::Iid, 42, PartitionConfig::default()).unwrap();
        assert_eq!(
            parts.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![26, 26, 26, 25]
        );
        assert_exact_cover(&parts, 103);
    }

    #[test]
    fn test_class_picks() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for num_clients in [1, 2, 3, 5, 8, 12] {
            let (cmin, cmax) = classes_per_client_bounds(num_clients);
            let picks = pick_classes(10, num_clients, &mut rng);
            assert_eq!(picks.len(), num_clients);
            for classes in &picks {
                assert!((cmin..=cmax).contains(&classes.len()), "{:?}", classes);
                let mut distinct = classes.clone();
                distinct.sort_unstable();
                distinct.dedup();
                assert_eq!(distinct.len(), classes.len());
            }

            let owners = class_owners(&picks, 10, &mut rng);
            for (class, class_owners) in owners.iter().enumerate() {
                let pickers: Vec<usize> = (0..num_clients)
                    .filter(|client| picks[*client].contains(&class))
                    .collect();
                if pickers.is_empty() {
                    // a class nobody picked goes to exactly one client
                    assert_eq!(class_owners.len(), 1);
                    assert!(class_owners[0] < num_clients);
                } else {
                    assert_eq!(class_owners, &pickers);
                }
            }
        }
        // fewer classes than the lower bound: every client takes them all
        let picks = pick_classes(3, 2, &mut rng);
        assert!(picks.iter().all(|classes| classes.len() == 3));
    }

    #[test]
    fn test_class_noiid() {
        let labels = labels(1000, 10);
        for num_clients in [1, 2, 5, 12] {
            let parts = partition_indices(
                &labels,
                num_clients,
                Partition::ClassNoiid,
                42,
                PartitionConfig::default(),
            )
            .unwrap();
            assert_eq!(parts.len(), num_clients);
            assert_exact_cover(&parts, 1000);

            // replay the draws to learn which classes every client owns
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            let classes = indices_by_class(&labels, &mut rng);
            let picks = pick_classes(classes.len(), num_clients, &mut rng);
            let owners = class_owners(&picks, classes.len(), &mut rng);
            let (_, cmax) = classes_per_client_bounds(num_clients);
            for (client, part) in parts.iter().enumerate() {
                let owned: Vec<i64> = (0..10)
                    .filter(|class| owners[*class as usize].contains(&client))
                    .collect();
                let orphans = owned
                    .iter()
                    .filter(|class| !picks[client].contains(&(**class as usize)))
                    .count();
                assert!(owned.len() <= cmax + orphans);
                assert!(part.iter().all(|&i| owned.contains(&labels[i])));
            }
        }

        let single = partition_indices(
            &labels,
            1,
            Partition::ClassNoiid,
            42,
            PartitionConfig::default(),
        )
        .unwrap();
        assert_eq!(single[0].len(), 1000);
    }

    #[test]
    fn test_dirichlet_noiid() {
        let labels = labels(500, 10);
        let parts = partition_indices(
            &labels,
            5,
            Partition::DirichletNoiid,
            7,
            PartitionConfig::default(),
        )
        .unwrap();
        assert_eq!(parts.len(), 5);
        assert_exact_cover(&parts, 500);
    }

    #[test]
    fn test_partitions_are_deterministic() {
        let labels = labels(300, 10);
        for partition in [Partition::Iid, Partition::ClassNoiid, Partition::DirichletNoiid] {
            let first =
                partition_indices(&labels, 3, partition, 1, PartitionConfig::default()).unwrap();
            let second =
                partition_indices(&labels, 3, partition, 1, PartitionConfig::default()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_no_clients() {
        assert!(matches!(
            partition_indices(&[0, 1], 0, Partition::Iid, 1, PartitionConfig::default()),
            Err(DataError::NoClients(0))
        ));
    }

    #[test]
    fn test_split_by_weights() {
        let indices: Vec<usize> = (0..10).collect();
        let chunks = split_by_weights(&indices, &[1.0, 3.0, 1.0]);
        assert_eq!(chunks, vec![vec![0, 1], vec![2, 3, 4, 5, 6, 7], vec![8, 9]]);
        let chunks = split_by_weights(&indices, &[0.0, 0.0]);
        assert_eq!(chunks, vec![vec![], indices.clone()]);
    }
}
