//! Process rank discovery and role selection.
//!
//! Ranks are not negotiated by this crate: the processes are started by a launcher (`mpiexec`,
//! a job scheduler, a shell loop) which tells every process its rank and the size of the
//! group, either through its usual environment variables or through the `--rank` and
//! `--world_size` flags.

use std::{env, ops::Range};

use thiserror::Error;

use crate::common::ClientId;

/// Environment variables holding the rank and the world size, in lookup order.
const LAUNCHER_VARIABLES: &[(&str, &str)] = &[
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
    ("FEDRUN_RANK", "FEDRUN_WORLD_SIZE"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },
    #[error("{rank_var} is set but {size_var} is not")]
    Incomplete { rank_var: String, size_var: String },
    #[error("rank {rank} is out of range for a world of size {size}")]
    RankOutOfRange { rank: u32, size: u32 },
    #[error("the world size must be at least 1")]
    EmptyWorld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The rank of this process and the number of processes taking part to the run.
pub struct World {
    pub rank: u32,
    pub size: u32,
}

impl Default for World {
    fn default() -> Self {
        Self { rank: 0, size: 1 }
    }
}

impl World {
    pub fn new(rank: u32, size: u32) -> Result<Self, WorldError> {
        if size == 0 {
            return Err(WorldError::EmptyWorld);
        }
        if rank >= size {
            return Err(WorldError::RankOutOfRange { rank, size });
        }
        Ok(Self { rank, size })
    }

    /// Discover the world from explicit values, falling back to the launcher environment.
    ///
    /// When only one of `rank` and `size` is given, the missing value is taken from the
    /// environment. The environment is not read when both are given.
    pub fn discover(rank: Option<u32>, size: Option<u32>) -> Result<Self, WorldError> {
        if let (Some(rank), Some(size)) = (rank, size) {
            return Self::new(rank, size);
        }
        match (rank, size, Self::from_env()?) {
            (Some(rank), Some(size), _) => Self::new(rank, size),
            (Some(rank), None, Some(world)) => Self::new(rank, world.size),
            (None, Some(size), Some(world)) => Self::new(world.rank, size),
            (Some(rank), None, None) => Self::new(rank, rank + 1),
            (None, Some(size), None) => Self::new(0, size),
            (None, None, Some(world)) => Ok(world),
            (None, None, None) => Ok(Self::default()),
        }
    }

    /// Read the rank and the size from the first launcher that set them.
    pub fn from_env() -> Result<Option<Self>, WorldError> {
        for (rank_var, size_var) in LAUNCHER_VARIABLES {
            let rank = match env::var(rank_var) {
                Ok(rank) => parse_var(rank_var, &rank)?,
                Err(_) => continue,
            };
            let size = match env::var(size_var) {
                Ok(size) => parse_var(size_var, &size)?,
                Err(_) => {
                    return Err(WorldError::Incomplete {
                        rank_var: rank_var.to_string(),
                        size_var: size_var.to_string(),
                    })
                }
            };
            debug!("world discovered from {} and {}", rank_var, size_var);
            return Self::new(rank, size).map(Some);
        }
        Ok(None)
    }

    pub fn role(&self) -> Role {
        Role::of(*self)
    }

    /// Number of ranks acting as clients.
    pub fn client_ranks(&self) -> u32 {
        self.size.saturating_sub(1)
    }
}

fn parse_var(name: &str, value: &str) -> Result<u32, WorldError> {
    value.trim().parse().map_err(|_| WorldError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a process does in the run.
pub enum Role {
    /// The only process: clients and server are simulated in-process.
    Serial,
    /// Rank 0 of a multi-process run.
    Server,
    /// Any other rank of a multi-process run.
    Client(u32),
}

impl Role {
    pub fn of(world: World) -> Self {
        match world {
            World { size: 1, .. } => Role::Serial,
            World { rank: 0, .. } => Role::Server,
            World { rank, .. } => Role::Client(rank),
        }
    }
}

/// Split `num_clients` clients in contiguous groups over `num_groups` client ranks.
///
/// The first `num_clients % num_groups` groups get one extra client; groups can be
/// empty when there are more ranks than clients.
pub fn client_groups(num_clients: usize, num_groups: usize) -> Vec<Range<usize>> {
    if num_groups == 0 {
        return Vec::new();
    }
    let base = num_clients / num_groups;
    let extra = num_clients % num_groups;
    let mut start = 0;
    (0..num_groups)
        .map(|group| {
            let len = base + usize::from(group < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// The clients owned by the given client rank (ranks start at 1).
pub fn clients_of_rank(rank: u32, num_clients: usize, num_client_ranks: u32) -> Vec<ClientId> {
    client_groups(num_clients, num_client_ranks as usize)
        .get(rank.saturating_sub(1) as usize)
        .cloned()
        .unwrap_or(0..0)
        .map(|index| ClientId(index as u32))
        .collect()
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn clear_env() {
        for (rank_var, size_var) in LAUNCHER_VARIABLES {
            env::remove_var(rank_var);
            env::remove_var(size_var);
        }
    }

    #[test]
    fn test_role_selection() {
        assert_eq!(World::new(0, 1).unwrap().role(), Role::Serial);
        assert_eq!(World::new(0, 2).unwrap().role(), Role::Server);
        assert_eq!(World::new(1, 2).unwrap().role(), Role::Client(1));
        assert_eq!(World::new(3, 4).unwrap().role(), Role::Client(3));
        // rank 0 is the server only when other processes are present
        assert_ne!(World::new(0, 1).unwrap().role(), Role::Server);
    }

    #[test]
    fn test_invalid_world() {
        assert_eq!(World::new(0, 0), Err(WorldError::EmptyWorld));
        assert_eq!(
            World::new(2, 2),
            Err(WorldError::RankOutOfRange { rank: 2, size: 2 })
        );
    }

    #[test]
    #[serial]
    fn test_discover_from_env() {
        clear_env();
        assert_eq!(World::discover(None, None), Ok(World::default()));

        env::set_var("PMI_RANK", "2");
        env::set_var("PMI_SIZE", "3");
        assert_eq!(World::discover(None, None), Ok(World { rank: 2, size: 3 }));
        // explicit values win
        assert_eq!(
            World::discover(Some(0), None),
            Ok(World { rank: 0, size: 3 })
        );

        // OpenMPI takes precedence over PMI
        env::set_var("OMPI_COMM_WORLD_RANK", "1");
        env::set_var("OMPI_COMM_WORLD_SIZE", "5");
        assert_eq!(World::discover(None, None), Ok(World { rank: 1, size: 5 }));

        env::set_var("OMPI_COMM_WORLD_SIZE", "many");
        assert!(matches!(
            World::discover(None, None),
            Err(WorldError::InvalidValue { .. })
        ));

        env::remove_var("OMPI_COMM_WORLD_SIZE");
        assert!(matches!(
            World::discover(None, None),
            Err(WorldError::Incomplete { .. })
        ));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_discover_from_flags() {
        clear_env();
        assert_eq!(World::discover(Some(1), Some(3)), Ok(World { rank: 1, size: 3 }));
        assert_eq!(World::discover(None, Some(3)), Ok(World { rank: 0, size: 3 }));
        assert!(World::discover(Some(3), Some(3)).is_err());
    }

    #[test]
    #[serial]
    fn test_flags_ignore_broken_env() {
        clear_env();
        env::set_var("PMI_RANK", "1");
        assert!(World::discover(None, None).is_err());
        assert_eq!(World::discover(Some(1), Some(3)), Ok(World { rank: 1, size: 3 }));

        env::set_var("PMI_SIZE", "lots");
        assert_eq!(World::discover(Some(0), Some(2)), Ok(World { rank: 0, size: 2 }));
        assert!(matches!(
            World::discover(Some(0), None),
            Err(WorldError::InvalidValue { .. })
        ));
        clear_env();
    }

    #[test]
    fn test_client_groups() {
        assert_eq!(client_groups(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(client_groups(4, 4), vec![0..1, 1..2, 2..3, 3..4]);
        assert_eq!(client_groups(2, 3), vec![0..1, 1..2, 2..2]);
        assert!(client_groups(5, 0).is_empty());

        let groups = client_groups(17, 5);
        assert_eq!(groups.iter().map(|g| g.len()).sum::<usize>(), 17);
        assert_eq!(groups.last().unwrap().end, 17);
    }

    #[test]
    fn test_clients_of_rank() {
        assert_eq!(clients_of_rank(1, 3, 2), vec![ClientId(0), ClientId(1)]);
        assert_eq!(clients_of_rank(2, 3, 2), vec![ClientId(2)]);
        assert!(clients_of_rank(3, 3, 2).is_empty());
    }
}
