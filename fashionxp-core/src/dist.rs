use crate::error::Error;
use clap::ValueEnum;

/// Distributed job launcher the driver was started under. Every
/// launcher except `none` publishes rank and world size through
/// environment variables; the predictor itself is launcher-agnostic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Launcher {
    #[default]
    None,
    /// torchrun-style `RANK` / `WORLD_SIZE`.
    Pytorch,
    /// Open MPI `OMPI_COMM_WORLD_RANK` / `OMPI_COMM_WORLD_SIZE`.
    Mpi,
    /// `SLURM_PROCID` / `SLURM_NTASKS`.
    Slurm,
}

/// One worker's view of the distributed run. Each worker holds an
/// independent replica; result aggregation across workers belongs to
/// the external runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistContext {
    pub rank: usize,
    pub world_size: usize,
}

impl DistContext {
    pub fn local() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn detect(launcher: Launcher) -> Result<Self, Error> {
        Self::from_lookup(launcher, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        launcher: Launcher,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, Error> {
        let (rank_key, world_key) = match launcher {
            Launcher::None => return Ok(Self::local()),
            Launcher::Pytorch => ("RANK", "WORLD_SIZE"),
            Launcher::Mpi => ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
            Launcher::Slurm => ("SLURM_PROCID", "SLURM_NTASKS"),
        };
        let rank = parse_env(lookup(rank_key), rank_key)?;
        let world_size = parse_env(lookup(world_key), world_key)?;
        if world_size == 0 || rank >= world_size {
            return Err(Error::Configuration(format!(
                "invalid distributed context: rank {rank} of world size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }
}

fn parse_env(value: Option<String>, key: &str) -> Result<usize, Error> {
    let value = value.ok_or_else(|| {
        Error::Configuration(format!("launcher requires the `{key}` environment variable"))
    })?;
    value.parse().map_err(|_| {
        Error::Configuration(format!("`{key}` is not a valid worker index: `{value}`"))
    })
}
