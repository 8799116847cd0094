//! Process topology and cross-process reduction
//!
//! A run is described once by a [`RunContext`] built at startup and passed
//! explicitly to everything that needs rank or topology. Communication goes
//! through the [`Collective`] trait with two strategies:
//!
//! - [`SingleProcess`]: every operation is a no-op
//! - [`TcpCollective`]: star topology over TCP. Rank 0 listens, peers connect
//!   and announce their rank. An all-reduce gathers every peer's buffer,
//!   sums in rank order starting from rank 0, divides by the world size and
//!   sends the result back, so every rank ends with bit-identical values.
//!
//! Launch follows the torchrun convention: `RANK`, `LOCAL_RANK`, `WORLD_SIZE`,
//! `MASTER_ADDR`, `MASTER_PORT`. Peers must share a byte order; buffers are
//! sent as raw native-endian `f32`.

use crate::error::{GptError, Result};
use std::fmt;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

const CONNECT_ATTEMPTS: usize = 600;
const CONNECT_BACKOFF: Duration = Duration::from_millis(50);

/// Compute device for this process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Device {
    Cpu { threads: usize },
}

impl Device {
    /// CPU device sized to the global Rayon pool
    pub fn cpu() -> Self {
        Device::Cpu {
            threads: rayon::current_num_threads(),
        }
    }

    pub fn threads(&self) -> usize {
        match self {
            Device::Cpu { threads } => *threads,
        }
    }

    /// Whether a single parallel pass per parameter tensor pays off
    pub fn supports_fused_optimizer(&self) -> bool {
        self.threads() > 1
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu { threads } => write!(f, "cpu ({} threads)", threads),
        }
    }
}

/// Where rank 0 listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rendezvous {
    pub addr: String,
    pub port: u16,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self {
            addr: DEFAULT_MASTER_ADDR.to_string(),
            port: DEFAULT_MASTER_PORT,
        }
    }
}

/// Identity of this process within the run
#[derive(Clone, Debug)]
pub struct RunContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub device: Device,
    pub rendezvous: Rendezvous,
}

impl RunContext {
    pub fn single() -> Self {
        Self::for_rank(0, 1)
    }

    pub fn for_rank(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            local_rank: rank,
            world_size,
            device: Device::cpu(),
            rendezvous: Rendezvous::default(),
        }
    }

    /// Read the launch environment; no `RANK` means a single process
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let Some(rank) = lookup("RANK") else {
            return Ok(Self::single());
        };
        let rank = parse_var("RANK", &rank)?;

        let required = |name: &str| -> Result<usize> {
            let value = lookup(name).ok_or_else(|| {
                GptError::Distributed(format!("RANK is set but {} is missing", name))
            })?;
            parse_var(name, &value)
        };
        let local_rank = required("LOCAL_RANK")?;
        let world_size = required("WORLD_SIZE")?;

        if world_size == 0 || rank >= world_size {
            return Err(GptError::Distributed(format!(
                "rank {} is outside world of size {}",
                rank, world_size
            )));
        }

        let addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let port = match lookup("MASTER_PORT") {
            Some(p) => p.parse::<u16>().map_err(|e| {
                GptError::Distributed(format!("MASTER_PORT '{}' is not a port: {}", p, e))
            })?,
            None => DEFAULT_MASTER_PORT,
        };

        Ok(Self {
            rank,
            local_rank,
            world_size,
            device: Device::cpu(),
            rendezvous: Rendezvous { addr, port },
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// The process that logs and writes metrics
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Pick the collective strategy for this topology
    pub fn collective(&self) -> Result<Box<dyn Collective>> {
        if !self.is_distributed() {
            return Ok(Box::new(SingleProcess));
        }
        Ok(Box::new(TcpCollective::connect(self)?))
    }
}

fn parse_var(name: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|e| {
        GptError::Distributed(format!("{}='{}' is not a non-negative integer: {}", name, value, e))
    })
}

/// Cross-process communication used by the training loop
pub trait Collective {
    /// Replace `buf` with its element-wise mean across all processes
    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> Result<()>;

    /// Block until every process arrives
    fn barrier(&mut self) -> Result<()>;

    /// Tear down the process group
    fn shutdown(&mut self) -> Result<()>;
}

/// Collective for a world of one
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn all_reduce_mean(&mut self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

enum Role {
    /// Streams to ranks `1..world_size`, indexed by `rank - 1`
    Master { peers: Vec<TcpStream> },
    Worker { stream: TcpStream },
}

/// Star-topology collective over TCP
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    role: Option<Role>,
}

impl TcpCollective {
    /// Join the group described by `ctx`
    pub fn connect(ctx: &RunContext) -> Result<Self> {
        let endpoint = format!("{}:{}", ctx.rendezvous.addr, ctx.rendezvous.port);
        if ctx.is_master() {
            let listener = TcpListener::bind(&endpoint)?;
            info!(%endpoint, world_size = ctx.world_size, "waiting for peers");
            Self::master(listener, ctx.world_size)
        } else {
            let addr = endpoint
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| GptError::Distributed(format!("cannot resolve {}", endpoint)))?;
            Self::worker(addr, ctx.rank, ctx.world_size)
        }
    }

    /// Rank 0: accept one connection per peer
    pub fn master(listener: TcpListener, world_size: usize) -> Result<Self> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, peer) = listener.accept()?;
            stream.set_nodelay(true)?;
            let rank = read_u64(&mut stream)? as usize;
            if rank == 0 || rank >= world_size || slots[rank - 1].is_some() {
                return Err(GptError::Distributed(format!(
                    "unexpected rank {} from {}",
                    rank, peer
                )));
            }
            debug!(rank, %peer, "peer joined");
            slots[rank - 1] = Some(stream);
        }
        let peers = slots.into_iter().flatten().collect();
        info!(world_size, "process group ready");
        Ok(Self {
            rank: 0,
            world_size,
            role: Some(Role::Master { peers }),
        })
    }

    /// Rank > 0: connect to rank 0, retrying while it starts up
    pub fn worker(addr: SocketAddr, rank: usize, world_size: usize) -> Result<Self> {
        let mut last_err = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    stream.set_nodelay(true)?;
                    write_u64(&mut stream, rank as u64)?;
                    debug!(rank, attempt, "connected to rank 0");
                    return Ok(Self {
                        rank,
                        world_size,
                        role: Some(Role::Worker { stream }),
                    });
                }
                Err(e) => {
                    last_err = Some(e);
                    thread::sleep(CONNECT_BACKOFF);
                }
            }
        }
        Err(GptError::Distributed(format!(
            "rank {} could not reach {}: {:?}",
            rank, addr, last_err
        )))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn role(&mut self) -> Result<&mut Role> {
        self.role
            .as_mut()
            .ok_or_else(|| GptError::Distributed("process group already shut down".to_string()))
    }
}

impl Collective for TcpCollective {
    fn all_reduce_mean(&mut self, buf: &mut [f32]) -> Result<()> {
        let world = self.world_size as f32;
        match self.role()? {
            Role::Master { peers } => {
                let mut incoming = vec![0.0f32; buf.len()];
                for (i, peer) in peers.iter_mut().enumerate() {
                    let len = read_u64(peer)? as usize;
                    if len != buf.len() {
                        return Err(GptError::Distributed(format!(
                            "rank {} sent {} values, expected {}",
                            i + 1,
                            len,
                            buf.len()
                        )));
                    }
                    peer.read_exact(bytemuck::cast_slice_mut::<f32, u8>(&mut incoming[..]))?;
                    for (acc, v) in buf.iter_mut().zip(&incoming) {
                        *acc += v;
                    }
                }
                for v in buf.iter_mut() {
                    *v /= world;
                }
                // the header doubles as the release signal for an empty barrier
                for peer in peers.iter_mut() {
                    write_u64(peer, buf.len() as u64)?;
                    peer.write_all(bytemuck::cast_slice::<f32, u8>(buf))?;
                    peer.flush()?;
                }
            }
            Role::Worker { stream } => {
                write_u64(stream, buf.len() as u64)?;
                stream.write_all(bytemuck::cast_slice::<f32, u8>(buf))?;
                stream.flush()?;
                let len = read_u64(stream)? as usize;
                if len != buf.len() {
                    return Err(GptError::Distributed(format!(
                        "rank 0 returned {} values, expected {}",
                        len,
                        buf.len()
                    )));
                }
                stream.read_exact(bytemuck::cast_slice_mut::<f32, u8>(buf))?;
            }
        }
        Ok(())
    }

    fn barrier(&mut self) -> Result<()> {
        self.all_reduce_mean(&mut [])
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.role.is_none() {
            warn!(rank = self.rank, "shutdown called twice");
            return Ok(());
        }
        self.barrier()?;
        self.role = None;
        debug!(rank = self.rank, "process group closed");
        Ok(())
    }
}

fn write_u64(stream: &mut TcpStream, value: u64) -> Result<()> {
    stream.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u64(stream: &mut TcpStream) -> Result<u64> {
    let mut bytes = [0u8; 8];
    stream.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_without_rank_is_single_process() {
        let ctx = RunContext::from_lookup(|_| None).unwrap();
        assert_eq!((ctx.rank, ctx.local_rank, ctx.world_size), (0, 0, 1));
        assert!(ctx.is_master());
        assert!(!ctx.is_distributed());
    }

    #[test]
    fn test_env_with_rank() {
        let vars: HashMap<&str, &str> = [
            ("RANK", "3"),
            ("LOCAL_RANK", "1"),
            ("WORLD_SIZE", "4"),
            ("MASTER_PORT", "31000"),
        ]
        .into_iter()
        .collect();
        let ctx = RunContext::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!((ctx.rank, ctx.local_rank, ctx.world_size), (3, 1, 4));
        assert_eq!(ctx.rendezvous.addr, DEFAULT_MASTER_ADDR);
        assert_eq!(ctx.rendezvous.port, 31000);
        assert!(!ctx.is_master());
    }

    #[test]
    fn test_env_rank_outside_world_rejected() {
        let lookup = |k: &str| match k {
            "RANK" => Some("2".to_string()),
            "LOCAL_RANK" => Some("0".to_string()),
            "WORLD_SIZE" => Some("2".to_string()),
            _ => None,
        };
        assert!(matches!(
            RunContext::from_lookup(lookup),
            Err(GptError::Distributed(_))
        ));
    }

    #[test]
    fn test_tcp_all_reduce_mean_across_three_ranks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let world = 3;

        let workers: Vec<_> = (1..world)
            .map(|rank| {
                thread::spawn(move || {
                    let mut c = TcpCollective::worker(addr, rank, world).unwrap();
                    let mut buf = vec![rank as f32; 4];
                    c.all_reduce_mean(&mut buf).unwrap();
                    c.barrier().unwrap();
                    c.shutdown().unwrap();
                    buf
                })
            })
            .collect();

        let mut master = TcpCollective::master(listener, world).unwrap();
        let mut buf = vec![0.0f32, 3.0, 6.0, 9.0];
        master.all_reduce_mean(&mut buf).unwrap();
        master.barrier().unwrap();
        master.shutdown().unwrap();

        // (0+1+2)/3, (3+1+2)/3, ...
        assert_eq!(buf, vec![1.0, 2.0, 3.0, 4.0]);
        for handle in workers {
            assert_eq!(handle.join().unwrap(), buf);
        }
        assert!(master.all_reduce_mean(&mut [1.0]).is_err());
    }

    #[test]
    fn test_single_process_is_identity() {
        let mut c = SingleProcess;
        let mut buf = vec![1.5, -2.0];
        c.all_reduce_mean(&mut buf).unwrap();
        assert_eq!(buf, vec![1.5, -2.0]);
        c.shutdown().unwrap();
    }
}
