//! Multi-process data parallelism.
//!
//! * [`DistEnv`] — rank / world size from the launcher's environment
//!   (`RANK`, `LOCAL_RANK`, `WORLD_SIZE`, `MASTER_ADDR`, `MASTER_PORT`).
//! * [`GradSync`] — averages accumulated gradients across ranks before the
//!   optimiser update. Variables in the ignore set (the rotary `pos_cis`
//!   buffer) are never communicated.
//! * [`LocalSync`] for a single process, [`TcpSync`] for a star all-reduce
//!   through rank 0 (CPU fallback and NCCL rendezvous), `NcclSync` (feature
//!   `nccl`) for CUDA devices.
//!
//! Before the first step every rank adopts rank 0's parameters
//! ([`GradSync::broadcast_params`]), so replicas start identical and stay so.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use parking_lot::Mutex;

use pretrain_core::POS_CIS;

// ── Environment ─────────────────────────────────────────────────────────────

/// Process placement as exported by a torchrun-style launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistEnv {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl DistEnv {
    /// Distributed iff `RANK` is set and not `-1`. Returns `None` otherwise.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let rank: i64 = match lookup("RANK") {
            Some(v) => v.trim().parse().with_context(|| format!("invalid RANK {v:?}"))?,
            None => return Ok(None),
        };
        if rank == -1 {
            return Ok(None);
        }
        let parse = |key: &str, default: &str| -> Result<usize> {
            let raw = lookup(key).unwrap_or_else(|| default.to_string());
            raw.trim()
                .parse()
                .with_context(|| format!("invalid {key} {raw:?}"))
        };
        let rank = usize::try_from(rank).with_context(|| format!("invalid RANK {rank}"))?;
        let local_rank = parse("LOCAL_RANK", "0")?;
        let world_size = parse("WORLD_SIZE", "1")?;
        if world_size == 0 || rank >= world_size {
            anyhow::bail!("RANK {rank} out of range for WORLD_SIZE {world_size}");
        }
        let master_port = parse("MASTER_PORT", "29500")?;
        let master_port =
            u16::try_from(master_port).with_context(|| format!("invalid MASTER_PORT {master_port}"))?;
        Ok(Some(Self {
            rank,
            local_rank,
            world_size,
            master_addr: lookup("MASTER_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            master_port,
        }))
    }

    /// Rank 0 logs and writes checkpoints.
    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    /// One accelerator per local rank.
    pub fn device_spec(&self) -> String {
        format!("cuda:{}", self.local_rank)
    }
}

// ── Gradient sync ───────────────────────────────────────────────────────────

/// Cross-rank parameter and gradient exchange. `vars` is sorted by name,
/// identically on every rank.
pub trait GradSync: Send {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    /// Overwrite every rank's parameters with rank 0's. Called once, before
    /// the first forward pass.
    fn broadcast_params(&self, vars: &[(String, Var)]) -> Result<()>;
    fn all_reduce_mean(&self, grads: &mut GradStore, vars: &[(String, Var)]) -> Result<()>;
}

/// Single process: nothing to exchange.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalSync;

impl GradSync for LocalSync {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast_params(&self, _vars: &[(String, Var)]) -> Result<()> {
        Ok(())
    }

    fn all_reduce_mean(&self, _grads: &mut GradStore, _vars: &[(String, Var)]) -> Result<()> {
        Ok(())
    }
}

const CONNECT_ATTEMPTS: usize = 120;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);
/// Longest wait for a peer's message before the run is failed.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Star all-reduce over TCP: every worker sends its flattened gradients to
/// rank 0, which sums, averages and broadcasts the result back.
pub struct TcpSync {
    rank: usize,
    world_size: usize,
    /// Rank 0: one stream per peer, ordered by peer rank. Others: the root.
    streams: Mutex<Vec<TcpStream>>,
    /// Name filters for variables that are never exchanged. The rotary
    /// `pos_cis` table is a plain tensor rebuilt identically on every rank,
    /// so it is not a `Var` and never reaches this path for `TinyLm`; the
    /// entry covers models that register such buffers as variables.
    ignored: HashSet<String>,
}

impl TcpSync {
    pub fn connect(env: &DistEnv) -> Result<Self> {
        let addr = format!("{}:{}", env.master_addr, env.master_port);
        let streams = if env.rank == 0 {
            let listener =
                TcpListener::bind(&addr).with_context(|| format!("binding rendezvous {addr}"))?;
            let mut peers: Vec<Option<TcpStream>> = (1..env.world_size).map(|_| None).collect();
            for _ in 1..env.world_size {
                let (mut stream, from) = listener.accept()?;
                stream.set_nodelay(true)?;
                let peer = read_u64(&mut stream)? as usize;
                if peer == 0 || peer >= env.world_size || peers[peer - 1].is_some() {
                    anyhow::bail!("unexpected rank {peer} from {from}");
                }
                tracing::debug!(peer, %from, "peer joined");
                peers[peer - 1] = Some(stream);
            }
            peers.into_iter().flatten().collect()
        } else {
            let mut stream = connect_with_retry(&addr)?;
            stream.set_nodelay(true)?;
            write_u64(&mut stream, env.rank as u64)?;
            vec![stream]
        };
        for stream in &streams {
            stream.set_read_timeout(Some(DEFAULT_PEER_TIMEOUT))?;
        }
        tracing::info!(rank = env.rank, world_size = env.world_size, %addr, "process group ready");
        Ok(Self {
            rank: env.rank,
            world_size: env.world_size,
            streams: Mutex::new(streams),
            ignored: HashSet::from([POS_CIS.to_string()]),
        })
    }

    /// Fail a collective when a peer stays silent for longer than `timeout`.
    pub fn with_timeout(self, timeout: Duration) -> Result<Self> {
        for stream in self.streams.lock().iter() {
            stream.set_read_timeout(Some(timeout))?;
        }
        Ok(self)
    }

    /// Also skip any variable whose name contains `name`.
    pub fn ignore(mut self, name: impl Into<String>) -> Self {
        self.ignored.insert(name.into());
        self
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored.iter().any(|ig| name.contains(ig.as_str()))
    }

    pub(crate) fn synced<'a>(&self, vars: &'a [(String, Var)]) -> Vec<&'a Var> {
        vars.iter()
            .filter(|(name, _)| !self.is_ignored(name))
            .map(|(_, v)| v)
            .collect()
    }

    /// Rank 0 sends `local` to every peer; peers return what they received.
    fn broadcast(&self, local: Vec<f32>) -> Result<Vec<f32>> {
        let mut streams = self.streams.lock();
        if self.rank == 0 {
            for stream in streams.iter_mut() {
                write_f32s(stream, &local)?;
            }
            Ok(local)
        } else {
            read_f32s(&mut streams[0])
        }
    }

    /// Raw bytes from rank 0 to every peer (NCCL unique id exchange).
    pub fn broadcast_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut streams = self.streams.lock();
        if self.rank == 0 {
            for stream in streams.iter_mut() {
                write_u64(stream, bytes.len() as u64)?;
                stream.write_all(bytes)?;
                stream.flush()?;
            }
            Ok(bytes.to_vec())
        } else {
            let root = &mut streams[0];
            let len = read_u64(root)? as usize;
            let mut buf = vec![0u8; len];
            root.read_exact(&mut buf).map_err(peer_error)?;
            Ok(buf)
        }
    }

    fn exchange(&self, local: Vec<f32>) -> Result<Vec<f32>> {
        let mut streams = self.streams.lock();
        if self.rank == 0 {
            let mut sum = local;
            for stream in streams.iter_mut() {
                let theirs = read_f32s(stream)?;
                if theirs.len() != sum.len() {
                    anyhow::bail!("gradient length mismatch: {} vs {}", theirs.len(), sum.len());
                }
                for (acc, v) in sum.iter_mut().zip(theirs) {
                    *acc += v;
                }
            }
            let inv = 1.0 / self.world_size as f32;
            sum.iter_mut().for_each(|v| *v *= inv);
            for stream in streams.iter_mut() {
                write_f32s(stream, &sum)?;
            }
            Ok(sum)
        } else {
            let root = &mut streams[0];
            write_f32s(root, &local)?;
            read_f32s(root)
        }
    }
}

impl GradSync for TcpSync {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast_params(&self, vars: &[(String, Var)]) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        let synced = self.synced(vars);
        let mut flat = Vec::new();
        if self.rank == 0 {
            for var in &synced {
                flat.extend(var.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
            }
        }
        let params = self.broadcast(flat)?;
        let expected: usize = synced.iter().map(|v| v.elem_count()).sum();
        if params.len() != expected {
            anyhow::bail!(
                "parameter count mismatch: rank 0 sent {}, expected {expected}",
                params.len()
            );
        }
        if self.rank != 0 {
            let mut offset = 0;
            for var in synced {
                let n = var.elem_count();
                let t = Tensor::from_slice(&params[offset..offset + n], var.shape(), var.device())?
                    .to_dtype(var.dtype())?;
                var.set(&t)?;
                offset += n;
            }
        }
        tracing::debug!(rank = self.rank, elems = expected, "parameters broadcast from rank 0");
        Ok(())
    }

    fn all_reduce_mean(&self, grads: &mut GradStore, vars: &[(String, Var)]) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        let synced = self.synced(vars);

        // Missing gradients (unused experts) travel as zeros so every rank
        // sends the same layout.
        let mut flat = Vec::new();
        for var in &synced {
            match grads.get(var.as_tensor()) {
                Some(g) => flat.extend(g.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?),
                None => flat.extend(std::iter::repeat(0f32).take(var.elem_count())),
            }
        }

        let reduced = self.exchange(flat)?;

        let mut offset = 0;
        for var in synced {
            let n = var.elem_count();
            let g = Tensor::from_slice(&reduced[offset..offset + n], var.shape(), var.device())?
                .to_dtype(var.dtype())?;
            grads.insert(var.as_tensor(), g);
            offset += n;
        }
        Ok(())
    }
}

fn connect_with_retry(addr: &str) -> Result<TcpStream> {
    let mut last_err = None;
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(CONNECT_BACKOFF);
            }
        }
    }
    Err(anyhow::anyhow!(
        "could not reach rank 0 at {addr}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

// ── Wire helpers (little-endian) ────────────────────────────────────────────

fn write_u64(stream: &mut TcpStream, v: u64) -> Result<()> {
    stream.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u64(stream: &mut TcpStream) -> Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf).map_err(peer_error)?;
    Ok(u64::from_le_bytes(buf))
}

fn peer_error(e: std::io::Error) -> anyhow::Error {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            anyhow::anyhow!("peer timed out: {e}")
        }
        std::io::ErrorKind::UnexpectedEof => anyhow::anyhow!("peer disconnected: {e}"),
        _ => e.into(),
    }
}

fn write_f32s(stream: &mut TcpStream, values: &[f32]) -> Result<()> {
    write_u64(stream, values.len() as u64)?;
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

fn read_f32s(stream: &mut TcpStream) -> Result<Vec<f32>> {
    let len = read_u64(stream)? as usize;
    let mut bytes = vec![0u8; len * 4];
    stream.read_exact(&mut bytes).map_err(peer_error)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn no_rank_means_single_process() {
        assert!(DistEnv::from_lookup(env_of(&[])).unwrap().is_none());
        assert!(DistEnv::from_lookup(env_of(&[("RANK", "-1")])).unwrap().is_none());
    }

    #[test]
    fn reads_launcher_environment() {
        let env = DistEnv::from_lookup(env_of(&[
            ("RANK", "3"),
            ("LOCAL_RANK", "1"),
            ("WORLD_SIZE", "4"),
            ("MASTER_PORT", "1234"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(env.rank, 3);
        assert!(!env.is_main());
        assert_eq!(env.device_spec(), "cuda:1");
        assert_eq!(env.master_port, 1234);
        assert_eq!(env.master_addr, "127.0.0.1");
    }

    #[test]
    fn rejects_rank_outside_world() {
        assert!(DistEnv::from_lookup(env_of(&[("RANK", "2"), ("WORLD_SIZE", "2")])).is_err());
    }

    /// Gradient of `sum(w * c)` is `c`.
    fn grads(w: &Var, rotary: &Var, c: f32) -> GradStore {
        let dev = Device::Cpu;
        let cw = Tensor::new(&[c, c], &dev).unwrap();
        let cr = Tensor::new(&[c], &dev).unwrap();
        let a = (w.as_tensor() * cw).unwrap().sum_all().unwrap();
        let b = (rotary.as_tensor() * cr).unwrap().sum_all().unwrap();
        (a + b).unwrap().backward().unwrap()
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn env_for(rank: usize, world_size: usize, port: u16) -> DistEnv {
        DistEnv {
            rank,
            local_rank: rank,
            world_size,
            master_addr: "127.0.0.1".into(),
            master_port: port,
        }
    }

    /// `TinyLm` keeps its rotary table as a plain tensor; a `Var` named
    /// `pos_cis` stands in for models that register it as a variable.
    #[test]
    fn tcp_all_reduce_averages_and_skips_pos_cis() {
        let port = free_port();
        let world = 2;

        let results: Vec<(Vec<f32>, Vec<f32>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..world)
                .map(|rank| {
                    s.spawn(move || {
                        let sync = TcpSync::connect(&env_for(rank, world, port)).unwrap();
                        let dev = Device::Cpu;
                        let w = Var::from_tensor(&Tensor::zeros(2, DType::F32, &dev).unwrap()).unwrap();
                        let r = Var::from_tensor(&Tensor::zeros(1, DType::F32, &dev).unwrap()).unwrap();
                        let mut g = grads(&w, &r, (rank + 1) as f32);
                        let vars = vec![
                            ("layers.0.attention.pos_cis".to_string(), r.clone()),
                            ("layers.0.w".to_string(), w.clone()),
                        ];
                        sync.all_reduce_mean(&mut g, &vars).unwrap();
                        (
                            g.get(w.as_tensor()).unwrap().to_vec1::<f32>().unwrap(),
                            g.get(r.as_tensor()).unwrap().to_vec1::<f32>().unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, (w, r)) in results.iter().enumerate() {
            assert_eq!(w, &vec![1.5, 1.5]);
            assert_eq!(r, &vec![(rank + 1) as f32]);
        }
    }

    #[test]
    fn broadcast_params_copies_rank_zero_weights() {
        let port = free_port();
        let world = 3;

        let results: Vec<(Vec<f32>, Vec<f32>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..world)
                .map(|rank| {
                    s.spawn(move || {
                        let sync = TcpSync::connect(&env_for(rank, world, port)).unwrap();
                        let dev = Device::Cpu;
                        let fill = (rank + 1) as f32;
                        let w = Var::from_slice(&[fill, fill * 2.0, fill * 3.0], 3, &dev).unwrap();
                        let r = Var::from_slice(&[fill], 1, &dev).unwrap();
                        let vars = vec![
                            ("layers.0.attention.pos_cis".to_string(), r.clone()),
                            ("layers.0.w".to_string(), w.clone()),
                        ];
                        sync.broadcast_params(&vars).unwrap();
                        (
                            w.as_tensor().to_vec1::<f32>().unwrap(),
                            r.as_tensor().to_vec1::<f32>().unwrap(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, (w, r)) in results.iter().enumerate() {
            assert_eq!(w, &vec![1.0, 2.0, 3.0], "rank {rank}");
            assert_eq!(r, &vec![(rank + 1) as f32]);
        }
    }

    #[test]
    fn silent_peer_fails_instead_of_hanging() {
        let port = free_port();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let err = std::thread::scope(|s| {
            s.spawn(move || {
                // Joins the group, then never sends a gradient.
                let _sync = TcpSync::connect(&env_for(1, 2, port)).unwrap();
                let _ = done_rx.recv();
            });
            let sync = TcpSync::connect(&env_for(0, 2, port))
                .unwrap()
                .with_timeout(Duration::from_millis(200))
                .unwrap();
            let dev = Device::Cpu;
            let w = Var::from_tensor(&Tensor::zeros(2, DType::F32, &dev).unwrap()).unwrap();
            let r = Var::from_tensor(&Tensor::zeros(1, DType::F32, &dev).unwrap()).unwrap();
            let mut g = grads(&w, &r, 1.0);
            let result = sync.all_reduce_mean(&mut g, &[("w".to_string(), w.clone())]);
            done_tx.send(()).unwrap();
            result.unwrap_err()
        });
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
