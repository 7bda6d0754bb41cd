//! NCCL gradient all-reduce for CUDA ranks.
//!
//! The TCP process group still does the rendezvous: rank 0 creates the NCCL
//! unique id and sends it to every peer, and the initial parameter broadcast
//! goes through it once. Gradients move device-to-device over NCCL.

use std::os::raw::c_char;
use std::sync::Arc;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::cuda_backend::cudarc::nccl::safe::{Comm, Id, ReduceOp};
use candle_core::cuda_backend::WrapErr;
use candle_core::{CpuStorage, CudaStorage, CustomOp1, DType, Device, Layout, Shape, Tensor, Var};

use crate::distributed::{DistEnv, GradSync, TcpSync};

const NCCL_ID_LEN: usize = 128;

/// Wraps the communicator so it can live inside a `Send` trainer. Each rank
/// owns one process and one device, and collectives run on that thread.
struct Communicator(Comm);

unsafe impl Send for Communicator {}
unsafe impl Sync for Communicator {}

struct AllReduceSum {
    comm: Arc<Communicator>,
}

impl CustomOp1 for AllReduceSum {
    fn name(&self) -> &'static str {
        "nccl-all-reduce-sum"
    }

    fn cpu_fwd(&self, _s: &CpuStorage, _l: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        candle_core::bail!("nccl all-reduce needs a cuda tensor")
    }

    fn cuda_fwd(&self, s: &CudaStorage, l: &Layout) -> candle_core::Result<(CudaStorage, Shape)> {
        let elem_count = l.shape().elem_count();
        let dev = s.device().clone();
        let src = s.as_cuda_slice::<f32>()?;
        let src = match l.contiguous_offsets() {
            Some((0, len)) if len == src.len() => src,
            _ => candle_core::bail!("all-reduce input has to be contiguous"),
        };
        let mut dst = unsafe { dev.alloc::<f32>(elem_count) }.w()?;
        self.comm
            .0
            .all_reduce(src, &mut dst, &ReduceOp::Sum)
            .map_err(candle_core::Error::debug)?;
        Ok((CudaStorage::wrap_cuda_slice(dst, dev), l.shape().clone()))
    }
}

pub struct NcclSync {
    rank: usize,
    world_size: usize,
    comm: Arc<Communicator>,
    rendezvous: TcpSync,
}

impl NcclSync {
    pub fn connect(env: &DistEnv, device: &Device) -> Result<Self> {
        let cuda = match device {
            Device::Cuda(d) => d.cuda_device(),
            other => anyhow::bail!("nccl needs a cuda device, got {other:?}"),
        };
        let rendezvous = TcpSync::connect(env)?;

        let local = if env.rank == 0 {
            let id = Id::new().map_err(|e| anyhow::anyhow!("nccl unique id: {e:?}"))?;
            id.internal().iter().map(|&c| c as u8).collect()
        } else {
            Vec::new()
        };
        let bytes = rendezvous.broadcast_bytes(&local)?;
        if bytes.len() != NCCL_ID_LEN {
            anyhow::bail!("nccl id of {} bytes, expected {NCCL_ID_LEN}", bytes.len());
        }
        let id = Id::uninit(std::array::from_fn(|i| bytes[i] as c_char));
        let comm = Comm::from_rank(cuda, env.rank, env.world_size, id)
            .map_err(|e| anyhow::anyhow!("nccl init on rank {}: {e:?}", env.rank))?;

        tracing::info!(rank = env.rank, world_size = env.world_size, "nccl communicator ready");
        Ok(Self {
            rank: env.rank,
            world_size: env.world_size,
            comm: Arc::new(Communicator(comm)),
            rendezvous,
        })
    }

    /// Also skip any variable whose name contains `name`.
    pub fn ignore(mut self, name: impl Into<String>) -> Self {
        self.rendezvous = self.rendezvous.ignore(name);
        self
    }
}

impl GradSync for NcclSync {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast_params(&self, vars: &[(String, Var)]) -> Result<()> {
        self.rendezvous.broadcast_params(vars)
    }

    fn all_reduce_mean(&self, grads: &mut GradStore, vars: &[(String, Var)]) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        let op = AllReduceSum { comm: self.comm.clone() };
        for var in self.rendezvous.synced(vars) {
            let local = match grads.get(var.as_tensor()) {
                Some(g) => g.to_dtype(DType::F32)?.contiguous()?,
                None => Tensor::zeros(var.shape(), DType::F32, var.device())?,
            };
            let mean = local
                .apply_op1_no_bwd(&op)?
                .affine(1.0 / self.world_size as f64, 0.0)?
                .to_dtype(var.dtype())?;
            grads.insert(var.as_tensor(), mean);
        }
        Ok(())
    }
}
