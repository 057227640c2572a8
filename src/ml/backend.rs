// ============================================================
// Layer 5 — Backend selection
// ============================================================
// The whole pipeline is generic over B: AutodiffBackend. This
// module picks the concrete backend once, at start-up:
//
//   cpu   + any precision → Autodiff<NdArray<f32>>
//   wgpu  + Full          → Autodiff<Wgpu<f32>>
//   wgpu  + Half          → Autodiff<Wgpu<f16>>
//   wgpu  + BFloat        → Autodiff<Wgpu<bf16>>
//
// Closures cannot be generic over a backend, so the work to run is
// a BackendTask whose run::<B>() is instantiated per arm.

use burn::{
    backend::{
        ndarray::NdArrayDevice,
        wgpu::WgpuDevice,
        Autodiff, NdArray, Wgpu,
    },
    prelude::*,
    tensor::{backend::AutodiffBackend, bf16, f16},
};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::ml::precision::{Precision, PrecisionSupport};

pub type CpuBackend    = Autodiff<NdArray<f32>>;
pub type WgpuBackend   = Autodiff<Wgpu<f32>>;
pub type WgpuF16       = Autodiff<Wgpu<f16>>;
pub type WgpuBf16      = Autodiff<Wgpu<bf16>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Wgpu,
    Cpu,
}

pub trait BackendTask {
    type Output;

    fn run<B: AutodiffBackend>(self, device: B::Device, precision: Precision) -> Self::Output;
}

pub fn dispatch<T: BackendTask>(kind: DeviceKind, precision: Precision, task: T) -> T::Output {
    match (kind, precision) {
        (DeviceKind::Cpu, p) => {
            if p != Precision::Full {
                tracing::warn!("CPU backend has no {p} kernels; running in fp32");
            }
            task.run::<CpuBackend>(NdArrayDevice::Cpu, Precision::Full)
        }
        (DeviceKind::Wgpu, Precision::Full)   => task.run::<WgpuBackend>(WgpuDevice::default(), Precision::Full),
        (DeviceKind::Wgpu, Precision::Half)   => task.run::<WgpuF16>(WgpuDevice::default(), Precision::Half),
        (DeviceKind::Wgpu, Precision::BFloat) => task.run::<WgpuBf16>(WgpuDevice::default(), Precision::BFloat),
    }
}

/// True when a tiny matmul runs on `B` and yields the right answer.
pub fn backend_runs<B: Backend>(device: &B::Device) -> bool {
    catch_unwind(AssertUnwindSafe(|| {
        let x = Tensor::<B, 2>::ones([2, 2], device);
        let total: f32 = x.clone().matmul(x).sum().into_scalar().elem();
        total.is_finite() && (total - 8.0).abs() < 1e-2
    }))
    .unwrap_or(false)
}

/// Checks reduced-precision support on the selected device kind.
pub struct DeviceSupport {
    kind: DeviceKind,
}

impl DeviceSupport {
    pub fn new(kind: DeviceKind) -> Self {
        Self { kind }
    }
}

impl PrecisionSupport for DeviceSupport {
    fn supports(&self, precision: Precision) -> bool {
        match (self.kind, precision) {
            (_, Precision::Full) => true,
            (DeviceKind::Cpu, _) => false,
            (DeviceKind::Wgpu, Precision::Half)   => backend_runs::<Wgpu<f16>>(&WgpuDevice::default()),
            (DeviceKind::Wgpu, Precision::BFloat) => backend_runs::<Wgpu<bf16>>(&WgpuDevice::default()),
        }
    }
}
