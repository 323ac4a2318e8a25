//! Backend selection
//!
//! Enable the desired backend via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (default, no GPU required)
//! - `wgpu`: WebGPU backend (cross-platform GPU support)
//! - `cuda`: Native CUDA backend (NVIDIA GPUs only)
//!
//! ```toml
//! [dependencies]
//! burn-depth2img = { version = "0.1", default-features = false, features = ["wgpu"] }
//! ```

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

#[cfg(feature = "cuda")]
pub use burn_cuda::{Cuda, CudaDevice};

/// Type alias for the default backend when using ndarray feature
#[cfg(feature = "ndarray")]
pub type DefaultBackend = NdArray;

/// Type alias for the default backend when using wgpu feature
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub type DefaultBackend = Wgpu;

/// Type alias for the default backend when using cuda feature
#[cfg(all(feature = "cuda", not(any(feature = "ndarray", feature = "wgpu"))))]
pub type DefaultBackend = Cuda;

/// Get the default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "wgpu", not(feature = "ndarray")))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Get the default device for the enabled backend
#[cfg(all(feature = "cuda", not(any(feature = "ndarray", feature = "wgpu"))))]
pub fn default_device() -> CudaDevice {
    CudaDevice::default()
}

/// Names of the backends compiled into this build
pub fn enabled_backends() -> Vec<&'static str> {
    let mut backends = Vec::new();
    if cfg!(feature = "ndarray") {
        backends.push("ndarray");
    }
    if cfg!(feature = "wgpu") {
        backends.push("wgpu");
    }
    if cfg!(feature = "cuda") {
        backends.push("cuda");
    }
    backends
}
