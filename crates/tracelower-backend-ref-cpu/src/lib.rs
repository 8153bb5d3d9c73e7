pub mod cpu;

pub use cpu::{CpuBackend, CpuTensor, TensorData};
