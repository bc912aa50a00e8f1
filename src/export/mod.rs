//! Audio export

#[cfg(feature = "export-wav")]
mod wav;

#[cfg(feature = "export-wav")]
pub use wav::{render_wav, WavConfig};
