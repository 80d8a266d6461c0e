//! Renderer error types.
//!
//! Recoverable surface transience (out-of-date or suboptimal presentation,
//! resizes, minimized windows) never surfaces here; the swapchain
//! lifecycle absorbs it. These variants cover the failures the renderer
//! cannot recover from. Capacity violations (arena, push buffer, instance
//! region) are programmer errors and panic instead of returning an error.

use thiserror::Error;

/// Fatal renderer failure.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("failed to initialize renderer: {0}")]
    InitializationFailed(String),
    #[error("failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("failed to acquire swapchain image: {0}")]
    AcquireImageFailed(String),
    #[error("failed to submit command buffer: {0}")]
    SubmissionFailed(String),
    #[error("failed to present swapchain image: {0}")]
    PresentFailed(String),
    #[error("GPU device lost: {0}")]
    DeviceLost(String),
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = RenderError::DeviceLost("fence wait timed out".to_string());
        assert_eq!(err.to_string(), "GPU device lost: fence wait timed out");
    }
}
