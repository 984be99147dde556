use mf_core::buffers::RenderBuffers;
use mf_core::error::RenderFailure;
use mf_core::scene::SceneDescriptor;

/// Boundary to a 3D renderer.
///
/// One call renders one descriptor in isolation and returns either complete
/// buffers or a failure signal, never partial buffers. Implementations must be
/// safe to call from several worker threads at once.
pub trait SceneRenderer: Send + Sync {
    fn render(&self, scene: &SceneDescriptor) -> Result<RenderBuffers, RenderFailure>;

    /// Renderer name for logs
    fn name(&self) -> &str;
}

impl<R: SceneRenderer + ?Sized> SceneRenderer for Box<R> {
    fn render(&self, scene: &SceneDescriptor) -> Result<RenderBuffers, RenderFailure> {
        (**self).render(scene)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
