//! View hosts
//!
//! A view host owns the surface an engine renders into. The runner creates
//! one per run and destroys it when the run ends.

use crate::config::ViewConfig;
use async_trait::async_trait;
use serde::Serialize;
use sky_harness_common::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Description of a render surface, handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Surface {
    pub id: Uuid,
    pub width: u32,
    pub height: u32,
    pub device_pixel_ratio: f32,
}

impl Surface {
    /// `WIDTHxHEIGHT`, as passed to engine processes
    pub fn size_label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// A live render surface
#[async_trait]
pub trait ViewHost: Send {
    fn surface(&self) -> &Surface;

    /// Release the surface
    async fn destroy(self: Box<Self>) -> Result<()>;
}

/// Creates one view host per run
#[async_trait]
pub trait ViewFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn ViewHost>>;
}

/// Factory for offscreen surfaces
pub struct OffscreenViewFactory {
    config: ViewConfig,
    live: Arc<AtomicUsize>,
}

impl OffscreenViewFactory {
    pub fn new(config: ViewConfig) -> Self {
        Self {
            config,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of surfaces created and not yet destroyed
    pub fn live_surfaces(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ViewFactory for OffscreenViewFactory {
    async fn create(&self) -> Result<Box<dyn ViewHost>> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(Error::View(format!(
                "cannot create a {}x{} surface",
                self.config.width, self.config.height
            )));
        }
        let ratio = self.config.device_pixel_ratio;
        if ratio.is_nan() || ratio <= 0.0 {
            return Err(Error::View(format!(
                "invalid device pixel ratio {}",
                ratio
            )));
        }

        let surface = Surface {
            id: Uuid::new_v4(),
            width: self.config.width,
            height: self.config.height,
            device_pixel_ratio: self.config.device_pixel_ratio,
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!("Created offscreen surface {} ({})", surface.id, surface.size_label());

        Ok(Box::new(OffscreenView {
            surface,
            live: self.live.clone(),
        }))
    }
}

/// Offscreen render surface
pub struct OffscreenView {
    surface: Surface,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl ViewHost for OffscreenView {
    fn surface(&self) -> &Surface {
        &self.surface
    }

    async fn destroy(self: Box<Self>) -> Result<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!("Destroyed offscreen surface {}", self.surface.id);
        Ok(())
    }
}
