//! In-memory engine and view collaborators.
//!
//! Used by the runner's tests and by integration tests that drive the socket
//! service without launching a real engine.

use crate::engine::{EngineConnection, EngineHost, RunContext};
use crate::view::{Surface, ViewFactory, ViewHost};
use async_trait::async_trait;
use parking_lot::Mutex;
use sky_harness_common::{Error, InputEvent, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Something the fake engine was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Connect { surface: Uuid },
    Load { path: String, package_root: String },
    Input(InputEvent),
    Close,
}

#[derive(Default)]
struct EngineState {
    calls: Mutex<Vec<EngineCall>>,
    contexts: Mutex<Vec<RunContext>>,
    live: AtomicUsize,
    fail_connect: AtomicBool,
    fail_load: AtomicBool,
    fail_forwarding: AtomicBool,
    fail_close: AtomicBool,
}

/// Engine host that records every call
#[derive(Clone, Default)]
pub struct FakeEngineHost {
    state: Arc<EngineState>,
}

impl FakeEngineHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state.calls.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EngineCall::Connect { .. }))
            .count()
    }

    /// Connections not yet closed
    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn latest_context(&self) -> Option<RunContext> {
        self.state.contexts.lock().last().cloned()
    }

    /// Simulate the most recent engine going away
    pub fn crash_latest(&self, reason: &str) -> bool {
        self.latest_context()
            .map(|ctx| ctx.engine_lost(reason))
            .unwrap_or(false)
    }

    pub fn fail_next_connect(&self) {
        self.state.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_load(&self) {
        self.state.fail_load.store(true, Ordering::SeqCst);
    }

    pub fn fail_forwarding(&self) {
        self.state.fail_forwarding.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.state.fail_close.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineHost for FakeEngineHost {
    async fn connect(&self, surface: &Surface, ctx: RunContext) -> Result<Box<dyn EngineConnection>> {
        if self.state.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(Error::Engine("engine refused to start".to_string()));
        }

        self.state
            .calls
            .lock()
            .push(EngineCall::Connect { surface: surface.id });
        self.state.contexts.lock().push(ctx);
        self.state.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeEngine {
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct FakeEngine {
    state: Arc<EngineState>,
    closed: bool,
}

#[async_trait]
impl EngineConnection for FakeEngine {
    async fn load(&mut self, path: &str, package_root: &str) -> Result<()> {
        if self.state.fail_load.swap(false, Ordering::SeqCst) {
            return Err(Error::Engine(format!("cannot load {}", path)));
        }
        self.state.calls.lock().push(EngineCall::Load {
            path: path.to_string(),
            package_root: package_root.to_string(),
        });
        Ok(())
    }

    async fn forward_input_event(&mut self, event: &InputEvent) -> Result<()> {
        if self.state.fail_forwarding.load(Ordering::SeqCst) {
            return Err(Error::Engine("engine pipe closed".to_string()));
        }
        self.state.calls.lock().push(EngineCall::Input(event.clone()));
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Engine("engine did not exit".to_string()));
        }
        if !self.closed {
            self.closed = true;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
            self.state.calls.lock().push(EngineCall::Close);
        }
        Ok(())
    }
}

/// View factory that counts live surfaces
#[derive(Clone, Default)]
pub struct FakeViewFactory {
    live: Arc<AtomicUsize>,
}

impl FakeViewFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_surfaces(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ViewFactory for FakeViewFactory {
    async fn create(&self) -> Result<Box<dyn ViewHost>> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeView {
            surface: Surface {
                id: Uuid::new_v4(),
                width: 800,
                height: 600,
                device_pixel_ratio: 1.0,
            },
            live: self.live.clone(),
        }))
    }
}

struct FakeView {
    surface: Surface,
    live: Arc<AtomicUsize>,
}

#[async_trait]
impl ViewHost for FakeView {
    fn surface(&self) -> &Surface {
        &self.surface
    }

    async fn destroy(self: Box<Self>) -> Result<()> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
