use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::SlapConfig;
use crate::dispatch::TokioDispatch;
use crate::link_controller::LinkController;
use crate::raw_link::memory_link::{LinkImpairment, MemoryLink};
use crate::slap_stream::SlapStream;
use crate::timer::{TimerService, TokioTimerService};

/// Two SLAP streams talking to each other over an in-memory link, fully wired with timer service,
///  dispatcher and link controllers. Useful for demos and end-to-end tests.
pub struct LoopbackPair {
    pub a: SlapStream,
    pub b: SlapStream,
    pub link_a: Arc<MemoryLink>,
    pub link_b: Arc<MemoryLink>,
    controller_a: LinkController,
    controller_b: LinkController,
    _dispatch: Arc<TokioDispatch>,
}

impl LoopbackPair {
    /// Creates and starts both ends. This must be called inside a tokio runtime.
    pub fn new(config_a: SlapConfig, config_b: SlapConfig, link_capacity: usize, impairment: LinkImpairment) -> anyhow::Result<LoopbackPair> {
        let runtime = Handle::try_current()?;
        let (link_a, link_b) = MemoryLink::pair_with_impairment(link_capacity, impairment);

        let timer_service: Arc<dyn TimerService> = Arc::new(TokioTimerService::new(runtime.clone()));
        let dispatch = Arc::new(TokioDispatch::new(runtime));

        let read_buffer_a = config_a.read_buffer_size;
        let read_buffer_b = config_b.read_buffer_size;
        let a = SlapStream::new(link_a.clone(), timer_service.clone(), config_a)?;
        let b = SlapStream::new(link_b.clone(), timer_service, config_b)?;

        let controller_a = LinkController::new(link_a.clone(), Arc::new(a.clone()), dispatch.clone(), read_buffer_a);
        let controller_b = LinkController::new(link_b.clone(), Arc::new(b.clone()), dispatch.clone(), read_buffer_b);
        controller_a.start()?;
        controller_b.start()?;

        debug!("loopback pair started");
        Ok(LoopbackPair {
            a,
            b,
            link_a,
            link_b,
            controller_a,
            controller_b,
            _dispatch: dispatch,
        })
    }

    /// Both ends with the same configuration and a perfect link
    pub fn symmetric(config: SlapConfig) -> anyhow::Result<LoopbackPair> {
        Self::new(config.clone(), config, 4096, LinkImpairment::none())
    }

    /// Closes both streams and waits for the link controllers to exit
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.a.close();
        self.b.close();

        for controller in [&self.controller_a, &self.controller_b] {
            if let Err(e) = controller.stop() {
                warn!("error stopping link controller: {}", e);
            }
        }
        self.controller_a.join().await;
        self.controller_b.join().await;
        debug!("loopback pair shut down");
        Ok(())
    }
}
