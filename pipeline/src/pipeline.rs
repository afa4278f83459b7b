//! The composed pipeline: one policy of each kind, owned by value.

use crate::link::{Link, LinkStats};
use crate::message::MessageCodec;
use crate::service::Service;
use crate::transport::Transport;
use protocol::endpoint::EndpointId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long the receive loop sleeps when a poll produced no work.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// A handle that can stop a running pipeline from another thread.
#[derive(Clone)]
pub struct PipelineControl {
    running: Arc<AtomicBool>,
}

impl PipelineControl {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// The static composition `Link ∘ Transport ∘ Message ∘ Service`.
///
/// Send path: `Message::encode -> Transport::wrap -> Link::write`.
/// Receive path: `Link::read -> Transport::unwrap -> Message::dispatch ->
/// Service::handle -> handler`.
pub struct Pipeline<L, T, M, S> {
    link: L,
    transport: T,
    message: M,
    service: S,
    running: Arc<AtomicBool>,
}

impl<L, T, M, S> Pipeline<L, T, M, S>
where
    L: Link,
    T: Transport,
    M: MessageCodec,
    S: Service<M::Item>,
{
    pub fn new(link: L, transport: T, message: M, service: S) -> Pipeline<L, T, M, S> {
        Pipeline {
            link,
            transport,
            message,
            service,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn message_mut(&mut self) -> &mut M {
        &mut self.message
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    /// A control handle for stopping `run` / `run_for` from outside.
    pub fn control(&self) -> PipelineControl {
        PipelineControl {
            running: self.running.clone(),
        }
    }

    /// Encodes and sends one application value to `dst`.
    pub fn send(&mut self, dst: &EndpointId, value: &M::Item) -> bool {
        let Some(encoded) = self.message.encode(value) else {
            warn!("message encoding failed - nothing sent");
            return false;
        };
        self.send_buffer(dst, &encoded)
    }

    /// Sends pre-encoded bytes through the transport and link only.
    pub fn send_buffer(&mut self, dst: &EndpointId, data: &[u8]) -> bool {
        let wrapped = match self.transport.wrap(data) {
            Ok(wrapped) => wrapped,
            Err(error) => {
                warn!("transport wrap failed: {}", error);
                return false;
            }
        };
        self.link.write(dst.node_id, &wrapped)
    }

    /// Sends values until the first failure, returning how many went out.
    pub fn send_batch(&mut self, dst: &EndpointId, values: &[M::Item]) -> usize {
        let mut sent = 0;
        for value in values {
            if !self.send(dst, value) {
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Pulls one packet through the receive path. Returns `false` when the
    /// link had nothing pending or the packet was dropped on the way up.
    pub fn process_one(&mut self, handler: &mut dyn FnMut(M::Item)) -> bool {
        let Some(packet) = self.link.read() else {
            return false;
        };

        let payload = match self.transport.unwrap(&packet) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("dropping packet: transport unwrap failed ({})", error);
                return false;
            }
        };

        let service = &mut self.service;
        self.message.dispatch(&payload, &mut |msg| {
            if let Err(error) = service.handle(msg, handler) {
                debug!("service failed to handle message: {}", error);
            }
        });
        true
    }

    /// Runs the receive loop until [`PipelineControl::stop`] is called,
    /// yielding briefly whenever a poll produces no work.
    pub fn run(&mut self, handler: &mut dyn FnMut(M::Item)) {
        self.running.store(true, Ordering::Release);
        trace!("pipeline loop starting");
        while self.running.load(Ordering::Acquire) {
            if !self.process_one(handler) {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
        trace!("pipeline loop stopped");
    }

    /// Like [`Pipeline::run`], additionally returning once `timeout` of
    /// wall-clock time has elapsed.
    pub fn run_for(&mut self, handler: &mut dyn FnMut(M::Item), timeout: Duration) {
        let deadline = Instant::now() + timeout;
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) && Instant::now() < deadline {
            if !self.process_one(handler) {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn mtu(&self) -> usize {
        self.link.mtu()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link.stats()
    }

    /// Stops the loop and releases the link.
    pub fn close(&mut self) {
        self.stop();
        self.link.close();
    }
}
