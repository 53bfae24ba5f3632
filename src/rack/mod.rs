/// Request pipelines ("racks").
///
/// A rack is an ordered list of stages that every request passes through on its
/// way to a backend. Two racks exist:
///
/// - the **cache rack** `[Cache]`, terminating at a persistence [`Adapter`];
/// - the **network rack** `[Serialize, Http, Parse]`, terminating at a
///   [`Transport`].
///
/// The driver loop in [`Rack::execute`] does the shared bookkeeping before each
/// stage runs (marking it as the last reached stage and refusing to continue a
/// cancelled execution), so no stage can be skipped and none has to remember
/// to call into a base implementation.
///
/// Every execution carries its own [`CancelSignal`]. [`Rack::cancel`] fires
/// the signal of the most recently dispatched execution still in flight and
/// nothing else; requests run with [`Rack::execute_tracked`] are only
/// cancelled through the [`CancelHandle`] their caller holds.
///
/// [`Adapter`]: crate::persistence::Adapter
/// [`Transport`]: crate::transport::Transport
pub mod cache;
pub mod network;

pub use cache::CacheStage;
pub use network::{Endpoint, HttpStage, ParseStage, SerializeStage};

use crate::error::{CacheError, CacheResult};
use crate::persistence::Adapter;
use crate::request::{Headers, Request, Response};
use crate::transport::{Transport, TransportResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::trace;

const NOT_STARTED: usize = usize::MAX;

/// Owner side of one execution's cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage side of one execution's cancellation.
#[derive(Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the execution is cancelled. Never resolves if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State carried from stage to stage for one execution.
#[derive(Debug)]
pub struct Exchange<'a> {
    pub request: &'a Request,
    /// Outgoing headers; starts as a copy of the request's headers.
    pub headers: Headers,
    /// Fully built URL, set by the Serialize stage.
    pub url: Option<String>,
    /// Encoded body, set by the Serialize stage.
    pub payload: Option<Vec<u8>>,
    /// Raw transport answer, set by the Http stage.
    pub raw: Option<TransportResponse>,
    /// Final response.
    pub response: Option<Response>,
    /// Fires when this execution is cancelled. Stages holding an abortable
    /// operation race it against the signal.
    pub cancel: CancelSignal,
}

impl<'a> Exchange<'a> {
    pub fn new(request: &'a Request, cancel: CancelSignal) -> Self {
        Self {
            request,
            headers: request.headers().clone(),
            url: None,
            payload: None,
            raw: None,
            response: None,
            cancel,
        }
    }
}

/// One step of a rack.
///
/// A stage receives the exchange from the previous stage and must return it,
/// possibly mutated, for the next one. Returning an error stops the rack and
/// the error reaches the caller unchanged.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle<'a>(&self, exchange: Exchange<'a>) -> CacheResult<Exchange<'a>>;
}

/// Removes a dispatched execution from the rack when it settles.
struct Dispatched<'r> {
    in_flight: &'r DashMap<u64, CancelHandle>,
    id: u64,
}

impl Drop for Dispatched<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

/// An ordered, non-empty list of stages.
pub struct Rack {
    name: &'static str,
    stages: Vec<Arc<dyn Stage>>,
    last_reached: AtomicUsize,
    next_dispatch: AtomicU64,
    latest_dispatch: AtomicU64,
    in_flight: DashMap<u64, CancelHandle>,
}

impl Rack {
    pub fn new(name: &'static str, stages: Vec<Arc<dyn Stage>>) -> CacheResult<Self> {
        if stages.is_empty() {
            return Err(CacheError::InvalidArgument(format!(
                "rack '{}' needs at least one stage",
                name
            )));
        }
        Ok(Self::with_stages(name, stages))
    }

    fn with_stages(name: &'static str, stages: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            name,
            stages,
            last_reached: AtomicUsize::new(NOT_STARTED),
            next_dispatch: AtomicU64::new(0),
            latest_dispatch: AtomicU64::new(0),
            in_flight: DashMap::new(),
        }
    }

    /// `[Cache]` over `adapter`.
    pub fn cache(adapter: Arc<dyn Adapter>) -> Self {
        Self::with_stages("cache", vec![Arc::new(CacheStage::new(adapter))])
    }

    /// `[Serialize, Http, Parse]` over `transport`.
    pub fn network(transport: Arc<dyn Transport>, endpoint: Endpoint) -> Self {
        Self::with_stages(
            "network",
            vec![
                Arc::new(SerializeStage::new(endpoint)),
                Arc::new(HttpStage::new(transport)),
                Arc::new(ParseStage),
            ],
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Name of the most recently entered stage.
    pub fn last_reached(&self) -> Option<&'static str> {
        let index = self.last_reached.load(Ordering::Acquire);
        self.stages.get(index).map(|s| s.name())
    }

    /// Run `request` through every stage as the rack's latest dispatch.
    ///
    /// Fails `AlreadyInFlight` if the same request is already executing.
    pub async fn execute(&self, request: &Request) -> CacheResult<Response> {
        let handle = CancelHandle::new();
        let id = self.next_dispatch.fetch_add(1, Ordering::AcqRel) + 1;
        self.in_flight.insert(id, handle.clone());
        let _dispatched = Dispatched {
            in_flight: &self.in_flight,
            id,
        };
        self.latest_dispatch.fetch_max(id, Ordering::AcqRel);
        self.run(request, handle.signal()).await
    }

    /// Run `request` under a caller-held `cancel` handle. [`Rack::cancel`]
    /// does not reach it.
    pub async fn execute_tracked(
        &self,
        request: &Request,
        cancel: &CancelHandle,
    ) -> CacheResult<Response> {
        self.run(request, cancel.signal()).await
    }

    async fn run(&self, request: &Request, signal: CancelSignal) -> CacheResult<Response> {
        let _in_flight = request.begin()?;

        let mut exchange = Exchange::new(request, signal);
        for (index, stage) in self.stages.iter().enumerate() {
            if exchange.cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            self.last_reached.store(index, Ordering::Release);
            trace!(
                rack = self.name,
                stage = stage.name(),
                method = %request.method(),
                collection = request.collection(),
                "entering stage"
            );
            exchange = stage.handle(exchange).await?;
        }

        exchange.response.ok_or_else(|| {
            CacheError::InvalidArgument(format!("rack '{}' produced no response", self.name))
        })
    }

    /// Cancel the most recently dispatched execution if it is still in
    /// flight. Returns whether there was one.
    ///
    /// The stage it is in aborts its operation; an execution between stages
    /// stops before entering the next one.
    pub fn cancel(&self) -> bool {
        let id = self.latest_dispatch.load(Ordering::Acquire);
        match self.in_flight.get(&id) {
            Some(handle) => {
                trace!(rack = self.name, dispatch = id, last_reached = ?self.last_reached(), "cancelling");
                handle.cancel();
                true
            }
            None => false,
        }
    }
}
