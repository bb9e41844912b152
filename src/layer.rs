//! Tower middleware that runs every request through a guarded entry.

use crate::api::EntryBuilder;
use crate::error::GuardError;
use crate::resource::{ResourceType, TrafficType};
use crate::slot_chain::SlotChain;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Names the resource a request is admitted against.
pub trait ResourceExtractor<Req>: Send + Sync {
    fn resource_name(&self, req: &Req) -> String;
}

impl<Req, F> ResourceExtractor<Req> for F
where
    F: Fn(&Req) -> String + Send + Sync,
{
    fn resource_name(&self, req: &Req) -> String {
        self(req)
    }
}

/// The same resource for every request.
#[derive(Debug, Clone)]
pub struct FixedResource(String);

impl<Req> ResourceExtractor<Req> for FixedResource {
    fn resource_name(&self, _req: &Req) -> String {
        self.0.clone()
    }
}

/// A layer that guards every request with an entry.
pub struct GuardLayer<X> {
    extractor: Arc<X>,
    resource_type: ResourceType,
    traffic_type: TrafficType,
    chain: Option<Arc<SlotChain>>,
}

impl<X> Clone for GuardLayer<X> {
    fn clone(&self) -> Self {
        Self {
            extractor: self.extractor.clone(),
            resource_type: self.resource_type,
            traffic_type: self.traffic_type,
            chain: self.chain.clone(),
        }
    }
}

impl<X> fmt::Debug for GuardLayer<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardLayer")
            .field("resource_type", &self.resource_type)
            .field("traffic_type", &self.traffic_type)
            .finish()
    }
}

impl GuardLayer<FixedResource> {
    /// Guard every request as `resource`, as inbound traffic.
    pub fn new(resource: impl Into<String>) -> Self {
        Self::with_extractor(FixedResource(resource.into()))
    }
}

impl<X> GuardLayer<X> {
    /// Derive the resource from each request.
    pub fn with_extractor(extractor: X) -> Self {
        Self {
            extractor: Arc::new(extractor),
            resource_type: ResourceType::Web,
            traffic_type: TrafficType::Inbound,
            chain: None,
        }
    }

    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    /// Admit through `chain` instead of the global one.
    pub fn slot_chain(mut self, chain: Arc<SlotChain>) -> Self {
        self.chain = Some(chain);
        self
    }
}

impl<S, X> Layer<S> for GuardLayer<X> {
    type Service = GuardService<S, X>;

    fn layer(&self, service: S) -> Self::Service {
        GuardService { inner: service, layer: self.clone() }
    }
}

/// Middleware service produced by [`GuardLayer`].
pub struct GuardService<S, X> {
    inner: S,
    layer: GuardLayer<X>,
}

impl<S: Clone, X> Clone for GuardService<S, X> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), layer: self.layer.clone() }
    }
}

impl<S: fmt::Debug, X> fmt::Debug for GuardService<S, X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardService").field("inner", &self.inner).field("layer", &self.layer).finish()
    }
}

impl<S, X, Req> Service<Req> for GuardService<S, X>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    S::Response: Send + 'static,
    X: ResourceExtractor<Req> + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let mut builder = EntryBuilder::new(self.layer.extractor.resource_name(&req))
            .with_resource_type(self.layer.resource_type)
            .with_traffic_type(self.layer.traffic_type);
        if let Some(chain) = &self.layer.chain {
            builder = builder.with_slot_chain(chain.clone());
        }
        let guard = match builder.build() {
            Ok(guard) => guard,
            Err(blocked) => {
                let rejected: Result<S::Response, Self::Error> = Err(GuardError::Blocked(blocked));
                return Box::pin(std::future::ready(rejected));
            }
        };
        // The readied service handles this request; a fresh clone waits for the next poll_ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let result = inner.call(req).await;
            if let Err(err) = &result {
                guard.trace_error(err.to_string());
            }
            guard.exit();
            result.map_err(GuardError::Inner)
        })
    }
}
