use std::sync::Arc;

use async_trait::async_trait;

use crate::coalescer::{EnsureHandle, RequestCoalescer};

/// The remote "make sure this connection is up" call.
///
/// Its arguments and failure shape belong to the implementor; the coalescing
/// layers only need it to settle once per call.
#[async_trait]
pub trait ConnectionEnsurer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn ensure_connection(&self, conn_name: &str) -> Result<(), Self::Error>;
}

/// Routes every ensure for a connection name through a shared coalescer, so a
/// UI-driven reconnect and an automatic check collapse into one remote call.
pub struct CoalescingEnsurer<C: ConnectionEnsurer> {
    ensurer: Arc<C>,
    coalescer: RequestCoalescer<(), C::Error>,
}

impl<C: ConnectionEnsurer> Clone for CoalescingEnsurer<C> {
    fn clone(&self) -> Self {
        Self {
            ensurer: Arc::clone(&self.ensurer),
            coalescer: self.coalescer.clone(),
        }
    }
}

impl<C> CoalescingEnsurer<C>
where
    C: ConnectionEnsurer + 'static,
{
    pub fn new(ensurer: Arc<C>) -> Self {
        Self::with_coalescer(ensurer, RequestCoalescer::new())
    }

    pub fn with_coalescer(ensurer: Arc<C>, coalescer: RequestCoalescer<(), C::Error>) -> Self {
        Self { ensurer, coalescer }
    }

    pub fn ensure(&self, conn_name: &str) -> EnsureHandle<(), C::Error> {
        let ensurer = Arc::clone(&self.ensurer);
        let name = conn_name.to_string();
        self.coalescer.ensure(conn_name, move || async move {
            ensurer.ensure_connection(&name).await
        })
    }

    pub fn ensurer(&self) -> &Arc<C> {
        &self.ensurer
    }

    pub fn coalescer(&self) -> &RequestCoalescer<(), C::Error> {
        &self.coalescer
    }
}
