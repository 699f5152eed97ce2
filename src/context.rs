use std::{cell::RefCell, future::Future, net::SocketAddr};

use anyhow::Result;
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    pub(crate) static REQ_CONTEXT: RefCell<ReqContext>;
}

/// Request context, embedding per-connection information in tokio tasks.
pub(crate) struct ReqContext {
    /// Local IP & port.
    pub(crate) local: SocketAddr,
    /// Peer IP & port.
    pub(crate) peer: SocketAddr,
    /// Destination requested by the client, in the <host>:<port> form. None
    /// until the request head was parsed.
    pub(crate) target: Option<String>,
}

impl ReqContext {
    /// Initialize a new request context given local & peer information.
    pub(crate) fn from(local: SocketAddr, peer: SocketAddr) -> RefCell<Self> {
        RefCell::new(Self {
            local,
            peer,
            target: None,
        })
    }

    /// Set the context target.
    fn set_target(&mut self, target: String) {
        self.target = Some(target)
    }
}

/// Run a future with a request context.
pub(crate) fn with_req_context<F: Future>(
    context: RefCell<ReqContext>,
    f: F,
) -> TaskLocalFuture<RefCell<ReqContext>, F> {
    REQ_CONTEXT.scope(context, f)
}

/// Set the current context target. Can fail if no context is defined.
pub(crate) fn set_target(target: &str) -> Result<()> {
    REQ_CONTEXT.try_with(|context| context.borrow_mut().set_target(target.to_string()))?;
    Ok(())
}
