#[allow(clippy::module_inception)]
pub(crate) mod tcp;
pub(crate) use tcp::*;

pub(crate) mod forward;
pub(crate) mod outbound;
pub(crate) mod tunnel;
