//! Callback seam between pipeline stages.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Receives items pushed by an upstream stage.
///
/// Returning an error reports a failed delivery. Dispatchers log the failure
/// and keep going with the next item or member; the error never reaches the
/// producer.
pub trait Listener<T>: Send + Sync {
    /// Consume one item.
    fn receive(&self, item: T) -> anyhow::Result<()>;
}

impl<T, F> Listener<T> for F
where
    F: Fn(T) -> anyhow::Result<()> + Send + Sync,
{
    fn receive(&self, item: T) -> anyhow::Result<()> {
        self(item)
    }
}

/// How one guarded delivery went.
#[derive(Debug)]
pub(crate) enum Delivery {
    Delivered,
    Failed(String),
    Panicked(String),
}

/// Hand `item` to `listener`, turning errors and panics into a [`Delivery`].
pub(crate) fn deliver<T, L>(listener: &L, item: T) -> Delivery
where
    L: Listener<T> + ?Sized,
{
    guarded(|| listener.receive(item))
}

/// Run one downstream callback, turning errors and panics into a [`Delivery`].
pub(crate) fn guarded<F>(callback: F) -> Delivery
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Delivery::Delivered,
        Ok(Err(e)) => Delivery::Failed(format!("{e:#}")),
        Err(panic) => Delivery::Panicked(panic_message(panic.as_ref()).to_owned()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
