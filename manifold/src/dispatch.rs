//! Routes operations to device handlers.
//!
//! This module holds the only call sites of user-supplied handler
//! code. It enforces capabilities, recovers panics, and tags every
//! failure with the device and operation so errors read the same no
//! matter which handler produced them. Nothing here holds a
//! registry or cache lock while a handler runs.

use futures::FutureExt;
use manifold_api::{
    handler::DeviceHandler,
    types::{
        device::{Device, Reading, WriteData},
        Error,
    },
    Result,
};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

/// Invokes the handler's read function for the device.
pub async fn read(
    device: &Arc<Device>,
    handler: &Arc<DeviceHandler>,
) -> Result<Vec<Reading>> {
    let Some(f) = &handler.read else {
        return Err(Error::Unsupported(format!(
            "device {} does not support reads",
            device.id()
        )));
    };

    match AssertUnwindSafe(f(device.clone())).catch_unwind().await {
        Ok(Ok(readings)) => Ok(readings),
        Ok(Err(e)) => Err(Error::Handler(format!(
            "read {}: {}",
            device.id(),
            e
        ))),
        Err(payload) => Err(Error::HandlerPanic(format!(
            "read {}: {}",
            device.id(),
            panic_message(payload)
        ))),
    }
}

/// Invokes the handler's write function for the device.
pub async fn write(
    device: &Arc<Device>,
    handler: &Arc<DeviceHandler>,
    data: WriteData,
) -> Result<()> {
    let Some(f) = &handler.write else {
        return Err(Error::Unsupported(format!(
            "device {} does not support writes",
            device.id()
        )));
    };

    match AssertUnwindSafe(f(device.clone(), data)).catch_unwind().await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Handler(format!(
            "write {}: {}",
            device.id(),
            e
        ))),
        Err(payload) => Err(Error::HandlerPanic(format!(
            "write {}: {}",
            device.id(),
            panic_message(payload)
        ))),
    }
}

// Renders a panic payload. Panics usually carry a `&str` or a
// `String`; anything else gets a placeholder.

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        String::from("unknown panic")
    }
}
