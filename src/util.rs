use anyhow::anyhow;
use std::any::Any;

/// Turn the payload of a caught panic into an error.
///
/// Panics raised with `panic!("...")` carry a `&str` or a `String`; anything
/// else is reported without a message.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("panicked: {message}")
    } else {
        anyhow!("panicked without a message")
    }
}
