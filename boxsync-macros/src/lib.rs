use proc_macro::TokenStream;

mod progress;

/// Attaches a progress indicator to an instrumented async function.
///
/// The function's `#[instrument]` span gains a `progress = true` field, which
/// the terminal telemetry layer renders as a spinner showing `message` while
/// the span is open and `finished` once it closes.
///
/// ```ignore
/// #[progress(message = "Connecting", finished = "Connected".to_string())]
/// #[instrument(skip(self))]
/// async fn connect(&self) -> Result<(), Error> { /* ... */ }
/// ```
#[proc_macro_attribute]
pub fn progress(attr: TokenStream, item: TokenStream) -> TokenStream {
    progress::expand(attr, item)
}
