extern crate proc_macro;

macro_rules! bail {
    ($item:expr, $fmt:literal $($tts:tt)*) => {
        return Err(Error::new_spanned(
            &$item,
            format!(concat!("incmemo: ", $fmt) $($tts)*)
        ))
    }
}

mod memoize;

use proc_macro::TokenStream;
use quote::quote;
use syn::{Error, Result, parse_quote};

/// Memoize a function across runs.
///
/// The arguments must be `Serialize` and form the lookup key. The return
/// value must be `Serialize + DeserializeOwned`. Results are stored under the
/// function's path (`module::function`) unless a name is given:
///
/// ```ignore
/// #[memoize(name = "reports::render")]
/// fn render(title: String, rows: Vec<(String, f64)>) -> String {
///     let scale: f64 = incmemo::global("scale").unwrap_or(1.0);
///     rows.iter()
///         .map(|(label, value)| format!("{label}: {}\n", value * scale))
///         .fold(format!("# {title}\n"), |acc, line| acc + &line)
/// }
/// ```
///
/// Editing the function's body invalidates its stored results, and so does
/// editing any memoized function it calls.
#[proc_macro_attribute]
pub fn memoize(meta: TokenStream, stream: TokenStream) -> TokenStream {
    let meta = syn::parse_macro_input!(meta as memoize::Meta);
    let func = syn::parse_macro_input!(stream as syn::ItemFn);
    memoize::expand(meta, func)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}
