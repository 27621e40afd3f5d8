//! `#[tokio_timeout_test]`: async tests on a current-thread runtime with a
//! hard wall-clock limit.
//!
//! ```ignore
//! #[tokio_timeout_test]            // 60 s limit
//! #[tokio_timeout_test(5)]         // 5 s limit
//! #[tokio_timeout_test(5, paused)] // 5 s limit, clock starts paused
//! ```
//!
//! With `paused` the runtime auto-advances time whenever it is idle, so
//! interval- and backoff-driven code runs instantly. The limit still applies
//! in real time. Paused mode needs tokio's `test-util` feature in the
//! calling crate.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestArgs {
    timeout_secs: u64,
    paused: bool,
}

impl Parse for TestArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = TestArgs {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        while !input.is_empty() {
            if input.peek(LitInt) {
                let lit: LitInt = input.parse()?;
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new(
                        lit.span(),
                        "timeout must be greater than zero",
                    ));
                }
                args.timeout_secs = secs;
            } else {
                let ident: Ident = input.parse()?;
                if ident != "paused" {
                    return Err(syn::Error::new(
                        ident.span(),
                        "expected a timeout in seconds or `paused`",
                    ));
                }
                args.paused = true;
            }
            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }
        Ok(args)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TestArgs {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as TestArgs);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let clock = if paused {
        quote! { builder.start_paused(true); }
    } else {
        quote! {}
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#timeout_secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut builder = tokio::runtime::Builder::new_current_thread();
                    builder.enable_all();
                    #clock
                    let runtime = builder.build().expect("failed to build Tokio runtime");
                    runtime.block_on(async move #block);
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(limit) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s wall-clock limit", #timeout_secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// `#[test]` and `#[tokio::test]` are replaced by the generated `#[test]`.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
