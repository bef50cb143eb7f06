//! Watchdog attributes for tests that talk to channels and ports: a hung
//! `recv` fails the test instead of wedging the whole suite.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test;
//! `#[test_timeout::tokio_timeout_test]` builds a current-thread Tokio
//! runtime and races the async body against the deadline. Both take an
//! optional timeout in seconds: `#[test_timeout::timeout(5)]`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn parse_timeout_secs(attr: TokenStream) -> u64 {
    if attr.is_empty() {
        return DEFAULT_TIMEOUT_SECS;
    }
    let lit = syn::parse::<LitInt>(attr).expect("timeout must be an integer literal in seconds");
    let secs: u64 = lit.base10_parse().expect("invalid timeout literal");
    assert!(secs > 0, "timeout must be greater than zero");
    secs
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || path
            .segments
            .last()
            .map(|segment| segment.ident == "test")
            .unwrap_or(false)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = parse_timeout_secs(attr);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout is for synchronous tests; use tokio_timeout_test for async ones",
        )
        .to_compile_error()
        .into();
    }

    let kept: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept)*
        #vis #sig {
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            let worker = std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block));
                let _ = done_tx.send(outcome);
            });
            match done_rx.recv_timeout(std::time::Duration::from_secs(#secs)) {
                Ok(Ok(())) => {
                    let _ = worker.join();
                }
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(_) => panic!("test timed out after {}s", #secs),
            }
        }
    })
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let secs = parse_timeout_secs(attr);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(&sig.ident, "tokio_timeout_test requires an async function")
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    let kept: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept)*
        #vis #sig {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build test runtime");
            runtime.block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_secs(#secs),
                    async move #block,
                )
                .await
                .unwrap_or_else(|_| panic!("test timed out after {}s", #secs));
            });
        }
    })
}
