//! `#[tokio_timeout_test]` / `#[tokio_timeout_test(N)]`: run an async test on
//! its own current-thread runtime, on a dedicated thread, failing it after `N`
//! seconds (default 30). A test tracing subscriber is installed first so
//! `tracing` output lands in the captured test log.
//!
//! Crates using the attribute need `tokio` and `tracing-subscriber` available.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

struct Deadline {
    secs: u64,
}

impl Parse for Deadline {
    fn parse(input: ParseStream<'_>) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                secs: DEFAULT_TIMEOUT_SECS,
            });
        }
        let lit: LitInt = input.parse()?;
        let secs: u64 = lit.base10_parse()?;
        if secs == 0 {
            return Err(syn::Error::new(lit.span(), "deadline must be at least one second"));
        }
        Ok(Self { secs })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let Deadline { secs } = parse_macro_input!(attr as Deadline);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new(Span::call_site(), "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_tokio_test(a)).collect();
    let name = sig.ident.to_string();

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            let worker = ::std::thread::Builder::new()
                .name(::std::string::String::from(#name))
                .spawn(move || {
                    let _ = ::tracing_subscriber::fmt()
                        .with_env_filter(
                            ::tracing_subscriber::EnvFilter::try_from_env("MESH_TEST_LOG")
                                .unwrap_or_else(|_| ::tracing_subscriber::EnvFilter::new("warn")),
                        )
                        .with_test_writer()
                        .try_init();
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let runtime = ::tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                            .expect("test runtime");
                        runtime.block_on(async move {
                            if ::tokio::time::timeout(deadline, async move #block).await.is_err() {
                                panic!("{} exceeded its {}s deadline", #name, #secs);
                            }
                        })
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("spawn test thread");
            match done_rx.recv_timeout(deadline + ::std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(_) => {
                    drop(worker);
                    panic!("{} hung past its {}s deadline", #name, #secs);
                }
            }
        }
    }
    .into()
}

fn is_tokio_test(attr: &Attribute) -> bool {
    let path = attr.path();
    path.segments.len() == 2 && path.segments[0].ident == "tokio" && path.segments[1].ident == "test"
}
