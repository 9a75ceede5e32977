use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TestArgs {
    secs: u64,
    worker_threads: Option<usize>,
    start_paused: bool,
}

impl Default for TestArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            worker_threads: None,
            start_paused: false,
        }
    }
}

impl TestArgs {
    /// Accepts either a bare literal (`30`) or named arguments:
    /// `secs = 30, flavor = "multi_thread", worker_threads = 4, start_paused`.
    fn parse(attr: TokenStream, allow_runtime: bool) -> syn::Result<Self> {
        let mut args = TestArgs::default();
        if attr.is_empty() {
            return Ok(args);
        }
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            args.secs = positive_secs(&lit)?;
            return Ok(args);
        }

        let parser = syn::meta::parser(|meta| {
            if meta.path.is_ident("secs") {
                let lit: LitInt = meta.value()?.parse()?;
                args.secs = positive_secs(&lit)?;
                return Ok(());
            }
            if !allow_runtime {
                return Err(meta.error("only `secs` is supported on synchronous tests"));
            }
            if meta.path.is_ident("flavor") {
                let lit: LitStr = meta.value()?.parse()?;
                match lit.value().as_str() {
                    "current_thread" => args.worker_threads = None,
                    "multi_thread" => {
                        args.worker_threads = Some(args.worker_threads.unwrap_or(2));
                    }
                    other => {
                        return Err(syn::Error::new_spanned(
                            &lit,
                            format!("unknown runtime flavor `{other}`"),
                        ))
                    }
                }
                Ok(())
            } else if meta.path.is_ident("worker_threads") {
                let lit: LitInt = meta.value()?.parse()?;
                args.worker_threads = Some(lit.base10_parse()?);
                Ok(())
            } else if meta.path.is_ident("start_paused") {
                args.start_paused = true;
                Ok(())
            } else {
                Err(meta.error("unsupported test-timeout argument"))
            }
        });
        syn::parse::Parser::parse(parser, attr)?;

        if args.start_paused && args.worker_threads.is_some() {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "start_paused requires the current_thread flavor",
            ));
        }
        Ok(args)
    }

    fn runtime_builder(&self) -> TokenStream2 {
        let mut builder = match self.worker_threads {
            Some(workers) => quote! {
                tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(#workers)
                    .enable_all()
            },
            None => quote! {
                tokio::runtime::Builder::new_current_thread().enable_all()
            },
        };
        if self.start_paused {
            builder = quote! { #builder.start_paused(true) };
        }
        builder
    }
}

fn positive_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Async test on a dedicated tokio runtime, failed if it outlives its timeout.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TestArgs::parse(attr, true) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

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
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = args.secs;
    let builder = args.runtime_builder();

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, async move #block)
                            .await
                            .expect("test timed out");
                    });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

/// Synchronous test run on its own thread, failed if it outlives its timeout.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TestArgs::parse(attr, false) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = args.secs;

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #block ));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
