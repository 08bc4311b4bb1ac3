//! Proc macros for deploytest
//!
//! Provides the `#[deploytest::test]` attribute macro.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::meta::ParseNestedMeta;
use syn::{FnArg, GenericArgument, ItemFn, LitBool, LitStr, PathArguments, ReturnType, Type};

/// Attribute macro for deploytest integration tests.
///
/// Every parameter must be an `Arc<T>` where `T: deploytest::Managed`. The
/// macro attaches each `T` to the global registry, building it for the first
/// test that asks and handing the same object to every later one. Shared
/// objects are closed when the test binary exits.
///
/// # Example
///
/// ```ignore
/// use deploytest::{BuildProject, ClusterContext};
/// use std::sync::Arc;
///
/// #[deploytest::test(project = "zero-config", forward_output, build)]
/// async fn test_deploys(project: Arc<BuildProject>, ctx: Arc<ClusterContext>) {
///     project.run(["k8sApply"]).await.unwrap();
///     // assertions against ctx...
/// }
/// ```
///
/// # Arguments
///
/// - `project = "..."` - fixture project (required when there are parameters)
/// - `forward_output` - log the build tool's output
/// - `clean` - run the clean task when the suite starts
/// - `build` - run the build task when the suite starts
///
/// Flags accept an explicit value too, e.g. `forward_output = false`.
///
/// # What it does
///
/// 1. Build the suite configuration (with `DEPLOYTEST_*` overrides)
/// 2. Attach every parameter type (first use builds it)
/// 3. Run the body on the shared deploytest runtime, catching panics
/// 4. On failure: print each shared object's diagnostics
/// 5. Record PASS/FAIL, re-raise the failure
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TestArgs::default();
    let parser = syn::meta::parser(|meta| args.parse(meta));
    syn::parse_macro_input!(attr with parser);

    let input_fn = syn::parse_macro_input!(item as ItemFn);
    test_impl(&args, &input_fn)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Parsed `#[deploytest::test(...)]` arguments
#[derive(Default)]
struct TestArgs {
    project: Option<LitStr>,
    forward_output: bool,
    clean: bool,
    build: bool,
}

impl TestArgs {
    fn parse(&mut self, meta: ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("project") {
            self.project = Some(meta.value()?.parse()?);
        } else if meta.path.is_ident("forward_output") {
            self.forward_output = flag(&meta)?;
        } else if meta.path.is_ident("clean") {
            self.clean = flag(&meta)?;
        } else if meta.path.is_ident("build") {
            self.build = flag(&meta)?;
        } else {
            return Err(meta.error("unsupported deploytest::test argument"));
        }
        Ok(())
    }
}

/// A bare flag means true; `flag = bool` sets it explicitly
fn flag(meta: &ParseNestedMeta) -> syn::Result<bool> {
    if meta.input.peek(syn::Token![=]) {
        let value: LitBool = meta.value()?.parse()?;
        Ok(value.value)
    } else {
        Ok(true)
    }
}

/// One injected parameter
struct Param<'a> {
    pat: &'a syn::Pat,
    ty: &'a Type,
    managed: &'a Type,
}

/// Inner type of `Arc<T>` (also `std::sync::Arc<T>`)
fn arc_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let last = path.path.segments.last()?;
    if last.ident != "Arc" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &last.arguments else {
        return None;
    };
    match args.args.first() {
        Some(GenericArgument::Type(inner)) if args.args.len() == 1 => Some(inner),
        _ => None,
    }
}

fn params(input_fn: &ItemFn) -> syn::Result<Vec<Param<'_>>> {
    input_fn
        .sig
        .inputs
        .iter()
        .map(|arg| match arg {
            FnArg::Typed(typed) => arc_inner(&typed.ty)
                .map(|managed| Param {
                    pat: &typed.pat,
                    ty: &typed.ty,
                    managed,
                })
                .ok_or_else(|| {
                    syn::Error::new_spanned(
                        &typed.ty,
                        "deploytest::test parameters must be Arc<T> where T: deploytest::Managed",
                    )
                }),
            FnArg::Receiver(receiver) => Err(syn::Error::new_spanned(
                receiver,
                "deploytest::test cannot be used on methods",
            )),
        })
        .collect()
}

/// Inner implementation that works with `proc_macro2` types for testability
fn test_impl(args: &TestArgs, input_fn: &ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if input_fn.sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(
            input_fn.sig.fn_token,
            "deploytest::test requires an async fn",
        ));
    }

    let fn_name = &input_fn.sig.ident;
    let fn_block = &input_fn.block;
    let fn_vis = &input_fn.vis;
    let fn_attrs = &input_fn.attrs;
    let fn_output = &input_fn.sig.output;

    let params = params(input_fn)?;

    if params.is_empty() {
        // Nothing to inject - just drive the body on the shared runtime
        return Ok(quote! {
            #(#fn_attrs)*
            #[test]
            #fn_vis fn #fn_name() #fn_output {
                ::deploytest::runtime().block_on(async move #fn_block)
            }
        });
    }

    let project = args
        .project
        .clone()
        .unwrap_or_else(|| LitStr::new("", Span::call_site()));
    let forward_output = args.forward_output;
    let clean = args.clean;
    let build = args.build;

    let shared: Vec<_> = (0..params.len())
        .map(|i| format_ident!("__deploytest_shared_{}", i))
        .collect();

    let attaches = params.iter().zip(&shared).map(|(param, shared)| {
        let managed = param.managed;
        let pat = param.pat;
        let ty = param.ty;
        quote! {
            let #shared: ::std::sync::Arc<#managed> = ::deploytest::Registry::global()
                .attach::<#managed>(&__deploytest_config)
                .await
                .unwrap_or_else(|e| panic!(
                    "[deploytest] Failed to start suite for {}: {}",
                    stringify!(#managed),
                    e
                ));
            let #pat: #ty = ::std::sync::Arc::clone(&#shared);
        }
    });

    let diagnostics = params.iter().zip(&shared).map(|(param, shared)| {
        let managed = param.managed;
        quote! {
            if let Some(diag) = <#managed as ::deploytest::Managed>::diagnostics(&#shared) {
                eprintln!("[deploytest] {} diagnostics:\n{}", stringify!(#managed), diag);
            }
        }
    });

    let test_execution = match fn_output {
        ReturnType::Type(_, ret_ty) => {
            // Result-returning body - an Err fails the test like a panic
            quote! {
                let __deploytest_result: #ret_ty = async #fn_block.await;
                if let Err(e) = __deploytest_result {
                    panic!("test returned error: {:?}", e);
                }
            }
        }
        ReturnType::Default => quote! {
            async #fn_block.await;
        },
    };

    Ok(quote! {
        #(#fn_attrs)*
        #[test]
        #fn_vis fn #fn_name() {
            ::deploytest::runtime().block_on(async move {
                use std::panic::AssertUnwindSafe;
                use ::deploytest::__private::futures::FutureExt;

                ::deploytest::telemetry::init_logging();
                ::deploytest::inject::shutdown_at_exit();

                let __deploytest_config = ::deploytest::ProjectConfig::new(#project)
                    .forward_output(#forward_output)
                    .clean(#clean)
                    .build(#build)
                    .with_env_overrides();

                #(#attaches)*

                // Run test and catch any panics
                let result = AssertUnwindSafe(async {
                    #test_execution
                })
                .catch_unwind()
                .await;

                if result.is_err() {
                    #(#diagnostics)*
                }

                let outcome = if result.is_ok() {
                    ::deploytest::report::Outcome::Pass
                } else {
                    ::deploytest::report::Outcome::Fail
                };
                ::deploytest::report::record(concat!(module_path!(), "::", stringify!(#fn_name)), outcome);

                if let Err(panic_info) = result {
                    // Re-panic to fail the test
                    std::panic::resume_unwind(panic_info);
                }
            })
        }
    })
}
