//! The QuickJS isolate adapter.
//!
//! One engine hosts one isolate (`rquickjs::Runtime`). Loaded code versions
//! are cached by version string; every execution evaluates the cached code
//! in a fresh `Context`, so no guest state survives from one invocation to
//! the next. Host bindings and the console bridge are installed on each
//! context's global object and funnel through the [`HostCallInvoker`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roma_common::{
    CodeSpec, ExecuteSpec, FunctionBindingIo, Payload, RpcWrapper, WireError, WireErrorKind,
    WorkerInit, BINDING_UNAVAILABLE_ERROR, LOG_FUNCTION_NAME,
};
use rquickjs::function::Args;
use rquickjs::prelude::Rest;
use rquickjs::promise::MaybePromise;
use rquickjs::{
    CatchResultExt, CaughtError, Coerced, Context, Ctx, Exception, Function, Object, Runtime,
    Value,
};

use crate::convert::{self, ERR_UNSUPPORTED_INPUT};
use crate::HostCallInvoker;

const MIB: usize = 1024 * 1024;
const WASM_PAGE: usize = 64 * 1024;

/// Engine resource and binding configuration, fixed for the engine's
/// lifetime.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Host binding names installed as stubs on every context.
    pub binding_names: Vec<String>,
    /// Heap size at which garbage collection starts, in MiB (0 = default).
    pub initial_heap_mb: u32,
    /// Hard heap cap in MiB (0 = uncapped).
    pub maximum_heap_mb: u32,
    /// Cap on loadable module byte-code, in 64 KiB pages (0 = uncapped).
    pub max_wasm_pages: u32,
}

impl From<WorkerInit> for EngineOptions {
    fn from(init: WorkerInit) -> Self {
        Self {
            binding_names: init.binding_names,
            initial_heap_mb: init.initial_heap_mb,
            maximum_heap_mb: init.maximum_heap_mb,
            max_wasm_pages: init.max_wasm_pages,
        }
    }
}

/// A successful execution: the stringified handler return value plus the
/// heap high-water mark observed for the call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// JSON-serialized handler return value.
    pub response: String,
    /// Engine heap high-water mark in bytes.
    pub peak_memory_bytes: u64,
}

#[derive(Default)]
struct CurrentIds {
    request_id: String,
    request_uuid: String,
}

struct CodeVersion {
    js: String,
    bytecode: Option<Vec<u8>>,
}

/// Hosts the isolate and the per-version code cache.
///
/// `runtime` is `None` only after a guest OOM whose isolate replacement
/// failed; from then on every call fails fast with a fatal error until the
/// parent replaces the whole worker.
pub struct JsEngine {
    runtime: Option<Runtime>,
    versions: HashMap<String, CodeVersion>,
    options: EngineOptions,
    invoker: Rc<dyn HostCallInvoker>,
    interrupt: Arc<AtomicBool>,
    current: Rc<RefCell<CurrentIds>>,
}

impl JsEngine {
    /// Create the isolate and apply the configured resource limits.
    pub fn new(
        options: EngineOptions,
        invoker: Rc<dyn HostCallInvoker>,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self, WireError> {
        let runtime = build_runtime(&options, &interrupt)?;
        Ok(Self {
            runtime: Some(runtime),
            versions: HashMap::new(),
            options,
            invoker,
            interrupt,
            current: Rc::new(RefCell::new(CurrentIds::default())),
        })
    }

    /// Compile and cache one code version.
    ///
    /// The source is evaluated once to surface compile errors and to verify
    /// that every name in `precompile_handlers` resolves to a function;
    /// nothing from that evaluation is kept.
    pub fn load(&mut self, spec: &CodeSpec) -> Result<(), WireError> {
        if let Some(bytecode) = &spec.bytecode {
            let cap = self.options.max_wasm_pages as usize * WASM_PAGE;
            if self.options.max_wasm_pages > 0 && bytecode.len() > cap {
                return Err(WireError::new(
                    WireErrorKind::Compile,
                    format!(
                        "module byte-code is {} bytes, over the {} page cap",
                        bytecode.len(),
                        self.options.max_wasm_pages
                    ),
                ));
            }
        }

        let version = CodeVersion {
            js: spec.js.clone(),
            bytecode: spec.bytecode.clone(),
        };

        let context = self.fresh_context()?;
        context.with(|ctx| -> Result<(), WireError> {
            self.install_globals(&ctx).map_err(internal)?;
            evaluate(&ctx, &version)?;
            for handler in &spec.precompile_handlers {
                if lookup_handler(&ctx, handler).is_none() {
                    return Err(WireError::new(
                        WireErrorKind::Compile,
                        format!("handler '{handler}' is not defined by version '{}'",
                            spec.version_string),
                    ));
                }
            }
            Ok(())
        })?;

        self.versions.insert(spec.version_string.clone(), version);
        Ok(())
    }

    /// Execute one handler of a previously loaded version.
    pub fn run(&mut self, spec: &ExecuteSpec) -> Result<ExecutionOutcome, WireError> {
        if !self.versions.contains_key(&spec.version_string) {
            return Err(WireError::new(
                WireErrorKind::UnknownVersion,
                format!("code version '{}' has not been loaded", spec.version_string),
            ));
        }

        {
            let mut current = self.current.borrow_mut();
            current.request_id = spec.request_id.clone();
            current.request_uuid = spec.request_uuid.clone();
        }

        let result = self.run_in_fresh_context(spec);

        *self.current.borrow_mut() = CurrentIds::default();

        match result {
            Ok(response) => Ok(ExecutionOutcome {
                response,
                peak_memory_bytes: self.peak_memory(),
            }),
            Err(err) => {
                if err.kind == WireErrorKind::OutOfMemory {
                    // The isolate is disposed and recreated; the code cache
                    // is kept and versions recompile on their next run. A
                    // failed rebuild wins over the OOM: the fatal error it
                    // carries makes the parent replace this worker.
                    self.rebuild()?;
                }
                Err(err)
            }
        }
    }

    fn run_in_fresh_context(&self, spec: &ExecuteSpec) -> Result<String, WireError> {
        let version = self
            .versions
            .get(&spec.version_string)
            .ok_or_else(|| internal("version disappeared from the cache"))?;

        let context = self.fresh_context()?;
        context.with(|ctx| -> Result<String, WireError> {
            self.install_globals(&ctx)
                .catch(&ctx)
                .map_err(|err| self.classify(err))?;
            evaluate(&ctx, version).map_err(|err| self.reclassify_runtime(err))?;

            let handler = lookup_handler(&ctx, &spec.handler_name).ok_or_else(|| {
                WireError::new(
                    WireErrorKind::Runtime,
                    format!("no handler registered for function {}", spec.handler_name),
                )
            })?;

            let mut args = Args::new(ctx.clone(), spec.inputs.len());
            for (index, input) in spec.inputs.iter().enumerate() {
                let value = ctx.json_parse(input.clone()).map_err(|_| {
                    WireError::new(
                        WireErrorKind::Runtime,
                        format!("failed to parse input argument {index} as JSON"),
                    )
                })?;
                args.push_arg(value).map_err(internal)?;
            }

            let outcome: Result<rquickjs::String, _> = handler
                .call_arg::<MaybePromise>(args)
                .and_then(|promise| promise.finish::<Value>())
                .and_then(|value| ctx.json_stringify(value))
                .catch(&ctx)
                .map_err(|err| self.classify(err))?
                .ok_or_else(|| {
                    WireError::new(
                        WireErrorKind::Runtime,
                        "the handler function did not return a value",
                    )
                });

            outcome?
                .to_string()
                .catch(&ctx)
                .map_err(|err| self.classify(err))
        })
    }

    fn fresh_context(&self) -> Result<Context, WireError> {
        let runtime = self.runtime.as_ref().ok_or_else(engine_lost)?;
        Context::full(runtime).map_err(internal)
    }

    /// Dispose and recreate the isolate after a guest OOM. The code cache
    /// is retained; the failed execution is not retried.
    ///
    /// The exhausted runtime is dropped before the replacement is built, so
    /// a failed rebuild leaves the engine without an isolate rather than on
    /// the exhausted one; the returned fatal error tells the parent to
    /// replace the worker.
    fn rebuild(&mut self) -> Result<(), WireError> {
        tracing::warn!("guest heap exhausted, recreating the isolate");
        self.runtime = None;
        match build_runtime(&self.options, &self.interrupt) {
            Ok(runtime) => {
                self.runtime = Some(runtime);
                Ok(())
            }
            Err(err) => {
                tracing::error!(message = %err.message, "could not recreate the isolate");
                Err(WireError::new(
                    WireErrorKind::Fatal,
                    format!("the isolate could not be recreated: {}", err.message),
                ))
            }
        }
    }

    fn peak_memory(&self) -> u64 {
        let Some(runtime) = &self.runtime else {
            return 0;
        };
        let usage = runtime.memory_usage();
        usage.memory_used_size.max(usage.malloc_size).max(0) as u64
    }

    /// Turn a caught guest error into the wire taxonomy. The interrupt flag
    /// wins over the error text: an expired deadline also surfaces as a
    /// generic "interrupted" exception.
    fn classify(&self, err: CaughtError<'_>) -> WireError {
        if self.interrupt.load(Ordering::SeqCst) {
            return WireError::new(
                WireErrorKind::DeadlineExceeded,
                "execution terminated: wall-clock deadline exceeded",
            );
        }
        if is_oom(&err) {
            return WireError::new(
                WireErrorKind::OutOfMemory,
                "execution terminated: engine heap limit reached",
            );
        }
        WireError::new(WireErrorKind::Runtime, describe_caught(err))
    }

    /// Like [`Self::classify`], but for errors raised while re-evaluating
    /// already-loaded source: compile diagnostics were surfaced at load
    /// time, so anything here is a runtime failure (or a deadline/heap
    /// termination that happened to land in top-level code).
    fn reclassify_runtime(&self, err: WireError) -> WireError {
        if self.interrupt.load(Ordering::SeqCst) {
            return WireError::new(
                WireErrorKind::DeadlineExceeded,
                "execution terminated: wall-clock deadline exceeded",
            );
        }
        if err.message.contains("out of memory") {
            return WireError::new(
                WireErrorKind::OutOfMemory,
                "execution terminated: engine heap limit reached",
            );
        }
        if err.kind == WireErrorKind::Compile {
            WireError::new(WireErrorKind::Runtime, err.message)
        } else {
            err
        }
    }

    /// Install binding stubs and the console bridge on the context's global
    /// object.
    fn install_globals(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        for name in &self.options.binding_names {
            if name == LOG_FUNCTION_NAME {
                // Reserved for the console bridge; never a host binding.
                continue;
            }
            let stub = self.binding_stub(ctx, name.clone())?;
            globals.set(name.as_str(), stub)?;
        }

        let console = Object::new(ctx.clone())?;
        console.set("log", self.console_fn(ctx, "LOG")?)?;
        console.set("warn", self.console_fn(ctx, "WARN")?)?;
        console.set("error", self.console_fn(ctx, "ERROR")?)?;
        globals.set("console", console)?;

        Ok(())
    }

    fn binding_stub<'js>(&self, ctx: &Ctx<'js>, name: String) -> rquickjs::Result<Function<'js>> {
        let invoker = Rc::clone(&self.invoker);
        let current = Rc::clone(&self.current);
        let stub_name = name.clone();

        let stub = coerce_fn_signature(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
            let args = args.into_inner();
            let Ok(input) = convert::args_to_payload(&args) else {
                return Err(ctx.throw_message(ERR_UNSUPPORTED_INPUT));
            };

            let mut wrapper = {
                let ids = current.borrow();
                RpcWrapper {
                    function_name: stub_name.clone(),
                    request_id: ids.request_id.clone(),
                    request_uuid: ids.request_uuid.clone(),
                    io: FunctionBindingIo {
                        input,
                        output: None,
                        errors: Vec::new(),
                    },
                }
            };

            if invoker.invoke(&mut wrapper).is_err() {
                return Err(ctx.throw_message(BINDING_UNAVAILABLE_ERROR));
            }
            if !wrapper.io.errors.is_empty() {
                return Err(ctx.throw_message(&wrapper.io.errors.join(" ")));
            }
            convert::payload_to_value(&ctx, wrapper.io.output.as_ref())
        });

        Function::new(ctx.clone(), stub)?.with_name(&name)
    }

    /// One RPC per emitted line; failures are swallowed so logging never
    /// turns into a guest error.
    fn console_fn<'js>(
        &self,
        ctx: &Ctx<'js>,
        severity: &'static str,
    ) -> rquickjs::Result<Function<'js>> {
        let invoker = Rc::clone(&self.invoker);
        let current = Rc::clone(&self.current);

        Function::new(ctx.clone(), move |parts: Rest<Coerced<String>>| {
            let line = parts
                .into_inner()
                .into_iter()
                .map(|part| part.0)
                .collect::<Vec<_>>()
                .join(" ");

            let mut wrapper = {
                let ids = current.borrow();
                RpcWrapper {
                    function_name: LOG_FUNCTION_NAME.to_string(),
                    request_id: ids.request_id.clone(),
                    request_uuid: ids.request_uuid.clone(),
                    io: FunctionBindingIo {
                        input: Some(Payload::StrList(vec![severity.to_string(), line])),
                        output: None,
                        errors: Vec::new(),
                    },
                }
            };

            if let Err(err) = invoker.invoke(&mut wrapper) {
                tracing::trace!(%err, "dropping console record, callback channel unavailable");
            }
        })
    }
}

fn build_runtime(
    options: &EngineOptions,
    interrupt: &Arc<AtomicBool>,
) -> Result<Runtime, WireError> {
    let runtime = Runtime::new().map_err(internal)?;
    if options.maximum_heap_mb > 0 {
        runtime.set_memory_limit(options.maximum_heap_mb as usize * MIB);
    }
    if options.initial_heap_mb > 0 {
        runtime.set_gc_threshold(options.initial_heap_mb as usize * MIB);
    }
    let flag = Arc::clone(interrupt);
    runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::SeqCst))));
    Ok(runtime)
}

/// Evaluate a cached code version in the given context. Source runs as
/// global code; byte-code loads as a module.
fn evaluate(ctx: &Ctx<'_>, version: &CodeVersion) -> Result<(), WireError> {
    if let Some(bytecode) = &version.bytecode {
        // SAFETY: the byte-code was produced by the same engine version on
        // the host side; loading unrelated bytes fails rather than executing.
        let module = unsafe { rquickjs::Module::load(ctx.clone(), bytecode) }
            .catch(ctx)
            .map_err(compile_err)?;
        let (module, promise) = module.eval().catch(ctx).map_err(compile_err)?;
        promise.finish::<()>().catch(ctx).map_err(compile_err)?;

        // Re-export the module's functions as globals so handler lookup is
        // uniform across source and byte-code versions.
        let globals = ctx.globals();
        for entry in module.namespace().catch(ctx).map_err(compile_err)?.props::<String, Value>() {
            let (name, value) = entry.catch(ctx).map_err(compile_err)?;
            globals.set(name.as_str(), value).catch(ctx).map_err(compile_err)?;
        }
        return Ok(());
    }

    ctx.eval::<(), _>(version.js.clone())
        .catch(ctx)
        .map_err(compile_err)
}

fn lookup_handler<'js>(ctx: &Ctx<'js>, name: &str) -> Option<Function<'js>> {
    ctx.globals().get::<_, Function>(name).ok()
}

fn compile_err(err: CaughtError<'_>) -> WireError {
    WireError::new(WireErrorKind::Compile, describe_caught(err))
}

fn internal(err: impl std::fmt::Display) -> WireError {
    WireError::new(WireErrorKind::Internal, err.to_string())
}

fn engine_lost() -> WireError {
    WireError::new(
        WireErrorKind::Fatal,
        "the isolate was lost and could not be recreated",
    )
}

fn is_oom(err: &CaughtError<'_>) -> bool {
    match err {
        CaughtError::Error(rquickjs::Error::Allocation) => true,
        CaughtError::Exception(exception) => exception
            .message()
            .is_some_and(|message| message.contains("out of memory")),
        CaughtError::Value(value) => format!("{value:?}").contains("out of memory"),
        _ => false,
    }
}

fn describe_caught(err: CaughtError<'_>) -> String {
    match err {
        CaughtError::Exception(exception) => {
            let message = exception
                .message()
                .unwrap_or_else(|| "unknown exception".to_string());
            match exception.stack() {
                Some(stack) if !stack.is_empty() => format!("{message}\n{stack}"),
                _ => message,
            }
        }
        CaughtError::Value(value) => format!("exception value: {value:?}"),
        CaughtError::Error(error) => error.to_string(),
    }
}

/// Pins the closure's higher-ranked signature so the returned `Value`
/// borrows from the `Ctx` argument rather than being inferred independent
/// of it.
fn coerce_fn_signature<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

trait ThrowMessageExt {
    fn throw_message(&self, message: &str) -> rquickjs::Error;
}

impl ThrowMessageExt for Ctx<'_> {
    fn throw_message(&self, message: &str) -> rquickjs::Error {
        Exception::throw_message(self, message)
    }
}
