//! The name→handler map for host function bindings.

use std::collections::HashMap;
use std::sync::Arc;

use roma_common::FunctionBindingIo;

/// A host function callable from the guest.
///
/// Handlers receive the callback's io record (read the input, write the
/// output or append errors) and a shared reference to the invoking
/// request's metadata. A non-ok return surfaces to the guest as a thrown
/// exception.
pub type BindingHandler<M> =
    Arc<dyn Fn(&mut FunctionBindingIo, &M) -> anyhow::Result<()> + Send + Sync>;

/// One registered binding: the guest-visible name plus its handler.
#[derive(Clone)]
pub struct FunctionBinding<M> {
    /// Name the guest calls.
    pub name: String,
    /// The host handler.
    pub handler: BindingHandler<M>,
}

impl<M> std::fmt::Debug for FunctionBinding<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionBinding")
            .field("name", &self.name)
            .finish()
    }
}

/// Why a table call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableCallError {
    /// No binding is registered under the requested name.
    UnknownName,
    /// The handler ran and returned an error.
    HandlerFailure,
}

/// Immutable name→handler map, populated once at startup.
pub struct NativeFunctionTable<M> {
    functions: HashMap<String, BindingHandler<M>>,
}

impl<M> NativeFunctionTable<M> {
    /// Build the table from the host's registrations. Later registrations
    /// of a duplicate name win, matching registration order semantics of a
    /// plain map.
    pub fn new(bindings: Vec<FunctionBinding<M>>) -> Self {
        let mut functions = HashMap::with_capacity(bindings.len());
        for binding in bindings {
            functions.insert(binding.name, binding.handler);
        }
        Self { functions }
    }

    /// The registered names, for installing guest-side stubs.
    pub fn names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }

    /// Invoke the handler registered under `name`.
    pub fn call(
        &self,
        name: &str,
        io: &mut FunctionBindingIo,
        metadata: &M,
    ) -> Result<(), TableCallError> {
        let handler = self.functions.get(name).ok_or(TableCallError::UnknownName)?;
        handler(io, metadata).map_err(|err| {
            tracing::debug!(function = name, %err, "function binding handler failed");
            TableCallError::HandlerFailure
        })
    }
}

impl<M> Default for NativeFunctionTable<M> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
