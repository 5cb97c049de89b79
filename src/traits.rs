//! Capability traits the adapter manager operates through.
//!
//! A model either implements these interfaces or the manager cannot touch
//! it; there is no runtime probing for optional attributes. The crate ships
//! one concrete implementation ([`crate::model::VideoTransformer`]), but the
//! manager functions are generic over any [`AdapterModel`].

use std::collections::HashMap;

use crate::error::Result;
use crate::io::StateDict;
use crate::scale::{BlockCounts, LayerScales, ScaleState};

/// Layer-level capability: per-adapter scale access and state cleanup.
///
/// Implemented by layers that carry adapter sub-state. Layers without scale
/// storage return `None` and are skipped by scaling walks.
pub trait AdapterScalable {
    /// The layer's scale storage, if it has one.
    fn scale_state(&self) -> Option<&ScaleState>;

    /// Mutable access to the layer's scale storage, if it has one.
    fn scale_state_mut(&mut self) -> Option<&mut ScaleState>;

    /// Wipe all per-adapter containers: low-rank down/up matrices and scale
    /// state. Used by unload as a sweep behind deregistration.
    fn clear_adapter_state(&mut self);
}

/// Model-level interface consumed by the adapter manager.
pub trait AdapterModel {
    /// Fixed architecture name used to look up the scale expansion.
    fn architecture(&self) -> &str;

    /// Block counts used by per-block scale expansion.
    fn block_counts(&self) -> BlockCounts;

    /// Register a converted state dict as a named adapter.
    ///
    /// # Errors
    /// Returns an error if the name is taken or a tensor cannot be routed to
    /// a module.
    fn register_adapter(
        &mut self,
        name: &str,
        state_dict: StateDict,
        network_alphas: Option<HashMap<String, f64>>,
    ) -> Result<()>;

    /// Remove the given adapters from every layer and the registry. Unknown
    /// names are ignored.
    fn deregister_adapters(&mut self, names: &[String]);

    /// Names of all registered adapters.
    fn adapter_names(&self) -> Vec<String>;

    /// Names of the currently active adapters.
    fn active_adapters(&self) -> Vec<String>;

    /// Clear the active-adapter set without deregistering anything.
    fn clear_active_adapters(&mut self);

    /// Write per-layer scales for the given adapters and mark them as the
    /// active set. `names` and `scales` are aligned by position.
    ///
    /// # Errors
    /// Returns an error if any name is not registered; nothing is mutated in
    /// that case.
    fn set_weights_and_activate(&mut self, names: &[String], scales: &[LayerScales])
        -> Result<()>;

    /// The layers exposing the [`AdapterScalable`] capability.
    fn scalable_layers_mut(&mut self) -> Vec<&mut dyn AdapterScalable>;
}
