//! Extra-op dispatch for the CPU backend.
//!
//! Providers ("extra buffer types") offer alternate execution strategies for specific operation
//! signatures. The CPU backend consults the frozen [`ExtraOpRegistry`] for every node before its
//! generic evaluator: the first registered provider whose `supports_op` accepts the node wins.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::buffer::GraphTensors;
use crate::device::Device;
use crate::error::{BackendError, BackendResult};
use crate::graph::{OpRef, OpSignature};

/// Per-node execution context handed to tensor traits.
pub struct ComputeParams<'a> {
    pub thread_index: usize,
    pub thread_count: usize,
    /// Scratch memory sized from the largest `work_size` reported for the graph.
    pub work: &'a mut [u8],
    pub tensors: &'a mut GraphTensors,
}

/// Alternate execution strategy for one operation signature.
pub trait TensorTraits: Send + Sync {
    /// Scratch bytes needed to run `op` across `thread_count` workers, or `None` when this
    /// strategy cannot size it (the generic evaluator's sizing applies instead).
    fn work_size(&self, thread_count: usize, op: &OpRef<'_>) -> Option<usize>;

    /// Runs `op`. `None` declines and lets the generic evaluator run it; `Some` means the node was
    /// handled, with any failure carried in the result.
    ///
    /// A declined node gets the evaluator's scratch even if this strategy sized it smaller.
    fn compute_forward(
        &self,
        params: &mut ComputeParams<'_>,
        op: &OpRef<'_>,
    ) -> Option<BackendResult<()>>;
}

/// Provider of tensor traits for the operations it claims.
///
/// Claiming an op through `supports_op` obliges `get_tensor_traits` to return traits for that
/// exact op; returning `None` afterwards is reported as [`BackendError::ProviderContract`].
pub trait ExtraBufferType: Send + Sync {
    fn name(&self) -> &str;

    fn supports_op(&self, device: &Device, op: &OpRef<'_>) -> bool;

    fn get_tensor_traits(&self, op: &OpRef<'_>) -> Option<Arc<dyn TensorTraits>>;
}

/// How the registry treats two providers that both claim one operation signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Earlier registration wins; each overlapping signature is logged once.
    #[default]
    FirstWins,
    /// Overlaps fail dispatch with [`BackendError::ProviderOverlap`].
    Reject,
}

impl FromStr for OverlapPolicy {
    type Err = BackendError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "first-wins" | "first_wins" | "first" => Ok(OverlapPolicy::FirstWins),
            "reject" => Ok(OverlapPolicy::Reject),
            other => Err(BackendError::execution(format!(
                "unknown overlap policy {other:?} (expected first-wins or reject)"
            ))),
        }
    }
}

/// Collects providers during start-up; `build` freezes them into an immutable registry.
#[derive(Default)]
pub struct ExtraOpRegistryBuilder {
    providers: Vec<Arc<dyn ExtraBufferType>>,
    policy: OverlapPolicy,
}

impl ExtraOpRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: OverlapPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Appends a provider at the lowest priority. Provider names must be unique.
    pub fn register(&mut self, provider: Arc<dyn ExtraBufferType>) -> BackendResult<&mut Self> {
        if self
            .providers
            .iter()
            .any(|existing| existing.name() == provider.name())
        {
            return Err(BackendError::DuplicateProvider(provider.name().to_string()));
        }
        tracing::debug!(
            provider = provider.name(),
            priority = self.providers.len(),
            "registered cpu extra buffer type"
        );
        self.providers.push(provider);
        Ok(self)
    }

    pub fn build(self) -> Arc<ExtraOpRegistry> {
        Arc::new(ExtraOpRegistry {
            providers: self.providers,
            policy: self.policy,
            reported_overlaps: Mutex::new(HashSet::new()),
        })
    }
}

/// Traits selected for one node, tagged with the provider that supplied them.
#[derive(Clone)]
pub struct ResolvedTraits {
    pub provider: String,
    pub traits: Arc<dyn TensorTraits>,
}

impl fmt::Debug for ResolvedTraits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTraits")
            .field("provider", &self.provider)
            .finish()
    }
}

/// Immutable, priority-ordered provider list shared by CPU backends.
pub struct ExtraOpRegistry {
    providers: Vec<Arc<dyn ExtraBufferType>>,
    policy: OverlapPolicy,
    // Only touched when an overlap is found.
    reported_overlaps: Mutex<HashSet<OpSignature>>,
}

impl ExtraOpRegistry {
    pub fn builder() -> ExtraOpRegistryBuilder {
        ExtraOpRegistryBuilder::new()
    }

    pub fn empty() -> Arc<Self> {
        ExtraOpRegistryBuilder::new().build()
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Finds the provider responsible for `op`, if any.
    pub fn resolve(
        &self,
        device: &Device,
        op: &OpRef<'_>,
    ) -> BackendResult<Option<ResolvedTraits>> {
        let mut claimants = self
            .providers
            .iter()
            .filter(|provider| provider.supports_op(device, op));
        let Some(winner) = claimants.next() else {
            return Ok(None);
        };
        if let Some(runner_up) = claimants.next() {
            self.handle_overlap(winner.as_ref(), runner_up.as_ref(), op)?;
        }
        let traits = winner
            .get_tensor_traits(op)
            .ok_or_else(|| BackendError::ProviderContract {
                provider: winner.name().to_string(),
                op: op.signature().to_string(),
            })?;
        Ok(Some(ResolvedTraits {
            provider: winner.name().to_string(),
            traits,
        }))
    }

    /// Scratch size requested by the responsible provider; `Ok(None)` leaves sizing to the
    /// generic evaluator.
    pub fn work_size(
        &self,
        device: &Device,
        thread_count: usize,
        op: &OpRef<'_>,
    ) -> BackendResult<Option<usize>> {
        Ok(self
            .resolve(device, op)?
            .and_then(|resolved| resolved.traits.work_size(thread_count, op)))
    }

    /// Runs `op` through the responsible provider. `None` means no provider handled it.
    pub fn compute_forward(
        &self,
        device: &Device,
        params: &mut ComputeParams<'_>,
        op: &OpRef<'_>,
    ) -> Option<BackendResult<()>> {
        match self.resolve(device, op) {
            Ok(Some(resolved)) => resolved.traits.compute_forward(params, op),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }

    fn handle_overlap(
        &self,
        winner: &dyn ExtraBufferType,
        runner_up: &dyn ExtraBufferType,
        op: &OpRef<'_>,
    ) -> BackendResult<()> {
        let signature = op.signature();
        match self.policy {
            OverlapPolicy::Reject => Err(BackendError::ProviderOverlap {
                first: winner.name().to_string(),
                second: runner_up.name().to_string(),
                op: signature.to_string(),
            }),
            OverlapPolicy::FirstWins => {
                let mut reported = self
                    .reported_overlaps
                    .lock()
                    .expect("overlap report set poisoned");
                if reported.insert(signature.clone()) {
                    tracing::warn!(
                        winner = winner.name(),
                        shadowed = runner_up.name(),
                        op = %signature,
                        "extra buffer types overlap; earlier registration wins"
                    );
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for ExtraOpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtraOpRegistry")
            .field("providers", &self.provider_names())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::graph::{DType, GraphBuilder, OpKind, TensorDesc};

    struct Claims(&'static str);

    struct NoWork;

    impl TensorTraits for NoWork {
        fn work_size(&self, _thread_count: usize, _op: &OpRef<'_>) -> Option<usize> {
            Some(0)
        }

        fn compute_forward(
            &self,
            _params: &mut ComputeParams<'_>,
            _op: &OpRef<'_>,
        ) -> Option<BackendResult<()>> {
            None
        }
    }

    impl ExtraBufferType for Claims {
        fn name(&self) -> &str {
            self.0
        }

        fn supports_op(&self, _device: &Device, op: &OpRef<'_>) -> bool {
            op.kind() == OpKind::Add
        }

        fn get_tensor_traits(&self, _op: &OpRef<'_>) -> Option<Arc<dyn TensorTraits>> {
            Some(Arc::new(NoWork))
        }
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("first-wins".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::FirstWins);
        assert_eq!(" Reject ".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Reject);
        assert!("latest".parse::<OverlapPolicy>().is_err());
    }

    #[test]
    fn overlaps_resolve_to_the_first_provider_and_are_reported_once() {
        let mut builder = ExtraOpRegistry::builder();
        builder
            .register(Arc::new(Claims("A")))
            .unwrap()
            .register(Arc::new(Claims("B")))
            .unwrap();
        let registry = builder.build();

        let mut graph = GraphBuilder::new();
        let a = graph.input(TensorDesc::new("a", DType::F32, [2]));
        graph.add(a, a).unwrap();
        let graph = graph.finish();

        for _ in 0..3 {
            let resolved = registry
                .resolve(&Device::cpu(), &graph.op(0))
                .unwrap()
                .unwrap();
            assert_eq!(resolved.provider, "A");
        }
        assert_eq!(registry.reported_overlaps.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_registry_declines_everything() {
        let registry = ExtraOpRegistry::empty();
        let mut graph = GraphBuilder::new();
        let a = graph.input(TensorDesc::new("a", DType::F32, [2]));
        graph.copy(a).unwrap();
        let graph = graph.finish();
        assert!(registry.is_empty());
        assert!(registry
            .work_size(&Device::cpu(), 1, &graph.op(0))
            .unwrap()
            .is_none());
    }
}
