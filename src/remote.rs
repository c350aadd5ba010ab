//! Typed handle for calling a bound function.

use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::backend::{self, Backend};
use crate::binding::{BindOptions, FunctionBinding};
use crate::config::Config;
use crate::error::{RemoteError, Result};
use crate::protocol::in_execution_mode;
use crate::provision::{EnvironmentHandle, ProvisioningCache};
use crate::schema::Model;
use crate::session;

type LocalFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

/// A function that runs in a remote environment, called with typed values.
///
/// Cloning is cheap; clones share the backend and the provisioning cache.
pub struct RemoteFunction<I, O> {
    binding: FunctionBinding,
    backend: Arc<dyn Backend>,
    cache: Arc<ProvisioningCache>,
    local: Option<LocalFn<I, O>>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for RemoteFunction<I, O> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            backend: Arc::clone(&self.backend),
            cache: Arc::clone(&self.cache),
            local: self.local.clone(),
            _types: PhantomData,
        }
    }
}

impl<I: Model, O: Model> RemoteFunction<I, O> {
    /// Binds `name` with explicit options, using the process-wide cache.
    #[track_caller]
    pub fn bind(name: &str, options: BindOptions) -> Result<Self> {
        let binding = FunctionBinding::bind_models::<I, O>(name, options)?;
        let backend = backend::from_config(binding.backend(), binding.project_root());
        Ok(Self::from_parts(binding, backend, ProvisioningCache::global()))
    }

    /// Binds `name` with the backend and timeout from the project's
    /// `remotefn.toml`.
    #[track_caller]
    pub fn from_project(name: &str, project_root: &Path) -> Result<Self> {
        let config = Config::load(project_root)?;
        let (backend, timeout_millis) = config.for_function(name);
        Self::bind(
            name,
            BindOptions::new(project_root)
                .backend(backend)
                .timeout_millis(timeout_millis),
        )
    }

    /// Assembles a handle from an existing binding and backend.
    pub fn from_parts(binding: FunctionBinding, backend: Arc<dyn Backend>, cache: Arc<ProvisioningCache>) -> Self {
        Self {
            binding,
            backend,
            cache,
            local: None,
            _types: PhantomData,
        }
    }

    /// Uses a private provisioning cache instead of the process-wide one.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ProvisioningCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Attaches the function body.
    ///
    /// Inside a shim process the body is called directly, so a function
    /// calling another bound function does not dispatch a second time.
    #[must_use]
    pub fn with_local<F, Fut>(mut self, function: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.local = Some(Arc::new(move |input| function(input).boxed()));
        self
    }

    /// The underlying binding.
    pub fn binding(&self) -> &FunctionBinding {
        &self.binding
    }

    /// Provisions the environment ahead of the first call.
    pub async fn warm_up(&self) -> Result<EnvironmentHandle> {
        session::warm_up(&self.binding, self.backend.as_ref(), &self.cache).await
    }

    /// Calls the function with `input` and returns its validated output.
    pub async fn call(&self, input: &I) -> Result<O> {
        self.call_in(input, in_execution_mode()).await
    }

    async fn call_in(&self, input: &I, execution_mode: bool) -> Result<O> {
        let value = self.binding.encode(input)?;

        if execution_mode {
            if let Some(local) = &self.local {
                debug!("Already in execution mode; calling '{}' directly", self.binding.name());
                let input = serde_json::from_value(value).map_err(|e| {
                    RemoteError::validation("$", format!("input cannot be decoded: {e}"))
                })?;
                return local(input).await;
            }
        }

        let output = session::call(&self.binding, value, self.backend.as_ref(), &self.cache).await?;
        self.binding.decode(output)
    }
}
