//! # Service Container
//!
//! Named bindings built by explicit factories. A factory receives a
//! [`Resolver`] through which it asks for each of its constructor inputs:
//! an explicit parameter passed to [`Container::make_with`], another
//! binding, or a default.
//!
//! Shared bindings are built once and cached. Resolution keeps a stack of
//! the bindings being built so that a cycle fails with
//! `CircularDependency` instead of recursing forever.

use crate::error::{Error, Result};
use std::any::{type_name, Any};
use std::collections::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

type Shared = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&mut Resolver<'_>) -> Result<Shared> + Send + Sync>;

struct Binding {
    factory: Factory,
    shared: bool,
}

#[derive(Default)]
struct Registry {
    bindings: HashMap<String, Binding>,
    instances: HashMap<String, Shared>,
    aliases: HashMap<String, String>,
}

/// Explicit values handed to a factory, by parameter name
#[derive(Default, Clone)]
pub struct Params {
    values: HashMap<String, Shared>,
}

impl Params {
    /// No parameters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter
    #[must_use]
    pub fn with<T: Any + Send + Sync>(mut self, name: &str, value: T) -> Self {
        self.values.insert(name.to_string(), Arc::new(value));
        self
    }

    fn get(&self, name: &str) -> Option<&Shared> {
        self.values.get(name)
    }
}

/// Dependency container
#[derive(Default)]
pub struct Container {
    registry: RwLock<Registry>,
}

impl Container {
    /// Create an empty container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transient binding: the factory runs on every `make`
    pub fn bind<T, F>(&self, name: &str, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.bind_shared(name, factory, false);
    }

    /// Binding that is optionally cached after the first build
    pub fn bind_shared<T, F>(&self, name: &str, factory: F, shared: bool)
    where
        T: Any + Send + Sync,
        F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |resolver: &mut Resolver<'_>| {
            Ok(Arc::new(factory(resolver)?) as Shared)
        });
        let mut registry = self.registry.write();
        registry.instances.remove(name);
        registry
            .bindings
            .insert(name.to_string(), Binding { factory, shared });
    }

    /// Shared binding: built once, then reused
    pub fn singleton<T, F>(&self, name: &str, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&mut Resolver<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.bind_shared(name, factory, true);
    }

    /// Register an already built value
    pub fn instance<T: Any + Send + Sync>(&self, name: &str, value: Arc<T>) {
        let mut registry = self.registry.write();
        registry.instances.insert(name.to_string(), value);
    }

    /// Make `alias` resolve to `name`
    pub fn alias(&self, name: &str, alias: &str) {
        let mut registry = self.registry.write();
        registry.aliases.insert(alias.to_string(), name.to_string());
    }

    /// Whether a name (or alias) resolves to something
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        let registry = self.registry.read();
        let Ok(name) = canonical(&registry, name) else {
            return false;
        };
        registry.instances.contains_key(&name) || registry.bindings.contains_key(&name)
    }

    /// Resolve a binding
    ///
    /// # Errors
    ///
    /// `BindingNotFound`, `BindingType`, `CircularDependency`, or whatever
    /// the factory returns.
    pub fn make<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.make_with(name, &Params::new())
    }

    /// Resolve a binding with explicit factory parameters
    ///
    /// # Errors
    ///
    /// See [`Container::make`].
    pub fn make_with<T: Any + Send + Sync>(&self, name: &str, params: &Params) -> Result<Arc<T>> {
        let mut stack = Vec::new();
        let value = self.resolve(name, params, &mut stack)?;
        downcast(name, value)
    }

    fn resolve(&self, name: &str, params: &Params, stack: &mut Vec<String>) -> Result<Shared> {
        let (name, factory, shared) = {
            let registry = self.registry.read();
            let name = canonical(&registry, name)?;
            if let Some(instance) = registry.instances.get(&name) {
                return Ok(Arc::clone(instance));
            }
            let binding = registry
                .bindings
                .get(&name)
                .ok_or_else(|| Error::BindingNotFound { name: name.clone() })?;
            (name, Arc::clone(&binding.factory), binding.shared)
        };

        if stack.contains(&name) {
            let mut chain = stack.clone();
            chain.push(name);
            return Err(Error::CircularDependency {
                chain: chain.join(" -> "),
            });
        }

        stack.push(name.clone());
        let built = {
            let mut resolver = Resolver {
                container: self,
                binding: &name,
                params,
                stack: &mut *stack,
            };
            factory(&mut resolver)
        };
        stack.pop();
        let built = built?;

        if shared {
            debug!(binding = %name, "Caching shared instance");
            let mut registry = self.registry.write();
            let cached = registry.instances.entry(name).or_insert(built);
            return Ok(Arc::clone(cached));
        }
        Ok(built)
    }
}

fn canonical(registry: &Registry, name: &str) -> Result<String> {
    let mut current = name.to_string();
    let mut seen = vec![current.clone()];
    while let Some(target) = registry.aliases.get(&current) {
        if seen.contains(target) {
            seen.push(target.clone());
            return Err(Error::CircularDependency {
                chain: seen.join(" -> "),
            });
        }
        seen.push(target.clone());
        current.clone_from(target);
    }
    Ok(current)
}

fn downcast<T: Any + Send + Sync>(name: &str, value: Shared) -> Result<Arc<T>> {
    value.downcast::<T>().map_err(|_| Error::BindingType {
        name: name.to_string(),
        expected: type_name::<T>(),
    })
}

/// Inputs available to a factory while its binding is being built
pub struct Resolver<'a> {
    container: &'a Container,
    binding: &'a str,
    params: &'a Params,
    stack: &'a mut Vec<String>,
}

impl Resolver<'_> {
    /// Name of the binding being built
    #[must_use]
    pub const fn binding(&self) -> &str {
        self.binding
    }

    /// Explicit parameter, if one was passed
    #[must_use]
    pub fn param<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.params
            .get(name)
            .and_then(|v| Arc::clone(v).downcast::<T>().ok())
    }

    /// Explicit parameter `param`, else the container binding `binding`
    ///
    /// # Errors
    ///
    /// Propagates resolution errors of the nested binding.
    pub fn dependency<T: Any + Send + Sync>(&mut self, param: &str, binding: &str) -> Result<Arc<T>> {
        if let Some(value) = self.param::<T>(param) {
            return Ok(value);
        }
        let value = self.container.resolve(binding, &Params::new(), self.stack)?;
        downcast(binding, value)
    }

    /// Explicit parameter, else `default`
    #[must_use]
    pub fn value_or<T: Any + Send + Sync + Clone>(&self, name: &str, default: T) -> T {
        self.param::<T>(name).map_or(default, |v| (*v).clone())
    }

    /// Explicit parameter that has no default
    ///
    /// # Errors
    ///
    /// `UnresolvableDependency` when the parameter was not passed.
    pub fn required<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        self.param::<T>(name)
            .ok_or_else(|| Error::UnresolvableDependency {
                binding: self.binding.to_string(),
                parameter: name.to_string(),
            })
    }
}
