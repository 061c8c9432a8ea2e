//! # Action Hooks
//!
//! Named extension points plugins can attach callbacks to. Callbacks of a
//! hook run by ascending priority; equal priorities keep registration order.

use serde_json::Value;
use std::collections::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Priority used by [`Hooks::add`]
pub const DEFAULT_PRIORITY: i32 = 10;

/// Hook callback
pub type HookCallback = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

struct Registered {
    priority: i32,
    callback: HookCallback,
}

/// Hook registry
#[derive(Default)]
pub struct Hooks {
    actions: RwLock<HashMap<String, Vec<Registered>>>,
}

impl Hooks {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a callback to `hook`
    pub fn add_action<F>(&self, hook: &str, priority: i32, callback: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let mut actions = self.actions.write();
        let list = actions.entry(hook.to_string()).or_default();
        list.push(Registered {
            priority,
            callback: Arc::new(callback),
        });
        // stable: ties keep insertion order
        list.sort_by_key(|r| r.priority);
    }

    /// Attach a callback with the default priority
    pub fn add<F>(&self, hook: &str, callback: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.add_action(hook, DEFAULT_PRIORITY, callback);
    }

    /// Run every callback of `hook`, collecting their return values
    pub fn do_action(&self, hook: &str, args: &[Value]) -> Vec<Value> {
        let callbacks: Vec<HookCallback> = {
            let actions = self.actions.read();
            actions
                .get(hook)
                .map(|list| list.iter().map(|r| Arc::clone(&r.callback)).collect())
                .unwrap_or_default()
        };
        debug!(hook, callbacks = callbacks.len(), "Running hook");
        callbacks.iter().map(|cb| cb(args)).collect()
    }

    /// Whether anything is attached to `hook`
    #[must_use]
    pub fn has_action(&self, hook: &str) -> bool {
        self.actions
            .read()
            .get(hook)
            .is_some_and(|list| !list.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_order_and_ties() {
        let hooks = Hooks::new();
        hooks.add_action("init", 20, |_| json!("late"));
        hooks.add_action("init", 5, |_| json!("early"));
        hooks.add("init", |_| json!("first-default"));
        hooks.add("init", |_| json!("second-default"));

        assert_eq!(
            hooks.do_action("init", &[]),
            vec![
                json!("early"),
                json!("first-default"),
                json!("second-default"),
                json!("late")
            ]
        );
    }

    #[test]
    fn test_arguments_passed_through() {
        let hooks = Hooks::new();
        hooks.add("title", |args| json!(format!("[{}]", args[0].as_str().unwrap_or(""))));
        assert_eq!(hooks.do_action("title", &[json!("Home")]), vec![json!("[Home]")]);
    }

    #[test]
    fn test_unknown_hook() {
        let hooks = Hooks::new();
        assert!(!hooks.has_action("missing"));
        assert!(hooks.do_action("missing", &[]).is_empty());
    }

    #[test]
    fn test_callback_may_register_hooks() {
        let hooks = Arc::new(Hooks::new());
        let inner = Arc::clone(&hooks);
        hooks.add("boot", move |_| {
            inner.add("ready", |_| json!(true));
            Value::Null
        });
        hooks.do_action("boot", &[]);
        assert!(hooks.has_action("ready"));
    }
}
