//! Named agent constructors, so agents can be launched by kind.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::agent::Agent;
use crate::error::{KernelError, KernelResult};

type Constructor = Box<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

#[derive(Default)]
pub struct AgentFactory {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl AgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `kind`. Returns true if an earlier registration was
    /// replaced.
    pub fn register<A, F>(&self, kind: impl Into<String>, constructor: F) -> bool
    where
        A: Agent,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let constructor: Constructor = Box::new(move || -> Box<dyn Agent> { Box::new(constructor()) });
        self.constructors
            .write()
            .insert(kind.into(), constructor)
            .is_some()
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.constructors.write().remove(kind).is_some()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.read().contains_key(kind)
    }

    pub fn create(&self, kind: &str) -> KernelResult<Box<dyn Agent>> {
        let constructors = self.constructors.read();
        let constructor = constructors
            .get(kind)
            .ok_or_else(|| KernelError::UnknownAgentKind(kind.to_string()))?;
        Ok(constructor())
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl std::fmt::Debug for AgentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentFactory")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{from_fn, AgentContext};

    struct Idle;

    impl Agent for Idle {
        fn activate(&mut self, _ctx: &AgentContext) -> KernelResult<()> {
            Ok(())
        }
    }

    #[test]
    fn kinds_are_registered_and_replaced() {
        let factory = AgentFactory::new();
        assert!(!factory.register("idle", || Idle));
        assert!(factory.register("idle", || from_fn(|_ctx: &AgentContext| Ok(()))));
        assert!(factory.register("idle", || Idle));
        factory.register("another", || Idle);
        assert_eq!(factory.kinds(), vec!["another".to_string(), "idle".to_string()]);
        assert!(factory.create("idle").is_ok());
        assert!(factory.unregister("another"));
        assert!(!factory.contains("another"));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let factory = AgentFactory::new();
        assert!(matches!(
            factory.create("ghost"),
            Err(KernelError::UnknownAgentKind(kind)) if kind == "ghost"
        ));
    }
}
